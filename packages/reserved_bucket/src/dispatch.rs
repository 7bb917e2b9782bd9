//! Batched execution of table operations across many concurrent execution contexts.
//!
//! Each [`Command`] names one table operation and its arguments. [`execute()`] runs a single
//! command against a table and returns its result as an owned [`Outcome`], copied out of the
//! table's memory. [`launch()`] and [`launch_with()`] distribute a batch of commands over a set
//! of execution contexts (threads), wait until every context has finished and return the
//! outcomes in command order.
//!
//! Commands in one batch run concurrently and in no particular order. Commands on different
//! slots never observe each other; commands on the same slot are serialized by the slot lock,
//! in an unspecified order.
//!
//! [`ReservedTable::clear()`] is not available as a command because it must not overlap with
//! any other operation. Call it directly between launches.

use std::num::NonZero;
use std::panic;
use std::thread;

use new_zealand::nz;
use tracing::{debug, trace};

use crate::{Allocator, BucketValue, ReservedTable};

/// One table operation with its arguments.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum Command<'a, V> {
    /// Runs [`ReservedTable::contains()`], producing [`Outcome::Contains`].
    Contains {
        /// The key to look up.
        key: u64,
    },

    /// Copies the slot vector as seen by [`ReservedTable::get_vector()`], producing
    /// [`Outcome::Vector`].
    GetVector {
        /// The key whose slot to copy.
        key: u64,
    },

    /// Runs [`ReservedTable::write_vector()`], producing [`Outcome::Done`].
    WriteVector {
        /// The key whose slot to overwrite.
        key: u64,

        /// The new vector.
        values: &'a [V],
    },

    /// Runs [`ReservedTable::read_vector()`], producing [`Outcome::Vector`].
    ReadVector {
        /// The key whose slot to read.
        key: u64,
    },

    /// Runs [`ReservedTable::erase()`], producing [`Outcome::Done`].
    Erase {
        /// The key whose slot to erase.
        key: u64,
    },

    /// Runs [`ReservedTable::find()`], producing [`Outcome::Found`].
    Find {
        /// The key to look up.
        key: u64,
    },

    /// Runs [`ReservedTable::find_or_insert()`], producing [`Outcome::FindOrInsert`].
    FindOrInsert {
        /// The key to look up or insert.
        key: u64,

        /// The vector to store if the slot is absent.
        values: &'a [V],
    },

    /// Runs [`ReservedTable::accum_or_assign()`], producing [`Outcome::Done`].
    AccumOrAssign {
        /// The key whose slot to update.
        key: u64,

        /// Whether to add onto the stored vector instead of overwriting it.
        is_accum: bool,

        /// The vector to add or store.
        values: &'a [V],
    },

    /// Runs [`ReservedTable::insert_or_assign()`], producing [`Outcome::Updated`] with the
    /// slot's prior presence.
    InsertOrAssign {
        /// The key whose slot to overwrite.
        key: u64,

        /// The new vector.
        values: &'a [V],
    },

    /// Runs [`ReservedTable::assign()`], producing [`Outcome::Updated`] with whether the
    /// vector was overwritten.
    Assign {
        /// The key whose slot to overwrite if present.
        key: u64,

        /// The new vector.
        values: &'a [V],
    },

    /// Runs [`ReservedTable::export_batch()`] into freshly allocated buffers, producing
    /// [`Outcome::Exported`].
    ExportBatch {
        /// Maximum number of entries to export.
        max_n: usize,

        /// Slot index at which the scan starts.
        offset: usize,
    },

    /// Runs [`ReservedTable::size()`], producing [`Outcome::Size`].
    Size,
}

/// The result of executing one [`Command`], owned by the caller.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Outcome<V> {
    /// The operation has no result beyond its effect on the table.
    Done,

    /// Whether the slot holds a value.
    Contains(bool),

    /// A copy of the slot vector.
    Vector(Vec<V>),

    /// A copy of the slot vector if the slot holds a value.
    Found(Option<Vec<V>>),

    /// The outcome of a find-or-insert.
    FindOrInsert {
        /// Whether the slot already held a value.
        was_present: bool,

        /// A copy of the slot vector after the operation.
        values: Vec<V>,
    },

    /// The flag reported by an insert-or-assign or assign.
    Updated(bool),

    /// The exported entries, with `keys.len()` entries and `dimension` values per entry.
    Exported {
        /// The keys of the exported entries.
        keys: Vec<u64>,

        /// The vectors of the exported entries, concatenated.
        values: Vec<V>,
    },

    /// The number of present slots.
    Size(usize),
}

/// Executes one command against the table and returns its outcome.
///
/// This is the single entry point through which every command reaches the table. It calls
/// exactly one table operation.
///
/// # Panics
///
/// Panics if a vector argument does not match the table's dimension.
///
/// # Examples
///
/// ```
/// use reserved_bucket::dispatch::{Command, Outcome, execute};
/// use reserved_bucket::{EMPTY_KEY, ReservedTable};
///
/// let table = ReservedTable::<f32>::builder().dimension(2).build().unwrap();
///
/// let values = [1.0, 2.0];
/// execute(&table, &Command::WriteVector { key: EMPTY_KEY, values: &values });
///
/// assert_eq!(
///     execute(&table, &Command::Find { key: EMPTY_KEY }),
///     Outcome::Found(Some(vec![1.0, 2.0]))
/// );
/// ```
pub fn execute<V: BucketValue, A: Allocator>(
    table: &ReservedTable<V, A>,
    command: &Command<'_, V>,
) -> Outcome<V> {
    match *command {
        Command::Contains { key } => Outcome::Contains(table.contains(key)),
        Command::GetVector { key } => Outcome::Vector(table.get_vector(key).to_vec()),
        Command::WriteVector { key, values } => {
            table.write_vector(key, values);
            Outcome::Done
        }
        Command::ReadVector { key } => {
            let mut out = vec![V::ZERO; table.dimension()];
            table.read_vector(key, &mut out);
            Outcome::Vector(out)
        }
        Command::Erase { key } => {
            table.erase(key);
            Outcome::Done
        }
        Command::Find { key } => Outcome::Found(table.find(key).map(|values| values.to_vec())),
        Command::FindOrInsert { key, values } => {
            let (was_present, stored) = table.find_or_insert(key, values);
            Outcome::FindOrInsert {
                was_present,
                values: stored.to_vec(),
            }
        }
        Command::AccumOrAssign {
            key,
            is_accum,
            values,
        } => {
            table.accum_or_assign(key, is_accum, values);
            Outcome::Done
        }
        Command::InsertOrAssign { key, values } => {
            Outcome::Updated(table.insert_or_assign(key, values))
        }
        Command::Assign { key, values } => Outcome::Updated(table.assign(key, values)),
        Command::ExportBatch { max_n, offset } => export(table, max_n, offset),
        Command::Size => Outcome::Size(table.size()),
    }
}

fn export<V: BucketValue, A: Allocator>(
    table: &ReservedTable<V, A>,
    max_n: usize,
    offset: usize,
) -> Outcome<V> {
    // There is never anything to export beyond the capacity, so a larger max_n only costs
    // buffer space.
    let max_n = max_n.min(table.capacity());

    let mut keys = vec![0; max_n];
    // Cannot overflow because max_n * dimension values fit in the table's block.
    let mut values = vec![V::ZERO; max_n.wrapping_mul(table.dimension())];

    let count = table.export_batch(max_n, offset, &mut keys, &mut values);

    keys.truncate(count);
    values.truncate(count.wrapping_mul(table.dimension()));

    Outcome::Exported { keys, values }
}

/// Number of execution contexts used by [`launch()`] when the available parallelism cannot be
/// determined.
const FALLBACK_CONTEXTS: NonZero<usize> = nz!(4);

/// Executes a batch of commands using one execution context per available processor.
///
/// Returns once every command has completed, with one outcome per command in command order.
///
/// # Panics
///
/// Panics if any command panics. The panic is propagated after all contexts have stopped.
pub fn launch<V, A>(table: &ReservedTable<V, A>, commands: &[Command<'_, V>]) -> Vec<Outcome<V>>
where
    V: BucketValue,
    A: Allocator + Sync,
{
    let contexts = thread::available_parallelism().unwrap_or(FALLBACK_CONTEXTS);
    launch_with(table, commands, contexts)
}

/// Executes a batch of commands using up to `contexts` concurrent execution contexts.
///
/// Context `c` executes commands `c`, `c + contexts`, `c + 2 * contexts` and so on. The call
/// returns once every context has finished, with one outcome per command in command order.
///
/// # Panics
///
/// Panics if any command panics. The panic is propagated after all contexts have stopped.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use reserved_bucket::dispatch::{Command, Outcome, launch_with};
/// use reserved_bucket::{EMPTY_KEY, LOCKED_KEY, ReservedTable};
///
/// let table = ReservedTable::<u64>::builder().dimension(1).build().unwrap();
///
/// let one = [1];
/// let commands = vec![Command::AccumOrAssign { key: EMPTY_KEY, is_accum: true, values: &one }; 100];
/// launch_with(&table, &commands, nz!(8));
///
/// let outcomes = launch_with(
///     &table,
///     &[Command::Find { key: EMPTY_KEY }, Command::Contains { key: LOCKED_KEY }],
///     nz!(2),
/// );
///
/// assert_eq!(outcomes, [Outcome::Found(Some(vec![100])), Outcome::Contains(false)]);
/// ```
pub fn launch_with<V, A>(
    table: &ReservedTable<V, A>,
    commands: &[Command<'_, V>],
    contexts: NonZero<usize>,
) -> Vec<Outcome<V>>
where
    V: BucketValue,
    A: Allocator + Sync,
{
    if commands.is_empty() {
        return Vec::new();
    }

    // More contexts than commands would only start idle threads.
    let contexts = contexts.get().min(commands.len());

    debug!(commands = commands.len(), contexts, "launching reserved table commands");

    let mut outcomes: Vec<Option<Outcome<V>>> = vec![None; commands.len()];

    thread::scope(|scope| {
        let handles = (0..contexts)
            .map(|context| {
                thread::Builder::new()
                    .name(format!("reserved-bucket-{context}"))
                    .spawn_scoped(scope, move || {
                        let executed = commands
                            .iter()
                            .enumerate()
                            .skip(context)
                            .step_by(contexts)
                            .map(|(index, command)| (index, execute(table, command)))
                            .collect::<Vec<_>>();

                        trace!(context, executed = executed.len(), "execution context finished");

                        executed
                    })
                    .expect(
                        "failed to spawn execution context: thread spawning failure is not supported",
                    )
            })
            .collect::<Vec<_>>();

        // Joining every context is the synchronization point: after this, all effects of the
        // batch are visible and all outcomes are in host memory.
        for handle in handles {
            match handle.join() {
                Ok(executed) => {
                    for (index, outcome) in executed {
                        if let Some(slot) = outcomes.get_mut(index) {
                            *slot = Some(outcome);
                        }
                    }
                }
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    });

    outcomes
        .into_iter()
        .map(|outcome| outcome.expect("every command is executed by exactly one context"))
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{EMPTY_KEY, LOCKED_KEY, RECLAIM_KEY, RESERVED_KEY_MASK, RESERVED_KEYS};

    fn table() -> ReservedTable<i32> {
        ReservedTable::builder().dimension(3).build().unwrap()
    }

    #[test]
    fn execute_maps_each_command_to_its_operation() {
        let table = table();
        let values = [1, 2, 3];
        let other = [7, 7, 7];

        assert_eq!(
            execute(&table, &Command::Contains { key: EMPTY_KEY }),
            Outcome::Contains(false)
        );
        assert_eq!(
            execute(
                &table,
                &Command::WriteVector {
                    key: EMPTY_KEY,
                    values: &values
                }
            ),
            Outcome::Done
        );
        assert_eq!(
            execute(&table, &Command::ReadVector { key: EMPTY_KEY }),
            Outcome::Vector(vec![1, 2, 3])
        );
        assert_eq!(
            execute(&table, &Command::GetVector { key: LOCKED_KEY }),
            Outcome::Vector(vec![0, 0, 0])
        );
        assert_eq!(
            execute(
                &table,
                &Command::FindOrInsert {
                    key: EMPTY_KEY,
                    values: &other
                }
            ),
            Outcome::FindOrInsert {
                was_present: true,
                values: vec![1, 2, 3]
            }
        );
        assert_eq!(
            execute(
                &table,
                &Command::Assign {
                    key: LOCKED_KEY,
                    values: &other
                }
            ),
            Outcome::Updated(false)
        );
        assert_eq!(
            execute(
                &table,
                &Command::InsertOrAssign {
                    key: LOCKED_KEY,
                    values: &other
                }
            ),
            Outcome::Updated(false)
        );
        assert_eq!(
            execute(
                &table,
                &Command::AccumOrAssign {
                    key: LOCKED_KEY,
                    is_accum: true,
                    values: &values
                }
            ),
            Outcome::Done
        );
        assert_eq!(
            execute(&table, &Command::Find { key: LOCKED_KEY }),
            Outcome::Found(Some(vec![8, 9, 10]))
        );
        assert_eq!(execute(&table, &Command::Size), Outcome::Size(2));
        assert_eq!(
            execute(&table, &Command::Erase { key: LOCKED_KEY }),
            Outcome::Done
        );
        assert_eq!(
            execute(&table, &Command::Find { key: LOCKED_KEY }),
            Outcome::Found(None)
        );
    }

    #[test]
    fn export_command_trims_to_exported_count() {
        let table = table();
        table.write_vector(RECLAIM_KEY, &[4, 5, 6]);

        assert_eq!(
            execute(
                &table,
                &Command::ExportBatch {
                    max_n: 1000,
                    offset: 0
                }
            ),
            Outcome::Exported {
                keys: vec![RECLAIM_KEY],
                values: vec![4, 5, 6]
            }
        );
    }

    #[test]
    fn empty_launch_returns_nothing() {
        let table = table();
        assert!(launch(&table, &[]).is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn launch_returns_outcomes_in_command_order() {
        let table = table();
        let rows = [[1; 3], [2; 3], [3; 3], [4; 3]];

        let writes = RESERVED_KEYS
            .iter()
            .zip(&rows)
            .map(|(&key, values)| Command::WriteVector { key, values })
            .collect::<Vec<_>>();
        launch_with(&table, &writes, nz!(4));

        let reads = RESERVED_KEYS
            .iter()
            .map(|&key| Command::ReadVector { key })
            .collect::<Vec<_>>();
        let outcomes = launch_with(&table, &reads, nz!(3));

        let expected = rows
            .iter()
            .map(|row| Outcome::Vector(row.to_vec()))
            .collect::<Vec<_>>();
        assert_eq!(outcomes, expected);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn concurrent_accumulation_through_launch_is_exact() {
        let table = table();
        let ones = [1, 1, 1];

        let commands = [RESERVED_KEY_MASK, EMPTY_KEY]
            .into_iter()
            .cycle()
            .take(1000)
            .map(|key| Command::AccumOrAssign {
                key,
                is_accum: true,
                values: &ones,
            })
            .collect::<Vec<_>>();

        let outcomes = launch_with(&table, &commands, nz!(8));
        assert!(outcomes.iter().all(|outcome| *outcome == Outcome::Done));

        assert_eq!(*table.get_vector(RESERVED_KEY_MASK), [500; 3]);
        assert_eq!(*table.get_vector(EMPTY_KEY), [500; 3]);
        assert_eq!(table.size(), 2);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    #[should_panic]
    fn panicking_command_propagates() {
        let table = table();
        let wrong = [1, 2];

        launch_with(
            &table,
            &[
                Command::Size,
                Command::WriteVector {
                    key: EMPTY_KEY,
                    values: &wrong,
                },
            ],
            nz!(2),
        );
    }
}
