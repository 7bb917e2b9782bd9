//! Thread safety integration tests for `reserved_bucket`.
//!
//! These tests drive one table from many threads at once, both directly and through the
//! dispatch module, and verify that no update is lost.

use std::sync::{Arc, Barrier};
use std::thread;

use new_zealand::nz;
use reserved_bucket::dispatch::{Command, Outcome, launch, launch_with};
use reserved_bucket::{EMPTY_KEY, LOCKED_KEY, RECLAIM_KEY, RESERVED_KEYS, ReservedTable};

const THREADS: u64 = 8;
const ITERATIONS: u64 = 1000;

#[test]
fn table_can_be_moved_between_threads() {
    let table = ReservedTable::<u64>::builder().dimension(2).build().unwrap();
    table.write_vector(EMPTY_KEY, &[1, 2]);

    let handle = thread::spawn(move || {
        table.accum_or_assign(EMPTY_KEY, true, &[10, 20]);
        table
    });

    let table = handle.join().unwrap();
    assert_eq!(*table.get_vector(EMPTY_KEY), [11, 22]);
}

#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn concurrent_accumulation_on_one_key_is_exact() {
    let table = Arc::new(ReservedTable::<u64>::builder().dimension(4).build().unwrap());
    let barrier = Arc::new(Barrier::new(usize::try_from(THREADS).unwrap()));

    let handles = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for _ in 0..ITERATIONS {
                    table.accum_or_assign(LOCKED_KEY, true, &[1, 2, 3, 4]);
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS * ITERATIONS;
    assert_eq!(
        *table.get_vector(LOCKED_KEY),
        [total, total * 2, total * 3, total * 4]
    );
}

#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn concurrent_writers_never_tear_vectors() {
    let table = ReservedTable::<u64>::builder().dimension(16).build().unwrap();

    thread::scope(|scope| {
        for writer in 0..THREADS {
            let table = &table;
            scope.spawn(move || {
                for _ in 0..ITERATIONS {
                    table.write_vector(RECLAIM_KEY, &[writer; 16]);
                }
            });
        }

        let table = &table;
        scope.spawn(move || {
            for _ in 0..ITERATIONS {
                if let Some(values) = table.find(RECLAIM_KEY) {
                    let first = values[0];
                    assert!(values.iter().all(|&value| value == first));
                }
            }
        });
    });

    assert!(table.contains(RECLAIM_KEY));
}

#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn launched_batch_updates_every_reserved_key() {
    let table = ReservedTable::<i64>::builder().dimension(3).build().unwrap();
    let ones = [1, 1, 1];

    let commands = RESERVED_KEYS
        .into_iter()
        .cycle()
        .take(4000)
        .map(|key| Command::AccumOrAssign {
            key,
            is_accum: true,
            values: &ones,
        })
        .collect::<Vec<_>>();

    let outcomes = launch(&table, &commands);
    assert_eq!(outcomes.len(), commands.len());

    let finds = RESERVED_KEYS
        .into_iter()
        .map(|key| Command::Find { key })
        .collect::<Vec<_>>();

    let outcomes = launch_with(&table, &finds, nz!(16));
    assert_eq!(outcomes, vec![Outcome::Found(Some(vec![1000; 3])); 4]);
}

#[test]
#[cfg_attr(miri, ignore)] // Too slow under Miri.
fn launched_find_or_insert_inserts_exactly_once() {
    let table = ReservedTable::<u32>::builder().dimension(1).build().unwrap();
    let values = [9];

    let commands = vec![
        Command::FindOrInsert {
            key: EMPTY_KEY,
            values: &values,
        };
        256
    ];

    let outcomes = launch_with(&table, &commands, nz!(8));

    let inserted = outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome,
                Outcome::FindOrInsert {
                    was_present: false,
                    ..
                }
            )
        })
        .count();

    assert_eq!(inserted, 1);
    assert_eq!(table.size(), 1);
}
