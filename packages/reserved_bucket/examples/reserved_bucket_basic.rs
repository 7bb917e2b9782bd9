//! Basic usage example for `ReservedTable`.
//!
//! This example stores vectors under the reserved sentinel keys, accumulates onto them from
//! several threads and exports the result.

use reserved_bucket::dispatch::{Command, launch};
use reserved_bucket::{
    EMPTY_KEY, LOCKED_KEY, RECLAIM_KEY, RESERVED_KEYS, ReservedTable, is_reserved_key,
};

fn main() {
    let table = ReservedTable::<f32>::builder()
        .dimension(4)
        .build()
        .expect("the system allocator can provide a small block");

    println!(
        "Created reserved table with {} slots of dimension {} ({} bytes)",
        table.capacity(),
        table.dimension(),
        table.memory_bytes()
    );

    for key in [EMPTY_KEY, 42] {
        println!("Key {key:#x} is reserved: {}", is_reserved_key(key));
    }

    table.write_vector(EMPTY_KEY, &[1.0, 2.0, 3.0, 4.0]);
    table.accum_or_assign(RECLAIM_KEY, false, &[0.5; 4]);

    let ones = [1.0; 4];
    let commands = RESERVED_KEYS
        .into_iter()
        .cycle()
        .take(400)
        .map(|key| Command::AccumOrAssign {
            key,
            is_accum: true,
            values: &ones,
        })
        .collect::<Vec<_>>();

    launch(&table, &commands);

    println!("Table holds {} entries", table.size());

    if let Some(values) = table.find(LOCKED_KEY) {
        println!("LOCKED_KEY: {values:?}");
    }

    let mut keys = [0; 4];
    let mut values = [0.0; 16];
    let count = table.export_batch(4, 0, &mut keys, &mut values);

    for (key, vector) in keys.iter().zip(values.chunks_exact(4)).take(count) {
        println!("Exported {key:#x}: {vector:?}");
    }
}
