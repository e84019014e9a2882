//! Fuzz target for owned store bookkeeping.
//!
//! Drives an arbitrary sequence of puts and deletes and checks that the
//! version advances once per call and that a fresh catch-up reproduces the
//! live set.

#![no_main]

use libfuzzer_sys::fuzz_target;
use versioned_replication::{OwnedStore, Record, Reference};

fuzz_target!(|ops: Vec<(u8, u8)>| {
    let mut store = OwnedStore::<Record>::new();

    for (i, (op, id)) in ops.iter().enumerate() {
        let record = Record::new("fuzz", (id % 16).to_string());
        match op % 3 {
            0 => {
                store.put(record);
            }
            1 => {
                store.delete(&record);
            }
            _ => {
                store.put_many([record.clone(), record.with("dup", true)]);
            }
        }
        assert_eq!(store.get_version(), i as u64 + 1);
    }

    let changes = store.get_changes(0);
    assert_eq!(changes.version, store.get_version());
    assert_eq!(changes.update, store.get_all(0));
    for deleted in &changes.delete {
        assert!(store.get_one(&deleted.key()).is_none());
    }
});
