//! Small end-to-end tour: create a container, fill an index, reopen it.

use cask_engine::{Key, KeyKind, Storage, StorageResult, Value};

fn main() -> StorageResult<()> {
    let path = std::env::temp_dir().join("cask-address-book.db");
    let _ = std::fs::remove_file(&path);

    {
        let storage = Storage::open(&path)?;
        let by_name = storage.create_index(KeyKind::String)?;
        by_name.set(
            "alice",
            Value::record(vec![
                ("name", Value::String("Alice".into())),
                ("phone", Value::String("555-0100".into())),
            ]),
        )?;
        by_name.set(
            "bob",
            Value::record(vec![
                ("name", Value::String("Bob".into())),
                ("phone", Value::String("555-0101".into())),
            ]),
        )?;

        storage.set_root(Value::record(vec![
            ("version", Value::Int(1)),
            ("contacts", Value::Index(by_name)),
        ]))?;
        storage.close()?;
    }

    let storage = Storage::open(&path)?;
    let root = match storage.root()? {
        Value::Record(rec) => rec,
        other => panic!("unexpected root: {}", other),
    };
    let contacts = match root.get("contacts") {
        Some(Value::Index(index)) => index,
        other => panic!("unexpected contacts slot: {:?}", other),
    };

    println!("{} contacts", contacts.len()?);
    for contact in contacts.select(Key::from("alice"), None)? {
        println!("{}", contact?);
    }

    storage.close()
}
