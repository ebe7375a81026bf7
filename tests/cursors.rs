//! Cursor stream scenarios: type scans, batch boundaries, EOF.

mod common;

use common::TestServer;
use tessera::TypeId;

#[test]
fn scan_of_exactly_one_batch_yields_all_ids_then_none() {
    let server = TestServer::start();
    const BATCH_SIZE: usize = 1024;

    let mut writer = server.connect();
    writer.begin().unwrap();
    let mut expected = Vec::with_capacity(BATCH_SIZE);
    for i in 0..BATCH_SIZE {
        expected.push(
            writer
                .create(TypeId::new(9), 0, format!("row {i}").as_bytes())
                .unwrap(),
        );
    }
    writer.commit().unwrap();

    let mut reader = server.connect();
    reader.begin().unwrap();
    let mut cursor = reader.table_scan(TypeId::new(9)).unwrap();
    let mut seen = Vec::new();
    while let Some(id) = cursor.next_id().unwrap() {
        seen.push(id);
    }
    assert_eq!(seen, expected, "ids arrive in insertion order");
    assert_eq!(
        cursor.next_id().unwrap(),
        None,
        "the cursor stays exhausted after EOF"
    );
    reader.rollback().unwrap();
}

#[test]
fn scan_spanning_multiple_batches() {
    let server = TestServer::start();
    let count = 2500usize;

    let mut writer = server.connect();
    writer.begin().unwrap();
    let mut expected = Vec::with_capacity(count);
    for _ in 0..count {
        expected.push(writer.create(TypeId::new(4), 0, b"x").unwrap());
    }
    writer.commit().unwrap();

    let mut reader = server.connect();
    reader.begin().unwrap();
    let ids = reader.table_scan(TypeId::new(4)).unwrap().collect_ids().unwrap();
    assert_eq!(ids, expected);
    reader.rollback().unwrap();
}

#[test]
fn scan_filters_by_type() {
    let server = TestServer::start();

    let mut writer = server.connect();
    writer.begin().unwrap();
    let wanted = writer.create(TypeId::new(1), 0, b"wanted").unwrap();
    writer.create(TypeId::new(2), 0, b"other").unwrap();
    let wanted_too = writer.create(TypeId::new(1), 0, b"also").unwrap();
    writer.commit().unwrap();

    let mut reader = server.connect();
    reader.begin().unwrap();
    let ids = reader.table_scan(TypeId::new(1)).unwrap().collect_ids().unwrap();
    assert_eq!(ids, vec![wanted, wanted_too]);
    reader.rollback().unwrap();
}

#[test]
fn scan_of_an_empty_type_is_immediately_exhausted() {
    let server = TestServer::start();
    let mut session = server.connect();
    session.begin().unwrap();
    let mut cursor = session.table_scan(TypeId::new(77)).unwrap();
    assert_eq!(cursor.next_id().unwrap(), None);
    session.rollback().unwrap();
}

#[test]
fn deleted_objects_drop_out_of_scans() {
    let server = TestServer::start();

    let mut session = server.connect();
    session.begin().unwrap();
    let keep = session.create(TypeId::new(6), 0, b"keep").unwrap();
    let doomed = session.create(TypeId::new(6), 0, b"doomed").unwrap();
    session.commit().unwrap();

    session.begin().unwrap();
    session.delete(doomed).unwrap();
    session.commit().unwrap();

    let mut reader = server.connect();
    reader.begin().unwrap();
    let ids = reader.table_scan(TypeId::new(6)).unwrap().collect_ids().unwrap();
    assert_eq!(ids, vec![keep]);
    reader.rollback().unwrap();
}
