//! Session state machine conformance, driven over the raw wire protocol.
//!
//! Each test speaks the framed protocol directly to a session thread over a
//! socket pair, without the client crate, so invalid transitions and
//! teardown behavior are observable exactly as a misbehaving client would
//! see them.

use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessera_core::TxnLog;
use tessera_server::{Engine, ServerConfig, Session};
use tessera_storage::{HandleTable, Resource};
use tessera_wire::{
    recv_batch, recv_message, send_message, Message, MessageData, MessageKind, SessionEvent,
};

fn spawn_session() -> UnixStream {
    let engine = Arc::new(
        Engine::new(&ServerConfig::small("/nonexistent/tessera.sock")).unwrap(),
    );
    let (client, server) = UnixStream::pair().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    std::thread::spawn(move || Session::new(engine, server, shutdown).run());
    client
}

fn request(stream: &mut UnixStream, message: Message) -> Option<Message> {
    send_message(stream, &message).unwrap();
    recv_message(stream).unwrap()
}

#[test]
fn connect_attaches_both_segments() {
    let mut stream = spawn_session();
    let reply = request(&mut stream, Message::request(SessionEvent::Connect)).unwrap();
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.event, SessionEvent::Connect);
    assert_eq!(reply.attachments.len(), 2);

    let handles = HandleTable::global();
    assert!(handles.resolve_data(reply.attachments[0]).is_ok());
    assert!(handles.resolve_locators(reply.attachments[1]).is_ok());
    handles.close(reply.attachments[0]).unwrap();
    handles.close(reply.attachments[1]).unwrap();
}

#[test]
fn begin_before_connect_tears_the_session_down() {
    let mut stream = spawn_session();
    send_message(&mut stream, &Message::request(SessionEvent::BeginTxn)).unwrap();
    assert!(
        recv_message(&mut stream).unwrap().is_none(),
        "an event with no valid transition closes the session"
    );
}

#[test]
fn commit_without_a_transaction_tears_the_session_down() {
    let mut stream = spawn_session();
    let reply = request(&mut stream, Message::request(SessionEvent::Connect)).unwrap();
    for handle in &reply.attachments {
        HandleTable::global().close(*handle).unwrap();
    }
    send_message(&mut stream, &Message::request(SessionEvent::CommitTxn)).unwrap();
    assert!(recv_message(&mut stream).unwrap().is_none());
}

#[test]
fn replies_from_the_client_are_fatal() {
    let mut stream = spawn_session();
    send_message(&mut stream, &Message::reply(SessionEvent::Connect)).unwrap();
    assert!(recv_message(&mut stream).unwrap().is_none());
}

#[test]
fn memory_requests_work_in_any_state() {
    let mut stream = spawn_session();
    let reply = request(&mut stream, Message::request(SessionEvent::Connect)).unwrap();
    for handle in &reply.attachments {
        HandleTable::global().close(*handle).unwrap();
    }

    let reply = request(
        &mut stream,
        Message::request(SessionEvent::RequestMemory).with_data(MessageData::MemoryInfo {
            size_hint: 1,
            ranges: Vec::new(),
        }),
    )
    .unwrap();
    assert_eq!(reply.event, SessionEvent::RequestMemory);
    let MessageData::MemoryInfo { ranges, .. } = reply.data else {
        panic!("memory reply without ranges");
    };
    assert!(!ranges.is_empty(), "a minimal hint still grants one region");
}

#[test]
fn full_transaction_round_trip_over_the_raw_protocol() {
    let handles = HandleTable::global();
    let mut stream = spawn_session();

    let reply = request(&mut stream, Message::request(SessionEvent::Connect)).unwrap();
    for handle in &reply.attachments {
        handles.close(*handle).unwrap();
    }

    let reply = request(&mut stream, Message::request(SessionEvent::BeginTxn)).unwrap();
    assert_eq!(reply.event, SessionEvent::BeginTxn);
    let MessageData::TxnInfo { txn_id } = reply.data else {
        panic!("begin reply without txn info");
    };
    assert!(txn_id.is_valid());

    // Drain the snapshot log stream; a fresh store streams nothing.
    let mut log_stream = handles.take_stream(reply.attachments[0]).unwrap();
    handles.close(reply.attachments[0]).unwrap();
    assert_eq!(recv_batch(&mut log_stream).unwrap(), None);

    // An empty sealed log commits trivially.
    let log_handle = handles
        .register(Resource::Log(Arc::new(TxnLog::new().seal())))
        .unwrap();
    let reply = request(
        &mut stream,
        Message::request(SessionEvent::CommitTxn).with_attachment(log_handle),
    )
    .unwrap();
    assert_eq!(reply.event, SessionEvent::DecideTxnCommit);
    let MessageData::TxnInfo { txn_id: commit_ts } = reply.data else {
        panic!("decide reply without txn info");
    };
    assert!(commit_ts > txn_id);

    // The session is reusable afterwards.
    let reply = request(&mut stream, Message::request(SessionEvent::BeginTxn)).unwrap();
    assert_eq!(reply.event, SessionEvent::BeginTxn);
    let _ = handles.take_stream(reply.attachments[0]);
    handles.close(reply.attachments[0]).unwrap();
}

#[test]
fn rollback_sends_no_reply_but_keeps_the_session() {
    let handles = HandleTable::global();
    let mut stream = spawn_session();

    let reply = request(&mut stream, Message::request(SessionEvent::Connect)).unwrap();
    for handle in &reply.attachments {
        handles.close(*handle).unwrap();
    }
    let reply = request(&mut stream, Message::request(SessionEvent::BeginTxn)).unwrap();
    let mut log_stream = handles.take_stream(reply.attachments[0]).unwrap();
    handles.close(reply.attachments[0]).unwrap();
    assert_eq!(recv_batch(&mut log_stream).unwrap(), None);

    send_message(&mut stream, &Message::request(SessionEvent::RollbackTxn)).unwrap();

    // No reply for the rollback: the next reply answers the next request.
    let reply = request(&mut stream, Message::request(SessionEvent::BeginTxn)).unwrap();
    assert_eq!(reply.event, SessionEvent::BeginTxn);
    let _ = handles.take_stream(reply.attachments[0]);
    handles.close(reply.attachments[0]).unwrap();
}
