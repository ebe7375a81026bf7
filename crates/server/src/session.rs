//! Session threads and the protocol state machine
//!
//! Every connected client gets one server thread running [`Session::run`].
//! The session reads framed requests, maps socket conditions to shutdown
//! events, and applies table-driven state transitions; an event with no
//! matching transition is a protocol error and tears the session down.
//!
//! Transitions with a wildcard state must appear after exact-state rows for
//! the same event, or the exact rows would never match.

use crate::engine::{CommitOutcome, Engine};
use crate::stream;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tessera_core::{Result, TesseraError, Txid};
use tessera_storage::{MemoryRange, Resource};
use tessera_wire::{
    recv_message, send_message, Message, MessageData, MessageKind, SessionEvent, WireRange,
};

/// Protocol states of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session established yet (or torn down).
    Disconnected,
    /// Session established, no transaction open.
    Connected,
    /// A transaction is open.
    TxnInProgress,
    /// A commit is being decided.
    TxnCommitting,
}

#[derive(Debug, Clone, Copy)]
enum StatePattern {
    Exact(SessionState),
    Any,
}

impl StatePattern {
    fn matches(self, state: SessionState) -> bool {
        match self {
            StatePattern::Exact(s) => s == state,
            StatePattern::Any => true,
        }
    }
}

type Handler = fn(&mut Session, &Message) -> Result<()>;

struct ValidTransition {
    state: StatePattern,
    event: SessionEvent,
    /// `None` leaves the state unchanged.
    new_state: Option<SessionState>,
    handler: Handler,
}

use SessionEvent as E;
use SessionState as S;
use StatePattern::{Any, Exact};

static VALID_TRANSITIONS: &[ValidTransition] = &[
    ValidTransition {
        state: Exact(S::Disconnected),
        event: E::Connect,
        new_state: Some(S::Connected),
        handler: Session::handle_connect,
    },
    ValidTransition {
        state: Exact(S::Connected),
        event: E::BeginTxn,
        new_state: Some(S::TxnInProgress),
        handler: Session::handle_begin_txn,
    },
    ValidTransition {
        state: Exact(S::TxnInProgress),
        event: E::RollbackTxn,
        new_state: Some(S::Connected),
        handler: Session::handle_rollback_txn,
    },
    ValidTransition {
        state: Exact(S::TxnInProgress),
        event: E::CommitTxn,
        new_state: Some(S::TxnCommitting),
        handler: Session::handle_commit_txn,
    },
    ValidTransition {
        state: Exact(S::TxnCommitting),
        event: E::DecideTxnCommit,
        new_state: Some(S::Connected),
        handler: Session::handle_decide_txn,
    },
    ValidTransition {
        state: Exact(S::TxnCommitting),
        event: E::DecideTxnAbort,
        new_state: Some(S::Connected),
        handler: Session::handle_decide_txn,
    },
    ValidTransition {
        state: Any,
        event: E::ClientShutdown,
        new_state: Some(S::Disconnected),
        handler: Session::handle_shutdown,
    },
    ValidTransition {
        state: Any,
        event: E::ServerShutdown,
        new_state: Some(S::Disconnected),
        handler: Session::handle_shutdown,
    },
    ValidTransition {
        state: Any,
        event: E::RequestStream,
        new_state: None,
        handler: Session::handle_request_stream,
    },
    ValidTransition {
        state: Any,
        event: E::RequestMemory,
        new_state: None,
        handler: Session::handle_request_memory,
    },
];

/// One connected client session.
pub struct Session {
    engine: Arc<Engine>,
    stream: UnixStream,
    state: SessionState,
    txn_id: Option<Txid>,
    commit_outcome: Option<CommitOutcome>,
    /// Regions recycled from aborted transactions of this session.
    free_regions: Vec<MemoryRange>,
    /// Regions granted to the currently open transaction.
    txn_regions: Vec<MemoryRange>,
    server_shutdown: Arc<AtomicBool>,
    shutdown: bool,
    cancel: Arc<AtomicBool>,
    producers: Vec<JoinHandle<()>>,
    producer_streams: Vec<UnixStream>,
}

impl Session {
    /// Wrap an accepted connection.
    pub fn new(engine: Arc<Engine>, stream: UnixStream, server_shutdown: Arc<AtomicBool>) -> Session {
        Session {
            engine,
            stream,
            state: SessionState::Disconnected,
            txn_id: None,
            commit_outcome: None,
            free_regions: Vec::new(),
            txn_regions: Vec::new(),
            server_shutdown,
            shutdown: false,
            cancel: Arc::new(AtomicBool::new(false)),
            producers: Vec::new(),
            producer_streams: Vec::new(),
        }
    }

    /// Serve the session until shutdown or a fatal error, then tear down.
    pub fn run(mut self) {
        if let Err(e) = self.serve() {
            tracing::error!(error = %e, category = e.category(), "session terminated");
        }
        self.teardown();
    }

    fn serve(&mut self) -> Result<()> {
        while !self.shutdown {
            let message = match recv_message(&mut self.stream) {
                Ok(Some(message)) => {
                    if message.kind != MessageKind::Request {
                        return Err(TesseraError::protocol("reply received from client"));
                    }
                    message
                }
                // EOF, connection reset, and the like all mean the peer is
                // gone; during server shutdown the socket was closed under
                // us deliberately.
                Ok(None) => Message::request(self.shutdown_event()),
                Err(TesseraError::Io { source, .. }) => {
                    tracing::debug!(error = %source, "session socket failed");
                    Message::request(self.shutdown_event())
                }
                Err(e) => return Err(e),
            };
            self.apply_transition(&message)?;
        }
        Ok(())
    }

    fn shutdown_event(&self) -> SessionEvent {
        if self.server_shutdown.load(Ordering::Acquire) {
            SessionEvent::ServerShutdown
        } else {
            SessionEvent::ClientShutdown
        }
    }

    fn apply_transition(&mut self, message: &Message) -> Result<()> {
        for transition in VALID_TRANSITIONS {
            if transition.event == message.event && transition.state.matches(self.state) {
                let old_state = self.state;
                if let Some(new_state) = transition.new_state {
                    self.state = new_state;
                }
                tracing::debug!(
                    event = %message.event,
                    ?old_state,
                    new_state = ?self.state,
                    "session transition"
                );
                return (transition.handler)(self, message);
            }
        }
        Err(TesseraError::protocol(format!(
            "no allowed state transition from {:?} with event {}",
            self.state, message.event
        )))
    }

    fn send(&mut self, message: Message) -> Result<()> {
        send_message(&mut self.stream, &message)
    }

    fn handle_connect(&mut self, _message: &Message) -> Result<()> {
        let (data, locators) = self.engine.connect_handles()?;
        self.send(
            Message::reply(SessionEvent::Connect)
                .with_attachment(data)
                .with_attachment(locators),
        )
    }

    fn handle_begin_txn(&mut self, _message: &Message) -> Result<()> {
        let (begin_ts, logs) = match self.engine.begin() {
            Ok(ok) => ok,
            Err(TesseraError::TransactionAborted(reason)) => {
                // Persistently fenced; report failure with the reserved
                // zero timestamp and return to the connected state.
                tracing::warn!(%reason, "begin failed");
                self.state = SessionState::Connected;
                return self.send(
                    Message::reply(SessionEvent::BeginTxn)
                        .with_data(MessageData::TxnInfo { txn_id: Txid::ZERO }),
                );
            }
            Err(e) => return Err(e),
        };

        // Stream the snapshot's committed logs to the client from a
        // session-owned producer thread.
        let (client_end, server_end) = UnixStream::pair()
            .map_err(|e| TesseraError::io("create log stream pair", e))?;
        let stream_handle = self
            .engine
            .handles()
            .register(Resource::stream(client_end))?;
        self.producer_streams.push(
            server_end
                .try_clone()
                .map_err(|e| TesseraError::io("clone log stream", e))?,
        );
        self.producers.push(stream::spawn_handle_producer(
            server_end,
            Arc::clone(&self.cancel),
            logs,
            self.engine.handles(),
        ));

        self.txn_id = Some(begin_ts);
        self.send(
            Message::reply(SessionEvent::BeginTxn)
                .with_data(MessageData::TxnInfo { txn_id: begin_ts })
                .with_attachment(stream_handle),
        )
    }

    fn open_txn(&self) -> Result<Txid> {
        self.txn_id
            .ok_or_else(|| TesseraError::protocol("no transaction is open on this session"))
    }

    fn handle_rollback_txn(&mut self, _message: &Message) -> Result<()> {
        let begin_ts = self.open_txn()?;
        self.txn_id = None;
        self.engine.rollback(begin_ts);
        self.free_regions.append(&mut self.txn_regions);
        // No reply.
        Ok(())
    }

    fn handle_commit_txn(&mut self, message: &Message) -> Result<()> {
        let begin_ts = self.open_txn()?;
        let &[log_handle] = &message.attachments[..] else {
            return Err(TesseraError::protocol(
                "commit requires exactly one log attachment",
            ));
        };
        let outcome = self.engine.commit(begin_ts, log_handle)?;
        self.commit_outcome = Some(outcome);
        let event = match outcome {
            CommitOutcome::Committed(_) => SessionEvent::DecideTxnCommit,
            CommitOutcome::Aborted(..) => SessionEvent::DecideTxnAbort,
        };
        // Server-initiated transition: the decision is an event too.
        self.apply_transition(&Message::request(event))
    }

    fn handle_decide_txn(&mut self, message: &Message) -> Result<()> {
        let outcome = self
            .commit_outcome
            .take()
            .ok_or_else(|| TesseraError::protocol("decide without a pending commit"))?;
        self.txn_id = None;
        let reply_ts = match outcome {
            // Committed regions became part of the arena for good.
            CommitOutcome::Committed(commit_ts) => {
                self.txn_regions.clear();
                commit_ts
            }
            CommitOutcome::Aborted(commit_ts, reason) => {
                self.free_regions.append(&mut self.txn_regions);
                // A fence abort is reported with the reserved zero timestamp
                // so the client can distinguish it from a conflict.
                match reason {
                    tessera_core::AbortReason::Fenced => Txid::ZERO,
                    tessera_core::AbortReason::Conflict => commit_ts,
                }
            }
        };
        self.send(
            Message::reply(message.event)
                .with_data(MessageData::TxnInfo { txn_id: reply_ts }),
        )
    }

    fn handle_request_stream(&mut self, message: &Message) -> Result<()> {
        let MessageData::TableScan { type_id } = message.data else {
            return Err(TesseraError::protocol("unsupported stream request"));
        };
        let (client_end, server_end) = UnixStream::pair()
            .map_err(|e| TesseraError::io("create cursor stream pair", e))?;
        let stream_handle = self
            .engine
            .handles()
            .register(Resource::stream(client_end))?;
        self.producer_streams.push(
            server_end
                .try_clone()
                .map_err(|e| TesseraError::io("clone cursor stream", e))?,
        );
        self.producers.push(stream::spawn_value_producer(
            server_end,
            Arc::clone(&self.cancel),
            self.engine.ids_of_type(type_id),
        ));
        self.send(Message::reply(SessionEvent::RequestStream).with_attachment(stream_handle))
    }

    fn handle_request_memory(&mut self, message: &Message) -> Result<()> {
        let MessageData::MemoryInfo { size_hint, .. } = message.data else {
            return Err(TesseraError::protocol("memory request without a hint"));
        };
        let granted = self
            .engine
            .grant_memory(&mut self.free_regions, size_hint as usize)?;
        self.txn_regions.extend_from_slice(&granted);
        self.send(
            Message::reply(SessionEvent::RequestMemory).with_data(MessageData::MemoryInfo {
                size_hint: 0,
                ranges: granted
                    .iter()
                    .map(|r| WireRange {
                        offset: r.offset.get(),
                        size: r.size,
                    })
                    .collect(),
            }),
        )
    }

    fn handle_shutdown(&mut self, _message: &Message) -> Result<()> {
        self.shutdown = true;
        Ok(())
    }

    fn teardown(&mut self) {
        // A transaction abandoned by a dead or misbehaving client is
        // reclaimed here; the watermark does the rest.
        if let Some(begin_ts) = self.txn_id.take() {
            self.engine.reclaim_dead_session_txn(begin_ts);
            self.free_regions.append(&mut self.txn_regions);
        }
        self.cancel.store(true, Ordering::Release);
        for producer_stream in &self.producer_streams {
            let _ = producer_stream.shutdown(Shutdown::Both);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        for producer in self.producers.drain(..) {
            let _ = producer.join();
        }
        tracing::debug!("session torn down");
    }
}
