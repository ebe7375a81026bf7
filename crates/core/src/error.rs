//! Error taxonomy
//!
//! Five categories, each with a distinct handling policy:
//!
//! | Category | Policy |
//! |----------|--------|
//! | `Protocol` | Fatal to the session; the session handler tears down |
//! | `Resource` | Fatal to the transaction; surfaces to the caller |
//! | `TransactionAborted` | Commit rejected by validation or fencing; the caller may retry |
//! | `Referential` | Surfaces to the caller; the transaction may continue |
//! | `Io` | Fatal to the operation; carries the underlying OS error |
//!
//! The concurrency category gets its own top-level variant (rather than a
//! reason string) so callers can match on it and retry without inspecting
//! messages.

use crate::types::{ObjectId, TypeId};
use thiserror::Error;

/// Result alias used throughout Tessera.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Why a commit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A write–write conflict with a concurrently committed transaction.
    Conflict,
    /// The begin or commit timestamp entry was fenced (invalidated) by a
    /// concurrent transaction before it could be claimed. Rare and spurious;
    /// retrying is expected to succeed.
    Fenced,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Conflict => write!(f, "write-write conflict"),
            AbortReason::Fenced => write!(f, "timestamp entry fenced"),
        }
    }
}

/// Referential integrity violations. These leave the transaction usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReferentialError {
    /// An object with this id already exists.
    #[error("an object with id {0} already exists")]
    DuplicateId(ObjectId),

    /// No object with this id exists in the current snapshot.
    #[error("no object with id {0} exists")]
    NotFound(ObjectId),

    /// An object cannot be removed while its reference slots are populated.
    #[error("object {0} is still connected through its references")]
    NotDisconnected(ObjectId),

    /// A reference slot index beyond the object's reference count.
    #[error("reference slot {slot} out of range for object {id}")]
    InvalidReferenceSlot {
        /// The object whose slots were addressed.
        id: ObjectId,
        /// The out-of-range slot.
        slot: usize,
    },

    /// A relationship endpoint had the wrong type.
    #[error("type mismatch: expected type {expected}, found type {actual}")]
    TypeMismatch {
        /// Type required by the relationship.
        expected: TypeId,
        /// Type actually found.
        actual: TypeId,
    },

    /// A relationship with cardinality one already has a child.
    #[error("object {0} already has a child in a cardinality-one relationship")]
    CardinalityViolation(ObjectId),

    /// A required relationship cannot be disconnected while the child is
    /// live; remove the child instead.
    #[error("object {0} is bound by a required relationship")]
    RequiredReference(ObjectId),
}

/// The unified error type.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Unexpected event or state, malformed message, or missing attachments.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What the peer did wrong.
        reason: String,
    },

    /// A fixed resource is exhausted: arena words, locators, log records,
    /// handles, or timestamp pages.
    #[error("out of {resource}")]
    Resource {
        /// The resource that ran out.
        resource: &'static str,
    },

    /// The commit was rejected; distinguishable so callers can retry.
    #[error("transaction aborted: {0}")]
    TransactionAborted(AbortReason),

    /// Referential integrity violation.
    #[error(transparent)]
    Referential(#[from] ReferentialError),

    /// Socket, file, or other OS-level failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl TesseraError {
    /// Build a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        TesseraError::Protocol {
            reason: reason.into(),
        }
    }

    /// Build a resource-exhaustion error.
    pub fn resource(resource: &'static str) -> Self {
        TesseraError::Resource { resource }
    }

    /// Wrap an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TesseraError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is a retryable concurrency failure.
    pub fn is_concurrency_failure(&self) -> bool {
        matches!(self, TesseraError::TransactionAborted(_))
    }

    /// The taxonomy category, for logging and diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            TesseraError::Protocol { .. } => "protocol",
            TesseraError::Resource { .. } => "resource",
            TesseraError::TransactionAborted(_) => "concurrency",
            TesseraError::Referential(_) => "referential",
            TesseraError::Io { .. } => "io",
        }
    }
}
