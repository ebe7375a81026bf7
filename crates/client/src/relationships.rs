//! Relationship descriptors
//!
//! The core does not own a schema; a relationship is described by the three
//! reference slots that implement it. Parent objects hold the head of a
//! child list in `first_child_slot`; each child holds its parent in
//! `parent_slot` and its next sibling in `next_child_slot`. Connect and
//! disconnect maintain that triple; the actual slot rewrites run through the
//! session so every change is a new object version in the transaction log.

use tessera_core::TypeId;

/// How many children a parent may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one child.
    One,
    /// Any number of children.
    Many,
}

/// One parent/child relationship, described by its reference slots.
#[derive(Debug, Clone, Copy)]
pub struct Relationship {
    /// Required type of the parent object.
    pub parent_type: TypeId,
    /// Required type of the child objects.
    pub child_type: TypeId,
    /// Slot in the parent holding the first child's id.
    pub first_child_slot: usize,
    /// Slot in each child holding the parent's id.
    pub parent_slot: usize,
    /// Slot in each child holding the next sibling's id.
    pub next_child_slot: usize,
    /// Child multiplicity.
    pub cardinality: Cardinality,
    /// Whether a connected child may be disconnected without being removed.
    pub required: bool,
}
