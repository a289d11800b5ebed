//! Opaque per-document CRDT wrapper.

mod document;

pub use document::{CrdtDocument, YrsDocument};
