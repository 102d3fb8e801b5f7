//! Model checkers for the shared-memory structures.
//!
//! Each checker drives the real structure on heap memory through a sequence
//! of operations and compares it step by step against a plain collection.

pub mod chunk_queue_model;
pub mod index_list_model;
pub mod sofi_model;
