//! Asynchronous file descriptor broker.
//!
//! A single dispatcher task accepts file-operation requests tagged with
//! a caller-chosen correlation index, drives them against a storage
//! backend, and emits exactly one tagged response per request. Open
//! descriptors live in a slot table whose small integer indices are the
//! file descriptors handed back to callers.
//!
//! Main components:
//! - `arena`: the reusable slot table behind descriptors and pending
//!   correlation indices.
//! - `protocol`: the request/response envelopes and open flags.
//! - `storage`: the backend traits plus in-memory and local-directory
//!   implementations.
//! - `dispatch`: the dispatcher actor owning the descriptor table.
//! - `client`: the caller-side handle with async I/O trait support.

pub mod arena;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod storage;

pub use error::Error;
