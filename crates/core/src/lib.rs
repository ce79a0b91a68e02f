//! `flowbridge-core`: identifiers, variables and the error taxonomy.
//!
//! This crate has no I/O; everything else in the workspace builds on it.

pub mod error;
pub mod id;
pub mod variables;

pub use error::{BridgeError, BridgeResult};
pub use id::{JobKey, ProcessInstanceKey, RequestId};
pub use variables::Variables;
