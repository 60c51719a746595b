//! Identity/Role Gate: a pure predicate over an already-authenticated
//! caller's role and the operation it wants to perform.
//!
//! Authentication itself (verifying the caller is who it claims to be, via
//! mTLS client certificates or similar) happens outside this crate; by the
//! time `allowed` is called the caller's role has already been established.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// May Query and Stream logs, never Start or Stop a job.
    Reader,
    /// May perform every operation; a superset of `Reader`.
    Writer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Query,
    Stream,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "Start",
            Operation::Stop => "Stop",
            Operation::Query => "Query",
            Operation::Stream => "Stream",
        }
    }
}

/// Returns whether `role` may perform `operation`.
pub fn allowed(role: Role, operation: Operation) -> bool {
    match (role, operation) {
        (Role::Writer, _) => true,
        (Role::Reader, Operation::Query) => true,
        (Role::Reader, Operation::Stream) => true,
        (Role::Reader, Operation::Start) => false,
        (Role::Reader, Operation::Stop) => false,
    }
}
