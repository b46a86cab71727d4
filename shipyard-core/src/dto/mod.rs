//! Data Transfer Objects
//!
//! - `legacy`: flat, string-typed records exchanged with upstream systems that
//!   predate the domain model. Only the translator converts them.
//! - `workflow`: request/response payloads of the orchestrator's operator API.

pub mod legacy;
pub mod workflow;
