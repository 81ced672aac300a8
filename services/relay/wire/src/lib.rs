//! Envelope tagged union, request identifiers, and JSON encoding for relay.
//!
//! Every frame exchanged with the remote counterparty is a single JSON object
//! with exactly one key naming the envelope variant. The variant carries the
//! correlation identifier and an opaque payload; this crate never looks inside
//! a payload.
//!
//! ## Wire Format
//!
//! ```text
//! outbound  {"Req":   {"id": <u64>, "req": {"<MethodName>": <params>}}}
//! inbound   {"Resp":  {"id": <u64>, "resp": <payload>}}
//!           {"Error": {"id": <u64>, "err": <payload>}}
//!           {"Notif": <payload>}
//!           {"From":  <any of the above>}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;

// Re-export main types
pub use envelope::{decode, decode_bytes, Envelope, RequestId, FORWARD_TAG};
pub use error::WireError;
