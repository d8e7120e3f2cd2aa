//! Transport-agnostic wire protocol.
//!
//! Both transports exchange the same envelope model; the adapters only
//! translate framing. Close codes follow the WebSocket convention even for
//! SSE, where they are logged rather than sent.

mod envelope;

pub use envelope::{ClientEnvelope, Envelope, EnvelopeKind, EventData};

/// Close code for internal server errors.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code for policy violations (authentication, tenancy).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for liveness timeouts (application-defined range).
pub const CLOSE_LIVENESS_TIMEOUT: u16 = 4000;
/// Close code for outbound queue overflow (application-defined range).
pub const CLOSE_SLOW_CONSUMER: u16 = 4001;
