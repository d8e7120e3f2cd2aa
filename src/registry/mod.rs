//! Connection registry: the authoritative local record of every live
//! connection on this process.

mod registry;
mod types;

pub use registry::{ConnectionRegistry, RegistryStats};
pub use types::{
    CloseRequest, ConnectionHandle, ConnectionLimits, ConnectionMetadata, OutboundError,
    RegistryError, TransportKind,
};
