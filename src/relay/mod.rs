//! The relay broker: extension link, target registry, client sessions, and
//! the HTTP/WebSocket server tying them together.

mod broker;
mod client;
mod error;
mod extension;
mod protocol;
mod registry;
mod server;

pub use broker::{Broker, FrameOutcome};
pub use client::{CLOSE_NORMAL, CLOSE_OVERLOAD, CLOSE_POLICY};
pub use error::RelayError;
pub use extension::{ExtensionEvent, ExtensionSlot, ExtensionState};
pub use protocol::{EXTENSION_ERROR, INTERNAL_ERROR, METHOD_NOT_FOUND};
pub use registry::{Registry, SessionEntry, TargetEntry, TargetKind};
pub use server::{bind, router, run};
