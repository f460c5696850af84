//! Shared types for the obsd control plane: the OBS WebSocket v5 wire codec,
//! session identifiers, connection states and the normalized events that
//! sessions publish onto the event bus.

pub mod auth;
pub mod bus;
pub mod errors;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod state;

pub use bus::{BroadcastBus, EventBus};
pub use errors::ProtocolError;
pub use events::BusEvent;
pub use ids::SessionId;
pub use state::{ConnectionState, OutputKind};
