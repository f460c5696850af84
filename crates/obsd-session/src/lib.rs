//! Per-session connection subsystem for OBS WebSocket v5.
//!
//! Every managed OBS instance gets a [`SessionSupervisor`] that runs seven
//! cooperating actors (connection, request tracker, event handler, scene and
//! stream managers, stats collector, task pool) as one all-for-one group.
//! [`SessionRegistry`] keys supervisors by [`SessionId`] and [`ObsApi`] is the
//! inbound surface used by the gateway.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_handler;
mod mailbox;
pub mod registry;
pub mod scenes;
pub mod stats;
pub mod stream;
pub mod supervisor;
pub mod task_pool;
pub mod tracker;

pub use api::ObsApi;
pub use cache::Caches;
pub use config::{BackoffConfig, SessionOptions, SupervisorConfig};
pub use connection::{ConnectionHandle, ConnectionStatus};
pub use error::SessionError;
pub use event_handler::{ObsEvent, SessionEvent};
pub use obsd_core::SessionId;
pub use registry::SessionRegistry;
pub use scenes::SceneSnapshot;
pub use stats::StatsSnapshot;
pub use stream::OutputSnapshot;
pub use supervisor::{Component, ComponentKind, SessionSupervisor};
pub use tracker::{OutboundRequest, TrackerHandle};
