//! # skiff-sync: Real-time state synchronization for the skiff download manager
//!
//! Pushes scheduler, storage, bandwidth and log state to any number of
//! connected clients over WebSocket, and routes their commands back to the
//! scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per UI)    │  [cmd, param, JSON] │ (gateway)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ attach / dispatch
//!                                     ┌──────┴──────┐
//!           Scheduler events ───────► │     Hub     │ ◄─── StorageMonitor
//!           bandwidth sampler ──────► │             │      (DiskMachine,
//!                                     └──────┬──────┘       ingestion)
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │  Broadcaster  │
//!                                    │  (fan-out)    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary frame codec, channels, commands, typed payloads
//! - [`buffers`]: Rolling sample history and the capped log buffer
//! - [`registry`]: Live connections and their outbound queues
//! - [`broadcast`]: Channel-scoped fan-out with slow-consumer isolation
//! - [`hub`]: Shared state, collaborator traits, Setup snapshots
//! - [`storage`]: Storage availability state machine and monitor
//! - [`ingest`]: Batch files dropped into the watched directory
//! - [`server`]: WebSocket gateway
//! - [`client`]: Reconnecting WebSocket client
//! - [`memory`]: In-memory scheduler and link store

pub mod protocol;
pub mod buffers;
pub mod registry;
pub mod broadcast;
pub mod hub;
pub mod storage;
pub mod ingest;
pub mod server;
pub mod client;
pub mod memory;

// Re-exports for convenience
pub use protocol::{
    Channel, ChannelSet, ClientRequest, Command, Frame, ProtocolError, ServerEvent,
    SetupSnapshot, CLOSED_BY_CLIENT, NO_PARAMETER, POLICY_VIOLATION_BY_CLIENT, PROTOCOL_VERSION,
};
pub use buffers::{LogBuffer, LogRecord, RollingBuffer, Severity};
pub use registry::{Connection, ConnectionRegistry};
pub use broadcast::{BroadcastReport, BroadcastStats, Broadcaster, DeliveryOutcome};
pub use hub::{Hub, LinkStore, Scheduler, SchedulerError, SchedulerEvent};
pub use storage::{DiskMachine, FsProbe, StorageConfig, StorageError, StorageMonitor};
pub use ingest::{IngestError, LinkFileFilter};
pub use server::{
    AllowAll, BearerToken, HandshakeError, IdentityProvider, ServerConfig, ServerStats, SyncServer,
};
pub use client::{ClientConfig, ClientError, ClientEvent, LinkState, SyncClient};
pub use memory::{MemoryLinkStore, MemoryScheduler};
