//! `armgate-middleware` – Observer Fan-out
//!
//! Moves serialized envelopes from the control plane to any number of
//! observer connections without caring what the envelopes mean.
//!
//! # Modules
//!
//! - [`bus`] – [`TelemetryBus`]: topic-scoped fan-out with a bounded,
//!   drop-oldest queue and a dedicated drain task per connection.
//! - [`sink`] – [`ConnectionSink`]: the write seam between the bus and a
//!   transport, with WebSocket and in-process implementations.

pub mod bus;
pub mod sink;

pub use bus::{BusConfig, BusStats, ConnectionInfo, DEFAULT_QUEUE_CAPACITY, TelemetryBus};
pub use sink::{ChannelSink, ConnectionSink, WsSink};
