//! Mesh Cluster
//!
//! Distributed deployment of the Mesh agent runtime: worker processes host
//! agents and hold one duplex connection each to a gateway, which proxies
//! unicast RPCs with correlation-id substitution and fans broadcasts out to
//! one representative connection per supported agent type. Application code
//! written against `mesh-runtime`'s contract runs unchanged on either tier.

pub mod config;
pub mod connect;
pub mod gateway;
pub mod protocol;
pub mod worker;

pub use config::{GatewayConfig, WorkerConfig};
pub use connect::{BoxedStream, Connector, MeshStream, TcpConnector};
pub use gateway::{ConnectionId, Gateway, GatewayStats};
pub use protocol::{read_frame, write_frame, Envelope, WireError, MAX_FRAME_BYTES};
pub use worker::{ConnectionState, WorkerClient, WorkerStats};
