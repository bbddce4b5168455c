//! A Rust implementation of an [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol)
//! control-plane client.
//!
//! The client subscribes to typed configuration resources over the Aggregated
//! Discovery Service (ADS) protocol and distributes updates to in-process
//! watchers. It supports multi-authority resource names (`xdstp://`), caching
//! with ACK/NACK semantics, per-resource request timeouts, fallback across a
//! priority-ordered server list, and a load-reporting (LRS) companion call.
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the use of the `tonic` transport. This enables `rt-tokio` and `codegen-prost` features. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime. Enabled by default.
//! - `codegen-prost`: Enables the use of the `prost` codec generated resources. Enabled by default.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod resource;
pub mod runtime;
pub mod transport;

pub use client::config::{AuthorityConfig, ClientConfig, ServerConfig};
pub use client::lrs::{LoadStatsProvider, LrsHandle};
pub use client::retry::{Backoff, RetryPolicy};
pub use client::watch::{ReadDelayHandle, ResourceEvent, ResourceWatcher};
pub use client::{XdsClient, XdsClientBuilder};
pub use codec::XdsCodec;
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstCodec;
pub use error::{Error, Result};
pub use message::{ClusterStats, Locality, Node};
pub use resource::{DecodeOutcome, DecodedResource, Resource, ResourceType};
pub use runtime::Runtime;
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;
pub use transport::{Transport, TransportBuilder, TransportStream};
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::{TonicTransport, TonicTransportBuilder};
