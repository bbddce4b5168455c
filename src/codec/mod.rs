//! Codec for encoding/decoding xDS messages.
//!
//! The codec layer converts between crate-owned message types
//! ([`DiscoveryRequest`], [`DiscoveryResponse`], the LRS messages) and
//! serialized bytes. This abstraction allows different protobuf
//! implementations (prost, google-protobuf) to be used with the same xDS
//! client logic.

use crate::error::Result;
use crate::message::{
    DiscoveryRequest, DiscoveryResponse, LoadStatsRequest, LoadStatsResponse, ResourceAny,
    UnwrappedResource,
};
use bytes::Bytes;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Trait for encoding/decoding xDS discovery messages.
///
/// Implementations convert between the crate-owned message types
/// and their serialized wire format.
pub trait XdsCodec: Send + Sync + 'static {
    /// Encode a [`DiscoveryRequest`] to bytes.
    fn encode_request(&self, request: &DiscoveryRequest) -> Result<Bytes>;

    /// Decode bytes into a [`DiscoveryResponse`].
    ///
    /// Implementations strip the `type.googleapis.com/` prefix from the
    /// response type URL and from each resource's Any type URL.
    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse>;

    /// Remove the `envoy.service.discovery.v3.Resource` wrapper from a
    /// response entry, if present.
    ///
    /// Unwrapped entries pass through with no name hint.
    fn unwrap_resource(&self, resource: &ResourceAny) -> Result<UnwrappedResource>;

    /// Encode a [`LoadStatsRequest`] to bytes.
    fn encode_lrs_request(&self, request: &LoadStatsRequest) -> Result<Bytes>;

    /// Decode bytes into a [`LoadStatsResponse`].
    fn decode_lrs_response(&self, bytes: Bytes) -> Result<LoadStatsResponse>;
}
