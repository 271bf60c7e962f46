//! The shared protocol model: service descriptors, the wire envelope, and
//! its two encodings.

pub mod codec;
mod data;
mod service_map;

pub use self::data::{ApiReturn, DataType, EncodedData, JsonValidator, TransportData, Validator};
pub use self::service_map::{ApiService, EndpointSide, MsgService, Service, ServiceMap};

use serde::{Deserialize, Serialize};

/// The static description of every service a pair of endpoints may exchange.
///
/// Built once (usually deserialized from a generated document) and then
/// compiled into a [`ServiceMap`] per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProto {
    /// Schema version, when the generator stamps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Every service either endpoint may reference.
    pub services: Vec<ServiceDef>,
}

/// One service: an API (request/response) or a message (one-way).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Unique numeric id, used by the binary box.
    pub id: u32,
    /// Full name, `(path/)?name`.
    pub name: String,
    /// API or message.
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Which endpoint implements it.
    #[serde(default)]
    pub side: ServiceSide,
}

/// The two service shapes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Request/response, correlated by serial number.
    #[serde(rename = "api")]
    Api,
    /// One-way message, no serial number.
    #[serde(rename = "msg")]
    Msg,
}

/// Which endpoint implements a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceSide {
    /// Served by the server endpoint.
    #[serde(rename = "server")]
    Server,
    /// Served by the client endpoint (duplex transports).
    #[serde(rename = "client")]
    Client,
    /// Served by whichever endpoint receives the call.
    #[serde(rename = "both")]
    Both,
}

impl Default for ServiceSide {
    fn default() -> ServiceSide {
        ServiceSide::Server
    }
}

/// Schema-version metadata exchanged opportunistically between peers.
///
/// Carried in an HTTP header or an in-band field so each side can detect
/// schema skew and log a warning. It never changes protocol semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtoInfo {
    /// When the schema document was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Digest of the schema document; the skew check compares these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Framework version of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsrpc: Option<String>,
    /// Runtime version of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl ProtoInfo {
    /// Whether the peer's schema digest differs from ours.
    ///
    /// Unknown digests (either side missing) never count as skew.
    pub fn is_skewed_from(&self, peer: &ProtoInfo) -> bool {
        match (&self.md5, &peer.md5) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}
