//! The tagged wire envelope and the values it carries.

use std::fmt;

use bytes::Bytes;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::TsrpcError;
use crate::proto::ProtoInfo;

/// Which encoding a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// JSON text frames.
    Text,
    /// Schema-encoded binary frames.
    Buffer,
}

/// An encoded frame, ready for (or fresh off) a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedData {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Buffer(Bytes),
}

impl EncodedData {
    /// Which encoding this frame uses.
    pub fn data_type(&self) -> DataType {
        match *self {
            EncodedData::Text(_) => DataType::Text,
            EncodedData::Buffer(_) => DataType::Buffer,
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        match *self {
            EncodedData::Text(ref s) => s.len(),
            EncodedData::Buffer(ref b) => b.len(),
        }
    }

    /// Whether the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The wire envelope shared by every transport.
///
/// `Heartbeat` and `Handshake` are lifecycle frames of duplex transports;
/// the codec round-trips them, but a stateless transport never emits them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportData {
    /// Client → server API call.
    Req {
        /// Target API service.
        service_name: String,
        /// Serial number the response must echo.
        sn: u32,
        /// Request body.
        body: Value,
        /// Schema metadata piggybacked in-band, when the transport has no
        /// out-of-band channel for it.
        proto_info: Option<ProtoInfo>,
    },
    /// Server → client API success, correlated by `sn`.
    Res {
        /// The called API service.
        service_name: String,
        /// Serial number of the matching request.
        sn: u32,
        /// Response body.
        body: Value,
        /// Schema metadata piggybacked in-band.
        proto_info: Option<ProtoInfo>,
    },
    /// Server → client API failure, correlated by `sn`.
    Err {
        /// Serial number of the matching request.
        sn: u32,
        /// The failure, reconstructed verbatim by the receiver.
        err: TsrpcError,
        /// Schema metadata piggybacked in-band.
        proto_info: Option<ProtoInfo>,
    },
    /// One-way message; carries no serial number.
    Msg {
        /// Target message service.
        service_name: String,
        /// Message body.
        body: Value,
    },
    /// User-defined frame; the core neither parses nor validates it.
    Custom {
        /// The raw frame.
        buf: Bytes,
    },
    /// Duplex liveness probe.
    Heartbeat,
    /// Duplex connection setup frame.
    Handshake,
}

impl TransportData {
    /// The service name, for kinds that carry one.
    pub fn service_name(&self) -> Option<&str> {
        match *self {
            TransportData::Req { ref service_name, .. }
            | TransportData::Res { ref service_name, .. }
            | TransportData::Msg { ref service_name, .. } => Some(service_name),
            _ => None,
        }
    }

    /// The serial number, for kinds that carry one.
    pub fn sn(&self) -> Option<u32> {
        match *self {
            TransportData::Req { sn, .. }
            | TransportData::Res { sn, .. }
            | TransportData::Err { sn, .. } => Some(sn),
            _ => None,
        }
    }
}

/// The end-to-end result of an API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReturn<T = Value> {
    /// The call succeeded with a response body.
    Succ(T),
    /// The call failed; the error reaches the caller verbatim.
    Err(TsrpcError),
}

impl<T> ApiReturn<T> {
    /// Whether this is the success branch.
    pub fn is_succ(&self) -> bool {
        matches!(*self, ApiReturn::Succ(_))
    }

    /// The response body, if successful.
    pub fn res(&self) -> Option<&T> {
        match *self {
            ApiReturn::Succ(ref res) => Some(res),
            ApiReturn::Err(_) => None,
        }
    }

    /// The error, if failed.
    pub fn err(&self) -> Option<&TsrpcError> {
        match *self {
            ApiReturn::Succ(_) => None,
            ApiReturn::Err(ref err) => Some(err),
        }
    }
}

// The wire shape is `{"isSucc": true, "res": ...}` or
// `{"isSucc": false, "err": {...}}`, which no derive produces directly.

impl<T: Serialize> Serialize for ApiReturn<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        match *self {
            ApiReturn::Succ(ref res) => {
                map.serialize_entry("isSucc", &true)?;
                map.serialize_entry("res", res)?;
            }
            ApiReturn::Err(ref err) => {
                map.serialize_entry("isSucc", &false)?;
                map.serialize_entry("err", err)?;
            }
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ApiReturn<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr<T> {
            #[serde(rename = "isSucc")]
            is_succ: bool,
            res: Option<T>,
            err: Option<TsrpcError>,
        }
        let repr = Repr::<T>::deserialize(deserializer)?;
        match (repr.is_succ, repr.res, repr.err) {
            (true, Some(res), _) => Ok(ApiReturn::Succ(res)),
            (false, _, Some(err)) => Ok(ApiReturn::Err(err)),
            (true, None, _) => Err(D::Error::missing_field("res")),
            (false, _, None) => Err(D::Error::missing_field("err")),
        }
    }
}

/// The external schema runtime this crate encodes typed bodies through.
///
/// The schema compiler itself is a collaborator: implementations resolve the
/// given schema ID in their own registry. Errors are plain strings; the codec
/// wraps them into the protocol's error taxonomy at the call site.
pub trait Validator: Send + Sync + 'static {
    /// Encodes a body against the named schema.
    fn encode(&self, body: &Value, schema_id: &str) -> Result<Bytes, String>;
    /// Decodes bytes against the named schema.
    fn decode(&self, buf: &[u8], schema_id: &str) -> Result<Value, String>;
    /// Checks a body against the named schema without encoding it.
    fn validate(&self, body: &Value, schema_id: &str) -> Result<(), String>;
}

/// Passthrough validator: bodies are JSON, every schema accepts everything.
///
/// The default when no schema runtime is plugged in, and what a `json: true`
/// deployment uses in production.
#[derive(Debug, Default)]
pub struct JsonValidator;

impl Validator for JsonValidator {
    fn encode(&self, body: &Value, _schema_id: &str) -> Result<Bytes, String> {
        serde_json::to_vec(body)
            .map(Bytes::from)
            .map_err(|e| e.to_string())
    }

    fn decode(&self, buf: &[u8], _schema_id: &str) -> Result<Value, String> {
        serde_json::from_slice(buf).map_err(|e| e.to_string())
    }

    fn validate(&self, _body: &Value, _schema_id: &str) -> Result<(), String> {
        Ok(())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DataType::Text => f.write_str("text"),
            DataType::Buffer => f.write_str("buffer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_return_succ_wire_shape() {
        let ret: ApiReturn = ApiReturn::Succ(json!({"reply": "hi"}));
        let v = serde_json::to_value(&ret).unwrap();
        assert_eq!(v, json!({"isSucc": true, "res": {"reply": "hi"}}));
        let back: ApiReturn = serde_json::from_value(v).unwrap();
        assert_eq!(back, ret);
    }

    #[test]
    fn api_return_err_wire_shape() {
        let ret: ApiReturn = ApiReturn::Err(TsrpcError::api("boom").with_code("X"));
        let v = serde_json::to_value(&ret).unwrap();
        assert_eq!(
            v,
            json!({"isSucc": false, "err": {"message": "boom", "type": "ApiError", "code": "X"}})
        );
        let back: ApiReturn = serde_json::from_value(v).unwrap();
        assert_eq!(back, ret);
    }

    #[test]
    fn api_return_rejects_mismatched_shape() {
        assert!(serde_json::from_value::<ApiReturn>(json!({"isSucc": true})).is_err());
        assert!(serde_json::from_value::<ApiReturn>(json!({"isSucc": false})).is_err());
    }
}
