//! The two encodings of a [`TransportData`]: the binary box and the text box.
//!
//! Both are lossless round-trips of the envelope. Encode failures are local
//! (nothing reaches the wire); decode failures mean the peer sent a frame we
//! cannot understand, so they surface as `RemoteError`.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::TsrpcError;
use crate::proto::{ProtoInfo, Service, ServiceMap, TransportData, Validator};

const TYPE_REQ: u8 = 0;
const TYPE_RES: u8 = 1;
const TYPE_ERR: u8 = 2;
const TYPE_MSG: u8 = 3;
const TYPE_CUSTOM: u8 = 4;
const TYPE_HEARTBEAT: u8 = 5;
const TYPE_HANDSHAKE: u8 = 6;

/// Decode-failure message for a service the map cannot resolve.
pub const MSG_INVALID_SERVICE: &str = "Invalid service name";
/// Decode-failure message for a body the schema rejects.
pub const MSG_INVALID_BODY: &str = "Invalid body";

// ===== binary box =====

/// Encodes into the compact frame
/// `[service_id: varuint][type: u8][sn: varuint (req/res/err)][payload]`.
///
/// `err`, `custom` and lifecycle frames carry no service; their id field is
/// written as 0 and ignored on decode. `proto_info` is not part of the binary
/// box; transports that want it exchange it out of band.
pub fn encode_binary(
    data: &TransportData,
    map: &ServiceMap,
    validator: &dyn Validator,
) -> crate::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    match *data {
        TransportData::Req {
            ref service_name,
            sn,
            ref body,
            ..
        } => {
            let svc = map
                .api_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            let payload = validator
                .encode(body, &svc.req_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            put_varuint(&mut buf, svc.id as u64);
            buf.put_u8(TYPE_REQ);
            put_varuint(&mut buf, sn as u64);
            buf.extend_from_slice(&payload);
        }
        TransportData::Res {
            ref service_name,
            sn,
            ref body,
            ..
        } => {
            let svc = map
                .api_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            let payload = validator
                .encode(body, &svc.res_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            put_varuint(&mut buf, svc.id as u64);
            buf.put_u8(TYPE_RES);
            put_varuint(&mut buf, sn as u64);
            buf.extend_from_slice(&payload);
        }
        TransportData::Err { sn, ref err, .. } => {
            // The error shape is framework-defined, not schema-defined.
            let payload = serde_json::to_vec(err)
                .map_err(|e| TsrpcError::local(e.to_string()))?;
            put_varuint(&mut buf, 0);
            buf.put_u8(TYPE_ERR);
            put_varuint(&mut buf, sn as u64);
            buf.extend_from_slice(&payload);
        }
        TransportData::Msg {
            ref service_name,
            ref body,
        } => {
            let svc = map
                .msg_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            let payload = validator
                .encode(body, &svc.msg_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            put_varuint(&mut buf, svc.id as u64);
            buf.put_u8(TYPE_MSG);
            buf.extend_from_slice(&payload);
        }
        TransportData::Custom { buf: ref b } => {
            put_varuint(&mut buf, 0);
            buf.put_u8(TYPE_CUSTOM);
            buf.extend_from_slice(b);
        }
        TransportData::Heartbeat => {
            put_varuint(&mut buf, 0);
            buf.put_u8(TYPE_HEARTBEAT);
        }
        TransportData::Handshake => {
            put_varuint(&mut buf, 0);
            buf.put_u8(TYPE_HANDSHAKE);
        }
    }
    Ok(buf.freeze())
}

/// Decodes a binary box, resolving the service through the map.
pub fn decode_binary(
    buf: &[u8],
    map: &ServiceMap,
    validator: &dyn Validator,
) -> crate::Result<TransportData> {
    let mut rest = buf;
    let service_id = get_varuint(&mut rest)? as u32;
    let tag = get_u8(&mut rest)?;
    match tag {
        TYPE_REQ | TYPE_RES => {
            let sn = get_varuint(&mut rest)? as u32;
            let svc = match map.by_id(service_id) {
                Some(Service::Api(svc)) => svc.clone(),
                _ => return Err(TsrpcError::remote(MSG_INVALID_SERVICE)),
            };
            let schema = if tag == TYPE_REQ {
                &svc.req_schema_id
            } else {
                &svc.res_schema_id
            };
            let body = validator
                .decode(rest, schema)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e))?;
            Ok(if tag == TYPE_REQ {
                TransportData::Req {
                    service_name: svc.name.clone(),
                    sn,
                    body,
                    proto_info: None,
                }
            } else {
                TransportData::Res {
                    service_name: svc.name.clone(),
                    sn,
                    body,
                    proto_info: None,
                }
            })
        }
        TYPE_ERR => {
            let sn = get_varuint(&mut rest)? as u32;
            let err = serde_json::from_slice(rest)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e.to_string()))?;
            Ok(TransportData::Err {
                sn,
                err,
                proto_info: None,
            })
        }
        TYPE_MSG => {
            let svc = match map.by_id(service_id) {
                Some(Service::Msg(svc)) => svc.clone(),
                _ => return Err(TsrpcError::remote(MSG_INVALID_SERVICE)),
            };
            let body = validator
                .decode(rest, &svc.msg_schema_id)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e))?;
            Ok(TransportData::Msg {
                service_name: svc.name.clone(),
                body,
            })
        }
        TYPE_CUSTOM => Ok(TransportData::Custom {
            buf: Bytes::copy_from_slice(rest),
        }),
        TYPE_HEARTBEAT => Ok(TransportData::Heartbeat),
        TYPE_HANDSHAKE => Ok(TransportData::Handshake),
        _ => Err(TsrpcError::remote(format!("Unknown frame type: {}", tag))),
    }
}

// ===== text box =====

/// Encodes into the JSON envelope
/// `{"type", "serviceName", "sn", "body", "protoInfo"}`.
///
/// With `skip_sn` a `Req` collapses to its bare body; the transport must
/// then convey the service name and SN itself (URL path, sole in-flight
/// exchange). `skip_sn` is a property of the transport, never of a message.
pub fn encode_text(
    data: &TransportData,
    skip_sn: bool,
    map: &ServiceMap,
    validator: &dyn Validator,
) -> crate::Result<String> {
    let json = match *data {
        TransportData::Req {
            ref service_name,
            sn,
            ref body,
            ref proto_info,
        } => {
            let svc = map
                .api_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            validator
                .validate(body, &svc.req_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            if skip_sn {
                body.clone()
            } else {
                envelope("req", Some(service_name), Some(sn), Some(body), proto_info.as_ref(), None)
            }
        }
        TransportData::Res {
            ref service_name,
            sn,
            ref body,
            ref proto_info,
        } => {
            let svc = map
                .api_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            validator
                .validate(body, &svc.res_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            envelope("res", Some(service_name), Some(sn), Some(body), proto_info.as_ref(), None)
        }
        TransportData::Err {
            sn,
            ref err,
            ref proto_info,
        } => envelope("err", None, Some(sn), None, proto_info.as_ref(), Some(err)),
        TransportData::Msg {
            ref service_name,
            ref body,
        } => {
            let svc = map
                .msg_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(MSG_INVALID_SERVICE))?;
            validator
                .validate(body, &svc.msg_schema_id)
                .map_err(|e| TsrpcError::local(e))?;
            envelope("msg", Some(service_name), None, Some(body), None, None)
        }
        TransportData::Heartbeat => envelope("heartbeat", None, None, None, None, None),
        TransportData::Handshake => envelope("handshake", None, None, None, None, None),
        TransportData::Custom { .. } => {
            // Custom frames bypass the codec; the transport forwards them raw.
            return Err(TsrpcError::local("Custom data is not encodable as a text box"));
        }
    };
    serde_json::to_string(&json).map_err(|e| TsrpcError::local(e.to_string()))
}

fn envelope(
    kind: &str,
    service_name: Option<&str>,
    sn: Option<u32>,
    body: Option<&Value>,
    proto_info: Option<&ProtoInfo>,
    err: Option<&TsrpcError>,
) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("type".into(), kind.into());
    if let Some(name) = service_name {
        map.insert("serviceName".into(), name.into());
    }
    if let Some(sn) = sn {
        map.insert("sn".into(), sn.into());
    }
    if let Some(body) = body {
        map.insert("body".into(), body.clone());
    }
    if let Some(err) = err {
        map.insert("err".into(), serde_json::to_value(err).unwrap_or(Value::Null));
    }
    if let Some(info) = proto_info {
        map.insert(
            "protoInfo".into(),
            serde_json::to_value(info).unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}

/// Decodes a full text envelope (the non-`skip_sn` form).
pub fn decode_text(
    text: &str,
    map: &ServiceMap,
    validator: &dyn Validator,
) -> crate::Result<TransportData> {
    let v: Value = serde_json::from_str(text)
        .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e.to_string()))?;
    let kind = v
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))?;
    let proto_info = match v.get("protoInfo") {
        Some(info) => serde_json::from_value(info.clone()).ok(),
        None => None,
    };
    match kind {
        "req" | "res" => {
            let service_name = text_field_str(&v, "serviceName")?;
            let sn = text_field_sn(&v)?;
            let svc = map
                .api_by_name(&service_name)
                .ok_or_else(|| TsrpcError::remote(MSG_INVALID_SERVICE))?;
            let body = v
                .get("body")
                .cloned()
                .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))?;
            let schema = if kind == "req" {
                &svc.req_schema_id
            } else {
                &svc.res_schema_id
            };
            validator
                .validate(&body, schema)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e))?;
            Ok(if kind == "req" {
                TransportData::Req {
                    service_name,
                    sn,
                    body,
                    proto_info,
                }
            } else {
                TransportData::Res {
                    service_name,
                    sn,
                    body,
                    proto_info,
                }
            })
        }
        "err" => {
            let sn = text_field_sn(&v)?;
            let err = v
                .get("err")
                .cloned()
                .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))?;
            let err = serde_json::from_value(err)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e.to_string()))?;
            Ok(TransportData::Err {
                sn,
                err,
                proto_info,
            })
        }
        "msg" => {
            let service_name = text_field_str(&v, "serviceName")?;
            let svc = map
                .msg_by_name(&service_name)
                .ok_or_else(|| TsrpcError::remote(MSG_INVALID_SERVICE))?;
            let body = v
                .get("body")
                .cloned()
                .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))?;
            validator
                .validate(&body, &svc.msg_schema_id)
                .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e))?;
            Ok(TransportData::Msg { service_name, body })
        }
        "heartbeat" => Ok(TransportData::Heartbeat),
        "handshake" => Ok(TransportData::Handshake),
        other => Err(TsrpcError::remote(format!("Unknown frame type: {}", other))),
    }
}

/// Decodes the bare body of a `skip_sn` request against its service schema.
pub fn decode_text_body(
    text: &str,
    schema_id: &str,
    validator: &dyn Validator,
) -> crate::Result<Value> {
    let body: Value = serde_json::from_str(text)
        .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e.to_string()))?;
    validator
        .validate(&body, schema_id)
        .map_err(|e| TsrpcError::remote(MSG_INVALID_BODY).with_inner(e))?;
    Ok(body)
}

fn text_field_str(v: &Value, key: &str) -> crate::Result<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))
}

fn text_field_sn(v: &Value) -> crate::Result<u32> {
    v.get("sn")
        .and_then(Value::as_u64)
        .map(|sn| sn as u32)
        .ok_or_else(|| TsrpcError::remote(MSG_INVALID_BODY))
}

// ===== varuints =====

fn put_varuint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_varuint(rest: &mut &[u8]) -> crate::Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = get_u8(rest)?;
        if shift >= 64 {
            return Err(TsrpcError::remote("Malformed varuint"));
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

fn get_u8(rest: &mut &[u8]) -> crate::Result<u8> {
    if rest.is_empty() {
        return Err(TsrpcError::remote("Truncated frame"));
    }
    let byte = rest[0];
    *rest = &rest[1..];
    Ok(byte)
}
