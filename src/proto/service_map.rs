//! Service name and ID resolution.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TsrpcError;
use crate::proto::{ServiceDef, ServiceKind, ServiceProto, ServiceSide};

/// Which end of the wire this map was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSide {
    /// The serving end.
    Server,
    /// The calling end.
    Client,
}

/// A resolved API service with its derived schema IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiService {
    /// Unique numeric id.
    pub id: u32,
    /// Full service name.
    pub name: String,
    /// Schema id of the request body.
    pub req_schema_id: String,
    /// Schema id of the response body.
    pub res_schema_id: String,
}

/// A resolved message service with its derived schema ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgService {
    /// Unique numeric id.
    pub id: u32,
    /// Full service name.
    pub name: String,
    /// Schema id of the message body.
    pub msg_schema_id: String,
}

/// Either kind of resolved service, as found by ID lookup.
#[derive(Debug, Clone)]
pub enum Service {
    /// A request/response service.
    Api(Arc<ApiService>),
    /// A one-way message service.
    Msg(Arc<MsgService>),
}

/// O(1) lookups from service name or ID to the resolved service.
///
/// API services are additionally partitioned into `local` (this endpoint
/// implements them) and `remote` (the peer does), driven by each service's
/// declared side.
#[derive(Debug)]
pub struct ServiceMap {
    side: EndpointSide,
    by_id: HashMap<u32, Service>,
    api_by_name: HashMap<String, Arc<ApiService>>,
    msg_by_name: HashMap<String, Arc<MsgService>>,
    local_api: HashMap<String, Arc<ApiService>>,
    remote_api: HashMap<String, Arc<ApiService>>,
}

impl ServiceMap {
    /// Compiles a proto for one endpoint.
    ///
    /// Fails only if the proto contains duplicate service IDs.
    pub fn build(proto: &ServiceProto, side: EndpointSide) -> crate::Result<ServiceMap> {
        let mut map = ServiceMap {
            side,
            by_id: HashMap::with_capacity(proto.services.len()),
            api_by_name: HashMap::new(),
            msg_by_name: HashMap::new(),
            local_api: HashMap::new(),
            remote_api: HashMap::new(),
        };

        for def in &proto.services {
            if map.by_id.contains_key(&def.id) {
                return Err(TsrpcError::local(format!(
                    "Duplicate service ID: {}",
                    def.id
                )));
            }
            match def.kind {
                ServiceKind::Api => {
                    let svc = Arc::new(api_service(def));
                    map.by_id.insert(def.id, Service::Api(svc.clone()));
                    if is_local(def.side, side) {
                        map.local_api.insert(def.name.clone(), svc.clone());
                    }
                    if is_remote(def.side, side) {
                        map.remote_api.insert(def.name.clone(), svc.clone());
                    }
                    map.api_by_name.insert(def.name.clone(), svc);
                }
                ServiceKind::Msg => {
                    let svc = Arc::new(msg_service(def));
                    map.by_id.insert(def.id, Service::Msg(svc.clone()));
                    map.msg_by_name.insert(def.name.clone(), svc);
                }
            }
        }
        Ok(map)
    }

    /// Which end of the wire this map was built for.
    pub fn side(&self) -> EndpointSide {
        self.side
    }

    /// Looks a service up by numeric id.
    pub fn by_id(&self, id: u32) -> Option<&Service> {
        self.by_id.get(&id)
    }

    /// Looks an API service up by name.
    pub fn api_by_name(&self, name: &str) -> Option<&Arc<ApiService>> {
        self.api_by_name.get(name)
    }

    /// Looks a message service up by name.
    pub fn msg_by_name(&self, name: &str) -> Option<&Arc<MsgService>> {
        self.msg_by_name.get(name)
    }

    /// API services this endpoint implements.
    pub fn local_api(&self) -> impl Iterator<Item = &Arc<ApiService>> {
        self.local_api.values()
    }

    /// Whether this endpoint implements the named API.
    pub fn is_local_api(&self, name: &str) -> bool {
        self.local_api.contains_key(name)
    }

    /// API services the peer implements.
    pub fn remote_api(&self) -> impl Iterator<Item = &Arc<ApiService>> {
        self.remote_api.values()
    }
}

fn is_local(svc: ServiceSide, endpoint: EndpointSide) -> bool {
    match svc {
        ServiceSide::Both => true,
        ServiceSide::Server => endpoint == EndpointSide::Server,
        ServiceSide::Client => endpoint == EndpointSide::Client,
    }
}

fn is_remote(svc: ServiceSide, endpoint: EndpointSide) -> bool {
    match svc {
        ServiceSide::Both => true,
        ServiceSide::Server => endpoint == EndpointSide::Client,
        ServiceSide::Client => endpoint == EndpointSide::Server,
    }
}

// A service name is `(path/)?name`; schema IDs are derived from the two
// halves. `a/b/c/Test` yields path `a/b/c/` and short name `Test`.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('/') {
        Some(i) => name.split_at(i + 1),
        None => ("", name),
    }
}

fn api_service(def: &ServiceDef) -> ApiService {
    let (path, short) = split_name(&def.name);
    ApiService {
        id: def.id,
        name: def.name.clone(),
        req_schema_id: format!("{}Ptl{}/Req{}", path, short, short),
        res_schema_id: format!("{}Ptl{}/Res{}", path, short, short),
    }
}

fn msg_service(def: &ServiceDef) -> MsgService {
    let (path, short) = split_name(&def.name);
    MsgService {
        id: def.id,
        name: def.name.clone(),
        msg_schema_id: format!("{}Msg{}/Msg{}", path, short, short),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto() -> ServiceProto {
        serde_json::from_value(serde_json::json!({
            "services": [
                { "id": 0, "name": "Test", "type": "api" },
                { "id": 1, "name": "a/b/c/Test", "type": "api" },
                { "id": 2, "name": "Chat", "type": "msg" },
                { "id": 3, "name": "Echo", "type": "api", "side": "both" },
            ]
        }))
        .unwrap()
    }

    #[test]
    fn derives_schema_ids() {
        let map = ServiceMap::build(&proto(), EndpointSide::Server).unwrap();
        let svc = map.api_by_name("a/b/c/Test").unwrap();
        assert_eq!(svc.req_schema_id, "a/b/c/PtlTest/ReqTest");
        assert_eq!(svc.res_schema_id, "a/b/c/PtlTest/ResTest");
        let msg = map.msg_by_name("Chat").unwrap();
        assert_eq!(msg.msg_schema_id, "MsgChat/MsgChat");
    }

    #[test]
    fn partitions_by_side() {
        let server = ServiceMap::build(&proto(), EndpointSide::Server).unwrap();
        assert!(server.is_local_api("Test"));
        assert!(server.is_local_api("Echo"));
        assert_eq!(server.remote_api().count(), 1); // Echo is `both`

        let client = ServiceMap::build(&proto(), EndpointSide::Client).unwrap();
        assert!(!client.is_local_api("Test"));
        assert!(client.is_local_api("Echo"));
        assert_eq!(client.remote_api().count(), 3);
    }

    #[test]
    fn lookup_by_id() {
        let map = ServiceMap::build(&proto(), EndpointSide::Server).unwrap();
        match map.by_id(2) {
            Some(Service::Msg(m)) => assert_eq!(m.name, "Chat"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(map.by_id(99).is_none());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let proto: ServiceProto = serde_json::from_value(serde_json::json!({
            "services": [
                { "id": 1, "name": "A", "type": "api" },
                { "id": 1, "name": "B", "type": "api" },
            ]
        }))
        .unwrap();
        assert!(ServiceMap::build(&proto, EndpointSide::Server).is_err());
    }
}
