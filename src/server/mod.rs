//! HTTP server endpoint.
//!
//! The server owns a set of connections (over HTTP: one transient
//! connection per inbound request), a handler map shared by all of them,
//! and the server-side interceptor pipelines. Stopping is two-phase:
//! a graceful stop drains in-flight API calls up to a time bound before
//! the hard stop tears the transport down.

mod call;
pub mod conn;
mod msg;

pub use self::call::ApiCall;
pub use self::conn::{Conn, ConnState};
pub use self::msg::MsgCall;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::{Method, StatusCode};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::log::{LogLevel, Logger};
use crate::common::Counter;
use crate::error::{codes, TsrpcError};
use crate::flow::Flow;
use crate::http::{
    read_request, write_response, ReqHead, CONTENT_TYPE_BUFFER, CONTENT_TYPE_TEXT,
    HEADER_DATA_TYPE, HEADER_PROTO_INFO,
};
use crate::proto::codec;
use crate::proto::{
    ApiReturn, ApiService, DataType, EncodedData, EndpointSide, JsonValidator, ProtoInfo,
    ServiceMap, ServiceProto, TransportData, Validator,
};

use self::conn::{ConnSink, HttpSink};
use self::msg::MsgListeners;

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not running; the only state a start is accepted from.
    Stopped,
    /// Binding the transport.
    Starting,
    /// Accepting and serving.
    Started,
    /// Draining in-flight calls before the hard stop.
    Stopping,
}

/// Errors a handler may bubble up instead of calling
/// [`ApiCall::error`] itself. A `TsrpcError` inside the box reaches the
/// caller verbatim; anything else is wrapped as `ServerError/INTERNAL_ERR`.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// A registered API handler.
pub type ApiHandler =
    Arc<dyn Fn(ApiCall) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Pluggable serializer for text-mode returns.
pub type EncodeReturnText = Arc<dyn Fn(&ApiReturn) -> Result<String, String> + Send + Sync>;

/// Resolves an API name to its handler, however handlers are stored
/// (a directory of modules, a static table, ...).
pub trait HandlerLoader: Send + Sync + 'static {
    /// Produces the handler for one API, or an error if it cannot be found.
    fn load(&self, api_name: &str) -> crate::Result<ApiHandler>;
}

/// When [`HttpServer::auto_implement_api`] materializes each handler.
#[derive(Debug, Clone, Copy)]
pub enum AutoImplementPolicy {
    /// Load every handler now.
    Eager,
    /// Install stubs that load on first invocation.
    Lazy,
    /// Load in the background after this delay.
    After(Duration),
}

/// Per-service outcomes of [`HttpServer::auto_implement_api`].
#[derive(Debug, Default)]
pub struct AutoImplementResult {
    /// Services whose handler loaded and registered.
    pub succ: Vec<String>,
    /// Services whose eager load failed (a stub answers for them).
    pub fail: Vec<(String, TsrpcError)>,
    /// Services registered for lazy or delayed loading.
    pub delay: Vec<String>,
}

// ===== flow payloads =====

/// Payload of the `post_connect` stage.
#[derive(Debug)]
pub struct ConnFlow {
    /// The connection that just came up.
    pub conn: Arc<Conn>,
}

/// Payload of the `post_disconnect` stage.
#[derive(Debug)]
pub struct DisconnectFlow {
    /// The connection that went down.
    pub conn: Arc<Conn>,
    /// Why, when known.
    pub reason: Option<String>,
    /// Whether this side initiated the disconnect.
    pub is_manual: bool,
}

/// Payload of the `pre_api_call` stage.
#[derive(Debug)]
pub struct ApiCallFlow {
    /// The inbound call about to reach its handler.
    pub call: ApiCall,
}

/// Payload of the `pre_api_call_return` stage.
#[derive(Debug)]
pub struct ApiCallReturnFlow {
    /// The call being answered.
    pub call: ApiCall,
    /// The return about to be sent; nodes may rewrite it.
    pub ret: ApiReturn,
}

/// Payload of the `pre_recv_msg` / `pre_send_msg` stages.
#[derive(Debug)]
pub struct MsgFlow {
    /// The message service.
    pub msg_name: String,
    /// Message body; nodes may rewrite it.
    pub msg: Value,
    /// The connection it arrived on (or is headed to).
    pub conn: Arc<Conn>,
}

/// Payload of the `pre_send_data` / `post_send_data` stages. For a
/// broadcast, `conns` holds the whole same-encoding partition.
#[derive(Debug)]
pub struct ServerSendDataFlow {
    /// The encoded frame about to hit (or just off) the wire.
    pub data: EncodedData,
    /// The envelope the frame was encoded from.
    pub transport_data: TransportData,
    /// The target connections.
    pub conns: Vec<Arc<Conn>>,
}

/// Payload of the `pre_recv_data` stage.
#[derive(Debug)]
pub struct ServerRecvDataFlow {
    /// The raw frame as the transport delivered it.
    pub data: EncodedData,
    /// The connection it arrived on.
    pub conn: Arc<Conn>,
}

/// Payload of the `pre_broadcast_msg` stage.
#[derive(Debug)]
pub struct BroadcastMsgFlow {
    /// The message service.
    pub msg_name: String,
    /// Message body; nodes may rewrite it.
    pub msg: Value,
    /// The fan-out targets; nodes may narrow them.
    pub conns: Vec<Arc<Conn>>,
}

/// The server-side interceptor pipelines.
#[derive(Debug)]
pub struct ServerFlows {
    /// After a connection transitions to `Connected`.
    pub post_connect: Flow<ConnFlow>,
    /// After a connection transitions to `Disconnected`.
    pub post_disconnect: Flow<DisconnectFlow>,
    /// Before an inbound call reaches its handler.
    pub pre_api_call: Flow<ApiCallFlow>,
    /// Before a settled return is encoded and sent.
    pub pre_api_call_return: Flow<ApiCallReturnFlow>,
    /// Before an inbound message reaches the listeners.
    pub pre_recv_msg: Flow<MsgFlow>,
    /// Before an outbound message is encoded (single-target sends).
    pub pre_send_msg: Flow<MsgFlow>,
    /// Before raw bytes are handed to a connection (once per broadcast
    /// partition).
    pub pre_send_data: Flow<ServerSendDataFlow>,
    /// After raw bytes were handed to a connection.
    pub post_send_data: Flow<ServerSendDataFlow>,
    /// After the transport delivered raw bytes, before decoding.
    pub pre_recv_data: Flow<ServerRecvDataFlow>,
    /// Before a broadcast fans out.
    pub pre_broadcast_msg: Flow<BroadcastMsgFlow>,
}

impl ServerFlows {
    fn new() -> ServerFlows {
        ServerFlows {
            post_connect: Flow::new("postConnect"),
            post_disconnect: Flow::new("postDisconnect"),
            pre_api_call: Flow::new("preApiCall"),
            pre_api_call_return: Flow::new("preApiCallReturn"),
            pre_recv_msg: Flow::new("preRecvMsg"),
            pre_send_msg: Flow::new("preSendMsg"),
            pre_send_data: Flow::new("preSendData"),
            post_send_data: Flow::new("postSendData"),
            pre_recv_data: Flow::new("preRecvData"),
            pre_broadcast_msg: Flow::new("preBroadcastMsg"),
        }
    }
}

// ===== impl HttpServer =====

/// An RPC server over HTTP.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HttpServer {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) options: ServerOptions,
    pub(crate) service_map: ServiceMap,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) flows: ServerFlows,
    pub(crate) api_handlers: RwLock<HashMap<String, ApiHandler>>,
    pub(crate) msg_listeners: MsgListeners,
    pub(crate) conns: Mutex<HashMap<u32, Arc<Conn>>>,
    pub(crate) conn_ids: Counter,
    pub(crate) pending_api_calls: AtomicUsize,
    drain: Notify,
    store: Mutex<StateStore>,
    pub(crate) logger: Logger,
}

pub(crate) struct ServerOptions {
    pub(crate) port: u16,
    pub(crate) json_host_path: String,
    pub(crate) default_data_type: DataType,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) cors: Option<String>,
    pub(crate) cors_max_age: u32,
    pub(crate) encode_return_text: Option<EncodeReturnText>,
    pub(crate) return_inner_error: bool,
    pub(crate) api_call_timeout: Option<Duration>,
    pub(crate) proto_info: Option<ProtoInfo>,
}

struct StateStore {
    state: ServerState,
    accept: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl HttpServer {
    /// Creates a server with default options on port 3000.
    pub fn new(proto: &ServiceProto) -> crate::Result<HttpServer> {
        HttpServer::builder().build(proto)
    }

    /// Configure a server.
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    /// The server-side interceptor pipelines.
    pub fn flows(&self) -> &ServerFlows {
        &self.inner.flows
    }

    /// The server's log handle.
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// The bound address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.store.lock().unwrap().local_addr
    }

    /// API calls currently being handled.
    pub fn pending_api_calls(&self) -> usize {
        self.inner.pending_api_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of the live connections.
    pub fn conns(&self) -> Vec<Arc<Conn>> {
        self.inner.conns.lock().unwrap().values().cloned().collect()
    }

    /// Registers (or replaces) the handler for an API.
    pub fn implement_api<F, Fut>(&self, api_name: &str, handler: F)
    where
        F: Fn(ApiCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: ApiHandler = Arc::new(move |call| handler(call).boxed());
        self.set_handler(api_name, handler);
    }

    fn set_handler(&self, api_name: &str, handler: ApiHandler) {
        let replaced = self
            .inner
            .api_handlers
            .write()
            .unwrap()
            .insert(api_name.to_owned(), handler)
            .is_some();
        if replaced {
            self.inner
                .logger
                .warn(format_args!("Handler replaced: {}", api_name));
        }
    }

    /// Asks the loader for a handler for every API this endpoint serves.
    ///
    /// `Lazy` installs stubs that load on first invocation; `After` loads in
    /// the background once the delay elapses; both report those services
    /// under `delay`. A failed eager load installs a stub that answers
    /// `ServerError/NOT_IMPLEMENTED`.
    pub fn auto_implement_api(
        &self,
        loader: Arc<dyn HandlerLoader>,
        policy: AutoImplementPolicy,
    ) -> AutoImplementResult {
        let mut result = AutoImplementResult::default();
        let mut names: Vec<String> = self
            .inner
            .service_map
            .local_api()
            .map(|svc| svc.name.clone())
            .collect();
        names.sort();

        for name in names {
            match policy {
                AutoImplementPolicy::Eager => match loader.load(&name) {
                    Ok(handler) => {
                        self.set_handler(&name, handler);
                        result.succ.push(name);
                    }
                    Err(err) => {
                        self.inner.logger.error(format_args!(
                            "Failed to load handler for {}: {}",
                            name, err
                        ));
                        self.set_handler(&name, not_implemented_stub());
                        result.fail.push((name, err));
                    }
                },
                AutoImplementPolicy::Lazy => {
                    self.set_handler(&name, self.lazy_stub(&name, loader.clone()));
                    result.delay.push(name);
                }
                AutoImplementPolicy::After(delay) => {
                    let inner = self.inner.clone();
                    let loader = loader.clone();
                    let task_name = name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let handler = loader.load(&task_name).unwrap_or_else(|err| {
                            inner.logger.error(format_args!(
                                "Failed to load handler for {}: {}",
                                task_name, err
                            ));
                            not_implemented_stub()
                        });
                        inner
                            .api_handlers
                            .write()
                            .unwrap()
                            .insert(task_name, handler);
                    });
                    result.delay.push(name);
                }
            }
        }
        result
    }

    fn lazy_stub(&self, api_name: &str, loader: Arc<dyn HandlerLoader>) -> ApiHandler {
        let weak = Arc::downgrade(&self.inner);
        let api_name = api_name.to_owned();
        Arc::new(move |call: ApiCall| {
            let weak = weak.clone();
            let loader = loader.clone();
            let api_name = api_name.clone();
            async move {
                match loader.load(&api_name) {
                    Ok(handler) => {
                        if let Some(inner) = weak.upgrade() {
                            inner
                                .api_handlers
                                .write()
                                .unwrap()
                                .insert(api_name, handler.clone());
                        }
                        handler(call).await
                    }
                    Err(err) => {
                        call.logger()
                            .error(format_args!("Failed to load handler: {}", err));
                        call.error(
                            TsrpcError::server("API not implemented")
                                .with_code(codes::NOT_IMPLEMENTED),
                        )
                        .await;
                        Ok(())
                    }
                }
            }
            .boxed()
        })
    }

    /// Registers a message listener; the returned id removes it again.
    pub fn on_msg<F>(&self, msg_name: &str, listener: F) -> u32
    where
        F: Fn(MsgCall) + Send + Sync + 'static,
    {
        self.inner.msg_listeners.on(msg_name, false, Arc::new(listener))
    }

    /// Like [`on_msg`](HttpServer::on_msg), removed after the first message.
    pub fn once_msg<F>(&self, msg_name: &str, listener: F) -> u32
    where
        F: Fn(MsgCall) + Send + Sync + 'static,
    {
        self.inner.msg_listeners.on(msg_name, true, Arc::new(listener))
    }

    /// Removes one listener by id.
    pub fn off_msg_listener(&self, msg_name: &str, id: u32) {
        self.inner.msg_listeners.off(msg_name, id);
    }

    /// Removes every listener for a name.
    pub fn off_msg(&self, msg_name: &str) {
        self.inner.msg_listeners.off_all(msg_name);
    }

    /// Binds and starts accepting. Requires state `Stopped`.
    pub async fn start(&self) -> crate::Result<SocketAddr> {
        {
            let mut store = self.inner.store.lock().unwrap();
            if store.state != ServerState::Stopped {
                return Err(TsrpcError::server("Server is already started"));
            }
            store.state = ServerState::Starting;
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.inner.options.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.store.lock().unwrap().state = ServerState::Stopped;
                return Err(TsrpcError::network(format!("Failed to bind: {}", e)));
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.store.lock().unwrap().state = ServerState::Stopped;
                return Err(TsrpcError::network(format!("Failed to bind: {}", e)));
            }
        };

        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener));
        {
            let mut store = self.inner.store.lock().unwrap();
            store.state = ServerState::Started;
            store.accept = Some(accept);
            store.local_addr = Some(addr);
        }
        self.inner
            .logger
            .log(format_args!("Server started at {}", addr));
        Ok(addr)
    }

    /// Stops the server.
    ///
    /// With a grace window, waits for in-flight API calls to drain (or the
    /// window to elapse) before the hard stop; without one, tears down
    /// immediately. Either way remaining connections are force-disconnected
    /// with reason `"Server stopped"`.
    pub async fn stop(&self, graceful_wait: Option<Duration>) -> crate::Result<()> {
        {
            let mut store = self.inner.store.lock().unwrap();
            if store.state != ServerState::Started {
                return Err(TsrpcError::server("Server is not started"));
            }
            store.state = ServerState::Stopping;
        }

        if let Some(grace) = graceful_wait.filter(|g| *g > Duration::from_millis(0)) {
            self.inner.logger.log(format_args!(
                "Stopping gracefully, waiting up to {:?} for {} in-flight calls",
                grace,
                self.pending_api_calls()
            ));
            for conn in self.conns() {
                conn.advance(ConnState::Disconnecting);
            }
            let _ = tokio::time::timeout(grace, self.inner.drained()).await;
        }

        let accept = self.inner.store.lock().unwrap().accept.take();
        if let Some(accept) = accept {
            accept.abort();
        }

        let remaining: Vec<Arc<Conn>> = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in remaining {
            conn.advance(ConnState::Disconnected);
            conn.close_sink();
            let flow = DisconnectFlow {
                conn: conn.clone(),
                reason: Some("Server stopped".to_owned()),
                is_manual: true,
            };
            let _ = self
                .inner
                .flows
                .post_disconnect
                .exec(flow, conn.logger())
                .await;
        }

        {
            let mut store = self.inner.store.lock().unwrap();
            store.state = ServerState::Stopped;
            store.local_addr = None;
        }
        self.inner.logger.log(format_args!("Server stopped"));
        Ok(())
    }

    /// Pushes one message to one connection (duplex transports only).
    pub async fn send_msg(
        &self,
        conn: &Arc<Conn>,
        msg_name: &str,
        msg: Value,
    ) -> Option<crate::Result<()>> {
        let inner = &self.inner;
        let flow = MsgFlow {
            msg_name: msg_name.to_owned(),
            msg,
            conn: conn.clone(),
        };
        let flow = inner.flows.pre_send_msg.exec(flow, conn.logger()).await?;
        if !conn.supports_push() {
            return Some(Err(TsrpcError::local(
                "Connection does not support server-pushed messages",
            )));
        }
        let data = TransportData::Msg {
            service_name: flow.msg_name,
            body: flow.msg,
        };
        let encoded = match inner.encode_outgoing(conn.data_type(), &data) {
            Ok(encoded) => encoded,
            Err(err) => return Some(Err(err)),
        };
        Some(inner.send_data(conn, encoded, data).await)
    }

    /// Broadcasts one message to many connections.
    ///
    /// Targets default to every live connection. They are partitioned by
    /// encoding, the body is encoded once per partition (never once per
    /// connection), and `pre_send_data` runs once per partition. Succeeds
    /// only if every per-connection send succeeded.
    pub async fn broadcast_msg(
        &self,
        msg_name: &str,
        msg: Value,
        conns: Option<Vec<Arc<Conn>>>,
    ) -> Option<crate::Result<()>> {
        let inner = &self.inner;
        if inner.state() != ServerState::Started {
            return Some(Err(TsrpcError::server("Server is not started")));
        }
        let targets = conns.unwrap_or_else(|| self.conns());
        let flow = BroadcastMsgFlow {
            msg_name: msg_name.to_owned(),
            msg,
            conns: targets,
        };
        let flow = inner
            .flows
            .pre_broadcast_msg
            .exec(flow, &inner.logger)
            .await?;
        let BroadcastMsgFlow {
            msg_name,
            msg,
            conns: targets,
        } = flow;

        let data = TransportData::Msg {
            service_name: msg_name,
            body: msg,
        };
        let mut partitions: Vec<(DataType, Vec<Arc<Conn>>)> =
            vec![(DataType::Text, Vec::new()), (DataType::Buffer, Vec::new())];
        for conn in targets {
            match conn.data_type() {
                DataType::Text => partitions[0].1.push(conn),
                DataType::Buffer => partitions[1].1.push(conn),
            }
        }

        let mut failures: Vec<String> = Vec::new();
        for (data_type, part) in partitions {
            if part.is_empty() {
                continue;
            }
            let encoded = match inner.encode_outgoing(data_type, &data) {
                Ok(encoded) => encoded,
                Err(err) => return Some(Err(err)),
            };
            let flow = ServerSendDataFlow {
                data: encoded,
                transport_data: data.clone(),
                conns: part.clone(),
            };
            let flow = match inner.flows.pre_send_data.exec(flow, &inner.logger).await {
                Some(flow) => flow,
                None => continue,
            };
            for conn in &part {
                let sent = if conn.supports_push() {
                    conn.send_data(flow.data.clone())
                } else {
                    Err(TsrpcError::local(
                        "Connection does not support server-pushed messages",
                    ))
                };
                if let Err(err) = sent {
                    failures.push(format!("#{}: {}", conn.id(), err));
                }
            }
            let _ = inner.flows.post_send_data.exec(flow, &inner.logger).await;
        }

        Some(if failures.is_empty() {
            Ok(())
        } else {
            Err(TsrpcError::server(format!(
                "Broadcast failed for some connections: {}",
                failures.join("; ")
            )))
        })
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn not_implemented_stub() -> ApiHandler {
    Arc::new(|call: ApiCall| {
        async move {
            call.error(
                TsrpcError::server("API not implemented").with_code(codes::NOT_IMPLEMENTED),
            )
            .await;
            Ok(())
        }
        .boxed()
    })
}

// ===== impl ServerInner =====

impl ServerInner {
    pub(crate) fn state(&self) -> ServerState {
        self.store.lock().unwrap().state
    }

    pub(crate) fn dec_pending(&self) {
        if self.pending_api_calls.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drain.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.drain.notified();
            if self.pending_api_calls.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn internal_error(&self, inner_msg: String) -> TsrpcError {
        let err = TsrpcError::server("Internal Server Error").with_code(codes::INTERNAL_ERR);
        if self.options.return_inner_error {
            err.with_inner(inner_msg)
        } else {
            err
        }
    }

    fn service_name_from_path(&self, path: &str) -> String {
        let path = path.split('?').next().unwrap_or(path);
        let base = &self.options.json_host_path;
        let rest = if path.starts_with(base.as_str()) {
            &path[base.len()..]
        } else {
            path
        };
        rest.trim_start_matches('/').to_owned()
    }

    fn base_response_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(ref cors) = self.options.cors {
            headers.push(("Access-Control-Allow-Origin".to_owned(), cors.clone()));
        }
        if let Some(ref info) = self.options.proto_info {
            if let Ok(json) = serde_json::to_string(info) {
                headers.push((HEADER_PROTO_INFO.to_owned(), json));
            }
        }
        headers
    }

    fn preflight_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.base_response_headers();
        if self.options.cors.is_some() {
            headers.push((
                "Access-Control-Allow-Methods".to_owned(),
                "GET, POST, OPTIONS".to_owned(),
            ));
            headers.push((
                "Access-Control-Allow-Headers".to_owned(),
                format!("Content-Type, {}, {}", HEADER_DATA_TYPE, HEADER_PROTO_INFO),
            ));
            headers.push((
                "Access-Control-Max-Age".to_owned(),
                self.options.cors_max_age.to_string(),
            ));
        }
        headers
    }

    /// Validates a success body against its response schema; a failing body
    /// is replaced by an internal error so nothing unschema'd hits the wire.
    fn sanitize_return(&self, service: Option<&Arc<ApiService>>, ret: ApiReturn) -> ApiReturn {
        if let (ApiReturn::Succ(ref res), Some(svc)) = (&ret, service) {
            if let Err(e) = self.validator.validate(res, &svc.res_schema_id) {
                return ApiReturn::Err(self.internal_error(e));
            }
        }
        ret
    }

    fn encode_return(
        &self,
        data_type: DataType,
        service: Option<&Arc<ApiService>>,
        sn: u32,
        ret: &ApiReturn,
    ) -> crate::Result<(EncodedData, TransportData)> {
        let transport_data = match *ret {
            ApiReturn::Succ(ref res) => TransportData::Res {
                service_name: service.map(|s| s.name.clone()).unwrap_or_default(),
                sn,
                body: res.clone(),
                proto_info: None,
            },
            ApiReturn::Err(ref err) => TransportData::Err {
                sn,
                err: err.clone(),
                proto_info: None,
            },
        };
        match data_type {
            DataType::Text => {
                let text = match self.options.encode_return_text {
                    Some(ref encode) => encode(ret).map_err(TsrpcError::local)?,
                    None => serde_json::to_string(ret)
                        .map_err(|e| TsrpcError::local(e.to_string()))?,
                };
                Ok((EncodedData::Text(text), transport_data))
            }
            DataType::Buffer => {
                match codec::encode_binary(&transport_data, &self.service_map, &*self.validator)
                {
                    Ok(buf) => Ok((EncodedData::Buffer(buf), transport_data)),
                    Err(encode_err) if ret.is_succ() => {
                        // Degrade to an error frame the caller can still parse.
                        let err = self.internal_error(encode_err.to_string());
                        let transport_data = TransportData::Err {
                            sn,
                            err,
                            proto_info: None,
                        };
                        let buf = codec::encode_binary(
                            &transport_data,
                            &self.service_map,
                            &*self.validator,
                        )?;
                        Ok((EncodedData::Buffer(buf), transport_data))
                    }
                    Err(encode_err) => Err(encode_err),
                }
            }
        }
    }

    pub(crate) async fn send_return(
        &self,
        conn: &Arc<Conn>,
        service: &Arc<ApiService>,
        sn: u32,
        ret: ApiReturn,
    ) -> crate::Result<()> {
        let ret = self.sanitize_return(Some(service), ret);
        let (data, transport_data) = self.encode_return(conn.data_type(), Some(service), sn, &ret)?;
        self.send_data(conn, data, transport_data).await
    }

    /// Sends an error return outside any `ApiCall` (decode failures and
    /// other pre-dispatch rejections).
    async fn send_detached_error(&self, conn: &Arc<Conn>, sn: u32, err: TsrpcError) {
        conn.logger().warn(format_args!("{}", err));
        let ret = ApiReturn::Err(err);
        match self.encode_return(conn.data_type(), None, sn, &ret) {
            Ok((data, transport_data)) => {
                let _ = self.send_data(conn, data, transport_data).await;
            }
            Err(e) => {
                conn.logger()
                    .error(format_args!("Failed to encode error return: {}", e));
                conn.close_sink();
            }
        }
    }

    fn encode_outgoing(
        &self,
        data_type: DataType,
        data: &TransportData,
    ) -> crate::Result<EncodedData> {
        match data_type {
            DataType::Text => codec::encode_text(data, false, &self.service_map, &*self.validator)
                .map(EncodedData::Text),
            DataType::Buffer => codec::encode_binary(data, &self.service_map, &*self.validator)
                .map(EncodedData::Buffer),
        }
    }

    pub(crate) async fn send_data(
        &self,
        conn: &Arc<Conn>,
        data: EncodedData,
        transport_data: TransportData,
    ) -> crate::Result<()> {
        let flow = ServerSendDataFlow {
            data,
            transport_data,
            conns: vec![conn.clone()],
        };
        let flow = match self.flows.pre_send_data.exec(flow, conn.logger()).await {
            Some(flow) => flow,
            None => {
                conn.close_sink();
                return Ok(());
            }
        };
        conn.send_data(flow.data.clone())?;
        let _ = self.flows.post_send_data.exec(flow, conn.logger()).await;
        Ok(())
    }

    /// Acknowledges a one-way exchange (messages, custom frames) with an
    /// empty 200. Not protocol data, so it bypasses the data flows.
    fn send_empty_ack(&self, conn: &Arc<Conn>) {
        let _ = conn.send_data(EncodedData::Text(String::new()));
    }
}

// ===== the accept / serve path =====

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_socket(&inner, socket, peer).await {
                        // Never let one bad socket take the loop down.
                        inner
                            .logger
                            .warn(format_args!("Connection {} failed: {}", peer, err));
                    }
                });
            }
            Err(e) => {
                inner.logger.error(format_args!("Accept failed: {}", e));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_socket(
    inner: &Arc<ServerInner>,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> crate::Result<()> {
    let mut buf = bytes::BytesMut::with_capacity(4096);
    loop {
        let read = tokio::time::timeout(
            inner.options.keep_alive_timeout,
            read_request(&mut socket, &mut buf),
        )
        .await;
        let (head, body) = match read {
            Err(_) => break, // idle keep-alive expired
            Ok(Ok(None)) => break,
            Ok(Ok(Some(req))) => req,
            Ok(Err(err)) => {
                inner
                    .logger
                    .debug(format_args!("Dropping {}: {}", peer, err));
                break;
            }
        };
        let keep_alive = head.keep_alive();

        if head.method == Method::OPTIONS {
            let headers = inner.preflight_headers();
            write_response(
                &mut socket,
                StatusCode::OK,
                CONTENT_TYPE_TEXT,
                &headers,
                keep_alive,
                b"",
            )
            .await?;
            if keep_alive {
                continue;
            }
            break;
        }

        let data_type = match head.header("content-type") {
            Some(ct) if ct.starts_with(CONTENT_TYPE_BUFFER) => DataType::Buffer,
            Some(ct) if ct.starts_with(CONTENT_TYPE_TEXT) => DataType::Text,
            _ => inner.options.default_data_type,
        };
        let (sink, response_rx) = HttpSink::new();
        let conn_id = inner.conn_ids.next();
        let logger = inner.logger.with_suffix(&format!("#{}", conn_id));
        let sink: Box<dyn ConnSink> = Box::new(sink);
        let conn = Arc::new(Conn::new(conn_id, Some(peer), data_type, sink, logger));
        inner.conns.lock().unwrap().insert(conn_id, conn.clone());
        let flow = ConnFlow { conn: conn.clone() };
        let _ = inner.flows.post_connect.exec(flow, conn.logger()).await;

        dispatch(inner, conn.clone(), &head, body).await;

        let outcome = match response_rx.await {
            Ok(data) => {
                let headers = inner.base_response_headers();
                let (content_type, payload): (&str, &[u8]) = match data {
                    EncodedData::Text(ref s) => (CONTENT_TYPE_TEXT, s.as_bytes()),
                    EncodedData::Buffer(ref b) => (CONTENT_TYPE_BUFFER, &b[..]),
                };
                let write = write_response(
                    &mut socket,
                    StatusCode::OK,
                    content_type,
                    &headers,
                    keep_alive,
                    payload,
                );
                match inner.options.socket_timeout {
                    Some(limit) => tokio::time::timeout(limit, write).await.unwrap_or_else(|_| {
                        Err(TsrpcError::network("Socket timeout").with_code(codes::TIMEOUT))
                    }),
                    None => write.await,
                }
            }
            // Sink closed without a frame: the exchange ends with no
            // response at all (aborted by an interceptor).
            Err(_) => Err(TsrpcError::network("Exchange closed without response")),
        };

        remove_conn(inner, &conn, None, false).await;
        if outcome.is_err() || !keep_alive {
            break;
        }
    }
    Ok(())
}

async fn remove_conn(
    inner: &Arc<ServerInner>,
    conn: &Arc<Conn>,
    reason: Option<String>,
    is_manual: bool,
) {
    if inner.conns.lock().unwrap().remove(&conn.id()).is_some() {
        conn.advance(ConnState::Disconnected);
        let flow = DisconnectFlow {
            conn: conn.clone(),
            reason,
            is_manual,
        };
        let _ = inner.flows.post_disconnect.exec(flow, conn.logger()).await;
    }
}

async fn dispatch(inner: &Arc<ServerInner>, conn: Arc<Conn>, head: &ReqHead, body: Bytes) {
    let raw = match conn.data_type() {
        DataType::Text => match String::from_utf8(body.to_vec()) {
            Ok(s) => EncodedData::Text(s),
            Err(_) => {
                inner
                    .send_detached_error(
                        &conn,
                        0,
                        TsrpcError::remote(codec::MSG_INVALID_BODY).with_inner("not UTF-8"),
                    )
                    .await;
                return;
            }
        },
        DataType::Buffer => EncodedData::Buffer(body),
    };

    let flow = ServerRecvDataFlow {
        data: raw,
        conn: conn.clone(),
    };
    let flow = match inner.flows.pre_recv_data.exec(flow, conn.logger()).await {
        Some(flow) => flow,
        None => {
            conn.close_sink();
            return;
        }
    };
    let raw = flow.data;

    if let Some(raw_info) = head.header("x-tsrpc-proto-info") {
        match serde_json::from_str::<ProtoInfo>(raw_info) {
            Ok(info) => {
                if let Some(ref own) = inner.options.proto_info {
                    if own.is_skewed_from(&info) {
                        conn.logger().warn(format_args!(
                            "Remote schema differs from local (md5 {:?} vs {:?})",
                            own.md5, info.md5
                        ));
                    }
                }
            }
            Err(e) => {
                conn.logger()
                    .warn(format_args!("Invalid {} header: {}", HEADER_PROTO_INFO, e));
            }
        }
    }

    match head.header("x-tsrpc-data-type") {
        Some("custom") => {
            // User-defined frame: the flow above is the interception point;
            // the core neither parses nor validates it.
            conn.logger()
                .debug(format_args!("[RecvData] custom frame ({} bytes)", raw.len()));
            inner.send_empty_ack(&conn);
            return;
        }
        Some("msg") => {
            dispatch_msg(inner, conn, head, raw).await;
            return;
        }
        _ => {}
    }

    if inner.state() != ServerState::Started {
        inner
            .send_detached_error(&conn, 0, TsrpcError::server("Server is not started"))
            .await;
        return;
    }

    match raw {
        EncodedData::Text(text) => {
            let name = inner.service_name_from_path(&head.path);
            let service = match inner.service_map.api_by_name(&name) {
                Some(svc) if inner.service_map.is_local_api(&name) => svc.clone(),
                _ => {
                    inner
                        .send_detached_error(
                            &conn,
                            0,
                            TsrpcError::remote(codec::MSG_INVALID_SERVICE),
                        )
                        .await;
                    return;
                }
            };
            let req = match codec::decode_text_body(
                &text,
                &service.req_schema_id,
                &*inner.validator,
            ) {
                Ok(req) => req,
                Err(err) => {
                    inner.send_detached_error(&conn, 0, err).await;
                    return;
                }
            };
            // Text over HTTP skips the SN; the sole call of this exchange
            // gets the connection-local serial 1.
            dispatch_api(inner, conn, service, 1, req).await;
        }
        EncodedData::Buffer(buf) => {
            match codec::decode_binary(&buf, &inner.service_map, &*inner.validator) {
                Ok(TransportData::Req {
                    service_name,
                    sn,
                    body,
                    ..
                }) => {
                    let service = match inner.service_map.api_by_name(&service_name) {
                        Some(svc) if inner.service_map.is_local_api(&service_name) => svc.clone(),
                        _ => {
                            inner
                                .send_detached_error(
                                    &conn,
                                    sn,
                                    TsrpcError::remote(codec::MSG_INVALID_SERVICE),
                                )
                                .await;
                            return;
                        }
                    };
                    dispatch_api(inner, conn, service, sn, body).await;
                }
                Ok(TransportData::Msg { service_name, body }) => {
                    handle_msg(inner, conn, service_name, body).await;
                }
                Ok(other) => {
                    inner
                        .send_detached_error(
                            &conn,
                            other.sn().unwrap_or(0),
                            TsrpcError::remote("Unexpected frame"),
                        )
                        .await;
                }
                Err(err) => {
                    inner.send_detached_error(&conn, 0, err).await;
                }
            }
        }
    }
}

async fn dispatch_msg(inner: &Arc<ServerInner>, conn: Arc<Conn>, head: &ReqHead, raw: EncodedData) {
    match raw {
        EncodedData::Text(text) => {
            let name = inner.service_name_from_path(&head.path);
            let service = match inner.service_map.msg_by_name(&name) {
                Some(svc) => svc.clone(),
                None => {
                    conn.logger().warn(format_args!(
                        "{}: {}",
                        codec::MSG_INVALID_SERVICE,
                        name
                    ));
                    inner.send_empty_ack(&conn);
                    return;
                }
            };
            match codec::decode_text_body(&text, &service.msg_schema_id, &*inner.validator) {
                Ok(msg) => handle_msg(inner, conn, name, msg).await,
                Err(err) => {
                    conn.logger().warn(format_args!("{}", err));
                    inner.send_empty_ack(&conn);
                }
            }
        }
        EncodedData::Buffer(buf) => {
            // Binary frames are self-describing; route on the decoded tag.
            match codec::decode_binary(&buf, &inner.service_map, &*inner.validator) {
                Ok(TransportData::Msg { service_name, body }) => {
                    handle_msg(inner, conn, service_name, body).await;
                }
                Ok(other) => {
                    conn.logger()
                        .warn(format_args!("Expected msg frame, got {:?}", other));
                    inner.send_empty_ack(&conn);
                }
                Err(err) => {
                    conn.logger().warn(format_args!("{}", err));
                    inner.send_empty_ack(&conn);
                }
            }
        }
    }
}

async fn handle_msg(inner: &Arc<ServerInner>, conn: Arc<Conn>, msg_name: String, msg: Value) {
    let flow = MsgFlow {
        msg_name,
        msg,
        conn: conn.clone(),
    };
    let flow = match inner.flows.pre_recv_msg.exec(flow, conn.logger()).await {
        Some(flow) => flow,
        None => {
            inner.send_empty_ack(&conn);
            return;
        }
    };
    conn.logger()
        .log(format_args!("[RecvMsg] {} {}", flow.msg_name, flow.msg));
    inner.msg_listeners.emit(MsgCall {
        msg_name: flow.msg_name,
        msg: flow.msg,
        conn: conn.clone(),
    });
    inner.send_empty_ack(&conn);
}

async fn dispatch_api(
    inner: &Arc<ServerInner>,
    conn: Arc<Conn>,
    service: Arc<ApiService>,
    sn: u32,
    req: Value,
) {
    inner.pending_api_calls.fetch_add(1, Ordering::SeqCst);
    let call = ApiCall::new(inner.clone(), conn, service.clone(), sn, req);
    call.logger().log(format_args!("[ApiReq] {}", call.req()));

    let flow = ApiCallFlow { call: call.clone() };
    if inner
        .flows
        .pre_api_call
        .exec(flow, call.logger())
        .await
        .is_none()
    {
        call.cancel();
        return;
    }

    let handler = inner
        .api_handlers
        .read()
        .unwrap()
        .get(service.name.as_str())
        .cloned();
    if let Some(timeout) = inner.options.api_call_timeout {
        call.arm_watchdog(timeout);
    }
    match handler {
        Some(handler) => {
            // The handler runs detached: a server timeout answers the caller
            // but never interrupts the handler itself.
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(call.clone()).await {
                    let err = match e.downcast::<TsrpcError>() {
                        Ok(err) => *err,
                        Err(other) => inner.internal_error(other.to_string()),
                    };
                    call.error(err).await;
                }
            });
        }
        None => {
            call.error(
                TsrpcError::server("API not implemented").with_code(codes::NOT_IMPLEMENTED),
            )
            .await;
        }
    }
}

// ===== impl HttpServerBuilder =====

/// Configuration for an [`HttpServer`].
pub struct HttpServerBuilder {
    port: u16,
    json_host_path: String,
    default_data_type: DataType,
    socket_timeout: Option<Duration>,
    keep_alive_timeout: Duration,
    cors: Option<String>,
    cors_max_age: u32,
    encode_return_text: Option<EncodeReturnText>,
    return_inner_error: Option<bool>,
    api_call_timeout: Option<Duration>,
    log_level: LogLevel,
    validator: Arc<dyn Validator>,
    proto_info: Option<ProtoInfo>,
}

impl HttpServerBuilder {
    fn new() -> HttpServerBuilder {
        HttpServerBuilder {
            port: 3000,
            json_host_path: "/".to_owned(),
            default_data_type: DataType::Text,
            socket_timeout: None,
            keep_alive_timeout: Duration::from_secs(5),
            cors: Some("*".to_owned()),
            cors_max_age: 3600,
            encode_return_text: None,
            return_inner_error: None,
            api_call_timeout: Some(Duration::from_secs(30)),
            log_level: LogLevel::Debug,
            validator: Arc::new(JsonValidator),
            proto_info: None,
        }
    }

    /// Port to bind; 0 picks an ephemeral port.
    pub fn port(mut self, port: u16) -> HttpServerBuilder {
        self.port = port;
        self
    }

    /// URL prefix stripped before resolving text-mode service names.
    pub fn json_host_path(mut self, path: impl Into<String>) -> HttpServerBuilder {
        self.json_host_path = path.into();
        self
    }

    /// Encoding assumed when a request has no recognizable `Content-Type`.
    pub fn default_data_type(mut self, data_type: DataType) -> HttpServerBuilder {
        self.default_data_type = data_type;
        self
    }

    /// Limit on writing one response.
    pub fn socket_timeout(mut self, timeout: Duration) -> HttpServerBuilder {
        self.socket_timeout = Some(timeout);
        self
    }

    /// How long an idle keep-alive socket is kept open.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> HttpServerBuilder {
        self.keep_alive_timeout = timeout;
        self
    }

    /// `Access-Control-Allow-Origin` value; `None` disables CORS headers.
    pub fn cors(mut self, cors: Option<String>) -> HttpServerBuilder {
        self.cors = cors;
        self
    }

    /// `Access-Control-Max-Age` advertised on preflights.
    pub fn cors_max_age(mut self, seconds: u32) -> HttpServerBuilder {
        self.cors_max_age = seconds;
        self
    }

    /// Replaces the default `serde_json` serializer for text-mode returns.
    pub fn encode_return_text(mut self, encode: EncodeReturnText) -> HttpServerBuilder {
        self.encode_return_text = Some(encode);
        self
    }

    /// Whether internal errors carry the original error text in `innerErr`.
    ///
    /// Defaults to true unless `NODE_ENV=production` (the conventional
    /// release switch of the protocol's tooling).
    pub fn return_inner_error(mut self, enabled: bool) -> HttpServerBuilder {
        self.return_inner_error = Some(enabled);
        self
    }

    /// Time budget per handler before the caller gets
    /// `ServerError/SERVER_TIMEOUT`. `None` disables the watchdog.
    pub fn api_call_timeout(mut self, timeout: Option<Duration>) -> HttpServerBuilder {
        self.api_call_timeout = timeout;
        self
    }

    /// Gate for the server's log output.
    pub fn log_level(mut self, level: LogLevel) -> HttpServerBuilder {
        self.log_level = level;
        self
    }

    /// Plugs in a schema runtime; defaults to the JSON passthrough.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> HttpServerBuilder {
        self.validator = validator;
        self
    }

    /// Schema metadata to advertise on every response.
    pub fn proto_info(mut self, info: ProtoInfo) -> HttpServerBuilder {
        self.proto_info = Some(info);
        self
    }

    /// Builds the server against the given proto.
    pub fn build(self, proto: &ServiceProto) -> crate::Result<HttpServer> {
        let service_map = ServiceMap::build(proto, EndpointSide::Server)?;
        let return_inner_error = self.return_inner_error.unwrap_or_else(|| {
            std::env::var("NODE_ENV")
                .map(|env| env != "production")
                .unwrap_or(true)
        });
        let logger = Logger::new("[HttpServer] ", self.log_level);
        Ok(HttpServer {
            inner: Arc::new(ServerInner {
                options: ServerOptions {
                    port: self.port,
                    json_host_path: self.json_host_path,
                    default_data_type: self.default_data_type,
                    socket_timeout: self.socket_timeout,
                    keep_alive_timeout: self.keep_alive_timeout,
                    cors: self.cors,
                    cors_max_age: self.cors_max_age,
                    encode_return_text: self.encode_return_text,
                    return_inner_error,
                    api_call_timeout: self.api_call_timeout,
                    proto_info: self.proto_info,
                },
                service_map,
                validator: self.validator,
                flows: ServerFlows::new(),
                api_handlers: RwLock::new(HashMap::new()),
                msg_listeners: MsgListeners::new(),
                conns: Mutex::new(HashMap::new()),
                conn_ids: Counter::new(),
                pending_api_calls: AtomicUsize::new(0),
                drain: Notify::new(),
                store: Mutex::new(StateStore {
                    state: ServerState::Stopped,
                    accept: None,
                    local_addr: None,
                }),
                logger,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{attach_mock_conn, CountingValidator};
    use serde_json::json;

    fn proto() -> ServiceProto {
        serde_json::from_value(json!({
            "services": [
                { "id": 0, "name": "Test", "type": "api" },
                { "id": 1, "name": "Chat", "type": "msg" },
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn start_stop_state_machine() {
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Started);
        assert_eq!(server.local_addr(), Some(addr));

        // double start is refused
        assert!(server.start().await.is_err());

        server.stop(None).await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);

        // and it can start again
        server.start().await.unwrap();
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_bind_returns_to_stopped() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = HttpServer::builder()
            .port(port)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        assert!(server.start().await.is_err());
        assert_eq!(server.state(), ServerState::Stopped);
        drop(taken);

        // the port is free again, so the same server can start
        server.start().await.unwrap();
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_rejected_unless_started() {
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        let out = server
            .broadcast_msg("Chat", json!({"content": "hi"}), None)
            .await
            .unwrap();
        let err = out.unwrap_err();
        assert_eq!(err.message, "Server is not started");
    }

    #[tokio::test]
    async fn broadcast_encodes_once_per_data_type() {
        let counting = Arc::new(CountingValidator::new());
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .validator(counting.clone())
            .build(&proto())
            .unwrap();
        server.start().await.unwrap();

        let mut sinks = Vec::new();
        for _ in 0..5 {
            sinks.push(attach_mock_conn(&server, DataType::Buffer));
        }

        let out = server
            .broadcast_msg("Chat", json!({"content": "hello"}), None)
            .await
            .unwrap();
        out.unwrap();

        // one schema encode for five buffer connections
        assert_eq!(counting.encodes(), 1);
        for (_conn, sent) in &sinks {
            let frames = sent.lock().unwrap();
            assert_eq!(frames.len(), 1);
        }
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_to_explicit_conns_and_mixed_types() {
        let counting = Arc::new(CountingValidator::new());
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .validator(counting.clone())
            .build(&proto())
            .unwrap();
        server.start().await.unwrap();

        let (text_conn, text_sent) = attach_mock_conn(&server, DataType::Text);
        let (buf_conn, buf_sent) = attach_mock_conn(&server, DataType::Buffer);

        let out = server
            .broadcast_msg(
                "Chat",
                json!({"content": "hello"}),
                Some(vec![text_conn, buf_conn]),
            )
            .await
            .unwrap();
        out.unwrap();

        // buffer partition encodes once; the text partition validates but
        // never schema-encodes
        assert_eq!(counting.encodes(), 1);
        assert_eq!(text_sent.lock().unwrap().len(), 1);
        assert_eq!(buf_sent.lock().unwrap().len(), 1);
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_flow_abort_sends_nothing() {
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        server.start().await.unwrap();
        let (_conn, sent) = attach_mock_conn(&server, DataType::Buffer);

        server
            .flows()
            .pre_broadcast_msg
            .push(|_| crate::flow::FlowControl::Abort);
        assert!(server
            .broadcast_msg("Chat", json!({"content": "hi"}), None)
            .await
            .is_none());
        assert!(sent.lock().unwrap().is_empty());
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn server_push_refused_on_http_conns() {
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        server.start().await.unwrap();
        let (conn, _rx) = crate::mock::attach_http_conn(&server);

        let out = server
            .send_msg(&conn, "Chat", json!({"content": "hi"}))
            .await
            .unwrap();
        assert!(out.unwrap_err().message.contains("server-pushed"));
        server.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn auto_implement_outcomes() {
        struct Loader;
        impl HandlerLoader for Loader {
            fn load(&self, api_name: &str) -> crate::Result<ApiHandler> {
                if api_name == "Test" {
                    Ok(Arc::new(|call: ApiCall| {
                        async move {
                            call.succ(json!({})).await;
                            Ok(())
                        }
                        .boxed()
                    }))
                } else {
                    Err(TsrpcError::local("no such module"))
                }
            }
        }

        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        let result = server.auto_implement_api(Arc::new(Loader), AutoImplementPolicy::Eager);
        assert_eq!(result.succ, vec!["Test".to_owned()]);
        assert!(result.fail.is_empty());
        assert!(result.delay.is_empty());
        assert!(server
            .inner
            .api_handlers
            .read()
            .unwrap()
            .contains_key("Test"));
    }

    #[tokio::test]
    async fn auto_implement_lazy_reports_delay() {
        struct Loader;
        impl HandlerLoader for Loader {
            fn load(&self, _api_name: &str) -> crate::Result<ApiHandler> {
                Ok(not_implemented_stub())
            }
        }
        let server = HttpServer::builder()
            .port(0)
            .log_level(LogLevel::None)
            .build(&proto())
            .unwrap();
        let result = server.auto_implement_api(Arc::new(Loader), AutoImplementPolicy::Lazy);
        assert_eq!(result.delay, vec!["Test".to_owned()]);
        assert!(server
            .inner
            .api_handlers
            .read()
            .unwrap()
            .contains_key("Test"));
    }
}

impl std::fmt::Debug for HttpServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerBuilder")
            .field("port", &self.port)
            .field("json_host_path", &self.json_host_path)
            .field("default_data_type", &self.default_data_type)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("api_call_timeout", &self.api_call_timeout)
            .field("log_level", &self.log_level)
            .finish()
    }
}
