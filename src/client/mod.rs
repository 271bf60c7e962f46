//! HTTP client endpoint.
//!
//! The client is stateless: every [`call_api`](HttpClient::call_api) and
//! [`send_msg`](HttpClient::send_msg) maps to one `POST` exchange, so the
//! connection is logically always `Connected`. Responses are still
//! correlated through the pending registry even though HTTP already pairs
//! them, which keeps timeout and abort behavior identical across transports.

pub(crate) mod pending;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::net::TcpStream;

use crate::common::log::{LogLevel, Logger};
use crate::error::TsrpcError;
use crate::flow::Flow;
use crate::http::{self, ServerUrl, CONTENT_TYPE_BUFFER, CONTENT_TYPE_TEXT};
use crate::proto::codec;
use crate::proto::{
    ApiReturn, DataType, EncodedData, EndpointSide, JsonValidator, ProtoInfo, ServiceMap,
    ServiceProto, TransportData, Validator,
};

use self::pending::{PendingCalls, Settled};

/// Pluggable parser for text-mode response bodies.
pub type DecodeReturnText = Arc<dyn Fn(&str) -> Result<ApiReturn, String> + Send + Sync>;

/// Per-call options; anything unset falls back to the client's defaults.
#[derive(Debug, Clone, Default)]
pub struct CallApiOptions {
    /// Overrides the client's `call_api_timeout` for this call.
    pub timeout: Option<Duration>,
}

// ===== flow payloads =====

/// Payload of the `pre_call_api` stage.
#[derive(Debug)]
pub struct CallApiFlow {
    /// Target API service.
    pub api_name: String,
    /// Request body; nodes may rewrite it.
    pub req: Value,
    /// Per-call options; nodes may rewrite them.
    pub options: CallApiOptions,
}

/// Payload of the `pre_call_api_return` stage.
#[derive(Debug)]
pub struct CallApiReturnFlow {
    /// The called API service.
    pub api_name: String,
    /// The request as it went out.
    pub req: Value,
    /// The return about to reach the caller; nodes may rewrite it.
    pub ret: ApiReturn,
}

/// Payload of the `pre_send_msg` stage.
#[derive(Debug)]
pub struct SendMsgFlow {
    /// Target message service.
    pub msg_name: String,
    /// Message body; nodes may rewrite it.
    pub msg: Value,
}

/// Payload of the `pre_send_data` / `post_send_data` stages.
#[derive(Debug)]
pub struct SendDataFlow {
    /// The encoded frame about to hit (or just off) the wire.
    pub data: EncodedData,
    /// The envelope the frame was encoded from.
    pub transport_data: TransportData,
}

/// Payload of the `pre_recv_data` stage.
#[derive(Debug)]
pub struct RecvDataFlow {
    /// The raw frame as the transport delivered it.
    pub data: EncodedData,
}

/// The client-side interceptor pipelines.
#[derive(Debug)]
pub struct ClientFlows {
    /// Before a call is encoded and sent.
    pub pre_call_api: Flow<CallApiFlow>,
    /// Before a settled return resolves the caller.
    pub pre_call_api_return: Flow<CallApiReturnFlow>,
    /// Before a message is encoded and sent.
    pub pre_send_msg: Flow<SendMsgFlow>,
    /// Before raw bytes are handed to the transport.
    pub pre_send_data: Flow<SendDataFlow>,
    /// After raw bytes were handed to the transport.
    pub post_send_data: Flow<SendDataFlow>,
    /// After the transport delivered raw bytes, before decoding.
    pub pre_recv_data: Flow<RecvDataFlow>,
}

impl ClientFlows {
    fn new() -> ClientFlows {
        ClientFlows {
            pre_call_api: Flow::new("preCallApi"),
            pre_call_api_return: Flow::new("preCallApiReturn"),
            pre_send_msg: Flow::new("preSendMsg"),
            pre_send_data: Flow::new("preSendData"),
            post_send_data: Flow::new("postSendData"),
            pre_recv_data: Flow::new("preRecvData"),
        }
    }
}

// ===== impl HttpClient =====

/// A stateless RPC client over HTTP.
///
/// Cheap to clone; clones share the pending registry and flows.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    data_type: DataType,
    call_api_timeout: Duration,
    decode_return_text: Option<DecodeReturnText>,
    proto_info: Option<ProtoInfo>,
    url: ServerUrl,
    service_map: ServiceMap,
    validator: Arc<dyn Validator>,
    flows: ClientFlows,
    pending: PendingCalls,
    peer_proto_info: Mutex<Option<ProtoInfo>>,
    logger: Logger,
}

impl HttpClient {
    /// Creates a client with default options against `http://127.0.0.1:3000`.
    pub fn new(proto: &ServiceProto) -> crate::Result<HttpClient> {
        HttpClient::builder().build(proto)
    }

    /// Configure a client.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// The client's interceptor pipelines.
    pub fn flows(&self) -> &ClientFlows {
        &self.inner.flows
    }

    /// The client's log handle.
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// The SN most recently assigned to a call, or 0 before the first call.
    pub fn last_sn(&self) -> u32 {
        self.inner.pending.last_sn()
    }

    /// Calls not yet settled or aborted.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.size()
    }

    /// The peer's schema metadata, as learned from the latest response.
    pub fn peer_proto_info(&self) -> Option<ProtoInfo> {
        self.inner.peer_proto_info.lock().unwrap().clone()
    }

    /// Aborts the pending call with the given SN.
    ///
    /// The aborted caller's future never resolves; its in-flight exchange is
    /// cancelled and a late response for that SN is dropped.
    pub fn abort(&self, sn: u32) {
        self.inner.pending.abort(sn);
    }

    /// Aborts every pending call.
    pub fn abort_all(&self) {
        self.inner.pending.abort_all();
    }

    /// Calls a remote API and awaits its return.
    ///
    /// Yields `None` when an interceptor aborted the operation. Every other
    /// outcome, including transport failures, arrives as an [`ApiReturn`].
    pub async fn call_api(&self, api_name: &str, req: Value) -> Option<ApiReturn> {
        self.call_api_with(api_name, req, CallApiOptions::default())
            .await
    }

    /// Like [`call_api`](HttpClient::call_api), with per-call options.
    pub async fn call_api_with(
        &self,
        api_name: &str,
        req: Value,
        options: CallApiOptions,
    ) -> Option<ApiReturn> {
        let inner = &self.inner;
        let flow = CallApiFlow {
            api_name: api_name.to_owned(),
            req,
            options,
        };
        let flow = inner.flows.pre_call_api.exec(flow, &inner.logger).await?;
        let CallApiFlow {
            api_name,
            req,
            options,
        } = flow;

        let timeout = options.timeout.unwrap_or(inner.call_api_timeout);
        let (sn, rx) = inner.pending.register(&api_name, Some(timeout));
        inner
            .logger
            .log(format_args!("[ApiReq] #{} {} {}", sn, api_name, req));

        let data = TransportData::Req {
            service_name: api_name.clone(),
            sn,
            body: req.clone(),
            proto_info: inner.proto_info.clone(),
        };
        let task = tokio::spawn(exchange(inner.clone(), sn, data));
        inner.pending.set_on_abort(sn, Box::new(move || task.abort()));

        let ret = match rx.await {
            Ok(Settled::Return(ret)) => ret,
            Ok(Settled::FlowAborted) => return None,
            Err(_) => {
                // Aborted: by contract the caller never resolves.
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
        };

        match ret {
            ApiReturn::Succ(ref res) => {
                inner
                    .logger
                    .log(format_args!("[ApiRes] #{} {} {}", sn, api_name, res));
            }
            ApiReturn::Err(ref err) => {
                inner
                    .logger
                    .log(format_args!("[ApiErr] #{} {} {}", sn, api_name, err));
            }
        }

        let flow = CallApiReturnFlow { api_name, req, ret };
        let flow = inner
            .flows
            .pre_call_api_return
            .exec(flow, &inner.logger)
            .await?;
        Some(flow.ret)
    }

    /// Sends a one-way message.
    ///
    /// Resolves once the bytes are handed to the transport, not when the
    /// peer has processed them. Yields `None` when an interceptor aborted.
    pub async fn send_msg(&self, msg_name: &str, msg: Value) -> Option<crate::Result<()>> {
        let inner = &self.inner;
        let flow = SendMsgFlow {
            msg_name: msg_name.to_owned(),
            msg,
        };
        let flow = inner.flows.pre_send_msg.exec(flow, &inner.logger).await?;
        let SendMsgFlow { msg_name, msg } = flow;
        inner
            .logger
            .log(format_args!("[SendMsg] {} {}", msg_name, msg));

        let data = TransportData::Msg {
            service_name: msg_name,
            body: msg,
        };
        let encoded = match encode_msg(inner, &data) {
            Ok(encoded) => encoded,
            Err(err) => return Some(Err(err)),
        };
        let flow = SendDataFlow {
            data: encoded,
            transport_data: data,
        };
        let flow = inner.flows.pre_send_data.exec(flow, &inner.logger).await?;
        Some(post_msg(inner, flow).await)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("server", &self.inner.url.authority)
            .field("data_type", &self.inner.data_type)
            .finish()
    }
}

fn encode_msg(inner: &ClientInner, data: &TransportData) -> crate::Result<EncodedData> {
    let (service_name, body) = match *data {
        TransportData::Msg {
            ref service_name,
            ref body,
        } => (service_name, body),
        _ => unreachable!("encode_msg only handles msg frames"),
    };
    match inner.data_type {
        DataType::Text => {
            // Like a skip-SN request: the URL carries the service name, so
            // the wire body is the bare message.
            let svc = inner
                .service_map
                .msg_by_name(service_name)
                .ok_or_else(|| TsrpcError::local(codec::MSG_INVALID_SERVICE))?;
            inner
                .validator
                .validate(body, &svc.msg_schema_id)
                .map_err(TsrpcError::local)?;
            let text = serde_json::to_string(body).map_err(|e| TsrpcError::local(e.to_string()))?;
            Ok(EncodedData::Text(text))
        }
        DataType::Buffer => Ok(EncodedData::Buffer(codec::encode_binary(
            data,
            &inner.service_map,
            &*inner.validator,
        )?)),
    }
}

async fn post_msg(inner: &Arc<ClientInner>, flow: SendDataFlow) -> crate::Result<()> {
    let mut stream = TcpStream::connect(&inner.url.authority)
        .await
        .map_err(|e| http::io_err("connect", e))?;
    let path = match (inner.data_type, flow.transport_data.service_name()) {
        (DataType::Text, Some(name)) => inner.url.path_for(name),
        _ => inner.url.base_path.clone(),
    };
    let mut extra = vec![(http::HEADER_DATA_TYPE, "msg".to_owned())];
    push_proto_info_header(inner, &mut extra);
    {
        let (content_type, body) = match flow.data {
            EncodedData::Text(ref s) => (CONTENT_TYPE_TEXT, s.as_bytes()),
            EncodedData::Buffer(ref b) => (CONTENT_TYPE_BUFFER, &b[..]),
        };
        http::write_request(
            &mut stream,
            &path,
            &inner.url.authority,
            content_type,
            &extra,
            body,
        )
        .await?;
    }

    // Handed off. Drain the (empty) response off-path so the server never
    // sees its write fail.
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(256);
        let _ = http::read_response(&mut stream, &mut buf).await;
    });

    let _ = inner.flows.post_send_data.exec(flow, &inner.logger).await;
    Ok(())
}

// ===== the call exchange =====

async fn exchange(inner: Arc<ClientInner>, sn: u32, data: TransportData) {
    if let Err(err) = try_exchange(&inner, sn, &data).await {
        inner.pending.settle(sn, ApiReturn::Err(err));
    }
}

async fn try_exchange(
    inner: &Arc<ClientInner>,
    sn: u32,
    data: &TransportData,
) -> crate::Result<()> {
    // Text mode skips the SN: the URL names the service, and this exchange
    // is the sole in-flight request the response can belong to.
    let encoded = match inner.data_type {
        DataType::Text => EncodedData::Text(codec::encode_text(
            data,
            true,
            &inner.service_map,
            &*inner.validator,
        )?),
        DataType::Buffer => EncodedData::Buffer(codec::encode_binary(
            data,
            &inner.service_map,
            &*inner.validator,
        )?),
    };

    let flow = SendDataFlow {
        data: encoded,
        transport_data: data.clone(),
    };
    let flow = match inner.flows.pre_send_data.exec(flow, &inner.logger).await {
        Some(flow) => flow,
        None => {
            inner.pending.settle_flow_aborted(sn);
            return Ok(());
        }
    };

    let mut stream = TcpStream::connect(&inner.url.authority)
        .await
        .map_err(|e| http::io_err("connect", e))?;
    let path = match (inner.data_type, data.service_name()) {
        (DataType::Text, Some(name)) => inner.url.path_for(name),
        _ => inner.url.base_path.clone(),
    };
    let mut extra: Vec<(&str, String)> = Vec::new();
    push_proto_info_header(inner, &mut extra);
    {
        let (content_type, body) = match flow.data {
            EncodedData::Text(ref s) => (CONTENT_TYPE_TEXT, s.as_bytes()),
            EncodedData::Buffer(ref b) => (CONTENT_TYPE_BUFFER, &b[..]),
        };
        http::write_request(
            &mut stream,
            &path,
            &inner.url.authority,
            content_type,
            &extra,
            body,
        )
        .await?;
    }
    let _ = inner.flows.post_send_data.exec(flow, &inner.logger).await;

    let mut buf = BytesMut::with_capacity(4096);
    let (head, body) = http::read_response(&mut stream, &mut buf).await?;

    if let Some(raw) = head.header("x-tsrpc-proto-info") {
        match serde_json::from_str::<ProtoInfo>(raw) {
            Ok(info) => {
                if let Some(ref own) = inner.proto_info {
                    if own.is_skewed_from(&info) {
                        inner.logger.warn(format_args!(
                            "Remote schema differs from local (md5 {:?} vs {:?})",
                            own.md5, info.md5
                        ));
                    }
                }
                *inner.peer_proto_info.lock().unwrap() = Some(info);
            }
            Err(e) => {
                // Metadata only; a bad header never fails the call.
                inner.logger.warn(format_args!(
                    "Invalid {} header: {}",
                    http::HEADER_PROTO_INFO,
                    e
                ));
            }
        }
    }

    let received = if head
        .header("content-type")
        .map(|ct| ct.starts_with(CONTENT_TYPE_BUFFER))
        .unwrap_or(false)
    {
        EncodedData::Buffer(body)
    } else {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| TsrpcError::local("Response body is not valid UTF-8"))?;
        EncodedData::Text(text)
    };
    let flow = RecvDataFlow { data: received };
    let flow = match inner.flows.pre_recv_data.exec(flow, &inner.logger).await {
        Some(flow) => flow,
        None => {
            inner.pending.settle_flow_aborted(sn);
            return Ok(());
        }
    };

    match flow.data {
        EncodedData::Text(text) => {
            let ret = match inner.decode_return_text {
                Some(ref decode) => decode(&text).map_err(TsrpcError::local)?,
                None => serde_json::from_str::<ApiReturn>(&text).map_err(|_| {
                    let mut msg = String::from("Response body is not a valid JSON.");
                    if !inner.flows.pre_recv_data.is_empty() {
                        msg.push_str(" Check the data your preRecvData flow nodes returned.");
                    }
                    TsrpcError::local(msg)
                })?,
            };
            inner.pending.settle(sn, ret);
        }
        EncodedData::Buffer(buf) => {
            match codec::decode_binary(&buf, &inner.service_map, &*inner.validator)? {
                TransportData::Res { sn, body, .. } => {
                    inner.pending.settle(sn, ApiReturn::Succ(body));
                }
                TransportData::Err { sn, err, .. } => {
                    inner.pending.settle(sn, ApiReturn::Err(err));
                }
                other => {
                    return Err(TsrpcError::remote(format!(
                        "Unexpected frame in response: {:?}",
                        other
                    )));
                }
            }
        }
    }
    Ok(())
}

fn push_proto_info_header(inner: &ClientInner, extra: &mut Vec<(&str, String)>) {
    if let Some(ref info) = inner.proto_info {
        if let Ok(json) = serde_json::to_string(info) {
            extra.push((http::HEADER_PROTO_INFO, json));
        }
    }
}

// ===== impl HttpClientBuilder =====

/// Configuration for an [`HttpClient`].
pub struct HttpClientBuilder {
    server: String,
    data_type: DataType,
    call_api_timeout: Duration,
    log_level: LogLevel,
    decode_return_text: Option<DecodeReturnText>,
    validator: Arc<dyn Validator>,
    proto_info: Option<ProtoInfo>,
}

impl HttpClientBuilder {
    fn new() -> HttpClientBuilder {
        HttpClientBuilder {
            server: "http://127.0.0.1:3000".to_owned(),
            data_type: DataType::Text,
            call_api_timeout: Duration::from_secs(15),
            log_level: LogLevel::Warn,
            decode_return_text: None,
            validator: Arc::new(JsonValidator),
            proto_info: None,
        }
    }

    /// The server address, e.g. `http://127.0.0.1:3000`.
    pub fn server(mut self, server: impl Into<String>) -> HttpClientBuilder {
        self.server = server.into();
        self
    }

    /// Which encoding the client speaks; text by default.
    pub fn data_type(mut self, data_type: DataType) -> HttpClientBuilder {
        self.data_type = data_type;
        self
    }

    /// Default timeout for every call; override per call with
    /// [`CallApiOptions::timeout`].
    pub fn call_api_timeout(mut self, timeout: Duration) -> HttpClientBuilder {
        self.call_api_timeout = timeout;
        self
    }

    /// Gate for the client's log output.
    pub fn log_level(mut self, level: LogLevel) -> HttpClientBuilder {
        self.log_level = level;
        self
    }

    /// Replaces the default `serde_json` parser for text-mode returns.
    pub fn decode_return_text(mut self, decode: DecodeReturnText) -> HttpClientBuilder {
        self.decode_return_text = Some(decode);
        self
    }

    /// Plugs in a schema runtime; defaults to the JSON passthrough.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> HttpClientBuilder {
        self.validator = validator;
        self
    }

    /// Schema metadata to advertise with every request.
    pub fn proto_info(mut self, info: ProtoInfo) -> HttpClientBuilder {
        self.proto_info = Some(info);
        self
    }

    /// Builds the client against the given proto.
    pub fn build(self, proto: &ServiceProto) -> crate::Result<HttpClient> {
        let url = ServerUrl::parse(&self.server)?;
        let service_map = ServiceMap::build(proto, EndpointSide::Client)?;
        let logger = Logger::new("[HttpClient] ", self.log_level);
        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                data_type: self.data_type,
                call_api_timeout: self.call_api_timeout,
                decode_return_text: self.decode_return_text,
                proto_info: self.proto_info,
                url,
                service_map,
                validator: self.validator,
                flows: ClientFlows::new(),
                pending: PendingCalls::new(logger.clone()),
                peer_proto_info: Mutex::new(None),
                logger,
            }),
        })
    }
}

impl std::fmt::Debug for HttpClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientBuilder")
            .field("server", &self.server)
            .field("data_type", &self.data_type)
            .field("call_api_timeout", &self.call_api_timeout)
            .field("log_level", &self.log_level)
            .finish()
    }
}
