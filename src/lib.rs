#![doc(html_root_url = "https://docs.rs/tsrpc/0.1.0")]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

//! # tsrpc
//!
//! A typed RPC framework: request/response and one-way messaging over a
//! shared wire model, with schema-driven encoding (a compact binary box and
//! a JSON text box), interceptor pipelines ("flows") at every well-defined
//! point of an exchange, and per-call timeout, cancellation and correlation.
//!
//! This crate ships the protocol core plus its HTTP specialization:
//! a stateless [`HttpClient`] (one `POST` per call) and an [`HttpServer`]
//! that treats every inbound request as a short-lived connection. Duplex
//! transports plug into the same core; their framing lives outside this
//! crate, as does the schema compiler behind the [`Validator`] seam.
//!
//! ```no_run
//! use serde_json::json;
//! use tsrpc::{HttpClient, HttpServer, ServiceProto};
//!
//! # async fn demo() -> tsrpc::Result<()> {
//! let proto: ServiceProto = serde_json::from_str(
//!     r#"{"services": [{"id": 0, "name": "Test", "type": "api"}]}"#,
//! ).unwrap();
//!
//! let server = HttpServer::new(&proto)?;
//! server.implement_api("Test", |call| async move {
//!     let name = call.req()["name"].as_str().unwrap_or("").to_owned();
//!     call.succ(json!({ "reply": format!("Test reply: {}", name) })).await;
//!     Ok(())
//! });
//! server.start().await?;
//!
//! let client = HttpClient::new(&proto)?;
//! let ret = client.call_api("Test", json!({ "name": "Req1" })).await;
//! # drop(ret);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub use crate::client::{
    CallApiOptions, ClientFlows, DecodeReturnText, HttpClient, HttpClientBuilder,
};
pub use crate::common::log::{LogLevel, Logger};
pub use crate::error::{codes, ErrorType, Result, TsrpcError};
pub use crate::flow::{Flow, FlowControl};
pub use crate::proto::{
    ApiReturn, DataType, EncodedData, JsonValidator, ProtoInfo, ServiceProto, TransportData,
    Validator,
};
pub use crate::server::{
    ApiCall, ApiHandler, AutoImplementPolicy, AutoImplementResult, HandlerError, HandlerLoader,
    HttpServer, HttpServerBuilder, MsgCall, ServerFlows, ServerState,
};
pub use crate::server::conn::{Conn, ConnState};

pub mod client;
mod common;
pub mod error;
pub mod flow;
mod http;
#[cfg(test)]
mod mock;
pub mod proto;
pub mod server;
