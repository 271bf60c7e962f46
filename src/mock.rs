//! Test doubles: push-capable connections and an instrumented validator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::proto::{DataType, EncodedData, JsonValidator, Validator};
use crate::server::conn::{Conn, ConnSink, HttpSink};
use crate::server::HttpServer;

/// A duplex-style sink that records every frame it is given.
pub(crate) struct MockSink {
    sent: Arc<Mutex<Vec<EncodedData>>>,
}

impl ConnSink for MockSink {
    fn send(&self, data: EncodedData) -> crate::Result<()> {
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    fn close(&self) {}

    fn supports_push(&self) -> bool {
        true
    }
}

/// Registers a push-capable connection on the server, returning it together
/// with the frames it receives.
pub(crate) fn attach_mock_conn(
    server: &HttpServer,
    data_type: DataType,
) -> (Arc<Conn>, Arc<Mutex<Vec<EncodedData>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink: Box<dyn ConnSink> = Box::new(MockSink { sent: sent.clone() });
    let id = server.inner.conn_ids.next();
    let logger = server.inner.logger.with_suffix(&format!("#{}", id));
    let conn = Arc::new(Conn::new(id, None, data_type, sink, logger));
    server.inner.conns.lock().unwrap().insert(id, conn.clone());
    (conn, sent)
}

/// Registers a one-shot (HTTP-style) connection on the server.
pub(crate) fn attach_http_conn(
    server: &HttpServer,
) -> (Arc<Conn>, oneshot::Receiver<EncodedData>) {
    let (sink, rx) = HttpSink::new();
    let sink: Box<dyn ConnSink> = Box::new(sink);
    let id = server.inner.conn_ids.next();
    let logger = server.inner.logger.with_suffix(&format!("#{}", id));
    let conn = Arc::new(Conn::new(id, None, DataType::Text, sink, logger));
    server.inner.conns.lock().unwrap().insert(id, conn.clone());
    (conn, rx)
}

/// Counts schema operations while delegating to the JSON passthrough.
pub(crate) struct CountingValidator {
    encodes: AtomicUsize,
    decodes: AtomicUsize,
    validates: AtomicUsize,
    inner: JsonValidator,
}

impl CountingValidator {
    pub(crate) fn new() -> CountingValidator {
        CountingValidator {
            encodes: AtomicUsize::new(0),
            decodes: AtomicUsize::new(0),
            validates: AtomicUsize::new(0),
            inner: JsonValidator,
        }
    }

    pub(crate) fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub(crate) fn validates(&self) -> usize {
        self.validates.load(Ordering::SeqCst)
    }
}

impl Validator for CountingValidator {
    fn encode(&self, body: &Value, schema_id: &str) -> Result<Bytes, String> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(body, schema_id)
    }

    fn decode(&self, buf: &[u8], schema_id: &str) -> Result<Value, String> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(buf, schema_id)
    }

    fn validate(&self, body: &Value, schema_id: &str) -> Result<(), String> {
        self.validates.fetch_add(1, Ordering::SeqCst);
        self.inner.validate(body, schema_id)
    }
}
