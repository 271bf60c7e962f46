//! The server-side view of one API call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::common::log::Logger;
use crate::error::{codes, TsrpcError};
use crate::proto::{ApiReturn, ApiService};
use crate::server::conn::Conn;
use crate::server::{ApiCallReturnFlow, ServerInner};

/// One inbound API call, handed to its handler.
///
/// The handler finishes the call through [`succ`](ApiCall::succ) or
/// [`error`](ApiCall::error). A call settles exactly once: whichever of the
/// handler, the server's timeout watchdog, or an interceptor gets there
/// first wins, and every later attempt is a logged no-op. Cloning is cheap
/// and clones refer to the same call.
#[derive(Clone)]
pub struct ApiCall {
    inner: Arc<CallInner>,
}

struct CallInner {
    server: Arc<ServerInner>,
    conn: Arc<Conn>,
    service: Arc<ApiService>,
    sn: u32,
    req: Value,
    #[allow(dead_code)]
    started_at: Instant,
    settled: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl ApiCall {
    pub(crate) fn new(
        server: Arc<ServerInner>,
        conn: Arc<Conn>,
        service: Arc<ApiService>,
        sn: u32,
        req: Value,
    ) -> ApiCall {
        let logger = conn
            .logger()
            .with_suffix(&format!("[{}] #{}", service.name, sn));
        ApiCall {
            inner: Arc::new(CallInner {
                server,
                conn,
                service,
                sn,
                req,
                started_at: Instant::now(),
                settled: AtomicBool::new(false),
                watchdog: Mutex::new(None),
                logger,
            }),
        }
    }

    /// The called API service.
    pub fn api_name(&self) -> &str {
        &self.inner.service.name
    }

    /// Serial number of the call.
    pub fn sn(&self) -> u32 {
        self.inner.sn
    }

    /// The request body.
    pub fn req(&self) -> &Value {
        &self.inner.req
    }

    /// The connection the call arrived on.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.inner.conn
    }

    /// The call's log handle, prefixed with service and SN.
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Whether the call already settled (handler finished, timed out, or
    /// was cancelled).
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Finishes the call successfully with the given response body.
    pub async fn succ(&self, res: Value) {
        self.settle(ApiReturn::Succ(res)).await;
    }

    /// Finishes the call with an error; it reaches the caller verbatim.
    pub async fn error(&self, err: TsrpcError) {
        self.settle(ApiReturn::Err(err)).await;
    }

    /// Starts the server-side execution timer: when it fires first, the
    /// caller receives `ServerError/SERVER_TIMEOUT` and the handler's own
    /// late `succ`/`error` become no-ops (the handler keeps running).
    pub(crate) fn arm_watchdog(&self, timeout: Duration) {
        let call = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Detach first so settle() doesn't abort the task it runs on.
            call.inner.watchdog.lock().unwrap().take();
            call.settle(ApiReturn::Err(
                TsrpcError::server("Server Timeout").with_code(codes::SERVER_TIMEOUT),
            ))
            .await;
        });
        *self.inner.watchdog.lock().unwrap() = Some(handle);
    }

    /// Cancels the call without any response; the exchange ends silently.
    pub(crate) fn cancel(&self) {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watchdog) = self.inner.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }
        self.inner.server.dec_pending();
        self.inner.conn.close_sink();
    }

    pub(crate) async fn settle(&self, ret: ApiReturn) {
        let inner = &self.inner;
        if inner.settled.swap(true, Ordering::SeqCst) {
            inner
                .logger
                .warn(format_args!("Call already settled; return dropped"));
            return;
        }
        if let Some(watchdog) = inner.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }

        match ret {
            ApiReturn::Succ(ref res) => inner.logger.log(format_args!("[ApiRes] {}", res)),
            ApiReturn::Err(ref err) => inner.logger.log(format_args!("[ApiErr] {}", err)),
        }

        let flow = ApiCallReturnFlow {
            call: self.clone(),
            ret,
        };
        let flow = match inner
            .server
            .flows
            .pre_api_call_return
            .exec(flow, &inner.logger)
            .await
        {
            Some(flow) => flow,
            None => {
                inner.conn.close_sink();
                inner.server.dec_pending();
                return;
            }
        };

        if let Err(err) = inner
            .server
            .send_return(&inner.conn, &inner.service, inner.sn, flow.ret)
            .await
        {
            inner
                .logger
                .error(format_args!("Failed to send return: {}", err));
            inner.conn.close_sink();
        }
        // Counted down only after the return is handed to the transport, so
        // a graceful stop cannot tear the connection down mid-response.
        inner.server.dec_pending();
    }
}

impl std::fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCall")
            .field("api_name", &self.api_name())
            .field("sn", &self.sn())
            .field("settled", &self.is_settled())
            .finish()
    }
}
