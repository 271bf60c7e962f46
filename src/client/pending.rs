//! Correlation of outbound calls with inbound responses.
//!
//! Every outbound API call registers here under a fresh serial number and
//! hands back a one-shot receiver. Whatever arrives first (the matching
//! response, a timeout, or a disconnect) settles the call exactly once.
//! An *aborted* call is different: its sender is dropped without a value,
//! so the caller's future never resolves. That asymmetry is deliberate and
//! relied upon by callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::log::Logger;
use crate::common::Counter;
use crate::error::{codes, TsrpcError};
use crate::proto::ApiReturn;

type AbortHook = Box<dyn FnOnce() + Send>;

/// How a pending call came to rest.
#[derive(Debug)]
pub(crate) enum Settled {
    /// A real return: success, API error, or transport error.
    Return(ApiReturn),
    /// An interceptor aborted the operation mid-exchange; the caller reports
    /// the abort sentinel instead of a return.
    FlowAborted,
}

#[derive(Clone)]
pub(crate) struct PendingCalls {
    inner: Arc<Inner>,
}

struct Inner {
    sn: Counter,
    calls: Mutex<HashMap<u32, Pending>>,
    logger: Logger,
}

struct Pending {
    api_name: String,
    #[allow(dead_code)]
    started_at: Instant,
    tx: oneshot::Sender<Settled>,
    on_abort: Option<AbortHook>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCalls {
    pub(crate) fn new(logger: Logger) -> PendingCalls {
        PendingCalls {
            inner: Arc::new(Inner {
                sn: Counter::new(),
                calls: Mutex::new(HashMap::new()),
                logger,
            }),
        }
    }

    /// Registers a new call, returning its SN and the receiver that will
    /// yield the settled return.
    ///
    /// With a timeout, a timer settles the call with `NetworkError/TIMEOUT`
    /// if it is still pending when the timer fires; the timer also runs the
    /// abort hook so any in-flight transport work is cancelled.
    pub(crate) fn register(
        &self,
        api_name: &str,
        timeout: Option<Duration>,
    ) -> (u32, oneshot::Receiver<Settled>) {
        let sn = self.inner.sn.next();
        let (tx, rx) = oneshot::channel();
        let timer = timeout.map(|after| {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                this.time_out(sn);
            })
        });
        self.inner.calls.lock().unwrap().insert(
            sn,
            Pending {
                api_name: api_name.to_owned(),
                started_at: Instant::now(),
                tx,
                on_abort: None,
                timer,
            },
        );
        (sn, rx)
    }

    /// Installs the hook that cancels in-flight transport work for `sn`.
    ///
    /// No-op if the call already settled or was aborted.
    pub(crate) fn set_on_abort(&self, sn: u32, hook: AbortHook) {
        if let Some(pending) = self.inner.calls.lock().unwrap().get_mut(&sn) {
            pending.on_abort = Some(hook);
        }
    }

    /// Settles `sn` with the given return. First settle wins; an unknown SN
    /// (already settled, aborted, or never registered) logs and is dropped.
    pub(crate) fn settle(&self, sn: u32, ret: ApiReturn) {
        self.resolve(sn, Settled::Return(ret));
    }

    /// Settles `sn` with the flow-abort sentinel.
    pub(crate) fn settle_flow_aborted(&self, sn: u32) {
        self.resolve(sn, Settled::FlowAborted);
    }

    fn resolve(&self, sn: u32, settled: Settled) {
        let pending = self.inner.calls.lock().unwrap().remove(&sn);
        match pending {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                // The receiver may have been dropped; nothing left to do then.
                let _ = pending.tx.send(settled);
            }
            None => {
                self.inner
                    .logger
                    .warn(format_args!("Settle for unknown SN dropped: {}", sn));
            }
        }
    }

    fn time_out(&self, sn: u32) {
        let pending = self.inner.calls.lock().unwrap().remove(&sn);
        if let Some(pending) = pending {
            self.inner.logger.debug(format_args!(
                "[ApiTimeout] #{} {}",
                sn, pending.api_name
            ));
            if let Some(hook) = pending.on_abort {
                hook();
            }
            let _ = pending.tx.send(Settled::Return(ApiReturn::Err(
                TsrpcError::network("Request Timeout").with_code(codes::TIMEOUT),
            )));
        }
    }

    /// Aborts `sn`: runs the abort hook, cancels the timer, and drops the
    /// sender without a value, so the caller's future never resolves.
    pub(crate) fn abort(&self, sn: u32) {
        let pending = self.inner.calls.lock().unwrap().remove(&sn);
        if let Some(pending) = pending {
            self.inner.logger.debug(format_args!(
                "[ApiAbort] #{} {}",
                sn, pending.api_name
            ));
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            if let Some(hook) = pending.on_abort {
                hook();
            }
        }
    }

    /// Aborts every pending call whose `(api_name, sn)` matches.
    pub(crate) fn abort_by(&self, mut predicate: impl FnMut(&str, u32) -> bool) {
        let sns: Vec<u32> = self
            .inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(sn, p)| predicate(&p.api_name, **sn))
            .map(|(sn, _)| *sn)
            .collect();
        for sn in sns {
            self.abort(sn);
        }
    }

    pub(crate) fn abort_all(&self) {
        self.abort_by(|_, _| true);
    }

    /// Settles every pending call with the same error (disconnect path).
    pub(crate) fn settle_all(&self, err: TsrpcError) {
        let sns: Vec<u32> = self.inner.calls.lock().unwrap().keys().copied().collect();
        for sn in sns {
            self.settle(sn, ApiReturn::Err(err.clone()));
        }
    }

    /// Number of registered calls not yet settled or aborted.
    pub(crate) fn size(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }

    /// The most recently assigned SN, or 0 before the first call.
    pub(crate) fn last_sn(&self) -> u32 {
        self.inner.sn.last()
    }
}
