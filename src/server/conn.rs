//! Server-side connections.
//!
//! Over HTTP every inbound request becomes one short-lived connection whose
//! sink can carry exactly one response. Duplex transports reuse the same
//! type with a push-capable sink.

use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::common::log::Logger;
use crate::error::TsrpcError;
use crate::proto::{DataType, EncodedData};

/// Connection lifecycle states. Transitions are monotonic forward;
/// `Connecting` can only be re-entered from `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Transport setup in progress.
    Connecting,
    /// Live.
    Connected,
    /// Going down; in-flight work may still finish.
    Disconnecting,
    /// Gone; sends are refused.
    Disconnected,
}

/// Where a connection's outbound frames go.
pub(crate) trait ConnSink: Send + Sync {
    /// Hands one encoded frame to the transport.
    fn send(&self, data: EncodedData) -> crate::Result<()>;

    /// Gives up on ever sending: a one-shot sink ends its exchange with no
    /// response at all.
    fn close(&self);

    /// Whether unsolicited frames (server-pushed messages) are allowed.
    fn supports_push(&self) -> bool;
}

/// One peer connection owned by a server.
pub struct Conn {
    id: u32,
    peer_addr: Option<SocketAddr>,
    data_type: DataType,
    state: Mutex<ConnState>,
    sink: Box<dyn ConnSink>,
    logger: Logger,
}

impl Conn {
    pub(crate) fn new(
        id: u32,
        peer_addr: Option<SocketAddr>,
        data_type: DataType,
        sink: Box<dyn ConnSink>,
        logger: Logger,
    ) -> Conn {
        Conn {
            id,
            peer_addr,
            data_type,
            state: Mutex::new(ConnState::Connected),
            sink,
            logger,
        }
    }

    /// Server-unique connection id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The peer's address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Which encoding this connection speaks.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// The connection's log handle.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Moves the state machine forward. Backward transitions are refused,
    /// except `Disconnected -> Connecting` (a reconnect).
    pub(crate) fn advance(&self, next: ConnState) -> bool {
        let mut state = self.state.lock().unwrap();
        let ok = next > *state
            || (*state == ConnState::Disconnected && next == ConnState::Connecting);
        if ok {
            *state = next;
        } else {
            self.logger.warn(format_args!(
                "Refused state transition {:?} -> {:?}",
                *state, next
            ));
        }
        ok
    }

    pub(crate) fn send_data(&self, data: EncodedData) -> crate::Result<()> {
        if self.state() >= ConnState::Disconnected {
            return Err(TsrpcError::network("Connection disconnected"));
        }
        self.sink.send(data)
    }

    pub(crate) fn close_sink(&self) {
        self.sink.close();
    }

    pub(crate) fn supports_push(&self) -> bool {
        self.sink.supports_push()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("data_type", &self.data_type)
            .field("state", &self.state())
            .finish()
    }
}

/// The one-shot response sink behind an HTTP exchange.
pub(crate) struct HttpSink {
    tx: Mutex<Option<oneshot::Sender<EncodedData>>>,
}

impl HttpSink {
    pub(crate) fn new() -> (HttpSink, oneshot::Receiver<EncodedData>) {
        let (tx, rx) = oneshot::channel();
        (
            HttpSink {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl ConnSink for HttpSink {
    fn send(&self, data: EncodedData) -> crate::Result<()> {
        let tx = self.tx.lock().unwrap().take();
        match tx {
            Some(tx) => tx
                .send(data)
                .map_err(|_| TsrpcError::network("HTTP exchange already finished")),
            None => Err(TsrpcError::local("Response already sent")),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    fn supports_push(&self) -> bool {
        false
    }
}
