//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Each text frame carries one JSON envelope. Outbound frames are queued
//! on an unbounded channel and written by a single writer task, which is
//! what makes concurrent `send` calls safe.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_observer::Observer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::{Transport, TransportError, TransportEvent, TransportId, dispatch_frame};

type WsStream = WebSocketStream<TcpStream>;

/// Accepts WebSocket connections and turns them into transports.
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    /// Binds a listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self { listener })
    }

    /// Returns the local address, useful after binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the next TCP connection without upgrading it.
    ///
    /// Servers should finish the upgrade on a separate task (see
    /// [`PendingConnection`]) so one slow handshake does not stall the
    /// accept loop.
    pub async fn accept_pending(&self) -> Result<PendingConnection, TransportError> {
        let (stream, remote_addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        Ok(PendingConnection {
            stream,
            remote_addr,
        })
    }

    /// Accepts the next connection and completes the WebSocket upgrade.
    pub async fn accept(&self) -> Result<Arc<WebSocketTransport>, TransportError> {
        self.accept_pending().await?.upgrade().await
    }

    /// Accepts the next connection, requiring query parameter `name` on
    /// the upgrade URL. See [`PendingConnection::upgrade_with_param`].
    pub async fn accept_with_param(
        &self,
        name: &str,
    ) -> Result<(Arc<WebSocketTransport>, String), TransportError> {
        self.accept_pending().await?.upgrade_with_param(name).await
    }
}

/// A TCP connection whose WebSocket upgrade has not happened yet.
#[derive(Debug)]
pub struct PendingConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl PendingConnection {
    /// The remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Completes the WebSocket upgrade.
    pub async fn upgrade(self) -> Result<Arc<WebSocketTransport>, TransportError> {
        let ws = tokio_tungstenite::accept_async(self.stream)
            .await
            .map_err(handshake_failed)?;
        Ok(WebSocketTransport::new(ws, self.remote_addr))
    }

    /// Completes the upgrade, requiring query parameter `name` on the
    /// upgrade URL (e.g. `ws://host/?peerId=alice`), and returns its value.
    ///
    /// The upgrade is refused with `400 Bad Request` when the parameter
    /// is missing or empty. Values are taken verbatim (no
    /// percent-decoding).
    pub async fn upgrade_with_param(
        self,
        name: &str,
    ) -> Result<(Arc<WebSocketTransport>, String), TransportError> {
        let remote_addr = self.remote_addr;
        let mut value = None;
        let callback = |request: &Request, response: Response| {
            match query_param(request.uri().query(), name) {
                Some(found) => {
                    value = Some(found.to_owned());
                    Ok(response)
                }
                None => {
                    tracing::debug!(
                        %remote_addr,
                        param = name,
                        "rejecting upgrade without required parameter"
                    );
                    let mut rejection =
                        ErrorResponse::new(Some(format!("missing `{name}` query parameter")));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(self.stream, callback)
            .await
            .map_err(handshake_failed)?;

        // The callback accepted the upgrade, so it found the value.
        let value = value.ok_or_else(|| {
            TransportError::AcceptFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("missing `{name}` query parameter"),
            ))
        })?;
        Ok((WebSocketTransport::new(ws, remote_addr), value))
    }
}

fn handshake_failed(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Handshake(Box::new(e))
}

/// Finds `name=value` in a URL query string. Empty values count as absent.
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// A single WebSocket connection.
pub struct WebSocketTransport {
    id: TransportId,
    remote_addr: SocketAddr,
    closed: AtomicBool,
    /// Feeds the writer task. Taken on close so the writer drains and exits.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Read half. Taken by `run`.
    inbound: Mutex<Option<SplitStream<WsStream>>>,
    shutdown: watch::Sender<bool>,
    events: Observer<TransportEvent>,
}

impl WebSocketTransport {
    fn new(ws: WsStream, remote_addr: SocketAddr) -> Arc<Self> {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let transport = Arc::new_cyclic(|weak: &Weak<Self>| {
            tokio::spawn(write_loop(sink, rx, weak.clone()));
            Self {
                id: TransportId::next(),
                remote_addr,
                closed: AtomicBool::new(false),
                outbound: Mutex::new(Some(tx)),
                inbound: Mutex::new(Some(stream)),
                shutdown: watch::Sender::new(false),
                events: Observer::new(),
            }
        });

        tracing::debug!(transport = %transport.id, %remote_addr, "accepted WebSocket connection");
        transport
    }

    /// The remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Reads frames until the connection ends or the transport is closed.
    ///
    /// Text frames are decoded and emitted; binary, ping and pong frames
    /// are skipped. A read error or a close frame closes the transport.
    /// Returns immediately if the read loop is already running or ran.
    pub async fn run(&self) -> Result<(), TransportError> {
        let stream = self.inbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut stream) = stream else {
            return Ok(());
        };
        let mut shutdown = self.shutdown.subscribe();

        let result = loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = shutdown.wait_for(|closed| *closed) => break Ok(()),
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    dispatch_frame(self.id, &self.events, text.as_bytes());
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    tracing::warn!(transport = %self.id, "ignoring binary frame");
                }
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    break Err(TransportError::ReceiveFailed(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        };

        self.close();
        result
    }
}

/// Writes queued frames until the queue closes or a write fails.
async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    transport: Weak<WebSocketTransport>,
) {
    while let Some(data) = rx.recv().await {
        let frame = match String::from_utf8(data) {
            Ok(text) => WsMessage::text(text),
            Err(e) => WsMessage::binary(e.into_bytes()),
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "WebSocket write failed");
            if let Some(transport) = transport.upgrade() {
                transport.close();
            }
            return;
        }
    }
    // Queue closed: the transport was closed locally.
    let _ = sink.close().await;
}

impl Transport for WebSocketTransport {
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(data)
                .map_err(|_| TransportError::ConnectionClosed(self.id)),
            None => Err(TransportError::ConnectionClosed(self.id)),
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(transport = %self.id, remote_addr = %self.remote_addr, "close()");

        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.shutdown.send_replace(true);

        self.events.safe_emit(&TransportEvent::Close);
        self.events.remove_all_listeners();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn events(&self) -> &Observer<TransportEvent> {
        &self.events
    }

    fn id(&self) -> TransportId {
        self.id
    }
}
