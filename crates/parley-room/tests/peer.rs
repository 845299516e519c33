//! Integration tests for peers: correlation, timeouts, and close.
//!
//! Most tests wire two peers back to back over a `MemoryTransport` pair.
//! Tests that need to see exact wire traffic, or to inject frames the
//! other side would never send, use a recording transport instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_observer::Observer;
use parley_protocol::{IdSource, Message, MessageFactory, Payload, RemoteError, SequentialIds};
use parley_room::{Peer, PeerConfig, PeerError, PeerEvent, PeerEventKind, Responder};
use parley_transport::{MemoryTransport, Transport, TransportError, TransportEvent, TransportId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

// =========================================================================
// Helpers
// =========================================================================

fn short_timeouts() -> PeerConfig {
    PeerConfig {
        request_timeout: Duration::from_millis(100),
        timeout_per_pending: Duration::from_millis(10),
    }
}

/// Two peers talking over a memory pair, both read loops running.
fn connected(config: PeerConfig) -> (Arc<Peer>, Arc<Peer>) {
    let (a, b) = MemoryTransport::pair();
    for transport in [&a, &b] {
        let transport = Arc::clone(transport);
        tokio::spawn(async move {
            let _ = transport.run().await;
        });
    }
    let local = Peer::with_config("local", (), a, config.clone(), MessageFactory::default());
    let remote = Peer::with_config("remote", (), b, config, MessageFactory::default());
    (local, remote)
}

/// Forwards every request the peer receives, unanswered, to a channel.
fn collect_requests(peer: &Peer) -> mpsc::UnboundedReceiver<(String, Payload, Responder)> {
    let (tx, rx) = mpsc::unbounded_channel();
    peer.events().on(PeerEventKind::Request, move |event| {
        if let PeerEvent::Request(request) = event {
            let _ = tx.send((
                request.method().to_owned(),
                request.data().clone(),
                request.responder(),
            ));
        }
    });
    rx
}

async fn wait_for_pending(peer: &Peer, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while peer.pending_count() != count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pending count should be reached");
}

/// A transport that records what is sent and lets the test inject inbound
/// messages directly.
struct RecordingTransport {
    id: TransportId,
    sent: Mutex<Vec<Message>>,
    sent_tx: mpsc::UnboundedSender<Message>,
    fail_sends: AtomicBool,
    /// Closes the transport from inside `send`, as a concurrent close would.
    close_on_send: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    events: Observer<TransportEvent>,
}

impl RecordingTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: TransportId::next(),
            sent: Mutex::new(Vec::new()),
            sent_tx,
            fail_sends: AtomicBool::new(false),
            close_on_send: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            events: Observer::new(),
        });
        (transport, sent_rx)
    }

    fn inject(&self, message: Message) {
        self.events.safe_emit(&TransportEvent::Message(message));
    }

    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.close_on_send.load(Ordering::SeqCst) {
            self.close();
        }
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(std::io::Error::other("broken pipe")));
        }
        let message = Message::from_slice(&data).expect("peer sends valid envelopes");
        self.sent.lock().unwrap().push(message.clone());
        let _ = self.sent_tx.send(message);
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.safe_emit(&TransportEvent::Close);
        self.events.remove_all_listeners();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn events(&self) -> &Observer<TransportEvent> {
        &self.events
    }

    fn id(&self) -> TransportId {
        self.id
    }
}

/// Hands out a fixed list of ids, in order.
struct ScriptedIds(Mutex<Vec<u32>>);

impl IdSource for ScriptedIds {
    fn next_id(&self) -> u32 {
        self.0.lock().unwrap().remove(0)
    }
}

/// Parks whichever thread logs "response received" until released.
///
/// That event fires after a response has claimed its pending entry and
/// before the reply reaches the waiting request.
struct HoldResponses {
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl<S: tracing::Subscriber> Layer<S> for HoldResponses {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = EventMessage::default();
        event.record(&mut message);
        if message.0 == "response received" {
            let _ = self.release.lock().unwrap().recv();
        }
    }
}

#[derive(Default)]
struct EventMessage(String);

impl tracing::field::Visit for EventMessage {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Offer {
    sdp: String,
}

// =========================================================================
// Requests and responses
// =========================================================================

#[tokio::test]
async fn test_request_resolves_with_accepted_payload() {
    let (local, remote) = connected(short_timeouts());
    remote.events().on(PeerEventKind::Request, |event| {
        if let PeerEvent::Request(request) = event {
            let offer: Offer = request.data().decode().unwrap();
            request
                .accept(&Offer {
                    sdp: format!("answer to {}", offer.sdp),
                })
                .unwrap();
        }
    });

    let reply = local
        .request("offer", &Offer { sdp: "v=0".into() })
        .await
        .unwrap();

    assert_eq!(
        reply.decode::<Offer>().unwrap(),
        Offer {
            sdp: "answer to v=0".into()
        }
    );
    assert_eq!(local.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_answered_in_reverse_order() {
    let (local, remote) = connected(PeerConfig::default());
    let mut requests = collect_requests(&remote);

    let first = tokio::spawn({
        let local = Arc::clone(&local);
        async move { local.request("first", &1).await }
    });
    let (method_a, _, responder_a) = requests.recv().await.unwrap();

    let second = tokio::spawn({
        let local = Arc::clone(&local);
        async move { local.request("second", &2).await }
    });
    let (method_b, _, responder_b) = requests.recv().await.unwrap();
    assert_eq!((method_a.as_str(), method_b.as_str()), ("first", "second"));

    responder_b.accept(&"two").unwrap();
    responder_a.accept(&"one").unwrap();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.decode::<String>().unwrap(), "one");
    assert_eq!(second.decode::<String>().unwrap(), "two");
    assert_eq!(local.pending_count(), 0);
}

#[tokio::test]
async fn test_rejected_request_carries_remote_error() {
    let (local, remote) = connected(short_timeouts());
    remote.events().on(PeerEventKind::Request, |event| {
        if let PeerEvent::Request(request) = event {
            request.reject(RemoteError::new(403, "not allowed")).unwrap();
        }
    });

    match local.request("join", &()).await.unwrap_err() {
        PeerError::Rejected(error) => {
            assert_eq!(error, RemoteError::new(403, "not allowed"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_plain_string_rejection_becomes_internal_error() {
    let (local, remote) = connected(short_timeouts());
    remote.events().on(PeerEventKind::Request, |event| {
        if let PeerEvent::Request(request) = event {
            request.reject("database unavailable").unwrap();
        }
    });

    let PeerError::Rejected(error) = local.request("join", &()).await.unwrap_err() else {
        panic!("expected Rejected");
    };
    assert_eq!(error.code, 500);
    assert_eq!(error.reason, "database unavailable");
}

#[tokio::test]
async fn test_only_first_responder_wins() {
    let (local, remote) = connected(short_timeouts());
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for answer in ["first", "second"] {
        let outcomes = Arc::clone(&outcomes);
        remote.events().on(PeerEventKind::Request, move |event| {
            if let PeerEvent::Request(request) = event {
                outcomes.lock().unwrap().push(request.accept(&answer).is_ok());
            }
        });
    }

    let reply = local.request("pick", &()).await.unwrap();

    assert_eq!(reply.decode::<String>().unwrap(), "first");
    assert_eq!(*outcomes.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_notification_reaches_remote() {
    let (local, remote) = connected(short_timeouts());
    let (tx, mut rx) = mpsc::unbounded_channel();
    remote.events().on(PeerEventKind::Notification, move |event| {
        if let PeerEvent::Notification(notification) = event {
            let _ = tx.send(notification.clone());
        }
    });

    local.notify("chat", &"hello").unwrap();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.method, "chat");
    assert_eq!(notification.data.decode::<String>().unwrap(), "hello");
}

#[tokio::test]
async fn test_request_ids_come_from_factory() {
    let (transport, mut sent) = RecordingTransport::new();
    let factory = MessageFactory::new(Arc::new(SequentialIds::starting_at(7)));
    let peer = Peer::with_config("p", (), transport.clone(), short_timeouts(), factory);

    let waiter = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.request("ping", &()).await }
    });

    let request = sent.recv().await.unwrap();
    assert_eq!(request.id(), Some(7));
    transport.inject(Message::success_response(7, Payload::empty()));
    assert!(waiter.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_colliding_request_id_is_redrawn() {
    let (transport, mut sent) = RecordingTransport::new();
    let factory = MessageFactory::new(Arc::new(ScriptedIds(Mutex::new(vec![5, 5, 6]))));
    let peer = Peer::with_config("p", (), transport.clone(), short_timeouts(), factory);

    let first = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.request("a", &()).await }
    });
    assert_eq!(sent.recv().await.unwrap().id(), Some(5));

    let second = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.request("b", &()).await }
    });
    assert_eq!(sent.recv().await.unwrap().id(), Some(6));
    assert_eq!(peer.pending_count(), 2);

    transport.inject(Message::success_response(6, Payload::new(&"b").unwrap()));
    transport.inject(Message::success_response(5, Payload::new(&"a").unwrap()));
    assert_eq!(first.await.unwrap().unwrap().decode::<String>().unwrap(), "a");
    assert_eq!(second.await.unwrap().unwrap().decode::<String>().unwrap(), "b");
}

// =========================================================================
// Stale and unanswered traffic
// =========================================================================

#[tokio::test]
async fn test_unknown_response_id_is_dropped() {
    let (transport, mut sent) = RecordingTransport::new();
    let factory = MessageFactory::new(Arc::new(SequentialIds::starting_at(1)));
    let peer = Peer::with_config("p", (), transport.clone(), PeerConfig::default(), factory);

    let waiter = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.request("ping", &()).await }
    });
    let id = sent.recv().await.unwrap().id().unwrap();

    transport.inject(Message::success_response(id + 100, Payload::empty()));

    assert_eq!(peer.pending_count(), 1);
    assert!(!peer.is_closed());
    assert!(!waiter.is_finished());

    transport.inject(Message::success_response(id, Payload::new(&"pong").unwrap()));
    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply.decode::<String>().unwrap(), "pong");
}

#[tokio::test]
async fn test_request_without_listener_is_not_answered() {
    let (local, _remote) = connected(short_timeouts());

    let err = local.request("nobody-home", &()).await.unwrap_err();

    assert!(matches!(err, PeerError::Timeout { .. }));
}

// =========================================================================
// Timeouts
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_request_times_out_after_default_timeout() {
    let (local, remote) = connected(PeerConfig::default());
    let _requests = collect_requests(&remote);

    let started = tokio::time::Instant::now();
    let err = local.request("slow", &()).await.unwrap_err();

    match err {
        PeerError::Timeout { method, timeout } => {
            assert_eq!(method, "slow");
            assert_eq!(timeout, Duration::from_secs(15));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(local.pending_count(), 0);
    assert!(!local.is_closed());
}

#[tokio::test]
async fn test_timeout_scales_with_pending_requests() {
    let (local, remote) = connected(PeerConfig::default());
    let _requests = collect_requests(&remote);
    let baseline = local.request_timeout();

    let mut waiters = Vec::new();
    for i in 0..3 {
        let local = Arc::clone(&local);
        waiters.push(tokio::spawn(async move { local.request("hold", &i).await }));
    }
    wait_for_pending(&local, 3).await;

    let loaded = local.request_timeout();
    assert!(loaded >= baseline);
    assert_eq!(loaded, baseline + Duration::from_millis(150) * 3);

    local.close();
    for waiter in waiters {
        assert!(matches!(waiter.await.unwrap(), Err(PeerError::Closed)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_claimed_as_timer_fires_is_still_delivered() {
    let (transport, mut sent) = RecordingTransport::new();
    let config = PeerConfig {
        request_timeout: Duration::from_millis(200),
        timeout_per_pending: Duration::ZERO,
    };
    let peer = Peer::with_config("p", (), transport.clone(), config, MessageFactory::default());

    let waiter = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.request("getStats", &()).await }
    });
    let id = sent.recv().await.unwrap().id().unwrap();

    // Deliver the response from another thread and hold it after it has
    // claimed the pending entry.
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let subscriber = tracing_subscriber::registry().with(HoldResponses {
        release: Mutex::new(release_rx),
    });
    let inbound = std::thread::spawn({
        let transport = Arc::clone(&transport);
        move || {
            tracing::subscriber::with_default(subscriber, || {
                transport.inject(Message::success_response(id, Payload::new(&"stats").unwrap()));
            });
        }
    });

    wait_for_pending(&peer, 0).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!waiter.is_finished(), "request should wait for the claimed reply");

    release_tx.send(()).unwrap();
    inbound.join().unwrap();

    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply.decode::<String>().unwrap(), "stats");
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_dropped_request_future_clears_pending_entry() {
    let (local, remote) = connected(PeerConfig::default());
    let _requests = collect_requests(&remote);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), local.request("abandoned", &())).await;

    assert!(abandoned.is_err());
    assert_eq!(local.pending_count(), 0);
}

// =========================================================================
// Close
// =========================================================================

#[tokio::test]
async fn test_request_after_close_fails_immediately() {
    let (transport, _sent) = RecordingTransport::new();
    let peer = Peer::new("p", (), transport.clone());
    peer.close();

    let err = peer.request("late", &()).await.unwrap_err();

    assert!(matches!(err, PeerError::Closed));
    assert!(transport.sent().is_empty());
    assert!(matches!(peer.notify("late", &()).unwrap_err(), PeerError::Closed));
}

#[tokio::test]
async fn test_close_unblocks_waiting_request() {
    let (local, remote) = connected(PeerConfig::default());
    let mut requests = collect_requests(&remote);

    let waiter = tokio::spawn({
        let local = Arc::clone(&local);
        async move { local.request("wait", &()).await }
    });
    let _ = requests.recv().await.unwrap();

    local.close();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake promptly")
        .unwrap();
    assert!(matches!(result, Err(PeerError::Closed)));
    assert_eq!(local.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_runs_once() {
    let (transport, _sent) = RecordingTransport::new();
    let peer = Peer::new("p", (), transport.clone());
    let close_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&close_events);
    peer.events().on(PeerEventKind::Close, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let peer = Arc::clone(&peer);
        tasks.push(tokio::spawn(async move { peer.close() }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peer.is_closed());
    assert_eq!(close_events.load(Ordering::SeqCst), 1);
    assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_close_closes_peer() {
    let (local, remote) = connected(PeerConfig::default());
    let _requests = collect_requests(&remote);
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    local.events().on(PeerEventKind::Close, move |_| {
        let _ = closed_tx.send(());
    });

    let waiter = tokio::spawn({
        let local = Arc::clone(&local);
        async move { local.request("wait", &()).await }
    });
    wait_for_pending(&local, 1).await;

    remote.close();

    tokio::time::timeout(Duration::from_secs(1), closed_rx.recv())
        .await
        .expect("close should propagate");
    assert!(local.is_closed());
    assert!(matches!(waiter.await.unwrap(), Err(PeerError::Closed)));
}

#[tokio::test]
async fn test_failed_send_returns_without_waiting() {
    let (transport, _sent) = RecordingTransport::new();
    transport.fail_sends.store(true, Ordering::SeqCst);
    let peer = Peer::new("p", (), transport.clone());

    let err = tokio::time::timeout(Duration::from_secs(1), peer.request("ping", &()))
        .await
        .expect("send failure should not wait for a reply")
        .unwrap_err();

    assert!(matches!(err, PeerError::Transport(TransportError::SendFailed(_))));
    assert_eq!(peer.pending_count(), 0);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_send_racing_close_reports_closed() {
    let (transport, _sent) = RecordingTransport::new();
    transport.close_on_send.store(true, Ordering::SeqCst);
    let peer = Peer::new("p", (), transport.clone());

    let err = peer.request("ping", &()).await.unwrap_err();

    assert!(matches!(err, PeerError::Closed));
    assert!(peer.is_closed());
    assert_eq!(peer.pending_count(), 0);

    let (transport, _sent) = RecordingTransport::new();
    transport.close_on_send.store(true, Ordering::SeqCst);
    let peer = Peer::new("q", (), transport.clone());

    assert!(matches!(peer.notify("chat", &"hi").unwrap_err(), PeerError::Closed));
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_inbound_ignored_after_close() {
    let (transport, _sent) = RecordingTransport::new();
    let peer = Peer::new("p", (), transport.clone());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    peer.events().on(PeerEventKind::Notification, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    peer.close();
    transport.inject(Message::notification("late", Payload::empty()));

    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_can_close_peer_reentrantly() {
    let (transport, _sent) = RecordingTransport::new();
    let peer = Peer::new("p", (), transport.clone());
    let weak = Arc::downgrade(&peer);
    peer.events().on(PeerEventKind::Notification, move |_| {
        if let Some(peer) = weak.upgrade() {
            peer.close();
        }
    });

    transport.inject(Message::notification("bye", Payload::empty()));

    assert!(peer.is_closed());
    assert!(transport.is_closed());
}
