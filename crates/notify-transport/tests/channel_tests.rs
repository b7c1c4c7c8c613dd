//! Channel state machine tests, driven by a scripted connector on paused time.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use notify_protocol::{ChannelError, PushMessage};
use notify_transport::*;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

const ENDPOINT: &str = "ws://push.test/ws";

// ─────────────────────────────────────────────────────────────────────────────
// Scripted connector
// ─────────────────────────────────────────────────────────────────────────────

type CloseLog = Arc<Mutex<Vec<Option<CloseRequest>>>>;

#[derive(Clone)]
struct Opened {
    url: String,
    events: TransportEvents,
    closes: CloseLog,
}

#[derive(Default)]
struct FakeState {
    opened: Vec<Opened>,
    fail_next: bool,
    drains: usize,
}

#[derive(Clone, Default)]
struct FakeConnector(Arc<Mutex<FakeState>>);

impl FakeConnector {
    fn opened_count(&self) -> usize {
        self.0.lock().opened.len()
    }

    fn nth(&self, index: usize) -> Opened {
        self.0.lock().opened[index].clone()
    }

    fn last(&self) -> Opened {
        self.0.lock().opened.last().cloned().expect("no transport opened")
    }

    fn fail_next_open(&self) {
        self.0.lock().fail_next = true;
    }

    fn drains(&self) -> usize {
        self.0.lock().drains
    }
}

struct FakeTransport {
    closes: CloseLog,
}

impl Transport for FakeTransport {
    fn close(self: Box<Self>, request: Option<CloseRequest>) {
        self.closes.lock().push(request);
    }
}

impl Connector for FakeConnector {
    fn open(&self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>, ChannelError> {
        let mut state = self.0.lock();
        if state.fail_next {
            state.fail_next = false;
            return Err(ChannelError::Transport("socket construction failed".into()));
        }
        let closes = CloseLog::default();
        state.opened.push(Opened {
            url: url.to_string(),
            events,
            closes: closes.clone(),
        });
        Ok(Box::new(FakeTransport { closes }))
    }

    fn drain(&self) -> BoxFuture<'static, ()> {
        self.0.lock().drains += 1;
        Box::pin(async {})
    }
}

fn channel() -> (NotificationChannel, FakeConnector) {
    channel_with(ChannelConfig::with_endpoint(ENDPOINT))
}

fn channel_with(config: ChannelConfig) -> (NotificationChannel, FakeConnector) {
    let connector = FakeConnector::default();
    let channel = NotificationChannel::with_connector(config, connector.clone());
    (channel, connector)
}

/// Let every task run until it blocks (time is paused, so this is exact).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn connect_and_open(channel: &NotificationChannel, connector: &FakeConnector, token: &str) {
    channel.connect(token);
    settle().await;
    connector.last().events.opened();
    settle().await;
    assert!(channel.is_connected());
}

fn drop_unclean(opened: &Opened) {
    opened.events.closed(CloseInfo::abnormal("connection reset"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn is_connected_follows_open_and_close() {
    let (channel, connector) = channel();
    assert!(!channel.is_connected());
    assert_eq!(channel.snapshot(), ChannelSnapshot::default());

    channel.connect("abc");
    settle().await;
    assert!(!channel.is_connected());
    assert_eq!(channel.snapshot().state, ConnectionState::Connecting);
    assert_eq!(connector.last().url, "ws://push.test/ws?token=abc");

    connector.last().events.opened();
    settle().await;
    assert!(channel.is_connected());
    assert_eq!(channel.snapshot().state, ConnectionState::Open);

    connector.last().events.closed(CloseInfo::clean(1000, "bye"));
    settle().await;
    assert!(!channel.is_connected());
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);

    // A clean close never schedules a retry.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opened_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn bearer_prefix_is_stripped_from_url() {
    let (channel, connector) = channel();
    channel.connect("Bearer xyz");
    settle().await;
    assert_eq!(connector.last().url, "ws://push.test/ws?token=xyz");
}

#[tokio::test(start_paused = true)]
async fn empty_token_is_ignored() {
    let (channel, connector) = channel();
    channel.connect("");
    channel.connect("Bearer ");
    settle().await;
    assert_eq!(connector.opened_count(), 0);
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_while_open_closes_previous_handle_once() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    channel.connect("def");
    settle().await;
    assert_eq!(connector.opened_count(), 2);
    assert_eq!(*connector.nth(0).closes.lock(), vec![None]);
    assert!(connector.nth(1).closes.lock().is_empty());
    assert!(connector.nth(1).url.ends_with("?token=def"));

    connector.last().events.opened();
    settle().await;
    channel.connect("ghi");
    settle().await;
    assert_eq!(connector.opened_count(), 3);
    assert_eq!(connector.nth(0).closes.lock().len(), 1);
    assert_eq!(connector.nth(1).closes.lock().len(), 1);
    assert!(connector.nth(2).closes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_while_in_flight_is_noop() {
    let (channel, connector) = channel();
    channel.connect("abc");
    settle().await;
    channel.connect("abc");
    settle().await;

    assert_eq!(connector.opened_count(), 1);
    assert!(connector.nth(0).closes.lock().is_empty());
    assert_eq!(channel.snapshot().state, ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn construction_failure_is_handled_locally() {
    let (channel, connector) = channel();
    connector.fail_next_open();
    channel.connect("abc");
    settle().await;
    assert_eq!(connector.opened_count(), 0);
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);

    // The in-flight guard was released, so the next connect goes through.
    channel.connect("abc");
    settle().await;
    assert_eq!(connector.opened_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_endpoint_is_handled_locally() {
    let (channel, connector) = channel_with(ChannelConfig::with_endpoint("http://push.test/ws"));
    channel.connect("abc");
    settle().await;
    assert_eq!(connector.opened_count(), 0);
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnect
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_sends_logout_and_suppresses_reconnect() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    channel.disconnect();
    settle().await;
    assert_eq!(*connector.nth(0).closes.lock(), vec![Some(CloseRequest::logout())]);
    let snapshot = channel.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.force_closed);
    assert_eq!(snapshot.reconnect_attempts, 0);

    // The close event that follows must not schedule anything.
    drop_unclean(&connector.nth(0));
    settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opened_count(), 1);
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let (channel, connector) = channel();
    channel.disconnect();
    channel.disconnect();
    settle().await;
    assert_eq!(connector.opened_count(), 0);
    assert!(channel.snapshot().force_closed);

    // The next explicit connect clears the flag.
    channel.connect("abc");
    settle().await;
    assert!(!channel.snapshot().force_closed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    drop_unclean(&connector.last());
    settle().await;
    assert_eq!(channel.snapshot().state, ConnectionState::ReconnectPending);

    channel.disconnect();
    settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opened_count(), 1);
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_open_connection() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    channel.shutdown().await;
    assert_eq!(*connector.nth(0).closes.lock(), vec![Some(CloseRequest::logout())]);
    assert_eq!(connector.drains(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_sockets_closed_by_disconnect() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    channel.disconnect();
    settle().await;
    assert_eq!(connector.drains(), 0);

    channel.shutdown().await;
    assert_eq!(connector.drains(), 1);
}

#[test]
fn handle_outliving_its_runtime_does_not_panic() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let connector = FakeConnector::default();
    let channel = runtime.block_on(async {
        NotificationChannel::with_connector(ChannelConfig::with_endpoint(ENDPOINT), connector.clone())
    });
    drop(runtime);

    // The task is gone: commands are logged and dropped.
    channel.connect("abc");
    channel.disconnect();
    assert!(!channel.is_connected());
    assert_eq!(connector.opened_count(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unclean_closes_exhaust_the_retry_budget() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    // First drop: a retry fires after 3000 ms.
    drop_unclean(&connector.last());
    settle().await;
    assert_eq!(channel.snapshot().state, ConnectionState::ReconnectPending);
    tokio::time::sleep(Duration::from_millis(2990)).await;
    assert_eq!(connector.opened_count(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    settle().await;
    assert_eq!(connector.opened_count(), 2);
    assert_eq!(channel.reconnect_attempts(), 1);
    assert!(connector.last().url.ends_with("?token=abc"));

    // Four more failed attempts.
    for attempt in 2..=5u32 {
        drop_unclean(&connector.last());
        settle().await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        settle().await;
        assert_eq!(connector.opened_count(), attempt as usize + 1);
        assert_eq!(channel.reconnect_attempts(), attempt);
    }

    // Sixth drop: budget spent, nothing scheduled.
    drop_unclean(&connector.last());
    settle().await;
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.opened_count(), 6);
    assert_eq!(channel.reconnect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn successful_open_restores_the_full_budget() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    for _ in 0..3 {
        drop_unclean(&connector.last());
        settle().await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        settle().await;
    }
    assert_eq!(channel.reconnect_attempts(), 3);

    connector.last().events.opened();
    settle().await;
    assert_eq!(channel.reconnect_attempts(), 0);
    assert!(channel.is_connected());

    // Five more retries are available again.
    for attempt in 1..=5u32 {
        drop_unclean(&connector.last());
        settle().await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        settle().await;
        assert_eq!(channel.reconnect_attempts(), attempt);
    }
    assert_eq!(connector.opened_count(), 4 + 5);
}

#[tokio::test(start_paused = true)]
async fn error_then_close_schedules_retry() {
    let (channel, connector) = channel();
    channel.connect("abc");
    settle().await;

    let first = connector.last();
    first.events.errored("connection refused");
    settle().await;
    assert_eq!(channel.snapshot().state, ConnectionState::Disconnected);

    drop_unclean(&first);
    settle().await;
    assert_eq!(channel.snapshot().state, ConnectionState::ReconnectPending);
    tokio::time::sleep(Duration::from_millis(3000)).await;
    settle().await;
    assert_eq!(connector.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_cancels_pending_retry() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    drop_unclean(&connector.last());
    settle().await;
    channel.connect("fresh");
    settle().await;
    assert_eq!(connector.opened_count(), 2);
    assert!(connector.last().url.ends_with("?token=fresh"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn events_from_replaced_transport_are_ignored() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;

    channel.connect("def");
    settle().await;
    let stale = connector.nth(0);
    stale.events.opened();
    drop_unclean(&stale);
    settle().await;

    assert_eq!(channel.snapshot().state, ConnectionState::Connecting);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn custom_retry_settings_are_honored() {
    let config = ChannelConfig {
        max_reconnect_attempts: 1,
        reconnect_delay: Duration::from_millis(100),
        ..ChannelConfig::with_endpoint(ENDPOINT)
    };
    let (channel, connector) = channel_with(config);
    connect_and_open(&channel, &connector, "abc").await;

    drop_unclean(&connector.last());
    settle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(connector.opened_count(), 2);

    drop_unclean(&connector.last());
    settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.opened_count(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

fn notification_json(id: i64) -> String {
    json!({
        "id": id,
        "user_id": 1,
        "type": "comment",
        "title": "New comment",
        "content": "Someone replied",
        "target_type": "post",
        "target_id": 9,
        "is_read": 0,
        "is_pushed": 1,
        "created_at": "2024-05-01 10:00:00",
        "updated_at": "2024-05-01 10:00:00"
    })
    .to_string()
}

#[tokio::test(start_paused = true)]
async fn messages_reach_the_registered_sink() {
    let (channel, connector) = channel();
    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    let sink = Arc::new(tx);
    channel.set_notification_banner(&sink);
    connect_and_open(&channel, &connector, "abc").await;

    connector.last().events.message(Payload::Text(notification_json(7)));
    settle().await;

    let message = rx.try_recv().unwrap();
    assert_eq!(message.notification().unwrap().id, 7);
}

#[tokio::test(start_paused = true)]
async fn malformed_json_is_dropped_without_closing() {
    let (channel, connector) = channel();
    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    let sink = Arc::new(tx);
    channel.set_notification_banner(&sink);
    connect_and_open(&channel, &connector, "abc").await;

    let events = connector.last().events;
    events.message(Payload::Text("{not json".into()));
    events.message(Payload::Binary(vec![0xff, 0x00]));
    events.message(Payload::Binary(notification_json(8).into_bytes()));
    settle().await;

    assert_eq!(rx.try_recv().unwrap().notification().unwrap().id, 8);
    assert!(rx.try_recv().is_err());
    assert!(channel.is_connected());
    assert!(connector.last().closes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sink_is_held_weakly_and_can_be_cleared() {
    let (channel, connector) = channel();
    connect_and_open(&channel, &connector, "abc").await;
    let events = connector.last().events;

    // No sink: messages are dropped quietly.
    events.message(Payload::Text(notification_json(1)));
    settle().await;

    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    let sink = Arc::new(tx);
    channel.set_notification_banner(&sink);
    events.message(Payload::Text(notification_json(2)));
    settle().await;
    assert_eq!(rx.try_recv().unwrap().notification().unwrap().id, 2);

    channel.clear_notification_banner();
    events.message(Payload::Text(notification_json(3)));
    settle().await;
    assert!(rx.try_recv().is_err());

    channel.set_notification_banner(&sink);
    drop(sink);
    events.message(Payload::Text(notification_json(4)));
    settle().await;
    assert!(channel.is_connected());
}

// ─────────────────────────────────────────────────────────────────────────────
// Token providers
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_with_static_token() {
    let (channel, connector) = channel();
    let provider = StaticToken::new("Bearer from-flag").unwrap();
    channel.connect_with(&provider);
    settle().await;
    assert!(connector.last().url.ends_with("?token=from-flag"));
}

#[tokio::test(start_paused = true)]
async fn connect_with_token_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token");
    let provider = TokenFile::new(&path);

    let (channel, connector) = channel();
    channel.connect_with(&provider);
    settle().await;
    assert_eq!(connector.opened_count(), 0);

    std::fs::write(&path, "Bearer from-file\n").unwrap();
    channel.connect_with(&provider);
    settle().await;
    assert!(connector.last().url.ends_with("?token=from-file"));
}

#[test]
fn empty_token_file_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token");
    std::fs::write(&path, "   \n").unwrap();
    assert!(TokenFile::new(&path).token().is_none());
    assert!(StaticToken::new("").is_err());
}
