//! Self-reconnecting event stream from the coordination server
//!
//! After connecting, the client subscribes to agent status changes and new
//! messages, then runs two background tasks:
//!
//! - a read loop that decodes pushed [`Event`]s onto a bounded queue and,
//!   when the connection fails, reconnects with exponential backoff
//! - a health loop that pings the server on a fixed interval while connected
//!
//! A failed ping only marks the connection down; reconnecting stays the read
//! loop's job once it observes the failure.

use super::Event;
use crate::config::ControllerSettings;
use crate::error::{AscError, Result};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::Span;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Capacity of the event queue
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Event names subscribed to after every (re)connect
const SUBSCRIPTIONS: [&str; 2] = ["agent_status", "new_message"];

/// Timing knobs for the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Wait after a disconnect before the first reconnect attempt
    pub reconnect_delay: Duration,
    /// Cap for the doubling reconnect delay
    pub max_reconnect_delay: Duration,
    /// Interval between pings
    pub health_check_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay,
            max_reconnect_delay: settings.max_reconnect_delay,
            health_check_interval: settings.health_check_interval,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.reconnect_delay,
            initial_interval: self.reconnect_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_reconnect_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

struct Inner {
    url: String,
    config: StreamConfig,
    sink: RwLock<Option<Arc<Mutex<WsSink>>>>,
    connected: AtomicBool,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    span: Span,
}

/// WebSocket client that keeps an event subscription alive
pub struct EventStreamClient {
    inner: Arc<Inner>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<Event>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EventStreamClient {
    /// Create a client for `url` (a `ws://` or `wss://` endpoint).
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, StreamConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: StreamConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                sink: RwLock::new(None),
                connected: AtomicBool::new(false),
                events_tx,
                cancel: CancellationToken::new(),
                span: tracing::info_span!("event_stream"),
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Emit all log events under `span`. Call before [`connect`](Self::connect).
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Take the receiving end of the event queue. Returns `None` once taken.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().ok()?.take()
    }

    /// Whether the connection is currently marked up
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connect, subscribe, and start the background loops.
    ///
    /// # Errors
    ///
    /// Fails if the connection or either subscription cannot be established,
    /// or if the client was closed or is already running.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(AscError::Stream("client has been closed".into()));
        }
        if self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(true) {
            return Err(AscError::Stream("client already connected".into()));
        }

        let source = self.inner.establish().await?;

        let read = tokio::spawn(read_loop(Arc::clone(&self.inner), source));
        let health = tokio::spawn(health_loop(Arc::clone(&self.inner)));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(read);
            tasks.push(health);
        }
        Ok(())
    }

    /// Stop both loops and release the connection.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);

        let sink = self.inner.sink.write().await.take();
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().await.close().await {
                tracing::debug!(parent: &self.inner.span, error = %e, "error closing connection");
            }
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(parent: &self.inner.span, error = %e, "stream task ended abnormally");
            }
        }
        tracing::info!(parent: &self.inner.span, "event stream closed");
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    /// Open the socket, emit `Connected`, and subscribe.
    async fn establish(&self) -> Result<WsSource> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| AscError::Stream(format!("failed to connect to {}: {e}", self.url)))?;

        let (sink, source) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        *self.sink.write().await = Some(Arc::clone(&sink));
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(parent: &self.span, url = %self.url, "event stream connected");
        self.emit(Event::Connected).await;

        for event in SUBSCRIPTIONS {
            if let Err(e) = subscribe(&sink, event).await {
                self.connected.store(false, Ordering::SeqCst);
                self.sink.write().await.take();
                let _ = sink.lock().await.close().await;
                return Err(e);
            }
        }

        Ok(source)
    }

    async fn emit(&self, event: Event) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = self.events_tx.send(event) => {
                if res.is_err() {
                    tracing::trace!(parent: &self.span, "event receiver dropped");
                }
            }
        }
    }

    /// Mark the connection down, emitting `Disconnected` on the transition.
    async fn mark_disconnected(&self, reason: String) {
        self.sink.write().await.take();
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(parent: &self.span, reason = %reason, "event stream disconnected");
            self.emit(Event::Disconnected { error: Some(reason) }).await;
        }
    }

    /// Reconnect until it succeeds or the client is closed.
    async fn reconnect(&self) -> Option<WsSource> {
        let mut backoff = self.config.backoff();

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                res = self.establish() => res,
            };

            match attempt {
                Ok(source) => return Some(source),
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.config.max_reconnect_delay);
                    tracing::warn!(
                        parent: &self.span,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "reconnect failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

async fn subscribe(sink: &Mutex<WsSink>, event: &str) -> Result<()> {
    let frame = serde_json::json!({ "action": "subscribe", "event": event }).to_string();
    sink.lock()
        .await
        .send(WsMessage::Text(frame.into()))
        .await
        .map_err(|e| AscError::Stream(format!("failed to subscribe to {event}: {e}")))
}

async fn read_loop(inner: Arc<Inner>, mut source: WsSource) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            frame = source.next() => frame,
        };

        let reason = match frame {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<Event>(text.as_str()) {
                    Ok(event) => inner.emit(event).await,
                    Err(e) => {
                        tracing::warn!(parent: &inner.span, error = %e, "skipping malformed event")
                    }
                }
                continue;
            }
            Some(Ok(WsMessage::Close(_))) => "connection closed by server".to_string(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => e.to_string(),
            None => "connection ended".to_string(),
        };

        inner.mark_disconnected(reason).await;

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }

        match inner.reconnect().await {
            Some(next) => source = next,
            None => return,
        }
    }
}

async fn health_loop(inner: Arc<Inner>) {
    let period = inner.config.health_check_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if !inner.connected.load(Ordering::SeqCst) {
            continue;
        }

        let sink = inner.sink.read().await.clone();
        let Some(sink) = sink else { continue };

        let ping = sink.lock().await.send(WsMessage::Ping(Vec::new().into())).await;
        if let Err(e) = ping {
            tracing::debug!(parent: &inner.span, error = %e, "ping failed");
            if inner.connected.swap(false, Ordering::SeqCst) {
                inner
                    .emit(Event::Disconnected { error: Some("ping failed".into()) })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = StreamConfig {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
        };
        let mut backoff = config.backoff();
        let delays: Vec<u128> = (0..7)
            .filter_map(|_| backoff.next_backoff())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = EventStreamClient::new(format!("ws://{addr}/ws"));
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let client = EventStreamClient::new("ws://127.0.0.1:1/ws");
        client.close().await;
        client.close().await;
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_ping_marks_down_once_without_reconnecting() {
        use std::sync::atomic::AtomicUsize;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                tokio::spawn(async move { while ws.next().await.is_some() {} });
            }
        });

        let url = format!("ws://{addr}/ws");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut sink, _source) = ws.split();
        // Every later write on this half fails
        sink.close().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            url,
            config: StreamConfig {
                reconnect_delay: Duration::from_millis(10),
                max_reconnect_delay: Duration::from_millis(100),
                health_check_interval: Duration::from_millis(20),
            },
            sink: RwLock::new(Some(Arc::new(Mutex::new(sink)))),
            connected: AtomicBool::new(true),
            events_tx,
            cancel: CancellationToken::new(),
            span: Span::none(),
        });
        let health = tokio::spawn(health_loop(Arc::clone(&inner)));

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Event::Disconnected { error: Some("ping failed".into()) });
        assert!(!inner.connected.load(Ordering::SeqCst));

        // Later ticks neither repeat the event nor reconnect
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events_rx.try_recv().is_err());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // The read loop noticing the same failure stays silent
        inner.mark_disconnected("connection ended".into()).await;
        assert!(events_rx.try_recv().is_err());

        inner.cancel.cancel();
        health.await.unwrap();
    }
}
