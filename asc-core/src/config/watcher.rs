//! Debounced hot-reload of the fleet configuration
//!
//! [`ConfigWatcher`] watches a single file. Create and modify events restart
//! a debounce timer; once the file has been quiet for the debounce interval
//! it is loaded and validated. A valid configuration is pushed onto a bounded
//! event queue and then handed to every registered [`ReloadHandler`] in
//! registration order. An invalid one is logged and otherwise ignored, so the
//! previously applied configuration stays authoritative.

use super::Config;
use crate::error::{AscError, Result};
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Quiet period before a change is reloaded
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Capacity of the reload event queue
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Callback invoked with each successfully reloaded configuration
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    /// Handle a new configuration. Errors are logged by the watcher.
    async fn on_reload(&self, config: &Config) -> Result<()>;
}

/// Watches a configuration file and reloads it on change
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    handlers: Arc<RwLock<Vec<Arc<dyn ReloadHandler>>>>,
    events_tx: mpsc::Sender<Arc<Config>>,
    events_rx: Mutex<Option<mpsc::Receiver<Arc<Config>>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    span: Span,
}

impl ConfigWatcher {
    /// Create a watcher for `path`. Nothing is watched until [`start`](Self::start).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            handlers: Arc::new(RwLock::new(Vec::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            watcher: Mutex::new(None),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            span: tracing::info_span!("config_watcher"),
        }
    }

    /// Override the debounce interval.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Emit all log events under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Path being watched
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a reload handler. Handlers run in registration order.
    pub async fn on_reload(&self, handler: Arc<dyn ReloadHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Take the receiving end of the reload event queue.
    ///
    /// Returns `None` if it was already taken. When the queue is full new
    /// events are dropped instead of blocking the watcher.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Arc<Config>>> {
        self.events_rx.lock().ok()?.take()
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .watcher
                .lock()
                .map(|guard| guard.is_some())
                .unwrap_or(false)
    }

    /// Begin watching. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist, the OS watch cannot be established,
    /// or the watcher is already running or was stopped.
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AscError::Watcher("watcher has been stopped".into()));
        }

        let mut watcher_slot = self
            .watcher
            .lock()
            .map_err(|_| AscError::Watcher("watcher state poisoned".into()))?;
        if watcher_slot.is_some() {
            return Err(AscError::Watcher("watcher already running".into()));
        }

        if !self.path.is_file() {
            return Err(AscError::ConfigNotFound(self.path.clone()));
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| AscError::Watcher(format!("invalid path {}", self.path.display())))?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // Watching the directory keeps working across editors that replace
        // the file by rename.
        let (fs_tx, fs_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = fs_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| AscError::Watcher(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| AscError::Watcher(format!("failed to watch {}: {e}", dir.display())))?;

        let handle = tokio::spawn(watch_loop(WatchLoop {
            path: self.path.clone(),
            file_name,
            debounce: self.debounce,
            handlers: Arc::clone(&self.handlers),
            events_tx: self.events_tx.clone(),
            cancel: self.cancel.clone(),
            span: self.span.clone(),
            fs_rx,
        }));

        *watcher_slot = Some(watcher);
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        tracing::info!(
            parent: &self.span,
            path = %self.path.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            "config watcher started"
        );
        Ok(())
    }

    /// Stop watching and release the OS watch handle.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        let task = self.task.lock().ok().and_then(|mut t| t.take());

        if watcher.is_none() && task.is_none() {
            return;
        }
        drop(watcher);

        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(parent: &self.span, error = %e, "watch loop ended abnormally");
            }
        }
        tracing::info!(parent: &self.span, "config watcher stopped");
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchLoop {
    path: PathBuf,
    file_name: OsString,
    debounce: Duration,
    handlers: Arc<RwLock<Vec<Arc<dyn ReloadHandler>>>>,
    events_tx: mpsc::Sender<Arc<Config>>,
    cancel: CancellationToken,
    span: Span,
    fs_rx: mpsc::UnboundedReceiver<notify::Event>,
}

async fn watch_loop(mut ctx: WatchLoop) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            event = ctx.fs_rx.recv() => match event {
                Some(event) => {
                    if is_relevant(&event, &ctx.file_name) {
                        tracing::debug!(parent: &ctx.span, kind = ?event.kind, "config file changed");
                        deadline = Some(Instant::now() + ctx.debounce);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                reload(&ctx).await;
            }
        }
    }
}

fn is_relevant(event: &notify::Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

async fn reload(ctx: &WatchLoop) {
    let config = match Config::load(&ctx.path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(
                parent: &ctx.span,
                path = %ctx.path.display(),
                error = %e,
                "config reload failed, keeping previous configuration"
            );
            return;
        }
    };

    tracing::info!(
        parent: &ctx.span,
        agents = config.agents.len(),
        "configuration reloaded"
    );

    if let Err(mpsc::error::TrySendError::Full(_)) = ctx.events_tx.try_send(Arc::clone(&config)) {
        tracing::warn!(parent: &ctx.span, "reload event queue full, dropping event");
    }

    let handlers = ctx.handlers.read().await.clone();
    for (index, handler) in handlers.iter().enumerate() {
        if let Err(e) = handler.on_reload(&config).await {
            tracing::error!(parent: &ctx.span, handler = index, error = %e, "reload handler failed");
        }
    }
}
