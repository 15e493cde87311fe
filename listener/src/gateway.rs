//! Gateway contract and the bundled feed gateway.
//!
//! The platform client library is an external collaborator: the listener
//! consumes it through the [`Gateway`] trait, which hands out an
//! [`EventSource`] — a lazy, potentially-infinite sequence of raw platform
//! events. Connecting (or the stream itself) fails with
//! [`GatewayError::Auth`] for credential rejections, which the listener
//! treats as fatal, or [`GatewayError::Connection`] for anything retryable.
//!
//! The one implementation shipped here is [`FeedGateway`]: it tails a
//! JSON-lines feed file appended to by the out-of-scope platform client, one
//! raw event per line:
//!
//! ```json
//! {"type": "message", "data": {"author": "alice", "content": "hi", "channel_id": 42}}
//! ```
//!
//! Connecting seeks to the end of the feed (no replay of history, like a
//! real gateway session). Appends are picked up via a notify watcher with a
//! polling fallback; truncation or removal of the feed counts as a
//! connection drop, so the listener's reconnect/backoff path handles
//! rotation. Malformed lines are logged and skipped, never fatal.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::events::RawEvent;

/// Fallback poll interval while waiting for feed appends. Notify events can
/// be missed on some platforms; polling keeps the tail live regardless.
const FEED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors surfaced by a gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The platform rejected the credential. Fatal — the listener exits
    /// instead of reconnecting.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The connection could not be established or was lost. Retryable with
    /// backoff.
    #[error("connection error: {0}")]
    Connection(String),
}

/// A source of raw platform events, produced by [`Gateway::connect`].
#[async_trait]
pub trait EventSource: Send {
    /// Waits for the next raw event.
    ///
    /// Returns `Ok(None)` when the stream ended cleanly; the listener treats
    /// both that and `Err(Connection)` as a drop and reconnects.
    async fn next_event(&mut self) -> Result<Option<RawEvent>, GatewayError>;
}

/// The platform connection seam.
///
/// Implementations wrap whatever client library talks to the platform; tests
/// drive the listener with scripted implementations.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Establishes a session using `token` and returns the event stream.
    async fn connect(&self, token: &str) -> Result<Box<dyn EventSource>, GatewayError>;
}

/// Gateway that tails a JSON-lines feed file of raw events.
///
/// The feed is written by an already-authenticated platform client in a
/// separate process, so the token is not used by this implementation.
#[derive(Debug, Clone)]
pub struct FeedGateway {
    path: PathBuf,
}

impl FeedGateway {
    /// Creates a gateway tailing the feed at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Gateway for FeedGateway {
    async fn connect(&self, _token: &str) -> Result<Box<dyn EventSource>, GatewayError> {
        let source = FeedSource::open(&self.path)?;
        Ok(Box::new(source))
    }
}

/// Live tail of the feed file.
struct FeedSource {
    path: PathBuf,
    /// Byte offset of the next unread line.
    position: u64,
    /// Parsed events not yet handed to the listener.
    pending: VecDeque<RawEvent>,
    /// Signals from the notify callback that the feed may have grown.
    change_rx: mpsc::Receiver<()>,
    /// Kept alive to maintain the watch subscription.
    _watcher: RecommendedWatcher,
}

impl FeedSource {
    /// Opens the feed, seeks to its end, and starts watching for appends.
    fn open(path: &Path) -> Result<Self, GatewayError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            GatewayError::Connection(format!("feed file {} not available: {e}", path.display()))
        })?;
        if metadata.is_dir() {
            return Err(GatewayError::Connection(format!(
                "feed path {} is a directory",
                path.display()
            )));
        }

        let watch_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Coalescing channel: one pending wakeup is enough, the reader
        // drains everything it finds.
        let (change_tx, change_rx) = mpsc::channel(1);
        let watched = path.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                handle_notify_event(res, &watched, &change_tx);
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Connection(format!("failed to create feed watcher: {e}")))?;
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Connection(format!("failed to watch feed: {e}")))?;

        info!(
            feed = %path.display(),
            size = metadata.len(),
            "Connected to event feed"
        );

        Ok(Self {
            path: path.to_path_buf(),
            position: metadata.len(),
            pending: VecDeque::new(),
            change_rx,
            _watcher: watcher,
        })
    }

    /// Reads complete lines appended since the last read and parses them.
    ///
    /// A feed that shrank was truncated or rotated — reported as a
    /// connection drop so the listener reconnects (and skips to the new
    /// end).
    fn fill_pending(&mut self) -> Result<(), GatewayError> {
        let mut file = File::open(&self.path).map_err(|e| {
            GatewayError::Connection(format!("feed file {} lost: {e}", self.path.display()))
        })?;
        let file_size = file
            .metadata()
            .map_err(|e| GatewayError::Connection(format!("feed metadata failed: {e}")))?
            .len();

        if file_size < self.position {
            return Err(GatewayError::Connection(format!(
                "feed file {} truncated",
                self.path.display()
            )));
        }
        if file_size == self.position {
            return Ok(());
        }

        file.seek(SeekFrom::Start(self.position))
            .map_err(|e| GatewayError::Connection(format!("feed seek failed: {e}")))?;

        let mut reader = BufReader::new(&file);
        let mut consumed = self.position;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => {
                    // Only complete lines; a partial tail is re-read once the
                    // writer finishes it.
                    if !line.ends_with('\n') {
                        break;
                    }
                    consumed += n as u64;
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RawEvent>(trimmed) {
                        Ok(raw) => {
                            trace!(kind = %raw.kind, "Read feed event");
                            self.pending.push_back(raw);
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed feed line");
                        }
                    }
                }
                Err(e) => {
                    return Err(GatewayError::Connection(format!("feed read failed: {e}")));
                }
            }
        }

        self.position = consumed;
        Ok(())
    }
}

#[async_trait]
impl EventSource for FeedSource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, GatewayError> {
        loop {
            if let Some(raw) = self.pending.pop_front() {
                return Ok(Some(raw));
            }

            self.fill_pending()?;
            if !self.pending.is_empty() {
                continue;
            }

            // Nothing new yet: wait for a change signal, with a poll
            // fallback so missed notifications cannot stall the tail.
            match tokio::time::timeout(FEED_POLL_INTERVAL, self.change_rx.recv()).await {
                Ok(Some(())) => {
                    debug!(feed = %self.path.display(), "Feed change notification");
                }
                Ok(None) => {
                    return Err(GatewayError::Connection(
                        "feed watcher channel closed".to_string(),
                    ));
                }
                Err(_) => {
                    trace!(feed = %self.path.display(), "Feed poll tick");
                }
            }
        }
    }
}

/// Notify callback: filters for the feed file and nudges the reader.
///
/// Kept lightweight — no I/O, no locks; `try_send` so the notify thread
/// never blocks (a full channel means a wakeup is already pending).
fn handle_notify_event(
    res: Result<notify::Event, notify::Error>,
    watched: &Path,
    change_tx: &mpsc::Sender<()>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Feed watcher error");
            return;
        }
    };

    if event.paths.iter().any(|p| p == watched) {
        let _ = change_tx.try_send(());
    }
}
