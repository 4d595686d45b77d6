//! Per-connection status stream actors.
//!
//! Each open stream is one task that owns its timers and its event-bus
//! subscription. It races five inputs: cancellation (client disconnect or
//! server shutdown), the hard lifetime ceiling, change notifications, the
//! poll ticker and the heartbeat ticker. Frames go out through a bounded
//! channel that the HTTP response drains in order.
//!
//! Recompute errors are logged and the tick is skipped. A closed event bus
//! ends the stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use regula_core::defaults;
use regula_core::{EventBus, Result, ServerEvent};

use super::snapshot::{Frame, StatusSnapshot};

/// Timing for status streams.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Aggregate (organization) poll interval.
    pub poll_interval: Duration,
    /// Fallback poll for single-record streams.
    pub check_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Hard ceiling on a connection's lifetime.
    pub max_duration: Duration,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(defaults::STREAM_POLL_INTERVAL_SECS),
            check_poll_interval: Duration::from_secs(defaults::STREAM_CHECK_POLL_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(defaults::STREAM_HEARTBEAT_SECS),
            max_duration: Duration::from_secs(defaults::STREAM_MAX_DURATION_SECS),
            channel_capacity: defaults::STREAM_CHANNEL_CAPACITY,
        }
    }
}

impl StreamConfig {
    /// Read `STREAM_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        fn secs(name: &str, default: u64) -> Duration {
            let value = std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default);
            Duration::from_secs(value)
        }

        Self {
            poll_interval: secs(
                "STREAM_POLL_INTERVAL_SECS",
                defaults::STREAM_POLL_INTERVAL_SECS,
            ),
            check_poll_interval: secs(
                "STREAM_CHECK_POLL_INTERVAL_SECS",
                defaults::STREAM_CHECK_POLL_INTERVAL_SECS,
            ),
            heartbeat_interval: secs("STREAM_HEARTBEAT_SECS", defaults::STREAM_HEARTBEAT_SECS),
            max_duration: secs(
                "STREAM_MAX_DURATION_SECS",
                defaults::STREAM_MAX_DURATION_SECS,
            ),
            channel_capacity: defaults::STREAM_CHANNEL_CAPACITY,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }
}

/// What a stream watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamScope {
    Check(Uuid),
    Organization(Uuid),
}

impl StreamScope {
    fn matches(&self, event: &ServerEvent) -> bool {
        match self {
            StreamScope::Check(id) => event.check_id() == *id,
            StreamScope::Organization(org) => event.organization_id() == *org,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StreamScope::Check(_) => "check",
            StreamScope::Organization(_) => "organization",
        }
    }

    fn target(&self) -> Uuid {
        match self {
            StreamScope::Check(id) | StreamScope::Organization(id) => *id,
        }
    }
}

/// One item for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized frame JSON.
    Data(String),
    Heartbeat,
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The watched record reached a terminal state.
    Terminal,
    /// The client went away.
    Disconnected,
    /// The lifetime ceiling elapsed.
    Timeout,
    /// The change-notification source closed.
    SubscriptionClosed,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Terminal => "terminal",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Timeout => "timeout",
            CloseReason::SubscriptionClosed => "subscription_closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Opens status streams. Cheap to clone.
#[derive(Clone)]
pub struct StreamFanout {
    snapshot: StatusSnapshot,
    events: Arc<EventBus>,
    config: StreamConfig,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StreamFanout {
    pub fn new(snapshot: StatusSnapshot, events: Arc<EventBus>, config: StreamConfig) -> Self {
        Self {
            snapshot,
            events,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.snapshot
    }

    /// Streams currently open.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Open a stream for one record. Fails with `CheckNotFound` when the
    /// record does not exist.
    pub async fn open_check(&self, check_id: Uuid) -> Result<StreamConnection> {
        self.open(StreamScope::Check(check_id)).await
    }

    /// Open an aggregate stream for one organization.
    pub async fn open_organization(&self, organization_id: Uuid) -> Result<StreamConnection> {
        self.open(StreamScope::Organization(organization_id)).await
    }

    /// Open a stream. The initial frame is computed before returning so
    /// lookup errors surface to the caller instead of the stream.
    pub async fn open(&self, scope: StreamScope) -> Result<StreamConnection> {
        // Subscribe first so no transition between the initial read and the
        // subscription is missed.
        let subscription = self.events.subscribe();
        let initial = recompute(&self.snapshot, scope).await?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = self.shutdown.child_token();

        let actor = StreamActor {
            scope,
            snapshot: self.snapshot.clone(),
            config: self.config.clone(),
            subscription,
            tx,
            cancel: cancel.clone(),
            shutdown: self.shutdown.clone(),
            last_digest: None,
            _active: ActiveGuard::new(self.active.clone()),
        };

        info!(
            subsystem = "api",
            component = "fanout",
            scope = scope.label(),
            target = %scope.target(),
            active = self.active_connections(),
            "Status stream opened"
        );

        let handle = tokio::spawn(actor.run(initial));
        Ok(StreamConnection {
            rx,
            handle: Some(handle),
            _guard: cancel.drop_guard(),
        })
    }

    /// Close every open stream.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn recompute(snapshot: &StatusSnapshot, scope: StreamScope) -> Result<Frame> {
    match scope {
        StreamScope::Check(id) => snapshot.check_progress(id).await,
        StreamScope::Organization(org) => snapshot.queue_status(org).await,
    }
}

/// Receiving end of a status stream.
///
/// Dropping it is the disconnect signal: the actor is cancelled, its timers
/// stop and its subscription is released.
pub struct StreamConnection {
    rx: mpsc::Receiver<Outbound>,
    handle: Option<JoinHandle<CloseReason>>,
    _guard: DropGuard,
}

impl StreamConnection {
    /// Next outbound item, or `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Wait for the actor to finish and report why it stopped. Resolves once
    /// the stream has ended on its own (terminal, timeout, shutdown).
    pub async fn closed(mut self) -> Option<CloseReason> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }
}

impl Stream for StreamConnection {
    type Item = Outbound;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Tick {
    Recompute,
    Heartbeat,
}

struct StreamActor {
    scope: StreamScope,
    snapshot: StatusSnapshot,
    config: StreamConfig,
    subscription: broadcast::Receiver<ServerEvent>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    last_digest: Option<blake3::Hash>,
    _active: ActiveGuard,
}

impl StreamActor {
    async fn run(mut self, initial: Frame) -> CloseReason {
        let started = Instant::now();
        let deadline = sleep(self.config.max_duration);
        tokio::pin!(deadline);

        let poll_every = match self.scope {
            StreamScope::Check(_) => self.config.check_poll_interval,
            StreamScope::Organization(_) => self.config.poll_interval,
        };
        let mut poll = interval_at(started + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let hb_every = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(started + hb_every, hb_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = match self.emit(initial, &mut deadline).await {
            Some(reason) => reason,
            None => loop {
                let tick = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break self.cancelled_reason(),
                    _ = &mut deadline => break CloseReason::Timeout,
                    _ = self.tx.closed() => break CloseReason::Disconnected,
                    event = self.subscription.recv() => match event {
                        Ok(event) if self.scope.matches(&event) => Tick::Recompute,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                subsystem = "api",
                                component = "fanout",
                                missed,
                                "Status stream lagged behind event bus, recomputing"
                            );
                            Tick::Recompute
                        }
                        Err(RecvError::Closed) => break CloseReason::SubscriptionClosed,
                    },
                    _ = poll.tick() => Tick::Recompute,
                    _ = heartbeat.tick() => Tick::Heartbeat,
                };

                let outcome = match tick {
                    Tick::Heartbeat => self.send(Outbound::Heartbeat, &mut deadline).await.err(),
                    Tick::Recompute => match recompute(&self.snapshot, self.scope).await {
                        Ok(frame) => self.emit(frame, &mut deadline).await,
                        Err(e) => {
                            warn!(
                                subsystem = "api",
                                component = "fanout",
                                target = %self.scope.target(),
                                error = %e,
                                "Status recompute failed, skipping tick"
                            );
                            None
                        }
                    },
                };
                if let Some(reason) = outcome {
                    break reason;
                }
            },
        };

        info!(
            subsystem = "api",
            component = "fanout",
            scope = self.scope.label(),
            target = %self.scope.target(),
            close_reason = reason.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Status stream closed"
        );
        reason
    }

    fn cancelled_reason(&self) -> CloseReason {
        if self.shutdown.is_cancelled() {
            CloseReason::Shutdown
        } else {
            CloseReason::Disconnected
        }
    }

    /// Send a frame unless it matches the last one sent. Returns a close
    /// reason when the stream must end.
    async fn emit(
        &mut self,
        frame: Frame,
        deadline: &mut Pin<&mut tokio::time::Sleep>,
    ) -> Option<CloseReason> {
        let encoded = frame
            .content_digest()
            .and_then(|digest| Ok((digest, serde_json::to_string(&frame)?)));
        let (digest, json) = match encoded {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    subsystem = "api",
                    component = "fanout",
                    error = %e,
                    "Failed to serialize status frame"
                );
                return None;
            }
        };

        if self.last_digest == Some(digest) {
            debug!(
                subsystem = "api",
                component = "fanout",
                kind = frame.kind(),
                "Unchanged status frame suppressed"
            );
            return None;
        }

        if let Err(reason) = self.send(Outbound::Data(json), deadline).await {
            return Some(reason);
        }
        self.last_digest = Some(digest);

        frame.is_terminal().then_some(CloseReason::Terminal)
    }

    async fn send(
        &self,
        item: Outbound,
        deadline: &mut Pin<&mut tokio::time::Sleep>,
    ) -> std::result::Result<(), CloseReason> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled_reason()),
            _ = deadline.as_mut() => Err(CloseReason::Timeout),
            sent = self.tx.send(item) => sent.map_err(|_| CloseReason::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_matching() {
        let check = Uuid::new_v4();
        let org = Uuid::new_v4();
        let event = ServerEvent::check_updated(check, org, regula_core::CheckStatus::Processing);

        assert!(StreamScope::Check(check).matches(&event));
        assert!(!StreamScope::Check(Uuid::new_v4()).matches(&event));
        assert!(StreamScope::Organization(org).matches(&event));
        assert!(!StreamScope::Organization(check).matches(&event));
    }

    #[test]
    fn test_default_timing() {
        let config = StreamConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.check_poll_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_duration, Duration::from_secs(600));
        assert_eq!(config.channel_capacity, 16);
    }

    #[test]
    fn test_active_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ActiveGuard::new(counter.clone());
        let b = ActiveGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
