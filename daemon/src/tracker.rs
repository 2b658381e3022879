use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EmbedTemplates;
use crate::event::WatcherEvent;
use crate::gateway::PresenceSource;
use crate::notifier::{Notifier, Transition};
use crate::presence::{crosses_offline_boundary, PresenceStatus};

/// The one user being watched, scoped to one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredUser {
    pub guild_id: u64,
    pub user_id: u64,
}

/// Periodic presence re-check while the user is believed offline.
///
/// The timer runs as its own task and only emits [`WatcherEvent::PollTick`];
/// the lookup itself happens in the event loop. At most one timer task exists.
/// A tick is dropped when the event channel is full, so a short period cannot
/// crowd out gateway events while a lookup is pending.
pub struct Poller {
    period: Duration,
    tx: mpsc::Sender<WatcherEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(period: Duration, tx: mpsc::Sender<WatcherEvent>) -> Self {
        Self {
            period,
            tx,
            handle: None,
        }
    }

    /// Starts the timer. Returns `false` (and does nothing) if one is already running.
    pub fn start(&mut self) -> bool {
        if self.handle.is_some() {
            return false;
        }
        let tx = self.tx.clone();
        let period = self.period;
        self.handle = Some(tokio::spawn(async move {
            // First tick one full period from now, like a plain repeating timer.
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tx.try_send(WatcherEvent::PollTick) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("Event queue full; skipping poll tick"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }));
        true
    }

    /// Cancels the timer. Returns `false` if none was running.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the tracker mutates.
pub struct TrackerState {
    /// `None` until a lookup succeeds.
    pub last_known: Option<PresenceStatus>,
    pub poller: Poller,
}

/// Presence state machine for the monitored user.
///
/// Handlers are called one at a time from the event loop and never hold
/// a state mutation across an await.
pub struct Tracker {
    user: MonitoredUser,
    source: Arc<dyn PresenceSource>,
    notifier: Notifier,
    state: TrackerState,
}

impl Tracker {
    pub fn new(
        user: MonitoredUser,
        source: Arc<dyn PresenceSource>,
        notifier: Notifier,
        poller: Poller,
    ) -> Self {
        Self {
            user,
            source,
            notifier,
            state: TrackerState {
                last_known: None,
                poller,
            },
        }
    }

    pub fn last_known(&self) -> Option<PresenceStatus> {
        self.state.last_known
    }

    pub fn is_polling(&self) -> bool {
        self.state.poller.is_active()
    }

    pub fn set_templates(&mut self, templates: EmbedTemplates) {
        self.notifier.set_templates(templates);
    }

    /// Looks up the user's presence and records it as the baseline.
    ///
    /// Runs on every gateway `READY`. The first successful run never notifies;
    /// later runs (after a reconnect) report a boundary crossing that happened
    /// while the gateway was away.
    pub async fn initialize(&mut self) -> Option<Transition> {
        let status = match self
            .source
            .fetch_presence(self.user.guild_id, self.user.user_id)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(
                    guild_id = self.user.guild_id,
                    user_id = self.user.user_id,
                    error = %e,
                    "Initial presence lookup failed"
                );
                return None;
            }
        };

        if let Some(previous) = self.state.last_known {
            if let Some(transition) = self.apply(previous, status) {
                info!(?transition, "Presence changed while disconnected");
                return Some(transition);
            }
        }

        info!(user_id = self.user.user_id, %status, "Baseline presence recorded");
        self.state.last_known = Some(status);
        if status.is_offline() && self.state.poller.start() {
            info!(period = ?self.state.poller.period, "User is offline; polling started");
        }
        None
    }

    /// Handles a pushed presence change for any user in the guild.
    pub fn on_presence_event(
        &mut self,
        user_id: u64,
        old: PresenceStatus,
        new: PresenceStatus,
    ) -> Option<Transition> {
        if user_id != self.user.user_id || old == new {
            return None;
        }
        if !crosses_offline_boundary(old, new) {
            debug!(%old, %new, "Presence change stays on one side of offline");
            return None;
        }
        // A poll tick may have reported this crossing already.
        if self.state.last_known.map(PresenceStatus::reachability) == Some(new.reachability()) {
            debug!(%old, %new, "Transition already reported");
            return None;
        }
        self.apply(old, new)
    }

    /// Handles one poller interval.
    pub async fn on_poll_tick(&mut self) -> Option<Transition> {
        if !self.state.poller.is_active() {
            debug!("Ignoring tick from a stopped poller");
            return None;
        }

        match self
            .source
            .fetch_presence(self.user.guild_id, self.user.user_id)
            .await
        {
            Ok(status) if status.is_offline() => {
                debug!("User still offline");
                None
            }
            Ok(status) => self.apply(PresenceStatus::Offline, status),
            Err(e) => {
                warn!(error = %e, "Presence poll failed; retrying on next tick");
                None
            }
        }
    }

    pub fn shutdown(&mut self) {
        if self.state.poller.stop() {
            info!("Polling stopped");
        }
    }

    /// Records `new`, moves the poller, then dispatches the notification.
    fn apply(&mut self, old: PresenceStatus, new: PresenceStatus) -> Option<Transition> {
        let transition = Transition::classify(old, new)?;

        self.state.last_known = Some(new);
        match transition {
            Transition::WentOffline => {
                info!(user_id = self.user.user_id, "User went offline");
                if self.state.poller.start() {
                    info!(period = ?self.state.poller.period, "Polling started");
                }
            }
            Transition::BackOnline => {
                info!(user_id = self.user.user_id, status = %new, "User is back online");
                if self.state.poller.stop() {
                    info!("Polling stopped");
                }
            }
        }

        self.notifier.notify_transition(old, new);
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::notifier::tests::{ChannelSink, RejectingSink};
    use crate::notifier::{NotificationPayload, WebhookSink, FIELD_CURRENT_STATUS};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use PresenceStatus::*;

    const GUILD: u64 = 10;
    const USER: u64 = 20;
    const OTHER_USER: u64 = 21;

    /// Answers lookups from a fixed script; an exhausted script fails the lookup.
    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<PresenceStatus, GatewayError>>>,
    }

    #[async_trait]
    impl PresenceSource for ScriptedSource {
        async fn fetch_presence(
            &self,
            guild_id: u64,
            user_id: u64,
        ) -> Result<PresenceStatus, GatewayError> {
            assert_eq!((guild_id, user_id), (GUILD, USER));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GatewayError::NotConnected))
        }
    }

    struct Harness {
        tracker: Tracker,
        sent: mpsc::UnboundedReceiver<NotificationPayload>,
        _ticks: mpsc::Receiver<WatcherEvent>,
    }

    fn tracker_with(
        replies: Vec<Result<PresenceStatus, GatewayError>>,
        sink: Arc<dyn WebhookSink>,
    ) -> (Tracker, mpsc::Receiver<WatcherEvent>) {
        let source = Arc::new(ScriptedSource {
            replies: Mutex::new(replies.into()),
        });
        let (tick_tx, tick_rx) = mpsc::channel(8);
        // Long enough that no real tick fires during a test.
        let poller = Poller::new(Duration::from_secs(3600), tick_tx);
        let notifier = Notifier::new(sink, EmbedTemplates::default(), USER);
        let user = MonitoredUser {
            guild_id: GUILD,
            user_id: USER,
        };
        (Tracker::new(user, source, notifier, poller), tick_rx)
    }

    fn harness(replies: Vec<Result<PresenceStatus, GatewayError>>) -> Harness {
        let (tx, sent) = mpsc::unbounded_channel();
        let (tracker, ticks) = tracker_with(replies, Arc::new(ChannelSink(tx)));
        Harness {
            tracker,
            sent,
            _ticks: ticks,
        }
    }

    async fn assert_nothing_sent(sent: &mut mpsc::UnboundedReceiver<NotificationPayload>) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(sent.try_recv().is_err(), "unexpected notification");
    }

    async fn expect_one(sent: &mut mpsc::UnboundedReceiver<NotificationPayload>) -> NotificationPayload {
        let payload = sent.recv().await.expect("notification");
        assert_nothing_sent(sent).await;
        payload
    }

    // ── Poller ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn poller_start_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let mut poller = Poller::new(Duration::from_secs(3600), tx);
        assert!(!poller.is_active());
        assert!(poller.start());
        assert!(!poller.start());
        assert!(!poller.start());
        assert!(poller.is_active());
        assert!(poller.stop());
        assert!(!poller.is_active());
        assert!(!poller.stop());
    }

    #[tokio::test]
    async fn poller_emits_ticks_until_stopped() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut poller = Poller::new(Duration::from_millis(10), tx);
        poller.start();

        let tick = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick within timeout");
        assert!(matches!(tick, Some(WatcherEvent::PollTick)));

        poller.stop();
        // Drain anything already queued; the aborted task sends nothing more.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_skips_ticks_while_the_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut poller = Poller::new(Duration::from_millis(10), tx);
        poller.start();

        // Many periods pass with nobody draining the queue.
        tokio::time::sleep(Duration::from_millis(105)).await;
        assert!(matches!(rx.try_recv(), Ok(WatcherEvent::PollTick)));
        assert!(rx.try_recv().is_err());

        // The timer is still alive and fills the freed slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(rx.try_recv(), Ok(WatcherEvent::PollTick)));
        assert!(poller.is_active());
        poller.stop();
    }

    // ── initialize ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn initial_online_records_baseline_without_polling() {
        let mut h = harness(vec![Ok(Online)]);
        assert_eq!(h.tracker.initialize().await, None);
        assert_eq!(h.tracker.last_known(), Some(Online));
        assert!(!h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;
    }

    #[tokio::test]
    async fn initial_offline_then_polling_detects_return() {
        let mut h = harness(vec![Ok(Offline), Ok(Offline), Ok(Idle)]);

        h.tracker.initialize().await;
        assert_eq!(h.tracker.last_known(), Some(Offline));
        assert!(h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;

        assert_eq!(h.tracker.on_poll_tick().await, None);
        assert!(h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;

        assert_eq!(h.tracker.on_poll_tick().await, Some(Transition::BackOnline));
        assert!(!h.tracker.is_polling());
        assert_eq!(h.tracker.last_known(), Some(Idle));

        let payload = expect_one(&mut h.sent).await;
        assert_eq!(payload.transition, Transition::BackOnline);
        assert_eq!(payload.field(FIELD_CURRENT_STATUS), Some("idle"));
    }

    #[tokio::test]
    async fn failed_initial_lookup_leaves_no_baseline() {
        let mut h = harness(vec![Err(GatewayError::Timeout(Duration::from_secs(10)))]);
        assert_eq!(h.tracker.initialize().await, None);
        assert_eq!(h.tracker.last_known(), None);
        assert!(!h.tracker.is_polling());

        // Live updates still work without a baseline.
        assert_eq!(
            h.tracker.on_presence_event(USER, Online, Offline),
            Some(Transition::WentOffline)
        );
        assert!(h.tracker.is_polling());
        assert_eq!(expect_one(&mut h.sent).await.transition, Transition::WentOffline);
    }

    #[tokio::test]
    async fn reinitialize_reports_change_missed_while_disconnected() {
        let mut h = harness(vec![Ok(Online), Ok(Offline)]);
        h.tracker.initialize().await;

        assert_eq!(h.tracker.initialize().await, Some(Transition::WentOffline));
        assert!(h.tracker.is_polling());
        assert_eq!(expect_one(&mut h.sent).await.transition, Transition::WentOffline);
    }

    #[tokio::test]
    async fn reinitialize_without_crossing_is_silent() {
        let mut h = harness(vec![Ok(Online), Ok(DoNotDisturb)]);
        h.tracker.initialize().await;
        assert_eq!(h.tracker.initialize().await, None);
        assert_eq!(h.tracker.last_known(), Some(DoNotDisturb));
        assert_nothing_sent(&mut h.sent).await;
    }

    // ── on_presence_event ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn going_offline_notifies_and_starts_polling() {
        let mut h = harness(vec![Ok(Online)]);
        h.tracker.initialize().await;

        assert_eq!(
            h.tracker.on_presence_event(USER, Online, Offline),
            Some(Transition::WentOffline)
        );
        assert!(h.tracker.is_polling());
        assert_eq!(h.tracker.last_known(), Some(Offline));
        assert_eq!(expect_one(&mut h.sent).await.title, "User is now offline");
    }

    #[tokio::test]
    async fn coming_back_notifies_and_stops_polling() {
        let mut h = harness(vec![Ok(Offline)]);
        h.tracker.initialize().await;
        assert!(h.tracker.is_polling());

        assert_eq!(
            h.tracker.on_presence_event(USER, Offline, DoNotDisturb),
            Some(Transition::BackOnline)
        );
        assert!(!h.tracker.is_polling());
        let payload = expect_one(&mut h.sent).await;
        assert_eq!(payload.field(FIELD_CURRENT_STATUS), Some("dnd"));
    }

    #[tokio::test]
    async fn changes_within_present_are_ignored() {
        let mut h = harness(vec![Ok(Online)]);
        h.tracker.initialize().await;

        assert_eq!(h.tracker.on_presence_event(USER, Online, Idle), None);
        assert_eq!(h.tracker.on_presence_event(USER, Idle, DoNotDisturb), None);
        assert_eq!(h.tracker.last_known(), Some(Online));
        assert!(!h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;
    }

    #[tokio::test]
    async fn same_status_is_not_a_transition() {
        let mut h = harness(vec![]);
        assert_eq!(h.tracker.on_presence_event(USER, Offline, Offline), None);
        assert_eq!(h.tracker.on_presence_event(USER, Online, Online), None);
        assert!(!h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;
    }

    #[tokio::test]
    async fn other_users_are_ignored() {
        let mut h = harness(vec![Ok(Online)]);
        h.tracker.initialize().await;

        assert_eq!(h.tracker.on_presence_event(OTHER_USER, Online, Offline), None);
        assert_eq!(h.tracker.last_known(), Some(Online));
        assert!(!h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;
    }

    #[tokio::test]
    async fn repeated_offline_events_keep_a_single_poller() {
        let mut h = harness(vec![]);
        h.tracker.on_presence_event(USER, Online, Offline);
        h.tracker.on_presence_event(USER, Idle, Offline);
        h.tracker.on_presence_event(USER, DoNotDisturb, Offline);

        assert!(h.tracker.is_polling());
        assert_eq!(expect_one(&mut h.sent).await.transition, Transition::WentOffline);
    }

    #[tokio::test]
    async fn push_after_poll_detected_return_is_not_reported_twice() {
        let mut h = harness(vec![Ok(Offline), Ok(Online)]);
        h.tracker.initialize().await;
        assert_eq!(h.tracker.on_poll_tick().await, Some(Transition::BackOnline));

        // The gateway's own event for the same return arrives afterwards.
        assert_eq!(h.tracker.on_presence_event(USER, Offline, Online), None);
        assert_eq!(expect_one(&mut h.sent).await.transition, Transition::BackOnline);
    }

    // ── on_poll_tick ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn poll_failure_keeps_polling() {
        let mut h = harness(vec![Ok(Offline), Err(GatewayError::NotConnected), Ok(Online)]);
        h.tracker.initialize().await;

        assert_eq!(h.tracker.on_poll_tick().await, None);
        assert!(h.tracker.is_polling());
        assert_eq!(h.tracker.last_known(), Some(Offline));

        assert_eq!(h.tracker.on_poll_tick().await, Some(Transition::BackOnline));
        assert!(!h.tracker.is_polling());
    }

    #[tokio::test]
    async fn tick_without_active_poller_does_nothing() {
        // A lookup on a stale tick would consume this reply.
        let mut h = harness(vec![Ok(Online), Ok(Offline)]);
        h.tracker.initialize().await;
        assert_eq!(h.tracker.on_poll_tick().await, None);
        assert!(!h.tracker.is_polling());
        assert_nothing_sent(&mut h.sent).await;
    }

    // ── delivery failures ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn rejected_webhook_still_updates_state() {
        let (mut tracker, _ticks) = tracker_with(vec![Ok(Online)], Arc::new(RejectingSink));
        tracker.initialize().await;

        assert_eq!(
            tracker.on_presence_event(USER, Online, Offline),
            Some(Transition::WentOffline)
        );
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.last_known(), Some(Offline));
        assert!(tracker.is_polling());
    }

    #[tokio::test]
    async fn shutdown_stops_polling() {
        let mut h = harness(vec![Ok(Offline)]);
        h.tracker.initialize().await;
        h.tracker.shutdown();
        assert!(!h.tracker.is_polling());
    }
}
