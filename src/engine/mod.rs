//! The accounting engine: single-flight polling, per-dimension recording,
//! persistence and the query entry points.

pub mod ifaces;
pub mod provider;
pub mod session;
pub mod source;

use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::StatsError;
use crate::export::health::HealthMetrics;
use crate::migrate::{MigrationOutcome, Migrator};
use crate::recorder::{RecordOutcome, Recorder, RecorderSettings, TagFilter};
use crate::stats::collection::Collection;
use crate::stats::snapshot::{EntryKey, Snapshot};
use crate::stats::{user_id_for_uid, SYSTEM_UID, TAG_NONE, UID_TETHERING};

use self::ifaces::{IfaceMaps, NetworkState};
use self::provider::{ProviderEvent, ProviderHandle, ProviderRegistry, StatsProvider};
use self::session::{AccessChecker, StatsSession};
use self::source::CounterSource;

/// What a poll persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFlags(u32);

impl PollFlags {
    pub const NONE: Self = Self(0);
    /// Consider persisting the `dev` and `xt` recorders.
    pub const PERSIST_NETWORK: Self = Self(1);
    /// Consider persisting the `uid` and `uid_tag` recorders.
    pub const PERSIST_UID: Self = Self(1 << 1);
    pub const PERSIST_ALL: Self = Self(1 | 1 << 1);
    /// Wait for a running poll instead of coalescing, and persist all
    /// recorders regardless of their pending size.
    pub const FORCE: Self = Self(1 << 8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PollFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    /// Another poll was running; this request was folded into it.
    Coalesced,
}

/// Broadcast after every completed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatsUpdated { at: i64 },
}

/// The four accounting dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderKind {
    /// Interface totals from the kernel.
    Dev,
    /// Uid traffic grouped by interface.
    Xt,
    /// Untagged per-uid traffic.
    Uid,
    /// Tagged per-uid traffic.
    UidTag,
}

impl RecorderKind {
    pub const ALL: [RecorderKind; 4] = [Self::Dev, Self::Xt, Self::Uid, Self::UidTag];

    /// Shard prefix and metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Xt => "xt",
            Self::Uid => "uid",
            Self::UidTag => "uid_tag",
        }
    }

    fn tag_filter(&self) -> TagFilter {
        match self {
            Self::Dev | Self::Xt => TagFilter::Any,
            Self::Uid => TagFilter::UntaggedOnly,
            Self::UidTag => TagFilter::TaggedOnly,
        }
    }

    fn persist_flag(&self) -> PollFlags {
        match self {
            Self::Dev | Self::Xt => PollFlags::PERSIST_NETWORK,
            Self::Uid | Self::UidTag => PollFlags::PERSIST_UID,
        }
    }
}

/// Engine settings resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub stats_dir: PathBuf,
    pub dev: RecorderSettings,
    pub xt: RecorderSettings,
    pub uid: RecorderSettings,
    pub uid_tag: RecorderSettings,
    pub persist_threshold: i64,
    pub provider_poll_timeout: Duration,
    pub session_poll_rate_limit: Duration,
}

impl EngineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            stats_dir: cfg.stats_dir(),
            dev: cfg.recorders.dev.settings(),
            xt: cfg.recorders.xt.settings(),
            uid: cfg.recorders.uid.settings(),
            uid_tag: cfg.recorders.uid_tag.settings(),
            persist_threshold: cfg.persist_threshold(),
            provider_poll_timeout: cfg.provider_poll_timeout,
            session_poll_rate_limit: cfg.session_poll_rate_limit,
        }
    }

    pub fn settings(&self, kind: RecorderKind) -> RecorderSettings {
        match kind {
            RecorderKind::Dev => self.dev,
            RecorderKind::Xt => self.xt,
            RecorderKind::Uid => self.uid,
            RecorderKind::UidTag => self.uid_tag,
        }
    }
}

/// State guarded by the engine lock.
struct EngineState {
    dev: Recorder,
    xt: Recorder,
    uid: Recorder,
    uid_tag: Recorder,
    ifaces: IfaceMaps,
}

impl EngineState {
    fn recorder_mut(&mut self, kind: RecorderKind) -> &mut Recorder {
        match kind {
            RecorderKind::Dev => &mut self.dev,
            RecorderKind::Xt => &mut self.xt,
            RecorderKind::Uid => &mut self.uid,
            RecorderKind::UidTag => &mut self.uid_tag,
        }
    }

    fn recorders_mut(&mut self) -> [(RecorderKind, &mut Recorder); 4] {
        [
            (RecorderKind::Dev, &mut self.dev),
            (RecorderKind::Xt, &mut self.xt),
            (RecorderKind::Uid, &mut self.uid),
            (RecorderKind::UidTag, &mut self.uid_tag),
        ]
    }
}

/// Readings of one poll. `None` marks a source that failed; its recorders
/// keep their previous baseline so the missed traffic lands in the next poll.
struct Gathered {
    dev: Option<Snapshot>,
    uid: Option<Snapshot>,
}

pub struct AccountingEngine {
    state: Mutex<EngineState>,
    poll_gate: tokio::sync::Mutex<()>,
    source: Arc<dyn CounterSource>,
    providers: Arc<ProviderRegistry>,
    provider_events: Mutex<Option<mpsc::UnboundedReceiver<ProviderEvent>>>,
    /// Last successful tethering reading, reused when a read fails.
    last_tether: Mutex<Option<Snapshot>>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessChecker>,
    health: Arc<HealthMetrics>,
    updates: broadcast::Sender<EngineEvent>,
    session_polls: DashMap<i32, i64>,
    options: EngineOptions,
    ready: AtomicBool,
    shut_down: AtomicBool,
}

impl AccountingEngine {
    /// Opens the four recorders under `options.stats_dir`. Nothing is read
    /// from disk until the first query.
    pub fn new(
        options: EngineOptions,
        source: Arc<dyn CounterSource>,
        clock: Arc<dyn Clock>,
        access: Arc<dyn AccessChecker>,
        health: Arc<HealthMetrics>,
    ) -> Result<Arc<Self>, StatsError> {
        let open = |kind: RecorderKind| {
            Recorder::open(
                &options.stats_dir,
                kind.as_str(),
                options.settings(kind),
                options.persist_threshold,
                kind.tag_filter(),
                true,
            )
        };
        let state = EngineState {
            dev: open(RecorderKind::Dev)?,
            xt: open(RecorderKind::Xt)?,
            uid: open(RecorderKind::Uid)?,
            uid_tag: open(RecorderKind::UidTag)?,
            ifaces: IfaceMaps::default(),
        };

        let (providers, provider_events) = ProviderRegistry::new(Arc::clone(&health));
        let (updates, _) = broadcast::channel(16);

        info!(dir = %options.stats_dir.display(), "opened stats recorders");

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            poll_gate: tokio::sync::Mutex::new(()),
            source,
            providers,
            provider_events: Mutex::new(Some(provider_events)),
            last_tether: Mutex::new(None),
            clock,
            access,
            health,
            updates,
            session_polls: DashMap::new(),
            options,
            ready: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// True once the first poll has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), StatsError> {
        if self.is_shut_down() {
            Err(StatsError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Receives a [`EngineEvent`] after every completed poll.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.updates.subscribe()
    }

    // --- Polling ---

    /// Samples every source and records the deltas.
    ///
    /// Only one poll runs at a time. Without [`PollFlags::FORCE`] a request
    /// that finds a poll in progress returns [`PollOutcome::Coalesced`].
    pub async fn poll(&self, flags: PollFlags) -> Result<PollOutcome, StatsError> {
        self.ensure_running()?;

        let _gate = if flags.contains(PollFlags::FORCE) {
            self.poll_gate.lock().await
        } else {
            match self.poll_gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    debug!(?flags, "poll already running, coalescing");
                    self.health
                        .polls_total
                        .with_label_values(&["coalesced"])
                        .inc();
                    return Ok(PollOutcome::Coalesced);
                }
            }
        };
        // Shutdown may have completed while we waited for the gate.
        self.ensure_running()?;

        self.poll_locked(flags).await;
        Ok(PollOutcome::Completed)
    }

    /// Polls and persists everything.
    pub async fn force_update(&self) -> Result<(), StatsError> {
        self.poll(PollFlags::PERSIST_ALL | PollFlags::FORCE).await?;
        Ok(())
    }

    /// Caller must hold the poll gate.
    async fn poll_locked(&self, flags: PollFlags) {
        let started = Instant::now();

        if !self
            .providers
            .refresh(self.options.provider_poll_timeout)
            .await
        {
            self.health.provider_timeouts_total.inc();
        }

        let now = self.clock.now_millis();
        let gathered = self.gather(now);
        {
            let mut state = self.state.lock();
            self.record(&mut state, gathered, now);
            self.persist(&mut state, flags, now);
        }

        self.ready.store(true, Ordering::Release);
        self.health.poll_duration.observe(started.elapsed().as_secs_f64());
        self.health
            .polls_total
            .with_label_values(&["completed"])
            .inc();
        debug!(now, ?flags, "poll completed");

        // No subscribers is fine.
        let _ = self.updates.send(EngineEvent::StatsUpdated { at: now });
    }

    fn read_source<F>(&self, name: &str, read: F) -> Option<Snapshot>
    where
        F: FnOnce(&dyn CounterSource) -> anyhow::Result<Snapshot>,
    {
        match read(self.source.as_ref()) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(source = name, error = %e, "failed to read counters");
                self.health
                    .source_errors_total
                    .with_label_values(&[name])
                    .inc();
                None
            }
        }
    }

    /// Reads uid counters before interface counters so traffic of a uid that
    /// starts mid-poll is never seen as unattributed first.
    fn gather(&self, now: i64) -> Gathered {
        let uid = self.read_source("uid", |s| s.read_uid_stats(now));
        let tether = match self.read_source("tether", |s| s.read_tether_stats(now)) {
            Some(tether) => {
                *self.last_tether.lock() = Some(tether.clone());
                Some(tether)
            }
            None => {
                let cached = self.last_tether.lock().clone();
                if cached.is_some() {
                    debug!("reusing last tethering reading");
                }
                cached
            }
        };
        let dev = self.read_source("dev", |s| s.read_dev_stats(now));

        // Tethered traffic must be present in every uid reading, otherwise the
        // next poll would count its cumulative value again. Without any good
        // tethering reading yet the uid side waits for the next poll.
        let uid = match (uid, tether) {
            (Some(mut uid), Some(tether)) => {
                for (key, counters) in tether.iter() {
                    let key = EntryKey {
                        uid: UID_TETHERING,
                        ..key.clone()
                    };
                    uid.add(key, *counters);
                }
                uid.combine(&self.providers.uid_snapshot(now));
                Some(uid)
            }
            _ => None,
        };
        let dev = dev.map(|mut dev| {
            dev.combine(&self.providers.iface_snapshot(now));
            dev
        });

        Gathered { dev, uid }
    }

    fn record(&self, state: &mut EngineState, gathered: Gathered, now: i64) {
        let EngineState {
            dev,
            xt,
            uid,
            uid_tag,
            ifaces,
        } = state;

        if let Some(snapshot) = gathered.dev {
            let outcome = dev.record_snapshot(snapshot, &ifaces.dev, now);
            self.note_recorded(RecorderKind::Dev, outcome);
        }
        if let Some(snapshot) = gathered.uid {
            let grouped = snapshot
                .filtered(|k| k.tag == TAG_NONE)
                .grouped_by_iface();
            let outcome = xt.record_snapshot(grouped, &ifaces.dev, now);
            self.note_recorded(RecorderKind::Xt, outcome);

            let outcome = uid_tag.record_snapshot(snapshot.clone(), &ifaces.uid, now);
            self.note_recorded(RecorderKind::UidTag, outcome);
            let outcome = uid.record_snapshot(snapshot, &ifaces.uid, now);
            self.note_recorded(RecorderKind::Uid, outcome);
        }
    }

    fn note_recorded(&self, kind: RecorderKind, outcome: RecordOutcome) {
        let label = [kind.as_str()];
        if outcome.anomalies > 0 {
            self.health
                .non_monotonic_total
                .with_label_values(&label)
                .inc_by(outcome.anomalies as f64);
        }
        if outcome.bytes > 0 {
            self.health
                .recorded_bytes_total
                .with_label_values(&label)
                .inc_by(outcome.bytes as f64);
        }
    }

    /// A failed persist only affects its own recorder.
    fn persist(&self, state: &mut EngineState, flags: PollFlags, now: i64) {
        let force = flags.contains(PollFlags::FORCE);
        for (kind, recorder) in state.recorders_mut() {
            let result = if force {
                recorder.force_persist(now)
            } else if flags.contains(kind.persist_flag()) {
                recorder.maybe_persist(now).map(|_| ())
            } else {
                continue;
            };
            if let Err(e) = result {
                error!(recorder = kind.as_str(), error = %e, "failed to persist stats");
                self.health
                    .persist_errors_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
        }
    }

    // --- Triggers ---

    /// Handles the global quota alert: polls, then re-arms the alert one
    /// persist threshold further on.
    pub async fn on_global_alert(&self) -> Result<(), StatsError> {
        self.poll(PollFlags::PERSIST_NETWORK | PollFlags::FORCE)
            .await?;
        self.register_global_alert();
        Ok(())
    }

    /// Arms the global alert on the counter source and every provider.
    pub fn register_global_alert(&self) {
        let threshold = self.options.persist_threshold;
        if let Err(e) = self.source.set_global_alert(threshold) {
            warn!(error = %e, threshold, "failed to set global alert");
        }
        self.providers.set_alert(threshold);
    }

    /// Records traffic of the outgoing networks, then replaces the interface
    /// maps with ones built from `states`.
    pub async fn notify_network_status(&self, states: &[NetworkState]) -> Result<(), StatsError> {
        self.ensure_running()?;
        let _gate = self.poll_gate.lock().await;
        self.ensure_running()?;

        self.poll_locked(PollFlags::PERSIST_NETWORK).await;

        let maps = IfaceMaps::build(states);
        info!(
            networks = states.len(),
            ifaces = maps.dev.len(),
            "rebuilt interface maps"
        );
        self.state.lock().ifaces = maps;
        Ok(())
    }

    /// Polls, then folds the untagged history of `uids` into the removed uid
    /// and drops their tagged history.
    pub async fn remove_uids(&self, uids: &[i32]) -> Result<(), StatsError> {
        self.ensure_running()?;
        let _gate = self.poll_gate.lock().await;
        self.ensure_running()?;

        self.poll_locked(PollFlags::PERSIST_ALL | PollFlags::FORCE)
            .await;
        self.remove_uids_locked(uids)
    }

    /// Removes the history of every uid that belongs to `user_id`.
    pub async fn remove_user(&self, user_id: i32) -> Result<(), StatsError> {
        self.ensure_running()?;
        let _gate = self.poll_gate.lock().await;
        self.ensure_running()?;

        self.poll_locked(PollFlags::PERSIST_ALL | PollFlags::FORCE)
            .await;

        let now = self.clock.now_millis();
        let uids: Vec<i32> = {
            let mut state = self.state.lock();
            let mut uids = state.uid.get_or_load_complete(now)?.uids();
            uids.extend(state.uid_tag.get_or_load_complete(now)?.uids());
            uids.into_iter()
                .filter(|&uid| user_id_for_uid(uid) == Some(user_id))
                .collect()
        };
        info!(user_id, uids = uids.len(), "removing user");
        self.remove_uids_locked(&uids)
    }

    fn remove_uids_locked(&self, uids: &[i32]) -> Result<(), StatsError> {
        if uids.is_empty() {
            return Ok(());
        }
        for uid in uids {
            self.session_polls.remove(uid);
        }
        let mut state = self.state.lock();
        state.uid.remove_uids(uids)?;
        state.uid_tag.remove_uids(uids)?;
        info!(?uids, "removed uid history");
        Ok(())
    }

    /// Imports the legacy store into the four recorders.
    pub async fn migrate_legacy(&self, migrator: &Migrator) -> Result<MigrationOutcome, StatsError> {
        self.ensure_running()?;
        let _gate = self.poll_gate.lock().await;

        let mut state = self.state.lock();
        Ok(migrator.run(&mut state.recorders_mut(), self.clock.as_ref()))
    }

    /// Persists everything one last time. Every later mutation fails with
    /// [`StatsError::ShutDown`]; queries keep working.
    pub async fn shutdown(&self) -> Result<(), StatsError> {
        let _gate = self.poll_gate.lock().await;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let mut first_err = None;
        for (kind, recorder) in state.recorders_mut() {
            if let Err(e) = recorder.force_persist(now) {
                error!(recorder = kind.as_str(), error = %e, "failed to persist stats on shutdown");
                first_err.get_or_insert(e);
            }
        }
        info!("accounting engine shut down");
        first_err.map_or(Ok(()), Err)
    }

    // --- Providers ---

    pub fn register_provider(
        &self,
        tag: impl Into<String>,
        provider: Arc<dyn StatsProvider>,
    ) -> ProviderHandle {
        self.providers.register(tag, provider)
    }

    /// Hands out the provider threshold event stream. Only the first call
    /// gets it.
    pub fn take_provider_events(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.provider_events.lock().take()
    }

    pub fn set_warning_and_limit(&self, iface: &str, warning: i64, limit: i64) {
        self.providers.set_warning_and_limit(iface, warning, limit);
    }

    // --- Queries ---

    /// Full history of one dimension. Loads it from disk on first use.
    pub fn collection(&self, kind: RecorderKind) -> Result<Arc<Collection>, StatsError> {
        if !self.is_ready() {
            return Err(StatsError::NotReady);
        }
        let now = self.clock.now_millis();
        self.state.lock().recorder_mut(kind).get_or_load_complete(now)
    }

    /// Opens a query session for `caller_uid`. With `poll_on_open` the
    /// session first polls, unless the caller already did so recently.
    pub async fn open_session(
        self: &Arc<Self>,
        caller_uid: i32,
        poll_on_open: bool,
    ) -> Result<StatsSession, StatsError> {
        if poll_on_open && !self.is_shut_down() {
            if self.allow_session_poll(caller_uid) {
                self.poll(PollFlags::PERSIST_ALL).await?;
            } else {
                debug!(caller_uid, "session poll rate limited");
                self.health.session_polls_throttled_total.inc();
            }
        }
        let level = self.access.access_level(caller_uid);
        Ok(StatsSession::new(Arc::clone(self), caller_uid, level))
    }

    fn allow_session_poll(&self, caller_uid: i32) -> bool {
        if caller_uid == SYSTEM_UID {
            return true;
        }
        let now = self.clock.elapsed_realtime_millis();
        let limit = i64::try_from(self.options.session_poll_rate_limit.as_millis()).unwrap_or(i64::MAX);
        let mut allowed = true;
        self.session_polls
            .entry(caller_uid)
            .and_modify(|last| {
                if now.saturating_sub(*last) < limit {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allowed
    }
}
