use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::ifaces::NetworkState;
use crate::engine::provider::{PolicyListener, ProviderEvent};
use crate::engine::session::{AccessChecker, StaticAccessChecker};
use crate::engine::source::{CounterSource, ProcNetDevSource};
use crate::engine::{AccountingEngine, EngineOptions, PollFlags};
use crate::error::StatsError;
use crate::export::health::HealthMetrics;
use crate::migrate::Migrator;
use crate::stats::collection::AccessLevel;

/// Events that make the engine do work outside the periodic poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Poll and persist everything now.
    ForceUpdate,
    /// The global data alert fired.
    GlobalAlert,
    /// The set of active networks or the default network changed.
    NetworkStatus(Vec<NetworkState>),
    /// Apps were uninstalled.
    RemoveUids(Vec<i32>),
    /// A user was removed.
    RemoveUser(i32),
}

/// Agent owns the engine, the health server and the background worker that
/// serializes timers, triggers and provider callbacks.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    source: Option<Arc<dyn CounterSource>>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessChecker>,
    policy: Option<Arc<dyn PolicyListener>>,
    engine: Option<Arc<AccountingEngine>>,
    triggers: mpsc::UnboundedSender<Trigger>,
    trigger_rx: Option<mpsc::UnboundedReceiver<Trigger>>,
    worker: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            health,
            source: None,
            clock: Arc::new(SystemClock::new()),
            access: Arc::new(StaticAccessChecker::new(AccessLevel::Default)),
            policy: None,
            engine: None,
            triggers,
            trigger_rx: Some(trigger_rx),
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the default `/proc/net/dev` source.
    pub fn with_source(mut self, source: Arc<dyn CounterSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_access_checker(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = access;
        self
    }

    pub fn with_policy_listener(mut self, policy: Arc<dyn PolicyListener>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sender for triggers handled by the background worker.
    pub fn triggers(&self) -> mpsc::UnboundedSender<Trigger> {
        self.triggers.clone()
    }

    /// The engine, once started.
    pub fn engine(&self) -> Option<&Arc<AccountingEngine>> {
        self.engine.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Starts the health server, opens the engine, imports legacy data,
    /// applies the configured networks and starts the background worker.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so probes respond during migration.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let source = self
            .source
            .take()
            .unwrap_or_else(|| Arc::new(ProcNetDevSource::new()));
        let engine = AccountingEngine::new(
            EngineOptions::from_config(&self.cfg),
            source,
            Arc::clone(&self.clock),
            Arc::clone(&self.access),
            Arc::clone(&self.health),
        )
        .context("opening accounting engine")?;

        if let Some(migrator) = Migrator::from_config(&self.cfg, Arc::clone(&self.health)) {
            let outcome = engine
                .migrate_legacy(&migrator)
                .await
                .context("migrating legacy stats")?;
            info!(outcome = outcome.as_str(), "legacy stats migration finished");
        }

        // Also takes the first poll, which sets the counter baselines.
        engine
            .notify_network_status(&self.cfg.networks)
            .await
            .context("applying configured networks")?;
        engine.register_global_alert();

        let trigger_rx = self
            .trigger_rx
            .take()
            .context("agent already started")?;
        let provider_events = engine.take_provider_events();

        self.worker = Some(tokio::spawn(run_worker(
            Arc::clone(&engine),
            trigger_rx,
            provider_events,
            self.policy.clone(),
            self.cancel.child_token(),
            self.cfg.poll_interval,
        )));
        self.engine = Some(engine);

        info!(
            dir = %self.cfg.stats_dir().display(),
            networks = self.cfg.networks.len(),
            poll_interval = ?self.cfg.poll_interval,
            "agent started"
        );
        Ok(())
    }

    /// Stops the worker, persists everything and stops the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "agent worker panicked");
            }
        }

        if let Some(engine) = &self.engine {
            if let Err(e) = engine.shutdown().await {
                error!(error = %e, "error persisting stats on shutdown");
            }
        }

        self.health.stop().await?;
        info!("agent stopped");
        Ok(())
    }
}

async fn recv_provider_event(
    events: &mut Option<mpsc::UnboundedReceiver<ProviderEvent>>,
) -> Option<ProviderEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_worker(
    engine: Arc<AccountingEngine>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut provider_events: Option<mpsc::UnboundedReceiver<ProviderEvent>>,
    policy: Option<Arc<dyn PolicyListener>>,
    cancel: CancellationToken,
    poll_interval: std::time::Duration,
) {
    // The first poll already ran during start.
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                log_result("periodic poll", engine.poll(PollFlags::PERSIST_ALL).await.map(|_| ()));
            }
            Some(trigger) = triggers.recv() => {
                handle_trigger(&engine, trigger).await;
            }
            Some(event) = recv_provider_event(&mut provider_events) => {
                handle_provider_event(&engine, policy.as_deref(), event).await;
            }
        }
    }
}

async fn handle_trigger(engine: &AccountingEngine, trigger: Trigger) {
    debug!(?trigger, "handling trigger");
    let result = match trigger {
        Trigger::ForceUpdate => engine.force_update().await,
        Trigger::GlobalAlert => engine.on_global_alert().await,
        Trigger::NetworkStatus(states) => engine.notify_network_status(&states).await,
        Trigger::RemoveUids(uids) => engine.remove_uids(&uids).await,
        Trigger::RemoveUser(user_id) => engine.remove_user(user_id).await,
    };
    log_result("trigger", result);
}

async fn handle_provider_event(
    engine: &AccountingEngine,
    policy: Option<&dyn PolicyListener>,
    event: ProviderEvent,
) {
    match event {
        ProviderEvent::AlertReached { tag } => {
            debug!(tag = %tag, "provider alert reached");
            log_result("provider alert", engine.on_global_alert().await);
        }
        ProviderEvent::WarningOrLimitReached { tag } => {
            info!(tag = %tag, "provider warning or limit reached");
            let polled = engine
                .poll(PollFlags::PERSIST_NETWORK | PollFlags::FORCE)
                .await
                .map(|_| ());
            log_result("provider limit poll", polled);
            if let Some(policy) = policy {
                policy.on_warning_or_limit_reached(&tag);
            }
        }
    }
}

fn log_result(what: &str, result: Result<(), StatsError>) {
    match result {
        Ok(()) => {}
        Err(StatsError::ShutDown) => debug!(what, "engine shut down, ignoring"),
        Err(e) => warn!(what, error = %e, "engine operation failed"),
    }
}
