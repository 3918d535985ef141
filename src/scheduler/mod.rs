//! Scheduler module for running probe rounds and maintaining rollups.

mod retention;
mod rollup;
mod target;

pub use retention::*;
pub use rollup::*;
pub use target::*;

use crate::config::{ConfigError, ProbeSettings};
use crate::db::{DbError, ProbeOutcome};
use crate::events::{EventPublisher, ProbeEvent, PublishError};
use crate::probe::{EchoRequest, ProbeError, Transport};
use crate::stats::StatsAggregator;

use arc_swap::ArcSwap;
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("target resolution failed: {0}")]
    Resolve(String),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// Snapshot reported by [`ProbeEngine::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub scope: Option<Scope>,
    pub group_ids: Vec<i64>,
    pub active_rounds: usize,
    pub last_round_id: u64,
    pub last_round_started: Option<DateTime<Utc>>,
}

struct ActiveRun {
    scope: Scope,
    group_ids: Vec<i64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything a round needs, shared by the run loop and its rounds.
struct RoundContext {
    resolver: Arc<dyn TargetResolver>,
    transport: Arc<dyn Transport>,
    aggregator: StatsAggregator,
    publisher: Arc<dyn EventPublisher>,
    workers: usize,
    rounds: RoundTracker,
}

/// Continuous round-based prober.
pub struct ProbeEngine {
    ctx: Arc<RoundContext>,
    settings: Arc<ArcSwap<ProbeSettings>>,
    interval_tx: watch::Sender<Duration>,
    active: Mutex<Option<ActiveRun>>,
}

impl ProbeEngine {
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        transport: Arc<dyn Transport>,
        aggregator: StatsAggregator,
        publisher: Arc<dyn EventPublisher>,
        settings: ProbeSettings,
        workers: usize,
    ) -> Self {
        let (interval_tx, _) = watch::channel(settings.interval());
        Self {
            ctx: Arc::new(RoundContext {
                resolver,
                transport,
                aggregator,
                publisher,
                workers: workers.max(1),
                rounds: RoundTracker::default(),
            }),
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            interval_tx,
            active: Mutex::new(None),
        }
    }

    /// Begin probing `scope`. A run already in progress is cancelled and
    /// drained before the new one starts.
    pub async fn start(&self, scope: Scope, group_ids: Vec<i64>) -> Result<(), EngineError> {
        validate_scope(scope, &group_ids)?;

        let mut active = self.active.lock().await;
        if let Some(prev) = active.take() {
            tracing::info!("Replacing probe run (scope={}, groups={:?})", prev.scope, prev.group_ids);
            shutdown_run(prev).await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.ctx.clone(),
            self.settings.clone(),
            self.interval_tx.subscribe(),
            scope,
            Arc::from(group_ids.as_slice()),
            cancel.clone(),
        ));

        tracing::info!("Probe engine started: scope={}, groups={:?}", scope, group_ids);
        *active = Some(ActiveRun {
            scope,
            group_ids,
            cancel,
            task,
        });
        Ok(())
    }

    /// Cancel the current run. Returns whether one was running.
    pub async fn stop(&self) -> bool {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(run) => {
                shutdown_run(run).await;
                tracing::info!("Probe engine stopped");
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let active = self.active.lock().await;
        let run = active.as_ref().filter(|run| !run.task.is_finished());
        EngineStatus {
            running: run.is_some(),
            scope: run.map(|r| r.scope),
            group_ids: run.map(|r| r.group_ids.clone()).unwrap_or_default(),
            active_rounds: self.ctx.rounds.active(),
            last_round_id: self.ctx.rounds.last_id(),
            last_round_started: self.ctx.rounds.last_started(),
        }
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> ProbeSettings {
        ProbeSettings::clone(&self.settings.load())
    }

    /// Swap in new settings. Rounds already running keep their snapshot; an
    /// interval change re-arms the timer.
    pub fn update_settings(&self, settings: ProbeSettings) -> Result<(), EngineError> {
        settings.validate()?;

        let interval = settings.interval();
        tracing::info!(
            "Probe settings updated: interval={}s payload={}B timeout={}ms",
            settings.ping_interval_sec,
            settings.icmp_payload_bytes,
            settings.icmp_timeout_ms
        );
        self.settings.store(Arc::new(settings));
        self.interval_tx.send_if_modified(|current| {
            if *current == interval {
                return false;
            }
            *current = interval;
            true
        });
        Ok(())
    }
}

async fn shutdown_run(run: ActiveRun) {
    run.cancel.cancel();
    if let Err(e) = run.task.await {
        tracing::error!("Probe run task failed: {}", e);
    }
}

// ============================================================================
// Run loop
// ============================================================================

async fn run_loop(
    ctx: Arc<RoundContext>,
    settings: Arc<ArcSwap<ProbeSettings>>,
    mut interval_rx: watch::Receiver<Duration>,
    scope: Scope,
    group_ids: Arc<[i64]>,
    cancel: CancellationToken,
) {
    let period = *interval_rx.borrow_and_update();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut rounds = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tracing::debug!("Probe interval re-armed at {:?}", period);
            }
            _ = interval.tick() => {
                // Rounds are not awaited here; a slow sweep overlaps the next one
                rounds.spawn(run_round(
                    ctx.clone(),
                    settings.load_full(),
                    scope,
                    group_ids.clone(),
                    cancel.clone(),
                ));
            }
            Some(res) = rounds.join_next(), if !rounds.is_empty() => {
                if let Err(e) = res {
                    tracing::error!("Probe round task failed: {}", e);
                }
            }
        }
    }

    while let Some(res) = rounds.join_next().await {
        if let Err(e) = res {
            tracing::error!("Probe round task failed: {}", e);
        }
    }
}

#[derive(Default)]
struct RoundTally {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

async fn run_round(
    ctx: Arc<RoundContext>,
    settings: Arc<ProbeSettings>,
    scope: Scope,
    group_ids: Arc<[i64]>,
    cancel: CancellationToken,
) {
    let round = ctx.rounds.begin();
    if round.concurrent > 1 {
        tracing::warn!(
            "Round {} overlaps {} active rounds; the probe interval is shorter than one sweep",
            round.id,
            round.concurrent
        );
    }
    let started = Instant::now();

    let targets = match ctx.resolver.list_targets(scope, &group_ids).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("Round {}: {}", round.id, e);
            publish(&*ctx.publisher, ProbeEvent::error(None, e.to_string())).await;
            return;
        }
    };
    if targets.is_empty() {
        tracing::debug!("Round {}: no targets", round.id);
        return;
    }

    let total = targets.len();
    let workers = ctx.workers.min(total);
    let queue = Arc::new(Mutex::new(VecDeque::from(targets)));
    let tally = Arc::new(RoundTally::default());

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        pool.spawn(probe_worker(
            ctx.clone(),
            settings.clone(),
            queue.clone(),
            tally.clone(),
            cancel.clone(),
        ));
    }
    while let Some(res) = pool.join_next().await {
        if let Err(e) = res {
            tracing::error!("Round {}: worker failed: {}", round.id, e);
        }
    }

    let successes = tally.successes.load(Ordering::Relaxed);
    let failures = tally.failures.load(Ordering::Relaxed);
    if cancel.is_cancelled() {
        tracing::info!(
            "Round {} cancelled after {}/{} probes",
            round.id,
            successes + failures,
            total
        );
    } else {
        tracing::info!(
            "Round {} finished: {} targets, {} ok, {} failed in {:?}",
            round.id,
            total,
            successes,
            failures,
            started.elapsed()
        );
    }
}

async fn probe_worker(
    ctx: Arc<RoundContext>,
    settings: Arc<ProbeSettings>,
    queue: Arc<Mutex<VecDeque<Target>>>,
    tally: Arc<RoundTally>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(target) = queue.lock().await.pop_front() else {
            return;
        };

        let jitter = random_jitter(settings.max_jitter());
        if !jitter.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(jitter) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        let Some(outcome) = probe_target(&*ctx.transport, &target, &settings, &cancel).await else {
            return;
        };
        let counter = if outcome.is_success() { &tally.successes } else { &tally.failures };
        counter.fetch_add(1, Ordering::Relaxed);

        // Once the probe has an outcome the write runs to completion
        match ctx.aggregator.record(outcome.clone()).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                "Duplicate outcome for {} at {} ignored",
                target.name,
                outcome.timestamp
            ),
            Err(e) => {
                tracing::warn!("Failed to record outcome for {}: {}", target.name, e);
                let message = format!("failed to record outcome: {}", e);
                publish(&*ctx.publisher, ProbeEvent::error(Some(target.endpoint_id), message)).await;
            }
        }

        publish(
            &*ctx.publisher,
            ProbeEvent::ProbeUpdate {
                endpoint_id: target.endpoint_id,
                address: target.address,
                status: outcome.status,
                latency_ms: outcome.latency_ms,
                timestamp: outcome.timestamp,
            },
        )
        .await;
    }
}

/// Probe one target. Returns `None` when the probe was cancelled, in which
/// case nothing may be recorded.
async fn probe_target(
    transport: &dyn Transport,
    target: &Target,
    settings: &ProbeSettings,
    cancel: &CancellationToken,
) -> Option<ProbeOutcome> {
    // Stored at microsecond precision
    let timestamp = Utc::now().trunc_subsecs(6);
    let payload_bytes = settings.payload_bytes();
    let request = EchoRequest::new(&target.address, payload_bytes, settings.timeout());

    match transport.probe(&request, cancel).await {
        Ok(reply) => {
            tracing::debug!("{} ({}): {:.2}ms", target.name, target.address, reply.latency_ms);
            Some(ProbeOutcome::success(
                target.endpoint_id,
                timestamp,
                reply.latency_ms,
                reply.reply_addr,
                reply.ttl,
                payload_bytes,
            ))
        }
        Err(ProbeError::Cancelled) => None,
        Err(e) => {
            tracing::debug!("{} ({}): {}", target.name, target.address, e);
            Some(ProbeOutcome::failure(
                target.endpoint_id,
                timestamp,
                e.status(),
                payload_bytes,
            ))
        }
    }
}

async fn publish(publisher: &dyn EventPublisher, event: ProbeEvent) {
    match publisher.publish(event).await {
        Ok(()) => {}
        // Shutting down; rounds still draining have no audience
        Err(PublishError::Closed) => tracing::debug!("Event publisher closed, dropping event"),
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

// ============================================================================
// Round tracking
// ============================================================================

/// Round ids and the count of rounds in flight.
#[derive(Default)]
struct RoundTracker {
    last_id: AtomicU64,
    active: AtomicUsize,
    /// Microseconds since the epoch, 0 before the first round
    last_started_us: AtomicI64,
}

struct RoundGuard<'a> {
    tracker: &'a RoundTracker,
    id: u64,
    /// Rounds in flight including this one
    concurrent: usize,
}

impl RoundTracker {
    fn begin(&self) -> RoundGuard<'_> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let concurrent = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_started_us
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
        RoundGuard {
            tracker: self,
            id,
            concurrent,
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    fn last_started(&self) -> Option<DateTime<Utc>> {
        match self.last_started_us.load(Ordering::Relaxed) {
            0 => None,
            us => crate::db::from_micros(us),
        }
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}
