//! Main dispatch loop
//!
//! Orchestrates frontier, limits, fetchers, extractors, and the archive
//! writer: lease up to the concurrency cap, spawn fetch-extract-write
//! tasks, apply completions, checkpoint on cadence. The scheduler moves
//! starting → running → draining → stopped; draining admits no new leases
//! and waits for in-flight work, and a drain that fails to reach stopped
//! within the grace period is an internal error.
//!
//! Lock discipline: the writer mutex is always taken before any
//! coordinator call made while it is held, both here and in the
//! checkpoint path. A task archives its rows and completes its frontier
//! entry inside one writer-lock section, so a checkpoint (writer lock →
//! snapshot → flush) can never capture a row whose entry still looks
//! in-flight. That pairing is what makes resume-by-truncation produce no
//! duplicate records.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{debug, error, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::atlas::manifest::AtlasManifest;
use crate::atlas::records::{
    CrawlCounters, ErrorKind, ErrorPhase, ErrorRecord, PageRecord, PageTiming,
};
use crate::atlas::writer::{AtlasError, AtlasWriter, BUILTIN_PARTS};
use crate::checkpoint::{CHECKPOINT_VERSION, Checkpoint, CheckpointManager};
use crate::config::{CrawlConfig, FetchMode};
use crate::events::{CrawlEvent, CrawlEventBus};
use crate::extract::{ExtractorDescriptor, PageContext, default_extractors, run_pipeline};
use crate::fetch::Fetcher;
use crate::scope::{NormalizeOptions, RobotsCache, Scope, ScopeClassifier, normalize};

use super::CrawlError;
use super::budget::{ErrorBudget, MemoryBackpressure, resident_set_bytes};
use super::circuit_breaker::CircuitBreaker;
use super::coordinator::{Coordinator, CoordinatorSnapshot};
use super::frontier::{DiscoverySource, LeaseDecision, Outcome, UrlRecord};
use super::host_limiter::HostLimiter;

/// Time the drain phase may take before it becomes an internal error
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Base delay for retry backoff
const BACKOFF_BASE_MS: u64 = 1000;

/// Backoff ceiling
const BACKOFF_MAX_MS: u64 = 30_000;

/// Jitter applied to backoff delays
const BACKOFF_JITTER: f64 = 0.2;

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

/// Why the scheduler stopped leasing
#[derive(Debug)]
enum StopCause {
    Completed,
    MaxPages,
    ErrorBudget,
    Cancelled,
    Fatal(CrawlError),
}

/// Final report of a crawl run
#[derive(Debug)]
pub struct CrawlSummary {
    pub counters: CrawlCounters,
    /// Present only when the archive was closed successfully
    pub manifest: Option<AtlasManifest>,
    pub duration: Duration,
}

/// Cooperative cancellation flag, observable by coordinator and tasks
///
/// Idempotent: cancelling twice is a no-op, and a cancelled crawl always
/// eventually reaches the stopped state.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with deterministic jitter
///
/// The jitter is derived from the checkpointed seed, the URL, and the
/// attempt number, so a resumed crawl replays the same schedule.
fn calculate_retry_backoff(attempt: u32, seed: u64, url: &str) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(5));
    let mut rng = SmallRng::seed_from_u64(
        seed ^ xxhash_rust::xxh3::xxh3_64(url.as_bytes()) ^ u64::from(attempt),
    );
    let jitter = rng.random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    let with_jitter = (exp as f64 * (1.0 + jitter)) as u64;
    Duration::from_millis(with_jitter.min(BACKOFF_MAX_MS))
}

/// Everything a fetch-extract-write task needs, cloned per spawn
struct TaskContext<F: Fetcher> {
    config: CrawlConfig,
    fetcher: Arc<F>,
    coordinator: Arc<Coordinator>,
    writer: Arc<Mutex<AtlasWriter>>,
    robots: Arc<RobotsCache>,
    classifier: Arc<ScopeClassifier>,
    extractors: Arc<Vec<ExtractorDescriptor>>,
    events: Arc<CrawlEventBus>,
    breaker: Option<Arc<CircuitBreaker>>,
    cancel_rx: watch::Receiver<bool>,
    backoff_seed: u64,
}

impl<F: Fetcher> Clone for TaskContext<F> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            fetcher: Arc::clone(&self.fetcher),
            coordinator: Arc::clone(&self.coordinator),
            writer: Arc::clone(&self.writer),
            robots: Arc::clone(&self.robots),
            classifier: Arc::clone(&self.classifier),
            extractors: Arc::clone(&self.extractors),
            events: Arc::clone(&self.events),
            breaker: self.breaker.clone(),
            cancel_rx: self.cancel_rx.clone(),
            backoff_seed: self.backoff_seed,
        }
    }
}

/// Outcome of one spawned task. Frontier completion already happened
/// inside the task; this is what the scheduler still has to account for.
enum TaskResult {
    Success {
        host: String,
    },
    /// Robots disallow: expected outcome, outside the budget window
    RobotsDenied,
    /// Circuit breaker skip, re-queued for retry; nothing to account
    BreakerSkipped,
    Failed {
        host: String,
        kind: ErrorKind,
        message: String,
    },
    /// Cancelled at an I/O boundary; entry went back to pending
    Aborted,
    /// Page cap reached before this page could claim a slot
    MaxPagesReached,
    FatalWriter(AtlasError),
    /// Invariant violation inside the task
    Internal(String),
}

/// The crawl scheduler, generic over the fetch adapter
pub struct Scheduler<F: Fetcher + 'static> {
    config: CrawlConfig,
    fetcher: Arc<F>,
    coordinator: Arc<Coordinator>,
    checkpoints: CheckpointManager,
    robots: Arc<RobotsCache>,
    classifier: Arc<ScopeClassifier>,
    extractors: Arc<Vec<ExtractorDescriptor>>,
    events: Arc<CrawlEventBus>,
    breaker: Option<Arc<CircuitBreaker>>,
    cancel: CancelHandle,
    state: Arc<AtomicU8>,
    seed_urls: Vec<Url>,
    backoff_seed: u64,
}

impl<F: Fetcher + 'static> Scheduler<F> {
    /// Build a scheduler for one crawl session
    pub fn new(
        config: CrawlConfig,
        fetcher: Arc<F>,
        events: Arc<CrawlEventBus>,
        cancel: CancelHandle,
    ) -> Result<Self, CrawlError> {
        let normalize_opts = NormalizeOptions {
            sort_query: config.normalize_query_order(),
        };
        let mut seed_urls = Vec::with_capacity(config.seeds().len());
        for seed in config.seeds() {
            let url = normalize(None, seed, normalize_opts)
                .map_err(|e| CrawlError::Config(format!("seed '{seed}': {e}")))?;
            seed_urls.push(url);
        }

        let classifier = Arc::new(ScopeClassifier::new(
            &seed_urls,
            config.excluded_patterns_compiled(),
        ));
        let robots = Arc::new(
            RobotsCache::new(config.user_agent(), config.robots_fetch_timeout())
                .map_err(|e| CrawlError::Config(format!("robots client: {e}")))?,
        );
        let limiter = HostLimiter::new(config.max_per_host(), config.host_delay());
        let coordinator = Arc::new(Coordinator::new(limiter));
        let breaker = config.circuit_breaker_enabled().then(|| {
            Arc::new(CircuitBreaker::new(
                config.circuit_breaker_failure_threshold(),
                2,
                Duration::from_secs(config.circuit_breaker_retry_delay_secs()),
            ))
        });
        let checkpoints = CheckpointManager::new(config.out_dir());
        let backoff_seed = rand::rng().random::<u64>();

        Ok(Self {
            config,
            fetcher,
            coordinator,
            checkpoints,
            robots,
            classifier,
            extractors: Arc::new(default_extractors()),
            events,
            breaker,
            cancel,
            state: Arc::new(AtomicU8::new(SchedulerState::Starting as u8)),
            seed_urls,
            backoff_seed,
        })
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::Acquire) {
            0 => SchedulerState::Starting,
            1 => SchedulerState::Running,
            2 => SchedulerState::Draining,
            _ => SchedulerState::Stopped,
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Auxiliary part names: extractor parts beyond the builtins, plus
    /// the audits part in full mode
    fn aux_parts(&self) -> Vec<String> {
        let mut aux: Vec<String> = Vec::new();
        for extractor in self.extractors.iter() {
            for part in extractor.produced_parts {
                if !BUILTIN_PARTS.contains(part) && !aux.iter().any(|p| p == part) {
                    aux.push((*part).to_string());
                }
            }
        }
        if self.config.mode() == FetchMode::Full && !aux.iter().any(|p| p == "audits") {
            aux.push("audits".to_string());
        }
        aux
    }

    async fn enqueue_seeds(&self) {
        let records = self
            .seed_urls
            .iter()
            .map(|url| url_record(url, 0, DiscoverySource::Seed, None))
            .collect();
        self.coordinator.add_urls(records).await;
    }

    /// Create or reopen the archive and prime the frontier
    async fn prepare_archive(&mut self, resume: bool) -> Result<AtlasWriter, CrawlError> {
        let fingerprint = self.config.fingerprint();
        let aux = self.aux_parts();
        let aux_refs: Vec<&str> = aux.iter().map(String::as_str).collect();

        let writer = if resume {
            let checkpoint = self.checkpoints.load(&fingerprint)?;
            let writer = AtlasWriter::reopen(
                self.config.out_dir(),
                fingerprint,
                checkpoint.started_at,
                &checkpoint.writer_offsets,
                &aux_refs,
            )?;
            self.backoff_seed = checkpoint.backoff_seed;
            self.coordinator
                .restore(CoordinatorSnapshot {
                    frontier: checkpoint.frontier,
                    counters: checkpoint.counters,
                    page_seq: checkpoint.page_seq,
                    host_order: checkpoint.host_order,
                })
                .await;
            info!("Resuming crawl from checkpoint");
            writer
        } else {
            // A stale checkpoint from an interrupted run is superseded by
            // a fresh start.
            let _ = self.checkpoints.remove();
            AtlasWriter::create(self.config.out_dir(), fingerprint, &aux_refs)?
        };

        // Seeds no-op against already-seen (including done) URLs.
        self.enqueue_seeds().await;
        Ok(writer)
    }

    fn task_context(&self, writer: &Arc<Mutex<AtlasWriter>>) -> TaskContext<F> {
        TaskContext {
            config: self.config.clone(),
            fetcher: Arc::clone(&self.fetcher),
            coordinator: Arc::clone(&self.coordinator),
            writer: Arc::clone(writer),
            robots: Arc::clone(&self.robots),
            classifier: Arc::clone(&self.classifier),
            extractors: Arc::clone(&self.extractors),
            events: Arc::clone(&self.events),
            breaker: self.breaker.clone(),
            cancel_rx: self.cancel.subscribe(),
            backoff_seed: self.backoff_seed,
        }
    }

    /// Quiesce, flush, and persist a checkpoint
    ///
    /// The writer lock is taken first and held across the coordinator
    /// snapshot and the frame flush; see the module lock discipline.
    async fn write_checkpoint(&self, writer: &Arc<Mutex<AtlasWriter>>) -> Result<(), CrawlError> {
        let mut writer_guard = writer.lock().await;
        let snapshot = self.coordinator.snapshot().await;
        let offsets = writer_guard
            .checkpoint_flush()
            .await
            .map_err(CrawlError::WriterIo)?;
        let started_at = writer_guard.started_at();
        drop(writer_guard);

        let checkpoint = Checkpoint {
            schema_version: CHECKPOINT_VERSION,
            config_fingerprint: self.config.fingerprint(),
            created_at: chrono::Utc::now(),
            started_at,
            frontier: snapshot.frontier,
            counters: snapshot.counters.clone(),
            page_seq: snapshot.page_seq,
            writer_offsets: offsets,
            host_order: snapshot.host_order,
            backoff_seed: self.backoff_seed,
        };
        self.checkpoints.write(&checkpoint).await?;

        let _ = self.events.publish(&CrawlEvent::checkpoint_written(
            snapshot.counters.pages_done,
            self.checkpoints.path().to_path_buf(),
        ));
        Ok(())
    }

    /// Account one task result against breaker, budget, and stop rules
    fn handle_result(&self, result: TaskResult, budget: &mut ErrorBudget) -> Option<StopCause> {
        match result {
            TaskResult::Success { host } => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success(&host);
                }
                if budget.record(false) {
                    return Some(StopCause::ErrorBudget);
                }
                None
            }
            TaskResult::Failed {
                host,
                kind,
                message,
            } => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(&host, &message);
                }
                if budget.record(kind.counts_toward_budget()) {
                    return Some(StopCause::ErrorBudget);
                }
                None
            }
            TaskResult::RobotsDenied | TaskResult::BreakerSkipped | TaskResult::Aborted => None,
            TaskResult::MaxPagesReached => Some(StopCause::MaxPages),
            TaskResult::FatalWriter(error) => {
                Some(StopCause::Fatal(CrawlError::WriterIo(error)))
            }
            TaskResult::Internal(message) => {
                Some(StopCause::Fatal(CrawlError::Internal(message)))
            }
        }
    }

    async fn publish_progress(&self) {
        let counters = self.coordinator.counters().await;
        let pending = self.coordinator.pending_count().await;
        let in_flight = self.coordinator.in_flight_count().await;
        let _ = self
            .events
            .publish(&CrawlEvent::progress(counters, pending, in_flight));
    }

    /// Run the crawl to completion (or to a stop condition)
    pub async fn run(mut self, resume: bool) -> Result<CrawlSummary, CrawlError> {
        let run_started = Instant::now();
        let writer = self.prepare_archive(resume).await?;
        let writer = Arc::new(Mutex::new(writer));

        let _ = self.events.publish(&CrawlEvent::crawl_started(
            self.config.seeds().to_vec(),
            self.config.out_dir().clone(),
            self.config.max_depth(),
        ));

        let mut budget = ErrorBudget::new(self.config.error_window(), self.config.max_error_rate());
        let mut backpressure = match (
            self.config.memory_low_water_bytes(),
            self.config.memory_high_water_bytes(),
        ) {
            (Some(low), Some(high)) => Some(MemoryBackpressure::new(low, high)),
            _ => None,
        };

        let mut active: FuturesUnordered<JoinHandle<TaskResult>> = FuturesUnordered::new();
        let mut stop: Option<StopCause> = None;
        let mut last_checkpoint_pages = self.coordinator.pages_done().await;
        let mut cancel_rx = self.cancel.subscribe();

        self.set_state(SchedulerState::Running);

        loop {
            if stop.is_none() && self.cancel.is_cancelled() {
                info!("Cancellation requested, draining");
                stop = Some(StopCause::Cancelled);
                self.set_state(SchedulerState::Draining);
            }

            let mut effective_parallel = self.config.parallel();
            if let Some(bp) = &mut backpressure
                && let Some(resident) = resident_set_bytes()
            {
                bp.update(resident);
                effective_parallel = bp.effective_concurrency(effective_parallel);
            }

            let mut wait_until: Option<Instant> = None;
            if stop.is_none() {
                while active.len() < effective_parallel {
                    match self.coordinator.try_lease().await {
                        LeaseDecision::Leased { record, attempt } => {
                            let ctx = self.task_context(&writer);
                            active.push(tokio::spawn(process_page(ctx, record, attempt)));
                        }
                        LeaseDecision::Wait(at) => {
                            wait_until = Some(at);
                            break;
                        }
                        LeaseDecision::Blocked | LeaseDecision::Empty => break,
                    }
                }
            }

            if active.is_empty() {
                if stop.is_some() {
                    break;
                }
                if self.coordinator.is_drained().await {
                    stop = Some(StopCause::Completed);
                    break;
                }
                // Everything pending is deferred by backoff or politeness.
                let deadline =
                    wait_until.unwrap_or_else(|| Instant::now() + Duration::from_millis(50));
                tokio::select! {
                    () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    _ = cancel_rx.wait_for(|c| *c) => {}
                }
                continue;
            }

            let joined = tokio::select! {
                result = active.next() => result,
                () = async {
                    match wait_until {
                        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                        None => std::future::pending().await,
                    }
                } => continue,
                _ = cancel_rx.wait_for(|c| *c), if stop.is_none() => continue,
            };

            let Some(joined) = joined else {
                continue;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // A panicked task leaves its frontier entry in-flight
                    // forever; that is unrecoverable.
                    error!("Crawl task panicked: {e}");
                    TaskResult::Internal(format!("crawl task panicked: {e}"))
                }
            };

            if let Some(cause) = self.handle_result(result, &mut budget)
                && stop.is_none()
            {
                if matches!(
                    cause,
                    StopCause::Cancelled | StopCause::MaxPages | StopCause::Fatal(_)
                ) {
                    // Abort remaining fetches at their next I/O boundary;
                    // a budget trip instead lets them finish.
                    self.cancel.cancel();
                }
                info!("Stop condition: {cause:?}");
                stop = Some(cause);
                self.set_state(SchedulerState::Draining);
            }

            self.publish_progress().await;

            let pages_done = self.coordinator.pages_done().await;
            if stop.is_none()
                && pages_done >= last_checkpoint_pages + self.config.checkpoint_interval()
            {
                self.write_checkpoint(&writer).await?;
                last_checkpoint_pages = pages_done;
            }
        }

        self.set_state(SchedulerState::Draining);
        let drain_error = self.drain_remaining(&mut active, &mut budget).await.err();
        let stop = match drain_error {
            Some(e) => StopCause::Fatal(e),
            None => stop.unwrap_or(StopCause::Completed),
        };

        let outcome = self.finalize(stop, writer, run_started).await;
        self.set_state(SchedulerState::Stopped);
        outcome
    }

    /// Wait out in-flight tasks after the loop has stopped leasing
    async fn drain_remaining(
        &self,
        active: &mut FuturesUnordered<JoinHandle<TaskResult>>,
        budget: &mut ErrorBudget,
    ) -> Result<(), CrawlError> {
        while !active.is_empty() {
            match tokio::time::timeout(DRAIN_GRACE, active.next()).await {
                Ok(Some(Ok(result))) => {
                    if let Some(StopCause::Fatal(e)) = self.handle_result(result, budget) {
                        return Err(e);
                    }
                }
                Ok(Some(Err(e))) => {
                    return Err(CrawlError::Internal(format!("crawl task panicked: {e}")));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(CrawlError::Internal(format!(
                        "draining did not reach stopped within {DRAIN_GRACE:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        stop: StopCause,
        writer: Arc<Mutex<AtlasWriter>>,
        run_started: Instant,
    ) -> Result<CrawlSummary, CrawlError> {
        let counters = self.coordinator.counters().await;
        let duration = run_started.elapsed();

        match stop {
            StopCause::Completed | StopCause::MaxPages => {
                let writer = Arc::try_unwrap(writer)
                    .map_err(|_| {
                        CrawlError::Internal(
                            "archive writer still referenced at close".to_string(),
                        )
                    })?
                    .into_inner();
                let manifest = writer.close().await.map_err(CrawlError::WriterIo)?;
                let _ = self
                    .events
                    .publish(&CrawlEvent::crawl_finished(counters.clone(), duration));
                self.events.shutdown();
                info!(
                    "Crawl finished: {} pages, {} errors in {duration:?}",
                    counters.pages_done, counters.errors_total
                );
                Ok(CrawlSummary {
                    counters,
                    manifest: Some(manifest),
                    duration,
                })
            }
            StopCause::Cancelled => {
                self.write_checkpoint(&writer).await?;
                self.events.shutdown();
                Err(CrawlError::Cancelled)
            }
            StopCause::ErrorBudget => {
                self.write_checkpoint(&writer).await?;
                self.events.shutdown();
                Err(CrawlError::ErrorBudgetExceeded)
            }
            StopCause::Fatal(e) => {
                // The archive keeps its last durable checkpoint; no
                // manifest is written, marking it incomplete.
                self.events.shutdown();
                Err(e)
            }
        }
    }
}

/// Build a frontier record from a normalized URL
fn url_record(
    url: &Url,
    depth: u32,
    source: DiscoverySource,
    discoverer: Option<String>,
) -> UrlRecord {
    UrlRecord {
        url: url.to_string(),
        host: url.host_str().unwrap_or_default().to_string(),
        scheme: url.scheme().to_string(),
        depth,
        source,
        discoverer,
        priority: 0,
    }
}

/// One fetch-extract-write task
///
/// Cancellation is observed at the fetch boundary and again before the
/// write; an aborted task discards its partial results. All archive rows
/// and the frontier completion for this entry land inside a single
/// writer-lock section.
async fn process_page<F: Fetcher>(
    ctx: TaskContext<F>,
    record: UrlRecord,
    attempt: u32,
) -> TaskResult {
    let url = record.url.clone();
    let host = record.host.clone();
    let mut cancel_rx = ctx.cancel_rx.clone();
    let max_retries = ctx.config.max_retries();

    let parsed = match Url::parse(&url) {
        Ok(u) => u,
        Err(e) => {
            return TaskResult::Internal(format!("leased URL failed to parse: {url}: {e}"));
        }
    };

    // Robots admission, fetched lazily and cached per host.
    let verdict = ctx.robots.check(&parsed).await;
    ctx.coordinator
        .set_crawl_delay(&host, verdict.crawl_delay)
        .await;
    if !verdict.allowed {
        let error = ErrorRecord::new(
            ErrorPhase::Fetch,
            &url,
            ErrorKind::RobotsDisallow,
            format!("robots.txt disallows {url}"),
            attempt,
        );
        {
            let mut writer = ctx.writer.lock().await;
            if let Err(e) = writer.append("errors", &error) {
                return TaskResult::FatalWriter(e);
            }
            if let Err(msg) = ctx
                .coordinator
                .complete(&url, &host, Outcome::Failed { retry_after: None })
                .await
            {
                return TaskResult::Internal(msg);
            }
            ctx.coordinator.record_error(ErrorKind::RobotsDisallow).await;
        }
        let _ = ctx.events.publish(&CrawlEvent::crawl_error(
            url,
            ErrorKind::RobotsDisallow,
            "robots.txt disallow".to_string(),
        ));
        return TaskResult::RobotsDenied;
    }

    if let Some(breaker) = &ctx.breaker
        && !breaker.should_attempt(&host)
    {
        if attempt <= max_retries {
            let backoff = calculate_retry_backoff(attempt, ctx.backoff_seed, &url);
            debug!("Circuit open for {host}, retrying {url} in {backoff:?}");
            if let Err(msg) = ctx
                .coordinator
                .complete(
                    &url,
                    &host,
                    Outcome::Failed {
                        retry_after: Some(backoff),
                    },
                )
                .await
            {
                return TaskResult::Internal(msg);
            }
            return TaskResult::BreakerSkipped;
        }
        warn!("Circuit open for {host}, giving up on {url}");
        let error = ErrorRecord::new(
            ErrorPhase::Fetch,
            &url,
            ErrorKind::ConnectFailure,
            format!("circuit open for host {host}"),
            attempt,
        );
        {
            let mut writer = ctx.writer.lock().await;
            if let Err(e) = writer.append("errors", &error) {
                return TaskResult::FatalWriter(e);
            }
            if let Err(msg) = ctx
                .coordinator
                .complete(&url, &host, Outcome::Failed { retry_after: None })
                .await
            {
                return TaskResult::Internal(msg);
            }
            ctx.coordinator.record_error(ErrorKind::ConnectFailure).await;
        }
        return TaskResult::Failed {
            host,
            kind: ErrorKind::ConnectFailure,
            message: format!("circuit open, retries exhausted for {url}"),
        };
    }

    info!("Crawling [depth {}] {url} (attempt {attempt})", record.depth);
    let fetched = tokio::select! {
        result = ctx.fetcher.fetch(&url, attempt) => Some(result),
        _ = cancel_rx.wait_for(|c| *c) => None,
    };
    let fetched = match fetched {
        Some(result) => result,
        None => return abort_task(&ctx, &url, &host).await,
    };

    let page = match fetched {
        Ok(page) => page,
        Err(failure) => {
            let error = ErrorRecord::new(
                failure.phase,
                &url,
                failure.kind,
                failure.message.clone(),
                attempt,
            );
            let retry = failure.is_retryable() && attempt <= max_retries;
            let outcome = if retry {
                let backoff = calculate_retry_backoff(attempt, ctx.backoff_seed, &url);
                warn!(
                    "Fetch failed (attempt {attempt}/{}): {url} [{}] - retrying in {backoff:?}",
                    max_retries + 1,
                    failure.kind
                );
                Outcome::Failed {
                    retry_after: Some(backoff),
                }
            } else {
                warn!(
                    "Fetch failed permanently after {attempt} attempt(s): {url} [{}]: {}",
                    failure.kind, failure.message
                );
                Outcome::Failed { retry_after: None }
            };
            {
                let mut writer = ctx.writer.lock().await;
                if let Err(e) = writer.append("errors", &error) {
                    return TaskResult::FatalWriter(e);
                }
                if let Err(msg) = ctx.coordinator.complete(&url, &host, outcome).await {
                    return TaskResult::Internal(msg);
                }
                ctx.coordinator.record_error(failure.kind).await;
            }
            let _ = ctx.events.publish(&CrawlEvent::crawl_error(
                url,
                failure.kind,
                failure.message.clone(),
            ));
            return TaskResult::Failed {
                host,
                kind: failure.kind,
                message: failure.message,
            };
        }
    };

    if *ctx.cancel_rx.borrow() {
        return abort_task(&ctx, &url, &host).await;
    }

    // The page cap is claimed before anything is written, so the archive
    // never holds more than max_pages page rows.
    let Some(page_id) = ctx.coordinator.claim_page(ctx.config.max_pages()).await else {
        if let Err(msg) = ctx
            .coordinator
            .complete(
                &url,
                &host,
                Outcome::Failed {
                    retry_after: Some(Duration::ZERO),
                },
            )
            .await
        {
            return TaskResult::Internal(msg);
        }
        return TaskResult::MaxPagesReached;
    };

    let normalize_opts = NormalizeOptions {
        sort_query: ctx.config.normalize_query_order(),
    };
    let final_url =
        normalize(None, &page.final_url, normalize_opts).unwrap_or_else(|_| parsed.clone());

    // Challenge pages are archived but never extracted.
    let pipeline = if page.challenge.is_none() {
        let page_ctx = PageContext {
            page_id: &page_id,
            url: &final_url,
            html: &page.body,
            status: page.status,
            headers: &page.headers,
            network_log: &page.network_log,
            mode: ctx.config.mode(),
            classifier: &ctx.classifier,
            normalize_opts,
        };
        run_pipeline(&ctx.extractors, &page_ctx)
    } else {
        debug!(
            "Challenge page ({}) at {url}, extractors skipped",
            page.challenge.map(|c| c.to_string()).unwrap_or_default()
        );
        Default::default()
    };

    let page_record = PageRecord {
        id: page_id.clone(),
        url: final_url.to_string(),
        requested_url: url.clone(),
        status: page.status,
        fetch_mode: ctx.config.mode(),
        depth: record.depth,
        timing: PageTiming {
            dispatched_at: page.timing.dispatched_at,
            response_at: page.timing.response_at,
            render_complete_at: page.timing.render_complete_at,
            extraction_complete_at: Some(chrono::Utc::now()),
        },
        headers: page.headers.clone(),
        html_hash: hex::encode(Sha256::digest(page.body.as_bytes())),
        challenge: page.challenge,
    };

    // Single writer transaction per page: the page row lands before any
    // of its edges and assets, and the frontier entry is completed in the
    // same section.
    {
        let mut writer = ctx.writer.lock().await;
        let mut bytes_written = 0u64;
        match writer.append("pages", &page_record) {
            Ok(n) => bytes_written += n,
            Err(e) => return TaskResult::FatalWriter(e),
        }
        if let Some(audits) = &page.audits {
            let row = serde_json::json!({
                "page": page_id,
                "performance": audits.performance,
                "accessibility": audits.accessibility,
            });
            match writer.append("audits", &row) {
                Ok(n) => bytes_written += n,
                Err(e) => return TaskResult::FatalWriter(e),
            }
        }
        for edge in &pipeline.edges {
            match writer.append("edges", edge) {
                Ok(n) => bytes_written += n,
                Err(e) => return TaskResult::FatalWriter(e),
            }
        }
        for asset in &pipeline.assets {
            match writer.append("assets", asset) {
                Ok(n) => bytes_written += n,
                Err(e) => return TaskResult::FatalWriter(e),
            }
        }
        for (part, row) in &pipeline.aux {
            match writer.append(part, row) {
                Ok(n) => bytes_written += n,
                Err(e) => return TaskResult::FatalWriter(e),
            }
        }
        for error in &pipeline.errors {
            match writer.append("errors", error) {
                Ok(n) => bytes_written += n,
                Err(e) => return TaskResult::FatalWriter(e),
            }
        }

        if let Err(msg) = ctx.coordinator.complete(&url, &host, Outcome::Done).await {
            return TaskResult::Internal(msg);
        }
        ctx.coordinator.record_bytes_written(bytes_written).await;
        for error in &pipeline.errors {
            ctx.coordinator.record_error(error.kind).await;
        }
        ctx.coordinator.record_page_done().await;
    }

    // Redirect targets are archived under this page; never refetch them.
    if final_url.as_str() != url {
        ctx.coordinator
            .absorb_redirect(url_record(
                &final_url,
                record.depth,
                DiscoverySource::Redirect,
                Some(page_id.clone()),
            ))
            .await;
    }

    // Push discovered in-scope edges back into the frontier. Edges at
    // the depth limit are recorded but not enqueued.
    if record.depth < ctx.config.max_depth() {
        let mut discovered = Vec::new();
        for edge in &pipeline.edges {
            let Some(target) = &edge.normalized_target else {
                continue;
            };
            let Ok(target_url) = Url::parse(target) else {
                continue;
            };
            let admit = match ctx.classifier.classify(&target_url) {
                Scope::Internal => true,
                Scope::External => ctx.config.follow_external(),
                Scope::Excluded => false,
            };
            if admit {
                discovered.push(url_record(
                    &target_url,
                    record.depth + 1,
                    DiscoverySource::Link,
                    Some(page_id.clone()),
                ));
            }
        }
        if !discovered.is_empty() {
            ctx.coordinator.add_urls(discovered).await;
        }
    }

    debug!("Archived {url} as {page_id}");
    TaskResult::Success { host }
}

/// Return a leased entry to pending after a cancellation abort
async fn abort_task<F: Fetcher>(ctx: &TaskContext<F>, url: &str, host: &str) -> TaskResult {
    debug!("Aborted in-flight fetch: {url}");
    match ctx
        .coordinator
        .complete(
            url,
            host,
            Outcome::Failed {
                retry_after: Some(Duration::ZERO),
            },
        )
        .await
    {
        Ok(_) => TaskResult::Aborted,
        Err(msg) => TaskResult::Internal(msg),
    }
}
