use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{self, Stats};
use crate::config::{Config, ScanHorizon, MAX_PAGE_SIZE};
use crate::error::{LimiterError, StoreError};
use crate::ledger::Ledger;
use crate::limiter::{instant_after, LimiterSettings, RateLimiter};
use crate::models::{FetchCursor, TxStatus};
use crate::notify::Notifier;
use crate::pager::SignaturePager;
use crate::resolver::{Resolution, TransactionResolver};
use crate::retry::RetryPolicy;
use crate::rpc::RpcProvider;
use crate::store::LedgerStore;

/// Wiring shared by every run
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub wallet: String,
    pub limiter: LimiterSettings,
    pub retry: RetryPolicy,
    pub unit_scale: u64,
    pub commitment: TxStatus,
    pub horizon: ScanHorizon,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wallet: config.wallet_address.clone(),
            limiter: config.limiter_settings(),
            retry: config.retry_policy(),
            unit_scale: config.unit_scale,
            commitment: config.commitment,
            horizon: config.horizon,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub full_rescan: bool,
    pub time_budget: Duration,
    pub page_size: usize,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            full_rescan: false,
            time_budget: config.time_budget,
            page_size: config.page_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub pages: u32,
    pub new_transactions: u32,
    pub known: u32,
    pub skipped: u32,
    pub elapsed_ms: u64,
    pub scan_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Budget,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    /// History walked to its end, the horizon, or known history
    Done(RunReport),
    /// Stopped early; the next run resumes from the persisted cursor
    Suspended {
        reason: SuspendReason,
        report: RunReport,
    },
    /// Provider rate limited us. Do not schedule the next run before `retry_after_ms`.
    Cooldown {
        retry_after_ms: u64,
        report: RunReport,
    },
    AlreadyRunning,
    Error {
        message: String,
        report: RunReport,
    },
}

impl RunResult {
    pub fn label(&self) -> &'static str {
        match self {
            RunResult::Done(_) => "done",
            RunResult::Suspended { .. } => "suspended",
            RunResult::Cooldown { .. } => "cooldown",
            RunResult::AlreadyRunning => "already_running",
            RunResult::Error { .. } => "error",
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunResult::Done(report)
            | RunResult::Suspended { report, .. }
            | RunResult::Cooldown { report, .. }
            | RunResult::Error { report, .. } => Some(report),
            RunResult::AlreadyRunning => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Paging,
    Resolving,
    Done,
    Suspended,
    Cooldown,
}

enum Outcome {
    Done,
    Suspended(SuspendReason),
    Cooldown(Duration),
    Failed(String),
}

/// Per-run state, owned by a single `run` call
struct RunContext {
    options: RunOptions,
    started: Instant,
    deadline: Instant,
    state: RunState,
    cursor: FetchCursor,
    report: RunReport,
}

impl RunContext {
    fn new(options: RunOptions, cursor: FetchCursor) -> Self {
        let started = Instant::now();
        Self {
            options,
            started,
            deadline: instant_after(started, options.time_budget),
            state: RunState::Idle,
            cursor,
            report: RunReport::default(),
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("Run state {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    fn finish(mut self, outcome: Outcome) -> RunResult {
        self.report.elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.report.scan_complete = self.cursor.scan_complete;
        let report = self.report.clone();
        match outcome {
            Outcome::Done => {
                self.transition(RunState::Done);
                RunResult::Done(report)
            }
            Outcome::Suspended(reason) => {
                self.transition(RunState::Suspended);
                RunResult::Suspended { reason, report }
            }
            Outcome::Cooldown(remaining) => {
                self.transition(RunState::Cooldown);
                RunResult::Cooldown {
                    retry_after_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    report,
                }
            }
            Outcome::Failed(message) => {
                self.transition(RunState::Idle);
                RunResult::Error { message, report }
            }
        }
    }
}

/// Clears the advisory refresh flag when a run ends, however it ends
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pages backward through signature history, resolves new signatures into
/// the ledger and checkpoints after every page. Every run ends in a
/// [`RunResult`].
pub struct Ingestor {
    wallet: String,
    ledger: Arc<Ledger>,
    limiter: Arc<RateLimiter>,
    pager: SignaturePager,
    resolver: TransactionResolver,
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    refreshing: AtomicBool,
    cancel_requested: AtomicBool,
    hydrated: AtomicBool,
}

impl Ingestor {
    pub fn new(
        settings: IngestSettings,
        provider: Arc<dyn RpcProvider>,
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new());
        let limiter = Arc::new(RateLimiter::new(settings.limiter.clone()));

        let pager = SignaturePager::new(
            provider.clone(),
            limiter.clone(),
            settings.retry.clone(),
            ledger.clone(),
            settings.horizon,
        );
        let resolver = TransactionResolver::new(
            provider,
            limiter.clone(),
            settings.retry,
            ledger.clone(),
            settings.wallet.clone(),
            settings.unit_scale,
            settings.commitment,
        );

        Self {
            wallet: settings.wallet,
            ledger,
            limiter,
            pager,
            resolver,
            store,
            notifier,
            refreshing: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            hydrated: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Ask the active run to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> Stats {
        aggregator::compute_ledger(&self.ledger)
    }

    pub fn cursor(&self) -> FetchCursor {
        self.ledger.cursor()
    }

    /// Seed the ledger from the store once per process
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        if self.hydrated.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.store.load().await? {
            Some(snapshot) => {
                let count = snapshot.transactions.len();
                self.ledger.restore(snapshot)?;
                info!(
                    "📂 Restored {} transactions from {} store",
                    count,
                    self.store.backend_type()
                );
            }
            None => info!("📂 Cold start, {} store is empty", self.store.backend_type()),
        }

        self.hydrated.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn run(&self, options: RunOptions) -> RunResult {
        let Some(_guard) = RefreshGuard::acquire(&self.refreshing) else {
            info!("Ingestion already running, skipping");
            return RunResult::AlreadyRunning;
        };
        self.cancel_requested.store(false, Ordering::Release);

        let page_size = options.page_size.clamp(1, MAX_PAGE_SIZE);
        if page_size != options.page_size {
            warn!("Page size {} out of range, using {}", options.page_size, page_size);
        }
        let options = RunOptions { page_size, ..options };

        if let Err(e) = self.hydrate().await {
            error!("❌ Refusing to ingest on unreadable ledger state: {}", e);
            let result = RunContext::new(options, FetchCursor::default())
                .finish(Outcome::Failed(e.to_string()));
            self.notifier.run_finished(&result).await;
            return result;
        }

        let mut ctx = RunContext::new(options, self.ledger.cursor());
        if options.full_rescan {
            info!("🔄 Starting full rescan of {}", self.wallet);
            ctx.cursor = FetchCursor::full_rescan();
        }

        let outcome = self.drive(&mut ctx).await;
        if ctx.cursor != self.ledger.cursor() {
            self.checkpoint(&ctx.cursor).await;
        }

        let result = ctx.finish(outcome);
        self.notifier.run_finished(&result).await;
        result
    }

    fn interruption(&self, ctx: &RunContext) -> Option<SuspendReason> {
        if self.cancel_requested.load(Ordering::Acquire) {
            Some(SuspendReason::Cancelled)
        } else if Instant::now() >= ctx.deadline {
            Some(SuspendReason::Budget)
        } else {
            None
        }
    }

    fn abort(&self, err: LimiterError) -> Outcome {
        if !err.is_cooldown_signal() {
            warn!("Ingestion run aborted: {}", err);
            return Outcome::Failed(err.to_string());
        }

        let remaining = match (self.limiter.cooldown_remaining(), &err) {
            (Some(remaining), _) => remaining,
            (None, LimiterError::Cooldown { remaining }) => *remaining,
            (None, _) => Duration::ZERO,
        };
        warn!("⏸️ Provider cooldown, next run in {:?}", remaining);
        Outcome::Cooldown(remaining)
    }

    async fn drive(&self, ctx: &mut RunContext) -> Outcome {
        loop {
            if let Some(reason) = self.interruption(ctx) {
                return Outcome::Suspended(reason);
            }

            ctx.transition(RunState::Paging);
            let page = match self
                .pager
                .fetch_page(&self.wallet, &ctx.cursor, ctx.options.page_size, Some(ctx.deadline))
                .await
            {
                Ok(page) => page,
                Err(e) => return self.abort(e),
            };
            ctx.report.pages += 1;

            if page.signatures.iter().any(|s| !self.ledger.has(&s.signature)) {
                ctx.transition(RunState::Resolving);
            }

            let mut added = Vec::new();
            let mut interrupted = None;
            let mut last_processed: Option<&str> = None;

            for info in &page.signatures {
                if self.ledger.has(&info.signature) {
                    ctx.report.known += 1;
                    last_processed = Some(&info.signature);
                    continue;
                }
                if let Some(reason) = self.interruption(ctx) {
                    interrupted = Some(Outcome::Suspended(reason));
                    break;
                }
                if info.failed() {
                    debug!("Signature {} failed on-chain, skipping", info.signature);
                    ctx.report.skipped += 1;
                    last_processed = Some(&info.signature);
                    continue;
                }

                match self.resolver.resolve_into_ledger(&info.signature).await {
                    Ok(Resolution::Added(tx)) => {
                        ctx.report.new_transactions += 1;
                        added.push(tx);
                    }
                    Ok(Resolution::Known) => ctx.report.known += 1,
                    Ok(Resolution::Skipped) => ctx.report.skipped += 1,
                    Err(e) => {
                        interrupted = Some(self.abort(e));
                        break;
                    }
                }
                last_processed = Some(&info.signature);
            }

            match (&interrupted, last_processed) {
                (None, _) => ctx.cursor = page.next_cursor.clone(),
                (Some(_), Some(signature)) => ctx.cursor = ctx.cursor.resume_from(signature),
                (Some(_), None) => {}
            }
            self.checkpoint(&ctx.cursor).await;

            if !added.is_empty() {
                info!("✅ Page {} added {} transactions", ctx.report.pages, added.len());
                self.notifier.new_transactions(&added).await;
            }

            if let Some(outcome) = interrupted {
                return outcome;
            }
            if !page.has_more {
                return if page.next_cursor.scan_complete {
                    info!("🏁 Scan complete ({:?})", page.end);
                    Outcome::Done
                } else {
                    Outcome::Suspended(SuspendReason::Budget)
                };
            }
        }
    }

    /// Persist ledger and cursor. A failed save is retried at the next checkpoint.
    async fn checkpoint(&self, cursor: &FetchCursor) {
        self.ledger.set_cursor(cursor.clone());
        let snapshot = self.ledger.snapshot();
        match self.store.save(&snapshot).await {
            Ok(()) => debug!(
                "💾 Checkpointed {} transactions (before: {:?}, complete: {})",
                snapshot.transactions.len(),
                cursor.before_signature,
                cursor.scan_complete
            ),
            Err(e) => warn!(
                "Checkpoint to {} store failed, keeping progress in memory: {}",
                self.store.backend_type(),
                e
            ),
        }
    }
}
