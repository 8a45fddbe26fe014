//! Cycle orchestration: the diff engine and the monitor loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use propwatch_adapters::ListingSource;
use propwatch_core::{normalize, CycleStats, Listing, NotifiableEvent};
use propwatch_notify::Dispatcher;
use propwatch_storage::{BackoffPolicy, FetchPolicy, HistoryStore, PageFetcher};
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "propwatch-monitor";

/// Runtime configuration, read from `PROPWATCH_*` environment variables
/// with sensible defaults. Loading mechanism lives here; the values are
/// the contract.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_price: u64,
    pub time_window: Duration,
    pub scrape_interval: Duration,
    pub jitter: Duration,
    pub rate_limit_per_minute: u32,
    pub max_retries: usize,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub data_dir: PathBuf,
    pub sources_file: PathBuf,
    pub webhook_url: Option<String>,
    pub backup_enabled: bool,
    pub backup_retention: Duration,
    pub backup_every_cycles: u64,
    /// Whether `PriceChanged` events are also gated by the budget filter.
    /// Off by default: a price change on a known listing is always worth
    /// surfacing.
    pub price_change_respects_budget: bool,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            max_price: env_parse("PROPWATCH_MAX_PRICE", 10_000),
            time_window: Duration::from_secs(
                env_parse::<u64>("PROPWATCH_TIME_WINDOW_HOURS", 24) * 3_600,
            ),
            scrape_interval: Duration::from_secs(env_parse(
                "PROPWATCH_SCRAPE_INTERVAL_SECS",
                900,
            )),
            jitter: Duration::from_secs(env_parse("PROPWATCH_JITTER_SECS", 60)),
            rate_limit_per_minute: env_parse("PROPWATCH_RATE_LIMIT_PER_MINUTE", 25),
            max_retries: env_parse("PROPWATCH_MAX_RETRIES", 3),
            request_timeout: Duration::from_secs(env_parse("PROPWATCH_REQUEST_TIMEOUT_SECS", 30)),
            user_agent: std::env::var("PROPWATCH_USER_AGENT")
                .unwrap_or_else(|_| "propwatch/0.1".to_string()),
            data_dir: std::env::var("PROPWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sources_file: std::env::var("PROPWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            webhook_url: std::env::var("PROPWATCH_DISCORD_WEBHOOK_URL").ok(),
            backup_enabled: env_flag("PROPWATCH_BACKUP_ENABLED", true),
            backup_retention: Duration::from_secs(
                env_parse::<u64>("PROPWATCH_BACKUP_RETENTION_DAYS", 7) * 24 * 3_600,
            ),
            backup_every_cycles: env_parse("PROPWATCH_BACKUP_EVERY_CYCLES", 10),
            price_change_respects_budget: env_flag("PROPWATCH_PRICE_CHANGE_RESPECTS_BUDGET", false),
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: self.request_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: self.backoff(),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Inputs the diff engine applies when deciding notifiability.
#[derive(Debug, Clone, Copy)]
pub struct DiffFilters {
    pub max_price: u64,
    pub time_window: Duration,
    /// False only on the very first cycle against an empty store; that
    /// cycle records a baseline and emits nothing.
    pub initialized: bool,
    pub price_change_respects_budget: bool,
}

/// Collapse duplicate ids within one snapshot: the last occurrence wins,
/// at the position of the first. Duplicate ids should not happen, but a
/// scrape glitch must not produce double events.
pub fn dedup_last_wins(snapshot: &[Listing]) -> Vec<Listing> {
    let mut order: Vec<Listing> = Vec::with_capacity(snapshot.len());
    let mut index: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for listing in snapshot {
        match index.get(listing.id.as_str()) {
            Some(&pos) => order[pos] = listing.clone(),
            None => {
                index.insert(listing.id.as_str(), order.len());
                order.push(listing.clone());
            }
        }
    }
    order
}

/// Classify a snapshot against history. Pure: reads the store, never
/// writes it; the caller upserts every deduplicated record afterwards.
///
/// Per record, in snapshot order:
/// - unknown id + initialized: `New`, if within budget and the posting age
///   is known and within the time window (unknown age is treated as stale);
/// - unknown id + not initialized: baseline, nothing;
/// - known id with a different price: `PriceChanged` carrying the previous
///   price, regardless of the time window (budget applies only when
///   configured);
/// - known id, same price: nothing.
pub fn classify(
    snapshot: &[Listing],
    history: &HistoryStore,
    filters: &DiffFilters,
) -> Vec<NotifiableEvent> {
    let window_minutes = filters.time_window.as_secs() / 60;
    let mut events = Vec::new();

    for listing in dedup_last_wins(snapshot) {
        match history.get(&listing.id) {
            None => {
                if !filters.initialized {
                    continue;
                }
                let within_budget = listing.price <= filters.max_price;
                let recent = listing
                    .posted_minutes_ago
                    .is_some_and(|m| u64::from(m) <= window_minutes);
                if within_budget && recent {
                    events.push(NotifiableEvent::new_listing(listing));
                }
            }
            Some(entry) => {
                if entry.last_price != listing.price {
                    if filters.price_change_respects_budget && listing.price > filters.max_price {
                        continue;
                    }
                    let previous = entry.last_price;
                    events.push(NotifiableEvent::price_changed(listing, previous));
                }
            }
        }
    }
    events
}

/// The monitor loop: fetch, normalize, diff, notify, persist, sleep.
///
/// Owns the one history store handle and the dispatcher; at most one cycle
/// runs at a time.
pub struct Monitor {
    sources: Vec<Box<dyn ListingSource>>,
    fetcher: PageFetcher,
    dispatcher: Dispatcher,
    store: HistoryStore,
    config: MonitorConfig,
    shutdown: watch::Receiver<bool>,
    cycle_running: bool,
    cycles_completed: u64,
}

impl Monitor {
    pub fn new(
        sources: Vec<Box<dyn ListingSource>>,
        fetcher: PageFetcher,
        dispatcher: Dispatcher,
        store: HistoryStore,
        config: MonitorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sources,
            fetcher,
            dispatcher,
            store,
            config,
            shutdown,
            cycle_running: false,
            cycles_completed: 0,
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Run cycles until shutdown is requested. A cold start (empty store)
    /// makes the first cycle a baseline cycle.
    pub async fn run(&mut self) -> Result<()> {
        let mut initialized = !self.store.is_empty();
        if !initialized {
            info!("empty history store, first cycle records a baseline without notifying");
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_cycle(initialized).await {
                Ok(stats) => {
                    info!(%stats, "cycle complete");
                    if !initialized {
                        initialized = true;
                        info!(entries = self.store.len(), "baseline established, monitoring started");
                    }
                }
                Err(err) => error!(%err, "cycle failed"),
            }

            self.cycles_completed += 1;
            if self.config.backup_enabled
                && self.config.backup_every_cycles > 0
                && self.cycles_completed % self.config.backup_every_cycles == 0
            {
                match self.store.backup(self.config.backup_retention).await {
                    Ok(path) => info!(path = %path.display(), "periodic backup created"),
                    Err(err) => warn!(%err, "periodic backup failed"),
                }
            }

            let sleep_for = jittered(self.config.scrape_interval, self.config.jitter);
            info!(seconds = sleep_for.as_secs(), "sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutdown requested, monitor loop stopped");
        Ok(())
    }

    /// One full cycle. Errors from individual records or events never
    /// abort the cycle; only the overlap guard is fatal here.
    pub async fn run_cycle(&mut self, initialized: bool) -> Result<CycleStats> {
        if self.cycle_running {
            bail!("a cycle is already running, overlapping cycles are not allowed");
        }
        self.cycle_running = true;
        let result = self.cycle_inner(initialized).await;
        self.cycle_running = false;
        result
    }

    async fn cycle_inner(&mut self, initialized: bool) -> Result<CycleStats> {
        let started = std::time::Instant::now();
        let mut stats = CycleStats::default();
        let mut snapshot: Vec<Listing> = Vec::new();

        for source in &self.sources {
            match source.fetch(&self.fetcher).await {
                Ok(raws) => {
                    for raw in raws {
                        stats.total_scraped += 1;
                        match normalize(raw, source.base_url()) {
                            Ok(listing) => snapshot.push(listing),
                            Err(err) => {
                                stats.skipped_malformed += 1;
                                warn!(source = source.source_id(), %err, "skipping malformed record");
                            }
                        }
                    }
                }
                Err(err) => {
                    stats.fetch_failed = true;
                    error!(source = source.source_id(), %err, "fetch failed, retrying next interval");
                }
            }
        }

        if snapshot.is_empty() && stats.fetch_failed {
            // Nothing usable this cycle; leave history untouched.
            stats.duration = started.elapsed();
            return Ok(stats);
        }

        let deduped = dedup_last_wins(&snapshot);
        stats.within_budget = deduped
            .iter()
            .filter(|l| l.price <= self.config.max_price)
            .count();

        let filters = DiffFilters {
            max_price: self.config.max_price,
            time_window: self.config.time_window,
            initialized,
            price_change_respects_budget: self.config.price_change_respects_budget,
        };
        let events = classify(&deduped, &self.store, &filters);
        stats.new_count = events
            .iter()
            .filter(|e| e.kind == propwatch_core::EventKind::New)
            .count();

        for event in &events {
            if *self.shutdown.borrow() {
                warn!("shutdown requested, abandoning remaining notifications");
                break;
            }
            match self.dispatcher.dispatch(event).await {
                Ok(()) => stats.notifications_sent += 1,
                Err(err) => {
                    stats.failed_notifications += 1;
                    error!(id = %event.listing.id, %err, "notification failed");
                }
            }
        }

        let now = Utc::now();
        for listing in &deduped {
            self.store.upsert(&listing.id, listing.price, now);
        }
        if let Err(err) = self.store.flush().await {
            // State for this cycle is stale on disk; next cycle re-evaluates.
            error!(%err, "failed to persist history");
        }

        stats.duration = started.elapsed();
        Ok(stats)
    }
}

/// Interval with a uniform random offset in `[-jitter, +jitter]`, so
/// requests against the site never land on an exact schedule.
fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let jitter_ms = jitter.as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=jitter_ms * 2);
    let base = interval.as_millis() as u64;
    Duration::from_millis(base.saturating_sub(jitter_ms).saturating_add(offset))
}
