//! Idle-time background passes.
//!
//! The scheduler is a small state machine driven by explicit inputs: each
//! tick receives how long the user has been idle and the current instant.
//! A pass runs embedding, the analyzers, per-directory scoring and the
//! suggestion rules on a single task, checking a cancellation token
//! between directories. New user activity cancels the running pass.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{Config, SchedulerConfig};
use crate::db;
use crate::embed_cmd::{self, EmbedReport};
use crate::embedding::{EmbeddingClient, Embedder};
use crate::entropy::{self, GraphSnapshot};
use crate::files;
use crate::graph::{self, GraphReport};
use crate::staging::{PurgeReport, SafeOps};
use crate::suggest::{self, SuggestReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Scanning,
    Sleeping,
    Disabled,
}

/// Everything one pass did.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub embed: Option<EmbedReport>,
    pub graph: Option<GraphReport>,
    pub directories_total: usize,
    pub directories_scored: usize,
    pub score_errors: usize,
    pub suggestions: Option<SuggestReport>,
    pub purge: Option<PurgeReport>,
    pub cancelled: bool,
    /// Set when the pass stopped on an error instead of finishing.
    pub error: Option<String>,
}

impl PassReport {
    /// Fraction of directories scored; 1.0 when there were none.
    pub fn completion(&self) -> f64 {
        if self.directories_total == 0 {
            return if self.cancelled { 0.0 } else { 1.0 };
        }
        self.directories_scored as f64 / self.directories_total as f64
    }
}

/// Pure transition logic. Time only enters through arguments.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    last_pass_at: Option<Instant>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let state = if config.enabled {
            SchedulerState::Idle
        } else {
            SchedulerState::Disabled
        };
        Self {
            config,
            state,
            last_pass_at: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn interval_elapsed(&self, now: Instant) -> bool {
        match self.last_pass_at {
            Some(last) => {
                now.saturating_duration_since(last)
                    >= Duration::from_secs(self.config.min_interval_secs)
            }
            None => true,
        }
    }

    /// Advance on a tick. Returns `true` when a pass should start now.
    pub fn tick(&mut self, idle_for: Duration, now: Instant) -> bool {
        if self.state == SchedulerState::Sleeping && self.interval_elapsed(now) {
            self.state = SchedulerState::Idle;
        }
        if self.state != SchedulerState::Idle {
            return false;
        }
        if idle_for >= Duration::from_secs(self.config.idle_threshold_secs)
            && self.interval_elapsed(now)
        {
            self.state = SchedulerState::Scanning;
            return true;
        }
        false
    }

    /// Record the end of a pass. A cancelled pass that scored enough
    /// directories still counts as done and starts the cooldown. A failed
    /// pass also starts the cooldown so a persistent error cannot restart
    /// it on every tick.
    pub fn finish(&mut self, report: &PassReport, now: Instant) {
        if self.state != SchedulerState::Scanning {
            return;
        }
        if report.error.is_some()
            || !report.cancelled
            || report.completion() >= self.config.partial_complete_ratio
        {
            self.state = SchedulerState::Sleeping;
            self.last_pass_at = Some(now);
        } else {
            self.state = SchedulerState::Idle;
        }
    }
}

/// Published after every state change.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub passes: u64,
    pub last_report: Option<PassReport>,
}

/// One background pass. Stops early, leaving written rows intact, once
/// `cancel` fires.
pub async fn run_pass(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&dyn Embedder>,
    cancel: &CancellationToken,
) -> Result<PassReport> {
    run_pass_inner(pool, config, embedder, cancel)
        .instrument(tracing::info_span!("background_pass"))
        .await
}

async fn run_pass_inner(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&dyn Embedder>,
    cancel: &CancellationToken,
) -> Result<PassReport> {
    let mut report = PassReport::default();

    if let Some(embedder) = embedder {
        let embed = embed_cmd::embed_pending(pool, embedder, config, None, cancel).await?;
        if embed.endpoint_unavailable {
            tracing::info!("embedding endpoint unavailable; semantic signals skipped this pass");
        }
        report.embed = Some(embed);
    }
    if cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    let graph_report = graph::build_graph(pool, config, cancel).await?;
    let graph_cancelled = graph_report.cancelled;
    report.graph = Some(graph_report);
    if graph_cancelled || cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    let snapshot = GraphSnapshot::load(pool).await?;
    let dirs = files::directories(pool).await?;
    report.directories_total = dirs.len();
    for dir in &dirs {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        match entropy::score_directory(pool, config, &snapshot, dir).await {
            Ok(_) => report.directories_scored += 1,
            Err(e) => {
                tracing::warn!(dir = %dir, error = %e, "scoring failed");
                report.score_errors += 1;
            }
        }
        tokio::task::yield_now().await;
    }

    if report.cancelled && report.completion() < config.scheduler.partial_complete_ratio {
        tracing::info!(
            scored = report.directories_scored,
            total = report.directories_total,
            "pass interrupted"
        );
        return Ok(report);
    }

    report.suggestions = Some(suggest::generate_suggestions(pool, config).await?);
    let ops = SafeOps::new(pool.clone(), config);
    report.purge = Some(ops.purge_expired(chrono::Utc::now()).await?);

    tracing::info!(
        scored = report.directories_scored,
        created = report.suggestions.as_ref().map(|s| s.created).unwrap_or(0),
        "pass finished"
    );
    Ok(report)
}

/// Drive the scheduler until `shutdown` fires.
///
/// `activity` carries the instant of the latest user interaction. A change
/// while a pass runs cancels that pass.
pub async fn run(
    pool: SqlitePool,
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    mut activity: watch::Receiver<Instant>,
    shutdown: CancellationToken,
    status: watch::Sender<SchedulerStatus>,
) -> Result<()> {
    let mut scheduler = Scheduler::new(config.scheduler.clone());
    let mut passes = 0u64;
    let publish = |state: SchedulerState, passes: u64, last: Option<PassReport>| {
        status.send_replace(SchedulerStatus {
            state,
            passes,
            last_report: last,
        });
    };
    publish(scheduler.state(), passes, None);
    if scheduler.state() == SchedulerState::Disabled {
        tracing::info!("scheduler disabled");
        return Ok(());
    }

    let tick = Duration::from_secs(config.scheduler.tick_secs.max(1));
    let mut last_report = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        let now = Instant::now();
        let idle_for = now.saturating_duration_since(*activity.borrow_and_update());
        let before = scheduler.state();
        if !scheduler.tick(idle_for, now) {
            if scheduler.state() != before {
                publish(scheduler.state(), passes, last_report.clone());
            }
            continue;
        }
        publish(SchedulerState::Scanning, passes, last_report.clone());

        let cancel = shutdown.child_token();
        let pass = run_pass(&pool, &config, embedder.as_deref(), &cancel);
        tokio::pin!(pass);
        let mut watching = true;
        let result = loop {
            tokio::select! {
                r = &mut pass => break r,
                changed = activity.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            tracing::info!("user activity, cancelling pass");
                            cancel.cancel();
                        }
                        Err(_) => watching = false,
                    }
                }
            }
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "pass failed");
                PassReport {
                    error: Some(message),
                    ..Default::default()
                }
            }
        };
        passes += 1;
        scheduler.finish(&report, Instant::now());
        last_report = Some(report);
        publish(scheduler.state(), passes, last_report.clone());

        if shutdown.is_cancelled() {
            break;
        }
    }
    Ok(())
}

fn embedder_for(config: &Config) -> Option<Arc<dyn Embedder>> {
    if !config.embedding.is_enabled() {
        return None;
    }
    match EmbeddingClient::new(&config.embedding) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "embedding client unavailable");
            None
        }
    }
}

fn print_pass(report: &PassReport) {
    println!("pass");
    if let Some(embed) = &report.embed {
        println!("  embedded: {}/{}", embed.embedded, embed.pending);
        if embed.endpoint_unavailable {
            println!("  embedding endpoint unavailable");
        }
    }
    if let Some(graph) = &report.graph {
        println!("  edges written: {}", graph.edges_written());
        println!("  edges pruned: {}", graph.pruned);
    }
    println!(
        "  directories scored: {}/{}",
        report.directories_scored, report.directories_total
    );
    if let Some(s) = &report.suggestions {
        println!("  new suggestions: {}", s.created);
    }
    if let Some(p) = &report.purge {
        println!("  staging purged: {}", p.purged.len());
    }
    if report.cancelled {
        println!("  (cancelled)");
    }
    if let Some(error) = &report.error {
        println!("  failed: {}", error);
    }
}

/// CLI entry point for `dsense pass`: one forced pass, Ctrl-C cancels.
pub async fn run_once(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let embedder = embedder_for(config);
    let report = run_pass(&pool, config, embedder.as_deref(), &cancel).await?;
    print_pass(&report);
    pool.close().await;
    Ok(())
}

/// CLI entry point for `dsense watch`. Each line read from stdin counts as
/// user activity; Ctrl-C stops the scheduler.
pub async fn run_watch(config: &Config) -> Result<()> {
    if !config.scheduler.enabled {
        println!("Scheduler is disabled. Set `enabled = true` under [scheduler] to use watch.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let shutdown = CancellationToken::new();
    let (activity_tx, activity_rx) = watch::channel(Instant::now());
    let (status_tx, mut status_rx) = watch::channel(SchedulerStatus {
        state: SchedulerState::Idle,
        passes: 0,
        last_report: None,
    });

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            activity_tx.send_replace(Instant::now());
        }
    });

    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            eprintln!("scheduler: {:?} (passes: {})", status.state, status.passes);
            if let Some(report) = &status.last_report {
                if status.state != SchedulerState::Scanning {
                    print_pass(report);
                }
            }
        }
    });

    let embedder = embedder_for(config);
    let result = run(
        pool.clone(),
        config.clone(),
        embedder,
        activity_rx,
        shutdown,
        status_tx,
    )
    .await;
    pool.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed_cmd::stub::StubEmbedder;
    use crate::files::fixtures::{memory_pool, seed_file};

    fn enabled() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            idle_threshold_secs: 60,
            min_interval_secs: 600,
            tick_secs: 1,
            partial_complete_ratio: 0.9,
        }
    }

    fn done() -> PassReport {
        PassReport {
            directories_total: 4,
            directories_scored: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_by_default_never_scans() {
        let mut s = Scheduler::new(SchedulerConfig::default());
        assert_eq!(s.state(), SchedulerState::Disabled);
        assert!(!s.tick(Duration::from_secs(100_000), Instant::now()));
        assert_eq!(s.state(), SchedulerState::Disabled);
    }

    #[test]
    fn test_idle_threshold_and_cooldown() {
        let mut s = Scheduler::new(enabled());
        let t0 = Instant::now();

        assert!(!s.tick(Duration::from_secs(30), t0));
        assert_eq!(s.state(), SchedulerState::Idle);

        assert!(s.tick(Duration::from_secs(61), t0));
        assert_eq!(s.state(), SchedulerState::Scanning);
        assert!(!s.tick(Duration::from_secs(61), t0));

        s.finish(&done(), t0);
        assert_eq!(s.state(), SchedulerState::Sleeping);

        let soon = t0 + Duration::from_secs(300);
        assert!(!s.tick(Duration::from_secs(1000), soon));
        assert_eq!(s.state(), SchedulerState::Sleeping);

        let later = t0 + Duration::from_secs(601);
        assert!(s.tick(Duration::from_secs(1000), later));
        assert_eq!(s.state(), SchedulerState::Scanning);
    }

    #[test]
    fn test_sleeping_returns_to_idle_without_idle_user() {
        let mut s = Scheduler::new(enabled());
        let t0 = Instant::now();
        assert!(s.tick(Duration::from_secs(61), t0));
        s.finish(&done(), t0);

        assert!(!s.tick(Duration::ZERO, t0 + Duration::from_secs(700)));
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_interrupted_pass_goes_idle_unless_nearly_done() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(enabled());
        assert!(s.tick(Duration::from_secs(61), t0));
        s.finish(
            &PassReport {
                directories_total: 10,
                directories_scored: 3,
                cancelled: true,
                ..Default::default()
            },
            t0,
        );
        assert_eq!(s.state(), SchedulerState::Idle);
        // no cooldown after an abandoned pass
        assert!(s.tick(Duration::from_secs(61), t0 + Duration::from_secs(1)));

        s.finish(
            &PassReport {
                directories_total: 10,
                directories_scored: 9,
                cancelled: true,
                ..Default::default()
            },
            t0,
        );
        assert_eq!(s.state(), SchedulerState::Sleeping);
    }

    #[test]
    fn test_failed_pass_waits_for_the_interval() {
        let t0 = Instant::now();
        let mut s = Scheduler::new(enabled());
        assert!(s.tick(Duration::from_secs(61), t0));
        s.finish(
            &PassReport {
                error: Some("database is locked".into()),
                ..Default::default()
            },
            t0,
        );
        assert_eq!(s.state(), SchedulerState::Sleeping);

        assert!(!s.tick(Duration::from_secs(1000), t0 + Duration::from_secs(5)));
        assert_eq!(s.state(), SchedulerState::Sleeping);
        assert!(s.tick(Duration::from_secs(1000), t0 + Duration::from_secs(601)));
    }

    #[tokio::test]
    async fn test_pass_scores_every_directory() {
        let pool = memory_pool().await;
        let old = chrono::Utc::now().timestamp() - 400 * 86_400;
        seed_file(&pool, 1, "/nowhere/a/one.txt", 10, old, "d").await;
        seed_file(&pool, 2, "/nowhere/a/two.txt", 10, old, "d").await;
        seed_file(&pool, 3, "/nowhere/b/three.txt", 10, old, "d").await;
        let config = Config::minimal(std::path::Path::new("/nonexistent/dsense.sqlite"));
        let stub = StubEmbedder::new();

        let report = run_pass(&pool, &config, Some(&stub), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.embed.as_ref().unwrap().embedded, 3);
        assert_eq!(report.directories_total, 2);
        assert_eq!(report.directories_scored, 2);
        assert_eq!(report.completion(), 1.0);
        assert!(report.suggestions.unwrap().created >= 2);
        assert_eq!(entropy::directory_scores(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_pass_writes_nothing_new() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/nowhere/a/one.txt", 10, 0, "d").await;
        let config = Config::minimal(std::path::Path::new("/nonexistent/dsense.sqlite"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_pass(&pool, &config, None, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.suggestions.is_none());
        assert!(entropy::directory_scores(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_disabled() {
        let pool = memory_pool().await;
        let config = Config::minimal(std::path::Path::new("/nonexistent/dsense.sqlite"));
        let (_tx, rx) = watch::channel(Instant::now());
        let (status_tx, status_rx) = watch::channel(SchedulerStatus {
            state: SchedulerState::Idle,
            passes: 0,
            last_report: None,
        });

        run(pool, config, None, rx, CancellationToken::new(), status_tx)
            .await
            .unwrap();
        assert_eq!(status_rx.borrow().state, SchedulerState::Disabled);
    }

    /// Holds each batch long enough for activity to arrive mid-pass.
    struct SlowEmbedder;

    #[async_trait::async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_activity_during_pass_cancels_it() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/nowhere/a/one.txt", 10, 0, "d").await;
        seed_file(&pool, 2, "/nowhere/b/two.txt", 10, 0, "d").await;
        let mut config = Config::minimal(std::path::Path::new("/nonexistent/dsense.sqlite"));
        config.scheduler = SchedulerConfig {
            idle_threshold_secs: 0,
            ..enabled()
        };

        let start = Instant::now() - Duration::from_secs(10);
        let (activity_tx, activity_rx) = watch::channel(start);
        let (status_tx, mut status_rx) = watch::channel(SchedulerStatus {
            state: SchedulerState::Idle,
            passes: 0,
            last_report: None,
        });
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            pool.clone(),
            config,
            Some(Arc::new(SlowEmbedder)),
            activity_rx,
            shutdown.clone(),
            status_tx,
        ));

        let wait = async {
            loop {
                status_rx.changed().await.unwrap();
                if status_rx.borrow_and_update().state == SchedulerState::Scanning {
                    break;
                }
            }
            activity_tx.send_replace(Instant::now());
            loop {
                status_rx.changed().await.unwrap();
                let status = status_rx.borrow_and_update().clone();
                if status.passes == 1 {
                    return status;
                }
            }
        };
        let status = tokio::time::timeout(Duration::from_secs(20), wait)
            .await
            .unwrap();

        assert_eq!(status.state, SchedulerState::Idle);
        let report = status.last_report.unwrap();
        assert!(report.cancelled);
        assert!(report.error.is_none());
        assert!(report.suggestions.is_none());
        assert!(entropy::directory_scores(&pool).await.unwrap().is_empty());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
