//! The synchronization pipeline.
//!
//! A sync pass fans repositories out to a wide pool of list-tags workers,
//! which compute the missing-tag difference per repository and feed a small
//! pool of retag workers over bounded channels:
//!
//! ```text
//! repos ──> get_tags channel ──> [list-tags worker × 100]
//!                                        │
//!                                        ▼
//!                                  retag channel
//!                                        │
//!                                        ▼
//!                                 [retag worker × 4]
//! ```
//!
//! Per-repository and per-tag failures are logged and counted without
//! halting the pass; a pass-level failure terminates the run only outside
//! loop mode.

pub mod progress;

use crate::image::{ImageTool, image_ref};
use crate::metrics::{ERRORS_TOTAL, TAGS_SYNCED_TOTAL, TAGS_TOTAL};
use crate::registry::rate_limit::{LIST_TAGS_BURST, PULL_PUSH_BURST};
use crate::registry::{Credentials, Registry};
use anyhow::{Context as _, Result};
use futures::future::join_all;
use progress::Progress;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listing is cheap; a wide pool amortizes the rate-limited tag listing
/// waits across many repositories.
const GET_TAGS_WORKERS: usize = 100;

/// The image tool serializes heavy I/O on the local node; four workers stay
/// below its parallel-push ceiling and leave headroom for other local work.
/// Do not raise without reviewing the image tool's own limits.
const RETAG_WORKERS: usize = 4;

// Channel capacities track the limiter bursts so a burst of tokens does not
// starve workers while buffering stays bounded.
const GET_TAGS_QUEUE: usize = (LIST_TAGS_BURST * 4) as usize;
const RETAG_QUEUE: usize = (PULL_PUSH_BURST * 2) as usize;

const LOGIN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Order-preserving set difference: the tags present in `src` but absent
/// from `dst`.
pub fn difference(src: &[String], dst: &[String]) -> Vec<String> {
    src.iter()
        .filter(|tag| !dst.contains(tag))
        .cloned()
        .collect()
}

/// Registry login treated as a leased resource with a TTL, so tight loop
/// mode does not thrash the auth endpoints.
#[derive(Debug, Clone, Copy)]
enum Session {
    Inactive,
    Active { since: Instant },
}

impl Session {
    fn expired(&self, ttl: Duration) -> bool {
        match self {
            Session::Inactive => true,
            Session::Active { since } => since.elapsed() >= ttl,
        }
    }
}

struct GetTagsJob {
    src: Arc<dyn Registry>,
    dst: Arc<dyn Registry>,
    id: String,
    repo: String,
}

struct RetagJob {
    src: Arc<dyn Registry>,
    dst: Arc<dyn Registry>,
    id: String,
    repo: String,
    tag: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub src_credentials: Credentials,
    pub dst_credentials: Credentials,
    /// Run continuously, sleeping `sync_interval` between passes.
    pub loop_mode: bool,
    pub sync_interval: Duration,
}

/// Drives sync passes between a source and a destination registry.
pub struct Syncer {
    src: Arc<dyn Registry>,
    dst: Arc<dyn Registry>,
    image_tool: Arc<dyn ImageTool>,
    config: SyncConfig,
    session: Session,
    progress: Arc<Progress>,
}

impl Syncer {
    pub fn new(
        src: Arc<dyn Registry>,
        dst: Arc<dyn Registry>,
        image_tool: Arc<dyn ImageTool>,
        config: SyncConfig,
    ) -> Self {
        Self {
            src,
            dst,
            image_tool,
            config,
            session: Session::Inactive,
            progress: Arc::new(Progress::new()),
        }
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Runs sync passes until completion, a fatal error (non-loop mode) or
    /// cancellation.
    pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
        let reporter = progress::spawn_reporter(self.progress.clone(), token.clone());
        let result = self.run_inner(&token).await;
        reporter.abort();
        result
    }

    async fn run_inner(&mut self, token: &CancellationToken) -> Result<()> {
        loop {
            let started = Instant::now();
            match self.run_pass(token).await {
                Ok(()) => {
                    info!(elapsed = ?started.elapsed(), "sync pass complete");
                }
                Err(err) if token.is_cancelled() => {
                    info!(error = format!("{err:#}"), "sync cancelled");
                    return Ok(());
                }
                Err(err) => {
                    ERRORS_TOTAL.inc();
                    if !self.config.loop_mode {
                        return Err(err);
                    }
                    error!(error = format!("{err:#}"), "sync pass failed");
                }
            }

            if !self.config.loop_mode || token.is_cancelled() {
                return Ok(());
            }

            debug!(seconds = self.config.sync_interval.as_secs(), "sleeping until next pass");
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
        }
    }

    /// Drives one full sync pass: session, worker pools, enumeration,
    /// dispatch, drain, session teardown.
    pub async fn run_pass(&mut self, token: &CancellationToken) -> Result<()> {
        self.progress.reset();
        self.ensure_session().await?;

        let (get_tags_tx, get_tags_rx) = mpsc::channel::<GetTagsJob>(GET_TAGS_QUEUE);
        let (retag_tx, retag_rx) = mpsc::channel::<RetagJob>(RETAG_QUEUE);
        let get_tags_rx = Arc::new(Mutex::new(get_tags_rx));
        let retag_rx = Arc::new(Mutex::new(retag_rx));

        // Listing failures do not halt the pass, but they must surface in
        // its result so non-loop runs exit non-zero.
        let list_failures = Arc::new(AtomicU64::new(0));

        let list_workers: Vec<JoinHandle<()>> = (0..GET_TAGS_WORKERS)
            .map(|_| {
                tokio::spawn(list_tags_worker(
                    get_tags_rx.clone(),
                    retag_tx.clone(),
                    self.progress.clone(),
                    list_failures.clone(),
                    token.clone(),
                ))
            })
            .collect();
        // The workers hold the only senders now; the retag channel closes
        // once they all finish.
        drop(retag_tx);

        let retag_workers: Vec<JoinHandle<()>> = (0..RETAG_WORKERS)
            .map(|_| {
                tokio::spawn(retag_worker(
                    retag_rx.clone(),
                    self.image_tool.clone(),
                    self.progress.clone(),
                    token.clone(),
                ))
            })
            .collect();

        let dispatched = self.dispatch(get_tags_tx, token).await;

        join_all(list_workers).await;
        join_all(retag_workers).await;

        self.teardown_session().await;

        dispatched?;

        let failures = list_failures.load(Ordering::Relaxed);
        if failures > 0 {
            anyhow::bail!("{failures} repositories failed to list tags");
        }

        Ok(())
    }

    async fn dispatch(&self, tx: Sender<GetTagsJob>, token: &CancellationToken) -> Result<()> {
        let repos = self
            .src
            .list_repositories()
            .await
            .context("listing source repositories")?;

        info!(registry = self.src.name(), count = repos.len(), "repositories to sync");
        self.progress.add_repos_total(repos.len() as u64);

        for (index, repo) in repos.into_iter().enumerate() {
            let job = GetTagsJob {
                src: self.src.clone(),
                dst: self.dst.clone(),
                id: format!("{index:05}"),
                repo,
            };

            tokio::select! {
                _ = token.cancelled() => {
                    ERRORS_TOTAL.inc();
                    warn!("cancelled while dispatching repositories");
                    break;
                }
                sent = tx.send(job) => {
                    if sent.is_err() {
                        // All list-tags workers are gone; nothing can
                        // receive further jobs.
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if !self.session.expired(LOGIN_TTL) {
            debug!("reusing registry session");
            return Ok(());
        }

        info!(src = self.src.name(), dst = self.dst.name(), "logging in to registries");
        self.src
            .login(&self.config.src_credentials)
            .await
            .context("logging in to source registry")?;
        self.dst
            .login(&self.config.dst_credentials)
            .await
            .context("logging in to destination registry")?;
        self.session = Session::Active { since: Instant::now() };

        Ok(())
    }

    /// Logs out of both registries once the session TTL has expired.
    /// Best-effort; a failed logout only warns.
    async fn teardown_session(&mut self) {
        let Session::Active { since } = self.session else {
            return;
        };
        if since.elapsed() < LOGIN_TTL {
            return;
        }

        info!("session expired, logging out of registries");
        if let Err(err) = self.src.logout().await {
            warn!(registry = self.src.name(), error = %err, "logout failed");
        }
        if let Err(err) = self.dst.logout().await {
            warn!(registry = self.dst.name(), error = %err, "logout failed");
        }
        self.session = Session::Inactive;
    }
}

async fn list_tags_worker(
    rx: Arc<Mutex<Receiver<GetTagsJob>>>,
    retag_tx: Sender<RetagJob>,
    progress: Arc<Progress>,
    failures: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        match process_get_tags(&job, &retag_tx, &progress, &token).await {
            Ok(()) => progress.inc_repos_done(),
            Err(err) => {
                ERRORS_TOTAL.inc();
                failures.fetch_add(1, Ordering::Relaxed);
                error!(job = %job.id, repo = %job.repo, error = format!("{err:#}"), "failed to process repository");
            }
        }
    }
}

async fn process_get_tags(
    job: &GetTagsJob,
    retag_tx: &Sender<RetagJob>,
    progress: &Progress,
    token: &CancellationToken,
) -> Result<()> {
    let (src_tags, dst_tags) = tokio::join!(
        job.src.list_tags(&job.repo),
        job.dst.list_tags(&job.repo),
    );
    let src_tags = src_tags.with_context(|| format!("listing source tags for {}", job.repo))?;
    let dst_tags = dst_tags.with_context(|| format!("listing destination tags for {}", job.repo))?;

    TAGS_TOTAL
        .with_label_values(&[job.src.name(), &job.repo])
        .set(src_tags.len() as i64);
    TAGS_TOTAL
        .with_label_values(&[job.dst.name(), &job.repo])
        .set(dst_tags.len() as i64);

    let tags_to_sync = difference(&src_tags, &dst_tags);
    debug!(repo = %job.repo, missing = tags_to_sync.len(), "computed tag difference");
    progress.add_tags_total(tags_to_sync.len() as u64);

    for tag in tags_to_sync {
        let retag = RetagJob {
            src: job.src.clone(),
            dst: job.dst.clone(),
            id: format!("{}/{tag}", job.id),
            repo: job.repo.clone(),
            tag,
        };

        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("cancelled while enqueueing tags"),
            sent = retag_tx.send(retag) => {
                if sent.is_err() {
                    anyhow::bail!("retag workers are gone");
                }
            }
        }
    }

    Ok(())
}

async fn retag_worker(
    rx: Arc<Mutex<Receiver<RetagJob>>>,
    image_tool: Arc<dyn ImageTool>,
    progress: Arc<Progress>,
    token: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        match process_retag(&job, image_tool.as_ref()).await {
            Ok(()) => {
                progress.inc_tags_done();
                TAGS_SYNCED_TOTAL
                    .with_label_values(&[job.src.name(), job.dst.name(), &job.repo])
                    .inc();
            }
            Err(err) => {
                ERRORS_TOTAL.inc();
                error!(
                    job = %job.id,
                    repo = %job.repo,
                    tag = %job.tag,
                    error = format!("{err:#}"),
                    "failed to retag image"
                );
            }
        }
    }
}

/// The retag sequence. The local node has bounded disk, so both the pulled
/// source image and the retagged destination image are removed promptly
/// after the push; the failure paths undo whatever local image the
/// preceding steps left behind.
async fn process_retag(job: &RetagJob, image_tool: &dyn ImageTool) -> Result<()> {
    let RetagJob { src, dst, repo, tag, .. } = job;
    info!(job = %job.id, image = %image_ref(dst.name(), repo, tag), "syncing missing tag");

    src.pull(repo, tag).await.context("pulling source image")?;

    let src_ref = image_ref(src.name(), repo, tag);
    let dst_ref = image_ref(dst.name(), repo, tag);
    if let Err(err) = image_tool.tag(&src_ref, &dst_ref).await {
        remove_best_effort(src.as_ref(), repo, tag).await;
        return Err(err).context("retagging image");
    }

    src.remove_image(repo, tag)
        .await
        .context("removing source image")?;

    if let Err(err) = dst.push(repo, tag).await {
        remove_best_effort(dst.as_ref(), repo, tag).await;
        return Err(err).context("pushing destination image");
    }

    dst.remove_image(repo, tag)
        .await
        .context("removing destination image")?;

    Ok(())
}

async fn remove_best_effort(registry: &dyn Registry, repo: &str, tag: &str) {
    if let Err(err) = registry.remove_image(repo, tag).await {
        warn!(
            image = %image_ref(registry.name(), repo, tag),
            error = %err,
            "best-effort image removal failed"
        );
    }
}
