//! Orchestrator: owns the job lifecycle from enqueue to a terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use archiver_core::{
    Archive, ArchiveContent, ArchiveId, ArchiveState, Failure, FailureReason, LinkId, RetryKind,
    Stage, StageMetrics, TransitionRecord, Trigger,
};
use archiver_logging::{archiver_debug, archiver_error, archiver_info, archiver_warn};
use chrono::Utc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::decode::decode_html;
use crate::extract::{Extractor, ReadabilityExtractor};
use crate::fetch::{FetchSettings, Fetcher, ReqwestFetcher};
use crate::resolve::{Resolver, SystemResolver};
use crate::sanitize::{PruningSanitizer, Sanitizer};
use crate::store::{archive_repo, Database, StoreError};
use crate::validate::UrlValidator;
use crate::{ArchiveEvent, ArchiverConfig, ArchiverError, PipelineStage};

const EVENT_CAPACITY: usize = 256;

/// Builds an [`Archiver`]; every collaborator has a production default.
pub struct ArchiverBuilder {
    config: ArchiverConfig,
    db: Database,
    resolver: Option<Arc<dyn Resolver>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    extractor: Option<Arc<dyn Extractor>>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    runtime: Option<Handle>,
}

impl ArchiverBuilder {
    pub fn new(config: ArchiverConfig, db: Database) -> Self {
        Self {
            config,
            db,
            resolver: None,
            fetcher: None,
            extractor: None,
            sanitizer: None,
            runtime: None,
        }
    }

    /// Resolver used by the validator and, unless a fetcher is supplied,
    /// by the fetcher's connection guard.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Runtime to spawn jobs on. Defaults to the current runtime, or a
    /// dedicated one when called outside any.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Archiver, ArchiverError> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let block_list = Arc::new(config.block_list());
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver) as Arc<dyn Resolver>);
        let validator = UrlValidator::new(
            Arc::clone(&resolver),
            Arc::clone(&block_list),
            config.connect_timeout(),
        );
        let fetcher = self.fetcher.unwrap_or_else(|| {
            Arc::new(ReqwestFetcher::new(
                FetchSettings::from(config.as_ref()),
                resolver,
                block_list,
            )) as Arc<dyn Fetcher>
        });
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(ReadabilityExtractor::default()) as Arc<dyn Extractor>);
        let sanitizer = self
            .sanitizer
            .unwrap_or_else(|| Arc::new(PruningSanitizer::new()) as Arc<dyn Sanitizer>);

        let (handle, runtime) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("archiver")
                    .build()
                    .map_err(ArchiverError::Runtime)?;
                (runtime.handle().clone(), Some(Arc::new(runtime)))
            }
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        archiver_info!(
            "Archiver ready (enabled={}, max_concurrent_jobs={})",
            config.enabled,
            config.max_concurrent_jobs
        );

        Ok(Archiver {
            inner: Arc::new(Inner {
                config,
                db: self.db,
                validator,
                fetcher,
                extractor,
                sanitizer,
                handle,
                permits,
                jobs: Mutex::new(HashMap::new()),
                events,
            }),
            _runtime: runtime,
        })
    }
}

/// Outcome of [`Archiver::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeSummary {
    /// Archives found in `processing` with no live job, now `failed`.
    pub interrupted: usize,
    /// Pending archives handed to the pipeline.
    pub enqueued: usize,
}

/// Public entry point: creates archives, runs their jobs in the background
/// and answers queries about them.
///
/// Cloning is cheap; clones share the same jobs and database.
#[derive(Clone)]
pub struct Archiver {
    inner: Arc<Inner>,
    // Held outside `Inner` so a finishing job never drops the runtime it runs on.
    _runtime: Option<Arc<Runtime>>,
}

impl Archiver {
    pub fn builder(config: ArchiverConfig, db: Database) -> ArchiverBuilder {
        ArchiverBuilder::new(config, db)
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.inner.config
    }

    /// Creates the pending archive for `link_id` and, when the pipeline is
    /// enabled, starts its job. Returns as soon as the row exists.
    pub fn create_archive(&self, link_id: &str, url: &str) -> Result<ArchiveId, ArchiverError> {
        let archive = archive_repo::create(&self.inner.db, link_id, url, Utc::now())?;
        archiver_info!("Archive {} created for link {}", archive.id, link_id);
        if self.inner.config.enabled {
            self.inner.spawn_job(Job {
                archive_id: archive.id,
                link_id: archive.link_id,
                url: archive.url,
                attempt: 1,
                entry: Entry::Start,
            });
        } else {
            archiver_debug!("Archiving disabled; archive {} stays pending", archive.id);
        }
        Ok(archive.id)
    }

    pub fn get_archive(&self, link_id: &str) -> Result<Option<Archive>, ArchiverError> {
        Ok(archive_repo::get_by_link(&self.inner.db, link_id)?)
    }

    pub fn transitions(&self, archive_id: ArchiveId) -> Result<Vec<TransitionRecord>, ArchiverError> {
        Ok(archive_repo::transitions(&self.inner.db, archive_id)?)
    }

    pub fn is_running(&self, archive_id: ArchiveId) -> bool {
        self.inner.is_running(archive_id)
    }

    /// Cancels the running job, if any. The job records a `cancelled`
    /// failure at its next checkpoint. Returns whether a job was running.
    pub fn cancel_archive(&self, link_id: &str) -> Result<bool, ArchiverError> {
        let archive = self.require(link_id)?;
        Ok(self.inner.cancel(archive.id))
    }

    /// Deletes the owner and, by cascade, its archive and history. A running
    /// job is cancelled and its late writes are discarded.
    pub fn delete_owner(&self, link_id: &str) -> Result<bool, ArchiverError> {
        if let Some(archive) = archive_repo::get_by_link(&self.inner.db, link_id)? {
            self.inner.cancel(archive.id);
        }
        let deleted = archive_repo::delete_link(&self.inner.db, link_id)?;
        if deleted {
            archiver_info!("Deleted link {} and its archive", link_id);
        }
        Ok(deleted)
    }

    /// Moves a failed archive back to `processing` and runs it again.
    pub fn retry_archive(&self, link_id: &str) -> Result<ArchiveId, ArchiverError> {
        let archive = self.require(link_id)?;
        if archive.state != ArchiveState::Failed {
            return Err(ArchiverError::InvalidState {
                link_id: link_id.to_string(),
                state: archive.state,
                expected: ArchiveState::Failed,
            });
        }
        if self.inner.is_running(archive.id) {
            return Err(ArchiverError::JobRunning(link_id.to_string()));
        }

        let attempt = archive_repo::attempts(&self.inner.db, archive.id)? + 1;
        let (_, record) = archive_repo::transition(
            &self.inner.db,
            archive.id,
            Trigger::Retry {
                attempt,
                kind: RetryKind::Manual,
            },
            Utc::now(),
        )?;
        self.inner.emit_state_change(archive.id, &archive.link_id, &record);
        archiver_info!("Manual retry of archive {} (attempt {})", archive.id, attempt);

        self.inner.spawn_job(Job {
            archive_id: archive.id,
            link_id: archive.link_id,
            url: archive.url,
            attempt,
            entry: Entry::Resumed,
        });
        Ok(archive.id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.inner.events.subscribe()
    }

    /// Startup recovery: archives left in `processing` by a previous run are
    /// failed as `cancelled`, and pending ones are enqueued.
    pub fn resume(&self) -> Result<ResumeSummary, ArchiverError> {
        let db = &self.inner.db;
        let mut summary = ResumeSummary::default();

        for archive in archive_repo::list_by_state(db, ArchiveState::Processing)? {
            if self.inner.is_running(archive.id) {
                continue;
            }
            let attempt = archive_repo::attempts(db, archive.id)?;
            let trigger = Trigger::Fail {
                failure: Failure::cancelled("interrupted before completion")
                    .at_stage(Stage::Orchestration),
                metrics: StageMetrics {
                    attempt,
                    ..StageMetrics::default()
                },
            };
            match archive_repo::transition(db, archive.id, trigger, Utc::now()) {
                Ok((_, record)) => {
                    self.inner.emit_state_change(archive.id, &archive.link_id, &record);
                    summary.interrupted += 1;
                }
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if self.inner.config.enabled {
            for archive in archive_repo::list_by_state(db, ArchiveState::Pending)? {
                if self.inner.is_running(archive.id) {
                    continue;
                }
                self.inner.spawn_job(Job {
                    archive_id: archive.id,
                    link_id: archive.link_id,
                    url: archive.url,
                    attempt: 1,
                    entry: Entry::Start,
                });
                summary.enqueued += 1;
            }
        }

        archiver_info!(
            "Resume: {} interrupted archives failed, {} pending archives enqueued",
            summary.interrupted,
            summary.enqueued
        );
        Ok(summary)
    }

    fn require(&self, link_id: &str) -> Result<Archive, ArchiverError> {
        archive_repo::get_by_link(&self.inner.db, link_id)?
            .ok_or_else(|| ArchiverError::NotFound(link_id.to_string()))
    }
}

/// How a job enters `processing`.
enum Entry {
    /// From `pending`; the job records the start transition itself.
    Start,
    /// Already moved to `processing` by the caller.
    Resumed,
}

struct Job {
    archive_id: ArchiveId,
    link_id: LinkId,
    url: String,
    attempt: u32,
    entry: Entry,
}

struct Inner {
    config: Arc<ArchiverConfig>,
    db: Database,
    validator: UrlValidator,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    sanitizer: Arc<dyn Sanitizer>,
    handle: Handle,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<ArchiveId, CancellationToken>>,
    events: broadcast::Sender<ArchiveEvent>,
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<ArchiveId, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self, archive_id: ArchiveId) -> bool {
        self.lock_jobs().contains_key(&archive_id)
    }

    fn cancel(&self, archive_id: ArchiveId) -> bool {
        match self.lock_jobs().get(&archive_id) {
            Some(token) => {
                archiver_info!("Cancelling job for archive {}", archive_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn spawn_job(self: &Arc<Self>, job: Job) {
        let token = CancellationToken::new();
        self.lock_jobs().insert(job.archive_id, token.clone());
        let inner = Arc::clone(self);
        self.handle.spawn(async move {
            let archive_id = job.archive_id;
            let _permit = tokio::select! {
                permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
                _ = token.cancelled() => None,
            };
            inner.run_job(job, &token).await;
            inner.lock_jobs().remove(&archive_id);
        });
    }

    async fn run_job(&self, job: Job, token: &CancellationToken) {
        let archive_id = job.archive_id;
        let mut attempt = job.attempt;
        if matches!(job.entry, Entry::Start)
            && self
                .apply(archive_id, &job.link_id, Trigger::Start { attempt })
                .await
                .is_none()
        {
            return;
        }

        loop {
            let started = Instant::now();
            let mut metrics = StageMetrics {
                attempt,
                ..StageMetrics::default()
            };
            let outcome = self.run_pipeline(archive_id, &job.url, token, &mut metrics).await;
            metrics.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

            let failure = match outcome {
                Ok(content) => {
                    archiver_info!(
                        "Archive {} completed on attempt {} in {} ms",
                        archive_id,
                        attempt,
                        metrics.duration_ms.unwrap_or_default()
                    );
                    let trigger = Trigger::Complete {
                        content: Box::new(content),
                        metrics,
                    };
                    self.apply(archive_id, &job.link_id, trigger).await;
                    return;
                }
                Err(failure) => failure,
            };

            let retry = failure.reason.is_retryable()
                && attempt < self.config.max_retries
                && !token.is_cancelled();
            archiver_warn!(
                "Archive {} attempt {} failed: {}",
                archive_id,
                attempt,
                failure.error_message()
            );
            let recorded = self
                .apply(archive_id, &job.link_id, Trigger::Fail { failure, metrics })
                .await;
            if recorded.is_none() || !retry {
                return;
            }

            let delay = self.config.retry_delay(attempt);
            archiver_info!("Retrying archive {} in {:?}", archive_id, delay);
            tokio::select! {
                _ = token.cancelled() => {
                    archiver_info!("Retry of archive {} cancelled", archive_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            let trigger = Trigger::Retry {
                attempt,
                kind: RetryKind::Automatic,
            };
            if self.apply(archive_id, &job.link_id, trigger).await.is_none() {
                return;
            }
        }
    }

    /// Validate, fetch, extract and sanitize. Every stage is a cancellation
    /// checkpoint; CPU-bound stages run on the blocking pool.
    async fn run_pipeline(
        &self,
        archive_id: ArchiveId,
        url: &str,
        token: &CancellationToken,
        metrics: &mut StageMetrics,
    ) -> Result<ArchiveContent, Failure> {
        self.progress(archive_id, PipelineStage::Validating);
        let validated = cancellable(token, Stage::Validation, self.validator.validate(url))
            .await?
            .map_err(Failure::from)?;
        metrics.resolved_ip = validated.primary_address();

        self.progress(archive_id, PipelineStage::Fetching);
        let output = cancellable(token, Stage::Fetch, self.fetcher.fetch(validated.url.as_str()))
            .await?
            .map_err(Failure::from)?;
        let fetched_at = Utc::now();
        let final_url = output.metadata.final_url.clone();
        metrics.http_status = Some(output.metadata.status);
        metrics.byte_count = Some(output.metadata.byte_len);
        metrics.final_url = Some(final_url.clone());
        archiver_debug!(
            "Fetched {} bytes for archive {} ({} redirects)",
            output.metadata.byte_len,
            archive_id,
            output.metadata.redirect_count
        );

        self.progress(archive_id, PipelineStage::Extracting);
        let extractor = Arc::clone(&self.extractor);
        let page_url = final_url.clone();
        let content_type = output.metadata.content_type;
        let bytes = output.bytes;
        let extracted = blocking(token, Stage::Extraction, FailureReason::MainContentExtractionFailed, move || {
            let decoded = decode_html(&bytes, content_type.as_deref());
            extractor.extract(&decoded.html, &page_url)
        })
        .await?
        .map_err(Failure::from)?;

        self.progress(archive_id, PipelineStage::Sanitizing);
        let sanitizer = Arc::clone(&self.sanitizer);
        let fragment = extracted.content_html;
        let content_html = blocking(token, Stage::Sanitization, FailureReason::SanitizationFailed, move || {
            sanitizer.sanitize(&fragment)
        })
        .await?
        .map_err(Failure::from)?;

        if token.is_cancelled() {
            return Err(Failure::cancelled("cancelled before persisting"));
        }
        self.progress(archive_id, PipelineStage::Persisting);
        Ok(ArchiveContent {
            content_html,
            content_text: extracted.content_text,
            title: extracted.title,
            description: extracted.description,
            image_url: extracted.image_url,
            final_url,
            metadata: extracted.metadata,
            fetched_at,
        })
    }

    /// Persists one transition off the async threads. `None` means the job
    /// should stop: the archive is gone or the write failed.
    async fn apply(&self, archive_id: ArchiveId, link_id: &str, trigger: Trigger) -> Option<Archive> {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            archive_repo::transition(&db, archive_id, trigger, Utc::now())
        })
        .await;
        match result {
            Ok(Ok((archive, record))) => {
                self.emit_state_change(archive_id, link_id, &record);
                Some(archive)
            }
            Ok(Err(StoreError::NotFound(_))) => {
                archiver_debug!("Archive {} no longer exists; dropping its job", archive_id);
                None
            }
            Ok(Err(err)) => {
                archiver_error!("Failed to record transition for archive {}: {}", archive_id, err);
                None
            }
            Err(err) => {
                archiver_error!("Transition task for archive {} failed: {}", archive_id, err);
                None
            }
        }
    }

    fn emit_state_change(&self, archive_id: ArchiveId, link_id: &str, record: &TransitionRecord) {
        archiver_debug!(
            "Archive {}: {} -> {}",
            archive_id,
            record.from_state,
            record.to_state
        );
        // No subscribers is fine.
        let _ = self.events.send(ArchiveEvent::StateChanged {
            archive_id,
            link_id: link_id.to_string(),
            from: record.from_state,
            to: record.to_state,
        });
    }

    fn progress(&self, archive_id: ArchiveId, stage: PipelineStage) {
        archiver_debug!("Archive {}: {:?}", archive_id, stage);
        let _ = self.events.send(ArchiveEvent::Progress { archive_id, stage });
    }
}

async fn cancellable<F: Future>(
    token: &CancellationToken,
    stage: Stage,
    future: F,
) -> Result<F::Output, Failure> {
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            Err(Failure::cancelled(format!("cancelled during {stage}")).at_stage(stage))
        }
        output = future => Ok(output),
    }
}

async fn blocking<T, F>(
    token: &CancellationToken,
    stage: Stage,
    reason: FailureReason,
    work: F,
) -> Result<T, Failure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match cancellable(token, stage, tokio::task::spawn_blocking(work)).await? {
        Ok(output) => Ok(output),
        Err(err) => Err(Failure::new(reason, format!("{stage} task failed: {err}")).at_stage(stage)),
    }
}
