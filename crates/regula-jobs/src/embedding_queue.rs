//! Batch queue for regenerating dictionary embeddings.
//!
//! One [`EmbeddingJob`] covers many dictionary entries. The target set is
//! resolved when the job is created; each item is then embedded and stored
//! independently, so a failing item only bumps the job's `failed` counter.
//! Jobs live in memory until the process exits.
//!
//! Items run either in-process (bounded by `item_concurrency`) or, with a
//! [`ManagedQueue`] attached, as one published message per item that comes
//! back through [`EmbeddingJobQueue::process_delivery`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use regula_core::defaults;
use regula_core::{
    DictionaryRepository, EmbeddingBackend, EmbeddingJob, EmbeddingTarget, EmbeddingTask, Error,
    Result,
};

use crate::managed_queue::ManagedQueue;

/// Where embedding items are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingQueueBackend {
    #[default]
    Memory,
    Managed,
}

impl FromStr for EmbeddingQueueBackend {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "managed" => Ok(Self::Managed),
            other => Err(Error::Config(format!(
                "EMBEDDING_QUEUE_BACKEND must be 'memory' or 'managed', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingQueueConfig {
    pub backend: EmbeddingQueueBackend,
    /// Items embedded concurrently within one in-process job.
    pub item_concurrency: usize,
}

impl Default for EmbeddingQueueConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingQueueBackend::Memory,
            item_concurrency: defaults::EMBEDDING_ITEM_CONCURRENCY,
        }
    }
}

impl EmbeddingQueueConfig {
    /// Read `EMBEDDING_QUEUE_BACKEND` and `EMBEDDING_ITEM_CONCURRENCY`.
    pub fn from_env() -> Result<Self> {
        let backend = match std::env::var("EMBEDDING_QUEUE_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => EmbeddingQueueBackend::Memory,
        };
        let item_concurrency = std::env::var("EMBEDDING_ITEM_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::EMBEDDING_ITEM_CONCURRENCY)
            .max(1);
        Ok(Self {
            backend,
            item_concurrency,
        })
    }

    pub fn with_item_concurrency(mut self, n: usize) -> Self {
        self.item_concurrency = n.max(1);
        self
    }
}

/// Result of handling one managed-queue delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Item embedded and counted.
    Recorded,
    /// Final attempt failed; item counted as failed.
    RecordedFailure,
    /// Item was already counted.
    Duplicate,
    /// Job is not known to this process (e.g. after a restart).
    UnknownJob,
    /// The entry is not one of the job's targets; nothing was counted.
    NotInJob,
}

struct JobEntry {
    job: EmbeddingJob,
    /// Entries resolved when the job was created.
    targets: HashSet<Uuid>,
    /// Items already counted, so redeliveries never double count.
    settled: HashSet<Uuid>,
}

struct Inner {
    config: EmbeddingQueueConfig,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    dictionary: Arc<dyn DictionaryRepository>,
    embedder: Arc<dyn EmbeddingBackend>,
    managed: Option<Arc<dyn ManagedQueue>>,
    stop: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

/// Handle to the embedding batch queue. Cheap to clone.
#[derive(Clone)]
pub struct EmbeddingJobQueue {
    inner: Arc<Inner>,
}

impl EmbeddingJobQueue {
    /// Queue that runs items in-process.
    pub fn new(
        config: EmbeddingQueueConfig,
        dictionary: Arc<dyn DictionaryRepository>,
        embedder: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        Self::build(config, dictionary, embedder, None)
    }

    /// Queue that publishes items to a managed queue.
    pub fn with_managed_queue(
        config: EmbeddingQueueConfig,
        dictionary: Arc<dyn DictionaryRepository>,
        embedder: Arc<dyn EmbeddingBackend>,
        managed: Arc<dyn ManagedQueue>,
    ) -> Self {
        Self::build(config, dictionary, embedder, Some(managed))
    }

    fn build(
        config: EmbeddingQueueConfig,
        dictionary: Arc<dyn DictionaryRepository>,
        embedder: Arc<dyn EmbeddingBackend>,
        managed: Option<Arc<dyn ManagedQueue>>,
    ) -> Self {
        info!(
            subsystem = "jobs",
            component = "embedding_queue",
            backend = if managed.is_some() { "managed" } else { "memory" },
            item_concurrency = config.item_concurrency,
            model = embedder.model_name(),
            "Embedding queue ready"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                jobs: RwLock::new(HashMap::new()),
                dictionary,
                embedder,
                managed,
                stop: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.inner.managed.is_some()
    }

    /// Create a job over the given entries (or every entry of the
    /// organization) and start it in the background.
    pub async fn enqueue_organization(
        &self,
        organization_id: Uuid,
        dictionary_ids: Option<Vec<Uuid>>,
    ) -> Result<EmbeddingJob> {
        if self.inner.stop.is_cancelled() {
            return Err(Error::Job("embedding queue is shut down".to_string()));
        }

        let (target, ids) = match dictionary_ids {
            Some(ids) => {
                if ids.is_empty() {
                    return Err(Error::InvalidInput(
                        "dictionary_ids must not be empty".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                let ids: Vec<Uuid> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
                (EmbeddingTarget::Ids(ids.clone()), ids)
            }
            None => (
                EmbeddingTarget::All,
                self.inner.dictionary.list_ids(organization_id).await?,
            ),
        };

        let job = EmbeddingJob::new(organization_id, target, ids.len());
        let job_id = job.id;
        self.inner.jobs.write().await.insert(
            job_id,
            JobEntry {
                job: job.clone(),
                targets: ids.iter().copied().collect(),
                settled: HashSet::new(),
            },
        );

        info!(
            subsystem = "jobs",
            component = "embedding_queue",
            job_id = %job_id,
            organization_id = %organization_id,
            total = job.total,
            "Embedding job created"
        );

        if !ids.is_empty() {
            let inner = self.inner.clone();
            let mut tasks = self.inner.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
            match self.inner.managed.clone() {
                Some(managed) => {
                    tasks.spawn(inner.publish_all(managed, job_id, organization_id, ids));
                }
                None => {
                    tasks.spawn(inner.run_job(job_id, organization_id, ids));
                }
            }
        }

        Ok(job)
    }

    /// Snapshot of a job.
    pub async fn get_job(&self, job_id: Uuid) -> Result<EmbeddingJob> {
        self.inner
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Jobs for an organization, newest first.
    pub async fn list_jobs(&self, organization_id: Uuid) -> Vec<EmbeddingJob> {
        let jobs = self.inner.jobs.read().await;
        let mut list: Vec<EmbeddingJob> = jobs
            .values()
            .filter(|entry| entry.job.organization_id == organization_id)
            .map(|entry| entry.job.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Handle one managed-queue delivery.
    ///
    /// An error asks the managed queue to redeliver. On the final attempt the
    /// failure is recorded instead, so the job still completes.
    pub async fn process_delivery(
        &self,
        task: &EmbeddingTask,
        attempt: u32,
    ) -> Result<DeliveryOutcome> {
        {
            let jobs = self.inner.jobs.read().await;
            match jobs.get(&task.job_id) {
                None => {
                    warn!(
                        subsystem = "jobs",
                        component = "embedding_queue",
                        job_id = %task.job_id,
                        "Delivery for unknown embedding job"
                    );
                    return Ok(DeliveryOutcome::UnknownJob);
                }
                Some(entry) if entry.job.organization_id != task.organization_id => {
                    return Err(Error::InvalidInput(
                        "task organization does not match job".to_string(),
                    ));
                }
                Some(entry) if !entry.targets.contains(&task.dictionary_id) => {
                    warn!(
                        subsystem = "jobs",
                        component = "embedding_queue",
                        job_id = %task.job_id,
                        dictionary_id = %task.dictionary_id,
                        "Delivery for an entry outside the job"
                    );
                    return Ok(DeliveryOutcome::NotInJob);
                }
                Some(entry) if entry.settled.contains(&task.dictionary_id) => {
                    return Ok(DeliveryOutcome::Duplicate);
                }
                Some(_) => {}
            }
        }

        let max_attempts = self
            .inner
            .managed
            .as_ref()
            .map(|m| m.max_attempts())
            .unwrap_or(defaults::MANAGED_QUEUE_RETRIES);

        match self
            .inner
            .embed_item(task.organization_id, task.dictionary_id)
            .await
        {
            Ok(()) => Ok(
                match self
                    .inner
                    .record(task.job_id, task.dictionary_id, true)
                    .await
                {
                    Some(_) => DeliveryOutcome::Recorded,
                    None => DeliveryOutcome::Duplicate,
                },
            ),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    subsystem = "jobs",
                    component = "embedding_queue",
                    job_id = %task.job_id,
                    dictionary_id = %task.dictionary_id,
                    attempt,
                    error = %e,
                    "Embedding item failed on final delivery"
                );
                Ok(
                    match self
                        .inner
                        .record(task.job_id, task.dictionary_id, false)
                        .await
                    {
                        Some(_) => DeliveryOutcome::RecordedFailure,
                        None => DeliveryOutcome::Duplicate,
                    },
                )
            }
            Err(e) => {
                debug!(
                    subsystem = "jobs",
                    component = "embedding_queue",
                    job_id = %task.job_id,
                    dictionary_id = %task.dictionary_id,
                    attempt,
                    error = %e,
                    "Embedding item failed, requesting redelivery"
                );
                Err(e)
            }
        }
    }

    /// Stop background jobs. Unfinished jobs keep their partial counts.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!(
            subsystem = "jobs",
            component = "embedding_queue",
            "Embedding queue stopped"
        );
    }
}

impl Inner {
    async fn mark_started(&self, job_id: Uuid) {
        if let Some(entry) = self.jobs.write().await.get_mut(&job_id) {
            entry.job.start();
        }
    }

    /// Count one item. Returns the updated job, or `None` when the item was
    /// already counted, is not a target, or the job is unknown.
    async fn record(&self, job_id: Uuid, dictionary_id: Uuid, success: bool) -> Option<EmbeddingJob> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&job_id)?;
        if !entry.targets.contains(&dictionary_id) || !entry.settled.insert(dictionary_id) {
            return None;
        }
        entry.job.record(success);

        if entry.job.is_complete() {
            info!(
                subsystem = "jobs",
                component = "embedding_queue",
                job_id = %job_id,
                total = entry.job.total,
                processed = entry.job.processed,
                failed = entry.job.failed,
                "Embedding job completed"
            );
        }
        Some(entry.job.clone())
    }

    async fn embed_item(&self, organization_id: Uuid, dictionary_id: Uuid) -> Result<()> {
        let entry = self
            .dictionary
            .get(dictionary_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dictionary entry {}", dictionary_id)))?;
        if entry.organization_id != organization_id {
            return Err(Error::InvalidInput(format!(
                "dictionary entry {} belongs to another organization",
                dictionary_id
            )));
        }

        let vector = self
            .embedder
            .embed_texts(std::slice::from_ref(&entry.phrase))
            .await?
            .pop()
            .ok_or_else(|| Error::Embedding("provider returned no vector".to_string()))?;

        self.dictionary
            .store_embedding(dictionary_id, vector, self.embedder.model_name())
            .await
    }

    async fn run_job(self: Arc<Self>, job_id: Uuid, organization_id: Uuid, ids: Vec<Uuid>) {
        self.mark_started(job_id).await;

        let concurrency = self.config.item_concurrency.max(1);
        let mut results = stream::iter(ids)
            .map(|dictionary_id| {
                let inner = self.clone();
                async move {
                    let result = inner.embed_item(organization_id, dictionary_id).await;
                    (dictionary_id, result)
                }
            })
            .buffer_unordered(concurrency);

        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => {
                    warn!(
                        subsystem = "jobs",
                        component = "embedding_queue",
                        job_id = %job_id,
                        "Embedding job interrupted by shutdown"
                    );
                    return;
                }
                next = results.next() => next,
            };

            let Some((dictionary_id, result)) = next else {
                break;
            };

            match &result {
                Ok(()) => trace!(
                    subsystem = "jobs",
                    component = "embedding_queue",
                    job_id = %job_id,
                    dictionary_id = %dictionary_id,
                    "Embedding item stored"
                ),
                Err(e) => warn!(
                    subsystem = "jobs",
                    component = "embedding_queue",
                    job_id = %job_id,
                    dictionary_id = %dictionary_id,
                    error = %e,
                    "Embedding item failed"
                ),
            }
            self.record(job_id, dictionary_id, result.is_ok()).await;
        }
    }

    async fn publish_all(
        self: Arc<Self>,
        managed: Arc<dyn ManagedQueue>,
        job_id: Uuid,
        organization_id: Uuid,
        ids: Vec<Uuid>,
    ) {
        self.mark_started(job_id).await;

        for dictionary_id in ids {
            if self.stop.is_cancelled() {
                return;
            }
            let task = EmbeddingTask {
                job_id,
                organization_id,
                dictionary_id,
            };
            if let Err(e) = managed.publish(&task).await {
                warn!(
                    subsystem = "jobs",
                    component = "embedding_queue",
                    job_id = %job_id,
                    dictionary_id = %dictionary_id,
                    error = %e,
                    "Failed to publish embedding task, counting item as failed"
                );
                self.record(job_id, dictionary_id, false).await;
            }
        }
    }
}
