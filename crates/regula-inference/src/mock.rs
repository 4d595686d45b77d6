//! Mock provider backends for deterministic testing.
//!
//! ```rust,ignore
//! use regula_inference::mock::{MockEmbeddingBackend, MockScanBackend};
//!
//! let embedder = MockEmbeddingBackend::new(8).fail_on("bad phrase");
//! let scanner = MockScanBackend::new().fail_times(check_id, 2);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use regula_core::{EmbeddingBackend, Error, Result, ScanBackend, ScanOutcome, ScanRequest, Vector};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic vector for a text: same input, same vector.
pub fn deterministic_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut reader = blake3::Hasher::new().update(text.as_bytes()).finalize_xof();
    let mut buf = [0u8; 4];
    (0..dimension)
        .map(|_| {
            reader.fill(&mut buf);
            (u32::from_le_bytes(buf) as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
        })
        .collect()
}

/// Embedding backend producing deterministic vectors.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    dimension: usize,
    failing: Arc<HashSet<String>>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockEmbeddingBackend {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failing: Arc::new(HashSet::new()),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail any batch containing this exact text.
    pub fn fail_on(mut self, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.failing).insert(text.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `embed_texts` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(bad) = texts.iter().find(|t| self.failing.contains(*t)) {
            return Err(Error::Embedding(format!("simulated failure for {:?}", bad)));
        }
        Ok(texts
            .iter()
            .map(|t| Vector::from(deterministic_vector(t, self.dimension)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

#[derive(Default)]
struct ScanState {
    /// Remaining simulated failures per check; `None` means fail forever.
    failures: HashMap<Uuid, Option<u32>>,
    outcomes: HashMap<Uuid, ScanOutcome>,
    /// Check ids in the order their attempts started.
    calls: Vec<Uuid>,
}

/// Scan backend with scripted failures and in-flight accounting.
#[derive(Clone, Default)]
pub struct MockScanBackend {
    state: Arc<Mutex<ScanState>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockScanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time each scan takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `times` attempts for `check_id`.
    pub fn fail_times(self, check_id: Uuid, times: u32) -> Self {
        lock(&self.state).failures.insert(check_id, Some(times));
        self
    }

    /// Fail every attempt for `check_id`.
    pub fn fail_always(self, check_id: Uuid) -> Self {
        lock(&self.state).failures.insert(check_id, None);
        self
    }

    /// Return `outcome` for `check_id` instead of the default clean result.
    pub fn with_outcome(self, check_id: Uuid, outcome: ScanOutcome) -> Self {
        lock(&self.state).outcomes.insert(check_id, outcome);
        self
    }

    /// Check ids in attempt order (retries appear again).
    pub fn calls(&self) -> Vec<Uuid> {
        lock(&self.state).calls.clone()
    }

    pub fn attempts_for(&self, check_id: Uuid) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|id| **id == check_id)
            .count()
    }

    /// Highest number of scans observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn clean_outcome() -> ScanOutcome {
        ScanOutcome {
            extracted_text: None,
            ocr_status: None,
            result: serde_json::json!({"compliant": true}),
            violations: vec![],
        }
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScanBackend for MockScanBackend {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let should_fail = {
            let mut state = lock(&self.state);
            state.calls.push(request.check_id);
            match state.failures.get_mut(&request.check_id) {
                Some(None) => true,
                Some(Some(0)) | None => false,
                Some(Some(remaining)) => {
                    *remaining -= 1;
                    true
                }
            }
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if should_fail {
            return Err(Error::Scan(format!(
                "simulated failure for {}",
                request.check_id
            )));
        }

        Ok(lock(&self.state)
            .outcomes
            .get(&request.check_id)
            .cloned()
            .unwrap_or_else(Self::clean_outcome))
    }
}
