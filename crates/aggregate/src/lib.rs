//! kubediff aggregation: query every context concurrently and fold the
//! extracted values into one [`AggregationTable`].
//!
//! One task is spawned per context. Tasks share a single mutex-protected table
//! that is locked only while a record's values are appended, never across a
//! fetch. The first failing task cancels its siblings and the whole phase
//! returns that error; no partial table ever escapes.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kubediff_core::{resolve, AggregationTable, ConfigError, Path, ResolveError, ResourceKind};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `(metadata.name, object)` as returned by a source.
pub type NamedRecord = (String, Value);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("resource {0} not supported")]
    UnsupportedKind(ResourceKind),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Lists the objects of one kind from one environment.
///
/// Implementations return records in source-defined order and may fail; an
/// error aborts the whole run.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn list(&self, kind: ResourceKind, namespace: &str, labels: &[String]) -> Result<Vec<NamedRecord>, FetchError>;
}

/// A named context plus the handle used to list its objects.
#[derive(Clone)]
pub struct Source {
    pub id: String,
    pub fetcher: Arc<dyn SourceFetcher>,
}

impl Source {
    pub fn new(id: impl Into<String>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { id: id.into(), fetcher }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Validated, ordered set of at least two distinct sources.
#[derive(Debug, Clone)]
pub struct SourceSet {
    sources: Vec<Source>,
}

impl SourceSet {
    pub fn new(sources: Vec<Source>) -> Result<Self, ConfigError> {
        if sources.len() < 2 {
            return Err(ConfigError::TooFewSources(sources.len()));
        }
        let mut seen = HashSet::new();
        for s in &sources {
            if !seen.insert(s.id.as_str()) {
                return Err(ConfigError::DuplicateSource(s.id.clone()));
            }
        }
        Ok(Self { sources })
    }

    /// Ids in configured order; this is the comparison order.
    pub fn ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listing {kind} from context {context} in namespace '{namespace}'")]
    Fetch {
        namespace: String,
        context: String,
        kind: ResourceKind,
        #[source]
        cause: FetchError,
    },
    #[error("failed to get value for path {path} on {kind} {resource} from context {context} in namespace '{namespace}'")]
    Resolve {
        namespace: String,
        context: String,
        kind: ResourceKind,
        resource: String,
        path: String,
        #[source]
        cause: ResolveError,
    },
    #[error("aggregating {kind} in namespace '{namespace}' exceeded {limit:?}")]
    DeadlineExceeded {
        namespace: String,
        kind: ResourceKind,
        limit: Duration,
    },
    #[error("aggregation task panicked")]
    TaskPanicked(#[source] tokio::task::JoinError),
}

/// Runs one fetch task per source and merges the resolved values.
#[derive(Debug, Clone)]
pub struct Aggregator {
    sources: SourceSet,
    deadline: Option<Duration>,
}

impl Aggregator {
    pub fn new(sources: SourceSet) -> Self {
        Self { sources, deadline: None }
    }

    /// Bound the whole phase; expiry aborts outstanding fetches.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    pub async fn aggregate(
        &self,
        kind: ResourceKind,
        namespace: &str,
        labels: &[String],
        path: &Path,
    ) -> Result<AggregationTable, AggregateError> {
        let t0 = Instant::now();
        let table = Arc::new(Mutex::new(AggregationTable::new()));
        let token = CancellationToken::new();
        let path = Arc::new(path.clone());
        let labels: Arc<[String]> = labels.into();

        let mut tasks: JoinSet<Result<(), AggregateError>> = JoinSet::new();
        for source in self.sources.iter() {
            let job = FetchJob {
                source: source.clone(),
                kind,
                namespace: namespace.to_string(),
                labels: Arc::clone(&labels),
                path: Arc::clone(&path),
                table: Arc::clone(&table),
                token: token.clone(),
            };
            tasks.spawn(job.run());
        }

        let joined = match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, drain(&mut tasks, &token)).await {
                Ok(res) => res,
                Err(_) => Err(AggregateError::DeadlineExceeded { namespace: namespace.to_string(), kind, limit }),
            },
            None => drain(&mut tasks, &token).await,
        };
        if let Err(e) = joined {
            warn!(ns = %namespace, %kind, error = %e, "aggregation aborted; cancelling remaining fetches");
            token.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(e);
        }

        let out = std::mem::take(&mut *lock(&table));
        info!(ns = %namespace, %kind, resources = out.len(), elapsed_ms = t0.elapsed().as_millis() as u64, "aggregation complete");
        Ok(out)
    }
}

/// Join every task; the first failure cancels the rest.
async fn drain(tasks: &mut JoinSet<Result<(), AggregateError>>, token: &CancellationToken) -> Result<(), AggregateError> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                token.cancel();
                return Err(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                token.cancel();
                return Err(AggregateError::TaskPanicked(e));
            }
        }
    }
    Ok(())
}

fn lock(table: &Mutex<AggregationTable>) -> MutexGuard<'_, AggregationTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FetchJob {
    source: Source,
    kind: ResourceKind,
    namespace: String,
    labels: Arc<[String]>,
    path: Arc<Path>,
    table: Arc<Mutex<AggregationTable>>,
    token: CancellationToken,
}

impl FetchJob {
    async fn run(self) -> Result<(), AggregateError> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let fetched = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!(context = %self.source.id, kind = %self.kind, "cancelled during fetch");
                return Ok(());
            }
            res = self.source.fetcher.list(self.kind, &self.namespace, &self.labels) => res,
        };
        let records = fetched.map_err(|cause| match cause {
            FetchError::UnsupportedKind(kind) => AggregateError::Config(ConfigError::UnsupportedKind(kind.to_string())),
            cause => AggregateError::Fetch {
                namespace: self.namespace.clone(),
                context: self.source.id.clone(),
                kind: self.kind,
                cause,
            },
        })?;
        debug!(context = %self.source.id, kind = %self.kind, count = records.len(), "fetched");
        let ingested = self.ingest(records)?;
        debug!(context = %self.source.id, kind = %self.kind, ingested, "merged");
        Ok(())
    }

    /// Resolve and append records in order. Stops, without error, at the
    /// first record seen after cancellation; returns how many were merged.
    fn ingest(&self, records: Vec<NamedRecord>) -> Result<usize, AggregateError> {
        let mut merged = 0;
        for (name, record) in records {
            if self.token.is_cancelled() {
                debug!(context = %self.source.id, kind = %self.kind, merged, "cancelled while merging");
                break;
            }
            let values = resolve(&record, &self.path).map_err(|cause| AggregateError::Resolve {
                namespace: self.namespace.clone(),
                context: self.source.id.clone(),
                kind: self.kind,
                resource: name.clone(),
                path: self.path.to_string(),
                cause,
            })?;
            let mut table = lock(&self.table);
            table.touch(&name, &self.source.id);
            for v in values.into_values() {
                table.append(&name, &self.source.id, v);
            }
            merged += 1;
        }
        Ok(merged)
    }
}
