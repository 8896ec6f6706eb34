//! Run loop: namespace × kind × path, aggregate then compare then render.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kubediff_aggregate::{Aggregator, SourceSet};
use kubediff_core::{Comparator, ConfigError, DiffMode, Path, ResourceKind};
use kubediff_kubehub::KubeSource;
use tracing::info;

use crate::render::{self, Section};
use crate::{Cli, Commands, CommonArgs, Output};

/// Validated settings for one invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub contexts: Vec<String>,
    /// `""` means all namespaces.
    pub namespaces: Vec<String>,
    pub labels: Vec<String>,
    pub kinds: Vec<ResourceKind>,
    pub paths: Vec<Path>,
    pub mode: DiffMode,
    pub ignore_non_existent: bool,
    pub kubeconfig: Option<PathBuf>,
    pub deadline: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub output: Output,
}

impl TryFrom<Cli> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let (common, mode, kinds, raw_paths) = match cli.command {
            Some(Commands::Images { common, ignore_container_registry }) => {
                (common, DiffMode::Images { strip_registry: ignore_container_registry }, ResourceKind::WORKLOADS.to_vec(), None)
            }
            Some(Commands::Envs { common, ignore_env }) => {
                let ignore: BTreeSet<String> = ignore_env.into_iter().filter(|s| !s.is_empty()).collect();
                (common, DiffMode::Envs { ignore }, ResourceKind::WORKLOADS.to_vec(), None)
            }
            None => {
                let kinds = cli
                    .resources
                    .iter()
                    .filter(|r| !r.trim().is_empty())
                    .map(|r| r.parse::<ResourceKind>())
                    .collect::<Result<Vec<_>, _>>()?;
                let path = cli.path.ok_or_else(|| anyhow!("--path is required"))?;
                (cli.common, DiffMode::Generic, kinds, Some(vec![path]))
            }
        };
        let paths = match raw_paths {
            Some(raw) => raw,
            None => mode.fixed_paths().unwrap_or_default().iter().map(|p| p.to_string()).collect(),
        };
        Self::build(common, mode, kinds, &paths)
    }
}

impl RunConfig {
    fn build(common: CommonArgs, mode: DiffMode, kinds: Vec<ResourceKind>, paths: &[String]) -> Result<Self> {
        let contexts: Vec<String> = common.contexts.into_iter().filter(|c| !c.is_empty()).collect();
        if contexts.len() < 2 {
            return Err(ConfigError::TooFewSources(contexts.len()).into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = contexts.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(ConfigError::DuplicateSource(dup.clone()).into());
        }
        if kinds.is_empty() {
            return Err(ConfigError::NoResources.into());
        }
        let paths = paths
            .iter()
            .map(|p| Path::parse(p).map_err(ConfigError::from))
            .collect::<Result<Vec<_>, _>>()?;
        kubediff_kubehub::check_paths(&kinds, &paths)?;
        let namespaces = if common.namespaces.is_empty() { vec![String::new()] } else { common.namespaces };
        Ok(Self {
            contexts,
            namespaces,
            labels: common.labels,
            kinds,
            paths,
            mode,
            ignore_non_existent: common.ignore_non_existent,
            kubeconfig: common.kubeconfig,
            deadline: common.timeout_secs.map(Duration::from_secs),
            request_timeout: common.request_timeout_secs.map(Duration::from_secs),
            output: common.output,
        })
    }
}

/// Connect to every context and run the comparison, writing to stdout.
pub async fn run(cfg: RunConfig) -> Result<usize> {
    let kubeconfig = cfg
        .kubeconfig
        .clone()
        .or_else(kubediff_kubehub::default_kubeconfig)
        .ok_or_else(|| anyhow!("kubeconfig not set (use --kubeconfig or $KUBECONFIG)"))?;
    let sources = kubediff_kubehub::connect_all(&kubeconfig, &cfg.contexts, cfg.request_timeout).await?;
    let set = SourceSet::new(sources.into_iter().map(KubeSource::into_source).collect())?;
    let aggregator = Aggregator::new(set).with_deadline(cfg.deadline);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(&aggregator, &cfg, &mut out).await
}

/// Returns the number of (section, resource) pairs with drift.
pub async fn execute<W: Write>(aggregator: &Aggregator, cfg: &RunConfig, out: &mut W) -> Result<usize> {
    let order = aggregator.sources().ids();
    let comparator = Comparator::new(cfg.mode.clone()).ignore_non_existent(cfg.ignore_non_existent);
    let mut drifting = 0usize;
    let mut sections = Vec::new();

    for namespace in &cfg.namespaces {
        for kind in &cfg.kinds {
            for path in &cfg.paths {
                info!(ns = %namespace, resource = %kind, path = %path, "Finding differences ...");
                let table = aggregator.aggregate(*kind, namespace, &cfg.labels, path).await?;
                let report = comparator.compare(&table, &order);
                drifting += report.len();
                let section = Section {
                    namespace: namespace.clone(),
                    kind: *kind,
                    path: path.to_string(),
                    contexts: order.clone(),
                    differences: report,
                };
                match cfg.output {
                    Output::Human => render::human(out, &cfg.mode, &section, &table).context("writing report")?,
                    Output::Json => sections.push(section),
                }
            }
        }
    }

    if cfg.output == Output::Json {
        serde_json::to_writer_pretty(&mut *out, &sections).context("serializing report")?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(drifting)
}
