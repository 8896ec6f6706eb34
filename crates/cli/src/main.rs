use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::info;

mod render;
mod run;

use run::RunConfig;

#[derive(Parser, Debug)]
#[command(
    name = "kubediff",
    version,
    about = "Detect differences between Kubernetes resources across contexts",
    long_about = "kubediff detects differences between same-named Kubernetes resources in different \
                  clusters, using a dot path to identify the field to compare.",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Dot path to the field to compare, e.g. Spec.Template.Spec.Containers[*].Env
    #[arg(short = 'p', long = "path", required = true)]
    path: Option<String>,

    /// Resource kinds to scan (deployment|deploy, daemonset|ds, statefulset|sts, configmap|cm)
    #[arg(short = 'r', long = "resources", value_delimiter = ',', required = true)]
    resources: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Contexts to compare (at least two)
    #[arg(short = 'c', long = "contexts", value_delimiter = ',', required = true)]
    contexts: Vec<String>,

    /// Namespaces to scan (default: all namespaces)
    #[arg(short = 'n', long = "namespaces", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Label filters, e.g. app=api,tier=web
    #[arg(short = 'l', long = "labels", value_delimiter = ',')]
    labels: Vec<String>,

    /// Path to the kubeconfig file (default: $KUBECONFIG or $HOME/.kube/config)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// Skip the comparison when a resource does not exist in one of the contexts
    #[arg(long = "ignore-non-existent", action = ArgAction::SetTrue)]
    ignore_non_existent: bool,

    /// Abort a fetch phase that takes longer than this many seconds
    #[arg(long = "timeout", env = "KUBEDIFF_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Per-request timeout for list calls, in seconds
    #[arg(long = "request-timeout")]
    request_timeout_secs: Option<u64>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect different image tags between Kubernetes clusters
    Images {
        #[command(flatten)]
        common: CommonArgs,
        /// Ignore the container registry in image references
        #[arg(long = "ignore-container-registry", action = ArgAction::SetTrue)]
        ignore_container_registry: bool,
    },
    /// Detect different env var values between Kubernetes clusters
    Envs {
        #[command(flatten)]
        common: CommonArgs,
        /// Env vars to ignore when comparing values
        #[arg(short = 'i', long = "ignore-env", value_delimiter = ',')]
        ignore_env: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBEDIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = RunConfig::try_from(cli)?;
    info!(contexts = ?cfg.contexts, mode = ?cfg.mode, "kubediff invoked");
    let drifting = run::run(cfg).await?;
    info!(drifting, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunConfig> {
        let cli = Cli::try_parse_from(args)?;
        RunConfig::try_from(cli)
    }

    #[test]
    fn generic_mode_requires_path_and_resources() {
        assert!(Cli::try_parse_from(["kubediff", "-c", "a,b"]).is_err());
        assert!(Cli::try_parse_from(["kubediff", "-c", "a,b", "-p", "Spec.Replicas"]).is_err());
        let cfg = parse(&["kubediff", "-c", "a,b", "-p", "Spec.Replicas", "-r", "deploy,sts"]).unwrap();
        assert_eq!(cfg.contexts, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.kinds, vec![kubediff_core::ResourceKind::Deployment, kubediff_core::ResourceKind::StatefulSet]);
        assert_eq!(cfg.namespaces, vec![String::new()]);
        assert_eq!(cfg.paths.len(), 1);
    }

    #[test]
    fn images_subcommand_does_not_need_path() {
        let cfg = parse(&["kubediff", "images", "--contexts", "dev,prod", "--ignore-container-registry", "-n", "a,b"]).unwrap();
        assert_eq!(cfg.mode, kubediff_core::DiffMode::Images { strip_registry: true });
        assert_eq!(cfg.paths.len(), 2);
        assert_eq!(cfg.kinds.len(), 3);
        assert_eq!(cfg.namespaces, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn envs_subcommand_collects_ignore_list() {
        let cfg = parse(&["kubediff", "envs", "-c", "dev,prod", "-i", "POD_IP,HOSTNAME", "--ignore-non-existent", "-o", "json"]).unwrap();
        match &cfg.mode {
            kubediff_core::DiffMode::Envs { ignore } => {
                assert!(ignore.contains("POD_IP") && ignore.contains("HOSTNAME"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert!(cfg.ignore_non_existent);
        assert_eq!(cfg.output, Output::Json);
    }

    #[test]
    fn configuration_errors_surface_before_any_fetch() {
        let err = parse(&["kubediff", "images", "-c", "dev"]).unwrap_err();
        assert!(err.to_string().contains("at least two contexts"), "{}", err);
        let err = parse(&["kubediff", "-c", "a,b", "-p", "Spec.Replicas", "-r", "secret"]).unwrap_err();
        assert!(err.to_string().contains("resource secret not supported"), "{}", err);
        let err = parse(&["kubediff", "-c", "a,b", "-p", "Spec..Replicas", "-r", "deploy"]).unwrap_err();
        assert!(err.to_string().contains("empty segment"), "{}", err);
        let err = parse(&["kubediff", "envs", "-c", "a,a"]).unwrap_err();
        assert!(err.to_string().contains("more than once"), "{}", err);
    }

    #[test]
    fn misspelled_path_fails_before_any_fetch() {
        let err = parse(&["kubediff", "-c", "dev,prod", "-p", "Spec.Replicaz", "-r", "deploy"]).unwrap_err();
        assert!(err.to_string().contains("field 'Replicaz' not found"), "{}", err);
        let err = parse(&["kubediff", "-c", "dev,prod", "-p", "Spec.Replicas", "-r", "deploy,cm"]).unwrap_err();
        assert!(err.to_string().contains("does not exist on configmap"), "{}", err);
        parse(&["kubediff", "-c", "dev,prod", "-p", "Labels", "-r", "deploy,cm"]).unwrap();
    }
}
