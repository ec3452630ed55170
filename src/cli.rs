//! Command line interface.
//!
//! Options with an environment fallback read it only when the flag is not
//! given. The matcher is chosen by precedence: `--match`, then
//! `--target-bins`, then `--pattern`.

use crate::config::{RuleConfig, ScanConfig};
use crate::constants::{
    DEFAULT_CONTAINERD_ADDRESS, DEFAULT_FORMAT, DEFAULT_MATCH_PATTERN, DEFAULT_NAMESPACE, DEFAULT_ROOT_DIR,
    DEFAULT_TARGET_PATH, ENV_CONTAINERD_ADDRESS, ENV_CONTAINERD_NAMESPACE, ENV_OUTPUT_FORMAT, ENV_TARGET_BINS,
    ENV_TARGET_PATHS,
};
use crate::credentials::DockerConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::registry::{PullOptions, ResolverConfig};
use crate::store::StoreConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Audit container images for risky executables.
///
/// Each image is pulled, its root filesystem mounted read-only, and every
/// file tested against the match rule. One line is printed per image.
#[derive(Debug, Parser, Clone)]
#[command(name = "binscan", about, long_about, version)]
pub struct Cli {
    /// Image references to scan.
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<String>,

    /// containerd socket to use as storage backend; empty for embedded mode.
    #[arg(long = "containerd", env = ENV_CONTAINERD_ADDRESS, default_value = DEFAULT_CONTAINERD_ADDRESS)]
    pub address: String,

    /// Directory for images and mounts in embedded mode [default: $HOME/binscan].
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Namespace for image content.
    #[arg(long, env = ENV_CONTAINERD_NAMESPACE, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Number of images to work on at once [default: logical CPU count].
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Output template for each result.
    #[arg(long, env = ENV_OUTPUT_FORMAT, default_value = DEFAULT_FORMAT)]
    pub format: String,

    /// Platform to pull images for (os/arch[/variant]) [default: host].
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Allow plain HTTP for registry requests.
    #[arg(long)]
    pub plain_http: bool,

    /// Regular expression matched against file paths.
    #[arg(long, default_value = DEFAULT_MATCH_PATTERN)]
    pub pattern: String,

    /// Predicate template deciding whether a file matches; must render a bool.
    #[arg(long = "match", value_name = "TEMPLATE")]
    pub match_template: Option<String>,

    /// Comma separated roots searched for --target-bins.
    #[arg(long, env = ENV_TARGET_PATHS, value_delimiter = ',')]
    pub target_paths: Vec<String>,

    /// Comma separated binary names to look for.
    #[arg(long, env = ENV_TARGET_BINS, value_delimiter = ',')]
    pub target_bins: Vec<String>,

    /// Allow predicate templates to run judge processes via exec().
    #[arg(long)]
    pub allow_exec: bool,

    /// Directory where image roots are mounted [default: system temp dir].
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,
}

impl Cli {
    /// Resolves defaults and builds the validated run configuration.
    pub fn into_config(self) -> Result<ScanConfig> {
        let root = match self.root {
            Some(root) => root,
            None => dirs::home_dir()
                .map(|home| home.join(DEFAULT_ROOT_DIR))
                .unwrap_or_default(),
        };

        let workers = match self.workers {
            Some(n) => n,
            None => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };

        let rule = if let Some(template) = self.match_template {
            RuleConfig::Template(template)
        } else if self.target_bins.iter().any(|b| !b.trim().is_empty()) {
            let mut roots = self.target_paths;
            if roots.is_empty() {
                roots.push(DEFAULT_TARGET_PATH.to_string());
            }
            RuleConfig::Literal {
                names: self.target_bins,
                roots,
            }
        } else {
            RuleConfig::Regex(self.pattern)
        };

        let credentials = DockerConfig::load_default()
            .map_err(|e| Error::InvalidConfig(format!("error loading registry credentials: {}", e)))?;

        let config = ScanConfig {
            store: StoreConfig {
                address: self.address,
                root,
                namespace: self.namespace,
            },
            workers,
            pull: PullOptions {
                platform: self.platform.unwrap_or_else(Platform::host),
                resolver: ResolverConfig {
                    plain_http: self.plain_http,
                    credentials: Arc::new(credentials),
                },
            },
            format: self.format,
            rule,
            allow_exec: self.allow_exec,
            scratch: self.tmp_dir.unwrap_or_else(std::env::temp_dir),
            references: self.images,
        };
        config.validate()?;
        Ok(config)
    }
}
