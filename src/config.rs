//! Immutable run configuration.
//!
//! A [`ScanConfig`] is assembled once from the command line (see
//! [`crate::cli`]), validated, and then passed by reference to store
//! bootstrap, the orchestrator and the matcher. Nothing reads configuration
//! from globals after startup.

use crate::error::{Error, Result};
use crate::matcher::{JudgeConfig, LiteralSet, MatchRule, RegexCache, RegexPredicate, TemplatePredicate};
use crate::registry::PullOptions;
use crate::store::StoreConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How paths are matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleConfig {
    /// Predicate template that renders a boolean.
    Template(String),
    /// Basename set restricted to root prefixes.
    Literal { names: Vec<String>, roots: Vec<String> },
    /// Regular expression over the full path.
    Regex(String),
}

/// Everything a run needs, fixed at startup.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub store: StoreConfig,
    /// Maximum images processed at once.
    pub workers: usize,
    pub pull: PullOptions,
    /// Output template.
    pub format: String,
    pub rule: RuleConfig,
    /// Registers the `exec()` judge helper in predicate templates.
    pub allow_exec: bool,
    /// Parent directory of per-task mount targets.
    pub scratch: PathBuf,
    pub references: Vec<String>,
}

impl ScanConfig {
    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.references.is_empty() {
            return Err(Error::InvalidConfig("requires at least 1 image reference".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig("--workers must be at least 1".to_string()));
        }
        if self.store.namespace.is_empty() {
            return Err(Error::InvalidConfig("namespace must not be empty".to_string()));
        }
        if self.store.address.is_empty() && self.store.root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "could not determine home dir for data storage; use containerd or specify --root".to_string(),
            ));
        }
        if let RuleConfig::Literal { names, .. } = &self.rule
            && names.iter().all(|n| n.trim().is_empty())
        {
            return Err(Error::InvalidConfig("--target-bins must name at least one binary".to_string()));
        }
        Ok(())
    }

    /// Compiles the configured rule. Pattern and template errors surface here,
    /// before any task starts.
    pub fn build_rule(&self, cache: Arc<RegexCache>, cancel: &CancellationToken) -> Result<MatchRule> {
        Ok(match &self.rule {
            RuleConfig::Template(source) => {
                let judge = self.allow_exec.then(|| JudgeConfig { cancel: cancel.clone() });
                MatchRule::Template(TemplatePredicate::new(source, cache, judge)?)
            }
            RuleConfig::Literal { names, roots } => MatchRule::Literal(LiteralSet::new(
                names.iter().map(|n| n.trim().to_string()),
                roots.iter().filter(|r| !r.trim().is_empty()),
            )),
            RuleConfig::Regex(pattern) => MatchRule::Regex(RegexPredicate::new(pattern, &cache)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rule: RuleConfig) -> ScanConfig {
        ScanConfig {
            store: StoreConfig {
                address: String::new(),
                root: PathBuf::from("/var/lib/binscan"),
                namespace: "binscan".to_string(),
            },
            workers: 2,
            pull: PullOptions {
                platform: "linux/amd64".parse().unwrap(),
                resolver: Default::default(),
            },
            format: "{{ result }}".to_string(),
            rule,
            allow_exec: false,
            scratch: std::env::temp_dir(),
            references: vec!["alpine".to_string()],
        }
    }

    #[test]
    fn test_validate() {
        assert!(config(RuleConfig::Regex("sh$".to_string())).validate().is_ok());

        let mut no_refs = config(RuleConfig::Regex("sh$".to_string()));
        no_refs.references.clear();
        assert!(matches!(no_refs.validate(), Err(Error::InvalidConfig(_))));

        let mut no_root = config(RuleConfig::Regex("sh$".to_string()));
        no_root.store.root = PathBuf::new();
        assert!(no_root.validate().is_err());
        no_root.store.address = "/run/containerd/containerd.sock".to_string();
        assert!(no_root.validate().is_ok());

        let empty_bins = config(RuleConfig::Literal {
            names: vec![" ".to_string()],
            roots: Vec::new(),
        });
        assert!(empty_bins.validate().is_err());
    }

    #[test]
    fn test_build_rule_errors_are_startup_errors() {
        let cache = Arc::new(RegexCache::new());
        let cancel = CancellationToken::new();

        let err = config(RuleConfig::Regex("(".to_string()))
            .build_rule(cache.clone(), &cancel)
            .unwrap_err();
        assert!(err.is_fatal_startup());

        let err = config(RuleConfig::Template("{% if %}".to_string()))
            .build_rule(cache, &cancel)
            .unwrap_err();
        assert!(err.is_fatal_startup());
    }
}
