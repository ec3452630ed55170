//! Tests for the scan orchestrator.
//!
//! Runs full batches against an in-memory image service whose "mount"
//! copies a fixture tree into the target. The fake counts concurrently
//! mounted roots so admission control can be observed.

use async_trait::async_trait;
use binscan::error::{Error, Result};
use binscan::identity::ChainId;
use binscan::matcher::{LiteralSet, MatchPredicate, MatchRule, RegexCache, RegexPredicate, TemplatePredicate};
use binscan::mount::Mount;
use binscan::platform::Platform;
use binscan::registry::PullOptions;
use binscan::snapshot::native::copy_tree;
use binscan::{ImageHandle, ImageService, Orchestrator, Renderer, ScanResult, Status};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fake Image Service
// =============================================================================

struct FakeService {
    /// reference -> fixture root
    images: HashMap<String, PathBuf>,
    views: Mutex<HashMap<String, PathBuf>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    fail_mount: HashSet<String>,
    mount_delay: Duration,
}

impl FakeService {
    fn new(images: HashMap<String, PathBuf>) -> Self {
        Self {
            images,
            views: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_mount: HashSet::new(),
            mount_delay: Duration::from_millis(30),
        }
    }

    fn diff_id(reference: &str) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(reference.as_bytes())))
    }

    fn live_views(&self) -> usize {
        self.views.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageService for FakeService {
    fn snapshotter(&self) -> &str {
        "fake"
    }

    async fn ensure_namespace(&self) -> Result<()> {
        Ok(())
    }

    async fn pull(&self, reference: &str, _opts: &PullOptions) -> Result<ImageHandle> {
        if !self.images.contains_key(reference) {
            return Err(Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: Self::diff_id(reference),
            diff_ids: vec![Self::diff_id(reference)],
        })
    }

    async fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>> {
        let source = self
            .images
            .iter()
            .find(|(reference, _)| ChainId::from_diff_ids(&[Self::diff_id(reference)]).unwrap() == *parent)
            .map(|(_, root)| root.clone())
            .ok_or_else(|| Error::SnapshotNotFound {
                key: parent.to_string(),
            })?;

        let mut views = self.views.lock().unwrap();
        if views.contains_key(key) {
            return Err(Error::SnapshotAlreadyExists { key: key.to_string() });
        }
        views.insert(key.to_string(), source.clone());
        Ok(vec![Mount::read_only_bind(&source)])
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let views = self.views.lock().unwrap();
        let source = views.get(key).ok_or_else(|| Error::SnapshotNotFound { key: key.to_string() })?;
        Ok(vec![Mount::read_only_bind(source)])
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.views.lock().unwrap().remove(key);
        Ok(())
    }

    async fn mount(&self, mounts: &[Mount], target: &Path) -> Result<()> {
        let source = PathBuf::from(&mounts[0].source);
        if self
            .fail_mount
            .iter()
            .any(|r| self.images.get(r) == Some(&source))
        {
            return Err(Error::MountFailed {
                target: target.to_path_buf(),
                reason: "permission denied".to_string(),
            });
        }

        copy_tree(&source, target)?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.mount_delay).await;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        for entry in std::fs::read_dir(target)? {
            let path = entry?.path();
            if path.is_dir() && !path.is_symlink() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Builds a small root filesystem containing `bins` under `/bin`.
fn fixture(dir: &Path, name: &str, bins: &[&str]) -> PathBuf {
    let root = dir.join(name);
    std::fs::create_dir_all(root.join("bin")).unwrap();
    std::fs::create_dir_all(root.join("etc")).unwrap();
    std::fs::write(root.join("etc/os-release"), name).unwrap();
    for bin in bins {
        std::fs::write(root.join("bin").join(bin), format!("#!{}", bin)).unwrap();
    }
    root
}

fn pull_opts() -> PullOptions {
    PullOptions {
        platform: Platform::host(),
        resolver: Default::default(),
    }
}

struct Harness {
    _fixtures: TempDir,
    scratch: TempDir,
    service: Arc<FakeService>,
}

impl Harness {
    fn new(images: &[(&str, &[&str])]) -> Self {
        let fixtures = TempDir::new().unwrap();
        let map = images
            .iter()
            .enumerate()
            .map(|(i, (reference, bins))| {
                (reference.to_string(), fixture(fixtures.path(), &format!("img{}", i), bins))
            })
            .collect();
        Self {
            _fixtures: fixtures,
            scratch: TempDir::new().unwrap(),
            service: Arc::new(FakeService::new(map)),
        }
    }

    fn orchestrator(&self, rule: MatchRule, workers: usize) -> Orchestrator {
        Orchestrator::new(
            self.service.clone(),
            Arc::new(rule) as Arc<dyn MatchPredicate>,
            Arc::new(Renderer::new("{{ result }}").unwrap()),
            pull_opts(),
            self.scratch.path().to_path_buf(),
            workers,
            CancellationToken::new(),
        )
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }
}

async fn collect(orchestrator: &Orchestrator, refs: &[&str]) -> HashMap<String, (Status, Vec<String>, String)> {
    let refs: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
    let mut out = HashMap::new();
    orchestrator
        .run_all(&refs, |result: &ScanResult, line: &str| {
            out.insert(
                result.reference.clone(),
                (result.status(), result.found.clone(), line.to_string()),
            );
        })
        .await;
    out
}

fn regex(pattern: &str) -> MatchRule {
    MatchRule::Regex(RegexPredicate::new(pattern, &RegexCache::new()).unwrap())
}

// =============================================================================
// Admission Control
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mounts_bounded_by_workers() {
    const SH: &[&str] = &["sh"];
    let names: Vec<String> = (0..5).map(|i| format!("image-{}", i)).collect();
    let images: Vec<(&str, &[&str])> = names.iter().map(|r| (r.as_str(), SH)).collect();
    let harness = Harness::new(&images);
    let orchestrator = harness.orchestrator(regex("bin/sh$"), 2);

    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let results = collect(&orchestrator, &refs).await;

    assert_eq!(results.len(), 5);
    for (status, found, _) in results.values() {
        assert_eq!(*status, Status::Match);
        assert_eq!(found, &vec!["/bin/sh".to_string()]);
    }
    let peak = harness.service.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrent mounts was {}", peak);
    assert!(peak >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_serializes() {
    let harness = Harness::new(&[("a", &["sh"]), ("b", &["ls"]), ("c", &["bash"])]);
    let orchestrator = harness.orchestrator(regex("bin/(sh|bash)$"), 1);

    let results = collect(&orchestrator, &["a", "b", "c"]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(harness.service.peak.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Failure Isolation and Cleanup
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_outcomes_leave_nothing_behind() {
    let mut harness = Harness::new(&[("good", &["sh", "ls"]), ("clean", &["ls"]), ("broken", &["sh"])]);
    Arc::get_mut(&mut harness.service)
        .unwrap()
        .fail_mount
        .insert("broken".to_string());
    let orchestrator = harness.orchestrator(regex("bin/sh$"), 2);

    let results = collect(&orchestrator, &["good", "clean", "broken", "missing"]).await;

    assert_eq!(results["good"].0, Status::Match);
    assert_eq!(results["good"].2, r#"good MATCH ["/bin/sh"]"#);
    assert_eq!(results["clean"].0, Status::None);
    assert_eq!(results["clean"].2, "clean NONE []");
    assert_eq!(results["broken"].0, Status::Error);
    assert!(results["broken"].2.contains("permission denied"));
    assert_eq!(results["missing"].0, Status::Error);
    assert!(results["missing"].2.starts_with("missing ERROR {\"error\":"));

    assert_eq!(harness.scratch_entries(), 0, "mount targets left behind");
    assert_eq!(harness.service.live_views(), 0, "snapshots left behind");
    assert_eq!(harness.service.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_bool_template_errors_only_affected_reference() {
    let harness = Harness::new(&[("odd", &["weird", "sh"]), ("plain", &["sh"]), ("none", &["ls"])]);
    let rule = MatchRule::Template(
        TemplatePredicate::new(
            r#"{% if path == "/bin/weird" %}maybe{% else %}{{ path == "/bin/sh" }}{% endif %}"#,
            Arc::new(RegexCache::new()),
            None,
        )
        .unwrap(),
    );
    let orchestrator = harness.orchestrator(rule, 3);

    let results = collect(&orchestrator, &["odd", "plain", "none"]).await;

    assert_eq!(results["odd"].0, Status::Error);
    assert!(results["odd"].2.contains("/bin/weird"));
    assert_eq!(results["plain"].0, Status::Match);
    assert_eq!(results["none"].0, Status::None);
    assert_eq!(harness.scratch_entries(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_literal_rule_with_roots() {
    let harness = Harness::new(&[("alpine", &["sh", "busybox"])]);
    let rule = MatchRule::Literal(LiteralSet::new(["sh", "curl"], ["/bin"]));
    let orchestrator = harness.orchestrator(rule, 1);

    let results = collect(&orchestrator, &["alpine"]).await;
    assert_eq!(results["alpine"].1, vec!["/bin/sh"]);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_run_reports_every_reference() {
    let harness = Harness::new(&[("a", &["sh"]), ("b", &["sh"])]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = Orchestrator::new(
        harness.service.clone(),
        Arc::new(regex("sh$")),
        Arc::new(Renderer::new("{{ ref }} {{ status }}").unwrap()),
        pull_opts(),
        harness.scratch.path().to_path_buf(),
        1,
        cancel,
    );

    let results = collect(&orchestrator, &["a", "b"]).await;
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|(status, _, _)| *status == Status::Error));
    assert_eq!(results["a"].2, "a ERROR");
    assert_eq!(harness.scratch_entries(), 0);
}

#[tokio::test]
async fn test_summary_counts() {
    let harness = Harness::new(&[("x", &["sh"]), ("y", &["ls"])]);
    let orchestrator = harness.orchestrator(regex("bin/sh$"), 2);

    let refs = vec!["x".to_string(), "y".to_string(), "z".to_string()];
    let summary = orchestrator.run_all(&refs, |_, _| {}).await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.errors, 1);
}
