//! # Scan Orchestrator
//!
//! Fans out over the input references with bounded parallelism. Each
//! reference runs acquire → manifest → match in its own task; a failure at
//! any stage is recorded on that reference's [`ScanResult`] and never
//! touches its siblings.
//!
//! ```text
//!   refs ──► JoinSet ──► [permit] ──► with_mounted_root ──► scan_root ──► ScanResult
//!                 │                                                          │
//!                 └──────────── join_next (completion order) ◄── render ◄────┘
//! ```
//!
//! [`Orchestrator::run_all`] returns only after every spawned task has
//! finished, so no mount outlives the run.

use crate::acquire;
use crate::error::Error;
use crate::matcher::MatchPredicate;
use crate::registry::PullOptions;
use crate::result::{Renderer, ScanResult, Status};
use crate::scan;
use crate::service::{ImageService, run_blocking};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Counts of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub matched: usize,
    pub errors: usize,
}

/// State shared by every task of a run.
struct TaskContext {
    service: Arc<dyn ImageService>,
    rule: Arc<dyn MatchPredicate>,
    pull: PullOptions,
    scratch: PathBuf,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Runs scans with at most `workers` images in flight.
pub struct Orchestrator {
    ctx: Arc<TaskContext>,
    renderer: Arc<Renderer>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn ImageService>,
        rule: Arc<dyn MatchPredicate>,
        renderer: Arc<Renderer>,
        pull: PullOptions,
        scratch: PathBuf,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(TaskContext {
                service,
                rule,
                pull,
                scratch,
                slots: Arc::new(Semaphore::new(workers.max(1))),
                cancel,
            }),
            renderer,
        }
    }

    /// Scans every reference and calls `emit` once per reference with the
    /// result and its rendered line, in completion order.
    pub async fn run_all<E>(&self, references: &[String], mut emit: E) -> RunSummary
    where
        E: FnMut(&ScanResult, &str),
    {
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();

        for reference in references {
            let ctx = Arc::clone(&self.ctx);
            let renderer = Arc::clone(&self.renderer);
            let span = info_span!("scan", reference = %reference);
            let owned = reference.clone();
            let handle = tasks.spawn(
                async move {
                    let result = scan_one(&ctx, owned).await;
                    let line = render(&renderer, &result);
                    (result, line)
                }
                .instrument(span),
            );
            pending.insert(handle.id(), reference.clone());
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (result, line) = match joined {
                Ok((id, output)) => {
                    pending.remove(&id);
                    output
                }
                Err(e) => {
                    let reference = pending.remove(&e.id()).unwrap_or_default();
                    error!(reference = %reference, error = %e, "scan task failed");
                    let mut result = ScanResult::new(reference);
                    result.error = Some(Error::Internal(format!("scan task failed: {}", e)));
                    let line = render(&self.renderer, &result);
                    (result, line)
                }
            };

            summary.total += 1;
            match result.status() {
                Status::Match => summary.matched += 1,
                Status::Error => summary.errors += 1,
                Status::None => {}
            }
            emit(&result, &line);
        }

        info!(
            total = summary.total,
            matched = summary.matched,
            errors = summary.errors,
            "scan complete"
        );
        summary
    }
}

fn render(renderer: &Renderer, result: &ScanResult) -> String {
    renderer.render(result).unwrap_or_else(|e| {
        warn!(error = %e, "error rendering result, using default format");
        result.to_string()
    })
}

/// Runs the full pipeline for one reference while holding a slot.
async fn scan_one(ctx: &TaskContext, reference: String) -> ScanResult {
    let mut result = ScanResult::new(reference);

    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            result.error = Some(Error::Cancelled);
            return result;
        }
        permit = Arc::clone(&ctx.slots).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                result.error = Some(Error::Cancelled);
                return result;
            }
        },
    };
    debug!("acquired slot");

    let rule = Arc::clone(&ctx.rule);
    let outcome = acquire::with_mounted_root(
        Arc::clone(&ctx.service),
        &result.reference,
        &ctx.pull,
        &ctx.scratch,
        &ctx.cancel,
        |root| async move { run_blocking(move || Ok(scan::scan_root(&root, rule.as_ref()))).await },
    )
    .await;

    match outcome {
        Ok((manifest, found)) => {
            result.manifest = manifest;
            match found {
                Ok(found) => result.found = found,
                Err(e) => result.error = Some(e),
            }
        }
        Err(e) => result.error = Some(e),
    }

    if let Some(e) = &result.error {
        warn!(error = %e, "scan failed");
    } else {
        debug!(found = result.found.len(), "scan finished");
    }
    result
}
