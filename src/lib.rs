//! # binscan
//!
//! **Container image audit for risky executables**
//!
//! binscan pulls each image reference, mounts its root filesystem read-only,
//! walks every file and tests it against a match rule. Shell interpreters
//! and network clients (`sh`, `bash`, `curl`, `wget`, `nc`, ...) are the
//! default targets. One result line is produced per reference.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            binscan                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                    Scan Orchestrator                        │    │
//! │  │   Semaphore(workers) │ JoinSet │ CancellationToken         │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │  per reference                       │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │            Acquisition & Mount Manager                    │      │
//! │  │  pull → chain ID → view snapshot → mount → teardown       │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │  mounted root                        │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │        Manifest Builder → Matcher Engine                  │      │
//! │  │  LiteralSet │ Regex (shared cache) │ Template (+ judge)    │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │  ScanResult                          │
//! │                       Result Renderer                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                   Image & Snapshot Service                          │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐        │
//! │  │   Embedded (LocalStore)  │   │  containerd (RemoteStore)│        │
//! │  │ blobs │ sqlite │ overlay │   │  Transfer │ Snapshots    │        │
//! │  │        or native driver  │   │  Content  │ Namespaces   │        │
//! │  └──────────────────────────┘   └──────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Resource Guarantees
//!
//! - Every snapshot, mount and mount directory is registered with a
//!   teardown guard as soon as it exists and released in reverse order on
//!   every exit path (see [`acquire::with_mounted_root`]).
//! - [`orchestrator::Orchestrator::run_all`] joins every task before
//!   returning, so nothing stays mounted after a run.
//! - Failures are isolated per reference; only startup errors (bad flags,
//!   templates or store) abort the run.
//!
//! # Example
//!
//! ```rust,ignore
//! use binscan::{Cli, orchestrator::Orchestrator, store};
//!
//! let config = Cli::parse().into_config()?;
//! let store = store::open(&config.store).await?;
//! // build the rule and renderer, then:
//! orchestrator.run_all(&config.references, |_, line| println!("{line}")).await;
//! ```

pub mod acquire;
pub mod cli;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod matcher;
pub mod mount;
pub mod orchestrator;
pub mod platform;
pub mod registry;
pub mod result;
pub mod scan;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod store;

// Re-exports
pub use cli::Cli;
pub use config::{RuleConfig, ScanConfig};
pub use error::{Error, Result};
pub use identity::ChainId;
pub use manifest::{Manifest, Resource};
pub use matcher::{MatchPredicate, MatchRule, RegexCache};
pub use orchestrator::{Orchestrator, RunSummary};
pub use platform::Platform;
pub use result::{Renderer, ScanResult, Status};
pub use service::{ImageHandle, ImageService};
pub use storage::BlobStore;
