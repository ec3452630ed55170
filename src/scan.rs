//! Per-image evaluation of a manifest against the match rule.

use crate::error::Result;
use crate::manifest::Manifest;
use crate::matcher::MatchPredicate;
use std::path::Path;
use tracing::debug;

/// Evaluates every path of every file resource in manifest order.
///
/// Directories are skipped here, never offered to the predicate. A hardlink
/// group with `k` paths is evaluated `k` times, once per path, in the order
/// the manifest reports them. The first evaluation error aborts the scan.
pub fn scan_manifest(manifest: &Manifest, rule: &dyn MatchPredicate) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for resource in manifest.files() {
        for path in &resource.paths {
            if rule.evaluate(resource, path)? {
                debug!(path = %path, "matched");
                found.push(path.clone());
            }
        }
    }
    Ok(found)
}

/// Builds the manifest of a mounted root and scans it.
///
/// The manifest is returned alongside the matches even when matching fails,
/// so callers can still render it for diagnosis.
pub fn scan_root(root: &Path, rule: &dyn MatchPredicate) -> (Option<Manifest>, Result<Vec<String>>) {
    let manifest = match Manifest::build(root) {
        Ok(m) => m,
        Err(e) => return (None, Err(e)),
    };
    let found = scan_manifest(&manifest, rule);
    (Some(manifest), found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DirectoryResource, FileKind, FileResource, Meta, Resource};
    use std::sync::Mutex;

    /// Records every evaluated path and matches a fixed one.
    struct Recording {
        seen: Mutex<Vec<String>>,
        hit: &'static str,
    }

    impl MatchPredicate for Recording {
        fn evaluate(&self, _resource: &FileResource, path: &str) -> Result<bool> {
            self.seen.lock().unwrap().push(path.to_string());
            Ok(path == self.hit)
        }
    }

    fn meta(mode: u32) -> Meta {
        Meta { mode, uid: 0, gid: 0 }
    }

    fn file(paths: &[&str]) -> Resource {
        Resource::File(FileResource {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            kind: FileKind::Regular,
            meta: meta(0o100600),
            size: 0,
            digests: Vec::new(),
            xattrs: Default::default(),
            target: None,
        })
    }

    fn fixture() -> Manifest {
        Manifest {
            resources: vec![
                file(&["/foo"]),
                file(&["/baz", "/quux"]),
                Resource::Directory(DirectoryResource {
                    path: "/someDir".to_string(),
                    meta: meta(0o040755),
                    xattrs: Default::default(),
                }),
                file(&["/someDir/someFile"]),
            ],
        }
    }

    #[test]
    fn test_every_path_once_in_order() {
        let rule = Recording {
            seen: Mutex::new(Vec::new()),
            hit: "/quux",
        };
        let found = scan_manifest(&fixture(), &rule).unwrap();

        assert_eq!(found, vec!["/quux"]);
        assert_eq!(
            *rule.seen.lock().unwrap(),
            vec!["/foo", "/baz", "/quux", "/someDir/someFile"]
        );
    }

    #[test]
    fn test_directory_never_offered() {
        let rule = Recording {
            seen: Mutex::new(Vec::new()),
            hit: "/someDir",
        };
        let found = scan_manifest(&fixture(), &rule).unwrap();
        assert!(found.is_empty());
        assert!(!rule.seen.lock().unwrap().iter().any(|p| p == "/someDir"));
    }
}
