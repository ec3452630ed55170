//! # Matcher Engine
//!
//! Decides whether one path of a file resource is a finding. Three
//! strategies are available through [`MatchRule`]:
//!
//! | Strategy | Matches when |
//! |----------|--------------|
//! | [`LiteralSet`] | the basename is in the set and the path is under a target root |
//! | [`RegexPredicate`] | the pattern matches anywhere in the full path |
//! | [`TemplatePredicate`] | the rendered template parses as `true` |
//!
//! Rules are built once at startup and shared read-only by every scan task.
//! Compiled regular expressions live in a [`RegexCache`] keyed by pattern
//! text, shared between the regex strategy and the template `regexp()`
//! helper.
//!
//! ## Judge process
//!
//! Templates may call `exec(resource, bin, args...)` when the rule is built
//! with a [`JudgeConfig`]. The resource is written to the judge's stdin as
//! JSON. Exit status 0 is a match, 1 is no match, anything else is an error.
//! Paths in an image are attacker-controlled data, so this helper is only
//! registered when explicitly enabled.

use crate::constants::JUDGE_POLL_INTERVAL;
use crate::error::{Error, Result};
use crate::manifest::FileResource;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minijinja::value::{Rest, Value};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MATCH_TEMPLATE: &str = "match";

/// Variables available to predicate templates.
const CONTEXT_VARS: &[&str] = &[
    "path", "paths", "mode", "file_mode", "is_dir", "kind", "uid", "gid", "size", "digests", "xattrs", "resource",
];

/// Names resolved by the environment rather than the context.
const ENV_GLOBALS: &[&str] = &["regexp", "exec", "range", "dict", "namespace", "debug", "loop"];

/// Evaluates one path of a file resource.
pub trait MatchPredicate: Send + Sync {
    fn evaluate(&self, resource: &FileResource, path: &str) -> Result<bool>;
}

// =============================================================================
// Regex cache
// =============================================================================

/// Compiled regular expressions keyed by pattern text.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: Mutex<HashMap<String, Arc<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled `pattern`, compiling it on first use.
    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>> {
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| Error::Internal("regex cache lock poisoned".to_string()))?;

        if let Some(regex) = compiled.get(pattern) {
            return Ok(Arc::clone(regex));
        }

        let regex = Arc::new(Regex::new(pattern).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?);
        compiled.insert(pattern.to_string(), Arc::clone(&regex));
        Ok(regex)
    }

    /// Number of cached patterns.
    pub fn len(&self) -> usize {
        self.compiled.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Literal set
// =============================================================================

/// Exact basename membership, restricted to target root prefixes.
#[derive(Debug, Clone)]
pub struct LiteralSet {
    names: HashSet<String>,
    /// Normalized roots without a trailing slash; empty means `/`.
    roots: Vec<String>,
}

impl LiteralSet {
    /// Builds the set. No roots (or `/`) means the whole filesystem.
    pub fn new<N, R>(names: N, roots: R) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        let mut roots: Vec<String> = roots
            .into_iter()
            .map(|r| format!("/{}", r.as_ref().trim().trim_matches('/')))
            .map(|r| r.trim_end_matches('/').to_string())
            .collect();
        if roots.is_empty() {
            roots.push(String::new());
        }

        Self {
            names: names.into_iter().map(Into::into).filter(|n: &String| !n.is_empty()).collect(),
            roots,
        }
    }

    fn under_root(&self, path: &str) -> bool {
        self.roots.iter().any(|root| {
            root.is_empty() || path == root || path.strip_prefix(root.as_str()).is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.names.contains(basename) && self.under_root(path)
    }
}

impl MatchPredicate for LiteralSet {
    fn evaluate(&self, _resource: &FileResource, path: &str) -> Result<bool> {
        Ok(self.contains(path))
    }
}

// =============================================================================
// Regex
// =============================================================================

/// Full-path regular expression.
#[derive(Debug, Clone)]
pub struct RegexPredicate {
    regex: Arc<Regex>,
}

impl RegexPredicate {
    pub fn new(pattern: &str, cache: &RegexCache) -> Result<Self> {
        Ok(Self {
            regex: cache.get(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl MatchPredicate for RegexPredicate {
    fn evaluate(&self, _resource: &FileResource, path: &str) -> Result<bool> {
        Ok(self.regex.is_match(path))
    }
}

// =============================================================================
// Template predicate
// =============================================================================

/// Enables the `exec()` template helper.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Cancels running judges on shutdown.
    pub cancel: CancellationToken,
}

/// The resource as serialized for judges and the `resource` template variable.
#[derive(Debug, Serialize)]
struct JudgeResource<'a> {
    path: &'a str,
    paths: &'a [String],
    kind: &'static str,
    file_mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    digests: &'a [String],
    xattrs: BTreeMap<&'a str, String>,
}

#[derive(Debug, Serialize)]
struct PredicateContext<'a> {
    path: &'a str,
    paths: &'a [String],
    mode: String,
    file_mode: u32,
    is_dir: bool,
    kind: &'static str,
    uid: u32,
    gid: u32,
    size: u64,
    digests: &'a [String],
    xattrs: BTreeMap<&'a str, String>,
    resource: JudgeResource<'a>,
}

/// A template that must render a boolean.
pub struct TemplatePredicate {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplatePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplatePredicate").finish_non_exhaustive()
    }
}

impl TemplatePredicate {
    /// Parses `source`. Unknown variables, and `exec()` without a judge
    /// config, are rejected here rather than at first use.
    pub fn new(source: &str, cache: Arc<RegexCache>, judge: Option<JudgeConfig>) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidTemplate {
            name: MATCH_TEMPLATE.to_string(),
            reason,
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("regexp", move |value: String, pattern: String| {
            let regex = cache
                .get(&pattern)
                .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
            Ok(regex.is_match(&value))
        });

        let exec_enabled = judge.is_some();
        if let Some(judge) = judge {
            env.add_function("exec", move |resource: Value, bin: String, args: Rest<String>| {
                let input = serde_json::to_vec(&resource)
                    .map_err(|e| minijinja::Error::new(ErrorKind::BadSerialization, e.to_string()))?;
                run_judge(&bin, &args, &input, &judge.cancel)
                    .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
            });
        }

        env.add_template_owned(MATCH_TEMPLATE, source.to_string())
            .map_err(|e| invalid(e.to_string()))?;

        let template = env.get_template(MATCH_TEMPLATE).map_err(|e| invalid(e.to_string()))?;
        let mut unknown: Vec<String> = template
            .undeclared_variables(false)
            .into_iter()
            .filter(|name| !CONTEXT_VARS.contains(&name.as_str()))
            .filter(|name| !ENV_GLOBALS.contains(&name.as_str()))
            .collect();
        unknown.sort();
        if !unknown.is_empty() {
            return Err(invalid(format!("unknown variables: {}", unknown.join(", "))));
        }
        if !exec_enabled && template.undeclared_variables(false).contains("exec") {
            return Err(invalid("exec() requires --allow-exec".to_string()));
        }

        Ok(Self { env })
    }

    /// Renders the template for one path and returns the raw output.
    pub fn render(&self, resource: &FileResource, path: &str) -> Result<String> {
        let xattrs: BTreeMap<&str, String> = resource
            .xattrs
            .iter()
            .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v).into_owned()))
            .collect();
        let judge_xattrs = resource.xattrs.iter().map(|(k, v)| (k.as_str(), STANDARD.encode(v))).collect();

        let ctx = PredicateContext {
            path,
            paths: &resource.paths,
            mode: format!("{:04o}", resource.meta.permissions()),
            file_mode: resource.meta.mode,
            is_dir: false,
            kind: resource.kind.as_str(),
            uid: resource.meta.uid,
            gid: resource.meta.gid,
            size: resource.size,
            digests: &resource.digests,
            xattrs,
            resource: JudgeResource {
                path,
                paths: &resource.paths,
                kind: resource.kind.as_str(),
                file_mode: resource.meta.mode,
                uid: resource.meta.uid,
                gid: resource.meta.gid,
                size: resource.size,
                digests: &resource.digests,
                xattrs: judge_xattrs,
            },
        };

        let failed = |reason: String| Error::MatchFailed {
            path: path.to_string(),
            reason,
        };
        self.env
            .get_template(MATCH_TEMPLATE)
            .and_then(|t| t.render(&ctx))
            .map_err(|e| failed(render_error(&e)))
    }
}

impl MatchPredicate for TemplatePredicate {
    fn evaluate(&self, resource: &FileResource, path: &str) -> Result<bool> {
        let out = self.render(resource, path)?;
        debug!(path, output = %out.trim(), "predicate rendered");
        parse_bool(out.trim()).ok_or_else(|| Error::MatchFailed {
            path: path.to_string(),
            reason: format!("template returned something other than a bool value: {:?}", out.trim()),
        })
    }
}

/// Flattens a minijinja error and its sources into one line.
fn render_error(e: &minijinja::Error) -> String {
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

/// Parses the boolean spellings `1 t T TRUE true True 0 f F FALSE false False`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Runs a judge process with `input` on stdin.
///
/// Exit status 0 means match, 1 means no match; any other status (or death
/// by signal) is an error carrying the judge's output.
pub fn run_judge(bin: &str, args: &[String], input: &[u8], cancel: &CancellationToken) -> Result<bool> {
    let judge_err = |reason: String| Error::MatchFailed {
        path: bin.to_string(),
        reason,
    };

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| judge_err(format!("failed to start judge: {}", e)))?;

    let readers: Vec<_> = [
        child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    .map(|mut stream| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            buf
        })
    })
    .collect();

    if let Some(mut stdin) = child.stdin.take()
        && let Err(e) = stdin.write_all(input)
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        let _ = child.kill();
        let _ = child.wait();
        return Err(judge_err(format!("failed to write judge input: {}", e)));
    }

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(JUDGE_POLL_INTERVAL),
            Err(e) => return Err(judge_err(format!("failed to wait for judge: {}", e))),
        }
    };

    let output: Vec<u8> = readers.into_iter().flat_map(|r| r.join().unwrap_or_default()).collect();

    match status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        code => Err(judge_err(format!(
            "judge exited with {}: {}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            String::from_utf8_lossy(&output).trim()
        ))),
    }
}

// =============================================================================
// Rule
// =============================================================================

/// The configured matching strategy.
#[derive(Debug)]
pub enum MatchRule {
    Literal(LiteralSet),
    Regex(RegexPredicate),
    Template(TemplatePredicate),
}

impl MatchPredicate for MatchRule {
    fn evaluate(&self, resource: &FileResource, path: &str) -> Result<bool> {
        match self {
            MatchRule::Literal(rule) => rule.evaluate(resource, path),
            MatchRule::Regex(rule) => rule.evaluate(resource, path),
            MatchRule::Template(rule) => rule.evaluate(resource, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileKind, Meta};

    fn file(paths: &[&str]) -> FileResource {
        FileResource {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            kind: FileKind::Regular,
            meta: Meta {
                mode: 0o100755,
                uid: 0,
                gid: 0,
            },
            size: 10,
            digests: vec!["sha256:00".to_string()],
            xattrs: BTreeMap::from([("security.capability".to_string(), b"cap".to_vec())]),
            target: None,
        }
    }

    #[test]
    fn test_regex_cache_shares_compiled() {
        let cache = RegexCache::new();
        let a = cache.get("bin/sh$").unwrap();
        let b = cache.get("bin/sh$").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.get("("), Err(Error::InvalidPattern { .. })));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_literal_set_roots() {
        let set = LiteralSet::new(["sh", "bash"], ["/usr/"]);
        assert!(set.contains("/usr/bin/bash"));
        assert!(!set.contains("/bin/bash"));
        assert!(!set.contains("/usrlocal/bin/sh"));
        assert!(!set.contains("/usr/bin/bashful"));

        let everywhere = LiteralSet::new(["sh"], Vec::<String>::new());
        assert!(everywhere.contains("/bin/sh"));
        let slash = LiteralSet::new(["sh"], ["/"]);
        assert!(slash.contains("/bin/sh"));
    }

    #[test]
    fn test_template_fields() {
        let cache = Arc::new(RegexCache::new());
        let rule = TemplatePredicate::new(
            r#"{{ mode == "0755" and uid == 0 and kind == "regular" and "security.capability" in xattrs }}"#,
            cache,
            None,
        )
        .unwrap();
        assert!(rule.evaluate(&file(&["/bin/ping"]), "/bin/ping").unwrap());
    }

    #[test]
    fn test_template_regexp_uses_cache() {
        let cache = Arc::new(RegexCache::new());
        let rule = TemplatePredicate::new(r#"{{ regexp(path, "bin/(sh|bash)$") }}"#, cache.clone(), None).unwrap();
        let res = file(&["/bin/sh", "/bin/ls"]);
        assert!(rule.evaluate(&res, "/bin/sh").unwrap());
        assert!(!rule.evaluate(&res, "/bin/ls").unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_template_non_bool_is_error() {
        let rule = TemplatePredicate::new("{{ path }}", Arc::new(RegexCache::new()), None).unwrap();
        let err = rule.evaluate(&file(&["/bin/sh"]), "/bin/sh").unwrap_err();
        assert!(matches!(err, Error::MatchFailed { ref path, .. } if path == "/bin/sh"));
    }

    #[test]
    fn test_template_parse_errors() {
        let cache = Arc::new(RegexCache::new());
        assert!(matches!(
            TemplatePredicate::new("{{ path ", cache.clone(), None),
            Err(Error::InvalidTemplate { .. })
        ));
        assert!(matches!(
            TemplatePredicate::new("{{ nosuchfield }}", cache.clone(), None),
            Err(Error::InvalidTemplate { .. })
        ));
        let err = TemplatePredicate::new(r#"{{ exec(resource, "/bin/true") }}"#, cache, None).unwrap_err();
        assert!(err.to_string().contains("--allow-exec"));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("T"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_judge_exit_codes() {
        let cancel = CancellationToken::new();
        let sh = |script: &str| vec!["-c".to_string(), script.to_string()];
        assert!(run_judge("/bin/sh", &sh("cat >/dev/null; exit 0"), b"{}", &cancel).unwrap());
        assert!(!run_judge("/bin/sh", &sh("exit 1"), b"{}", &cancel).unwrap());
        let err = run_judge("/bin/sh", &sh("echo broken >&2; exit 3"), b"{}", &cancel).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_judge_receives_resource_json() {
        let cache = Arc::new(RegexCache::new());
        let judge = JudgeConfig {
            cancel: CancellationToken::new(),
        };
        let rule = TemplatePredicate::new(
            r#"{{ exec(resource, "/bin/sh", "-c", "grep -q '\"path\":\"/bin/sh\"'") }}"#,
            cache,
            Some(judge),
        )
        .unwrap();
        let res = file(&["/bin/sh", "/bin/bash"]);
        assert!(rule.evaluate(&res, "/bin/sh").unwrap());
        assert!(!rule.evaluate(&res, "/bin/bash").unwrap());
    }

    #[test]
    fn test_cancelled_judge() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_judge("/bin/sh", &["-c".to_string(), "sleep 5".to_string()], b"", &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
