//! Per-reference scan results and the output renderer.
//!
//! A [`ScanResult`] is owned by the task scanning its reference and is
//! immutable once handed to the [`Renderer`]. The renderer formats it through
//! the user's output template; the default template prints
//! `<ref> <status> <data>`.

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

const OUTPUT_TEMPLATE: &str = "output";

/// Variables available to output templates.
const CONTEXT_VARS: &[&str] = &[
    "ref",
    "status",
    "found",
    "data",
    "has_matches",
    "has_error",
    "error",
    "manifest",
    "manifest_json",
    "result",
];

/// Outcome class of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Match,
    None,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Match => "MATCH",
            Status::None => "NONE",
            Status::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of scanning one image reference.
#[derive(Debug)]
pub struct ScanResult {
    pub reference: String,
    /// Matched paths in discovery order.
    pub found: Vec<String>,
    pub error: Option<Error>,
    /// Retained for diagnostic renderings.
    pub manifest: Option<Manifest>,
}

impl ScanResult {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            found: Vec::new(),
            error: None,
            manifest: None,
        }
    }

    pub fn status(&self) -> Status {
        if self.error.is_some() {
            Status::Error
        } else if self.found.is_empty() {
            Status::None
        } else {
            Status::Match
        }
    }

    pub fn has_matches(&self) -> bool {
        !self.found.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// JSON array of found paths, or `{"error": "..."}` on failure.
    pub fn data(&self) -> String {
        let value = match &self.error {
            Some(e) => serde_json::json!({ "error": e.to_string() }),
            None => serde_json::json!(self.found),
        };
        value.to_string()
    }

    /// Text rendering of the manifest, or the error when there is none.
    pub fn manifest_text(&self) -> String {
        match (&self.manifest, &self.error) {
            (Some(m), _) => m.to_text(),
            (None, Some(e)) => e.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn manifest_json(&self) -> String {
        match &self.manifest {
            Some(m) => m.to_json().unwrap_or_else(|e| e.to_string()),
            None => String::new(),
        }
    }
}

impl std::fmt::Display for ScanResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.reference, self.status(), self.data())
    }
}

#[derive(Serialize)]
struct OutputContext<'a> {
    #[serde(rename = "ref")]
    reference: &'a str,
    status: Status,
    found: &'a [String],
    data: String,
    has_matches: bool,
    has_error: bool,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_json: Option<String>,
    result: String,
}

/// Formats results through the output template.
pub struct Renderer {
    env: Environment<'static>,
    // Manifest renderings are only built for templates that read them.
    wants_text: bool,
    wants_json: bool,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").finish_non_exhaustive()
    }
}

impl Renderer {
    /// Parses the output template. Syntax errors and unknown variables are
    /// configuration errors.
    pub fn new(source: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidTemplate {
            name: OUTPUT_TEMPLATE.to_string(),
            reason,
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_template_owned(OUTPUT_TEMPLATE, source.to_string())
            .map_err(|e| invalid(e.to_string()))?;

        let template = env.get_template(OUTPUT_TEMPLATE).map_err(|e| invalid(e.to_string()))?;
        let used = template.undeclared_variables(false);
        let wants_text = used.contains("manifest");
        let wants_json = used.contains("manifest_json");
        let mut unknown: Vec<String> = used
            .into_iter()
            .filter(|name| !CONTEXT_VARS.contains(&name.as_str()))
            .filter(|name| !matches!(name.as_str(), "range" | "dict" | "namespace" | "debug" | "loop"))
            .collect();
        unknown.sort();
        if !unknown.is_empty() {
            return Err(invalid(format!("unknown variables: {}", unknown.join(", "))));
        }

        Ok(Self {
            env,
            wants_text,
            wants_json,
        })
    }

    pub fn render(&self, result: &ScanResult) -> Result<String> {
        let ctx = OutputContext {
            reference: &result.reference,
            status: result.status(),
            found: &result.found,
            data: result.data(),
            has_matches: result.has_matches(),
            has_error: result.has_error(),
            error: result.error.as_ref().map(|e| e.to_string()),
            manifest: self.wants_text.then(|| result.manifest_text()),
            manifest_json: self.wants_json.then(|| result.manifest_json()),
            result: result.to_string(),
        };

        self.env
            .get_template(OUTPUT_TEMPLATE)
            .and_then(|t| t.render(&ctx))
            .map_err(|e| Error::InvalidTemplate {
                name: OUTPUT_TEMPLATE.to_string(),
                reason: e.to_string(),
            })
    }
}
