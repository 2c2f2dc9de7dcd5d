//! Pure payload validation.
//!
//! The Validate stage runs this battery against a candidate payload
//! before anything is written. No external calls: every check is a
//! local scan of the payload text. Any issue fails validation, and
//! validation failures are terminal for the request; a corrected edit
//! request is the only retry path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Container tags whose open/close balance is checked.
const BALANCED_TAGS: &[&str] = &["html", "body", "div", "span", "section", "script", "style"];

/// Per-tag slack for the balance check. Machine-generated payloads
/// legitimately contain asymmetric self-closing constructs, so exact
/// balance is not required.
const BALANCE_TOLERANCE: usize = 2;

/// Script sources that are allowed in a deployed payload.
const TRUSTED_SCRIPT_HOSTS: &[&str] = &[
    "cdn.jsdelivr.net",
    "unpkg.com",
    "cdnjs.cloudflare.com",
    "googleapis.com",
];

/// Constructs that must never appear in a deployed payload.
const DANGEROUS_PATTERNS: &[&str] = &[
    "eval(",
    "new Function",
    "Function(",
    "document.write(",
    "javascript:",
    "srcdoc=",
];

/// Rough classification of a payload, used to pick kind-specific
/// checks and to word the completion summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Multi-user payloads persisting through the sync API.
    Collaborative,
    /// Payloads with a render loop and canvas.
    Game,
    /// Payloads built around a submitting form.
    Form,
    Standard,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Collaborative => "collaborative",
            ContentKind::Game => "game",
            ContentKind::Form => "form",
            ContentKind::Standard => "standard",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a payload from its text alone.
pub fn detect_kind(payload: &str) -> ContentKind {
    if payload.contains("/api/sync/save") && payload.contains("/api/sync/load") {
        return ContentKind::Collaborative;
    }
    if payload.contains("requestAnimationFrame") || payload.contains("<canvas") {
        return ContentKind::Game;
    }
    if payload.contains("<form") && (payload.contains("submit") || payload.contains("POST")) {
        return ContentKind::Form;
    }
    ContentKind::Standard
}

/// Outcome of the validation battery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub kind: ContentKind,
    pub issues: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

fn script_src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<script[^>]*\ssrc=["']([^"']+)["']"#).expect("valid regex"))
}

/// Run the full battery against `payload`.
pub fn validate_payload(payload: &str, kind: ContentKind) -> Validation {
    let mut issues = Vec::new();

    check_structure(payload, &mut issues);
    check_dangerous_patterns(payload, &mut issues);
    check_script_sources(payload, &mut issues);
    check_kind(payload, kind, &mut issues);

    if !payload.contains("<meta name=\"viewport\"") && !payload.contains("<meta name='viewport'") {
        issues.push("missing mobile viewport meta tag".to_string());
    }

    Validation { kind, issues }
}

/// Classify and validate in one call.
pub fn validate(payload: &str) -> Validation {
    validate_payload(payload, detect_kind(payload))
}

fn check_structure(payload: &str, issues: &mut Vec<String>) {
    if !payload.contains("<html") || !payload.contains("</html>") {
        issues.push("invalid structure: missing <html> tags".to_string());
    }
    if !payload.contains("<body") || !payload.contains("</body>") {
        issues.push("invalid structure: missing <body> tags".to_string());
    }

    for tag in BALANCED_TAGS {
        let opens = count_occurrences(payload, &format!("<{tag}"));
        let closes = count_occurrences(payload, &format!("</{tag}"));
        if opens.abs_diff(closes) > BALANCE_TOLERANCE {
            issues.push(format!(
                "unbalanced <{tag}> markers: {opens} open, {closes} close"
            ));
        }
    }
}

fn check_dangerous_patterns(payload: &str, issues: &mut Vec<String>) {
    for pattern in DANGEROUS_PATTERNS {
        if payload.contains(pattern) {
            issues.push(format!("dangerous construct: {pattern}"));
        }
    }
}

fn check_script_sources(payload: &str, issues: &mut Vec<String>) {
    for capture in script_src_re().captures_iter(payload) {
        let src = &capture[1];
        // Same-origin scripts are fine; only remote sources are vetted.
        if !src.starts_with("http") {
            continue;
        }
        if !TRUSTED_SCRIPT_HOSTS.iter().any(|host| src.contains(host)) {
            issues.push(format!("external script from untrusted source: {src}"));
        }
    }
}

fn check_kind(payload: &str, kind: ContentKind, issues: &mut Vec<String>) {
    match kind {
        ContentKind::Collaborative => {
            if !payload.contains("/api/sync/save") || !payload.contains("/api/sync/load") {
                issues.push("collaborative payload missing sync API endpoints".to_string());
            }
            if !payload.contains("window.APP_ID") {
                issues.push("collaborative payload missing APP_ID binding".to_string());
            }
        }
        ContentKind::Game => {
            if !payload.contains("requestAnimationFrame") && !payload.contains("setInterval") {
                issues.push("game payload missing redraw loop".to_string());
            }
            if !payload.contains("<canvas") && !payload.contains("createElement('canvas'") {
                issues.push("game payload missing canvas element".to_string());
            }
        }
        ContentKind::Form => {
            if !payload.contains("submit") {
                issues.push("form payload missing submit wiring".to_string());
            }
        }
        ContentKind::Standard => {}
    }
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}
