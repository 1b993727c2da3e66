//! Turning raw tool output into a classified, human-readable failure.
//!
//! Only error-class lines are ever shown to the user. Warnings, debug
//! output and deprecation notices are skipped even when they are the last
//! thing the tool printed.

use super::{FailureClass, FetchFailure};

const NOISE_PREFIXES: &[&str] = &[
    "WARNING:",
    "[debug]",
    "Deprecated Feature:",
    "DeprecationWarning",
    "NOTICE",
];

const ACCESS: &[&str] = &[
    "http error 401",
    "http error 403",
    "status=401",
    "status=403",
    "forbidden",
    "sign in to confirm",
    "login required",
    "requires authentication",
    "use --cookies",
    "private video",
    "members-only",
    "drm",
    "not available in your country",
    "geo restrict",
    "geo-restrict",
];

const UNSUPPORTED: &[&str] = &[
    "unsupported url",
    "no video formats found",
    "unable to extract",
    "is not a valid url",
    "no media found",
    "http error 404",
    "status=404",
    "resource not found",
];

const MALFORMED: &[&str] = &[
    "requested format is not available",
    "no such option",
    "invalid argument",
    "unrecognized option",
    "http error 416",
    "range not satisfiable",
    "errorcode=13",
    "errorcode=28",
];

const RESOURCE: &[&str] = &[
    "no space left",
    "disk full",
    "not enough disk space",
    "permission denied",
    "read-only file system",
    "errorcode=9",
    "errorcode=15",
    "errorcode=16",
    "errorcode=17",
];

/// Returns true for lines that must never become the user-facing error.
#[must_use]
pub fn is_noise(line: &str) -> bool {
    let line = line.trim_start();
    line.is_empty() || NOISE_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    line.starts_with("ERROR:")
        || lower.starts_with("error")
        || lower.contains("errorcode=")
        || lower.contains("exception:")
}

/// Strips tool prefixes like `ERROR: [youtube] abc123:` from a line.
fn clean(line: &str) -> String {
    let mut rest = line.trim();
    rest = rest.strip_prefix("ERROR:").unwrap_or(rest).trim_start();
    if rest.starts_with('[')
        && let Some(end) = rest.find(']')
    {
        rest = rest[end + 1..].trim_start();
        // Extractor lines carry the video id before a colon.
        if let Some((id, msg)) = rest.split_once(": ")
            && !id.contains(' ')
        {
            rest = msg;
        }
    }
    rest.trim().to_string()
}

fn matches_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

/// Classifies a failed run from its output tail and exit code.
#[must_use]
pub fn diagnose(tool: &str, tail: &[String], code: Option<i32>) -> FetchFailure {
    let errors: Vec<&str> = tail
        .iter()
        .map(String::as_str)
        .filter(|l| !is_noise(l) && is_error_line(l))
        .collect();
    let haystack = errors.join("\n").to_ascii_lowercase();

    let class = if matches_any(&haystack, RESOURCE) {
        FailureClass::Resource
    } else if matches_any(&haystack, ACCESS) {
        FailureClass::Access
    } else if matches_any(&haystack, MALFORMED) {
        FailureClass::MalformedOption
    } else if matches_any(&haystack, UNSUPPORTED) {
        FailureClass::Unsupported
    } else {
        FailureClass::Transient
    };

    // Only an error-class line may explain the failure; progress and
    // extractor chatter fall back to the exit status.
    let detail = errors.last().map(|l| clean(l)).filter(|d| !d.is_empty());
    let exit = code.map_or_else(|| "was terminated".to_string(), |c| format!("exited with code {c}"));
    let detail = detail.unwrap_or_else(|| format!("{tool} {exit}"));

    let message = match class {
        FailureClass::Access => format!(
            "Access denied (sign-in, DRM or region restriction): {detail}"
        ),
        FailureClass::Unsupported => format!("Unsupported or unavailable content: {detail}"),
        FailureClass::Resource => format!("Local storage error: {detail}"),
        FailureClass::MalformedOption => format!("Download options rejected: {detail}"),
        FailureClass::PeerConnectivity | FailureClass::Transient => detail,
    };

    let failure = FetchFailure::new(class, message);
    if errors.is_empty() {
        failure
    } else {
        failure.with_diagnostic(errors.join("\n"))
    }
}
