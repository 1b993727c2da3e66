//! Job classification and name derivation for submitted URLs.
//!
//! Classification is a pure function of the URL and an optional hint from an
//! upstream resolution step; it never touches the network.

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::job::JobKind;

/// Maximum filename length in bytes on common Linux filesystems.
const NAME_MAX: usize = 255;

/// A download request as received from the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Submission {
    pub url: String,
    /// Media format selector overriding the configured quality.
    #[serde(alias = "formatHint", alias = "format")]
    pub format_hint: Option<String>,
    pub title: Option<String>,
    #[serde(flatten)]
    pub hint: ResolutionHint,
}

impl Submission {
    /// Creates a submission for `url` with no hints.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format_hint = Some(format.into());
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: ResolutionHint) -> Self {
        self.hint = hint;
        self
    }
}

/// What an upstream resolver (e.g. a page scanner) learned about a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolutionHint {
    #[serde(alias = "resolvedKind")]
    pub resolved_kind: Option<String>,
    #[serde(alias = "resolvedMethod")]
    pub resolved_method: Option<String>,
}

impl ResolutionHint {
    /// Returns true if the hint names a direct-file download mechanism.
    #[must_use]
    pub fn is_direct_file(&self) -> bool {
        const DIRECT: &[&str] = &["file", "direct", "aria2", "aria2c", "http"];
        [&self.resolved_kind, &self.resolved_method]
            .into_iter()
            .flatten()
            .any(|v| DIRECT.iter().any(|d| v.trim().eq_ignore_ascii_case(d)))
    }
}

/// Decides which fetch strategy handles `raw`.
///
/// Rules are applied in order: magnet scheme, `.torrent` path, direct-file
/// hint, then media extraction as the default. FTP and SFTP URLs are always
/// direct files since the media extractor cannot speak those protocols.
///
/// # Errors
///
/// Returns [`Error::EmptyUrl`] for blank input and [`Error::Classification`]
/// when the URL cannot be parsed or uses a scheme no strategy supports.
pub fn classify(raw: &str, hint: &ResolutionHint) -> Result<JobKind> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::EmptyUrl);
    }

    let url = Url::parse(raw).map_err(|e| Error::Classification {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "magnet" => {
            if url.query_pairs().any(|(k, v)| k == "xt" && !v.is_empty()) {
                Ok(JobKind::Magnet)
            } else {
                Err(Error::Classification {
                    url: raw.to_string(),
                    reason: "magnet link has no exact topic (xt)".to_string(),
                })
            }
        }
        "http" | "https" => {
            if url.host_str().is_none_or(str::is_empty) {
                return Err(Error::Classification {
                    url: raw.to_string(),
                    reason: "missing host".to_string(),
                });
            }
            if has_torrent_path(&url) {
                Ok(JobKind::Torrent)
            } else if hint.is_direct_file() {
                Ok(JobKind::File)
            } else {
                Ok(JobKind::Media)
            }
        }
        "ftp" | "ftps" | "sftp" => {
            if has_torrent_path(&url) {
                Ok(JobKind::Torrent)
            } else {
                Ok(JobKind::File)
            }
        }
        other => Err(Error::Classification {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn has_torrent_path(url: &Url) -> bool {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(percent_decode)
        .is_some_and(|name| name.to_ascii_lowercase().ends_with(".torrent"))
}

/// Derives a human title for a job when the caller supplied none.
///
/// Magnet links use their display name (`dn`); other URLs use the last
/// non-empty path segment, then the host, then the URL itself.
#[must_use]
pub fn derive_title(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };

    if url.scheme() == "magnet" {
        return url
            .query_pairs()
            .find(|(k, v)| k == "dn" && !v.trim().is_empty())
            .map_or_else(
                || {
                    url.query_pairs()
                        .find(|(k, _)| k == "xt")
                        .map_or_else(|| raw.to_string(), |(_, v)| v.into_owned())
                },
                |(_, v)| v.trim().to_string(),
            );
    }

    last_segment(&url)
        .or_else(|| url.host_str().map(ToString::to_string))
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Returns a safe output filename taken from the URL path, if it has one.
#[must_use]
pub fn filename_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    last_segment(&url)
        .map(|s| sanitize_filename(&s))
        .filter(|s| !s.is_empty())
}

fn last_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|s| !s.is_empty())
        .map(percent_decode)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extracts the filename from a raw `Content-Disposition` header value.
///
/// `filename*=UTF-8''...` takes precedence over a plain `filename=`.
#[must_use]
pub fn content_disposition_filename(header: &str) -> Option<String> {
    let mut plain: Option<String> = None;

    for param in header.trim().split(';') {
        let Some((name, value)) = param.trim().split_once('=') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        if name == "filename*" {
            let encoded = value
                .split_once("''")
                .filter(|(charset, _)| charset.eq_ignore_ascii_case("utf-8"))
                .map(|(_, rest)| rest);
            if let Some(rest) = encoded {
                let decoded = percent_decode(rest.trim_matches('"'));
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if name == "filename" {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .map_or_else(|| value.to_string(), unescape_quoted);
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }

    plain
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&next) = chars.peek()
            && (next == '"' || next == '\\')
        {
            out.push(next);
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes `%XX` escapes, leaving malformed escapes untouched.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(h), Some(l)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2]))
        {
            out.push((h << 4) | l);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Makes a candidate filename safe to create inside the download directory.
///
/// Path separators, NUL and control characters become `_`, leading and
/// trailing dots and whitespace are trimmed, and the result is capped at
/// 255 bytes on a character boundary.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == '\0' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.len() <= NAME_MAX {
        return trimmed.to_string();
    }

    let mut take = NAME_MAX;
    while !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_hint() -> ResolutionHint {
        ResolutionHint::default()
    }

    #[test]
    fn magnet_scheme_wins() {
        let kind = classify(
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=file.torrent",
            &no_hint(),
        )
        .unwrap();
        assert_eq!(kind, JobKind::Magnet);
    }

    #[test]
    fn magnet_without_topic_is_rejected() {
        let err = classify("magnet:?dn=nothing", &no_hint()).unwrap_err();
        assert!(matches!(err, Error::Classification { .. }));
    }

    #[test]
    fn torrent_path_before_hint() {
        let hint = ResolutionHint {
            resolved_kind: Some("file".to_string()),
            resolved_method: None,
        };
        let kind = classify("https://example.com/pub/Debian-12.ISO.Torrent", &hint).unwrap();
        assert_eq!(kind, JobKind::Torrent);
    }

    #[test]
    fn torrent_query_string_does_not_count() {
        let kind = classify("https://example.com/get?name=x.torrent", &no_hint()).unwrap();
        assert_eq!(kind, JobKind::Media);
    }

    #[test]
    fn direct_file_hint() {
        let hint = ResolutionHint {
            resolved_kind: None,
            resolved_method: Some("aria2".to_string()),
        };
        let kind = classify("https://cdn.example.com/archive.zip", &hint).unwrap();
        assert_eq!(kind, JobKind::File);
    }

    #[test]
    fn media_is_default() {
        let kind = classify("https://video.example.com/watch?v=abc", &no_hint()).unwrap();
        assert_eq!(kind, JobKind::Media);
        let kind = classify("https://cdn.example.com/archive.zip", &no_hint()).unwrap();
        assert_eq!(kind, JobKind::Media);
    }

    #[test]
    fn ftp_is_direct_file() {
        let kind = classify("ftp://mirror.example.org/pub/image.iso", &no_hint()).unwrap();
        assert_eq!(kind, JobKind::File);
    }

    #[test]
    fn empty_and_unsupported() {
        assert!(matches!(classify("   ", &no_hint()), Err(Error::EmptyUrl)));
        assert!(matches!(
            classify("file:///etc/passwd", &no_hint()),
            Err(Error::Classification { .. })
        ));
        assert!(matches!(
            classify("not a url", &no_hint()),
            Err(Error::Classification { .. })
        ));
    }

    #[test]
    fn submission_accepts_camel_case_hints() {
        let sub: Submission = serde_json::from_str(
            r#"{"url":"https://x.example/a.bin","formatHint":"best","resolvedKind":"file"}"#,
        )
        .unwrap();
        assert_eq!(sub.format_hint.as_deref(), Some("best"));
        assert!(sub.hint.is_direct_file());
    }

    #[test]
    fn title_from_magnet_display_name() {
        let title = derive_title("magnet:?xt=urn:btih:abc&dn=Ubuntu+24.04+Desktop");
        assert_eq!(title, "Ubuntu 24.04 Desktop");
    }

    #[test]
    fn title_from_magnet_without_name_uses_topic() {
        assert_eq!(derive_title("magnet:?xt=urn:btih:abc"), "urn:btih:abc");
    }

    #[test]
    fn title_from_path_then_host() {
        assert_eq!(
            derive_title("https://example.com/files/My%20Report.pdf"),
            "My Report.pdf"
        );
        assert_eq!(derive_title("https://example.com/dir/"), "dir");
        assert_eq!(derive_title("https://example.com/"), "example.com");
    }

    #[test]
    fn filename_from_url_is_sanitized() {
        assert_eq!(
            filename_from_url("https://example.com/a/b%2Fc.iso").as_deref(),
            Some("b_c.iso")
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
    }

    #[test]
    fn content_disposition_quoted_and_token() {
        assert_eq!(
            content_disposition_filename("attachment; filename=\"report.pdf\"").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            content_disposition_filename("attachment; filename=report.pdf").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            content_disposition_filename(r#"attachment; filename="say \"hi\".txt""#).as_deref(),
            Some("say \"hi\".txt")
        );
    }

    #[test]
    fn content_disposition_extended_takes_precedence() {
        let header = "attachment; filename=\"fallback.bin\"; filename*=UTF-8''caf%C3%A9%20menu.pdf";
        assert_eq!(
            content_disposition_filename(header).as_deref(),
            Some("café menu.pdf")
        );
    }

    #[test]
    fn content_disposition_without_filename() {
        assert_eq!(content_disposition_filename("inline"), None);
    }

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("  name.txt. "), "name.txt");
        assert_eq!(sanitize_filename("a\u{7}b"), "a_b");
    }

    #[test]
    fn sanitize_caps_length_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_filename(&long);
        assert!(out.len() <= NAME_MAX);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
