//! Credential redaction for captured text.
//!
//! Everything a tool server prints (container logs, stdio stderr, build
//! output) is untrusted text that may echo the API keys we injected into it.
//! [`redact`] scrubs the common key shapes before the text is logged or
//! handed back to a caller.

use std::sync::OnceLock;

use regex::Regex;

/// Replacement for every matched credential.
pub const PLACEHOLDER: &str = "[REDACTED]";

/// Credential shapes, applied in order.
///
/// Vendor-specific prefixes come before the generic base64 run so the
/// placeholder replaces the whole key rather than its tail.
const PATTERNS: &[&str] = &[
    // OpenAI
    r"sk-[A-Za-z0-9]{20,}",
    // Anthropic
    r"sk-ant-[A-Za-z0-9-]+",
    // Google API keys
    r"AIza[A-Za-z0-9_-]{30,}",
    // GitHub personal / OAuth / app tokens
    r"gh[pousr]_[A-Za-z0-9]{36,}",
    r"github_pat_[A-Za-z0-9_]{22,}",
    // AWS access key ids
    r"AKIA[0-9A-Z]{16}",
    // Slack
    r"xox[abprs]-[A-Za-z0-9-]{10,}",
    // Authorization headers echoed into logs
    r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}=*",
    // Long base64 runs
    r"[A-Za-z0-9+/]{40,}={0,2}",
];

/// Upper bound on re-application passes; one is almost always enough.
const MAX_PASSES: usize = 4;

fn compiled() -> &'static [Regex] {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::error!(pattern = p, error = %e, "invalid redaction pattern");
                    None
                }
            })
            .collect()
    })
}

/// Replace every known credential shape in `text` with [`PLACEHOLDER`].
///
/// Idempotent: the output is a fixed point, so `redact(redact(x)) == redact(x)`.
pub fn redact(text: &str) -> String {
    let patterns = compiled();
    let mut current = text.to_string();

    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for re in patterns {
            if re.is_match(&current) {
                let replaced = re.replace_all(&current, PLACEHOLDER);
                if replaced != current {
                    current = replaced.into_owned();
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    current
}

/// Redact raw bytes (e.g. a container log stream). Invalid UTF-8 is replaced
/// lossily before scanning.
pub fn redact_bytes(bytes: &[u8]) -> String {
    redact(&String::from_utf8_lossy(bytes))
}

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...(truncated)");
    out
}
