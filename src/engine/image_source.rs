//! Build-source resolution.
//!
//! Turns what a user pasted as a build context (local path, GitHub repo URL,
//! or a GitHub `blob`/`tree` link to a Dockerfile) into a context and
//! Dockerfile path the engine's builder understands.

use std::sync::OnceLock;

use regex::Regex;

use super::errors::ImageSourceError;

/// Resolved build inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBuild {
    pub context: String,
    /// `None` means the builder's default `Dockerfile` at the context root.
    pub dockerfile: Option<String>,
}

fn blob_or_tree() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^https://github\.com/(?P<user>[^/]+)/(?P<repo>[^/]+)/(?P<kind>blob|tree)/(?P<ref>[^/]+)(?:/(?P<path>.*))?$",
        )
        .ok()
    })
    .as_ref()
}

fn bare_repo() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https://github\.com/(?P<user>[^/]+)/(?P<repo>[^/]+?)/?$").ok())
        .as_ref()
}

/// Resolve a build context and optional Dockerfile path.
///
/// Rules, first match wins:
/// 1. `*.git` or `*.git#...` passes through.
/// 2. `github.com/{user}/{repo}/(blob|tree)/{ref}/{path}` becomes
///    `{repo}.git#{ref}[:{dir}]`; a `blob` link to a file not named exactly
///    `Dockerfile` also yields that file name as the Dockerfile.
/// 3. `github.com/{user}/{repo}` gets `.git` appended.
/// 4. Anything else (local paths) is returned unchanged.
///
/// Non-GitHub `http(s)` contexts and URLs containing whitespace are rejected.
pub fn resolve(context: &str, dockerfile: Option<&str>) -> Result<ResolvedBuild, ImageSourceError> {
    let dockerfile = dockerfile
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    if context.trim().is_empty() {
        return Err(ImageSourceError::MissingContext);
    }

    let looks_like_url = context.trim_start().starts_with("http") || context.contains("://");
    if looks_like_url {
        if context.chars().any(char::is_whitespace) {
            return Err(ImageSourceError::MalformedUrl);
        }
        if !context.starts_with("https://github.com/") && !context.starts_with("http://github.com/")
        {
            return Err(ImageSourceError::UnsupportedHost {
                context: context.to_string(),
            });
        }
    }
    let context = context.replacen("http://github.com/", "https://github.com/", 1);

    if context.ends_with(".git") || context.contains(".git#") {
        return Ok(ResolvedBuild { context, dockerfile });
    }

    if let Some(caps) = blob_or_tree().and_then(|re| re.captures(&context)) {
        let user = &caps["user"];
        let repo = caps["repo"].trim_end_matches(".git");
        let git_ref = &caps["ref"];
        let path = caps
            .name("path")
            .map(|m| m.as_str().trim_matches('/'))
            .unwrap_or("");

        let mut resolved = format!("https://github.com/{user}/{repo}.git#{git_ref}");
        let mut effective_dockerfile = dockerfile;

        match &caps["kind"] {
            "blob" if !path.is_empty() => {
                let (dir, file) = match path.rsplit_once('/') {
                    Some((dir, file)) => (dir, file),
                    None => ("", path),
                };
                if !dir.is_empty() {
                    resolved.push(':');
                    resolved.push_str(dir);
                }
                effective_dockerfile = (file != "Dockerfile").then(|| file.to_string());
            }
            "tree" if !path.is_empty() => {
                resolved.push(':');
                resolved.push_str(path);
            }
            _ => {}
        }

        return Ok(ResolvedBuild {
            context: resolved,
            dockerfile: effective_dockerfile,
        });
    }

    if bare_repo().is_some_and(|re| re.is_match(&context)) {
        let trimmed = context.trim_end_matches('/');
        return Ok(ResolvedBuild {
            context: format!("{trimmed}.git"),
            dockerfile,
        });
    }

    Ok(ResolvedBuild { context, dockerfile })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_default_dockerfile() {
        let r = resolve("https://github.com/acme/widget/blob/main/docker/Dockerfile", None).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git#main:docker");
        assert_eq!(r.dockerfile, None);
    }

    #[test]
    fn test_blob_named_dockerfile() {
        let r =
            resolve("https://github.com/acme/widget/blob/main/docker/Dockerfile.dev", None).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git#main:docker");
        assert_eq!(r.dockerfile.as_deref(), Some("Dockerfile.dev"));
    }

    #[test]
    fn test_blob_at_repo_root() {
        let r = resolve("https://github.com/acme/widget/blob/v1.2/Dockerfile.mcp", None).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git#v1.2");
        assert_eq!(r.dockerfile.as_deref(), Some("Dockerfile.mcp"));
    }

    #[test]
    fn test_tree_with_subdir() {
        let r = resolve("https://github.com/acme/widget/tree/main/servers/search", Some("Dockerfile"))
            .unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git#main:servers/search");
        assert_eq!(r.dockerfile.as_deref(), Some("Dockerfile"));
    }

    #[test]
    fn test_bare_repo_gets_git_suffix() {
        let r = resolve("https://github.com/acme/widget", None).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git");
        let r = resolve("https://github.com/acme/widget/", None).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git");
    }

    #[test]
    fn test_git_urls_pass_through() {
        let r = resolve("https://github.com/acme/widget.git#dev:sub", Some("Dockerfile.x")).unwrap();
        assert_eq!(r.context, "https://github.com/acme/widget.git#dev:sub");
        assert_eq!(r.dockerfile.as_deref(), Some("Dockerfile.x"));
    }

    #[test]
    fn test_local_path_unchanged() {
        let r = resolve("/srv/mcp/search", Some(" ")).unwrap();
        assert_eq!(r.context, "/srv/mcp/search");
        assert_eq!(r.dockerfile, None);
    }

    #[test]
    fn test_rejects_other_hosts_and_whitespace() {
        assert!(matches!(
            resolve("https://gitlab.com/acme/widget", None),
            Err(ImageSourceError::UnsupportedHost { .. })
        ));
        assert_eq!(
            resolve("https://github.com/acme/widget\nhttps://github.com/x", None),
            Err(ImageSourceError::MalformedUrl)
        );
        assert_eq!(resolve("  ", None), Err(ImageSourceError::MissingContext));
    }
}
