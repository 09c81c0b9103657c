//! Parsing and path mapping for GitHub blob URLs.

use std::path::PathBuf;

/// The components of a `https://github.com/{owner}/{repo}/blob/{ref}/{path}` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUrl {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub path: String,
}

/// Parse a GitHub blob URL as returned by the code-search API.
///
/// Returns `None` for anything that is not a well-formed blob URL. A ref
/// containing slashes cannot be distinguished from the leading path
/// segments in this URL form; the first segment after `blob` is taken as
/// the ref.
#[must_use]
pub fn parse_blob_url(raw: &str) -> Option<BlobUrl> {
    let url = url::Url::parse(raw).ok()?;
    if url.host_str() != Some("github.com") {
        return None;
    }

    let segments: Vec<&str> = url.path_segments()?.collect();
    match segments.as_slice() {
        [owner, repo, "blob", git_ref, path @ ..] if !path.is_empty() => Some(BlobUrl {
            owner: (*owner).to_string(),
            repo: (*repo).to_string(),
            git_ref: (*git_ref).to_string(),
            path: path.join("/"),
        }),
        _ => None,
    }
}

/// Replace characters that are unsafe in a single path component.
#[must_use]
pub fn sanitize_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Local path for a file's content: `{owner}/{repo}/blob/{ref}/{path}`,
/// relative to the content directory. Path segments that would escape the
/// root (`.`, `..`, empty) are dropped.
#[must_use]
pub fn content_rel_path(owner: &str, repo: &str, git_ref: &str, path: &str) -> PathBuf {
    let mut rel = PathBuf::new();
    rel.push(sanitize_component(owner));
    rel.push(sanitize_component(repo));
    rel.push("blob");
    rel.push(sanitize_component(git_ref));
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        rel.push(sanitize_component(segment));
    }
    rel
}

/// Textually resolve a relative symlink `target` against the directory of
/// `path`. Returns `None` when the target escapes the repository root.
#[must_use]
pub fn resolve_symlink(path: &str, target: &str) -> Option<String> {
    let dir = match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    };

    let mut stack: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        None
    } else {
        Some(stack.join("/"))
    }
}
