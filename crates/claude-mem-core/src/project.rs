//! Project identity resolution.
//!
//! A working directory maps to a stable project identifier via its git
//! remote: `host/path`, scheme and `.git` suffix stripped. Directories
//! without a usable remote fall back to their basename. When the remote form
//! wins, the basename is registered as an alias so rows written by older
//! builds under the bare directory name keep matching queries.

use std::path::{Path, PathBuf};
use std::process::Command;

use claude_mem_store::Store;
use tracing::{debug, warn};

pub const UNKNOWN_PROJECT: &str = "unknown-project";

/// Resolve `cwd` to a project identifier. Never fails; the basename (or a
/// placeholder) is the floor.
pub fn resolve_project(cwd: &Path, remote_order: &[String]) -> String {
    if let Some(root) = find_git_root(cwd) {
        if let Some(remotes) = list_remotes(&root) {
            if let Some(url) = pick_remote(&remotes, remote_order) {
                if let Some(identity) = normalize_remote_url(&url) {
                    return identity;
                }
            }
        }
    }
    basename_identity(cwd)
}

/// Register `(basename, identity)` when the remote form won. Best-effort: a
/// failure here must never abort the session.
pub async fn register_project_alias(store: &Store, cwd: &Path, identity: &str) {
    if !identity.contains('/') {
        return;
    }
    let basename = basename_identity(cwd);
    if basename == identity || basename == UNKNOWN_PROJECT {
        return;
    }
    if let Err(e) = store
        .register_alias(&basename, identity, claude_mem_schema::epoch_millis_now())
        .await
    {
        warn!(basename, identity, error = %e, "alias registration failed");
    }
}

/// Walk up from `cwd` looking for a `.git` entry. A plain file (worktrees
/// and submodules write `gitdir: …`) counts the same as a directory; git
/// itself resolves the indirection when we shell out.
fn find_git_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = Some(cwd);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

fn list_remotes(root: &Path) -> Option<Vec<(String, String)>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["remote", "-v"])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!(root = %root.display(), "git remote -v failed");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_remote_output(&text))
}

/// Parse `git remote -v` output into ordered `(name, fetch-url)` pairs.
pub(crate) fn parse_remote_output(text: &str) -> Vec<(String, String)> {
    let mut remotes = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
            continue;
        };
        if parts.next() != Some("(fetch)") {
            continue;
        }
        if !remotes.iter().any(|(n, _): &(String, String)| n == name) {
            remotes.push((name.to_string(), url.to_string()));
        }
    }
    remotes
}

/// Prefer remotes by configured order, else take the first one listed.
pub(crate) fn pick_remote(remotes: &[(String, String)], order: &[String]) -> Option<String> {
    for preferred in order {
        if let Some((_, url)) = remotes.iter().find(|(name, _)| name == preferred) {
            return Some(url.clone());
        }
    }
    remotes.first().map(|(_, url)| url.clone())
}

/// Normalize a remote URL to `host/path`.
pub(crate) fn normalize_remote_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let stripped = if let Some((_scheme, rest)) = url.split_once("://") {
        // https://github.com/u/r.git, ssh://git@github.com:22/u/r
        let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
        let (host, path) = rest.split_once('/')?;
        let host = host.split_once(':').map_or(host, |(h, _port)| h);
        format!("{host}/{}", path.trim_matches('/'))
    } else if let Some((host_part, path)) = url.split_once(':') {
        // scp-like: git@github.com:u/r.git
        let host = host_part.rsplit_once('@').map_or(host_part, |(_, h)| h);
        format!("{host}/{}", path.trim_matches('/'))
    } else {
        return None;
    };

    let identity = stripped.trim_end_matches('/').trim_end_matches(".git");
    if identity.is_empty() || !identity.contains('/') {
        return None;
    }
    Some(identity.to_string())
}

fn basename_identity(cwd: &Path) -> String {
    match cwd.file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            #[cfg(windows)]
            {
                if let Some(std::path::Component::Prefix(prefix)) = cwd.components().next() {
                    let raw = prefix.as_os_str().to_string_lossy();
                    if let Some(letter) = raw.chars().next() {
                        if letter.is_ascii_alphabetic() {
                            return format!("drive-{}", letter.to_ascii_lowercase());
                        }
                    }
                }
            }
            UNKNOWN_PROJECT.to_string()
        }
    }
}
