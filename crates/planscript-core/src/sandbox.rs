//! Workspace sandbox
//!
//! Every tool-visible path is resolved against the project root; escapes
//! fail loudly before any filesystem access happens. `.git` and
//! `node_modules` are never traversed by SEARCH.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Path rejected by the sandbox. Surfaces with the policy-violation
/// prefix so sandbox escapes grep the same as permission failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("PolicyViolation: absolute path '{0}' is not allowed")]
    AbsolutePath(String),

    #[error("PolicyViolation: path '{0}' escapes the project root")]
    Escape(String),

    #[error("PolicyViolation: invalid project root '{0}': {1}")]
    InvalidRoot(String, String),
}

/// Resolve `path` against `root` and return the absolute canonical join.
/// Fails unless the result is a strict descendant of the root. The target
/// itself does not need to exist; `..` components are resolved lexically
/// and may not climb past the root.
pub fn safe_resolve(root: &Path, path: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(SandboxError::AbsolutePath(path.to_string()));
    }

    let root = root
        .canonicalize()
        .map_err(|e| SandboxError::InvalidRoot(root.display().to_string(), e.to_string()))?;

    let mut resolved = root.clone();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if resolved == root || !resolved.pop() || !resolved.starts_with(&root) {
                    return Err(SandboxError::Escape(path.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::AbsolutePath(path.to_string()));
            }
        }
    }

    if resolved == root || !resolved.starts_with(&root) {
        return Err(SandboxError::Escape(path.to_string()));
    }
    Ok(resolved)
}

/// Whether a root-relative path points into a directory SEARCH must not
/// descend into.
pub fn is_sensitive(relative: &Path) -> bool {
    matches!(
        relative.components().next(),
        Some(Component::Normal(first)) if first == ".git" || first == "node_modules"
    )
}

/// Whether a single path component names a sensitive directory. Used by
/// the SEARCH walker at every depth.
pub fn is_sensitive_component(name: &str) -> bool {
    name == ".git" || name == "node_modules"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolves_under_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = safe_resolve(dir.path(), "src/main.ps").expect("resolve");
        assert!(resolved.starts_with(dir.path().canonicalize().expect("canon")));
        assert!(resolved.ends_with("src/main.ps"));
    }

    #[test]
    fn test_absolute_path_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = safe_resolve(dir.path(), "/etc/passwd").expect_err("must reject");
        assert!(err.to_string().starts_with("PolicyViolation:"));
    }

    #[test]
    fn test_parent_escape_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        for path in ["../outside.txt", "a/../../outside.txt", ".."] {
            let err = safe_resolve(dir.path(), path).expect_err("must reject");
            assert!(
                err.to_string().starts_with("PolicyViolation:"),
                "{} should be a policy violation",
                path
            );
        }
    }

    #[test]
    fn test_internal_parent_components_are_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = safe_resolve(dir.path(), "a/b/../c.txt").expect("resolve");
        assert!(resolved.ends_with("a/c.txt"));
    }

    #[test]
    fn test_root_itself_is_not_a_valid_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(safe_resolve(dir.path(), ".").is_err());
    }

    #[test]
    fn test_sensitive_prefixes() {
        assert!(is_sensitive(Path::new(".git")));
        assert!(is_sensitive(Path::new(".git/config")));
        assert!(is_sensitive(Path::new("node_modules/pkg/index.js")));
        assert!(!is_sensitive(Path::new("src/.gitignore")));
        assert!(!is_sensitive(Path::new("gitlab/ci.yml")));
    }
}
