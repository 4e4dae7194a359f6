//! Path normalization.
//!
//! Paths are absolute and `/` separated. Normalization collapses repeated
//! separators, resolves `.` and `..` (`..` at the root stays at the root),
//! and rejects NUL bytes and over-long components.

use crate::error::FsError;
use crate::fs::dir::MAX_NAME_LEN;

/// Splits an absolute path into normalized components.
pub fn normalize(path: &str) -> Result<Vec<String>, FsError> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath {
            path: path.into(),
            reason: "path must be absolute".into(),
        });
    }
    if path.contains('\0') {
        return Err(FsError::InvalidPath {
            path: path.into(),
            reason: "path contains NUL".into(),
        });
    }
    let mut components: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => {
                if name.len() > MAX_NAME_LEN {
                    return Err(FsError::InvalidPath {
                        path: path.into(),
                        reason: format!("component longer than {MAX_NAME_LEN} bytes"),
                    });
                }
                components.push(name.to_string());
            }
        }
    }
    Ok(components)
}

/// Splits a path into its parent's components and the leaf name.
/// The root itself has no leaf and is rejected.
pub fn split_parent(path: &str) -> Result<(Vec<String>, String), FsError> {
    let mut components = normalize(path)?;
    match components.pop() {
        Some(leaf) => Ok((components, leaf)),
        None => Err(FsError::InvalidPath {
            path: path.into(),
            reason: "the root directory has no parent entry".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_separators() {
        assert_eq!(normalize("/a//b///c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(normalize("/").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_normalize_resolves_dots() {
        assert_eq!(normalize("/a/./b/../c").unwrap(), vec!["a", "c"]);
        assert_eq!(normalize("/../a").unwrap(), vec!["a"]);
    }

    #[test]
    fn test_relative_paths_rejected() {
        assert!(matches!(normalize("a/b"), Err(FsError::InvalidPath { .. })));
        assert!(matches!(normalize(""), Err(FsError::InvalidPath { .. })));
    }

    #[test]
    fn test_nul_rejected() {
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn test_split_parent() {
        let (parent, leaf) = split_parent("/a/b/c").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(leaf, "c");
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_overlong_component_rejected() {
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(normalize(&long).is_err());
    }
}
