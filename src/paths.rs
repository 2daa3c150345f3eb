//! Canonical path resolution for lock-registry keys.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` to the canonical form used as a lock-registry key.
///
/// Locks are routinely taken on files that do not exist yet, so when
/// full canonicalization fails the nearest existing ancestor is
/// canonicalized instead and the file name re-appended, falling back to
/// a lexical cleanup of the absolute path.
pub(crate) fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    if let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) {
        if let Ok(resolved_parent) = parent.canonicalize() {
            return resolved_parent.join(name);
        }
    }

    normalize_lexically(&absolute)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn existing_path_is_fully_canonicalized() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("value.bin");
        std::fs::write(&file, b"x").unwrap();

        let key = canonical_key(&file);
        assert_eq!(key, file.canonicalize().unwrap());
    }

    #[test]
    fn missing_file_keys_through_its_parent() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-yet-created");

        let key = canonical_key(&missing);
        assert_eq!(
            key,
            dir.path().canonicalize().unwrap().join("not-yet-created")
        );
    }

    #[test]
    fn dot_segments_do_not_change_the_key() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("file.txt");
        let dotted = dir.path().join(".").join("file.txt");

        assert_eq!(canonical_key(&plain), canonical_key(&dotted));
    }

    #[test]
    fn lexical_fallback_resolves_parent_segments() {
        let path = Path::new("/no/such/root/a/../b");
        assert_eq!(normalize_lexically(path), PathBuf::from("/no/such/root/b"));
    }
}
