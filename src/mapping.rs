//! Remote/local path pairing

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One mirrored unit: a root directory from the configuration, or a single
/// directory/file discovered while scanning beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathMapping {
    pub game_root: PathBuf,
    pub remote_root: String,
    pub local_relative: PathBuf,
    pub remote_relative: String,
    pub delete_client_files: bool,
    /// `None` until the entry is known to be a file.
    pub file_size: Option<u64>,
}

impl PathMapping {
    /// A root directory mapping, not yet expanded.
    pub fn root(
        game_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        local_relative: impl Into<PathBuf>,
        remote_relative: impl Into<String>,
        delete_client_files: bool,
    ) -> Self {
        Self {
            game_root: game_root.into(),
            remote_root: remote_root.into(),
            local_relative: local_relative.into(),
            remote_relative: remote_relative.into(),
            delete_client_files,
            file_size: None,
        }
    }

    pub fn local_full_path(&self) -> PathBuf {
        self.game_root.join(&self.local_relative)
    }

    pub fn remote_full_path(&self) -> String {
        join_remote(&self.remote_root, &self.remote_relative)
    }

    /// Case-folded key used to compare remote entries against local files.
    pub fn lookup_key(&self) -> String {
        lookup_key(&self.local_full_path())
    }

    /// Mapping for an entry listed inside this directory. `size` is `Some` for
    /// files and `None` for subdirectories.
    pub fn child(&self, name: &str, size: Option<u64>) -> Self {
        Self {
            game_root: self.game_root.clone(),
            remote_root: self.remote_root.clone(),
            local_relative: self.local_relative.join(name),
            remote_relative: join_remote(&self.remote_relative, name),
            delete_client_files: self.delete_client_files,
            file_size: size,
        }
    }
}

/// Case-folded, separator-normalized form of a local path.
pub fn lookup_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

/// Join remote path segments with exactly one `/` between them.
pub fn join_remote(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if base.is_empty() {
        return rest.to_string();
    }
    if rest.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_join_never_doubles_separators() {
        assert_eq!(join_remote("/", "mods"), "/mods");
        assert_eq!(join_remote("/root/", "/mods/A"), "/root/mods/A");
        assert_eq!(join_remote("", "mods"), "mods");
        assert_eq!(join_remote("/root", ""), "/root");
    }

    #[test]
    fn child_extends_both_sides() {
        let root = PathMapping::root("/games/hs2", "/", "mods/Pack", "mods/Pack", true);
        let file = root.child("Thing.zipmod", Some(42));

        assert_eq!(file.local_full_path(), PathBuf::from("/games/hs2/mods/Pack/Thing.zipmod"));
        assert_eq!(file.remote_full_path(), "/mods/Pack/Thing.zipmod");
        assert_eq!(file.file_size, Some(42));
        assert!(file.delete_client_files);
        assert_eq!(root.child("sub", None).file_size, None);
    }

    #[test]
    fn lookup_key_ignores_case() {
        let a = PathMapping::root("/G", "/", "Mods/X.BIN", "mods/x.bin", false);
        let b = PathMapping::root("/g", "/", "mods/x.bin", "mods/x.bin", false);
        assert_eq!(a.lookup_key(), b.lookup_key());
        assert_eq!(lookup_key(Path::new("C:\\Game\\Mods")), "c:/game/mods");
    }
}
