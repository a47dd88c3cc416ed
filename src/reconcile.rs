//! Remote/local comparison
//!
//! Walks each local root and strikes every local file that already matches a
//! scanned remote file off the remote map. Whatever stays in the map must be
//! downloaded; local files with no match are deletion candidates when their
//! root allows it.

use crate::chunk::FileDownload;
use crate::error::{Result, SyncError};
use crate::mapping::{lookup_key, PathMapping};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Maps a local file that is a deliberately altered copy of a remote file
/// (for example a disabled plugin) to the path of the original.
pub trait VariantRule: Send + Sync {
    fn counterpart(&self, path: &Path) -> Option<PathBuf>;
}

/// `name.ext.disabled` stands in for `name.ext`.
#[derive(Debug, Clone)]
pub struct DisabledSuffix {
    suffix: String,
}

impl DisabledSuffix {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for DisabledSuffix {
    fn default() -> Self {
        Self::new(".disabled")
    }
}

impl VariantRule for DisabledSuffix {
    fn counterpart(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        if name.len() <= self.suffix.len() {
            return None;
        }
        let (stem, tail) = name.split_at(name.len() - self.suffix.len());
        if tail.eq_ignore_ascii_case(&self.suffix) {
            Some(path.with_file_name(stem))
        } else {
            None
        }
    }
}

/// A local file slated for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Sorted by local path.
    pub downloads: Vec<FileDownload>,
    pub deletions: Vec<LocalFile>,
    /// Local files that already match the remote side.
    pub up_to_date: usize,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.downloads.is_empty() && self.deletions.is_empty()
    }

    pub fn download_bytes(&self) -> u64 {
        self.downloads.iter().map(|d| d.total_size).sum()
    }
}

pub struct Reconciler {
    chunk_size: u32,
    variant_rule: Option<Box<dyn VariantRule>>,
}

impl Reconciler {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            variant_rule: None,
        }
    }

    pub fn with_variant_rule(mut self, rule: impl VariantRule + 'static) -> Self {
        self.variant_rule = Some(Box::new(rule));
        self
    }

    /// Compare `remote` (keyed by lookup key) against the files under `roots`.
    pub fn reconcile(
        &self,
        mut remote: HashMap<String, PathMapping>,
        roots: &[PathMapping],
    ) -> Result<Reconciliation> {
        let mut plan = Reconciliation::default();
        // Keys already matched, so nested roots do not see their files twice.
        let mut claimed: HashSet<String> = HashSet::new();
        let mut doomed: HashSet<PathBuf> = HashSet::new();

        for root in roots {
            for local in enumerate_root(&root.local_full_path())? {
                let key = lookup_key(&local.path);
                if claimed.contains(&key) {
                    continue;
                }
                if remote.get(&key).and_then(|m| m.file_size) == Some(local.size) {
                    remote.remove(&key);
                    claimed.insert(key);
                    plan.up_to_date += 1;
                    continue;
                }
                if let Some(original) = self.variant_key(&local.path) {
                    if remote.remove(&original).is_some() {
                        claimed.insert(original);
                        claimed.insert(key);
                        plan.up_to_date += 1;
                        continue;
                    }
                }
                if root.delete_client_files && doomed.insert(local.path.clone()) {
                    plan.deletions.push(local);
                }
            }
        }

        let mut pending: Vec<PathMapping> = remote.into_values().collect();
        pending.sort_by_key(PathMapping::local_full_path);
        plan.downloads = pending
            .iter()
            .map(|m| FileDownload::from_mapping(m, self.chunk_size))
            .collect::<Result<_>>()?;
        Ok(plan)
    }

    fn variant_key(&self, path: &Path) -> Option<String> {
        let rule = self.variant_rule.as_ref()?;
        rule.counterpart(path).map(|p| lookup_key(&p))
    }
}

/// Every regular file under `root` in file-name order. A missing root is empty.
pub fn enumerate_root(root: &Path) -> Result<Vec<LocalFile>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"));
            SyncError::local_io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| SyncError::local_io(entry.path(), io::Error::other(e.to_string())))?
            .len();
        files.push(LocalFile {
            path: entry.into_path(),
            size,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DEFAULT_CHUNK_SIZE;
    use std::fs;

    struct Tree {
        _tmp: tempfile::TempDir,
        game: PathBuf,
    }

    impl Tree {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let game = tmp.path().join("game");
            fs::create_dir_all(&game).unwrap();
            Self { _tmp: tmp, game }
        }

        fn write(&self, rel: &str, len: usize) {
            let path = self.game.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, vec![b'x'; len]).unwrap();
        }

        fn root(&self, rel: &str, delete: bool) -> PathMapping {
            PathMapping::root(&self.game, "/", rel, rel, delete)
        }
    }

    fn remote_of(files: &[PathMapping]) -> HashMap<String, PathMapping> {
        files.iter().map(|m| (m.lookup_key(), m.clone())).collect()
    }

    fn names(plan: &Reconciliation) -> (Vec<String>, Vec<String>) {
        let name = |p: &Path| p.file_name().unwrap().to_string_lossy().into_owned();
        let downloads = plan.downloads.iter().map(|d| name(&d.local_path)).collect();
        let deletions = plan.deletions.iter().map(|f| name(&f.path)).collect();
        (downloads, deletions)
    }

    #[test]
    fn stale_files_are_deleted_only_where_allowed() {
        let tree = Tree::new();
        tree.write("mods/A/f1.bin", 4);
        tree.write("mods/A/f3.bin", 2);
        tree.write("UserData/mine.png", 9);
        let mods = tree.root("mods", true);
        let user = tree.root("UserData", false);
        let remote = remote_of(&[mods.child("A", None).child("f1.bin", Some(4))]);

        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[mods, user])
            .unwrap();
        let (downloads, deletions) = names(&plan);
        assert!(downloads.is_empty());
        assert_eq!(deletions, vec!["f3.bin"]);
        assert_eq!(plan.deletions[0].size, 2);
        assert_eq!(plan.up_to_date, 1);
    }

    #[test]
    fn size_mismatch_downloads_and_replaces() {
        let tree = Tree::new();
        tree.write("mods/f.bin", 3);
        let mods = tree.root("mods", true);
        let remote = remote_of(&[mods.child("f.bin", Some(10))]);

        let plan = Reconciler::new(4).reconcile(remote, &[mods]).unwrap();
        let (downloads, deletions) = names(&plan);
        assert_eq!(downloads, vec!["f.bin"]);
        assert_eq!(deletions, vec!["f.bin"]);
        assert_eq!(plan.downloads[0].chunks.len(), 3);
        assert_eq!(plan.download_bytes(), 10);
    }

    #[test]
    fn matching_tree_is_a_noop() {
        let tree = Tree::new();
        tree.write("mods/a.bin", 1);
        tree.write("mods/sub/b.bin", 0);
        let mods = tree.root("mods", true);
        let remote = remote_of(&[
            mods.child("a.bin", Some(1)),
            mods.child("sub", None).child("b.bin", Some(0)),
        ]);
        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[mods])
            .unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.up_to_date, 2);
    }

    #[test]
    fn case_differences_still_match() {
        let tree = Tree::new();
        tree.write("mods/Plugin.DLL", 5);
        let mods = tree.root("mods", true);
        let remote = remote_of(&[mods.child("plugin.dll", Some(5))]);
        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[mods])
            .unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn missing_root_downloads_everything() {
        let tree = Tree::new();
        let mods = tree.root("mods", true);
        let remote = remote_of(&[mods.child("b.bin", Some(2)), mods.child("a.bin", Some(1))]);
        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[mods])
            .unwrap();
        let (downloads, deletions) = names(&plan);
        assert_eq!(downloads, vec!["a.bin", "b.bin"]);
        assert!(deletions.is_empty());
    }

    #[test]
    fn disabled_variant_satisfies_its_original_at_any_size() {
        let tree = Tree::new();
        tree.write("BepInEx/plugins/x.dll.disabled", 7);
        let plugins = tree.root("BepInEx/plugins", true);
        let remote = remote_of(&[plugins.child("x.dll", Some(100))]);

        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .with_variant_rule(DisabledSuffix::default())
            .reconcile(remote.clone(), &[plugins.clone()])
            .unwrap();
        assert!(plan.is_noop());

        // Without the rule the disabled copy is just a stray file.
        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[plugins])
            .unwrap();
        let (downloads, deletions) = names(&plan);
        assert_eq!(downloads, vec!["x.dll"]);
        assert_eq!(deletions, vec!["x.dll.disabled"]);
    }

    #[test]
    fn enabled_file_supersedes_its_disabled_copy() {
        let tree = Tree::new();
        tree.write("plugins/x.dll", 100);
        tree.write("plugins/x.dll.disabled", 7);
        let plugins = tree.root("plugins", true);
        let remote = remote_of(&[plugins.child("x.dll", Some(100))]);

        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .with_variant_rule(DisabledSuffix::default())
            .reconcile(remote, &[plugins])
            .unwrap();
        let (downloads, deletions) = names(&plan);
        assert!(downloads.is_empty());
        assert_eq!(deletions, vec!["x.dll.disabled"]);
    }

    #[test]
    fn nested_roots_do_not_double_count() {
        let tree = Tree::new();
        tree.write("mods/Sideloader/s.zipmod", 3);
        let outer = tree.root("mods", true);
        let inner = tree.root("mods/Sideloader", true);
        let remote = remote_of(&[inner.child("s.zipmod", Some(3))]);
        let plan = Reconciler::new(DEFAULT_CHUNK_SIZE)
            .reconcile(remote, &[outer, inner])
            .unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn disabled_suffix_parsing() {
        let rule = DisabledSuffix::default();
        assert_eq!(
            rule.counterpart(Path::new("/p/a.dll.DISABLED")),
            Some(PathBuf::from("/p/a.dll"))
        );
        assert_eq!(rule.counterpart(Path::new("/p/a.dll")), None);
        assert_eq!(rule.counterpart(Path::new("/p/.disabled")), None);
    }
}
