//! Filesystem helpers shared by recovery writers and source scanners.

use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::error::RecoveryError;

/// Directories never worth descending into when scanning sources.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "venv",
    ".venv",
    "env",
    "__pycache__",
    "target",
    "bin",
    "obj",
    "dist",
    "build",
    "coverage",
    ".idea",
    ".vscode",
];

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Every regular file under `root` whose extension is in `extensions`,
/// in sorted path order. Unreadable entries are skipped.
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| extensions.contains(&ext))
        })
        .map(DirEntry::into_path)
        .collect()
}

/// `true` as soon as one matching source file exists under `root`.
pub fn has_source_file(root: &Path, extensions: &[&str]) -> bool {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(Result::ok)
        .any(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| extensions.contains(&ext))
        })
}

/// Files under `root` named exactly one of `names`, in sorted path order.
pub fn find_named(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().is_some_and(|n| names.contains(&n)))
        .map(DirEntry::into_path)
        .collect()
}

/// Copy `src` into `backup_dir` as `<name>.bak.<UTC timestamp>` and flush it
/// to disk. Returns `Ok(None)` when `src` does not exist.
///
/// An existing backup is never overwritten: same-named sources backed up
/// within one timestamp tick get a `.<n>` suffix.
pub fn backup_file(src: &Path, backup_dir: &Path) -> Result<Option<PathBuf>, RecoveryError> {
    if !src.exists() {
        return Ok(None);
    }
    std::fs::create_dir_all(backup_dir).map_err(|source| RecoveryError::BackupDir {
        path: backup_dir.to_path_buf(),
        source,
    })?;

    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let base = format!("{}.bak.{}", name, ts);

    let backup_err = |source| RecoveryError::Backup {
        path: src.to_path_buf(),
        source,
    };
    let mut input = std::fs::File::open(src).map_err(backup_err)?;
    let (dst, mut output) = create_unique(backup_dir, &base).map_err(backup_err)?;
    std::io::copy(&mut input, &mut output).map_err(backup_err)?;
    output.sync_all().map_err(backup_err)?;
    Ok(Some(dst))
}

/// Create `dir/base`, or `dir/base.<n>` for the first free `n`.
fn create_unique(dir: &Path, base: &str) -> std::io::Result<(PathBuf, std::fs::File)> {
    let mut n = 0usize;
    loop {
        let candidate = if n == 0 {
            dir.join(base)
        } else {
            dir.join(format!("{}.{}", base, n))
        };
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Replace `path` with `contents` via a temp file in the same directory,
/// so a failure never leaves a partially written manifest.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), RecoveryError> {
    let write_err = |source| RecoveryError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Backup-then-write: the backup must succeed before the manifest changes.
pub fn replace_manifest(
    path: &Path,
    contents: &str,
    backup_dir: &Path,
) -> Result<Option<PathBuf>, RecoveryError> {
    let backup = backup_file(path, backup_dir)?;
    write_atomic(path, contents)?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_then_write() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("go.mod");
        std::fs::write(&manifest, "module old\n").unwrap();
        let backups = dir.path().join("backups");

        let backup = replace_manifest(&manifest, "module new\n", &backups)
            .unwrap()
            .unwrap();

        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "module old\n");
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), "module new\n");
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("go.mod.bak."));
    }

    #[test]
    fn test_same_named_backups_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        for module in ["app", "lib", "core"] {
            let gradle = dir.path().join(module).join("build.gradle");
            std::fs::create_dir_all(gradle.parent().unwrap()).unwrap();
            std::fs::write(&gradle, format!("// {}\n", module)).unwrap();
            backup_file(&gradle, &backups).unwrap().unwrap();
        }

        let mut contents: Vec<String> = std::fs::read_dir(&backups)
            .unwrap()
            .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["// app\n", "// core\n", "// lib\n"]);
    }

    #[test]
    fn test_create_unique_adds_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = create_unique(dir.path(), "pom.xml.bak.x").unwrap();
        let (second, _) = create_unique(dir.path(), "pom.xml.bak.x").unwrap();
        assert_eq!(first, dir.path().join("pom.xml.bak.x"));
        assert_eq!(second, dir.path().join("pom.xml.bak.x.1"));
    }

    #[test]
    fn test_no_backup_for_new_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Gemfile");
        let backup = replace_manifest(&manifest, "gem \"rails\"\n", &dir.path().join("b")).unwrap();
        assert!(backup.is_none());
        assert!(manifest.exists());
    }

    #[test]
    fn test_failed_backup_leaves_original() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("package.json");
        std::fs::write(&manifest, "{}").unwrap();
        // A regular file where the backup directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let err = replace_manifest(&manifest, "{\"x\":1}", &blocker.join("sub")).unwrap_err();

        assert!(matches!(err, RecoveryError::BackupDir { .. }));
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), "{}");
    }

    #[test]
    fn test_source_files_skip_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("src/a.js"), "").unwrap();
        std::fs::write(dir.path().join("node_modules/x/b.js"), "").unwrap();
        std::fs::write(dir.path().join("src/c.txt"), "").unwrap();

        let files = source_files(dir.path(), &["js"]);
        assert_eq!(files, vec![dir.path().join("src/a.js")]);
        assert!(has_source_file(dir.path(), &["js"]));
        assert!(!has_source_file(dir.path(), &["py"]));
    }
}
