//! The management tree: discovery and locking of a working tree, the mtime
//! probe, scratch temporaries, and filesystem manipulation helpers.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::{io_error_to_line, Error, Result};
use crate::fs::{kind_of_mode, FsKind};
use crate::path::TreePath;
use crate::rundb;

/// A directory containing a directory with this name is a working tree.
pub const MANAGEMENT_DIR_NAME: &str = ".anewroot";

/// Regular file inside the management tree used solely for mtime sampling.
pub const MTIME_PROBE_FILE_NAME: &str = "o";

pub const LOCK_DIR_NAME: &str = "lock";
pub const TEMPORARY_DIR_NAME: &str = "t";

pub fn rundb_filename() -> String {
    format!(
        "runs-{}.{}.sqlite",
        rundb::SCHEMA_VERSION.0,
        rundb::SCHEMA_VERSION.1
    )
}

fn kind_of(path: &Path) -> std::io::Result<FsKind> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => Ok(kind_of_mode(std::os::unix::fs::MetadataExt::mode(&meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FsKind::Absent),
        Err(e) => Err(e),
    }
}

/// Check that the process working directory is a working-tree root: its
/// resolved form is itself (no symlink components) and it contains the
/// management directory (not as a symlink).
pub fn checked_root_path_from_cwd() -> Result<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| {
        Error::NoWorkingTree(format!(
            "current directory is unusable\n  | reason: {}",
            io_error_to_line(&e)
        ))
    })?;

    match cwd.canonicalize() {
        Ok(real) if real == cwd => {}
        _ => {
            return Err(Error::NoWorkingTree(
                "supposedly equivalent forms of the current directory's path point to \
                 different filesystem objects\n\
                 \x20 | reason: unresolved symbolic links or a moved directory\n\
                 \x20 | try again?"
                    .to_string(),
            ))
        }
    }

    let msg = || {
        Error::NoWorkingTree(format!(
            "current directory is no working tree: {:?}\n\
             \x20 | reason: does not contain a directory {:?} (that is not a symbolic link)",
            cwd.display().to_string(),
            MANAGEMENT_DIR_NAME
        ))
    };
    match kind_of(&cwd.join(MANAGEMENT_DIR_NAME)) {
        Ok(FsKind::Directory) => Ok(cwd),
        _ => Err(msg()),
    }
}

/// Take the lock directory.  At most one root context may be active on a
/// working tree across all processes.
pub fn lock_working_tree(root: &Path) -> Result<()> {
    let lock_path = root.join(MANAGEMENT_DIR_NAME).join(LOCK_DIR_NAME);
    let attempt = || -> std::io::Result<()> {
        match kind_of(&lock_path)? {
            FsKind::Absent | FsKind::Directory => {}
            _ => remove_filesystem_object(&lock_path, None, true)?,
        }
        std::fs::create_dir(&lock_path)
    };
    attempt().map_err(|e| {
        Error::ManagementTree(format!(
            "cannot acquire lock for exclusive access to working tree {:?}\n\
             \x20 | reason: {}\n\
             \x20 | to break the lock (if you are sure no other process is using this \
             working tree): remove {:?}",
            root.display().to_string(),
            io_error_to_line(&e),
            lock_path.display().to_string()
        ))
    })
}

pub fn unlock_working_tree(root: &Path) -> Result<()> {
    let lock_path = root.join(MANAGEMENT_DIR_NAME).join(LOCK_DIR_NAME);
    std::fs::remove_dir(&lock_path).map_err(|e| {
        Error::ManagementTree(format!(
            "cannot release working tree lock {:?}\n  | reason: {}",
            lock_path.display().to_string(),
            io_error_to_line(&e)
        ))
    })
}

/// Prepare a locked working tree: fresh scratch directory, fresh mtime
/// probe, opened run-database.  Returns the probe (opened for writing), the
/// database, and whether the filesystem is case-sensitive.
pub fn prepare_locked_working_tree(
    root: &Path,
    max_dependency_age: std::time::Duration,
) -> Result<(UniquePathProvider, File, rundb::Database, bool)> {
    let management = root.join(MANAGEMENT_DIR_NAME);
    let temp_root = management.join(TEMPORARY_DIR_NAME);
    let rundb_path = management.join(rundb_filename());

    let io_step = || -> std::io::Result<(File, bool)> {
        remove_filesystem_object(&temp_root, None, true)?;
        std::fs::create_dir(&temp_root)?;

        if !matches!(kind_of(&rundb_path)?, FsKind::Regular | FsKind::Absent) {
            remove_filesystem_object(&rundb_path, None, true)?;
        }

        // A fresh probe file, never a link to an existing one.
        let probe_path = management.join(MTIME_PROBE_FILE_NAME);
        let probe_upper_path = management.join(MTIME_PROBE_FILE_NAME.to_uppercase());
        remove_filesystem_object(&probe_path, None, true)?;
        remove_filesystem_object(&probe_upper_path, None, true)?;
        let probe = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&probe_path)?;

        // If the lower-case probe is reachable under its upper-case name,
        // the filesystem is case-insensitive.
        let case_sensitive = kind_of(&probe_upper_path)? == FsKind::Absent;
        Ok((probe, case_sensitive))
    };

    let (probe, case_sensitive) = io_step().map_err(|e| {
        Error::ManagementTree(format!(
            "failed to setup management tree for {:?}\n  | reason: {}",
            root.display().to_string(),
            io_error_to_line(&e)
        ))
    })?;

    let db = rundb::Database::open(
        &rundb_path,
        max_dependency_age,
        &format!(
            "if you suspect database corruption, remove the run-database file: {:?}",
            rundb_path.display().to_string()
        ),
    )
    .map_err(|e| Error::ManagementTree(e.to_string()))?;

    let provider = UniquePathProvider::new(&temp_root);
    Ok((provider, probe, db, case_sensitive))
}

/// Update the mtime of the probe file and report it.
pub fn probe_tree_time_ns(probe: &mut File) -> std::io::Result<i64> {
    use std::io::Seek;
    probe.seek(std::io::SeekFrom::Start(0))?;
    probe.write_all(b"0")?;
    let meta = probe.metadata()?;
    Ok(crate::fs::mtime_ns_of(&meta))
}

/// Generates paths unique within one root context, all directly below the
/// scratch directory.  Generated names start with a lower-case letter and
/// use only lower-case letters and digits, so they stay unique on
/// case-insensitive filesystems.
pub struct UniquePathProvider {
    root: PathBuf,
    counter: u64,
}

const FIRST_CHARACTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const CHARACTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

impl UniquePathProvider {
    pub fn new(root: &Path) -> UniquePathProvider {
        UniquePathProvider {
            root: root.to_path_buf(),
            counter: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The next unique name.  A non-empty prefix must consist of lower-case
    /// letters and digits and start with a letter; a non-empty suffix must
    /// start with punctuation.  Neither may contain a path separator.
    pub fn generate(&mut self, prefix: &str, suffix: &str) -> Result<PathBuf> {
        if !prefix.is_empty() {
            let valid = prefix.chars().next().unwrap().is_ascii_lowercase()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !valid {
                return Err(Error::ManagementTree(format!(
                    "non-empty 'prefix' must consist of lower-case letters and digits and \
                     start with a letter: {:?}",
                    prefix
                )));
            }
        }
        if !suffix.is_empty() {
            let first = suffix.chars().next().unwrap();
            if !first.is_ascii_punctuation() {
                return Err(Error::ManagementTree(format!(
                    "non-empty 'suffix' must start with a punctuation character, \
                     not {:?}",
                    first
                )));
            }
            if suffix.contains('/') {
                return Err(Error::ManagementTree(format!(
                    "'suffix' must not contain '/': {:?}",
                    suffix
                )));
            }
        }

        let mut i = self.counter;
        let mut name = prefix.to_string();
        name.push(FIRST_CHARACTERS[(i % 26) as usize] as char);
        i /= 26;
        while i > 0 {
            i -= 1;
            name.push(CHARACTERS[(i % 36) as usize] as char);
            i /= 36;
        }
        name.push_str(suffix);

        self.counter += 1;
        Ok(self.root.join(name))
    }
}

/// A scratch file or directory below the management tree, removed when the
/// guard drops.  Permissions are restricted to the owning user.
pub struct Temporary {
    abs_path: PathBuf,
    tree_path: TreePath,
    is_dir: bool,
}

impl Temporary {
    pub(crate) fn create(
        provider: &mut UniquePathProvider,
        root: &Path,
        prefix: &str,
        suffix: &str,
        is_dir: bool,
    ) -> Result<Temporary> {
        let abs_path = provider.generate(prefix, suffix)?;
        let create = || -> std::io::Result<()> {
            if is_dir {
                std::fs::DirBuilder::new().mode(0o700).create(&abs_path)
            } else {
                std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&abs_path)
                    .map(|_| ())
            }
        };
        create().map_err(|e| {
            Error::ManagementTree(format!(
                "failed to create temporary in management tree\n  | reason: {}",
                io_error_to_line(&e)
            ))
        })?;

        let rel = abs_path
            .strip_prefix(root)
            .expect("temporary lies below the working tree root");
        let rel_str = rel.to_string_lossy();
        let tree_path = if is_dir {
            TreePath::dir(&rel_str)
        } else {
            TreePath::new(&rel_str)
        }
        .expect("generated temporary name is a valid path");

        Ok(Temporary {
            abs_path,
            tree_path,
            is_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.abs_path
    }

    /// The temporary as a working-tree path (below the management tree).
    pub fn tree_path(&self) -> &TreePath {
        &self.tree_path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

impl Drop for Temporary {
    fn drop(&mut self) {
        let _ = remove_filesystem_object(&self.abs_path, None, true);
    }
}

/// Remove a filesystem object of any kind.
///
/// A symbolic link is removed, not its target.  A non-empty directory is
/// first moved into `via_empty_dir` (when given, which must be an empty
/// writable directory on the same filesystem) so the visible removal is
/// atomic; removal of the moved-away content then happens best-effort.
pub fn remove_filesystem_object(
    abs_path: &Path,
    via_empty_dir: Option<&Path>,
    ignore_non_existent: bool,
) -> std::io::Result<()> {
    match std::fs::remove_file(abs_path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if ignore_non_existent {
                return Ok(());
            }
            return Err(e);
        }
        Err(_) => {
            // Possibly a directory (reported as IsADirectory or
            // PermissionError depending on the platform).
            if !abs_path.is_dir() {
                return std::fs::remove_file(abs_path);
            }
        }
    }

    match std::fs::remove_dir(abs_path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    // A non-empty directory.
    match via_empty_dir {
        None => std::fs::remove_dir_all(abs_path),
        Some(empty_dir) => {
            let moved = empty_dir.join("t");
            match std::fs::rename(abs_path, &moved) {
                Ok(()) => {
                    let _ = std::fs::remove_dir_all(&moved);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && ignore_non_existent => {
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Read as many bytes as available, retrying short reads.
fn fill_buffer(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Byte-wise comparison of two regular files.
pub fn files_have_same_content(a: &Path, b: &Path) -> std::io::Result<bool> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let na = fill_buffer(&mut fa, &mut ba)?;
        let nb = fill_buffer(&mut fb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_path_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = UniquePathProvider::new(dir.path());

        let first = provider.generate("", "").unwrap();
        assert_eq!(first.file_name().unwrap(), "a");
        let second = provider.generate("", ".o").unwrap();
        assert_eq!(second.file_name().unwrap(), "b.o");
        let third = provider.generate("obj", ".o").unwrap();
        assert_eq!(third.file_name().unwrap(), "objc.o");

        // Many generated names stay unique.
        let mut seen = std::collections::HashSet::new();
        seen.insert(first);
        seen.insert(second);
        seen.insert(third);
        for _ in 0..100 {
            assert!(seen.insert(provider.generate("", "").unwrap()));
        }

        assert!(provider.generate("", "x").is_err());
        assert!(provider.generate("", ".a/b").is_err());
        assert!(provider.generate("Obj", "").is_err());
        assert!(provider.generate("1obj", "").is_err());
    }

    #[test]
    fn temporary_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join(".anewroot").join("t");
        std::fs::create_dir_all(&scratch).unwrap();
        let mut provider = UniquePathProvider::new(&scratch);

        let file_path;
        {
            let tmp =
                Temporary::create(&mut provider, root.path(), "", ".tmp", false).unwrap();
            file_path = tmp.path().to_path_buf();
            assert!(file_path.is_file());
            assert!(tmp.tree_path().as_str().starts_with(".anewroot/t/"));
        }
        assert!(!file_path.exists());

        let dir_path;
        {
            let tmp = Temporary::create(&mut provider, root.path(), "", "", true).unwrap();
            dir_path = tmp.path().to_path_buf();
            assert!(dir_path.is_dir());
            assert!(tmp.tree_path().is_dir());
        }
        assert!(!dir_path.exists());
    }

    #[test]
    fn remove_any_kind() {
        let dir = tempfile::tempdir().unwrap();

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        remove_filesystem_object(&file, None, false).unwrap();
        assert!(!file.exists());

        let tree = dir.path().join("d");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/f"), b"x").unwrap();
        remove_filesystem_object(&tree, None, false).unwrap();
        assert!(!tree.exists());

        assert!(remove_filesystem_object(&file, None, false).is_err());
        remove_filesystem_object(&file, None, true).unwrap();
    }

    #[test]
    fn same_content_check() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"hello").unwrap();
        assert!(files_have_same_content(&a, &b).unwrap());
        std::fs::write(&b, b"hellO").unwrap();
        assert!(!files_have_same_content(&a, &b).unwrap());
        std::fs::write(&b, b"hello world").unwrap();
        assert!(!files_have_same_content(&a, &b).unwrap());
    }

    #[test]
    fn locking() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(MANAGEMENT_DIR_NAME)).unwrap();

        lock_working_tree(root.path()).unwrap();
        assert!(matches!(
            lock_working_tree(root.path()),
            Err(Error::ManagementTree(_))
        ));
        unlock_working_tree(root.path()).unwrap();
        lock_working_tree(root.path()).unwrap();
        unlock_working_tree(root.path()).unwrap();
    }
}
