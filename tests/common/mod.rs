//! Support code for tests that drive tool instances in a scratch working
//! tree.
#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, OnceLock};

use anew::{Config, DiagnosticSink, Level, TreePath};

/// The process working directory is global state; tests that enter a root
/// context serialize on this.
fn cwd_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A scratch working tree; the process chdirs into it for the lifetime of
/// this value.
pub struct TestTree {
    dir: tempfile::TempDir,
    previous_cwd: PathBuf,
    _guard: MutexGuard<'static, ()>,
}

impl TestTree {
    pub fn new() -> TestTree {
        let guard = cwd_lock();
        let previous_cwd = std::env::current_dir().expect("cwd");
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join(anew::MANAGEMENT_DIR_NAME)).expect("management dir");
        std::env::set_current_dir(dir.path()).expect("chdir into test tree");
        TestTree {
            dir,
            previous_cwd,
            _guard: guard,
        }
    }

    pub fn path(&self) -> PathBuf {
        std::env::current_dir().expect("cwd")
    }

    /// Write a file, backdating its mtime by a few seconds so it is safely
    /// "in the past" for decisions made right afterwards.  Tests about
    /// mtime behavior adjust timestamps explicitly via [`TestTree::set_mtime`].
    pub fn write(&self, path: &str, content: &[u8]) {
        let p = self.path().join(path);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs");
        }
        std::fs::write(&p, content).expect("write test file");
        let now = filetime::FileTime::now();
        let backdated = filetime::FileTime::from_unix_time(now.unix_seconds() - 3, 0);
        filetime::set_file_mtime(&p, backdated).expect("backdate test file");
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.path().join(path)).expect("read test file")
    }

    pub fn exists(&self, path: &str) -> bool {
        self.path().join(path).exists()
    }

    pub fn mtime(&self, path: &str) -> filetime::FileTime {
        let meta = std::fs::metadata(self.path().join(path)).expect("stat test file");
        filetime::FileTime::from_last_modification_time(&meta)
    }

    pub fn set_mtime(&self, path: &str, mtime: filetime::FileTime) {
        filetime::set_file_mtime(self.path().join(path), mtime).expect("set mtime");
    }
}

impl Drop for TestTree {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous_cwd);
    }
}

/// Sink keeping every emitted diagnostic line for assertions.
#[derive(Default)]
pub struct CapturingSink {
    pub lines: Vec<(Level, String)>,
}

impl DiagnosticSink for CapturingSink {
    fn emit(&mut self, level: Level, _nesting: usize, text: &str, _elapsed_ns: Option<u64>) {
        self.lines.push((level, text.to_string()));
    }
}

pub type SharedSink = Rc<RefCell<CapturingSink>>;

pub fn capturing_sink() -> SharedSink {
    Rc::new(RefCell::new(CapturingSink::default()))
}

pub fn sink_contains(sink: &SharedSink, needle: &str) -> bool {
    sink.borrow().lines.iter().any(|(_, l)| l.contains(needle))
}

/// A root-context configuration wired to a capturing sink.
pub fn config_with_sink(sink: &SharedSink) -> Config {
    Config {
        sink: Some(sink.clone()),
        min_diagnostic_level: Level::Debug,
        ..Config::default()
    }
}

pub fn p(path: &str) -> TreePath {
    TreePath::new(path).expect("test path")
}

pub fn d(path: &str) -> TreePath {
    TreePath::dir(path).expect("test dir path")
}

/// Absolute native path of a managed-tree path, for use inside redo bodies.
pub fn abs(root: &Path, path: &TreePath) -> PathBuf {
    root.join(path.to_native())
}
