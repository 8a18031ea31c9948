//! Execution contexts.
//!
//! A root context owns everything a run needs: the validated working-tree
//! root, the run-database, the mtime probe ("working-tree time"), the
//! scratch area, the executor for redo tasks, and the environment-variable
//! and helper dictionaries.  Nested contexts narrow or locally extend the
//! dictionaries and carry their own pending-redo bound.  Contexts nest
//! strictly LIFO; the handles live on a thread-local stack.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use regex::Regex;
use rustc_hash::FxHashMap;

use crate::diag::{self, ConsoleSink, DiagnosticSink, Level, LevelConfig};
use crate::error::{io_error_to_line, Error, Result};
use crate::path::TreePath;
use crate::run::RunResult;
use crate::rundb::{Database, RunSummary};
use crate::seq::{Driver, Sequencer};
use crate::worktree::{self, Temporary, UniquePathProvider};

/// Configuration of a root context.  Threaded explicitly instead of being
/// process-wide state.
pub struct Config {
    /// Bound on simultaneously pending redos started in the root context.
    pub max_parallel_redo_count: usize,
    /// Whether helpers not registered explicitly are searched in the
    /// executable search paths.  `None` means yes.
    pub find_helpers: Option<bool>,
    /// Run-database records older than this are purged at entry.
    pub max_dependency_age: Duration,
    /// When > 0, a summary of the latest runs is reported at exit.
    pub run_summary_max_count: usize,
    pub levels: LevelConfig,
    pub min_diagnostic_level: Level,
    /// Defaults to a [`ConsoleSink`].
    pub sink: Option<Rc<RefCell<dyn DiagnosticSink>>>,
    /// Whether helper processes inherit stdout/stderr when a redo body does
    /// not say otherwise.
    pub helper_output_inherited_by_default: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_parallel_redo_count: 1,
            find_helpers: None,
            max_dependency_age: Duration::from_secs(30 * 24 * 3600),
            run_summary_max_count: 0,
            levels: LevelConfig::default(),
            min_diagnostic_level: Level::Info,
            sink: None,
            helper_output_inherited_by_default: true,
        }
    }
}

/// Configuration of a nested context.
#[derive(Default)]
pub struct ContextOptions {
    /// Defaults to 1 (not inherited).
    pub max_parallel_redo_count: Option<usize>,
    /// Defaults to the root context's setting.  May not re-enable finding
    /// when the root disabled it.
    pub find_helpers: Option<bool>,
}

pub(crate) struct EnvDict {
    pub(crate) values: BTreeMap<String, String>,
    /// Validation pattern per imported name: source and anchored regex.
    patterns: FxHashMap<String, (String, Regex)>,
}

pub(crate) struct RootSpecifics {
    root_path: PathBuf,
    pub(crate) driver: Driver,
    rundb: RefCell<Option<Database>>,
    mtime_probe: RefCell<Option<File>>,
    temp_provider: RefCell<UniquePathProvider>,
    executable_search_paths: Vec<PathBuf>,
    implicit_helpers: RefCell<FxHashMap<TreePath, PathBuf>>,
    case_sensitive: bool,
    /// Snapshot of the process environment at entry.
    top_env: BTreeMap<String, String>,
    nonredo_runs: Cell<u64>,
    redo_runs: Cell<u64>,
    pub(crate) levels: LevelConfig,
    run_summary_max_count: usize,
    pub(crate) helper_output_inherited_by_default: bool,
    last_probe_ns: Cell<i64>,
    warned_backwards: Cell<bool>,
}

impl RootSpecifics {
    pub(crate) fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub(crate) fn with_db<R>(&self, f: impl FnOnce(&mut Database) -> Result<R>) -> Result<R> {
        let mut guard = self.rundb.borrow_mut();
        let db = guard.as_mut().ok_or(Error::NotRunning)?;
        f(db)
    }

    /// Sample the working-tree time: touch the probe file and read its
    /// mtime.  Backward motion within a run is reported once as a warning.
    pub(crate) fn tree_time_ns(&self) -> Result<i64> {
        let mut guard = self.mtime_probe.borrow_mut();
        let probe = guard.as_mut().ok_or(Error::NotRunning)?;
        let t = worktree::probe_tree_time_ns(probe).map_err(|e| {
            Error::WorkingTreeTime(format!(
                "cannot sample working tree time\n  | reason: {}",
                io_error_to_line(&e)
            ))
        })?;
        if t < self.last_probe_ns.get() && !self.warned_backwards.get() {
            self.warned_backwards.set(true);
            diag::inform(
                "working tree time moved backwards within this run",
                Level::Warning,
            );
        }
        self.last_probe_ns.set(t);
        Ok(t)
    }

    pub(crate) fn register_successful_run(&self, with_redo: bool) {
        if with_redo {
            self.redo_runs.set(self.redo_runs.get() + 1);
        } else {
            self.nonredo_runs.set(self.nonredo_runs.get() + 1);
        }
    }

    pub(crate) fn temporary(&self, prefix: &str, suffix: &str, is_dir: bool) -> Result<Temporary> {
        let mut provider = self.temp_provider.borrow_mut();
        Temporary::create(&mut provider, &self.root_path, prefix, suffix, is_dir)
    }
}

pub(crate) struct ContextData {
    parent: Option<Rc<ContextData>>,
    max_parallel_redo_count: usize,
    find_helpers: bool,
    env: RefCell<EnvDict>,
    explicit_helpers: RefCell<FxHashMap<TreePath, PathBuf>>,
    pub(crate) sequencer: RefCell<Sequencer<Result<RunResult>>>,
    root: Option<RootSpecifics>,
}

thread_local! {
    static CONTEXTS: RefCell<Vec<Rc<ContextData>>> = const { RefCell::new(Vec::new()) };
}

/// The innermost active context.
pub(crate) fn active_data() -> Result<Rc<ContextData>> {
    CONTEXTS
        .with(|c| c.borrow().last().cloned())
        .ok_or(Error::NotRunning)
}

impl ContextData {
    /// The root of this context's chain.
    pub(crate) fn root_rc(self: &Rc<Self>) -> Rc<ContextData> {
        let mut current = self.clone();
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    pub(crate) fn specifics(&self) -> &RootSpecifics {
        self.root
            .as_ref()
            .expect("called on a root context's data")
    }

    pub(crate) fn max_parallel_redo_count(&self) -> usize {
        self.max_parallel_redo_count
    }

    fn is_innermost(self: &Rc<Self>) -> bool {
        CONTEXTS.with(|c| {
            c.borrow()
                .last()
                .map(|top| Rc::ptr_eq(top, self))
                .unwrap_or(false)
        })
    }

    /// Force completion of every redo started in this context; the first
    /// captured failure (in submission order) is returned.
    pub(crate) fn complete_pending_redos(self: &Rc<Self>) -> Result<()> {
        let root = self.root_rc();
        let driver = &root.specifics().driver;
        let mut sequencer = self.sequencer.borrow_mut();
        sequencer.complete_all(driver);
        match sequencer.take_first(|r| r.is_err()) {
            Some((_, Err(e))) => Err(e),
            _ => Ok(()),
        }
    }

    /// Precondition for mutating the env or helper dictionary: this context
    /// is the innermost active one, and none of its redos is in flight.
    fn prepare_for_modification(self: &Rc<Self>, what: &str) -> Result<()> {
        if !self.is_innermost() {
            return Err(Error::ContextModification(format!(
                "{:?} of an inactive context must not be modified\n\
                 \x20 | only the innermost context may be modified",
                what
            )));
        }
        self.complete_pending_redos()
    }

    fn find_violated_pattern(&self, name: &str, value: &str) -> Option<String> {
        let env = self.env.borrow();
        if let Some((source, regex)) = env.patterns.get(name) {
            if !regex.is_match(value) {
                return Some(source.clone());
            }
        }
        match &self.parent {
            Some(parent) => parent.find_violated_pattern(name, value),
            None => None,
        }
    }

    fn is_env_imported(&self, name: &str) -> bool {
        if self.env.borrow().patterns.contains_key(name) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_env_imported(name),
            None => false,
        }
    }

    fn helper_in_chain(&self, helper_path: &TreePath) -> Option<PathBuf> {
        if let Some(p) = self.explicit_helpers.borrow().get(helper_path) {
            return Some(p.clone());
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.helper_in_chain(helper_path))
    }
}

/// An entered execution context.  Dropping the guard exits the context;
/// prefer [`Context::close`], which reports errors (a pending redo failure,
/// a nesting violation, trouble while cleaning up the management tree).
#[derive(Debug)]
pub struct Context {
    data: Rc<ContextData>,
    open: bool,
}

impl Context {
    /// Enter a root context in the current directory, which must be a
    /// working-tree root.
    pub fn root(config: Config) -> Result<Context> {
        if CONTEXTS.with(|c| !c.borrow().is_empty()) {
            return Err(Error::ContextModification(
                "a root context is already active in this thread\n\
                 \x20 | use Context::nested() inside it"
                    .to_string(),
            ));
        }

        let sink = config
            .sink
            .unwrap_or_else(|| Rc::new(RefCell::new(ConsoleSink::default())));
        diag::install(sink, config.min_diagnostic_level);

        let entered = (|| -> Result<Rc<ContextData>> {
            let root_path = worktree::checked_root_path_from_cwd()?;

            let mut executable_search_paths = Vec::new();
            if let Some(path_var) = std::env::var_os("PATH") {
                for p in std::env::split_paths(&path_var) {
                    if p.as_os_str().is_empty() {
                        continue;
                    }
                    let p = if p.is_absolute() { p } else { root_path.join(p) };
                    if p.is_dir() && !executable_search_paths.contains(&p) {
                        executable_search_paths.push(p);
                    }
                }
            }

            worktree::lock_working_tree(&root_path)?;

            let locked = (|| -> Result<RootSpecifics> {
                let (temp_provider, probe, db, case_sensitive) =
                    worktree::prepare_locked_working_tree(
                        &root_path,
                        config.max_dependency_age,
                    )?;

                let driver = Driver::new().map_err(|e| {
                    Error::ManagementTree(format!(
                        "cannot start executor\n  | reason: {}",
                        io_error_to_line(&e)
                    ))
                })?;

                let top_env: BTreeMap<String, String> = std::env::vars().collect();

                let specifics = RootSpecifics {
                    root_path: root_path.clone(),
                    driver,
                    rundb: RefCell::new(Some(db)),
                    mtime_probe: RefCell::new(Some(probe)),
                    temp_provider: RefCell::new(temp_provider),
                    executable_search_paths,
                    implicit_helpers: RefCell::new(FxHashMap::default()),
                    case_sensitive,
                    top_env,
                    nonredo_runs: Cell::new(0),
                    redo_runs: Cell::new(0),
                    levels: config.levels,
                    run_summary_max_count: config.run_summary_max_count,
                    helper_output_inherited_by_default: config
                        .helper_output_inherited_by_default,
                    last_probe_ns: Cell::new(i64::MIN),
                    warned_backwards: Cell::new(false),
                };

                // A backwards jump relative to the previous run is
                // tolerated but flagged; it degrades change detection.
                let last_recorded = specifics.with_db(|db| Ok(db.last_tree_time_ns()))?;
                let now = specifics.tree_time_ns()?;
                if let Some(last) = last_recorded {
                    if now < last {
                        diag::inform(
                            "working tree time moved backwards since the previous run",
                            Level::Warning,
                        );
                    }
                }
                Ok(specifics)
            })();

            let specifics = match locked {
                Ok(s) => s,
                Err(e) => {
                    let _ = worktree::unlock_working_tree(&root_path);
                    return Err(e);
                }
            };

            Ok(Rc::new(ContextData {
                parent: None,
                max_parallel_redo_count: config.max_parallel_redo_count.max(1),
                find_helpers: config.find_helpers.unwrap_or(true),
                env: RefCell::new(EnvDict {
                    values: BTreeMap::new(),
                    patterns: FxHashMap::default(),
                }),
                explicit_helpers: RefCell::new(FxHashMap::default()),
                sequencer: RefCell::new(Sequencer::default()),
                root: Some(specifics),
            }))
        })();

        let data = match entered {
            Ok(data) => data,
            Err(e) => {
                diag::uninstall();
                return Err(e);
            }
        };

        CONTEXTS.with(|c| c.borrow_mut().push(data.clone()));
        Ok(Context { data, open: true })
    }

    /// Enter a context nested in the currently active one.
    pub fn nested(options: ContextOptions) -> Result<Context> {
        let parent = active_data()?;
        let root = parent.root_rc();

        let find_helpers = match options.find_helpers {
            None => root.find_helpers,
            Some(true) if !root.find_helpers => {
                return Err(Error::ContextModification(
                    "'find_helpers' must be false if 'find_helpers' of the root context \
                     is false"
                        .to_string(),
                ))
            }
            Some(v) => v,
        };

        // A new scope must observe a quiescent parent.
        parent.complete_pending_redos()?;

        let env = EnvDict {
            values: parent.env.borrow().values.clone(),
            patterns: FxHashMap::default(),
        };

        let data = Rc::new(ContextData {
            parent: Some(parent),
            max_parallel_redo_count: options.max_parallel_redo_count.unwrap_or(1).max(1),
            find_helpers,
            env: RefCell::new(env),
            explicit_helpers: RefCell::new(FxHashMap::default()),
            sequencer: RefCell::new(Sequencer::default()),
            root: None,
        });
        CONTEXTS.with(|c| c.borrow_mut().push(data.clone()));
        Ok(Context { data, open: true })
    }

    pub fn root_path(&self) -> PathBuf {
        self.data.root_rc().specifics().root_path.clone()
    }

    pub fn is_working_tree_case_sensitive(&self) -> bool {
        self.data.root_rc().specifics().case_sensitive
    }

    pub fn max_parallel_redo_count(&self) -> usize {
        self.data.max_parallel_redo_count
    }

    pub fn find_helpers(&self) -> bool {
        self.data.find_helpers
    }

    pub fn executable_search_paths(&self) -> Vec<PathBuf> {
        self.data
            .root_rc()
            .specifics()
            .executable_search_paths
            .clone()
    }

    /// Sample the working-tree time (a logical clock: filesystem mtime of
    /// the probe file, in nanoseconds).
    pub fn working_tree_time_ns(&self) -> Result<i64> {
        self.data.root_rc().specifics().tree_time_ns()
    }

    /// Summaries of the latest successful runs, oldest first.
    pub fn summary_of_latest_runs(&self, max_count: usize) -> Result<Vec<RunSummary>> {
        self.data
            .root_rc()
            .specifics()
            .with_db(|db| db.latest_successful_run_summaries(max_count))
    }

    /// Wait for every redo started in this context and re-raise the first
    /// captured failure.
    pub fn complete_pending_redos(&self) -> Result<()> {
        self.data.complete_pending_redos()
    }

    // --- environment-variable dictionary ---

    /// Make `name` usable inside this context: validate the outer value (if
    /// any) against `pattern` (full match) and import it.  The pattern
    /// stays attached to this context for its lifetime.
    pub fn import_env_from_outer(&self, name: &str, pattern: &str, example: &str) -> Result<()> {
        check_env_name(name)?;
        let regex = compile_fullmatch(pattern)?;
        if !regex.is_match(example) {
            return Err(Error::Dependency(format!(
                "'example' is not matched by 'pattern': {:?}",
                example
            )));
        }
        self.data.prepare_for_modification("env")?;

        let current = self.data.env.borrow().values.get(name).cloned();
        let (value, value_name) = match current {
            Some(v) => (Some(v), "current"),
            None => {
                let outer = match &self.data.parent {
                    Some(parent) => parent.env.borrow().values.get(name).cloned(),
                    None => self
                        .data
                        .root_rc()
                        .specifics()
                        .top_env
                        .get(name)
                        .cloned(),
                };
                (outer, "imported")
            }
        };

        if let Some(v) = &value {
            if !regex.is_match(v) {
                return Err(Error::Dependency(format!(
                    "{} value is not matched by 'pattern': {:?}",
                    value_name, v
                )));
            }
        }

        let mut env = self.data.env.borrow_mut();
        // A pattern cannot be removed once defined.
        env.patterns
            .insert(name.to_string(), (pattern.to_string(), regex));
        if let Some(v) = value {
            env.values.insert(name.to_string(), v);
        }
        Ok(())
    }

    pub fn env_var(&self, name: &str) -> Option<String> {
        self.data.env.borrow().values.get(name).cloned()
    }

    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.data
            .env
            .borrow()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Set an imported environment variable, validated against every
    /// pattern attached on the active chain.
    pub fn set_env(&self, name: &str, value: &str) -> Result<()> {
        check_env_name(name)?;
        if !self.data.is_env_imported(name) {
            return Err(Error::Dependency(format!(
                "environment variable not imported into context: {:?}\n\
                 \x20 | use import_env_from_outer() first",
                name
            )));
        }
        self.data.prepare_for_modification("env")?;
        if let Some(pattern) = self.data.find_violated_pattern(name, value) {
            return Err(Error::Dependency(format!(
                "'value' is not matched by an associated validation pattern: {:?}\n\
                 \x20 | validation pattern in question is {:?}",
                value, pattern
            )));
        }
        self.data
            .env
            .borrow_mut()
            .values
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_env(&self, name: &str) -> Result<()> {
        check_env_name(name)?;
        self.data.prepare_for_modification("env")?;
        if self.data.env.borrow_mut().values.remove(name).is_none() {
            return Err(Error::Dependency(format!(
                "not a defined environment variable in the context: {:?}",
                name
            )));
        }
        Ok(())
    }

    // --- helper dictionary ---

    /// Register the absolute path of a helper.  Inherited by nested
    /// contexts.
    pub fn register_helper(&self, helper_path: &TreePath, abs_path: &TreePath) -> Result<()> {
        if helper_path.is_absolute() {
            return Err(Error::Dependency(
                "'helper_path' must not be absolute".to_string(),
            ));
        }
        if helper_path.is_dir() != abs_path.is_dir() {
            let kind = if helper_path.is_dir() {
                "directory"
            } else {
                "non-directory"
            };
            return Err(Error::Dependency(format!(
                "when 'helper_path' is a {}, 'abs_path' must also be a {}",
                kind, kind
            )));
        }
        let abs = if abs_path.is_absolute() {
            abs_path.to_native()
        } else {
            self.root_path().join(abs_path.to_native())
        };
        self.data.prepare_for_modification("helper")?;
        self.data
            .explicit_helpers
            .borrow_mut()
            .insert(helper_path.clone(), abs);
        Ok(())
    }

    /// Resolve a helper path: explicitly registered paths first, then (when
    /// enabled) the cached executable search.
    pub fn helper(&self, helper_path: &TreePath) -> Option<PathBuf> {
        helper_for(&self.data, helper_path)
    }

    /// Search the executable search paths (or `prefixes`, when given) for
    /// an entry whose directory-ness matches `path`.
    pub fn find_path_in(
        &self,
        path: &TreePath,
        prefixes: Option<&[PathBuf]>,
    ) -> Result<Option<PathBuf>> {
        let root = self.data.root_rc();
        find_path_in(root.specifics(), path, prefixes)
    }

    /// A fresh temporary below the management tree, removed when the
    /// returned guard drops (at the latest: at root-context exit).
    pub fn temporary(&self, prefix: &str, suffix: &str, is_dir: bool) -> Result<Temporary> {
        self.data
            .root_rc()
            .specifics()
            .temporary(prefix, suffix, is_dir)
    }

    /// Normalize an absolute or relative path into a managed-tree path of
    /// an existing filesystem object.
    pub fn working_tree_path_of(&self, path: &TreePath) -> Result<TreePath> {
        let root = self.data.root_rc();
        working_tree_path_of(root.specifics(), path, false, false, true)
    }

    /// Exit this context: wait for its pending redos, then (for a root
    /// context) write the run summary, clean up the management tree, wait
    /// for the working-tree time to advance, and release the lock.
    pub fn close(mut self) -> Result<()> {
        self.exit_impl()
    }

    fn exit_impl(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let panicking = std::thread::panicking();
        let root_rc = self.data.root_rc();

        if panicking {
            self.data.sequencer.borrow_mut().abort_all();
        } else {
            let driver = &root_rc.specifics().driver;
            self.data.sequencer.borrow_mut().complete_all(driver);
        }

        if !self.data.is_innermost() {
            return Err(Error::ContextNesting);
        }
        CONTEXTS.with(|c| {
            c.borrow_mut().pop();
        });

        let mut first_error = match self.data.sequencer.borrow_mut().take_first(|r| r.is_err())
        {
            Some((_, Err(e))) => Some(e),
            _ => None,
        };

        if self.data.root.is_some() {
            let was_successful = first_error.is_none() && !panicking;
            if let Err(e) = close_root(self.data.specifics(), was_successful) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            diag::uninstall();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.exit_impl();
    }
}

pub(crate) fn env_value(data: &Rc<ContextData>, name: &str) -> Option<String> {
    data.env.borrow().values.get(name).cloned()
}

pub(crate) fn env_values(data: &Rc<ContextData>) -> Vec<(String, String)> {
    data.env
        .borrow()
        .values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn helper_for(data: &Rc<ContextData>, helper_path: &TreePath) -> Option<PathBuf> {
    if let Some(p) = data.helper_in_chain(helper_path) {
        return Some(p);
    }
    if !data.find_helpers {
        return None;
    }
    let root = data.root_rc();
    let specifics = root.specifics();
    if let Some(p) = specifics.implicit_helpers.borrow().get(helper_path) {
        return Some(p.clone());
    }
    let found = find_path_in(specifics, helper_path, None).ok()??;
    specifics
        .implicit_helpers
        .borrow_mut()
        .insert(helper_path.clone(), found.clone());
    Some(found)
}

fn find_path_in(
    specifics: &RootSpecifics,
    path: &TreePath,
    prefixes: Option<&[PathBuf]>,
) -> Result<Option<PathBuf>> {
    if path.is_absolute() {
        return Err(Error::Dependency("'path' must not be absolute".to_string()));
    }
    let prefixes = match prefixes {
        Some(p) => p,
        None => specifics.executable_search_paths.as_slice(),
    };
    for prefix in prefixes {
        let candidate = prefix.join(path.to_native());
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_dir() == path.is_dir() {
                return Ok(Some(candidate));
            }
        }
    }
    Ok(None)
}

/// Normalize `path` into a managed-tree path relative to the root.
///
/// Absolute paths must lie below the working-tree root.  Paths into the
/// management tree are rejected unless specifically allowed (`.../t/...`
/// with `allow_temporary`, anything else with
/// `allow_nontemporary_management`).  With `must_exist`, the filesystem
/// object is stat()ed and the directory flag corrected from its kind.
pub(crate) fn working_tree_path_of(
    specifics: &RootSpecifics,
    path: &TreePath,
    allow_temporary: bool,
    allow_nontemporary_management: bool,
    must_exist: bool,
) -> Result<TreePath> {
    let rel = if path.is_absolute() {
        let root_str = specifics.root_path.to_string_lossy();
        let root_tree = TreePath::dir(&root_str).map_err(|e| {
            Error::WorkingTreePath(format!("unusable working tree root: {}", e))
        })?;
        if !path.starts_with(&root_tree) {
            return Err(Error::WorkingTreePath(format!(
                "does not start with the working tree's root path: {:?}",
                path.to_string()
            )));
        }
        path.relative_to(&root_tree)
            .map_err(|e| Error::WorkingTreePath(e.to_string()))?
    } else {
        path.clone()
    };

    if !rel.is_normalized() {
        return Err(Error::WorkingTreePath(format!(
            "is an upwards path: {:?}",
            rel.to_string()
        )));
    }

    {
        let mut components = rel.components();
        if components.next() == Some(worktree::MANAGEMENT_DIR_NAME) {
            let permitted = if components.next() == Some(worktree::TEMPORARY_DIR_NAME) {
                allow_temporary
            } else {
                allow_nontemporary_management
            };
            if !permitted {
                return Err(Error::WorkingTreePath(format!(
                    "path in non-permitted part of the working tree: {:?}",
                    rel.to_string()
                )));
            }
        }
    }

    if must_exist {
        let abs = specifics.root_path.join(rel.to_native());
        let memo = crate::fs::read_memo(&abs).map_err(|e| {
            Error::WorkingTreePath(format!(
                "cannot inspect filesystem object: {:?}\n  | reason: {}",
                rel.to_string(),
                io_error_to_line(&e)
            ))
        })?;
        match memo.kind() {
            crate::fs::FsKind::Absent => {
                return Err(Error::WorkingTreePath(format!(
                    "filesystem object does not exist: {:?}",
                    rel.to_string()
                )))
            }
            crate::fs::FsKind::Directory if !rel.is_dir() => {
                return TreePath::dir(rel.as_str())
                    .map_err(|e| Error::WorkingTreePath(e.to_string()));
            }
            kind if kind != crate::fs::FsKind::Directory && rel.is_dir() => {
                return TreePath::new(rel.as_str())
                    .map_err(|e| Error::WorkingTreePath(e.to_string()));
            }
            _ => {}
        }
    }
    Ok(rel)
}

fn check_env_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Dependency("'name' must not be empty".to_string()));
    }
    Ok(())
}

fn compile_fullmatch(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
        Error::Dependency(format!("invalid validation pattern\n  | reason: {}", e))
    })
}

/// Root-context teardown.  The time barrier guarantees that the next run's
/// mtime comparisons cannot collide with anything this run wrote.
fn close_root(specifics: &RootSpecifics, was_successful: bool) -> Result<()> {
    let mut first_error: Option<Error> = None;

    let cleanup = (|| -> Result<()> {
        let t0 = Instant::now();
        let wt0 = specifics.tree_time_ns()?;

        if was_successful {
            let summary = specifics.with_db(|db| {
                db.update_run_summary(
                    specifics.nonredo_runs.get(),
                    specifics.redo_runs.get(),
                    wt0,
                )
            })?;
            if specifics.run_summary_max_count > 0 {
                let previous = specifics.with_db(|db| {
                    db.latest_successful_run_summaries(specifics.run_summary_max_count)
                })?;
                show_summary(&previous, summary, specifics.levels.run_summary);
            }
        }

        specifics.with_db(|db| {
            db.cleanup()?;
            db.commit()
        })?;
        worktree::remove_filesystem_object(specifics.temp_provider.borrow().root(), None, true)
            .map_err(|e| {
                Error::ManagementTree(format!(
                    "cannot remove temporary directory\n  | reason: {}",
                    io_error_to_line(&e)
                ))
            })?;

        loop {
            let wt = specifics.tree_time_ns()?;
            if wt != wt0 {
                break;
            }
            if t0.elapsed() > Duration::from_secs(10) {
                return Err(Error::WorkingTreeTime(
                    "working tree time did not change for at least 10 s of system time\n\
                     \x20 | was the system time adjusted in this moment?"
                        .to_string(),
                ));
            }
            // Typical effective working tree time resolution: 10 ms.
            std::thread::sleep(Duration::from_millis(15));
        }
        Ok(())
    })();
    if let Err(e) = cleanup {
        first_error = Some(e);
    }

    specifics.mtime_probe.borrow_mut().take();
    if let Some(db) = specifics.rundb.borrow_mut().take() {
        if let Err(e) = db.close() {
            first_error.get_or_insert(e);
        }
    }
    if let Err(e) = worktree::unlock_working_tree(&specifics.root_path) {
        first_error.get_or_insert(e);
    }

    match first_error {
        None => Ok(()),
        // The working-tree time kind stays visible; it is the signal an
        // operator needs to diagnose filesystem clock trouble.
        Some(e @ Error::WorkingTreeTime(_)) => Err(e),
        Some(e) => Err(Error::ManagementTree(format!(
            "failed to cleanup management tree for {:?}\n  | reason: {}",
            specifics.root_path.display().to_string(),
            e.to_line()
        ))),
    }
}

fn show_summary(previous: &[RunSummary], current: RunSummary, level: Level) {
    let mut msg = if previous.is_empty() {
        format!(
            "duration: {} s",
            diag::format_time_ns(current.duration_ns.max(0) as u64, 3)
        )
    } else {
        let mean_ns: i64 =
            previous.iter().map(|s| s.duration_ns).sum::<i64>() / previous.len() as i64;
        if mean_ns > 0 {
            format!(
                "duration compared to mean duration of previous {} successful runs: \
                 {:.1}% of {} seconds",
                previous.len(),
                100.0 * current.duration_ns as f64 / mean_ns as f64,
                diag::format_time_ns(mean_ns.max(0) as u64, 3)
            )
        } else {
            format!(
                "duration: {} s",
                diag::format_time_ns(current.duration_ns.max(0) as u64, 3)
            )
        }
    };
    for summary in previous.iter().chain(std::iter::once(&current)) {
        let marker = if summary == &current { "*" } else { " " };
        msg.push_str(&format!(
            "\n  | start +{}s{}  duration {}s  runs {}  redos {}",
            summary.start_time_ns / 1_000_000_000,
            marker,
            diag::format_time_ns(summary.duration_ns.max(0) as u64, 3),
            summary.run_count,
            summary.redo_count
        ));
    }
    diag::inform(&msg, level);
}
