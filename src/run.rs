//! Running tool instances: the redo-necessity decision, redo execution
//! under the context's concurrency bound, and the recording of dependency
//! state after a successful redo.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::context::{self, working_tree_path_of, ContextData};
use crate::depend::{
    check_memo_kind, DependencyValue, EnvVarValue, ParamValue, RawValue, RoleCategory, RoleKind,
};
use crate::diag::{self, Cluster, Level};
use crate::error::{io_error_to_line, Error, Result};
use crate::fs::{self, FsKind, FsObjectMemo};
use crate::path::TreePath;
use crate::rundb::{self, Database};
use crate::tool::{ToolClass, ToolInstance};
use crate::worktree::{self, Temporary};

/// Everything a redo body receives.
pub struct Redo {
    /// Concrete dependencies; assign non-explicit ones here.
    pub result: Rc<RunResult>,
    /// Operations scoped to the owning context.
    pub context: Rc<RedoContext>,
}

/// The observable outcome of running a tool instance.
///
/// Explicit dependency values are echoed from the instance.  Non-explicit
/// values appear once a redo body assigns them; after a run without redo
/// they stay unset.
#[derive(Debug)]
pub struct RunResult {
    redo: bool,
    class: Rc<ToolClass>,
    values: RefCell<BTreeMap<String, Option<DependencyValue>>>,
}

impl Clone for RunResult {
    fn clone(&self) -> Self {
        RunResult {
            redo: self.redo,
            class: self.class.clone(),
            values: RefCell::new(self.values.borrow().clone()),
        }
    }
}

impl RunResult {
    fn new(class: &Rc<ToolClass>, redo: bool, instance: &ToolInstance) -> RunResult {
        RunResult {
            redo,
            class: class.clone(),
            values: RefCell::new(instance.values().clone()),
        }
    }

    pub fn did_redo(&self) -> bool {
        self.redo
    }

    pub fn value(&self, name: &str) -> Option<DependencyValue> {
        self.values.borrow().get(name).and_then(|v| v.clone())
    }

    pub fn path(&self, name: &str) -> Option<TreePath> {
        match self.value(name) {
            Some(DependencyValue::Path(p)) => Some(p),
            _ => None,
        }
    }

    pub fn paths(&self, name: &str) -> Option<Vec<TreePath>> {
        match self.value(name) {
            Some(DependencyValue::Path(p)) => Some(vec![p]),
            Some(DependencyValue::Paths(ps)) => Some(ps),
            _ => None,
        }
    }

    pub fn env_var(&self, name: &str) -> Option<EnvVarValue> {
        match self.value(name) {
            Some(DependencyValue::EnvVar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn object(&self, name: &str) -> Option<ParamValue> {
        match self.value(name) {
            Some(DependencyValue::Object(v)) => Some(v),
            _ => None,
        }
    }

    /// Assign a non-explicit dependency during a redo.  Each may be
    /// assigned exactly once.
    pub fn set(&self, name: &str, raw: impl Into<RawValue>) -> Result<()> {
        if !self.redo {
            return Err(Error::Dependency(
                "dependencies may only be assigned during a redo".to_string(),
            ));
        }
        let role = self
            .class
            .role(name)
            .ok_or_else(|| Error::Dependency(format!("{:?} is not a dependency", name)))?;
        if role.explicit() {
            return Err(Error::Dependency(format!(
                "{:?} is not a non-explicit dependency",
                name
            )));
        }
        if self.values.borrow().contains_key(name) {
            return Err(Error::Dependency(format!("{:?} is already assigned", name)));
        }
        let validated = role.validate(raw.into()).map_err(|reason| {
            Error::Dependency(format!(
                "value for dependency role {:?} is invalid\n  | reason: {}",
                name, reason
            ))
        })?;
        self.values
            .borrow_mut()
            .insert(name.to_string(), Some(validated));
        Ok(())
    }

    fn set_validated(&self, name: &str, value: Option<DependencyValue>) {
        self.values.borrow_mut().insert(name.to_string(), value);
    }

    fn is_assigned(&self, name: &str) -> bool {
        self.values.borrow().contains_key(name)
    }
}

/// How one standard stream of a helper process is routed.
#[derive(Debug, Clone, Default)]
pub enum OutputMode {
    /// Per the root context's configuration.
    #[default]
    Configured,
    Inherit,
    Suppress,
    ToFile(TreePath),
}

#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// Working directory of the helper, relative to the working-tree root.
    pub cwd: Option<TreePath>,
    pub expected_returncodes: Vec<i32>,
    /// Overrides on top of the context's environment dictionary.
    pub forced_env: Vec<(String, String)>,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl Default for ExecOpts {
    fn default() -> Self {
        ExecOpts {
            cwd: None,
            expected_returncodes: vec![0],
            forced_env: Vec::new(),
            stdout: OutputMode::default(),
            stderr: OutputMode::default(),
        }
    }
}

/// A command-line argument for a helper process.  Paths are rendered
/// relative to the helper's working directory.
#[derive(Debug, Clone)]
pub enum HelperArg {
    Str(String),
    Path(TreePath),
}

impl From<&str> for HelperArg {
    fn from(s: &str) -> Self {
        HelperArg::Str(s.to_string())
    }
}
impl From<String> for HelperArg {
    fn from(s: String) -> Self {
        HelperArg::Str(s)
    }
}
impl From<TreePath> for HelperArg {
    fn from(p: TreePath) -> Self {
        HelperArg::Path(p)
    }
}
impl From<&TreePath> for HelperArg {
    fn from(p: &TreePath) -> Self {
        HelperArg::Path(p.clone())
    }
}

#[derive(Clone)]
struct OutputSpec {
    kind: RoleKind,
    replace_by_same_content: bool,
}

/// Read-only view of the owning context plus the operations a redo body
/// may perform: spawning helpers, creating temporaries, and atomically
/// replacing declared outputs.
pub struct RedoContext {
    data: Rc<ContextData>,
    outputs: FxHashMap<TreePath, OutputSpec>,
    modified: RefCell<BTreeSet<TreePath>>,
}

impl RedoContext {
    fn new(data: Rc<ContextData>, outputs: FxHashMap<TreePath, OutputSpec>) -> RedoContext {
        // Everything except regular-file outputs that elide same-content
        // replacement counts as modified as soon as the redo starts.
        let modified = outputs
            .iter()
            .filter(|(_, spec)| {
                !matches!(spec.kind, RoleKind::RegularFile) || spec.replace_by_same_content
            })
            .map(|(p, _)| p.clone())
            .collect();
        RedoContext {
            data,
            outputs,
            modified: RefCell::new(modified),
        }
    }

    pub fn root_path(&self) -> PathBuf {
        self.data.root_rc().specifics().root_path().to_path_buf()
    }

    pub fn env_var(&self, name: &str) -> Option<String> {
        context::env_value(&self.data, name)
    }

    pub fn env_vars(&self) -> Vec<(String, String)> {
        context::env_values(&self.data)
    }

    pub fn helper(&self, helper_path: &TreePath) -> Option<PathBuf> {
        context::helper_for(&self.data, helper_path)
    }

    pub fn temporary(&self, prefix: &str, suffix: &str, is_dir: bool) -> Result<Temporary> {
        self.data.root_rc().specifics().temporary(prefix, suffix, is_dir)
    }

    pub fn working_tree_time_ns(&self) -> Result<i64> {
        self.data.root_rc().specifics().tree_time_ns()
    }

    /// The output paths this redo is considered to have modified so far.
    pub fn modified_outputs(&self) -> Vec<TreePath> {
        self.modified.borrow().iter().cloned().collect()
    }

    /// Replace the declared output `path` by `source` (a temporary or
    /// other working-tree object) with an atomic rename, re-stamping the
    /// target's mtime afterwards (a rename preserves the source's mtime,
    /// which may lie in the past).
    ///
    /// Returns whether the output was actually replaced: a regular-file
    /// output whose role opted out of same-content replacement keeps the
    /// old file when the content is identical.
    pub fn replace_output(&self, path: &TreePath, source: &TreePath) -> Result<bool> {
        let spec = self.outputs.get(path).ok_or_else(|| {
            Error::Dependency(format!(
                "path is not contained in any explicit output dependency: {:?}",
                path.to_string()
            ))
        })?;
        if path.is_dir() != source.is_dir() {
            let msg = if path.is_dir() {
                format!(
                    "cannot replace directory by non-directory: {:?}",
                    path.to_string()
                )
            } else {
                format!(
                    "cannot replace non-directory by directory: {:?}",
                    path.to_string()
                )
            };
            return Err(Error::Dependency(msg));
        }

        let root_rc = self.data.root_rc();
        let specifics = root_rc.specifics();
        let source = working_tree_path_of(specifics, source, true, false, true).map_err(|e| {
            Error::Dependency(format!(
                "'source' is not a permitted working tree path of an existing filesystem \
                 object: {:?}\n  | reason: {}",
                source.to_string(),
                e.to_line()
            ))
        })?;
        if *path == source {
            return Err(Error::Dependency(format!(
                "cannot replace a path by itself: {:?}",
                path.to_string()
            )));
        }

        let root = specifics.root_path();
        let abs_source = root.join(source.to_native());
        let abs_path = root.join(path.to_native());
        let levels = specifics.levels;

        if matches!(spec.kind, RoleKind::RegularFile) && !spec.replace_by_same_content {
            let same = match fs::read_memo(&abs_path) {
                Ok(memo) if memo.kind() == FsKind::Regular => {
                    worktree::files_have_same_content(&abs_source, &abs_path).unwrap_or(false)
                }
                _ => false,
            };
            if same {
                worktree::remove_filesystem_object(&abs_source, None, false).map_err(|e| {
                    Error::Dependency(format!(
                        "cannot remove replacement source\n  | reason: {}",
                        io_error_to_line(&e)
                    ))
                })?;
                diag::inform(
                    &format!(
                        "kept regular file because replacement has same content: {:?}",
                        path.to_string()
                    ),
                    levels.output_replacement,
                );
                return Ok(false);
            }
        }

        let replace = || -> std::io::Result<()> {
            if matches!(spec.kind, RoleKind::Directory) {
                if let Some(parent) = abs_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let tmp = specifics
                    .temporary("", "", true)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                worktree::remove_filesystem_object(&abs_path, Some(tmp.path()), true)?;
                std::fs::rename(&abs_source, &abs_path)
            } else {
                match std::fs::rename(&abs_source, &abs_path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        if let Some(parent) = abs_path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::rename(&abs_source, &abs_path)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        replace().map_err(|e| {
            Error::Dependency(format!(
                "cannot replace output {:?}\n  | reason: {}",
                path.to_string(),
                io_error_to_line(&e)
            ))
        })?;

        // A rename keeps the source's timestamps; without re-stamping, an
        // output assembled earlier could appear older than its inputs.
        filetime::set_file_mtime(&abs_path, filetime::FileTime::now()).map_err(|e| {
            Error::Dependency(format!(
                "cannot update mtime of replaced output {:?}\n  | reason: {}",
                path.to_string(),
                io_error_to_line(&e)
            ))
        })?;

        let what = if matches!(spec.kind, RoleKind::Directory) {
            "replaced directory"
        } else {
            "replaced regular file with different one"
        };
        diag::inform(
            &format!("{}: {:?}", what, path.to_string()),
            levels.output_replacement,
        );
        self.modified.borrow_mut().insert(path.clone());
        Ok(true)
    }

    /// Spawn a helper process and wait for it, checking its exit code.
    pub async fn execute_helper(
        &self,
        helper_path: &TreePath,
        arguments: &[HelperArg],
        opts: &ExecOpts,
    ) -> Result<i32> {
        let mut command = self.prepare_command(helper_path, arguments, opts)?;
        command.stdout(self.stdio_for(&opts.stdout)?);
        command.stderr(self.stdio_for(&opts.stderr)?);
        let status = command.status().await.map_err(|e| {
            Error::HelperExecution(format!(
                "cannot execute helper {:?}\n  | reason: {}",
                helper_path.to_string(),
                io_error_to_line(&e)
            ))
        })?;
        self.check_status(helper_path, status, &opts.expected_returncodes)
    }

    /// Like [`RedoContext::execute_helper`], additionally capturing one of
    /// the standard streams completely (`2` for stderr, anything else for
    /// stdout); the other stream is routed per `opts`.
    pub async fn execute_helper_with_output(
        &self,
        helper_path: &TreePath,
        arguments: &[HelperArg],
        opts: &ExecOpts,
        output_to_process: i32,
    ) -> Result<(i32, Vec<u8>)> {
        use tokio::io::AsyncReadExt;

        let mut command = self.prepare_command(helper_path, arguments, opts)?;
        if output_to_process == 2 {
            command.stdout(self.stdio_for(&opts.stdout)?);
            command.stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::piped());
            command.stderr(self.stdio_for(&opts.stderr)?);
        }

        let spawn_err = |e: &std::io::Error| {
            Error::HelperExecution(format!(
                "cannot execute helper {:?}\n  | reason: {}",
                helper_path.to_string(),
                io_error_to_line(e)
            ))
        };
        let mut child = command.spawn().map_err(|e| spawn_err(&e))?;
        let mut output = Vec::new();
        if output_to_process == 2 {
            let mut pipe = child.stderr.take().expect("stderr is piped");
            pipe.read_to_end(&mut output)
                .await
                .map_err(|e| spawn_err(&e))?;
        } else {
            let mut pipe = child.stdout.take().expect("stdout is piped");
            pipe.read_to_end(&mut output)
                .await
                .map_err(|e| spawn_err(&e))?;
        }
        let status = child.wait().await.map_err(|e| spawn_err(&e))?;
        let code = self.check_status(helper_path, status, &opts.expected_returncodes)?;
        Ok((code, output))
    }

    fn prepare_command(
        &self,
        helper_path: &TreePath,
        arguments: &[HelperArg],
        opts: &ExecOpts,
    ) -> Result<tokio::process::Command> {
        if helper_path.is_dir() {
            return Err(Error::HelperExecution(format!(
                "cannot execute directory: {:?}",
                helper_path.to_string()
            )));
        }
        let program = self.helper(helper_path).ok_or_else(|| {
            Error::HelperExecution(format!(
                "not a known helper in the context: {:?}\n\
                 \x20 | use Context::register_helper()",
                helper_path.to_string()
            ))
        })?;

        let root_rc = self.data.root_rc();
        let specifics = root_rc.specifics();
        let cwd = match &opts.cwd {
            None => TreePath::dir(".").expect("'.' is a path"),
            Some(cwd) => working_tree_path_of(specifics, cwd, true, false, true)?,
        };
        let abs_cwd = specifics.root_path().join(cwd.to_native());

        let mut str_arguments = Vec::with_capacity(arguments.len());
        for argument in arguments {
            match argument {
                HelperArg::Str(s) => str_arguments.push(s.clone()),
                HelperArg::Path(p) if p.is_absolute() => {
                    str_arguments.push(p.to_native().to_string_lossy().into_owned())
                }
                HelperArg::Path(p) => {
                    let rel = working_tree_path_of(specifics, p, true, false, true)?;
                    let rel_to_cwd = rel
                        .relative_to(&cwd)
                        .map_err(|e| Error::WorkingTreePath(e.to_string()))?;
                    str_arguments.push(rel_to_cwd.to_native().to_string_lossy().into_owned());
                }
            }
        }

        let mut env: BTreeMap<String, String> =
            context::env_values(&self.data).into_iter().collect();
        for (k, v) in &opts.forced_env {
            env.insert(k.clone(), v.clone());
        }

        diag::inform(
            &format!(
                "execute helper {:?}\n  | path: {:?}\n  | arguments: {:?}\n  | directory: {:?}",
                helper_path.to_string(),
                program.display().to_string(),
                str_arguments,
                cwd.to_string()
            ),
            specifics.levels.helper_execution,
        );

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&str_arguments)
            .current_dir(&abs_cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null());
        Ok(command)
    }

    fn stdio_for(&self, mode: &OutputMode) -> Result<Stdio> {
        let inherit_by_default = self
            .data
            .root_rc()
            .specifics()
            .helper_output_inherited_by_default;
        Ok(match mode {
            OutputMode::Configured if inherit_by_default => Stdio::inherit(),
            OutputMode::Configured => Stdio::null(),
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Suppress => Stdio::null(),
            OutputMode::ToFile(path) => {
                let root_rc = self.data.root_rc();
                let specifics = root_rc.specifics();
                let rel = working_tree_path_of(specifics, path, true, false, false)?;
                let abs = specifics.root_path().join(rel.to_native());
                let file = std::fs::File::create(&abs).map_err(|e| {
                    Error::HelperExecution(format!(
                        "cannot open output file {:?}\n  | reason: {}",
                        path.to_string(),
                        io_error_to_line(&e)
                    ))
                })?;
                Stdio::from(file)
            }
        })
    }

    fn check_status(
        &self,
        helper_path: &TreePath,
        status: std::process::ExitStatus,
        expected: &[i32],
    ) -> Result<i32> {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            if expected.contains(&code) {
                return Ok(code);
            }
            return Err(Error::HelperExecution(format!(
                "execution of {:?} returned unexpected exit code {}",
                helper_path.to_string(),
                code
            )));
        }
        let detail = match status.signal() {
            Some(libc::SIGINT) => "interrupted".to_string(),
            Some(sig) => format!("terminated by signal {}", sig),
            None => "terminated abnormally".to_string(),
        };
        Err(Error::HelperExecution(format!(
            "execution of {:?} failed: {}",
            helper_path.to_string(),
            detail
        )))
    }
}

/// A handle on one `start()` call: either an already-decided "no redo" or a
/// pending redo task.  Waiting consumes the handle and yields the result
/// (or the redo's failure).
pub struct RunHandle {
    data: Rc<ContextData>,
    state: HandleState,
}

enum HandleState {
    Immediate(Option<Result<RunResult>>),
    Pending(u64),
}

impl RunHandle {
    pub fn is_complete(&self) -> bool {
        match &self.state {
            HandleState::Immediate(_) => true,
            HandleState::Pending(tid) => !self.data.sequencer.borrow().is_pending(*tid),
        }
    }

    /// Force the redo (if any) to completion and take its result.
    pub fn wait(mut self) -> Result<RunResult> {
        match &mut self.state {
            HandleState::Immediate(result) => {
                result.take().unwrap_or_else(|| Err(unavailable_result()))
            }
            HandleState::Pending(tid) => {
                let tid = *tid;
                let root = self.data.root_rc();
                let driver = &root.specifics().driver;
                let mut sequencer = self.data.sequencer.borrow_mut();
                sequencer.complete(driver, tid);
                sequencer
                    .consume(tid)
                    .unwrap_or_else(|| Err(unavailable_result()))
            }
        }
    }
}

fn unavailable_result() -> Error {
    Error::Redo(anyhow::anyhow!(
        "redo result is no longer available (context closed or result already consumed)"
    ))
}

impl ToolInstance {
    /// Decide whether this instance needs a redo and, if so, schedule it.
    ///
    /// Must be called with an active context.  Never call this from inside
    /// a redo body: redo ordering is expressed by waiting on the returned
    /// handle before constructing dependent instances.
    pub fn start(&self, force_redo: bool) -> Result<RunHandle> {
        let data = context::active_data()?;
        start_in(self, force_redo, data)
    }
}

/// One current input dependency: live memo, whether it is explicit now, and
/// whether permission changes are ignored for it.
struct InputState {
    memo: FsObjectMemo,
    explicit: bool,
    ignore_permission: bool,
}

fn start_in(
    instance: &ToolInstance,
    force_redo: bool,
    data: Rc<ContextData>,
) -> Result<RunHandle> {
    let class = instance.class().clone();
    let root_rc = data.root_rc();
    let levels = root_rc.specifics().levels;

    if class.redo_body().is_none() {
        return Err(Error::Definition(format!(
            "tool class {:?} is abstract (it has no redo body)",
            class.name()
        )));
    }

    // -- preparation --------------------------------------------------

    let prepare = Cluster::new("prepare tool instance", levels.run_preparation, true, true);

    let param_digest = execution_parameter_digest(&class);
    let tool_inst_dbid = root_rc.specifics().with_db(|db| {
        db.register_tool_instance(&class.permanent_id(), &instance.fingerprint().0)
    })?;
    diag::inform(
        &format!("tool instance is {}", tool_inst_dbid),
        levels.run_preparation,
    );

    // Re-running an instance whose previous redo is still pending first
    // forces that redo to completion; its failure (if any) surfaces here.
    let pending_tid = data.sequencer.borrow().pending_tid_for_uid(tool_inst_dbid);
    if let Some(tid) = pending_tid {
        let serialize = Cluster::new(
            "wait for last redo to complete",
            levels.run_serialization,
            true,
            true,
        );
        {
            let driver = &root_rc.specifics().driver;
            let mut sequencer = data.sequencer.borrow_mut();
            sequencer.complete(driver, tid);
            // A failure of the earlier redo surfaces here; a success stays
            // stored for the earlier handle.
            if let Some(Err(e)) = sequencer.take_if(tid, |r| r.is_err()) {
                return Err(e);
            }
        }
        serialize.close();
    }
    prepare.close();

    // -- redo-necessity check -----------------------------------------

    let check = Cluster::new(
        &format!("check redo necessity for tool instance {}", tool_inst_dbid),
        levels.redo_necessity_check,
        true,
        true,
    );

    let root_path = root_rc.specifics().root_path().to_path_buf();

    // Live state of every input dependency, keyed by encoded path.
    let mut input_states: BTreeMap<String, InputState> = BTreeMap::new();
    // Definition files, checked separately.
    let mut definition_states: BTreeMap<String, FsObjectMemo> = BTreeMap::new();

    {
        let c = Cluster::new(
            "explicit input dependencies",
            levels.redo_necessity_check,
            true,
            true,
        );
        collect_explicit_inputs(instance, &root_rc, &mut input_states)?;

        // Definition files of the class that lie in the managed tree are
        // treated like explicit input dependencies.
        let mut definition_file_count = 0;
        for definition_file in class.definition_paths() {
            let tree_path = match TreePath::new(definition_file) {
                Ok(p) if !p.is_absolute() && p.is_normalized() => p,
                _ => continue,
            };
            match fs::read_memo(&root_path.join(tree_path.to_native())) {
                Ok(memo) if memo.stat.is_some() => {
                    if let Ok(encoded) = tree_path.encode() {
                        definition_states.insert(encoded, memo);
                        definition_file_count += 1;
                    }
                }
                // Definition files outside the managed tree are silently
                // ignored.
                _ => {}
            }
        }
        diag::inform(
            &format!(
                "added {} tool definition files as input dependency",
                definition_file_count
            ),
            levels.redo_necessity_check,
        );
        c.close();
    }

    let explicit_input_encoded: BTreeSet<String> = input_states
        .iter()
        .filter(|(_, s)| s.explicit)
        .map(|(p, _)| p.clone())
        .collect();

    let (outputs, obstructive, output_reason) = {
        let c = Cluster::new(
            "explicit output dependencies",
            levels.redo_necessity_check,
            true,
            true,
        );
        let r = collect_explicit_outputs(instance, &root_rc, &explicit_input_encoded)?;
        c.close();
        r
    };

    let (recorded, recorded_input_reason) = {
        let c = Cluster::new(
            "input dependencies of the last redo",
            levels.redo_necessity_check,
            true,
            true,
        );
        let recorded = root_rc
            .specifics()
            .with_db(|db| db.fsobject_inputs(tool_inst_dbid))?;
        let reason = collect_recorded_inputs(&recorded, &root_rc, &mut input_states);
        c.close();
        (recorded, reason)
    };

    let (envvar_values, envvar_digest) = {
        let c = Cluster::new(
            "environment variables",
            levels.redo_necessity_check,
            true,
            true,
        );
        let r = collect_envvar_values(instance, &data)?;
        c.close();
        r
    };

    let redo_state = root_rc
        .specifics()
        .with_db(|db| db.redo_state(tool_inst_dbid))?;

    // The decision: evaluated in a fixed order, one reported reason.
    let mut reason: Option<(String, Level)> = None;
    let note = |reason_slot: &mut Option<(String, Level)>, r: String, level: Level| {
        if reason_slot.is_none() {
            *reason_slot = Some((r, level));
        }
    };

    if force_redo {
        note(&mut reason, "redo requested by start".to_string(), levels.redo_reason);
    }

    let result_digest = redo_state.get(&rundb::ASPECT_RESULT);
    if result_digest.is_none() {
        note(
            &mut reason,
            "redo necessary because not run before".to_string(),
            levels.redo_reason,
        );
    }

    if let Some((path, output_reason)) = &output_reason {
        note(
            &mut reason,
            format!(
                "redo necessary because of filesystem object: {:?}\n  | reason: {}",
                path.to_string(),
                output_reason
            ),
            levels.redo_reason,
        );
    }

    if reason.is_none() {
        if let Some(r) = recorded_input_reason {
            note(&mut reason, r, levels.redo_reason);
        }
    }

    if reason.is_none() {
        for (encoded, state) in &input_states {
            let last = recorded.get(encoded).and_then(|(_, memo)| memo.as_deref());
            if let Some(change) = fs::compare_memo_to_recorded(
                &state.memo,
                last,
                state.explicit,
                state.ignore_permission,
            ) {
                note(
                    &mut reason,
                    format!(
                        "redo necessary because of filesystem object: {:?}\n  | reason: {}",
                        rundb_path_display(encoded),
                        change
                    ),
                    levels.redo_reason,
                );
                break;
            }
        }
    }

    if reason.is_none() {
        let recorded_params = redo_state
            .get(&rundb::ASPECT_EXECUTION_PARAMETERS)
            .cloned()
            .unwrap_or_default();
        if recorded_params != param_digest {
            note(
                &mut reason,
                "redo necessary because of changed execution parameter".to_string(),
                levels.redo_reason,
            );
        }
    }

    if reason.is_none() {
        let recorded_env = redo_state
            .get(&rundb::ASPECT_ENVIRONMENT_VARIABLES)
            .cloned()
            .unwrap_or_default();
        if recorded_env != envvar_digest {
            note(
                &mut reason,
                "redo necessary because of changed environment variable".to_string(),
                levels.redo_reason,
            );
        }
    }

    if reason.is_none() {
        for (encoded, memo) in &definition_states {
            let last = recorded.get(encoded).and_then(|(_, memo)| memo.as_deref());
            if let Some(change) = fs::compare_memo_to_recorded(memo, last, true, false) {
                note(
                    &mut reason,
                    format!(
                        "redo necessary because of definition file: {:?}\n  | reason: {}",
                        rundb_path_display(encoded),
                        change
                    ),
                    levels.redo_reason,
                );
                break;
            }
        }
    }

    if reason.is_none() {
        if let Some(digest) = result_digest {
            if rundb::decodes_as_redo_request(digest) {
                note(
                    &mut reason,
                    "redo requested by last successful redo".to_string(),
                    levels.redo_reason,
                );
            }
        }
    }

    // Guarding rule, evaluated last: an input whose mtime is not in the
    // past could still be written within the current working-tree-time
    // tick; a later change would be indistinguishable from the state about
    // to be recorded.  Trade a possibly redundant redo for the guarantee of
    // not missing one.
    if reason.is_none() {
        let now = root_rc.specifics().tree_time_ns()?;
        let all_inputs = input_states
            .iter()
            .map(|(encoded, state)| (encoded, &state.memo))
            .chain(definition_states.iter());
        for (encoded, memo) in all_inputs {
            if let Some(stat) = &memo.stat {
                if stat.mtime_ns >= now {
                    note(
                        &mut reason,
                        format!(
                            "redo necessary because mtime of input is not in the past: {:?}",
                            rundb_path_display(encoded)
                        ),
                        levels.redo_reason,
                    );
                    break;
                }
            }
        }
    }

    let (reason, reason_level) = match reason {
        None => {
            check.close();
            root_rc.specifics().register_successful_run(false);
            let result = RunResult::new(&class, false, instance);
            return Ok(RunHandle {
                data,
                state: HandleState::Immediate(Some(Ok(result))),
            });
        }
        Some(r) => r,
    };
    diag::inform(&reason, reason_level);
    check.close();

    // -- redo ---------------------------------------------------------

    if !obstructive.is_empty() {
        let c = Cluster::new(
            "remove obstructive filesystem objects that are explicit output dependencies",
            levels.redo_preparation,
            true,
            true,
        );
        let tmp = root_rc.specifics().temporary("", "", true)?;
        for p in &obstructive {
            worktree::remove_filesystem_object(
                &root_path.join(p.to_native()),
                Some(tmp.path()),
                true,
            )
            .map_err(|e| {
                Error::Dependency(format!(
                    "cannot remove obstructive filesystem object: {:?}\n  | reason: {}",
                    p.to_string(),
                    io_error_to_line(&e)
                ))
            })?;
        }
        c.close();
    }

    let result = Rc::new(RunResult::new(&class, true, instance));

    // Values of non-explicit env-var dependencies are determined by the
    // context; make them visible to the redo body up front.
    for (name, role) in class.roles() {
        if role.explicit() {
            continue;
        }
        let var_name = match role.env_var_name() {
            Some(v) => v,
            None => continue,
        };
        if let Some(value) = envvar_values.get(var_name) {
            let validated = role
                .validate(RawValue::Str(value.clone()))
                .map_err(|reason| {
                    Error::Redo(anyhow::anyhow!(
                        "input dependency {:?} cannot use environment variable {:?}: {}",
                        name,
                        var_name,
                        reason
                    ))
                })?;
            result.set_validated(name, Some(validated));
        }
    }

    let redo_context = Rc::new(RedoContext::new(data.clone(), outputs));
    let body = class.redo_body().expect("checked above").clone();

    let aftermath = AftermathArgs {
        root: root_rc.clone(),
        class: class.clone(),
        tool_inst_dbid,
        input_states,
        definition_states,
        explicit_input_encoded,
        param_digest,
        envvar_digest,
    };
    let result_for_task = result.clone();
    let context_for_task = redo_context.clone();
    let fut = async move {
        redo_with_aftermath(body, result_for_task, context_for_task, aftermath).await
    };

    let tid = {
        let driver = &root_rc.specifics().driver;
        let mut sequencer = data.sequencer.borrow_mut();
        sequencer.submit(
            driver,
            data.max_parallel_redo_count(),
            Some(tool_inst_dbid),
            fut,
        )
    };

    Ok(RunHandle {
        data,
        state: HandleState::Pending(tid),
    })
}

struct AftermathArgs {
    root: Rc<ContextData>,
    class: Rc<ToolClass>,
    tool_inst_dbid: i64,
    input_states: BTreeMap<String, InputState>,
    definition_states: BTreeMap<String, FsObjectMemo>,
    explicit_input_encoded: BTreeSet<String>,
    param_digest: Vec<u8>,
    envvar_digest: Vec<u8>,
}

async fn redo_with_aftermath(
    body: crate::tool::RedoBody,
    result: Rc<RunResult>,
    redo_context: Rc<RedoContext>,
    args: AftermathArgs,
) -> Result<RunResult> {
    let levels = args.root.specifics().levels;
    diag::inform(
        &format!("start redo for tool instance {}", args.tool_inst_dbid),
        levels.redo_start,
    );

    let redo_requested = body(Redo {
        result: result.clone(),
        context: redo_context.clone(),
    })
    .await
    .map_err(Error::Redo)?;

    let memorize = Cluster::new(
        &format!(
            "memorize successful redo for tool instance {}",
            args.tool_inst_dbid
        ),
        levels.redo_aftermath,
        true,
        true,
    );

    let specifics = args.root.specifics();

    // Non-explicit dependencies must have been assigned (or be optional);
    // their paths become recorded inputs or modified outputs.
    let mut nonexplicit_input_encoded: BTreeSet<String> = BTreeSet::new();
    let mut modified_encoded: BTreeSet<String> = BTreeSet::new();
    for (name, role) in args.class.roles() {
        if role.explicit() {
            continue;
        }
        if !result.is_assigned(name) {
            if role.required() {
                return Err(Error::Redo(anyhow::anyhow!(
                    "non-explicit dependency not assigned during redo: {:?}\n\
                     \x20 | assign it on the run result in the redo body",
                    name
                )));
            }
            result.set_validated(name, None);
        }
        if !role.is_fs_kind() {
            continue;
        }
        let paths: Vec<TreePath> = match result.value(name) {
            Some(value) => value.paths().into_iter().cloned().collect(),
            None => Vec::new(),
        };
        for p in paths {
            match role.category() {
                RoleCategory::Input => {
                    match working_tree_path_of(specifics, &p, false, false, true) {
                        Ok(rel) => {
                            if let Ok(encoded) = rel.encode() {
                                nonexplicit_input_encoded.insert(encoded);
                            }
                        }
                        Err(_) if p.is_absolute() => {
                            // Outside the managed tree: not tracked.
                        }
                        Err(e) => {
                            return Err(Error::Redo(anyhow::anyhow!(
                                "non-explicit input dependency {:?} contains a relative \
                                 path that is not a managed tree path: {:?} ({})",
                                name,
                                p.to_string(),
                                e.to_line()
                            )))
                        }
                    }
                }
                RoleCategory::Output | RoleCategory::Intermediate => {
                    let rel = working_tree_path_of(specifics, &p, false, false, true)
                        .map_err(|e| {
                            Error::Redo(anyhow::anyhow!(
                                "non-explicit output dependency {:?} contains a path that \
                                 is not a managed tree path: {:?} ({})",
                                name,
                                p.to_string(),
                                e.to_line()
                            ))
                        })?;
                    if let Ok(encoded) = rel.encode() {
                        modified_encoded.insert(encoded);
                    }
                }
            }
        }
    }

    for p in redo_context.modified_outputs() {
        if let Ok(encoded) = p.encode() {
            modified_encoded.insert(encoded);
        }
    }

    // Record the state from before this redo: explicit inputs and
    // definition files with their memos, plus the non-explicit inputs this
    // redo discovered (their pre-redo state is unknown).  Recorded inputs
    // that are neither are obsolete and dropped.
    let mut info: Vec<(String, bool, Option<Vec<u8>>)> = Vec::new();
    for (encoded, state) in &args.input_states {
        let is_explicit = args.explicit_input_encoded.contains(encoded);
        if is_explicit || nonexplicit_input_encoded.contains(encoded) {
            info.push((encoded.clone(), is_explicit, Some(fs::encode_memo(&state.memo))));
        }
    }
    for (encoded, memo) in &args.definition_states {
        if !args.input_states.contains_key(encoded) {
            info.push((encoded.clone(), true, Some(fs::encode_memo(memo))));
        }
    }
    let already_known: BTreeSet<String> = info.iter().map(|(p, _, _)| p.clone()).collect();
    for encoded in &nonexplicit_input_encoded {
        if !already_known.contains(encoded) {
            info.push((encoded.clone(), false, None));
        }
    }

    let aspects = vec![
        (
            rundb::ASPECT_RESULT,
            Some(Database::result_digest(redo_requested)),
        ),
        (
            rundb::ASPECT_EXECUTION_PARAMETERS,
            (!args.param_digest.is_empty()).then(|| args.param_digest.clone()),
        ),
        (
            rundb::ASPECT_ENVIRONMENT_VARIABLES,
            (!args.envvar_digest.is_empty()).then(|| args.envvar_digest.clone()),
        ),
    ];

    let modified: Vec<String> = modified_encoded.into_iter().collect();
    specifics.with_db(|db| {
        db.commit_if_overdue()?;
        db.update_dependencies_and_state(args.tool_inst_dbid, &info, &aspects, &modified)
    })?;

    memorize.close();
    specifics.register_successful_run(true);

    drop(redo_context);
    Ok(Rc::try_unwrap(result).unwrap_or_else(|rc| (*rc).clone()))
}

fn collect_explicit_inputs(
    instance: &ToolInstance,
    root_rc: &Rc<ContextData>,
    input_states: &mut BTreeMap<String, InputState>,
) -> Result<()> {
    let specifics = root_rc.specifics();
    for (name, role) in instance.class().roles() {
        if !role.explicit() || role.category() != RoleCategory::Input || !role.is_fs_kind() {
            continue;
        }
        let value = match instance.value(name) {
            Some(v) => v.clone(),
            None => continue,
        };
        for p in value.paths() {
            let rel = match working_tree_path_of(specifics, p, false, false, false) {
                Ok(rel) => rel,
                // Absolute paths outside the managed tree are legal inputs
                // but are not change-tracked.
                Err(_) if p.is_absolute() => continue,
                Err(e) => {
                    return Err(Error::Dependency(format!(
                        "input dependency {:?} contains an invalid path: {:?}\n\
                         \x20 | reason: {}",
                        name,
                        p.to_string(),
                        e.to_line()
                    )))
                }
            };
            let encoded = rel.encode().map_err(|e| {
                Error::Dependency(format!(
                    "input dependency {:?} contains an invalid path: {:?}\n  | reason: {}",
                    name,
                    p.to_string(),
                    e
                ))
            })?;
            if input_states.contains_key(&encoded) {
                continue;
            }
            let abs = specifics.root_path().join(rel.to_native());
            let memo = fs::read_memo(&abs).map_err(|e| {
                Error::Dependency(format!(
                    "input dependency {:?} contains a path of an inaccessible filesystem \
                     object: {:?}\n  | reason: {}",
                    name,
                    p.to_string(),
                    io_error_to_line(&e)
                ))
            })?;
            // An existing object of the wrong kind is a script error; an
            // absent one merely forces the redo.
            if memo.stat.is_some() {
                if let Err(kind_error) = check_memo_kind(role.kind(), memo.kind()) {
                    return Err(Error::Dependency(format!(
                        "input dependency {:?} contains an invalid path: {:?}\n\
                         \x20 | reason: {}",
                        name,
                        p.to_string(),
                        kind_error
                    )));
                }
            }
            input_states.insert(
                encoded,
                InputState {
                    memo,
                    explicit: true,
                    ignore_permission: role.ignores_permission(),
                },
            );
        }
    }
    Ok(())
}

type OutputCollection = (
    FxHashMap<TreePath, OutputSpec>,
    Vec<TreePath>,
    Option<(TreePath, String)>,
);

fn collect_explicit_outputs(
    instance: &ToolInstance,
    root_rc: &Rc<ContextData>,
    explicit_input_encoded: &BTreeSet<String>,
) -> Result<OutputCollection> {
    let specifics = root_rc.specifics();
    let mut outputs: FxHashMap<TreePath, OutputSpec> = FxHashMap::default();
    let mut seen_encoded: BTreeMap<String, String> = BTreeMap::new();
    let mut obstructive: Vec<TreePath> = Vec::new();
    let mut reason: Option<(TreePath, String)> = None;

    for (name, role) in instance.class().roles() {
        if !role.explicit() || role.category() == RoleCategory::Input || !role.is_fs_kind() {
            continue;
        }
        let value = match instance.value(name) {
            Some(v) => v.clone(),
            None => continue,
        };
        for p in value.paths() {
            let rel = working_tree_path_of(specifics, p, false, false, false).map_err(|e| {
                Error::Dependency(format!(
                    "output dependency {:?} contains a path that is not a managed tree \
                     path: {:?}\n  | reason: {}",
                    name,
                    p.to_string(),
                    e.to_line()
                ))
            })?;
            let encoded = rel.encode().map_err(|e| {
                Error::Dependency(format!(
                    "output dependency {:?} contains an invalid path: {:?}\n  | reason: {}",
                    name,
                    p.to_string(),
                    e
                ))
            })?;
            if explicit_input_encoded.contains(&encoded) {
                return Err(Error::Dependency(format!(
                    "output dependency {:?} contains a path that is also an explicit input \
                     dependency: {:?}",
                    name,
                    p.to_string()
                )));
            }
            if let Some(other) = seen_encoded.get(&encoded) {
                return Err(Error::Dependency(format!(
                    "output dependencies {:?} and {:?} both contain the same path: {:?}",
                    name,
                    other,
                    p.to_string()
                )));
            }
            seen_encoded.insert(encoded, name.clone());
            outputs.insert(
                rel.clone(),
                OutputSpec {
                    kind: role.kind().clone(),
                    replace_by_same_content: role.replaces_by_same_content(),
                },
            );

            // Intermediates are never a reason for a redo.
            if role.category() == RoleCategory::Intermediate {
                continue;
            }

            let abs = specifics.root_path().join(rel.to_native());
            match fs::read_memo(&abs) {
                Ok(memo) if memo.stat.is_none() => {
                    if reason.is_none() {
                        reason = Some((rel.clone(), "output does not exist".to_string()));
                    }
                }
                Ok(memo) => {
                    if let Err(kind_error) = check_memo_kind(role.kind(), memo.kind()) {
                        obstructive.push(rel.clone());
                        if reason.is_none() {
                            reason = Some((rel.clone(), kind_error.to_string()));
                        }
                    }
                }
                Err(e) => {
                    if reason.is_none() {
                        reason = Some((rel.clone(), io_error_to_line(&e)));
                    }
                }
            }
        }
    }
    Ok((outputs, obstructive, reason))
}

/// Stat the recorded non-explicit inputs of the last redo that the current
/// binding no longer names, and fold them into `input_states`.  Returns a
/// redo reason when one of them is gone or unreadable.
fn collect_recorded_inputs(
    recorded: &FxHashMap<String, (bool, Option<Vec<u8>>)>,
    root_rc: &Rc<ContextData>,
    input_states: &mut BTreeMap<String, InputState>,
) -> Option<String> {
    let specifics = root_rc.specifics();
    let mut reason: Option<String> = None;
    let note = |slot: &mut Option<String>, r: String| {
        if slot.is_none() {
            *slot = Some(r);
        }
    };
    let mut sorted: Vec<(&String, &(bool, Option<Vec<u8>>))> = recorded.iter().collect();
    sorted.sort_by_key(|(p, _)| p.as_str());

    for (encoded, (was_explicit, last_memo)) in sorted {
        if *was_explicit || input_states.contains_key(encoded) {
            continue;
        }
        let mut memo = FsObjectMemo::default();
        match TreePath::decode(encoded, false) {
            Err(_) => {
                note(
                    &mut reason,
                    format!(
                        "redo necessary because of invalid encoded path: {:?}",
                        encoded
                    ),
                );
            }
            Ok(path) => {
                let abs = specifics.root_path().join(path.to_native());
                match fs::read_memo(&abs) {
                    Ok(m) => memo = m,
                    Err(_) => {
                        note(
                            &mut reason,
                            format!(
                                "redo necessary because of inaccessible filesystem object: \
                                 {:?}",
                                path.to_string()
                            ),
                        );
                    }
                }
                if memo.stat.is_none() {
                    // Gone now; only a change if it existed before.
                    let existed_before = last_memo
                        .as_deref()
                        .map(|m| {
                            fs::decode_memo(m)
                                .map(|d| d.stat.is_some())
                                .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    if existed_before {
                        note(
                            &mut reason,
                            format!(
                                "redo necessary because of non-existent filesystem object: \
                                 {:?}",
                                path.to_string()
                            ),
                        );
                    }
                }
            }
        }
        input_states.insert(
            encoded.clone(),
            InputState {
                memo,
                explicit: false,
                ignore_permission: false,
            },
        );
    }
    reason
}

/// Gather the values of all environment-variable dependencies and their
/// digest.
fn collect_envvar_values(
    instance: &ToolInstance,
    data: &Rc<ContextData>,
) -> Result<(BTreeMap<String, String>, Vec<u8>)> {
    let mut value_by_name: BTreeMap<String, String> = BTreeMap::new();
    let mut role_by_var: BTreeMap<String, String> = BTreeMap::new();

    for (name, role) in instance.class().roles() {
        let var_name = match role.env_var_name() {
            Some(v) => v.to_string(),
            None => continue,
        };
        if let Some(other) = role_by_var.get(&var_name) {
            return Err(Error::Dependency(format!(
                "input dependencies {:?} and {:?} both define the same environment \
                 variable: {:?}",
                name, other, var_name
            )));
        }
        role_by_var.insert(var_name.clone(), name.clone());

        if role.explicit() {
            if let Some(DependencyValue::EnvVar(ev)) = instance.value(name) {
                value_by_name.insert(ev.name.clone(), ev.raw.clone());
            }
        } else {
            let value = match value_by_name.get(&var_name) {
                Some(v) => Some(v.clone()),
                None => context::env_value(data, &var_name),
            };
            match value {
                Some(v) => {
                    value_by_name.insert(var_name, v);
                }
                None if role.required() => {
                    return Err(Error::Redo(anyhow::anyhow!(
                        "not a defined environment variable in the context: {:?}\n\
                         \x20 | use Context::import_env_from_outer() or Context::set_env()",
                        var_name
                    )))
                }
                None => {}
            }
        }
    }

    let mut encoded = Vec::new();
    for (name, value) in &value_by_name {
        ParamValue::Str(name.clone()).write_canonical(&mut encoded);
        ParamValue::Str(value.clone()).write_canonical(&mut encoded);
    }
    Ok((value_by_name, digest_or_raw(encoded)))
}

fn execution_parameter_digest(class: &Rc<ToolClass>) -> Vec<u8> {
    let mut encoded = Vec::new();
    for (name, value) in class.params() {
        ParamValue::Str(name.clone()).write_canonical(&mut encoded);
        value.write_canonical(&mut encoded);
    }
    digest_or_raw(encoded)
}

/// Short byte strings identify themselves; longer ones are hashed.
fn digest_or_raw(encoded: Vec<u8>) -> Vec<u8> {
    if encoded.len() >= 32 {
        Sha256::digest(&encoded).to_vec()
    } else {
        encoded
    }
}

fn rundb_path_display(encoded: &str) -> String {
    match TreePath::decode(encoded, false) {
        Ok(p) => p.to_string(),
        Err(_) => encoded.to_string(),
    }
}
