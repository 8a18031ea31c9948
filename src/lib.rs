//! anew: a dependency-aware incremental execution library.
//!
//! Scripts declare tool classes (a dependency shape plus a redo body),
//! bind them into immutable tool instances, and run them inside an
//! execution context rooted in a working tree.  For every run the engine
//! decides, from the persisted state of the previous successful redo,
//! whether re-execution is necessary, and reports a human-readable reason
//! when it is.  Change detection is based on filesystem metadata compared
//! against a logical clock sampled from the working tree itself, so it
//! stays sound on filesystems with coarse or misbehaving mtime resolution.

mod context;
mod depend;
mod diag;
mod error;
mod fs;
mod path;
mod run;
mod rundb;
mod seq;
mod tool;
mod worktree;

pub use context::{Config, Context, ContextOptions};
pub use depend::{
    DependencyValue, EnvVarCapture, EnvVarValue, Multiplicity, ParamValue, RawValue, Role,
    RoleCategory, RoleKind,
};
pub use diag::{ConsoleSink, DiagnosticSink, Level, LevelConfig};
pub use error::{Error, Result};
pub use fs::{FsKind, FsObjectMemo, StatSummary};
pub use path::{PathError, TreePath};
pub use run::{ExecOpts, HelperArg, OutputMode, Redo, RedoContext, RunHandle, RunResult};
pub use rundb::RunSummary;
pub use tool::{DefinitionLocation, Fingerprint, ToolClass, ToolClassBuilder, ToolInstance};
pub use worktree::{Temporary, MANAGEMENT_DIR_NAME};
