//! Error taxonomy of the execution engine.
//!
//! Message convention: the first line summarizes, continuation lines are
//! prefixed with `  | ` and carry the reason or a suggested resolution.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The current directory is not the root of a working tree.
    #[error("{0}")]
    NoWorkingTree(String),

    /// The management tree is unreachable, corrupt, or cannot be prepared.
    #[error("{0}")]
    ManagementTree(String),

    /// The working-tree time misbehaved (did not advance, or similar).
    #[error("{0}")]
    WorkingTreeTime(String),

    /// An operation that needs an active context was called without one.
    #[error("no context is active")]
    NotRunning,

    /// Contexts were exited out of LIFO order.  Fatal to the current run.
    #[error("contexts must be exited in the reverse order of their entry")]
    ContextNesting,

    /// Mutation of a context that is not the innermost active one.
    #[error("{0}")]
    ContextModification(String),

    /// A path is not a usable working-tree path.
    #[error("{0}")]
    WorkingTreePath(String),

    /// Two tool classes share a definition location.
    #[error("{0}")]
    DefinitionAmbiguity(String),

    /// A malformed tool class: bad role/parameter names, an illegal
    /// narrowing of an inherited role, or a missing redo body.
    #[error("{0}")]
    Definition(String),

    /// A constructor argument failed dependency-role validation.
    #[error("{0}")]
    Dependency(String),

    /// An execution parameter has a value that cannot be canonicalized.
    #[error("{0}")]
    ExecutionParameter(String),

    /// A redo body failed, or violated the redo contract (e.g. left a
    /// required non-explicit dependency unassigned).
    #[error("redo failed\n  | reason: {0}")]
    Redo(#[source] anyhow::Error),

    /// A helper process terminated with an unexpected exit status.
    #[error("{0}")]
    HelperExecution(String),

    /// The run-database misbehaved.
    #[error("{0}")]
    Database(String),
}

impl Error {
    /// First line of an error's message, for embedding as a reason line.
    pub(crate) fn to_line(&self) -> String {
        let text = self.to_string();
        text.lines().next().unwrap_or("").to_string()
    }
}

pub(crate) fn io_error_to_line(err: &std::io::Error) -> String {
    err.to_string().lines().next().unwrap_or("").to_string()
}
