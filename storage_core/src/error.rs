//! The closed error taxonomy of the storage agent (spec §7).
//!
//! A single coherent taxonomy shared by the config loader, lock, API
//! client, placement policy and ping session, rather than one kind enum
//! per subsystem. One enum keeps call sites able to match on a kind without
//! threading per-module error types through the session loop.

use std::fmt;

use failure::{Backtrace, Context, Fail};

/// All failure kinds the agent can report, per spec §7.
#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub enum AgentErrorKind {
    #[fail(display = "incomplete configuration: {}", _0)]
    ConfigIncomplete(String),

    #[fail(display = "{} is busy: lock '{}' already held", _0, _1)]
    Busy(String, String),

    #[fail(display = "no suitable volume accepts new machines")]
    NoSuitableVolume,

    #[fail(display = "transport error calling '{}': {}", _0, _1)]
    TransportError(String, String),

    #[fail(display = "API error from '{}': {}", _0, _1)]
    ApiError(String, String),

    #[fail(display = "rsync exited with return code {}", _0)]
    SyncFailure(i32),

    #[fail(display = "credentials missing for source '{}'", _0)]
    SourceCredsMissing(String),
}

/// Wraps [`AgentErrorKind`] in a `Context` so a cause chain is preserved
/// through `?`.
#[derive(Debug)]
pub struct AgentError {
    inner: Context<AgentErrorKind>,
}

impl AgentError {
    pub fn kind(&self) -> &AgentErrorKind {
        self.inner.get_context()
    }
}

impl Fail for AgentError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<AgentErrorKind> for AgentError {
    fn from(kind: AgentErrorKind) -> AgentError {
        AgentError { inner: Context::new(kind) }
    }
}

impl From<Context<AgentErrorKind>> for AgentError {
    fn from(inner: Context<AgentErrorKind>) -> AgentError {
        AgentError { inner }
    }
}
