#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

extern crate glob;
extern crate reqwest;

extern crate chrono;
extern crate fs2;
extern crate libc;
extern crate rand;
extern crate regex;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The closed error taxonomy of §7.
pub mod error;
pub use error::{AgentError, AgentErrorKind};

/// Configuration loading, deep-merge, and validated defaults.
pub mod config;
pub use config::Config;

// Deep-merge behaviour for config fragments.
mod merge;

/// The per-resource advisory runtime lock.
pub mod lock;
pub use lock::RuntimeLock;

/// A minimal JSON-over-HTTP client to the coordinator API.
pub mod api;
pub use api::ApiClient;

/// Volume sizing and the runtime volume view.
pub mod volume;
pub use volume::Volume;

/// Free-space-weighted placement of new machines across volumes.
pub mod placement;

/// Snapshot name parsing.
pub mod snapshot;

/// The retention DSL evaluator.
pub mod retention;

/// Atomic write-then-rename helper.
pub mod safewrite;
