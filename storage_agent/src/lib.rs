#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;

extern crate chrono;

#[macro_use]
extern crate log;
extern crate fern;

extern crate uuid;

#[macro_use]
extern crate failure;

extern crate storage_core;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Two-sink logging bootstrap (console + file/syslog/journal), per §7.
pub mod logging;

/// Sync-subprocess invocation and streamed output consumption (§4.2 step 4-5, §9).
pub mod sync;

/// The ping session engine (§4.2).
pub mod session;

/// The config refresh engine (§4.5).
pub mod refresh;
