//! Two-sink logging bootstrap (spec §7): console at ERROR, raised to INFO
//! (or DEBUG via `--debug`) when verbose, plus a DEBUG sink tagged with the
//! session id and PID aimed at `log_file` — `systemd`/`syslog` labels route
//! to stderr (journal and syslog both capture a process's stderr), anything
//! else is treated as a filesystem path appended to.
//!
//! Built on `fern` as the `log` backend, since it supports two
//! independently-filtered sinks active at once, which `env_logger`-family
//! backends do not.

use log::LevelFilter;
use uuid::Uuid;

use crate::Result;

pub fn init(log_file: &str, console_level: LevelFilter, session_id: Uuid) -> Result<()> {
    let pid = std::process::id();

    let console = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} pid={}] {:<5} {}: {}",
                session_id, pid, record.level(), record.target(), message
            ))
        })
        .level(console_level)
        .chain(std::io::stderr());

    let detail = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{} pid={}] {:<5} {}: {}",
                chrono::Utc::now().to_rfc3339(),
                session_id,
                pid,
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Debug);

    let detail = match log_file {
        "systemd" | "syslog" => detail.chain(std::io::stderr()),
        path => detail.chain(fern::log_file(path)?),
    };

    fern::Dispatch::new()
        .chain(console)
        .chain(detail)
        .apply()
        .map_err(|e| format_err!("logger already initialized: {}", e))?;

    Ok(())
}
