//! The ping session engine (spec §4.2).

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::Utc;
use failure::ResultExt;

use storage_core::config::{Config, SnapshotMode};
use storage_core::{placement, retention, snapshot, AgentErrorKind, ApiClient, RuntimeLock};

use crate::sync::{self, SyncRequest};
use crate::Result;

/// The stdin handshake JSON (spec §6).
#[derive(Debug, Default, Deserialize)]
pub struct Handshake {
    pub port: u16,
    #[serde(default)]
    pub verbose: bool,
    pub action: Option<String>,
    #[serde(default)]
    pub sources: HashMap<String, SourceOverride>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SourceOverride {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduledSource {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub filter: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub retention: Option<String>,
    pub bwlimit: Option<u64>,
    pub snapshot_mode: Option<SnapshotMode>,
    #[serde(default)]
    pub large_rotating_files: bool,
    #[serde(default)]
    pub large_modifying_files: bool,
}

#[derive(Debug, Deserialize)]
pub struct Machine {
    pub uuid: String,
    pub unit_name: String,
    pub service_name: Option<String>,
    pub environment_name: Option<String>,
    pub scheduled_sources: HashMap<String, ScheduledSource>,
}

#[derive(Debug, Deserialize)]
pub struct CheckinResponse {
    pub machine: Machine,
}

#[derive(Serialize)]
struct StorageIdentity<'a> {
    name: &'a str,
    secret: &'a str,
}

#[derive(Serialize)]
struct CheckinRequest<'a> {
    storage: StorageIdentity<'a>,
    machine: MachineRef<'a>,
}

#[derive(Serialize)]
struct MachineRef<'a> {
    uuid: &'a str,
}

#[derive(Serialize)]
struct SourceReport {
    success: bool,
    snapshot: Option<String>,
    summary: String,
    time_begin: String,
    time_end: String,
}

#[derive(Serialize)]
struct SourceUpdateRequest<'a> {
    storage: StorageIdentity<'a>,
    machine: MachineUpdate<'a>,
}

#[derive(Serialize)]
struct MachineUpdate<'a> {
    uuid: &'a str,
    sources: HashMap<String, SourceReport>,
}

/// Read the JSON handshake from `reader`: either EOF-terminated or
/// terminated by a line containing a single `.` (spec §4.2, §6).
pub fn read_handshake<R: BufRead>(reader: &mut R) -> Result<Handshake> {
    let mut buf = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if line.trim_end() == "." {
            break;
        }
        buf.push_str(&line);
    }
    serde_json::from_str(&buf)
        .with_context(|_| AgentErrorKind::ConfigIncomplete("malformed stdin handshake".into()))
        .map_err(Into::into)
}

/// Run one ping session end-to-end for machine `uuid` (spec §4.2).
pub fn run(config: &Config, uuid: &str, handshake: Handshake) -> Result<()> {
    let lock_path = config.lock_dir.join(format!("turku-storage-ping-{}.lock", uuid));
    let _lock = RuntimeLock::acquire(&lock_path, &format!("ping:{}", uuid))?;

    if handshake.action.as_deref() == Some("restore") {
        return run_restore_passthrough();
    }

    let api = ApiClient::new(&config.api_url)?;
    let checkin: CheckinResponse = api.post(
        "storage_ping_checkin",
        &CheckinRequest {
            storage: StorageIdentity { name: &config.name, secret: &config.secret },
            machine: MachineRef { uuid },
        },
    )?;

    let machine = checkin.machine;
    let machine_dir = ensure_machine_dir(config, &machine.uuid)?;
    refresh_friendly_symlink(config, &machine)?;

    let mut reports: HashMap<String, SourceReport> = HashMap::new();
    for (name, scheduled) in &machine.scheduled_sources {
        let report = match process_source(config, &handshake, &machine_dir, name, scheduled) {
            Ok(report) => report,
            Err(e) => {
                warn!("source '{}' failed: {}", name, e);
                SourceReport {
                    success: false,
                    snapshot: None,
                    summary: format!("{}", e),
                    time_begin: Utc::now().to_rfc3339(),
                    time_end: Utc::now().to_rfc3339(),
                }
            }
        };
        reports.insert(name.clone(), report);
    }

    api.post::<_, serde_json::Value>(
        "storage_ping_source_update",
        &SourceUpdateRequest {
            storage: StorageIdentity { name: &config.name, secret: &config.secret },
            machine: MachineUpdate { uuid: &machine.uuid, sources: reports },
        },
    )?;

    Ok(())
}

fn run_restore_passthrough() -> Result<()> {
    // S5: interactive console passthrough, no API or filesystem interaction.
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();
    let mut buf = [0u8; 4096];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
    }
    Ok(())
}

fn ensure_machine_dir(config: &Config, uuid: &str) -> Result<PathBuf> {
    let machines_dir = config.var_dir.join("machines");
    fs::create_dir_all(&machines_dir)?;
    let link_path = machines_dir.join(uuid);

    if let Ok(target) = fs::read_link(&link_path) {
        return Ok(target);
    }

    let volumes = storage_core::volume::stat_all(config.volumes.iter());
    let chosen = placement::choose_volume(&volumes)
        .map_err(|_| AgentErrorKind::NoSuitableVolume)?;
    let target = chosen.path.join(uuid);
    fs::create_dir_all(&target)?;
    symlink(&target, &link_path)?;
    Ok(target)
}

fn refresh_friendly_symlink(config: &Config, machine: &Machine) -> Result<()> {
    let mut parts = Vec::new();
    if let Some(env) = &machine.environment_name {
        parts.push(env.replace('/', "_"));
    }
    if let Some(service) = &machine.service_name {
        parts.push(service.replace('/', "_"));
    }
    parts.push(machine.unit_name.replace('/', "_"));
    let friendly = parts.join("-");

    let machines_dir = config.var_dir.join("machines");
    let link_path = machines_dir.join(&friendly);
    let _ = fs::remove_file(&link_path);
    symlink(&machine.uuid, &link_path)?;
    Ok(())
}

fn process_source(
    config: &Config,
    handshake: &Handshake,
    machine_dir: &Path,
    name: &str,
    scheduled: &ScheduledSource,
) -> Result<SourceReport> {
    let time_begin = Utc::now();

    // Step 1: credentials, override wins.
    let override_creds = handshake.sources.get(name);
    let username = override_creds
        .and_then(|o| o.username.clone())
        .or_else(|| scheduled.username.clone());
    let password = override_creds
        .and_then(|o| o.password.clone())
        .or_else(|| scheduled.password.clone());
    let (username, password) = match (username, password) {
        (Some(u), Some(p)) => (u, p),
        _ => return Err(AgentErrorKind::SourceCredsMissing(name.to_string()).into()),
    };

    // Step 2: effective snapshot mode.
    let mut mode = config.snapshot_mode;
    if mode == SnapshotMode::LinkDest && (scheduled.large_rotating_files || scheduled.large_modifying_files) {
        mode = SnapshotMode::None;
    }
    if let Some(source_mode) = scheduled.snapshot_mode {
        mode = source_mode;
    }

    let source_dir = machine_dir.join(name);
    let snapshots_dir = machine_dir.join(format!("{}.snapshots", name));
    fs::create_dir_all(&source_dir)?;

    // Step 3 (placement) already resolved the machine directory; nothing
    // source-specific to place here.

    let base_snapshot = if mode == SnapshotMode::LinkDest {
        latest_snapshot_path(&snapshots_dir)
    } else {
        None
    };

    // Step 4: build the sync invocation.
    let filter_file = if !scheduled.filter.is_empty() || !scheduled.exclude.is_empty() {
        let path = config.var_dir.join(format!(".filter-{}-{}.tmp", name, uuid::Uuid::new_v4()));
        sync::write_filter_merge_file(&path, &scheduled.filter, &scheduled.exclude)?;
        Some(path)
    } else {
        None
    };

    let req = SyncRequest {
        source_name: name,
        user: &username,
        port: handshake.port,
        local_dest: &source_dir,
        snapshot_mode: mode,
        link_dest: base_snapshot.as_deref(),
        preserve_hard_links: config.preserve_hard_links,
        filter_merge_file: filter_file.as_deref(),
        bwlimit: scheduled.bwlimit,
    };
    let argv = sync::build_argv(&req);
    let outcome = sync::run(&argv, Some(&password))?;

    if let Some(path) = &filter_file {
        let _ = fs::remove_file(path);
    }

    let time_end = Utc::now();

    if !outcome.success {
        return Ok(SourceReport {
            success: false,
            snapshot: None,
            summary: format!("rsync exited with return code {}", outcome.exit_code),
            time_begin: time_begin.to_rfc3339(),
            time_end: time_end.to_rfc3339(),
        });
    }

    // Step 6: commit.
    let snapshot_name = if mode == SnapshotMode::LinkDest {
        let committed = commit_snapshot(&source_dir, &snapshots_dir, time_end)?;
        if let Some(policy) = &scheduled.retention {
            apply_retention(&snapshots_dir, policy, time_end)?;
        }
        Some(committed)
    } else {
        None
    };

    Ok(SourceReport {
        success: true,
        snapshot: snapshot_name,
        summary: "ok".to_string(),
        time_begin: time_begin.to_rfc3339(),
        time_end: time_end.to_rfc3339(),
    })
}

fn latest_snapshot_path(snapshots_dir: &Path) -> Option<PathBuf> {
    let latest = snapshots_dir.join("latest");
    if latest.exists() {
        Some(latest)
    } else {
        None
    }
}

fn commit_snapshot(source_dir: &Path, snapshots_dir: &Path, now: chrono::DateTime<Utc>) -> Result<String> {
    fs::create_dir_all(snapshots_dir)?;
    let name = snapshot::format(now);
    let dest = snapshots_dir.join(&name);
    fs::rename(source_dir, &dest)?;
    fs::create_dir_all(source_dir)?;

    let latest_link = snapshots_dir.join("latest");
    let _ = fs::remove_file(&latest_link);
    symlink(&dest, &latest_link)?;

    Ok(name)
}

fn apply_retention(snapshots_dir: &Path, policy: &str, now: chrono::DateTime<Utc>) -> Result<()> {
    let entries: Vec<snapshot::SnapshotName> = fs::read_dir(snapshots_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| snapshot::parse(&name))
        .collect();

    let to_delete = retention::evaluate(policy, &entries, now);
    for name in to_delete {
        let original = snapshots_dir.join(&name);
        let staged = snapshots_dir.join(format!("_delete-{}", name));
        if fs::rename(&original, &staged).is_ok() {
            let _ = fs::remove_dir_all(&staged);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_handshake_terminated_by_dot_line() {
        let input = "{\"port\": 2222, \"verbose\": true}\n.\ntrailing garbage ignored\n";
        let mut cursor = Cursor::new(input.as_bytes());
        let handshake = read_handshake(&mut cursor).unwrap();
        assert_eq!(handshake.port, 2222);
        assert!(handshake.verbose);
    }

    #[test]
    fn reads_handshake_terminated_by_eof() {
        let input = "{\"port\": 1111}";
        let mut cursor = Cursor::new(input.as_bytes());
        let handshake = read_handshake(&mut cursor).unwrap();
        assert_eq!(handshake.port, 1111);
    }

    #[test]
    fn restore_action_is_recognized() {
        let input = "{\"port\": 2222, \"action\": \"restore\"}";
        let mut cursor = Cursor::new(input.as_bytes());
        let handshake = read_handshake(&mut cursor).unwrap();
        assert_eq!(handshake.action.as_deref(), Some("restore"));
    }
}
