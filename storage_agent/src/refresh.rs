//! The config refresh engine (spec §4.5).

use std::collections::{HashMap, HashSet};
use std::fs;

use storage_core::config::Config;
use storage_core::{safewrite, volume, ApiClient, RuntimeLock};

use crate::Result;

#[derive(Serialize)]
struct StorageIdentity<'a> {
    name: &'a str,
    secret: &'a str,
    ssh_ping_host: &'a str,
    ssh_ping_port: u16,
    ssh_ping_user: &'a str,
    ssh_ping_host_keys: &'a [String],
    space_total: f64,
    space_available: f64,
}

#[derive(Serialize)]
struct AuthIdentity<'a> {
    name: &'a str,
    secret: &'a str,
}

#[derive(Serialize)]
struct UpdateConfigRequest<'a> {
    storage: StorageIdentity<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthIdentity<'a>>,
}

#[derive(Debug, Deserialize)]
struct RemoteMachine {
    ssh_public_key: String,
    unit_name: String,
}

#[derive(Debug, Deserialize)]
struct UpdateConfigResponse {
    machines: HashMap<String, RemoteMachine>,
}

/// Run one config refresh cycle end-to-end (spec §4.5).
pub fn run(config: &Config, api_auth_name: Option<&str>, api_auth_secret: Option<&str>) -> Result<()> {
    let lock_path = config.lock_dir.join("turku-storage-update-config.lock");
    let _lock = RuntimeLock::acquire(&lock_path, "update-config")?;

    let volumes = volume::stat_all(config.volumes.iter());
    let (space_total, space_available) = deduplicated_totals(&volumes);

    let api = ApiClient::new(&config.api_url)?;
    let auth = match (api_auth_name.or(config.api_auth_name.as_deref()), api_auth_secret.or(config.api_auth_secret.as_deref())) {
        (Some(name), Some(secret)) => Some(AuthIdentity { name, secret }),
        _ => None,
    };

    let response: UpdateConfigResponse = api.post(
        "storage_update_config",
        &UpdateConfigRequest {
            storage: StorageIdentity {
                name: &config.name,
                secret: &config.secret,
                ssh_ping_host: &config.ssh_ping_host,
                ssh_ping_port: config.ssh_ping_port,
                ssh_ping_user: &config.ssh_ping_user,
                ssh_ping_host_keys: &config.ssh_ping_host_keys,
                space_total,
                space_available,
            },
            auth,
        },
    )?;

    render_authorized_keys(config, &response.machines)?;
    Ok(())
}

/// Sum `total`/`available` MiB across volumes, counting each underlying
/// device once (spec §4.5 "deduplicated by device id"). Non-accepting or
/// over-high-water volumes still contribute to `space_total` but zero to
/// `space_available`.
fn deduplicated_totals(volumes: &[storage_core::Volume]) -> (f64, f64) {
    let mut seen_devices = HashSet::new();
    let mut total = 0.0;
    let mut available = 0.0;
    for vol in volumes {
        if !seen_devices.insert(vol.device_id) {
            continue;
        }
        total += vol.total_mib;
        if vol.effectively_accepts_new() {
            available += vol.available_mib;
        }
    }
    (total, available)
}

fn render_authorized_keys(config: &Config, machines: &HashMap<String, RemoteMachine>) -> Result<()> {
    let mut body = String::new();
    body.push_str("# Generated by turku-storage-update-config. Do not edit directly;\n");
    body.push_str(&format!("# add static entries to {}.static instead.\n", config.authorized_keys_file.display()));

    let static_path = config.authorized_keys_file.with_extension("static");
    if let Ok(static_contents) = fs::read_to_string(&static_path) {
        body.push_str(&static_contents);
    }

    let mut uuids: Vec<&String> = machines.keys().collect();
    uuids.sort();
    for uuid in uuids {
        let machine = &machines[uuid];
        body.push_str(&format!(
            "no-pty,no-agent-forwarding,no-X11-forwarding,no-user-rc,command=\"{} {}\" {} ({})\n",
            config.authorized_keys_command, uuid, machine.ssh_public_key, machine.unit_name,
        ));
    }

    safewrite::write_atomic(
        &config.authorized_keys_file,
        body.as_bytes(),
        Some(0o600),
        Some(&config.authorized_keys_user),
    )
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(device_id: u64, accept_new: bool, high_water_pct: f64, total_mib: f64, available_mib: f64) -> storage_core::Volume {
        storage_core::Volume {
            name: "v".into(),
            path: "/data/v".into(),
            accept_new,
            high_water_pct,
            total_mib,
            available_mib,
            device_id,
        }
    }

    #[test]
    fn totals_count_each_device_once() {
        let volumes = vec![volume(1, true, 80.0, 100.0, 50.0), volume(1, true, 80.0, 100.0, 20.0)];
        let (total, available) = deduplicated_totals(&volumes);
        assert_eq!(total, 100.0);
        assert_eq!(available, 50.0);
    }

    #[test]
    fn non_accepting_volumes_contribute_zero_availability() {
        let volumes = vec![volume(1, false, 80.0, 100.0, 50.0)];
        let (total, available) = deduplicated_totals(&volumes);
        assert_eq!(total, 100.0);
        assert_eq!(available, 0.0);
    }

    #[test]
    fn scenario_s6_authorized_keys_rendering() {
        let tmp = tempfile::tempdir().unwrap();
        let keys_path = tmp.path().join("authorized_keys");
        std::fs::write(keys_path.with_extension("static"), "# static entry\n").unwrap();

        let mut cfg_volumes = std::collections::BTreeMap::new();
        cfg_volumes.insert(
            "a".to_string(),
            storage_core::config::VolumeConfig { path: tmp.path().to_path_buf(), accept_new: true, accept_new_high_water_pct: Some(80.0) },
        );
        let config = Config {
            name: "host".into(),
            secret: "s".into(),
            api_url: "http://example.com".into(),
            api_auth_name: None,
            api_auth_secret: None,
            volumes: cfg_volumes,
            accept_new_high_water_pct: 80.0,
            var_dir: tmp.path().to_path_buf(),
            lock_dir: tmp.path().to_path_buf(),
            snapshot_mode: storage_core::config::SnapshotMode::LinkDest,
            preserve_hard_links: false,
            ssh_ping_host: "host".into(),
            ssh_ping_port: 22,
            ssh_ping_user: "root".into(),
            ssh_ping_host_keys: vec![],
            authorized_keys_file: keys_path.clone(),
            authorized_keys_user: whoami(),
            authorized_keys_command: "turku-storage-ping".into(),
            timezone: "UTC".into(),
            log_file: "/dev/null".into(),
        };

        let mut machines = HashMap::new();
        machines.insert(
            "uuid-1".to_string(),
            RemoteMachine { ssh_public_key: "ssh-ed25519 AAA".into(), unit_name: "web".into() },
        );
        machines.insert(
            "uuid-2".to_string(),
            RemoteMachine { ssh_public_key: "ssh-ed25519 BBB".into(), unit_name: "db".into() },
        );

        render_authorized_keys(&config, &machines).unwrap();
        let contents = std::fs::read_to_string(&keys_path).unwrap();
        assert!(contents.contains("# static entry"));
        assert_eq!(contents.matches("command=\"turku-storage-ping").count(), 2);
    }

    fn whoami() -> String {
        std::env::var("USER").unwrap_or_else(|_| "root".to_string())
    }
}
