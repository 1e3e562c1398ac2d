//! Configuration loading, deep-merge, and validated defaults (spec §3, §4.1).

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};

use failure::ResultExt;
use serde_json::Value;

use crate::error::AgentErrorKind;
use crate::merge::deep_merge;
use crate::Result;

/// One entry of the `volumes` mapping (spec §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolumeConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub accept_new: bool,
    #[serde(default)]
    pub accept_new_high_water_pct: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Deserialization shape for a `volumes` entry before path presence is
/// checked; entries lacking `path` are discarded (spec §3), not a parse
/// error.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawVolumeConfig {
    path: Option<PathBuf>,
    #[serde(default = "default_true")]
    accept_new: bool,
    #[serde(default)]
    accept_new_high_water_pct: Option<f64>,
}

/// Incremental snapshot strategy (spec §3 `snapshot_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotMode {
    LinkDest,
    None,
}

impl Default for SnapshotMode {
    fn default() -> Self {
        SnapshotMode::LinkDest
    }
}

/// The fully-validated, defaulted configuration (spec §3).
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub secret: String,
    pub api_url: String,
    pub api_auth_name: Option<String>,
    pub api_auth_secret: Option<String>,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub accept_new_high_water_pct: f64,
    pub var_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub snapshot_mode: SnapshotMode,
    pub preserve_hard_links: bool,
    pub ssh_ping_host: String,
    pub ssh_ping_port: u16,
    pub ssh_ping_user: String,
    pub ssh_ping_host_keys: Vec<String>,
    pub authorized_keys_file: PathBuf,
    pub authorized_keys_user: String,
    pub authorized_keys_command: String,
    pub timezone: String,
    pub log_file: String,
}

/// Shape of the raw merged JSON tree before defaults are applied.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    name: Option<String>,
    secret: Option<String>,
    api_url: Option<String>,
    api_auth_name: Option<String>,
    api_auth_secret: Option<String>,
    #[serde(default)]
    volumes: BTreeMap<String, RawVolumeConfig>,
    accept_new_high_water_pct: Option<f64>,
    var_dir: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
    snapshot_mode: Option<SnapshotMode>,
    preserve_hard_links: Option<bool>,
    ssh_ping_host: Option<String>,
    ssh_ping_port: Option<u16>,
    ssh_ping_user: Option<String>,
    ssh_ping_host_keys: Option<Vec<String>>,
    ssh_ping_host_keys_glob: Option<String>,
    authorized_keys_file: Option<PathBuf>,
    authorized_keys_user: Option<String>,
    authorized_keys_command: Option<String>,
    timezone: Option<String>,
    log_file: Option<String>,
}

/// Read and deep-merge every readable fragment under `<config_dir>/config.d`,
/// lexicographic order, `.json` always and `.yaml` treated as an equally
/// recognized format (spec §4.1).
fn load_merged(config_dir: &Path) -> Result<Value> {
    let config_d = config_dir.join("config.d");
    let mut files: Vec<PathBuf> = fs::read_dir(&config_d)
        .with_context(|_| AgentErrorKind::ConfigIncomplete(format!("cannot read {:?}", config_d)))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| match p.extension().and_then(|e| e.to_str()) {
            Some("json") | Some("yaml") | Some("yml") => true,
            _ => false,
        })
        .collect();
    files.sort();

    let mut acc = Value::Object(serde_json::Map::new());
    for path in files {
        let text = fs::read_to_string(&path)?;
        let fragment: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        acc = deep_merge(&acc, &fragment);
    }
    Ok(acc)
}

fn gethostname() -> String {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Home directory of a named system user, via `getpwnam`. Used to default
/// `authorized_keys_file` the same way the original agent calls
/// `pwd.getpwnam(...).pw_dir`.
pub(crate) fn user_home_dir(user: &str) -> Option<PathBuf> {
    let cuser = CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(cuser.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let dir = unsafe { CStr::from_ptr((*pw).pw_dir) };
    Some(PathBuf::from(dir.to_string_lossy().into_owned()))
}

fn default_ssh_host_keys(glob_pattern: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Ok(paths) = glob::glob(glob_pattern) {
        let mut matches: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
        matches.sort();
        for path in matches {
            if let Ok(contents) = fs::read_to_string(&path) {
                keys.push(contents.trim_end().to_string());
            }
        }
    }
    keys
}

fn first_existing_dir(candidates: &[&str]) -> PathBuf {
    for candidate in candidates {
        if Path::new(candidate).is_dir() {
            return PathBuf::from(candidate);
        }
    }
    PathBuf::from(candidates.last().copied().unwrap_or("/tmp"))
}

/// Apply the process-wide time zone the way §9 describes: best-effort, via
/// `TZ` plus `libc::tzset`, not touched anywhere else in the agent.
pub fn apply_timezone(tz: &str) {
    if tz.is_empty() {
        return;
    }
    std::env::set_var("TZ", tz);
    unsafe {
        tzset();
    }
}

extern "C" {
    fn tzset();
}

impl Config {
    /// Load, merge, default and validate configuration from `config_dir`.
    ///
    /// `writable` mirrors the original agent's `load_config(..., writable=)`:
    /// when true (config-refresh), a missing `name`/`secret` pair is
    /// generated and persisted rather than treated as an error, and
    /// `api_auth_name`/`api_auth_secret` are required instead (registration
    /// credentials for that first check-in).
    pub fn load(config_dir: &Path, writable: bool) -> Result<Config> {
        let raw_value = load_merged(config_dir)?;
        let already_authenticated = raw_value.get("name").is_some() && raw_value.get("secret").is_some();

        let mut raw: RawConfig = serde_json::from_value(raw_value)
            .with_context(|_| AgentErrorKind::ConfigIncomplete("malformed config fragment".into()))?;

        if writable && !already_authenticated {
            let name = raw.name.take().unwrap_or_else(gethostname);
            let secret = raw.secret.take().unwrap_or_else(generate_secret);
            persist_identity(config_dir, &name, &secret)?;
            raw.name = Some(name);
            raw.secret = Some(secret);
        }

        let name = raw
            .name
            .ok_or_else(|| AgentErrorKind::ConfigIncomplete("name".into()))?;
        let secret = raw
            .secret
            .ok_or_else(|| AgentErrorKind::ConfigIncomplete("secret".into()))?;
        let api_url = raw
            .api_url
            .ok_or_else(|| AgentErrorKind::ConfigIncomplete("api_url".into()))?;

        if writable && !already_authenticated
            && (raw.api_auth_name.is_none() || raw.api_auth_secret.is_none())
        {
            return Err(AgentErrorKind::ConfigIncomplete(
                "api_auth_name/api_auth_secret required for first registration".into(),
            )
            .into());
        }

        let accept_new_high_water_pct = raw.accept_new_high_water_pct.unwrap_or(80.0);

        let mut volumes: BTreeMap<String, VolumeConfig> = raw
            .volumes
            .into_iter()
            .filter_map(|(name, v)| {
                let accept_new = v.accept_new;
                let accept_new_high_water_pct = v.accept_new_high_water_pct;
                v.path.map(|path| {
                    (
                        name,
                        VolumeConfig {
                            path,
                            accept_new,
                            accept_new_high_water_pct,
                        },
                    )
                })
            })
            .collect();
        for (_, v) in volumes.iter_mut() {
            if v.accept_new_high_water_pct.is_none() {
                v.accept_new_high_water_pct = Some(accept_new_high_water_pct);
            }
        }
        if volumes.is_empty() {
            return Err(AgentErrorKind::ConfigIncomplete("no usable volume".into()).into());
        }

        let var_dir = raw.var_dir.unwrap_or_else(|| PathBuf::from("/var/lib/turku-storage"));
        let lock_dir = raw
            .lock_dir
            .unwrap_or_else(|| first_existing_dir(&["/run/lock", "/var/lock", "/run", "/var/run", "/tmp"]));
        let snapshot_mode = raw.snapshot_mode.unwrap_or_default();
        let preserve_hard_links = raw.preserve_hard_links.unwrap_or(false);

        let ssh_ping_host = raw.ssh_ping_host.unwrap_or_else(gethostname);
        let ssh_ping_port = raw.ssh_ping_port.unwrap_or(22);
        let ssh_ping_user = raw.ssh_ping_user.unwrap_or_else(|| "root".to_string());
        let ssh_ping_host_keys = match raw.ssh_ping_host_keys {
            Some(keys) => keys,
            None => {
                let pattern = raw
                    .ssh_ping_host_keys_glob
                    .unwrap_or_else(|| "/etc/ssh/ssh_host_*_key.pub".to_string());
                default_ssh_host_keys(&pattern)
            }
        };

        let authorized_keys_file = raw.authorized_keys_file.unwrap_or_else(|| {
            user_home_dir(&ssh_ping_user)
                .unwrap_or_else(|| PathBuf::from("/root"))
                .join(".ssh/authorized_keys")
        });
        let authorized_keys_user = raw.authorized_keys_user.unwrap_or_else(|| ssh_ping_user.clone());
        let authorized_keys_command = raw
            .authorized_keys_command
            .unwrap_or_else(|| "turku-storage-ping".to_string());

        let timezone = raw.timezone.unwrap_or_else(|| "UTC".to_string());
        if !timezone.is_empty() {
            apply_timezone(&timezone);
        }

        let log_file = raw.log_file.unwrap_or_else(|| "/var/log/turku-storage.log".to_string());

        Ok(Config {
            name,
            secret,
            api_url,
            api_auth_name: raw.api_auth_name,
            api_auth_secret: raw.api_auth_secret,
            volumes,
            accept_new_high_water_pct,
            var_dir,
            lock_dir,
            snapshot_mode,
            preserve_hard_links,
            ssh_ping_host,
            ssh_ping_port,
            ssh_ping_user,
            ssh_ping_host_keys,
            authorized_keys_file,
            authorized_keys_user,
            authorized_keys_command,
            timezone,
            log_file,
        })
    }
}

fn generate_secret() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..30)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Persist a freshly-generated `name`/`secret` pair to `config.d/10-name.json`
/// with owner-only permissions, as the original agent does on first run.
fn persist_identity(config_dir: &Path, name: &str, secret: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = config_dir.join("config.d").join("10-name.json");
    let body = serde_json::to_string_pretty(&serde_json::json!({
        "name": name,
        "secret": secret,
    }))?;
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_fragment(dir: &Path, name: &str, json: &str) {
        fs::write(dir.join(name), json).unwrap();
    }

    #[test]
    fn loads_and_merges_fragments_in_lexicographic_order() {
        let tmp = tempfile::tempdir().unwrap();
        let config_d = tmp.path().join("config.d");
        fs::create_dir_all(&config_d).unwrap();
        write_fragment(
            &config_d,
            "10-base.json",
            r#"{"name":"host1","secret":"s3cr3t","api_url":"http://api.example.com",
               "volumes":{"a":{"path":"/data/a"}}}"#,
        );
        write_fragment(
            &config_d,
            "20-override.json",
            r#"{"volumes":{"a":{"accept_new":false}}}"#,
        );

        let cfg = Config::load(tmp.path(), false).unwrap();
        assert_eq!(cfg.name, "host1");
        assert!(!cfg.volumes["a"].accept_new);
        assert_eq!(cfg.volumes["a"].accept_new_high_water_pct, Some(80.0));
    }

    #[test]
    fn missing_required_key_is_config_incomplete() {
        let tmp = tempfile::tempdir().unwrap();
        let config_d = tmp.path().join("config.d");
        fs::create_dir_all(&config_d).unwrap();
        write_fragment(&config_d, "10-base.json", r#"{"name":"host1","secret":"x"}"#);

        let err = Config::load(tmp.path(), false).unwrap_err();
        let kind = err.downcast_ref::<AgentErrorKind>().expect("AgentErrorKind");
        match kind {
            AgentErrorKind::ConfigIncomplete(_) => {}
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn writable_mode_generates_identity_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let config_d = tmp.path().join("config.d");
        fs::create_dir_all(&config_d).unwrap();
        write_fragment(
            &config_d,
            "10-base.json",
            r#"{"api_url":"http://api.example.com","api_auth_name":"reg","api_auth_secret":"regsecret",
               "volumes":{"a":{"path":"/data/a"}}}"#,
        );

        let cfg = Config::load(tmp.path(), true).unwrap();
        assert!(!cfg.name.is_empty());
        assert_eq!(cfg.secret.len(), 30);
        let persisted = fs::read_to_string(config_d.join("10-name.json")).unwrap();
        assert!(persisted.contains(&cfg.name));
    }

    #[test]
    fn yaml_fragments_participate_in_the_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let config_d = tmp.path().join("config.d");
        fs::create_dir_all(&config_d).unwrap();
        write_fragment(
            &config_d,
            "10-base.json",
            r#"{"name":"host1","secret":"s3cr3t","volumes":{"a":{"path":"/data/a"}}}"#,
        );
        write_fragment(&config_d, "20-api.yaml", "api_url: http://api.example.com\n");

        let cfg = Config::load(tmp.path(), false).unwrap();
        assert_eq!(cfg.api_url, "http://api.example.com");
    }
}
