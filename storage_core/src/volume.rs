//! Volume sizing and the runtime volume view (spec §3, §4.4).

use std::ffi::CString;
use std::mem;
use std::path::{Path, PathBuf};

use crate::config::VolumeConfig;

/// Runtime view of a configured volume, after statvfs-equivalent sizing
/// (spec §3 "Volume (runtime view)").
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub path: PathBuf,
    pub accept_new: bool,
    pub high_water_pct: f64,
    pub total_mib: f64,
    pub available_mib: f64,
    /// Device id from `statvfs`'s containing `stat`, used by the config
    /// refresh to deduplicate volumes that share an underlying device
    /// (spec §4.5).
    pub device_id: u64,
}

impl Volume {
    /// `accept_new` becomes effectively false once used space crosses the
    /// high-water mark (spec §3).
    pub fn effectively_accepts_new(&self) -> bool {
        self.accept_new && self.used_pct() <= self.high_water_pct
    }

    pub fn used_pct(&self) -> f64 {
        if self.total_mib <= 0.0 {
            100.0
        } else {
            (1.0 - self.available_mib / self.total_mib) * 100.0
        }
    }
}

/// Query `path` via `statvfs`/`stat`, building a [`Volume`]. Returns `None`
/// on any OS-level failure, matching the original agent's
/// `except OSError: continue` (spec §4.4 "skip on error").
pub fn stat_volume(name: &str, cfg: &VolumeConfig) -> Option<Volume> {
    let c_path = CString::new(cfg.path.as_os_str().to_str()?).ok()?;

    let mut vfs: libc::statvfs = unsafe { mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return None;
    }

    let mut st: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::stat(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return None;
    }

    let bsize = vfs.f_bsize as f64;
    let total_mib = bsize * vfs.f_blocks as f64 / 1_048_576.0;
    let available_mib = bsize * vfs.f_bavail as f64 / 1_048_576.0;

    Some(Volume {
        name: name.to_string(),
        path: cfg.path.clone(),
        accept_new: cfg.accept_new,
        high_water_pct: cfg.accept_new_high_water_pct.unwrap_or(80.0),
        total_mib,
        available_mib,
        device_id: st.st_dev as u64,
    })
}

pub fn stat_all<'a, I>(volumes: I) -> Vec<Volume>
where
    I: IntoIterator<Item = (&'a String, &'a VolumeConfig)>,
{
    volumes
        .into_iter()
        .filter_map(|(name, cfg)| stat_volume(name, cfg))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_config(path: &Path) -> VolumeConfig {
        VolumeConfig {
            path: path.to_path_buf(),
            accept_new: true,
            accept_new_high_water_pct: Some(80.0),
        }
    }

    #[test]
    fn stats_an_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let vol = stat_volume("a", &volume_config(tmp.path())).expect("statvfs should succeed");
        assert!(vol.total_mib > 0.0);
        assert!(vol.available_mib >= 0.0);
    }

    #[test]
    fn nonexistent_path_is_skipped() {
        let cfg = volume_config(Path::new("/nonexistent/does/not/exist"));
        assert!(stat_volume("missing", &cfg).is_none());
    }

    #[test]
    fn high_water_mark_disables_acceptance() {
        let mut vol = Volume {
            name: "a".into(),
            path: PathBuf::from("/data/a"),
            accept_new: true,
            high_water_pct: 80.0,
            total_mib: 100.0,
            available_mib: 50.0,
            device_id: 0,
        };
        assert!(vol.effectively_accepts_new());
        vol.available_mib = 5.0; // 95% used
        assert!(!vol.effectively_accepts_new());
    }
}
