//! Atomic write-then-rename helper (spec §4.5).
//!
//! Writes content to a sibling temp file in the target's directory, flushes
//! and syncs it, optionally chowns it to a configured user, then renames it
//! over the target. A reader can never observe a partially-written file:
//! either the old contents or the new ones, never a torn write, since the
//! temp file and the target share a filesystem and `rename` is atomic there.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use failure::ResultExt;

use crate::config::user_home_dir;
use crate::error::AgentErrorKind;
use crate::Result;

/// Write `contents` to `target` atomically, with mode `0o644` unless
/// `mode` is given. If `owner` is `Some(user)`, chown the file to that
/// user (and their primary group) before the rename.
pub fn write_atomic(target: &Path, contents: &[u8], mode: Option<u32>, owner: Option<&str>) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let dir_was_absent = !dir.exists();
    fs::create_dir_all(dir).with_context(|_| atomic_write_error(target))?;
    if dir_was_absent {
        if let Some(user) = owner {
            chown_to_user(dir, user)?;
        }
    }

    let tmp_path = dir.join(format!(".{}.tmp-{}", file_name(target), std::process::id()));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode.unwrap_or(0o644))
            .open(&tmp_path)
            .with_context(|_| atomic_write_error(target))?;
        file.write_all(contents).with_context(|_| atomic_write_error(target))?;
        file.sync_all().with_context(|_| atomic_write_error(target))?;
    }

    if let Some(user) = owner {
        chown_to_user(&tmp_path, user)?;
    }

    fs::rename(&tmp_path, target).with_context(|_| atomic_write_error(target))?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("safewrite").to_string()
}

fn atomic_write_error(target: &Path) -> AgentErrorKind {
    AgentErrorKind::ConfigIncomplete(format!("could not atomically write {}", target.display()))
}

/// Resolve `user`'s uid/gid via `getpwnam` and chown the file to them.
/// A missing user is treated as a configuration error, not silently
/// ignored, since the caller asked for a specific owner.
fn chown_to_user(path: &Path, user: &str) -> Result<()> {
    // `user_home_dir` already does the getpwnam lookup and fails the same
    // way; reuse it purely to validate the user exists before we touch uid/gid.
    if user_home_dir(user).is_none() {
        return Err(AgentErrorKind::ConfigIncomplete(format!("unknown user {}", user)).into());
    }

    let c_path = std::ffi::CString::new(path.as_os_str().to_str().unwrap_or_default())
        .map_err(|_| AgentErrorKind::ConfigIncomplete(format!("invalid path {}", path.display())))?;
    let c_user = std::ffi::CString::new(user).map_err(|_| AgentErrorKind::ConfigIncomplete(format!("invalid user {}", user)))?;

    unsafe {
        let pw = libc::getpwnam(c_user.as_ptr());
        if pw.is_null() {
            return Err(AgentErrorKind::ConfigIncomplete(format!("unknown user {}", user)).into());
        }
        let uid = (*pw).pw_uid;
        let gid = (*pw).pw_gid;
        if libc::chown(c_path.as_ptr(), uid, gid) != 0 {
            return Err(AgentErrorKind::ConfigIncomplete(format!("chown failed for {}", path.display())).into());
        }
    }
    Ok(())
}
