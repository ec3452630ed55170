//! Mount specifications and the syscalls that apply them.
//!
//! Snapshot drivers describe a view as a list of [`Mount`]s; applying them
//! onto a target directory is a separate step so that the snapshot service
//! (local or remote) never needs to know where the scanner mounts things.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// A single mount to apply, in the same shape containerd returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type (`overlay`, `bind`, ...).
    pub kind: String,
    /// Mount source.
    pub source: String,
    /// Options, both flags (`ro`, `rbind`) and data (`lowerdir=...`).
    pub options: Vec<String>,
}

impl Mount {
    /// A read-only recursive bind mount of `source`.
    pub fn read_only_bind(source: &Path) -> Self {
        Self {
            kind: "bind".to_string(),
            source: source.to_string_lossy().into_owned(),
            options: vec!["ro".to_string(), "rbind".to_string()],
        }
    }

    /// A read-only overlay composed of `lower` directories, top-most first.
    pub fn read_only_overlay(lower: &[impl AsRef<Path>]) -> Self {
        let dirs: Vec<String> = lower
            .iter()
            .map(|p| p.as_ref().to_string_lossy().into_owned())
            .collect();
        Self {
            kind: "overlay".to_string(),
            source: "overlay".to_string(),
            options: vec![format!("lowerdir={}", dirs.join(":"))],
        }
    }

    /// Returns true if this mount is a bind mount.
    pub fn is_bind(&self) -> bool {
        self.kind == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// Returns true if the mount is requested read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Applies `mounts` onto `target` in order.
///
/// Either every mount is applied or none is left behind.
#[cfg(target_os = "linux")]
pub fn mount_all(mounts: &[Mount], target: &Path) -> Result<()> {
    mount_each(mounts, target, linux::mount, linux::unmount_top)
}

/// Stacks `mounts` with `apply`; on failure pops the ones already stacked
/// with `undo` before returning the error.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn mount_each(
    mounts: &[Mount],
    target: &Path,
    mut apply: impl FnMut(&Mount, &Path) -> Result<()>,
    mut undo: impl FnMut(&Path) -> Result<()>,
) -> Result<()> {
    for (applied, m) in mounts.iter().enumerate() {
        let Err(e) = apply(m, target) else {
            continue;
        };
        for _ in 0..applied {
            if let Err(undo_err) = undo(target) {
                warn!(target = %target.display(), error = %undo_err, "error rolling back partial mount");
                break;
            }
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_all(_mounts: &[Mount], _target: &Path) -> Result<()> {
    Err(Error::NotSupported("mounting snapshots requires Linux".to_string()))
}

/// Unmounts everything stacked on `target`.
///
/// Repeats until the kernel reports nothing is mounted there, so stacked
/// mounts from multi-entry mount lists are all removed.
#[cfg(target_os = "linux")]
pub fn unmount_all(target: &Path) -> Result<()> {
    linux::unmount_all(target)
}

#[cfg(not(target_os = "linux"))]
pub fn unmount_all(_target: &Path) -> Result<()> {
    Err(Error::NotSupported("unmounting snapshots requires Linux".to_string()))
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use nix::errno::Errno;
    use nix::mount::{MntFlags, MsFlags};

    /// Splits options into mount flags and the filesystem data string.
    pub(super) fn parse_options(options: &[String]) -> (MsFlags, String) {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();

        for option in options {
            match option.as_str() {
                "ro" => flags |= MsFlags::MS_RDONLY,
                "rw" => flags &= !MsFlags::MS_RDONLY,
                "bind" => flags |= MsFlags::MS_BIND,
                "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "private" => flags |= MsFlags::MS_PRIVATE,
                other => data.push(other.to_string()),
            }
        }

        (flags, data.join(","))
    }

    pub(super) fn mount(m: &Mount, target: &Path) -> Result<()> {
        let (mut flags, data) = parse_options(&m.options);
        if m.kind == "bind" {
            flags |= MsFlags::MS_BIND;
        }

        let failed = |e: Errno| Error::MountFailed {
            target: target.to_path_buf(),
            reason: format!("{} mount of {}: {}", m.kind, m.source, e),
        };

        let fstype = if flags.contains(MsFlags::MS_BIND) {
            None
        } else {
            Some(m.kind.as_str())
        };
        let data_opt = if data.is_empty() { None } else { Some(data.as_str()) };

        debug!(kind = %m.kind, source = %m.source, target = %target.display(), "mounting");
        nix::mount::mount(Some(m.source.as_str()), target, fstype, flags, data_opt).map_err(failed)?;

        // MS_RDONLY is ignored on the initial bind; it needs a remount.
        if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
            let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
            if let Err(e) = nix::mount::mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
                let _ = nix::mount::umount2(target, MntFlags::MNT_DETACH);
                return Err(failed(e));
            }
        }

        Ok(())
    }

    /// Removes the top-most mount on `target`.
    pub(super) fn unmount_top(target: &Path) -> Result<()> {
        nix::mount::umount2(target, MntFlags::empty()).map_err(|e| Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub(super) fn unmount_all(target: &Path) -> Result<()> {
        loop {
            match nix::mount::umount2(target, MntFlags::empty()) {
                Ok(()) => continue,
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::UnmountFailed {
                        target: target.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::mount::MsFlags;

    #[test]
    fn test_parse_options_splits_flags_and_data() {
        let (flags, data) = linux::parse_options(&[
            "ro".to_string(),
            "lowerdir=/a:/b".to_string(),
            "index=off".to_string(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data, "lowerdir=/a:/b,index=off");
    }

    #[test]
    fn test_overlay_lowerdir_order() {
        let m = Mount::read_only_overlay(&["/layers/top", "/layers/base"]);
        assert_eq!(m.kind, "overlay");
        assert_eq!(m.options, vec!["lowerdir=/layers/top:/layers/base".to_string()]);
        assert!(!m.is_bind());
    }

    #[test]
    fn test_bind_helpers() {
        let m = Mount::read_only_bind(Path::new("/snapshots/1/fs"));
        assert!(m.is_bind());
        assert!(m.is_read_only());
    }

    #[test]
    fn test_partial_mount_list_rolled_back() {
        let mounts = vec![
            Mount::read_only_bind(Path::new("/lower")),
            Mount::read_only_bind(Path::new("/middle")),
            Mount::read_only_bind(Path::new("/upper")),
        ];
        let mut stack: Vec<String> = Vec::new();
        let undone = std::cell::Cell::new(0);

        let result = mount_each(
            &mounts,
            Path::new("/target"),
            |m, _| {
                if m.source == "/upper" {
                    return Err(Error::MountFailed {
                        target: "/target".into(),
                        reason: "EINVAL".to_string(),
                    });
                }
                stack.push(m.source.clone());
                Ok(())
            },
            |_| {
                undone.set(undone.get() + 1);
                Ok(())
            },
        );

        assert!(matches!(result, Err(Error::MountFailed { .. })));
        assert_eq!(stack, vec!["/lower", "/middle"]);
        assert_eq!(undone.get(), 2);
    }

    #[test]
    fn test_full_mount_list_not_undone() {
        let mounts = vec![Mount::read_only_bind(Path::new("/a")), Mount::read_only_bind(Path::new("/b"))];
        let mut undone = 0;
        mount_each(&mounts, Path::new("/t"), |_, _| Ok(()), |_| {
            undone += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(undone, 0);
    }

    #[test]
    fn test_unmount_of_plain_directory_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        // Not a mount point: EINVAL, or EPERM without privileges.
        let result = unmount_all(dir.path());
        if let Err(e) = result {
            assert!(e.to_string().contains("unmount"));
        }
    }
}
