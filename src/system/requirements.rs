//! Host prerequisite probing.
//!
//! The sandbox depends on kernel features that cannot be worked around at
//! runtime: Landlock ABI v6 for abstract socket scoping, the unified cgroup
//! hierarchy for delegated subtrees, and unprivileged user namespaces for
//! the container itself. The binary probes all of them before planning a
//! launch so failures surface as one actionable diagnostic instead of a
//! mid-commit error.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::RequirementsError;

/// Minimum required kernel version (major, minor).
pub const MIN_KERNEL_VERSION: (u32, u32) = (6, 7);

/// Minimum required Landlock ABI version.
pub const MIN_LANDLOCK_ABI: i32 = 6;

/// Results of all host requirement checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel release string (e.g., "6.7.0").
    pub kernel_version: String,
    /// Parsed kernel major version.
    pub kernel_major: u32,
    /// Parsed kernel minor version.
    pub kernel_minor: u32,
    /// Landlock ABI version (0 if unavailable).
    pub landlock_abi: i32,
    /// Whether cgroup v2 is available.
    pub cgroups_v2: bool,
    /// Whether unprivileged user namespaces are enabled.
    pub user_namespaces: bool,
}

impl SystemRequirements {
    /// Whether every requirement is met.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        (self.kernel_major > MIN_KERNEL_VERSION.0
            || (self.kernel_major == MIN_KERNEL_VERSION.0
                && self.kernel_minor >= MIN_KERNEL_VERSION.1))
            && self.landlock_abi >= MIN_LANDLOCK_ABI
            && self.cgroups_v2
            && self.user_namespaces
    }
}

/// Checks all host requirements and returns detailed results, or the first
/// failing requirement.
pub fn check_all() -> Result<SystemRequirements, RequirementsError> {
    let (kernel_version, kernel_major, kernel_minor) = check_kernel_version()?;
    let landlock_abi = check_landlock_abi()?;
    let cgroups_v2 = check_cgroups_v2()?;
    let user_namespaces = check_user_namespaces()?;

    Ok(SystemRequirements {
        kernel_version,
        kernel_major,
        kernel_minor,
        landlock_abi,
        cgroups_v2,
        user_namespaces,
    })
}

/// Checks the kernel release is at least [`MIN_KERNEL_VERSION`].
///
/// Returns the release string and parsed (major, minor) on success.
pub fn check_kernel_version() -> Result<(String, u32, u32), RequirementsError> {
    let uname = nix::sys::utsname::uname().map_err(|e| RequirementsError::ReadFailed {
        context: String::from("uname syscall"),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let release = uname.release().to_string_lossy().to_string();
    let (major, minor) = parse_kernel_version(&release)?;

    if major < MIN_KERNEL_VERSION.0
        || (major == MIN_KERNEL_VERSION.0 && minor < MIN_KERNEL_VERSION.1)
    {
        return Err(RequirementsError::KernelTooOld {
            found: release,
            required: format!("{}.{}", MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1),
        });
    }

    Ok((release, major, minor))
}

/// Parses a kernel release string into (major, minor).
fn parse_kernel_version(version: &str) -> Result<(u32, u32), RequirementsError> {
    let invalid = |context: String| RequirementsError::ReadFailed {
        context,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid kernel version"),
    };

    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| invalid(format!("kernel major version in {version:?}")))?;

    // the minor component may carry a suffix like "7-generic"
    let minor = parts
        .next()
        .and_then(|p| p.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| invalid(format!("kernel minor version in {version:?}")))?;

    Ok((major, minor))
}

/// Checks the Landlock ABI version is at least [`MIN_LANDLOCK_ABI`].
pub fn check_landlock_abi() -> Result<i32, RequirementsError> {
    match detect_landlock_abi() {
        abi if abi <= 0 => Err(RequirementsError::LandlockUnavailable),
        abi if abi < MIN_LANDLOCK_ABI => Err(RequirementsError::LandlockAbiTooOld {
            found: abi,
            required: MIN_LANDLOCK_ABI,
        }),
        abi => Ok(abi),
    }
}

/// Detects the current Landlock ABI version, 0 if unavailable.
///
/// The landlock crate keeps direct ABI queries internal, so availability of
/// the version we need is probed by creating (without enforcing) a ruleset
/// targeting that ABI.
fn detect_landlock_abi() -> i32 {
    use landlock::{Access, AccessFs, Ruleset, RulesetAttr, ABI};

    let required = ABI::V6;
    let can_create = Ruleset::default()
        .handle_access(AccessFs::from_all(required))
        .and_then(|r| r.create())
        .is_ok();

    if can_create {
        required as i32
    } else {
        0
    }
}

/// Checks the unified cgroup hierarchy is mounted and readable.
pub fn check_cgroups_v2() -> Result<bool, RequirementsError> {
    let controllers = Path::new("/sys/fs/cgroup/cgroup.controllers");
    if !controllers.exists() {
        return Err(RequirementsError::CgroupsV2Unavailable);
    }

    fs::read_to_string(controllers).map_err(|e| RequirementsError::ReadFailed {
        context: String::from("cgroup v2 controllers file"),
        source: e,
    })?;

    Ok(true)
}

/// Checks unprivileged user namespaces are enabled.
///
/// Reads `/proc/sys/kernel/unprivileged_userns_clone` where present; on
/// distributions without that knob, verifies by actually creating a user
/// namespace in a forked child.
pub fn check_user_namespaces() -> Result<bool, RequirementsError> {
    let knob = Path::new("/proc/sys/kernel/unprivileged_userns_clone");
    if !knob.exists() {
        return verify_userns_by_clone();
    }

    let content = fs::read_to_string(knob).map_err(|e| RequirementsError::ReadFailed {
        context: String::from("unprivileged_userns_clone"),
        source: e,
    })?;

    if content.trim().parse::<u32>().unwrap_or(0) != 1 {
        return Err(RequirementsError::UserNamespacesDisabled);
    }

    debug!("unprivileged user namespaces enabled");
    Ok(true)
}

fn verify_userns_by_clone() -> Result<bool, RequirementsError> {
    use nix::sched::{unshare, CloneFlags};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child calls only async-signal-safe functions before _exit
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => Ok(true),
            _ => Err(RequirementsError::UserNamespacesDisabled),
        },
        Ok(ForkResult::Child) => {
            let ok = unshare(CloneFlags::CLONE_NEWUSER).is_ok();
            unsafe { libc::_exit(i32::from(!ok)) }
        }
        Err(_) => Err(RequirementsError::ReadFailed {
            context: String::from("fork for userns probe"),
            source: std::io::Error::last_os_error(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version_standard() {
        assert_eq!(parse_kernel_version("6.7.0").unwrap(), (6, 7));
    }

    #[test]
    fn test_parse_kernel_version_with_suffix() {
        assert_eq!(parse_kernel_version("6.8.0-generic").unwrap(), (6, 8));
        assert_eq!(parse_kernel_version("6.7.0-8-generic").unwrap(), (6, 7));
    }

    #[test]
    fn test_parse_kernel_version_old() {
        assert_eq!(parse_kernel_version("5.15.0-generic").unwrap(), (5, 15));
    }

    #[test]
    fn test_parse_kernel_version_malformed() {
        assert!(parse_kernel_version("banana").is_err());
        assert!(parse_kernel_version("").is_err());
    }

    #[test]
    fn test_is_satisfied_bounds() {
        let reqs = SystemRequirements {
            kernel_version: String::from("6.7.0"),
            kernel_major: 6,
            kernel_minor: 7,
            landlock_abi: 6,
            cgroups_v2: true,
            user_namespaces: true,
        };
        assert!(reqs.is_satisfied());

        let mut old = reqs.clone();
        old.kernel_minor = 6;
        assert!(!old.is_satisfied());

        let mut no_landlock = reqs;
        no_landlock.landlock_abi = 5;
        assert!(!no_landlock.is_satisfied());
    }
}
