//! Declarative per-app container configuration.
//!
//! The configuration is emitted as JSON by an external front-end and
//! validated here before any planning happens. Validation failures are fatal
//! and carry the step label they were raised from.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigErrorKind};
use crate::path::Absolute;

/// Private writable path inside every container.
pub const PRIVATE_TMP: &str = "/.hakurei";

/// Root of the unified cgroup hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default delegated slice used when [`CgroupConfig::slice`] is unspecified.
pub const DEFAULT_CGROUP_SLICE: &str = "/sys/fs/cgroup/hakurei.slice";

/// Wait delay substituted for a zero configured value.
pub const WAIT_DELAY_DEFAULT: Duration = Duration::from_secs(5);
/// Upper bound on the configured wait delay.
pub const WAIT_DELAY_MAX: Duration = Duration::from_secs(30);

/// First valid application identity; 0 is reserved for system services.
pub const IDENTITY_START: i32 = 1;
/// Last valid application identity.
pub const IDENTITY_END: i32 = 9999;

const STEP_VALIDATE: &str = "validate configuration";

/// Derives the target init-namespace uid for an identity slot.
#[must_use]
pub fn to_user(user_id: i32, identity: i32) -> i32 {
    user_id * 100000 + 10000 + identity
}

/// System surfaces that may be exposed into a container.
///
/// The transaction engine extends this set internally with two
/// classification bits used as a revert filter; those never appear in
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EnablementSet(pub(crate) u8);

impl EnablementSet {
    pub const WAYLAND: EnablementSet = EnablementSet(1);
    pub const X11: EnablementSet = EnablementSet(1 << 1);
    pub const DBUS: EnablementSet = EnablementSet(1 << 2);
    pub const PULSE: EnablementSet = EnablementSet(1 << 3);

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub fn intersects(self, other: EnablementSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: EnablementSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EnablementSet {
    type Output = EnablementSet;
    fn bitor(self, rhs: EnablementSet) -> EnablementSet {
        EnablementSet(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EnablementSet {
    fn bitor_assign(&mut self, rhs: EnablementSet) {
        self.0 |= rhs.0;
    }
}

/// JSON form of [`EnablementSet`]: one boolean per surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enablements {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wayland: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub x11: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dbus: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pulse: bool,
}

impl Enablements {
    /// Collapses the booleans into the bitmask form.
    #[must_use]
    pub fn unwrap(self) -> EnablementSet {
        let mut set = EnablementSet::default();
        if self.wayland {
            set |= EnablementSet::WAYLAND;
        }
        if self.x11 {
            set |= EnablementSet::X11;
        }
        if self.dbus {
            set |= EnablementSet::DBUS;
        }
        if self.pulse {
            set |= EnablementSet::PULSE;
        }
        set
    }
}

/// Boolean options of [`ContainerConfig`], packed as a bitmask.
///
/// Each bit toggles a specific seccomp preset, namespace flag or bind-mount
/// class. The mask is never persisted directly; JSON carries one boolean per
/// bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(pub(crate) u32);

impl Flags {
    /// Unblocks syscalls required for multiarch on applicable targets.
    pub const MULTIARCH: Flags = Flags(1);
    /// Emits seccomp filter programs identical to Flatpak's.
    pub const SECCOMP_COMPAT: Flags = Flags(1 << 1);
    /// Unblocks ptrace and friends.
    pub const DEVEL: Flags = Flags(1 << 2);
    /// Unblocks userns creation and container setup syscalls.
    pub const USERNS: Flags = Flags(1 << 3);
    /// Skips net namespace creation.
    pub const HOST_NET: Flags = Flags(1 << 4);
    /// Skips the abstract unix socket Landlock scope.
    pub const HOST_ABSTRACT: Flags = Flags(1 << 5);
    /// Unblocks dangerous terminal I/O.
    pub const TTY: Flags = Flags(1 << 6);
    /// Maps the caller uid/gid into the container user namespace.
    pub const MAP_REAL_UID: Flags = Flags(1 << 7);
    /// Binds /dev from the init mount namespace as-is.
    pub const DEVICE: Flags = Flags(1 << 8);
    /// Shares XDG_RUNTIME_DIR between containers under the same identity.
    pub const SHARE_RUNTIME: Flags = Flags(1 << 9);
    /// Shares TMPDIR between containers under the same identity.
    pub const SHARE_TMPDIR: Flags = Flags(1 << 10);

    /// Whether any bit of `flag` is set.
    #[must_use]
    pub fn contains(self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 11] = [
            (Flags::MULTIARCH, "multiarch"),
            (Flags::SECCOMP_COMPAT, "compat"),
            (Flags::DEVEL, "devel"),
            (Flags::USERNS, "userns"),
            (Flags::HOST_NET, "net"),
            (Flags::HOST_ABSTRACT, "abstract"),
            (Flags::TTY, "tty"),
            (Flags::MAP_REAL_UID, "mapuid"),
            (Flags::DEVICE, "device"),
            (Flags::SHARE_RUNTIME, "runtime"),
            (Flags::SHARE_TMPDIR, "tmpdir"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Configures an application container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reverse-DNS style arbitrary identifier string. Passed to wayland
    /// security-context-v1 and used as part of defaults in the D-Bus
    /// session proxy.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// System surfaces to make available in the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enablements: Option<Enablements>,

    /// Session D-Bus proxy configuration; built-in defaults if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_bus: Option<BusConfig>,
    /// System D-Bus proxy configuration; disabled if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_bus: Option<BusConfig>,
    /// Direct access to the wayland socket without security-context-v1.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct_wayland: bool,

    /// Extra ACL updates to perform before privilege drop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_perms: Vec<ExtraPermConfig>,

    /// Numerical application identity, used to derive init user namespace
    /// credentials.
    pub identity: i32,
    /// Init user namespace supplementary groups inherited by all container
    /// processes.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Configuration applied to the underlying container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerConfig>,
}

impl Config {
    /// Checks the configuration for invalid values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] framed with the validation step label.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity < IDENTITY_START || self.identity > IDENTITY_END {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::IdentityBounds,
                format!("identity {} out of range", self.identity),
            ));
        }

        if let Some(bus) = &self.session_bus {
            bus.check_interfaces("session")?;
        }
        if let Some(bus) = &self.system_bus {
            bus.check_interfaces("system")?;
        }

        let Some(container) = &self.container else {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::Null,
                "configuration missing container state",
            ));
        };
        if container.home.is_none() {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::Null,
                "container configuration missing path to home directory",
            ));
        }
        if container.shell.is_none() {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::Null,
                "container configuration missing path to shell",
            ));
        }
        if container.path.is_none() {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::Null,
                "container configuration missing path to initial program",
            ));
        }

        if let Some(cgroup) = &container.cgroup {
            cgroup.validate()?;
        }

        for key in container.env.keys() {
            if key.contains('=') || key.contains('\0') {
                return Err(ConfigError::new(
                    STEP_VALIDATE,
                    ConfigErrorKind::Environ,
                    format!("invalid environment variable {key:?}"),
                ));
            }
        }

        Ok(())
    }
}

/// An ACL update to perform before privilege drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPermConfig {
    /// Whether to create the pathname as a directory if it does not exist.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ensure: bool,
    /// Pathname to act on.
    pub path: Absolute,
    /// Whether to grant read for the target user.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub r: bool,
    /// Whether to grant write for the target user.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub w: bool,
    /// Whether to grant execute for the target user.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub x: bool,
}

impl fmt::Display for ExtraPermConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = [b'-', b'-', b'-'];
        if self.r {
            bits[0] = b'r';
        }
        if self.w {
            bits[1] = b'w';
        }
        if self.x {
            bits[2] = b'x';
        }
        // bits are always ASCII
        f.write_str(std::str::from_utf8(&bits).unwrap_or("---"))?;
        if self.ensure {
            f.write_str("+")?;
        }
        write!(f, ":{}", self.path)
    }
}

/// Interface filter for a D-Bus proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Interfaces the container may observe.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub see: Vec<String>,
    /// Interfaces the container may call methods on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub talk: Vec<String>,
    /// Interfaces the container may own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub own: Vec<String>,
    /// Whether filtering is enforced at all.
    #[serde(default = "default_true")]
    pub filter: bool,
}

fn default_true() -> bool {
    true
}

impl BusConfig {
    /// Rejects malformed interface strings.
    pub(crate) fn check_interfaces(&self, bus: &'static str) -> Result<(), ConfigError> {
        for iface in self.see.iter().chain(&self.talk).chain(&self.own) {
            if iface.is_empty() || iface.contains('\0') {
                return Err(ConfigError::new(
                    STEP_VALIDATE,
                    ConfigErrorKind::Invalid,
                    format!("invalid interface {iface:?} in {bus} bus configuration"),
                ));
            }
        }
        Ok(())
    }
}

/// A mount point inside the container filesystem.
///
/// If the first element targets `/`, it is inserted early and excluded from
/// path hiding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilesystemConfig {
    /// Bind mount a host path.
    Bind {
        src: Absolute,
        /// Target pathname; defaults to `src`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<Absolute>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        write: bool,
        /// Allow device files on the mount.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        device: bool,
        /// Skip silently if the source does not exist.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        optional: bool,
    },
    /// Mount a fresh tmpfs.
    Tmpfs {
        dst: Absolute,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        perm: Option<u32>,
    },
    /// Mount an overlay.
    Overlay {
        dst: Absolute,
        lower: Vec<Absolute>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper: Option<Absolute>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work: Option<Absolute>,
    },
    /// Create a symlink.
    Link { dst: Absolute, target: String },
}

impl FilesystemConfig {
    /// The pathname this entry materialises inside the container.
    #[must_use]
    pub fn target(&self) -> &Absolute {
        match self {
            FilesystemConfig::Bind { src, dst, .. } => dst.as_ref().unwrap_or(src),
            FilesystemConfig::Tmpfs { dst, .. }
            | FilesystemConfig::Overlay { dst, .. }
            | FilesystemConfig::Link { dst, .. } => dst,
        }
    }
}

/// Describes the container to be created for an application.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerConfig {
    /// Container UTS namespace hostname.
    pub hostname: String,

    /// Duration in nanoseconds to wait after interrupting the initial
    /// process. Zero selects [`WAIT_DELAY_DEFAULT`]; values above
    /// [`WAIT_DELAY_MAX`] are clamped; negative values disable the wait.
    pub wait_delay: i64,

    /// Initial process environment variables.
    pub env: BTreeMap<String, String>,

    /// Container mount points.
    pub filesystem: Vec<FilesystemConfig>,

    /// Username of the emulated user; defaults to chronos.
    pub username: String,
    /// Pathname of the shell in the container filesystem.
    pub shell: Option<Absolute>,
    /// Home directory of the emulated user.
    pub home: Option<Absolute>,

    /// Pathname of the initial program in the container filesystem.
    pub path: Option<Absolute>,
    /// Final args passed to the initial program.
    pub args: Vec<String>,

    /// Boolean options; not persisted directly.
    pub flags: Flags,

    /// Optional cgroup subtree applied prior to starting the container.
    pub cgroup: Option<CgroupConfig>,
}

impl ContainerConfig {
    /// The configured wait delay with bounds and default applied.
    ///
    /// A zero result means the initial process is terminated immediately.
    #[must_use]
    pub fn normalized_wait_delay(&self) -> Duration {
        if self.wait_delay < 0 {
            Duration::ZERO
        } else if self.wait_delay == 0 {
            WAIT_DELAY_DEFAULT
        } else {
            WAIT_DELAY_MAX.min(Duration::from_nanos(self.wait_delay as u64))
        }
    }
}

/// JSON shape of [`ContainerConfig`]: the flags mask is flattened into
/// individual booleans. Unknown booleans default to false; `map_real_uid` is
/// always serialised.
#[derive(Serialize, Deserialize)]
struct ContainerConfigJson {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hostname: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    wait_delay: i64,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    filesystem: Vec<FilesystemConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    username: String,
    shell: Option<Absolute>,
    home: Option<Absolute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<Absolute>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cgroup: Option<CgroupConfig>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    seccomp_compat: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    devel: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    userns: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    host_net: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    host_abstract: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    tty: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    multiarch: bool,
    #[serde(default)]
    map_real_uid: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    device: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    share_runtime: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    share_tmpdir: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

const FLAG_BITS: [(Flags, fn(&ContainerConfigJson) -> bool); 11] = [
    (Flags::SECCOMP_COMPAT, |j| j.seccomp_compat),
    (Flags::DEVEL, |j| j.devel),
    (Flags::USERNS, |j| j.userns),
    (Flags::HOST_NET, |j| j.host_net),
    (Flags::HOST_ABSTRACT, |j| j.host_abstract),
    (Flags::TTY, |j| j.tty),
    (Flags::MULTIARCH, |j| j.multiarch),
    (Flags::MAP_REAL_UID, |j| j.map_real_uid),
    (Flags::DEVICE, |j| j.device),
    (Flags::SHARE_RUNTIME, |j| j.share_runtime),
    (Flags::SHARE_TMPDIR, |j| j.share_tmpdir),
];

impl Serialize for ContainerConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ContainerConfigJson {
            hostname: self.hostname.clone(),
            wait_delay: self.wait_delay,
            env: self.env.clone(),
            filesystem: self.filesystem.clone(),
            username: self.username.clone(),
            shell: self.shell.clone(),
            home: self.home.clone(),
            path: self.path.clone(),
            args: self.args.clone(),
            cgroup: self.cgroup.clone(),
            seccomp_compat: self.flags.contains(Flags::SECCOMP_COMPAT),
            devel: self.flags.contains(Flags::DEVEL),
            userns: self.flags.contains(Flags::USERNS),
            host_net: self.flags.contains(Flags::HOST_NET),
            host_abstract: self.flags.contains(Flags::HOST_ABSTRACT),
            tty: self.flags.contains(Flags::TTY),
            multiarch: self.flags.contains(Flags::MULTIARCH),
            map_real_uid: self.flags.contains(Flags::MAP_REAL_UID),
            device: self.flags.contains(Flags::DEVICE),
            share_runtime: self.flags.contains(Flags::SHARE_RUNTIME),
            share_tmpdir: self.flags.contains(Flags::SHARE_TMPDIR),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContainerConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let j = ContainerConfigJson::deserialize(deserializer)?;
        let mut flags = Flags::default();
        for (flag, get) in FLAG_BITS {
            if get(&j) {
                flags |= flag;
            }
        }
        Ok(ContainerConfig {
            hostname: j.hostname,
            wait_delay: j.wait_delay,
            env: j.env,
            filesystem: j.filesystem,
            username: j.username,
            shell: j.shell,
            home: j.home,
            path: j.path,
            args: j.args,
            flags,
            cgroup: j.cgroup,
        })
    }
}

/// Configures a cgroup v2 subtree for the container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Delegated slice that instances are created under. Relative values
    /// are resolved against [`CGROUP_ROOT`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slice: String,
    /// Microsecond quota applied to the default 100000µs period. Zero
    /// leaves cpu.max untouched.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub limit_cpu: u64,
    /// Cap on memory.max in bytes. Zero keeps the current limit.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub limit_memory: u64,
    /// Cap on pids.max. Zero disables the limit.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub limit_pids: i64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl CgroupConfig {
    /// Ensures cgroup constraints are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_pids < 0 {
            return Err(ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::Invalid,
                "cgroup limit pids cannot be negative",
            ));
        }
        self.slice_path()?;
        Ok(())
    }

    /// Resolves the absolute slice root path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigErrorKind::CgroupPath`] if the cleaned slice escapes
    /// the cgroup root.
    pub fn slice_path(&self) -> Result<Absolute, ConfigError> {
        let raw = if self.slice.is_empty() {
            DEFAULT_CGROUP_SLICE.to_owned()
        } else if self.slice.starts_with('/') {
            self.slice.clone()
        } else {
            format!("{CGROUP_ROOT}/{}", self.slice)
        };

        let err = || {
            ConfigError::new(
                STEP_VALIDATE,
                ConfigErrorKind::CgroupPath,
                format!("invalid cgroup slice {:?}", self.slice),
            )
        };
        let cleaned = Absolute::new(&raw).map_err(|_| err())?;
        // lexical .. climbing must not leave the cgroup root
        let root = Absolute::new(CGROUP_ROOT).map_err(|_| err())?;
        if !cleaned.is_beneath(&root) {
            return Err(err());
        }
        Ok(cleaned)
    }

    /// The per-instance cgroup directory: `<slice>/hakurei-<identity>/<id>`.
    pub fn instance_path(
        &self,
        identity: i32,
        id: &crate::id::InstanceId,
    ) -> Result<Absolute, ConfigError> {
        Ok(self
            .slice_path()?
            .append(format!("hakurei-{identity}"))
            .append(id.to_string()))
    }
}
