//! Outcome op implementations.
//!
//! One variant per pipeline stage. `to_system` runs on the privileged side
//! and registers host mutations on the transaction; `to_container`
//! runs in the shim and populates the container launch parameters. Fields
//! on the variants are the only state that crosses the process boundary.

use serde::{Deserialize, Serialize};

use crate::config::{BusConfig, EnablementSet, FilesystemConfig, Flags, PRIVATE_TMP};
use crate::container::seccomp::FilterPreset;
use crate::container::ContainerOp;
use crate::error::{ConfigError, ConfigErrorKind, Error};
use crate::outcome::{ParamsState, PlanError, PlanResult, SysState};
use crate::path::Absolute;
use crate::system::{AclPerms, CgroupLimits, USER};

/// Default username of the emulated account.
const DEFAULT_USERNAME: &str = "chronos";

/// Upstream address of the system message bus.
const SYSTEM_BUS_UPSTREAM: &str = "unix:path=/run/dbus/system_bus_socket";

fn state_error(step: &'static str, msg: &str) -> Error {
    ConfigError::new(step, ConfigErrorKind::Invalid, msg.to_owned()).into()
}

/// A planner op contributing host mutations and container parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutcomeOp {
    /// Seeds the container params from the validated config.
    Params,
    /// Creates the per-instance cgroup subtree.
    Cgroup { path: Absolute },
    /// Provides the container XDG_RUNTIME_DIR.
    Runtime { host_path: Absolute },
    /// Provides the container /tmp.
    Tmpdir { host_path: Absolute },
    /// Synthesises the emulated account files.
    Account,
    /// Exposes the wayland socket, attached or direct.
    Wayland { socket: Absolute, direct: bool },
    /// Adds the X server host entry and exposes the socket directory.
    X11 { display: String },
    /// Exposes the PulseAudio socket and authentication cookie.
    Pulse {
        socket: Absolute,
        cookie: Option<Absolute>,
    },
    /// Launches the interface-filtered message bus proxy.
    Dbus {
        session_path: Absolute,
        system_path: Option<Absolute>,
    },
    /// Applies extra ACL updates and compiles the mount table.
    Filesystem,
}

/// The fixed pipeline order.
pub(crate) fn pipeline() -> Vec<OutcomeOp> {
    vec![
        // must run first
        OutcomeOp::Params,
        OutcomeOp::Cgroup {
            path: Absolute::new("/").expect("literal pathname"),
        },
        OutcomeOp::Runtime {
            host_path: Absolute::new("/").expect("literal pathname"),
        },
        OutcomeOp::Tmpdir {
            host_path: Absolute::new("/").expect("literal pathname"),
        },
        OutcomeOp::Account,
        // optional via enablements
        OutcomeOp::Wayland {
            socket: Absolute::new("/").expect("literal pathname"),
            direct: false,
        },
        OutcomeOp::X11 {
            display: String::new(),
        },
        OutcomeOp::Pulse {
            socket: Absolute::new("/").expect("literal pathname"),
            cookie: None,
        },
        OutcomeOp::Dbus {
            session_path: Absolute::new("/").expect("literal pathname"),
            system_path: None,
        },
        // must run last
        OutcomeOp::Filesystem,
    ]
}

impl OutcomeOp {
    /// Short name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            OutcomeOp::Params => "params",
            OutcomeOp::Cgroup { .. } => "cgroup",
            OutcomeOp::Runtime { .. } => "runtime",
            OutcomeOp::Tmpdir { .. } => "tmpdir",
            OutcomeOp::Account => "account",
            OutcomeOp::Wayland { .. } => "wayland",
            OutcomeOp::X11 { .. } => "x11",
            OutcomeOp::Pulse { .. } => "pulse",
            OutcomeOp::Dbus { .. } => "dbus",
            OutcomeOp::Filesystem => "filesystem",
        }
    }

    /// Inflicts the outcome on the transaction in the privileged process.
    pub(crate) fn to_system(&mut self, s: &mut SysState<'_>) -> PlanResult {
        match self {
            OutcomeOp::Params => params_to_system(s),
            OutcomeOp::Cgroup { path } => cgroup_to_system(path, s),
            OutcomeOp::Runtime { host_path } => runtime_to_system(host_path, s),
            OutcomeOp::Tmpdir { host_path } => tmpdir_to_system(host_path, s),
            OutcomeOp::Account => Ok(()),
            OutcomeOp::Wayland { socket, direct } => wayland_to_system(socket, direct, s),
            OutcomeOp::X11 { display } => x11_to_system(display, s),
            OutcomeOp::Pulse { socket, cookie } => pulse_to_system(socket, cookie, s),
            OutcomeOp::Dbus {
                session_path,
                system_path,
            } => dbus_to_system(session_path, system_path, s),
            OutcomeOp::Filesystem => filesystem_to_system(s),
        }
    }

    /// Inflicts the outcome on the container params in the shim process.
    ///
    /// Implementations must not write the env vector directly; the env map
    /// is collapsed into it by the final op.
    pub(crate) fn to_container(&self, s: &mut ParamsState<'_>) -> Result<(), Error> {
        match self {
            OutcomeOp::Params => params_to_container(s),
            OutcomeOp::Cgroup { path } => {
                s.params.cgroup_path = Some(path.clone());
                Ok(())
            }
            OutcomeOp::Runtime { host_path } => runtime_to_container(host_path, s),
            OutcomeOp::Tmpdir { host_path } => {
                s.params.ops.push(ContainerOp::Bind {
                    src: host_path.clone(),
                    dst: Absolute::new("/tmp").expect("literal pathname"),
                    write: true,
                    device: false,
                    optional: false,
                });
                Ok(())
            }
            OutcomeOp::Account => account_to_container(s),
            OutcomeOp::Wayland { socket, .. } => wayland_to_container(socket, s),
            OutcomeOp::X11 { display } => x11_to_container(display, s),
            OutcomeOp::Pulse { socket, cookie } => pulse_to_container(socket, cookie, s),
            OutcomeOp::Dbus {
                session_path,
                system_path,
            } => dbus_to_container(session_path, system_path, s),
            OutcomeOp::Filesystem => filesystem_to_container(s),
        }
    }
}

fn params_to_system(s: &mut SysState<'_>) -> PlanResult {
    // parent of every per-instance share directory
    s.sys.ensure(s.state.paths.share_path.clone(), 0o711);
    Ok(())
}

fn params_to_container(s: &mut ParamsState<'_>) -> Result<(), Error> {
    let c = &s.state.container;
    let p = &mut s.params;

    p.hostname = c.hostname.clone();
    p.path = c.path.clone();
    p.args = if c.args.is_empty() {
        c.path
            .as_ref()
            .map(|path| vec![path.as_str().to_owned()])
            .unwrap_or_default()
    } else {
        c.args.clone()
    };
    p.dir = c.home.clone();
    p.uid = s.state.mapuid;
    p.gid = s.state.mapgid;
    p.adopt_wait_delay = s.state.shim.wait_delay;
    p.retain_session = c.flags.contains(Flags::TTY);
    p.host_net = c.flags.contains(Flags::HOST_NET);
    p.host_abstract = c.flags.contains(Flags::HOST_ABSTRACT);

    let mut presets = FilterPreset::EXT
        | FilterPreset::DENY_NS
        | FilterPreset::DENY_TTY
        | FilterPreset::DENY_DEVEL;
    if c.flags.contains(Flags::USERNS) {
        presets = presets.without(FilterPreset::DENY_NS);
    }
    if c.flags.contains(Flags::TTY) {
        presets = presets.without(FilterPreset::DENY_TTY);
    }
    if c.flags.contains(Flags::DEVEL) {
        presets = presets.without(FilterPreset::DENY_DEVEL);
    }
    if c.flags.contains(Flags::MULTIARCH) {
        presets |= FilterPreset::MULTIARCH;
    }
    if c.flags.contains(Flags::SECCOMP_COMPAT) {
        presets |= FilterPreset::COMPAT;
    }
    p.seccomp_presets = presets;

    if let Ok(term) = std::env::var("TERM") {
        s.env.insert(String::from("TERM"), term);
    }
    Ok(())
}

fn cgroup_to_system(path: &mut Absolute, s: &mut SysState<'_>) -> PlanResult {
    let Some(cgroup) = &s.state.container.cgroup else {
        return Err(PlanError::NotEnabled);
    };

    let slice = cgroup.slice_path()?;
    let instance = cgroup.instance_path(s.state.identity, &s.state.id)?;

    s.sys.cgroup(
        slice,
        instance.clone(),
        CgroupLimits {
            cpu: cgroup.limit_cpu,
            memory: cgroup.limit_memory,
            pids: cgroup.limit_pids,
        },
    );

    *path = instance;
    Ok(())
}

fn runtime_to_system(host_path: &mut Absolute, s: &mut SysState<'_>) -> PlanResult {
    let dir = if s.state.container.flags.contains(Flags::SHARE_RUNTIME) {
        s.ensure_runtime_dir();
        let dir = s
            .state
            .paths
            .run_dir_path
            .append(format!("identity-{}", s.state.identity));
        s.sys.ensure(dir.clone(), 0o700);
        s.sys
            .update_perm_type(USER, dir.clone(), AclPerms::new(true, true, true));
        dir
    } else {
        let dir = s.runtime();
        s.sys
            .update_perm(dir.clone(), AclPerms::new(true, true, true));
        dir
    };
    *host_path = dir;
    Ok(())
}

fn runtime_to_container(host_path: &Absolute, s: &mut ParamsState<'_>) -> Result<(), Error> {
    let runtime_dir = Absolute::new(format!("/run/user/{}", s.state.mapuid))
        .map_err(|e| state_error("derive runtime directory", &e.to_string()))?;

    s.params.ops.push(ContainerOp::Tmpfs {
        dst: Absolute::new("/run/user").expect("literal pathname"),
        size: Some(1 << 22),
        perm: 0o755,
    });
    s.params.ops.push(ContainerOp::Bind {
        src: host_path.clone(),
        dst: runtime_dir.clone(),
        write: true,
        device: false,
        optional: false,
    });

    s.env.insert(
        String::from("XDG_RUNTIME_DIR"),
        runtime_dir.as_str().to_owned(),
    );
    s.env.insert(
        String::from("XDG_SESSION_CLASS"),
        String::from("user"),
    );
    s.env.insert(String::from("XDG_SESSION_TYPE"), String::from("tty"));
    s.runtime_dir = Some(runtime_dir);
    Ok(())
}

fn tmpdir_to_system(host_path: &mut Absolute, s: &mut SysState<'_>) -> PlanResult {
    let dir = if s.state.container.flags.contains(Flags::SHARE_TMPDIR) {
        let base = s.state.paths.share_path.append("tmpdir");
        s.sys.ensure(base.clone(), 0o700);
        let dir = base.append(s.state.identity.to_string());
        s.sys.ensure(dir.clone(), 0o700);
        s.sys
            .update_perm_type(USER, dir.clone(), AclPerms::new(true, true, true));
        dir
    } else {
        let dir = s.instance().append("tmpdir");
        s.sys.ephemeral(crate::system::PROCESS, dir.clone(), 0o700);
        s.sys
            .update_perm(dir.clone(), AclPerms::new(true, true, true));
        dir
    };
    *host_path = dir;
    Ok(())
}

fn account_to_container(s: &mut ParamsState<'_>) -> Result<(), Error> {
    let c = &s.state.container;
    let username = if c.username.is_empty() {
        DEFAULT_USERNAME
    } else {
        &c.username
    };
    let home = c
        .home
        .as_ref()
        .ok_or_else(|| state_error("synthesise account", "invalid account state"))?;
    let shell = c
        .shell
        .as_ref()
        .ok_or_else(|| state_error("synthesise account", "invalid account state"))?;

    let passwd = format!(
        "{username}:x:{uid}:{gid}:Hakurei:{home}:{shell}\n",
        uid = s.state.mapuid,
        gid = s.state.mapgid,
    );
    let group = format!("hakurei:x:{gid}:\n", gid = s.state.mapgid);

    s.params.ops.push(ContainerOp::WriteFile {
        dst: Absolute::new("/etc/passwd").expect("literal pathname"),
        content: passwd,
    });
    s.params.ops.push(ContainerOp::WriteFile {
        dst: Absolute::new("/etc/group").expect("literal pathname"),
        content: group,
    });

    s.env
        .insert(String::from("USER"), username.to_owned());
    s.env
        .insert(String::from("HOME"), home.as_str().to_owned());
    s.env
        .insert(String::from("SHELL"), shell.as_str().to_owned());
    Ok(())
}

fn wayland_to_system(socket: &mut Absolute, direct: &mut bool, s: &mut SysState<'_>) -> PlanResult {
    if !s.enablements.contains(EnablementSet::WAYLAND) {
        return Err(PlanError::NotEnabled);
    }

    let display = std::env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| String::from("wayland-0"));
    let host_socket = if display.starts_with('/') {
        Absolute::new(&display)
            .map_err(|e| state_error("locate wayland socket", &e.to_string()))?
    } else {
        s.state.paths.runtime_path.append(&display)
    };

    if s.direct_wayland {
        // no security-context-v1 attachment, grant access to the bare socket
        s.sys.update_perm_type(
            EnablementSet::WAYLAND,
            host_socket.clone(),
            AclPerms::new(true, true, false),
        );
        *socket = host_socket;
        *direct = true;
    } else {
        let dst = s.instance().append("wayland");
        s.sys.wayland(
            dst.clone(),
            host_socket,
            s.app_id.clone(),
            s.state.id.to_string(),
        );
        *socket = dst;
    }
    Ok(())
}

fn wayland_to_container(socket: &Absolute, s: &mut ParamsState<'_>) -> Result<(), Error> {
    let runtime_dir = s
        .runtime_dir
        .as_ref()
        .ok_or_else(|| state_error("expose wayland socket", "invalid wayland state"))?;

    s.params.ops.push(ContainerOp::Bind {
        src: socket.clone(),
        dst: runtime_dir.append("wayland-0"),
        write: true,
        device: false,
        optional: false,
    });
    s.env.insert(
        String::from("WAYLAND_DISPLAY"),
        String::from("wayland-0"),
    );
    Ok(())
}

fn x11_to_system(display_out: &mut String, s: &mut SysState<'_>) -> PlanResult {
    if !s.enablements.contains(EnablementSet::X11) {
        return Err(PlanError::NotEnabled);
    }

    let display = std::env::var("DISPLAY")
        .map_err(|_| state_error("configure X11", "DISPLAY is unset"))?;

    let username = if s.state.container.username.is_empty() {
        DEFAULT_USERNAME.to_owned()
    } else {
        s.state.container.username.clone()
    };
    s.sys.change_hosts(username);

    *display_out = display;
    Ok(())
}

fn x11_to_container(display: &String, s: &mut ParamsState<'_>) -> Result<(), Error> {
    let sockets = Absolute::new("/tmp/.X11-unix").expect("literal pathname");
    s.params.ops.push(ContainerOp::Bind {
        src: sockets.clone(),
        dst: sockets,
        write: true,
        device: false,
        optional: false,
    });
    s.env.insert(String::from("DISPLAY"), display.clone());
    Ok(())
}

fn pulse_to_system(
    socket: &mut Absolute,
    cookie: &mut Option<Absolute>,
    s: &mut SysState<'_>,
) -> PlanResult {
    if !s.enablements.contains(EnablementSet::PULSE) {
        return Err(PlanError::NotEnabled);
    }

    let host_socket = s.state.paths.runtime_path.append("pulse/native");
    if !host_socket.as_path().exists() {
        return Err(state_error(
            "configure pulseaudio",
            &format!("pulseaudio socket {:?} not found", host_socket.as_str()),
        )
        .into());
    }
    *socket = host_socket;

    if let Some(source) = discover_pulse_cookie() {
        let dst = s.instance().append("pulse-cookie");
        s.sys.copy_file(dst.clone(), source);
        *cookie = Some(dst);
    }
    Ok(())
}

/// Locates the PulseAudio authentication cookie the way the client library
/// does: explicit override first, then the legacy and current locations.
fn discover_pulse_cookie() -> Option<Absolute> {
    if let Ok(path) = std::env::var("PULSE_COOKIE") {
        return Absolute::new(&path).ok().filter(|p| p.as_path().is_file());
    }
    let home = std::env::var("HOME").ok()?;
    let home = Absolute::new(&home).ok()?;
    [home.append(".pulse-cookie"), home.append(".config/pulse/cookie")]
        .into_iter()
        .find(|p| p.as_path().is_file())
}

fn pulse_to_container(
    socket: &Absolute,
    cookie: &Option<Absolute>,
    s: &mut ParamsState<'_>,
) -> Result<(), Error> {
    let runtime_dir = s
        .runtime_dir
        .as_ref()
        .ok_or_else(|| state_error("expose pulseaudio socket", "invalid pulseaudio state"))?
        .clone();

    s.params.ops.push(ContainerOp::Bind {
        src: socket.clone(),
        dst: runtime_dir.append("pulse/native"),
        write: true,
        device: false,
        optional: false,
    });
    s.env.insert(
        String::from("PULSE_SERVER"),
        format!("unix:{}", runtime_dir.append("pulse/native")),
    );

    if let Some(cookie) = cookie {
        let inner = runtime_dir.append("pulse-cookie");
        s.params.ops.push(ContainerOp::Bind {
            src: cookie.clone(),
            dst: inner.clone(),
            write: false,
            device: false,
            optional: false,
        });
        s.env
            .insert(String::from("PULSE_COOKIE"), inner.as_str().to_owned());
    }
    Ok(())
}

fn dbus_to_system(
    session_path: &mut Absolute,
    system_path: &mut Option<Absolute>,
    s: &mut SysState<'_>,
) -> PlanResult {
    let enabled = s.enablements.contains(EnablementSet::DBUS)
        || s.session_bus.is_some()
        || s.system_bus.is_some();
    if !enabled {
        return Err(PlanError::NotEnabled);
    }

    // session bus proxy assumes built-in defaults when unset
    let session = s.session_bus.clone().unwrap_or_else(|| BusConfig {
        talk: if s.app_id.is_empty() {
            Vec::new()
        } else {
            vec![format!("{}.*", s.app_id)]
        },
        ..BusConfig::default()
    });

    let upstream_session = std::env::var("DBUS_SESSION_BUS_ADDRESS").unwrap_or_else(|_| {
        format!(
            "unix:path={}",
            s.state.paths.runtime_path.append("bus")
        )
    });

    let session_socket = s.instance().append("bus");
    let mut args = proxy_args(&upstream_session, &session_socket, &session);

    if let Some(system) = s.system_bus.clone() {
        let system_socket = s.instance().append("system_bus_socket");
        args.extend(proxy_args(SYSTEM_BUS_UPSTREAM, &system_socket, &system));
        *system_path = Some(system_socket);
    }

    s.sys.dbus_proxy(args);
    *session_path = session_socket;
    Ok(())
}

/// Argument block for one bus of the external proxy program.
fn proxy_args(upstream: &str, socket: &Absolute, config: &BusConfig) -> Vec<String> {
    let mut args = vec![upstream.to_owned(), socket.as_str().to_owned()];
    if config.filter {
        args.push(String::from("--filter"));
    }
    for name in &config.see {
        args.push(format!("--see={name}"));
    }
    for name in &config.talk {
        args.push(format!("--talk={name}"));
    }
    for name in &config.own {
        args.push(format!("--own={name}"));
    }
    args
}

fn dbus_to_container(
    session_path: &Absolute,
    system_path: &Option<Absolute>,
    s: &mut ParamsState<'_>,
) -> Result<(), Error> {
    let runtime_dir = s
        .runtime_dir
        .as_ref()
        .ok_or_else(|| state_error("expose message bus", "invalid message bus state"))?
        .clone();

    let inner_session = runtime_dir.append("bus");
    s.params.ops.push(ContainerOp::Bind {
        src: session_path.clone(),
        dst: inner_session.clone(),
        write: true,
        device: false,
        optional: false,
    });
    s.env.insert(
        String::from("DBUS_SESSION_BUS_ADDRESS"),
        format!("unix:path={inner_session}"),
    );

    if let Some(system_path) = system_path {
        let inner_system = Absolute::new("/run/dbus/system_bus_socket").expect("literal pathname");
        s.params.ops.push(ContainerOp::Bind {
            src: system_path.clone(),
            dst: inner_system.clone(),
            write: true,
            device: false,
            optional: false,
        });
        s.env.insert(
            String::from("DBUS_SYSTEM_BUS_ADDRESS"),
            format!("unix:path={inner_system}"),
        );
    }
    Ok(())
}

fn filesystem_to_system(s: &mut SysState<'_>) -> PlanResult {
    let extra_perms = s.extra_perms.clone();
    for perm in &extra_perms {
        if perm.ensure {
            s.sys.ensure(perm.path.clone(), 0o700);
        }
        s.sys.update_perm_type(
            USER,
            perm.path.clone(),
            AclPerms::new(perm.r, perm.w, perm.x),
        );
    }
    Ok(())
}

fn filesystem_to_container(s: &mut ParamsState<'_>) -> Result<(), Error> {
    let c = &s.state.container;
    let mut entries = c.filesystem.as_slice();

    // a root-targeting first element is inserted ahead of every other mount
    if let Some((first, rest)) = entries.split_first() {
        if first.target().as_str() == "/" {
            s.params.ops.insert(0, filesystem_entry(first));
            entries = rest;
        }
    }

    for entry in entries {
        s.params.ops.push(filesystem_entry(entry));
    }

    // standard tail
    s.params.ops.push(ContainerOp::Proc {
        dst: Absolute::new("/proc").expect("literal pathname"),
    });
    s.params.ops.push(ContainerOp::Dev {
        dst: Absolute::new("/dev").expect("literal pathname"),
        bind_host: c.flags.contains(Flags::DEVICE),
    });
    s.params.ops.push(ContainerOp::Tmpfs {
        dst: Absolute::new(PRIVATE_TMP).expect("literal pathname"),
        size: None,
        perm: 0o700,
    });

    // collapse the env map into the transmitted vector
    s.params.env = s
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    Ok(())
}

fn filesystem_entry(entry: &FilesystemConfig) -> ContainerOp {
    match entry {
        FilesystemConfig::Bind {
            src,
            dst,
            write,
            device,
            optional,
        } => ContainerOp::Bind {
            src: src.clone(),
            dst: dst.clone().unwrap_or_else(|| src.clone()),
            write: *write,
            device: *device,
            optional: *optional,
        },
        FilesystemConfig::Tmpfs { dst, size, perm } => ContainerOp::Tmpfs {
            dst: dst.clone(),
            size: *size,
            perm: perm.unwrap_or(0o755),
        },
        FilesystemConfig::Overlay {
            dst,
            lower,
            upper,
            work,
        } => ContainerOp::Overlay {
            dst: dst.clone(),
            lower: lower.clone(),
            upper: upper.clone(),
            work: work.clone(),
        },
        FilesystemConfig::Link { dst, target } => ContainerOp::Symlink {
            dst: dst.clone(),
            target: target.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ContainerConfig};
    use crate::id::InstanceId;
    use crate::outcome::OutcomeState;

    fn test_state(flags: Flags) -> OutcomeState {
        let config = Config {
            id: String::from("com.example.app"),
            identity: 7,
            container: Some(ContainerConfig {
                username: String::from("chronos"),
                shell: Some(Absolute::new("/bin/sh").unwrap()),
                home: Some(Absolute::new("/home/chronos").unwrap()),
                path: Some(Absolute::new("/bin/app").unwrap()),
                args: vec![String::from("app-start"), String::from("--x")],
                flags,
                ..ContainerConfig::default()
            }),
            ..Config::default()
        };
        OutcomeState::new(InstanceId::generate(), &config, 0, false).unwrap()
    }

    #[test]
    fn test_params_seccomp_preset_derivation() {
        let state = test_state(Flags::default());
        let mut s = ParamsState::new(&state);
        params_to_container(&mut s).unwrap();
        let presets = s.params.seccomp_presets;
        assert!(presets.contains(FilterPreset::EXT));
        assert!(presets.contains(FilterPreset::DENY_NS));
        assert!(presets.contains(FilterPreset::DENY_TTY));
        assert!(presets.contains(FilterPreset::DENY_DEVEL));
        assert!(!presets.contains(FilterPreset::MULTIARCH));

        let state = test_state(Flags::USERNS | Flags::TTY | Flags::DEVEL | Flags::MULTIARCH);
        let mut s = ParamsState::new(&state);
        params_to_container(&mut s).unwrap();
        let presets = s.params.seccomp_presets;
        assert!(!presets.contains(FilterPreset::DENY_NS));
        assert!(!presets.contains(FilterPreset::DENY_TTY));
        assert!(!presets.contains(FilterPreset::DENY_DEVEL));
        assert!(presets.contains(FilterPreset::MULTIARCH));
        assert!(s.params.retain_session);
    }

    #[test]
    fn test_account_synthesis() {
        let state = test_state(Flags::default());
        let mut s = ParamsState::new(&state);
        account_to_container(&mut s).unwrap();

        let Some(ContainerOp::WriteFile { dst, content }) = s.params.ops.first() else {
            panic!("expected passwd write, got {:?}", s.params.ops);
        };
        assert_eq!(dst.as_str(), "/etc/passwd");
        assert!(content.starts_with(&format!("chronos:x:{}:", state.mapuid)));
        assert!(content.contains(":/home/chronos:/bin/sh"));

        assert_eq!(s.env.get("USER").map(String::as_str), Some("chronos"));
        assert_eq!(s.env.get("HOME").map(String::as_str), Some("/home/chronos"));
        assert_eq!(s.env.get("SHELL").map(String::as_str), Some("/bin/sh"));
    }

    #[test]
    fn test_filesystem_root_inserted_early() {
        let mut state = test_state(Flags::default());
        state.container.filesystem = vec![
            FilesystemConfig::Bind {
                src: Absolute::new("/var/lib/hakurei/base").unwrap(),
                dst: Some(Absolute::new("/").unwrap()),
                write: false,
                device: false,
                optional: false,
            },
            FilesystemConfig::Bind {
                src: Absolute::new("/etc/resolv.conf").unwrap(),
                dst: None,
                write: false,
                device: false,
                optional: true,
            },
        ];

        let mut s = ParamsState::new(&state);
        // an earlier op contributed a mount already
        s.params.ops.push(ContainerOp::Tmpfs {
            dst: Absolute::new("/run/user").unwrap(),
            size: None,
            perm: 0o755,
        });
        filesystem_to_container(&mut s).unwrap();

        // the root bind jumps ahead of the pre-existing op
        assert!(matches!(
            &s.params.ops[0],
            ContainerOp::Bind { dst, .. } if dst.as_str() == "/"
        ));
        assert!(matches!(
            s.params.ops.last(),
            Some(ContainerOp::Tmpfs { dst, .. }) if dst.as_str() == PRIVATE_TMP
        ));
    }

    #[test]
    fn test_filesystem_env_flatten_sorted() {
        let state = test_state(Flags::default());
        let mut s = ParamsState::new(&state);
        s.env.insert(String::from("B"), String::from("2"));
        s.env.insert(String::from("A"), String::from("1"));
        filesystem_to_container(&mut s).unwrap();
        assert_eq!(s.params.env, vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_proxy_args_shape() {
        let config = BusConfig {
            see: vec![String::from("org.freedesktop.portal.*")],
            talk: vec![String::from("org.freedesktop.Notifications")],
            own: vec![String::from("com.example.app.*")],
            filter: true,
        };
        let socket = Absolute::new("/tmp/hakurei.0/abc/bus").unwrap();
        let args = proxy_args("unix:path=/run/user/1000/bus", &socket, &config);
        assert_eq!(args[0], "unix:path=/run/user/1000/bus");
        assert_eq!(args[1], "/tmp/hakurei.0/abc/bus");
        assert!(args.contains(&String::from("--filter")));
        assert!(args.contains(&String::from("--see=org.freedesktop.portal.*")));
        assert!(args.contains(&String::from("--talk=org.freedesktop.Notifications")));
        assert!(args.contains(&String::from("--own=com.example.app.*")));
    }

    #[test]
    fn test_dev_bind_host_follows_device_flag() {
        let state = test_state(Flags::DEVICE);
        let mut s = ParamsState::new(&state);
        filesystem_to_container(&mut s).unwrap();
        assert!(s
            .params
            .ops
            .iter()
            .any(|op| matches!(op, ContainerOp::Dev { bind_host: true, .. })));
    }
}
