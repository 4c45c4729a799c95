//! Container init.
//!
//! Runs as PID 1 of the new namespaces. Receives [`InitParams`] over the
//! param pipe, maps its own user namespace credentials, stages the container
//! filesystem under a scratch tmpfs, pivots into it, loads the seccomp
//! filter, and execs the initial program as its only direct child. After the
//! initial program exits, adopted children are reaped under the
//! adopt-wait-delay budget before init itself exits.
//!
//! Exit codes: the initial program's own code on the normal path,
//! [`EXIT_CANCEL`] after the cancellation signal, [`EXIT_FAILURE`] on any
//! setup error.

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, FromRawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, pivot_root, sethostname, Pid};
use tracing::{debug, warn};

use crate::container::{
    normalize_adopt_wait_delay, seccomp, InitParams, EXIT_CANCEL, EXIT_FAILURE, SETUP_ENV,
};
use crate::error::StartError;
use crate::proto;

/// Scratch mount point for the staging root; shadowed by a tmpfs in the new
/// mount namespace, while the host view stays reachable through the old
/// root.
const STAGING_BASE: &str = "/tmp";
const NEWROOT: &str = "newroot";
const OLDROOT: &str = "oldroot";

/// Whether the current process was invoked as container init.
#[must_use]
pub fn is_init() -> bool {
    std::env::var_os(SETUP_ENV).is_some()
}

/// Init entry point; never returns.
pub fn run() -> ! {
    let code = match init_main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.user_message());
            EXIT_FAILURE
        }
    };
    std::process::exit(code)
}

fn init_main() -> Result<i32, StartError> {
    let fd: i32 = std::env::var(SETUP_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            StartError::origin(
                "invalid setup descriptor",
                io::Error::from_raw_os_error(libc::EBADF),
            )
        })?;

    // SAFETY: the descriptor number comes from the parent's fd layout
    let mut setup = unsafe { File::from_raw_fd(fd) };
    let init_params: InitParams = proto::read_frame(&mut setup)
        .map_err(|e| StartError::new(true, "receive init params", io::Error::other(e)))?;
    drop(setup);

    init_logging(init_params.verbose);
    debug!(argv = ?init_params.params.args, "container init starting");

    let params = &init_params.params;

    write_userns_maps(
        params.uid,
        params.gid,
        init_params.priv_uid,
        init_params.priv_gid,
    )
    .map_err(|e| StartError::new(true, "write user namespace maps", e))?;

    if !params.hostname.is_empty() {
        sethostname(&params.hostname)
            .map_err(|e| StartError::new(false, "set container hostname", e.into()))?;
    }

    // unsharing the PID namespace only affects children, so init forks once
    // more; the intermediate stays outside as a signal-forwarding parent and
    // the child continues as PID 1 of the new namespace
    become_pid_one()?;

    let parent_perm = if params.parent_perm == 0 {
        0o755
    } else {
        params.parent_perm
    };
    stage_filesystem(params, parent_perm)?;

    if !params.seccomp_disable {
        let program = seccomp::compile(params.seccomp_presets, &params.seccomp_rules)
            .map_err(|e| StartError::new(true, "compile seccomp filter", e))?;
        seccomp::load(&program).map_err(|e| StartError::new(true, "load seccomp filter", e))?;
        debug!(presets = ?params.seccomp_presets, "loaded seccomp filter");
    }

    if !params.privileged {
        drop_ambient_caps();
    }

    // block before spawning; std resets the mask in spawned children
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGUSR2);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .map_err(|e| StartError::new(true, "block signals", e.into()))?;
    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
        .map_err(|e| StartError::new(true, "create signal descriptor", e.into()))?;

    let child = spawn_initial(params)?;
    let child_pid = Pid::from_raw(child.id() as i32);
    debug!(pid = child.id(), "spawned initial process");

    let adopt_wait_delay = normalize_adopt_wait_delay(params.adopt_wait_delay);
    Ok(supervise(
        sfd,
        child,
        child_pid,
        params.forward_cancel,
        adopt_wait_delay,
    ))
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Forks so the continuation runs as PID 1 of the PID namespace unshared
/// before exec. The intermediate process never returns: it forwards
/// cancellation signals to the child and exits with its status.
fn become_pid_one() -> Result<(), StartError> {
    use nix::unistd::{fork, ForkResult};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGUSR2);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .map_err(|e| StartError::new(true, "block signals", e.into()))?;

    // SAFETY: both sides continue running Rust code owned by this process
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
                .map_err(|e| StartError::new(true, "prctl(PR_SET_PDEATHSIG)", e.into()))?;
            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)
                .map_err(|e| StartError::new(true, "unblock signals", e.into()))?;
            Ok(())
        }
        Ok(ForkResult::Parent { child }) => forward_and_exit(&mask, child),
        Err(e) => Err(StartError::new(true, "fork into pid namespace", e.into())),
    }
}

/// Intermediate parent loop: forwards cancellation signals to `child`,
/// exits with its status once it terminates.
fn forward_and_exit(mask: &SigSet, child: Pid) -> ! {
    let sfd = match SignalFd::with_flags(mask, SfdFlags::SFD_CLOEXEC) {
        Ok(sfd) => sfd,
        Err(_) => std::process::exit(EXIT_FAILURE),
    };
    loop {
        let signal = match sfd.read_signal() {
            Ok(Some(info)) => Signal::try_from(info.ssi_signo as i32).ok(),
            _ => continue,
        };
        match signal {
            Some(Signal::SIGCHLD) => loop {
                match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => std::process::exit(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        std::process::exit(128 + signal as i32)
                    }
                    Ok(_) => break,
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(_) => std::process::exit(EXIT_FAILURE),
                }
            },
            Some(signal @ (Signal::SIGUSR2 | Signal::SIGTERM | Signal::SIGINT)) => {
                let _ = nix::sys::signal::kill(child, signal);
            }
            _ => {}
        }
    }
}

/// Maps this process to the configured credentials inside its own user
/// namespace. A process may always install a single self-mapping.
fn write_userns_maps(uid: i32, gid: i32, priv_uid: u32, priv_gid: u32) -> io::Result<()> {
    fs::write("/proc/self/setgroups", "deny\n")?;
    fs::write("/proc/self/uid_map", format!("{uid} {priv_uid} 1\n"))?;
    fs::write("/proc/self/gid_map", format!("{gid} {priv_gid} 1\n"))?;
    Ok(())
}

/// Builds the container root under a scratch tmpfs and pivots into it.
///
/// After the first pivot the old root stays reachable at `/oldroot`, so op
/// sources resolve against it while targets land in `/newroot`.
fn stage_filesystem(
    params: &crate::container::Params,
    parent_perm: u32,
) -> Result<(), StartError> {
    let fail = |step: &'static str| move |e: nix::errno::Errno| StartError::new(true, step, e.into());

    // stop mount events from leaking back to the host
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(fail("make root propagation slave"))?;

    mount(
        Some("tmpfs"),
        STAGING_BASE,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )
    .map_err(fail("mount staging tmpfs"))?;

    let base = Path::new(STAGING_BASE);
    fs::create_dir(base.join(NEWROOT))
        .and_then(|()| fs::create_dir(base.join(OLDROOT)))
        .map_err(|e| StartError::new(true, "create staging directories", e))?;

    pivot_root(STAGING_BASE, base.join(OLDROOT).as_path())
        .map_err(fail("pivot into staging root"))?;
    chdir("/").map_err(fail("enter staging root"))?;

    let newroot = Path::new("/").join(NEWROOT);
    let oldroot = Path::new("/").join(OLDROOT);

    // the final pivot target must itself be a mount point
    mount(
        Some(&newroot),
        &newroot,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(fail("bind container root"))?;

    for op in &params.ops {
        op.apply(&newroot, &oldroot, parent_perm)
            .map_err(|e| StartError::new(true, "apply container op", e))?;
    }

    // stacked pivot: mount the prepared root over itself and detach the rest
    chdir(&newroot).map_err(fail("enter container root"))?;
    pivot_root(".", ".").map_err(fail("pivot into container root"))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(fail("detach intermediate root"))?;
    chdir("/").map_err(fail("enter container root"))?;

    Ok(())
}

fn drop_ambient_caps() {
    use caps::CapSet;

    if let Err(e) = caps::clear(None, CapSet::Ambient) {
        warn!(error = %e, "cannot clear ambient capabilities");
    }
    if let Err(e) = caps::clear(None, CapSet::Bounding) {
        warn!(error = %e, "cannot clear bounding capabilities");
    }
}

fn spawn_initial(params: &crate::container::Params) -> Result<Child, StartError> {
    let path = params.path.as_ref().ok_or_else(|| {
        StartError::origin(
            "invalid executable pathname",
            io::Error::from_raw_os_error(libc::EINVAL),
        )
    })?;

    let mut cmd = Command::new(path.as_path());
    if let Some((_, args)) = params.args.split_first() {
        cmd.args(args);
    }
    if let Some(argv0) = params.args.first() {
        use std::os::unix::process::CommandExt;
        cmd.arg0(argv0);
    }
    cmd.env_clear();
    for entry in &params.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    if let Some(dir) = &params.dir {
        cmd.current_dir(dir.as_path());
    }
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    cmd.spawn()
        .map_err(|e| StartError::passthrough(false, "start initial process", e))
}

/// Reaps children and reacts to the cancellation signal.
///
/// Returns the process exit code for init.
fn supervise(
    sfd: SignalFd,
    child: Child,
    child_pid: Pid,
    forward_cancel: bool,
    adopt_wait_delay: Duration,
) -> i32 {
    let mut exit_code: Option<i32> = None;
    let mut cancelled = false;
    let mut deadline: Option<Instant> = None;

    loop {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                debug!("adopted children lingering, delivering SIGKILL");
                let _ = nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL);
                reap_all(&child, &mut exit_code);
                return finish(exit_code, cancelled);
            }
        }

        let timeout = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                PollTimeout::from(remaining.as_millis().min(u128::from(u16::MAX)) as u16)
            }
            None => PollTimeout::NONE,
        };

        let mut fds = [PollFd::new(sfd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "poll failed in supervisor");
                return EXIT_FAILURE;
            }
        }

        let signal = match sfd.read_signal() {
            Ok(Some(info)) => Signal::try_from(info.ssi_signo as i32).ok(),
            Ok(None) => continue,
            Err(_) => continue,
        };

        match signal {
            Some(Signal::SIGCHLD) => {
                if !reap_all(&child, &mut exit_code) {
                    return finish(exit_code, cancelled);
                }
                if exit_code.is_some() && deadline.is_none() {
                    // initial process gone; bound the adopted-child wait
                    if adopt_wait_delay.is_zero() {
                        let _ = nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL);
                        reap_all(&child, &mut exit_code);
                        return finish(exit_code, cancelled);
                    }
                    deadline = Some(Instant::now() + adopt_wait_delay);
                }
            }
            Some(Signal::SIGUSR2) | Some(Signal::SIGTERM) | Some(Signal::SIGINT) => {
                if cancelled {
                    continue;
                }
                cancelled = true;
                debug!("cancellation requested, interrupting initial process");
                let term = if forward_cancel {
                    Signal::SIGINT
                } else {
                    Signal::SIGTERM
                };
                let _ = nix::sys::signal::kill(child_pid, term);
                if adopt_wait_delay.is_zero() {
                    let _ = nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL);
                    reap_all(&child, &mut exit_code);
                    return finish(exit_code, cancelled);
                }
                deadline = Some(Instant::now() + adopt_wait_delay);
            }
            _ => {}
        }
    }
}

/// Reaps every waitable child; returns false once no children remain.
fn reap_all(child: &Child, exit_code: &mut Option<i32>) -> bool {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if pid.as_raw() == child.id() as i32 && exit_code.is_none() {
                    *exit_code = Some(code);
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                if pid.as_raw() == child.id() as i32 && exit_code.is_none() {
                    *exit_code = Some(128 + signal as i32);
                }
            }
            Ok(WaitStatus::StillAlive) => return true,
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => return false,
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                return false;
            }
        }
    }
}

fn finish(exit_code: Option<i32>, cancelled: bool) -> i32 {
    if cancelled {
        EXIT_CANCEL
    } else {
        exit_code.unwrap_or(EXIT_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_codes() {
        assert_eq!(finish(Some(0), false), 0);
        assert_eq!(finish(Some(7), false), 7);
        assert_eq!(finish(Some(0), true), EXIT_CANCEL);
        assert_eq!(finish(None, false), EXIT_FAILURE);
    }

    #[test]
    fn test_is_init_reflects_env() {
        // the variable is absent in the test environment
        assert!(!is_init());
    }
}
