//! Privileged-side launch driver.
//!
//! Runs the whole pipeline for one invocation: validate the config, plan
//! the outcome, commit the host transaction, hand the state to the shim,
//! wait for the container to exit and revert the transaction. Each
//! invocation is a one-shot; nothing persists beyond the revert.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{EXIT_CANCEL, EXIT_FAILURE};
use crate::error::{ConfigError, ConfigErrorKind, Error, Result};
use crate::id::InstanceId;
use crate::outcome::{self, OutcomeState};
use crate::proto;
use crate::shim::SHIM_ENV;
use crate::system::{Criteria, System};

/// Environment variable naming the privilege broker executable.
const HSU_ENV: &str = "HAKUREI_HSU";

/// Descriptor number the state pipe is installed at in the shim.
const SHIM_FD: i32 = 3;

/// Launches one confined application instance and blocks until it exits.
///
/// Returns the exit code to propagate.
pub fn run(config: &Config, verbose: bool) -> Result<i32> {
    config.validate()?;

    let id = InstanceId::generate();
    let user_id = broker_user_id()?;
    info!(%id, identity = config.identity, user_id, "launching instance");

    let mut state = OutcomeState::new(id, config, user_id, verbose)?;
    let mut sys = System::new(state.target_uid());

    outcome::plan(config, &mut state, &mut sys)?;
    sys.commit()?;

    let result = spawn_shim_and_wait(&state);

    // partial or not, committed host state is torn down here; revert
    // failures are reported but never mask a launch failure
    if let Err(e) = sys.revert(Criteria(None)) {
        warn!("cannot revert host state:\n{e}");
    }

    result
}

/// Obtains the per-user identifier from the external setuid privilege
/// broker.
fn broker_user_id() -> Result<i32> {
    let hsu = std::env::var(HSU_ENV).unwrap_or_else(|_| String::from("hsu"));

    let step = "obtain user id from privilege broker";
    let output = Command::new(&hsu).output().map_err(|e| {
        Error::Config(ConfigError::new(
            step,
            ConfigErrorKind::Invalid,
            format!("cannot run {hsu:?}: {e}"),
        ))
    })?;
    if !output.status.success() {
        return Err(ConfigError::new(
            step,
            ConfigErrorKind::Invalid,
            format!("{hsu:?} exited with {}", output.status),
        )
        .into());
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| {
            ConfigError::new(step, ConfigErrorKind::Invalid, "malformed broker response").into()
        })
}

/// Spawns the shim with the state pipe installed and waits for it.
///
/// The write side of the pipe stays open until the shim exits so the shim
/// can detect privileged-side death as a hangup.
fn spawn_shim_and_wait(state: &OutcomeState) -> Result<i32> {
    let (pipe_rx, pipe_tx): (OwnedFd, OwnedFd) =
        nix::unistd::pipe().map_err(|e| Error::Io(e.into()))?;

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg0("hakurei-shim");
    cmd.env(SHIM_ENV, SHIM_FD.to_string());

    let shim_raw = pipe_rx.as_raw_fd();
    // SAFETY: only dup2/fcntl on descriptors owned by the parent
    unsafe {
        cmd.pre_exec(move || {
            if shim_raw == SHIM_FD {
                let flags = libc::fcntl(shim_raw, libc::F_GETFD);
                if flags < 0
                    || libc::fcntl(shim_raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(shim_raw, SHIM_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("cannot spawn shim: {e}"))))?;
    drop(pipe_rx);

    let mut writer = std::fs::File::from(pipe_tx);
    if let Err(e) = proto::write_frame(&mut writer, state) {
        warn!(error = %e, "cannot serialise state to shim");
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }

    debug!(pid = child.id(), "waiting for shim");
    let status = child.wait()?;
    // keep the pipe open until after the shim exits
    drop(writer);

    let code = status.code().unwrap_or(EXIT_CANCEL);
    if code == EXIT_FAILURE {
        debug!("shim reported setup failure");
    }
    Ok(code)
}

/// Asks a running shim for a clean exit over its state pipe.
pub fn request_shim_exit(writer: &std::fs::File) -> io::Result<()> {
    nix::unistd::write(writer.as_fd(), &[crate::shim::REQUEST_EXIT_BYTE])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_failure_is_framed() {
        // point the broker at something that cannot possibly succeed
        std::env::set_var(HSU_ENV, "/nonexistent/hakurei/hsu");
        let err = broker_user_id().expect_err("broker should fail");
        std::env::remove_var(HSU_ENV);

        match err {
            Error::Config(e) => {
                assert_eq!(e.step, "obtain user id from privilege broker");
                assert_eq!(e.kind, ConfigErrorKind::Invalid);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
