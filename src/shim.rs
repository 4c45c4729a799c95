//! The shim process.
//!
//! Spawned by the privileged side with the serialised outcome state on a
//! pipe. Replays the outcome ops into container params, drives the
//! container through start, serve and wait, and watches the state pipe to
//! detect orphaning and privileged-side exit requests.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::container::{
    Container, CANCEL_SIGNAL, EXIT_CANCEL, EXIT_FAILURE, EXIT_ORPHAN, EXIT_REQUEST,
};
use crate::error::Error;
use crate::outcome::{self, OutcomeState};
use crate::proto;

/// Environment variable carrying the state pipe descriptor number.
pub const SHIM_ENV: &str = "HAKUREI_SHIM";

/// Byte sent by the privileged side to request a clean shim exit.
pub const REQUEST_EXIT_BYTE: u8 = 0xf0;

/// Whether the current process was invoked as the shim.
#[must_use]
pub fn is_shim() -> bool {
    std::env::var_os(SHIM_ENV).is_some()
}

/// Shim entry point; never returns.
pub fn run() -> ! {
    let code = match shim_main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cannot set up container: {e}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code)
}

fn shim_main() -> Result<i32, Error> {
    let fd: i32 = std::env::var(SHIM_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Io(io::Error::from_raw_os_error(libc::EBADF)))?;

    // SAFETY: the descriptor number comes from the parent's fd layout
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let state: OutcomeState = proto::read_frame(&mut pipe)?;

    init_logging(state.shim.verbose);
    debug!(id = %state.id, "shim received outcome state");

    let params = outcome::to_container(&state)?;
    let mut container = Container::new(params, state.shim.verbose);
    container.start()?;
    container.serve()?;

    let flag = Arc::new(AtomicI32::new(0));
    if let Some(pid) = container.pid() {
        spawn_monitor(pipe, pid, Arc::clone(&flag));
    }

    let status = container.wait()?;

    match flag.load(Ordering::SeqCst) {
        EXIT_ORPHAN => Ok(EXIT_ORPHAN),
        EXIT_REQUEST => Ok(EXIT_REQUEST),
        _ => Ok(status.code().unwrap_or(EXIT_CANCEL)),
    }
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

/// Watches the state pipe held open by the privileged side.
///
/// A request byte asks for a clean exit; hangup without one means the
/// privileged side died and the shim is orphaned. Either way the container
/// receives the cancellation signal and `wait` resumes on the main thread.
fn spawn_monitor(pipe: File, init_pid: u32, flag: Arc<AtomicI32>) {
    let _ = std::thread::Builder::new()
        .name(String::from("priv-monitor"))
        .spawn(move || {
            let outcome = monitor_pipe(&pipe);
            flag.store(outcome, Ordering::SeqCst);
            debug!(outcome, "privileged side gone, cancelling container");
            let _ = kill(Pid::from_raw(init_pid as i32), CANCEL_SIGNAL);
        });
}

fn monitor_pipe(pipe: &File) -> i32 {
    loop {
        let mut fds = [PollFd::new(pipe.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "cannot poll state pipe");
                return EXIT_ORPHAN;
            }
        }

        let mut byte = [0u8; 1];
        match nix::unistd::read(pipe.as_raw_fd(), &mut byte) {
            Ok(0) => return EXIT_ORPHAN,
            Ok(_) if byte[0] == REQUEST_EXIT_BYTE => return EXIT_REQUEST,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return EXIT_ORPHAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_detects_request_byte() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let pipe = File::from(rx);
        nix::unistd::write(tx.as_fd(), &[REQUEST_EXIT_BYTE]).unwrap();
        assert_eq!(monitor_pipe(&pipe), EXIT_REQUEST);
    }

    #[test]
    fn test_monitor_detects_orphan_on_hangup() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let pipe = File::from(rx);
        drop(tx);
        assert_eq!(monitor_pipe(&pipe), EXIT_ORPHAN);
    }

    #[test]
    fn test_is_shim_reflects_env() {
        assert!(!is_shim());
    }
}
