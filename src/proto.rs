//! Cross-process state framing.
//!
//! Outcome state and container params cross process boundaries over pipes
//! as explicit, versioned frames: one version byte, a little-endian u32
//! length, then a JSON body. Op lists inside the body are closed serde
//! enums, so the receiving side never resolves types dynamically.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtoError;

/// Current frame version.
pub const PROTO_VERSION: u8 = 1;

/// Sanity bound on the frame body length.
const MAX_FRAME: u32 = 1 << 24;

/// Serialises `value` as one frame into `w`.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<(), ProtoError> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| ProtoError::Length(u32::MAX))?;
    if len > MAX_FRAME {
        return Err(ProtoError::Length(len));
    }
    w.write_all(&[PROTO_VERSION])?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame from `r` and deserialises it.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, ProtoError> {
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != PROTO_VERSION {
        return Err(ProtoError::Version(version[0]));
    }

    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(ProtoError::Length(len));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serialises `value` as one frame onto `fd`, failing once `deadline` has
/// elapsed regardless of how much has been written.
pub fn write_frame_deadline<T: Serialize>(
    fd: BorrowedFd<'_>,
    value: &T,
    deadline: Duration,
) -> Result<(), ProtoError> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| ProtoError::Length(u32::MAX))?;
    if len > MAX_FRAME {
        return Err(ProtoError::Length(len));
    }

    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(PROTO_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);

    set_nonblocking(fd)?;

    let start = Instant::now();
    let mut written = 0;
    while written < frame.len() {
        let remaining = deadline
            .checked_sub(start.elapsed())
            .ok_or_else(|| ProtoError::Pipe(std::io::ErrorKind::TimedOut.into()))?;

        let timeout = PollTimeout::from(remaining.as_millis().min(u128::from(u16::MAX)) as u16);
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        let ready = poll(&mut fds, timeout).map_err(std::io::Error::from)?;
        if ready == 0 {
            return Err(ProtoError::Pipe(std::io::ErrorKind::TimedOut.into()));
        }

        match nix::unistd::write(fd, &frame[written..]) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(ProtoError::Pipe(e.into())),
        }
    }
    Ok(())
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), ProtoError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}
