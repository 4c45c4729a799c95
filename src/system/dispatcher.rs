//! Host mutation boundary for the transaction engine.
//!
//! Every side effect an op performs goes through [`Syscalls`], so the engine
//! can be exercised against a recording stub and so the ACL, X11 and wayland
//! surfaces stay behind one seam. The production implementation backs the
//! ACL calls with posix-acl, the X11 host list with x11rb and the wayland
//! security-context attach with wayland-client.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use posix_acl::{PosixACL, Qualifier, ACL_EXECUTE, ACL_READ, ACL_WRITE};
use tracing::debug;

/// ACL permission bits applied for the target user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AclPerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AclPerms {
    pub const EXECUTE: AclPerms = AclPerms {
        read: false,
        write: false,
        execute: true,
    };

    #[must_use]
    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    fn to_acl_bits(self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= ACL_READ;
        }
        if self.write {
            bits |= ACL_WRITE;
        }
        if self.execute {
            bits |= ACL_EXECUTE;
        }
        bits
    }

    fn from_acl_bits(bits: u32) -> Self {
        Self {
            read: bits & ACL_READ != 0,
            write: bits & ACL_WRITE != 0,
            execute: bits & ACL_EXECUTE != 0,
        }
    }
}

/// Direction of an X11 host list update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    Insert,
    Delete,
}

/// Handle keeping a wayland security context alive.
///
/// Dropping the handle closes the close-fd, telling the compositor to stop
/// accepting connections on the attached socket.
#[derive(Debug)]
pub struct WaylandAttachment {
    _close_fd: OwnedFd,
}

/// Syscall and shim dispatcher used by all ops.
///
/// The `uid` argument of the ACL calls is the engine's target user.
pub trait Syscalls: std::fmt::Debug {
    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn stat(&self, path: &Path) -> io::Result<()>;
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn copy_file(&self, dst: &Path, src: &Path, mode: u32) -> io::Result<()>;

    /// Reads the current ACL entry for `uid`, `None` if absent.
    fn acl_read(&self, path: &Path, uid: u32) -> io::Result<Option<AclPerms>>;
    /// Sets or (with `None`) removes the ACL entry for `uid`.
    fn acl_update(&self, path: &Path, uid: u32, perms: Option<AclPerms>) -> io::Result<()>;

    /// Inserts or deletes a server-interpreted entry in the X server host list.
    fn xcb_change_hosts(&self, mode: HostMode, entry: &str) -> io::Result<()>;

    /// Attaches a new listening socket at `dst` to the compositor at `src`
    /// through security-context-v1.
    fn wayland_attach(
        &self,
        dst: &Path,
        src: &Path,
        app_id: &str,
        instance_id: &str,
    ) -> io::Result<WaylandAttachment>;

    /// Spawns the external D-Bus proxy program, returning its pid.
    fn spawn_dbus_proxy(&self, args: &[String]) -> io::Result<u32>;
    /// Terminates and reaps a previously spawned proxy.
    fn stop_dbus_proxy(&self, pid: u32) -> io::Result<()>;
}

/// Production dispatcher operating on the live host.
#[derive(Debug, Default)]
pub struct HostSyscalls;

impl Syscalls for HostSyscalls {
    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::create_dir(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn stat(&self, path: &Path) -> io::Result<()> {
        fs::metadata(path).map(|_| ())
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn copy_file(&self, dst: &Path, src: &Path, mode: u32) -> io::Result<()> {
        fs::copy(src, dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))
    }

    fn acl_read(&self, path: &Path, uid: u32) -> io::Result<Option<AclPerms>> {
        let acl = PosixACL::read_acl(path).map_err(io::Error::other)?;
        Ok(acl
            .get(Qualifier::User(uid))
            .map(AclPerms::from_acl_bits))
    }

    fn acl_update(&self, path: &Path, uid: u32, perms: Option<AclPerms>) -> io::Result<()> {
        let mut acl = PosixACL::read_acl(path).map_err(io::Error::other)?;
        match perms {
            Some(perms) => acl.set(Qualifier::User(uid), perms.to_acl_bits()),
            None => {
                acl.remove(Qualifier::User(uid));
            }
        }
        acl.write_acl(path).map_err(io::Error::other)
    }

    fn xcb_change_hosts(&self, mode: HostMode, entry: &str) -> io::Result<()> {
        xcb::change_hosts(mode, entry)
    }

    fn wayland_attach(
        &self,
        dst: &Path,
        src: &Path,
        app_id: &str,
        instance_id: &str,
    ) -> io::Result<WaylandAttachment> {
        wayland::attach(dst, src, app_id, instance_id)
    }

    fn spawn_dbus_proxy(&self, args: &[String]) -> io::Result<u32> {
        let child = std::process::Command::new("xdg-dbus-proxy")
            .args(args)
            .spawn()?;
        let pid = child.id();
        debug!(pid, "spawned message bus proxy");
        // reaped through stop_dbus_proxy
        std::mem::forget(child);
        Ok(pid)
    }

    fn stop_dbus_proxy(&self, pid: u32) -> io::Result<()> {
        let pid = Pid::from_raw(pid as i32);
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            if errno == nix::errno::Errno::ESRCH {
                return Ok(());
            }
            return Err(errno.into());
        }
        match waitpid(pid, None) {
            Ok(_) | Err(nix::errno::Errno::ECHILD) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

mod xcb {
    //! X server host list updates over x11rb.

    use std::io;

    use x11rb::connection::Connection;
    use x11rb::protocol::xproto::{self, Family, HostMode as XHostMode};

    use super::HostMode;

    pub(super) fn change_hosts(mode: HostMode, entry: &str) -> io::Result<()> {
        let (conn, _screen) = x11rb::connect(None).map_err(io::Error::other)?;
        let x_mode = match mode {
            HostMode::Insert => XHostMode::INSERT,
            HostMode::Delete => XHostMode::DELETE,
        };
        xproto::change_hosts(&conn, x_mode, Family::SERVER_INTERPRETED, entry.as_bytes())
            .map_err(io::Error::other)?
            .check()
            .map_err(io::Error::other)?;
        conn.flush().map_err(io::Error::other)
    }
}

mod wayland {
    //! security-context-v1 attachment over wayland-client.
    //!
    //! Binds the compositor's security context manager, hands it a fresh
    //! listening socket for the container and a close-fd whose closure
    //! revokes the context.

    use std::io;
    use std::os::fd::AsFd;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::Path;

    use wayland_client::globals::{registry_queue_init, GlobalListContents};
    use wayland_client::protocol::wl_registry::WlRegistry;
    use wayland_client::{Connection, Dispatch, QueueHandle};
    use wayland_protocols::wp::security_context::v1::client::wp_security_context_manager_v1::WpSecurityContextManagerV1;
    use wayland_protocols::wp::security_context::v1::client::wp_security_context_v1::WpSecurityContextV1;

    use super::WaylandAttachment;

    /// Sandbox engine name reported through security-context-v1.
    const SANDBOX_ENGINE: &str = "app.hakurei";

    struct AttachState;

    impl Dispatch<WlRegistry, GlobalListContents> for AttachState {
        fn event(
            _: &mut Self,
            _: &WlRegistry,
            _: <WlRegistry as wayland_client::Proxy>::Event,
            _: &GlobalListContents,
            _: &Connection,
            _: &QueueHandle<Self>,
        ) {
        }
    }

    wayland_client::delegate_noop!(AttachState: ignore WpSecurityContextManagerV1);
    wayland_client::delegate_noop!(AttachState: ignore WpSecurityContextV1);

    pub(super) fn attach(
        dst: &Path,
        src: &Path,
        app_id: &str,
        instance_id: &str,
    ) -> io::Result<WaylandAttachment> {
        let stream = UnixStream::connect(src)?;
        let conn = Connection::from_socket(stream).map_err(io::Error::other)?;

        let (globals, mut queue) =
            registry_queue_init::<AttachState>(&conn).map_err(io::Error::other)?;
        let qh = queue.handle();

        let manager: WpSecurityContextManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .map_err(io::Error::other)?;

        let listener = UnixListener::bind(dst)?;
        let (close_rx, close_tx) = nix::unistd::pipe()?;

        let context =
            manager.create_listener(listener.as_fd(), close_rx.as_fd(), &qh, ());
        context.set_sandbox_engine(SANDBOX_ENGINE.to_owned());
        context.set_app_id(app_id.to_owned());
        context.set_instance_id(instance_id.to_owned());
        context.commit();

        let mut state = AttachState;
        queue.roundtrip(&mut state).map_err(io::Error::other)?;

        // the compositor holds its own duplicates of the listening socket
        // and the read side; only the write side keeps the context alive
        Ok(WaylandAttachment { _close_fd: close_tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_perms_bits_round_trip() {
        for perms in [
            AclPerms::new(true, false, true),
            AclPerms::new(false, false, false),
            AclPerms::EXECUTE,
        ] {
            assert_eq!(AclPerms::from_acl_bits(perms.to_acl_bits()), perms);
        }
    }

    #[test]
    fn test_host_mkdir_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub");
        let k = HostSyscalls;
        k.mkdir(&target, 0o711).unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);
        k.remove(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_host_copy_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("cookie");
        let dst = dir.path().join("cookie.copy");
        std::fs::write(&src, b"secret").unwrap();
        let k = HostSyscalls;
        k.copy_file(&dst, &src, 0o600).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"secret");
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
