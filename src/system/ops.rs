//! Reversible host mutations registered on the transaction engine.
//!
//! Ops are a closed set of variants; rollback state (created directories,
//! prior ACL entries, proxy pids) lives inside the op instance so revert is
//! safe to call after a partial apply. Structural equality deliberately
//! ignores that state.

use std::fmt;
use std::io;

use tracing::{debug, trace};

use crate::config::EnablementSet;
use crate::error::OpError;
use crate::path::Absolute;
use crate::system::cgroup::CgroupOp;
use crate::system::dispatcher::{AclPerms, HostMode, Syscalls, WaylandAttachment};
use crate::system::{tag_string, PROCESS};

/// A single reversible host mutation.
#[derive(Debug)]
pub(crate) enum Op {
    Mkdir(MkdirOp),
    Xhost(XhostOp),
    Perm(PermOp),
    CopyFile(CopyFileOp),
    Wayland(WaylandOp),
    DbusProxy(DbusProxyOp),
    Cgroup(CgroupOp),
}

impl Op {
    pub(crate) fn apply(&mut self, k: &dyn Syscalls, uid: u32) -> Result<(), OpError> {
        match self {
            Op::Mkdir(op) => op.apply(k),
            Op::Xhost(op) => op.apply(k),
            Op::Perm(op) => op.apply(k, uid),
            Op::CopyFile(op) => op.apply(k),
            Op::Wayland(op) => op.apply(k),
            Op::DbusProxy(op) => op.apply(k),
            Op::Cgroup(op) => op.apply(k),
        }
    }

    pub(crate) fn revert(&mut self, k: &dyn Syscalls, uid: u32) -> Result<(), OpError> {
        match self {
            Op::Mkdir(op) => op.revert(k),
            Op::Xhost(op) => op.revert(k),
            Op::Perm(op) => op.revert(k, uid),
            Op::CopyFile(op) => op.revert(k),
            Op::Wayland(op) => op.revert(k),
            Op::DbusProxy(op) => op.revert(k),
            Op::Cgroup(op) => op.revert(k),
        }
    }

    /// The classification tag consumed by the revert filter.
    pub(crate) fn tag(&self) -> EnablementSet {
        match self {
            Op::Mkdir(op) => op.tag,
            Op::Xhost(_) => EnablementSet::X11,
            Op::Perm(op) => op.tag,
            Op::CopyFile(_) => PROCESS,
            Op::Wayland(_) => EnablementSet::WAYLAND,
            Op::DbusProxy(_) => EnablementSet::DBUS,
            Op::Cgroup(_) => PROCESS,
        }
    }

    /// Structural equality over configuration, ignoring rollback state.
    pub(crate) fn is(&self, other: &Op) -> bool {
        match (self, other) {
            (Op::Mkdir(a), Op::Mkdir(b)) => {
                a.tag == b.tag && a.path == b.path && a.mode == b.mode && a.ephemeral == b.ephemeral
            }
            (Op::Xhost(a), Op::Xhost(b)) => a.username == b.username,
            (Op::Perm(a), Op::Perm(b)) => a.tag == b.tag && a.path == b.path && a.perms == b.perms,
            (Op::CopyFile(a), Op::CopyFile(b)) => a.dst == b.dst && a.src == b.src,
            (Op::Wayland(a), Op::Wayland(b)) => {
                a.dst == b.dst && a.src == b.src && a.app_id == b.app_id
            }
            (Op::DbusProxy(a), Op::DbusProxy(b)) => a.args == b.args,
            (Op::Cgroup(a), Op::Cgroup(b)) => a.is(b),
            _ => false,
        }
    }

    /// The primary pathname this op acts on, for diagnostics.
    pub(crate) fn path(&self) -> &str {
        match self {
            Op::Mkdir(op) => op.path.as_str(),
            Op::Xhost(_) => "",
            Op::Perm(op) => op.path.as_str(),
            Op::CopyFile(op) => op.dst.as_str(),
            Op::Wayland(op) => op.dst.as_str(),
            Op::DbusProxy(_) => "",
            Op::Cgroup(op) => op.path(),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Mkdir(op) => write!(
                f,
                "mode: {:o} type: {} path: {:?} {}",
                op.mode,
                tag_string(op.tag),
                op.path.as_str(),
                if op.ephemeral { "ephemeral" } else { "ensure" }
            ),
            Op::Xhost(op) => write!(f, "X11 entry for {:?}", op.username),
            Op::Perm(op) => write!(
                f,
                "perm type: {} path: {:?}",
                tag_string(op.tag),
                op.path.as_str()
            ),
            Op::CopyFile(op) => {
                write!(f, "copy {:?} to {:?}", op.src.as_str(), op.dst.as_str())
            }
            Op::Wayland(op) => write!(
                f,
                "wayland attachment {:?} of {:?}",
                op.dst.as_str(),
                op.src.as_str()
            ),
            Op::DbusProxy(op) => write!(f, "message bus proxy with {} args", op.args.len()),
            Op::Cgroup(op) => op.fmt(f),
        }
    }
}

/// Directory creation, durable (`ensure`) or removed on revert (`ephemeral`).
#[derive(Debug)]
pub(crate) struct MkdirOp {
    pub(crate) tag: EnablementSet,
    pub(crate) path: Absolute,
    pub(crate) mode: u32,
    pub(crate) ephemeral: bool,
    created: bool,
}

impl MkdirOp {
    pub(crate) fn new(tag: EnablementSet, path: Absolute, mode: u32, ephemeral: bool) -> Self {
        Self {
            tag,
            path,
            mode,
            ephemeral,
            created: false,
        }
    }

    fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(path = self.path.as_str(), mode = %format_args!("{:o}", self.mode), "ensuring directory");
        match k.mkdir(self.path.as_path(), self.mode) {
            Ok(()) => {
                self.created = true;
                Ok(())
            }
            // already applied by an earlier invocation or sibling instance
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(OpError::new("mkdir", e)),
        }
    }

    fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        if !self.ephemeral && !self.created {
            trace!(path = self.path.as_str(), "skipping revert for pre-existing directory");
            return Ok(());
        }
        debug!(path = self.path.as_str(), "destroying ephemeral directory");
        match k.remove(self.path.as_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpError::reverting("mkdir", e)),
        }
    }
}

/// Server-interpreted `localuser` entry in the X server host list.
#[derive(Debug)]
pub(crate) struct XhostOp {
    pub(crate) username: String,
}

impl XhostOp {
    fn entry(&self) -> String {
        format!("localuser\0{}", self.username)
    }

    fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(user = self.username, "inserting entry to X11");
        k.xcb_change_hosts(HostMode::Insert, &self.entry())
            .map_err(|e| OpError::new("xhost", e))
    }

    fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(user = self.username, "deleting entry from X11");
        k.xcb_change_hosts(HostMode::Delete, &self.entry())
            .map_err(|e| OpError::reverting("xhost", e))
    }
}

/// ACL update recording the pre-existing entry for restore on revert.
#[derive(Debug)]
pub(crate) struct PermOp {
    pub(crate) tag: EnablementSet,
    pub(crate) path: Absolute,
    pub(crate) perms: AclPerms,
    prev: Option<Option<AclPerms>>,
}

impl PermOp {
    pub(crate) fn new(tag: EnablementSet, path: Absolute, perms: AclPerms) -> Self {
        Self {
            tag,
            path,
            perms,
            prev: None,
        }
    }

    fn apply(&mut self, k: &dyn Syscalls, uid: u32) -> Result<(), OpError> {
        debug!(path = self.path.as_str(), uid, "updating ACL entry");
        let prev = k
            .acl_read(self.path.as_path(), uid)
            .map_err(|e| OpError::new("acl", e))?;
        self.prev = Some(prev);
        k.acl_update(self.path.as_path(), uid, Some(self.perms))
            .map_err(|e| OpError::new("acl", e))
    }

    fn revert(&mut self, k: &dyn Syscalls, uid: u32) -> Result<(), OpError> {
        let Some(prev) = self.prev else {
            // apply never recorded state, nothing to restore
            return Ok(());
        };
        debug!(path = self.path.as_str(), uid, "restoring ACL entry");
        match k.acl_update(self.path.as_path(), uid, prev) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpError::reverting("acl", e)),
        }
    }
}

/// Copies a file into process-scoped storage; used for the PulseAudio cookie.
#[derive(Debug)]
pub(crate) struct CopyFileOp {
    pub(crate) dst: Absolute,
    pub(crate) src: Absolute,
    pub(crate) mode: u32,
    written: bool,
}

impl CopyFileOp {
    pub(crate) fn new(dst: Absolute, src: Absolute, mode: u32) -> Self {
        Self {
            dst,
            src,
            mode,
            written: false,
        }
    }

    fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(src = self.src.as_str(), dst = self.dst.as_str(), "copying file");
        k.copy_file(self.dst.as_path(), self.src.as_path(), self.mode)
            .map_err(|e| OpError::new("copy", e))?;
        self.written = true;
        Ok(())
    }

    fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        if !self.written {
            return Ok(());
        }
        match k.remove_file(self.dst.as_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpError::reverting("copy", e)),
        }
    }
}

/// security-context-v1 attachment producing an instance wayland socket.
#[derive(Debug)]
pub(crate) struct WaylandOp {
    pub(crate) dst: Absolute,
    pub(crate) src: Absolute,
    pub(crate) app_id: String,
    pub(crate) instance_id: String,
    attachment: Option<WaylandAttachment>,
}

impl WaylandOp {
    pub(crate) fn new(dst: Absolute, src: Absolute, app_id: String, instance_id: String) -> Self {
        Self {
            dst,
            src,
            app_id,
            instance_id,
            attachment: None,
        }
    }

    fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(dst = self.dst.as_str(), app_id = self.app_id, "attaching wayland security context");
        let attachment = k
            .wayland_attach(
                self.dst.as_path(),
                self.src.as_path(),
                &self.app_id,
                &self.instance_id,
            )
            .map_err(|e| OpError::new("wayland", e))?;
        self.attachment = Some(attachment);
        Ok(())
    }

    fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        // closing the attachment fd revokes the context
        self.attachment = None;
        match k.remove_file(self.dst.as_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpError::reverting("wayland", e)),
        }
    }
}

/// Interface-filtered message bus proxy running for the container lifetime.
#[derive(Debug)]
pub(crate) struct DbusProxyOp {
    pub(crate) args: Vec<String>,
    pid: Option<u32>,
}

impl DbusProxyOp {
    pub(crate) fn new(args: Vec<String>) -> Self {
        Self { args, pid: None }
    }

    fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!("starting message bus proxy");
        let pid = k
            .spawn_dbus_proxy(&self.args)
            .map_err(|e| OpError::new("dbus", e))?;
        self.pid = Some(pid);
        Ok(())
    }

    fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        debug!(pid, "terminating message bus proxy");
        k.stop_dbus_proxy(pid)
            .map_err(|e| OpError::reverting("dbus", e))
    }
}
