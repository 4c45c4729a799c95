//! Transactional host mutation engine.
//!
//! The privileged side of a launch funnels every shared host side effect
//! (directory creation, ACL updates, X11 host entries, cgroup subtrees,
//! ephemeral socket proxying) through one ordered transaction. A commit that
//! fails part-way rolls back everything it already applied; a successful
//! commit is reverted after the container exits, filtered by the op
//! classification tags.
//!
//! None of the engine methods are safe for concurrent use.

mod cgroup;
mod dispatcher;
mod ops;
mod requirements;

pub use cgroup::CgroupLimits;
pub use dispatcher::{AclPerms, HostMode, HostSyscalls, Syscalls, WaylandAttachment};
pub use requirements::{
    check_all, check_cgroups_v2, check_kernel_version, check_landlock_abi, check_user_namespaces,
    SystemRequirements, MIN_KERNEL_VERSION, MIN_LANDLOCK_ABI,
};

use tracing::{debug, trace, warn};

use crate::config::EnablementSet;
use crate::error::{OpError, RevertError};
use crate::path::Absolute;

use self::cgroup::CgroupOp;
use self::ops::{CopyFileOp, DbusProxyOp, MkdirOp, Op, PermOp, WaylandOp, XhostOp};

/// Classification bit for host per-user state, shared between instances.
pub const USER: EnablementSet = EnablementSet(1 << 4);
/// Classification bit for per-invocation state.
pub const PROCESS: EnablementSet = EnablementSet(1 << 5);

/// Human-readable form of an op classification tag.
#[must_use]
pub fn tag_string(tag: EnablementSet) -> String {
    const NAMES: [(EnablementSet, &str); 6] = [
        (EnablementSet::WAYLAND, "wayland"),
        (EnablementSet::X11, "x11"),
        (EnablementSet::DBUS, "dbus"),
        (EnablementSet::PULSE, "pulseaudio"),
        (USER, "user"),
        (PROCESS, "process"),
    ];
    let mut parts = Vec::new();
    for (bit, name) in NAMES {
        if tag.contains(bit) {
            parts.push(name);
        }
    }
    if parts.is_empty() {
        return String::from("none");
    }
    parts.join(", ")
}

/// Revert filter over op classification tags.
///
/// The default criteria (`Criteria(None)`) matches every tag except [`USER`]:
/// per-user host state is shared across instances of an identity and is only
/// torn down when explicitly requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct Criteria(pub Option<EnablementSet>);

impl Criteria {
    /// Whether ops with `tag` should be reverted under this criteria.
    #[must_use]
    pub fn matches(self, tag: EnablementSet) -> bool {
        match self.0 {
            None => tag != USER,
            Some(mask) => mask.intersects(tag),
        }
    }
}

/// The ordered host mutation transaction.
pub struct System {
    uid: i32,
    ops: Vec<Op>,
    committed: bool,
    reverted: bool,
    k: Box<dyn Syscalls>,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("uid", &self.uid)
            .field("ops", &self.ops.len())
            .field("committed", &self.committed)
            .field("reverted", &self.reverted)
            .finish()
    }
}

impl System {
    /// Creates an empty transaction acting as `uid` for ACL updates.
    ///
    /// # Panics
    ///
    /// Panics if `uid` is negative.
    #[must_use]
    pub fn new(uid: i32) -> Self {
        Self::with_dispatcher(uid, Box::new(HostSyscalls))
    }

    /// Creates a transaction with an explicit dispatcher; used by tests.
    ///
    /// # Panics
    ///
    /// Panics if `uid` is negative.
    #[must_use]
    pub fn with_dispatcher(uid: i32, k: Box<dyn Syscalls>) -> Self {
        assert!(uid >= 0, "invalid call to System::new");
        Self {
            uid,
            ops: Vec::new(),
            committed: false,
            reverted: false,
            k,
        }
    }

    /// The uid ACL updates act on.
    #[must_use]
    pub fn uid(&self) -> i32 {
        self.uid
    }

    /// Structural equality over uid and registered ops.
    #[must_use]
    pub fn equal(&self, other: &System) -> bool {
        self.uid == other.uid
            && self.ops.len() == other.ops.len()
            && self.ops.iter().zip(&other.ops).all(|(a, b)| a.is(b))
    }

    /// Registers a directory removed on revert.
    pub fn ephemeral(&mut self, tag: EnablementSet, path: Absolute, mode: u32) -> &mut Self {
        self.ops.push(Op::Mkdir(MkdirOp::new(tag, path, mode, true)));
        self
    }

    /// Registers a durable directory, removed on revert only if this commit
    /// created it and the [`USER`] tag is selected.
    pub fn ensure(&mut self, path: Absolute, mode: u32) -> &mut Self {
        self.ops.push(Op::Mkdir(MkdirOp::new(USER, path, mode, false)));
        self
    }

    /// Registers an X server host list entry for `username`.
    pub fn change_hosts(&mut self, username: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Xhost(XhostOp {
            username: username.into(),
        }));
        self
    }

    /// Registers a process-scoped ACL update on `path`.
    pub fn update_perm(&mut self, path: Absolute, perms: AclPerms) -> &mut Self {
        self.update_perm_type(PROCESS, path, perms)
    }

    /// Registers an ACL update with an explicit classification tag.
    pub fn update_perm_type(
        &mut self,
        tag: EnablementSet,
        path: Absolute,
        perms: AclPerms,
    ) -> &mut Self {
        self.ops.push(Op::Perm(PermOp::new(tag, path, perms)));
        self
    }

    /// Registers a process-scoped file copy (PulseAudio cookie).
    pub fn copy_file(&mut self, dst: Absolute, src: Absolute) -> &mut Self {
        self.ops.push(Op::CopyFile(CopyFileOp::new(dst, src, 0o600)));
        self
    }

    /// Registers a wayland security-context attachment at `dst`.
    pub fn wayland(
        &mut self,
        dst: Absolute,
        src: Absolute,
        app_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(Op::Wayland(WaylandOp::new(
            dst,
            src,
            app_id.into(),
            instance_id.into(),
        )));
        self
    }

    /// Registers a message bus proxy launch with the given proxy arguments.
    pub fn dbus_proxy(&mut self, args: Vec<String>) -> &mut Self {
        self.ops.push(Op::DbusProxy(DbusProxyOp::new(args)));
        self
    }

    /// Registers a process-scoped cgroup subtree rooted at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `target` is empty relative to `base` semantics; callers
    /// construct both from validated configuration.
    pub fn cgroup(&mut self, base: Absolute, target: Absolute, limits: CgroupLimits) -> &mut Self {
        self.ops.push(Op::Cgroup(CgroupOp::new(base, target, limits)));
        self
    }

    /// Applies all registered ops in insertion order.
    ///
    /// On the first op failure, every previously applied op is reverted in
    /// reverse order; rollback errors are logged, never masking the original
    /// failure. The transaction is considered committed either way, so a
    /// retry is a programming error.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn commit(&mut self) -> Result<(), OpError> {
        assert!(!self.committed, "attempting to commit twice");
        self.committed = true;

        let mut ops = std::mem::take(&mut self.ops);
        let uid = self.uid as u32;
        let mut failure = None;

        for i in 0..ops.len() {
            trace!(op = %ops[i], "applying op");
            if let Err(e) = ops[i].apply(self.k.as_ref(), uid) {
                debug!(count = i, "commit faulted, rolling back partial commit");
                for j in (0..i).rev() {
                    if let Err(re) = ops[j].revert(self.k.as_ref(), uid) {
                        warn!("cannot revert {}: {}", re.op, re.source);
                    }
                }
                failure = Some(e);
                break;
            }
        }

        self.ops = ops;
        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Reverts committed ops in reverse order.
    ///
    /// Ops whose tag does not match `criteria` are skipped. Errors are
    /// accumulated and joined; a revert failure never stops the remaining
    /// ops from being attempted.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn revert(&mut self, criteria: Criteria) -> Result<(), RevertError> {
        assert!(!self.reverted, "attempting to revert twice");
        self.reverted = true;

        let mut ops = std::mem::take(&mut self.ops);
        let uid = self.uid as u32;
        let mut errs = Vec::new();

        for op in ops.iter_mut().rev() {
            if !criteria.matches(op.tag()) {
                trace!(op = %op, path = op.path(), "skipping revert");
                continue;
            }
            if let Err(e) = op.revert(self.k.as_ref(), uid) {
                errs.push(e);
            }
        }

        self.ops = ops;
        if errs.is_empty() {
            Ok(())
        } else {
            Err(RevertError(errs))
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Recording dispatcher with per-call failure injection.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;

    use super::dispatcher::{AclPerms, HostMode, Syscalls, WaylandAttachment};

    /// Records each dispatcher call as a display string and optionally fails
    /// calls by name.
    #[derive(Debug, Default)]
    pub(crate) struct StubSyscalls {
        pub(crate) calls: RefCell<Vec<String>>,
        pub(crate) failures: RefCell<HashMap<&'static str, io::Error>>,
    }

    impl StubSyscalls {
        pub(crate) fn fail(&self, name: &'static str, err: io::Error) {
            self.failures.borrow_mut().insert(name, err);
        }

        fn record(&self, name: &'static str, detail: String) -> io::Result<()> {
            self.calls.borrow_mut().push(detail);
            match self.failures.borrow_mut().remove(name) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    impl Syscalls for StubSyscalls {
        fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
            self.record("mkdir", format!("mkdir {} {:o}", path.display(), mode))
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.record("remove", format!("remove {}", path.display()))
        }

        fn stat(&self, path: &Path) -> io::Result<()> {
            self.record("stat", format!("stat {}", path.display()))
        }

        fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            self.record(
                "write_file",
                format!(
                    "write {} {}",
                    path.display(),
                    String::from_utf8_lossy(data)
                ),
            )
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.record("remove_file", format!("remove_file {}", path.display()))
        }

        fn copy_file(&self, dst: &Path, src: &Path, _mode: u32) -> io::Result<()> {
            self.record(
                "copy_file",
                format!("copy {} {}", src.display(), dst.display()),
            )
        }

        fn acl_read(&self, path: &Path, uid: u32) -> io::Result<Option<AclPerms>> {
            self.record("acl_read", format!("acl_read {} {}", path.display(), uid))?;
            Ok(None)
        }

        fn acl_update(&self, path: &Path, uid: u32, perms: Option<AclPerms>) -> io::Result<()> {
            self.record(
                "acl_update",
                format!("acl_update {} {} {:?}", path.display(), uid, perms),
            )
        }

        fn xcb_change_hosts(&self, mode: HostMode, entry: &str) -> io::Result<()> {
            self.record("xcb", format!("xcb {mode:?} {entry:?}"))
        }

        fn wayland_attach(
            &self,
            dst: &Path,
            _src: &Path,
            _app_id: &str,
            _instance_id: &str,
        ) -> io::Result<WaylandAttachment> {
            self.record("wayland", format!("wayland {}", dst.display()))?;
            Err(io::Error::other("stub has no compositor"))
        }

        fn spawn_dbus_proxy(&self, args: &[String]) -> io::Result<u32> {
            self.record("dbus_spawn", format!("dbus_spawn {}", args.len()))?;
            Ok(1)
        }

        fn stop_dbus_proxy(&self, pid: u32) -> io::Result<()> {
            self.record("dbus_stop", format!("dbus_stop {pid}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::rc::Rc;

    use super::stub::StubSyscalls;
    use super::*;

    fn abs(path: &str) -> Absolute {
        Absolute::new(path).unwrap()
    }

    const SHARE: &str = "/tmp/hakurei.0/f2f3bcd492d0266438fa9bf164fe90d9";

    // stub wrapper sharing call state with the test body
    #[derive(Debug)]
    struct SharedStub(Rc<StubSyscalls>);

    impl Syscalls for SharedStub {
        fn mkdir(&self, path: &std::path::Path, mode: u32) -> io::Result<()> {
            self.0.mkdir(path, mode)
        }
        fn remove(&self, path: &std::path::Path) -> io::Result<()> {
            self.0.remove(path)
        }
        fn stat(&self, path: &std::path::Path) -> io::Result<()> {
            self.0.stat(path)
        }
        fn write_file(&self, path: &std::path::Path, data: &[u8]) -> io::Result<()> {
            self.0.write_file(path, data)
        }
        fn remove_file(&self, path: &std::path::Path) -> io::Result<()> {
            self.0.remove_file(path)
        }
        fn copy_file(&self, dst: &std::path::Path, src: &std::path::Path, mode: u32) -> io::Result<()> {
            self.0.copy_file(dst, src, mode)
        }
        fn acl_read(&self, path: &std::path::Path, uid: u32) -> io::Result<Option<AclPerms>> {
            self.0.acl_read(path, uid)
        }
        fn acl_update(
            &self,
            path: &std::path::Path,
            uid: u32,
            perms: Option<AclPerms>,
        ) -> io::Result<()> {
            self.0.acl_update(path, uid, perms)
        }
        fn xcb_change_hosts(&self, mode: HostMode, entry: &str) -> io::Result<()> {
            self.0.xcb_change_hosts(mode, entry)
        }
        fn wayland_attach(
            &self,
            dst: &std::path::Path,
            src: &std::path::Path,
            app_id: &str,
            instance_id: &str,
        ) -> io::Result<WaylandAttachment> {
            self.0.wayland_attach(dst, src, app_id, instance_id)
        }
        fn spawn_dbus_proxy(&self, args: &[String]) -> io::Result<u32> {
            self.0.spawn_dbus_proxy(args)
        }
        fn stop_dbus_proxy(&self, pid: u32) -> io::Result<()> {
            self.0.stop_dbus_proxy(pid)
        }
    }

    fn stubbed(uid: i32) -> (System, Rc<StubSyscalls>) {
        let stub = Rc::new(StubSyscalls::default());
        let sys = System::with_dispatcher(uid, Box::new(SharedStub(Rc::clone(&stub))));
        (sys, stub)
    }

    #[test]
    fn test_criteria() {
        let nil = Criteria(None);
        assert!(nil.matches(EnablementSet::WAYLAND));
        assert!(nil.matches(PROCESS));
        assert!(!nil.matches(USER));

        let all = Criteria(Some(
            EnablementSet::WAYLAND
                | EnablementSet::X11
                | EnablementSet::DBUS
                | EnablementSet::PULSE
                | USER
                | PROCESS,
        ));
        assert!(all.matches(PROCESS));
        assert!(all.matches(USER));

        let user_only = Criteria(Some(USER));
        assert!(user_only.matches(USER));
        assert!(!user_only.matches(PROCESS));
    }

    #[test]
    fn test_tag_string() {
        assert_eq!(tag_string(EnablementSet::WAYLAND), "wayland");
        assert_eq!(tag_string(USER), "user");
        assert_eq!(tag_string(USER | PROCESS), "user, process");
        assert_eq!(
            tag_string(EnablementSet::WAYLAND | USER | PROCESS),
            "wayland, user, process"
        );
        assert_eq!(tag_string(EnablementSet::X11 | PROCESS), "x11, process");
        assert_eq!(tag_string(EnablementSet::default()), "none");
    }

    #[test]
    #[should_panic(expected = "invalid call to System::new")]
    fn test_new_panics_on_negative_uid() {
        let _ = System::new(-1);
    }

    #[test]
    fn test_uid_accessor() {
        let (sys, _) = stubbed(0xbeef);
        assert_eq!(sys.uid(), 0xbeef);
    }

    #[test]
    fn test_equal() {
        let (mut a, _) = stubbed(150);
        let (mut b, _) = stubbed(150);
        a.change_hosts("chronos").ensure(abs("/run"), 0o755);
        b.change_hosts("chronos").ensure(abs("/run"), 0o755);
        assert!(a.equal(&b));

        let (other_uid, _) = stubbed(151);
        assert!(!a.equal(&other_uid));

        let (mut longer, _) = stubbed(150);
        longer
            .change_hosts("chronos")
            .ensure(abs("/run"), 0o755)
            .ensure(abs("/tmp/x"), 0o755);
        assert!(!a.equal(&longer));

        let (mut mode_mismatch, _) = stubbed(150);
        mode_mismatch.change_hosts("chronos").ensure(abs("/run"), 0o644);
        assert!(!a.equal(&mode_mismatch));

        let (mut type_mismatch, _) = stubbed(150);
        type_mismatch
            .change_hosts("chronos")
            .ephemeral(PROCESS, abs("/run"), 0o755);
        assert!(!a.equal(&type_mismatch));
    }

    #[test]
    fn test_partial_commit_rollback() {
        let (mut sys, stub) = stubbed(0xbad);
        sys.ephemeral(PROCESS, abs(SHARE), 0o711).change_hosts("chronos");
        stub.fail("xcb", io::Error::other("unique error 2"));

        let err = sys.commit().expect_err("commit should fail on xhost");
        assert_eq!(err.op, "xhost");
        assert!(!err.revert);

        let calls = stub.calls.borrow();
        assert_eq!(
            *calls,
            vec![
                format!("mkdir {SHARE} 711"),
                String::from("xcb Insert \"localuser\\0chronos\""),
                format!("remove {SHARE}"),
            ]
        );
    }

    #[test]
    fn test_rollback_error_does_not_mask_commit_error() {
        let (mut sys, stub) = stubbed(0xbad);
        sys.ephemeral(PROCESS, abs(SHARE), 0o711).change_hosts("chronos");
        stub.fail("xcb", io::Error::other("unique error 2"));
        stub.fail("remove", io::Error::other("unique error 3"));

        let err = sys.commit().expect_err("commit should fail on xhost");
        assert_eq!(err.op, "xhost");
        assert_eq!(err.source.to_string(), "unique error 2");
    }

    #[test]
    fn test_revert_ordering_and_error_join() {
        let (mut sys, stub) = stubbed(0xbad);
        sys.ephemeral(PROCESS, abs(SHARE), 0o711).change_hosts("chronos");
        sys.commit().expect("commit should succeed");
        stub.calls.borrow_mut().clear();

        stub.fail("xcb", io::Error::other("unique error 1"));
        stub.fail("remove", io::Error::other("unique error 0"));

        let err = sys.revert(Criteria(None)).expect_err("revert should fail");
        assert_eq!(err.0.len(), 2);
        assert_eq!(err.0[0].op, "xhost");
        assert!(err.0[0].revert);
        assert_eq!(err.0[1].op, "mkdir");
        assert!(err.0[1].revert);

        // reverse commit order: xhost delete before directory removal
        let calls = stub.calls.borrow();
        assert_eq!(
            *calls,
            vec![
                String::from("xcb Delete \"localuser\\0chronos\""),
                format!("remove {SHARE}"),
            ]
        );
    }

    #[test]
    fn test_commit_revert_success() {
        let (mut sys, stub) = stubbed(0xbad);
        sys.ephemeral(PROCESS, abs(SHARE), 0o711).change_hosts("chronos");
        sys.commit().expect("commit should succeed");
        sys.revert(Criteria(None)).expect("revert should succeed");

        let calls = stub.calls.borrow();
        assert_eq!(
            *calls,
            vec![
                format!("mkdir {SHARE} 711"),
                String::from("xcb Insert \"localuser\\0chronos\""),
                String::from("xcb Delete \"localuser\\0chronos\""),
                format!("remove {SHARE}"),
            ]
        );
    }

    #[test]
    fn test_revert_criteria_filter() {
        let (mut sys, stub) = stubbed(0xbad);
        sys.ephemeral(PROCESS, abs(SHARE), 0o711)
            .update_perm_type(USER, abs("/run/user/1000"), AclPerms::EXECUTE);
        sys.commit().expect("commit should succeed");
        stub.calls.borrow_mut().clear();

        sys.revert(Criteria(Some(USER))).expect("revert should succeed");

        // only the User-tagged op reverts; the Process op remains
        let calls = stub.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("acl_update /run/user/1000"));
    }

    #[test]
    #[should_panic(expected = "attempting to commit twice")]
    fn test_commit_twice_panics() {
        let (mut sys, _) = stubbed(0);
        sys.commit().unwrap();
        let _ = sys.commit();
    }

    #[test]
    #[should_panic(expected = "attempting to revert twice")]
    fn test_revert_twice_panics() {
        let (mut sys, _) = stubbed(0);
        sys.revert(Criteria(None)).unwrap();
        let _ = sys.revert(Criteria(None));
    }
}
