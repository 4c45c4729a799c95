//! Integration tests for the transaction engine against a real filesystem.
//!
//! These exercise commit, partial rollback and revert on temporary
//! directories, including the cgroup subtree op with its controller file
//! writes. No kernel privileges are required: the cgroup op only performs
//! directory and file operations rooted at the configured base.

use std::fs;

use hakurei::system::CgroupLimits;
use hakurei::{Absolute, Criteria, System};

fn abs(path: &std::path::Path) -> Absolute {
    Absolute::new(path.to_str().expect("utf-8 temp path")).expect("absolute temp path")
}

/// Full cgroup lifecycle: subtree creation, controller writes, teardown.
#[test]
fn test_cgroup_full_lifecycle() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let target = base.append("hakurei-1").append("instance");

    let mut sys = System::new(0xbeef);
    sys.cgroup(
        base,
        target.clone(),
        CgroupLimits {
            cpu: 50000,
            memory: 2048,
            pids: 16,
        },
    );
    sys.commit().expect("commit should succeed");

    let read = |name: &str| {
        fs::read_to_string(target.as_path().join(name))
            .unwrap_or_else(|e| panic!("read {name}: {e}"))
    };
    assert_eq!(read("cpu.max").trim(), "50000 100000");
    assert_eq!(read("memory.max").trim(), "2048");
    assert_eq!(read("pids.max").trim(), "16");

    sys.revert(Criteria(None)).expect("revert should succeed");
    assert!(
        !target.as_path().exists(),
        "target directory should be removed"
    );
    assert!(
        !target.as_path().parent().unwrap().exists(),
        "empty intermediate directory should be removed"
    );
}

/// A target outside the base slice is refused before any mutation.
#[test]
fn test_cgroup_escape_refused() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let target = abs(outside.path()).append("instance");

    let mut sys = System::new(0);
    sys.cgroup(base, target.clone(), CgroupLimits::default());

    let err = sys.commit().expect_err("escaping target should be refused");
    assert_eq!(err.op, "cgroup");
    assert_eq!(err.source.kind(), std::io::ErrorKind::InvalidInput);
    assert!(err.source.to_string().contains("escapes slice"));
    assert!(!target.as_path().exists());
}

/// An existing final component means a concurrent instance owns the leaf.
#[test]
fn test_cgroup_existing_leaf_refused() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let target = base.append("hakurei-1").append("instance");
    fs::create_dir_all(target.as_path()).expect("pre-create leaf");

    let mut sys = System::new(0);
    sys.cgroup(base, target, CgroupLimits::default());

    let err = sys.commit().expect_err("existing leaf should be refused");
    assert_eq!(err.op, "cgroup");
    assert!(err.source.to_string().contains("already exists"));
}

/// Intermediate components shared with a sibling instance survive revert.
#[test]
fn test_cgroup_busy_intermediate_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let intermediate = base.append("hakurei-1");
    let target = intermediate.append("instance");

    let mut sys = System::new(0);
    sys.cgroup(base, target.clone(), CgroupLimits::default());
    sys.commit().expect("commit should succeed");

    // a sibling instance appears under the shared intermediate directory
    let sibling = intermediate.as_path().join("sibling");
    fs::create_dir(&sibling).expect("create sibling");

    sys.revert(Criteria(None))
        .expect("busy intermediate should not fail revert");
    assert!(!target.as_path().exists(), "own leaf should be removed");
    assert!(
        intermediate.as_path().exists(),
        "busy intermediate should be skipped"
    );
}

/// A failing op mid-commit rolls the earlier ops back, returning the
/// filesystem to its pre-commit state.
#[test]
fn test_partial_commit_rolls_back_directories() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let ephemeral = base.append("f2f3bcd492d0266438fa9bf164fe90d9");
    let missing_base = base.append("missing");

    let mut sys = System::new(0);
    sys.ephemeral(hakurei::system::PROCESS, ephemeral.clone(), 0o711)
        .cgroup(
            missing_base.clone(),
            missing_base.append("instance"),
            CgroupLimits::default(),
        );

    let err = sys.commit().expect_err("missing base should fail commit");
    assert_eq!(err.op, "cgroup");
    assert!(
        !ephemeral.as_path().exists(),
        "rollback should remove the ephemeral directory"
    );
}

/// Ensure ops are durable under the default criteria; an explicit User
/// criteria removes directories this commit created.
#[test]
fn test_revert_criteria_on_real_tree() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let durable = base.append("run");
    let ephemeral = base.append("instance");

    let mut sys = System::new(0);
    sys.ensure(durable.clone(), 0o700)
        .ephemeral(hakurei::system::PROCESS, ephemeral.clone(), 0o711);
    sys.commit().expect("commit should succeed");
    assert!(durable.as_path().is_dir());
    assert!(ephemeral.as_path().is_dir());

    sys.revert(Criteria(None)).expect("revert should succeed");
    assert!(
        durable.as_path().is_dir(),
        "User-tagged directory survives the default criteria"
    );
    assert!(
        !ephemeral.as_path().exists(),
        "Process-tagged directory is removed"
    );
}

/// Revert is tolerant of resources that have already disappeared.
#[test]
fn test_revert_tolerates_missing_paths() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());
    let ephemeral = base.append("instance");

    let mut sys = System::new(0);
    sys.ephemeral(hakurei::system::PROCESS, ephemeral.clone(), 0o711);
    sys.commit().expect("commit should succeed");

    fs::remove_dir(ephemeral.as_path()).expect("remove out of band");
    sys.revert(Criteria(None))
        .expect("ENOENT during revert is swallowed");
}

/// Registration order is preserved and equality is structural.
#[test]
fn test_structural_equality() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let base = abs(tmp.path());

    let mut a = System::new(150);
    a.ensure(base.append("run"), 0o755)
        .ephemeral(hakurei::system::PROCESS, base.append("x"), 0o711);

    let mut b = System::new(150);
    b.ensure(base.append("run"), 0o755)
        .ephemeral(hakurei::system::PROCESS, base.append("x"), 0o711);

    assert!(a.equal(&b));

    let mut c = System::new(150);
    c.ensure(base.append("run"), 0o755);
    assert!(!a.equal(&c));
}
