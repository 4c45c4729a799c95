//! Sequential in-container setup operations.
//!
//! The init process materialises the container filesystem by applying these
//! ops in order against a staging root before pivoting into it. The op set
//! is closed and serialisable, so the shim compiles it on one side of the
//! param pipe and init replays it on the other without any dynamic
//! dispatch.
//!
//! All mounts carry `MS_NOSUID`; device files are only allowed where the
//! bind explicitly asks for them.

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::path::Absolute;

/// Device nodes bound into a minimal `/dev`.
const DEV_BIND_NODES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

/// One step of container filesystem setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContainerOp {
    /// Bind mount a host path into the container.
    Bind {
        src: Absolute,
        dst: Absolute,
        #[serde(default)]
        write: bool,
        #[serde(default)]
        device: bool,
        #[serde(default)]
        optional: bool,
    },
    /// Mount a fresh tmpfs.
    Tmpfs {
        dst: Absolute,
        #[serde(default)]
        size: Option<u64>,
        perm: u32,
    },
    /// Mount procfs of the new PID namespace.
    Proc { dst: Absolute },
    /// Set up `/dev`: a minimal node set, or the host's as-is.
    Dev {
        dst: Absolute,
        #[serde(default)]
        bind_host: bool,
    },
    /// Mount an overlay.
    Overlay {
        dst: Absolute,
        lower: Vec<Absolute>,
        #[serde(default)]
        upper: Option<Absolute>,
        #[serde(default)]
        work: Option<Absolute>,
    },
    /// Create a symlink.
    Symlink { dst: Absolute, target: String },
    /// Create a directory.
    Mkdir { dst: Absolute, mode: u32 },
    /// Write a file, creating parents as needed; used for synthesised
    /// `/etc/passwd` and `/etc/group`.
    WriteFile { dst: Absolute, content: String },
}

impl ContainerOp {
    /// Applies the op: targets land beneath `root`, bind and overlay
    /// sources resolve beneath `host_root` (the old root after the staging
    /// pivot), parents are created with `parent_perm`.
    pub fn apply(&self, root: &Path, host_root: &Path, parent_perm: u32) -> io::Result<()> {
        trace!(op = ?self, "applying container op");
        match self {
            ContainerOp::Bind {
                src,
                dst,
                write,
                device,
                optional,
            } => {
                let source = resolve(host_root, src);
                let meta = match fs::metadata(&source) {
                    Ok(meta) => meta,
                    Err(e) if *optional && e.kind() == io::ErrorKind::NotFound => {
                        debug!(src = src.as_str(), "skipping optional bind");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let target = resolve(root, dst);
                if meta.is_dir() {
                    create_dir_chain(&target, parent_perm)?;
                } else {
                    touch(&target, parent_perm)?;
                }
                bind_mount(&source, &target, *write, *device)
            }
            ContainerOp::Tmpfs { dst, size, perm } => {
                let target = resolve(root, dst);
                create_dir_chain(&target, parent_perm)?;
                let mut data = format!("mode={perm:o}");
                if let Some(size) = size {
                    data.push_str(&format!(",size={size}"));
                }
                mount(
                    Some("tmpfs"),
                    &target,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some(data.as_str()),
                )
                .map_err(io::Error::from)
            }
            ContainerOp::Proc { dst } => {
                let target = resolve(root, dst);
                create_dir_chain(&target, parent_perm)?;
                mount(
                    Some("proc"),
                    &target,
                    Some("proc"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                    None::<&str>,
                )
                .map_err(io::Error::from)
            }
            ContainerOp::Dev { dst, bind_host } => {
                apply_dev(root, host_root, dst, *bind_host, parent_perm)
            }
            ContainerOp::Overlay {
                dst,
                lower,
                upper,
                work,
            } => {
                let target = resolve(root, dst);
                create_dir_chain(&target, parent_perm)?;
                let lowerdir = lower
                    .iter()
                    .map(|p| resolve(host_root, p).display().to_string())
                    .collect::<Vec<_>>()
                    .join(":");
                // userxattr is required for unprivileged overlays in a userns
                let mut data = format!("lowerdir={lowerdir},userxattr");
                if let (Some(upper), Some(work)) = (upper, work) {
                    data.push_str(&format!(
                        ",upperdir={},workdir={}",
                        resolve(host_root, upper).display(),
                        resolve(host_root, work).display()
                    ));
                }
                mount(
                    Some("overlay"),
                    &target,
                    Some("overlay"),
                    MsFlags::MS_NOSUID,
                    Some(data.as_str()),
                )
                .map_err(io::Error::from)
            }
            ContainerOp::Symlink { dst, target } => {
                let link = resolve(root, dst);
                if let Some(parent) = link.parent() {
                    create_dir_chain(parent, parent_perm)?;
                }
                symlink(target, &link)
            }
            ContainerOp::Mkdir { dst, mode } => {
                let target = resolve(root, dst);
                create_dir_chain(&target, parent_perm)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(*mode))
            }
            ContainerOp::WriteFile { dst, content } => {
                let target = resolve(root, dst);
                if let Some(parent) = target.parent() {
                    create_dir_chain(parent, parent_perm)?;
                }
                fs::write(&target, content)
            }
        }
    }
}

/// Maps a container pathname to its staging location beneath `root`.
fn resolve(root: &Path, dst: &Absolute) -> PathBuf {
    root.join(dst.as_str().trim_start_matches('/'))
}

fn create_dir_chain(target: &Path, parent_perm: u32) -> io::Result<()> {
    if target.is_dir() {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        create_dir_chain(parent, parent_perm)?;
    }
    match fs::create_dir(target) {
        Ok(()) => fs::set_permissions(target, fs::Permissions::from_mode(parent_perm)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn touch(target: &Path, parent_perm: u32) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        create_dir_chain(parent, parent_perm)?;
    }
    if !target.exists() {
        fs::File::create(target)?;
    }
    Ok(())
}

fn bind_mount(src: &Path, target: &Path, write: bool, device: bool) -> io::Result<()> {
    mount(
        Some(src),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;

    // bind flags only take effect on remount
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID;
    if !write {
        flags |= MsFlags::MS_RDONLY;
    }
    if !device {
        flags |= MsFlags::MS_NODEV;
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(io::Error::from)
}

fn apply_dev(
    root: &Path,
    host_root: &Path,
    dst: &Absolute,
    bind_host: bool,
    parent_perm: u32,
) -> io::Result<()> {
    let target = resolve(root, dst);
    create_dir_chain(&target, parent_perm)?;

    if bind_host {
        return bind_mount(&host_root.join("dev"), &target, true, true);
    }

    mount(
        Some("tmpfs"),
        &target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=0755"),
    )?;

    for node in DEV_BIND_NODES {
        let node_source = host_root.join(node.trim_start_matches('/'));
        if !node_source.exists() {
            continue;
        }
        let node_target = target.join(node.trim_start_matches("/dev/"));
        fs::File::create(&node_target)?;
        bind_mount(&node_source, &node_target, true, true)?;
    }

    for (link, link_target) in [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        symlink(link_target, target.join(link))?;
    }

    let shm = target.join("shm");
    fs::create_dir(&shm)?;
    mount(
        Some("tmpfs"),
        &shm,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?;

    let pts = target.join("pts");
    fs::create_dir(&pts)?;
    mount(
        Some("devpts"),
        &pts,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )?;
    symlink("pts/ptmx", target.join("ptmx"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(path: &str) -> Absolute {
        Absolute::new(path).unwrap()
    }

    #[test]
    fn test_resolve_strips_leading_slash() {
        let root = Path::new("/tmp/sysroot");
        assert_eq!(
            resolve(root, &abs("/usr/bin")),
            PathBuf::from("/tmp/sysroot/usr/bin")
        );
        assert_eq!(resolve(root, &abs("/")), PathBuf::from("/tmp/sysroot"));
    }

    #[test]
    fn test_op_serde_round_trip() {
        let ops = vec![
            ContainerOp::Bind {
                src: abs("/usr"),
                dst: abs("/usr"),
                write: false,
                device: false,
                optional: false,
            },
            ContainerOp::Tmpfs {
                dst: abs("/.hakurei"),
                size: Some(1 << 20),
                perm: 0o700,
            },
            ContainerOp::Proc { dst: abs("/proc") },
            ContainerOp::WriteFile {
                dst: abs("/etc/passwd"),
                content: String::from("chronos:x:1000:100::/home/chronos:/bin/sh\n"),
            },
        ];
        let json = serde_json::to_string(&ops).unwrap();
        let back: Vec<ContainerOp> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ops);
    }

    #[test]
    fn test_write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let op = ContainerOp::WriteFile {
            dst: abs("/etc/passwd"),
            content: String::from("chronos:x:1000:100::/home/chronos:/bin/sh\n"),
        };
        op.apply(dir.path(), Path::new("/"), 0o755).unwrap();
        let written = fs::read_to_string(dir.path().join("etc/passwd")).unwrap();
        assert!(written.starts_with("chronos:x:1000:100"));
    }

    #[test]
    fn test_mkdir_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let op = ContainerOp::Mkdir {
            dst: abs("/run/user"),
            mode: 0o700,
        };
        op.apply(dir.path(), Path::new("/"), 0o755).unwrap();
        let mode = fs::metadata(dir.path().join("run/user"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_symlink_op() {
        let dir = tempfile::tempdir().unwrap();
        let op = ContainerOp::Symlink {
            dst: abs("/var/run"),
            target: String::from("../run"),
        };
        op.apply(dir.path(), Path::new("/"), 0o755).unwrap();
        let link = fs::read_link(dir.path().join("var/run")).unwrap();
        assert_eq!(link, PathBuf::from("../run"));
    }

    #[test]
    fn test_optional_bind_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let op = ContainerOp::Bind {
            src: abs("/nonexistent/hakurei/source"),
            dst: abs("/mnt"),
            write: false,
            device: false,
            optional: true,
        };
        op.apply(dir.path(), Path::new("/"), 0o755).unwrap();
        assert!(!dir.path().join("mnt").exists());
    }
}
