//! Process-scoped cgroup v2 subtree op.
//!
//! Creates the per-instance directory chain beneath a delegated slice and
//! writes the basic resource controllers. Everything created or written is
//! recorded for reverse-order removal on revert.

use std::fmt;
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::OpError;
use crate::path::Absolute;
use crate::system::dispatcher::Syscalls;

/// Basic cgroup v2 resource controller values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CgroupLimits {
    /// Microsecond quota against the default 100000µs period; zero skips cpu.max.
    pub cpu: u64,
    /// memory.max in bytes; zero skips the write.
    pub memory: u64,
    /// pids.max; zero skips the write.
    pub pids: i64,
}

#[derive(Debug)]
pub(crate) struct CgroupOp {
    base: Absolute,
    target: Absolute,
    limits: CgroupLimits,
    created: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

impl CgroupOp {
    pub(crate) fn new(base: Absolute, target: Absolute, limits: CgroupLimits) -> Self {
        Self {
            base,
            target,
            limits,
            created: Vec::new(),
            files: Vec::new(),
        }
    }

    pub(crate) fn apply(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        debug!(path = self.target.as_str(), "configuring cgroup");

        if !self.target.is_beneath(&self.base) || self.target == self.base {
            if self.target == self.base {
                return Err(OpError::message("cgroup", "cgroup path cannot equal slice"));
            }
            return Err(OpError::new(
                "cgroup",
                io::Error::new(io::ErrorKind::InvalidInput, "cgroup path escapes slice"),
            ));
        }

        k.stat(self.base.as_path())
            .map_err(|e| OpError::new("cgroup", e))?;

        self.ensure_path(k)?;
        self.apply_limits(k)
    }

    fn ensure_path(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        let rel = self.target.as_str()[self.base.as_str().len()..].trim_start_matches('/');
        let parts: Vec<&str> = rel.split('/').filter(|p| !p.is_empty()).collect();

        let mut cur = PathBuf::from(self.base.as_str());
        for (i, part) in parts.iter().enumerate() {
            cur.push(part);
            match k.mkdir(&cur, 0o755) {
                Ok(()) => self.created.push(cur.clone()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if i == parts.len() - 1 {
                        // instance leaf names are unique; an existing leaf
                        // means a concurrent instance owns it
                        return Err(OpError::new(
                            "cgroup",
                            io::Error::new(
                                io::ErrorKind::AlreadyExists,
                                format!("cgroup {:?} already exists", cur.display()),
                            ),
                        ));
                    }
                }
                Err(e) => return Err(OpError::new("cgroup", e)),
            }
        }
        Ok(())
    }

    fn apply_limits(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        if self.limits.cpu > 0 {
            self.write_controller(k, "cpu.max", &format!("{} 100000", self.limits.cpu))?;
        }
        if self.limits.memory > 0 {
            self.write_controller(k, "memory.max", &self.limits.memory.to_string())?;
        }
        if self.limits.pids > 0 {
            self.write_controller(k, "pids.max", &self.limits.pids.to_string())?;
        }
        Ok(())
    }

    fn write_controller(
        &mut self,
        k: &dyn Syscalls,
        name: &str,
        value: &str,
    ) -> Result<(), OpError> {
        let file = PathBuf::from(self.target.as_str()).join(name);
        k.write_file(&file, value.as_bytes())
            .map_err(|e| OpError::new("cgroup", e))?;
        self.files.push(file);
        Ok(())
    }

    pub(crate) fn revert(&mut self, k: &dyn Syscalls) -> Result<(), OpError> {
        for file in self.files.iter().rev() {
            if let Err(e) = k.remove_file(file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(file = %file.display(), error = %e, "cannot remove cgroup file");
                }
            }
        }
        self.files.clear();

        let mut errs = Vec::new();
        for dir in self.created.iter().rev() {
            match k.remove(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                    // a sibling instance still holds this path
                    debug!(dir = %dir.display(), "skipping busy cgroup path");
                }
                Err(e) => errs.push(OpError::reverting("cgroup", e)),
            }
        }
        self.created.clear();

        if errs.is_empty() {
            Ok(())
        } else if errs.len() == 1 {
            Err(errs.remove(0))
        } else {
            // the engine accumulates one error per op; collapse ours
            let joined = errs
                .iter()
                .map(|e| e.source.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(OpError::reverting("cgroup", io::Error::other(joined)))
        }
    }

    pub(crate) fn is(&self, other: &CgroupOp) -> bool {
        self.base == other.base && self.target == other.target && self.limits == other.limits
    }

    pub(crate) fn path(&self) -> &str {
        self.target.as_str()
    }
}

impl fmt::Display for CgroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base: {:?} path: {:?} cpu: {} memory: {} pids: {}",
            self.base.as_str(),
            self.target.as_str(),
            self.limits.cpu,
            self.limits.memory,
            self.limits.pids
        )
    }
}
