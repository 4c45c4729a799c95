//! Seccomp filter presets and rules.
//!
//! The filter is a deny list compiled with seccompiler: everything is
//! allowed except the syscalls selected by the active presets, which fail
//! with EPERM. Presets are data that crosses the process boundary; the BPF
//! program is compiled and loaded on the shim side only.

use std::collections::BTreeMap;
use std::io;

use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter, SeccompRule,
};
use serde::{Deserialize, Serialize};

/// Extra flags attached to the emitted filter program.
pub type ExportFlags = u32;

/// A single syscall rule transmitted alongside the presets.
///
/// `errno` is returned to the caller when the syscall matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeRule {
    /// Syscall number on the native architecture.
    pub syscall: i64,
    /// Errno substituted for the call.
    pub errno: u32,
}

/// Preset groups selecting denied syscall families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterPreset(pub u32);

impl FilterPreset {
    /// Baseline denies for obscure or host-affecting syscalls.
    pub const EXT: FilterPreset = FilterPreset(1);
    /// Denies namespace and mount manipulation.
    pub const DENY_NS: FilterPreset = FilterPreset(1 << 1);
    /// Denies faked terminal input and console takeover.
    pub const DENY_TTY: FilterPreset = FilterPreset(1 << 2);
    /// Denies ptrace and friends.
    pub const DENY_DEVEL: FilterPreset = FilterPreset(1 << 3);
    /// Unblocks syscalls required for multiarch.
    pub const MULTIARCH: FilterPreset = FilterPreset(1 << 4);
    /// Emits filter programs identical to the compatibility profile.
    pub const COMPAT: FilterPreset = FilterPreset(1 << 5);

    #[must_use]
    pub fn contains(self, other: FilterPreset) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn without(self, other: FilterPreset) -> FilterPreset {
        FilterPreset(self.0 & !other.0)
    }
}

impl std::ops::BitOr for FilterPreset {
    type Output = FilterPreset;
    fn bitor(self, rhs: FilterPreset) -> FilterPreset {
        FilterPreset(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FilterPreset {
    fn bitor_assign(&mut self, rhs: FilterPreset) {
        self.0 |= rhs.0;
    }
}

const DENY_NS_SYSCALLS: &[i64] = &[
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    libc::SYS_move_mount,
    libc::SYS_open_tree,
    libc::SYS_fsopen,
    libc::SYS_fsconfig,
    libc::SYS_fsmount,
    libc::SYS_fspick,
];

const DENY_DEVEL_SYSCALLS: &[i64] = &[
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_perf_event_open,
    libc::SYS_personality,
];

const EXT_SYSCALLS: &[i64] = &[
    libc::SYS_acct,
    libc::SYS_add_key,
    libc::SYS_bpf,
    libc::SYS_request_key,
    libc::SYS_keyctl,
    libc::SYS_uselib,
    libc::SYS_userfaultfd,
    libc::SYS_syslog,
    libc::SYS_kexec_load,
    libc::SYS_kexec_file_load,
    libc::SYS_open_by_handle_at,
    libc::SYS_quotactl,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_reboot,
    libc::SYS_init_module,
    libc::SYS_delete_module,
    libc::SYS_finit_module,
    libc::SYS_vhangup,
    libc::SYS_sethostname,
    libc::SYS_setdomainname,
    libc::SYS_settimeofday,
    libc::SYS_clock_settime,
    libc::SYS_adjtimex,
    libc::SYS_modify_ldt,
];

const TIOCSTI: u64 = 0x5412;
const TIOCLINUX: u64 = 0x541C;

/// Collects the denied syscall numbers selected by `presets`.
#[must_use]
pub fn denied_syscalls(presets: FilterPreset) -> Vec<i64> {
    let mut denied = Vec::new();
    if presets.contains(FilterPreset::EXT) && !presets.contains(FilterPreset::COMPAT) {
        denied.extend_from_slice(EXT_SYSCALLS);
        if presets.contains(FilterPreset::MULTIARCH) {
            denied.retain(|&nr| nr != libc::SYS_modify_ldt);
        }
    }
    if presets.contains(FilterPreset::DENY_NS) {
        denied.extend_from_slice(DENY_NS_SYSCALLS);
    }
    if presets.contains(FilterPreset::DENY_DEVEL) {
        denied.extend_from_slice(DENY_DEVEL_SYSCALLS);
    }
    denied.sort_unstable();
    denied.dedup();
    denied
}

/// Compiles the filter program for `presets` and `rules`.
///
/// `rules` take precedence over presets: a non-empty rule list replaces the
/// preset-derived deny list entirely.
pub fn compile(presets: FilterPreset, rules: &[NativeRule]) -> io::Result<BpfProgram> {
    let mut map: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    if rules.is_empty() {
        for nr in denied_syscalls(presets) {
            map.insert(nr, Vec::new());
        }
        if presets.contains(FilterPreset::DENY_TTY) {
            map.insert(libc::SYS_ioctl, tty_ioctl_rules()?);
        }
    } else {
        for rule in rules {
            map.insert(rule.syscall, Vec::new());
        }
    }

    SeccompFilter::new(
        map,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        std::env::consts::ARCH
            .try_into()
            .map_err(|_| io::Error::other("unsupported seccomp architecture"))?,
    )
    .and_then(TryInto::try_into)
    .map_err(io::Error::other)
}

fn tty_ioctl_rules() -> io::Result<Vec<SeccompRule>> {
    let mut rules = Vec::new();
    for request in [TIOCSTI, TIOCLINUX] {
        rules.push(
            SeccompRule::new(vec![SeccompCondition::new(
                1,
                SeccompCmpArgLen::Qword,
                SeccompCmpOp::Eq,
                request,
            )
            .map_err(io::Error::other)?])
            .map_err(io::Error::other)?,
        );
    }
    Ok(rules)
}

/// Loads the compiled program onto the current thread and its descendants.
pub fn load(program: &BpfProgram) -> io::Result<()> {
    apply_filter(program).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_ops() {
        let p = FilterPreset::EXT | FilterPreset::DENY_TTY;
        assert!(p.contains(FilterPreset::EXT));
        assert!(p.contains(FilterPreset::DENY_TTY));
        assert!(!p.contains(FilterPreset::DENY_NS));
        assert!(!p.without(FilterPreset::DENY_TTY).contains(FilterPreset::DENY_TTY));
    }

    #[test]
    fn test_denied_syscalls_by_preset() {
        let ns_only = denied_syscalls(FilterPreset::DENY_NS);
        assert!(ns_only.contains(&libc::SYS_unshare));
        assert!(!ns_only.contains(&libc::SYS_ptrace));

        let devel = denied_syscalls(FilterPreset::DENY_DEVEL);
        assert!(devel.contains(&libc::SYS_ptrace));
        assert!(!devel.contains(&libc::SYS_mount));
    }

    #[test]
    fn test_multiarch_unblocks_modify_ldt() {
        let base = denied_syscalls(FilterPreset::EXT);
        assert!(base.contains(&libc::SYS_modify_ldt));

        let multiarch = denied_syscalls(FilterPreset::EXT | FilterPreset::MULTIARCH);
        assert!(!multiarch.contains(&libc::SYS_modify_ldt));
    }

    #[test]
    fn test_compat_drops_ext() {
        let compat = denied_syscalls(
            FilterPreset::EXT | FilterPreset::DENY_NS | FilterPreset::COMPAT,
        );
        assert!(!compat.contains(&libc::SYS_bpf));
        assert!(compat.contains(&libc::SYS_unshare));
    }

    #[test]
    fn test_denied_list_sorted_unique() {
        let all = denied_syscalls(
            FilterPreset::EXT | FilterPreset::DENY_NS | FilterPreset::DENY_DEVEL,
        );
        let mut sorted = all.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(all, sorted);
    }

    #[test]
    fn test_compile_presets() {
        let program = compile(
            FilterPreset::EXT | FilterPreset::DENY_NS | FilterPreset::DENY_TTY,
            &[],
        )
        .expect("filter should compile");
        assert!(!program.is_empty());
    }

    #[test]
    fn test_compile_explicit_rules() {
        let rules = [NativeRule {
            syscall: libc::SYS_reboot,
            errno: libc::EPERM as u32,
        }];
        let program = compile(FilterPreset::default(), &rules).expect("filter should compile");
        assert!(!program.is_empty());
    }
}
