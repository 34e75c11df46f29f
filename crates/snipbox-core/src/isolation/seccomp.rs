//! Seccomp-BPF syscall filtering

use crate::{Result, SnipboxError};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;
use std::io;

/// Configuration for seccomp filtering
///
/// A deny-list: everything the interpreter normally needs stays allowed,
/// while syscalls that reach outside the sandbox fail with `errno`.
#[derive(Debug, Clone)]
pub struct SeccompConfig {
    /// Syscalls denied unconditionally
    pub denied_syscalls: Vec<i64>,
    /// Address families `socket(2)` may not create
    pub denied_socket_families: Vec<i32>,
    /// errno returned for denied calls
    pub errno: u32,
}

impl Default for SeccompConfig {
    fn default() -> Self {
        Self {
            denied_syscalls: default_denied_syscalls(),
            denied_socket_families: vec![libc::AF_INET, libc::AF_INET6, libc::AF_PACKET],
            errno: libc::EPERM as u32,
        }
    }
}

impl SeccompConfig {
    /// Compile the filter for the host architecture
    pub fn compile(&self) -> Result<BpfProgram> {
        let sc = |e: &dyn std::fmt::Display| SnipboxError::Seccomp(e.to_string());

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = self
            .denied_syscalls
            .iter()
            .map(|&nr| (nr, Vec::new()))
            .collect();

        let socket_rules = self
            .denied_socket_families
            .iter()
            .map(|&family| {
                let family = u64::try_from(family).map_err(|e| sc(&e))?;
                let cond = SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, family)
                    .map_err(|e| sc(&e))?;
                SeccompRule::new(vec![cond]).map_err(|e| sc(&e))
            })
            .collect::<Result<Vec<_>>>()?;
        if !socket_rules.is_empty() {
            rules.insert(libc::SYS_socket, socket_rules);
        }

        let arch: TargetArch = std::env::consts::ARCH.try_into().map_err(|e| sc(&e))?;
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(self.errno),
            arch,
        )
        .map_err(|e| sc(&e))?;

        let program: BpfProgram = filter.try_into().map_err(|e| sc(&e))?;
        tracing::debug!(
            syscalls = self.denied_syscalls.len(),
            instructions = program.len(),
            "seccomp filter compiled"
        );
        Ok(program)
    }
}

/// Install a compiled filter on the calling thread (sets no_new_privs)
pub fn apply(program: &BpfProgram) -> io::Result<()> {
    seccompiler::apply_filter(program).map_err(|_| io::Error::from_raw_os_error(libc::EPERM))
}

/// Syscalls an untrusted script never needs
fn default_denied_syscalls() -> Vec<i64> {
    vec![
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
        libc::SYS_unshare,
        libc::SYS_setns,
        libc::SYS_reboot,
        libc::SYS_kexec_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_bpf,
        libc::SYS_perf_event_open,
        libc::SYS_keyctl,
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_userfaultfd,
        // Leaving the process group would escape group-wide kills
        libc::SYS_setsid,
        libc::SYS_setpgid,
        // io_uring can open sockets without going through socket(2)
        libc::SYS_io_uring_setup,
        libc::SYS_io_uring_enter,
        libc::SYS_io_uring_register,
    ]
}
