//! Linux isolation primitives
//!
//! This module contains the core isolation mechanisms:
//! - `namespace` - user + network (+ ipc, uts) namespaces via unshare
//! - `seccomp` - syscall deny-list compiled with seccompiler
//! - `landlock` - filesystem access control
//! - `cgroups` - cgroup v2 leaf per execution
//!
//! Everything that runs in the forked child (`enter`, `restrict`, `apply`)
//! sticks to raw syscalls and reports failures as plain errno values.

pub mod cgroups;
pub mod landlock;
pub mod namespace;
pub mod seccomp;

pub use self::cgroups::CgroupLeaf;
pub use self::landlock::LandlockConfig;
pub use self::namespace::NamespaceConfig;
pub use self::seccomp::SeccompConfig;

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

/// errno reported by the child when an isolation layer fails in strict mode
pub const SANDBOX_SETUP_ERRNO: i32 = libc::ENOTRECOVERABLE;

/// Write `contents` to an already open descriptor
pub(crate) fn write_fd(fd: RawFd, contents: &[u8]) -> io::Result<()> {
    // SAFETY: the buffer is valid for `contents.len()` bytes
    let written = unsafe { libc::write(fd, contents.as_ptr().cast(), contents.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open `path` write-only, write `contents`, close
pub(crate) fn write_path(path: &CStr, contents: &[u8]) -> io::Result<()> {
    // SAFETY: path is NUL-terminated
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = write_fd(fd, contents);
    // SAFETY: fd was opened above and is not used afterwards
    unsafe { libc::close(fd) };
    result
}

/// Drop every capability the child still holds
///
/// Runs after namespace setup, so it also discards the full capability set
/// granted inside a fresh user namespace.
pub(crate) fn clear_capabilities() -> io::Result<()> {
    use caps::CapSet;

    for set in [
        CapSet::Ambient,
        CapSet::Inheritable,
        CapSet::Effective,
        CapSet::Permitted,
    ] {
        caps::clear(None, set).map_err(|_| io::Error::from_raw_os_error(libc::EPERM))?;
    }
    Ok(())
}
