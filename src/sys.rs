//! Safe wrappers for platform-specific unsafe operations.
//!
//! Every `unsafe` block in the crate lives here. Call sites use the safe
//! public API and never touch `unsafe` directly.

use std::io;

/// Send SIGTERM to the process `pid`.
///
/// # Safety
/// `kill` takes plain integers and has no memory-safety preconditions; the
/// pid is range-checked before the call.
pub fn send_sigterm(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
