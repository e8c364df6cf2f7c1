//! Pipe helpers for handing the IPC channel to a spawned worker.
//!
//! Both ends start out close-on-exec; only the worker's write end has the
//! flag cleared, from inside the child between fork and exec.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

/// Create a pipe with both ends marked `CLOEXEC`, returned as `(read, write)`.
pub fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    pipe_cloexec_impl()
}

#[cfg(not(target_os = "macos"))]
fn pipe_cloexec_impl() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(target_os = "macos")]
fn pipe_cloexec_impl() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    set_cloexec(read_fd.as_fd())?;
    set_cloexec(write_fd.as_fd())?;
    Ok((read_fd, write_fd))
}

/// Remove the `CLOEXEC` flag so the descriptor survives `exec`.
pub fn remove_cloexec<Fd: AsFd>(fd: Fd) -> Result<(), nix::Error> {
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
    )?;
    Ok(())
}

/// Variant of [`remove_cloexec`] for use inside `pre_exec`, where only the
/// raw descriptor number is available.
///
/// # Safety
///
/// `fd` must be open for the duration of the call.
pub unsafe fn remove_cloexec_raw(fd: RawFd) -> Result<(), nix::Error> {
    // SAFETY: caller guarantees fd is open
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    remove_cloexec(borrowed)
}

#[cfg(target_os = "macos")]
fn set_cloexec(fd: BorrowedFd<'_>) -> Result<(), nix::Error> {
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;
    Ok(())
}
