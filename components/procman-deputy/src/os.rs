// Copyright (c) 2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thin Unix layer: spawning children with a merged output pipe,
//! non-blocking reaping, signal delivery, and fd plumbing.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use libc::{self, c_int, pid_t};

pub type Pid = pid_t;

/// Spawn a child from an argv, in its own process group, with stdout and
/// stderr merged onto a single pipe. Returns the child pid and the
/// non-blocking, close-on-exec read end of that pipe.
pub fn spawn_merged(argv: &[String]) -> io::Result<(Pid, RawFd)> {
    let (read_fd, write_fd) = pipe()?;
    if let Err(err) = set_nonblocking(read_fd) {
        close(read_fd);
        close(write_fd);
        return Err(err);
    }
    let stdout_fd = unsafe { libc::dup(write_fd) };
    if stdout_fd < 0 {
        let err = io::Error::last_os_error();
        close(read_fd);
        close(write_fd);
        return Err(err);
    }
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).stdin(Stdio::null());
    // Stdio takes ownership of the write ends; both are closed in the
    // parent once the child is spawned (or the Command is dropped).
    unsafe {
        cmd.stdout(Stdio::from_raw_fd(stdout_fd));
        cmd.stderr(Stdio::from_raw_fd(write_fd));
        cmd.pre_exec(own_process_group);
    }
    match cmd.spawn() {
        Ok(child) => Ok((child.id() as Pid, read_fd)),
        Err(err) => {
            close(read_fd);
            Err(err)
        }
    }
}

// Children get their own process group so that a child signalling its
// group cannot take the deputy down with it.
fn own_process_group() -> io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Non-blocking check for a terminated child. Returns the raw wait status
/// if the child has exited.
pub fn try_wait(pid: Pid) -> io::Result<Option<c_int>> {
    let mut status = 0 as c_int;
    match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
        0 => Ok(None),
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(Some(status)),
    }
}

pub fn send_signal(pid: Pid, signal: c_int) -> io::Result<()> {
    match unsafe { libc::kill(pid, signal) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Read from a non-blocking fd. `Ok(0)` is end-of-file; would-block is
/// surfaced as `ErrorKind::WouldBlock`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if count < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(count as usize)
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Create a close-on-exec pipe.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Point stdout and stderr at `path`, appending. The file handle is
/// intentionally leaked; fds 1 and 2 keep it alive for the process
/// lifetime.
pub fn redirect_stdio<T>(path: T) -> io::Result<()>
where
    T: AsRef<Path>,
{
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let fd = file.into_raw_fd();
    unsafe {
        if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn current_pid() -> Pid {
    unsafe { libc::getpid() }
}
