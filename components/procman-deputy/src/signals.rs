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

//! Self-pipe signal bridge. The handler's only action is an async-safe
//! write of the signal number to a non-blocking pipe; the loop side reads
//! the pipe and turns the bytes into typed events.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{self, c_int};

use os;

/// Write end of the self-pipe; the one piece of state the signal handler
/// shares with the rest of the process.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const BRIDGED_SIGNALS: [c_int; 5] = [
    libc::SIGCHLD,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGTERM,
];

/// Loop-side view of signal arrivals. Multiple raises of the same signal
/// between reads collapse into one event; ordering across kinds is not
/// meaningful.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    ChildExited,
    Shutdown,
}

pub struct SignalBridge {
    read_fd: RawFd,
}

impl SignalBridge {
    /// Install the handler for all bridged signals and return the bridge
    /// holding the readable end of the pipe.
    pub fn init() -> io::Result<SignalBridge> {
        let (read_fd, write_fd) = os::pipe()?;
        os::set_nonblocking(read_fd)?;
        // The handler must never block either, even if the loop falls
        // far enough behind to fill the pipe.
        os::set_nonblocking(write_fd)?;
        PIPE_WRITE_FD.store(write_fd, Ordering::SeqCst);
        for signal in BRIDGED_SIGNALS.iter() {
            install_handler(*signal)?;
        }
        Ok(SignalBridge { read_fd: read_fd })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain the pipe and report which events are pending.
    pub fn pending(&self) -> Vec<SignalEvent> {
        let mut child_exited = false;
        let mut shutdown = false;
        let mut buf = [0u8; 64];
        loop {
            match os::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    for byte in buf[..count].iter() {
                        match *byte as c_int {
                            libc::SIGCHLD => child_exited = true,
                            _ => shutdown = true,
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("error draining signal pipe: {}", e);
                    break;
                }
            }
        }
        let mut events = Vec::new();
        if child_exited {
            events.push(SignalEvent::ChildExited);
        }
        if shutdown {
            events.push(SignalEvent::Shutdown);
        }
        events
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        let write_fd = PIPE_WRITE_FD.swap(-1, Ordering::SeqCst);
        if write_fd >= 0 {
            os::close(write_fd);
        }
        os::close(self.read_fd);
    }
}

fn install_handler(signal: c_int) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(c_int) = on_signal;
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// Async-signal-safe: one write, with errno saved and restored.
extern "C" fn on_signal(signal: c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let byte = signal as u8;
    unsafe {
        let errno = *libc::__errno_location();
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = errno;
    }
}
