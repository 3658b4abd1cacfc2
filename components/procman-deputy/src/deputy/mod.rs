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

//! The deputy itself: the single-threaded loop multiplexing bus
//! receipts, bridged signals, child output pipes and the two timers,
//! plus the info/printf publisher and the reap path. The reconciler
//! lives in the `orders` submodule.

mod orders;

use std::cmp;
use std::collections::HashSet;
use std::io::{self, Write};

use libc::{self, c_int};
use time::{self, Duration, SteadyTime};

use bus::Bus;
use cmd::{CmdTable, ReadOutcome};
use error::{Error, Result};
use os::{self, Pid};
use probe::{self, SystemStatus};
use protocol::{CmdStatus, InfoMessage, PrintfMessage};
use signals::{SignalBridge, SignalEvent};

static LOGKEY: &'static str = "DP";

const INFO_INTERVAL_SECS: i64 = 1;
const MARK_INTERVAL_SECS: i64 = 120;

pub struct Deputy<B: Bus> {
    hostname: String,
    verbose: bool,
    bus: B,
    pid: Pid,
    cmds: CmdTable,
    sys_prev: SystemStatus,
    sys_cur: SystemStatus,
    cpu_load: f32,
    // Counters since the last MARK.
    orders_seen: u32,
    orders_for_me: u32,
    stale_orders: u32,
    observed_sheriffs: HashSet<String>,
    last_sheriff_name: Option<String>,
}

impl<B: Bus> Deputy<B> {
    pub fn new(hostname: String, verbose: bool, bus: B) -> Deputy<B> {
        Deputy {
            hostname: hostname,
            verbose: verbose,
            bus: bus,
            pid: os::current_pid(),
            cmds: CmdTable::new(),
            sys_prev: Default::default(),
            sys_cur: Default::default(),
            cpu_load: 0.0,
            orders_seen: 0,
            orders_for_me: 0,
            stale_orders: 0,
            observed_sheriffs: HashSet::new(),
            last_sheriff_name: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cmds(&self) -> &CmdTable {
        &self.cmds
    }

    pub fn orders_seen(&self) -> u32 {
        self.orders_seen
    }

    pub fn orders_for_me(&self) -> u32 {
        self.orders_for_me
    }

    pub fn stale_orders(&self) -> u32 {
        self.stale_orders
    }

    /// Run until a termination signal arrives. Every iteration suspends
    /// in one `poll` over the bus, the signal bridge and the watched
    /// child pipes; nothing dispatched from here may block.
    pub fn run(&mut self) -> Result<()> {
        let signals = SignalBridge::init().map_err(Error::Signals)?;
        self.update_resources();
        outputln!("deputy \"{}\" watching for orders", self.hostname);
        let mut next_info = SteadyTime::now() + Duration::seconds(INFO_INTERVAL_SECS);
        let mut next_mark = SteadyTime::now() + Duration::seconds(MARK_INTERVAL_SECS);
        loop {
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2 + self.cmds.len());
            fds.push(pollfd(self.bus.fd()));
            fds.push(pollfd(signals.fd()));
            let mut watched: Vec<i32> = Vec::new();
            for (id, cmd) in self.cmds.iter() {
                if let Some(fd) = cmd.watched_fd() {
                    fds.push(pollfd(fd));
                    watched.push(*id);
                }
            }

            let now = SteadyTime::now();
            let timeout = cmp::max(
                0,
                (cmp::min(next_info, next_mark) - now).num_milliseconds(),
            );
            let count = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout as c_int)
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::Poll(err));
            }

            // Signal events come first; a shutdown signal wins the
            // iteration.
            let mut shutdown = false;
            if readable(&fds[1]) {
                for event in signals.pending() {
                    match event {
                        SignalEvent::ChildExited => {
                            self.reap_dead();
                        }
                        SignalEvent::Shutdown => shutdown = true,
                    }
                }
            }
            if shutdown {
                outputln!("caught termination signal");
                self.shutdown();
                return Ok(());
            }

            // The bus fd is edge-triggered; drain to empty on every
            // wakeup rather than trusting revents.
            loop {
                match self.bus.try_recv_orders() {
                    Ok(Some(orders)) => self.handle_orders(orders),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("bus receive error: {}", e);
                        break;
                    }
                }
            }

            for (index, id) in watched.iter().enumerate() {
                if readable(&fds[2 + index]) {
                    self.read_cmd_output(*id);
                }
            }

            let now = SteadyTime::now();
            if now >= next_info {
                self.update_resources();
                self.send_info();
                next_info = now + Duration::seconds(INFO_INTERVAL_SECS);
            }
            if now >= next_mark {
                self.mark();
                next_mark = now + Duration::seconds(MARK_INTERVAL_SECS);
            }
        }
    }

    /// One read against a command's output pipe, forwarding whatever
    /// arrived. EOF and read errors unwatch the pipe; the fd itself
    /// stays open for the final drain at reap time.
    pub fn read_cmd_output(&mut self, sheriff_id: i32) {
        let outcome = match self.cmds.get_mut(sheriff_id) {
            Some(cmd) => cmd.read_output(),
            None => return,
        };
        match outcome {
            ReadOutcome::Data(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.send_printf(sheriff_id, &text);
            }
            ReadOutcome::Eof => {
                debug!("end of output from command {}", sheriff_id);
                if let Some(cmd) = self.cmds.get_mut(sheriff_id) {
                    cmd.unwatch_output();
                }
            }
            ReadOutcome::WouldBlock | ReadOutcome::Closed => (),
            ReadOutcome::ReadErr(e) => {
                let err = Error::PipeRead(e);
                warn!("command {}: {}", sheriff_id, err);
                self.send_printf(sheriff_id, &format!("{}\n", err));
                if let Some(cmd) = self.cmds.get_mut(sheriff_id) {
                    cmd.unwatch_output();
                }
            }
        }
    }

    /// Non-blocking sweep for terminated children. Each reaped command
    /// gets a final pipe drain before its fd is closed; commands the
    /// reconciler already culled are deleted here. Returns whether
    /// anything was reaped (an info broadcast follows if so).
    pub fn reap_dead(&mut self) -> bool {
        let mut reaped: Vec<(i32, String, c_int, bool, Vec<u8>)> = Vec::new();
        for id in self.cmds.ids() {
            let cmd = match self.cmds.get_mut(id) {
                Some(cmd) => cmd,
                None => continue,
            };
            if !cmd.is_running() {
                continue;
            }
            let status = match os::try_wait(cmd.pid()) {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    // Treat a failed wait like an exited child; leaving
                    // the command "running" forever would wedge it.
                    warn!("unable to wait for command {}: {}", id, e);
                    0
                }
            };
            let remaining = cmd.drain_output();
            cmd.close_output();
            cmd.mark_reaped(status);
            reaped.push((
                id,
                cmd.nickname().to_string(),
                status,
                cmd.remove_requested(),
                remaining,
            ));
        }
        if reaped.is_empty() {
            return false;
        }
        for (id, nickname, status, remove, remaining) in reaped {
            if !remaining.is_empty() {
                let text = String::from_utf8_lossy(&remaining).into_owned();
                self.send_printf(id, &text);
            }
            if libc::WIFSIGNALED(status) {
                let signal = libc::WTERMSIG(status);
                self.send_printf(id, &format!("Stopped (signal {})\n", signal));
                if libc::WCOREDUMP(status) {
                    self.send_printf(id, "Core dumped.\n");
                }
            } else if libc::WIFEXITED(status) {
                debug!(
                    "[{}] exited with status {}",
                    nickname,
                    libc::WEXITSTATUS(status)
                );
            }
            if remove {
                outputln!("[{}] removed", nickname);
                self.cmds.remove(id);
            }
        }
        self.send_info();
        true
    }

    /// Publish one line of output or status text on the command's
    /// behalf; in verbose mode the text is echoed to our own stderr.
    pub fn send_printf(&mut self, sheriff_id: i32, text: &str) {
        if self.verbose {
            let _ = write!(io::stderr(), "{}", text);
        }
        let msg = PrintfMessage {
            utime: timestamp_now(),
            deputy_name: self.hostname.clone(),
            sheriff_id: sheriff_id,
            text: text.to_string(),
        };
        if let Err(e) = self.bus.publish_printf(&msg) {
            warn!("unable to publish printf: {}", e);
        }
    }

    /// Broadcast the full observed state.
    pub fn send_info(&mut self) {
        let msg = self.build_info();
        if let Err(e) = self.bus.publish_info(&msg) {
            warn!("unable to publish info: {}", e);
        }
    }

    fn build_info(&self) -> InfoMessage {
        let mut cmds: Vec<CmdStatus> = Vec::with_capacity(self.cmds.len());
        for id in self.cmds.ids() {
            let cmd = match self.cmds.get(id) {
                Some(cmd) => cmd,
                None => continue,
            };
            cmds.push(CmdStatus {
                exec_str: cmd.exec_str().to_string(),
                nickname: cmd.nickname().to_string(),
                group: cmd.group().to_string(),
                actual_runid: cmd.actual_runid(),
                pid: cmd.pid() as i32,
                exit_code: cmd.exit_status(),
                sheriff_id: cmd.sheriff_id(),
                cpu_usage: cmd.cpu_usage(),
                mem_vsize_bytes: cmd.last_status().vsize as i64,
                mem_rss_bytes: cmd.last_status().rss as i64,
            });
        }
        InfoMessage {
            utime: timestamp_now(),
            host: self.hostname.clone(),
            cpu_load: self.cpu_load,
            phys_mem_total_bytes: self.sys_cur.memtotal as i64,
            phys_mem_free_bytes: self.sys_cur.memfree as i64,
            swap_total_bytes: self.sys_cur.swaptotal as i64,
            swap_free_bytes: self.sys_cur.swapfree as i64,
            cmds: cmds,
        }
    }

    /// Refresh the host snapshot and every running command's usage for
    /// one sample interval. Probe failures substitute zeros.
    pub fn update_resources(&mut self) {
        let cur = match probe::read_system() {
            Ok(status) => status,
            Err(e) => {
                debug!("system resource probe failed: {}", e);
                Default::default()
            }
        };
        self.sys_prev = self.sys_cur;
        self.sys_cur = cur;
        self.cpu_load = probe::cpu_load(&self.sys_prev, &self.sys_cur);
        let elapsed = probe::elapsed_jiffies(&self.sys_prev, &self.sys_cur);
        for (_, cmd) in self.cmds.iter_mut() {
            cmd.update_usage(elapsed);
        }
    }

    /// Periodic self-accounting checkpoint; resets the per-interval
    /// counters.
    fn mark(&mut self) {
        let own = match probe::read_process(self.pid) {
            Ok(status) => status,
            Err(e) => {
                debug!("self probe failed: {}", e);
                Default::default()
            }
        };
        let mut sheriffs: Vec<&str> =
            self.observed_sheriffs.iter().map(|s| s.as_str()).collect();
        sheriffs.sort();
        outputln!(
            "MARK - rss: {} kB vsz: {} kB, {} commands ({} running), \
             {} orders seen, {} for me, {} stale, sheriffs: [{}], last: {}",
            own.rss / 1024,
            own.vsize / 1024,
            self.cmds.len(),
            self.cmds.running_count(),
            self.orders_seen,
            self.orders_for_me,
            self.stale_orders,
            sheriffs.join(", "),
            self.last_sheriff_name
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("-")
        );
        self.orders_seen = 0;
        self.orders_for_me = 0;
        self.stale_orders = 0;
        self.observed_sheriffs.clear();
    }

    fn shutdown(&mut self) {
        outputln!("removing all commands");
        self.cmds.remove_all();
        if let Err(e) = self.bus.unsubscribe() {
            warn!("unable to unsubscribe from orders: {}", e);
        }
    }
}

fn pollfd(fd: ::std::os::unix::io::RawFd) -> libc::pollfd {
    libc::pollfd {
        fd: fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

fn readable(fd: &libc::pollfd) -> bool {
    fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
}

/// Wall clock in microseconds since the epoch, the timestamp every bus
/// message carries.
pub fn timestamp_now() -> i64 {
    let now = time::get_time();
    now.sec * 1_000_000 + (now.nsec as i64) / 1_000
}
