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

//! A managed command and the table of all commands this deputy owns.
//! Commands are created by the reconciler, mutated by the supervisor
//! paths, and destroyed on cull or after their final reap.

use std::collections::HashMap;
use std::collections::hash_map;
use std::io;
use std::os::unix::io::RawFd;

use libc::{self, c_int};
use time::{Duration, SteadyTime};

use error::{Error, Result};
use os::{self, Pid};
use probe::{self, ProcessStatus};

/// Minimum interval between two signals sent by the stop escalation.
pub const MIN_KILL_INTERVAL_MS: i64 = 900;
/// Stop attempts delivered as SIGTERM before escalating to SIGKILL.
pub const TERM_ATTEMPTS: u32 = 5;

const OUTPUT_BUF_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessState {
    Stopped,
    Running,
}

/// One read attempt against a command's output pipe.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    WouldBlock,
    /// The pipe is already closed or was never opened.
    Closed,
    ReadErr(io::Error),
}

/// Pick the signal for the next stop attempt: five SIGTERMs, then
/// SIGKILL from the sixth attempt on.
pub fn escalation_signal(num_kills_sent: u32) -> c_int {
    if num_kills_sent >= TERM_ATTEMPTS {
        libc::SIGKILL
    } else {
        libc::SIGTERM
    }
}

/// Split an exec string into an argv. Double and single quotes group
/// words; a backslash escapes the next character outside single quotes.
pub fn parse_command_line(line: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote != Some('\'') => {
                match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_token = true;
                    }
                    None => {
                        return Err(Error::BadCmdLine(format!(
                            "trailing backslash in \"{}\"",
                            line
                        )))
                    }
                }
            }
            '"' | '\'' => {
                if quote == Some(ch) {
                    quote = None;
                } else if quote.is_none() {
                    quote = Some(ch);
                    in_token = true;
                } else {
                    current.push(ch);
                }
            }
            _ if ch.is_whitespace() && quote.is_none() => {
                if in_token {
                    argv.push(current.clone());
                    current.clear();
                    in_token = false;
                }
            }
            _ => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::BadCmdLine(format!("unbalanced quote in \"{}\"", line)));
    }
    if in_token {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(Error::BadCmdLine("empty command".to_string()));
    }
    Ok(argv)
}

pub struct Cmd {
    sheriff_id: i32,
    exec_str: String,
    nickname: String,
    group: String,
    /// Runid of the currently-started instance; 0 until the first
    /// successful start.
    actual_runid: i64,
    /// 0 when no child is alive.
    pid: Pid,
    /// Raw wait status of the last reaped instance.
    exit_status: c_int,
    /// Merged stdout+stderr read end; present only while a child lives
    /// (closed exactly once, on reap).
    stdout_fd: Option<RawFd>,
    /// Whether the pipe should be in the main loop's poll set.
    stdout_watched: bool,
    num_kills_sent: u32,
    last_kill_time: Option<SteadyTime>,
    cpu_usage: f32,
    prev_status: ProcessStatus,
    last_status: ProcessStatus,
    /// Set when the reconciler culled this command while it was still
    /// running; deletion happens after the next reap.
    remove_requested: bool,
}

impl Cmd {
    pub fn new(sheriff_id: i32, exec_str: String, nickname: String, group: String) -> Cmd {
        Cmd {
            sheriff_id: sheriff_id,
            exec_str: exec_str,
            nickname: nickname,
            group: group,
            actual_runid: 0,
            pid: 0,
            exit_status: 0,
            stdout_fd: None,
            stdout_watched: false,
            num_kills_sent: 0,
            last_kill_time: None,
            cpu_usage: 0.0,
            prev_status: Default::default(),
            last_status: Default::default(),
            remove_requested: false,
        }
    }

    pub fn sheriff_id(&self) -> i32 {
        self.sheriff_id
    }

    pub fn exec_str(&self) -> &str {
        &self.exec_str
    }

    pub fn set_exec_str(&mut self, exec_str: String) {
        self.exec_str = exec_str;
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: String) {
        self.nickname = nickname;
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn set_group(&mut self, group: String) {
        self.group = group;
    }

    pub fn actual_runid(&self) -> i64 {
        self.actual_runid
    }

    pub fn set_actual_runid(&mut self, runid: i64) {
        self.actual_runid = runid;
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn exit_status(&self) -> c_int {
        self.exit_status
    }

    pub fn num_kills_sent(&self) -> u32 {
        self.num_kills_sent
    }

    pub fn cpu_usage(&self) -> f32 {
        self.cpu_usage
    }

    pub fn last_status(&self) -> &ProcessStatus {
        &self.last_status
    }

    pub fn remove_requested(&self) -> bool {
        self.remove_requested
    }

    pub fn request_remove(&mut self) {
        self.remove_requested = true;
    }

    pub fn state(&self) -> ProcessState {
        if self.pid == 0 {
            ProcessState::Stopped
        } else {
            ProcessState::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid != 0
    }

    /// The pipe fd the main loop should watch, if any.
    pub fn watched_fd(&self) -> Option<RawFd> {
        if self.stdout_watched {
            self.stdout_fd
        } else {
            None
        }
    }

    /// Spawn a child for this command. On success the command is running
    /// at `runid` with a fresh escalation state and a watched output
    /// pipe. On failure nothing changes, so the next orders message
    /// naturally retries the start.
    pub fn start(&mut self, runid: i64) -> Result<()> {
        if self.pid != 0 {
            return Err(Error::AlreadyRunning(self.sheriff_id));
        }
        let argv = parse_command_line(&self.exec_str)?;
        let (pid, stdout_fd) = os::spawn_merged(&argv).map_err(Error::Spawn)?;
        self.pid = pid;
        self.stdout_fd = Some(stdout_fd);
        self.stdout_watched = true;
        self.actual_runid = runid;
        self.exit_status = 0;
        self.num_kills_sent = 0;
        self.last_kill_time = None;
        self.cpu_usage = 0.0;
        self.prev_status = Default::default();
        self.last_status = Default::default();
        Ok(())
    }

    /// Rate-limited stop escalation. Sends at most one signal per call,
    /// none within `MIN_KILL_INTERVAL_MS` of the previous one, and never
    /// waits for the child to exit. Returns whether a signal was sent.
    pub fn stop(&mut self, now: SteadyTime) -> Result<bool> {
        if self.pid == 0 {
            return Ok(false);
        }
        if let Some(last) = self.last_kill_time {
            if now < last + Duration::milliseconds(MIN_KILL_INTERVAL_MS) {
                return Ok(false);
            }
        }
        let signal = escalation_signal(self.num_kills_sent);
        self.num_kills_sent += 1;
        self.last_kill_time = Some(now);
        os::send_signal(self.pid, signal).map_err(Error::KillFailed)?;
        Ok(true)
    }

    /// Unconditional signal delivery.
    pub fn kill(&mut self, signal: c_int) -> Result<()> {
        if self.pid == 0 {
            return Ok(());
        }
        os::send_signal(self.pid, signal).map_err(Error::KillFailed)
    }

    /// One read attempt against the output pipe.
    pub fn read_output(&mut self) -> ReadOutcome {
        let fd = match self.stdout_fd {
            Some(fd) => fd,
            None => return ReadOutcome::Closed,
        };
        let mut buf = [0u8; OUTPUT_BUF_SIZE];
        match os::read(fd, &mut buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(count) => ReadOutcome::Data(buf[..count].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(e) => ReadOutcome::ReadErr(e),
        }
    }

    /// Stop watching the pipe without closing it; any remaining bytes
    /// are picked up by the final drain at reap time.
    pub fn unwatch_output(&mut self) {
        self.stdout_watched = false;
    }

    /// Pull whatever is left in the pipe, for the final drain before the
    /// fd is closed.
    pub fn drain_output(&mut self) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            match self.read_output() {
                ReadOutcome::Data(bytes) => collected.extend_from_slice(&bytes),
                _ => break,
            }
        }
        collected
    }

    pub fn close_output(&mut self) {
        if let Some(fd) = self.stdout_fd.take() {
            os::close(fd);
        }
        self.stdout_watched = false;
    }

    /// Record a reaped child's exit. The command stays in the table (the
    /// reconciler decides removal) with `pid` 0 and the status kept.
    pub fn mark_reaped(&mut self, status: c_int) {
        self.pid = 0;
        self.exit_status = status;
        self.cpu_usage = 0.0;
        self.prev_status = Default::default();
        self.last_status = Default::default();
    }

    /// Refresh this command's CPU/memory accounting for one host sample
    /// interval. Probe failures zero the sample rather than abort.
    pub fn update_usage(&mut self, elapsed_jiffies: i64) {
        if self.pid == 0 {
            self.cpu_usage = 0.0;
            return;
        }
        match probe::read_process(self.pid) {
            Ok(status) => {
                self.prev_status = self.last_status;
                self.last_status = status;
                self.cpu_usage =
                    probe::process_cpu_usage(&self.prev_status, &self.last_status, elapsed_jiffies);
            }
            Err(e) => {
                debug!("resource probe failed for pid {}: {}", self.pid, e);
                self.cpu_usage = 0.0;
                self.prev_status = Default::default();
                self.last_status = Default::default();
            }
        }
    }
}

#[derive(Default)]
pub struct CmdTable {
    cmds: HashMap<i32, Cmd>,
}

impl CmdTable {
    pub fn new() -> CmdTable {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn contains(&self, sheriff_id: i32) -> bool {
        self.cmds.contains_key(&sheriff_id)
    }

    pub fn get(&self, sheriff_id: i32) -> Option<&Cmd> {
        self.cmds.get(&sheriff_id)
    }

    pub fn get_mut(&mut self, sheriff_id: i32) -> Option<&mut Cmd> {
        self.cmds.get_mut(&sheriff_id)
    }

    pub fn insert(&mut self, cmd: Cmd) {
        self.cmds.insert(cmd.sheriff_id(), cmd);
    }

    pub fn remove(&mut self, sheriff_id: i32) -> Option<Cmd> {
        self.cmds.remove(&sheriff_id)
    }

    /// Sheriff ids in stable order, for the two-pass mutation patterns.
    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.cmds.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> hash_map::Iter<i32, Cmd> {
        self.cmds.iter()
    }

    pub fn iter_mut(&mut self) -> hash_map::IterMut<i32, Cmd> {
        self.cmds.iter_mut()
    }

    pub fn running_count(&self) -> usize {
        self.cmds.values().filter(|cmd| cmd.is_running()).count()
    }

    /// Shutdown path: one SIGTERM to every live child, close every pipe,
    /// forget every command.
    pub fn remove_all(&mut self) {
        for (_, cmd) in self.cmds.iter_mut() {
            if cmd.is_running() {
                if let Err(e) = cmd.kill(libc::SIGTERM) {
                    warn!("unable to stop command {}: {}", cmd.sheriff_id(), e);
                }
            }
            cmd.close_output();
        }
        self.cmds.clear();
    }
}

#[cfg(test)]
mod tests {
    use libc;
    use time::{Duration, SteadyTime};

    use super::*;
    use error::Error;
    use os;

    #[test]
    fn command_lines_split_on_whitespace() {
        let argv = parse_command_line("/bin/echo one  two\tthree").unwrap();
        assert_eq!(argv, vec!["/bin/echo", "one", "two", "three"]);
    }

    #[test]
    fn quotes_group_words_and_nest() {
        let argv = parse_command_line("/bin/sh -c \"trap '' TERM; sleep 30\"").unwrap();
        assert_eq!(
            argv,
            vec!["/bin/sh", "-c", "trap '' TERM; sleep 30"]
        );
    }

    #[test]
    fn backslash_escapes_the_next_character() {
        let argv = parse_command_line("/bin/echo a\\ b \\\"c").unwrap();
        assert_eq!(argv, vec!["/bin/echo", "a b", "\"c"]);
    }

    #[test]
    fn empty_and_unbalanced_lines_are_rejected() {
        assert!(parse_command_line("   ").is_err());
        assert!(parse_command_line("/bin/echo \"oops").is_err());
        assert!(parse_command_line("/bin/echo oops\\").is_err());
    }

    #[test]
    fn escalation_sends_five_terms_then_kill() {
        for attempt in 0..TERM_ATTEMPTS {
            assert_eq!(escalation_signal(attempt), libc::SIGTERM);
        }
        assert_eq!(escalation_signal(TERM_ATTEMPTS), libc::SIGKILL);
        assert_eq!(escalation_signal(TERM_ATTEMPTS + 1), libc::SIGKILL);
    }

    #[test]
    fn spawn_failure_leaves_the_command_stopped() {
        let mut cmd = Cmd::new(
            3,
            "/no/such/binary --flag".to_string(),
            "broken".to_string(),
            "g".to_string(),
        );
        match cmd.start(5) {
            Err(Error::Spawn(_)) => (),
            Ok(()) => panic!("start unexpectedly succeeded"),
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert_eq!(cmd.pid(), 0);
        assert_eq!(cmd.actual_runid(), 0);
        assert!(cmd.watched_fd().is_none());
    }

    #[test]
    fn stop_is_rate_limited_and_escalates_to_sigkill() {
        let mut cmd = Cmd::new(
            4,
            "/bin/sh -c \"trap '' TERM; exec sleep 30\"".to_string(),
            "stubborn".to_string(),
            "g".to_string(),
        );
        cmd.start(1).unwrap();
        assert!(cmd.is_running());
        // Give the shell time to set the trap before the first TERM.
        ::std::thread::sleep(::std::time::Duration::from_millis(300));

        let t0 = SteadyTime::now();
        assert!(cmd.stop(t0).unwrap());
        assert!(!cmd.stop(t0 + Duration::milliseconds(100)).unwrap());
        assert_eq!(cmd.num_kills_sent(), 1);
        for attempt in 1..5 {
            assert!(cmd.stop(t0 + Duration::seconds(attempt)).unwrap());
        }
        assert_eq!(cmd.num_kills_sent(), 5);
        // The child ignores TERM, so it must still be alive.
        assert!(os::try_wait(cmd.pid()).unwrap().is_none());

        // Sixth signal is the SIGKILL.
        assert!(cmd.stop(t0 + Duration::seconds(6)).unwrap());
        let status = loop {
            match os::try_wait(cmd.pid()).unwrap() {
                Some(status) => break status,
                None => ::std::thread::sleep(::std::time::Duration::from_millis(10)),
            }
        };
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
        cmd.close_output();
    }

    #[test]
    fn remove_all_clears_the_table_and_stops_children() {
        let mut table = CmdTable::new();
        let mut cmd = Cmd::new(
            9,
            "/bin/sleep 30".to_string(),
            "s".to_string(),
            "g".to_string(),
        );
        cmd.start(1).unwrap();
        let pid = cmd.pid();
        table.insert(cmd);
        table.remove_all();
        assert_eq!(table.len(), 0);
        let status = loop {
            match os::try_wait(pid).unwrap() {
                Some(status) => break status,
                None => ::std::thread::sleep(::std::time::Duration::from_millis(10)),
            }
        };
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);
    }
}
