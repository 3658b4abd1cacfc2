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

//! One-shot snapshots of system and per-process resource counters. The
//! probe is stateless; whoever keeps the previous snapshot computes the
//! deltas with the pure functions below.

use procfs::{self, Current, CurrentSI};

use error::Result;
use os::Pid;

/// Host-wide memory (bytes) and CPU (jiffy) counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemStatus {
    pub memtotal: u64,
    pub memfree: u64,
    pub swaptotal: u64,
    pub swapfree: u64,
    pub user: i64,
    pub user_low: i64,
    pub system: i64,
    pub idle: i64,
}

/// Per-process CPU (jiffy) and memory (byte) counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessStatus {
    pub user: i64,
    pub system: i64,
    pub vsize: u64,
    pub rss: u64,
}

pub fn read_system() -> Result<SystemStatus> {
    let meminfo = procfs::Meminfo::current()?;
    let stat = procfs::KernelStats::current()?;
    let cpu = stat.total;
    Ok(SystemStatus {
        memtotal: meminfo.mem_total,
        memfree: meminfo.mem_free,
        swaptotal: meminfo.swap_total,
        swapfree: meminfo.swap_free,
        user: cpu.user as i64,
        user_low: cpu.nice as i64,
        system: cpu.system as i64,
        idle: cpu.idle as i64,
    })
}

pub fn read_process(pid: Pid) -> Result<ProcessStatus> {
    let stat = procfs::process::Process::new(pid)?.stat()?;
    Ok(ProcessStatus {
        user: stat.utime as i64,
        system: stat.stime as i64,
        vsize: stat.vsize,
        rss: stat.rss as u64 * procfs::page_size(),
    })
}

/// Total jiffies the host spent between two snapshots.
pub fn elapsed_jiffies(prev: &SystemStatus, cur: &SystemStatus) -> i64 {
    (cur.user - prev.user) + (cur.user_low - prev.user_low) + (cur.system - prev.system)
        + (cur.idle - prev.idle)
}

/// Host CPU load between two snapshots, 0.0 - 1.0.
pub fn cpu_load(prev: &SystemStatus, cur: &SystemStatus) -> f32 {
    let elapsed = elapsed_jiffies(prev, cur);
    if elapsed == 0 {
        return 0.0;
    }
    let loaded =
        (cur.user - prev.user) + (cur.user_low - prev.user_low) + (cur.system - prev.system);
    loaded as f32 / elapsed as f32
}

/// One process's share of the host jiffies spent between two snapshots.
/// Zero until the process has two real samples behind it.
pub fn process_cpu_usage(prev: &ProcessStatus, cur: &ProcessStatus, elapsed: i64) -> f32 {
    if elapsed == 0 || (prev.user == 0 && prev.system == 0) {
        return 0.0;
    }
    let used = (cur.user - prev.user) + (cur.system - prev.system);
    used as f32 / elapsed as f32
}
