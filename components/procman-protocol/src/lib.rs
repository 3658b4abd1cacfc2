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

//! Message types exchanged between a sheriff and its deputies, plus the
//! framing and codec used to put them on the bus.
//!
//! A frame is the channel name, a NUL byte, and a bincode-encoded body.
//! Subscribers filter on the channel-name prefix.

extern crate bincode;
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod error;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use error::{Error, Result};

/// Channel carrying `OrdersMessage` from sheriffs to deputies.
pub const ORDERS_CHANNEL: &'static str = "PMD_ORDERS";
/// Channel carrying `InfoMessage` from deputies to sheriffs.
pub const INFO_CHANNEL: &'static str = "PMD_INFO";
/// Channel carrying `PrintfMessage` from deputies to sheriffs.
pub const PRINTF_CHANNEL: &'static str = "PMD_PRINTF";

/// Orders older than this (against the receiver's wall clock, in
/// microseconds) are rejected rather than acted on.
pub const MAX_MESSAGE_AGE_USEC: i64 = 10_000_000;

/// The authoritative desired-state snapshot for one host. A deputy obeys
/// only orders whose `host` matches its own name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrdersMessage {
    /// Sender's wall clock, microseconds since the epoch.
    pub utime: i64,
    pub host: String,
    pub sheriff_name: String,
    pub cmds: Vec<CmdOrder>,
}

/// One desired command within an orders snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdOrder {
    /// Argv-equivalent command text.
    pub exec_str: String,
    pub nickname: String,
    pub group: String,
    /// Monotonic token; bumping it requests a stop-then-start cycle.
    pub desired_runid: i64,
    /// Request a stopped terminal state regardless of runid.
    pub force_quit: bool,
    /// Stable identity chosen by the sheriff, unique within a deputy.
    pub sheriff_id: i32,
}

/// Periodic observed-state broadcast from one deputy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub utime: i64,
    pub host: String,
    /// Host CPU load over the last sample interval, 0.0 - 1.0.
    pub cpu_load: f32,
    pub phys_mem_total_bytes: i64,
    pub phys_mem_free_bytes: i64,
    pub swap_total_bytes: i64,
    pub swap_free_bytes: i64,
    pub cmds: Vec<CmdStatus>,
}

/// Observed state of one managed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdStatus {
    pub exec_str: String,
    pub nickname: String,
    pub group: String,
    pub actual_runid: i64,
    /// 0 when the command is not running.
    pub pid: i32,
    /// Raw wait status; meaningful only after the command has terminated.
    pub exit_code: i32,
    pub sheriff_id: i32,
    pub cpu_usage: f32,
    pub mem_vsize_bytes: i64,
    pub mem_rss_bytes: i64,
}

/// Output or status text attributed to one command (`sheriff_id` 0 for
/// text not tied to any command).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintfMessage {
    pub utime: i64,
    pub deputy_name: String,
    pub sheriff_id: i32,
    pub text: String,
}

/// Encode a message into a channel-prefixed frame.
pub fn encode<T>(channel: &str, msg: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    let body = bincode::serialize(msg)?;
    let mut frame = Vec::with_capacity(channel.len() + 1 + body.len());
    frame.extend_from_slice(channel.as_bytes());
    frame.push(0);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Split a frame into its channel name and body.
pub fn split_frame(frame: &[u8]) -> Result<(&str, &[u8])> {
    let sep = match frame.iter().position(|&b| b == 0) {
        Some(pos) => pos,
        None => return Err(Error::MalformedFrame),
    };
    let channel = match ::std::str::from_utf8(&frame[..sep]) {
        Ok(name) => name,
        Err(_) => return Err(Error::BadChannelName),
    };
    Ok((channel, &frame[sep + 1..]))
}

/// Decode a frame body produced by `encode`.
pub fn decode<T>(body: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    Ok(bincode::deserialize(body)?)
}
