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

//! The procman deputy: a per-host supervision daemon that obeys orders
//! published on the bus by a sheriff, keeps the local set of child
//! processes converged on those orders, forwards child output, and
//! broadcasts observed state.

extern crate libc;
#[macro_use]
extern crate log;
extern crate procfs;
extern crate procman_protocol as protocol;
extern crate time;
extern crate zmq;

#[macro_use]
pub mod output;
pub mod bus;
pub mod cmd;
pub mod deputy;
pub mod error;
pub mod os;
pub mod probe;
pub mod signals;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Program name used in output preambles and on the bus.
pub const PROGRAM_NAME: &'static str = "procman-deputy";
