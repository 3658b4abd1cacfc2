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

use std::error;
use std::fmt;
use std::io;
use std::result;

use procfs;
use protocol;
use zmq;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A command was asked to start while its child was still alive.
    AlreadyRunning(i32),
    /// A command's exec string could not be tokenized into an argv.
    BadCmdLine(String),
    /// The bus transport reported an error.
    Bus(zmq::Error),
    /// A message failed to encode or decode.
    Codec(protocol::Error),
    /// Delivering a signal to a child failed.
    KillFailed(io::Error),
    /// Redirecting output to the requested log file failed.
    LogFile(io::Error),
    /// Reading a child's output pipe failed.
    PipeRead(io::Error),
    /// The main loop's multiplexing wait failed.
    Poll(io::Error),
    /// Reading a resource snapshot from the OS failed.
    Probe(procfs::ProcError),
    /// Installing the signal bridge failed.
    Signals(io::Error),
    /// Spawning a child process failed.
    Spawn(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::AlreadyRunning(id) => {
                write!(f, "command {} is already running", id)
            }
            Error::BadCmdLine(ref s) => write!(f, "malformed command line: {}", s),
            Error::Bus(ref e) => write!(f, "bus error, {}", e),
            Error::Codec(ref e) => write!(f, "message codec error, {}", e),
            Error::KillFailed(ref e) => write!(f, "unable to signal child, {}", e),
            Error::LogFile(ref e) => write!(f, "unable to open log file, {}", e),
            Error::PipeRead(ref e) => write!(f, "unable to read child output, {}", e),
            Error::Poll(ref e) => write!(f, "main loop wait failed, {}", e),
            Error::Probe(ref e) => write!(f, "resource probe failed, {}", e),
            Error::Signals(ref e) => write!(f, "unable to install signal bridge, {}", e),
            Error::Spawn(ref e) => write!(f, "unable to spawn child, {}", e),
        }
    }
}

impl error::Error for Error {}

impl From<zmq::Error> for Error {
    fn from(err: zmq::Error) -> Error {
        Error::Bus(err)
    }
}

impl From<protocol::Error> for Error {
    fn from(err: protocol::Error) -> Error {
        Error::Codec(err)
    }
}

impl From<procfs::ProcError> for Error {
    fn from(err: procfs::ProcError) -> Error {
        Error::Probe(err)
    }
}
