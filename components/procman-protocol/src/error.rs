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
use std::result;

use bincode;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A message body failed to serialize or deserialize.
    Codec(bincode::Error),
    /// A frame arrived without a channel/body separator.
    MalformedFrame,
    /// A frame's channel name was not valid UTF-8.
    BadChannelName,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Codec(ref e) => write!(f, "unable to encode or decode message, {}", e),
            Error::MalformedFrame => write!(f, "frame is missing a channel separator"),
            Error::BadChannelName => write!(f, "frame channel name is not valid UTF-8"),
        }
    }
}

impl error::Error for Error {}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Error {
        Error::Codec(err)
    }
}
