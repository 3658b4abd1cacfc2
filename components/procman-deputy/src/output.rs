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

//! Operator-facing output lines. Each module declares a `LOGKEY` that
//! `outputln!` picks up at the call site, so a line can be traced back to
//! the subsystem that wrote it.

use std::fmt;

/// Print one program-prefixed line to stdout. Stdout is line-buffered, so
/// each call is flushed whole even when redirected to a log file.
pub fn println(logkey: &str, content: fmt::Arguments) {
    println!("{}({}): {}", ::PROGRAM_NAME, logkey, content);
}

#[macro_export]
macro_rules! outputln {
    ($($arg:tt)*) => ({
        $crate::output::println(LOGKEY, format_args!($($arg)*))
    })
}
