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

#[macro_use]
extern crate clap;
extern crate env_logger;
extern crate gethostname;
extern crate procman_deputy;

use std::io::{self, Write};
use std::process;

use clap::{App, ErrorKind};

use procman_deputy::VERSION;
use procman_deputy::bus::{ZmqBus, DEFAULT_BUS_URL};
use procman_deputy::deputy::Deputy;
use procman_deputy::error::{Error, Result};
use procman_deputy::os;

fn main() {
    if let Err(err) = start() {
        println!("{}", err);
        process::exit(1);
    }
}

fn start() -> Result<()> {
    let matches = match cli().get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => {
            match err.kind {
                // -h and -V land here as well; they are not usage errors.
                ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => {
                    println!("{}", err.message);
                    process::exit(0);
                }
                _ => {
                    let err_out = io::stderr();
                    writeln!(&mut err_out.lock(), "{}", err.message)
                        .expect("Error writing to stderr");
                    process::exit(1);
                }
            }
        }
    };
    // Redirect before anything writes, so the log file gets everything.
    if let Some(path) = matches.value_of("LOGFILE") {
        os::redirect_stdio(path).map_err(Error::LogFile)?;
    }
    env_logger::init().unwrap();
    let hostname = match matches.value_of("NAME") {
        Some(name) => name.to_string(),
        None => gethostname::gethostname().to_string_lossy().into_owned(),
    };
    let url = matches.value_of("LCM_URL").unwrap_or(DEFAULT_BUS_URL);
    let bus = ZmqBus::new(url)?;
    let mut deputy = Deputy::new(hostname, matches.is_present("VERBOSE"), bus);
    deputy.run()
}

fn cli<'a, 'b>() -> App<'a, 'b> {
    clap_app!(("procman-deputy") =>
        (about: "Process-management deputy; obeys orders published by a sheriff")
        (version: VERSION)
        (author: "\nAuthors: The Habitat Maintainers <humans@habitat.sh>\n")
        (@arg VERBOSE: -v --verbose "Echo forwarded command output to stderr")
        (@arg NAME: -n --name +takes_value
            "Deputy name; defaults to the system hostname")
        (@arg LOGFILE: -l --log +takes_value
            "Redirect stdout and stderr to this file (append, line-buffered)")
        (@arg LCM_URL: -u --lcmurl +takes_value
            "Bus transport URL, passed opaquely to the bus library")
    )
}
