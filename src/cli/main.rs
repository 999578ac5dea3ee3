//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Oryx.
//
// Oryx is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Oryx is distributed  in the hope  that it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Oryx. If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::path::PathBuf;
use std::process::exit;

use structopt::StructOpt;

use crate::support::system_config::SystemConfig;

/// The Oryx mail store.
///
/// Serves IMAP, POP3, LMTP and ManageSieve out of a PostgreSQL
/// database.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The configuration file.
    #[structopt(short = "c", parse(from_os_str))]
    config: PathBuf,

    /// Fork into the background after startup.
    #[structopt(short = "f")]
    fork: bool,
}

pub fn main() {
    let options = Options::from_args();

    let raw = match fs::read(&options.config) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!(
                "Error reading '{}': {}",
                options.config.display(),
                e,
            );
            exit(1);
        },
    };
    let config: SystemConfig = match toml::from_slice(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Error in config file at '{}': {}",
                options.config.display(),
                e,
            );
            exit(1);
        },
    };

    init_logging();

    if let Err(e) = super::serve::run(config, options.fork) {
        eprintln!("Startup failed: {}", e);
        exit(1);
    }
}

fn init_logging() {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; just write to stderr.
        crate::init_simple_log();
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        match syslog::unix(formatter) {
            Ok(logger) => {
                let _ = log::set_boxed_logger(Box::new(
                    syslog::BasicLogger::new(logger),
                ))
                .map(|_| {
                    log::set_max_level(log::LevelFilter::Info)
                });
            },
            Err(e) => {
                eprintln!("Failed to connect to syslog: {}", e);
                crate::init_simple_log();
            },
        }
    }
}
