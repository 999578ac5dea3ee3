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

//! Server startup: listeners, workers, and the event loop.
//!
//! The listening sockets are bound once, before any fork, so every
//! worker process accepts from the same queues. Each worker runs its
//! own reactor; there is no shared memory between them, and mailbox
//! state stays coherent through the database and its notifications.

use std::fs;
use std::io::Write as _;

use log::info;

use crate::db::pool;
use crate::db::query::Query;
use crate::server::listener::Listener;
use crate::server::reactor::{self, Reactor};
use crate::server::task::Task;
use crate::store::{cache, interner, mailbox};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

pub fn run(config: SystemConfig, fork: bool) -> Result<(), Error> {
    if fork {
        daemonise()?;
    }

    write_pid_file(&config)?;

    pool::configure(config.database.clone());

    // Bind everything before forking workers so all of them share the
    // accept queues.
    let hostname = config.hostname.clone();
    let tls = config.tls_helper.clone();
    Listener::spawn(
        &config.listen.imap,
        "imap",
        crate::imap::server::acceptor(hostname.clone(), tls.clone()),
    )?;
    Listener::spawn(
        &config.listen.pop3,
        "pop3",
        crate::pop::server::acceptor(),
    )?;
    Listener::spawn(
        &config.listen.lmtp,
        "lmtp",
        crate::smtp::server::acceptor(hostname.clone(), true),
    )?;
    Listener::spawn(
        &config.listen.managesieve,
        "managesieve",
        crate::sieve::managesieve::acceptor(hostname, tls),
    )?;

    fork_workers(config.server.processes)?;

    // Per-worker state: database handles, the interning tables, the
    // mailbox registry.
    pool::warm_up();
    reactor::register_idle_hook(Box::new(pool::maintain));
    cache::register(interner::invalidate);
    cache::register(mailbox::invalidate);

    let boot_prefix =
        LogPrefix::new("startup", format!("{}", std::process::id()));
    interner::setup(boot_prefix.clone());
    load_mailboxes(boot_prefix);

    info!("Oryx {} ready", env!("CARGO_PKG_VERSION"));
    Reactor::new(config.server.shutdown_grace_secs)?.run();

    Ok(())
}

/// Loads the mailbox tree into the registry; refreshed thereafter via
/// notifications and on demand.
fn load_mailboxes(log_prefix: LogPrefix) {
    let query = Query::new(
        "select id, name, owner, uidnext, uidvalidity, nextmodseq \
         from mailboxes where not deleted",
    );
    let q = query.clone();
    let task = Task::new(log_prefix, move || {
        while let Some(row) = q.next_row() {
            mailbox::obtain(
                row.uint("id").unwrap_or(0),
                &row.text("name").unwrap_or_default(),
                row.uint("owner"),
                row.uint("uidnext").unwrap_or(1),
                row.uint("uidvalidity").unwrap_or(1),
                row.bigint("nextmodseq").unwrap_or(1) as u64,
            );
        }
    });
    query.execute(Some(task));
}

fn write_pid_file(config: &SystemConfig) -> Result<(), Error> {
    let path = config
        .server
        .piddir
        .join(concat!(env!("CARGO_PKG_NAME"), ".pid"));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// Double-fork into the background.
fn daemonise() -> Result<(), Error> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => (),
    }
    setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => (),
    }

    nix::unistd::chdir("/")?;
    let devnull = nix::fcntl::open(
        "/dev/null",
        nix::fcntl::OFlag::O_RDWR,
        nix::sys::stat::Mode::empty(),
    )?;
    nix::unistd::dup2(devnull, 0)?;
    nix::unistd::dup2(devnull, 1)?;
    nix::unistd::dup2(devnull, 2)?;
    if devnull > 2 {
        nix::unistd::close(devnull)?;
    }
    Ok(())
}

/// Forks `processes - 1` children; all of them (and the parent) serve
/// from the inherited listening sockets.
fn fork_workers(processes: u32) -> Result<(), Error> {
    use nix::unistd::{fork, ForkResult};

    for _ in 1..processes.max(1) {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                info!("forked worker {}", child);
            },
            ForkResult::Child => {
                // Children escape the loop and serve.
                break;
            },
        }
    }
    Ok(())
}
