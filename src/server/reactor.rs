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

//! The single-threaded readiness loop which drives everything.
//!
//! The reactor owns every `Connection`, paired with the `Client` holding
//! the protocol logic for it. Each iteration polls all the sockets,
//! dispatches `Read`/`Write`/`Connect`/`Close`/`Error`/`Timeout` events,
//! runs any tasks that became runnable, and flushes write buffers. A
//! connection with a non-empty write buffer stays write-armed.
//!
//! All handlers run on this one thread and must not block. An error
//! escaping a handler aborts only that connection: it is logged and the
//! connection is closed.
//!
//! SIGINT and SIGTERM are turned into an orderly shutdown via the self-pipe
//! trick: listeners are dropped first so no new connections arrive, live
//! sessions get a grace window to finish, and then everything is closed.

use std::cell::{Cell, RefCell};
use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::server::connection::{
    ConnKind, ConnState, Connection, FillOutcome,
};
use crate::server::task;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
    Connect,
    Close,
    Error,
    Timeout,
    Shutdown,
}

/// Protocol logic attached to one `Connection`.
///
/// Implementations hold their own `Rc<RefCell<Connection>>`; the reactor
/// guarantees it is not borrowing the connection while `react` runs.
pub trait Client {
    fn react(&mut self, event: Event) -> Result<(), Error>;

    /// Called exactly once when the reactor destroys the connection. No
    /// event is delivered afterwards. Implementations cancel their
    /// outstanding tasks here.
    fn on_destroy(&mut self) {}
}

#[derive(Clone)]
pub struct Handle {
    pub conn: Rc<RefCell<Connection>>,
    pub client: Rc<RefCell<dyn Client>>,
}

thread_local! {
    static PENDING: RefCell<Vec<Handle>> = RefCell::new(Vec::new());
    static IDLE_HOOKS: RefCell<Vec<Box<dyn FnMut()>>> =
        RefCell::new(Vec::new());
    static STOPPING: Cell<bool> = Cell::new(false);
}

/// Hands a new connection to the running reactor.
///
/// May be called from inside any handler; the connection joins the loop on
/// the current iteration's way out.
pub fn register(
    conn: Rc<RefCell<Connection>>,
    client: Rc<RefCell<dyn Client>>,
) {
    debug!(
        "{} added to event loop",
        conn.borrow().log_prefix(),
    );
    PENDING.with(|p| p.borrow_mut().push(Handle { conn, client }));
}

/// Registers a hook run once per loop iteration, used for periodic
/// housekeeping such as database pool maintenance.
pub fn register_idle_hook(hook: Box<dyn FnMut()>) {
    IDLE_HOOKS.with(|h| h.borrow_mut().push(hook));
}

/// Requests an orderly shutdown, as if SIGTERM had arrived.
pub fn shutdown() {
    STOPPING.with(|s| s.set(true));
}

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_fatal_signal(_: nix::libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let _ = nix::unistd::write(fd, b"s");
    }
}

pub struct Reactor {
    handles: Vec<Handle>,
    signal_read: RawFd,
    shutdown_at: Option<Instant>,
    grace: Duration,
}

impl Reactor {
    /// Creates the reactor and installs signal handling: SIGINT/SIGTERM
    /// start shutdown, SIGHUP and SIGPIPE are ignored.
    pub fn new(grace_secs: u32) -> Result<Self, Error> {
        let (signal_read, signal_write) = nix::unistd::pipe()?;
        SIGNAL_PIPE_WRITE.store(signal_write, Ordering::Relaxed);

        use nix::sys::signal::*;
        let shutdown_action = SigAction::new(
            SigHandler::Handler(on_fatal_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore =
            SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            sigaction(Signal::SIGINT, &shutdown_action)?;
            sigaction(Signal::SIGTERM, &shutdown_action)?;
            sigaction(Signal::SIGHUP, &ignore)?;
            sigaction(Signal::SIGPIPE, &ignore)?;
        }

        Ok(Reactor {
            handles: Vec::new(),
            signal_read,
            shutdown_at: None,
            grace: Duration::from_secs(grace_secs.into()),
        })
    }

    /// Runs until shutdown completes.
    pub fn run(&mut self) {
        loop {
            self.adopt_pending();

            if STOPPING.with(|s| s.get()) && self.shutdown_at.is_none() {
                self.begin_shutdown();
            }

            if let Some(at) = self.shutdown_at {
                if self.handles.is_empty() || Instant::now() >= at + self.grace
                {
                    self.destroy_all();
                    return;
                }
            }

            self.step();
            task::run_pending();
            IDLE_HOOKS.with(|hooks| {
                for hook in hooks.borrow_mut().iter_mut() {
                    hook();
                }
            });
        }
    }

    fn adopt_pending(&mut self) {
        PENDING.with(|p| self.handles.append(&mut p.borrow_mut()));
    }

    /// One iteration: poll, dispatch, reap.
    fn step(&mut self) {
        use nix::poll::{poll, PollFd, PollFlags};

        let now = Instant::now();
        let mut fds = Vec::with_capacity(self.handles.len() + 1);
        fds.push(PollFd::new(self.signal_read, PollFlags::POLLIN));

        let mut timeout = Duration::from_secs(1800);
        for handle in &self.handles {
            let conn = handle.conn.borrow();
            let mut interest = PollFlags::empty();
            match conn.state() {
                ConnState::Connected => {
                    interest |= PollFlags::POLLIN;
                },
                ConnState::Connecting => {
                    interest |= PollFlags::POLLOUT;
                },
                _ => (),
            }
            if conn.can_write() {
                interest |= PollFlags::POLLOUT;
            }
            if let Some(deadline) = conn.deadline() {
                timeout = timeout
                    .min(deadline.saturating_duration_since(now));
            }
            fds.push(PollFd::new(conn.fd(), interest));
        }
        if let Some(at) = self.shutdown_at {
            timeout = timeout
                .min((at + self.grace).saturating_duration_since(now));
        }

        let timeout_ms =
            i32::try_from(timeout.as_millis().max(10)).unwrap_or(i32::MAX);
        match poll(&mut fds, timeout_ms) {
            Ok(_) => (),
            Err(nix::errno::Errno::EINTR) => return,
            Err(e) => {
                error!("poll() failed: {}", e);
                return;
            },
        }

        if fds[0]
            .revents()
            .map_or(false, |r| r.contains(PollFlags::POLLIN))
        {
            let mut byte = [0u8; 16];
            let _ = nix::unistd::read(self.signal_read, &mut byte);
            STOPPING.with(|s| s.set(true));
        }

        let now = Instant::now();
        let revents: Vec<PollFlags> = fds[1..]
            .iter()
            .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
            .collect();

        // Dispatch. New registrations go to PENDING, so iterating by index
        // is safe.
        for (ix, events) in revents.into_iter().enumerate() {
            let handle = self.handles[ix].clone();
            let readable = events
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP);
            let writable = events.contains(PollFlags::POLLOUT);
            let errored = events.contains(PollFlags::POLLERR);
            if let Err(e) =
                self.dispatch(&handle, readable, writable, errored, now)
            {
                error!(
                    "{} aborting connection: {}",
                    handle.conn.borrow().log_prefix(),
                    e,
                );
                handle.conn.borrow_mut().close();
            }
        }

        self.reap();
    }

    fn dispatch(
        &mut self,
        handle: &Handle,
        mut readable: bool,
        mut writable: bool,
        errored: bool,
        now: Instant,
    ) -> Result<(), Error> {
        // A connection's events arrive in dispatch order, and nothing is
        // delivered once it reaches Closed.
        if ConnState::Closed == handle.conn.borrow().state() {
            return Ok(());
        }

        if errored {
            handle.client.borrow_mut().react(Event::Error)?;
            handle.conn.borrow_mut().start_close();
            readable = false;
            writable = false;
        }

        let timed_out = handle
            .conn
            .borrow()
            .deadline()
            .map_or(false, |deadline| now >= deadline);
        if timed_out {
            handle.conn.borrow_mut().clear_timeout();
            handle.client.borrow_mut().react(Event::Timeout)?;
            writable = true;
        }

        if ConnState::Connecting == handle.conn.borrow().state()
            && (readable || writable)
        {
            if socket_error(handle.conn.borrow().fd())? {
                handle.client.borrow_mut().react(Event::Error)?;
                handle.conn.borrow_mut().start_close();
            } else {
                handle.conn.borrow_mut().set_state(ConnState::Connected);
                handle.client.borrow_mut().react(Event::Connect)?;
                writable = true;
            }
        } else if readable
            && ConnState::Connected == handle.conn.borrow().state()
        {
            if ConnKind::Listener == handle.conn.borrow().kind() {
                handle.client.borrow_mut().react(Event::Read)?;
            } else {
                let outcome = handle.conn.borrow_mut().fill()?;
                match outcome {
                    FillOutcome::Progress => {
                        handle.client.borrow_mut().react(Event::Read)?;
                    },
                    FillOutcome::Eof => {
                        handle.client.borrow_mut().react(Event::Close)?;
                        handle.conn.borrow_mut().start_close();
                    },
                    FillOutcome::WouldBlock => (),
                }
                writable = true;
            }
        }

        if writable || handle.conn.borrow().can_write() {
            let mut conn = handle.conn.borrow_mut();
            if ConnState::Connected == conn.state()
                || ConnState::Closing == conn.state()
            {
                conn.flush()?;
            }
        }

        let mut conn = handle.conn.borrow_mut();
        if ConnState::Closing == conn.state() && !conn.can_write() {
            conn.close();
        }

        Ok(())
    }

    /// Destroys connections that have reached Closed.
    fn reap(&mut self) {
        let mut ix = 0;
        while ix < self.handles.len() {
            let closed = ConnState::Closed
                == self.handles[ix].conn.borrow().state();
            if closed {
                let handle = self.handles.remove(ix);
                debug!(
                    "{} removed from event loop",
                    handle.conn.borrow().log_prefix(),
                );
                handle.client.borrow_mut().on_destroy();
            } else {
                ix += 1;
            }
        }
    }

    fn begin_shutdown(&mut self) {
        info!("Shutdown requested; draining listeners");
        self.shutdown_at = Some(Instant::now());

        for handle in &self.handles {
            let kind = handle.conn.borrow().kind();
            if let Err(e) = handle.client.borrow_mut().react(Event::Shutdown)
            {
                error!(
                    "{} error during shutdown: {}",
                    handle.conn.borrow().log_prefix(),
                    e,
                );
            }
            let mut conn = handle.conn.borrow_mut();
            if ConnKind::Listener == kind {
                conn.close();
            } else {
                conn.extend_timeout(self.grace.as_secs());
                let _ = conn.flush();
            }
        }
        self.reap();
    }

    fn destroy_all(&mut self) {
        for handle in &self.handles {
            let mut conn = handle.conn.borrow_mut();
            let _ = conn.flush();
            conn.close();
        }
        self.reap();
        info!("Shutdown complete");
    }
}

fn socket_error(fd: RawFd) -> Result<bool, Error> {
    let err = nix::sys::socket::getsockopt(
        fd,
        nix::sys::socket::sockopt::SocketError,
    )?;
    Ok(0 != err)
}
