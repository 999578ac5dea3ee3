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

//! A framed byte stream over one socket.
//!
//! `Connection` owns the file descriptor, the read and write buffers, the
//! filter chain, and the deadline. It knows nothing about any protocol;
//! protocol logic lives in the `Client` implementations that the reactor
//! pairs each connection with.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::server::filter::Filter;
use crate::support::buffer::NetBuffer;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Inactive,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnKind {
    Listener,
    ImapServer,
    Pop3Server,
    SmtpServer,
    ManageSieveServer,
    DatabaseClient,
    Forwarder,
}

pub enum FillOutcome {
    /// Bytes (possibly zero after filtering) were read.
    Progress,
    /// The peer shut down its sending side.
    Eof,
    /// Nothing to read right now.
    WouldBlock,
}

pub struct Connection {
    fd: RawFd,
    state: ConnState,
    kind: ConnKind,
    log_prefix: LogPrefix,
    rbuf: NetBuffer,
    wbuf: NetBuffer,
    inbound: Vec<Box<dyn Filter>>,
    outbound: Vec<Box<dyn Filter>>,
    /// Bytes that have passed the outbound filters but have not yet been
    /// accepted by the kernel.
    staged: Vec<u8>,
    deadline: Option<Instant>,
}

impl Connection {
    /// Wraps an already-connected socket, e.g. one returned by accept().
    ///
    /// The socket is made non-blocking.
    pub fn wrap(
        fd: RawFd,
        kind: ConnKind,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        set_nonblocking(fd)?;
        Ok(Connection {
            fd,
            state: ConnState::Connected,
            kind,
            log_prefix,
            rbuf: NetBuffer::new(),
            wbuf: NetBuffer::new(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            staged: Vec::new(),
            deadline: None,
        })
    }

    /// Wraps a socket on which a non-blocking connect() has been issued.
    pub fn connecting(
        fd: RawFd,
        kind: ConnKind,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        let mut conn = Self::wrap(fd, kind, log_prefix)?;
        conn.state = ConnState::Connecting;
        Ok(conn)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn read_buffer(&mut self) -> &mut NetBuffer {
        &mut self.rbuf
    }

    /// Whether there is anything waiting to go out.
    pub fn can_write(&self) -> bool {
        !self.wbuf.is_empty() || !self.staged.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn clear_timeout(&mut self) {
        self.deadline = None;
    }

    /// (Re)sets the deadline to `secs` from now.
    pub fn extend_timeout(&mut self, secs: u64) {
        self.deadline = Some(Instant::now() + Duration::from_secs(secs));
    }

    /// Appends bytes to the write buffer. They reach the socket once the
    /// reactor flushes.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.wbuf.append(bytes);
    }

    pub fn enqueue_str(&mut self, s: &str) {
        self.enqueue(s.as_bytes());
    }

    /// Appends an inbound filter; bytes already read but unconsumed are
    /// re-filtered so that data the peer pipelined immediately behind a
    /// negotiation reply is not lost.
    pub fn push_inbound_filter(
        &mut self,
        mut filter: Box<dyn Filter>,
    ) -> Result<(), Error> {
        let residue = self.rbuf.take();
        if !residue.is_empty() {
            let mut filtered = Vec::new();
            filter.transform(&residue, &mut filtered)?;
            self.rbuf.append(&filtered);
        }
        self.inbound.push(filter);
        Ok(())
    }

    /// Appends an outbound filter.
    ///
    /// Anything still in the write buffer is pushed through the old chain
    /// first, so a reply written before the call goes out untransformed.
    pub fn push_outbound_filter(
        &mut self,
        filter: Box<dyn Filter>,
    ) -> Result<(), Error> {
        self.stage_writes()?;
        self.outbound.push(filter);
        Ok(())
    }

    /// Reads whatever the socket has, pushing it through the inbound
    /// filters into the read buffer.
    pub fn fill(&mut self) -> Result<FillOutcome, Error> {
        let mut chunk = [0u8; 16384];
        match nix::unistd::read(self.fd, &mut chunk) {
            Ok(0) => Ok(FillOutcome::Eof),
            Ok(n) => {
                let mut bytes = chunk[..n].to_vec();
                for filter in &mut self.inbound {
                    let mut out = Vec::new();
                    filter.transform(&bytes, &mut out)?;
                    bytes = out;
                }
                self.rbuf.append(&bytes);
                Ok(FillOutcome::Progress)
            },
            Err(nix::errno::Errno::EAGAIN) => Ok(FillOutcome::WouldBlock),
            Err(nix::errno::Errno::EINTR) => Ok(FillOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the write buffer through the outbound filters into the staged
    /// area, then writes as much of it as the kernel will take.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.stage_writes()?;

        while !self.staged.is_empty() {
            match nix::unistd::write(self.fd, &self.staged) {
                Ok(0) => break,
                Ok(n) => {
                    self.staged.drain(..n);
                },
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn stage_writes(&mut self) -> Result<(), Error> {
        if self.wbuf.is_empty() {
            return Ok(());
        }

        let plain = self.wbuf.take();
        let mut bytes = plain;
        for filter in &mut self.outbound {
            let mut out = Vec::new();
            filter.transform(&bytes, &mut out)?;
            bytes = out;
        }
        self.staged.extend_from_slice(&bytes);
        Ok(())
    }

    /// Begins an orderly close: pending writes still go out, then the
    /// reactor destroys the connection.
    pub fn start_close(&mut self) {
        if ConnState::Closed != self.state {
            self.state = ConnState::Closing;
        }
    }

    /// Immediately closes the socket.
    pub fn close(&mut self) {
        if ConnState::Closed != self.state {
            let _ = nix::unistd::close(self.fd);
            self.state = ConnState::Closed;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )?;
    Ok(())
}
