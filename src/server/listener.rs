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

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::{info, warn};
use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, SockFlag, SockType,
    SockaddrLike, SockaddrStorage,
};

use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{self, Client, Event};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Called for each accepted socket with the socket and the peer address.
pub type AcceptFn = Box<dyn FnMut(RawFd, String)>;

/// A listening socket. Each readable event accepts as many connections as
/// the kernel has queued and hands them to the accept callback, which is
/// responsible for registering them with the reactor.
pub struct Listener {
    conn: Rc<RefCell<Connection>>,
    on_accept: AcceptFn,
}

impl Listener {
    /// Binds `addr` (e.g. `"0.0.0.0:143"`) and registers the listener.
    pub fn spawn(
        addr: &str,
        service: &'static str,
        on_accept: AcceptFn,
    ) -> Result<(), Error> {
        let parsed: SocketAddr = addr.parse().map_err(|_| {
            Error::BadConfig(format!("unparseable listen address: {}", addr))
        })?;

        let family = if parsed.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
        nix::sys::socket::setsockopt(
            fd,
            nix::sys::socket::sockopt::ReuseAddr,
            &true,
        )?;
        let sockaddr = SockaddrStorage::from(parsed);
        bind(fd, &sockaddr)?;
        listen(fd, 64)?;

        let prefix = LogPrefix::new(service, addr.to_owned());
        info!("{} listening", prefix);
        let conn = Rc::new(RefCell::new(Connection::wrap(
            fd,
            ConnKind::Listener,
            prefix,
        )?));
        let listener = Rc::new(RefCell::new(Listener {
            conn: Rc::clone(&conn),
            on_accept,
        }));
        reactor::register(conn, listener);
        Ok(())
    }
}

impl Client for Listener {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        if Event::Read != event {
            return Ok(());
        }

        loop {
            let fd = {
                let conn = self.conn.borrow();
                match accept(conn.fd()) {
                    Ok(fd) => fd,
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("{} accept failed: {}", conn.log_prefix(), e);
                        break;
                    },
                }
            };

            (self.on_accept)(fd, peer_name(fd));
        }

        Ok(())
    }
}

fn peer_name(fd: RawFd) -> String {
    nix::sys::socket::getpeername::<SockaddrStorage>(fd)
        .map(|sa| sa.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned())
}
