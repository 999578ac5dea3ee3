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

//! Bidirectional byte splicing between two connections.
//!
//! After a STARTTLS handshake is handed to the TLS helper, the client
//! socket and the helper socket become an opaque pair: everything read
//! from one is written to the other until either side closes.

use std::cell::RefCell;
use std::rc::Rc;

use crate::server::connection::Connection;
use crate::server::reactor::{self, Client, Event};
use crate::support::error::Error;

struct Forwarder {
    conn: Rc<RefCell<Connection>>,
    peer: Rc<RefCell<Connection>>,
}

/// Splices `a` and `b` together. Both must already be registered with, or
/// about to be registered with, nothing else; the forwarder registers both
/// sides itself.
pub fn splice(
    a: Rc<RefCell<Connection>>,
    b: Rc<RefCell<Connection>>,
) {
    let fwd_a = Rc::new(RefCell::new(Forwarder {
        conn: Rc::clone(&a),
        peer: Rc::clone(&b),
    }));
    let fwd_b = Rc::new(RefCell::new(Forwarder {
        conn: Rc::clone(&b),
        peer: Rc::clone(&a),
    }));
    reactor::register(a, fwd_a);
    reactor::register(b, fwd_b);
}

impl Client for Forwarder {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Read => {
                let bytes = self.conn.borrow_mut().read_buffer().take();
                if !bytes.is_empty() {
                    self.peer.borrow_mut().enqueue(&bytes);
                }
                Ok(())
            },
            Event::Close | Event::Error | Event::Timeout
            | Event::Shutdown => {
                self.peer.borrow_mut().start_close();
                Ok(())
            },
            _ => Ok(()),
        }
    }
}
