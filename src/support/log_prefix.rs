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
use std::fmt;
use std::rc::Rc;

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so that a
/// connection and the tasks it spawns all pick up the user name once it
/// becomes known.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: &'static str,
    peer: String,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: &'static str, peer: String) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                protocol,
                peer,
                user: None,
            })),
        }
    }

    /// Creates a prefix which shares nothing with `self`.
    ///
    /// Used when a connection hands work off to something with its own
    /// lifecycle, such as a database handle.
    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.borrow();
        Self {
            inner: Rc::new(RefCell::new(Inner::clone(&inner))),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.borrow_mut().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "{}:{}", inner.protocol, inner.peer)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{}]", user)?;
        }

        Ok(())
    }
}
