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

//! Registry of long-lived caches.
//!
//! Anything holding state that mirrors the database registers an
//! invalidation hook here, so that `invalidate_all()` returns the process
//! to a cold-cache state in one call (e.g. after a schema upgrade signal
//! or when a test wants a clean slate).

use std::cell::RefCell;

type InvalidateFn = Box<dyn Fn()>;

thread_local! {
    static CACHES: RefCell<Vec<InvalidateFn>> = RefCell::new(Vec::new());
}

pub fn register(invalidate: impl Fn() + 'static) {
    CACHES.with(|c| c.borrow_mut().push(Box::new(invalidate)));
}

pub fn invalidate_all() {
    CACHES.with(|c| {
        for invalidate in c.borrow().iter() {
            invalidate();
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn invalidate_all_reaches_every_registration() {
        let count = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let count = Rc::clone(&count);
            register(move || count.set(count.get() + 1));
        }
        invalidate_all();
        assert!(count.get() >= 3);
    }
}
