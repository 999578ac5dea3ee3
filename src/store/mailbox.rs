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

//! The in-memory view of the mailbox tree.
//!
//! Each mailbox tracks its UIDNEXT, UIDVALIDITY and next MODSEQ, plus
//! the sessions currently viewing it. Mailboxes are shared: the
//! registry hands out `Rc` handles, and change announcements fan out
//! to every live session.
//!
//! `next_modseq` is strictly greater than every MODSEQ ever observed on a
//! message in the mailbox. UIDVALIDITY changes only when a mailbox is
//! renamed over an existing one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::store::idset::IdSet;
use crate::store::session::Session;

/// A change to a mailbox's contents, fanned out to sessions.
#[derive(Clone, Debug)]
pub enum MailboxChange {
    /// A message arrived.
    New { uid: u32, modseq: u64 },
    /// Flags (and hence MODSEQ) changed.
    Modified { uid: u32, modseq: u64, flags: Vec<String> },
    /// Messages were expunged at the given MODSEQ.
    Expunged { uids: IdSet, modseq: u64 },
}

pub struct Mailbox {
    id: u32,
    name: String,
    owner: Option<u32>,
    uidnext: u32,
    uidvalidity: u32,
    next_modseq: u64,
    deleted: bool,
    sessions: Vec<Weak<RefCell<Session>>>,
}

impl Mailbox {
    pub fn new(
        id: u32,
        name: String,
        owner: Option<u32>,
        uidnext: u32,
        uidvalidity: u32,
        next_modseq: u64,
    ) -> Self {
        Mailbox {
            id,
            name,
            owner,
            uidnext,
            uidvalidity,
            next_modseq,
            deleted: false,
            sessions: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn uidnext(&self) -> u32 {
        self.uidnext
    }

    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity
    }

    pub fn next_modseq(&self) -> u64 {
        self.next_modseq
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn set_uidnext(&mut self, uidnext: u32) {
        self.uidnext = self.uidnext.max(uidnext);
    }

    /// Used when a rename lands on top of an existing mailbox: UIDs from
    /// the old incarnation must be invalidated en masse.
    pub fn bump_uidvalidity(&mut self, uidvalidity: u32) {
        self.uidvalidity = self.uidvalidity.max(uidvalidity);
    }

    /// Takes the current MODSEQ for a new change and advances the
    /// counter.
    pub fn allocate_modseq(&mut self) -> u64 {
        let allocated = self.next_modseq;
        self.next_modseq += 1;
        allocated
    }

    /// Notes that `modseq` was observed on a message, keeping
    /// `next_modseq` strictly above it.
    pub fn observe_modseq(&mut self, modseq: u64) {
        self.next_modseq = self.next_modseq.max(modseq + 1);
    }

    pub fn attach_session(&mut self, session: &Rc<RefCell<Session>>) {
        self.sessions.push(Rc::downgrade(session));
    }

    /// Whether any live session other than `except` currently owns the
    /// recent flag for this mailbox.
    pub fn recent_is_claimed(&self) -> bool {
        self.sessions
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.borrow().owns_recent())
    }

    /// Fans a change out to every live session and prunes dead ones.
    pub fn announce(&mut self, change: MailboxChange) {
        match change {
            MailboxChange::New { uid, modseq } => {
                self.uidnext = self.uidnext.max(uid + 1);
                self.observe_modseq(modseq);
            },
            MailboxChange::Modified { modseq, .. }
            | MailboxChange::Expunged { modseq, .. } => {
                self.observe_modseq(modseq);
            },
        }

        self.sessions.retain(|weak| {
            match weak.upgrade() {
                Some(session) => {
                    session.borrow_mut().note_change(&change);
                    true
                },
                None => false,
            }
        });
    }
}

thread_local! {
    static MAILBOXES: RefCell<HashMap<u32, Rc<RefCell<Mailbox>>>> =
        RefCell::new(HashMap::new());
}

/// Registers or refreshes a mailbox in the process-wide registry,
/// returning the shared handle.
pub fn obtain(
    id: u32,
    name: &str,
    owner: Option<u32>,
    uidnext: u32,
    uidvalidity: u32,
    next_modseq: u64,
) -> Rc<RefCell<Mailbox>> {
    MAILBOXES.with(|m| {
        let mut map = m.borrow_mut();
        match map.get(&id) {
            Some(existing) => {
                {
                    let mut mb = existing.borrow_mut();
                    mb.name = name.to_owned();
                    mb.owner = owner;
                    mb.set_uidnext(uidnext);
                    mb.bump_uidvalidity(uidvalidity);
                    mb.observe_modseq(next_modseq.saturating_sub(1));
                }
                Rc::clone(existing)
            },
            None => {
                let mailbox = Rc::new(RefCell::new(Mailbox::new(
                    id,
                    name.to_owned(),
                    owner,
                    uidnext,
                    uidvalidity,
                    next_modseq,
                )));
                map.insert(id, Rc::clone(&mailbox));
                mailbox
            },
        }
    })
}

pub fn by_id(id: u32) -> Option<Rc<RefCell<Mailbox>>> {
    MAILBOXES.with(|m| m.borrow().get(&id).cloned())
}

/// Finds a mailbox by name. `INBOX` is matched case-insensitively per
/// RFC 3501; everything else is exact.
pub fn by_name(name: &str) -> Option<Rc<RefCell<Mailbox>>> {
    MAILBOXES.with(|m| {
        m.borrow()
            .values()
            .find(|mb| {
                let mb = mb.borrow();
                !mb.is_deleted() && names_equal(mb.name(), name)
            })
            .cloned()
    })
}

/// The direct and transitive children of `name`, i.e. everything under
/// `name/`.
pub fn children_of(name: &str) -> Vec<Rc<RefCell<Mailbox>>> {
    let prefix = format!("{}/", name);
    MAILBOXES.with(|m| {
        m.borrow()
            .values()
            .filter(|mb| {
                let mb = mb.borrow();
                !mb.is_deleted() && mb.name().starts_with(&prefix)
            })
            .cloned()
            .collect()
    })
}

/// All live mailboxes whose name matches an IMAP LIST pattern.
pub fn matching(pattern: &str) -> Vec<Rc<RefCell<Mailbox>>> {
    let mut found: Vec<Rc<RefCell<Mailbox>>> = MAILBOXES.with(|m| {
        m.borrow()
            .values()
            .filter(|mb| {
                let mb = mb.borrow();
                !mb.is_deleted() && list_matches(pattern, mb.name())
            })
            .cloned()
            .collect()
    });
    found.sort_by(|a, b| {
        a.borrow().name().cmp(b.borrow().name())
    });
    found
}

pub fn forget(id: u32) {
    MAILBOXES.with(|m| {
        m.borrow_mut().remove(&id);
    });
}

/// Empties the registry; used by the cache registry.
pub fn invalidate() {
    MAILBOXES.with(|m| m.borrow_mut().clear());
}

fn names_equal(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case("INBOX") || b.eq_ignore_ascii_case("INBOX") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// IMAP LIST pattern matching: `*` matches anything, `%` matches
/// anything except the hierarchy delimiter.
pub fn list_matches(pattern: &str, name: &str) -> bool {
    fn rec(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => (0..=name.len())
                .any(|skip| rec(rest, &name[skip..])),
            Some((b'%', rest)) => (0..=name.len())
                .take_while(|&skip| {
                    skip == 0 || name[skip - 1] != b'/'
                })
                .any(|skip| rec(rest, &name[skip..])),
            Some((&c, rest)) => match name.split_first() {
                Some((&n, name_rest)) if n == c => {
                    rec(rest, name_rest)
                },
                _ => false,
            },
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_pattern_star_crosses_delimiters() {
        assert!(list_matches("*", "a/b/c"));
        assert!(list_matches("a/*", "a/b/c"));
        assert!(list_matches("*c", "a/b/c"));
        assert!(!list_matches("b/*", "a/b/c"));
    }

    #[test]
    fn list_pattern_percent_stops_at_delimiter() {
        assert!(list_matches("%", "inbox"));
        assert!(!list_matches("%", "a/b"));
        assert!(list_matches("a/%", "a/b"));
        assert!(!list_matches("a/%", "a/b/c"));
        assert!(list_matches("%/%", "a/b"));
    }

    #[test]
    fn modseq_allocation_is_monotone() {
        let mut mb =
            Mailbox::new(1, "INBOX".to_owned(), Some(1), 1, 1, 1);
        let a = mb.allocate_modseq();
        let b = mb.allocate_modseq();
        assert!(b > a);
        mb.observe_modseq(100);
        assert!(mb.next_modseq() > 100);
        let c = mb.allocate_modseq();
        assert!(c > 100);
    }

    #[test]
    fn observe_modseq_never_regresses() {
        let mut mb =
            Mailbox::new(1, "INBOX".to_owned(), Some(1), 1, 1, 50);
        mb.observe_modseq(10);
        assert_eq!(50, mb.next_modseq());
    }

    #[test]
    fn announce_new_advances_uidnext() {
        let mut mb =
            Mailbox::new(1, "INBOX".to_owned(), Some(1), 5, 1, 1);
        mb.announce(MailboxChange::New { uid: 9, modseq: 2 });
        assert_eq!(10, mb.uidnext());
        assert!(mb.next_modseq() > 2);
    }

    #[test]
    fn registry_finds_inbox_case_insensitively() {
        invalidate();
        obtain(1, "INBOX", Some(1), 1, 1, 1);
        obtain(2, "Archive", Some(1), 1, 1, 1);
        assert!(by_name("inbox").is_some());
        assert!(by_name("archive").is_none());
        assert!(by_name("Archive").is_some());
        invalidate();
    }
}
