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

//! One client's live view of a mailbox.
//!
//! The session remembers which UIDs the client has been told about (their
//! order defines the message sequence numbers), which of them are recent,
//! and the highest MODSEQ announced so far. Changes pushed by the mailbox
//! queue up here and are released only at command boundaries where the
//! protocol permits them; in particular EXPUNGE responses are withheld
//! while any command addressing messages by MSN is in progress, because
//! emitting one renumbers everything after it.

use std::collections::VecDeque;

use crate::store::idset::IdSet;
use crate::store::mailbox::MailboxChange;

/// A queued notification not yet released to the client.
#[derive(Clone, Debug)]
enum Pending {
    New { uid: u32 },
    Modified { uid: u32, modseq: u64, flags: Vec<String> },
    Expunged { uid: u32 },
}

/// An untagged response the session has decided to emit.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionResponse {
    Exists(u32),
    Recent(u32),
    /// `* <msn> FETCH (FLAGS (...) UID u MODSEQ (m))`
    Fetch { msn: u32, uid: u32, flags: Vec<String>, modseq: u64 },
    Expunge { msn: u32 },
}

pub struct Session {
    mailbox_id: u32,
    read_only: bool,
    /// UIDs the client knows, in order; index+1 is the MSN.
    uids: IdSet,
    recent: IdSet,
    owns_recent: bool,
    last_modseq: u64,
    pending: VecDeque<Pending>,
    /// The last EXISTS value announced, once SELECT has sent the first
    /// one.
    announced_exists: Option<u32>,
}

impl Session {
    pub fn new(
        mailbox_id: u32,
        read_only: bool,
        uids: IdSet,
        recent: IdSet,
        owns_recent: bool,
        last_modseq: u64,
    ) -> Self {
        Session {
            mailbox_id,
            read_only,
            uids,
            recent,
            owns_recent,
            last_modseq,
            pending: VecDeque::new(),
            announced_exists: None,
        }
    }

    /// Notes that the initial EXISTS/RECENT pair was sent as part of
    /// the SELECT response.
    pub fn mark_announced(&mut self) {
        self.announced_exists = Some(self.exists());
    }

    pub fn mailbox_id(&self) -> u32 {
        self.mailbox_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn owns_recent(&self) -> bool {
        self.owns_recent
    }

    pub fn recent(&self) -> &IdSet {
        &self.recent
    }

    pub fn last_modseq(&self) -> u64 {
        self.last_modseq
    }

    pub fn uids(&self) -> &IdSet {
        &self.uids
    }

    pub fn exists(&self) -> u32 {
        self.uids.len() as u32
    }

    /// 1-based sequence number of `uid`, if the client knows it.
    pub fn msn_of(&self, uid: u32) -> Option<u32> {
        self.uids.index_of(uid)
    }

    pub fn uid_of(&self, msn: u32) -> Option<u32> {
        self.uids.value_at(msn)
    }

    /// Resolves a sequence-set of MSNs to UIDs, ignoring out-of-range
    /// entries.
    pub fn msns_to_uids(&self, msns: &IdSet) -> IdSet {
        msns.iter().filter_map(|msn| self.uid_of(msn)).collect()
    }

    /// Restricts `uids` to those this session knows.
    pub fn known_uids(&self, uids: &IdSet) -> IdSet {
        uids.iter().filter(|&u| self.uids.contains(u)).collect()
    }

    /// Called by the mailbox when something changes.
    pub fn note_change(&mut self, change: &MailboxChange) {
        match *change {
            MailboxChange::New { uid, .. } => {
                if !self.uids.contains(uid) {
                    self.pending.push_back(Pending::New { uid });
                }
            },
            MailboxChange::Modified {
                uid,
                modseq,
                ref flags,
            } => {
                self.pending.push_back(Pending::Modified {
                    uid,
                    modseq,
                    flags: flags.clone(),
                });
            },
            MailboxChange::Expunged { ref uids, .. } => {
                for uid in uids.iter() {
                    if self.uids.contains(uid) {
                        self.pending.push_back(Pending::Expunged { uid });
                    }
                }
            },
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Releases queued notifications that are currently permitted.
    ///
    /// Expunges are withheld unless `expunge_allowed`. Within each
    /// response type, UIDs come out in increasing order; EXISTS is
    /// emitted after new UIDs are absorbed and is never smaller than a
    /// previously emitted EXISTS.
    pub fn take_pending(
        &mut self,
        expunge_allowed: bool,
    ) -> Vec<SessionResponse> {
        let mut out = Vec::new();

        let mut new_uids = Vec::new();
        let mut modified = Vec::new();
        let mut expunged = Vec::new();
        let mut retained = VecDeque::new();

        for entry in self.pending.drain(..) {
            match entry {
                Pending::New { uid } => new_uids.push(uid),
                Pending::Modified { uid, modseq, flags } => {
                    modified.push((uid, modseq, flags))
                },
                Pending::Expunged { uid } if expunge_allowed => {
                    expunged.push(uid)
                },
                entry @ Pending::Expunged { .. } => {
                    retained.push_back(entry)
                },
            }
        }
        self.pending = retained;

        // Expunges first, in UID order; each is numbered against the
        // state at the moment of emission.
        expunged.sort_unstable();
        for uid in expunged {
            if let Some(msn) = self.uids.index_of(uid) {
                self.uids.remove(uid);
                self.recent.remove(uid);
                out.push(SessionResponse::Expunge { msn });
            }
        }

        // New arrivals, then one EXISTS/RECENT for the lot.
        let had_new = !new_uids.is_empty();
        for uid in new_uids {
            self.uids.insert(uid);
            if self.owns_recent {
                self.recent.insert(uid);
            }
        }
        let expunged_any = out
            .iter()
            .any(|r| matches!(r, SessionResponse::Expunge { .. }));
        if had_new || self.announced_exists.is_none() || expunged_any
        {
            let exists = self.exists();
            // EXISTS may repeat but must never shrink except via
            // EXPUNGE, which has already been emitted above.
            out.push(SessionResponse::Exists(exists));
            out.push(SessionResponse::Recent(
                self.recent.len() as u32
            ));
            self.announced_exists = Some(exists);
        }

        // Flag changes, in UID order, latest state winning when a UID
        // changed more than once, skipping anything no longer
        // addressable.
        modified.reverse();
        modified.sort_by_key(|&(uid, ..)| uid);
        let mut seen = IdSet::new();
        for (uid, modseq, flags) in modified {
            if seen.contains(uid) {
                continue;
            }
            seen.insert(uid);
            let still_queued_for_expunge = self
                .pending
                .iter()
                .any(|p| matches!(*p, Pending::Expunged { uid: u } if u == uid));
            if still_queued_for_expunge {
                continue;
            }
            if let Some(msn) = self.uids.index_of(uid) {
                self.last_modseq = self.last_modseq.max(modseq);
                out.push(SessionResponse::Fetch {
                    msn,
                    uid,
                    flags,
                    modseq,
                });
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session_with(uids: &[u32]) -> Session {
        Session::new(
            1,
            false,
            uids.iter().copied().collect(),
            IdSet::new(),
            true,
            1,
        )
    }

    fn note_expunge(session: &mut Session, uids: &[u32]) {
        session.note_change(&MailboxChange::Expunged {
            uids: uids.iter().copied().collect(),
            modseq: 99,
        });
    }

    #[test]
    fn msn_mapping() {
        let session = session_with(&[2, 5, 9]);
        assert_eq!(Some(1), session.msn_of(2));
        assert_eq!(Some(3), session.msn_of(9));
        assert_eq!(None, session.msn_of(3));
        assert_eq!(Some(5), session.uid_of(2));
        assert_eq!(None, session.uid_of(4));
    }

    #[test]
    fn expunge_emission_renumbers_sequentially() {
        let mut session = session_with(&[2, 5, 9]);
        note_expunge(&mut session, &[2, 9]);
        let responses = session.take_pending(true);

        // UID 2 was MSN 1. After its removal, UID 9 is MSN 2.
        assert_eq!(SessionResponse::Expunge { msn: 1 }, responses[0]);
        assert_eq!(SessionResponse::Expunge { msn: 2 }, responses[1]);
        assert_eq!(1, session.exists());
        assert_eq!(Some(1), session.msn_of(5));
    }

    #[test]
    fn expunges_withheld_without_permission() {
        let mut session = session_with(&[2, 5]);
        note_expunge(&mut session, &[2]);
        let responses = session.take_pending(false);
        assert!(responses
            .iter()
            .all(|r| !matches!(r, SessionResponse::Expunge { .. })));
        assert!(session.has_pending());
        assert_eq!(Some(1), session.msn_of(2));

        // Released at the next permitted boundary.
        let responses = session.take_pending(true);
        assert_eq!(SessionResponse::Expunge { msn: 1 }, responses[0]);
    }

    #[test]
    fn new_messages_produce_growing_exists() {
        let mut session = session_with(&[1, 2]);
        session
            .note_change(&MailboxChange::New { uid: 3, modseq: 5 });
        let first = exists_value(&session.take_pending(true));
        session
            .note_change(&MailboxChange::New { uid: 4, modseq: 6 });
        session
            .note_change(&MailboxChange::New { uid: 7, modseq: 7 });
        let second = exists_value(&session.take_pending(true));
        assert!(second >= first);
        assert_eq!(5, session.exists());
        // recent set tracks new arrivals for the owning session
        assert!(session.recent().contains(3));
        assert!(session.recent().contains(7));
    }

    #[test]
    fn modified_skips_expunged_uids() {
        let mut session = session_with(&[2, 5]);
        session.note_change(&MailboxChange::Modified {
            uid: 5,
            modseq: 10,
            flags: vec!["\\Seen".to_owned()],
        });
        note_expunge(&mut session, &[5]);
        let responses = session.take_pending(true);
        assert!(responses
            .iter()
            .all(|r| !matches!(r, SessionResponse::Fetch { .. })));
    }

    #[test]
    fn modified_updates_last_modseq() {
        let mut session = session_with(&[2]);
        session.note_change(&MailboxChange::Modified {
            uid: 2,
            modseq: 42,
            flags: vec![],
        });
        session.take_pending(true);
        assert_eq!(42, session.last_modseq());
    }

    fn exists_value(responses: &[SessionResponse]) -> u32 {
        responses
            .iter()
            .find_map(|r| match *r {
                SessionResponse::Exists(n) => Some(n),
                _ => None,
            })
            .expect("no EXISTS emitted")
    }
}
