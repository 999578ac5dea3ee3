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

//! Command records: one per tagged command in flight.
//!
//! Commands move `Unparsed → Blocked → Executing → Finished → Retired`.
//! `Blocked` means a database or permission check is outstanding.
//! `Finished` means the tagged response is ready, but responses from
//! commands tagged earlier must drain first.
//!
//! Every command carries a group. Group 0 commands (connection state
//! changes: LOGIN, AUTHENTICATE, STARTTLS, SELECT, EXAMINE, CLOSE,
//! UNSELECT, COMPRESS, APPEND, LOGOUT, IDLE) run in isolation: nothing
//! may be in flight when one starts, and nothing starts until it
//! retires. Group 1 commands address messages by UID only and never
//! block EXPUNGE emission; group 2 commands are MSN-addressed and do.

use std::rc::Rc;
use std::cell::RefCell;

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::imap::syntax::{
    FetchItem, Request, SequenceSet, StatusItem, StoreMode, ThreadAlg,
};
use crate::search::selector::Selector;
use crate::store::idset::IdSet;
use crate::store::mailbox::Mailbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdState {
    Unparsed,
    Blocked,
    Executing,
    Finished,
    Retired,
}

/// The tagged completion of a command.
#[derive(Clone, Debug)]
pub struct Done {
    /// OK, NO or BAD.
    pub cond: &'static str,
    /// Optional bracketed response code, without the brackets.
    pub code: Option<String>,
    pub text: String,
}

impl Done {
    pub fn ok(text: impl Into<String>) -> Self {
        Done {
            cond: "OK",
            code: None,
            text: text.into(),
        }
    }

    pub fn no(text: impl Into<String>) -> Self {
        Done {
            cond: "NO",
            code: None,
            text: text.into(),
        }
    }

    pub fn bad(text: impl Into<String>) -> Self {
        Done {
            cond: "BAD",
            code: None,
            text: text.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Kind-specific execution state for commands that run in several
/// database phases.
pub enum RunState {
    None,
    /// LOGIN / AUTHENTICATE: waiting for the user row.
    UserLookup {
        query: Query,
        login: String,
        proof: crate::imap::sasl::Proof,
    },
    /// SELECT/EXAMINE phase 1: the mailbox row.
    SelectMailbox {
        query: Query,
        examine: bool,
        condstore: bool,
    },
    /// SELECT/EXAMINE phase 2: the UID/MODSEQ inventory.
    SelectUids {
        query: Query,
        mailbox: Rc<RefCell<Mailbox>>,
        examine: bool,
        condstore: bool,
    },
    Status {
        query: Query,
        items: Vec<StatusItem>,
        mailbox_name: String,
    },
    /// CREATE/DELETE/RENAME/SUBSCRIBE/UNSUBSCRIBE: one mutation.
    MailboxMutation {
        query: Query,
        verb: &'static str,
        name: String,
    },
    Lsub {
        query: Query,
        pattern: String,
    },
    Append {
        tx: Transaction,
        phase: u8,
        query: Query,
        mailbox_id: u32,
        flags: Vec<String>,
        uid: u32,
        modseq: u64,
    },
    Fetch {
        main: Query,
        flags: Option<Query>,
        body: Option<Query>,
        items: Vec<FetchItem>,
        uid_command: bool,
        set_seen: bool,
    },
    Store {
        tx: Transaction,
        phase: u8,
        queries: Vec<Query>,
        uids: IdSet,
        mode: StoreMode,
        silent: bool,
        flags: Vec<String>,
        unchanged_since: Option<u64>,
        uid_command: bool,
    },
    Expunge {
        tx: Transaction,
        phase: u8,
        query: Query,
        uids: IdSet,
        /// CLOSE finishes by deselecting without untagged EXPUNGEs.
        closing: bool,
    },
    Copy {
        query: Query,
        source: IdSet,
        target: Rc<RefCell<Mailbox>>,
        uid_command: bool,
    },
    Search {
        query: Query,
        uid_command: bool,
        modseq_in_program: bool,
    },
    Sort {
        query: Query,
        uid_command: bool,
    },
    Thread {
        query: Query,
        algorithm: ThreadAlg,
        uid_command: bool,
        /// 1 while the selector query runs, 2 while the header fetch
        /// for the threader runs.
        phase: u8,
    },
}

pub struct CommandRecord {
    pub tag: String,
    pub name: String,
    pub group: u8,
    pub state: CmdState,
    /// The parsed request, taken when execution starts.
    pub request: Option<Request>,
    pub run: RunState,
    /// Untagged lines to emit immediately before the tagged response.
    pub untagged: Vec<String>,
    pub done: Option<Done>,
}

impl CommandRecord {
    pub fn new(tag: String, request: Request) -> Self {
        let (name, group) = classify(&request);
        CommandRecord {
            tag,
            name: name.to_owned(),
            group,
            state: CmdState::Unparsed,
            request: Some(request),
            run: RunState::None,
            untagged: Vec::new(),
            done: None,
        }
    }

    /// A command that failed before it could become a record, e.g. in
    /// the parser.
    pub fn stillborn(tag: String, done: Done) -> Self {
        CommandRecord {
            tag,
            name: "(unparsed)".to_owned(),
            group: 0,
            state: CmdState::Finished,
            request: None,
            run: RunState::None,
            untagged: Vec::new(),
            done: Some(done),
        }
    }

    pub fn finish(&mut self, done: Done) {
        self.done = Some(done);
        self.state = CmdState::Finished;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CmdState::Blocked | CmdState::Executing)
    }

    /// Whether this command's responses are MSN-addressed, making
    /// EXPUNGE emission unsafe while it runs.
    pub fn msn_sensitive(&self) -> bool {
        2 == self.group
    }
}

/// (canonical name, group) for a parsed request.
fn classify(request: &Request) -> (&'static str, u8) {
    match *request {
        Request::Capability => ("CAPABILITY", 1),
        Request::Noop => ("NOOP", 1),
        Request::Check => ("CHECK", 1),
        Request::Logout => ("LOGOUT", 0),
        Request::StartTls => ("STARTTLS", 0),
        Request::Id(_) => ("ID", 1),
        Request::Enable(_) => ("ENABLE", 1),
        Request::Compress => ("COMPRESS", 0),
        Request::Login { .. } => ("LOGIN", 0),
        Request::Authenticate { .. } => ("AUTHENTICATE", 0),
        Request::Select { .. } => ("SELECT", 0),
        Request::Examine { .. } => ("EXAMINE", 0),
        Request::Create { .. } => ("CREATE", 1),
        Request::Delete { .. } => ("DELETE", 1),
        Request::Rename { .. } => ("RENAME", 1),
        Request::Subscribe { .. } => ("SUBSCRIBE", 1),
        Request::Unsubscribe { .. } => ("UNSUBSCRIBE", 1),
        Request::List { .. } => ("LIST", 1),
        Request::Lsub { .. } => ("LSUB", 1),
        Request::Namespace => ("NAMESPACE", 1),
        Request::Status { .. } => ("STATUS", 1),
        Request::Append { .. } => ("APPEND", 0),
        Request::Close => ("CLOSE", 0),
        Request::Unselect => ("UNSELECT", 0),
        Request::Expunge => ("EXPUNGE", 2),
        Request::UidExpunge { .. } => ("UID EXPUNGE", 1),
        Request::Search { uid, .. } => {
            if uid {
                ("UID SEARCH", 1)
            } else {
                ("SEARCH", 2)
            }
        },
        Request::Sort { uid, .. } => {
            if uid {
                ("UID SORT", 1)
            } else {
                ("SORT", 2)
            }
        },
        Request::Thread { uid, .. } => {
            if uid {
                ("UID THREAD", 1)
            } else {
                ("THREAD", 2)
            }
        },
        Request::Fetch { uid, .. } => {
            if uid {
                ("UID FETCH", 1)
            } else {
                ("FETCH", 2)
            }
        },
        Request::Store { uid, .. } => {
            if uid {
                ("UID STORE", 1)
            } else {
                ("STORE", 2)
            }
        },
        Request::Copy { uid, .. } => {
            if uid {
                ("UID COPY", 1)
            } else {
                ("COPY", 2)
            }
        },
        Request::Idle => ("IDLE", 0),
    }
}

/// Resolves the markers the search parser parked: bare MSN sets,
/// `$uid:<set>` and `$recent`.
pub fn resolve_marker(
    marker: &SequenceSet,
    session: &crate::store::session::Session,
) -> Option<IdSet> {
    let text = &marker.0;
    if "$recent" == text {
        Some(session.recent().clone())
    } else if let Some(raw) = text.strip_prefix("$uid:") {
        let star = session.uids().largest().unwrap_or(1);
        SequenceSet(raw.to_owned())
            .resolve(star)
            .map(|set| session.known_uids(&set))
    } else {
        let star = session.exists().max(1);
        SequenceSet(text.clone())
            .resolve(star)
            .map(|set| session.msns_to_uids(&set))
    }
}

/// Replaces the empty `Uid` marker leaves left by the parser with the
/// resolved sets, in traversal order.
pub fn substitute_markers(
    selector: &mut Selector,
    resolved: &mut std::vec::IntoIter<IdSet>,
) {
    match *selector {
        Selector::Uid(ref mut set) if set.is_empty() => {
            if let Some(resolved_set) = resolved.next() {
                *set = resolved_set;
            }
        },
        Selector::And(ref mut children)
        | Selector::Or(ref mut children) => {
            for child in children {
                substitute_markers(child, resolved);
            }
        },
        Selector::Not(ref mut inner) => {
            substitute_markers(inner, resolved)
        },
        _ => (),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::session::Session;

    #[test]
    fn groups_follow_addressing_mode() {
        let record =
            CommandRecord::new("a".to_owned(), Request::Expunge);
        assert_eq!(2, record.group);

        let record = CommandRecord::new(
            "a".to_owned(),
            Request::Fetch {
                set: SequenceSet("1".to_owned()),
                items: vec![FetchItem::Flags],
                changed_since: None,
                uid: true,
            },
        );
        assert_eq!(1, record.group);
        assert!(!record.msn_sensitive());

        let record = CommandRecord::new(
            "a".to_owned(),
            Request::Fetch {
                set: SequenceSet("1".to_owned()),
                items: vec![FetchItem::Flags],
                changed_since: None,
                uid: false,
            },
        );
        assert_eq!(2, record.group);
        assert!(record.msn_sensitive());

        let record = CommandRecord::new(
            "a".to_owned(),
            Request::Select {
                mailbox: "INBOX".to_owned(),
                condstore: false,
            },
        );
        assert_eq!(0, record.group);
    }

    #[test]
    fn marker_resolution() {
        let session = Session::new(
            1,
            false,
            vec![2, 5, 9].into_iter().collect(),
            vec![9].into_iter().collect(),
            true,
            1,
        );

        // Bare MSN set: 1:2 → UIDs 2 and 5
        let resolved = resolve_marker(
            &SequenceSet("1:2".to_owned()),
            &session,
        )
        .unwrap();
        assert_eq!("2,5", resolved.imap_string());

        // MSN star resolves to the highest MSN
        let resolved = resolve_marker(
            &SequenceSet("*".to_owned()),
            &session,
        )
        .unwrap();
        assert_eq!("9", resolved.imap_string());

        // UID marker keeps UID semantics
        let resolved = resolve_marker(
            &SequenceSet("$uid:5:*".to_owned()),
            &session,
        )
        .unwrap();
        assert_eq!("5,9", resolved.imap_string());

        // Recent marker
        let resolved = resolve_marker(
            &SequenceSet("$recent".to_owned()),
            &session,
        )
        .unwrap();
        assert_eq!("9", resolved.imap_string());
    }

    #[test]
    fn marker_substitution_is_positional() {
        let mut selector = Selector::And(vec![
            Selector::Uid(IdSet::new()),
            Selector::Not(Box::new(Selector::Uid(IdSet::new()))),
        ]);
        let sets = vec![
            IdSet::single(1),
            IdSet::single(2),
        ];
        let mut iter = sets.into_iter();
        substitute_markers(&mut selector, &mut iter);
        assert_eq!(
            Selector::And(vec![
                Selector::Uid(IdSet::single(1)),
                Selector::Not(Box::new(Selector::Uid(
                    IdSet::single(2),
                ))),
            ]),
            selector,
        );
    }
}
