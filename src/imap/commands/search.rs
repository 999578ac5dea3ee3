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

//! SEARCH, SORT and THREAD execution.
//!
//! All three run the selector compiler over the predicate tree and
//! stream UIDs back. THREAD follows up with one more query to collect
//! the Subject/Message-Id/References headers the algorithms need.

use crate::db::query::{Query, Value};
use crate::imap::command::{
    resolve_marker, substitute_markers, CmdState, Done, RunState,
};
use crate::imap::server::ImapConnection;
use crate::imap::syntax::{SequenceSet, ThreadAlg};
use crate::search::selector::{Selector, SortCriterion, SqlOptions};
use crate::search::thread::{self, ThreadInfo};
use crate::store::idset::IdSet;

impl ImapConnection {
    /// Resolves session-dependent markers and compiles the tree. On
    /// `None` the command was finished with an error already.
    fn prepare_selector(
        &mut self,
        ix: usize,
        mut selector: Selector,
        msn_sets: Vec<SequenceSet>,
    ) -> Option<Selector> {
        let session = match self.selected_session() {
            Some(session) => session,
            None => {
                self.records[ix]
                    .finish(Done::bad("No mailbox selected"));
                return None;
            },
        };

        if !msn_sets.is_empty() {
            let mut resolved = Vec::new();
            for marker in &msn_sets {
                match resolve_marker(marker, &session.borrow()) {
                    Some(set) => resolved.push(set),
                    None => {
                        self.records[ix].finish(Done::bad(
                            "Malformed sequence set",
                        ));
                        return None;
                    },
                }
            }
            let mut iter = resolved.into_iter();
            substitute_markers(&mut selector, &mut iter);
        }

        Some(selector.simplify())
    }

    pub(crate) fn start_search(
        &mut self,
        ix: usize,
        selector: Selector,
        uid_command: bool,
        msn_sets: Vec<SequenceSet>,
    ) {
        let modseq_in_program = selector_mentions_modseq(&selector);
        let selector =
            match self.prepare_selector(ix, selector, msn_sets) {
                Some(selector) => selector,
                None => return,
            };

        if Selector::Nil == selector {
            let record = &mut self.records[ix];
            record.untagged.push("* SEARCH".to_owned());
            record.finish(Done::ok("done"));
            return;
        }

        let mailbox_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let query = selector
            .to_sql(&SqlOptions::for_mailbox(mailbox_id))
            .into_query();
        let tag = self.records[ix].tag.clone();
        query.execute(Some(self.make_task(&tag)));

        self.records[ix].run = RunState::Search {
            query,
            uid_command,
            modseq_in_program,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_search(&mut self, ix: usize) {
        let (query, uid_command, modseq_in_program) =
            match self.records[ix].run {
                RunState::Search {
                    ref query,
                    uid_command,
                    modseq_in_program,
                } => (query.clone(), uid_command, modseq_in_program),
                _ => return,
            };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no("Search failed").with_code("SERVERBUG"),
            );
            return;
        }

        let session = self.selected_session();
        let mut found = IdSet::new();
        let mut highest_modseq = 0u64;
        while let Some(row) = query.next_row() {
            if let Some(uid) = row.uint("uid") {
                let known = session
                    .as_ref()
                    .map_or(true, |s| s.borrow().uids().contains(uid));
                if known {
                    found.insert(uid);
                    if let Some(modseq) = row.bigint("modseq") {
                        highest_modseq =
                            highest_modseq.max(modseq as u64);
                    }
                }
            }
        }

        let numbers: Vec<String> = if uid_command {
            found.iter().map(|uid| uid.to_string()).collect()
        } else {
            found
                .iter()
                .filter_map(|uid| {
                    session
                        .as_ref()
                        .and_then(|s| s.borrow().msn_of(uid))
                })
                .map(|msn| msn.to_string())
                .collect()
        };

        let mut line = String::from("* SEARCH");
        for number in &numbers {
            line.push(' ');
            line.push_str(number);
        }
        if modseq_in_program && highest_modseq > 0 {
            line.push_str(&format!(" (MODSEQ {})", highest_modseq));
        }

        let record = &mut self.records[ix];
        record.untagged.push(line);
        record.finish(Done::ok("done"));
    }

    pub(crate) fn start_sort(
        &mut self,
        ix: usize,
        criteria: Vec<SortCriterion>,
        selector: Selector,
        uid_command: bool,
        msn_sets: Vec<SequenceSet>,
    ) {
        let selector =
            match self.prepare_selector(ix, selector, msn_sets) {
                Some(selector) => selector,
                None => return,
            };

        if Selector::Nil == selector {
            let record = &mut self.records[ix];
            record.untagged.push("* SORT".to_owned());
            record.finish(Done::ok("done"));
            return;
        }

        let mailbox_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let mut options = SqlOptions::for_mailbox(mailbox_id);
        options.sort = criteria;
        let query = selector.to_sql(&options).into_query();
        let tag = self.records[ix].tag.clone();
        query.execute(Some(self.make_task(&tag)));

        self.records[ix].run = RunState::Sort {
            query,
            uid_command,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_sort(&mut self, ix: usize) {
        let (query, uid_command) = match self.records[ix].run {
            RunState::Sort {
                ref query,
                uid_command,
            } => (query.clone(), uid_command),
            _ => return,
        };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no("Sort failed").with_code("SERVERBUG"),
            );
            return;
        }

        let session = self.selected_session();
        // Order matters here; a plain set would destroy it.
        let mut seen = IdSet::new();
        let mut ordered = Vec::new();
        while let Some(row) = query.next_row() {
            if let Some(uid) = row.uint("uid") {
                if seen.contains(uid) {
                    continue;
                }
                seen.insert(uid);
                let number = if uid_command {
                    Some(uid)
                } else {
                    session
                        .as_ref()
                        .and_then(|s| s.borrow().msn_of(uid))
                };
                if let Some(number) = number {
                    ordered.push(number.to_string());
                }
            }
        }

        let mut line = String::from("* SORT");
        for number in &ordered {
            line.push(' ');
            line.push_str(number);
        }
        let record = &mut self.records[ix];
        record.untagged.push(line);
        record.finish(Done::ok("done"));
    }

    pub(crate) fn start_thread(
        &mut self,
        ix: usize,
        algorithm: ThreadAlg,
        selector: Selector,
        uid_command: bool,
        msn_sets: Vec<SequenceSet>,
    ) {
        let selector =
            match self.prepare_selector(ix, selector, msn_sets) {
                Some(selector) => selector,
                None => return,
            };

        if Selector::Nil == selector {
            let record = &mut self.records[ix];
            record.untagged.push("* THREAD".to_owned());
            record.finish(Done::ok("done"));
            return;
        }

        let mailbox_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let query = selector
            .to_sql(&SqlOptions::for_mailbox(mailbox_id))
            .into_query();
        let tag = self.records[ix].tag.clone();
        query.execute(Some(self.make_task(&tag)));

        self.records[ix].run = RunState::Thread {
            query,
            algorithm,
            uid_command,
            phase: 1,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_thread(&mut self, ix: usize) {
        let (query, algorithm, uid_command, phase) =
            match self.records[ix].run {
                RunState::Thread {
                    ref query,
                    algorithm,
                    uid_command,
                    phase,
                } => (query.clone(), algorithm, uid_command, phase),
                _ => return,
            };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no("Thread failed").with_code("SERVERBUG"),
            );
            return;
        }

        if 1 == phase {
            let mut found = IdSet::new();
            while let Some(row) = query.next_row() {
                if let Some(uid) = row.uint("uid") {
                    found.insert(uid);
                }
            }
            if found.is_empty() {
                let record = &mut self.records[ix];
                record.untagged.push("* THREAD".to_owned());
                record.finish(Done::ok("done"));
                return;
            }

            let mailbox_id = self
                .selected_mailbox()
                .map_or(0, |mb| mb.borrow().id());
            let headers = Query::prepared(
                "thread_headers",
                "select mm.uid, mm.idate, \
                 hs.value as subject, \
                 hm.value as message_id, \
                 hr.value as refs \
                 from mailbox_messages mm \
                 left join header_fields hs \
                 on (hs.message=mm.message \
                 and lower(hs.field)='subject') \
                 left join header_fields hm \
                 on (hm.message=mm.message \
                 and lower(hm.field)='message-id') \
                 left join header_fields hr \
                 on (hr.message=mm.message \
                 and lower(hr.field)='references') \
                 where mm.mailbox=$1 and mm.uid = ANY($2) \
                 order by mm.uid",
            );
            headers
                .bind(1, mailbox_id)
                .bind(2, Value::IntSet(found.iter().collect()));
            let tag = self.records[ix].tag.clone();
            headers.execute(Some(self.make_task(&tag)));

            if let RunState::Thread {
                query: ref mut q,
                ref mut phase,
                ..
            } = self.records[ix].run
            {
                *q = headers;
                *phase = 2;
            }
            return;
        }

        // Phase 2: all the header data is in; run the algorithm.
        let session = self.selected_session();
        let mut messages = Vec::new();
        while let Some(row) = query.next_row() {
            let uid = match row.uint("uid") {
                Some(uid) => uid,
                None => continue,
            };
            messages.push(ThreadInfo {
                uid,
                message_id: row
                    .text("message_id")
                    .map(|s| s.trim().to_owned()),
                references: row
                    .text("refs")
                    .map(|refs| {
                        refs.split_whitespace()
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default(),
                subject: row.text("subject").unwrap_or_default(),
                idate: row.bigint("idate").unwrap_or(0),
            });
        }

        let mut threads = match algorithm {
            ThreadAlg::OrderedSubject => {
                thread::ordered_subject(&messages)
            },
            ThreadAlg::References => thread::references(&messages),
        };

        // MSN-addressed THREAD maps every node through the session.
        if !uid_command {
            fn map_msn(
                nodes: &mut Vec<thread::ThreadNode>,
                session: &crate::store::session::Session,
            ) {
                for node in nodes.iter_mut() {
                    node.uid = session
                        .msn_of(node.uid)
                        .unwrap_or(node.uid);
                    map_msn(&mut node.children, session);
                }
            }
            if let Some(ref session) = session {
                map_msn(&mut threads, &session.borrow());
            }
        }

        let record = &mut self.records[ix];
        record.untagged.push(format!(
            "* THREAD {}",
            thread::format_threads(&threads),
        ));
        record.finish(Done::ok("done"));
    }
}

fn selector_mentions_modseq(selector: &Selector) -> bool {
    match *selector {
        Selector::Modseq(_) => true,
        Selector::And(ref children)
        | Selector::Or(ref children) => {
            children.iter().any(selector_mentions_modseq)
        },
        Selector::Not(ref inner) => selector_mentions_modseq(inner),
        _ => false,
    }
}
