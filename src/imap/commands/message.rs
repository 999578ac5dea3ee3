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

//! Message-level commands: FETCH, STORE, COPY, EXPUNGE and CLOSE.
//!
//! EXPUNGE (and CLOSE) run in one transaction: find the `\Deleted`
//! UIDs, advance the mailbox MODSEQ, move the rows into
//! `deleted_messages`, commit, and only then tell the sessions.

use std::collections::HashMap;
use std::rc::Rc;

use chrono::TimeZone;

use crate::db::query::{Query, Value};
use crate::db::transaction::Transaction;
use crate::imap::command::{CmdState, Done, RunState};
use crate::imap::server::ImapConnection;
use crate::imap::syntax::{FetchItem, SequenceSet, StoreMode};
use crate::store::idset::IdSet;
use crate::store::interner::flags;
use crate::store::mailbox::MailboxChange;

impl ImapConnection {
    /// Resolves a sequence set against the current session, in UID or
    /// MSN space.
    fn resolve_set(
        &self,
        set: &SequenceSet,
        uid_command: bool,
    ) -> Option<IdSet> {
        let session = self.selected_session()?;
        let session = session.borrow();
        if uid_command {
            let star = session.uids().largest().unwrap_or(1);
            set.resolve(star)
                .map(|uids| session.known_uids(&uids))
        } else {
            let star = session.exists().max(1);
            set.resolve(star)
                .map(|msns| session.msns_to_uids(&msns))
        }
    }

    pub(crate) fn start_fetch(
        &mut self,
        ix: usize,
        set: SequenceSet,
        items: Vec<FetchItem>,
        changed_since: Option<u64>,
        uid_command: bool,
    ) {
        let uids = match self.resolve_set(&set, uid_command) {
            Some(uids) if !uids.is_empty() => uids,
            _ => {
                // Nothing addressable; an empty fetch succeeds.
                self.records[ix].finish(Done::ok("done"));
                return;
            },
        };
        let mailbox_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let tag = self.records[ix].tag.clone();

        let uid_values: Vec<u32> = uids.iter().collect();
        let main = if let Some(since) = changed_since {
            let q = Query::new(
                "select mm.uid, mm.modseq, mm.idate, m.rfc822size \
                 from mailbox_messages mm \
                 join messages m on (m.id=mm.message) \
                 where mm.mailbox=$1 and mm.uid = ANY($2) \
                 and mm.modseq>$3 order by mm.uid",
            );
            q.bind(1, mailbox_id)
                .bind(2, Value::IntSet(uid_values.clone()))
                .bind(3, since);
            q
        } else {
            let q = Query::prepared(
                "fetch_main",
                "select mm.uid, mm.modseq, mm.idate, m.rfc822size \
                 from mailbox_messages mm \
                 join messages m on (m.id=mm.message) \
                 where mm.mailbox=$1 and mm.uid = ANY($2) \
                 order by mm.uid",
            );
            q.bind(1, mailbox_id)
                .bind(2, Value::IntSet(uid_values.clone()));
            q
        };
        main.execute(Some(self.make_task(&tag)));

        let want_flags =
            items.contains(&FetchItem::Flags);
        let flags_query = if want_flags {
            let q = Query::prepared(
                "fetch_flags",
                "select uid, flag from flags \
                 where mailbox=$1 and uid = ANY($2) order by uid",
            );
            q.bind(1, mailbox_id)
                .bind(2, Value::IntSet(uid_values.clone()));
            q.execute(Some(self.make_task(&tag)));
            Some(q)
        } else {
            None
        };

        let want_body = items
            .iter()
            .any(|i| matches!(i, FetchItem::Body { .. }));
        let body_query = if want_body {
            let q = Query::prepared(
                "fetch_body",
                "select mm.uid, bp.text from mailbox_messages mm \
                 join part_numbers pn on (pn.message=mm.message \
                 and pn.part='') \
                 join bodyparts bp on (bp.id=pn.bodypart) \
                 where mm.mailbox=$1 and mm.uid = ANY($2) \
                 order by mm.uid",
            );
            q.bind(1, mailbox_id)
                .bind(2, Value::IntSet(uid_values));
            q.execute(Some(self.make_task(&tag)));
            Some(q)
        } else {
            None
        };

        let set_seen = items.iter().any(
            |i| matches!(i, FetchItem::Body { peek: false }),
        ) && self
            .selected_session()
            .map_or(false, |s| !s.borrow().read_only());

        self.records[ix].run = RunState::Fetch {
            main,
            flags: flags_query,
            body: body_query,
            items,
            uid_command,
            set_seen,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_fetch(&mut self, ix: usize) {
        let (main, flags_q, body_q, items, uid_command, set_seen) =
            match self.records[ix].run {
                RunState::Fetch {
                    ref main,
                    ref flags,
                    ref body,
                    ref items,
                    uid_command,
                    set_seen,
                    ..
                } => (
                    main.clone(),
                    flags.clone(),
                    body.clone(),
                    items.clone(),
                    uid_command,
                    set_seen,
                ),
                _ => return,
            };

        let all_done = main.done()
            && flags_q.as_ref().map_or(true, Query::done)
            && body_q.as_ref().map_or(true, Query::done);
        if !all_done {
            return;
        }

        if main.failed()
            || flags_q.as_ref().map_or(false, Query::failed)
            || body_q.as_ref().map_or(false, Query::failed)
        {
            self.records[ix].finish(
                Done::no("Database error").with_code("SERVERBUG"),
            );
            return;
        }

        let mut flags_by_uid: HashMap<u32, Vec<String>> =
            HashMap::new();
        if let Some(q) = flags_q {
            while let Some(row) = q.next_row() {
                if let (Some(uid), Some(flag_id)) =
                    (row.uint("uid"), row.uint("flag"))
                {
                    if let Some(name) = flags::name(flag_id) {
                        flags_by_uid
                            .entry(uid)
                            .or_insert_with(Vec::new)
                            .push(name);
                    }
                }
            }
        }

        let mut body_by_uid: HashMap<u32, String> = HashMap::new();
        if let Some(q) = body_q {
            while let Some(row) = q.next_row() {
                if let (Some(uid), Some(text)) =
                    (row.uint("uid"), row.text("text"))
                {
                    body_by_uid.insert(uid, text);
                }
            }
        }

        let session = self.selected_session();
        let mut fetched_uids = IdSet::new();
        let mut lines = Vec::new();
        while let Some(row) = main.next_row() {
            let uid = match row.uint("uid") {
                Some(uid) => uid,
                None => continue,
            };
            let msn = session
                .as_ref()
                .and_then(|s| s.borrow().msn_of(uid));
            let msn = match msn {
                Some(msn) => msn,
                // Not visible in this session any more.
                None => continue,
            };
            fetched_uids.insert(uid);

            let mut parts = Vec::new();
            for item in &items {
                match *item {
                    FetchItem::Uid => {
                        parts.push(format!("UID {}", uid))
                    },
                    FetchItem::Flags => {
                        let empty = Vec::new();
                        let f = flags_by_uid
                            .get(&uid)
                            .unwrap_or(&empty);
                        parts.push(format!(
                            "FLAGS ({})",
                            f.join(" "),
                        ));
                    },
                    FetchItem::Modseq => {
                        let modseq =
                            row.bigint("modseq").unwrap_or(0);
                        parts
                            .push(format!("MODSEQ ({})", modseq));
                    },
                    FetchItem::Rfc822Size => {
                        let size =
                            row.bigint("rfc822size").unwrap_or(0);
                        parts.push(format!(
                            "RFC822.SIZE {}",
                            size,
                        ));
                    },
                    FetchItem::InternalDate => {
                        let idate =
                            row.bigint("idate").unwrap_or(0);
                        let formatted = chrono::Utc
                            .timestamp_opt(idate, 0)
                            .single()
                            .map(|dt| {
                                dt.format(
                                    "%d-%b-%Y %H:%M:%S +0000",
                                )
                                .to_string()
                            })
                            .unwrap_or_default();
                        parts.push(format!(
                            "INTERNALDATE \"{}\"",
                            formatted,
                        ));
                    },
                    FetchItem::Body { .. } => {
                        let body = body_by_uid
                            .get(&uid)
                            .map(String::as_str)
                            .unwrap_or("");
                        parts.push(format!(
                            "BODY[] {{{}}}\r\n{}",
                            body.len(),
                            body,
                        ));
                    },
                }
            }

            // UID FETCH always reports the UID.
            if uid_command
                && !items.contains(&FetchItem::Uid)
            {
                parts.push(format!("UID {}", uid));
            }

            lines.push(format!(
                "* {} FETCH ({})",
                msn,
                parts.join(" "),
            ));
        }

        for line in lines {
            // Bodies embed CRLF, so these go out as raw bytes rather
            // than through the line helper.
            self.send_bytes(line.as_bytes());
            self.send_bytes(b"\r\n");
        }

        // An open (non-peek) body fetch implicitly sets \Seen.
        if set_seen && !fetched_uids.is_empty() {
            self.set_seen_after_fetch(&fetched_uids);
        }

        self.records[ix].finish(Done::ok("done"));
    }

    /// Fire-and-forget \Seen insertion after a non-peek body fetch.
    fn set_seen_after_fetch(&mut self, uids: &IdSet) {
        let seen = match flags::id("\\Seen") {
            Some(id) => id,
            None => return,
        };
        let mailbox = match self.selected_mailbox() {
            Some(mb) => mb,
            None => return,
        };
        let mailbox_id = mailbox.borrow().id();
        let modseq = mailbox.borrow_mut().allocate_modseq();

        let q = Query::new(
            "with ins as (insert into flags (mailbox, uid, flag) \
             select $1, u.uid, $2 from mailbox_messages u \
             where u.mailbox=$1 and u.uid = ANY($3) \
             on conflict do nothing) \
             update mailbox_messages set modseq=$4 \
             where mailbox=$1 and uid = ANY($3)",
        );
        q.bind(1, mailbox_id)
            .bind(2, seen)
            .bind(3, Value::IntSet(uids.iter().collect()))
            .bind(4, modseq);
        q.set_can_fail();
        q.execute(None);

        // The flag list per UID is not rebuilt here; sessions learn
        // the new state through the announcement below.
        for uid in uids.iter() {
            mailbox.borrow_mut().announce(
                MailboxChange::Modified {
                    uid,
                    modseq,
                    flags: vec!["\\Seen".to_owned()],
                },
            );
        }
    }

    pub(crate) fn start_store(
        &mut self,
        ix: usize,
        set: SequenceSet,
        mode: StoreMode,
        silent: bool,
        store_flags: Vec<String>,
        unchanged_since: Option<u64>,
        uid_command: bool,
    ) {
        if self
            .selected_session()
            .map_or(true, |s| s.borrow().read_only())
        {
            self.records[ix].finish(
                Done::no("Mailbox is read-only")
                    .with_code("NOPERM"),
            );
            return;
        }

        let uids = match self.resolve_set(&set, uid_command) {
            Some(uids) if !uids.is_empty() => uids,
            _ => {
                self.records[ix].finish(Done::ok("done"));
                return;
            },
        };

        // Unknown keywords must exist in flag_names before the
        // transaction references their ids.
        let unknown: Vec<String> = store_flags
            .iter()
            .filter(|f| flags::id(f).is_none())
            .cloned()
            .collect();

        let tx = Transaction::new();
        self.records[ix].run = RunState::Store {
            tx,
            phase: 0,
            queries: Vec::new(),
            uids,
            mode,
            silent,
            flags: store_flags,
            unchanged_since,
            uid_command,
        };
        self.records[ix].state = CmdState::Blocked;

        if unknown.is_empty() {
            self.store_apply(ix);
        } else {
            let tag = self.records[ix].tag.clone();
            let mut queries = Vec::new();
            for flag in unknown {
                let q = Query::prepared(
                    "ensure_flag",
                    "insert into flag_names (name) values ($1) \
                     on conflict (name) do update \
                     set name=excluded.name returning id, name",
                );
                q.bind(1, flag);
                q.execute(Some(self.make_task(&tag)));
                queries.push(q);
            }
            if let RunState::Store {
                queries: ref mut qs,
                ref mut phase,
                ..
            } = self.records[ix].run
            {
                *qs = queries;
                *phase = 1;
            }
        }
    }

    /// Phase 2 of STORE: the transactional flag mutation.
    fn store_apply(&mut self, ix: usize) {
        let (tx, uids, mode, store_flags, unchanged_since) =
            match self.records[ix].run {
                RunState::Store {
                    ref tx,
                    ref uids,
                    mode,
                    ref flags,
                    unchanged_since,
                    ..
                } => (
                    tx.clone(),
                    uids.clone(),
                    mode,
                    flags.clone(),
                    unchanged_since,
                ),
                _ => return,
            };

        let mailbox = match self.selected_mailbox() {
            Some(mb) => mb,
            None => {
                self.records[ix]
                    .finish(Done::bad("No mailbox selected"));
                return;
            },
        };
        let mailbox_id = mailbox.borrow().id();
        let uid_values: Vec<u32> = uids.iter().collect();
        let flag_ids: Vec<u32> = store_flags
            .iter()
            .filter_map(|f| flags::id(f))
            .collect();
        let tag = self.records[ix].tag.clone();

        let mut queries = Vec::new();

        // UNCHANGEDSINCE: find the rows that moved since the client
        // looked; they are excluded and reported as [MODIFIED].
        if let Some(since) = unchanged_since {
            let q = Query::new(
                "select uid from mailbox_messages \
                 where mailbox=$1 and uid = ANY($2) and modseq>$3 \
                 order by uid",
            );
            q.bind(1, mailbox_id)
                .bind(2, Value::IntSet(uid_values.clone()))
                .bind(3, since);
            q.attach_task(self.make_task(&tag));
            tx.enqueue(q.clone());
            queries.push(q.clone());
        }

        // Rows that failed the UNCHANGEDSINCE check must be left
        // exactly as they were; the modseq guard keeps them out of
        // every mutation.
        let since = unchanged_since;
        let insert_flag = |flag: u32| {
            let sql = format!(
                "insert into flags (mailbox, uid, flag) \
                 select $1, uid, $2 from mailbox_messages \
                 where mailbox=$1 and uid = ANY($3){} \
                 on conflict do nothing",
                if since.is_some() { " and modseq<=$4" } else { "" },
            );
            let q = Query::new(sql);
            q.bind(1, mailbox_id)
                .bind(2, flag)
                .bind(3, Value::IntSet(uid_values.clone()));
            if let Some(since) = since {
                q.bind(4, since);
            }
            q
        };
        let delete_guard = |placeholder: u16| {
            if since.is_some() {
                format!(
                    " and uid in (select uid from mailbox_messages \
                     where mailbox=$1 and modseq<=${})",
                    placeholder,
                )
            } else {
                String::new()
            }
        };

        match mode {
            StoreMode::Replace => {
                let sql = format!(
                    "delete from flags \
                     where mailbox=$1 and uid = ANY($2){}",
                    delete_guard(3),
                );
                let q = Query::new(sql);
                q.bind(1, mailbox_id)
                    .bind(2, Value::IntSet(uid_values.clone()));
                if let Some(since) = since {
                    q.bind(3, since);
                }
                tx.enqueue(q);
                for flag in &flag_ids {
                    tx.enqueue(insert_flag(*flag));
                }
            },
            StoreMode::Add => {
                for flag in &flag_ids {
                    tx.enqueue(insert_flag(*flag));
                }
            },
            StoreMode::Remove => {
                for flag in &flag_ids {
                    let sql = format!(
                        "delete from flags \
                         where mailbox=$1 and flag=$2 \
                         and uid = ANY($3){}",
                        delete_guard(4),
                    );
                    let q = Query::new(sql);
                    q.bind(1, mailbox_id)
                        .bind(2, *flag)
                        .bind(
                            3,
                            Value::IntSet(uid_values.clone()),
                        );
                    if let Some(since) = since {
                        q.bind(4, since);
                    }
                    tx.enqueue(q);
                }
            },
        }

        // One MODSEQ for the whole operation.
        let bump_sql = format!(
            "with b as (update mailboxes \
             set nextmodseq=nextmodseq+1 where id=$1 \
             returning nextmodseq-1 as modseq) \
             update mailbox_messages set modseq=b.modseq \
             from b where mailbox=$1 and uid = ANY($2){} \
             returning b.modseq as modseq",
            if since.is_some() {
                " and mailbox_messages.modseq<=$3"
            } else {
                ""
            },
        );
        let bump = Query::new(bump_sql);
        bump.bind(1, mailbox_id)
            .bind(2, Value::IntSet(uid_values.clone()));
        if let Some(since) = since {
            bump.bind(3, since);
        }
        bump.attach_task(self.make_task(&tag));
        tx.enqueue(bump.clone());
        queries.push(bump);

        // Reread the final flag state for the FETCH responses.
        let reread = Query::new(
            "select uid, flag from flags \
             where mailbox=$1 and uid = ANY($2) order by uid",
        );
        reread
            .bind(1, mailbox_id)
            .bind(2, Value::IntSet(uid_values));
        reread.attach_task(self.make_task(&tag));
        tx.enqueue(reread.clone());
        queries.push(reread);

        tx.commit(Some(self.make_task(&tag)));

        if let RunState::Store {
            queries: ref mut qs,
            ref mut phase,
            ..
        } = self.records[ix].run
        {
            *qs = queries;
            *phase = 2;
        }
    }

    pub(crate) fn advance_store(&mut self, ix: usize) {
        let phase = match self.records[ix].run {
            RunState::Store { phase, .. } => phase,
            _ => return,
        };

        match phase {
            1 => {
                // Flag interning round.
                let queries = match self.records[ix].run {
                    RunState::Store { ref queries, .. } => {
                        queries.clone()
                    },
                    _ => return,
                };
                if !queries.iter().all(Query::done) {
                    return;
                }
                for q in &queries {
                    if q.failed() {
                        self.records[ix].finish(
                            Done::no("Cannot create flag")
                                .with_code("SERVERBUG"),
                        );
                        return;
                    }
                    while let Some(row) = q.next_row() {
                        if let (Some(id), Some(name)) =
                            (row.uint("id"), row.text("name"))
                        {
                            flags::add(id, &name);
                        }
                    }
                }
                self.store_apply(ix);
            },
            2 => self.finish_store(ix),
            _ => (),
        }
    }

    fn finish_store(&mut self, ix: usize) {
        let (tx, queries, uids, silent, unchanged_since, uid_command) =
            match self.records[ix].run {
                RunState::Store {
                    ref tx,
                    ref queries,
                    ref uids,
                    silent,
                    unchanged_since,
                    uid_command,
                    ..
                } => (
                    tx.clone(),
                    queries.clone(),
                    uids.clone(),
                    silent,
                    unchanged_since,
                    uid_command,
                ),
                _ => return,
            };

        if !tx.done() {
            return;
        }
        if tx.failed() {
            self.records[ix].finish(
                Done::no(format!(
                    "STORE failed: {}",
                    tx.error().unwrap_or_default(),
                ))
                .with_code("SERVERBUG"),
            );
            return;
        }

        // queries layout: [unchanged?] bump reread
        let mut qix = 0;
        let mut modified = IdSet::new();
        if unchanged_since.is_some() {
            while let Some(row) = queries[qix].next_row() {
                if let Some(uid) = row.uint("uid") {
                    modified.insert(uid);
                }
            }
            qix += 1;
        }

        let mut new_modseq = 0u64;
        while let Some(row) = queries[qix].next_row() {
            if let Some(modseq) = row.bigint("modseq") {
                new_modseq = new_modseq.max(modseq as u64);
            }
        }
        qix += 1;

        let mut flags_by_uid: HashMap<u32, Vec<String>> =
            HashMap::new();
        while let Some(row) = queries[qix].next_row() {
            if let (Some(uid), Some(flag_id)) =
                (row.uint("uid"), row.uint("flag"))
            {
                if let Some(name) = flags::name(flag_id) {
                    flags_by_uid
                        .entry(uid)
                        .or_insert_with(Vec::new)
                        .push(name);
                }
            }
        }

        if let Some(mailbox) = self.selected_mailbox() {
            for uid in uids.iter() {
                if modified.contains(uid) {
                    continue;
                }
                mailbox.borrow_mut().announce(
                    MailboxChange::Modified {
                        uid,
                        modseq: new_modseq,
                        flags: flags_by_uid
                            .get(&uid)
                            .cloned()
                            .unwrap_or_default(),
                    },
                );
            }
        }

        // .SILENT suppresses our own FETCH responses; other sessions
        // still hear about the change. The queued responses for this
        // session are dropped here when silent.
        if silent {
            if let Some(session) = self.selected_session() {
                let _ = session.borrow_mut().take_pending(false);
            }
        }

        let done = if modified.is_empty() {
            Done::ok("done")
        } else {
            let set = if uid_command {
                modified.imap_string()
            } else {
                let session = self.selected_session();
                modified
                    .iter()
                    .filter_map(|uid| {
                        session
                            .as_ref()
                            .and_then(|s| s.borrow().msn_of(uid))
                    })
                    .collect::<IdSet>()
                    .imap_string()
            };
            Done::no("Some messages changed meanwhile")
                .with_code(format!("MODIFIED {}", set))
        };
        self.records[ix].finish(done);
    }

    /// EXPUNGE, UID EXPUNGE, and the expunge half of CLOSE.
    pub(crate) fn start_expunge_like(
        &mut self,
        ix: usize,
        uid_set: Option<SequenceSet>,
        closing: bool,
    ) {
        let session = match self.selected_session() {
            Some(session) => session,
            None => {
                self.records[ix]
                    .finish(Done::bad("No mailbox selected"));
                return;
            },
        };
        if session.borrow().read_only() {
            if closing {
                // CLOSE on a read-only mailbox just deselects.
                self.records[ix].finish(Done::ok("done"));
                return;
            }
            self.records[ix].finish(
                Done::no("Mailbox is read-only")
                    .with_code("NOPERM"),
            );
            return;
        }

        let candidates = match uid_set {
            Some(ref set) => {
                match self.resolve_set(set, true) {
                    Some(uids) => uids,
                    None => {
                        self.records[ix].finish(Done::bad(
                            "Malformed sequence set",
                        ));
                        return;
                    },
                }
            },
            None => session.borrow().uids().clone(),
        };

        let deleted_flag = match flags::id("\\Deleted") {
            Some(id) => id,
            None => {
                // Nothing can be flagged deleted if the flag has no
                // id yet.
                self.records[ix].finish(Done::ok("done"));
                return;
            },
        };

        let mailbox_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let tag = self.records[ix].tag.clone();

        let tx = Transaction::new();
        let find = Query::new(
            "select uid from flags \
             where mailbox=$1 and flag=$2 and uid = ANY($3) \
             order by uid",
        );
        find.bind(1, mailbox_id)
            .bind(2, deleted_flag)
            .bind(3, Value::IntSet(candidates.iter().collect()));
        find.attach_task(self.make_task(&tag));
        tx.enqueue(find.clone());
        tx.execute();

        self.records[ix].run = RunState::Expunge {
            tx,
            phase: 1,
            query: find,
            uids: IdSet::new(),
            closing,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_expunge(&mut self, ix: usize) {
        let (tx, phase, query, closing) = match self.records[ix].run
        {
            RunState::Expunge {
                ref tx,
                phase,
                ref query,
                closing,
                ..
            } => (tx.clone(), phase, query.clone(), closing),
            _ => return,
        };

        match phase {
            1 => {
                if !query.done() {
                    return;
                }
                if query.failed() {
                    tx.rollback(None);
                    self.records[ix].finish(
                        Done::no("Database error")
                            .with_code("SERVERBUG"),
                    );
                    return;
                }

                let mut doomed = IdSet::new();
                while let Some(row) = query.next_row() {
                    if let Some(uid) = row.uint("uid") {
                        doomed.insert(uid);
                    }
                }

                if doomed.is_empty() {
                    let tag = self.records[ix].tag.clone();
                    tx.commit(Some(self.make_task(&tag)));
                    if let RunState::Expunge {
                        ref mut phase, ..
                    } = self.records[ix].run
                    {
                        *phase = 3;
                    }
                    return;
                }

                let mailbox_id = self
                    .selected_mailbox()
                    .map_or(0, |mb| mb.borrow().id());
                let tag = self.records[ix].tag.clone();
                let uid_values: Vec<u32> = doomed.iter().collect();

                // Copy-then-delete with a fresh MODSEQ recorded on the
                // tombstones.
                let move_rows = Query::new(
                    "with b as (update mailboxes \
                     set nextmodseq=nextmodseq+1 where id=$1 \
                     returning nextmodseq-1 as modseq), \
                     moved as (insert into deleted_messages \
                     (mailbox, uid, message, modseq) \
                     select mm.mailbox, mm.uid, mm.message, b.modseq \
                     from mailbox_messages mm, b \
                     where mm.mailbox=$1 and mm.uid = ANY($2) \
                     returning uid) \
                     delete from mailbox_messages \
                     where mailbox=$1 and uid = ANY($2) \
                     returning (select modseq from b) as modseq",
                );
                move_rows
                    .bind(1, mailbox_id)
                    .bind(2, Value::IntSet(uid_values));
                move_rows.attach_task(self.make_task(&tag));
                tx.enqueue(move_rows.clone());
                tx.commit(Some(self.make_task(&tag)));

                if let RunState::Expunge {
                    ref mut phase,
                    ref mut uids,
                    query: ref mut q,
                    ..
                } = self.records[ix].run
                {
                    *phase = 2;
                    *uids = doomed;
                    *q = move_rows;
                }
            },
            2 => {
                let uids = match self.records[ix].run {
                    RunState::Expunge { ref uids, .. } => {
                        uids.clone()
                    },
                    _ => return,
                };
                if !tx.done() {
                    return;
                }
                if tx.failed() {
                    self.records[ix].finish(
                        Done::no(format!(
                            "EXPUNGE failed: {}",
                            tx.error().unwrap_or_default(),
                        ))
                        .with_code("SERVERBUG"),
                    );
                    return;
                }

                let mut modseq = 0u64;
                while let Some(row) = query.next_row() {
                    if let Some(m) = row.bigint("modseq") {
                        modseq = modseq.max(m as u64);
                    }
                }

                // Commit is durable; now the sessions may hear it.
                if let Some(mailbox) = self.selected_mailbox() {
                    mailbox.borrow_mut().announce(
                        MailboxChange::Expunged {
                            uids: uids.clone(),
                            modseq,
                        },
                    );
                }

                if closing {
                    // CLOSE swallows the untagged EXPUNGEs for this
                    // session.
                    if let Some(session) = self.selected_session()
                    {
                        let _ = session
                            .borrow_mut()
                            .take_pending(true);
                    }
                }

                self.records[ix].finish(Done::ok("done"));
            },
            _ => {
                // Nothing was deleted.
                if tx.done() {
                    self.records[ix].finish(Done::ok("done"));
                }
            },
        }
    }

    pub(crate) fn start_copy(
        &mut self,
        ix: usize,
        set: SequenceSet,
        target: String,
        uid_command: bool,
    ) {
        let source = match self.resolve_set(&set, uid_command) {
            Some(uids) if !uids.is_empty() => uids,
            _ => {
                self.records[ix].finish(Done::ok("done"));
                return;
            },
        };
        let target_mb = match self.find_mailbox(&target) {
            Some(mb) => mb,
            None => {
                self.records[ix].finish(
                    Done::no("No such mailbox")
                        .with_code("TRYCREATE"),
                );
                return;
            },
        };

        let source_id = self
            .selected_mailbox()
            .map_or(0, |mb| mb.borrow().id());
        let target_id = target_mb.borrow().id();
        let count = source.len() as u32;

        let query = Query::new(
            "with u as (update mailboxes \
             set uidnext=uidnext+$3, nextmodseq=nextmodseq+1 \
             where id=$2 \
             returning uidnext-$3 as base, \
             nextmodseq-1 as modseq) \
             insert into mailbox_messages \
             (mailbox, uid, message, modseq, idate) \
             select $2, u.base + row_number() \
             over (order by mm.uid) - 1, \
             mm.message, u.modseq, mm.idate \
             from mailbox_messages mm, u \
             where mm.mailbox=$1 and mm.uid = ANY($4) \
             returning uid, modseq",
        );
        query
            .bind(1, source_id)
            .bind(2, target_id)
            .bind(3, count)
            .bind(4, Value::IntSet(source.iter().collect()));
        let tag = self.records[ix].tag.clone();
        query.execute(Some(self.make_task(&tag)));

        self.records[ix].run = RunState::Copy {
            query,
            source,
            target: target_mb,
            uid_command,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_copy(&mut self, ix: usize) {
        let (query, source, target) = match self.records[ix].run {
            RunState::Copy {
                ref query,
                ref source,
                ref target,
                ..
            } => {
                (query.clone(), source.clone(), Rc::clone(target))
            },
            _ => return,
        };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no(format!(
                    "COPY failed: {}",
                    query.error().unwrap_or_default(),
                ))
                .with_code("SERVERBUG"),
            );
            return;
        }

        let mut new_uids = IdSet::new();
        let mut modseq = 0u64;
        while let Some(row) = query.next_row() {
            if let Some(uid) = row.uint("uid") {
                new_uids.insert(uid);
            }
            if let Some(m) = row.bigint("modseq") {
                modseq = modseq.max(m as u64);
            }
        }

        // Tell the target mailbox's sessions.
        for uid in new_uids.iter() {
            target
                .borrow_mut()
                .announce(MailboxChange::New { uid, modseq });
        }

        let uidvalidity = target.borrow().uidvalidity();
        self.records[ix].finish(
            Done::ok("done").with_code(format!(
                "COPYUID {} {} {}",
                uidvalidity,
                source.imap_string(),
                new_uids.imap_string(),
            )),
        );
    }
}
