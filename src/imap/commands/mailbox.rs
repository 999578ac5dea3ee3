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

//! Mailbox-level commands: SELECT/EXAMINE, CREATE/DELETE/RENAME,
//! SUBSCRIBE/UNSUBSCRIBE, LIST/LSUB, STATUS and APPEND.

use std::rc::Rc;

use chrono::NaiveDate;

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::imap::command::{CmdState, Done, RunState};
use crate::imap::server::ImapConnection;
use crate::imap::syntax::StatusItem;
use crate::store::idset::IdSet;
use crate::store::interner::flags;
use crate::store::mailbox::{self, MailboxChange};
use crate::store::session::Session;

impl ImapConnection {
    pub(crate) fn start_select(
        &mut self,
        ix: usize,
        name: String,
        examine: bool,
        condstore: bool,
    ) {
        if condstore {
            self.condstore_enabled = true;
        }

        // The registry usually has the mailbox already; fall back to
        // the database when it does not.
        if let Some(mb) = self.find_mailbox(&name) {
            self.start_select_uids(ix, mb, examine, condstore);
            return;
        }

        let full = self.resolve_mailbox_name(&name);
        let query = Query::prepared(
            "mailbox_by_name",
            "select id, name, owner, uidnext, uidvalidity, \
             nextmodseq from mailboxes \
             where name=$1 and not deleted",
        );
        query.bind(1, full);
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::SelectMailbox {
            query,
            examine,
            condstore,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    fn start_select_uids(
        &mut self,
        ix: usize,
        mb: Rc<std::cell::RefCell<crate::store::mailbox::Mailbox>>,
        examine: bool,
        condstore: bool,
    ) {
        let query = Query::prepared(
            "select_uids",
            "select uid, modseq from mailbox_messages \
             where mailbox=$1 order by uid",
        );
        query.bind(1, mb.borrow().id());
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::SelectUids {
            query,
            mailbox: mb,
            examine,
            condstore,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_select(&mut self, ix: usize) {
        enum Phase {
            Mailbox(Query, bool, bool),
            Uids(
                Query,
                Rc<std::cell::RefCell<
                    crate::store::mailbox::Mailbox,
                >>,
                bool,
                bool,
            ),
        }
        let phase = match self.records[ix].run {
            RunState::SelectMailbox {
                ref query,
                examine,
                condstore,
            } => Phase::Mailbox(query.clone(), examine, condstore),
            RunState::SelectUids {
                ref query,
                ref mailbox,
                examine,
                condstore,
            } => Phase::Uids(
                query.clone(),
                Rc::clone(mailbox),
                examine,
                condstore,
            ),
            _ => return,
        };

        match phase {
            Phase::Mailbox(query, examine, condstore) => {
                if !query.done() {
                    return;
                }
                if query.failed() {
                    self.records[ix].finish(
                        Done::no("Database error")
                            .with_code("SERVERBUG"),
                    );
                    return;
                }
                match query.next_row() {
                    Some(row) => {
                        let mb = mailbox::obtain(
                            row.uint("id").unwrap_or(0),
                            &row.text("name").unwrap_or_default(),
                            row.uint("owner"),
                            row.uint("uidnext").unwrap_or(1),
                            row.uint("uidvalidity").unwrap_or(1),
                            row.bigint("nextmodseq").unwrap_or(1)
                                as u64,
                        );
                        self.start_select_uids(
                            ix, mb, examine, condstore,
                        );
                    },
                    None => {
                        self.records[ix].finish(
                            Done::no("No such mailbox")
                                .with_code("NONEXISTENT"),
                        );
                    },
                }
            },
            Phase::Uids(query, mb, examine, condstore) => {
                // Rows stream in; wait for completion so EXISTS is
                // exact.
                if !query.done() {
                    return;
                }
                if query.failed() {
                    self.records[ix].finish(
                        Done::no("Database error")
                            .with_code("SERVERBUG"),
                    );
                    return;
                }

                let mut uids = IdSet::new();
                let mut highest_modseq = 1u64;
                while let Some(row) = query.next_row() {
                    if let Some(uid) = row.uint("uid") {
                        uids.insert(uid);
                    }
                    if let Some(modseq) = row.bigint("modseq") {
                        highest_modseq =
                            highest_modseq.max(modseq as u64);
                    }
                }
                mb.borrow_mut().observe_modseq(highest_modseq);

                let owns_recent =
                    !examine && !mb.borrow().recent_is_claimed();
                let read_only = examine;
                let mut session = Session::new(
                    mb.borrow().id(),
                    read_only,
                    uids,
                    IdSet::new(),
                    owns_recent,
                    highest_modseq,
                );
                session.mark_announced();

                {
                    let record = &mut self.records[ix];
                    let mb = mb.borrow();
                    record.untagged.push(
                        "* FLAGS (\\Answered \\Flagged \\Deleted \
                         \\Seen \\Draft)"
                            .to_owned(),
                    );
                    record.untagged.push(format!(
                        "* {} EXISTS",
                        session.exists(),
                    ));
                    record.untagged.push(format!(
                        "* {} RECENT",
                        session.recent().len(),
                    ));
                    record.untagged.push(format!(
                        "* OK [UIDVALIDITY {}] valid",
                        mb.uidvalidity(),
                    ));
                    record.untagged.push(format!(
                        "* OK [UIDNEXT {}] next",
                        mb.uidnext(),
                    ));
                    record.untagged.push(format!(
                        "* OK [HIGHESTMODSEQ {}] tracked",
                        highest_modseq,
                    ));
                    record.untagged.push(if read_only {
                        "* OK [PERMANENTFLAGS ()] none permitted"
                            .to_owned()
                    } else {
                        "* OK [PERMANENTFLAGS (\\Answered \\Flagged \
                         \\Deleted \\Seen \\Draft \\*)] ok"
                            .to_owned()
                    });
                }

                self.install_session(mb, session);
                let code = if read_only {
                    "READ-ONLY"
                } else {
                    "READ-WRITE"
                };
                let _ = condstore;
                self.records[ix].finish(
                    Done::ok("selected").with_code(code),
                );
            },
        }
    }

    pub(crate) fn start_create(&mut self, ix: usize, name: String) {
        if name.eq_ignore_ascii_case("INBOX") {
            self.records[ix]
                .finish(Done::no("INBOX already exists"));
            return;
        }
        let full = self.resolve_mailbox_name(&name);
        if mailbox::by_name(&full).is_some() {
            self.records[ix].finish(
                Done::no("Mailbox already exists")
                    .with_code("ALREADYEXISTS"),
            );
            return;
        }

        let owner = self.user.as_ref().map(|u| u.id);
        let query = Query::prepared(
            "create_mailbox",
            "insert into mailboxes \
             (name, owner, uidnext, uidvalidity, nextmodseq, deleted) \
             values ($1, $2, 1, 1, 1, false) \
             on conflict (name) do update \
             set deleted=false, uidvalidity=mailboxes.uidvalidity+1 \
             where mailboxes.deleted \
             returning id, uidvalidity",
        );
        query.bind(1, full.as_str());
        match owner {
            Some(id) => query.bind(2, id),
            None => query.bind_null(2),
        };
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::MailboxMutation {
            query,
            verb: "CREATE",
            name: full,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn start_delete(&mut self, ix: usize, name: String) {
        if name.eq_ignore_ascii_case("INBOX") {
            self.records[ix]
                .finish(Done::no("Cannot delete INBOX"));
            return;
        }
        let full = self.resolve_mailbox_name(&name);
        if !mailbox::children_of(&full).is_empty() {
            self.records[ix]
                .finish(Done::no("Mailbox has inferiors"));
            return;
        }

        let query = Query::prepared(
            "delete_mailbox",
            "update mailboxes set deleted=true \
             where name=$1 and not deleted returning id",
        );
        query.bind(1, full.as_str());
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::MailboxMutation {
            query,
            verb: "DELETE",
            name: full,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn start_rename(
        &mut self,
        ix: usize,
        from: String,
        to: String,
    ) {
        let from_full = self.resolve_mailbox_name(&from);
        let to_full = self.resolve_mailbox_name(&to);
        if from_full == to_full {
            self.records[ix]
                .finish(Done::no("Source and destination are equal"));
            return;
        }
        if mailbox::by_name(&to_full).is_some() {
            self.records[ix].finish(
                Done::no("Destination exists")
                    .with_code("ALREADYEXISTS"),
            );
            return;
        }
        if to_full.starts_with(&format!("{}/", from_full)) {
            self.records[ix].finish(
                Done::no("Cannot rename into own child"),
            );
            return;
        }

        // If a deleted mailbox holds the target name, the rename lands
        // on top of it and its old UIDs must die with a UIDVALIDITY
        // bump.
        let query = Query::prepared(
            "rename_mailbox",
            "with gone as (delete from mailboxes \
             where name=$2 and deleted returning uidvalidity) \
             update mailboxes set name=$2, \
             uidvalidity=uidvalidity \
             + coalesce((select count(*) from gone), 0) \
             where name=$1 and not deleted \
             returning id, uidvalidity",
        );
        query.bind(1, from_full.as_str());
        query.bind(2, to_full.as_str());
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::MailboxMutation {
            query,
            verb: "RENAME",
            name: to_full,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn start_subscription(
        &mut self,
        ix: usize,
        name: String,
        subscribe: bool,
    ) {
        let full = self.resolve_mailbox_name(&name);
        let owner = self.user.as_ref().map_or(0, |u| u.id);
        let query = if subscribe {
            let q = Query::prepared(
                "subscribe",
                "insert into subscriptions (owner, mailbox) \
                 select $1, id from mailboxes \
                 where name=$2 and not deleted \
                 on conflict do nothing returning mailbox",
            );
            q.bind(1, owner).bind(2, full.as_str());
            q
        } else {
            let q = Query::prepared(
                "unsubscribe",
                "delete from subscriptions \
                 where owner=$1 and mailbox=\
                 (select id from mailboxes where name=$2) \
                 returning mailbox",
            );
            q.bind(1, owner).bind(2, full.as_str());
            q
        };
        query.set_can_fail();
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::MailboxMutation {
            query,
            verb: if subscribe {
                "SUBSCRIBE"
            } else {
                "UNSUBSCRIBE"
            },
            name: full,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_mailbox_mutation(&mut self, ix: usize) {
        let (query, verb, name) = match self.records[ix].run {
            RunState::MailboxMutation {
                ref query,
                verb,
                ref name,
                ..
            } => (query.clone(), verb, name.clone()),
            _ => return,
        };

        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no(format!(
                    "{} failed: {}",
                    verb,
                    query.error().unwrap_or_default(),
                ))
                .with_code("SERVERBUG"),
            );
            return;
        }

        let row = query.next_row();
        match verb {
            "CREATE" => match row {
                Some(row) => {
                    mailbox::obtain(
                        row.uint("id").unwrap_or(0),
                        &name,
                        self.user.as_ref().map(|u| u.id),
                        1,
                        row.uint("uidvalidity").unwrap_or(1),
                        1,
                    );
                    self.records[ix]
                        .finish(Done::ok("created"));
                },
                None => {
                    self.records[ix].finish(
                        Done::no("Mailbox already exists")
                            .with_code("ALREADYEXISTS"),
                    );
                },
            },
            "DELETE" => match row {
                Some(row) => {
                    if let Some(id) = row.uint("id") {
                        mailbox::forget(id);
                    }
                    self.records[ix]
                        .finish(Done::ok("deleted"));
                },
                None => {
                    self.records[ix].finish(
                        Done::no("No such mailbox")
                            .with_code("NONEXISTENT"),
                    );
                },
            },
            "RENAME" => match row {
                Some(row) => {
                    if let Some(id) = row.uint("id") {
                        if let Some(mb) = mailbox::by_id(id) {
                            // Refresh the registry entry under its new
                            // name.
                            let (owner, uidnext, next_modseq) = {
                                let mb = mb.borrow();
                                (
                                    mb.owner(),
                                    mb.uidnext(),
                                    mb.next_modseq(),
                                )
                            };
                            mailbox::forget(id);
                            mailbox::obtain(
                                id,
                                &name,
                                owner,
                                uidnext,
                                row.uint("uidvalidity")
                                    .unwrap_or(1),
                                next_modseq,
                            );
                        }
                    }
                    self.records[ix]
                        .finish(Done::ok("renamed"));
                },
                None => {
                    self.records[ix].finish(
                        Done::no("No such mailbox")
                            .with_code("NONEXISTENT"),
                    );
                },
            },
            // SUBSCRIBE/UNSUBSCRIBE succeed regardless of whether a
            // row came back; an unsubscription from nothing is a
            // no-op.
            _ => {
                self.records[ix].finish(Done::ok("done"));
            },
        }
    }

    pub(crate) fn run_list(
        &mut self,
        ix: usize,
        reference: &str,
        pattern: &str,
    ) {
        let full_pattern = self.absolute_pattern(reference, pattern);
        let mut lines = Vec::new();
        for mb in mailbox::matching(&full_pattern) {
            let mb = mb.borrow();
            let has_children =
                !mailbox::children_of(mb.name()).is_empty();
            let display = self.display_name(mb.name());
            lines.push(format!(
                "* LIST ({}) \"/\" {}",
                if has_children {
                    "\\HasChildren"
                } else {
                    "\\HasNoChildren"
                },
                quote_mailbox(&display),
            ));
        }
        let record = &mut self.records[ix];
        record.untagged.extend(lines);
        record.finish(Done::ok("done"));
    }

    pub(crate) fn start_lsub(
        &mut self,
        ix: usize,
        reference: &str,
        pattern: &str,
    ) {
        let owner = self.user.as_ref().map_or(0, |u| u.id);
        let query = Query::prepared(
            "lsub",
            "select m.name from subscriptions s \
             join mailboxes m on (m.id=s.mailbox) \
             where s.owner=$1 order by m.name",
        );
        query.bind(1, owner);
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::Lsub {
            query,
            pattern: self.absolute_pattern(reference, pattern),
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_lsub(&mut self, ix: usize) {
        let (query, pattern) = match self.records[ix].run {
            RunState::Lsub {
                ref query,
                ref pattern,
            } => (query.clone(), pattern.clone()),
            _ => return,
        };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no("Database error").with_code("SERVERBUG"),
            );
            return;
        }

        let mut lines = Vec::new();
        while let Some(row) = query.next_row() {
            if let Some(name) = row.text("name") {
                if mailbox::list_matches(&pattern, &name) {
                    let display = self.display_name(&name);
                    lines.push(format!(
                        "* LSUB () \"/\" {}",
                        quote_mailbox(&display),
                    ));
                }
            }
        }
        let record = &mut self.records[ix];
        record.untagged.extend(lines);
        record.finish(Done::ok("done"));
    }

    pub(crate) fn start_status(
        &mut self,
        ix: usize,
        name: String,
        items: Vec<StatusItem>,
    ) {
        let mb = match self.find_mailbox(&name) {
            Some(mb) => mb,
            None => {
                self.records[ix].finish(
                    Done::no("No such mailbox")
                        .with_code("NONEXISTENT"),
                );
                return;
            },
        };

        let seen = flags::id("\\Seen").unwrap_or(0);
        let query = Query::prepared(
            "status_counts",
            "select \
             (select count(*) from mailbox_messages \
              where mailbox=$1) as messages, \
             (select count(*) from mailbox_messages mm \
              where mm.mailbox=$1 and not exists \
              (select 1 from flags f where f.mailbox=$1 \
               and f.uid=mm.uid and f.flag=$2)) as unseen",
        );
        query.bind(1, mb.borrow().id()).bind(2, seen);
        let task = self.make_task(&self.records[ix].tag.clone());
        query.execute(Some(task));
        self.records[ix].run = RunState::Status {
            query,
            items,
            mailbox_name: name,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_status(&mut self, ix: usize) {
        let (query, items, name) = match self.records[ix].run {
            RunState::Status {
                ref query,
                ref items,
                ref mailbox_name,
            } => (query.clone(), items.clone(), mailbox_name.clone()),
            _ => return,
        };
        if !query.done() {
            return;
        }
        if query.failed() {
            self.records[ix].finish(
                Done::no("Database error").with_code("SERVERBUG"),
            );
            return;
        }

        let row = query.next_row();
        let messages = row
            .as_ref()
            .and_then(|r| r.bigint("messages"))
            .unwrap_or(0);
        let unseen = row
            .as_ref()
            .and_then(|r| r.bigint("unseen"))
            .unwrap_or(0);

        let mb = match self.find_mailbox(&name) {
            Some(mb) => mb,
            None => {
                self.records[ix].finish(
                    Done::no("No such mailbox")
                        .with_code("NONEXISTENT"),
                );
                return;
            },
        };
        let mb = mb.borrow();

        let mut parts = Vec::new();
        for item in items {
            match item {
                StatusItem::Messages => {
                    parts.push(format!("MESSAGES {}", messages))
                },
                StatusItem::Recent => {
                    parts.push("RECENT 0".to_owned())
                },
                StatusItem::UidNext => {
                    parts.push(format!("UIDNEXT {}", mb.uidnext()))
                },
                StatusItem::UidValidity => parts.push(format!(
                    "UIDVALIDITY {}",
                    mb.uidvalidity(),
                )),
                StatusItem::Unseen => {
                    parts.push(format!("UNSEEN {}", unseen))
                },
                StatusItem::HighestModseq => parts.push(format!(
                    "HIGHESTMODSEQ {}",
                    mb.next_modseq().saturating_sub(1),
                )),
            }
        }

        let display = self.display_name(mb.name());
        let record = &mut self.records[ix];
        record.untagged.push(format!(
            "* STATUS {} ({})",
            quote_mailbox(&display),
            parts.join(" "),
        ));
        record.finish(Done::ok("done"));
    }

    pub(crate) fn start_append(
        &mut self,
        ix: usize,
        name: String,
        append_flags: Vec<String>,
        date: Option<NaiveDate>,
        message: Vec<u8>,
    ) {
        let mb = match self.find_mailbox(&name) {
            Some(mb) => mb,
            None => {
                self.records[ix].finish(
                    Done::no("No such mailbox")
                        .with_code("TRYCREATE"),
                );
                return;
            },
        };

        let idate = date
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let text =
            String::from_utf8_lossy(&message).into_owned();
        let size = message.len() as i64;
        let mailbox_id = mb.borrow().id();

        let tx = Transaction::new();
        let query = Query::new(
            "with m as (insert into messages (idate, rfc822size) \
             values ($2, $3) returning id), \
             b as (insert into bodyparts (text) values ($4) \
             returning id), \
             p as (insert into part_numbers \
             (message, part, bodypart) \
             select m.id, '', b.id from m, b), \
             u as (update mailboxes \
             set uidnext=uidnext+1, nextmodseq=nextmodseq+1 \
             where id=$1 \
             returning uidnext-1 as uid, nextmodseq-1 as modseq) \
             insert into mailbox_messages \
             (mailbox, uid, message, modseq, idate) \
             select $1, u.uid, m.id, u.modseq, $2 from m, u \
             returning uid, modseq",
        );
        query
            .bind(1, mailbox_id)
            .bind(2, idate)
            .bind(3, size)
            .bind(4, text);
        let task = self.make_task(&self.records[ix].tag.clone());
        query.attach_task(task);
        tx.enqueue(query.clone());
        tx.execute();

        self.records[ix].run = RunState::Append {
            tx,
            phase: 1,
            query,
            mailbox_id,
            flags: append_flags,
            uid: 0,
            modseq: 0,
        };
        self.records[ix].state = CmdState::Blocked;
    }

    pub(crate) fn advance_append(&mut self, ix: usize) {
        let (tx, phase, query, mailbox_id, append_flags) =
            match self.records[ix].run {
                RunState::Append {
                    ref tx,
                    phase,
                    ref query,
                    mailbox_id,
                    ref flags,
                    ..
                } => (
                    tx.clone(),
                    phase,
                    query.clone(),
                    mailbox_id,
                    flags.clone(),
                ),
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
                        Done::no("Append failed")
                            .with_code("SERVERBUG"),
                    );
                    return;
                }
                let row = query.next_row();
                let uid = row
                    .as_ref()
                    .and_then(|r| r.uint("uid"))
                    .unwrap_or(0);
                let modseq = row
                    .as_ref()
                    .and_then(|r| r.bigint("modseq"))
                    .unwrap_or(0) as u64;

                if !append_flags.is_empty() {
                    let flag_ids: Vec<u32> = append_flags
                        .iter()
                        .filter_map(|f| flags::id(f))
                        .collect();
                    for flag in flag_ids {
                        let q = Query::new(
                            "insert into flags (mailbox, uid, flag) \
                             values ($1, $2, $3) \
                             on conflict do nothing",
                        );
                        q.bind(1, mailbox_id)
                            .bind(2, uid)
                            .bind(3, flag);
                        tx.enqueue(q);
                    }
                }

                let tag = self.records[ix].tag.clone();
                let task = self.make_task(&tag);
                tx.commit(Some(task));
                if let RunState::Append {
                    ref mut phase,
                    uid: ref mut u,
                    modseq: ref mut m,
                    ..
                } = self.records[ix].run
                {
                    *phase = 2;
                    *u = uid;
                    *m = modseq;
                }
            },
            _ => {
                if !tx.done() {
                    return;
                }
                if tx.failed() {
                    self.records[ix].finish(
                        Done::no("Append failed")
                            .with_code("SERVERBUG"),
                    );
                    return;
                }
                let (uid, modseq) = match self.records[ix].run {
                    RunState::Append { uid, modseq, .. } => {
                        (uid, modseq)
                    },
                    _ => (0, 0),
                };

                let uidvalidity =
                    if let Some(mb) = mailbox::by_id(mailbox_id) {
                        mb.borrow_mut().announce(
                            MailboxChange::New { uid, modseq },
                        );
                        mb.borrow().uidvalidity()
                    } else {
                        1
                    };

                self.records[ix].finish(
                    Done::ok("completed").with_code(format!(
                        "APPENDUID {} {}",
                        uidvalidity, uid,
                    )),
                );
            },
        }
    }

    /// Joins the LIST reference and pattern and resolves relative
    /// names under the user's home.
    fn absolute_pattern(
        &self,
        reference: &str,
        pattern: &str,
    ) -> String {
        let joined = if pattern.starts_with('/') {
            pattern.to_owned()
        } else if reference.is_empty() {
            pattern.to_owned()
        } else if reference.ends_with('/') {
            format!("{}{}", reference, pattern)
        } else {
            format!("{}/{}", reference, pattern)
        };
        self.resolve_mailbox_name(&joined)
    }

    /// Converts a stored (absolute) mailbox name back to the form the
    /// client uses.
    pub(crate) fn display_name(&self, full: &str) -> String {
        if let Some(ref user) = self.user {
            if let Some(rest) = full.strip_prefix(&user.home) {
                return rest.to_owned();
            }
        }
        full.to_owned()
    }
}

pub(crate) fn quote_mailbox(name: &str) -> String {
    if !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(b, b'/' | b'.' | b'-' | b'_')
        })
    {
        name.to_owned()
    } else {
        format!(
            "\"{}\"",
            name.replace('\\', "\\\\").replace('"', "\\\""),
        )
    }
}
