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

//! The IMAP server proper.
//!
//! This file owns the wire loop: assembling command lines and their
//! literals, the AUTHENTICATE and IDLE sub-conversations, command
//! scheduling by group, and the untagged-response flush that runs at
//! every command boundary. The per-command database state machines live
//! in `imap::commands`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use lazy_static::lazy_static;
use log::{info, warn};
use regex::bytes::Regex;

use crate::imap::command::{
    CmdState, CommandRecord, Done, RunState,
};
use crate::imap::sasl::{
    Mechanism, SaslMachine, SaslState, Step, MECHANISMS,
};
use crate::imap::syntax::{self, Request};
use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{self, Client, Event};
use crate::server::task::Task;
use crate::store::mailbox::{self, Mailbox};
use crate::store::session::{Session, SessionResponse};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub const MAX_CMDLINE: usize = 65536;
const MAX_LITERAL: usize = 64 * 1024 * 1024;
const IDLE_TIMEOUT_SECS: u64 = 30 * 60;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r"\{([0-9]+)(\+?)\}$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: u32,
    pub login: String,
    /// Mailbox prefix, e.g. `/users/alice/`.
    pub home: String,
}

pub struct ImapConnection {
    pub(crate) conn: Rc<RefCell<Connection>>,
    pub(crate) weak_self: Weak<RefCell<ImapConnection>>,
    pub(crate) state: ProtoState,
    pub(crate) hostname: String,
    pub(crate) tls_helper: Option<String>,
    pub(crate) user: Option<User>,
    pub(crate) session: Option<Rc<RefCell<Session>>>,
    pub(crate) mailbox: Option<Rc<RefCell<Mailbox>>>,
    pub(crate) records: Vec<CommandRecord>,
    pub(crate) condstore_enabled: bool,
    cmdline: Vec<u8>,
    need_literal: usize,
    sasl: Option<(String, SaslMachine)>,
    idle_tag: Option<String>,
    compressed: bool,
    /// Set once the socket has been handed to the TLS helper; the
    /// IMAP side then ignores all traffic.
    detached: bool,
    pub(crate) tasks: Vec<Task>,
    sent_bye: bool,
}

impl ImapConnection {
    /// Wraps an accepted socket and registers with the reactor.
    pub fn spawn(
        fd: std::os::unix::io::RawFd,
        peer: String,
        hostname: String,
        tls_helper: Option<String>,
    ) -> Result<(), Error> {
        let prefix = LogPrefix::new("imap", peer);
        let conn = Rc::new(RefCell::new(Connection::wrap(
            fd,
            ConnKind::ImapServer,
            prefix,
        )?));
        conn.borrow_mut().extend_timeout(IDLE_TIMEOUT_SECS);

        let server = Rc::new(RefCell::new(ImapConnection {
            conn: Rc::clone(&conn),
            weak_self: Weak::new(),
            state: ProtoState::NotAuthenticated,
            hostname,
            tls_helper,
            user: None,
            session: None,
            mailbox: None,
            records: Vec::new(),
            condstore_enabled: false,
            cmdline: Vec::new(),
            need_literal: 0,
            sasl: None,
            idle_tag: None,
            compressed: false,
            detached: false,
            tasks: Vec::new(),
            sent_bye: false,
        }));
        server.borrow_mut().weak_self = Rc::downgrade(&server);

        {
            let mut s = server.borrow_mut();
            let greeting = format!(
                "* OK [CAPABILITY {}] Oryx IMAP server ready",
                s.capability_string(),
            );
            s.send(&greeting);
        }

        reactor::register(conn, server);
        Ok(())
    }

    pub(crate) fn send(&mut self, line: &str) {
        let mut conn = self.conn.borrow_mut();
        conn.enqueue_str(line);
        conn.enqueue_str("\r\n");
    }

    pub(crate) fn send_bytes(&mut self, bytes: &[u8]) {
        self.conn.borrow_mut().enqueue(bytes);
    }

    fn send_bye(&mut self, text: &str) {
        if !self.sent_bye {
            self.send(&format!("* BYE {}", text));
            self.sent_bye = true;
        }
    }

    /// Creates a task that re-enters `advance_command` for `tag` when
    /// an awaited operation completes.
    pub(crate) fn make_task(&mut self, tag: &str) -> Task {
        let weak = self.weak_self.clone();
        let tag = tag.to_owned();
        let task = Task::new(
            self.conn.borrow().log_prefix().clone(),
            move || {
                if let Some(me) = weak.upgrade() {
                    let mut me = me.borrow_mut();
                    me.advance_command(&tag);
                    me.flush_output();
                }
            },
        );
        self.tasks.push(task.clone());
        task
    }

    pub(crate) fn capability_string(&self) -> String {
        let mut caps = vec![
            "IMAP4rev1".to_owned(),
            "LITERAL+".to_owned(),
            "ID".to_owned(),
            "ENABLE".to_owned(),
            "NAMESPACE".to_owned(),
            "UIDPLUS".to_owned(),
            "UNSELECT".to_owned(),
            "CHILDREN".to_owned(),
            "IDLE".to_owned(),
            "CONDSTORE".to_owned(),
            "WITHIN".to_owned(),
            "SORT".to_owned(),
            "THREAD=ORDEREDSUBJECT".to_owned(),
            "THREAD=REFERENCES".to_owned(),
            "COMPRESS=DEFLATE".to_owned(),
            "SASL-IR".to_owned(),
        ];
        if ProtoState::NotAuthenticated == self.state {
            for mech in MECHANISMS {
                caps.push(format!("AUTH={}", mech.name()));
            }
            if self.tls_helper.is_some() {
                caps.push("STARTTLS".to_owned());
            }
        }
        caps.join(" ")
    }

    /// Reads and processes everything buffered.
    fn process_input(&mut self) -> Result<(), Error> {
        if self.detached {
            // The forwarder owns the byte stream now.
            return Ok(());
        }
        loop {
            // Splice an announced literal straight into the command.
            if self.need_literal > 0 {
                let taken = {
                    let mut conn = self.conn.borrow_mut();
                    let buf = conn.read_buffer();
                    let n = self.need_literal.min(buf.len());
                    if 0 == n {
                        Vec::new()
                    } else {
                        let bytes = buf.string(n)
                            .map(<[u8]>::to_vec)
                            .unwrap_or_default();
                        buf.consume(n);
                        bytes
                    }
                };
                if taken.is_empty() {
                    return Ok(());
                }
                self.need_literal -= taken.len();
                self.cmdline.extend_from_slice(&taken);
                if self.need_literal > 0 {
                    return Ok(());
                }
                continue;
            }

            let line = {
                let mut conn = self.conn.borrow_mut();
                let buf = conn.read_buffer();
                match buf.remove_line(MAX_CMDLINE) {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(()),
                    Err(Error::LineTooLong) => {
                        drop(conn);
                        self.send_bye("Command line too long");
                        self.conn.borrow_mut().start_close();
                        return Ok(());
                    },
                    Err(e) => return Err(e),
                }
            };

            self.conn
                .borrow_mut()
                .extend_timeout(IDLE_TIMEOUT_SECS);

            if self.sasl.is_some() {
                self.sasl_line(&line);
                continue;
            }

            if self.idle_tag.is_some() {
                self.idle_line(&line);
                continue;
            }

            self.cmdline.extend_from_slice(&line);
            // The line part of a command is bounded separately from
            // the literals already spliced in.
            if self.cmdline.len() > MAX_CMDLINE + MAX_LITERAL {
                self.cmdline.clear();
                self.send_bye("Command too long");
                self.conn.borrow_mut().start_close();
                return Ok(());
            }

            // A trailing {N} or {N+} announces a literal.
            let literal = LITERAL_AT_EOL
                .captures(&self.cmdline)
                .and_then(|c| {
                    let len = std::str::from_utf8(&c[1])
                        .ok()?
                        .parse::<usize>()
                        .ok()?;
                    Some((len, !c[2].is_empty()))
                });
            if let Some((len, literal_plus)) = literal {
                if len > MAX_LITERAL {
                    self.send_bye("Literal too large");
                    self.conn.borrow_mut().start_close();
                    return Ok(());
                }
                if !literal_plus {
                    self.send("+ go on");
                }
                self.cmdline.extend_from_slice(b"\r\n");
                self.need_literal = len;
                continue;
            }

            let command = std::mem::take(&mut self.cmdline);
            self.accept_command(&command);
        }
    }

    fn accept_command(&mut self, line: &[u8]) {
        match syntax::parse_command(line) {
            Ok((tag, request)) => {
                if self
                    .records
                    .iter()
                    .any(|r| r.tag == tag && !matches!(r.state, CmdState::Retired))
                {
                    self.records.push(CommandRecord::stillborn(
                        tag,
                        Done::bad("Tag already in use"),
                    ));
                } else {
                    self.records
                        .push(CommandRecord::new(tag, request));
                }
            },
            Err((Some(tag), bad)) => {
                self.records.push(CommandRecord::stillborn(
                    tag,
                    Done::bad(bad.message),
                ));
            },
            Err((None, bad)) => {
                self.send(&format!("* BAD {}", bad.message));
            },
        }
        self.try_start();
    }

    /// Starts every queued command the group rules allow. Returns
    /// whether anything started.
    fn try_start(&mut self) -> bool {
        let mut any = false;
        loop {
            let mut started = false;
            for ix in 0..self.records.len() {
                if CmdState::Unparsed != self.records[ix].state {
                    continue;
                }
                let group = self.records[ix].group;
                let clear = if 0 == group {
                    0 == ix
                } else {
                    self.records[..ix].iter().all(|earlier| {
                        earlier.group == group
                            && CmdState::Unparsed != earlier.state
                    })
                };
                if clear {
                    self.records[ix].state = CmdState::Executing;
                    self.execute(ix);
                    started = true;
                    any = true;
                }
                break;
            }
            if !started {
                break;
            }
        }
        any
    }

    fn execute(&mut self, ix: usize) {
        let request = match self.records[ix].request.take() {
            Some(request) => request,
            None => return,
        };
        let tag = self.records[ix].tag.clone();

        if let Some(done) = self.check_state(&request) {
            self.records[ix].finish(done);
            return;
        }

        match request {
            Request::Capability => {
                let caps = self.capability_string();
                let record = &mut self.records[ix];
                record
                    .untagged
                    .push(format!("* CAPABILITY {}", caps));
                record.finish(Done::ok("done"));
            },
            Request::Noop | Request::Check => {
                self.records[ix].finish(Done::ok("done"));
            },
            Request::Logout => {
                self.send_bye("Have a nice day");
                self.state = ProtoState::Logout;
                self.records[ix].finish(Done::ok("done"));
            },
            Request::Id(params) => {
                if let Some(params) = params {
                    for (key, value) in params {
                        info!(
                            "{} client id: {}={}",
                            self.conn.borrow().log_prefix(),
                            key,
                            value.as_deref().unwrap_or("nil"),
                        );
                    }
                }
                let record = &mut self.records[ix];
                record.untagged.push(
                    "* ID (\"name\" \"Oryx\" \"version\" \"0.1\")"
                        .to_owned(),
                );
                record.finish(Done::ok("done"));
            },
            Request::Enable(extensions) => {
                let mut enabled = Vec::new();
                for extension in extensions {
                    if "CONDSTORE" == extension {
                        self.condstore_enabled = true;
                        enabled.push(extension);
                    }
                }
                let record = &mut self.records[ix];
                record.untagged.push(format!(
                    "* ENABLED{}{}",
                    if enabled.is_empty() { "" } else { " " },
                    enabled.join(" "),
                ));
                record.finish(Done::ok("done"));
            },
            Request::Namespace => {
                let record = &mut self.records[ix];
                record.untagged.push(
                    "* NAMESPACE ((\"\" \"/\")) NIL NIL".to_owned(),
                );
                record.finish(Done::ok("done"));
            },
            Request::Compress => {
                if self.compressed {
                    self.records[ix].finish(
                        Done::no("Already compressing")
                            .with_code("COMPRESSIONACTIVE"),
                    );
                } else {
                    // The filters go in when the OK is flushed; see
                    // retire().
                    self.records[ix].finish(Done::ok("deflated"));
                }
            },
            Request::StartTls => {
                if self.tls_helper.is_some() {
                    self.records[ix]
                        .finish(Done::ok("Begin TLS negotiation"));
                } else {
                    self.records[ix].finish(Done::no(
                        "TLS is terminated by the network front end",
                    ));
                }
            },
            Request::Idle => {
                self.send("+ idling");
                self.idle_tag = Some(tag);
                // Stays Executing until DONE arrives.
            },
            Request::Login { user, password } => {
                self.start_login(ix, user, password)
            },
            Request::Authenticate { mechanism, initial } => {
                self.start_authenticate(ix, mechanism, initial)
            },
            Request::Select { mailbox, condstore } => {
                self.start_select(ix, mailbox, false, condstore)
            },
            Request::Examine { mailbox, condstore } => {
                self.start_select(ix, mailbox, true, condstore)
            },
            Request::Create { mailbox } => {
                self.start_create(ix, mailbox)
            },
            Request::Delete { mailbox } => {
                self.start_delete(ix, mailbox)
            },
            Request::Rename { from, to } => {
                self.start_rename(ix, from, to)
            },
            Request::Subscribe { mailbox } => {
                self.start_subscription(ix, mailbox, true)
            },
            Request::Unsubscribe { mailbox } => {
                self.start_subscription(ix, mailbox, false)
            },
            Request::List { reference, pattern } => {
                self.run_list(ix, &reference, &pattern)
            },
            Request::Lsub { reference, pattern } => {
                self.start_lsub(ix, &reference, &pattern)
            },
            Request::Status { mailbox, items } => {
                self.start_status(ix, mailbox, items)
            },
            Request::Append {
                mailbox,
                flags,
                date,
                message,
            } => self.start_append(ix, mailbox, flags, date, message),
            Request::Close => self.start_expunge_like(
                ix, None, true, /* silent close */
            ),
            Request::Unselect => {
                // Deselect without expunging.
                self.records[ix].finish(Done::ok("done"));
            },
            Request::Expunge => {
                self.start_expunge_like(ix, None, false)
            },
            Request::UidExpunge { set } => {
                self.start_expunge_like(ix, Some(set), false)
            },
            Request::Search {
                selector,
                uid,
                msn_sets,
            } => self.start_search(ix, selector, uid, msn_sets),
            Request::Sort {
                criteria,
                selector,
                uid,
                msn_sets,
            } => {
                self.start_sort(ix, criteria, selector, uid, msn_sets)
            },
            Request::Thread {
                algorithm,
                selector,
                uid,
                msn_sets,
            } => self.start_thread(
                ix, algorithm, selector, uid, msn_sets,
            ),
            Request::Fetch {
                set,
                items,
                changed_since,
                uid,
            } => self.start_fetch(ix, set, items, changed_since, uid),
            Request::Store {
                set,
                mode,
                silent,
                flags,
                unchanged_since,
                uid,
            } => self.start_store(
                ix,
                set,
                mode,
                silent,
                flags,
                unchanged_since,
                uid,
            ),
            Request::Copy { set, mailbox, uid } => {
                self.start_copy(ix, set, mailbox, uid)
            },
        }
    }

    /// Enforces which states each command is valid in.
    fn check_state(&self, request: &Request) -> Option<Done> {
        use Request::*;
        let ok = match *request {
            Capability | Noop | Logout | Id(_) => true,
            StartTls | Login { .. } | Authenticate { .. } => {
                ProtoState::NotAuthenticated == self.state
            },
            Enable(_) | Compress | Namespace | Select { .. }
            | Examine { .. } | Create { .. } | Delete { .. }
            | Rename { .. } | Subscribe { .. }
            | Unsubscribe { .. } | List { .. } | Lsub { .. }
            | Status { .. } | Append { .. } => matches!(
                self.state,
                ProtoState::Authenticated | ProtoState::Selected
            ),
            Check | Close | Unselect | Expunge
            | UidExpunge { .. } | Search { .. } | Sort { .. }
            | Thread { .. } | Fetch { .. } | Store { .. }
            | Copy { .. } | Idle => {
                ProtoState::Selected == self.state
            },
        };
        if ok {
            None
        } else {
            Some(Done::bad(format!(
                "Not allowed {}",
                match self.state {
                    ProtoState::NotAuthenticated => {
                        "before authentication"
                    },
                    ProtoState::Authenticated => {
                        "without a selected mailbox"
                    },
                    ProtoState::Selected => "here",
                    ProtoState::Logout => "after LOGOUT",
                },
            )))
        }
    }

    /// Routes a task resumption to the right command state machine.
    fn advance_command(&mut self, tag: &str) {
        let ix = match self
            .records
            .iter()
            .position(|r| r.tag == tag && r.is_running())
        {
            Some(ix) => ix,
            None => return,
        };

        match self.records[ix].run {
            RunState::None => (),
            RunState::UserLookup { .. } => self.advance_login(ix),
            RunState::SelectMailbox { .. }
            | RunState::SelectUids { .. } => self.advance_select(ix),
            RunState::Status { .. } => self.advance_status(ix),
            RunState::MailboxMutation { .. } => {
                self.advance_mailbox_mutation(ix)
            },
            RunState::Lsub { .. } => self.advance_lsub(ix),
            RunState::Append { .. } => self.advance_append(ix),
            RunState::Fetch { .. } => self.advance_fetch(ix),
            RunState::Store { .. } => self.advance_store(ix),
            RunState::Expunge { .. } => self.advance_expunge(ix),
            RunState::Copy { .. } => self.advance_copy(ix),
            RunState::Search { .. } => self.advance_search(ix),
            RunState::Sort { .. } => self.advance_sort(ix),
            RunState::Thread { .. } => self.advance_thread(ix),
        }
    }

    /// The command-boundary flush: untagged session responses first,
    /// then tagged completions in tag-assignment order. Loops to a
    /// fixed point, since retiring one command may let another start
    /// and finish synchronously.
    pub(crate) fn flush_output(&mut self) {
        loop {
            self.emit_session_responses();

            let mut progressed = false;
            while self
                .records
                .first()
                .map_or(false, |r| CmdState::Finished == r.state)
            {
                let mut record = self.records.remove(0);
                for line in std::mem::take(&mut record.untagged) {
                    self.send(&line);
                }
                let done =
                    record.done.clone().unwrap_or_else(|| {
                        Done::no("internal: no response prepared")
                    });
                let line = match done.code {
                    Some(ref code) => format!(
                        "{} {} [{}] {}",
                        record.tag, done.cond, code, done.text,
                    ),
                    None => format!(
                        "{} {} {}",
                        record.tag, done.cond, done.text,
                    ),
                };
                self.send(&line);
                record.state = CmdState::Retired;
                self.retire(&record);
                progressed = true;
            }

            if self.try_start() {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        let _ = self.conn.borrow_mut().flush();
    }

    /// Post-retirement effects that must happen after the tagged line
    /// is on the wire.
    fn retire(&mut self, record: &CommandRecord) {
        match record.name.as_str() {
            "LOGOUT" => {
                let mut conn = self.conn.borrow_mut();
                let _ = conn.flush();
                conn.start_close();
            },
            "COMPRESS" => {
                if record
                    .done
                    .as_ref()
                    .map_or(false, |d| "OK" == d.cond)
                {
                    // The tagged OK goes out in plaintext; only bytes
                    // after it are deflated.
                    let mut conn = self.conn.borrow_mut();
                    let _ = conn.flush();
                    let _ = conn.push_outbound_filter(Box::new(
                        crate::server::filter::Deflater::new(),
                    ));
                    let _ = conn.push_inbound_filter(Box::new(
                        crate::server::filter::Inflater::new(),
                    ));
                    drop(conn);
                    self.compressed = true;
                    info!(
                        "{} compression started",
                        self.conn.borrow().log_prefix(),
                    );
                }
            },
            "STARTTLS" => {
                if let Some(helper) = self.tls_helper.clone() {
                    self.hand_off_to_tls_helper(&helper);
                }
            },
            "CLOSE" | "UNSELECT" => {
                self.session = None;
                self.mailbox = None;
                if ProtoState::Selected == self.state {
                    self.state = ProtoState::Authenticated;
                }
            },
            _ => (),
        }
    }

    /// Emits whatever the session has queued, holding back EXPUNGE
    /// while any MSN-addressed command is unfinished.
    pub(crate) fn emit_session_responses(&mut self) {
        let session = match self.session {
            Some(ref session) => Rc::clone(session),
            None => return,
        };

        let expunge_allowed = !self
            .records
            .iter()
            .any(|r| r.is_running() && r.msn_sensitive());

        let responses =
            session.borrow_mut().take_pending(expunge_allowed);
        for response in responses {
            match response {
                SessionResponse::Exists(n) => {
                    self.send(&format!("* {} EXISTS", n))
                },
                SessionResponse::Recent(n) => {
                    self.send(&format!("* {} RECENT", n))
                },
                SessionResponse::Expunge { msn } => {
                    self.send(&format!("* {} EXPUNGE", msn))
                },
                SessionResponse::Fetch {
                    msn,
                    uid,
                    flags,
                    modseq,
                } => {
                    let modseq_part = if self.condstore_enabled {
                        format!(" MODSEQ ({})", modseq)
                    } else {
                        String::new()
                    };
                    self.send(&format!(
                        "* {} FETCH (FLAGS ({}) UID {}{})",
                        msn,
                        flags.join(" "),
                        uid,
                        modseq_part,
                    ));
                },
            }
        }
    }

    fn sasl_line(&mut self, line: &[u8]) {
        let (tag, mut machine) = match self.sasl.take() {
            Some(s) => s,
            None => return,
        };

        if b"*" == line {
            machine.terminate();
            self.finish_by_tag(
                &tag,
                Done::bad("Authentication aborted"),
            );
            return;
        }

        let decoded = match base64::decode(line) {
            Ok(d) => d,
            Err(_) => {
                self.finish_by_tag(
                    &tag,
                    Done::bad("Bad base64 data"),
                );
                return;
            },
        };

        match machine.respond(&decoded) {
            Step::Challenge(challenge) => {
                self.send(&format!("+ {}", challenge));
                self.sasl = Some((tag, machine));
            },
            Step::Verify { login, proof } => {
                self.sasl = Some((tag.clone(), machine));
                self.start_user_lookup(&tag, login, proof);
            },
            Step::Failed(why) => {
                self.finish_by_tag(&tag, Done::no(why));
            },
        }
    }

    fn idle_line(&mut self, line: &[u8]) {
        if line.eq_ignore_ascii_case(b"DONE") {
            if let Some(tag) = self.idle_tag.take() {
                self.finish_by_tag(&tag, Done::ok("done idling"));
            }
        } else {
            // RFC 2177: anything else during IDLE is a protocol error.
            if let Some(tag) = self.idle_tag.take() {
                self.finish_by_tag(
                    &tag,
                    Done::bad("Expected DONE"),
                );
            }
        }
    }

    pub(crate) fn finish_by_tag(&mut self, tag: &str, done: Done) {
        if let Some(record) =
            self.records.iter_mut().find(|r| r.tag == tag)
        {
            record.finish(done);
        }
        self.flush_output();
    }

    /// Starts the AUTHENTICATE exchange.
    fn start_authenticate(
        &mut self,
        ix: usize,
        mechanism: String,
        initial: Option<Vec<u8>>,
    ) {
        let tag = self.records[ix].tag.clone();
        let mech = match Mechanism::by_name(&mechanism) {
            Some(mech) => mech,
            None => {
                self.records[ix].finish(
                    Done::no("Unsupported mechanism")
                        .with_code("CANNOT"),
                );
                return;
            },
        };

        let mut machine = SaslMachine::new(mech, &self.hostname);
        match machine.start(initial) {
            Step::Challenge(challenge) => {
                self.send(&format!("+ {}", challenge));
                self.sasl = Some((tag, machine));
            },
            Step::Verify { login, proof } => {
                self.sasl = Some((tag.clone(), machine));
                self.start_user_lookup(&tag, login, proof);
            },
            Step::Failed(why) => {
                self.records[ix].finish(Done::no(why));
            },
        }
    }

    /// STARTTLS hand-off: connect to the helper and splice the raw
    /// byte streams together. The helper terminates TLS and proxies
    /// the plaintext back to us as a fresh connection.
    fn hand_off_to_tls_helper(&mut self, helper: &str) {
        use nix::sys::socket::*;

        let result = (|| -> Result<(), Error> {
            let parsed: std::net::SocketAddr =
                helper.parse().map_err(|_| {
                    Error::BadConfig(format!(
                        "unparseable tls helper address: {}",
                        helper,
                    ))
                })?;
            let fd = socket(
                if parsed.is_ipv4() {
                    AddressFamily::Inet
                } else {
                    AddressFamily::Inet6
                },
                SockType::Stream,
                SockFlag::empty(),
                None,
            )?;
            let addr = SockaddrStorage::from(parsed);
            connect(fd, &addr)?;

            let helper_conn = Rc::new(RefCell::new(
                Connection::wrap(
                    fd,
                    ConnKind::Forwarder,
                    LogPrefix::new("tls", helper.to_owned()),
                )?,
            ));

            // This connection stops being an IMAP server; the reactor
            // replaces it with a forwarder pair on the same socket.
            let client = Rc::clone(&self.conn);
            crate::server::forwarder::splice(client, helper_conn);
            self.detached = true;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(
                "{} TLS hand-off failed: {}",
                self.conn.borrow().log_prefix(),
                e,
            );
            self.send_bye("TLS negotiation failed");
            self.conn.borrow_mut().start_close();
        }
    }

    pub(crate) fn sasl_finish(&mut self, success: bool) {
        if let Some((_, ref mut machine)) = self.sasl {
            machine.finish(success);
        }
        if self
            .sasl
            .as_ref()
            .map_or(false, |(_, m)| {
                matches!(
                    m.state(),
                    SaslState::Succeeded
                        | SaslState::Failed
                        | SaslState::Terminated
                )
            })
        {
            self.sasl = None;
        }
    }
}

impl Client for ImapConnection {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Read => {
                self.process_input()?;
                self.flush_output();
                Ok(())
            },
            Event::Timeout => {
                self.send_bye("Autologout; idle for too long");
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            Event::Shutdown => {
                self.send_bye("Server shutting down");
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            Event::Close | Event::Error => Ok(()),
            _ => Ok(()),
        }
    }

    fn on_destroy(&mut self) {
        for task in self.tasks.drain(..) {
            task.cancel();
        }
        self.session = None;
        self.mailbox = None;
    }
}

/// Hands accepted IMAP sockets to `ImapConnection`; used as the
/// listener callback.
pub fn acceptor(
    hostname: String,
    tls_helper: Option<String>,
) -> crate::server::listener::AcceptFn {
    Box::new(move |fd, peer| {
        if let Err(e) = ImapConnection::spawn(
            fd,
            peer,
            hostname.clone(),
            tls_helper.clone(),
        ) {
            warn!("could not set up IMAP connection: {}", e);
            let _ = nix::unistd::close(fd);
        }
    })
}

/// Helpers shared by the command implementations.
impl ImapConnection {
    pub(crate) fn selected_session(
        &self,
    ) -> Option<Rc<RefCell<Session>>> {
        self.session.clone()
    }

    pub(crate) fn selected_mailbox(
        &self,
    ) -> Option<Rc<RefCell<Mailbox>>> {
        self.mailbox.clone()
    }

    pub(crate) fn install_session(
        &mut self,
        mailbox: Rc<RefCell<Mailbox>>,
        session: Session,
    ) -> Rc<RefCell<Session>> {
        let session = Rc::new(RefCell::new(session));
        mailbox.borrow_mut().attach_session(&session);
        self.session = Some(Rc::clone(&session));
        self.mailbox = Some(mailbox);
        self.state = ProtoState::Selected;
        session
    }

    /// Looks up a mailbox in the registry by client-visible name,
    /// resolving relative names under the user's home.
    pub(crate) fn resolve_mailbox_name(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_owned()
        } else if let Some(ref user) = self.user {
            format!("{}{}", user.home, name)
        } else {
            name.to_owned()
        }
    }

    pub(crate) fn find_mailbox(
        &self,
        name: &str,
    ) -> Option<Rc<RefCell<Mailbox>>> {
        mailbox::by_name(&self.resolve_mailbox_name(name))
    }
}
