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

//! Mail ingestion over SMTP/LMTP.
//!
//! The envelope commands are the standard set; DATA captures the
//! dot-stuffed message, and then each accepted recipient's active Sieve
//! script runs over (envelope, message) to decide where the message
//! goes. Per-recipient status is reported individually in LMTP mode and
//! collapsed to one reply for SMTP. Redirects land in the `outgoing`
//! table, which the smart-host forwarder drains with exponential
//! backoff.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{self, Client, Event};
use crate::server::task::Task;
use crate::sieve::interp::{
    self, Action, Envelope, SieveMessage,
};
use crate::sieve::parser;
use crate::store::mailbox::{self, MailboxChange};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const MAX_LINE: usize = 2048;
const MAX_MESSAGE: usize = 64 * 1024 * 1024;
const TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Clone, Debug)]
struct Recipient {
    address: String,
    user_id: u32,
    home: String,
    /// Filled in after delivery.
    result: Option<Result<(), String>>,
}

enum Phase {
    /// Waiting for envelope commands.
    Command,
    /// An RCPT lookup is outstanding.
    RcptLookup { query: Query, address: String },
    /// Reading the dot-stuffed message body.
    Data { body: Vec<u8> },
    /// Running scripts and inserting rows, one recipient at a time.
    Delivering(Delivery),
}

struct Delivery {
    message: Vec<u8>,
    current: usize,
    step: DeliveryStep,
}

enum DeliveryStep {
    /// Fetching the recipient's active script.
    Script(Query),
    /// Waiting for the delivery transaction.
    Insert {
        tx: Transaction,
        queries: Vec<(String, Query)>,
        rejected: Option<String>,
    },
}

pub struct SmtpConnection {
    conn: Rc<RefCell<Connection>>,
    weak_self: Weak<RefCell<SmtpConnection>>,
    lmtp: bool,
    hostname: String,
    has_helo: bool,
    from: Option<String>,
    recipients: Vec<Recipient>,
    phase: Phase,
    tasks: Vec<Task>,
    quitting: bool,
}

impl SmtpConnection {
    pub fn spawn(
        fd: std::os::unix::io::RawFd,
        peer: String,
        hostname: String,
        lmtp: bool,
    ) -> Result<(), Error> {
        let prefix = LogPrefix::new(
            if lmtp { "lmtp" } else { "smtp" },
            peer,
        );
        let conn = Rc::new(RefCell::new(Connection::wrap(
            fd,
            ConnKind::SmtpServer,
            prefix,
        )?));
        conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

        let server = Rc::new(RefCell::new(SmtpConnection {
            conn: Rc::clone(&conn),
            weak_self: Weak::new(),
            lmtp,
            hostname,
            has_helo: false,
            from: None,
            recipients: Vec::new(),
            phase: Phase::Command,
            tasks: Vec::new(),
            quitting: false,
        }));
        server.borrow_mut().weak_self = Rc::downgrade(&server);
        {
            let mut s = server.borrow_mut();
            let greeting = format!(
                "220 {} {} ready",
                s.hostname,
                if lmtp { "LMTP" } else { "ESMTP" },
            );
            s.send(&greeting);
        }

        reactor::register(conn, server);
        Ok(())
    }

    fn send(&mut self, line: &str) {
        let mut conn = self.conn.borrow_mut();
        conn.enqueue_str(line);
        conn.enqueue_str("\r\n");
    }

    fn make_task(&mut self) -> Task {
        let weak = self.weak_self.clone();
        let task = Task::new(
            self.conn.borrow().log_prefix().clone(),
            move || {
                if let Some(me) = weak.upgrade() {
                    me.borrow_mut().advance();
                }
            },
        );
        self.tasks.push(task.clone());
        task
    }

    fn process_input(&mut self) -> Result<(), Error> {
        loop {
            let line = {
                let mut conn = self.conn.borrow_mut();
                match conn.read_buffer().remove_line(MAX_LINE) {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        drop(conn);
                        self.send("500 5.5.2 Line too long");
                        self.conn.borrow_mut().start_close();
                        return Ok(());
                    },
                }
            };

            self.conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

            match self.phase {
                Phase::Data { .. } => self.data_line(&line),
                Phase::RcptLookup { .. }
                | Phase::Delivering(_) => {
                    // Pipelined input while busy; only a few commands
                    // are harmless enough to answer.
                    self.send("451 4.3.0 One thing at a time");
                },
                Phase::Command => self.run_command(&line),
            }
        }
    }

    fn run_command(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line).into_owned();
        let upper = text.to_ascii_uppercase();

        if upper.starts_with("HELO ")
            || upper.starts_with("EHLO ")
            || upper.starts_with("LHLO ")
        {
            let wants_extended = !upper.starts_with("HELO");
            self.has_helo = true;
            self.reset_envelope();
            if wants_extended {
                self.send(&format!("250-{}", self.hostname));
                self.send("250-8BITMIME");
                self.send("250-PIPELINING");
                self.send("250-ENHANCEDSTATUSCODES");
                self.send(&format!("250 SIZE {}", MAX_MESSAGE));
            } else {
                self.send(&format!("250 {}", self.hostname));
            }
        } else if "QUIT" == upper {
            self.send(&format!("221 2.0.0 {} closing", self.hostname));
            self.quitting = true;
            self.conn.borrow_mut().start_close();
        } else if "RSET" == upper {
            self.reset_envelope();
            self.send("250 2.0.0 ok");
        } else if "NOOP" == upper {
            self.send("250 2.0.0 ok");
        } else if upper.starts_with("VRFY") {
            self.send("252 2.1.5 Cannot verify");
        } else if upper.starts_with("MAIL FROM:") {
            if !self.has_helo {
                self.send("503 5.5.1 Say hello first");
            } else if self.from.is_some() {
                self.send("503 5.5.1 Nested MAIL FROM");
            } else {
                match parse_path(&text["MAIL FROM:".len()..]) {
                    Some(path) => {
                        self.from = Some(path);
                        self.send("250 2.1.0 sender ok");
                    },
                    None => {
                        self.send("501 5.1.7 Bad sender address")
                    },
                }
            }
        } else if upper.starts_with("RCPT TO:") {
            if self.from.is_none() {
                self.send("503 5.5.1 MAIL FROM first");
            } else {
                match parse_path(&text["RCPT TO:".len()..]) {
                    Some(address) => self.start_rcpt(address),
                    None => self
                        .send("501 5.1.3 Bad recipient address"),
                }
            }
        } else if "DATA" == upper {
            if self.recipients.is_empty() {
                self.send("503 5.5.1 No valid recipients");
            } else {
                self.send("354 Go ahead, end with <CRLF>.<CRLF>");
                self.phase = Phase::Data { body: Vec::new() };
            }
        } else {
            self.send("500 5.5.2 Unknown command");
        }
    }

    fn reset_envelope(&mut self) {
        self.from = None;
        self.recipients.clear();
        self.phase = Phase::Command;
    }

    fn start_rcpt(&mut self, address: String) {
        // The recipient must be a local user; their address maps to a
        // login via the addresses each user owns.
        let query = Query::prepared(
            "user_by_address",
            "select id, login, home from users \
             where lower(login)=lower($1) \
             or lower(login)=lower(split_part($1, '@', 1))",
        );
        query.bind(1, address.as_str());
        let task = self.make_task();
        query.execute(Some(task));
        self.phase = Phase::RcptLookup { query, address };
    }

    fn data_line(&mut self, line: &[u8]) {
        let body = match self.phase {
            Phase::Data { ref mut body } => body,
            _ => return,
        };

        if b"." == line {
            let message = std::mem::take(body);
            self.start_delivery(message);
            return;
        }

        // Dot-stuffing: a leading ".." is one "."
        let line = if line.starts_with(b"..") {
            &line[1..]
        } else {
            line
        };
        body.extend_from_slice(line);
        body.extend_from_slice(b"\r\n");

        if body.len() > MAX_MESSAGE {
            self.phase = Phase::Command;
            self.reset_envelope();
            self.send("552 5.3.4 Message too large");
        }
    }

    fn start_delivery(&mut self, message: Vec<u8>) {
        self.phase = Phase::Delivering(Delivery {
            message,
            current: 0,
            step: DeliveryStep::Script(Query::new("select 1")),
        });
        self.next_recipient();
    }

    /// Begins the script fetch for the current recipient, or reports
    /// the final status if all are done.
    fn next_recipient(&mut self) {
        let current = match self.phase {
            Phase::Delivering(ref d) => d.current,
            _ => return,
        };

        if current >= self.recipients.len() {
            self.finish_delivery();
            return;
        }

        let user_id = self.recipients[current].user_id;
        let query = Query::prepared(
            "active_script",
            "select script from scripts \
             where owner=$1 and active",
        );
        query.bind(1, user_id);
        let task = self.make_task();
        query.execute(Some(task));
        if let Phase::Delivering(ref mut d) = self.phase {
            d.step = DeliveryStep::Script(query);
        }
    }

    fn advance(&mut self) {
        match self.phase {
            Phase::RcptLookup { .. } => self.advance_rcpt(),
            Phase::Delivering(_) => self.advance_delivery(),
            _ => (),
        }
        let _ = self.conn.borrow_mut().flush();
    }

    fn advance_rcpt(&mut self) {
        let (query, address) = match self.phase {
            Phase::RcptLookup {
                ref query,
                ref address,
            } => (query.clone(), address.clone()),
            _ => return,
        };
        if !query.done() {
            return;
        }

        self.phase = Phase::Command;
        if query.failed() {
            self.send("451 4.3.0 Temporary lookup failure");
            return;
        }
        match query.next_row() {
            Some(row) => {
                self.recipients.push(Recipient {
                    address,
                    user_id: row.uint("id").unwrap_or(0),
                    home: row
                        .text("home")
                        .unwrap_or_else(|| "/".to_owned()),
                    result: None,
                });
                self.send("250 2.1.5 recipient ok");
            },
            None => {
                self.send("550 5.1.1 No such user here");
            },
        }
    }

    fn advance_delivery(&mut self) {
        enum Next {
            Wait,
            Evaluate(Option<String>),
            Finish(Result<(), String>),
        }

        let next = match self.phase {
            Phase::Delivering(ref d) => match d.step {
                DeliveryStep::Script(ref query) => {
                    if !query.done() {
                        Next::Wait
                    } else if query.failed() {
                        Next::Finish(Err(
                            "temporary failure".to_owned()
                        ))
                    } else {
                        Next::Evaluate(
                            query
                                .next_row()
                                .and_then(|r| r.text("script")),
                        )
                    }
                },
                DeliveryStep::Insert {
                    ref tx,
                    ref rejected,
                    ..
                } => {
                    if !tx.done() {
                        Next::Wait
                    } else if tx.failed() {
                        Next::Finish(Err(tx
                            .error()
                            .unwrap_or_default()))
                    } else if let Some(ref why) = *rejected {
                        Next::Finish(Err(format!(
                            "rejected: {}",
                            why,
                        )))
                    } else {
                        Next::Finish(Ok(()))
                    }
                },
            },
            _ => return,
        };

        match next {
            Next::Wait => (),
            Next::Evaluate(script) => self.deliver_current(script),
            Next::Finish(result) => {
                let current = match self.phase {
                    Phase::Delivering(ref d) => d.current,
                    _ => return,
                };

                // Announce new messages now that the commit is
                // durable.
                if result.is_ok() {
                    if let Phase::Delivering(ref d) = self.phase {
                        if let DeliveryStep::Insert {
                            ref queries,
                            ..
                        } = d.step
                        {
                            for (name, query) in queries {
                                announce_delivery(name, query);
                            }
                        }
                    }
                }

                self.recipients[current].result = Some(result);
                if let Phase::Delivering(ref mut d) = self.phase {
                    d.current += 1;
                }
                self.next_recipient();
            },
        }
    }

    /// Runs the recipient's script and queues the delivery
    /// transaction.
    fn deliver_current(&mut self, script_text: Option<String>) {
        let (message, current) = match self.phase {
            Phase::Delivering(ref d) => {
                (d.message.clone(), d.current)
            },
            _ => return,
        };
        let recipient = self.recipients[current].clone();
        let from =
            self.from.clone().unwrap_or_default();

        let script = script_text
            .and_then(|text| match parser::parse(&text) {
                Ok(script) => Some(script),
                Err(e) => {
                    warn!(
                        "{} stored script is unparseable: {}",
                        self.conn.borrow().log_prefix(),
                        e,
                    );
                    None
                },
            })
            .unwrap_or(crate::sieve::ast::Script {
                commands: Vec::new(),
            });

        let envelope = Envelope {
            from,
            to: recipient.address.clone(),
        };
        let parsed = SieveMessage::parse(&message);
        let actions = interp::evaluate(
            &script,
            &envelope,
            &recipient.home,
            &parsed,
        );

        let tx = Transaction::new();
        let mut queries = Vec::new();
        let mut rejected = None;

        for action in actions {
            match action {
                Action::FileInto(target) => {
                    let q = file_into_query(&target, &message);
                    q.attach_task(self.make_task());
                    tx.enqueue(q.clone());
                    queries.push((target, q));
                },
                Action::Redirect(address) => {
                    let q = Query::new(
                        "insert into outgoing \
                         (sender, recipient, message, tries, \
                         next_attempt) \
                         values ($1, $2, $3, 0, \
                         current_timestamp)",
                    );
                    q.bind(1, envelope.from.as_str())
                        .bind(2, address.as_str())
                        .bind(
                            3,
                            String::from_utf8_lossy(&message)
                                .into_owned(),
                        );
                    tx.enqueue(q);
                },
                Action::Reject(why) => rejected = Some(why),
                Action::Discard => {
                    info!(
                        "{} discarded mail for {}",
                        self.conn.borrow().log_prefix(),
                        recipient.address,
                    );
                },
                Action::Vacation { .. } | Action::Error(_) => (),
            }
        }

        let task = self.make_task();
        tx.commit(Some(task));
        if let Phase::Delivering(ref mut d) = self.phase {
            d.step = DeliveryStep::Insert {
                tx,
                queries,
                rejected,
            };
        }
    }

    fn finish_delivery(&mut self) {
        self.phase = Phase::Command;

        if self.lmtp {
            // One status line per accepted recipient, in RCPT order.
            let lines: Vec<String> = self
                .recipients
                .iter()
                .map(|r| match r.result {
                    Some(Ok(())) => format!(
                        "250 2.0.0 delivered for {}",
                        r.address,
                    ),
                    Some(Err(ref why)) => format!(
                        "554 5.0.0 delivery failed for {}: {}",
                        r.address, why,
                    ),
                    None => format!(
                        "451 4.3.0 not attempted for {}",
                        r.address,
                    ),
                })
                .collect();
            for line in lines {
                self.send(&line);
            }
        } else {
            let any_ok = self
                .recipients
                .iter()
                .any(|r| matches!(r.result, Some(Ok(()))));
            if any_ok {
                self.send("250 2.0.0 accepted");
            } else {
                self.send("554 5.0.0 delivery failed");
            }
        }

        self.from = None;
        self.recipients.clear();
    }
}

/// One CTE that creates the message, its bodypart, and the
/// mailbox_messages row while allocating UID and MODSEQ.
fn file_into_query(target: &str, raw: &[u8]) -> Query {
    let q = Query::new(
        "with mb as (select id from mailboxes \
         where name=$1 and not deleted), \
         m as (insert into messages (idate, rfc822size) \
         select extract(epoch from now())::bigint, $2 from mb \
         returning id), \
         b as (insert into bodyparts (text) \
         select $3 from mb returning id), \
         p as (insert into part_numbers (message, part, bodypart) \
         select m.id, '', b.id from m, b), \
         u as (update mailboxes \
         set uidnext=uidnext+1, nextmodseq=nextmodseq+1 \
         where id=(select id from mb) \
         returning id, uidnext-1 as uid, nextmodseq-1 as modseq) \
         insert into mailbox_messages \
         (mailbox, uid, message, modseq, idate) \
         select u.id, u.uid, m.id, u.modseq, \
         extract(epoch from now())::bigint from m, u \
         returning uid, modseq",
    );
    q.bind(1, target)
        .bind(2, raw.len() as i64)
        .bind(
            3,
            String::from_utf8_lossy(raw).into_owned(),
        );
    q
}

/// After a committed delivery, tell the mailbox's sessions.
fn announce_delivery(target: &str, query: &Query) {
    let row = match query.next_row() {
        Some(row) => row,
        None => return,
    };
    let (uid, modseq) = (
        row.uint("uid").unwrap_or(0),
        row.bigint("modseq").unwrap_or(0) as u64,
    );
    if let Some(mb) = mailbox::by_name(target) {
        mb.borrow_mut()
            .announce(MailboxChange::New { uid, modseq });
    }
}

/// Extracts the address from `<a@b>` or a bare path argument.
fn parse_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let address = if raw.starts_with('<') {
        let close = raw.find('>')?;
        &raw[1..close]
    } else {
        raw
    };
    // The null reverse-path is legal in MAIL FROM.
    if address.contains(' ') {
        None
    } else {
        Some(address.to_owned())
    }
}

impl Client for SmtpConnection {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Read => self.process_input(),
            Event::Timeout => {
                self.send("421 4.4.2 Idle too long");
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            Event::Shutdown => {
                if !self.quitting {
                    self.send("421 4.3.0 Server shutting down");
                }
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn on_destroy(&mut self) {
        for task in self.tasks.drain(..) {
            task.cancel();
        }
    }
}

/// Listener callback for the SMTP/LMTP service.
pub fn acceptor(
    hostname: String,
    lmtp: bool,
) -> crate::server::listener::AcceptFn {
    Box::new(move |fd, peer| {
        if let Err(e) = SmtpConnection::spawn(
            fd,
            peer,
            hostname.clone(),
            lmtp,
        ) {
            warn!("could not set up SMTP connection: {}", e);
            let _ = nix::unistd::close(fd);
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            Some("a@b".to_owned()),
            parse_path("<a@b>"),
        );
        assert_eq!(
            Some("a@b".to_owned()),
            parse_path(" <a@b> SIZE=100"),
        );
        assert_eq!(Some("a@b".to_owned()), parse_path("a@b"));
        assert_eq!(Some(String::new()), parse_path("<>"));
        assert_eq!(None, parse_path("two words here"));
    }
}
