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

//! POP3, the RFC 1939 subset.
//!
//! A thin consumer of the same store: after USER/PASS the INBOX
//! inventory is loaded once, message numbers are positions in that
//! snapshot, DELE marks, and QUIT expunges the marked messages the
//! same copy-then-delete way IMAP EXPUNGE does.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::db::query::{Query, Value};
use crate::db::transaction::Transaction;
use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{self, Client, Event};
use crate::server::task::Task;
use crate::store::idset::IdSet;
use crate::store::mailbox::{self, MailboxChange};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const MAX_LINE: usize = 1024;
const TIMEOUT_SECS: u64 = 10 * 60;

struct Inventory {
    mailbox_id: u32,
    /// (uid, size) in UID order; index+1 is the POP3 message number.
    messages: Vec<(u32, u64)>,
    deleted: IdSet,
}

enum Pending {
    Login {
        query: Query,
        login: String,
        password: String,
    },
    Inventory {
        query: Query,
        mailbox_id: u32,
    },
    Retr {
        query: Query,
        top_lines: Option<usize>,
    },
    Quit {
        tx: Transaction,
        doomed: IdSet,
        query: Query,
    },
}

pub struct PopConnection {
    conn: Rc<RefCell<Connection>>,
    weak_self: Weak<RefCell<PopConnection>>,
    user_name: Option<String>,
    user_id: Option<u32>,
    home: String,
    inventory: Option<Inventory>,
    pending: Option<Pending>,
    tasks: Vec<Task>,
    quitting: bool,
}

impl PopConnection {
    pub fn spawn(
        fd: std::os::unix::io::RawFd,
        peer: String,
    ) -> Result<(), Error> {
        let prefix = LogPrefix::new("pop3", peer);
        let conn = Rc::new(RefCell::new(Connection::wrap(
            fd,
            ConnKind::Pop3Server,
            prefix,
        )?));
        conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

        let server = Rc::new(RefCell::new(PopConnection {
            conn: Rc::clone(&conn),
            weak_self: Weak::new(),
            user_name: None,
            user_id: None,
            home: "/".to_owned(),
            inventory: None,
            pending: None,
            tasks: Vec::new(),
            quitting: false,
        }));
        server.borrow_mut().weak_self = Rc::downgrade(&server);
        server.borrow_mut().send("+OK Oryx POP3 ready");

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
                        self.send("-ERR line too long");
                        self.conn.borrow_mut().start_close();
                        return Ok(());
                    },
                }
            };

            self.conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

            if self.pending.is_some() {
                self.send("-ERR one command at a time");
                continue;
            }
            self.run_command(&line);
        }
    }

    fn run_command(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line).into_owned();
        let mut words = text.split_whitespace();
        let verb = words
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match verb.as_str() {
            "CAPA" => {
                self.send("+OK capabilities follow");
                self.send("USER");
                self.send("UIDL");
                self.send("TOP");
                self.send("IMPLEMENTATION Oryx");
                self.send(".");
            },
            "USER" => match words.next() {
                Some(name) => {
                    self.user_name = Some(name.to_owned());
                    self.send("+OK send PASS");
                },
                None => self.send("-ERR USER needs a name"),
            },
            "PASS" => {
                let login = match self.user_name.clone() {
                    Some(login) => login,
                    None => {
                        self.send("-ERR USER first");
                        return;
                    },
                };
                // The rest of the line, spaces included, is the
                // password.
                let password = text
                    .splitn(2, ' ')
                    .nth(1)
                    .unwrap_or("")
                    .to_owned();
                let query = Query::prepared(
                    "user_by_login",
                    "select id, login, secret, home from users \
                     where lower(login)=lower($1)",
                );
                query.bind(1, login.as_str());
                let task = self.make_task();
                query.execute(Some(task));
                self.pending = Some(Pending::Login {
                    query,
                    login,
                    password,
                });
            },
            "STAT" => match self.inventory {
                Some(ref inv) => {
                    let (count, size) = inv
                        .messages
                        .iter()
                        .filter(|(uid, _)| {
                            !inv.deleted.contains(*uid)
                        })
                        .fold((0u32, 0u64), |(c, s), (_, sz)| {
                            (c + 1, s + sz)
                        });
                    self.send(&format!("+OK {} {}", count, size));
                },
                None => self.send("-ERR not authenticated"),
            },
            "LIST" => self.cmd_list(words.next(), false),
            "UIDL" => self.cmd_list(words.next(), true),
            "RETR" => self.cmd_retr(words.next(), None),
            "TOP" => {
                let number = words.next();
                let lines = words
                    .next()
                    .and_then(|w| w.parse::<usize>().ok());
                match lines {
                    Some(lines) => {
                        self.cmd_retr(number, Some(lines))
                    },
                    None => {
                        self.send("-ERR TOP needs msg and lines")
                    },
                }
            },
            "DELE" => match self.message_by_number(words.next()) {
                Some((uid, _)) => {
                    if let Some(ref mut inv) = self.inventory {
                        inv.deleted.insert(uid);
                    }
                    self.send("+OK marked");
                },
                None => self.send("-ERR no such message"),
            },
            "RSET" => {
                if let Some(ref mut inv) = self.inventory {
                    inv.deleted = IdSet::new();
                    self.send("+OK unmarked");
                } else {
                    self.send("-ERR not authenticated");
                }
            },
            "NOOP" => self.send("+OK"),
            "QUIT" => self.cmd_quit(),
            _ => self.send("-ERR unknown command"),
        }
    }

    fn message_by_number(
        &self,
        number: Option<&str>,
    ) -> Option<(u32, u64)> {
        let inv = self.inventory.as_ref()?;
        let n: usize = number?.parse().ok()?;
        let entry = *inv.messages.get(n.checked_sub(1)?)?;
        if inv.deleted.contains(entry.0) {
            None
        } else {
            Some(entry)
        }
    }

    fn cmd_list(&mut self, number: Option<&str>, uidl: bool) {
        if self.inventory.is_none() {
            self.send("-ERR not authenticated");
            return;
        }

        if let Some(number) = number {
            match self.message_by_number(Some(number)) {
                Some((uid, size)) => {
                    let value = if uidl {
                        uid.to_string()
                    } else {
                        size.to_string()
                    };
                    self.send(&format!(
                        "+OK {} {}",
                        number, value,
                    ));
                },
                None => self.send("-ERR no such message"),
            }
            return;
        }

        let lines: Vec<String> = {
            let inv = self.inventory.as_ref().unwrap();
            inv.messages
                .iter()
                .enumerate()
                .filter(|(_, (uid, _))| {
                    !inv.deleted.contains(*uid)
                })
                .map(|(ix, (uid, size))| {
                    if uidl {
                        format!("{} {}", ix + 1, uid)
                    } else {
                        format!("{} {}", ix + 1, size)
                    }
                })
                .collect()
        };
        self.send("+OK listing follows");
        for line in lines {
            self.send(&line);
        }
        self.send(".");
    }

    fn cmd_retr(
        &mut self,
        number: Option<&str>,
        top_lines: Option<usize>,
    ) {
        let (uid, _) = match self.message_by_number(number) {
            Some(entry) => entry,
            None => {
                self.send("-ERR no such message");
                return;
            },
        };
        let mailbox_id = self
            .inventory
            .as_ref()
            .map_or(0, |inv| inv.mailbox_id);

        let query = Query::prepared(
            "pop_retr",
            "select bp.text from mailbox_messages mm \
             join part_numbers pn on (pn.message=mm.message \
             and pn.part='') \
             join bodyparts bp on (bp.id=pn.bodypart) \
             where mm.mailbox=$1 and mm.uid=$2",
        );
        query.bind(1, mailbox_id).bind(2, uid);
        let task = self.make_task();
        query.execute(Some(task));
        self.pending = Some(Pending::Retr { query, top_lines });
    }

    fn cmd_quit(&mut self) {
        let doomed = self
            .inventory
            .as_ref()
            .map(|inv| inv.deleted.clone())
            .unwrap_or_default();

        if doomed.is_empty() || self.inventory.is_none() {
            self.send("+OK bye");
            self.quitting = true;
            self.conn.borrow_mut().start_close();
            return;
        }

        let mailbox_id =
            self.inventory.as_ref().unwrap().mailbox_id;
        let tx = Transaction::new();
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
            .bind(2, Value::IntSet(doomed.iter().collect()));
        move_rows.attach_task(self.make_task());
        tx.enqueue(move_rows.clone());
        tx.commit(Some(self.make_task()));
        self.pending = Some(Pending::Quit {
            tx,
            doomed,
            query: move_rows,
        });
    }

    fn advance(&mut self) {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return,
        };

        match pending {
            Pending::Login {
                query,
                login,
                password,
            } => {
                if !query.done() {
                    self.pending = Some(Pending::Login {
                        query,
                        login,
                        password,
                    });
                    return;
                }
                if query.failed() {
                    self.send("-ERR temporary failure");
                    return;
                }
                let row = query.next_row();
                let ok = row.as_ref().map_or(false, |row| {
                    let secret =
                        row.text("secret").unwrap_or_default();
                    !secret.is_empty() && secret == password
                });
                if !ok {
                    info!(
                        "{} authentication failed for {:?}",
                        self.conn.borrow().log_prefix(),
                        login,
                    );
                    self.send("-ERR authentication failed");
                    return;
                }
                let row = row.expect("accepted without row");
                self.user_id = row.uint("id");
                self.home = row
                    .text("home")
                    .unwrap_or_else(|| "/".to_owned());
                self.conn
                    .borrow()
                    .log_prefix()
                    .set_user(login);

                // Load the INBOX inventory.
                let inbox =
                    format!("{}INBOX", self.home);
                match mailbox::by_name(&inbox) {
                    Some(mb) => {
                        let mailbox_id = mb.borrow().id();
                        let query = Query::prepared(
                            "pop_inventory",
                            "select mm.uid, m.rfc822size \
                             from mailbox_messages mm \
                             join messages m \
                             on (m.id=mm.message) \
                             where mm.mailbox=$1 order by mm.uid",
                        );
                        query.bind(1, mailbox_id);
                        let task = self.make_task();
                        query.execute(Some(task));
                        self.pending = Some(Pending::Inventory {
                            query,
                            mailbox_id,
                        });
                    },
                    None => {
                        self.send("-ERR no INBOX");
                    },
                }
            },
            Pending::Inventory { query, mailbox_id } => {
                if !query.done() {
                    self.pending = Some(Pending::Inventory {
                        query,
                        mailbox_id,
                    });
                    return;
                }
                if query.failed() {
                    self.send("-ERR temporary failure");
                    return;
                }
                let mut messages = Vec::new();
                while let Some(row) = query.next_row() {
                    if let Some(uid) = row.uint("uid") {
                        messages.push((
                            uid,
                            row.bigint("rfc822size")
                                .unwrap_or(0)
                                as u64,
                        ));
                    }
                }
                let count = messages.len();
                self.inventory = Some(Inventory {
                    mailbox_id,
                    messages,
                    deleted: IdSet::new(),
                });
                self.send(&format!(
                    "+OK mailbox has {} messages",
                    count,
                ));
            },
            Pending::Retr { query, top_lines } => {
                if !query.done() {
                    self.pending =
                        Some(Pending::Retr { query, top_lines });
                    return;
                }
                if query.failed() {
                    self.send("-ERR temporary failure");
                    return;
                }
                match query
                    .next_row()
                    .and_then(|row| row.text("text"))
                {
                    Some(text) => {
                        self.send("+OK message follows");
                        send_dot_stuffed(
                            &mut self.conn.borrow_mut(),
                            &text,
                            top_lines,
                        );
                        self.send(".");
                    },
                    None => self.send("-ERR no such message"),
                }
            },
            Pending::Quit { tx, doomed, query } => {
                if !tx.done() {
                    self.pending = Some(Pending::Quit {
                        tx,
                        doomed,
                        query,
                    });
                    return;
                }
                if tx.failed() {
                    self.send("-ERR deletion failed; try again");
                } else {
                    let mut modseq = 0u64;
                    while let Some(row) = query.next_row() {
                        if let Some(m) = row.bigint("modseq") {
                            modseq = modseq.max(m as u64);
                        }
                    }
                    let mailbox_id = self
                        .inventory
                        .as_ref()
                        .map_or(0, |inv| inv.mailbox_id);
                    if let Some(mb) = mailbox::by_id(mailbox_id) {
                        mb.borrow_mut().announce(
                            MailboxChange::Expunged {
                                uids: doomed,
                                modseq,
                            },
                        );
                    }
                    self.send("+OK bye");
                }
                self.quitting = true;
                self.conn.borrow_mut().start_close();
            },
        }

        let _ = self.conn.borrow_mut().flush();
    }
}

/// Writes message text with dot-stuffing, optionally truncated to the
/// header plus `top_lines` body lines (for TOP).
fn send_dot_stuffed(
    conn: &mut Connection,
    text: &str,
    top_lines: Option<usize>,
) {
    let mut body_lines_left = top_lines;
    let mut in_body = false;
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if in_body {
            if let Some(ref mut left) = body_lines_left {
                if 0 == *left {
                    break;
                }
                *left -= 1;
            }
        } else if line.is_empty() {
            in_body = true;
        }

        if line.starts_with('.') {
            conn.enqueue_str(".");
        }
        conn.enqueue_str(line);
        conn.enqueue_str("\r\n");
    }
}

impl Client for PopConnection {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Read => self.process_input(),
            Event::Timeout => {
                self.send("-ERR idle too long");
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            Event::Shutdown => {
                if !self.quitting {
                    self.send("-ERR server shutting down");
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

/// Listener callback for the POP3 service.
pub fn acceptor() -> crate::server::listener::AcceptFn {
    Box::new(|fd, peer| {
        if let Err(e) = PopConnection::spawn(fd, peer) {
            warn!("could not set up POP3 connection: {}", e);
            let _ = nix::unistd::close(fd);
        }
    })
}
