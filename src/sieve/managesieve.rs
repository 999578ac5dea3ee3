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

//! The ManageSieve protocol: script upload and activation.
//!
//! The wire syntax is a small cousin of IMAP's: quoted strings and
//! `{N+}` literals. Uploaded scripts are parse-checked before storage,
//! and `fileinto` targets under the user's home that do not exist yet
//! are created together with the script. Literal responses always use
//! the `{N+}` form; some clients mis-parse quoted script bodies.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::imap::sasl::{
    self, Mechanism, Proof, SaslMachine, Step, MECHANISMS,
};
use crate::imap::server::User;
use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{self, Client, Event};
use crate::server::task::Task;
use crate::sieve::parser;
use crate::store::mailbox;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const MAX_LINE: usize = 8192;
const MAX_SCRIPT: usize = 1024 * 1024;
const TIMEOUT_SECS: u64 = 30 * 60;

/// The extensions advertised in the SIEVE capability.
pub const SIEVE_EXTENSIONS: &str =
    "body envelope fileinto reject subaddress";

enum Pending {
    Auth {
        query: Query,
        login: String,
        proof: Proof,
    },
    PutScript {
        tx: Transaction,
        created: Vec<String>,
    },
    ListScripts {
        query: Query,
    },
    GetScript {
        query: Query,
        name: String,
    },
    SetActive {
        tx: Transaction,
        query: Option<Query>,
        name: String,
    },
    DeleteScript {
        query: Query,
        name: String,
    },
}

pub struct ManageSieveConnection {
    conn: Rc<RefCell<Connection>>,
    weak_self: Weak<RefCell<ManageSieveConnection>>,
    hostname: String,
    tls_helper: Option<String>,
    user: Option<User>,
    sasl: Option<SaslMachine>,
    pending: Option<Pending>,
    cmdline: Vec<u8>,
    need_literal: usize,
    tasks: Vec<Task>,
    quitting: bool,
}

impl ManageSieveConnection {
    pub fn spawn(
        fd: std::os::unix::io::RawFd,
        peer: String,
        hostname: String,
        tls_helper: Option<String>,
    ) -> Result<(), Error> {
        let prefix = LogPrefix::new("managesieve", peer);
        let conn = Rc::new(RefCell::new(Connection::wrap(
            fd,
            ConnKind::ManageSieveServer,
            prefix,
        )?));
        conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

        let server =
            Rc::new(RefCell::new(ManageSieveConnection {
                conn: Rc::clone(&conn),
                weak_self: Weak::new(),
                hostname,
                tls_helper,
                user: None,
                sasl: None,
                pending: None,
                cmdline: Vec::new(),
                need_literal: 0,
                tasks: Vec::new(),
                quitting: false,
            }));
        server.borrow_mut().weak_self = Rc::downgrade(&server);
        server.borrow_mut().send_banner();

        reactor::register(conn, server);
        Ok(())
    }

    fn send(&mut self, line: &str) {
        let mut conn = self.conn.borrow_mut();
        conn.enqueue_str(line);
        conn.enqueue_str("\r\n");
    }

    fn send_banner(&mut self) {
        let mechs: Vec<&str> =
            MECHANISMS.iter().map(|m| m.name()).collect();
        let lines = vec![
            "\"IMPLEMENTATION\" \"Oryx sieved\"".to_owned(),
            format!("\"SIEVE\" \"{}\"", SIEVE_EXTENSIONS),
            format!("\"SASL\" \"{}\"", mechs.join(" ")),
        ];
        for line in lines {
            self.send(&line);
        }
        if self.tls_helper.is_some() {
            self.send("\"STARTTLS\"");
        }
        self.send(&format!("OK \"{} ready\"", self.hostname));
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
            if self.need_literal > 0 {
                let taken = {
                    let mut conn = self.conn.borrow_mut();
                    let buf = conn.read_buffer();
                    let n = self.need_literal.min(buf.len());
                    if 0 == n {
                        Vec::new()
                    } else {
                        let bytes = buf
                            .string(n)
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
                match conn.read_buffer().remove_line(MAX_LINE) {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        drop(conn);
                        self.send("BYE \"Line too long\"");
                        self.conn.borrow_mut().start_close();
                        return Ok(());
                    },
                }
            };

            self.conn.borrow_mut().extend_timeout(TIMEOUT_SECS);

            if self.sasl.is_some() {
                self.sasl_line(&line);
                continue;
            }

            self.cmdline.extend_from_slice(&line);

            // Trailing {N+} (or {N}) announces a literal.
            let literal = trailing_literal(&self.cmdline);
            if let Some(len) = literal {
                if len > MAX_SCRIPT {
                    self.send("NO \"Script too large\"");
                    self.cmdline.clear();
                    continue;
                }
                self.cmdline.extend_from_slice(b"\r\n");
                self.need_literal = len;
                continue;
            }

            let command = std::mem::take(&mut self.cmdline);
            self.run_command(&command);
        }
    }

    fn run_command(&mut self, line: &[u8]) {
        if self.pending.is_some() {
            // One command at a time on this protocol.
            self.send("NO \"Command already in progress\"");
            return;
        }

        let mut args = Arguments::new(line);
        let verb = match args.word() {
            Some(verb) => verb.to_ascii_uppercase(),
            None => {
                self.send("NO \"Expected a command\"");
                return;
            },
        };

        match verb.as_str() {
            "CAPABILITY" => {
                self.send_banner();
            },
            "NOOP" => self.send("OK \"noop\""),
            "LOGOUT" => {
                self.send("OK \"bye\"");
                self.quitting = true;
                self.conn.borrow_mut().start_close();
            },
            "STARTTLS" => {
                self.send(
                    "NO \"TLS is terminated by the network \
                     front end\"",
                );
            },
            "AUTHENTICATE" => self.cmd_authenticate(&mut args),
            "HAVESPACE" => {
                let name = args.string();
                let size = args
                    .word()
                    .and_then(|w| w.parse::<usize>().ok());
                match (name, size) {
                    (Some(_), Some(size))
                        if size <= MAX_SCRIPT =>
                    {
                        self.send("OK \"put it there\"")
                    },
                    (Some(_), Some(_)) => self.send(
                        "NO (QUOTA/MAXSIZE) \"Script too large\"",
                    ),
                    _ => self
                        .send("NO \"Syntax: HAVESPACE name size\""),
                }
            },
            "PUTSCRIPT" => self.cmd_putscript(&mut args),
            "LISTSCRIPTS" => self.cmd_listscripts(),
            "SETACTIVE" => self.cmd_setactive(&mut args),
            "GETSCRIPT" => self.cmd_getscript(&mut args),
            "DELETESCRIPT" => self.cmd_deletescript(&mut args),
            other => {
                self.send(&format!(
                    "NO \"Unknown command {}\"",
                    other,
                ));
            },
        }
    }

    fn require_auth(&mut self) -> Option<User> {
        match self.user {
            Some(ref user) => Some(user.clone()),
            None => {
                self.send("NO \"Authenticate first\"");
                None
            },
        }
    }

    fn cmd_authenticate(&mut self, args: &mut Arguments<'_>) {
        let mech = match args.string() {
            Some(mech) => mech,
            None => {
                self.send("NO \"Syntax: AUTHENTICATE mechanism\"");
                return;
            },
        };
        let mech = match Mechanism::by_name(&mech) {
            Some(mech) => mech,
            None => {
                self.send("NO \"Unsupported mechanism\"");
                return;
            },
        };

        let initial = args.string().and_then(|s| {
            if "=" == s {
                Some(Vec::new())
            } else {
                base64::decode(&s).ok()
            }
        });

        let mut machine = SaslMachine::new(mech, &self.hostname);
        match machine.start(initial) {
            Step::Challenge(challenge) => {
                self.send(&format!("\"{}\"", challenge));
                self.sasl = Some(machine);
            },
            Step::Verify { login, proof } => {
                self.sasl = Some(machine);
                self.start_auth_lookup(login, proof);
            },
            Step::Failed(why) => {
                self.send(&format!("NO \"{}\"", why));
            },
        }
    }

    fn sasl_line(&mut self, line: &[u8]) {
        let mut machine = match self.sasl.take() {
            Some(machine) => machine,
            None => return,
        };

        if b"*" == line {
            machine.terminate();
            self.send("NO \"Authentication aborted\"");
            return;
        }

        // Responses may be quoted or bare base64.
        let trimmed: &[u8] =
            if line.starts_with(b"\"") && line.ends_with(b"\"") {
                &line[1..line.len() - 1]
            } else {
                line
            };
        let decoded = match base64::decode(trimmed) {
            Ok(d) => d,
            Err(_) => {
                self.send("NO \"Bad base64 data\"");
                return;
            },
        };

        match machine.respond(&decoded) {
            Step::Challenge(challenge) => {
                self.send(&format!("\"{}\"", challenge));
                self.sasl = Some(machine);
            },
            Step::Verify { login, proof } => {
                self.sasl = Some(machine);
                self.start_auth_lookup(login, proof);
            },
            Step::Failed(why) => {
                self.send(&format!("NO \"{}\"", why));
            },
        }
    }

    fn start_auth_lookup(&mut self, login: String, proof: Proof) {
        let query = Query::prepared(
            "user_by_login",
            "select id, login, secret, home from users \
             where lower(login)=lower($1)",
        );
        query.bind(1, login.as_str());
        let task = self.make_task();
        query.execute(Some(task));
        self.pending = Some(Pending::Auth {
            query,
            login,
            proof,
        });
    }

    fn cmd_putscript(&mut self, args: &mut Arguments<'_>) {
        let user = match self.require_auth() {
            Some(user) => user,
            None => return,
        };
        let (name, script) = match (args.string(), args.string())
        {
            (Some(name), Some(script)) => (name, script),
            _ => {
                self.send(
                    "NO \"Syntax: PUTSCRIPT name script\"",
                );
                return;
            },
        };

        let parsed = match parser::parse(&script) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.send(&format!(
                    "NO \"{}\"",
                    e.to_string().replace('"', "'"),
                ));
                return;
            },
        };

        // Auto-create missing fileinto targets under the user's home;
        // refuse targets that point outside it.
        let mut to_create = Vec::new();
        for target in fileinto_targets(&parsed.commands) {
            let full = if target.starts_with('/') {
                target.clone()
            } else {
                format!("{}{}", user.home, target)
            };
            if !full.starts_with(&user.home) {
                self.send(&format!(
                    "NO \"Mailbox {} is outside your home\"",
                    target.replace('"', "'"),
                ));
                return;
            }
            if mailbox::by_name(&full).is_none()
                && !to_create.contains(&full)
            {
                to_create.push(full);
            }
        }

        let tx = Transaction::new();
        for full in &to_create {
            let q = Query::new(
                "insert into mailboxes \
                 (name, owner, uidnext, uidvalidity, nextmodseq, \
                 deleted) \
                 values ($1, $2, 1, 1, 1, false) \
                 on conflict (name) do update set deleted=false \
                 returning id",
            );
            q.bind(1, full.as_str()).bind(2, user.id);
            tx.enqueue(q);
        }

        let store = Query::new(
            "insert into scripts (owner, name, script, active) \
             values ($1, $2, $3, false) \
             on conflict (owner, name) do update \
             set script=$3 returning id",
        );
        store
            .bind(1, user.id)
            .bind(2, name.as_str())
            .bind(3, script.as_str());
        tx.enqueue(store);

        let task = self.make_task();
        tx.commit(Some(task));
        self.pending = Some(Pending::PutScript {
            tx,
            created: to_create,
        });
    }

    fn cmd_listscripts(&mut self) {
        let user = match self.require_auth() {
            Some(user) => user,
            None => return,
        };
        let query = Query::prepared(
            "list_scripts",
            "select name, active from scripts \
             where owner=$1 order by name",
        );
        query.bind(1, user.id);
        let task = self.make_task();
        query.execute(Some(task));
        self.pending = Some(Pending::ListScripts { query });
    }

    fn cmd_setactive(&mut self, args: &mut Arguments<'_>) {
        let user = match self.require_auth() {
            Some(user) => user,
            None => return,
        };
        let name = match args.string() {
            Some(name) => name,
            None => {
                self.send("NO \"Syntax: SETACTIVE name\"");
                return;
            },
        };

        let tx = Transaction::new();
        let deactivate = Query::new(
            "update scripts set active=false where owner=$1",
        );
        deactivate.bind(1, user.id);
        tx.enqueue(deactivate);

        let activate = if name.is_empty() {
            None
        } else {
            let q = Query::new(
                "update scripts set active=true \
                 where owner=$1 and name=$2 returning id",
            );
            q.bind(1, user.id).bind(2, name.as_str());
            tx.enqueue(q.clone());
            Some(q)
        };

        let task = self.make_task();
        tx.commit(Some(task));
        self.pending = Some(Pending::SetActive {
            tx,
            query: activate,
            name,
        });
    }

    fn cmd_getscript(&mut self, args: &mut Arguments<'_>) {
        let user = match self.require_auth() {
            Some(user) => user,
            None => return,
        };
        let name = match args.string() {
            Some(name) => name,
            None => {
                self.send("NO \"Syntax: GETSCRIPT name\"");
                return;
            },
        };
        let query = Query::prepared(
            "get_script",
            "select script from scripts \
             where owner=$1 and name=$2",
        );
        query.bind(1, user.id).bind(2, name.as_str());
        let task = self.make_task();
        query.execute(Some(task));
        self.pending = Some(Pending::GetScript { query, name });
    }

    fn cmd_deletescript(&mut self, args: &mut Arguments<'_>) {
        let user = match self.require_auth() {
            Some(user) => user,
            None => return,
        };
        let name = match args.string() {
            Some(name) => name,
            None => {
                self.send("NO \"Syntax: DELETESCRIPT name\"");
                return;
            },
        };
        let query = Query::prepared(
            "delete_script",
            "delete from scripts \
             where owner=$1 and name=$2 and not active \
             returning id",
        );
        query.bind(1, user.id).bind(2, name.as_str());
        let task = self.make_task();
        query.execute(Some(task));
        self.pending = Some(Pending::DeleteScript { query, name });
    }

    /// Re-entered whenever an awaited operation completes.
    fn advance(&mut self) {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return,
        };

        match pending {
            Pending::Auth {
                query,
                login,
                proof,
            } => {
                if !query.done() {
                    self.pending = Some(Pending::Auth {
                        query,
                        login,
                        proof,
                    });
                    return;
                }
                if query.failed() {
                    self.sasl = None;
                    self.send(
                        "NO \"Temporary authentication failure\"",
                    );
                    return;
                }
                let row = query.next_row();
                let accepted = match row {
                    Some(ref row) => sasl::verify(
                        &proof,
                        &row.text("secret").unwrap_or_default(),
                    ),
                    None => {
                        let _ = sasl::verify(&proof, "");
                        false
                    },
                };
                self.sasl = None;
                if !accepted {
                    info!(
                        "{} authentication failed for {:?}",
                        self.conn.borrow().log_prefix(),
                        login,
                    );
                    self.send("NO \"Authentication failed\"");
                    return;
                }
                let row = row.expect("accepted without row");
                let user = User {
                    id: row.uint("id").unwrap_or(0),
                    login: row
                        .text("login")
                        .unwrap_or(login),
                    home: row
                        .text("home")
                        .unwrap_or_else(|| "/".to_owned()),
                };
                self.conn
                    .borrow()
                    .log_prefix()
                    .set_user(user.login.clone());
                self.user = Some(user);
                self.send("OK \"Authenticated\"");
            },
            Pending::PutScript { tx, created } => {
                if !tx.done() {
                    self.pending =
                        Some(Pending::PutScript { tx, created });
                    return;
                }
                if tx.failed() {
                    self.send(&format!(
                        "NO \"Cannot store script: {}\"",
                        tx.error()
                            .unwrap_or_default()
                            .replace('"', "'"),
                    ));
                    return;
                }
                if created.is_empty() {
                    self.send("OK \"Stored\"");
                } else {
                    // The registry learns of the new mailboxes on the
                    // next refresh; report them now.
                    let list = created
                        .iter()
                        .map(|n| format!("\\\"{}\\\"", n))
                        .collect::<Vec<_>>()
                        .join(", ");
                    self.send(&format!(
                        "OK \"Created mailbox {}.\"",
                        list,
                    ));
                }
            },
            Pending::ListScripts { query } => {
                if !query.done() {
                    self.pending =
                        Some(Pending::ListScripts { query });
                    return;
                }
                if query.failed() {
                    self.send("NO \"Database error\"");
                    return;
                }
                let mut lines = Vec::new();
                while let Some(row) = query.next_row() {
                    let name =
                        row.text("name").unwrap_or_default();
                    let active =
                        row.boolean("active").unwrap_or(false);
                    lines.push(format!(
                        "\"{}\"{}",
                        name.replace('"', "'"),
                        if active { " ACTIVE" } else { "" },
                    ));
                }
                for line in lines {
                    self.send(&line);
                }
                self.send("OK \"Listed\"");
            },
            Pending::GetScript { query, name } => {
                if !query.done() {
                    self.pending =
                        Some(Pending::GetScript { query, name });
                    return;
                }
                if query.failed() {
                    self.send("NO \"Database error\"");
                    return;
                }
                match query
                    .next_row()
                    .and_then(|row| row.text("script"))
                {
                    Some(script) => {
                        // Literal form, never quoted; see module doc.
                        let mut conn = self.conn.borrow_mut();
                        conn.enqueue_str(&format!(
                            "{{{}+}}\r\n",
                            script.len(),
                        ));
                        conn.enqueue_str(&script);
                        conn.enqueue_str("\r\n");
                        drop(conn);
                        self.send("OK \"Here you go\"");
                    },
                    None => {
                        self.send(&format!(
                            "NO (NONEXISTENT) \"No script \
                             named {}\"",
                            name.replace('"', "'"),
                        ));
                    },
                }
            },
            Pending::SetActive { tx, query, name } => {
                if !tx.done() {
                    self.pending = Some(Pending::SetActive {
                        tx,
                        query,
                        name,
                    });
                    return;
                }
                if tx.failed() {
                    self.send("NO \"Database error\"");
                    return;
                }
                match query {
                    None => self.send("OK \"No active script\""),
                    Some(q) => {
                        if q.next_row().is_some() {
                            self.send("OK \"Activated\"");
                        } else {
                            self.send(&format!(
                                "NO (NONEXISTENT) \"No script \
                                 named {}\"",
                                name.replace('"', "'"),
                            ));
                        }
                    },
                }
            },
            Pending::DeleteScript { query, name } => {
                if !query.done() {
                    self.pending =
                        Some(Pending::DeleteScript { query, name });
                    return;
                }
                if query.failed() {
                    self.send("NO \"Database error\"");
                    return;
                }
                if query.next_row().is_some() {
                    self.send("OK \"Deleted\"");
                } else {
                    self.send(&format!(
                        "NO (ACTIVE) \"{} is active or does \
                         not exist\"",
                        name.replace('"', "'"),
                    ));
                }
            },
        }

        let _ = self.conn.borrow_mut().flush();
    }
}

impl Client for ManageSieveConnection {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Read => self.process_input(),
            Event::Timeout => {
                self.send("BYE \"Idle too long\"");
                self.conn.borrow_mut().start_close();
                Ok(())
            },
            Event::Shutdown => {
                if !self.quitting {
                    self.send("BYE \"Server shutting down\"");
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

/// Splits a ManageSieve command line into words, quoted strings and
/// inline literals.
struct Arguments<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Arguments<'a> {
    fn new(input: &'a [u8]) -> Self {
        Arguments { input, pos: 0 }
    }

    fn skip_spaces(&mut self) {
        while self.input.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    /// A bare word (command name, number).
    fn word(&mut self) -> Option<String> {
        self.skip_spaces();
        let start = self.pos;
        while self.input.get(self.pos).map_or(false, |&c| {
            c != b' ' && c != b'"' && c != b'{'
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            None
        } else {
            Some(
                String::from_utf8_lossy(
                    &self.input[start..self.pos],
                )
                .into_owned(),
            )
        }
    }

    /// A quoted string or `{N+}CRLF<bytes>` literal.
    fn string(&mut self) -> Option<String> {
        self.skip_spaces();
        match self.input.get(self.pos) {
            Some(b'"') => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.input.get(self.pos) {
                        None => return None,
                        Some(b'"') => {
                            self.pos += 1;
                            return Some(out);
                        },
                        Some(b'\\') => {
                            self.pos += 1;
                            if let Some(&c) =
                                self.input.get(self.pos)
                            {
                                out.push(c as char);
                                self.pos += 1;
                            }
                        },
                        Some(&c) => {
                            out.push(c as char);
                            self.pos += 1;
                        },
                    }
                }
            },
            Some(b'{') => {
                let close = self.input[self.pos..]
                    .iter()
                    .position(|&c| c == b'}')?
                    + self.pos;
                let digits: String = self.input
                    [self.pos + 1..close]
                    .iter()
                    .take_while(|&&c| c.is_ascii_digit())
                    .map(|&c| c as char)
                    .collect();
                let len: usize = digits.parse().ok()?;
                // Skip "}\r\n"
                let mut body = close + 1;
                if self.input.get(body) == Some(&b'\r') {
                    body += 1;
                }
                if self.input.get(body) == Some(&b'\n') {
                    body += 1;
                }
                if self.input.len() < body + len {
                    return None;
                }
                let out = String::from_utf8_lossy(
                    &self.input[body..body + len],
                )
                .into_owned();
                self.pos = body + len;
                Some(out)
            },
            _ => self.word(),
        }
    }
}

/// The trailing-literal announcement, if the line ends with `{N}` or
/// `{N+}`.
fn trailing_literal(line: &[u8]) -> Option<usize> {
    if !line.ends_with(b"}") {
        return None;
    }
    let open = line.iter().rposition(|&c| c == b'{')?;
    let inner = &line[open + 1..line.len() - 1];
    let digits = if inner.ends_with(b"+") {
        &inner[..inner.len() - 1]
    } else {
        inner
    };
    if digits.is_empty()
        || !digits.iter().all(u8::is_ascii_digit)
    {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Every mailbox a script's `fileinto` commands reference.
fn fileinto_targets(
    commands: &[crate::sieve::ast::Command],
) -> Vec<String> {
    use crate::sieve::ast::Command;

    let mut out = Vec::new();
    for command in commands {
        match *command {
            Command::FileInto(ref target) => {
                out.push(target.clone())
            },
            Command::If {
                ref arms,
                ref otherwise,
            } => {
                for (_, body) in arms {
                    out.extend(fileinto_targets(body));
                }
                if let Some(body) = otherwise {
                    out.extend(fileinto_targets(body));
                }
            },
            _ => (),
        }
    }
    out
}

/// Listener callback for the ManageSieve service.
pub fn acceptor(
    hostname: String,
    tls_helper: Option<String>,
) -> crate::server::listener::AcceptFn {
    Box::new(move |fd, peer| {
        if let Err(e) = ManageSieveConnection::spawn(
            fd,
            peer,
            hostname.clone(),
            tls_helper.clone(),
        ) {
            warn!(
                "could not set up ManageSieve connection: {}",
                e,
            );
            let _ = nix::unistd::close(fd);
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trailing_literal_detection() {
        assert_eq!(
            Some(46),
            trailing_literal(b"PUTSCRIPT \"r\" {46+}"),
        );
        assert_eq!(
            Some(5),
            trailing_literal(b"PUTSCRIPT \"r\" {5}"),
        );
        assert_eq!(None, trailing_literal(b"NOOP"));
        assert_eq!(None, trailing_literal(b"GETSCRIPT \"x{}\""));
    }

    #[test]
    fn argument_parsing() {
        let mut args =
            Arguments::new(b"PUTSCRIPT \"r\" {4+}\r\nkeep");
        assert_eq!(Some("PUTSCRIPT".to_owned()), args.word());
        assert_eq!(Some("r".to_owned()), args.string());
        assert_eq!(Some("keep".to_owned()), args.string());
    }

    #[test]
    fn fileinto_target_extraction() {
        let script = parser::parse(
            "require [\"fileinto\"]; \
             if true { fileinto \"a\"; } \
             else { fileinto \"b\"; } \
             fileinto \"a\";",
        )
        .unwrap();
        assert_eq!(
            vec![
                "a".to_owned(),
                "b".to_owned(),
                "a".to_owned(),
            ],
            fileinto_targets(&script.commands),
        );
    }
}
