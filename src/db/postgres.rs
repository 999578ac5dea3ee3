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

//! One connection speaking the PostgreSQL frontend/backend protocol.
//!
//! Queries are pipelined: several may be outstanding, and responses are
//! associated with the head of the sent queue. Once a query belonging to a
//! transaction goes out, the connection is dedicated to that transaction
//! until it commits or rolls back.
//!
//! There is one historical workaround: a TCP connection refused with an
//! IDENT authentication failure during startup is retried exactly once on
//! a fresh socket, since some ident daemons fail transiently right after
//! boot. A second identical failure is a disaster.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::db::query::{Query, QueryState};
use crate::db::transaction::Transaction;
use crate::db::wire::{self, AuthRequest, BackendMessage};
use crate::server::connection::{ConnKind, Connection};
use crate::server::reactor::{Client, Event};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::DatabaseConfig;

/// How many queries may be on the wire at once before `ready()` reports
/// this handle as busy.
const PIPELINE_DEPTH: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgState {
    Connecting,
    Startup,
    Authenticating,
    Idle,
    InTransaction,
    FailedTransaction,
    Broken,
}

pub struct PgClient {
    conn: Rc<RefCell<Connection>>,
    config: DatabaseConfig,
    state: PgState,
    tcp: bool,
    /// Whether this connection is the one permitted IDENT retry.
    ident_retried: bool,
    params: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    prepared: HashSet<String>,
    /// Sent and awaiting responses, FIFO.
    sent: VecDeque<Query>,
    /// Accepted but not yet sent.
    pending: VecDeque<Query>,
    /// The transaction this connection is dedicated to, if any.
    tx: Option<Transaction>,
    /// Savepoints that failed and need a ROLLBACK TO once the stream
    /// settles.
    savepoint_recovery: VecDeque<String>,
    pub(super) last_active: Instant,
}

impl PgClient {
    /// Opens a socket to the configured server and registers with the
    /// reactor. The returned handle is shared with the pool.
    pub fn spawn(
        config: DatabaseConfig,
        ident_retried: bool,
    ) -> Result<Rc<RefCell<PgClient>>, Error> {
        use nix::sys::socket::*;

        let prefix =
            LogPrefix::new("pg", config.address.clone());
        let tcp = !config.address.starts_with('/');

        let (fd, connected) = if tcp {
            let parsed: std::net::SocketAddr =
                config.address.parse().map_err(|_| {
                    Error::BadConfig(format!(
                        "unparseable database address: {}",
                        config.address,
                    ))
                })?;
            let family = if parsed.is_ipv4() {
                AddressFamily::Inet
            } else {
                AddressFamily::Inet6
            };
            let fd =
                socket(family, SockType::Stream, SockFlag::empty(), None)?;
            nix::fcntl::fcntl(
                fd,
                nix::fcntl::FcntlArg::F_SETFL(
                    nix::fcntl::OFlag::O_NONBLOCK,
                ),
            )?;
            let addr = SockaddrStorage::from(parsed);
            match connect(fd, &addr) {
                Ok(()) => (fd, true),
                Err(nix::errno::Errno::EINPROGRESS) => (fd, false),
                Err(e) => return Err(e.into()),
            }
        } else {
            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::empty(),
                None,
            )?;
            let addr = UnixAddr::new(config.address.as_str())?;
            connect(fd, &addr)?;
            (fd, true)
        };

        let conn = if connected {
            Connection::wrap(fd, ConnKind::DatabaseClient, prefix)?
        } else {
            Connection::connecting(fd, ConnKind::DatabaseClient, prefix)?
        };
        let conn = Rc::new(RefCell::new(conn));

        let mut client = PgClient {
            conn: Rc::clone(&conn),
            config,
            state: PgState::Connecting,
            tcp,
            ident_retried,
            params: HashMap::new(),
            backend_key: None,
            prepared: HashSet::new(),
            sent: VecDeque::new(),
            pending: VecDeque::new(),
            tx: None,
            savepoint_recovery: VecDeque::new(),
            last_active: Instant::now(),
        };
        if connected {
            client.send_startup();
        }

        let client = Rc::new(RefCell::new(client));
        crate::server::reactor::register(
            conn,
            Rc::clone(&client) as Rc<RefCell<dyn Client>>,
        );
        Ok(client)
    }

    pub fn state(&self) -> PgState {
        self.state
    }

    pub fn usable(&self) -> bool {
        matches!(
            self.state,
            PgState::Connecting
                | PgState::Startup
                | PgState::Authenticating
                | PgState::Idle
                | PgState::InTransaction
        )
    }

    /// Whether this handle is a good home for new work.
    pub fn ready(&self) -> bool {
        self.usable()
            && self.tx.is_none()
            && self.sent.len() <= PIPELINE_DEPTH
    }

    pub fn busyness(&self) -> usize {
        self.sent.len() + self.pending.len()
    }

    pub fn idle(&self) -> bool {
        PgState::Idle == self.state
            && self.sent.is_empty()
            && self.pending.is_empty()
            && self.tx.is_none()
    }

    pub fn reserved_for(&self, tx: &Transaction) -> bool {
        self.tx.as_ref().map_or(false, |t| t.ptr_eq(tx))
    }

    pub fn has_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Accepts a query for eventual execution.
    pub fn accept(&mut self, query: Query) {
        self.pending.push_back(query);
        self.pump();
    }

    /// Accepts the pending queries of `tx`, dedicating the connection to
    /// it if not already done.
    pub fn accept_transaction(&mut self, tx: &Transaction) {
        let root = tx.root();
        if self.tx.is_none() {
            self.tx = Some(root.clone());
        }
        root.set_executing();
        for query in tx.take_pending() {
            self.pending.push_back(query);
        }
        self.pump();
    }

    /// Politely shuts the connection down.
    pub fn retire(&mut self) {
        let mut conn = self.conn.borrow_mut();
        let mut out = Vec::new();
        wire::terminate(&mut out);
        conn.enqueue(&out);
        conn.start_close();
        self.state = PgState::Broken;
    }

    fn send_startup(&mut self) {
        let mut out = Vec::new();
        wire::startup(&self.config.user, &self.config.name, &mut out);
        self.conn.borrow_mut().enqueue(&out);
        self.state = PgState::Startup;
        self.conn.borrow_mut().extend_timeout(60);
    }

    /// Sends as much pending work as pipelining and transaction
    /// reservation allow.
    fn pump(&mut self) {
        if !matches!(
            self.state,
            PgState::Idle | PgState::InTransaction
        ) {
            return;
        }

        while let Some(query) = self.pending.front().cloned() {
            if let Some(tx) = query.transaction() {
                let root = tx.root();
                match self.tx {
                    Some(ref bound) if bound.ptr_eq(&root) => (),
                    Some(_) => break,
                    None => self.tx = Some(root),
                }
            } else if self.tx.is_some() {
                // Reserved; non-transaction work must wait its turn
                // elsewhere.
                break;
            }

            self.pending.pop_front();
            self.send_query(&query);
        }

        let _ = self.conn.borrow_mut().flush();
    }

    fn send_query(&mut self, query: &Query) {
        let params = match query.assemble() {
            Ok(params) => params,
            Err(e) => {
                query.fail(e.to_string());
                return;
            },
        };

        let statement = query.statement();
        let mut out = Vec::new();
        if statement.is_empty() || !self.prepared.contains(&statement) {
            wire::parse(&statement, &query.sql(), &mut out);
            if !statement.is_empty() {
                self.prepared.insert(statement.clone());
            }
        }
        wire::bind(&statement, &params, &mut out);
        wire::describe_portal(&mut out);
        wire::execute(&mut out);
        wire::sync(&mut out);

        self.conn.borrow_mut().enqueue(&out);
        query.set_state(QueryState::Executing);
        self.sent.push_back(query.clone());
        self.last_active = Instant::now();
    }

    fn handle_message(
        &mut self,
        msg: BackendMessage,
    ) -> Result<(), Error> {
        match msg {
            BackendMessage::Authentication(req) => self.handle_auth(req),
            BackendMessage::ParameterStatus { name, value } => {
                self.params.insert(name, value);
                Ok(())
            },
            BackendMessage::BackendKeyData { pid, key } => {
                self.backend_key = Some((pid, key));
                Ok(())
            },
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::ParameterDescription
            | BackendMessage::PortalSuspended => Ok(()),
            BackendMessage::RowDescription(columns) => {
                if let Some(query) = self.sent.front() {
                    query.set_columns(Rc::new(columns));
                }
                Ok(())
            },
            BackendMessage::DataRow(values) => {
                if let Some(query) = self.sent.front() {
                    query.deliver_row(values);
                }
                Ok(())
            },
            BackendMessage::CommandComplete(_)
            | BackendMessage::EmptyQueryResponse => {
                if let Some(query) = self.sent.pop_front() {
                    query.complete();
                }
                Ok(())
            },
            BackendMessage::ErrorResponse(diag) => {
                self.handle_error(diag);
                Ok(())
            },
            BackendMessage::NoticeResponse(diag) => {
                info!(
                    "{} notice: {}",
                    self.conn.borrow().log_prefix(),
                    diag.message,
                );
                Ok(())
            },
            BackendMessage::ReadyForQuery(indicator) => {
                self.handle_ready(indicator);
                Ok(())
            },
            BackendMessage::CopyInResponse => {
                self.handle_copy_in();
                Ok(())
            },
            BackendMessage::NotificationResponse {
                channel, payload, ..
            } => {
                crate::db::pool::dispatch_notification(
                    &channel, &payload,
                );
                Ok(())
            },
            BackendMessage::Unknown(tag) => {
                warn!(
                    "{} ignoring unknown message '{}'",
                    self.conn.borrow().log_prefix(),
                    tag as char,
                );
                Ok(())
            },
        }
    }

    fn handle_auth(&mut self, req: AuthRequest) -> Result<(), Error> {
        let mut out = Vec::new();
        match req {
            AuthRequest::Ok => {
                self.state = PgState::Authenticating;
                return Ok(());
            },
            AuthRequest::CleartextPassword => {
                wire::password(&self.config.password, &mut out);
            },
            AuthRequest::Md5Password { salt } => {
                let response = wire::md5_auth_response(
                    &self.config.user,
                    &self.config.password,
                    &salt,
                );
                wire::password(&response, &mut out);
            },
            AuthRequest::CryptPassword { .. } => {
                return Err(Error::UnsupportedAuth("crypt".to_owned()));
            },
            AuthRequest::Unsupported(subtype) => {
                return Err(Error::UnsupportedAuth(format!(
                    "subtype {}",
                    subtype,
                )));
            },
        }
        self.state = PgState::Authenticating;
        self.conn.borrow_mut().enqueue(&out);
        Ok(())
    }

    fn handle_error(&mut self, diag: wire::Diagnostic) {
        if matches!(
            self.state,
            PgState::Connecting | PgState::Startup | PgState::Authenticating
        ) {
            self.startup_failed(diag);
            return;
        }

        let query = match self.sent.pop_front() {
            Some(q) => q,
            None => {
                warn!(
                    "{} stray error: {}",
                    self.conn.borrow().log_prefix(),
                    diag.message,
                );
                return;
            },
        };

        debug!(
            "{} query failed ({}): {}",
            self.conn.borrow().log_prefix(),
            diag.code,
            diag.message,
        );
        query.fail(diag.message.clone());

        // 25P02 means the statement was skipped because the transaction
        // was already aborted; the original error has been attributed.
        let collateral = "25P02" == diag.code;
        if let Some(tx) = query.transaction() {
            if !query.can_fail() && !collateral {
                tx.mark_failed(diag.message);
                if let Some(name) = tx.savepoint() {
                    // Restore the enclosing transaction once the stream
                    // settles.
                    self.savepoint_recovery.push_back(name);
                }
            }
        }
    }

    fn startup_failed(&mut self, diag: wire::Diagnostic) {
        let ident = diag.message.contains("IDENT authentication failed");
        if ident && self.tcp && !self.ident_retried {
            warn!(
                "{} IDENT rejection at startup; retrying once",
                self.conn.borrow().log_prefix(),
            );
            self.state = PgState::Broken;
            self.conn.borrow_mut().start_close();
            crate::db::pool::spawn_ident_retry();
            return;
        }

        error!(
            "{} disaster: cannot connect to database: {}",
            self.conn.borrow().log_prefix(),
            diag.message,
        );
        self.state = PgState::Broken;
        self.conn.borrow_mut().start_close();
    }

    fn handle_ready(&mut self, indicator: u8) {
        let was_startup = matches!(
            self.state,
            PgState::Startup | PgState::Authenticating
        );
        self.state = match indicator {
            b'T' => PgState::InTransaction,
            b'E' => PgState::FailedTransaction,
            _ => PgState::Idle,
        };

        if was_startup {
            info!(
                "{} connected to database \"{}\"",
                self.conn.borrow().log_prefix(),
                self.config.name,
            );
            self.conn.borrow_mut().clear_timeout();
        }

        if let Some(name) = self.savepoint_recovery.pop_front() {
            let recover =
                Query::new(format!("ROLLBACK TO SAVEPOINT {}", name));
            if let Some(ref tx) = self.tx {
                recover.set_transaction(tx.clone());
            }
            self.send_query(&recover);
            let _ = self.conn.borrow_mut().flush();
            return;
        }

        // A FailedTransaction resolves once its ROLLBACK goes through;
        // the terminal ReadyForQuery arrives with 'I'.
        if let Some(tx) = self.tx.clone() {
            if b'I' == indicator {
                if tx.is_finishing() || tx.failed() {
                    if !tx.failed() {
                        tx.mark_completed();
                    }
                    self.tx = None;
                    self.prune_dead_tx_work();
                }
            } else if b'E' == indicator && !tx.failed() && !tx.is_finishing()
            {
                // Something server-side aborted the transaction.
                tx.mark_failed(
                    "transaction aborted by server".to_owned(),
                );
            }
        }

        self.last_active = Instant::now();
        self.pump();
    }

    /// Drops pending queries whose transaction has already reached a
    /// terminal state; their results could never matter.
    fn prune_dead_tx_work(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|q| {
            q.transaction().map_or(true, |tx| !tx.done())
        });
        if before != self.pending.len() {
            debug!(
                "{} dropped {} queries from dead transaction",
                self.conn.borrow().log_prefix(),
                before - self.pending.len(),
            );
        }
    }

    fn handle_copy_in(&mut self) {
        let mut out = Vec::new();
        match self.sent.front().and_then(|q| q.take_copy_lines()) {
            Some(lines) => {
                for line in &lines {
                    wire::copy_data(line, &mut out);
                }
                wire::copy_done(&mut out);
            },
            None => {
                wire::copy_fail("no copy payload attached", &mut out);
            },
        }
        self.conn.borrow_mut().enqueue(&out);
    }

    /// Fails everything in flight, e.g. when the connection drops.
    fn fail_all(&mut self, why: &str) {
        self.state = PgState::Broken;
        for query in
            self.sent.drain(..).chain(self.pending.drain(..))
        {
            query.fail(why.to_owned());
        }
        if let Some(tx) = self.tx.take() {
            tx.mark_failed(why.to_owned());
        }
    }
}

impl Client for PgClient {
    fn react(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Connect => {
                self.send_startup();
                Ok(())
            },
            Event::Read => {
                loop {
                    let msg = {
                        let mut conn = self.conn.borrow_mut();
                        wire::next_message(conn.read_buffer())?
                    };
                    match msg {
                        Some(msg) => self.handle_message(msg)?,
                        None => break,
                    }
                }
                let _ = self.conn.borrow_mut().flush();
                Ok(())
            },
            Event::Close | Event::Error => {
                warn!(
                    "{} database connection lost",
                    self.conn.borrow().log_prefix(),
                );
                self.fail_all("database connection lost");
                Ok(())
            },
            Event::Timeout => {
                if matches!(
                    self.state,
                    PgState::Connecting
                        | PgState::Startup
                        | PgState::Authenticating
                ) {
                    self.fail_all("database connection timed out");
                    self.conn.borrow_mut().start_close();
                }
                Ok(())
            },
            Event::Shutdown => {
                self.retire();
                Ok(())
            },
            Event::Write => Ok(()),
        }
    }

    fn on_destroy(&mut self) {
        self.fail_all("database connection destroyed");
    }
}
