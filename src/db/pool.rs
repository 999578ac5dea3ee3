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

//! The process-wide pool of database handles.
//!
//! `submit` routes a query to the least busy usable handle, opening a new
//! one if all are busy and the configured maximum is not yet reached.
//! Transactions are pinned to a single handle for their lifetime. Idle
//! handles above the configured minimum are retired after an idle
//! interval.
//!
//! `LISTEN`/`NOTIFY` traffic from any handle is fanned out to registered
//! notification handlers; the flag and annotation interners use this to
//! stay coherent across worker processes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::db::postgres::PgClient;
use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::support::system_config::DatabaseConfig;

type NotifyHandler = Box<dyn Fn(&str)>;

struct Pool {
    config: Option<DatabaseConfig>,
    handles: Vec<Rc<RefCell<PgClient>>>,
    /// Queries that arrived while no handle was usable.
    overflow: Vec<Query>,
    /// Transactions waiting for a free handle.
    blocked_tx: Vec<Transaction>,
    notify_handlers: HashMap<String, NotifyHandler>,
    ident_retry_spent: bool,
    last_maintenance: Instant,
}

thread_local! {
    static POOL: RefCell<Pool> = RefCell::new(Pool {
        config: None,
        handles: Vec::new(),
        overflow: Vec::new(),
        blocked_tx: Vec::new(),
        notify_handlers: HashMap::new(),
        ident_retry_spent: false,
        last_maintenance: Instant::now(),
    });
}

/// Installs the database configuration. Must happen before any query is
/// submitted.
pub fn configure(config: DatabaseConfig) {
    POOL.with(|p| p.borrow_mut().config = Some(config));
}

pub fn tsearch_config() -> Option<String> {
    POOL.with(|p| {
        p.borrow()
            .config
            .as_ref()
            .and_then(|c| c.tsearch_config.clone())
    })
}

/// Registers a handler for `NOTIFY` traffic on `channel`.
pub fn on_notification(
    channel: impl Into<String>,
    handler: impl Fn(&str) + 'static,
) {
    POOL.with(|p| {
        p.borrow_mut()
            .notify_handlers
            .insert(channel.into(), Box::new(handler));
    });
}

pub(super) fn dispatch_notification(channel: &str, payload: &str) {
    POOL.with(|p| {
        if let Some(handler) = p.borrow().notify_handlers.get(channel) {
            handler(payload);
        }
    });
}

/// Routes `query` to the least busy handle.
pub fn submit(query: Query) {
    if let Some(tx) = query.transaction() {
        // Transactional queries travel with their transaction.
        submit_transaction(tx);
        return;
    }

    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        match best_handle(&pool, false) {
            Some(handle) => handle.borrow_mut().accept(query),
            None => {
                if !grow(&mut pool) {
                    warn!("database pool exhausted; queueing query");
                }
                pool.overflow.push(query);
            },
        }
    });
}

/// Routes a transaction's pending queries to its bound handle, binding
/// one now if needed.
pub fn submit_transaction(tx: Transaction) {
    let root = tx.root();
    POOL.with(|p| {
        let mut pool = p.borrow_mut();

        let bound = pool
            .handles
            .iter()
            .find(|h| h.borrow().reserved_for(&root))
            .cloned();
        if let Some(handle) = bound {
            handle.borrow_mut().accept_transaction(&tx);
            return;
        }

        match best_handle(&pool, true) {
            Some(handle) => {
                handle.borrow_mut().accept_transaction(&tx)
            },
            None => {
                if !grow(&mut pool) {
                    warn!(
                        "database pool exhausted; transaction blocked"
                    );
                }
                root.set_blocked();
                pool.blocked_tx.push(tx);
            },
        }
    });
}

/// Picks the least busy handle that can take new work. Transactions
/// require a handle with no reservation at all.
fn best_handle(
    pool: &Pool,
    for_transaction: bool,
) -> Option<Rc<RefCell<PgClient>>> {
    pool.handles
        .iter()
        .filter(|h| {
            let h = h.borrow();
            h.ready() && (!for_transaction || !h.has_transaction())
        })
        .min_by_key(|h| h.borrow().busyness())
        .cloned()
}

/// Opens another handle if below the maximum. Returns whether a new
/// handle now exists.
fn grow(pool: &mut Pool) -> bool {
    let config = match pool.config {
        Some(ref c) => c.clone(),
        None => {
            error!("database pool used before configuration");
            return false;
        },
    };
    if pool.handles.len() >= config.max_handles as usize {
        return false;
    }

    match PgClient::spawn(config, pool.ident_retry_spent) {
        Ok(handle) => {
            pool.handles.push(handle);
            true
        },
        Err(e) => {
            error!("cannot open database connection: {}", e);
            false
        },
    }
}

/// Called by a startup-failed client which hit the IDENT rejection: it
/// has closed itself, and exactly one replacement attempt is made.
pub(super) fn spawn_ident_retry() {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.ident_retry_spent {
            error!(
                "disaster: IDENT authentication failed twice; \
                 giving up on the database"
            );
            return;
        }
        pool.ident_retry_spent = true;
        grow(&mut pool);
    });
}

/// Periodic housekeeping, run from the reactor's idle hook: dead handles
/// are forgotten, queued work is re-routed, and surplus idle handles are
/// retired.
pub fn maintain() {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.last_maintenance.elapsed() < Duration::from_secs(1) {
            return;
        }
        pool.last_maintenance = Instant::now();

        pool.handles.retain(|h| h.borrow().usable());

        // Re-route work that was waiting for capacity.
        let overflow: Vec<Query> = pool.overflow.drain(..).collect();
        let blocked: Vec<Transaction> =
            pool.blocked_tx.drain(..).collect();
        drop(pool);
        for query in overflow {
            submit(query);
        }
        for tx in blocked {
            submit_transaction(tx);
        }

        let mut pool = p.borrow_mut();
        let (min, idle_secs) = match pool.config {
            Some(ref c) => {
                (c.min_handles as usize, c.handle_idle_secs as u64)
            },
            None => return,
        };
        let mut live = pool.handles.len();
        let idle_cutoff = Duration::from_secs(idle_secs);
        for handle in pool.handles.clone() {
            if live <= min {
                break;
            }
            let retire = {
                let h = handle.borrow();
                h.idle() && h.last_active.elapsed() >= idle_cutoff
            };
            if retire {
                handle.borrow_mut().retire();
                live -= 1;
            }
        }
        pool.handles.retain(|h| h.borrow().usable());
    });
}

/// Ensures the configured minimum number of handles is open, e.g. at
/// startup.
pub fn warm_up() {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        let min = pool
            .config
            .as_ref()
            .map_or(0, |c| c.min_handles as usize);
        while pool.handles.len() < min {
            if !grow(&mut pool) {
                break;
            }
        }
    });
}
