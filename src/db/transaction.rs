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

//! Transactions group queries for atomic execution.
//!
//! All of a transaction's queries run on a single database connection in
//! the order enqueued. The transaction commits only if every
//! non-recoverable query succeeded and `commit()` was called; anything
//! else ends in rollback. Sub-transactions map onto savepoints: a failed
//! sub-transaction aborts only itself unless the caller chooses to
//! propagate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::db::query::Query;
use crate::server::task::Task;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Inactive,
    /// Queries are flowing to the connection.
    Executing,
    /// Waiting for a connection to become available.
    Blocked,
    Completed,
    Failed,
}

pub(super) struct TxInner {
    state: TxState,
    pending: VecDeque<Query>,
    /// Set once BEGIN (or SAVEPOINT) has been emitted.
    began: bool,
    /// Set once COMMIT/ROLLBACK (or RELEASE/ROLLBACK TO) is enqueued.
    finishing: bool,
    error: Option<String>,
    parent: Option<Transaction>,
    /// Savepoint name when this is a sub-transaction.
    savepoint: Option<String>,
    next_savepoint: u32,
    /// Resumed when the transaction reaches a terminal state.
    task: Option<Task>,
}

#[derive(Clone)]
pub struct Transaction {
    inner: Rc<RefCell<TxInner>>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            inner: Rc::new(RefCell::new(TxInner {
                state: TxState::Inactive,
                pending: VecDeque::new(),
                began: false,
                finishing: false,
                error: None,
                parent: None,
                savepoint: None,
                next_savepoint: 0,
                task: None,
            })),
        }
    }

    /// Creates a sub-transaction backed by a savepoint. Its queries run on
    /// the same connection, interleaved at the point `execute()` is
    /// called.
    pub fn sub_transaction(&self) -> Transaction {
        let name = {
            let mut inner = self.inner.borrow_mut();
            inner.next_savepoint += 1;
            format!("s{}", inner.next_savepoint)
        };
        let sub = Transaction::new();
        {
            let mut inner = sub.inner.borrow_mut();
            inner.parent = Some(self.clone());
            inner.savepoint = Some(name);
        }
        sub
    }

    pub fn state(&self) -> TxState {
        self.inner.borrow().state
    }

    pub fn failed(&self) -> bool {
        TxState::Failed == self.state()
    }

    pub fn done(&self) -> bool {
        matches!(self.state(), TxState::Completed | TxState::Failed)
    }

    pub fn error(&self) -> Option<String> {
        self.inner.borrow().error.clone()
    }

    /// Adds a query without sending anything yet.
    pub fn enqueue(&self, query: Query) {
        query.set_transaction(self.clone());
        self.inner.borrow_mut().pending.push_back(query);
    }

    /// Sends everything enqueued so far, leaving the transaction open for
    /// more.
    pub fn execute(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.began {
                inner.began = true;
                let begin = match inner.savepoint {
                    Some(ref name) => {
                        Query::new(format!("SAVEPOINT {}", name))
                    },
                    None => Query::new("BEGIN"),
                };
                begin.set_transaction(self.clone());
                inner.pending.push_front(begin);
            }
            if TxState::Inactive == inner.state {
                inner.state = TxState::Executing;
            }
        }
        crate::db::pool::submit_transaction(self.clone());
    }

    /// Commits. The task is resumed once the transaction reaches a
    /// terminal state.
    pub fn commit(&self, task: Option<Task>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.finishing {
                return;
            }
            inner.finishing = true;
            inner.task = task;
            let sql = match inner.savepoint {
                Some(ref name) => format!("RELEASE SAVEPOINT {}", name),
                None => "COMMIT".to_owned(),
            };
            let commit = Query::new(sql);
            commit.set_transaction(self.clone());
            inner.pending.push_back(commit);
        }
        self.execute();
    }

    /// Rolls back, discarding anything not yet sent.
    pub fn rollback(&self, task: Option<Task>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.finishing {
                return;
            }
            inner.finishing = true;
            inner.task = task;
            inner.pending.clear();
            let sql = match inner.savepoint {
                Some(ref name) => {
                    format!("ROLLBACK TO SAVEPOINT {}", name)
                },
                None => "ROLLBACK".to_owned(),
            };
            let rollback = Query::new(sql);
            rollback.set_transaction(self.clone());
            inner.pending.push_back(rollback);
        }
        self.execute();
    }

    /// The root transaction, which is what actually owns the connection.
    pub(super) fn root(&self) -> Transaction {
        let parent = self.inner.borrow().parent.clone();
        match parent {
            Some(p) => p.root(),
            None => self.clone(),
        }
    }

    pub(super) fn is_sub(&self) -> bool {
        self.inner.borrow().savepoint.is_some()
    }

    pub(super) fn savepoint(&self) -> Option<String> {
        self.inner.borrow().savepoint.clone()
    }

    pub(super) fn is_finishing(&self) -> bool {
        self.inner.borrow().finishing
    }

    pub(super) fn take_pending(&self) -> Vec<Query> {
        self.inner.borrow_mut().pending.drain(..).collect()
    }

    pub(super) fn mark_failed(&self, error: String) {
        let task = {
            let mut inner = self.inner.borrow_mut();
            if matches!(
                inner.state,
                TxState::Completed | TxState::Failed
            ) {
                return;
            }
            inner.state = TxState::Failed;
            if inner.error.is_none() {
                inner.error = Some(error);
            }
            inner.pending.clear();
            inner.task.take()
        };
        if let Some(task) = task {
            task.resume();
        }
    }

    pub(super) fn mark_completed(&self) {
        let task = {
            let mut inner = self.inner.borrow_mut();
            if matches!(
                inner.state,
                TxState::Completed | TxState::Failed
            ) {
                return;
            }
            inner.state = TxState::Completed;
            inner.task.take()
        };
        if let Some(task) = task {
            task.resume();
        }
    }

    pub(super) fn set_blocked(&self) {
        let mut inner = self.inner.borrow_mut();
        if TxState::Executing == inner.state {
            inner.state = TxState::Blocked;
        }
    }

    pub(super) fn set_executing(&self) {
        let mut inner = self.inner.borrow_mut();
        if TxState::Blocked == inner.state {
            inner.state = TxState::Executing;
        }
    }

    pub(super) fn ptr_eq(&self, other: &Transaction) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sub_transactions_get_distinct_savepoints() {
        let tx = Transaction::new();
        let a = tx.sub_transaction();
        let b = tx.sub_transaction();
        assert_ne!(a.savepoint(), b.savepoint());
        assert!(a.is_sub());
        assert!(!tx.is_sub());
        assert!(a.root().ptr_eq(&tx));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let tx = Transaction::new();
        tx.mark_failed("boom".to_owned());
        tx.mark_completed();
        assert!(tx.failed());
        assert_eq!(Some("boom".to_owned()), tx.error());
    }
}
