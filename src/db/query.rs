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

//! SQL queries with typed binds and streamed results.
//!
//! A `Query` is a cheap handle; clones refer to the same underlying
//! query. The owner binds values, calls `execute`, and is resumed via its
//! task when rows arrive or the query completes. Placeholders are `$1`
//! through `$N`; every placeholder referenced in the SQL must be bound
//! exactly once before execution.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::db::wire::Column;
use crate::server::task::Task;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Inactive,
    Submitted,
    Executing,
    Completed,
    Failed,
}

/// A typed value bound to a placeholder, encoded in the text result
/// format.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    BigInt(i64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Bound as an integer array literal, for use with `= ANY($n)`.
    IntSet(Vec<u32>),
    Null,
}

impl Value {
    pub fn encode(&self) -> Option<Vec<u8>> {
        match *self {
            Value::Int(v) => Some(v.to_string().into_bytes()),
            Value::BigInt(v) => Some(v.to_string().into_bytes()),
            Value::Text(ref v) => Some(v.clone().into_bytes()),
            Value::Bool(v) => {
                Some((if v { "t" } else { "f" }).as_bytes().to_vec())
            },
            Value::Bytes(ref v) => {
                let mut hex = String::with_capacity(2 + v.len() * 2);
                hex.push_str("\\x");
                for byte in v {
                    let _ = write!(hex, "{:02x}", byte);
                }
                Some(hex.into_bytes())
            },
            Value::IntSet(ref v) => {
                let mut lit = String::from("{");
                for (ix, n) in v.iter().enumerate() {
                    if 0 != ix {
                        lit.push(',');
                    }
                    let _ = write!(lit, "{}", n);
                }
                lit.push('}');
                Some(lit.into_bytes())
            },
            Value::Null => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::BigInt(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::BigInt(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// One result row, decoded from the text format on access.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Rc<Vec<Column>>,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(
        columns: Rc<Vec<Column>>,
        values: Vec<Option<Vec<u8>>>,
    ) -> Self {
        Row { columns, values }
    }

    fn raw(&self, name: &str) -> Option<&[u8]> {
        let ix = self
            .columns
            .iter()
            .position(|c| c.name == name)?;
        self.values.get(ix)?.as_deref()
    }

    pub fn is_null(&self, name: &str) -> bool {
        self.raw(name).is_none()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.raw(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn bigint(&self, name: &str) -> Option<i64> {
        std::str::from_utf8(self.raw(name)?).ok()?.parse().ok()
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        std::str::from_utf8(self.raw(name)?).ok()?.parse().ok()
    }

    pub fn uint(&self, name: &str) -> Option<u32> {
        std::str::from_utf8(self.raw(name)?).ok()?.parse().ok()
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.raw(name)? {
            b"t" => Some(true),
            b"f" => Some(false),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        let raw = self.raw(name)?;
        if raw.starts_with(b"\\x") {
            let hex = &raw[2..];
            let mut out = Vec::with_capacity(hex.len() / 2);
            for pair in hex.chunks(2) {
                let s = std::str::from_utf8(pair).ok()?;
                out.push(u8::from_str_radix(s, 16).ok()?);
            }
            Some(out)
        } else {
            Some(raw.to_vec())
        }
    }
}

pub struct QueryInner {
    sql: String,
    /// Prepared statement name; empty means re-parse every time.
    statement: String,
    binds: BTreeMap<u16, Value>,
    state: QueryState,
    rows: VecDeque<Row>,
    pub(super) columns: Option<Rc<Vec<Column>>>,
    error: Option<String>,
    task: Option<Task>,
    can_fail: bool,
    /// Lines to stream if the server answers with copy-in.
    copy_lines: Option<Vec<Vec<u8>>>,
    pub(super) tx: Option<crate::db::transaction::Transaction>,
}

#[derive(Clone)]
pub struct Query {
    inner: Rc<RefCell<QueryInner>>,
}

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$([0-9]+)").unwrap();
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Query {
            inner: Rc::new(RefCell::new(QueryInner {
                sql: sql.into(),
                statement: String::new(),
                binds: BTreeMap::new(),
                state: QueryState::Inactive,
                rows: VecDeque::new(),
                columns: None,
                error: None,
                task: None,
                can_fail: false,
                copy_lines: None,
                tx: None,
            })),
        }
    }

    /// Like `new`, but the statement is parsed once per connection under
    /// `name` and re-executed from the cache thereafter.
    pub fn prepared(
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        let q = Query::new(sql);
        q.inner.borrow_mut().statement = name.into();
        q
    }

    pub fn bind(&self, placeholder: u16, value: impl Into<Value>) -> &Self {
        self.inner
            .borrow_mut()
            .binds
            .insert(placeholder, value.into());
        self
    }

    pub fn bind_null(&self, placeholder: u16) -> &Self {
        self.bind(placeholder, Value::Null)
    }

    /// Marks the query recoverable: its failure does not poison the
    /// enclosing transaction.
    pub fn set_can_fail(&self) -> &Self {
        self.inner.borrow_mut().can_fail = true;
        self
    }

    pub fn can_fail(&self) -> bool {
        self.inner.borrow().can_fail
    }

    /// Provides the payload to stream if the server requests copy-in.
    pub fn set_copy_lines(&self, lines: Vec<Vec<u8>>) -> &Self {
        self.inner.borrow_mut().copy_lines = Some(lines);
        self
    }

    /// Attaches a task without submitting; used when the query travels
    /// inside a transaction rather than through `execute`.
    pub fn attach_task(&self, task: Task) {
        self.inner.borrow_mut().task = Some(task);
    }

    /// Submits the query to the connection pool. The task, if any, is
    /// resumed when rows arrive and when the query finishes.
    pub fn execute(&self, task: Option<Task>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.task = task;
            inner.state = QueryState::Submitted;
        }
        crate::db::pool::submit(self.clone());
    }

    pub fn state(&self) -> QueryState {
        self.inner.borrow().state
    }

    pub fn done(&self) -> bool {
        matches!(
            self.state(),
            QueryState::Completed | QueryState::Failed
        )
    }

    pub fn failed(&self) -> bool {
        QueryState::Failed == self.state()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.borrow().error.clone()
    }

    pub fn sql(&self) -> String {
        self.inner.borrow().sql.clone()
    }

    pub fn statement(&self) -> String {
        self.inner.borrow().statement.clone()
    }

    pub fn has_results(&self) -> bool {
        !self.inner.borrow().rows.is_empty()
    }

    pub fn next_row(&self) -> Option<Row> {
        self.inner.borrow_mut().rows.pop_front()
    }

    /// Encodes the bound values in placeholder order.
    ///
    /// Fails unless the `$n` placeholders referenced by the SQL are
    /// exactly `1..=N` and each is bound.
    pub fn assemble(&self) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let inner = self.inner.borrow();
        let mut referenced = BTreeSet::new();
        for cap in PLACEHOLDER.captures_iter(&inner.sql) {
            if let Ok(n) = cap[1].parse::<u16>() {
                referenced.insert(n);
            }
        }

        if referenced
            .iter()
            .rev()
            .next()
            .map_or(false, |&max| max as usize != referenced.len())
        {
            return Err(Error::Disaster(format!(
                "placeholders are not numbered 1..N in: {}",
                inner.sql,
            )));
        }

        for n in &referenced {
            if !inner.binds.contains_key(n) {
                return Err(Error::UnboundPlaceholder(*n));
            }
        }
        for n in inner.binds.keys() {
            if !referenced.contains(n) {
                return Err(Error::Disaster(format!(
                    "bind for ${} has no placeholder in: {}",
                    n, inner.sql,
                )));
            }
        }

        Ok(inner
            .binds
            .values()
            .map(Value::encode)
            .collect())
    }

    pub(super) fn take_copy_lines(&self) -> Option<Vec<Vec<u8>>> {
        self.inner.borrow_mut().copy_lines.take()
    }

    pub(super) fn transaction(
        &self,
    ) -> Option<crate::db::transaction::Transaction> {
        self.inner.borrow().tx.clone()
    }

    pub(super) fn set_transaction(
        &self,
        tx: crate::db::transaction::Transaction,
    ) {
        self.inner.borrow_mut().tx = Some(tx);
    }

    pub(super) fn set_state(&self, state: QueryState) {
        self.inner.borrow_mut().state = state;
    }

    pub(super) fn set_columns(&self, columns: Rc<Vec<Column>>) {
        self.inner.borrow_mut().columns = Some(columns);
    }

    pub(super) fn columns(&self) -> Option<Rc<Vec<Column>>> {
        self.inner.borrow().columns.clone()
    }

    pub(super) fn deliver_row(&self, values: Vec<Option<Vec<u8>>>) {
        let mut inner = self.inner.borrow_mut();
        let columns = match inner.columns {
            Some(ref c) => Rc::clone(c),
            // Row with no preceding description; drop it.
            None => return,
        };
        inner.rows.push_back(Row::new(columns, values));
        if let Some(ref task) = inner.task {
            task.resume();
        }
    }

    pub(super) fn complete(&self) {
        let task = {
            let mut inner = self.inner.borrow_mut();
            inner.state = QueryState::Completed;
            inner.task.take()
        };
        if let Some(task) = task {
            task.resume();
        }
    }

    pub fn fail(&self, message: String) {
        let task = {
            let mut inner = self.inner.borrow_mut();
            inner.state = QueryState::Failed;
            inner.error = Some(message);
            inner.task.take()
        };
        if let Some(task) = task {
            task.resume();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_text_encodings() {
        assert_eq!(Some(b"42".to_vec()), Value::Int(42).encode());
        assert_eq!(Some(b"-1".to_vec()), Value::BigInt(-1).encode());
        assert_eq!(Some(b"t".to_vec()), Value::Bool(true).encode());
        assert_eq!(Some(b"f".to_vec()), Value::Bool(false).encode());
        assert_eq!(
            Some(b"\\x00ff".to_vec()),
            Value::Bytes(vec![0, 255]).encode()
        );
        assert_eq!(
            Some(b"{2,4,6}".to_vec()),
            Value::IntSet(vec![2, 4, 6]).encode()
        );
        assert_eq!(None, Value::Null.encode());
    }

    #[test]
    fn assemble_orders_by_placeholder() {
        let q = Query::new("select * from t where a=$2 and b=$1");
        q.bind(2, "two").bind(1, "one");
        let params = q.assemble().unwrap();
        assert_eq!(Some(b"one".to_vec()), params[0]);
        assert_eq!(Some(b"two".to_vec()), params[1]);
    }

    #[test]
    fn assemble_rejects_unbound_placeholder() {
        let q = Query::new("select * from t where a=$1 and b=$2");
        q.bind(1, 1);
        assert_matches!(
            Err(Error::UnboundPlaceholder(2)),
            q.assemble()
        );
    }

    #[test]
    fn assemble_rejects_spurious_bind() {
        let q = Query::new("select * from t where a=$1");
        q.bind(1, 1).bind(2, 2);
        assert_matches!(Err(Error::Disaster(_)), q.assemble());
    }

    #[test]
    fn row_accessors() {
        let columns = Rc::new(vec![
            Column {
                name: "id".to_owned(),
                type_oid: 23,
            },
            Column {
                name: "name".to_owned(),
                type_oid: 25,
            },
            Column {
                name: "deleted".to_owned(),
                type_oid: 16,
            },
        ]);
        let row = Row::new(
            columns,
            vec![
                Some(b"17".to_vec()),
                None,
                Some(b"t".to_vec()),
            ],
        );
        assert_eq!(Some(17), row.int("id"));
        assert_eq!(Some(17), row.uint("id"));
        assert_eq!(None, row.text("name"));
        assert!(row.is_null("name"));
        assert_eq!(Some(true), row.boolean("deleted"));
        assert_eq!(None, row.int("nonexistent"));
    }

    #[test]
    fn bytea_hex_decoding() {
        let columns = Rc::new(vec![Column {
            name: "blob".to_owned(),
            type_oid: 17,
        }]);
        let row =
            Row::new(columns, vec![Some(b"\\x48692e".to_vec())]);
        assert_eq!(Some(b"Hi.".to_vec()), row.bytes("blob"));
    }
}
