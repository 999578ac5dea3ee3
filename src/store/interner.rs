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

//! Process-wide interning tables for flags and annotation names.
//!
//! Both tables map short case-insensitive identifiers to small integer
//! ids assigned by the database. They are loaded at startup and refreshed
//! when a `NOTIFY` signal reports that some other process created a new
//! id. Readers run to completion between yield points, so the single
//! writer (the notification handler) never observes a torn read.

use std::cell::RefCell;
use std::collections::HashMap;

use log::debug;

use crate::db::query::Query;
use crate::server::task::Task;

#[derive(Default)]
pub struct Interner {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl Interner {
    /// Looks up the id for `name`, case-insensitively.
    pub fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn add(&mut self, id: u32, name: &str) {
        self.by_name.insert(name.to_ascii_lowercase(), id);
        self.by_id.insert(id, name.to_owned());
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
    }
}

thread_local! {
    static FLAGS: RefCell<Interner> = RefCell::new(Interner::default());
    static ANNOTATION_NAMES: RefCell<Interner> =
        RefCell::new(Interner::default());
}

pub mod flags {
    use super::*;

    pub fn id(name: &str) -> Option<u32> {
        FLAGS.with(|t| t.borrow().id(name))
    }

    pub fn name(id: u32) -> Option<String> {
        FLAGS.with(|t| t.borrow().name(id).map(str::to_owned))
    }

    pub fn add(id: u32, name: &str) {
        FLAGS.with(|t| t.borrow_mut().add(id, name));
    }

    pub fn count() -> usize {
        FLAGS.with(|t| t.borrow().len())
    }
}

pub mod annotation_names {
    use super::*;

    pub fn id(name: &str) -> Option<u32> {
        ANNOTATION_NAMES.with(|t| t.borrow().id(name))
    }

    pub fn name(id: u32) -> Option<String> {
        ANNOTATION_NAMES.with(|t| t.borrow().name(id).map(str::to_owned))
    }

    pub fn add(id: u32, name: &str) {
        ANNOTATION_NAMES.with(|t| t.borrow_mut().add(id, name));
    }
}

/// Issues the reload queries and installs the notification handlers. The
/// tables repopulate as results stream in.
pub fn setup(log_prefix: crate::support::log_prefix::LogPrefix) {
    // Ask the server to tell us when some other process adds an id.
    Query::new("listen flag_names").execute(None);
    Query::new("listen annotation_names").execute(None);

    reload_flags(log_prefix.clone());
    reload_annotation_names(log_prefix.clone());

    let prefix = log_prefix.clone();
    crate::db::pool::on_notification("flag_names", move |_| {
        debug!("{} flag_names changed; reloading", prefix);
        reload_flags(prefix.clone());
    });
    let prefix = log_prefix;
    crate::db::pool::on_notification("annotation_names", move |_| {
        debug!("{} annotation_names changed; reloading", prefix);
        reload_annotation_names(prefix.clone());
    });
}

fn reload_flags(log_prefix: crate::support::log_prefix::LogPrefix) {
    let query = Query::new("select id, name from flag_names");
    let q = query.clone();
    let task = Task::new(log_prefix, move || {
        while let Some(row) = q.next_row() {
            if let (Some(id), Some(name)) =
                (row.uint("id"), row.text("name"))
            {
                flags::add(id, &name);
            }
        }
    });
    query.execute(Some(task));
}

fn reload_annotation_names(
    log_prefix: crate::support::log_prefix::LogPrefix,
) {
    let query = Query::new("select id, name from annotation_names");
    let q = query.clone();
    let task = Task::new(log_prefix, move || {
        while let Some(row) = q.next_row() {
            if let (Some(id), Some(name)) =
                (row.uint("id"), row.text("name"))
            {
                annotation_names::add(id, &name);
            }
        }
    });
    query.execute(Some(task));
}

/// Empties both tables. Exposed for the cache registry.
pub fn invalidate() {
    FLAGS.with(|t| t.borrow_mut().clear());
    ANNOTATION_NAMES.with(|t| t.borrow_mut().clear());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut table = Interner::default();
        table.add(5, "\\Seen");
        assert_eq!(Some(5), table.id("\\seen"));
        assert_eq!(Some(5), table.id("\\SEEN"));
        assert_eq!(Some("\\Seen"), table.name(5));
        assert_eq!(None, table.id("\\Answered"));
    }

    #[test]
    fn add_replaces_existing() {
        let mut table = Interner::default();
        table.add(1, "foo");
        table.add(1, "foo");
        assert_eq!(1, table.len());
    }
}
