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

//! Resumable tasks, the universal continuation mechanism.
//!
//! Every long-running operation (a query, a TLS handshake, a mailbox
//! refresh) takes a `Task` handle. When the operation completes, it calls
//! `resume()`, which enqueues the task; the reactor drains the queue in
//! FIFO order between I/O dispatches. A task registered with several
//! operations is resumed once by each of them.
//!
//! If the connection owning a task goes away, the task is cancelled and
//! later resumes are no-ops. There is no preemptive cancellation: in-flight
//! queries run to completion and their results are simply discarded.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::error;

use crate::support::log_prefix::LogPrefix;

#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

struct TaskInner {
    log_prefix: LogPrefix,
    cancelled: Cell<bool>,
    // RefCell so that the closure can itself own `Task` clones.
    body: RefCell<Box<dyn FnMut()>>,
}

thread_local! {
    static RUNNABLE: RefCell<VecDeque<Task>> =
        RefCell::new(VecDeque::new());
}

impl Task {
    pub fn new(
        log_prefix: LogPrefix,
        body: impl FnMut() + 'static,
    ) -> Self {
        Task {
            inner: Rc::new(TaskInner {
                log_prefix,
                cancelled: Cell::new(false),
                body: RefCell::new(Box::new(body)),
            }),
        }
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.inner.log_prefix
    }

    /// Marks the task cancelled. Subsequent resumes are no-ops.
    ///
    /// The body is dropped so that anything it captured (typically the
    /// owning connection) is released even while operations still hold
    /// the task handle.
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
        if let Ok(mut body) = self.inner.body.try_borrow_mut() {
            *body = Box::new(|| ());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Schedules the task to run at the reactor's next convenience.
    pub fn resume(&self) {
        if self.is_cancelled() {
            return;
        }

        RUNNABLE.with(|q| q.borrow_mut().push_back(self.clone()));
    }
}

/// Runs every task resumed so far, in resumption order.
///
/// Called by the reactor after each round of I/O dispatch. Tasks resumed
/// while the queue drains run in the same pass.
pub fn run_pending() {
    while let Some(task) =
        RUNNABLE.with(|q| q.borrow_mut().pop_front())
    {
        if task.is_cancelled() {
            continue;
        }

        match task.inner.body.try_borrow_mut() {
            Ok(mut body) => body(),
            Err(_) => error!(
                "{} task resumed re-entrantly; dropping resume",
                task.log_prefix(),
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prefix() -> LogPrefix {
        LogPrefix::new("test", "-".to_owned())
    }

    #[test]
    fn resume_runs_fifo() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        let a = Task::new(prefix(), move || o.borrow_mut().push('a'));
        let o = Rc::clone(&order);
        let b = Task::new(prefix(), move || o.borrow_mut().push('b'));

        b.resume();
        a.resume();
        b.resume();
        run_pending();

        assert_eq!(&['b', 'a', 'b'], &order.borrow()[..]);
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        let task = Task::new(prefix(), move || r.set(true));

        task.resume();
        task.cancel();
        run_pending();

        assert!(!ran.get());
    }

    #[test]
    fn resume_during_drain_runs_in_same_pass() {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let cell = Rc::new(RefCell::new(None::<Task>));
        let cell2 = Rc::clone(&cell);
        let task = Task::new(prefix(), move || {
            let n = c.get() + 1;
            c.set(n);
            if n < 3 {
                cell2.borrow().as_ref().unwrap().resume();
            }
        });
        *cell.borrow_mut() = Some(task.clone());

        task.resume();
        run_pending();
        assert_eq!(3, count.get());
        *cell.borrow_mut() = None;
    }
}
