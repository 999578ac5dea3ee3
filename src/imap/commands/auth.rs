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

//! LOGIN and the AUTHENTICATE credential check.
//!
//! Both funnel into one user lookup: fetch the user row, verify the
//! collected proof against the stored secret, and on success move the
//! connection to Authenticated.

use log::{info, warn};

use crate::db::query::Query;
use crate::imap::command::{Done, RunState};
use crate::imap::sasl::{self, Proof};
use crate::imap::server::{ImapConnection, ProtoState, User};

impl ImapConnection {
    pub(crate) fn start_login(
        &mut self,
        ix: usize,
        user: String,
        password: String,
    ) {
        let tag = self.records[ix].tag.clone();
        self.start_user_lookup(
            &tag,
            user,
            Proof::Plain { password },
        );
    }

    /// Shared by LOGIN and AUTHENTICATE: fetch the user row and check
    /// the proof when it arrives.
    pub(crate) fn start_user_lookup(
        &mut self,
        tag: &str,
        login: String,
        proof: Proof,
    ) {
        let ix = match self
            .records
            .iter()
            .position(|r| r.tag == tag)
        {
            Some(ix) => ix,
            None => return,
        };

        let query = Query::prepared(
            "user_by_login",
            "select id, login, secret, home from users \
             where lower(login)=lower($1)",
        );
        query.bind(1, login.as_str());
        let task = self.make_task(tag);
        query.execute(Some(task));

        self.records[ix].run = RunState::UserLookup {
            query,
            login,
            proof,
        };
        self.records[ix].state =
            crate::imap::command::CmdState::Blocked;
    }

    pub(crate) fn advance_login(&mut self, ix: usize) {
        let (query, login, proof) = match self.records[ix].run {
            RunState::UserLookup {
                ref query,
                ref login,
                ref proof,
            } => (query.clone(), login.clone(), proof.clone()),
            _ => return,
        };

        if !query.done() {
            return;
        }

        if query.failed() {
            warn!(
                "{} user lookup failed: {}",
                self.conn.borrow().log_prefix(),
                query.error().unwrap_or_default(),
            );
            self.sasl_finish(false);
            self.records[ix].finish(
                Done::no("Temporary authentication failure")
                    .with_code("UNAVAILABLE"),
            );
            return;
        }

        let row = query.next_row();
        let accepted = match row {
            Some(ref row) => {
                let secret =
                    row.text("secret").unwrap_or_default();
                sasl::verify(&proof, &secret)
            },
            // Run the verifier against an empty secret anyway so that
            // nonexistent and wrong-password logins cost the same.
            None => {
                let _ = sasl::verify(&proof, "");
                false
            },
        };

        if !accepted {
            info!(
                "{} authentication failed for {:?}",
                self.conn.borrow().log_prefix(),
                login,
            );
            self.sasl_finish(false);
            self.records[ix].finish(
                Done::no("Login failed")
                    .with_code("AUTHENTICATIONFAILED"),
            );
            return;
        }

        let row = row.expect("accepted login without a row");
        let user = User {
            id: row.uint("id").unwrap_or(0),
            login: row.text("login").unwrap_or(login),
            home: row
                .text("home")
                .unwrap_or_else(|| "/".to_owned()),
        };

        self.conn
            .borrow()
            .log_prefix()
            .set_user(user.login.clone());
        info!(
            "{} authenticated",
            self.conn.borrow().log_prefix(),
        );

        self.user = Some(user);
        self.state = ProtoState::Authenticated;
        self.sasl_finish(true);

        let caps = self.capability_string();
        let record = &mut self.records[ix];
        record.finish(
            Done::ok("Logged in").with_code(format!(
                "CAPABILITY {}",
                caps,
            )),
        );
    }
}
