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

//! The per-command state machines, as `ImapConnection` methods grouped
//! by subject area. Each `start_*` either finishes the command
//! immediately or parks kind-specific state in the command record and
//! issues the first database round trip; the matching `advance_*` is
//! re-entered by the command's task whenever an awaited query
//! completes.

mod auth;
mod mailbox;
mod message;
mod search;
