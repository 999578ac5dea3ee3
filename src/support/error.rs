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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad configuration: {0}")]
    BadConfig(String),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Line too long")]
    LineTooLong,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("No database connection available")]
    DbUnavailable,
    #[error("Unsupported authentication: {0}")]
    UnsupportedAuth(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    #[error("Unbound placeholder ${0}")]
    UnboundPlaceholder(u16),
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox is not selectable")]
    MailboxUnselectable,
    #[error("Operation not allowed for INBOX")]
    BadOperationOnInbox,
    #[error("Internal invariant violated: {0}")]
    Disaster(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
