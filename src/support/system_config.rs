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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Oryx.
///
/// This is stored in a TOML file whose path is given with `-c` on the
/// command line, conventionally `/etc/oryx/oryx.toml`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// The host name the servers present to clients.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Which addresses the protocol servers listen on.
    #[serde(default)]
    pub listen: ListenConfig,

    /// How to reach PostgreSQL.
    pub database: DatabaseConfig,

    /// Server process management.
    #[serde(default)]
    pub server: ServerConfig,

    /// Address of the TLS shim which performs STARTTLS handshakes on our
    /// behalf. STARTTLS is not advertised when this is unset.
    #[serde(default)]
    pub tls_helper: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_imap")]
    pub imap: String,
    #[serde(default = "default_pop3")]
    pub pop3: String,
    #[serde(default = "default_lmtp")]
    pub lmtp: String,
    #[serde(default = "default_managesieve")]
    pub managesieve: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            imap: default_imap(),
            pop3: default_pop3(),
            lmtp: default_lmtp(),
            managesieve: default_managesieve(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// `host:port` of the PostgreSQL server, or the path of its UNIX
    /// socket directory.
    pub address: String,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Connections are never reaped below this count.
    #[serde(default = "default_min_handles")]
    pub min_handles: u32,
    /// No more than this many connections are ever opened.
    #[serde(default = "default_max_handles")]
    pub max_handles: u32,
    /// Seconds an idle handle above the minimum lives before it is shut
    /// down.
    #[serde(default = "default_handle_idle")]
    pub handle_idle_secs: u32,
    /// Text-search configuration of the GIN index over bodyparts, if one
    /// exists. Body search falls back to plain `ilike` when unset.
    #[serde(default)]
    pub tsearch_config: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Number of worker processes to fork at startup.
    #[serde(default = "default_processes")]
    pub processes: u32,
    /// Where the PID file is written.
    #[serde(default = "default_piddir")]
    pub piddir: PathBuf,
    /// Seconds existing sessions are given to finish during shutdown.
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            processes: default_processes(),
            piddir: default_piddir(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

fn default_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.to_str().map(str::to_owned))
        .unwrap_or_else(|| "localhost".to_owned())
}

fn default_imap() -> String {
    "0.0.0.0:143".to_owned()
}

fn default_pop3() -> String {
    "0.0.0.0:110".to_owned()
}

fn default_lmtp() -> String {
    "127.0.0.1:2026".to_owned()
}

fn default_managesieve() -> String {
    "0.0.0.0:4190".to_owned()
}

fn default_min_handles() -> u32 {
    2
}

fn default_max_handles() -> u32 {
    8
}

fn default_handle_idle() -> u32 {
    300
}

fn default_processes() -> u32 {
    1
}

fn default_piddir() -> PathBuf {
    "/var/run".into()
}

fn default_grace() -> u32 {
    10
}
