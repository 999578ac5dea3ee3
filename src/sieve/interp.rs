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

//! Sieve evaluation.
//!
//! Evaluation is pure: it reads the envelope and the message and
//! produces an ordered list of actions, performing no I/O of its own.
//! If the script finishes without an explicit disposition, the implicit
//! keep files the message into the user's inbox.

use super::ast::*;

/// A delivery decision produced by running a script.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Reject(String),
    FileInto(String),
    Redirect(String),
    Discard,
    Vacation { address: String, message: String },
    Error(String),
}

/// The SMTP envelope as Sieve sees it.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: String,
    pub to: String,
}

/// The pieces of a message the interpreter consumes. Full MIME decoding
/// happens upstream; here a message is its (unfolded) headers and the
/// body text.
#[derive(Clone, Debug, Default)]
pub struct SieveMessage {
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub size: u64,
}

impl SieveMessage {
    /// Splits a raw RFC 822 message into unfolded headers and a body.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body = String::new();
        let mut in_body = false;

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if in_body {
                body.push_str(line);
                body.push('\n');
            } else if line.is_empty() {
                in_body = true;
            } else if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of the previous header
                if let Some(&mut (_, ref mut value)) =
                    headers.last_mut()
                {
                    value.push(' ');
                    value.push_str(line.trim_start());
                }
            } else if let Some(colon) = line.find(':') {
                headers.push((
                    line[..colon].trim().to_owned(),
                    line[colon + 1..].trim().to_owned(),
                ));
            }
        }

        SieveMessage {
            headers,
            body,
            size: raw.len() as u64,
        }
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

struct Interp<'a> {
    envelope: &'a Envelope,
    message: &'a SieveMessage,
    /// The user's mailbox prefix; relative fileinto targets and the
    /// implicit keep resolve under it.
    home: &'a str,
    actions: Vec<Action>,
    implicit_keep: bool,
    stopped: bool,
}

/// Runs `script` against one (envelope, message) pair.
///
/// `home` is the recipient's mailbox prefix, e.g. `/users/u/`; the
/// implicit keep resolves to `<home>INBOX`.
pub fn evaluate(
    script: &Script,
    envelope: &Envelope,
    home: &str,
    message: &SieveMessage,
) -> Vec<Action> {
    let mut interp = Interp {
        envelope,
        message,
        home,
        actions: Vec::new(),
        implicit_keep: true,
        stopped: false,
    };
    interp.run(&script.commands);

    if interp.implicit_keep {
        interp
            .actions
            .push(Action::FileInto(format!("{}INBOX", home)));
    }
    interp.actions
}

impl<'a> Interp<'a> {
    fn run(&mut self, commands: &[Command]) {
        for command in commands {
            if self.stopped {
                return;
            }
            match *command {
                Command::Require(_) => (),
                Command::Stop => self.stopped = true,
                Command::Keep => {
                    self.implicit_keep = false;
                    self.actions.push(Action::FileInto(format!(
                        "{}INBOX",
                        self.home,
                    )));
                },
                Command::Discard => {
                    self.implicit_keep = false;
                    self.actions.push(Action::Discard);
                },
                Command::FileInto(ref mailbox) => {
                    self.implicit_keep = false;
                    self.actions.push(Action::FileInto(
                        self.resolve_mailbox(mailbox),
                    ));
                },
                Command::Redirect(ref address) => {
                    self.implicit_keep = false;
                    self.actions
                        .push(Action::Redirect(address.clone()));
                },
                Command::Reject(ref message) => {
                    self.implicit_keep = false;
                    self.actions.push(Action::Reject(message.clone()));
                },
                Command::If {
                    ref arms,
                    ref otherwise,
                } => {
                    let mut taken = false;
                    for (test, body) in arms {
                        if self.test(test) {
                            self.run(body);
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        if let Some(body) = otherwise {
                            self.run(body);
                        }
                    }
                },
            }
        }
    }

    fn resolve_mailbox(&self, mailbox: &str) -> String {
        if mailbox.starts_with('/') {
            mailbox.to_owned()
        } else {
            format!("{}{}", self.home, mailbox)
        }
    }

    fn test(&self, test: &Test) -> bool {
        match *test {
            Test::True => true,
            Test::False => false,
            Test::Not(ref inner) => !self.test(inner),
            Test::AllOf(ref tests) => {
                tests.iter().all(|t| self.test(t))
            },
            Test::AnyOf(ref tests) => {
                tests.iter().any(|t| self.test(t))
            },
            Test::Exists(ref headers) => headers.iter().all(|h| {
                !self.message.header_values(h).is_empty()
            }),
            Test::Size { over, limit } => {
                if over {
                    self.message.size > limit
                } else {
                    self.message.size < limit
                }
            },
            Test::Header {
                comparator,
                match_type,
                ref headers,
                ref keys,
            } => headers.iter().any(|header| {
                self.message.header_values(header).iter().any(
                    |value| {
                        keys.iter().any(|key| {
                            matches(comparator, match_type, value, key)
                        })
                    },
                )
            }),
            Test::Address {
                part,
                comparator,
                match_type,
                ref headers,
                ref keys,
            } => headers.iter().any(|header| {
                self.message.header_values(header).iter().any(
                    |value| {
                        let addr = address_part(value, part);
                        keys.iter().any(|key| {
                            matches(comparator, match_type, &addr, key)
                        })
                    },
                )
            }),
            Test::Envelope {
                part,
                comparator,
                match_type,
                ref parts,
                ref keys,
            } => parts.iter().any(|envelope_part| {
                let raw = match envelope_part
                    .to_ascii_lowercase()
                    .as_str()
                {
                    "from" => &self.envelope.from,
                    "to" => &self.envelope.to,
                    _ => return false,
                };
                let addr = address_part(raw, part);
                keys.iter().any(|key| {
                    matches(comparator, match_type, &addr, key)
                })
            }),
            Test::Body {
                comparator,
                match_type,
                ref keys,
            } => keys.iter().any(|key| {
                matches(
                    comparator,
                    match_type,
                    &self.message.body,
                    key,
                )
            }),
        }
    }
}

/// Extracts the requested part of an address found in a header value.
fn address_part(value: &str, part: AddressPart) -> String {
    // "Name <local@domain>" or a bare address.
    let address = match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            &value[open + 1..close]
        },
        _ => value.trim(),
    };

    let (localpart, domain) = match address.rfind('@') {
        Some(at) => (&address[..at], &address[at + 1..]),
        None => (address, ""),
    };

    match part {
        AddressPart::All => address.to_owned(),
        AddressPart::Localpart => localpart.to_owned(),
        AddressPart::Domain => domain.to_owned(),
        AddressPart::User => localpart
            .split('+')
            .next()
            .unwrap_or(localpart)
            .to_owned(),
        AddressPart::Detail => localpart
            .splitn(2, '+')
            .nth(1)
            .unwrap_or("")
            .to_owned(),
    }
}

fn matches(
    comparator: Comparator,
    match_type: MatchType,
    value: &str,
    key: &str,
) -> bool {
    let (value, key) = match comparator {
        Comparator::Octet => (value.to_owned(), key.to_owned()),
        Comparator::AsciiCasemap => (
            value.to_ascii_lowercase(),
            key.to_ascii_lowercase(),
        ),
    };

    match match_type {
        MatchType::Is => value == key,
        MatchType::Contains => value.contains(&key),
        MatchType::Matches => glob_match(key.as_bytes(), value.as_bytes()),
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &[u8], value: &[u8]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((b'*', rest)) => (0..=value.len())
            .any(|skip| glob_match(rest, &value[skip..])),
        Some((b'?', rest)) => match value.split_first() {
            Some((_, value_rest)) => glob_match(rest, value_rest),
            None => false,
        },
        Some((&c, rest)) => match value.split_first() {
            Some((&v, value_rest)) if v == c => {
                glob_match(rest, value_rest)
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod test {
    use super::super::parser::parse;
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            from: "x@y".to_owned(),
            to: "u@host".to_owned(),
        }
    }

    fn spam_message() -> SieveMessage {
        SieveMessage::parse(
            b"From: x@y\r\nSubject: this is spam\r\n\r\nbuy now\r\n",
        )
    }

    fn ham_message() -> SieveMessage {
        SieveMessage::parse(
            b"From: x@y\r\nSubject: hi\r\n\r\nhello there\r\n",
        )
    }

    const FILTER: &str = "require [\"fileinto\"]; \
         if header :contains \"Subject\" \"spam\" { discard; } \
         else { fileinto \"saved\"; }";

    #[test]
    fn discards_spam() {
        let script = parse(FILTER).unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &spam_message(),
        );
        assert_eq!(vec![Action::Discard], actions);
    }

    #[test]
    fn files_ham_under_home() {
        let script = parse(FILTER).unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &ham_message(),
        );
        assert_eq!(
            vec![Action::FileInto("/users/u/saved".to_owned())],
            actions,
        );
    }

    #[test]
    fn implicit_keep_files_into_inbox() {
        let script = parse("if false { discard; }").unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &ham_message(),
        );
        assert_eq!(
            vec![Action::FileInto("/users/u/INBOX".to_owned())],
            actions,
        );
    }

    #[test]
    fn stop_halts_evaluation() {
        let script =
            parse("keep; stop; discard;").unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &ham_message(),
        );
        assert_eq!(
            vec![Action::FileInto("/users/u/INBOX".to_owned())],
            actions,
        );
    }

    #[test]
    fn envelope_test_reads_envelope_not_headers() {
        let script = parse(
            "require [\"envelope\", \"fileinto\"]; \
             if envelope :domain :is \"to\" \"host\" \
             { fileinto \"byenv\"; }",
        )
        .unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &ham_message(),
        );
        assert_eq!(
            vec![Action::FileInto("/users/u/byenv".to_owned())],
            actions,
        );
    }

    #[test]
    fn subaddress_parts() {
        assert_eq!(
            "help",
            address_part("bob+help@example.com", AddressPart::Detail),
        );
        assert_eq!(
            "bob",
            address_part("bob+help@example.com", AddressPart::User),
        );
        assert_eq!(
            "example.com",
            address_part(
                "Bob <bob+help@example.com>",
                AddressPart::Domain,
            ),
        );
    }

    #[test]
    fn matches_glob() {
        assert!(matches(
            Comparator::AsciiCasemap,
            MatchType::Matches,
            "ORYX-users Digest, Vol 5",
            "*digest*",
        ));
        assert!(matches(
            Comparator::Octet,
            MatchType::Matches,
            "abc",
            "a?c",
        ));
        assert!(!matches(
            Comparator::Octet,
            MatchType::Matches,
            "abc",
            "A?C",
        ));
    }

    #[test]
    fn size_test() {
        let message = ham_message();
        let script = parse(&format!(
            "if size :over {} {{ discard; }}",
            message.size - 1,
        ))
        .unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &message,
        );
        assert_eq!(vec![Action::Discard], actions);
    }

    #[test]
    fn body_test() {
        let script = parse(
            "require \"body\"; \
             if body :contains \"hello\" { discard; }",
        )
        .unwrap();
        let actions = evaluate(
            &script,
            &envelope(),
            "/users/u/",
            &ham_message(),
        );
        assert_eq!(vec![Action::Discard], actions);
    }

    #[test]
    fn header_unfolding() {
        let message = SieveMessage::parse(
            b"Subject: part one\r\n and two\r\n\r\n\r\n",
        );
        assert_eq!(
            vec!["part one and two"],
            message.header_values("subject"),
        );
    }
}
