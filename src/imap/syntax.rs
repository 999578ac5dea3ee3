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

//! The IMAP command grammar.
//!
//! The connection layer assembles a complete command — the initial line
//! plus any literals, spliced in as `{N}CRLF<bytes>` — and hands it
//! here. The parser is a plain cursor with mark/restore for the couple
//! of places that need lookahead. Atoms, quoted strings and literals all
//! come out as byte strings; sequence sets stay textual until the
//! executing command resolves `*` against the session.

use chrono::NaiveDate;

use crate::search::selector::{
    AddressField, DateRel, Selector, SortCriterion, SortKey,
};
use crate::store::idset::IdSet;

#[derive(Clone, Debug, PartialEq)]
pub struct SequenceSet(pub String);

impl SequenceSet {
    /// Resolves `*` against the largest live value.
    pub fn resolve(&self, star: u32) -> Option<IdSet> {
        IdSet::parse_imap(&self.0, star)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Replace,
    Add,
    Remove,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModseq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    Uid,
    InternalDate,
    Rfc822Size,
    Modseq,
    /// The entire raw message (BODY[], BODY.PEEK[] or RFC822).
    Body { peek: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadAlg {
    OrderedSubject,
    References,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Capability,
    Noop,
    Check,
    Logout,
    StartTls,
    Id(Option<Vec<(String, Option<String>)>>),
    Enable(Vec<String>),
    Compress,
    Login {
        user: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial: Option<Vec<u8>>,
    },
    Select {
        mailbox: String,
        condstore: bool,
    },
    Examine {
        mailbox: String,
        condstore: bool,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Namespace,
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<String>,
        date: Option<NaiveDate>,
        message: Vec<u8>,
    },
    Close,
    Unselect,
    Expunge,
    UidExpunge {
        set: SequenceSet,
    },
    Search {
        selector: Selector,
        uid: bool,
        /// MSN/UID sets from the program, resolved by the executor;
        /// see `Parser::search_key`.
        msn_sets: Vec<SequenceSet>,
    },
    Sort {
        criteria: Vec<SortCriterion>,
        selector: Selector,
        uid: bool,
        msn_sets: Vec<SequenceSet>,
    },
    Thread {
        algorithm: ThreadAlg,
        selector: Selector,
        uid: bool,
        msn_sets: Vec<SequenceSet>,
    },
    Fetch {
        set: SequenceSet,
        items: Vec<FetchItem>,
        changed_since: Option<u64>,
        uid: bool,
    },
    Store {
        set: SequenceSet,
        mode: StoreMode,
        silent: bool,
        flags: Vec<String>,
        unchanged_since: Option<u64>,
        uid: bool,
    },
    Copy {
        set: SequenceSet,
        mailbox: String,
        uid: bool,
    },
    Idle,
}

/// A parse failure, turned into a tagged (or untagged) BAD by the
/// server.
#[derive(Clone, Debug, PartialEq)]
pub struct Bad {
    pub message: String,
}

impl Bad {
    fn new(message: impl Into<String>) -> Self {
        Bad {
            message: message.into(),
        }
    }
}

/// Parses one assembled command. On success, (tag, request). On error,
/// the tag if one could be read, plus the complaint.
pub fn parse_command(
    line: &[u8],
) -> Result<(String, Request), (Option<String>, Bad)> {
    let mut p = Parser::new(line);
    let tag = match p.tag() {
        Ok(tag) => tag,
        Err(bad) => return Err((None, bad)),
    };
    if !p.sp() {
        return Err((Some(tag), Bad::new("expected space after tag")));
    }
    match p.request() {
        Ok(request) => {
            if p.at_end() {
                Ok((tag, request))
            } else {
                Err((
                    Some(tag),
                    Bad::new("trailing garbage after command"),
                ))
            }
        },
        Err(bad) => Err((Some(tag), bad)),
    }
}

pub struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Parser { input, pos: 0 }
    }

    pub fn mark(&self) -> usize {
        self.pos
    }

    pub fn restore(&mut self, mark: usize) {
        self.pos = mark;
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    pub fn sp(&mut self) -> bool {
        if Some(b' ') == self.peek() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sp(&mut self) -> Result<(), Bad> {
        if self.sp() {
            Ok(())
        } else {
            Err(Bad::new("expected space"))
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), Bad> {
        if Some(c) == self.peek() {
            self.pos += 1;
            Ok(())
        } else {
            Err(Bad::new(format!("expected {:?}", c as char)))
        }
    }

    pub fn tag(&mut self) -> Result<String, Bad> {
        let start = self.pos;
        while self.peek().map_or(false, |c| {
            !matches!(
                c,
                b' ' | b'(' | b')' | b'{' | b'%' | b'*' | b'"'
                    | b'\\' | b'+' | 0..=31 | 127
            )
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("missing tag"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .into_owned())
    }

    pub fn atom(&mut self) -> Result<String, Bad> {
        let start = self.pos;
        while self.peek().map_or(false, |c| {
            !matches!(
                c,
                b' ' | b'(' | b')' | b'{' | b'%' | b'*' | b'"'
                    | b'\\' | b']' | 0..=31 | 127
            )
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("expected atom"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .into_owned())
    }

    pub fn number(&mut self) -> Result<u64, Bad> {
        let start = self.pos;
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("expected number"));
        }
        String::from_utf8_lossy(&self.input[start..self.pos])
            .parse()
            .map_err(|_| Bad::new("number out of range"))
    }

    fn nz_number(&mut self) -> Result<u32, Bad> {
        let n = self.number()?;
        if 0 == n || n > u64::from(u32::MAX) {
            Err(Bad::new("number out of range"))
        } else {
            Ok(n as u32)
        }
    }

    pub fn quoted(&mut self) -> Result<Vec<u8>, Bad> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(Bad::new("unterminated string")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(c @ b'"') | Some(c @ b'\\') => out.push(c),
                    _ => return Err(Bad::new("bad escape")),
                },
                Some(b'\r') | Some(b'\n') | Some(0) => {
                    return Err(Bad::new("bad quoted character"))
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// `{N}CRLF<N bytes>` with the bytes already spliced in by the
    /// connection layer. `{N+}` is accepted identically.
    pub fn literal(&mut self) -> Result<Vec<u8>, Bad> {
        self.expect(b'{')?;
        let len = self.number()? as usize;
        if Some(b'+') == self.peek() {
            self.pos += 1;
        }
        self.expect(b'}')?;
        self.expect(b'\r')?;
        self.expect(b'\n')?;
        if self.input.len() - self.pos < len {
            return Err(Bad::new("literal truncated"));
        }
        let out = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    /// quoted / literal
    pub fn string(&mut self) -> Result<Vec<u8>, Bad> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            _ => Err(Bad::new("expected string")),
        }
    }

    /// atom / quoted / literal
    pub fn astring(&mut self) -> Result<Vec<u8>, Bad> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            _ => self.atom().map(String::into_bytes),
        }
    }

    fn astring_utf8(&mut self) -> Result<String, Bad> {
        Ok(String::from_utf8_lossy(&self.astring()?).into_owned())
    }

    fn string_utf8(&mut self) -> Result<String, Bad> {
        Ok(String::from_utf8_lossy(&self.string()?).into_owned())
    }

    fn mailbox(&mut self) -> Result<String, Bad> {
        let name = self.astring_utf8()?;
        if name.eq_ignore_ascii_case("INBOX") {
            Ok("INBOX".to_owned())
        } else {
            Ok(name)
        }
    }

    /// `1,2:4,*` and friends. Validated for shape only; `*` resolution
    /// happens at execution.
    fn sequence_set(&mut self) -> Result<SequenceSet, Bad> {
        let start = self.pos;
        while self.peek().map_or(false, |c| {
            c.is_ascii_digit() || b':' == c || b',' == c || b'*' == c
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("expected sequence set"));
        }
        let text = String::from_utf8_lossy(
            &self.input[start..self.pos],
        )
        .into_owned();
        if IdSet::parse_imap(&text, u32::MAX).is_none() {
            return Err(Bad::new("malformed sequence set"));
        }
        Ok(SequenceSet(text))
    }

    fn flag(&mut self) -> Result<String, Bad> {
        if Some(b'\\') == self.peek() {
            self.pos += 1;
            Ok(format!("\\{}", self.atom()?))
        } else {
            self.atom()
        }
    }

    fn flag_list(&mut self) -> Result<Vec<String>, Bad> {
        self.expect(b'(')?;
        let mut flags = Vec::new();
        if Some(b')') != self.peek() {
            flags.push(self.flag()?);
            while self.sp() {
                flags.push(self.flag()?);
            }
        }
        self.expect(b')')?;
        Ok(flags)
    }

    /// `1-Feb-1994` or `"1-Feb-1994"`.
    fn date(&mut self) -> Result<NaiveDate, Bad> {
        let quoted = Some(b'"') == self.peek();
        if quoted {
            self.pos += 1;
        }
        let start = self.pos;
        while self.peek().map_or(false, |c| {
            c.is_ascii_alphanumeric() || b'-' == c
        }) {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(
            &self.input[start..self.pos],
        )
        .into_owned();
        if quoted {
            self.expect(b'"')?;
        }

        let mut parts = text.split('-');
        let (day, month, year) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(d), Some(m), Some(y), None) => (d, m, y),
            _ => return Err(Bad::new("malformed date")),
        };
        let day: u32 = day
            .parse()
            .map_err(|_| Bad::new("malformed date"))?;
        let month = 1 + MONTHS
            .iter()
            .position(|m| m.eq_ignore_ascii_case(month))
            .ok_or_else(|| Bad::new("malformed date"))?
            as u32;
        let year: i32 = year
            .parse()
            .map_err(|_| Bad::new("malformed date"))?;
        NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| Bad::new("no such date"))
    }

    fn request(&mut self) -> Result<Request, Bad> {
        let name = self.atom()?.to_ascii_uppercase();
        match name.as_str() {
            "CAPABILITY" => Ok(Request::Capability),
            "NOOP" => Ok(Request::Noop),
            "CHECK" => Ok(Request::Check),
            "LOGOUT" => Ok(Request::Logout),
            "STARTTLS" => Ok(Request::StartTls),
            "NAMESPACE" => Ok(Request::Namespace),
            "CLOSE" => Ok(Request::Close),
            "UNSELECT" => Ok(Request::Unselect),
            "EXPUNGE" => Ok(Request::Expunge),
            "IDLE" => Ok(Request::Idle),
            "COMPRESS" => {
                self.expect_sp()?;
                let alg = self.atom()?;
                if alg.eq_ignore_ascii_case("DEFLATE") {
                    Ok(Request::Compress)
                } else {
                    Err(Bad::new("only DEFLATE is supported"))
                }
            },
            "ID" => self.id_params(),
            "ENABLE" => {
                let mut extensions = Vec::new();
                while self.sp() {
                    extensions
                        .push(self.atom()?.to_ascii_uppercase());
                }
                if extensions.is_empty() {
                    Err(Bad::new("ENABLE needs arguments"))
                } else {
                    Ok(Request::Enable(extensions))
                }
            },
            "LOGIN" => {
                self.expect_sp()?;
                let user = self.astring_utf8()?;
                self.expect_sp()?;
                let password = self.astring_utf8()?;
                Ok(Request::Login { user, password })
            },
            "AUTHENTICATE" => {
                self.expect_sp()?;
                let mechanism = self.atom()?.to_ascii_uppercase();
                let initial = if self.sp() {
                    // SASL-IR; "=" denotes an empty response
                    let raw = self.atom()?;
                    if "=" == raw {
                        Some(Vec::new())
                    } else {
                        Some(base64::decode(&raw).map_err(|_| {
                            Bad::new("bad base64 in initial response")
                        })?)
                    }
                } else {
                    None
                };
                Ok(Request::Authenticate { mechanism, initial })
            },
            "SELECT" | "EXAMINE" => {
                self.expect_sp()?;
                let mailbox = self.mailbox()?;
                let condstore = self.select_params()?;
                if "SELECT" == name {
                    Ok(Request::Select { mailbox, condstore })
                } else {
                    Ok(Request::Examine { mailbox, condstore })
                }
            },
            "CREATE" => {
                self.expect_sp()?;
                Ok(Request::Create {
                    mailbox: self.mailbox()?,
                })
            },
            "DELETE" => {
                self.expect_sp()?;
                Ok(Request::Delete {
                    mailbox: self.mailbox()?,
                })
            },
            "RENAME" => {
                self.expect_sp()?;
                let from = self.mailbox()?;
                self.expect_sp()?;
                let to = self.mailbox()?;
                Ok(Request::Rename { from, to })
            },
            "SUBSCRIBE" => {
                self.expect_sp()?;
                Ok(Request::Subscribe {
                    mailbox: self.mailbox()?,
                })
            },
            "UNSUBSCRIBE" => {
                self.expect_sp()?;
                Ok(Request::Unsubscribe {
                    mailbox: self.mailbox()?,
                })
            },
            "LIST" | "LSUB" => {
                self.expect_sp()?;
                let reference = self.astring_utf8()?;
                self.expect_sp()?;
                let pattern = self.list_pattern()?;
                if "LIST" == name {
                    Ok(Request::List { reference, pattern })
                } else {
                    Ok(Request::Lsub { reference, pattern })
                }
            },
            "STATUS" => {
                self.expect_sp()?;
                let mailbox = self.mailbox()?;
                self.expect_sp()?;
                self.expect(b'(')?;
                let mut items = Vec::new();
                loop {
                    let item =
                        self.atom()?.to_ascii_uppercase();
                    items.push(match item.as_str() {
                        "MESSAGES" => StatusItem::Messages,
                        "RECENT" => StatusItem::Recent,
                        "UIDNEXT" => StatusItem::UidNext,
                        "UIDVALIDITY" => StatusItem::UidValidity,
                        "UNSEEN" => StatusItem::Unseen,
                        "HIGHESTMODSEQ" => {
                            StatusItem::HighestModseq
                        },
                        other => {
                            return Err(Bad::new(format!(
                                "unknown STATUS item {}",
                                other,
                            )))
                        },
                    });
                    if !self.sp() {
                        break;
                    }
                }
                self.expect(b')')?;
                Ok(Request::Status { mailbox, items })
            },
            "APPEND" => {
                self.expect_sp()?;
                let mailbox = self.mailbox()?;
                self.expect_sp()?;
                let flags = if Some(b'(') == self.peek() {
                    let flags = self.flag_list()?;
                    self.expect_sp()?;
                    flags
                } else {
                    Vec::new()
                };
                let date = if Some(b'"') == self.peek() {
                    let date = self.date()?;
                    self.expect_sp()?;
                    Some(date)
                } else {
                    None
                };
                let message = self.literal()?;
                Ok(Request::Append {
                    mailbox,
                    flags,
                    date,
                    message,
                })
            },
            "UID" => {
                self.expect_sp()?;
                let sub = self.atom()?.to_ascii_uppercase();
                match sub.as_str() {
                    "FETCH" => self.fetch(true),
                    "STORE" => self.store(true),
                    "SEARCH" => self.search(true),
                    "SORT" => self.sort(true),
                    "THREAD" => self.thread(true),
                    "COPY" => self.copy(true),
                    "EXPUNGE" => {
                        self.expect_sp()?;
                        Ok(Request::UidExpunge {
                            set: self.sequence_set()?,
                        })
                    },
                    other => Err(Bad::new(format!(
                        "unknown UID command {}",
                        other,
                    ))),
                }
            },
            "FETCH" => self.fetch(false),
            "STORE" => self.store(false),
            "SEARCH" => self.search(false),
            "SORT" => self.sort(false),
            "THREAD" => self.thread(false),
            "COPY" => self.copy(false),
            other => {
                Err(Bad::new(format!("unknown command {}", other)))
            },
        }
    }

    fn id_params(&mut self) -> Result<Request, Bad> {
        self.expect_sp()?;
        if Some(b'(') != self.peek() {
            let nil = self.atom()?;
            return if nil.eq_ignore_ascii_case("NIL") {
                Ok(Request::Id(None))
            } else {
                Err(Bad::new("expected ID parameter list or NIL"))
            };
        }
        self.pos += 1;
        let mut params = Vec::new();
        if Some(b')') != self.peek() {
            loop {
                let key = self.string_utf8()?;
                self.expect_sp()?;
                let value = if Some(b'"') == self.peek()
                    || Some(b'{') == self.peek()
                {
                    Some(self.string_utf8()?)
                } else {
                    let nil = self.atom()?;
                    if !nil.eq_ignore_ascii_case("NIL") {
                        return Err(Bad::new("expected value or NIL"));
                    }
                    None
                };
                params.push((key, value));
                if !self.sp() {
                    break;
                }
            }
        }
        self.expect(b')')?;
        Ok(Request::Id(Some(params)))
    }

    fn select_params(&mut self) -> Result<bool, Bad> {
        let mut condstore = false;
        if self.sp() {
            self.expect(b'(')?;
            loop {
                let param = self.atom()?.to_ascii_uppercase();
                if "CONDSTORE" == param {
                    condstore = true;
                } else {
                    return Err(Bad::new(format!(
                        "unknown SELECT parameter {}",
                        param,
                    )));
                }
                if !self.sp() {
                    break;
                }
            }
            self.expect(b')')?;
        }
        Ok(condstore)
    }

    fn list_pattern(&mut self) -> Result<String, Bad> {
        // list-mailbox admits % and * beyond astring characters
        match self.peek() {
            Some(b'"') | Some(b'{') => {
                return self.astring_utf8();
            },
            _ => (),
        }
        let start = self.pos;
        while self.peek().map_or(false, |c| {
            !matches!(
                c,
                b' ' | b'(' | b')' | b'{' | b'"' | b'\\' | 0..=31
                    | 127
            )
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("expected mailbox pattern"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .into_owned())
    }

    fn fetch(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        let set = self.sequence_set()?;
        self.expect_sp()?;

        let mut items = Vec::new();
        if Some(b'(') == self.peek() {
            self.pos += 1;
            loop {
                self.fetch_item(&mut items)?;
                if !self.sp() {
                    break;
                }
            }
            self.expect(b')')?;
        } else {
            self.fetch_item(&mut items)?;
        }

        let mut changed_since = None;
        if self.sp() {
            self.expect(b'(')?;
            let modifier = self.atom()?.to_ascii_uppercase();
            if "CHANGEDSINCE" != modifier {
                return Err(Bad::new(format!(
                    "unknown FETCH modifier {}",
                    modifier,
                )));
            }
            self.expect_sp()?;
            changed_since = Some(self.number()?);
            self.expect(b')')?;
        }

        // CHANGEDSINCE implies MODSEQ in the results.
        if changed_since.is_some()
            && !items.contains(&FetchItem::Modseq)
        {
            items.push(FetchItem::Modseq);
        }

        Ok(Request::Fetch {
            set,
            items,
            changed_since,
            uid,
        })
    }

    fn fetch_item(
        &mut self,
        items: &mut Vec<FetchItem>,
    ) -> Result<(), Bad> {
        let name = self.fetch_att_name()?;
        match name.as_str() {
            "FLAGS" => items.push(FetchItem::Flags),
            "UID" => items.push(FetchItem::Uid),
            "INTERNALDATE" => items.push(FetchItem::InternalDate),
            "RFC822.SIZE" => items.push(FetchItem::Rfc822Size),
            "MODSEQ" => items.push(FetchItem::Modseq),
            "RFC822" => items.push(FetchItem::Body { peek: false }),
            "BODY" => {
                if Some(b'[') == self.peek() {
                    self.expect(b'[')?;
                    self.expect(b']')?;
                    items.push(FetchItem::Body { peek: false });
                } else {
                    // Plain BODY (the structure form) needs the MIME
                    // decoder, which lives upstream of this server.
                    return Err(Bad::new(
                        "BODY without a section is not supported",
                    ));
                }
            },
            "BODY.PEEK" => {
                self.expect(b'[')?;
                self.expect(b']')?;
                items.push(FetchItem::Body { peek: true });
            },
            "ALL" | "FAST" => {
                items.push(FetchItem::Flags);
                items.push(FetchItem::InternalDate);
                items.push(FetchItem::Rfc822Size);
            },
            "FULL" => {
                items.push(FetchItem::Flags);
                items.push(FetchItem::InternalDate);
                items.push(FetchItem::Rfc822Size);
                items.push(FetchItem::Body { peek: true });
            },
            other => {
                return Err(Bad::new(format!(
                    "unknown fetch item {}",
                    other,
                )))
            },
        }
        Ok(())
    }

    /// A fetch attribute name, possibly containing dots or a leading
    /// `+`/`-` (shared with the STORE verbs).
    fn fetch_att_name(&mut self) -> Result<String, Bad> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        while self.peek().map_or(false, |c| {
            c.is_ascii_alphanumeric() || b'.' == c
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Bad::new("expected fetch attribute"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .to_ascii_uppercase())
    }

    fn store(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        let set = self.sequence_set()?;
        self.expect_sp()?;

        let mut unchanged_since = None;
        if Some(b'(') == self.peek() {
            self.pos += 1;
            let modifier = self.atom()?.to_ascii_uppercase();
            if "UNCHANGEDSINCE" != modifier {
                return Err(Bad::new(format!(
                    "unknown STORE modifier {}",
                    modifier,
                )));
            }
            self.expect_sp()?;
            unchanged_since = Some(self.number()?);
            self.expect(b')')?;
            self.expect_sp()?;
        }

        let verb = self.fetch_att_name()?;
        let (mode, silent) = match verb.as_str() {
            "FLAGS" => (StoreMode::Replace, false),
            "FLAGS.SILENT" => (StoreMode::Replace, true),
            "+FLAGS" => (StoreMode::Add, false),
            "+FLAGS.SILENT" => (StoreMode::Add, true),
            "-FLAGS" => (StoreMode::Remove, false),
            "-FLAGS.SILENT" => (StoreMode::Remove, true),
            other => {
                return Err(Bad::new(format!(
                    "unknown STORE verb {}",
                    other,
                )))
            },
        };
        self.expect_sp()?;
        let flags = if Some(b'(') == self.peek() {
            self.flag_list()?
        } else {
            let mut flags = vec![self.flag()?];
            while self.sp() {
                flags.push(self.flag()?);
            }
            flags
        };

        Ok(Request::Store {
            set,
            mode,
            silent,
            flags,
            unchanged_since,
            uid,
        })
    }

    fn copy(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        let set = self.sequence_set()?;
        self.expect_sp()?;
        let mailbox = self.mailbox()?;
        Ok(Request::Copy { set, mailbox, uid })
    }

    fn search(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        let mut msn_sets = Vec::new();

        // Optional CHARSET
        let mark = self.mark();
        match self.atom() {
            Ok(word) if word.eq_ignore_ascii_case("CHARSET") => {
                self.expect_sp()?;
                let charset = self.astring_utf8()?;
                if !charset.eq_ignore_ascii_case("UTF-8")
                    && !charset.eq_ignore_ascii_case("US-ASCII")
                {
                    return Err(Bad::new("unsupported charset"));
                }
                self.expect_sp()?;
            },
            _ => self.restore(mark),
        }

        let mut keys = vec![self.search_key(&mut msn_sets)?];
        while self.sp() {
            keys.push(self.search_key(&mut msn_sets)?);
        }
        // Marker leaves are substituted positionally by the executor,
        // so the tree must not be reshaped while any are present.
        let selector = if msn_sets.is_empty() {
            Selector::And(keys).simplify()
        } else {
            Selector::And(keys)
        };
        Ok(Request::Search {
            selector,
            uid,
            msn_sets,
        })
    }

    fn sort(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        self.expect(b'(')?;
        let mut criteria = Vec::new();
        loop {
            let mut reverse = false;
            let mut word = self.atom()?.to_ascii_uppercase();
            if "REVERSE" == word {
                reverse = true;
                self.expect_sp()?;
                word = self.atom()?.to_ascii_uppercase();
            }
            let key = match word.as_str() {
                "ARRIVAL" => SortKey::Arrival,
                "CC" => SortKey::Cc,
                "DATE" => SortKey::Date,
                "FROM" => SortKey::From,
                "SIZE" => SortKey::Size,
                "SUBJECT" => SortKey::Subject,
                "TO" => SortKey::To,
                other => {
                    return Err(Bad::new(format!(
                        "unknown sort key {}",
                        other,
                    )))
                },
            };
            criteria.push(SortCriterion { reverse, key });
            if !self.sp() {
                break;
            }
        }
        self.expect(b')')?;
        self.expect_sp()?;

        // Charset, then the search program.
        let _charset = self.astring_utf8()?;
        self.expect_sp()?;
        let mut msn_sets = Vec::new();
        let mut keys = vec![self.search_key(&mut msn_sets)?];
        while self.sp() {
            keys.push(self.search_key(&mut msn_sets)?);
        }
        let selector = if msn_sets.is_empty() {
            Selector::And(keys).simplify()
        } else {
            Selector::And(keys)
        };
        Ok(Request::Sort {
            criteria,
            selector,
            uid,
            msn_sets,
        })
    }

    fn thread(&mut self, uid: bool) -> Result<Request, Bad> {
        self.expect_sp()?;
        let algorithm = match self
            .atom()?
            .to_ascii_uppercase()
            .as_str()
        {
            "ORDEREDSUBJECT" => ThreadAlg::OrderedSubject,
            "REFERENCES" => ThreadAlg::References,
            other => {
                return Err(Bad::new(format!(
                    "unknown thread algorithm {}",
                    other,
                )))
            },
        };
        self.expect_sp()?;
        let _charset = self.astring_utf8()?;
        self.expect_sp()?;
        let mut msn_sets = Vec::new();
        let mut keys = vec![self.search_key(&mut msn_sets)?];
        while self.sp() {
            keys.push(self.search_key(&mut msn_sets)?);
        }
        let selector = if msn_sets.is_empty() {
            Selector::And(keys).simplify()
        } else {
            Selector::And(keys)
        };
        Ok(Request::Thread {
            algorithm,
            selector,
            uid,
            msn_sets,
        })
    }

    /// One RFC 3501/4731/5032/5257/7162 search key.
    ///
    /// Keys that need session state (bare MSN sets, UID sets with `*`,
    /// RECENT/NEW) cannot be resolved here; they park a marker in
    /// `msn_sets` and stand in the tree as an empty `Uid` leaf the
    /// executor fills in.
    fn search_key(
        &mut self,
        msn_sets: &mut Vec<SequenceSet>,
    ) -> Result<Selector, Bad> {
        if Some(b'(') == self.peek() {
            self.pos += 1;
            let mut keys = vec![self.search_key(msn_sets)?];
            while self.sp() {
                keys.push(self.search_key(msn_sets)?);
            }
            self.expect(b')')?;
            return Ok(Selector::And(keys));
        }

        if self
            .peek()
            .map_or(false, |c| c.is_ascii_digit() || b'*' == c)
        {
            let set = self.sequence_set()?;
            msn_sets.push(set);
            return Ok(Selector::Uid(IdSet::new()));
        }

        let key = self.atom()?.to_ascii_uppercase();
        let selector = match key.as_str() {
            "ALL" => Selector::All,
            "ANSWERED" => Selector::Flag("\\Answered".to_owned()),
            "DELETED" => Selector::Flag("\\Deleted".to_owned()),
            "DRAFT" => Selector::Flag("\\Draft".to_owned()),
            "FLAGGED" => Selector::Flag("\\Flagged".to_owned()),
            "RECENT" | "NEW" => {
                // Resolved against the session's recent set.
                msn_sets.push(SequenceSet("$recent".to_owned()));
                Selector::Uid(IdSet::new())
            },
            "OLD" => Selector::All,
            "SEEN" => Selector::Flag("\\Seen".to_owned()),
            "UNANSWERED" => Selector::Not(Box::new(Selector::Flag(
                "\\Answered".to_owned(),
            ))),
            "UNDELETED" => Selector::Not(Box::new(Selector::Flag(
                "\\Deleted".to_owned(),
            ))),
            "UNDRAFT" => Selector::Not(Box::new(Selector::Flag(
                "\\Draft".to_owned(),
            ))),
            "UNFLAGGED" => Selector::Not(Box::new(Selector::Flag(
                "\\Flagged".to_owned(),
            ))),
            "UNSEEN" => Selector::Not(Box::new(Selector::Flag(
                "\\Seen".to_owned(),
            ))),
            "KEYWORD" => {
                self.expect_sp()?;
                Selector::Flag(self.atom()?)
            },
            "UNKEYWORD" => {
                self.expect_sp()?;
                Selector::Not(Box::new(Selector::Flag(self.atom()?)))
            },
            "BCC" => self.address_key(AddressField::Bcc)?,
            "CC" => self.address_key(AddressField::Cc)?,
            "FROM" => self.address_key(AddressField::From)?,
            "TO" => self.address_key(AddressField::To)?,
            "SUBJECT" => {
                self.expect_sp()?;
                Selector::Header {
                    field: "subject".to_owned(),
                    value: self.astring_utf8()?,
                }
            },
            "HEADER" => {
                self.expect_sp()?;
                let field = self.astring_utf8()?;
                self.expect_sp()?;
                Selector::Header {
                    field,
                    value: self.astring_utf8()?,
                }
            },
            "BODY" => {
                self.expect_sp()?;
                Selector::Body(self.astring_utf8()?)
            },
            "TEXT" => {
                self.expect_sp()?;
                let text = self.astring_utf8()?;
                Selector::Or(vec![
                    Selector::Header {
                        field: String::new(),
                        value: text.clone(),
                    },
                    Selector::Body(text),
                ])
            },
            "BEFORE" => self.date_key(DateRel::Before, false)?,
            "ON" => self.date_key(DateRel::On, false)?,
            "SINCE" => self.date_key(DateRel::Since, false)?,
            "SENTBEFORE" => self.date_key(DateRel::Before, true)?,
            "SENTON" => self.date_key(DateRel::On, true)?,
            "SENTSINCE" => self.date_key(DateRel::Since, true)?,
            "LARGER" => {
                self.expect_sp()?;
                Selector::Larger(self.nz_number()?)
            },
            "SMALLER" => {
                self.expect_sp()?;
                Selector::Smaller(self.nz_number()?)
            },
            "MODSEQ" => {
                self.expect_sp()?;
                Selector::Modseq(self.number()?)
            },
            "YOUNGER" => {
                self.expect_sp()?;
                Selector::Age {
                    older: false,
                    seconds: self.nz_number()?,
                }
            },
            "OLDER" => {
                self.expect_sp()?;
                Selector::Age {
                    older: true,
                    seconds: self.nz_number()?,
                }
            },
            "ANNOTATION" => {
                self.expect_sp()?;
                let entry = self.astring_utf8()?;
                self.expect_sp()?;
                let _attrib = self.astring_utf8()?;
                self.expect_sp()?;
                Selector::Annotation {
                    entry,
                    value: self.astring_utf8()?,
                }
            },
            "UID" => {
                self.expect_sp()?;
                let set = self.sequence_set()?;
                // Star resolution happens at execution; the raw set
                // travels with a marker prefix.
                msn_sets.push(SequenceSet(format!(
                    "$uid:{}",
                    set.0,
                )));
                Selector::Uid(IdSet::new())
            },
            "NOT" => {
                self.expect_sp()?;
                Selector::Not(Box::new(self.search_key(msn_sets)?))
            },
            "OR" => {
                self.expect_sp()?;
                let a = self.search_key(msn_sets)?;
                self.expect_sp()?;
                let b = self.search_key(msn_sets)?;
                Selector::Or(vec![a, b])
            },
            other => {
                return Err(Bad::new(format!(
                    "unknown search key {}",
                    other,
                )))
            },
        };
        Ok(selector)
    }

    fn address_key(
        &mut self,
        field: AddressField,
    ) -> Result<Selector, Bad> {
        self.expect_sp()?;
        Ok(Selector::Address {
            field,
            value: self.astring_utf8()?,
        })
    }

    fn date_key(
        &mut self,
        rel: DateRel,
        sent: bool,
    ) -> Result<Selector, Bad> {
        self.expect_sp()?;
        let date = self.date()?;
        Ok(if sent {
            Selector::Sent { rel, date }
        } else {
            Selector::InternalDate { rel, date }
        })
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep",
    "Oct", "Nov", "Dec",
];

#[cfg(test)]
mod test {
    use super::*;

    fn parse_ok(line: &[u8]) -> (String, Request) {
        parse_command(line).unwrap_or_else(|(_, bad)| {
            panic!("parse of {:?} failed: {}", line, bad.message)
        })
    }

    #[test]
    fn parses_login() {
        let (tag, request) =
            parse_ok(b"a1 LOGIN \"alice\" \"pw\"");
        assert_eq!("a1", tag);
        assert_eq!(
            Request::Login {
                user: "alice".to_owned(),
                password: "pw".to_owned(),
            },
            request,
        );
    }

    #[test]
    fn parses_login_with_literal_password() {
        let (_, request) =
            parse_ok(b"a1 LOGIN alice {2}\r\npw");
        assert_eq!(
            Request::Login {
                user: "alice".to_owned(),
                password: "pw".to_owned(),
            },
            request,
        );
    }

    #[test]
    fn literal_plus_is_equivalent() {
        let (_, request) =
            parse_ok(b"a1 LOGIN alice {2+}\r\npw");
        assert_matches!(Request::Login { .. }, request);
    }

    #[test]
    fn select_normalises_inbox_case() {
        let (_, request) = parse_ok(b"a2 SELECT \"iNbOx\"");
        assert_eq!(
            Request::Select {
                mailbox: "INBOX".to_owned(),
                condstore: false,
            },
            request,
        );

        let (_, request) =
            parse_ok(b"a2 SELECT foo (CONDSTORE)");
        assert_eq!(
            Request::Select {
                mailbox: "foo".to_owned(),
                condstore: true,
            },
            request,
        );
    }

    #[test]
    fn parses_uid_store_deleted() {
        let (tag, request) =
            parse_ok(b"a3 UID STORE 7 +FLAGS (\\Deleted)");
        assert_eq!("a3", tag);
        assert_eq!(
            Request::Store {
                set: SequenceSet("7".to_owned()),
                mode: StoreMode::Add,
                silent: false,
                flags: vec!["\\Deleted".to_owned()],
                unchanged_since: None,
                uid: true,
            },
            request,
        );
    }

    #[test]
    fn parses_store_unchangedsince() {
        let (_, request) = parse_ok(
            b"a STORE 1:3 (UNCHANGEDSINCE 42) +FLAGS.SILENT \\Seen",
        );
        assert_eq!(
            Request::Store {
                set: SequenceSet("1:3".to_owned()),
                mode: StoreMode::Add,
                silent: true,
                flags: vec!["\\Seen".to_owned()],
                unchanged_since: Some(42),
                uid: false,
            },
            request,
        );
    }

    #[test]
    fn parses_fetch_with_changedsince() {
        let (_, request) = parse_ok(
            b"a UID FETCH 1:* (FLAGS UID) (CHANGEDSINCE 7)",
        );
        match request {
            Request::Fetch {
                set,
                items,
                changed_since,
                uid,
            } => {
                assert_eq!(SequenceSet("1:*".to_owned()), set);
                assert!(items.contains(&FetchItem::Flags));
                assert!(items.contains(&FetchItem::Uid));
                // implied by CHANGEDSINCE
                assert!(items.contains(&FetchItem::Modseq));
                assert_eq!(Some(7), changed_since);
                assert!(uid);
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_search_program() {
        let (_, request) = parse_ok(
            b"a SEARCH UNSEEN FROM \"jones\" SENTSINCE 1-Feb-1994",
        );
        match request {
            Request::Search {
                selector,
                uid,
                msn_sets,
            } => {
                assert!(!uid);
                assert!(msn_sets.is_empty());
                // And of three keys, already simplified
                match selector {
                    Selector::And(keys) => {
                        assert_eq!(3, keys.len())
                    },
                    other => {
                        panic!("unexpected selector: {:?}", other)
                    },
                }
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn search_or_and_not_nest() {
        let (_, request) =
            parse_ok(b"a SEARCH OR FROM x NOT TO y");
        match request {
            Request::Search { selector, .. } => match selector {
                Selector::Or(children) => {
                    assert_eq!(2, children.len());
                    assert_matches!(
                        Selector::Not(_),
                        &children[1]
                    );
                },
                other => panic!("unexpected: {:?}", other),
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn search_uid_key_parks_a_marker() {
        let (_, request) = parse_ok(b"a SEARCH UID 4:*");
        match request {
            Request::Search { msn_sets, .. } => {
                assert_eq!(
                    vec![SequenceSet("$uid:4:*".to_owned())],
                    msn_sets,
                );
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_sort_and_thread() {
        let (_, request) = parse_ok(
            b"a UID SORT (REVERSE DATE SUBJECT) UTF-8 ALL",
        );
        match request {
            Request::Sort { criteria, uid, .. } => {
                assert!(uid);
                assert_eq!(2, criteria.len());
                assert!(criteria[0].reverse);
                assert_eq!(SortKey::Date, criteria[0].key);
                assert_eq!(SortKey::Subject, criteria[1].key);
            },
            other => panic!("unexpected: {:?}", other),
        }

        let (_, request) =
            parse_ok(b"a THREAD REFERENCES UTF-8 ALL");
        assert_matches!(
            Request::Thread {
                algorithm: ThreadAlg::References,
                ..
            },
            request
        );
    }

    #[test]
    fn parses_append() {
        let (_, request) = parse_ok(
            b"a APPEND saved (\\Seen) {12}\r\nhello world!",
        );
        assert_eq!(
            Request::Append {
                mailbox: "saved".to_owned(),
                flags: vec!["\\Seen".to_owned()],
                date: None,
                message: b"hello world!".to_vec(),
            },
            request,
        );
    }

    #[test]
    fn parses_authenticate_with_initial_response() {
        let (_, request) = parse_ok(
            format!(
                "a AUTHENTICATE PLAIN {}",
                base64::encode(&b"\0u\0p"[..]),
            )
            .as_bytes(),
        );
        assert_eq!(
            Request::Authenticate {
                mechanism: "PLAIN".to_owned(),
                initial: Some(b"\0u\0p".to_vec()),
            },
            request,
        );
    }

    #[test]
    fn parses_dates() {
        let mut p = Parser::new(b"1-Feb-1994");
        assert_eq!(
            NaiveDate::from_ymd_opt(1994, 2, 1).unwrap(),
            p.date().unwrap(),
        );
        let mut p = Parser::new(b"\"17-Jul-2009\"");
        assert_eq!(
            NaiveDate::from_ymd_opt(2009, 7, 17).unwrap(),
            p.date().unwrap(),
        );
        let mut p = Parser::new(b"31-Feb-2009");
        assert_matches!(Err(_), p.date());
    }

    #[test]
    fn rejects_malformed_sequence_set() {
        let result = parse_command(b"a FETCH 0 FLAGS");
        assert_matches!(Err((Some(_), _)), result);
    }

    #[test]
    fn bad_command_reports_tag() {
        let (tag, bad) =
            parse_command(b"a9 FROBNICATE x").unwrap_err();
        assert_eq!(Some("a9".to_owned()), tag);
        assert!(bad.message.contains("FROBNICATE"));
    }

    #[test]
    fn mark_restore_backtracks() {
        let mut p = Parser::new(b"CHARSETX rest");
        let mark = p.mark();
        let word = p.atom().unwrap();
        assert_eq!("CHARSETX", word);
        p.restore(mark);
        assert_eq!("CHARSETX", p.atom().unwrap());
    }
}
