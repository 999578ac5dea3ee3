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

//! Search predicate trees and their translation to SQL.
//!
//! A `Selector` is the in-memory form of an IMAP SEARCH (or SORT/THREAD)
//! program. `simplify()` normalises the tree; `to_sql()` walks it and
//! emits a single SELECT over `mailbox_messages mm` (or
//! `deleted_messages`, with the same alias discipline), adding joins on
//! demand and inventing `$n` placeholders as it goes, each matched with a
//! typed bind.
//!
//! Flag tests become numbered `flags fN` left joins whose condition
//! ends up as `fN.flag is (not) null`, so that negation costs nothing.
//! Header and address tests work the same way, with the value conditions
//! folded into the join. An OR over several address fields searching for
//! the same string is lifted into one join with `field in (...)` instead
//! of a product of joins.

use std::fmt::Write as _;

use chrono::NaiveDate;

use crate::db::query::Value;
use crate::store::idset::IdSet;
use crate::store::interner::flags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateRel {
    Before,
    On,
    Since,
}

/// Numeric header-field codes used by the `address_fields.field` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressField {
    From,
    Sender,
    ReplyTo,
    To,
    Cc,
    Bcc,
}

impl AddressField {
    pub fn code(self) -> u32 {
        match self {
            AddressField::From => 1,
            AddressField::Sender => 3,
            AddressField::ReplyTo => 6,
            AddressField::To => 7,
            AddressField::Cc => 8,
            AddressField::Bcc => 9,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selector {
    /// Matches every message.
    All,
    /// Matches nothing.
    Nil,
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
    Uid(IdSet),
    /// The message has this flag.
    Flag(String),
    /// A header field contains a substring; an empty value tests mere
    /// existence.
    Header { field: String, value: String },
    /// An address field matches the search term.
    Address { field: AddressField, value: String },
    Body(String),
    InternalDate { rel: DateRel, date: NaiveDate },
    Sent { rel: DateRel, date: NaiveDate },
    Larger(u32),
    Smaller(u32),
    Modseq(u64),
    /// RFC 5032 YOUNGER (false) / OLDER (true).
    Age { older: bool, seconds: u32 },
    Annotation { entry: String, value: String },
}

impl Selector {
    /// Normalises the tree: flattens nested And/Or, collapses
    /// singletons, eliminates double negation, and propagates All/Nil.
    /// The result is a fixed point: `simplify(simplify(t)) ==
    /// simplify(t)`.
    pub fn simplify(self) -> Selector {
        match self {
            Selector::And(children) => {
                let mut flat = Vec::new();
                for child in children {
                    match child.simplify() {
                        Selector::All => (),
                        Selector::Nil => return Selector::Nil,
                        Selector::And(grandchildren) => {
                            flat.extend(grandchildren)
                        },
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Selector::All,
                    1 => flat.into_iter().next().unwrap(),
                    _ => Selector::And(flat),
                }
            },
            Selector::Or(children) => {
                let mut flat = Vec::new();
                for child in children {
                    match child.simplify() {
                        Selector::Nil => (),
                        Selector::All => return Selector::All,
                        Selector::Or(grandchildren) => {
                            flat.extend(grandchildren)
                        },
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Selector::Nil,
                    1 => flat.into_iter().next().unwrap(),
                    _ => Selector::Or(flat),
                }
            },
            Selector::Not(inner) => match inner.simplify() {
                Selector::Not(inner) => *inner,
                Selector::All => Selector::Nil,
                Selector::Nil => Selector::All,
                other => Selector::Not(Box::new(other)),
            },
            leaf => leaf,
        }
    }

    /// Emits the SQL and binds for this selector.
    pub fn to_sql(&self, options: &SqlOptions) -> SqlProgram {
        let mut emitter = Emitter {
            binds: Vec::new(),
            joins: String::new(),
            join_counter: 0,
            need_date_fields: false,
            need_bodyparts: false,
            need_messages: false,
            need_annotations: false,
            tsearch: options.tsearch_config.clone(),
        };

        let mailbox = emitter.placeholder(Value::from(options.mailbox_id));
        let condition = emitter.condition(self, false);

        let table = if options.deleted {
            "deleted_messages"
        } else {
            "mailbox_messages"
        };

        let mut sql = String::new();
        let mut order_exprs: Vec<String> = Vec::new();
        for key in &options.sort {
            let expr = emitter.sort_join(key.key);
            order_exprs.push(if key.reverse {
                format!("{} desc", expr)
            } else {
                expr
            });
        }

        if options.sort.is_empty() {
            let _ = write!(
                sql,
                "select mm.uid, mm.modseq, mm.message from {} mm",
                table,
            );
        } else {
            // select distinct requires the ordering expressions to be in
            // the output list.
            let mut extra = String::new();
            for expr in &order_exprs {
                let _ = write!(
                    extra,
                    ", {}",
                    expr.trim_end_matches(" desc"),
                );
            }
            let _ = write!(
                sql,
                "select distinct mm.uid, mm.modseq, mm.message{} from {} mm",
                extra, table,
            );
        }

        sql.push_str(&emitter.joins);
        if emitter.need_date_fields {
            sql.push_str(" join date_fields df on (df.message=mm.message)");
        }
        if emitter.need_annotations {
            sql.push_str(
                " join annotations a on (mm.mailbox=a.mailbox \
                 and mm.uid=a.uid)",
            );
        }
        if emitter.need_bodyparts {
            sql.push_str(
                " join part_numbers pn on (pn.message=mm.message) \
                 join bodyparts bp on (bp.id=pn.bodypart)",
            );
        }
        if emitter.need_messages {
            sql.push_str(" join messages m on (mm.message=m.id)");
        }

        let _ = write!(sql, " where mm.mailbox=${}", mailbox);
        if "true" != condition {
            let _ = write!(sql, " and {}", condition);
        }

        if options.sort.is_empty() {
            sql.push_str(" order by mm.uid");
        } else {
            sql.push_str(" order by ");
            sql.push_str(&order_exprs.join(", "));
        }

        SqlProgram {
            sql,
            binds: emitter.binds,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    Arrival,
    Cc,
    Date,
    From,
    Size,
    Subject,
    To,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SortCriterion {
    pub reverse: bool,
    pub key: SortKey,
}

pub struct SqlOptions {
    pub mailbox_id: u32,
    /// Search `deleted_messages` instead of `mailbox_messages`.
    pub deleted: bool,
    /// Text-search configuration of the bodyparts GIN index, if any.
    pub tsearch_config: Option<String>,
    pub sort: Vec<SortCriterion>,
}

impl SqlOptions {
    pub fn for_mailbox(mailbox_id: u32) -> Self {
        SqlOptions {
            mailbox_id,
            deleted: false,
            tsearch_config: crate::db::pool::tsearch_config(),
            sort: Vec::new(),
        }
    }
}

/// The finished SQL and its binds, placeholder `$n` ↔ `binds[n-1]`.
#[derive(Debug)]
pub struct SqlProgram {
    pub sql: String,
    pub binds: Vec<Value>,
}

impl SqlProgram {
    pub fn into_query(self) -> crate::db::query::Query {
        let query = crate::db::query::Query::new(self.sql);
        for (ix, value) in self.binds.into_iter().enumerate() {
            query.bind(ix as u16 + 1, value);
        }
        query
    }
}

struct Emitter {
    binds: Vec<Value>,
    joins: String,
    join_counter: u32,
    need_date_fields: bool,
    need_bodyparts: bool,
    need_messages: bool,
    need_annotations: bool,
    tsearch: Option<String>,
}

impl Emitter {
    fn placeholder(&mut self, value: Value) -> u16 {
        self.binds.push(value);
        self.binds.len() as u16
    }

    fn next_join(&mut self) -> u32 {
        self.join_counter += 1;
        self.join_counter
    }

    fn condition(&mut self, node: &Selector, negated: bool) -> String {
        match *node {
            Selector::All => {
                (if negated { "false" } else { "true" }).to_owned()
            },
            Selector::Nil => {
                (if negated { "true" } else { "false" }).to_owned()
            },
            Selector::Not(ref inner) => self.condition(inner, !negated),
            Selector::And(ref children) => {
                let conditions = self.address_lifted(children, negated);
                let joined = conditions.join(if negated {
                    " or "
                } else {
                    " and "
                });
                format!("({})", joined)
            },
            Selector::Or(ref children) => {
                let conditions = self.address_lifted(children, negated);
                let joined = conditions.join(if negated {
                    " and "
                } else {
                    " or "
                });
                format!("({})", joined)
            },
            Selector::Uid(ref set) => {
                let n = self.placeholder(Value::IntSet(
                    set.iter().collect(),
                ));
                if negated {
                    format!("not (mm.uid = ANY(${}))", n)
                } else {
                    format!("mm.uid = ANY(${})", n)
                }
            },
            Selector::Flag(ref name) => self.flag(name, negated),
            Selector::Header {
                ref field,
                ref value,
            } => self.header(field, value, negated),
            Selector::Address { field, ref value } => {
                self.addresses(&[field], value, negated)
            },
            Selector::Body(ref text) => self.body(text, negated),
            Selector::InternalDate { rel, date } => {
                self.internal_date(rel, date, negated)
            },
            Selector::Sent { rel, date } => {
                self.sent(rel, date, negated)
            },
            Selector::Larger(size) => {
                self.need_messages = true;
                let n = self.placeholder(Value::from(size));
                self.maybe_negate(
                    format!("m.rfc822size>${}", n),
                    negated,
                )
            },
            Selector::Smaller(size) => {
                self.need_messages = true;
                let n = self.placeholder(Value::from(size));
                self.maybe_negate(
                    format!("m.rfc822size<${}", n),
                    negated,
                )
            },
            Selector::Modseq(modseq) => {
                let n = self.placeholder(Value::from(modseq));
                self.maybe_negate(
                    format!("mm.modseq>=${}", n),
                    negated,
                )
            },
            Selector::Age { older, seconds } => {
                let cutoff = chrono::Utc::now().timestamp()
                    - i64::from(seconds);
                let n = self.placeholder(Value::BigInt(cutoff));
                let cond = if older {
                    format!("mm.idate<=${}", n)
                } else {
                    format!("mm.idate>=${}", n)
                };
                self.maybe_negate(cond, negated)
            },
            Selector::Annotation {
                ref entry,
                ref value,
            } => {
                self.need_annotations = true;
                let e = self.placeholder(Value::from(
                    entry.to_ascii_lowercase(),
                ));
                let v = self.placeholder(Value::from(value.as_str()));
                self.maybe_negate(
                    format!(
                        "(a.name=(select id from annotation_names \
                         where lower(name)=${}) \
                         and a.value ilike '%'||${}||'%')",
                        e, v,
                    ),
                    negated,
                )
            },
        }
    }

    /// Emits the children of an And/Or, first lifting groups of address
    /// tests for the same string into a single multi-field join.
    fn address_lifted(
        &mut self,
        children: &[Selector],
        negated: bool,
    ) -> Vec<String> {
        let mut conditions = Vec::new();
        let mut addresses: Vec<(AddressField, &str)> = Vec::new();

        for child in children {
            match *child {
                Selector::Address { field, ref value } => {
                    addresses.push((field, value))
                },
                ref other => {
                    conditions.push(self.condition(other, negated))
                },
            }
        }

        // Group by search string; two or more fields searching the same
        // string become one join with field in (...).
        while !addresses.is_empty() {
            let (_, value) = addresses[0];
            let mut fields: Vec<AddressField> = addresses
                .iter()
                .filter(|&&(_, v)| v == value)
                .map(|&(f, _)| f)
                .collect();
            fields.sort();
            fields.dedup();
            conditions.push(self.addresses(&fields, value, negated));
            let value = value.to_owned();
            addresses.retain(|&(_, v)| v != value);
        }

        conditions
    }

    fn flag(&mut self, name: &str, negated: bool) -> String {
        let id = match flags::id(name) {
            Some(id) => id,
            // A flag nobody has interned is on no message at all.
            None => {
                return (if negated { "true" } else { "false" })
                    .to_owned()
            },
        };

        let jn = self.next_join();
        let n = self.placeholder(Value::from(id));
        let _ = write!(
            self.joins,
            " left join flags f{jn} on (mm.mailbox=f{jn}.mailbox \
             and mm.uid=f{jn}.uid and f{jn}.flag=${n})",
            jn = jn,
            n = n,
        );
        if negated {
            format!("f{}.flag is null", jn)
        } else {
            format!("f{}.flag is not null", jn)
        }
    }

    fn header(
        &mut self,
        field: &str,
        value: &str,
        negated: bool,
    ) -> String {
        let jn = self.next_join();
        let mut on = format!(
            "mm.message=hf{jn}.message",
            jn = jn,
        );
        // An empty field name means "any header field" (TEXT).
        if !field.is_empty() {
            let f = self.placeholder(Value::from(
                field.to_ascii_lowercase(),
            ));
            let _ = write!(
                on,
                " and lower(hf{jn}.field)=${f}",
                jn = jn,
                f = f,
            );
        }
        // An empty value tests mere existence of the field.
        if !value.is_empty() {
            let v = self.placeholder(Value::from(value));
            let _ = write!(
                on,
                " and hf{jn}.value ilike '%'||${v}||'%'",
                jn = jn,
                v = v,
            );
        }
        let _ = write!(
            self.joins,
            " left join header_fields hf{jn} on ({on})",
            jn = jn,
            on = on,
        );
        if negated {
            format!("hf{}.field is null", jn)
        } else {
            format!("hf{}.field is not null", jn)
        }
    }

    fn addresses(
        &mut self,
        fields: &[AddressField],
        value: &str,
        negated: bool,
    ) -> String {
        let jn = self.next_join();

        let field_cond = if 1 == fields.len() {
            let n = self.placeholder(Value::from(fields[0].code()));
            format!("af{}.field=${}", jn, n)
        } else {
            let mut placeholders = Vec::new();
            for field in fields {
                let n = self.placeholder(Value::from(field.code()));
                placeholders.push(format!("${}", n));
            }
            format!("af{}.field in ({})", jn, placeholders.join(","))
        };

        // A term with @ is an exact localpart/domain match; otherwise a
        // substring of any of name, localpart, domain.
        let value_cond = if let Some(at) = value.rfind('@') {
            let (local, domain) = (&value[..at], &value[at + 1..]);
            let mut parts = Vec::new();
            if !local.is_empty() {
                let n = self.placeholder(Value::from(
                    local.to_ascii_lowercase(),
                ));
                parts.push(format!("lower(a{}.localpart)=${}", jn, n));
            }
            if !domain.is_empty() {
                let n = self.placeholder(Value::from(
                    domain.to_ascii_lowercase(),
                ));
                parts.push(format!("lower(a{}.domain)=${}", jn, n));
            }
            if parts.is_empty() {
                "true".to_owned()
            } else {
                parts.join(" and ")
            }
        } else {
            let n = self.placeholder(Value::from(value));
            format!(
                "(a{jn}.name ilike '%'||${n}||'%' \
                 or a{jn}.localpart ilike '%'||${n}||'%' \
                 or a{jn}.domain ilike '%'||${n}||'%')",
                jn = jn,
                n = n,
            )
        };

        let _ = write!(
            self.joins,
            " left join address_fields af{jn} on \
             (af{jn}.message=mm.message and {field_cond}) \
             left join addresses a{jn} on \
             (a{jn}.id=af{jn}.address and {value_cond})",
            jn = jn,
            field_cond = field_cond,
            value_cond = value_cond,
        );
        if negated {
            format!("a{}.id is null", jn)
        } else {
            format!("a{}.id is not null", jn)
        }
    }

    fn body(&mut self, text: &str, negated: bool) -> String {
        self.need_bodyparts = true;
        let n = self.placeholder(Value::from(text));
        let cond = match self.tsearch {
            Some(ref config) => format!(
                "(to_tsvector('{config}', bp.text) @@ \
                 plainto_tsquery(${n}) \
                 and bp.text ilike '%'||${n}||'%')",
                config = config,
                n = n,
            ),
            None => format!("bp.text ilike '%'||${}||'%'", n),
        };
        self.maybe_negate(cond, negated)
    }

    fn internal_date(
        &mut self,
        rel: DateRel,
        date: NaiveDate,
        negated: bool,
    ) -> String {
        let start = date.and_hms_opt(0, 0, 0).map_or(0, |dt| {
            dt.and_utc().timestamp()
        });
        let end = start + 86399;
        let cond = match rel {
            DateRel::On => {
                let a = self.placeholder(Value::BigInt(start));
                let b = self.placeholder(Value::BigInt(end));
                format!("(mm.idate>=${} and mm.idate<=${})", a, b)
            },
            DateRel::Since => {
                let a = self.placeholder(Value::BigInt(start));
                format!("mm.idate>=${}", a)
            },
            DateRel::Before => {
                let a = self.placeholder(Value::BigInt(start));
                format!("mm.idate<${}", a)
            },
        };
        self.maybe_negate(cond, negated)
    }

    fn sent(
        &mut self,
        rel: DateRel,
        date: NaiveDate,
        negated: bool,
    ) -> String {
        self.need_date_fields = true;
        let day = date.format("%Y-%m-%d").to_string();
        let next = date
            .succ_opt()
            .unwrap_or(date)
            .format("%Y-%m-%d")
            .to_string();
        let cond = match rel {
            DateRel::On => {
                let a = self.placeholder(Value::from(day));
                let b = self.placeholder(Value::from(next));
                format!("(df.value>=${} and df.value<${})", a, b)
            },
            DateRel::Since => {
                let a = self.placeholder(Value::from(day));
                format!("df.value>=${}", a)
            },
            DateRel::Before => {
                let a = self.placeholder(Value::from(day));
                format!("df.value<${}", a)
            },
        };
        self.maybe_negate(cond, negated)
    }

    fn maybe_negate(&self, cond: String, negated: bool) -> String {
        if negated {
            format!("not ({})", cond)
        } else {
            cond
        }
    }

    /// Adds the joins needed to sort by `key` and returns the ordering
    /// expression.
    fn sort_join(&mut self, key: SortKey) -> String {
        match key {
            SortKey::Arrival => "mm.idate".to_owned(),
            SortKey::Date => {
                self.joins.push_str(
                    " join date_fields sddf on \
                     (mm.message=sddf.message)",
                );
                "sddf.value".to_owned()
            },
            SortKey::Size => {
                if !self.need_messages {
                    self.need_messages = true;
                }
                "m.rfc822size".to_owned()
            },
            SortKey::From => {
                let _ = write!(
                    self.joins,
                    " join address_fields sfaf on \
                     (mm.message=sfaf.message and sfaf.part='' \
                     and sfaf.number=0 and sfaf.field={}) \
                     join addresses sfa on (sfaf.address=sfa.id)",
                    AddressField::From.code(),
                );
                "sfa.localpart".to_owned()
            },
            SortKey::To => {
                let _ = write!(
                    self.joins,
                    " left join address_fields staf on \
                     (mm.message=staf.message and staf.part='' \
                     and staf.number=0 and staf.field={}) \
                     left join addresses sta on (staf.address=sta.id)",
                    AddressField::To.code(),
                );
                "sta.localpart".to_owned()
            },
            SortKey::Cc => {
                let _ = write!(
                    self.joins,
                    " left join address_fields sccaf on \
                     (mm.message=sccaf.message and sccaf.part='' \
                     and sccaf.number=0 and sccaf.field={}) \
                     left join addresses scca on (sccaf.address=scca.id)",
                    AddressField::Cc.code(),
                );
                "scca.localpart".to_owned()
            },
            SortKey::Subject => {
                self.joins.push_str(
                    " left join thread_members sstm on \
                     (mm.mailbox=sstm.mailbox and mm.uid=sstm.uid) \
                     left join threads sst on (sstm.thread=sst.id)",
                );
                "sst.subject".to_owned()
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn normalise(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn uid_set(uids: &[u32]) -> Selector {
        Selector::Uid(uids.iter().copied().collect())
    }

    #[test]
    fn simplify_double_negation() {
        let t = Selector::Not(Box::new(Selector::Not(Box::new(
            uid_set(&[1]),
        ))));
        assert_eq!(uid_set(&[1]), t.simplify());
    }

    #[test]
    fn simplify_collapses_singletons_and_flattens() {
        let t = Selector::And(vec![Selector::Or(vec![uid_set(&[1])])]);
        assert_eq!(uid_set(&[1]), t.simplify());

        let t = Selector::And(vec![
            Selector::And(vec![uid_set(&[1]), uid_set(&[2])]),
            uid_set(&[3]),
        ]);
        assert_eq!(
            Selector::And(vec![
                uid_set(&[1]),
                uid_set(&[2]),
                uid_set(&[3]),
            ]),
            t.simplify(),
        );
    }

    #[test]
    fn simplify_propagates_constants() {
        let t = Selector::And(vec![Selector::All, uid_set(&[1])]);
        assert_eq!(uid_set(&[1]), t.clone().simplify());

        let t = Selector::And(vec![Selector::Nil, uid_set(&[1])]);
        assert_eq!(Selector::Nil, t.simplify());

        let t = Selector::Or(vec![Selector::All, uid_set(&[1])]);
        assert_eq!(Selector::All, t.simplify());

        let t = Selector::Or(vec![Selector::Nil, uid_set(&[1])]);
        assert_eq!(uid_set(&[1]), t.simplify());

        assert_eq!(
            Selector::Nil,
            Selector::Not(Box::new(Selector::All)).simplify(),
        );
        assert_eq!(Selector::And(vec![]).simplify(), Selector::All);
        assert_eq!(Selector::Or(vec![]).simplify(), Selector::Nil);
    }

    #[test]
    fn simplify_is_idempotent() {
        let trees = vec![
            Selector::Not(Box::new(Selector::And(vec![
                Selector::All,
                Selector::Not(Box::new(uid_set(&[1, 2]))),
                Selector::Or(vec![
                    Selector::Flag("\\Seen".to_owned()),
                    Selector::Nil,
                ]),
            ]))),
            Selector::Or(vec![
                Selector::Or(vec![uid_set(&[1]), Selector::Nil]),
                Selector::And(vec![]),
            ]),
            Selector::Not(Box::new(Selector::Not(Box::new(
                Selector::Not(Box::new(uid_set(&[9]))),
            )))),
        ];
        for t in trees {
            let once = t.clone().simplify();
            let twice = once.clone().simplify();
            assert_eq!(once, twice, "not a fixed point: {:?}", t);
        }
    }

    #[test]
    fn uid_and_unseen_sql_shape() {
        flags::add(5, "\\Seen");

        let selector = Selector::And(vec![
            uid_set(&[2, 4, 6]),
            Selector::Not(Box::new(Selector::Flag("\\Seen".to_owned()))),
        ])
        .simplify();

        let program = selector.to_sql(&SqlOptions {
            mailbox_id: 17,
            deleted: false,
            tsearch_config: None,
            sort: Vec::new(),
        });

        assert_eq!(
            "select mm.uid, mm.modseq, mm.message \
             from mailbox_messages mm \
             left join flags f1 on (mm.mailbox=f1.mailbox \
             and mm.uid=f1.uid and f1.flag=$3) \
             where mm.mailbox=$1 \
             and (mm.uid = ANY($2) and f1.flag is null) \
             order by mm.uid",
            normalise(&program.sql),
        );
        assert_eq!(Value::from(17u32), program.binds[0]);
        assert_eq!(Value::IntSet(vec![2, 4, 6]), program.binds[1]);
        assert_eq!(Value::from(5u32), program.binds[2]);
    }

    #[test]
    fn placeholders_match_binds() {
        flags::add(5, "\\Seen");
        let selector = Selector::And(vec![
            Selector::Header {
                field: "Subject".to_owned(),
                value: "hi".to_owned(),
            },
            Selector::Larger(1024),
            Selector::Sent {
                rel: DateRel::Since,
                date: NaiveDate::from_ymd_opt(2009, 2, 13).unwrap(),
            },
        ]);
        let program =
            selector.to_sql(&SqlOptions::for_mailbox(3));

        // Every $n in the SQL corresponds to exactly one bind.
        let mut referenced: Vec<u16> = Vec::new();
        let re = regex::Regex::new(r"\$([0-9]+)").unwrap();
        for cap in re.captures_iter(&program.sql) {
            referenced.push(cap[1].parse().unwrap());
        }
        referenced.sort_unstable();
        referenced.dedup();
        assert_eq!(
            (1..=program.binds.len() as u16).collect::<Vec<_>>(),
            referenced,
        );
    }

    #[test]
    fn address_or_lift() {
        let value = "strange@example.com";
        let selector = Selector::Or(vec![
            Selector::Address {
                field: AddressField::From,
                value: value.to_owned(),
            },
            Selector::Address {
                field: AddressField::To,
                value: value.to_owned(),
            },
            Selector::Address {
                field: AddressField::Cc,
                value: value.to_owned(),
            },
        ]);
        let program =
            selector.to_sql(&SqlOptions::for_mailbox(1));

        // One join pair, not three.
        assert_eq!(
            1,
            program.sql.matches("join address_fields").count(),
        );
        assert!(program.sql.contains("af1.field in ("));
        // Split at @ into exact localpart/domain constraints.
        assert!(program.sql.contains("lower(a1.localpart)=$"));
        assert!(program.sql.contains("lower(a1.domain)=$"));
        assert!(program
            .binds
            .contains(&Value::from("strange".to_owned())));
        assert!(program
            .binds
            .contains(&Value::from("example.com".to_owned())));
    }

    #[test]
    fn address_without_at_is_substring_search() {
        let selector = Selector::Address {
            field: AddressField::From,
            value: "jones".to_owned(),
        };
        let program =
            selector.to_sql(&SqlOptions::for_mailbox(1));
        assert!(program.sql.contains("a1.name ilike '%'||$"));
        assert!(program.sql.contains("a1.localpart ilike"));
        assert!(program.sql.contains("a1.domain ilike"));
    }

    #[test]
    fn body_uses_tsvector_with_ilike_guard_when_indexed() {
        let selector = Selector::Body("archiving".to_owned());
        let program = selector.to_sql(&SqlOptions {
            mailbox_id: 1,
            deleted: false,
            tsearch_config: Some("english".to_owned()),
            sort: Vec::new(),
        });
        assert!(program.sql.contains(
            "to_tsvector('english', bp.text) @@ plainto_tsquery($2)"
        ));
        assert!(program.sql.contains("bp.text ilike '%'||$2||'%'"));
        assert!(program.sql.contains("join part_numbers pn"));
        assert!(program.sql.contains("join bodyparts bp"));

        let program = Selector::Body("archiving".to_owned())
            .to_sql(&SqlOptions {
                mailbox_id: 1,
                deleted: false,
                tsearch_config: None,
                sort: Vec::new(),
            });
        assert!(!program.sql.contains("to_tsvector"));
        assert!(program.sql.contains("bp.text ilike"));
    }

    #[test]
    fn deleted_messages_table_is_used_for_expunged_searches() {
        let program = uid_set(&[1]).to_sql(&SqlOptions {
            mailbox_id: 1,
            deleted: true,
            tsearch_config: None,
            sort: Vec::new(),
        });
        assert!(program
            .sql
            .contains("from deleted_messages mm"));
    }

    #[test]
    fn sort_joins_are_mirrored_into_select_list() {
        let program = Selector::All.to_sql(&SqlOptions {
            mailbox_id: 1,
            deleted: false,
            tsearch_config: None,
            sort: vec![
                SortCriterion {
                    reverse: true,
                    key: SortKey::Date,
                },
                SortCriterion {
                    reverse: false,
                    key: SortKey::Subject,
                },
            ],
        });
        let sql = normalise(&program.sql);
        assert!(sql.starts_with(
            "select distinct mm.uid, mm.modseq, mm.message, \
             sddf.value, sst.subject from mailbox_messages mm"
        ));
        assert!(sql.contains("join date_fields sddf"));
        assert!(sql.contains("left join threads sst"));
        assert!(sql.ends_with("order by sddf.value desc, sst.subject"));
    }
}
