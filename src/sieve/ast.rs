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

//! The parsed form of a Sieve script.
//!
//! `Display` renders the canonical pretty-printed form; parsing that
//! form again yields an isomorphic tree, which is what the script
//! storage layer relies on.

use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub struct Script {
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Require(Vec<String>),
    If {
        arms: Vec<(Test, Vec<Command>)>,
        otherwise: Option<Vec<Command>>,
    },
    Stop,
    Keep,
    Discard,
    FileInto(String),
    Redirect(String),
    Reject(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Is,
    Contains,
    Matches,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    Octet,
    AsciiCasemap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressPart {
    All,
    Localpart,
    Domain,
    User,
    Detail,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Test {
    Address {
        part: AddressPart,
        comparator: Comparator,
        match_type: MatchType,
        headers: Vec<String>,
        keys: Vec<String>,
    },
    Envelope {
        part: AddressPart,
        comparator: Comparator,
        match_type: MatchType,
        parts: Vec<String>,
        keys: Vec<String>,
    },
    Header {
        comparator: Comparator,
        match_type: MatchType,
        headers: Vec<String>,
        keys: Vec<String>,
    },
    Exists(Vec<String>),
    Size {
        over: bool,
        limit: u64,
    },
    Body {
        comparator: Comparator,
        match_type: MatchType,
        keys: Vec<String>,
    },
    AllOf(Vec<Test>),
    AnyOf(Vec<Test>),
    Not(Box<Test>),
    True,
    False,
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for command in &self.commands {
            write_command(f, command, 0)?;
        }
        Ok(())
    }
}

fn indent(f: &mut fmt::Formatter, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        write!(f, "    ")?;
    }
    Ok(())
}

fn write_command(
    f: &mut fmt::Formatter,
    command: &Command,
    depth: usize,
) -> fmt::Result {
    indent(f, depth)?;
    match *command {
        Command::Require(ref extensions) => {
            write!(f, "require ")?;
            write_string_list(f, extensions)?;
            writeln!(f, ";")
        },
        Command::If {
            ref arms,
            ref otherwise,
        } => {
            for (ix, (test, body)) in arms.iter().enumerate() {
                if 0 != ix {
                    indent(f, depth)?;
                }
                write!(
                    f,
                    "{} ",
                    if 0 == ix { "if" } else { "elsif" },
                )?;
                write_test(f, test)?;
                writeln!(f, " {{")?;
                for command in body {
                    write_command(f, command, depth + 1)?;
                }
                indent(f, depth)?;
                writeln!(f, "}}")?;
            }
            if let Some(ref body) = *otherwise {
                indent(f, depth)?;
                writeln!(f, "else {{")?;
                for command in body {
                    write_command(f, command, depth + 1)?;
                }
                indent(f, depth)?;
                writeln!(f, "}}")?;
            }
            Ok(())
        },
        Command::Stop => writeln!(f, "stop;"),
        Command::Keep => writeln!(f, "keep;"),
        Command::Discard => writeln!(f, "discard;"),
        Command::FileInto(ref mailbox) => {
            writeln!(f, "fileinto {};", quoted(mailbox))
        },
        Command::Redirect(ref address) => {
            writeln!(f, "redirect {};", quoted(address))
        },
        Command::Reject(ref message) => {
            writeln!(f, "reject {};", quoted(message))
        },
    }
}

fn write_test(f: &mut fmt::Formatter, test: &Test) -> fmt::Result {
    match *test {
        Test::Address {
            part,
            comparator,
            match_type,
            ref headers,
            ref keys,
        } => {
            write!(f, "address")?;
            write_address_part(f, part)?;
            write_comparator(f, comparator)?;
            write_match_type(f, match_type)?;
            write!(f, " ")?;
            write_string_list(f, headers)?;
            write!(f, " ")?;
            write_string_list(f, keys)
        },
        Test::Envelope {
            part,
            comparator,
            match_type,
            ref parts,
            ref keys,
        } => {
            write!(f, "envelope")?;
            write_address_part(f, part)?;
            write_comparator(f, comparator)?;
            write_match_type(f, match_type)?;
            write!(f, " ")?;
            write_string_list(f, parts)?;
            write!(f, " ")?;
            write_string_list(f, keys)
        },
        Test::Header {
            comparator,
            match_type,
            ref headers,
            ref keys,
        } => {
            write!(f, "header")?;
            write_comparator(f, comparator)?;
            write_match_type(f, match_type)?;
            write!(f, " ")?;
            write_string_list(f, headers)?;
            write!(f, " ")?;
            write_string_list(f, keys)
        },
        Test::Exists(ref headers) => {
            write!(f, "exists ")?;
            write_string_list(f, headers)
        },
        Test::Size { over, limit } => write!(
            f,
            "size :{} {}",
            if over { "over" } else { "under" },
            limit,
        ),
        Test::Body {
            comparator,
            match_type,
            ref keys,
        } => {
            write!(f, "body")?;
            write_comparator(f, comparator)?;
            write_match_type(f, match_type)?;
            write!(f, " ")?;
            write_string_list(f, keys)
        },
        Test::AllOf(ref tests) => {
            write!(f, "allof (")?;
            write_test_list(f, tests)?;
            write!(f, ")")
        },
        Test::AnyOf(ref tests) => {
            write!(f, "anyof (")?;
            write_test_list(f, tests)?;
            write!(f, ")")
        },
        Test::Not(ref inner) => {
            write!(f, "not ")?;
            write_test(f, inner)
        },
        Test::True => write!(f, "true"),
        Test::False => write!(f, "false"),
    }
}

fn write_test_list(
    f: &mut fmt::Formatter,
    tests: &[Test],
) -> fmt::Result {
    for (ix, test) in tests.iter().enumerate() {
        if 0 != ix {
            write!(f, ", ")?;
        }
        write_test(f, test)?;
    }
    Ok(())
}

fn write_address_part(
    f: &mut fmt::Formatter,
    part: AddressPart,
) -> fmt::Result {
    match part {
        AddressPart::All => Ok(()), // the default is not spelled out
        AddressPart::Localpart => write!(f, " :localpart"),
        AddressPart::Domain => write!(f, " :domain"),
        AddressPart::User => write!(f, " :user"),
        AddressPart::Detail => write!(f, " :detail"),
    }
}

fn write_comparator(
    f: &mut fmt::Formatter,
    comparator: Comparator,
) -> fmt::Result {
    match comparator {
        // i;ascii-casemap is the default and is not spelled out.
        Comparator::AsciiCasemap => Ok(()),
        Comparator::Octet => write!(f, " :comparator \"i;octet\""),
    }
}

fn write_match_type(
    f: &mut fmt::Formatter,
    match_type: MatchType,
) -> fmt::Result {
    match match_type {
        MatchType::Is => Ok(()), // the default is not spelled out
        MatchType::Contains => write!(f, " :contains"),
        MatchType::Matches => write!(f, " :matches"),
    }
}

fn write_string_list(
    f: &mut fmt::Formatter,
    strings: &[String],
) -> fmt::Result {
    if 1 == strings.len() {
        return write!(f, "{}", quoted(&strings[0]));
    }
    write!(f, "[")?;
    for (ix, s) in strings.iter().enumerate() {
        if 0 != ix {
            write!(f, ", ")?;
        }
        write!(f, "{}", quoted(s))?;
    }
    write!(f, "]")
}

pub(super) fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
