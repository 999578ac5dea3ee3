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

//! Recursive-descent parser for the Sieve language (RFC 5228).
//!
//! `require` must precede all other commands and must declare every
//! extension the script goes on to use; declaring an extension and then
//! not using it is equally a parse error, so a stored script's
//! requirements are always exact.

use std::collections::HashSet;
use std::fmt;

use super::ast::*;

/// Extensions this implementation knows.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["body", "envelope", "fileinto", "reject", "subaddress"];

#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    /// Byte offset of the offending token.
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} near position {}", self.message, self.position)
    }
}

pub fn parse(source: &str) -> Result<Script, ParseError> {
    let mut parser = Parser {
        input: source.as_bytes(),
        pos: 0,
        declared: HashSet::new(),
        used: HashSet::new(),
    };
    let commands = parser.commands(true)?;
    parser.skip_noise();
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing garbage"));
    }

    for declared in &parser.declared {
        if !parser.used.contains(declared) {
            return Err(ParseError {
                position: 0,
                message: format!(
                    "\"{}\" required but not used",
                    declared,
                ),
            });
        }
    }

    Ok(Script { commands })
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    declared: HashSet<String>,
    used: HashSet<String>,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn expected(&self, what: &str) -> ParseError {
        let found = match self.input.get(self.pos) {
            Some(&c) => format!("{:?}", c as char),
            None => "end of script".to_owned(),
        };
        self.error(format!("expected {}, found {}", what, found))
    }

    /// Skips whitespace and both comment forms.
    fn skip_noise(&mut self) {
        loop {
            match self.input.get(self.pos) {
                Some(b' ') | Some(b'\t') | Some(b'\r')
                | Some(b'\n') => self.pos += 1,
                Some(b'#') => {
                    while self
                        .input
                        .get(self.pos)
                        .map_or(false, |&c| c != b'\n')
                    {
                        self.pos += 1;
                    }
                },
                Some(b'/')
                    if Some(&b'*') == self.input.get(self.pos + 1) =>
                {
                    self.pos += 2;
                    while self.pos + 1 < self.input.len()
                        && &self.input[self.pos..self.pos + 2] != b"*/"
                    {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.input.len());
                },
                _ => break,
            }
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        self.skip_noise();
        if Some(&c) == self.input.get(self.pos) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn require_char(&mut self, c: u8) -> Result<(), ParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.expected(&format!("{:?}", c as char)))
        }
    }

    fn peek_char(&mut self) -> Option<u8> {
        self.skip_noise();
        self.input.get(self.pos).copied()
    }

    fn identifier(&mut self) -> Result<String, ParseError> {
        self.skip_noise();
        let start = self.pos;
        while self.input.get(self.pos).map_or(false, |&c| {
            c.is_ascii_alphanumeric() || b'_' == c
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.expected("identifier"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .to_ascii_lowercase())
    }

    fn tag(&mut self) -> Result<String, ParseError> {
        self.require_char(b':')?;
        self.identifier()
    }

    fn number(&mut self) -> Result<u64, ParseError> {
        self.skip_noise();
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .map_or(false, u8::is_ascii_digit)
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.expected("number"));
        }
        let mut value: u64 =
            String::from_utf8_lossy(&self.input[start..self.pos])
                .parse()
                .map_err(|_| self.error("number out of range"))?;
        match self.input.get(self.pos) {
            Some(b'K') | Some(b'k') => {
                value = value.saturating_mul(1024);
                self.pos += 1;
            },
            Some(b'M') | Some(b'm') => {
                value = value.saturating_mul(1024 * 1024);
                self.pos += 1;
            },
            Some(b'G') | Some(b'g') => {
                value = value.saturating_mul(1024 * 1024 * 1024);
                self.pos += 1;
            },
            _ => (),
        }
        Ok(value)
    }

    fn string(&mut self) -> Result<String, ParseError> {
        self.skip_noise();
        match self.input.get(self.pos) {
            Some(b'"') => self.quoted_string(),
            Some(b't')
                if self.input[self.pos..].starts_with(b"text:") =>
            {
                self.multiline_string()
            },
            _ => Err(self.expected("string")),
        }
    }

    fn quoted_string(&mut self) -> Result<String, ParseError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.input.get(self.pos) {
                None => {
                    return Err(self.error("unterminated string"))
                },
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                },
                Some(b'\\') => {
                    self.pos += 1;
                    match self.input.get(self.pos) {
                        Some(&c) => {
                            out.push(c as char);
                            self.pos += 1;
                        },
                        None => {
                            return Err(
                                self.error("unterminated escape")
                            )
                        },
                    }
                },
                Some(&c) => {
                    out.push(c as char);
                    self.pos += 1;
                },
            }
        }
    }

    fn multiline_string(&mut self) -> Result<String, ParseError> {
        self.pos += 5; // "text:"
        // Skip to the end of the line.
        while self
            .input
            .get(self.pos)
            .map_or(false, |&c| c != b'\n')
        {
            self.pos += 1;
        }
        self.pos = (self.pos + 1).min(self.input.len());

        let mut out = String::new();
        loop {
            let line_start = self.pos;
            while self
                .input
                .get(self.pos)
                .map_or(false, |&c| c != b'\n')
            {
                self.pos += 1;
            }
            let mut line = &self.input[line_start..self.pos];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            let at_end = self.pos >= self.input.len();
            self.pos = (self.pos + 1).min(self.input.len());

            if b"." == line {
                return Ok(out);
            }
            // Dot-stuffing
            let line = if line.starts_with(b"..") {
                &line[1..]
            } else {
                line
            };
            out.push_str(&String::from_utf8_lossy(line));
            out.push('\n');

            if at_end {
                return Err(self.error("unterminated text: block"));
            }
        }
    }

    fn string_list(&mut self) -> Result<Vec<String>, ParseError> {
        if self.eat(b'[') {
            let mut out = vec![self.string()?];
            while self.eat(b',') {
                out.push(self.string()?);
            }
            self.require_char(b']')?;
            Ok(out)
        } else {
            Ok(vec![self.string()?])
        }
    }

    fn commands(
        &mut self,
        top_level: bool,
    ) -> Result<Vec<Command>, ParseError> {
        let mut out = Vec::new();
        let mut seen_non_require = false;
        loop {
            self.skip_noise();
            match self.peek_char() {
                None => break,
                Some(b'}') if !top_level => break,
                Some(_) => (),
            }

            let pos = self.pos;
            let name = self.identifier()?;
            let command = match name.as_str() {
                "require" => {
                    if !top_level || seen_non_require {
                        self.pos = pos;
                        return Err(self.error(
                            "require must come before any other \
                             command",
                        ));
                    }
                    let extensions = self.string_list()?;
                    for extension in &extensions {
                        let extension =
                            extension.to_ascii_lowercase();
                        if !SUPPORTED_EXTENSIONS
                            .contains(&extension.as_str())
                        {
                            self.pos = pos;
                            return Err(self.error(format!(
                                "unsupported extension \"{}\"",
                                extension,
                            )));
                        }
                        self.declared.insert(extension);
                    }
                    self.require_char(b';')?;
                    Command::Require(extensions)
                },
                "if" => {
                    seen_non_require = true;
                    self.if_command()?
                },
                "stop" => {
                    seen_non_require = true;
                    self.require_char(b';')?;
                    Command::Stop
                },
                "keep" => {
                    seen_non_require = true;
                    self.require_char(b';')?;
                    Command::Keep
                },
                "discard" => {
                    seen_non_require = true;
                    self.require_char(b';')?;
                    Command::Discard
                },
                "fileinto" => {
                    seen_non_require = true;
                    self.use_extension("fileinto", pos)?;
                    let mailbox = self.string()?;
                    self.require_char(b';')?;
                    Command::FileInto(mailbox)
                },
                "redirect" => {
                    seen_non_require = true;
                    let address = self.string()?;
                    self.require_char(b';')?;
                    Command::Redirect(address)
                },
                "reject" => {
                    seen_non_require = true;
                    self.use_extension("reject", pos)?;
                    let message = self.string()?;
                    self.require_char(b';')?;
                    Command::Reject(message)
                },
                other => {
                    self.pos = pos;
                    return Err(self.error(format!(
                        "unknown command \"{}\"",
                        other,
                    )));
                },
            };
            out.push(command);
        }
        Ok(out)
    }

    fn if_command(&mut self) -> Result<Command, ParseError> {
        let mut arms = Vec::new();
        let test = self.test()?;
        let body = self.block()?;
        arms.push((test, body));

        let mut otherwise = None;
        loop {
            self.skip_noise();
            let pos = self.pos;
            if self.input[self.pos..].starts_with(b"elsif") {
                self.pos += 5;
                let test = self.test()?;
                let body = self.block()?;
                arms.push((test, body));
            } else if self.input[self.pos..].starts_with(b"else") {
                self.pos += 4;
                otherwise = Some(self.block()?);
                break;
            } else {
                self.pos = pos;
                break;
            }
        }

        Ok(Command::If { arms, otherwise })
    }

    fn block(&mut self) -> Result<Vec<Command>, ParseError> {
        self.require_char(b'{')?;
        let commands = self.commands(false)?;
        self.require_char(b'}')?;
        Ok(commands)
    }

    fn test(&mut self) -> Result<Test, ParseError> {
        let pos = self.pos;
        let name = self.identifier()?;
        match name.as_str() {
            "true" => Ok(Test::True),
            "false" => Ok(Test::False),
            "not" => Ok(Test::Not(Box::new(self.test()?))),
            "allof" => Ok(Test::AllOf(self.test_list()?)),
            "anyof" => Ok(Test::AnyOf(self.test_list()?)),
            "exists" => Ok(Test::Exists(self.string_list()?)),
            "size" => {
                let over = match self.tag()?.as_str() {
                    "over" => true,
                    "under" => false,
                    _ => {
                        return Err(
                            self.error("expected :over or :under")
                        )
                    },
                };
                Ok(Test::Size {
                    over,
                    limit: self.number()?,
                })
            },
            "header" => {
                let (_, comparator, match_type) =
                    self.match_modifiers(pos)?;
                Ok(Test::Header {
                    comparator,
                    match_type,
                    headers: self.string_list()?,
                    keys: self.string_list()?,
                })
            },
            "address" => {
                let (part, comparator, match_type) =
                    self.match_modifiers(pos)?;
                Ok(Test::Address {
                    part,
                    comparator,
                    match_type,
                    headers: self.string_list()?,
                    keys: self.string_list()?,
                })
            },
            "envelope" => {
                self.use_extension("envelope", pos)?;
                let (part, comparator, match_type) =
                    self.match_modifiers(pos)?;
                Ok(Test::Envelope {
                    part,
                    comparator,
                    match_type,
                    parts: self.string_list()?,
                    keys: self.string_list()?,
                })
            },
            "body" => {
                self.use_extension("body", pos)?;
                let (_, comparator, match_type) =
                    self.match_modifiers(pos)?;
                Ok(Test::Body {
                    comparator,
                    match_type,
                    keys: self.string_list()?,
                })
            },
            other => {
                self.pos = pos;
                Err(self.error(format!(
                    "unknown test \"{}\"",
                    other,
                )))
            },
        }
    }

    fn test_list(&mut self) -> Result<Vec<Test>, ParseError> {
        self.require_char(b'(')?;
        let mut out = vec![self.test()?];
        while self.eat(b',') {
            out.push(self.test()?);
        }
        self.require_char(b')')?;
        Ok(out)
    }

    /// Parses the optional address-part, :comparator and match-type tags
    /// in any order.
    fn match_modifiers(
        &mut self,
        command_pos: usize,
    ) -> Result<(AddressPart, Comparator, MatchType), ParseError>
    {
        let mut part = AddressPart::All;
        let mut comparator = Comparator::AsciiCasemap;
        let mut match_type = MatchType::Is;

        while Some(b':') == self.peek_char() {
            let pos = self.pos;
            let tag = self.tag()?;
            match tag.as_str() {
                "is" => match_type = MatchType::Is,
                "contains" => match_type = MatchType::Contains,
                "matches" => match_type = MatchType::Matches,
                "all" => part = AddressPart::All,
                "localpart" => part = AddressPart::Localpart,
                "domain" => part = AddressPart::Domain,
                "user" => {
                    self.use_extension("subaddress", command_pos)?;
                    part = AddressPart::User;
                },
                "detail" => {
                    self.use_extension("subaddress", command_pos)?;
                    part = AddressPart::Detail;
                },
                "comparator" => {
                    let name = self.string()?;
                    comparator = match name
                        .to_ascii_lowercase()
                        .as_str()
                    {
                        "i;octet" => Comparator::Octet,
                        "i;ascii-casemap" => Comparator::AsciiCasemap,
                        other => {
                            return Err(self.error(format!(
                                "unknown comparator \"{}\"",
                                other,
                            )))
                        },
                    };
                },
                other => {
                    self.pos = pos;
                    return Err(self.error(format!(
                        "unknown tag \":{}\"",
                        other,
                    )));
                },
            }
        }

        Ok((part, comparator, match_type))
    }

    fn use_extension(
        &mut self,
        extension: &str,
        pos: usize,
    ) -> Result<(), ParseError> {
        self.used.insert(extension.to_owned());
        if self.declared.contains(extension) {
            Ok(())
        } else {
            Err(ParseError {
                position: pos,
                message: format!(
                    "\"{}\" used without require",
                    extension,
                ),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_script() {
        let script = parse(
            "require [\"fileinto\"]; fileinto \"saved\";",
        )
        .unwrap();
        assert_eq!(
            vec![
                Command::Require(vec!["fileinto".to_owned()]),
                Command::FileInto("saved".to_owned()),
            ],
            script.commands,
        );
    }

    #[test]
    fn parses_if_elsif_else() {
        let script = parse(
            r#"if header :contains "Subject" "spam" {
                   discard;
               } elsif size :over 1M {
                   stop;
               } else {
                   keep;
               }"#,
        )
        .unwrap();
        match &script.commands[0] {
            Command::If { arms, otherwise } => {
                assert_eq!(2, arms.len());
                assert_eq!(
                    vec![Command::Discard],
                    arms[0].1,
                );
                assert_matches!(
                    Test::Size {
                        over: true,
                        limit: 1048576,
                    },
                    &arms[1].0
                );
                assert_eq!(
                    Some(vec![Command::Keep]),
                    *otherwise,
                );
            },
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn comments_are_noise() {
        let script = parse(
            "# a comment\n/* another\ncomment */ keep; # done\n",
        )
        .unwrap();
        assert_eq!(vec![Command::Keep], script.commands);
    }

    #[test]
    fn multiline_strings() {
        let script = parse(
            "reject text:\nI will not read this.\n..dots stay.\n.\n;",
        );
        // reject requires "reject"
        assert_matches!(Err(_), script);

        let script = parse(
            "require \"reject\";\nreject text:\nno\n.\n;",
        )
        .unwrap();
        assert_eq!(
            vec![
                Command::Require(vec!["reject".to_owned()]),
                Command::Reject("no\n".to_owned()),
            ],
            script.commands,
        );
    }

    #[test]
    fn require_must_be_first() {
        assert_matches!(
            Err(_),
            parse("keep; require \"fileinto\";")
        );
    }

    #[test]
    fn undeclared_extension_is_an_error() {
        let err = parse("fileinto \"x\";").unwrap_err();
        assert!(err.message.contains("without require"));
    }

    #[test]
    fn unused_declaration_is_an_error() {
        let err =
            parse("require \"fileinto\"; keep;").unwrap_err();
        assert!(err.message.contains("not used"));
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let err = parse("require \"vortex\"; keep;").unwrap_err();
        assert!(err.message.contains("unsupported"));
    }

    #[test]
    fn error_carries_position() {
        let err = parse("keep; frobnicate;").unwrap_err();
        assert_eq!(6, err.position);
    }

    #[test]
    fn string_escapes() {
        let script =
            parse(r#"redirect "a\"b\\c@example.com";"#).unwrap();
        assert_eq!(
            vec![Command::Redirect("a\"b\\c@example.com".to_owned())],
            script.commands,
        );
    }

    #[test]
    fn pretty_print_round_trips() {
        let sources = [
            "require [\"fileinto\", \"envelope\"]; \
             if envelope :localpart \"to\" \"help\" \
             { fileinto \"requests\"; } \
             elsif anyof (true, not false) { keep; } \
             else { discard; }",
            "require \"body\"; \
             if body :contains [\"viagra\", \"cialis\"] \
             { discard; stop; }",
            "require [\"fileinto\"]; \
             if header :matches \"List-Id\" \"*lists.example.com*\" \
             { fileinto \"lists\"; }",
            "if size :under 10K { keep; }",
            "if address :domain :is \"from\" \"example.com\" { \
             discard; }",
            "if header :comparator \"i;octet\" \"subject\" \"X\" { \
             keep; }",
        ];
        for source in &sources {
            let script = parse(source).unwrap();
            let printed = script.to_string();
            let reparsed = parse(&printed).unwrap_or_else(|e| {
                panic!("reparse of {:?} failed: {}", printed, e)
            });
            assert_eq!(script, reparsed, "from {:?}", source);
            // And the pretty-printed form is itself a fixed point.
            assert_eq!(printed, reparsed.to_string());
        }
    }
}
