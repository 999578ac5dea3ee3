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

//! Subject-based message threading.
//!
//! The "base subject" is the subject with reply/forward noise stripped,
//! per the RFC 5256 algorithm: leading `re:`/`fw:`/`fwd:` markers
//! (optionally with a `[blob]` between them and the colon), trailing
//! `(fwd)`, and surrounding whitespace all go, repeatedly, until the
//! subject stops changing.

use std::collections::HashMap;

/// Index from base subject to the UIDs carrying it.
#[derive(Default)]
pub struct Threader {
    threads: HashMap<String, Vec<u32>>,
}

impl Threader {
    pub fn new() -> Self {
        Threader::default()
    }

    pub fn note(&mut self, uid: u32, subject: &str) {
        self.threads
            .entry(base_subject(subject))
            .or_insert_with(Vec::new)
            .push(uid);
    }

    pub fn thread_of(&self, subject: &str) -> Option<&[u32]> {
        self.threads
            .get(&base_subject(subject))
            .map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.threads.clear();
    }
}

/// Strips reply/forward artifacts from `subject`.
pub fn base_subject(subject: &str) -> String {
    let mut s = collapse_whitespace(subject);

    loop {
        let before = s.len();

        // Trailing "(fwd)"
        let trimmed = s.trim_end();
        if trimmed.to_ascii_lowercase().ends_with("(fwd)") {
            s = trimmed[..trimmed.len() - 5].trim_end().to_owned();
        }

        // Leading re/fw/fwd, optionally "[blob]", then ":"
        s = strip_leading_marker(&s);

        // A leading "[blob]" goes, but never down to an empty subject.
        if s.starts_with('[') {
            if let Some(close) = s.find(']') {
                let rest = s[close + 1..].trim_start();
                if !rest.is_empty() {
                    s = rest.to_owned();
                }
            }
        }

        if s.len() == before {
            break;
        }
    }

    s.trim().to_ascii_lowercase()
}

fn strip_leading_marker(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    let rest = if lower.starts_with("re") {
        &s[2..]
    } else if lower.starts_with("fwd") {
        &s[3..]
    } else if lower.starts_with("fw") {
        &s[2..]
    } else {
        return s.to_owned();
    };

    let mut rest = rest.trim_start();
    // Optional [blob] between the marker and the colon
    if rest.starts_with('[') {
        match rest.find(']') {
            Some(close) => rest = rest[close + 1..].trim_start(),
            None => return s.to_owned(),
        }
    }

    if let Some(stripped) = rest.strip_prefix(':') {
        stripped.trim_start().to_owned()
    } else {
        s.to_owned()
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_reply_markers() {
        assert_eq!("hello", base_subject("Re: hello"));
        assert_eq!("hello", base_subject("RE: Re: re: hello"));
        assert_eq!("hello", base_subject("Fwd: hello"));
        assert_eq!("hello", base_subject("FW: hello"));
        assert_eq!("hello", base_subject("hello (fwd)"));
        assert_eq!("hello", base_subject("Re: [list] hello"));
    }

    #[test]
    fn does_not_eat_real_words() {
        assert_eq!("rezoning plan", base_subject("Rezoning plan"));
        assert_eq!("forward thinking", base_subject("Forward thinking"));
    }

    #[test]
    fn collapses_whitespace_and_folds_case() {
        assert_eq!("a b c", base_subject("  A   b\t\tC  "));
    }

    #[test]
    fn groups_by_base_subject() {
        let mut threader = Threader::new();
        threader.note(1, "Discussion");
        threader.note(2, "Re: Discussion");
        threader.note(3, "Re: Re: discussion");
        threader.note(4, "Other");
        assert_eq!(Some(&[1, 2, 3][..]), threader.thread_of("discussion"));
        assert_eq!(Some(&[4][..]), threader.thread_of("Re: Other"));
        assert_eq!(None, threader.thread_of("Unseen"));
    }
}
