//! Shell-style glob patterns used by the auto-accept rules.
//!
//! Semantics follow `fnmatch`: `*` matches any run of characters (including
//! `/`), `?` matches exactly one character, `[...]` and `[!...]` are character
//! classes, everything else is literal. Matching is case-insensitive and always
//! spans the whole input.

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let translated = translate(pattern);
        let regex = Regex::new(&translated)
            .with_context(|| format!("compile glob pattern '{pattern}'"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?is)^");
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push_str(&translate_class(&chars[i..end]));
                    i = end + 1;
                }
                // An unterminated class is a literal bracket.
                None => out.push_str(r"\["),
            },
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }

    out.push('$');
    out
}

/// Index of the `]` closing a class that opens just before `start`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    // A leading `]` is part of the class.
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() {
        if chars[j] == ']' {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn translate_class(body: &[char]) -> String {
    let mut out = String::from("[");
    let mut rest = body;
    if let Some((&'!', tail)) = rest.split_first() {
        out.push('^');
        rest = tail;
    }
    for &c in rest {
        match c {
            '\\' | '[' | ']' | '^' | '&' | '~' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::new(p).expect("pattern")
    }

    #[test]
    fn star_spans_path_separators() {
        assert!(glob("*.env").matches("config/prod/.env"));
        assert!(glob("*.env").matches("settings.ENV"));
        assert!(!glob("*.env").matches("settings.env.bak"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(glob("file?.rs").matches("file1.rs"));
        assert!(!glob("file?.rs").matches("file12.rs"));
    }

    #[test]
    fn classes_and_negated_classes() {
        assert!(glob("v[0-9].txt").matches("v3.txt"));
        assert!(!glob("v[!0-9].txt").matches("v3.txt"));
        assert!(glob("v[!0-9].txt").matches("vx.txt"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(glob("a+b(c).txt").matches("a+b(c).txt"));
        assert!(!glob("a.b").matches("axb"));
        assert!(glob("[oops").matches("[oops"));
    }

    #[test]
    fn wrapped_wildcards_match_inside_commands() {
        assert!(glob("*rm -rf*").matches(r#"{"command":"rm -rf /"}"#));
        assert!(glob("*secret*").matches("src/SECRET_keys.rs"));
    }
}
