//! Static pre-execution check for forbidden dynamic-evaluation calls.
//!
//! Flags bare-name calls such as `eval(...)` or `vars()`. Attribute calls
//! (`re.compile(...)`) and definitions (`def eval(...)`) are not flagged, and
//! text inside comments and string literals is ignored.
//!
//! This scan is bypassable (`getattr(builtins, "ev" + "al")` gets through).
//! The enforcing layers are the restricted builtins installed by the
//! bootstrap and the OS limits applied to the process.

use thiserror::Error;

pub const FORBIDDEN_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("call to '{name}' is not allowed (line {line})")]
pub struct Violation {
    pub name: String,
    pub line: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Prev {
    Dot,
    Definition,
    Other,
}

pub fn scan(source: &str) -> Result<(), Violation> {
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut line = 1;
    let mut prev = Prev::Other;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                i = skip_string(&chars, i, &mut line);
                prev = Prev::Other;
            }
            '.' => {
                prev = Prev::Dot;
                i += 1;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_continue(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();

                if i < chars.len() && matches!(chars[i], '\'' | '"') && is_string_prefix(&word) {
                    i = skip_string(&chars, i, &mut line);
                    prev = Prev::Other;
                    continue;
                }

                if prev == Prev::Other
                    && FORBIDDEN_CALLS.contains(&word.as_str())
                    && next_is_call(&chars, i)
                {
                    return Err(Violation { name: word, line });
                }

                prev = match word.as_str() {
                    "def" | "class" => Prev::Definition,
                    _ => Prev::Other,
                };
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                prev = Prev::Other;
                i += 1;
            }
        }
    }

    Ok(())
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "t" | "br" | "rb" | "fr" | "rf" | "tr" | "rt"
    )
}

fn next_is_call(chars: &[char], mut i: usize) -> bool {
    while i < chars.len() {
        match chars[i] {
            '(' => return true,
            '\\' => i += 1,
            c if c.is_whitespace() => {}
            _ => return false,
        }
        i += 1;
    }
    false
}

/// Returns the index just past the literal starting at `start`.
fn skip_string(chars: &[char], start: usize, line: &mut usize) -> usize {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if chars.get(i + 1) == Some(&'\n') {
                    *line += 1;
                }
                i += 2;
                continue;
            }
            '\n' => {
                *line += 1;
                if !triple {
                    // unterminated single-quoted literal
                    return i + 1;
                }
            }
            c if c == quote => {
                if !triple {
                    return i + 1;
                }
                if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                    return i + 3;
                }
            }
            _ => {}
        }
        i += 1;
    }

    chars.len()
}
