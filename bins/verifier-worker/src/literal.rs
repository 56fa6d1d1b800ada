/// Python Literal Rendering and Parsing
///
/// Test data arrives as JSON but is consumed by Python programs, and expected
/// values are compared against text a Python program printed. This module
/// renders JSON values the way Python would print them:
/// - `repr`: source text of an equivalent Python literal (embedded in drivers)
/// - `str`: what `print(value)` would show (used for comparisons and previews)
///
/// It also parses the small literal grammar upstream data uses for list-shaped
/// expected outputs (`"[1, 'a', (2, 3)]"`), which is what lets those
/// expectations be compared line by line.
use serde_json::{Map, Number, Value};

/// Python source text for `value`.
pub fn python_repr(value: &Value) -> String {
    let mut out = String::new();
    write_repr(value, &mut out);
    out
}

/// Text `print(value)` would produce. Strings are shown raw.
pub fn python_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => python_repr(other),
    }
}

fn write_repr(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => out.push_str(&number_repr(n)),
        Value::String(s) => out.push_str(&string_repr(s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_dict(map, out),
    }
}

fn write_dict(map: &Map<String, Value>, out: &mut String) {
    out.push('{');
    for (i, (key, item)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&string_repr(key));
        out.push_str(": ");
        write_repr(item, out);
    }
    out.push('}');
}

/// Integers keep every digit, whatever their size.
fn number_repr(n: &Number) -> String {
    let text = n.to_string();
    if n.is_i64() || n.is_u64() || !text.contains(['.', 'e', 'E']) {
        return text;
    }
    match n.as_f64() {
        Some(f) => float_repr(f),
        None => text,
    }
}

/// Shortest round-trip digits, laid out the way Python's `repr(float)` does:
/// positional for exponents in [-4, 16), scientific otherwise, and always a
/// fractional part in positional form.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    // `{:e}` yields the shortest digits, e.g. "-1.2345e-5"
    let sci = format!("{:e}", value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        let point = exponent + 1;
        let body = if point <= 0 {
            format!("0.{}{}", "0".repeat((-point) as usize), digits)
        } else if point as usize >= digits.len() {
            format!("{}{}.0", digits, "0".repeat(point as usize - digits.len()))
        } else {
            let (int, frac) = digits.split_at(point as usize);
            format!("{}.{}", int, frac)
        };
        format!("{}{}", sign, body)
    } else {
        let (first, rest) = digits.split_at(1);
        let mantissa = if rest.is_empty() {
            first.to_string()
        } else {
            format!("{}.{}", first, rest)
        };
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", sign, mantissa, exp_sign, exponent.abs())
    }
}

/// Python `repr` of a string: single quotes unless the text contains a single
/// quote and no double quote.
pub fn string_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };

    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// A parsed Python literal. Integers keep their digits so arbitrarily large
/// values print back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(String),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    pub fn repr(&self) -> String {
        match self {
            Literal::None => "None".to_string(),
            Literal::Bool(true) => "True".to_string(),
            Literal::Bool(false) => "False".to_string(),
            Literal::Int(digits) => digits.clone(),
            Literal::Float(f) => float_repr(*f),
            Literal::Str(s) => string_repr(s),
            Literal::List(items) => format!("[{}]", join_repr(items)),
            Literal::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Literal::Tuple(items) => format!("({})", join_repr(items)),
            Literal::Dict(entries) => {
                let body: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
        }
    }

    pub fn to_display(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            other => other.repr(),
        }
    }
}

fn join_repr(items: &[Literal]) -> String {
    items.iter().map(Literal::repr).collect::<Vec<_>>().join(", ")
}

/// Parse a complete Python literal. Returns `None` on anything outside the
/// supported grammar or on trailing input.
pub fn parse_literal(text: &str) -> Option<Literal> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos == parser.chars.len() {
        Some(value)
    } else {
        None
    }
}

/// Expected stdout written as a list literal is compared one element per line.
pub fn rejoin_list_literal(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('[') && trimmed.ends_with(']')) {
        return None;
    }
    match parse_literal(trimmed)? {
        Literal::List(items) => Some(
            items
                .iter()
                .map(Literal::to_display)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Literal> {
        self.skip_ws();
        match self.peek()? {
            '[' => {
                self.pos += 1;
                self.sequence(']').map(|(items, _)| Literal::List(items))
            }
            '(' => {
                self.pos += 1;
                let (items, trailing_comma) = self.sequence(')')?;
                // `(x)` is just a parenthesized value
                if items.len() == 1 && !trailing_comma {
                    items.into_iter().next()
                } else {
                    Some(Literal::Tuple(items))
                }
            }
            '{' => {
                self.pos += 1;
                self.dict()
            }
            '\'' | '"' => self.string(),
            c if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
            c if c.is_alphabetic() || c == '_' => self.word(),
            _ => None,
        }
    }

    /// Comma-separated values up to `close`. Reports whether a trailing comma
    /// was present.
    fn sequence(&mut self, close: char) -> Option<(Vec<Literal>, bool)> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if self.eat(close) {
                return Some((items, trailing_comma));
            }
            items.push(self.value()?);
            trailing_comma = false;
            if self.eat(',') {
                trailing_comma = true;
                continue;
            }
            if self.eat(close) {
                return Some((items, trailing_comma));
            }
            return None;
        }
    }

    fn dict(&mut self) -> Option<Literal> {
        let mut entries = Vec::new();
        loop {
            if self.eat('}') {
                return Some(Literal::Dict(entries));
            }
            let key = self.value()?;
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            entries.push((key, value));
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                return Some(Literal::Dict(entries));
            }
            return None;
        }
    }

    fn word(&mut self) -> Option<Literal> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "None" => Some(Literal::None),
            "True" => Some(Literal::Bool(true)),
            "False" => Some(Literal::Bool(false)),
            _ => None,
        }
    }

    fn number(&mut self) -> Option<Literal> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    if matches!(self.chars.get(self.pos + 1), Some('-' | '+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
            self.pos += 1;
        }

        let raw: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            raw.parse::<f64>().ok().map(Literal::Float)
        } else {
            normalize_int(&raw).map(Literal::Int)
        }
    }

    fn string(&mut self) -> Option<Literal> {
        let quote = self.peek()?;
        let triple = self.chars.get(self.pos + 1) == Some(&quote)
            && self.chars.get(self.pos + 2) == Some(&quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let c = self.peek()?;
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.chars.get(self.pos + 1) == Some(&quote)
                    && self.chars.get(self.pos + 2) == Some(&quote)
                {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' && !triple {
                return None;
            }
            self.pos += 1;
            if c == '\\' {
                out.push_str(&self.escape()?);
            } else {
                out.push(c);
            }
        }

        // adjacent literals concatenate
        self.skip_ws();
        if matches!(self.peek(), Some('\'' | '"')) {
            if let Some(Literal::Str(next)) = self.string() {
                out.push_str(&next);
            } else {
                return None;
            }
        }
        Some(Literal::Str(out))
    }

    fn escape(&mut self) -> Option<String> {
        let c = self.peek()?;
        self.pos += 1;
        let decoded = match c {
            'n' => "\n".to_string(),
            't' => "\t".to_string(),
            'r' => "\r".to_string(),
            '0' => "\0".to_string(),
            '\\' | '\'' | '"' => c.to_string(),
            '\n' => String::new(),
            'x' => self.hex_escape(2)?,
            'u' => self.hex_escape(4)?,
            'U' => self.hex_escape(8)?,
            // unknown escapes keep the backslash
            other => format!("\\{}", other),
        };
        Some(decoded)
    }

    fn hex_escape(&mut self, len: usize) -> Option<String> {
        let end = self.pos + len;
        let hex: String = self.chars.get(self.pos..end)?.iter().collect();
        self.pos = end;
        let code = u32::from_str_radix(&hex, 16).ok()?;
        char::from_u32(code).map(|c| c.to_string())
    }
}

fn normalize_int(raw: &str) -> Option<String> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let trimmed = digits.trim_start_matches('0');
    let magnitude = if trimmed.is_empty() { "0" } else { trimmed };
    if negative && magnitude != "0" {
        Some(format!("-{}", magnitude))
    } else {
        Some(magnitude.to_string())
    }
}
