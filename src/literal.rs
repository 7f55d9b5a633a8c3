//! Permissive literal grammar for model output that is almost, but not quite, JSON.
//!
//! Accepts everything strict JSON accepts plus single-quoted strings, trailing
//! commas, `True`/`False`/`None`, tuples written with parentheses, unquoted
//! mapping keys and `#` line comments. Only literals are recognised: there is no
//! name lookup, call syntax or operator evaluation.

use serde_json::{Map, Number, Value};
use thiserror::Error;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at offset {offset}")]
pub struct LiteralError {
    pub message: String,
    pub offset: usize,
}

/// Parse `input` as a single permissive literal.
pub fn parse(input: &str) -> Result<Value, LiteralError> {
    let mut parser = LiteralParser::new(input);
    parser.skip_trivia();
    let value = parser.parse_value(0)?;
    parser.skip_trivia();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(value)
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: &str) -> LiteralError {
        LiteralError {
            message: message.to_string(),
            offset: self.pos,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, LiteralError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        match self.peek() {
            Some('{') => self.parse_mapping(depth),
            Some('[') => self.parse_sequence('[', ']', depth),
            Some('(') => self.parse_sequence('(', ')', depth),
            Some('"') | Some('\'') => self.parse_string().map(Value::String),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                self.parse_number()
            }
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_mapping(&mut self, depth: usize) -> Result<Value, LiteralError> {
        self.bump();
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = self.parse_key()?;
            self.skip_trivia();
            if self.bump() != Some(':') {
                return Err(self.error("expected ':' after mapping key"));
            }
            self.skip_trivia();
            let value = self.parse_value(depth + 1)?;
            map.insert(key, value);
            self.skip_trivia();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(self.error("expected ',' or '}' in mapping")),
            }
        }
    }

    fn parse_key(&mut self) -> Result<String, LiteralError> {
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => {
                self.parse_number().map(|n| n.to_string())
            }
            Some(c) if c.is_alphabetic() || c == '_' => Ok(self.take_identifier().to_string()),
            _ => Err(self.error("expected mapping key")),
        }
    }

    /// `(x)` is a parenthesised value, `(x,)` and `(x, y)` are sequences.
    fn parse_sequence(
        &mut self,
        open: char,
        close: char,
        depth: usize,
    ) -> Result<Value, LiteralError> {
        self.bump();
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            self.skip_trivia();
            if self.peek() == Some(close) {
                self.bump();
                break;
            }
            items.push(self.parse_value(depth + 1)?);
            self.skip_trivia();
            match self.bump() {
                Some(',') => saw_comma = true,
                Some(c) if c == close => break,
                _ => return Err(self.error("expected ',' or closing bracket in sequence")),
            }
        }
        if open == '(' && !saw_comma && items.len() == 1 {
            return Ok(items.remove(0));
        }
        Ok(Value::Array(items))
    }

    fn parse_string(&mut self) -> Result<String, LiteralError> {
        let quote = match self.bump() {
            Some(q) => q,
            None => return Err(self.error("expected string")),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('0') => out.push('\0'),
                    Some('u') => out.push(self.parse_unicode_escape()?),
                    Some('\n') => {}
                    Some(c @ ('\\' | '\'' | '"' | '/')) => out.push(c),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(self.error("unterminated escape sequence")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> Result<char, LiteralError> {
        let high = self.parse_hex4()?;
        if (0xD800..0xDC00).contains(&high) {
            if self.bump() != Some('\\') || self.bump() != Some('u') {
                return Err(self.error("unpaired surrogate in unicode escape"));
            }
            let low = self.parse_hex4()?;
            if !(0xDC00..0xE000).contains(&low) {
                return Err(self.error("invalid low surrogate in unicode escape"));
            }
            let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            return char::from_u32(combined).ok_or_else(|| self.error("invalid unicode escape"));
        }
        char::from_u32(high).ok_or_else(|| self.error("invalid unicode escape"))
    }

    fn parse_hex4(&mut self) -> Result<u32, LiteralError> {
        let end = self.pos + 4;
        let digits = self
            .src
            .get(self.pos..end)
            .ok_or_else(|| self.error("truncated unicode escape"))?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(self.error("invalid unicode escape"));
        }
        let code =
            u32::from_str_radix(digits, 16).map_err(|_| self.error("invalid unicode escape"))?;
        self.pos = end;
        Ok(code)
    }

    fn parse_number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        let mut is_float = false;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek(), Some('-') | Some('+')) {
                        self.bump();
                    }
                    continue;
                }
                _ => break,
            }
            self.bump();
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();

        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Number(n.into()));
            }
            if let Ok(n) = text.parse::<u64>() {
                return Ok(Value::Number(n.into()));
            }
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| LiteralError {
                message: format!("invalid number '{}'", text),
                offset: start,
            })
    }

    fn parse_keyword(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        match self.take_identifier() {
            "true" | "True" => Ok(Value::Bool(true)),
            "false" | "False" => Ok(Value::Bool(false)),
            "null" | "None" => Ok(Value::Null),
            other => Err(LiteralError {
                message: format!("unknown identifier '{}'", other),
                offset: start,
            }),
        }
    }

    fn take_identifier(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }
}
