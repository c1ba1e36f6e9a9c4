//! S-expression reader.
//!
//! First pass of parsing: turns text into an untyped syntax tree allocated in a
//! bump arena. Knows nothing about opcodes or types; the builder gives the
//! syntax its meaning.

use crate::core::error::{ParseError, ParseResult};
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

/// Nesting limit; keeps hostile input from exhausting the stack.
const MAX_DEPTH: usize = 512;

#[derive(Debug)]
pub struct SExpr<'a> {
    pub head: &'a str,
    /// Byte offset of the opening parenthesis.
    pub position: usize,
    pub fields: BumpVec<'a, Field<'a>>,
    pub children: BumpVec<'a, &'a SExpr<'a>>,
}

/// `key=value` or a bare value.
#[derive(Debug)]
pub struct Field<'a> {
    pub key: Option<&'a str>,
    pub value: Value<'a>,
    pub position: usize,
}

#[derive(Debug)]
pub enum Value<'a> {
    Int(i64),
    Float(f64),
    Str(&'a str),
    Ident(&'a str),
    List(BumpVec<'a, Value<'a>>),
}

impl<'a> SExpr<'a> {
    pub fn field(&self, key: &str) -> Option<&Field<'a>> {
        self.fields.iter().find(|f| f.key == Some(key))
    }

    pub fn positional(&self) -> impl Iterator<Item = &Field<'a>> {
        self.fields.iter().filter(|f| f.key.is_none())
    }
}

/// Reads exactly one top-level expression.
pub fn read<'a>(arena: &'a Bump, text: &str) -> ParseResult<&'a SExpr<'a>> {
    let mut reader = Reader {
        arena,
        text,
        pos: 0,
        depth: 0,
    };
    let expr = reader.read_expr()?;
    reader.skip_trivia();
    if reader.pos < text.len() {
        return Err(ParseError::malformed(reader.pos, "trailing input after method"));
    }
    Ok(expr)
}

struct Reader<'a, 't> {
    arena: &'a Bump,
    text: &'t str,
    pos: usize,
    depth: usize,
}

impl<'a, 't> Reader<'a, 't> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == b';' {
                while let Some(ch) = self.peek() {
                    self.pos += 1;
                    if ch == b'\n' {
                        break;
                    }
                }
            } else if ch.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, ch: u8) -> ParseResult<()> {
        self.skip_trivia();
        match self.peek() {
            Some(c) if c == ch => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(ParseError::malformed(
                self.pos,
                format!("expected '{}' but found '{}'", ch as char, c as char),
            )),
            None => Err(ParseError::malformed(
                self.pos,
                format!("expected '{}' but found end of input", ch as char),
            )),
        }
    }

    fn read_expr(&mut self) -> ParseResult<&'a SExpr<'a>> {
        self.skip_trivia();
        let position = self.pos;
        self.expect(b'(')?;
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::malformed(position, "nesting too deep"));
        }

        self.skip_trivia();
        let head = self.read_word()?;
        let mut fields = BumpVec::new_in(self.arena);
        let mut children = BumpVec::new_in(self.arena);
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(ParseError::malformed(
                        self.pos,
                        format!("unbalanced parentheses: '{head}' at byte {position} is never closed"),
                    ))
                }
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b'(') => children.push(self.read_expr()?),
                Some(_) => fields.push(self.read_field()?),
            }
        }

        self.depth -= 1;
        Ok(self.arena.alloc(SExpr {
            head,
            position,
            fields,
            children,
        }))
    }

    fn read_word(&mut self) -> ParseResult<&'a str> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {}
            Some(c) => {
                return Err(ParseError::malformed(
                    start,
                    format!("expected a name but found '{}'", c as char),
                ))
            }
            None => return Err(ParseError::malformed(start, "expected a name but found end of input")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(self.arena.alloc_str(&self.text[start..self.pos]))
    }

    fn read_field(&mut self) -> ParseResult<Field<'a>> {
        let position = self.pos;
        if matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == b'_') {
            let word = self.read_word()?;
            self.skip_trivia();
            if self.peek() == Some(b'=') {
                self.pos += 1;
                let value = self.read_value()?;
                return Ok(Field {
                    key: Some(word),
                    value,
                    position,
                });
            }
            return Ok(Field {
                key: None,
                value: Value::Ident(word),
                position,
            });
        }
        let value = self.read_value()?;
        Ok(Field {
            key: None,
            value,
            position,
        })
    }

    fn read_value(&mut self) -> ParseResult<Value<'a>> {
        self.skip_trivia();
        let start = self.pos;
        match self.peek() {
            Some(b'"') => {
                self.pos += 1;
                let body = self.pos;
                while let Some(c) = self.peek() {
                    if c == b'"' {
                        let s = self.arena.alloc_str(&self.text[body..self.pos]);
                        self.pos += 1;
                        return Ok(Value::Str(s));
                    }
                    self.pos += 1;
                }
                Err(ParseError::malformed(start, "unterminated string"))
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = BumpVec::new_in(self.arena);
                loop {
                    self.skip_trivia();
                    match self.peek() {
                        Some(b']') => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        Some(b',') if !items.is_empty() => self.pos += 1,
                        Some(_) => items.push(self.read_value()?),
                        None => return Err(ParseError::malformed(start, "unterminated list")),
                    }
                }
            }
            Some(c) if c.is_ascii_digit() || c == b'-' || c == b'+' || c == b'.' => self.read_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => Ok(Value::Ident(self.read_word()?)),
            Some(c) => Err(ParseError::malformed(
                start,
                format!("expected a value but found '{}'", c as char),
            )),
            None => Err(ParseError::malformed(start, "expected a value but found end of input")),
        }
    }

    fn read_number(&mut self) -> ParseResult<Value<'a>> {
        let start = self.pos;
        let mut prev = 0u8;
        while let Some(c) = self.peek() {
            let sign_in_exponent = (c == b'-' || c == b'+') && (self.pos == start || matches!(prev, b'e' | b'E'));
            if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || sign_in_exponent {
                prev = c;
                self.pos += 1;
            } else {
                break;
            }
        }
        let literal = &self.text[start..self.pos];
        parse_number(literal)
            .ok_or_else(|| ParseError::malformed(start, format!("invalid number literal '{literal}'")))
    }
}

fn parse_number<'a>(literal: &str) -> Option<Value<'a>> {
    let (negative, digits) = match literal.as_bytes().first()? {
        b'-' => (true, &literal[1..]),
        b'+' => (false, &literal[1..]),
        _ => (false, literal),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let magnitude = u64::from_str_radix(hex, 16).ok()? as i64;
        return Some(Value::Int(if negative { magnitude.wrapping_neg() } else { magnitude }));
    }
    if digits.bytes().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
        let magnitude = digits.parse::<u64>().ok()?;
        let value = if negative {
            0i64.checked_sub_unsigned(magnitude)?
        } else {
            magnitude as i64
        };
        return Some(Value::Int(value));
    }
    literal.parse::<f64>().ok().map(Value::Float)
}
