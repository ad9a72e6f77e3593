use crate::token::{CompoundOp, Span, SpannedToken, Token};
use plume_core::string::StringInterner;
use std::borrow::Cow;

/// Lexer error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

/// Pull-based lexer with one token of lookahead.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    current: Result<SpannedToken, LexError>,
    current_text: String,
    ahead: Option<(Result<SpannedToken, LexError>, String)>,
    pub strings: StringInterner,
    /// Line number of the last consumed token.
    pub lastline: u32,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source bytes.
    pub fn new(source: &'a [u8]) -> Self {
        Self::with_strings(source, StringInterner::new())
    }

    /// Create a new lexer reusing an existing string interner.
    pub fn with_strings(source: &'a [u8], strings: StringInterner) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            column: 1,
            current: Ok(SpannedToken {
                token: Token::Eof,
                span: Span::default(),
            }),
            current_text: String::new(),
            ahead: None,
            strings,
            lastline: 1,
        };
        let (tok, text) = lexer.scan_token();
        lexer.current = tok;
        lexer.current_text = text;
        lexer
    }

    /// Peek at the current token without consuming.
    pub fn current(&self) -> Result<&SpannedToken, &LexError> {
        self.current.as_ref()
    }

    /// Peek one token past the current one.
    pub fn lookahead(&mut self) -> Result<&Token, LexError> {
        if self.ahead.is_none() {
            let scanned = self.scan_token();
            self.ahead = Some(scanned);
        }
        match &self.ahead {
            Some((Ok(st), _)) => Ok(&st.token),
            Some((Err(e), _)) => Err(e.clone()),
            None => unreachable!("lookahead buffer was just filled"),
        }
    }

    /// Consume the current token and advance to the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        if let Ok(tok) = &self.current {
            self.lastline = tok.span.line;
        }
        let (next, text) = match self.ahead.take() {
            Some(buffered) => buffered,
            None => self.scan_token(),
        };
        self.current_text = text;
        std::mem::replace(&mut self.current, next)
    }

    /// Line of the current token.
    pub fn line(&self) -> u32 {
        match &self.current {
            Ok(tok) => tok.span.line,
            Err(e) => e.line,
        }
    }

    /// Source text of the current token (used for "near" messages).
    pub fn token_text(&self) -> &str {
        &self.current_text
    }

    /// Raw text of a 1-based source line, without its terminator.
    pub fn source_line(&self, line: u32) -> Option<Cow<'a, str>> {
        let idx = usize::try_from(line.checked_sub(1)?).ok()?;
        let raw = self.source.split(|&b| b == b'\n').nth(idx)?;
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Some(String::from_utf8_lossy(raw))
    }

    /// Give the interner back to the caller once lexing is finished.
    pub fn into_strings(self) -> StringInterner {
        self.strings
    }

    // ---- Internal scanning ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn next_char(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' || ch == b'\r' {
            // "\n\r" and "\r\n" both count as a single line break
            if matches!(self.peek(), Some(c) if (c == b'\n' || c == b'\r') && c != ch) {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.next_char();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>, span: Span) -> LexError {
        LexError {
            message: message.into(),
            line: span.line,
            column: span.column,
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') => {
                    self.next_char();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    let span = Span {
                        line: self.line,
                        column: self.column,
                    };
                    self.pos += 2;
                    self.column += 2;
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_string(level, span, "comment")?;
                    } else {
                        while !matches!(self.peek(), None | Some(b'\n' | b'\r')) {
                            self.next_char();
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// If the input is at `[=*[`, return the number of `=` signs.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let level = self.source[self.pos + 1..]
            .iter()
            .take_while(|&&c| c == b'=')
            .count();
        (self.peek_at(level + 1) == Some(b'[')).then_some(level)
    }

    fn scan_token(&mut self) -> (Result<SpannedToken, LexError>, String) {
        if let Err(e) = self.skip_trivia() {
            return (Err(e), String::new());
        }
        let start = self.pos;
        let result = self.scan_token_inner();
        let text = if self.pos > start {
            String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
        } else {
            "<eof>".to_string()
        };
        (result, text)
    }

    fn scan_token_inner(&mut self) -> Result<SpannedToken, LexError> {
        let span = Span {
            line: self.line,
            column: self.column,
        };
        let Some(ch) = self.peek() else {
            return Ok(SpannedToken {
                token: Token::Eof,
                span,
            });
        };

        let token = match ch {
            b'"' | b'\'' => return self.scan_short_string(span),
            b'0'..=b'9' => return self.scan_numeral(span),
            b'.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                return self.scan_numeral(span)
            }
            b'[' => {
                if let Some(level) = self.long_bracket_level() {
                    let bytes = self.read_long_string(level, span, "string")?;
                    let id = self.strings.intern(&bytes);
                    return Ok(SpannedToken {
                        token: Token::String(id),
                        span,
                    });
                }
                self.next_char();
                Token::LBracket
            }
            _ if is_ident_start(ch) => return Ok(self.scan_name(span)),
            _ => {
                self.next_char();
                self.scan_operator(ch, span)?
            }
        };
        Ok(SpannedToken { token, span })
    }

    /// Operators and punctuation; `ch` has already been consumed.
    fn scan_operator(&mut self, ch: u8, span: Span) -> Result<Token, LexError> {
        let tok = match ch {
            b'+' => self.assign_or(CompoundOp::Add, Token::Plus),
            b'-' => {
                if self.eat(b'>') {
                    Token::Arrow
                } else {
                    self.assign_or(CompoundOp::Sub, Token::Minus)
                }
            }
            b'*' => {
                if self.eat(b'*') {
                    self.assign_or(CompoundOp::Pow, Token::Caret)
                } else {
                    self.assign_or(CompoundOp::Mul, Token::Star)
                }
            }
            b'/' => {
                if self.eat(b'/') {
                    self.assign_or(CompoundOp::IDiv, Token::FloorDiv)
                } else {
                    self.assign_or(CompoundOp::Div, Token::Slash)
                }
            }
            b'%' => self.assign_or(CompoundOp::Mod, Token::Percent),
            b'^' => self.assign_or(CompoundOp::Pow, Token::Caret),
            b'&' => self.assign_or(CompoundOp::BAnd, Token::Ampersand),
            b'|' => self.assign_or(CompoundOp::BOr, Token::Pipe),
            b'#' => Token::Hash,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'{' => Token::LBrace,
            b'}' => Token::RBrace,
            b']' => Token::RBracket,
            b';' => Token::Semi,
            b',' => Token::Comma,
            b'<' => {
                if self.eat(b'<') {
                    self.assign_or(CompoundOp::Shl, Token::ShiftLeft)
                } else if self.eat(b'=') {
                    Token::LessEq
                } else {
                    Token::Less
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    self.assign_or(CompoundOp::Shr, Token::ShiftRight)
                } else if self.eat(b'=') {
                    Token::GreaterEq
                } else {
                    Token::Greater
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    Token::Equal
                } else {
                    Token::Assign
                }
            }
            b'~' => {
                if self.eat(b'=') {
                    Token::NotEqual
                } else {
                    Token::Tilde
                }
            }
            b'!' if self.eat(b'=') => Token::NotEqual,
            b':' => {
                if self.eat(b':') {
                    Token::DoubleColon
                } else {
                    Token::Colon
                }
            }
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') {
                        Token::DotDotDot
                    } else {
                        self.assign_or(CompoundOp::Concat, Token::DotDot)
                    }
                } else {
                    Token::Dot
                }
            }
            b'?' => {
                if self.eat(b'?') {
                    self.assign_or(CompoundOp::Coalesce, Token::Coalesce)
                } else {
                    Token::Question
                }
            }
            _ => {
                let near = if ch.is_ascii_graphic() {
                    format!("'{}'", ch as char)
                } else {
                    format!("'<\\{ch}>'")
                };
                return Err(self.error(format!("unexpected symbol near {near}"), span));
            }
        };
        Ok(tok)
    }

    fn assign_or(&mut self, op: CompoundOp, plain: Token) -> Token {
        if self.eat(b'=') {
            Token::OpAssign(op)
        } else {
            plain
        }
    }

    fn scan_name(&mut self, span: Span) -> SpannedToken {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.next_char();
        }
        let name = &self.source[start..self.pos];
        let keyword = std::str::from_utf8(name)
            .ok()
            .and_then(Token::keyword_from_str);
        let token = match keyword {
            Some(kw) => kw,
            None => Token::Name(self.strings.intern(name)),
        };
        SpannedToken { token, span }
    }

    /// Read a numeral greedily, then convert it. Anything that does not convert
    /// cleanly (including a trailing identifier character) is malformed.
    fn scan_numeral(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let start = self.pos;
        let mut exponent = [b'e', b'E'];
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.next_char();
            self.next_char();
            exponent = [b'p', b'P'];
        }
        loop {
            match self.peek() {
                Some(c) if exponent.contains(&c) => {
                    self.next_char();
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.next_char();
                    }
                }
                Some(c) if c.is_ascii_hexdigit() || c == b'.' => {
                    self.next_char();
                }
                _ => break,
            }
        }
        // glue trailing letters so that the message shows the whole thing
        while self.peek().is_some_and(is_ident_continue) {
            self.next_char();
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        match str_to_number(&text) {
            Some(token) => Ok(SpannedToken { token, span }),
            None => Err(self.error(format!("malformed number near '{text}'"), span)),
        }
    }

    /// Quote the string read so far for a "near" message.
    fn near_string(&self, start: usize) -> String {
        let end = (self.pos + 1).min(self.source.len());
        let raw = &self.source[start..end];
        let raw = &raw[..raw.len().min(50)];
        format!("'{}'", String::from_utf8_lossy(raw))
    }

    fn scan_short_string(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let start = self.pos;
        let quote = self.peek().unwrap_or(b'"');
        self.next_char();
        let mut buf = Vec::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(self.error("unfinished string near <eof>", span));
            };
            match ch {
                b'\n' | b'\r' => {
                    let near = self.near_string(start);
                    return Err(self.error(format!("unfinished string near {near}"), span));
                }
                b'\\' => {
                    self.next_char();
                    self.read_escape(start, span, &mut buf)?;
                }
                _ => {
                    self.next_char();
                    if ch == quote {
                        break;
                    }
                    buf.push(ch);
                }
            }
        }
        let id = self.strings.intern(&buf);
        Ok(SpannedToken {
            token: Token::String(id),
            span,
        })
    }

    fn read_escape(&mut self, start: usize, span: Span, buf: &mut Vec<u8>) -> Result<(), LexError> {
        let bad_escape = |lx: &Self| {
            let near = lx.near_string(start);
            lx.error(format!("invalid escape sequence near {near}"), span)
        };
        let Some(ch) = self.peek() else {
            return Err(self.error("unfinished string near <eof>", span));
        };
        let simple = match ch {
            b'a' => Some(0x07),
            b'b' => Some(0x08),
            b'f' => Some(0x0C),
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'v' => Some(0x0B),
            b'\\' | b'"' | b'\'' => Some(ch),
            _ => None,
        };
        if let Some(byte) = simple {
            self.next_char();
            buf.push(byte);
            return Ok(());
        }
        match ch {
            b'\n' | b'\r' => {
                self.next_char();
                buf.push(b'\n');
            }
            b'x' => {
                self.next_char();
                let mut value = 0u8;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d) if d.is_ascii_hexdigit() => {
                            self.next_char();
                            value = (value << 4) | hex_value(d);
                        }
                        _ => return Err(bad_escape(self)),
                    }
                }
                buf.push(value);
            }
            b'u' => {
                self.next_char();
                if !self.eat(b'{') {
                    return Err(bad_escape(self));
                }
                let mut code: u64 = 0;
                let mut digits = 0;
                while let Some(d) = self.peek().filter(u8::is_ascii_hexdigit) {
                    self.next_char();
                    code = (code << 4) | u64::from(hex_value(d));
                    digits += 1;
                    if code > 0x7FFF_FFFF {
                        let near = self.near_string(start);
                        return Err(self.error(format!("UTF-8 value too large near {near}"), span));
                    }
                }
                if digits == 0 || !self.eat(b'}') {
                    return Err(bad_escape(self));
                }
                encode_utf8(code as u32, buf);
            }
            b'z' => {
                self.next_char();
                while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C')) {
                    self.next_char();
                }
            }
            b'0'..=b'9' => {
                let mut value: u32 = 0;
                for _ in 0..3 {
                    match self.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            self.next_char();
                            value = value * 10 + u32::from(d - b'0');
                        }
                        _ => break,
                    }
                }
                let byte = u8::try_from(value).map_err(|_| {
                    let near = self.near_string(start);
                    self.error(format!("decimal escape too large near {near}"), span)
                })?;
                buf.push(byte);
            }
            _ => return Err(bad_escape(self)),
        }
        Ok(())
    }

    /// Read a long string or comment body. The input is at the opening bracket.
    fn read_long_string(&mut self, level: usize, span: Span, what: &str) -> Result<Vec<u8>, LexError> {
        for _ in 0..level + 2 {
            self.next_char();
        }
        // a newline right after the opening bracket is skipped
        if matches!(self.peek(), Some(b'\n' | b'\r')) {
            self.next_char();
        }
        let mut buf = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(self.error(format!("unfinished long {what} near <eof>"), span));
                }
                Some(b']') if self.closes_long_bracket(level) => {
                    for _ in 0..level + 2 {
                        self.next_char();
                    }
                    return Ok(buf);
                }
                Some(b'\n' | b'\r') => {
                    self.next_char();
                    buf.push(b'\n');
                }
                Some(ch) => {
                    self.next_char();
                    buf.push(ch);
                }
            }
        }
    }

    fn closes_long_bracket(&self, level: usize) -> bool {
        (1..=level).all(|i| self.peek_at(i) == Some(b'=')) && self.peek_at(level + 1) == Some(b']')
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

fn hex_value(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}

/// Convert numeral text into an integer or float token.
fn str_to_number(text: &str) -> Option<Token> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if hex.contains(['.', 'p', 'P']) {
            return parse_hex_float(hex).map(Token::Float);
        }
        if hex.is_empty() || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        // hex integers wrap around on overflow
        let value = hex
            .bytes()
            .fold(0u64, |acc, c| acc.wrapping_mul(16).wrapping_add(u64::from(hex_value(c))));
        return Some(Token::Integer(value as i64));
    }
    if !text.bytes().all(|c| c.is_ascii_digit() || matches!(c, b'.' | b'e' | b'E' | b'+' | b'-')) {
        return None;
    }
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(i) = text.parse::<i64>() {
            return Some(Token::Integer(i));
        }
    }
    text.parse::<f64>().ok().map(Token::Float)
}

/// Parse the part of a hex float after `0x`, e.g. `1.8p3`.
fn parse_hex_float(text: &str) -> Option<f64> {
    let (mantissa, exponent) = match text.find(['p', 'P']) {
        Some(p) => (&text[..p], text[p + 1..].parse::<i32>().ok()?),
        None => (text, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let digits = int_part.bytes().chain(frac_part.bytes());
    if !digits.clone().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let value = digits.fold(0.0f64, |acc, c| acc * 16.0 + f64::from(hex_value(c)));
    let shift = exponent - 4 * frac_part.len() as i32;
    Some(value * 2f64.powi(shift))
}

/// Encode a code point as (extended, up to 6-byte) UTF-8.
fn encode_utf8(code: u32, buf: &mut Vec<u8>) {
    if code < 0x80 {
        buf.push(code as u8);
        return;
    }
    let mut tail = Vec::with_capacity(5);
    let mut rest = code;
    let mut first_max = 0x3F_u32;
    while rest > first_max {
        tail.push(0x80 | (rest & 0x3F) as u8);
        rest >>= 6;
        first_max >>= 1;
    }
    buf.push(((!first_max) << 1) as u8 | rest as u8);
    buf.extend(tail.iter().rev());
}
