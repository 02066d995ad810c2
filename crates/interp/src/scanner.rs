//! Token scanner.
//!
//! Streams tokens from source text on demand. The interesting part is
//! compound-keyword folding: `end if`, `end while`, `end for` and
//! `end function` each lex as a single block-end token, and `else if` lexes
//! as a single token by one-token lookahead with rewind.
//!
//! The scanner is total: any input eventually produces `Eof`, and `Eof`
//! repeats stably once reached. Lex errors are ordinary tokens whose lexeme
//! is a static message.

/// What a token is. Operator kinds with a `...Assign` twin fold the trailing
/// `=` into the compound kind during scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // operators
    Plus,
    PlusAssign,
    Minus,
    MinusAssign,
    Star,
    StarAssign,
    Slash,
    SlashAssign,
    Caret,
    CaretAssign,
    Percent,
    PercentAssign,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Assign,
    Equal,
    NotEqual,
    // punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    AtSign,
    // literals
    Number,
    Str,
    Identifier,
    // keywords
    And,
    Or,
    Not,
    True,
    False,
    Null,
    If,
    Then,
    Else,
    ElseIf,
    For,
    In,
    Isa,
    New,
    Function,
    While,
    Return,
    Locals,
    // compound block-end markers
    EndFunction,
    EndIf,
    EndWhile,
    EndFor,
    // sentinels
    Newline,
    Eof,
    Error,
}

impl TokenKind {
    /// The `<op>=` compound of a base operator; identity for anything else.
    fn with_assign(self) -> TokenKind {
        match self {
            TokenKind::Plus => TokenKind::PlusAssign,
            TokenKind::Minus => TokenKind::MinusAssign,
            TokenKind::Star => TokenKind::StarAssign,
            TokenKind::Slash => TokenKind::SlashAssign,
            TokenKind::Caret => TokenKind::CaretAssign,
            TokenKind::Percent => TokenKind::PercentAssign,
            TokenKind::Greater => TokenKind::GreaterEqual,
            TokenKind::Less => TokenKind::LessEqual,
            TokenKind::Assign => TokenKind::Equal,
            other => other,
        }
    }

    /// The block-end marker for a block-start keyword.
    pub fn block_end(self) -> Option<TokenKind> {
        match self {
            TokenKind::If => Some(TokenKind::EndIf),
            TokenKind::While => Some(TokenKind::EndWhile),
            TokenKind::For => Some(TokenKind::EndFor),
            TokenKind::Function => Some(TokenKind::EndFunction),
            _ => None,
        }
    }

    /// Keywords and block-end markers, the kinds the statement dispatcher
    /// treats specially.
    pub fn is_keyword(self) -> bool {
        matches!(
            self,
            TokenKind::And
                | TokenKind::Or
                | TokenKind::Not
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::If
                | TokenKind::Then
                | TokenKind::Else
                | TokenKind::ElseIf
                | TokenKind::For
                | TokenKind::In
                | TokenKind::Isa
                | TokenKind::New
                | TokenKind::Function
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Locals
                | TokenKind::EndFunction
                | TokenKind::EndIf
                | TokenKind::EndWhile
                | TokenKind::EndFor
        )
    }
}

/// A scanned token. The lexeme borrows the source buffer, except for `Error`
/// tokens whose lexeme is a static message.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl Token<'_> {
    /// A placeholder before scanning begins.
    pub fn empty() -> Token<'static> {
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        }
    }
}

/// The scanner state: two cursors into the source and the current line.
/// Cloning gives a cheap lookahead checkpoint.
#[derive(Debug, Clone)]
pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

fn is_alpha(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn keyword(text: &str, expected: &str, kind: TokenKind) -> TokenKind {
    if text == expected {
        kind
    } else {
        TokenKind::Identifier
    }
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan the next token. Returns `Eof` forever once the source runs out.
    pub fn next_token(&mut self) -> Token<'src> {
        self.start = self.current;
        if self.is_at_end() {
            return self.make(TokenKind::Eof);
        }
        self.scan_token()
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        self.source.as_bytes().get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source
            .as_bytes()
            .get(self.current + 1)
            .copied()
            .unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let byte = self.peek();
        self.current += 1;
        byte
    }

    fn check(&self, byte: u8) -> bool {
        self.peek() == byte
    }

    fn matches(&mut self, byte: u8) -> bool {
        if !self.check(byte) {
            return false;
        }
        self.current += 1;
        true
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        self.error_token_at(message, self.line)
    }

    fn error_token_at(&self, message: &'static str, line: u32) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line,
        }
    }

    fn op_assign(&mut self, base: TokenKind) -> Token<'src> {
        if self.matches(b'=') {
            self.make(base.with_assign())
        } else {
            self.make(base)
        }
    }

    fn scan_token(&mut self) -> Token<'src> {
        let c = self.advance();
        match c {
            b'\n' => {
                // the token carries the line it ends
                let token = self.make(TokenKind::Newline);
                self.line += 1;
                token
            }
            b';' => self.make(TokenKind::Newline),

            b' ' | b'\r' | b'\t' => self.next_token(),

            b'+' => self.op_assign(TokenKind::Plus),
            b'-' => {
                // numeric head: a sign directly on a digit is a literal
                if self.peek().is_ascii_digit() {
                    return self.scan_number();
                }
                self.op_assign(TokenKind::Minus)
            }
            b'*' => self.op_assign(TokenKind::Star),
            b'/' => {
                // can also be the start of a comment
                if self.matches(b'/') {
                    while !self.is_at_end() && !self.check(b'\n') {
                        self.advance();
                    }
                    return self.next_token();
                }
                self.op_assign(TokenKind::Slash)
            }
            b'^' => self.op_assign(TokenKind::Caret),
            b'%' => self.op_assign(TokenKind::Percent),
            b'>' => self.op_assign(TokenKind::Greater),
            b'<' => self.op_assign(TokenKind::Less),
            b'=' => self.op_assign(TokenKind::Assign),

            b'!' => {
                if self.matches(b'=') {
                    self.make(TokenKind::NotEqual)
                } else {
                    self.error_token("Expected '=' after '!'")
                }
            }

            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b'[' => self.make(TokenKind::LeftBracket),
            b']' => self.make(TokenKind::RightBracket),
            b',' => self.make(TokenKind::Comma),
            b':' => self.make(TokenKind::Colon),
            b'@' => self.make(TokenKind::AtSign),
            b'.' => {
                if self.peek().is_ascii_digit() {
                    return self.scan_number();
                }
                self.make(TokenKind::Dot)
            }

            b'"' => self.scan_string(),

            _ => {
                if c.is_ascii_digit() {
                    return self.scan_number();
                }
                if is_alpha(c) {
                    return self.scan_identifier();
                }
                // step over the rest of a multi-byte character so later
                // lexeme slices stay on char boundaries
                while !self.is_at_end() && !self.source.is_char_boundary(self.current) {
                    self.current += 1;
                }
                self.error_token("Unknown character")
            }
        }
    }

    fn scan_number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        if self.peek() == b'e' || self.peek() == b'E' {
            let next = self.peek_next();
            if next.is_ascii_digit() || next == b'+' || next == b'-' {
                self.advance();
                if self.peek() == b'+' || self.peek() == b'-' {
                    self.advance();
                    if self.peek() == b'+' || self.peek() == b'-' {
                        return self.error_token("Too many signs in a number's exponent");
                    }
                }
                if !self.peek().is_ascii_digit() {
                    return self.error_token("Expected digits in a number's exponent");
                }
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            }
        }

        self.make(TokenKind::Number)
    }

    fn scan_string(&mut self) -> Token<'src> {
        let open_line = self.line;
        loop {
            if self.is_at_end() {
                return self.error_token_at("Unterminated string", open_line);
            }
            let c = self.advance();
            if c == b'\n' {
                self.line += 1;
            } else if c == b'"' {
                // a doubled quote is an escaped quote, not the end
                if self.check(b'"') {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.make(TokenKind::Str)
    }

    fn scan_identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }

        let text = &self.source[self.start..self.current];
        let bytes = text.as_bytes();
        let kind = match bytes[0] {
            b'a' => keyword(text, "and", TokenKind::And),
            b'e' => match text {
                "end" => return self.end_compound(),
                "else" => return self.else_compound(),
                _ => TokenKind::Identifier,
            },
            b'f' => match bytes.get(1) {
                Some(b'a') => keyword(text, "false", TokenKind::False),
                Some(b'o') => keyword(text, "for", TokenKind::For),
                Some(b'u') => keyword(text, "function", TokenKind::Function),
                _ => TokenKind::Identifier,
            },
            b'i' => match bytes.get(1) {
                Some(b'f') => keyword(text, "if", TokenKind::If),
                Some(b'n') => keyword(text, "in", TokenKind::In),
                Some(b's') => keyword(text, "isa", TokenKind::Isa),
                _ => TokenKind::Identifier,
            },
            b'l' => keyword(text, "locals", TokenKind::Locals),
            b'n' => match bytes.get(1) {
                Some(b'o') => keyword(text, "not", TokenKind::Not),
                Some(b'u') => keyword(text, "null", TokenKind::Null),
                Some(b'e') => keyword(text, "new", TokenKind::New),
                _ => TokenKind::Identifier,
            },
            b'o' => keyword(text, "or", TokenKind::Or),
            b'r' => match text {
                "return" => TokenKind::Return,
                "repeat" => return self.error_token("'repeat' is reserved and not yet supported"),
                _ => TokenKind::Identifier,
            },
            b't' => match bytes.get(1) {
                Some(b'r') => keyword(text, "true", TokenKind::True),
                Some(b'h') => keyword(text, "then", TokenKind::Then),
                _ => TokenKind::Identifier,
            },
            b'w' => keyword(text, "while", TokenKind::While),
            _ => TokenKind::Identifier,
        };

        self.make(kind)
    }

    /// `end` never stands alone: fold it with the following block-start
    /// keyword into a single block-end token, or report it.
    fn end_compound(&mut self) -> Token<'src> {
        let start = self.start;
        let follower = self.next_token();
        match follower.kind.block_end() {
            Some(end) => {
                self.start = start;
                self.make(end)
            }
            None => self.error_token("'end' without proper following keyword ('if', 'while', etc.)"),
        }
    }

    /// `else if` folds into one token; any other follower rewinds the
    /// lookahead so `else` stands alone.
    fn else_compound(&mut self) -> Token<'src> {
        let start = self.start;
        let current = self.current;
        let line = self.line;

        let follower = self.next_token();
        if follower.kind == TokenKind::If {
            self.start = start;
            return self.make(TokenKind::ElseIf);
        }

        self.start = start;
        self.current = current;
        self.line = line;
        self.make(TokenKind::Else)
    }
}
