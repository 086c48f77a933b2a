//! Tokenizer
//!
//! Indentation-aware lexing over physical lines. Inside round, square or
//! curly brackets newlines are swallowed; elsewhere a newline ends the
//! statement. Leading whitespace is measured in spaces; tabs in the
//! indentation are fatal. At EOF all open indents are closed and a
//! terminal EOF token is emitted.

use crate::token::{Keyword, Token, TokenKind};
use crate::ParseError;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    bracket_depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

/// Tokenize a script.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let normalized = source.replace("\r\n", "\n");
    let mut lexer = Lexer {
        chars: normalized.chars().collect(),
        pos: 0,
        line: 1,
        bracket_depth: 0,
        indents: vec![0],
        at_line_start: true,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn run(&mut self) -> Result<(), ParseError> {
        loop {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_indentation()?;
            }
            let Some(ch) = self.peek() else { break };
            match ch {
                '\n' => {
                    self.advance();
                    if self.bracket_depth == 0 {
                        self.emit(TokenKind::Newline);
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' => {
                    self.advance();
                }
                '#' => self.skip_comment(),
                '"' => self.read_string()?,
                '`' => self.read_raw_string()?,
                c if c.is_ascii_digit() => self.read_number(),
                c if c.is_ascii_alphabetic() || c == '_' => self.read_ident(),
                _ => self.read_symbol()?,
            }
        }

        // Close the final physical line and any open blocks.
        if !self.at_line_start {
            self.emit(TokenKind::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.emit(TokenKind::Dedent);
        }
        self.emit(TokenKind::Eof);
        Ok(())
    }

    /// Measure the indentation of the next non-blank, non-comment line and
    /// emit INDENT/DEDENT tokens against the indent stack. Blank lines and
    /// comment-only lines are consumed without emitting anything.
    fn handle_indentation(&mut self) -> Result<(), ParseError> {
        loop {
            let mut width = 0usize;
            while self.peek() == Some(' ') {
                self.advance();
                width += 1;
            }
            match self.peek() {
                Some('\t') => {
                    return Err(ParseError::new(
                        self.line,
                        "tab characters are not allowed in indentation",
                    ))
                }
                None => return Ok(()),
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                }
                Some('#') => {
                    self.skip_comment();
                }
                Some(_) => {
                    self.apply_indent(width)?;
                    self.at_line_start = false;
                    return Ok(());
                }
            }
        }
    }

    fn apply_indent(&mut self, width: usize) -> Result<(), ParseError> {
        let top = *self.indents.last().unwrap_or(&0);
        if width > top {
            self.indents.push(width);
            self.emit(TokenKind::Indent);
            return Ok(());
        }
        while width < *self.indents.last().unwrap_or(&0) {
            self.indents.pop();
            self.emit(TokenKind::Dedent);
        }
        if width != *self.indents.last().unwrap_or(&0) {
            return Err(ParseError::new(
                self.line,
                "dedent does not match any outer indentation level",
            ));
        }
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn read_string(&mut self) -> Result<(), ParseError> {
        let start_line = self.line;
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(ParseError::new(start_line, "unclosed string literal"))
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        None => return Err(ParseError::new(start_line, "unclosed string literal")),
                        Some('n') => {
                            text.push('\n');
                            self.advance();
                        }
                        Some('\\') => {
                            text.push('\\');
                            self.advance();
                        }
                        Some('"') => {
                            text.push('"');
                            self.advance();
                        }
                        // Unknown escape: keep the next character as-is.
                        Some(other) => {
                            text.push(other);
                            self.advance();
                        }
                    }
                }
                Some(other) => {
                    text.push(other);
                    self.advance();
                }
            }
        }
        self.tokens.push(Token::new(TokenKind::Str(text), start_line));
        Ok(())
    }

    /// Back-tick strings span lines and preserve newlines verbatim.
    fn read_raw_string(&mut self) -> Result<(), ParseError> {
        let start_line = self.line;
        self.advance(); // opening backtick
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::new(start_line, "unclosed back-tick string")),
                Some('`') => {
                    self.advance();
                    break;
                }
                Some(ch) => {
                    if ch == '\n' {
                        self.line += 1;
                    }
                    text.push(ch);
                    self.advance();
                }
            }
        }
        self.tokens.push(Token::new(TokenKind::Str(text), start_line));
        Ok(())
    }

    fn read_number(&mut self) {
        let start_line = self.line;
        let mut digits = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let value = digits.parse::<i64>().unwrap_or(i64::MAX);
        self.tokens.push(Token::new(TokenKind::Int(value), start_line));
    }

    fn read_ident(&mut self) {
        let start_line = self.line;
        let mut name = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match Keyword::lookup(&name) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(name),
        };
        self.tokens.push(Token::new(kind, start_line));
    }

    fn read_symbol(&mut self) -> Result<(), ParseError> {
        let ch = self.peek().unwrap_or('\0');
        let next = self.chars.get(self.pos + 1).copied();

        // Two-character symbols first.
        let two = match (ch, next) {
            ('=', Some('=')) => Some(TokenKind::EqEq),
            ('!', Some('=')) => Some(TokenKind::NotEq),
            ('<', Some('=')) => Some(TokenKind::LtEq),
            ('>', Some('=')) => Some(TokenKind::GtEq),
            _ => None,
        };
        if let Some(kind) = two {
            self.advance();
            self.advance();
            self.emit(kind);
            return Ok(());
        }

        let kind = match ch {
            '(' => {
                self.bracket_depth += 1;
                TokenKind::LParen
            }
            ')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            '{' => {
                self.bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            '[' => {
                self.bracket_depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '=' => TokenKind::Assign,
            '+' => TokenKind::Plus,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            other => {
                return Err(ParseError::new(
                    self.line,
                    format!("unknown token '{}'", other),
                ))
            }
        };
        self.advance();
        self.emit(kind);
        Ok(())
    }

    fn emit(&mut self, kind: TokenKind) {
        self.tokens.push(Token::new(kind, self.line));
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}
