use weft_core::{LexError, Position};

use crate::token::{Token, TokenKind};

/// Split workflow source into tokens.
///
/// The final token is always `Eof`. Bracket balance is not checked here.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    idx: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            idx: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while let Some(c) = self.peek() {
            let pos = self.position();
            match c {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '"' => self.string(pos)?,
                '(' => self.condition(pos)?,
                '[' => self.single(TokenKind::LBracket, pos),
                ']' => self.single(TokenKind::RBracket, pos),
                '}' => self.single(TokenKind::RBrace, pos),
                ',' => self.single(TokenKind::Comma, pos),
                '{' => self.brace(pos),
                ':' => {
                    if self.peek_at(1) == Some('=') {
                        self.double(TokenKind::TempAgentAssign, ":=", pos);
                    } else {
                        self.single(TokenKind::Colon, pos);
                    }
                }
                '|' => {
                    if self.peek_at(1) != Some('|') {
                        return Err(LexError::new(pos, "expected '||'"));
                    }
                    self.double(TokenKind::OpPar, "||", pos);
                }
                '~' => {
                    if self.peek_at(1) != Some('>') {
                        return Err(LexError::new(pos, "expected '~>'"));
                    }
                    self.double(TokenKind::OpCond, "~>", pos);
                }
                '-' if self.peek_at(1) == Some('>') => {
                    self.double(TokenKind::OpSeq, "->", pos);
                }
                '@' => self.sigil(TokenKind::Label, pos)?,
                '$' => self.sigil(TokenKind::TempAgentRef, pos)?,
                c if is_name_char(c) => {
                    let name = self.name();
                    self.tokens.push(Token::new(TokenKind::AgentName, name, pos));
                }
                other => {
                    return Err(LexError::new(
                        pos,
                        format!("unexpected character '{}'", other),
                    ));
                }
            }
        }
        let eof = self.position();
        self.tokens.push(Token::new(TokenKind::Eof, "", eof));
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = *self.chars.get(self.idx)?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn position(&self) -> Position {
        let offset = self
            .chars
            .get(self.idx)
            .map(|(o, _)| *o)
            .unwrap_or(self.source.len());
        Position::new(offset, self.line, self.column)
    }

    fn single(&mut self, kind: TokenKind, pos: Position) {
        let c = self.bump().map(String::from).unwrap_or_default();
        self.tokens.push(Token::new(kind, c, pos));
    }

    fn double(&mut self, kind: TokenKind, text: &str, pos: Position) {
        self.bump();
        self.bump();
        self.tokens.push(Token::new(kind, text, pos));
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// Identifier characters up to (not including) a `->`.
    fn name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if !is_name_char(c) || (c == '-' && self.peek_at(1) == Some('>')) {
                break;
            }
            name.push(c);
            self.bump();
        }
        name
    }

    fn sigil(&mut self, kind: TokenKind, pos: Position) -> Result<(), LexError> {
        let sigil = self.bump().unwrap_or_default();
        let name = self.name();
        if name.is_empty() {
            return Err(LexError::new(pos, format!("expected a name after '{}'", sigil)));
        }
        self.tokens.push(Token::new(kind, name, pos));
        Ok(())
    }

    /// `{name}` is a variable reference; any other `{` opens a block.
    fn brace(&mut self, pos: Position) {
        let mut len = 0;
        while let Some(c) = self.peek_at(1 + len) {
            if c == '_' || c == '-' || c.is_ascii_alphanumeric() {
                len += 1;
            } else {
                break;
            }
        }
        if len > 0 && self.peek_at(1 + len) == Some('}') {
            self.bump();
            let name: String = (0..len).filter_map(|_| self.bump()).collect();
            self.bump();
            self.tokens.push(Token::new(TokenKind::VarRef, name, pos));
        } else {
            self.single(TokenKind::LBrace, pos);
        }
    }

    fn string(&mut self, pos: Position) -> Result<(), LexError> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(LexError::new(pos, "unterminated string literal")),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c @ ('"' | '\\')) => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => return Err(LexError::new(pos, "unterminated string literal")),
                },
                Some(c) => text.push(c),
            }
        }
        self.tokens.push(Token::new(TokenKind::StringLiteral, text, pos));
        Ok(())
    }

    /// `( ... )` up to the matching paren, skipping over quoted text.
    fn condition(&mut self, pos: Position) -> Result<(), LexError> {
        self.bump();
        let mut depth = 1;
        let mut in_quote = false;
        let mut text = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| LexError::new(pos, "unterminated condition"))?;
            match c {
                '"' => in_quote = !in_quote,
                '\\' if in_quote => {
                    text.push(c);
                    if let Some(next) = self.bump() {
                        text.push(next);
                    }
                    continue;
                }
                '(' if !in_quote => depth += 1,
                ')' if !in_quote => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            text.push(c);
        }

        let text = text.trim().to_string();
        if !is_condition(&text) {
            return Err(LexError::new(
                pos,
                format!(
                    "expected '(if ...)', '(all success)' or '(any success)', found '({})'",
                    text
                ),
            ));
        }
        self.tokens.push(Token::new(TokenKind::ConditionExpr, text, pos));
        Ok(())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn is_condition(text: &str) -> bool {
    if text == "all success" || text == "any success" {
        return true;
    }
    match text.strip_prefix("if") {
        Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == '!' || c == '{'),
        None => false,
    }
}
