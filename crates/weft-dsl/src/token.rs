use std::fmt;

use serde::{Deserialize, Serialize};

use weft_core::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Agent, field or variable name segment.
    AgentName,
    /// Quoted text; `text` holds the unescaped content.
    StringLiteral,
    /// `->`
    OpSeq,
    /// `||`
    OpPar,
    /// `~>`
    OpCond,
    /// `@name`; `text` holds the name.
    Label,
    LBracket,
    RBracket,
    Colon,
    /// `{name}` outside a string; `text` holds the name.
    VarRef,
    /// `$name`; `text` holds the name.
    TempAgentRef,
    /// `:=`
    TempAgentAssign,
    /// `( ... )`; `text` holds the inner condition.
    ConditionExpr,
    LBrace,
    RBrace,
    Comma,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentName => "name",
            Self::StringLiteral => "string",
            Self::OpSeq => "'->'",
            Self::OpPar => "'||'",
            Self::OpCond => "'~>'",
            Self::Label => "label",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::Colon => "':'",
            Self::VarRef => "variable reference",
            Self::TempAgentRef => "temp agent",
            Self::TempAgentAssign => "':='",
            Self::ConditionExpr => "condition",
            Self::LBrace => "'{'",
            Self::RBrace => "'}'",
            Self::Comma => "','",
            Self::Eof => "end of input",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: Position,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, pos: Position) -> Self {
        Self {
            kind,
            text: text.into(),
            pos,
        }
    }

    /// How the token reads in an error message.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::AgentName => format!("'{}'", self.text),
            TokenKind::StringLiteral => format!("string \"{}\"", self.text),
            TokenKind::Label => format!("label @{}", self.text),
            TokenKind::VarRef => format!("{{{}}}", self.text),
            TokenKind::TempAgentRef => format!("${}", self.text),
            TokenKind::ConditionExpr => format!("condition ({})", self.text),
            kind => kind.to_string(),
        }
    }
}
