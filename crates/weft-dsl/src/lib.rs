//! The weft workflow language: tokens, syntax tree and parser.
//!
//! ```text
//! $critic := { base: review, prompt: "Be strict" }
//! explore:"find bugs":bugs -> @triage -> [code:"fix {bugs}" || $critic:"review {bugs}"]
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{AgentCall, AgentTarget, AstNode, Condition, ConditionKind, TempAgentDef, Workflow};
pub use lexer::tokenize;
pub use parser::parse;
pub use token::{Token, TokenKind};

use weft_core::CompileError;

/// Tokenize and parse in one step.
pub fn parse_source(source: &str) -> Result<Workflow, CompileError> {
    let tokens = tokenize(source)?;
    tracing::debug!(tokens = tokens.len(), "Tokenized workflow");
    Ok(parse(tokens)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_reports_lex_errors() {
        let err = parse_source("explore:\"open").unwrap_err();
        assert!(matches!(err, CompileError::Lex(_)));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let source = r#"explore:"x":r -> [code:"{r}" || review:"{r}"] -> @done"#;
        let a = parse_source(source).unwrap();
        let b = parse_source(source).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
