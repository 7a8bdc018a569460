use std::collections::HashSet;

use weft_core::template::is_identifier;
use weft_core::{AgentKind, ParseError, Position, Span};

use crate::ast::{AgentCall, AgentTarget, AstNode, Condition, ConditionKind, TempAgentDef, Workflow};
use crate::token::{Token, TokenKind};

/// Parse a token stream produced by [`crate::tokenize`].
///
/// Precedence, tightest first: `[...]`, `||`, `->`, `~>`.
pub fn parse(tokens: Vec<Token>) -> Result<Workflow, ParseError> {
    Parser::new(tokens).workflow()
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
    temp_agents: HashSet<String>,
}

impl Parser {
    fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let pos = tokens.last().map(|t| t.pos).unwrap_or_else(Position::start);
            tokens.push(Token::new(TokenKind::Eof, "", pos));
        }
        Self {
            tokens,
            idx: 0,
            temp_agents: HashSet::new(),
        }
    }

    fn workflow(mut self) -> Result<Workflow, ParseError> {
        let mut definitions = Vec::new();
        while self.peek().kind == TokenKind::TempAgentRef
            && self.peek_at(1).kind == TokenKind::TempAgentAssign
        {
            definitions.push(self.temp_agent_def()?);
        }

        let body = self.conditional()?;
        let next = self.peek();
        if next.kind != TokenKind::Eof {
            let expected = if next.kind == TokenKind::RBracket {
                "operator or end of input (unmatched ']')"
            } else {
                "operator or end of input"
            };
            return Err(self.unexpected(expected));
        }
        Ok(Workflow { definitions, body })
    }

    // ── Token access ──────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.idx + ahead).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.idx += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let found = self.peek();
        ParseError::Unexpected {
            pos: found.pos,
            expected: expected.to_string(),
            found: found.describe(),
        }
    }

    fn identifier(&mut self, expected: &str) -> Result<String, ParseError> {
        let token = self.expect(TokenKind::AgentName, expected)?;
        checked_identifier(&token.text, token.pos)
    }

    // ── Grammar ───────────────────────────────────────────────────

    /// `$name := { base: kind, prompt: "...", model: "..." }`
    fn temp_agent_def(&mut self) -> Result<TempAgentDef, ParseError> {
        let head = self.advance();
        let name = checked_identifier(&head.text, head.pos)?;
        self.expect(TokenKind::TempAgentAssign, "':='")?;
        self.expect(TokenKind::LBrace, "'{'")?;

        let mut base = None;
        let mut prompt = None;
        let mut model = None;
        while self.peek().kind != TokenKind::RBrace {
            let field = self.expect(TokenKind::AgentName, "field name")?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = match self.peek().kind {
                TokenKind::StringLiteral | TokenKind::AgentName => self.advance(),
                _ => return Err(self.unexpected("field value")),
            };
            match field.text.as_str() {
                "base" => {
                    let kind = value.text.parse::<AgentKind>().map_err(|reason| {
                        ParseError::InvalidTempAgent {
                            pos: value.pos,
                            name: name.clone(),
                            reason,
                        }
                    })?;
                    base = Some(kind);
                }
                "prompt" => prompt = Some(value.text),
                "model" => model = Some(value.text),
                other => {
                    return Err(ParseError::InvalidTempAgent {
                        pos: field.pos,
                        name,
                        reason: format!("unknown field '{}'", other),
                    });
                }
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}' or ','")?;

        let missing = |field: &str| ParseError::InvalidTempAgent {
            pos: head.pos,
            name: name.clone(),
            reason: format!("missing '{}'", field),
        };
        let base = base.ok_or_else(|| missing("base"))?;
        let prompt = prompt.ok_or_else(|| missing("prompt"))?;

        if !self.temp_agents.insert(name.clone()) {
            return Err(ParseError::DuplicateTempAgent {
                pos: head.pos,
                name,
            });
        }
        Ok(TempAgentDef {
            name,
            base,
            prompt,
            model,
            pos: head.pos,
        })
    }

    /// `seq ( CONDITION [":" ident] "~>" [seq] )*`
    fn conditional(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.sequence()?;
        loop {
            match self.peek().kind {
                TokenKind::ConditionExpr => {}
                TokenKind::OpCond => return Err(self.unexpected("condition before '~>'")),
                _ => break,
            }
            let token = self.advance();
            let condition = parse_condition(&token)?;
            let bind_var = if self.eat(TokenKind::Colon) {
                Some(self.identifier("variable name")?)
            } else {
                None
            };
            self.expect(TokenKind::OpCond, "'~>'")?;

            let target = if starts_operand(self.peek().kind) {
                Some(Box::new(self.sequence()?))
            } else if bind_var.is_some() {
                None
            } else {
                return Err(self.unexpected("workflow step after '~>'"));
            };

            node = AstNode::Conditional {
                source: Box::new(node),
                condition,
                bind_var,
                target,
            };
        }
        Ok(node)
    }

    /// `par ( "->" par )*`
    fn sequence(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parallel()?;
        while self.eat(TokenKind::OpSeq) {
            let right = self.parallel()?;
            node = AstNode::Sequence {
                left: Box::new(node),
                right: Box::new(right),
            };
        }
        Ok(node)
    }

    /// `atom ( "||" atom )*`
    fn parallel(&mut self) -> Result<AstNode, ParseError> {
        let first = self.atom()?;
        if self.peek().kind != TokenKind::OpPar {
            return Ok(first);
        }
        let mut branches = vec![first];
        while self.eat(TokenKind::OpPar) {
            branches.push(self.atom()?);
        }
        Ok(AstNode::Parallel { branches })
    }

    fn atom(&mut self) -> Result<AstNode, ParseError> {
        match self.peek().kind {
            TokenKind::LBracket => {
                let open = self.advance();
                let body = self.conditional()?;
                let close = self.expect(TokenKind::RBracket, "']'")?;
                Ok(AstNode::Subgraph {
                    body: Box::new(body),
                    span: Span {
                        start: open.pos,
                        end: Some(close.pos),
                    },
                })
            }
            TokenKind::Label => {
                let token = self.advance();
                let label = checked_identifier(&token.text, token.pos)?;
                let prompt = if self.peek().kind == TokenKind::Colon
                    && self.peek_at(1).kind == TokenKind::StringLiteral
                {
                    self.advance();
                    Some(self.advance().text)
                } else {
                    None
                };
                Ok(AstNode::Checkpoint {
                    label,
                    prompt,
                    pos: token.pos,
                })
            }
            TokenKind::AgentName | TokenKind::TempAgentRef => self.agent_call(),
            _ => Err(self.unexpected("agent call, checkpoint or '['")),
        }
    }

    /// `(name (":" name)* | "$" name) ":" (string | {var}) [":" ident]`
    fn agent_call(&mut self) -> Result<AstNode, ParseError> {
        let head = self.advance();
        let agent = if head.kind == TokenKind::TempAgentRef {
            let name = checked_identifier(&head.text, head.pos)?;
            if !self.temp_agents.contains(&name) {
                return Err(ParseError::UndefinedTempAgent {
                    pos: head.pos,
                    name,
                });
            }
            self.expect(TokenKind::Colon, "':' and an instruction")?;
            AgentTarget::Temp(name)
        } else {
            let mut segments = vec![checked_identifier(&head.text, head.pos)?];
            loop {
                self.expect(TokenKind::Colon, "':' and an instruction")?;
                if self.peek().kind != TokenKind::AgentName {
                    break;
                }
                let seg = self.advance();
                segments.push(checked_identifier(&seg.text, seg.pos)?);
            }
            AgentTarget::Named(segments.join(":"))
        };

        let instruction = match self.peek().kind {
            TokenKind::StringLiteral => self.advance().text,
            TokenKind::VarRef => format!("{{{}}}", self.advance().text),
            _ => return Err(self.unexpected("instruction string")),
        };

        let output_var = if self.peek().kind == TokenKind::Colon
            && self.peek_at(1).kind == TokenKind::AgentName
        {
            self.advance();
            Some(self.identifier("output variable")?)
        } else {
            None
        };

        Ok(AstNode::AgentCall(AgentCall {
            agent,
            instruction,
            output_var,
            pos: head.pos,
        }))
    }
}

fn starts_operand(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::AgentName | TokenKind::TempAgentRef | TokenKind::Label | TokenKind::LBracket
    )
}

fn checked_identifier(text: &str, pos: Position) -> Result<String, ParseError> {
    if is_identifier(text) {
        Ok(text.to_string())
    } else {
        Err(ParseError::InvalidIdentifier {
            pos,
            ident: text.to_string(),
        })
    }
}

/// Classify the inside of `( ... )`.
fn parse_condition(token: &Token) -> Result<Condition, ParseError> {
    let text = token.text.trim();
    let body = text.strip_prefix("if").map(str::trim).unwrap_or(text);
    let (body, negate) = match body.strip_prefix('!') {
        Some(rest) => (rest.trim(), true),
        None => (body, false),
    };

    let kind = match body {
        "" => {
            return Err(ParseError::Unexpected {
                pos: token.pos,
                expected: "condition text".into(),
                found: format!("({})", token.text),
            });
        }
        "all success" => ConditionKind::AllSuccess,
        "any success" => ConditionKind::AnySuccess,
        _ => {
            let braced = body
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .filter(|name| is_identifier(name));
            match braced {
                Some(name) => ConditionKind::Var(name.to_string()),
                None if is_identifier(body) => ConditionKind::Named(body.to_string()),
                None => ConditionKind::Literal(body.to_string()),
            }
        }
    };

    Ok(Condition {
        kind,
        negate,
        pos: token.pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(source: &str) -> Result<Workflow, ParseError> {
        parse(tokenize(source).expect("lexes"))
    }

    fn call_agent(node: &AstNode) -> String {
        match node {
            AstNode::AgentCall(call) => call.agent.source_name(),
            other => panic!("expected agent call, got {:?}", other),
        }
    }

    #[test]
    fn test_single_call_with_output() {
        let wf = parse_src(r#"explore:"find bugs":bugs"#).unwrap();
        match wf.body {
            AstNode::AgentCall(call) => {
                assert_eq!(call.agent, AgentTarget::Named("explore".into()));
                assert_eq!(call.instruction, "find bugs");
                assert_eq!(call.output_var.as_deref(), Some("bugs"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_namespaced_agent() {
        let wf = parse_src(r#"tools:lint:"check style""#).unwrap();
        assert_eq!(call_agent(&wf.body), "tools:lint");
    }

    #[test]
    fn test_var_ref_instruction() {
        let wf = parse_src(r#"plan:"p":steps -> code:{steps}"#).unwrap();
        let AstNode::Sequence { right, .. } = wf.body else {
            panic!("expected sequence");
        };
        let AstNode::AgentCall(call) = *right else {
            panic!("expected call");
        };
        assert_eq!(call.instruction, "{steps}");
    }

    #[test]
    fn test_parallel_binds_tighter_than_sequence() {
        let wf = parse_src(r#"a:"1" || b:"2" -> c:"3""#).unwrap();
        let AstNode::Sequence { left, right } = wf.body else {
            panic!("expected sequence at the top");
        };
        match *left {
            AstNode::Parallel { ref branches } => assert_eq!(branches.len(), 2),
            ref other => panic!("expected parallel, got {:?}", other),
        }
        assert_eq!(call_agent(&right), "c");
    }

    #[test]
    fn test_sequence_binds_tighter_than_conditional() {
        let wf = parse_src(r#"a:"1" -> b:"2" (if ready)~> c:"3" -> d:"4""#).unwrap();
        let AstNode::Conditional {
            source,
            condition,
            target,
            bind_var,
        } = wf.body
        else {
            panic!("expected conditional at the top");
        };
        assert!(matches!(*source, AstNode::Sequence { .. }));
        assert!(matches!(
            target.as_deref(),
            Some(AstNode::Sequence { .. })
        ));
        assert_eq!(condition.kind, ConditionKind::Named("ready".into()));
        assert!(bind_var.is_none());
    }

    #[test]
    fn test_binding_step_without_target() {
        let wf = parse_src(r#"test:"run" (if passed):ok ~> (if ok)~> deploy:"ship""#).unwrap();
        let AstNode::Conditional {
            source,
            condition,
            target,
            ..
        } = wf.body
        else {
            panic!("expected conditional");
        };
        assert_eq!(condition.kind, ConditionKind::Named("ok".into()));
        assert_eq!(call_agent(target.as_deref().unwrap()), "deploy");
        match *source {
            AstNode::Conditional {
                bind_var, target, ..
            } => {
                assert_eq!(bind_var.as_deref(), Some("ok"));
                assert!(target.is_none());
            }
            other => panic!("expected inner binding, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_kinds() {
        let cases = [
            ("(all success)", ConditionKind::AllSuccess, false),
            ("(any success)", ConditionKind::AnySuccess, false),
            ("(if {ok})", ConditionKind::Var("ok".into()), false),
            ("(if !ok)", ConditionKind::Named("ok".into()), true),
            (
                "(if tests pass)",
                ConditionKind::Literal("tests pass".into()),
                false,
            ),
            ("(if !all success)", ConditionKind::AllSuccess, true),
        ];
        for (cond, kind, negate) in cases {
            let source = format!(r#"a:"x" {}~> b:"y""#, cond);
            let wf = parse_src(&source).unwrap();
            let AstNode::Conditional { condition, .. } = wf.body else {
                panic!("expected conditional for {}", cond);
            };
            assert_eq!(condition.kind, kind, "{}", cond);
            assert_eq!(condition.negate, negate, "{}", cond);
        }
    }

    #[test]
    fn test_checkpoint_with_prompt() {
        let wf = parse_src(r#"a:"x" -> @review:"Look at the plan" -> b:"y""#).unwrap();
        let AstNode::Sequence { left, .. } = wf.body else {
            panic!("expected sequence");
        };
        let AstNode::Sequence { right, .. } = *left else {
            panic!("expected nested sequence");
        };
        assert_eq!(
            *right,
            AstNode::Checkpoint {
                label: "review".into(),
                prompt: Some("Look at the plan".into()),
                pos: Position::new(9, 1, 10),
            }
        );
    }

    #[test]
    fn test_temp_agent_definitions() {
        let wf = parse_src(
            r#"
            $critic := { base: review, prompt: "Be harsh", model: "large" }
            $critic:"review {diff}"
            "#,
        )
        .unwrap();
        assert_eq!(wf.definitions.len(), 1);
        let def = &wf.definitions[0];
        assert_eq!(def.name, "critic");
        assert_eq!(def.base, AgentKind::Review);
        assert_eq!(def.model.as_deref(), Some("large"));
        assert_eq!(call_agent(&wf.body), "$critic");
    }

    #[test]
    fn test_undefined_temp_agent() {
        let err = parse_src(r#"$ghost:"boo""#).unwrap_err();
        assert!(matches!(err, ParseError::UndefinedTempAgent { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_temp_agent_bad_base() {
        let err = parse_src(r#"$x := { base: wizard, prompt: "p" } $x:"go""#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidTempAgent { .. }));
    }

    #[test]
    fn test_temp_agent_defined_twice() {
        let err = parse_src(
            r#"$x := { base: plan, prompt: "p" } $x := { base: code, prompt: "q" } $x:"go""#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::DuplicateTempAgent { .. }));
    }

    #[test]
    fn test_unclosed_bracket() {
        let err = parse_src(r#"[a:"x" -> b:"y""#).unwrap_err();
        match err {
            ParseError::Unexpected {
                expected, found, ..
            } => {
                assert_eq!(expected, "']'");
                assert_eq!(found, "end of input");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_stray_closing_bracket() {
        let err = parse_src(r#"a:"x"] -> b:"y""#).unwrap_err();
        assert!(err.to_string().contains("unmatched ']'"));
    }

    #[test]
    fn test_condition_without_operand() {
        let err = parse_src(r#"(if ok)~> a:"x""#).unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { .. }));
        assert_eq!(err.position(), Position::start());
    }

    #[test]
    fn test_cond_operator_without_condition() {
        let err = parse_src(r#"a:"x" ~> b:"y""#).unwrap_err();
        assert!(err.to_string().contains("condition before '~>'"));
    }

    #[test]
    fn test_missing_target() {
        let err = parse_src(r#"a:"x" (if ok)~>"#).unwrap_err();
        assert!(err.to_string().contains("workflow step after '~>'"));
    }

    #[test]
    fn test_invalid_identifier() {
        let err = parse_src(r#"bad.name:"x""#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidIdentifier { ref ident, .. } if ident == "bad.name"));
    }

    #[test]
    fn test_missing_instruction() {
        let err = parse_src("explore -> code:\"x\"").unwrap_err();
        assert!(err.to_string().contains("':' and an instruction"));
    }
}
