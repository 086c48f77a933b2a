//! Parser
//!
//! Recursive descent with precedence climbing, lowest to highest:
//! `or`, unary `not`, `and`, comparisons, `+`, postfix (`.`, `[]`, `()`),
//! primary. Assignment is disambiguated from expression statements by
//! bounded lookahead through `.`/`[...]` tails for a top-level `=`.

use crate::ast::{BinOp, Expr, Stmt, StmtKind};
use crate::token::{Keyword, Token, TokenKind};
use crate::ParseError;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

/// Parse a full token stream into a statement list.
pub fn parse_program(tokens: &[Token]) -> Result<Vec<Stmt>, ParseError> {
    let mut parser = Parser { tokens, pos: 0 };
    let mut stmts = Vec::new();
    loop {
        parser.skip_newlines();
        if parser.check(&TokenKind::Eof) {
            break;
        }
        stmts.push(parser.parse_stmt()?);
    }
    Ok(stmts)
}

impl<'a> Parser<'a> {
    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Keyword(Keyword::Def) => self.parse_func_def()?,
            TokenKind::Keyword(Keyword::Class) => self.parse_class_def()?,
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Return) => self.parse_return()?,
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.end_statement()?;
                StmtKind::Break
            }
            TokenKind::Keyword(Keyword::With) => self.parse_with_policy()?,
            TokenKind::Keyword(Keyword::Retry) => self.parse_retry()?,
            TokenKind::Keyword(Keyword::Timeout) => self.parse_timeout()?,
            TokenKind::Keyword(Keyword::Guard) => {
                self.advance();
                let cond = self.parse_expr()?;
                self.end_statement()?;
                StmtKind::Guard { cond }
            }
            _ => {
                if self.looks_like_assignment() {
                    self.parse_assignment()?
                } else {
                    let expr = self.parse_expr()?;
                    self.end_statement()?;
                    StmtKind::ExprStmt(expr)
                }
            }
        };
        Ok(Stmt { line, kind })
    }

    fn parse_func_def(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // def
        let name = self.expect_ident("function name")?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if self.eat(&TokenKind::Comma) {
                    if self.check(&TokenKind::RParen) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(StmtKind::FuncDef { name, params, body })
    }

    fn parse_class_def(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // class
        let name = self.expect_ident("class name")?;
        let body = self.parse_block()?;
        Ok(StmtKind::ClassDef { name, body })
    }

    fn parse_if(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // if
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if self.check(&TokenKind::Keyword(Keyword::Else)) {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(StmtKind::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // while
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtKind::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // for
        let var = self.expect_ident("loop variable")?;
        self.expect(TokenKind::Keyword(Keyword::In))?;
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtKind::For { var, iter, body })
    }

    fn parse_return(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // return
        let value = if self.check(&TokenKind::Newline) || self.check(&TokenKind::Eof) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.end_statement()?;
        Ok(StmtKind::Return(value))
    }

    fn parse_with_policy(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // with
        self.expect(TokenKind::Keyword(Keyword::Policy))?;
        let overlay = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtKind::WithPolicy { overlay, body })
    }

    fn parse_retry(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // retry
        let attempts = self.expect_int("retry attempt count")?;
        self.expect(TokenKind::Keyword(Keyword::Backoff))?;
        let backoff_ms = self.expect_int("backoff milliseconds")?;
        let body = self.parse_block()?;
        Ok(StmtKind::Retry {
            attempts,
            backoff_ms,
            body,
        })
    }

    fn parse_timeout(&mut self) -> Result<StmtKind, ParseError> {
        self.advance(); // timeout
        let ms = self.expect_int("timeout milliseconds")?;
        let body = self.parse_block()?;
        Ok(StmtKind::Timeout { ms, body })
    }

    /// `:` NEWLINE INDENT stmts DEDENT
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(&TokenKind::Dedent) {
                self.advance();
                break;
            }
            if self.check(&TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        if stmts.is_empty() {
            return Err(ParseError::new(self.line(), "block must not be empty"));
        }
        Ok(stmts)
    }

    /// Bounded lookahead: IDENT (`.` IDENT | `[` … `]`)* `=` outside
    /// brackets means this statement is an assignment.
    fn looks_like_assignment(&self) -> bool {
        let mut i = self.pos;
        if !matches!(self.tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident(_))) {
            return false;
        }
        i += 1;
        loop {
            match self.tokens.get(i).map(|t| &t.kind) {
                Some(TokenKind::Assign) => return true,
                Some(TokenKind::Dot) => {
                    if !matches!(
                        self.tokens.get(i + 1).map(|t| &t.kind),
                        Some(TokenKind::Ident(_))
                    ) {
                        return false;
                    }
                    i += 2;
                }
                Some(TokenKind::LBracket) => {
                    let mut depth = 1usize;
                    i += 1;
                    while depth > 0 {
                        match self.tokens.get(i).map(|t| &t.kind) {
                            Some(TokenKind::LBracket) => depth += 1,
                            Some(TokenKind::RBracket) => depth -= 1,
                            Some(TokenKind::Eof) | None => return false,
                            _ => {}
                        }
                        i += 1;
                    }
                }
                _ => return false,
            }
        }
    }

    fn parse_assignment(&mut self) -> Result<StmtKind, ParseError> {
        let line = self.line();
        let name = self.expect_ident("assignment target")?;
        let mut target = Expr::Var(name);
        loop {
            if self.eat(&TokenKind::Dot) {
                let field = self.expect_ident("member name")?;
                target = Expr::Member(Box::new(target), field);
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(TokenKind::RBracket)?;
                target = Expr::Index(Box::new(target), Box::new(index));
            } else {
                break;
            }
        }
        self.expect(TokenKind::Assign)?;
        let value = self.parse_expr()?;
        self.end_statement()?;
        Ok(match target {
            Expr::Var(name) => StmtKind::Assign { name, value },
            Expr::Member(target, field) => StmtKind::MemberAssign {
                target: *target,
                field,
                value,
            },
            Expr::Index(target, index) => StmtKind::IndexAssign {
                target: *target,
                index: *index,
                value,
            },
            _ => return Err(ParseError::new(line, "invalid assignment target")),
        })
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&TokenKind::Keyword(Keyword::Or)) {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::Keyword(Keyword::Not)) {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_and()
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&TokenKind::Keyword(Keyword::And)) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::NotEq,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::LtEq => BinOp::LtEq,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::GtEq => BinOp::GtEq,
                TokenKind::Keyword(Keyword::In) => BinOp::In,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_postfix()?;
        while self.eat(&TokenKind::Plus) {
            let rhs = self.parse_postfix()?;
            lhs = Expr::Binary(BinOp::Add, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let name = self.expect_ident("member name")?;
                if self.check(&TokenKind::LParen) {
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall {
                        target: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.check(&TokenKind::LParen) {
                let args = self.parse_call_args()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(&TokenKind::Comma) {
                    if self.check(&TokenKind::RParen) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Var(name))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_object_literal(),
            other => Err(ParseError::new(
                line,
                format!("expected an expression, found {}", other.describe()),
            )),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LBracket)?;
        let mut items = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            loop {
                items.push(self.parse_expr()?);
                if self.eat(&TokenKind::Comma) {
                    if self.check(&TokenKind::RBracket) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::Array(items))
    }

    fn parse_object_literal(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut entries = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let line = self.line();
                let key = match self.peek().clone() {
                    TokenKind::Ident(name) => {
                        self.advance();
                        name
                    }
                    TokenKind::Str(s) => {
                        self.advance();
                        s
                    }
                    other => {
                        return Err(ParseError::new(
                            line,
                            format!(
                                "expected an object key (identifier or string), found {}",
                                other.describe()
                            ),
                        ))
                    }
                };
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expr()?;
                entries.push((key, value));
                if self.eat(&TokenKind::Comma) {
                    if self.check(&TokenKind::RBrace) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Object(entries))
    }

    // ---- token plumbing ----

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::new(
                self.line(),
                format!(
                    "expected {}, found {}",
                    kind.describe(),
                    self.peek().describe()
                ),
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ParseError::new(
                self.line(),
                format!("expected {}, found {}", what, other.describe()),
            )),
        }
    }

    fn expect_int(&mut self, what: &str) -> Result<i64, ParseError> {
        match *self.peek() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(n)
            }
            ref other => Err(ParseError::new(
                self.line(),
                format!("expected {}, found {}", what, other.describe()),
            )),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn end_statement(&mut self) -> Result<(), ParseError> {
        if self.eat(&TokenKind::Newline) || self.check(&TokenKind::Eof) {
            return Ok(());
        }
        Err(ParseError::new(
            self.line(),
            format!("expected end of statement, found {}", self.peek().describe()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(source: &str) -> Vec<Stmt> {
        let tokens = tokenize(source).expect("tokenize");
        parse_program(&tokens).expect("parse")
    }

    #[test]
    fn test_precedence_or_not_and() {
        let stmts = parse("x = a or not b and c\n");
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => match value {
                Expr::Binary(BinOp::Or, _, rhs) => match rhs.as_ref() {
                    Expr::Not(inner) => {
                        assert!(matches!(inner.as_ref(), Expr::Binary(BinOp::And, _, _)))
                    }
                    other => panic!("expected not(...), got {:?}", other),
                },
                other => panic!("expected or at the top, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_tighter_than_and() {
        let stmts = parse("ok = a < 2 and b == 3\n");
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value, Expr::Binary(BinOp::And, _, _)));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_member_and_index_assignment_targets() {
        let stmts = parse("a.b = 1\nc[0] = 2\nd.e[1].f = 3\n");
        assert!(matches!(stmts[0].kind, StmtKind::MemberAssign { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::IndexAssign { .. }));
        match &stmts[2].kind {
            StmtKind::MemberAssign { target, field, .. } => {
                assert_eq!(field, "f");
                assert!(matches!(target, Expr::Index(_, _)));
            }
            other => panic!("expected member assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_equality_is_not_mistaken_for_assignment() {
        let stmts = parse("a == b\n");
        assert!(matches!(stmts[0].kind, StmtKind::ExprStmt(_)));
    }

    #[test]
    fn test_object_literal_with_string_keys_and_trailing_comma() {
        let stmts = parse("o = {a: 1, \"b c\": 2,}\n");
        match &stmts[0].kind {
            StmtKind::Assign { value: Expr::Object(entries), .. } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, "a");
                assert_eq!(entries[1].0, "b c");
            }
            other => panic!("expected object assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_function_and_class_definitions() {
        let source = "def add(a, b):\n    return a + b\nclass Counter:\n    def bump(n):\n        self.count = self.count + n\n";
        let stmts = parse(source);
        match &stmts[0].kind {
            StmtKind::FuncDef { name, params, body } => {
                assert_eq!(name, "add");
                assert_eq!(params, &["a".to_string(), "b".to_string()]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected def, got {:?}", other),
        }
        assert!(matches!(stmts[1].kind, StmtKind::ClassDef { .. }));
    }

    #[test]
    fn test_if_else_while_for() {
        let source = "if x:\n    y = 1\nelse:\n    y = 2\nwhile y:\n    break\nfor i in range(3):\n    log(i)\n";
        let stmts = parse(source);
        match &stmts[0].kind {
            StmtKind::If { else_body, .. } => assert!(else_body.is_some()),
            other => panic!("expected if, got {:?}", other),
        }
        assert!(matches!(stmts[1].kind, StmtKind::While { .. }));
        match &stmts[2].kind {
            StmtKind::For { var, iter, .. } => {
                assert_eq!(var, "i");
                assert!(matches!(iter, Expr::Call { .. }));
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_scope_guard_forms() {
        let source = "with policy {allowActions: [\"READ_FILE\"]}:\n    x = 1\nretry 3 backoff 50:\n    y = 2\ntimeout 1000:\n    z = 3\nguard z\n";
        let stmts = parse(source);
        assert!(matches!(stmts[0].kind, StmtKind::WithPolicy { .. }));
        match &stmts[1].kind {
            StmtKind::Retry {
                attempts,
                backoff_ms,
                ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(*backoff_ms, 50);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        match &stmts[2].kind {
            StmtKind::Timeout { ms, .. } => assert_eq!(*ms, 1000),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(matches!(stmts[3].kind, StmtKind::Guard { .. }));
    }

    #[test]
    fn test_callable_values_and_method_calls() {
        let stmts = parse("r = client(\"prompt\")\ns = obj.method(1, 2)\nt = arr[0].name\n");
        match &stmts[0].kind {
            StmtKind::Assign { value: Expr::Call { callee, args }, .. } => {
                assert!(matches!(callee.as_ref(), Expr::Var(name) if name == "client"));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected call, got {:?}", other),
        }
        assert!(matches!(
            stmts[1].kind,
            StmtKind::Assign { value: Expr::MethodCall { .. }, .. }
        ));
    }

    #[test]
    fn test_in_operator() {
        let stmts = parse("found = \"a\" in items\n");
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value, Expr::Binary(BinOp::In, _, _)));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_carries_line_number() {
        let tokens = tokenize("x = 1\ny = +\n").expect("tokenize");
        let err = parse_program(&tokens).expect_err("must fail");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let tokens = tokenize("if x:\ny = 1\n").expect("tokenize");
        assert!(parse_program(&tokens).is_err());
    }
}
