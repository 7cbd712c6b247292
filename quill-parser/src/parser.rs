// quill-parser - Recursive descent parser for Quill
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Recursive-descent parser with explicit precedence climbing.
//!
//! Precedence, lowest to highest: assignment (right-assoc, compound forms
//! desugared) → `||` → `&&` → equality → comparison → additive →
//! multiplicative → power (right-assoc) → unary → postfix → primary.
//!
//! The first error aborts parsing; there is no error recovery.

use std::fmt;

use crate::ast::{Ast, BinOp, ExprId, ExprKind, Program, Span, StmtId, StmtKind, UnOp};
use crate::lexer::{LexError, Lexer, Token, TokenKind};

/// Parse error with position information.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parse error at {}:{}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            message: err.message,
            line: err.line,
            column: err.column,
        }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

/// The parser. Owns the AST arena it allocates into.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    ast: Ast,
}

impl<'a> Parser<'a> {
    /// Create a parser over the given source.
    pub fn new(source: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current,
            ast: Ast::new(),
        })
    }

    /// Parse a whole source string into a program.
    pub fn parse_source(source: &str) -> Result<Program> {
        Parser::new(source)?.parse_program()
    }

    /// Parse the top-level statement list.
    pub fn parse_program(mut self) -> Result<Program> {
        let mut body = Vec::new();
        while self.current.kind != TokenKind::Eof {
            body.push(self.statement()?);
        }
        Ok(Program {
            ast: self.ast,
            body,
        })
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn span(&self) -> Span {
        Span {
            line: self.current.line,
            column: self.current.column,
        }
    }

    fn advance(&mut self) -> Result<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn match_token(&mut self, kind: &TokenKind) -> Result<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.current.kind == kind {
            self.advance()
        } else {
            Err(self.error_here(format!("Expected {}, found {}", what, self.current.kind)))
        }
    }

    fn error_here(&self, message: String) -> ParseError {
        ParseError {
            message,
            line: self.current.line,
            column: self.current.column,
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> Result<StmtId> {
        let span = self.span();
        match self.current.kind {
            TokenKind::Let => self.let_statement(span),
            TokenKind::If => self.if_statement(span),
            TokenKind::While => self.while_statement(span),
            TokenKind::For => self.for_statement(span),
            TokenKind::Break => {
                self.advance()?;
                self.match_token(&TokenKind::Semicolon)?;
                Ok(self.ast.add_stmt(StmtKind::Break, span))
            }
            TokenKind::Continue => {
                self.advance()?;
                self.match_token(&TokenKind::Semicolon)?;
                Ok(self.ast.add_stmt(StmtKind::Continue, span))
            }
            TokenKind::Return => {
                self.advance()?;
                let value = if self.at_expression_end() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.match_token(&TokenKind::Semicolon)?;
                Ok(self.ast.add_stmt(StmtKind::Return { value }, span))
            }
            TokenKind::LBrace => self.block(),
            TokenKind::Fn => {
                if self.peek_is_ident()? {
                    // Statement-level named function literal binds its
                    // name.
                    let func = self.function_literal()?;
                    let name = match &self.ast.expr(func).kind {
                        ExprKind::Function {
                            name: Some(name), ..
                        } => name.clone(),
                        _ => unreachable!("peeked identifier after fn"),
                    };
                    Ok(self.ast.add_stmt(
                        StmtKind::Let {
                            name,
                            init: Some(func),
                        },
                        span,
                    ))
                } else {
                    self.expr_statement(span)
                }
            }
            _ => self.expr_statement(span),
        }
    }

    fn expr_statement(&mut self, span: Span) -> Result<StmtId> {
        let expr = self.expression()?;
        self.match_token(&TokenKind::Semicolon)?;
        Ok(self.ast.add_stmt(StmtKind::Expr { expr }, span))
    }

    fn peek_is_ident(&mut self) -> Result<bool> {
        Ok(matches!(
            self.lexer.peek_token()?.kind,
            TokenKind::Ident(_)
        ))
    }

    fn at_expression_end(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        )
    }

    fn let_statement(&mut self, span: Span) -> Result<StmtId> {
        self.advance()?; // let
        let name = self.expect_ident("variable name")?;
        let init = if self.match_token(&TokenKind::Eq)? {
            Some(self.expression()?)
        } else {
            None
        };
        self.match_token(&TokenKind::Semicolon)?;
        Ok(self.ast.add_stmt(StmtKind::Let { name, init }, span))
    }

    fn if_statement(&mut self, span: Span) -> Result<StmtId> {
        self.advance()?; // if
        let cond = self.expression()?;
        let then_branch = self.statement()?;
        let else_branch = if self.match_token(&TokenKind::Else)? {
            Some(self.statement()?)
        } else {
            None
        };
        Ok(self.ast.add_stmt(
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            span,
        ))
    }

    fn while_statement(&mut self, span: Span) -> Result<StmtId> {
        self.advance()?; // while
        let cond = self.expression()?;
        let body = self.statement()?;
        Ok(self.ast.add_stmt(StmtKind::While { cond, body }, span))
    }

    fn for_statement(&mut self, span: Span) -> Result<StmtId> {
        self.advance()?; // for
        self.expect(TokenKind::LParen, "'('")?;

        let init = if self.match_token(&TokenKind::Semicolon)? {
            None
        } else {
            // The init statement consumes its own terminating semicolon.
            Some(self.statement()?)
        };

        let cond = if self.match_token(&TokenKind::Semicolon)? {
            None
        } else {
            let cond = self.expression()?;
            self.expect(TokenKind::Semicolon, "';'")?;
            Some(cond)
        };

        let incr = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(TokenKind::RParen, "')'")?;

        let body = self.statement()?;
        Ok(self.ast.add_stmt(
            StmtKind::For {
                init,
                cond,
                incr,
                body,
            },
            span,
        ))
    }

    fn block(&mut self) -> Result<StmtId> {
        let span = self.span();
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            stmts.push(self.statement()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(self.ast.add_stmt(StmtKind::Block { stmts }, span))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) -> Result<ExprId> {
        if self.check(&TokenKind::Yield) {
            let span = self.span();
            self.advance()?;
            let value = if self.at_expression_end()
                || self.check(&TokenKind::RParen)
                || self.check(&TokenKind::Comma)
                || self.check(&TokenKind::RBracket)
            {
                None
            } else {
                Some(self.expression()?)
            };
            return Ok(self.ast.add_expr(ExprKind::Yield { value }, span));
        }
        self.assignment()
    }

    fn assignment(&mut self) -> Result<ExprId> {
        let target = self.logical_or()?;

        let compound = match self.current.kind {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            _ => return Ok(target),
        };

        let span = self.span();
        if !matches!(
            self.ast.expr(target).kind,
            ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. }
        ) {
            return Err(self.error_here("Invalid assignment target".into()));
        }
        self.advance()?;

        // Right associative; going through `expression` keeps yield
        // legal on the right-hand side.
        let rhs = self.expression()?;
        let value = match compound {
            // `a += b` desugars to `a = a + b`.
            Some(op) => self.ast.add_expr(
                ExprKind::Binary {
                    op,
                    lhs: target,
                    rhs,
                },
                span,
            ),
            None => rhs,
        };
        Ok(self.ast.add_expr(ExprKind::Assign { target, value }, span))
    }

    fn logical_or(&mut self) -> Result<ExprId> {
        let mut lhs = self.logical_and()?;
        while self.check(&TokenKind::PipePipe) {
            let span = self.span();
            self.advance()?;
            let rhs = self.logical_and()?;
            lhs = self
                .ast
                .add_expr(ExprKind::Binary { op: BinOp::Or, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<ExprId> {
        let mut lhs = self.equality()?;
        while self.check(&TokenKind::AmpAmp) {
            let span = self.span();
            self.advance()?;
            let rhs = self.equality()?;
            lhs = self
                .ast
                .add_expr(ExprKind::Binary { op: BinOp::And, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<ExprId> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::BangEq => BinOp::Ne,
                _ => break,
            };
            let span = self.span();
            self.advance()?;
            let rhs = self.comparison()?;
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<ExprId> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::LtEq => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::GtEq => BinOp::Ge,
                _ => break,
            };
            let span = self.span();
            self.advance()?;
            let rhs = self.additive()?;
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<ExprId> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.span();
            self.advance()?;
            let rhs = self.multiplicative()?;
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<ExprId> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let span = self.span();
            self.advance()?;
            let rhs = self.power()?;
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<ExprId> {
        let lhs = self.unary()?;
        if self.check(&TokenKind::Caret) {
            let span = self.span();
            self.advance()?;
            let rhs = self.power()?; // right associative
            return Ok(self.ast.add_expr(
                ExprKind::Binary {
                    op: BinOp::Pow,
                    lhs,
                    rhs,
                },
                span,
            ));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<ExprId> {
        let op = match self.current.kind {
            TokenKind::Bang => UnOp::Not,
            TokenKind::Minus => UnOp::Neg,
            _ => return self.postfix(),
        };
        let span = self.span();
        self.advance()?;
        let operand = self.unary()?;
        Ok(self.ast.add_expr(ExprKind::Unary { op, operand }, span))
    }

    fn postfix(&mut self) -> Result<ExprId> {
        let mut expr = self.primary()?;
        loop {
            match self.current.kind {
                TokenKind::LParen => {
                    let span = self.span();
                    self.advance()?;
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.match_token(&TokenKind::Comma)? {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    expr = self
                        .ast
                        .add_expr(ExprKind::Call { callee: expr, args }, span);
                }
                TokenKind::LBracket => {
                    let span = self.span();
                    self.advance()?;
                    let index = self.expression()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    expr = self.ast.add_expr(
                        ExprKind::Index {
                            object: expr,
                            index,
                        },
                        span,
                    );
                }
                TokenKind::Dot => {
                    let span = self.span();
                    self.advance()?;
                    let name = self.expect_ident("field name")?;
                    expr = self.ast.add_expr(
                        ExprKind::Field {
                            object: expr,
                            name,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<ExprId> {
        let span = self.span();
        match self.current.kind.clone() {
            TokenKind::Nil => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Nil, span))
            }
            TokenKind::True => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Bool(true), span))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Bool(false), span))
            }
            TokenKind::Number(value) => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Number(value), span))
            }
            TokenKind::Str(text) => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Str(text), span))
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                Ok(self.ast.add_expr(ExprKind::Ident(name), span))
            }
            TokenKind::LParen => {
                self.advance()?;
                let expr = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBrace => self.table_literal(span),
            TokenKind::Fn => self.function_literal(),
            other => Err(self.error_here(format!("Unexpected token {}", other))),
        }
    }

    fn table_literal(&mut self, span: Span) -> Result<ExprId> {
        self.advance()?; // {
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            let key = match self.current.kind.clone() {
                TokenKind::Ident(name) => {
                    let key_span = self.span();
                    self.advance()?;
                    self.ast.add_expr(ExprKind::Str(name), key_span)
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    key
                }
                _ => return Err(self.error_here("Expected table key".into())),
            };
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.expression()?;
            entries.push((key, value));
            if !self.match_token(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(self.ast.add_expr(ExprKind::Table { entries }, span))
    }

    fn function_literal(&mut self) -> Result<ExprId> {
        let span = self.span();
        self.advance()?; // fn

        let name = if let TokenKind::Ident(name) = self.current.kind.clone() {
            self.advance()?;
            Some(name)
        } else {
            None
        };

        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if !self.match_token(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        let body = self.block()?;
        Ok(self
            .ast
            .add_expr(ExprKind::Function { name, params, body }, span))
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.current.kind.clone() {
            TokenKind::Ident(name) => {
                self.advance()?;
                Ok(name)
            }
            other => Err(self.error_here(format!("Expected {}, found {}", what, other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::parse_source(source).expect("parse error")
    }

    #[test]
    fn parses_let_and_expression_statements() {
        let program = parse("let x = 1; x + 2");
        assert_eq!(program.body.len(), 2);
        match &program.ast.stmt(program.body[0]).kind {
            StmtKind::Let { name, init } => {
                assert_eq!(name, "x");
                assert!(init.is_some());
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let program = parse("1 + 2 * 3");
        let StmtKind::Expr { expr } = &program.ast.stmt(program.body[0]).kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, rhs, .. } = &program.ast.expr(*expr).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            program.ast.expr(*rhs).kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn power_is_right_associative() {
        let program = parse("2 ^ 3 ^ 2");
        let StmtKind::Expr { expr } = &program.ast.stmt(program.body[0]).kind else {
            panic!();
        };
        let ExprKind::Binary { op, rhs, .. } = &program.ast.expr(*expr).kind else {
            panic!();
        };
        assert_eq!(*op, BinOp::Pow);
        assert!(matches!(
            program.ast.expr(*rhs).kind,
            ExprKind::Binary { op: BinOp::Pow, .. }
        ));
    }

    #[test]
    fn compound_assignment_desugars() {
        let program = parse("x += 1");
        let StmtKind::Expr { expr } = &program.ast.stmt(program.body[0]).kind else {
            panic!();
        };
        let ExprKind::Assign { value, .. } = &program.ast.expr(*expr).kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            program.ast.expr(*value).kind,
            ExprKind::Binary { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let err = Parser::parse_source("1 + 2 = 3").unwrap_err();
        assert!(err.message.contains("assignment target"));
    }

    #[test]
    fn if_condition_may_be_bare_or_parenthesised() {
        parse("if x { 1 }");
        parse("if (x) { 1 } else { 2 }");
    }

    #[test]
    fn named_fn_statement_binds_name() {
        let program = parse("fn fib(n) { return n }");
        match &program.ast.stmt(program.body[0]).kind {
            StmtKind::Let { name, init } => {
                assert_eq!(name, "fib");
                let ExprKind::Function { name, params, .. } =
                    &program.ast.expr(init.unwrap()).kind
                else {
                    panic!("expected function literal");
                };
                assert_eq!(name.as_deref(), Some("fib"));
                assert_eq!(params, &["n".to_string()]);
            }
            other => panic!("expected desugared let, got {:?}", other),
        }
    }

    #[test]
    fn table_literal_keys() {
        let program = parse("let t = {x: 1, [\"y\"]: 2}");
        let StmtKind::Let { init, .. } = &program.ast.stmt(program.body[0]).kind else {
            panic!();
        };
        let ExprKind::Table { entries } = &program.ast.expr(init.unwrap()).kind else {
            panic!("expected table literal");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn for_loop_headers() {
        parse("for (let i = 0; i < 10; i += 1) { i }");
        parse("for (;;) { break }");
    }

    #[test]
    fn first_error_aborts_with_position() {
        let err = Parser::parse_source("let = 3").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("variable name"));
    }

    #[test]
    fn yield_with_and_without_value() {
        parse("yield");
        parse("yield 42");
        parse("let x = yield 1");
    }
}
