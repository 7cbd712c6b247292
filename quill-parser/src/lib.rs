// quill-parser - Lexer and parser for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! # quill-parser
//!
//! Lexer and parser for the Quill scripting language.
//! Produces an arena-allocated AST from source code strings.
//!
//! This crate is deliberately free of dependencies on the runtime: the
//! parser knows nothing about values, heaps or bytecode. The compiler in
//! `quill-vm` walks the AST produced here.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Ast, BinOp, Expr, ExprId, ExprKind, Program, Span, Stmt, StmtId, StmtKind, UnOp};
pub use lexer::{LexError, Lexer, Token, TokenKind};
pub use parser::{ParseError, Parser};
