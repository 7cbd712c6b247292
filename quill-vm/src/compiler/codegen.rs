// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Code generation: transforms the AST into bytecode.
//!
//! One [`FunctionState`] per function body, on an explicit stack so that
//! upvalue resolution can walk and mutate enclosing states by index.
//! Frame slot 0 is reserved for the function value itself; a named
//! function can therefore call itself without touching the globals table.

use std::rc::Rc;

use quill_parser::{Ast, BinOp, ExprId, ExprKind, Program, Span, StmtId, StmtKind, UnOp};

use crate::chunk::{Chunk, Constant, Function, FunctionProto, LineInfo, UpvalueDesc};
use crate::opcode::OpCode;
use crate::string::Interner;

use super::types::{CompileError, Local, LoopContext, Result};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = u8::MAX as usize;

/// Compile a parsed program into a callable function of arity 0.
///
/// A trailing expression statement becomes the program's result; any
/// other shape returns nil.
pub fn compile_program(
    program: &Program,
    name: &str,
    strings: &mut Interner,
) -> Result<Function> {
    let mut compiler = Compiler {
        ast: &program.ast,
        strings,
        funcs: vec![FunctionState::new(Some(name.to_string()), 0)],
        span: Span::default(),
    };

    let mut ends_with_value = false;
    for (i, &stmt) in program.body.iter().enumerate() {
        let last = i + 1 == program.body.len();
        if last {
            if let StmtKind::Expr { expr } = &compiler.ast.stmt(stmt).kind {
                let expr = *expr;
                compiler.span = compiler.ast.stmt(stmt).span;
                compiler.expression(expr)?;
                ends_with_value = true;
                break;
            }
        }
        compiler.statement(stmt)?;
    }
    if !ends_with_value {
        compiler.emit(OpCode::Nil);
    }
    compiler.emit(OpCode::Return);

    let root = compiler.funcs.pop().expect("root function state");
    Ok(Rc::new(root.into_proto(compiler.strings)))
}

/// Per-function compilation state.
struct FunctionState {
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    max_locals: usize,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopContext>,
}

impl FunctionState {
    fn new(name: Option<String>, arity: u8) -> Self {
        // Slot 0 is reserved for the function value itself; giving it
        // the function's name makes self-recursion resolve as a local.
        let slot0 = Local {
            name: name.clone().unwrap_or_default(),
            depth: 0,
            is_captured: false,
        };
        FunctionState {
            name,
            arity,
            chunk: Chunk::new(),
            locals: vec![slot0],
            max_locals: 1,
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }

    fn into_proto(self, strings: &mut Interner) -> FunctionProto {
        let mut proto = FunctionProto::new(self.name.map(|n| strings.intern(&n)), self.arity);
        proto.chunk = self.chunk;
        proto.upvalues = self.upvalues;
        proto.local_count = self.max_locals as u16;
        proto
    }
}

struct Compiler<'a> {
    ast: &'a Ast,
    strings: &'a mut Interner,
    funcs: Vec<FunctionState>,
    /// Source position of the node being compiled, for error reporting
    /// and the line table.
    span: Span,
}

impl<'a> Compiler<'a> {
    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn current(&mut self) -> &mut FunctionState {
        self.funcs.last_mut().expect("no function state")
    }

    fn line_info(&self) -> LineInfo {
        LineInfo::new(self.span.line, self.span.column)
    }

    fn emit(&mut self, op: OpCode) {
        let line = self.line_info();
        self.current().chunk.emit(op, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let at = self.current().chunk.current_offset();
        self.emit(op);
        at
    }

    fn patch_jump(&mut self, offset: usize) {
        self.current().chunk.patch_jump(offset);
    }

    /// Emit a backward jump to `start`. The offset is computed
    /// immediately since the target already exists.
    fn emit_loop(&mut self, start: usize) -> Result<()> {
        let here = self.current().chunk.current_offset();
        let distance = start as i64 - here as i64 - 1;
        if distance < i16::MIN as i64 {
            return Err(self.error("Loop body too large"));
        }
        self.emit(OpCode::Jump(distance as i16));
        Ok(())
    }

    fn add_constant(&mut self, constant: Constant) -> Result<u16> {
        let err = self.error("Too many constants in function");
        self.current()
            .chunk
            .add_constant(constant)
            .ok_or(err)
    }

    fn name_constant(&mut self, name: &str) -> Result<u16> {
        let s = self.strings.intern(name);
        self.add_constant(Constant::Str(s))
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.span.line,
            column: self.span.column,
        }
    }

    // =========================================================================
    // Scope management
    // =========================================================================

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current().scope_depth -= 1;
        loop {
            let func = self.current();
            match func.locals.last() {
                Some(local) if local.depth > func.scope_depth => {
                    let captured = local.is_captured;
                    func.locals.pop();
                    if captured {
                        self.emit(OpCode::CloseUpvalue);
                    } else {
                        self.emit(OpCode::Pop);
                    }
                }
                _ => break,
            }
        }
    }

    fn add_local(&mut self, name: String) -> Result<()> {
        if self.current().locals.len() >= MAX_LOCALS {
            return Err(self.error("Too many local variables in function"));
        }
        let func = self.current();
        let depth = func.scope_depth;
        func.locals.push(Local {
            name,
            depth,
            is_captured: false,
        });
        func.max_locals = func.max_locals.max(func.locals.len());
        Ok(())
    }

    fn resolve_local(&self, func_idx: usize, name: &str) -> Option<u16> {
        self.funcs[func_idx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(i, _)| i as u16)
    }

    /// Two-pass upvalue resolution: resolve as a local in the enclosing
    /// function first, else recurse as an upvalue of the enclosing
    /// function. Deduplicated by (index, is_local).
    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Result<Option<u16>> {
        if func_idx == 0 {
            return Ok(None);
        }
        let parent_idx = func_idx - 1;

        if let Some(local) = self.resolve_local(parent_idx, name) {
            self.funcs[parent_idx].locals[local as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(func_idx, local, true)?));
        }

        if let Some(upvalue) = self.resolve_upvalue(parent_idx, name)? {
            return Ok(Some(self.add_upvalue(func_idx, upvalue, false)?));
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u16, is_local: bool) -> Result<u16> {
        for (i, upvalue) in self.funcs[func_idx].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u16);
            }
        }
        if self.funcs[func_idx].upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("Too many captured variables in function"));
        }
        let upvalues = &mut self.funcs[func_idx].upvalues;
        upvalues.push(UpvalueDesc { index, is_local });
        Ok((upvalues.len() - 1) as u16)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self, id: StmtId) -> Result<()> {
        let stmt = self.ast.stmt(id);
        self.span = stmt.span;

        match &stmt.kind {
            StmtKind::Let { name, init } => {
                match init {
                    Some(expr) => self.expression(*expr)?,
                    None => self.emit(OpCode::Nil),
                }
                self.span = stmt.span;
                if self.current().scope_depth == 0 && self.funcs.len() == 1 {
                    let idx = self.name_constant(name)?;
                    self.emit(OpCode::DefineGlobal(idx));
                } else {
                    // The initialised value stays on the stack as the
                    // local's slot. Not visible in its own initialiser.
                    self.add_local(name.clone())?;
                }
                Ok(())
            }

            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expression(*cond)?;
                let else_jump = self.emit_jump(OpCode::PopJumpIfFalse(0));
                self.statement(*then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump(0));
                self.patch_jump(else_jump);
                if let Some(else_branch) = else_branch {
                    self.statement(*else_branch)?;
                }
                self.patch_jump(end_jump);
                Ok(())
            }

            StmtKind::While { cond, body } => {
                let start = self.current().chunk.current_offset();
                let depth = self.current().scope_depth;
                self.current().loops.push(LoopContext {
                    start_offset: start,
                    scope_depth: depth,
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    continue_to_start: true,
                });

                self.expression(*cond)?;
                let exit = self.emit_jump(OpCode::PopJumpIfFalse(0));
                self.statement(*body)?;
                self.emit_loop(start)?;
                self.patch_jump(exit);

                let ctx = self.current().loops.pop().expect("loop context");
                for jump in ctx.break_jumps {
                    self.patch_jump(jump);
                }
                Ok(())
            }

            StmtKind::For {
                init,
                cond,
                incr,
                body,
            } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.statement(*init)?;
                }

                let start = self.current().chunk.current_offset();
                let depth = self.current().scope_depth;
                self.current().loops.push(LoopContext {
                    start_offset: start,
                    scope_depth: depth,
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                    continue_to_start: false,
                });

                let exit = match cond {
                    Some(cond) => {
                        self.expression(*cond)?;
                        Some(self.emit_jump(OpCode::PopJumpIfFalse(0)))
                    }
                    None => None,
                };

                self.statement(*body)?;

                // Continue lands on the increment, not the condition.
                let continues = std::mem::take(&mut self.current().loops.last_mut().unwrap().continue_jumps);
                for jump in continues {
                    self.patch_jump(jump);
                }

                if let Some(incr) = incr {
                    self.expression(*incr)?;
                    self.emit(OpCode::Pop);
                }
                self.emit_loop(start)?;

                if let Some(exit) = exit {
                    self.patch_jump(exit);
                }
                let ctx = self.current().loops.pop().expect("loop context");
                for jump in ctx.break_jumps {
                    self.patch_jump(jump);
                }
                self.end_scope();
                Ok(())
            }

            StmtKind::Break => {
                if self.current().loops.is_empty() {
                    return Err(self.error("'break' outside of a loop"));
                }
                self.pop_loop_locals();
                let jump = self.emit_jump(OpCode::Jump(0));
                self.current()
                    .loops
                    .last_mut()
                    .unwrap()
                    .break_jumps
                    .push(jump);
                Ok(())
            }

            StmtKind::Continue => {
                let (start, to_start) = match self.current().loops.last() {
                    Some(ctx) => (ctx.start_offset, ctx.continue_to_start),
                    None => return Err(self.error("'continue' outside of a loop")),
                };
                self.pop_loop_locals();
                if to_start {
                    self.emit_loop(start)?;
                } else {
                    let jump = self.emit_jump(OpCode::Jump(0));
                    self.current()
                        .loops
                        .last_mut()
                        .unwrap()
                        .continue_jumps
                        .push(jump);
                }
                Ok(())
            }

            StmtKind::Return { value } => {
                match value {
                    Some(expr) => self.expression(*expr)?,
                    None => self.emit(OpCode::Nil),
                }
                self.emit(OpCode::Return);
                Ok(())
            }

            StmtKind::Block { stmts } => {
                self.begin_scope();
                for &stmt in stmts {
                    self.statement(stmt)?;
                }
                self.end_scope();
                Ok(())
            }

            StmtKind::Expr { expr } => {
                self.expression(*expr)?;
                self.emit(OpCode::Pop);
                Ok(())
            }
        }
    }

    /// Emit pops for locals that would go out of scope when jumping out
    /// of the innermost loop. The compile-time local list is untouched;
    /// normal scope exit still accounts for them.
    fn pop_loop_locals(&mut self) {
        let loop_depth = self.current().loops.last().unwrap().scope_depth;
        let to_pop: Vec<bool> = self
            .current()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| local.is_captured)
            .collect();
        for captured in to_pop {
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self, id: ExprId) -> Result<()> {
        let expr = self.ast.expr(id);
        self.span = expr.span;

        match &expr.kind {
            ExprKind::Nil => {
                self.emit(OpCode::Nil);
                Ok(())
            }
            ExprKind::Bool(true) => {
                self.emit(OpCode::True);
                Ok(())
            }
            ExprKind::Bool(false) => {
                self.emit(OpCode::False);
                Ok(())
            }
            ExprKind::Number(n) => {
                let idx = self.add_constant(Constant::Number(*n))?;
                self.emit(OpCode::Const(idx));
                Ok(())
            }
            ExprKind::Str(s) => {
                let idx = self.name_constant(s)?;
                self.emit(OpCode::Const(idx));
                Ok(())
            }

            ExprKind::Ident(name) => {
                let top = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local(top, name) {
                    self.emit(OpCode::GetLocal(slot));
                } else if let Some(upvalue) = self.resolve_upvalue(top, name)? {
                    self.emit(OpCode::GetUpvalue(upvalue));
                } else {
                    let idx = self.name_constant(name)?;
                    self.emit(OpCode::GetGlobal(idx));
                }
                Ok(())
            }

            ExprKind::Unary { op, operand } => {
                self.expression(*operand)?;
                self.span = expr.span;
                match op {
                    UnOp::Neg => self.emit(OpCode::Negate),
                    UnOp::Not => self.emit(OpCode::Not),
                }
                Ok(())
            }

            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, *lhs, *rhs, expr.span),

            ExprKind::Assign { target, value } => self.assignment(*target, *value, expr.span),

            ExprKind::Call { callee, args } => {
                if args.len() > MAX_ARGS {
                    return Err(self.error("Too many arguments in call"));
                }
                self.expression(*callee)?;
                for &arg in args {
                    self.expression(arg)?;
                }
                self.span = expr.span;
                self.emit(OpCode::Call(args.len() as u8));
                Ok(())
            }

            ExprKind::Index { object, index } => {
                self.expression(*object)?;
                self.expression(*index)?;
                self.span = expr.span;
                self.emit(OpCode::GetField);
                Ok(())
            }

            ExprKind::Field { object, name } => {
                self.expression(*object)?;
                self.span = expr.span;
                let idx = self.name_constant(name)?;
                self.emit(OpCode::Const(idx));
                self.emit(OpCode::GetField);
                Ok(())
            }

            ExprKind::Table { entries } => {
                self.emit(OpCode::NewTable(entries.len().min(u16::MAX as usize) as u16));
                for &(key, value) in entries {
                    self.emit(OpCode::Dup);
                    self.expression(key)?;
                    self.expression(value)?;
                    self.emit(OpCode::SetField);
                    self.emit(OpCode::Pop);
                }
                Ok(())
            }

            ExprKind::Function { name, params, body } => {
                self.function(name.clone(), params, *body, expr.span)
            }

            ExprKind::Yield { value } => {
                match value {
                    Some(expr) => self.expression(*expr)?,
                    None => self.emit(OpCode::Nil),
                }
                self.span = expr.span;
                self.emit(OpCode::Yield);
                Ok(())
            }
        }
    }

    fn binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId, span: Span) -> Result<()> {
        match op {
            // Short-circuit forms compile to jumps, not opcodes.
            BinOp::And => {
                self.expression(lhs)?;
                let end = self.emit_jump(OpCode::JumpIfFalse(0));
                self.emit(OpCode::Pop);
                self.expression(rhs)?;
                self.patch_jump(end);
                Ok(())
            }
            BinOp::Or => {
                self.expression(lhs)?;
                let end = self.emit_jump(OpCode::JumpIfTrue(0));
                self.emit(OpCode::Pop);
                self.expression(rhs)?;
                self.patch_jump(end);
                Ok(())
            }
            _ => {
                self.expression(lhs)?;
                self.expression(rhs)?;
                self.span = span;
                self.emit(match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::Mod => OpCode::Mod,
                    BinOp::Pow => OpCode::Pow,
                    BinOp::Eq => OpCode::Eq,
                    BinOp::Ne => OpCode::Ne,
                    BinOp::Lt => OpCode::Lt,
                    BinOp::Le => OpCode::Le,
                    BinOp::Gt => OpCode::Gt,
                    BinOp::Ge => OpCode::Ge,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                });
                Ok(())
            }
        }
    }

    /// Assignment targets are polymorphic over local, upvalue, global,
    /// field and index; each compiles a different store sequence. The
    /// stored value is left on the stack as the expression's result.
    fn assignment(&mut self, target: ExprId, value: ExprId, span: Span) -> Result<()> {
        let target_expr = self.ast.expr(target);
        match target_expr.kind.clone() {
            ExprKind::Ident(name) => {
                self.expression(value)?;
                self.span = span;
                let top = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local(top, &name) {
                    self.emit(OpCode::SetLocal(slot));
                } else if let Some(upvalue) = self.resolve_upvalue(top, &name)? {
                    self.emit(OpCode::SetUpvalue(upvalue));
                } else {
                    let idx = self.name_constant(&name)?;
                    self.emit(OpCode::SetGlobal(idx));
                }
                Ok(())
            }
            ExprKind::Field { object, name } => {
                self.expression(object)?;
                self.span = span;
                let idx = self.name_constant(&name)?;
                self.emit(OpCode::Const(idx));
                self.expression(value)?;
                self.emit(OpCode::SetField);
                Ok(())
            }
            ExprKind::Index { object, index } => {
                self.expression(object)?;
                self.expression(index)?;
                self.expression(value)?;
                self.span = span;
                self.emit(OpCode::SetField);
                Ok(())
            }
            _ => Err(self.error("Invalid assignment target")),
        }
    }

    fn function(
        &mut self,
        name: Option<String>,
        params: &[String],
        body: StmtId,
        span: Span,
    ) -> Result<()> {
        if params.len() > MAX_ARGS {
            return Err(self.error("Too many parameters"));
        }

        self.funcs
            .push(FunctionState::new(name, params.len() as u8));
        for param in params {
            self.add_local(param.clone())?;
        }

        self.statement(body)?;
        self.span = span;
        self.emit(OpCode::Nil);
        self.emit(OpCode::Return);

        let state = self.funcs.pop().expect("function state");
        let upvalues = state.upvalues.clone();
        let proto = state.into_proto(self.strings);

        let idx = self.add_constant(Constant::Proto(Rc::new(proto)))?;
        self.emit(OpCode::Closure(idx));
        for desc in upvalues {
            if desc.is_local {
                self.emit(OpCode::CaptureLocal(desc.index));
            } else {
                self.emit(OpCode::CaptureUpvalue(desc.index));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_parser::Parser;

    fn compile(source: &str) -> Function {
        let program = Parser::parse_source(source).expect("parse error");
        let mut strings = Interner::new();
        compile_program(&program, "<test>", &mut strings).expect("compile error")
    }

    fn compile_err(source: &str) -> CompileError {
        let program = Parser::parse_source(source).expect("parse error");
        let mut strings = Interner::new();
        compile_program(&program, "<test>", &mut strings).expect_err("expected compile error")
    }

    #[test]
    fn top_level_let_defines_global() {
        let f = compile("let x = 1");
        assert!(f
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::DefineGlobal(_))));
    }

    #[test]
    fn block_let_is_local() {
        let f = compile("{ let x = 1; x }");
        assert!(f
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::GetLocal(_))));
        assert!(!f
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::DefineGlobal(_))));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let err = compile_err("break");
        assert!(err.message.contains("break"));
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        let err = compile_err("continue");
        assert!(err.message.contains("continue"));
    }

    #[test]
    fn break_inside_closure_does_not_see_outer_loop() {
        let err = compile_err("while true { let f = fn() { break }; }");
        assert!(err.message.contains("break"));
    }

    #[test]
    fn nested_function_captures_local() {
        let f = compile("{ let x = 1; let g = fn() { return x }; }");
        // The closure instruction is followed by a capture instruction.
        let pos = f
            .chunk
            .code
            .iter()
            .position(|op| matches!(op, OpCode::Closure(_)))
            .expect("closure emitted");
        assert!(matches!(f.chunk.code[pos + 1], OpCode::CaptureLocal(_)));
    }

    #[test]
    fn transitive_capture_goes_through_middle_function() {
        // The innermost function reaches x two scopes up; the middle one
        // must forward it as an upvalue.
        let f = compile(
            "{ let x = 1; let outer = fn() { let inner = fn() { return x }; return inner }; }",
        );
        let Constant::Proto(outer) = f
            .chunk
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Proto(_)))
            .expect("outer proto")
        else {
            unreachable!();
        };
        assert_eq!(outer.upvalues.len(), 1);
        let Constant::Proto(inner) = outer
            .chunk
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Proto(_)))
            .expect("inner proto")
        else {
            unreachable!();
        };
        assert_eq!(inner.upvalues.len(), 1);
        assert!(!inner.upvalues[0].is_local);
    }

    #[test]
    fn scope_exit_closes_captured_locals() {
        let f = compile("{ let x = 1; let g = fn() { return x }; }");
        assert!(f.chunk.code.contains(&OpCode::CloseUpvalue));
    }

    #[test]
    fn logical_and_short_circuits() {
        let f = compile("true && false");
        assert!(f
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::JumpIfFalse(_))));
    }

    #[test]
    fn named_fn_statement_binds_and_recurses_via_slot_zero() {
        let f = compile("fn loop_(n) { return loop_(n) }");
        let Constant::Proto(proto) = f
            .chunk
            .constants
            .iter()
            .find(|c| matches!(c, Constant::Proto(_)))
            .expect("proto")
        else {
            unreachable!();
        };
        // The recursive reference is the reserved slot 0, not a global.
        assert!(proto.chunk.code.contains(&OpCode::GetLocal(0)));
        assert!(!proto
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::GetGlobal(_))));
    }
}
