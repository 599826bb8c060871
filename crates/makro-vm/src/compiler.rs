use std::hash::BuildHasherDefault;
use std::mem;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use makro_common::error::{Error, ErrorS, NameError, OverflowError, Result, SyntaxError};
use makro_common::types::Span;
use makro_syntax::ast::{
    Expr, ExprAssign, ExprCall, ExprGet, ExprInfix, ExprLiteral, ExprPrefix, ExprS, ExprSet,
    ExprVariable, OpInfix, OpPrefix, Program, Stmt, StmtBlock, StmtClass, StmtExpr, StmtFor,
    StmtFun, StmtIf, StmtPrint, StmtReturn, StmtS, StmtVar, StmtWhile,
};
use rustc_hash::FxHasher;

use crate::gc::{Gc, ObjectRef, Trace};
use crate::object::{Object, ObjectFunction, ObjectString};
use crate::op;
use crate::table::Table;
use crate::value::Value;

/// Compiles an AST into bytecode, one function at a time.
///
/// Allocations made while compiling may trigger a collection. The roots are
/// the VM's globals, and every function that is still being compiled.
pub struct Compiler<'a> {
    gc: &'a mut Gc,
    globals: &'a Table,
    ctx: CompilerCtx,
    /// Functions enclosing the current one, outermost first.
    enclosing: Vec<CompilerCtx>,
}

impl<'a> Compiler<'a> {
    /// Compiles `program` into the top-level script function.
    pub fn compile(
        program: &Program,
        gc: &'a mut Gc,
        globals: &'a Table,
    ) -> Result<ObjectRef, Vec<ErrorS>> {
        let mut compiler = Self {
            gc,
            globals,
            ctx: CompilerCtx::new(FunctionType::Script, None, 0),
            enclosing: Vec::new(),
        };

        for stmt in &program.stmts {
            compiler.compile_stmt(stmt).map_err(|e| vec![e])?;
        }

        let span = match program.stmts.last() {
            Some((_, span)) => span.end..span.end,
            None => 0..0,
        };
        compiler.emit_u8(op::NULL, &span);
        compiler.emit_u8(op::RETURN, &span);

        let function = mem::take(&mut compiler.ctx.function);
        if cfg!(feature = "vm-trace") {
            tracing::trace!("\n{}", function.chunk.disassemble("<script>", compiler.gc));
        }
        Ok(compiler.alloc(function))
    }

    fn compile_stmt(&mut self, (stmt, span): &StmtS) -> Result<()> {
        match stmt {
            Stmt::Block(block) => self.compile_stmt_block(block, span),
            Stmt::Class(class) => self.compile_stmt_class(class, span),
            Stmt::Expr(expr) => self.compile_stmt_expr(expr, span),
            Stmt::For(for_) => self.compile_stmt_for(for_, span),
            Stmt::Fun(fun) => self.compile_stmt_fun(fun, span),
            Stmt::If(if_) => self.compile_stmt_if(if_, span),
            Stmt::Print(print) => self.compile_stmt_print(print, span),
            Stmt::Return(return_) => self.compile_stmt_return(return_, span),
            Stmt::Var(var) => self.compile_stmt_var(var, span),
            Stmt::While(while_) => self.compile_stmt_while(while_, span),
            Stmt::Error => Ok(()),
        }
    }

    fn compile_stmt_block(&mut self, block: &StmtBlock, span: &Span) -> Result<()> {
        self.begin_scope();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(span);
        Ok(())
    }

    fn compile_stmt_class(&mut self, class: &StmtClass, span: &Span) -> Result<()> {
        let name = self.identifier_constant(&class.name, span)?;
        let global = self.declare_variable(&class.name, span)?;
        self.emit_u8(op::CLASS, span);
        self.emit_u8(name, span);
        self.define_variable(global, span);
        Ok(())
    }

    fn compile_stmt_expr(&mut self, expr: &StmtExpr, span: &Span) -> Result<()> {
        self.compile_expr(&expr.value)?;
        self.emit_u8(op::POP, span);
        Ok(())
    }

    fn compile_stmt_for(&mut self, for_: &StmtFor, span: &Span) -> Result<()> {
        self.begin_scope();
        if let Some(init) = &for_.init {
            self.compile_stmt(init)?;
        }

        let loop_start = self.start_loop();
        let mut jump_to_end = None;
        if let Some(cond) = &for_.cond {
            self.compile_expr(cond)?;
            jump_to_end = Some(self.emit_jump(op::JUMP_IF_FALSE, span));
            self.emit_u8(op::POP, span);
        }

        self.compile_stmt(&for_.body)?;
        if let Some(incr) = &for_.incr {
            self.compile_expr(incr)?;
            self.emit_u8(op::POP, span);
        }

        self.emit_loop(loop_start, span)?;
        if let Some(jump_to_end) = jump_to_end {
            self.patch_jump(jump_to_end, span)?;
            self.emit_u8(op::POP, span);
        }

        self.end_scope(span);
        Ok(())
    }

    fn compile_stmt_fun(&mut self, fun: &StmtFun, span: &Span) -> Result<()> {
        let global = self.declare_variable(&fun.name, span)?;
        // A function may refer to itself before its body is complete.
        self.mark_initialized();

        let name = self.intern(&fun.name);
        let arity = u8::try_from(fun.params.len())
            .map_err(|_| (Error::from(OverflowError::TooManyArgs), span.clone()))?;
        let ctx = CompilerCtx::new(FunctionType::Function, Some(name), arity);
        self.enclosing.push(mem::replace(&mut self.ctx, ctx));

        self.begin_scope();
        for param in &fun.params {
            self.declare_variable(param, span)?;
            self.mark_initialized();
        }
        for stmt in &fun.body.stmts {
            self.compile_stmt(stmt)?;
        }
        self.emit_u8(op::NULL, span);
        self.emit_u8(op::RETURN, span);

        let ctx = match self.enclosing.pop() {
            Some(enclosing) => mem::replace(&mut self.ctx, enclosing),
            None => unreachable!("function compiled without an enclosing context"),
        };
        let mut function = ctx.function;
        function.upvalue_count = ctx.upvalues.len() as u16;
        if cfg!(feature = "vm-trace") {
            tracing::trace!("\n{}", function.chunk.disassemble(&fun.name, self.gc));
        }

        let function = self.alloc(function);
        let idx = self.make_constant(function.into(), span)?;
        self.emit_u8(op::CLOSURE, span);
        self.emit_u8(idx, span);
        for upvalue in &ctx.upvalues {
            self.emit_u8(upvalue.is_local.into(), span);
            self.emit_u8(upvalue.index, span);
        }

        self.define_variable(global, span);
        Ok(())
    }

    fn compile_stmt_if(&mut self, if_: &StmtIf, span: &Span) -> Result<()> {
        self.compile_expr(&if_.cond)?;
        let jump_to_else = self.emit_jump(op::JUMP_IF_FALSE, span);
        self.emit_u8(op::POP, span);

        self.compile_stmt(&if_.then)?;
        let jump_to_end = self.emit_jump(op::JUMP, span);

        self.patch_jump(jump_to_else, span)?;
        self.emit_u8(op::POP, span);
        if let Some(else_) = &if_.else_ {
            self.compile_stmt(else_)?;
        }

        self.patch_jump(jump_to_end, span)
    }

    fn compile_stmt_print(&mut self, print: &StmtPrint, span: &Span) -> Result<()> {
        self.compile_expr(&print.value)?;
        self.emit_u8(op::PRINT, span);
        Ok(())
    }

    fn compile_stmt_return(&mut self, return_: &StmtReturn, span: &Span) -> Result<()> {
        if self.ctx.type_ == FunctionType::Script {
            return Err((SyntaxError::ReturnOutsideFunction.into(), span.clone()));
        }
        match &return_.value {
            Some(value) => self.compile_expr(value)?,
            None => self.emit_u8(op::NULL, span),
        }
        self.emit_u8(op::RETURN, span);
        Ok(())
    }

    fn compile_stmt_var(&mut self, var: &StmtVar, span: &Span) -> Result<()> {
        let global = self.declare_variable(&var.name, span)?;
        match &var.value {
            Some(value) => self.compile_expr(value)?,
            None => self.emit_u8(op::NULL, span),
        }
        self.define_variable(global, span);
        Ok(())
    }

    fn compile_stmt_while(&mut self, while_: &StmtWhile, span: &Span) -> Result<()> {
        let loop_start = self.start_loop();
        self.compile_expr(&while_.cond)?;

        let jump_to_end = self.emit_jump(op::JUMP_IF_FALSE, span);
        self.emit_u8(op::POP, span);
        self.compile_stmt(&while_.body)?;
        self.emit_loop(loop_start, span)?;

        self.patch_jump(jump_to_end, span)?;
        self.emit_u8(op::POP, span);
        Ok(())
    }

    fn compile_expr(&mut self, (expr, span): &ExprS) -> Result<()> {
        match expr {
            Expr::Assign(assign) => self.compile_expr_assign(assign, span),
            Expr::Call(call) => self.compile_expr_call(call, span),
            Expr::Get(get) => self.compile_expr_get(get, span),
            Expr::Infix(infix) => self.compile_expr_infix(infix, span),
            Expr::Literal(literal) => self.compile_expr_literal(literal, span),
            Expr::Prefix(prefix) => self.compile_expr_prefix(prefix, span),
            Expr::Set(set) => self.compile_expr_set(set, span),
            Expr::Variable(variable) => self.compile_expr_variable(variable, span),
        }
    }

    fn compile_expr_assign(&mut self, assign: &ExprAssign, span: &Span) -> Result<()> {
        self.compile_expr(&assign.value)?;
        let (op, idx) = match self.resolve_variable(&assign.name, span)? {
            Variable::Local(idx) => (op::SET_LOCAL, idx),
            Variable::Upvalue(idx) => (op::SET_UPVALUE, idx),
            Variable::Global => (op::SET_GLOBAL, self.identifier_constant(&assign.name, span)?),
        };
        self.emit_u8(op, span);
        self.emit_u8(idx, span);
        Ok(())
    }

    fn compile_expr_call(&mut self, call: &ExprCall, span: &Span) -> Result<()> {
        let arg_count = u8::try_from(call.args.len())
            .map_err(|_| (Error::from(OverflowError::TooManyArgs), span.clone()))?;

        self.compile_expr(&call.callee)?;
        for arg in &call.args {
            self.compile_expr(arg)?;
        }
        self.emit_u8(op::CALL, span);
        self.emit_u8(arg_count, span);
        Ok(())
    }

    fn compile_expr_get(&mut self, get: &ExprGet, span: &Span) -> Result<()> {
        self.compile_expr(&get.object)?;
        let name = self.identifier_constant(&get.name, span)?;
        self.emit_u8(op::GET_PROPERTY, span);
        self.emit_u8(name, span);
        Ok(())
    }

    fn compile_expr_infix(&mut self, infix: &ExprInfix, span: &Span) -> Result<()> {
        match infix.op {
            OpInfix::LogicAnd => {
                self.compile_expr(&infix.lt)?;
                let jump_to_end = self.emit_jump(op::JUMP_IF_FALSE, span);
                self.emit_u8(op::POP, span);
                self.compile_expr(&infix.rt)?;
                return self.patch_jump(jump_to_end, span);
            }
            OpInfix::LogicOr => {
                self.compile_expr(&infix.lt)?;
                let jump_to_else = self.emit_jump(op::JUMP_IF_FALSE, span);
                let jump_to_end = self.emit_jump(op::JUMP, span);

                self.patch_jump(jump_to_else, span)?;
                self.emit_u8(op::POP, span);
                self.compile_expr(&infix.rt)?;
                return self.patch_jump(jump_to_end, span);
            }
            _ => {}
        }

        self.compile_expr(&infix.lt)?;
        self.compile_expr(&infix.rt)?;
        let ops: &[u8] = match infix.op {
            OpInfix::Add => &[op::ADD],
            OpInfix::Divide => &[op::DIVIDE],
            OpInfix::Equal => &[op::EQUAL],
            OpInfix::Greater => &[op::GREATER],
            OpInfix::GreaterEqual => &[op::LESS, op::NOT],
            OpInfix::Less => &[op::LESS],
            OpInfix::LessEqual => &[op::GREATER, op::NOT],
            OpInfix::Multiply => &[op::MULTIPLY],
            OpInfix::NotEqual => &[op::EQUAL, op::NOT],
            OpInfix::Subtract => &[op::SUBTRACT],
            OpInfix::LogicAnd | OpInfix::LogicOr => unreachable!(),
        };
        for &op in ops {
            self.emit_u8(op, span);
        }
        Ok(())
    }

    fn compile_expr_literal(&mut self, literal: &ExprLiteral, span: &Span) -> Result<()> {
        match literal {
            ExprLiteral::Bool(true) => self.emit_u8(op::TRUE, span),
            ExprLiteral::Bool(false) => self.emit_u8(op::FALSE, span),
            ExprLiteral::Null => self.emit_u8(op::NULL, span),
            ExprLiteral::Number(number) => self.emit_constant(Value::Number(*number), span)?,
            ExprLiteral::String(string) => {
                let string = self.intern(string);
                self.emit_constant(string.into(), span)?;
            }
        }
        Ok(())
    }

    fn compile_expr_prefix(&mut self, prefix: &ExprPrefix, span: &Span) -> Result<()> {
        self.compile_expr(&prefix.rt)?;
        match prefix.op {
            OpPrefix::Negate => self.emit_u8(op::NEGATE, span),
            OpPrefix::Not => self.emit_u8(op::NOT, span),
        }
        Ok(())
    }

    fn compile_expr_set(&mut self, set: &ExprSet, span: &Span) -> Result<()> {
        self.compile_expr(&set.object)?;
        self.compile_expr(&set.value)?;
        let name = self.identifier_constant(&set.name, span)?;
        self.emit_u8(op::SET_PROPERTY, span);
        self.emit_u8(name, span);
        Ok(())
    }

    fn compile_expr_variable(&mut self, variable: &ExprVariable, span: &Span) -> Result<()> {
        let (op, idx) = match self.resolve_variable(&variable.name, span)? {
            Variable::Local(idx) => (op::GET_LOCAL, idx),
            Variable::Upvalue(idx) => (op::GET_UPVALUE, idx),
            Variable::Global => (op::GET_GLOBAL, self.identifier_constant(&variable.name, span)?),
        };
        self.emit_u8(op, span);
        self.emit_u8(idx, span);
        Ok(())
    }

    /// Declares a variable in the current scope. Returns the constant index
    /// of its name if it is a global.
    fn declare_variable(&mut self, name: &str, span: &Span) -> Result<Option<u8>> {
        if self.ctx.scope_depth == 0 {
            return self.identifier_constant(name, span).map(Some);
        }

        for local in self.ctx.locals.iter().rev() {
            if local.depth.map_or(false, |depth| depth < self.ctx.scope_depth) {
                break;
            }
            if local.name == name {
                return Err((NameError::AlreadyDefined { name: name.to_string() }.into(), span.clone()));
            }
        }

        let local = Local { name: name.to_string(), depth: None, is_captured: false };
        self.ctx
            .locals
            .try_push(local)
            .map_err(|_| (Error::from(OverflowError::TooManyLocals), span.clone()))?;
        Ok(None)
    }

    fn define_variable(&mut self, global: Option<u8>, span: &Span) {
        match global {
            Some(name) => {
                self.emit_u8(op::DEFINE_GLOBAL, span);
                self.emit_u8(name, span);
            }
            None => self.mark_initialized(),
        }
    }

    fn mark_initialized(&mut self) {
        if self.ctx.scope_depth == 0 {
            return;
        }
        let depth = self.ctx.scope_depth;
        if let Some(local) = self.ctx.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn resolve_variable(&mut self, name: &str, span: &Span) -> Result<Variable> {
        let level = self.enclosing.len();
        if let Some(idx) = self.resolve_local(level, name, span)? {
            return Ok(Variable::Local(idx));
        }
        if let Some(idx) = self.resolve_upvalue(level, name, span)? {
            return Ok(Variable::Upvalue(idx));
        }
        Ok(Variable::Global)
    }

    fn resolve_local(&mut self, level: usize, name: &str, span: &Span) -> Result<Option<u8>> {
        let ctx = self.ctx_at(level);
        for (idx, local) in ctx.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    return Err((
                        NameError::AccessInsideInitializer { name: name.to_string() }.into(),
                        span.clone(),
                    ));
                }
                return Ok(Some(idx as u8));
            }
        }
        Ok(None)
    }

    /// Resolves `name` in the functions enclosing `level`, capturing it into
    /// every function in between.
    fn resolve_upvalue(&mut self, level: usize, name: &str, span: &Span) -> Result<Option<u8>> {
        if level == 0 {
            return Ok(None);
        }

        if let Some(idx) = self.resolve_local(level - 1, name, span)? {
            self.ctx_at(level - 1).locals[idx as usize].is_captured = true;
            return self.add_upvalue(level, idx, true, span).map(Some);
        }
        if let Some(idx) = self.resolve_upvalue(level - 1, name, span)? {
            return self.add_upvalue(level, idx, false, span).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool, span: &Span) -> Result<u8> {
        let upvalues = &mut self.ctx_at(level).upvalues;
        let upvalue = Upvalue { index, is_local };
        if let Some(idx) = upvalues.iter().position(|&other| other == upvalue) {
            return Ok(idx as u8);
        }
        upvalues
            .try_push(upvalue)
            .map_err(|_| (Error::from(OverflowError::TooManyUpvalues), span.clone()))?;
        Ok((upvalues.len() - 1) as u8)
    }

    /// The function context at nesting `level`, where 0 is the script.
    fn ctx_at(&mut self, level: usize) -> &mut CompilerCtx {
        if level == self.enclosing.len() {
            &mut self.ctx
        } else {
            &mut self.enclosing[level]
        }
    }

    fn begin_scope(&mut self) {
        self.ctx.scope_depth += 1;
    }

    fn end_scope(&mut self, span: &Span) {
        self.ctx.scope_depth -= 1;
        while let Some(local) = self.ctx.locals.last() {
            if local.depth.map_or(false, |depth| depth <= self.ctx.scope_depth) {
                break;
            }
            let op = if local.is_captured { op::CLOSE_UPVALUE } else { op::POP };
            self.ctx.locals.pop();
            self.emit_u8(op, span);
        }
    }

    fn identifier_constant(&mut self, name: &str, span: &Span) -> Result<u8> {
        let name = self.intern(name);
        self.make_constant(name.into(), span)
    }

    fn emit_u8(&mut self, byte: u8, span: &Span) {
        self.ctx.function.chunk.write_u8(byte, span);
    }

    fn emit_constant(&mut self, value: Value, span: &Span) -> Result<()> {
        let idx = self.make_constant(value, span)?;
        self.emit_u8(op::CONSTANT, span);
        self.emit_u8(idx, span);
        Ok(())
    }

    fn make_constant(&mut self, value: Value, span: &Span) -> Result<u8> {
        let Value::Object(object) = value else {
            return self.ctx.function.chunk.write_constant(value, span);
        };
        if let Some(&idx) = self.ctx.object_constants.get(&object) {
            return Ok(idx);
        }
        let idx = self.ctx.function.chunk.write_constant(value, span)?;
        self.ctx.object_constants.insert(object, idx);
        Ok(idx)
    }

    fn emit_jump(&mut self, op: u8, span: &Span) -> usize {
        self.emit_u8(op, span);
        self.emit_u8(0xFF, span);
        self.emit_u8(0xFF, span);
        self.ctx.function.chunk.ops.len() - 2
    }

    fn patch_jump(&mut self, offset: usize, span: &Span) -> Result<()> {
        let ops = &mut self.ctx.function.chunk.ops;
        // -2 to adjust for the bytecode for the jump offset itself.
        let jump = u16::try_from(ops.len() - offset - 2)
            .map_err(|_| (Error::from(OverflowError::JumpTooLarge), span.clone()))?;
        ops[offset..offset + 2].copy_from_slice(&jump.to_be_bytes());
        Ok(())
    }

    fn start_loop(&self) -> usize {
        self.ctx.function.chunk.ops.len()
    }

    fn emit_loop(&mut self, loop_start: usize, span: &Span) -> Result<()> {
        self.emit_u8(op::LOOP, span);
        let offset = u16::try_from(self.ctx.function.chunk.ops.len() - loop_start + 2)
            .map_err(|_| (Error::from(OverflowError::JumpTooLarge), span.clone()))?;
        for byte in offset.to_be_bytes() {
            self.emit_u8(byte, span);
        }
        Ok(())
    }

    fn intern(&mut self, name: &str) -> ObjectRef {
        match self.gc.find_interned(name) {
            Some(object) => object,
            None => self.alloc(ObjectString::new(name)),
        }
    }

    fn alloc(&mut self, object: impl Into<Object>) -> ObjectRef {
        let object = object.into();
        if self.gc.should_collect(object.size()) {
            object.trace(self.gc);
            self.globals.trace(self.gc);
            for ctx in self.enclosing.iter().chain([&self.ctx]) {
                ctx.function.trace(self.gc);
            }
            self.gc.collect_garbage();
        }
        self.gc.alloc(object)
    }
}

#[derive(Debug)]
struct CompilerCtx {
    function: ObjectFunction,
    type_: FunctionType,
    locals: ArrayVec<Local, 256>,
    upvalues: ArrayVec<Upvalue, 256>,
    scope_depth: usize,
    object_constants: HashMap<ObjectRef, u8, BuildHasherDefault<FxHasher>>,
}

impl CompilerCtx {
    fn new(type_: FunctionType, name: Option<ObjectRef>, arity: u8) -> Self {
        let mut locals = ArrayVec::new();
        // Slot 0 holds the function being called.
        locals.push(Local { name: String::new(), depth: Some(0), is_captured: false });
        Self {
            function: ObjectFunction { name, arity, ..ObjectFunction::default() },
            type_,
            locals,
            upvalues: ArrayVec::new(),
            scope_depth: 0,
            object_constants: HashMap::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FunctionType {
    Function,
    Script,
}

#[derive(Debug)]
struct Local {
    name: String,
    /// `None` while the variable's initializer is being compiled.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

enum Variable {
    Local(u8),
    Upvalue(u8),
    Global,
}
