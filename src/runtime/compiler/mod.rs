//! Source to [`Code`] compiler.
//!
//! Every function definition, including nested ones, becomes a separate [`Function`]
//! with its own code. A function code starts with a `Nop` mapped to the `def` line,
//! so the function entry is addressable by its definition line.

pub mod lexer;
pub mod parser;

use crate::runtime::code::{Capture, Code, ExceptionEntry, Instruction};
use crate::runtime::error::RuntimeError;
use crate::runtime::function::{Function, FunctionProto};
use crate::runtime::module::Globals;
use crate::runtime::value::Value;
use parser::{Expr, FunctionDef, Parser, Stmt, StmtKind, UnaryOp};
use std::sync::{Arc, Weak};

pub(crate) struct CompiledModule {
    pub body: Code,
    /// All function definitions of the module, nested included.
    pub functions: Vec<Arc<Function>>,
}

/// Compile module source text.
///
/// # Arguments
///
/// * `filename`: module file identity, stored in every produced code
/// * `source`: module source text
/// * `globals`: module globals, functions resolve global names through it
pub(crate) fn compile(
    filename: &str,
    source: &str,
    globals: &Arc<Globals>,
) -> Result<CompiledModule, RuntimeError> {
    let tokens = lexer::tokenize(source)?;
    let body = Parser::new(tokens).parse_module()?;

    let mut compiler = Compiler {
        filename: Arc::from(filename),
        globals: Arc::downgrade(globals),
        scopes: vec![],
        functions: vec![],
    };
    let body = compiler.module(&body)?;
    Ok(CompiledModule {
        body,
        functions: compiler.functions,
    })
}

#[derive(PartialEq, Clone, Copy)]
enum ScopeKind {
    Module,
    Function,
}

enum NameRef {
    Local(u32),
    Free(u32),
    Global,
}

struct Loop {
    start: u32,
    breaks: Vec<usize>,
}

/// Code under construction.
struct Scope {
    kind: ScopeKind,
    name: Arc<str>,
    qualname: Arc<str>,
    first_line: u32,
    arg_count: u32,
    instructions: Vec<Instruction>,
    lines: Vec<u32>,
    consts: Vec<Value>,
    names: Vec<Arc<str>>,
    locals: Vec<Arc<str>>,
    cells: Vec<bool>,
    free_vars: Vec<Arc<str>>,
    captures: Vec<Capture>,
    nested: Vec<Arc<Function>>,
    exception_table: Vec<ExceptionEntry>,
    loops: Vec<Loop>,
    line: u32,
    depth: i32,
    max_depth: i32,
}

impl Scope {
    fn new(kind: ScopeKind, name: &str, qualname: &str, first_line: u32) -> Self {
        Self {
            kind,
            name: Arc::from(name),
            qualname: Arc::from(qualname),
            first_line,
            arg_count: 0,
            instructions: vec![],
            lines: vec![],
            consts: vec![],
            names: vec![],
            locals: vec![],
            cells: vec![],
            free_vars: vec![],
            captures: vec![],
            nested: vec![],
            exception_table: vec![],
            loops: vec![],
            line: first_line,
            depth: 0,
            max_depth: 0,
        }
    }

    fn emit(&mut self, instr: Instruction) -> usize {
        self.instructions.push(instr);
        self.lines.push(self.line);
        self.set_depth(self.depth + instr.stack_effect());
        self.instructions.len() - 1
    }

    fn set_depth(&mut self, depth: i32) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }

    fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch_jump(&mut self, at: usize, target: u32) {
        self.instructions[at] = self.instructions[at].with_jump_target(target);
    }

    fn add_const(&mut self, value: Value) -> u32 {
        let existing = self.consts.iter().position(|c| {
            c.type_name() == value.type_name()
                && matches!(c, Value::None | Value::Bool(_) | Value::Int(_) | Value::Str(_))
                && c == &value
        });
        match existing {
            Some(idx) => idx as u32,
            None => {
                self.consts.push(value);
                self.consts.len() as u32 - 1
            }
        }
    }

    fn add_name(&mut self, name: &str) -> u32 {
        match self.names.iter().position(|n| &**n == name) {
            Some(idx) => idx as u32,
            None => {
                self.names.push(Arc::from(name));
                self.names.len() as u32 - 1
            }
        }
    }

    fn local(&self, name: &str) -> Option<u32> {
        self.locals
            .iter()
            .position(|n| &**n == name)
            .map(|idx| idx as u32)
    }

    fn free(&self, name: &str) -> Option<u32> {
        self.free_vars
            .iter()
            .position(|n| &**n == name)
            .map(|idx| idx as u32)
    }

    fn add_free(&mut self, name: &str, capture: Capture) -> u32 {
        self.free_vars.push(Arc::from(name));
        self.captures.push(capture);
        self.free_vars.len() as u32 - 1
    }

    fn finish(self, filename: Arc<str>) -> (Code, Vec<Capture>) {
        let code = Code {
            name: self.name,
            qualname: self.qualname,
            filename,
            first_line: self.first_line,
            arg_count: self.arg_count,
            instructions: self.instructions,
            lines: self.lines,
            consts: self.consts,
            names: self.names,
            locals: self.locals,
            cells: self.cells,
            free_vars: self.free_vars,
            nested: self.nested,
            exception_table: self.exception_table,
            stack_size: self.max_depth.max(0) as u32,
        };
        (code, self.captures)
    }
}

struct Compiler {
    filename: Arc<str>,
    globals: Weak<Globals>,
    scopes: Vec<Scope>,
    functions: Vec<Arc<Function>>,
}

impl Compiler {
    fn scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("at least module scope exists")
    }

    fn module(&mut self, body: &[Stmt]) -> Result<Code, RuntimeError> {
        self.scopes
            .push(Scope::new(ScopeKind::Module, "<module>", "<module>", 1));
        self.block(body)?;
        self.implicit_return();
        let scope = self.scopes.pop().expect("module scope");
        Ok(scope.finish(self.filename.clone()).0)
    }

    fn function(&mut self, def: &FunctionDef) -> Result<Arc<Function>, RuntimeError> {
        let parent = self.scopes.last().expect("at least module scope exists");
        let qualname = match parent.kind {
            ScopeKind::Module => def.name.clone(),
            ScopeKind::Function => format!("{}.{}", parent.qualname, def.name),
        };

        let mut scope = Scope::new(ScopeKind::Function, &def.name, &qualname, def.line);
        scope.arg_count = def.params.len() as u32;
        let mut locals: Vec<&str> = def.params.iter().map(String::as_str).collect();
        collect_assigned(&def.body, &mut locals);
        scope.locals = locals.into_iter().map(Arc::from).collect();
        scope.cells = vec![false; scope.locals.len()];
        self.scopes.push(scope);

        self.scope().emit(Instruction::Nop);
        self.block(&def.body)?;
        self.scope().line = def.end_line;
        self.implicit_return();

        let scope = self.scopes.pop().expect("function scope");
        let (code, captures) = scope.finish(self.filename.clone());
        let function = Function::new(
            FunctionProto {
                name: code.name.clone(),
                qualname: code.qualname.clone(),
                filename: self.filename.clone(),
                def_line: def.line,
                end_line: def.end_line,
                captures,
            },
            self.globals.clone(),
            code,
        );
        self.functions.push(function.clone());
        Ok(function)
    }

    fn implicit_return(&mut self) {
        let none = self.scope().add_const(Value::None);
        self.scope().emit(Instruction::LoadConst(none));
        self.scope().emit(Instruction::Return);
    }

    fn block(&mut self, body: &[Stmt]) -> Result<(), RuntimeError> {
        body.iter().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), RuntimeError> {
        self.scope().line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.scope().emit(Instruction::PopTop);
            }
            StmtKind::Assign(name, expr) => {
                self.expr(expr)?;
                self.store(name)?;
            }
            StmtKind::AugAssign(name, op, expr) => {
                self.load(name);
                self.expr(expr)?;
                self.scope().emit(Instruction::Binary(*op));
                self.store(name)?;
            }
            StmtKind::Return(expr) => {
                if self.scope().kind == ScopeKind::Module {
                    return Err(RuntimeError::syntax(stmt.line, "`return` outside function"));
                }
                match expr {
                    Some(expr) => self.expr(expr)?,
                    None => {
                        let none = self.scope().add_const(Value::None);
                        self.scope().emit(Instruction::LoadConst(none));
                    }
                }
                self.scope().emit(Instruction::Return);
            }
            StmtKind::Raise(expr) => {
                self.expr(expr)?;
                self.scope().emit(Instruction::Raise);
            }
            StmtKind::Pass => {
                self.scope().emit(Instruction::Nop);
            }
            StmtKind::Break => {
                let jump = self.scope().emit(Instruction::Jump(0));
                match self.scope().loops.last_mut() {
                    Some(lp) => lp.breaks.push(jump),
                    None => return Err(RuntimeError::syntax(stmt.line, "`break` outside loop")),
                }
            }
            StmtKind::Continue => {
                let start = match self.scope().loops.last() {
                    Some(lp) => lp.start,
                    None => {
                        return Err(RuntimeError::syntax(stmt.line, "`continue` outside loop"))
                    }
                };
                self.scope().emit(Instruction::Jump(start));
            }
            StmtKind::If { branches, orelse } => {
                let mut end_jumps = vec![];
                for (idx, branch) in branches.iter().enumerate() {
                    self.scope().line = branch.line;
                    self.expr(&branch.cond)?;
                    let skip = self.scope().emit(Instruction::JumpIfFalse(0));
                    self.block(&branch.body)?;
                    if idx + 1 < branches.len() || !orelse.is_empty() {
                        end_jumps.push(self.scope().emit(Instruction::Jump(0)));
                    }
                    let here = self.scope().here();
                    self.scope().patch_jump(skip, here);
                }
                self.block(orelse)?;
                let here = self.scope().here();
                for jump in end_jumps {
                    self.scope().patch_jump(jump, here);
                }
            }
            StmtKind::While { cond, body } => {
                let start = self.scope().here();
                self.expr(cond)?;
                let exit = self.scope().emit(Instruction::JumpIfFalse(0));
                self.scope().loops.push(Loop {
                    start,
                    breaks: vec![],
                });
                self.block(body)?;
                self.scope().line = stmt.line;
                self.scope().emit(Instruction::Jump(start));
                let lp = self.scope().loops.pop().expect("loop pushed above");
                let here = self.scope().here();
                self.scope().patch_jump(exit, here);
                for jump in lp.breaks {
                    self.scope().patch_jump(jump, here);
                }
            }
            StmtKind::Try { body, handler } => {
                self.scope().emit(Instruction::Nop);
                let depth = self.scope().depth;
                let start = self.scope().here();
                self.block(body)?;
                let over = self.scope().emit(Instruction::Jump(0));
                let end = self.scope().here();

                self.scope().line = handler.line;
                self.scope().set_depth(depth + 1);
                match &handler.name {
                    Some(name) => self.store(name)?,
                    None => {
                        self.scope().emit(Instruction::PopTop);
                    }
                }
                self.scope().exception_table.push(ExceptionEntry {
                    start,
                    end,
                    target: end,
                    depth: depth as u32,
                });
                self.block(&handler.body)?;
                let here = self.scope().here();
                self.scope().patch_jump(over, here);
            }
            StmtKind::Def(def) => {
                let function = self.function(def)?;
                self.scope().line = stmt.line;
                let scope = self.scope();
                scope.nested.push(function);
                let idx = scope.nested.len() as u32 - 1;
                scope.emit(Instruction::MakeClosure(idx));
                self.store(&def.name)?;
            }
        }
        Ok(())
    }

    fn resolve_in(&mut self, depth: usize, name: &str) -> NameRef {
        let scope = &self.scopes[depth];
        if scope.kind == ScopeKind::Module {
            return NameRef::Global;
        }
        if let Some(idx) = scope.local(name) {
            return NameRef::Local(idx);
        }
        if let Some(idx) = scope.free(name) {
            return NameRef::Free(idx);
        }

        match self.resolve_in(depth - 1, name) {
            NameRef::Global => NameRef::Global,
            NameRef::Local(idx) => {
                self.scopes[depth - 1].cells[idx as usize] = true;
                NameRef::Free(self.scopes[depth].add_free(name, Capture::Local(idx)))
            }
            NameRef::Free(idx) => {
                NameRef::Free(self.scopes[depth].add_free(name, Capture::Free(idx)))
            }
        }
    }

    fn load(&mut self, name: &str) {
        let depth = self.scopes.len() - 1;
        let instr = match self.resolve_in(depth, name) {
            NameRef::Local(idx) => Instruction::LoadLocal(idx),
            NameRef::Free(idx) => Instruction::LoadFree(idx),
            NameRef::Global => Instruction::LoadGlobal(self.scope().add_name(name)),
        };
        self.scope().emit(instr);
    }

    fn store(&mut self, name: &str) -> Result<(), RuntimeError> {
        let scope = self.scope();
        let instr = match scope.kind {
            ScopeKind::Module => Instruction::StoreGlobal(scope.add_name(name)),
            ScopeKind::Function => match scope.local(name) {
                Some(idx) => Instruction::StoreLocal(idx),
                None => {
                    return Err(RuntimeError::Internal(format!(
                        "assignment target `{name}` is not a local of `{}`",
                        scope.qualname
                    )))
                }
            },
        };
        scope.emit(instr);
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), RuntimeError> {
        match expr {
            Expr::Int(i) => self.constant(Value::Int(*i)),
            Expr::Float(f) => self.constant(Value::Float(*f)),
            Expr::Str(s) => self.constant(Value::from(s.as_str())),
            Expr::Bool(b) => self.constant(Value::Bool(*b)),
            Expr::None => self.constant(Value::None),
            Expr::Name(name) => self.load(name),
            Expr::List(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.scope()
                    .emit(Instruction::BuildList(items.len() as u32));
            }
            Expr::Unary(op, operand) => {
                self.expr(operand)?;
                let instr = match op {
                    UnaryOp::Neg => Instruction::Negate,
                    UnaryOp::Not => Instruction::Not,
                };
                self.scope().emit(instr);
            }
            Expr::Binary(op, lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.scope().emit(Instruction::Binary(*op));
            }
            Expr::Call(callee, args) => {
                self.expr(callee)?;
                for arg in args {
                    self.expr(arg)?;
                }
                self.scope().emit(Instruction::Call(args.len() as u32));
            }
        }
        Ok(())
    }

    fn constant(&mut self, value: Value) {
        let idx = self.scope().add_const(value);
        self.scope().emit(Instruction::LoadConst(idx));
    }
}

/// Collect names bound inside a function body, nested function bodies excluded.
fn collect_assigned<'a>(body: &'a [Stmt], names: &mut Vec<&'a str>) {
    fn add<'a>(name: &'a str, names: &mut Vec<&'a str>) {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign(name, _) | StmtKind::AugAssign(name, _, _) => add(name, names),
            StmtKind::Def(def) => add(&def.name, names),
            StmtKind::If { branches, orelse } => {
                for branch in branches {
                    collect_assigned(&branch.body, names);
                }
                collect_assigned(orelse, names);
            }
            StmtKind::While { body, .. } => collect_assigned(body, names),
            StmtKind::Try { body, handler } => {
                collect_assigned(body, names);
                if let Some(name) = &handler.name {
                    add(name, names);
                }
                collect_assigned(&handler.body, names);
            }
            StmtKind::Expr(_)
            | StmtKind::Return(_)
            | StmtKind::Raise(_)
            | StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue => {}
        }
    }
}
