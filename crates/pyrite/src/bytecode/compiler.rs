//! AST-to-bytecode lowering.
//!
//! Compilation walks the ruff AST directly. Constructs outside the supported
//! language subset are rejected with a spanned `CompileError`. Name resolution
//! assigns locals to frame slots, promotes captured variables to cells, and
//! maps module-level names to global slots.

use std::str::FromStr as _;

use ahash::{AHashMap, AHashSet};
use ruff_python_ast::{self as ast, BoolOp, CmpOp, Expr as AstExpr, Number, Operator, Stmt, UnaryOp};
use ruff_text_size::{Ranged, TextRange};

use super::{
    builder::{CodeBuilder, JumpLabel},
    code::{FunctionDef, Program},
    op::Opcode,
};
use crate::{
    builtins::Builtin,
    exception::{ExcType, Exception},
    intern::{FunctionId, InternerBuilder, StringId},
    parse::{CodeRange, SourceMap, parse_source},
    value::Value,
};

/// Compiles source text into a [`Program`].
pub(crate) fn compile(source: &str) -> Result<Program, Exception> {
    let module = parse_source(source).map_err(Exception::from_diagnostic)?;
    let mut compiler = Compiler::new(source);

    // Module-level assigned names, used to tell user bindings from builtins
    // at call sites.
    let mut module_bound = AHashSet::new();
    let mut used = AHashSet::new();
    let mut nested_free = AHashSet::new();
    compiler.collect_stmts(&module.body, &mut module_bound, &mut used, &mut nested_free);
    compiler.module_bound = module_bound;

    compiler.compile_stmts(&module.body)?;
    if compiler.module_builder.jump_overflow() {
        return Err(compiler.error("module body too large", module.range()));
    }
    let mut module_builder = compiler.module_builder;
    module_builder.emit(Opcode::LoadNone);
    module_builder.emit(Opcode::ReturnValue);
    let module_code = module_builder.build(0);

    let functions = compiler
        .functions
        .into_iter()
        .flatten()
        .collect::<Vec<FunctionDef>>();
    Ok(Program {
        interns: compiler.interner.finish(),
        constants: compiler.constants.values,
        global_names: compiler.global_names,
        functions,
        module: module_code,
    })
}

/// Deduplicating constant pool shared by the whole program.
#[derive(Debug, Default)]
struct ConstPool {
    values: Vec<Value>,
    lookup: AHashMap<ConstKey, u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Str(StringId),
}

impl ConstPool {
    fn add(&mut self, key: ConstKey) -> Option<u16> {
        if let Some(&idx) = self.lookup.get(&key) {
            return Some(idx);
        }
        let idx = u16::try_from(self.values.len()).ok()?;
        self.values.push(match key {
            ConstKey::Int(i) => Value::Int(i),
            ConstKey::Str(id) => Value::InternString(id),
        });
        self.lookup.insert(key, idx);
        Some(idx)
    }
}

/// Result of pre-compilation scope analysis for one function.
#[derive(Debug, Default)]
struct ScopeInfo {
    /// Names assigned directly in this scope (params included).
    bound: AHashSet<StringId>,
    /// Names that nested functions reference but do not bind themselves.
    nested_free: AHashSet<StringId>,
}

/// Where a resolved name lives.
enum NameSlot {
    Local(u16),
    Cell(u8),
    Global(u16),
}

/// Per-loop compilation state for `break`/`continue`.
struct LoopCtx {
    continue_target: usize,
    breaks: Vec<JumpLabel>,
    /// `for` loops keep the iterator on the stack; `break` must pop it.
    pop_iter_on_break: bool,
}

/// Compilation state for one function body.
struct FunctionScope {
    bound: AHashSet<StringId>,
    locals: AHashMap<StringId, u16>,
    next_local: u16,
    /// Own cell names, in deterministic (interning) order.
    cells: Vec<StringId>,
    cell_lookup: AHashMap<StringId, u8>,
    /// Captured names, appended as resolution discovers them.
    free: Vec<StringId>,
    free_lookup: AHashMap<StringId, u8>,
    builder: CodeBuilder,
}

impl FunctionScope {
    fn new(bound: AHashSet<StringId>, cells: Vec<StringId>) -> Self {
        let cell_lookup = cells
            .iter()
            .enumerate()
            .map(|(i, &name)| (name, u8::try_from(i).unwrap_or(u8::MAX)))
            .collect();
        Self {
            bound,
            locals: AHashMap::new(),
            next_local: 0,
            cells,
            cell_lookup,
            free: Vec::new(),
            free_lookup: AHashMap::new(),
            builder: CodeBuilder::new(),
        }
    }

    /// Cell index for a name, covering both own and captured cells.
    fn cell_index(&self, name: StringId) -> Option<u8> {
        if let Some(&idx) = self.cell_lookup.get(&name) {
            return Some(idx);
        }
        self.free_lookup
            .get(&name)
            .map(|&idx| idx.saturating_add(u8::try_from(self.cells.len()).unwrap_or(u8::MAX)))
    }

    fn add_free(&mut self, name: StringId) -> u8 {
        if let Some(&idx) = self.free_lookup.get(&name) {
            return idx.saturating_add(u8::try_from(self.cells.len()).unwrap_or(u8::MAX));
        }
        let idx = u8::try_from(self.free.len()).unwrap_or(u8::MAX);
        self.free.push(name);
        self.free_lookup.insert(name, idx);
        idx.saturating_add(u8::try_from(self.cells.len()).unwrap_or(u8::MAX))
    }

    fn local_slot(&mut self, name: StringId) -> u16 {
        if let Some(&slot) = self.locals.get(&name) {
            return slot;
        }
        let slot = self.next_local;
        self.next_local += 1;
        self.locals.insert(name, slot);
        self.builder.register_local_name(slot, name);
        slot
    }
}

/// A function body: a statement block for `def`, a single expression for
/// `lambda`.
#[derive(Clone, Copy)]
enum FnBody<'a> {
    Block(&'a [Stmt]),
    Expr(&'a AstExpr),
}

struct Compiler<'a> {
    map: SourceMap<'a>,
    interner: InternerBuilder,
    constants: ConstPool,
    functions: Vec<Option<FunctionDef>>,
    globals: AHashMap<StringId, u16>,
    global_names: Vec<StringId>,
    module_bound: AHashSet<StringId>,
    module_builder: CodeBuilder,
    scopes: Vec<FunctionScope>,
    loops: Vec<LoopCtx>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str) -> Self {
        let mut interner = InternerBuilder::new();
        // id 0 renders as the empty string in error paths with no recorded name
        let _ = interner.intern("");
        Self {
            map: SourceMap::new(source),
            interner,
            constants: ConstPool::default(),
            functions: Vec::new(),
            globals: AHashMap::new(),
            global_names: Vec::new(),
            module_bound: AHashSet::new(),
            module_builder: CodeBuilder::new(),
            scopes: Vec::new(),
            loops: Vec::new(),
        }
    }

    fn span(&self, range: TextRange) -> CodeRange {
        self.map.range(range)
    }

    fn error(&self, message: impl Into<String>, range: TextRange) -> Exception {
        Exception::new(ExcType::CompileError, message, Some(self.span(range)))
    }

    fn builder(&mut self) -> &mut CodeBuilder {
        match self.scopes.last_mut() {
            Some(scope) => &mut scope.builder,
            None => &mut self.module_builder,
        }
    }

    // --- name resolution ---

    fn global_slot(&mut self, name: StringId) -> u16 {
        if let Some(&slot) = self.globals.get(&name) {
            return slot;
        }
        let slot = u16::try_from(self.global_names.len()).unwrap_or(u16::MAX);
        self.global_names.push(name);
        self.globals.insert(name, slot);
        slot
    }

    fn resolve_store(&mut self, name: StringId) -> NameSlot {
        let Some(scope) = self.scopes.last_mut() else {
            return NameSlot::Global(self.global_slot(name));
        };
        if let Some(idx) = scope.cell_index(name) {
            return NameSlot::Cell(idx);
        }
        NameSlot::Local(scope.local_slot(name))
    }

    fn resolve_load(&mut self, name: StringId) -> NameSlot {
        if !self.scopes.is_empty() {
            let last = self.scopes.len() - 1;
            if let Some(idx) = self.scopes[last].cell_index(name) {
                return NameSlot::Cell(idx);
            }
            if let Some(&slot) = self.scopes[last].locals.get(&name) {
                return NameSlot::Local(slot);
            }
            if self.scopes[last].bound.contains(&name) {
                // assigned later in this function: reading it now is a
                // runtime NameError, which the undefined-slot check raises
                return NameSlot::Local(self.scopes[last].local_slot(name));
            }
            for i in (0..last).rev() {
                if self.scopes[i].bound.contains(&name) {
                    return NameSlot::Cell(self.capture(last, name));
                }
            }
        }
        NameSlot::Global(self.global_slot(name))
    }

    /// Ensures `name` is reachable as a cell in `scopes[scope_idx]`, adding
    /// free entries down the chain of enclosing functions as needed.
    fn capture(&mut self, scope_idx: usize, name: StringId) -> u8 {
        if let Some(idx) = self.scopes[scope_idx].cell_index(name) {
            return idx;
        }
        if scope_idx > 0 {
            self.capture(scope_idx - 1, name);
        }
        self.scopes[scope_idx].add_free(name)
    }

    fn name_is_bound(&self, name: StringId) -> bool {
        self.scopes.iter().any(|s| s.bound.contains(&name)) || self.module_bound.contains(&name)
    }

    fn name_operand(&self, name: StringId, range: TextRange) -> Result<u16, Exception> {
        u16::try_from(name.index()).map_err(|_| self.error("too many names", range))
    }

    fn add_const(&mut self, key: ConstKey, range: TextRange) -> Result<u16, Exception> {
        self.constants
            .add(key)
            .ok_or_else(|| self.error("too many constants", range))
    }

    // --- scope analysis ---

    fn analyze_function(&mut self, params: &[StringId], body: FnBody<'_>) -> ScopeInfo {
        let mut bound: AHashSet<StringId> = params.iter().copied().collect();
        let mut used = AHashSet::new();
        let mut nested_free = AHashSet::new();
        match body {
            FnBody::Block(stmts) => self.collect_stmts(stmts, &mut bound, &mut used, &mut nested_free),
            FnBody::Expr(expr) => self.collect_expr(expr, &mut bound, &mut used, &mut nested_free),
        }
        ScopeInfo { bound, nested_free }
    }

    /// Free names of a function: everything referenced (directly or by nested
    /// functions) that the function does not bind itself.
    fn free_names(&mut self, params: &[StringId], body: FnBody<'_>) -> AHashSet<StringId> {
        let mut bound: AHashSet<StringId> = params.iter().copied().collect();
        let mut used = AHashSet::new();
        let mut nested_free = AHashSet::new();
        match body {
            FnBody::Block(stmts) => self.collect_stmts(stmts, &mut bound, &mut used, &mut nested_free),
            FnBody::Expr(expr) => self.collect_expr(expr, &mut bound, &mut used, &mut nested_free),
        }
        used.extend(nested_free);
        used.retain(|n| !bound.contains(n));
        used
    }

    fn collect_stmts(
        &mut self,
        stmts: &[Stmt],
        bound: &mut AHashSet<StringId>,
        used: &mut AHashSet<StringId>,
        nested_free: &mut AHashSet<StringId>,
    ) {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(s) => self.collect_expr(&s.value, bound, used, nested_free),
                Stmt::Assign(s) => {
                    self.collect_expr(&s.value, bound, used, nested_free);
                    for target in &s.targets {
                        self.collect_target(target, bound, used, nested_free);
                    }
                }
                Stmt::AugAssign(s) => {
                    self.collect_expr(&s.value, bound, used, nested_free);
                    self.collect_target(&s.target, bound, used, nested_free);
                    // aug-assign reads the target too
                    self.collect_expr(&s.target, bound, used, nested_free);
                }
                Stmt::Return(s) => {
                    if let Some(value) = &s.value {
                        self.collect_expr(value, bound, used, nested_free);
                    }
                }
                Stmt::If(s) => {
                    self.collect_expr(&s.test, bound, used, nested_free);
                    self.collect_stmts(&s.body, bound, used, nested_free);
                    for clause in &s.elif_else_clauses {
                        if let Some(test) = &clause.test {
                            self.collect_expr(test, bound, used, nested_free);
                        }
                        self.collect_stmts(&clause.body, bound, used, nested_free);
                    }
                }
                Stmt::While(s) => {
                    self.collect_expr(&s.test, bound, used, nested_free);
                    self.collect_stmts(&s.body, bound, used, nested_free);
                }
                Stmt::For(s) => {
                    self.collect_expr(&s.iter, bound, used, nested_free);
                    self.collect_target(&s.target, bound, used, nested_free);
                    self.collect_stmts(&s.body, bound, used, nested_free);
                }
                Stmt::FunctionDef(f) => {
                    bound.insert(self.interner.intern(f.name.id.as_str()));
                    let params = self.param_names(&f.parameters);
                    let free = self.free_names(&params, FnBody::Block(&f.body));
                    nested_free.extend(free);
                }
                Stmt::ClassDef(c) => {
                    bound.insert(self.interner.intern(c.name.id.as_str()));
                    for stmt in &c.body {
                        if let Stmt::FunctionDef(f) = stmt {
                            let params = self.param_names(&f.parameters);
                            let free = self.free_names(&params, FnBody::Block(&f.body));
                            nested_free.extend(free);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_target(
        &mut self,
        target: &AstExpr,
        bound: &mut AHashSet<StringId>,
        used: &mut AHashSet<StringId>,
        nested_free: &mut AHashSet<StringId>,
    ) {
        match target {
            AstExpr::Name(name) => {
                bound.insert(self.interner.intern(name.id.as_str()));
            }
            AstExpr::Attribute(attr) => self.collect_expr(&attr.value, bound, used, nested_free),
            AstExpr::Subscript(sub) => {
                self.collect_expr(&sub.value, bound, used, nested_free);
                self.collect_expr(&sub.slice, bound, used, nested_free);
            }
            _ => {}
        }
    }

    fn collect_expr(
        &mut self,
        expr: &AstExpr,
        bound: &mut AHashSet<StringId>,
        used: &mut AHashSet<StringId>,
        nested_free: &mut AHashSet<StringId>,
    ) {
        match expr {
            AstExpr::Name(name) => {
                used.insert(self.interner.intern(name.id.as_str()));
            }
            AstExpr::BinOp(e) => {
                self.collect_expr(&e.left, bound, used, nested_free);
                self.collect_expr(&e.right, bound, used, nested_free);
            }
            AstExpr::UnaryOp(e) => self.collect_expr(&e.operand, bound, used, nested_free),
            AstExpr::BoolOp(e) => {
                for value in &e.values {
                    self.collect_expr(value, bound, used, nested_free);
                }
            }
            AstExpr::Compare(e) => {
                self.collect_expr(&e.left, bound, used, nested_free);
                for comparator in &e.comparators {
                    self.collect_expr(comparator, bound, used, nested_free);
                }
            }
            AstExpr::Call(e) => {
                self.collect_expr(&e.func, bound, used, nested_free);
                for arg in &e.arguments.args {
                    self.collect_expr(arg, bound, used, nested_free);
                }
            }
            AstExpr::Attribute(e) => self.collect_expr(&e.value, bound, used, nested_free),
            AstExpr::Subscript(e) => {
                self.collect_expr(&e.value, bound, used, nested_free);
                self.collect_expr(&e.slice, bound, used, nested_free);
            }
            AstExpr::List(e) => {
                for elt in &e.elts {
                    self.collect_expr(elt, bound, used, nested_free);
                }
            }
            AstExpr::Dict(e) => {
                for item in &e.items {
                    if let Some(key) = &item.key {
                        self.collect_expr(key, bound, used, nested_free);
                    }
                    self.collect_expr(&item.value, bound, used, nested_free);
                }
            }
            AstExpr::If(e) => {
                self.collect_expr(&e.test, bound, used, nested_free);
                self.collect_expr(&e.body, bound, used, nested_free);
                self.collect_expr(&e.orelse, bound, used, nested_free);
            }
            AstExpr::Lambda(e) => {
                let params = e.parameters.as_deref().map(|p| self.param_names(p)).unwrap_or_default();
                let free = self.free_names(&params, FnBody::Expr(&e.body));
                nested_free.extend(free);
            }
            _ => {}
        }
    }

    fn param_names(&mut self, parameters: &ast::Parameters) -> Vec<StringId> {
        parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .map(|p| self.interner.intern(p.parameter.name.id.as_str()))
            .collect()
    }

    // --- statements ---

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<(), Exception> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), Exception> {
        match stmt {
            Stmt::Expr(s) => {
                self.compile_expr(&s.value)?;
                self.builder().emit(Opcode::Pop);
                Ok(())
            }
            Stmt::Assign(s) => self.compile_assign(s),
            Stmt::AugAssign(s) => self.compile_aug_assign(s),
            Stmt::If(s) => self.compile_if(s),
            Stmt::While(s) => self.compile_while(s),
            Stmt::For(s) => self.compile_for(s),
            Stmt::FunctionDef(f) => self.compile_function_def(f),
            Stmt::ClassDef(c) => self.compile_class_def(c),
            Stmt::Return(s) => {
                if self.scopes.is_empty() {
                    return Err(self.error("'return' outside function", s.range));
                }
                match &s.value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.builder().emit(Opcode::LoadNone),
                }
                self.builder().emit(Opcode::ReturnValue);
                Ok(())
            }
            Stmt::Pass(_) => Ok(()),
            Stmt::Break(s) => {
                let depth = self.builder().stack_depth();
                let Some(ctx) = self.loops.last() else {
                    return Err(self.error("'break' outside loop", s.range));
                };
                let pop_iter = ctx.pop_iter_on_break;
                if pop_iter {
                    self.builder().emit(Opcode::Pop);
                }
                let label = self.builder().emit_jump(Opcode::Jump);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.breaks.push(label);
                }
                // code after the jump resumes at the pre-break depth
                self.builder().set_stack_depth(depth);
                Ok(())
            }
            Stmt::Continue(s) => {
                let Some(ctx) = self.loops.last() else {
                    return Err(self.error("'continue' outside loop", s.range));
                };
                let target = ctx.continue_target;
                self.builder().emit_jump_to(Opcode::Jump, target);
                Ok(())
            }
            Stmt::Global(s) => Err(self.error("'global' declarations are not supported", s.range)),
            Stmt::Nonlocal(s) => Err(self.error("'nonlocal' declarations are not supported", s.range)),
            _ => Err(self.error("unsupported statement", stmt.range())),
        }
    }

    fn compile_assign(&mut self, s: &ast::StmtAssign) -> Result<(), Exception> {
        if s.targets.len() != 1 {
            return Err(self.error("chained assignment is not supported", s.range));
        }
        let target = &s.targets[0];
        match target {
            AstExpr::Name(name) => {
                self.compile_expr(&s.value)?;
                self.compile_store_name(name)
            }
            AstExpr::Attribute(attr) => {
                self.compile_expr(&s.value)?;
                self.compile_expr(&attr.value)?;
                let name = self.interner.intern(attr.attr.as_str());
                let operand = self.name_operand(name, attr.range)?;
                let span = self.span(s.range);
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::StoreAttr, operand);
                Ok(())
            }
            AstExpr::Subscript(sub) => {
                self.compile_expr(&s.value)?;
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.slice)?;
                let span = self.span(s.range);
                self.builder().set_span(span);
                self.builder().emit(Opcode::StoreIndex);
                Ok(())
            }
            _ => Err(self.error("unsupported assignment target", target.range())),
        }
    }

    fn compile_aug_assign(&mut self, s: &ast::StmtAugAssign) -> Result<(), Exception> {
        let op = self.binary_opcode(s.op, s.range)?;
        let span = self.span(s.range);
        match s.target.as_ref() {
            AstExpr::Name(name) => {
                self.compile_name_load(name)?;
                self.compile_expr(&s.value)?;
                self.builder().set_span(span);
                self.builder().emit(op);
                self.compile_store_name(name)
            }
            AstExpr::Attribute(attr) => {
                // target object is evaluated twice; fine for this subset
                self.compile_expr(&attr.value)?;
                let name = self.interner.intern(attr.attr.as_str());
                let operand = self.name_operand(name, attr.range)?;
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::LoadAttr, operand);
                self.compile_expr(&s.value)?;
                self.builder().set_span(span);
                self.builder().emit(op);
                self.compile_expr(&attr.value)?;
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::StoreAttr, operand);
                Ok(())
            }
            AstExpr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.slice)?;
                self.builder().set_span(span);
                self.builder().emit(Opcode::LoadIndex);
                self.compile_expr(&s.value)?;
                self.builder().set_span(span);
                self.builder().emit(op);
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.slice)?;
                self.builder().set_span(span);
                self.builder().emit(Opcode::StoreIndex);
                Ok(())
            }
            _ => Err(self.error("unsupported assignment target", s.target.range())),
        }
    }

    fn compile_if(&mut self, s: &ast::StmtIf) -> Result<(), Exception> {
        // elif chains compile as nested if/else; every taken branch jumps to
        // the shared join point
        let mut end_jumps = Vec::new();

        self.compile_expr(&s.test)?;
        let mut pending = Some(self.builder().emit_jump(Opcode::JumpIfFalse));
        self.compile_stmts(&s.body)?;

        for clause in &s.elif_else_clauses {
            end_jumps.push(self.builder().emit_jump(Opcode::Jump));
            if let Some(label) = pending.take() {
                self.builder().patch_jump(label);
            }
            match &clause.test {
                Some(test) => {
                    self.compile_expr(test)?;
                    pending = Some(self.builder().emit_jump(Opcode::JumpIfFalse));
                    self.compile_stmts(&clause.body)?;
                }
                None => self.compile_stmts(&clause.body)?,
            }
        }
        if let Some(label) = pending {
            self.builder().patch_jump(label);
        }
        for label in end_jumps {
            self.builder().patch_jump(label);
        }
        Ok(())
    }

    fn compile_while(&mut self, s: &ast::StmtWhile) -> Result<(), Exception> {
        if !s.orelse.is_empty() {
            return Err(self.error("'while ... else' is not supported", s.range));
        }
        let loop_start = self.builder().current_offset();
        self.compile_expr(&s.test)?;
        let exit = self.builder().emit_jump(Opcode::JumpIfFalse);
        self.loops.push(LoopCtx {
            continue_target: loop_start,
            breaks: Vec::new(),
            pop_iter_on_break: false,
        });
        self.compile_stmts(&s.body)?;
        self.builder().emit_jump_to(Opcode::Jump, loop_start);
        self.builder().patch_jump(exit);
        let ctx = self.loops.pop();
        if let Some(ctx) = ctx {
            for label in ctx.breaks {
                self.builder().patch_jump(label);
            }
        }
        Ok(())
    }

    fn compile_for(&mut self, s: &ast::StmtFor) -> Result<(), Exception> {
        if !s.orelse.is_empty() {
            return Err(self.error("'for ... else' is not supported", s.range));
        }
        if s.is_async {
            return Err(self.error("'async for' is not supported", s.range));
        }
        let AstExpr::Name(target) = s.target.as_ref() else {
            return Err(self.error("for-loop target must be a name", s.target.range()));
        };

        self.compile_expr(&s.iter)?;
        let iter_span = self.span(s.iter.range());
        self.builder().set_span(iter_span);
        self.builder().emit(Opcode::GetIter);
        let depth_with_iter = self.builder().stack_depth();

        let loop_start = self.builder().current_offset();
        let exit = self.builder().emit_jump(Opcode::ForIter);
        self.compile_store_name(target)?;
        self.loops.push(LoopCtx {
            continue_target: loop_start,
            breaks: Vec::new(),
            pop_iter_on_break: true,
        });
        self.compile_stmts(&s.body)?;
        self.builder().emit_jump_to(Opcode::Jump, loop_start);
        self.builder().patch_jump(exit);
        let ctx = self.loops.pop();
        if let Some(ctx) = ctx {
            for label in ctx.breaks {
                self.builder().patch_jump(label);
            }
        }
        // the exhausted path popped the iterator
        let depth = depth_with_iter.saturating_sub(1);
        self.builder().set_stack_depth(depth);
        Ok(())
    }

    fn compile_function_def(&mut self, f: &ast::StmtFunctionDef) -> Result<(), Exception> {
        if f.is_async {
            return Err(self.error("'async def' is not supported", f.range));
        }
        if !f.decorator_list.is_empty() {
            return Err(self.error("decorators are not supported", f.range));
        }
        self.check_parameters(&f.parameters)?;
        let name = self.interner.intern(f.name.id.as_str());
        let params = self.param_names(&f.parameters);
        let (fid, free) = self.compile_function(name, &params, FnBody::Block(&f.body), f.range)?;
        self.emit_function_value(fid, &free, f.range)?;
        self.compile_store_id(name)
    }

    fn compile_class_def(&mut self, c: &ast::StmtClassDef) -> Result<(), Exception> {
        if c
            .arguments
            .as_ref()
            .is_some_and(|args| !args.args.is_empty() || !args.keywords.is_empty())
        {
            return Err(self.error("inheritance is not supported", c.range));
        }
        if !c.decorator_list.is_empty() {
            return Err(self.error("decorators are not supported", c.range));
        }
        let class_name = self.interner.intern(c.name.id.as_str());
        let mut methods = Vec::new();
        for stmt in &c.body {
            match stmt {
                Stmt::FunctionDef(f) => {
                    if f.is_async {
                        return Err(self.error("'async def' is not supported", f.range));
                    }
                    self.check_parameters(&f.parameters)?;
                    let method_name = self.interner.intern(f.name.id.as_str());
                    let params = self.param_names(&f.parameters);
                    let (fid, free) = self.compile_function(method_name, &params, FnBody::Block(&f.body), f.range)?;
                    if !free.is_empty() {
                        return Err(self.error("methods may not capture enclosing variables", f.range));
                    }
                    let name_operand = self.name_operand(method_name, f.range)?;
                    methods.push((name_operand, fid.0));
                }
                Stmt::Pass(_) => {}
                _ => return Err(self.error("class bodies may only contain method definitions", stmt.range())),
            }
        }
        let name_operand = self.name_operand(class_name, c.range)?;
        let span = self.span(c.range);
        self.builder().set_span(span);
        self.builder().emit_build_class(name_operand, &methods);
        self.compile_store_id(class_name)
    }

    fn check_parameters(&self, parameters: &ast::Parameters) -> Result<(), Exception> {
        if parameters.vararg.is_some() || parameters.kwarg.is_some() || !parameters.kwonlyargs.is_empty() {
            return Err(self.error("only plain positional parameters are supported", parameters.range));
        }
        let has_default = parameters
            .posonlyargs
            .iter()
            .chain(&parameters.args)
            .any(|p| p.default.is_some());
        if has_default {
            return Err(self.error("parameter defaults are not supported", parameters.range));
        }
        Ok(())
    }

    /// Compiles a function body into the program's function table.
    ///
    /// Returns the new function id and the names it captures from enclosing
    /// scopes, in capture-index order.
    fn compile_function(
        &mut self,
        name: StringId,
        params: &[StringId],
        body: FnBody<'_>,
        range: TextRange,
    ) -> Result<(FunctionId, Vec<StringId>), Exception> {
        let fid = u16::try_from(self.functions.len()).map_err(|_| self.error("too many functions", range))?;
        let fid = FunctionId(fid);
        self.functions.push(None);

        if params.len() > usize::from(u8::MAX) {
            return Err(self.error("too many parameters", range));
        }

        let info = self.analyze_function(params, body);
        // names this function binds that some nested function captures
        let mut cells: Vec<StringId> = info.bound.intersection(&info.nested_free).copied().collect();
        cells.sort_unstable();
        if cells.len() > usize::from(u8::MAX) {
            return Err(self.error("too many captured variables", range));
        }
        let num_own_cells = u8::try_from(cells.len()).unwrap_or(u8::MAX);

        let mut scope = FunctionScope::new(info.bound, cells);
        for &param in params {
            let _ = scope.local_slot(param);
        }
        self.scopes.push(scope);

        // copy captured parameters from their argument slots into cells
        for (i, &param) in params.iter().enumerate() {
            let cell_idx = self.scopes.last().and_then(|s| s.cell_lookup.get(&param).copied());
            if let Some(cell_idx) = cell_idx {
                let slot = u16::try_from(i).unwrap_or(u16::MAX);
                self.builder().emit_load_local(slot);
                self.builder().emit_u8(Opcode::StoreCell, cell_idx);
            }
        }

        let saved_loops = std::mem::take(&mut self.loops);
        let result = match body {
            FnBody::Block(stmts) => self.compile_stmts(stmts).map(|()| {
                self.builder().emit(Opcode::LoadNone);
                self.builder().emit(Opcode::ReturnValue);
            }),
            FnBody::Expr(expr) => self.compile_expr(expr).map(|()| {
                self.builder().emit(Opcode::ReturnValue);
            }),
        };
        self.loops = saved_loops;

        let scope = self.scopes.pop();
        result?;
        let Some(scope) = scope else {
            return Err(self.error("corrupted scope stack", range));
        };

        if scope.builder.jump_overflow() {
            return Err(self.error("function body too large", range));
        }

        let num_locals = scope.next_local;
        let code = scope.builder.build(num_locals);
        self.functions[fid.index()] = Some(FunctionDef {
            name,
            num_params: u8::try_from(params.len()).unwrap_or(u8::MAX),
            num_own_cells,
            code,
        });
        Ok((fid, scope.free))
    }

    /// Emits `MakeFunction` or `MakeClosure` for a just-compiled function.
    fn emit_function_value(&mut self, fid: FunctionId, free: &[StringId], range: TextRange) -> Result<(), Exception> {
        if free.is_empty() {
            self.builder().emit_u16(Opcode::MakeFunction, fid.0);
            return Ok(());
        }
        if self.scopes.is_empty() {
            return Err(self.error("closure captures outside a function", range));
        }
        let last = self.scopes.len() - 1;
        let captures: Vec<u8> = free.iter().map(|&name| self.capture(last, name)).collect();
        self.builder().emit_make_closure(fid.0, &captures);
        Ok(())
    }

    // --- expressions ---

    fn compile_expr(&mut self, expr: &AstExpr) -> Result<(), Exception> {
        match expr {
            AstExpr::Name(name) => self.compile_name_load(name),
            AstExpr::NumberLiteral(lit) => self.compile_number(lit),
            AstExpr::StringLiteral(lit) => {
                let id = self.interner.intern(lit.value.to_str());
                let idx = self.add_const(ConstKey::Str(id), lit.range)?;
                self.builder().emit_u16(Opcode::LoadConst, idx);
                Ok(())
            }
            AstExpr::BooleanLiteral(lit) => {
                self.builder()
                    .emit(if lit.value { Opcode::LoadTrue } else { Opcode::LoadFalse });
                Ok(())
            }
            AstExpr::NoneLiteral(_) => {
                self.builder().emit(Opcode::LoadNone);
                Ok(())
            }
            AstExpr::List(list) => {
                let count =
                    u16::try_from(list.elts.len()).map_err(|_| self.error("list literal too large", list.range))?;
                for elt in &list.elts {
                    self.compile_expr(elt)?;
                }
                self.builder().emit_u16(Opcode::BuildList, count);
                Ok(())
            }
            AstExpr::Dict(dict) => {
                let count =
                    u16::try_from(dict.items.len()).map_err(|_| self.error("dict literal too large", dict.range))?;
                for item in &dict.items {
                    let Some(key) = &item.key else {
                        return Err(self.error("dict unpacking is not supported", dict.range));
                    };
                    self.compile_expr(key)?;
                    self.compile_expr(&item.value)?;
                }
                let span = self.span(dict.range);
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::BuildDict, count);
                Ok(())
            }
            AstExpr::BinOp(e) => {
                let op = self.binary_opcode(e.op, e.range)?;
                self.compile_expr(&e.left)?;
                self.compile_expr(&e.right)?;
                let span = self.span(e.range());
                self.builder().set_span(span);
                self.builder().emit(op);
                Ok(())
            }
            AstExpr::UnaryOp(e) => match e.op {
                UnaryOp::Not => {
                    self.compile_expr(&e.operand)?;
                    self.builder().emit(Opcode::UnaryNot);
                    Ok(())
                }
                UnaryOp::USub => {
                    self.compile_expr(&e.operand)?;
                    let span = self.span(e.range());
                    self.builder().set_span(span);
                    self.builder().emit(Opcode::UnaryNeg);
                    Ok(())
                }
                UnaryOp::UAdd => self.compile_expr(&e.operand),
                UnaryOp::Invert => Err(self.error("bitwise operators are not supported", e.range())),
            },
            AstExpr::BoolOp(e) => self.compile_bool_op(e),
            AstExpr::Compare(e) => self.compile_compare(e),
            AstExpr::Call(e) => self.compile_call(e),
            AstExpr::Attribute(e) => {
                self.compile_expr(&e.value)?;
                let name = self.interner.intern(e.attr.as_str());
                let operand = self.name_operand(name, e.range())?;
                let span = self.span(e.range());
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::LoadAttr, operand);
                Ok(())
            }
            AstExpr::Subscript(e) => {
                self.compile_expr(&e.value)?;
                self.compile_expr(&e.slice)?;
                let span = self.span(e.range());
                self.builder().set_span(span);
                self.builder().emit(Opcode::LoadIndex);
                Ok(())
            }
            AstExpr::If(e) => {
                self.compile_expr(&e.test)?;
                let else_branch = self.builder().emit_jump(Opcode::JumpIfFalse);
                self.compile_expr(&e.body)?;
                let end = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(else_branch);
                // both arms leave exactly one value
                let depth = self.builder().stack_depth().saturating_sub(1);
                self.builder().set_stack_depth(depth);
                self.compile_expr(&e.orelse)?;
                self.builder().patch_jump(end);
                Ok(())
            }
            AstExpr::Lambda(e) => {
                let params = e.parameters.as_deref().map(|p| self.param_names(p)).unwrap_or_default();
                if let Some(parameters) = e.parameters.as_deref() {
                    self.check_parameters(parameters)?;
                }
                let name = self.interner.intern("<lambda>");
                let (fid, free) = self.compile_function(name, &params, FnBody::Expr(&e.body), e.range)?;
                self.emit_function_value(fid, &free, e.range)
            }
            _ => Err(self.error("unsupported expression", expr.range())),
        }
    }

    fn compile_number(&mut self, lit: &ast::ExprNumberLiteral) -> Result<(), Exception> {
        match &lit.value {
            Number::Int(i) => {
                let Some(i) = i.as_i64() else {
                    return Err(self.error("integer literal out of range", lit.range));
                };
                if let Ok(small) = i8::try_from(i) {
                    self.builder().emit_i8(Opcode::LoadSmallInt, small);
                } else {
                    let idx = self.add_const(ConstKey::Int(i), lit.range)?;
                    self.builder().emit_u16(Opcode::LoadConst, idx);
                }
                Ok(())
            }
            Number::Float(_) | Number::Complex { .. } => {
                Err(self.error("only integer numbers are supported", lit.range))
            }
        }
    }

    fn binary_opcode(&self, op: Operator, range: TextRange) -> Result<Opcode, Exception> {
        match op {
            Operator::Add => Ok(Opcode::Add),
            Operator::Sub => Ok(Opcode::Sub),
            Operator::Mult => Ok(Opcode::Mul),
            // no floats in the language, `/` floors like `//`
            Operator::Div | Operator::FloorDiv => Ok(Opcode::FloorDiv),
            Operator::Mod => Ok(Opcode::Mod),
            _ => Err(self.error("unsupported binary operator", range)),
        }
    }

    fn compile_bool_op(&mut self, e: &ast::ExprBoolOp) -> Result<(), Exception> {
        let jump_op = match e.op {
            BoolOp::And => Opcode::JumpIfFalseOrPop,
            BoolOp::Or => Opcode::JumpIfTrueOrPop,
        };
        let mut short_circuits = Vec::new();
        for (i, value) in e.values.iter().enumerate() {
            if i > 0 {
                short_circuits.push(self.builder().emit_jump(jump_op));
            }
            self.compile_expr(value)?;
        }
        for label in short_circuits {
            self.builder().patch_jump(label);
        }
        Ok(())
    }

    fn compile_compare(&mut self, e: &ast::ExprCompare) -> Result<(), Exception> {
        let mut short_circuits = Vec::new();
        let mut left: &AstExpr = &e.left;
        for (i, (op, right)) in e.ops.iter().zip(&e.comparators).enumerate() {
            if i > 0 {
                // chained comparison: `a < b < c` lowers to `a < b and b < c`,
                // re-evaluating the middle operand
                short_circuits.push(self.builder().emit_jump(Opcode::JumpIfFalseOrPop));
            }
            let opcode = match op {
                CmpOp::Eq => Opcode::CompareEq,
                CmpOp::NotEq => Opcode::CompareNe,
                CmpOp::Lt => Opcode::CompareLt,
                CmpOp::LtE => Opcode::CompareLe,
                CmpOp::Gt => Opcode::CompareGt,
                CmpOp::GtE => Opcode::CompareGe,
                _ => return Err(self.error("unsupported comparison operator", e.range())),
            };
            self.compile_expr(left)?;
            self.compile_expr(right)?;
            let span = self.span(e.range());
            self.builder().set_span(span);
            self.builder().emit(opcode);
            left = right;
        }
        for label in short_circuits {
            self.builder().patch_jump(label);
        }
        Ok(())
    }

    fn compile_call(&mut self, e: &ast::ExprCall) -> Result<(), Exception> {
        if !e.arguments.keywords.is_empty() {
            return Err(self.error("keyword arguments are not supported", e.range()));
        }
        let argc = u8::try_from(e.arguments.args.len()).map_err(|_| self.error("too many arguments", e.range()))?;
        let span = self.span(e.range());

        if let AstExpr::Name(name) = e.func.as_ref() {
            let name_id = self.interner.intern(name.id.as_str());
            if !self.name_is_bound(name_id) {
                if name.id.as_str() == "input" {
                    if argc > 1 {
                        return Err(self.error("input() takes at most 1 argument", e.range()));
                    }
                    let has_prompt = argc == 1;
                    if has_prompt {
                        self.compile_expr(&e.arguments.args[0])?;
                    }
                    self.builder().set_span(span);
                    self.builder().emit_input(has_prompt);
                    return Ok(());
                }
                if let Ok(builtin) = Builtin::from_str(name.id.as_str()) {
                    for arg in &e.arguments.args {
                        self.compile_expr(arg)?;
                    }
                    self.builder().set_span(span);
                    self.builder().emit_call_builtin(builtin as u8, argc);
                    return Ok(());
                }
            }
        }

        if let AstExpr::Attribute(attr) = e.func.as_ref() {
            self.compile_expr(&attr.value)?;
            for arg in &e.arguments.args {
                self.compile_expr(arg)?;
            }
            let name = self.interner.intern(attr.attr.as_str());
            let operand = self.name_operand(name, e.range())?;
            self.builder().set_span(span);
            self.builder().emit_call_method(operand, argc);
            return Ok(());
        }

        self.compile_expr(&e.func)?;
        for arg in &e.arguments.args {
            self.compile_expr(arg)?;
        }
        self.builder().set_span(span);
        self.builder().emit_call_function(argc);
        Ok(())
    }

    fn compile_name_load(&mut self, name: &ast::ExprName) -> Result<(), Exception> {
        let name_id = self.interner.intern(name.id.as_str());
        let span = self.span(name.range);
        match self.resolve_load(name_id) {
            NameSlot::Local(slot) => {
                self.builder().set_span(span);
                self.builder().emit_load_local(slot);
            }
            NameSlot::Cell(idx) => {
                self.builder().set_span(span);
                self.builder().emit_u8(Opcode::LoadCell, idx);
            }
            NameSlot::Global(slot) => {
                self.builder().set_span(span);
                self.builder().emit_u16(Opcode::LoadGlobal, slot);
            }
        }
        Ok(())
    }

    fn compile_store_name(&mut self, name: &ast::ExprName) -> Result<(), Exception> {
        let name_id = self.interner.intern(name.id.as_str());
        self.compile_store_id(name_id)
    }

    fn compile_store_id(&mut self, name_id: StringId) -> Result<(), Exception> {
        match self.resolve_store(name_id) {
            NameSlot::Local(slot) => self.builder().emit_store_local(slot),
            NameSlot::Cell(idx) => self.builder().emit_u8(Opcode::StoreCell, idx),
            NameSlot::Global(slot) => self.builder().emit_u16(Opcode::StoreGlobal, slot),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_simple_module() {
        let program = compile("x = 1\nprint(x)\n").unwrap();
        assert!(program.functions.is_empty());
        assert_eq!(program.global_names.len(), 1);
    }

    #[test]
    fn dedups_constants() {
        let program = compile("a = 'hi'\nb = 'hi'\nc = 1000\nd = 1000\n").unwrap();
        // one string and one large int; small ints are inline operands
        assert_eq!(program.constants.len(), 2);
    }

    #[test]
    fn function_def_creates_function() {
        let program = compile("def f(a, b):\n    return a + b\n").unwrap();
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].num_params, 2);
    }

    #[test]
    fn closure_capture_allocates_cells() {
        let source = "def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n";
        let program = compile(source).unwrap();
        assert_eq!(program.functions.len(), 2);
        let outer = program.functions.iter().find(|f| f.num_own_cells > 0);
        assert!(outer.is_some(), "outer should allocate a cell for x");
    }

    #[test]
    fn return_outside_function_is_rejected() {
        let err = compile("return 1\n").unwrap_err();
        assert_eq!(err.exc, ExcType::CompileError);
        assert!(err.message.contains("outside function"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile("break\n").unwrap_err();
        assert_eq!(err.exc, ExcType::CompileError);
    }

    #[test]
    fn float_literals_are_rejected() {
        let err = compile("x = 1.5\n").unwrap_err();
        assert_eq!(err.exc, ExcType::CompileError);
        assert!(err.span.is_some());
    }

    #[test]
    fn syntax_error_carries_span() {
        let err = compile("x = (1\n").unwrap_err();
        assert_eq!(err.exc, ExcType::SyntaxError);
        assert!(err.span.is_some());
    }

    #[test]
    fn shadowed_input_is_an_ordinary_name() {
        // `input` assigned at module level must not compile to the Input opcode
        let program = compile("input = 5\nx = input\n").unwrap();
        assert!(!program.module.bytecode().contains(&(Opcode::Input as u8)));
    }
}
