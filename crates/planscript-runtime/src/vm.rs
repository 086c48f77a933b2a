//! Interpreter
//!
//! Evaluates the AST against an environment chain. Control flow is
//! threaded through a tagged `StepOutcome` rather than exceptional
//! unwinding: `Return` unwinds one call frame, `Break` the innermost
//! loop. Every statement tick charges the step budget and emits a
//! `stmt` event before executing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;
use serde_json::Value as Json;

use planscript_core::event::EventKind;
use planscript_lang::ast::{BinOp, Expr, Stmt, StmtKind};

use crate::builtins;
use crate::context::RunContext;
use crate::value::{ClassDef, FunctionDef, Value};
use crate::VmError;

/// Statement outcome threaded through the evaluator.
#[derive(Debug)]
pub enum StepOutcome {
    Normal,
    Return(Value),
    Break,
}

/// Variable scope: module globals plus an optional call-frame local map.
/// Functions close over globals only.
#[derive(Clone)]
pub struct Scope {
    pub globals: Rc<RefCell<HashMap<String, Value>>>,
    pub locals: Option<Rc<RefCell<HashMap<String, Value>>>>,
}

impl Scope {
    fn top(globals: Rc<RefCell<HashMap<String, Value>>>) -> Self {
        Self {
            globals,
            locals: None,
        }
    }

    fn frame(&self, locals: HashMap<String, Value>) -> Self {
        Self {
            globals: self.globals.clone(),
            locals: Some(Rc::new(RefCell::new(locals))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(locals) = &self.locals {
            if let Some(value) = locals.borrow().get(name) {
                return Some(value.clone());
            }
        }
        self.globals.borrow().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        match &self.locals {
            Some(locals) => {
                locals.borrow_mut().insert(name.to_string(), value);
            }
            None => {
                self.globals.borrow_mut().insert(name.to_string(), value);
            }
        }
    }
}

/// The tree-walking VM for one run.
pub struct Vm {
    pub(crate) ctx: Rc<RunContext>,
    globals: Rc<RefCell<HashMap<String, Value>>>,
}

impl Vm {
    pub fn new(ctx: Rc<RunContext>) -> Self {
        Self {
            ctx,
            globals: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn ctx(&self) -> &Rc<RunContext> {
        &self.ctx
    }

    /// Pre-bind a global before the run (sub-workflow `opts.args`).
    pub fn define_global(&self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    /// Execute a whole script. A top-level `return` becomes the result.
    pub async fn run(&self, stmts: &[Stmt]) -> Result<Option<Json>, VmError> {
        let scope = Scope::top(self.globals.clone());
        match self.exec_block(stmts, &scope).await? {
            StepOutcome::Normal => Ok(None),
            StepOutcome::Return(value) => Ok(Some(value.to_json())),
            StepOutcome::Break => Err(VmError::Runtime("break outside of a loop".to_string())),
        }
    }

    pub(crate) async fn exec_block(
        &self,
        stmts: &[Stmt],
        scope: &Scope,
    ) -> Result<StepOutcome, VmError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope).await? {
                StepOutcome::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(StepOutcome::Normal)
    }

    fn exec_stmt<'a>(
        &'a self,
        stmt: &'a Stmt,
        scope: &'a Scope,
    ) -> LocalBoxFuture<'a, Result<StepOutcome, VmError>> {
        Box::pin(async move {
            self.ctx.budget().borrow_mut().charge_step()?;
            self.ctx.emit(EventKind::Stmt {
                node: stmt.kind.node_name().to_string(),
            })?;

            match &stmt.kind {
                StmtKind::FuncDef { name, params, body } => {
                    scope.set(
                        name,
                        Value::Function(Rc::new(FunctionDef {
                            name: name.clone(),
                            params: params.clone(),
                            body: body.clone(),
                        })),
                    );
                    Ok(StepOutcome::Normal)
                }
                StmtKind::ClassDef { name, body } => {
                    scope.set(
                        name,
                        Value::Class(Rc::new(ClassDef {
                            name: name.clone(),
                            body: body.clone(),
                        })),
                    );
                    Ok(StepOutcome::Normal)
                }
                StmtKind::Assign { name, value } => {
                    let value = self.eval_expr(value, scope).await?;
                    scope.set(name, value);
                    Ok(StepOutcome::Normal)
                }
                StmtKind::MemberAssign {
                    target,
                    field,
                    value,
                } => {
                    let target = self.eval_expr(target, scope).await?;
                    let value = self.eval_expr(value, scope).await?;
                    match target {
                        Value::Object(entries) => {
                            entries.borrow_mut().insert(field.clone(), value);
                            Ok(StepOutcome::Normal)
                        }
                        other => Err(VmError::Runtime(format!(
                            "cannot assign member '{}' on {}",
                            field,
                            other.type_name()
                        ))),
                    }
                }
                StmtKind::IndexAssign {
                    target,
                    index,
                    value,
                } => {
                    let target = self.eval_expr(target, scope).await?;
                    let index = self.eval_expr(index, scope).await?;
                    let value = self.eval_expr(value, scope).await?;
                    match (&target, &index) {
                        (Value::Array(items), Value::Int(i)) => {
                            let mut items = items.borrow_mut();
                            let len = items.len();
                            let idx = usize::try_from(*i).map_err(|_| {
                                VmError::Runtime(format!("negative index {}", i))
                            })?;
                            if idx >= len {
                                return Err(VmError::Runtime(format!(
                                    "index {} out of bounds (len {})",
                                    idx, len
                                )));
                            }
                            items[idx] = value;
                            Ok(StepOutcome::Normal)
                        }
                        (Value::Object(entries), Value::Str(key)) => {
                            entries.borrow_mut().insert(key.clone(), value);
                            Ok(StepOutcome::Normal)
                        }
                        (target, index) => Err(VmError::Runtime(format!(
                            "cannot index {} with {}",
                            target.type_name(),
                            index.type_name()
                        ))),
                    }
                }
                StmtKind::ExprStmt(expr) => {
                    self.eval_expr(expr, scope).await?;
                    Ok(StepOutcome::Normal)
                }
                StmtKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval_expr(expr, scope).await?,
                        None => Value::Null,
                    };
                    Ok(StepOutcome::Return(value))
                }
                StmtKind::Break => Ok(StepOutcome::Break),
                StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    if self.eval_expr(cond, scope).await?.truthy() {
                        self.exec_block(then_body, scope).await
                    } else if let Some(else_body) = else_body {
                        self.exec_block(else_body, scope).await
                    } else {
                        Ok(StepOutcome::Normal)
                    }
                }
                StmtKind::While { cond, body } => {
                    loop {
                        if !self.eval_expr(cond, scope).await?.truthy() {
                            break;
                        }
                        match self.exec_block(body, scope).await? {
                            StepOutcome::Normal => {}
                            StepOutcome::Break => break,
                            outcome @ StepOutcome::Return(_) => return Ok(outcome),
                        }
                    }
                    Ok(StepOutcome::Normal)
                }
                StmtKind::For { var, iter, body } => {
                    let iterable = self.eval_expr(iter, scope).await?;
                    let items = match &iterable {
                        Value::Array(items) => items.borrow().clone(),
                        other => {
                            return Err(VmError::Runtime(format!(
                                "for expects an array, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    for item in items {
                        scope.set(var, item);
                        match self.exec_block(body, scope).await? {
                            StepOutcome::Normal => {}
                            StepOutcome::Break => break,
                            outcome @ StepOutcome::Return(_) => return Ok(outcome),
                        }
                    }
                    Ok(StepOutcome::Normal)
                }
                StmtKind::WithPolicy { overlay, body } => {
                    let overlay = self.eval_expr(overlay, scope).await?;
                    let scoped = self.ctx.active_policy().overlay(&overlay.to_json());
                    self.ctx.push_policy(scoped);
                    // Restored on every exit path: success, error, return,
                    // break.
                    let result = self.exec_block(body, scope).await;
                    self.ctx.pop_policy();
                    result
                }
                StmtKind::Retry {
                    attempts,
                    backoff_ms,
                    body,
                } => {
                    let attempts = (*attempts).max(1) as u64;
                    let backoff = Duration::from_millis((*backoff_ms).max(0) as u64);
                    let mut attempt = 0u64;
                    loop {
                        attempt += 1;
                        match self.exec_block(body, scope).await {
                            Ok(outcome) => return Ok(outcome),
                            // Budget exceedance terminates the run; it is
                            // not retryable.
                            Err(e @ VmError::Budget(_)) => return Err(e),
                            Err(e) => {
                                if attempt >= attempts {
                                    return Err(e);
                                }
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
                StmtKind::Timeout { ms, body } => {
                    let ms = (*ms).max(0) as u64;
                    tokio::select! {
                        result = self.exec_block(body, scope) => result,
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                            Err(VmError::Timeout(ms))
                        }
                    }
                }
                StmtKind::Guard { cond } => {
                    if self.eval_expr(cond, scope).await?.truthy() {
                        Ok(StepOutcome::Normal)
                    } else {
                        Err(VmError::GuardFailed(stmt.line))
                    }
                }
            }
        })
    }

    pub(crate) fn eval_expr<'a>(
        &'a self,
        expr: &'a Expr,
        scope: &'a Scope,
    ) -> LocalBoxFuture<'a, Result<Value, VmError>> {
        Box::pin(async move {
            match expr {
                Expr::Int(n) => Ok(Value::Int(*n)),
                Expr::Str(s) => Ok(Value::str(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Null => Ok(Value::Null),
                Expr::Var(name) => scope
                    .get(name)
                    .ok_or_else(|| VmError::Runtime(format!("undefined variable '{}'", name))),
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval_expr(item, scope).await?);
                    }
                    Ok(Value::array(out))
                }
                Expr::Object(entries) => {
                    let mut map = IndexMap::new();
                    for (key, value) in entries {
                        map.insert(key.clone(), self.eval_expr(value, scope).await?);
                    }
                    Ok(Value::object(map))
                }
                Expr::Not(inner) => {
                    let value = self.eval_expr(inner, scope).await?;
                    Ok(Value::Bool(!value.truthy()))
                }
                Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, scope).await,
                Expr::Member(target, field) => {
                    let target = self.eval_expr(target, scope).await?;
                    match target {
                        Value::Object(entries) => {
                            Ok(entries.borrow().get(field).cloned().unwrap_or(Value::Null))
                        }
                        // Member access on a non-object yields null.
                        _ => Ok(Value::Null),
                    }
                }
                Expr::Index(target, index) => {
                    let target = self.eval_expr(target, scope).await?;
                    let index = self.eval_expr(index, scope).await?;
                    Ok(match (&target, &index) {
                        (Value::Array(items), Value::Int(i)) => usize::try_from(*i)
                            .ok()
                            .and_then(|idx| items.borrow().get(idx).cloned())
                            .unwrap_or(Value::Null),
                        (Value::Object(entries), Value::Str(key)) => {
                            entries.borrow().get(key).cloned().unwrap_or(Value::Null)
                        }
                        (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
                            .ok()
                            .and_then(|idx| s.chars().nth(idx))
                            .map(|c| Value::str(c.to_string()))
                            .unwrap_or(Value::Null),
                        _ => Value::Null,
                    })
                }
                Expr::Call { callee, args } => {
                    if let Expr::Var(name) = callee.as_ref() {
                        if builtins::is_builtin(name) {
                            let mut values = Vec::with_capacity(args.len());
                            for arg in args {
                                values.push(self.eval_expr(arg, scope).await?);
                            }
                            return builtins::call_builtin(self, name, values).await;
                        }
                        let callee = scope.get(name).ok_or_else(|| {
                            VmError::Runtime(format!("undefined function '{}'", name))
                        })?;
                        let mut values = Vec::with_capacity(args.len());
                        for arg in args {
                            values.push(self.eval_expr(arg, scope).await?);
                        }
                        return self.call_value(callee, values).await;
                    }
                    let callee = self.eval_expr(callee, scope).await?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval_expr(arg, scope).await?);
                    }
                    self.call_value(callee, values).await
                }
                Expr::MethodCall {
                    target,
                    method,
                    args,
                } => {
                    let receiver = self.eval_expr(target, scope).await?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval_expr(arg, scope).await?);
                    }
                    match &receiver {
                        Value::Object(entries) => {
                            let member = entries.borrow().get(method).cloned();
                            match member {
                                Some(Value::Function(func)) => {
                                    self.call_function(func, values, Some(receiver.clone())).await
                                }
                                Some(other) => Err(VmError::Runtime(format!(
                                    "member '{}' is {} and not callable",
                                    method,
                                    other.type_name()
                                ))),
                                None => Err(VmError::Runtime(format!(
                                    "object has no method '{}'",
                                    method
                                ))),
                            }
                        }
                        other => Err(VmError::Runtime(format!(
                            "cannot call method '{}' on {}",
                            method,
                            other.type_name()
                        ))),
                    }
                }
            }
        })
    }

    async fn eval_binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        scope: &Scope,
    ) -> Result<Value, VmError> {
        // and/or short-circuit and yield the deciding operand.
        match op {
            BinOp::And => {
                let left = self.eval_expr(lhs, scope).await?;
                if !left.truthy() {
                    return Ok(left);
                }
                return self.eval_expr(rhs, scope).await;
            }
            BinOp::Or => {
                let left = self.eval_expr(lhs, scope).await?;
                if left.truthy() {
                    return Ok(left);
                }
                return self.eval_expr(rhs, scope).await;
            }
            _ => {}
        }

        let left = self.eval_expr(lhs, scope).await?;
        let right = self.eval_expr(rhs, scope).await?;
        match op {
            BinOp::Add => match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    Ok(Value::str(format!("{}{}", left, right)))
                }
                (Value::Array(a), Value::Array(b)) => {
                    let mut items = a.borrow().clone();
                    items.extend(b.borrow().iter().cloned());
                    Ok(Value::array(items))
                }
                _ => Err(VmError::Runtime(format!(
                    "cannot add {} and {}",
                    left.type_name(),
                    right.type_name()
                ))),
            },
            BinOp::Eq => Ok(Value::Bool(left.equals(&right))),
            BinOp::NotEq => Ok(Value::Bool(!left.equals(&right))),
            BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
                let ordering = match (&left, &right) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    _ => {
                        return Err(VmError::Runtime(format!(
                            "cannot compare {} and {}",
                            left.type_name(),
                            right.type_name()
                        )))
                    }
                };
                let result = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::LtEq => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::In => match (&left, &right) {
                (Value::Str(needle), Value::Str(haystack)) => {
                    Ok(Value::Bool(haystack.contains(needle.as_str())))
                }
                (needle, Value::Array(items)) => {
                    Ok(Value::Bool(items.borrow().iter().any(|v| v.equals(needle))))
                }
                (Value::Str(key), Value::Object(entries)) => {
                    Ok(Value::Bool(entries.borrow().contains_key(key)))
                }
                _ => Err(VmError::Runtime(format!(
                    "'in' cannot test {} membership in {}",
                    left.type_name(),
                    right.type_name()
                ))),
            },
            BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
        }
    }

    /// Call any callable value: user function, class constructor, or an
    /// LLM client (one request, returns the Plan).
    pub(crate) async fn call_value(&self, callee: Value, args: Vec<Value>) -> Result<Value, VmError> {
        match callee {
            Value::Function(func) => self.call_function(func, args, None).await,
            Value::Class(class) => self.instantiate(class, args).await,
            Value::LlmClient(client) => builtins::call_client(self, &client, args).await,
            other => Err(VmError::Runtime(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn call_function<'a>(
        &'a self,
        func: Rc<FunctionDef>,
        args: Vec<Value>,
        self_value: Option<Value>,
    ) -> LocalBoxFuture<'a, Result<Value, VmError>> {
        Box::pin(async move {
            let mut locals = HashMap::new();
            for (i, param) in func.params.iter().enumerate() {
                locals.insert(
                    param.clone(),
                    args.get(i).cloned().unwrap_or(Value::Null),
                );
            }
            if let Some(receiver) = self_value {
                locals.insert("self".to_string(), receiver);
            }
            let scope = Scope::top(self.globals.clone()).frame(locals);
            match self.exec_block(&func.body, &scope).await? {
                StepOutcome::Return(value) => Ok(value),
                StepOutcome::Normal => Ok(Value::Null),
                StepOutcome::Break => Err(VmError::Runtime(format!(
                    "break outside of a loop in function '{}'",
                    func.name
                ))),
            }
        })
    }

    /// Construct a class instance: defs become methods, assignments
    /// become fields, then `init` runs with the constructor arguments.
    async fn instantiate(&self, class: Rc<ClassDef>, args: Vec<Value>) -> Result<Value, VmError> {
        let instance = Value::object(IndexMap::new());
        let mut locals = HashMap::new();
        locals.insert("self".to_string(), instance.clone());
        let scope = Scope::top(self.globals.clone()).frame(locals);

        for stmt in &class.body {
            match &stmt.kind {
                StmtKind::FuncDef { name, params, body } => {
                    if let Value::Object(entries) = &instance {
                        entries.borrow_mut().insert(
                            name.clone(),
                            Value::Function(Rc::new(FunctionDef {
                                name: format!("{}.{}", class.name, name),
                                params: params.clone(),
                                body: body.clone(),
                            })),
                        );
                    }
                }
                StmtKind::Assign { name, value } => {
                    let value = self.eval_expr(value, &scope).await?;
                    if let Value::Object(entries) = &instance {
                        entries.borrow_mut().insert(name.clone(), value);
                    }
                }
                other => {
                    return Err(VmError::Runtime(format!(
                        "class '{}' body may contain only defs and assignments, found {}",
                        class.name,
                        other.node_name()
                    )))
                }
            }
        }

        let init = match &instance {
            Value::Object(entries) => entries.borrow().get("init").cloned(),
            _ => None,
        };
        if let Some(Value::Function(init)) = init {
            self.call_function(init, args, Some(instance.clone())).await?;
        }
        Ok(instance)
    }
}
