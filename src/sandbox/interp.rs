//! Async tree-walking evaluator.
//!
//! Each guest function call gets a frame that sees its own locals plus
//! module globals. Every tool call, `asyncio.sleep`, and a periodic
//! instruction-budget yield are tokio suspension points, so a run can be
//! timed out and cancelled cooperatively even when the guest program
//! never awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as Json;

use super::lexer;
use super::modules;
use super::parser::{
    self, AssignTarget, BinOp, BoolOp, CmpOp, ExceptHandler, Expr, FsPart, FunctionDef, Literal,
    Program, Stmt, UnaryOp,
};
use super::value::Value;
use super::SandboxError;

/// Upper bound for materialised `range()` calls.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Ops executed between cooperative yields.
const YIELD_EVERY: u64 = 512;

/// Host hook the interpreter calls tools through.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    /// Invoke `<toolbox>.<name>` with keyword arguments.
    async fn call_tool(
        &self,
        toolbox: &str,
        name: &str,
        kwargs: Vec<(String, Json)>,
    ) -> Result<Json, SandboxError>;

    /// Whether `<toolbox>.<name>` exists.
    fn has_tool(&self, toolbox: &str, name: &str) -> bool;
}

/// Everything a finished run hands back to the executor.
#[derive(Debug)]
pub struct RunOutput {
    /// The entry function's return value.
    pub result: Value,
    /// The entry function's local bindings at return.
    pub locals: BTreeMap<String, Value>,
    /// Text produced by `print`.
    pub stdout: String,
}

/// Execute `source`, calling the async entry function after the module
/// body runs. `namespace` seeds module globals (toolboxes, context_vars,
/// pre-imported modules).
pub async fn run_program(
    source: &str,
    namespace: HashMap<String, Value>,
    allowed_modules: &[String],
    tools: Option<Arc<dyn ToolCaller>>,
    entry: &str,
) -> Result<RunOutput, SandboxError> {
    let program: Program = parser::parse_program(source)?;
    let entry_fn = program
        .find_async_function(entry)
        .ok_or(SandboxError::MissingMain)?;

    let mut interp = Interpreter {
        frames: vec![namespace],
        allowed_modules: allowed_modules.to_vec(),
        tools,
        stdout: String::new(),
        rng: modules::seed_rng(),
        started: Instant::now(),
        ops: 0,
    };

    // Module body: imports, helper defs, module-level constants.
    match interp.exec_block(&program.body).await? {
        ExecOutcome::Normal => {}
        ExecOutcome::Return(_) => {
            return Err(SandboxError::Syntax("'return' outside function".into()))
        }
        ExecOutcome::Break | ExecOutcome::Continue => {
            return Err(SandboxError::Syntax("loop control outside loop".into()))
        }
    }

    let (result, locals) = interp.call_entry(&entry_fn).await?;
    Ok(RunOutput {
        result,
        locals,
        stdout: interp.stdout,
    })
}

/// Result of executing a statement block.
enum ExecOutcome {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Interpreter {
    /// Frame 0 is module globals; the last frame is the active scope.
    frames: Vec<HashMap<String, Value>>,
    allowed_modules: Vec<String>,
    tools: Option<Arc<dyn ToolCaller>>,
    stdout: String,
    rng: u64,
    started: Instant,
    ops: u64,
}

impl Interpreter {
    // --- bookkeeping ---

    async fn tick(&mut self) {
        self.ops += 1;
        if self.ops % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, SandboxError> {
        if let Some(frame) = self.frames.last() {
            if let Some(value) = frame.get(name) {
                return Ok(value.clone());
            }
        }
        if self.frames.len() > 1 {
            if let Some(value) = self.frames[0].get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(&builtin) = BUILTIN_NAMES.iter().find(|&&b| b == name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(SandboxError::Runtime(format!(
            "NameError: name '{name}' is not defined"
        )))
    }

    fn bind(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    // --- statements ---

    fn exec_block<'a>(
        &'a mut self,
        stmts: &'a [Stmt],
    ) -> BoxFuture<'a, Result<ExecOutcome, SandboxError>> {
        Box::pin(async move {
            for stmt in stmts {
                match self.exec_stmt(stmt).await? {
                    ExecOutcome::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(ExecOutcome::Normal)
        })
    }

    fn exec_stmt<'a>(
        &'a mut self,
        stmt: &'a Stmt,
    ) -> BoxFuture<'a, Result<ExecOutcome, SandboxError>> {
        Box::pin(async move {
            self.tick().await;
            match stmt {
                Stmt::Import { module, alias } => {
                    self.import_module(module)?;
                    let binding = alias.as_deref().unwrap_or(module);
                    self.bind(binding, Value::Module(module.clone()));
                    Ok(ExecOutcome::Normal)
                }
                Stmt::FromImport { module, names } => {
                    self.import_module(module)?;
                    for (name, alias) in names {
                        let value = modules::module_attr(module, name)?;
                        self.bind(alias.as_deref().unwrap_or(name), value);
                    }
                    Ok(ExecOutcome::Normal)
                }
                Stmt::FunctionDef(def) => {
                    self.bind(&def.name, Value::Function(Arc::clone(def)));
                    Ok(ExecOutcome::Normal)
                }
                Stmt::Assign { target, value } => {
                    let value = self.eval(value).await?;
                    self.assign(target, value).await?;
                    Ok(ExecOutcome::Normal)
                }
                Stmt::AugAssign { target, op, value } => {
                    let current = match target {
                        AssignTarget::Name(name) => self.lookup(name)?,
                        AssignTarget::Index { obj, index } => {
                            let obj = self.eval(obj).await?;
                            let index = self.eval(index).await?;
                            index_value(&obj, &index)?
                        }
                        AssignTarget::Tuple(_) => {
                            return Err(SandboxError::Syntax(
                                "augmented assignment to tuple".into(),
                            ))
                        }
                    };
                    let rhs = self.eval(value).await?;
                    let updated = binary_op(*op, &current, &rhs)?;
                    self.assign(target, updated).await?;
                    Ok(ExecOutcome::Normal)
                }
                Stmt::ExprStmt(expr) => {
                    self.eval(expr).await?;
                    Ok(ExecOutcome::Normal)
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::None,
                    };
                    Ok(ExecOutcome::Return(value))
                }
                Stmt::If { branches, orelse } => {
                    for (condition, body) in branches {
                        if self.eval(condition).await?.is_truthy() {
                            return self.exec_block(body).await;
                        }
                    }
                    self.exec_block(orelse).await
                }
                Stmt::For { target, iter, body } => {
                    let iterable = self.eval(iter).await?;
                    for item in iterate(&iterable)? {
                        self.assign(target, item).await?;
                        match self.exec_block(body).await? {
                            ExecOutcome::Normal | ExecOutcome::Continue => {}
                            ExecOutcome::Break => break,
                            outcome @ ExecOutcome::Return(_) => return Ok(outcome),
                        }
                    }
                    Ok(ExecOutcome::Normal)
                }
                Stmt::While { condition, body } => {
                    while self.eval(condition).await?.is_truthy() {
                        match self.exec_block(body).await? {
                            ExecOutcome::Normal | ExecOutcome::Continue => {}
                            ExecOutcome::Break => break,
                            outcome @ ExecOutcome::Return(_) => return Ok(outcome),
                        }
                    }
                    Ok(ExecOutcome::Normal)
                }
                Stmt::Try {
                    body,
                    handlers,
                    finally,
                } => self.exec_try(body, handlers, finally).await,
                Stmt::Raise(expr) => {
                    let message = match expr {
                        None => "RuntimeError: exception re-raised".to_string(),
                        Some(Expr::Call { func, args, .. }) => {
                            let class = match &**func {
                                Expr::Name(name) => name.clone(),
                                _ => "Exception".to_string(),
                            };
                            let mut rendered = Vec::new();
                            for arg in args {
                                rendered.push(self.eval(arg).await?.display());
                            }
                            format!("{class}: {}", rendered.join(", "))
                        }
                        Some(expr) => self.eval(expr).await?.display(),
                    };
                    Err(SandboxError::Runtime(message))
                }
                Stmt::Break => Ok(ExecOutcome::Break),
                Stmt::Continue => Ok(ExecOutcome::Continue),
                Stmt::Pass => Ok(ExecOutcome::Normal),
            }
        })
    }

    fn import_module(&self, module: &str) -> Result<(), SandboxError> {
        if self.allowed_modules.iter().any(|m| m == module) {
            Ok(())
        } else {
            Err(SandboxError::ImportDenied(module.to_string()))
        }
    }

    async fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        finally: &[Stmt],
    ) -> Result<ExecOutcome, SandboxError> {
        let outcome = match self.exec_block(body).await {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.is_catchable() => {
                let (class, message) = split_exception(&error);
                match handlers.iter().find(|h| handler_matches(h, &class)) {
                    Some(handler) => {
                        if let Some(binding) = &handler.binding {
                            self.bind(binding, Value::Str(message.clone()));
                        }
                        self.exec_block(&handler.body).await
                    }
                    // No clause names this class: the error keeps going.
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        };
        if !finally.is_empty() {
            match self.exec_block(finally).await? {
                ExecOutcome::Normal => {}
                // A finally block that returns/breaks wins.
                other => return Ok(other),
            }
        }
        outcome
    }

    fn assign<'a>(
        &'a mut self,
        target: &'a AssignTarget,
        value: Value,
    ) -> BoxFuture<'a, Result<(), SandboxError>> {
        Box::pin(async move {
            match target {
                AssignTarget::Name(name) => {
                    self.bind(name, value);
                    Ok(())
                }
                AssignTarget::Tuple(targets) => {
                    let items = iterate(&value)?;
                    if items.len() != targets.len() {
                        return Err(SandboxError::Runtime(format!(
                            "ValueError: cannot unpack {} values into {} targets",
                            items.len(),
                            targets.len()
                        )));
                    }
                    for (target, item) in targets.iter().zip(items) {
                        self.assign(target, item).await?;
                    }
                    Ok(())
                }
                AssignTarget::Index { obj, index } => {
                    let obj = self.eval(obj).await?;
                    let index = self.eval(index).await?;
                    set_index(&obj, &index, value)
                }
            }
        })
    }

    // --- function calls ---

    /// Call the entry function, keeping its frame for locals capture.
    async fn call_entry(
        &mut self,
        def: &Arc<FunctionDef>,
    ) -> Result<(Value, BTreeMap<String, Value>), SandboxError> {
        self.frames.push(HashMap::new());
        let outcome = self.exec_block(&def.body).await;
        let frame = self.frames.pop().unwrap_or_default();
        let result = match outcome? {
            ExecOutcome::Return(value) => value,
            ExecOutcome::Normal => Value::None,
            _ => {
                return Err(SandboxError::Syntax(
                    "loop control outside loop".into(),
                ))
            }
        };
        let locals = frame.into_iter().collect();
        Ok((result, locals))
    }

    async fn call_function(
        &mut self,
        def: Arc<FunctionDef>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, SandboxError> {
        let mut frame = HashMap::new();
        if args.len() > def.params.len() {
            return Err(SandboxError::Runtime(format!(
                "TypeError: {}() takes {} arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        let mut args = args.into_iter();
        for param in &def.params {
            if let Some(value) = args.next() {
                frame.insert(param.name.clone(), value);
            }
        }
        for (name, value) in kwargs {
            if !def.params.iter().any(|p| p.name == name) {
                return Err(SandboxError::Runtime(format!(
                    "TypeError: {}() got an unexpected keyword argument '{name}'",
                    def.name
                )));
            }
            frame.insert(name, value);
        }
        // Defaults for anything still unbound.
        let unbound: Vec<FunctionParamDefault> = def
            .params
            .iter()
            .filter(|p| !frame.contains_key(&p.name))
            .map(|p| FunctionParamDefault {
                name: p.name.clone(),
                default: p.default.clone(),
            })
            .collect();
        for param in unbound {
            match param.default {
                Some(default) => {
                    let value = self.eval(&default).await?;
                    frame.insert(param.name, value);
                }
                None => {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: {}() missing required argument '{}'",
                        def.name, param.name
                    )))
                }
            }
        }

        self.frames.push(frame);
        let outcome = self.exec_block(&def.body).await;
        self.frames.pop();
        match outcome? {
            ExecOutcome::Return(value) => Ok(value),
            ExecOutcome::Normal => Ok(Value::None),
            _ => Err(SandboxError::Syntax("loop control outside loop".into())),
        }
    }

    // --- expressions ---

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value, SandboxError>> {
        Box::pin(async move {
            self.tick().await;
            match expr {
                Expr::Literal(literal) => Ok(match literal {
                    Literal::None => Value::None,
                    Literal::Bool(b) => Value::Bool(*b),
                    Literal::Int(i) => Value::Int(*i),
                    Literal::Float(f) => Value::Float(*f),
                    Literal::Str(s) => Value::Str(s.clone()),
                }),
                Expr::Name(name) => self.lookup(name),
                Expr::FString(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            FsPart::Lit(text) => out.push_str(text),
                            FsPart::Expr { expr, spec } => {
                                let value = self.eval(expr).await?;
                                out.push_str(&apply_format_spec(&value, spec.as_deref()));
                            }
                        }
                    }
                    Ok(Value::Str(out))
                }
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    Ok(Value::list(out))
                }
                Expr::Tuple(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    Ok(Value::Tuple(Arc::new(out)))
                }
                Expr::Dict(entries) => {
                    let mut out = Vec::with_capacity(entries.len());
                    for (key, value) in entries {
                        let key = self.eval(key).await?;
                        let value = self.eval(value).await?;
                        out.push((dict_key(&key), value));
                    }
                    Ok(Value::dict(out))
                }
                Expr::Attr { obj, name } => {
                    let obj = self.eval(obj).await?;
                    self.attr(&obj, name)
                }
                Expr::Index { obj, index } => {
                    let obj = self.eval(obj).await?;
                    let index = self.eval(index).await?;
                    index_value(&obj, &index)
                }
                Expr::Slice { obj, lower, upper } => {
                    let obj = self.eval(obj).await?;
                    let lower = match lower {
                        Some(expr) => Some(self.eval(expr).await?),
                        None => None,
                    };
                    let upper = match upper {
                        Some(expr) => Some(self.eval(expr).await?),
                        None => None,
                    };
                    slice_value(&obj, lower.as_ref(), upper.as_ref())
                }
                Expr::Call { func, args, kwargs } => {
                    self.eval_call(func, args, kwargs, false).await
                }
                Expr::Await(inner) => match &**inner {
                    Expr::Call { func, args, kwargs } => {
                        self.eval_call(func, args, kwargs, true).await
                    }
                    _ => Err(SandboxError::Runtime(
                        "TypeError: object is not awaitable".into(),
                    )),
                },
                Expr::Unary { op, operand } => {
                    let value = self.eval(operand).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                        UnaryOp::Neg => match value {
                            Value::Int(i) => Ok(Value::Int(-i)),
                            Value::Float(f) => Ok(Value::Float(-f)),
                            other => Err(SandboxError::Runtime(format!(
                                "TypeError: bad operand type for unary -: '{}'",
                                other.type_name()
                            ))),
                        },
                    }
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    binary_op(*op, &left, &right)
                }
                Expr::BoolChain { op, values } => {
                    let mut last = Value::None;
                    for value in values {
                        last = self.eval(value).await?;
                        match op {
                            BoolOp::And if !last.is_truthy() => return Ok(last),
                            BoolOp::Or if last.is_truthy() => return Ok(last),
                            _ => {}
                        }
                    }
                    Ok(last)
                }
                Expr::Compare { left, rest } => {
                    let mut current = self.eval(left).await?;
                    for (op, right) in rest {
                        let right = self.eval(right).await?;
                        if !compare(*op, &current, &right)? {
                            return Ok(Value::Bool(false));
                        }
                        current = right;
                    }
                    Ok(Value::Bool(true))
                }
                Expr::Ternary {
                    condition,
                    then,
                    orelse,
                } => {
                    if self.eval(condition).await?.is_truthy() {
                        self.eval(then).await
                    } else {
                        self.eval(orelse).await
                    }
                }
                Expr::ListComp {
                    element,
                    target,
                    iter,
                    condition,
                } => {
                    let iterable = self.eval(iter).await?;
                    let mut out = Vec::new();
                    for item in iterate(&iterable)? {
                        self.assign(target, item).await?;
                        if let Some(condition) = condition {
                            if !self.eval(condition).await?.is_truthy() {
                                continue;
                            }
                        }
                        out.push(self.eval(element).await?);
                    }
                    Ok(Value::list(out))
                }
            }
        })
    }

    fn attr(&self, obj: &Value, name: &str) -> Result<Value, SandboxError> {
        match obj {
            Value::Module(module) => modules::module_attr(module, name),
            Value::ModuleFn { module, path } => {
                modules::module_attr(module, &format!("{path}.{name}"))
            }
            Value::Toolbox(toolbox) => {
                let known = self
                    .tools
                    .as_ref()
                    .map(|t| t.has_tool(toolbox, name))
                    .unwrap_or(false);
                if known {
                    Ok(Value::ToolFn {
                        toolbox: toolbox.clone(),
                        name: name.to_string(),
                    })
                } else {
                    Err(SandboxError::Runtime(format!(
                        "AttributeError: toolbox '{toolbox}' has no tool '{name}'"
                    )))
                }
            }
            Value::Str(_) | Value::List(_) | Value::Dict(_) => Ok(Value::BoundMethod {
                receiver: Box::new(obj.clone()),
                method: name.to_string(),
            }),
            other => Err(SandboxError::Runtime(format!(
                "AttributeError: '{}' object has no attribute '{name}'",
                other.type_name()
            ))),
        }
    }

    async fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        awaited: bool,
    ) -> Result<Value, SandboxError> {
        let callee = self.eval(func).await?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval(arg).await?);
        }
        let mut kwarg_values = Vec::with_capacity(kwargs.len());
        for (name, expr) in kwargs {
            kwarg_values.push((name.clone(), self.eval(expr).await?));
        }

        match callee {
            Value::Function(def) => {
                if def.is_async && !awaited {
                    return Err(SandboxError::NotAwaited(format!(
                        "coroutine '{}' was never awaited",
                        def.name
                    )));
                }
                if !def.is_async && awaited {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: function '{}' is not awaitable",
                        def.name
                    )));
                }
                self.call_function(def, arg_values, kwarg_values).await
            }
            Value::ToolFn { toolbox, name } => {
                if !awaited {
                    return Err(SandboxError::NotAwaited(format!(
                        "tool call {toolbox}.{name}() must be awaited"
                    )));
                }
                if !arg_values.is_empty() {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: tool {toolbox}.{name}() accepts keyword arguments only"
                    )));
                }
                let tools = self.tools.clone().ok_or_else(|| {
                    SandboxError::Runtime("no tools available in this sandbox".into())
                })?;
                let kwargs_json: Vec<(String, Json)> = kwarg_values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                let result = tools.call_tool(&toolbox, &name, kwargs_json).await?;
                Ok(Value::from_json(&result))
            }
            Value::ModuleFn { module, path } => {
                let requires_await = modules::is_async_module_fn(&module, &path);
                if requires_await && !awaited {
                    return Err(SandboxError::NotAwaited(format!(
                        "coroutine '{module}.{path}' was never awaited"
                    )));
                }
                if !requires_await && awaited {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: '{module}.{path}' is not awaitable"
                    )));
                }
                modules::call_module_fn(&module, &path, arg_values, &mut self.rng, self.started)
                    .await
            }
            Value::Builtin(name) => {
                if awaited {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: built-in '{name}' is not awaitable"
                    )));
                }
                self.call_builtin(name, arg_values, kwarg_values)
            }
            Value::BoundMethod { receiver, method } => {
                if awaited {
                    return Err(SandboxError::Runtime(format!(
                        "TypeError: method '{method}' is not awaitable"
                    )));
                }
                call_method(&receiver, &method, arg_values)
            }
            other => Err(SandboxError::Runtime(format!(
                "TypeError: '{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, SandboxError> {
        let arity = |expected: &str| {
            SandboxError::Runtime(format!(
                "TypeError: {name}() expects {expected} argument(s), got {}",
                args.len()
            ))
        };
        match name {
            "print" => {
                let sep = kwargs
                    .iter()
                    .find(|(k, _)| k == "sep")
                    .map(|(_, v)| v.display())
                    .unwrap_or_else(|| " ".to_string());
                let end = kwargs
                    .iter()
                    .find(|(k, _)| k == "end")
                    .map(|(_, v)| v.display())
                    .unwrap_or_else(|| "\n".to_string());
                let line = args
                    .iter()
                    .map(|v| v.display())
                    .collect::<Vec<_>>()
                    .join(&sep);
                log::debug!("sandbox print: {line}");
                self.stdout.push_str(&line);
                self.stdout.push_str(&end);
                Ok(Value::None)
            }
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [Value::List(items)] => Ok(Value::Int(items.lock().len() as i64)),
                [Value::Tuple(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::Dict(entries)] => Ok(Value::Int(entries.lock().len() as i64)),
                [other] => Err(SandboxError::Runtime(format!(
                    "TypeError: object of type '{}' has no len()",
                    other.type_name()
                ))),
                _ => Err(arity("1")),
            },
            "str" => match args.as_slice() {
                [] => Ok(Value::Str(String::new())),
                [value] => Ok(Value::Str(value.display())),
                _ => Err(arity("at most 1")),
            },
            "repr" => match args.as_slice() {
                [value] => Ok(Value::Str(value.repr())),
                _ => Err(arity("1")),
            },
            "int" => match args.as_slice() {
                [Value::Int(i)] => Ok(Value::Int(*i)),
                [Value::Float(f)] => Ok(Value::Int(*f as i64)),
                [Value::Bool(b)] => Ok(Value::Int(*b as i64)),
                [Value::Str(s)] => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    SandboxError::Runtime(format!(
                        "ValueError: invalid literal for int(): '{s}'"
                    ))
                }),
                _ => Err(arity("1")),
            },
            "float" => match args.as_slice() {
                [value] => match value.as_number() {
                    Some(f) => Ok(Value::Float(f)),
                    None => match value {
                        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                            SandboxError::Runtime(format!(
                                "ValueError: could not convert string to float: '{s}'"
                            ))
                        }),
                        other => Err(SandboxError::Runtime(format!(
                            "TypeError: float() argument must be a number or string, not '{}'",
                            other.type_name()
                        ))),
                    },
                },
                _ => Err(arity("1")),
            },
            "bool" => match args.as_slice() {
                [value] => Ok(Value::Bool(value.is_truthy())),
                _ => Err(arity("1")),
            },
            "abs" => match args.as_slice() {
                [Value::Int(i)] => Ok(Value::Int(i.abs())),
                [Value::Float(f)] => Ok(Value::Float(f.abs())),
                _ => Err(arity("1 numeric")),
            },
            "round" => match args.as_slice() {
                [value] => {
                    let x = value.as_number().ok_or_else(|| arity("numeric"))?;
                    Ok(Value::Int(x.round() as i64))
                }
                [value, Value::Int(digits)] => {
                    let x = value.as_number().ok_or_else(|| arity("numeric"))?;
                    let factor = 10f64.powi(*digits as i32);
                    Ok(Value::Float((x * factor).round() / factor))
                }
                _ => Err(arity("1 or 2")),
            },
            "min" | "max" => {
                let items = match args.as_slice() {
                    [] => return Err(arity("at least 1")),
                    [single] => iterate(single)?,
                    many => many.to_vec(),
                };
                if items.is_empty() {
                    return Err(SandboxError::Runtime(format!(
                        "ValueError: {name}() arg is an empty sequence"
                    )));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ordering = item.py_cmp(&best).ok_or_else(|| {
                        SandboxError::Runtime("TypeError: values are not comparable".into())
                    })?;
                    let better = if name == "min" {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    };
                    if better {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "sum" => {
                let (items, start) = match args.as_slice() {
                    [iterable] => (iterate(iterable)?, Value::Int(0)),
                    [iterable, start] => (iterate(iterable)?, start.clone()),
                    _ => return Err(arity("1 or 2")),
                };
                let mut acc = start;
                for item in items {
                    acc = binary_op(BinOp::Add, &acc, &item)?;
                }
                Ok(acc)
            }
            "range" => {
                let (start, stop, step) = match args.as_slice() {
                    [Value::Int(stop)] => (0, *stop, 1),
                    [Value::Int(start), Value::Int(stop)] => (*start, *stop, 1),
                    [Value::Int(start), Value::Int(stop), Value::Int(step)] => {
                        (*start, *stop, *step)
                    }
                    _ => return Err(arity("1 to 3 int")),
                };
                if step == 0 {
                    return Err(SandboxError::Runtime(
                        "ValueError: range() arg 3 must not be zero".into(),
                    ));
                }
                let len = if step > 0 {
                    (stop - start).max(0) / step + i64::from((stop - start).max(0) % step != 0)
                } else {
                    (start - stop).max(0) / (-step)
                        + i64::from((start - stop).max(0) % (-step) != 0)
                };
                if len > MAX_RANGE_LEN {
                    return Err(SandboxError::Runtime(format!(
                        "OverflowError: range of {len} elements exceeds the sandbox limit"
                    )));
                }
                let mut out = Vec::with_capacity(len as usize);
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    out.push(Value::Int(i));
                    i += step;
                }
                Ok(Value::list(out))
            }
            "sorted" => match args.as_slice() {
                [iterable] => {
                    let mut items = iterate(iterable)?;
                    let mut failure = None;
                    items.sort_by(|a, b| {
                        a.py_cmp(b).unwrap_or_else(|| {
                            failure = Some(());
                            std::cmp::Ordering::Equal
                        })
                    });
                    if failure.is_some() {
                        return Err(SandboxError::Runtime(
                            "TypeError: values are not comparable".into(),
                        ));
                    }
                    Ok(Value::list(items))
                }
                _ => Err(arity("1")),
            },
            "enumerate" => {
                let (items, start) = match args.as_slice() {
                    [iterable] => (iterate(iterable)?, 0),
                    [iterable, Value::Int(start)] => (iterate(iterable)?, *start),
                    _ => return Err(arity("1 or 2")),
                };
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| {
                            Value::Tuple(Arc::new(vec![Value::Int(start + i as i64), item]))
                        })
                        .collect(),
                ))
            }
            "zip" => {
                let mut columns = Vec::new();
                for arg in &args {
                    columns.push(iterate(arg)?);
                }
                let shortest = columns.iter().map(|c| c.len()).min().unwrap_or(0);
                let mut out = Vec::with_capacity(shortest);
                for i in 0..shortest {
                    out.push(Value::Tuple(Arc::new(
                        columns.iter().map(|c| c[i].clone()).collect(),
                    )));
                }
                Ok(Value::list(out))
            }
            "isinstance" => match args.as_slice() {
                [value, class] => {
                    let matches_class = |class: &Value| match class {
                        Value::Builtin(type_name) => match *type_name {
                            "str" => matches!(value, Value::Str(_)),
                            "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
                            "float" => matches!(value, Value::Float(_)),
                            "bool" => matches!(value, Value::Bool(_)),
                            "list" => matches!(value, Value::List(_)),
                            "dict" => matches!(value, Value::Dict(_)),
                            _ => false,
                        },
                        _ => false,
                    };
                    let result = match class {
                        Value::Tuple(classes) => classes.iter().any(matches_class),
                        single => matches_class(single),
                    };
                    Ok(Value::Bool(result))
                }
                _ => Err(arity("2")),
            },
            "list" => match args.as_slice() {
                [] => Ok(Value::list(Vec::new())),
                [iterable] => Ok(Value::list(iterate(iterable)?)),
                _ => Err(arity("at most 1")),
            },
            "dict" => match args.as_slice() {
                [] => {
                    let entries = kwargs
                        .into_iter()
                        .map(|(k, v)| (k, v))
                        .collect::<Vec<_>>();
                    Ok(Value::dict(entries))
                }
                [Value::Dict(entries)] => Ok(Value::dict(entries.lock().clone())),
                _ => Err(arity("0 or 1")),
            },
            "tuple" => match args.as_slice() {
                [] => Ok(Value::Tuple(Arc::new(Vec::new()))),
                [iterable] => Ok(Value::Tuple(Arc::new(iterate(iterable)?))),
                _ => Err(arity("at most 1")),
            },
            "type" => match args.as_slice() {
                [value] => Ok(Value::Str(value.type_name().to_string())),
                _ => Err(arity("1")),
            },
            other => Err(SandboxError::Runtime(format!(
                "NameError: built-in '{other}' is not available"
            ))),
        }
    }
}

struct FunctionParamDefault {
    name: String,
    default: Option<Expr>,
}

/// Names resolvable as built-in functions.
const BUILTIN_NAMES: &[&str] = &[
    "print",
    "len",
    "str",
    "repr",
    "int",
    "float",
    "bool",
    "abs",
    "round",
    "min",
    "max",
    "sum",
    "range",
    "sorted",
    "enumerate",
    "zip",
    "isinstance",
    "list",
    "dict",
    "tuple",
    "type",
];

// ---------------------------------------------------------------------------
// Free helpers over values
// ---------------------------------------------------------------------------

/// Dict keys are coerced to their string rendering.
fn dict_key(key: &Value) -> String {
    key.display()
}

/// Split a raised error into its exception class and bare message.
///
/// Catchable errors follow the `"ClassName: message"` convention
/// (`raise ValueError("x")`, the module shims, `NotAwaited`, denied
/// imports). Anything that doesn't lead with a class-shaped token reads
/// as a plain `Exception`.
fn split_exception(error: &SandboxError) -> (String, String) {
    let rendered = error.to_string();
    if let Some((class, message)) = rendered.split_once(": ") {
        let class_shaped = !class.is_empty()
            && class.chars().next().map(char::is_uppercase).unwrap_or(false)
            && class.chars().all(|c| c.is_alphanumeric() || c == '_');
        if class_shaped {
            return (class.to_string(), message.to_string());
        }
    }
    ("Exception".to_string(), rendered)
}

/// Whether an `except` clause catches the given exception class.
///
/// A bare `except`, `except Exception`, and `except BaseException` catch
/// everything; any other clause matches its class name textually.
fn handler_matches(handler: &ExceptHandler, class: &str) -> bool {
    match handler.class.as_deref() {
        None | Some("Exception") | Some("BaseException") => true,
        Some(named) => named == class,
    }
}

fn iterate(value: &Value) -> Result<Vec<Value>, SandboxError> {
    match value {
        Value::List(items) => Ok(items.lock().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(entries) => Ok(entries
            .lock()
            .iter()
            .map(|(k, _)| Value::Str(k.clone()))
            .collect()),
        other => Err(SandboxError::Runtime(format!(
            "TypeError: '{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Result<usize, SandboxError> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        return Err(SandboxError::Runtime(format!(
            "IndexError: index {index} out of range"
        )));
    }
    Ok(adjusted as usize)
}

fn index_value(obj: &Value, index: &Value) -> Result<Value, SandboxError> {
    match (obj, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.lock();
            let i = normalize_index(*i, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Tuple(items), Value::Int(i)) => {
            let i = normalize_index(*i, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[i].to_string()))
        }
        (Value::Dict(entries), key) => {
            let key = dict_key(key);
            entries
                .lock()
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| SandboxError::Runtime(format!("KeyError: '{key}'")))
        }
        (other, _) => Err(SandboxError::Runtime(format!(
            "TypeError: '{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn set_index(obj: &Value, index: &Value, value: Value) -> Result<(), SandboxError> {
    match (obj, index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.lock();
            let i = normalize_index(*i, items.len())?;
            items[i] = value;
            Ok(())
        }
        (Value::Dict(entries), key) => {
            let key = dict_key(key);
            let mut entries = entries.lock();
            if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
            } else {
                entries.push((key, value));
            }
            Ok(())
        }
        (other, _) => Err(SandboxError::Runtime(format!(
            "TypeError: '{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bounds(
    len: usize,
    lower: Option<&Value>,
    upper: Option<&Value>,
) -> Result<(usize, usize), SandboxError> {
    let clamp = |raw: i64| -> usize {
        let len = len as i64;
        let adjusted = if raw < 0 { raw + len } else { raw };
        adjusted.clamp(0, len) as usize
    };
    let int_of = |value: &Value| match value {
        Value::Int(i) => Ok(*i),
        other => Err(SandboxError::Runtime(format!(
            "TypeError: slice indices must be integers, not '{}'",
            other.type_name()
        ))),
    };
    let start = match lower {
        Some(value) => clamp(int_of(value)?),
        None => 0,
    };
    let stop = match upper {
        Some(value) => clamp(int_of(value)?),
        None => len,
    };
    Ok((start, stop.max(start)))
}

fn slice_value(
    obj: &Value,
    lower: Option<&Value>,
    upper: Option<&Value>,
) -> Result<Value, SandboxError> {
    match obj {
        Value::List(items) => {
            let items = items.lock();
            let (start, stop) = slice_bounds(items.len(), lower, upper)?;
            Ok(Value::list(items[start..stop].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, stop) = slice_bounds(chars.len(), lower, upper)?;
            Ok(Value::Str(chars[start..stop].iter().collect()))
        }
        Value::Tuple(items) => {
            let (start, stop) = slice_bounds(items.len(), lower, upper)?;
            Ok(Value::Tuple(Arc::new(items[start..stop].to_vec())))
        }
        other => Err(SandboxError::Runtime(format!(
            "TypeError: '{}' object is not sliceable",
            other.type_name()
        ))),
    }
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, SandboxError> {
    use BinOp::*;
    let type_error = || {
        SandboxError::Runtime(format!(
            "TypeError: unsupported operand type(s): '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))
    };

    match (op, left, right) {
        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (Add, Value::List(a), Value::List(b)) => {
            let mut out = a.lock().clone();
            out.extend(b.lock().iter().cloned());
            Ok(Value::list(out))
        }
        (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
            Ok(Value::Str(s.repeat((*n).max(0) as usize)))
        }
        (Mul, Value::List(items), Value::Int(n)) => {
            let base = items.lock().clone();
            let mut out = Vec::new();
            for _ in 0..(*n).max(0) {
                out.extend(base.iter().cloned());
            }
            Ok(Value::list(out))
        }
        (Mod, Value::Str(_), _) => Err(SandboxError::Runtime(
            "TypeError: %-formatting is not supported; use f-strings".into(),
        )),
        (_, Value::Int(a), Value::Int(b)) => int_op(op, *a, *b),
        _ => {
            let (a, b) = match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_error()),
            };
            float_op(op, a, b)
        }
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, SandboxError> {
    use BinOp::*;
    let overflow = || SandboxError::Runtime("OverflowError: integer result too large".into());
    match op {
        Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        Div => {
            if b == 0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: division by zero".into(),
                ))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        FloorDiv => {
            if b == 0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: integer division or modulo by zero".into(),
                ))
            } else {
                Ok(Value::Int(a.div_euclid(b)))
            }
        }
        Mod => {
            if b == 0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: integer division or modulo by zero".into(),
                ))
            } else {
                Ok(Value::Int(a.rem_euclid(b)))
            }
        }
        Pow => {
            if b >= 0 {
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
            } else {
                Ok(Value::Float((a as f64).powi(b as i32)))
            }
        }
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, SandboxError> {
    use BinOp::*;
    match op {
        Add => Ok(Value::Float(a + b)),
        Sub => Ok(Value::Float(a - b)),
        Mul => Ok(Value::Float(a * b)),
        Div => {
            if b == 0.0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: float division by zero".into(),
                ))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        FloorDiv => {
            if b == 0.0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: float floor division by zero".into(),
                ))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        Mod => {
            if b == 0.0 {
                Err(SandboxError::Runtime(
                    "ZeroDivisionError: float modulo".into(),
                ))
            } else {
                Ok(Value::Float(a.rem_euclid(b)))
            }
        }
        Pow => Ok(Value::Float(a.powf(b))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, SandboxError> {
    use CmpOp::*;
    match op {
        Eq => Ok(left.py_eq(right)),
        NotEq => Ok(!left.py_eq(right)),
        Is => Ok(matches!((left, right), (Value::None, Value::None)) || left.py_eq(right)),
        IsNot => Ok(!(matches!((left, right), (Value::None, Value::None)) || left.py_eq(right))),
        In | NotIn => {
            let contains = match right {
                Value::Str(haystack) => match left {
                    Value::Str(needle) => haystack.contains(needle.as_str()),
                    _ => false,
                },
                Value::Dict(entries) => {
                    let key = dict_key(left);
                    entries.lock().iter().any(|(k, _)| *k == key)
                }
                _ => iterate(right)?.iter().any(|item| item.py_eq(left)),
            };
            Ok(if matches!(op, In) { contains } else { !contains })
        }
        ordering_op => {
            let ordering = left.py_cmp(right).ok_or_else(|| {
                SandboxError::Runtime(format!(
                    "TypeError: '<' not supported between '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            Ok(match ordering_op {
                Lt => ordering.is_lt(),
                LtEq => ordering.is_le(),
                Gt => ordering.is_gt(),
                GtEq => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn call_method(receiver: &Value, method: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
    match receiver {
        Value::Str(s) => str_method(s, method, args),
        Value::List(items) => list_method(items, method, args),
        Value::Dict(entries) => dict_method(entries, method, args),
        other => Err(SandboxError::Runtime(format!(
            "AttributeError: '{}' object has no method '{method}'",
            other.type_name()
        ))),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
    let str_arg = |position: usize| -> Result<String, SandboxError> {
        match args.get(position) {
            Some(Value::Str(v)) => Ok(v.clone()),
            Some(other) => Err(SandboxError::Runtime(format!(
                "TypeError: str.{method}() argument must be str, not '{}'",
                other.type_name()
            ))),
            None => Err(SandboxError::Runtime(format!(
                "TypeError: str.{method}() missing argument"
            ))),
        }
    };
    match method {
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "strip" => Ok(Value::Str(s.trim().to_string())),
        "lstrip" => Ok(Value::Str(s.trim_start().to_string())),
        "rstrip" => Ok(Value::Str(s.trim_end().to_string())),
        "capitalize" => {
            let mut chars = s.chars();
            Ok(Value::Str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }))
        }
        "split" => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect()
            } else {
                let sep = str_arg(0)?;
                s.split(&sep).map(|p| Value::Str(p.to_string())).collect()
            };
            Ok(Value::list(parts))
        }
        "join" => {
            let items = args
                .first()
                .ok_or_else(|| {
                    SandboxError::Runtime("TypeError: str.join() missing argument".into())
                })
                .and_then(iterate)?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(part) => parts.push(part),
                    other => {
                        return Err(SandboxError::Runtime(format!(
                            "TypeError: sequence item must be str, not '{}'",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Value::Str(parts.join(s)))
        }
        "replace" => Ok(Value::Str(s.replace(&str_arg(0)?, &str_arg(1)?))),
        "startswith" => Ok(Value::Bool(s.starts_with(&str_arg(0)?))),
        "endswith" => Ok(Value::Bool(s.ends_with(&str_arg(0)?))),
        "find" => Ok(Value::Int(
            s.find(&str_arg(0)?)
                .map(|byte| s[..byte].chars().count() as i64)
                .unwrap_or(-1),
        )),
        "count" => Ok(Value::Int(s.matches(&str_arg(0)?).count() as i64)),
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "title" => Ok(Value::Str(
            s.split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>()
                                + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "format" => Err(SandboxError::Runtime(
            "TypeError: str.format() is not supported; use f-strings".into(),
        )),
        other => Err(SandboxError::Runtime(format!(
            "AttributeError: 'str' object has no method '{other}'"
        ))),
    }
}

fn list_method(
    items: &super::value::ListRef,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, SandboxError> {
    match method {
        "append" => match args.into_iter().next() {
            Some(value) => {
                items.lock().push(value);
                Ok(Value::None)
            }
            None => Err(SandboxError::Runtime(
                "TypeError: list.append() missing argument".into(),
            )),
        },
        "extend" => match args.first() {
            Some(other) => {
                let extra = iterate(other)?;
                items.lock().extend(extra);
                Ok(Value::None)
            }
            None => Err(SandboxError::Runtime(
                "TypeError: list.extend() missing argument".into(),
            )),
        },
        "insert" => match args.as_slice() {
            [Value::Int(i), value] => {
                let mut items = items.lock();
                let i = (*i).clamp(0, items.len() as i64) as usize;
                items.insert(i, value.clone());
                Ok(Value::None)
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: list.insert() expects (index, value)".into(),
            )),
        },
        "pop" => {
            let mut items = items.lock();
            if items.is_empty() {
                return Err(SandboxError::Runtime(
                    "IndexError: pop from empty list".into(),
                ));
            }
            match args.as_slice() {
                [] => Ok(items.pop().expect("non-empty")),
                [Value::Int(i)] => {
                    let i = normalize_index(*i, items.len())?;
                    Ok(items.remove(i))
                }
                _ => Err(SandboxError::Runtime(
                    "TypeError: list.pop() expects at most 1 int".into(),
                )),
            }
        }
        "remove" => match args.first() {
            Some(target) => {
                let mut items = items.lock();
                match items.iter().position(|item| item.py_eq(target)) {
                    Some(i) => {
                        items.remove(i);
                        Ok(Value::None)
                    }
                    None => Err(SandboxError::Runtime(
                        "ValueError: list.remove(x): x not in list".into(),
                    )),
                }
            }
            None => Err(SandboxError::Runtime(
                "TypeError: list.remove() missing argument".into(),
            )),
        },
        "index" => match args.first() {
            Some(target) => items
                .lock()
                .iter()
                .position(|item| item.py_eq(target))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| SandboxError::Runtime("ValueError: value not in list".into())),
            None => Err(SandboxError::Runtime(
                "TypeError: list.index() missing argument".into(),
            )),
        },
        "count" => match args.first() {
            Some(target) => Ok(Value::Int(
                items.lock().iter().filter(|item| item.py_eq(target)).count() as i64,
            )),
            None => Err(SandboxError::Runtime(
                "TypeError: list.count() missing argument".into(),
            )),
        },
        "sort" => {
            let mut items = items.lock();
            let mut failure = false;
            items.sort_by(|a, b| {
                a.py_cmp(b).unwrap_or_else(|| {
                    failure = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failure {
                Err(SandboxError::Runtime(
                    "TypeError: values are not comparable".into(),
                ))
            } else {
                Ok(Value::None)
            }
        }
        "reverse" => {
            items.lock().reverse();
            Ok(Value::None)
        }
        "clear" => {
            items.lock().clear();
            Ok(Value::None)
        }
        other => Err(SandboxError::Runtime(format!(
            "AttributeError: 'list' object has no method '{other}'"
        ))),
    }
}

fn dict_method(
    entries: &super::value::DictRef,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, SandboxError> {
    match method {
        "get" => match args.as_slice() {
            [key] | [key, _] => {
                let key = dict_key(key);
                let found = entries
                    .lock()
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone());
                Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: dict.get() expects 1 or 2 arguments".into(),
            )),
        },
        "keys" => Ok(Value::list(
            entries
                .lock()
                .iter()
                .map(|(k, _)| Value::Str(k.clone()))
                .collect(),
        )),
        "values" => Ok(Value::list(
            entries.lock().iter().map(|(_, v)| v.clone()).collect(),
        )),
        "items" => Ok(Value::list(
            entries
                .lock()
                .iter()
                .map(|(k, v)| Value::Tuple(Arc::new(vec![Value::Str(k.clone()), v.clone()])))
                .collect(),
        )),
        "pop" => match args.as_slice() {
            [key] | [key, _] => {
                let key = dict_key(key);
                let mut entries = entries.lock();
                match entries.iter().position(|(k, _)| *k == key) {
                    Some(i) => Ok(entries.remove(i).1),
                    None => args.get(1).cloned().ok_or_else(|| {
                        SandboxError::Runtime(format!("KeyError: '{key}'"))
                    }),
                }
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: dict.pop() expects 1 or 2 arguments".into(),
            )),
        },
        "update" => match args.first() {
            Some(Value::Dict(other)) => {
                let incoming = other.lock().clone();
                let mut entries = entries.lock();
                for (key, value) in incoming {
                    if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
                        slot.1 = value;
                    } else {
                        entries.push((key, value));
                    }
                }
                Ok(Value::None)
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: dict.update() expects a dict".into(),
            )),
        },
        "clear" => {
            entries.lock().clear();
            Ok(Value::None)
        }
        other => Err(SandboxError::Runtime(format!(
            "AttributeError: 'dict' object has no method '{other}'"
        ))),
    }
}

/// Apply an f-string format spec; unsupported specs fall back to plain
/// rendering.
fn apply_format_spec(value: &Value, spec: Option<&str>) -> String {
    let Some(spec) = spec else {
        return value.display();
    };
    if let Some(precision) = spec
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix('f'))
        .and_then(|digits| digits.parse::<usize>().ok())
    {
        if let Some(number) = value.as_number() {
            return format!("{number:.precision$}");
        }
    }
    if spec == "d" {
        if let Value::Int(i) = value {
            return i.to_string();
        }
    }
    value.display()
}

/// Token-level check used before execution: does the source define
/// `async def main`? Cheaper than a full parse and tolerant of later
/// syntax errors (those surface as execution errors instead).
pub fn has_async_main(source: &str) -> bool {
    let Ok(tokens) = lexer::tokenize(source) else {
        return false;
    };
    use super::lexer::Token;
    tokens.windows(3).any(|window| {
        matches!(
            window,
            [Token::Async, Token::Def, Token::Ident(name)] if name == "main"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(source: &str) -> Result<RunOutput, SandboxError> {
        run_program(source, HashMap::new(), &default_modules(), None, "main").await
    }

    fn default_modules() -> Vec<String> {
        modules::DEFAULT_ALLOWED_MODULES
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_simple_return_dict() {
        let out = run(
            "async def main():\n    return {\"status\": \"completed\", \"result\": \"4\"}\n",
        )
        .await
        .unwrap();
        assert_eq!(
            out.result.display(),
            "{'status': 'completed', 'result': '4'}"
        );
    }

    #[tokio::test]
    async fn test_missing_main() {
        let err = run("x = 1\n").await.unwrap_err();
        assert!(matches!(err, SandboxError::MissingMain));
    }

    #[tokio::test]
    async fn test_locals_captured() {
        let out = run(
            "async def main():\n    answer = 6 * 7\n    text = f\"got {answer}\"\n    return {\"status\": \"completed\", \"result\": text}\n",
        )
        .await
        .unwrap();
        assert_eq!(out.locals.get("answer").unwrap().display(), "42");
        assert_eq!(out.locals.get("text").unwrap().display(), "got 42");
    }

    #[tokio::test]
    async fn test_import_denied() {
        let err = run("import os\nasync def main():\n    return {}\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ImportDenied(module) if module == "os"));
    }

    #[tokio::test]
    async fn test_allowed_import_and_math() {
        let out = run(
            "import math\nasync def main():\n    r = math.sqrt(16)\n    return {\"status\": \"completed\", \"result\": str(r)}\n",
        )
        .await
        .unwrap();
        assert_eq!(out.locals.get("r").unwrap().display(), "4.0");
    }

    #[tokio::test]
    async fn test_for_loop_and_augassign() {
        let out = run(
            "async def main():\n    total = 0\n    for i in range(5):\n        total += i\n    return {\"status\": \"completed\", \"result\": str(total)}\n",
        )
        .await
        .unwrap();
        assert_eq!(out.locals.get("total").unwrap().display(), "10");
    }

    #[tokio::test]
    async fn test_while_break_continue() {
        let source = "async def main():\n    n = 0\n    while True:\n        n += 1\n        if n < 3:\n            continue\n        break\n    return {\"status\": \"completed\", \"result\": str(n)}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("n").unwrap().display(), "3");
    }

    #[tokio::test]
    async fn test_try_except_catches_runtime() {
        let source = "async def main():\n    try:\n        x = 1 / 0\n    except Exception as e:\n        msg = e\n    return {\"status\": \"completed\", \"result\": \"ok\"}\n";
        let out = run(source).await.unwrap();
        // The bound value is the bare message, without the class prefix.
        assert_eq!(out.locals.get("msg").unwrap().display(), "division by zero");
    }

    #[tokio::test]
    async fn test_except_skips_non_matching_clause() {
        let source = "async def main():\n    try:\n        x = 1 / 0\n    except KeyError as e:\n        label = \"wrong handler\"\n    except ZeroDivisionError as e:\n        label = e\n    return {\"status\": \"completed\", \"result\": \"ok\"}\n";
        let out = run(source).await.unwrap();
        assert_eq!(
            out.locals.get("label").unwrap().display(),
            "division by zero"
        );
    }

    #[tokio::test]
    async fn test_except_falls_through_to_catch_all() {
        let source = "async def main():\n    try:\n        raise ValueError(\"bad input\")\n    except KeyError:\n        label = \"key\"\n    except Exception as e:\n        label = e\n    return {\"status\": \"completed\", \"result\": \"ok\"}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("label").unwrap().display(), "bad input");
    }

    #[tokio::test]
    async fn test_unmatched_except_class_propagates() {
        let source = "async def main():\n    try:\n        x = 1 / 0\n    except KeyError:\n        x = 2\n    return {\"status\": \"completed\", \"result\": \"ok\"}\n";
        let err = run(source).await.unwrap_err();
        assert!(err.to_string().contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn test_list_comprehension_and_methods() {
        let source = "async def main():\n    xs = [i * 2 for i in range(4) if i > 0]\n    xs.append(99)\n    return {\"status\": \"completed\", \"result\": str(xs)}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("xs").unwrap().display(), "[2, 4, 6, 99]");
    }

    #[tokio::test]
    async fn test_helper_function_call() {
        let source = "def double(x):\n    return x * 2\n\nasync def main():\n    y = double(21)\n    return {\"status\": \"completed\", \"result\": str(y)}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("y").unwrap().display(), "42");
    }

    #[tokio::test]
    async fn test_async_helper_requires_await() {
        let source = "async def helper():\n    return 1\n\nasync def main():\n    y = helper()\n    return {\"status\": \"completed\", \"result\": \"x\"}\n";
        let err = run(source).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotAwaited(_)));
    }

    #[tokio::test]
    async fn test_await_async_helper() {
        let source = "async def helper():\n    return 41\n\nasync def main():\n    y = await helper() + 1\n    return {\"status\": \"completed\", \"result\": str(y)}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("y").unwrap().display(), "42");
    }

    #[tokio::test]
    async fn test_print_goes_to_stdout() {
        let source =
            "async def main():\n    print(\"hello\", 42)\n    return {\"status\": \"completed\", \"result\": \"ok\"}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.stdout, "hello 42\n");
    }

    #[tokio::test]
    async fn test_context_vars_readable() {
        let mut namespace = HashMap::new();
        namespace.insert(
            "context_vars".to_string(),
            Value::dict(vec![("prior".into(), Value::Str("seed".into()))]),
        );
        let source = "async def main():\n    v = context_vars[\"prior\"]\n    return {\"status\": \"completed\", \"result\": v}\n";
        let out = run_program(source, namespace, &default_modules(), None, "main")
            .await
            .unwrap();
        assert_eq!(out.locals.get("v").unwrap().display(), "seed");
    }

    #[tokio::test]
    async fn test_string_methods() {
        let source = "async def main():\n    s = \" Hello,World \"\n    parts = s.strip().split(\",\")\n    joined = \"-\".join(parts)\n    return {\"status\": \"completed\", \"result\": joined}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("joined").unwrap().display(), "Hello-World");
    }

    #[tokio::test]
    async fn test_dict_roundtrip_and_get() {
        let source = "async def main():\n    d = {\"a\": 1}\n    d[\"b\"] = 2\n    x = d.get(\"missing\", 9)\n    return {\"status\": \"completed\", \"result\": str(x)}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("x").unwrap().display(), "9");
    }

    #[tokio::test]
    async fn test_tuple_unpacking() {
        let source = "async def main():\n    a, b = 1, 2\n    a, b = b, a\n    return {\"status\": \"completed\", \"result\": f\"{a},{b}\"}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("a").unwrap().display(), "2");
        assert_eq!(out.locals.get("b").unwrap().display(), "1");
    }

    #[tokio::test]
    async fn test_format_spec() {
        let source = "async def main():\n    pi = 3.14159\n    s = f\"{pi:.2f}\"\n    return {\"status\": \"completed\", \"result\": s}\n";
        let out = run(source).await.unwrap();
        assert_eq!(out.locals.get("s").unwrap().display(), "3.14");
    }

    #[tokio::test]
    async fn test_has_async_main() {
        assert!(has_async_main("async def main():\n    pass\n"));
        assert!(!has_async_main("def main():\n    pass\n"));
        assert!(!has_async_main("async def other():\n    pass\n"));
    }

    #[tokio::test]
    async fn test_syntax_error_surfaces() {
        let err = run("async def main(:\n    pass\n").await.unwrap_err();
        assert!(matches!(err, SandboxError::Syntax(_)));
    }
}
