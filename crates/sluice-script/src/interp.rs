//! Tree-walking interpreter with an allow-listed builtin registry.
//!
//! The interpreter owns no I/O: `print` output is captured into a buffer and
//! returned to the caller.  Execution is bounded by a step budget and by a
//! cooperative cancellation flag checked between steps, so a supervising
//! task can stop a runaway script promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::{BinOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::{ScriptError, ScriptResult};
use crate::value::{ChartSpec, Namespace, RuntimeValue};

/// Modules a script may `import`. Core data/table/chart/math/date-time/text
/// capabilities only; everything else is denied at runtime (and rejected
/// earlier by the static security scan).
pub const ALLOWED_MODULES: &[&str] = &["math", "stats", "tables", "charts", "text", "datetime"];

/// Interpreter limits.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Upper bound on evaluation steps before the run is aborted.
    pub max_steps: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self { max_steps: 100_000 }
    }
}

/// Executes parsed programs against a [`Namespace`].
pub struct Interpreter {
    config: InterpreterConfig,
    cancel: Arc<AtomicBool>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag a supervisor can set to stop the run at the next step boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run `program` against `namespace`, returning captured print output.
    pub fn run(&self, program: &[Stmt], namespace: &mut Namespace) -> ScriptResult<String> {
        let mut eval = Eval {
            namespace,
            output: String::new(),
            steps: 0,
            max_steps: self.config.max_steps,
            cancel: &self.cancel,
        };
        for stmt in program {
            eval.step(stmt.line)?;
            match &stmt.kind {
                StmtKind::Import(module) => {
                    if !ALLOWED_MODULES.contains(&module.as_str()) {
                        return Err(ScriptError::ImportDenied {
                            line: stmt.line,
                            module: module.clone(),
                        });
                    }
                }
                StmtKind::Assign { name, value } => {
                    let value = eval.expr(value, stmt.line)?;
                    eval.namespace.set(name.clone(), value);
                }
                StmtKind::Expr(expr) => {
                    eval.expr(expr, stmt.line)?;
                }
            }
        }
        Ok(eval.output)
    }
}

struct Eval<'a> {
    namespace: &'a mut Namespace,
    output: String,
    steps: u64,
    max_steps: u64,
    cancel: &'a AtomicBool,
}

impl Eval<'_> {
    fn step(&mut self, _line: usize) -> ScriptResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ScriptError::Cancelled);
        }
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(ScriptError::ResourceLimit {
                limit: self.max_steps,
            });
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr, line: usize) -> ScriptResult<RuntimeValue> {
        self.step(line)?;
        match expr {
            Expr::Int(v) => Ok(RuntimeValue::Int(*v)),
            Expr::Float(v) => Ok(RuntimeValue::Float(*v)),
            Expr::Str(v) => Ok(RuntimeValue::Str(v.clone())),
            Expr::Bool(v) => Ok(RuntimeValue::Bool(*v)),
            Expr::Null => Ok(RuntimeValue::Null),
            Expr::Missing => Ok(RuntimeValue::Missing),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.expr(item, line))
                    .collect::<ScriptResult<Vec<_>>>()?;
                Ok(RuntimeValue::List(values))
            }
            Expr::Map(entries) => {
                let mut map = IndexMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.expr(value, line)?);
                }
                Ok(RuntimeValue::Map(map))
            }
            Expr::Ident(name) => self
                .namespace
                .get(name)
                .cloned()
                .ok_or_else(|| raised(line, format!("unknown name `{name}`"))),
            Expr::Unary { op, operand } => {
                let value = self.expr(operand, line)?;
                match (op, value) {
                    (UnaryOp::Neg, RuntimeValue::Int(v)) => Ok(RuntimeValue::Int(-v)),
                    (UnaryOp::Neg, RuntimeValue::Float(v)) => Ok(RuntimeValue::Float(-v)),
                    (UnaryOp::Neg, other) => {
                        Err(raised(line, format!("cannot negate {}", other.type_name())))
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs, line)?;
                let rhs = self.expr(rhs, line)?;
                binary(*op, lhs, rhs, line)
            }
            Expr::Call { target, args } => self.call(target, args, line),
            Expr::Attr { target, name } => {
                let value = self.expr(target, line)?;
                match value {
                    RuntimeValue::Map(map) => map.get(name).cloned().ok_or_else(|| {
                        raised(line, format!("map has no entry `{name}`"))
                    }),
                    other => Err(raised(
                        line,
                        format!("{} has no attribute `{name}`", other.type_name()),
                    )),
                }
            }
            Expr::Index { target, index } => {
                let target = self.expr(target, line)?;
                let index = self.expr(index, line)?;
                self.index(target, index, line)
            }
        }
    }

    fn index(
        &mut self,
        target: RuntimeValue,
        index: RuntimeValue,
        line: usize,
    ) -> ScriptResult<RuntimeValue> {
        match (target, index) {
            (RuntimeValue::List(items), RuntimeValue::Int(i)) => {
                let len = items.len() as i64;
                let i = if i < 0 { i + len } else { i };
                if i < 0 || i >= len {
                    return Err(raised(line, format!("list index {i} out of range")));
                }
                Ok(items[i as usize].clone())
            }
            (RuntimeValue::Map(map), RuntimeValue::Str(key)) => map
                .get(&key)
                .cloned()
                .ok_or_else(|| raised(line, format!("map has no entry `{key}`"))),
            (RuntimeValue::Table(table), RuntimeValue::Str(column)) => table
                .column(&column)
                .map(RuntimeValue::List)
                .ok_or_else(|| raised(line, format!("table has no column `{column}`"))),
            (target, index) => Err(raised(
                line,
                format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    index.type_name()
                ),
            )),
        }
    }

    fn call(&mut self, target: &Expr, args: &[Expr], line: usize) -> ScriptResult<RuntimeValue> {
        // Method call: receiver.method(args)
        if let Expr::Attr { target: receiver, name } = target {
            let receiver = self.expr(receiver, line)?;
            let args = self.eval_args(args, line)?;
            return self.method(receiver, name, args, line);
        }
        // Builtin call: name(args)
        if let Expr::Ident(name) = target {
            if !self.namespace.contains(name) {
                let args = self.eval_args(args, line)?;
                return self.builtin(name, args, line);
            }
        }
        Err(raised(line, "value is not callable".to_string()))
    }

    fn eval_args(&mut self, args: &[Expr], line: usize) -> ScriptResult<Vec<RuntimeValue>> {
        args.iter().map(|arg| self.expr(arg, line)).collect()
    }

    fn method(
        &mut self,
        receiver: RuntimeValue,
        name: &str,
        args: Vec<RuntimeValue>,
        line: usize,
    ) -> ScriptResult<RuntimeValue> {
        match (&receiver, name) {
            (RuntimeValue::Table(table), "head") => {
                let n = match args.first() {
                    Some(RuntimeValue::Int(n)) => *n.max(&0) as usize,
                    None => 5,
                    Some(other) => {
                        return Err(raised(
                            line,
                            format!("head() expects an int, got {}", other.type_name()),
                        ))
                    }
                };
                Ok(RuntimeValue::Table(table.head(n)))
            }
            (RuntimeValue::Table(table), "columns") => Ok(RuntimeValue::List(
                table
                    .columns
                    .iter()
                    .map(|c| RuntimeValue::Str(c.clone()))
                    .collect(),
            )),
            (RuntimeValue::Table(table), "len") => Ok(RuntimeValue::Int(table.len() as i64)),
            (RuntimeValue::Str(s), "upper") => Ok(RuntimeValue::Str(s.to_uppercase())),
            (RuntimeValue::Str(s), "lower") => Ok(RuntimeValue::Str(s.to_lowercase())),
            // Display is a no-op inside the sandbox: nothing may open a
            // window or write outside the captured buffer.
            (RuntimeValue::Chart(_), "show") => Ok(RuntimeValue::Null),
            (RuntimeValue::Chart(spec), "with_title") => {
                let title = match args.into_iter().next() {
                    Some(RuntimeValue::Str(t)) => t,
                    _ => return Err(raised(line, "with_title() expects a string".to_string())),
                };
                let mut new_spec = spec.as_ref().clone();
                new_spec.title = Some(title);
                Ok(RuntimeValue::Chart(Arc::new(new_spec)))
            }
            (receiver, name) => Err(raised(
                line,
                format!("{} has no method `{name}`", receiver.type_name()),
            )),
        }
    }

    fn builtin(
        &mut self,
        name: &str,
        args: Vec<RuntimeValue>,
        line: usize,
    ) -> ScriptResult<RuntimeValue> {
        match name {
            "print" => {
                let rendered = args
                    .iter()
                    .map(format_value)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.output.push_str(&rendered);
                self.output.push('\n');
                Ok(RuntimeValue::Null)
            }
            "len" => match args.into_iter().next() {
                Some(RuntimeValue::List(items)) => Ok(RuntimeValue::Int(items.len() as i64)),
                Some(RuntimeValue::Str(s)) => Ok(RuntimeValue::Int(s.chars().count() as i64)),
                Some(RuntimeValue::Map(map)) => Ok(RuntimeValue::Int(map.len() as i64)),
                Some(RuntimeValue::Table(table)) => Ok(RuntimeValue::Int(table.len() as i64)),
                Some(other) => Err(raised(
                    line,
                    format!("len() does not apply to {}", other.type_name()),
                )),
                None => Err(raised(line, "len() expects one argument".to_string())),
            },
            "sum" | "min" | "max" | "mean" => {
                let items = match args.into_iter().next() {
                    Some(RuntimeValue::List(items)) => items,
                    Some(other) => {
                        return Err(raised(
                            line,
                            format!("{name}() expects a list, got {}", other.type_name()),
                        ))
                    }
                    None => return Err(raised(line, format!("{name}() expects one argument"))),
                };
                aggregate(name, &items, line)
            }
            "abs" => match args.into_iter().next() {
                Some(RuntimeValue::Int(v)) => Ok(RuntimeValue::Int(v.abs())),
                Some(RuntimeValue::Float(v)) => Ok(RuntimeValue::Float(v.abs())),
                _ => Err(raised(line, "abs() expects a number".to_string())),
            },
            "round" => {
                let mut args = args.into_iter();
                let value = match args.next() {
                    Some(RuntimeValue::Float(v)) => v,
                    Some(RuntimeValue::Int(v)) => return Ok(RuntimeValue::Int(v)),
                    _ => return Err(raised(line, "round() expects a number".to_string())),
                };
                let digits = match args.next() {
                    Some(RuntimeValue::Int(d)) => d.clamp(0, 12) as u32,
                    None => 0,
                    Some(other) => {
                        return Err(raised(
                            line,
                            format!("round() digits must be an int, got {}", other.type_name()),
                        ))
                    }
                };
                let factor = 10f64.powi(digits as i32);
                Ok(RuntimeValue::Float((value * factor).round() / factor))
            }
            "str" => match args.into_iter().next() {
                Some(value) => Ok(RuntimeValue::Str(format_value(&value))),
                None => Err(raised(line, "str() expects one argument".to_string())),
            },
            "upper" | "lower" => match args.into_iter().next() {
                Some(RuntimeValue::Str(s)) => Ok(RuntimeValue::Str(if name == "upper" {
                    s.to_uppercase()
                } else {
                    s.to_lowercase()
                })),
                _ => Err(raised(line, format!("{name}() expects a string"))),
            },
            "head" => {
                let mut args = args.into_iter();
                let table = match args.next() {
                    Some(RuntimeValue::Table(table)) => table,
                    _ => return Err(raised(line, "head() expects a table".to_string())),
                };
                let n = match args.next() {
                    Some(RuntimeValue::Int(n)) => n.max(0) as usize,
                    None => 5,
                    Some(other) => {
                        return Err(raised(
                            line,
                            format!("head() count must be an int, got {}", other.type_name()),
                        ))
                    }
                };
                Ok(RuntimeValue::Table(table.head(n)))
            }
            "columns" => match args.into_iter().next() {
                Some(RuntimeValue::Table(table)) => Ok(RuntimeValue::List(
                    table
                        .columns
                        .iter()
                        .map(|c| RuntimeValue::Str(c.clone()))
                        .collect(),
                )),
                _ => Err(raised(line, "columns() expects a table".to_string())),
            },
            "range" => match args.into_iter().next() {
                Some(RuntimeValue::Int(n)) => Ok(RuntimeValue::List(
                    (0..n.max(0)).map(RuntimeValue::Int).collect(),
                )),
                _ => Err(raised(line, "range() expects an int".to_string())),
            },
            "make_chart" => {
                let mut args = args.into_iter();
                let kind = match args.next() {
                    Some(RuntimeValue::Str(kind)) => kind,
                    _ => {
                        return Err(raised(
                            line,
                            "make_chart() expects a kind string first".to_string(),
                        ))
                    }
                };
                let x = match args.next() {
                    Some(RuntimeValue::List(items)) => items,
                    _ => return Err(raised(line, "make_chart() expects an x list".to_string())),
                };
                let y = match args.next() {
                    Some(RuntimeValue::List(items)) => items,
                    _ => return Err(raised(line, "make_chart() expects a y list".to_string())),
                };
                let title = match args.next() {
                    Some(RuntimeValue::Str(title)) => Some(title),
                    None => None,
                    Some(other) => {
                        return Err(raised(
                            line,
                            format!("make_chart() title must be a string, got {}", other.type_name()),
                        ))
                    }
                };
                Ok(RuntimeValue::Chart(Arc::new(ChartSpec { kind, title, x, y })))
            }
            "copy" => match args.into_iter().next() {
                Some(value) => Ok(value.deep_copy()),
                None => Err(raised(line, "copy() expects one argument".to_string())),
            },
            other => Err(raised(line, format!("unknown function `{other}`"))),
        }
    }
}

fn aggregate(name: &str, items: &[RuntimeValue], line: usize) -> ScriptResult<RuntimeValue> {
    // Absent entries (null and the NA sentinel) are skipped, matching how
    // tabular tools aggregate over incomplete columns.
    let mut ints: Vec<i64> = Vec::new();
    let mut floats: Vec<f64> = Vec::new();
    for item in items {
        match item {
            RuntimeValue::Int(v) => {
                ints.push(*v);
                floats.push(*v as f64);
            }
            RuntimeValue::Float(v) => floats.push(*v),
            RuntimeValue::Null | RuntimeValue::Missing => {}
            other => {
                return Err(raised(
                    line,
                    format!("{name}() does not apply to {}", other.type_name()),
                ))
            }
        }
    }
    if floats.is_empty() {
        return Ok(RuntimeValue::Missing);
    }
    let all_int = ints.len() == floats.len();
    let value = match name {
        "sum" => {
            if all_int {
                return Ok(RuntimeValue::Int(ints.iter().sum()));
            }
            floats.iter().sum()
        }
        "min" => floats.iter().cloned().fold(f64::INFINITY, f64::min),
        "max" => floats.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        "mean" => floats.iter().sum::<f64>() / floats.len() as f64,
        _ => return Err(raised(line, format!("unknown aggregate `{name}`"))),
    };
    if all_int && (name == "min" || name == "max") {
        return Ok(RuntimeValue::Int(value as i64));
    }
    Ok(RuntimeValue::Float(value))
}

fn binary(op: BinOp, lhs: RuntimeValue, rhs: RuntimeValue, line: usize) -> ScriptResult<RuntimeValue> {
    use RuntimeValue as V;
    match op {
        BinOp::Eq => return Ok(V::Bool(lhs == rhs)),
        BinOp::Ne => return Ok(V::Bool(lhs != rhs)),
        _ => {}
    }
    match (op, &lhs, &rhs) {
        (BinOp::Add, V::Str(a), V::Str(b)) => return Ok(V::Str(format!("{a}{b}"))),
        (BinOp::Add, V::List(a), V::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(V::List(out));
        }
        (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, V::Str(a), V::Str(b)) => {
            let result = match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            };
            return Ok(V::Bool(result));
        }
        _ => {}
    }
    let (a, b, both_int) = match (&lhs, &rhs) {
        (V::Int(a), V::Int(b)) => (*a as f64, *b as f64, true),
        (V::Int(a), V::Float(b)) => (*a as f64, *b, false),
        (V::Float(a), V::Int(b)) => (*a, *b as f64, false),
        (V::Float(a), V::Float(b)) => (*a, *b, false),
        _ => {
            return Err(raised(
                line,
                format!(
                    "operator {} does not apply to {} and {}",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                ),
            ))
        }
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        // Division always yields a float; non-finite results are later
        // collapsed to null by the serialization engine.
        BinOp::Div => return Ok(V::Float(a / b)),
        BinOp::Rem => {
            if b == 0.0 {
                return Err(raised(line, "modulo by zero".to_string()));
            }
            a % b
        }
        BinOp::Lt => return Ok(V::Bool(a < b)),
        BinOp::Le => return Ok(V::Bool(a <= b)),
        BinOp::Gt => return Ok(V::Bool(a > b)),
        BinOp::Ge => return Ok(V::Bool(a >= b)),
        BinOp::Eq | BinOp::Ne => unreachable!("handled above"),
    };
    if both_int {
        Ok(V::Int(result as i64))
    } else {
        Ok(V::Float(result))
    }
}

/// Human-readable rendering used by `print` and `str`.
pub fn format_value(value: &RuntimeValue) -> String {
    match value {
        RuntimeValue::Int(v) => v.to_string(),
        RuntimeValue::Float(v) => v.to_string(),
        RuntimeValue::Bool(v) => v.to_string(),
        RuntimeValue::Str(s) => s.clone(),
        RuntimeValue::Null => "null".to_string(),
        RuntimeValue::Missing => "NA".to_string(),
        RuntimeValue::List(items) => {
            let inner = items.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{inner}]")
        }
        RuntimeValue::Map(map) => {
            let inner = map
                .iter()
                .map(|(k, v)| format!("{k}: {}", format_value(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{inner}}}")
        }
        RuntimeValue::Table(table) => {
            format!("<table rows={} cols={}>", table.len(), table.columns.len())
        }
        RuntimeValue::Chart(spec) => format!("<chart {}>", spec.kind),
        RuntimeValue::Serialized(_) => "<serialized>".to_string(),
    }
}

fn raised(line: usize, message: String) -> ScriptError {
    ScriptError::Raised { line, message }
}
