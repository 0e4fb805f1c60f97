//! Evaluator for ordinary code.
//!
//! A small Python-flavoured language: literals, arithmetic, comparisons,
//! boolean operators, assignment, `del`, `pass` and a handful of builtins.
//! Source is first tried as a single expression, whose value becomes the
//! submission's result; if that fails to parse it runs as statements.

mod lexer;
mod parser;
mod value;

use rustc_hash::FxHashMap;

use crate::error::EvalError;
use crate::interrupt::InterruptFlag;

pub use parser::{Expr, Stmt, parse_expression, parse_program};
pub use value::{BinOp, CmpOp, Value};

/// Builtin functions, sorted.
pub const BUILTINS: &[&str] = &[
    "abs", "float", "int", "len", "max", "min", "print", "str", "type", "warn",
];

/// Text written by the code while it ran.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Holds the user namespace across submissions.
pub struct Interpreter {
    namespace: FxHashMap<String, Value>,
    interrupt: InterruptFlag,
}

impl Interpreter {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self {
            namespace: FxHashMap::default(),
            interrupt,
        }
    }

    /// Run `source`, returning the value of a lone expression.
    ///
    /// `None` results are dropped, as at an interactive prompt.
    pub fn run(&mut self, source: &str, out: &mut Captured) -> Result<Option<Value>, EvalError> {
        self.check_interrupt()?;

        if let Ok(expr) = parse_expression(source) {
            let value = self.eval(&expr, out)?;
            return Ok((value != Value::None).then_some(value));
        }

        let program = parse_program(source)?;
        for stmt in &program {
            self.check_interrupt()?;
            self.exec(stmt, out)?;
        }
        Ok(None)
    }

    /// Names bound in the namespace, sorted.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespace.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    /// Bind `name` directly, bypassing the parser.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        let mut chars = name.chars();
        let valid = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_');
        if !valid {
            return Err(EvalError::Syntax(format!("invalid variable name '{}'", name)));
        }
        self.namespace.insert(name.to_string(), value);
        Ok(())
    }

    /// Forget every binding.
    pub fn reset(&mut self) {
        self.namespace.clear();
    }

    fn check_interrupt(&self) -> Result<(), EvalError> {
        if self.interrupt.is_raised() {
            Err(EvalError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn exec(&mut self, stmt: &Stmt, out: &mut Captured) -> Result<(), EvalError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, out)?;
            }
            Stmt::Assign(targets, expr) => {
                let value = self.eval(expr, out)?;
                for target in targets {
                    self.namespace.insert(target.clone(), value.clone());
                }
            }
            Stmt::AugAssign(target, op, expr) => {
                let current = self.lookup(target)?;
                let rhs = self.eval(expr, out)?;
                let value = current.binary(*op, &rhs)?;
                self.namespace.insert(target.clone(), value);
            }
            Stmt::Del(targets) => {
                for target in targets {
                    if self.namespace.remove(target).is_none() {
                        return Err(EvalError::Name(target.clone()));
                    }
                }
            }
            Stmt::Pass => {}
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        if let Some(value) = self.namespace.get(name) {
            return Ok(value.clone());
        }
        BUILTINS
            .iter()
            .find(|builtin| **builtin == name)
            .map(|builtin| Value::Builtin(*builtin))
            .ok_or_else(|| EvalError::Name(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr, out: &mut Captured) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::Neg(inner) => self.eval(inner, out)?.negate(),
            Expr::Pos(inner) => self.eval(inner, out)?.positive(),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner, out)?.is_truthy())),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, out)?;
                let rhs = self.eval(rhs, out)?;
                lhs.binary(*op, &rhs)
            }
            Expr::Compare(op, lhs, rhs) => {
                let lhs = self.eval(lhs, out)?;
                let rhs = self.eval(rhs, out)?;
                lhs.compare(*op, &rhs).map(Value::Bool)
            }
            Expr::And(lhs, rhs) => {
                let lhs = self.eval(lhs, out)?;
                if !lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(rhs, out)
            }
            Expr::Or(lhs, rhs) => {
                let lhs = self.eval(lhs, out)?;
                if lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(rhs, out)
            }
            Expr::Call(name, args) => {
                let callee = self.lookup(name)?;
                let Value::Builtin(builtin) = callee else {
                    return Err(EvalError::Type(format!(
                        "'{}' object is not callable",
                        callee.type_name()
                    )));
                };
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, out))
                    .collect::<Result<Vec<_>, _>>()?;
                call_builtin(builtin, &args, out)
            }
        }
    }
}

fn call_builtin(name: &str, args: &[Value], out: &mut Captured) -> Result<Value, EvalError> {
    match name {
        "print" | "warn" => {
            let line = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            let target = if name == "print" {
                &mut out.stdout
            } else {
                &mut out.stderr
            };
            target.push_str(&line);
            target.push('\n');
            Ok(Value::None)
        }
        "len" => match exactly_one(name, args)? {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            other => Err(EvalError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        },
        "str" => match args {
            [] => Ok(Value::Str(String::new())),
            [arg] => Ok(Value::Str(arg.to_string())),
            _ => exactly_one(name, args).map(|_| Value::None),
        },
        "int" => match args {
            [] => Ok(Value::Int(0)),
            [Value::Int(i)] => Ok(Value::Int(*i)),
            [Value::Bool(b)] => Ok(Value::Int(i64::from(*b))),
            [Value::Float(f)] => {
                let truncated = f.trunc();
                // i64::MIN is exact as a float; i64::MAX rounds up to 2^63.
                if !truncated.is_finite()
                    || truncated < i64::MIN as f64
                    || truncated >= i64::MAX as f64
                {
                    return Err(EvalError::Overflow(format!(
                        "cannot convert float {} to integer",
                        Value::Float(*f)
                    )));
                }
                Ok(Value::Int(truncated as i64))
            }
            [Value::Str(s)] => s
                .trim()
                .replace('_', "")
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| {
                    EvalError::Value(format!(
                        "invalid literal for int() with base 10: {}",
                        Value::Str(s.clone()).repr()
                    ))
                }),
            [other] => Err(EvalError::Type(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
            _ => exactly_one(name, args).map(|_| Value::None),
        },
        "float" => match args {
            [] => Ok(Value::Float(0.0)),
            [Value::Int(i)] => Ok(Value::Float(*i as f64)),
            [Value::Bool(b)] => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            [Value::Float(f)] => Ok(Value::Float(*f)),
            [Value::Str(s)] => parse_float(s).map(Value::Float).ok_or_else(|| {
                EvalError::Value(format!(
                    "could not convert string to float: {}",
                    Value::Str(s.clone()).repr()
                ))
            }),
            [other] => Err(EvalError::Type(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
            _ => exactly_one(name, args).map(|_| Value::None),
        },
        "abs" => match exactly_one(name, args)? {
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| EvalError::Overflow("integer overflow".to_string())),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(EvalError::Type(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        },
        "min" | "max" => extremum(name, args),
        "type" => Ok(Value::Type(exactly_one(name, args)?.type_name())),
        _ => Err(EvalError::Name(name.to_string())),
    }
}

fn exactly_one<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, EvalError> {
    match args {
        [arg] => Ok(arg),
        _ => Err(EvalError::Type(format!(
            "{}() takes exactly one argument ({} given)",
            name,
            args.len()
        ))),
    }
}

fn extremum(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let candidates: Vec<Value> = match args {
        [] => {
            return Err(EvalError::Type(format!(
                "{} expected at least 1 argument, got 0",
                name
            )));
        }
        [Value::Str(s)] => s.chars().map(|c| Value::Str(c.to_string())).collect(),
        [other] => {
            return Err(EvalError::Type(format!(
                "'{}' object is not iterable",
                other.type_name()
            )));
        }
        many => many.to_vec(),
    };

    let mut iter = candidates.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(EvalError::Value(format!("{}() arg is an empty sequence", name)));
    };
    let better = if name == "min" { CmpOp::Lt } else { CmpOp::Gt };
    for candidate in iter {
        if candidate.compare(better, &best)? {
            best = candidate;
        }
    }
    Ok(best)
}

fn parse_float(text: &str) -> Option<f64> {
    let text = text.trim();
    match text.to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => text.replace('_', "").parse::<f64>().ok(),
    }
}
