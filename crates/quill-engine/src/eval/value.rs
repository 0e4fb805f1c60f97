//! Runtime values and their operators.

use std::cmp::Ordering;
use std::fmt;

use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A builtin function referenced by name.
    Builtin(&'static str),
    /// Result of `type(x)`.
    Type(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Numeric view of a value. Booleans count as integers.
enum Num {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Type(_) => "type",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Builtin(_) | Value::Type(_) => true,
        }
    }

    /// Text used by `repr()` and for `execute_result`.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => repr_str(s),
            other => other.to_string(),
        }
    }

    fn num(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    pub fn binary(&self, op: BinOp, rhs: &Value) -> Result<Value, EvalError> {
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
                check_str_len(a.len().checked_add(b.len()))?;
                return Ok(Value::Str(format!("{}{}", a, b)));
            }
            (Value::Str(s), n) | (n, Value::Str(s)) if op == BinOp::Mul && !matches!(n, Value::Str(_)) => {
                if let Some(Num::Int(times)) = n.num() {
                    let times = usize::try_from(times.max(0)).unwrap_or(usize::MAX);
                    check_str_len(s.len().checked_mul(times))?;
                    return Ok(Value::Str(s.repeat(times)));
                }
            }
            _ => {}
        }

        match (self.num(), rhs.num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => int_binary(op, a, b),
            (Some(a), Some(b)) => float_binary(op, a.as_f64(), b.as_f64()),
            _ => Err(EvalError::Type(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    pub fn negate(&self) -> Result<Value, EvalError> {
        match self.num() {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| EvalError::Overflow("integer overflow".to_string())),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err(EvalError::Type(format!(
                "bad operand type for unary -: '{}'",
                self.type_name()
            ))),
        }
    }

    pub fn positive(&self) -> Result<Value, EvalError> {
        match self.num() {
            Some(Num::Int(i)) => Ok(Value::Int(i)),
            Some(Num::Float(f)) => Ok(Value::Float(f)),
            None => Err(EvalError::Type(format!(
                "bad operand type for unary +: '{}'",
                self.type_name()
            ))),
        }
    }

    pub fn compare(&self, op: CmpOp, rhs: &Value) -> Result<bool, EvalError> {
        let ordering = match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.num(), rhs.num()) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
                (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
                _ => None,
            },
        };

        match (op, ordering) {
            (CmpOp::Eq, _) => Ok(self.loosely_equals(rhs)),
            (CmpOp::Ne, _) => Ok(!self.loosely_equals(rhs)),
            (_, Some(ordering)) => Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }),
            // NaN compares false with everything.
            (_, None) if self.num().is_some() && rhs.num().is_some() => Ok(false),
            (_, None) => Err(EvalError::Type(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    /// Equality across numeric types, identity elsewhere.
    fn loosely_equals(&self, rhs: &Value) -> bool {
        match (self.num(), rhs.num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => self == rhs,
        }
    }
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }
}

/// Largest string a single operation may build, in bytes.
pub const MAX_STR_LEN: usize = 1 << 30;

fn check_str_len(len: Option<usize>) -> Result<(), EvalError> {
    match len {
        Some(len) if len <= MAX_STR_LEN => Ok(()),
        _ => Err(EvalError::Memory("string too large".to_string())),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let overflow = || EvalError::Overflow("integer overflow".to_string());
    let by_zero = || EvalError::ZeroDivision("integer division or modulo by zero".to_string());

    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                return Err(EvalError::ZeroDivision("division by zero".to_string()));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(by_zero());
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            let floored = if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q };
            Ok(Value::Int(floored))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(by_zero());
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            let r = if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r };
            Ok(Value::Int(r))
        }
        BinOp::Pow => {
            if b < 0 {
                return float_binary(op, a as f64, b as f64);
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
        }
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let by_zero = |what: &str| EvalError::ZeroDivision(format!("float {} by zero", what));

    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(by_zero("division"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(by_zero("floor division"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(by_zero("modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::ZeroDivision(
                    "0.0 cannot be raised to a negative power".to_string(),
                ));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e16 {
        return format!("{:.1}", f);
    }
    format!("{:?}", f)
}

/// `str()` of a value.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            Value::Builtin(name) => write!(f, "<built-in function {}>", name),
            Value::Type(name) => write!(f, "<class '{}'>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_follows_floor_semantics() {
        assert_eq!(int_binary(BinOp::FloorDiv, -7, 2).unwrap(), Value::Int(-4));
        assert_eq!(int_binary(BinOp::Mod, -7, 2).unwrap(), Value::Int(1));
        assert_eq!(int_binary(BinOp::Mod, 7, -2).unwrap(), Value::Int(-1));
        assert_eq!(int_binary(BinOp::Div, 7, 2).unwrap(), Value::Float(3.5));
        assert_eq!(int_binary(BinOp::Pow, 2, -1).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            Value::Int(1).binary(BinOp::Div, &Value::Int(0)),
            Err(EvalError::ZeroDivision(_))
        ));
        assert!(matches!(
            Value::Float(1.0).binary(BinOp::Mod, &Value::Float(0.0)),
            Err(EvalError::ZeroDivision(_))
        ));
    }

    #[test]
    fn test_overflow_is_reported() {
        assert!(matches!(
            Value::Int(i64::MAX).binary(BinOp::Add, &Value::Int(1)),
            Err(EvalError::Overflow(_))
        ));
    }

    #[test]
    fn test_string_operators() {
        let s = Value::Str("ab".to_string());
        assert_eq!(s.binary(BinOp::Mul, &Value::Int(2)).unwrap(), Value::Str("abab".to_string()));
        assert_eq!(Value::Int(2).binary(BinOp::Mul, &s).unwrap(), Value::Str("abab".to_string()));
        assert!(matches!(s.binary(BinOp::Sub, &s), Err(EvalError::Type(_))));
    }

    #[test]
    fn test_huge_string_repeat_is_an_error() {
        let s = Value::Str("ab".to_string());
        assert!(matches!(
            s.binary(BinOp::Mul, &Value::Int(i64::MAX)),
            Err(EvalError::Memory(_))
        ));
        assert!(matches!(
            Value::Int(1_000_000_000_000).binary(BinOp::Mul, &Value::Str("a".to_string())),
            Err(EvalError::Memory(_))
        ));
        assert_eq!(s.binary(BinOp::Mul, &Value::Int(-3)).unwrap(), Value::Str(String::new()));
    }

    #[test]
    fn test_comparisons() {
        assert!(Value::Int(1).compare(CmpOp::Eq, &Value::Float(1.0)).unwrap());
        assert!(Value::Bool(true).compare(CmpOp::Eq, &Value::Int(1)).unwrap());
        assert!(!Value::Str("1".to_string()).compare(CmpOp::Eq, &Value::Int(1)).unwrap());
        assert!(matches!(
            Value::Str("a".to_string()).compare(CmpOp::Lt, &Value::Int(1)),
            Err(EvalError::Type(_))
        ));
    }

    #[test]
    fn test_repr_and_str() {
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::Float(0.1 + 0.2).repr(), "0.30000000000000004");
        assert_eq!(Value::Str("it's".to_string()).repr(), "\"it's\"");
        assert_eq!(Value::Str("a\nb".to_string()).repr(), "'a\\nb'");
        assert_eq!(Value::Str("plain".to_string()).to_string(), "plain");
        assert_eq!(Value::Type("int").repr(), "<class 'int'>");
    }
}
