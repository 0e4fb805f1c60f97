//! Error types for the execution engine.
//!
//! These never cross the protocol as transport failures. The engine turns
//! them into an `error` message followed by `execute_reply{status: error}`.

use thiserror::Error;

/// Failure raised while evaluating ordinary code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),

    #[error("ValueError: {0}")]
    Value(String),

    #[error("OverflowError: {0}")]
    Overflow(String),

    #[error("MemoryError: {0}")]
    Memory(String),

    #[error("KeyboardInterrupt")]
    Interrupted,
}

impl EvalError {
    pub fn ename(&self) -> &'static str {
        match self {
            EvalError::Syntax(_) => "SyntaxError",
            EvalError::Name(_) => "NameError",
            EvalError::Type(_) => "TypeError",
            EvalError::ZeroDivision(_) => "ZeroDivisionError",
            EvalError::Value(_) => "ValueError",
            EvalError::Overflow(_) => "OverflowError",
            EvalError::Memory(_) => "MemoryError",
            EvalError::Interrupted => "KeyboardInterrupt",
        }
    }

    pub fn evalue(&self) -> String {
        match self {
            EvalError::Syntax(msg)
            | EvalError::Type(msg)
            | EvalError::ZeroDivision(msg)
            | EvalError::Value(msg)
            | EvalError::Overflow(msg)
            | EvalError::Memory(msg) => msg.clone(),
            EvalError::Name(name) => format!("name '{}' is not defined", name),
            EvalError::Interrupted => String::new(),
        }
    }
}

/// Unknown or malformed execution directive.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectiveError {
    #[error("UsageError: Line magic function `%{0}` not found.")]
    UnknownLineMagic(String),

    #[error("UsageError: Cell magic `%%{0}` not found.")]
    UnknownCellMagic(String),

    #[error("UsageError: {0}")]
    Usage(String),

    #[error("OSError: {0}")]
    Os(String),
}

impl DirectiveError {
    pub fn ename(&self) -> &'static str {
        match self {
            DirectiveError::Os(_) => "OSError",
            _ => "UsageError",
        }
    }

    pub fn evalue(&self) -> String {
        match self {
            DirectiveError::UnknownLineMagic(name) => {
                format!("Line magic function `%{}` not found.", name)
            }
            DirectiveError::UnknownCellMagic(name) => format!("Cell magic `%%{}` not found.", name),
            DirectiveError::Usage(msg) | DirectiveError::Os(msg) => msg.clone(),
        }
    }
}

/// Anything that ends a submission with `status: error`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Directive(#[from] DirectiveError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl ExecError {
    pub fn ename(&self) -> &'static str {
        match self {
            ExecError::Directive(e) => e.ename(),
            ExecError::Eval(e) => e.ename(),
        }
    }

    pub fn evalue(&self) -> String {
        match self {
            ExecError::Directive(e) => e.evalue(),
            ExecError::Eval(e) => e.evalue(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_error_names() {
        let err = EvalError::Name("x".to_string());
        assert_eq!(err.ename(), "NameError");
        assert_eq!(err.evalue(), "name 'x' is not defined");
        assert_eq!(err.to_string(), "NameError: name 'x' is not defined");
    }

    #[test]
    fn test_directive_error_names() {
        let err: ExecError = DirectiveError::UnknownCellMagic("nope".to_string()).into();
        assert_eq!(err.ename(), "UsageError");
        assert_eq!(err.evalue(), "Cell magic `%%nope` not found.");

        let err: ExecError = DirectiveError::Os("no such dir".to_string()).into();
        assert_eq!(err.ename(), "OSError");
    }
}
