//! Tokenizer for ordinary code.

use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Op(&'static str),
    /// End of a logical line (`\n` or `;` outside brackets).
    Newline,
    Eof,
}

/// Operators, longest first so that `**=` wins over `**` and `*`.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*",
    "/", "%", "<", ">", "=", "(", ")", ",",
];

/// Deepest bracket nesting accepted, as in CPython.
pub const MAX_PAREN_DEPTH: usize = 200;

pub fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c == '#' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        if c == '\n' || c == ';' {
            if depth == 0 && !matches!(tokens.last(), None | Some(Token::Newline)) {
                tokens.push(Token::Newline);
            }
            pos += 1;
            continue;
        }

        if c == '\\' && chars.get(pos + 1) == Some(&'\n') {
            pos += 2;
            continue;
        }

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).is_some_and(char::is_ascii_digit)) {
            let (token, next) = number(&chars, pos)?;
            tokens.push(token);
            pos = next;
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, next) = string(&chars, pos)?;
            tokens.push(Token::Str(text));
            pos = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            tokens.push(Token::Name(chars[start..pos].iter().collect()));
            continue;
        }

        let op = OPERATORS.iter().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, oc)| chars.get(pos + i) == Some(&oc))
        });
        match op {
            Some(op) => {
                match *op {
                    "(" => {
                        depth += 1;
                        if depth > MAX_PAREN_DEPTH {
                            return Err(EvalError::Syntax(
                                "too many nested parentheses".to_string(),
                            ));
                        }
                    }
                    ")" => depth = depth.saturating_sub(1),
                    _ => {}
                }
                tokens.push(Token::Op(op));
                pos += op.len();
            }
            None => {
                return Err(EvalError::Syntax(format!("invalid character '{}'", c)));
            }
        }
    }

    if depth > 0 {
        return Err(EvalError::Syntax("'(' was never closed".to_string()));
    }
    if !matches!(tokens.last(), None | Some(Token::Newline)) {
        tokens.push(Token::Newline);
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

fn number(chars: &[char], start: usize) -> Result<(Token, usize), EvalError> {
    let mut pos = start;
    let mut is_float = false;

    while pos < chars.len() {
        let c = chars[pos];
        if c.is_ascii_digit() || c == '_' {
            pos += 1;
        } else if c == '.' && !is_float {
            is_float = true;
            pos += 1;
        } else if (c == 'e' || c == 'E')
            && chars
                .get(pos + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
        {
            is_float = true;
            pos += 2;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            break;
        } else {
            break;
        }
    }

    let text: String = chars[start..pos].iter().filter(|c| **c != '_').collect();
    let token = if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| EvalError::Syntax(format!("invalid decimal literal '{}'", text)))?
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| EvalError::Overflow(format!("integer literal too large: {}", text)))?
    };
    Ok((token, pos))
}

fn string(chars: &[char], start: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut pos = start + 1;

    while pos < chars.len() {
        match chars[pos] {
            c if c == quote => return Ok((text, pos + 1)),
            '\n' => break,
            '\\' => {
                let escaped = chars.get(pos + 1).copied();
                match escaped {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some('\\') => text.push('\\'),
                    Some('\'') => text.push('\''),
                    Some('"') => text.push('"'),
                    Some(other) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => break,
                }
                pos += 2;
            }
            c => {
                text.push(c);
                pos += 1;
            }
        }
    }

    Err(EvalError::Syntax("unterminated string literal".to_string()))
}
