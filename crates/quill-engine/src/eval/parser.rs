//! Recursive-descent parser producing statements and expressions.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons, `+ -`,
//! `* / // %`, unary `- +`, `**` (right associative), calls and atoms.

use super::lexer::{Token, tokenize};
use super::value::{BinOp, CmpOp, Value};
use crate::error::EvalError;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "del", "pass", "True", "False", "None", "if", "else", "for", "while",
    "def", "class", "return", "import", "from", "in", "is", "lambda",
];

/// Deepest expression tree the parser builds. Bounds recursion in the
/// parser, the evaluator and drop.
pub const MAX_EXPR_DEPTH: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign(Vec<String>, Expr),
    AugAssign(String, BinOp, Expr),
    Del(Vec<String>),
    Pass,
}

/// Parse `source` as exactly one expression.
pub fn parse_expression(source: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser::new(tokenize(source)?);
    let expr = parser.expression()?;
    parser.skip_newlines();
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse `source` as a sequence of statements.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, EvalError> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut statements = Vec::new();
    parser.skip_newlines();
    while !parser.at_eof() {
        statements.push(parser.statement()?);
        parser.end_of_statement()?;
        parser.skip_newlines();
    }
    Ok(statements)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Depth of the expression node being built.
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Account for one more level of nesting. Callers undo it with `ascend`.
    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(EvalError::Syntax("expression too deeply nested".to_string()));
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        *self.peek() == Token::Eof
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(o) if *o == op)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == keyword)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let matched = self.at_op(op);
        if matched {
            self.pos += 1;
        }
        matched
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let matched = self.at_keyword(keyword);
        if matched {
            self.pos += 1;
        }
        matched
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Token::Newline {
            self.pos += 1;
        }
    }

    fn expect_eof(&self) -> Result<(), EvalError> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn end_of_statement(&mut self) -> Result<(), EvalError> {
        match self.peek() {
            Token::Newline => {
                self.pos += 1;
                Ok(())
            }
            Token::Eof => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn unexpected(&self) -> EvalError {
        let what = match self.peek() {
            Token::Int(i) => i.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(_) => "string literal".to_string(),
            Token::Name(n) => n.clone(),
            Token::Op(op) => op.to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of input".to_string(),
        };
        EvalError::Syntax(format!("invalid syntax near '{}'", what))
    }

    fn statement(&mut self) -> Result<Stmt, EvalError> {
        if self.eat_keyword("pass") {
            return Ok(Stmt::Pass);
        }

        if self.eat_keyword("del") {
            let mut names = vec![self.target()?];
            while self.eat_op(",") {
                names.push(self.target()?);
            }
            return Ok(Stmt::Del(names));
        }

        if let Token::Name(name) = self.peek().clone()
            && let Token::Op(op) = self.peek_at(1)
            && let Some(bin) = augmented(op)
        {
            self.target()?;
            self.pos += 1;
            let value = self.expression()?;
            return Ok(Stmt::AugAssign(name, bin, value));
        }

        // `a = b = expr` binds every target.
        let mut targets = Vec::new();
        while matches!(self.peek(), Token::Name(_)) && matches!(self.peek_at(1), Token::Op("=")) {
            targets.push(self.target()?);
            self.pos += 1;
        }

        let value = self.expression()?;
        if targets.is_empty() {
            Ok(Stmt::Expr(value))
        } else {
            Ok(Stmt::Assign(targets, value))
        }
    }

    /// A plain, non-keyword name.
    fn target(&mut self) -> Result<String, EvalError> {
        match self.peek().clone() {
            Token::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn expression(&mut self) -> Result<Expr, EvalError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        let mut levels = 0;
        while self.eat_keyword("or") {
            self.descend()?;
            levels += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.ascend(levels);
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.not_expr()?;
        let mut levels = 0;
        while self.eat_keyword("and") {
            self.descend()?;
            levels += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.ascend(levels);
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.eat_keyword("not") {
            self.descend()?;
            let inner = self.not_expr()?;
            self.ascend(1);
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.sum()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Token::Op("==") => CmpOp::Eq,
                Token::Op("!=") => CmpOp::Ne,
                Token::Op("<") => CmpOp::Lt,
                Token::Op("<=") => CmpOp::Le,
                Token::Op(">") => CmpOp::Gt,
                Token::Op(">=") => CmpOp::Ge,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            levels += 1;
            let right = self.sum()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        self.ascend(levels);
        Ok(left)
    }

    fn sum(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.term()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinOp::Add,
                Token::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            levels += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.ascend(levels);
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinOp::Mul,
                Token::Op("/") => BinOp::Div,
                Token::Op("//") => BinOp::FloorDiv,
                Token::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            levels += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.ascend(levels);
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        let wrap: fn(Box<Expr>) -> Expr = if self.eat_op("-") {
            Expr::Neg
        } else if self.eat_op("+") {
            Expr::Pos
        } else {
            return self.power();
        };
        self.descend()?;
        let inner = self.unary()?;
        self.ascend(1);
        Ok(wrap(Box::new(inner)))
    }

    fn power(&mut self) -> Result<Expr, EvalError> {
        let base = self.atom()?;
        if self.eat_op("**") {
            // Right associative, and binds tighter than a unary minus on its left.
            self.descend()?;
            let exponent = self.unary()?;
            self.ascend(1);
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.peek().clone() {
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Int(i)))
            }
            Token::Float(f) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Float(f)))
            }
            Token::Str(s) => {
                self.pos += 1;
                // Adjacent literals concatenate.
                let mut text = s;
                while let Token::Str(next) = self.peek().clone() {
                    self.pos += 1;
                    text.push_str(&next);
                }
                Ok(Expr::Literal(Value::Str(text)))
            }
            Token::Name(name) => match name.as_str() {
                "True" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(true)))
                }
                "False" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(false)))
                }
                "None" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::None))
                }
                _ => {
                    let name = self.target()?;
                    if self.eat_op("(") {
                        self.descend()?;
                        let args = self.arguments()?;
                        self.ascend(1);
                        return Ok(Expr::Call(name, args));
                    }
                    Ok(Expr::Name(name))
                }
            },
            Token::Op("(") => {
                self.advance();
                self.descend()?;
                let inner = self.expression()?;
                self.ascend(1);
                if !self.eat_op(")") {
                    return Err(self.unexpected());
                }
                Ok(inner)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Call arguments after the opening parenthesis.
    fn arguments(&mut self) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.eat_op(")") {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat_op(")") {
                return Ok(args);
            }
            if !self.eat_op(",") {
                return Err(self.unexpected());
            }
            // Trailing comma.
            if self.eat_op(")") {
                return Ok(args);
            }
        }
    }
}

fn augmented(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Box<Expr> {
        Box::new(Expr::Literal(Value::Int(i)))
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            parse_expression("1 + 2 * 3").unwrap(),
            Expr::Binary(
                BinOp::Add,
                int(1),
                Box::new(Expr::Binary(BinOp::Mul, int(2), int(3)))
            )
        );
        // -2 ** 2 == -(2 ** 2)
        assert_eq!(
            parse_expression("-2 ** 2").unwrap(),
            Expr::Neg(Box::new(Expr::Binary(BinOp::Pow, int(2), int(2))))
        );
    }

    #[test]
    fn test_power_is_right_associative() {
        assert_eq!(
            parse_expression("2 ** 3 ** 2").unwrap(),
            Expr::Binary(
                BinOp::Pow,
                int(2),
                Box::new(Expr::Binary(BinOp::Pow, int(3), int(2)))
            )
        );
    }

    #[test]
    fn test_assignment_is_not_an_expression() {
        assert!(matches!(parse_expression("x = 1"), Err(EvalError::Syntax(_))));
        assert_eq!(
            parse_program("x = y = 1").unwrap(),
            vec![Stmt::Assign(
                vec!["x".to_string(), "y".to_string()],
                Expr::Literal(Value::Int(1))
            )]
        );
    }

    #[test]
    fn test_multiple_statements() {
        let program = parse_program("x = 1; x += 2\ndel x\npass").unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(
            program[1],
            Stmt::AugAssign("x".to_string(), BinOp::Add, Expr::Literal(Value::Int(2)))
        );
        assert_eq!(program[2], Stmt::Del(vec!["x".to_string()]));
        assert_eq!(program[3], Stmt::Pass);
    }

    #[test]
    fn test_two_lines_are_not_one_expression() {
        assert!(parse_expression("1\n2").is_err());
        assert!(parse_expression("(1 +\n 2)").is_ok());
    }

    #[test]
    fn test_calls() {
        assert_eq!(
            parse_expression("max(1, 2,)").unwrap(),
            Expr::Call(
                "max".to_string(),
                vec![Expr::Literal(Value::Int(1)), Expr::Literal(Value::Int(2))]
            )
        );
        assert!(parse_expression("max(1 2)").is_err());
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let chain = vec!["1"; MAX_EXPR_DEPTH / 2].join(" + ");
        assert!(parse_expression(&chain).is_ok());

        let chain = vec!["1"; 100_000].join(" + ");
        assert_eq!(
            parse_expression(&chain),
            Err(EvalError::Syntax("expression too deeply nested".to_string()))
        );

        let negations = format!("{}1", "-".repeat(100_000));
        assert!(matches!(parse_expression(&negations), Err(EvalError::Syntax(_))));

        let powers = vec!["2"; 100_000].join(" ** ");
        assert!(matches!(parse_program(&powers), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_deep_parentheses_are_a_syntax_error() {
        let deep = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        assert!(matches!(parse_expression(&deep), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_program(&deep), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_keywords_cannot_be_assigned() {
        assert!(parse_program("None = 1").is_err());
        assert!(parse_program("if = 1").is_err());
    }
}
