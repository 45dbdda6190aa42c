use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde_json::{Number, Value};

use behavior_core::{Error, ExecutionContext};

/// Expression parse or evaluation failure.
///
/// Instances swallow these for transition conditions (treated as false) and
/// propagate them for `$expr` action values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("Unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Function '{0}' expects {1} arguments, got {2}")]
    Arity(&'static str, usize, usize),
    #[error("Type error: {0}")]
    Type(String),
}

impl From<EvalError> for Error {
    fn from(err: EvalError) -> Self {
        Error::Expr(err.to_string())
    }
}

type FnResult = std::result::Result<Value, EvalError>;
type Result<T> = std::result::Result<T, EvalError>;

/// Evaluates guard and assignment expressions against an instance's variable
/// scope. Evaluation is pure: conditions can never mutate the scope.
///
/// The grammar covers dotted-path identifiers, number/string/bool/null
/// literals, arithmetic, comparison, `&& || !`, grouping and whitelisted
/// function calls. The reserved identifiers `stateTime` and `totalTime` read
/// the instance timers unless shadowed by a variable.
pub struct Evaluator {
    functions: HashMap<String, Arc<dyn Fn(&[Value]) -> FnResult + Send + Sync>>,
}

impl Evaluator {
    pub fn new() -> Self {
        let mut evaluator = Self {
            functions: HashMap::new(),
        };
        evaluator.register("distance", builtin_distance);
        evaluator.register("random", builtin_random);
        evaluator.register("abs", builtin_abs);
        evaluator.register("min", builtin_min);
        evaluator.register("max", builtin_max);
        evaluator.register("floor", builtin_floor);
        evaluator
    }

    /// Adds (or replaces) a callable in the function whitelist.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> FnResult + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn evaluate(&self, source: &str, context: &ExecutionContext) -> Result<Value> {
        let tokens = tokenize(source)?;
        let ast = Parser::new(tokens).parse()?;
        self.eval(&ast, context)
    }

    pub fn evaluate_bool(&self, source: &str, context: &ExecutionContext) -> Result<bool> {
        Ok(truthy(&self.evaluate(source, context)?))
    }

    fn eval(&self, expr: &Expr, context: &ExecutionContext) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(path) => self.resolve_var(path, context),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner, context)?;
                match op {
                    UnOp::Neg => number(-as_number(&value)?),
                    UnOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, context),
            Expr::Call(name, args) => {
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, context)?);
                }
                function(&values)
            }
        }
    }

    fn resolve_var(&self, path: &str, context: &ExecutionContext) -> Result<Value> {
        if let Some(value) = context.get(path) {
            return Ok(value.clone());
        }
        match path {
            "stateTime" => number(context.state_time),
            "totalTime" => number(context.total_time),
            _ => Err(EvalError::UnknownVariable(path.to_string())),
        }
    }

    fn eval_binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        context: &ExecutionContext,
    ) -> Result<Value> {
        // Logical operators short-circuit; everything else is strict.
        match op {
            BinOp::And => {
                if !truthy(&self.eval(lhs, context)?) {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(truthy(&self.eval(rhs, context)?)));
            }
            BinOp::Or => {
                if truthy(&self.eval(lhs, context)?) {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(truthy(&self.eval(rhs, context)?)));
            }
            _ => {}
        }

        let left = self.eval(lhs, context)?;
        let right = self.eval(rhs, context)?;
        match op {
            BinOp::Add => add(&left, &right),
            BinOp::Sub => number(as_number(&left)? - as_number(&right)?),
            BinOp::Mul => number(as_number(&left)? * as_number(&right)?),
            BinOp::Div => number(as_number(&left)? / as_number(&right)?),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                Ok(Value::Bool(compare(op, &left, &right)?))
            }
            BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type("expression produced a non-finite number".into()))
}

fn as_number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| EvalError::Type(format!("expected a number, got {}", type_name(value))))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::String(_), _) | (_, Value::String(_)) => {
            Ok(Value::String(format!("{}{}", text(left), text(right))))
        }
        _ => number(as_number(left)? + as_number(right)?),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<bool> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            _ => unreachable!("compare only handles ordering operators"),
        });
    }
    let a = as_number(left)?;
    let b = as_number(right)?;
    Ok(match op {
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        _ => unreachable!("compare only handles ordering operators"),
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn check_arity(name: &'static str, expected: usize, args: &[Value]) -> Result<()> {
    if args.len() != expected {
        return Err(EvalError::Arity(name, expected, args.len()));
    }
    Ok(())
}

/// Accepts `{x, y}` / `{x, y, z}` objects or numeric arrays; the shorter
/// point is padded with zeros.
fn point(value: &Value) -> Result<Vec<f64>> {
    match value {
        Value::Object(map) => {
            let mut coords = Vec::new();
            for axis in ["x", "y", "z"] {
                match map.get(axis) {
                    Some(v) => coords.push(as_number(v)?),
                    None => break,
                }
            }
            if coords.is_empty() {
                return Err(EvalError::Type("expected a point with x/y fields".into()));
            }
            Ok(coords)
        }
        Value::Array(items) => items.iter().map(as_number).collect(),
        other => Err(EvalError::Type(format!(
            "expected a point, got {}",
            type_name(other)
        ))),
    }
}

fn builtin_distance(args: &[Value]) -> FnResult {
    check_arity("distance", 2, args)?;
    let mut a = point(&args[0])?;
    let mut b = point(&args[1])?;
    let dims = a.len().max(b.len());
    a.resize(dims, 0.0);
    b.resize(dims, 0.0);
    let sum: f64 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
    number(sum.sqrt())
}

fn builtin_random(args: &[Value]) -> FnResult {
    check_arity("random", 2, args)?;
    let min = as_number(&args[0])?;
    let max = as_number(&args[1])?;
    let t = rand::thread_rng().r#gen::<f64>();
    number(min + (max - min) * t)
}

fn builtin_abs(args: &[Value]) -> FnResult {
    check_arity("abs", 1, args)?;
    number(as_number(&args[0])?.abs())
}

fn builtin_min(args: &[Value]) -> FnResult {
    check_arity("min", 2, args)?;
    number(as_number(&args[0])?.min(as_number(&args[1])?))
}

fn builtin_max(args: &[Value]) -> FnResult {
    check_arity("max", 2, args)?;
    number(as_number(&args[0])?.max(as_number(&args[1])?))
}

fn builtin_floor(args: &[Value]) -> FnResult {
    check_arity("floor", 1, args)?;
    number(as_number(&args[0])?.floor())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut lexeme = String::new();
                let mut seen_dot = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        lexeme.push(d);
                    } else if d == '.' && !seen_dot {
                        seen_dot = true;
                        lexeme.push(d);
                    } else {
                        break;
                    }
                    chars.next();
                }
                let value = lexeme
                    .parse::<f64>()
                    .map_err(|_| EvalError::UnexpectedToken(lexeme))?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut lexeme = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        lexeme.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match lexeme.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(lexeme),
                });
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(d) = chars.next() {
                    match d {
                        '\\' => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err(EvalError::UnterminatedString),
                        },
                        _ if d == quote => {
                            closed = true;
                            break;
                        }
                        _ => text.push(d),
                    }
                }
                if !closed {
                    return Err(EvalError::UnterminatedString);
                }
                tokens.push(Token::Str(text));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(EvalError::UnexpectedChar('='));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::And);
                } else {
                    return Err(EvalError::UnexpectedChar('&'));
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Or);
                } else {
                    return Err(EvalError::UnexpectedChar('|'));
                }
            }
            other => return Err(EvalError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

/// Recursive descent, precedence low to high:
/// `||` < `&&` < `== !=` < `< > <= >=` < `+ -` < `* /` < unary < primary.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.or_expr()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(EvalError::UnexpectedToken(format!("{:?}", token))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.advance() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(EvalError::UnexpectedToken(format!("{:?}", found))),
            None => Err(EvalError::UnexpectedEnd),
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut expr = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            expr = Expr::Binary(BinOp::Or, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut expr = self.equality()?;
        while self.eat(&Token::And) {
            let rhs = self.equality()?;
            expr = Expr::Binary(BinOp::And, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Not) {
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| EvalError::Type("non-finite literal".into()))?,
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(Token::RParen)?;
                            break;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(token) => Err(EvalError::UnexpectedToken(format!("{:?}", token))),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}
