// Expression Evaluator
// Evaluates parsed conditions against a matrix binding

use crate::execution::matrix::MatrixBinding;
use crate::expression::lexer::{split_interpolation, Fragment};
use crate::expression::parser::{BinaryOp, Expr, ExprParser, ParseExprError};

use std::fmt;

/// Evaluation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Problems found when checking an expression against the declared dimensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// The expression names a dimension that is not declared
    UnknownDimension(String),
    /// The expression is malformed (syntax, unknown function, wrong arity)
    Invalid(String),
}

impl From<ParseExprError> for CheckError {
    fn from(err: ParseExprError) -> Self {
        CheckError::Invalid(err.to_string())
    }
}

/// Runtime value of an expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    String(String),
}

impl Value {
    /// Strings are truthy unless empty or spelled `false`
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::String(s) => s.clone(),
        }
    }
}

/// A parsed, reusable condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ParseExprError> {
        Ok(Self {
            source: source.trim().to_string(),
            expr: ExprParser::parse_str(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Verify references and function calls against the declared dimensions
    pub fn check<S: AsRef<str>>(&self, dimensions: &[S]) -> Result<(), CheckError> {
        check_expr(&self.expr, dimensions)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Evaluate a condition against a binding.
///
/// A condition that passed [`Condition::check`] for the dimensions of
/// `binding` never returns an error.
pub fn evaluate(condition: &Condition, binding: &MatrixBinding) -> Result<bool, EvalError> {
    Evaluator::new(binding)
        .eval(&condition.expr)
        .map(|v| v.is_truthy())
}

/// Check every `${{ }}` fragment of a template string
pub fn check_template<S: AsRef<str>>(template: &str, dimensions: &[S]) -> Result<(), CheckError> {
    for fragment in split_interpolation(template) {
        if let Fragment::Expression(body) = fragment {
            let expr = ExprParser::parse_str(&body)?;
            check_expr(&expr, dimensions)?;
        }
    }
    Ok(())
}

/// Render a template string, replacing each `${{ expr }}` with its value
pub fn render_template(template: &str, binding: &MatrixBinding) -> Result<String, EvalError> {
    let mut rendered = String::with_capacity(template.len());
    let evaluator = Evaluator::new(binding);

    for fragment in split_interpolation(template) {
        match fragment {
            Fragment::Text(text) => rendered.push_str(&text),
            Fragment::Expression(body) => {
                let expr = ExprParser::parse_str(&body)
                    .map_err(|e| EvalError::new(format!("'{}': {}", body, e)))?;
                rendered.push_str(&evaluator.eval(&expr)?.as_string());
            }
        }
    }

    Ok(rendered)
}

/// Function names are case-insensitive; returns the accepted arity range
fn function_arity(name: &str) -> Option<(usize, usize)> {
    match name.to_lowercase().as_str() {
        "eq" | "ne" | "startswith" | "endswith" | "contains" => Some((2, 2)),
        "not" => Some((1, 1)),
        "and" | "or" => Some((2, usize::MAX)),
        "in" => Some((2, usize::MAX)),
        _ => None,
    }
}

fn check_expr<S: AsRef<str>>(expr: &Expr, dimensions: &[S]) -> Result<(), CheckError> {
    match expr {
        Expr::Reference(name) => {
            if dimensions.iter().any(|d| d.as_ref() == name) {
                Ok(())
            } else {
                Err(CheckError::UnknownDimension(name.clone()))
            }
        }
        Expr::FunctionCall { name, args } => {
            let Some((min, max)) = function_arity(name) else {
                return Err(CheckError::Invalid(format!("unknown function '{}'", name)));
            };
            if args.len() < min || args.len() > max {
                return Err(CheckError::Invalid(format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    if min == max {
                        min.to_string()
                    } else {
                        format!("at least {}", min)
                    },
                    args.len()
                )));
            }
            args.iter().try_for_each(|arg| check_expr(arg, dimensions))
        }
        Expr::Not(inner) => check_expr(inner, dimensions),
        Expr::Binary { left, right, .. } => {
            check_expr(left, dimensions)?;
            check_expr(right, dimensions)
        }
        Expr::Bool(_) | Expr::String(_) => Ok(()),
    }
}

/// Tree-walking evaluator bound to one matrix binding
pub struct Evaluator<'a> {
    binding: &'a MatrixBinding,
}

impl<'a> Evaluator<'a> {
    pub fn new(binding: &'a MatrixBinding) -> Self {
        Self { binding }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Reference(name) => self
                .binding
                .get(name)
                .map(|v| Value::String(v.to_string()))
                .ok_or_else(|| EvalError::new(format!("unknown dimension '{}'", name))),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::FunctionCall { name, args } => self.eval_function(name, args),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, EvalError> {
        match op {
            BinaryOp::And => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::Or => {
                if self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::Eq => Ok(Value::Bool(self.values_equal(left, right)?)),
            BinaryOp::Ne => Ok(Value::Bool(!self.values_equal(left, right)?)),
        }
    }

    fn values_equal(&self, left: &Expr, right: &Expr) -> Result<bool, EvalError> {
        let left = self.eval(left)?;
        let right = self.eval(right)?;
        Ok(match (&left, &right) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => left.as_string() == right.as_string(),
        })
    }

    fn eval_function(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let text = |i: usize| values[i].as_string();
        let expect_arity = |n: usize| {
            if values.len() == n {
                Ok(())
            } else {
                Err(EvalError::new(format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    n,
                    values.len()
                )))
            }
        };

        let result = match name.to_lowercase().as_str() {
            "eq" => {
                expect_arity(2)?;
                text(0) == text(1)
            }
            "ne" => {
                expect_arity(2)?;
                text(0) != text(1)
            }
            "startswith" => {
                expect_arity(2)?;
                text(0).starts_with(&text(1))
            }
            "endswith" => {
                expect_arity(2)?;
                text(0).ends_with(&text(1))
            }
            "contains" => {
                expect_arity(2)?;
                text(0).contains(&text(1))
            }
            "not" => {
                expect_arity(1)?;
                !values[0].is_truthy()
            }
            "and" => values.iter().all(Value::is_truthy),
            "or" => values.iter().any(Value::is_truthy),
            "in" => {
                let Some((needle, haystack)) = values.split_first() else {
                    return Err(EvalError::new("function 'in' needs arguments"));
                };
                let needle = needle.as_string();
                haystack.iter().any(|v| v.as_string() == needle)
            }
            _ => return Err(EvalError::new(format!("unknown function '{}'", name))),
        };

        Ok(Value::Bool(result))
    }
}
