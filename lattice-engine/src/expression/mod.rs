// Expression Engine Module
// Step conditions (`if:`) and ${{ }} interpolation over matrix bindings

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    check_template, evaluate, render_template, CheckError, Condition, EvalError, Evaluator, Value,
};
pub use lexer::{split_interpolation, Fragment, LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};
