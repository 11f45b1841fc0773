use crate::dataset::Dataset;
use crate::error::{Result, SymNetError};
use crate::traits::Scalar;
use std::collections::HashMap;

fn formula_err(message: impl Into<String>) -> SymNetError {
    SymNetError::Formula(message.into())
}

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes the value of an input variable (by index into the variable list).
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes a^n for a literal integer exponent.
    PowI(i32),
    Sin,
    Cos,
    Exp,
    /// Pops top value (a), pushes 1 / (1 + exp(-a)).
    Sigmoid,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine. Stateless; the caller supplies the stack buffer.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], stack: &mut Vec<T>) -> Result<T> {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::constant(val)),
                OpCode::LoadVar(idx) => {
                    let value = vars
                        .get(idx)
                        .copied()
                        .ok_or_else(|| formula_err(format!("variable index {idx} out of range")))?;
                    stack.push(value);
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                OpCode::PowI(n) => {
                    let a = pop(stack)?;
                    stack.push(a.powi(n));
                }
                OpCode::Sin => {
                    let a = pop(stack)?;
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = pop(stack)?;
                    stack.push(a.cos());
                }
                OpCode::Exp => {
                    let a = pop(stack)?;
                    stack.push(a.exp());
                }
                OpCode::Sigmoid => {
                    let a = pop(stack)?;
                    stack.push(a.sigmoid());
                }
                OpCode::Neg => {
                    let a = pop(stack)?;
                    stack.push(-a);
                }
            }
        }

        let result = pop(stack)?;
        if !stack.is_empty() {
            return Err(formula_err("bytecode left extra values on the stack"));
        }
        Ok(result)
    }
}

fn pop<T>(stack: &mut Vec<T>) -> Result<T> {
    stack.pop().ok_or_else(|| formula_err("stack underflow"))
}

// --- AST & Compiler ---

/// Abstract syntax tree for formulas.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // sin(x), exp(x), ...
}

/// Compiles an [`Expr`] into [`Bytecode`], resolving variable names to indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let idx = self
                    .var_map
                    .get(name)
                    .ok_or_else(|| formula_err(format!("unknown variable: {name}")))?;
                ops.push(OpCode::LoadVar(*idx));
            }
            Expr::Binary(left, '^', right) => {
                self.compile_recursive(left, ops)?;
                match integer_literal(right) {
                    Some(n) => ops.push(OpCode::PowI(n)),
                    None => {
                        self.compile_recursive(right, ops)?;
                        ops.push(OpCode::Pow);
                    }
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    _ => return Err(formula_err(format!("unknown binary operator: {op}"))),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => return Err(formula_err(format!("unknown unary operator: {op}"))),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "sigmoid" => OpCode::Sigmoid,
                    _ => return Err(formula_err(format!("unknown function: {func}"))),
                });
            }
        }
        Ok(())
    }
}

fn integer_literal(expr: &Expr) -> Option<i32> {
    let value = match expr {
        Expr::Number(n) => *n,
        Expr::Unary('-', inner) => match inner.as_ref() {
            Expr::Number(n) => -*n,
            _ => return None,
        },
        _ => return None,
    };
    let rounded = value.round();
    (rounded == value && rounded.abs() <= i32::MAX as f64).then(|| rounded as i32)
}

// --- Parser ---

/// Parses a formula into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(formula_err(format!("unexpected trailing token {token:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Optional exponent: e.g. 1.5e-3
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse()
                .map_err(|_| formula_err(format!("malformed number: {text}")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(formula_err(format!("unexpected character '{c}'"))),
            });
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(formula_err("expected ')'")),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some('+'),
            Some(Token::Minus) => Some('-'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some('*'),
            Some(Token::Slash) => Some('/'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    /// `^` binds tighter than unary minus and is right-associative.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(formula_err(format!("unexpected token {token:?}"))),
            None => Err(formula_err("unexpected end of formula")),
        }
    }
}

// --- Formula ---

/// A compiled formula over named input variables.
#[derive(Debug, Clone)]
pub struct Formula {
    var_names: Vec<String>,
    bytecode: Bytecode,
}

impl Formula {
    pub fn compile(source: &str, var_names: &[String]) -> Result<Self> {
        let ast = parse(source)?;
        let bytecode = Compiler::new(var_names).compile(&ast)?;
        Ok(Self {
            var_names: var_names.to_vec(),
            bytecode,
        })
    }

    pub fn eval<T: Scalar>(&self, vars: &[T]) -> Result<T> {
        if vars.len() != self.var_names.len() {
            return Err(formula_err(format!(
                "formula takes {} variable(s), got {}",
                self.var_names.len(),
                vars.len()
            )));
        }
        let mut stack = Vec::with_capacity(16);
        VM::execute(&self.bytecode, vars, &mut stack)
    }

    /// Mean squared error of the formula against a dataset.
    pub fn mse(&self, data: &Dataset) -> Result<f64> {
        let mut stack = Vec::with_capacity(16);
        let mut total = 0.0;
        for n in 0..data.len() {
            let x = data.row(n);
            if x.len() != self.var_names.len() {
                return Err(SymNetError::DatasetShape {
                    expected: self.var_names.len(),
                    found: x.len(),
                });
            }
            let residual = VM::execute(&self.bytecode, x.as_slice(), &mut stack)? - data.targets()[n];
            total += residual * residual;
        }
        Ok(total / data.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn eval(source: &str, x: &[f64]) -> f64 {
        let vars = names(&["x", "y"][..x.len()]);
        Formula::compile(source, &vars).unwrap().eval(x).unwrap()
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[]), 7.0);
        assert_eq!(eval("-x^2", &[3.0]), -9.0);
        assert_eq!(eval("2^3^2", &[]), 512.0);
        assert_eq!(eval("8 / 4 / 2", &[]), 1.0);
        assert_eq!(eval("(x)*(y) - -1", &[2.0, 5.0]), 11.0);
    }

    #[test]
    fn functions_and_integer_powers() {
        assert!((eval("sin(x)", &[0.5]) - 0.5_f64.sin()).abs() < 1e-15);
        assert!((eval("sigmoid(0)", &[]) - 0.5).abs() < 1e-15);
        assert_eq!(eval("(x)^2", &[-3.0]), 9.0);
        assert_eq!(eval("exp(0) + cos(0)", &[]), 2.0);
    }

    #[test]
    fn integer_exponent_compiles_to_powi() {
        let code = Compiler::new(&names(&["x"]))
            .compile(&parse("(x)^2").unwrap())
            .unwrap();
        assert_eq!(code.ops, vec![OpCode::LoadVar(0), OpCode::PowI(2)]);
    }

    #[test]
    fn numbers_with_exponents() {
        assert!((eval("1.5e-3 * 2", &[]) - 3e-3).abs() < 1e-18);
        assert_eq!(eval("2E2", &[]), 200.0);
    }

    #[test]
    fn formula_evaluates_on_dual_numbers() {
        let formula = Formula::compile("x * sin(x)", &names(&["x"])).unwrap();
        let out = formula.eval(&[Dual::variable(1.0)]).unwrap();
        assert!((out.eps - (1.0_f64.sin() + 1.0_f64.cos())).abs() < 1e-14);
    }

    #[test]
    fn malformed_input_is_reported() {
        let vars = names(&["x"]);
        assert_err_contains(Formula::compile("x + z", &vars), "unknown variable: z");
        assert_err_contains(Formula::compile("tan(x)", &vars), "unknown function: tan");
        assert_err_contains(Formula::compile("(x + 1", &vars), "expected ')'");
        assert_err_contains(Formula::compile("x $ 1", &vars), "unexpected character");
        assert_err_contains(Formula::compile("1.2.3", &vars), "malformed number");
        assert_err_contains(Formula::compile("x 1", &vars), "trailing token");
        assert_err_contains(Formula::compile("", &vars), "unexpected end");
    }

    #[test]
    fn eval_checks_variable_count() {
        let formula = Formula::compile("x", &names(&["x"])).unwrap();
        assert_err_contains(formula.eval(&[1.0, 2.0]), "takes 1 variable(s), got 2");
    }
}
