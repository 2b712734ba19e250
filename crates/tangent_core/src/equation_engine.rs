use crate::traits::{DaeModel, Scalar, Signature};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes an input entry (flat index across all input blocks) onto the stack.
    LoadInput(usize),
    /// Pushes the current time onto the stack.
    LoadTime,
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
    Sin,
    Cos,
    Tanh,
    Exp,
    Ln,
    Sqrt,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `t`: Current time.
/// - `inputs`: All input blocks, flattened in block order (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the value left on the stack.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, t: T, inputs: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            // Compiled bytecode is well formed, so the stack never underflows.
            match *op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val).unwrap_or_else(T::nan)),
                OpCode::LoadInput(idx) => stack.push(inputs[idx]),
                OpCode::LoadTime => stack.push(t),
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop().unwrap_or_else(T::nan);
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(match *op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                unary => {
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(match unary {
                        OpCode::Sin => a.sin(),
                        OpCode::Cos => a.cos(),
                        OpCode::Tanh => a.tanh(),
                        OpCode::Exp => a.exp(),
                        OpCode::Ln => a.ln(),
                        OpCode::Sqrt => a.sqrt(),
                        _ => -a,
                    });
                }
            }
        }

        stack.pop().unwrap_or_else(T::zero)
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>), // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves names to flat input indices; `t` is reserved for time.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(input_blocks: &[&[&str]]) -> Result<Self> {
        let mut var_map = HashMap::new();
        for name in input_blocks.iter().flat_map(|block| block.iter()) {
            if *name == "t" {
                bail!("'t' is reserved for time and cannot name an input.");
            }
            let index = var_map.len();
            if var_map.insert(name.to_string(), index).is_some() {
                bail!("Input name '{}' is declared more than once.", name);
            }
        }
        Ok(Self { var_map })
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) if name == "t" => ops.push(OpCode::LoadTime),
            Expr::Variable(name) => {
                let idx = self
                    .var_map
                    .get(name)
                    .ok_or_else(|| anyhow!("Unknown variable: {}", name))?;
                ops.push(OpCode::LoadInput(*idx));
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator: {}", op),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator: {}", op),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tanh" => OpCode::Tanh,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    _ => bail!("Unknown function: {}", func),
                });
            }
        }
        Ok(())
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        bail!("Unexpected trailing input in '{}'.", input);
    }
    Ok(expr)
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
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '-' || d == '+') && num_str.ends_with(|e: char| e == 'e' || e == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .with_context(|| format!("Invalid number literal '{}'.", num_str))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => bail!("Unexpected character '{}'.", other),
            });
            chars.next();
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

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than '^', so -x^2 = -(x^2).
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: a^b^c = a^(b^c).
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
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => bail!("Expected ')' after argument of '{}'.", name),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => bail!("Expected ')'."),
                }
            }
            Some(token) => bail!("Unexpected token {:?}.", token),
            None => bail!("Unexpected end of expression."),
        }
    }
}

// --- ExpressionModel ---

/// A `DaeModel` compiled from expression strings.
///
/// Inputs are named per block; each output block is a list of expressions over
/// those names and the reserved time variable `t`. Because the VM is generic
/// over `Scalar`, the model evaluates in `f64` and in `Dual` alike.
#[derive(Debug, Clone)]
pub struct ExpressionModel {
    inputs: Vec<usize>,
    outputs: Vec<Vec<Bytecode>>,
}

impl ExpressionModel {
    pub fn new(input_blocks: &[&[&str]], output_blocks: &[&[&str]]) -> Result<Self> {
        let compiler = Compiler::new(input_blocks)?;
        let mut outputs = Vec::with_capacity(output_blocks.len());
        for (block_index, block) in output_blocks.iter().enumerate() {
            let mut compiled = Vec::with_capacity(block.len());
            for (entry, source) in block.iter().enumerate() {
                let bytecode = parse(source)
                    .and_then(|expr| compiler.compile(&expr))
                    .with_context(|| {
                        format!(
                            "Failed to build output block {}, entry {} ('{}').",
                            block_index, entry, source
                        )
                    })?;
                compiled.push(bytecode);
            }
            outputs.push(compiled);
        }
        Ok(Self {
            inputs: input_blocks.iter().map(|block| block.len()).collect(),
            outputs,
        })
    }

    /// Forward system with input blocks `(x, z, p)` and outputs `(ode, alg, quad)`.
    pub fn forward(
        states: &[&str],
        algebraics: &[&str],
        params: &[&str],
        ode: &[&str],
        alg: &[&str],
        quad: &[&str],
    ) -> Result<Self> {
        if ode.len() != states.len() {
            bail!(
                "Expected one ODE right-hand side per state ({}), got {}.",
                states.len(),
                ode.len()
            );
        }
        if alg.len() != algebraics.len() {
            bail!(
                "Expected one algebraic residual per algebraic state ({}), got {}.",
                algebraics.len(),
                alg.len()
            );
        }
        Self::new(&[states, algebraics, params], &[ode, alg, quad])
    }
}

impl<T: Scalar> DaeModel<T> for ExpressionModel {
    fn signature(&self) -> Signature {
        Signature::new(
            self.inputs.clone(),
            self.outputs.iter().map(Vec::len).collect(),
        )
    }

    fn apply(&self, t: T, inputs: &[&[T]], outputs: &mut [&mut [T]]) {
        let flat: Vec<T> = inputs.iter().flat_map(|block| block.iter().copied()).collect();
        let mut stack = Vec::with_capacity(16);
        for (target, equations) in outputs.iter_mut().zip(&self.outputs) {
            for (slot, eq) in target.iter_mut().zip(equations) {
                *slot = VM::execute(eq, t, &flat, &mut stack);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Expr, ExpressionModel};
    use crate::autodiff::Dual;
    use crate::traits::DaeModel;
    use approx::assert_relative_eq;

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let expr = parse("-x^2").expect("parse");
        assert_eq!(
            expr,
            Expr::Unary(
                '-',
                Box::new(Expr::Binary(
                    Box::new(Expr::Variable("x".into())),
                    '^',
                    Box::new(Expr::Number(2.0)),
                )),
            )
        );
    }

    #[test]
    fn parses_scientific_literals() {
        assert_eq!(parse("1.5e-3").expect("parse"), Expr::Number(1.5e-3));
    }

    #[test]
    fn evaluates_forward_system_in_f64_and_dual() {
        let model = ExpressionModel::forward(
            &["x"],
            &["z"],
            &["a"],
            &["a * x + t"],
            &["z - x^2"],
            &["exp(x)"],
        )
        .expect("model");

        let mut ode = [0.0];
        let mut alg = [0.0];
        let mut quad = [0.0];
        let inputs: [&[f64]; 3] = [&[2.0], &[3.0], &[-1.0]];
        model.apply(
            0.5,
            &inputs,
            &mut [&mut ode[..], &mut alg[..], &mut quad[..]],
        );
        assert_relative_eq!(ode[0], -1.5);
        assert_relative_eq!(alg[0], -1.0);
        assert_relative_eq!(quad[0], 2.0f64.exp());

        let x = [Dual::new(2.0, 1.0)];
        let z = [Dual::new(3.0, 0.0)];
        let a = [Dual::new(-1.0, 0.0)];
        let mut ode = [Dual::new(0.0, 0.0)];
        let mut alg = [Dual::new(0.0, 0.0)];
        let mut quad = [Dual::new(0.0, 0.0)];
        model.apply(
            Dual::new(0.5, 0.0),
            &[&x[..], &z[..], &a[..]],
            &mut [&mut ode[..], &mut alg[..], &mut quad[..]],
        );
        assert_relative_eq!(ode[0].eps, -1.0);
        assert_relative_eq!(alg[0].eps, -4.0);
        assert_relative_eq!(quad[0].eps, 2.0f64.exp());
    }

    #[test]
    fn reports_unknown_names_with_context() {
        let err = ExpressionModel::forward(&["x"], &[], &[], &["y * x"], &[], &[]).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Unknown variable: y"), "{message}");
        assert!(message.contains("output block 0"), "{message}");
    }

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        assert!(ExpressionModel::forward(&["x", "x"], &[], &[], &["1", "2"], &[], &[]).is_err());
        assert!(ExpressionModel::forward(&["t"], &[], &[], &["1"], &[], &[]).is_err());
    }

    #[test]
    fn rejects_mismatched_right_hand_sides() {
        let err = ExpressionModel::forward(&["x", "y"], &[], &[], &["y"], &[], &[]).unwrap_err();
        assert!(format!("{err}").contains("one ODE right-hand side per state"));
    }
}
