use std::fmt;

use et_core::{Op1, Op2};

/// Scalar expression evaluated once per cell of a tensor lambda.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Const(f64),
    /// Coordinate along the named result dimension.
    Dim(String),
    /// Scalar value of the binding with this position.
    Binding(usize),
    Unary(Op1, Box<ScalarExpr>),
    Binary(Op2, Box<ScalarExpr>, Box<ScalarExpr>),
    /// Cell of a tensor binding; one index expression per source dimension.
    Peek {
        binding: usize,
        dims: Vec<(String, ScalarExpr)>,
    },
}

impl ScalarExpr {
    #[must_use]
    pub fn dim(name: &str) -> Self {
        Self::Dim(name.to_string())
    }

    #[must_use]
    pub fn unary(op: Op1, arg: Self) -> Self {
        Self::Unary(op, Box::new(arg))
    }

    #[must_use]
    pub fn binary(op: Op2, lhs: Self, rhs: Self) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    #[must_use]
    pub fn peek(binding: usize, dims: Vec<(&str, ScalarExpr)>) -> Self {
        Self::Peek {
            binding,
            dims: dims
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
        }
    }

    /// True when the expression only reads lambda coordinates and constants.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Const(_) | Self::Dim(_) => true,
            Self::Binding(_) | Self::Peek { .. } => false,
            Self::Unary(_, arg) => arg.is_closed(),
            Self::Binary(_, lhs, rhs) => lhs.is_closed() && rhs.is_closed(),
        }
    }

    fn max_binding(&self) -> Option<usize> {
        match self {
            Self::Const(_) | Self::Dim(_) => None,
            Self::Binding(idx) => Some(*idx),
            Self::Unary(_, arg) => arg.max_binding(),
            Self::Binary(_, lhs, rhs) => lhs.max_binding().max(rhs.max_binding()),
            Self::Peek { binding, dims } => dims
                .iter()
                .filter_map(|(_, expr)| expr.max_binding())
                .chain(std::iter::once(*binding))
                .max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprOp {
    Const(f64),
    Dim(usize),
    Binding(usize),
    Unary(Op1),
    Binary(Op2),
    /// Pops one value per named dimension (in order) and pushes the cell.
    Peek { binding: usize, dims: Vec<String> },
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(value) => write!(f, "c{:016x}", value.to_bits()),
            Self::Dim(idx) => write!(f, "d{idx}"),
            Self::Binding(idx) => write!(f, "b{idx}"),
            Self::Unary(op) => f.write_str(op.name()),
            Self::Binary(op) => f.write_str(op.name()),
            Self::Peek { binding, dims } => write!(f, "peek{binding}({})", dims.join(",")),
        }
    }
}

/// Values a compiled expression reads beyond the lambda coordinates.
pub trait ExprBindings {
    fn scalar(&self, binding: usize) -> f64;

    /// Cell of a tensor binding; `labels` pairs dimension names with the
    /// evaluated index expressions.
    fn peek(&self, binding: usize, labels: &[(&str, f64)]) -> f64;
}

/// Bindings for closed expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBindings;

impl ExprBindings for NoBindings {
    fn scalar(&self, _binding: usize) -> f64 {
        f64::NAN
    }

    fn peek(&self, _binding: usize, _labels: &[(&str, f64)]) -> f64 {
        f64::NAN
    }
}

/// Postfix program for a [`ScalarExpr`] with dimension names resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    ops: Vec<ExprOp>,
    num_bindings: usize,
}

impl CompiledExpr {
    /// Resolves dimension names against `dims`; `None` if one is unknown.
    #[must_use]
    pub fn compile(expr: &ScalarExpr, dims: &[&str]) -> Option<Self> {
        let mut ops = Vec::new();
        emit(expr, dims, &mut ops)?;
        Some(Self {
            ops,
            num_bindings: expr.max_binding().map_or(0, |idx| idx + 1),
        })
    }

    /// Program pushing `value`, independent of coordinates and bindings.
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self {
            ops: vec![ExprOp::Const(value)],
            num_bindings: 0,
        }
    }

    #[must_use]
    pub fn ops(&self) -> &[ExprOp] {
        &self.ops
    }

    #[must_use]
    pub fn num_bindings(&self) -> usize {
        self.num_bindings
    }

    /// Text identifying the program; equal programs have equal signatures.
    #[must_use]
    pub fn signature(&self) -> String {
        self.ops
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[must_use]
    pub fn eval(&self, coords: &[usize], bindings: &dyn ExprBindings) -> f64 {
        let mut stack: Vec<f64> = Vec::with_capacity(8);
        for op in &self.ops {
            match op {
                ExprOp::Const(value) => stack.push(*value),
                ExprOp::Dim(idx) => stack.push(coords[*idx] as f64),
                ExprOp::Binding(idx) => stack.push(bindings.scalar(*idx)),
                ExprOp::Unary(op) => {
                    let arg = pop(&mut stack);
                    stack.push(op.apply(arg));
                }
                ExprOp::Binary(op) => {
                    let rhs = pop(&mut stack);
                    let lhs = pop(&mut stack);
                    stack.push(op.apply(lhs, rhs));
                }
                ExprOp::Peek { binding, dims } => {
                    let start = stack.len() - dims.len();
                    let labels: Vec<(&str, f64)> = dims
                        .iter()
                        .map(String::as_str)
                        .zip(stack[start..].iter().copied())
                        .collect();
                    let value = bindings.peek(*binding, &labels);
                    stack.truncate(start);
                    stack.push(value);
                }
            }
        }
        assert_eq!(stack.len(), 1, "compiled expression must leave one value");
        stack[0]
    }
}

fn pop(stack: &mut Vec<f64>) -> f64 {
    stack
        .pop()
        .unwrap_or_else(|| panic!("compiled expression stack underflow"))
}

fn emit(expr: &ScalarExpr, dims: &[&str], ops: &mut Vec<ExprOp>) -> Option<()> {
    match expr {
        ScalarExpr::Const(value) => ops.push(ExprOp::Const(*value)),
        ScalarExpr::Dim(name) => {
            let idx = dims.iter().position(|dim| dim == name)?;
            ops.push(ExprOp::Dim(idx));
        }
        ScalarExpr::Binding(idx) => ops.push(ExprOp::Binding(*idx)),
        ScalarExpr::Unary(op, arg) => {
            emit(arg, dims, ops)?;
            ops.push(ExprOp::Unary(*op));
        }
        ScalarExpr::Binary(op, lhs, rhs) => {
            emit(lhs, dims, ops)?;
            emit(rhs, dims, ops)?;
            ops.push(ExprOp::Binary(*op));
        }
        ScalarExpr::Peek { binding, dims: labels } => {
            for (_, label) in labels {
                emit(label, dims, ops)?;
            }
            ops.push(ExprOp::Peek {
                binding: *binding,
                dims: labels.iter().map(|(name, _)| name.clone()).collect(),
            });
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use et_core::{Op1, Op2};

    use super::{CompiledExpr, ExprBindings, NoBindings, ScalarExpr};

    struct Fixed;

    impl ExprBindings for Fixed {
        fn scalar(&self, binding: usize) -> f64 {
            10.0 * (binding + 1) as f64
        }

        fn peek(&self, binding: usize, labels: &[(&str, f64)]) -> f64 {
            assert_eq!(binding, 0);
            labels.iter().map(|(_, value)| value).sum::<f64>() + 100.0
        }
    }

    #[test]
    fn compiled_expression_evaluates_postfix() {
        let expr = ScalarExpr::binary(
            Op2::Add,
            ScalarExpr::binary(Op2::Mul, ScalarExpr::dim("x"), ScalarExpr::Const(3.0)),
            ScalarExpr::unary(Op1::Neg, ScalarExpr::dim("y")),
        );
        let compiled = CompiledExpr::compile(&expr, &["x", "y"]).expect("dims resolve");
        assert_eq!(compiled.eval(&[2, 1], &NoBindings), 5.0);
        assert_eq!(compiled.num_bindings(), 0);
        assert!(expr.is_closed());
    }

    #[test]
    fn constant_program_matches_compiled_constant() {
        let built = CompiledExpr::constant(2.5);
        let compiled = CompiledExpr::compile(&ScalarExpr::Const(2.5), &[]).expect("compiles");
        assert_eq!(built.signature(), compiled.signature());
        assert_eq!(built.eval(&[], &NoBindings), 2.5);
        assert_eq!(built.num_bindings(), 0);
    }

    #[test]
    fn unknown_dimensions_fail_to_compile() {
        assert!(CompiledExpr::compile(&ScalarExpr::dim("z"), &["x"]).is_none());
    }

    #[test]
    fn bindings_and_peeks_read_through_the_binding_trait() {
        let expr = ScalarExpr::binary(
            Op2::Sub,
            ScalarExpr::peek(0, vec![("a", ScalarExpr::dim("x")), ("b", ScalarExpr::Const(2.0))]),
            ScalarExpr::Binding(1),
        );
        let compiled = CompiledExpr::compile(&expr, &["x"]).expect("dims resolve");
        assert_eq!(compiled.eval(&[3], &Fixed), 105.0 - 20.0);
        assert_eq!(compiled.num_bindings(), 2);
        assert!(!expr.is_closed());
    }

    #[test]
    fn signatures_distinguish_programs() {
        let a = CompiledExpr::compile(&ScalarExpr::dim("x"), &["x", "y"]).expect("compiles");
        let b = CompiledExpr::compile(&ScalarExpr::dim("y"), &["x", "y"]).expect("compiles");
        let c = CompiledExpr::compile(&ScalarExpr::Const(1.0), &["x"]).expect("compiles");
        assert_ne!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
        let again = CompiledExpr::compile(&ScalarExpr::dim("x"), &["x"]).expect("compiles");
        assert_eq!(a.signature(), again.signature());
    }
}
