#![forbid(unsafe_code)]

//! Post-order compilation of a tensor function into a flat instruction list
//! and a stack machine that runs it. Specialized nodes select a kernel
//! instantiation by cell type at compile time; generic nodes dispatch on the
//! runtime representation of their operands.

use std::fmt;

use et_core::{
    Cell, CellBuffer, CellType, ExecutionMode, TypeError, TypedCells, ValueType,
    contiguous_strides, ensure_same_type, next_coordinate,
};
use et_function::{
    ExprBindings, FunctionArena, FunctionError, NodeId, NodeKind, PeekIndex, PeekLabel,
    index_from_f64,
};
use et_kernel_cpu as kernel;
use et_storage::{
    Address, DenseValue, Label, TensorSpec, Value, pack_labels, sparse_cell_cast,
    sparse_dot_product, sparse_join, sparse_map, sparse_merge, sparse_reduce,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstructionParam {
    None,
    Index(usize),
    Scalar(f64),
    Node(NodeId),
}

pub type OpFn = fn(&mut EvalState<'_>, InstructionParam);

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub kernel: &'static str,
    pub op: OpFn,
    pub param: InstructionParam,
}

impl Instruction {
    fn new(kernel: &'static str, op: OpFn, param: InstructionParam) -> Self {
        Self { kernel, op, param }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpError {
    Function(FunctionError),
    ParamCount { expected: usize, actual: usize },
    ParamType { index: usize, source: TypeError },
}

impl fmt::Display for InterpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(error) => write!(f, "invalid tensor function: {error}"),
            Self::ParamCount { expected, actual } => {
                write!(f, "expected {expected} parameters, got {actual}")
            }
            Self::ParamType { index, source } => write!(f, "parameter {index}: {source}"),
        }
    }
}

impl std::error::Error for InterpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Function(error) => Some(error),
            Self::ParamType { source, .. } => Some(source),
            Self::ParamCount { .. } => None,
        }
    }
}

impl From<FunctionError> for InterpError {
    fn from(value: FunctionError) -> Self {
        Self::Function(value)
    }
}

/// Buffer accounting for one evaluation. Every intermediate value is owned
/// by the evaluation and released when it ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stash {
    pub fresh_buffers: usize,
    pub fresh_cells: usize,
    pub reused_buffers: usize,
}

/// Per-call machine state. Never shared between evaluations.
pub struct EvalState<'a> {
    arena: &'a FunctionArena,
    params: &'a [Value],
    stack: Vec<Value>,
    stash: Stash,
}

impl<'a> EvalState<'a> {
    fn new(arena: &'a FunctionArena, params: &'a [Value]) -> Self {
        Self {
            arena,
            params,
            stack: Vec::new(),
            stash: Stash::default(),
        }
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .unwrap_or_else(|| panic!("instruction popped an empty value stack"))
    }

    /// Pops `count` values, returned bottom first.
    fn pop_many(&mut self, count: usize) -> Vec<Value> {
        assert!(self.stack.len() >= count, "value stack underflow");
        let start = self.stack.len() - count;
        self.stack.split_off(start)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn push_fresh(&mut self, value: Value) {
        self.stash.fresh_buffers += 1;
        self.stash.fresh_cells += value.cells().len();
        self.stack.push(value);
    }

    /// Takes over the buffer of `dense` for writing; copies when shared.
    fn note_reuse(&mut self, dense: &DenseValue) {
        if dense.is_shared() {
            self.stash.fresh_buffers += 1;
            self.stash.fresh_cells += dense.cells().len();
        } else {
            self.stash.reused_buffers += 1;
        }
    }

    fn top(&self) -> Option<&Value> {
        self.stack.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceStep {
    pub kernel: &'static str,
    pub value_type: ValueType,
    pub data_addr: usize,
}

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub value: Value,
    pub stash: Stash,
    pub trace: Vec<TraceStep>,
}

/// Compiled, immutable program. Evaluations may run concurrently.
#[derive(Debug, Clone)]
pub struct InterpretedFunction {
    arena: FunctionArena,
    program: Vec<Instruction>,
    injects: Vec<(usize, ValueType)>,
    num_params: usize,
    result_type: ValueType,
    mode: ExecutionMode,
}

impl InterpretedFunction {
    pub fn compile(arena: &FunctionArena, mode: ExecutionMode) -> Result<Self, InterpError> {
        let root = arena.root().ok_or(FunctionError::NoRoot)?;
        arena.try_node(root)?;
        let mut program = Vec::new();
        let mut injects = Vec::new();
        let mut todo = vec![(root, false)];
        while let Some((node, expanded)) = todo.pop() {
            if expanded {
                if let NodeKind::Inject { param } = arena.kind(node) {
                    injects.push((*param, arena.result_type(node).clone()));
                }
                let instruction = select_instruction(arena, node);
                trace!(node = node.0, kernel = instruction.kernel, "instruction selected");
                program.push(instruction);
                continue;
            }
            todo.push((node, true));
            for child in arena.kind(node).children().into_iter().rev() {
                arena.try_node(child)?;
                todo.push((child, false));
            }
        }
        let num_params = injects.iter().map(|(param, _)| param + 1).max().unwrap_or(0);
        debug!(instructions = program.len(), num_params, "tensor function compiled");
        Ok(Self {
            arena: arena.clone(),
            program,
            injects,
            num_params,
            result_type: arena.result_type(root).clone(),
            mode,
        })
    }

    #[must_use]
    pub fn program(&self) -> &[Instruction] {
        &self.program
    }

    #[must_use]
    pub fn kernels(&self) -> Vec<&'static str> {
        self.program.iter().map(|instruction| instruction.kernel).collect()
    }

    #[must_use]
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    #[must_use]
    pub fn result_type(&self) -> &ValueType {
        &self.result_type
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn eval(&self, params: &[Value]) -> Result<Value, InterpError> {
        self.run(params, false).map(|outcome| outcome.value)
    }

    /// Evaluates and records the kernel, type and cell address of every
    /// intermediate result.
    pub fn eval_traced(&self, params: &[Value]) -> Result<EvalOutcome, InterpError> {
        self.run(params, true)
    }

    /// Strict mode rejects parameters whose type differs from the declared
    /// one; hardened mode turns the whole result into the error value.
    fn check_params(&self, params: &[Value]) -> Result<bool, InterpError> {
        if params.len() < self.num_params
            || (self.mode == ExecutionMode::Strict && params.len() != self.num_params)
        {
            return Err(InterpError::ParamCount {
                expected: self.num_params,
                actual: params.len(),
            });
        }
        for (index, declared) in &self.injects {
            if let Err(source) = ensure_same_type(declared, params[*index].value_type()) {
                match self.mode {
                    ExecutionMode::Strict => {
                        return Err(InterpError::ParamType {
                            index: *index,
                            source,
                        });
                    }
                    ExecutionMode::Hardened => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    fn run(&self, params: &[Value], traced: bool) -> Result<EvalOutcome, InterpError> {
        let mut trace = Vec::new();
        if !self.check_params(params)? {
            debug!("parameter type mismatch, result is the error value");
            return Ok(EvalOutcome {
                value: Value::error(),
                stash: Stash::default(),
                trace,
            });
        }
        let mut state = EvalState::new(&self.arena, params);
        for instruction in &self.program {
            (instruction.op)(&mut state, instruction.param);
            if !traced {
                continue;
            }
            if let Some(top) = state.top() {
                trace.push(TraceStep {
                    kernel: instruction.kernel,
                    value_type: top.value_type().clone(),
                    data_addr: top.cells().data_addr(),
                });
            }
        }
        assert_eq!(state.stack.len(), 1, "program must leave exactly one value");
        let stash = state.stash;
        let value = state.pop();
        Ok(EvalOutcome {
            value,
            stash,
            trace,
        })
    }
}

fn select_instruction(arena: &FunctionArena, id: NodeId) -> Instruction {
    let node = InstructionParam::Node(id);
    let cell_type = |child: &NodeId| arena.result_type(*child).cell_type();
    match arena.kind(id) {
        NodeKind::Inject { param } => {
            Instruction::new("inject", op_inject, InstructionParam::Index(*param))
        }
        NodeKind::ConstValue { value } if value.value_type().is_double() => {
            Instruction::new("const_double", op_const_double, InstructionParam::Scalar(value.as_double()))
        }
        NodeKind::ConstValue { .. } => Instruction::new("const_value", op_const, node),
        NodeKind::Map { .. } => Instruction::new("generic_map", op_generic_map, node),
        NodeKind::Join { .. } => Instruction::new("generic_join", op_generic_join, node),
        NodeKind::Merge { .. } => Instruction::new("generic_merge", op_generic_merge, node),
        NodeKind::Reduce { .. } => Instruction::new("generic_reduce", op_generic_reduce, node),
        NodeKind::Rename { .. } => Instruction::new("generic_rename", op_generic_rename, node),
        NodeKind::Concat { .. } => Instruction::new("generic_concat", op_generic_concat, node),
        NodeKind::Lambda { .. } => Instruction::new("generic_lambda", op_generic_lambda, node),
        NodeKind::Peek { .. } => Instruction::new("generic_peek", op_generic_peek, node),
        NodeKind::Create { .. } => Instruction::new("generic_create", op_generic_create, node),
        NodeKind::CellCast { .. } => Instruction::new("cell_cast", op_cell_cast, node),
        NodeKind::CellRange { .. } => Instruction::new("cell_range", op_cell_range, node),
        NodeKind::ReplaceType { .. } => Instruction::new("replace_type", op_replace_type, node),
        NodeKind::LambdaPeek { child, .. } => match cell_type(child) {
            CellType::Double => Instruction::new("gather_f64", op_gather::<f64>, node),
            CellType::Float => Instruction::new("gather_f32", op_gather::<f32>, node),
        },
        NodeKind::DotProduct { lhs, rhs } => match (cell_type(lhs), cell_type(rhs)) {
            (CellType::Double, CellType::Double) => {
                Instruction::new("dot_f64_f64", op_dot::<f64, f64>, node)
            }
            (CellType::Double, CellType::Float) => {
                Instruction::new("dot_f64_f32", op_dot::<f64, f32>, node)
            }
            (CellType::Float, CellType::Double) => {
                Instruction::new("dot_f32_f64", op_dot::<f32, f64>, node)
            }
            (CellType::Float, CellType::Float) => {
                Instruction::new("dot_f32_f32", op_dot::<f32, f32>, node)
            }
        },
        NodeKind::SparseDotProduct { .. } => {
            Instruction::new("sparse_dot", op_sparse_dot, node)
        }
        NodeKind::MatMul { lhs, rhs, .. } | NodeKind::MultiMatMul { lhs, rhs, .. } => {
            match (cell_type(lhs), cell_type(rhs)) {
                (CellType::Double, CellType::Double) => {
                    Instruction::new("gemm_f64", op_gemm::<f64>, node)
                }
                (CellType::Float, CellType::Float) => {
                    Instruction::new("gemm_f32", op_gemm::<f32>, node)
                }
                (CellType::Double, CellType::Float) => {
                    Instruction::new("matmul_f64_f32", op_matmul_promoted::<f64, f32>, node)
                }
                (CellType::Float, CellType::Double) => {
                    Instruction::new("matmul_f32_f64", op_matmul_promoted::<f32, f64>, node)
                }
            }
        }
        NodeKind::SimpleJoin {
            lhs,
            rhs,
            shape,
            inplace,
            ..
        } => {
            let (primary, secondary) = if shape.primary_is_lhs {
                (cell_type(lhs), cell_type(rhs))
            } else {
                (cell_type(rhs), cell_type(lhs))
            };
            select_simple_join(primary, secondary, *inplace, node)
        }
        NodeKind::SimpleMap { child, inplace, .. } => match (cell_type(child), *inplace) {
            (CellType::Double, false) => Instruction::new("map_f64", op_simple_map::<f64>, node),
            (CellType::Float, false) => Instruction::new("map_f32", op_simple_map::<f32>, node),
            (CellType::Double, true) => {
                Instruction::new("inplace_map_f64", op_inplace_map::<f64>, node)
            }
            (CellType::Float, true) => {
                Instruction::new("inplace_map_f32", op_inplace_map::<f32>, node)
            }
        },
        NodeKind::SingleReduce { child, .. } => {
            match (cell_type(child), arena.result_type(id).cell_type()) {
                (CellType::Double, CellType::Double) => {
                    Instruction::new("single_reduce_f64", op_single_reduce::<f64, f64>, node)
                }
                (CellType::Float, CellType::Float) => {
                    Instruction::new("single_reduce_f32", op_single_reduce::<f32, f32>, node)
                }
                (CellType::Float, CellType::Double) => {
                    Instruction::new("single_reduce_f32_f64", op_single_reduce::<f32, f64>, node)
                }
                (CellType::Double, CellType::Float) => {
                    Instruction::new("single_reduce_f64_f32", op_single_reduce::<f64, f32>, node)
                }
            }
        }
        NodeKind::DenseCreate { .. } => Instruction::new("dense_create", op_dense_create, node),
        NodeKind::DensePeek { .. } => Instruction::new("dense_peek", op_dense_peek, node),
        NodeKind::VectorFromDoubles { .. } => {
            Instruction::new("vector_from_doubles", op_vector_from_doubles, node)
        }
    }
}

/// In-place variants exist only where the primary already has the result
/// cell type.
fn select_simple_join(
    primary: CellType,
    secondary: CellType,
    inplace: bool,
    node: InstructionParam,
) -> Instruction {
    match (primary, secondary, inplace) {
        (CellType::Double, CellType::Double, true) => {
            Instruction::new("inplace_join_f64_f64", op_inplace_join::<f64, f64>, node)
        }
        (CellType::Double, CellType::Float, true) => {
            Instruction::new("inplace_join_f64_f32", op_inplace_join::<f64, f32>, node)
        }
        (CellType::Float, CellType::Float, true) => {
            Instruction::new("inplace_join_f32_f32", op_inplace_join::<f32, f32>, node)
        }
        (CellType::Double, CellType::Double, _) => {
            Instruction::new("simple_join_f64_f64", op_simple_join::<f64, f64, f64>, node)
        }
        (CellType::Double, CellType::Float, _) => {
            Instruction::new("simple_join_f64_f32", op_simple_join::<f64, f32, f64>, node)
        }
        (CellType::Float, CellType::Double, _) => {
            Instruction::new("simple_join_f32_f64", op_simple_join::<f32, f64, f64>, node)
        }
        (CellType::Float, CellType::Float, _) => {
            Instruction::new("simple_join_f32_f32", op_simple_join::<f32, f32, f32>, node)
        }
    }
}

fn node_param(param: InstructionParam) -> NodeId {
    match param {
        InstructionParam::Node(id) => id,
        other => panic!("instruction expects a node parameter, got {other:?}"),
    }
}

fn kind_mismatch(kind: &NodeKind) -> ! {
    panic!("instruction bound to unexpected node kind {}", kind.name())
}

fn into_dense(value: Value) -> DenseValue {
    match value {
        Value::Dense(dense) => dense,
        Value::Sparse(_) | Value::Mixed(_) => {
            panic!("specialized instruction expects a dense operand")
        }
    }
}

fn op_inject(state: &mut EvalState<'_>, param: InstructionParam) {
    let InstructionParam::Index(idx) = param else {
        panic!("inject expects a parameter index, got {param:?}");
    };
    let value = state.params[idx].clone();
    state.push(value);
}

fn op_const_double(state: &mut EvalState<'_>, param: InstructionParam) {
    let InstructionParam::Scalar(value) = param else {
        panic!("constant expects a scalar parameter, got {param:?}");
    };
    state.push(Value::double(value));
}

fn op_const(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let NodeKind::ConstValue { value } = arena.kind(node_param(param)) else {
        kind_mismatch(arena.kind(node_param(param)));
    };
    state.push(value.clone());
}

fn op_cell_range(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (offset, length) = match arena.kind(id) {
        NodeKind::CellRange { offset, length, .. } => (*offset, *length),
        other => kind_mismatch(other),
    };
    let source = into_dense(state.pop());
    let view = source.cell_range(arena.result_type(id).clone(), offset, length);
    state.push(Value::Dense(view));
}

fn op_replace_type(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let source = into_dense(state.pop());
    state.push(Value::Dense(source.with_type(arena.result_type(id).clone())));
}

fn op_gather<T: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::LambdaPeek { table, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let source = state.pop();
    let cells = kernel::gather(T::unwrap_cells(source.cells()), table.table());
    state.push_fresh(Value::dense(arena.result_type(id).clone(), T::wrap_vec(cells)));
}

fn op_dot<L: Cell, R: Cell>(state: &mut EvalState<'_>, _: InstructionParam) {
    let rhs = state.pop();
    let lhs = state.pop();
    let result = kernel::dot_product(L::unwrap_cells(lhs.cells()), R::unwrap_cells(rhs.cells()));
    state.push(Value::double(result));
}

fn op_sparse_dot(state: &mut EvalState<'_>, _: InstructionParam) {
    let rhs = state.pop();
    let lhs = state.pop();
    let (Some(lhs), Some(rhs)) = (lhs.as_sparse(), rhs.as_sparse()) else {
        panic!("sparse dot product expects sparse operands");
    };
    state.push(Value::double(sparse_dot_product(lhs, rhs)));
}

fn product_params(kind: &NodeKind) -> (kernel::MatMulShape, usize) {
    match kind {
        NodeKind::MatMul { shape, .. } => (*shape, 1),
        NodeKind::MultiMatMul { shape, batches, .. } => (*shape, *batches),
        other => kind_mismatch(other),
    }
}

fn op_gemm<T: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (shape, batches) = product_params(arena.kind(id));
    let rhs = state.pop();
    let lhs = state.pop();
    let out = kernel::multi_matmul(
        T::unwrap_cells(lhs.cells()),
        T::unwrap_cells(rhs.cells()),
        &shape,
        batches,
        kernel::gemm::<T>,
    );
    state.push_fresh(Value::dense(arena.result_type(id).clone(), T::wrap_vec(out)));
}

fn op_matmul_promoted<L: Cell, R: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (shape, batches) = product_params(arena.kind(id));
    let rhs = state.pop();
    let lhs = state.pop();
    let out: Vec<f64> = kernel::multi_matmul(
        L::unwrap_cells(lhs.cells()),
        R::unwrap_cells(rhs.cells()),
        &shape,
        batches,
        kernel::matmul_promoted::<L, R, f64>,
    );
    state.push_fresh(Value::dense(arena.result_type(id).clone(), CellBuffer::Double(out)));
}

fn join_params(kind: &NodeKind) -> (fn(f64, f64) -> f64, kernel::JoinShape) {
    match kind {
        NodeKind::SimpleJoin { op, shape, .. } => (op.function(), *shape),
        other => kind_mismatch(other),
    }
}

fn op_simple_join<P: Cell, S: Cell, O: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (fun, shape) = join_params(arena.kind(id));
    let rhs = state.pop();
    let lhs = state.pop();
    let (primary, secondary) = if shape.primary_is_lhs {
        (&lhs, &rhs)
    } else {
        (&rhs, &lhs)
    };
    let out: Vec<O> = kernel::simple_join(
        P::unwrap_cells(primary.cells()),
        S::unwrap_cells(secondary.cells()),
        fun,
        &shape,
    );
    state.push_fresh(Value::dense(arena.result_type(id).clone(), O::wrap_vec(out)));
}

/// The primary operand has the result type; its buffer becomes the result.
fn op_inplace_join<P: Cell, S: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (fun, shape) = join_params(arena.kind(id));
    let rhs = state.pop();
    let lhs = state.pop();
    let (primary, secondary) = if shape.primary_is_lhs {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };
    let mut target = into_dense(primary);
    state.note_reuse(&target);
    kernel::simple_join_inplace(
        target.cells_mut::<P>(),
        S::unwrap_cells(secondary.cells()),
        fun,
        &shape,
    );
    state.push(Value::Dense(target.with_type(arena.result_type(id).clone())));
}

fn map_fun(kind: &NodeKind) -> fn(f64) -> f64 {
    match kind {
        NodeKind::SimpleMap { op, .. } | NodeKind::Map { op, .. } => op.function(),
        other => kind_mismatch(other),
    }
}

fn op_simple_map<T: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let fun = map_fun(arena.kind(id));
    let source = state.pop();
    let out: Vec<T> = kernel::map_cells(T::unwrap_cells(source.cells()), fun);
    state.push_fresh(Value::dense(arena.result_type(id).clone(), T::wrap_vec(out)));
}

fn op_inplace_map<T: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let fun = map_fun(arena.kind(node_param(param)));
    let mut target = into_dense(state.pop());
    state.note_reuse(&target);
    kernel::map_inplace(target.cells_mut::<T>(), fun);
    state.push(Value::Dense(target));
}

fn op_single_reduce<I: Cell, O: Cell>(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let (aggr, outer, reduce, inner) = match arena.kind(id) {
        NodeKind::SingleReduce {
            aggr,
            outer,
            reduce,
            inner,
            ..
        } => (*aggr, *outer, *reduce, *inner),
        other => kind_mismatch(other),
    };
    let source = state.pop();
    let out: Vec<O> =
        kernel::single_reduce(I::unwrap_cells(source.cells()), outer, reduce, inner, aggr);
    state.push_fresh(Value::dense(arena.result_type(id).clone(), O::wrap_vec(out)));
}

fn op_dense_create(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::DenseCreate { cells } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let values = state.pop_many(cells.len());
    let result_type = arena.result_type(id);
    let buffer =
        CellBuffer::from_f64_iter(result_type.cell_type(), values.iter().map(Value::as_double));
    state.push_fresh(Value::dense(result_type.clone(), buffer));
}

fn op_dense_peek(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::DensePeek { dims, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let computed = dims
        .iter()
        .filter(|dim| matches!(dim.index, PeekIndex::Child(_)))
        .count();
    let labels = state.pop_many(computed);
    let source = state.pop();
    let mut labels = labels.iter().map(Value::as_double);
    let mut offset = Some(0usize);
    for dim in dims {
        let pos = match dim.index {
            PeekIndex::Fixed(idx) => (idx < dim.size).then_some(idx),
            PeekIndex::Child(_) => labels.next().and_then(|value| index_from_f64(value, dim.size)),
        };
        offset = offset.zip(pos).map(|(acc, pos)| acc + pos * dim.stride);
    }
    let value = offset.map_or(0.0, |idx| source.cells().get(idx));
    state.push(Value::double(value));
}

fn op_vector_from_doubles(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::VectorFromDoubles { children } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let values = state.pop_many(children.len());
    let result_type = arena.result_type(id);
    let buffer =
        CellBuffer::from_f64_iter(result_type.cell_type(), values.iter().map(Value::as_double));
    state.push_fresh(Value::dense(result_type.clone(), buffer));
}

fn map_dense(dense: &DenseValue, fun: fn(f64) -> f64) -> CellBuffer {
    match dense.cells() {
        TypedCells::Double(cells) => CellBuffer::Double(kernel::map_cells(cells, fun)),
        TypedCells::Float(cells) => CellBuffer::Float(kernel::map_cells(cells, fun)),
    }
}

fn join_dense(lhs: &DenseValue, rhs: &DenseValue, fun: fn(f64, f64) -> f64) -> CellBuffer {
    let (lt, rt) = (lhs.value_type(), rhs.value_type());
    match (lhs.cells(), rhs.cells()) {
        (TypedCells::Double(l), TypedCells::Double(r)) => {
            CellBuffer::Double(kernel::generic_join(l, lt, r, rt, fun))
        }
        (TypedCells::Double(l), TypedCells::Float(r)) => {
            CellBuffer::Double(kernel::generic_join(l, lt, r, rt, fun))
        }
        (TypedCells::Float(l), TypedCells::Double(r)) => {
            CellBuffer::Double(kernel::generic_join(l, lt, r, rt, fun))
        }
        (TypedCells::Float(l), TypedCells::Float(r)) => {
            CellBuffer::Float(kernel::generic_join(l, lt, r, rt, fun))
        }
    }
}

fn reduce_dense(
    dense: &DenseValue,
    dims: &[String],
    aggr: et_core::Aggr,
    result_cells: CellType,
) -> CellBuffer {
    let ty = dense.value_type();
    match (dense.cells(), result_cells) {
        (TypedCells::Double(cells), CellType::Double) => {
            CellBuffer::Double(kernel::generic_reduce(cells, ty, dims, aggr))
        }
        (TypedCells::Double(cells), CellType::Float) => {
            CellBuffer::Float(kernel::generic_reduce(cells, ty, dims, aggr))
        }
        (TypedCells::Float(cells), CellType::Double) => {
            CellBuffer::Double(kernel::generic_reduce(cells, ty, dims, aggr))
        }
        (TypedCells::Float(cells), CellType::Float) => {
            CellBuffer::Float(kernel::generic_reduce(cells, ty, dims, aggr))
        }
    }
}

fn cast_dense(dense: &DenseValue, cell_type: CellType) -> CellBuffer {
    match (dense.cells(), cell_type) {
        (TypedCells::Double(cells), CellType::Double) => {
            CellBuffer::Double(kernel::cell_cast(cells))
        }
        (TypedCells::Double(cells), CellType::Float) => CellBuffer::Float(kernel::cell_cast(cells)),
        (TypedCells::Float(cells), CellType::Double) => {
            CellBuffer::Double(kernel::cell_cast(cells))
        }
        (TypedCells::Float(cells), CellType::Float) => CellBuffer::Float(kernel::cell_cast(cells)),
    }
}

/// Runs an operation through the reference evaluator.
fn via_reference(result: TensorSpec) -> Value {
    Value::from_spec(&result)
}

fn op_generic_map(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Map { op, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let child = state.pop();
    let result_type = arena.result_type(id);
    let value = match &child {
        _ if result_type.is_error() => Value::error(),
        Value::Dense(dense) => Value::dense(result_type.clone(), map_dense(dense, op.function())),
        Value::Sparse(sparse) => sparse_map(sparse, *op),
        Value::Mixed(_) => via_reference(et_reference::map(&child.to_spec(), *op)),
    };
    state.push_fresh(value);
}

fn op_generic_join(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Join { op, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let rhs = state.pop();
    let lhs = state.pop();
    let result_type = arena.result_type(id);
    let value = match (&lhs, &rhs) {
        _ if result_type.is_error() => Value::error(),
        (Value::Dense(l), Value::Dense(r)) => {
            Value::dense(result_type.clone(), join_dense(l, r, op.function()))
        }
        (Value::Sparse(l), Value::Sparse(r)) => sparse_join(l, r, *op),
        _ => via_reference(et_reference::join(&lhs.to_spec(), &rhs.to_spec(), *op)),
    };
    state.push_fresh(value);
}

fn op_generic_merge(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Merge { op, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let rhs = state.pop();
    let lhs = state.pop();
    let result_type = arena.result_type(id);
    let value = match (&lhs, &rhs) {
        _ if result_type.is_error() => Value::error(),
        (Value::Dense(l), Value::Dense(r)) => {
            Value::dense(result_type.clone(), join_dense(l, r, op.function()))
        }
        (Value::Sparse(l), Value::Sparse(r)) => sparse_merge(l, r, *op),
        _ => via_reference(et_reference::merge(&lhs.to_spec(), &rhs.to_spec(), *op)),
    };
    state.push_fresh(value);
}

fn op_generic_reduce(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Reduce { aggr, dims, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let child = state.pop();
    let result_type = arena.result_type(id);
    let value = match &child {
        _ if result_type.is_error() => Value::error(),
        Value::Dense(dense) => Value::dense(
            result_type.clone(),
            reduce_dense(dense, dims, *aggr, result_type.cell_type()),
        ),
        Value::Sparse(sparse) => sparse_reduce(sparse, *aggr, dims),
        Value::Mixed(_) => via_reference(et_reference::reduce(&child.to_spec(), *aggr, dims)),
    };
    state.push_fresh(value);
}

fn op_generic_rename(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Rename { from, to, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let child = state.pop();
    state.push_fresh(via_reference(et_reference::rename(&child.to_spec(), from, to)));
}

fn op_generic_concat(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Concat { dimension, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let rhs = state.pop();
    let lhs = state.pop();
    state.push_fresh(via_reference(et_reference::concat(
        &lhs.to_spec(),
        &rhs.to_spec(),
        dimension,
    )));
}

fn op_cell_cast(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::CellCast { cell_type, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let child = state.pop();
    let result_type = arena.result_type(id);
    let value = match &child {
        _ if result_type.is_error() => Value::error(),
        Value::Dense(dense) => Value::dense(
            result_type.clone(),
            cast_dense(dense, result_type.cell_type()),
        ),
        Value::Sparse(sparse) => sparse_cell_cast(sparse, *cell_type),
        Value::Mixed(_) => via_reference(et_reference::cell_cast(&child.to_spec(), *cell_type)),
    };
    state.push_fresh(value);
}

/// Label a computed value selects along `dim`. Indices outside an indexed
/// dimension select nothing; mapped dimensions use the integer text.
fn computed_label(size: Option<u32>, value: f64) -> Label {
    match size {
        Some(size) => match index_from_f64(value, size as usize) {
            Some(idx) => Label::Indexed(idx as u32),
            None => Label::Mapped(String::new()),
        },
        None => Label::Mapped((value as i64).to_string()),
    }
}

/// Cell of `value` at a full address of computed labels; zero when the
/// address selects nothing.
fn peek_cell(value: &Value, labels: &[(&str, f64)]) -> f64 {
    let value_type = value.value_type();
    let dims = value_type.dimensions();
    if labels.len() != dims.len() {
        return 0.0;
    }
    let label_of = |name: &str| {
        labels
            .iter()
            .find(|(label_dim, _)| *label_dim == name)
            .map(|(_, value)| *value)
    };
    match value {
        Value::Dense(dense) => {
            let sizes: Vec<usize> = dims.iter().map(|dim| dim.size_or_zero()).collect();
            let strides = contiguous_strides(&sizes);
            let mut offset = 0usize;
            for (pos, dim) in dims.iter().enumerate() {
                let Some(idx) = label_of(&dim.name).and_then(|v| index_from_f64(v, sizes[pos]))
                else {
                    return 0.0;
                };
                offset += idx * strides[pos];
            }
            dense.cells().get(offset)
        }
        Value::Sparse(sparse) => {
            let mut texts = Vec::with_capacity(dims.len());
            for dim in dims {
                let Some(label) = label_of(&dim.name) else {
                    return 0.0;
                };
                texts.push((label as i64).to_string());
            }
            let mut packed = Vec::new();
            pack_labels(&mut packed, texts.iter().map(String::as_str));
            sparse.get(&packed).unwrap_or(0.0)
        }
        Value::Mixed(mixed) => {
            let mut address = Address::new();
            for dim in dims {
                let Some(label) = label_of(&dim.name) else {
                    return 0.0;
                };
                address.insert(dim.name.clone(), computed_label(dim.size, label));
            }
            mixed.spec().get(&address).unwrap_or(0.0)
        }
    }
}

struct LambdaBindings<'v> {
    values: &'v [Value],
}

impl ExprBindings for LambdaBindings<'_> {
    fn scalar(&self, binding: usize) -> f64 {
        self.values.get(binding).map_or(f64::NAN, Value::as_double)
    }

    fn peek(&self, binding: usize, labels: &[(&str, f64)]) -> f64 {
        self.values
            .get(binding)
            .map_or(f64::NAN, |value| peek_cell(value, labels))
    }
}

fn op_generic_lambda(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Lambda {
        compiled, bindings, ..
    } = arena.kind(id)
    else {
        kind_mismatch(arena.kind(id));
    };
    let values = state.pop_many(bindings.len());
    let result_type = arena.result_type(id);
    if result_type.is_error() {
        state.push(Value::error());
        return;
    }
    let scope = LambdaBindings { values: &values };
    let sizes: Vec<usize> = result_type
        .dimensions()
        .iter()
        .map(|dim| dim.size_or_zero())
        .collect();
    let mut coords = vec![0usize; sizes.len()];
    let mut buffer = CellBuffer::with_capacity(result_type.cell_type(), result_type.dense_subspace_size());
    loop {
        buffer.push(compiled.eval(&coords, &scope));
        if !next_coordinate(&mut coords, &sizes) {
            break;
        }
    }
    state.push_fresh(Value::dense(result_type.clone(), buffer));
}

fn op_generic_peek(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Peek { spec, .. } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let computed = spec
        .values()
        .filter(|label| matches!(label, PeekLabel::Child(_)))
        .count();
    let values = state.pop_many(computed);
    let child = state.pop();
    let result_type = arena.result_type(id);
    if result_type.is_error() {
        state.push(Value::error());
        return;
    }
    let child_type = child.value_type();
    let mut values = values.iter().map(Value::as_double);
    let mut address = Address::new();
    for (name, label) in spec {
        let label = match label {
            PeekLabel::Label(label) => label.clone(),
            PeekLabel::Child(_) => {
                let computed = values.next().unwrap_or(f64::NAN);
                let size = child_type
                    .dimension_index(name)
                    .and_then(|pos| child_type.dimensions()[pos].size);
                computed_label(size, computed)
            }
        };
        address.insert(name.clone(), label);
    }
    state.push_fresh(via_reference(et_reference::peek(&child.to_spec(), &address)));
}

fn op_generic_create(state: &mut EvalState<'_>, param: InstructionParam) {
    let arena = state.arena;
    let id = node_param(param);
    let NodeKind::Create { cells } = arena.kind(id) else {
        kind_mismatch(arena.kind(id));
    };
    let values = state.pop_many(cells.len());
    let result_type = arena.result_type(id);
    if result_type.is_error() {
        state.push(Value::error());
        return;
    }
    let mut spec = TensorSpec::new(result_type.clone());
    for (address, value) in cells.keys().zip(&values) {
        spec.add(address.clone(), value.as_double());
    }
    state.push_fresh(Value::from_spec(&spec));
}
