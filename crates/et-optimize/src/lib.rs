#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use et_core::{Aggr, CellType, Dimension, Op2, ValueType, contiguous_strides, next_coordinate};
use et_function::{
    CompiledExpr, DensePeekDim, FunctionArena, FunctionError, IndexLookupTable, NoBindings,
    NodeId, NodeKind, PeekIndex, PeekLabel, ScalarExpr, index_from_f64,
};
use et_kernel_cpu::{JoinShape, MatMulShape, Overlap};
use et_storage::{Address, Label, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Matcher families that may run. Every family is enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassConfig {
    /// Dot product, sparse dot product, matmul and multi-matmul.
    pub products: bool,
    pub lambda_peek: bool,
    /// Dense create, dense peek and vector-from-doubles.
    pub create_and_peek: bool,
    /// Rename and trivial-dimension rewrites into type replacement.
    pub compaction: bool,
    /// Allows simple maps and joins to write into their input buffer.
    pub inplace: bool,
    /// Simple joins and simple maps.
    pub simple_join: bool,
    pub single_reduce: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            products: true,
            lambda_peek: true,
            create_and_peek: true,
            compaction: true,
            inplace: true,
            simple_join: true,
            single_reduce: true,
        }
    }
}

impl PassConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            products: false,
            lambda_peek: false,
            create_and_peek: false,
            compaction: false,
            inplace: false,
            simple_join: false,
            single_reduce: false,
        }
    }
}

/// One applied rewrite: `node` was replaced by `replacement` in its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub matcher: &'static str,
    pub node: NodeId,
    pub replacement: NodeId,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub rewrites: Vec<Rewrite>,
}

impl OptimizeReport {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rewrites.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    #[must_use]
    pub fn count(&self, matcher: &str) -> usize {
        self.rewrites
            .iter()
            .filter(|rewrite| rewrite.matcher == matcher)
            .count()
    }

    #[must_use]
    pub fn matcher_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for rewrite in &self.rewrites {
            *counts.entry(rewrite.matcher).or_insert(0) += 1;
        }
        counts
    }
}

type Matcher = fn(&mut FunctionArena, NodeId, &PassConfig) -> Option<NodeId>;

struct Pass {
    name: &'static str,
    enabled: fn(&PassConfig) -> bool,
    matcher: Matcher,
}

const PRODUCT_PASSES: [Pass; 4] = [
    Pass {
        name: "dot_product",
        enabled: |config| config.products,
        matcher: dot_product,
    },
    Pass {
        name: "sparse_dot_product",
        enabled: |config| config.products,
        matcher: sparse_dot_product,
    },
    Pass {
        name: "matmul",
        enabled: |config| config.products,
        matcher: matmul,
    },
    Pass {
        name: "multi_matmul",
        enabled: |config| config.products,
        matcher: multi_matmul,
    },
];

const SPECIALIZE_PASSES: [Pass; 10] = [
    Pass {
        name: "dense_create",
        enabled: |config| config.create_and_peek,
        matcher: dense_create,
    },
    Pass {
        name: "dense_peek",
        enabled: |config| config.create_and_peek,
        matcher: dense_peek,
    },
    Pass {
        name: "vector_from_doubles",
        enabled: |config| config.create_and_peek,
        matcher: vector_from_doubles,
    },
    Pass {
        name: "lambda_peek",
        enabled: |config| config.lambda_peek,
        matcher: lambda_peek,
    },
    Pass {
        name: "rename_compaction",
        enabled: |config| config.compaction,
        matcher: rename_compaction,
    },
    Pass {
        name: "remove_trivial_dimension",
        enabled: |config| config.compaction,
        matcher: remove_trivial_dimension,
    },
    Pass {
        name: "add_trivial_dimension",
        enabled: |config| config.compaction,
        matcher: add_trivial_dimension,
    },
    Pass {
        name: "simple_map",
        enabled: |config| config.simple_join,
        matcher: simple_map,
    },
    Pass {
        name: "simple_join",
        enabled: |config| config.simple_join,
        matcher: simple_join,
    },
    Pass {
        name: "single_reduce",
        enabled: |config| config.single_reduce,
        matcher: single_reduce,
    },
];

/// Rewrites the function under the arena root. Products are recognized in
/// a first sweep so later sweeps cannot specialize their join away.
pub fn optimize(
    arena: &mut FunctionArena,
    config: &PassConfig,
) -> Result<OptimizeReport, FunctionError> {
    let mut report = OptimizeReport::default();
    run_passes(arena, &PRODUCT_PASSES, config, &mut report)?;
    run_passes(arena, &SPECIALIZE_PASSES, config, &mut report)?;
    debug!(rewrites = report.len(), nodes = arena.node_count(), "optimize done");
    Ok(report)
}

/// Children are rewritten before their parents. Each slot runs the chain
/// once; a matcher sees the output of the matchers before it.
fn run_passes(
    arena: &mut FunctionArena,
    passes: &[Pass],
    config: &PassConfig,
    report: &mut OptimizeReport,
) -> Result<(), FunctionError> {
    let slots = arena.slots_from_root()?;
    for slot in slots.into_iter().rev() {
        let original = arena.slot_node(slot)?;
        let mut current = original;
        for pass in passes {
            if !(pass.enabled)(config) {
                continue;
            }
            let Some(next) = (pass.matcher)(arena, current, config) else {
                continue;
            };
            let rewrite = Rewrite {
                matcher: pass.name,
                node: current,
                replacement: next,
                from: arena.kind(current).name(),
                to: arena.kind(next).name(),
            };
            debug!(
                matcher = rewrite.matcher,
                node = current.0,
                from = rewrite.from,
                to = rewrite.to,
                "rewrite applied"
            );
            report.rewrites.push(rewrite);
            current = next;
        }
        if current != original {
            arena.replace(slot, current)?;
        }
    }
    Ok(())
}

fn dense_tensor(value_type: &ValueType) -> bool {
    value_type.is_dense() && value_type.has_dimensions()
}

fn sizes_of(value_type: &ValueType) -> Vec<usize> {
    value_type
        .dimensions()
        .iter()
        .map(Dimension::size_or_zero)
        .collect()
}

fn nontrivial_dims(value_type: &ValueType) -> Vec<Dimension> {
    value_type
        .nontrivial_indexed_dimensions()
        .into_iter()
        .cloned()
        .collect()
}

/// Type relabel over `child`'s cells. A relabel of a relabel points at the
/// innermost node; a relabel to the same type is the node itself.
fn replace_type(arena: &mut FunctionArena, child: NodeId, result_type: ValueType) -> NodeId {
    let target = match arena.kind(child) {
        NodeKind::ReplaceType { child: inner } => *inner,
        _ => child,
    };
    if arena.result_type(target) == &result_type {
        return target;
    }
    arena.push(result_type, NodeKind::ReplaceType { child: target })
}

/// `reduce(join(a, b, mul), sum, dims)`.
fn sum_of_products(arena: &FunctionArena, node: NodeId) -> Option<(NodeId, NodeId, Vec<String>)> {
    let NodeKind::Reduce {
        child,
        aggr: Aggr::Sum,
        dims,
    } = arena.kind(node)
    else {
        return None;
    };
    let NodeKind::Join {
        lhs,
        rhs,
        op: Op2::Mul,
    } = arena.kind(*child)
    else {
        return None;
    };
    Some((*lhs, *rhs, dims.clone()))
}

fn dot_product(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let (lhs, rhs, dims) = sum_of_products(arena, node)?;
    let (lhs_type, rhs_type) = (arena.result_type(lhs), arena.result_type(rhs));
    if !dense_tensor(lhs_type)
        || lhs_type.dimensions().len() != 1
        || lhs_type.dimensions() != rhs_type.dimensions()
        || !arena.result_type(node).is_double()
    {
        return None;
    }
    trace!(node = node.0, "dot product recognized");
    Some(arena.push(ValueType::double(), NodeKind::DotProduct { lhs, rhs }))
}

fn sparse_dot_product(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let (lhs, rhs, _) = sum_of_products(arena, node)?;
    let (lhs_type, rhs_type) = (arena.result_type(lhs), arena.result_type(rhs));
    if !lhs_type.is_sparse()
        || lhs_type.dimensions() != rhs_type.dimensions()
        || !arena.result_type(node).is_double()
    {
        return None;
    }
    Some(arena.push(ValueType::double(), NodeKind::SparseDotProduct { lhs, rhs }))
}

/// Operands of a (batched) matrix product ordered as lhs and rhs.
struct ProductPlan {
    lhs: NodeId,
    rhs: NodeId,
    shape: MatMulShape,
    batch_dims: usize,
    batches: usize,
}

/// Both operands are dense with the same leading (batch) dimensions; the
/// last two dimensions of each are the common dimension plus one private
/// dimension. The operand whose private dimension sorts first is lhs.
fn product_plan(arena: &FunctionArena, node: NodeId) -> Option<ProductPlan> {
    let (a, b, dims) = sum_of_products(arena, node)?;
    let [common] = dims.as_slice() else {
        return None;
    };
    if arena.result_type(node).is_error() {
        return None;
    }
    let (a_type, b_type) = (arena.result_type(a), arena.result_type(b));
    if !dense_tensor(a_type) || !dense_tensor(b_type) {
        return None;
    }
    let (a_dims, b_dims) = (a_type.dimensions(), b_type.dimensions());
    if a_dims.len() < 2 || a_dims.len() != b_dims.len() {
        return None;
    }
    let batch_dims = a_dims.len() - 2;
    if a_dims[..batch_dims] != b_dims[..batch_dims] {
        return None;
    }
    let (a_tail, b_tail) = (&a_dims[batch_dims..], &b_dims[batch_dims..]);
    let a_common = a_tail.iter().position(|dim| dim.name == *common)?;
    let b_common = b_tail.iter().position(|dim| dim.name == *common)?;
    let (a_own, b_own) = (&a_tail[1 - a_common], &b_tail[1 - b_common]);
    if a_own.name == b_own.name {
        return None;
    }
    let (lhs, rhs, lhs_own, rhs_own, lhs_common, rhs_common) = if a_own.name < b_own.name {
        (a, b, a_own, b_own, a_common, b_common)
    } else {
        (b, a, b_own, a_own, b_common, a_common)
    };
    let shape = MatMulShape {
        lhs_size: lhs_own.size_or_zero(),
        common_size: a_tail[a_common].size_or_zero(),
        rhs_size: rhs_own.size_or_zero(),
        lhs_common_inner: lhs_common == 1,
        rhs_common_inner: rhs_common == 1,
    };
    let batches = a_dims[..batch_dims]
        .iter()
        .map(Dimension::size_or_zero)
        .product();
    Some(ProductPlan {
        lhs,
        rhs,
        shape,
        batch_dims,
        batches,
    })
}

fn matmul(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let plan = product_plan(arena, node)?;
    if plan.batch_dims != 0 {
        return None;
    }
    let result_type = arena.result_type(node).clone();
    Some(arena.push(
        result_type,
        NodeKind::MatMul {
            lhs: plan.lhs,
            rhs: plan.rhs,
            shape: plan.shape,
        },
    ))
}

/// Batch dimensions must match exactly; broadcasting across them stays on
/// the generic path.
fn multi_matmul(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let plan = product_plan(arena, node)?;
    if plan.batch_dims == 0 {
        return None;
    }
    let result_type = arena.result_type(node).clone();
    Some(arena.push(
        result_type,
        NodeKind::MultiMatMul {
            lhs: plan.lhs,
            rhs: plan.rhs,
            shape: plan.shape,
            batches: plan.batches,
        },
    ))
}

fn dense_address(value_type: &ValueType, coords: &[usize]) -> Address {
    value_type
        .dimensions()
        .iter()
        .zip(coords)
        .map(|(dim, coord)| (dim.name.clone(), Label::Indexed(*coord as u32)))
        .collect()
}

/// Cells missing from the create node read a shared constant zero.
fn dense_create(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Create { cells } = arena.kind(node) else {
        return None;
    };
    let result_type = arena.result_type(node).clone();
    if !dense_tensor(&result_type) {
        return None;
    }
    let cells = cells.clone();
    let sizes = sizes_of(&result_type);
    let mut coords = vec![0usize; sizes.len()];
    let mut zero = None;
    let mut children = Vec::with_capacity(result_type.dense_subspace_size());
    loop {
        let child = match cells.get(&dense_address(&result_type, &coords)) {
            Some(child) => *child,
            None => *zero.get_or_insert_with(|| arena.const_value(Value::double(0.0))),
        };
        children.push(child);
        if !next_coordinate(&mut coords, &sizes) {
            break;
        }
    }
    Some(arena.push(result_type, NodeKind::DenseCreate { cells: children }))
}

fn dense_peek(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Peek { child, spec } = arena.kind(node) else {
        return None;
    };
    let child = *child;
    let child_type = arena.result_type(child);
    if !dense_tensor(child_type)
        || !arena.result_type(node).is_double()
        || spec.len() != child_type.dimensions().len()
    {
        return None;
    }
    let sizes = sizes_of(child_type);
    let strides = contiguous_strides(&sizes);
    let mut dims = Vec::with_capacity(sizes.len());
    for (pos, dim) in child_type.dimensions().iter().enumerate() {
        let index = match spec.get(&dim.name)? {
            PeekLabel::Label(Label::Indexed(idx)) => PeekIndex::Fixed(*idx as usize),
            PeekLabel::Label(Label::Mapped(text)) => PeekIndex::Fixed(text.parse().ok()?),
            PeekLabel::Child(id) => PeekIndex::Child(*id),
        };
        dims.push(DensePeekDim {
            size: sizes[pos],
            stride: strides[pos],
            index,
        });
    }
    Some(arena.push(ValueType::double(), NodeKind::DensePeek { child, dims }))
}

/// Concat trees over doubles; inner concats were already rewritten since
/// children are visited first.
fn vector_from_doubles(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Concat {
        lhs,
        rhs,
        dimension,
    } = arena.kind(node)
    else {
        return None;
    };
    let result_type = arena.result_type(node).clone();
    if result_type.dimensions().len() != 1
        || !result_type.is_dense()
        || result_type.cell_type() != CellType::Double
    {
        return None;
    }
    let mut children = Vec::new();
    for side in [*lhs, *rhs] {
        let side_type = arena.result_type(side);
        if side_type.is_double() {
            children.push(side);
            continue;
        }
        match arena.kind(side) {
            NodeKind::VectorFromDoubles { children: inner }
                if side_type.dimensions().len() == 1
                    && side_type.dimension_index(dimension) == Some(0) =>
            {
                children.extend(inner.iter().copied());
            }
            _ => return None,
        }
    }
    Some(arena.push(result_type, NodeKind::VectorFromDoubles { children }))
}

struct IndexDim {
    size: usize,
    stride: usize,
    expr: CompiledExpr,
}

/// Source cell addressing of a lambda whose body peeks one dense binding
/// with index expressions over the lambda's own coordinates.
struct LambdaPeekPlan {
    result_type: ValueType,
    source_type: ValueType,
    dims: Vec<IndexDim>,
}

impl LambdaPeekPlan {
    fn new(
        result_type: &ValueType,
        source_type: &ValueType,
        index_exprs: &[(String, ScalarExpr)],
    ) -> Option<Self> {
        if index_exprs.len() != source_type.dimensions().len() {
            return None;
        }
        let result_dims = result_type.dimension_names();
        let sizes = sizes_of(source_type);
        let strides = contiguous_strides(&sizes);
        let mut dims = Vec::with_capacity(sizes.len());
        for (pos, dim) in source_type.dimensions().iter().enumerate() {
            let (_, expr) = index_exprs.iter().find(|(name, _)| *name == dim.name)?;
            if !expr.is_closed() {
                return None;
            }
            dims.push(IndexDim {
                size: sizes[pos],
                stride: strides[pos],
                expr: CompiledExpr::compile(expr, &result_dims)?,
            });
        }
        Some(Self {
            result_type: result_type.clone(),
            source_type: source_type.clone(),
            dims,
        })
    }

    fn signature(&self) -> String {
        let dims = self
            .dims
            .iter()
            .map(|dim| format!("{}:[{}]", dim.stride, dim.expr.signature()))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}|{}|{dims}",
            self.result_type.to_spec(),
            self.source_type.to_spec()
        )
    }

    fn source_index(&self, coords: &[usize]) -> Option<u32> {
        let mut idx = 0usize;
        for dim in &self.dims {
            let value = dim.expr.eval(coords, &NoBindings);
            idx += index_from_f64(value, dim.size)? * dim.stride;
        }
        u32::try_from(idx).ok()
    }

    /// Source index per result cell, last dimension fastest. `None` when any
    /// index falls outside the source.
    fn enumerate(&self) -> Option<Vec<u32>> {
        #[cfg(test)]
        tests::ENUMERATIONS.with(|count| count.set(count.get() + 1));
        let sizes = sizes_of(&self.result_type);
        let mut coords = vec![0usize; sizes.len()];
        let mut table = Vec::with_capacity(self.result_type.dense_subspace_size());
        loop {
            table.push(self.source_index(&coords)?);
            if !next_coordinate(&mut coords, &sizes) {
                break;
            }
        }
        Some(table)
    }
}

fn lambda_peek(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Lambda {
        expr: ScalarExpr::Peek {
            binding,
            dims: index_exprs,
        },
        bindings,
        ..
    } = arena.kind(node)
    else {
        return None;
    };
    let source = *bindings.get(*binding)?;
    let result_type = arena.result_type(node).clone();
    let source_type = arena.result_type(source).clone();
    if !dense_tensor(&result_type)
        || !dense_tensor(&source_type)
        || source_type.cell_type() != result_type.cell_type()
    {
        return None;
    }
    let plan = LambdaPeekPlan::new(&result_type, &source_type, index_exprs)?;
    let token = IndexLookupTable::create(plan.signature(), || plan.enumerate())?;
    let table = token.table();
    let offset = *table.first()? as usize;
    let length = table.len();
    let contiguous = table
        .iter()
        .enumerate()
        .all(|(pos, idx)| *idx as usize == offset + pos);
    if contiguous {
        // Ranges need no table; releasing the token evicts it unless shared.
        drop(token);
        if offset == 0 && length == source_type.dense_subspace_size() {
            return Some(replace_type(arena, source, result_type));
        }
        return Some(arena.push(
            result_type,
            NodeKind::CellRange {
                child: source,
                offset,
                length,
            },
        ));
    }
    Some(arena.push(
        result_type,
        NodeKind::LambdaPeek {
            child: source,
            table: Arc::new(token),
        },
    ))
}

/// Renames that keep the relative order of the non-trivial dimensions do
/// not move any cell.
fn rename_compaction(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Rename { child, from, to } = arena.kind(node) else {
        return None;
    };
    let child = *child;
    let result_type = arena.result_type(node).clone();
    if !dense_tensor(&result_type) {
        return None;
    }
    let renamed: Vec<&str> = arena
        .result_type(child)
        .nontrivial_indexed_dimensions()
        .into_iter()
        .map(|dim| {
            from.iter()
                .position(|name| *name == dim.name)
                .map_or(dim.name.as_str(), |pos| to[pos].as_str())
        })
        .collect();
    let expected: Vec<&str> = result_type
        .nontrivial_indexed_dimensions()
        .into_iter()
        .map(|dim| dim.name.as_str())
        .collect();
    if renamed != expected {
        return None;
    }
    Some(replace_type(arena, child, result_type))
}

/// Reducing only size-one dimensions with an aggregator that returns a
/// lone input unchanged.
fn remove_trivial_dimension(
    arena: &mut FunctionArena,
    node: NodeId,
    _: &PassConfig,
) -> Option<NodeId> {
    let NodeKind::Reduce { child, aggr, dims } = arena.kind(node) else {
        return None;
    };
    let child = *child;
    let child_type = arena.result_type(child);
    let result_type = arena.result_type(node).clone();
    if !aggr.is_ident()
        || !dense_tensor(child_type)
        || result_type.is_error()
        || child_type.cell_type() != result_type.cell_type()
    {
        return None;
    }
    let all_trivial = child_type
        .dimensions()
        .iter()
        .filter(|dim| dims.is_empty() || dims.contains(&dim.name))
        .all(Dimension::is_trivial);
    if !all_trivial {
        return None;
    }
    Some(replace_type(arena, child, result_type))
}

fn is_trivial_one(arena: &FunctionArena, node: NodeId) -> bool {
    let NodeKind::ConstValue { value } = arena.kind(node) else {
        return false;
    };
    let value_type = value.value_type();
    value_type.is_dense()
        && value_type.dimensions().iter().all(Dimension::is_trivial)
        && value.cells().len() == 1
        && value.cells().get(0) == 1.0
}

/// Multiplying by a constant one with only size-one dimensions.
fn add_trivial_dimension(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Join {
        lhs,
        rhs,
        op: Op2::Mul,
    } = arena.kind(node)
    else {
        return None;
    };
    let (lhs, rhs) = (*lhs, *rhs);
    let result_type = arena.result_type(node).clone();
    if !result_type.is_dense() {
        return None;
    }
    for (ones, other) in [(lhs, rhs), (rhs, lhs)] {
        let other_type = arena.result_type(other);
        if is_trivial_one(arena, ones)
            && other_type.is_dense()
            && other_type.cell_type() == result_type.cell_type()
        {
            return Some(replace_type(arena, other, result_type));
        }
    }
    None
}

fn simple_map(arena: &mut FunctionArena, node: NodeId, config: &PassConfig) -> Option<NodeId> {
    let NodeKind::Map { child, op } = arena.kind(node) else {
        return None;
    };
    let (child, op) = (*child, *op);
    let result_type = arena.result_type(node).clone();
    if !result_type.is_dense() {
        return None;
    }
    let inplace = config.inplace
        && arena.result_is_mutable(child)
        && arena.result_type(child) == &result_type;
    Some(arena.push(result_type, NodeKind::SimpleMap { child, op, inplace }))
}

/// Operand whose cells drive the loop. Larger subspace wins; on equal size
/// a reusable operand wins, and rhs otherwise.
fn primary_is_lhs(arena: &FunctionArena, lhs: NodeId, rhs: NodeId, result_type: &ValueType) -> bool {
    let reusable = |id: NodeId| {
        arena.result_is_mutable(id) && arena.result_type(id).cell_type() == result_type.cell_type()
    };
    let lhs_size = arena.result_type(lhs).dense_subspace_size();
    let rhs_size = arena.result_type(rhs).dense_subspace_size();
    match lhs_size.cmp(&rhs_size) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => reusable(lhs) && !reusable(rhs),
    }
}

/// Classifies the secondary non-trivial dimensions against the primary
/// ones: equal, prefix or suffix.
#[must_use]
pub fn classify_overlap(primary: &ValueType, secondary: &ValueType) -> Option<Overlap> {
    let primary_dims = nontrivial_dims(primary);
    let secondary_dims = nontrivial_dims(secondary);
    if primary_dims == secondary_dims {
        Some(Overlap::Full)
    } else if primary_dims.starts_with(&secondary_dims) {
        Some(Overlap::Outer)
    } else if primary_dims.ends_with(&secondary_dims) {
        Some(Overlap::Inner)
    } else {
        None
    }
}

fn simple_join(arena: &mut FunctionArena, node: NodeId, config: &PassConfig) -> Option<NodeId> {
    let NodeKind::Join { lhs, rhs, op } = arena.kind(node) else {
        return None;
    };
    let (lhs, rhs, op) = (*lhs, *rhs, *op);
    let result_type = arena.result_type(node).clone();
    if !result_type.is_dense()
        || !arena.result_type(lhs).is_dense()
        || !arena.result_type(rhs).is_dense()
    {
        return None;
    }
    let primary_is_lhs = primary_is_lhs(arena, lhs, rhs, &result_type);
    let (primary, secondary) = if primary_is_lhs { (lhs, rhs) } else { (rhs, lhs) };
    let (primary_type, secondary_type) = (arena.result_type(primary), arena.result_type(secondary));
    let overlap = classify_overlap(primary_type, secondary_type)?;
    if nontrivial_dims(primary_type) != nontrivial_dims(&result_type) {
        return None;
    }
    let factor = primary_type.dense_subspace_size() / secondary_type.dense_subspace_size();
    let inplace =
        config.inplace && arena.result_is_mutable(primary) && primary_type == &result_type;
    trace!(
        node = node.0,
        overlap = overlap.name(),
        factor,
        primary_is_lhs,
        inplace,
        "simple join classified"
    );
    Some(arena.push(
        result_type,
        NodeKind::SimpleJoin {
            lhs,
            rhs,
            op,
            shape: JoinShape {
                overlap,
                factor,
                primary_is_lhs,
            },
            inplace,
        },
    ))
}

/// Exactly one non-trivial dimension is reduced.
fn single_reduce(arena: &mut FunctionArena, node: NodeId, _: &PassConfig) -> Option<NodeId> {
    let NodeKind::Reduce { child, aggr, dims } = arena.kind(node) else {
        return None;
    };
    let (child, aggr) = (*child, *aggr);
    let child_type = arena.result_type(child);
    let result_type = arena.result_type(node).clone();
    if !dense_tensor(child_type) || !result_type.is_dense() {
        return None;
    }
    let reduced: Vec<usize> = child_type
        .dimensions()
        .iter()
        .enumerate()
        .filter(|(_, dim)| !dim.is_trivial() && (dims.is_empty() || dims.contains(&dim.name)))
        .map(|(pos, _)| pos)
        .collect();
    let [pos] = reduced.as_slice() else {
        return None;
    };
    let sizes = sizes_of(child_type);
    let outer = sizes[..*pos].iter().product();
    let inner = sizes[pos + 1..].iter().product();
    let reduce = sizes[*pos];
    Some(arena.push(
        result_type,
        NodeKind::SingleReduce {
            child,
            aggr,
            outer,
            reduce,
            inner,
        },
    ))
}
