#![forbid(unsafe_code)]

mod expr;
mod lookup;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use et_core::{Aggr, CellType, Op1, Op2, ValueType};
use et_kernel_cpu::{JoinShape, MatMulShape};
use et_storage::{Address, Label, TensorSpec, Value};

pub use expr::{CompiledExpr, ExprBindings, ExprOp, NoBindings, ScalarExpr};
pub use lookup::{IndexLookupTable, IndexTableToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Label of a peeked dimension: fixed, or computed by a scalar child.
#[derive(Debug, Clone, PartialEq)]
pub enum PeekLabel {
    Label(Label),
    Child(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekIndex {
    Fixed(usize),
    Child(NodeId),
}

/// Index along a dimension of `size` addressed by a computed label. The
/// label is truncated toward zero; `None` when it falls outside.
#[must_use]
pub fn index_from_f64(value: f64, size: usize) -> Option<usize> {
    let idx = value.trunc();
    (idx >= 0.0 && idx < size as f64).then_some(idx as usize)
}

/// One dimension of a full dense peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensePeekDim {
    pub size: usize,
    pub stride: usize,
    pub index: PeekIndex,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Inject {
        param: usize,
    },
    ConstValue {
        value: Value,
    },
    Map {
        child: NodeId,
        op: Op1,
    },
    Join {
        lhs: NodeId,
        rhs: NodeId,
        op: Op2,
    },
    Merge {
        lhs: NodeId,
        rhs: NodeId,
        op: Op2,
    },
    Reduce {
        child: NodeId,
        aggr: Aggr,
        dims: Vec<String>,
    },
    Rename {
        child: NodeId,
        from: Vec<String>,
        to: Vec<String>,
    },
    Concat {
        lhs: NodeId,
        rhs: NodeId,
        dimension: String,
    },
    /// Dense tensor computed cell by cell; `bindings` are evaluated first.
    Lambda {
        expr: ScalarExpr,
        compiled: CompiledExpr,
        bindings: Vec<NodeId>,
    },
    Peek {
        child: NodeId,
        spec: BTreeMap<String, PeekLabel>,
    },
    /// Cells given by scalar children.
    Create {
        cells: BTreeMap<Address, NodeId>,
    },
    CellCast {
        child: NodeId,
        cell_type: CellType,
    },
    CellRange {
        child: NodeId,
        offset: usize,
        length: usize,
    },
    /// Same cells, different type.
    ReplaceType {
        child: NodeId,
    },
    LambdaPeek {
        child: NodeId,
        table: Arc<IndexTableToken>,
    },
    DotProduct {
        lhs: NodeId,
        rhs: NodeId,
    },
    SparseDotProduct {
        lhs: NodeId,
        rhs: NodeId,
    },
    MatMul {
        lhs: NodeId,
        rhs: NodeId,
        shape: MatMulShape,
    },
    MultiMatMul {
        lhs: NodeId,
        rhs: NodeId,
        shape: MatMulShape,
        batches: usize,
    },
    SimpleJoin {
        lhs: NodeId,
        rhs: NodeId,
        op: Op2,
        shape: JoinShape,
        inplace: bool,
    },
    SimpleMap {
        child: NodeId,
        op: Op1,
        inplace: bool,
    },
    SingleReduce {
        child: NodeId,
        aggr: Aggr,
        outer: usize,
        reduce: usize,
        inner: usize,
    },
    /// Dense cells from scalar children, in row-major order.
    DenseCreate {
        cells: Vec<NodeId>,
    },
    /// Single cell of a dense tensor addressed in every dimension.
    DensePeek {
        child: NodeId,
        dims: Vec<DensePeekDim>,
    },
    VectorFromDoubles {
        children: Vec<NodeId>,
    },
}

impl NodeKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inject { .. } => "inject",
            Self::ConstValue { .. } => "const_value",
            Self::Map { .. } => "map",
            Self::Join { .. } => "join",
            Self::Merge { .. } => "merge",
            Self::Reduce { .. } => "reduce",
            Self::Rename { .. } => "rename",
            Self::Concat { .. } => "concat",
            Self::Lambda { .. } => "lambda",
            Self::Peek { .. } => "peek",
            Self::Create { .. } => "create",
            Self::CellCast { .. } => "cell_cast",
            Self::CellRange { .. } => "cell_range",
            Self::ReplaceType { .. } => "replace_type",
            Self::LambdaPeek { .. } => "lambda_peek",
            Self::DotProduct { .. } => "dot_product",
            Self::SparseDotProduct { .. } => "sparse_dot_product",
            Self::MatMul { .. } => "matmul",
            Self::MultiMatMul { .. } => "multi_matmul",
            Self::SimpleJoin { inplace: true, .. } => "inplace_join",
            Self::SimpleJoin { .. } => "simple_join",
            Self::SimpleMap { inplace: true, .. } => "inplace_map",
            Self::SimpleMap { .. } => "simple_map",
            Self::SingleReduce { .. } => "single_reduce",
            Self::DenseCreate { .. } => "dense_create",
            Self::DensePeek { .. } => "dense_peek",
            Self::VectorFromDoubles { .. } => "vector_from_doubles",
        }
    }

    /// Kinds produced by the optimizer.
    #[must_use]
    pub fn is_specialized(&self) -> bool {
        !matches!(
            self,
            Self::Inject { .. }
                | Self::ConstValue { .. }
                | Self::Map { .. }
                | Self::Join { .. }
                | Self::Merge { .. }
                | Self::Reduce { .. }
                | Self::Rename { .. }
                | Self::Concat { .. }
                | Self::Lambda { .. }
                | Self::Peek { .. }
                | Self::Create { .. }
                | Self::CellCast { .. }
        )
    }

    /// Appends the immediate children in evaluation order.
    pub fn push_children(&self, out: &mut Vec<NodeId>) {
        match self {
            Self::Inject { .. } | Self::ConstValue { .. } => {}
            Self::Map { child, .. }
            | Self::Reduce { child, .. }
            | Self::Rename { child, .. }
            | Self::CellCast { child, .. }
            | Self::CellRange { child, .. }
            | Self::ReplaceType { child }
            | Self::LambdaPeek { child, .. }
            | Self::SimpleMap { child, .. }
            | Self::SingleReduce { child, .. } => out.push(*child),
            Self::Join { lhs, rhs, .. }
            | Self::Merge { lhs, rhs, .. }
            | Self::Concat { lhs, rhs, .. }
            | Self::DotProduct { lhs, rhs }
            | Self::SparseDotProduct { lhs, rhs }
            | Self::MatMul { lhs, rhs, .. }
            | Self::MultiMatMul { lhs, rhs, .. }
            | Self::SimpleJoin { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            Self::Lambda { bindings, .. } => out.extend(bindings.iter().copied()),
            Self::Peek { child, spec } => {
                out.push(*child);
                out.extend(spec.values().filter_map(|label| match label {
                    PeekLabel::Child(id) => Some(*id),
                    PeekLabel::Label(_) => None,
                }));
            }
            Self::Create { cells } => out.extend(cells.values().copied()),
            Self::DenseCreate { cells } => out.extend(cells.iter().copied()),
            Self::DensePeek { child, dims } => {
                out.push(*child);
                out.extend(dims.iter().filter_map(|dim| match dim.index {
                    PeekIndex::Child(id) => Some(id),
                    PeekIndex::Fixed(_) => None,
                }));
            }
            Self::VectorFromDoubles { children } => out.extend(children.iter().copied()),
        }
    }

    #[must_use]
    pub fn children(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.push_children(&mut out);
        out
    }

    /// Child slots in the same order as [`NodeKind::push_children`].
    fn children_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            Self::Inject { .. } | Self::ConstValue { .. } => Vec::new(),
            Self::Map { child, .. }
            | Self::Reduce { child, .. }
            | Self::Rename { child, .. }
            | Self::CellCast { child, .. }
            | Self::CellRange { child, .. }
            | Self::ReplaceType { child }
            | Self::LambdaPeek { child, .. }
            | Self::SimpleMap { child, .. }
            | Self::SingleReduce { child, .. } => vec![child],
            Self::Join { lhs, rhs, .. }
            | Self::Merge { lhs, rhs, .. }
            | Self::Concat { lhs, rhs, .. }
            | Self::DotProduct { lhs, rhs }
            | Self::SparseDotProduct { lhs, rhs }
            | Self::MatMul { lhs, rhs, .. }
            | Self::MultiMatMul { lhs, rhs, .. }
            | Self::SimpleJoin { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Lambda { bindings, .. } => bindings.iter_mut().collect(),
            Self::Peek { child, spec } => {
                let mut out = vec![child];
                out.extend(spec.values_mut().filter_map(|label| match label {
                    PeekLabel::Child(id) => Some(id),
                    PeekLabel::Label(_) => None,
                }));
                out
            }
            Self::Create { cells } => cells.values_mut().collect(),
            Self::DenseCreate { cells } => cells.iter_mut().collect(),
            Self::DensePeek { child, dims } => {
                let mut out = vec![child];
                out.extend(dims.iter_mut().filter_map(|dim| match &mut dim.index {
                    PeekIndex::Child(id) => Some(id),
                    PeekIndex::Fixed(_) => None,
                }));
                out
            }
            Self::VectorFromDoubles { children } => children.iter_mut().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    result_type: ValueType,
    kind: NodeKind,
}

impl Node {
    #[must_use]
    pub fn result_type(&self) -> &ValueType {
        &self.result_type
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

/// Position a node is referenced from: the root, or a child slot of a
/// parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Root,
    Child { parent: NodeId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionError {
    UnknownNode(NodeId),
    NoSuchChild { parent: NodeId, index: usize },
    NoRoot,
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::NoSuchChild { parent, index } => {
                write!(f, "node {} has no child slot {index}", parent.0)
            }
            Self::NoRoot => write!(f, "tensor function has no root"),
        }
    }
}

impl std::error::Error for FunctionError {}

/// Owns every node of one tensor function. Nodes are never mutated after
/// creation except through child slot swaps.
#[derive(Debug, Clone, Default)]
pub struct FunctionArena {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl FunctionArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        assert!(root.0 < self.nodes.len(), "root must belong to this arena");
        self.root = Some(root);
    }

    /// Node lookup; ids always come from this arena.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn try_node(&self, id: NodeId) -> Result<&Node, FunctionError> {
        self.nodes.get(id.0).ok_or(FunctionError::UnknownNode(id))
    }

    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    #[must_use]
    pub fn result_type(&self, id: NodeId) -> &ValueType {
        &self.nodes[id.0].result_type
    }

    /// Whether the node's result buffer is freshly owned and may be
    /// written by its consumer.
    #[must_use]
    pub fn result_is_mutable(&self, id: NodeId) -> bool {
        match self.kind(id) {
            NodeKind::Inject { .. } | NodeKind::ConstValue { .. } | NodeKind::CellRange { .. } => {
                false
            }
            NodeKind::ReplaceType { child } => self.result_is_mutable(*child),
            _ => true,
        }
    }

    /// Adds a node whose result type the caller has already derived.
    pub fn push(&mut self, result_type: ValueType, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug_assert!(
            kind.children().iter().all(|child| child.0 < id.0),
            "children must exist before their parent"
        );
        self.nodes.push(Node { result_type, kind });
        id
    }

    pub fn slot_node(&self, slot: Slot) -> Result<NodeId, FunctionError> {
        match slot {
            Slot::Root => self.root.ok_or(FunctionError::NoRoot),
            Slot::Child { parent, index } => self
                .try_node(parent)?
                .kind
                .children()
                .get(index)
                .copied()
                .ok_or(FunctionError::NoSuchChild { parent, index }),
        }
    }

    /// Points `slot` at `node`; the previous occupant stays in the arena.
    pub fn replace(&mut self, slot: Slot, node: NodeId) -> Result<(), FunctionError> {
        self.try_node(node)?;
        match slot {
            Slot::Root => {
                self.root = Some(node);
                Ok(())
            }
            Slot::Child { parent, index } => {
                let parent_node = self
                    .nodes
                    .get_mut(parent.0)
                    .ok_or(FunctionError::UnknownNode(parent))?;
                let mut children = parent_node.kind.children_mut();
                let target = children
                    .get_mut(index)
                    .ok_or(FunctionError::NoSuchChild { parent, index })?;
                **target = node;
                Ok(())
            }
        }
    }

    pub fn replace_child(
        &mut self,
        parent: NodeId,
        index: usize,
        node: NodeId,
    ) -> Result<(), FunctionError> {
        self.replace(Slot::Child { parent, index }, node)
    }

    /// Every slot reachable from the root, parents before children,
    /// collected with an explicit worklist.
    pub fn slots_from_root(&self) -> Result<Vec<Slot>, FunctionError> {
        self.root.ok_or(FunctionError::NoRoot)?;
        let mut slots = vec![Slot::Root];
        let mut next = 0;
        while next < slots.len() {
            let node = self.slot_node(slots[next])?;
            let count = self.kind(node).children().len();
            slots.extend((0..count).map(|index| Slot::Child {
                parent: node,
                index,
            }));
            next += 1;
        }
        Ok(slots)
    }

    /// Nested `name(child, ...)` rendering of the tree under `id`.
    #[must_use]
    pub fn dump(&self, id: NodeId) -> String {
        let kind = self.kind(id);
        let children = kind.children();
        if children.is_empty() {
            return kind.name().to_string();
        }
        let inner: Vec<String> = children.iter().map(|child| self.dump(*child)).collect();
        format!("{}({})", kind.name(), inner.join(", "))
    }

    pub fn inject(&mut self, value_type: ValueType, param: usize) -> NodeId {
        self.push(value_type, NodeKind::Inject { param })
    }

    pub fn const_value(&mut self, value: Value) -> NodeId {
        let value_type = value.value_type().clone();
        self.push(value_type, NodeKind::ConstValue { value })
    }

    pub fn map(&mut self, child: NodeId, op: Op1) -> NodeId {
        let value_type = self.result_type(child).map();
        self.push(value_type, NodeKind::Map { child, op })
    }

    pub fn join(&mut self, lhs: NodeId, rhs: NodeId, op: Op2) -> NodeId {
        let value_type = ValueType::join(self.result_type(lhs), self.result_type(rhs));
        self.push(value_type, NodeKind::Join { lhs, rhs, op })
    }

    pub fn merge(&mut self, lhs: NodeId, rhs: NodeId, op: Op2) -> NodeId {
        let value_type = ValueType::merge(self.result_type(lhs), self.result_type(rhs));
        self.push(value_type, NodeKind::Merge { lhs, rhs, op })
    }

    pub fn reduce(&mut self, child: NodeId, aggr: Aggr, dims: &[&str]) -> NodeId {
        let dims: Vec<String> = dims.iter().map(|dim| (*dim).to_string()).collect();
        let value_type = self.result_type(child).reduce(&dims);
        self.push(value_type, NodeKind::Reduce { child, aggr, dims })
    }

    pub fn rename(&mut self, child: NodeId, from: &[&str], to: &[&str]) -> NodeId {
        let from: Vec<String> = from.iter().map(|dim| (*dim).to_string()).collect();
        let to: Vec<String> = to.iter().map(|dim| (*dim).to_string()).collect();
        let value_type = self.result_type(child).rename(&from, &to);
        self.push(value_type, NodeKind::Rename { child, from, to })
    }

    pub fn concat(&mut self, lhs: NodeId, rhs: NodeId, dimension: &str) -> NodeId {
        let value_type =
            ValueType::concat(self.result_type(lhs), self.result_type(rhs), dimension);
        self.push(
            value_type,
            NodeKind::Concat {
                lhs,
                rhs,
                dimension: dimension.to_string(),
            },
        )
    }

    /// Dense lambda; the result type is the error type when the type is not
    /// dense, a dimension name does not resolve or a binding is missing.
    pub fn lambda(
        &mut self,
        value_type: ValueType,
        expr: ScalarExpr,
        bindings: Vec<NodeId>,
    ) -> NodeId {
        let compiled = CompiledExpr::compile(&expr, &value_type.dimension_names());
        let (value_type, compiled) = match compiled {
            Some(compiled)
                if value_type.is_dense()
                    && !value_type.is_double()
                    && compiled.num_bindings() <= bindings.len() =>
            {
                (value_type, compiled)
            }
            _ => (ValueType::error(), CompiledExpr::constant(0.0)),
        };
        self.push(
            value_type,
            NodeKind::Lambda {
                expr,
                compiled,
                bindings,
            },
        )
    }

    pub fn peek(&mut self, child: NodeId, spec: Vec<(&str, PeekLabel)>) -> NodeId {
        let spec: BTreeMap<String, PeekLabel> = spec
            .into_iter()
            .map(|(name, label)| (name.to_string(), label))
            .collect();
        let dims: Vec<String> = spec.keys().cloned().collect();
        let value_type = self.result_type(child).peek(&dims);
        self.push(value_type, NodeKind::Peek { child, spec })
    }

    /// Tensor with one scalar child per listed cell. Addresses that do not
    /// fit the type give the error type.
    pub fn create(&mut self, value_type: ValueType, cells: Vec<(Address, NodeId)>) -> NodeId {
        let mut check = TensorSpec::new(value_type.clone());
        for (addr, _) in &cells {
            check.add(addr.clone(), 0.0);
        }
        let value_type = if check.is_error() {
            ValueType::error()
        } else {
            value_type
        };
        let cells = cells
            .into_iter()
            .map(|(addr, child)| (canonical_labels(check.value_type(), addr), child))
            .collect();
        self.push(value_type, NodeKind::Create { cells })
    }

    pub fn cell_cast(&mut self, child: NodeId, cell_type: CellType) -> NodeId {
        let value_type = self.result_type(child).cell_cast(cell_type);
        self.push(value_type, NodeKind::CellCast { child, cell_type })
    }
}

/// Numeric strings on indexed dimensions become indexes.
fn canonical_labels(value_type: &ValueType, addr: Address) -> Address {
    addr.into_iter()
        .map(|(name, label)| {
            let indexed = value_type
                .dimension_index(&name)
                .is_some_and(|pos| value_type.dimensions()[pos].is_indexed());
            let label = match label {
                Label::Mapped(text) if indexed => match text.parse::<u32>() {
                    Ok(idx) => Label::Indexed(idx),
                    Err(_) => Label::Mapped(text),
                },
                Label::Indexed(idx) if !indexed => Label::Mapped(idx.to_string()),
                other => other,
            };
            (name, label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use et_core::{Aggr, CellType, Op1, Op2, ValueType};
    use et_storage::{Label, Value, address};

    use super::{
        CompiledExpr, ExprOp, FunctionArena, FunctionError, NodeId, NodeKind, PeekLabel,
        ScalarExpr, Slot, index_from_f64,
    };

    fn ty(spec: &str) -> ValueType {
        ValueType::from_spec(spec)
    }

    #[test]
    fn builders_derive_result_types() {
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[2])"), 0);
        let b = arena.inject(ty("tensor<float>(y[3])"), 1);
        let joined = arena.join(a, b, Op2::Mul);
        assert_eq!(arena.result_type(joined).to_spec(), "tensor(x[2],y[3])");
        let reduced = arena.reduce(joined, Aggr::Sum, &["y"]);
        assert_eq!(arena.result_type(reduced).to_spec(), "tensor(x[2])");
        let renamed = arena.rename(reduced, &["x"], &["z"]);
        assert_eq!(arena.result_type(renamed).to_spec(), "tensor(z[2])");
        let cast = arena.cell_cast(renamed, CellType::Float);
        assert_eq!(arena.result_type(cast).to_spec(), "tensor<float>(z[2])");
        let concat = arena.concat(cast, cast, "z");
        assert_eq!(arena.result_type(concat).to_spec(), "tensor<float>(z[4])");
    }

    #[test]
    fn type_errors_propagate_through_builders() {
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[2])"), 0);
        let b = arena.inject(ty("tensor(x[3])"), 1);
        let bad = arena.join(a, b, Op2::Add);
        assert!(arena.result_type(bad).is_error());
        let mapped = arena.map(bad, Op1::Neg);
        assert!(arena.result_type(mapped).is_error());

        let sparse_lambda = arena.lambda(ty("tensor(x{})"), ScalarExpr::Const(1.0), vec![]);
        assert!(arena.result_type(sparse_lambda).is_error());
        let unbound = arena.lambda(ty("tensor(x[2])"), ScalarExpr::Binding(0), vec![]);
        assert!(arena.result_type(unbound).is_error());
        let NodeKind::Lambda { compiled, .. } = arena.kind(unbound) else {
            panic!("rejected lambda should stay a lambda node");
        };
        assert_eq!(compiled.ops(), &[ExprOp::Const(0.0)]);
        assert_eq!(compiled.num_bindings(), 0);

        let bad_cell = arena.const_value(Value::double(1.0));
        let create = arena.create(ty("tensor(x[2])"), vec![(address(&[("x", 5.into())]), bad_cell)]);
        assert!(arena.result_type(create).is_error());
    }

    #[test]
    fn children_are_listed_in_evaluation_order() {
        let mut arena = FunctionArena::new();
        let t = arena.inject(ty("tensor(x[3],y{})"), 0);
        let idx = arena.const_value(Value::double(1.0));
        let peek = arena.peek(t, vec![
            ("x", PeekLabel::Child(idx)),
            ("y", PeekLabel::Label(Label::from("a"))),
        ]);
        assert_eq!(arena.kind(peek).children(), vec![t, idx]);
        assert_eq!(arena.result_type(peek).to_spec(), "double");

        let one = arena.const_value(Value::double(1.0));
        let two = arena.const_value(Value::double(2.0));
        let create = arena.create(ty("tensor(x[2])"), vec![
            (address(&[("x", Label::from("1"))]), two),
            (address(&[("x", 0.into())]), one),
        ]);
        assert_eq!(arena.kind(create).children(), vec![one, two]);
    }

    #[test]
    fn mutability_follows_node_kind() {
        let mut arena = FunctionArena::new();
        let param = arena.inject(ty("tensor(x[4])"), 0);
        let mapped = arena.map(param, Op1::Neg);
        let range = arena.push(ty("tensor(x[2])"), NodeKind::CellRange {
            child: mapped,
            offset: 1,
            length: 2,
        });
        let over_param = arena.push(ty("tensor(y[4])"), NodeKind::ReplaceType { child: param });
        let over_map = arena.push(ty("tensor(y[4])"), NodeKind::ReplaceType { child: mapped });
        assert!(!arena.result_is_mutable(param));
        assert!(arena.result_is_mutable(mapped));
        assert!(!arena.result_is_mutable(range));
        assert!(!arena.result_is_mutable(over_param));
        assert!(arena.result_is_mutable(over_map));
    }

    #[test]
    fn slots_are_swapped_without_touching_nodes() {
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[2])"), 0);
        let b = arena.inject(ty("tensor(x[2])"), 1);
        let join = arena.join(a, b, Op2::Add);
        let root = arena.map(join, Op1::Neg);
        arena.set_root(root);

        let slots = arena.slots_from_root().expect("root is set");
        assert_eq!(slots, vec![
            Slot::Root,
            Slot::Child { parent: root, index: 0 },
            Slot::Child { parent: join, index: 0 },
            Slot::Child { parent: join, index: 1 },
        ]);

        let c = arena.inject(ty("tensor(x[2])"), 2);
        arena
            .replace(Slot::Child { parent: join, index: 1 }, c)
            .expect("slot exists");
        assert_eq!(arena.kind(join).children(), vec![a, c]);
        assert_eq!(arena.dump(root), "map(join(inject, inject))");

        let err = arena
            .replace(Slot::Child { parent: join, index: 2 }, c)
            .expect_err("join has two slots");
        assert_eq!(err, FunctionError::NoSuchChild { parent: join, index: 2 });
        assert!(matches!(
            arena.replace(Slot::Root, NodeId(99)),
            Err(FunctionError::UnknownNode(NodeId(99)))
        ));
    }

    #[test]
    fn computed_labels_truncate_toward_zero() {
        assert_eq!(index_from_f64(2.9, 3), Some(2));
        assert_eq!(index_from_f64(-0.5, 3), Some(0));
        assert_eq!(index_from_f64(3.0, 3), None);
        assert_eq!(index_from_f64(-1.0, 3), None);
        assert_eq!(index_from_f64(f64::NAN, 3), None);
    }

    #[test]
    fn specialized_kinds_are_reported() {
        let mut arena = FunctionArena::new();
        let a = arena.inject(ty("tensor(x[2])"), 0);
        let map = arena.push(ty("tensor(x[2])"), NodeKind::SimpleMap {
            child: a,
            op: Op1::Neg,
            inplace: true,
        });
        assert!(arena.kind(map).is_specialized());
        assert_eq!(arena.kind(map).name(), "inplace_map");
        assert!(!arena.kind(a).is_specialized());
    }
}
