#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Double,
    Float,
}

impl CellType {
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::Double => 8,
            Self::Float => 4,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Float => "float",
        }
    }

    /// Result cell type when cells of both types are combined.
    #[must_use]
    pub const fn unify(self, other: Self) -> Self {
        match (self, other) {
            (Self::Float, Self::Float) => Self::Float,
            _ => Self::Double,
        }
    }

    #[must_use]
    pub const fn all() -> &'static [CellType] {
        &[CellType::Double, CellType::Float]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

/// Numeric cell storage. Kernels are generic over this trait so every
/// (cell type, flag) combination is a separate monomorphized function.
pub trait Cell:
    Copy
    + Default
    + PartialEq
    + PartialOrd
    + fmt::Debug
    + Send
    + Sync
    + 'static
    + std::ops::Add<Output = Self>
    + std::ops::Mul<Output = Self>
{
    const CELL_TYPE: CellType;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn unwrap_cells(cells: TypedCells<'_>) -> &[Self];

    fn unwrap_buffer_mut(buffer: &mut CellBuffer) -> &mut [Self];

    fn wrap_vec(cells: Vec<Self>) -> CellBuffer;
}

impl Cell for f64 {
    const CELL_TYPE: CellType = CellType::Double;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn unwrap_cells(cells: TypedCells<'_>) -> &[Self] {
        match cells {
            TypedCells::Double(cells) => cells,
            TypedCells::Float(_) => panic!("expected double cells, found float cells"),
        }
    }

    fn unwrap_buffer_mut(buffer: &mut CellBuffer) -> &mut [Self] {
        match buffer {
            CellBuffer::Double(cells) => cells.as_mut_slice(),
            CellBuffer::Float(_) => panic!("expected double buffer, found float buffer"),
        }
    }

    fn wrap_vec(cells: Vec<Self>) -> CellBuffer {
        CellBuffer::Double(cells)
    }
}

impl Cell for f32 {
    const CELL_TYPE: CellType = CellType::Float;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn unwrap_cells(cells: TypedCells<'_>) -> &[Self] {
        match cells {
            TypedCells::Float(cells) => cells,
            TypedCells::Double(_) => panic!("expected float cells, found double cells"),
        }
    }

    fn unwrap_buffer_mut(buffer: &mut CellBuffer) -> &mut [Self] {
        match buffer {
            CellBuffer::Float(cells) => cells.as_mut_slice(),
            CellBuffer::Double(_) => panic!("expected float buffer, found double buffer"),
        }
    }

    fn wrap_vec(cells: Vec<Self>) -> CellBuffer {
        CellBuffer::Float(cells)
    }
}

/// Non-owning view of a cell array tagged with its element width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedCells<'a> {
    Double(&'a [f64]),
    Float(&'a [f32]),
}

impl<'a> TypedCells<'a> {
    #[must_use]
    pub fn cell_type(&self) -> CellType {
        match self {
            Self::Double(_) => CellType::Double,
            Self::Float(_) => CellType::Float,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Double(cells) => cells.len(),
            Self::Float(cells) => cells.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> f64 {
        match self {
            Self::Double(cells) => cells[idx],
            Self::Float(cells) => f64::from(cells[idx]),
        }
    }

    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> TypedCells<'a> {
        match *self {
            Self::Double(cells) => Self::Double(&cells[offset..offset + len]),
            Self::Float(cells) => Self::Float(&cells[offset..offset + len]),
        }
    }

    pub fn iter(self) -> impl Iterator<Item = f64> + 'a {
        (0..self.len()).map(move |idx| self.get(idx))
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.iter().collect()
    }

    #[must_use]
    pub fn typify<T: Cell>(self) -> &'a [T] {
        T::unwrap_cells(self)
    }

    /// Address of the first cell; used to observe buffer reuse.
    #[must_use]
    pub fn data_addr(&self) -> usize {
        match self {
            Self::Double(cells) => cells.as_ptr() as usize,
            Self::Float(cells) => cells.as_ptr() as usize,
        }
    }
}

/// Owned cell array.
#[derive(Debug, Clone, PartialEq)]
pub enum CellBuffer {
    Double(Vec<f64>),
    Float(Vec<f32>),
}

impl CellBuffer {
    #[must_use]
    pub fn zeroed(cell_type: CellType, len: usize) -> Self {
        match cell_type {
            CellType::Double => Self::Double(vec![0.0; len]),
            CellType::Float => Self::Float(vec![0.0; len]),
        }
    }

    pub fn from_f64_iter<I>(cell_type: CellType, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        match cell_type {
            CellType::Double => Self::Double(values.into_iter().collect()),
            CellType::Float => Self::Float(values.into_iter().map(|v| v as f32).collect()),
        }
    }

    #[must_use]
    pub fn cell_type(&self) -> CellType {
        match self {
            Self::Double(_) => CellType::Double,
            Self::Float(_) => CellType::Float,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Double(cells) => cells.len(),
            Self::Float(cells) => cells.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn cells(&self) -> TypedCells<'_> {
        match self {
            Self::Double(cells) => TypedCells::Double(cells),
            Self::Float(cells) => TypedCells::Float(cells),
        }
    }

    pub fn set(&mut self, idx: usize, value: f64) {
        match self {
            Self::Double(cells) => cells[idx] = value,
            Self::Float(cells) => cells[idx] = value as f32,
        }
    }

    pub fn push(&mut self, value: f64) {
        match self {
            Self::Double(cells) => cells.push(value),
            Self::Float(cells) => cells.push(value as f32),
        }
    }

    #[must_use]
    pub fn with_capacity(cell_type: CellType, capacity: usize) -> Self {
        match cell_type {
            CellType::Double => Self::Double(Vec::with_capacity(capacity)),
            CellType::Float => Self::Float(Vec::with_capacity(capacity)),
        }
    }
}

/// A named dimension; `size == None` means mapped (sparse).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dimension {
    pub name: String,
    pub size: Option<u32>,
}

impl Dimension {
    #[must_use]
    pub fn indexed(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size: Some(size),
        }
    }

    #[must_use]
    pub fn mapped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
        }
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.size.is_none()
    }

    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.size.is_some()
    }

    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.size == Some(1)
    }

    #[must_use]
    pub fn size_or_zero(&self) -> usize {
        self.size.map_or(0, |size| size as usize)
    }
}

/// Immutable description of a tensor value: cell type plus dimensions sorted
/// by name. Malformed types collapse into the error type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueType {
    cell_type: CellType,
    dimensions: Vec<Dimension>,
    error: bool,
}

impl ValueType {
    #[must_use]
    pub fn error() -> Self {
        Self {
            cell_type: CellType::Double,
            dimensions: Vec::new(),
            error: true,
        }
    }

    #[must_use]
    pub fn double() -> Self {
        Self {
            cell_type: CellType::Double,
            dimensions: Vec::new(),
            error: false,
        }
    }

    #[must_use]
    pub fn make_type(cell_type: CellType, mut dimensions: Vec<Dimension>) -> Self {
        if dimensions.is_empty() {
            return Self::double();
        }
        dimensions.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in dimensions.windows(2) {
            if pair[0].name == pair[1].name {
                return Self::error();
            }
        }
        if dimensions
            .iter()
            .any(|dim| dim.size == Some(0) || dim.name.is_empty())
        {
            return Self::error();
        }
        Self {
            cell_type,
            dimensions,
            error: false,
        }
    }

    #[must_use]
    pub fn dense(cell_type: CellType, dims: &[(&str, u32)]) -> Self {
        Self::make_type(
            cell_type,
            dims.iter()
                .map(|(name, size)| Dimension::indexed(*name, *size))
                .collect(),
        )
    }

    #[must_use]
    pub fn sparse(cell_type: CellType, dims: &[&str]) -> Self {
        Self::make_type(
            cell_type,
            dims.iter().map(|name| Dimension::mapped(*name)).collect(),
        )
    }

    #[must_use]
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error
    }

    #[must_use]
    pub fn is_double(&self) -> bool {
        !self.error && self.dimensions.is_empty()
    }

    #[must_use]
    pub fn has_dimensions(&self) -> bool {
        !self.dimensions.is_empty()
    }

    #[must_use]
    pub fn is_dense(&self) -> bool {
        !self.error && self.dimensions.iter().all(Dimension::is_indexed)
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        !self.error
            && !self.dimensions.is_empty()
            && self.dimensions.iter().all(Dimension::is_mapped)
    }

    #[must_use]
    pub fn is_mixed(&self) -> bool {
        !self.error
            && self.dimensions.iter().any(Dimension::is_mapped)
            && self.dimensions.iter().any(Dimension::is_indexed)
    }

    #[must_use]
    pub fn dense_subspace_size(&self) -> usize {
        self.dimensions
            .iter()
            .filter_map(|dim| dim.size)
            .map(|size| size as usize)
            .product()
    }

    #[must_use]
    pub fn count_indexed_dimensions(&self) -> usize {
        self.dimensions.iter().filter(|dim| dim.is_indexed()).count()
    }

    #[must_use]
    pub fn count_mapped_dimensions(&self) -> usize {
        self.dimensions.iter().filter(|dim| dim.is_mapped()).count()
    }

    #[must_use]
    pub fn indexed_dimensions(&self) -> Vec<&Dimension> {
        self.dimensions.iter().filter(|dim| dim.is_indexed()).collect()
    }

    #[must_use]
    pub fn mapped_dimensions(&self) -> Vec<&Dimension> {
        self.dimensions.iter().filter(|dim| dim.is_mapped()).collect()
    }

    #[must_use]
    pub fn nontrivial_indexed_dimensions(&self) -> Vec<&Dimension> {
        self.dimensions
            .iter()
            .filter(|dim| dim.is_indexed() && !dim.is_trivial())
            .collect()
    }

    #[must_use]
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|dim| dim.name == name)
    }

    #[must_use]
    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|dim| dim.name.as_str()).collect()
    }

    /// Same shape with a different cell type. Scalars stay double.
    #[must_use]
    pub fn cell_cast(&self, cell_type: CellType) -> Self {
        if self.error {
            return Self::error();
        }
        if self.dimensions.is_empty() {
            return Self::double();
        }
        Self {
            cell_type,
            dimensions: self.dimensions.clone(),
            error: false,
        }
    }

    #[must_use]
    pub fn map(&self) -> Self {
        self.clone()
    }

    #[must_use]
    pub fn join(lhs: &Self, rhs: &Self) -> Self {
        if lhs.error || rhs.error {
            return Self::error();
        }
        let mut dims = lhs.dimensions.clone();
        for dim in &rhs.dimensions {
            match dims.iter().find(|existing| existing.name == dim.name) {
                Some(existing) if existing.size != dim.size => return Self::error(),
                Some(_) => {}
                None => dims.push(dim.clone()),
            }
        }
        Self::make_type(lhs.cell_type.unify(rhs.cell_type), dims)
    }

    #[must_use]
    pub fn merge(lhs: &Self, rhs: &Self) -> Self {
        if lhs.error || rhs.error || lhs.dimensions != rhs.dimensions {
            return Self::error();
        }
        Self::make_type(lhs.cell_type.unify(rhs.cell_type), lhs.dimensions.clone())
    }

    /// Removes the named dimensions; an empty list reduces everything.
    #[must_use]
    pub fn reduce(&self, dims: &[String]) -> Self {
        if self.error {
            return Self::error();
        }
        if dims.is_empty() {
            return Self::double();
        }
        if dims.iter().any(|name| self.dimension_index(name).is_none()) {
            return Self::error();
        }
        let kept = self
            .dimensions
            .iter()
            .filter(|dim| !dims.contains(&dim.name))
            .cloned()
            .collect();
        Self::make_type(self.cell_type, kept)
    }

    #[must_use]
    pub fn peek(&self, dims: &[String]) -> Self {
        if self.error || dims.is_empty() {
            return Self::error();
        }
        self.reduce(dims)
    }

    #[must_use]
    pub fn rename(&self, from: &[String], to: &[String]) -> Self {
        if self.error || from.is_empty() || from.len() != to.len() {
            return Self::error();
        }
        let mut matched = 0usize;
        let dims = self
            .dimensions
            .iter()
            .map(|dim| match from.iter().position(|name| *name == dim.name) {
                Some(pos) => {
                    matched += 1;
                    Dimension {
                        name: to[pos].clone(),
                        size: dim.size,
                    }
                }
                None => dim.clone(),
            })
            .collect();
        if matched != from.len() {
            return Self::error();
        }
        Self::make_type(self.cell_type, dims)
    }

    #[must_use]
    pub fn concat(lhs: &Self, rhs: &Self, dimension: &str) -> Self {
        if lhs.error || rhs.error {
            return Self::error();
        }
        let concat_size = |ty: &Self| -> Option<u32> {
            match ty.dimension_index(dimension) {
                Some(idx) => ty.dimensions[idx].size,
                None => Some(1),
            }
        };
        let (Some(lhs_size), Some(rhs_size)) = (concat_size(lhs), concat_size(rhs)) else {
            return Self::error();
        };
        let mut dims: Vec<Dimension> = Vec::new();
        for dim in lhs.dimensions.iter().chain(rhs.dimensions.iter()) {
            if dim.name == dimension {
                continue;
            }
            match dims.iter().find(|existing| existing.name == dim.name) {
                Some(existing) if existing.size != dim.size => return Self::error(),
                Some(_) => {}
                None => dims.push(dim.clone()),
            }
        }
        dims.push(Dimension::indexed(dimension, lhs_size + rhs_size));
        Self::make_type(lhs.cell_type.unify(rhs.cell_type), dims)
    }

    /// Parses `double`, `error`, `tensor(x[3],y{})` and `tensor<float>(...)`.
    /// Anything malformed parses as the error type.
    #[must_use]
    pub fn from_spec(spec: &str) -> Self {
        parse_type_spec(spec.trim()).unwrap_or_else(Self::error)
    }

    #[must_use]
    pub fn to_spec(&self) -> String {
        if self.error {
            return "error".to_string();
        }
        if self.dimensions.is_empty() {
            return "double".to_string();
        }
        let dims = self
            .dimensions
            .iter()
            .map(|dim| match dim.size {
                Some(size) => format!("{}[{size}]", dim.name),
                None => format!("{}{{}}", dim.name),
            })
            .collect::<Vec<_>>()
            .join(",");
        match self.cell_type {
            CellType::Double => format!("tensor({dims})"),
            CellType::Float => format!("tensor<float>({dims})"),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_spec())
    }
}

fn parse_type_spec(spec: &str) -> Option<ValueType> {
    match spec {
        "double" => return Some(ValueType::double()),
        "error" => return None,
        _ => {}
    }
    let rest = spec.strip_prefix("tensor")?;
    let (cell_type, rest) = match rest.strip_prefix('<') {
        Some(tail) => {
            let end = tail.find('>')?;
            let cell_type = match &tail[..end] {
                "double" => CellType::Double,
                "float" => CellType::Float,
                _ => return None,
            };
            (cell_type, &tail[end + 1..])
        }
        None => (CellType::Double, rest),
    };
    let body = rest.strip_prefix('(')?.strip_suffix(')')?;
    let mut dims = Vec::new();
    if !body.trim().is_empty() {
        for part in body.split(',') {
            dims.push(parse_dimension(part.trim())?);
        }
    }
    let ty = ValueType::make_type(cell_type, dims);
    (!ty.is_error()).then_some(ty)
}

fn parse_dimension(part: &str) -> Option<Dimension> {
    if let Some(name) = part.strip_suffix("{}") {
        return valid_identifier(name).then(|| Dimension::mapped(name));
    }
    let open = part.find('[')?;
    let name = &part[..open];
    let size = part[open + 1..].strip_suffix(']')?.trim().parse::<u32>().ok()?;
    valid_identifier(name).then(|| Dimension::indexed(name, size))
}

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op1 {
    Neg,
    Not,
    Cos,
    Sin,
    Tan,
    Exp,
    Log,
    Sqrt,
    Ceil,
    Floor,
    Abs,
    Relu,
    Sigmoid,
    Square,
    Cube,
    Inv,
    Elu,
}

impl Op1 {
    #[must_use]
    pub fn function(self) -> fn(f64) -> f64 {
        match self {
            Self::Neg => |a| -a,
            Self::Not => |a| if a == 0.0 { 1.0 } else { 0.0 },
            Self::Cos => f64::cos,
            Self::Sin => f64::sin,
            Self::Tan => f64::tan,
            Self::Exp => f64::exp,
            Self::Log => f64::ln,
            Self::Sqrt => f64::sqrt,
            Self::Ceil => f64::ceil,
            Self::Floor => f64::floor,
            Self::Abs => f64::abs,
            Self::Relu => |a| a.max(0.0),
            Self::Sigmoid => |a| 1.0 / (1.0 + (-a).exp()),
            Self::Square => |a| a * a,
            Self::Cube => |a| a * a * a,
            Self::Inv => |a| 1.0 / a,
            Self::Elu => |a| if a < 0.0 { a.exp() - 1.0 } else { a },
        }
    }

    #[must_use]
    pub fn apply(self, a: f64) -> f64 {
        (self.function())(a)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Not => "not",
            Self::Cos => "cos",
            Self::Sin => "sin",
            Self::Tan => "tan",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Ceil => "ceil",
            Self::Floor => "floor",
            Self::Abs => "abs",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Square => "square",
            Self::Cube => "cube",
            Self::Inv => "inv",
            Self::Elu => "elu",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op2 {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Min,
    Max,
    Atan2,
    Ldexp,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Approx,
}

fn bool_cell(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

impl Op2 {
    #[must_use]
    pub fn function(self) -> fn(f64, f64) -> f64 {
        match self {
            Self::Add => |a, b| a + b,
            Self::Sub => |a, b| a - b,
            Self::Mul => |a, b| a * b,
            Self::Div => |a, b| a / b,
            Self::Mod => |a, b| a % b,
            Self::Pow => f64::powf,
            Self::Min => f64::min,
            Self::Max => f64::max,
            Self::Atan2 => f64::atan2,
            Self::Ldexp => |a, b| a * 2f64.powf(b.trunc()),
            Self::Equal => |a, b| bool_cell(a == b),
            Self::NotEqual => |a, b| bool_cell(a != b),
            Self::Less => |a, b| bool_cell(a < b),
            Self::LessEqual => |a, b| bool_cell(a <= b),
            Self::Greater => |a, b| bool_cell(a > b),
            Self::GreaterEqual => |a, b| bool_cell(a >= b),
            Self::And => |a, b| bool_cell(a != 0.0 && b != 0.0),
            Self::Or => |a, b| bool_cell(a != 0.0 || b != 0.0),
            Self::Approx => |a, b| {
                let scale = a.abs().max(b.abs()).max(1.0);
                bool_cell((a - b).abs() <= scale * 1e-6)
            },
        }
    }

    #[must_use]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        (self.function())(a, b)
    }

    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Mul
                | Self::Min
                | Self::Max
                | Self::Equal
                | Self::NotEqual
                | Self::And
                | Self::Or
                | Self::Approx
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::Min => "min",
            Self::Max => "max",
            Self::Atan2 => "atan2",
            Self::Ldexp => "ldexp",
            Self::Equal => "equal",
            Self::NotEqual => "not_equal",
            Self::Less => "less",
            Self::LessEqual => "less_equal",
            Self::Greater => "greater",
            Self::GreaterEqual => "greater_equal",
            Self::And => "and",
            Self::Or => "or",
            Self::Approx => "approx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggr {
    Avg,
    Count,
    Prod,
    Sum,
    Max,
    Min,
}

impl Aggr {
    /// Aggregators whose state is a single cell combined pairwise.
    #[must_use]
    pub const fn is_simple(self) -> bool {
        matches!(self, Self::Prod | Self::Sum | Self::Max | Self::Min)
    }

    /// Aggregators that return the single input unchanged.
    #[must_use]
    pub const fn is_ident(self) -> bool {
        !matches!(self, Self::Count)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Prod => "prod",
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    #[must_use]
    pub fn combine(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Prod => acc * value,
            Self::Max => acc.max(value),
            Self::Min => acc.min(value),
            Self::Sum | Self::Avg | Self::Count => acc + value,
        }
    }
}

/// Fold state for one aggregation: the first value seeds, `next` folds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
    aggr: Aggr,
    acc: f64,
    count: usize,
}

impl Aggregator {
    #[must_use]
    pub fn new(aggr: Aggr) -> Self {
        Self {
            aggr,
            acc: 0.0,
            count: 0,
        }
    }

    pub fn first(&mut self, value: f64) {
        self.acc = value;
        self.count = 1;
    }

    pub fn next(&mut self, value: f64) {
        if self.count == 0 {
            self.first(value);
            return;
        }
        self.acc = self.aggr.combine(self.acc, value);
        self.count += 1;
    }

    /// Empty aggregations yield 0.
    #[must_use]
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        match self.aggr {
            Aggr::Avg => self.acc / self.count as f64,
            Aggr::Count => self.count as f64,
            _ => self.acc,
        }
    }
}

pub fn aggregate<I>(aggr: Aggr, values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut aggregator = Aggregator::new(aggr);
    for value in values {
        aggregator.next(value);
    }
    aggregator.result()
}

/// Row-major strides for a list of dimension sizes; the last dimension has
/// stride 1.
#[must_use]
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    let mut running = 1usize;
    for idx in (0..sizes.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(sizes[idx]);
    }
    strides
}

/// Odometer step: increments the last coordinate first. Returns false once
/// every combination has been visited.
pub fn next_coordinate(coords: &mut [usize], sizes: &[usize]) -> bool {
    for idx in (0..coords.len()).rev() {
        coords[idx] += 1;
        if coords[idx] < sizes[idx] {
            return true;
        }
        coords[idx] = 0;
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    Malformed { spec: String },
    Mismatch { expected: String, actual: String },
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { spec } => write!(f, "malformed value type spec '{spec}'"),
            Self::Mismatch { expected, actual } => {
                write!(f, "value type mismatch: expected={expected}, actual={actual}")
            }
        }
    }
}

impl std::error::Error for TypeError {}

/// Parses a type spec, failing instead of collapsing to the error type.
pub fn parse_value_type(spec: &str) -> Result<ValueType, TypeError> {
    let ty = ValueType::from_spec(spec);
    if ty.is_error() {
        return Err(TypeError::Malformed {
            spec: spec.to_string(),
        });
    }
    Ok(ty)
}

pub fn ensure_same_type(expected: &ValueType, actual: &ValueType) -> Result<(), TypeError> {
    if expected != actual {
        return Err(TypeError::Mismatch {
            expected: expected.to_spec(),
            actual: actual.to_spec(),
        });
    }
    Ok(())
}
