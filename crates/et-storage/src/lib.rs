#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use et_core::{
    Aggr, Aggregator, Cell, CellBuffer, CellType, Op1, Op2, TypedCells, ValueType,
    contiguous_strides, next_coordinate,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Indexed(u32),
    Mapped(String),
}

impl Label {
    #[must_use]
    pub fn as_index(&self) -> Option<u32> {
        match self {
            Self::Indexed(idx) => Some(*idx),
            Self::Mapped(_) => None,
        }
    }

    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Indexed(_) => None,
            Self::Mapped(name) => Some(name),
        }
    }
}

impl From<u32> for Label {
    fn from(value: u32) -> Self {
        Self::Indexed(value)
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self::Mapped(value.to_string())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexed(idx) => write!(f, "{idx}"),
            Self::Mapped(name) => write!(f, "'{name}'"),
        }
    }
}

pub type Address = BTreeMap<String, Label>;

#[must_use]
pub fn address(labels: &[(&str, Label)]) -> Address {
    labels
        .iter()
        .map(|(name, label)| ((*name).to_string(), label.clone()))
        .collect()
}

/// Maps every label onto the form the dimension expects; `None` when the
/// address does not fit the type.
fn canonical_address(value_type: &ValueType, address: Address) -> Option<Address> {
    if address.len() != value_type.dimensions().len() {
        return None;
    }
    let mut out = Address::new();
    for dim in value_type.dimensions() {
        let label = address.get(&dim.name)?;
        let canonical = match (dim.size, label) {
            (Some(size), Label::Indexed(idx)) if *idx < size => Label::Indexed(*idx),
            (Some(size), Label::Mapped(name)) => match name.parse::<u32>() {
                Ok(idx) if idx < size => Label::Indexed(idx),
                _ => return None,
            },
            (Some(_), Label::Indexed(_)) => return None,
            (None, Label::Indexed(idx)) => Label::Mapped(idx.to_string()),
            (None, Label::Mapped(name)) if !name.contains('\0') => Label::Mapped(name.clone()),
            (None, Label::Mapped(_)) => return None,
        };
        out.insert(dim.name.clone(), canonical);
    }
    Some(out)
}

fn approx_equal(a: f64, b: f64) -> bool {
    if a == b || (a.is_nan() && b.is_nan()) {
        return true;
    }
    (a - b).abs() <= 1e-5 * a.abs().max(b.abs()).max(1.0)
}

/// Engine-neutral tensor description: a value type plus an address to value
/// map. Used for fixtures, interchange and the reference evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TensorSpecRepr", into = "TensorSpecRepr")]
pub struct TensorSpec {
    value_type: ValueType,
    cells: BTreeMap<Address, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CellRepr {
    address: Address,
    value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorSpecRepr {
    #[serde(rename = "type")]
    value_type: String,
    cells: Vec<CellRepr>,
}

impl From<TensorSpecRepr> for TensorSpec {
    fn from(repr: TensorSpecRepr) -> Self {
        let mut spec = TensorSpec::new(ValueType::from_spec(&repr.value_type));
        for cell in repr.cells {
            spec.add(cell.address, cell.value);
        }
        spec
    }
}

impl From<TensorSpec> for TensorSpecRepr {
    fn from(spec: TensorSpec) -> Self {
        Self {
            value_type: spec.value_type.to_spec(),
            cells: spec
                .cells
                .into_iter()
                .map(|(address, value)| CellRepr { address, value })
                .collect(),
        }
    }
}

impl TensorSpec {
    #[must_use]
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            cells: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn from_type_spec(spec: &str) -> Self {
        Self::new(ValueType::from_spec(spec))
    }

    #[must_use]
    pub fn error() -> Self {
        Self::new(ValueType::error())
    }

    #[must_use]
    pub fn double(value: f64) -> Self {
        let mut spec = Self::new(ValueType::double());
        spec.cells.insert(Address::new(), value);
        spec
    }

    /// Adds (or overwrites) one cell, rounded to the cell type. An address
    /// that does not fit the declared type turns the whole spec into the
    /// error type.
    pub fn add(&mut self, address: Address, value: f64) -> &mut Self {
        if self.value_type.is_error() {
            return self;
        }
        let value = match self.value_type.cell_type() {
            CellType::Double => value,
            CellType::Float => f64::from(value as f32),
        };
        match canonical_address(&self.value_type, address) {
            Some(address) => {
                self.cells.insert(address, value);
            }
            None => {
                self.value_type = ValueType::error();
                self.cells.clear();
            }
        }
        self
    }

    #[must_use]
    pub fn with_cell(mut self, labels: &[(&str, Label)], value: f64) -> Self {
        self.add(address(labels), value);
        self
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    #[must_use]
    pub fn cells(&self) -> &BTreeMap<Address, f64> {
        &self.cells
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.value_type.is_error()
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Option<f64> {
        self.cells.get(address).copied()
    }

    /// Fills every dense subspace that has at least one cell (or the single
    /// subspace of a dense type) with explicit zeros.
    #[must_use]
    pub fn normalize(&self) -> TensorSpec {
        if self.value_type.is_error() {
            return self.clone();
        }
        let indexed: Vec<(String, usize)> = self
            .value_type
            .indexed_dimensions()
            .iter()
            .map(|dim| (dim.name.clone(), dim.size_or_zero()))
            .collect();
        let mut sparse_parts: BTreeSet<Address> = self
            .cells
            .keys()
            .map(|addr| {
                addr.iter()
                    .filter(|(_, label)| label.as_name().is_some())
                    .map(|(name, label)| (name.clone(), label.clone()))
                    .collect()
            })
            .collect();
        if self.value_type.count_mapped_dimensions() == 0 {
            sparse_parts.insert(Address::new());
        }
        let sizes: Vec<usize> = indexed.iter().map(|(_, size)| *size).collect();
        let mut out = self.clone();
        for sparse_part in sparse_parts {
            let mut coords = vec![0usize; sizes.len()];
            loop {
                let mut addr = sparse_part.clone();
                for ((name, _), coord) in indexed.iter().zip(&coords) {
                    addr.insert(name.clone(), Label::Indexed(*coord as u32));
                }
                out.cells.entry(addr).or_insert(0.0);
                if !next_coordinate(&mut coords, &sizes) {
                    break;
                }
            }
        }
        out
    }

    /// Compares types exactly and (normalized) cells within float tolerance.
    #[must_use]
    pub fn approx_eq(&self, other: &TensorSpec) -> bool {
        if self.value_type != other.value_type {
            return false;
        }
        let lhs = self.normalize();
        let rhs = other.normalize();
        lhs.cells.len() == rhs.cells.len()
            && lhs
                .cells
                .iter()
                .zip(rhs.cells.iter())
                .all(|((la, lv), (ra, rv))| la == ra && approx_equal(*lv, *rv))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spec({}) {{", self.value_type)?;
        for (idx, (addr, value)) in self.cells.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, " {{")?;
            for (pos, (name, label)) in addr.iter().enumerate() {
                if pos > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{name}:{label}")?;
            }
            write!(f, "}}:{value}")?;
        }
        write!(f, " }}")
    }
}

/// Row-major dense cells. The buffer is shared so cell ranges and type
/// relabels are views; `cells_mut` copies only if the buffer is shared.
#[derive(Debug, Clone)]
pub struct DenseValue {
    value_type: ValueType,
    buffer: Arc<CellBuffer>,
    offset: usize,
    len: usize,
}

impl DenseValue {
    #[must_use]
    pub fn new(value_type: ValueType, buffer: CellBuffer) -> Self {
        assert!(value_type.is_dense(), "dense value needs a dense type");
        assert_eq!(
            buffer.len(),
            value_type.dense_subspace_size(),
            "cell count must match dense subspace size of {value_type}"
        );
        assert_eq!(
            buffer.cell_type(),
            value_type.cell_type(),
            "buffer cell type must match {value_type}"
        );
        let len = buffer.len();
        Self {
            value_type,
            buffer: Arc::new(buffer),
            offset: 0,
            len,
        }
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    #[must_use]
    pub fn cells(&self) -> TypedCells<'_> {
        self.buffer.cells().slice(self.offset, self.len)
    }

    /// View of `[offset, offset + len)` of this value's cells.
    #[must_use]
    pub fn cell_range(&self, value_type: ValueType, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "cell range outside source cells");
        assert_eq!(value_type.dense_subspace_size(), len);
        assert_eq!(value_type.cell_type(), self.buffer.cell_type());
        Self {
            value_type,
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + offset,
            len,
        }
    }

    /// Same cells under a different (shape compatible) type.
    #[must_use]
    pub fn with_type(&self, value_type: ValueType) -> Self {
        assert_eq!(value_type.dense_subspace_size(), self.len);
        assert_eq!(value_type.cell_type(), self.buffer.cell_type());
        Self {
            value_type,
            buffer: Arc::clone(&self.buffer),
            offset: self.offset,
            len: self.len,
        }
    }

    pub fn cells_mut<T: Cell>(&mut self) -> &mut [T] {
        let (offset, len) = (self.offset, self.len);
        let buffer = Arc::make_mut(&mut self.buffer);
        &mut T::unwrap_buffer_mut(buffer)[offset..offset + len]
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buffer) > 1
    }

    #[must_use]
    pub fn to_spec(&self) -> TensorSpec {
        let mut spec = TensorSpec::new(self.value_type.clone());
        let dims = self.value_type.dimensions();
        let sizes: Vec<usize> = dims.iter().map(|dim| dim.size_or_zero()).collect();
        let cells = self.cells();
        let mut coords = vec![0usize; sizes.len()];
        let mut idx = 0usize;
        loop {
            let addr = dims
                .iter()
                .zip(&coords)
                .map(|(dim, coord)| (dim.name.clone(), Label::Indexed(*coord as u32)))
                .collect();
            spec.cells.insert(addr, cells.get(idx));
            idx += 1;
            if !next_coordinate(&mut coords, &sizes) {
                break;
            }
        }
        spec
    }
}

/// Packs labels as NUL-terminated strings.
pub fn pack_labels<'a, I>(out: &mut Vec<u8>, labels: I)
where
    I: IntoIterator<Item = &'a str>,
{
    for label in labels {
        out.extend_from_slice(label.as_bytes());
        out.push(0);
    }
}

#[must_use]
pub fn unpack_labels(packed: &[u8]) -> Vec<&str> {
    packed
        .split(|byte| *byte == 0)
        .take(packed.iter().filter(|byte| **byte == 0).count())
        .map(|bytes| std::str::from_utf8(bytes).unwrap_or_default())
        .collect()
}

fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Map from packed sparse address to subspace number. Address bytes live in
/// an append-only stash; the hash table only stores subspace numbers, so
/// growing the table never moves address bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseIndex {
    num_dims: usize,
    stash: Vec<u8>,
    spans: Vec<(usize, usize)>,
    lookup: HashMap<u64, Vec<u32>>,
}

impl SparseIndex {
    #[must_use]
    pub fn new(num_dims: usize) -> Self {
        Self {
            num_dims,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.spans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    #[must_use]
    pub fn address(&self, subspace: usize) -> &[u8] {
        let (start, end) = self.spans[subspace];
        &self.stash[start..end]
    }

    #[must_use]
    pub fn labels(&self, subspace: usize) -> Vec<&str> {
        unpack_labels(self.address(subspace))
    }

    #[must_use]
    pub fn lookup(&self, packed: &[u8]) -> Option<usize> {
        self.lookup.get(&fnv64(packed)).and_then(|bucket| {
            bucket
                .iter()
                .map(|subspace| *subspace as usize)
                .find(|subspace| self.address(*subspace) == packed)
        })
    }

    /// Returns the subspace for `packed`, adding it if it is new.
    pub fn add(&mut self, packed: &[u8]) -> usize {
        debug_assert_eq!(
            packed.iter().filter(|byte| **byte == 0).count(),
            self.num_dims,
            "packed address must carry one label per dimension"
        );
        if let Some(existing) = self.lookup(packed) {
            return existing;
        }
        let subspace = self.spans.len();
        let start = self.stash.len();
        self.stash.extend_from_slice(packed);
        self.spans.push((start, self.stash.len()));
        self.lookup
            .entry(fnv64(packed))
            .or_default()
            .push(subspace as u32);
        subspace
    }

    /// Subspaces whose labels at `positions` equal `labels`.
    #[must_use]
    pub fn matching(&self, positions: &[usize], labels: &[&str]) -> Vec<usize> {
        (0..self.size())
            .filter(|subspace| {
                let own = self.labels(*subspace);
                positions
                    .iter()
                    .zip(labels)
                    .all(|(pos, label)| own[*pos] == *label)
            })
            .collect()
    }
}

/// All-mapped tensor: one cell per address in the shared index.
#[derive(Debug, Clone)]
pub struct SparseValue {
    value_type: ValueType,
    index: Arc<SparseIndex>,
    cells: Arc<CellBuffer>,
}

impl SparseValue {
    #[must_use]
    pub fn new(value_type: ValueType, index: Arc<SparseIndex>, cells: CellBuffer) -> Self {
        assert!(value_type.is_sparse(), "sparse value needs a sparse type");
        assert_eq!(index.num_dims(), value_type.dimensions().len());
        assert_eq!(index.size(), cells.len(), "one cell per sparse address");
        assert_eq!(cells.cell_type(), value_type.cell_type());
        Self {
            value_type,
            index,
            cells: Arc::new(cells),
        }
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    #[must_use]
    pub fn index(&self) -> &Arc<SparseIndex> {
        &self.index
    }

    #[must_use]
    pub fn cells(&self) -> TypedCells<'_> {
        self.cells.cells()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.index.size()
    }

    #[must_use]
    pub fn get(&self, packed: &[u8]) -> Option<f64> {
        self.index
            .lookup(packed)
            .map(|subspace| self.cells.cells().get(subspace))
    }

    #[must_use]
    pub fn to_spec(&self) -> TensorSpec {
        let mut spec = TensorSpec::new(self.value_type.clone());
        let cells = self.cells();
        for subspace in 0..self.index.size() {
            let addr = self
                .value_type
                .dimensions()
                .iter()
                .zip(self.index.labels(subspace))
                .map(|(dim, label)| (dim.name.clone(), Label::Mapped(label.to_string())))
                .collect();
            spec.cells.insert(addr, cells.get(subspace));
        }
        spec
    }

    fn from_spec(spec: &TensorSpec) -> Self {
        let ty = spec.value_type().clone();
        let mut index = SparseIndex::new(ty.dimensions().len());
        let mut cells = CellBuffer::with_capacity(ty.cell_type(), spec.cells().len());
        let mut packed = Vec::new();
        for (addr, value) in spec.cells() {
            packed.clear();
            pack_labels(&mut packed, addr.values().filter_map(Label::as_name));
            index.add(&packed);
            cells.push(*value);
        }
        Self::new(ty, Arc::new(index), cells)
    }
}

/// Fallback representation for types mixing mapped and indexed dimensions.
#[derive(Debug, Clone)]
pub struct MixedValue {
    spec: TensorSpec,
    cells: CellBuffer,
}

impl MixedValue {
    #[must_use]
    pub fn new(spec: TensorSpec) -> Self {
        let cells = CellBuffer::from_f64_iter(
            spec.value_type().cell_type(),
            spec.cells().values().copied(),
        );
        Self { spec, cells }
    }

    #[must_use]
    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Dense(DenseValue),
    Sparse(SparseValue),
    Mixed(MixedValue),
}

impl Value {
    #[must_use]
    pub fn error() -> Self {
        Self::Dense(DenseValue {
            value_type: ValueType::error(),
            buffer: Arc::new(CellBuffer::Double(Vec::new())),
            offset: 0,
            len: 0,
        })
    }

    #[must_use]
    pub fn double(value: f64) -> Self {
        Self::Dense(DenseValue::new(
            ValueType::double(),
            CellBuffer::Double(vec![value]),
        ))
    }

    #[must_use]
    pub fn dense(value_type: ValueType, buffer: CellBuffer) -> Self {
        Self::Dense(DenseValue::new(value_type, buffer))
    }

    /// Dense value from f64 cells, converted to the type's cell type.
    #[must_use]
    pub fn dense_from_f64(value_type: ValueType, cells: &[f64]) -> Self {
        let buffer = CellBuffer::from_f64_iter(value_type.cell_type(), cells.iter().copied());
        Self::dense(value_type, buffer)
    }

    /// Converts a spec into the storage representation matching its type.
    #[must_use]
    pub fn from_spec(spec: &TensorSpec) -> Self {
        let ty = spec.value_type();
        if ty.is_error() {
            return Self::error();
        }
        if ty.is_dense() {
            let dims = ty.dimensions();
            let sizes: Vec<usize> = dims.iter().map(|dim| dim.size_or_zero()).collect();
            let strides = contiguous_strides(&sizes);
            let mut buffer = CellBuffer::zeroed(ty.cell_type(), ty.dense_subspace_size());
            for (addr, value) in spec.cells() {
                let idx = dims
                    .iter()
                    .zip(&strides)
                    .map(|(dim, stride)| {
                        addr.get(&dim.name)
                            .and_then(Label::as_index)
                            .map_or(0, |label| label as usize * stride)
                    })
                    .sum::<usize>();
                buffer.set(idx, *value);
            }
            return Self::dense(ty.clone(), buffer);
        }
        if ty.is_sparse() {
            return Self::Sparse(SparseValue::from_spec(spec));
        }
        Self::Mixed(MixedValue::new(spec.clone()))
    }

    #[must_use]
    pub fn to_spec(&self) -> TensorSpec {
        match self {
            Self::Dense(dense) if dense.value_type.is_error() => TensorSpec::error(),
            Self::Dense(dense) => dense.to_spec(),
            Self::Sparse(sparse) => sparse.to_spec(),
            Self::Mixed(mixed) => mixed.spec.clone(),
        }
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        match self {
            Self::Dense(dense) => &dense.value_type,
            Self::Sparse(sparse) => &sparse.value_type,
            Self::Mixed(mixed) => mixed.spec.value_type(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.value_type().is_error()
    }

    #[must_use]
    pub fn cells(&self) -> TypedCells<'_> {
        match self {
            Self::Dense(dense) => dense.cells(),
            Self::Sparse(sparse) => sparse.cells(),
            Self::Mixed(mixed) => mixed.cells.cells(),
        }
    }

    #[must_use]
    pub fn sparse_index(&self) -> Option<&SparseIndex> {
        match self {
            Self::Sparse(sparse) => Some(&sparse.index),
            Self::Dense(_) | Self::Mixed(_) => None,
        }
    }

    /// The scalar for double values; the cell sum for everything else.
    #[must_use]
    pub fn as_double(&self) -> f64 {
        self.cells().iter().sum()
    }

    #[must_use]
    pub fn as_dense(&self) -> Option<&DenseValue> {
        match self {
            Self::Dense(dense) => Some(dense),
            Self::Sparse(_) | Self::Mixed(_) => None,
        }
    }

    #[must_use]
    pub fn as_sparse(&self) -> Option<&SparseValue> {
        match self {
            Self::Sparse(sparse) => Some(sparse),
            Self::Dense(_) | Self::Mixed(_) => None,
        }
    }
}

fn store(cells: &mut CellBuffer, subspace: usize, value: f64) {
    if subspace == cells.len() {
        cells.push(value);
    } else {
        cells.set(subspace, value);
    }
}

/// Sparse join. Identical dimension sets probe the smaller operand against
/// the larger one; otherwise cells pair up on their shared dimensions.
/// Addresses without a partner are dropped.
#[must_use]
pub fn sparse_join(lhs: &SparseValue, rhs: &SparseValue, op: Op2) -> Value {
    let result_type = ValueType::join(&lhs.value_type, &rhs.value_type);
    if result_type.is_error() {
        return Value::error();
    }
    let fun = op.function();
    let mut index = SparseIndex::new(result_type.dimensions().len());
    let mut cells = CellBuffer::with_capacity(result_type.cell_type(), lhs.size().min(rhs.size()));

    if lhs.value_type.dimensions() == rhs.value_type.dimensions() {
        let lhs_is_probe = lhs.size() <= rhs.size();
        let (probe, build) = if lhs_is_probe { (lhs, rhs) } else { (rhs, lhs) };
        let probe_cells = probe.cells();
        let build_cells = build.cells();
        for subspace in 0..probe.size() {
            let packed = probe.index.address(subspace);
            if let Some(other) = build.index.lookup(packed) {
                let (a, b) = (probe_cells.get(subspace), build_cells.get(other));
                let value = if lhs_is_probe { fun(a, b) } else { fun(b, a) };
                let out = index.add(packed);
                store(&mut cells, out, value);
            }
        }
        return Value::Sparse(SparseValue::new(result_type, Arc::new(index), cells));
    }

    let lhs_dims = lhs.value_type.dimension_names();
    let rhs_dims = rhs.value_type.dimension_names();
    let shared: Vec<(usize, usize)> = lhs_dims
        .iter()
        .enumerate()
        .filter_map(|(lpos, name)| {
            rhs_dims
                .iter()
                .position(|other| other == name)
                .map(|rpos| (lpos, rpos))
        })
        .collect();
    // For every result dimension: (from lhs?, position in that operand).
    let sources: Vec<(bool, usize)> = result_type
        .dimension_names()
        .iter()
        .map(|name| match lhs_dims.iter().position(|own| own == name) {
            Some(pos) => (true, pos),
            None => (
                false,
                rhs_dims.iter().position(|own| own == name).unwrap_or(0),
            ),
        })
        .collect();

    let lhs_is_probe = lhs.size() <= rhs.size();
    let (probe, build) = if lhs_is_probe { (lhs, rhs) } else { (rhs, lhs) };
    let probe_key = |labels: &[&str]| -> Vec<String> {
        shared
            .iter()
            .map(|(lpos, rpos)| labels[if lhs_is_probe { *lpos } else { *rpos }].to_string())
            .collect()
    };
    let mut buckets: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for subspace in 0..build.size() {
        let labels = build.index.labels(subspace);
        let key = shared
            .iter()
            .map(|(lpos, rpos)| labels[if lhs_is_probe { *rpos } else { *lpos }].to_string())
            .collect();
        buckets.entry(key).or_default().push(subspace);
    }

    let (lhs_cells, rhs_cells) = (lhs.cells(), rhs.cells());
    let mut packed = Vec::new();
    for probe_subspace in 0..probe.size() {
        let probe_labels = probe.index.labels(probe_subspace);
        let Some(partners) = buckets.get(&probe_key(&probe_labels)) else {
            continue;
        };
        for build_subspace in partners {
            let build_labels = build.index.labels(*build_subspace);
            let (lsub, rsub, llabels, rlabels) = if lhs_is_probe {
                (probe_subspace, *build_subspace, &probe_labels, &build_labels)
            } else {
                (*build_subspace, probe_subspace, &build_labels, &probe_labels)
            };
            packed.clear();
            pack_labels(
                &mut packed,
                sources.iter().map(|(from_lhs, pos)| {
                    if *from_lhs { llabels[*pos] } else { rlabels[*pos] }
                }),
            );
            let out = index.add(&packed);
            store(&mut cells, out, fun(lhs_cells.get(lsub), rhs_cells.get(rsub)));
        }
    }
    Value::Sparse(SparseValue::new(result_type, Arc::new(index), cells))
}

/// Union of both address sets; `op` applies only where both have a cell.
#[must_use]
pub fn sparse_merge(lhs: &SparseValue, rhs: &SparseValue, op: Op2) -> Value {
    let result_type = ValueType::merge(&lhs.value_type, &rhs.value_type);
    if result_type.is_error() {
        return Value::error();
    }
    let fun = op.function();
    let mut index = SparseIndex::new(result_type.dimensions().len());
    let mut cells = CellBuffer::with_capacity(result_type.cell_type(), lhs.size() + rhs.size());
    let (lhs_cells, rhs_cells) = (lhs.cells(), rhs.cells());
    for subspace in 0..lhs.size() {
        let packed = lhs.index.address(subspace);
        let value = match rhs.index.lookup(packed) {
            Some(other) => fun(lhs_cells.get(subspace), rhs_cells.get(other)),
            None => lhs_cells.get(subspace),
        };
        let out = index.add(packed);
        store(&mut cells, out, value);
    }
    for subspace in 0..rhs.size() {
        let packed = rhs.index.address(subspace);
        if lhs.index.lookup(packed).is_none() {
            let out = index.add(packed);
            store(&mut cells, out, rhs_cells.get(subspace));
        }
    }
    Value::Sparse(SparseValue::new(result_type, Arc::new(index), cells))
}

/// Drops the named dimensions from every address and aggregates cells whose
/// remaining addresses collide. An empty list reduces to a double.
#[must_use]
pub fn sparse_reduce(value: &SparseValue, aggr: Aggr, dims: &[String]) -> Value {
    let result_type = value.value_type.reduce(dims);
    if result_type.is_error() {
        return Value::error();
    }
    let cells = value.cells();
    if result_type.is_double() {
        return Value::double(et_core::aggregate(aggr, cells.iter()));
    }
    let keep: Vec<usize> = value
        .value_type
        .dimensions()
        .iter()
        .enumerate()
        .filter(|(_, dim)| !dims.contains(&dim.name))
        .map(|(pos, _)| pos)
        .collect();
    let mut index = SparseIndex::new(keep.len());
    let mut aggregators: Vec<Aggregator> = Vec::new();
    let mut packed = Vec::new();
    for subspace in 0..value.size() {
        let labels = value.index.labels(subspace);
        packed.clear();
        pack_labels(&mut packed, keep.iter().map(|pos| labels[*pos]));
        let out = index.add(&packed);
        if out == aggregators.len() {
            let mut aggregator = Aggregator::new(aggr);
            aggregator.first(cells.get(subspace));
            aggregators.push(aggregator);
        } else {
            aggregators[out].next(cells.get(subspace));
        }
    }
    let buffer = CellBuffer::from_f64_iter(
        result_type.cell_type(),
        aggregators.iter().map(Aggregator::result),
    );
    Value::Sparse(SparseValue::new(result_type, Arc::new(index), buffer))
}

/// Maps every cell; the result shares the operand's index.
#[must_use]
pub fn sparse_map(value: &SparseValue, op: Op1) -> Value {
    let fun = op.function();
    let buffer = CellBuffer::from_f64_iter(
        value.value_type.cell_type(),
        value.cells().iter().map(fun),
    );
    Value::Sparse(SparseValue::new(
        value.value_type.clone(),
        Arc::clone(&value.index),
        buffer,
    ))
}

/// Same addresses with a different cell type; shares the index.
#[must_use]
pub fn sparse_cell_cast(value: &SparseValue, cell_type: CellType) -> Value {
    let buffer = CellBuffer::from_f64_iter(cell_type, value.cells().iter());
    Value::Sparse(SparseValue::new(
        value.value_type.cell_cast(cell_type),
        Arc::clone(&value.index),
        buffer,
    ))
}

/// Applies `op(old, modifier)` to the cells whose address appears in
/// `modifier`; other cells are kept. The address set is unchanged.
#[must_use]
pub fn sparse_modify(value: &SparseValue, modifier: &SparseValue, op: Op2) -> Value {
    if value.value_type.dimensions() != modifier.value_type.dimensions() {
        return Value::error();
    }
    let fun = op.function();
    let cells = value.cells();
    let modifier_cells = modifier.cells();
    let buffer = CellBuffer::from_f64_iter(
        value.value_type.cell_type(),
        (0..value.size()).map(|subspace| {
            match modifier.index.lookup(value.index.address(subspace)) {
                Some(other) => fun(cells.get(subspace), modifier_cells.get(other)),
                None => cells.get(subspace),
            }
        }),
    );
    Value::Sparse(SparseValue::new(
        value.value_type.clone(),
        Arc::clone(&value.index),
        buffer,
    ))
}

/// Cells of `value` whose address is not in `remove`.
#[must_use]
pub fn sparse_remove(value: &SparseValue, remove: &SparseValue) -> Value {
    if value.value_type.dimensions() != remove.value_type.dimensions() {
        return Value::error();
    }
    let cells = value.cells();
    let mut index = SparseIndex::new(value.index.num_dims());
    let mut buffer = CellBuffer::with_capacity(value.value_type.cell_type(), value.size());
    for subspace in 0..value.size() {
        let packed = value.index.address(subspace);
        if remove.index.lookup(packed).is_none() {
            let out = index.add(packed);
            store(&mut buffer, out, cells.get(subspace));
        }
    }
    Value::Sparse(SparseValue::new(
        value.value_type.clone(),
        Arc::new(index),
        buffer,
    ))
}

/// Union where cells from `add` overwrite cells of `value`.
#[must_use]
pub fn sparse_add(value: &SparseValue, add: &SparseValue) -> Value {
    let result_type = ValueType::merge(&value.value_type, &add.value_type);
    if result_type.is_error() {
        return Value::error();
    }
    merge_with(value, add, result_type, |_, new| new)
}

fn merge_with(
    lhs: &SparseValue,
    rhs: &SparseValue,
    result_type: ValueType,
    fun: impl Fn(f64, f64) -> f64,
) -> Value {
    let mut index = SparseIndex::new(result_type.dimensions().len());
    let mut cells = CellBuffer::with_capacity(result_type.cell_type(), lhs.size() + rhs.size());
    let (lhs_cells, rhs_cells) = (lhs.cells(), rhs.cells());
    for subspace in 0..lhs.size() {
        let out = index.add(lhs.index.address(subspace));
        store(&mut cells, out, lhs_cells.get(subspace));
    }
    for subspace in 0..rhs.size() {
        let out = index.add(rhs.index.address(subspace));
        let value = if out < cells.len() {
            fun(cells.cells().get(out), rhs_cells.get(subspace))
        } else {
            rhs_cells.get(subspace)
        };
        store(&mut cells, out, value);
    }
    Value::Sparse(SparseValue::new(result_type, Arc::new(index), cells))
}

/// Sum of products over addresses present in both operands.
#[must_use]
pub fn sparse_dot_product(lhs: &SparseValue, rhs: &SparseValue) -> f64 {
    assert_eq!(
        lhs.value_type.dimensions(),
        rhs.value_type.dimensions(),
        "sparse dot product needs identical dimensions"
    );
    let (probe, build) = if lhs.size() <= rhs.size() {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };
    let probe_cells = probe.cells();
    let build_cells = build.cells();
    (0..probe.size())
        .filter_map(|subspace| {
            build
                .index
                .lookup(probe.index.address(subspace))
                .map(|other| probe_cells.get(subspace) * build_cells.get(other))
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use et_core::{Aggr, CellType, Op1, Op2, ValueType};
    use proptest::prelude::*;

    use super::{
        Label, SparseIndex, TensorSpec, Value, address, pack_labels, sparse_add,
        sparse_cell_cast, sparse_dot_product, sparse_join, sparse_map, sparse_merge,
        sparse_modify, sparse_reduce, sparse_remove, unpack_labels,
    };

    fn sparse(spec: TensorSpec) -> super::SparseValue {
        match Value::from_spec(&spec) {
            Value::Sparse(sparse) => sparse,
            other => panic!("expected sparse value, got {other:?}"),
        }
    }

    fn x_tensor(cells: &[(&str, f64)]) -> TensorSpec {
        cells.iter().fold(TensorSpec::from_type_spec("tensor(x{})"), |spec, (label, value)| {
            spec.with_cell(&[("x", Label::from(*label))], *value)
        })
    }

    #[test]
    fn spec_rejects_addresses_outside_the_type() {
        let bad_dim = TensorSpec::from_type_spec("tensor(x[2])").with_cell(&[("y", 0.into())], 1.0);
        assert!(bad_dim.is_error());

        let out_of_range =
            TensorSpec::from_type_spec("tensor(x[2])").with_cell(&[("x", 2.into())], 1.0);
        assert!(out_of_range.is_error());
        assert!(Value::from_spec(&out_of_range).is_error());

        let canonical =
            TensorSpec::from_type_spec("tensor(x{})").with_cell(&[("x", 1.into())], 1.0);
        assert_eq!(
            canonical.get(&address(&[("x", Label::from("1"))])),
            Some(1.0)
        );
    }

    #[test]
    fn dense_value_round_trips_through_spec() {
        let spec = TensorSpec::from_type_spec("tensor<float>(x[2],y[3])")
            .with_cell(&[("x", 0.into()), ("y", 1.into())], 1.5)
            .with_cell(&[("x", 1.into()), ("y", 2.into())], 2.5);
        let value = Value::from_spec(&spec);
        assert_eq!(value.cells().cell_type(), CellType::Float);
        assert_eq!(value.cells().to_f64_vec(), vec![0.0, 1.5, 0.0, 0.0, 0.0, 2.5]);
        assert!(value.to_spec().approx_eq(&spec));
    }

    #[test]
    fn cell_range_shares_the_buffer() {
        let value = Value::dense_from_f64(
            ValueType::from_spec("tensor(x[4])"),
            &[1.0, 2.0, 3.0, 4.0],
        );
        let dense = value.as_dense().expect("dense");
        let range = dense.cell_range(ValueType::from_spec("tensor(y[2])"), 1, 2);
        assert_eq!(range.cells().to_f64_vec(), vec![2.0, 3.0]);
        assert_eq!(
            range.cells().data_addr(),
            dense.cells().data_addr() + std::mem::size_of::<f64>()
        );
        assert!(dense.is_shared());
    }

    #[test]
    fn cells_mut_reuses_unique_buffers_and_copies_shared_ones() {
        let value = Value::dense_from_f64(ValueType::from_spec("tensor(x[2])"), &[1.0, 2.0]);
        let Value::Dense(mut unique) = value else {
            panic!("expected dense");
        };
        let before = unique.cells().data_addr();
        unique.cells_mut::<f64>()[0] = 5.0;
        assert_eq!(unique.cells().data_addr(), before);

        let keep = unique.clone();
        unique.cells_mut::<f64>()[1] = 7.0;
        assert_ne!(unique.cells().data_addr(), keep.cells().data_addr());
        assert_eq!(keep.cells().to_f64_vec(), vec![5.0, 2.0]);
        assert_eq!(unique.cells().to_f64_vec(), vec![5.0, 7.0]);
    }

    #[test]
    fn sparse_index_keeps_stash_separate_from_lookup() {
        let mut index = SparseIndex::new(2);
        let mut packed = Vec::new();
        pack_labels(&mut packed, ["a", "b"]);
        let first = index.add(&packed);
        let again = index.add(&packed);
        assert_eq!(first, again);
        assert_eq!(index.size(), 1);
        assert_eq!(index.labels(first), vec!["a", "b"]);

        packed.clear();
        pack_labels(&mut packed, ["a", ""]);
        let second = index.add(&packed);
        assert_eq!(second, 1);
        assert_eq!(unpack_labels(index.address(second)), vec!["a", ""]);
        assert_eq!(index.matching(&[0], &["a"]), vec![0, 1]);
    }

    #[test]
    fn sparse_join_and_merge_follow_intersection_and_union() {
        let a = sparse(x_tensor(&[("1", 2.0)]));
        let b = sparse(x_tensor(&[("1", 3.0), ("2", 5.0)]));

        let joined = sparse_join(&a, &b, Op2::Mul).to_spec();
        assert_eq!(joined, x_tensor(&[("1", 6.0)]));

        let merged = sparse_merge(&a, &b, Op2::Add).to_spec();
        assert_eq!(merged, x_tensor(&[("1", 5.0), ("2", 5.0)]));
    }

    #[test]
    fn sparse_join_keeps_operand_order_when_probing_from_rhs() {
        let a = sparse(x_tensor(&[("1", 8.0), ("2", 9.0), ("3", 1.0)]));
        let b = sparse(x_tensor(&[("2", 3.0)]));
        let joined = sparse_join(&a, &b, Op2::Sub).to_spec();
        assert_eq!(joined, x_tensor(&[("2", 6.0)]));
    }

    #[test]
    fn sparse_join_pairs_cells_on_shared_dimensions() {
        let xy = sparse(
            TensorSpec::from_type_spec("tensor(x{},y{})")
                .with_cell(&[("x", "a".into()), ("y", "1".into())], 2.0)
                .with_cell(&[("x", "b".into()), ("y", "2".into())], 3.0),
        );
        let yz = sparse(
            TensorSpec::from_type_spec("tensor(y{},z{})")
                .with_cell(&[("y", "1".into()), ("z", "p".into())], 10.0)
                .with_cell(&[("y", "1".into()), ("z", "q".into())], 20.0)
                .with_cell(&[("y", "3".into()), ("z", "q".into())], 30.0),
        );
        let joined = sparse_join(&xy, &yz, Op2::Mul).to_spec();
        let expected = TensorSpec::from_type_spec("tensor(x{},y{},z{})")
            .with_cell(&[("x", "a".into()), ("y", "1".into()), ("z", "p".into())], 20.0)
            .with_cell(&[("x", "a".into()), ("y", "1".into()), ("z", "q".into())], 40.0);
        assert_eq!(joined, expected);
    }

    #[test]
    fn sparse_reduce_reaggregates_colliding_addresses() {
        let value = sparse(
            TensorSpec::from_type_spec("tensor(x{},y{})")
                .with_cell(&[("x", "a".into()), ("y", "1".into())], 2.0)
                .with_cell(&[("x", "a".into()), ("y", "2".into())], 3.0)
                .with_cell(&[("x", "b".into()), ("y", "1".into())], 7.0),
        );
        let reduced = sparse_reduce(&value, Aggr::Sum, &["y".to_string()]).to_spec();
        assert_eq!(reduced, x_tensor(&[("a", 5.0), ("b", 7.0)]));

        let total = sparse_reduce(&value, Aggr::Max, &[]);
        assert_eq!(total.as_double(), 7.0);
        assert!(total.value_type().is_double());
    }

    #[test]
    fn sparse_map_and_cast_share_the_index() {
        let value = sparse(x_tensor(&[("a", 2.0), ("b", -3.0)]));
        let mapped = sparse_map(&value, Op1::Neg);
        let mapped = mapped.as_sparse().expect("sparse");
        assert!(std::sync::Arc::ptr_eq(mapped.index(), value.index()));
        assert_eq!(mapped.to_spec(), x_tensor(&[("a", -2.0), ("b", 3.0)]));

        let cast = sparse_cell_cast(&value, CellType::Float);
        assert_eq!(cast.value_type().to_spec(), "tensor<float>(x{})");
        assert!(std::sync::Arc::ptr_eq(
            cast.as_sparse().expect("sparse").index(),
            value.index()
        ));
    }

    #[test]
    fn sparse_modify_remove_add_update_cells() {
        let value = sparse(x_tensor(&[("a", 1.0), ("b", 2.0)]));
        let change = sparse(x_tensor(&[("b", 10.0), ("c", 5.0)]));

        let modified = sparse_modify(&value, &change, Op2::Add).to_spec();
        assert_eq!(modified, x_tensor(&[("a", 1.0), ("b", 12.0)]));

        let removed = sparse_remove(&value, &change).to_spec();
        assert_eq!(removed, x_tensor(&[("a", 1.0)]));

        let added = sparse_add(&value, &change).to_spec();
        assert_eq!(added, x_tensor(&[("a", 1.0), ("b", 10.0), ("c", 5.0)]));
    }

    #[test]
    fn sparse_dot_product_sums_matching_cells() {
        let a = sparse(x_tensor(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
        let b = sparse(x_tensor(&[("b", 4.0), ("c", 5.0), ("d", 6.0)]));
        assert_eq!(sparse_dot_product(&a, &b), 23.0);
    }

    #[test]
    fn mixed_types_use_the_fallback_representation() {
        let spec = TensorSpec::from_type_spec("tensor(x{},y[2])")
            .with_cell(&[("x", "a".into()), ("y", 1.into())], 4.0);
        let value = Value::from_spec(&spec);
        assert!(matches!(value, Value::Mixed(_)));
        assert_eq!(value.to_spec(), spec);
        assert_eq!(value.as_double(), 4.0);
    }

    #[test]
    fn spec_json_uses_type_and_cells_fields() {
        let spec = TensorSpec::from_type_spec("tensor(x{},y[2])")
            .with_cell(&[("x", "a".into()), ("y", 1.into())], 4.0);
        let json = serde_json::to_string(&spec).expect("spec encodes");
        assert!(json.contains("\"type\":\"tensor(x{},y[2])\""));
        let decoded: TensorSpec = serde_json::from_str(&json).expect("spec decodes");
        assert_eq!(decoded, spec);

        let malformed: TensorSpec = serde_json::from_str(
            r#"{"type":"tensor(x[2])","cells":[{"address":{"x":5},"value":1.0}]}"#,
        )
        .expect("structure is valid json");
        assert!(malformed.is_error());
    }

    proptest! {
        #[test]
        fn prop_sparse_merge_contains_every_address(
            lhs in prop::collection::btree_map("[a-d]", -10.0f64..10.0, 0..4),
            rhs in prop::collection::btree_map("[a-d]", -10.0f64..10.0, 0..4),
        ) {
            let to_spec = |cells: &std::collections::BTreeMap<String, f64>| {
                cells.iter().fold(TensorSpec::from_type_spec("tensor(x{})"), |spec, (label, value)| {
                    spec.with_cell(&[("x", Label::from(label.as_str()))], *value)
                })
            };
            let merged = sparse_merge(&sparse(to_spec(&lhs)), &sparse(to_spec(&rhs)), Op2::Add).to_spec();
            let joined = sparse_join(&sparse(to_spec(&lhs)), &sparse(to_spec(&rhs)), Op2::Add).to_spec();

            let union: std::collections::BTreeSet<&String> = lhs.keys().chain(rhs.keys()).collect();
            prop_assert_eq!(merged.cells().len(), union.len());
            let both = lhs.keys().filter(|key| rhs.contains_key(*key)).count();
            prop_assert_eq!(joined.cells().len(), both);
        }
    }
}
