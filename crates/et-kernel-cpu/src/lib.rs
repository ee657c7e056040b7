#![forbid(unsafe_code)]

//! Dense kernels over row-major cell slices. Shape agreement between the
//! slices and the parameters is a caller contract and is asserted.

use et_core::{Aggr, Aggregator, Cell, ValueType, contiguous_strides, next_coordinate};

/// How the secondary operand of a simple join lines up with the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Overlap {
    /// Same non-trivial dimensions: elementwise.
    Full,
    /// Secondary dimensions are a suffix of the primary ones: the whole
    /// secondary buffer repeats across the primary.
    Inner,
    /// Secondary dimensions are a prefix of the primary ones: each
    /// secondary cell covers a contiguous block of `factor` primary cells.
    Outer,
}

impl Overlap {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Inner => "inner",
            Self::Outer => "outer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinShape {
    pub overlap: Overlap,
    pub factor: usize,
    pub primary_is_lhs: bool,
}

impl JoinShape {
    #[inline]
    fn secondary_index(&self, idx: usize, secondary_len: usize) -> usize {
        match self.overlap {
            Overlap::Full => idx,
            Overlap::Inner => idx % secondary_len,
            Overlap::Outer => idx / self.factor,
        }
    }

    #[inline]
    fn apply(&self, fun: fn(f64, f64) -> f64, primary: f64, secondary: f64) -> f64 {
        if self.primary_is_lhs {
            fun(primary, secondary)
        } else {
            fun(secondary, primary)
        }
    }

    fn check(&self, primary_len: usize, secondary_len: usize) {
        assert!(self.factor > 0, "simple join factor must be positive");
        assert_eq!(
            primary_len,
            self.factor * secondary_len,
            "primary cells must be factor * secondary cells"
        );
        if self.overlap == Overlap::Full {
            assert_eq!(self.factor, 1, "full overlap joins equal-sized operands");
        }
    }
}

/// Block sizes of a (batched) matrix product. `lhs_common_inner` says the
/// contracted dimension is the innermost dimension of lhs; the same for rhs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulShape {
    pub lhs_size: usize,
    pub common_size: usize,
    pub rhs_size: usize,
    pub lhs_common_inner: bool,
    pub rhs_common_inner: bool,
}

impl MatMulShape {
    #[must_use]
    pub fn lhs_block(&self) -> usize {
        self.lhs_size * self.common_size
    }

    #[must_use]
    pub fn rhs_block(&self) -> usize {
        self.common_size * self.rhs_size
    }

    #[must_use]
    pub fn out_block(&self) -> usize {
        self.lhs_size * self.rhs_size
    }

    #[inline]
    fn lhs_index(&self, row: usize, common: usize) -> usize {
        if self.lhs_common_inner {
            row * self.common_size + common
        } else {
            common * self.lhs_size + row
        }
    }

    #[inline]
    fn rhs_index(&self, common: usize, col: usize) -> usize {
        if self.rhs_common_inner {
            col * self.common_size + common
        } else {
            common * self.rhs_size + col
        }
    }
}

/// Same-precision matrix product with transpose flags; accumulates in `T`.
pub fn gemm<T: Cell>(lhs: &[T], rhs: &[T], out: &mut [T], shape: &MatMulShape) {
    assert_eq!(lhs.len(), shape.lhs_block(), "gemm lhs block size");
    assert_eq!(rhs.len(), shape.rhs_block(), "gemm rhs block size");
    assert_eq!(out.len(), shape.out_block(), "gemm output block size");
    for row in 0..shape.lhs_size {
        for col in 0..shape.rhs_size {
            let mut acc = T::default();
            for common in 0..shape.common_size {
                acc = acc + lhs[shape.lhs_index(row, common)] * rhs[shape.rhs_index(common, col)];
            }
            out[row * shape.rhs_size + col] = acc;
        }
    }
}

/// Mixed-precision matrix product; accumulates in f64.
pub fn matmul_promoted<L: Cell, R: Cell, O: Cell>(
    lhs: &[L],
    rhs: &[R],
    out: &mut [O],
    shape: &MatMulShape,
) {
    assert_eq!(lhs.len(), shape.lhs_block(), "matmul lhs block size");
    assert_eq!(rhs.len(), shape.rhs_block(), "matmul rhs block size");
    assert_eq!(out.len(), shape.out_block(), "matmul output block size");
    for row in 0..shape.lhs_size {
        for col in 0..shape.rhs_size {
            let acc: f64 = (0..shape.common_size)
                .map(|common| {
                    lhs[shape.lhs_index(row, common)].to_f64()
                        * rhs[shape.rhs_index(common, col)].to_f64()
                })
                .sum();
            out[row * shape.rhs_size + col] = O::from_f64(acc);
        }
    }
}

/// Runs `block` once per batch over consecutive operand and output blocks.
pub fn multi_matmul<L: Cell, R: Cell, O: Cell>(
    lhs: &[L],
    rhs: &[R],
    shape: &MatMulShape,
    num_batches: usize,
    block: fn(&[L], &[R], &mut [O], &MatMulShape),
) -> Vec<O> {
    assert_eq!(lhs.len(), shape.lhs_block() * num_batches, "batched lhs size");
    assert_eq!(rhs.len(), shape.rhs_block() * num_batches, "batched rhs size");
    let mut out = vec![O::default(); shape.out_block() * num_batches];
    for batch in 0..num_batches {
        block(
            &lhs[batch * shape.lhs_block()..(batch + 1) * shape.lhs_block()],
            &rhs[batch * shape.rhs_block()..(batch + 1) * shape.rhs_block()],
            &mut out[batch * shape.out_block()..(batch + 1) * shape.out_block()],
            shape,
        );
    }
    out
}

#[must_use]
pub fn dot_product<L: Cell, R: Cell>(lhs: &[L], rhs: &[R]) -> f64 {
    assert_eq!(lhs.len(), rhs.len(), "dot product operands must align");
    lhs.iter()
        .zip(rhs)
        .map(|(left, right)| left.to_f64() * right.to_f64())
        .sum()
}

/// `out[i] = src[table[i]]`.
#[must_use]
pub fn gather<T: Cell>(src: &[T], table: &[u32]) -> Vec<T> {
    table.iter().map(|idx| src[*idx as usize]).collect()
}

/// Reduces the middle axis of an `outer x reduce x inner` index space.
#[must_use]
pub fn single_reduce<I: Cell, O: Cell>(
    src: &[I],
    outer: usize,
    reduce: usize,
    inner: usize,
    aggr: Aggr,
) -> Vec<O> {
    assert_eq!(src.len(), outer * reduce * inner, "single reduce shape");
    let mut out = Vec::with_capacity(outer * inner);
    for outer_idx in 0..outer {
        let base = outer_idx * reduce * inner;
        for inner_idx in 0..inner {
            let mut aggregator = Aggregator::new(aggr);
            for reduce_idx in 0..reduce {
                aggregator.next(src[base + reduce_idx * inner + inner_idx].to_f64());
            }
            out.push(O::from_f64(aggregator.result()));
        }
    }
    out
}

#[must_use]
pub fn simple_join<P: Cell, S: Cell, O: Cell>(
    primary: &[P],
    secondary: &[S],
    fun: fn(f64, f64) -> f64,
    shape: &JoinShape,
) -> Vec<O> {
    shape.check(primary.len(), secondary.len());
    primary
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let other = secondary[shape.secondary_index(idx, secondary.len())];
            O::from_f64(shape.apply(fun, cell.to_f64(), other.to_f64()))
        })
        .collect()
}

/// Simple join writing into the primary cells.
pub fn simple_join_inplace<P: Cell, S: Cell>(
    primary: &mut [P],
    secondary: &[S],
    fun: fn(f64, f64) -> f64,
    shape: &JoinShape,
) {
    shape.check(primary.len(), secondary.len());
    for (idx, cell) in primary.iter_mut().enumerate() {
        let other = secondary[shape.secondary_index(idx, secondary.len())];
        *cell = P::from_f64(shape.apply(fun, cell.to_f64(), other.to_f64()));
    }
}

#[must_use]
pub fn map_cells<I: Cell, O: Cell>(src: &[I], fun: fn(f64) -> f64) -> Vec<O> {
    src.iter().map(|cell| O::from_f64(fun(cell.to_f64()))).collect()
}

pub fn map_inplace<T: Cell>(cells: &mut [T], fun: fn(f64) -> f64) {
    for cell in cells {
        *cell = T::from_f64(fun(cell.to_f64()));
    }
}

#[must_use]
pub fn cell_cast<I: Cell, O: Cell>(src: &[I]) -> Vec<O> {
    src.iter().map(|cell| O::from_f64(cell.to_f64())).collect()
}

fn dense_sizes(value_type: &ValueType) -> Vec<usize> {
    value_type
        .dimensions()
        .iter()
        .map(|dim| dim.size_or_zero())
        .collect()
}

/// Stride of every `result` dimension inside `operand`, zero where the
/// operand lacks the dimension.
fn broadcast_strides(operand: &ValueType, result: &ValueType) -> Vec<usize> {
    let own = contiguous_strides(&dense_sizes(operand));
    result
        .dimensions()
        .iter()
        .map(|dim| operand.dimension_index(&dim.name).map_or(0, |pos| own[pos]))
        .collect()
}

/// Join of two dense operands with full broadcasting over the union of
/// their dimensions.
#[must_use]
pub fn generic_join<L: Cell, R: Cell, O: Cell>(
    lhs: &[L],
    lhs_type: &ValueType,
    rhs: &[R],
    rhs_type: &ValueType,
    fun: fn(f64, f64) -> f64,
) -> Vec<O> {
    let result_type = ValueType::join(lhs_type, rhs_type);
    assert!(result_type.is_dense(), "generic dense join needs dense types");
    assert_eq!(lhs.len(), lhs_type.dense_subspace_size());
    assert_eq!(rhs.len(), rhs_type.dense_subspace_size());
    let sizes = dense_sizes(&result_type);
    let lhs_strides = broadcast_strides(lhs_type, &result_type);
    let rhs_strides = broadcast_strides(rhs_type, &result_type);
    let mut coords = vec![0usize; sizes.len()];
    let mut out = Vec::with_capacity(result_type.dense_subspace_size());
    loop {
        let lhs_idx: usize = coords.iter().zip(&lhs_strides).map(|(c, s)| c * s).sum();
        let rhs_idx: usize = coords.iter().zip(&rhs_strides).map(|(c, s)| c * s).sum();
        out.push(O::from_f64(fun(lhs[lhs_idx].to_f64(), rhs[rhs_idx].to_f64())));
        if !next_coordinate(&mut coords, &sizes) {
            break;
        }
    }
    out
}

/// Reduces any subset of the dimensions of a dense operand; an empty list
/// reduces everything.
#[must_use]
pub fn generic_reduce<I: Cell, O: Cell>(
    src: &[I],
    src_type: &ValueType,
    dims: &[String],
    aggr: Aggr,
) -> Vec<O> {
    let result_type = src_type.reduce(dims);
    assert!(result_type.is_dense(), "generic dense reduce needs dense types");
    assert_eq!(src.len(), src_type.dense_subspace_size());
    let sizes = dense_sizes(src_type);
    let result_strides = broadcast_strides(&result_type, src_type);
    let mut aggregators = vec![Aggregator::new(aggr); result_type.dense_subspace_size()];
    let mut coords = vec![0usize; sizes.len()];
    for cell in src {
        let out_idx: usize = coords.iter().zip(&result_strides).map(|(c, s)| c * s).sum();
        aggregators[out_idx].next(cell.to_f64());
        next_coordinate(&mut coords, &sizes);
    }
    aggregators
        .iter()
        .map(|aggregator| O::from_f64(aggregator.result()))
        .collect()
}
