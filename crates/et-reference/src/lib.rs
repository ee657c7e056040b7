#![forbid(unsafe_code)]

//! Straightforward tensor operations over [`TensorSpec`]. Every operation
//! works cell by cell on normalized specs, so it handles dense, sparse and
//! mixed types alike. An error-typed operand or result type yields an
//! error spec.

use std::collections::BTreeMap;

use et_core::{Aggr, Aggregator, CellType, Op1, Op2, ValueType, next_coordinate};
use et_storage::{Address, Label, TensorSpec};

fn combine(lhs: &Address, rhs: &Address) -> Option<Address> {
    let mut out = lhs.clone();
    for (name, label) in rhs {
        match out.get(name) {
            Some(existing) if existing != label => return None,
            Some(_) => {}
            None => {
                out.insert(name.clone(), label.clone());
            }
        }
    }
    Some(out)
}

fn label_matches(own: &Label, wanted: &Label) -> bool {
    match (own, wanted) {
        (Label::Indexed(idx), Label::Mapped(name)) | (Label::Mapped(name), Label::Indexed(idx)) => {
            *name == idx.to_string()
        }
        _ => own == wanted,
    }
}

#[must_use]
pub fn join(lhs: &TensorSpec, rhs: &TensorSpec, op: Op2) -> TensorSpec {
    let value_type = ValueType::join(lhs.value_type(), rhs.value_type());
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let (lhs, rhs) = (lhs.normalize(), rhs.normalize());
    let fun = op.function();
    let mut out = TensorSpec::new(value_type);
    for (lhs_addr, lhs_value) in lhs.cells() {
        for (rhs_addr, rhs_value) in rhs.cells() {
            if let Some(addr) = combine(lhs_addr, rhs_addr) {
                out.add(addr, fun(*lhs_value, *rhs_value));
            }
        }
    }
    out
}

/// Union of two same-shaped specs; `op` only where both have a cell.
#[must_use]
pub fn merge(lhs: &TensorSpec, rhs: &TensorSpec, op: Op2) -> TensorSpec {
    let value_type = ValueType::merge(lhs.value_type(), rhs.value_type());
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let (lhs, rhs) = (lhs.normalize(), rhs.normalize());
    let fun = op.function();
    let mut out = TensorSpec::new(value_type);
    for (addr, value) in lhs.cells() {
        let merged = match rhs.get(addr) {
            Some(other) => fun(*value, other),
            None => *value,
        };
        out.add(addr.clone(), merged);
    }
    for (addr, value) in rhs.cells() {
        if lhs.get(addr).is_none() {
            out.add(addr.clone(), *value);
        }
    }
    out
}

#[must_use]
pub fn reduce(spec: &TensorSpec, aggr: Aggr, dims: &[String]) -> TensorSpec {
    let value_type = spec.value_type().reduce(dims);
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let input = spec.normalize();
    let mut groups: BTreeMap<Address, Aggregator> = BTreeMap::new();
    for (addr, value) in input.cells() {
        let key: Address = addr
            .iter()
            .filter(|(name, _)| value_type.dimension_index(name).is_some())
            .map(|(name, label)| (name.clone(), label.clone()))
            .collect();
        groups
            .entry(key)
            .and_modify(|aggregator| aggregator.next(*value))
            .or_insert_with(|| {
                let mut aggregator = Aggregator::new(aggr);
                aggregator.first(*value);
                aggregator
            });
    }
    let mut out = TensorSpec::new(value_type);
    if out.value_type().is_double() && groups.is_empty() {
        out.add(Address::new(), 0.0);
    }
    for (addr, aggregator) in groups {
        out.add(addr, aggregator.result());
    }
    out
}

#[must_use]
pub fn map(spec: &TensorSpec, op: Op1) -> TensorSpec {
    map_with(spec, op.function())
}

/// Map with an arbitrary scalar function.
#[must_use]
pub fn map_with(spec: &TensorSpec, fun: impl Fn(f64) -> f64) -> TensorSpec {
    let value_type = spec.value_type().map();
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let mut out = TensorSpec::new(value_type);
    for (addr, value) in spec.normalize().cells() {
        out.add(addr.clone(), fun(*value));
    }
    out
}

#[must_use]
pub fn rename(spec: &TensorSpec, from: &[String], to: &[String]) -> TensorSpec {
    let value_type = spec.value_type().rename(from, to);
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let mut out = TensorSpec::new(value_type);
    for (addr, value) in spec.cells() {
        let renamed = addr
            .iter()
            .map(|(name, label)| {
                let name = from
                    .iter()
                    .position(|old| old == name)
                    .map_or_else(|| name.clone(), |pos| to[pos].clone());
                (name, label.clone())
            })
            .collect();
        out.add(renamed, *value);
    }
    out
}

/// Concatenates along an indexed dimension. Operands lacking the dimension
/// count as size 1 along it; the other dimensions join.
#[must_use]
pub fn concat(lhs: &TensorSpec, rhs: &TensorSpec, dimension: &str) -> TensorSpec {
    let value_type = ValueType::concat(lhs.value_type(), rhs.value_type(), dimension);
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let lhs_size = lhs
        .value_type()
        .dimension_index(dimension)
        .map_or(1, |idx| lhs.value_type().dimensions()[idx].size_or_zero()) as u32;
    let split = |addr: &Address| -> (Address, u32) {
        let mut rest = addr.clone();
        let pos = rest
            .remove(dimension)
            .and_then(|label| label.as_index())
            .unwrap_or(0);
        (rest, pos)
    };
    let (lhs, rhs) = (lhs.normalize(), rhs.normalize());
    let mut out = TensorSpec::new(value_type);
    for (lhs_addr, lhs_value) in lhs.cells() {
        let (lhs_rest, lhs_pos) = split(lhs_addr);
        for (rhs_addr, rhs_value) in rhs.cells() {
            let (rhs_rest, rhs_pos) = split(rhs_addr);
            if let Some(mut addr) = combine(&lhs_rest, &rhs_rest) {
                let mut from_lhs = addr.clone();
                from_lhs.insert(dimension.to_string(), Label::Indexed(lhs_pos));
                out.add(from_lhs, *lhs_value);
                addr.insert(dimension.to_string(), Label::Indexed(lhs_size + rhs_pos));
                out.add(addr, *rhs_value);
            }
        }
    }
    out
}

/// Fixes the dimensions named in `address` and drops them from the result.
/// Labels that address no cell select nothing (zero for dense results).
#[must_use]
pub fn peek(spec: &TensorSpec, address: &Address) -> TensorSpec {
    let dims: Vec<String> = address.keys().cloned().collect();
    let value_type = spec.value_type().peek(&dims);
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let mut out = TensorSpec::new(value_type);
    for (addr, value) in spec.normalize().cells() {
        let selected = address.iter().all(|(name, wanted)| {
            addr.get(name)
                .is_some_and(|own| label_matches(own, wanted))
        });
        if selected {
            let rest = addr
                .iter()
                .filter(|(name, _)| !address.contains_key(*name))
                .map(|(name, label)| (name.clone(), label.clone()))
                .collect();
            out.add(rest, *value);
        }
    }
    if out.value_type().is_double() && out.cells().is_empty() {
        out.add(Address::new(), 0.0);
    }
    out
}

/// Builds a spec from explicit cells; dense cells left out are zero.
#[must_use]
pub fn create(value_type: &ValueType, cells: &[(Address, f64)]) -> TensorSpec {
    let mut out = TensorSpec::new(value_type.clone());
    for (addr, value) in cells {
        out.add(addr.clone(), *value);
    }
    out
}

/// Dense tensor whose cells come from `fun(coordinates)` in odometer order.
#[must_use]
pub fn lambda(value_type: &ValueType, fun: impl Fn(&[usize]) -> f64) -> TensorSpec {
    if value_type.is_error() || !value_type.is_dense() {
        return TensorSpec::error();
    }
    let dims = value_type.dimensions();
    let sizes: Vec<usize> = dims.iter().map(|dim| dim.size_or_zero()).collect();
    let mut coords = vec![0usize; sizes.len()];
    let mut out = TensorSpec::new(value_type.clone());
    loop {
        let addr = dims
            .iter()
            .zip(&coords)
            .map(|(dim, coord)| (dim.name.clone(), Label::Indexed(*coord as u32)))
            .collect();
        out.add(addr, fun(&coords));
        if !next_coordinate(&mut coords, &sizes) {
            break;
        }
    }
    out
}

#[must_use]
pub fn cell_cast(spec: &TensorSpec, cell_type: CellType) -> TensorSpec {
    let value_type = spec.value_type().cell_cast(cell_type);
    if value_type.is_error() {
        return TensorSpec::error();
    }
    let mut out = TensorSpec::new(value_type);
    for (addr, value) in spec.cells() {
        out.add(addr.clone(), *value);
    }
    out
}
