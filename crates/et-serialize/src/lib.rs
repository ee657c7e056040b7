#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use et_core::{CellBuffer, CellType, Dimension, TypedCells, ValueType, contiguous_strides};
use et_storage::{Address, Label, SparseIndex, SparseValue, TensorSpec, Value, pack_labels};
use tracing::{debug, trace};

pub const SPARSE_BINARY_FORMAT: u32 = 1;
pub const DENSE_BINARY_FORMAT: u32 = 2;
pub const MIXED_BINARY_FORMAT: u32 = 3;
pub const SPARSE_BINARY_FORMAT_WITH_CELLTYPE: u32 = 5;
pub const DENSE_BINARY_FORMAT_WITH_CELLTYPE: u32 = 6;
pub const MIXED_BINARY_FORMAT_WITH_CELLTYPE: u32 = 7;

const CELL_TYPE_DOUBLE: u8 = 0;
const CELL_TYPE_FLOAT: u8 = 1;
const MAX_SPEC_JSON_BYTES: usize = 16 * 1_048_576;
const INT1_4_MAX: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    Truncated { needed: usize, remaining: usize },
    TrailingBytes { count: usize },
    UnknownFormat { id: u32 },
    UnknownCellType { code: u8 },
    InvalidType { reason: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::Truncated { needed, remaining } => {
                write!(
                    f,
                    "truncated tensor payload: needed={needed} remaining={remaining}"
                )
            }
            Self::TrailingBytes { count } => write!(f, "{count} trailing bytes after tensor"),
            Self::UnknownFormat { id } => write!(f, "unknown tensor format id {id}"),
            Self::UnknownCellType { code } => write!(f, "unknown cell type code {code}"),
            Self::InvalidType { reason } => write!(f, "invalid tensor type: {reason}"),
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

#[derive(Debug, Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    /// One byte below 0x80, otherwise four big-endian bytes with the top bit
    /// set.
    fn int1_4(&mut self, value: u32) {
        assert!(value <= INT1_4_MAX, "int1_4 value {value} out of range");
        if value < 0x80 {
            self.bytes.push(value as u8);
        } else {
            self.bytes
                .extend_from_slice(&(value | 0x8000_0000).to_be_bytes());
        }
    }

    fn string(&mut self, value: &str) {
        self.int1_4(value.len() as u32);
        self.bytes.extend_from_slice(value.as_bytes());
    }

    fn cells(&mut self, cells: TypedCells<'_>) {
        match cells {
            TypedCells::Double(values) => {
                for value in values {
                    self.bytes.extend_from_slice(&value.to_be_bytes());
                }
            }
            TypedCells::Float(values) => {
                for value in values {
                    self.bytes.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
    }

    fn cell(&mut self, cell_type: CellType, value: f64) {
        match cell_type {
            CellType::Double => self.bytes.extend_from_slice(&value.to_be_bytes()),
            CellType::Float => self.bytes.extend_from_slice(&(value as f32).to_be_bytes()),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SerializeError> {
        if self.remaining() < len {
            return Err(SerializeError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn int1_4(&mut self) -> Result<u32, SerializeError> {
        let first = self.take(1)?[0];
        if first < 0x80 {
            return Ok(u32::from(first));
        }
        let rest = self.take(3)?;
        Ok(u32::from_be_bytes([first & 0x7f, rest[0], rest[1], rest[2]]))
    }

    fn string(&mut self) -> Result<String, SerializeError> {
        let len = self.int1_4()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|error| SerializeError::IncompatiblePayload {
            reason: format!("label is not utf-8: {error}"),
        })
    }

    fn cell(&mut self, cell_type: CellType) -> Result<f64, SerializeError> {
        match cell_type {
            CellType::Double => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(f64::from_be_bytes(raw))
            }
            CellType::Float => {
                let bytes = self.take(4)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Ok(f64::from(f32::from_be_bytes(raw)))
            }
        }
    }

    fn ensure_available(&self, cells: usize, cell_type: CellType) -> Result<(), SerializeError> {
        let needed = cells.saturating_mul(cell_type.size_of());
        if self.remaining() < needed {
            return Err(SerializeError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

fn cell_type_code(cell_type: CellType) -> u8 {
    match cell_type {
        CellType::Double => CELL_TYPE_DOUBLE,
        CellType::Float => CELL_TYPE_FLOAT,
    }
}

/// Format id for a value: legacy ids for double cells, the
/// `*_WITH_CELLTYPE` ids otherwise.
#[must_use]
pub fn format_id(value_type: &ValueType) -> u32 {
    let with_cell_type = value_type.cell_type() != CellType::Double;
    match (value_type.is_sparse(), value_type.is_dense(), with_cell_type) {
        (true, _, false) => SPARSE_BINARY_FORMAT,
        (true, _, true) => SPARSE_BINARY_FORMAT_WITH_CELLTYPE,
        (_, true, false) => DENSE_BINARY_FORMAT,
        (_, true, true) => DENSE_BINARY_FORMAT_WITH_CELLTYPE,
        (_, _, false) => MIXED_BINARY_FORMAT,
        (_, _, true) => MIXED_BINARY_FORMAT_WITH_CELLTYPE,
    }
}

/// Encodes a non-error value in the typed binary format.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, SerializeError> {
    let value_type = value.value_type();
    if value_type.is_error() {
        return Err(SerializeError::InvalidType {
            reason: "error values have no binary form".to_string(),
        });
    }
    let id = format_id(value_type);
    let mut out = Writer::default();
    out.int1_4(id);
    if id >= SPARSE_BINARY_FORMAT_WITH_CELLTYPE {
        out.bytes.push(cell_type_code(value_type.cell_type()));
    }
    match value {
        Value::Dense(dense) => {
            encode_indexed_dims(&mut out, value_type);
            out.cells(dense.cells());
        }
        Value::Sparse(sparse) => encode_sparse(&mut out, sparse),
        Value::Mixed(mixed) => encode_mixed(&mut out, mixed.spec()),
    }
    debug!(format = id, bytes = out.bytes.len(), "tensor encoded");
    Ok(out.bytes)
}

fn encode_indexed_dims(out: &mut Writer, value_type: &ValueType) {
    let dims = value_type.indexed_dimensions();
    out.int1_4(dims.len() as u32);
    for dim in dims {
        out.string(&dim.name);
        out.int1_4(dim.size.unwrap_or(0));
    }
}

fn encode_sparse(out: &mut Writer, sparse: &SparseValue) {
    let value_type = sparse.value_type();
    out.int1_4(value_type.dimensions().len() as u32);
    for dim in value_type.dimensions() {
        out.string(&dim.name);
    }
    let index = sparse.index();
    let cells = sparse.cells();
    out.int1_4(index.size() as u32);
    for subspace in 0..index.size() {
        for label in index.labels(subspace) {
            out.string(label);
        }
        out.cell(value_type.cell_type(), cells.get(subspace));
    }
}

fn encode_mixed(out: &mut Writer, spec: &TensorSpec) {
    let value_type = spec.value_type();
    let mapped = value_type.mapped_dimensions();
    let indexed = value_type.indexed_dimensions();
    out.int1_4(mapped.len() as u32);
    for dim in &mapped {
        out.string(&dim.name);
    }
    encode_indexed_dims(out, value_type);

    let sizes: Vec<usize> = indexed.iter().map(|dim| dim.size_or_zero()).collect();
    let strides = contiguous_strides(&sizes);
    let subspace_size = value_type.dense_subspace_size();
    let mut blocks: BTreeMap<Vec<&str>, Vec<f64>> = BTreeMap::new();
    for (addr, value) in spec.cells() {
        let labels: Vec<&str> = mapped
            .iter()
            .map(|dim| addr.get(&dim.name).and_then(Label::as_name).unwrap_or(""))
            .collect();
        let offset: usize = indexed
            .iter()
            .zip(&strides)
            .map(|(dim, stride)| {
                addr.get(&dim.name)
                    .and_then(Label::as_index)
                    .map_or(0, |idx| idx as usize * stride)
            })
            .sum();
        blocks
            .entry(labels)
            .or_insert_with(|| vec![0.0; subspace_size])[offset] = *value;
    }
    out.int1_4(blocks.len() as u32);
    for (labels, cells) in blocks {
        for label in labels {
            out.string(label);
        }
        for cell in cells {
            out.cell(value_type.cell_type(), cell);
        }
    }
}

/// Decodes one value and rejects trailing bytes.
pub fn decode_value(bytes: &[u8]) -> Result<Value, SerializeError> {
    let mut input = Reader::new(bytes);
    let id = input.int1_4()?;
    let cell_type = match id {
        SPARSE_BINARY_FORMAT | DENSE_BINARY_FORMAT | MIXED_BINARY_FORMAT => CellType::Double,
        SPARSE_BINARY_FORMAT_WITH_CELLTYPE
        | DENSE_BINARY_FORMAT_WITH_CELLTYPE
        | MIXED_BINARY_FORMAT_WITH_CELLTYPE => match input.byte()? {
            CELL_TYPE_DOUBLE => CellType::Double,
            CELL_TYPE_FLOAT => CellType::Float,
            code => return Err(SerializeError::UnknownCellType { code }),
        },
        id => return Err(SerializeError::UnknownFormat { id }),
    };
    let value = match id {
        SPARSE_BINARY_FORMAT | SPARSE_BINARY_FORMAT_WITH_CELLTYPE => {
            decode_sparse(&mut input, cell_type)?
        }
        DENSE_BINARY_FORMAT | DENSE_BINARY_FORMAT_WITH_CELLTYPE => {
            decode_dense(&mut input, cell_type)?
        }
        _ => decode_mixed(&mut input, cell_type)?,
    };
    if input.remaining() > 0 {
        return Err(SerializeError::TrailingBytes {
            count: input.remaining(),
        });
    }
    trace!(format = id, cell_type = cell_type.name(), "tensor decoded");
    Ok(value)
}

fn check_sorted(dims: &[Dimension]) -> Result<(), SerializeError> {
    let names: Vec<&str> = dims.iter().map(|dim| dim.name.as_str()).collect();
    if names.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(SerializeError::InvalidType {
            reason: format!("dimensions not in sorted order: {names:?}"),
        });
    }
    Ok(())
}

fn checked_type(cell_type: CellType, dims: Vec<Dimension>) -> Result<ValueType, SerializeError> {
    check_sorted(&dims)?;
    let value_type = ValueType::make_type(cell_type, dims);
    if value_type.is_error() {
        return Err(SerializeError::InvalidType {
            reason: "dimension list does not form a valid type".to_string(),
        });
    }
    Ok(value_type)
}

fn read_indexed_dims(input: &mut Reader<'_>) -> Result<Vec<Dimension>, SerializeError> {
    let count = input.int1_4()? as usize;
    let mut dims = Vec::new();
    for _ in 0..count {
        let name = input.string()?;
        let size = input.int1_4()?;
        dims.push(Dimension::indexed(name, size));
    }
    Ok(dims)
}

fn read_mapped_dims(input: &mut Reader<'_>) -> Result<Vec<Dimension>, SerializeError> {
    let count = input.int1_4()? as usize;
    let mut dims = Vec::new();
    for _ in 0..count {
        dims.push(Dimension::mapped(input.string()?));
    }
    Ok(dims)
}

fn decode_dense(input: &mut Reader<'_>, cell_type: CellType) -> Result<Value, SerializeError> {
    let value_type = checked_type(cell_type, read_indexed_dims(input)?)?;
    let size = value_type.dense_subspace_size();
    input.ensure_available(size, cell_type)?;
    let mut cells = Vec::with_capacity(size);
    for _ in 0..size {
        cells.push(input.cell(cell_type)?);
    }
    Ok(Value::dense_from_f64(value_type, &cells))
}

fn decode_sparse(input: &mut Reader<'_>, cell_type: CellType) -> Result<Value, SerializeError> {
    let value_type = checked_type(cell_type, read_mapped_dims(input)?)?;
    let num_dims = value_type.dimensions().len();
    let count = input.int1_4()? as usize;
    if value_type.is_double() {
        if count != 1 {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!("scalar tensor with {count} cells"),
            });
        }
        return Ok(Value::double(input.cell(cell_type)?));
    }
    let mut index = SparseIndex::new(num_dims);
    let mut cells = CellBuffer::with_capacity(value_type.cell_type(), count.min(input.remaining()));
    let mut packed = Vec::new();
    for _ in 0..count {
        let mut labels = Vec::with_capacity(num_dims);
        for _ in 0..num_dims {
            labels.push(input.string()?);
        }
        packed.clear();
        pack_labels(&mut packed, labels.iter().map(String::as_str));
        let value = input.cell(cell_type)?;
        let subspace = index.add(&packed);
        if subspace == cells.len() {
            cells.push(value);
        } else {
            cells.set(subspace, value);
        }
    }
    Ok(Value::Sparse(SparseValue::new(
        value_type,
        Arc::new(index),
        cells,
    )))
}

fn decode_mixed(input: &mut Reader<'_>, cell_type: CellType) -> Result<Value, SerializeError> {
    let mapped = read_mapped_dims(input)?;
    let indexed = read_indexed_dims(input)?;
    let mapped_names: Vec<String> = mapped.iter().map(|dim| dim.name.clone()).collect();
    let indexed_shape: Vec<(String, usize)> = indexed
        .iter()
        .map(|dim| (dim.name.clone(), dim.size_or_zero()))
        .collect();
    check_sorted(&mapped)?;
    check_sorted(&indexed)?;
    let mut all = mapped;
    all.extend(indexed);
    let value_type = ValueType::make_type(cell_type, all);
    if value_type.is_error() {
        return Err(SerializeError::InvalidType {
            reason: "dimension list does not form a valid type".to_string(),
        });
    }
    let sizes: Vec<usize> = indexed_shape.iter().map(|(_, size)| *size).collect();
    let subspace_size: usize = sizes.iter().product();
    let blocks = input.int1_4()? as usize;
    let mut spec = TensorSpec::new(value_type);
    for _ in 0..blocks {
        let mut sparse_part = Address::new();
        for name in &mapped_names {
            sparse_part.insert(name.clone(), Label::Mapped(input.string()?));
        }
        input.ensure_available(subspace_size, cell_type)?;
        let mut coords = vec![0usize; sizes.len()];
        loop {
            let mut addr = sparse_part.clone();
            for ((name, _), coord) in indexed_shape.iter().zip(&coords) {
                addr.insert(name.clone(), Label::Indexed(*coord as u32));
            }
            spec.add(addr, input.cell(cell_type)?);
            if !et_core::next_coordinate(&mut coords, &sizes) {
                break;
            }
        }
    }
    Ok(Value::from_spec(&spec))
}

pub fn encode_spec_json(spec: &TensorSpec) -> Result<String, SerializeError> {
    serde_json::to_string(spec).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("spec encoding failed: {error}"),
    })
}

/// Decodes a `{"type": ..., "cells": [...]}` document. Unknown fields are
/// rejected; addresses that do not fit the type give an error-typed spec.
pub fn decode_spec_json(input: &str) -> Result<TensorSpec, SerializeError> {
    if input.len() > MAX_SPEC_JSON_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "spec payload exceeds max bytes: actual={} max={MAX_SPEC_JSON_BYTES}",
                input.len()
            ),
        });
    }
    serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use et_core::ValueType;
    use et_storage::{Label, TensorSpec, Value};
    use proptest::prelude::*;

    use super::{
        DENSE_BINARY_FORMAT, DENSE_BINARY_FORMAT_WITH_CELLTYPE, MIXED_BINARY_FORMAT,
        SPARSE_BINARY_FORMAT, SPARSE_BINARY_FORMAT_WITH_CELLTYPE, SerializeError, Writer,
        decode_spec_json, decode_value, encode_spec_json, encode_value,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn bytes_digest(bytes: &[u8]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "et_serialize_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            "cargo test -p et-serialize -- --nocapture".to_string(),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "seed",
            "input_digest",
            "output_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    fn round_trip(spec: &TensorSpec) -> (Vec<u8>, TensorSpec) {
        let value = Value::from_spec(spec);
        let bytes = encode_value(&value).expect("value encodes");
        let decoded = decode_value(&bytes).expect("value decodes");
        (bytes, decoded.to_spec())
    }

    #[test]
    fn int1_4_switches_width_at_0x80() {
        let mut out = Writer::default();
        out.int1_4(0x7f);
        out.int1_4(0x80);
        assert_eq!(out.bytes, vec![0x7f, 0x80, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn dense_double_uses_legacy_format_id() {
        let spec = TensorSpec::from_type_spec("tensor(x[2])")
            .with_cell(&[("x", 0.into())], 1.5)
            .with_cell(&[("x", 1.into())], -2.0);
        let (bytes, decoded) = round_trip(&spec);
        assert_eq!(bytes[0] as u32, DENSE_BINARY_FORMAT);
        assert_eq!(&bytes[1..5], &[1, 1, b'x', 2]);
        assert_eq!(&bytes[5..13], &1.5f64.to_be_bytes());
        assert_eq!(decoded, spec);
    }

    #[test]
    fn dense_float_carries_cell_type_byte() {
        let spec = TensorSpec::from_type_spec("tensor<float>(x[2],y[2])")
            .with_cell(&[("x", 1.into()), ("y", 0.into())], 0.25);
        let (bytes, decoded) = round_trip(&spec);
        assert_eq!(bytes[0] as u32, DENSE_BINARY_FORMAT_WITH_CELLTYPE);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes.len(), 2 + 1 + 2 * 3 + 4 * 4);
        assert!(decoded.approx_eq(&spec));
    }

    #[test]
    fn sparse_round_trips_labels_and_values() {
        let spec = TensorSpec::from_type_spec("tensor(x{},y{})")
            .with_cell(&[("x", "a".into()), ("y", "".into())], 3.0)
            .with_cell(&[("x", "b".into()), ("y", "long label".into())], 4.0);
        let (bytes, decoded) = round_trip(&spec);
        assert_eq!(bytes[0] as u32, SPARSE_BINARY_FORMAT);
        assert_eq!(decoded, spec);

        let float = TensorSpec::from_type_spec("tensor<float>(x{})")
            .with_cell(&[("x", "a".into())], 0.5);
        let (bytes, decoded) = round_trip(&float);
        assert_eq!(bytes[0] as u32, SPARSE_BINARY_FORMAT_WITH_CELLTYPE);
        assert_eq!(decoded, float);
    }

    #[test]
    fn mixed_round_trips_dense_blocks() {
        let spec = TensorSpec::from_type_spec("tensor(x{},y[3])")
            .with_cell(&[("x", "a".into()), ("y", 2.into())], 7.0)
            .with_cell(&[("x", "b".into()), ("y", 0.into())], 1.0);
        let (bytes, decoded) = round_trip(&spec);
        assert_eq!(bytes[0] as u32, MIXED_BINARY_FORMAT);
        assert!(decoded.approx_eq(&spec));
        assert_eq!(decoded.cells().len(), 6);
    }

    #[test]
    fn scalars_encode_as_dense_without_dimensions() {
        let (bytes, decoded) = round_trip(&TensorSpec::double(2.5));
        assert_eq!(bytes[0] as u32, DENSE_BINARY_FORMAT);
        assert_eq!(bytes[1], 0);
        assert_eq!(decoded, TensorSpec::double(2.5));
    }

    #[test]
    fn malformed_payloads_are_typed_errors() {
        assert!(matches!(
            decode_value(&[9]),
            Err(SerializeError::UnknownFormat { id: 9 })
        ));
        assert!(matches!(
            decode_value(&[6, 4]),
            Err(SerializeError::UnknownCellType { code: 4 })
        ));
        assert!(matches!(
            decode_value(&[2, 1, 1, b'x', 2, 0, 0]),
            Err(SerializeError::Truncated { .. })
        ));

        let mut bytes = encode_value(&Value::double(1.0)).expect("double encodes");
        bytes.push(0);
        assert!(matches!(
            decode_value(&bytes),
            Err(SerializeError::TrailingBytes { count: 1 })
        ));

        let unsorted = [2, 2, 1, b'y', 1, 1, b'x', 1];
        assert!(matches!(
            decode_value(&unsorted),
            Err(SerializeError::InvalidType { .. })
        ));

        let unsorted_mapped = [3, 2, 1, b'y', 1, b'x', 1, 1, b'z', 2, 0];
        assert!(matches!(
            decode_value(&unsorted_mapped),
            Err(SerializeError::InvalidType { .. })
        ));
        let unsorted_indexed = [3, 1, 1, b'a', 2, 1, b'z', 2, 1, b'y', 2, 0];
        assert!(matches!(
            decode_value(&unsorted_indexed),
            Err(SerializeError::InvalidType { .. })
        ));
        let sorted_mixed = [3, 1, 1, b'a', 2, 1, b'y', 2, 1, b'z', 2, 0];
        let empty = decode_value(&sorted_mixed).expect("canonical mixed payload decodes");
        assert_eq!(empty.value_type().to_spec(), "tensor(a{},y[2],z[2])");

        assert!(matches!(
            encode_value(&Value::error()),
            Err(SerializeError::InvalidType { .. })
        ));
    }

    #[test]
    fn spec_json_round_trips_and_rejects_unknown_fields() {
        let spec = TensorSpec::from_type_spec("tensor(x{})").with_cell(&[("x", "a".into())], 1.0);
        let json = encode_spec_json(&spec).expect("spec encodes");
        assert_eq!(decode_spec_json(&json).expect("spec decodes"), spec);

        let err = decode_spec_json(r#"{"type":"double","cells":[],"extra":1}"#)
            .expect_err("unknown field must fail");
        assert!(matches!(err, SerializeError::UnknownField { ref field } if field == "extra"));

        let err = decode_spec_json("{").expect_err("truncated json must fail");
        assert!(matches!(err, SerializeError::InvalidJson { .. }));
    }

    #[test]
    fn serialize_error_display_coverage() {
        let cases = vec![
            SerializeError::InvalidJson {
                diagnostic: "bad".to_string(),
            },
            SerializeError::UnknownField {
                field: "foo".to_string(),
            },
            SerializeError::Truncated {
                needed: 8,
                remaining: 2,
            },
            SerializeError::TrailingBytes { count: 1 },
            SerializeError::UnknownFormat { id: 4 },
            SerializeError::UnknownCellType { code: 9 },
            SerializeError::InvalidType {
                reason: "x".to_string(),
            },
            SerializeError::IncompatiblePayload {
                reason: "y".to_string(),
            },
        ];
        for err in &cases {
            assert!(!format!("{err}").is_empty());
        }
    }

    proptest! {
        #[test]
        fn prop_dense_round_trip_is_exact(
            cells in prop::collection::vec(-1.0e6f64..1.0e6, 1..12),
            float in any::<bool>(),
        ) {
            let ty = if float {
                format!("tensor<float>(x[{}])", cells.len())
            } else {
                format!("tensor(x[{}])", cells.len())
            };
            let value = Value::dense_from_f64(ValueType::from_spec(&ty), &cells);
            let bytes = encode_value(&value).expect("value encodes");
            let decoded = decode_value(&bytes).expect("value decodes");
            prop_assert_eq!(decoded.value_type(), value.value_type());
            prop_assert_eq!(decoded.cells().to_f64_vec(), value.cells().to_f64_vec());

            let seed = det_seed(&[cells.len() as u64, u64::from(float)]);
            let log = build_property_log(
                "prop_dense_round_trip_is_exact",
                seed,
                bytes_digest(&bytes),
                bytes_digest(&encode_value(&decoded).expect("decoded encodes")),
                "dense_round_trip_exact",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_sparse_round_trip_keeps_every_address(
            cells in prop::collection::btree_map("[a-z]{0,6}", -100.0f64..100.0, 0..8),
        ) {
            let spec = cells.iter().fold(TensorSpec::from_type_spec("tensor(x{})"), |spec, (label, value)| {
                spec.with_cell(&[("x", Label::from(label.as_str()))], *value)
            });
            let (_, decoded) = round_trip(&spec);
            prop_assert_eq!(decoded, spec);
        }
    }
}
