//! Versioned binary codec for model weights
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic       8 bytes  "RLHFCKPT"
//! version     u32
//! tensors     u32
//! per tensor:
//!   name_len  u32, name (UTF-8)
//!   dtype     u8   (1 = f64)
//!   rank      u32, dims u64 * rank
//!   values    f64 * product(dims)
//! ```

use serde::{Deserialize, Serialize};

use rlhf_core::{Result, RlhfError};

pub const MAGIC: &[u8; 8] = b"RLHFCKPT";
pub const FORMAT_VERSION: u32 = 1;

/// Element type of a stored tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
}

impl DType {
    fn tag(self) -> u8 {
        match self {
            DType::F64 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(DType::F64),
            other => Err(RlhfError::Checkpoint(format!("unsupported dtype tag {other}"))),
        }
    }
}

/// One named tensor, flattened in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(RlhfError::Checkpoint(format!(
                "tensor {name}: shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            name,
            shape,
            dtype: DType::F64,
            data,
        })
    }
}

/// Ordered set of named tensors describing a model's parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightSet {
    pub tensors: Vec<Tensor>,
}

impl WeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tensor: Tensor) {
        self.tensors.push(tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }
}

pub fn encode(weights: &WeightSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + weights.parameter_count() * 8);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(weights.tensors.len() as u32).to_le_bytes());

    for tensor in &weights.tensors {
        out.extend_from_slice(&(tensor.name.len() as u32).to_le_bytes());
        out.extend_from_slice(tensor.name.as_bytes());
        out.push(tensor.dtype.tag());
        out.extend_from_slice(&(tensor.shape.len() as u32).to_le_bytes());
        for &dim in &tensor.shape {
            out.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        for value in &tensor.data {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    out
}

pub fn decode(bytes: &[u8]) -> Result<WeightSet> {
    let mut reader = Reader { bytes, pos: 0 };

    if reader.take(MAGIC.len())? != MAGIC {
        return Err(RlhfError::Checkpoint("not a checkpoint file (bad magic)".into()));
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(RlhfError::Checkpoint(format!(
            "unsupported checkpoint format version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let count = reader.u32()? as usize;
    let mut weights = WeightSet::new();
    for _ in 0..count {
        let name_len = reader.u32()? as usize;
        let name = std::str::from_utf8(reader.take(name_len)?)
            .map_err(|e| RlhfError::Checkpoint(format!("tensor name is not UTF-8: {e}")))?
            .to_string();
        let dtype = DType::from_tag(reader.u8()?)?;
        let rank = reader.u32()? as usize;
        let too_large = || RlhfError::Checkpoint(format!("tensor {name} is too large"));
        let shape = (0..rank)
            .map(|_| reader.u64().and_then(|d| usize::try_from(d).map_err(|_| too_large())))
            .collect::<Result<Vec<_>>>()?;

        let byte_len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .and_then(|len| len.checked_mul(8))
            .ok_or_else(too_large)?;
        let raw = reader.take(byte_len)?;
        let data = raw
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        weights.push(Tensor {
            name,
            shape,
            dtype,
            data,
        });
    }

    if reader.pos != bytes.len() {
        return Err(RlhfError::Checkpoint(format!(
            "{} trailing bytes after last tensor",
            bytes.len() - reader.pos
        )));
    }

    Ok(weights)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| RlhfError::Checkpoint("checkpoint is truncated".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_weights() -> WeightSet {
        let mut weights = WeightSet::new();
        weights.push(Tensor::new("policy.weight", vec![2, 3], vec![0.1, -0.2, 0.3, 0.4, 0.5, -0.6]).unwrap());
        weights.push(Tensor::new("policy.bias", vec![2], vec![0.0, 1.5]).unwrap());
        weights
    }

    #[test]
    fn test_encode_decode() {
        let weights = sample_weights();
        let bytes = encode(&weights);
        assert_eq!(&bytes[..8], MAGIC);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, weights);
        assert_eq!(decoded.parameter_count(), 8);
        assert_eq!(decoded.get("policy.bias").unwrap().shape, vec![2]);
    }

    #[test]
    fn test_rejects_future_version() {
        let mut bytes = encode(&sample_weights());
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("format version 2"));
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let bytes = encode(&sample_weights());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(decode(&bad_magic).is_err());

        assert!(decode(&bytes[..bytes.len() - 3]).is_err());

        let mut trailing = bytes;
        trailing.push(0);
        assert!(decode(&trailing).is_err());
    }

    #[test]
    fn test_rejects_overflowing_dims() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'w');
        bytes.push(DType::F64.tag());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, RlhfError::Checkpoint(_)));
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[test]
    fn test_rejects_unknown_dtype() {
        let mut weights = WeightSet::new();
        weights.push(Tensor::new("w", vec![1], vec![1.0]).unwrap());
        let mut bytes = encode(&weights);
        // magic + version + count + name_len + "w"
        let dtype_pos = 8 + 4 + 4 + 4 + 1;
        bytes[dtype_pos] = 9;
        assert!(decode(&bytes).unwrap_err().to_string().contains("dtype"));
    }

    #[test]
    fn test_tensor_shape_mismatch() {
        assert!(Tensor::new("w", vec![2, 2], vec![1.0, 2.0]).is_err());
    }
}
