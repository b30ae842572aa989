//! Safetensors header parsing.
//!
//! The format is:
//! - 8-byte little-endian header size
//! - JSON header with tensor metadata (name, dtype, shape, data offsets)
//! - Raw tensor data
//!
//! Only the header is decoded here; tensors themselves are loaded by
//! candle when a checkpoint is applied to a model.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use candle_core::DType;
use serde::Deserialize;

use crate::error::{MammutError, Result};
use crate::weights::mmap::MappedFile;

/// Metadata for a single tensor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TensorInfo {
    /// Data type string (e.g., "F16", "F32", "BF16", "I64", "U32").
    pub dtype: String,

    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    pub fn parse_dtype(&self) -> Result<DType> {
        match self.dtype.as_str() {
            "F32" => Ok(DType::F32),
            "F16" => Ok(DType::F16),
            "BF16" => Ok(DType::BF16),
            "F64" => Ok(DType::F64),
            "I64" => Ok(DType::I64),
            "U32" => Ok(DType::U32),
            "U8" => Ok(DType::U8),
            other => Err(MammutError::UnsupportedDtype(other.to_string())),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parsed header.
pub struct SafetensorsHeader {
    pub tensors: HashMap<String, TensorInfo>,

    /// The optional `__metadata__` string map.
    pub metadata: HashMap<String, String>,

    /// Byte offset where the data section begins.
    pub data_offset: usize,
}

/// Parse a safetensors header from raw file bytes.
pub fn parse_header(bytes: &[u8]) -> Result<SafetensorsHeader> {
    if bytes.len() < 8 {
        return Err(MammutError::WeightLoad("file too small for safetensors header".into()));
    }

    let header_size = (&bytes[..8])
        .read_u64::<LittleEndian>()
        .map_err(|e| MammutError::WeightLoad(format!("failed to read header size: {e}")))?
        as usize;

    if header_size > bytes.len() - 8 {
        return Err(MammutError::WeightLoad(format!(
            "header size {header_size} exceeds file size {}",
            bytes.len()
        )));
    }

    let header_str = std::str::from_utf8(&bytes[8..8 + header_size])
        .map_err(|e| MammutError::WeightLoad(format!("invalid UTF-8 in header: {e}")))?;
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(header_str)?;

    let mut tensors = HashMap::new();
    let mut metadata = HashMap::new();
    for (key, value) in raw {
        if key == "__metadata__" {
            if let Some(obj) = value.as_object() {
                for (mk, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        metadata.insert(mk.clone(), s.to_string());
                    }
                }
            }
        } else {
            let info: TensorInfo = serde_json::from_value(value).map_err(|e| {
                MammutError::WeightLoad(format!("failed to parse tensor '{key}': {e}"))
            })?;
            tensors.insert(key, info);
        }
    }

    Ok(SafetensorsHeader {
        tensors,
        metadata,
        data_offset: 8 + header_size,
    })
}

/// A safetensors file with a parsed header.
pub struct SafetensorsFile {
    pub header: SafetensorsHeader,
    mapped: MappedFile,
}

impl SafetensorsFile {
    pub fn open(path: &Path) -> Result<Self> {
        let mapped = MappedFile::open(path)?;
        let header = parse_header(mapped.as_bytes())?;
        Ok(SafetensorsFile { header, mapped })
    }

    /// Raw bytes of a named tensor.
    pub fn tensor_data(&self, name: &str) -> Result<&[u8]> {
        let info = self.header.tensors.get(name).ok_or_else(|| {
            MammutError::WeightLoad(format!("tensor '{name}' not found in safetensors"))
        })?;
        self.mapped
            .slice(self.header.data_offset + info.data_offsets[0], info.byte_size())
    }

    /// Tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.header.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }

    /// Total number of stored elements.
    pub fn num_params(&self) -> usize {
        self.header.tensors.values().map(TensorInfo::elem_count).sum()
    }

    pub fn file_size(&self) -> usize {
        self.mapped.size()
    }
}
