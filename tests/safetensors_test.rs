//! Tests for safetensors parsing and checkpoint validation.

use std::io::Write;

use candle_core::{DType, Device};
use mammut::model::registry::tiny;
use mammut::weights::safetensors::{parse_header, SafetensorsFile, TensorInfo};
use mammut::weights::validate_checkpoint;
use mammut::Mammut;

#[test]
fn test_tensor_info_parse_dtype() {
    let info = TensorInfo {
        dtype: "F32".to_string(),
        shape: vec![10, 20],
        data_offsets: [0, 800],
    };
    assert_eq!(info.parse_dtype().unwrap(), DType::F32);
    assert_eq!(info.byte_size(), 800);
    assert_eq!(info.elem_count(), 200);
}

#[test]
fn test_tensor_info_dtypes() {
    let dtypes = vec![
        ("F16", DType::F16),
        ("F32", DType::F32),
        ("BF16", DType::BF16),
        ("U32", DType::U32),
        ("U8", DType::U8),
    ];

    for (name, expected) in dtypes {
        let info = TensorInfo {
            dtype: name.to_string(),
            shape: vec![1],
            data_offsets: [0, 4],
        };
        assert_eq!(info.parse_dtype().unwrap(), expected);
    }
}

#[test]
fn test_tensor_info_unsupported_dtype() {
    let info = TensorInfo {
        dtype: "I32".to_string(),
        shape: vec![1],
        data_offsets: [0, 4],
    };
    assert!(info.parse_dtype().is_err());
}

#[test]
fn test_header_too_small() {
    assert!(parse_header(&[0u8; 4]).is_err());
    let mut bytes = 1000u64.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"{}");
    assert!(parse_header(&bytes).is_err());
}

#[test]
fn test_parse_safetensors_file() {
    let header = serde_json::json!({
        "test_tensor": {
            "dtype": "F32",
            "shape": [2, 3],
            "data_offsets": [0, 24]
        },
        "__metadata__": {
            "format": "pt"
        }
    });

    let header_str = serde_json::to_string(&header).unwrap();
    let header_bytes = header_str.as_bytes();
    let header_size = header_bytes.len() as u64;

    let mut file_data = Vec::new();
    file_data.extend_from_slice(&header_size.to_le_bytes());
    file_data.extend_from_slice(header_bytes);
    file_data.extend_from_slice(&[0u8; 24]);

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("test.safetensors");
    let mut f = std::fs::File::create(&file_path).unwrap();
    f.write_all(&file_data).unwrap();
    drop(f);

    let sf = SafetensorsFile::open(&file_path).unwrap();

    assert!(sf.has_tensor("test_tensor"));
    assert_eq!(sf.header.tensors.len(), 1);
    assert_eq!(sf.header.metadata.get("format").unwrap(), "pt");
    assert_eq!(sf.num_params(), 6);
    assert_eq!(sf.file_size(), file_data.len());

    let info = &sf.header.tensors["test_tensor"];
    assert_eq!(info.dtype, "F32");
    assert_eq!(info.shape, vec![2, 3]);

    assert_eq!(sf.tensor_data("test_tensor").unwrap().len(), 24);
    assert!(sf.tensor_data("nonexistent").is_err());
    assert_eq!(sf.tensor_names(), vec!["test_tensor"]);
}

#[test]
fn test_saved_model_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.safetensors");
    let model = Mammut::new(tiny(), &Device::Cpu).unwrap();
    model.save_weights(&path).unwrap();

    let sf = SafetensorsFile::open(&path).unwrap();
    assert_eq!(sf.num_params(), model.num_params());

    let report = validate_checkpoint(&sf, &tiny());
    assert!(report.is_compatible(), "{report:?}");
    assert!(report.unexpected.is_empty());
}

#[test]
fn test_checkpoint_mismatch_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.safetensors");
    Mammut::new(tiny(), &Device::Cpu).unwrap().save_weights(&path).unwrap();
    let sf = SafetensorsFile::open(&path).unwrap();

    let mut other = tiny();
    other.text_cfg.vocab_size = 128;
    other.init_logit_bias = Some(-10.0);
    let report = validate_checkpoint(&sf, &other);
    assert!(!report.is_compatible());
    assert_eq!(report.missing, vec!["logit_bias".to_string()]);
    let mismatched: Vec<&str> = report.mismatched.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(mismatched, ["text.text_projection", "text.token_embedding.weight"]);
}

#[test]
fn test_load_incompatible_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.safetensors");
    Mammut::new(tiny(), &Device::Cpu).unwrap().save_weights(&path).unwrap();

    let mut other = tiny();
    other.text_cfg.vocab_size = 128;
    assert!(Mammut::from_checkpoint(other, &path, &Device::Cpu).is_err());
}
