//! Checkpoint inspection and validation.
//!
//! - [`safetensors`]: header parsing over a memory map.
//! - [`expected_tensors`]: the parameter table a config produces, without
//!   allocating the model.
//! - [`validate_checkpoint`]: compare a checkpoint against that table.

pub mod mmap;
pub mod safetensors;

use std::collections::BTreeMap;

use crate::model::config::MammutConfig;

pub use self::safetensors::{SafetensorsFile, TensorInfo};

/// Parameter name to shape.
pub type TensorTable = BTreeMap<String, Vec<usize>>;

fn insert_norm(table: &mut TensorTable, prefix: &str, width: usize) {
    table.insert(format!("{prefix}.weight"), vec![width]);
    table.insert(format!("{prefix}.bias"), vec![width]);
}

fn insert_linear(table: &mut TensorTable, prefix: &str, inp: usize, out: usize) {
    table.insert(format!("{prefix}.weight"), vec![out, inp]);
    table.insert(format!("{prefix}.bias"), vec![out]);
}

fn insert_attention(table: &mut TensorTable, prefix: &str, width: usize) {
    table.insert(format!("{prefix}.in_proj_weight"), vec![3 * width, width]);
    table.insert(format!("{prefix}.in_proj_bias"), vec![3 * width]);
    insert_linear(table, &format!("{prefix}.out_proj"), width, width);
}

fn insert_mlp_branch(table: &mut TensorTable, prefix: &str, width: usize, hidden: usize, ls: bool) {
    insert_norm(table, &format!("{prefix}.ln_2"), width);
    insert_linear(table, &format!("{prefix}.mlp.c_fc"), width, hidden);
    insert_linear(table, &format!("{prefix}.mlp.c_proj"), hidden, width);
    if ls {
        table.insert(format!("{prefix}.ls_2.gamma"), vec![width]);
    }
}

/// Every parameter a model built from `config` holds, with its shape.
pub fn expected_tensors(config: &MammutConfig) -> TensorTable {
    let mut t = TensorTable::new();

    let v = &config.vision_cfg;
    let vw = v.width;
    let vls = v.ls_init_value.is_some();
    t.insert("visual.conv1.weight".into(), vec![vw, 3, v.patch_size, v.patch_size]);
    t.insert("visual.class_embedding".into(), vec![vw]);
    t.insert("visual.positional_embedding".into(), vec![v.num_patches() + 1, vw]);
    insert_norm(&mut t, "visual.ln_pre", vw);
    for i in 0..v.layers {
        let p = format!("visual.transformer.resblocks.{i}");
        insert_norm(&mut t, &format!("{p}.ln_1"), vw);
        insert_attention(&mut t, &format!("{p}.attn"), vw);
        if vls {
            t.insert(format!("{p}.ls_1.gamma"), vec![vw]);
        }
        insert_mlp_branch(&mut t, &p, vw, v.mlp_width(), vls);
    }
    insert_norm(&mut t, "visual.ln_post", vw);
    t.insert("visual.proj".into(), vec![vw, config.embed_dim]);

    let x = &config.text_cfg;
    let tw = x.width;
    let tls = x.ls_init_value.is_some();
    t.insert("text.token_embedding.weight".into(), vec![x.vocab_size, tw]);
    t.insert("text.positional_embedding".into(), vec![x.context_length, tw]);
    for i in 0..x.layers {
        let p = format!("text.resblocks.{i}");
        insert_norm(&mut t, &format!("{p}.ln_1"), tw);
        insert_attention(&mut t, &format!("{p}.attn"), tw);
        if tls {
            t.insert(format!("{p}.ls_1.gamma"), vec![tw]);
        }
        if x.has_mlp {
            insert_mlp_branch(&mut t, &p, tw, x.mlp_width(), tls);
        }
    }
    for j in 0..x.cross_attn_layers() {
        let p = format!("text.cross_attn.{j}");
        insert_norm(&mut t, &format!("{p}.ln_1"), tw);
        insert_norm(&mut t, &format!("{p}.ln_1_kv"), tw);
        insert_attention(&mut t, &format!("{p}.attn"), tw);
        if tls {
            t.insert(format!("{p}.ls_1.gamma"), vec![tw]);
        }
        if x.has_mlp {
            insert_mlp_branch(&mut t, &p, tw, x.mlp_width(), tls);
        }
    }
    insert_norm(&mut t, "text.ln_final", tw);
    t.insert("text.text_projection".into(), vec![tw, x.vocab_size]);

    t.insert("map_viz2txt_kv".into(), vec![vw, tw]);
    t.insert("logit_scale".into(), config.logit_shape());
    if config.init_logit_bias.is_some() {
        t.insert("logit_bias".into(), config.logit_shape());
    }
    t
}

/// Outcome of comparing a checkpoint with a model config.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CheckpointReport {
    /// Expected by the model, absent from the checkpoint.
    pub missing: Vec<String>,
    /// Present in the checkpoint, unknown to the model.
    pub unexpected: Vec<String>,
    /// `(name, expected, found)` shape disagreements.
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl CheckpointReport {
    pub fn is_compatible(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Compare the tensors of `file` with what `config` builds.
pub fn validate_checkpoint(file: &SafetensorsFile, config: &MammutConfig) -> CheckpointReport {
    let expected = expected_tensors(config);
    let mut report = CheckpointReport::default();

    for (name, shape) in &expected {
        match file.header.tensors.get(name) {
            None => report.missing.push(name.clone()),
            Some(info) if &info.shape != shape => {
                report
                    .mismatched
                    .push((name.clone(), shape.clone(), info.shape.clone()))
            }
            Some(_) => {}
        }
    }
    report.unexpected = file
        .tensor_names()
        .into_iter()
        .filter(|name| !expected.contains_key(*name))
        .map(str::to_string)
        .collect();
    report
}
