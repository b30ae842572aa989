//! Profile results: one row per model, a text table and CSV output.

use std::fmt;
use std::path::Path;

use serde::{Serialize, Serializer};

use super::ProfilerKind;
use crate::error::Result;

/// Measurements for one model. Compute columns not produced by the active
/// profiler are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub model: String,
    pub image_size: usize,
    pub mparams: f64,
    pub image_mparams: f64,
    pub text_mparams: f64,
    pub gflops: Option<f64>,
    pub gmacs: Option<f64>,
    pub macts: Option<f64>,
}

impl ProfileRow {
    fn compute_key(&self, kind: ProfilerKind) -> f64 {
        match kind {
            ProfilerKind::Flops => self.gflops,
            ProfilerKind::Macs => self.gmacs,
        }
        .unwrap_or(0.0)
    }

    fn values(&self, kind: ProfilerKind) -> Vec<String> {
        let mut out = vec![
            self.model.clone(),
            self.image_size.to_string(),
            format_num(Some(self.mparams)),
            format_num(Some(self.image_mparams)),
            format_num(Some(self.text_mparams)),
        ];
        match kind {
            ProfilerKind::Flops => out.push(format_num(self.gflops)),
            ProfilerKind::Macs => {
                out.push(format_num(self.gmacs));
                out.push(format_num(self.macts));
            }
        }
        out
    }
}

fn format_num(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.2}")).unwrap_or_default()
}

fn two_decimals<S: Serializer>(v: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_num(Some(*v)))
}

fn two_decimals_opt<S: Serializer>(v: &Option<f64>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_num(*v))
}

/// CSV record for a FLOP profile.
#[derive(Serialize)]
struct FlopsRecord<'a> {
    model: &'a str,
    image_size: usize,
    #[serde(serialize_with = "two_decimals")]
    mparams: f64,
    #[serde(serialize_with = "two_decimals")]
    image_mparams: f64,
    #[serde(serialize_with = "two_decimals")]
    text_mparams: f64,
    #[serde(serialize_with = "two_decimals_opt")]
    gflops: Option<f64>,
}

/// CSV record for a MAC profile.
#[derive(Serialize)]
struct MacsRecord<'a> {
    model: &'a str,
    image_size: usize,
    #[serde(serialize_with = "two_decimals")]
    mparams: f64,
    #[serde(serialize_with = "two_decimals")]
    image_mparams: f64,
    #[serde(serialize_with = "two_decimals")]
    text_mparams: f64,
    #[serde(serialize_with = "two_decimals_opt")]
    gmacs: Option<f64>,
    #[serde(serialize_with = "two_decimals_opt")]
    macts: Option<f64>,
}

/// All rows of one profiling run plus the models that failed.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub profiler: ProfilerKind,
    pub rows: Vec<ProfileRow>,
    pub models_with_errors: Vec<String>,
}

impl ProfileReport {
    pub fn new(profiler: ProfilerKind) -> Self {
        ProfileReport {
            profiler,
            rows: Vec::new(),
            models_with_errors: Vec::new(),
        }
    }

    /// Column names in output order.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut cols = vec!["model", "image_size", "mparams", "image_mparams", "text_mparams"];
        match self.profiler {
            ProfilerKind::Flops => cols.push("gflops"),
            ProfilerKind::Macs => cols.extend(["gmacs", "macts"]),
        }
        cols
    }

    /// Ascending by compute, then parameters, then name.
    pub fn sort(&mut self) {
        let kind = self.profiler;
        self.rows.sort_by(|a, b| {
            a.compute_key(kind)
                .total_cmp(&b.compute_key(kind))
                .then_with(|| a.mparams.total_cmp(&b.mparams))
                .then_with(|| a.model.cmp(&b.model))
        });
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the rows as CSV with a header line.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        if self.rows.is_empty() {
            writer.write_record(self.columns())?;
        }
        for row in &self.rows {
            match self.profiler {
                ProfilerKind::Flops => writer.serialize(FlopsRecord {
                    model: &row.model,
                    image_size: row.image_size,
                    mparams: row.mparams,
                    image_mparams: row.image_mparams,
                    text_mparams: row.text_mparams,
                    gflops: row.gflops,
                })?,
                ProfilerKind::Macs => writer.serialize(MacsRecord {
                    model: &row.model,
                    image_size: row.image_size,
                    mparams: row.mparams,
                    image_mparams: row.image_mparams,
                    text_mparams: row.text_mparams,
                    gmacs: row.gmacs,
                    macts: row.macts,
                })?,
            }
        }
        writer.flush()?;
        tracing::info!(path = %path.as_ref().display(), rows = self.rows.len(), "wrote profile results");
        Ok(())
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = self.columns().iter().map(|c| c.to_string()).collect();
        let body: Vec<Vec<String>> = self.rows.iter().map(|r| r.values(self.profiler)).collect();

        let mut widths: Vec<usize> = header.iter().map(String::len).collect();
        for row in &body {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.len());
            }
        }

        let line = |f: &mut fmt::Formatter<'_>, cells: &[String]| -> fmt::Result {
            for (i, (cell, w)) in cells.iter().zip(&widths).enumerate() {
                if i == 0 {
                    write!(f, "{cell:<w$}")?;
                } else {
                    write!(f, "  {cell:>w$}")?;
                }
            }
            writeln!(f)
        };
        line(f, &header)?;
        for row in &body {
            line(f, row)?;
        }
        Ok(())
    }
}
