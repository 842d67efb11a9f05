//! Train and eval rows emitted by the training loop, plus sinks that consume them.
//!
//! Rows are written as JSONL by [`MetricsRecorder`] and kept in memory by
//! [`MetricsHistory`]. Every row can be flattened to a `name -> f64` map for
//! plotting or comparing runs.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Perplexity is reported as `PPLX_BASE^loss` with this truncated base.
pub const PPLX_BASE: f64 = 2.71828;

pub fn calc_pplx(loss: f64) -> f64 {
    PPLX_BASE.powf(loss)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStats {
    pub step: u32,
    pub train_loss: f64,
    pub train_acc: f64,
    pub train_pplx: f64,
    /// Global L2 gradient norm at the most recent resample, if one has happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    pub accumulation_estimate: f64,
    pub accumulation_depth: usize,
    pub lr: f64,
    /// Decay-bucket weight decay used by this step's update.
    pub weight_decay: f64,
    pub tokens_seen: u64,
    pub epoch: f64,
    pub batch_size: usize,
    pub sequence_length: usize,
    pub t_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    pub step: u32,
    pub val_loss: f64,
    pub val_acc: f64,
    pub val_pplx: f64,
    pub tokens_seen: u64,
    pub epoch: f64,
    pub batch_size: usize,
    pub sequence_length: usize,
    pub t_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricsRecord {
    Train(TrainStats),
    Eval(EvalStats),
}

impl MetricsRecord {
    pub fn step(&self) -> u32 {
        match self {
            MetricsRecord::Train(stats) => stats.step,
            MetricsRecord::Eval(stats) => stats.step,
        }
    }

    /// Every numeric field keyed by its name. Missing optional fields are left out.
    pub fn to_flat(&self) -> BTreeMap<String, f64> {
        let value = match self {
            MetricsRecord::Train(stats) => serde_json::to_value(stats),
            MetricsRecord::Eval(stats) => serde_json::to_value(stats),
        };
        let Ok(serde_json::Value::Object(fields)) = value else {
            return BTreeMap::new();
        };
        fields
            .into_iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
            .collect()
    }
}

impl From<TrainStats> for MetricsRecord {
    fn from(stats: TrainStats) -> Self {
        MetricsRecord::Train(stats)
    }
}

impl From<EvalStats> for MetricsRecord {
    fn from(stats: EvalStats) -> Self {
        MetricsRecord::Eval(stats)
    }
}

pub trait MetricsSink {
    fn record(&mut self, record: &MetricsRecord) -> anyhow::Result<()>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn record(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        (**self).record(record)
    }
}

/// Discards every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&mut self, _record: &MetricsRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub train: Vec<TrainStats>,
    pub eval: Vec<EvalStats>,
}

impl MetricsHistory {
    pub fn last_train(&self) -> Option<&TrainStats> {
        self.train.last()
    }

    pub fn last_eval(&self) -> Option<&EvalStats> {
        self.eval.last()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.eval.is_empty()
    }
}

impl MetricsSink for MetricsHistory {
    fn record(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        match record {
            MetricsRecord::Train(stats) => self.train.push(stats.clone()),
            MetricsRecord::Eval(stats) => self.eval.push(stats.clone()),
        }
        Ok(())
    }
}

/// Recorder that appends rows to a JSONL file
pub struct MetricsRecorder {
    output_path: PathBuf,
    writer: BufWriter<File>,
    records_written: u32,
}

impl MetricsRecorder {
    pub fn new(output_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let output_path = output_path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)
            .with_context(|| format!("opening metrics file {}", output_path.display()))?;
        Ok(Self {
            output_path,
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    /// Writes an arbitrary serializable header line, e.g. the run configuration.
    pub fn write_header<T: Serialize>(&mut self, header: &T) -> anyhow::Result<()> {
        let json = serde_json::to_string(header)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn records_written(&self) -> u32 {
        self.records_written
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl MetricsSink for MetricsRecorder {
    fn record(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        self.records_written += 1;
        Ok(())
    }
}

impl Drop for MetricsRecorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Load train and eval rows from a JSONL file, skipping lines that are not rows
/// (such as a configuration header).
pub fn load_metrics(path: impl AsRef<Path>) -> anyhow::Result<Vec<MetricsRecord>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("opening metrics file {}", path.display()))?;
    let mut records = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<MetricsRecord>(&line) {
            records.push(record);
        }
    }

    Ok(records)
}
