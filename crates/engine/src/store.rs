//! Position-indexed persistence.
//!
//! One store file per scan, JSON records one per line: a manifest record
//! first (the acquisition parameters in effect), then one record per
//! scan point in sequence order. Points that fail beyond their retry
//! budget append a failure record instead of vanishing silently.
//!
//! The append path is the crash-safety boundary: each record is written
//! as one complete line, flushed, and fsynced before `append` returns.
//! A crash mid-scan can at worst truncate the final line, so the reader
//! ignores a torn trailing line and everything appended before it stays
//! readable.

use chrono::{DateTime, Utc};
use common::plan::{AbortPolicy, Axis, ScanPlan};
use common::waveform::AveragedWaveform;
use common::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Acquisition parameters recorded at the head of every store file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanManifest {
    pub started_at: DateTime<Utc>,
    pub primary_axis: Axis,
    pub secondary_axis: Axis,
    pub primary_step_mm: f64,
    pub secondary_step_mm: f64,
    pub rows: u32,
    pub cols: u32,
    /// Accumulation target per point.
    pub averages: u32,
    pub settle_s: f64,
    /// Effective sample count per waveform.
    pub samples: u32,
    /// Effective sample interval after timebase quantization, in ns.
    pub sample_interval_ns: f64,
    /// Effective full-scale vertical range, in mV.
    pub vertical_range_mv: f64,
    pub abort_policy: AbortPolicy,
}

impl ScanManifest {
    /// Build a manifest from the plan plus the effective capture shape.
    pub fn new(
        plan: &ScanPlan,
        samples: u32,
        sample_interval_ns: f64,
        vertical_range_mv: f64,
    ) -> Self {
        Self {
            started_at: Utc::now(),
            primary_axis: plan.primary_axis,
            secondary_axis: plan.secondary_axis,
            primary_step_mm: plan.primary_step_mm,
            secondary_step_mm: plan.secondary_step_mm,
            rows: plan.rows(),
            cols: plan.cols(),
            averages: plan.averages,
            settle_s: plan.settle.as_secs_f64(),
            samples,
            sample_interval_ns,
            vertical_range_mv,
            abort_policy: plan.abort_policy,
        }
    }
}

/// One persisted scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub sequence: u64,
    pub row: u32,
    pub col: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_channel: Option<u8>,
    pub sample_count: u32,
    pub sample_interval_ns: f64,
    pub vertical_range_mv: f64,
    /// The averaged samples, in mV.
    pub samples: Vec<f64>,
    /// Captures accumulated into the mean.
    pub averaged: u32,
    pub acquired_at: DateTime<Utc>,
}

impl PointRecord {
    pub fn new(
        sequence: u64,
        row: u32,
        col: u32,
        mux_channel: Option<u8>,
        averaged: &AveragedWaveform,
    ) -> Self {
        Self {
            sequence,
            row,
            col,
            mux_channel,
            sample_count: averaged.waveform.samples.len() as u32,
            sample_interval_ns: averaged.waveform.sample_interval_ns,
            vertical_range_mv: averaged.waveform.vertical_range_mv,
            samples: averaged.waveform.samples.clone(),
            averaged: averaged.count,
            acquired_at: Utc::now(),
        }
    }
}

/// A point that failed beyond its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub sequence: u64,
    pub row: u32,
    pub col: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_channel: Option<u8>,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// One line of the store file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRecord {
    Manifest(ScanManifest),
    Point(PointRecord),
    PointFailure(FailureRecord),
}

/// Append-only store writer for one scan.
pub struct ScanStore {
    file: File,
    path: PathBuf,
    appended: u64,
}

impl ScanStore {
    /// Create a new store file and write its manifest record.
    ///
    /// Refuses to overwrite an existing file; every scan gets a fresh
    /// store.
    pub fn create(path: impl AsRef<Path>, manifest: &ScanManifest) -> ScanResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let mut store = Self {
            file,
            path,
            appended: 0,
        };
        store.append_record(&StoreRecord::Manifest(manifest.clone()))?;
        Ok(store)
    }

    /// Append one completed point. Atomic: the record is fully on disk
    /// when this returns.
    pub fn append_point(&mut self, record: PointRecord) -> ScanResult<()> {
        self.append_record(&StoreRecord::Point(record))
    }

    /// Record a point that failed beyond its retry budget.
    pub fn append_failure(&mut self, record: FailureRecord) -> ScanResult<()> {
        self.append_record(&StoreRecord::PointFailure(record))
    }

    fn append_record(&mut self, record: &StoreRecord) -> ScanResult<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| ScanError::Io(std::io::Error::other(format!("encode record: {e}"))))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        // The fsync is what makes a mid-scan crash leave every completed
        // record readable.
        self.file.sync_data()?;
        self.appended += 1;
        Ok(())
    }

    /// Records appended so far, the manifest included.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A store file read back: its manifest and every following record.
#[derive(Debug)]
pub struct StoreContents {
    pub manifest: ScanManifest,
    pub records: Vec<StoreRecord>,
}

impl StoreContents {
    /// The persisted points, in append order.
    pub fn points(&self) -> impl Iterator<Item = &PointRecord> {
        self.records.iter().filter_map(|r| match r {
            StoreRecord::Point(p) => Some(p),
            _ => None,
        })
    }

    /// The recorded per-point failures, in append order.
    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter().filter_map(|r| match r {
            StoreRecord::PointFailure(f) => Some(f),
            _ => None,
        })
    }
}

/// Read a store file back, tolerating a torn trailing line.
///
/// A parse failure anywhere except the final line is corruption and is
/// reported as an error; a torn final line is the expected signature of a
/// crash mid-append and is dropped.
pub fn read_store(path: impl AsRef<Path>) -> ScanResult<StoreContents> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line?);
    }

    let mut records = Vec::new();
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoreRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if i == last => {
                tracing::warn!(error = %e, "dropping torn trailing record");
            }
            Err(e) => {
                return Err(ScanError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("corrupt store record on line {}: {e}", i + 1),
                )));
            }
        }
    }

    let mut iter = records.into_iter();
    match iter.next() {
        Some(StoreRecord::Manifest(manifest)) => Ok(StoreContents {
            manifest,
            records: iter.collect(),
        }),
        _ => Err(ScanError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "store does not begin with a manifest record",
        ))),
    }
}
