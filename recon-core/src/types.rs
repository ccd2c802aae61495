//! Shared types, error enum, and report definitions for recon-core.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by recon-core.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("unknown record number {0}")]
    UnknownRecord(RecNum),
    #[error("duplicate record number {0}")]
    DuplicateRecord(RecNum),
    #[error("invalid report: {0}")]
    InvalidReport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;

/// Seconds since an arbitrary session epoch.
pub type Timestamp = f64;

/// Unique target number.
pub type Utn = u32;

// ---------------------------------------------------------------------------
// Record numbers
// ---------------------------------------------------------------------------

const CATEGORY_SHIFT: u32 = 56;
const SEQUENCE_MASK: u64 = (1u64 << CATEGORY_SHIFT) - 1;

/// Global report key: source category id in the top 8 bits, a per-category
/// sequence number in the remaining 56.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecNum(pub u64);

impl RecNum {
    pub fn new(category: u8, sequence: u64) -> Self {
        debug_assert!(sequence <= SEQUENCE_MASK, "sequence overflow");
        RecNum(((category as u64) << CATEGORY_SHIFT) | (sequence & SEQUENCE_MASK))
    }

    /// Source category id embedded in the record number.
    pub fn category(&self) -> u8 {
        (self.0 >> CATEGORY_SHIFT) as u8
    }

    pub fn sequence(&self) -> u64 {
        self.0 & SEQUENCE_MASK
    }
}

impl fmt::Display for RecNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category(), self.sequence())
    }
}

// ---------------------------------------------------------------------------
// Time keys
// ---------------------------------------------------------------------------

/// Totally ordered wrapper so timestamps can key ordered indices.
#[derive(Debug, Clone, Copy)]
pub struct TimeKey(pub Timestamp);

impl PartialEq for TimeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimeKey {}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---------------------------------------------------------------------------
// ACAD / Mode A helpers
// ---------------------------------------------------------------------------

/// Format a 24-bit aircraft address as 6-char uppercase hex.
pub fn acad_to_string(acad: u32) -> String {
    format!("{:06X}", acad & 0xFF_FFFF)
}

/// Parse a 6-char hex string into a 24-bit aircraft address.
pub fn acad_from_hex(hex: &str) -> Option<u32> {
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Mode A codes are conventionally shown as 4 octal digits.
pub fn mode_a_to_string(code: u16) -> String {
    format!("{:04o}", code)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// WGS-84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Position {
            latitude,
            longitude,
        }
    }
}

/// Barometric altitude (Mode C) reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaroAltitude {
    pub altitude_ft: f32,
    #[serde(default = "default_true")]
    pub reliable: bool,
}

/// Mode A (3/A) identity code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeACode {
    pub code: u16,
    #[serde(default = "default_true")]
    pub reliable: bool,
}

fn default_true() -> bool {
    true
}

impl BaroAltitude {
    pub fn has_reliable_value(&self) -> bool {
        self.reliable
    }
}

impl ModeACode {
    pub fn has_reliable_value(&self) -> bool {
        self.reliable
    }
}

/// One sensor observation. Immutable once inserted into the report store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub timestamp: Timestamp,
    /// Source category id (e.g. 255 reference, 62 tracker, 21 ADS-B).
    pub category: u8,
    pub ds_id: u32,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub barometric_altitude: Option<BaroAltitude>,
    #[serde(default)]
    pub mode_a: Option<ModeACode>,
    #[serde(default)]
    pub acad: Option<u32>,
    #[serde(default)]
    pub acid: Option<String>,
    #[serde(default)]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub track_end: Option<bool>,
}

impl TargetReport {
    pub fn new(category: u8, ds_id: u32, timestamp: Timestamp) -> Self {
        TargetReport {
            timestamp,
            category,
            ds_id,
            position: None,
            barometric_altitude: None,
            mode_a: None,
            acad: None,
            acid: None,
            track_number: None,
            track_end: None,
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.position = Some(Position::new(latitude, longitude));
        self
    }

    pub fn with_mode_a(mut self, code: u16, reliable: bool) -> Self {
        self.mode_a = Some(ModeACode { code, reliable });
        self
    }

    pub fn with_mode_c(mut self, altitude_ft: f32, reliable: bool) -> Self {
        self.barometric_altitude = Some(BaroAltitude {
            altitude_ft,
            reliable,
        });
        self
    }

    pub fn with_acad(mut self, acad: u32) -> Self {
        self.acad = Some(acad);
        self
    }

    pub fn with_acid(mut self, acid: &str) -> Self {
        self.acid = Some(acid.to_string());
        self
    }

    pub fn with_track(mut self, track_number: u32, track_end: bool) -> Self {
        self.track_number = Some(track_number);
        self.track_end = Some(track_end);
        self
    }

    /// Trimmed, non-empty callsign.
    pub fn trimmed_acid(&self) -> Option<&str> {
        self.acid
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn has_reliable_mode_a(&self) -> bool {
        self.mode_a.is_some_and(|m| m.has_reliable_value())
    }

    pub fn has_reliable_mode_c(&self) -> bool {
        self.barometric_altitude
            .is_some_and(|a| a.has_reliable_value())
    }

    /// Basic sanity checks applied on insertion.
    pub fn validate(&self) -> Result<()> {
        if !self.timestamp.is_finite() {
            return Err(ReconError::InvalidReport(format!(
                "non-finite timestamp {}",
                self.timestamp
            )));
        }
        if let Some(pos) = &self.position {
            if !(-90.0..=90.0).contains(&pos.latitude) || !(-180.0..=180.0).contains(&pos.longitude)
            {
                return Err(ReconError::InvalidReport(format!(
                    "position out of range ({}, {})",
                    pos.latitude, pos.longitude
                )));
            }
        }
        if let Some(acad) = self.acad {
            if acad > 0xFF_FFFF {
                return Err(ReconError::InvalidReport(format!(
                    "aircraft address {acad:#x} exceeds 24 bits"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cat {} ds {} t {:.3}", self.category, self.ds_id, self.timestamp)?;
        if let Some(acad) = self.acad {
            write!(f, " acad {}", acad_to_string(acad))?;
        }
        if let Some(acid) = self.trimmed_acid() {
            write!(f, " acid '{acid}'")?;
        }
        if let Some(m3a) = &self.mode_a {
            write!(f, " m3a {}", mode_a_to_string(m3a.code))?;
        }
        if let Some(alt) = &self.barometric_altitude {
            write!(f, " mc {}", alt.altitude_ft)?;
        }
        if let Some(tn) = self.track_number {
            write!(f, " tn {tn}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Comparison results
// ---------------------------------------------------------------------------

/// Tri-state attribute comparison. `Unknown` means no evidence either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonResult {
    Unknown,
    Same,
    Different,
}

/// Record numbers split by comparison outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonPartition {
    pub unknown: Vec<RecNum>,
    pub same: Vec<RecNum>,
    pub different: Vec<RecNum>,
}

impl ComparisonPartition {
    pub fn push(&mut self, rec_num: RecNum, result: ComparisonResult) {
        match result {
            ComparisonResult::Unknown => self.unknown.push(rec_num),
            ComparisonResult::Same => self.same.push(rec_num),
            ComparisonResult::Different => self.different.push(rec_num),
        }
    }

    pub fn len(&self) -> usize {
        self.unknown.len() + self.same.len() + self.different.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
