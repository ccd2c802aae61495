//! Reconstructed target: the fused set of reports believed to belong to one
//! aircraft.
//!
//! Pure logic over record numbers. Report contents are looked up in the
//! shared `ReportStore` passed into each call; a target never owns reports.
//!
//! Per target we keep a time index (for bracketing and interpolation), a
//! nested category -> data source -> time index, and aggregates over the
//! identity attributes (ACAD, callsign, Mode A, Mode C range).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, warn};

use crate::geo::LocalPlane;
use crate::store::ReportStore;
use crate::types::*;

type TimeIndex = BTreeSet<(TimeKey, RecNum)>;

// ---------------------------------------------------------------------------
// Bracket lookup
// ---------------------------------------------------------------------------

/// Result of a bracket lookup around a query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFor {
    /// A report sits exactly at the query time.
    Exact(RecNum),
    /// Reports before and after the query time, both within the window.
    Between { lower: RecNum, upper: RecNum },
    /// Only a later report within the window; nothing usable before.
    UpperOnly(RecNum),
}

impl DataFor {
    /// Lower and upper record numbers. `Exact` fills only the lower side.
    pub fn pair(&self) -> (Option<RecNum>, Option<RecNum>) {
        match *self {
            DataFor::Exact(rn) => (Some(rn), None),
            DataFor::Between { lower, upper } => (Some(lower), Some(upper)),
            DataFor::UpperOnly(rn) => (None, Some(rn)),
        }
    }

    /// True for an exact hit or a full two-sided bracket.
    pub fn is_usable(&self) -> bool {
        !matches!(self, DataFor::UpperOnly(_))
    }
}

/// Find the reports bracketing `t` within `d_max` seconds.
fn bracket_in(index: &TimeIndex, t: Timestamp, d_max: f64) -> Option<DataFor> {
    let start = (TimeKey(t), RecNum(0));

    // First entry not before t
    let &(upper_t, upper) = index.range(start..).next()?;
    if upper_t.0 == t {
        return Some(DataFor::Exact(upper));
    }
    if upper_t.0 - t > d_max {
        return None;
    }

    // Latest entry before t
    match index.range(..start).next_back() {
        Some(&(lower_t, lower)) if t - lower_t.0 <= d_max => {
            Some(DataFor::Between { lower, upper })
        }
        _ => Some(DataFor::UpperOnly(upper)),
    }
}

// ---------------------------------------------------------------------------
// Interpolation strategies
// ---------------------------------------------------------------------------

/// Position interpolation strategy between two bracketing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Constant velocity in a local tangent plane around the earlier point.
    Planar,
    /// Linear in latitude and longitude. Cheap; fine for short gaps.
    Fast,
}

impl Interpolation {
    /// Position at `t` given `p1` at `t1` and `p2` at `t2`, with `t1 < t2`.
    pub fn interpolate(
        self,
        p1: &Position,
        t1: Timestamp,
        p2: &Position,
        t2: Timestamp,
        t: Timestamp,
    ) -> Position {
        let frac = (t - t1) / (t2 - t1);
        match self {
            Interpolation::Fast => Position::new(
                p1.latitude + (p2.latitude - p1.latitude) * frac,
                p1.longitude + (p2.longitude - p1.longitude) * frac,
            ),
            Interpolation::Planar => {
                let plane = LocalPlane::new(*p1);
                let (x, y) = plane.project(p2);
                let v_x = x / (t2 - t1);
                let v_y = y / (t2 - t1);
                let d_t = t - t1;
                plane.unproject(v_x * d_t, v_y * d_t)
            }
        }
    }
}

/// Interpolated position; `exact` when taken directly from a report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedPos {
    pub position: Position,
    pub exact: bool,
}

// ---------------------------------------------------------------------------
// Attribute comparison
// ---------------------------------------------------------------------------

/// Tri-state comparison of one attribute against the bracketing reports.
///
/// `value` extracts `(value, reliable)` from a report. The candidate's own
/// reliability has already been checked by the caller.
fn compare_attribute<T: Copy>(
    candidate: Option<T>,
    brackets: &[&TargetReport],
    value: impl Fn(&TargetReport) -> Option<(T, bool)>,
    matches: impl Fn(T, T) -> bool,
) -> ComparisonResult {
    // Absence on both sides is not evidence of a mismatch
    if candidate.is_none() && brackets.iter().any(|tr| value(tr).is_none()) {
        return ComparisonResult::Same;
    }

    let usable: Vec<T> = brackets
        .iter()
        .filter_map(|tr| value(tr))
        .filter(|(_, reliable)| *reliable)
        .map(|(v, _)| v)
        .collect();

    if usable.is_empty() {
        return ComparisonResult::Unknown;
    }

    match candidate {
        None => ComparisonResult::Different,
        Some(c) if usable.iter().any(|&v| matches(c, v)) => ComparisonResult::Same,
        Some(_) => ComparisonResult::Different,
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Fused track of one aircraft.
#[derive(Debug, Clone, Default)]
pub struct ReconstructorTarget {
    pub utn: Option<Utn>,
    pub created_in_current_slice: bool,

    reports: Vec<RecNum>,
    tr_timestamps: TimeIndex,
    tr_ds_timestamps: BTreeMap<u8, BTreeMap<u32, TimeIndex>>,

    acads: BTreeSet<u32>,
    acad_counts: BTreeMap<u32, usize>,
    acad_conflicts: usize,
    acids: BTreeSet<String>,
    mode_as: BTreeSet<u16>,
    ds_ids: BTreeSet<u32>,
    category_counts: BTreeMap<u8, usize>,

    timestamp_min: Option<Timestamp>,
    timestamp_max: Option<Timestamp>,
    mode_c_min: Option<f32>,
    mode_c_max: Option<f32>,
}

impl ReconstructorTarget {
    pub fn new(utn: Option<Utn>, created_in_current_slice: bool) -> Self {
        ReconstructorTarget {
            utn,
            created_in_current_slice,
            ..Default::default()
        }
    }

    /// Add one report by record number.
    ///
    /// Panics if the record is not in the store.
    pub fn add_report(&mut self, store: &ReportStore, rec_num: RecNum) {
        let tr = store.report(rec_num);
        let key = (TimeKey(tr.timestamp), rec_num);

        if self.tr_timestamps.contains(&key) {
            debug!(rec = %rec_num, utn = ?self.utn, "report already associated");
            return;
        }

        self.reports.push(rec_num);

        self.timestamp_min = Some(self.timestamp_min.map_or(tr.timestamp, |t| t.min(tr.timestamp)));
        self.timestamp_max = Some(self.timestamp_max.map_or(tr.timestamp, |t| t.max(tr.timestamp)));

        if let Some(alt) = tr.barometric_altitude.filter(|a| a.has_reliable_value()) {
            let ft = alt.altitude_ft;
            self.mode_c_min = Some(self.mode_c_min.map_or(ft, |m| m.min(ft)));
            self.mode_c_max = Some(self.mode_c_max.map_or(ft, |m| m.max(ft)));
        }

        self.ds_ids.insert(tr.ds_id);
        *self.category_counts.entry(rec_num.category()).or_insert(0) += 1;

        self.tr_timestamps.insert(key);
        self.tr_ds_timestamps
            .entry(rec_num.category())
            .or_default()
            .entry(tr.ds_id)
            .or_default()
            .insert(key);

        if let Some(acad) = tr.acad {
            if !self.acads.is_empty() && !self.acads.contains(&acad) {
                self.acad_conflicts += 1;
                warn!(
                    utn = ?self.utn,
                    rec = %rec_num,
                    acad = %acad_to_string(acad),
                    existing = %self.acads_str(),
                    "target acad mismatch"
                );
            }
            self.acads.insert(acad);
            *self.acad_counts.entry(acad).or_insert(0) += 1;
        }

        if let Some(acid) = tr.trimmed_acid() {
            self.acids.insert(acid.to_string());
        }

        if let Some(m3a) = tr.mode_a {
            self.mode_as.insert(m3a.code);
        }
    }

    pub fn add_reports(&mut self, store: &ReportStore, rec_nums: &[RecNum]) {
        for &rn in rec_nums {
            self.add_report(store, rn);
        }
    }

    /// Take over all reports of `other`.
    pub fn absorb(&mut self, store: &ReportStore, other: &ReconstructorTarget) {
        self.add_reports(store, &other.reports);
    }

    // -- Membership ---------------------------------------------------------

    /// Record numbers in association order.
    pub fn rec_nums(&self) -> &[RecNum] {
        &self.reports
    }

    /// Record numbers in time order.
    pub fn rec_nums_by_time(&self) -> impl Iterator<Item = RecNum> + '_ {
        self.tr_timestamps.iter().map(|&(_, rn)| rn)
    }

    pub fn num_associated(&self) -> usize {
        self.reports.len()
    }

    /// Most recently associated record number.
    pub fn last_associated(&self) -> Option<RecNum> {
        self.reports.last().copied()
    }

    /// Latest report in time.
    pub fn latest_report(&self) -> Option<RecNum> {
        self.tr_timestamps.last().map(|&(_, rn)| rn)
    }

    pub fn contains(&self, store: &ReportStore, rec_num: RecNum) -> bool {
        store
            .get(rec_num)
            .is_some_and(|tr| self.tr_timestamps.contains(&(TimeKey(tr.timestamp), rec_num)))
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn ds_ids(&self) -> &BTreeSet<u32> {
        &self.ds_ids
    }

    /// Reports per source category.
    pub fn category_counts(&self) -> &BTreeMap<u8, usize> {
        &self.category_counts
    }

    pub fn category_count(&self, category: u8) -> usize {
        self.category_counts.get(&category).copied().unwrap_or(0)
    }

    // -- Identity -----------------------------------------------------------

    pub fn acads(&self) -> &BTreeSet<u32> {
        &self.acads
    }

    pub fn has_acad(&self) -> bool {
        !self.acads.is_empty()
    }

    pub fn has_acad_value(&self, acad: u32) -> bool {
        self.acads.contains(&acad)
    }

    pub fn has_all_of_acads(&self, acads: &BTreeSet<u32>) -> bool {
        acads.iter().all(|a| self.acads.contains(a))
    }

    pub fn has_any_of_acads(&self, acads: &BTreeSet<u32>) -> bool {
        acads.iter().any(|a| self.acads.contains(a))
    }

    /// Most frequent ACAD; ties go to the lowest value.
    pub fn canonical_acad(&self) -> Option<u32> {
        self.acad_counts
            .iter()
            .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then(b.cmp(a)))
            .map(|(&acad, _)| acad)
    }

    /// True once reports with more than one ACAD have been associated.
    pub fn acad_conflict(&self) -> bool {
        self.acads.len() > 1
    }

    /// Number of reports that arrived with an ACAD not yet held.
    pub fn acad_conflict_count(&self) -> usize {
        self.acad_conflicts
    }

    pub fn acads_str(&self) -> String {
        self.acads
            .iter()
            .map(|&a| acad_to_string(a))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn acids(&self) -> &BTreeSet<String> {
        &self.acids
    }

    pub fn has_acid(&self) -> bool {
        !self.acids.is_empty()
    }

    pub fn has_acid_value(&self, acid: &str) -> bool {
        self.acids.contains(acid.trim())
    }

    pub fn mode_as(&self) -> &BTreeSet<u16> {
        &self.mode_as
    }

    pub fn has_mode_a(&self) -> bool {
        !self.mode_as.is_empty()
    }

    pub fn has_mode_a_code(&self, code: u16) -> bool {
        self.mode_as.contains(&code)
    }

    pub fn has_mode_c(&self) -> bool {
        self.mode_c_min.is_some()
    }

    /// Reliable Mode C range seen so far, in feet.
    pub fn mode_c_range(&self) -> Option<(f32, f32)> {
        self.mode_c_min.zip(self.mode_c_max)
    }

    // -- Time ---------------------------------------------------------------

    pub fn timestamp_min(&self) -> Option<Timestamp> {
        self.timestamp_min
    }

    pub fn timestamp_max(&self) -> Option<Timestamp> {
        self.timestamp_max
    }

    pub fn is_time_inside(&self, t: Timestamp) -> bool {
        match (self.timestamp_min, self.timestamp_max) {
            (Some(min), Some(max)) => t >= min && t <= max,
            _ => false,
        }
    }

    /// Inside the time range widened by `d_max` on both ends.
    pub fn is_time_inside_within(&self, t: Timestamp, d_max: f64) -> bool {
        match (self.timestamp_min, self.timestamp_max) {
            (Some(min), Some(max)) => t >= min - d_max && t <= max + d_max,
            _ => false,
        }
    }

    /// Whether an exact report or a full bracket exists within `d_max`.
    pub fn has_data_for_time(&self, t: Timestamp, d_max: f64) -> bool {
        self.is_time_inside(t)
            && bracket_in(&self.tr_timestamps, t, d_max).is_some_and(|d| d.is_usable())
    }

    /// Reports bracketing `t` within `d_max`. Callers must handle the
    /// one-sided `UpperOnly` result.
    pub fn data_for(&self, t: Timestamp, d_max: f64) -> Option<DataFor> {
        bracket_in(&self.tr_timestamps, t, d_max)
    }

    /// Bracket lookup restricted to one category and data source.
    pub fn data_for_source(
        &self,
        category: u8,
        ds_id: u32,
        t: Timestamp,
        d_max: f64,
    ) -> Option<DataFor> {
        let index = self.tr_ds_timestamps.get(&category)?.get(&ds_id)?;
        bracket_in(index, t, d_max)
    }

    /// Position at `t` using the given strategy.
    ///
    /// Returns `None` without a usable bracket, when either bracket lacks a
    /// position, or when both brackets share a timestamp. Altitude is not
    /// interpolated.
    pub fn interpolated_pos_for_time(
        &self,
        store: &ReportStore,
        t: Timestamp,
        d_max: f64,
        method: Interpolation,
    ) -> Option<InterpolatedPos> {
        let (lower, upper) = match self.data_for(t, d_max)? {
            DataFor::Exact(rn) => {
                return store.report(rn).position.map(|position| InterpolatedPos {
                    position,
                    exact: true,
                });
            }
            DataFor::Between { lower, upper } => (store.report(lower), store.report(upper)),
            DataFor::UpperOnly(_) => return None,
        };

        let pos1 = lower.position?;
        let pos2 = upper.position?;

        if pos1 == pos2 {
            return Some(InterpolatedPos {
                position: pos1,
                exact: false,
            });
        }

        if lower.timestamp == upper.timestamp {
            warn!(utn = ?self.utn, t = lower.timestamp, "target has two reports at the same time");
            return None;
        }

        let position = method.interpolate(&pos1, lower.timestamp, &pos2, upper.timestamp, t);
        Some(InterpolatedPos {
            position,
            exact: false,
        })
    }

    pub fn duration(&self) -> f64 {
        match (self.timestamp_min, self.timestamp_max) {
            (Some(min), Some(max)) => max - min,
            _ => 0.0,
        }
    }

    /// Classic interval overlap test.
    pub fn time_overlaps(&self, other: &ReconstructorTarget) -> bool {
        match (
            self.timestamp_min,
            self.timestamp_max,
            other.timestamp_min,
            other.timestamp_max,
        ) {
            (Some(min_a), Some(max_a), Some(min_b), Some(max_b)) => min_a < max_b && min_b < max_a,
            _ => false,
        }
    }

    /// Overlapping duration as a fraction of the shorter target's duration.
    pub fn prob_time_overlaps(&self, other: &ReconstructorTarget) -> f64 {
        let (Some(min_a), Some(max_a), Some(min_b), Some(max_b)) = (
            self.timestamp_min,
            self.timestamp_max,
            other.timestamp_min,
            other.timestamp_max,
        ) else {
            return 0.0;
        };

        let begin = min_a.max(min_b);
        let end = max_a.min(max_b);
        if begin >= end {
            return 0.0;
        }

        let shorter = self.duration().min(other.duration());
        if shorter <= 0.0 {
            return 0.0;
        }

        ((end - begin) / shorter).clamp(0.0, 1.0)
    }

    // -- Attribute comparisons ----------------------------------------------

    /// Reports usable for attribute comparison at `t`: one on an exact hit,
    /// otherwise the two bracket reports.
    fn comparison_brackets<'s>(
        &self,
        store: &'s ReportStore,
        t: Timestamp,
        d_max: f64,
    ) -> Option<Vec<&'s TargetReport>> {
        if !self.has_data_for_time(t, d_max) {
            return None;
        }
        let (lower, upper) = self.data_for(t, d_max)?.pair();
        Some(
            lower
                .into_iter()
                .chain(upper)
                .map(|rn| store.report(rn))
                .collect(),
        )
    }

    /// Compare a report's Mode A code against this target around its time.
    pub fn compare_mode_a_code(
        &self,
        store: &ReportStore,
        tr: &TargetReport,
        d_max: f64,
    ) -> ComparisonResult {
        if tr.mode_a.is_some_and(|m| !m.has_reliable_value()) {
            return ComparisonResult::Unknown;
        }
        let Some(brackets) = self.comparison_brackets(store, tr.timestamp, d_max) else {
            return ComparisonResult::Unknown;
        };
        compare_attribute(
            tr.mode_a.map(|m| m.code),
            &brackets,
            |r| r.mode_a.map(|m| (m.code, m.reliable)),
            |a, b| a == b,
        )
    }

    /// Compare a report's barometric altitude against this target.
    pub fn compare_mode_c_code(
        &self,
        store: &ReportStore,
        tr: &TargetReport,
        d_max: f64,
        max_alt_diff: f32,
    ) -> ComparisonResult {
        if tr.barometric_altitude.is_some_and(|a| !a.has_reliable_value()) {
            return ComparisonResult::Unknown;
        }
        let Some(brackets) = self.comparison_brackets(store, tr.timestamp, d_max) else {
            return ComparisonResult::Unknown;
        };
        compare_attribute(
            tr.barometric_altitude.map(|a| a.altitude_ft),
            &brackets,
            |r| r.barometric_altitude.map(|a| (a.altitude_ft, a.reliable)),
            |a, b| (a - b).abs() < max_alt_diff,
        )
    }

    /// Mode A comparison for each record number, partitioned by outcome.
    pub fn compare_mode_a_codes(
        &self,
        store: &ReportStore,
        rec_nums: &[RecNum],
        d_max: f64,
    ) -> ComparisonPartition {
        let mut partition = ComparisonPartition::default();
        for &rn in rec_nums {
            partition.push(rn, self.compare_mode_a_code(store, store.report(rn), d_max));
        }
        partition
    }

    /// Mode C comparison for each record number, partitioned by outcome.
    pub fn compare_mode_c_codes(
        &self,
        store: &ReportStore,
        rec_nums: &[RecNum],
        d_max: f64,
        max_alt_diff: f32,
    ) -> ComparisonPartition {
        let mut partition = ComparisonPartition::default();
        for &rn in rec_nums {
            partition.push(
                rn,
                self.compare_mode_c_code(store, store.report(rn), d_max, max_alt_diff),
            );
        }
        partition
    }
}

impl fmt::Display for ReconstructorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.utn {
            Some(utn) => write!(f, "utn {utn}")?,
            None => write!(f, "utn -")?,
        }
        write!(f, " reports {}", self.reports.len())?;
        if !self.acads.is_empty() {
            write!(f, " acads {}", self.acads_str())?;
        }
        if !self.acids.is_empty() {
            let acids: Vec<&str> = self.acids.iter().map(String::as_str).collect();
            write!(f, " acids '{}'", acids.join("','"))?;
        }
        if !self.mode_as.is_empty() {
            let m3as: Vec<String> = self.mode_as.iter().map(|&c| mode_a_to_string(c)).collect();
            write!(f, " m3as {}", m3as.join(","))?;
        }
        if let (Some(min), Some(max)) = (self.timestamp_min, self.timestamp_max) {
            write!(f, " t {min:.3}-{max:.3}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
