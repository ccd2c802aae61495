//! Append-only report table shared read-only by targets and the associator.
//!
//! Reports are owned here and referenced everywhere else by `RecNum`.

use std::collections::{BTreeMap, HashMap};

use crate::types::*;

/// Process-wide map of record number to report.
#[derive(Debug, Default, Clone)]
pub struct ReportStore {
    reports: HashMap<RecNum, TargetReport>,
    next_sequence: BTreeMap<u8, u64>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a report, assigning the next sequence number of its category.
    pub fn insert(&mut self, report: TargetReport) -> Result<RecNum> {
        report.validate()?;
        let seq = self.next_sequence.entry(report.category).or_insert(0);
        let rec_num = RecNum::new(report.category, *seq);
        *seq += 1;
        self.reports.insert(rec_num, report);
        Ok(rec_num)
    }

    /// Insert a report under an externally assigned record number.
    pub fn insert_with(&mut self, rec_num: RecNum, report: TargetReport) -> Result<()> {
        report.validate()?;
        if rec_num.category() != report.category {
            return Err(ReconError::InvalidReport(format!(
                "record {rec_num} encodes category {} but report has {}",
                rec_num.category(),
                report.category
            )));
        }
        if self.reports.contains_key(&rec_num) {
            return Err(ReconError::DuplicateRecord(rec_num));
        }
        let seq = self.next_sequence.entry(report.category).or_insert(0);
        *seq = (*seq).max(rec_num.sequence() + 1);
        self.reports.insert(rec_num, report);
        Ok(())
    }

    pub fn get(&self, rec_num: RecNum) -> Option<&TargetReport> {
        self.reports.get(&rec_num)
    }

    /// Report lookup for record numbers the engine already holds.
    ///
    /// Panics if the record is missing: every record number handed to a
    /// target or the associator must exist in the store.
    pub fn report(&self, rec_num: RecNum) -> &TargetReport {
        match self.reports.get(&rec_num) {
            Some(tr) => tr,
            None => panic!("record number {rec_num} missing from report store"),
        }
    }

    pub fn contains(&self, rec_num: RecNum) -> bool {
        self.reports.contains_key(&rec_num)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// All record numbers, ordered by (timestamp, record number).
    pub fn time_ordered(&self) -> Vec<RecNum> {
        let mut rec_nums: Vec<RecNum> = self.reports.keys().copied().collect();
        self.sort_by_time(&mut rec_nums);
        rec_nums
    }

    /// Sort record numbers by (timestamp, record number).
    pub fn sort_by_time(&self, rec_nums: &mut [RecNum]) {
        rec_nums.sort_by(|a, b| {
            TimeKey(self.report(*a).timestamp)
                .cmp(&TimeKey(self.report(*b).timestamp))
                .then(a.cmp(b))
        });
    }

    /// Group record numbers as category -> data source -> time-ordered list.
    pub fn group_by_source(&self, rec_nums: &[RecNum]) -> BTreeMap<u8, BTreeMap<u32, Vec<RecNum>>> {
        let mut grouped: BTreeMap<u8, BTreeMap<u32, Vec<RecNum>>> = BTreeMap::new();
        for &rn in rec_nums {
            let tr = self.report(rn);
            grouped
                .entry(rn.category())
                .or_default()
                .entry(tr.ds_id)
                .or_default()
                .push(rn);
        }
        for per_ds in grouped.values_mut() {
            for list in per_ds.values_mut() {
                self.sort_by_time(list);
            }
        }
        grouped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
