//! Position offsets, distance classification and candidate scoring.
//!
//! Everything here is read-only over targets and the report store, so the
//! candidate searches fan out over targets with rayon. The associator
//! applies the chosen result sequentially.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

use crate::config::Settings;
use crate::geo::distance_m;
use crate::store::ReportStore;
use crate::target::{Interpolation, ReconstructorTarget};
use crate::types::*;

/// Accuracy value used while no estimator is wired in.
pub const ACCURACY_UNKNOWN: f64 = -1.0;

/// Four-level distance classification, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DistanceClass {
    Good,
    Acceptable,
    Dubious,
    NotOk,
}

impl DistanceClass {
    /// Good or acceptable.
    pub fn is_acceptable(&self) -> bool {
        *self <= DistanceClass::Acceptable
    }
}

/// Classify `distance` against ascending thresholds.
///
/// Returns the class and the margin `acceptable - distance`.
pub fn classify_distance(
    distance: f64,
    acceptable: f64,
    dubious: f64,
    notok: f64,
) -> (DistanceClass, f64) {
    let class = if distance < acceptable {
        DistanceClass::Good
    } else if distance < dubious {
        DistanceClass::Acceptable
    } else if distance < notok {
        DistanceClass::Dubious
    } else {
        DistanceClass::NotOk
    };
    (class, acceptable - distance)
}

/// Distance between a report (or target) and a target, in meters, with
/// accuracy estimates of both sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOffset {
    pub distance_m: f64,
    pub target_accuracy: f64,
    pub report_accuracy: f64,
}

/// Position uncertainty estimates (standard deviation in meters).
pub trait AccuracyEstimator: Send + Sync {
    fn report_accuracy(&self, tr: &TargetReport) -> Option<f64>;
    fn target_accuracy(&self, target: &ReconstructorTarget, t: Timestamp) -> Option<f64>;
}

/// Report-to-target candidate result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportMatch {
    pub utn: Utn,
    pub distance_m: f64,
    pub class: DistanceClass,
    pub margin: f64,
}

/// Target-to-target candidate result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetMatch {
    pub utn: Utn,
    pub num_updates: usize,
    pub avg_distance: f64,
    /// Secondary attributes (Mode A and Mode C) confirmed the pair.
    pub verified: bool,
}

impl TargetMatch {
    /// Lower is better.
    pub fn score(&self) -> f64 {
        self.num_updates as f64 * self.avg_distance
    }
}

/// Read-only comparator over a store and settings.
#[derive(Clone, Copy)]
pub struct Scorer<'a> {
    store: &'a ReportStore,
    settings: &'a Settings,
    estimator: Option<&'a dyn AccuracyEstimator>,
}

impl<'a> Scorer<'a> {
    pub fn new(store: &'a ReportStore, settings: &'a Settings) -> Self {
        Scorer {
            store,
            settings,
            estimator: None,
        }
    }

    pub fn with_estimator(mut self, estimator: &'a dyn AccuracyEstimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    fn target_pos(&self, target: &ReconstructorTarget, t: Timestamp) -> Option<Position> {
        target
            .interpolated_pos_for_time(self.store, t, self.settings.max_time_diff, Interpolation::Fast)
            .map(|ip| ip.position)
    }

    fn target_accuracy(&self, target: &ReconstructorTarget, t: Timestamp) -> f64 {
        self.estimator
            .and_then(|e| e.target_accuracy(target, t))
            .unwrap_or(ACCURACY_UNKNOWN)
    }

    // -- Offsets ------------------------------------------------------------

    /// Whether `position_offset_tr` can produce a value.
    pub fn can_get_position_offset(&self, tr: &TargetReport, target: &ReconstructorTarget) -> bool {
        tr.position.is_some() && self.target_pos(target, tr.timestamp).is_some()
    }

    /// Offset between a report's position and the target's position at the
    /// report's time.
    pub fn position_offset_tr(
        &self,
        tr: &TargetReport,
        target: &ReconstructorTarget,
    ) -> Option<PositionOffset> {
        let report_pos = tr.position?;
        let target_pos = self.target_pos(target, tr.timestamp)?;
        Some(PositionOffset {
            distance_m: distance_m(&report_pos, &target_pos),
            target_accuracy: self.target_accuracy(target, tr.timestamp),
            report_accuracy: self
                .estimator
                .and_then(|e| e.report_accuracy(tr))
                .unwrap_or(ACCURACY_UNKNOWN),
        })
    }

    /// Offset between two targets at a shared time.
    pub fn position_offset_targets(
        &self,
        t: Timestamp,
        a: &ReconstructorTarget,
        b: &ReconstructorTarget,
    ) -> Option<PositionOffset> {
        let pos_a = self.target_pos(a, t)?;
        let pos_b = self.target_pos(b, t)?;
        Some(PositionOffset {
            distance_m: distance_m(&pos_a, &pos_b),
            target_accuracy: self.target_accuracy(a, t),
            report_accuracy: self.target_accuracy(b, t),
        })
    }

    // -- Classification -----------------------------------------------------

    /// Classify a distance against the configured thresholds.
    pub fn check_position_offset_score(&self, distance: f64) -> (DistanceClass, f64) {
        classify_distance(
            distance,
            self.settings.max_distance_acceptable,
            self.settings.max_distance_dubious,
            self.settings.max_distance_notok,
        )
    }

    /// Whether a report still fits its track-numbered target.
    ///
    /// Uses the acceptable threshold scaled by the disassociation factor.
    /// `None` when no offset can be computed.
    pub fn check_track_position_offset_acceptable(
        &self,
        tr: &TargetReport,
        target: &ReconstructorTarget,
    ) -> Option<bool> {
        let offset = self.position_offset_tr(tr, target)?;
        let limit = self.settings.max_distance_acceptable * self.settings.track_disassoc_factor;
        Some(offset.distance_m < limit)
    }

    // -- Report candidates --------------------------------------------------

    /// Evaluate one target as a candidate for an anonymous report.
    ///
    /// Mode A or Mode C evidence of a different aircraft rejects the
    /// candidate; otherwise the position offset must classify as good or
    /// acceptable.
    pub fn score_report(&self, tr: &TargetReport, target: &ReconstructorTarget) -> Option<ReportMatch> {
        let utn = target.utn?;
        let s = self.settings;

        if tr.acad.is_some() && target.has_acad() {
            return None;
        }
        if !target.is_time_inside_within(tr.timestamp, s.max_time_diff) {
            return None;
        }
        if tr.mode_a.is_some()
            && target.compare_mode_a_code(self.store, tr, s.max_time_diff) == ComparisonResult::Different
        {
            return None;
        }
        if tr.barometric_altitude.is_some()
            && target.compare_mode_c_code(self.store, tr, s.max_time_diff, s.max_altitude_diff)
                == ComparisonResult::Different
        {
            return None;
        }

        let offset = self.position_offset_tr(tr, target)?;
        let (class, margin) = self.check_position_offset_score(offset.distance_m);
        class.is_acceptable().then_some(ReportMatch {
            utn,
            distance_m: offset.distance_m,
            class,
            margin,
        })
    }

    /// Best candidate target for an anonymous report: largest margin, ties
    /// to the lower target number.
    pub fn find_target_for_report(
        &self,
        tr: &TargetReport,
        targets: &BTreeMap<Utn, ReconstructorTarget>,
    ) -> Option<ReportMatch> {
        targets
            .par_iter()
            .filter_map(|(_, target)| self.score_report(tr, target))
            .max_by(|a, b| a.margin.total_cmp(&b.margin).then(b.utn.cmp(&a.utn)))
    }

    // -- Target candidates --------------------------------------------------

    /// Score `other` as the same aircraft as `target`.
    pub fn score_targets(
        &self,
        target: &ReconstructorTarget,
        other: &ReconstructorTarget,
    ) -> Option<TargetMatch> {
        let s = self.settings;

        if target.has_acad() && other.has_acad() {
            return None;
        }
        if !target.time_overlaps(other) || target.prob_time_overlaps(other) < s.prob_min_time_overlap {
            return None;
        }

        let ma = other.compare_mode_a_codes(self.store, target.rec_nums(), s.max_time_diff);

        if ma.same.len() > ma.different.len() && ma.same.len() >= s.min_updates {
            let mc = other.compare_mode_c_codes(
                self.store,
                &ma.same,
                s.max_time_diff,
                s.max_altitude_diff,
            );
            if mc.same.len() > mc.different.len() && mc.same.len() >= s.min_updates {
                return self.score_positions(target, other, &mc.same, true);
            }
            None
        } else if ma.different.is_empty() {
            self.score_positions(target, other, target.rec_nums(), false)
        } else {
            None
        }
    }

    /// Position agreement of two targets at the times of `rec_nums`.
    fn score_positions(
        &self,
        target: &ReconstructorTarget,
        other: &ReconstructorTarget,
        rec_nums: &[RecNum],
        verified: bool,
    ) -> Option<TargetMatch> {
        let s = self.settings;
        let mut distances_sum = 0.0;
        let mut num_scored = 0usize;
        let mut good = 0usize;
        let mut dubious = 0usize;

        for &rn in rec_nums {
            let t = self.store.report(rn).timestamp;
            let Some(offset) = self.position_offset_targets(t, target, other) else {
                continue;
            };
            match self.check_position_offset_score(offset.distance_m).0 {
                DistanceClass::Good => good += 1,
                DistanceClass::Acceptable => {}
                DistanceClass::Dubious => dubious += 1,
                DistanceClass::NotOk => {
                    debug!(utn = ?target.utn, other = ?other.utn, d = offset.distance_m, "position not ok");
                    return None;
                }
            }
            distances_sum += offset.distance_m;
            num_scored += 1;
        }

        if good == 0 || num_scored < s.min_updates {
            return None;
        }

        let dubious_rate = dubious as f64 / good as f64;
        let rate_limit = if verified {
            s.max_positions_dubious_verified_rate
        } else {
            s.max_positions_dubious_unknown_rate
        };
        if dubious_rate >= rate_limit {
            return None;
        }

        let avg_distance = distances_sum / num_scored as f64;
        let avg_limit = if verified {
            s.max_distance_dubious
        } else {
            s.max_distance_acceptable
        };
        if avg_distance >= avg_limit {
            return None;
        }

        Some(TargetMatch {
            utn: other.utn?,
            num_updates: num_scored,
            avg_distance,
            verified,
        })
    }

    /// Best other target for `target` among `targets`, skipping `exclude`.
    /// Lowest score wins, ties to the lower target number.
    pub fn find_target_for_target(
        &self,
        target: &ReconstructorTarget,
        targets: &BTreeMap<Utn, ReconstructorTarget>,
        exclude: Option<Utn>,
    ) -> Option<TargetMatch> {
        targets
            .par_iter()
            .filter(|(utn, _)| Some(**utn) != exclude)
            .filter_map(|(_, other)| self.score_targets(target, other))
            .min_by(|a, b| compare_scores(a, b))
    }
}

fn compare_scores(a: &TargetMatch, b: &TargetMatch) -> Ordering {
    a.score().total_cmp(&b.score()).then(a.utn.cmp(&b.utn))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
