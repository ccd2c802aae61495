//! Association pipeline over one slice of new reports.
//!
//! A pass runs seven ordered stages (see [`Stage`]). A stage that can be
//! cancelled after its first change works on a copy of the pass state and
//! is committed only when it completes, so a cancelled pass keeps the
//! results of completed stages and drops the stage in progress. Stages
//! with nothing interruptible to do run on the live state.
//!
//! Targets are mutated only here, sequentially. Candidate scoring is
//! delegated to [`Scorer`], which may fan out over targets in parallel.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::geo::distance_m;
use crate::scoring::{AccuracyEstimator, Scorer};
use crate::store::ReportStore;
use crate::target::ReconstructorTarget;
use crate::types::*;

// ---------------------------------------------------------------------------
// Source categories
// ---------------------------------------------------------------------------

/// Reference trajectory category id.
pub const CATEGORY_REFERENCE: u8 = 255;

/// Primary tracker (system track) category id.
pub const CATEGORY_TRACKER: u8 = 62;

/// Semantic role of a source category in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CategoryRole {
    Reference,
    PrimaryTracker,
    Sensor,
}

impl CategoryRole {
    /// Reference and tracker track numbers are trusted for association.
    pub fn has_track_numbers(&self) -> bool {
        !matches!(self, CategoryRole::Sensor)
    }
}

/// Maps category ids to names and roles. Unknown categories are sensors.
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    entries: BTreeMap<u8, (String, CategoryRole)>,
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        let mut registry = CategoryRegistry {
            entries: BTreeMap::new(),
        };
        registry.register(CATEGORY_REFERENCE, "RefTraj", CategoryRole::Reference);
        registry.register(CATEGORY_TRACKER, "CAT062", CategoryRole::PrimaryTracker);
        for category in [1u8, 10, 20, 21, 48] {
            registry.register(category, &format!("CAT{category:03}"), CategoryRole::Sensor);
        }
        registry
    }
}

impl CategoryRegistry {
    pub fn register(&mut self, category: u8, name: &str, role: CategoryRole) {
        self.entries.insert(category, (name.to_string(), role));
    }

    pub fn role(&self, category: u8) -> CategoryRole {
        self.entries
            .get(&category)
            .map(|(_, role)| *role)
            .unwrap_or(CategoryRole::Sensor)
    }

    pub fn name(&self, category: u8) -> String {
        self.entries
            .get(&category)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| format!("CAT{category:03}"))
    }

    /// Role of the category embedded in a record number.
    pub fn role_of(&self, rec_num: RecNum) -> CategoryRole {
        self.role(rec_num.category())
    }
}

// ---------------------------------------------------------------------------
// Cancellation, observers, statistics
// ---------------------------------------------------------------------------

/// Polled cancellation predicate.
pub trait CancelCheck: Sync {
    fn is_cancelled(&self) -> bool;
}

impl CancelCheck for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// Never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancelCheck for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Annotation hook, notified after every committed stage.
pub trait PassObserver {
    fn stage_completed(&mut self, stage: Stage, targets: &Targets);
}

/// Cumulative association counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssociationStats {
    pub reference_targets_created: usize,
    pub tracker_targets_created: usize,
    /// Transient tracker targets merged into existing targets.
    pub transient_targets_merged: usize,
    /// Targets fed by one data source after the tracker stages.
    pub single_source_targets: usize,
    /// Targets fed by more than one data source after the tracker stages.
    pub multi_source_targets: usize,
    pub sensor_reports_associated: usize,
    /// Targets created for reports with an unknown ACAD or callsign.
    pub sensor_targets_created: usize,
    pub lookup_issues: usize,
    pub self_merges: usize,
    pub retry_associated: usize,
    pub unassociated: usize,
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    SeedReference,
    MergePrimaryTracker,
    AssociateSensors,
    CheckLookup,
    SelfAssociate,
    RetryUnassociated,
    Tally,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::SeedReference,
        Stage::MergePrimaryTracker,
        Stage::AssociateSensors,
        Stage::CheckLookup,
        Stage::SelfAssociate,
        Stage::RetryUnassociated,
        Stage::Tally,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::SeedReference => "seed reference",
            Stage::MergePrimaryTracker => "merge primary tracker",
            Stage::AssociateSensors => "associate sensors",
            Stage::CheckLookup => "check lookup",
            Stage::SelfAssociate => "self associate",
            Stage::RetryUnassociated => "retry unassociated",
            Stage::Tally => "tally",
        }
    }

    fn func(self) -> StageFn {
        match self {
            Stage::SeedReference => seed_reference,
            Stage::MergePrimaryTracker => merge_primary_tracker,
            Stage::AssociateSensors => associate_sensors,
            Stage::CheckLookup => check_lookup,
            Stage::SelfAssociate => self_associate,
            Stage::RetryUnassociated => retry_unassociated,
            Stage::Tally => tally,
        }
    }

    /// Whether the stage may be cancelled after it has started changing
    /// the pass state. Other stages run directly on the live state.
    fn needs_snapshot(self, ctx: &PassContext<'_>, state: &PassState) -> bool {
        match self {
            Stage::SeedReference => ctx.has_role(CategoryRole::Reference),
            Stage::MergePrimaryTracker => ctx.has_role(CategoryRole::PrimaryTracker),
            Stage::AssociateSensors => ctx.has_role(CategoryRole::Sensor),
            Stage::SelfAssociate => state.targets.iter().any(|(_, t)| t.created_in_current_slice),
            Stage::RetryUnassociated => !state.pending.is_empty(),
            Stage::CheckLookup | Stage::Tally => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    /// Stages before this one were committed; this one was discarded.
    Cancelled(Stage),
}

/// Cooperative early exit from a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cancelled;

type StageResult = std::result::Result<(), Cancelled>;
type StageFn = fn(&PassContext<'_>, &mut PassState) -> StageResult;

// ---------------------------------------------------------------------------
// Targets container
// ---------------------------------------------------------------------------

/// ACAD lookup inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupIssue {
    /// A target holds an ACAD the lookup doesn't know.
    Missing { acad: u32, utn: Utn },
    /// The lookup points at a missing target or one without the ACAD.
    Stale { acad: u32, utn: Utn },
    /// More than one target holds the ACAD.
    Shared { acad: u32, utns: Vec<Utn> },
}

impl fmt::Display for LookupIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupIssue::Missing { acad, utn } => {
                write!(f, "acad {} of utn {utn} not in lookup", acad_to_string(*acad))
            }
            LookupIssue::Stale { acad, utn } => {
                write!(f, "acad {} maps to utn {utn} which lacks it", acad_to_string(*acad))
            }
            LookupIssue::Shared { acad, utns } => {
                write!(f, "acad {} held by utns {utns:?}", acad_to_string(*acad))
            }
        }
    }
}

/// Target number -> target, plus the identity lookups kept next to it.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    targets: BTreeMap<Utn, ReconstructorTarget>,
    acad_lookup: BTreeMap<u32, Utn>,
    acid_lookup: BTreeMap<String, Utn>,
    /// (ds_id, track number) -> (utn, time of last update)
    track_lookup: BTreeMap<(u32, u32), (Utn, Timestamp)>,
    next_utn: Utn,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, utn: Utn) -> Option<&ReconstructorTarget> {
        self.targets.get(&utn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Utn, &ReconstructorTarget)> {
        self.targets.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<Utn, ReconstructorTarget> {
        &self.targets
    }

    /// Create an empty target flagged as created in the current slice.
    /// Target numbers are never reused.
    pub fn create(&mut self) -> Utn {
        let utn = self.next_utn;
        self.next_utn += 1;
        self.targets.insert(utn, ReconstructorTarget::new(Some(utn), true));
        utn
    }

    /// Add a report to a target and update the lookups.
    ///
    /// Panics if the target doesn't exist.
    pub fn associate(&mut self, store: &ReportStore, rec_num: RecNum, utn: Utn, track_numbers: bool) {
        let Some(target) = self.targets.get_mut(&utn) else {
            panic!("associate: target {utn} missing");
        };
        target.add_report(store, rec_num);

        let tr = store.report(rec_num);
        if track_numbers {
            if let Some(tn) = tr.track_number {
                self.track_lookup.insert((tr.ds_id, tn), (utn, tr.timestamp));
            }
        }
        if let Some(acad) = tr.acad {
            self.acad_lookup.insert(acad, utn);
        }
        if let Some(acid) = tr.trimmed_acid() {
            self.acid_lookup.insert(acid.to_string(), utn);
        }
    }

    /// Move all reports of `from` into `into`, delete `from` and re-point
    /// every lookup entry.
    pub fn merge(&mut self, store: &ReportStore, from: Utn, into: Utn) {
        assert_ne!(from, into, "merge: target {from} into itself");
        let Some(source) = self.targets.remove(&from) else {
            panic!("merge: source target {from} missing");
        };
        let Some(dest) = self.targets.get_mut(&into) else {
            panic!("merge: destination target {into} missing");
        };
        dest.absorb(store, &source);

        for utn in self.acad_lookup.values_mut() {
            if *utn == from {
                *utn = into;
            }
        }
        for utn in self.acid_lookup.values_mut() {
            if *utn == from {
                *utn = into;
            }
        }
        for (utn, _) in self.track_lookup.values_mut() {
            if *utn == from {
                *utn = into;
            }
        }
    }

    pub fn acad_utn(&self, acad: u32) -> Option<Utn> {
        self.acad_lookup.get(&acad).copied()
    }

    pub fn acid_utn(&self, acid: &str) -> Option<Utn> {
        self.acid_lookup.get(acid.trim()).copied()
    }

    pub fn track_entry(&self, ds_id: u32, track_number: u32) -> Option<(Utn, Timestamp)> {
        self.track_lookup.get(&(ds_id, track_number)).copied()
    }

    pub fn drop_track(&mut self, ds_id: u32, track_number: u32) {
        self.track_lookup.remove(&(ds_id, track_number));
    }

    /// Compare the ACAD lookup against the ACADs the targets hold.
    pub fn check_acad_lookup(&self) -> Vec<LookupIssue> {
        let mut holders: BTreeMap<u32, Vec<Utn>> = BTreeMap::new();
        for (&utn, target) in &self.targets {
            for &acad in target.acads() {
                holders.entry(acad).or_default().push(utn);
            }
        }

        let mut issues = Vec::new();
        for (&acad, utns) in &holders {
            if !self.acad_lookup.contains_key(&acad) {
                issues.push(LookupIssue::Missing { acad, utn: utns[0] });
            }
            if utns.len() > 1 {
                issues.push(LookupIssue::Shared {
                    acad,
                    utns: utns.clone(),
                });
            }
        }
        for (&acad, &utn) in &self.acad_lookup {
            if !self.targets.get(&utn).is_some_and(|t| t.has_acad_value(acad)) {
                issues.push(LookupIssue::Stale { acad, utn });
            }
        }
        issues
    }

    /// Rebuild the ACAD lookup from the targets. Lowest utn wins a shared
    /// ACAD.
    pub fn rebuild_acad_lookup(&mut self) {
        self.acad_lookup.clear();
        for (&utn, target) in &self.targets {
            for &acad in target.acads() {
                self.acad_lookup.entry(acad).or_insert(utn);
            }
        }
    }

    /// (single, multiple) counts of targets by contributing data sources.
    pub fn source_multiplicity(&self) -> (usize, usize) {
        let multiple = self.targets.values().filter(|t| t.ds_ids().len() > 1).count();
        (self.targets.len() - multiple, multiple)
    }

    pub fn created_in_current_slice(&self) -> Vec<Utn> {
        self.targets
            .iter()
            .filter(|(_, t)| t.created_in_current_slice)
            .map(|(&utn, _)| utn)
            .collect()
    }

    pub fn clear_slice_flags(&mut self) {
        for target in self.targets.values_mut() {
            target.created_in_current_slice = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Pass state and context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct PassState {
    targets: Targets,
    /// Reports of the current pass not yet associated.
    pending: Vec<RecNum>,
    /// Tallied unassociated reports across passes.
    unassociated: BTreeSet<RecNum>,
    stats: AssociationStats,
}

struct PassContext<'a> {
    store: &'a ReportStore,
    settings: &'a Settings,
    registry: &'a CategoryRegistry,
    estimator: Option<&'a dyn AccuracyEstimator>,
    cancel: &'a dyn CancelCheck,
    /// Reports of the current slice, in time order.
    new_ids: &'a [RecNum],
}

impl<'a> PassContext<'a> {
    fn scorer(&self) -> Scorer<'a> {
        let scorer = Scorer::new(self.store, self.settings);
        match self.estimator {
            Some(estimator) => scorer.with_estimator(estimator),
            None => scorer,
        }
    }

    fn poll(&self) -> StageResult {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    fn has_role(&self, role: CategoryRole) -> bool {
        self.new_ids.iter().any(|&rn| self.registry.role_of(rn) == role)
    }

    fn ids_with_role(&self, role: CategoryRole) -> Vec<RecNum> {
        self.new_ids
            .iter()
            .copied()
            .filter(|&rn| self.registry.role_of(rn) == role)
            .collect()
    }

    fn associate(&self, targets: &mut Targets, rec_num: RecNum, utn: Utn) {
        let track_numbers = self.registry.role_of(rec_num).has_track_numbers();
        targets.associate(self.store, rec_num, utn, track_numbers);
    }
}

// ---------------------------------------------------------------------------
// Associator
// ---------------------------------------------------------------------------

/// Drives association passes and owns the targets.
pub struct Associator {
    settings: Settings,
    registry: CategoryRegistry,
    estimator: Option<Box<dyn AccuracyEstimator>>,
    observers: Vec<Box<dyn PassObserver>>,
    state: PassState,
}

impl Associator {
    pub fn new(settings: Settings) -> Self {
        Associator {
            settings,
            registry: CategoryRegistry::default(),
            estimator: None,
            observers: Vec::new(),
            state: PassState::default(),
        }
    }

    pub fn with_registry(mut self, registry: CategoryRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn AccuracyEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn PassObserver>) {
        self.observers.push(observer);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    pub fn targets(&self) -> &Targets {
        &self.state.targets
    }

    pub fn stats(&self) -> &AssociationStats {
        &self.state.stats
    }

    /// Tallied unassociated record numbers.
    pub fn unassociated(&self) -> &BTreeSet<RecNum> {
        &self.state.unassociated
    }

    /// Reports of the current pass still waiting for association.
    pub fn pending(&self) -> &[RecNum] {
        &self.state.pending
    }

    /// Drop all targets, lookups and counters.
    pub fn reset(&mut self) {
        debug!("associator reset");
        self.state = PassState::default();
    }

    /// Run all stages over the reports of one slice.
    pub fn associate_new_data(
        &mut self,
        store: &ReportStore,
        new_ids: &[RecNum],
        cancel: &dyn CancelCheck,
    ) -> Result<PassOutcome> {
        let ids = time_ordered(store, new_ids)?;
        info!(reports = ids.len(), targets = self.state.targets.len(), "associating new data");

        if !self.state.pending.is_empty() {
            warn!(
                count = self.state.pending.len(),
                "reports left pending by an interrupted pass, tallied as unassociated"
            );
            let leftover = std::mem::take(&mut self.state.pending);
            self.state.unassociated.extend(leftover);
            self.state.stats.unassociated = self.state.unassociated.len();
        }

        for stage in Stage::ALL {
            if self.run_sorted(store, &ids, stage, cancel) == StageOutcome::Cancelled {
                warn!(stage = %stage, "association pass cancelled");
                return Ok(PassOutcome::Cancelled(stage));
            }
        }

        info!(
            targets = self.state.targets.len(),
            unassociated = self.state.unassociated.len(),
            merges = self.state.stats.self_merges,
            "association pass done"
        );
        Ok(PassOutcome::Completed)
    }

    /// Run a single stage over the reports of the current slice.
    pub fn run_stage(
        &mut self,
        store: &ReportStore,
        new_ids: &[RecNum],
        stage: Stage,
        cancel: &dyn CancelCheck,
    ) -> Result<StageOutcome> {
        let ids = time_ordered(store, new_ids)?;
        Ok(self.run_sorted(store, &ids, stage, cancel))
    }

    fn run_sorted(
        &mut self,
        store: &ReportStore,
        ids: &[RecNum],
        stage: Stage,
        cancel: &dyn CancelCheck,
    ) -> StageOutcome {
        if cancel.is_cancelled() {
            info!(stage = %stage, "cancelled before stage");
            return StageOutcome::Cancelled;
        }

        let ctx = PassContext {
            store,
            settings: &self.settings,
            registry: &self.registry,
            estimator: self.estimator.as_deref(),
            cancel,
            new_ids: ids,
        };

        debug!(stage = %stage, "stage start");
        if stage.needs_snapshot(&ctx, &self.state) {
            let mut state = self.state.clone();
            if (stage.func())(&ctx, &mut state).is_err() {
                info!(stage = %stage, "stage cancelled, discarding its work");
                return StageOutcome::Cancelled;
            }
            self.state = state;
        } else if (stage.func())(&ctx, &mut self.state).is_err() {
            // Only polled before the first change
            info!(stage = %stage, "stage cancelled");
            return StageOutcome::Cancelled;
        }

        for observer in &mut self.observers {
            observer.stage_completed(stage, &self.state.targets);
        }
        debug!(stage = %stage, targets = self.state.targets.len(), "stage done");
        StageOutcome::Completed
    }
}

fn time_ordered(store: &ReportStore, rec_nums: &[RecNum]) -> Result<Vec<RecNum>> {
    if let Some(&missing) = rec_nums.iter().find(|&&rn| !store.contains(rn)) {
        return Err(ReconError::UnknownRecord(missing));
    }
    let mut ids = rec_nums.to_vec();
    store.sort_by_time(&mut ids);
    ids.dedup();
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Stages 1 and 2: tracked categories
// ---------------------------------------------------------------------------

fn seed_reference(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    process_tracked_category(ctx, state, CategoryRole::Reference)
}

fn merge_primary_tracker(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    process_tracked_category(ctx, state, CategoryRole::PrimaryTracker)?;

    let (single, multiple) = state.targets.source_multiplicity();
    state.stats.single_source_targets = single;
    state.stats.multi_source_targets = multiple;
    info!(targets = state.targets.len(), single, multiple, "tracker targets");
    Ok(())
}

fn process_tracked_category(
    ctx: &PassContext<'_>,
    state: &mut PassState,
    role: CategoryRole,
) -> StageResult {
    let ids = ctx.ids_with_role(role);
    if ids.is_empty() {
        debug!(?role, "no tracked data");
        return Ok(());
    }

    for (category, per_ds) in ctx.store.group_by_source(&ids) {
        for (ds_id, rec_nums) in per_ds {
            info!(
                category = %ctx.registry.name(category),
                ds_id,
                reports = rec_nums.len(),
                "processing tracked source"
            );
            let transients = create_tracked_targets(ctx, state, ds_id, &rec_nums)?;
            if transients.is_empty() {
                debug!(ds_id, "no transient targets");
                continue;
            }
            add_tracked_targets(ctx, state, role, transients)?;
        }
    }
    Ok(())
}

/// Group one data source's reports into transient targets by track number.
///
/// Reports continuing a target known from an earlier slice are associated
/// directly; reports without track number are queued for retry.
fn create_tracked_targets(
    ctx: &PassContext<'_>,
    state: &mut PassState,
    ds_id: u32,
    rec_nums: &[RecNum],
) -> std::result::Result<Vec<ReconstructorTarget>, Cancelled> {
    let s = ctx.settings;
    let mut transients: Vec<ReconstructorTarget> = Vec::new();
    // track number -> (transient index, time of last update)
    let mut tn_map: BTreeMap<u32, (usize, Timestamp)> = BTreeMap::new();

    for &rn in rec_nums {
        ctx.poll()?;
        let tr = ctx.store.report(rn);

        let Some(tn) = tr.track_number else {
            warn!(ds_id, t = tr.timestamp, rec = %rn, "tracked report without track number");
            state.pending.push(rn);
            continue;
        };

        if !tn_map.contains_key(&tn) && continue_known_track(ctx, &mut state.targets, rn, tr, tn) {
            continue;
        }

        let idx = match tn_map.get(&tn).copied() {
            Some((idx, last_ts)) => {
                let current = &transients[idx];
                let gap = tr.timestamp - last_ts > s.track_gap;
                let acad_switch =
                    tr.acad.is_some_and(|a| current.has_acad() && !current.has_acad_value(a));
                if gap || acad_switch {
                    debug!(ds_id, tn, gap, acad_switch, t = tr.timestamp, "new transient target");
                    transients.push(ReconstructorTarget::new(None, true));
                    transients.len() - 1
                } else {
                    idx
                }
            }
            None => {
                let continuation = if tr.acad.is_none() && s.associate_non_mode_s {
                    find_track_continuation(ctx, &transients, tr)
                } else {
                    None
                };
                match continuation {
                    Some(idx) => {
                        debug!(ds_id, tn, idx, t = tr.timestamp, "track continued under new number");
                        idx
                    }
                    None => {
                        transients.push(ReconstructorTarget::new(None, true));
                        transients.len() - 1
                    }
                }
            }
        };

        tn_map.insert(tn, (idx, tr.timestamp));
        transients[idx].add_report(ctx.store, rn);
    }

    Ok(transients)
}

/// Associate a report to the target its track number is known for, unless
/// the track is too old, switched ACAD or drifted off the target.
fn continue_known_track(
    ctx: &PassContext<'_>,
    targets: &mut Targets,
    rn: RecNum,
    tr: &TargetReport,
    tn: u32,
) -> bool {
    let Some((utn, last_ts)) = targets.track_entry(tr.ds_id, tn) else {
        return false;
    };
    let Some(target) = targets.get(utn) else {
        error!(ds_id = tr.ds_id, tn, utn, "track lookup points at missing target");
        targets.drop_track(tr.ds_id, tn);
        return false;
    };

    let too_old = tr.timestamp - last_ts > ctx.settings.track_max_time_diff;
    let acad_switch = tr.acad.is_some_and(|a| target.has_acad() && !target.has_acad_value(a));
    let drifted = !too_old
        && ctx.scorer().check_track_position_offset_acceptable(tr, target) == Some(false);

    if too_old || acad_switch || drifted {
        debug!(ds_id = tr.ds_id, tn, utn, too_old, acad_switch, drifted, "track lookup dropped");
        targets.drop_track(tr.ds_id, tn);
        return false;
    }

    ctx.associate(targets, rn, utn);
    true
}

/// Find the single transient whose ended track this non-Mode S report
/// continues under a new track number.
fn find_track_continuation(
    ctx: &PassContext<'_>,
    transients: &[ReconstructorTarget],
    tr: &TargetReport,
) -> Option<usize> {
    let s = ctx.settings;
    let mode_a = tr.mode_a.filter(|m| m.has_reliable_value())?;
    let pos = tr.position?;

    let candidates: Vec<usize> = transients
        .iter()
        .enumerate()
        .filter(|(_, other)| {
            if other.has_acad() {
                return false;
            }
            let (Some(t_max), Some(last)) = (other.timestamp_max(), other.latest_report()) else {
                return false;
            };
            if tr.timestamp <= t_max || tr.timestamp - t_max > s.cont_max_time_diff_tracker {
                return false;
            }

            let last_tr = ctx.store.report(last);
            if last_tr.track_end != Some(true) {
                return false;
            }
            if !last_tr
                .mode_a
                .is_some_and(|m| m.has_reliable_value() && m.code == mode_a.code)
            {
                return false;
            }
            if let (Some(a), Some(b)) = (last_tr.barometric_altitude, tr.barometric_altitude) {
                if a.reliable && b.reliable && (a.altitude_ft - b.altitude_ft).abs() > s.max_altitude_diff
                {
                    return false;
                }
            }
            last_tr
                .position
                .is_some_and(|p| distance_m(&p, &pos) <= s.cont_max_distance_acceptable_tracker)
        })
        .map(|(idx, _)| idx)
        .collect();

    match candidates.as_slice() {
        [idx] => Some(*idx),
        [] => None,
        _ => {
            debug!(t = tr.timestamp, count = candidates.len(), "ambiguous track continuation");
            None
        }
    }
}

/// Merge transient targets into the container: by ACAD, else by target
/// scoring, else as new targets.
fn add_tracked_targets(
    ctx: &PassContext<'_>,
    state: &mut PassState,
    role: CategoryRole,
    transients: Vec<ReconstructorTarget>,
) -> StageResult {
    let scorer = ctx.scorer();

    for transient in transients {
        ctx.poll()?;

        let by_acad = transient
            .acads()
            .iter()
            .find_map(|&acad| state.targets.acad_utn(acad));
        let existing = by_acad.or_else(|| {
            if ctx.settings.associate_non_mode_s {
                scorer
                    .find_target_for_target(&transient, state.targets.as_map(), None)
                    .map(|m| m.utn)
            } else {
                None
            }
        });

        let utn = match existing {
            Some(utn) => {
                debug!(utn, reports = transient.num_associated(), "transient merged");
                state.stats.transient_targets_merged += 1;
                utn
            }
            None => {
                let utn = state.targets.create();
                match role {
                    CategoryRole::Reference => state.stats.reference_targets_created += 1,
                    _ => state.stats.tracker_targets_created += 1,
                }
                utn
            }
        };

        for &rn in transient.rec_nums() {
            ctx.associate(&mut state.targets, rn, utn);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stages 3 and 6: single reports
// ---------------------------------------------------------------------------

enum ReportDecision {
    Associate(Utn),
    Create,
    Defer,
}

/// ACAD lookup, callsign lookup, then Mode A/C + position search. Reports
/// with an identity but no match get a new target; anonymous ones wait.
fn decide_for_report(
    ctx: &PassContext<'_>,
    scorer: &Scorer<'_>,
    targets: &Targets,
    tr: &TargetReport,
) -> ReportDecision {
    if let Some(utn) = tr.acad.and_then(|a| targets.acad_utn(a)) {
        return ReportDecision::Associate(utn);
    }
    if let Some(utn) = tr.trimmed_acid().and_then(|id| targets.acid_utn(id)) {
        return ReportDecision::Associate(utn);
    }

    let has_identity = tr.acad.is_some() || tr.trimmed_acid().is_some();
    if has_identity || ctx.settings.associate_non_mode_s {
        if let Some(m) = scorer.find_target_for_report(tr, targets.as_map()) {
            return ReportDecision::Associate(m.utn);
        }
    }

    if has_identity {
        ReportDecision::Create
    } else {
        ReportDecision::Defer
    }
}

fn associate_sensors(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    let scorer = ctx.scorer();
    let ids = ctx.ids_with_role(CategoryRole::Sensor);
    info!(reports = ids.len(), "associating sensor reports");

    for rn in ids {
        ctx.poll()?;
        let tr = ctx.store.report(rn);

        match decide_for_report(ctx, &scorer, &state.targets, tr) {
            ReportDecision::Associate(utn) => {
                ctx.associate(&mut state.targets, rn, utn);
                state.stats.sensor_reports_associated += 1;
            }
            ReportDecision::Create => {
                let utn = state.targets.create();
                debug!(rec = %rn, utn, "new target for {tr}");
                ctx.associate(&mut state.targets, rn, utn);
                state.stats.sensor_targets_created += 1;
            }
            ReportDecision::Defer => state.pending.push(rn),
        }
    }
    Ok(())
}

fn retry_unassociated(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    if state.pending.is_empty() {
        return Ok(());
    }

    let scorer = ctx.scorer();
    let pending = std::mem::take(&mut state.pending);
    let mut remaining = Vec::new();
    let mut associated = 0usize;

    for &rn in pending.iter().rev() {
        ctx.poll()?;
        let tr = ctx.store.report(rn);

        match decide_for_report(ctx, &scorer, &state.targets, tr) {
            ReportDecision::Associate(utn) => {
                ctx.associate(&mut state.targets, rn, utn);
                associated += 1;
            }
            ReportDecision::Create => {
                let utn = state.targets.create();
                ctx.associate(&mut state.targets, rn, utn);
                state.stats.sensor_targets_created += 1;
            }
            ReportDecision::Defer => remaining.push(rn),
        }
    }

    remaining.reverse();
    state.pending = remaining;
    state.stats.retry_associated += associated;
    info!(associated, remaining = state.pending.len(), "retry done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Stages 4, 5 and 7
// ---------------------------------------------------------------------------

fn check_lookup(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    ctx.poll()?;
    verify_acad_lookup(state);
    Ok(())
}

/// Log lookup inconsistencies and rebuild the lookup if entries are
/// missing or stale.
fn verify_acad_lookup(state: &mut PassState) {
    let issues = state.targets.check_acad_lookup();
    let mut rebuild = false;
    for issue in &issues {
        match issue {
            LookupIssue::Shared { .. } => warn!(%issue, "acad lookup"),
            _ => {
                error!(%issue, "acad lookup inconsistent");
                rebuild = true;
            }
        }
    }
    if rebuild {
        state.targets.rebuild_acad_lookup();
    }
    state.stats.lookup_issues += issues.len();
}

fn self_associate(ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    // Target-to-target matching is a Mode A/C + position search
    if !ctx.settings.associate_non_mode_s {
        debug!("self association skipped, non-mode-s association off");
        verify_acad_lookup(state);
        return Ok(());
    }

    let scorer = ctx.scorer();
    let mut run = 0usize;

    loop {
        let mut merged = false;

        for utn in state.targets.created_in_current_slice() {
            ctx.poll()?;
            let Some(target) = state.targets.get(utn) else {
                continue;
            };
            let Some(m) = scorer.find_target_for_target(target, state.targets.as_map(), Some(utn))
            else {
                continue;
            };

            info!(
                run,
                utn,
                into = m.utn,
                num_updates = m.num_updates,
                avg_distance = m.avg_distance,
                verified = m.verified,
                "merging targets"
            );
            state.targets.merge(ctx.store, utn, m.utn);
            state.stats.self_merges += 1;
            merged = true;
        }

        run += 1;
        if !merged {
            break;
        }
    }

    debug!(runs = run, "self association done");
    verify_acad_lookup(state);
    Ok(())
}

fn tally(_ctx: &PassContext<'_>, state: &mut PassState) -> StageResult {
    state.unassociated.extend(state.pending.iter().copied());
    state.stats.unassociated = state.unassociated.len();
    state.targets.clear_slice_flags();
    info!(unassociated = state.unassociated.len(), "tally done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// Cancels once more than `limit` polls have been made.
    struct CancelAfter {
        polls: AtomicUsize,
        limit: usize,
    }

    impl CancelAfter {
        fn new(limit: usize) -> Self {
            CancelAfter {
                polls: AtomicUsize::new(0),
                limit,
            }
        }
    }

    impl CancelCheck for CancelAfter {
        fn is_cancelled(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.limit
        }
    }

    struct Recorder(Arc<Mutex<Vec<Stage>>>);

    impl PassObserver for Recorder {
        fn stage_completed(&mut self, stage: Stage, _targets: &Targets) {
            self.0.lock().unwrap().push(stage);
        }
    }

    /// Straight northbound track, 0.001 deg latitude per second.
    fn track_reports(
        category: u8,
        ds_id: u32,
        lat0: f64,
        times: &[f64],
        build: impl Fn(TargetReport) -> TargetReport,
    ) -> Vec<TargetReport> {
        times
            .iter()
            .map(|&t| build(TargetReport::new(category, ds_id, t).with_position(lat0 + t * 0.001, 11.0)))
            .collect()
    }

    fn insert_all(store: &mut ReportStore, reports: Vec<TargetReport>) -> Vec<RecNum> {
        reports.into_iter().map(|tr| store.insert(tr).unwrap()).collect()
    }

    fn times(from: f64, to: f64, step: f64) -> Vec<f64> {
        let mut out = Vec::new();
        let mut t = from;
        while t <= to {
            out.push(t);
            t += step;
        }
        out
    }

    #[test]
    fn test_stage_order_and_names() {
        assert_eq!(Stage::ALL.len(), 7);
        assert!(Stage::ALL.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Stage::SelfAssociate.to_string(), "self associate");
    }

    #[test]
    fn test_registry_roles() {
        let registry = CategoryRegistry::default();
        assert_eq!(registry.role(255), CategoryRole::Reference);
        assert_eq!(registry.role(62), CategoryRole::PrimaryTracker);
        assert_eq!(registry.role(21), CategoryRole::Sensor);
        assert_eq!(registry.role(99), CategoryRole::Sensor);
        assert_eq!(registry.name(62), "CAT062");
        assert_eq!(registry.name(99), "CAT099");
        assert_eq!(registry.role_of(RecNum::new(255, 3)), CategoryRole::Reference);
    }

    #[test]
    fn test_targets_create_monotonic() {
        let mut store = ReportStore::new();
        let rn = store.insert(TargetReport::new(21, 1, 0.0)).unwrap();
        let rn2 = store.insert(TargetReport::new(21, 1, 1.0)).unwrap();

        let mut targets = Targets::new();
        let a = targets.create();
        let b = targets.create();
        targets.associate(&store, rn, a, false);
        targets.associate(&store, rn2, b, false);
        targets.merge(&store, b, a);
        let c = targets.create();

        assert_eq!((a, b, c), (0, 1, 2));
        assert!(targets.get(b).is_none());
        assert_eq!(targets.get(a).unwrap().num_associated(), 2);
    }

    #[test]
    fn test_merge_repoints_lookups() {
        let mut store = ReportStore::new();
        let with_acad = store
            .insert(TargetReport::new(62, 1, 0.0).with_acad(0xABC123).with_track(7, false))
            .unwrap();
        let with_acid = store.insert(TargetReport::new(21, 2, 1.0).with_acid("DLH4")).unwrap();

        let mut targets = Targets::new();
        let a = targets.create();
        let b = targets.create();
        targets.associate(&store, with_acad, a, true);
        targets.associate(&store, with_acid, b, false);
        assert_eq!(targets.track_entry(1, 7), Some((a, 0.0)));

        targets.merge(&store, a, b);
        assert_eq!(targets.acad_utn(0xABC123), Some(b));
        assert_eq!(targets.acid_utn("DLH4"), Some(b));
        assert_eq!(targets.track_entry(1, 7), Some((b, 0.0)));
        assert!(targets.check_acad_lookup().is_empty());
    }

    #[test]
    #[should_panic(expected = "missing")]
    fn test_associate_unknown_target_panics() {
        let mut store = ReportStore::new();
        let rn = store.insert(TargetReport::new(21, 1, 0.0)).unwrap();
        let mut targets = Targets::new();
        targets.associate(&store, rn, 42, false);
    }

    #[test]
    fn test_check_and_rebuild_acad_lookup() {
        let mut store = ReportStore::new();
        let rn = store.insert(TargetReport::new(21, 1, 0.0).with_acad(0x111111)).unwrap();

        let mut targets = Targets::new();
        let utn = targets.create();
        targets.associate(&store, rn, utn, false);
        assert!(targets.check_acad_lookup().is_empty());

        targets.acad_lookup.clear();
        targets.acad_lookup.insert(0x222222, utn);
        let issues = targets.check_acad_lookup();
        assert!(issues.contains(&LookupIssue::Missing {
            acad: 0x111111,
            utn
        }));
        assert!(issues.contains(&LookupIssue::Stale {
            acad: 0x222222,
            utn
        }));

        targets.rebuild_acad_lookup();
        assert!(targets.check_acad_lookup().is_empty());
        assert_eq!(targets.acad_utn(0x111111), Some(utn));
    }

    #[test]
    fn test_seed_reference_one_target_per_track() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(255, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(1, false).with_acad(0x3C0001)
        });
        reports.extend(track_reports(255, 1, 48.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(2, false).with_acad(0x3C0002)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc
            .run_stage(&store, &ids, Stage::SeedReference, &NeverCancel)
            .unwrap();

        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(assoc.targets().len(), 2);
        assert_eq!(assoc.stats().reference_targets_created, 2);
        let utn = assoc.targets().acad_utn(0x3C0002).unwrap();
        assert_eq!(assoc.targets().track_entry(1, 2), Some((utn, 20.0)));
    }

    #[test]
    fn test_track_gap_splits_transients() {
        let mut store = ReportStore::new();
        let mut ts = times(0.0, 10.0, 2.0);
        ts.extend(times(200.0, 210.0, 2.0));
        let ids = insert_all(
            &mut store,
            track_reports(62, 1, 47.0, &ts, |tr| tr.with_track(5, false)),
        );

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        assert_eq!(assoc.targets().len(), 2);
        assert_eq!(assoc.stats().tracker_targets_created, 2);
        assert_eq!(assoc.stats().single_source_targets, 2);
    }

    #[test]
    fn test_acad_switch_splits_transients() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(62, 1, 47.0, &times(0.0, 10.0, 2.0), |tr| {
            tr.with_track(5, false).with_acad(0xAAAAAA)
        });
        reports.extend(track_reports(62, 1, 50.0, &times(12.0, 20.0, 2.0), |tr| {
            tr.with_track(5, false).with_acad(0xBBBBBB)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        let targets = assoc.targets();
        assert_eq!(targets.len(), 2);
        assert_ne!(targets.acad_utn(0xAAAAAA), targets.acad_utn(0xBBBBBB));
        assert!(targets.iter().all(|(_, t)| !t.acad_conflict()));
    }

    #[test]
    fn test_tracker_merges_into_reference_by_acad() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(255, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(1, false).with_acad(0x4840D6)
        });
        reports.extend(track_reports(62, 9, 47.0, &times(1.0, 19.0, 2.0), |tr| {
            tr.with_track(300, false).with_acad(0x4840D6)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        assoc.run_stage(&store, &ids, Stage::SeedReference, &NeverCancel).unwrap();
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        assert_eq!(assoc.targets().len(), 1);
        assert_eq!(assoc.stats().transient_targets_merged, 1);
        assert_eq!(assoc.stats().multi_source_targets, 1);
        let (_, target) = assoc.targets().iter().next().unwrap();
        assert_eq!(target.num_associated(), ids.len());
    }

    #[test]
    fn test_tracker_merges_by_scoring_without_acad() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(62, 1, 47.0, &times(0.0, 30.0, 2.0), |tr| {
            tr.with_track(11, false).with_mode_a(0o2345, true).with_mode_c(20000.0, true)
        });
        reports.extend(track_reports(62, 2, 47.0002, &times(1.0, 29.0, 2.0), |tr| {
            tr.with_track(77, false).with_mode_a(0o2345, true).with_mode_c(20000.0, true)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        assert_eq!(assoc.targets().len(), 1);
        assert_eq!(assoc.stats().tracker_targets_created, 1);
        assert_eq!(assoc.stats().transient_targets_merged, 1);
    }

    #[test]
    fn test_track_continuation_after_track_end() {
        let mut store = ReportStore::new();
        let first = times(0.0, 10.0, 2.0);
        let last_t = *first.last().unwrap();
        let mut reports = track_reports(62, 1, 47.0, &first, |tr| {
            let ended = tr.timestamp == last_t;
            tr.with_track(1, ended).with_mode_a(0o4455, true)
        });
        reports.extend(track_reports(62, 1, 47.0, &times(14.0, 20.0, 2.0), |tr| {
            tr.with_track(2, false).with_mode_a(0o4455, true)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        assert_eq!(assoc.targets().len(), 1);
        let utn = assoc.targets().track_entry(1, 1).unwrap().0;
        assert_eq!(assoc.targets().track_entry(1, 2).unwrap().0, utn);
    }

    #[test]
    fn test_tracked_report_without_track_number_is_pending() {
        let mut store = ReportStore::new();
        let ids = insert_all(&mut store, vec![TargetReport::new(62, 1, 0.0).with_position(47.0, 11.0)]);

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();
        assert!(assoc.targets().is_empty());
        assert_eq!(assoc.pending(), ids.as_slice());
    }

    #[test]
    fn test_associate_sensors() {
        let mut store = ReportStore::new();
        let tracker = insert_all(
            &mut store,
            track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
                tr.with_track(1, false).with_acad(0x400001).with_mode_a(0o1000, true)
            }),
        );

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &tracker, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();
        let tracker_utn = assoc.targets().acad_utn(0x400001).unwrap();

        let by_acad = store
            .insert(TargetReport::new(21, 5, 3.0).with_position(47.003, 11.0).with_acad(0x400001))
            .unwrap();
        let new_acad = store
            .insert(TargetReport::new(21, 5, 4.0).with_position(40.0, 5.0).with_acad(0x500002))
            .unwrap();
        let by_position = store
            .insert(
                TargetReport::new(48, 6, 5.0)
                    .with_position(47.0052, 11.0)
                    .with_mode_a(0o1000, true),
            )
            .unwrap();
        let far = store
            .insert(TargetReport::new(48, 6, 5.0).with_position(45.0, 11.0))
            .unwrap();
        let sensor = vec![by_acad, new_acad, by_position, far];

        assoc
            .run_stage(&store, &sensor, Stage::AssociateSensors, &NeverCancel)
            .unwrap();

        let targets = assoc.targets();
        assert_eq!(targets.len(), 2);
        let tracker_target = targets.get(tracker_utn).unwrap();
        assert!(tracker_target.contains(&store, by_acad));
        assert!(tracker_target.contains(&store, by_position));
        assert_ne!(targets.acad_utn(0x500002), Some(tracker_utn));
        assert_eq!(assoc.pending(), &[far]);
        assert_eq!(assoc.stats().sensor_reports_associated, 2);
        assert_eq!(assoc.stats().sensor_targets_created, 1);
    }

    #[test]
    fn test_self_association_merges_acad_and_callsign_targets() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(21, 1, 47.0, &times(0.0, 30.0, 2.0), |tr| {
            tr.with_acad(0x4CA123).with_mode_a(0o3344, true).with_mode_c(30000.0, true)
        });
        reports.extend(track_reports(48, 2, 47.0, &times(1.0, 29.0, 2.0), |tr| {
            tr.with_acid("RYR12").with_mode_a(0o3344, true).with_mode_c(30000.0, true)
        }));
        let ids = insert_all(&mut store, reports);

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::AssociateSensors, &NeverCancel)
            .unwrap();
        assert_eq!(assoc.targets().len(), 2);

        assoc
            .run_stage(&store, &ids, Stage::SelfAssociate, &NeverCancel)
            .unwrap();

        let targets = assoc.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(assoc.stats().self_merges, 1);
        let utn = targets.acad_utn(0x4CA123).unwrap();
        assert_eq!(targets.acid_utn("RYR12"), Some(utn));
        assert_eq!(targets.get(utn).unwrap().num_associated(), ids.len());
    }

    #[test]
    fn test_retry_picks_up_late_bracket() {
        let mut store = ReportStore::new();
        let a = store
            .insert(TargetReport::new(21, 1, 6.0).with_position(47.006, 11.0).with_acad(0x777777))
            .unwrap();
        let anon = store
            .insert(TargetReport::new(48, 2, 7.0).with_position(47.007, 11.0))
            .unwrap();
        let b = store
            .insert(TargetReport::new(21, 1, 8.0).with_position(47.008, 11.0).with_acad(0x777777))
            .unwrap();
        let ids = vec![a, anon, b];

        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::AssociateSensors, &NeverCancel)
            .unwrap();
        assert_eq!(assoc.pending(), &[anon]);

        assoc
            .run_stage(&store, &ids, Stage::RetryUnassociated, &NeverCancel)
            .unwrap();
        assert!(assoc.pending().is_empty());
        assert_eq!(assoc.stats().retry_associated, 1);
        let utn = assoc.targets().acad_utn(0x777777).unwrap();
        assert!(assoc.targets().get(utn).unwrap().contains(&store, anon));
    }

    #[test]
    fn test_tally_is_idempotent() {
        let mut store = ReportStore::new();
        let ids = insert_all(
            &mut store,
            vec![
                TargetReport::new(48, 1, 0.0).with_position(47.0, 11.0),
                TargetReport::new(48, 1, 1.0).with_position(10.0, 11.0),
            ],
        );

        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(outcome, PassOutcome::Completed);
        let first = assoc.unassociated().clone();
        assert_eq!(first.len(), 2);

        assoc.run_stage(&store, &ids, Stage::Tally, &NeverCancel).unwrap();
        assert_eq!(assoc.unassociated(), &first);
        assert_eq!(assoc.stats().unassociated, 2);
    }

    #[test]
    fn test_slice_flags_cleared_after_pass() {
        let mut store = ReportStore::new();
        let ids = insert_all(
            &mut store,
            track_reports(21, 1, 47.0, &times(0.0, 4.0, 2.0), |tr| tr.with_acad(0x101010)),
        );
        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(assoc.targets().len(), 1);
        assert!(assoc.targets().created_in_current_slice().is_empty());
    }

    #[test]
    fn test_cancel_before_first_stage() {
        let mut store = ReportStore::new();
        let ids = insert_all(
            &mut store,
            track_reports(21, 1, 47.0, &times(0.0, 4.0, 2.0), |tr| tr.with_acad(0x101010)),
        );
        let cancel = AtomicBool::new(true);
        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc.associate_new_data(&store, &ids, &cancel).unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled(Stage::SeedReference));
        assert!(assoc.targets().is_empty());
    }

    #[test]
    fn test_cancel_mid_stage_keeps_completed_stages() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(62, 1, 47.0, &[0.0, 2.0], |tr| tr.with_track(1, false));
        reports.extend((0..5).map(|i| {
            TargetReport::new(21, 3, 10.0 + i as f64)
                .with_position(30.0 + i as f64, 11.0)
                .with_acad(0x600000 + i)
        }));
        let ids = insert_all(&mut store, reports);

        let cancel = CancelAfter::new(7);
        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc.associate_new_data(&store, &ids, &cancel).unwrap();

        assert_eq!(outcome, PassOutcome::Cancelled(Stage::AssociateSensors));
        // Tracker target committed, sensor work discarded
        assert_eq!(assoc.targets().len(), 1);
        assert_eq!(assoc.stats().tracker_targets_created, 1);
        assert_eq!(assoc.stats().sensor_targets_created, 0);
    }

    #[test]
    fn test_observer_sees_every_stage() {
        let mut store = ReportStore::new();
        let ids = insert_all(&mut store, vec![TargetReport::new(21, 1, 0.0).with_acad(0x1)]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut assoc = Associator::new(Settings::default());
        assoc.add_observer(Box::new(Recorder(seen.clone())));
        assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();

        assert_eq!(*seen.lock().unwrap(), Stage::ALL.to_vec());
    }

    #[test]
    fn test_known_track_continues_across_slices() {
        let mut store = ReportStore::new();
        let build = |tr: TargetReport| tr.with_track(1, false).with_mode_a(0o1234, true);
        let first = insert_all(&mut store, track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), build));
        let second = insert_all(&mut store, track_reports(62, 1, 47.0, &times(22.0, 40.0, 2.0), build));

        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &first, &NeverCancel).unwrap();
        assert_eq!(assoc.targets().track_entry(1, 1).map(|e| e.1), Some(20.0));

        assoc.associate_new_data(&store, &second, &NeverCancel).unwrap();
        assert_eq!(assoc.targets().len(), 1);
        assert_eq!(assoc.stats().tracker_targets_created, 1);
        let (utn, last) = assoc.targets().track_entry(1, 1).unwrap();
        assert_eq!(last, 40.0);
        assert_eq!(assoc.targets().get(utn).unwrap().num_associated(), 21);
    }

    #[test]
    fn test_stale_track_starts_new_target() {
        let mut store = ReportStore::new();
        let build = |tr: TargetReport| tr.with_track(1, false);
        let first = insert_all(&mut store, track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), build));
        let second =
            insert_all(&mut store, track_reports(62, 1, 47.0, &times(400.0, 410.0, 2.0), build));

        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &first, &NeverCancel).unwrap();
        let old_utn = assoc.targets().track_entry(1, 1).unwrap().0;

        assoc.associate_new_data(&store, &second, &NeverCancel).unwrap();
        assert_eq!(assoc.targets().len(), 2);
        let new_utn = assoc.targets().track_entry(1, 1).unwrap().0;
        assert_ne!(old_utn, new_utn);
        assert!(new_utn > old_utn);
    }

    #[test]
    fn test_mixed_sources_end_to_end() {
        let mut store = ReportStore::new();
        let mut reports = Vec::new();

        // Aircraft A: reference, tracker and ADS-B
        reports.extend(track_reports(255, 100, 47.0, &times(0.0, 20.0, 1.0), |tr| {
            tr.with_track(1, false).with_acad(0xA0A0A0).with_mode_a(0o1000, true)
        }));
        reports.extend(track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(5, false).with_acad(0xA0A0A0).with_mode_a(0o1000, true)
        }));
        reports.extend(track_reports(21, 3, 47.0, &times(0.5, 19.5, 1.0), |tr| {
            tr.with_acad(0xA0A0A0).with_mode_a(0o1000, true)
        }));

        // Aircraft B: tracker without ACAD plus anonymous radar
        reports.extend(track_reports(62, 1, 48.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(6, false).with_mode_a(0o2000, true)
        }));
        reports.extend(track_reports(48, 7, 48.0001, &times(1.0, 19.0, 2.0), |tr| {
            tr.with_mode_a(0o2000, true)
        }));

        // Aircraft C: ADS-B only
        reports.extend(track_reports(21, 3, 49.0, &times(0.0, 20.0, 1.0), |tr| tr.with_acad(0xC0C0C0)));

        // Nothing near this one
        reports.push(TargetReport::new(48, 7, 10.0).with_position(30.0, 11.0));

        let ids = insert_all(&mut store, reports);
        let far = *ids.last().unwrap();

        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(outcome, PassOutcome::Completed);

        let targets = assoc.targets();
        assert_eq!(targets.len(), 3);

        let a = targets.get(targets.acad_utn(0xA0A0A0).unwrap()).unwrap();
        assert_eq!(a.category_count(255), 21);
        assert_eq!(a.category_count(62), 11);
        assert_eq!(a.category_count(21), 20);

        let b_utn = targets.track_entry(1, 6).unwrap().0;
        let b = targets.get(b_utn).unwrap();
        assert_eq!(b.category_count(48), 10);
        assert!(!b.has_acad());

        let c = targets.get(targets.acad_utn(0xC0C0C0).unwrap()).unwrap();
        assert_eq!(c.num_associated(), 21);

        let stats = assoc.stats();
        assert_eq!(stats.reference_targets_created, 1);
        assert_eq!(stats.tracker_targets_created, 1);
        assert_eq!(stats.transient_targets_merged, 1);
        assert_eq!(stats.multi_source_targets, 1);
        assert_eq!(stats.single_source_targets, 1);
        assert_eq!(stats.sensor_targets_created, 1);
        assert_eq!(stats.self_merges, 0);
        assert_eq!(assoc.unassociated().iter().copied().collect::<Vec<_>>(), vec![far]);
        assert!(targets.check_acad_lookup().is_empty());
    }

    #[test]
    fn test_stage_by_stage_matches_full_pass() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
            tr.with_track(3, false).with_mode_a(0o5100, true)
        });
        reports.extend(track_reports(48, 2, 47.0001, &times(1.0, 19.0, 2.0), |tr| {
            tr.with_mode_a(0o5100, true)
        }));
        let ids = insert_all(&mut store, reports);

        let mut full = Associator::new(Settings::default());
        full.associate_new_data(&store, &ids, &NeverCancel).unwrap();

        let mut staged = Associator::new(Settings::default());
        for stage in Stage::ALL {
            let outcome = staged.run_stage(&store, &ids, stage, &NeverCancel).unwrap();
            assert_eq!(outcome, StageOutcome::Completed);
        }

        assert_eq!(full.stats(), staged.stats());
        assert_eq!(full.targets().len(), staged.targets().len());
        assert_eq!(full.unassociated(), staged.unassociated());
    }

    #[test]
    fn test_reset_drops_everything() {
        let mut store = ReportStore::new();
        let ids = insert_all(&mut store, vec![TargetReport::new(21, 1, 0.0).with_acad(0x1)]);
        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(assoc.targets().len(), 1);

        assoc.reset();
        assert!(assoc.targets().is_empty());
        assert_eq!(assoc.stats(), &AssociationStats::default());
        assert_eq!(assoc.targets().acad_utn(0x1), None);
    }

    #[test]
    fn test_drifted_report_drops_track_lookup() {
        let mut store = ReportStore::new();
        let first = insert_all(
            &mut store,
            track_reports(62, 1, 47.0, &times(0.0, 20.0, 2.0), |tr| {
                tr.with_track(1, false).with_mode_a(0o1111, true)
            }),
        );
        let stray = store
            .insert(
                TargetReport::new(62, 1, 11.0)
                    .with_position(48.0, 11.0)
                    .with_track(1, false)
                    .with_mode_a(0o2222, true),
            )
            .unwrap();

        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &first, &NeverCancel).unwrap();
        let old_utn = assoc.targets().track_entry(1, 1).unwrap().0;

        assoc.associate_new_data(&store, &[stray], &NeverCancel).unwrap();

        let targets = assoc.targets();
        assert_eq!(targets.len(), 2);
        let old = targets.get(old_utn).unwrap();
        assert_eq!(old.num_associated(), 11);
        assert!(!old.contains(&store, stray));
        let (new_utn, last) = targets.track_entry(1, 1).unwrap();
        assert_ne!(new_utn, old_utn);
        assert_eq!(last, 11.0);
        assert!(targets.get(new_utn).unwrap().contains(&store, stray));
    }

    #[test]
    fn test_acad_switch_across_slices_starts_new_target() {
        let mut store = ReportStore::new();
        let first = insert_all(
            &mut store,
            track_reports(62, 1, 47.0, &times(0.0, 10.0, 2.0), |tr| {
                tr.with_track(5, false).with_acad(0xAAAAAA)
            }),
        );
        let second = insert_all(
            &mut store,
            track_reports(62, 1, 50.0, &times(12.0, 20.0, 2.0), |tr| {
                tr.with_track(5, false).with_acad(0xBBBBBB)
            }),
        );

        let mut assoc = Associator::new(Settings::default());
        assoc.associate_new_data(&store, &first, &NeverCancel).unwrap();
        assoc.associate_new_data(&store, &second, &NeverCancel).unwrap();

        let targets = assoc.targets();
        assert_eq!(targets.len(), 2);
        let a = targets.acad_utn(0xAAAAAA).unwrap();
        let b = targets.acad_utn(0xBBBBBB).unwrap();
        assert_ne!(a, b);
        assert_eq!(targets.track_entry(1, 5).unwrap().0, b);
        assert_eq!(targets.get(a).unwrap().num_associated(), first.len());
        assert_eq!(targets.get(b).unwrap().num_associated(), second.len());
    }

    #[test]
    fn test_non_mode_s_association_disabled() {
        let mut store = ReportStore::new();
        let mut reports = track_reports(62, 1, 47.0, &times(0.0, 30.0, 2.0), |tr| {
            tr.with_track(11, false).with_mode_a(0o2345, true).with_mode_c(20000.0, true)
        });
        reports.extend(track_reports(62, 2, 47.0002, &times(1.0, 29.0, 2.0), |tr| {
            tr.with_track(77, false).with_mode_a(0o2345, true).with_mode_c(20000.0, true)
        }));
        reports.push(
            TargetReport::new(48, 3, 10.0)
                .with_position(47.01, 11.0)
                .with_mode_a(0o2345, true),
        );
        let ids = insert_all(&mut store, reports);
        let anon = *ids.last().unwrap();

        let settings = Settings {
            associate_non_mode_s: false,
            ..Settings::default()
        };
        let mut assoc = Associator::new(settings);
        let outcome = assoc.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(outcome, PassOutcome::Completed);

        let targets = assoc.targets();
        assert_eq!(targets.len(), 2);
        assert_ne!(targets.track_entry(1, 11).unwrap().0, targets.track_entry(2, 77).unwrap().0);
        assert!(assoc.unassociated().contains(&anon));
        let stats = assoc.stats();
        assert_eq!(stats.transient_targets_merged, 0);
        assert_eq!(stats.self_merges, 0);
        assert_eq!(stats.sensor_reports_associated, 0);

        // Same data with the search enabled ends up as one target
        let mut enabled = Associator::new(Settings::default());
        enabled.associate_new_data(&store, &ids, &NeverCancel).unwrap();
        assert_eq!(enabled.targets().len(), 1);
    }

    #[test]
    fn test_track_end_not_continued_without_non_mode_s() {
        let mut store = ReportStore::new();
        let first = times(0.0, 10.0, 2.0);
        let last_t = *first.last().unwrap();
        let mut reports = track_reports(62, 1, 47.0, &first, |tr| {
            let ended = tr.timestamp == last_t;
            tr.with_track(1, ended).with_mode_a(0o4455, true)
        });
        reports.extend(track_reports(62, 1, 47.0, &times(14.0, 20.0, 2.0), |tr| {
            tr.with_track(2, false).with_mode_a(0o4455, true)
        }));
        let ids = insert_all(&mut store, reports);

        let settings = Settings {
            associate_non_mode_s: false,
            ..Settings::default()
        };
        let mut assoc = Associator::new(settings);
        assoc
            .run_stage(&store, &ids, Stage::MergePrimaryTracker, &NeverCancel)
            .unwrap();

        assert_eq!(assoc.targets().len(), 2);
        assert_ne!(
            assoc.targets().track_entry(1, 1).unwrap().0,
            assoc.targets().track_entry(1, 2).unwrap().0
        );
    }

    #[test]
    fn test_snapshot_only_for_interruptible_stages() {
        let mut store = ReportStore::new();
        let ids = insert_all(&mut store, vec![TargetReport::new(21, 1, 0.0).with_acad(0x1)]);
        let settings = Settings::default();
        let registry = CategoryRegistry::default();
        let ctx = PassContext {
            store: &store,
            settings: &settings,
            registry: &registry,
            estimator: None,
            cancel: &NeverCancel,
            new_ids: &ids,
        };
        let mut state = PassState::default();

        let snapshotted = |state: &PassState| {
            Stage::ALL
                .into_iter()
                .filter(|s| s.needs_snapshot(&ctx, state))
                .collect::<Vec<_>>()
        };
        assert_eq!(snapshotted(&state), vec![Stage::AssociateSensors]);

        let utn = state.targets.create();
        state.targets.associate(&store, ids[0], utn, false);
        state.pending.push(ids[0]);
        assert_eq!(
            snapshotted(&state),
            vec![Stage::AssociateSensors, Stage::SelfAssociate, Stage::RetryUnassociated]
        );
    }

    #[test]
    fn test_cancelled_lookup_check_leaves_state_untouched() {
        let mut store = ReportStore::new();
        let ids = insert_all(&mut store, vec![TargetReport::new(21, 1, 0.0).with_acad(0x424242)]);
        let mut assoc = Associator::new(Settings::default());
        assoc
            .run_stage(&store, &ids, Stage::AssociateSensors, &NeverCancel)
            .unwrap();
        assoc.state.targets.acad_lookup.clear();

        // First poll passes, the stage's own poll cancels
        let outcome = assoc
            .run_stage(&store, &ids, Stage::CheckLookup, &CancelAfter::new(1))
            .unwrap();
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert_eq!(assoc.targets().acad_utn(0x424242), None);
        assert_eq!(assoc.stats().lookup_issues, 0);

        let outcome = assoc
            .run_stage(&store, &ids, Stage::CheckLookup, &NeverCancel)
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert!(assoc.targets().acad_utn(0x424242).is_some());
        assert_eq!(assoc.stats().lookup_issues, 1);
    }

    #[test]
    fn test_pending_from_cancelled_pass_is_tallied() {
        let mut store = ReportStore::new();
        let far = store
            .insert(TargetReport::new(48, 1, 0.0).with_position(30.0, 11.0))
            .unwrap();

        // Polls: three stage entries, one sensor report, then the lookup check
        let mut assoc = Associator::new(Settings::default());
        let outcome = assoc.associate_new_data(&store, &[far], &CancelAfter::new(4)).unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled(Stage::CheckLookup));
        assert_eq!(assoc.pending(), &[far]);
        assert!(assoc.unassociated().is_empty());

        let outcome = assoc.associate_new_data(&store, &[], &NeverCancel).unwrap();
        assert_eq!(outcome, PassOutcome::Completed);
        assert!(assoc.pending().is_empty());
        assert!(assoc.unassociated().contains(&far));
        assert_eq!(assoc.stats().unassociated, 1);
    }

    #[test]
    fn test_unknown_record_rejected() {
        let store = ReportStore::new();
        let mut assoc = Associator::new(Settings::default());
        let res = assoc.associate_new_data(&store, &[RecNum::new(21, 0)], &NeverCancel);
        assert!(matches!(res, Err(ReconError::UnknownRecord(_))));
    }
}
