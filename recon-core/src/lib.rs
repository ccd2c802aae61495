//! recon-core: Association of surveillance reports into reconstructed targets.
//!
//! No async, no I/O beyond the config file: a report store, the target
//! aggregate, candidate scoring and the staged associator. Shared by the
//! `recon` CLI and anything embedding the pipeline.

pub mod associator;
pub mod config;
pub mod geo;
pub mod scoring;
pub mod store;
pub mod target;
pub mod types;

// Re-export commonly used types at crate root
pub use associator::{
    AssociationStats, Associator, CancelCheck, CategoryRegistry, CategoryRole, NeverCancel,
    PassObserver, PassOutcome, Stage, StageOutcome, Targets,
};
pub use config::Settings;
pub use scoring::{AccuracyEstimator, DistanceClass, Scorer};
pub use store::ReportStore;
pub use target::{DataFor, Interpolation, ReconstructorTarget};
pub use types::*;
