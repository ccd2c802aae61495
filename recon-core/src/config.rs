//! Association settings and their config file.
//!
//! Reads/writes `~/.track-recon/config.yaml`, a small sectioned YAML-like
//! file with association windows, distance thresholds and tracker
//! continuation parameters.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::types::{ReconError, Result};

/// Every tunable of the association pipeline.
///
/// Times are in seconds, distances in meters, altitudes in feet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    // association
    pub max_time_diff: f64,
    pub track_max_time_diff: f64,
    pub max_altitude_diff: f32,
    pub associate_non_mode_s: bool,

    // distance
    pub max_distance_acceptable: f64,
    pub max_distance_dubious: f64,
    pub max_distance_notok: f64,
    pub track_disassoc_factor: f64,

    // self-association
    pub prob_min_time_overlap: f64,
    pub min_updates: usize,
    pub max_positions_dubious_verified_rate: f64,
    pub max_positions_dubious_unknown_rate: f64,

    // tracker
    pub cont_max_time_diff_tracker: f64,
    pub cont_max_distance_acceptable_tracker: f64,
    pub track_gap: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_time_diff: 5.0,
            track_max_time_diff: 300.0,
            max_altitude_diff: 300.0,
            associate_non_mode_s: true,

            max_distance_acceptable: 1852.0,
            max_distance_dubious: 3704.0,
            max_distance_notok: 9260.0,
            track_disassoc_factor: 2.0,

            prob_min_time_overlap: 0.5,
            min_updates: 2,
            max_positions_dubious_verified_rate: 0.5,
            max_positions_dubious_unknown_rate: 0.3,

            cont_max_time_diff_tracker: 30.0,
            cont_max_distance_acceptable_tracker: 1852.0,
            track_gap: 60.0,
        }
    }
}

impl Settings {
    /// Thresholds must ascend and no window may be negative.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_distance_acceptable < self.max_distance_dubious
            && self.max_distance_dubious < self.max_distance_notok)
        {
            return Err(ReconError::Config(format!(
                "distance thresholds must ascend: acceptable {} dubious {} notok {}",
                self.max_distance_acceptable, self.max_distance_dubious, self.max_distance_notok
            )));
        }

        let non_negative = [
            ("max_time_diff", self.max_time_diff),
            ("track_max_time_diff", self.track_max_time_diff),
            ("max_altitude_diff", self.max_altitude_diff as f64),
            ("max_distance_acceptable", self.max_distance_acceptable),
            ("track_disassoc_factor", self.track_disassoc_factor),
            ("cont_max_time_diff_tracker", self.cont_max_time_diff_tracker),
            (
                "cont_max_distance_acceptable_tracker",
                self.cont_max_distance_acceptable_tracker,
            ),
            ("track_gap", self.track_gap),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(ReconError::Config(format!("{name} must be >= 0, got {value}")));
            }
        }

        for (name, rate) in [
            ("prob_min_time_overlap", self.prob_min_time_overlap),
            (
                "max_positions_dubious_verified_rate",
                self.max_positions_dubious_verified_rate,
            ),
            (
                "max_positions_dubious_unknown_rate",
                self.max_positions_dubious_unknown_rate,
            ),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ReconError::Config(format!("{name} must be in [0, 1], got {rate}")));
            }
        }

        Ok(())
    }
}

/// Get the config directory path (`~/.track-recon/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".track-recon")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load settings from `path`, or defaults if the file doesn't exist.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)?;
    let settings = parse_settings(&text)?;
    settings.validate()?;
    Ok(settings)
}

/// Write settings to `path`, creating parent directories.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serialize_settings(settings))?;
    Ok(())
}

/// Parse YAML-like settings text. Unknown keys are ignored.
pub fn parse_settings(text: &str) -> Result<Settings> {
    let mut s = Settings::default();
    let mut current_section: Option<String> = None;

    for (line_no, line) in text.lines().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = val.is_empty().then(|| key.to_string());
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        let at = |what: &str| format!("line {}: {section}.{key}: {what}", line_no + 1);

        let num = || parse_float(val).map_err(|e| ReconError::Config(at(&e)));

        match (section, key) {
            ("association", "max_time_diff") => s.max_time_diff = num()?,
            ("association", "track_max_time_diff") => s.track_max_time_diff = num()?,
            ("association", "max_altitude_diff") => s.max_altitude_diff = num()? as f32,
            ("association", "associate_non_mode_s") => {
                s.associate_non_mode_s = parse_bool(val).map_err(|e| ReconError::Config(at(&e)))?
            }
            ("distance", "max_distance_acceptable") => s.max_distance_acceptable = num()?,
            ("distance", "max_distance_dubious") => s.max_distance_dubious = num()?,
            ("distance", "max_distance_notok") => s.max_distance_notok = num()?,
            ("distance", "track_disassoc_factor") => s.track_disassoc_factor = num()?,
            ("self_association", "prob_min_time_overlap") => s.prob_min_time_overlap = num()?,
            ("self_association", "min_updates") => {
                s.min_updates = val
                    .parse()
                    .map_err(|_| ReconError::Config(at(&format!("invalid integer '{val}'"))))?
            }
            ("self_association", "max_positions_dubious_verified_rate") => {
                s.max_positions_dubious_verified_rate = num()?
            }
            ("self_association", "max_positions_dubious_unknown_rate") => {
                s.max_positions_dubious_unknown_rate = num()?
            }
            ("tracker", "cont_max_time_diff") => s.cont_max_time_diff_tracker = num()?,
            ("tracker", "cont_max_distance_acceptable") => {
                s.cont_max_distance_acceptable_tracker = num()?
            }
            ("tracker", "track_gap") => s.track_gap = num()?,
            _ => {}
        }
    }

    Ok(s)
}

fn parse_float(val: &str) -> std::result::Result<f64, String> {
    val.parse().map_err(|_| format!("invalid number '{val}'"))
}

fn parse_bool(val: &str) -> std::result::Result<bool, String> {
    match val {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(format!("invalid boolean '{val}'")),
    }
}

/// Serialize settings to YAML-like text.
pub fn serialize_settings(s: &Settings) -> String {
    let mut lines = vec!["# track-recon configuration".to_string(), String::new()];

    lines.push("association:".into());
    lines.push(format!("  max_time_diff: {}", s.max_time_diff));
    lines.push(format!("  track_max_time_diff: {}", s.track_max_time_diff));
    lines.push(format!("  max_altitude_diff: {}", s.max_altitude_diff));
    lines.push(format!("  associate_non_mode_s: {}", s.associate_non_mode_s));
    lines.push(String::new());

    lines.push("distance:".into());
    lines.push(format!("  max_distance_acceptable: {}", s.max_distance_acceptable));
    lines.push(format!("  max_distance_dubious: {}", s.max_distance_dubious));
    lines.push(format!("  max_distance_notok: {}", s.max_distance_notok));
    lines.push(format!("  track_disassoc_factor: {}", s.track_disassoc_factor));
    lines.push(String::new());

    lines.push("self_association:".into());
    lines.push(format!("  prob_min_time_overlap: {}", s.prob_min_time_overlap));
    lines.push(format!("  min_updates: {}", s.min_updates));
    lines.push(format!(
        "  max_positions_dubious_verified_rate: {}",
        s.max_positions_dubious_verified_rate
    ));
    lines.push(format!(
        "  max_positions_dubious_unknown_rate: {}",
        s.max_positions_dubious_unknown_rate
    ));
    lines.push(String::new());

    lines.push("tracker:".into());
    lines.push(format!("  cont_max_time_diff: {}", s.cont_max_time_diff_tracker));
    lines.push(format!(
        "  cont_max_distance_acceptable: {}",
        s.cont_max_distance_acceptable_tracker
    ));
    lines.push(format!("  track_gap: {}", s.track_gap));

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
