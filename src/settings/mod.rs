use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// When a subdividing parent may stop rendering itself and defer to its
/// children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildPromotionPolicy {
    /// All four children must hold merged data.
    #[default]
    AllFour,
    /// A "good enough" subset; the parent keeps covering the rest.
    Partial(u8),
}

impl ChildPromotionPolicy {
    pub fn required(&self) -> u8 {
        match self {
            ChildPromotionPolicy::AllFour => 4,
            ChildPromotionPolicy::Partial(n) => (*n).min(4),
        }
    }
}

/// Terrain engine configuration. Immutable once the engine is built; every
/// component reads it through the tile host.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TerrainSettings {
    /// Vertices per tile edge. Ideally a power of two plus one.
    pub tile_size: u32,
    /// Lowest level of detail at which root tiles are seeded.
    pub first_level_of_detail: u32,
    /// Tiles never subdivide beyond this level, even if finer data exists.
    pub max_level_of_detail: u32,
    /// Screen-space error threshold, in pixels, above which a tile
    /// subdivides.
    pub screen_space_error: f32,
    /// Skirt depth as a fraction of tile width. 0 disables skirts.
    pub skirt_ratio: f32,
    /// RGBA fallback color for tiles with no imagery yet.
    pub color: [f32; 4],
    /// Worker threads servicing tile loads.
    pub concurrency: u32,
    /// Maximum tile merges per update frame. 0 = unlimited.
    pub merges_per_frame: u32,
    /// Frames a tile may go unpinged before it is eligible to expire.
    pub min_frames_before_unload: u32,
    /// Seconds a tile may go unpinged before it is eligible to expire.
    /// Both the frame and time thresholds must pass; frames stall while
    /// time rolls on when the window is dragged.
    pub min_seconds_before_unload: f64,
    /// Cap on tiles expired in a single frame.
    pub max_tiles_to_unload_per_frame: u32,
    /// Resident-tile floor below which nothing expires.
    pub min_resident_tiles: u32,
    /// Parent-to-children promotion policy.
    pub child_promotion: ChildPromotionPolicy,
}

impl Default for TerrainSettings {
    fn default() -> Self {
        Self {
            tile_size: 17,
            first_level_of_detail: 0,
            max_level_of_detail: 19,
            screen_space_error: 128.0,
            skirt_ratio: 0.0,
            color: [1.0, 1.0, 1.0, 1.0],
            concurrency: 4,
            merges_per_frame: 0,
            min_frames_before_unload: 3,
            min_seconds_before_unload: 0.0,
            max_tiles_to_unload_per_frame: u32::MAX,
            min_resident_tiles: 0,
            child_promotion: ChildPromotionPolicy::AllFour,
        }
    }
}

impl TerrainSettings {
    /// Reads settings from a JSON file. Missing fields fall back to their
    /// defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Io(err) => write!(f, "failed to read settings: {err}"),
            SettingsError::Parse(err) => write!(f, "failed to parse settings: {err}"),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Io(err) => Some(err),
            SettingsError::Parse(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for SettingsError {
    fn from(value: std::io::Error) -> Self {
        SettingsError::Io(value)
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(value: serde_json::Error) -> Self {
        SettingsError::Parse(value)
    }
}
