use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(range(min = 1024))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialConfig {
    /// Device path; autodetected when absent.
    pub port: Option<String>,
    pub baud: u32,
    #[validate(range(min = 1))]
    pub ack_timeout_ms: u64,
    /// Pause after each un-acked write. The controller's input buffer is
    /// small and overflows when commands are not paced.
    pub write_delay_ms: u64,
    /// Pause after opening the port before it is considered usable.
    pub stabilize_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            ack_timeout_ms: 1000,
            write_delay_ms: 5,
            stabilize_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraConfig {
    pub index: u32,
    #[validate(range(min = 1, max = 20))]
    pub open_attempts: u32,
    pub retry_delay_ms: u64,
    /// Delay before the first open attempt, giving a frontend preview time
    /// to release the device.
    pub prestart_delay_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            open_attempts: 5,
            retry_delay_ms: 1000,
            prestart_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct MappingConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_brightness: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_brightness: f32,
    /// Settle after clearing the strip at session start.
    pub start_settle_ms: u64,
    /// Settle after illuminating an LED, covering LED response and camera
    /// exposure latency.
    pub settle_ms: u64,
    /// Settle after a brightness reduction.
    pub reduce_settle_ms: u64,
    /// Total LED-on window per LED.
    pub window_ms: u64,
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    pub max_reductions: u32,
    #[validate(range(min = 0.1, max = 0.99))]
    pub decay: f32,
    pub tolerance: u8,
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    pub output: PathBuf,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            min_brightness: 0.1,
            max_brightness: 1.0,
            start_settle_ms: 500,
            settle_ms: 50,
            reduce_settle_ms: 30,
            window_ms: 200,
            max_attempts: 10,
            max_reductions: 3,
            decay: 0.8,
            tolerance: 2,
            failure_threshold: 5,
            output: PathBuf::from("mapping.json"),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub serial: SerialConfig,
    #[validate(nested)]
    pub camera: CameraConfig,
    #[validate(nested)]
    pub mapping: MappingConfig,
}

impl Config {
    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(path).await?;
        let mut full = String::new();
        file.read_to_string(&mut full).await?;

        let config: Config = toml::from_str(&full)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Normalized region of the camera frame scanned for a lit LED.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_roi_bounds", message = "roi exceeds frame"))]
pub struct Roi {
    #[validate(range(min = 0., max = 1.))]
    pub x: f32,
    #[validate(range(min = 0., max = 1.))]
    pub y: f32,
    #[validate(range(min = 0., max = 1.))]
    pub w: f32,
    #[validate(range(min = 0., max = 1.))]
    pub h: f32,
}

/// Validate that the region does not extend past the frame edge
fn validate_roi_bounds(roi: &Roi) -> Result<(), validator::ValidationError> {
    if roi.x + roi.w > 1. {
        return Err(validator::ValidationError::new("roi_out_of_frame"));
    }

    if roi.y + roi.h > 1. {
        return Err(validator::ValidationError::new("roi_out_of_frame"));
    }

    Ok(())
}

impl Roi {
    /// Resolve to pixel bounds, fixed for the lifetime of a session. Always
    /// at least 1x1 and fully inside the frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> RoiPixels {
        let x = ((self.x * width as f32) as u32).min(width.saturating_sub(1));
        let y = ((self.y * height as f32) as u32).min(height.saturating_sub(1));
        let w = ((self.w * width as f32) as u32).max(1).min(width - x);
        let h = ((self.h * height as f32) as u32).max(1).min(height - y);

        RoiPixels { x, y, w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiPixels {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Per-LED mapping outcome. `NotFound` is kept distinct from a coordinate
/// internally; it only collapses to the `(0,0)` sentinel at the
/// persistence/status boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedRecord {
    Found { x: f32, y: f32 },
    NotFound,
}

impl LedRecord {
    pub fn is_found(&self) -> bool {
        matches!(self, LedRecord::Found { .. })
    }

    pub fn encode(&self) -> [f32; 2] {
        match *self {
            LedRecord::Found { x, y } => [x, y],
            LedRecord::NotFound => [0., 0.],
        }
    }

    pub fn decode(coords: [f32; 2]) -> Self {
        if coords == [0., 0.] {
            LedRecord::NotFound
        } else {
            LedRecord::Found {
                x: coords[0],
                y: coords[1],
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MappingFileError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error processing JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The persisted mapping result. Coordinates are normalized to the full
/// camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub coordinates: Vec<[f32; 2]>,
    pub roi: Roi,
    pub frame_width: u32,
    pub frame_height: u32,
    pub total_processed: usize,
    pub found_count: usize,
    pub consecutive_failures_at_stop: u32,
}

impl MappingRecord {
    pub fn from_records(
        records: &[LedRecord],
        roi: Roi,
        width: u32,
        height: u32,
        failures: u32,
    ) -> Self {
        Self {
            coordinates: records.iter().map(LedRecord::encode).collect(),
            roi,
            frame_width: width,
            frame_height: height,
            total_processed: records.len(),
            found_count: records.iter().filter(|record| record.is_found()).count(),
            consecutive_failures_at_stop: failures,
        }
    }

    pub fn records(&self) -> Vec<LedRecord> {
        self.coordinates.iter().map(|&c| LedRecord::decode(c)).collect()
    }

    pub async fn save(&self, path: &Path) -> Result<(), MappingFileError> {
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, MappingFileError> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
