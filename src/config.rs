//! Renderer configuration
//!
//! Loaded from a JSON file; every field has a default so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::streaming::MeshingOrder;

/// World layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Number of regions, fixed for the lifetime of the streamer
    pub num_regions: u32,
    /// Regions per row of the region grid along Z
    pub grid_width: u32,
    /// Terrain seed
    pub seed: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            num_regions: 16,
            grid_width: 16,
            seed: 0,
        }
    }
}

/// Region meshing pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of reusable staging slots (batch size)
    pub staging_slots: u32,
    /// Order pending regions are picked for meshing
    pub order: MeshingOrder,
    /// Upper bound on every streaming wait; `None` waits forever
    pub fence_timeout_ms: Option<u64>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            staging_slots: 8,
            order: MeshingOrder::Index,
            fence_timeout_ms: None,
        }
    }
}

impl StreamingConfig {
    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            title: "voxmesh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub look_at: [f32; 3],
    /// Units per second
    pub speed: f32,
    /// Radians per pixel
    pub sensitivity: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [-8.0, 24.0, -8.0],
            look_at: [16.0, 8.0, 16.0],
            speed: 10.0,
            sensitivity: 0.003,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    pub world: WorldConfig,
    pub streaming: StreamingConfig,
    pub window: WindowConfig,
    pub camera: CameraConfig,
    /// Default log filter when `RUST_LOG` is unset
    pub log_filter: Option<String>,
    /// Directory to load WGSL programs from instead of the built-in ones
    pub shader_dir: Option<PathBuf>,
}

impl RendererConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.world.num_regions == 0 {
            return Err(Error::Config("world.num_regions must be at least 1".into()));
        }
        if self.world.grid_width == 0 {
            return Err(Error::Config("world.grid_width must be at least 1".into()));
        }
        if self.streaming.staging_slots == 0 {
            return Err(Error::Config("streaming.staging_slots must be at least 1".into()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config("window size must be non-zero".into()));
        }
        if self.streaming.fence_timeout_ms == Some(0) {
            return Err(Error::Config("streaming.fence_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Apply `--config`, `--regions`, `--slots` and `--timeout-ms` from the command line
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = match flag_value(args, "--config") {
            Some(path) => Self::load(Path::new(path))?,
            None => Self::default(),
        };
        if let Some(value) = flag_value(args, "--regions") {
            config.world.num_regions = parse_flag("--regions", value)?;
        }
        if let Some(value) = flag_value(args, "--slots") {
            config.streaming.staging_slots = parse_flag("--slots", value)?;
        }
        if let Some(value) = flag_value(args, "--timeout-ms") {
            config.streaming.fence_timeout_ms = Some(parse_flag("--timeout-ms", value)?);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Value following `flag`, if present
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {flag}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.world.num_regions, 16);
        assert_eq!(config.streaming.staging_slots, 8);
        assert_eq!(config.streaming.order, MeshingOrder::Index);
        assert_eq!((config.window.width, config.window.height), (640, 480));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("nested").join("voxmesh.json");

        let mut config = RendererConfig::default();
        config.world.num_regions = 10;
        config.streaming.order = MeshingOrder::NearestFirst { origin: [1.0, 2.0, 3.0] };
        config.save(&path).expect("save failed");

        let loaded = RendererConfig::load(&path).expect("load failed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "streaming": { "staging_slots": 4 } }"#).unwrap();

        let loaded = RendererConfig::load(&path).expect("load failed");
        assert_eq!(loaded.streaming.staging_slots, 4);
        assert_eq!(loaded.world, WorldConfig::default());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "streaming": { "staging_slots": 0 } }"#).unwrap();
        assert!(matches!(RendererConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(RendererConfig::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_from_args_overrides() {
        let config = RendererConfig::from_args(&args(&["bin", "--regions", "10", "--slots", "3"]))
            .expect("parse failed");
        assert_eq!(config.world.num_regions, 10);
        assert_eq!(config.streaming.staging_slots, 3);

        let err = RendererConfig::from_args(&args(&["bin", "--slots", "many"]));
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
