use crate::model::{Dims3, PyramidModel};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Initial level, clamped to the levels available.
    pub level: usize,
    /// Output window as `[width, height, depth]`; derived from level 0 if unset.
    pub output_dims: Option<[usize; 3]>,
    pub max_volume_size: usize,
    pub max_texture_size: usize,
    pub channel: usize,
    /// Chunks kept in the cache.
    pub cache_size: usize,
    pub max_visible_chunks: usize,
    /// Pause before each pass so bursts of requests collapse; 0 just yields.
    pub frame_interval_ms: u64,
    pub convert_units_to_mm: bool,
}
impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            level: 0,
            output_dims: None,
            max_volume_size: 256,
            max_texture_size: 2048,
            channel: 0,
            cache_size: 500,
            max_visible_chunks: 1000,
            frame_interval_ms: 16,
            convert_units_to_mm: true,
        }
    }
}

impl StreamerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid streamer config")
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        Self::from_json(&json).with_context(|| format!("parsing {path}"))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// The output window for `pyramid`: the configured dims, else level 0 if
    /// it fits in a texture, else a cube of the largest allowed edge.
    pub fn output_dims_for(&self, pyramid: &PyramidModel) -> Dims3 {
        let depth_for = |d: usize| if pyramid.is_3d() { d } else { 1 };
        if let Some([w, h, d]) = self.output_dims {
            return Dims3::new(w.max(1), h.max(1), depth_for(d.max(1)));
        }
        let edge = self.max_volume_size.min(self.max_texture_size).max(1);
        let level0 = pyramid.levels().first().map(|l| l.dims()).unwrap_or_default();
        if level0.max_edge() <= edge {
            Dims3::new(level0.width, level0.height, depth_for(level0.depth))
        } else {
            Dims3::new(edge, edge, depth_for(edge))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{cube_pyramid, level, space};

    #[test]
    fn defaults_fill_missing_fields() {
        let config = StreamerConfig::from_json(r#"{"channel": 2, "frame_interval_ms": 0}"#).unwrap();
        assert_eq!(config.channel, 2);
        assert_eq!(config.cache_size, 500);
        assert_eq!(config.max_visible_chunks, 1000);
        assert_eq!(config.frame_interval(), Duration::ZERO);
        assert!(StreamerConfig::from_json("[1]").is_err());
    }

    #[test]
    fn derives_output_dims() {
        let config = StreamerConfig::default();
        // level 0 is 100^3, fits
        assert_eq!(config.output_dims_for(&cube_pyramid()), Dims3::new(100, 100, 100));

        let big = PyramidModel::new(
            "big",
            vec![space("y", 5000), space("x", 3000)],
            vec![level(0, &[5000, 3000], &[256, 256])],
        )
        .unwrap();
        assert_eq!(config.output_dims_for(&big), Dims3::new(256, 256, 1));

        let fixed = StreamerConfig {
            output_dims: Some([64, 32, 16]),
            ..Default::default()
        };
        assert_eq!(fixed.output_dims_for(&cube_pyramid()), Dims3::new(64, 32, 16));
        assert_eq!(fixed.output_dims_for(&big), Dims3::new(64, 32, 1));
    }
}
