//! Viewport geometry in the pixel space of the active level.
//!
//! The center may sit up to half an output window beyond either edge of the
//! level, never further.

use crate::error::{Result, StreamError};
use crate::model::{ChunkAddress, Dims3, PyramidLevel, PyramidModel};
use crate::volume::ChunkPlacement;
use itertools::iproduct;
use log::warn;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewportState {
    /// `[x, y, z]` in level pixels.
    pub center: [f64; 3],
    pub level: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Viewport {
    level: usize,
    level_dims: Dims3,
    chunk_dims: Dims3,
    output_dims: Dims3,
    center: [f64; 3],
    is_3d: bool,
}

impl Viewport {
    /// A viewport on `level`, centered on the level.
    pub fn new(pyramid: &PyramidModel, level: usize, output_dims: Dims3) -> Result<Self> {
        let info = pyramid.level_info(level)?;
        let is_3d = pyramid.is_3d();
        let output_dims = if is_3d {
            output_dims
        } else {
            Dims3::new(output_dims.width, output_dims.height, 1)
        };
        let mut viewport = Self {
            level,
            level_dims: info.dims(),
            chunk_dims: info.chunk_dims(),
            output_dims,
            center: [0.0; 3],
            is_3d,
        };
        viewport.center = viewport.level_center();
        Ok(viewport)
    }

    pub fn state(&self) -> ViewportState {
        ViewportState {
            center: self.center,
            level: self.level,
        }
    }
    pub fn level(&self) -> usize {
        self.level
    }
    pub fn center(&self) -> [f64; 3] {
        self.center
    }
    pub fn level_dims(&self) -> Dims3 {
        self.level_dims
    }
    pub fn chunk_dims(&self) -> Dims3 {
        self.chunk_dims
    }
    pub fn output_dims(&self) -> Dims3 {
        self.output_dims
    }

    fn level_center(&self) -> [f64; 3] {
        let [w, h, d] = self.level_dims.as_array();
        [w as f64 / 2.0, h as f64 / 2.0, d as f64 / 2.0]
    }

    fn clamp(&mut self) {
        let level = self.level_dims.as_array();
        let output = self.output_dims.as_array();
        for axis in 0..3 {
            let half = output[axis] as f64 / 2.0;
            self.center[axis] = self.center[axis].clamp(-half, level[axis] as f64 + half);
        }
        if !self.is_3d {
            self.center[2] = self.level_center()[2];
        }
    }

    /// Moves the center against a drag of `(dx, dy, dz)`: the content follows
    /// the pointer, so the center moves the opposite way.
    pub fn pan_by(&mut self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        let [x, y, z] = self.center;
        self.set_center([x - dx, y - dy, z - dz])
    }

    pub fn pan_to(&mut self, x: f64, y: f64, z: Option<f64>) -> Result<()> {
        self.set_center([x, y, z.unwrap_or(self.center[2])])
    }

    /// Rejects non-finite coordinates and leaves the center untouched.
    pub(crate) fn set_center(&mut self, center: [f64; 3]) -> Result<()> {
        if let Some(bad) = center.iter().find(|c| !c.is_finite()) {
            return Err(StreamError::NonFiniteCoordinate(*bad));
        }
        self.center = center;
        self.clamp();
        Ok(())
    }

    /// Switches to `level`, rescaling the center proportionally. Returns
    /// false if `level` is already active.
    pub fn set_level(&mut self, pyramid: &PyramidModel, level: usize) -> Result<bool> {
        let info = pyramid.level_info(level)?;
        if level == self.level {
            return Ok(false);
        }
        let old = self.level_dims.as_array();
        let new = info.dims().as_array();
        for axis in 0..3 {
            if old[axis] > 0 {
                self.center[axis] = self.center[axis] / old[axis] as f64 * new[axis] as f64;
            }
        }
        self.apply_level(info);
        self.clamp();
        Ok(true)
    }

    fn apply_level(&mut self, info: &PyramidLevel) {
        self.level = info.index;
        self.level_dims = info.dims();
        self.chunk_dims = info.chunk_dims();
    }

    /// Chunks overlapping the output window, nearest to the window's center
    /// first, at most `max_chunks` of them.
    pub fn visible_chunks(&self, max_chunks: usize) -> Vec<ChunkAddress> {
        let level = self.level_dims.as_array();
        let chunk = self.chunk_dims.as_array();
        let output = self.output_dims.as_array();
        let mut ranges = [(0usize, 0usize); 3];
        for axis in 0..3 {
            let half = output[axis] as f64 / 2.0;
            let min = (self.center[axis] - half).floor().max(0.0);
            let max = (self.center[axis] + half).ceil().min(level[axis] as f64);
            if max <= min {
                return vec![];
            }
            let chunk_size = chunk[axis].max(1);
            let start = min as usize / chunk_size;
            let end = (max as usize).div_ceil(chunk_size).min(level[axis].div_ceil(chunk_size));
            ranges[axis] = (start, end);
        }
        let [(x0, x1), (y0, y1), (z0, z1)] = ranges;

        let total = (x1 - x0) * (y1 - y0) * (z1 - z0);
        if total > max_chunks {
            warn!("Viewport covers {total} chunks, limiting to {max_chunks}");
        }
        let mut chunks: Vec<ChunkAddress> = iproduct!(z0..z1, y0..y1, x0..x1)
            .take(max_chunks)
            .map(|(z, y, x)| ChunkAddress::new(self.level, x, y, self.is_3d.then_some(z)))
            .collect();

        let mid = [
            (x0 + x1) as f64 / 2.0,
            (y0 + y1) as f64 / 2.0,
            (z0 + z1) as f64 / 2.0,
        ];
        let distance = |a: &ChunkAddress| {
            let dx = a.x as f64 + 0.5 - mid[0];
            let dy = a.y as f64 + 0.5 - mid[1];
            let dz = a.z.unwrap_or(0) as f64 + 0.5 - mid[2];
            dx * dx + dy * dy + dz * dz
        };
        chunks.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        chunks
    }

    /// Where chunk `address` with `data_len` decoded elements lands in the
    /// output buffer, or `None` if it is on another level, empty, or entirely
    /// outside the buffer.
    pub fn placement(&self, address: &ChunkAddress, data_len: usize) -> Option<ChunkPlacement> {
        if address.level != self.level {
            return None;
        }
        let chunk = self.chunk_dims.as_array();
        let level = self.level_dims.as_array();
        let output = self.output_dims.as_array();
        let index = [address.x, address.y, address.z.unwrap_or(0)];

        let mut dest = [0i64; 3];
        let mut extent = [0usize; 3];
        for axis in 0..3 {
            let start = index[axis] * chunk[axis];
            extent[axis] = chunk[axis].min(level[axis].saturating_sub(start));
            if extent[axis] == 0 {
                return None;
            }
            let origin = self.center[axis] - output[axis] as f64 / 2.0;
            // round half up
            dest[axis] = (start as f64 - origin + 0.5).floor() as i64;
            if dest[axis] >= output[axis] as i64 || dest[axis] + extent[axis] as i64 <= 0 {
                return None;
            }
        }

        let extent = Dims3::new(extent[0], extent[1], extent[2]);
        // stores may hand out full-size chunks even at the level edge
        let full = self.chunk_dims.volume();
        let (src_width, src_height) = if data_len >= full {
            (chunk[0], chunk[1])
        } else {
            (extent.width, extent.height)
        };
        Some(ChunkPlacement {
            dest,
            extent,
            src_width,
            src_height,
        })
    }
}
