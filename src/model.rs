use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Scalar element type of a pyramid's arrays.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}
impl DataType {
    /// Parses both the numpy style names used by zarr v2 (`<u2`, `|u1`, `f4`)
    /// and the v3 names (`uint16`, `float32`). Byte order is handled by the caller.
    pub fn parse(name: &str) -> Option<DataType> {
        use DataType::*;
        let name = name.trim_start_matches(['<', '>', '|', '=']);
        Some(match name {
            "u1" | "uint8" => U8,
            "i1" | "int8" => I8,
            "u2" | "uint16" => U16,
            "i2" | "int16" => I16,
            "u4" | "uint32" => U32,
            "i4" | "int32" => I32,
            "f4" | "float32" => F32,
            "f8" | "float64" => F64,
            _ => return None,
        })
    }
    pub fn size(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

/// Extent in voxel space, x being the fastest axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dims3 {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}
impl Dims3 {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }
    /// Builds dims from a slowest-to-fastest shape (`[z, y, x]` or `[y, x]`).
    pub fn from_zyx(shape: &[usize]) -> Self {
        match shape {
            [z, y, x] => Self::new(*x, *y, *z),
            [y, x] => Self::new(*x, *y, 1),
            [x] => Self::new(*x, 1, 1),
            _ => Self::new(0, 0, 0),
        }
    }
    pub fn as_array(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }
    pub fn volume(&self) -> usize {
        self.width * self.height * self.depth
    }
    pub fn max_edge(&self) -> usize {
        self.width.max(self.height).max(self.depth)
    }
}
impl Display for Dims3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisKind {
    Space,
    Channel,
    Time,
    Other,
}
impl AxisKind {
    pub fn from_ome(kind: Option<&str>, name: &str) -> AxisKind {
        match (kind, name) {
            (Some("space"), _) => AxisKind::Space,
            (Some("channel"), _) => AxisKind::Channel,
            (Some("time"), _) => AxisKind::Time,
            (Some(_), _) => AxisKind::Other,
            (None, "x" | "y" | "z") => AxisKind::Space,
            (None, "c") => AxisKind::Channel,
            (None, "t") => AxisKind::Time,
            (None, _) => AxisKind::Other,
        }
    }
}

/// One dimension of the stored arrays, in storage order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub kind: AxisKind,
    pub unit: Option<String>,
    /// Extent of this axis at level 0.
    pub size: usize,
}
impl Axis {
    pub fn is_spatial(&self) -> bool {
        self.kind == AxisKind::Space
    }
    fn is_channel(&self) -> bool {
        self.kind == AxisKind::Channel || self.name == "c"
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyramidLevel {
    pub index: usize,
    pub path: String,
    /// Spatial extent, slowest to fastest (`[z, y, x]` or `[y, x]`).
    pub shape: Vec<usize>,
    /// Nominal chunk size, same ordering as `shape`.
    pub chunk_shape: Vec<usize>,
    /// Physical size of a voxel per spatial axis, same ordering as `shape`.
    pub voxel_scale: Vec<f64>,
    pub translation: Option<Vec<f64>>,
    pub dtype: DataType,
}
impl PyramidLevel {
    pub fn dims(&self) -> Dims3 {
        Dims3::from_zyx(&self.shape)
    }
    pub fn chunk_dims(&self) -> Dims3 {
        Dims3::from_zyx(&self.chunk_shape)
    }
    /// Number of chunks along each axis.
    pub fn grid_dims(&self) -> Dims3 {
        let dims = self.dims();
        let chunk = self.chunk_dims();
        Dims3::new(
            dims.width.div_ceil(chunk.width.max(1)),
            dims.height.div_ceil(chunk.height.max(1)),
            dims.depth.div_ceil(chunk.depth.max(1)),
        )
    }
    /// Voxel scale as `[x, y, z]`, 1.0 for missing axes.
    pub fn voxel_size_xyz(&self) -> [f64; 3] {
        let s = &self.voxel_scale;
        match s.len() {
            0 => [1.0; 3],
            1 => [s[0], 1.0, 1.0],
            2 => [s[1], s[0], 1.0],
            n => [s[n - 1], s[n - 2], s[n - 3]],
        }
    }
}

/// Integer tile coordinates within one level's chunk grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkAddress {
    pub level: usize,
    pub x: usize,
    pub y: usize,
    pub z: Option<usize>,
}
impl ChunkAddress {
    pub fn new(level: usize, x: usize, y: usize, z: Option<usize>) -> Self {
        Self { level, x, y, z }
    }
}
impl Display for ChunkAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.z {
            Some(z) => write!(f, "{}/{}/{}/{}", self.level, z, self.y, self.x),
            None => write!(f, "{}/{}/{}", self.level, self.y, self.x),
        }
    }
}

/// Fixed coordinates of the non-spatial axes, in storage order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NonSpatialCoords(Vec<(String, usize)>);
impl NonSpatialCoords {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
    pub fn set(&mut self, name: &str, value: usize) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.0.iter().map(|(n, v)| (n.as_str(), *v))
    }
    pub fn values(&self) -> Arc<[usize]> {
        self.0.iter().map(|(_, v)| *v).collect()
    }
}

/// Cache identity of a chunk: pyramid, non-spatial slice and address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub pyramid: Arc<str>,
    pub slice: Arc<[usize]>,
    pub address: ChunkAddress,
}
impl ChunkKey {
    pub fn new(pyramid: Arc<str>, slice: Arc<[usize]>, address: ChunkAddress) -> Self {
        Self { pyramid, slice, address }
    }
}
impl Display for ChunkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}:{}", self.pyramid, self.slice, self.address)
    }
}

/// Static description of a multiresolution array. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct PyramidModel {
    name: String,
    axes: Vec<Axis>,
    levels: Vec<PyramidLevel>,
    is_3d: bool,
}
impl PyramidModel {
    pub fn new(name: impl Into<String>, axes: Vec<Axis>, levels: Vec<PyramidLevel>) -> Result<Self> {
        let name = name.into();
        let spatial = axes.iter().filter(|a| a.is_spatial()).count();
        if !(2..=3).contains(&spatial) {
            return Err(StreamError::MetadataUnavailable(format!(
                "{name}: expected 2 or 3 spatial axes, found {spatial}"
            )));
        }
        if levels.is_empty() {
            return Err(StreamError::MetadataUnavailable(format!("{name}: no pyramid levels")));
        }
        for (position, level) in levels.iter().enumerate() {
            if level.index != position {
                return Err(StreamError::MetadataUnavailable(format!(
                    "{name}: level at position {position} claims index {}",
                    level.index
                )));
            }
            if level.shape.len() != spatial || level.chunk_shape.len() != spatial {
                return Err(StreamError::MetadataUnavailable(format!(
                    "{name}: level {} has shape {:?} and chunks {:?} but {spatial} spatial axes",
                    level.index, level.shape, level.chunk_shape
                )));
            }
            if level.chunk_shape.contains(&0) {
                return Err(StreamError::MetadataUnavailable(format!(
                    "{name}: level {} has an empty chunk shape",
                    level.index
                )));
            }
        }
        Ok(Self {
            name,
            axes,
            levels,
            is_3d: spatial == 3,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_3d(&self) -> bool {
        self.is_3d
    }
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
    pub fn level_info(&self, level: usize) -> Result<&PyramidLevel> {
        self.levels.get(level).ok_or(StreamError::InvalidLevel {
            level,
            levels: self.levels.len(),
        })
    }

    /// Validates `level` and clamps the chunk coordinates into its grid.
    pub fn resolve_address(&self, level: usize, x: usize, y: usize, z: Option<usize>) -> Result<ChunkAddress> {
        let grid = self.level_info(level)?.grid_dims();
        let z = self.is_3d.then(|| z.unwrap_or(0).min(grid.depth.saturating_sub(1)));
        Ok(ChunkAddress::new(
            level,
            x.min(grid.width.saturating_sub(1)),
            y.min(grid.height.saturating_sub(1)),
            z,
        ))
    }

    /// Binds every non-spatial axis to a fixed index: the channel axis to
    /// `channel` (clamped to its extent), all others to 0.
    pub fn bind_non_spatial(&self, channel: usize) -> NonSpatialCoords {
        let mut coords = NonSpatialCoords::default();
        for axis in self.axes.iter().filter(|a| !a.is_spatial()) {
            let value = if axis.is_channel() {
                channel.min(axis.size.saturating_sub(1))
            } else {
                0
            };
            coords.set(&axis.name, value);
        }
        coords
    }

    /// Units of the spatial axes, slowest to fastest.
    pub fn spatial_units(&self) -> Vec<Option<&str>> {
        self.axes
            .iter()
            .filter(|a| a.is_spatial())
            .map(|a| a.unit.as_deref())
            .collect()
    }
}

/// Converts a physical length given in `unit` to millimetres. Unknown or
/// missing units are returned unchanged.
pub fn length_to_mm(value: f64, unit: Option<&str>) -> f64 {
    match unit.map(|u| u.to_ascii_lowercase()).as_deref() {
        Some("micrometer" | "um" | "µm" | "micron") => value / 1000.0,
        Some("nanometer" | "nm") => value / 1_000_000.0,
        Some("centimeter" | "cm") => value * 10.0,
        Some("meter" | "m") => value * 1000.0,
        _ => value,
    }
}
