mod voxels;

use crate::model::{DataType, Dims3};
use log::warn;
pub use voxels::VoxelData;

/// Samples read per chunk when updating the calibration range.
pub const CALIBRATION_SAMPLES: usize = 2000;

/// Running min/max over everything painted in the current pass.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub min: f64,
    pub max: f64,
}
impl Calibration {
    fn include(current: Option<Calibration>, (min, max): (f64, f64)) -> Calibration {
        match current {
            None => Calibration { min, max },
            Some(c) => Calibration {
                min: c.min.min(min),
                max: c.max.max(max),
            },
        }
    }
}

/// Where a chunk lands in the output buffer.
///
/// `dest` is the buffer position of the chunk's first voxel and may be
/// negative or beyond the buffer. `extent` is the chunk's actual size in the
/// level, `src_width`/`src_height` the strides of the decoded data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlacement {
    pub dest: [i64; 3],
    pub extent: Dims3,
    pub src_width: usize,
    pub src_height: usize,
}

/// Dense voxel buffer, indexed `x + y*W + z*W*H`. One allocation reused
/// across passes.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    dims: Dims3,
    data: VoxelData,
    calibration: Option<Calibration>,
}
impl OutputBuffer {
    pub fn new(dims: Dims3, dtype: DataType) -> Self {
        Self {
            dims,
            data: VoxelData::zeros(dtype, dims.volume()),
            calibration: None,
        }
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }
    pub fn data(&self) -> &VoxelData {
        &self.data
    }
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }
    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f64> {
        if x >= self.dims.width || y >= self.dims.height || z >= self.dims.depth {
            return None;
        }
        self.data.get(x + y * self.dims.width + z * self.dims.width * self.dims.height)
    }

    /// Zeroes all voxels and forgets the calibration range.
    pub fn clear(&mut self) {
        self.data.fill_zero();
        self.calibration = None;
    }

    /// Reallocates only if dims or element type changed.
    pub fn reshape(&mut self, dims: Dims3, dtype: DataType) {
        if dims != self.dims || dtype != self.data.data_type() {
            *self = Self::new(dims, dtype);
        } else {
            self.clear();
        }
    }

    pub fn calibrate(&mut self, chunk: &VoxelData, max_samples: usize) {
        if let Some(range) = chunk.sample_min_max(max_samples) {
            self.calibration = Some(Calibration::include(self.calibration, range));
        }
    }

    /// Copies the overlap of a chunk and the buffer. Returns whether any
    /// voxel was written. Chunks of another element type are rejected.
    pub fn paint(&mut self, placement: &ChunkPlacement, chunk: &VoxelData) -> bool {
        let dims = self.dims;
        match (&mut self.data, chunk) {
            (VoxelData::U8(dst), VoxelData::U8(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::I8(dst), VoxelData::I8(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::U16(dst), VoxelData::U16(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::I16(dst), VoxelData::I16(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::U32(dst), VoxelData::U32(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::I32(dst), VoxelData::I32(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::F32(dst), VoxelData::F32(src)) => copy_block(dst, src, dims, placement),
            (VoxelData::F64(dst), VoxelData::F64(src)) => copy_block(dst, src, dims, placement),
            (dst, src) => {
                warn!(
                    "Refusing to paint {:?} chunk into {:?} buffer",
                    src.data_type(),
                    dst.data_type()
                );
                false
            }
        }
    }
}

fn copy_block<T: Copy>(dst: &mut [T], src: &[T], dims: Dims3, p: &ChunkPlacement) -> bool {
    let [dx, dy, dz] = p.dest;
    let (w, h, d) = (dims.width as i64, dims.height as i64, dims.depth as i64);
    // x overlap is the same for every row
    let x0 = (-dx).max(0);
    let x1 = (p.extent.width as i64).min(w - dx);
    if x0 >= x1 {
        return false;
    }
    let mut written = false;
    for cz in 0..p.extent.depth as i64 {
        let vz = dz + cz;
        if vz < 0 || vz >= d {
            continue;
        }
        for cy in 0..p.extent.height as i64 {
            let vy = dy + cy;
            if vy < 0 || vy >= h {
                continue;
            }
            let src_row = (cz as usize * p.src_height + cy as usize) * p.src_width;
            if src_row >= src.len() {
                continue;
            }
            let row_x1 = (x1 as usize).min(src.len() - src_row);
            if x0 as usize >= row_x1 {
                continue;
            }
            let n = row_x1 - x0 as usize;
            let dst_start = (dx + x0) as usize + (vy * w) as usize + (vz * w * h) as usize;
            dst[dst_start..dst_start + n].copy_from_slice(&src[src_row + x0 as usize..src_row + row_x1]);
            written = true;
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(dest: [i64; 3], extent: Dims3) -> ChunkPlacement {
        ChunkPlacement {
            dest,
            extent,
            src_width: extent.width,
            src_height: extent.height,
        }
    }

    #[test]
    fn paints_fully_inside() {
        let mut buffer = OutputBuffer::new(Dims3::new(4, 4, 2), DataType::U8);
        let chunk = VoxelData::U8((1..=8).collect());
        assert!(buffer.paint(&placement([1, 1, 0], Dims3::new(2, 2, 2)), &chunk));
        assert_eq!(buffer.get(1, 1, 0), Some(1.0));
        assert_eq!(buffer.get(2, 1, 0), Some(2.0));
        assert_eq!(buffer.get(1, 2, 0), Some(3.0));
        assert_eq!(buffer.get(2, 2, 1), Some(8.0));
        assert_eq!(buffer.get(0, 0, 0), Some(0.0));
    }

    #[test]
    fn clips_to_buffer_bounds() {
        let mut buffer = OutputBuffer::new(Dims3::new(3, 3, 1), DataType::U16);
        let chunk = VoxelData::U16((0..16).collect());
        // 4x4 chunk hanging off the top left corner by one voxel
        assert!(buffer.paint(&placement([-1, -1, 0], Dims3::new(4, 4, 1)), &chunk));
        assert_eq!(buffer.get(0, 0, 0), Some(5.0));
        assert_eq!(buffer.get(2, 2, 0), Some(15.0));
        // entirely outside
        assert!(!buffer.paint(&placement([10, 0, 0], Dims3::new(4, 4, 1)), &chunk));
        assert!(!buffer.paint(&placement([0, 0, -3], Dims3::new(4, 4, 1)), &chunk));
    }

    #[test]
    fn honours_source_strides_of_padded_chunks() {
        let mut buffer = OutputBuffer::new(Dims3::new(4, 4, 1), DataType::U8);
        // full 4x4 chunk of which only the left 2x3 lies inside the level
        let chunk = VoxelData::U8((0..16).collect());
        let p = ChunkPlacement {
            dest: [0, 0, 0],
            extent: Dims3::new(2, 3, 1),
            src_width: 4,
            src_height: 4,
        };
        assert!(buffer.paint(&p, &chunk));
        assert_eq!(buffer.get(1, 0, 0), Some(1.0));
        assert_eq!(buffer.get(0, 2, 0), Some(8.0));
        assert_eq!(buffer.get(2, 0, 0), Some(0.0));
        assert_eq!(buffer.get(0, 3, 0), Some(0.0));
    }

    #[test]
    fn short_data_never_reads_past_the_end() {
        let mut buffer = OutputBuffer::new(Dims3::new(4, 4, 1), DataType::U8);
        let chunk = VoxelData::U8(vec![9; 5]);
        assert!(buffer.paint(&placement([0, 0, 0], Dims3::new(4, 4, 1)), &chunk));
        assert_eq!(buffer.get(0, 1, 0), Some(9.0));
        assert_eq!(buffer.get(1, 1, 0), Some(0.0));
    }

    #[test]
    fn rejects_mismatched_type() {
        let mut buffer = OutputBuffer::new(Dims3::new(2, 2, 1), DataType::U8);
        let chunk = VoxelData::F32(vec![1.0; 4]);
        assert!(!buffer.paint(&placement([0, 0, 0], Dims3::new(2, 2, 1)), &chunk));
    }

    #[test]
    fn calibration_accumulates_and_resets() {
        let mut buffer = OutputBuffer::new(Dims3::new(2, 2, 1), DataType::I16);
        buffer.calibrate(&VoxelData::I16(vec![5, 10]), CALIBRATION_SAMPLES);
        buffer.calibrate(&VoxelData::I16(vec![-4, 7]), CALIBRATION_SAMPLES);
        assert_eq!(buffer.calibration(), Some(Calibration { min: -4.0, max: 10.0 }));
        buffer.clear();
        assert_eq!(buffer.calibration(), None);
    }

    #[test]
    fn reshape_keeps_allocation_for_same_dims() {
        let mut buffer = OutputBuffer::new(Dims3::new(2, 2, 1), DataType::U8);
        buffer.paint(&placement([0, 0, 0], Dims3::new(1, 1, 1)), &VoxelData::U8(vec![3]));
        buffer.reshape(Dims3::new(2, 2, 1), DataType::U8);
        assert_eq!(buffer.get(0, 0, 0), Some(0.0));
        buffer.reshape(Dims3::new(3, 1, 1), DataType::F32);
        assert_eq!(buffer.data().len(), 3);
        assert_eq!(buffer.data_type(), DataType::F32);
    }
}
