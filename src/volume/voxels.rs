use crate::model::DataType;

/// A decoded numeric array, one variant per supported element type.
#[derive(Clone, PartialEq, derive_more::Debug)]
pub enum VoxelData {
    #[debug("U8({})", _0.len())]
    U8(Vec<u8>),
    #[debug("I8({})", _0.len())]
    I8(Vec<i8>),
    #[debug("U16({})", _0.len())]
    U16(Vec<u16>),
    #[debug("I16({})", _0.len())]
    I16(Vec<i16>),
    #[debug("U32({})", _0.len())]
    U32(Vec<u32>),
    #[debug("I32({})", _0.len())]
    I32(Vec<i32>),
    #[debug("F32({})", _0.len())]
    F32(Vec<f32>),
    #[debug("F64({})", _0.len())]
    F64(Vec<f64>),
}

/// Runs `$body` with `$v` bound to the inner vector, whatever the variant.
macro_rules! with_voxels {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            VoxelData::U8($v) => $body,
            VoxelData::I8($v) => $body,
            VoxelData::U16($v) => $body,
            VoxelData::I16($v) => $body,
            VoxelData::U32($v) => $body,
            VoxelData::I32($v) => $body,
            VoxelData::F32($v) => $body,
            VoxelData::F64($v) => $body,
        }
    };
}

impl VoxelData {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        Self::filled(dtype, len, 0.0)
    }

    /// A chunk where every element is `value`, converted with `as` semantics.
    pub fn filled(dtype: DataType, len: usize, value: f64) -> Self {
        match dtype {
            DataType::U8 => VoxelData::U8(vec![value as u8; len]),
            DataType::I8 => VoxelData::I8(vec![value as i8; len]),
            DataType::U16 => VoxelData::U16(vec![value as u16; len]),
            DataType::I16 => VoxelData::I16(vec![value as i16; len]),
            DataType::U32 => VoxelData::U32(vec![value as u32; len]),
            DataType::I32 => VoxelData::I32(vec![value as i32; len]),
            DataType::F32 => VoxelData::F32(vec![value as f32; len]),
            DataType::F64 => VoxelData::F64(vec![value; len]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            VoxelData::U8(_) => DataType::U8,
            VoxelData::I8(_) => DataType::I8,
            VoxelData::U16(_) => DataType::U16,
            VoxelData::I16(_) => DataType::I16,
            VoxelData::U32(_) => DataType::U32,
            VoxelData::I32(_) => DataType::I32,
            VoxelData::F32(_) => DataType::F32,
            VoxelData::F64(_) => DataType::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_voxels!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        with_voxels!(self, v => v.get(idx).map(|&x| x.into()))
    }

    pub fn fill_zero(&mut self) {
        with_voxels!(self, v => v.fill(Default::default()))
    }

    /// Min/max over at most about `max_samples` evenly strided elements.
    /// NaNs are skipped; `None` if nothing was sampled.
    pub fn sample_min_max(&self, max_samples: usize) -> Option<(f64, f64)> {
        let step = (self.len() / max_samples.max(1)).max(1);
        with_voxels!(self, v => {
            v.iter()
                .step_by(step)
                .map(|&x| -> f64 { x.into() })
                .filter(|x| !x.is_nan())
                .fold(None, |acc: Option<(f64, f64)>, x| match acc {
                    None => Some((x, x)),
                    Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_respects_stride() {
        let data = VoxelData::U16((0..10_000).collect());
        // stride 5 starting at 0 never reaches 9999
        assert_eq!(data.sample_min_max(2000), Some((0.0, 9995.0)));
        let small = VoxelData::I8(vec![3, -7, 12]);
        assert_eq!(small.sample_min_max(2000), Some((-7.0, 12.0)));
        assert_eq!(VoxelData::F32(vec![]).sample_min_max(2000), None);
    }

    #[test]
    fn sampling_skips_nan() {
        let data = VoxelData::F32(vec![f32::NAN, 1.5, -2.0, f32::NAN]);
        assert_eq!(data.sample_min_max(2000), Some((-2.0, 1.5)));
    }

    #[test]
    fn filled_and_accessors() {
        let mut data = VoxelData::filled(DataType::I16, 4, -3.0);
        assert_eq!(data.data_type(), DataType::I16);
        assert_eq!(data.get(3), Some(-3.0));
        assert_eq!(data.get(4), None);
        data.fill_zero();
        assert_eq!(data, VoxelData::I16(vec![0; 4]));
    }
}
