use crate::common::{
    float_to_half, half_to_float, normalize_quat, read_f32, read_u16, write_f32, write_u16,
};
use crate::error::{KsplatError, Result};
use crate::layout::{
    CompressionLevel, RegionLayout, SplatBufferHeader, BYTES_PER_BUCKET, COLOR_COMPONENTS,
    COVARIANCE_COMPONENTS, HEADER_SIZE_BYTES, POSITION_COMPONENTS, ROTATION_COMPONENTS,
    SCALE_COMPONENTS,
};
use glam::{Mat3, Quat, Vec3};

/// Bucket geometry supplied when allocating a quantized buffer.
#[derive(Debug, Clone, Default)]
pub struct BucketTable {
    pub bucket_size: u32,
    pub block_size: f32,
    pub centers: Vec<Vec3>,
}

/// A splat buffer in its persisted byte form, with typed accessors over it.
///
/// The bytes always hold a valid header followed by the attribute regions, so
/// `as_bytes` is the serialized form without any copying.
#[derive(Debug, Clone)]
pub struct SplatBuffer {
    level: CompressionLevel,
    splat_count: usize,
    bucket_size: usize,
    bucket_count: usize,
    bucket_block_size: f32,
    compression_scale_range: f32,
    compression_scale_factor: f32,
    layout: RegionLayout,
    data: Vec<u8>,
    precomputed_covariance: Option<Vec<f32>>,
}

impl SplatBuffer {
    /// Allocates a zeroed buffer. At `CompressionLevel::Half` the splat count
    /// must equal `centers.len() * bucket_size`.
    pub fn new(level: CompressionLevel, splat_count: usize, buckets: BucketTable) -> Result<Self> {
        let bucket_count = buckets.centers.len();
        if level.uses_buckets() {
            if bucket_count * buckets.bucket_size as usize != splat_count {
                return Err(KsplatError::MalformedBuffer(format!(
                    "{} buckets of {} do not cover {} splats",
                    bucket_count, buckets.bucket_size, splat_count
                )));
            }
            if !(buckets.block_size.is_finite() && buckets.block_size > 0.0) {
                return Err(KsplatError::MalformedBuffer(format!(
                    "Invalid bucket block size {}",
                    buckets.block_size
                )));
            }
        }
        let splat_count_u32 = u32::try_from(splat_count).map_err(|_| {
            KsplatError::MalformedBuffer(format!("Splat count {} exceeds u32", splat_count))
        })?;

        let header = SplatBufferHeader::new(
            level,
            splat_count_u32,
            buckets.bucket_size,
            bucket_count as u32,
            buckets.block_size,
        );
        let layout = RegionLayout::new(level, splat_count, bucket_count);
        let mut data = vec![0u8; layout.total_len()];
        header.write(&mut data);
        if level.uses_buckets() {
            for (i, center) in buckets.centers.iter().enumerate() {
                let base = layout.buckets.start + i * BYTES_PER_BUCKET;
                write_f32(&mut data, base, center.x);
                write_f32(&mut data, base + 4, center.y);
                write_f32(&mut data, base + 8, center.z);
            }
        }
        Self::from_header(&header, data)
    }

    /// Adopts serialized bytes, validating the header against the region sizes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let header = SplatBufferHeader::read(&data)?;
        Self::from_header(&header, data)
    }

    fn from_header(header: &SplatBufferHeader, data: Vec<u8>) -> Result<Self> {
        let level = CompressionLevel::try_from(header.compression_level)?;
        let splat_count = header.splat_count.get() as usize;
        let (bucket_size, bucket_count, bucket_block_size) = if level.uses_buckets() {
            let bucket_size = header.bucket_size.get() as usize;
            let bucket_count = header.bucket_count.get() as usize;
            let block_size = header.bucket_block_size.get();
            if header.bytes_per_bucket.get() as usize != BYTES_PER_BUCKET {
                return Err(KsplatError::MalformedBuffer(format!(
                    "Expected {} bytes per bucket, header says {}",
                    BYTES_PER_BUCKET,
                    header.bytes_per_bucket.get()
                )));
            }
            if bucket_size.checked_mul(bucket_count) != Some(splat_count) {
                return Err(KsplatError::MalformedBuffer(format!(
                    "{} buckets of {} do not match splat count {}",
                    bucket_count, bucket_size, splat_count
                )));
            }
            if !(block_size.is_finite() && block_size > 0.0) {
                return Err(KsplatError::MalformedBuffer(format!(
                    "Invalid bucket block size {}",
                    block_size
                )));
            }
            (bucket_size, bucket_count, block_size)
        } else {
            (0, 0, 0.0)
        };

        let layout = RegionLayout::new(level, splat_count, bucket_count);
        if data.len() != layout.total_len() {
            return Err(KsplatError::MalformedBuffer(format!(
                "Buffer size mismatch, need {} bytes, have {}",
                layout.total_len(),
                data.len()
            )));
        }

        let compression_scale_range = level.scale_range() as f32;
        let compression_scale_factor = (bucket_block_size / 2.0) / compression_scale_range;

        Ok(SplatBuffer {
            level,
            splat_count,
            bucket_size,
            bucket_count,
            bucket_block_size,
            compression_scale_range,
            compression_scale_factor,
            layout,
            data,
            precomputed_covariance: None,
        })
    }

    #[inline]
    pub fn compression_level(&self) -> CompressionLevel {
        self.level
    }

    #[inline]
    pub fn splat_count(&self) -> usize {
        self.splat_count
    }

    #[inline]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    #[inline]
    pub fn bucket_block_size(&self) -> f32 {
        self.bucket_block_size
    }

    /// Quantization step of a level 1 position component.
    #[inline]
    pub fn compression_scale_factor(&self) -> f32 {
        self.compression_scale_factor
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.splat_count {
            return Err(KsplatError::IndexOutOfRange {
                index,
                count: self.splat_count,
            });
        }
        Ok(())
    }

    pub fn bucket_center(&self, bucket: usize) -> Result<Vec3> {
        if bucket >= self.bucket_count {
            return Err(KsplatError::IndexOutOfRange {
                index: bucket,
                count: self.bucket_count,
            });
        }
        Ok(self.bucket_center_unchecked(bucket))
    }

    #[inline]
    fn bucket_center_unchecked(&self, bucket: usize) -> Vec3 {
        let base = self.layout.buckets.start + bucket * BYTES_PER_BUCKET;
        Vec3::new(
            read_f32(&self.data, base),
            read_f32(&self.data, base + 4),
            read_f32(&self.data, base + 8),
        )
    }

    #[inline]
    fn bucket_center_for_splat(&self, index: usize) -> Vec3 {
        self.bucket_center_unchecked(index / self.bucket_size)
    }

    /// Reads stored scalar `component` of a float region as f32.
    #[inline]
    fn read_float(&self, region_start: usize, component: usize) -> f32 {
        match self.level {
            CompressionLevel::Full => read_f32(&self.data, region_start + component * 4),
            CompressionLevel::Half => half_to_float(read_u16(&self.data, region_start + component * 2)),
        }
    }

    #[inline]
    fn write_float(&mut self, region_start: usize, component: usize, value: f32) {
        match self.level {
            CompressionLevel::Full => write_f32(&mut self.data, region_start + component * 4, value),
            CompressionLevel::Half => {
                write_u16(&mut self.data, region_start + component * 2, float_to_half(value))
            }
        }
    }

    #[inline]
    fn position_unchecked(&self, index: usize) -> Vec3 {
        let base = index * POSITION_COMPONENTS;
        let start = self.layout.positions.start;
        match self.level {
            CompressionLevel::Full => Vec3::new(
                read_f32(&self.data, start + base * 4),
                read_f32(&self.data, start + (base + 1) * 4),
                read_f32(&self.data, start + (base + 2) * 4),
            ),
            CompressionLevel::Half => {
                let sf = self.compression_scale_factor;
                let sr = self.compression_scale_range;
                let center = self.bucket_center_for_splat(index);
                let decode = |c: usize| {
                    (read_u16(&self.data, start + (base + c) * 2) as f32 - sr) * sf
                };
                Vec3::new(decode(0), decode(1), decode(2)) + center
            }
        }
    }

    pub fn position(&self, index: usize) -> Result<Vec3> {
        self.check_index(index)?;
        Ok(self.position_unchecked(index))
    }

    pub fn set_position(&mut self, index: usize, position: Vec3) -> Result<()> {
        self.check_index(index)?;
        let base = index * POSITION_COMPONENTS;
        let start = self.layout.positions.start;
        match self.level {
            CompressionLevel::Full => {
                for (c, value) in position.to_array().into_iter().enumerate() {
                    write_f32(&mut self.data, start + (base + c) * 4, value);
                }
            }
            CompressionLevel::Half => {
                let sf = 1.0 / self.compression_scale_factor;
                let sr = self.compression_scale_range;
                let max_r = sr * 2.0 + 1.0;
                let delta = position - self.bucket_center_for_splat(index);
                for (c, value) in delta.to_array().into_iter().enumerate() {
                    let q = ((value * sf).round() + sr).clamp(0.0, max_r);
                    write_u16(&mut self.data, start + (base + c) * 2, q as u16);
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn scale_unchecked(&self, index: usize) -> Vec3 {
        let start = self.layout.scales.start;
        let base = index * SCALE_COMPONENTS;
        Vec3::new(
            self.read_float(start, base),
            self.read_float(start, base + 1),
            self.read_float(start, base + 2),
        )
    }

    pub fn scale(&self, index: usize) -> Result<Vec3> {
        self.check_index(index)?;
        Ok(self.scale_unchecked(index))
    }

    pub fn set_scale(&mut self, index: usize, scale: Vec3) -> Result<()> {
        self.check_index(index)?;
        let start = self.layout.scales.start;
        let base = index * SCALE_COMPONENTS;
        for (c, value) in scale.to_array().into_iter().enumerate() {
            self.write_float(start, base + c, value);
        }
        self.precomputed_covariance = None;
        Ok(())
    }

    #[inline]
    fn rotation_unchecked(&self, index: usize) -> Quat {
        let start = self.layout.rotations.start;
        let base = index * ROTATION_COMPONENTS;
        // Stored as (w, x, y, z).
        Quat::from_xyzw(
            self.read_float(start, base + 1),
            self.read_float(start, base + 2),
            self.read_float(start, base + 3),
            self.read_float(start, base),
        )
    }

    pub fn rotation(&self, index: usize) -> Result<Quat> {
        self.check_index(index)?;
        Ok(self.rotation_unchecked(index))
    }

    /// Stores `rotation` normalized.
    pub fn set_rotation(&mut self, index: usize, rotation: Quat) -> Result<()> {
        self.check_index(index)?;
        let q = normalize_quat(rotation);
        self.write_rotation_raw(index, q);
        self.precomputed_covariance = None;
        Ok(())
    }

    #[inline]
    fn write_rotation_raw(&mut self, index: usize, q: Quat) {
        let start = self.layout.rotations.start;
        let base = index * ROTATION_COMPONENTS;
        self.write_float(start, base, q.w);
        self.write_float(start, base + 1, q.x);
        self.write_float(start, base + 2, q.y);
        self.write_float(start, base + 3, q.z);
    }

    #[inline]
    fn color_unchecked(&self, index: usize) -> [u8; 4] {
        let base = self.layout.colors.start + index * COLOR_COMPONENTS;
        let mut rgba = [0u8; 4];
        rgba.copy_from_slice(&self.data[base..base + COLOR_COMPONENTS]);
        rgba
    }

    pub fn color(&self, index: usize) -> Result<[u8; 4]> {
        self.check_index(index)?;
        Ok(self.color_unchecked(index))
    }

    pub fn set_color(&mut self, index: usize, rgba: [u8; 4]) -> Result<()> {
        self.check_index(index)?;
        let base = self.layout.colors.start + index * COLOR_COMPONENTS;
        self.data[base..base + COLOR_COMPONENTS].copy_from_slice(&rgba);
        Ok(())
    }

    /// Decoded positions of every splat, `x y z` per splat.
    pub fn fill_positions(&self, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.splat_count * POSITION_COMPONENTS);
        for i in 0..self.splat_count {
            out.extend_from_slice(&self.position_unchecked(i).to_array());
        }
    }

    pub fn fill_scales(&self, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.splat_count * SCALE_COMPONENTS);
        for i in 0..self.splat_count {
            out.extend_from_slice(&self.scale_unchecked(i).to_array());
        }
    }

    /// Decoded rotations in stored `w x y z` order.
    pub fn fill_rotations(&self, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.splat_count * ROTATION_COMPONENTS);
        let start = self.layout.rotations.start;
        for component in 0..self.splat_count * ROTATION_COMPONENTS {
            out.push(self.read_float(start, component));
        }
    }

    pub fn fill_colors(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.data[self.layout.colors.clone()]);
    }

    /// Exchanges every attribute of two splat slots.
    ///
    /// Positions are re-quantized against the bucket of their new slot, so a
    /// swap across buckets at level 1 may move a point by up to one step or
    /// clamp it to the edge of the destination bucket.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<()> {
        self.check_index(a)?;
        self.check_index(b)?;
        if a == b {
            return Ok(());
        }

        let (pa, pb) = (self.position_unchecked(a), self.position_unchecked(b));
        self.set_position(b, pa)?;
        self.set_position(a, pb)?;

        let (sa, sb) = (self.scale_unchecked(a), self.scale_unchecked(b));
        self.set_scale(b, sa)?;
        self.set_scale(a, sb)?;

        let (ra, rb) = (self.rotation_unchecked(a), self.rotation_unchecked(b));
        self.write_rotation_raw(b, ra);
        self.write_rotation_raw(a, rb);

        let (ca, cb) = (self.color_unchecked(a), self.color_unchecked(b));
        self.set_color(b, ca)?;
        self.set_color(a, cb)?;

        self.precomputed_covariance = None;
        Ok(())
    }

    /// Computes the upper triangle `(00, 01, 02, 11, 12, 22)` of `M * Mᵀ`,
    /// `M = R * S`, for every splat.
    pub fn build_precomputed_covariance(&mut self) {
        let mut covariance = Vec::with_capacity(self.splat_count * COVARIANCE_COMPONENTS);
        for i in 0..self.splat_count {
            let scale = self.scale_unchecked(i);
            let rotation = self.rotation_unchecked(i);
            let m = Mat3::from_quat(rotation) * Mat3::from_diagonal(scale);
            let (r0, r1, r2) = (m.row(0), m.row(1), m.row(2));
            covariance.extend_from_slice(&[
                r0.dot(r0),
                r0.dot(r1),
                r0.dot(r2),
                r1.dot(r1),
                r1.dot(r2),
                r2.dot(r2),
            ]);
        }
        self.precomputed_covariance = Some(covariance);
    }

    /// Available after `build_precomputed_covariance` until the next scale,
    /// rotation or swap mutation.
    #[inline]
    pub fn precomputed_covariance(&self) -> Option<&[f32]> {
        self.precomputed_covariance.as_deref()
    }

    /// Size of the attribute data that follows the header.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len() - HEADER_SIZE_BYTES
    }
}
