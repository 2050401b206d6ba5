use crate::error::{KsplatError, Result};
use std::ops::Range;
use zerocopy::byteorder::little_endian::{F32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const HEADER_SIZE_BYTES: usize = 1024;
pub const BYTES_PER_BUCKET: usize = 12;

pub const POSITION_COMPONENTS: usize = 3;
pub const SCALE_COMPONENTS: usize = 3;
pub const ROTATION_COMPONENTS: usize = 4;
pub const COLOR_COMPONENTS: usize = 4;
pub const COVARIANCE_COMPONENTS: usize = 6;

/// Storage width profile for every splat attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionLevel {
    /// 32-bit floats everywhere, exact.
    #[default]
    Full = 0,
    /// Bucket-relative 16-bit positions, half floats for scale and rotation.
    Half = 1,
}

impl CompressionLevel {
    #[inline]
    pub const fn bytes_per_position(self) -> usize {
        match self {
            CompressionLevel::Full => 12,
            CompressionLevel::Half => 6,
        }
    }

    #[inline]
    pub const fn bytes_per_scale(self) -> usize {
        match self {
            CompressionLevel::Full => 12,
            CompressionLevel::Half => 6,
        }
    }

    #[inline]
    pub const fn bytes_per_color(self) -> usize {
        4
    }

    #[inline]
    pub const fn bytes_per_rotation(self) -> usize {
        match self {
            CompressionLevel::Full => 16,
            CompressionLevel::Half => 8,
        }
    }

    #[inline]
    pub const fn bytes_per_splat(self) -> usize {
        self.bytes_per_position()
            + self.bytes_per_scale()
            + self.bytes_per_color()
            + self.bytes_per_rotation()
    }

    /// Half-width of the fixed-point position range.
    #[inline]
    pub const fn scale_range(self) -> u32 {
        match self {
            CompressionLevel::Full => 1,
            CompressionLevel::Half => 32767,
        }
    }

    #[inline]
    pub const fn uses_buckets(self) -> bool {
        matches!(self, CompressionLevel::Half)
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = KsplatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionLevel::Full),
            1 => Ok(CompressionLevel::Half),
            other => Err(KsplatError::MalformedBuffer(format!(
                "Unknown compression level {}",
                other
            ))),
        }
    }
}

/// The populated prefix of the 1024-byte header. Everything after it is zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SplatBufferHeader {
    pub compression_level: u8,
    pub reserved: [u8; 3],
    pub splat_count: U32,
    pub bucket_size: U32,
    pub bucket_count: U32,
    pub bucket_block_size: F32,
    pub bytes_per_bucket: U32,
}

impl SplatBufferHeader {
    pub fn new(
        level: CompressionLevel,
        splat_count: u32,
        bucket_size: u32,
        bucket_count: u32,
        bucket_block_size: f32,
    ) -> Self {
        let mut header = SplatBufferHeader {
            compression_level: level as u8,
            splat_count: U32::new(splat_count),
            ..Default::default()
        };
        // Bucket fields only exist for quantized buffers.
        if level.uses_buckets() {
            header.bucket_size = U32::new(bucket_size);
            header.bucket_count = U32::new(bucket_count);
            header.bucket_block_size = F32::new(bucket_block_size);
            header.bytes_per_bucket = U32::new(BYTES_PER_BUCKET as u32);
        }
        header
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE_BYTES {
            return Err(KsplatError::MalformedBuffer(format!(
                "Buffer of {} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_SIZE_BYTES
            )));
        }
        let (header, _) = SplatBufferHeader::read_from_prefix(data).map_err(|e| {
            KsplatError::MalformedBuffer(format!("Header conversion error: {}", e))
        })?;
        Ok(header)
    }

    pub fn write(&self, out: &mut [u8]) {
        let bytes = self.as_bytes();
        out[..HEADER_SIZE_BYTES].fill(0);
        out[..bytes.len()].copy_from_slice(bytes);
    }
}

/// Byte ranges of each region within a serialized buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    pub positions: Range<usize>,
    pub scales: Range<usize>,
    pub colors: Range<usize>,
    pub rotations: Range<usize>,
    pub buckets: Range<usize>,
}

impl RegionLayout {
    pub fn new(level: CompressionLevel, splat_count: usize, bucket_count: usize) -> Self {
        let mut offset = HEADER_SIZE_BYTES;
        let mut next = |len: usize| {
            let range = offset..offset + len;
            offset += len;
            range
        };
        let positions = next(splat_count * level.bytes_per_position());
        let scales = next(splat_count * level.bytes_per_scale());
        let colors = next(splat_count * level.bytes_per_color());
        let rotations = next(splat_count * level.bytes_per_rotation());
        let bucket_len = if level.uses_buckets() {
            bucket_count * BYTES_PER_BUCKET
        } else {
            0
        };
        let buckets = next(bucket_len);
        RegionLayout {
            positions,
            scales,
            colors,
            rotations,
            buckets,
        }
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.buckets.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_prefix_is_24_bytes() {
        assert_eq!(size_of::<SplatBufferHeader>(), 24);
    }

    #[test]
    fn header_field_offsets_match_the_wire_layout() {
        let header = SplatBufferHeader::new(CompressionLevel::Half, 512, 256, 2, 5.0);
        let mut out = vec![0xAAu8; HEADER_SIZE_BYTES];
        header.write(&mut out);

        assert_eq!(out[0], 1);
        assert_eq!(&out[1..4], &[0, 0, 0]);
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 512);
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 256);
        assert_eq!(u32::from_le_bytes(out[12..16].try_into().unwrap()), 2);
        assert_eq!(f32::from_le_bytes(out[16..20].try_into().unwrap()), 5.0);
        assert_eq!(u32::from_le_bytes(out[20..24].try_into().unwrap()), 12);
        assert!(out[24..].iter().all(|&b| b == 0));

        let back = SplatBufferHeader::read(&out).unwrap();
        assert_eq!(back.splat_count.get(), 512);
        assert_eq!(back.bucket_block_size.get(), 5.0);
    }

    #[test]
    fn full_precision_header_leaves_bucket_fields_zero() {
        let header = SplatBufferHeader::new(CompressionLevel::Full, 256, 256, 1, 5.0);
        assert_eq!(header.bucket_size.get(), 0);
        assert_eq!(header.bucket_count.get(), 0);
        assert_eq!(header.bytes_per_bucket.get(), 0);
    }

    #[test]
    fn regions_are_contiguous_in_fixed_order() {
        let layout = RegionLayout::new(CompressionLevel::Half, 256, 1);
        assert_eq!(layout.positions, 1024..1024 + 256 * 6);
        assert_eq!(layout.scales.start, layout.positions.end);
        assert_eq!(layout.colors.start, layout.scales.end);
        assert_eq!(layout.rotations.start, layout.colors.end);
        assert_eq!(layout.buckets.start, layout.rotations.end);
        assert_eq!(layout.total_len(), 1024 + 256 * 26 + 12);

        let full = RegionLayout::new(CompressionLevel::Full, 256, 1);
        assert_eq!(full.total_len(), 1024 + 256 * 44);
        assert!(full.buckets.is_empty());
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(CompressionLevel::try_from(2).is_err());
        assert_eq!(CompressionLevel::try_from(1).unwrap(), CompressionLevel::Half);
    }
}
