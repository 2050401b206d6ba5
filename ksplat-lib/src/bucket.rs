use crate::error::{KsplatError, Result};
use foldhash::HashMap;
use foldhash::HashMapExt;
use glam::Vec3;

/// Reserved splat index used to pad buckets that did not fill up.
pub const INVALID_SPLAT_INDEX: u32 = 0;

pub const DEFAULT_BUCKET_SIZE: usize = 256;
pub const DEFAULT_BUCKET_BLOCK_SIZE: f32 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SplatBucket {
    /// Indices into the retained splat list, always `bucket_size` long once
    /// bucketing finishes.
    pub splats: Vec<u32>,
    pub center: Vec3,
}

/// Groups splats into fixed-capacity buckets over a regular grid of cubic
/// cells. Index 0 is the sentinel and is never bucketed itself.
///
/// Buckets close in input order as they fill; the leftover open buckets are
/// padded with `INVALID_SPLAT_INDEX` and appended in ascending cell order.
///
/// The grid starts at the min corner of the real splats, not at
/// `min(origin, min corner)`, so level-1 centers differ from buffers whose
/// grid was anchored at the origin.
pub fn compute_buckets(
    positions: &[Vec3],
    bucket_size: usize,
    block_size: f32,
) -> Result<Vec<SplatBucket>> {
    if positions.len() <= 1 || bucket_size == 0 {
        return Ok(Vec::new());
    }
    let half_block_size = block_size / 2.0;

    let min = positions[1..]
        .iter()
        .fold(Vec3::splat(f32::MAX), |lo, p| lo.min(*p));

    let mut full_buckets = Vec::with_capacity(positions.len() / bucket_size + 1);
    let mut open_buckets: HashMap<CellId, SplatBucket> = HashMap::new();

    for (i, position) in positions.iter().enumerate().skip(1) {
        let block = ((*position - min) / block_size).ceil();
        let cell = cell_id(block).ok_or_else(|| {
            KsplatError::UnsupportedCameraOrInputShape(format!(
                "splat {} at {} falls outside a {}-unit bucket grid",
                i, position, block_size
            ))
        })?;

        let bucket = open_buckets.entry(cell).or_insert_with(|| {
            let center = (block - Vec3::ONE) * block_size + min + Vec3::splat(half_block_size);
            SplatBucket {
                splats: Vec::with_capacity(bucket_size),
                center,
            }
        });

        bucket.splats.push(i as u32);
        if bucket.splats.len() >= bucket_size {
            if let Some(full) = open_buckets.remove(&cell) {
                full_buckets.push(full);
            }
        }
    }

    let mut remaining: Vec<(CellId, SplatBucket)> = open_buckets.into_iter().collect();
    remaining.sort_unstable_by_key(|(cell, _)| *cell);
    for (_, mut bucket) in remaining {
        bucket.splats.resize(bucket_size, INVALID_SPLAT_INDEX);
        full_buckets.push(bucket);
    }

    Ok(full_buckets)
}

/// Block coordinates, x-major.
type CellId = (u64, u64, u64);

// u64::MAX as f32 rounds up to 2^64, so `<` keeps the cast exact.
const MAX_BLOCK_INDEX: f32 = u64::MAX as f32;

#[inline]
fn cell_id(block: Vec3) -> Option<CellId> {
    let representable = |b: f32| b.is_finite() && b < MAX_BLOCK_INDEX;
    if block.to_array().into_iter().all(representable) {
        Some((block.x as u64, block.y as u64, block.z as u64))
    } else {
        None
    }
}
