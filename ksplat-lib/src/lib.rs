pub mod bucket;
pub mod buffer;
pub mod common;
pub mod error;
pub mod layout;
pub mod ply;
pub mod selector;
pub mod sort;
pub mod tree;

pub use buffer::{BucketTable, SplatBuffer};
pub use error::{KsplatError, Result};
pub use layout::CompressionLevel;
pub use ply::{parse_ply, write_ply, ParseOptions};
pub use selector::{FrameSelector, Selection, SelectorConfig, ViewParams};
pub use sort::{
    RefreshPolicy, SortPeer, SortRequest, SortResponse, SortScheduler, ThreadedSorter, ViewState,
};
pub use tree::{SplatTree, SplatTreeNode, TreeConfig, TreeStats};

use common::ZSTD_MAX_COMPRESSION_LVL;
use log::info;
use std::io::{Cursor, Write};
use zstd::stream::{decode_all, Encoder};

/// Leading bytes of every zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[inline]
pub fn is_zstd_frame(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

fn check_compression_level(level: u32) -> Result<()> {
    if level > ZSTD_MAX_COMPRESSION_LVL {
        return Err(KsplatError::ZstdCompress(format!(
            "Compression level {} is above the maximum of {}",
            level, ZSTD_MAX_COMPRESSION_LVL
        )));
    }
    Ok(())
}

#[inline(never)]
fn compress_zstd(data: &[u8], level: u32, workers: u32) -> Result<Vec<u8>> {
    check_compression_level(level)?;
    let mut encoder = Encoder::new(Vec::new(), level as i32)
        .map_err(|e| KsplatError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| KsplatError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| KsplatError::ZstdCompress(format!("Writing data failed: {}", e)))?;

    let compressed_data = encoder
        .finish()
        .map_err(|e| KsplatError::ZstdCompress(format!("Finalizing compression failed: {}", e)))?;
    Ok(compressed_data)
}

#[inline(never)]
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    decode_all(Cursor::new(data))
        .map_err(|e| KsplatError::ZstdDecompress(format!("Decompression failed: {}", e)))
}

/// Parses a PLY and writes the serialized splat buffer into `output`.
pub fn convert(raw_ply: &[u8], options: &ParseOptions, output: &mut Vec<u8>) -> Result<()> {
    let buffer = parse_ply(raw_ply, options)?;
    output.clear();
    output.extend_from_slice(buffer.as_bytes());
    Ok(())
}

/// Like `convert`, with the serialized buffer wrapped in a zstd frame.
pub fn compress(
    raw_ply: &[u8],
    options: &ParseOptions,
    compression_level: u32,
    workers: u32,
    output: &mut Vec<u8>,
) -> Result<()> {
    let buffer = parse_ply(raw_ply, options)?;
    let compressed = compress_zstd(buffer.as_bytes(), compression_level, workers)?;
    info!(
        "Compressed splat buffer from {} to {} bytes",
        buffer.as_bytes().len(),
        compressed.len()
    );
    output.clear();
    output.extend_from_slice(&compressed);
    Ok(())
}

/// Wraps an existing buffer in a zstd frame.
pub fn compress_buffer(buffer: &SplatBuffer, compression_level: u32, workers: u32) -> Result<Vec<u8>> {
    compress_zstd(buffer.as_bytes(), compression_level, workers)
}

/// Loads a serialized splat buffer, zstd-wrapped or not.
pub fn load(data: &[u8]) -> Result<SplatBuffer> {
    if is_zstd_frame(data) {
        SplatBuffer::from_bytes(decompress_zstd(data)?)
    } else {
        SplatBuffer::from_bytes(data.to_vec())
    }
}

/// Loads a splat buffer, zstd-wrapped or not, and writes it out as PLY.
pub fn decompress(data: &[u8], output: &mut Vec<u8>) -> Result<()> {
    let buffer = load(data)?;
    write_ply(&buffer, output)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use tokio::io::BufReader;

    #[inline(never)]
    async fn compress_zstd_async(
        data: &[u8],
        level: u32,
        workers: u32,
    ) -> Result<Vec<u8>> {
        check_compression_level(level)?;
        let mut compressed = Vec::new();
        let params = &[CParameter::nb_workers(workers)];
        let mut encoder = ZstdEncoder::with_quality_and_params(
            &mut compressed,
            Level::Precise(level as i32),
            params,
        );

        encoder.write_all(data)
            .await
            .map_err(|e| KsplatError::ZstdCompress(e.to_string()))?;

        encoder.shutdown()
            .await
            .map_err(|e| KsplatError::ZstdCompress(e.to_string()))?;

        Ok(compressed)
    }

    #[inline(never)]
    async fn decompress_zstd_async(data: &[u8]) -> Result<Vec<u8>> {
        let cursor = Cursor::new(data);
        let reader = BufReader::new(cursor);
        let mut decoder = ZstdDecoder::new(reader);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed)
            .await
            .map_err(|e| KsplatError::ZstdDecompress(e.to_string()))?;

        Ok(decompressed)
    }

    #[inline(never)]
    pub async fn compress_async(
        raw_ply: &[u8],
        options: &ParseOptions,
        compression_level: u32,
        workers: u32,
        output: &mut Vec<u8>,
    ) -> Result<()> {
        let buffer = parse_ply(raw_ply, options)?;
        let compressed = compress_zstd_async(buffer.as_bytes(), compression_level, workers).await?;
        output.clear();
        output.extend_from_slice(&compressed);
        Ok(())
    }

    #[inline(never)]
    pub async fn load_async(data: &[u8]) -> Result<SplatBuffer> {
        if is_zstd_frame(data) {
            SplatBuffer::from_bytes(decompress_zstd_async(data).await?)
        } else {
            SplatBuffer::from_bytes(data.to_vec())
        }
    }

    #[inline(never)]
    pub async fn decompress_async(data: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let buffer = load_async(data).await?;
        write_ply(&buffer, output)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn create_test_ply() -> Vec<u8> {
        let header = b"ply
format binary_little_endian 1.0
element vertex 2
property float x
property float y
property float z
property float scale_0
property float scale_1
property float scale_2
property float rot_0
property float rot_1
property float rot_2
property float rot_3
property float opacity
property float f_dc_0
property float f_dc_1
property float f_dc_2
end_header
";

        #[rustfmt::skip]
        let floats = [
            // x, y, z
            0.0f32, 0.1, 0.2,
            // scale_0, scale_1, scale_2
            -4.0, -4.5, -3.0,
            // rot_0, rot_1, rot_2, rot_3
            1.0, 0.0, 0.0, 0.0,
            // opacity
            0.5,
            // f_dc_0, f_dc_1, f_dc_2
            0.2, 0.3, 0.4,

            3.0, -2.0, 7.5,
            -5.0, -5.0, -5.0,
            0.0, 0.0, 0.0, 1.0,
            2.0,
            -0.2, 0.0, 0.6,
        ];

        let mut raw_ply = Vec::new();
        raw_ply.extend_from_slice(header);
        for &f in &floats {
            raw_ply.extend_from_slice(&f.to_le_bytes());
        }
        raw_ply
    }

    fn validate_output_ply(out_ply: &[u8], vertex_count: usize) {
        let header = ply::decode_header(out_ply).expect("output is not a PLY");
        assert_eq!(header.vertex_count, vertex_count);
    }

    #[test]
    fn convert_then_load_reproduces_the_buffer() {
        let raw_ply = create_test_ply();
        for level in [CompressionLevel::Full, CompressionLevel::Half] {
            let options = ParseOptions {
                compression_level: level,
                ..Default::default()
            };
            let mut bytes = Vec::new();
            convert(&raw_ply, &options, &mut bytes).unwrap();
            assert!(!is_zstd_frame(&bytes));

            let loaded = load(&bytes).unwrap();
            let parsed = parse_ply(&raw_ply, &options).unwrap();
            assert_eq!(loaded.as_bytes(), parsed.as_bytes());
            assert_eq!(loaded.compression_level(), level);
            // The two splats land in separate cells.
            assert_eq!(loaded.splat_count(), 512);
        }
    }

    #[test]
    fn compress_decompress() {
        let raw_ply = create_test_ply();
        let options = ParseOptions::default();

        let mut ksplat = Vec::new();
        compress(&raw_ply, &options, 3, 1, &mut ksplat).expect("compress(...) failed");
        assert!(is_zstd_frame(&ksplat));

        let mut plain = Vec::new();
        convert(&raw_ply, &options, &mut plain).unwrap();
        assert_eq!(load(&ksplat).unwrap().as_bytes(), plain.as_slice());

        let mut out_ply = Vec::new();
        decompress(&ksplat, &mut out_ply).expect("decompress(...) failed");
        validate_output_ply(&out_ply, 512);

        let reparsed = parse_ply(&out_ply, &options).unwrap();
        let positions: Vec<Vec3> = (0..reparsed.splat_count())
            .filter(|&i| reparsed.color(i).unwrap()[3] > 0)
            .map(|i| reparsed.position(i).unwrap())
            .collect();
        assert_eq!(positions.len(), 2);
        assert!(positions.contains(&Vec3::new(0.0, 0.1, 0.2)));
        assert!(positions.contains(&Vec3::new(3.0, -2.0, 7.5)));
    }

    #[test]
    fn compression_level_above_maximum_is_rejected() {
        let raw_ply = create_test_ply();
        let mut out = Vec::new();
        assert!(matches!(
            compress(&raw_ply, &ParseOptions::default(), 23, 1, &mut out),
            Err(KsplatError::ZstdCompress(_))
        ));
    }

    #[test]
    fn load_rejects_garbage() {
        assert!(matches!(
            load(&[1, 2, 3, 4]),
            Err(KsplatError::MalformedBuffer(_))
        ));
        let mut truncated_frame = ZSTD_MAGIC.to_vec();
        truncated_frame.extend_from_slice(&[0, 0]);
        assert!(load(&truncated_frame).is_err());

        let mut bytes = Vec::new();
        convert(&create_test_ply(), &ParseOptions::default(), &mut bytes).unwrap();
        bytes.pop();
        assert!(matches!(load(&bytes), Err(KsplatError::MalformedBuffer(_))));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn compress_decompress_async() {
        let raw_ply = create_test_ply();
        let options = ParseOptions {
            compression_level: CompressionLevel::Half,
            ..Default::default()
        };

        let mut ksplat = Vec::new();
        compress_async(&raw_ply, &options, 3, 1, &mut ksplat)
            .await
            .expect("compress_async failed");

        let loaded = load_async(&ksplat).await.expect("load_async failed");
        assert_eq!(
            loaded.as_bytes(),
            parse_ply(&raw_ply, &options).unwrap().as_bytes()
        );
        // The sync and async frames are interchangeable.
        assert_eq!(load(&ksplat).unwrap().as_bytes(), loaded.as_bytes());

        let mut out_ply = Vec::new();
        decompress_async(&ksplat, &mut out_ply)
            .await
            .expect("decompress_async failed");
        validate_output_ply(&out_ply, 512);
    }
}
