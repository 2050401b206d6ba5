use crate::bucket::{
    compute_buckets, DEFAULT_BUCKET_BLOCK_SIZE, DEFAULT_BUCKET_SIZE, INVALID_SPLAT_INDEX,
};
use crate::buffer::{BucketTable, SplatBuffer};
use crate::common::{clamp_u8, inv_sigmoid, sigmoid, SH_C0};
use crate::error::{KsplatError, Result};
use crate::layout::CompressionLevel;
use glam::{Quat, Vec3};
use log::{debug, info};
use memchr::memmem;
use std::io::Write;
use std::time::Instant;

pub const HEADER_TERMINATOR: &[u8] = b"end_header";
/// The header is searched for its terminator in increments of this many bytes.
const HEADER_SCAN_CHUNK: usize = 50;

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub compression_level: CompressionLevel,
    /// Splats whose alpha (0..255) is not strictly above this are dropped.
    pub minimum_alpha: f32,
    pub bucket_size: usize,
    pub block_size: f32,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            compression_level: CompressionLevel::Full,
            minimum_alpha: 1.0,
            bucket_size: DEFAULT_BUCKET_SIZE,
            block_size: DEFAULT_BUCKET_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl ScalarType {
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "char" | "int8" => ScalarType::Char,
            "uchar" | "uint8" => ScalarType::UChar,
            "short" | "int16" => ScalarType::Short,
            "ushort" | "uint16" => ScalarType::UShort,
            "int" | "int32" => ScalarType::Int,
            "uint" | "uint32" => ScalarType::UInt,
            "float" | "float32" => ScalarType::Float,
            "double" | "float64" => ScalarType::Double,
            _ => return None,
        };
        Some(ty)
    }

    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ScalarType::Char | ScalarType::UChar => 1,
            ScalarType::Short | ScalarType::UShort => 2,
            ScalarType::Int | ScalarType::UInt | ScalarType::Float => 4,
            ScalarType::Double => 8,
        }
    }

    /// Reads one value; `uchar` is normalized to 0..1.
    #[inline]
    fn read(self, row: &[u8], offset: usize) -> f32 {
        let mut b = [0u8; 8];
        b[..self.size()].copy_from_slice(&row[offset..offset + self.size()]);
        match self {
            ScalarType::Char => b[0] as i8 as f32,
            ScalarType::UChar => b[0] as f32 / 255.0,
            ScalarType::Short => i16::from_le_bytes([b[0], b[1]]) as f32,
            ScalarType::UShort => u16::from_le_bytes([b[0], b[1]]) as f32,
            ScalarType::Int => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
            ScalarType::UInt => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
            ScalarType::Float => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ScalarType::Double => f64::from_le_bytes(b) as f32,
        }
    }
}

/// The vertex properties ingestion understands. Everything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatProperty {
    X,
    Y,
    Z,
    Scale0,
    Scale1,
    Scale2,
    Rot0,
    Rot1,
    Rot2,
    Rot3,
    FDc0,
    FDc1,
    FDc2,
    Opacity,
}

const SPLAT_PROPERTY_COUNT: usize = 14;

impl SplatProperty {
    pub fn from_name(name: &str) -> Option<Self> {
        let p = match name {
            "x" => SplatProperty::X,
            "y" => SplatProperty::Y,
            "z" => SplatProperty::Z,
            "scale_0" => SplatProperty::Scale0,
            "scale_1" => SplatProperty::Scale1,
            "scale_2" => SplatProperty::Scale2,
            "rot_0" => SplatProperty::Rot0,
            "rot_1" => SplatProperty::Rot1,
            "rot_2" => SplatProperty::Rot2,
            "rot_3" => SplatProperty::Rot3,
            "f_dc_0" => SplatProperty::FDc0,
            "f_dc_1" => SplatProperty::FDc1,
            "f_dc_2" => SplatProperty::FDc2,
            "opacity" => SplatProperty::Opacity,
            _ => return None,
        };
        Some(p)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlyProperty {
    pub name: String,
    pub scalar: ScalarType,
    /// Byte offset within a vertex row.
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct PlyHeader {
    pub vertex_count: usize,
    /// Vertex properties in declaration order.
    pub properties: Vec<PlyProperty>,
    pub row_size: usize,
    /// Offset of the first vertex row in the input.
    pub data_offset: usize,
}

#[inline]
fn header_error(msg: impl Into<String>) -> KsplatError {
    KsplatError::HeaderParse(msg.into())
}

fn find_header_terminator(raw: &[u8]) -> Result<usize> {
    let finder = memmem::Finder::new(HEADER_TERMINATOR);
    let mut scanned = 0;
    while scanned < raw.len() {
        let end = (scanned + HEADER_SCAN_CHUNK).min(raw.len());
        // Re-check the tail of the previous chunk for a terminator split across chunks.
        let window_start = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        if let Some(pos) = finder.find(&raw[window_start..end]) {
            return Ok(window_start + pos);
        }
        scanned = end;
    }
    Err(header_error("No 'end_header' found before EOF"))
}

pub fn decode_header(raw: &[u8]) -> Result<PlyHeader> {
    let terminator = find_header_terminator(raw)?;
    let data_offset = match memchr::memchr(b'\n', &raw[terminator..]) {
        Some(pos) => terminator + pos + 1,
        None => raw.len(),
    };
    let text = std::str::from_utf8(&raw[..terminator])
        .map_err(|e| header_error(format!("UTF-8 error: {}", e)))?;

    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some("ply") {
        return Err(header_error("Not a .ply file (missing 'ply' header)"));
    }

    let mut vertex_count = None;
    let mut in_vertex_element = false;
    let mut seen_element = false;
    let mut properties = Vec::new();
    let mut row_size = 0usize;

    for line in lines {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            None | Some("comment") | Some("obj_info") => {}
            Some("format") => {
                if tokens.next() != Some("binary_little_endian") {
                    return Err(header_error(format!(
                        "Unsupported .ply format '{}' (only binary_little_endian is supported)",
                        line
                    )));
                }
            }
            Some("element") => {
                let name = tokens
                    .next()
                    .ok_or_else(|| header_error(format!("Malformed element line: {}", line)))?;
                let count: usize = tokens
                    .next()
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| header_error(format!("Malformed element line: {}", line)))?;
                seen_element = true;
                in_vertex_element = name == "vertex";
                if in_vertex_element {
                    if vertex_count.is_some() {
                        return Err(header_error("Duplicate 'element vertex' definition"));
                    }
                    vertex_count = Some(count);
                } else if vertex_count.is_none() && count > 0 {
                    return Err(header_error(format!(
                        "Element '{}' precedes the vertex element",
                        name
                    )));
                }
            }
            Some("property") => {
                if !seen_element {
                    return Err(header_error(format!("Property outside an element: {}", line)));
                }
                if !in_vertex_element {
                    continue;
                }
                let type_name = tokens
                    .next()
                    .ok_or_else(|| header_error(format!("Malformed property line: {}", line)))?;
                if type_name == "list" {
                    return Err(header_error(format!("Unsupported list property: {}", line)));
                }
                let scalar = ScalarType::from_name(type_name).ok_or_else(|| {
                    header_error(format!("Unsupported property type '{}'", type_name))
                })?;
                let name = tokens
                    .next()
                    .ok_or_else(|| header_error(format!("Malformed property line: {}", line)))?;
                properties.push(PlyProperty {
                    name: name.to_string(),
                    scalar,
                    offset: row_size,
                });
                row_size += scalar.size();
            }
            Some(_) => {
                return Err(header_error(format!("Unexpected header line: {}", line)));
            }
        }
    }

    let vertex_count =
        vertex_count.ok_or_else(|| header_error("Missing 'element vertex' definition"))?;

    Ok(PlyHeader {
        vertex_count,
        properties,
        row_size,
        data_offset,
    })
}

/// Known properties resolved to their row offsets once per file.
struct FieldTable {
    fields: [Option<(usize, ScalarType)>; SPLAT_PROPERTY_COUNT],
}

impl FieldTable {
    fn new(header: &PlyHeader) -> Self {
        let mut fields = [None; SPLAT_PROPERTY_COUNT];
        for property in &header.properties {
            if let Some(known) = SplatProperty::from_name(&property.name) {
                let slot = &mut fields[known as usize];
                // first declaration wins
                if slot.is_none() {
                    *slot = Some((property.offset, property.scalar));
                }
            }
        }
        FieldTable { fields }
    }

    #[inline]
    fn has(&self, property: SplatProperty) -> bool {
        self.fields[property as usize].is_some()
    }

    #[inline]
    fn read(&self, row: &[u8], property: SplatProperty) -> f32 {
        match self.fields[property as usize] {
            Some((offset, scalar)) => scalar.read(row, offset),
            None => 0.0,
        }
    }

    fn read_splat(&self, row: &[u8]) -> RawSplat {
        use SplatProperty::*;
        RawSplat {
            position: Vec3::new(self.read(row, X), self.read(row, Y), self.read(row, Z)),
            log_scale: Vec3::new(
                self.read(row, Scale0),
                self.read(row, Scale1),
                self.read(row, Scale2),
            ),
            rotation: [
                self.read(row, Rot0),
                self.read(row, Rot1),
                self.read(row, Rot2),
                self.read(row, Rot3),
            ],
            f_dc: Vec3::new(self.read(row, FDc0), self.read(row, FDc1), self.read(row, FDc2)),
            opacity: self.read(row, Opacity),
        }
    }
}

/// One decoded vertex row, before any transform.
#[derive(Debug, Clone, Copy)]
struct RawSplat {
    position: Vec3,
    log_scale: Vec3,
    /// `rot_0..rot_3`, i.e. `(w, x, y, z)`.
    rotation: [f32; 4],
    f_dc: Vec3,
    opacity: f32,
}

/// Record stored at `INVALID_SPLAT_INDEX` of the retained set.
const SENTINEL_SPLAT: RawSplat = RawSplat {
    position: Vec3::ZERO,
    log_scale: Vec3::splat(0.01),
    rotation: [1.0, 0.0, 0.0, 0.0],
    f_dc: Vec3::splat(0.0001),
    opacity: 0.0,
};

const DEFAULT_SCALE: Vec3 = Vec3::splat(0.01);
const DEFAULT_RGB: [u8; 3] = [255, 0, 0];
const SENTINEL_RGBA: [u8; 4] = [255, 0, 0, 0];

struct SplatEncoder {
    has_scale: bool,
    has_color: bool,
    has_opacity: bool,
}

impl SplatEncoder {
    fn encode(
        &self,
        buffer: &mut SplatBuffer,
        index: usize,
        raw: &RawSplat,
        is_sentinel: bool,
    ) -> Result<()> {
        // Rotation follows the scale properties, as both come from the same fit.
        if self.has_scale {
            let [w, x, y, z] = raw.rotation;
            buffer.set_rotation(index, Quat::from_xyzw(x, y, z, w))?;
            let s = raw.log_scale;
            buffer.set_scale(index, Vec3::new(s.x.exp(), s.y.exp(), s.z.exp()))?;
        } else {
            buffer.set_scale(index, DEFAULT_SCALE)?;
            buffer.set_rotation(index, Quat::IDENTITY)?;
        }

        buffer.set_position(index, raw.position)?;

        let rgba = if is_sentinel {
            SENTINEL_RGBA
        } else {
            let [r, g, b] = if self.has_color {
                let c = (Vec3::splat(0.5) + raw.f_dc * SH_C0) * 255.0;
                [clamp_u8(c.x), clamp_u8(c.y), clamp_u8(c.z)]
            } else {
                DEFAULT_RGB
            };
            let a = if self.has_opacity {
                clamp_u8(sigmoid(raw.opacity) * 255.0)
            } else {
                255
            };
            [r, g, b, a]
        };
        buffer.set_color(index, rgba)
    }
}

#[inline(never)]
pub fn parse_ply(raw_data: &[u8], options: &ParseOptions) -> Result<SplatBuffer> {
    if options.bucket_size == 0
        || u32::try_from(options.bucket_size).is_err()
        || !(options.block_size.is_finite() && options.block_size > 0.0)
    {
        return Err(KsplatError::MalformedBuffer(format!(
            "Invalid bucket configuration: size {}, block size {}",
            options.bucket_size, options.block_size
        )));
    }

    let start = Instant::now();
    info!("Parsing PLY to splat buffer...");

    let header = decode_header(raw_data)?;
    debug!(
        "PLY header: {} vertices, {} byte rows, properties {:?}",
        header.vertex_count,
        header.row_size,
        header
            .properties
            .iter()
            .map(|p| (p.name.as_str(), p.scalar, p.offset))
            .collect::<Vec<_>>()
    );

    if header.vertex_count > 0 && header.row_size == 0 {
        return Err(header_error("Vertex element declares no properties"));
    }
    let expected_bytes = header
        .vertex_count
        .checked_mul(header.row_size)
        .ok_or_else(|| header_error("Overflow in byte calculation"))?;
    let available = raw_data.len().saturating_sub(header.data_offset);
    if available < expected_bytes {
        return Err(header_error(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes, available
        )));
    }
    let data = &raw_data[header.data_offset..header.data_offset + expected_bytes];

    let table = FieldTable::new(&header);
    let encoder = SplatEncoder {
        has_scale: table.has(SplatProperty::Scale0),
        has_color: table.has(SplatProperty::FDc0),
        has_opacity: table.has(SplatProperty::Opacity),
    };

    let mut retained = Vec::with_capacity(header.vertex_count + 1);
    retained.push(SENTINEL_SPLAT);
    if header.row_size > 0 {
        for row in data.chunks_exact(header.row_size) {
            let splat = table.read_splat(row);
            let alpha = if encoder.has_opacity {
                sigmoid(splat.opacity) * 255.0
            } else {
                255.0
            };
            if alpha > options.minimum_alpha {
                retained.push(splat);
            }
        }
    }
    info!(
        "Total valid splats: {} out of {}",
        retained.len() - 1,
        header.vertex_count
    );

    let positions: Vec<Vec3> = retained.iter().map(|s| s.position).collect();
    let buckets = compute_buckets(&positions, options.bucket_size, options.block_size)?;
    let padded_splat_count = buckets.len() * options.bucket_size;

    let mut buffer = SplatBuffer::new(
        options.compression_level,
        padded_splat_count,
        BucketTable {
            bucket_size: options.bucket_size as u32,
            block_size: options.block_size,
            centers: buckets.iter().map(|b| b.center).collect(),
        },
    )?;

    let mut out_index = 0;
    for bucket in &buckets {
        for &row in &bucket.splats {
            let is_sentinel = row == INVALID_SPLAT_INDEX;
            encoder.encode(&mut buffer, out_index, &retained[row as usize], is_sentinel)?;
            out_index += 1;
        }
    }

    info!(
        "Parsing PLY complete: {} buckets, {} padded splats, {:.2} ms",
        buckets.len(),
        padded_splat_count,
        start.elapsed().as_secs_f64() * 1000.0
    );

    Ok(buffer)
}

/// Writes every slot of `buffer`, sentinels included, as a binary PLY that
/// `parse_ply` reads back.
pub fn write_ply(buffer: &SplatBuffer, output: &mut Vec<u8>) -> Result<()> {
    let num_points = buffer.splat_count();

    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", num_points)?;
    output.extend_from_slice(
        b"property float x\nproperty float y\nproperty float z\n\
          property float f_dc_0\nproperty float f_dc_1\nproperty float f_dc_2\n\
          property float opacity\n\
          property float scale_0\nproperty float scale_1\nproperty float scale_2\n\
          property float rot_0\nproperty float rot_1\nproperty float rot_2\nproperty float rot_3\n\
          end_header\n",
    );
    output.reserve(num_points * 14 * 4);

    for i in 0..num_points {
        let position = buffer.position(i)?;
        let scale = buffer.scale(i)?;
        let rotation = buffer.rotation(i)?;
        let [r, g, b, a] = buffer.color(i)?;

        let f_dc = (Vec3::new(r as f32, g as f32, b as f32) / 255.0 - Vec3::splat(0.5)) / SH_C0;
        // Keep the logit finite; 0.25 and 254.75 still round back to 0 and 255.
        let alpha = (a as f32 / 255.0).clamp(0.25 / 255.0, 254.75 / 255.0);

        let values = [
            position.x,
            position.y,
            position.z,
            f_dc.x,
            f_dc.y,
            f_dc.z,
            inv_sigmoid(alpha),
            scale.x.ln(),
            scale.y.ln(),
            scale.z.ln(),
            rotation.w,
            rotation.x,
            rotation.y,
            rotation.z,
        ];
        for v in values {
            output.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(())
}
