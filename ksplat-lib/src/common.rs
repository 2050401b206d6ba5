use glam::Quat;
use half::f16;

pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Zeroth-order spherical harmonic constant used for `f_dc_*` color terms.
pub const SH_C0: f32 = 0.282_094_8;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn inv_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

#[inline]
pub(crate) fn half_to_float(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[inline]
pub(crate) fn float_to_half(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

/// Normalizes a quaternion; a zero-length input becomes the identity.
#[inline]
pub(crate) fn normalize_quat(q: Quat) -> Quat {
    let norm = q.length();
    if norm == 0.0 || !norm.is_finite() {
        Quat::IDENTITY
    } else {
        q / norm
    }
}

#[inline]
pub(crate) fn read_f32(data: &[u8], offset: usize) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    f32::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_f32(data: &mut [u8], offset: usize, value: f32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub(crate) fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_quaternion_normalizes_to_identity() {
        assert_eq!(normalize_quat(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0)), Quat::IDENTITY);
        let q = normalize_quat(Quat::from_xyzw(0.0, 0.0, 0.0, 2.0));
        assert!((q.w - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sigmoid_and_inverse_agree() {
        assert_eq!(sigmoid(0.0), 0.5);
        let x = 1.25;
        assert!((inv_sigmoid(sigmoid(x)) - x).abs() < 1e-4);
    }
}
