//! Width minimization for IEEE 754 floats.
//!
//! Canonical CBOR wants every float at the narrowest of the binary16/32/64
//! interchange formats that reproduces it exactly. This module picks the
//! width and hands back the raw bit pattern; the encoder owns putting it
//! on the wire big-endian.

use num_traits::FromPrimitive;

pub(crate) struct Smallest {
    pub bits: u64,
    /// 2, 4 or 8. Passed to the header codec as a forced minimum so a bit
    /// pattern with zero trailing bytes still emits its full width.
    pub width: usize,
}

fn lossless_coerce<T>(value: f64) -> Option<T>
where
    T: FromPrimitive + Into<f64> + Copy,
{
    match T::from_f64(value) {
        Some(f) if <T as Into<f64>>::into(f) == value => Some(f),
        _ => None,
    }
}

/// Comparison is by value, so the infinities narrow to binary16 and NaN
/// never narrows at all: its payload bits stay exactly as given.
pub(crate) fn smallest(value: f64) -> Smallest {
    if let Some(f) = lossless_coerce::<half::f16>(value) {
        Smallest {
            bits: f.to_bits() as u64,
            width: 2,
        }
    } else if let Some(f) = lossless_coerce::<f32>(value) {
        Smallest {
            bits: f.to_bits() as u64,
            width: 4,
        }
    } else {
        Smallest {
            bits: value.to_bits(),
            width: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widths(value: f64) -> usize {
        smallest(value).width
    }

    #[test]
    fn narrowest_width_wins() {
        assert_eq!(widths(0.0), 2);
        assert_eq!(widths(-0.0), 2);
        assert_eq!(widths(1.5), 2);
        assert_eq!(widths(65504.0), 2);
        assert_eq!(widths(100000.0), 4);
        assert_eq!(widths(3.4028234663852886e38), 4);
        assert_eq!(widths(1.1), 8);
        assert_eq!(widths(1.0e300), 8);
    }

    #[test]
    fn infinities_narrow() {
        assert_eq!(widths(f64::INFINITY), 2);
        assert_eq!(widths(f64::NEG_INFINITY), 2);
    }

    #[test]
    fn nan_keeps_its_payload() {
        let s = smallest(f64::NAN);
        assert_eq!(s.width, 8);
        assert_eq!(s.bits, f64::NAN.to_bits());
    }

    #[test]
    fn subnormals() {
        // Smallest positive binary16 subnormal.
        assert_eq!(widths(5.960464477539063e-8), 2);
        // Far below binary16 range, exactly a binary32 subnormal.
        let s = smallest(f32::from_bits(7) as f64);
        assert_eq!(s.width, 4);
        assert_eq!(s.bits, 7);
    }
}
