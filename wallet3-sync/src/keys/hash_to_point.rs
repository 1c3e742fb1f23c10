//! CryptoNote `hash_to_ec`: Keccak-256 of the input mapped onto the curve with the
//! Elligator-style map of `ge_fromfe_frombytes_vartime`, then cleared of the cofactor.
//!
//! dalek keeps its field arithmetic private, so the map carries its own GF(2^255 - 19).

use std::ops::{Add, Mul, Neg, Sub};

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};

use super::keccak256;

const LOW_51_BITS: u64 = (1 << 51) - 1;

/// Montgomery coefficient of curve25519
const MONTGOMERY_A: u64 = 486_662;

/// `(p - 5) / 8`, little endian
const P_MINUS_5_DIV_8: [u8; 32] = [
    0xfd, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f,
];

/// `p - 2`, little endian
const P_MINUS_2: [u8; 32] = [
    0xeb, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f,
];

/// Element of GF(2^255 - 19) in five 51-bit limbs. Limbs stay below 2^52 between operations.
#[derive(Debug, Clone, Copy)]
struct FieldElement([u64; 5]);

impl FieldElement {
    const ONE: Self = Self([1, 0, 0, 0, 0]);

    fn from_u64(value: u64) -> Self {
        Self::reduce([value & LOW_51_BITS, value >> 51, 0, 0, 0])
    }

    /// Reads all 256 bits. Bit 255 is folded back in as 19 rather than dropped.
    fn from_bytes_wide(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            *word = chunk
                .iter()
                .rev()
                .fold(0, |acc, byte| (acc << 8) | u64::from(*byte));
        }
        let top_bit = words[3] >> 63;
        Self::reduce([
            (words[0] & LOW_51_BITS) + 19 * top_bit,
            ((words[0] >> 51) | (words[1] << 13)) & LOW_51_BITS,
            ((words[1] >> 38) | (words[2] << 26)) & LOW_51_BITS,
            ((words[2] >> 25) | (words[3] << 39)) & LOW_51_BITS,
            (words[3] >> 12) & LOW_51_BITS,
        ])
    }

    /// Canonical little-endian encoding
    fn to_bytes(self) -> [u8; 32] {
        let mut limbs = Self::reduce(self.0).0;

        // q = 1 exactly when the value is at least p
        let mut q = (limbs[0] + 19) >> 51;
        for limb in &limbs[1..] {
            q = (limb + q) >> 51;
        }
        limbs[0] += 19 * q;
        for i in 0..4 {
            limbs[i + 1] += limbs[i] >> 51;
            limbs[i] &= LOW_51_BITS;
        }
        limbs[4] &= LOW_51_BITS;

        let words = [
            limbs[0] | (limbs[1] << 51),
            (limbs[1] >> 13) | (limbs[2] << 38),
            (limbs[2] >> 26) | (limbs[3] << 25),
            (limbs[3] >> 39) | (limbs[4] << 12),
        ];
        let mut bytes = [0u8; 32];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn reduce(mut limbs: [u64; 5]) -> Self {
        let carries = limbs.map(|limb| limb >> 51);
        for limb in limbs.iter_mut() {
            *limb &= LOW_51_BITS;
        }
        limbs[0] += carries[4] * 19;
        for i in 1..5 {
            limbs[i] += carries[i - 1];
        }
        Self(limbs)
    }

    fn is_zero(self) -> bool {
        self.to_bytes() == [0; 32]
    }

    fn square(self) -> Self {
        self * self
    }

    /// `self^exponent` for a little-endian exponent
    fn pow(self, exponent: &[u8; 32]) -> Self {
        let mut result = Self::ONE;
        for byte in exponent.iter().rev() {
            for bit in (0..8).rev() {
                result = result.square();
                if (byte >> bit) & 1 == 1 {
                    result = result * self;
                }
            }
        }
        result
    }

    /// Zero maps to zero
    fn invert(self) -> Self {
        self.pow(&P_MINUS_2)
    }
}

impl Add for FieldElement {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let mut limbs = self.0;
        for (limb, other) in limbs.iter_mut().zip(rhs.0) {
            *limb += other;
        }
        Self::reduce(limbs)
    }
}

impl Sub for FieldElement {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        // 16p keeps every limb positive
        const SIXTEEN_P: [u64; 5] = [
            36_028_797_018_963_664,
            36_028_797_018_963_952,
            36_028_797_018_963_952,
            36_028_797_018_963_952,
            36_028_797_018_963_952,
        ];
        let mut limbs = self.0;
        for i in 0..5 {
            limbs[i] = limbs[i] + SIXTEEN_P[i] - rhs.0[i];
        }
        Self::reduce(limbs)
    }
}

impl Neg for FieldElement {
    type Output = Self;

    fn neg(self) -> Self {
        Self([0; 5]) - self
    }
}

impl Mul for FieldElement {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let wide = |x: u64, y: u64| u128::from(x) * u128::from(y);
        let a = self.0;
        let b = rhs.0;
        let b19 = b.map(|limb| limb * 19);

        let c0 = wide(a[0], b[0])
            + wide(a[4], b19[1])
            + wide(a[3], b19[2])
            + wide(a[2], b19[3])
            + wide(a[1], b19[4]);
        let mut c1 = wide(a[1], b[0])
            + wide(a[0], b[1])
            + wide(a[4], b19[2])
            + wide(a[3], b19[3])
            + wide(a[2], b19[4]);
        let mut c2 = wide(a[2], b[0])
            + wide(a[1], b[1])
            + wide(a[0], b[2])
            + wide(a[4], b19[3])
            + wide(a[3], b19[4]);
        let mut c3 = wide(a[3], b[0])
            + wide(a[2], b[1])
            + wide(a[1], b[2])
            + wide(a[0], b[3])
            + wide(a[4], b19[4]);
        let mut c4 = wide(a[4], b[0])
            + wide(a[3], b[1])
            + wide(a[2], b[2])
            + wide(a[1], b[3])
            + wide(a[0], b[4]);

        c1 += c0 >> 51;
        c2 += c1 >> 51;
        c3 += c2 >> 51;
        c4 += c3 >> 51;
        let carry = (c4 >> 51) as u64;

        let mut limbs = [
            (c0 as u64) & LOW_51_BITS,
            (c1 as u64) & LOW_51_BITS,
            (c2 as u64) & LOW_51_BITS,
            (c3 as u64) & LOW_51_BITS,
            (c4 as u64) & LOW_51_BITS,
        ];
        limbs[0] += carry * 19;
        limbs[1] += limbs[0] >> 51;
        limbs[0] &= LOW_51_BITS;
        Self(limbs)
    }
}

/// Maps `data` to a point of the prime order subgroup the way CryptoNote's `hash_to_ec` does.
/// Returns `None` only if the mapped y coordinate fails to decompress, which the map rules out
/// for every input but is not assumed.
pub(crate) fn hash_to_point(data: &[u8]) -> Option<EdwardsPoint> {
    let a = FieldElement::from_u64(MONTGOMERY_A);
    let u = FieldElement::from_bytes_wide(&keccak256(data));

    let v = u.square() + u.square();
    let w = v + FieldElement::ONE;
    let x = w.square() - a.square() * v;

    // candidate square root of w / x
    let x3 = x.square() * x;
    let x7 = x3.square() * x;
    let root = w * x3 * (w * x7).pow(&P_MINUS_5_DIV_8);
    let check = root.square() * x;

    let negative = !(w - check).is_zero() && !(w + check).is_zero();
    let z = if negative { -a } else { -(a * v) };

    let y = (z - w) * (z + w).invert();
    let mut encoded = y.to_bytes();
    encoded[31] |= u8::from(negative) << 7;
    CompressedEdwardsY(encoded)
        .decompress()
        .map(|point| point.mul_by_cofactor())
}

#[cfg(test)]
mod tests {
    use curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED;
    use test_case::test_case;

    use super::*;

    fn bytes(hex_str: &str) -> [u8; 32] {
        hex::decode(hex_str).unwrap().try_into().unwrap()
    }

    // first row from Monero's tests/crypto/tests.txt, the rest hash 32 repeated bytes
    #[test_case(
        "da66e9ba613919dec28ef367a125bb310d6d83fb9052e71034164b6dc4f392d0",
        "52b3f38753b4e13b74624862e253072cf12f745d43fcfafbe8c217701a6e5875";
        "square branch"
    )]
    #[test_case(
        "0000000000000000000000000000000000000000000000000000000000000000",
        "2d2c4d74df05ba930eaab01825af274eaabcd217bf99dfd54fdf2efe574033f3";
        "non-square branch"
    )]
    #[test_case(
        "0101010101010101010101010101010101010101010101010101010101010101",
        "cc077a353803f70173260ced184179a87fed92c89d4d38e6b43ffd4f099baf22";
        "non-square branch again"
    )]
    #[test_case(
        "0303030303030303030303030303030303030303030303030303030303030303",
        "edf8cf4316b96b8678fa818c77c0afdcd3150e98d4d2e8d50781dc76bc025a68";
        "square branch again"
    )]
    fn matches_cryptonote_hash_to_ec(input: &str, expected: &str) {
        let point = hash_to_point(&bytes(input)).unwrap();

        assert_eq!(hex::encode(point.compress().to_bytes()), expected);
    }

    #[test]
    fn keccak_reproduces_the_pedersen_generator() {
        let hashed = keccak256(ED25519_BASEPOINT_COMPRESSED.as_bytes());
        let generator = CompressedEdwardsY(hashed)
            .decompress()
            .unwrap()
            .mul_by_cofactor();

        assert_eq!(
            hex::encode(generator.compress().to_bytes()),
            "8b655970153799af2aeadc9ff1add0ea6c7251d54154cfa92c173a0dd39c1f94"
        );
    }

    #[test]
    fn wide_load_folds_the_top_bit() {
        // 2^256 - 1 = 37 (mod p)
        let mut expected = [0u8; 32];
        expected[0] = 37;

        assert_eq!(FieldElement::from_bytes_wide(&[0xff; 32]).to_bytes(), expected);
    }

    #[test]
    fn inverse_and_negation_agree_with_the_field() {
        let value = FieldElement::from_bytes_wide(&keccak256(b"field"));

        assert_eq!((value * value.invert()).to_bytes(), FieldElement::ONE.to_bytes());
        assert!((value + (-value)).is_zero());
        assert!(!value.is_zero());
    }
}
