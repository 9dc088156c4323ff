//! Bijective mapping between sequential file identifiers and 6-digit public codes.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const CODE_LENGTH: usize = 6;
pub const CODE_MODULUS: u32 = 1_000_000;
pub const CODE_MULTIPLIER: u32 = 512_927;
/// Highest identifier handed out by the identifier sequence before it cycles back to 1.
pub const CODE_PERIOD: u32 = CODE_MODULUS - 1;

/// Modular inverse of [`CODE_MULTIPLIER`] modulo [`CODE_MODULUS`].
const CODE_MULTIPLIER_INVERSE: u32 = 872_863;

/// A public download code: always exactly six ASCII digits, zero padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicCode(u32);

impl PublicCode {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        if value.len() != CODE_LENGTH || !value.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(CoreError::InvalidCode);
        }
        value
            .parse::<u32>()
            .map(Self)
            .map_err(|_| CoreError::InvalidCode)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl Display for PublicCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl FromStr for PublicCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PublicCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PublicCode> for String {
    fn from(value: PublicCode) -> Self {
        value.to_string()
    }
}

/// Multiplies an identifier by a multiplier coprime with 10^6 and reduces it.
///
/// Coprimality makes the mapping a permutation of `[0, 10^6)`, so no two
/// identifiers inside one cycle share a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCodec {
    multiplier: u64,
    inverse: u64,
}

impl CodeCodec {
    pub fn new(multiplier: u32) -> Result<Self, CoreError> {
        let modulus = u64::from(CODE_MODULUS);
        let multiplier = u64::from(multiplier) % modulus;
        if gcd(multiplier, modulus) != 1 {
            return Err(CoreError::MultiplierNotCoprime {
                multiplier,
                modulus,
            });
        }
        let inverse =
            modular_inverse(multiplier, modulus).ok_or(CoreError::MultiplierNotCoprime {
                multiplier,
                modulus,
            })?;
        Ok(Self {
            multiplier,
            inverse,
        })
    }

    /// The codec used by the file table: multiplier 512927.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            multiplier: CODE_MULTIPLIER as u64,
            inverse: CODE_MULTIPLIER_INVERSE as u64,
        }
    }

    pub fn encode(&self, internal_id: i64) -> Result<PublicCode, CoreError> {
        let internal_id = u64::try_from(internal_id)
            .ok()
            .filter(|value| *value > 0)
            .ok_or(CoreError::InvalidInternalId(internal_id))?;
        let modulus = u64::from(CODE_MODULUS);
        let residue = ((internal_id % modulus) * self.multiplier) % modulus;
        // residue < 10^6 always fits in u32
        Ok(PublicCode(residue as u32))
    }

    /// Returns the identifier residue (modulo 10^6) that encodes to `code`.
    #[must_use]
    pub fn decode(&self, code: PublicCode) -> u32 {
        let modulus = u64::from(CODE_MODULUS);
        ((u64::from(code.0) * self.inverse) % modulus) as u32
    }
}

impl Default for CodeCodec {
    fn default() -> Self {
        Self::standard()
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let remainder = a % b;
        a = b;
        b = remainder;
    }
    a
}

fn modular_inverse(value: u64, modulus: u64) -> Option<u64> {
    let (mut old_r, mut r) = (i128::from(value), i128::from(modulus));
    let (mut old_s, mut s) = (1_i128, 0_i128);
    while r != 0 {
        let quotient = old_r / r;
        (old_r, r) = (r, old_r - quotient * r);
        (old_s, s) = (s, old_s - quotient * s);
    }
    if old_r != 1 {
        return None;
    }
    u64::try_from(old_s.rem_euclid(i128::from(modulus))).ok()
}
