//! Byte counts as written in configuration: `65536`, `0x10000`, `64K`,
//! `256 M`, `4g`. Suffixes are binary multiples.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size string")]
    Empty,
    #[error("invalid number in size '{0}'")]
    InvalidNumber(String),
    #[error("unknown size suffix '{suffix}' in '{input}'")]
    UnknownSuffix { input: String, suffix: String },
    #[error("size '{0}' overflows 64 bits")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub const fn kib(n: u64) -> Self {
        Self(n * KIB)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }
}

pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    let split = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let (number, rest) = digits.split_at(split);
    if number.is_empty() {
        return Err(SizeParseError::InvalidNumber(input.to_string()));
    }
    let value = u64::from_str_radix(number, radix)
        .map_err(|_| SizeParseError::InvalidNumber(input.to_string()))?;

    let multiplier = match rest.trim() {
        "" => 1,
        "K" | "k" => KIB,
        "M" | "m" => MIB,
        "G" | "g" => GIB,
        other => {
            return Err(SizeParseError::UnknownSuffix {
                input: input.to_string(),
                suffix: other.to_string(),
            })
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::Overflow(input.to_string()))
}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(ByteSize)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        if b != 0 && b % GIB == 0 {
            write!(f, "{}G", b / GIB)
        } else if b != 0 && b % MIB == 0 {
            write!(f, "{}M", b / MIB)
        } else if b != 0 && b % KIB == 0 {
            write!(f, "{}K", b / KIB)
        } else {
            write!(f, "{}", b)
        }
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a string like \"64K\", \"256M\", \"4G\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("negative size {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed() {
        assert_eq!(parse_size("65536"), Ok(65536));
        assert_eq!(parse_size("64K"), Ok(64 * KIB));
        assert_eq!(parse_size("64k"), Ok(64 * KIB));
        assert_eq!(parse_size("256 M"), Ok(256 * MIB));
        assert_eq!(parse_size(" 4G "), Ok(4 * GIB));
        assert_eq!(parse_size("0x10000"), Ok(0x10000));
        assert_eq!(parse_size("0x1M"), Ok(MIB));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_size(""), Err(SizeParseError::Empty));
        assert!(matches!(
            parse_size("G"),
            Err(SizeParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_size("12T"),
            Err(SizeParseError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            parse_size("99999999999999G"),
            Err(SizeParseError::Overflow(_))
        ));
    }

    #[test]
    fn display_picks_largest_exact_unit() {
        assert_eq!(ByteSize::gib(4).to_string(), "4G");
        assert_eq!(ByteSize::mib(256).to_string(), "256M");
        assert_eq!(ByteSize(1536).to_string(), "1536");
        assert_eq!(ByteSize(0).to_string(), "0");
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        let a: ByteSize = serde_json::from_str("4096").unwrap();
        let b: ByteSize = serde_json::from_str("\"2M\"").unwrap();
        assert_eq!(a, ByteSize(4096));
        assert_eq!(b, ByteSize::mib(2));
        assert!(serde_json::from_str::<ByteSize>("-1").is_err());
        assert!(serde_json::from_str::<ByteSize>("\"lots\"").is_err());
    }
}
