//! Size quantities and the unit convention shared with the quota backend.
//!
//! Capacities travel in two notations:
//!
//! - **Orchestrator quantities** (`10Gi`, `512Mi`, `100G`, `1000`): binary
//!   suffixes (`Ki`..`Ei`), decimal suffixes (`k`, `M`..`E`) or plain bytes.
//! - **Backend sizes** (`10G`, `1.5M`, `0`): a single letter suffix that the
//!   quota tool always reads as a binary multiple.
//!
//! [`convert_unit`] maps the first notation onto the second by dropping the
//! `i` of a binary suffix. Everything compared against a value read back from
//! the backend goes through [`parse_backend_size`], so both sides of a
//! comparison use the same convention.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Binary suffixes that [`convert_unit`] rewrites.
const BINARY_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// Maximum number of fractional digits accepted in a size literal.
const MAX_FRACTION_DIGITS: usize = 9;

/// Errors produced while parsing sizes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnitError {
    /// The literal is empty.
    #[error("empty size literal")]
    Empty,

    /// The literal could not be parsed.
    #[error("invalid size literal {value:?}: {reason}")]
    Invalid {
        /// The offending literal.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The literal does not fit in 64 bits of bytes.
    #[error("size literal {0:?} overflows u64 bytes")]
    Overflow(String),
}

impl UnitError {
    fn invalid(value: &str, reason: &'static str) -> Self {
        Self::Invalid {
            value: value.to_string(),
            reason,
        }
    }
}

/// Rewrites an orchestrator binary suffix into the backend convention.
///
/// `10Gi` becomes `10G`; values without a binary suffix are returned
/// unchanged.
#[must_use]
pub fn convert_unit(value: &str) -> String {
    for suffix in BINARY_SUFFIXES {
        if let Some(stem) = value.strip_suffix(suffix) {
            return format!("{stem}{}", &suffix[..1]);
        }
    }
    value.to_string()
}

/// Parses a size in the backend convention into bytes.
///
/// Accepts an optional fractional part and an optional single-letter suffix
/// (`K`, `M`, `G`, `T`, `P`, `E`, either case), each a power of 1024. A bare
/// number is a byte count.
///
/// # Errors
///
/// Returns [`UnitError`] if the literal is malformed or overflows.
pub fn parse_backend_size(value: &str) -> Result<u64, UnitError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(UnitError::Empty);
    }

    let (number, shift) = match value.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                'P' => 50,
                'E' => 60,
                _ => return Err(UnitError::invalid(value, "unknown unit suffix")),
            };
            (&value[..value.len() - 1], shift)
        },
        _ => (value, 0),
    };

    scale(value, number, 1u128 << shift)
}

/// `bytes` as the backend's human-readable report shows it: in the largest
/// unit that fits, rounded to one decimal, then read back into bytes.
#[must_use]
pub fn displayed_size(bytes: u64) -> u64 {
    let Some(shift) = [60u32, 50, 40, 30, 20, 10]
        .into_iter()
        .find(|&shift| bytes >> shift > 0)
    else {
        return bytes;
    };

    let unit = 1u128 << shift;
    let tenths = (u128::from(bytes) * 10 + unit / 2) / unit;
    let shown = (tenths / 10) * unit + (tenths % 10 * unit).div_ceil(10);
    u64::try_from(shown).unwrap_or(u64::MAX)
}

/// Whether two sizes look the same in the backend's human-readable report.
#[must_use]
pub fn same_displayed_size(a: u64, b: u64) -> bool {
    a == b || displayed_size(a) == displayed_size(b)
}

/// An orchestrator resource quantity expressed in bytes.
///
/// Keeps the literal it was parsed from so it can be echoed back unchanged
/// (e.g. when recording the requested size of a claim).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantity {
    literal: String,
    bytes: u64,
}

impl Quantity {
    /// Parses an orchestrator quantity such as `10Gi`, `500M` or `1024`.
    ///
    /// Fractional values are rounded up to the next whole byte.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError`] for empty, malformed or overflowing literals.
    pub fn parse(value: &str) -> Result<Self, UnitError> {
        let literal = value.trim();
        if literal.is_empty() {
            return Err(UnitError::Empty);
        }

        let split = literal
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(literal.len());
        let (number, suffix) = literal.split_at(split);

        let multiplier: u128 = match suffix {
            "" => 1,
            "Ki" => 1 << 10,
            "Mi" => 1 << 20,
            "Gi" => 1 << 30,
            "Ti" => 1 << 40,
            "Pi" => 1 << 50,
            "Ei" => 1 << 60,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            "P" => 1_000_000_000_000_000,
            "E" => 1_000_000_000_000_000_000,
            _ => return Err(UnitError::invalid(literal, "unknown quantity suffix")),
        };

        let bytes = scale(literal, number, multiplier)?;
        Ok(Self {
            literal: literal.to_string(),
            bytes,
        })
    }

    /// Builds a whole-GiB quantity (`{n}Gi`).
    #[must_use]
    pub fn from_gibibytes(gib: u64) -> Self {
        Self {
            literal: format!("{gib}Gi"),
            bytes: gib.saturating_mul(1 << 30),
        }
    }

    /// The literal this quantity was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.literal
    }

    /// The size in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

impl FromStr for Quantity {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Multiplies a decimal literal (`12` or `1.25`) by `multiplier`, rounding any
/// fractional remainder up.
fn scale(literal: &str, number: &str, multiplier: u128) -> Result<u64, UnitError> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));

    if whole.is_empty() && fraction.is_empty() {
        return Err(UnitError::invalid(literal, "missing digits"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(UnitError::invalid(literal, "non-digit characters"));
    }
    if fraction.len() > MAX_FRACTION_DIGITS {
        return Err(UnitError::invalid(literal, "too many fractional digits"));
    }

    let overflow = || UnitError::Overflow(literal.to_string());

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(overflow)?;

    if !fraction.is_empty() {
        let denominator = 10u128.pow(u32::try_from(fraction.len()).map_err(|_| overflow())?);
        let numerator: u128 = fraction.parse().map_err(|_| overflow())?;
        let scaled = numerator.checked_mul(multiplier).ok_or_else(overflow)?;
        bytes = bytes
            .checked_add(scaled.div_ceil(denominator))
            .ok_or_else(overflow)?;
    }

    u64::try_from(bytes).map_err(|_| overflow())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;
    const MIB: u64 = 1 << 20;

    #[test]
    fn displayed_size_rounds_to_one_decimal() {
        assert_eq!(displayed_size(1500 * MIB), parse_backend_size("1.5G").unwrap());
        assert_eq!(displayed_size(10 * GIB), 10 * GIB);
        assert_eq!(displayed_size(900 * MIB), 900 * MIB);
        assert_eq!(displayed_size(512), 512);
        assert_eq!(displayed_size(0), 0);
    }

    #[test]
    fn same_displayed_size_tolerates_report_rounding() {
        assert!(same_displayed_size(1500 * MIB, parse_backend_size("1.5G").unwrap()));
        assert!(!same_displayed_size(1500 * MIB, 2 * GIB));
        assert!(!same_displayed_size(GIB, 0));
    }

    #[test]
    fn convert_unit_strips_binary_marker() {
        assert_eq!(convert_unit("10Gi"), "10G");
        assert_eq!(convert_unit("512Mi"), "512M");
        assert_eq!(convert_unit("2Ti"), "2T");
    }

    #[test]
    fn convert_unit_leaves_other_values_alone() {
        assert_eq!(convert_unit("5"), "5");
        assert_eq!(convert_unit("10G"), "10G");
        assert_eq!(convert_unit(""), "");
    }

    #[test]
    fn backend_sizes_are_binary() {
        assert_eq!(parse_backend_size("0").unwrap(), 0);
        assert_eq!(parse_backend_size("4K").unwrap(), 4096);
        assert_eq!(parse_backend_size("10G").unwrap(), 10 * GIB);
        assert_eq!(parse_backend_size("10g").unwrap(), 10 * GIB);
        assert_eq!(parse_backend_size("1.5M").unwrap(), MIB + MIB / 2);
        assert_eq!(parse_backend_size(" 2T ").unwrap(), 2 << 40);
    }

    #[test]
    fn backend_size_matches_converted_quantity() {
        let annotation = "10Gi";
        let expected = parse_backend_size(&convert_unit(annotation)).unwrap();
        assert_eq!(expected, Quantity::parse(annotation).unwrap().bytes());
    }

    #[test]
    fn backend_size_rejects_garbage() {
        assert_eq!(parse_backend_size(""), Err(UnitError::Empty));
        assert!(parse_backend_size("G").is_err());
        assert!(parse_backend_size("10X").is_err());
        assert!(parse_backend_size("1-0").is_err());
        assert!(matches!(
            parse_backend_size("99999999999E"),
            Err(UnitError::Overflow(_))
        ));
    }

    #[test]
    fn quantity_binary_and_decimal_suffixes() {
        assert_eq!(Quantity::parse("1Ki").unwrap().bytes(), 1024);
        assert_eq!(Quantity::parse("10Gi").unwrap().bytes(), 10 * GIB);
        assert_eq!(Quantity::parse("1k").unwrap().bytes(), 1_000);
        assert_eq!(Quantity::parse("5G").unwrap().bytes(), 5_000_000_000);
        assert_eq!(Quantity::parse("1000").unwrap().bytes(), 1_000);
        assert_eq!(Quantity::parse("1.5Gi").unwrap().bytes(), GIB + GIB / 2);
    }

    #[test]
    fn quantity_rounds_fractional_bytes_up() {
        assert_eq!(Quantity::parse("0.5").unwrap().bytes(), 1);
        assert_eq!(Quantity::parse("1.001k").unwrap().bytes(), 1_001);
    }

    #[test]
    fn quantity_keeps_literal() {
        let quantity = Quantity::parse("1000Gi").unwrap();
        assert_eq!(quantity.as_str(), "1000Gi");
        assert_eq!(quantity.to_string(), "1000Gi");
        assert_eq!(Quantity::from_gibibytes(3).as_str(), "3Gi");
        assert_eq!(Quantity::from_gibibytes(3).bytes(), 3 * GIB);
    }

    #[test]
    fn quantity_rejects_unknown_suffix() {
        assert!(Quantity::parse("10GB").is_err());
        assert!(Quantity::parse("10m").is_err());
        assert!(Quantity::parse("Gi").is_err());
        assert_eq!(Quantity::parse("  "), Err(UnitError::Empty));
    }
}
