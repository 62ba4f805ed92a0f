use serde::{Deserialize, Serialize};

use crate::FloatType;

/// Device ticks per physical unit. One tick is 0.1 units.
pub const TICKS_PER_UNIT: FloatType = 10.0;

const UNITS_PER_TICK: FloatType = 0.1;

/// Decimal digits kept when converting ticks back to physical units.
const DECODE_DIGITS: i32 = 5;

/// One of the three stage axes.
///
/// Externally the axes are addressed by integer id (1, 2, 3), on the wire by
/// letter (`X`, `Y`, `Z`).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Clone, Copy)]
pub enum AxisId {
    X,
    Y,
    Z,
}

pub const ALL_AXES: [AxisId; 3] = [AxisId::X, AxisId::Y, AxisId::Z];

impl AxisId {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::X),
            2 => Some(Self::Y),
            3 => Some(Self::Z),
            _ => None,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::X => 1,
            Self::Y => 2,
            Self::Z => 3,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
        }
    }

    /// Map integer ids to axes, silently dropping unknown ids.
    pub fn known(ids: &[u32]) -> Vec<Self> {
        ids.iter().filter_map(|id| Self::from_id(*id)).collect()
    }
}

impl std::fmt::Display for AxisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseAxisError(pub String);

impl std::fmt::Display for ParseAxisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "unknown axis \"{}\" (expected x, y, z or 1, 2, 3)", self.0)
    }
}

impl std::error::Error for ParseAxisError {}

impl std::str::FromStr for AxisId {
    type Err = ParseAxisError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x" | "X" | "1" => Ok(Self::X),
            "y" | "Y" | "2" => Ok(Self::Y),
            "z" | "Z" | "3" => Ok(Self::Z),
            other => Err(ParseAxisError(other.to_string())),
        }
    }
}

/// Convert physical units to device ticks, truncating toward zero.
pub fn to_ticks(units: FloatType) -> i64 {
    (units * TICKS_PER_UNIT).trunc() as i64
}

/// Like [to_ticks], but `None` for NaN, infinity and values whose tick count
/// does not fit an `i64`. The plain cast would saturate.
pub fn checked_ticks(units: FloatType) -> Option<i64> {
    let ticks = (units * TICKS_PER_UNIT).trunc();
    if ticks.is_finite() && ticks.abs() < i64::MAX as FloatType {
        Some(ticks as i64)
    } else {
        None
    }
}

/// Convert device ticks to physical units, rounded to 5 decimal digits.
pub fn from_ticks(ticks: FloatType) -> FloatType {
    let scale = (10.0 as FloatType).powi(DECODE_DIGITS);
    (ticks * UNITS_PER_TICK * scale).round() / scale
}
