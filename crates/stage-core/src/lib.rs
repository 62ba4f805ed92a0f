use serde::{Deserialize, Serialize};

pub mod axis;
pub use axis::{checked_ticks, from_ticks, to_ticks, AxisId, ALL_AXES, TICKS_PER_UNIT};

pub mod config;
pub use config::StageConfig;

pub type FloatType = f64;

/// Model string reported by [DeviceInfo].
pub const MODEL_NAME: &str = "ASI-MS2000";

// --------------------------------------------------------------------------

/// Cached state of one axis as last read from the controller.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy, Default)]
pub struct AxisStatus {
    /// position in physical units
    pub position: FloatType,
    /// true when the axis sits on its upper or lower limit
    pub limit: bool,
    pub moving: bool,
    pub speed: FloatType,
}

/// Cached state of the whole stage.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy, Default)]
pub struct StageSnapshot {
    pub x: AxisStatus,
    pub y: AxisStatus,
    pub z: AxisStatus,
}

impl StageSnapshot {
    pub fn axis(&self, axis: AxisId) -> &AxisStatus {
        match axis {
            AxisId::X => &self.x,
            AxisId::Y => &self.y,
            AxisId::Z => &self.z,
        }
    }

    pub fn axis_mut(&mut self, axis: AxisId) -> &mut AxisStatus {
        match axis {
            AxisId::X => &mut self.x,
            AxisId::Y => &mut self.y,
            AxisId::Z => &mut self.z,
        }
    }

    /// Iterate over `(axis, status)` pairs in X, Y, Z order.
    pub fn iter(&self) -> impl Iterator<Item = (AxisId, &AxisStatus)> {
        ALL_AXES.iter().map(move |a| (*a, self.axis(*a)))
    }
}

impl std::fmt::Display for StageSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        for (i, (axis, st)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, "  ")?;
            }
            write!(f, "{axis}={:.1}", st.position)?;
            if st.limit {
                write!(f, "[limit]")?;
            }
            if st.moving {
                write!(f, "[moving]")?;
            }
        }
        Ok(())
    }
}

/// Identification strings of the attached controller.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
pub struct DeviceInfo {
    pub model: String,
    /// Reply to the version query, empty if the query failed.
    pub version: String,
    pub framework: String,
}

// -----------------------------------------------------------------------------
// tests

#[test]
fn test_snapshot_axis_access() {
    let mut snap = StageSnapshot::default();
    snap.axis_mut(AxisId::Y).position = 12.5;
    snap.axis_mut(AxisId::Z).limit = true;
    assert_eq!(snap.y.position, 12.5);
    assert!(snap.z.limit);
    assert!(!snap.x.limit);
    let order: Vec<AxisId> = snap.iter().map(|(a, _)| a).collect();
    assert_eq!(order, vec![AxisId::X, AxisId::Y, AxisId::Z]);
    assert_eq!(format!("{snap}"), "X=0.0  Y=12.5  Z=0.0[limit]");
}

#[test]
fn test_snapshot_json() -> eyre::Result<()> {
    let mut snap = StageSnapshot::default();
    snap.x.position = -3.25;
    snap.x.moving = true;
    let buf = serde_json::to_string(&snap)?;
    let decoded: StageSnapshot = serde_json::from_str(&buf)?;
    assert_eq!(snap, decoded);
    Ok(())
}
