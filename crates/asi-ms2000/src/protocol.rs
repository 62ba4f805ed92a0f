//! Command text and reply decoding for the MS2000 command set.
//!
//! Multi-axis replies are zipped positionally against the axes that were
//! asked for. Extra values are ignored, missing values leave the axis out of
//! the result.

use stage_core::{from_ticks, to_ticks, AxisId, FloatType};

use tracing as log;

use crate::{engine::CommandEngine, Error, Result};

/// Identification probe. The controller answers with its model string.
pub const PROBE_COMMAND: &str = "N";

fn letters(axes: &[AxisId], suffix: &str) -> String {
    axes.iter()
        .map(|a| format!("{}{suffix}", a.letter()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn assignments<T: std::fmt::Display>(values: impl Iterator<Item = (AxisId, T)>) -> String {
    values
        .map(|(a, v)| format!("{}={v}", a.letter()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn version_command() -> String {
    "V".into()
}

/// `W X Y Z`
pub fn where_command(axes: &[AxisId]) -> String {
    format!("W {}", letters(axes, ""))
}

/// `RS X- Y-`, one status character per axis.
pub fn limit_state_command(axes: &[AxisId]) -> String {
    format!("RS {}", letters(axes, "-"))
}

/// `RS X? Y?`, `B` (busy) or `N` per axis.
pub fn moving_command(axes: &[AxisId]) -> String {
    format!("RS {}", letters(axes, "?"))
}

/// `S X? Y?`
pub fn speed_query_command(axes: &[AxisId]) -> String {
    format!("S {}", letters(axes, "?"))
}

/// `S X=1.5 Y=2`
pub fn set_speed_command(speeds: &[(AxisId, FloatType)]) -> String {
    format!("S {}", assignments(speeds.iter().copied()))
}

/// `M X=1500 Y=2000`, targets converted to ticks.
pub fn move_command(targets: &[(AxisId, FloatType)]) -> String {
    format!(
        "M {}",
        assignments(targets.iter().map(|(a, v)| (*a, to_ticks(*v))))
    )
}

/// `R X=100`, offsets converted to ticks.
pub fn relative_move_command(offsets: &[(AxisId, FloatType)]) -> String {
    format!(
        "R {}",
        assignments(offsets.iter().map(|(a, v)| (*a, to_ticks(*v))))
    )
}

/// `SI X Y Z`, seek limits and return to the hardware origin.
pub fn home_command(axes: &[AxisId]) -> String {
    format!("SI {}", letters(axes, ""))
}

/// `! X Y Z`, return to the zero position.
pub fn zero_command(axes: &[AxisId]) -> String {
    format!("! {}", letters(axes, ""))
}

pub const HALT_COMMAND: &str = "HALT";
pub const RESET_COMMAND: &str = "RESET";
/// Define the current position as zero on all axes.
pub const SET_ORIGIN_COMMAND: &str = "Z";

/// Positions in physical units. Unparseable tokens are skipped.
pub fn decode_positions(axes: &[AxisId], payload: &str) -> Vec<(AxisId, FloatType)> {
    axes.iter()
        .zip(payload.split_whitespace())
        .filter_map(|(axis, tok)| match tok.parse::<FloatType>() {
            Ok(ticks) => Some((*axis, from_ticks(ticks))),
            Err(_) => {
                log::debug!("skipping unparseable position {tok:?} for axis {axis}");
                None
            }
        })
        .collect()
}

/// One status character per axis. The controller does not separate them.
pub fn decode_limit_states(axes: &[AxisId], payload: &str) -> Vec<(AxisId, char)> {
    axes.iter()
        .copied()
        .zip(payload.chars().filter(|c| !c.is_whitespace()))
        .collect()
}

pub fn is_limit_state(state: char) -> bool {
    state == 'L' || state == 'U'
}

pub fn decode_moving(axes: &[AxisId], payload: &str) -> Vec<(AxisId, bool)> {
    axes.iter()
        .copied()
        .zip(payload.split_whitespace().map(|tok| tok.contains('B')))
        .collect()
}

fn first_number(text: &str) -> Option<FloatType> {
    static NUMBER: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = NUMBER.get_or_init(|| regex::Regex::new(r"-?\d+(\.\d+)?").unwrap());
    re.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Reply to a single-axis speed query, e.g. `X=1.234567`.
pub fn decode_speed(payload: &str) -> Option<FloatType> {
    first_number(payload)
}

pub fn decode_speeds(axes: &[AxisId], payload: &str) -> Vec<(AxisId, FloatType)> {
    axes.iter()
        .zip(payload.split_whitespace())
        .filter_map(|(axis, tok)| first_number(tok).map(|v| (*axis, v)))
        .collect()
}

/// Typed access to the MS2000 command set over a [CommandEngine].
///
/// Every method sends exactly one command and requires an acknowledgement.
/// Queries for an empty axis list return an empty result without touching
/// the wire.
pub struct Ms2000 {
    engine: CommandEngine,
}

impl Ms2000 {
    pub fn new(engine: CommandEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    pub async fn version(&self) -> Result<String> {
        self.engine.request(&version_command()).await
    }

    pub async fn positions(&self, axes: &[AxisId]) -> Result<Vec<(AxisId, FloatType)>> {
        if axes.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.engine.request(&where_command(axes)).await?;
        let positions = decode_positions(axes, &payload);
        if positions.is_empty() {
            log::warn!("no positions in reply {payload:?}");
        }
        Ok(positions)
    }

    pub async fn limit_states(&self, axes: &[AxisId]) -> Result<Vec<(AxisId, char)>> {
        if axes.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.engine.request(&limit_state_command(axes)).await?;
        let states = decode_limit_states(axes, &payload);
        if states.is_empty() {
            log::warn!("no axis states in reply {payload:?}");
        }
        Ok(states)
    }

    pub async fn moving(&self, axes: &[AxisId]) -> Result<Vec<(AxisId, bool)>> {
        if axes.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.engine.request(&moving_command(axes)).await?;
        Ok(decode_moving(axes, &payload))
    }

    pub async fn speed(&self, axis: AxisId) -> Result<FloatType> {
        let command = speed_query_command(&[axis]);
        let payload = self.engine.request(&command).await?;
        decode_speed(&payload).ok_or(Error::MalformedResponse {
            command,
            reply: payload,
        })
    }

    pub async fn speeds(&self, axes: &[AxisId]) -> Result<Vec<(AxisId, FloatType)>> {
        if axes.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.engine.request(&speed_query_command(axes)).await?;
        Ok(decode_speeds(axes, &payload))
    }

    pub async fn set_speeds(&self, speeds: &[(AxisId, FloatType)]) -> Result<()> {
        self.engine.request(&set_speed_command(speeds)).await?;
        Ok(())
    }

    pub async fn move_to(&self, targets: &[(AxisId, FloatType)]) -> Result<()> {
        self.engine.request(&move_command(targets)).await?;
        Ok(())
    }

    pub async fn move_by(&self, offsets: &[(AxisId, FloatType)]) -> Result<()> {
        self.engine.request(&relative_move_command(offsets)).await?;
        Ok(())
    }

    pub async fn home(&self, axes: &[AxisId]) -> Result<()> {
        self.engine.request(&home_command(axes)).await?;
        Ok(())
    }

    pub async fn return_to_zero(&self, axes: &[AxisId]) -> Result<()> {
        self.engine.request(&zero_command(axes)).await?;
        Ok(())
    }

    pub async fn halt(&self) -> Result<()> {
        self.engine.request(HALT_COMMAND).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        self.engine.request(RESET_COMMAND).await?;
        Ok(())
    }

    pub async fn set_origin(&self) -> Result<()> {
        self.engine.request(SET_ORIGIN_COMMAND).await?;
        Ok(())
    }
}
