//! Driver for the ASI MS2000 three-axis stage controller.
//!
//! The controller speaks an ASCII protocol at 9600-8N1. Commands end with a
//! CR, replies start with `:A` and end with CR LF. A rejected command is
//! answered with `:N` and a numeric error code.
//!
//! [Stage] is the entry point for applications. The lower layers
//! ([CommandEngine], [AsiCodec], [Connector]) are public for tooling.

mod error;
pub use error::{Error, ErrorCode, Result};

pub mod codec;
pub use codec::{AsiCodec, Frame};

pub mod connector;
pub use connector::{Connector, SerialConnector};

pub mod engine;
pub use engine::{check_ack, CommandEngine};

pub mod protocol;
pub use protocol::Ms2000;

pub mod refresher;
pub use refresher::{PauseGuard, RefreshStats};

pub mod stage;
pub use stage::{MotionOutcome, Stage};

pub mod validate;
pub use validate::find_port;

#[cfg(test)]
mod mock;

pub use stage_core::{AxisId, DeviceInfo, StageConfig, StageSnapshot};
