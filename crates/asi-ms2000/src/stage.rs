//! The stage: motion with completion wait, ad-hoc commands and the cached
//! state kept current by the refresher.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use stage_core::{
    checked_ticks, AxisId, DeviceInfo, FloatType, StageConfig, StageSnapshot, ALL_AXES,
    MODEL_NAME,
};

use tracing as log;

use crate::{
    connector::Connector,
    engine::CommandEngine,
    protocol::{is_limit_state, Ms2000},
    refresher::{PauseGuard, RefreshGate, RefreshStats, Refresher},
    validate::find_port,
    Error, Result,
};

/// How a motion request ended.
#[derive(Debug)]
pub enum MotionOutcome {
    /// All targeted axes reported not busy.
    Done,
    /// The motion command was rejected or a query failed.
    Failed(Error),
    /// Cancelled by [Stage::cancel_motion], [Stage::stop] or a newer motion.
    Cancelled,
}

impl MotionOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for MotionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn describe(targets: &[(AxisId, FloatType)]) -> String {
    targets
        .iter()
        .map(|(a, v)| format!("{a}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reject positions whose tick count cannot be sent, before anything goes on
/// the wire.
fn check_positions(what: &'static str, values: &[(AxisId, FloatType)]) -> Result<()> {
    match values.iter().find(|(_, v)| checked_ticks(*v).is_none()) {
        Some(&(axis, value)) => Err(Error::InvalidValue { axis, what, value }),
        None => Ok(()),
    }
}

fn check_speeds(values: &[(AxisId, FloatType)]) -> Result<()> {
    match values.iter().find(|(_, v)| !(v.is_finite() && *v >= 0.0)) {
        Some(&(axis, value)) => Err(Error::InvalidValue {
            axis,
            what: "speed",
            value,
        }),
        None => Ok(()),
    }
}

struct StageInner {
    port: String,
    device: Ms2000,
    cfg: StageConfig,
    snapshot: watch::Sender<StageSnapshot>,
    gate: Arc<RefreshGate>,
    refresher: Mutex<Option<Refresher>>,
    motion_token: Mutex<CancellationToken>,
    /// Only one motion waits for completion at a time.
    motion_lock: tokio::sync::Mutex<()>,
}

impl StageInner {
    /// Positions are only taken over from a reply covering all three axes.
    async fn refresh_positions(&self) {
        match self.device.positions(&ALL_AXES).await {
            Ok(positions) if positions.len() == ALL_AXES.len() => {
                self.snapshot.send_modify(|snap| {
                    for (axis, pos) in positions {
                        snap.axis_mut(axis).position = pos;
                    }
                });
            }
            Ok(positions) => log::debug!(
                "incomplete position reply ({} axes), keeping cached positions",
                positions.len()
            ),
            Err(e) => log::debug!("position refresh failed: {e}"),
        }
    }

    async fn refresh_limits(&self) {
        match self.device.limit_states(&ALL_AXES).await {
            Ok(states) if states.len() == ALL_AXES.len() => {
                self.snapshot.send_modify(|snap| {
                    for (axis, state) in states {
                        snap.axis_mut(axis).limit = is_limit_state(state);
                    }
                });
            }
            Ok(states) => log::debug!(
                "incomplete limit reply ({} axes), keeping cached limits",
                states.len()
            ),
            Err(e) => log::debug!("limit refresh failed: {e}"),
        }
    }
}

/// A connected MS2000 stage.
///
/// Cloning is cheap and all clones drive the same controller. A background
/// task refreshes positions and limit flags while no foreground command is
/// running.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Locate the controller (on `cfg.port`, or by scanning), open it and
    /// start the background refresh.
    pub async fn connect<C: Connector>(connector: &C, cfg: &StageConfig) -> Result<Self> {
        let port = find_port(connector, cfg.port.as_deref(), cfg).await?;
        let device = connector.open(&port)?;
        let engine = CommandEngine::start(device, cfg.command_timeout(), cfg.max_buffer_len);
        log::info!("connected to {MODEL_NAME} on {port}");
        Ok(Self::from_engine(port, engine, cfg))
    }

    /// Wrap an already running engine. Must be called from within a tokio
    /// runtime.
    pub fn from_engine(port: String, engine: CommandEngine, cfg: &StageConfig) -> Self {
        let (snapshot, _) = watch::channel(StageSnapshot::default());
        let gate = RefreshGate::new();
        let inner = Arc::new(StageInner {
            port,
            device: Ms2000::new(engine),
            cfg: cfg.clone(),
            snapshot,
            gate: gate.clone(),
            refresher: Mutex::new(None),
            motion_token: Mutex::new(CancellationToken::new()),
            motion_lock: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        let refresher = Refresher::spawn(gate, cfg.refresh_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_positions().await;
                    inner.refresh_limits().await;
                }
            }
        });
        *inner.refresher.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresher);

        Self { inner }
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port
    }

    pub fn config(&self) -> &StageConfig {
        &self.inner.cfg
    }

    pub fn is_connected(&self) -> bool {
        self.inner.device.engine().is_open()
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        self.inner.gate.stats()
    }

    // ---- cached state --------------------------------------------------

    pub fn snapshot(&self) -> StageSnapshot {
        *self.inner.snapshot.borrow()
    }

    /// Receive every update of the cached state.
    pub fn subscribe(&self) -> watch::Receiver<StageSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn position(&self, axis: AxisId) -> FloatType {
        self.inner.snapshot.borrow().axis(axis).position
    }

    pub fn limit(&self, axis: AxisId) -> bool {
        self.inner.snapshot.borrow().axis(axis).limit
    }

    pub fn moving(&self, axis: AxisId) -> bool {
        self.inner.snapshot.borrow().axis(axis).moving
    }

    // ---- motion --------------------------------------------------------

    /// Move to absolute positions and wait until every targeted axis has
    /// stopped.
    pub async fn move_absolute(&self, targets: &[(AxisId, FloatType)]) -> MotionOutcome {
        if targets.is_empty() {
            log::warn!("absolute move without targets, nothing to do");
            return MotionOutcome::Done;
        }
        if let Err(e) = check_positions("target", targets) {
            log::error!("absolute move refused: {e}");
            return MotionOutcome::Failed(e);
        }
        let axes: Vec<AxisId> = targets.iter().map(|(a, _)| *a).collect();
        log::info!("moving to {}", describe(targets));
        let issue = self.inner.device.move_to(targets);
        self.run_motion("absolute move", &axes, issue).await
    }

    pub async fn move_axis(&self, axis: AxisId, position: FloatType) -> MotionOutcome {
        self.move_absolute(&[(axis, position)]).await
    }

    /// Move one axis by `delta` and wait until it has stopped.
    pub async fn move_relative(&self, axis: AxisId, delta: FloatType) -> MotionOutcome {
        let offsets = [(axis, delta)];
        if let Err(e) = check_positions("offset", &offsets) {
            log::error!("relative move refused: {e}");
            return MotionOutcome::Failed(e);
        }
        log::info!("moving {axis} by {delta}");
        let issue = self.inner.device.move_by(&offsets);
        self.run_motion("relative move", &[axis], issue).await
    }

    /// Seek the hardware origin on all axes.
    pub async fn home(&self) -> MotionOutcome {
        self.home_axes(&ALL_AXES).await
    }

    pub async fn home_axes(&self, axes: &[AxisId]) -> MotionOutcome {
        if axes.is_empty() {
            return MotionOutcome::Done;
        }
        log::info!("homing {axes:?}");
        let issue = self.inner.device.home(axes);
        self.run_motion("home", axes, issue).await
    }

    /// Return to the zero position defined by [Stage::set_origin].
    pub async fn return_to_zero(&self, axes: &[AxisId]) -> MotionOutcome {
        if axes.is_empty() {
            return MotionOutcome::Done;
        }
        log::info!("returning {axes:?} to zero");
        let issue = self.inner.device.return_to_zero(axes);
        self.run_motion("return to zero", axes, issue).await
    }

    /// Absolute move of one axis to 0.
    pub async fn reset_axis_position(&self, axis: AxisId) -> MotionOutcome {
        self.move_absolute(&[(axis, 0.0)]).await
    }

    fn begin_motion(&self) -> CancellationToken {
        let mut current = self
            .inner
            .motion_token
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    /// Cancel the motion wait in progress, if any. The stage itself keeps
    /// moving, see [Stage::stop].
    pub fn cancel_motion(&self) {
        self.inner
            .motion_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    async fn run_motion<F>(&self, what: &str, axes: &[AxisId], issue: F) -> MotionOutcome
    where
        F: Future<Output = Result<()>>,
    {
        let token = self.begin_motion();
        let _motion = self.inner.motion_lock.lock().await;
        if token.is_cancelled() {
            return MotionOutcome::Cancelled;
        }
        let _pause = self.inner.gate.pause().await;

        if let Err(e) = issue.await {
            log::error!("{what} failed: {e}");
            return MotionOutcome::Failed(e);
        }

        let inner = &self.inner;
        loop {
            if token.is_cancelled() {
                break;
            }
            let moving = {
                let _state = inner.gate.lock_state().await;
                inner.refresh_positions().await;
                if token.is_cancelled() {
                    break;
                }
                inner.refresh_limits().await;
                if token.is_cancelled() {
                    break;
                }
                inner.device.moving(axes).await
            };
            let moving = match moving {
                Ok(moving) => moving,
                Err(e) => {
                    log::error!("{what}: querying motion state failed: {e}");
                    return MotionOutcome::Failed(e);
                }
            };
            inner.snapshot.send_modify(|snap| {
                for (axis, busy) in &moving {
                    snap.axis_mut(*axis).moving = *busy;
                }
            });
            if !moving.is_empty() && moving.iter().all(|(_, busy)| !busy) {
                log::info!("{what} done");
                return MotionOutcome::Done;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(inner.cfg.poll_interval()) => {}
            }
        }
        log::info!("{what} cancelled");
        MotionOutcome::Cancelled
    }

    /// Cancel the motion wait and halt all axes.
    ///
    /// The refresher resumes afterwards whatever the outcome of the halt.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_motion();
        let _pause = self.inner.gate.pause().await;
        let res = self.inner.device.halt().await;
        match &res {
            Ok(()) => log::info!("stage halted"),
            Err(e) => log::error!("halt failed: {e}"),
        }
        res
    }

    // ---- ad-hoc commands -----------------------------------------------

    async fn paused(&self) -> PauseGuard {
        self.inner.gate.pause().await
    }

    pub async fn speed(&self, axis: AxisId) -> Result<FloatType> {
        let _pause = self.paused().await;
        let speed = self.inner.device.speed(axis).await?;
        self.inner
            .snapshot
            .send_modify(|snap| snap.axis_mut(axis).speed = speed);
        Ok(speed)
    }

    pub async fn set_speed(&self, axis: AxisId, speed: FloatType) -> Result<()> {
        self.set_speeds(&[(axis, speed)]).await
    }

    pub async fn speeds(&self, axes: &[AxisId]) -> Result<Vec<(AxisId, FloatType)>> {
        let _pause = self.paused().await;
        let speeds = self.inner.device.speeds(axes).await?;
        self.inner.snapshot.send_modify(|snap| {
            for (axis, speed) in &speeds {
                snap.axis_mut(*axis).speed = *speed;
            }
        });
        Ok(speeds)
    }

    pub async fn set_speeds(&self, speeds: &[(AxisId, FloatType)]) -> Result<()> {
        if speeds.is_empty() {
            return Ok(());
        }
        check_speeds(speeds)?;
        let _pause = self.paused().await;
        self.inner.device.set_speeds(speeds).await?;
        log::info!("speed set to {}", describe(speeds));
        self.inner.snapshot.send_modify(|snap| {
            for (axis, speed) in speeds {
                snap.axis_mut(*axis).speed = *speed;
            }
        });
        Ok(())
    }

    /// Define the current position as zero on all axes.
    pub async fn set_origin(&self) -> Result<()> {
        let _pause = self.paused().await;
        self.inner.device.set_origin().await
    }

    /// Restore controller defaults. Refreshing resumes only after the
    /// controller had time to restart.
    pub async fn reset_params(&self) -> Result<()> {
        let _pause = self.paused().await;
        let res = self.inner.device.reset().await;
        tokio::time::sleep(self.inner.cfg.reset_settle()).await;
        res
    }

    pub async fn version(&self) -> Result<String> {
        let _pause = self.paused().await;
        self.inner.device.version().await
    }

    /// Model and version. A failed version query leaves the version empty.
    pub async fn device_info(&self) -> DeviceInfo {
        let version = match self.version().await {
            Ok(version) => version,
            Err(e) => {
                log::warn!("version query failed: {e}");
                String::new()
            }
        };
        DeviceInfo {
            model: MODEL_NAME.to_string(),
            version,
            framework: String::new(),
        }
    }

    /// Stop the refresher and close the port. Further commands fail with
    /// [Error::NotOpen].
    pub async fn disconnect(&self) {
        self.cancel_motion();
        let refresher = self
            .inner
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(refresher) = refresher {
            refresher.stop().await;
        }
        self.inner.device.engine().close().await;
        log::info!("disconnected from {}", self.inner.port);
    }
}
