use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionManager;
use super::protocol::{
    self, Direction, MovementCommand, ReferenceInputCommand, TelemetrySample,
};
use super::telemetry::TelemetryDistributor;
use super::transport::{Channel, Link, NotificationStream};
use crate::error::MotionError;

/// Notifications between two move commands. Each command drives the motor
/// for about a second, during which roughly 16 updates arrive; resending
/// on the 6th avoids both overshoot and the motor slowing down.
pub const DEFAULT_RESEND_INTERVAL: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    SeekingUp,
    SeekingDown,
    Stopping,
}

impl MotionState {
    fn seeking(direction: Direction) -> Self {
        match direction {
            Direction::Up => Self::SeekingUp,
            Direction::Down => Self::SeekingDown,
        }
    }

    pub fn is_seeking(&self) -> bool {
        matches!(self, Self::SeekingUp | Self::SeekingDown)
    }
}

/// What a notification asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionStep {
    Continue,
    Resend(Direction),
    Arrived,
}

/// State of one in-progress move, advanced by telemetry notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionSession {
    pub target_raw: u16,
    pub direction: Direction,
    /// Notifications since the last move command
    pub tick_count: u8,
    pub moving: bool,
    tolerance_raw: u16,
    resend_interval: u8,
}

impl MotionSession {
    /// `None` when `initial_raw` is already within tolerance of the target.
    pub fn plan(
        initial_raw: u16,
        target_raw: u16,
        tolerance_raw: u16,
        resend_interval: u8,
    ) -> Option<Self> {
        if initial_raw.abs_diff(target_raw) <= tolerance_raw {
            return None;
        }
        Some(Self {
            target_raw,
            direction: Direction::towards(initial_raw, target_raw),
            tick_count: 0,
            moving: true,
            tolerance_raw,
            resend_interval: resend_interval.max(1),
        })
    }

    // Notified heights lag slightly behind, so stop inside the tolerance band.
    pub fn has_reached(&self, position_raw: u16) -> bool {
        position_raw.abs_diff(self.target_raw) <= self.tolerance_raw
    }

    pub fn on_sample(&mut self, sample: &TelemetrySample) -> MotionStep {
        if !self.moving {
            return MotionStep::Continue;
        }
        self.tick_count += 1;

        // Touching the desk's own controls ends the notifications with a
        // final zero-speed sample.
        if sample.is_stationary() || self.has_reached(sample.position_raw) {
            self.moving = false;
            return MotionStep::Arrived;
        }

        if self.tick_count >= self.resend_interval {
            self.tick_count = 0;
            return MotionStep::Resend(self.direction);
        }
        MotionStep::Continue
    }
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub tolerance_raw: u16,
    pub resend_interval: u8,
    /// Also write STOP to the reference-input characteristic.
    pub reference_input_stop: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            tolerance_raw: protocol::tolerance_raw(protocol::DEFAULT_HEIGHT_TOLERANCE_MM),
            resend_interval: DEFAULT_RESEND_INTERVAL,
            reference_input_stop: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveOutcome {
    /// Within tolerance already; nothing was sent.
    AlreadyThere(TelemetrySample),
    /// A stop arrived before the first command was written.
    Cancelled,
    Started {
        direction: Direction,
        from: TelemetrySample,
        target_raw: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekEnd {
    Arrived,
    Cancelled,
    LinkLost,
    Aborted,
}

/// Writes commands to one link.
#[derive(Clone)]
struct Commander {
    link: Arc<dyn Link>,
    reference_input_stop: bool,
}

impl Commander {
    async fn send(&self, command: MovementCommand) -> Result<(), MotionError> {
        let bytes = command.to_bytes();
        log::debug!("Sending command: {:?} -> bytes: {:02X?}", command, bytes);
        self.link
            .write(Channel::Command, &bytes)
            .await
            .map_err(|source| MotionError::TransportWrite { command, source })
    }

    async fn stop(&self) -> Result<(), MotionError> {
        log::info!("Stopping desk movement");
        self.send(MovementCommand::Stop).await?;
        if self.reference_input_stop {
            self.link
                .write(Channel::ReferenceInput, &ReferenceInputCommand::Stop.to_bytes())
                .await
                .map_err(|source| MotionError::ReferenceWrite { source })?;
        }
        Ok(())
    }

    async fn read_sample(&self) -> Result<TelemetrySample, MotionError> {
        let data = self
            .link
            .read(Channel::Position)
            .await
            .map_err(|source| MotionError::Read { source })?;
        Ok(TelemetrySample::decode(&data)?)
    }

    async fn release(&self) {
        if let Err(e) = self.link.unsubscribe(Channel::Position).await {
            log::debug!("Unsubscribing from height notifications failed: {}", e);
        }
    }
}

struct ActiveSeek {
    commander: Commander,
    cancel: CancellationToken,
    task: JoinHandle<SeekEnd>,
}

/// Drives the desk towards a target height.
///
/// Only one move is active at a time; a new [`MotionController::move_to`]
/// stops the previous one first.
pub struct MotionController {
    connection: Arc<ConnectionManager>,
    telemetry: Arc<TelemetryDistributor>,
    settings: MotionSettings,
    state: Arc<watch::Sender<MotionState>>,
    active: Mutex<Option<ActiveSeek>>,
    // Cancelled by a stop while a move is still connecting or reading.
    pending: std::sync::Mutex<CancellationToken>,
}

impl MotionController {
    pub fn new(
        connection: Arc<ConnectionManager>,
        telemetry: Arc<TelemetryDistributor>,
        settings: MotionSettings,
    ) -> Self {
        let (state, _) = watch::channel(MotionState::Idle);
        Self {
            connection,
            telemetry,
            settings,
            state: Arc::new(state),
            active: Mutex::new(None),
            pending: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn state(&self) -> MotionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MotionState> {
        self.state.subscribe()
    }

    pub async fn wait_until_idle(&self) {
        let mut state = self.state.subscribe();
        while *state.borrow_and_update() != MotionState::Idle {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start moving towards `target_mm` (clamped to the desk range).
    ///
    /// Returns once the first command is sent; notifications drive the rest.
    /// There is no deadline: pair with [`MotionController::stop_movement`]
    /// when one is needed.
    pub async fn move_to(&self, target_mm: f64) -> Result<MoveOutcome, MotionError> {
        let stopped = self.arm_pending();
        let mut active = self.active.lock().await;
        if let Some(seek) = active.take() {
            log::info!("Superseding the move in progress");
            self.halt(seek).await?;
        }

        let link = self.connection.connect().await?;
        if stopped.is_cancelled() {
            log::info!("Stop requested while connecting, not moving");
            return Ok(MoveOutcome::Cancelled);
        }
        let commander = Commander {
            link,
            reference_input_stop: self.settings.reference_input_stop,
        };

        let clamped = protocol::clamp_mm(target_mm);
        if clamped != target_mm {
            log::warn!("Target {}mm outside desk range, using {}mm", target_mm, clamped);
        }
        let target_raw = protocol::mm_to_raw(clamped);

        let initial = commander.read_sample().await?;
        self.telemetry.publish(&initial);
        if stopped.is_cancelled() {
            log::info!("Stop requested before the desk started, not moving");
            return Ok(MoveOutcome::Cancelled);
        }

        let Some(session) = MotionSession::plan(
            initial.position_raw,
            target_raw,
            self.settings.tolerance_raw,
            self.settings.resend_interval,
        ) else {
            log::info!("Desk already at {:.1}mm, no movement needed", initial.position_mm);
            return Ok(MoveOutcome::AlreadyThere(initial));
        };

        let direction = session.direction;
        log::info!(
            "Moving desk {:?} from {:.1}mm to {:.1}mm",
            direction,
            initial.position_mm,
            protocol::raw_to_mm(target_raw)
        );
        self.state.send_replace(MotionState::seeking(direction));

        let notifications = match commander.link.subscribe(Channel::Position).await {
            Ok(stream) => stream,
            Err(source) => {
                self.state.send_replace(MotionState::Idle);
                return Err(MotionError::Subscribe { source });
            }
        };
        if stopped.is_cancelled() {
            commander.release().await;
            self.state.send_replace(MotionState::Idle);
            return Ok(MoveOutcome::Cancelled);
        }

        if let Err(e) = commander.send(direction.command()).await {
            commander.release().await;
            self.state.send_replace(MotionState::Idle);
            self.telemetry.publish_motion_aborted(&e);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_seek(
            commander.clone(),
            session,
            notifications,
            cancel.clone(),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.state),
        ));
        *active = Some(ActiveSeek {
            commander,
            cancel,
            task,
        });

        Ok(MoveOutcome::Started {
            direction,
            from: initial,
            target_raw,
        })
    }

    /// Stop the desk. A no-op when no move is in progress.
    ///
    /// A move still connecting when this is called returns
    /// [`MoveOutcome::Cancelled`] without writing anything.
    pub async fn stop_movement(&self) -> Result<(), MotionError> {
        self.cancel_pending();
        let seek = self.active.lock().await.take();
        match seek {
            Some(seek) => {
                if !self.halt(seek).await? {
                    log::debug!("Move had already finished, nothing to stop");
                }
            }
            None => log::debug!("Stop requested while idle"),
        }
        Ok(())
    }

    /// Write the stop pair even when this controller started no move, for a
    /// desk set in motion by its own buttons or another client.
    pub async fn force_stop(&self) -> Result<(), MotionError> {
        self.cancel_pending();
        let mut active = self.active.lock().await;
        if let Some(seek) = active.take() {
            if self.halt(seek).await? {
                return Ok(());
            }
        }

        let commander = Commander {
            link: self.connection.connect().await?,
            reference_input_stop: self.settings.reference_input_stop,
        };
        commander.stop().await
    }

    /// New token for a starting move. Cancels the previous one, so an older
    /// move still waiting on the link gives way.
    fn arm_pending(&self) -> CancellationToken {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.cancel();
        *pending = CancellationToken::new();
        pending.clone()
    }

    fn cancel_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    /// End `seek`, writing a stop if it was still running.
    async fn halt(&self, seek: ActiveSeek) -> Result<bool, MotionError> {
        seek.cancel.cancel();
        let end = match seek.task.await {
            Ok(end) => end,
            Err(e) => {
                log::error!("Seek task failed: {}", e);
                SeekEnd::Cancelled
            }
        };
        if end != SeekEnd::Cancelled {
            return Ok(false);
        }

        self.state.send_replace(MotionState::Stopping);
        let result = seek.commander.stop().await;
        self.state.send_replace(MotionState::Idle);
        result.map(|()| true)
    }
}

async fn run_seek(
    commander: Commander,
    mut session: MotionSession,
    mut notifications: NotificationStream,
    cancel: CancellationToken,
    telemetry: Arc<TelemetryDistributor>,
    state: Arc<watch::Sender<MotionState>>,
) -> SeekEnd {
    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break SeekEnd::Cancelled,
            frame = notifications.next() => match frame {
                Some(frame) => frame,
                None => {
                    log::warn!("Height notifications ended while moving, link lost");
                    break SeekEnd::LinkLost;
                }
            },
        };

        let sample = match TelemetrySample::decode(&frame) {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("Ignoring height notification: {}", e);
                continue;
            }
        };
        telemetry.publish(&sample);
        log::debug!(
            "Height: {:4.0}mm Target: {:4.0}mm Speed: {:2.0}mm/s",
            sample.position_mm,
            protocol::raw_to_mm(session.target_raw),
            sample.speed_mm_s
        );

        match session.on_sample(&sample) {
            MotionStep::Continue => {}
            MotionStep::Resend(direction) => {
                if let Err(e) = commander.send(direction.command()).await {
                    log::error!("Move command failed, aborting: {}", e);
                    telemetry.publish_motion_aborted(&e);
                    if let Err(stop_err) = commander.stop().await {
                        log::debug!("Best-effort stop after abort failed: {}", stop_err);
                    }
                    break SeekEnd::Aborted;
                }
            }
            MotionStep::Arrived => {
                log::info!("Desk stopped at {:.1}mm", sample.position_mm);
                state.send_replace(MotionState::Stopping);
                match commander.stop().await {
                    Ok(()) => break SeekEnd::Arrived,
                    Err(e) => {
                        log::error!("Stop command failed: {}", e);
                        telemetry.publish_motion_aborted(&e);
                        break SeekEnd::Aborted;
                    }
                }
            }
        }
    };

    drop(notifications);
    commander.release().await;
    if end != SeekEnd::Cancelled {
        state.send_replace(MotionState::Idle);
    }
    end
}
