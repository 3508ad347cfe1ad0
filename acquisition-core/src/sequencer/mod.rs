//! Shot sequencing.
//!
//! [`ShotSequencer`] owns the queued frame and walks its shots in response to
//! state machine edges: `Ready -> Armed` configures shot 0, every
//! `Record -> Armed` configures the next shot or finishes the frame. Device
//! configuration is synchronous; any failure raises [`Event::Fault`] instead
//! of starting the shot.

use core::fmt;

use heapless::Vec;

use crate::capture::{ADC_GROUPS, CaptureBuffers, CaptureDevice};
use crate::frame::{FRAME_HEADER_LEN, FrameHeader, MAX_SHOTS, RxConfig, SHOT_LEN, Shot, TxConfig};
use crate::fsm::{Event, PendingEvents, State, StateMachine, StateTransition};
use crate::protocol::ErrorCode;

/// Front-end register programming for the pulsers, TGC and receive chips.
///
/// Implementations perform their own write-then-verify cycles and return
/// only once the device matches the requested configuration.
pub trait DeviceConfigurator {
    type Error;

    /// Programs the transmit waveform of every output channel.
    ///
    /// # Errors
    ///
    /// Returns the device error when a write or its verification fails.
    fn configure_transmit(&mut self, tx: &TxConfig) -> Result<(), Self::Error>;

    /// Programs gain, filters, TGC curve and test mode of the receive chips.
    ///
    /// # Errors
    ///
    /// Returns the device error when a write or its verification fails.
    fn configure_receive(&mut self, rx: &RxConfig) -> Result<(), Self::Error>;

    /// Enables the transmit outputs before the first shot of a frame.
    ///
    /// # Errors
    ///
    /// Returns the device error when the outputs cannot be armed.
    fn arm(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Fires the configured waveform.
    fn trigger(&mut self) {}

    /// Returns the outputs to receive once a shot has been captured.
    fn release(&mut self) {}
}

/// Hardware failures escalated through [`Event::Fault`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HardwareFault {
    Arm,
    TransmitConfig,
    ReceiveConfig,
    CaptureArm,
    CaptureStart,
}

impl fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HardwareFault::Arm => "output arm failed",
            HardwareFault::TransmitConfig => "transmit configuration failed",
            HardwareFault::ReceiveConfig => "receive configuration failed",
            HardwareFault::CaptureArm => "capture arm failed",
            HardwareFault::CaptureStart => "capture start failed",
        })
    }
}

/// What the sequencer did in response to a transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SequencerAction {
    /// Shot `index` configured and `Shot` raised.
    ShotStarted { index: usize },
    /// Every shot captured and `RecDone` raised.
    FrameComplete { handle: u32, shots: usize },
    /// Shot `index` could not be configured and `Fault` raised.
    Faulted { index: usize, fault: HardwareFault },
}

/// Frame accepted by [`ShotSequencer::queue_frame`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueuedFrame {
    pub handle: u32,
    pub shots: usize,
}

/// Owns the current frame and the index of the shot in flight.
pub struct ShotSequencer<const SHOTS: usize = MAX_SHOTS> {
    handle: u32,
    shots: Vec<Shot, SHOTS>,
    shot_index: usize,
}

impl<const SHOTS: usize> ShotSequencer<SHOTS> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: 0,
            shots: Vec::new(),
            shot_index: 0,
        }
    }

    /// Handle of the most recently queued frame.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    #[must_use]
    pub fn shots(&self) -> &[Shot] {
        &self.shots
    }

    #[must_use]
    pub const fn shot_index(&self) -> usize {
        self.shot_index
    }

    /// Accepts a frame while the machine is [`State::Ready`] and raises `Arm`.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::IllegalState`] outside [`State::Ready`].
    /// - [`ErrorCode::IncorrectSize`] when the length differs from the header's
    ///   shot count or the count exceeds the frame capacity.
    /// - [`ErrorCode::InvalidParameter`] for a frame without shots.
    pub fn queue_frame<D, P>(
        &mut self,
        bytes: &[u8],
        machine: &StateMachine<P>,
        capture: &mut CaptureBuffers<D>,
    ) -> Result<QueuedFrame, ErrorCode>
    where
        D: CaptureDevice,
        P: AsRef<PendingEvents>,
    {
        if machine.state() != State::Ready {
            return Err(ErrorCode::IllegalState);
        }

        let header = FrameHeader::decode(bytes).ok_or(ErrorCode::IncorrectSize)?;
        let shot_count = usize::try_from(header.shot_count).map_err(|_| ErrorCode::IncorrectSize)?;
        if header.frame_len() != Some(bytes.len()) || shot_count > SHOTS {
            return Err(ErrorCode::IncorrectSize);
        }
        if shot_count == 0 {
            return Err(ErrorCode::InvalidParameter);
        }

        self.shots.clear();
        for block in bytes[FRAME_HEADER_LEN..].chunks_exact(SHOT_LEN) {
            let shot = Shot::decode(block).ok_or(ErrorCode::IncorrectSize)?;
            if let Err(violation) = shot.tx.validate() {
                warn!(
                    "sequencer: shot {} channel {} does not return to zero",
                    self.shots.len(),
                    violation.channel
                );
            }
            self.shots
                .push(shot)
                .map_err(|_| ErrorCode::IncorrectSize)?;
        }

        self.handle = header.handle;
        self.shot_index = 0;
        capture.restart_recording();
        machine.raise(Event::Arm);

        info!(
            "sequencer: frame {} queued with {} shots",
            header.handle, shot_count
        );
        Ok(QueuedFrame {
            handle: header.handle,
            shots: shot_count,
        })
    }

    /// Reacts to the edge produced by the latest tick.
    pub fn on_transition<C, D, P>(
        &mut self,
        transition: StateTransition,
        machine: &StateMachine<P>,
        configurator: &mut C,
        capture: &mut CaptureBuffers<D>,
    ) -> Option<SequencerAction>
    where
        C: DeviceConfigurator,
        D: CaptureDevice,
        P: AsRef<PendingEvents>,
    {
        if transition.is(State::Ready, State::Armed) {
            if configurator.arm().is_err() {
                return Some(self.fault(machine, HardwareFault::Arm));
            }
            return Some(self.start_shot(machine, configurator, capture));
        }

        if transition.is(State::Record, State::Armed) {
            self.shot_index += 1;
            if self.shot_index < self.shots.len() {
                return Some(self.start_shot(machine, configurator, capture));
            }

            machine.raise(Event::RecDone);
            info!(
                "sequencer: frame {} complete after {} shots",
                self.handle,
                self.shots.len()
            );
            return Some(SequencerAction::FrameComplete {
                handle: self.handle,
                shots: self.shots.len(),
            });
        }

        None
    }

    fn start_shot<C, D, P>(
        &mut self,
        machine: &StateMachine<P>,
        configurator: &mut C,
        capture: &mut CaptureBuffers<D>,
    ) -> SequencerAction
    where
        C: DeviceConfigurator,
        D: CaptureDevice,
        P: AsRef<PendingEvents>,
    {
        let Some(shot) = self.shots.get(self.shot_index) else {
            return self.fault(machine, HardwareFault::TransmitConfig);
        };

        if configurator.configure_transmit(&shot.tx).is_err() {
            return self.fault(machine, HardwareFault::TransmitConfig);
        }
        if configurator.configure_receive(&shot.rx).is_err() {
            return self.fault(machine, HardwareFault::ReceiveConfig);
        }

        let sample_count = shot.rx.sample_count;
        let mut loaded = [false; ADC_GROUPS];
        for (group, slot) in loaded.iter_mut().enumerate() {
            match capture.arm_shot(group, sample_count) {
                Ok(plan) => *slot = plan.descriptors > 0,
                Err(_) => return self.fault(machine, HardwareFault::CaptureArm),
            }
        }
        // An empty chain has nothing to transfer; the group is idle already.
        for group in (0..ADC_GROUPS).filter(|&group| loaded[group]) {
            if capture.start(group).is_err() {
                return self.fault(machine, HardwareFault::CaptureStart);
            }
        }

        machine.raise(Event::Shot);
        debug!(
            "sequencer: shot {} of {} started",
            self.shot_index,
            self.shots.len()
        );
        SequencerAction::ShotStarted {
            index: self.shot_index,
        }
    }

    fn fault<P>(&self, machine: &StateMachine<P>, fault: HardwareFault) -> SequencerAction
    where
        P: AsRef<PendingEvents>,
    {
        error!(
            "sequencer: shot {} aborted: {:?}",
            self.shot_index, fault
        );
        machine.raise(Event::Fault);
        SequencerAction::Faulted {
            index: self.shot_index,
            fault,
        }
    }
}

impl<const SHOTS: usize> Default for ShotSequencer<SHOTS> {
    fn default() -> Self {
        Self::new()
    }
}
