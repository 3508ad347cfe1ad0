//! Control loop.
//!
//! [`Controller`] owns every component and runs one iteration per
//! [`Controller::poll`]: service the transport, check capture completion,
//! tick the state machine, then let the sequencer and front end react to the
//! resulting edge. Nothing here blocks and no error stops the loop.

use core::fmt;

use crate::capture::{CaptureBuffers, CaptureConfig, CaptureDevice};
use crate::frame::MAX_SHOTS;
use crate::fsm::{Event, PendingEvents, State, StateMachine, StateTransition};
use crate::protocol::{
    BUILD_ID_LEN, DispatchContext, ErrorCode, MAX_PAYLOAD_LEN, PacketHeader, ProtocolConfig,
    Reassembler, Response, build_id_bytes, dispatch,
};
use crate::sequencer::{DeviceConfigurator, SequencerAction, ShotSequencer};
use crate::telemetry::{TelemetryEventKind, TelemetryRecorder, Tick};

/// Largest segment pulled from the transport per iteration. The configured
/// fragment length must not exceed it.
pub const MAX_SEGMENT_LEN: usize = 1536;

/// Byte-stream connection to the client.
pub trait Transport {
    type Error;

    /// Copies the next inbound segment into `buffer`.
    ///
    /// Returns the segment length, or `Ok(None)` when nothing is pending. A
    /// length above `buffer.len()` reports a segment that did not fit and was
    /// cut short.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the connection failed.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    /// Writes bytes to the active connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the bytes could not be queued.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Construction parameters for a [`Controller`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControllerConfig {
    pub capture: CaptureConfig,
    pub protocol: ProtocolConfig,
    /// Reported in the status record, truncated to 32 bytes.
    pub build_id: &'static str,
}

impl ControllerConfig {
    pub const DEFAULT_BUILD_ID: &'static str =
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

    /// Checks that non-final fragments fit the segment buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FragmentLength`] when the fragment length is
    /// zero or larger than [`MAX_SEGMENT_LEN`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fragment_len = self.protocol.fragment_len();
        if fragment_len == 0 || fragment_len > MAX_SEGMENT_LEN {
            return Err(ConfigError::FragmentLength {
                fragment_len,
                max: MAX_SEGMENT_LEN,
            });
        }
        Ok(())
    }
}

/// Rejected [`ControllerConfig`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    FragmentLength { fragment_len: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FragmentLength { fragment_len, max } => write!(
                f,
                "fragment length {fragment_len} must be between 1 and {max} bytes"
            ),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            protocol: ProtocolConfig::default(),
            build_id: Self::DEFAULT_BUILD_ID,
        }
    }
}

/// Acquisition controller: state machine, sequencer, capture buffers and
/// protocol layer behind a single owner.
pub struct Controller<D, C, P = PendingEvents, const SHOTS: usize = MAX_SHOTS>
where
    P: AsRef<PendingEvents>,
{
    machine: StateMachine<P>,
    sequencer: ShotSequencer<SHOTS>,
    capture: CaptureBuffers<D>,
    configurator: C,
    reassembler: Reassembler,
    telemetry: TelemetryRecorder,
    build_id: [u8; BUILD_ID_LEN],
    tick: Tick,
}

impl<D, C, const SHOTS: usize> Controller<D, C, PendingEvents, SHOTS>
where
    D: CaptureDevice,
    C: DeviceConfigurator,
{
    /// Builds a controller with its own event set.
    ///
    /// # Errors
    ///
    /// Returns the [`ControllerConfig::validate`] error.
    pub fn new(device: D, configurator: C, config: ControllerConfig) -> Result<Self, ConfigError> {
        Self::with_events(PendingEvents::new(), device, configurator, config)
    }
}

impl<D, C, P, const SHOTS: usize> Controller<D, C, P, SHOTS>
where
    D: CaptureDevice,
    C: DeviceConfigurator,
    P: AsRef<PendingEvents>,
{
    /// Builds a controller over an externally owned event set, typically a
    /// `static` shared with interrupt handlers.
    ///
    /// # Errors
    ///
    /// Returns the [`ControllerConfig::validate`] error.
    pub fn with_events(
        events: P,
        device: D,
        configurator: C,
        config: ControllerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            machine: StateMachine::with_events(events),
            sequencer: ShotSequencer::new(),
            capture: CaptureBuffers::new(device, config.capture),
            configurator,
            reassembler: Reassembler::new(config.protocol),
            telemetry: TelemetryRecorder::new(),
            build_id: build_id_bytes(config.build_id),
            tick: 0,
        })
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.machine.state()
    }

    #[must_use]
    pub const fn machine(&self) -> &StateMachine<P> {
        &self.machine
    }

    #[must_use]
    pub const fn sequencer(&self) -> &ShotSequencer<SHOTS> {
        &self.sequencer
    }

    #[must_use]
    pub const fn capture(&self) -> &CaptureBuffers<D> {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut CaptureBuffers<D> {
        &mut self.capture
    }

    #[must_use]
    pub const fn configurator(&self) -> &C {
        &self.configurator
    }

    pub fn configurator_mut(&mut self) -> &mut C {
        &mut self.configurator
    }

    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Completed loop iterations.
    #[must_use]
    pub const fn ticks(&self) -> Tick {
        self.tick
    }

    pub fn raise(&self, event: Event) {
        self.machine.raise(event);
    }

    /// Signals that hardware bring-up finished.
    pub fn init_complete(&self) {
        self.machine.raise(Event::InitComplete);
    }

    /// Runs one control-loop iteration.
    ///
    /// # Errors
    ///
    /// Returns the transport error after the rest of the iteration has run.
    pub fn poll<T: Transport>(
        &mut self,
        transport: &mut T,
    ) -> Result<Option<StateTransition>, T::Error> {
        let serviced = self.service_transport(transport);
        self.service_capture();
        let transition = self.step();
        serviced.map(|()| transition)
    }

    /// Drains every pending inbound segment.
    ///
    /// # Errors
    ///
    /// Returns the first receive or send error.
    pub fn service_transport<T: Transport>(&mut self, transport: &mut T) -> Result<(), T::Error> {
        let mut segment = [0u8; MAX_SEGMENT_LEN];
        while let Some(len) = transport.receive(&mut segment)? {
            if len > segment.len() {
                self.reject_segment(len, transport)?;
                continue;
            }
            self.receive_segment(&segment[..len], transport)?;
        }
        Ok(())
    }

    /// Drops a segment the buffer could not hold along with any partial
    /// packet it belonged to.
    fn reject_segment<T: Transport>(
        &mut self,
        len: usize,
        transport: &mut T,
    ) -> Result<(), T::Error> {
        warn!(
            "protocol: {} byte segment exceeds the {} byte buffer",
            len, MAX_SEGMENT_LEN
        );
        self.reassembler.reset();
        self.telemetry
            .record(TelemetryEventKind::ReassemblyOverflow, self.tick);
        send_response(transport, Response::Nack(ErrorCode::BadPacket))
    }

    /// Feeds one transport segment and answers any packet it completes.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the response could not be sent.
    pub fn receive_segment<T: Transport>(
        &mut self,
        segment: &[u8],
        transport: &mut T,
    ) -> Result<(), T::Error> {
        let Self {
            machine,
            sequencer,
            capture,
            reassembler,
            telemetry,
            build_id,
            tick,
            ..
        } = self;

        let outcome = reassembler.accept(segment, |packet| {
            let response = dispatch(
                packet,
                DispatchContext {
                    machine: &*machine,
                    sequencer: &mut *sequencer,
                    capture: &mut *capture,
                    build_id: &*build_id,
                },
            );
            if let Response::Nack(code) = response {
                warn!("protocol: request rejected: {:?}", code);
                telemetry.record(TelemetryEventKind::PacketRejected(code), *tick);
            }
            send_response(transport, response)
        });

        match outcome {
            Ok(Some(sent)) => sent,
            Ok(None) => Ok(()),
            Err(overflow) => {
                warn!("protocol: {:?}", overflow);
                telemetry.record(TelemetryEventKind::ReassemblyOverflow, *tick);
                send_response(transport, Response::Nack(ErrorCode::BadPacket))
            }
        }
    }

    /// Raises `ShotDone` once every channel group has finished recording.
    pub fn service_capture(&mut self) {
        if self.machine.state() == State::Record && !self.capture.any_busy() {
            self.machine.raise(Event::ShotDone);
        }
    }

    /// Ticks the state machine and lets the components react to the edge.
    pub fn step(&mut self) -> Option<StateTransition> {
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let transition = self.machine.tick()?;
        self.telemetry
            .record(TelemetryEventKind::StateChanged(transition), tick);

        if transition.from == State::Record {
            self.configurator.release();
        }
        if transition.to == State::Record {
            self.configurator.trigger();
        }

        if transition.is(State::Ready, State::Armed) {
            self.telemetry.record(
                TelemetryEventKind::FrameQueued {
                    handle: self.sequencer.handle(),
                    shots: self.sequencer.shots().len(),
                },
                tick,
            );
        }

        let action = self.sequencer.on_transition(
            transition,
            &self.machine,
            &mut self.configurator,
            &mut self.capture,
        );
        if let Some(action) = action {
            self.telemetry.record(
                match action {
                    SequencerAction::ShotStarted { index } => {
                        TelemetryEventKind::ShotStarted { index }
                    }
                    SequencerAction::FrameComplete { handle, shots } => {
                        TelemetryEventKind::FrameComplete { handle, shots }
                    }
                    SequencerAction::Faulted { fault, .. } => {
                        TelemetryEventKind::HardwareFault(fault)
                    }
                },
                tick,
            );
        }

        Some(transition)
    }
}

fn send_response<T: Transport>(transport: &mut T, response: Response<'_>) -> Result<(), T::Error> {
    let code = response.code().to_raw();
    match response {
        Response::Ack => send_packet(transport, code, &[]),
        Response::Nack(error) => send_packet(transport, code, &[error.to_raw()]),
        Response::Status(record) => send_packet(transport, code, &record.to_bytes()),
        Response::Frame(bytes) => send_packet(transport, code, bytes),
    }
}

fn send_packet<T: Transport>(transport: &mut T, code: u8, payload: &[u8]) -> Result<(), T::Error> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
    let Some(header) = PacketHeader::for_payload(code, payload.len()) else {
        return Ok(());
    };
    transport.send(&header.to_bytes())?;
    if payload.is_empty() {
        return Ok(());
    }
    transport.send(payload)
}
