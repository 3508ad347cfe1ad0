//! Controller telemetry ring.
//!
//! Every transition, frame milestone, hardware fault and rejected packet is
//! stamped with the control-loop iteration that produced it and kept in a
//! fixed-size history. Event kinds encode to compact numeric codes for
//! diagnostics transports.

use core::fmt;

use heapless::HistoryBuf;

use crate::fsm::{State, StateTransition};
use crate::protocol::ErrorCode;
use crate::sequencer::HardwareFault;

/// Monotonic identifier assigned to each record.
pub type EventId = u32;

/// Control-loop iteration counter used as the timestamp.
pub type Tick = u64;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    StateChanged(StateTransition),
    FrameQueued { handle: u32, shots: usize },
    ShotStarted { index: usize },
    FrameComplete { handle: u32, shots: usize },
    HardwareFault(HardwareFault),
    PacketRejected(ErrorCode),
    ReassemblyOverflow,
}

impl TelemetryEventKind {
    const STATE_CHANGED_BASE: u16 = 0x0000;
    const FRAME_QUEUED_CODE: u16 = 0x0010;
    const SHOT_STARTED_CODE: u16 = 0x0011;
    const FRAME_COMPLETE_CODE: u16 = 0x0012;
    const HARDWARE_FAULT_BASE: u16 = 0x0020;
    const PACKET_REJECTED_BASE: u16 = 0x0030;
    const REASSEMBLY_OVERFLOW_CODE: u16 = 0x0040;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::StateChanged(transition) => {
                Self::STATE_CHANGED_BASE + state_index(transition.to)
            }
            TelemetryEventKind::FrameQueued { .. } => Self::FRAME_QUEUED_CODE,
            TelemetryEventKind::ShotStarted { .. } => Self::SHOT_STARTED_CODE,
            TelemetryEventKind::FrameComplete { .. } => Self::FRAME_COMPLETE_CODE,
            TelemetryEventKind::HardwareFault(fault) => {
                Self::HARDWARE_FAULT_BASE + fault_index(fault)
            }
            TelemetryEventKind::PacketRejected(code) => {
                Self::PACKET_REJECTED_BASE + error_index(code)
            }
            TelemetryEventKind::ReassemblyOverflow => Self::REASSEMBLY_OVERFLOW_CODE,
        }
    }
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::StateChanged(transition) => write!(
                f,
                "state {} -> {} on {}",
                transition.from, transition.to, transition.event
            ),
            TelemetryEventKind::FrameQueued { handle, shots } => {
                write!(f, "frame-queued handle={handle} shots={shots}")
            }
            TelemetryEventKind::ShotStarted { index } => write!(f, "shot-started {index}"),
            TelemetryEventKind::FrameComplete { handle, shots } => {
                write!(f, "frame-complete handle={handle} shots={shots}")
            }
            TelemetryEventKind::HardwareFault(fault) => write!(f, "hardware-fault {fault}"),
            TelemetryEventKind::PacketRejected(code) => write!(f, "packet-rejected {code}"),
            TelemetryEventKind::ReassemblyOverflow => f.write_str("reassembly-overflow"),
        }
    }
}

const fn state_index(state: State) -> u16 {
    match state {
        State::Init => 0,
        State::Ready => 1,
        State::Armed => 2,
        State::Record => 3,
        State::Fault => 4,
    }
}

const fn error_index(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::UnrecognizedCommand => 1,
        ErrorCode::BadPacket => 2,
        ErrorCode::IncorrectSize => 3,
        ErrorCode::IllegalState => 4,
        ErrorCode::InvalidParameter => 5,
    }
}

const fn fault_index(fault: HardwareFault) -> u16 {
    match fault {
        HardwareFault::Arm => 0,
        HardwareFault::TransmitConfig => 1,
        HardwareFault::ReceiveConfig => 2,
        HardwareFault::CaptureArm => 3,
        HardwareFault::CaptureStart => 4,
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: EventId,
    pub tick: Tick,
    pub event: TelemetryEventKind,
}

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: HistoryBuf<TelemetryRecord, CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Records an event and returns its identifier.
    pub fn record(&mut self, event: TelemetryEventKind, tick: Tick) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(TelemetryRecord { id, tick, event });
        id
    }

    /// Returns the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    #[must_use]
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
