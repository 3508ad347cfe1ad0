//! Acquisition lifecycle state machine.
//!
//! Events are accumulated in an atomic pending set that may be written from
//! interrupt context. The control loop calls [`StateMachine::tick`] once per
//! iteration, which drains the set in one swap and applies at most one
//! transition from [`TRANSITIONS`], scanning in priority order.

use core::fmt;

use portable_atomic::{AtomicU32, Ordering};

/// Events that drive the acquisition lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    InitComplete,
    Arm,
    Shot,
    ShotDone,
    RecDone,
    Fault,
    ClearFault,
}

impl Event {
    /// Every event, in bit order.
    pub const ALL: [Event; 7] = [
        Event::InitComplete,
        Event::Arm,
        Event::Shot,
        Event::ShotDone,
        Event::RecDone,
        Event::Fault,
        Event::ClearFault,
    ];

    /// Bit assigned to the event inside an [`EventSet`].
    #[must_use]
    pub const fn bit(self) -> u32 {
        let index = match self {
            Event::InitComplete => 0,
            Event::Arm => 1,
            Event::Shot => 2,
            Event::ShotDone => 3,
            Event::RecDone => 4,
            Event::Fault => 5,
            Event::ClearFault => 6,
        };
        1 << index
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::InitComplete => "init-complete",
            Event::Arm => "arm",
            Event::Shot => "shot",
            Event::ShotDone => "shot-done",
            Event::RecDone => "rec-done",
            Event::Fault => "fault",
            Event::ClearFault => "clear-fault",
        })
    }
}

/// Current acquisition state. Exactly one is active at a time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Init,
    Ready,
    Armed,
    Record,
    Fault,
}

impl State {
    const INIT_CODE: u32 = 0;
    const READY_CODE: u32 = 1;
    const ARMED_CODE: u32 = 2;
    const RECORD_CODE: u32 = 3;
    const FAULT_CODE: u32 = 4;

    /// Encodes the state for the status record.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            State::Init => Self::INIT_CODE,
            State::Ready => Self::READY_CODE,
            State::Armed => Self::ARMED_CODE,
            State::Record => Self::RECORD_CODE,
            State::Fault => Self::FAULT_CODE,
        }
    }

    /// Decodes a status-record state code.
    #[must_use]
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            Self::INIT_CODE => Some(State::Init),
            Self::READY_CODE => Some(State::Ready),
            Self::ARMED_CODE => Some(State::Armed),
            Self::RECORD_CODE => Some(State::Record),
            Self::FAULT_CODE => Some(State::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Init => "init",
            State::Ready => "ready",
            State::Armed => "armed",
            State::Record => "record",
            State::Fault => "fault",
        })
    }
}

/// Source side of a transition table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Source {
    /// Matches every state.
    Any,
    Exact(State),
}

impl Source {
    #[must_use]
    pub const fn matches(self, state: State) -> bool {
        match self {
            Source::Any => true,
            Source::Exact(source) => source as u8 == state as u8,
        }
    }
}

/// One `(source, event) -> destination` rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub source: Source,
    pub event: Event,
    pub destination: State,
}

impl Transition {
    #[must_use]
    pub const fn new(source: Source, event: Event, destination: State) -> Self {
        Self {
            source,
            event,
            destination,
        }
    }
}

/// Transition table, highest priority first.
pub const TRANSITIONS: [Transition; 7] = [
    Transition::new(Source::Exact(State::Init), Event::InitComplete, State::Ready),
    Transition::new(Source::Any, Event::Fault, State::Fault),
    Transition::new(Source::Exact(State::Ready), Event::Arm, State::Armed),
    Transition::new(Source::Exact(State::Armed), Event::Shot, State::Record),
    Transition::new(Source::Exact(State::Record), Event::ShotDone, State::Armed),
    Transition::new(Source::Exact(State::Armed), Event::RecDone, State::Ready),
    Transition::new(Source::Exact(State::Fault), Event::ClearFault, State::Ready),
];

/// Snapshot of pending events.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EventSet(u32);

impl EventSet {
    /// Set with no events.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn with(self, event: Event) -> Self {
        Self(self.0 | event.bit())
    }

    #[must_use]
    pub const fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), EventSet::with)
    }
}

/// Resolves the transition for `state` given the `pending` events.
///
/// Returns the destination and the consumed event of the first table entry
/// whose source matches `state` and whose event is pending.
#[must_use]
pub fn step(state: State, pending: EventSet) -> Option<(State, Event)> {
    TRANSITIONS
        .iter()
        .find(|entry| entry.source.matches(state) && pending.contains(entry.event))
        .map(|entry| (entry.destination, entry.event))
}

/// Interrupt-safe pending event set.
///
/// `raise` is a single atomic OR; `take` is a single atomic swap. Neither
/// blocks and neither disables interrupts.
#[derive(Debug, Default)]
pub struct PendingEvents {
    bits: AtomicU32,
}

impl PendingEvents {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Marks `event` as pending. Idempotent.
    pub fn raise(&self, event: Event) {
        self.bits.fetch_or(event.bit(), Ordering::AcqRel);
    }

    /// Reads and clears the pending set in one step.
    pub fn take(&self) -> EventSet {
        EventSet::from_bits(self.bits.swap(0, Ordering::AcqRel))
    }

    /// Reads the pending set without clearing it.
    #[must_use]
    pub fn peek(&self) -> EventSet {
        EventSet::from_bits(self.bits.load(Ordering::Acquire))
    }
}

impl AsRef<PendingEvents> for PendingEvents {
    fn as_ref(&self) -> &PendingEvents {
        self
    }
}

/// Edge observed by a single [`StateMachine::tick`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateTransition {
    pub from: State,
    pub to: State,
    pub event: Event,
}

impl StateTransition {
    /// Returns `true` when the edge goes from `from` to `to`.
    #[must_use]
    pub fn is(&self, from: State, to: State) -> bool {
        self.from == from && self.to == to
    }
}

/// Owns the current state and a handle to the pending event set.
///
/// `P` is either an owned [`PendingEvents`] or a shared reference to one
/// that lives in a `static`, which lets interrupt handlers raise events
/// without access to the machine itself.
#[derive(Debug)]
pub struct StateMachine<P = PendingEvents>
where
    P: AsRef<PendingEvents>,
{
    state: State,
    pending: P,
}

impl StateMachine<PendingEvents> {
    /// Creates a machine in [`State::Init`] with its own event set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::Init,
            pending: PendingEvents::new(),
        }
    }
}

impl Default for StateMachine<PendingEvents> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> StateMachine<P>
where
    P: AsRef<PendingEvents>,
{
    /// Creates a machine in [`State::Init`] over an externally owned event set.
    #[must_use]
    pub const fn with_events(pending: P) -> Self {
        Self {
            state: State::Init,
            pending,
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    pub fn raise(&self, event: Event) {
        self.pending.as_ref().raise(event);
    }

    #[must_use]
    pub fn pending(&self) -> EventSet {
        self.pending.as_ref().peek()
    }

    /// Applies at most one transition and clears every pending event.
    pub fn tick(&mut self) -> Option<StateTransition> {
        let pending = self.pending.as_ref().take();
        let (to, event) = step(self.state, pending)?;

        let transition = StateTransition {
            from: self.state,
            to,
            event,
        };
        self.state = to;
        debug!(
            "fsm: {:?} -> {:?} on {:?}",
            transition.from, transition.to, transition.event
        );
        Some(transition)
    }
}
