#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Acquisition control core for the ultrasound front-end.
//
// The crate stays portable across the embedded target and host tooling by
// avoiding the Rust standard library. Hardware and transport access happen
// through the collaborator traits in `capture`, `sequencer` and `controller`.

#[macro_use]
mod fmt;

pub mod capture;
pub mod controller;
pub mod frame;
pub mod fsm;
pub mod protocol;
pub mod sequencer;
pub mod telemetry;

pub use controller::{ConfigError, Controller, ControllerConfig, Transport};
pub use fsm::{Event, State};
pub use protocol::ErrorCode;
