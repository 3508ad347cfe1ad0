//! Simulated capture engine and analog front end.

use std::cell::Cell;
use std::fmt;

use acquisition_core::capture::{
    ADC_GROUPS, CaptureConfig, CaptureDevice, DESCRIPTOR_RING_CAPACITY, Descriptor,
};
use acquisition_core::frame::{RxConfig, TxConfig};
use acquisition_core::sequencer::DeviceConfigurator;
use log::{debug, trace};

/// Polls a simulated transfer stays busy after it starts.
pub const DEFAULT_CAPTURE_LATENCY: u32 = 3;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceError {
    /// The group index is outside the engine.
    InvalidGroup { group: usize },
    /// Failure requested through fault injection.
    Injected(&'static str),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::InvalidGroup { group } => write!(f, "no capture group {group}"),
            DeviceError::Injected(stage) => write!(f, "injected {stage} failure"),
        }
    }
}

/// Two-group capture engine backed by host memory.
///
/// Starting a group fills every loaded descriptor region with a ramp
/// seeded by the group and its shot count, then reports busy for
/// `latency` polls. An empty chain completes without going busy.
pub struct SimulatedCapture {
    config: CaptureConfig,
    latency: u32,
    memory: [Vec<u8>; ADC_GROUPS],
    chains: [Vec<Descriptor>; ADC_GROUPS],
    shots: [u32; ADC_GROUPS],
    remaining: [Cell<u32>; ADC_GROUPS],
}

impl SimulatedCapture {
    pub fn new(config: CaptureConfig, latency: u32) -> Self {
        let size = usize::try_from(config.group_space).unwrap_or(usize::MAX);
        Self {
            config,
            latency,
            memory: std::array::from_fn(|_| vec![0; size]),
            chains: std::array::from_fn(|_| Vec::new()),
            shots: [0; ADC_GROUPS],
            remaining: std::array::from_fn(|_| Cell::new(0)),
        }
    }

    /// Transfers started on `group` so far.
    pub fn shots(&self, group: usize) -> u32 {
        self.shots.get(group).copied().unwrap_or(0)
    }

    /// Byte the ramp writes at `index` of a region.
    #[allow(clippy::cast_possible_truncation)]
    pub fn ramp(group: usize, shot: u32, index: usize) -> u8 {
        let seed = (group as u32).wrapping_mul(0x40).wrapping_add(shot);
        (seed as usize).wrapping_add(index) as u8
    }

    fn fill(&mut self, group: usize) {
        let base = self.config.group_base(group);
        let shot = self.shots[group];
        let memory = &mut self.memory[group];
        if memory.is_empty() {
            return;
        }

        let mut written = 0usize;
        for descriptor in &self.chains[group] {
            let start = descriptor.address.wrapping_sub(base) as usize;
            for offset in 0..descriptor.length as usize {
                let slot = (start + offset) % memory.len();
                memory[slot] = Self::ramp(group, shot, written);
                written += 1;
            }
        }
        trace!("capture: group {group} wrote {written} bytes");
    }
}

impl CaptureDevice for SimulatedCapture {
    type Error = DeviceError;

    fn free_descriptors(&self, _group: usize) -> usize {
        DESCRIPTOR_RING_CAPACITY
    }

    fn load(&mut self, group: usize, chain: &[Descriptor]) -> Result<(), Self::Error> {
        let slot = self
            .chains
            .get_mut(group)
            .ok_or(DeviceError::InvalidGroup { group })?;
        slot.clear();
        slot.extend_from_slice(chain);
        Ok(())
    }

    fn start(&mut self, group: usize) -> Result<(), Self::Error> {
        let Some(chain) = self.chains.get(group) else {
            return Err(DeviceError::InvalidGroup { group });
        };
        let latency = if chain.is_empty() { 0 } else { self.latency };
        self.fill(group);
        self.shots[group] += 1;
        self.remaining[group].set(latency);
        debug!("capture: group {group} started shot {}", self.shots[group]);
        Ok(())
    }

    fn is_busy(&self, group: usize) -> bool {
        let Some(remaining) = self.remaining.get(group) else {
            return false;
        };
        let left = remaining.get();
        if left == 0 {
            return false;
        }
        remaining.set(left - 1);
        true
    }

    fn memory(&self, group: usize) -> &[u8] {
        &self.memory[group % ADC_GROUPS]
    }
}

/// Front end that accepts every configuration unless a fault is injected.
#[derive(Debug, Default)]
pub struct SimulatedFrontEnd {
    pub transmit_count: usize,
    pub last_receive: Option<RxConfig>,
    pub outputs_armed: bool,
    pub firing: bool,
    fail_next_transmit: bool,
}

impl SimulatedFrontEnd {
    /// Makes the next transmit configuration fail verification.
    pub fn inject_transmit_fault(&mut self) {
        self.fail_next_transmit = true;
    }

    pub fn fault_pending(&self) -> bool {
        self.fail_next_transmit
    }
}

impl DeviceConfigurator for SimulatedFrontEnd {
    type Error = DeviceError;

    fn configure_transmit(&mut self, tx: &TxConfig) -> Result<(), Self::Error> {
        if std::mem::take(&mut self.fail_next_transmit) {
            return Err(DeviceError::Injected("transmit verify"));
        }
        let enabled = tx.channels.iter().filter(|channel| channel.enabled).count();
        trace!("front end: {enabled} transmit channels enabled");
        self.transmit_count += 1;
        Ok(())
    }

    fn configure_receive(&mut self, rx: &RxConfig) -> Result<(), Self::Error> {
        self.last_receive = Some(*rx);
        Ok(())
    }

    fn arm(&mut self) -> Result<(), Self::Error> {
        self.outputs_armed = true;
        Ok(())
    }

    fn trigger(&mut self) {
        self.firing = true;
    }

    fn release(&mut self) {
        self.firing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CaptureConfig {
        CaptureConfig::new(0x4000_0000, 256)
    }

    #[test]
    fn start_fills_loaded_regions_with_the_ramp() {
        let mut capture = SimulatedCapture::new(config(), 1);
        let base = config().group_base(1);
        capture
            .load(
                1,
                &[Descriptor {
                    address: base + 16,
                    length: 8,
                }],
            )
            .expect("group exists");
        capture.start(1).expect("chain loaded");

        let memory = capture.memory(1);
        assert_eq!(memory[15], 0);
        for index in 0..8 {
            assert_eq!(memory[16 + index], SimulatedCapture::ramp(1, 0, index));
        }
        assert_eq!(capture.shots(1), 1);
    }

    #[test]
    fn transfer_stays_busy_for_latency_polls() {
        let mut capture = SimulatedCapture::new(config(), 2);
        capture
            .load(
                0,
                &[Descriptor {
                    address: 0x4000_0000,
                    length: 4,
                }],
            )
            .expect("group exists");
        capture.start(0).expect("chain loaded");

        assert!(capture.is_busy(0));
        assert!(capture.is_busy(0));
        assert!(!capture.is_busy(0));
        assert!(!capture.is_busy(1));
    }

    #[test]
    fn empty_chain_completes_immediately() {
        let mut capture = SimulatedCapture::new(config(), 3);
        capture.load(0, &[]).expect("group exists");
        capture.start(0).expect("empty chain is a no-op transfer");

        assert!(!capture.is_busy(0));
        assert_eq!(capture.shots(0), 1);
        assert!(capture.memory(0).iter().all(|&byte| byte == 0));
    }

    #[test]
    fn start_on_unknown_group_fails() {
        let mut capture = SimulatedCapture::new(config(), 1);
        assert_eq!(
            capture.start(ADC_GROUPS),
            Err(DeviceError::InvalidGroup { group: ADC_GROUPS })
        );
    }

    #[test]
    fn injected_fault_fails_once() {
        let mut front_end = SimulatedFrontEnd::default();
        front_end.inject_transmit_fault();
        let tx = TxConfig::disabled();

        assert!(front_end.configure_transmit(&tx).is_err());
        assert!(!front_end.fault_pending());
        assert!(front_end.configure_transmit(&tx).is_ok());
        assert_eq!(front_end.transmit_count, 1);
    }
}
