#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;

use acquisition_core::capture::{ADC_GROUPS, CaptureConfig, CaptureDevice, Descriptor};
use acquisition_core::controller::{Controller, ControllerConfig, Transport};
use acquisition_core::frame::{
    FRAME_HEADER_LEN, FrameHeader, Level, RxConfig, SHOT_LEN, Shot, TxChannel, TxConfig,
};
use acquisition_core::fsm::PendingEvents;
use acquisition_core::protocol::{HEADER_LEN, PacketHeader, ProtocolConfig};
use acquisition_core::sequencer::DeviceConfigurator;

pub const GROUP_SPACE: u32 = 0x1_0000;
pub const TEST_SHOTS: usize = 4;

pub type TestController = Controller<MockCapture, MockFrontEnd, PendingEvents, TEST_SHOTS>;

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        capture: CaptureConfig::new(0x4000_0000, GROUP_SPACE),
        protocol: ProtocolConfig::default(),
        build_id: "acq-test 1.0",
    }
}

pub fn ready_controller() -> TestController {
    let mut controller =
        TestController::new(MockCapture::new(2), MockFrontEnd::default(), test_config())
            .expect("test config is valid");
    controller.init_complete();
    controller.step().expect("init should complete");
    controller
}

/// Capture engine that stays busy for a fixed number of polls after start.
pub struct MockCapture {
    pub memory: [Vec<u8>; ADC_GROUPS],
    pub loaded: Vec<(usize, Vec<Descriptor>)>,
    pub started: Vec<usize>,
    pub free: usize,
    pub fail_start: bool,
    busy_polls: u32,
    remaining: [Cell<u32>; ADC_GROUPS],
}

impl MockCapture {
    pub fn new(busy_polls: u32) -> Self {
        let memory = std::array::from_fn(|group| {
            (0..GROUP_SPACE as usize)
                .map(|index| ((index % 251) + group * 3) as u8)
                .collect()
        });
        Self {
            memory,
            loaded: Vec::new(),
            started: Vec::new(),
            free: 1024,
            fail_start: false,
            busy_polls,
            remaining: std::array::from_fn(|_| Cell::new(0)),
        }
    }
}

impl CaptureDevice for MockCapture {
    type Error = &'static str;

    fn free_descriptors(&self, _group: usize) -> usize {
        self.free
    }

    fn load(&mut self, group: usize, chain: &[Descriptor]) -> Result<(), Self::Error> {
        self.loaded.push((group, chain.to_vec()));
        Ok(())
    }

    fn start(&mut self, group: usize) -> Result<(), Self::Error> {
        if self.fail_start {
            return Err("dma not ready");
        }
        self.started.push(group);
        self.remaining[group].set(self.busy_polls);
        Ok(())
    }

    fn is_busy(&self, group: usize) -> bool {
        let remaining = self.remaining[group].get();
        if remaining == 0 {
            return false;
        }
        self.remaining[group].set(remaining - 1);
        true
    }

    fn memory(&self, group: usize) -> &[u8] {
        &self.memory[group]
    }
}

/// Front end that records what it was asked to program.
#[derive(Default)]
pub struct MockFrontEnd {
    pub transmit: Vec<TxConfig>,
    pub receive: Vec<RxConfig>,
    pub armed: usize,
    pub triggered: usize,
    pub released: usize,
    pub fail_transmit_at: Option<usize>,
    pub fail_receive: bool,
}

impl DeviceConfigurator for MockFrontEnd {
    type Error = &'static str;

    fn configure_transmit(&mut self, tx: &TxConfig) -> Result<(), Self::Error> {
        if self.fail_transmit_at == Some(self.transmit.len()) {
            return Err("pulser verify mismatch");
        }
        self.transmit.push(tx.clone());
        Ok(())
    }

    fn configure_receive(&mut self, rx: &RxConfig) -> Result<(), Self::Error> {
        if self.fail_receive {
            return Err("tgc verify mismatch");
        }
        self.receive.push(*rx);
        Ok(())
    }

    fn arm(&mut self) -> Result<(), Self::Error> {
        self.armed += 1;
        Ok(())
    }

    fn trigger(&mut self) {
        self.triggered += 1;
    }

    fn release(&mut self) {
        self.released += 1;
    }
}

/// In-memory transport: queued inbound segments, captured outbound bytes.
#[derive(Default)]
pub struct MockTransport {
    pub inbound: VecDeque<Vec<u8>>,
    pub outbound: Vec<u8>,
}

impl MockTransport {
    pub fn push_packet(&mut self, code: u8, payload: &[u8]) {
        self.inbound.push_back(packet(code, payload));
    }

    /// Queues a packet the way a link delivers it: full fragments of
    /// `fragment_len` bytes, then a shorter tail (empty if it divides evenly).
    pub fn push_fragmented(&mut self, fragment_len: usize, code: u8, payload: &[u8]) {
        let bytes = packet(code, payload);
        let mut chunks = bytes.chunks_exact(fragment_len);
        for chunk in chunks.by_ref() {
            self.inbound.push_back(chunk.to_vec());
        }
        self.inbound.push_back(chunks.remainder().to_vec());
    }

    /// Splits the outbound byte stream into `(code, payload)` responses.
    pub fn take_responses(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut responses = Vec::new();
        let mut rest = std::mem::take(&mut self.outbound);
        while !rest.is_empty() {
            let header = PacketHeader::decode(&rest).expect("response header");
            let end = HEADER_LEN + usize::from(header.length);
            responses.push((header.code, rest[HEADER_LEN..end].to_vec()));
            rest.drain(..end);
        }
        responses
    }
}

impl Transport for MockTransport {
    type Error = &'static str;

    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        let Some(segment) = self.inbound.pop_front() else {
            return Ok(None);
        };
        // Datagram semantics: the tail past the buffer is lost but the full
        // length is still reported.
        let copied = segment.len().min(buffer.len());
        buffer[..copied].copy_from_slice(&segment[..copied]);
        Ok(Some(segment.len()))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }
}

pub fn packet(code: u8, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader::for_payload(code, payload.len()).expect("payload fits");
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

pub fn pulse_shot(sample_count: u32) -> Shot {
    let mut tx = TxConfig::disabled();
    tx.channels[0] = TxChannel::with_levels(&[
        Level::ReturnToZero,
        Level::Vpp0,
        Level::Vnn0,
        Level::ReturnToZero,
    ]);
    Shot::new(tx, RxConfig::new(sample_count))
}

pub fn frame_bytes(handle: u32, shots: &[Shot]) -> Vec<u8> {
    let header = FrameHeader::new(handle, u32::try_from(shots.len()).expect("shot count"));
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + shots.len() * SHOT_LEN);
    bytes.extend_from_slice(&header.to_bytes());
    let mut block = [0u8; SHOT_LEN];
    for shot in shots {
        shot.encode(&mut block);
        bytes.extend_from_slice(&block);
    }
    bytes
}
