use std::fmt::Write as _;

use acquisition_core::capture::{CaptureConfig, DEFAULT_BASE_ADDRESS};
use acquisition_core::frame::{
    FRAME_HEADER_LEN, Level, RxConfig, SHOT_LEN, Shot, TxChannel, TxConfig, encode_frame,
};
use acquisition_core::fsm::{PendingEvents, State};
use acquisition_core::protocol::{
    CommandCode, ErrorCode, FrameDataRequest, HEADER_LEN, MAX_PAYLOAD_LEN, PacketHeader,
    ResponseCode, StatusRecord, encode_packet,
};
use acquisition_core::{ConfigError, Controller, ControllerConfig};
use log::debug;

use crate::commands::{self, HELP_TOPICS, ReplCommand};
use crate::devices::{DEFAULT_CAPTURE_LATENCY, SimulatedCapture, SimulatedFrontEnd};
use crate::link::Loopback;

/// Frame capacity of the emulated controller.
pub const EMULATOR_SHOTS: usize = 16;

/// Shots that fit in one `QueueFrame` payload.
pub const MAX_PACKET_SHOTS: usize = (MAX_PAYLOAD_LEN - FRAME_HEADER_LEN) / SHOT_LEN;

/// Bytes shown per line of a `fetch` dump.
const DUMP_WIDTH: usize = 16;
const DUMP_LINES: usize = 4;

pub type EmulatedController =
    Controller<SimulatedCapture, SimulatedFrontEnd, PendingEvents, EMULATOR_SHOTS>;

/// Builds a controller over simulated devices with `InitComplete` raised.
///
/// # Errors
///
/// Returns the controller's configuration error.
pub fn build_controller(group_space: u32) -> Result<Box<EmulatedController>, ConfigError> {
    let config = ControllerConfig {
        capture: CaptureConfig::new(DEFAULT_BASE_ADDRESS, group_space),
        ..ControllerConfig::default()
    };
    let controller = Box::new(EmulatedController::new(
        SimulatedCapture::new(config.capture, DEFAULT_CAPTURE_LATENCY),
        SimulatedFrontEnd::default(),
        config,
    )?);
    controller.init_complete();
    Ok(controller)
}

/// Transmit block used by `queue`: every channel fires one bipolar pulse.
pub fn pulse_transmit() -> TxConfig {
    let levels = [
        Level::ReturnToZero,
        Level::Vpp0,
        Level::Vnn0,
        Level::ReturnToZero,
    ];
    TxConfig {
        channels: std::array::from_fn(|_| TxChannel::with_levels(&levels)),
    }
}

/// Decoded controller reply.
#[derive(Debug)]
struct Reply {
    code: u8,
    payload: Vec<u8>,
}

pub struct Session {
    controller: Box<EmulatedController>,
    link: Loopback,
    fragment_len: usize,
    next_handle: u32,
}

impl Session {
    pub fn new(group_space: u32) -> Result<Self, ConfigError> {
        let mut controller = build_controller(group_space)?;
        controller.step();
        Ok(Self {
            fragment_len: ControllerConfig::default().protocol.fragment_len(),
            controller,
            link: Loopback::default(),
            next_handle: 1,
        })
    }

    pub fn handle_command(&mut self, line: &str) -> Vec<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        match commands::parse(trimmed) {
            Ok(command) => self.execute(command),
            Err(err) => vec![format!("ERR syntax {err}")],
        }
    }

    fn execute(&mut self, command: ReplCommand) -> Vec<String> {
        match command {
            ReplCommand::Status => self.status(),
            ReplCommand::Queue {
                shots,
                samples,
                handle,
            } => self.queue(shots, samples, handle),
            ReplCommand::Fetch { adc, offset, count } => self.fetch(adc, offset, count),
            ReplCommand::Run { iterations } => self.run(iterations),
            ReplCommand::Fault => {
                self.controller
                    .configurator_mut()
                    .inject_transmit_fault();
                vec!["OK next transmit configuration will fail".to_string()]
            }
            ReplCommand::Clear => match self.request(CommandCode::ClearFault, &[]) {
                Ok(reply) if reply.code == ResponseCode::Ack.to_raw() => {
                    vec!["OK clear-fault accepted".to_string()]
                }
                Ok(reply) => vec![describe_unexpected(&reply)],
                Err(message) => vec![message],
            },
            ReplCommand::Events => self.events(),
            ReplCommand::Help { topic } => help(topic.as_deref()),
        }
    }

    fn status(&mut self) -> Vec<String> {
        let reply = match self.request(CommandCode::GetStatus, &[]) {
            Ok(reply) => reply,
            Err(message) => return vec![message],
        };
        let record = match StatusRecord::decode(&reply.payload) {
            Some(record) if reply.code == ResponseCode::Status.to_raw() => record,
            _ => return vec![describe_unexpected(&reply)],
        };

        let front_end = self.controller.configurator();
        let capture = self.controller.capture().device();
        vec![
            format!(
                "OK status state={} flags={} build={:?}",
                record.state,
                record.flags,
                record.build_id_str()
            ),
            format!(
                "  front-end armed={} firing={} transmit-configs={} samples={} fault-injected={}",
                front_end.outputs_armed,
                front_end.firing,
                front_end.transmit_count,
                front_end.last_receive.map_or(0, |rx| rx.sample_count),
                front_end.fault_pending()
            ),
            format!(
                "  capture shots={}/{}",
                capture.shots(0),
                capture.shots(1)
            ),
        ]
    }

    fn queue(&mut self, shots: u32, samples: u32, handle: Option<u32>) -> Vec<String> {
        let limit = EMULATOR_SHOTS.min(MAX_PACKET_SHOTS);
        let count = match usize::try_from(shots) {
            Ok(count) if count <= limit => count,
            _ => return vec![format!("ERR at most {limit} shots fit in one frame")],
        };

        let handle = handle.unwrap_or(self.next_handle);
        let shot = Shot::new(pulse_transmit(), RxConfig::new(samples));
        let frame = encode_frame(handle, &vec![shot; count]);

        let reply = match self.request(CommandCode::QueueFrame, &frame) {
            Ok(reply) => reply,
            Err(message) => return vec![message],
        };
        if reply.code != ResponseCode::Ack.to_raw() {
            return vec![describe_unexpected(&reply)];
        }

        self.next_handle = handle.wrapping_add(1);
        vec![format!(
            "OK queued handle={handle} shots={shots} bytes={}",
            frame.len()
        )]
    }

    fn fetch(&mut self, adc: u32, offset: u32, count: u32) -> Vec<String> {
        let request = FrameDataRequest::new(adc, offset, count).to_bytes();
        let reply = match self.request(CommandCode::GetFrame, &request) {
            Ok(reply) => reply,
            Err(message) => return vec![message],
        };
        if reply.code != ResponseCode::Frame.to_raw() {
            return vec![describe_unexpected(&reply)];
        }

        let mut lines = vec![format!("OK frame bytes={}", reply.payload.len())];
        for (row, chunk) in reply
            .payload
            .chunks(DUMP_WIDTH)
            .take(DUMP_LINES)
            .enumerate()
        {
            let mut line = format!("  {:08x}:", offset as usize + row * DUMP_WIDTH);
            for byte in chunk {
                let _ = write!(line, " {byte:02x}");
            }
            lines.push(line);
        }
        if reply.payload.len() > DUMP_WIDTH * DUMP_LINES {
            lines.push("  ...".to_string());
        }
        lines
    }

    fn run(&mut self, iterations: u32) -> Vec<String> {
        let mut lines = Vec::new();
        let mut performed = 0;

        for _ in 0..iterations {
            performed += 1;
            let transition = match self.controller.poll(&mut self.link) {
                Ok(transition) => transition,
                Err(err) => {
                    lines.push(format!("ERR transport {err}"));
                    break;
                }
            };

            match transition {
                Some(transition) => lines.push(format!(
                    "  tick {}: {} -> {} on {}",
                    self.controller.ticks() - 1,
                    transition.from,
                    transition.to,
                    transition.event
                )),
                None if self.is_idle() => break,
                None => {}
            }
        }

        lines.push(format!(
            "OK state={} iterations={performed}",
            self.controller.state()
        ));
        lines
    }

    fn is_idle(&self) -> bool {
        matches!(
            self.controller.state(),
            State::Init | State::Ready | State::Fault
        ) && self.controller.machine().pending().is_empty()
    }

    fn events(&self) -> Vec<String> {
        let telemetry = self.controller.telemetry();
        if telemetry.is_empty() {
            return vec!["no events recorded".to_string()];
        }
        telemetry
            .oldest_first()
            .map(|record| {
                format!(
                    "  #{} tick={} code=0x{:04x} {}",
                    record.id,
                    record.tick,
                    record.event.to_raw(),
                    record.event
                )
            })
            .collect()
    }

    /// Sends one request through the loopback link and collects the reply.
    fn request(&mut self, code: CommandCode, payload: &[u8]) -> Result<Reply, String> {
        let Some(packet) = encode_packet(code.to_raw(), payload) else {
            return Err(format!("ERR payload of {} bytes does not fit a packet", payload.len()));
        };
        debug!("session: sending {:?} ({} bytes)", code, packet.len());

        self.link.push_packet(&packet, self.fragment_len);
        self.controller
            .service_transport(&mut self.link)
            .map_err(|err| format!("ERR transport {err}"))?;

        let outbound = self.link.take_outbound();
        let header = PacketHeader::decode(&outbound).ok_or_else(|| "ERR no reply".to_string())?;
        let end = (HEADER_LEN + usize::from(header.length)).min(outbound.len());
        Ok(Reply {
            code: header.code,
            payload: outbound[HEADER_LEN..end].to_vec(),
        })
    }
}

fn describe_unexpected(reply: &Reply) -> String {
    if reply.code == ResponseCode::Nack.to_raw() {
        match reply.payload.first().copied().and_then(ErrorCode::from_raw) {
            Some(code) => format!("ERR nack {code}"),
            None => format!("ERR nack {:?}", reply.payload),
        }
    } else {
        format!("ERR unexpected response 0x{:02x}", reply.code)
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    match topic {
        Some(target) => {
            if let Some((_, detail)) = HELP_TOPICS.iter().find(|(name, _)| *name == target) {
                lines.push((*detail).to_string());
            } else {
                lines.push(format!("No help available for `{target}`."));
                let topics: Vec<_> = HELP_TOPICS.iter().map(|(name, _)| *name).collect();
                lines.push(format!("Available topics: {}", topics.join(", ")));
            }
        }
        None => {
            lines.push("Available commands:".to_string());
            for (_, detail) in HELP_TOPICS {
                lines.push(format!("  {detail}"));
            }
            lines.push("Type `help <topic>` for a specific command.".to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    use acquisition_core::telemetry::TelemetryEventKind;

    const TEST_SPACE: u32 = 0x1_0000;

    fn session() -> Session {
        Session::new(TEST_SPACE).expect("default config is valid")
    }

    #[test]
    fn new_session_is_ready() {
        let mut session = session();
        let lines = session.handle_command("status");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "  capture shots=0/0");
        assert!(lines[0].starts_with("OK status state=ready flags=0"), "{lines:?}");
    }

    #[test]
    fn queued_frame_runs_to_completion() {
        let mut session = session();
        assert_eq!(
            session.handle_command("queue 2 64 5"),
            vec![format!("OK queued handle=5 shots=2 bytes={}", 8 + 2 * 4848)]
        );

        let lines = session.handle_command("run");
        assert_eq!(lines.last().map(String::as_str), Some("OK state=ready iterations=19"));
        assert_eq!(session.controller.configurator().transmit_count, 2);
        assert!(session.controller.telemetry().oldest_first().any(|record| {
            record.event == TelemetryEventKind::FrameComplete { handle: 5, shots: 2 }
        }));
    }

    #[test]
    fn fetch_reads_back_the_ramp() {
        let mut session = session();
        session.handle_command("queue 1 8");
        session.handle_command("run");

        let lines = session.handle_command("fetch 1 0 4");
        assert_eq!(lines[0], "OK frame bytes=4");
        let expected: Vec<String> = (0..4)
            .map(|index| format!("{:02x}", SimulatedCapture::ramp(1, 0, index)))
            .collect();
        assert_eq!(lines[1], format!("  00000000: {}", expected.join(" ")));
    }

    #[test]
    fn fetch_while_armed_is_rejected() {
        let mut session = session();
        session.handle_command("queue 1 8");
        session.handle_command("run 1");

        assert_eq!(
            session.handle_command("fetch 0 0 4"),
            vec!["ERR nack illegal state".to_string()]
        );
    }

    #[test]
    fn injected_fault_is_cleared_by_clear() {
        let mut session = session();
        assert_eq!(
            session.handle_command("clear"),
            vec!["ERR nack illegal state".to_string()]
        );

        session.handle_command("fault");
        session.handle_command("queue 1 8");
        let lines = session.handle_command("run");
        assert_eq!(lines.last().map(String::as_str), Some("OK state=fault iterations=3"));

        assert_eq!(
            session.handle_command("clear"),
            vec!["OK clear-fault accepted".to_string()]
        );
        let lines = session.handle_command("run");
        assert!(lines[0].contains("fault -> ready on clear-fault"), "{lines:?}");
    }

    #[test]
    fn oversized_frame_is_refused_locally() {
        let mut session = session();
        let refusal = vec!["ERR at most 13 shots fit in one frame".to_string()];
        assert_eq!(session.handle_command("queue 14 8"), refusal);
        assert_eq!(session.handle_command("queue 4000000000 8"), refusal);
        assert!(session.handle_command("queue 13 8")[0].starts_with("OK queued"));
    }

    #[test]
    fn zero_sample_frame_completes() {
        let mut session = session();
        session.handle_command("queue 2 0");

        let lines = session.handle_command("run");
        let last = lines.last().map(String::as_str).unwrap_or_default();
        assert!(last.starts_with("OK state=ready"), "{lines:?}");
        assert_eq!(session.controller.configurator().transmit_count, 2);
        assert_eq!(session.controller.capture().device().shots(0), 0);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let mut session = session();
        let lines = session.handle_command("queue");
        assert!(lines[0].starts_with("ERR syntax"), "{lines:?}");
    }

    #[test]
    fn help_lists_topics() {
        let lines = help(None);
        assert_eq!(lines.len(), HELP_TOPICS.len() + 2);
        assert_eq!(help(Some("run")).len(), 1);
        assert_eq!(help(Some("nope")).len(), 2);
    }
}
