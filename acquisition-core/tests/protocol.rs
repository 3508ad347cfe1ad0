mod support;

use acquisition_core::controller::{ConfigError, ControllerConfig, MAX_SEGMENT_LEN};
use acquisition_core::fsm::State;
use acquisition_core::protocol::{
    CommandCode, ErrorCode, FrameDataRequest, MAGIC, ProtocolConfig, ResponseCode, StatusRecord,
};
use acquisition_core::telemetry::TelemetryEventKind;

use support::{
    MockCapture, MockFrontEnd, MockTransport, TestController, frame_bytes, packet, pulse_shot,
    ready_controller, test_config,
};

fn request(controller: &mut TestController, bytes: &[u8]) -> (u8, Vec<u8>) {
    let mut transport = MockTransport::default();
    controller
        .receive_segment(bytes, &mut transport)
        .expect("mock transport never fails");
    let mut responses = transport.take_responses();
    assert_eq!(responses.len(), 1, "exactly one response per request");
    responses.remove(0)
}

fn nack(code: ErrorCode) -> (u8, Vec<u8>) {
    (ResponseCode::Nack.to_raw(), vec![code.to_raw()])
}

fn status(controller: &mut TestController) -> StatusRecord {
    let (code, payload) = request(controller, &packet(CommandCode::GetStatus.to_raw(), &[]));
    assert_eq!(code, ResponseCode::Status.to_raw());
    StatusRecord::decode(&payload).expect("status payload")
}

#[test]
fn status_reports_state_and_build_id() {
    let mut controller = TestController::new(
        MockCapture::new(1),
        MockFrontEnd::default(),
        test_config(),
    )
    .expect("test config is valid");

    let record = status(&mut controller);
    assert_eq!(record.state, State::Init);
    assert_eq!(record.flags, 0);
    assert_eq!(record.build_id_str(), "acq-test 1.0");
}

#[test]
fn bad_magic_is_rejected_without_state_change() {
    let mut controller = ready_controller();
    let mut bytes = packet(CommandCode::GetStatus.to_raw(), &[]);
    bytes[0] = MAGIC.wrapping_add(1);

    assert_eq!(request(&mut controller, &bytes), nack(ErrorCode::BadPacket));
    assert_eq!(controller.state(), State::Ready);
    assert!(controller.machine().pending().is_empty());
    assert_eq!(
        controller.telemetry().latest().map(|record| record.event),
        Some(TelemetryEventKind::PacketRejected(ErrorCode::BadPacket))
    );
}

#[test]
fn declared_length_must_match_payload() {
    let mut controller = ready_controller();
    let mut bytes = packet(CommandCode::GetStatus.to_raw(), &[0, 0]);
    bytes[2] = 5;

    assert_eq!(request(&mut controller, &bytes), nack(ErrorCode::BadPacket));
}

#[test]
fn unknown_command_is_unrecognized() {
    let mut controller = ready_controller();
    assert_eq!(
        request(&mut controller, &packet(0x7E, &[1, 2, 3])),
        nack(ErrorCode::UnrecognizedCommand)
    );
}

#[test]
fn queue_frame_outside_ready_is_illegal() {
    let mut controller = TestController::new(
        MockCapture::new(1),
        MockFrontEnd::default(),
        test_config(),
    )
    .expect("test config is valid");
    let bytes = packet(
        CommandCode::QueueFrame.to_raw(),
        &frame_bytes(1, &[pulse_shot(10)]),
    );

    assert_eq!(request(&mut controller, &bytes), nack(ErrorCode::IllegalState));
    assert!(controller.machine().pending().is_empty());
    assert!(controller.sequencer().shots().is_empty());
}

#[test]
fn queue_frame_length_must_match_shot_count() {
    let mut controller = ready_controller();
    let mut frame = frame_bytes(1, &[pulse_shot(10), pulse_shot(10)]);
    frame.pop();

    assert_eq!(
        request(&mut controller, &packet(CommandCode::QueueFrame.to_raw(), &frame)),
        nack(ErrorCode::IncorrectSize)
    );
    assert!(controller.machine().pending().is_empty());
}

#[test]
fn queue_frame_rejects_more_shots_than_fit() {
    let mut controller = ready_controller();
    let shots: Vec<_> = (0..=support::TEST_SHOTS).map(|_| pulse_shot(1)).collect();

    let too_many = packet(CommandCode::QueueFrame.to_raw(), &frame_bytes(1, &shots));
    assert_eq!(request(&mut controller, &too_many), nack(ErrorCode::IncorrectSize));
    assert!(controller.sequencer().shots().is_empty());

    let capacity = packet(
        CommandCode::QueueFrame.to_raw(),
        &frame_bytes(1, &shots[..support::TEST_SHOTS]),
    );
    assert_eq!(
        request(&mut controller, &capacity),
        (ResponseCode::Ack.to_raw(), Vec::new())
    );
}

#[test]
fn queue_frame_without_shots_is_invalid() {
    let mut controller = ready_controller();
    let bytes = packet(CommandCode::QueueFrame.to_raw(), &frame_bytes(9, &[]));

    assert_eq!(request(&mut controller, &bytes), nack(ErrorCode::InvalidParameter));
    assert_eq!(controller.state(), State::Ready);
}

#[test]
fn fragmented_queue_frame_is_reassembled() {
    let mut controller = ready_controller();
    let bytes = packet(
        CommandCode::QueueFrame.to_raw(),
        &frame_bytes(3, &[pulse_shot(32), pulse_shot(32)]),
    );
    let fragment_len = ProtocolConfig::default().fragment_len();
    assert_ne!(bytes.len() % fragment_len, 0);

    let mut transport = MockTransport::default();
    for segment in bytes.chunks(fragment_len) {
        transport.inbound.push_back(segment.to_vec());
    }
    controller
        .service_transport(&mut transport)
        .expect("mock transport never fails");

    assert_eq!(
        transport.take_responses(),
        vec![(ResponseCode::Ack.to_raw(), Vec::new())]
    );
    assert_eq!(controller.sequencer().handle(), 3);
    assert_eq!(controller.sequencer().shots().len(), 2);
}

fn controller_with(protocol: ProtocolConfig) -> Result<TestController, ConfigError> {
    let config = ControllerConfig {
        protocol,
        ..test_config()
    };
    TestController::new(MockCapture::new(1), MockFrontEnd::default(), config)
}

#[test]
fn fragment_length_must_fit_the_segment_buffer() {
    assert!(matches!(
        controller_with(ProtocolConfig::new(9000, 40)),
        Err(ConfigError::FragmentLength {
            fragment_len: 8960,
            max: MAX_SEGMENT_LEN,
        })
    ));
    assert!(matches!(
        controller_with(ProtocolConfig::new(40, 40)),
        Err(ConfigError::FragmentLength { fragment_len: 0, .. })
    ));
    assert!(controller_with(ProtocolConfig::new(MAX_SEGMENT_LEN + 40, 40)).is_ok());
}

#[test]
fn largest_accepted_fragments_are_reassembled() {
    let protocol = ProtocolConfig::new(MAX_SEGMENT_LEN + 40, 40);
    let mut controller = controller_with(protocol).expect("fragments fit the buffer");
    controller.init_complete();
    controller.step();

    let mut transport = MockTransport::default();
    transport.push_fragmented(
        protocol.fragment_len(),
        CommandCode::QueueFrame.to_raw(),
        &frame_bytes(9, &[pulse_shot(16), pulse_shot(16)]),
    );
    controller
        .service_transport(&mut transport)
        .expect("mock transport never fails");

    assert_eq!(
        transport.take_responses(),
        vec![(ResponseCode::Ack.to_raw(), Vec::new())]
    );
    assert_eq!(controller.sequencer().handle(), 9);
}

#[test]
fn segment_larger_than_the_buffer_is_not_truncated() {
    let mut controller = ready_controller();
    let fragment_len = ProtocolConfig::default().fragment_len();
    let mut transport = MockTransport::default();
    transport.inbound.push_back(vec![0u8; fragment_len]);
    transport.inbound.push_back(vec![0u8; MAX_SEGMENT_LEN + 1]);
    transport.push_packet(CommandCode::GetStatus.to_raw(), &[]);

    controller
        .service_transport(&mut transport)
        .expect("mock transport never fails");

    let responses = transport.take_responses();
    assert_eq!(responses.len(), 2, "{responses:?}");
    assert_eq!(responses[0], nack(ErrorCode::BadPacket));
    assert_eq!(responses[1].0, ResponseCode::Status.to_raw());
    assert!(
        controller
            .telemetry()
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::ReassemblyOverflow)
    );
    assert_eq!(controller.state(), State::Ready);
}

#[test]
fn oversized_reassembly_is_dropped_with_bad_packet() {
    let mut controller = ready_controller();
    let fragment = vec![0u8; ProtocolConfig::default().fragment_len()];
    let mut transport = MockTransport::default();

    for _ in 0..45 {
        controller
            .receive_segment(&fragment, &mut transport)
            .expect("mock transport never fails");
    }

    assert_eq!(
        transport.take_responses(),
        vec![nack(ErrorCode::BadPacket)]
    );
    assert_eq!(
        controller.telemetry().latest().map(|record| record.event),
        Some(TelemetryEventKind::ReassemblyOverflow)
    );
}

#[test]
fn get_frame_returns_captured_bytes() {
    let mut controller = ready_controller();
    let bytes = FrameDataRequest::new(1, 10, 32).to_bytes();

    let (code, payload) = request(
        &mut controller,
        &packet(CommandCode::GetFrame.to_raw(), &bytes),
    );
    assert_eq!(code, ResponseCode::Frame.to_raw());
    assert_eq!(payload, controller.capture().device().memory[1][10..42].to_vec());
}

#[test]
fn get_frame_aliases_out_of_range_group() {
    let mut controller = ready_controller();
    let bytes = FrameDataRequest::new(3, 0, 4).to_bytes();

    let (_, payload) = request(
        &mut controller,
        &packet(CommandCode::GetFrame.to_raw(), &bytes),
    );
    assert_eq!(payload, controller.capture().device().memory[1][..4].to_vec());
}

#[test]
fn get_frame_checks_request_size_and_count() {
    let mut controller = ready_controller();

    let short = packet(CommandCode::GetFrame.to_raw(), &[0u8; 8]);
    assert_eq!(request(&mut controller, &short), nack(ErrorCode::IncorrectSize));

    let too_many = FrameDataRequest::new(0, 0, 70_000).to_bytes();
    assert_eq!(
        request(
            &mut controller,
            &packet(CommandCode::GetFrame.to_raw(), &too_many)
        ),
        nack(ErrorCode::IncorrectSize)
    );
}

#[test]
fn get_frame_while_armed_is_illegal() {
    let mut controller = ready_controller();
    let frame = packet(
        CommandCode::QueueFrame.to_raw(),
        &frame_bytes(1, &[pulse_shot(10)]),
    );
    request(&mut controller, &frame);
    controller.step();
    assert_eq!(controller.state(), State::Armed);

    let bytes = FrameDataRequest::new(0, 0, 16).to_bytes();
    assert_eq!(
        request(&mut controller, &packet(CommandCode::GetFrame.to_raw(), &bytes)),
        nack(ErrorCode::IllegalState)
    );
    assert_eq!(
        request(&mut controller, &frame),
        nack(ErrorCode::IllegalState)
    );
}

#[test]
fn clear_fault_recovers_to_ready() {
    let mut controller = ready_controller();
    let clear = packet(CommandCode::ClearFault.to_raw(), &[]);

    assert_eq!(request(&mut controller, &clear), nack(ErrorCode::IllegalState));

    controller.configurator_mut().fail_receive = true;
    request(
        &mut controller,
        &packet(
            CommandCode::QueueFrame.to_raw(),
            &frame_bytes(1, &[pulse_shot(10)]),
        ),
    );
    controller.step();
    controller.step();
    assert_eq!(status(&mut controller).state, State::Fault);

    assert_eq!(
        request(&mut controller, &clear),
        (ResponseCode::Ack.to_raw(), Vec::new())
    );
    let transition = controller.step().expect("clear edge");
    assert!(transition.is(State::Fault, State::Ready));
    assert_eq!(status(&mut controller).state, State::Ready);
}
