use crate::capture::{CaptureBuffers, CaptureDevice};
use crate::fsm::{Event, PendingEvents, State, StateMachine};
use crate::sequencer::ShotSequencer;

use super::{
    BUILD_ID_LEN, CommandCode, ErrorCode, FrameDataRequest, MAX_PAYLOAD_LEN, Packet, ResponseCode,
    StatusRecord,
};

/// Reply produced for one request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response<'a> {
    Ack,
    Nack(ErrorCode),
    Status(StatusRecord),
    /// Raw captured bytes.
    Frame(&'a [u8]),
}

impl Response<'_> {
    #[must_use]
    pub const fn code(&self) -> ResponseCode {
        match self {
            Response::Ack => ResponseCode::Ack,
            Response::Nack(_) => ResponseCode::Nack,
            Response::Status(_) => ResponseCode::Status,
            Response::Frame(_) => ResponseCode::Frame,
        }
    }
}

/// Components a request may touch.
pub struct DispatchContext<'a, D, P, const SHOTS: usize>
where
    P: AsRef<PendingEvents>,
{
    pub machine: &'a StateMachine<P>,
    pub sequencer: &'a mut ShotSequencer<SHOTS>,
    pub capture: &'a mut CaptureBuffers<D>,
    pub build_id: &'a [u8; BUILD_ID_LEN],
}

/// Validates `bytes` as a packet and runs the command it carries.
pub fn dispatch<'a, D, P, const SHOTS: usize>(
    bytes: &[u8],
    context: DispatchContext<'a, D, P, SHOTS>,
) -> Response<'a>
where
    D: CaptureDevice,
    P: AsRef<PendingEvents>,
{
    let packet = match Packet::decode(bytes) {
        Ok(packet) => packet,
        Err(code) => return Response::Nack(code),
    };
    let state = context.machine.state();

    match CommandCode::from_raw(packet.code) {
        Some(CommandCode::GetStatus) => {
            Response::Status(StatusRecord::new(state, *context.build_id))
        }
        Some(CommandCode::ClearFault) => {
            if state != State::Fault {
                return Response::Nack(ErrorCode::IllegalState);
            }
            context.machine.raise(Event::ClearFault);
            Response::Ack
        }
        Some(CommandCode::QueueFrame) => {
            match context
                .sequencer
                .queue_frame(packet.payload, context.machine, context.capture)
            {
                Ok(_) => Response::Ack,
                Err(code) => Response::Nack(code),
            }
        }
        Some(CommandCode::GetFrame) => {
            if state != State::Ready {
                return Response::Nack(ErrorCode::IllegalState);
            }
            let Some(request) = FrameDataRequest::decode(packet.payload) else {
                return Response::Nack(ErrorCode::IncorrectSize);
            };
            let length = usize::try_from(request.byte_count).unwrap_or(usize::MAX);
            if length > MAX_PAYLOAD_LEN {
                return Response::Nack(ErrorCode::IncorrectSize);
            }
            let group = usize::try_from(request.adc).unwrap_or(usize::MAX);
            let capture: &'a CaptureBuffers<D> = context.capture;
            Response::Frame(capture.read(group, request.byte_offset, length))
        }
        None => Response::Nack(ErrorCode::UnrecognizedCommand),
    }
}
