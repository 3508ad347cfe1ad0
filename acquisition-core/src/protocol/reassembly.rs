//! Segment reassembly.
//!
//! The transport does not preserve packet boundaries. A segment exactly one
//! fragment long (MTU minus transport overhead) is taken to be a non-final
//! fragment and buffered; the next segment of any other length completes the
//! packet. A packet that is itself a multiple of the fragment length is
//! therefore misread; clients avoid those sizes.

use core::fmt;

use heapless::Vec;

use super::MAX_PACKET_LEN;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_TRANSPORT_OVERHEAD: usize = 40;

/// Segment sizing used for fragment detection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtocolConfig {
    pub mtu: usize,
    pub transport_overhead: usize,
}

impl ProtocolConfig {
    #[must_use]
    pub const fn new(mtu: usize, transport_overhead: usize) -> Self {
        Self {
            mtu,
            transport_overhead,
        }
    }

    /// Length of a non-final fragment.
    #[must_use]
    pub const fn fragment_len(&self) -> usize {
        self.mtu.saturating_sub(self.transport_overhead)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MTU, DEFAULT_TRANSPORT_OVERHEAD)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReassemblyState {
    Idle,
    Accumulating,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReassemblyError {
    /// The accumulated packet would exceed the buffer; it has been dropped.
    CapacityExceeded { needed: usize },
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassemblyError::CapacityExceeded { needed } => {
                write!(f, "reassembly needs {needed} bytes")
            }
        }
    }
}

/// Coalesces fragments into packets using a bounded buffer.
pub struct Reassembler<const CAPACITY: usize = MAX_PACKET_LEN> {
    fragment_len: usize,
    state: ReassemblyState,
    buffer: Vec<u8, CAPACITY>,
}

impl<const CAPACITY: usize> Reassembler<CAPACITY> {
    #[must_use]
    pub const fn new(config: ProtocolConfig) -> Self {
        Self {
            fragment_len: config.fragment_len(),
            state: ReassemblyState::Idle,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any partial packet.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ReassemblyState::Idle;
    }

    /// Feeds one transport segment.
    ///
    /// When a packet is complete `handle` runs on it and its result is
    /// returned; the buffer is cleared afterwards. Empty segments are ignored
    /// while idle.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::CapacityExceeded`] when the segment does
    /// not fit; the partial packet is dropped and the reassembler is idle.
    pub fn accept<R>(
        &mut self,
        segment: &[u8],
        handle: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>, ReassemblyError> {
        let fragment = segment.len() == self.fragment_len;

        match (self.state, fragment) {
            (ReassemblyState::Idle, false) => {
                if segment.is_empty() {
                    return Ok(None);
                }
                Ok(Some(handle(segment)))
            }
            (_, true) => {
                self.append(segment)?;
                self.state = ReassemblyState::Accumulating;
                Ok(None)
            }
            (ReassemblyState::Accumulating, false) => {
                self.append(segment)?;
                let result = handle(&self.buffer);
                self.reset();
                Ok(Some(result))
            }
        }
    }

    fn append(&mut self, segment: &[u8]) -> Result<(), ReassemblyError> {
        if self.buffer.extend_from_slice(segment).is_err() {
            let needed = self.buffer.len() + segment.len();
            self.reset();
            return Err(ReassemblyError::CapacityExceeded { needed });
        }
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Reassembler<32> {
        Reassembler::new(ProtocolConfig::new(48, 40))
    }

    #[test]
    fn default_fragment_length_is_1460() {
        assert_eq!(ProtocolConfig::default().fragment_len(), 1460);
    }

    #[test]
    fn short_segment_dispatches_immediately() {
        let mut reassembler = small();
        let seen = reassembler
            .accept(&[1, 2, 3], <[u8]>::len)
            .expect("segment fits");
        assert_eq!(seen, Some(3));
        assert_eq!(reassembler.state(), ReassemblyState::Idle);
    }

    #[test]
    fn fragments_accumulate_until_a_shorter_segment() {
        let mut reassembler = small();
        let fragment = [7u8; 8];

        assert_eq!(reassembler.accept(&fragment, <[u8]>::len), Ok(None));
        assert_eq!(reassembler.state(), ReassemblyState::Accumulating);
        assert_eq!(reassembler.accept(&fragment, <[u8]>::len), Ok(None));
        assert_eq!(reassembler.buffered(), 16);

        let total = reassembler
            .accept(&[9, 9], |packet| {
                assert_eq!(packet[15], 7);
                assert_eq!(&packet[16..], &[9, 9]);
                packet.len()
            })
            .expect("segment fits");
        assert_eq!(total, Some(18));
        assert_eq!(reassembler.state(), ReassemblyState::Idle);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn empty_segment_finishes_an_accumulated_packet() {
        let mut reassembler = small();
        reassembler.accept(&[1u8; 8], |_| ()).expect("fits");
        assert_eq!(reassembler.accept(&[], <[u8]>::len), Ok(Some(8)));
        assert_eq!(reassembler.accept(&[], <[u8]>::len), Ok(None));
    }

    #[test]
    fn overflow_drops_the_partial_packet() {
        let mut reassembler = small();
        for _ in 0..4 {
            reassembler.accept(&[0u8; 8], |_| ()).expect("fits");
        }

        assert_eq!(
            reassembler.accept(&[0u8; 8], |_| ()),
            Err(ReassemblyError::CapacityExceeded { needed: 40 })
        );
        assert_eq!(reassembler.state(), ReassemblyState::Idle);
        assert_eq!(reassembler.buffered(), 0);
    }
}
