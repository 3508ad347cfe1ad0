//! Frame and shot data model plus the little-endian wire layout.
//!
//! A frame is a header (`handle`, `shot_count`) followed by `shot_count`
//! fixed-size shots. Each shot carries a transmit block describing the drive
//! level sequence of every output channel and a receive block with the
//! per-chip front-end settings.

use core::fmt;

use heapless::Vec;
use winnow::Parser;
use winnow::binary::{le_u32, u8 as byte};
use winnow::error::ContextError;
use winnow::token::take;

/// Output and input channels on the front end.
pub const CHANNEL_COUNT: usize = 16;
/// Longest drive level sequence per channel.
pub const MAX_LEVELS: usize = 252;
/// Receive chips (channel groups).
pub const RX_CHIPS: usize = 2;
/// Points in a time-gain-compensation curve.
pub const TGC_POINTS: usize = 300;
/// Default shot capacity of a frame.
pub const MAX_SHOTS: usize = 100;

pub const TX_CHANNEL_LEN: usize = 4 + 4 + MAX_LEVELS;
pub const TX_CONFIG_LEN: usize = CHANNEL_COUNT * TX_CHANNEL_LEN;
pub const RX_CONFIG_LEN: usize =
    CHANNEL_COUNT * 4 + 4 + RX_CHIPS * 4 + RX_CHIPS * (6 + TGC_POINTS);
pub const SHOT_LEN: usize = TX_CONFIG_LEN + RX_CONFIG_LEN;
pub const FRAME_HEADER_LEN: usize = 8;

type ParseResult<O> = Result<O, ContextError>;

/// Discrete drive level applied to an output channel.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Highest positive rail.
    Vpp0,
    Vpp1,
    #[default]
    ReturnToZero,
    Vnn1,
    /// Highest negative rail.
    Vnn0,
}

impl Level {
    #[must_use]
    pub const fn to_raw(self) -> i8 {
        match self {
            Level::Vpp0 => 2,
            Level::Vpp1 => 1,
            Level::ReturnToZero => 0,
            Level::Vnn1 => -1,
            Level::Vnn0 => -2,
        }
    }

    #[must_use]
    pub const fn from_raw(value: i8) -> Option<Self> {
        match value {
            2 => Some(Level::Vpp0),
            1 => Some(Level::Vpp1),
            0 => Some(Level::ReturnToZero),
            -1 => Some(Level::Vnn1),
            -2 => Some(Level::Vnn0),
            _ => None,
        }
    }
}

/// Drive configuration for one output channel.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxChannel {
    pub enabled: bool,
    pub levels: Vec<Level, MAX_LEVELS>,
}

impl TxChannel {
    /// Enabled channel driving `levels`, truncated to [`MAX_LEVELS`].
    #[must_use]
    pub fn with_levels(levels: &[Level]) -> Self {
        Self {
            enabled: true,
            levels: levels.iter().copied().take(MAX_LEVELS).collect(),
        }
    }

    /// Returns `true` when the sequence is empty or starts and ends at zero.
    #[must_use]
    pub fn returns_to_zero(&self) -> bool {
        match (self.levels.first(), self.levels.last()) {
            (Some(first), Some(last)) => {
                *first == Level::ReturnToZero && *last == Level::ReturnToZero
            }
            _ => true,
        }
    }
}

/// Transmit side of a shot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxConfig {
    pub channels: [TxChannel; CHANNEL_COUNT],
}

impl TxConfig {
    /// Every channel disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: core::array::from_fn(|_| TxChannel::default()),
        }
    }

    /// Reports the first enabled channel that leaves the output off zero.
    ///
    /// # Errors
    ///
    /// Returns [`ReturnToZeroViolation`] naming the offending channel.
    pub fn validate(&self) -> Result<(), ReturnToZeroViolation> {
        match self
            .channels
            .iter()
            .position(|channel| channel.enabled && !channel.returns_to_zero())
        {
            Some(channel) => Err(ReturnToZeroViolation { channel }),
            None => Ok(()),
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A transmit sequence that does not begin and end at [`Level::ReturnToZero`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReturnToZeroViolation {
    pub channel: usize,
}

impl fmt::Display for ReturnToZeroViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {} does not start and end at return-to-zero",
            self.channel
        )
    }
}

/// Receive chip output pattern.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestMode {
    #[default]
    Normal,
    ChannelId,
    Sine,
    AnalogTones,
    UserPattern,
}

impl TestMode {
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            TestMode::Normal => 0,
            TestMode::ChannelId => 1,
            TestMode::Sine => 2,
            TestMode::AnalogTones => 3,
            TestMode::UserPattern => 4,
        }
    }

    /// Decodes a raw selector; unknown values fall back to [`TestMode::Normal`].
    #[must_use]
    pub const fn from_raw(value: u8) -> Self {
        match value {
            1 => TestMode::ChannelId,
            2 => TestMode::Sine,
            3 => TestMode::AnalogTones,
            4 => TestMode::UserPattern,
            _ => TestMode::Normal,
        }
    }
}

/// Settings shared by every channel of one receive chip.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChipRx {
    pub tgc_points: u32,
    pub lpf_multiplier: u8,
    pub lpf_divisor: u8,
    pub tgc: [u8; TGC_POINTS],
    pub lna_gain: u8,
    pub pga_gain: u8,
    pub hpf_divisor: u8,
    pub test_mode: TestMode,
}

impl Default for ChipRx {
    fn default() -> Self {
        Self {
            tgc_points: 0,
            lpf_multiplier: 0,
            lpf_divisor: 0,
            tgc: [0; TGC_POINTS],
            lna_gain: 0,
            pga_gain: 0,
            hpf_divisor: 0,
            test_mode: TestMode::Normal,
        }
    }
}

/// Receive side of a shot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RxConfig {
    pub channel_enable: [bool; CHANNEL_COUNT],
    pub sample_count: u32,
    pub chips: [ChipRx; RX_CHIPS],
}

impl RxConfig {
    /// All channels enabled, default chip settings.
    #[must_use]
    pub fn new(sample_count: u32) -> Self {
        Self {
            channel_enable: [true; CHANNEL_COUNT],
            sample_count,
            chips: [ChipRx::default(); RX_CHIPS],
        }
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One pulse-then-capture unit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Shot {
    pub tx: TxConfig,
    pub rx: RxConfig,
}

impl Shot {
    #[must_use]
    pub fn new(tx: TxConfig, rx: RxConfig) -> Self {
        Self { tx, rx }
    }

    /// Decodes a shot from exactly [`SHOT_LEN`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SHOT_LEN {
            return None;
        }
        let mut input = bytes;
        shot(&mut input).ok()
    }

    /// Writes the wire form of the shot.
    pub fn encode(&self, out: &mut [u8; SHOT_LEN]) {
        let mut writer = Writer::new(out);

        for channel in &self.tx.channels {
            writer.put_u32(u32::from(channel.enabled));
            // levels never exceeds MAX_LEVELS, which fits in a u32
            writer.put_u32(u32::try_from(channel.levels.len()).unwrap_or(u32::MAX));
            let mut raw = [0u8; MAX_LEVELS];
            for (slot, level) in raw.iter_mut().zip(channel.levels.iter()) {
                *slot = level.to_raw().to_le_bytes()[0];
            }
            writer.put_slice(&raw);
        }

        let rx = &self.rx;
        for enabled in rx.channel_enable {
            writer.put_u32(u32::from(enabled));
        }
        writer.put_u32(rx.sample_count);
        for chip in &rx.chips {
            writer.put_u32(chip.tgc_points);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.lpf_multiplier);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.lpf_divisor);
        }
        for chip in &rx.chips {
            writer.put_slice(&chip.tgc);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.lna_gain);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.pga_gain);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.hpf_divisor);
        }
        for chip in &rx.chips {
            writer.put_u8(chip.test_mode.to_raw());
        }
    }
}

/// Leading fields of a queued frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub handle: u32,
    pub shot_count: u32,
}

impl FrameHeader {
    #[must_use]
    pub const fn new(handle: u32, shot_count: u32) -> Self {
        Self { handle, shot_count }
    }

    /// Decodes the header from the start of `bytes`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        (word, word)
            .map(|(handle, shot_count)| Self { handle, shot_count })
            .parse_next(&mut input)
            .ok()
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[..4].copy_from_slice(&self.handle.to_le_bytes());
        out[4..].copy_from_slice(&self.shot_count.to_le_bytes());
        out
    }

    /// Total wire length of a frame with this header, if it fits in `usize`.
    #[must_use]
    pub fn frame_len(self) -> Option<usize> {
        usize::try_from(self.shot_count)
            .ok()?
            .checked_mul(SHOT_LEN)?
            .checked_add(FRAME_HEADER_LEN)
    }
}

/// Encodes a complete frame.
#[cfg(feature = "alloc")]
#[must_use]
pub fn encode_frame(handle: u32, shots: &[Shot]) -> alloc::vec::Vec<u8> {
    let shot_count = u32::try_from(shots.len()).unwrap_or(u32::MAX);
    let mut bytes = alloc::vec::Vec::with_capacity(FRAME_HEADER_LEN + shots.len() * SHOT_LEN);
    bytes.extend_from_slice(&FrameHeader::new(handle, shot_count).to_bytes());

    let mut block = [0u8; SHOT_LEN];
    for shot in shots {
        shot.encode(&mut block);
        bytes.extend_from_slice(&block);
    }
    bytes
}

fn word(input: &mut &[u8]) -> ParseResult<u32> {
    le_u32(input)
}

fn octet(input: &mut &[u8]) -> ParseResult<u8> {
    byte(input)
}

fn block<'i>(input: &mut &'i [u8], len: usize) -> ParseResult<&'i [u8]> {
    take(len).parse_next(input)
}

fn shot(input: &mut &[u8]) -> ParseResult<Shot> {
    let tx = tx_config(input)?;
    let rx = rx_config(input)?;
    Ok(Shot { tx, rx })
}

fn tx_config(input: &mut &[u8]) -> ParseResult<TxConfig> {
    let mut config = TxConfig::disabled();
    for channel in &mut config.channels {
        *channel = tx_channel(input)?;
    }
    Ok(config)
}

fn tx_channel(input: &mut &[u8]) -> ParseResult<TxChannel> {
    let enabled = word(input)? != 0;
    let count = word(input)?;
    let raw = block(input, MAX_LEVELS)?;

    let count = usize::try_from(count).map_or(MAX_LEVELS, |count| count.min(MAX_LEVELS));
    let levels = raw[..count]
        .iter()
        .map(|&value| Level::from_raw(i8::from_le_bytes([value])).unwrap_or_default())
        .collect();

    Ok(TxChannel { enabled, levels })
}

fn rx_config(input: &mut &[u8]) -> ParseResult<RxConfig> {
    let mut config = RxConfig::new(0);
    for enabled in &mut config.channel_enable {
        *enabled = word(input)? != 0;
    }
    config.sample_count = word(input)?;

    let chips = &mut config.chips;
    for chip in chips.iter_mut() {
        chip.tgc_points = word(input)?;
    }
    for chip in chips.iter_mut() {
        chip.lpf_multiplier = octet(input)?;
    }
    for chip in chips.iter_mut() {
        chip.lpf_divisor = octet(input)?;
    }
    for chip in chips.iter_mut() {
        let curve = block(input, TGC_POINTS)?;
        chip.tgc.copy_from_slice(curve);
    }
    for chip in chips.iter_mut() {
        chip.lna_gain = octet(input)?;
    }
    for chip in chips.iter_mut() {
        chip.pga_gain = octet(input)?;
    }
    for chip in chips.iter_mut() {
        chip.hpf_divisor = octet(input)?;
    }
    for chip in chips.iter_mut() {
        chip.test_mode = TestMode::from_raw(octet(input)?);
    }
    Ok(config)
}

/// Sequential writer over a fixed output block.
struct Writer<'a> {
    out: &'a mut [u8],
    position: usize,
}

impl<'a> Writer<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, position: 0 }
    }

    fn put_slice(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        self.out[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_le_bytes());
    }

    fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }
}
