//! DMA capture buffer management.
//!
//! Each receive chip (channel group) streams samples into its own address
//! range. [`CaptureBuffers`] keeps one write cursor per group, rebuilds the
//! descriptor chain for every shot and hands it to the [`CaptureDevice`].
//! Cursors only move forward within a frame and return to the group base when
//! a new frame starts recording.

use core::fmt;

use heapless::Vec;

use crate::frame::RX_CHIPS;

/// Number of capture channel groups.
pub const ADC_GROUPS: usize = RX_CHIPS;
/// Descriptors available in each group's ring.
pub const DESCRIPTOR_RING_CAPACITY: usize = 1024;

pub const DEFAULT_BASE_ADDRESS: u32 = 0x4000_0000;
pub const DEFAULT_GROUP_SPACE: u32 = 0x2000_0000;
pub const DEFAULT_MAX_CHUNK_BYTES: u32 = 2048;
/// Two-byte samples for every channel of one group.
pub const BYTES_PER_SAMPLE_PER_GROUP: u32 = 16;

/// Address map and chunking parameters for the capture memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CaptureConfig {
    /// Base address of group 0.
    pub base_address: u32,
    /// Size of each group's address range.
    pub group_space: u32,
    /// Length of every descriptor.
    pub max_chunk_bytes: u32,
    pub bytes_per_sample: u32,
}

impl CaptureConfig {
    #[must_use]
    pub const fn new(base_address: u32, group_space: u32) -> Self {
        Self {
            base_address,
            group_space,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            bytes_per_sample: BYTES_PER_SAMPLE_PER_GROUP,
        }
    }

    /// First address of `group`'s range.
    #[must_use]
    pub const fn group_base(&self, group: usize) -> u32 {
        let mut base = self.base_address;
        let mut index = 0;
        while index < group {
            base = base.wrapping_add(self.group_space);
            index += 1;
        }
        base
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ADDRESS, DEFAULT_GROUP_SPACE)
    }
}

/// One memory region the device fills during a transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub address: u32,
    pub length: u32,
}

pub type DescriptorChain = Vec<Descriptor, DESCRIPTOR_RING_CAPACITY>;

/// Builds a chain of `max_chunk`-sized descriptors starting at `start`.
///
/// The count is `ceil(total_bytes / max_chunk)` clamped to `free` and to the
/// ring capacity. Every descriptor has the full chunk length, so the last one
/// may extend past `total_bytes`.
#[must_use]
pub fn build_chain(start: u32, total_bytes: u32, max_chunk: u32, free: usize) -> DescriptorChain {
    let mut chain = DescriptorChain::new();
    if max_chunk == 0 {
        return chain;
    }

    let wanted = usize::try_from(total_bytes.div_ceil(max_chunk)).unwrap_or(usize::MAX);
    let count = wanted.min(free).min(DESCRIPTOR_RING_CAPACITY);

    let mut address = start;
    for _ in 0..count {
        // count is bounded by the chain capacity
        let _ = chain.push(Descriptor {
            address,
            length: max_chunk,
        });
        address = address.wrapping_add(max_chunk);
    }
    chain
}

/// Hardware capture engine for all channel groups.
pub trait CaptureDevice {
    type Error;

    /// Free descriptors in `group`'s ring.
    fn free_descriptors(&self, group: usize) -> usize;

    /// Hands a prepared chain to `group`'s ring.
    ///
    /// # Errors
    ///
    /// Returns the device error when the ring rejects the chain.
    fn load(&mut self, group: usize, chain: &[Descriptor]) -> Result<(), Self::Error>;

    /// Starts the transfer of the loaded chain.
    ///
    /// # Errors
    ///
    /// Returns the device error when the engine is not ready.
    fn start(&mut self, group: usize) -> Result<(), Self::Error>;

    fn is_busy(&self, group: usize) -> bool;

    /// Sample memory backing `group`'s address range.
    fn memory(&self, group: usize) -> &[u8];
}

/// Errors reported by [`CaptureBuffers`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaptureError<E> {
    /// Group index beyond [`ADC_GROUPS`].
    InvalidGroup(usize),
    Device(E),
}

impl<E: fmt::Debug> fmt::Display for CaptureError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::InvalidGroup(group) => write!(f, "invalid capture group {group}"),
            CaptureError::Device(error) => write!(f, "capture device error: {error:?}"),
        }
    }
}

/// Outcome of arming one group for a shot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShotPlan {
    pub group: usize,
    /// Address of the first descriptor.
    pub start: u32,
    pub requested_bytes: u32,
    pub descriptors: usize,
    /// Bytes covered by the chain; may exceed `requested_bytes` by less than a chunk.
    pub covered_bytes: u32,
}

impl ShotPlan {
    /// Returns `true` when the ring could not cover the requested bytes.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.covered_bytes < self.requested_bytes
    }
}

/// Per-group write cursors over a [`CaptureDevice`].
pub struct CaptureBuffers<D> {
    device: D,
    config: CaptureConfig,
    cursors: [u32; ADC_GROUPS],
}

impl<D> CaptureBuffers<D>
where
    D: CaptureDevice,
{
    #[must_use]
    pub fn new(device: D, config: CaptureConfig) -> Self {
        Self {
            device,
            config,
            cursors: core::array::from_fn(|group| config.group_base(group)),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Current write address of `group`, if it exists.
    #[must_use]
    pub fn cursor(&self, group: usize) -> Option<u32> {
        self.cursors.get(group).copied()
    }

    /// Rewinds every cursor to its group base.
    pub fn restart_recording(&mut self) {
        for (group, cursor) in self.cursors.iter_mut().enumerate() {
            *cursor = self.config.group_base(group);
        }
        trace!("capture: cursors rewound");
    }

    /// Prepares `group` to capture `sample_count` samples at its cursor.
    ///
    /// The cursor advances by the requested byte count even when the ring
    /// truncates the chain.
    ///
    /// # Errors
    ///
    /// Fails on an unknown group or when the device rejects the chain.
    pub fn arm_shot(
        &mut self,
        group: usize,
        sample_count: u32,
    ) -> Result<ShotPlan, CaptureError<D::Error>> {
        let Some(&start) = self.cursors.get(group) else {
            return Err(CaptureError::InvalidGroup(group));
        };

        let requested_bytes = sample_count.saturating_mul(self.config.bytes_per_sample);
        let chain = build_chain(
            start,
            requested_bytes,
            self.config.max_chunk_bytes,
            self.device.free_descriptors(group),
        );
        let covered_bytes = u32::try_from(chain.len())
            .unwrap_or(u32::MAX)
            .saturating_mul(self.config.max_chunk_bytes);

        self.device
            .load(group, &chain)
            .map_err(CaptureError::Device)?;
        self.cursors[group] = start.wrapping_add(requested_bytes);

        let plan = ShotPlan {
            group,
            start,
            requested_bytes,
            descriptors: chain.len(),
            covered_bytes,
        };
        if plan.is_truncated() {
            warn!(
                "capture: group {} truncated to {} of {} bytes",
                group, covered_bytes, requested_bytes
            );
        }
        Ok(plan)
    }

    /// Starts the transfer prepared by [`Self::arm_shot`].
    ///
    /// # Errors
    ///
    /// Fails on an unknown group or when the device is not ready.
    pub fn start(&mut self, group: usize) -> Result<(), CaptureError<D::Error>> {
        if group >= ADC_GROUPS {
            return Err(CaptureError::InvalidGroup(group));
        }
        self.device.start(group).map_err(CaptureError::Device)
    }

    #[must_use]
    pub fn is_busy(&self, group: usize) -> bool {
        group < ADC_GROUPS && self.device.is_busy(group)
    }

    /// Returns `true` while any group is still transferring.
    #[must_use]
    pub fn any_busy(&self) -> bool {
        (0..ADC_GROUPS).any(|group| self.device.is_busy(group))
    }

    /// Read-only view of captured bytes.
    ///
    /// The group index and the offset are reduced modulo the group count and
    /// the group space; out-of-range values alias rather than fail. The view
    /// ends early if it would run past the group's memory.
    #[must_use]
    pub fn read(&self, group: usize, byte_offset: u32, length: usize) -> &[u8] {
        let group = group % ADC_GROUPS;
        let offset = byte_offset.checked_rem(self.config.group_space).unwrap_or(0);
        let memory = self.device.memory(group);

        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(memory.len());
        let end = start.saturating_add(length).min(memory.len());
        &memory[start..end]
    }
}
