//! Per-device table of supported streaming modes.

use crate::traits::{Mode, PixelFormat};

/// A supported mode together with the largest frame it can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeEntry {
    /// The mode.
    pub mode: Mode,
    /// Upper bound of one frame's payload in bytes (`dwMaxVideoFrameBufferSize`).
    pub max_frame_bytes: u32,
}

impl ModeEntry {
    /// Entry with the frame size derived from the format. Compressed formats
    /// are budgeted like a packed 4:2:2 frame.
    pub fn new(mode: Mode) -> Self {
        let bytes = mode
            .format
            .frame_bytes(mode.width, mode.height)
            .unwrap_or(mode.width as usize * mode.height as usize * 2);
        Self {
            mode,
            max_frame_bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
        }
    }

    /// Entry with an explicit frame budget.
    pub const fn with_max_frame_bytes(mode: Mode, max_frame_bytes: u32) -> Self {
        Self {
            mode,
            max_frame_bytes,
        }
    }

    /// Isochronous bandwidth the mode needs, in bytes per second.
    pub fn bandwidth_cost(&self) -> u64 {
        let fps = self.mode.fps;
        let bytes = u64::from(self.max_frame_bytes) * u64::from(fps.numerator);
        bytes.div_ceil(u64::from(fps.denominator))
    }
}

/// Set of modes a device supports. Modes are unique within a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeTable {
    entries: Vec<ModeEntry>,
}

impl ModeTable {
    /// Build a table, keeping the first entry of any duplicated mode.
    pub fn new<I: IntoIterator<Item = ModeEntry>>(entries: I) -> Self {
        let mut table = Self::default();
        for entry in entries {
            if table.contains(&entry.mode) {
                tracing::debug!(mode = %entry.mode, "dropping duplicate mode");
                continue;
            }
            table.entries.push(entry);
        }
        table
    }

    /// Table with frame budgets derived from each mode's format.
    pub fn from_modes<I: IntoIterator<Item = Mode>>(modes: I) -> Self {
        Self::new(modes.into_iter().map(ModeEntry::new))
    }

    /// All entries in device order.
    pub fn entries(&self) -> &[ModeEntry] {
        &self.entries
    }

    /// All modes in device order.
    pub fn modes(&self) -> impl Iterator<Item = &Mode> + '_ {
        self.entries.iter().map(|entry| &entry.mode)
    }

    /// Entry for an exact mode.
    pub fn get(&self, mode: &Mode) -> Option<&ModeEntry> {
        self.entries.iter().find(|entry| entry.mode == *mode)
    }

    /// Whether the table holds this exact mode.
    pub fn contains(&self, mode: &Mode) -> bool {
        self.get(mode).is_some()
    }

    /// Number of modes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct frame sizes, in device order.
    pub fn frame_sizes(&self) -> Vec<(u32, u32)> {
        let mut sizes: Vec<(u32, u32)> = Vec::new();
        for mode in self.modes() {
            let size = (mode.width, mode.height);
            if !sizes.contains(&size) {
                sizes.push(size);
            }
        }
        sizes
    }

    /// Distinct frame rates available at a frame size, highest first.
    pub fn frame_rates(&self, width: u32, height: u32) -> Vec<f64> {
        let mut rates: Vec<f64> = self
            .modes()
            .filter(|mode| mode.width == width && mode.height == height)
            .map(|mode| mode.fps.as_f64())
            .collect();
        rates.sort_by(|a, b| b.total_cmp(a));
        rates.dedup();
        rates
    }

    /// Modes using a given pixel format.
    pub fn with_format(&self, format: PixelFormat) -> impl Iterator<Item = &Mode> + '_ {
        self.modes().filter(move |mode| mode.format == format)
    }
}
