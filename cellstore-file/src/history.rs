//! Transcoding of the per-cell state history between storage formats.
//!
//! Every cell keeps `depth` past states. A state is a fixed-point value, either 8 bits with 7
//! fraction bits or 16 bits (little-endian) with 14 fraction bits, optionally followed by a
//! phase byte. A population's history is stored element-major:
//! `cell 0: state 0, state 1, ..., cell 1: state 0, ...`.

use cellstore_error::{CellstoreResult, cellstore_bail};
use cellstore_layout::ModelOptions;
use serde::{Deserialize, Serialize};

/// Bits between the fraction points of the narrow and the wide format.
const WIDTH_SHIFT: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryWidth {
    /// `i8` with 7 fraction bits.
    Narrow,
    /// `i16` with 14 fraction bits.
    Wide,
}

impl HistoryWidth {
    pub fn bytes(&self) -> usize {
        match self {
            HistoryWidth::Narrow => 1,
            HistoryWidth::Wide => 2,
        }
    }

    pub fn from_bytes(bytes: u64) -> CellstoreResult<Self> {
        Ok(match bytes {
            1 => HistoryWidth::Narrow,
            2 => HistoryWidth::Wide,
            _ => cellstore_bail!(SchemaMismatch: "unsupported history value width {}", bytes),
        })
    }
}

/// Storage format of one history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryFormat {
    pub width: HistoryWidth,
    pub phase: bool,
}

impl HistoryFormat {
    pub fn new(width: HistoryWidth, phase: bool) -> Self {
        Self { width, phase }
    }

    pub fn from_options(options: &ModelOptions) -> Self {
        let width = if options.wide_history {
            HistoryWidth::Wide
        } else {
            HistoryWidth::Narrow
        };
        Self::new(width, options.history_phase)
    }

    /// Bytes per entry: the value plus the optional phase byte.
    pub fn entry_size(&self) -> usize {
        self.width.bytes() + usize::from(self.phase)
    }

    fn value(&self, entry: &[u8]) -> i16 {
        match self.width {
            HistoryWidth::Narrow => i16::from(i8::from_le_bytes([entry[0]])),
            HistoryWidth::Wide => i16::from_le_bytes([entry[0], entry[1]]),
        }
    }

    fn put_value(&self, entry: &mut [u8], value: i16) {
        match self.width {
            HistoryWidth::Narrow => entry[0] = value.to_le_bytes()[0],
            HistoryWidth::Wide => entry[..2].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Convert one value between widths: widening shifts left, narrowing shifts right
/// arithmetically and saturates at the narrow range.
fn convert(value: i16, from: HistoryWidth, to: HistoryWidth) -> i16 {
    match (from, to) {
        (HistoryWidth::Narrow, HistoryWidth::Wide) => value << WIDTH_SHIFT,
        (HistoryWidth::Wide, HistoryWidth::Narrow) => {
            (value >> WIDTH_SHIFT).clamp(i16::from(i8::MIN), i16::from(i8::MAX))
        }
        _ => value,
    }
}

/// Transcode the histories of a run of cells from `src` (format `from`, `from_depth` entries
/// per cell) into `dst` (format `to`, `to_depth` entries per cell).
///
/// Entries beyond the common depth are zero filled. The phase byte is carried when both
/// formats have it and zero filled when only the destination has it.
pub fn transcode(
    src: &[u8],
    from: HistoryFormat,
    from_depth: u16,
    dst: &mut [u8],
    to: HistoryFormat,
    to_depth: u16,
) -> CellstoreResult<()> {
    let src_stride = from.entry_size() * usize::from(from_depth);
    let dst_stride = to.entry_size() * usize::from(to_depth);
    let cells = if dst_stride != 0 {
        dst.len() / dst_stride
    } else if src_stride != 0 {
        src.len() / src_stride
    } else {
        0
    };
    if dst.len() != cells * dst_stride || src.len() != cells * src_stride {
        cellstore_bail!(
            Programming: "history of {} source and {} destination bytes for {} cells of {}/{} byte entries",
            src.len(),
            dst.len(),
            cells,
            src_stride,
            dst_stride
        );
    }
    if cells == 0 || dst_stride == 0 {
        return Ok(());
    }
    if src_stride == 0 {
        dst.fill(0);
        return Ok(());
    }
    let common = usize::from(from_depth.min(to_depth));
    for (src_cell, dst_cell) in src
        .chunks_exact(src_stride)
        .zip(dst.chunks_exact_mut(dst_stride))
    {
        let mut src_entries = src_cell.chunks_exact(from.entry_size()).take(common);
        for dst_entry in dst_cell.chunks_exact_mut(to.entry_size()) {
            dst_entry.fill(0);
            let Some(src_entry) = src_entries.next() else {
                continue;
            };
            to.put_value(dst_entry, convert(from.value(src_entry), from.width, to.width));
            if from.phase && to.phase {
                dst_entry[to.width.bytes()] = src_entry[from.width.bytes()];
            }
        }
    }
    Ok(())
}
