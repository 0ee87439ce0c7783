//! Moving bulk record bytes between a save file and live records.
//!
//! A [`RecordPlan`] describes which bytes of a record on disk end up where in the live record.
//! Only restorable prefixes are moved; everything else in the file record is skipped and the
//! rest of the live record is left alone. Between the file and the owning node the selected
//! bytes travel as a compact stream, the concatenation of every segment in file order.

use cellstore_error::{CellstoreResult, cellstore_bail};
use cellstore_io::{ByteSink, ByteSource};
use serde::{Deserialize, Serialize};

/// `repeat` equally spaced segments of `len` bytes, e.g. the restorable prefix of every
/// connection record of one connection type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub file_offset: u32,
    pub live_offset: u32,
    pub len: u32,
    pub repeat: u32,
    pub file_stride: u32,
    pub live_stride: u32,
}

impl Run {
    /// A single segment.
    pub fn once(file_offset: u32, live_offset: u32, len: u32) -> Self {
        Self {
            file_offset,
            live_offset,
            len,
            repeat: 1,
            file_stride: 0,
            live_stride: 0,
        }
    }

    /// `(file offset, live offset)` of every segment, as u64 to keep the arithmetic exact.
    fn segments(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..u64::from(self.repeat)).map(|i| {
            (
                u64::from(self.file_offset) + i * u64::from(self.file_stride),
                u64::from(self.live_offset) + i * u64::from(self.live_stride),
            )
        })
    }
}

/// The byte mapping from one file record to one live record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordPlan {
    file_record_length: u32,
    live_record_length: u32,
    runs: Vec<Run>,
    transfer_length: usize,
}

impl RecordPlan {
    /// Check that every segment lies inside both records and that segments follow each other
    /// in the file without overlapping, so a record can be streamed front to back.
    pub fn new(
        file_record_length: u32,
        live_record_length: u32,
        runs: Vec<Run>,
    ) -> CellstoreResult<Self> {
        let runs: Vec<Run> = runs
            .into_iter()
            .filter(|r| r.len > 0 && r.repeat > 0)
            .collect();
        let mut cursor = 0u64;
        let mut transfer_length = 0u64;
        for run in &runs {
            for (file_offset, live_offset) in run.segments() {
                let len = u64::from(run.len);
                if file_offset < cursor {
                    cellstore_bail!(
                        Programming: "segment at file offset {} overlaps the previous one ending at {}",
                        file_offset,
                        cursor
                    );
                }
                if file_offset + len > u64::from(file_record_length) {
                    cellstore_bail!(
                        SchemaMismatch: "segment {}..{} exceeds the {} byte file record",
                        file_offset,
                        file_offset + len,
                        file_record_length
                    );
                }
                if live_offset + len > u64::from(live_record_length) {
                    cellstore_bail!(
                        Programming: "segment {}..{} exceeds the {} byte live record",
                        live_offset,
                        live_offset + len,
                        live_record_length
                    );
                }
                cursor = file_offset + len;
                transfer_length += len;
            }
        }
        Ok(Self {
            file_record_length,
            live_record_length,
            runs,
            transfer_length: crate::to_usize(transfer_length)?,
        })
    }

    pub fn file_record_length(&self) -> u32 {
        self.file_record_length
    }

    pub fn live_record_length(&self) -> u32 {
        self.live_record_length
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Bytes of the compact stream per record.
    pub fn transfer_length(&self) -> usize {
        self.transfer_length
    }

    /// Read one file record, keeping only the planned segments. `compact` must hold
    /// [`RecordPlan::transfer_length`] bytes.
    pub fn read_record(
        &self,
        source: &mut impl ByteSource,
        compact: &mut [u8],
    ) -> CellstoreResult<()> {
        self.check_compact(compact)?;
        let mut cursor = 0u64;
        let mut filled = 0usize;
        for run in &self.runs {
            let len = run.len as usize;
            for (file_offset, _) in run.segments() {
                source.skip(file_offset - cursor)?;
                source.read_exact_into(&mut compact[filled..filled + len])?;
                filled += len;
                cursor = file_offset + u64::from(run.len);
            }
        }
        source.skip(u64::from(self.file_record_length) - cursor)
    }

    /// Copy the compact stream of one record into its live record.
    pub fn scatter_record(&self, compact: &[u8], live: &mut [u8]) -> CellstoreResult<()> {
        self.check_compact(compact)?;
        if live.len() != self.live_record_length as usize {
            cellstore_bail!(
                Programming: "live record of {} bytes, expected {}",
                live.len(),
                self.live_record_length
            );
        }
        let mut filled = 0usize;
        for run in &self.runs {
            let len = run.len as usize;
            for (_, live_offset) in run.segments() {
                let start = crate::to_usize(live_offset)?;
                live[start..start + len].copy_from_slice(&compact[filled..filled + len]);
                filled += len;
            }
        }
        Ok(())
    }

    fn check_compact(&self, compact: &[u8]) -> CellstoreResult<()> {
        if compact.len() != self.transfer_length {
            cellstore_bail!(
                Programming: "compact record of {} bytes, expected {}",
                compact.len(),
                self.transfer_length
            );
        }
        Ok(())
    }
}

/// Copy `len` bytes from `source` to `sink` through a buffer of at most `chunk_size` bytes.
pub fn copy_bytes(
    source: &mut impl ByteSource,
    sink: &mut impl ByteSink,
    len: u64,
    chunk_size: usize,
) -> CellstoreResult<()> {
    if chunk_size == 0 && len > 0 {
        cellstore_bail!("chunk size must be positive");
    }
    let mut buffer = vec![0u8; chunk_size.min(crate::to_usize(len)?)];
    let mut remaining = len;
    while remaining > 0 {
        let take = buffer.len().min(crate::to_usize(remaining)?);
        source.read_exact_into(&mut buffer[..take])?;
        sink.write_all_from(&buffer[..take])?;
        remaining -= take as u64;
    }
    Ok(())
}
