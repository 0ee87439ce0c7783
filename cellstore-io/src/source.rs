use std::io::{self, Read, Write};

use cellstore_error::CellstoreResult;

/// The most [`ByteSource::read_vec`] allocates ahead of the bytes it has read.
pub const READ_STEP: usize = 64 * 1024;

/// A blocking source of bytes: a file, an in-memory buffer or a channel from another process.
///
/// Every read is exact. Running out of bytes is an [`io::ErrorKind::UnexpectedEof`] error and
/// aborts the operation in progress.
pub trait ByteSource {
    /// Fill `buf` completely from the source.
    fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()>;

    /// Discard the next `len` bytes.
    fn skip(&mut self, len: u64) -> CellstoreResult<()> {
        let mut scratch = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(scratch.len(), |r| r.min(scratch.len()));
            self.read_exact_into(&mut scratch[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Read `len` bytes into a new vector.
    ///
    /// The vector grows by at most [`READ_STEP`] bytes per read, so a corrupt length fails with
    /// a short read before anything close to `len` is allocated.
    fn read_vec(&mut self, len: usize) -> CellstoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(READ_STEP));
        while buf.len() < len {
            let start = buf.len();
            buf.resize(start + (len - start).min(READ_STEP), 0);
            self.read_exact_into(&mut buf[start..])?;
        }
        Ok(buf)
    }
}

/// A blocking sink of bytes.
pub trait ByteSink {
    /// Write all of `buf` to the sink.
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()>;

    /// Write `len` zero bytes.
    fn write_zeros(&mut self, len: u64) -> CellstoreResult<()> {
        let zeros = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(zeros.len(), |r| r.min(zeros.len()));
            self.write_all_from(&zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()> {
        (**self).read_exact_into(buf)
    }

    fn skip(&mut self, len: u64) -> CellstoreResult<()> {
        (**self).skip(len)
    }
}

impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()> {
        (**self).write_all_from(buf)
    }
}

/// Writing into memory never fails.
impl ByteSink for Vec<u8> {
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()> {
        self.extend_from_slice(buf);
        Ok(())
    }
}

/// A [`ByteSource`] over any [`Read`], tracking the number of bytes consumed.
pub struct IoSource<R> {
    read: R,
    position: u64,
}

impl<R: Read> IoSource<R> {
    pub fn new(read: R) -> Self {
        Self { read, position: 0 }
    }

    /// Bytes consumed so far, including skipped bytes.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.read
    }
}

impl<R: Read> ByteSource for IoSource<R> {
    fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()> {
        self.read.read_exact(buf).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "short read of {} bytes at offset {}: {}",
                    buf.len(),
                    self.position,
                    e
                ),
            )
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> CellstoreResult<()> {
        let skipped = io::copy(&mut (&mut self.read).take(len), &mut io::sink())?;
        self.position += skipped;
        if skipped != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("skipped {} of {} bytes at offset {}", skipped, len, self.position),
            )
            .into());
        }
        Ok(())
    }
}

/// A [`ByteSink`] over any [`Write`], tracking the number of bytes written.
pub struct IoSink<W> {
    write: W,
    position: u64,
}

impl<W: Write> IoSink<W> {
    pub fn new(write: W) -> Self {
        Self { write, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Flush and return the wrapped writer.
    pub fn finish(mut self) -> CellstoreResult<W> {
        self.write.flush()?;
        Ok(self.write)
    }
}

impl<W: Write> ByteSink for IoSink<W> {
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()> {
        self.write.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }
}

/// Wraps any [`ByteSource`] and counts the bytes consumed, so that absolute file offsets can be
/// reached by skipping forward.
pub struct Tracked<S> {
    source: S,
    position: u64,
}

impl<S: ByteSource> Tracked<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Skip forward to the absolute `offset`. Offsets behind the current position cannot be
    /// reached on a sequential source.
    pub fn seek_forward(&mut self, offset: u64) -> CellstoreResult<()> {
        if offset < self.position {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot move back from offset {} to {} on a sequential source",
                    self.position, offset
                ),
            )
            .into());
        }
        self.skip(offset - self.position)
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S: ByteSource> ByteSource for Tracked<S> {
    fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()> {
        self.source.read_exact_into(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> CellstoreResult<()> {
        self.source.skip(len)?;
        self.position += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cellstore_error::CellstoreError;

    use super::*;

    #[test]
    fn reads_and_skips() {
        let mut source = IoSource::new(&b"0123456789"[..]);
        let mut buf = [0u8; 2];
        source.read_exact_into(&mut buf).unwrap();
        assert_eq!(&buf, b"01");
        source.skip(6).unwrap();
        source.read_exact_into(&mut buf).unwrap();
        assert_eq!(&buf, b"89");
        assert_eq!(source.position(), 10);
    }

    #[test]
    fn short_read_is_io_error() {
        let mut source = IoSource::new(&b"0123"[..]);
        let err = source.read_vec(8).unwrap_err();
        assert!(matches!(err, CellstoreError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn huge_length_fails_before_allocating_it() {
        struct Largest<'a> {
            inner: IoSource<&'a [u8]>,
            largest: usize,
        }

        impl ByteSource for Largest<'_> {
            fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()> {
                self.largest = self.largest.max(buf.len());
                self.inner.read_exact_into(buf)
            }
        }

        let data = vec![7u8; READ_STEP + 10];
        let mut source = Largest {
            inner: IoSource::new(&data[..]),
            largest: 0,
        };
        assert_eq!(source.read_vec(READ_STEP + 4).unwrap().len(), READ_STEP + 4);
        assert!(matches!(source.read_vec(usize::MAX), Err(CellstoreError::Io(_))));
        assert_eq!(source.largest, READ_STEP);
    }

    #[test]
    fn short_skip_is_io_error() {
        let mut source = IoSource::new(&b"0123"[..]);
        assert!(matches!(source.skip(5), Err(CellstoreError::Io(_))));
    }

    #[test]
    fn tracked_seeks_forward_only() {
        let mut source = Tracked::new(IoSource::new(&b"0123456789"[..]));
        source.seek_forward(3).unwrap();
        assert_eq!(source.read_vec(2).unwrap(), b"34");
        assert_eq!(source.position(), 5);
        assert!(source.seek_forward(4).is_err());
        source.seek_forward(9).unwrap();
        assert_eq!(source.read_vec(1).unwrap(), b"9");
    }

    #[test]
    fn sink_counts_bytes() {
        let mut sink = IoSink::new(Vec::new());
        sink.write_all_from(b"abc").unwrap();
        sink.write_zeros(5).unwrap();
        assert_eq!(sink.position(), 8);
        assert_eq!(sink.finish().unwrap(), b"abc\0\0\0\0\0");
    }
}
