use bytes::{BufMut, Bytes, BytesMut};
use cellstore_buffer::{FixedBuf, FixedBufMut};
use cellstore_error::{CellstoreResult, cellstore_bail};
use cellstore_io::{ByteSink, ByteSource};
use itertools::Itertools;
use jiff::Timestamp;

use crate::{IDENT_SIZE, VERSION_TOKEN};

pub const TITLE_WIDTH: usize = 64;
const TIMESTAMP_WIDTH: usize = 24;
pub const LABEL_WIDTH: usize = 64;

/// The fixed-size identification header opening every save file.
///
/// All fields are fixed-width characters, so the header has no byte order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identification {
    pub title: String,
    pub timestamp: Timestamp,
    pub label: String,
}

impl Identification {
    /// An identification stamped with the current time, truncated to whole seconds.
    pub fn now(title: impl Into<String>, label: impl Into<String>) -> CellstoreResult<Self> {
        Ok(Self {
            title: title.into(),
            timestamp: Timestamp::from_second(Timestamp::now().as_second())?,
            label: label.into(),
        })
    }

    pub fn encode(&self) -> CellstoreResult<Bytes> {
        let mut buf = BytesMut::with_capacity(IDENT_SIZE);
        buf.put_slice(&VERSION_TOKEN);
        buf.put_fixed_str(&self.title, TITLE_WIDTH)?;
        buf.put_fixed_str(&self.timestamp.to_string(), TIMESTAMP_WIDTH)?;
        buf.put_fixed_str(&self.label, LABEL_WIDTH)?;
        Ok(buf.freeze())
    }

    pub fn write<K: ByteSink>(&self, sink: &mut K) -> CellstoreResult<()> {
        sink.write_all_from(&self.encode()?)
    }

    pub fn read<S: ByteSource>(source: &mut S) -> CellstoreResult<Self> {
        let mut buf = Bytes::from(source.read_vec(IDENT_SIZE)?);
        let token = buf.split_to(VERSION_TOKEN.len());
        if token[..] != VERSION_TOKEN {
            cellstore_bail!(
                SchemaMismatch: "not a save file of a supported version (token {})",
                token.iter().map(|b| format!("{:02x}", b)).join("")
            );
        }
        let title = buf.get_fixed_str(TITLE_WIDTH)?;
        let timestamp = buf.get_fixed_str(TIMESTAMP_WIDTH)?.parse::<Timestamp>()?;
        let label = buf.get_fixed_str(LABEL_WIDTH)?;
        Ok(Self {
            title,
            timestamp,
            label,
        })
    }
}
