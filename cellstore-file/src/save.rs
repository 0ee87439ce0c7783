//! Writing a live model to a save file.
//!
//! The file holds the identification header, the header blocks of every entity, an `END`
//! block and then, per cell population in model order, the state history followed by the
//! records. Header blocks have a size that does not depend on the values they carry, so the
//! payload offsets are known before anything is written.
//!
//! In a distributed run only the coordinator writes; workers send their element ranges of
//! every population to it in chunks.

use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};
use cellstore_io::{ByteSink, COORDINATOR, Channel, Inbox, LocalMesh, Outbox};

use crate::IDENT_SIZE;
use crate::entity::{EntityId, entities, file_header, live_header};
use crate::ident::Identification;
use crate::live::LiveModel;
use crate::mover::copy_bytes;
use crate::options::WriteOptions;
use crate::schema::{BlockKind, names};
use crate::value::Value;
use crate::writer::{BlockWriter, HeaderInstance};

/// Header blocks of a model with their payload offsets filled in.
pub struct SaveLayout {
    headers: Vec<HeaderInstance<'static>>,
    data_start: u64,
    length: u64,
}

impl SaveLayout {
    pub fn new(model: &LiveModel) -> CellstoreResult<Self> {
        let mut headers = vec![file_header(model)?];
        for (id, _) in entities(model) {
            headers.push(live_header(model, id)?);
        }
        headers.push(HeaderInstance::new(BlockKind::End.schema()).with("DATAPOS", Value::unsigned(0))?);

        let mut data_start = IDENT_SIZE as u64;
        for header in &headers {
            data_start += header.encoded_len()?;
        }

        let overflow = || cellstore_err!(Overflow: "save file exceeds {} bytes", u64::MAX);
        let mut cursor = data_start;
        let mut records_at = 0u64;
        for (header, (id, _)) in headers[1..].iter_mut().zip(entities(model)) {
            match id {
                EntityId::Cells(r, c) => {
                    let cells = model.cells(r, c)?;
                    let history = u64::from(cells.count())
                        .checked_mul(cells.history_stride() as u64)
                        .ok_or_else(overflow)?;
                    let records = u64::from(cells.count())
                        .checked_mul(cells.record_length() as u64)
                        .ok_or_else(overflow)?;
                    header.set("HISTOFF", Value::unsigned(cursor))?;
                    cursor = cursor.checked_add(history).ok_or_else(overflow)?;
                    records_at = cursor;
                    header.set(names::DATAOFF, Value::unsigned(cursor))?;
                    cursor = cursor.checked_add(records).ok_or_else(overflow)?;
                }
                EntityId::Conns(..) => {
                    let offset = header.unsigned("RECOFF").unwrap_or(0);
                    header.set(names::DATAOFF, Value::unsigned(records_at + offset))?;
                }
                EntityId::Region(_) | EntityId::Secondary(..) => {}
            }
        }
        if let Some(end) = headers.last_mut() {
            end.set("DATAPOS", Value::unsigned(data_start))?;
        }

        Ok(Self {
            headers,
            data_start,
            length: cursor,
        })
    }

    pub fn headers(&self) -> &[HeaderInstance<'static>] {
        &self.headers
    }

    /// Offset of the first payload byte.
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Length of the whole file.
    pub fn length(&self) -> u64 {
        self.length
    }
}

/// Writes save files.
#[derive(Clone, Debug, Default)]
pub struct SaveWriter {
    options: WriteOptions,
}

impl SaveWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    /// Save a model held by a single process, returning the sink.
    pub fn write<K: ByteSink>(&self, sink: K, model: &LiveModel) -> CellstoreResult<K> {
        self.write_coordinator(sink, model, &mut LocalMesh::single())
    }

    /// Save a distributed model on the coordinator, collecting the workers' payload.
    pub fn write_coordinator<K: ByteSink, C: Channel>(
        &self,
        sink: K,
        model: &LiveModel,
        channel: &mut C,
    ) -> CellstoreResult<K> {
        check_channel(model, channel)?;
        if !channel.is_coordinator() {
            cellstore_bail!(Programming: "node {} cannot write the save file", channel.node());
        }
        let layout = SaveLayout::new(model)?;
        let mut writer = BlockWriter::new(sink);
        writer.write_ident(&Identification::now(self.options.title(), self.options.label())?)?;
        for header in layout.headers() {
            writer.write_header(header)?;
        }
        if writer.position() != layout.data_start() {
            cellstore_bail!(
                Programming: "headers end at {}, expected {}",
                writer.position(),
                layout.data_start()
            );
        }

        let partition = model.partition();
        let nodes = channel.nodes();
        let mut inbox = Inbox::new(channel);
        for (_, _, cells) in model.populations() {
            writer.write_payload(cells.histories())?;
            for peer in 1..nodes {
                let range = partition.range(cells.count(), peer);
                let len = u64::from(range.end - range.start) * cells.history_stride() as u64;
                copy_bytes(&mut inbox.source(peer), &mut writer, len, self.options.chunk_size())?;
            }
            writer.write_payload(cells.records())?;
            for peer in 1..nodes {
                let range = partition.range(cells.count(), peer);
                let len = u64::from(range.end - range.start) * cells.record_length() as u64;
                copy_bytes(&mut inbox.source(peer), &mut writer, len, self.options.chunk_size())?;
            }
        }
        inbox.finish()?;

        if writer.position() != layout.length() {
            cellstore_bail!(
                Programming: "wrote {} bytes, expected {}",
                writer.position(),
                layout.length()
            );
        }
        log::debug!(
            "saved {} header blocks and {} payload bytes",
            layout.headers().len(),
            layout.length() - layout.data_start()
        );
        Ok(writer.into_inner())
    }

    /// Send this worker's part of a distributed model to the coordinator.
    pub fn write_worker<C: Channel>(&self, model: &LiveModel, channel: &mut C) -> CellstoreResult<()> {
        check_channel(model, channel)?;
        if channel.is_coordinator() {
            cellstore_bail!(Programming: "the coordinator must write the save file");
        }
        let mut outbox = Outbox::new(channel, self.options.chunk_size())?;
        for (_, _, cells) in model.populations() {
            outbox.write(COORDINATOR, cells.histories())?;
            outbox.write(COORDINATOR, cells.records())?;
        }
        outbox.finish()
    }
}

/// The model must be partitioned for the run the channel connects.
pub(crate) fn check_channel<C: Channel>(model: &LiveModel, channel: &C) -> CellstoreResult<()> {
    if channel.nodes() != model.partition().nodes() || channel.node() != model.node() {
        cellstore_bail!(
            Programming: "model of node {} of {} used on node {} of {}",
            model.node(),
            model.partition().nodes(),
            channel.node(),
            channel.nodes()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cellstore_io::{IoSource, Partition};
    use cellstore_layout::{CellSpec, ConnSpec, FieldCatalog, ModelSpec, RegionSpec, SourceRef};

    use super::*;
    use crate::reader::{BlockReader, decode_block};

    fn spec() -> ModelSpec {
        ModelSpec {
            options: Default::default(),
            regions: vec![RegionSpec {
                name: "v1".to_string(),
                cells: vec![
                    CellSpec {
                        name: "pyr".to_string(),
                        count: 3,
                        fields: ["IZVU"].into_iter().collect(),
                        history_depth: 2,
                        conns: vec![ConnSpec {
                            source: SourceRef::new("v1", "inh"),
                            count: 2,
                            fields: ["CIJ"].into_iter().collect(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                    CellSpec {
                        name: "inh".to_string(),
                        count: 2,
                        fields: ["SBAR"].into_iter().collect(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn payload_offsets_follow_the_headers() {
        let model = LiveModel::new(spec(), FieldCatalog::standard()).unwrap();
        let layout = SaveLayout::new(&model).unwrap();
        let bytes = SaveWriter::default().write(Vec::new(), &model).unwrap();
        assert_eq!(bytes.len() as u64, layout.length());

        let mut reader = BlockReader::open(IoSource::new(&bytes[..])).unwrap();
        let mut cells = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            if block.name == "CELLS" {
                cells.push(decode_block(&block, BlockKind::Cells.schema()).unwrap());
            }
        }
        assert_eq!(reader.position(), layout.data_start());

        let pyr = model.cells(0, 0).unwrap();
        let hist = cells[0].unsigned("HISTOFF").unwrap();
        let data = cells[0].unsigned(names::DATAOFF).unwrap();
        assert_eq!(hist, layout.data_start());
        assert_eq!(data, hist + 3 * pyr.history_stride() as u64);
        assert_eq!(
            cells[1].unsigned("HISTOFF").unwrap(),
            data + 3 * pyr.record_length() as u64
        );
    }

    #[test]
    fn only_the_coordinator_writes() {
        let model = LiveModel::for_node(spec(), FieldCatalog::standard(), Partition::new(2), 1).unwrap();
        let mut mesh = LocalMesh::new(2);
        let mut worker = mesh.pop().unwrap();
        assert!(SaveWriter::default().write_coordinator(Vec::new(), &model, &mut worker).is_err());
    }

    #[test]
    fn model_and_channel_must_agree() {
        let model = LiveModel::new(spec(), FieldCatalog::standard()).unwrap();
        let mut mesh = LocalMesh::new(2);
        assert!(SaveWriter::default().write_coordinator(Vec::new(), &model, &mut mesh[0]).is_err());
    }
}
