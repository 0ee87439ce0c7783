#![allow(clippy::cast_possible_truncation)]
use std::ops::Range;
use std::thread;

use cellstore_error::CellstoreError;
use cellstore_io::{IoSink, IoSource, LocalMesh, Partition};
use cellstore_layout::{CellSpec, ConnSpec, FieldCatalog, ModelOptions, ModelSpec, RegionSpec, SourceRef};

use crate::schema::names;
use crate::{
    BlockKind, BlockReader, EntityId, FieldProto, GlobalState, IDENT_SIZE, LiveModel, Pin,
    PopulationState, RawBlock, RawField, RestoreOptions, RestoreStatus, Restorer,
    SAVE_FILE_EXTENSION, SaveLayout, SaveWriter, Schema, Value, WireType, WriteOptions,
    decode_block, inspect, open_files,
};

fn spec() -> ModelSpec {
    let conn = ConnSpec {
        source: SourceRef::new("v1", "inh"),
        count: 2,
        fields: ["CIJ", "DLY", "LIJ"].into_iter().collect(),
        ..Default::default()
    };
    ModelSpec {
        options: ModelOptions::default(),
        regions: vec![RegionSpec {
            name: "v1".to_string(),
            grid: [2, 2],
            cells: vec![
                CellSpec {
                    name: "pyr".to_string(),
                    count: 5,
                    fields: ["IZVU", "SBAR", "XYZ"].into_iter().collect(),
                    history_depth: 3,
                    conns: vec![conn.clone(), conn.clone(), conn],
                    ..Default::default()
                },
                CellSpec {
                    name: "inh".to_string(),
                    count: 4,
                    fields: ["SBAR", "PHASE"].into_iter().collect(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
    }
}

fn model(spec: ModelSpec) -> LiveModel {
    LiveModel::new(spec, FieldCatalog::standard()).unwrap()
}

fn pattern(salt: u8, r: usize, c: usize, element: u32, byte: usize) -> u8 {
    (usize::from(salt) + 31 * r + 17 * c + 7 * element as usize + byte) as u8 | 1
}

/// Fill every record and history the node holds with values that depend on their position.
fn fill(model: &mut LiveModel, salt: u8) {
    model.global = GlobalState {
        seeds: [11, -12],
        time_step: 1 << 10,
    };
    let populations: Vec<(usize, usize)> = model.populations().map(|(r, c, _)| (r, c)).collect();
    for (r, c) in populations {
        let cells = model.cells_mut(r, c).unwrap();
        cells.state = PopulationState {
            seeds: [r as i32 + 1, c as i32 + 2],
            autoscale: 3 << 16,
        };
        for (k, conn) in cells.conns.iter_mut().enumerate() {
            conn.seeds = [k as i32 + 5, -(k as i32)];
        }
        for element in cells.range() {
            for (i, b) in cells.record_mut(element).unwrap().iter_mut().enumerate() {
                *b = pattern(salt, r, c, element, i);
            }
            for (i, b) in cells.history_mut(element).unwrap().iter_mut().enumerate() {
                *b = (element as u8 + i as u8) & 0x3f;
            }
        }
    }
}

/// The byte ranges of a record that survive a save and restore.
fn restorable(model: &LiveModel, r: usize, c: usize) -> Vec<Range<usize>> {
    let layout = &model.layout().regions()[r].cells()[c];
    let mut ranges = vec![0..layout.cell().restorable_length() as usize];
    for conn in layout.conns() {
        for j in 0..conn.count() {
            let start = (conn.offset_in_cell() + j * conn.stride()) as usize;
            ranges.push(start..start + conn.per_conn().restorable_length() as usize);
        }
    }
    ranges
}

fn assert_restored(model: &LiveModel, salt: u8) {
    assert_eq!(model.global.seeds, [11, -12]);
    assert_eq!(model.global.time_step, 1 << 10);
    for (r, c, cells) in model.populations() {
        let ranges = restorable(model, r, c);
        assert_eq!(cells.state.autoscale, 3 << 16);
        for element in cells.range() {
            let record = cells.record(element).unwrap();
            for (i, &b) in record.iter().enumerate() {
                if ranges.iter().any(|range| range.contains(&i)) {
                    assert_eq!(b, pattern(salt, r, c, element, i), "{r}/{c} cell {element} byte {i}");
                } else {
                    assert_eq!(b, 0, "{r}/{c} cell {element} byte {i} is not restorable");
                }
            }
            for (i, &b) in cells.history(element).unwrap().iter().enumerate() {
                assert_eq!(b, (element as u8 + i as u8) & 0x3f);
            }
        }
    }
}

fn saved(salt: u8) -> Vec<u8> {
    let mut live = model(spec());
    fill(&mut live, salt);
    SaveWriter::default().write(Vec::new(), &live).unwrap()
}

/// Re-encode the header blocks of a save file, moving the payload offsets with them.
fn rewrite(bytes: &[u8], edit: impl Fn(&mut Vec<RawBlock>)) -> Vec<u8> {
    let mut reader = BlockReader::open(IoSource::new(bytes)).unwrap();
    let mut blocks = Vec::new();
    while let Some(block) = reader.next_block().unwrap() {
        blocks.push(block);
    }
    let old_start = reader.position();
    let ident = reader.ident().clone();
    edit(&mut blocks);

    let new_start =
        IDENT_SIZE as u64 + blocks.iter().map(|b| b.encoded_len() as u64).sum::<u64>();
    for block in &mut blocks {
        let Some(kind) = BlockKind::from_name(&block.name) else {
            continue;
        };
        for field in &mut block.fields {
            if !matches!(field.name.as_str(), "HISTOFF" | names::DATAOFF | "DATAPOS") {
                continue;
            }
            let (value, _) = Value::from_raw(field).unwrap();
            let offset = value.as_unsigned().unwrap()[0] - old_start + new_start;
            let proto = kind.schema().field(&field.name).unwrap();
            *field = Value::unsigned(offset).encode(proto).unwrap();
        }
    }

    let mut out = ident.encode().unwrap().to_vec();
    for block in &blocks {
        out.extend_from_slice(&block.encode().unwrap());
    }
    out.extend_from_slice(&bytes[old_start as usize..]);
    out
}

#[test]
fn round_trip_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("run.{}", SAVE_FILE_EXTENSION));

    let mut live = model(spec());
    fill(&mut live, 3);
    let options = WriteOptions::default()
        .with_title("round trip")
        .unwrap()
        .with_label("v1 only")
        .unwrap()
        .with_chunk_size(7)
        .unwrap();
    let sink = IoSink::new(std::fs::File::create(&path).unwrap());
    SaveWriter::new(options).write(sink, &live).unwrap().finish().unwrap();
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        SaveLayout::new(&live).unwrap().length()
    );

    let mut restored = model(spec());
    let options = RestoreOptions::default().with_chunk_size(5).unwrap();
    let report = Restorer::new(options)
        .restore(open_files(&[&path]).unwrap(), &mut restored)
        .unwrap();
    assert!(report.generated().next().is_none());
    assert_eq!(
        report.status(EntityId::Cells(0, 1)),
        Some(RestoreStatus::Bound {
            file: 0,
            ordinal: 1
        })
    );
    assert_restored(&restored, 3);

    let pyr = restored.cells(0, 0).unwrap();
    assert_eq!(pyr.state.seeds, [1, 2]);
    assert_eq!(pyr.conns[2].seeds, [7, -2]);
}

#[test]
fn identification_survives() {
    let live = model(spec());
    let options = WriteOptions::default().with_title("night run").unwrap();
    let bytes = SaveWriter::new(options).write(Vec::new(), &live).unwrap();
    let inspection = inspect(IoSource::new(&bytes[..])).unwrap();
    assert_eq!(inspection.ident.title, "night run");
    assert_eq!(inspection.blocks_named("CONNS").count(), 3);
}

#[test]
fn reads_files_of_an_older_layout() {
    // an older writer kept RECLEN in 16 bits, had no HPHASE and wrote a field and a block
    // this version does not know
    let bytes = rewrite(&saved(9), |blocks| {
        for block in blocks.iter_mut().filter(|b| b.name == "CELLS") {
            let reclen = block.field("RECLEN").unwrap();
            let (value, _) = Value::from_raw(reclen).unwrap();
            let narrow = Value::unsigned(value.as_unsigned().unwrap()[0])
                .encode(&FieldProto::unsigned("RECLEN", 2))
                .unwrap();
            block.fields.retain(|f| f.name != "RECLEN" && f.name != "HPHASE");
            block.fields.insert(0, narrow);
            block.fields.push(
                Value::unsigned(7)
                    .encode(&FieldProto::unsigned("LEGACY", 4))
                    .unwrap(),
            );
        }
        let end = blocks.len() - 1;
        blocks.insert(
            end,
            RawBlock {
                name: "FUTURE".to_string(),
                fields: vec![RawField {
                    name: "WHATEVER".to_string(),
                    code: 42,
                    scale: 0,
                    elen: 1,
                    count: 3,
                    payload: vec![1u8, 2, 3].into(),
                }],
            },
        );
    });

    let mut restored = model(spec());
    Restorer::default()
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();
    assert_restored(&restored, 9);
}

#[test]
fn newer_schema_versions_decode_old_blocks() {
    let bytes = saved(1);
    let newer = BlockKind::Cells
        .schema()
        .clone()
        .with_field(FieldProto::unsigned("RECLEN", 8).required())
        .unwrap()
        .with_field(FieldProto::signed("NEWFLD", 4))
        .unwrap();
    let mut reader = BlockReader::open(IoSource::new(&bytes[..])).unwrap();
    let mut decoded = None;
    while let Some(block) = reader.next_block().unwrap() {
        if block.name == "CELLS" {
            decoded = Some(decode_block(&block, &newer).unwrap().unsigned("RECLEN"));
            break;
        }
    }
    let pyr = model(spec()).layout().regions()[0].cells()[0].record_length();
    assert_eq!(decoded, Some(Some(u64::from(pyr))));
}

#[test]
fn incompatible_population_is_rejected() {
    let bytes = saved(2);
    let mut changed = spec();
    changed.regions[0].cells[0].count = 6;

    let mut restored = model(changed.clone());
    let err = Restorer::default()
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap_err();
    assert!(matches!(err, CellstoreError::Unmatched(..)));

    // with generation allowed the population and its connections start fresh
    let mut restored = model(changed);
    let options = RestoreOptions::default().with_allow_generate(true);
    let report = Restorer::new(options)
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();
    assert_eq!(report.status(EntityId::Cells(0, 0)), Some(RestoreStatus::Generate));
    assert_eq!(report.status(EntityId::Conns(0, 0, 2)), Some(RestoreStatus::Generate));
    assert!(report.status(EntityId::Cells(0, 1)).unwrap().is_bound());
    assert_eq!(report.generated().count(), 4);
    assert!(restored.cells(0, 0).unwrap().records().iter().all(|&b| b == 0));
    assert!(restored.cells(0, 1).unwrap().records().iter().any(|&b| b != 0));
}

#[test]
fn pinned_file_disagreement_is_fatal() {
    let bytes = saved(2);
    let mut changed = spec();
    changed.regions[0].cells[1].count = 8;
    let mut restored = model(changed);
    let options = RestoreOptions::default()
        .with_allow_generate(true)
        .with_pin(EntityId::Cells(0, 1), Pin::file(0))
        .unwrap();
    let err = Restorer::new(options)
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap_err();
    assert!(err.to_string().contains("COUNT"));
}

#[test]
fn pin_to_a_missing_file_is_rejected() {
    let bytes = saved(2);
    let mut restored = model(spec());
    let options = RestoreOptions::default()
        .with_pin(EntityId::Cells(0, 1), Pin::file(1))
        .unwrap();
    assert!(
        Restorer::new(options)
            .restore(vec![IoSource::new(&bytes[..])], &mut restored)
            .is_err()
    );
}

#[test]
fn wildcard_connections_bind_in_encounter_order() {
    let bytes = saved(4);
    for _ in 0..2 {
        let mut restored = model(spec());
        let report = Restorer::default()
            .restore(vec![IoSource::new(&bytes[..])], &mut restored)
            .unwrap();
        for k in 0..3 {
            assert_eq!(
                report.status(EntityId::Conns(0, 0, k)),
                Some(RestoreStatus::Bound {
                    file: 0,
                    ordinal: k as u32
                })
            );
        }
        assert_restored(&restored, 4);
    }
}

#[test]
fn pinned_ordinal_takes_its_block_first() {
    let bytes = saved(6);
    let mut restored = model(spec());
    let options = RestoreOptions::default()
        .with_pin(EntityId::Conns(0, 0, 0), Pin::file(0).with_ordinal(2))
        .unwrap();
    let report = Restorer::new(options)
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();
    let ordinals: Vec<Option<RestoreStatus>> = (0..3)
        .map(|k| report.status(EntityId::Conns(0, 0, k)))
        .collect();
    assert_eq!(
        ordinals,
        [
            Some(RestoreStatus::Bound { file: 0, ordinal: 2 }),
            Some(RestoreStatus::Bound { file: 0, ordinal: 0 }),
            Some(RestoreStatus::Bound { file: 0, ordinal: 1 }),
        ]
    );

    // connection type 0 now holds what type 2 held when saved
    let layout = &restored.layout().regions()[0].cells()[0];
    let (first, last) = (&layout.conns()[0], &layout.conns()[2]);
    let len = first.per_conn().restorable_length() as usize;
    let pyr = restored.cells(0, 0).unwrap();
    for element in pyr.range() {
        let record = pyr.record(element).unwrap();
        for j in 0..first.count() {
            let live = (first.offset_in_cell() + j * first.stride()) as usize;
            let saved = (last.offset_in_cell() + j * last.stride()) as usize;
            for i in 0..len {
                assert_eq!(record[live + i], pattern(6, 0, 0, element, saved + i));
            }
        }
    }
}

#[test]
fn pinned_ordinal_beats_earlier_wildcards() {
    let bytes = saved(6);
    let mut restored = model(spec());
    let options = RestoreOptions::default()
        .with_pin(EntityId::Conns(0, 0, 2), Pin::file(0).with_ordinal(0))
        .unwrap();
    let report = Restorer::new(options)
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();
    let ordinals: Vec<Option<RestoreStatus>> = (0..3)
        .map(|k| report.status(EntityId::Conns(0, 0, k)))
        .collect();
    assert_eq!(
        ordinals,
        [
            Some(RestoreStatus::Bound { file: 0, ordinal: 1 }),
            Some(RestoreStatus::Bound { file: 0, ordinal: 2 }),
            Some(RestoreStatus::Bound { file: 0, ordinal: 0 }),
        ]
    );
}

#[test]
fn population_disagreeing_with_every_candidate_is_unmatched() {
    // two pyr blocks: one stores COUNT as a two element array, the other a different count
    let bytes = rewrite(&saved(2), |blocks| {
        let pyr = blocks.iter().position(|b| b.name == "CELLS").unwrap();
        let mut as_array = blocks[pyr].clone();
        let mut other_count = blocks[pyr].clone();
        for field in as_array.fields.iter_mut().filter(|f| f.name == names::COUNT) {
            *field = RawField {
                name: names::COUNT.to_string(),
                code: WireType::Unsigned.code(),
                scale: 0,
                elen: 4,
                count: 2,
                payload: vec![5u8, 0, 0, 0, 5, 0, 0, 0].into(),
            };
        }
        let proto = BlockKind::Cells.schema().field(names::COUNT).unwrap();
        for field in other_count.fields.iter_mut().filter(|f| f.name == names::COUNT) {
            *field = Value::unsigned(7).encode(proto).unwrap();
        }
        blocks[pyr] = as_array;
        blocks.insert(pyr + 1, other_count);
    });
    assert_eq!(
        inspect(IoSource::new(&bytes[..])).unwrap().blocks_named("CELLS").count(),
        3
    );

    let mut restored = model(spec());
    let err = Restorer::default()
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap_err();
    assert!(matches!(err, CellstoreError::Unmatched(..)));

    let mut restored = model(spec());
    let options = RestoreOptions::default().with_allow_generate(true);
    let report = Restorer::new(options)
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();
    assert_eq!(report.status(EntityId::Cells(0, 0)), Some(RestoreStatus::Generate));
    assert_eq!(report.generated().count(), 4);
    assert!(report.status(EntityId::Cells(0, 1)).unwrap().is_bound());
}

#[test]
fn populations_come_from_later_files() {
    // file 0 only knows the interneurons, file 1 the whole model
    let mut partial = spec();
    partial.regions[0].cells.remove(0);
    let mut first = model(partial);
    fill(&mut first, 20);
    let first = SaveWriter::default().write(Vec::new(), &first).unwrap();
    let second = saved(21);

    let mut restored = model(spec());
    let report = Restorer::default()
        .restore(
            vec![IoSource::new(&first[..]), IoSource::new(&second[..])],
            &mut restored,
        )
        .unwrap();
    assert_eq!(
        report.status(EntityId::Cells(0, 0)),
        Some(RestoreStatus::Bound { file: 1, ordinal: 0 })
    );
    assert_eq!(
        report.status(EntityId::Conns(0, 0, 1)),
        Some(RestoreStatus::Bound { file: 1, ordinal: 1 })
    );
    assert_eq!(
        report.status(EntityId::Cells(0, 1)),
        Some(RestoreStatus::Bound { file: 0, ordinal: 0 })
    );
    let inh = restored.cells(0, 1).unwrap();
    assert_eq!(inh.record(0).unwrap()[0], pattern(20, 0, 0, 0, 0));
    let pyr = restored.cells(0, 0).unwrap();
    assert_eq!(pyr.record(0).unwrap()[0], pattern(21, 0, 0, 0, 0));
}

#[test]
fn history_is_transcoded_on_restore() {
    let bytes = saved(5);
    let mut wider = spec();
    wider.options.wide_history = true;
    wider.regions[0].cells[0].history_depth = 4;
    let mut restored = model(wider);
    Restorer::default()
        .restore(vec![IoSource::new(&bytes[..])], &mut restored)
        .unwrap();

    let pyr = restored.cells(0, 0).unwrap();
    for element in pyr.range() {
        let history = pyr.history(element).unwrap();
        let values: Vec<i16> = history
            .chunks_exact(2)
            .map(|e| i16::from_le_bytes([e[0], e[1]]))
            .collect();
        let expected: Vec<i16> = (0..3)
            .map(|i| i16::from((element as u8 + i) & 0x3f) << 7)
            .chain([0])
            .collect();
        assert_eq!(values, expected);
    }
}

#[test]
fn header_values_round_trip_against_their_prototype() {
    let schema = Schema::try_new(
        BlockKind::End,
        vec![
            FieldProto::unsigned("A", 4).required(),
            FieldProto::new("B", WireType::Bytes, 1, 3),
        ],
    )
    .unwrap();
    let header = crate::HeaderInstance::new(&schema)
        .with("A", Value::unsigned(0x1122_3344))
        .unwrap()
        .with("B", Value::Bytes(vec![1, 2, 3]))
        .unwrap();
    let encoded = header.encode().unwrap().encode().unwrap();
    let raw = RawBlock::read(&mut IoSource::new(&encoded[..])).unwrap();
    let decoded = decode_block(&raw, &schema).unwrap();
    assert_eq!(decoded.unsigned("A"), Some(0x1122_3344));
    assert_eq!(decoded.get("B"), Some(&Value::Bytes(vec![1, 2, 3])));
}

#[test]
fn distributed_save_and_restore() {
    let nodes = 3;
    let partition = Partition::new(nodes);
    let part = |node| {
        let mut live =
            LiveModel::for_node(spec(), FieldCatalog::standard(), partition, node).unwrap();
        fill(&mut live, 8);
        live
    };

    let mut mesh = LocalMesh::new(nodes).into_iter();
    let mut coordinator = mesh.next().unwrap();
    let bytes = thread::scope(|s| {
        for (node, mut channel) in (1..nodes).zip(mesh) {
            let live = part(node);
            s.spawn(move || SaveWriter::default().write_worker(&live, &mut channel).unwrap());
        }
        SaveWriter::default()
            .write_coordinator(Vec::new(), &part(0), &mut coordinator)
            .unwrap()
    });

    // the payload does not depend on how the model was distributed
    let single = saved(8);
    let start = SaveLayout::new(&model(spec())).unwrap().data_start() as usize;
    assert_eq!(bytes.len(), single.len());
    assert_eq!(bytes[start..], single[start..]);

    let mut mesh = LocalMesh::new(nodes).into_iter();
    let mut coordinator = mesh.next().unwrap();
    let fresh = |node| LiveModel::for_node(spec(), FieldCatalog::standard(), partition, node).unwrap();
    let restored = thread::scope(|s| {
        let workers: Vec<_> = (1..nodes)
            .zip(mesh)
            .map(|(node, mut channel)| {
                let mut live = fresh(node);
                s.spawn(move || {
                    Restorer::default().restore_worker(&mut live, &mut channel).unwrap();
                    live
                })
            })
            .collect();
        let mut live = fresh(0);
        Restorer::default()
            .restore_coordinator(vec![IoSource::new(&bytes[..])], &mut live, &mut coordinator)
            .unwrap();
        let mut restored = vec![live];
        restored.extend(workers.into_iter().map(|w| w.join().unwrap()));
        restored
    });
    for live in &restored {
        assert_restored(live, 8);
    }
}

#[test]
fn workers_learn_about_a_failed_restore() {
    let mut mesh = LocalMesh::new(2).into_iter();
    let mut coordinator = mesh.next().unwrap();
    let mut worker = mesh.next().unwrap();
    let partition = Partition::new(2);
    let fresh = |node| LiveModel::for_node(spec(), FieldCatalog::standard(), partition, node).unwrap();
    thread::scope(|s| {
        let handle = s.spawn(move || {
            let mut live = fresh(1);
            Restorer::default().restore_worker(&mut live, &mut worker)
        });
        let mut live = fresh(0);
        let files: Vec<IoSource<&[u8]>> = Vec::new();
        assert!(
            Restorer::default()
                .restore_coordinator(files, &mut live, &mut coordinator)
                .is_err()
        );
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("no save files"));
    });
}
