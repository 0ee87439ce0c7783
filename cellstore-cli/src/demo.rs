use cellstore::error::CellstoreResult;
use cellstore::file::{GlobalState, LiveModel, PopulationState};

/// Time step of the demo run: 1 ms with 20 fraction bits.
const DEMO_TIME_STEP: i32 = 1049;

/// Fill the part of `model` this node holds with data derived from `seed` and the element
/// index, so every node of a distributed run produces its share of the same model.
pub fn fill(model: &mut LiveModel, seed: i32) -> CellstoreResult<()> {
    model.global = GlobalState {
        seeds: [seed, seed.rotate_left(16)],
        time_step: DEMO_TIME_STEP,
    };
    let populations: Vec<(usize, usize)> = model.populations().map(|(r, c, _)| (r, c)).collect();
    for (r, c) in populations {
        let cells = model.cells_mut(r, c)?;
        let salt = seed.to_le_bytes()[0] ^ byte(r * 16 + c);
        cells.state = PopulationState {
            seeds: [seed.wrapping_add(1), seed.wrapping_sub(1)],
            autoscale: 1 << 16,
        };
        for (k, conn) in cells.conns.iter_mut().enumerate() {
            conn.seeds = [seed ^ i32::from(byte(k)), seed];
        }
        for element in cells.range() {
            let base = salt ^ element.to_le_bytes()[0];
            for (i, b) in cells.record_mut(element)?.iter_mut().enumerate() {
                *b = base.wrapping_add(byte(i));
            }
            for (i, b) in cells.history_mut(element)?.iter_mut().enumerate() {
                *b = base.wrapping_mul(byte(i)) & 0x7f;
            }
        }
    }
    Ok(())
}

fn byte(value: usize) -> u8 {
    value.to_le_bytes()[0]
}

#[cfg(test)]
mod tests {
    use cellstore::io::Partition;
    use cellstore::{CellSpec, FieldCatalog, ModelSpec, RegionSpec};

    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            options: Default::default(),
            regions: vec![RegionSpec {
                name: "v1".to_string(),
                cells: vec![CellSpec {
                    name: "pyr".to_string(),
                    count: 7,
                    fields: ["IZVU"].into_iter().collect(),
                    history_depth: 2,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn nodes_fill_their_share_of_one_model() {
        let mut whole = LiveModel::new(spec(), FieldCatalog::standard()).unwrap();
        fill(&mut whole, 42).unwrap();
        let partition = Partition::new(3);
        for node in 0..3 {
            let mut part =
                LiveModel::for_node(spec(), FieldCatalog::standard(), partition, node).unwrap();
            fill(&mut part, 42).unwrap();
            let cells = part.cells(0, 0).unwrap();
            for element in cells.range() {
                assert_eq!(
                    cells.record(element).unwrap(),
                    whole.cells(0, 0).unwrap().record(element).unwrap()
                );
            }
        }
    }
}
