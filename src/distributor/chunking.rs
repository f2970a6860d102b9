//! Chunk planning and offset-based reassembly.

use std::ops::Range;

use serde::Serialize;
use tracing::warn;

use crate::error::EngineError;
use crate::kernel::OperationKind;

/// One slice of a job, in compute-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub unit_offset: usize,
    pub units: usize,
}

impl ChunkSpec {
    /// Range of scalar values covered by this chunk.
    pub fn values(&self, width: usize) -> Range<usize> {
        let start = self.unit_offset * width;
        start..start + self.units * width
    }
}

/// Split `total_units` into at least `chunk_count` chunks of at most
/// `max_units` each. Sizes differ by at most one unit and the chunks cover
/// `0..total_units` in order without gap or overlap.
pub fn plan_chunks(total_units: usize, chunk_count: usize, max_units: usize) -> Vec<ChunkSpec> {
    if total_units == 0 {
        return Vec::new();
    }
    let cap = max_units.max(1);
    let count = chunk_count
        .max(1)
        .max(total_units.div_ceil(cap))
        .min(total_units);

    let base = total_units / count;
    let extra = total_units % count;
    let mut offset = 0;
    (0..count)
        .map(|index| {
            let units = base + usize::from(index < extra);
            let spec = ChunkSpec {
                index,
                unit_offset: offset,
                units,
            };
            offset += units;
            spec
        })
        .collect()
}

/// What happened to one chunk result during reassembly.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Filled its slot exactly.
    Complete,
    /// Shorter than its slot; the tail keeps the input values.
    Short { got: usize, capacity: usize },
    /// Longer than its slot; written up to the slot end.
    Truncated(EngineError),
    /// Empty, misaligned, or outside the buffer; nothing written.
    Skipped { got: usize },
}

/// Write one chunk result into `output` at the chunk's recorded offset.
pub fn place(output: &mut [f32], op: OperationKind, spec: &ChunkSpec, data: &[f32]) -> Placement {
    let width = op.record_width();
    let range = spec.values(width);
    let (offset, capacity) = (range.start, range.len());

    if data.is_empty() || data.len() % width != 0 {
        return Placement::Skipped { got: data.len() };
    }
    let Some(slot) = output.get_mut(range) else {
        return Placement::Skipped { got: data.len() };
    };

    if data.len() > capacity {
        slot.copy_from_slice(&data[..capacity]);
        return Placement::Truncated(EngineError::BoundsViolation {
            offset,
            capacity,
            got: data.len(),
        });
    }
    slot[..data.len()].copy_from_slice(data);
    if data.len() < capacity {
        Placement::Short {
            got: data.len(),
            capacity,
        }
    } else {
        Placement::Complete
    }
}

/// Result buffer plus counts of chunks that did not fit cleanly.
#[derive(Debug)]
pub struct Reassembly {
    pub data: Vec<f32>,
    pub truncated: usize,
    pub skipped: usize,
}

/// Build the output buffer from a copy of `input` and the chunk results,
/// in whatever order they completed.
pub fn reassemble<I>(input: &[f32], op: OperationKind, results: I) -> Reassembly
where
    I: IntoIterator<Item = (ChunkSpec, Vec<f32>)>,
{
    let mut out = Reassembly {
        data: input.to_vec(),
        truncated: 0,
        skipped: 0,
    };
    for (spec, data) in results {
        match place(&mut out.data, op, &spec, &data) {
            Placement::Complete => {}
            Placement::Short { got, capacity } => {
                warn!(chunk = spec.index, got, capacity, "short chunk result, keeping input tail");
            }
            Placement::Truncated(e) => {
                warn!(chunk = spec.index, error = %e, "chunk result truncated");
                out.truncated += 1;
            }
            Placement::Skipped { got } => {
                warn!(chunk = spec.index, got, "malformed chunk result skipped");
                out.skipped += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(plan: &[ChunkSpec], total: usize) {
        let mut next = 0;
        for spec in plan {
            assert_eq!(spec.unit_offset, next, "gap or overlap at chunk {}", spec.index);
            next += spec.units;
        }
        assert_eq!(next, total);
        let min = plan.iter().map(|c| c.units).min().unwrap();
        let max = plan.iter().map(|c| c.units).max().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_even_split_across_workers() {
        let plan = plan_chunks(40_000, 4, 15_000);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|c| c.units == 10_000));
        assert_partition(&plan, 40_000);
    }

    #[test]
    fn test_cap_adds_chunks() {
        let plan = plan_chunks(100_000, 4, 15_000);
        assert_eq!(plan.len(), 7);
        assert!(plan.iter().all(|c| c.units <= 15_000));
        assert_partition(&plan, 100_000);
    }

    #[test]
    fn test_uneven_split_differs_by_one() {
        let plan = plan_chunks(20_003, 3, 15_000);
        let sizes: Vec<usize> = plan.iter().map(|c| c.units).collect();
        assert_eq!(sizes, vec![6_668, 6_668, 6_667]);
        assert_partition(&plan, 20_003);
    }

    #[test]
    fn test_never_more_chunks_than_units() {
        let plan = plan_chunks(2, 4, 15_000);
        assert_eq!(plan.len(), 2);
        assert!(plan_chunks(0, 4, 15_000).is_empty());
    }

    #[test]
    fn test_reassembly_is_order_independent() {
        let op = OperationKind::Transform;
        let input: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let plan = plan_chunks(12, 3, 100);
        let results: Vec<(ChunkSpec, Vec<f32>)> = plan
            .iter()
            .map(|spec| {
                let doubled = input[spec.values(4)].iter().map(|v| v * 2.0).collect();
                (*spec, doubled)
            })
            .collect();

        let forward = reassemble(&input, op, results.clone()).data;
        let backward = reassemble(&input, op, results.into_iter().rev()).data;
        assert_eq!(forward, backward);
        assert_eq!(forward, input.iter().map(|v| v * 2.0).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_result_is_truncated() {
        let op = OperationKind::Transform;
        let input = vec![0.0f32; 16];
        let spec = ChunkSpec {
            index: 1,
            unit_offset: 2,
            units: 2,
        };
        let out = reassemble(&input, op, vec![(spec, vec![1.0; 12])]);

        assert_eq!(out.truncated, 1);
        assert_eq!(&out.data[..8], &[0.0; 8]);
        assert_eq!(&out.data[8..], &[1.0; 8]);
    }

    #[test]
    fn test_malformed_result_leaves_input() {
        let op = OperationKind::Particles;
        let input = vec![3.0f32; 20];
        let spec = ChunkSpec {
            index: 0,
            unit_offset: 0,
            units: 1,
        };
        let out = reassemble(&input, op, vec![(spec, vec![]), (spec, vec![9.0; 7])]);
        assert_eq!(out.skipped, 2);
        assert_eq!(out.data, input);
    }

    #[test]
    fn test_short_result_keeps_tail() {
        let op = OperationKind::Transform;
        let input = vec![5.0f32; 8];
        let spec = ChunkSpec {
            index: 0,
            unit_offset: 0,
            units: 2,
        };
        assert_eq!(
            place(&mut input.clone(), op, &spec, &[1.0; 4]),
            Placement::Short { got: 4, capacity: 8 }
        );
        let out = reassemble(&input, op, vec![(spec, vec![1.0; 4])]);
        assert_eq!(out.data, vec![1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0]);
    }
}
