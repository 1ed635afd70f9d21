//! Deterministic merging of per-replica results.

use data_types::ReplicaAddr;
use std::{cmp::Ordering, collections::BinaryHeap};
use store_client::StreamedSeries;

struct HeapEntry {
    series: StreamedSeries,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we pop the smallest labels
        // first, source index as tie-breaker
        other
            .series
            .labels
            .cmp(&self.series.labels)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merge the series collected from each replica into one sorted sequence.
///
/// Replication means the same label set may arrive from several replicas;
/// equal label sets are collapsed into one series whose chunks are the
/// concatenation of every source's chunks. Chunks are passed through
/// untouched, sample-level dedup happens downstream.
///
/// The output is a pure function of the input sets: sources are ordered by
/// replica address and each source is stable-sorted by labels before the
/// k-way merge, so replica latency cannot change the result.
pub fn merge_series(per_replica: Vec<(ReplicaAddr, Vec<StreamedSeries>)>) -> Vec<StreamedSeries> {
    let mut per_replica = per_replica;
    per_replica.sort_by(|a, b| a.0.cmp(&b.0));

    let mut sources: Vec<std::vec::IntoIter<StreamedSeries>> = per_replica
        .into_iter()
        .map(|(_, mut series)| {
            series.sort_by(|a, b| a.labels.cmp(&b.labels));
            series.into_iter()
        })
        .collect();

    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, iter) in sources.iter_mut().enumerate() {
        if let Some(series) = iter.next() {
            heap.push(HeapEntry { series, source });
        }
    }

    let mut merged: Vec<StreamedSeries> = vec![];
    while let Some(HeapEntry { series, source }) = heap.pop() {
        if let Some(next) = sources[source].next() {
            heap.push(HeapEntry {
                series: next,
                source,
            });
        }

        match merged.last_mut() {
            Some(last) if last.labels == series.labels => last.chunks.extend(series.chunks),
            _ => merged.push(series),
        }
    }
    merged
}

/// Sorted-unique union of per-replica string sets (label names or values).
pub fn merge_string_sets(per_replica: Vec<Vec<String>>) -> Vec<String> {
    let mut merged: Vec<String> = per_replica.into_iter().flatten().collect();
    merged.sort();
    merged.dedup();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use store_client::mock::{chunk, series_frame};
    use store_client::SeriesFrame;

    fn series(labels: &[(&str, &str)], chunks: Vec<store_client::SeriesChunk>) -> StreamedSeries {
        match series_frame(labels, chunks) {
            SeriesFrame::Series(s) => s,
            _ => unreachable!(),
        }
    }

    fn addr(s: &str) -> ReplicaAddr {
        ReplicaAddr::new(s)
    }

    #[test]
    fn merges_sorted_with_duplicates_collapsed() {
        let r1 = vec![
            series(&[("job", "api")], vec![chunk(0, 10, b"a")]),
            series(&[("job", "web")], vec![chunk(0, 10, b"b")]),
        ];
        let r2 = vec![series(&[("job", "api")], vec![chunk(10, 20, b"c")])];

        let merged = merge_series(vec![(addr("sg-1"), r1), (addr("sg-2"), r2)]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].labels.get("job"), Some("api"));
        assert_eq!(
            merged[0]
                .chunks
                .iter()
                .map(|c| c.raw.as_ref())
                .collect::<Vec<_>>(),
            vec![b"a".as_slice(), b"c".as_slice()]
        );
        assert_eq!(merged[1].labels.get("job"), Some("web"));
    }

    #[test]
    fn output_is_independent_of_replica_arrival_order() {
        let r1 = vec![
            series(&[("job", "api")], vec![chunk(0, 10, b"a")]),
            series(&[("job", "db")], vec![chunk(0, 10, b"d")]),
        ];
        let r2 = vec![series(&[("job", "api")], vec![chunk(10, 20, b"c")])];

        let forward = merge_series(vec![
            (addr("sg-1"), r1.clone()),
            (addr("sg-2"), r2.clone()),
        ]);
        let backward = merge_series(vec![(addr("sg-2"), r2), (addr("sg-1"), r1)]);

        assert_eq!(forward, backward);
    }

    #[test]
    fn unsorted_replica_streams_are_sorted_first() {
        let r1 = vec![
            series(&[("job", "web")], vec![chunk(0, 10, b"b")]),
            series(&[("job", "api")], vec![chunk(0, 10, b"a")]),
        ];

        let merged = merge_series(vec![(addr("sg-1"), r1)]);
        assert_eq!(merged[0].labels.get("job"), Some("api"));
        assert_eq!(merged[1].labels.get("job"), Some("web"));
    }

    #[test]
    fn empty_input() {
        assert!(merge_series(vec![]).is_empty());
        assert!(merge_series(vec![(addr("sg-1"), vec![])]).is_empty());
    }

    #[test]
    fn string_sets_union_sorted_unique() {
        let merged = merge_string_sets(vec![
            vec!["job".to_string(), "instance".to_string()],
            vec!["job".to_string(), "az".to_string()],
        ]);
        assert_eq!(merged, vec!["az", "instance", "job"]);
    }
}
