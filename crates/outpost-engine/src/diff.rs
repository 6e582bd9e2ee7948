use std::collections::HashSet;

use outpost_core::{EntityMarker, MarkerId, MarkerKind, Snapshot};

/// Set partition of one marker kind between two snapshots. An id present in
/// both is always `updated`.
#[derive(Debug, Default)]
pub(crate) struct Partition<'p, 'c> {
    pub created: Vec<&'c EntityMarker>,
    pub removed: Vec<&'p EntityMarker>,
    pub updated: Vec<&'c EntityMarker>,
}

pub(crate) fn diff<'p, 'c>(
    previous: &'p Snapshot,
    current: &'c Snapshot,
    kind: MarkerKind,
) -> Partition<'p, 'c> {
    let before: HashSet<MarkerId> = previous.markers_of(kind).map(|m| m.id).collect();
    let after: HashSet<MarkerId> = current.markers_of(kind).map(|m| m.id).collect();

    let mut partition = Partition::default();
    for marker in current.markers_of(kind) {
        if before.contains(&marker.id) {
            partition.updated.push(marker);
        } else {
            partition.created.push(marker);
        }
    }
    partition.removed = previous
        .markers_of(kind)
        .filter(|m| !after.contains(&m.id))
        .collect();
    partition
}
