/// Position reordering for ordered sibling collections.
///
/// Moves re-rank the whole collection: after removing the entity at the
/// source index and inserting it at the destination, every member gets its
/// rank (0, 1, 2, ...) as position. This rewrites all siblings on every move
/// but can never produce two siblings with the same position.
use crate::types::Entity;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PositionError {
    #[error("Source index {index} out of range (len {len})")]
    SourceOutOfRange { index: usize, len: usize },
}

/// New position for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub id: String,
    pub position: f64,
}

/// Result of a move: the moved entity's new position and the full re-ranked
/// order of every collection the move touched.
#[derive(Debug, Clone, PartialEq)]
pub struct MovePlan {
    pub moved_id: String,
    pub position: f64,
    /// Rank positions for the destination collection, in display order.
    pub destination: Vec<PositionUpdate>,
    /// Rank positions for the source collection after removal. Empty for
    /// moves within one collection.
    pub source: Vec<PositionUpdate>,
}

impl MovePlan {
    /// All position updates, source first.
    pub fn updates(&self) -> impl Iterator<Item = &PositionUpdate> {
        self.source.iter().chain(self.destination.iter())
    }
}

fn rank(ids: &[String]) -> Vec<PositionUpdate> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| PositionUpdate {
            id: id.clone(),
            position: i as f64,
        })
        .collect()
}

/// Reorder within one collection. `siblings` must be sorted by position.
///
/// Destination indices past the end clamp to the end. Moving to the same
/// index is a no-op that still returns a (rank-normalised) plan.
pub fn compute_positions(
    siblings: &[&Entity],
    source_index: usize,
    destination_index: usize,
) -> Result<MovePlan, PositionError> {
    if source_index >= siblings.len() {
        return Err(PositionError::SourceOutOfRange {
            index: source_index,
            len: siblings.len(),
        });
    }

    let mut ids: Vec<String> = siblings.iter().map(|e| e.id.clone()).collect();
    let moved = ids.remove(source_index);
    let dest = destination_index.min(ids.len());
    ids.insert(dest, moved.clone());

    Ok(MovePlan {
        moved_id: moved,
        position: dest as f64,
        destination: rank(&ids),
        source: Vec::new(),
    })
}

/// Move from one collection into another. Both slices must be sorted by position.
pub fn compute_transfer(
    source: &[&Entity],
    destination: &[&Entity],
    source_index: usize,
    destination_index: usize,
) -> Result<MovePlan, PositionError> {
    if source_index >= source.len() {
        return Err(PositionError::SourceOutOfRange {
            index: source_index,
            len: source.len(),
        });
    }

    let mut source_ids: Vec<String> = source.iter().map(|e| e.id.clone()).collect();
    let moved = source_ids.remove(source_index);

    let mut dest_ids: Vec<String> = destination
        .iter()
        .map(|e| e.id.clone())
        .filter(|id| *id != moved)
        .collect();
    let dest = destination_index.min(dest_ids.len());
    dest_ids.insert(dest, moved.clone());

    Ok(MovePlan {
        moved_id: moved,
        position: dest as f64,
        destination: rank(&dest_ids),
        source: rank(&source_ids),
    })
}

/// Position for a new entity appended to the end of a collection.
pub fn append_position(siblings: &[&Entity]) -> f64 {
    siblings
        .iter()
        .map(|e| e.position)
        .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
        .map_or(0.0, |max| max.floor() + 1.0)
}

/// True when every position is distinct and the sequence is strictly increasing.
pub fn has_distinct_order(positions: &[f64]) -> bool {
    positions.windows(2).all(|w| w[0] < w[1])
}
