//! Point enumeration and diffing. The enumerator owns the flattened
//! view of a `DimensionSpace` (active order plus value lists) and is
//! pure: building the Cartesian product, computing which dimensions
//! changed between two consecutive points, and widening a diff to the
//! marker dimension are all stateless computations over that view.

use itertools::Itertools;

use crate::dimension::{DimValue, DimensionName, DimensionSpace};

/// One fully-specified combination of values, one per active
/// dimension, positionally aligned to the active order. Immutable
/// once produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Point {
    values: Vec<DimValue>,
}

impl Point {
    fn new(values: Vec<DimValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[DimValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&DimValue> {
        self.values.get(index)
    }

    /// The stable string form used as the measurement key and in log
    /// messages, e.g. `"h1,512,lvm"`. The zero-dimension point
    /// renders as the empty string.
    pub fn coordinate_string(&self) -> String {
        self.values.iter().join(",")
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.coordinate_string())
    }
}

/// One dimension's change between two consecutive points. `prev`
/// absent means the dimension is being entered (first point); `next`
/// absent means it is being exited (teardown after the last point).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateDiff {
    pub name: DimensionName,
    /// Position in the active order.
    pub index: usize,
    pub prev: Option<DimValue>,
    pub next: Option<DimValue>,
}

#[derive(Debug, Clone)]
pub struct PointEnumerator {
    order: Vec<DimensionName>,
    values: Vec<Vec<DimValue>>,
    marker_index: Option<usize>,
}

impl PointEnumerator {
    pub fn from_space(space: &DimensionSpace) -> Self {
        let order = space.active_order();
        let values = space
            .active()
            .map(|dimension| dimension.values.clone())
            .collect();
        let marker_index =
            space.marker().and_then(|marker| order.iter().position(|name| name == marker));
        Self {
            order,
            values,
            marker_index,
        }
    }

    pub fn active_order(&self) -> &[DimensionName] {
        &self.order
    }

    pub fn index_of(&self, name: &DimensionName) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    /// Every point of the Cartesian product. The dimension listed
    /// last varies fastest (innermost loop), the one listed first
    /// slowest, so that an expensive-to-change dimension declared
    /// first toggles as rarely as possible over the whole run. Zero
    /// active dimensions yield exactly one empty point (the identity
    /// element of the product), never an empty list.
    pub fn points(&self) -> Vec<Point> {
        if self.values.is_empty() {
            return vec![Point::new(Vec::new())];
        }
        self.values
            .iter()
            .map(|values| values.iter().cloned())
            .multi_cartesian_product()
            .map(Point::new)
            .collect()
    }

    /// The diff list for the very first point: one "entering" entry
    /// per active dimension, in active-order position order.
    pub fn entering(&self, point: &Point) -> Vec<CoordinateDiff> {
        self.order
            .iter()
            .zip(point.values())
            .enumerate()
            .map(|(index, (name, value))| CoordinateDiff {
                name: name.clone(),
                index,
                prev: None,
                next: Some(value.clone()),
            })
            .collect()
    }

    /// The diff list for the teardown pass after the very last point:
    /// one "exiting" entry per active dimension, in *reverse* active
    /// order so the innermost dimension is torn down first.
    pub fn exiting(&self, point: &Point) -> Vec<CoordinateDiff> {
        let mut diffs = self.entering(point);
        for diff in &mut diffs {
            std::mem::swap(&mut diff.prev, &mut diff.next);
        }
        diffs.reverse();
        diffs
    }

    /// Entries for exactly those dimensions whose value differs
    /// between `prev` and `next`, in active-order position order.
    pub fn diff(&self, prev: &Point, next: &Point) -> Vec<CoordinateDiff> {
        self.order
            .iter()
            .zip(prev.values().iter().zip(next.values()))
            .enumerate()
            .filter(|(_, (_, (prev_value, next_value)))| prev_value != next_value)
            .map(|(index, (name, (prev_value, next_value)))| CoordinateDiff {
                name: name.clone(),
                index,
                prev: Some(prev_value.clone()),
                next: Some(next_value.clone()),
            })
            .collect()
    }

    /// If anything logically underneath the marker dimension changed,
    /// (re-)announce the marker dimension too, even though its own
    /// value did not change: downstream state depends on it. A
    /// synthetic entry carrying `(prev[m], next[m])` is inserted
    /// immediately before the first entry whose index exceeds the
    /// marker's. No-op when no marker is configured, when nothing to
    /// the right of the marker changed, or when the marker itself
    /// already appears in the diff list (which also makes this
    /// idempotent).
    pub fn widen_to_leftmost_changed(
        &self,
        mut diffs: Vec<CoordinateDiff>,
        prev: &Point,
        next: &Point,
    ) -> Vec<CoordinateDiff> {
        let Some(marker_index) = self.marker_index else {
            return diffs;
        };
        let Some(max_index) = diffs.iter().map(|diff| diff.index).max() else {
            return diffs;
        };
        if max_index <= marker_index {
            return diffs;
        }
        if diffs.iter().any(|diff| diff.index == marker_index) {
            return diffs;
        }
        let Some(position) = diffs.iter().position(|diff| diff.index > marker_index) else {
            return diffs;
        };
        let (Some(prev_value), Some(next_value)) = (prev.get(marker_index), next.get(marker_index))
        else {
            return diffs;
        };
        diffs.insert(
            position,
            CoordinateDiff {
                name: self.order[marker_index].clone(),
                index: marker_index,
                prev: Some(prev_value.clone()),
                next: Some(next_value.clone()),
            },
        );
        diffs
    }
}
