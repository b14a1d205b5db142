//! The view/condition model.
//!
//! A [TraceViewSet] abstracts who holds valid data: a mapping from instance
//! view to equivalence set to field mask. Two such sets form a template's
//! pre- and post-conditions; replayability is a subsumption question between
//! them. A [TraceConditionSet] layers the runtime checks on top: making the
//! set ready against the forest, requiring it as a precondition and ensuring
//! it as a postcondition.

use crate::forest::{EqSetId, RegionForest, ViewId};
use crate::mask::FieldMask;
use std::collections::BTreeMap;
use std::fmt;

/// A set of (view, equivalence set, field mask) triples.
#[derive(Clone, Debug, Default)]
pub struct TraceViewSet {
    conditions: BTreeMap<ViewId, BTreeMap<EqSetId, FieldMask>>,
}

impl TraceViewSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `mask` into the entry for `(view, eq)`.
    pub fn insert(&mut self, view: ViewId, eq: EqSetId, mask: &FieldMask) {
        if mask.is_empty() {
            return;
        }
        self.conditions
            .entry(view)
            .or_default()
            .entry(eq)
            .or_default()
            .or_assign(mask);
    }

    /// Subtract `mask` from the entry for `(view, eq)`; empty entries are
    /// removed.
    pub fn invalidate(&mut self, view: ViewId, eq: EqSetId, mask: &FieldMask) {
        let Some(eqs) = self.conditions.get_mut(&view) else {
            return;
        };
        if let Some(m) = eqs.get_mut(&eq) {
            m.subtract_assign(mask);
            if m.is_empty() {
                eqs.remove(&eq);
            }
        }
        if eqs.is_empty() {
            self.conditions.remove(&view);
        }
    }

    /// True iff every field of `(view, eq, mask)` is present in this set.
    /// `non_dominated` receives the residual fields for diagnostics.
    pub fn dominates(
        &self,
        view: ViewId,
        eq: EqSetId,
        mask: &FieldMask,
        non_dominated: &mut FieldMask,
    ) -> bool {
        match self.conditions.get(&view).and_then(|eqs| eqs.get(&eq)) {
            Some(m) => {
                *non_dominated = mask.subtract(m);
                non_dominated.is_empty()
            }
            None => {
                *non_dominated = mask.clone();
                mask.is_empty()
            }
        }
    }

    /// Is every triple in `self` dominated by `other`?
    pub fn subsumed_by(&self, other: &TraceViewSet) -> bool {
        let mut residual = FieldMask::new();
        self.iter()
            .all(|(view, eq, mask)| other.dominates(view, eq, mask, &mut residual))
    }

    /// Quick-reject for precondition checks: has any equivalence set named
    /// here been refined since the template's capture?
    pub fn has_refinements(&self, forest: &dyn RegionForest) -> bool {
        self.iter().any(|(_, eq, _)| forest.has_refinements(eq))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// The field mask recorded for `(view, eq)`, if any.
    pub fn find(&self, view: ViewId, eq: EqSetId) -> Option<&FieldMask> {
        self.conditions.get(&view).and_then(|eqs| eqs.get(&eq))
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.conditions.keys().copied()
    }

    /// The union of masks recorded for `view` across all equivalence sets.
    pub fn view_mask(&self, view: ViewId) -> FieldMask {
        let mut mask = FieldMask::new();
        if let Some(eqs) = self.conditions.get(&view) {
            for m in eqs.values() {
                mask.or_assign(m);
            }
        }
        mask
    }

    pub fn iter(&self) -> impl Iterator<Item = (ViewId, EqSetId, &FieldMask)> + '_ {
        self.conditions.iter().flat_map(|(view, eqs)| {
            eqs.iter().map(move |(eq, mask)| (*view, *eq, mask))
        })
    }
}

impl fmt::Display for TraceViewSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (view, eq, mask) in self.iter() {
            writeln!(f, "  view {} eq {} fields {}", view.0, eq.0, mask)?;
        }
        Ok(())
    }
}

/// A [TraceViewSet] plus the runtime checks a template performs against it.
#[derive(Clone, Debug, Default)]
pub struct TraceConditionSet {
    views: TraceViewSet,
    /// Flattened triples, cached by [Self::make_ready] so the hot
    /// precondition path never walks the nested maps.
    cached: Option<Vec<(ViewId, EqSetId, FieldMask)>>,
}

impl TraceConditionSet {
    pub fn new(views: TraceViewSet) -> Self {
        Self {
            views,
            cached: None,
        }
    }

    pub fn view_set(&self) -> &TraceViewSet {
        &self.views
    }

    /// Flatten and cache the condition triples.
    pub fn make_ready(&mut self) {
        if self.cached.is_none() {
            self.cached = Some(
                self.views
                    .iter()
                    .map(|(v, e, m)| (v, e, m.clone()))
                    .collect(),
            );
        }
    }

    fn triples(&self) -> Vec<(ViewId, EqSetId, FieldMask)> {
        match &self.cached {
            Some(c) => c.clone(),
            None => self.views.iter().map(|(v, e, m)| (v, e, m.clone())).collect(),
        }
    }

    /// Check that current runtime state satisfies every condition: each
    /// named view must currently hold valid data for its full mask, and no
    /// named equivalence set may have been refined.
    pub fn require(&self, forest: &dyn RegionForest) -> bool {
        for (view, eq, mask) in self.triples() {
            if forest.has_refinements(eq) {
                return false;
            }
            let valid = forest.valid_views(eq);
            match valid.iter().find(|(v, _)| *v == view) {
                Some((_, m)) if m.contains(&mask) => (),
                _ => return false,
            }
        }
        true
    }

    /// Install every condition as current state: the replayed template left
    /// these views valid.
    pub fn ensure(&self, forest: &dyn RegionForest) {
        for (view, eq, mask) in self.triples() {
            forest.update_validity(view, eq, &mask);
        }
    }
}
