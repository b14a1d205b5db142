//! Static traces: application-supplied dependences.

use super::{DependenceRecord, Registered, TraceCore, TraceError, TraceId};
use crate::forest::RegionTreeId;
use crate::mask::FieldMask;
use crate::op::{DependenceType, Generation, OpHandle};
use std::collections::{BTreeSet, VecDeque};

/// One application-supplied dependence: "this operation depends on the
/// operation issued `previous_offset` operations ago".
#[derive(Clone, Debug)]
pub struct StaticDependence {
    pub previous_offset: usize,
    pub previous_req_index: i32,
    pub current_req_index: i32,
    pub dependence_type: DependenceType,
    pub validates: bool,
    pub dependent_mask: FieldMask,
}

/// A trace whose dependences the application knows up front. Always fixed;
/// every registration replays the (lazily translated) supplied records.
pub struct StaticTrace {
    pub(crate) core: TraceCore,
    /// Raw dependence lists in registration order, one entry per operation.
    static_dependences: VecDeque<Vec<StaticDependence>>,
    /// Translations of the raw lists into canonical records, produced on
    /// first registration of each position. Offsets are resolved lazily
    /// because the operation list is still growing while lists arrive.
    translated: Vec<Option<Vec<DependenceRecord>>>,
    /// The region trees this trace was constructed over.
    application_trees: BTreeSet<RegionTreeId>,
}

impl StaticTrace {
    pub fn new(tid: TraceId, logical_only: bool, trees: &[RegionTreeId]) -> Self {
        Self {
            core: TraceCore::new(tid, logical_only),
            static_dependences: VecDeque::new(),
            translated: Vec::new(),
            application_trees: trees.iter().copied().collect(),
        }
    }

    pub fn handles_region_tree(&self, tree: RegionTreeId) -> bool {
        self.application_trees.is_empty() || self.application_trees.contains(&tree)
    }

    pub(crate) fn record_static_dependences(&mut self, dependences: Vec<StaticDependence>) {
        self.static_dependences.push_back(dependences);
    }

    pub(crate) fn register_operation(
        &mut self,
        op: OpHandle,
        gen: Generation,
    ) -> Result<Registered, TraceError> {
        let index = self.core.operations.len();
        self.core.operations.push((op.id, gen));
        let dependences = self.translate_dependence_records(index);
        self.core.update_frontiers(index, &dependences);
        Ok(Registered::Replayed {
            index,
            dependences,
            alias_children: self.core.alias_children_for(index),
        })
    }

    /// Resolve the raw list for position `index` into canonical records,
    /// dropping offsets that reach before the start of the window and
    /// coalescing records that differ only in mask.
    fn translate_dependence_records(&mut self, index: usize) -> Vec<DependenceRecord> {
        if index < self.translated.len() {
            if let Some(cached) = &self.translated[index] {
                return cached.clone();
            }
        } else {
            self.translated.resize_with(index + 1, || None);
        }

        let raw = self.static_dependences.get(index);
        let mut records: Vec<DependenceRecord> = Vec::new();
        if let Some(raw) = raw {
            for dep in raw {
                if dep.previous_offset > index {
                    // Reaches outside the trace window; the begin fence
                    // already orders those.
                    continue;
                }
                let record = DependenceRecord {
                    op_index: index - dep.previous_offset,
                    prev_idx: dep.previous_req_index,
                    next_idx: dep.current_req_index,
                    validates: dep.validates,
                    dtype: dep.dependence_type,
                    mask: dep.dependent_mask.clone(),
                };
                if !records.iter_mut().any(|r| r.merge(&record)) {
                    records.push(record);
                }
            }
        }
        self.translated[index] = Some(records.clone());
        records
    }
}
