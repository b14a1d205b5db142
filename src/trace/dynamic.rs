//! Dynamic traces: capture of runtime-inferred dependences.

use super::{DependenceRecord, OpInfo, Registered, TraceCore, TraceError, TraceId};
use crate::mask::FieldMask;
use crate::op::{DependenceType, Generation, OpHandle, OpId};
use std::collections::BTreeMap;

/// A trace that memoizes whatever the dependence analysis reported during
/// its first capture, and is *fixed* thereafter: later invocations must
/// present the same prefix of operation kinds and region counts.
pub struct DynamicTrace {
    pub(crate) core: TraceCore,
    /// Per captured operation, the incoming dependences it recorded.
    dependences: Vec<Vec<DependenceRecord>>,
    /// Kind/region-count fingerprints checked on replay.
    op_info: Vec<OpInfo>,
    /// Internal operations are synthesised differently from run to run.
    /// When an internal op mediates a dependence between two recorded
    /// operations we remember the transitive edge here, keyed by the
    /// internal op's identity, and promote it onto whichever real
    /// operation later reports an edge through the same internal op.
    internal_dependences: BTreeMap<(OpId, Generation), Vec<DependenceRecord>>,
    fixed: bool,
}

impl DynamicTrace {
    pub fn new(tid: TraceId, logical_only: bool) -> Self {
        Self {
            core: TraceCore::new(tid, logical_only),
            dependences: Vec::new(),
            op_info: Vec::new(),
            internal_dependences: BTreeMap::new(),
            fixed: false,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Close the captured prefix. Called by the capture operation when the
    /// application ends the first pass over the window.
    pub fn fix_trace(&mut self) {
        self.fixed = true;
    }

    pub(crate) fn register_operation(
        &mut self,
        op: OpHandle,
        gen: Generation,
    ) -> Result<Registered, TraceError> {
        let index = self.core.operations.len();
        if !self.fixed {
            self.core.operations.push((op.id, gen));
            self.core.op_map.insert((op.id, gen), index);
            self.dependences.push(Vec::new());
            self.op_info.push(OpInfo {
                kind: op.kind,
                count: op.region_count,
            });
            return Ok(Registered::Recorded { index });
        }

        // Replaying the captured prefix: the operation stream must match.
        if index >= self.op_info.len() {
            return Err(TraceError::TooManyOperations {
                captured: self.op_info.len(),
            });
        }
        let expected = self.op_info[index];
        let found = OpInfo {
            kind: op.kind,
            count: op.region_count,
        };
        if expected != found {
            return Err(TraceError::Divergence {
                index,
                expected,
                found,
            });
        }
        self.core.operations.push((op.id, gen));
        let dependences = self.dependences[index].clone();
        self.core.update_frontiers(index, &dependences);
        Ok(Registered::Replayed {
            index,
            dependences,
            alias_children: self.core.alias_children_for(index),
        })
    }

    /// Append `record` to the dependence list of the most recently
    /// registered operation, merging with the previous record when only the
    /// masks differ.
    fn insert_dependence(&mut self, record: DependenceRecord) {
        let Some(deps) = self.dependences.last_mut() else {
            return;
        };
        if let Some(last) = deps.last_mut() {
            if last.merge(&record) {
                return;
            }
        }
        deps.push(record);
    }

    /// Same, but into the transitive list of internal op `key`.
    fn insert_internal_dependence(
        &mut self,
        key: (OpId, Generation),
        record: DependenceRecord,
    ) {
        let deps = self.internal_dependences.entry(key).or_default();
        if let Some(last) = deps.last_mut() {
            if last.merge(&record) {
                return;
            }
        }
        deps.push(record);
    }

    pub(crate) fn record_dependence(
        &mut self,
        target: OpHandle,
        target_gen: Generation,
        source: OpHandle,
        source_gen: Generation,
    ) {
        if self.fixed {
            return;
        }
        let target_key = (target.id, target_gen);
        if let Some(&index) = self.core.op_map.get(&target_key) {
            let record = DependenceRecord::unversioned(index);
            if !source.kind.is_internal() {
                self.insert_dependence(record);
            } else {
                self.insert_internal_dependence((source.id, source_gen), record);
            }
        } else if target.kind.is_internal() {
            // The target is an internal op: promote its remembered
            // transitive edges onto the source.
            let records = self
                .internal_dependences
                .get(&target_key)
                .cloned()
                .unwrap_or_default();
            if !source.kind.is_internal() {
                for rec in records {
                    self.insert_dependence(rec);
                }
            } else {
                let source_key = (source.id, source_gen);
                for rec in records {
                    self.insert_internal_dependence(source_key, rec);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_region_dependence(
        &mut self,
        target: OpHandle,
        target_gen: Generation,
        source: OpHandle,
        source_gen: Generation,
        target_idx: u32,
        source_idx: u32,
        dtype: DependenceType,
        validates: bool,
        mask: &FieldMask,
    ) {
        if self.fixed {
            return;
        }
        let target_key = (target.id, target_gen);
        if let Some(&index) = self.core.op_map.get(&target_key) {
            let record = DependenceRecord {
                op_index: index,
                prev_idx: target_idx as i32,
                next_idx: source_idx as i32,
                validates,
                dtype,
                mask: mask.clone(),
            };
            if !source.kind.is_internal() {
                self.insert_dependence(record);
            } else {
                self.insert_internal_dependence((source.id, source_gen), record);
            }
        } else if target.kind.is_internal() {
            let records = self
                .internal_dependences
                .get(&target_key)
                .cloned()
                .unwrap_or_default();
            for rec in records {
                let overlap = rec.mask.intersect(mask);
                if overlap.is_empty() {
                    continue;
                }
                let promoted = DependenceRecord {
                    op_index: rec.op_index,
                    prev_idx: rec.prev_idx,
                    next_idx: source_idx as i32,
                    validates,
                    dtype,
                    mask: overlap,
                };
                if !source.kind.is_internal() {
                    self.insert_dependence(promoted);
                } else {
                    self.insert_internal_dependence((source.id, source_gen), promoted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;
    use crate::trace::LogicalTrace;

    fn task(id: u64, regions: u32) -> OpHandle {
        OpHandle::new(OpId(id), OpKind::Task, regions)
    }

    fn close(id: u64) -> OpHandle {
        OpHandle::new(OpId(id), OpKind::Close, 1)
    }

    fn gen(g: u64) -> Generation {
        Generation(g)
    }

    #[test]
    fn replay_matches_captured_prefix() {
        let mut t = DynamicTrace::new(TraceId(1), true);
        t.register_operation(task(10, 1), gen(1)).unwrap();
        t.register_operation(task(11, 2), gen(1)).unwrap();
        t.fix_trace();

        // Fresh handles, same shape: fine.
        assert!(matches!(
            t.register_operation(task(20, 1), gen(2)),
            Ok(Registered::Replayed { index: 0, .. })
        ));
        assert!(matches!(
            t.register_operation(task(21, 2), gen(2)),
            Ok(Registered::Replayed { index: 1, .. })
        ));
        assert!(matches!(
            t.register_operation(task(22, 1), gen(2)),
            Err(TraceError::TooManyOperations { captured: 2 })
        ));
    }

    #[test]
    fn divergent_region_count_is_reported() {
        let mut t = DynamicTrace::new(TraceId(1), true);
        t.register_operation(task(10, 1), gen(1)).unwrap();
        t.register_operation(task(11, 2), gen(1)).unwrap();
        t.fix_trace();

        t.register_operation(task(20, 1), gen(2)).unwrap();
        match t.register_operation(task(21, 3), gen(2)) {
            Err(TraceError::Divergence {
                index: 1,
                expected,
                found,
            }) => {
                assert_eq!(expected.count, 2);
                assert_eq!(found.count, 3);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn internal_op_edges_become_transitive() {
        let mut t = DynamicTrace::new(TraceId(1), true);
        let a = task(10, 1);
        let b = task(11, 1);
        let i = close(99);
        let m = FieldMask::from_fields(&[0, 1]);

        t.register_operation(a, gen(1)).unwrap();
        // The close op depends on A; remembered against the close op.
        t.record_region_dependence(
            a,
            gen(1),
            i,
            gen(1),
            0,
            0,
            DependenceType::True,
            false,
            &m,
        );
        t.register_operation(b, gen(1)).unwrap();
        // B depends on the close op; the stored A-edge is promoted onto B.
        t.record_region_dependence(
            i,
            gen(1),
            b,
            gen(1),
            0,
            0,
            DependenceType::True,
            false,
            &FieldMask::from_field(0),
        );
        t.fix_trace();

        // Replay a run that synthesises no close op at all: B must still
        // carry a direct dependence on A.
        t.register_operation(task(20, 1), gen(2)).unwrap();
        match t.register_operation(task(21, 1), gen(2)).unwrap() {
            Registered::Replayed { dependences, .. } => {
                assert_eq!(dependences.len(), 1);
                assert_eq!(dependences[0].op_index, 0);
                // Only the overlapping fields survive promotion.
                assert_eq!(dependences[0].mask, FieldMask::from_field(0));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn frontier_ops_feed_the_closing_fence() {
        let mut t = DynamicTrace::new(TraceId(1), true);
        let a = task(10, 1);
        let b = task(11, 1);
        t.register_operation(a, gen(1)).unwrap();
        t.register_operation(b, gen(1)).unwrap();
        t.record_region_dependence(
            a,
            gen(1),
            b,
            gen(1),
            0,
            0,
            DependenceType::True,
            false,
            &FieldMask::from_field(0),
        );
        t.fix_trace();

        let mut lt = LogicalTrace::Dynamic(t);
        lt.register_operation(task(20, 1), gen(2)).unwrap();
        lt.register_operation(task(21, 1), gen(2)).unwrap();
        // Only B is a frontier: A is shadowed by B's dependence on it.
        let fence_deps = lt.end_trace_execution();
        assert_eq!(fence_deps, vec![(OpId(21), gen(2))]);
        // The iteration's operation list was reset.
        assert!(lt.core().operations.is_empty());
    }
}
