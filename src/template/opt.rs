//! The template optimizer.
//!
//! The recorded instruction stream is maximally conservative: every copy,
//! fill and completion waits on the begin fence, and merges mirror exactly
//! what the runtime produced during recording. The passes here rewrite the
//! stream in place, preserving slot semantics, into a form worth replaying
//! in parallel:
//!
//! 1. `elide_fences` — replace fence waits with the true in-template
//!    producers of the consumed data, routing cross-iteration producers
//!    through carried *frontier* slots.
//! 2. `propagate_merges` — forward single-input merges and flatten nested
//!    merges nobody else observes.
//! 3. `transitive_reduction` — drop merge inputs already covered by another
//!    path through the event DAG.
//! 4. `propagate_copies` — drop copies whose destination is never read.
//! 5. `prepare_parallel_replay` — partition into slices, making inter-slice
//!    edges explicit crossing events.
//! 6. `push_complete_replays` — completions go last within their slice.

use super::inst::{EventSlot, Instruction, FENCE_COMPLETION_SLOT};
use super::{RecorderInner, ViewExprs};
use crate::op::TraceLocalId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use vob::Vob;

/// Sentinel for slots no instruction writes: the fence slot, frontier and
/// crossing slots (bound during replay initialization) and dummy slots
/// (never read).
const UNWRITTEN: usize = usize::MAX;

pub(crate) struct Optimized {
    pub(crate) slices: Vec<Vec<Instruction>>,
    pub(crate) crossing_events: BTreeMap<EventSlot, EventSlot>,
    pub(crate) frontiers: BTreeMap<EventSlot, EventSlot>,
}

pub(crate) fn optimize(inner: &mut RecorderInner, replay_parallelism: usize) -> Optimized {
    let mut opt = Opt {
        inner,
        gen: Vec::new(),
        frontiers: BTreeMap::new(),
    };
    opt.elide_fences();
    opt.propagate_merges();
    opt.transitive_reduction();
    opt.propagate_copies();
    let (mut slices, crossing_events) = opt.prepare_parallel_replay(replay_parallelism);
    push_complete_replays(&mut slices);
    let optimized = Optimized {
        slices,
        crossing_events,
        frontiers: opt.frontiers,
    };
    #[cfg(debug_assertions)]
    verify_well_formed(&optimized, opt.inner.slot_count);
    optimized
}

struct Opt<'a> {
    inner: &'a mut RecorderInner,
    /// `gen[slot]` = index of the instruction currently producing that
    /// slot, or [UNWRITTEN].
    gen: Vec<usize>,
    frontiers: BTreeMap<EventSlot, EventSlot>,
}

impl Opt<'_> {
    fn recompute_gen(&mut self) {
        self.gen = vec![UNWRITTEN; self.inner.slot_count];
        for (i, inst) in self.inner.instructions.iter().enumerate() {
            if let Some(out) = inst.output_slot() {
                self.gen[out.index()] = i;
            }
        }
    }

    fn alloc_slot(&mut self) -> EventSlot {
        let slot = EventSlot::from_usize(self.inner.slot_count);
        self.inner.slot_count += 1;
        self.gen.push(UNWRITTEN);
        slot
    }

    /// The final users of every view/field the given views cover, by
    /// term-event slot. `exclude` drops the consumer's own entry.
    fn find_all_last_users(&self, views: &ViewExprs, exclude: EventSlot) -> BTreeSet<EventSlot> {
        let mut users = BTreeSet::new();
        for (view, exprs) in views {
            let Some(view_users) = self.inner.view_users.get(view) else {
                continue;
            };
            for user in view_users {
                if user.entry == exclude {
                    continue;
                }
                if exprs.iter().any(|(_, mask)| user.mask.overlaps(mask)) {
                    users.insert(user.entry);
                }
            }
        }
        users
    }

    /// Pass 1: fence elision. Pre-pass the stream satisfies "instruction
    /// `i` writes slot `i`", so a producer's program position is its slot
    /// index; a producer positioned at or after its consumer can only
    /// supply data from the previous iteration and is routed through a
    /// carried frontier slot.
    fn elide_fences(&mut self) {
        self.recompute_gen();
        let num = self.inner.instructions.len();
        let mut new_instructions: Vec<Instruction> = Vec::with_capacity(num);
        let old = std::mem::take(&mut self.inner.instructions);

        for (idx, mut inst) in old.into_iter().enumerate() {
            let fence_read = match &inst {
                Instruction::IssueCopy { precondition, .. }
                | Instruction::IssueFill { precondition, .. } => {
                    *precondition == FENCE_COMPLETION_SLOT
                }
                Instruction::CompleteReplay { rhs, .. } => *rhs == FENCE_COMPLETION_SLOT,
                _ => false,
            };
            if fence_read {
                let (views, exclude) = match &inst {
                    Instruction::IssueCopy { lhs, .. } | Instruction::IssueFill { lhs, .. } => {
                        (self.inner.copy_views.get(lhs).cloned(), *lhs)
                    }
                    Instruction::CompleteReplay { owner, .. } => (
                        self.inner.op_views.get(owner).cloned(),
                        self.inner
                            .memo_entries
                            .get(owner)
                            .copied()
                            .unwrap_or(FENCE_COMPLETION_SLOT),
                    ),
                    _ => unreachable!(),
                };
                let users = views
                    .map(|v| self.find_all_last_users(&v, exclude))
                    .unwrap_or_default();
                if !users.is_empty() {
                    let mut sources: BTreeSet<EventSlot> = BTreeSet::new();
                    for user in users {
                        if user.index() < idx {
                            // Produced earlier in this replay.
                            sources.insert(user);
                        } else {
                            // Produced by the previous iteration: read it
                            // through a carried slot that initialization
                            // seeds.
                            let carried = match self.frontiers.get(&user) {
                                Some(&c) => c,
                                None => {
                                    let c = self.alloc_slot();
                                    self.frontiers.insert(user, c);
                                    c
                                }
                            };
                            sources.insert(carried);
                        }
                    }
                    let replacement = if sources.len() == 1 {
                        *sources.iter().next().expect("nonempty")
                    } else {
                        let lhs = self.alloc_slot();
                        let owner = inst.owner().expect("fence consumers carry owners");
                        self.gen[lhs.index()] = new_instructions.len();
                        new_instructions.push(Instruction::MergeEvent {
                            lhs,
                            rhs: sources,
                            owner,
                        });
                        lhs
                    };
                    inst.rewrite_inputs(|s| {
                        if s == FENCE_COMPLETION_SLOT {
                            replacement
                        } else {
                            s
                        }
                    });
                }
            }
            if let Some(out) = inst.output_slot() {
                self.gen[out.index()] = new_instructions.len();
            }
            new_instructions.push(inst);
        }
        self.inner.instructions = new_instructions;
    }

    /// Pass 2: merge propagation.
    fn propagate_merges(&mut self) {
        self.recompute_gen();
        let insts = &mut self.inner.instructions;

        // Forward single-input merges, transitively.
        let mut subst: HashMap<EventSlot, EventSlot> = HashMap::new();
        for inst in insts.iter() {
            if let Instruction::MergeEvent { lhs, rhs, .. } = inst {
                if rhs.len() == 1 {
                    let mut target = *rhs.iter().next().expect("single");
                    while let Some(&t) = subst.get(&target) {
                        target = t;
                    }
                    subst.insert(*lhs, target);
                }
            }
        }
        let resolve = |s: EventSlot| -> EventSlot {
            let mut s = s;
            while let Some(&t) = subst.get(&s) {
                s = t;
            }
            s
        };
        for inst in insts.iter_mut() {
            inst.rewrite_inputs(resolve);
        }

        // Count consumers of each slot, then flatten merge inputs that are
        // themselves merges nobody else observes.
        let mut uses = vec![0usize; self.inner.slot_count];
        for inst in insts.iter() {
            for s in inst.input_slots() {
                uses[s.index()] += 1;
            }
        }
        let snapshot = insts.clone();
        for (idx, inst) in insts.iter_mut().enumerate() {
            let Instruction::MergeEvent { rhs, .. } = inst else {
                continue;
            };
            let mut flat: BTreeSet<EventSlot> = BTreeSet::new();
            for &s in rhs.iter() {
                let g = self.gen[s.index()];
                if g != UNWRITTEN && g != idx && uses[s.index()] == 1 {
                    if let Instruction::MergeEvent { rhs: nested, .. } = &snapshot[g] {
                        flat.extend(nested.iter().copied());
                        continue;
                    }
                }
                flat.insert(s);
            }
            *rhs = flat;
        }

        // Drop forwarded and now-unobserved merges.
        let mut uses = vec![0usize; self.inner.slot_count];
        for inst in insts.iter() {
            for s in inst.input_slots() {
                uses[s.index()] += 1;
            }
        }
        insts.retain(|inst| match inst {
            Instruction::MergeEvent { lhs, .. } => {
                !subst.contains_key(lhs) && uses[lhs.index()] > 0
            }
            _ => true,
        });
    }

    /// Pass 3: transitive reduction over the event DAG. An edge into a
    /// merge is redundant when another input already reaches it. Besides
    /// dataflow edges, an operation's term event is ordered after the
    /// preconditions its completion and sync instructions hand it.
    fn transitive_reduction(&mut self) {
        self.recompute_gen();
        let n = self.inner.slot_count;
        let term_of: BTreeMap<TraceLocalId, EventSlot> = self.inner.memo_entries.clone();

        let mut reach: Vec<Vob> = vec![Vob::from_elem(false, n); n];
        let add_edges = |reach: &mut Vec<Vob>, target: EventSlot, inputs: &[EventSlot]| {
            let tgt = target.index();
            for &inp in inputs {
                let i = inp.index();
                if i == tgt {
                    continue;
                }
                let src = reach[i].clone();
                reach[tgt].or(&src);
                reach[tgt].set(i, true);
            }
        };
        for inst in self.inner.instructions.iter() {
            match inst {
                Instruction::MergeEvent { lhs, rhs, .. } => {
                    let inputs: Vec<EventSlot> = rhs.iter().copied().collect();
                    add_edges(&mut reach, *lhs, &inputs);
                }
                Instruction::IssueCopy {
                    lhs, precondition, ..
                }
                | Instruction::IssueFill {
                    lhs, precondition, ..
                } => add_edges(&mut reach, *lhs, &[*precondition]),
                Instruction::TriggerEvent { lhs, rhs, .. } => {
                    add_edges(&mut reach, *lhs, &[*rhs]);
                }
                Instruction::CompleteReplay { owner, rhs } => {
                    // The operation finishes after the precondition the
                    // replay hands it.
                    if let Some(&term) = term_of.get(owner) {
                        add_edges(&mut reach, term, &[*rhs]);
                    }
                }
                Instruction::SetOpSyncEvent { lhs, owner } => {
                    if let Some(&term) = term_of.get(owner) {
                        add_edges(&mut reach, term, &[*lhs]);
                    }
                }
                Instruction::GetTermEvent { .. }
                | Instruction::CreateUserEvent { .. }
                | Instruction::AssignFenceCompletion { .. } => (),
            }
        }

        for inst in self.inner.instructions.iter_mut() {
            let Instruction::MergeEvent { rhs, .. } = inst else {
                continue;
            };
            let inputs: Vec<EventSlot> = rhs.iter().copied().collect();
            rhs.retain(|&s| {
                !inputs.iter().any(|&other| {
                    other != s && reach[other.index()].get(s.index()).unwrap_or(false)
                })
            });
        }
    }

    /// Pass 4: copy elimination. A copy whose completion nobody awaits and
    /// whose destination is never read again (and no longer backs a
    /// postcondition) contributes nothing to the replay.
    fn propagate_copies(&mut self) {
        self.recompute_gen();
        let mut uses = vec![0usize; self.inner.slot_count];
        for inst in self.inner.instructions.iter() {
            for s in inst.input_slots() {
                uses[s.index()] += 1;
            }
        }
        let mut removable: BTreeSet<EventSlot> = BTreeSet::new();
        for inst in self.inner.instructions.iter() {
            let Instruction::IssueCopy { lhs, .. } = inst else {
                continue;
            };
            if uses[lhs.index()] != 0 {
                continue;
            }
            let Some(views) = self.inner.copy_views.get(lhs) else {
                continue;
            };
            let dead = views.iter().all(|(view, exprs)| {
                exprs.iter().all(|(_, mask)| {
                    let read_later = self
                        .inner
                        .view_users
                        .get(view)
                        .map(|users| {
                            users.iter().any(|u| {
                                u.entry != *lhs && u.usage.has_read() && u.mask.overlaps(mask)
                            })
                        })
                        .unwrap_or(false);
                    !read_later && !self.inner.post.view_mask(*view).overlaps(mask)
                })
            });
            if dead {
                removable.insert(*lhs);
            }
        }
        self.inner.instructions.retain(|inst| match inst {
            Instruction::IssueCopy { lhs, .. } => !removable.contains(lhs),
            _ => true,
        });
    }

    /// Pass 5: partition into `replay_parallelism` slices, one replay
    /// worker each. Instructions stay with their owning operation; an edge
    /// whose producer sits in another slice is re-routed through a crossing
    /// slot backed by a fresh user event, triggered right after the
    /// producer.
    fn prepare_parallel_replay(
        &mut self,
        replay_parallelism: usize,
    ) -> (Vec<Vec<Instruction>>, BTreeMap<EventSlot, EventSlot>) {
        self.recompute_gen();
        let num_slices = replay_parallelism.max(1);
        let num = self.inner.instructions.len();

        // Assign instructions to slices round-robin by owner.
        let mut slice_of_owner: BTreeMap<TraceLocalId, usize> = BTreeMap::new();
        let mut slice_of_inst = vec![UNWRITTEN; num];
        for (i, inst) in self.inner.instructions.iter().enumerate() {
            let Some(owner) = inst.owner() else {
                // The fence assignment is performed by initialization, not
                // by a slice.
                continue;
            };
            let next = slice_of_owner.len() % num_slices;
            let s = *slice_of_owner.entry(owner).or_insert(next);
            slice_of_inst[i] = s;
        }
        // A trigger must run where its user event is created.
        for i in 0..num {
            if let Instruction::TriggerEvent { lhs, .. } = &self.inner.instructions[i] {
                let g = self.gen[lhs.index()];
                if g != UNWRITTEN {
                    slice_of_inst[i] = slice_of_inst[g];
                }
            }
        }

        // Find and re-route crossing edges.
        let mut crossing_events: BTreeMap<EventSlot, EventSlot> = BTreeMap::new();
        let mut pending_triggers: BTreeMap<usize, Vec<Instruction>> = BTreeMap::new();
        for i in 0..num {
            let s = slice_of_inst[i];
            if s == UNWRITTEN {
                continue;
            }
            let inputs = self.inner.instructions[i].input_slots();
            let mut remap: HashMap<EventSlot, EventSlot> = HashMap::new();
            for inp in inputs {
                let g = self.gen[inp.index()];
                // Slots bound by initialization (the fence assignment,
                // frontier and crossing slots) are visible to every slice.
                if g == UNWRITTEN || slice_of_inst[g] == UNWRITTEN || slice_of_inst[g] == s {
                    continue;
                }
                let c = match crossing_events.get(&inp) {
                    Some(&c) => c,
                    None => {
                        let c = self.alloc_slot();
                        crossing_events.insert(inp, c);
                        let owner = self.inner.instructions[g]
                            .owner()
                            .expect("sliced producers carry owners");
                        pending_triggers
                            .entry(g)
                            .or_default()
                            .push(Instruction::TriggerEvent {
                                lhs: c,
                                rhs: inp,
                                owner,
                            });
                        c
                    }
                };
                remap.insert(inp, c);
            }
            if !remap.is_empty() {
                self.inner.instructions[i]
                    .rewrite_inputs(|x| remap.get(&x).copied().unwrap_or(x));
            }
        }

        let mut slices: Vec<Vec<Instruction>> = vec![Vec::new(); num_slices];
        for (i, inst) in self.inner.instructions.iter().enumerate() {
            let s = slice_of_inst[i];
            if s == UNWRITTEN {
                continue;
            }
            slices[s].push(inst.clone());
            if let Some(triggers) = pending_triggers.remove(&i) {
                slices[s].extend(triggers);
            }
        }
        (slices, crossing_events)
    }
}

/// Pass 6: within each slice, completions come last; nothing after them
/// references their operation.
fn push_complete_replays(slices: &mut [Vec<Instruction>]) {
    for slice in slices.iter_mut() {
        let (mut rest, completes): (Vec<Instruction>, Vec<Instruction>) = std::mem::take(slice)
            .into_iter()
            .partition(|inst| !matches!(inst, Instruction::CompleteReplay { .. }));
        rest.extend(completes);
        *slice = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{EqSetId, ExprId, RegionTreeId, ViewId};
    use crate::mask::FieldMask;
    use crate::op::ReductionOpId;
    use crate::template::TemplateRecorder;
    use crate::testing::TestEvents;

    fn merges_of(slices: &[Vec<Instruction>]) -> Vec<&Instruction> {
        slices
            .iter()
            .flatten()
            .filter(|i| matches!(i, Instruction::MergeEvent { .. }))
            .collect()
    }

    /// Three chained tasks A -> B -> C: after transitive reduction C's
    /// merge must not wait on A directly.
    #[test]
    fn linear_chain_loses_redundant_edge() {
        let events = TestEvents::new();
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let (a, b, c) = (
            crate::op::TraceLocalId::new(0, 0),
            crate::op::TraceLocalId::new(1, 0),
            crate::op::TraceLocalId::new(2, 0),
        );
        let term_a = events.fresh();
        let term_b = events.fresh();
        let term_c = events.fresh();
        rec.record_get_term_event(a, term_a);
        rec.record_complete_replay(a, fence);
        rec.record_get_term_event(b, term_b);
        let pre_b = events.fresh();
        rec.record_merge_events(pre_b, &[term_a], b);
        rec.record_complete_replay(b, pre_b);
        rec.record_get_term_event(c, term_c);
        let pre_c = events.fresh();
        rec.record_merge_events(pre_c, &[term_a, term_b], c);
        rec.record_complete_replay(c, pre_c);

        let tpl = rec.finalize(false, 1).unwrap();
        let merges = merges_of(&tpl.slices);
        // B's single-input merge was forwarded away; C's merge shrank from
        // two inputs to one, B's termination.
        assert_eq!(merges.len(), 1);
        let Instruction::MergeEvent { rhs, .. } = merges[0] else {
            unreachable!();
        };
        assert_eq!(rhs.len(), 1);
        assert_eq!(rhs.iter().next().copied(), Some(EventSlot::from_usize(3)));
    }

    /// A merge observed only by another merge is flattened into it.
    #[test]
    fn nested_merges_flatten() {
        let events = TestEvents::new();
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let consumer = crate::op::TraceLocalId::new(3, 0);
        let t1 = events.fresh();
        let t2 = events.fresh();
        let t3 = events.fresh();
        rec.record_get_term_event(crate::op::TraceLocalId::new(0, 0), t1);
        rec.record_get_term_event(crate::op::TraceLocalId::new(1, 0), t2);
        rec.record_get_term_event(crate::op::TraceLocalId::new(2, 0), t3);
        rec.record_get_term_event(consumer, events.fresh());
        let inner = events.fresh();
        rec.record_merge_events(inner, &[t1, t2], consumer);
        let outer = events.fresh();
        rec.record_merge_events(outer, &[inner, t3], consumer);
        rec.record_complete_replay(consumer, outer);

        let tpl = rec.finalize(false, 1).unwrap();
        let merges = merges_of(&tpl.slices);
        assert_eq!(merges.len(), 1);
        let Instruction::MergeEvent { rhs, .. } = merges[0] else {
            unreachable!();
        };
        assert_eq!(rhs.len(), 3);
    }

    /// A copy whose completion nobody awaits and whose destination is
    /// overwritten before anyone reads it is dropped.
    #[test]
    fn dead_copies_are_eliminated() {
        let events = TestEvents::new();
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let tree = RegionTreeId(0);
        let mask = FieldMask::from_field(0);
        let cp1 = crate::op::TraceLocalId::new(0, 0);
        let cp2 = crate::op::TraceLocalId::new(1, 0);

        let done1 = events.fresh();
        rec.record_issue_copy(
            cp1,
            done1,
            ExprId(1),
            &[],
            &[],
            fence,
            ReductionOpId(0),
            false,
            &[],
            &[(ViewId(1), tree, EqSetId(1), mask.clone())],
        );
        let done2 = events.fresh();
        rec.record_issue_copy(
            cp2,
            done2,
            ExprId(2),
            &[],
            &[],
            fence,
            ReductionOpId(0),
            false,
            &[],
            &[(ViewId(2), tree, EqSetId(1), mask.clone())],
        );

        let tpl = rec.finalize(false, 1).unwrap();
        let copies: Vec<&Instruction> = tpl
            .slices
            .iter()
            .flatten()
            .filter(|i| matches!(i, Instruction::IssueCopy { .. }))
            .collect();
        // The second copy superseded the first one's destination in the
        // postconditions; only the surviving writer is replayed.
        assert_eq!(copies.len(), 1);
        let Instruction::IssueCopy { expr, .. } = copies[0] else {
            unreachable!();
        };
        assert_eq!(*expr, ExprId(2));
    }

    /// Owners are distributed round-robin over slices and inter-slice
    /// edges become crossing events triggered in the producing slice.
    #[test]
    fn crossing_events_bridge_slices() {
        let events = TestEvents::new();
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let a = crate::op::TraceLocalId::new(0, 0);
        let b = crate::op::TraceLocalId::new(1, 0);
        let term_a = events.fresh();
        rec.record_get_term_event(a, term_a);
        rec.record_complete_replay(a, fence);
        let term_b = events.fresh();
        rec.record_get_term_event(b, term_b);
        let pre_b = events.fresh();
        rec.record_merge_events(pre_b, &[term_a], b);
        rec.record_complete_replay(b, pre_b);

        let tpl = rec.finalize(false, 2).unwrap();
        assert_eq!(tpl.slices.len(), 2);
        // B's wait on A's termination crosses slices exactly once.
        assert_eq!(tpl.crossing_events.len(), 1);
        let (&src, &crossing) = tpl.crossing_events.iter().next().unwrap();
        assert_eq!(src, EventSlot::from_usize(1));
        // The producing slice triggers the crossing event right after A's
        // term event is read.
        let trigger_slice: Vec<&Vec<Instruction>> = tpl
            .slices
            .iter()
            .filter(|s| {
                s.iter().any(|i| {
                    matches!(i, Instruction::TriggerEvent { lhs, .. } if *lhs == crossing)
                })
            })
            .collect();
        assert_eq!(trigger_slice.len(), 1);
        assert!(trigger_slice[0]
            .iter()
            .any(|i| matches!(i, Instruction::GetTermEvent { lhs, .. } if *lhs == src)));
    }

    /// Completions are pushed to the back of their slice.
    #[test]
    fn complete_replays_run_last() {
        let events = TestEvents::new();
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let a = crate::op::TraceLocalId::new(0, 0);
        let b = crate::op::TraceLocalId::new(1, 0);
        rec.record_get_term_event(a, events.fresh());
        rec.record_complete_replay(a, fence);
        rec.record_get_term_event(b, events.fresh());
        rec.record_complete_replay(b, fence);

        let tpl = rec.finalize(false, 1).unwrap();
        let slice = &tpl.slices[0];
        let first_complete = slice
            .iter()
            .position(|i| matches!(i, Instruction::CompleteReplay { .. }))
            .unwrap();
        assert!(slice[first_complete..]
            .iter()
            .all(|i| matches!(i, Instruction::CompleteReplay { .. })));
    }
}

/// Check the slot write-before-read invariant the partition must preserve:
/// every slot an instruction loads is either bound by initialization (the
/// fence slot, frontier and crossing slots) or stored earlier in the same
/// slice.
#[cfg(debug_assertions)]
fn verify_well_formed(optimized: &Optimized, slot_count: usize) {
    let mut prologue: BTreeSet<EventSlot> = BTreeSet::new();
    prologue.insert(FENCE_COMPLETION_SLOT);
    prologue.extend(optimized.frontiers.values().copied());
    prologue.extend(optimized.crossing_events.values().copied());
    for slice in &optimized.slices {
        let mut written = prologue.clone();
        for inst in slice {
            for s in inst.input_slots() {
                assert!(
                    written.contains(&s),
                    "slot {} read before written: {inst}",
                    s.index()
                );
            }
            if let Some(out) = inst.output_slot() {
                assert!(out.index() < slot_count);
                written.insert(out);
            }
            if let Instruction::TriggerEvent { lhs, .. } = inst {
                // The trigger makes the user event at `lhs` safe to chain
                // from within this slice as well.
                written.insert(*lhs);
            }
        }
    }
}
