//! Template replay: the parallel interpreter.
//!
//! A replay binds fresh event identities into the template's event array
//! and interprets each slice on a worker thread. Slices synchronise only
//! through the array: the partition guarantees every slot is stored by one
//! slice before any other slice loads it, with crossing and frontier slots
//! bound during initialization.

use super::inst::ReplayContext;
use super::{PhysicalTemplate, FENCE_COMPLETION_SLOT};
use crate::event::{Event, EventInterface};
use crate::forest::RegionForest;
use crate::op::{Memoizable, TraceLocalId};
use crate::rt::Runtime;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl PhysicalTemplate {
    /// Register a concrete operation for the upcoming replay. One call per
    /// captured trace-local id, between [Self::initialize] and
    /// [Self::execute_all].
    pub fn register_operation(&self, op: Arc<dyn Memoizable>) {
        let tlid = op.trace_local_id();
        self.operations.lock().insert(tlid, op);
    }

    /// Prepare the interpreter state for one replay.
    ///
    /// Binds slot 0 to `fence_completion`, creates a fresh user event for
    /// every crossing slot, and seeds each carried frontier slot: from the
    /// previous replay's value of its source slot when `recurrent`, from
    /// the fence otherwise.
    pub fn initialize(&self, iface: &dyn EventInterface, fence_completion: Event, recurrent: bool) {
        // Carried slots read the *previous* replay's array contents; seed
        // them before anything is overwritten.
        let carried: Vec<(Event, super::EventSlot)> = self
            .frontiers
            .iter()
            .map(|(&src, &dst)| {
                let ev = if recurrent {
                    Event(self.events[src].load(Ordering::Acquire))
                } else {
                    fence_completion
                };
                (ev, dst)
            })
            .collect();
        for (ev, dst) in carried {
            self.events[dst].store(ev.0, Ordering::Release);
        }
        self.events[FENCE_COMPLETION_SLOT].store(fence_completion.0, Ordering::Release);
        for &crossing in self.crossing_events.values() {
            let ue = iface.create_user_event();
            self.user_events[crossing].store(ue.0, Ordering::Release);
            self.events[crossing].store(ue.0, Ordering::Release);
        }
        *self.fence_completion.lock() = fence_completion;
        *self.replay_done.lock() = Event::NO_EVENT;
        self.operations.lock().clear();
    }

    /// Interpret every slice, one worker per slice, and return the
    /// `replay_done` event, which has fired by the time this returns: all
    /// copies and fills have been issued and all completions delivered.
    /// The operations they signal may still be running; callers chain on
    /// [Self::get_completion] for that.
    pub fn execute_all(self: &Arc<Self>, rt: &Runtime) -> Event {
        let ops = Arc::new(self.operations.lock().clone());
        let fence = *self.fence_completion.lock();
        let iface = Arc::clone(rt.events());
        let forest = Arc::clone(rt.forest());

        let num_slices = self.slices.len();
        let latch = Arc::new((Mutex::new(num_slices), Condvar::new()));
        let mut slice_dones = Vec::with_capacity(num_slices);
        for idx in 0..num_slices {
            let done = iface.create_user_event();
            slice_dones.push(done);
            let tpl = Arc::clone(self);
            let ops = Arc::clone(&ops);
            let iface = Arc::clone(&iface);
            let forest = Arc::clone(&forest);
            let latch = Arc::clone(&latch);
            rt.spawn(Box::new(move || {
                tpl.execute_slice(idx, &ops, fence, &*iface, &*forest);
                iface.trigger_event(done, Event::NO_EVENT);
                let (count, cv) = &*latch;
                let mut count = count.lock();
                *count -= 1;
                if *count == 0 {
                    cv.notify_all();
                }
            }));
        }
        let (count, cv) = &*latch;
        let mut count = count.lock();
        while *count > 0 {
            cv.wait(&mut count);
        }
        drop(count);

        let replay_done = iface.merge_events(&slice_dones);
        *self.replay_done.lock() = replay_done;
        replay_done
    }

    /// Interpret one slice in order against the shared event array.
    pub(crate) fn execute_slice(
        &self,
        idx: usize,
        operations: &BTreeMap<TraceLocalId, Arc<dyn Memoizable>>,
        fence_completion: Event,
        iface: &dyn EventInterface,
        forest: &dyn RegionForest,
    ) {
        let ctx = ReplayContext {
            events: &self.events,
            user_events: &self.user_events,
            operations,
            fence_completion,
            iface,
            forest,
        };
        for inst in &self.slices[idx] {
            inst.execute(&ctx);
        }
    }

    /// The event fired when the last slice of the most recent replay
    /// finished issuing.
    pub fn replay_done(&self) -> Event {
        *self.replay_done.lock()
    }

    /// The completion of the replayed iteration: every captured
    /// operation's termination, merged.
    pub fn get_completion(&self, iface: &dyn EventInterface) -> Event {
        let evs: Vec<Event> = self
            .memo_entries
            .values()
            .map(|&slot| Event(self.events[slot].load(Ordering::Acquire)))
            .collect();
        iface.merge_events(&evs)
    }

    /// An event after which the template may be dropped: the completion of
    /// the last replay plus every outstanding collection event recorded
    /// against its views.
    pub fn defer_template_deletion(&self, iface: &dyn EventInterface) -> Event {
        let mut evs = vec![self.get_completion(iface)];
        evs.extend(self.gc_events());
        iface.merge_events(&evs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{CopyField, EqSetId, ExprId, RegionTreeId, ViewId};
    use crate::mapper::StaticMapperOracle;
    use crate::mask::FieldMask;
    use crate::template::TemplateRecorder;
    use crate::testing::{TestEvents, TestForest, TestOp};

    fn runtime_with(events: Arc<TestEvents>, forest: Arc<TestForest>) -> Runtime {
        Runtime::new(events, forest, Arc::new(StaticMapperOracle))
    }

    /// Capture a two-task chain: B's completion waits on A's termination
    /// and on B's own sync precondition.
    fn record_chain(events: &TestEvents) -> TemplateRecorder {
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let a = TraceLocalId::new(0, 0);
        let b = TraceLocalId::new(1, 0);
        let term_a = events.fresh();
        rec.record_get_term_event(a, term_a);
        rec.record_complete_replay(a, fence);
        rec.record_get_term_event(b, events.fresh());
        let sync_b = events.fresh();
        rec.record_set_op_sync_event(sync_b, b);
        let pre_b = events.fresh();
        rec.record_merge_events(pre_b, &[term_a, sync_b], b);
        rec.record_complete_replay(b, pre_b);
        rec
    }

    #[test]
    fn replay_stitches_fresh_events() {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = runtime_with(Arc::clone(&events), Arc::clone(&forest));
        rt.set_replay_parallelism(1);

        let tpl = Arc::new(record_chain(&events).finalize(false, 1).unwrap());

        let fence = events.fresh();
        tpl.initialize(&*events, fence, false);
        let op_a = TestOp::new(TraceLocalId::new(0, 0), events.fresh());
        let sync = events.fresh();
        let op_b = TestOp::with_sync(TraceLocalId::new(1, 0), events.fresh(), sync);
        tpl.register_operation(op_a.clone());
        tpl.register_operation(op_b.clone());
        let done = tpl.execute_all(&rt);
        assert!(done.exists());

        // A's completion came straight from the fence.
        assert_eq!(op_a.completed(), Some(fence));
        // B's replayed completion chains off A's *fresh* termination event
        // and B's fresh sync precondition, not the recorded identities.
        let completed = op_b.completed().unwrap();
        assert!(events.happens_before(op_a.completion_event(), completed));
        assert!(events.happens_before(sync, completed));
    }

    #[test]
    fn user_events_are_recreated_and_triggered() {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = runtime_with(Arc::clone(&events), Arc::clone(&forest));
        rt.set_replay_parallelism(1);

        // A's termination is routed through a user event that B waits on,
        // the shape the runtime produces when it renames a merge result.
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let a = TraceLocalId::new(0, 0);
        let b = TraceLocalId::new(1, 0);
        let term_a = events.fresh();
        rec.record_get_term_event(a, term_a);
        let user = events.fresh();
        rec.record_create_user_event(user, a);
        rec.record_trigger_event(user, term_a, a);
        rec.record_get_term_event(b, events.fresh());
        rec.record_complete_replay(b, user);
        let tpl = Arc::new(rec.finalize(false, 1).unwrap());

        tpl.initialize(&*events, events.fresh(), false);
        let op_a = TestOp::new(a, events.fresh());
        let op_b = TestOp::new(b, events.fresh());
        tpl.register_operation(op_a.clone());
        tpl.register_operation(op_b.clone());
        tpl.execute_all(&rt);

        // B chains off a *fresh* user event, triggered by A's fresh
        // termination; exactly one trigger fired.
        let completed = op_b.completed().unwrap();
        assert_ne!(completed, user);
        assert!(events.happens_before(op_a.completion_event(), completed));
        assert_eq!(events.untriggered_count(), 0);
    }

    #[test]
    fn recurrent_replays_chain_iterations() {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = runtime_with(Arc::clone(&events), Arc::clone(&forest));
        rt.set_replay_parallelism(1);

        // A reads view V which B then overwrites: A's anti-dependence on
        // B reaches across iterations, so fence elision must route it
        // through a carried frontier slot.
        let fence0 = events.fresh();
        let rec = TemplateRecorder::new(fence0);
        let a = TraceLocalId::new(0, 0);
        let b = TraceLocalId::new(1, 0);
        let view = ViewId(1);
        let mask = FieldMask::from_field(0);
        rec.record_get_term_event(a, events.fresh());
        rec.record_op_view(
            a,
            view,
            RegionTreeId(0),
            EqSetId(1),
            ExprId(0),
            crate::op::RegionUsage::read_only(),
            &mask,
            true,
        );
        rec.record_complete_replay(a, fence0);
        rec.record_get_term_event(b, events.fresh());
        rec.record_op_view(
            b,
            view,
            RegionTreeId(0),
            EqSetId(1),
            ExprId(0),
            crate::op::RegionUsage::read_write(),
            &mask,
            true,
        );
        rec.record_complete_replay(b, fence0);
        let tpl = Arc::new(rec.finalize(false, 1).unwrap());
        assert!(!tpl.frontiers.is_empty());

        let fence1 = events.fresh();
        tpl.initialize(&*events, fence1, false);
        let a1 = TestOp::new(a, events.fresh());
        let b1 = TestOp::new(b, events.fresh());
        tpl.register_operation(a1.clone());
        tpl.register_operation(b1.clone());
        tpl.execute_all(&rt);
        // First replay: the carried slot falls back to the fence.
        assert_eq!(a1.completed(), Some(fence1));

        let fence2 = tpl.get_completion(&*events);
        tpl.initialize(&*events, fence2, true);
        let a2 = TestOp::new(a, events.fresh());
        let b2 = TestOp::new(b, events.fresh());
        tpl.register_operation(a2.clone());
        tpl.register_operation(b2.clone());
        tpl.execute_all(&rt);
        // Recurrent replay: iteration 2's A waits on iteration 1's B, the
        // previous writer of the view it reads.
        assert_eq!(a2.completed(), Some(b1.completion_event()));
    }

    #[test]
    fn indirect_copies_replay_their_indirections() {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = runtime_with(Arc::clone(&events), Arc::clone(&forest));
        rt.set_replay_parallelism(1);

        // A fill establishes the gather source, then an indirect copy
        // scatters it into another view.
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let fill = TraceLocalId::new(0, 0);
        let cp = TraceLocalId::new(1, 0);
        let (src, dst) = (ViewId(1), ViewId(2));
        let tree = RegionTreeId(0);
        let mask = FieldMask::from_field(0);

        rec.record_issue_fill(
            fill,
            events.fresh(),
            ExprId(20),
            &[],
            &[0u8; 4],
            fence,
            &[],
            &[(src, tree, EqSetId(1), mask.clone())],
        );
        rec.record_issue_indirect(
            cp,
            events.fresh(),
            ExprId(21),
            &[CopyField { inst: src, field: 0 }],
            &[CopyField { inst: dst, field: 0 }],
            vec![7, 9],
            fence,
            &[(src, tree, EqSetId(1), mask.clone())],
            &[(dst, tree, EqSetId(1), mask.clone())],
        );
        let tpl = Arc::new(rec.finalize(false, 1).unwrap());

        tpl.initialize(&*events, events.fresh(), false);
        tpl.execute_all(&rt);

        // The replayed copy is still a gather/scatter, not a plain field
        // copy: its indirection payloads reach the forest intact.
        let copies = forest.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].expr, ExprId(21));
        assert_eq!(copies[0].indirections, vec![7, 9]);
    }

    #[test]
    fn parallel_slices_synchronise_through_crossing_events() {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = runtime_with(Arc::clone(&events), Arc::clone(&forest));
        rt.set_replay_parallelism(2);

        // Two independent fills, then a copy waiting on both.
        let fence = events.fresh();
        let rec = TemplateRecorder::new(fence);
        let f1 = TraceLocalId::new(0, 0);
        let f2 = TraceLocalId::new(1, 0);
        let cp = TraceLocalId::new(2, 0);
        let (v, w, x) = (ViewId(1), ViewId(2), ViewId(3));
        let tree = RegionTreeId(0);
        let mask = FieldMask::from_field(0);

        let f1_done = events.fresh();
        rec.record_issue_fill(
            f1,
            f1_done,
            ExprId(10),
            &[],
            &[0u8; 4],
            fence,
            &[],
            &[(v, tree, EqSetId(1), mask.clone())],
        );
        let f2_done = events.fresh();
        rec.record_issue_fill(
            f2,
            f2_done,
            ExprId(11),
            &[],
            &[0u8; 4],
            fence,
            &[],
            &[(w, tree, EqSetId(2), mask.clone())],
        );
        let pre = events.fresh();
        rec.record_merge_events(pre, &[f1_done, f2_done], cp);
        let cp_done = events.fresh();
        rec.record_issue_copy(
            cp,
            cp_done,
            ExprId(12),
            &[],
            &[],
            pre,
            crate::op::ReductionOpId(0),
            false,
            &[
                (v, tree, EqSetId(1), mask.clone()),
                (w, tree, EqSetId(2), mask.clone()),
            ],
            &[(x, tree, EqSetId(3), mask.clone())],
        );
        let tpl = Arc::new(rec.finalize(false, 2).unwrap());

        // The fills land in different slices and the copy's wait on the
        // foreign fill goes through a crossing event.
        assert_eq!(tpl.slices.len(), 2);
        assert!(!tpl.crossing_events.is_empty());

        let replay_fence = events.fresh();
        tpl.initialize(&*events, replay_fence, false);
        tpl.execute_all(&rt);

        let fills = forest.fills();
        let copies = forest.copies();
        assert_eq!(fills.len(), 2);
        assert_eq!(copies.len(), 1);
        // A plain copy carries no indirection payloads.
        assert!(copies[0].indirections.is_empty());
        // The copy happens after both fills in the replayed event graph.
        for fill in &fills {
            assert!(
                events.happens_before(fill.completion, copies[0].completion),
                "copy did not await fill"
            );
        }
    }
}
