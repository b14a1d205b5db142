//! Trace-control operations.
//!
//! Five fence-shaped operations the scheduler injects into its operation
//! stream at trace boundaries. Each drives the owning trace's state
//! machine; their required order within one iteration is
//! `Begin ≺ Replay ≺ (operations) ≺ Complete ≺ Summary*`, with `Replay`
//! preceding `Begin` in the stream so the replay decision exists by the
//! time the begin fence maps.
//!
//! The `execute` methods run at the point the scheduler maps the fence,
//! i.e. once the fence's completion event is known.

use crate::context::Context;
use crate::event::Event;
use crate::log;
use crate::op::{Generation, OpId};
use crate::rt::Runtime;
use crate::template::{NonReplayable, PhysicalTemplate, SummaryInfo};
use crate::trace::{TraceError, TraceId, TracingState};
use std::sync::Arc;

/// The boundary operations [Context::begin_trace] / [Context::end_trace]
/// hand back for injection.
pub enum ControlOp {
    Replay(TraceReplayOp),
    Begin(TraceBeginOp),
    Capture(TraceCaptureOp),
    Complete(TraceCompleteOp),
}

/// Mapping fence at the logical start of a trace window; establishes the
/// boundary event for the iteration's event slots.
pub struct TraceBeginOp {
    tid: TraceId,
}

impl TraceBeginOp {
    pub(crate) fn new(tid: TraceId) -> Self {
        Self { tid }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    /// `fence_completion` is the begin fence's own completion: everything
    /// recorded or replayed this iteration is ordered after it.
    pub fn execute(
        &self,
        ctx: &mut Context,
        rt: &Runtime,
        fence_completion: Event,
    ) -> Result<(), TraceError> {
        if ctx.current_trace_id() != Some(self.tid) {
            let state = ctx
                .trace(self.tid)
                .map(|t| t.state())
                .unwrap_or(TracingState::LogicalOnly);
            return Err(TraceError::BadTransition {
                from: state,
                on: "begin fence for an inactive trace",
            });
        }
        let trace = ctx.trace_mut(self.tid)?;
        match trace.state() {
            TracingState::LogicalOnly => (),
            TracingState::PhysicalRecord => {
                if let Some(pt) = trace.physical_trace() {
                    pt.start_new_template(fence_completion);
                }
            }
            TracingState::PhysicalReplay => {
                if let Some(pt) = trace.physical_trace() {
                    let _ = pt.initialize_template(&**rt.events(), fence_completion);
                }
            }
        }
        Ok(())
    }
}

/// Decides, at each iteration's start, whether a recorded template can be
/// replayed against current runtime state.
pub struct TraceReplayOp {
    tid: TraceId,
}

impl TraceReplayOp {
    pub(crate) fn new(tid: TraceId) -> Self {
        Self { tid }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    /// Returns `true` when a template satisfied its preconditions and the
    /// trace will replay this iteration.
    pub fn execute(&self, ctx: &mut Context, rt: &Runtime) -> Result<bool, TraceError> {
        let threshold = rt.nonreplayable_threshold();
        let trace = ctx.trace_mut(self.tid)?;
        if !trace.has_physical_trace() {
            trace.set_state(TracingState::LogicalOnly);
            return Ok(false);
        }
        let (replaying, abandoned) = {
            let pt = trace.physical_trace().expect("checked above");
            if pt.nonreplayable_count() >= threshold {
                (false, true)
            } else {
                let ok = pt.check_template_preconditions(
                    &**rt.forest(),
                    &**rt.mapper_oracle(),
                    threshold,
                );
                (ok, false)
            }
        };
        if abandoned {
            // Too many non-replayable recordings: give up on templates for
            // this trace id entirely.
            trace.set_state(TracingState::LogicalOnly);
            log::log_trace_state(&format!("trace {}: tracing abandoned", self.tid.0));
            Ok(false)
        } else if replaying {
            trace.set_state(TracingState::PhysicalReplay);
            log::log_trace_state(&format!("trace {}: replaying", self.tid.0));
            Ok(true)
        } else {
            trace.set_state(TracingState::PhysicalRecord);
            log::log_trace_state(&format!("trace {}: recording", self.tid.0));
            Ok(false)
        }
    }
}

/// Marks the end of the captured window on a dynamic trace's first pass:
/// fixes the trace and finalizes any under-construction template.
pub struct TraceCaptureOp {
    tid: TraceId,
}

impl TraceCaptureOp {
    pub(crate) fn new(tid: TraceId) -> Self {
        Self { tid }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    /// Returns the operations the closing fence must register dependences
    /// on (empty for a capturing pass, whose fence analyses normally).
    pub fn execute(
        &self,
        ctx: &mut Context,
        rt: &Runtime,
    ) -> Result<Vec<(OpId, Generation)>, TraceError> {
        let trace = ctx.trace_mut(self.tid)?;
        let has_blocking = trace.has_blocking_call();
        if let crate::trace::LogicalTrace::Dynamic(d) = trace {
            d.fix_trace();
        }
        let fence_deps = trace.end_trace_execution();
        if let Some(pt) = trace.physical_trace() {
            if pt.is_recording() {
                let _ = pt.fix_trace(has_blocking, rt.replay_parallelism());
            }
        }
        trace.set_state(TracingState::LogicalOnly);
        Ok(fence_deps)
    }
}

/// What a completed iteration leaves behind.
pub struct CompleteOutcome {
    /// Did this iteration replay a template?
    pub replayed: bool,
    /// The replayed template's completion; becomes the context's new
    /// current fence. Null for recorded iterations.
    pub completion: Event,
    /// Operations the closing fence must register dependences on.
    pub fence_deps: Vec<(OpId, Generation)>,
    /// `Some(verdict)` when this iteration finalized a recording.
    pub replayable: Option<Result<(), NonReplayable>>,
    /// One summary op per captured `(requirement, instance-set)` pair of a
    /// replayed template, to be injected after the window.
    pub summary_ops: Vec<TraceSummaryOp>,
}

/// Fence at each iteration's boundary: finalizes a recorded iteration's
/// template, or drives a replayed iteration's interpreter and collects its
/// completion.
pub struct TraceCompleteOp {
    tid: TraceId,
}

impl TraceCompleteOp {
    pub(crate) fn new(tid: TraceId) -> Self {
        Self { tid }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    pub fn execute(&self, ctx: &mut Context, rt: &Runtime) -> Result<CompleteOutcome, TraceError> {
        let tid = self.tid;
        let trace = ctx.trace_mut(tid)?;
        let has_blocking = trace.has_blocking_call();
        let replayed = trace.state() == TracingState::PhysicalReplay;
        let fence_deps = trace.end_trace_execution();

        let mut completion = Event::NO_EVENT;
        let mut replayable = None;
        let mut summary_ops = Vec::new();
        if let Some(pt) = trace.physical_trace() {
            if replayed {
                if let Some(tpl) = pt.current_template() {
                    tpl.execute_all(rt);
                    completion = tpl.get_completion(&**rt.events());
                    pt.record_previous_template_completion(completion);
                    for info in tpl.summary_info() {
                        summary_ops.push(TraceSummaryOp::new(tid, info.clone(), Arc::clone(&tpl)));
                    }
                }
            } else if pt.is_recording() {
                replayable = Some(pt.fix_trace(has_blocking, rt.replay_parallelism()));
            }
        }
        trace.set_state(TracingState::LogicalOnly);
        Ok(CompleteOutcome {
            replayed,
            completion,
            fence_deps,
            replayable,
            summary_ops,
        })
    }
}

/// Injected after a replayed window, one per captured
/// `(requirement, instance-set)` pair, so downstream operations observe the
/// same post-state they would have seen without replay.
pub struct TraceSummaryOp {
    tid: TraceId,
    info: SummaryInfo,
    template: Arc<PhysicalTemplate>,
}

impl TraceSummaryOp {
    pub(crate) fn new(tid: TraceId, info: SummaryInfo, template: Arc<PhysicalTemplate>) -> Self {
        Self {
            tid,
            info,
            template,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    /// The requirement/instances this summary stands for; the scheduler
    /// runs its dependence analysis over these.
    pub fn info(&self) -> &SummaryInfo {
        &self.info
    }

    /// Install the replayed template's post-state. Idempotent across the
    /// template's summary ops.
    pub fn execute(&self, rt: &Runtime) {
        self.template.apply_postconditions(&**rt.forest());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, TraceKind};
    use crate::event::EventInterface;
    use crate::forest::{EqSetId, ExprId, RegionForest, RegionTreeId, ViewId};
    use crate::mapper::StaticMapperOracle;
    use crate::mask::FieldMask;
    use crate::op::{OpHandle, OpKind, RegionUsage, TraceLocalId};
    use crate::testing::{TestEvents, TestForest, TestOp};
    use crate::trace::Registered;

    fn runtime() -> (Runtime, Arc<TestEvents>, Arc<TestForest>) {
        let events = TestEvents::new();
        let forest = Arc::new(TestForest::with_events(Arc::clone(&events)));
        let rt = Runtime::new(
            Arc::clone(&events) as Arc<dyn EventInterface>,
            Arc::clone(&forest) as Arc<dyn crate::forest::RegionForest>,
            Arc::new(StaticMapperOracle),
        );
        rt.set_replay_parallelism(2);
        (rt, events, forest)
    }

    fn task(id: u64) -> OpHandle {
        OpHandle::new(OpId(id), OpKind::Task, 1)
    }

    /// Run one iteration of a two-task window, recording the instruction
    /// stream when the trace is in `PHYSICAL_RECORD`.
    fn run_iteration(
        ctx: &mut Context,
        rt: &Runtime,
        events: &TestEvents,
        tid: TraceId,
        iteration: u64,
    ) -> CompleteOutcome {
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        let mut replaying = false;
        for op in &ops {
            match op {
                ControlOp::Replay(r) => replaying = r.execute(ctx, rt).unwrap(),
                ControlOp::Begin(b) => b.execute(ctx, rt, events.fresh()).unwrap(),
                _ => unreachable!("begin_trace only yields replay/begin"),
            }
        }

        for (i, op) in [task(iteration * 10), task(iteration * 10 + 1)]
            .into_iter()
            .enumerate()
        {
            let registered = ctx.register_operation(op, Generation(iteration)).unwrap();
            let tlid = TraceLocalId::new(i, 0);
            let recording = ctx
                .trace(tid)
                .map(|t| t.state() == TracingState::PhysicalRecord)
                .unwrap_or(false);
            if recording {
                if let Some(pt) = ctx.current_physical() {
                    pt.with_recorder(|rec| {
                        let term = events.fresh();
                        rec.record_get_term_event(tlid, term);
                        rec.record_op_view(
                            tlid,
                            ViewId(7),
                            RegionTreeId(0),
                            EqSetId(1),
                            ExprId(0),
                            if i == 0 {
                                RegionUsage::write_discard()
                            } else {
                                RegionUsage::read_write()
                            },
                            &FieldMask::from_field(0),
                            true,
                        );
                        rec.record_complete_replay(tlid, Event::NO_EVENT);
                    })
                    .expect("recorder active while recording");
                }
            }
            if replaying {
                if let Some(tpl) = ctx.current_physical().and_then(|pt| pt.current_template()) {
                    tpl.register_operation(TestOp::new(tlid, events.fresh()));
                }
            }
            match registered {
                Registered::Recorded { index } => assert_eq!(index, i),
                Registered::Replayed { index, .. } => assert_eq!(index, i),
            }
        }

        match ctx.end_trace(tid).unwrap() {
            ControlOp::Capture(c) => {
                let fence_deps = c.execute(ctx, rt).unwrap();
                CompleteOutcome {
                    replayed: false,
                    completion: Event::NO_EVENT,
                    fence_deps,
                    replayable: None,
                    summary_ops: Vec::new(),
                }
            }
            ControlOp::Complete(c) => c.execute(ctx, rt).unwrap(),
            _ => unreachable!("end_trace only yields capture/complete"),
        }
    }

    #[test]
    fn dynamic_trace_progresses_logical_record_replay() {
        let (rt, events, _forest) = runtime();
        let mut ctx = Context::new();
        let tid = TraceId(1);

        // Pass 1: logical capture only; ends in a capture op.
        let out = run_iteration(&mut ctx, &rt, &events, tid, 1);
        assert!(!out.replayed);
        assert!(out.replayable.is_none());
        assert!(ctx.trace(tid).unwrap().is_fixed());

        // Pass 2: the trace is fixed but has no template: record one.
        let out = run_iteration(&mut ctx, &rt, &events, tid, 2);
        assert!(!out.replayed);
        assert!(matches!(out.replayable, Some(Ok(()))));

        // Pass 3: the recorded template replays.
        let out = run_iteration(&mut ctx, &rt, &events, tid, 3);
        assert!(out.replayed);
        assert!(out.completion.exists());
        // The closing fence depends on the trace's frontier operation.
        assert!(!out.fence_deps.is_empty());
    }

    #[test]
    fn blocking_call_forces_rerecording() {
        let (rt, events, _forest) = runtime();
        let mut ctx = Context::new();
        let tid = TraceId(2);

        run_iteration(&mut ctx, &rt, &events, tid, 1);

        // Pass 2 records, but observes a blocking call mid-window.
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        for op in &ops {
            match op {
                ControlOp::Replay(r) => {
                    r.execute(&mut ctx, &rt).unwrap();
                }
                ControlOp::Begin(b) => b.execute(&mut ctx, &rt, events.fresh()).unwrap(),
                _ => unreachable!(),
            }
        }
        ctx.register_operation(task(20), Generation(2)).unwrap();
        ctx.record_blocking_call().unwrap();
        ctx.register_operation(task(21), Generation(2)).unwrap();
        let out = match ctx.end_trace(tid).unwrap() {
            ControlOp::Complete(c) => c.execute(&mut ctx, &rt).unwrap(),
            _ => unreachable!(),
        };
        assert!(matches!(
            out.replayable,
            Some(Err(NonReplayable::BlockingCall))
        ));

        // Pass 3 finds no usable template and records again.
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        let mut replaying = true;
        for op in &ops {
            match op {
                ControlOp::Replay(r) => replaying = r.execute(&mut ctx, &rt).unwrap(),
                ControlOp::Begin(b) => b.execute(&mut ctx, &rt, events.fresh()).unwrap(),
                _ => unreachable!(),
            }
        }
        assert!(!replaying);
        // One more non-replayable recording and the threshold (2) makes
        // the replay op abandon templates for this trace id.
        ctx.record_blocking_call().unwrap();
        ctx.register_operation(task(30), Generation(3)).unwrap();
        ctx.register_operation(task(31), Generation(3)).unwrap();
        match ctx.end_trace(tid).unwrap() {
            ControlOp::Complete(c) => {
                let out = c.execute(&mut ctx, &rt).unwrap();
                assert!(matches!(out.replayable, Some(Err(_))));
            }
            _ => unreachable!(),
        }
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        for op in &ops {
            if let ControlOp::Replay(r) = op {
                assert!(!r.execute(&mut ctx, &rt).unwrap());
            }
        }
        assert_eq!(
            ctx.trace(tid).unwrap().state(),
            TracingState::LogicalOnly,
            "tracing abandoned after the threshold"
        );
        ctx.register_operation(task(40), Generation(4)).unwrap();
        ctx.register_operation(task(41), Generation(4)).unwrap();
        match ctx.end_trace(tid).unwrap() {
            ControlOp::Complete(c) => {
                c.execute(&mut ctx, &rt).unwrap();
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn divergence_discards_the_trace() {
        let (rt, events, _forest) = runtime();
        let mut ctx = Context::new();
        let tid = TraceId(3);

        run_iteration(&mut ctx, &rt, &events, tid, 1);
        assert!(ctx.trace(tid).unwrap().is_fixed());

        // Pass 2: the second operation shows up with a different region
        // count; registration reports divergence and the trace is
        // discarded.
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        for op in &ops {
            match op {
                ControlOp::Replay(r) => {
                    r.execute(&mut ctx, &rt).unwrap();
                }
                ControlOp::Begin(b) => b.execute(&mut ctx, &rt, events.fresh()).unwrap(),
                _ => unreachable!(),
            }
        }
        ctx.register_operation(task(20), Generation(2)).unwrap();
        let divergent = OpHandle::new(OpId(21), OpKind::Task, 3);
        assert!(matches!(
            ctx.register_operation(divergent, Generation(2)),
            Err(TraceError::Divergence { index: 1, .. })
        ));
        assert_eq!(ctx.trace(tid).unwrap().state(), TracingState::LogicalOnly);
        assert!(!ctx.trace(tid).unwrap().is_fixed());
    }

    #[test]
    fn summary_ops_reapply_post_state() {
        let (rt, events, forest) = runtime();
        let mut ctx = Context::new();
        let tid = TraceId(4);

        run_iteration(&mut ctx, &rt, &events, tid, 1);

        // Record a template that also captures summary info.
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        for op in &ops {
            match op {
                ControlOp::Replay(r) => {
                    r.execute(&mut ctx, &rt).unwrap();
                }
                ControlOp::Begin(b) => b.execute(&mut ctx, &rt, events.fresh()).unwrap(),
                _ => unreachable!(),
            }
        }
        for (i, op) in [task(20), task(21)].into_iter().enumerate() {
            ctx.register_operation(op, Generation(2)).unwrap();
            let tlid = TraceLocalId::new(i, 0);
            ctx.current_physical()
                .unwrap()
                .with_recorder(|rec| {
                    rec.record_get_term_event(tlid, events.fresh());
                    rec.record_op_view(
                        tlid,
                        ViewId(9),
                        RegionTreeId(0),
                        EqSetId(5),
                        ExprId(0),
                        RegionUsage::write_discard(),
                        &FieldMask::from_field(2),
                        true,
                    );
                    rec.record_complete_replay(tlid, Event::NO_EVENT);
                })
                .expect("recorder active while recording");
        }
        ctx.current_physical()
            .unwrap()
            .with_recorder(|rec| {
                rec.record_summary_info(
                    crate::forest::RegionRequirement {
                        tree: RegionTreeId(0),
                        fields: FieldMask::from_field(2),
                    },
                    crate::forest::InstanceSet {
                        views: vec![(ViewId(9), FieldMask::from_field(2))],
                    },
                    0,
                );
            })
            .expect("recorder active while recording");
        match ctx.end_trace(tid).unwrap() {
            ControlOp::Complete(c) => {
                c.execute(&mut ctx, &rt).unwrap();
            }
            _ => unreachable!(),
        }

        // Replay and run the summary ops it yields.
        let ops = ctx.begin_trace(tid, TraceKind::Dynamic, false).unwrap();
        for op in &ops {
            match op {
                ControlOp::Replay(r) => assert!(r.execute(&mut ctx, &rt).unwrap()),
                ControlOp::Begin(b) => b.execute(&mut ctx, &rt, events.fresh()).unwrap(),
                _ => unreachable!(),
            }
        }
        for (i, op) in [task(30), task(31)].into_iter().enumerate() {
            ctx.register_operation(op, Generation(3)).unwrap();
            let tpl = ctx
                .current_physical()
                .and_then(|pt| pt.current_template())
                .unwrap();
            tpl.register_operation(TestOp::new(TraceLocalId::new(i, 0), events.fresh()));
        }
        let out = match ctx.end_trace(tid).unwrap() {
            ControlOp::Complete(c) => c.execute(&mut ctx, &rt).unwrap(),
            _ => unreachable!(),
        };
        assert!(out.replayed);
        assert_eq!(out.summary_ops.len(), 1);
        forest.clear_valid();
        for summary in &out.summary_ops {
            assert_eq!(summary.info().requirement.tree, RegionTreeId(0));
            summary.execute(&rt);
        }
        // The post-state of the replayed window is visible again.
        let valid = forest.valid_views(EqSetId(5));
        assert!(valid
            .iter()
            .any(|(v, m)| *v == ViewId(9) && m.contains(&FieldMask::from_field(2))));
    }
}
