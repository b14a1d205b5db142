//! The per-context trace cache.
//!
//! Each task context owns a registry of trace id → logical trace and at
//! most one *active* trace at a time. The scheduler drives the cache
//! through [Context::begin_trace] / [Context::end_trace], injects the
//! control operations those return into its operation stream, and routes
//! every in-window operation through [Context::register_operation].

use crate::forest::RegionTreeId;
use crate::log;
use crate::mask::FieldMask;
use crate::op::{DependenceType, Generation, OpHandle};
use crate::ops::{
    ControlOp, TraceBeginOp, TraceCaptureOp, TraceCompleteOp, TraceReplayOp, TraceSummaryOp,
};
use crate::template::PhysicalTrace;
use crate::trace::{
    DynamicTrace, LogicalTrace, Registered, StaticTrace, TraceError, TraceId, TracingState,
};
use std::collections::HashMap;
use std::sync::Arc;

/// How a trace should be created on first `begin`.
#[derive(Clone, Debug)]
pub enum TraceKind {
    /// Dependences inferred by the runtime on the first pass.
    Dynamic,
    /// Application-supplied dependences over the given region trees.
    Static { trees: Vec<RegionTreeId> },
}

#[derive(Default)]
pub struct Context {
    traces: HashMap<TraceId, LogicalTrace>,
    current: Option<TraceId>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or re-enter) trace `tid`. Returns the control operations the
    /// scheduler must inject at the window's start, in order: a replay op
    /// for fixed physical traces, then the begin fence.
    pub fn begin_trace(
        &mut self,
        tid: TraceId,
        kind: TraceKind,
        logical_only: bool,
    ) -> Result<Vec<ControlOp>, TraceError> {
        if let Some(active) = self.current {
            return Err(TraceError::BadTransition {
                from: self.traces[&active].state(),
                on: "begin_trace while another trace is active",
            });
        }
        let trace = self.traces.entry(tid).or_insert_with(|| match &kind {
            TraceKind::Dynamic => LogicalTrace::Dynamic(DynamicTrace::new(tid, logical_only)),
            TraceKind::Static { trees } => {
                LogicalTrace::Static(StaticTrace::new(tid, logical_only, trees))
            }
        });
        trace.clear_blocking_call();
        self.current = Some(tid);
        log::log_trace_state(&format!("begin trace {}", tid.0));

        let mut ops = Vec::new();
        // The first capture of a dynamic trace has nothing to replay; the
        // replay decision only exists once the trace is fixed.
        if trace.has_physical_trace() && trace.is_fixed() {
            ops.push(ControlOp::Replay(TraceReplayOp::new(tid)));
        }
        ops.push(ControlOp::Begin(TraceBeginOp::new(tid)));
        Ok(ops)
    }

    /// End trace `tid`. Returns the control operation closing the window:
    /// a capture op for a dynamic trace's first pass, a complete op
    /// afterwards.
    pub fn end_trace(&mut self, tid: TraceId) -> Result<ControlOp, TraceError> {
        let trace = self
            .traces
            .get(&tid)
            .ok_or(TraceError::UnknownTrace(tid))?;
        if self.current != Some(tid) {
            return Err(TraceError::BadTransition {
                from: trace.state(),
                on: "end_trace of an inactive trace",
            });
        }
        self.current = None;
        log::log_trace_state(&format!("end trace {}", tid.0));
        Ok(if trace.is_fixed() {
            ControlOp::Complete(TraceCompleteOp::new(tid))
        } else {
            ControlOp::Capture(TraceCaptureOp::new(tid))
        })
    }

    pub fn current_trace_id(&self) -> Option<TraceId> {
        self.current
    }

    pub fn trace(&self, tid: TraceId) -> Option<&LogicalTrace> {
        self.traces.get(&tid)
    }

    pub(crate) fn trace_mut(&mut self, tid: TraceId) -> Result<&mut LogicalTrace, TraceError> {
        self.traces
            .get_mut(&tid)
            .ok_or(TraceError::UnknownTrace(tid))
    }

    fn current_mut(&mut self) -> Result<&mut LogicalTrace, TraceError> {
        let tid = self.current.ok_or(TraceError::NoCurrentTrace)?;
        self.trace_mut(tid)
    }

    /// The physical trace of the active trace, if it has one.
    pub fn current_physical(&self) -> Option<&PhysicalTrace> {
        let tid = self.current?;
        self.traces.get(&tid)?.physical_trace()
    }

    /// Route one operation through the active trace. On divergence the
    /// current template is discarded, the trace reverts to `LOGICAL_ONLY`
    /// and will re-record from scratch on its next invocation; the error
    /// is returned so the scheduler can fall back to full analysis.
    pub fn register_operation(
        &mut self,
        op: OpHandle,
        gen: Generation,
    ) -> Result<Registered, TraceError> {
        let tid = self.current.ok_or(TraceError::NoCurrentTrace)?;
        let trace = self.trace_mut(tid)?;
        match trace.register_operation(op, gen) {
            Ok(registered) => Ok(registered),
            Err(
                err @ (TraceError::Divergence { .. } | TraceError::TooManyOperations { .. }),
            ) => {
                log::log_trace_state(&format!("trace {} diverged: {err}", tid.0));
                self.discard_trace(tid);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Throw away everything memoized for `tid`; the next `begin` starts a
    /// fresh capture.
    fn discard_trace(&mut self, tid: TraceId) {
        let Some(trace) = self.traces.get_mut(&tid) else {
            return;
        };
        if let Some(pt) = trace.physical_trace() {
            pt.clear_cached_template();
        }
        trace.set_state(TracingState::LogicalOnly);
        let logical_only = !trace.has_physical_trace();
        // Static dependences come from the application; nothing to
        // re-capture.
        if matches!(trace, LogicalTrace::Static(_)) {
            return;
        }
        self.traces
            .insert(tid, LogicalTrace::Dynamic(DynamicTrace::new(tid, logical_only)));
    }

    pub fn record_dependence(
        &mut self,
        target: OpHandle,
        target_gen: Generation,
        source: OpHandle,
        source_gen: Generation,
    ) -> Result<(), TraceError> {
        self.current_mut()?
            .record_dependence(target, target_gen, source, source_gen);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_region_dependence(
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
    ) -> Result<(), TraceError> {
        self.current_mut()?.record_region_dependence(
            target, target_gen, source, source_gen, target_idx, source_idx, dtype, validates,
            mask,
        );
        Ok(())
    }

    pub fn record_aliased_children(
        &mut self,
        req_index: u32,
        depth: u32,
        mask: &FieldMask,
    ) -> Result<(), TraceError> {
        self.current_mut()?
            .record_aliased_children(req_index, depth, mask);
        Ok(())
    }

    /// A synchronous user callback was observed; the template being
    /// recorded (if any) can never be replayed.
    pub fn record_blocking_call(&mut self) -> Result<(), TraceError> {
        self.current_mut()?.record_blocking_call();
        Ok(())
    }

    /// The region tree changed in a way no template can express: drop
    /// every cached template so the next iterations re-record. Returns the
    /// summary operations that materialise each dropped template's
    /// post-state; the invalidating operation must inject them ahead of
    /// itself.
    pub fn invalidate_trace_cache(&mut self) -> Vec<TraceSummaryOp> {
        log::log_trace_state("invalidate trace cache");
        let mut summary_ops = Vec::new();
        for (&tid, trace) in self.traces.iter_mut() {
            if let Some(pt) = trace.physical_trace() {
                if let Some(tpl) = pt.current_template() {
                    for info in tpl.summary_info() {
                        summary_ops.push(TraceSummaryOp::new(tid, info.clone(), Arc::clone(&tpl)));
                    }
                }
                pt.clear_cached_template();
            }
            if trace.state() == TracingState::PhysicalReplay {
                trace.set_state(TracingState::LogicalOnly);
            }
        }
        summary_ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpId, OpKind};

    #[test]
    fn nested_traces_are_rejected() {
        let mut ctx = Context::new();
        ctx.begin_trace(TraceId(1), TraceKind::Dynamic, true).unwrap();
        assert!(matches!(
            ctx.begin_trace(TraceId(2), TraceKind::Dynamic, true),
            Err(TraceError::BadTransition { .. })
        ));
    }

    #[test]
    fn ending_an_inactive_trace_is_rejected() {
        let mut ctx = Context::new();
        ctx.begin_trace(TraceId(1), TraceKind::Dynamic, true).unwrap();
        assert!(matches!(
            ctx.end_trace(TraceId(9)),
            Err(TraceError::UnknownTrace(TraceId(9)))
        ));
        ctx.end_trace(TraceId(1)).unwrap();
        assert!(matches!(
            ctx.end_trace(TraceId(1)),
            Err(TraceError::BadTransition { .. })
        ));
    }

    #[test]
    fn logical_only_traces_get_no_replay_op() {
        let mut ctx = Context::new();
        let ops = ctx
            .begin_trace(TraceId(1), TraceKind::Dynamic, true)
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], ControlOp::Begin(_)));
        ctx.register_operation(
            OpHandle::new(OpId(1), OpKind::Task, 1),
            Generation(1),
        )
        .unwrap();
        assert!(matches!(
            ctx.end_trace(TraceId(1)).unwrap(),
            ControlOp::Capture(_)
        ));
    }

    #[test]
    fn static_traces_replay_from_the_start() {
        let mut ctx = Context::new();
        let ops = ctx
            .begin_trace(
                TraceId(1),
                TraceKind::Static {
                    trees: vec![RegionTreeId(0)],
                },
                true,
            )
            .unwrap();
        // Static traces are always fixed, but a logical-only trace still
        // has no physical side and thus no replay decision.
        assert_eq!(ops.len(), 1);
        let registered = ctx
            .register_operation(OpHandle::new(OpId(1), OpKind::Task, 1), Generation(1))
            .unwrap();
        assert!(matches!(registered, Registered::Replayed { index: 0, .. }));
        assert!(matches!(
            ctx.end_trace(TraceId(1)).unwrap(),
            ControlOp::Complete(_)
        ));
    }

    #[test]
    fn invalidation_clears_cached_templates() {
        let mut ctx = Context::new();
        ctx.begin_trace(TraceId(1), TraceKind::Dynamic, false).unwrap();
        ctx.register_operation(
            OpHandle::new(OpId(1), OpKind::Task, 1),
            Generation(1),
        )
        .unwrap();
        ctx.end_trace(TraceId(1)).unwrap();
        let summaries = ctx.invalidate_trace_cache();
        assert!(summaries.is_empty());
        assert_eq!(
            ctx.trace(TraceId(1)).unwrap().state(),
            TracingState::LogicalOnly
        );
    }
}
