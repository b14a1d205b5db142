//! Logical traces: memoized dependence analysis.
//!
//! A logical trace records the sequence of operations a context issued
//! inside a named trace window, together with the dependences reported for
//! each of them. On later invocations of the same window the recorded
//! dependences are replayed instead of re-derived. Two flavors exist:
//! [StaticTrace] replays application-supplied dependences,
//! [DynamicTrace] captures whatever the runtime's dependence analysis
//! reports on the first pass and is *fixed* thereafter.
//!
//! A trace moves through three states:
//!
//! ```text
//!                  ┌──────────────┐
//!       begin ────▶│ LOGICAL_ONLY │◀───── divergence / invalidation
//!                  └──────────────┘
//!                    │ replay op finds no usable template
//!                    ▼
//!                  ┌─────────────────┐
//!                  │ PHYSICAL_RECORD │────▶ finalize non-replayable: back
//!                  └─────────────────┘      to LOGICAL_ONLY
//!                    │ complete op fixes a replayable template
//!                    ▼
//!                  ┌─────────────────┐
//!                  │ PHYSICAL_REPLAY │ (stays until invalidated)
//!                  └─────────────────┘
//! ```

pub mod dynamic;
pub mod static_trace;

pub use dynamic::DynamicTrace;
pub use static_trace::{StaticDependence, StaticTrace};

use crate::forest::RegionTreeId;
use crate::mask::FieldMask;
use crate::op::{DependenceType, Generation, OpHandle, OpId, OpKind};
use crate::template::PhysicalTrace;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Application-chosen identity of a trace within a context.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TraceId(pub u32);

/// Where a logical trace is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TracingState {
    /// Recording or replaying dependences only; no physical memoization.
    LogicalOnly,
    /// Recording dependences and the instruction stream of a nascent
    /// template.
    PhysicalRecord,
    /// Replaying a committed template.
    PhysicalReplay,
}

/// The kind/region-count fingerprint a replayed operation must match.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpInfo {
    pub kind: OpKind,
    pub count: u32,
}

/// Faults surfaced to the scheduler. All are recoverable by re-recording.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace diverged at operation {index}: recorded {expected:?}, observed {found:?}")]
    Divergence {
        index: usize,
        expected: OpInfo,
        found: OpInfo,
    },
    #[error("replayed trace has more operations than were captured ({captured})")]
    TooManyOperations { captured: usize },
    #[error("unknown trace id {0:?}")]
    UnknownTrace(TraceId),
    #[error("no trace is active in this context")]
    NoCurrentTrace,
    #[error("invalid transition from {from:?} on {on}")]
    BadTransition {
        from: TracingState,
        on: &'static str,
    },
}

/// A memoized dependence: the source operation's record of one incoming
/// edge from the operation at `op_index` in the trace's operation list.
///
/// `prev_idx`/`next_idx` are region-requirement indices on the target and
/// source respectively, or -1 when the dependence is not region-specific.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependenceRecord {
    pub op_index: usize,
    pub prev_idx: i32,
    pub next_idx: i32,
    pub validates: bool,
    pub dtype: DependenceType,
    pub mask: FieldMask,
}

impl DependenceRecord {
    pub fn unversioned(op_index: usize) -> Self {
        Self {
            op_index,
            prev_idx: -1,
            next_idx: -1,
            validates: false,
            dtype: DependenceType::True,
            mask: FieldMask::new(),
        }
    }

    /// Merge `other` into `self` by OR-ing masks, provided every other
    /// field matches. Returns `false` (and leaves `self` alone) otherwise.
    pub fn merge(&mut self, other: &DependenceRecord) -> bool {
        if self.op_index != other.op_index
            || self.prev_idx != other.prev_idx
            || self.next_idx != other.next_idx
            || self.validates != other.validates
            || self.dtype != other.dtype
        {
            return false;
        }
        self.mask.or_assign(&other.mask);
        true
    }
}

/// A pair of region requirements of one operation that alias at a tree
/// depth but do not interfere; re-applied to path traversal on replay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AliasChildren {
    pub req_index: u32,
    pub depth: u32,
    pub mask: FieldMask,
}

/// What `register_operation` tells the scheduler to do.
#[derive(Debug)]
pub enum Registered {
    /// The operation was appended to a trace under capture; dependence
    /// analysis proceeds normally.
    Recorded { index: usize },
    /// The operation matched the captured prefix; the scheduler must apply
    /// the returned dependences and aliased-children entries instead of
    /// running dependence analysis.
    Replayed {
        index: usize,
        dependences: Vec<DependenceRecord>,
        alias_children: Vec<AliasChildren>,
    },
}

/// State shared by both trace flavors.
pub(crate) struct TraceCore {
    pub(crate) tid: TraceId,
    /// Operations of the current iteration, in registration order.
    pub(crate) operations: Vec<(OpId, Generation)>,
    /// Reverse lookup used while capturing.
    pub(crate) op_map: HashMap<(OpId, Generation), usize>,
    /// Aliased-but-non-interfering region requirement pairs, per operation
    /// position.
    pub(crate) aliased_children: BTreeMap<usize, Vec<AliasChildren>>,
    pub(crate) state: TracingState,
    pub(crate) physical: Option<PhysicalTrace>,
    pub(crate) blocking_call_observed: bool,
    /// Operation positions no later operation depended on; the end-of-trace
    /// fence must depend on these. Rebuilt during each replayed iteration.
    pub(crate) frontiers: BTreeSet<usize>,
}

impl TraceCore {
    pub(crate) fn new(tid: TraceId, logical_only: bool) -> Self {
        Self {
            tid,
            operations: Vec::new(),
            op_map: HashMap::new(),
            aliased_children: BTreeMap::new(),
            state: TracingState::LogicalOnly,
            physical: if logical_only {
                None
            } else {
                Some(PhysicalTrace::new())
            },
            blocking_call_observed: false,
            frontiers: BTreeSet::new(),
        }
    }

    pub(crate) fn record_aliased_children(
        &mut self,
        req_index: u32,
        depth: u32,
        mask: &FieldMask,
    ) {
        if self.operations.is_empty() {
            return;
        }
        let index = self.operations.len() - 1;
        self.aliased_children
            .entry(index)
            .or_default()
            .push(AliasChildren {
                req_index,
                depth,
                mask: mask.clone(),
            });
    }

    pub(crate) fn alias_children_for(&self, index: usize) -> Vec<AliasChildren> {
        self.aliased_children
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Frontier bookkeeping for a replayed registration: the new operation
    /// shadows everything it depends on.
    pub(crate) fn update_frontiers(&mut self, index: usize, dependences: &[DependenceRecord]) {
        for dep in dependences {
            self.frontiers.remove(&dep.op_index);
        }
        self.frontiers.insert(index);
    }
}

/// A named, replayable window of operations in a context.
pub enum LogicalTrace {
    Static(StaticTrace),
    Dynamic(DynamicTrace),
}

impl LogicalTrace {
    pub(crate) fn core(&self) -> &TraceCore {
        match self {
            LogicalTrace::Static(t) => &t.core,
            LogicalTrace::Dynamic(t) => &t.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut TraceCore {
        match self {
            LogicalTrace::Static(t) => &mut t.core,
            LogicalTrace::Dynamic(t) => &mut t.core,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.core().tid
    }

    pub fn state(&self) -> TracingState {
        self.core().state
    }

    pub fn is_recording(&self) -> bool {
        self.core().state == TracingState::PhysicalRecord
    }

    pub fn is_replaying(&self) -> bool {
        self.core().state == TracingState::PhysicalReplay
    }

    pub(crate) fn set_state(&mut self, state: TracingState) {
        self.core_mut().state = state;
    }

    pub fn record_blocking_call(&mut self) {
        self.core_mut().blocking_call_observed = true;
    }

    pub fn clear_blocking_call(&mut self) {
        self.core_mut().blocking_call_observed = false;
    }

    pub fn has_blocking_call(&self) -> bool {
        self.core().blocking_call_observed
    }

    pub fn has_physical_trace(&self) -> bool {
        self.core().physical.is_some()
    }

    pub fn physical_trace(&self) -> Option<&PhysicalTrace> {
        self.core().physical.as_ref()
    }

    /// Is the captured prefix closed, so registrations must match it?
    pub fn is_fixed(&self) -> bool {
        match self {
            LogicalTrace::Static(_) => true,
            LogicalTrace::Dynamic(t) => t.is_fixed(),
        }
    }

    pub fn handles_region_tree(&self, tree: RegionTreeId) -> bool {
        match self {
            LogicalTrace::Static(t) => t.handles_region_tree(tree),
            LogicalTrace::Dynamic(_) => true,
        }
    }

    /// Append (capture) or match (replay) one operation. See [Registered].
    pub fn register_operation(
        &mut self,
        op: OpHandle,
        gen: Generation,
    ) -> Result<Registered, TraceError> {
        match self {
            LogicalTrace::Static(t) => t.register_operation(op, gen),
            LogicalTrace::Dynamic(t) => t.register_operation(op, gen),
        }
    }

    /// Record a non-region dependence of `source` on `target`. A no-op
    /// unless the trace is capturing.
    pub fn record_dependence(
        &mut self,
        target: OpHandle,
        target_gen: Generation,
        source: OpHandle,
        source_gen: Generation,
    ) {
        if let LogicalTrace::Dynamic(t) = self {
            t.record_dependence(target, target_gen, source, source_gen);
        }
    }

    /// Record a region-to-region dependence of `source` on `target`. A
    /// no-op unless the trace is capturing.
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
    ) {
        if let LogicalTrace::Dynamic(t) = self {
            t.record_region_dependence(
                target, target_gen, source, source_gen, target_idx, source_idx, dtype, validates,
                mask,
            );
        }
    }

    pub fn record_aliased_children(&mut self, req_index: u32, depth: u32, mask: &FieldMask) {
        self.core_mut().record_aliased_children(req_index, depth, mask);
    }

    /// Stash the application-supplied dependences for the next registered
    /// operation. Only static traces consume these.
    pub fn record_static_dependences(&mut self, dependences: Vec<StaticDependence>) {
        if let LogicalTrace::Static(t) = self {
            t.record_static_dependences(dependences);
        }
    }

    /// Finish one execution of the trace. Returns, for a replayed
    /// iteration, the operation positions the closing fence must register
    /// dependences on; the current iteration's operation list is reset.
    pub fn end_trace_execution(&mut self) -> Vec<(OpId, Generation)> {
        let core = self.core_mut();
        // Frontiers are only accumulated while dependences are being
        // replayed; a capturing iteration ends with an empty set and the
        // fence performs its own dependence analysis.
        let fence_deps = core
            .frontiers
            .iter()
            .filter_map(|&idx| core.operations.get(idx).copied())
            .collect();
        core.frontiers.clear();
        core.operations.clear();
        core.op_map.clear();
        fence_deps
    }
}
