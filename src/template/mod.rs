//! Physical templates: memoized physical dataflow.
//!
//! While a trace is in the `PHYSICAL_RECORD` state the scheduler calls back
//! into a [TemplateRecorder] for every event, copy, fill and mapping
//! decision it produces; the recorder distils those callbacks into an
//! instruction stream over dense event slots. Finalization turns the
//! recorder into an immutable [PhysicalTemplate]: conditions are computed,
//! replayability decided, and the instruction graph optimized into parallel
//! slices. Replays then interpret the slices against fresh event
//! identities; see [replay].
//!
//! A [PhysicalTrace] owns the templates recorded for one logical trace and
//! decides, each iteration, whether any of them can be replayed.

pub mod inst;
pub(crate) mod opt;
pub mod replay;

pub use inst::{EventSlot, Instruction, InstructionKind, FENCE_COMPLETION_SLOT};

use crate::condition::{TraceConditionSet, TraceViewSet};
use crate::event::Event;
use crate::forest::{
    CopyField, EqSetId, ExprId, InstanceSet, RegionForest, RegionRequirement, RegionTreeId, ViewId,
};
use crate::log;
use crate::mapper::{CachedMapping, MapTaskOutput, MapperOracle};
use crate::mask::FieldMask;
use crate::op::{Memoizable, ReductionOpId, RegionUsage, TraceLocalId};
use index_vec::IndexVec;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use thiserror::Error;

/// Why a recorded template cannot be replayed. A verdict, not an error: the
/// trace simply reverts to re-recording.
#[derive(Debug, Error)]
pub enum NonReplayable {
    #[error("a blocking call was observed during recording")]
    BlockingCall,
    #[error("postconditions do not subsume preconditions")]
    PostdominanceFailed,
    #[error("reductions read by the template are not all consumed by it")]
    UnconsumedReductions,
}

/// Expressions and fields of one view touched by an operation or copy.
pub(crate) type ViewExprs = BTreeMap<ViewId, Vec<(ExprId, FieldMask)>>;

/// One recorded use of a view: who used it (by term-event slot), how, and
/// over which expression/fields. Only the *last* users per field survive;
/// superseded users have their masks pruned as later users arrive.
#[derive(Clone, Debug)]
pub(crate) struct ViewUser {
    pub(crate) usage: RegionUsage,
    /// The event slot holding the user's completion.
    pub(crate) entry: EventSlot,
    /// Expression overlap cannot be decided without the forest, so the
    /// optimizer treats any two users of a view as overlapping and only
    /// narrows by field mask.
    #[allow(dead_code)]
    pub(crate) expr: ExprId,
    pub(crate) mask: FieldMask,
}

/// Can two users of overlapping fields coexist as last users?
fn is_compatible(u1: &RegionUsage, u2: &RegionUsage) -> bool {
    (u1.privilege == crate::op::Privilege::ReadOnly
        && u2.privilege == crate::op::Privilege::ReadOnly)
        || (u1.is_reduction() && u2.is_reduction() && u1.redop == u2.redop)
}

/// A captured `(requirement, instance-set)` pair; each yields one summary
/// operation after a replayed iteration.
#[derive(Clone, Debug)]
pub struct SummaryInfo {
    pub requirement: RegionRequirement,
    pub instances: InstanceSet,
    pub parent_index: u32,
}

pub(crate) struct RecorderInner {
    /// Dense first-seen slot assignment for recorded event identities.
    event_map: IndexMap<Event, EventSlot>,
    /// Pre-optimization the stream satisfies: instruction `i` writes slot
    /// `i` (instructions without a result allocate a dummy slot).
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) slot_count: usize,
    /// Term-event slot per traced operation.
    pub(crate) memo_entries: BTreeMap<TraceLocalId, EventSlot>,
    pub(crate) user_event_slots: BTreeSet<EventSlot>,
    pub(crate) op_views: BTreeMap<TraceLocalId, ViewExprs>,
    pub(crate) copy_views: BTreeMap<EventSlot, ViewExprs>,
    pub(crate) view_users: BTreeMap<ViewId, Vec<ViewUser>>,
    view_groups: BTreeMap<RegionTreeId, BTreeSet<ViewId>>,
    pre: TraceViewSet,
    post: TraceViewSet,
    pre_reductions: TraceViewSet,
    post_reductions: TraceViewSet,
    consumed_reductions: TraceViewSet,
    pre_fill_views: Vec<(ViewId, FieldMask)>,
    post_fill_views: Vec<(ViewId, FieldMask)>,
    cached_mappings: BTreeMap<TraceLocalId, CachedMapping>,
    summary_info: Vec<SummaryInfo>,
    outstanding_gc_events: BTreeMap<ViewId, Vec<Event>>,
}

impl RecorderInner {
    /// Assign the next dense slot to `event`. The identity must be fresh;
    /// recording the same event twice is a caller bug.
    fn convert_event(&mut self, event: Event) -> EventSlot {
        let slot = EventSlot::from_usize(self.slot_count);
        self.slot_count += 1;
        if event.exists() {
            let prev = self.event_map.insert(event, slot);
            debug_assert!(prev.is_none(), "event {event:?} recorded twice");
        }
        slot
    }

    /// A slot for an instruction that produces no event, keeping the
    /// slot-per-instruction alignment the optimizer relies on.
    fn dummy_slot(&mut self) -> EventSlot {
        let slot = EventSlot::from_usize(self.slot_count);
        self.slot_count += 1;
        slot
    }

    /// The slot of a previously recorded event. Identities the template
    /// never saw were produced before the trace began and resolve to the
    /// fence-completion slot.
    fn find_event(&self, event: Event) -> EventSlot {
        if !event.exists() {
            return FENCE_COMPLETION_SLOT;
        }
        self.event_map
            .get(&event)
            .copied()
            .unwrap_or(FENCE_COMPLETION_SLOT)
    }

    fn insert_instruction(&mut self, inst: Instruction) {
        debug_assert_eq!(self.instructions.len() + 1, self.slot_count);
        self.instructions.push(inst);
    }

    fn entry_of(&self, tlid: TraceLocalId) -> EventSlot {
        *self
            .memo_entries
            .get(&tlid)
            .unwrap_or_else(|| panic!("no term event recorded for operation {tlid}"))
    }

    /// Register a last-user of `view`, pruning superseded earlier users.
    fn add_view_user(&mut self, view: ViewId, user: ViewUser) {
        let users = self.view_users.entry(view).or_default();
        for existing in users.iter_mut() {
            if existing.mask.overlaps(&user.mask) && !is_compatible(&existing.usage, &user.usage) {
                existing.mask.subtract_assign(&user.mask);
            }
        }
        users.retain(|u| !u.mask.is_empty());
        users.push(user);
    }

    /// The valid-view update rule: reads not already satisfied by the
    /// template's own writes become preconditions; writes supersede other
    /// views of the same tree and become postconditions.
    fn update_valid_views(
        &mut self,
        view: ViewId,
        tree: RegionTreeId,
        eq: EqSetId,
        usage: RegionUsage,
        mask: &FieldMask,
    ) {
        self.view_groups.entry(tree).or_default().insert(view);
        if usage.is_reduction() {
            // A reduction folds into whatever reductions the view already
            // carries. Unless this template produced those itself, they
            // become a precondition, and *someone* in the template must
            // apply them for re-entry to be sound.
            let mut non_dominated = FieldMask::new();
            if !self.post_reductions.dominates(view, eq, mask, &mut non_dominated) {
                self.pre_reductions.insert(view, eq, &non_dominated);
            }
            self.post_reductions.insert(view, eq, mask);
            return;
        }
        if usage.has_read() {
            let mut non_dominated = FieldMask::new();
            if !self.post.dominates(view, eq, mask, &mut non_dominated) {
                self.pre.insert(view, eq, &non_dominated);
            }
        }
        if usage.has_write() {
            let others: Vec<ViewId> = self
                .view_groups
                .get(&tree)
                .map(|vs| vs.iter().copied().filter(|v| *v != view).collect())
                .unwrap_or_default();
            for other in others {
                self.post.invalidate(other, eq, mask);
            }
            self.post.insert(view, eq, mask);
        }
    }

    /// Reading a reduction view applies (consumes) its pending reductions.
    fn consume_reduction(&mut self, view: ViewId, eq: EqSetId, mask: &FieldMask) {
        self.consumed_reductions.insert(view, eq, mask);
    }
}

/// A template under construction. Analysis threads call the `record_*`
/// methods as execution proceeds; [TemplateRecorder::finalize] freezes the
/// result.
pub struct TemplateRecorder {
    inner: Mutex<RecorderInner>,
    fence_event: Event,
}

/// A `(view, eq, mask)` triple a copy or fill reads or writes, as reported
/// by the forest during recording.
pub type TracedView = (ViewId, RegionTreeId, EqSetId, FieldMask);

impl TemplateRecorder {
    /// Start a new, empty template whose slot 0 is bound to the completion
    /// of `fence_event`.
    pub fn new(fence_event: Event) -> Self {
        let mut inner = RecorderInner {
            event_map: IndexMap::new(),
            instructions: Vec::new(),
            slot_count: 0,
            memo_entries: BTreeMap::new(),
            user_event_slots: BTreeSet::new(),
            op_views: BTreeMap::new(),
            copy_views: BTreeMap::new(),
            view_users: BTreeMap::new(),
            view_groups: BTreeMap::new(),
            pre: TraceViewSet::new(),
            post: TraceViewSet::new(),
            pre_reductions: TraceViewSet::new(),
            post_reductions: TraceViewSet::new(),
            consumed_reductions: TraceViewSet::new(),
            pre_fill_views: Vec::new(),
            post_fill_views: Vec::new(),
            cached_mappings: BTreeMap::new(),
            summary_info: Vec::new(),
            outstanding_gc_events: BTreeMap::new(),
        };
        let lhs = inner.convert_event(fence_event);
        debug_assert_eq!(lhs, FENCE_COMPLETION_SLOT);
        inner.insert_instruction(Instruction::AssignFenceCompletion { lhs });
        Self {
            inner: Mutex::new(inner),
            fence_event,
        }
    }

    pub fn fence_event(&self) -> Event {
        self.fence_event
    }

    /// Reserve a slot for `tlid`'s termination event.
    pub fn record_get_term_event(&self, tlid: TraceLocalId, term: Event) {
        let mut inner = self.inner.lock();
        let lhs = inner.convert_event(term);
        inner.memo_entries.insert(tlid, lhs);
        inner.insert_instruction(Instruction::GetTermEvent { lhs, owner: tlid });
    }

    pub fn record_create_user_event(&self, lhs: Event, owner: TraceLocalId) {
        let mut inner = self.inner.lock();
        let lhs = inner.convert_event(lhs);
        inner.user_event_slots.insert(lhs);
        inner.insert_instruction(Instruction::CreateUserEvent { lhs, owner });
    }

    pub fn record_trigger_event(&self, lhs: Event, rhs: Event, owner: TraceLocalId) {
        let mut inner = self.inner.lock();
        let lhs = inner.find_event(lhs);
        let rhs = inner.find_event(rhs);
        inner.dummy_slot();
        inner.insert_instruction(Instruction::TriggerEvent { lhs, rhs, owner });
    }

    /// Record a merge with the reservation-time set of input slots. `lhs`
    /// must be a fresh event identity distinct from every input (the caller
    /// renames through a user event if the runtime returned an input).
    pub fn record_merge_events(&self, lhs: Event, rhs: &[Event], owner: TraceLocalId) {
        let mut inner = self.inner.lock();
        let mut rhs_slots: BTreeSet<EventSlot> = rhs.iter().map(|&e| inner.find_event(e)).collect();
        if rhs_slots.is_empty() {
            rhs_slots.insert(FENCE_COMPLETION_SLOT);
        }
        let lhs = inner.convert_event(lhs);
        inner.insert_instruction(Instruction::MergeEvent {
            lhs,
            rhs: rhs_slots,
            owner,
        });
    }

    /// Record an issued copy: its completion event, expression, fields,
    /// precondition, and the views it read and wrote.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_copy(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        precondition: Event,
        redop: ReductionOpId,
        reduction_fold: bool,
        tracing_srcs: &[TracedView],
        tracing_dsts: &[TracedView],
    ) {
        self.record_copy_like(
            owner,
            lhs,
            expr,
            src_fields,
            dst_fields,
            precondition,
            redop,
            reduction_fold,
            Vec::new(),
            tracing_srcs,
            tracing_dsts,
        );
    }

    /// Record a gather/scatter copy; identical to [Self::record_issue_copy]
    /// apart from the indirection payloads.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_indirect(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        indirections: Vec<u64>,
        precondition: Event,
        tracing_srcs: &[TracedView],
        tracing_dsts: &[TracedView],
    ) {
        self.record_copy_like(
            owner,
            lhs,
            expr,
            src_fields,
            dst_fields,
            precondition,
            ReductionOpId(0),
            false,
            indirections,
            tracing_srcs,
            tracing_dsts,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn record_copy_like(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        precondition: Event,
        redop: ReductionOpId,
        reduction_fold: bool,
        indirections: Vec<u64>,
        tracing_srcs: &[TracedView],
        tracing_dsts: &[TracedView],
    ) {
        let mut inner = self.inner.lock();
        let precondition = inner.find_event(precondition);
        let lhs = inner.convert_event(lhs);
        inner.insert_instruction(Instruction::IssueCopy {
            lhs,
            expr,
            src_fields: src_fields.to_vec(),
            dst_fields: dst_fields.to_vec(),
            precondition,
            redop,
            reduction_fold,
            indirections,
            owner,
        });
        for (view, tree, eq, mask) in tracing_srcs {
            inner
                .copy_views
                .entry(lhs)
                .or_default()
                .entry(*view)
                .or_default()
                .push((expr, mask.clone()));
            inner.add_view_user(
                *view,
                ViewUser {
                    usage: RegionUsage::read_only(),
                    entry: lhs,
                    expr,
                    mask: mask.clone(),
                },
            );
            if redop.0 != 0 {
                // Applying pending reductions consumes them.
                inner.consume_reduction(*view, *eq, mask);
            } else {
                inner.update_valid_views(*view, *tree, *eq, RegionUsage::read_only(), mask);
            }
        }
        for (view, tree, eq, mask) in tracing_dsts {
            inner
                .copy_views
                .entry(lhs)
                .or_default()
                .entry(*view)
                .or_default()
                .push((expr, mask.clone()));
            inner.add_view_user(
                *view,
                ViewUser {
                    usage: RegionUsage::read_write(),
                    entry: lhs,
                    expr,
                    mask: mask.clone(),
                },
            );
            inner.update_valid_views(*view, *tree, *eq, RegionUsage::read_write(), mask);
        }
    }

    /// Record an issued fill: fill views are the value sources, `tracing_dsts`
    /// the instance views written.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_fill(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        expr: ExprId,
        fields: &[CopyField],
        value: &[u8],
        precondition: Event,
        fill_srcs: &[(ViewId, FieldMask)],
        tracing_dsts: &[TracedView],
    ) {
        let mut inner = self.inner.lock();
        let precondition = inner.find_event(precondition);
        let lhs = inner.convert_event(lhs);
        inner.insert_instruction(Instruction::IssueFill {
            lhs,
            expr,
            fields: fields.to_vec(),
            value: value.to_vec(),
            precondition,
            owner,
        });
        for (view, mask) in fill_srcs {
            inner.record_fill_view(*view, mask);
        }
        for (view, tree, eq, mask) in tracing_dsts {
            inner
                .copy_views
                .entry(lhs)
                .or_default()
                .entry(*view)
                .or_default()
                .push((expr, mask.clone()));
            inner.add_view_user(
                *view,
                ViewUser {
                    usage: RegionUsage::write_discard(),
                    entry: lhs,
                    expr,
                    mask: mask.clone(),
                },
            );
            inner.update_valid_views(*view, *tree, *eq, RegionUsage::write_discard(), mask);
        }
    }

    /// Record a view use by a traced operation's region requirement.
    #[allow(clippy::too_many_arguments)]
    pub fn record_op_view(
        &self,
        tlid: TraceLocalId,
        view: ViewId,
        tree: RegionTreeId,
        eq: EqSetId,
        expr: ExprId,
        usage: RegionUsage,
        mask: &FieldMask,
        update_validity: bool,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner.entry_of(tlid);
        inner
            .op_views
            .entry(tlid)
            .or_default()
            .entry(view)
            .or_default()
            .push((expr, mask.clone()));
        inner.add_view_user(
            view,
            ViewUser {
                usage,
                entry,
                expr,
                mask: mask.clone(),
            },
        );
        if update_validity {
            inner.update_valid_views(view, tree, eq, usage, mask);
        }
    }

    /// A fill view was consulted for its value.
    pub fn record_fill_view(&self, view: ViewId, mask: &FieldMask) {
        self.inner.lock().record_fill_view(view, mask);
    }

    /// The template itself established `view` as a valid fill-value source.
    pub fn record_post_fill_view(&self, view: ViewId, mask: &FieldMask) {
        let mut inner = self.inner.lock();
        match inner.post_fill_views.iter_mut().find(|(v, _)| *v == view) {
            Some((_, m)) => {
                m.or_assign(mask);
            }
            None => inner.post_fill_views.push((view, mask.clone())),
        }
    }

    pub fn record_set_op_sync_event(&self, lhs: Event, tlid: TraceLocalId) {
        let mut inner = self.inner.lock();
        let lhs = inner.convert_event(lhs);
        inner.insert_instruction(Instruction::SetOpSyncEvent { lhs, owner: tlid });
    }

    pub fn record_complete_replay(&self, tlid: TraceLocalId, rhs: Event) {
        let mut inner = self.inner.lock();
        let rhs = inner.find_event(rhs);
        inner.dummy_slot();
        inner.insert_instruction(Instruction::CompleteReplay { owner: tlid, rhs });
    }

    /// Freeze the mapper's decisions for a traced task.
    pub fn record_mapper_output(
        &self,
        tlid: TraceLocalId,
        output: &MapTaskOutput,
        physical_instances: Vec<InstanceSet>,
    ) {
        let mut inner = self.inner.lock();
        inner.cached_mappings.insert(
            tlid,
            CachedMapping {
                chosen_variant: output.chosen_variant,
                task_priority: output.task_priority,
                postmap_task: output.postmap_task,
                target_procs: output.target_procs.clone(),
                physical_instances,
            },
        );
    }

    pub fn record_summary_info(
        &self,
        requirement: RegionRequirement,
        instances: InstanceSet,
        parent_index: u32,
    ) {
        self.inner.lock().summary_info.push(SummaryInfo {
            requirement,
            instances,
            parent_index,
        });
    }

    /// An event a collectable view must outlive; deferred deletion waits on
    /// these.
    pub fn record_outstanding_gc_event(&self, view: ViewId, term_event: Event) {
        self.inner
            .lock()
            .outstanding_gc_events
            .entry(view)
            .or_default()
            .push(term_event);
    }

    /// End recording. Decides replayability, optimizes the instruction
    /// graph, and yields the immutable template, or the reason it cannot be
    /// replayed.
    pub fn finalize(
        self,
        has_blocking_call: bool,
        replay_parallelism: usize,
    ) -> Result<PhysicalTemplate, NonReplayable> {
        let mut inner = self.inner.into_inner();
        if has_blocking_call {
            return Err(NonReplayable::BlockingCall);
        }
        // generate_conditions has been running incrementally through
        // update_valid_views; what remains is the replayability check.
        if !inner.pre.subsumed_by(&inner.post) {
            return Err(NonReplayable::PostdominanceFailed);
        }
        if !inner.pre_reductions.subsumed_by(&inner.consumed_reductions) {
            return Err(NonReplayable::UnconsumedReductions);
        }

        let optimized = opt::optimize(&mut inner, replay_parallelism);

        let slot_count = inner.slot_count;
        let events: IndexVec<EventSlot, AtomicU64> =
            (0..slot_count).map(|_| AtomicU64::new(0)).collect();
        let user_events: IndexVec<EventSlot, AtomicU64> =
            (0..slot_count).map(|_| AtomicU64::new(0)).collect();

        let mut pre = TraceConditionSet::new(inner.pre);
        let mut post = TraceConditionSet::new(inner.post);
        let mut pre_reductions = TraceConditionSet::new(inner.pre_reductions);
        pre.make_ready();
        post.make_ready();
        pre_reductions.make_ready();

        let tpl = PhysicalTemplate {
            slices: optimized.slices,
            slot_count,
            crossing_events: optimized.crossing_events,
            frontiers: optimized.frontiers,
            user_event_slots: inner.user_event_slots,
            memo_entries: inner.memo_entries,
            pre,
            post,
            pre_reductions,
            post_reductions: inner.post_reductions,
            consumed_reductions: inner.consumed_reductions,
            pre_fill_views: inner.pre_fill_views,
            post_fill_views: inner.post_fill_views,
            cached_mappings: inner.cached_mappings,
            summary_info: inner.summary_info,
            outstanding_gc_events: inner.outstanding_gc_events,
            events,
            user_events,
            operations: Mutex::new(BTreeMap::new()),
            fence_completion: Mutex::new(Event::NO_EVENT),
            replay_done: Mutex::new(Event::NO_EVENT),
        };
        if log::should_log() {
            log::log_trace_state(&tpl.dump());
        }
        Ok(tpl)
    }
}

impl RecorderInner {
    fn record_fill_view(&mut self, view: ViewId, mask: &FieldMask) {
        // If the template itself made this fill view valid, nothing to
        // require on entry.
        if let Some((_, m)) = self.post_fill_views.iter().find(|(v, _)| *v == view) {
            if m.contains(mask) {
                return;
            }
        }
        match self.pre_fill_views.iter_mut().find(|(v, _)| *v == view) {
            Some((_, m)) => {
                m.or_assign(mask);
            }
            None => self.pre_fill_views.push((view, mask.clone())),
        }
    }
}

/// The compiled, immutable artifact of one recorded iteration.
pub struct PhysicalTemplate {
    /// The instruction partition; one slice per replay worker.
    pub(crate) slices: Vec<Vec<Instruction>>,
    pub(crate) slot_count: usize,
    /// Slot → crossing slot for producer/consumer pairs split across
    /// slices; the crossing slot is backed by a fresh user event each
    /// replay.
    pub(crate) crossing_events: BTreeMap<EventSlot, EventSlot>,
    /// Slot → carried slot for dependences that cross iterations under
    /// recurrent replay.
    pub(crate) frontiers: BTreeMap<EventSlot, EventSlot>,
    pub(crate) user_event_slots: BTreeSet<EventSlot>,
    pub(crate) memo_entries: BTreeMap<TraceLocalId, EventSlot>,
    pre: TraceConditionSet,
    post: TraceConditionSet,
    pre_reductions: TraceConditionSet,
    #[allow(dead_code)]
    post_reductions: TraceViewSet,
    #[allow(dead_code)]
    consumed_reductions: TraceViewSet,
    pre_fill_views: Vec<(ViewId, FieldMask)>,
    #[allow(dead_code)]
    post_fill_views: Vec<(ViewId, FieldMask)>,
    cached_mappings: BTreeMap<TraceLocalId, CachedMapping>,
    summary_info: Vec<SummaryInfo>,
    outstanding_gc_events: BTreeMap<ViewId, Vec<Event>>,
    // Per-replay interpreter state.
    pub(crate) events: IndexVec<EventSlot, AtomicU64>,
    pub(crate) user_events: IndexVec<EventSlot, AtomicU64>,
    pub(crate) operations: Mutex<BTreeMap<TraceLocalId, Arc<dyn Memoizable>>>,
    pub(crate) fence_completion: Mutex<Event>,
    pub(crate) replay_done: Mutex<Event>,
}

impl PhysicalTemplate {
    /// Evaluate the template's preconditions against current runtime state.
    pub fn check_preconditions(&self, forest: &dyn RegionForest, oracle: &dyn MapperOracle) -> bool {
        if self.pre.view_set().has_refinements(forest) {
            return false;
        }
        if !self.pre.require(forest) {
            return false;
        }
        if !self.pre_reductions.require(forest) {
            return false;
        }
        for (view, mask) in &self.pre_fill_views {
            if !forest.fill_view_valid(*view, mask) {
                return false;
            }
        }
        for (tlid, mapping) in &self.cached_mappings {
            if !oracle.validate_cached_mapping(*tlid, mapping) {
                return false;
            }
        }
        true
    }

    /// Install the template's postconditions as current state, as the
    /// summary operations of a replayed iteration would.
    pub fn apply_postconditions(&self, forest: &dyn RegionForest) {
        self.post.ensure(forest);
    }

    /// The frozen mapper output for `tlid`, replayed verbatim.
    pub fn get_mapper_output(&self, tlid: TraceLocalId) -> Option<&CachedMapping> {
        self.cached_mappings.get(&tlid)
    }

    /// One entry per summary operation a replayed iteration must inject.
    pub fn summary_info(&self) -> &[SummaryInfo] {
        &self.summary_info
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub(crate) fn gc_events(&self) -> impl Iterator<Item = Event> + '_ {
        self.outstanding_gc_events
            .values()
            .flat_map(|evs| evs.iter().copied())
    }

    /// Human-readable instruction dump.
    pub fn dump(&self) -> String {
        use fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "template: {} slots, {} user events",
            self.slot_count,
            self.user_event_slots.len()
        );
        for (i, slice) in self.slices.iter().enumerate() {
            let _ = writeln!(out, " slice {i}:");
            for inst in slice {
                let _ = writeln!(out, "  {inst}");
            }
        }
        for (src, crossing) in &self.crossing_events {
            let _ = writeln!(
                out,
                " crossing: events[{}] -> events[{}]",
                src.index(),
                crossing.index()
            );
        }
        for (src, carried) in &self.frontiers {
            let _ = writeln!(
                out,
                " frontier: events[{}] -> events[{}]",
                src.index(),
                carried.index()
            );
        }
        out
    }
}

/// The physical side of one logical trace: the templates recorded for it
/// and the state machine that picks one to replay.
pub struct PhysicalTrace {
    inner: Mutex<PhysicalTraceInner>,
}

struct PhysicalTraceInner {
    templates: Vec<Arc<PhysicalTemplate>>,
    current: Option<Arc<PhysicalTemplate>>,
    recording: Option<TemplateRecorder>,
    nonreplayable_count: u32,
    previous_template_completion: Event,
    /// The template the previous completion came from; replaying the same
    /// template again makes the replay recurrent.
    previous_template: Option<Arc<PhysicalTemplate>>,
}

impl PhysicalTrace {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PhysicalTraceInner {
                templates: Vec::new(),
                current: None,
                recording: None,
                nonreplayable_count: 0,
                previous_template_completion: Event::NO_EVENT,
                previous_template: None,
            }),
        }
    }

    /// Find a recorded template whose preconditions hold and make it
    /// current. Returns `false` when none qualifies (or this trace has
    /// given up on templates altogether).
    pub fn check_template_preconditions(
        &self,
        forest: &dyn RegionForest,
        oracle: &dyn MapperOracle,
        nonreplayable_threshold: u32,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.nonreplayable_count >= nonreplayable_threshold {
            return false;
        }
        let found = inner
            .templates
            .iter()
            .find(|t| t.check_preconditions(forest, oracle))
            .cloned();
        inner.current = found;
        inner.current.is_some()
    }

    pub fn has_any_templates(&self) -> bool {
        !self.inner.lock().templates.is_empty()
    }

    pub fn current_template(&self) -> Option<Arc<PhysicalTemplate>> {
        self.inner.lock().current.clone()
    }

    /// Drop the cached current template so the next iteration re-records.
    pub fn clear_cached_template(&self) {
        self.inner.lock().current = None;
    }

    /// Begin recording a new template bound to `fence_event`.
    pub fn start_new_template(&self, fence_event: Event) {
        let mut inner = self.inner.lock();
        inner.recording = Some(TemplateRecorder::new(fence_event));
    }

    /// Run `f` against the template under recording, if any.
    pub fn with_recorder<R>(&self, f: impl FnOnce(&TemplateRecorder) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.recording.as_ref().map(f)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().recording.is_some()
    }

    /// Finalize the template under recording. On success it joins the
    /// template pool and becomes current; otherwise the non-replayable
    /// counter advances.
    pub fn fix_trace(
        &self,
        has_blocking_call: bool,
        replay_parallelism: usize,
    ) -> Result<(), NonReplayable> {
        let mut inner = self.inner.lock();
        let Some(recorder) = inner.recording.take() else {
            return Ok(());
        };
        match recorder.finalize(has_blocking_call, replay_parallelism) {
            Ok(tpl) => {
                let tpl = Arc::new(tpl);
                inner.templates.push(Arc::clone(&tpl));
                inner.current = Some(tpl);
                Ok(())
            }
            Err(reason) => {
                inner.nonreplayable_count += 1;
                log::log_trace_state(&format!("template not replayable: {reason}"));
                Err(reason)
            }
        }
    }

    pub fn nonreplayable_count(&self) -> u32 {
        self.inner.lock().nonreplayable_count
    }

    /// Initialize the current template for a replay. The replay is
    /// recurrent when the previous completed replay used the same template.
    pub fn initialize_template(
        &self,
        iface: &dyn crate::event::EventInterface,
        fence_completion: Event,
    ) -> Option<Arc<PhysicalTemplate>> {
        let inner = self.inner.lock();
        let current = inner.current.clone()?;
        let recurrent = inner
            .previous_template
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &current));
        drop(inner);
        current.initialize(iface, fence_completion, recurrent);
        Some(current)
    }

    /// Remember the completion of a finished replay for recurrent chaining.
    pub fn record_previous_template_completion(&self, completion: Event) {
        let mut inner = self.inner.lock();
        inner.previous_template_completion = completion;
        inner.previous_template = inner.current.clone();
    }

    pub fn previous_template_completion(&self) -> Event {
        self.inner.lock().previous_template_completion
    }
}

impl Default for PhysicalTrace {
    fn default() -> Self {
        Self::new()
    }
}
