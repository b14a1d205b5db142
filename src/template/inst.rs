//! Template instructions.
//!
//! A template is a linear sequence of instructions over a per-replay event
//! array. Instructions name events exclusively by dense [EventSlot] index so
//! each replay can rebind the array without rewriting the instruction
//! stream; slot 0 conventionally holds the current fence completion.

use crate::event::{Event, EventInterface};
use crate::forest::{CopyField, ExprId, RegionForest};
use crate::op::{Memoizable, ReductionOpId, TraceLocalId};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum::EnumDiscriminants;

index_vec::define_index_type! {
    /// An index into a template's per-replay event array.
    pub struct EventSlot = u32;
}

/// The slot every template reserves for its fence completion.
pub const FENCE_COMPLETION_SLOT: EventSlot = EventSlot::from_raw_unchecked(0);

/// The shared state one replay of a template runs against. Slices execute
/// concurrently; the partition guarantees each slot is stored by exactly one
/// slice before any other slice loads it, so plain release/acquire atomics
/// suffice.
pub(crate) struct ReplayContext<'a> {
    pub(crate) events: &'a IndexVec<EventSlot, AtomicU64>,
    pub(crate) user_events: &'a IndexVec<EventSlot, AtomicU64>,
    pub(crate) operations: &'a BTreeMap<TraceLocalId, Arc<dyn Memoizable>>,
    pub(crate) fence_completion: Event,
    pub(crate) iface: &'a dyn EventInterface,
    pub(crate) forest: &'a dyn RegionForest,
}

impl ReplayContext<'_> {
    pub(crate) fn load(&self, slot: EventSlot) -> Event {
        Event(self.events[slot].load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, slot: EventSlot, ev: Event) {
        self.events[slot].store(ev.0, Ordering::Release);
    }

    fn operation(&self, tlid: TraceLocalId) -> &Arc<dyn Memoizable> {
        self.operations
            .get(&tlid)
            .unwrap_or_else(|| panic!("no operation registered for trace-local id {tlid}"))
    }
}

/// A primitive step of a template.
#[derive(Clone, Debug, EnumDiscriminants)]
#[strum_discriminants(name(InstructionKind))]
pub enum Instruction {
    /// `events[lhs] = operations[owner].completion_event()`
    GetTermEvent { lhs: EventSlot, owner: TraceLocalId },
    /// `events[lhs] = user_events[lhs] = create_user_event()`
    CreateUserEvent { lhs: EventSlot, owner: TraceLocalId },
    /// `trigger_event(user_events[lhs], events[rhs])`
    TriggerEvent {
        lhs: EventSlot,
        rhs: EventSlot,
        owner: TraceLocalId,
    },
    /// `events[lhs] = merge_events(events[rhs]...)`
    MergeEvent {
        lhs: EventSlot,
        rhs: BTreeSet<EventSlot>,
        owner: TraceLocalId,
    },
    /// `events[lhs] = fence_completion`
    AssignFenceCompletion { lhs: EventSlot },
    /// `events[lhs] = expr.issue_copy(src, dst, events[precondition], ...)`
    IssueCopy {
        lhs: EventSlot,
        expr: ExprId,
        src_fields: Vec<CopyField>,
        dst_fields: Vec<CopyField>,
        precondition: EventSlot,
        redop: ReductionOpId,
        reduction_fold: bool,
        /// Indirection payloads for gather/scatter copies; empty for plain
        /// copies.
        indirections: Vec<u64>,
        owner: TraceLocalId,
    },
    /// `events[lhs] = expr.issue_fill(fields, value, events[precondition])`
    IssueFill {
        lhs: EventSlot,
        expr: ExprId,
        fields: Vec<CopyField>,
        value: Vec<u8>,
        precondition: EventSlot,
        owner: TraceLocalId,
    },
    /// `events[lhs] = operations[owner].sync_precondition()`
    SetOpSyncEvent { lhs: EventSlot, owner: TraceLocalId },
    /// `operations[owner].complete_replay(events[rhs])`
    CompleteReplay { owner: TraceLocalId, rhs: EventSlot },
}

impl Instruction {
    pub fn kind(&self) -> InstructionKind {
        self.into()
    }

    pub fn owner(&self) -> Option<TraceLocalId> {
        match self {
            Instruction::GetTermEvent { owner, .. }
            | Instruction::CreateUserEvent { owner, .. }
            | Instruction::TriggerEvent { owner, .. }
            | Instruction::MergeEvent { owner, .. }
            | Instruction::IssueCopy { owner, .. }
            | Instruction::IssueFill { owner, .. }
            | Instruction::SetOpSyncEvent { owner, .. }
            | Instruction::CompleteReplay { owner, .. } => Some(*owner),
            Instruction::AssignFenceCompletion { .. } => None,
        }
    }

    /// The slot this instruction stores to, if any.
    pub fn output_slot(&self) -> Option<EventSlot> {
        match self {
            Instruction::GetTermEvent { lhs, .. }
            | Instruction::CreateUserEvent { lhs, .. }
            | Instruction::MergeEvent { lhs, .. }
            | Instruction::AssignFenceCompletion { lhs }
            | Instruction::IssueCopy { lhs, .. }
            | Instruction::IssueFill { lhs, .. }
            | Instruction::SetOpSyncEvent { lhs, .. } => Some(*lhs),
            // A trigger writes through the *user event* at `lhs`, which was
            // stored when the user event was created, not here.
            Instruction::TriggerEvent { .. } | Instruction::CompleteReplay { .. } => None,
        }
    }

    /// The slots this instruction loads.
    pub fn input_slots(&self) -> SmallVec<[EventSlot; 4]> {
        match self {
            Instruction::TriggerEvent { rhs, .. } | Instruction::CompleteReplay { rhs, .. } => {
                SmallVec::from_slice(&[*rhs])
            }
            Instruction::MergeEvent { rhs, .. } => rhs.iter().copied().collect(),
            Instruction::IssueCopy { precondition, .. }
            | Instruction::IssueFill { precondition, .. } => SmallVec::from_slice(&[*precondition]),
            Instruction::GetTermEvent { .. }
            | Instruction::CreateUserEvent { .. }
            | Instruction::AssignFenceCompletion { .. }
            | Instruction::SetOpSyncEvent { .. } => SmallVec::new(),
        }
    }

    /// Rewrite every input slot through `f`.
    pub fn rewrite_inputs(&mut self, f: impl Fn(EventSlot) -> EventSlot) {
        match self {
            Instruction::TriggerEvent { rhs, .. } | Instruction::CompleteReplay { rhs, .. } => {
                *rhs = f(*rhs);
            }
            Instruction::MergeEvent { rhs, .. } => {
                *rhs = rhs.iter().map(|&s| f(s)).collect();
            }
            Instruction::IssueCopy { precondition, .. }
            | Instruction::IssueFill { precondition, .. } => {
                *precondition = f(*precondition);
            }
            Instruction::GetTermEvent { .. }
            | Instruction::CreateUserEvent { .. }
            | Instruction::AssignFenceCompletion { .. }
            | Instruction::SetOpSyncEvent { .. } => (),
        }
    }

    pub(crate) fn execute(&self, ctx: &ReplayContext<'_>) {
        match self {
            Instruction::GetTermEvent { lhs, owner } => {
                let ev = ctx.operation(*owner).completion_event();
                ctx.store(*lhs, ev);
            }
            Instruction::CreateUserEvent { lhs, .. } => {
                let ev = ctx.iface.create_user_event();
                ctx.user_events[*lhs].store(ev.0, Ordering::Release);
                ctx.store(*lhs, ev);
            }
            Instruction::TriggerEvent { lhs, rhs, .. } => {
                let user = Event(ctx.user_events[*lhs].load(Ordering::Acquire));
                ctx.iface.trigger_event(user, ctx.load(*rhs));
            }
            Instruction::MergeEvent { lhs, rhs, .. } => {
                let inputs: Vec<Event> = rhs.iter().map(|&s| ctx.load(s)).collect();
                ctx.store(*lhs, ctx.iface.merge_events(&inputs));
            }
            Instruction::AssignFenceCompletion { lhs } => {
                ctx.store(*lhs, ctx.fence_completion);
            }
            Instruction::IssueCopy {
                lhs,
                expr,
                src_fields,
                dst_fields,
                precondition,
                redop,
                reduction_fold,
                indirections,
                ..
            } => {
                let ev = ctx.forest.issue_copy(
                    *expr,
                    src_fields,
                    dst_fields,
                    indirections,
                    ctx.load(*precondition),
                    *redop,
                    *reduction_fold,
                );
                ctx.store(*lhs, ev);
            }
            Instruction::IssueFill {
                lhs,
                expr,
                fields,
                value,
                precondition,
                ..
            } => {
                let ev = ctx
                    .forest
                    .issue_fill(*expr, fields, value, ctx.load(*precondition));
                ctx.store(*lhs, ev);
            }
            Instruction::SetOpSyncEvent { lhs, owner } => {
                let ev = ctx.operation(*owner).sync_precondition();
                ctx.store(*lhs, ev);
            }
            Instruction::CompleteReplay { owner, rhs } => {
                ctx.operation(*owner).complete_replay(ctx.load(*rhs));
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::GetTermEvent { lhs, owner } => {
                write!(f, "events[{}] = operations[{owner}].term_event()", lhs.index())
            }
            Instruction::CreateUserEvent { lhs, owner } => {
                write!(f, "events[{}] = create_user_event() (for {owner})", lhs.index())
            }
            Instruction::TriggerEvent { lhs, rhs, .. } => {
                write!(
                    f,
                    "trigger_event(events[{}], events[{}])",
                    lhs.index(),
                    rhs.index()
                )
            }
            Instruction::MergeEvent { lhs, rhs, .. } => {
                write!(f, "events[{}] = merge_events(", lhs.index())?;
                for (i, s) in rhs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "events[{}]", s.index())?;
                }
                write!(f, ")")
            }
            Instruction::AssignFenceCompletion { lhs } => {
                write!(f, "events[{}] = fence_completion", lhs.index())
            }
            Instruction::IssueCopy {
                lhs,
                expr,
                precondition,
                ..
            } => write!(
                f,
                "events[{}] = copy(expr {}, pre events[{}])",
                lhs.index(),
                expr.0,
                precondition.index()
            ),
            Instruction::IssueFill {
                lhs,
                expr,
                precondition,
                ..
            } => write!(
                f,
                "events[{}] = fill(expr {}, pre events[{}])",
                lhs.index(),
                expr.0,
                precondition.index()
            ),
            Instruction::SetOpSyncEvent { lhs, owner } => {
                write!(f, "events[{}] = operations[{owner}].sync_event()", lhs.index())
            }
            Instruction::CompleteReplay { owner, rhs } => {
                write!(f, "operations[{owner}].complete_replay(events[{}])", rhs.index())
            }
        }
    }
}
