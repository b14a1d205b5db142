//! Deterministic in-process collaborators for testing.
//!
//! [TestEvents] is an event runtime that records the dependence edges it is
//! handed, so tests can assert on the happens-before structure a replay
//! produces. [TestForest] records every issued copy and fill and exposes a
//! mutable validity map. [TestOp] is a canned [Memoizable].

use crate::event::{Event, EventInterface};
use crate::forest::{
    CopyField, EqSetId, ExprId, RegionForest, RegionRequirement, VersionInfo, ViewId,
};
use crate::mask::FieldMask;
use crate::op::{Memoizable, ReductionOpId, TraceLocalId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct TestEventsInner {
    next: u64,
    /// Predecessor edges: event -> the events it completes after.
    preds: HashMap<Event, Vec<Event>>,
    /// User events that have been created but not yet triggered.
    untriggered: HashSet<Event>,
}

/// An event runtime whose events are plain counters and whose dependence
/// edges are remembered for later inspection.
#[derive(Default)]
pub struct TestEvents {
    inner: Mutex<TestEventsInner>,
}

impl TestEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mint a fresh event with no predecessors, e.g. an operation's term
    /// event.
    pub fn fresh(&self) -> Event {
        let mut inner = self.inner.lock();
        inner.next += 1;
        Event(inner.next)
    }

    /// Mint a fresh event recorded as completing after all of `preds`.
    pub fn derived(&self, preds: &[Event]) -> Event {
        let e = self.fresh();
        let mut inner = self.inner.lock();
        inner
            .preds
            .insert(e, preds.iter().copied().filter(|p| p.exists()).collect());
        e
    }

    /// Does `earlier` happen-before `later` in the recorded event graph?
    pub fn happens_before(&self, earlier: Event, later: Event) -> bool {
        let inner = self.inner.lock();
        let mut stack = vec![later];
        let mut seen = HashSet::new();
        while let Some(e) = stack.pop() {
            if !seen.insert(e) {
                continue;
            }
            if let Some(preds) = inner.preds.get(&e) {
                for &p in preds {
                    if p == earlier {
                        return true;
                    }
                    stack.push(p);
                }
            }
        }
        false
    }

    /// The direct predecessors recorded for `e`.
    pub fn preds_of(&self, e: Event) -> Vec<Event> {
        self.inner.lock().preds.get(&e).cloned().unwrap_or_default()
    }

    pub fn untriggered_count(&self) -> usize {
        self.inner.lock().untriggered.len()
    }
}

impl EventInterface for TestEvents {
    fn create_user_event(&self) -> Event {
        let mut inner = self.inner.lock();
        inner.next += 1;
        let e = Event(inner.next);
        inner.untriggered.insert(e);
        e
    }

    fn trigger_event(&self, user: Event, precondition: Event) {
        let mut inner = self.inner.lock();
        if !inner.untriggered.remove(&user) {
            panic!("triggered unknown or already-triggered user event {user:?}");
        }
        if precondition.exists() {
            inner.preds.entry(user).or_default().push(precondition);
        }
    }

    fn merge_events(&self, preconditions: &[Event]) -> Event {
        let live: Vec<Event> = preconditions.iter().copied().filter(Event::exists).collect();
        match live.as_slice() {
            [] => Event::NO_EVENT,
            [e] => *e,
            _ => self.derived(&live),
        }
    }
}

/// A copy recorded by [TestForest].
#[derive(Clone, Debug)]
pub struct IssuedCopy {
    pub expr: ExprId,
    pub src_fields: Vec<CopyField>,
    pub dst_fields: Vec<CopyField>,
    pub indirections: Vec<u64>,
    pub precondition: Event,
    pub completion: Event,
    pub redop: ReductionOpId,
    pub reduction_fold: bool,
}

/// A fill recorded by [TestForest].
#[derive(Clone, Debug)]
pub struct IssuedFill {
    pub expr: ExprId,
    pub fields: Vec<CopyField>,
    pub value: Vec<u8>,
    pub precondition: Event,
    pub completion: Event,
}

#[derive(Default)]
struct TestForestInner {
    valid: HashMap<EqSetId, BTreeMap<ViewId, FieldMask>>,
    fill_valid: HashMap<ViewId, FieldMask>,
    refined: HashSet<EqSetId>,
    version: u64,
    copies: Vec<IssuedCopy>,
    fills: Vec<IssuedFill>,
}

/// A region-tree forest whose validity state is set directly by tests and
/// which logs every copy and fill it is asked to issue.
pub struct TestForest {
    inner: Mutex<TestForestInner>,
    events: Arc<TestEvents>,
}

impl TestForest {
    pub fn new() -> Self {
        Self::with_events(TestEvents::new())
    }

    pub fn with_events(events: Arc<TestEvents>) -> Self {
        Self {
            inner: Mutex::new(TestForestInner::default()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<TestEvents> {
        &self.events
    }

    pub fn set_valid(&self, view: ViewId, eq: EqSetId, mask: &FieldMask) {
        self.inner
            .lock()
            .valid
            .entry(eq)
            .or_default()
            .entry(view)
            .or_default()
            .or_assign(mask);
    }

    pub fn clear_valid(&self) {
        self.inner.lock().valid.clear();
    }

    pub fn set_fill_valid(&self, view: ViewId, mask: &FieldMask) {
        self.inner
            .lock()
            .fill_valid
            .entry(view)
            .or_default()
            .or_assign(mask);
    }

    pub fn refine(&self, eq: EqSetId) {
        let mut inner = self.inner.lock();
        inner.refined.insert(eq);
        inner.version += 1;
    }

    pub fn copies(&self) -> Vec<IssuedCopy> {
        self.inner.lock().copies.clone()
    }

    pub fn fills(&self) -> Vec<IssuedFill> {
        self.inner.lock().fills.clone()
    }
}

impl RegionForest for TestForest {
    fn valid_views(&self, eq: EqSetId) -> Vec<(ViewId, FieldMask)> {
        self.inner
            .lock()
            .valid
            .get(&eq)
            .map(|views| views.iter().map(|(v, m)| (*v, m.clone())).collect())
            .unwrap_or_default()
    }

    fn fill_view_valid(&self, view: ViewId, mask: &FieldMask) -> bool {
        self.inner
            .lock()
            .fill_valid
            .get(&view)
            .is_some_and(|m| m.contains(mask))
    }

    fn has_refinements(&self, eq: EqSetId) -> bool {
        self.inner.lock().refined.contains(&eq)
    }

    fn version_info(&self, _req: &RegionRequirement) -> VersionInfo {
        VersionInfo {
            version: self.inner.lock().version,
        }
    }

    fn update_validity(&self, view: ViewId, eq: EqSetId, mask: &FieldMask) {
        self.set_valid(view, eq, mask);
    }

    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        indirections: &[u64],
        precondition: Event,
        redop: ReductionOpId,
        reduction_fold: bool,
    ) -> Event {
        let completion = self.events.derived(&[precondition]);
        self.inner.lock().copies.push(IssuedCopy {
            expr,
            src_fields: src_fields.to_vec(),
            dst_fields: dst_fields.to_vec(),
            indirections: indirections.to_vec(),
            precondition,
            completion,
            redop,
            reduction_fold,
        });
        completion
    }

    fn issue_fill(
        &self,
        expr: ExprId,
        fields: &[CopyField],
        value: &[u8],
        precondition: Event,
    ) -> Event {
        let completion = self.events.derived(&[precondition]);
        self.inner.lock().fills.push(IssuedFill {
            expr,
            fields: fields.to_vec(),
            value: value.to_vec(),
            precondition,
            completion,
        });
        completion
    }
}

impl Default for TestForest {
    fn default() -> Self {
        Self::new()
    }
}

/// A canned memoizable operation.
pub struct TestOp {
    tlid: TraceLocalId,
    term: Event,
    sync: Event,
    completed: Mutex<Option<Event>>,
}

impl TestOp {
    pub fn new(tlid: TraceLocalId, term: Event) -> Arc<Self> {
        Arc::new(Self {
            tlid,
            term,
            sync: Event::NO_EVENT,
            completed: Mutex::new(None),
        })
    }

    pub fn with_sync(tlid: TraceLocalId, term: Event, sync: Event) -> Arc<Self> {
        Arc::new(Self {
            tlid,
            term,
            sync,
            completed: Mutex::new(None),
        })
    }

    /// The completion event handed over by `complete_replay`, if any.
    pub fn completed(&self) -> Option<Event> {
        *self.completed.lock()
    }
}

impl Memoizable for TestOp {
    fn trace_local_id(&self) -> TraceLocalId {
        self.tlid
    }

    fn completion_event(&self) -> Event {
        self.term
    }

    fn sync_precondition(&self) -> Event {
        self.sync
    }

    fn complete_replay(&self, completion: Event) {
        *self.completed.lock() = Some(completion);
    }
}
