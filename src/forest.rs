//! The seam to the region-tree forest.
//!
//! The forest owns views, equivalence sets and index-space expressions; the
//! tracing subsystem holds non-owning identifiers and asks the forest for
//! validity information and for copies/fills to be issued. When the forest
//! drops or refines any of these, it must invalidate the trace cache.

use crate::event::Event;
use crate::mask::FieldMask;
use crate::op::ReductionOpId;

/// Identity of an instance view: a physical placement of a region's data.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ViewId(pub u64);

/// Identity of an equivalence set: a grouping of sub-extents of a region by
/// uniform valid-data state.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EqSetId(pub u64);

/// Identity of an index-space expression.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExprId(pub u64);

/// Identity of a region tree.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegionTreeId(pub u32);

/// A region requirement as the tracing subsystem sees it: which tree it
/// names and which fields it covers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionRequirement {
    pub tree: RegionTreeId,
    pub fields: FieldMask,
}

/// The set of physical instances an operation was mapped to for one region
/// requirement.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSet {
    pub views: Vec<(ViewId, FieldMask)>,
}

/// A snapshot of version state for a requirement, used to detect that the
/// forest has moved on since a template was captured.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VersionInfo {
    pub version: u64,
}

/// One field of a copy or fill: which instance it lives in and its offset
/// within the field space.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CopyField {
    pub inst: ViewId,
    pub field: usize,
}

/// The operations the template needs from the region-tree forest.
pub trait RegionForest: Send + Sync {
    /// The views currently valid for `eq`, with the fields for which each
    /// holds valid data.
    fn valid_views(&self, eq: EqSetId) -> Vec<(ViewId, FieldMask)>;

    /// Is this fill view still a valid source of fill data for `mask`?
    fn fill_view_valid(&self, view: ViewId, mask: &FieldMask) -> bool;

    /// Has `eq` been refined since it was handed out?
    fn has_refinements(&self, eq: EqSetId) -> bool;

    /// Snapshot the current version state for `req`.
    fn version_info(&self, req: &RegionRequirement) -> VersionInfo;

    /// Record that `view` now holds valid data for `mask` within `eq`.
    fn update_validity(&self, view: ViewId, eq: EqSetId, mask: &FieldMask);

    /// Issue a copy over `expr` and return its completion event.
    /// `indirections` carries the gather/scatter payloads of an indirect
    /// copy; it is empty for a plain field copy.
    #[allow(clippy::too_many_arguments)]
    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        indirections: &[u64],
        precondition: Event,
        redop: ReductionOpId,
        reduction_fold: bool,
    ) -> Event;

    /// Issue a fill of `value` over `expr` and return its completion event.
    fn issue_fill(
        &self,
        expr: ExprId,
        fields: &[CopyField],
        value: &[u8],
        precondition: Event,
    ) -> Event;
}
