//! Mapper output caching.
//!
//! During recording the template freezes every mapping decision the mapper
//! made; during replay those decisions are returned verbatim and the mapper
//! is never consulted. A template only stays valid while the frozen
//! decisions could still have been made, which the [MapperOracle] checks as
//! part of the precondition test.

use crate::forest::InstanceSet;
use crate::op::TraceLocalId;

/// A processor the mapper can target.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Processor(pub u64);

/// A task variant chosen by the mapper.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VariantId(pub u32);

/// What the mapper decided for one task: the subset of its output the
/// replay must reproduce.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapTaskOutput {
    pub chosen_variant: VariantId,
    pub task_priority: i32,
    pub postmap_task: bool,
    pub target_procs: Vec<Processor>,
}

/// The frozen mapping for one traced task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachedMapping {
    pub chosen_variant: VariantId,
    pub task_priority: i32,
    pub postmap_task: bool,
    pub target_procs: Vec<Processor>,
    pub physical_instances: Vec<InstanceSet>,
}

/// Validates that a cached mapping is still admissible: the variant still
/// exists and the target processors are still live. Any change must
/// invalidate the template.
pub trait MapperOracle: Send + Sync {
    fn validate_cached_mapping(&self, tlid: TraceLocalId, mapping: &CachedMapping) -> bool;
}

/// An oracle that accepts every cached mapping, for runtimes whose mapper
/// state never changes between iterations.
pub struct StaticMapperOracle;

impl MapperOracle for StaticMapperOracle {
    fn validate_cached_mapping(&self, _tlid: TraceLocalId, _mapping: &CachedMapping) -> bool {
        true
    }
}
