//! Lock-step control-flow simulation for GPU shader debugging.
//!
//! Shader invocations execute in groups ("waves"/"subgroups") whose threads
//! run in lock-step until control-flow makes them disagree on the next
//! instruction. This crate models that behavior the way maximal-reconvergence
//! execution rules mandate it, for use by a shader debugger replaying
//! externally-observed execution:
//!
//! * a [`Tangle`] is a set of threads currently guaranteed to be at the same
//!   execution point, together with the stack of merge points they will
//!   reconverge at
//! * threads *diverge* when a tangle's threads take different control-flow
//!   paths (conditional branches, switches, kills), splitting the tangle
//! * threads *reconverge* when independently-diverged tangles arrive back at
//!   a shared merge point (selection/loop merges, or the instruction after a
//!   function call), merging the tangles back together
//!
//! [`ControlFlow`] owns the live [`TangleGroup`] and drives it to a fixed
//! point from per-thread execution traces (see [`ControlFlow::update_state`]).
//! The bytecode interpreter deciding *what* each thread executes is an
//! external collaborator: it pushes merge points, function return points,
//! divergence and kill notifications directly onto tangles obtained via
//! [`ControlFlow::tangles_mut`], then asks the engine to reconcile.
//!
//! The independent [`gpu_addr`] module maps a GPU virtual address space back
//! to the resources occupying it, for resolving raw pointers seen during
//! debugging.

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub mod flow;
pub mod gpu_addr;
pub mod tangle;

pub use flow::ControlFlow;
pub use tangle::{Tangle, TangleGroup};

/// Convenience type alias for `IndexMap` using `FxHasher`, i.e. a hash map
/// with deterministic (insertion) iteration order.
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// An instruction position in the shader being debugged, as reported by the
/// interpreter (an instruction index, not a byte offset).
pub type ExecutionPoint = u32;

/// Identity of a single thread (invocation) in the simulated group, fixed at
/// [`ControlFlow`] construction.
pub type ThreadIndex = u32;

/// Sentinel for "no execution point": the initial position of every thread,
/// and the bottom of every merge-point stack (meaning "no enclosing merge").
pub const INVALID_EXECUTION_POINT: ExecutionPoint = ExecutionPoint::MAX;

/// Sentinel for "no thread".
pub const INVALID_THREAD_INDEX: ThreadIndex = ThreadIndex::MAX;

/// The execution points one thread passed through since the last
/// [`ControlFlow::update_state`] call, oldest first.
pub type EnteredExecutionPoints = Vec<ExecutionPoint>;

/// Per-thread execution history fed to [`ControlFlow::update_state`], which
/// consumes every entry of every thread by the time it returns.
pub type ThreadExecutionStates = FxIndexMap<ThreadIndex, EnteredExecutionPoints>;

/// A single simulated thread: identity, current position, liveness.
///
/// Owned by exactly one [`Tangle`] at any time; threads move between tangles
/// by copy + removal during divergence splits and convergence merges.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ThreadReference {
    pub id: ThreadIndex,
    pub exec_point: ExecutionPoint,
    pub alive: bool,
}

impl ThreadReference {
    pub fn new(id: ThreadIndex) -> Self {
        Self { id, exec_point: INVALID_EXECUTION_POINT, alive: true }
    }
}
