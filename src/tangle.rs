//! Tangles: sets of threads executing in lock-step.
//!
//! A [`Tangle`] guarantees that, while it is alive and active, all of its
//! threads sit at the same execution point - that equality is exactly what
//! "not diverged" means. The interpreter driving the simulation talks to
//! tangles through a narrow public surface (membership/position queries and
//! the four external notifications: divergence, thread death, merge points,
//! function return points); everything else is reserved for the
//! [`ControlFlow`](crate::ControlFlow) orchestrator in this crate.

use crate::{ExecutionPoint, ThreadIndex, ThreadReference};
use itertools::Itertools as _;
use smallvec::SmallVec;

/// The full live set of [`Tangle`]s at a point in time.
///
/// Order carries no meaning but is preserved, for deterministic iteration.
pub type TangleGroup = Vec<Tangle>;

/// A set of threads currently guaranteed to execute in lock-step, plus the
/// merge points they are expected to reconverge at.
///
/// Status flags:
/// * `alive`: the tangle still holds threads that are executing (a tangle
///   with no live threads is dead, and dead tangles hold no threads at all)
/// * `active`: the tangle's threads may currently advance (inactive+alive
///   means parked at a merge point, waiting for entangled siblings)
/// * `diverged`: the threads disagree on their execution point and the
///   tangle must be split
/// * `converged`: every thread has reached the top merge point
/// * `state_changed`: sticky dirty bit, set by (nearly) every mutation and
///   cleared only by the orchestrator; drives fixed-point termination
#[derive(Clone, Debug)]
pub struct Tangle {
    id: u32,
    thread_refs: SmallVec<[ThreadReference; 8]>,
    merge_points: SmallVec<[ExecutionPoint; 4]>,
    function_return_points: SmallVec<[ExecutionPoint; 4]>,
    active: bool,
    alive: bool,
    diverged: bool,
    converged: bool,
    state_changed: bool,
}

impl Tangle {
    pub(crate) fn new(id: u32) -> Self {
        Tangle {
            id,
            thread_refs: SmallVec::new(),
            merge_points: SmallVec::new(),
            function_return_points: SmallVec::new(),
            active: false,
            alive: false,
            diverged: false,
            converged: false,
            state_changed: false,
        }
    }

    /// Unique identity, assigned once at creation and never reused.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_alive_active(&self) -> bool {
        self.alive && self.active
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// The execution point shared by this tangle's threads.
    ///
    /// Reads the first thread: meaningful for any tangle that is not
    /// diverged, which the orchestrator establishes before relying on it.
    pub fn execution_point(&self) -> ExecutionPoint {
        self.thread_refs.first().expect("tangle has no threads").exec_point
    }

    pub fn thread_count(&self) -> usize {
        self.thread_refs.len()
    }

    pub fn thread_refs(&self) -> &[ThreadReference] {
        &self.thread_refs
    }

    pub fn contains_thread(&self, thread_id: ThreadIndex) -> bool {
        self.thread_refs.iter().any(|t| t.id == thread_id)
    }

    /// External notification: this tangle executed an instruction which may
    /// have made its threads disagree on the next execution point.
    pub fn set_diverged(&mut self, value: bool) {
        self.diverged = value;
        self.state_changed = true;
    }

    /// External notification: `thread_id` stopped executing (exit/kill).
    ///
    /// The thread stays in the tangle; only deactivation bookkeeping removes
    /// threads.
    pub fn set_thread_dead(&mut self, thread_id: ThreadIndex) {
        self.set_thread_alive(thread_id, false);
        self.state_changed = true;
    }

    /// Push a reconvergence target for a branch/loop construct.
    ///
    /// Idempotent against the current top only: several threads of one
    /// tangle independently reporting the same merge scope must not stack
    /// duplicates, but a deeper duplicate (re-entering the same loop header
    /// from a different nested scope) is deliberately left alone.
    pub fn add_merge_point(&mut self, exec_point: ExecutionPoint) {
        if self.merge_points.last() != Some(&exec_point) {
            self.merge_points.push(exec_point);
        }
        self.state_changed = true;
    }

    /// Push the instruction after a function call, onto both stacks: a call
    /// always opens a new nested scope distinct from its caller's, so there
    /// is no top-deduplication here.
    pub fn add_function_return_point(&mut self, exec_point: ExecutionPoint) {
        self.merge_points.push(exec_point);
        self.function_return_points.push(exec_point);
        self.state_changed = true;
    }

    pub(crate) fn set_thread_execution_point(
        &mut self,
        thread_id: ThreadIndex,
        exec_point: ExecutionPoint,
    ) {
        let thread_ref = self
            .thread_refs
            .iter_mut()
            .find(|t| t.id == thread_id)
            .unwrap_or_else(|| panic!("thread {thread_id} not found in tangle"));
        if thread_ref.exec_point != exec_point {
            thread_ref.exec_point = exec_point;
            self.state_changed = true;
        }
    }

    pub(crate) fn set_thread_alive(&mut self, thread_id: ThreadIndex, value: bool) {
        let thread_ref = self
            .thread_refs
            .iter_mut()
            .find(|t| t.id == thread_id)
            .unwrap_or_else(|| panic!("thread {thread_id} not found in tangle"));
        if thread_ref.alive != value {
            thread_ref.alive = value;
            self.state_changed = true;
        }
    }

    /// Compare every thread's execution point against the first thread's,
    /// recording whether any mismatch exists.
    ///
    /// Must run before convergence checks each step: a branch target can
    /// legally coincide with a merge point address, and only divergence-first
    /// ordering classifies that correctly.
    pub(crate) fn check_for_divergence(&mut self) {
        if self.thread_refs.is_empty() {
            return;
        }
        self.diverged = !self.thread_refs.iter().map(|t| t.exec_point).all_equal();
    }

    /// Truncate the merge-point stack to end at the *last* (nearest-to-top)
    /// occurrence of `exec_point`, inclusive.
    ///
    /// A function return may leave nested, abandoned scopes behind (e.g. an
    /// early exit inside the callee); they are discarded along with the
    /// return. `exec_point` must be present on the stack.
    pub(crate) fn prune_merge_points(&mut self, exec_point: ExecutionPoint) {
        let index = self
            .merge_points
            .iter()
            .rposition(|&p| p == exec_point)
            .expect("prune target must be on the merge point stack");
        self.merge_points.truncate(index + 1);
    }

    /// Two tangles are entangled iff this tangle's merge-point stack is a
    /// prefix of `other`'s: one is then logically nested in the future of
    /// the other, and the two must not both be independently reactivated.
    pub(crate) fn entangled(&self, other: &Tangle) -> bool {
        other.merge_points.starts_with(&self.merge_points)
    }

    pub(crate) fn merge_point(&self) -> ExecutionPoint {
        *self.merge_points.last().expect("merge point stack is empty")
    }

    pub(crate) fn merge_points(&self) -> &[ExecutionPoint] {
        &self.merge_points
    }

    pub(crate) fn pop_merge_point(&mut self) {
        self.merge_points.pop();
        self.state_changed = true;
    }

    pub(crate) fn set_merge_points(&mut self, points: &[ExecutionPoint]) {
        self.merge_points = SmallVec::from_slice(points);
        self.state_changed = true;
    }

    pub(crate) fn clear_merge_points(&mut self) {
        self.merge_points.clear();
        self.state_changed = true;
    }

    pub(crate) fn function_return_point(&self) -> ExecutionPoint {
        *self.function_return_points.last().expect("function return point stack is empty")
    }

    pub(crate) fn function_return_points(&self) -> &[ExecutionPoint] {
        &self.function_return_points
    }

    pub(crate) fn pop_function_return_point(&mut self) {
        self.function_return_points.pop();
        self.state_changed = true;
    }

    pub(crate) fn set_function_return_points(&mut self, points: &[ExecutionPoint]) {
        self.function_return_points = SmallVec::from_slice(points);
        self.state_changed = true;
    }

    pub(crate) fn clear_function_return_points(&mut self) {
        self.function_return_points.clear();
        self.state_changed = true;
    }

    pub(crate) fn add_thread_reference(&mut self, thread_ref: ThreadReference) {
        self.thread_refs.push(thread_ref);
        self.state_changed = true;
    }

    pub(crate) fn remove_thread_reference(&mut self, thread_id: ThreadIndex) {
        self.thread_refs.retain(|t| t.id != thread_id);
        self.state_changed = true;
    }

    pub(crate) fn append_thread_references(&mut self, thread_refs: &[ThreadReference]) {
        self.thread_refs.extend_from_slice(thread_refs);
        self.state_changed = true;
    }

    pub(crate) fn clear_thread_references(&mut self) {
        self.thread_refs.clear();
        self.state_changed = true;
    }

    pub(crate) fn set_alive(&mut self, value: bool) {
        if self.alive != value {
            self.alive = value;
            self.state_changed = true;
        }
    }

    pub(crate) fn set_active(&mut self, value: bool) {
        if self.active != value {
            self.active = value;
            self.state_changed = true;
        }
    }

    pub(crate) fn set_converged(&mut self, value: bool) {
        if self.converged != value {
            self.converged = value;
            self.state_changed = true;
        }
    }

    pub(crate) fn state_changed(&self) -> bool {
        self.state_changed
    }

    pub(crate) fn set_state_changed(&mut self, value: bool) {
        self.state_changed = value;
    }
}
