//! The control-flow engine: drives a [`TangleGroup`] to a fixed point.
//!
//! [`ControlFlow::update_state`] replays externally-observed per-thread
//! execution (which may batch several steps per thread) one step at a time,
//! and after every step reconciles the tangle state: deactivate tangles with
//! no live threads, split diverged tangles, park tangles that reached their
//! merge point, collapse function-return scopes, merge converged tangles
//! with identical merge stacks, and reactivate tangles no other live tangle
//! is entangled with. The loop terminates when an entire pass advances no
//! thread and observes no state change.
//!
//! This engine is an internal consistency tool, not a hardened API: a caller
//! violating the replay protocol (threads in no alive tangle, unconsumed
//! trace entries, unpaired call/return notifications) hits an assertion, not
//! a recoverable error.

use crate::tangle::{Tangle, TangleGroup};
use crate::{ThreadExecutionStates, ThreadIndex, ThreadReference, INVALID_EXECUTION_POINT};
use rustc_hash::FxHashMap;
use tracing::trace;

/// The reconvergence simulation for one group of threads (one wave/subgroup
/// under debug). Independent instances share nothing.
pub struct ControlFlow {
    tangles: TangleGroup,
    /// Monotonic source of tangle identities; ids are never reused.
    next_tangle_id: u32,
}

impl ControlFlow {
    /// Build the root tangle holding every supplied thread: active, alive,
    /// with sentinel merge/return stacks ("no enclosing merge - terminal").
    ///
    /// Membership is fixed for the life of the instance; threads only die,
    /// they are never added.
    pub fn new(thread_ids: &[ThreadIndex]) -> Self {
        let mut flow = ControlFlow { tangles: TangleGroup::new(), next_tangle_id: 0 };

        let mut root = Tangle::new(flow.fresh_tangle_id());
        root.set_active(true);
        root.set_alive(true);
        root.set_merge_points(&[INVALID_EXECUTION_POINT]);
        root.set_function_return_points(&[INVALID_EXECUTION_POINT]);
        root.set_diverged(false);
        root.set_converged(false);
        for &thread_id in thread_ids {
            root.add_thread_reference(ThreadReference::new(thread_id));
        }

        flow.tangles.push(root);
        flow
    }

    /// The live tangle set, for external inspection.
    pub fn tangles(&self) -> &TangleGroup {
        &self.tangles
    }

    /// The live tangle set, writable: the interpreter pushes divergence,
    /// merge-point, function-return and kill notifications directly onto
    /// specific tangles between [`Self::update_state`] calls.
    pub fn tangles_mut(&mut self) -> &mut TangleGroup {
        &mut self.tangles
    }

    /// Consume the queued execution points of every thread, reconciling the
    /// tangle state after each simulation step, until a fixed point.
    ///
    /// Every thread id present in `thread_execution_states` must belong to
    /// exactly one alive tangle while its entries are consumed; on return,
    /// every entry of every thread has been applied (asserted).
    pub fn update_state(&mut self, thread_execution_states: &ThreadExecutionStates) {
        let mut cursors: FxHashMap<ThreadIndex, usize> =
            thread_execution_states.keys().map(|&thread_id| (thread_id, 0)).collect();

        loop {
            let mut state_changed = false;
            let mut moved_threads: Vec<ThreadIndex> = Vec::new();

            // Advance one queued step for every thread of every alive tangle,
            // and pick up externally-made state changes since the last pass.
            for tangle in &mut self.tangles {
                if !tangle.is_alive() {
                    continue;
                }
                if tangle.state_changed() {
                    state_changed = true;
                    tangle.set_state_changed(false);
                }
                for i in 0..tangle.thread_count() {
                    let thread_id = tangle.thread_refs()[i].id;
                    let Some(entered_points) = thread_execution_states.get(&thread_id) else {
                        continue;
                    };
                    let cursor = cursors[&thread_id];
                    if cursor < entered_points.len() {
                        tangle.set_thread_execution_point(thread_id, entered_points[cursor]);
                        state_changed = true;
                        moved_threads.push(thread_id);
                    }
                }
            }
            if !state_changed {
                break;
            }

            self.process_tangle_deactivation();
            self.process_tangle_divergence();

            // Merge / function-return arrival among threads that moved this
            // pass: reaching the top function-return point collapses the
            // callee's scope in place; merely reaching the top merge point
            // parks the tangle as converged.
            for tangle in &mut self.tangles {
                if !tangle.is_alive() {
                    continue;
                }

                let merge_point = tangle.merge_point();
                let at_merge_point = merge_point != INVALID_EXECUTION_POINT
                    && tangle.execution_point() == merge_point;
                let return_point = tangle.function_return_point();
                let at_return_point = return_point != INVALID_EXECUTION_POINT
                    && tangle.execution_point() == return_point;

                let mut thread_moved = false;
                for thread_ref in tangle.thread_refs() {
                    if moved_threads.contains(&thread_ref.id) {
                        thread_moved = true;
                        // externally-observed execution of a merge or return
                        // point must be uniform across the tangle
                        if at_merge_point {
                            assert_eq!(
                                merge_point, thread_ref.exec_point,
                                "thread {} moved past its tangle's merge point",
                                thread_ref.id
                            );
                        }
                        if at_return_point {
                            assert_eq!(
                                return_point, thread_ref.exec_point,
                                "thread {} moved past its tangle's function return point",
                                thread_ref.id
                            );
                        }
                    }
                }
                if !thread_moved {
                    continue;
                }

                if at_return_point {
                    tangle.prune_merge_points(return_point);
                    tangle.pop_function_return_point();
                    tangle.set_state_changed(true);
                    trace!(
                        tangle = tangle.id(),
                        threads = tangle.thread_count(),
                        exec_point = tangle.execution_point(),
                        "tangle returned from function call"
                    );
                } else if at_merge_point {
                    tangle.set_active(false);
                    tangle.set_converged(true);
                    tangle.set_diverged(false);
                    tangle.set_state_changed(true);
                    trace!(
                        tangle = tangle.id(),
                        threads = tangle.thread_count(),
                        exec_point = tangle.execution_point(),
                        "tangle reached its merge point"
                    );
                }
            }

            // Only now are the moved entries consumed.
            for thread_id in &moved_threads {
                let cursor = cursors
                    .get_mut(thread_id)
                    .expect("moved thread must have queued execution state");
                *cursor += 1;
            }

            self.process_tangle_deactivation();
            self.process_tangle_divergence();
            self.process_tangle_convergence();
            self.merge_converged_tangles();
            self.activate_independent_tangles();
            self.process_tangle_deactivation();

            self.tangles.retain(Tangle::is_alive);
        }

        // The replay must fully account for the tangle state it produced.
        for (thread_id, entered_points) in thread_execution_states {
            assert_eq!(
                cursors[thread_id],
                entered_points.len(),
                "thread {thread_id} finished update with unconsumed execution points"
            );
        }
    }

    fn fresh_tangle_id(&mut self) -> u32 {
        fresh_id(&mut self.next_tangle_id)
    }

    /// A tangle whose threads are all dead is dead.
    fn process_tangle_deactivation(&mut self) {
        for tangle in &mut self.tangles {
            if !tangle.is_alive() {
                continue;
            }
            if tangle.thread_refs().iter().all(|t| !t.alive) {
                tangle.set_alive(false);
            }
        }
    }

    /// Split every alive+active tangle whose threads disagree on their
    /// execution point. New tangles are appended after the scan completes.
    fn process_tangle_divergence(&mut self) {
        let mut new_tangles = TangleGroup::new();
        let next_tangle_id = &mut self.next_tangle_id;
        for tangle in &mut self.tangles {
            if !tangle.is_alive_active() {
                continue;
            }
            // divergence before convergence: a branch target can coincide
            // with a merge point address
            tangle.check_for_divergence();
            if tangle.is_diverged() {
                new_tangles.extend(diverge_tangle(tangle, next_tangle_id));
            }
        }
        self.tangles.extend(new_tangles);
    }

    /// Mark every alive tangle all of whose threads sit exactly at its
    /// (defined) top merge point as converged; a tangle converged onto its
    /// function return point additionally collapses the callee's scope.
    fn process_tangle_convergence(&mut self) {
        for tangle in &mut self.tangles {
            if !tangle.is_alive() {
                continue;
            }
            let merge_point = tangle.merge_point();
            if merge_point == INVALID_EXECUTION_POINT {
                continue;
            }
            if tangle.thread_refs().iter().any(|t| t.exec_point != merge_point) {
                continue;
            }
            tangle.set_converged(true);
            let return_point = tangle.function_return_point();
            if tangle.execution_point() == return_point {
                trace!(
                    tangle = tangle.id(),
                    threads = tangle.thread_count(),
                    exec_point = tangle.execution_point(),
                    return_point,
                    "tangle converged at a function return point"
                );
                tangle.prune_merge_points(return_point);
                tangle.pop_function_return_point();
            }
        }
    }

    /// Absorb every alive, converged tangle into the first alive, converged
    /// tangle with an identical merge-point stack (exact equality, not
    /// prefix). Absorbed tangles are fully cleared and die.
    fn merge_converged_tangles(&mut self) {
        for i in 0..self.tangles.len() {
            if !self.tangles[i].is_alive() || !self.tangles[i].is_converged() {
                continue;
            }
            self.tangles[i].set_active(false);
            assert_eq!(
                self.tangles[i].execution_point(),
                self.tangles[i].merge_point(),
                "converged tangle must sit at its merge point"
            );

            for j in 0..self.tangles.len() {
                if j == i {
                    continue;
                }
                let mergeable = {
                    let other = &self.tangles[j];
                    other.is_alive()
                        && other.is_converged()
                        && other.merge_points() == self.tangles[i].merge_points()
                };
                if !mergeable {
                    continue;
                }
                assert_eq!(
                    self.tangles[j].execution_point(),
                    self.tangles[j].merge_point(),
                    "converged tangle must sit at its merge point"
                );

                let absorbed_id = self.tangles[j].id();
                let absorbed_threads: Vec<ThreadReference> =
                    self.tangles[j].thread_refs().to_vec();
                {
                    let other = &mut self.tangles[j];
                    other.clear_merge_points();
                    other.clear_function_return_points();
                    other.clear_thread_references();
                    other.set_active(false);
                    other.set_converged(false);
                    other.set_diverged(false);
                    other.set_alive(false);
                }
                self.tangles[i].append_thread_references(&absorbed_threads);
                trace!(
                    tangle = self.tangles[i].id(),
                    absorbed = absorbed_id,
                    threads = self.tangles[i].thread_count(),
                    exec_point = self.tangles[i].execution_point(),
                    "merged converged tangles"
                );
            }
        }
    }

    /// Reactivate every alive-but-parked (hence converged) tangle that no
    /// other alive tangle is entangled with, popping the merge point it was
    /// parked at: the tangle proceeds into the scope beyond the merge.
    ///
    /// Candidates are decided against the group as it stood at the start of
    /// the pass, then applied, so earlier activations cannot unpark
    /// entangled siblings within the same pass.
    fn activate_independent_tangles(&mut self) {
        let mut to_activate = Vec::new();
        for (i, tangle) in self.tangles.iter().enumerate() {
            if !tangle.is_alive() || tangle.is_active() {
                continue;
            }
            assert!(tangle.is_converged(), "parked tangle must be converged");
            let entangled_elsewhere = self.tangles.iter().any(|other| {
                other.is_alive() && other.id() != tangle.id() && tangle.entangled(other)
            });
            if !entangled_elsewhere {
                to_activate.push(i);
            }
        }

        for i in to_activate {
            let tangle = &mut self.tangles[i];
            tangle.set_active(true);
            tangle.set_converged(false);
            tangle.set_diverged(false);
            assert_eq!(
                tangle.execution_point(),
                tangle.merge_point(),
                "activated tangle must sit at its merge point"
            );
            assert_ne!(
                tangle.merge_point(),
                INVALID_EXECUTION_POINT,
                "activated tangle must have a defined merge point"
            );
            tangle.pop_merge_point();
            tangle.set_state_changed(true);
            trace!(
                tangle = tangle.id(),
                threads = tangle.thread_count(),
                exec_point = tangle.execution_point(),
                "tangle activated past its merge point"
            );
        }
    }
}

/// Ids are handed out monotonically and never reused, even across tangles
/// created by [`ControlFlow::new`] and by [`diverge_tangle`].
fn fresh_id(next_tangle_id: &mut u32) -> u32 {
    let id = *next_tangle_id;
    *next_tangle_id += 1;
    id
}

/// Partition a diverged tangle's threads by execution point into fresh
/// tangles, each inheriting a copy of the parent's merge/return stacks.
///
/// Children start not-diverged; they start active unless the parent was
/// already converged when it diverged, in which case they start parked
/// rather than racing ahead. The parent ends with zero threads and dies,
/// its identity retired.
fn diverge_tangle(tangle: &mut Tangle, next_tangle_id: &mut u32) -> TangleGroup {
    tangle.set_active(false);

    let mut new_tangles = TangleGroup::new();
    for &thread_ref in tangle.thread_refs() {
        match new_tangles.iter_mut().find(|t| t.execution_point() == thread_ref.exec_point) {
            Some(new_tangle) => new_tangle.add_thread_reference(thread_ref),
            None => {
                let mut new_tangle = Tangle::new(fresh_id(next_tangle_id));
                new_tangle.add_thread_reference(thread_ref);
                new_tangle.set_merge_points(tangle.merge_points());
                new_tangle.set_function_return_points(tangle.function_return_points());
                new_tangle.set_diverged(false);
                new_tangle.set_converged(tangle.is_converged());
                new_tangle.set_active(!tangle.is_converged());
                new_tangle.set_alive(true);
                new_tangle.set_state_changed(true);
                new_tangles.push(new_tangle);
            }
        }
    }

    for new_tangle in &new_tangles {
        for thread_ref in new_tangle.thread_refs() {
            tangle.remove_thread_reference(thread_ref.id);
        }
    }

    tangle.set_active(false);
    tangle.set_alive(false);
    assert_eq!(tangle.thread_count(), 0, "diverged tangle must hand off every thread");

    trace!(parent = tangle.id(), children = new_tangles.len(), "tangle diverged");
    new_tangles
}
