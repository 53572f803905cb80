//! End-to-end reconvergence scenarios, driven the way the surrounding
//! debugger drives the engine: queue per-thread execution, push merge /
//! return / divergence / kill notifications onto specific tangles, then
//! reconcile with `update_state` and check the resulting tangle groupings.
//!
//! Expectations are pinned by set membership (execution point + thread set),
//! never by tangle position in the group.

use lockstep::{ControlFlow, ExecutionPoint, ThreadExecutionStates, ThreadIndex};

const EXEC_POINT_1: ExecutionPoint = 1;
const EXEC_POINT_2: ExecutionPoint = 2;
const EXEC_POINT_3: ExecutionPoint = 3;
const EXEC_POINT_4: ExecutionPoint = 4;
const EXEC_POINT_5: ExecutionPoint = 5;
const EXEC_POINT_EXIT: ExecutionPoint = 1000;

const TID_0: ThreadIndex = 0;
const TID_1: ThreadIndex = 1;

const TANGLE_0: usize = 0;
const TANGLE_1: usize = 1;

/// One expected tangle: its execution point and exact thread membership.
type ExpectedTangle = (ExecutionPoint, &'static [ThreadIndex]);

enum Op {
    /// Queue a step for `thread` (its tangle must be alive and active).
    Execute { thread: ThreadIndex, exec_point: ExecutionPoint },
    /// Queue a post-branch step for `thread` and flag its tangle diverged.
    Diverge { tangle: usize, thread: ThreadIndex, exec_point: ExecutionPoint },
    /// Push a merge point onto a tangle.
    Merge { tangle: usize, merge_point: ExecutionPoint },
    /// Push a function return point onto a tangle.
    FunctionReturn { tangle: usize, return_point: ExecutionPoint },
    /// Mark a thread dead (exit/kill).
    Exit { tangle: usize, thread: ThreadIndex },
    /// Reconcile all queued state and check the resulting tangle groupings.
    UpdateState { expected: &'static [ExpectedTangle] },
}

fn run(program: &[Op]) {
    let mut flow = ControlFlow::new(&[TID_0, TID_1]);
    assert_eq!(flow.tangles().len(), 1);

    let mut states = ThreadExecutionStates::default();
    for op in program {
        match *op {
            Op::Execute { thread, exec_point } => {
                states.entry(thread).or_default().push(exec_point);
                let tangle = flow
                    .tangles()
                    .iter()
                    .find(|t| t.contains_thread(thread))
                    .unwrap_or_else(|| panic!("thread {thread} is in no tangle"));
                assert!(tangle.is_alive_active(), "executing thread's tangle must be runnable");
            }
            Op::Diverge { tangle, thread, exec_point } => {
                states.entry(thread).or_default().push(exec_point);
                let tangle = &mut flow.tangles_mut()[tangle];
                tangle.set_diverged(true);
                assert!(tangle.is_alive_active());
            }
            Op::Merge { tangle, merge_point } => {
                flow.tangles_mut()[tangle].add_merge_point(merge_point);
            }
            Op::FunctionReturn { tangle, return_point } => {
                flow.tangles_mut()[tangle].add_function_return_point(return_point);
            }
            Op::Exit { tangle, thread } => {
                flow.tangles_mut()[tangle].set_thread_dead(thread);
            }
            Op::UpdateState { expected } => {
                flow.update_state(&states);
                states.clear();

                let tangles = flow.tangles();
                assert_eq!(
                    tangles.len(),
                    expected.len(),
                    "wrong number of live tangles: {:?}",
                    tangles
                        .iter()
                        .map(|t| (t.execution_point(), t.thread_count()))
                        .collect::<Vec<_>>()
                );
                for &(exec_point, thread_ids) in expected {
                    let tangle = tangles
                        .iter()
                        .find(|t| {
                            t.execution_point() == exec_point
                                && t.thread_count() == thread_ids.len()
                                && thread_ids.iter().all(|&id| t.contains_thread(id))
                        })
                        .unwrap_or_else(|| {
                            panic!("no tangle at {exec_point} holding exactly {thread_ids:?}")
                        });
                    assert!(tangle.is_alive());
                }
            }
        }
    }
}

#[test]
fn no_branch() {
    // TID_0: EXEC_POINT_1
    // TID_1: EXEC_POINT_1
    run(&[
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::Exit { tangle: TANGLE_0, thread: TID_1 },
        Op::UpdateState { expected: &[] },
    ]);
}

#[test]
fn uniform_branch() {
    // a branch taken identically by all threads is modeled as a transient
    // divergence that resolves to a single tangle
    // TID_0: EXEC_POINT_1 -> EXEC_POINT_EXIT
    // TID_1: EXEC_POINT_1 -> EXEC_POINT_EXIT
    run(&[
        Op::Merge { tangle: TANGLE_0, merge_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::Diverge { tangle: TANGLE_0, thread: TID_1, exec_point: EXEC_POINT_EXIT },
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_EXIT },
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0, TID_1])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::Exit { tangle: TANGLE_0, thread: TID_1 },
        Op::UpdateState { expected: &[] },
    ]);
}

#[test]
fn fifty_fifty_branch() {
    // TID_0: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_EXIT
    // TID_1: EXEC_POINT_1 -> EXEC_POINT_3 -> EXEC_POINT_EXIT
    run(&[
        Op::Merge { tangle: TANGLE_0, merge_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Diverge { tangle: TANGLE_0, thread: TID_1, exec_point: EXEC_POINT_3 },
        Op::UpdateState {
            expected: &[(EXEC_POINT_2, &[TID_0]), (EXEC_POINT_3, &[TID_1])],
        },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_3 },
        Op::UpdateState {
            expected: &[(EXEC_POINT_2, &[TID_0]), (EXEC_POINT_3, &[TID_1])],
        },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::Diverge { tangle: TANGLE_1, thread: TID_1, exec_point: EXEC_POINT_EXIT },
        // both arrive at the merge point and fold back into one tangle
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0, TID_1])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::Exit { tangle: TANGLE_0, thread: TID_1 },
        Op::UpdateState { expected: &[] },
    ]);
}

#[test]
fn uniform_branch_with_function_call() {
    // EXEC_POINT_2 is a call site with return point EXEC_POINT_3
    // TID_0: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_3 -> EXEC_POINT_EXIT
    // TID_1: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_3 -> EXEC_POINT_EXIT
    run(&[
        Op::Merge { tangle: TANGLE_0, merge_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Diverge { tangle: TANGLE_0, thread: TID_1, exec_point: EXEC_POINT_2 },
        Op::UpdateState { expected: &[(EXEC_POINT_2, &[TID_0, TID_1])] },
        Op::FunctionReturn { tangle: TANGLE_0, return_point: EXEC_POINT_3 },
        Op::UpdateState { expected: &[(EXEC_POINT_2, &[TID_0, TID_1])] },
        // the call returns uniformly: the return scope collapses
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_3 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_3 },
        Op::UpdateState { expected: &[(EXEC_POINT_3, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_EXIT },
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0, TID_1])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::Exit { tangle: TANGLE_0, thread: TID_1 },
        Op::UpdateState { expected: &[] },
    ]);
}

#[test]
fn function_call_that_diverges_internally() {
    // EXEC_POINT_2 is a call site with return point EXEC_POINT_5; the callee
    // itself branches 50/50 before reconverging at its return point
    // TID_0: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_3 -> EXEC_POINT_5 -> EXEC_POINT_EXIT
    // TID_1: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_4 -> EXEC_POINT_5 -> EXEC_POINT_EXIT
    run(&[
        Op::Merge { tangle: TANGLE_0, merge_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Diverge { tangle: TANGLE_0, thread: TID_1, exec_point: EXEC_POINT_2 },
        Op::UpdateState { expected: &[(EXEC_POINT_2, &[TID_0, TID_1])] },
        Op::FunctionReturn { tangle: TANGLE_0, return_point: EXEC_POINT_5 },
        Op::UpdateState { expected: &[(EXEC_POINT_2, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_3 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_4 },
        Op::UpdateState {
            expected: &[(EXEC_POINT_3, &[TID_0]), (EXEC_POINT_4, &[TID_1])],
        },
        // both reach the return point: merge back and collapse the scope
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_5 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_5 },
        Op::UpdateState { expected: &[(EXEC_POINT_5, &[TID_0, TID_1])] },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_EXIT },
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0, TID_1])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::Exit { tangle: TANGLE_0, thread: TID_1 },
        Op::UpdateState { expected: &[] },
    ]);
}

#[test]
fn fifty_fifty_branch_with_early_exit() {
    // TID_0: EXEC_POINT_1 -> EXEC_POINT_2 -> EXEC_POINT_EXIT
    // TID_1: EXEC_POINT_1 -> EXEC_POINT_3 -> (exits without reconverging)
    run(&[
        Op::Merge { tangle: TANGLE_0, merge_point: EXEC_POINT_EXIT },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_1 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_1, &[TID_0, TID_1])] },
        Op::Diverge { tangle: TANGLE_0, thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Diverge { tangle: TANGLE_0, thread: TID_1, exec_point: EXEC_POINT_3 },
        Op::UpdateState {
            expected: &[(EXEC_POINT_2, &[TID_0]), (EXEC_POINT_3, &[TID_1])],
        },
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_2 },
        Op::Execute { thread: TID_1, exec_point: EXEC_POINT_3 },
        Op::UpdateState {
            expected: &[(EXEC_POINT_2, &[TID_0]), (EXEC_POINT_3, &[TID_1])],
        },
        // TID_0 waits at the merge point while TID_1 is still mid-branch
        Op::Execute { thread: TID_0, exec_point: EXEC_POINT_EXIT },
        Op::UpdateState {
            expected: &[(EXEC_POINT_EXIT, &[TID_0]), (EXEC_POINT_3, &[TID_1])],
        },
        // TID_1 dies; its tangle is pruned and TID_0 is released
        Op::Exit { tangle: TANGLE_1, thread: TID_1 },
        Op::UpdateState { expected: &[(EXEC_POINT_EXIT, &[TID_0])] },
        Op::Exit { tangle: TANGLE_0, thread: TID_0 },
        Op::UpdateState { expected: &[] },
    ]);
}
