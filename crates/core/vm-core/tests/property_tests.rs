//! 控制平面的属性测试
//!
//! 用随机操作序列验证：状态机只走表中声明的转换、失败的操作不改变状态、
//! 状态码合并满足格（lattice）性质。

mod common;

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use common::{TestVm, wait_until};
use proptest::prelude::*;
use vm_core::{
    EmStatus, ReqFlags, ReqFn, ReqTarget, RequestHandle, ResumeReason, SuspendReason, VmState,
};

// ============================================================================
// 生成器
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    PowerOn,
    Suspend,
    Resume,
    Reset,
    SoftReset,
    PowerOff,
    EnterDebugging,
    LeaveDebugging,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::PowerOn),
        Just(Op::Suspend),
        Just(Op::Resume),
        Just(Op::Reset),
        Just(Op::SoftReset),
        Just(Op::PowerOff),
        Just(Op::EnterDebugging),
        Just(Op::LeaveDebugging),
    ]
}

#[derive(Debug, Clone, Copy)]
enum PoolOp {
    Alloc,
    Free(usize),
    Call,
}

fn pool_op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Alloc),
        3 => any::<usize>().prop_map(PoolOp::Free),
        1 => Just(PoolOp::Call),
    ]
}

fn status_strategy() -> impl Strategy<Value = EmStatus> {
    prop_oneof![
        Just(EmStatus::Terminate),
        Just(EmStatus::Debug),
        Just(EmStatus::Off),
        Just(EmStatus::Suspend),
        Just(EmStatus::Reset),
        Just(EmStatus::Halt),
        Just(EmStatus::WaitSipi),
        Just(EmStatus::Resume),
        Just(EmStatus::Reschedule),
        Just(EmStatus::Success),
    ]
}

fn stable(state: VmState) -> bool {
    matches!(
        state,
        VmState::Created
            | VmState::Running
            | VmState::Suspended
            | VmState::Debugging
            | VmState::Off
    )
}

// ============================================================================
// 状态机
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_random_operations_follow_the_table(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let t = TestVm::new(1);
        let transitions = t.record_transitions();

        for op in ops {
            let before = t.vm.state();
            let result = match op {
                Op::PowerOn => t.vm.power_on(),
                Op::Suspend => t.vm.suspend(SuspendReason::User),
                Op::Resume => t.vm.resume(ResumeReason::User),
                Op::Reset => t.vm.reset(),
                Op::SoftReset => t.vm.soft_reset(0),
                Op::PowerOff => t.vm.power_off(),
                Op::EnterDebugging => t.vm.enter_debugging(),
                Op::LeaveDebugging => t.vm.leave_debugging(),
            };

            let after = t.vm.state();
            prop_assert!(stable(after), "{op:?} left the VM in {after}");
            if let Err(e) = result {
                prop_assert!(e.is_state_error(), "{op:?} failed with {e}");
                prop_assert_eq!(before, after);
            }
        }

        for (from, to) in transitions.lock().iter() {
            prop_assert!(from.can_transition(*to), "illegal transition {from} -> {to}");
        }
        t.shutdown();
    }

    #[test]
    fn prop_pool_accounting_is_conserved(ops in prop::collection::vec(pool_op_strategy(), 1..200)) {
        let t = TestVm::new(1);
        let baseline = t.vm.request_pool_stats().outstanding;
        let mut held: Vec<RequestHandle> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Alloc => {
                    let req = t.vm.req_alloc(
                        ReqTarget::Cpu(0),
                        ReqFlags::empty(),
                        ReqFn::once(|_vm, _cpu| Ok(EmStatus::Success)),
                    );
                    held.push(req.unwrap());
                }
                PoolOp::Free(i) if !held.is_empty() => {
                    let req = held.swap_remove(i % held.len());
                    t.vm.req_free(req).unwrap();
                }
                PoolOp::Free(_) => {}
                PoolOp::Call => {
                    let status = t.vm.req_call_wait(ReqTarget::Cpu(0), |_vm, _cpu| Ok(EmStatus::Halt));
                    prop_assert_eq!(status.unwrap(), EmStatus::Halt);
                }
            }

            // EMT 可能还握着刚完成的请求，等它归还
            let expected = baseline + held.len();
            let settled = wait_until(Duration::from_secs(5), || {
                let stats = t.vm.request_pool_stats();
                stats.outstanding == expected && stats.allocs - stats.frees == expected as u64
            });
            let stats = t.vm.request_pool_stats();
            prop_assert!(settled, "{:?}", stats);
            prop_assert_eq!(stats.allocs, stats.fresh + stats.recycled);
            prop_assert!(stats.cached <= 128, "{:?}", stats);
        }

        for req in held.drain(..) {
            t.vm.req_free(req).unwrap();
        }
        let drained = wait_until(Duration::from_secs(5), || {
            t.vm.request_pool_stats().outstanding == baseline
        });
        prop_assert!(drained);
        t.shutdown();
    }

    #[test]
    fn prop_merge_is_commutative_and_picks_strictest(a in status_strategy(), b in status_strategy()) {
        prop_assert_eq!(a.merge(b), b.merge(a));
        prop_assert_eq!(a.merge(a), a);
        prop_assert_eq!(a.merge(EmStatus::Success), a);
        prop_assert_eq!(a.merge(EmStatus::Terminate), EmStatus::Terminate);
        prop_assert!(a.merge(b) <= a && a.merge(b) <= b);
    }

    #[test]
    fn prop_merge_is_associative(
        a in status_strategy(),
        b in status_strategy(),
        c in status_strategy(),
    ) {
        prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
    }
}

// ============================================================================
// 状态转换表
// ============================================================================

#[test]
fn test_every_state_reachable_from_creating() {
    let mut seen = HashSet::from([VmState::Creating]);
    let mut queue = VecDeque::from([VmState::Creating]);
    while let Some(state) = queue.pop_front() {
        for &next in state.targets() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    for state in VmState::all() {
        assert!(seen.contains(state), "{state} is unreachable");
    }
}

#[test]
fn test_every_state_can_reach_terminated() {
    for &start in VmState::all() {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for &next in state.targets() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        assert!(seen.contains(&VmState::Terminated), "{start} never terminates");
    }
}

#[test]
fn test_terminated_is_final_and_no_self_loops() {
    assert!(VmState::Terminated.targets().is_empty());
    for &state in VmState::all() {
        assert!(!state.can_transition(state), "{state} loops onto itself");
    }
}

#[test]
fn test_live_save_states_only_lead_to_live_save_or_recovery() {
    // 影子状态要么留在后台存档里，要么回到普通状态；不会直接进入另一个无关的操作
    for &state in VmState::all().iter().filter(|s| s.is_live_save()) {
        assert!(!state.targets().is_empty(), "{state} is a dead end");
        assert!(
            !state.can_transition(VmState::Destroying),
            "{state} may skip straight to destroying"
        );
    }
}
