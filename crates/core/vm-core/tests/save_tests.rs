//! 保存、迁移与加载集成测试

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::TestVm;
use vm_core::{
    EmStatus, ReqTarget, ResumeReason, SaveAfter, SaveTarget, SuspendReason, VmBackends,
    VmConfig, VmError, VmHandle, VmState,
};

fn file(name: &str) -> SaveTarget {
    SaveTarget::File(PathBuf::from(name))
}

// ============================================================================
// 保存
// ============================================================================

#[test]
fn test_save_while_suspended() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();
    t.vm.suspend(SuspendReason::User).unwrap();
    let transitions = t.record_transitions();

    let suspended = t.vm.save(file("suspended.sav"), true).unwrap();

    assert!(!suspended);
    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.saved_state.saves.load(Ordering::SeqCst), 1);
    assert_eq!(t.saved_state.live_saves.load(Ordering::SeqCst), 0);
    assert_eq!(*t.saved_state.last_after.lock(), Some(SaveAfter::Continue));
    assert_eq!(
        *transitions.lock(),
        vec![
            (VmState::Suspended, VmState::Saving),
            (VmState::Saving, VmState::Suspended),
        ]
    );
    t.shutdown();
}

#[test]
fn test_live_save_while_running() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();
    let transitions = t.record_transitions();

    let suspended = t.vm.save(file("live.sav"), false).unwrap();

    assert!(suspended);
    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.saved_state.live_saves.load(Ordering::SeqCst), 1);
    assert_eq!(*t.saved_state.live_states.lock(), vec![VmState::RunningLs]);
    assert_eq!(*t.saved_state.last_after.lock(), Some(SaveAfter::Destroy));
    assert_eq!(t.saved_state.live_done.load(Ordering::SeqCst), 1);
    assert_eq!(
        *transitions.lock(),
        vec![
            (VmState::Running, VmState::RunningLs),
            (VmState::RunningLs, VmState::SuspendingLs),
            (VmState::SuspendingLs, VmState::SuspendedLs),
            (VmState::SuspendedLs, VmState::Saving),
            (VmState::Saving, VmState::Suspended),
        ]
    );
    assert_eq!(t.devices.count("suspend:Vm"), 1);

    // 保存后需要调用者自己恢复
    t.vm.resume(ResumeReason::StateSaved).unwrap();
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_save_requires_running_or_suspended() {
    let t = TestVm::new(1);
    let err = t.vm.save(file("created.sav"), true).unwrap_err();
    assert!(err.is_state_error(), "{err}");
    assert_eq!(t.vm.state(), VmState::Created);
    t.shutdown();
}

#[test]
fn test_save_rejects_empty_target() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();
    assert!(matches!(
        t.vm.save(SaveTarget::File(PathBuf::new()), true),
        Err(VmError::InvalidParameter(_))
    ));
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_save_on_emt_is_rejected() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();
    let result = t.vm.req_call_wait(ReqTarget::Cpu(0), |vm, _cpu| {
        match vm.save(file("emt.sav"), true) {
            Err(VmError::WrongThread(_)) => Ok(EmStatus::Success),
            other => Err(VmError::InvalidParameter(format!("{other:?}"))),
        }
    });
    assert_eq!(result, Ok(EmStatus::Success));
    t.shutdown();
}

#[test]
fn test_live_pass_failure_returns_to_running() {
    let t = TestVm::new(2);
    t.saved_state.fail_step1.store(true, Ordering::SeqCst);
    t.vm.power_on().unwrap();

    let err = t.vm.save(file("full-disk.sav"), true).unwrap_err();

    assert!(matches!(err, VmError::SavedState(_)), "{err}");
    assert_eq!(t.vm.state(), VmState::Running);
    assert_eq!(t.saved_state.live_done.load(Ordering::SeqCst), 1);
    t.shutdown();
}

#[test]
fn test_power_off_during_live_pass() {
    let t = TestVm::new(2);
    t.saved_state.power_off_in_step1.store(true, Ordering::SeqCst);
    t.vm.power_on().unwrap();

    let err = t.vm.save(file("interrupted.sav"), true).unwrap_err();

    assert_eq!(err, VmError::LivePoweredOff);
    assert_eq!(t.vm.state(), VmState::Off);
    assert!(t.saved_state.cancels.load(Ordering::SeqCst) >= 1);
    assert_eq!(t.saved_state.live_done.load(Ordering::SeqCst), 1);
    t.shutdown();
}

#[test]
fn test_unsupported_saved_state() {
    common::init();
    let vm = VmHandle::create(VmConfig::new().with_cpu_count(1), VmBackends::new()).unwrap();
    vm.power_on().unwrap();
    vm.suspend(SuspendReason::User).unwrap();

    let err = vm.save(file("nowhere.sav"), true).unwrap_err();
    assert!(matches!(err, VmError::NotSupported(_)));
    assert_eq!(vm.state(), VmState::Suspended);

    vm.power_off().unwrap();
    vm.destroy().unwrap();
}

// ============================================================================
// 迁移
// ============================================================================

#[test]
fn test_teleport_marks_vm_until_resume() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    let suspended = t
        .vm
        .teleport(SaveTarget::Stream("10.0.0.2:6000".into()), Duration::from_millis(100))
        .unwrap();

    assert!(suspended);
    assert_eq!(t.vm.state(), VmState::Suspended);
    assert!(t.vm.teleported_and_not_fully_resumed());
    assert_eq!(*t.saved_state.last_after.lock(), Some(SaveAfter::Teleport));

    t.vm.resume(ResumeReason::User).unwrap();
    assert!(!t.vm.teleported_and_not_fully_resumed());
    t.shutdown();
}

#[test]
fn test_teleport_needs_stream() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();
    let err = t
        .vm
        .teleport(file("not-a-stream.sav"), Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, VmError::InvalidParameter(_)));
    assert_eq!(t.vm.state(), VmState::Running);
    assert!(!t.vm.teleported_and_not_fully_resumed());
    t.shutdown();
}

// ============================================================================
// 加载
// ============================================================================

#[test]
fn test_load_into_created_vm() {
    let t = TestVm::new(2);
    let transitions = t.record_transitions();

    t.vm.load(file("restore.sav"), false).unwrap();

    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.saved_state.loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        *transitions.lock(),
        vec![
            (VmState::Created, VmState::Loading),
            (VmState::Loading, VmState::Suspended),
        ]
    );

    t.vm.resume(ResumeReason::StateRestored).unwrap();
    assert_eq!(t.vm.state(), VmState::Running);
    assert_eq!(t.vm.resume_reason(), ResumeReason::StateRestored);
    t.shutdown();
}

#[test]
fn test_incoming_teleport_sets_flag() {
    let t = TestVm::new(1);
    t.vm
        .load(SaveTarget::Stream("0.0.0.0:6000".into()), true)
        .unwrap();
    assert!(t.vm.teleported_and_not_fully_resumed());
    t.shutdown();
}

#[test]
fn test_load_failure_parks_vm() {
    let t = TestVm::new(2);
    t.saved_state.fail_load.store(true, Ordering::SeqCst);
    let errors_before = t.vm.error_count();

    let err = t.vm.load(file("corrupt.sav"), true).unwrap_err();

    assert!(matches!(err, VmError::SavedState(_)), "{err}");
    assert_eq!(t.vm.state(), VmState::LoadFailure);
    assert!(!t.vm.teleported_and_not_fully_resumed());
    assert_eq!(t.vm.error_count(), errors_before + 1);

    // 只能关机
    assert!(t.vm.resume(ResumeReason::User).unwrap_err().is_state_error());
    assert!(t.vm.power_on().unwrap_err().is_state_error());
    t.vm.power_off().unwrap();
    assert_eq!(t.vm.state(), VmState::Off);
    t.shutdown();
}

#[test]
fn test_load_while_running_fails() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();
    let err = t.vm.load(file("restore.sav"), false).unwrap_err();
    assert!(err.is_state_error());
    assert_eq!(t.saved_state.loads.load(Ordering::SeqCst), 0);
    t.shutdown();
}
