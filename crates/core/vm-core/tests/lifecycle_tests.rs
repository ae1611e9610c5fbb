//! 生命周期集成测试
//!
//! 用真实的 EMT 线程和记录型后端驱动开机、挂起、复位、关机、销毁等完整流程。

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{TestVm, wait_until};
use parking_lot::Mutex;
use vm_core::{
    ResetKind, ResumeReason, RuntimeErrorFlags, SuspendReason, UserHooks, VCpuState, Vm,
    VmBackends, VmConfig, VmError, VmHandle, VmState,
};

const SETTLE: Duration = Duration::from_secs(5);

// ============================================================================
// 开机 / 关机 / 销毁
// ============================================================================

#[test]
fn test_create_ends_in_created() {
    let t = TestVm::new(2);
    assert_eq!(t.vm.state(), VmState::Created);
    assert_eq!(t.vm.cpu_count(), 2);
    assert_eq!(t.vm.active_emts(), 2);
    assert_eq!(t.vm.holders(), 1);
    t.shutdown();
}

#[test]
fn test_introspection() {
    let t = TestVm::with_config(VmConfig::new().with_cpu_count(2).with_name("probe"));
    assert_eq!(t.vm.name(), "probe");
    assert!(!t.vm.uuid().is_nil());
    assert_eq!(Vm::state_name(t.vm.state()), "CREATED");

    let emt0 = t.vm.emt_thread_id(0).unwrap().expect("EMT-0 registered");
    let emt1 = t.vm.emt_thread_id(1).unwrap().expect("EMT-1 registered");
    assert_ne!(emt0, emt1);
    assert_ne!(emt0, std::thread::current().id());
    assert!(t.vm.current_cpu().is_none());
    assert!(matches!(t.vm.emt_thread_id(2), Err(VmError::InvalidCpuId(2))));

    t.vm.power_on().unwrap();
    assert_eq!(t.vm.prev_state(), VmState::PoweringOn);
    assert_eq!(Vm::state_name(t.vm.state()), "RUNNING");
    t.shutdown();
}

#[test]
fn test_power_on_four_cpus() {
    let t = TestVm::new(4);
    let transitions = t.record_transitions();

    t.vm.power_on().unwrap();

    assert_eq!(t.vm.state(), VmState::Running);
    for cpu in t.vm.cpus() {
        assert_ne!(cpu.state(), VCpuState::Stopped, "vCPU {} still stopped", cpu.id());
    }
    assert_eq!(t.devices.count("power_on"), 1);
    assert_eq!(
        *transitions.lock(),
        vec![
            (VmState::Created, VmState::PoweringOn),
            (VmState::PoweringOn, VmState::Running),
        ]
    );
    assert!(wait_until(SETTLE, || t.engine.quanta.load(Ordering::SeqCst) > 0));
    t.shutdown();
}

#[test]
fn test_power_on_twice_fails() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    let err = t.vm.power_on().unwrap_err();
    assert!(err.is_state_error(), "unexpected error: {err}");
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_power_off_stops_every_cpu() {
    let t = TestVm::new(3);
    t.vm.power_on().unwrap();

    t.vm.power_off().unwrap();

    assert_eq!(t.vm.state(), VmState::Off);
    for cpu in t.vm.cpus() {
        assert_eq!(cpu.state(), VCpuState::Stopped);
    }
    assert_eq!(t.devices.count("power_off"), 1);
    t.shutdown();
}

#[test]
fn test_power_off_from_created() {
    let t = TestVm::new(1);
    t.vm.power_off().unwrap();
    assert_eq!(t.vm.state(), VmState::Off);
    assert_eq!(t.devices.count("power_on"), 0);
    t.shutdown();
}

#[test]
fn test_destroy_from_off() {
    let t = TestVm::new(4);
    t.vm.power_on().unwrap();
    t.vm.power_off().unwrap();

    t.vm.destroy().unwrap();

    assert_eq!(t.vm.active_emts(), 0);
    assert_eq!(t.vm.state(), VmState::Terminated);
    assert_eq!(t.devices.count("term"), 1);
    // 只剩 EMT 0 时才拆除设备
    assert!(t.devices.active_at_term.lock().iter().all(|&n| n <= 1));
    assert!(t.vm.destroy().is_err());
}

#[test]
fn test_destroy_requires_off() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    let err = t.vm.destroy().unwrap_err();
    assert!(err.is_state_error());
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_destroy_on_emt_is_rejected() {
    let t = TestVm::new(1);
    let result = t
        .vm
        .req_call_wait(vm_core::ReqTarget::Cpu(0), |vm, _cpu| {
            match vm.destroy() {
                Err(VmError::WrongThread(_)) => Ok(vm_core::EmStatus::Success),
                other => Err(VmError::InvalidParameter(format!("{other:?}"))),
            }
        });
    assert_eq!(result, Ok(vm_core::EmStatus::Success));
    t.shutdown();
}

#[test]
fn test_last_handle_drop_destroys() {
    common::init();
    let vm = VmHandle::create(VmConfig::new().with_cpu_count(2), VmBackends::new()).unwrap();
    vm.power_on().unwrap();
    let inner = Arc::clone(vm.vm());

    let second = vm.clone();
    assert_eq!(vm.holders(), 2);
    drop(second);
    assert_eq!(inner.state(), VmState::Running);

    drop(vm);
    assert_eq!(inner.state(), VmState::Terminated);
    assert_eq!(inner.active_emts(), 0);
}

#[test]
fn test_too_many_cpus() {
    common::init();
    let config = VmConfig::new().with_cpu_count(vm_core::MAX_CPUS + 1);
    let err = VmHandle::create(config, VmBackends::new()).unwrap_err();
    assert!(matches!(err, VmError::TooManyCpus { .. }));
}

// ============================================================================
// 挂起 / 恢复
// ============================================================================

#[test]
fn test_suspend_and_resume() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.vm.suspend(SuspendReason::User).unwrap();
    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.vm.suspend_reason(), SuspendReason::User);

    t.vm.resume(ResumeReason::User).unwrap();
    assert_eq!(t.vm.state(), VmState::Running);
    assert_eq!(t.vm.resume_reason(), ResumeReason::User);
    assert_eq!(
        t.devices.events(),
        vec!["power_on", "suspend:User", "resume:User"]
    );
    t.shutdown();
}

#[test]
fn test_concurrent_suspend_exactly_one_wins() {
    let t = TestVm::new(2);
    let transitions = t.record_transitions();
    t.vm.power_on().unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let a = s.spawn(|| t.vm.suspend(SuspendReason::User));
        let b = s.spawn(|| t.vm.suspend(SuspendReason::User));
        vec![a.join().unwrap(), b.join().unwrap()]
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let state_errors = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_state_error()))
        .count();
    assert_eq!(ok, 1, "results: {results:?}");
    assert_eq!(state_errors, 1, "results: {results:?}");
    assert_eq!(t.vm.state(), VmState::Suspended);

    let log = transitions.lock().clone();
    assert!(log.contains(&(VmState::Running, VmState::Suspending)));
    assert!(log.contains(&(VmState::Suspending, VmState::Suspended)));
    assert_eq!(t.devices.count("suspend:User"), 1);
    t.shutdown();
}

#[test]
fn test_invalid_reasons_rejected() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();

    assert!(matches!(
        t.vm.suspend(SuspendReason::Invalid),
        Err(VmError::InvalidParameter(_))
    ));
    assert!(matches!(
        t.vm.resume(ResumeReason::Invalid),
        Err(VmError::InvalidParameter(_))
    ));
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_resume_while_running_fails() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();
    let errors_before = t.vm.error_count();

    let err = t.vm.resume(ResumeReason::User).unwrap_err();
    assert!(err.is_state_error());
    assert!(t.vm.error_count() > errors_before);
    t.shutdown();
}

// ============================================================================
// 复位
// ============================================================================

#[test]
fn test_hard_reset_keeps_running() {
    let t = TestVm::new(4);
    t.vm.power_on().unwrap();

    t.vm.reset().unwrap();

    assert_eq!(t.vm.state(), VmState::Running);
    let counts = t.vm.reset_counts();
    assert_eq!(counts.hard, 1);
    assert_eq!(counts.total, 1);
    assert_eq!(counts.soft, 0);
    assert_eq!(t.devices.count("reset"), 1);
    for id in 0..4 {
        assert_eq!(t.devices.count(&format!("reset_cpu:{id}")), 1);
    }
    t.shutdown();
}

#[test]
fn test_reset_while_suspended_stays_suspended() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();
    t.vm.suspend(SuspendReason::User).unwrap();

    t.vm.reset().unwrap();

    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.vm.reset_counts().hard, 1);
    t.shutdown();
}

#[test]
fn test_soft_reset_multi_cpu_not_supported() {
    let t = TestVm::new(4);
    t.vm.power_on().unwrap();

    let err = t.vm.soft_reset(0).unwrap_err();
    assert!(matches!(err, VmError::NotSupported(_)));
    assert_eq!(t.vm.state(), VmState::Running);

    t.vm.reset().unwrap();
    assert_eq!(t.vm.reset_counts().hard, 1);
    assert_eq!(t.vm.reset_counts().soft, 0);
    t.shutdown();
}

#[test]
fn test_soft_reset_single_cpu() {
    let t = TestVm::new(1);
    t.vm.power_on().unwrap();

    t.vm.soft_reset(7).unwrap();

    assert_eq!(t.vm.state(), VmState::Running);
    assert_eq!(t.vm.reset_counts().soft, 1);
    assert_eq!(t.devices.count("soft_reset:7"), 1);
    t.shutdown();
}

#[test]
fn test_guest_triggered_reset() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.engine.request_reset.store(true, Ordering::SeqCst);

    assert!(wait_until(SETTLE, || t.vm.reset_counts().hard == 1));
    assert!(wait_until(SETTLE, || t.vm.state() == VmState::Running));
    t.shutdown();
}

#[test]
fn test_guest_soft_reset_with_many_cpus_reports_error() {
    let t = TestVm::new(2);
    *t.devices.reset_kind.lock() = Some(ResetKind::Soft(1));
    t.vm.power_on().unwrap();
    let errors_before = t.vm.error_count();

    t.vm.request_reset();

    assert!(wait_until(SETTLE, || t.vm.error_count() > errors_before));
    assert_eq!(t.vm.reset_counts().total, 0);
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[derive(Default)]
struct CountingHooks {
    reset_to_power_off: AtomicUsize,
}

impl UserHooks for CountingHooks {
    fn notify_reset_turned_into_power_off(&self, _vm: &Vm) {
        self.reset_to_power_off.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_reset_turned_into_power_off() {
    common::init();
    let hooks = Arc::new(CountingHooks::default());
    let config = VmConfig::new()
        .with_cpu_count(2)
        .with_power_off_instead_of_reset(true);
    let vm = VmHandle::create(config, VmBackends::new().with_hooks(hooks.clone())).unwrap();
    assert!(vm.power_off_instead_of_reset());
    vm.power_on().unwrap();

    vm.reset().unwrap();

    assert_eq!(vm.state(), VmState::Off);
    assert_eq!(vm.reset_counts().total, 0);
    assert_eq!(hooks.reset_to_power_off.load(Ordering::SeqCst), 1);
    vm.destroy().unwrap();
}

#[test]
fn test_power_off_instead_of_reset_can_be_toggled() {
    let t = TestVm::new(1);
    t.vm.set_power_off_instead_of_reset(true);
    t.vm.set_power_off_instead_of_reset(false);
    assert!(!t.vm.power_off_instead_of_reset());

    t.vm.power_on().unwrap();
    t.vm.reset().unwrap();
    assert_eq!(t.vm.state(), VmState::Running);
    assert_eq!(t.vm.reset_counts().total, 1);
    t.shutdown();
}

// ============================================================================
// 错误状态
// ============================================================================

#[test]
fn test_engine_failure_enters_guru_meditation() {
    let t = TestVm::new(4);
    t.vm.power_on().unwrap();
    let wakeups_before = t.vm.stats().wake_all.get();

    t.engine.fail.store(true, Ordering::SeqCst);

    assert!(wait_until(SETTLE, || t.vm.state() == VmState::GuruMeditation));
    assert!(t.saved_state.cancels.load(Ordering::SeqCst) >= 1);
    assert!(t.vm.stats().wake_all.get() > wakeups_before);

    // 不会自行离开 guru meditation
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(t.vm.state(), VmState::GuruMeditation);

    t.vm.power_off().unwrap();
    assert_eq!(t.vm.state(), VmState::Off);
    t.shutdown();
}

#[test]
fn test_guru_meditation_outside_running_fails() {
    let t = TestVm::new(1);
    let whos = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&whos);
    t.vm.register_at_error(Arc::new(move |_vm: &Vm, _err: &VmError, who: &str| {
        sink.lock().push(who.to_string());
    }));
    let errors_before = t.vm.error_count();

    let err = t.vm.set_guru_meditation().unwrap_err();
    assert!(err.is_state_error());
    assert_eq!(t.vm.state(), VmState::Created);
    assert_eq!(t.vm.error_count(), errors_before + 1);
    assert_eq!(*whos.lock(), vec!["guru_meditation".to_string()]);
    t.shutdown();
}

#[test]
fn test_runtime_error_suspends() {
    let t = TestVm::new(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    t.vm.register_at_runtime_error(Arc::new(move |_vm: &Vm, flags: RuntimeErrorFlags, id: &str, message: &str| {
        sink.lock().push((flags, id.to_string(), message.to_string()));
    }));
    t.vm.power_on().unwrap();

    t.vm
        .set_runtime_error(RuntimeErrorFlags::SUSPEND, "DiskFull", "host disk is full")
        .unwrap();

    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.vm.suspend_reason(), SuspendReason::RuntimeError);
    assert_eq!(t.vm.runtime_error_count(), 1);

    // 再次报告不会改变状态
    t.vm
        .set_runtime_error(RuntimeErrorFlags::SUSPEND, "DiskFull", "host disk is full")
        .unwrap();
    assert_eq!(t.vm.state(), VmState::Suspended);
    assert_eq!(t.vm.runtime_error_count(), 2);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, "DiskFull");
    assert_eq!(seen[0].2, "host disk is full");
    t.shutdown();
}

#[test]
fn test_fatal_runtime_error() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.vm
        .set_runtime_error(RuntimeErrorFlags::FATAL, "HostMemoryLow", "out of memory")
        .unwrap();

    assert_eq!(t.vm.state(), VmState::FatalError);
    assert_eq!(t.vm.runtime_error_count(), 1);
    t.vm.power_off().unwrap();
    t.shutdown();
}

#[test]
fn test_runtime_error_flag_combination_rejected() {
    let t = TestVm::new(1);
    let err = t
        .vm
        .set_runtime_error(
            RuntimeErrorFlags::FATAL | RuntimeErrorFlags::SUSPEND,
            "Bogus",
            "bogus",
        )
        .unwrap_err();
    assert!(matches!(err, VmError::InvalidParameter(_)));
    assert_eq!(t.vm.runtime_error_count(), 0);
    t.shutdown();
}

#[test]
fn test_runtime_error_no_wait() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.vm
        .set_runtime_error(RuntimeErrorFlags::NO_WAIT, "Warning", "just a warning")
        .unwrap();

    assert!(wait_until(SETTLE, || t.vm.runtime_error_count() == 1));
    assert_eq!(t.vm.state(), VmState::Running);
    t.shutdown();
}

#[test]
fn test_at_error_callback_sees_failed_transition() {
    let t = TestVm::new(1);
    let whos = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&whos);
    let callback: vm_core::AtErrorCallback = Arc::new(move |_vm: &Vm, _err: &VmError, who: &str| {
        sink.lock().push(who.to_string());
    });
    t.vm.register_at_error(callback.clone());

    assert!(t.vm.resume(ResumeReason::User).is_err());
    assert!(whos.lock().iter().any(|w| w == "resume"));

    t.vm.deregister_at_error(&callback).unwrap();
    assert_eq!(
        t.vm.deregister_at_error(&callback),
        Err(VmError::CallbackNotFound)
    );
    t.shutdown();
}

// ============================================================================
// 调试器 / 热插拔 / 执行上限
// ============================================================================

#[test]
fn test_enter_and_leave_debugging() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.vm.enter_debugging().unwrap();
    assert_eq!(t.vm.state(), VmState::Debugging);

    t.vm.leave_debugging().unwrap();
    assert_eq!(t.vm.state(), VmState::Running);

    let err = t.vm.leave_debugging().unwrap_err();
    assert!(err.is_state_error());
    t.shutdown();
}

#[test]
fn test_hot_unplug_and_plug() {
    let t = TestVm::new(2);
    t.vm.power_on().unwrap();

    t.vm.hot_unplug_cpu(1).unwrap();
    assert!(wait_until(SETTLE, || !t.vm.cpu(1).unwrap().is_online()));
    assert!(wait_until(SETTLE, || t.devices.count("reset_cpu:1") == 1));
    assert!(!t.vm.cpu(1).unwrap().can_execute());

    t.vm.hot_plug_cpu(1).unwrap();
    assert!(t.vm.cpu(1).unwrap().is_online());

    assert_eq!(t.vm.hot_unplug_cpu(5), Err(VmError::InvalidCpuId(5)));
    t.shutdown();
}

#[test]
fn test_execution_cap_bounds() {
    let t = TestVm::new(1);
    assert_eq!(t.vm.cpu_execution_cap(), 100);

    assert!(matches!(
        t.vm.set_cpu_execution_cap(0),
        Err(VmError::InvalidParameter(_))
    ));
    assert!(matches!(
        t.vm.set_cpu_execution_cap(101),
        Err(VmError::InvalidParameter(_))
    ));
    t.vm.set_cpu_execution_cap(50).unwrap();
    assert_eq!(t.vm.cpu_execution_cap(), 50);

    t.vm.power_on().unwrap();
    assert!(wait_until(SETTLE, || t.engine.quanta.load(Ordering::SeqCst) > 2));
    t.shutdown();
}
