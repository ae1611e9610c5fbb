//! 集成测试共用的记录型后端
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vm_core::{
    DeviceManager, EmStatus, ExecutionEngine, LiveSave, ResetKind, ResumeReason, SaveAfter,
    SaveTarget, SavedStateEngine, SuspendReason, VCpu, Vm, VmBackends, VmConfig, VmError,
    VmHandle, VmResult, VmState,
};

pub fn init() {
    vm_common::init_test_logging();
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// 记录设备管理收到的通知
#[derive(Default)]
pub struct RecordingDevices {
    pub events: Mutex<Vec<String>>,
    pub reset_kind: Mutex<Option<ResetKind>>,
    /// 拆除时仍在计数的 EMT 数
    pub active_at_term: Mutex<Vec<u32>>,
}

impl RecordingDevices {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.as_str() == event).count()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

impl DeviceManager for RecordingDevices {
    fn power_on(&self, _vm: &Vm) {
        self.record("power_on");
    }

    fn suspend(&self, _vm: &Vm, reason: SuspendReason) {
        self.record(format!("suspend:{reason:?}"));
    }

    fn resume(&self, _vm: &Vm, reason: ResumeReason) {
        self.record(format!("resume:{reason:?}"));
    }

    fn power_off(&self, _vm: &Vm) {
        self.record("power_off");
    }

    fn reset(&self, _vm: &Vm) {
        self.record("reset");
    }

    fn soft_reset(&self, _vm: &Vm, flags: u32) {
        self.record(format!("soft_reset:{flags}"));
    }

    fn reset_kind(&self, _vm: &Vm) -> ResetKind {
        self.reset_kind.lock().unwrap_or(ResetKind::Hard)
    }

    fn reset_cpu(&self, _vm: &Vm, cpu: &VCpu) {
        self.record(format!("reset_cpu:{}", cpu.id()));
    }

    fn term(&self, vm: &Vm) {
        self.active_at_term.lock().push(vm.active_emts());
        self.record("term");
    }
}

/// 每个时间片睡 1ms；`fail` 置位后下一个时间片报告不可恢复错误，
/// `request_reset` 置位后报告客户机复位
#[derive(Default)]
pub struct TriggerEngine {
    pub fail: AtomicBool,
    pub request_reset: AtomicBool,
    pub quanta: AtomicUsize,
}

impl ExecutionEngine for TriggerEngine {
    fn execute(&self, _vm: &Vm, _cpu: &VCpu) -> VmResult<EmStatus> {
        self.quanta.fetch_add(1, Ordering::SeqCst);
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(VmError::Engine("triple fault".into()));
        }
        if self.request_reset.swap(false, Ordering::SeqCst) {
            return Ok(EmStatus::Reset);
        }
        std::thread::sleep(Duration::from_millis(1));
        Ok(EmStatus::Success)
    }
}

/// 可配置失败点的存档引擎
#[derive(Default)]
pub struct MockSavedState {
    pub saves: AtomicUsize,
    pub live_saves: AtomicUsize,
    pub loads: AtomicUsize,
    pub cancels: AtomicUsize,
    pub fail_load: AtomicBool,
    pub fail_step1: AtomicBool,
    /// 第一阶段期间关机
    pub power_off_in_step1: AtomicBool,
    /// 在线保存第一阶段期间观察到的 VM 状态
    pub live_states: Mutex<Vec<VmState>>,
    pub last_after: Mutex<Option<SaveAfter>>,
    pub live_done: Arc<AtomicUsize>,
}

struct MockLive {
    fail_step1: bool,
    power_off: bool,
    done: Arc<AtomicUsize>,
}

impl LiveSave for MockLive {
    fn step1(&mut self, vm: &Vm) -> VmResult<()> {
        assert_eq!(vm.state(), VmState::RunningLs);
        if self.power_off {
            vm.power_off()?;
        }
        if self.fail_step1 {
            return Err(VmError::SavedState("disk full".into()));
        }
        Ok(())
    }

    fn step2(&mut self, vm: &Vm) -> VmResult<()> {
        assert_eq!(vm.state(), VmState::Saving);
        Ok(())
    }

    fn done(&mut self, _vm: &Vm) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

impl SavedStateEngine for MockSavedState {
    fn save(&self, vm: &Vm, _target: &SaveTarget, after: SaveAfter) -> VmResult<()> {
        assert_eq!(vm.state(), VmState::Saving);
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.last_after.lock() = Some(after);
        Ok(())
    }

    fn live_save(
        &self,
        vm: &Vm,
        _target: &SaveTarget,
        after: SaveAfter,
        _max_downtime: Duration,
    ) -> VmResult<Box<dyn LiveSave>> {
        self.live_saves.fetch_add(1, Ordering::SeqCst);
        self.live_states.lock().push(vm.state());
        *self.last_after.lock() = Some(after);
        Ok(Box::new(MockLive {
            fail_step1: self.fail_step1.load(Ordering::SeqCst),
            power_off: self.power_off_in_step1.load(Ordering::SeqCst),
            done: Arc::clone(&self.live_done),
        }))
    }

    fn load(&self, vm: &Vm, _source: &SaveTarget) -> VmResult<()> {
        assert_eq!(vm.state(), VmState::Loading);
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(VmError::SavedState("bad magic".into()));
        }
        Ok(())
    }

    fn cancel(&self, _vm: &Vm) -> bool {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// 一台带记录型后端的测试 VM
pub struct TestVm {
    pub vm: VmHandle,
    pub devices: Arc<RecordingDevices>,
    pub engine: Arc<TriggerEngine>,
    pub saved_state: Arc<MockSavedState>,
}

impl TestVm {
    pub fn new(cpus: u32) -> Self {
        Self::with_config(VmConfig::new().with_cpu_count(cpus))
    }

    pub fn with_config(config: VmConfig) -> Self {
        init();
        let devices = Arc::new(RecordingDevices::default());
        let engine = Arc::new(TriggerEngine::default());
        let saved_state = Arc::new(MockSavedState::default());
        let backends = VmBackends::new()
            .with_devices(devices.clone())
            .with_engine(engine.clone())
            .with_saved_state(saved_state.clone());
        let vm = VmHandle::create(config, backends).expect("create VM");
        Self {
            vm,
            devices,
            engine,
            saved_state,
        }
    }

    /// 记录所有状态迁移
    pub fn record_transitions(&self) -> Arc<Mutex<Vec<(VmState, VmState)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        self.vm.register_at_state(Arc::new(move |_vm: &Vm, new: VmState, old: VmState| {
            sink.lock().push((old, new));
        }));
        log
    }

    pub fn shutdown(self) {
        if self.vm.state() != VmState::Off {
            let _ = self.vm.power_off();
        }
        self.vm.destroy().expect("destroy VM");
    }
}
