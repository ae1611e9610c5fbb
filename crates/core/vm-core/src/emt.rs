//! EMT（模拟线程）主循环
//!
//! 每个 vCPU 一个原生线程，从 VM 创建一直运行到销毁。每轮按固定优先级处理：
//!
//! 1. 退出请求
//! 2. 本 CPU 待参与的屏障
//! 3. 请求包（VM 级优先，然后是本 CPU 的）
//! 4. 调试器与设备异步通知
//! 5. 延迟复位
//! 6. 无事可做时按当前策略停机/等待
//!
//! VM 处于运行状态时，以上处理都成功后调用执行引擎执行一个时间片。

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::cpu::{VCpu, VCpuState};
use crate::error::{VmError, VmResult};
use crate::ff::{CpuForcedActions, VmForcedActions};
use crate::request::RequestScope;
use crate::status::EmStatus;
use crate::vm::Vm;

/// 执行上限节流时单次睡眠的上限
const MAX_THROTTLE: Duration = Duration::from_millis(100);

impl Vm {
    /// EMT 线程入口；`id` 是本线程负责的 vCPU
    pub(crate) fn emt_main(&self, id: u32) {
        let cpu = match self.cpu(id) {
            Ok(cpu) => cpu,
            Err(e) => {
                error!("EMT-{id}: {e}");
                return;
            }
        };
        cpu.register_thread(std::thread::current().id());
        debug!("EMT-{id}: started");
        self.backends().hooks.notify_emt_init(self, cpu);

        let exit = self.emt_loop(cpu);
        match &exit {
            Ok(()) | Err(VmError::Terminating) => debug!("EMT-{id}: leaving loop"),
            Err(e) => error!("EMT-{id}: loop failed: {e}"),
        }

        cpu.set_state(VCpuState::Stopped);
        if id == 0 {
            self.wait_for_other_emts(self.config().destroy_timeout());
            self.destroy_components();
        }
        self.account_emt_exit(cpu);
        self.backends().hooks.notify_emt_term(self, cpu);
        info!("EMT-{id}: exited");
    }

    fn emt_loop(&self, cpu: &VCpu) -> VmResult<()> {
        loop {
            if self.is_terminating() {
                return Ok(());
            }

            if !self.is_ready() {
                let status = self.bootstrap_step(cpu)?;
                if status == EmStatus::Terminate {
                    return Ok(());
                }
                continue;
            }

            let status = self.service_forced_actions(cpu);
            match status {
                Ok(EmStatus::Terminate) | Err(VmError::Terminating) => return Ok(()),
                Err(e) => {
                    debug!("EMT-{}: forced action failed: {e}", cpu.id());
                    continue;
                }
                Ok(_) => {}
            }

            if self.is_terminating() {
                return Ok(());
            }

            if !(self.state().is_running() && cpu.can_execute()) {
                self.idle(cpu)?;
                continue;
            }
            if self.has_pending_work(cpu) {
                continue;
            }

            match self.execute_quantum(cpu) {
                Ok(EmStatus::Terminate) => return Ok(()),
                Ok(_) => {}
                Err(VmError::Terminating) => return Ok(()),
                Err(e) => warn!("EMT-{}: {e}", cpu.id()),
            }
        }
    }

    /// VM 对象就绪前：只有 CPU 0 处理 VM 级请求，其余 CPU 只处理自己的请求
    fn bootstrap_step(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        if cpu.id() == 0 && self.ff.is_set(VmForcedActions::REQUEST) {
            return Ok(self.process_requests(cpu, RequestScope::Vm));
        }
        if cpu.ff.is_set(CpuForcedActions::REQUEST) {
            return Ok(self.process_requests(cpu, RequestScope::Cpu));
        }
        self.wait_for_event(cpu)?;
        Ok(EmStatus::Success)
    }

    /// 按优先级处理一项强制动作；返回非 `Success` 时表示本轮应重新开始
    fn service_forced_actions(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        let mut status = EmStatus::Success;

        if cpu.ff.test_and_clear(CpuForcedActions::RENDEZVOUS) {
            let result = self.rendezvous_ff(cpu)?;
            trace!("EMT-{}: rendezvous -> {result}", cpu.id());
            status = status.merge(result);
            if status == EmStatus::Terminate {
                return Ok(status);
            }
        }

        if self.ff.is_set(VmForcedActions::REQUEST) {
            status = status.merge(self.process_requests(cpu, RequestScope::Vm));
            if status == EmStatus::Terminate {
                return Ok(status);
            }
        }

        if cpu.ff.is_set(CpuForcedActions::REQUEST) {
            status = status.merge(self.process_requests(cpu, RequestScope::Cpu));
            if status == EmStatus::Terminate {
                return Ok(status);
            }
        }

        if cpu.ff.test_and_clear(CpuForcedActions::DBGF) || self.ff.test_and_clear(VmForcedActions::DBGF)
        {
            if let Some(debugger) = &self.backends().debugger {
                status = status.merge(debugger.service(self, Some(cpu)));
            }
        }

        if cpu.ff.test_and_clear(CpuForcedActions::ASYNC_NOTIFY) {
            self.backends().devices.service_async(self, cpu);
        }

        if self.ff.test_and_clear(VmForcedActions::RESET) {
            status = status.merge(self.reset_ff(cpu)?);
        }

        Ok(status)
    }

    fn has_pending_work(&self, cpu: &VCpu) -> bool {
        self.ff.any(VmForcedActions::SUSPENDED_MASK)
            || cpu.ff.any(CpuForcedActions::SUSPENDED_MASK)
            || cpu.has_pending_requests()
    }

    /// VM 没有在运行（或本 CPU 不能执行）：等待外部事件
    fn idle(&self, cpu: &VCpu) -> VmResult<()> {
        if self.has_pending_work(cpu) {
            return Ok(());
        }
        self.wait_for_event(cpu).map_err(|e| {
            error!("EMT-{}: wait failed: {e}", cpu.id());
            e
        })
    }

    /// 执行一个时间片，并处理引擎返回的状态
    fn execute_quantum(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        cpu.set_state(VCpuState::Executing);
        let started = Instant::now();
        let result = self.backends().engine.execute(self, cpu);
        let ran = started.elapsed();
        if cpu.state() == VCpuState::Executing {
            cpu.set_state(VCpuState::Started);
        }
        cpu.stats().quanta.increment();

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                error!("EMT-{}: execution engine failed: {e}", cpu.id());
                if let Err(e) = self.set_guru_meditation() {
                    warn!("EMT-{}: could not enter guru meditation: {e}", cpu.id());
                }
                return Ok(EmStatus::Success);
            }
        };

        match status {
            EmStatus::Halt => self.wait_halted(cpu)?,
            EmStatus::Reset => {
                self.request_reset();
            }
            EmStatus::Terminate => return Ok(EmStatus::Terminate),
            _ => {}
        }

        self.throttle(ran);
        Ok(status)
    }

    /// 执行上限低于 100% 时，按比例睡眠
    fn throttle(&self, ran: Duration) {
        let cap = self.execution_cap.load(Ordering::Acquire);
        if cap >= 100 || cap == 0 || ran.is_zero() {
            return;
        }
        let pause = (ran * (100 - cap) / cap).min(MAX_THROTTLE);
        std::thread::sleep(pause);
    }
}
