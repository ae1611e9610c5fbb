//! vmctl - 虚拟机控制平面命令行工具
//!
//! 用一个演示执行引擎驱动完整的生命周期（开机、挂起/恢复、复位、关机、销毁），
//! 结束后以 JSON 输出各 vCPU 的统计。也可以打印或校验配置文件。

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Serialize;
use vm_common::Config;
use vm_core::{
    CpuStatsSnapshot, EmStatus, ExecutionEngine, HaltMethod, ResetCounts, ResumeReason,
    SuspendReason, TimerSource, VCpu, Vm, VmBackends, VmConfig, VmHandle, VmResult, VmState,
};

#[derive(Parser, Debug)]
#[command(name = "vmctl", version, about = "Drive the VM control plane")]
struct Cli {
    /// 未设置 RUST_LOG 时使用的日志过滤
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行一次生命周期演示
    Run(RunArgs),
    /// 打印默认配置（TOML）
    DefaultConfig,
    /// 校验配置文件
    CheckConfig {
        /// TOML 或 JSON 配置文件
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// 配置文件；命令行参数覆盖其中的值
    #[arg(long)]
    config: Option<PathBuf>,

    /// vCPU 数量
    #[arg(long)]
    cpus: Option<u32>,

    /// 停机策略
    #[arg(long, value_enum)]
    halt: Option<HaltArg>,

    /// 执行上限（1-100）
    #[arg(long)]
    cap: Option<u32>,

    /// 每个阶段运行的时间，毫秒
    #[arg(long, default_value_t = 200)]
    phase_ms: u64,

    /// 客户机每执行多少个时间片停机一次
    #[arg(long, default_value_t = 4)]
    halt_every: u64,

    /// 跳过挂起/恢复阶段
    #[arg(long)]
    no_suspend: bool,

    /// 跳过复位阶段
    #[arg(long)]
    no_reset: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum HaltArg {
    Default,
    Legacy,
    SpinBlock,
    GlobalScheduler,
}

impl From<HaltArg> for HaltMethod {
    fn from(arg: HaltArg) -> Self {
        match arg {
            HaltArg::Default => HaltMethod::Default,
            HaltArg::Legacy => HaltMethod::Legacy,
            HaltArg::SpinBlock => HaltMethod::SpinBlock,
            HaltArg::GlobalScheduler => HaltMethod::GlobalScheduler,
        }
    }
}

/// 演示引擎：每个时间片空转一小段，定期报告客户机空闲
struct DemoEngine {
    halt_every: u64,
    quanta: AtomicU64,
}

impl ExecutionEngine for DemoEngine {
    fn execute(&self, _vm: &Vm, _cpu: &VCpu) -> VmResult<EmStatus> {
        let n = self.quanta.fetch_add(1, Ordering::Relaxed) + 1;
        for _ in 0..10_000 {
            std::hint::spin_loop();
        }
        if self.halt_every > 0 && n % self.halt_every == 0 {
            return Ok(EmStatus::Halt);
        }
        Ok(EmStatus::Success)
    }
}

/// 固定 1ms 周期的虚拟定时器
struct PeriodicTimer;

impl TimerSource for PeriodicTimer {
    fn run_timers(&self, _vm: &Vm, _cpu: &VCpu) -> Option<Duration> {
        Some(Duration::from_millis(1))
    }
}

#[derive(Serialize)]
struct CpuReport {
    id: u32,
    #[serde(flatten)]
    stats: CpuStatsSnapshot,
}

#[derive(Serialize)]
struct RunReport {
    name: String,
    uuid: String,
    final_state: VmState,
    halt_method: HaltMethod,
    resets: ResetCounts,
    errors: u64,
    runtime_errors: u64,
    guest_quanta: u64,
    cpus: Vec<CpuReport>,
}

fn load_config(args: &RunArgs) -> Result<VmConfig> {
    let mut config = match &args.config {
        Some(path) => VmConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VmConfig::new(),
    };
    if let Some(cpus) = args.cpus {
        config.cpu_count = cpus;
    }
    if let Some(halt) = args.halt {
        config.halt_method = halt.into();
    }
    if let Some(cap) = args.cap {
        config.execution_cap = cap;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let phase = Duration::from_millis(args.phase_ms);
    let engine = Arc::new(DemoEngine {
        halt_every: args.halt_every,
        quanta: AtomicU64::new(0),
    });
    let backends = VmBackends::new()
        .with_engine(engine.clone())
        .with_timers(Arc::new(PeriodicTimer));

    let vm = VmHandle::create(config, backends).context("creating VM")?;
    vm.register_at_state(Arc::new(|vm: &Vm, new: VmState, old: VmState| {
        info!("{}: state {old} -> {new}", vm.name());
    }));

    vm.power_on()?;
    std::thread::sleep(phase);

    if !args.no_suspend {
        vm.suspend(SuspendReason::User)?;
        std::thread::sleep(phase / 2);
        vm.resume(ResumeReason::User)?;
        std::thread::sleep(phase);
    }

    if !args.no_reset {
        if let Err(e) = vm.soft_reset(0) {
            warn!("soft reset refused: {e}; doing a hard reset");
            vm.reset()?;
        }
        std::thread::sleep(phase);
    }

    vm.power_off()?;
    let report = RunReport {
        name: vm.name().to_string(),
        uuid: vm.uuid().to_string(),
        final_state: vm.state(),
        halt_method: vm.halt_method(),
        resets: vm.reset_counts(),
        errors: vm.error_count(),
        runtime_errors: vm.runtime_error_count(),
        guest_quanta: engine.quanta.load(Ordering::Relaxed),
        cpus: vm
            .cpus()
            .iter()
            .map(|cpu| CpuReport {
                id: cpu.id(),
                stats: cpu.stats().snapshot(),
            })
            .collect(),
    };
    vm.destroy()?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.final_state != VmState::Off {
        bail!("VM ended in {}", report.final_state);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    vm_common::init_logging(&cli.log);

    match cli.command {
        Command::Run(args) => run(args),
        Command::DefaultConfig => {
            print!("{}", VmConfig::defaults().to_toml()?);
            Ok(())
        }
        Command::CheckConfig { path } => {
            let config = VmConfig::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!(
                "{}: ok ({} vCPU(s), halt method {})",
                path.display(),
                config.cpu_count,
                config.halt_method
            );
            Ok(())
        }
    }
}
