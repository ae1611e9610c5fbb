//! VM 配置
//!
//! [`VmConfig`] 实现 `vm_common::Config`，可以从 TOML/JSON 文件加载，创建 VM 前会被校验。

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use vm_common::{Config, ConfigError};

use crate::halt::HaltMethod;

/// 支持的最大 vCPU 数
pub const MAX_CPUS: u32 = 64;

/// 停机策略的调优参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaltTuning {
    /// 低于该时长（加上平均超睡时间）时自旋而不是阻塞，微秒
    pub spin_block_threshold_us: u64,
    /// 时钟追赶落后超过该值时进入自旋模式，毫秒
    pub start_spinning_ms: u64,
    /// 落后低于该值时退出自旋模式，毫秒
    pub stop_spinning_ms: u64,
    /// 自旋模式下两次短阻塞之间的最短间隔，毫秒
    pub min_block_interval_ms: u64,
    /// 自旋模式下两次短阻塞之间的最长间隔，毫秒
    pub max_block_interval_ms: u64,
    /// 阻塞间隔 = 落后量 / 该除数
    pub lag_block_divisor: u32,
}

impl Default for HaltTuning {
    fn default() -> Self {
        Self {
            spin_block_threshold_us: 50,
            start_spinning_ms: 20,
            stop_spinning_ms: 2,
            min_block_interval_ms: 5,
            max_block_interval_ms: 200,
            lag_block_divisor: 2048,
        }
    }
}

impl HaltTuning {
    pub fn spin_block_threshold(&self) -> Duration {
        Duration::from_micros(self.spin_block_threshold_us)
    }

    pub fn start_spinning(&self) -> Duration {
        Duration::from_millis(self.start_spinning_ms)
    }

    pub fn stop_spinning(&self) -> Duration {
        Duration::from_millis(self.stop_spinning_ms)
    }

    /// 自旋模式下两次阻塞之间的间隔
    pub fn block_interval(&self, lag: Duration) -> Duration {
        let divisor = self.lag_block_divisor.max(1);
        (lag / divisor)
            .min(Duration::from_millis(self.max_block_interval_ms))
            .max(Duration::from_millis(self.min_block_interval_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_spinning_ms > self.start_spinning_ms {
            return Err(ConfigError::Validation {
                field: "halt.stop_spinning_ms".into(),
                message: "must not exceed start_spinning_ms".into(),
            });
        }
        if self.min_block_interval_ms > self.max_block_interval_ms {
            return Err(ConfigError::Validation {
                field: "halt.min_block_interval_ms".into(),
                message: "must not exceed max_block_interval_ms".into(),
            });
        }
        if self.lag_block_divisor == 0 {
            return Err(ConfigError::Validation {
                field: "halt.lag_block_divisor".into(),
                message: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// VM 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// VM 名称，用于日志
    pub name: String,
    /// vCPU 数量
    pub cpu_count: u32,
    /// 初始停机策略
    pub halt_method: HaltMethod,
    /// 执行上限（百分比）
    pub execution_cap: u32,
    /// 客户机复位时改为关机
    pub power_off_instead_of_reset: bool,
    /// EMT 栈大小（字节）
    pub emt_stack_size: usize,
    /// 销毁时等待 EMT 退出的时间，毫秒
    pub destroy_timeout_ms: u64,
    /// 同时未释放的请求包上限
    pub max_outstanding_requests: usize,
    pub halt: HaltTuning,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "vm".to_string(),
            cpu_count: 1,
            halt_method: HaltMethod::Default,
            execution_cap: 100,
            power_off_instead_of_reset: false,
            emt_stack_size: 2 * 1024 * 1024,
            destroy_timeout_ms: 30_000,
            max_outstanding_requests: 4096,
            halt: HaltTuning::default(),
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cpu_count(mut self, cpu_count: u32) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    pub fn with_halt_method(mut self, method: HaltMethod) -> Self {
        self.halt_method = method;
        self
    }

    pub fn with_execution_cap(mut self, cap: u32) -> Self {
        self.execution_cap = cap;
        self
    }

    pub fn with_power_off_instead_of_reset(mut self, enabled: bool) -> Self {
        self.power_off_instead_of_reset = enabled;
        self
    }

    pub fn with_max_outstanding_requests(mut self, max: usize) -> Self {
        self.max_outstanding_requests = max;
        self
    }

    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }
}

impl Config for VmConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(ConfigError::Validation {
                field: "cpu_count".into(),
                message: format!("must be between 1 and {MAX_CPUS}, got {}", self.cpu_count),
            });
        }
        if self.execution_cap == 0 || self.execution_cap > 100 {
            return Err(ConfigError::Validation {
                field: "execution_cap".into(),
                message: format!("must be between 1 and 100, got {}", self.execution_cap),
            });
        }
        if self.emt_stack_size < 64 * 1024 {
            return Err(ConfigError::Validation {
                field: "emt_stack_size".into(),
                message: "must be at least 64 KiB".into(),
            });
        }
        if self.max_outstanding_requests == 0 {
            return Err(ConfigError::Validation {
                field: "max_outstanding_requests".into(),
                message: "must be greater than 0".into(),
            });
        }
        self.halt.validate()?;

        let host_cpus = num_cpus::get();
        if self.cpu_count as usize > host_cpus {
            warn!(
                "{}: {} vCPUs configured on a host with {} CPUs",
                self.name, self.cpu_count, host_cpus
            );
        }
        Ok(())
    }

    fn defaults() -> Self {
        Self::default()
    }

    fn merge(&self, other: &Self) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut merged = self.clone();

        if other.name != defaults.name {
            merged.name = other.name.clone();
        }
        if other.cpu_count != defaults.cpu_count {
            merged.cpu_count = other.cpu_count;
        }
        if other.halt_method != defaults.halt_method {
            merged.halt_method = other.halt_method;
        }
        if other.execution_cap != defaults.execution_cap {
            merged.execution_cap = other.execution_cap;
        }
        if other.power_off_instead_of_reset {
            merged.power_off_instead_of_reset = true;
        }
        if other.emt_stack_size != defaults.emt_stack_size {
            merged.emt_stack_size = other.emt_stack_size;
        }
        if other.destroy_timeout_ms != defaults.destroy_timeout_ms {
            merged.destroy_timeout_ms = other.destroy_timeout_ms;
        }
        if other.max_outstanding_requests != defaults.max_outstanding_requests {
            merged.max_outstanding_requests = other.max_outstanding_requests;
        }
        if other.halt != defaults.halt {
            merged.halt = other.halt.clone();
        }
        Ok(merged)
    }
}
