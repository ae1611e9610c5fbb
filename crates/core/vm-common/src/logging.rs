//! 日志初始化
//!
//! 所有 crate 都通过 `log` 门面输出日志，由 `env_logger` 负责落地。
//! 输出中带上线程名，EMT 线程的日志（`EMT-0`、`EMT-1` ...）因此可以区分。

use std::io::Write;

use env_logger::{Builder, Env};

/// 安装全局日志器
///
/// `RUST_LOG` 优先；未设置时使用 `default_filter`（例如 `"info"` 或 `"vm_core=debug"`）。
/// 重复调用不会报错。
pub fn init_logging(default_filter: &str) {
    let _ = build(default_filter, false).try_init();
}

/// 测试用日志器，输出交给测试框架捕获
pub fn init_test_logging() {
    let _ = build("debug", true).try_init();
}

fn build(default_filter: &str, is_test: bool) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.is_test(is_test).format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "[{} {:5} {} {}] {}",
            buf.timestamp_millis(),
            record.level(),
            thread.name().unwrap_or("<unnamed>"),
            record.target(),
            record.args()
        )
    });
    builder
}
