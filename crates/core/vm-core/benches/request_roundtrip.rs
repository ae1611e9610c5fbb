//! 请求往返性能基准测试
//!
//! 测量从非 EMT 线程把闭包投递到 EMT 并等待完成的延迟，以及屏障的开销

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use vm_core::{EmStatus, RendezvousKind, ReqTarget, VmBackends, VmConfig, VmHandle};

fn create(cpus: u32) -> VmHandle {
    VmHandle::create(VmConfig::new().with_cpu_count(cpus), VmBackends::new())
        .expect("create VM")
}

fn teardown(vm: VmHandle) {
    let _ = vm.power_off();
    let _ = vm.destroy();
}

/// 基准测试：单个 CPU 的同步请求往返
fn bench_call_wait(c: &mut Criterion) {
    let vm = create(2);
    let mut group = c.benchmark_group("req_call_wait");

    group.bench_function("cpu1", |b| {
        b.iter(|| {
            black_box(
                vm.req_call_wait(ReqTarget::Cpu(1), |_vm, _cpu| Ok(EmStatus::Success))
                    .unwrap(),
            )
        });
    });

    group.bench_function("any_queue", |b| {
        b.iter(|| {
            black_box(
                vm.req_call_wait(ReqTarget::AnyQueue, |_vm, _cpu| Ok(EmStatus::Success))
                    .unwrap(),
            )
        });
    });

    group.finish();
    teardown(vm);
}

/// 基准测试：依次投递到所有 CPU
fn bench_all_cpus(c: &mut Criterion) {
    let mut group = c.benchmark_group("req_call_all");

    for cpus in [1u32, 2, 4] {
        let vm = create(cpus);
        group.bench_with_input(BenchmarkId::new("ascending", cpus), &cpus, |b, _| {
            b.iter(|| {
                vm.req_call_void_wait(ReqTarget::AllAscending, |_vm, cpu| {
                    black_box(cpu.id());
                })
                .unwrap()
            });
        });
        teardown(vm);
    }

    group.finish();
}

/// 基准测试：从非 EMT 线程发起的屏障
fn bench_rendezvous(c: &mut Criterion) {
    let mut group = c.benchmark_group("emt_rendezvous");

    for kind in [RendezvousKind::Once, RendezvousKind::AllAtOnce, RendezvousKind::Descending] {
        let vm = create(4);
        group.bench_with_input(
            BenchmarkId::new(format!("{kind:?}"), 4),
            &kind,
            |b, &kind| {
                b.iter(|| {
                    vm.emt_rendezvous(kind, false, |_vm, _cpu| Ok(EmStatus::Success))
                        .unwrap()
                });
            },
        );
        teardown(vm);
    }

    group.finish();
}

criterion_group!(benches, bench_call_wait, bench_all_cpus, bench_rendezvous);
criterion_main!(benches);
