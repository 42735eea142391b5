// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! End-to-end properties of the simulation engine.

use std::sync::Arc;

use approx::assert_relative_eq;
use shunt_config::{
    AllReduceAlgorithm, DeviceSpec, LevelSpec, LinkSpec, ModelConfig, OpConfig, OpSpec,
    ParallelismConfig, Precision, SystemConfig, TaskConfig, TaskKind, TopologySpec,
};
use shunt_engine::types::Condition;
use shunt_engine::{Engine, SimError};
use shunt_track::tracker::{InMemoryTracker, SpanFilter, Tracker};

fn device_spec() -> DeviceSpec {
    DeviceSpec {
        f64_flops: 25e12,
        f32_flops: 50e12,
        f16_flops: 100e12,
        i8_ops: 200e12,
        flops_util: 1.0,
        mem_cap: 16 << 30,
        mem_bw: 1e15,
        mem_bw_util: 1.0,
    }
}

fn flat_system(devices: usize, bandwidth: f64, latency: f64) -> SystemConfig {
    SystemConfig {
        name: "flat".to_string(),
        device: device_spec(),
        topology: TopologySpec {
            levels: vec![LevelSpec {
                name: "node".to_string(),
                size: devices,
                link: LinkSpec { bandwidth, latency },
            }],
        },
    }
}

fn one_matmul_model() -> ModelConfig {
    ModelConfig {
        name: "one-matmul".to_string(),
        bytes_per_nonemb_param: 2,
        bytes_per_emb_param: 2,
        seq_len: None,
        ops: vec![OpConfig {
            name: "mm".to_string(),
            spec: OpSpec::MatMul {
                m: 1024,
                n: 1024,
                k: 1024,
            },
            precision: None,
            inputs: None,
        }],
    }
}

fn task(kind: TaskKind, batch: u64, parallelism: ParallelismConfig) -> TaskConfig {
    TaskConfig {
        name: "bench".to_string(),
        kind,
        global_batch_size: batch,
        iterations: 1,
        parallelism,
        precision: Precision::F16,
        sharding: Default::default(),
        allreduce: AllReduceAlgorithm::Ring,
        checkpoint: None,
    }
}

fn degrees(data: usize, tensor: usize, pipeline: usize, expert: usize) -> ParallelismConfig {
    ParallelismConfig {
        data,
        tensor,
        pipeline,
        expert,
    }
}

#[test]
fn single_device_matmul_is_pure_compute() {
    let engine = Engine::default();
    let report = engine
        .simulate(
            &one_matmul_model(),
            &flat_system(1, 100e9, 1e-6),
            &task(TaskKind::Inference, 1, degrees(1, 1, 1, 1)),
        )
        .unwrap();

    let expected = 2.0 * 1024.0f64.powi(3) / 100e12;
    assert_relative_eq!(report.step_time_s, expected, max_relative = 1e-12);
    assert_eq!(report.comm_time.total_s(), 0.0);
    assert_relative_eq!(report.device_compute_util[0], 1.0, max_relative = 1e-12);
}

#[test]
fn two_way_tensor_parallel_adds_the_ring_allreduce() {
    let bandwidth = 100e9;
    let latency = 1e-6;
    let engine = Engine::default();
    let report = engine
        .simulate(
            &one_matmul_model(),
            &flat_system(2, bandwidth, latency),
            &task(TaskKind::Inference, 1, degrees(1, 2, 1, 1)),
        )
        .unwrap();

    let per_device_compute = 2.0 * 1024.0f64.powi(3) / 2.0 / 100e12;
    let payload = 1024.0 * 1024.0 * 2.0;
    let ring = 2.0 * (2.0 - 1.0) / 2.0 * payload / bandwidth + (2.0 - 1.0) * latency;
    // The all-reduce gates on the partial sums, so it follows the compute
    // on the critical path.
    assert_relative_eq!(
        report.step_time_s,
        per_device_compute + ring,
        max_relative = 1e-9
    );
    assert_relative_eq!(report.comm_time.allreduce_s, ring, max_relative = 1e-9);
}

#[test]
fn step_time_is_never_below_the_slowest_device_compute() {
    let engine = Engine::default();
    let model = ModelConfig {
        name: "chain".to_string(),
        bytes_per_nonemb_param: 2,
        bytes_per_emb_param: 2,
        seq_len: None,
        ops: (0..6)
            .map(|i| OpConfig {
                name: format!("mm{i}"),
                spec: OpSpec::MatMul {
                    m: 256,
                    n: 512,
                    k: 512,
                },
                precision: None,
                inputs: None,
            })
            .collect(),
    };
    let report = engine
        .simulate(
            &model,
            &flat_system(4, 50e9, 1e-6),
            &task(TaskKind::Train, 8, degrees(2, 1, 2, 1)),
        )
        .unwrap();

    let max_busy = report
        .device_compute_util
        .iter()
        .map(|u| u * report.step_time_s)
        .fold(0.0f64, f64::max);
    assert!(report.step_time_s >= max_busy);
    assert!(report.step_time_s > 0.0);
}

#[test]
fn doubling_bandwidth_never_slows_a_bandwidth_bound_run() {
    let engine = Engine::default();
    let run = |bandwidth: f64| {
        engine
            .simulate(
                &one_matmul_model(),
                &flat_system(2, bandwidth, 1e-6),
                &task(TaskKind::Train, 2, degrees(1, 2, 1, 1)),
            )
            .unwrap()
            .step_time_s
    };
    let slow = run(10e9);
    let fast = run(20e9);
    assert!(fast <= slow);
}

#[test]
fn peak_memory_is_bounded_and_reported_per_device() {
    let engine = Engine::default();
    let model = one_matmul_model();
    let report = engine
        .simulate(
            &model,
            &flat_system(1, 100e9, 1e-6),
            &task(TaskKind::Inference, 1, degrees(1, 1, 1, 1)),
        )
        .unwrap();

    let param_bytes = 1024 * 1024 * 2;
    let activation_bytes = 1024 * 1024 * 2;
    assert!(report.device_peak_mem_bytes[0] >= param_bytes);
    assert!(report.device_peak_mem_bytes[0] <= param_bytes + activation_bytes);
    assert!(report.device_final_mem_bytes[0] <= report.device_peak_mem_bytes[0]);
}

#[test]
fn identical_configurations_yield_identical_reports_and_timelines() {
    let model = one_matmul_model();
    let system = flat_system(4, 50e9, 1e-6);
    let run_task = task(TaskKind::Train, 8, degrees(2, 2, 1, 1));

    let run = || {
        let tracker = Arc::new(InMemoryTracker::new(Arc::new(SpanFilter::all())));
        let as_tracker: Tracker = tracker.clone();
        let engine = Engine::new(&as_tracker);
        let report = engine.simulate(&model, &system, &run_task).unwrap();
        (serde_json::to_string(&report).unwrap(), tracker.spans())
    };

    let (report_a, spans_a) = run();
    let (report_b, spans_b) = run();
    assert_eq!(report_a, report_b);
    assert_eq!(spans_a.len(), spans_b.len());
    for (a, b) in spans_a.iter().zip(&spans_b) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.device, b.device);
        assert_eq!(a.start_s, b.start_s);
        assert_eq!(a.end_s, b.end_s);
    }
}

#[test]
fn memory_overflow_is_flagged_but_still_timed() {
    let mut system = flat_system(1, 100e9, 1e-6);
    // 1 MB of device memory cannot hold a 2 MB weight matrix.
    system.device.mem_cap = 1 << 20;
    let engine = Engine::default();
    let report = engine
        .simulate(
            &one_matmul_model(),
            &system,
            &task(TaskKind::Inference, 1, degrees(1, 1, 1, 1)),
        )
        .unwrap();

    assert!(
        report
            .conditions
            .contains(&Condition::MemoryOverflow { device: 0 })
    );
    assert!(report.step_time_s > 0.0);
}

#[test]
fn fatal_errors_carry_the_offending_identifiers() {
    let engine = Engine::default();
    let err = engine
        .simulate(
            &one_matmul_model(),
            &flat_system(4, 100e9, 1e-6),
            &task(TaskKind::Inference, 1, degrees(1, 2, 1, 1)),
        )
        .unwrap_err();
    match err {
        SimError::Strategy(inner) => {
            assert!(inner.to_string().contains("2 devices"));
        }
        other => panic!("expected strategy error, got {other}"),
    }
}

#[test]
fn pipeline_training_reports_comm_and_utilization() {
    let engine = Engine::default();
    let model = ModelConfig {
        name: "pipe".to_string(),
        bytes_per_nonemb_param: 2,
        bytes_per_emb_param: 2,
        seq_len: Some(256),
        ops: (0..4)
            .map(|i| OpConfig {
                name: format!("mm{i}"),
                spec: OpSpec::MatMul {
                    m: 256,
                    n: 512,
                    k: 512,
                },
                precision: None,
                inputs: None,
            })
            .collect(),
    };
    let report = engine
        .simulate(
            &model,
            &flat_system(2, 50e9, 1e-6),
            &task(TaskKind::Train, 4, degrees(1, 1, 2, 1)),
        )
        .unwrap();

    // Activations forward plus gradients backward cross the stage boundary.
    assert!(report.comm_time.sendrecv_s > 0.0);
    assert!(report.throughput_tokens_per_s.unwrap() > 0.0);
    assert!(report.link_util.iter().any(|&u| u > 0.0));
    assert!(report.device_compute_util.iter().all(|&u| u <= 1.0 + 1e-9));
}

#[test]
fn checkpoint_overhead_stretches_total_time() {
    let engine = Engine::default();
    let mut with_checkpoint = task(TaskKind::Inference, 1, degrees(1, 1, 1, 1));
    with_checkpoint.iterations = 10;
    with_checkpoint.checkpoint = Some(shunt_config::CheckpointConfig {
        interval: 5,
        overhead_s: 1.0,
    });
    let report = engine
        .simulate(
            &one_matmul_model(),
            &flat_system(1, 100e9, 1e-6),
            &with_checkpoint,
        )
        .unwrap();

    // Two checkpoints over ten iterations.
    assert_relative_eq!(
        report.total_time_s,
        10.0 * report.step_time_s + 2.0,
        max_relative = 1e-9
    );
    assert!(report.throughput_samples_per_s > 0.0);
}
