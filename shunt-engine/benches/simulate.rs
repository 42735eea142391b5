// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Benchmark a full simulation of a transformer-style training step.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use shunt_config::{
    DeviceSpec, LevelSpec, LinkSpec, ModelConfig, OpConfig, OpSpec, ParallelismConfig, Precision,
    SystemConfig, TaskConfig, TaskKind, TopologySpec,
};
use shunt_engine::Engine;

fn transformer_model(layers: usize) -> ModelConfig {
    let mut ops = vec![OpConfig {
        name: "tok_emb".to_string(),
        spec: OpSpec::EmbeddingLookup {
            entries: 50304,
            dim: 1024,
            lookups: 2048,
        },
        precision: None,
        inputs: None,
    }];
    for layer in 0..layers {
        ops.push(OpConfig {
            name: format!("l{layer}.attn"),
            spec: OpSpec::Attention {
                seq: 2048,
                heads: 16,
                head_dim: 64,
            },
            precision: None,
            inputs: None,
        });
        ops.push(OpConfig {
            name: format!("l{layer}.mlp_up"),
            spec: OpSpec::MatMul {
                m: 2048,
                n: 4096,
                k: 1024,
            },
            precision: None,
            inputs: None,
        });
        ops.push(OpConfig {
            name: format!("l{layer}.mlp_down"),
            spec: OpSpec::MatMul {
                m: 2048,
                n: 1024,
                k: 4096,
            },
            precision: None,
            inputs: None,
        });
    }
    ModelConfig {
        name: "bench-transformer".to_string(),
        bytes_per_nonemb_param: 6,
        bytes_per_emb_param: 2,
        seq_len: Some(2048),
        ops,
    }
}

fn pod_system() -> SystemConfig {
    SystemConfig {
        name: "bench-pod".to_string(),
        device: DeviceSpec {
            f64_flops: 10e12,
            f32_flops: 20e12,
            f16_flops: 100e12,
            i8_ops: 200e12,
            flops_util: 0.5,
            mem_cap: 80 << 30,
            mem_bw: 2e12,
            mem_bw_util: 0.8,
        },
        topology: TopologySpec {
            levels: vec![
                LevelSpec {
                    name: "node".to_string(),
                    size: 4,
                    link: LinkSpec {
                        bandwidth: 300e9,
                        latency: 1e-6,
                    },
                },
                LevelSpec {
                    name: "cluster".to_string(),
                    size: 2,
                    link: LinkSpec {
                        bandwidth: 25e9,
                        latency: 5e-6,
                    },
                },
            ],
        },
    }
}

fn train_task() -> TaskConfig {
    TaskConfig {
        name: "bench-train".to_string(),
        kind: TaskKind::Train,
        global_batch_size: 16,
        iterations: 1,
        parallelism: ParallelismConfig {
            data: 2,
            tensor: 2,
            pipeline: 2,
            expert: 1,
        },
        precision: Precision::F16,
        sharding: Default::default(),
        allreduce: Default::default(),
        checkpoint: None,
    }
}

fn bench_simulate(c: &mut Criterion) {
    let model = transformer_model(16);
    let system = pod_system();
    let task = train_task();
    let engine = Engine::default();

    c.bench_function("simulate_transformer_16l_8dev", |b| {
        b.iter(|| black_box(engine.simulate(&model, &system, &task).unwrap()))
    });
}

criterion_group!(benches, bench_simulate);
criterion_main!(benches);
