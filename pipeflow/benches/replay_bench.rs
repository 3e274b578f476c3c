//! Benchmarks for log decoding and aggregate replay.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeflow::events::LogEntry;
use pipeflow::execution::Execution;
use pipeflow::prelude::Input;
use pipeflow::testing::{linear_pipeline, TestEngine};

/// Runs a linear pipeline of `steps` echo steps and returns its log.
fn recorded_log(steps: usize) -> (String, Vec<LogEntry>) {
    tokio_test::block_on(async {
        let test = TestEngine::builder()
            .pipeline(linear_pipeline("chain", steps))
            .build()
            .expect("engine");
        let execution = test.run("chain", Input::new()).await.expect("run");
        let entries = test.log(&execution.id).await.expect("log");
        (execution.id.clone(), entries)
    })
}

fn replay_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    for steps in [5, 50] {
        let (execution_id, entries) = recorded_log(steps);
        group.bench_with_input(BenchmarkId::from_parameter(steps), &entries, |b, entries| {
            b.iter(|| Execution::replay(execution_id.as_str(), black_box(entries)).expect("replay"));
        });
    }
    group.finish();
}

fn decode_benchmark(c: &mut Criterion) {
    let (_, entries) = recorded_log(20);
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| entry.encode().expect("encode"))
        .collect();

    c.bench_function("decode_log", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(LogEntry::decode(line).expect("decode"));
            }
        });
    });
}

criterion_group!(benches, replay_benchmark, decode_benchmark);
criterion_main!(benches);
