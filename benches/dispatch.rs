use std::sync::Arc;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use streamq::{
    Config, GroupQueue, ListQueue, MemoryStore, Message, MessageQueue, StartPosition, Subscription,
};

const MESSAGES_PER_ITER: usize = 1_000;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

fn bench_group_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("group_dispatch");
    for &batch_size in &[1_usize, 16, 128] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let queue =
                            GroupQueue::new(Arc::new(MemoryStore::new()), &Config::default());
                        let ctx = CancellationToken::new();
                        rt.block_on(async {
                            for i in 0..MESSAGES_PER_ITER {
                                let msg = Message::new("bench", i.to_le_bytes().to_vec());
                                queue.send(&ctx, &msg).await.expect("send");
                            }
                        });
                        (queue, ctx)
                    },
                    |(queue, ctx)| {
                        let sub = Subscription {
                            start: StartPosition::Origin,
                            batch_size,
                            ..Subscription::for_group("bench", "g", "c")
                        };
                        let stop = ctx.clone();
                        let mut handled = 0;
                        let handler = move |msg: &Message| -> anyhow::Result<()> {
                            black_box(msg.body());
                            handled += 1;
                            if handled == MESSAGES_PER_ITER {
                                stop.cancel();
                            }
                            Ok(())
                        };
                        let _ = rt.block_on(queue.consume(&ctx, &sub, handler));
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_list_dispatch(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("list_dispatch", |b| {
        b.iter_batched(
            || {
                let queue = ListQueue::new(Arc::new(MemoryStore::new()), &Config::default());
                let ctx = CancellationToken::new();
                rt.block_on(async {
                    for i in 0..MESSAGES_PER_ITER {
                        let msg = Message::new("bench", i.to_le_bytes().to_vec());
                        queue.send(&ctx, &msg).await.expect("send");
                    }
                });
                (queue, ctx)
            },
            |(queue, ctx)| {
                let stop = ctx.clone();
                let mut handled = 0;
                let sub = Subscription::new("bench");
                let handler = move |msg: &Message| -> anyhow::Result<()> {
                    black_box(msg.body());
                    handled += 1;
                    if handled == MESSAGES_PER_ITER {
                        stop.cancel();
                    }
                    Ok(())
                };
                let _ = rt.block_on(queue.consume(&ctx, &sub, handler));
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_group_dispatch, bench_list_dispatch);
criterion_main!(benches);
