use criterion::{Criterion, criterion_group, criterion_main};

use casemill::progress::ProgressAggregator;

fn bench_trigger_ingestion(c: &mut Criterion) {
    let messages = [
        "identification started for disk01.dd",
        "collection started for disk01.dd",
        "collecting artefacts from disk01.dd",
        "registry hive parsed without issue",
        "processing image 2 of 4",
        "parsing artefacts from disk01.dd",
        "processing complete for disk01.dd",
    ];

    c.bench_function("observe_trigger_stream", |b| {
        b.iter(|| {
            let mut agg = ProgressAggregator::new(4, 8);
            for message in &messages {
                agg.observe(message);
            }
            agg.finalize()
        })
    });
}

criterion_group!(benches, bench_trigger_ingestion);
criterion_main!(benches);
