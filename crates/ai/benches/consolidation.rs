use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use opforge_ai::{
    consolidate, finalize, Candidate, ConsolidationPolicy, EvidenceRecord, EvidenceSet,
    ExpansionDraft, GatePolicy, Kernel, Platform, ValidationRules,
};
use opforge_core::TargetId;

const WORDS: [&str; 12] = [
    "onboarding", "emails", "churn", "pricing", "founders", "outreach", "support", "tickets",
    "retention", "demo", "trial", "signup",
];

fn title(i: usize) -> String {
    (0..4)
        .map(|w| WORDS[(i * 7 + w * 5) % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn kernels(n: usize) -> Vec<Kernel> {
    (0..n)
        .map(|i| Kernel {
            index: i,
            title: title(i),
            angle: "angle".to_string(),
            confidence: (i % 10) as f64 / 10.0,
            source_urls: vec![format!("https://example.com/{i}")],
        })
        .collect()
}

fn bench_consolidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_consolidation");
    let policy = ConsolidationPolicy::default();

    for n in [16usize, 64, 200] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let input = kernels(n);
            b.iter(|| consolidate(black_box(input.clone()), &policy));
        });
    }

    group.finish();
}

fn bench_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("expansion_finalize");
    let rules = ValidationRules::default();

    for n in [8usize, 32] {
        let input: Vec<Candidate> = kernels(n)
            .iter()
            .enumerate()
            .map(|(rank, k)| {
                Candidate::from_draft(
                    rank,
                    k,
                    ExpansionDraft {
                        title: k.title.clone(),
                        hook: "a hook that is long enough to score".to_string(),
                        body: "body ".repeat(40),
                        format: None,
                    },
                )
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(n), &input, |b, input| {
            b.iter(|| finalize(black_box(input.clone()), &rules, 0.75));
        });
    }

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let now = Utc::now();
    let records: Vec<EvidenceRecord> = (0..200)
        .map(|i| EvidenceRecord {
            platform: Platform::ALL[i % Platform::ALL.len()],
            text: format!("{} and some more words for record {i}", title(i)),
            has_rich_content: i % 3 == 0,
            author: format!("author-{}", i % 40),
            url: format!("https://example.com/p/{i}"),
            published_at: now,
            engagement: None,
        })
        .collect();
    let set = EvidenceSet::new(TargetId::new(), records);
    let policy = GatePolicy::default();

    c.bench_function("gate_evaluate_200", |b| {
        b.iter(|| policy.evaluate(black_box(&set), now));
    });
}

criterion_group!(benches, bench_consolidate, bench_finalize, bench_gate);
criterion_main!(benches);
