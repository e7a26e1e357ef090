use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use vault_importer::import_state::ProductRanges;
use vault_importer::optimizer::{optimize_with_rng, OptimizerOptions};
use vault_importer::types::Range;

/// Products with a history of random holes, all ending at the same head.
fn product_ranges(count: usize, rng: &mut StdRng) -> Vec<ProductRanges<u64>> {
    let head = 40_000_000;
    (0..count)
        .map(|i| {
            let origin = rng.gen_range(30_000_000..head - 100_000);
            let mut covered = Vec::new();
            let mut from = origin;
            while from < head - 10_000 {
                let to = (from + rng.gen_range(1_000..500_000)).min(head);
                covered.push(Range::new(from, to).unwrap());
                from = to + rng.gen_range(1..20_000);
            }
            ProductRanges {
                product_key: format!("beefy:vault:bsc:{i}"),
                full_range: Range::new(origin, head).unwrap(),
                covered_ranges: covered,
                to_retry: Vec::new(),
            }
        })
        .collect()
}

pub fn optimizer(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    for products in [10, 100, 500] {
        let states = product_ranges(products, &mut StdRng::seed_from_u64(products as u64));
        for max_addresses_per_query in [1, 50] {
            let options = OptimizerOptions {
                ignore_import_state: false,
                max_addresses_per_query,
                max_range_size: 3000,
                max_queries_per_product: 10,
            };
            group.bench_with_input(
                BenchmarkId::new(format!("{max_addresses_per_query} addresses"), products),
                &states,
                |b, states| {
                    let mut rng = StdRng::seed_from_u64(1);
                    b.iter(|| optimize_with_rng(states, &options, &mut rng).unwrap())
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, optimizer);
criterion_main!(benches);
