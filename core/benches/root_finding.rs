use std::hint::black_box;

use carma_mix::{
    algebra::{
        graeffe::find_roots,
        newton::{newton_to_polynomial, values_to_newton},
        DensePoly,
    },
    test_helpers::{large_params, random_distinct_scalars},
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::thread_rng;

// --------------
// | Benchmarks |
// --------------

/// Measures root recovery over the default prime as the mixsize grows
#[allow(non_snake_case)]
pub fn find_roots__large_prime(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_roots__large_prime");
    group.sample_size(10);

    let mut rng = thread_rng();
    for mixsize in [2, 4, 8, 16] {
        let params = large_params(mixsize);
        let field = params.field().unwrap();
        let zeta = params.zeta_scalar().unwrap();
        let roots = random_distinct_scalars(&field, mixsize, &mut rng);
        let poly = DensePoly::build_from_roots(&field, &roots);

        group.throughput(Throughput::Elements(mixsize as u64));
        group.bench_function(BenchmarkId::from_parameter(mixsize), |b| {
            b.iter(|| {
                black_box(
                    find_roots(&poly, &zeta, params.two_exponent, params.odd_factor, &mut rng)
                        .unwrap(),
                )
            })
        });
    }
}

/// Measures the conversion from power sums to a polynomial
#[allow(non_snake_case)]
pub fn newton_to_polynomial__large_prime(c: &mut Criterion) {
    let mut group = c.benchmark_group("newton_to_polynomial__large_prime");

    let mut rng = thread_rng();
    for mixsize in [8, 32, 128] {
        let field = large_params(mixsize).field().unwrap();
        let values = random_distinct_scalars(&field, mixsize, &mut rng);
        let sums = values_to_newton(&field, &values, mixsize);

        group.throughput(Throughput::Elements(mixsize as u64));
        group.bench_function(BenchmarkId::from_parameter(mixsize), |b| {
            b.iter(|| black_box(newton_to_polynomial(&field, &sums, mixsize).unwrap()))
        });
    }
}

criterion_group! {
    name = root_finding;
    config = Criterion::default();
    targets = find_roots__large_prime, newton_to_polynomial__large_prime
}
criterion_main!(root_finding);
