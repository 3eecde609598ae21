use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use efficient_gfa::{
    FactorModelConfig, FactorModelEngine, Likelihood, MultiViewDataset, SampleAlignment, View,
};
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;

// Low-rank views with uniform noise; every view shares the same samples.
fn generate_dataset(n_samples: usize, view_dims: &[usize], rank: usize) -> MultiViewDataset {
    let z: Array2<f64> = Array::random((n_samples, rank), Normal::new(0.0, 1.0).unwrap());
    let sample_ids: Vec<String> = (0..n_samples).map(|i| format!("s{}", i)).collect();
    let views = view_dims
        .iter()
        .enumerate()
        .map(|(v, &d)| {
            let w: Array2<f64> = Array::random((d, rank), Normal::new(0.0, 1.0).unwrap());
            let x = w.dot(&z.t()) + Array::random((d, n_samples), Uniform::new(-0.5, 0.5));
            View::new(
                format!("view{}", v),
                (0..d).map(|j| format!("f{}", j)).collect(),
                sample_ids.clone(),
                x,
                Likelihood::Gaussian,
            )
            .unwrap()
        })
        .collect();
    MultiViewDataset::assemble(views, None, SampleAlignment::Union).unwrap()
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("GFA_fit");
    group.sample_size(10);

    for &(n_samples, ref dims, n_factors) in [
        (100, vec![200, 50], 5),
        (106, vec![2000, 454, 243, 860], 15),
        (300, vec![500, 500], 10),
    ]
    .iter()
    {
        let dataset = generate_dataset(n_samples, dims, 5);
        let total_features: usize = dims.iter().sum();
        let config = FactorModelConfig {
            num_factors: n_factors,
            seed: Some(42),
            max_iterations: 50,
            require_convergence: false,
            ..FactorModelConfig::default()
        };
        let engine = FactorModelEngine::new(config).unwrap();
        group.throughput(Throughput::Elements((n_samples * total_features) as u64));
        group.bench_with_input(
            BenchmarkId::new("fit", format!("{}x{}_k{}", n_samples, total_features, n_factors)),
            &dataset,
            |b, data| b.iter(|| engine.fit(data).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fit);
criterion_main!(benches);
