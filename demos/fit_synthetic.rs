// demos/fit_synthetic.rs
//
// Fits a factor model to a small synthetic multi-omics cohort and writes the
// result tables to a temporary directory.
//
//   RUST_LOG=debug cargo run --release --example fit_synthetic

use efficient_gfa::{
    associate, io, CovariateTable, FactorModelConfig, FactorModelEngine, Likelihood,
    MultiViewDataset, SampleAlignment, View,
};
use log::info;
use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::error::Error;

const NUM_MICE: usize = 48;

fn main() -> Result<(), Box<dyn Error>> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_micros()
        .init();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let normal = Normal::new(0.0, 1.0)?;
    let mouse_ids: Vec<String> = (0..NUM_MICE).map(|i| format!("M{:02}", i + 1)).collect();

    // Factor 1 tracks genotype, factor 2 tracks age.
    let genotype: Vec<bool> = (0..NUM_MICE).map(|i| i % 2 == 0).collect();
    let age: Vec<f64> = (0..NUM_MICE).map(|_| rng.gen_range(3.0..18.0)).collect();
    let z = Array2::from_shape_fn((NUM_MICE, 3), |(n, k)| match k {
        0 => if genotype[n] { 1.0 } else { -1.0 },
        1 => (age[n] - 10.5) / 4.3,
        _ => normal.sample(&mut rng),
    });

    let mut views = Vec::new();
    for (name, num_features, likelihood) in [
        ("transcriptome", 300, Likelihood::Gaussian),
        ("proteome", 60, Likelihood::Gaussian),
        ("lipidome", 40, Likelihood::Gaussian),
        ("variants", 25, Likelihood::Bernoulli),
    ] {
        let w = Array2::from_shape_fn((num_features, 3), |_| normal.sample(&mut rng));
        let linear = w.dot(&z.t());
        let data = match likelihood {
            Likelihood::Bernoulli => linear.mapv(|eta| {
                if rng.gen::<f64>() < 1.0 / (1.0 + (-eta).exp()) { 1.0 } else { 0.0 }
            }),
            _ => linear.mapv(|mu| mu + 0.5 * normal.sample(&mut rng)),
        };
        // The proteome was only run on the first 40 mice.
        let measured = if name == "proteome" { 40 } else { NUM_MICE };
        let kept: Vec<usize> = (0..measured).collect();
        views.push(View::new(
            name,
            (0..num_features).map(|j| format!("{}_{}", name, j)).collect(),
            mouse_ids[..measured].to_vec(),
            data.select(Axis(1), &kept),
            likelihood,
        )?);
    }

    let covariates = CovariateTable::new(mouse_ids.clone())?
        .with_categorical(
            "genotype",
            genotype
                .iter()
                .map(|&g| Some(if g { "5xFAD" } else { "WT" }.to_string()))
                .collect(),
        )?
        .with_continuous("age_months", age)?;

    let dataset =
        MultiViewDataset::assemble(views, Some(covariates.clone()), SampleAlignment::Union)?;
    let config = FactorModelConfig {
        num_factors: 6,
        seed: Some(2025),
        scale_views: true,
        drop_factor_threshold: Some(0.01),
        require_convergence: false,
        ..FactorModelConfig::default()
    };
    let model = FactorModelEngine::new(config)?.fit(&dataset)?;

    let stats = model.training_stats();
    info!(
        "{} iterations, converged: {}, final ELBO {:?}, {} factors dropped",
        stats.iterations,
        stats.converged,
        stats.final_elbo(),
        stats.dropped_factors
    );
    let table = associate(&model, &covariates)?.with_benjamini_hochberg();
    for entry in table.entries().iter().filter(|e| e.p_value < 1e-3) {
        info!(
            "{} ~ {}: statistic {:.3}, p = {:.2e}",
            entry.factor, entry.covariate, entry.statistic, entry.p_value
        );
    }
    for view in model.view_names() {
        let top = model.top_features(view, 0, 3)?;
        info!("Top {} features on Factor1: {:?}", view, top);
    }

    let out_dir = std::env::temp_dir().join("efficient_gfa_demo");
    std::fs::create_dir_all(&out_dir)?;
    io::write_factors_tsv(out_dir.join("factors.tsv"), &model)?;
    io::write_variance_explained_tsv(out_dir.join("variance_explained.tsv"), model.variance_explained())?;
    io::write_association_tsv(out_dir.join("associations.tsv"), &table)?;
    for view in model.view_names() {
        io::write_loadings_tsv(out_dir.join(format!("loadings_{}.tsv", view)), &model, view)?;
    }
    model.save_model(out_dir.join("model.bin"))?;
    info!("Wrote results to {}", out_dir.display());
    Ok(())
}
