// In tests/factor_model_tests.rs

use efficient_gfa::association::associate;
use efficient_gfa::io::{
    read_covariates_tsv, read_view_tsv, write_association_tsv, write_factors_tsv,
    write_loadings_tsv, write_variance_explained_tsv,
};
use efficient_gfa::{
    CovariateTable, FactorModelConfig, FactorModelEngine, GfaError, Likelihood, MultiViewDataset,
    SampleAlignment, TrainedModel, View,
};
use float_cmp::approx_eq;
use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::fs;
use std::io::Write;

fn mouse_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("M{:03}", i)).collect()
}

/// Planted-factor views. `sample_counts[v]` restricts view `v` to the first samples.
fn synthetic_dataset(
    num_samples: usize,
    dims: &[usize],
    sample_counts: &[usize],
    num_true: usize,
    seed: u64,
) -> (Vec<View>, Array2<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let z = Array2::random_using((num_samples, num_true), normal, &mut rng);
    let ids = mouse_ids(num_samples);
    let mut views = Vec::new();
    for (v, (&d, &n_v)) in dims.iter().zip(sample_counts).enumerate() {
        let w = Array2::random_using((d, num_true), normal, &mut rng);
        let noise = Array2::random_using((d, n_v), normal, &mut rng) * 0.4;
        let signal = w.dot(&z.t());
        let kept: Vec<usize> = (0..n_v).collect();
        let x = signal.select(Axis(1), &kept) + noise;
        views.push(
            View::new(
                format!("omics{}", v),
                (0..d).map(|j| format!("feat{}_{}", v, j)).collect(),
                ids[..n_v].to_vec(),
                x,
                Likelihood::Gaussian,
            )
            .unwrap(),
        );
    }
    (views, z)
}

fn config(num_factors: usize) -> FactorModelConfig {
    FactorModelConfig {
        num_factors,
        seed: Some(2025),
        max_iterations: 300,
        convergence_tolerance: 1e-6,
        require_convergence: false,
        ..FactorModelConfig::default()
    }
}

fn fit(views: Vec<View>, num_factors: usize) -> TrainedModel {
    let dataset = MultiViewDataset::assemble(views, None, SampleAlignment::Union).unwrap();
    FactorModelEngine::new(config(num_factors))
        .unwrap()
        .fit(&dataset)
        .unwrap()
}

fn assert_variance_table_is_consistent(model: &TrainedModel) {
    let table = model.variance_explained();
    for (v, view) in table.view_names().iter().enumerate() {
        let row = table.per_factor().row(v).to_owned();
        let total = table.totals()[v];
        assert!((0.0..=100.0).contains(&total), "{}: total {}", view, total);
        assert!(row.iter().all(|&r| (0.0..=100.0).contains(&r)), "{}: {:?}", view, row);
        assert!(row.sum() <= total + 1e-9, "{}: {} > {}", view, row.sum(), total);
    }
}

#[test]
fn variance_explained_is_bounded_and_reconciled() {
    let (views, _) = synthetic_dataset(60, &[40, 25, 10], &[60, 60, 55], 3, 1);
    let model = fit(views, 5);
    assert_variance_table_is_consistent(&model);
}

#[test]
fn fewer_factors_do_not_explain_more_variance() {
    let (views, _) = synthetic_dataset(70, &[40, 30], &[70, 70], 3, 2);
    let wide = fit(views.clone(), 4);
    let narrow = fit(views, 2);
    for view in ["omics0", "omics1"] {
        let wide_total = wide.variance_explained().total(view).unwrap();
        let narrow_total = narrow.variance_explained().total(view).unwrap();
        assert!(
            narrow_total <= wide_total + 1e-6,
            "{}: 2 factors explain {} but 4 explain {}",
            view,
            narrow_total,
            wide_total
        );
    }
}

fn run_four_view_scenario(dims: [usize; 4]) {
    // The proteome view misses one mouse.
    let (views, _) = synthetic_dataset(106, &dims, &[106, 105, 106, 106], 6, 3);
    let model = fit(views, 15);
    assert_eq!(model.factor_scores().dim(), (106, 15));
    assert_eq!(model.sample_ids().len(), 106);
    for (v, &d) in dims.iter().enumerate() {
        let name = format!("omics{}", v);
        assert_eq!(model.loadings(&name).unwrap().dim(), (d, 15));
    }
    assert_variance_table_is_consistent(&model);
}

#[test]
fn four_view_scenario_scaled_down() {
    run_four_view_scenario([400, 454, 243, 172]);
}

#[test]
#[ignore = "full-size multi-omics scenario; slow"]
fn four_view_scenario_full_size() {
    run_four_view_scenario([19878, 454, 243, 8602]);
}

#[test]
fn save_load_and_rename_leave_arrays_untouched() {
    let (views, _) = synthetic_dataset(40, &[20, 12], &[40, 40], 2, 4);
    let mut model = fit(views, 3);
    let scores = model.factor_scores().to_owned();
    let loadings = model.loadings("omics1").unwrap().to_owned();
    let variance = model.variance_explained().per_factor().to_owned();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gfa_model.bin");
    model.save_model(&path).unwrap();
    let loaded = TrainedModel::load_model(&path).unwrap();
    assert_eq!(loaded.factor_scores(), scores.view());
    assert_eq!(loaded.loadings("omics1").unwrap(), loadings.view());
    assert_eq!(loaded.sample_ids(), model.sample_ids());
    assert_eq!(loaded.config(), model.config());

    let mapping: HashMap<String, String> = [
        ("omics0".to_string(), "transcriptome".to_string()),
        ("omics1".to_string(), "proteome".to_string()),
    ]
    .into_iter()
    .collect();
    model.rename_views(&mapping).unwrap();
    model
        .rename_factors(vec!["Amyloid".into(), "Sex".into(), "Age".into()])
        .unwrap();
    assert_eq!(model.factor_scores(), scores.view());
    assert_eq!(model.loadings("proteome").unwrap(), loadings.view());
    assert_eq!(model.variance_explained().per_factor(), variance.view());
    assert!(matches!(model.loadings("omics1"), Err(GfaError::UnknownView(_))));
}

#[test]
fn planted_covariates_are_detected() {
    let (views, truth) = synthetic_dataset(80, &[30, 20], &[80, 80], 2, 5);
    let model = fit(views, 2);
    let ids = mouse_ids(80);

    let age: Vec<f64> = truth.column(0).iter().map(|z| 6.0 + 2.0 * z).collect();
    let genotype: Vec<Option<String>> = truth
        .column(1)
        .iter()
        .map(|&z| Some(if z > 0.0 { "5xFAD" } else { "WT" }.to_string()))
        .collect();
    let noise: Vec<f64> = (0..80).map(|i| ((i * 37) % 11) as f64).collect();
    let covariates = CovariateTable::new(ids)
        .unwrap()
        .with_continuous("age", age)
        .unwrap()
        .with_categorical("genotype", genotype)
        .unwrap()
        .with_continuous("cage", noise)
        .unwrap();

    let table = associate(&model, &covariates).unwrap().with_benjamini_hochberg();
    let best = |name: &str| {
        (0..model.num_factors())
            .map(|k| table.get(k, name).unwrap().p_value)
            .fold(1.0_f64, f64::min)
    };
    assert!(best("age") < 1e-6, "age p = {}", best("age"));
    assert!(best("genotype") < 1e-4, "genotype p = {}", best("genotype"));
    let adjusted = table.adjusted_p_values().unwrap();
    assert!(table
        .p_values()
        .iter()
        .zip(adjusted.iter())
        .all(|(p, q)| q >= p || approx_eq!(f64, *p, *q, ulps = 4)));
}

#[test]
fn tsv_workflow_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (views, _) = synthetic_dataset(24, &[8, 5], &[24, 20], 1, 6);

    let mut paths = Vec::new();
    for view in &views {
        let path = dir.path().join(format!("{}.tsv", view.name()));
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "feature\t{}", view.sample_ids().join("\t")).unwrap();
        for (feature, row) in view.feature_ids().iter().zip(view.data().rows()) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(f, "{}\t{}", feature, cells.join("\t")).unwrap();
        }
        paths.push((view.name().to_string(), path));
    }
    let covariate_path = dir.path().join("samples.tsv");
    let mut f = fs::File::create(&covariate_path).unwrap();
    writeln!(f, "sample\tsex\tage").unwrap();
    for (i, id) in mouse_ids(24).iter().enumerate() {
        writeln!(f, "{}\t{}\t{}", id, if i % 2 == 0 { "F" } else { "M" }, 3 + i % 5).unwrap();
    }

    let read: Vec<View> = paths
        .iter()
        .map(|(name, path)| read_view_tsv(path, name, Likelihood::Gaussian).unwrap())
        .collect();
    let covariates = read_covariates_tsv(&covariate_path).unwrap();
    let dataset =
        MultiViewDataset::assemble(read, Some(covariates.clone()), SampleAlignment::Union).unwrap();
    assert!(approx_eq!(f64, dataset.observed_fraction("omics1").unwrap(), 20.0 / 24.0, ulps = 4));

    let model = FactorModelEngine::new(config(2)).unwrap().fit(&dataset).unwrap();
    let table = associate(&model, &covariates).unwrap();

    let factors_out = dir.path().join("factors.tsv");
    let loadings_out = dir.path().join("loadings_omics0.tsv");
    let variance_out = dir.path().join("variance.tsv");
    let association_out = dir.path().join("associations.tsv");
    write_factors_tsv(&factors_out, &model).unwrap();
    write_loadings_tsv(&loadings_out, &model, "omics0").unwrap();
    write_variance_explained_tsv(&variance_out, model.variance_explained()).unwrap();
    write_association_tsv(&association_out, &table).unwrap();

    let line_count = |p: &std::path::Path| fs::read_to_string(p).unwrap().lines().count();
    assert_eq!(line_count(&factors_out), 1 + 24);
    assert_eq!(line_count(&loadings_out), 1 + 8);
    assert_eq!(line_count(&variance_out), 1 + 2);
    assert_eq!(line_count(&association_out), 1 + 2 * 2);
    let header = fs::read_to_string(&factors_out).unwrap();
    assert!(header.starts_with("sample_id\tFactor1\tFactor2"));
}

#[test]
fn configuration_loads_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gfa.toml");
    fs::write(
        &path,
        "num_factors = 3\nseed = 11\nscale_views = true\nrequire_convergence = false\n",
    )
    .unwrap();
    let loaded = FactorModelConfig::from_toml_file(&path).unwrap();
    assert_eq!(loaded.num_factors, 3);
    assert_eq!(loaded.seed, Some(11));
    assert!(loaded.scale_views);

    let (views, _) = synthetic_dataset(30, &[12, 9], &[30, 30], 2, 7);
    let dataset = MultiViewDataset::assemble(views, None, SampleAlignment::Union).unwrap();
    let model = FactorModelEngine::new(loaded).unwrap().fit(&dataset).unwrap();
    assert_eq!(model.num_factors(), 3);
    assert!(model.views().iter().all(|v| v.view_scale() > 0.0));
    let reconstruction = model.reconstruct("omics0").unwrap();
    assert_eq!(reconstruction.dim(), (30, 12));
}
