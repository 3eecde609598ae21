// src/engine.rs

//! # Variational factor model engine
//!
//! Fits `X_v ≈ Z W_vᵀ + noise_v` for every view `v` by mean-field coordinate ascent on
//! the evidence lower bound (ELBO).
//!
//! ## Model
//! - `z_n ~ N(0, I_F)` for every sample.
//! - `w_{v,d} ~ N(0, diag(1/α_v))` for every feature, with an ARD precision
//!   `α_{v,k} ~ Gamma(a0, b0)` per view and factor.
//! - `x_{n,d} | z_n, w_d ~ N(z_nᵀ w_d, 1/τ_{v,d})` with `τ_{v,d} ~ Gamma(a0, b0)` for
//!   Gaussian views. Bernoulli and Poisson views replace `x` with pseudo-data from a
//!   quadratic bound and fix `τ` at the bound's curvature (see [`crate::likelihood`]).
//!
//! ## Sweep
//! One iteration updates, in order, `q(W_v)`, `q(α_v)` and `q(τ_v)` for each view,
//! then `q(Z)`. Every sum over samples or features only visits observed entries. The
//! second moments `E[z zᵀ]` and `τ E[w wᵀ]` are summed once per sweep; per-item sums
//! over the observed subset subtract the missing items from that total (or add the
//! observed ones when most are missing).
//!
//! Features are solved in parallel in the W step and samples in the Z step. Results
//! are collected in index order and written back sequentially, so a seeded fit gives
//! the same output for any thread count.

use crate::config::{FactorInitialization, FactorModelConfig};
use crate::data::{AlignedView, MultiViewDataset};
use crate::error::{GfaError, Result};
use crate::likelihood::Likelihood;
use crate::linalg_backends::{invert_symmetric, outer, BackendSVD, NdarrayLinAlgBackend};
use crate::model::{default_factor_names, TrainedModel, TrainingStats, ViewLoadings};
use crate::variance::{self, VarianceExplained, ViewDecomposition};
use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2, Array3, Axis, Zip};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use statrs::function::gamma::{digamma, ln_gamma};
use std::time::Instant;

/// Standard deviation under which a Gaussian feature is treated as constant.
const CONSTANT_FEATURE_STD: f64 = 1e-9;

/// A view after centering, scaling and missingness bookkeeping, in samples × features.
#[derive(Debug, Clone)]
struct PreparedView {
    name: String,
    feature_ids: Vec<String>,
    likelihood: Likelihood,
    /// Raw observations (NaN = missing). Needed to rebuild pseudo-data.
    observations: Array2<f64>,
    /// Values the Gaussian updates fit: processed data or pseudo-data, NaN = missing.
    target: Array2<f64>,
    /// `target` with missing entries set to zero.
    target_filled: Array2<f64>,
    feature_means: Array1<f64>,
    view_scale: f64,
    /// Fixed noise precision per feature for non-Gaussian views.
    kappa: Option<Array1<f64>>,
    observed_per_feature: Array1<f64>,
    /// Sorted sample indices missing for each feature.
    missing_by_feature: Vec<Vec<usize>>,
    /// Sorted feature indices missing for each sample.
    missing_by_sample: Vec<Vec<usize>>,
    num_features: usize,
}

impl PreparedView {
    fn prepare(view: &AlignedView, config: &FactorModelConfig) -> Result<Self> {
        let name = view.name().to_string();
        let likelihood = view.likelihood();
        let observations = view.data().to_owned();
        let (num_samples, num_features) = observations.dim();

        if view.num_observed() == 0 {
            return Err(GfaError::empty_view(
                &name,
                "no observed entries after sample alignment",
            ));
        }

        let mut target = observations.clone();
        let mut feature_means = Array1::<f64>::zeros(num_features);
        let mut view_scale = 1.0;

        if likelihood.is_gaussian() {
            let mut num_constant = 0usize;
            for (d, mut column) in target.axis_iter_mut(Axis(1)).enumerate() {
                let (count, sum) = column
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold((0usize, 0.0_f64), |(c, s), &v| (c + 1, s + v));
                if count == 0 {
                    continue;
                }
                let mean = sum / count as f64;
                let variance = column
                    .iter()
                    .filter(|v| !v.is_nan())
                    .map(|v| (v - mean).powi(2))
                    .sum::<f64>()
                    / count as f64;
                if variance.sqrt() < CONSTANT_FEATURE_STD {
                    // Constant features would drive their noise precision to infinity.
                    // Their loadings stay at zero, so the mean alone reconstructs them.
                    feature_means[d] = mean;
                    column.fill(f64::NAN);
                    num_constant += 1;
                    continue;
                }
                if config.center_features {
                    feature_means[d] = mean;
                    column.mapv_inplace(|v| v - mean);
                }
            }
            if num_constant > 0 {
                warn!(
                    "View '{}': {} constant features are excluded from the likelihood.",
                    name, num_constant
                );
            }

            if config.scale_views {
                let observed: Vec<f64> = target.iter().copied().filter(|v| !v.is_nan()).collect();
                if !observed.is_empty() {
                    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
                    let std = (observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / observed.len() as f64)
                        .sqrt();
                    if std > CONSTANT_FEATURE_STD {
                        view_scale = std;
                        target.mapv_inplace(|v| v / std);
                    }
                }
            }
        }

        if target.iter().all(|v| v.is_nan()) {
            return Err(GfaError::empty_view(
                &name,
                "every observed feature is constant",
            ));
        }

        let kappa = observations
            .axis_iter(Axis(1))
            .map(|column| likelihood.bound_precision(column))
            .collect::<Option<Array1<f64>>>();

        let mut missing_by_feature = vec![Vec::new(); num_features];
        let mut missing_by_sample = vec![Vec::new(); num_samples];
        for ((n, d), value) in target.indexed_iter() {
            if value.is_nan() {
                missing_by_feature[d].push(n);
                missing_by_sample[n].push(d);
            }
        }
        let observed_per_feature = missing_by_feature
            .iter()
            .map(|missing| (num_samples - missing.len()) as f64)
            .collect::<Array1<f64>>();
        let target_filled = target.mapv(|v| if v.is_nan() { 0.0 } else { v });

        trace!(
            "Prepared view '{}' ({}): {} x {}, {} missing entries, scale {:.4}",
            name,
            likelihood,
            num_samples,
            num_features,
            missing_by_feature.iter().map(Vec::len).sum::<usize>(),
            view_scale
        );

        let mut prepared = Self {
            name,
            feature_ids: view.feature_ids().to_vec(),
            likelihood,
            observations,
            target,
            target_filled,
            feature_means,
            view_scale,
            kappa,
            observed_per_feature,
            missing_by_feature,
            missing_by_sample,
            num_features,
        };
        if !likelihood.is_gaussian() {
            prepared.refresh_pseudo_data(&Array2::zeros((num_samples, num_features)));
        }
        Ok(prepared)
    }

    fn is_unobserved_sample(&self, sample: usize) -> bool {
        self.missing_by_sample[sample].len() == self.num_features
    }

    /// Rebuilds pseudo-data around the linear predictor `zeta` (samples × features).
    fn refresh_pseudo_data(&mut self, zeta: &Array2<f64>) {
        let Some(kappa) = self.kappa.as_ref() else {
            return;
        };
        let likelihood = self.likelihood;
        Zip::indexed(&mut self.target)
            .and(&mut self.target_filled)
            .and(&self.observations)
            .and(zeta)
            .for_each(|(_, d), target, filled, &y, &z| {
                if y.is_nan() {
                    return;
                }
                let pseudo = likelihood.pseudo_observation(y, z, kappa[d]);
                *target = pseudo;
                *filled = pseudo;
            });
    }
}

/// Per-item second moments together with their sum over all items.
struct SecondMoments {
    items: Array3<f64>,
    total: Array2<f64>,
}

impl SecondMoments {
    fn from_items(items: Array3<f64>) -> Self {
        let total = items.sum_axis(Axis(0));
        Self { items, total }
    }

    /// Sum over all items except `missing` (sorted).
    fn observed_sum(&self, missing: &[usize]) -> Array2<f64> {
        if missing.is_empty() {
            return self.total.clone();
        }
        let count = self.items.len_of(Axis(0));
        if 2 * missing.len() <= count {
            let mut out = self.total.clone();
            for &i in missing {
                out -= &self.items.index_axis(Axis(0), i);
            }
            out
        } else {
            let dim = self.total.nrows();
            let mut out = Array2::<f64>::zeros((dim, dim));
            let mut skip = missing.iter().peekable();
            for i in 0..count {
                if skip.peek() == Some(&&i) {
                    skip.next();
                    continue;
                }
                out += &self.items.index_axis(Axis(0), i);
            }
            out
        }
    }
}

/// q(Z): one Gaussian per sample.
struct FactorPosterior {
    mean: Array2<f64>,
    cov: Array3<f64>,
    log_det: Array1<f64>,
}

impl FactorPosterior {
    fn second_moments(&self) -> SecondMoments {
        let mut items = self.cov.clone();
        for (n, mut slab) in items.axis_iter_mut(Axis(0)).enumerate() {
            let m = self.mean.row(n);
            slab += &outer(m, m);
        }
        SecondMoments::from_items(items)
    }

    fn drop_factor(&mut self, keep: &[usize]) {
        self.mean = self.mean.select(Axis(1), keep);
        self.cov = self.cov.select(Axis(1), keep).select(Axis(2), keep);
    }
}

/// q(W_v), q(α_v) and q(τ_v) of one view.
struct ViewPosterior {
    w_mean: Array2<f64>,
    w_cov: Array3<f64>,
    w_log_det: Array1<f64>,
    alpha_shape: f64,
    alpha_rate: Array1<f64>,
    tau_shape: Array1<f64>,
    tau_rate: Array1<f64>,
}

impl ViewPosterior {
    fn new(num_features: usize, num_factors: usize, config: &FactorModelConfig) -> Self {
        Self {
            w_mean: Array2::zeros((num_features, num_factors)),
            w_cov: Array3::zeros((num_features, num_factors, num_factors)),
            w_log_det: Array1::zeros(num_features),
            alpha_shape: config.ard_prior_shape,
            alpha_rate: Array1::from_elem(num_factors, config.ard_prior_rate),
            tau_shape: Array1::from_elem(num_features, config.noise_prior_shape),
            tau_rate: Array1::from_elem(num_features, config.noise_prior_rate),
        }
    }

    fn expected_alpha(&self) -> Array1<f64> {
        self.alpha_rate.mapv(|b| self.alpha_shape / b)
    }

    fn expected_log_alpha(&self) -> Array1<f64> {
        let psi = digamma(self.alpha_shape);
        self.alpha_rate.mapv(|b| psi - b.ln())
    }

    fn expected_tau(&self, view: &PreparedView) -> Array1<f64> {
        match &view.kappa {
            Some(kappa) => kappa.clone(),
            None => &self.tau_shape / &self.tau_rate,
        }
    }

    fn expected_log_tau(&self, view: &PreparedView) -> Array1<f64> {
        match &view.kappa {
            Some(kappa) => kappa.mapv(f64::ln),
            None => Zip::from(&self.tau_shape)
                .and(&self.tau_rate)
                .map_collect(|&a, &b| digamma(a) - b.ln()),
        }
    }

    /// `τ_d E[w_d w_dᵀ]` per feature.
    fn weighted_second_moments(&self, tau: &Array1<f64>) -> SecondMoments {
        let mut items = self.w_cov.clone();
        for (d, mut slab) in items.axis_iter_mut(Axis(0)).enumerate() {
            let mu = self.w_mean.row(d);
            slab += &outer(mu, mu);
            slab *= tau[d];
        }
        SecondMoments::from_items(items)
    }

    fn drop_factor(&mut self, keep: &[usize]) {
        self.w_mean = self.w_mean.select(Axis(1), keep);
        self.w_cov = self.w_cov.select(Axis(1), keep).select(Axis(2), keep);
        self.alpha_rate = self.alpha_rate.select(Axis(0), keep);
    }
}

/// Runs variational inference for the multi-view factor model.
#[derive(Debug, Clone)]
pub struct FactorModelEngine {
    config: FactorModelConfig,
}

impl FactorModelEngine {
    /// Creates an engine after validating the configuration.
    pub fn new(config: FactorModelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FactorModelConfig {
        &self.config
    }

    /// Fits the model to an assembled dataset.
    ///
    /// # Errors
    /// - `InvalidFactorCount` if `num_factors` is zero or exceeds `min(N, Σ D_v)`.
    /// - `EmptyView` if a view has no usable entries, or a sample is unobserved in
    ///   every view.
    /// - `ConvergenceFailure` if the ELBO becomes non-finite, decreases in a model with
    ///   only Gaussian views, or (with `require_convergence`) the iteration budget is
    ///   exhausted before the tolerance is met.
    pub fn fit(&self, dataset: &MultiViewDataset) -> Result<TrainedModel> {
        let overall_start_time = Instant::now();
        let config = &self.config;
        let num_samples = dataset.num_samples();
        let max_feasible = num_samples.min(dataset.total_features());
        if config.num_factors == 0 || config.num_factors > max_feasible {
            return Err(GfaError::InvalidFactorCount {
                requested: config.num_factors,
                max_feasible,
            });
        }
        info!(
            "Fitting {} factors to {} samples across {} views ({} features in total).",
            config.num_factors,
            num_samples,
            dataset.num_views(),
            dataset.total_features()
        );

        let preparation_start_time = Instant::now();
        let mut views = dataset
            .views()
            .iter()
            .map(|view| PreparedView::prepare(view, config))
            .collect::<Result<Vec<_>>>()?;
        for (n, sample_id) in dataset.sample_ids().iter().enumerate() {
            if views.iter().all(|view| view.is_unobserved_sample(n)) {
                return Err(GfaError::empty_view(
                    "all views",
                    format!("sample '{}' has no observed entries", sample_id),
                ));
            }
        }
        info!("Prepared views in {:?}", preparation_start_time.elapsed());

        let mut factors = self.initialize_factors(&views, num_samples)?;
        let mut posteriors: Vec<ViewPosterior> = views
            .iter()
            .map(|view| ViewPosterior::new(view.num_features, config.num_factors, config))
            .collect();

        let all_gaussian = views.iter().all(|view| view.likelihood.is_gaussian());
        let mut elbo_trace: Vec<f64> = Vec::new();
        let mut converged = false;
        let mut dropped_factors = 0usize;
        let mut skip_divergence_check = false;
        let mut iterations = 0usize;

        let optimization_start_time = Instant::now();
        for iteration in 1..=config.max_iterations {
            iterations = iteration;
            let iteration_start_time = Instant::now();

            let factor_moments = factors.second_moments();
            for (view, posterior) in views.iter().zip(posteriors.iter_mut()) {
                update_loadings(view, &factors, &factor_moments, posterior, config.eigenvalue_floor)?;
                update_ard(posterior, config);
                update_noise(view, &factors, &factor_moments, posterior, config);
            }
            update_factors(&views, &posteriors, &mut factors, config.eigenvalue_floor)?;

            let factor_moments = factors.second_moments();
            let elbo = evidence_lower_bound(&views, &posteriors, &factors, &factor_moments, config);
            let previous = elbo_trace.last().copied();
            check_elbo(
                iteration,
                elbo,
                previous,
                config.divergence_tolerance,
                all_gaussian && !skip_divergence_check,
            )?;
            skip_divergence_check = false;
            elbo_trace.push(elbo);
            debug!(
                "Iteration {}: ELBO = {:.6}, {} factors, {:?}",
                iteration,
                elbo,
                factors.mean.ncols(),
                iteration_start_time.elapsed()
            );

            if !all_gaussian {
                for (view, posterior) in views.iter_mut().zip(posteriors.iter()) {
                    if view.kappa.is_some() {
                        let zeta = factors.mean.dot(&posterior.w_mean.t());
                        view.refresh_pseudo_data(&zeta);
                    }
                }
            }

            if let Some(threshold) = config.drop_factor_threshold {
                if let Some(weakest) = weakest_factor(&views, &posteriors, &factors, threshold) {
                    let keep: Vec<usize> =
                        (0..factors.mean.ncols()).filter(|&k| k != weakest).collect();
                    factors.drop_factor(&keep);
                    for posterior in posteriors.iter_mut() {
                        posterior.drop_factor(&keep);
                    }
                    dropped_factors += 1;
                    skip_divergence_check = true;
                    info!(
                        "Iteration {}: dropped a factor below {:.4} variance explained; {} remain.",
                        iteration,
                        threshold,
                        keep.len()
                    );
                    continue;
                }
            }

            if let Some(prev) = previous {
                let relative_change = (elbo - prev).abs() / prev.abs().max(f64::MIN_POSITIVE);
                if iteration >= config.min_iterations
                    && relative_change < config.convergence_tolerance
                {
                    converged = true;
                    info!(
                        "Converged after {} iterations (relative ELBO change {:.3e}).",
                        iteration, relative_change
                    );
                    break;
                }
            }
        }
        info!(
            "Variational optimization finished in {:?}",
            optimization_start_time.elapsed()
        );

        if !converged {
            let detail = format!(
                "relative ELBO change stayed above {:e} within {} iterations",
                config.convergence_tolerance, config.max_iterations
            );
            if config.require_convergence {
                return Err(GfaError::ConvergenceFailure { iterations, detail });
            }
            warn!("Returning an unconverged model: {}.", detail);
        }

        let model = self.finalize(
            dataset,
            &views,
            &posteriors,
            &factors,
            TrainingStats {
                iterations,
                converged,
                elbo_trace,
                num_factors_requested: config.num_factors,
                dropped_factors,
                elapsed_seconds: overall_start_time.elapsed().as_secs_f64(),
            },
        )?;
        info!(
            "Factor model fit complete: {} factors in {:?}",
            model.num_factors(),
            overall_start_time.elapsed()
        );
        Ok(model)
    }

    fn initialize_factors(
        &self,
        views: &[PreparedView],
        num_samples: usize,
    ) -> Result<FactorPosterior> {
        let num_factors = self.config.num_factors;
        let mean = match self.config.initialization {
            FactorInitialization::Random => {
                let mut rng = match self.config.seed {
                    Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                    None => ChaCha8Rng::from_rng(rand::thread_rng()).map_err(|e| {
                        GfaError::InvalidInput(format!(
                            "Failed to seed the random number generator: {}",
                            e
                        ))
                    })?,
                };
                let normal_dist = Normal::new(0.0, 1.0).map_err(|e| {
                    GfaError::InvalidInput(format!(
                        "Failed to create the initialization distribution: {}",
                        e
                    ))
                })?;
                Array2::from_shape_fn((num_samples, num_factors), |_| normal_dist.sample(&mut rng))
            }
            FactorInitialization::Pca => {
                let total_features: usize = views.iter().map(|v| v.num_features).sum();
                let mut stacked = Array2::<f64>::zeros((num_samples, total_features));
                let mut offset = 0usize;
                for view in views {
                    stacked
                        .slice_mut(s![.., offset..offset + view.num_features])
                        .assign(&view.target_filled);
                    offset += view.num_features;
                }
                let svd = NdarrayLinAlgBackend.svd_into(stacked, true, false)?;
                let u = svd.u.ok_or_else(|| {
                    GfaError::Linalg("SVD did not return left singular vectors".into())
                })?;
                let available = num_factors.min(u.ncols());
                let scale = (num_samples as f64).sqrt();
                let mut mean = Array2::<f64>::zeros((num_samples, num_factors));
                mean.slice_mut(s![.., ..available])
                    .assign(&u.slice(s![.., ..available]).mapv(|v| v * scale));
                mean
            }
        };
        debug!(
            "Initialized factor means ({:?}), shape {:?}",
            self.config.initialization,
            mean.dim()
        );
        Ok(FactorPosterior {
            mean,
            cov: Array3::zeros((num_samples, num_factors, num_factors)),
            log_det: Array1::zeros(num_samples),
        })
    }

    fn finalize(
        &self,
        dataset: &MultiViewDataset,
        views: &[PreparedView],
        posteriors: &[ViewPosterior],
        factors: &FactorPosterior,
        stats: TrainingStats,
    ) -> Result<TrainedModel> {
        let num_factors = factors.mean.ncols();
        let decompositions: Vec<ViewDecomposition> = views
            .iter()
            .zip(posteriors)
            .map(|(view, posterior)| {
                variance::decompose_view(
                    view.target.view(),
                    factors.mean.view(),
                    posterior.w_mean.view(),
                )
            })
            .collect();

        // Strongest factor first.
        let summed: Vec<f64> = (0..num_factors)
            .map(|k| decompositions.iter().map(|dec| dec.per_factor[k]).sum())
            .collect();
        let mut order: Vec<usize> = (0..num_factors).collect();
        order.sort_by(|&a, &b| {
            summed[b]
                .partial_cmp(&summed[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let factor_scores = factors.mean.select(Axis(1), &order);
        let view_loadings: Vec<ViewLoadings> = views
            .iter()
            .zip(posteriors)
            .map(|(view, posterior)| ViewLoadings {
                name: view.name.clone(),
                feature_ids: view.feature_ids.clone(),
                likelihood: view.likelihood,
                loadings: posterior.w_mean.select(Axis(1), &order),
                feature_precision: posterior.expected_tau(view),
                feature_means: view.feature_means.clone(),
                view_scale: view.view_scale,
            })
            .collect();
        let sorted_decompositions: Vec<ViewDecomposition> = decompositions
            .into_iter()
            .map(|dec| ViewDecomposition {
                per_factor: dec.per_factor.select(Axis(0), &order),
                total: dec.total,
            })
            .collect();
        for (view, dec) in views.iter().zip(&sorted_decompositions) {
            info!(
                "View '{}': {:.2}% of variance explained by {} factors.",
                view.name,
                dec.total * 100.0,
                num_factors
            );
        }

        let variance_explained = VarianceExplained::from_decompositions(
            views.iter().map(|v| v.name.clone()).collect(),
            default_factor_names(num_factors),
            &sorted_decompositions,
        )?;

        Ok(TrainedModel::from_parts(
            dataset.sample_ids().to_vec(),
            factor_scores,
            view_loadings,
            variance_explained,
            self.config.clone(),
            stats,
        ))
    }
}

fn update_loadings(
    view: &PreparedView,
    factors: &FactorPosterior,
    factor_moments: &SecondMoments,
    posterior: &mut ViewPosterior,
    eigenvalue_floor: f64,
) -> Result<()> {
    let num_factors = factors.mean.ncols();
    let e_alpha = posterior.expected_alpha();
    let e_tau = posterior.expected_tau(view);
    let z_t_y = factors.mean.t().dot(&view.target_filled);
    let backend = NdarrayLinAlgBackend;

    let solved = (0..view.num_features)
        .into_par_iter()
        .map(|d| {
            let mut precision = factor_moments.observed_sum(&view.missing_by_feature[d]);
            precision *= e_tau[d];
            for k in 0..num_factors {
                precision[[k, k]] += e_alpha[k];
            }
            let inverse = invert_symmetric(&backend, &precision, eigenvalue_floor)?;
            let rhs = z_t_y.column(d).mapv(|v| v * e_tau[d]);
            let mean = inverse.inverse.dot(&rhs);
            Ok((mean, inverse.inverse, inverse.log_det_inverse))
        })
        .collect::<Result<Vec<_>>>()?;

    for (d, (mean, cov, log_det)) in solved.into_iter().enumerate() {
        posterior.w_mean.row_mut(d).assign(&mean);
        posterior.w_cov.index_axis_mut(Axis(0), d).assign(&cov);
        posterior.w_log_det[d] = log_det;
    }
    Ok(())
}

fn update_ard(posterior: &mut ViewPosterior, config: &FactorModelConfig) {
    let num_features = posterior.w_mean.nrows();
    posterior.alpha_shape = config.ard_prior_shape + 0.5 * num_features as f64;
    for k in 0..posterior.w_mean.ncols() {
        let second_moment: f64 = (0..num_features)
            .map(|d| posterior.w_mean[[d, k]].powi(2) + posterior.w_cov[[d, k, k]])
            .sum();
        posterior.alpha_rate[k] = config.ard_prior_rate + 0.5 * second_moment;
    }
}

fn update_noise(
    view: &PreparedView,
    factors: &FactorPosterior,
    factor_moments: &SecondMoments,
    posterior: &mut ViewPosterior,
    config: &FactorModelConfig,
) {
    if !view.likelihood.is_gaussian() {
        return;
    }
    let sse = expected_sse(view, factors, factor_moments, posterior);
    posterior.tau_shape = view
        .observed_per_feature
        .mapv(|n| config.noise_prior_shape + 0.5 * n);
    posterior.tau_rate = sse.mapv(|s| config.noise_prior_rate + 0.5 * s);
}

fn update_factors(
    views: &[PreparedView],
    posteriors: &[ViewPosterior],
    factors: &mut FactorPosterior,
    eigenvalue_floor: f64,
) -> Result<()> {
    let (num_samples, num_factors) = factors.mean.dim();
    let mut rhs = Array2::<f64>::zeros((num_samples, num_factors));
    let mut weighted = Vec::with_capacity(views.len());
    for (view, posterior) in views.iter().zip(posteriors) {
        let e_tau = posterior.expected_tau(view);
        let scaled_target = &view.target_filled * &e_tau.view().insert_axis(Axis(0));
        rhs += &scaled_target.dot(&posterior.w_mean);
        weighted.push(posterior.weighted_second_moments(&e_tau));
    }
    let backend = NdarrayLinAlgBackend;

    let solved = (0..num_samples)
        .into_par_iter()
        .map(|n| {
            let mut precision = Array2::<f64>::eye(num_factors);
            for (view, moments) in views.iter().zip(&weighted) {
                precision += &moments.observed_sum(&view.missing_by_sample[n]);
            }
            let inverse = invert_symmetric(&backend, &precision, eigenvalue_floor)?;
            let mean = inverse.inverse.dot(&rhs.row(n));
            Ok((mean, inverse.inverse, inverse.log_det_inverse))
        })
        .collect::<Result<Vec<_>>>()?;

    for (n, (mean, cov, log_det)) in solved.into_iter().enumerate() {
        factors.mean.row_mut(n).assign(&mean);
        factors.cov.index_axis_mut(Axis(0), n).assign(&cov);
        factors.log_det[n] = log_det;
    }
    Ok(())
}

/// `E[Σ_n (y_nd - z_nᵀ w_d)²]` over the observed samples of every feature.
fn expected_sse(
    view: &PreparedView,
    factors: &FactorPosterior,
    factor_moments: &SecondMoments,
    posterior: &ViewPosterior,
) -> Array1<f64> {
    let z_t_y = factors.mean.t().dot(&view.target_filled);
    let y_sq = view.target_filled.mapv(|v| v * v).sum_axis(Axis(0));
    let sse: Vec<f64> = (0..view.num_features)
        .into_par_iter()
        .map(|d| {
            let z_second = factor_moments.observed_sum(&view.missing_by_feature[d]);
            let mu = posterior.w_mean.row(d);
            let w_second = &posterior.w_cov.index_axis(Axis(0), d) + &outer(mu, mu);
            let quadratic = (&z_second * &w_second).sum();
            let cross = mu.dot(&z_t_y.column(d));
            (y_sq[d] - 2.0 * cross + quadratic).max(0.0)
        })
        .collect();
    Array1::from(sse)
}

/// KL(Gamma(a, b) || Gamma(a0, b0)), rate parameterization.
fn gamma_kl(shape: f64, rate: f64, prior_shape: f64, prior_rate: f64) -> f64 {
    (shape - prior_shape) * digamma(shape) - ln_gamma(shape)
        + ln_gamma(prior_shape)
        + prior_shape * (rate.ln() - prior_rate.ln())
        + shape * (prior_rate - rate) / rate
}

/// Rejects a non-finite ELBO, and with `check_divergence` a relative decrease larger than
/// `divergence_tolerance`.
fn check_elbo(
    iteration: usize,
    elbo: f64,
    previous: Option<f64>,
    divergence_tolerance: f64,
    check_divergence: bool,
) -> Result<()> {
    if !elbo.is_finite() {
        return Err(GfaError::ConvergenceFailure {
            iterations: iteration,
            detail: format!("the ELBO became non-finite ({})", elbo),
        });
    }
    if let Some(prev) = previous {
        if check_divergence && elbo < prev - divergence_tolerance * prev.abs() {
            return Err(GfaError::ConvergenceFailure {
                iterations: iteration,
                detail: format!("the ELBO decreased from {:.6} to {:.6}", prev, elbo),
            });
        }
    }
    Ok(())
}

fn evidence_lower_bound(
    views: &[PreparedView],
    posteriors: &[ViewPosterior],
    factors: &FactorPosterior,
    factor_moments: &SecondMoments,
    config: &FactorModelConfig,
) -> f64 {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let num_factors = factors.mean.ncols();
    let mut elbo = 0.0;

    for (view, posterior) in views.iter().zip(posteriors) {
        let sse = expected_sse(view, factors, factor_moments, posterior);
        let e_tau = posterior.expected_tau(view);
        let e_log_tau = posterior.expected_log_tau(view);
        let mut log_likelihood = 0.0;
        for d in 0..view.num_features {
            let n_d = view.observed_per_feature[d];
            log_likelihood += 0.5 * n_d * (e_log_tau[d] - ln_2pi) - 0.5 * e_tau[d] * sse[d];
        }

        let e_alpha = posterior.expected_alpha();
        let sum_log_alpha = posterior.expected_log_alpha().sum();
        let mut kl_loadings = 0.0;
        for d in 0..view.num_features {
            let quadratic: f64 = (0..num_factors)
                .map(|k| {
                    e_alpha[k]
                        * (posterior.w_mean[[d, k]].powi(2) + posterior.w_cov[[d, k, k]])
                })
                .sum();
            kl_loadings += 0.5
                * (quadratic - sum_log_alpha - posterior.w_log_det[d] - num_factors as f64);
        }

        let kl_alpha: f64 = posterior
            .alpha_rate
            .iter()
            .map(|&rate| {
                gamma_kl(
                    posterior.alpha_shape,
                    rate,
                    config.ard_prior_shape,
                    config.ard_prior_rate,
                )
            })
            .sum();

        let kl_tau: f64 = if view.likelihood.is_gaussian() {
            posterior
                .tau_shape
                .iter()
                .zip(posterior.tau_rate.iter())
                .map(|(&a, &b)| gamma_kl(a, b, config.noise_prior_shape, config.noise_prior_rate))
                .sum()
        } else {
            0.0
        };

        trace!(
            "ELBO terms for '{}': loglik {:.4}, KL(W) {:.4}, KL(alpha) {:.4}, KL(tau) {:.4}",
            view.name,
            log_likelihood,
            kl_loadings,
            kl_alpha,
            kl_tau
        );
        elbo += log_likelihood - kl_loadings - kl_alpha - kl_tau;
    }

    let mut kl_factors = 0.0;
    for n in 0..factors.mean.nrows() {
        let trace = factors.cov.index_axis(Axis(0), n).diag().sum();
        let m = factors.mean.row(n);
        kl_factors += 0.5 * (trace + m.dot(&m) - num_factors as f64 - factors.log_det[n]);
    }
    elbo - kl_factors
}

/// Index of the factor to drop, if its best per-view variance explained is below
/// `threshold`. Never drops the last factor.
fn weakest_factor(
    views: &[PreparedView],
    posteriors: &[ViewPosterior],
    factors: &FactorPosterior,
    threshold: f64,
) -> Option<usize> {
    let num_factors = factors.mean.ncols();
    if num_factors <= 1 {
        return None;
    }
    let mut best = vec![0.0_f64; num_factors];
    for (view, posterior) in views.iter().zip(posteriors) {
        let dec = variance::decompose_view(
            view.target.view(),
            factors.mean.view(),
            posterior.w_mean.view(),
        );
        for (slot, &r2) in best.iter_mut().zip(dec.per_factor.iter()) {
            *slot = slot.max(r2);
        }
    }
    let (index, &value) = best
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if value < threshold {
        trace!("Factor {} explains at most {:.5} of any view.", index, value);
        Some(index)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleAlignment, View};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn moments() -> SecondMoments {
        let mut items = Array3::<f64>::zeros((4, 2, 2));
        for i in 0..4 {
            items[[i, 0, 0]] = (i + 1) as f64;
            items[[i, 1, 1]] = 10.0 * (i + 1) as f64;
        }
        SecondMoments::from_items(items)
    }

    #[test]
    fn observed_sum_subtracts_few_missing() {
        let m = moments();
        let sum = m.observed_sum(&[1]);
        assert_abs_diff_eq!(sum[[0, 0]], 1.0 + 3.0 + 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sum[[1, 1]], 10.0 + 30.0 + 40.0, epsilon = 1e-12);
    }

    #[test]
    fn observed_sum_adds_when_most_are_missing() {
        let m = moments();
        let sum = m.observed_sum(&[0, 2, 3]);
        assert_abs_diff_eq!(sum[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sum[[1, 1]], 20.0, epsilon = 1e-12);
        let none = m.observed_sum(&[0, 1, 2, 3]);
        assert!(none.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn gamma_kl_vanishes_at_the_prior() {
        assert_abs_diff_eq!(gamma_kl(2.5, 0.7, 2.5, 0.7), 0.0, epsilon = 1e-12);
        assert!(gamma_kl(10.0, 2.0, 1e-3, 1e-3) > 0.0);
    }

    #[test]
    fn non_finite_elbo_is_a_convergence_failure() {
        for bad in [f64::NAN, f64::NEG_INFINITY, f64::INFINITY] {
            let err = check_elbo(4, bad, Some(-100.0), 1e-5, false).unwrap_err();
            assert!(matches!(err, GfaError::ConvergenceFailure { iterations: 4, .. }));
        }
        let first = check_elbo(1, f64::NAN, None, 1e-5, true).unwrap_err();
        assert!(matches!(first, GfaError::ConvergenceFailure { iterations: 1, .. }));
    }

    #[test]
    fn elbo_decrease_beyond_tolerance_diverges() {
        let err = check_elbo(7, -101.0, Some(-100.0), 1e-5, true).unwrap_err();
        match err {
            GfaError::ConvergenceFailure { iterations, detail } => {
                assert_eq!(iterations, 7);
                assert!(detail.contains("decreased"), "{}", detail);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Within tolerance, increasing, or with the check disabled.
        assert!(check_elbo(7, -100.0005, Some(-100.0), 1e-5, true).is_ok());
        assert!(check_elbo(7, -99.0, Some(-100.0), 1e-5, true).is_ok());
        assert!(check_elbo(7, -101.0, Some(-100.0), 1e-5, false).is_ok());
        assert!(check_elbo(1, -101.0, None, 1e-5, true).is_ok());
    }

    #[test]
    fn preparation_centers_and_excludes_constant_features() {
        let view = View::new(
            "rna",
            vec!["a".into(), "b".into(), "flat".into()],
            vec!["s1".into(), "s2".into(), "s3".into()],
            array![[1.0, 2.0, 3.0], [10.0, f64::NAN, 14.0], [5.0, 5.0, 5.0]],
            Likelihood::Gaussian,
        )
        .unwrap();
        let dataset = MultiViewDataset::assemble(vec![view], None, SampleAlignment::Union).unwrap();
        let prepared = PreparedView::prepare(&dataset.views()[0], &FactorModelConfig::default()).unwrap();

        assert_abs_diff_eq!(prepared.feature_means[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.feature_means[1], 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.feature_means[2], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.target[[0, 0]], -1.0, epsilon = 1e-12);
        assert_eq!(prepared.target_filled[[1, 1]], 0.0);
        assert!(prepared.target.column(2).iter().all(|v| v.is_nan()));
        assert_eq!(prepared.missing_by_feature[1], vec![1]);
        assert_eq!(prepared.missing_by_feature[2], vec![0, 1, 2]);
        assert_eq!(prepared.missing_by_sample[1], vec![1, 2]);
        assert_eq!(prepared.observed_per_feature.to_vec(), vec![3.0, 2.0, 0.0]);
        assert!(prepared.kappa.is_none());
    }

    #[test]
    fn bernoulli_views_start_from_pseudo_data() {
        let view = View::new(
            "mutations",
            vec!["m".into()],
            vec!["s1".into(), "s2".into(), "s3".into()],
            array![[1.0, 0.0, f64::NAN]],
            Likelihood::Bernoulli,
        )
        .unwrap();
        let dataset = MultiViewDataset::assemble(vec![view], None, SampleAlignment::Union).unwrap();
        let prepared = PreparedView::prepare(&dataset.views()[0], &FactorModelConfig::default()).unwrap();
        assert_abs_diff_eq!(prepared.target[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.target[[1, 0]], -2.0, epsilon = 1e-12);
        assert!(prepared.target[[2, 0]].is_nan());
        assert_eq!(prepared.kappa.as_ref().unwrap()[0], 0.25);
    }
}
