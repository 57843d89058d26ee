//! Training and sampling orchestrator.
//!
//! [`CellFlow`] owns the collaborators (bridge, path engine, OT sampler,
//! dispersion table, velocity model) and drives them through a two-phase
//! state machine: an optional encoder-pretraining phase fitting the
//! reconstruction likelihood, then a joint phase fitting the velocity field
//! with flow matching. The transition happens exactly once, at a configured
//! epoch boundary, and freezes the bridge.
//!
//! Per-batch tensors are ephemeral; only the collaborator parameters persist
//! across steps.

use crate::bridge::{EncoderKind, LatentBridge, Scaler};
use crate::coupling::{CouplingConfig, OtPlanSampler};
use crate::field::{TrainableVelocityModel, VelocityModel};
use crate::nb::DispersionTable;
use crate::ode::{FlowOde, OdeMethod};
use crate::path::ConditionalPath;
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One minibatch of cells: raw counts and normalized expression keyed by
/// modality, covariate category indices keyed by covariate name.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub x: BTreeMap<String, Array2<f32>>,
    pub x_norm: BTreeMap<String, Array2<f32>>,
    pub y: BTreeMap<String, Vec<usize>>,
}

/// Covariate-conditioning collaborator: category indices to embedding rows.
pub trait CovariateEmbedding {
    /// Number of categories this covariate can take.
    fn n_cat(&self) -> usize;

    /// True when the embedding is a fixed one-hot encoding (no trainable
    /// parameters).
    ///
    /// Consumed by the external training loop, which groups optimizer
    /// parameters differently for learnt embeddings; nothing in this crate
    /// branches on it.
    fn one_hot(&self) -> bool;

    /// Embed a batch of category indices, one row per sample. Unknown
    /// categories are fatal.
    fn embed(&self, categories: &[usize]) -> Result<Array2<f32>>;
}

/// Fixed one-hot covariate embedding.
#[derive(Debug, Clone, Copy)]
pub struct OneHotEmbedding {
    n_cat: usize,
}

impl OneHotEmbedding {
    pub fn new(n_cat: usize) -> Result<Self> {
        if n_cat == 0 {
            return Err(Error::Domain("covariate needs at least one category"));
        }
        Ok(Self { n_cat })
    }
}

impl CovariateEmbedding for OneHotEmbedding {
    fn n_cat(&self) -> usize {
        self.n_cat
    }

    fn one_hot(&self) -> bool {
        true
    }

    fn embed(&self, categories: &[usize]) -> Result<Array2<f32>> {
        let mut out = Array2::<f32>::zeros((categories.len(), self.n_cat));
        for (i, &c) in categories.iter().enumerate() {
            if c >= self.n_cat {
                return Err(Error::Domain("unknown covariate category"));
            }
            out[[i, c]] = 1.0;
        }
        Ok(out)
    }
}

/// Per-category mean and standard deviation of the log size factor, fitted
/// on training data and used to sample size factors at inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeFactorStats {
    mean: Array1<f32>,
    sd: Array1<f32>,
}

impl SizeFactorStats {
    pub fn new(mean: Array1<f32>, sd: Array1<f32>) -> Result<Self> {
        if mean.len() != sd.len() || mean.is_empty() {
            return Err(Error::Shape("mean and sd must be nonempty and aligned"));
        }
        if sd.iter().any(|&s| !(s >= 0.0) || !s.is_finite()) {
            return Err(Error::Domain("sd entries must be nonnegative and finite"));
        }
        Ok(Self { mean, sd })
    }

    /// Fit per-category statistics from observed log size factors.
    /// Every category in `0..n_cat` must be observed at least once.
    pub fn fit(log_size_factors: &[f32], categories: &[usize], n_cat: usize) -> Result<Self> {
        if log_size_factors.len() != categories.len() {
            return Err(Error::Shape("values and categories must align"));
        }
        let mut sum = vec![0.0f64; n_cat];
        let mut sum_sq = vec![0.0f64; n_cat];
        let mut count = vec![0usize; n_cat];
        for (&v, &c) in log_size_factors.iter().zip(categories.iter()) {
            if c >= n_cat {
                return Err(Error::Domain("unknown covariate category"));
            }
            sum[c] += v as f64;
            sum_sq[c] += (v as f64) * (v as f64);
            count[c] += 1;
        }
        let mut mean = Array1::<f32>::zeros(n_cat);
        let mut sd = Array1::<f32>::zeros(n_cat);
        for c in 0..n_cat {
            if count[c] == 0 {
                return Err(Error::Domain("covariate category has no observations"));
            }
            let m = sum[c] / count[c] as f64;
            let var = (sum_sq[c] / count[c] as f64 - m * m).max(0.0);
            mean[c] = m as f32;
            sd[c] = var.sqrt() as f32;
        }
        Self::new(mean, sd)
    }

    pub fn n_cat(&self) -> usize {
        self.mean.len()
    }

    fn for_category(&self, c: usize) -> Result<(f32, f32)> {
        if c >= self.mean.len() {
            return Err(Error::Domain("unknown covariate category"));
        }
        Ok((self.mean[c], self.sd[c]))
    }
}

/// Training phase; the transition to `Joint` is one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pretraining,
    Joint,
}

/// Which data split a step runs on; identical computation, but validation
/// never updates parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
        }
    }
}

/// Active optimizer settings; reset at the phase transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimSettings {
    pub lr: f32,
    pub weight_decay: f32,
}

/// Scalar outcome of one step plus the metrics worth logging.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub batch_size: usize,
    pub phase: Phase,
    /// True when the OT coupling degraded to the identity pairing.
    pub coupling_fallback: bool,
}

/// Constructor-level configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellFlowConfig {
    /// Key into `Batch::x` / `Batch::x_norm`.
    pub modality: String,
    /// Key into `Batch::y`.
    pub conditioning_covariate: String,
    pub encoder: EncoderKind,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// Learning rate during encoder pretraining (weight decay is off there).
    pub pretrain_lr: f32,
    /// Constant noise scale of the probability path.
    pub sigma: f32,
    pub antithetic_time_sampling: bool,
    pub pretrain_encoder: bool,
    /// Epoch at which pretraining ends and the bridge freezes.
    pub pretraining_epochs: usize,
    /// One dispersion row per covariate category instead of a global row.
    pub covariate_specific_dispersion: bool,
    pub coupling: CouplingConfig,
    pub seed: u64,
}

impl Default for CellFlowConfig {
    fn default() -> Self {
        Self {
            modality: "rna".to_string(),
            conditioning_covariate: "cell_type".to_string(),
            encoder: EncoderKind::Fixed,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            pretrain_lr: 1e-3,
            sigma: 0.1,
            antithetic_time_sampling: true,
            pretrain_encoder: false,
            pretraining_epochs: 0,
            covariate_specific_dispersion: false,
            coupling: CouplingConfig::default(),
            seed: 0,
        }
    }
}

/// Conditional flow-matching model over expression counts.
pub struct CellFlow<F> {
    cfg: CellFlowConfig,
    field: F,
    bridge: LatentBridge,
    theta: DispersionTable,
    path: ConditionalPath,
    sampler: OtPlanSampler,
    embedding: Box<dyn CovariateEmbedding>,
    scaler: Box<dyn Scaler>,
    sf_stats: SizeFactorStats,
    phase: Phase,
    optim: OptimSettings,
    genes: usize,
    rng: ChaCha8Rng,
}

impl<F: VelocityModel> CellFlow<F> {
    pub fn new(
        cfg: CellFlowConfig,
        field: F,
        embedding: Box<dyn CovariateEmbedding>,
        scaler: Box<dyn Scaler>,
        sf_stats: SizeFactorStats,
        genes: usize,
    ) -> Result<Self> {
        for (name, v) in [
            ("learning_rate", cfg.learning_rate),
            ("weight_decay", cfg.weight_decay),
            ("pretrain_lr", cfg.pretrain_lr),
        ] {
            if !(v >= 0.0) || !v.is_finite() {
                tracing::error!(name, value = v, "invalid optimizer hyperparameter");
                return Err(Error::Domain("optimizer hyperparameters must be finite and nonnegative"));
            }
        }
        let path = ConditionalPath::new(cfg.sigma)?;
        let bridge = LatentBridge::new(&cfg.encoder, genes, cfg.seed)?;
        if field.latent_dim() != bridge.latent_dim() {
            return Err(Error::Shape("velocity model must match the bridge latent dimension"));
        }
        if sf_stats.n_cat() != embedding.n_cat() {
            return Err(Error::Shape("size factor stats must cover every covariate category"));
        }
        let theta = if cfg.covariate_specific_dispersion {
            DispersionTable::per_category(embedding.n_cat(), genes, cfg.seed.wrapping_add(1))?
        } else {
            DispersionTable::global(genes, cfg.seed.wrapping_add(1))
        };
        let pretraining = cfg.pretrain_encoder && cfg.pretraining_epochs > 0;
        let (phase, optim) = if pretraining {
            (
                Phase::Pretraining,
                OptimSettings {
                    lr: cfg.pretrain_lr,
                    weight_decay: 0.0,
                },
            )
        } else {
            (
                Phase::Joint,
                OptimSettings {
                    lr: cfg.learning_rate,
                    weight_decay: cfg.weight_decay,
                },
            )
        };
        let rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let sampler = OtPlanSampler::new(cfg.coupling);
        Ok(Self {
            cfg,
            field,
            bridge,
            theta,
            path,
            sampler,
            embedding,
            scaler,
            sf_stats,
            phase,
            optim,
            genes,
            rng,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn optim(&self) -> OptimSettings {
        self.optim
    }

    pub fn bridge(&self) -> &LatentBridge {
        &self.bridge
    }

    pub fn dispersion(&self) -> &DispersionTable {
        &self.theta
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    /// Couplings attempted so far and how many fell back to identity.
    pub fn coupling_fallback_stats(&self) -> (u64, u64) {
        self.sampler.fallback_stats()
    }

    /// One-shot phase transition, invoked by the training loop at the start
    /// of every epoch. At the boundary epoch the bridge freezes and the
    /// optimizer settings reset to their joint-phase values. No reverse
    /// transition exists.
    pub fn on_epoch_start(&mut self, epoch: usize) {
        if self.phase == Phase::Pretraining && epoch >= self.cfg.pretraining_epochs {
            self.bridge.freeze();
            self.optim = OptimSettings {
                lr: self.cfg.learning_rate,
                weight_decay: self.cfg.weight_decay,
            };
            self.phase = Phase::Joint;
            tracing::info!(epoch, "encoder pretraining finished, entering joint phase");
        }
    }

    /// Per-sample training times. With antithetic sampling the batch shares
    /// one uniform offset in `[0, 1/B)` and the times sit at spacing `1/B`,
    /// stratifying the unit interval; otherwise i.i.d. uniform.
    pub fn sample_times(&mut self, batch_size: usize) -> Array1<f32> {
        let b = batch_size.max(1);
        if self.cfg.antithetic_time_sampling {
            let offset: f32 = self.rng.random::<f32>() / b as f32;
            Array1::from_shape_fn(batch_size, |i| offset + i as f32 / b as f32)
        } else {
            Array1::from_shape_fn(batch_size, |_| self.rng.random::<f32>())
        }
    }

    fn standard_normal(&mut self, n: usize, d: usize) -> Array2<f32> {
        let mut z = Array2::<f32>::zeros((n, d));
        for v in z.iter_mut() {
            *v = StandardNormal.sample(&mut self.rng);
        }
        z
    }

    /// Pull this model's modality and covariate out of a batch and derive
    /// the per-cell size factors. Cells with no counts are fatal.
    fn unpack<'b>(
        &self,
        batch: &'b Batch,
    ) -> Result<(&'b Array2<f32>, &'b Array2<f32>, &'b [usize], Array1<f32>)> {
        let x = batch
            .x
            .get(&self.cfg.modality)
            .ok_or(Error::Shape("batch is missing the configured modality"))?;
        let x_norm = batch
            .x_norm
            .get(&self.cfg.modality)
            .ok_or(Error::Shape("batch is missing normalized expression"))?;
        let y = batch
            .y
            .get(&self.cfg.conditioning_covariate)
            .ok_or(Error::Shape("batch is missing the conditioning covariate"))?;
        let n = x.nrows();
        if x.ncols() != self.genes {
            return Err(Error::Shape("count matrix must have the configured gene dimension"));
        }
        if x_norm.nrows() != n || x_norm.ncols() != x.ncols() || y.len() != n {
            return Err(Error::Shape("batch fields must agree on cell count"));
        }
        let sf = x.sum_axis(Axis(1));
        if sf.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(Error::Domain("every cell needs a positive total count"));
        }
        Ok((x, x_norm, y.as_slice(), sf))
    }

    /// Draw `n` synthetic cells.
    ///
    /// Covariate categories default to uniform draws; log size factors
    /// default to per-category Normal draws from the fitted statistics. The
    /// noise batch is integrated through the velocity field over `[0, 1]`
    /// with `n_sample_steps` output points, decoded to NB means, and
    /// count-sampled.
    pub fn sample(
        &mut self,
        n: usize,
        n_sample_steps: usize,
        covariate_indices: Option<&[usize]>,
        log_size_factor: Option<&ArrayView1<f32>>,
        method: OdeMethod,
    ) -> Result<Array2<f32>> {
        if n == 0 {
            return Err(Error::Domain("sample size must be nonzero"));
        }
        let cats: Vec<usize> = match covariate_indices {
            Some(c) => {
                if c.len() != n {
                    return Err(Error::Shape("covariate indices must have sample length"));
                }
                c.to_vec()
            }
            None => (0..n)
                .map(|_| self.rng.random_range(0..self.embedding.n_cat()))
                .collect(),
        };
        let log_sf: Array1<f32> = match log_size_factor {
            Some(v) => {
                if v.len() != n {
                    return Err(Error::Shape("log size factors must have sample length"));
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(Error::Domain("log size factors must be finite"));
                }
                v.to_owned()
            }
            None => {
                let mut out = Array1::<f32>::zeros(n);
                for (i, &c) in cats.iter().enumerate() {
                    let (m, s) = self.sf_stats.for_category(c)?;
                    let normal = Normal::new(m, s)
                        .map_err(|_| Error::Domain("invalid size factor statistics"))?;
                    out[i] = normal.sample(&mut self.rng);
                }
                out
            }
        };

        let cond = self.embedding.embed(&cats)?;
        let noise = self.standard_normal(n, self.bridge.latent_dim());

        let z1 = {
            let ode = FlowOde::new(&self.field, log_sf.clone(), cond)?;
            ode.integrate(&noise.view(), n_sample_steps, method)?
        };

        let sf = log_sf.mapv(f32::exp);
        let mu = self.bridge.decode(&z1.view(), &sf.view(), self.scaler.as_ref())?;
        self.theta.sample_counts(&mu.view(), &cats, &mut self.rng)
    }

    /// [`sample`](Self::sample) in sequential chunks of at most
    /// `batch_size` cells, dropping each chunk's intermediates before the
    /// next, so peak memory stays bounded by the chunk size. Conditioning
    /// arguments cover all `total` cells and are sliced per chunk.
    pub fn batched_sample(
        &mut self,
        total: usize,
        batch_size: usize,
        n_sample_steps: usize,
        covariate_indices: Option<&[usize]>,
        log_size_factor: Option<&ArrayView1<f32>>,
        method: OdeMethod,
    ) -> Result<Array2<f32>> {
        if batch_size == 0 {
            return Err(Error::Domain("chunk size must be nonzero"));
        }
        if let Some(c) = covariate_indices {
            if c.len() != total {
                return Err(Error::Shape("covariate indices must have total length"));
            }
        }
        if let Some(v) = log_size_factor {
            if v.len() != total {
                return Err(Error::Shape("log size factors must have total length"));
            }
        }
        let mut out = Array2::<f32>::zeros((total, self.genes));
        let mut start = 0usize;
        while start < total {
            let end = (start + batch_size).min(total);
            let chunk_cats = covariate_indices.map(|c| &c[start..end]);
            let chunk_sf = log_size_factor.map(|v| v.slice(s![start..end]));
            let counts = self.sample(
                end - start,
                n_sample_steps,
                chunk_cats,
                chunk_sf.as_ref(),
                method,
            )?;
            out.slice_mut(s![start..end, ..]).assign(&counts);
            start = end;
        }
        Ok(out)
    }
}

impl<F: TrainableVelocityModel> CellFlow<F> {
    /// One optimization step (or a pure evaluation when `split` is
    /// validation). The loss is the NB reconstruction loss during
    /// pretraining and the flow-matching MSE in the joint phase; the two are
    /// never blended.
    pub fn train_step(&mut self, batch: &Batch, split: Split) -> Result<StepOutput> {
        let (x, x_norm, y, sf) = self.unpack(batch)?;
        let n = x.nrows();
        let cond = self.embedding.embed(y)?;
        let x_scaled = self.scaler.scale(&x_norm.view(), false);
        let updates = split == Split::Train;
        let OptimSettings { lr, weight_decay } = self.optim;

        match self.phase {
            Phase::Pretraining => {
                let loss = if updates {
                    self.bridge.pretrain_step(
                        &x.view(),
                        &x_scaled.view(),
                        &sf.view(),
                        y,
                        &mut self.theta,
                        self.scaler.as_ref(),
                        lr,
                    )?
                } else {
                    self.bridge.recon_loss(
                        &x.view(),
                        &x_scaled.view(),
                        &sf.view(),
                        y,
                        &self.theta,
                        self.scaler.as_ref(),
                    )?
                };
                tracing::debug!(
                    split = split.as_str(),
                    batch_size = n,
                    loss,
                    "reconstruction step"
                );
                Ok(StepOutput {
                    loss,
                    batch_size: n,
                    phase: self.phase,
                    coupling_fallback: false,
                })
            }
            Phase::Joint => {
                let x0 = self.bridge.encode(&x_scaled.view())?;
                let d = x0.ncols();
                let noise = self.standard_normal(n, d);
                let log_sf = sf.mapv(f32::ln);

                // Noise rides the t=0 slot; data is reordered to sit across
                // from its transport-matched noise row.
                let outcome = self.sampler.sample_plan(&noise.view(), &x0.view())?;
                let x1 = outcome.reorder(&x0.view());

                let t = self.sample_times(n);
                let (xt, ut) = self.path.sample_location_and_flow(
                    &noise.view(),
                    &x1.view(),
                    &t.view(),
                    &mut self.rng,
                )?;

                let loss = if updates {
                    self.field.sgd_step(
                        &xt.view(),
                        &t.view(),
                        &log_sf.view(),
                        &cond.view(),
                        &ut.view(),
                        lr,
                        weight_decay,
                    )
                } else {
                    let pred =
                        self.field
                            .velocity(&xt.view(), &t.view(), &log_sf.view(), &cond.view());
                    let mut se = 0.0f64;
                    for (p, u) in pred.iter().zip(ut.iter()) {
                        let r = (p - u) as f64;
                        se += r * r;
                    }
                    (se / pred.len().max(1) as f64) as f32
                };
                tracing::debug!(
                    split = split.as_str(),
                    batch_size = n,
                    loss,
                    fallback = outcome.is_fallback(),
                    "flow matching step"
                );
                Ok(StepOutput {
                    loss,
                    batch_size: n,
                    phase: self.phase,
                    coupling_fallback: outcome.is_fallback(),
                })
            }
        }
    }

    /// Validation step: same computation as training, no parameter updates.
    pub fn valid_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.train_step(batch, Split::Valid)
    }
}
