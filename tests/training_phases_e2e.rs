use cellflow::bridge::{AffineScaler, EncoderKind};
use cellflow::field::LinearVelocityField;
use cellflow::model::{
    Batch, CellFlow, CellFlowConfig, OneHotEmbedding, Phase, SizeFactorStats, Split,
};
use cellflow::Result;
use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const GENES: usize = 8;
const N_CAT: usize = 2;

/// Two-cluster synthetic counts: each category has its own expression
/// profile, so the conditional flow has real structure to learn.
fn synthetic_batch(n: usize, seed: u64) -> Batch {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let profiles = [
        [8.0f32, 5.0, 1.0, 0.5, 3.0, 0.5, 2.0, 1.0],
        [0.5f32, 1.0, 6.0, 9.0, 0.5, 4.0, 1.0, 2.0],
    ];
    let mut x = Array2::<f32>::zeros((n, GENES));
    let mut cats = Vec::with_capacity(n);
    for i in 0..n {
        let c = i % N_CAT;
        cats.push(c);
        for k in 0..GENES {
            // Crude Poisson-ish jitter around the profile mean.
            let jitter: f32 = rng.random::<f32>() * profiles[c][k].sqrt();
            x[[i, k]] = (profiles[c][k] + jitter - 0.5 * profiles[c][k].sqrt()).max(0.0).round();
        }
        x[[i, 0]] += 1.0;
    }
    let sf = x.sum_axis(Axis(1));
    let mut x_norm = x.clone();
    for (i, mut row) in x_norm.rows_mut().into_iter().enumerate() {
        for v in row.iter_mut() {
            *v /= sf[i];
        }
    }
    let mut batch = Batch::default();
    batch.x.insert("rna".to_string(), x);
    batch.x_norm.insert("rna".to_string(), x_norm);
    batch.y.insert("cell_type".to_string(), cats);
    batch
}

fn stats_from(batch: &Batch) -> SizeFactorStats {
    let x = &batch.x["rna"];
    let cats = &batch.y["cell_type"];
    let log_sf: Vec<f32> = x
        .sum_axis(Axis(1))
        .iter()
        .map(|s| s.ln())
        .collect();
    SizeFactorStats::fit(&log_sf, cats, N_CAT).unwrap()
}

fn build_model(cfg: CellFlowConfig, batch: &Batch, latent: usize) -> CellFlow<LinearVelocityField> {
    CellFlow::new(
        cfg,
        LinearVelocityField::new_random(latent, N_CAT, 11),
        Box::new(OneHotEmbedding::new(N_CAT).unwrap()),
        Box::new(AffineScaler::identity(GENES)),
        stats_from(batch),
        GENES,
    )
    .unwrap()
}

/// Full two-phase run: reconstruction loss falls during pretraining, the
/// bridge freezes exactly at the boundary epoch, and the flow-matching loss
/// falls during the joint phase while the frozen bridge stays bitwise fixed.
#[test]
fn pretraining_then_joint_training_improves_both_losses() -> Result<()> {
    let batch = synthetic_batch(24, 3);
    let cfg = CellFlowConfig {
        encoder: EncoderKind::LearntEncoder { hidden: vec![16] },
        pretrain_encoder: true,
        pretraining_epochs: 3,
        pretrain_lr: 0.01,
        learning_rate: 0.02,
        weight_decay: 1e-5,
        seed: 7,
        ..CellFlowConfig::default()
    };
    let mut m = build_model(cfg, &batch, GENES);
    assert_eq!(m.phase(), Phase::Pretraining);

    let mut recon = Vec::new();
    for epoch in 0..3 {
        m.on_epoch_start(epoch);
        for _ in 0..25 {
            recon.push(m.train_step(&batch, Split::Train)?.loss);
        }
    }
    assert_eq!(m.phase(), Phase::Pretraining);
    assert!(
        recon[recon.len() - 1] < recon[0],
        "reconstruction loss should fall: {} -> {}",
        recon[0],
        recon[recon.len() - 1]
    );

    m.on_epoch_start(3);
    assert_eq!(m.phase(), Phase::Joint);
    assert!(m.bridge().is_frozen());
    let bridge_norm = m.bridge().param_sq_norm();

    let mut fm = Vec::new();
    for epoch in 3..8 {
        m.on_epoch_start(epoch);
        for _ in 0..40 {
            fm.push(m.train_step(&batch, Split::Train)?.loss);
        }
    }
    let head: f32 = fm[..40].iter().sum::<f32>() / 40.0;
    let tail: f32 = fm[fm.len() - 40..].iter().sum::<f32>() / 40.0;
    assert!(
        tail < head,
        "flow matching loss should fall: {head} -> {tail}"
    );

    // Frozen bridge must not move during joint steps.
    assert_eq!(bridge_norm.to_bits(), m.bridge().param_sq_norm().to_bits());

    let (fallbacks, attempts) = m.coupling_fallback_stats();
    assert_eq!(attempts, 200);
    assert!(fallbacks <= attempts);
    Ok(())
}

/// Validation steps share the training computation but never move
/// parameters, in either phase.
#[test]
fn validation_never_updates_parameters() -> Result<()> {
    let batch = synthetic_batch(16, 5);
    let cfg = CellFlowConfig {
        encoder: EncoderKind::LearntEncoder { hidden: vec![12] },
        pretrain_encoder: true,
        pretraining_epochs: 1,
        seed: 13,
        ..CellFlowConfig::default()
    };
    let mut m = build_model(cfg, &batch, GENES);

    let bridge_before = m.bridge().param_sq_norm();
    let theta_before = m.dispersion().log_theta().clone();
    m.valid_step(&batch)?;
    assert_eq!(bridge_before.to_bits(), m.bridge().param_sq_norm().to_bits());
    assert_eq!(theta_before, *m.dispersion().log_theta());

    m.on_epoch_start(1);
    let weights_before = m.field().weights().clone();
    let out = m.valid_step(&batch)?;
    assert_eq!(out.phase, Phase::Joint);
    assert_eq!(weights_before, *m.field().weights());
    Ok(())
}
