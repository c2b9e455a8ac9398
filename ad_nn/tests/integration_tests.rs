//! Integration tests for training with batch normalization.
//!
//! Exercises the layer across many steps, mode switches and composite graphs
//! built from several operators.

use ad_backend_cpu::{finite_diff_grad, variable, CpuBackend, CpuVariable};
use ad_nn::{batch_norm_in, clip, max, min, BatchNorm, BatchNormConfig, RunningStats};
use ad_tensor::prelude::*;

// ============================================================================
// Test Utilities
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Plain gradient descent: replaces every parameter with `p - lr * grad`.
fn sgd_step(layer: &mut BatchNorm<CpuBackend>, lr: f32) {
    let lr = CpuBackend::scalar(lr);
    for p in layer.params_mut() {
        if let Some(g) = p.grad_data() {
            let updated = CpuBackend::sub(p.data(), &CpuBackend::mul(&g, &lr));
            *p = Variable::named(p.name().unwrap_or("param"), updated);
        }
    }
}

fn squared_error(pred: &CpuVariable, target: &CpuVariable) -> Result<CpuVariable> {
    let diff = pred.sub(target)?;
    diff.mul(&diff)?.sum(None, false)
}

fn batch() -> CpuVariable {
    variable(
        vec![
            0.5, 10.0, //
            1.5, 14.0, //
            -0.5, 9.0, //
            2.5, 11.0, //
            1.0, 16.0, //
            0.0, 8.0, //
            3.0, 12.0, //
            -1.0, 13.0,
        ],
        &[8, 2],
    )
}

// ============================================================================
// Test: Learning scale and shift
// ============================================================================

#[test]
fn test_batch_norm_learns_affine_parameters() -> Result<()> {
    init_tracing();
    eprintln!("\n=== BatchNorm learns gamma/beta ===");

    let x = batch();
    let config = BatchNormConfig::default();

    // Target: the same normalization with known gamma and beta.
    let target = {
        let _no_grad = mode::no_grad();
        let gamma = variable(vec![3.0, -2.0], &[2]);
        let beta = variable(vec![1.0, 0.5], &[2]);
        batch_norm_in(&x, &gamma, &beta, &RunningStats::new(2), config, Mode::Train)?
    };

    let mut layer = BatchNorm::new(config);
    let mut losses = Vec::new();

    for step in 0..150 {
        layer.cleargrads();
        let loss = squared_error(&layer.forward(&x)?, &target)?;
        losses.push(loss.item());
        loss.backward()?;
        sgd_step(&mut layer, 0.05);

        if step % 50 == 0 {
            eprintln!("  Step {:4}: loss = {:.6}", step, loss.item());
        }
    }

    let (first_loss, last_loss) = (losses[0], losses[losses.len() - 1]);
    eprintln!("  Final loss: {:.6} (from {:.4})", last_loss, first_loss);
    assert!(last_loss < first_loss * 1e-3, "loss did not drop: {} -> {}", first_loss, last_loss);

    let gamma = layer.gamma().expect("initialized").as_slice().to_vec();
    let beta = layer.beta().expect("initialized").as_slice().to_vec();
    assert!((gamma[0] - 3.0).abs() < 1e-2 && (gamma[1] + 2.0).abs() < 1e-2, "gamma = {:?}", gamma);
    assert!((beta[0] - 1.0).abs() < 1e-2 && (beta[1] - 0.5).abs() < 1e-2, "beta = {:?}", beta);
    Ok(())
}

// ============================================================================
// Test: Running statistics across steps and modes
// ============================================================================

#[test]
fn test_running_statistics_converge_and_freeze_in_inference() -> Result<()> {
    init_tracing();

    let x = batch();
    let mut layer = BatchNorm::<CpuBackend>::default();
    for _ in 0..200 {
        layer.forward(&x)?;
    }

    // 0.9^200 is negligible, so the averages sit on the batch statistics.
    let data = x.as_slice().to_vec();
    let stats = layer.running_stats().expect("initialized");
    for c in 0..2 {
        let col: Vec<f32> = (0..8).map(|r| data[r * 2 + c]).collect();
        let mean = col.iter().sum::<f32>() / 8.0;
        let unbiased = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 7.0;
        assert!((stats.mean().as_slice()[c] - mean).abs() < 1e-3);
        assert!((stats.var().as_slice()[c] - unbiased).abs() < 1e-3 * unbiased.max(1.0));
    }

    let frozen_mean = stats.mean().to_vec();
    let frozen_var = stats.var().to_vec();
    let shifted = variable(x.as_slice().to_vec().iter().map(|v| v + 100.0).collect(), &[8, 2]);
    let y = {
        let _eval = mode::test_mode();
        layer.forward(&shifted)?
    };
    assert_eq!(stats.mean().to_vec(), frozen_mean);
    assert_eq!(stats.var().to_vec(), frozen_var);

    // Inference normalizes with the frozen statistics, so the shift survives.
    let y = y.as_slice().to_vec();
    for c in 0..2 {
        let expected = (shifted.as_slice()[c] - frozen_mean[c]) / (frozen_var[c] + 2e-5).sqrt();
        assert!((y[c] - expected).abs() < 1e-3, "channel {}: {} vs {}", c, y[c], expected);
    }

    // Back in training mode, batch statistics are used again.
    let y_train = layer.forward(&shifted)?;
    let col0_mean: f32 = (0..8).map(|r| y_train.as_slice()[r * 2]).sum::<f32>() / 8.0;
    assert!(col0_mean.abs() < 1e-4);
    Ok(())
}

// ============================================================================
// Test: Composite graphs
// ============================================================================

#[test]
fn test_composite_graph_matches_finite_difference() -> Result<()> {
    init_tracing();

    // Distinct values keep the per-row maximum unambiguous under perturbation.
    let x_data: Vec<f32> = vec![
        0.3, 2.9, -1.2, //
        1.8, -0.7, 0.9, //
        -2.1, 0.4, 3.3, //
        2.6, 1.1, -0.2,
    ];
    let gamma_data = vec![1.5, 0.8, 1.2];
    let beta_data = vec![0.1, -0.3, 0.2];
    let config = BatchNormConfig { decay: 0.9, eps: 1e-3 };

    let forward = |v: &[CpuVariable]| -> Result<CpuVariable> {
        let stats = RunningStats::new(3);
        let h = batch_norm_in(&v[0], &v[1], &v[2], &stats, config, Mode::Train)?;
        let h = clip(&h, -10.0, 10.0)?;
        max(&h, Some(&[1]), false)
    };

    let x = variable(x_data.clone(), &[4, 3]);
    let gamma = variable(gamma_data.clone(), &[3]);
    let beta = variable(beta_data.clone(), &[3]);
    forward(&[x.clone(), gamma.clone(), beta.clone()])?
        .sum(None, false)?
        .backward()?;

    let fd = finite_diff_grad(
        forward,
        &[x_data, gamma_data, beta_data],
        &[Shape::new(vec![4, 3]), Shape::new(vec![3]), Shape::new(vec![3])],
        1e-2,
    )?;

    let analytic = [("x", &x), ("gamma", &gamma), ("beta", &beta)];
    for ((name, var), expected) in analytic.into_iter().zip(&fd) {
        let grad = var.grad_data().expect("gradient present");
        for (i, (a, b)) in grad.as_slice().iter().zip(expected).enumerate() {
            assert!((a - b).abs() < 2e-2, "{}[{}]: analytic {} vs numeric {}", name, i, a, b);
        }
    }
    Ok(())
}

#[test]
fn test_image_batch_through_layer_and_min() -> Result<()> {
    init_tracing();

    // N=2, C=3, H=2, W=2
    let data: Vec<f32> = (0..24).map(|i| ((i * 5) % 24) as f32 * 0.25 - 3.0).collect();
    let x = variable(data, &[2, 3, 2, 2]);
    let mut layer = BatchNorm::<CpuBackend>::default();

    let y = layer.forward(&x)?;
    assert_eq!(y.shape().dims(), &[2, 3, 2, 2]);
    assert_eq!(layer.channels(), Some(3));

    let loss = min(&y, Some(&[2, 3]), false)?.sum(None, false)?;
    loss.backward()?;

    let gx = x.grad_data().expect("x grad");
    assert_eq!(gx.shape().dims(), &[2, 3, 2, 2]);
    assert!(gx.as_slice().iter().all(|g| g.is_finite()));

    // beta receives one unit per selected minimum: N per channel.
    let gbeta = layer.beta().and_then(Variable::grad_data).expect("beta grad");
    assert_eq!(gbeta.as_slice(), &[2.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn test_no_grad_evaluation_leaves_graph_empty() -> Result<()> {
    let x = batch();
    let mut layer = BatchNorm::<CpuBackend>::default();

    let y = {
        let _no_grad = mode::no_grad();
        let _eval = mode::test_mode();
        layer.forward(&x)?
    };
    assert!(y.is_leaf());
    assert_eq!(y.creator_name(), None);

    let y = layer.forward(&x)?;
    assert_eq!(y.creator_name(), Some("batch_norm"));
    assert_eq!(y.generation(), 1);
    Ok(())
}
