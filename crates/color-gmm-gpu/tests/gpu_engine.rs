//! GPU engine tests. Each test is skipped when no adapter is available.

mod common;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use color_gmm_gpu::color::bin_position;
use color_gmm_gpu::fit::{fit, FitConfig};
use color_gmm_gpu::{
    hue_seeds, BinCount, ColorSpace, CovarianceDecomposer, EmSettings, ExpectationMaximization,
    GmmError, PackedCovariance, ReferenceEm, RunState, SourceImage,
};
use common::{assert_close, blob_image, noisy_image, red_blue};
use glam::Vec3;

async fn engine() -> Option<ExpectationMaximization> {
    let ctx = common::gpu().await?;
    Some(ExpectationMaximization::new(ctx, EmSettings::default()).unwrap())
}

#[tokio::test]
async fn test_red_blue_scenario() {
    let Some(mut em) = engine().await else { return };

    em.initialize(&hue_seeds(2), &red_blue(), ColorSpace::Srgb)
        .unwrap();
    assert_eq!(em.wait_for_bin_count().unwrap(), 2);

    em.converge().unwrap();
    let snapshot = em.read_clusters().unwrap();
    assert!((snapshot.means[0] - Vec3::X).length() < 1e-2, "{:?}", snapshot.means);
    assert!((snapshot.means[1] - Vec3::Z).length() < 1e-2, "{:?}", snapshot.means);
    for f in &snapshot.fractions {
        assert_close(*f, 0.5, 1e-2, "fraction");
    }

    let mut bins = em.read_populated_bins().unwrap();
    bins.sort_by_key(|b| b.index);
    assert_eq!(bins.len(), 2);
    assert_eq!(bin_position(bins[0].index), Vec3::X);
    assert_eq!(bin_position(bins[1].index), Vec3::Z);
    assert!(bins.iter().all(|b| b.count == 1));
}

#[tokio::test]
async fn test_zero_steps_keep_seeds() {
    let Some(mut em) = engine().await else { return };

    let seeds = hue_seeds(5);
    em.initialize(&seeds, &blob_image(10, 10), ColorSpace::Srgb)
        .unwrap();
    let snapshot = em.read_clusters().unwrap();
    for (mean, seed) in snapshot.means.iter().zip(&seeds) {
        assert!((*mean - *seed).length() < 1e-6);
    }
    for cov in &snapshot.covariances {
        assert_eq!(*cov, PackedCovariance::isotropic(0.01));
    }
    assert_close(snapshot.fraction_sum(), 1.0, 1e-6, "fraction sum");
    assert!(em.read_responsibilities().unwrap().is_empty());
}

#[tokio::test]
async fn test_fractions_and_responsibilities_normalize() {
    let Some(mut em) = engine().await else { return };

    em.initialize(&hue_seeds(8), &noisy_image(40, 30, 5), ColorSpace::Srgb)
        .unwrap();
    for step in 0..5 {
        em.converge().unwrap();
        let snapshot = em.read_clusters().unwrap();
        assert_close(snapshot.fraction_sum(), 1.0, 1e-4, &format!("step {step}"));
        assert!(snapshot.fractions.iter().all(|&f| f >= 0.0));
    }

    let resps = em.read_responsibilities().unwrap();
    assert_eq!(resps.len(), em.bin_count().unwrap() as usize);
    for (bin, r) in resps.iter().enumerate() {
        assert_close(r.iter().sum(), 1.0, 1e-4, &format!("bin {bin}"));
    }
}

#[tokio::test]
async fn test_generation_is_monotonic() {
    let Some(mut em) = engine().await else { return };

    assert!(matches!(em.converge(), Err(GmmError::NotInitialized)));
    assert_eq!(em.generation(), 0);

    em.initialize(&hue_seeds(3), &red_blue(), ColorSpace::Srgb)
        .unwrap();
    let mut last = em.generation();
    assert!(last > 0);
    for _ in 0..3 {
        em.converge().unwrap();
        assert!(em.generation() > last);
        last = em.generation();
    }
    em.read_clusters().unwrap();
    em.poll();
    assert_eq!(em.generation(), last);
}

#[tokio::test]
async fn test_degenerate_clusters_stay_finite() {
    let Some(mut em) = engine().await else { return };

    let image = SourceImage::solid(4, 4, [90, 140, 30]).unwrap();
    let seed = Vec3::new(0.3, 0.5, 0.1);
    em.initialize(&[seed, seed], &image, ColorSpace::Srgb)
        .unwrap();
    for _ in 0..10 {
        em.converge().unwrap();
    }
    let snapshot = em.read_clusters().unwrap();
    assert!(snapshot.is_finite(), "{snapshot:?}");

    let mut decomposer = CovarianceDecomposer::for_engine(&em).unwrap();
    for factor in decomposer.decompose(&em).unwrap() {
        assert!(factor.to_mat3().to_cols_array().iter().all(|v| v.is_finite()));
    }
}

#[tokio::test]
async fn test_single_cluster_finds_weighted_mean() {
    let Some(mut em) = engine().await else { return };

    let image = blob_image(12, 9);
    em.initialize(&[Vec3::splat(0.5)], &image, ColorSpace::Srgb)
        .unwrap();
    em.converge().unwrap();

    let bins = em.read_populated_bins().unwrap();
    let total: f32 = bins.iter().map(|b| b.count as f32).sum();
    let expected = bins
        .iter()
        .fold(Vec3::ZERO, |acc, b| acc + bin_position(b.index) * b.count as f32)
        / total;

    let snapshot = em.read_clusters().unwrap();
    assert!((snapshot.means[0] - expected).length() < 1e-4);
    assert_close(snapshot.fractions[0], 1.0, 1e-5, "fraction");
}

#[tokio::test]
async fn test_single_populated_bin_with_many_clusters() {
    let Some(mut em) = engine().await else { return };

    let image = SourceImage::solid(7, 5, [255, 255, 255]).unwrap();
    em.initialize(&hue_seeds(8), &image, ColorSpace::Srgb)
        .unwrap();
    assert_eq!(em.wait_for_bin_count().unwrap(), 1);
    for _ in 0..3 {
        em.converge().unwrap();
    }
    let snapshot = em.read_clusters().unwrap();
    assert!(snapshot.is_finite());
    assert_close(snapshot.fraction_sum(), 1.0, 1e-4, "fraction sum");
}

#[tokio::test]
async fn test_matches_reference_engine() {
    let Some(mut em) = engine().await else { return };
    let mut reference = ReferenceEm::new(EmSettings::default()).unwrap();

    // Linear input keeps quantization free of transcendental rounding.
    let image = blob_image(32, 24);
    let seeds = hue_seeds(6);
    em.initialize(&seeds, &image, ColorSpace::Linear).unwrap();
    reference
        .initialize(&seeds, &image, ColorSpace::Linear)
        .unwrap();

    let mut bins = em.read_populated_bins().unwrap();
    bins.sort_by_key(|b| b.index);
    assert_eq!(bins, reference.populated_bins());

    for _ in 0..2 {
        em.converge().unwrap();
        reference.converge().unwrap();
    }

    let gpu = em.read_clusters().unwrap();
    let cpu = reference.snapshot().unwrap();
    for c in 0..seeds.len() {
        assert!(
            (gpu.means[c] - cpu.means[c]).length() < 2e-3,
            "cluster {c}: {} vs {}",
            gpu.means[c],
            cpu.means[c]
        );
        assert_close(gpu.fractions[c], cpu.fractions[c], 2e-3, &format!("fraction {c}"));
        let g = gpu.covariances[c].to_mat3().to_cols_array();
        let r = cpu.covariances[c].to_mat3().to_cols_array();
        for (a, b) in g.iter().zip(&r) {
            assert_close(*a, *b, 2e-3, &format!("covariance {c}"));
        }
    }
}

#[tokio::test]
async fn test_decomposer_reconstructs_covariances() {
    let Some(mut em) = engine().await else { return };

    em.initialize(&hue_seeds(4), &noisy_image(16, 16, 9), ColorSpace::Srgb)
        .unwrap();
    em.converge().unwrap();
    em.converge().unwrap();

    let snapshot = em.read_clusters().unwrap();
    let mut decomposer = CovarianceDecomposer::for_engine(&em).unwrap();
    let factors = decomposer.decompose(&em).unwrap();
    assert_eq!(factors.len(), 4);
    assert!(decomposer.factors_buffer().is_some());

    for (factor, cov) in factors.iter().zip(&snapshot.covariances) {
        let host = cov.decompose();
        assert_eq!(factor.is_valid(), host.is_valid());
        if factor.is_valid() {
            let l = factor.to_mat3();
            let rebuilt = (l * l.transpose()).to_cols_array();
            for (a, b) in rebuilt.iter().zip(cov.to_mat3().to_cols_array().iter()) {
                assert_close(*a, *b, 1e-4, "L Lᵗ");
            }
        }
    }
}

#[tokio::test]
async fn test_bin_count_listener_and_release() {
    let Some(mut em) = engine().await else { return };

    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(AtomicU32::new(0));
    {
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        em.subscribe_bin_count(move |count| {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.store(count, Ordering::SeqCst);
        });
    }

    em.initialize(&hue_seeds(2), &red_blue(), ColorSpace::Srgb)
        .unwrap();
    assert_eq!(em.wait_for_bin_count().unwrap(), 2);
    assert_eq!(em.bin_count_state(), BinCount::Ready(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    // Further polls never fire it again for the same run.
    em.converge().unwrap();
    em.wait_for_bin_count().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let generation = em.generation();
    em.release();
    assert_eq!(em.state(), RunState::Uninitialized);
    assert_eq!(em.bin_count().unwrap(), 0);
    assert!(matches!(em.converge(), Err(GmmError::NotInitialized)));
    assert!(matches!(em.read_clusters(), Err(GmmError::NotInitialized)));

    em.initialize(&hue_seeds(3), &SourceImage::solid(3, 3, [10, 10, 10]).unwrap(), ColorSpace::Linear)
        .unwrap();
    assert!(em.generation() > generation);
    assert_eq!(em.wait_for_bin_count().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_dispatch() {
    let Some(mut em) = engine().await else { return };

    let image = red_blue();
    assert!(matches!(
        em.initialize(&[], &image, ColorSpace::Srgb),
        Err(GmmError::InvalidConfig(_))
    ));
    assert!(matches!(
        em.initialize(&hue_seeds(33), &image, ColorSpace::Srgb),
        Err(GmmError::InvalidConfig(_))
    ));
    assert_eq!(em.generation(), 0);
    assert_eq!(em.state(), RunState::Uninitialized);
}

#[tokio::test]
async fn test_fit_loop_on_gpu() {
    let Some(mut em) = engine().await else { return };

    let config = FitConfig {
        num_clusters: 4,
        iterations: 6,
        ..Default::default()
    };
    let mut steps = 0;
    let outcome = fit(&mut em, &blob_image(24, 24), &config, |report| {
        steps += 1;
        assert_eq!(report.iteration, steps);
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(outcome.backend, "gpu");
    assert_eq!(outcome.iterations, 6);
    assert_eq!(steps, 6);
    assert_close(outcome.snapshot.fraction_sum(), 1.0, 1e-4, "fraction sum");
}
