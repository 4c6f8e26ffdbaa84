//! Outlier-rejection properties.

use amm_pulse_rs::price::filter_outliers;

#[test]
fn two_or_fewer_samples_pass_through() {
    assert_eq!(filter_outliers(&[]), Vec::<f64>::new());
    assert_eq!(filter_outliers(&[42.0]), vec![42.0]);
    assert_eq!(filter_outliers(&[1.0, 1000.0]), vec![1.0, 1000.0]);
}

#[test]
fn boundary_case_keeps_all_five() {
    // μ ≈ 1080, σ ≈ 1959: even 5000 sits inside the 2σ band.
    let samples = [100.0, 101.0, 99.0, 100.0, 5000.0];
    let retained = filter_outliers(&samples);
    assert_eq!(retained, samples.to_vec());
}

#[test]
fn output_is_a_subset_of_input() {
    let cases: Vec<Vec<f64>> = vec![
        vec![1.0, 2.0, 3.0, 4.0, 5.0],
        vec![10.0, 10.0, 10.0, 10.0, 10_000.0, 10.0],
        vec![0.5, 0.5, 0.5],
        vec![7.0; 10],
    ];
    for input in cases {
        let output = filter_outliers(&input);
        assert!(!output.is_empty(), "output never empty for {:?}", input);
        for p in &output {
            assert!(input.contains(p), "{} not from input {:?}", p, input);
        }
    }
}

#[test]
fn identical_samples_all_survive() {
    // σ = 0: every deviation is exactly 0 ≤ 2σ.
    let samples = [3.5; 6];
    assert_eq!(filter_outliers(&samples).len(), 6);
}

#[test]
fn hard_outlier_is_dropped() {
    let samples = [100.0, 101.0, 99.0, 100.0, 100.0, 1_000_000.0];
    let retained = filter_outliers(&samples);
    assert_eq!(retained.len(), 5);
    assert!(!retained.contains(&1_000_000.0));
}

#[test]
fn retained_values_sit_within_two_sigma() {
    let samples = [5.0, 6.0, 7.0, 5.5, 6.5, 120.0];
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let sigma = (samples.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n).sqrt();

    let retained = filter_outliers(&samples);
    if retained.len() < samples.len() {
        for p in &retained {
            assert!((p - mean).abs() <= 2.0 * sigma);
        }
    }
}
