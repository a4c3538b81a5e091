//! Detection and repair of numerically degenerate vectors.
//!
//! Embedding models occasionally emit vectors that poison cosine search: NaN or
//! infinite entries, all-zero output, runaway magnitudes, or a collapsed spread.
//! Everything here is a pure function over `&[f32]`. Randomness used during
//! repair comes from a seeded generator, so the same input always repairs to
//! the same output.
//!
//! Detection order matters: the first matching check wins.
//!
//! 1. empty input → `AllZero`, severity 1.0
//! 2. non-finite entries → `NanOrInf`, severity = fraction of non-finite entries
//! 3. more than 10% of entries beyond ±1e3 → `ExtremeMagnitude`, severity = that
//!    fraction; an L2 norm above 1e6 → `ExtremeMagnitude`, 0.8 rising to 1.0 as the
//!    norm grows
//! 4. every entry within 1e-8 of zero → `AllZero`, 1.0; norm below 1e-6 → `AllZero`,
//!    0.8 rising to 1.0 as the norm approaches zero
//! 5. for vectors of at least 10 entries, variance below 1e-6 or above 1e3
//!    → `DegenerateVariance`, 0.5 rising to 0.8 the further the variance is out of range

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, warn};

const ZERO_THRESHOLD: f32 = 1e-8;
const NORM_MIN_THRESHOLD: f32 = 1e-6;
const NORM_MAX_THRESHOLD: f32 = 1e6;
const EXTREME_VALUE_THRESHOLD: f32 = 1e3;
const EXTREME_FRACTION_THRESHOLD: f32 = 0.1;
const VARIANCE_MIN_THRESHOLD: f32 = 1e-6;
const VARIANCE_MAX_THRESHOLD: f32 = 1e3;
/// Variance statistics are meaningless for very short vectors such as logits.
const MIN_STATISTICAL_LENGTH: usize = 10;
/// Vectors still anomalous above this severity after repair are replaced.
pub const CRITICAL_SEVERITY: f32 = 0.8;

const REPAIR_SEED: u64 = 0x5EED_A11C_E5;

/// Classification of a vector's numeric health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    None,
    NanOrInf,
    AllZero,
    ExtremeMagnitude,
    DegenerateVariance,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AnomalyKind::None => "none",
            AnomalyKind::NanOrInf => "nan-or-inf",
            AnomalyKind::AllZero => "all-zero",
            AnomalyKind::ExtremeMagnitude => "extreme-magnitude",
            AnomalyKind::DegenerateVariance => "degenerate-variance",
        };
        f.write_str(name)
    }
}

/// Outcome of [`detect_anomalies`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyResult {
    pub is_anomalous: bool,
    pub kind: AnomalyKind,
    /// How far the offending statistic is from a healthy range, in `[0, 1]`
    pub severity: f32,
    pub description: String,
}

impl AnomalyResult {
    fn healthy() -> Self {
        Self {
            is_anomalous: false,
            kind: AnomalyKind::None,
            severity: 0.0,
            description: "vector is healthy".to_string(),
        }
    }

    fn anomalous(kind: AnomalyKind, severity: f32, description: String) -> Self {
        Self {
            is_anomalous: true,
            kind,
            severity: severity.clamp(0.0, 1.0),
            description,
        }
    }
}

/// Summary statistics over the finite entries of a vector.
#[derive(Debug, Clone, Copy)]
struct Stats {
    mean: f32,
    variance: f32,
    norm: f32,
}

fn finite_stats(v: &[f32]) -> Stats {
    let finite: Vec<f64> = v
        .iter()
        .filter(|x| x.is_finite())
        .map(|&x| x as f64)
        .collect();
    if finite.is_empty() {
        return Stats {
            mean: 0.0,
            variance: 0.0,
            norm: 0.0,
        };
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let variance = finite.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let norm = finite.iter().map(|x| x * x).sum::<f64>().sqrt();
    Stats {
        mean: mean as f32,
        variance: variance as f32,
        norm: norm as f32,
    }
}

/// L2 norm, accumulated in f64.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Classifies `v`. See the module docs for the order of checks.
pub fn detect_anomalies(v: &[f32]) -> AnomalyResult {
    if v.is_empty() {
        return AnomalyResult::anomalous(AnomalyKind::AllZero, 1.0, "empty vector".to_string());
    }

    let len = v.len() as f32;
    let nan_count = v.iter().filter(|x| x.is_nan()).count();
    let inf_count = v.iter().filter(|x| x.is_infinite()).count();
    if nan_count + inf_count > 0 {
        return AnomalyResult::anomalous(
            AnomalyKind::NanOrInf,
            (nan_count + inf_count) as f32 / len,
            format!("{nan_count} NaN and {inf_count} infinite values"),
        );
    }

    let extreme_count = v
        .iter()
        .filter(|x| x.abs() > EXTREME_VALUE_THRESHOLD)
        .count();
    let extreme_fraction = extreme_count as f32 / len;
    if extreme_fraction > EXTREME_FRACTION_THRESHOLD {
        return AnomalyResult::anomalous(
            AnomalyKind::ExtremeMagnitude,
            extreme_fraction,
            format!("{extreme_count} values beyond ±{EXTREME_VALUE_THRESHOLD}"),
        );
    }

    let stats = finite_stats(v);
    if !stats.norm.is_finite() || stats.norm > NORM_MAX_THRESHOLD {
        return AnomalyResult::anomalous(
            AnomalyKind::ExtremeMagnitude,
            scaled(0.8, 0.2, 1.0 - NORM_MAX_THRESHOLD / stats.norm),
            format!("norm {} exceeds {NORM_MAX_THRESHOLD}", stats.norm),
        );
    }

    if v.iter().all(|x| x.abs() < ZERO_THRESHOLD) {
        return AnomalyResult::anomalous(AnomalyKind::AllZero, 1.0, "all values are zero".into());
    }
    if stats.norm < NORM_MIN_THRESHOLD {
        return AnomalyResult::anomalous(
            AnomalyKind::AllZero,
            scaled(0.8, 0.2, 1.0 - stats.norm / NORM_MIN_THRESHOLD),
            format!("norm {} is below {NORM_MIN_THRESHOLD}", stats.norm),
        );
    }

    if v.len() >= MIN_STATISTICAL_LENGTH {
        if stats.variance < VARIANCE_MIN_THRESHOLD {
            return AnomalyResult::anomalous(
                AnomalyKind::DegenerateVariance,
                scaled(0.5, 0.3, 1.0 - stats.variance / VARIANCE_MIN_THRESHOLD),
                format!("variance {} is below {VARIANCE_MIN_THRESHOLD}", stats.variance),
            );
        }
        if stats.variance > VARIANCE_MAX_THRESHOLD {
            return AnomalyResult::anomalous(
                AnomalyKind::DegenerateVariance,
                scaled(0.5, 0.3, 1.0 - VARIANCE_MAX_THRESHOLD / stats.variance),
                format!("variance {} exceeds {VARIANCE_MAX_THRESHOLD}", stats.variance),
            );
        }
    }

    AnomalyResult::healthy()
}

/// `base` plus `span` times how far out of range the statistic is, in `[0, 1]`.
fn scaled(base: f32, span: f32, distance: f32) -> f32 {
    let distance = if distance.is_nan() { 1.0 } else { distance.clamp(0.0, 1.0) };
    base + span * distance
}

fn rng_for(len: usize) -> StdRng {
    StdRng::seed_from_u64(REPAIR_SEED ^ len as u64)
}

fn gaussian(rng: &mut StdRng) -> f32 {
    let sample: f64 = StandardNormal.sample(rng);
    sample as f32
}

fn normalize_in_place(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < NORM_MIN_THRESHOLD {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// A deterministic random unit vector of length `dimension`.
///
/// Falls back to the one-hot vector `e0` if sampling degenerates. An empty
/// dimension yields an empty vector.
pub fn random_unit_vector(dimension: usize) -> Vec<f32> {
    if dimension == 0 {
        return Vec::new();
    }
    let mut rng = rng_for(dimension);
    let mut v: Vec<f32> = (0..dimension).map(|_| gaussian(&mut rng)).collect();
    if !normalize_in_place(&mut v) {
        v = vec![0.0; dimension];
        v[0] = 1.0;
    }
    v
}

/// Repairs `v` according to `kind`.
///
/// Returns a same-length, fully finite vector, or `None` for empty input or
/// when the repair cannot restore finiteness.
pub fn repair_vector(v: &[f32], kind: AnomalyKind) -> Option<Vec<f32>> {
    if v.is_empty() {
        return None;
    }

    let repaired = match kind {
        AnomalyKind::None => v.to_vec(),
        AnomalyKind::NanOrInf => v
            .iter()
            .map(|&x| if x.is_finite() { x } else { 0.0 })
            .collect(),
        AnomalyKind::AllZero => {
            let mut rng = rng_for(v.len());
            let mut out: Vec<f32> = (0..v.len()).map(|_| gaussian(&mut rng) * 0.1).collect();
            if !normalize_in_place(&mut out) {
                return Some(random_unit_vector(v.len()));
            }
            out
        }
        AnomalyKind::ExtremeMagnitude => {
            let stats = finite_stats(v);
            let std = stats.variance.sqrt();
            let (lo, hi) = if std.is_finite() {
                (stats.mean - 3.0 * std, stats.mean + 3.0 * std)
            } else {
                (-EXTREME_VALUE_THRESHOLD, EXTREME_VALUE_THRESHOLD)
            };
            v.iter()
                .map(|&x| {
                    let x = if x.is_finite() { x } else { 0.0 };
                    x.clamp(lo.min(hi), hi.max(lo))
                        .clamp(-EXTREME_VALUE_THRESHOLD, EXTREME_VALUE_THRESHOLD)
                })
                .collect()
        }
        AnomalyKind::DegenerateVariance => {
            let stats = finite_stats(v);
            if stats.variance < VARIANCE_MIN_THRESHOLD {
                let mut rng = rng_for(v.len());
                let scale = 0.01 * stats.norm.max(1.0) / (v.len() as f32).sqrt();
                v.iter()
                    .map(|&x| x + gaussian(&mut rng) * scale)
                    .collect()
            } else {
                v.iter()
                    .map(|&x| (x - stats.mean) * 0.5 + stats.mean)
                    .collect()
            }
        }
    };

    if repaired.len() == v.len() && repaired.iter().all(|x| x.is_finite()) {
        Some(repaired)
    } else {
        None
    }
}

/// Detects, repairs and re-verifies `v`.
///
/// If the vector is still critically anomalous after repair (or cannot be
/// repaired at all) it is replaced with [`random_unit_vector`]. The output
/// always has the input's length and contains only finite values.
pub fn process_vector(v: &[f32]) -> Vec<f32> {
    let detected = detect_anomalies(v);
    if !detected.is_anomalous {
        return v.to_vec();
    }

    warn!(
        kind = %detected.kind,
        severity = detected.severity,
        "Vector anomaly detected: {}",
        detected.description
    );

    let repaired = match repair_vector(v, detected.kind) {
        Some(repaired) => repaired,
        None => {
            warn!("Vector repair failed, using random unit vector");
            return random_unit_vector(v.len());
        }
    };

    let verified = detect_anomalies(&repaired);
    if verified.is_anomalous && verified.severity > CRITICAL_SEVERITY {
        warn!(
            "Vector still anomalous after repair ({}), using random unit vector",
            verified.description
        );
        return random_unit_vector(v.len());
    }

    debug!("Vector repaired ({} -> {})", detected.kind, verified.kind);
    repaired
}

/// Scales `v` to unit length.
///
/// A vector whose norm is below 1e-6 is replaced by [`random_unit_vector`].
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    if normalize_in_place(&mut out) {
        out
    } else {
        warn!("Cannot normalize near-zero vector, using random unit vector");
        random_unit_vector(v.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn healthy_vector(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i as f32) * 0.37).sin()).collect()
    }

    #[test]
    fn test_healthy_vector() {
        let result = detect_anomalies(&healthy_vector(64));
        assert!(!result.is_anomalous);
        assert_eq!(result.kind, AnomalyKind::None);
        assert_eq!(result.severity, 0.0);
    }

    #[test]
    fn test_detect_nan_severity_is_fraction() {
        let mut v = healthy_vector(10);
        v[0] = f32::NAN;
        v[3] = f32::INFINITY;
        let result = detect_anomalies(&v);
        assert_eq!(result.kind, AnomalyKind::NanOrInf);
        assert!((result.severity - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_detect_zero_and_empty() {
        assert_eq!(detect_anomalies(&[]).kind, AnomalyKind::AllZero);
        let result = detect_anomalies(&[0.0; 16]);
        assert_eq!(result.kind, AnomalyKind::AllZero);
        assert_eq!(result.severity, 1.0);

        let result = detect_anomalies(&[1e-7, 0.0, 0.0]);
        assert_eq!(result.kind, AnomalyKind::AllZero);
        assert!((result.severity - 0.98).abs() < 1e-4);

        // Closer to zero is more severe
        let faint = detect_anomalies(&[9e-7, 0.0, 0.0]);
        assert_eq!(faint.kind, AnomalyKind::AllZero);
        assert!(faint.severity > 0.8 && faint.severity < result.severity);
    }

    #[test]
    fn test_detect_extreme_magnitude() {
        let mut v = healthy_vector(10);
        v[0] = 5e3;
        v[1] = -7e3;
        let result = detect_anomalies(&v);
        assert_eq!(result.kind, AnomalyKind::ExtremeMagnitude);

        // One extreme entry out of many is tolerated by the fraction check but not the norm check
        let mut v = healthy_vector(100);
        v[0] = 2e6;
        assert_eq!(detect_anomalies(&v).kind, AnomalyKind::ExtremeMagnitude);
    }

    #[test]
    fn test_detect_degenerate_variance() {
        let v = vec![0.5f32; 32];
        let result = detect_anomalies(&v);
        assert_eq!(result.kind, AnomalyKind::DegenerateVariance);
        assert!((result.severity - 0.8).abs() < 1e-6);

        // Barely below the floor is mild
        let nearly: Vec<f32> = (0..32).map(|i| if i % 2 == 0 { 0.5009 } else { 0.4991 }).collect();
        let mild = detect_anomalies(&nearly);
        assert_eq!(mild.kind, AnomalyKind::DegenerateVariance);
        assert!(mild.severity >= 0.5 && mild.severity < 0.7);

        // Short vectors such as logits skip the variance check
        assert!(!detect_anomalies(&[0.5, 0.5]).is_anomalous);
    }

    #[test]
    fn test_repair_preserves_length_and_finiteness() {
        let kinds = [
            AnomalyKind::None,
            AnomalyKind::NanOrInf,
            AnomalyKind::AllZero,
            AnomalyKind::ExtremeMagnitude,
            AnomalyKind::DegenerateVariance,
        ];
        let inputs: Vec<Vec<f32>> = vec![
            vec![f32::NAN, 1.0, f32::NEG_INFINITY, 2.0],
            vec![0.0; 8],
            vec![1e30, -1e30, 3.0],
            vec![0.25; 12],
            healthy_vector(5),
        ];
        for input in &inputs {
            for kind in kinds {
                let repaired = repair_vector(input, kind).expect("repair should succeed");
                assert_eq!(repaired.len(), input.len());
                assert!(repaired.iter().all(|x| x.is_finite()), "{kind} on {input:?}");
            }
        }
        for kind in kinds {
            assert!(repair_vector(&[], kind).is_none());
        }
    }

    #[test]
    fn test_repair_nan_replaces_with_zero() {
        let repaired = repair_vector(&[f32::NAN, 1.0, f32::INFINITY], AnomalyKind::NanOrInf).unwrap();
        assert_eq!(repaired, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_repair_zero_is_unit_and_deterministic() {
        let a = repair_vector(&[0.0; 32], AnomalyKind::AllZero).unwrap();
        let b = repair_vector(&[0.0; 32], AnomalyKind::AllZero).unwrap();
        assert_eq!(a, b);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_repair_extreme_is_bounded() {
        let mut v = healthy_vector(20);
        v[0] = 1e9;
        let repaired = repair_vector(&v, AnomalyKind::ExtremeMagnitude).unwrap();
        assert!(repaired.iter().all(|x| x.abs() <= EXTREME_VALUE_THRESHOLD));
    }

    #[test]
    fn test_repair_variance() {
        let flat = vec![0.5f32; 32];
        let repaired = repair_vector(&flat, AnomalyKind::DegenerateVariance).unwrap();
        assert_ne!(repaired, flat);

        let wide: Vec<f32> = (0..20).map(|i| if i % 2 == 0 { 100.0 } else { -100.0 }).collect();
        let repaired = repair_vector(&wide, AnomalyKind::DegenerateVariance).unwrap();
        assert!((repaired[0] - 50.0).abs() < 1e-3);
        assert!((repaired[1] + 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_process_vector_always_finite() {
        let out = process_vector(&[f32::NAN; 8]);
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|x| x.is_finite()));
        assert!(l2_norm(&out) > 0.0);

        let healthy = healthy_vector(16);
        assert_eq!(process_vector(&healthy), healthy);
    }

    #[test]
    #[traced_test]
    fn test_repairs_are_logged() {
        let out = process_vector(&[0.0; 16]);
        assert_eq!(out.len(), 16);
        assert!(logs_contain("Vector anomaly detected"));
    }

    #[test]
    fn test_random_unit_vector() {
        let v = random_unit_vector(384);
        assert_eq!(v.len(), 384);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-4);
        assert_eq!(v, random_unit_vector(384));
        assert!(random_unit_vector(0).is_empty());
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let v = normalize(&[0.0, 0.0, 0.0]);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-4);
    }
}
