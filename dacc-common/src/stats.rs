//! Statistical summaries and their incremental merge
//!
//! Distributive statistics (count, sum, min, max) combine directly. The mean is
//! recomputed from the summed totals and the sample standard deviation is
//! pooled from both partial groups, so folding raw data in one pass or in
//! several passes yields the same summary up to floating rounding.
//!
//! Quartiles are holistic: they are only ever computed from a full set of raw
//! values, never merged.

use serde::{Deserialize, Serialize};

/// Distributive and algebraic statistics of one group of raw values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: i64,
    pub count_not_zero: i64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Sample standard deviation (n - 1 denominator), 0 for a single value
    pub std: f64,
}

impl Summary {
    /// Summarise a group of raw values, `None` when the group is empty
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len() as i64;
        let sum: f64 = values.iter().sum();
        let avg = sum / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let count_not_zero = values.iter().filter(|v| **v != 0.0).count() as i64;

        Some(Self {
            count,
            count_not_zero,
            sum,
            min,
            max,
            avg,
            std: sample_std(values, avg),
        })
    }

    /// Combine this summary with a summary of new values for the same group
    pub fn merge(&self, new: &Summary) -> Summary {
        let count = self.count + new.count;
        if new.count == 0 {
            return *self;
        }
        if self.count == 0 {
            return *new;
        }

        let sum = self.sum + new.sum;
        let avg = sum / count as f64;

        Summary {
            count,
            count_not_zero: self.count_not_zero + new.count_not_zero,
            sum,
            min: self.min.min(new.min),
            max: self.max.max(new.max),
            avg,
            std: pooled_std(self, new, avg),
        }
    }
}

/// Sample standard deviation of two groups combined
///
/// `global_mean` is the mean of the union of both groups. Returns 0 when the
/// union holds fewer than two values.
pub fn pooled_std(current: &Summary, new: &Summary, global_mean: f64) -> f64 {
    let n1 = current.count as f64;
    let n2 = new.count as f64;
    if n1 + n2 <= 1.0 {
        return 0.0;
    }

    let v1 = current.std.powi(2);
    let v2 = new.std.powi(2);

    let s1 = (n1 - 1.0) * v1 + (n2 - 1.0) * v2;
    let s2 = n1 * (current.avg - global_mean).powi(2) + n2 * (new.avg - global_mean).powi(2);

    let variance = (s1 + s2) / (n1 + n2 - 1.0);
    variance.max(0.0).sqrt()
}

/// Sample standard deviation around a precomputed mean
pub fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (squares / (values.len() - 1) as f64).sqrt()
}

/// Median and quartiles of one group of raw values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quartiles {
    pub median: f64,
    pub first_quartile: f64,
    pub third_quartile: f64,
}

impl Quartiles {
    /// Continuous-percentile quartiles, `None` when the group is empty
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        Some(Self {
            median: percentile_cont(&sorted, 0.5)?,
            first_quartile: percentile_cont(&sorted, 0.25)?,
            third_quartile: percentile_cont(&sorted, 0.75)?,
        })
    }
}

/// Continuous percentile with linear interpolation between closest ranks
///
/// `sorted` must be in ascending order and `fraction` within `[0, 1]`.
pub fn percentile_cont(sorted: &[f64], fraction: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let position = fraction.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_summary_of_single_value_has_zero_std() {
        let s = Summary::from_values(&[7.0]).unwrap();
        assert_eq!(s.count, 1);
        assert_eq!(s.std, 0.0);
        assert_eq!(s.min, 7.0);
        assert_eq!(s.max, 7.0);
    }

    #[test]
    fn test_summary_counts_non_zero_values() {
        let s = Summary::from_values(&[0.0, 6.0, 20.0, 0.0]).unwrap();
        assert_eq!(s.count, 4);
        assert_eq!(s.count_not_zero, 2);
    }

    #[test]
    fn test_empty_group_has_no_summary() {
        assert!(Summary::from_values(&[]).is_none());
        assert!(Quartiles::from_values(&[]).is_none());
    }

    #[test]
    fn test_two_step_merge_matches_direct_computation() {
        let current = Summary::from_values(&[5.0, 10.0, 10.0, 15.0]).unwrap();
        let new = Summary::from_values(&[0.0, 6.0, 20.0]).unwrap();
        let merged = current.merge(&new);

        let all = [5.0, 10.0, 10.0, 15.0, 0.0, 6.0, 20.0];
        let direct = Summary::from_values(&all).unwrap();

        assert_eq!(merged.count, 7);
        assert_close(merged.sum, 66.0);
        assert_eq!(merged.min, 0.0);
        assert_eq!(merged.max, 20.0);
        assert_eq!(merged.count_not_zero, 6);
        assert_close(merged.avg, 66.0 / 7.0);
        assert_close(merged.std, direct.std);
    }

    #[test]
    fn test_merge_of_two_singletons() {
        let merged = Summary::from_values(&[2.0])
            .unwrap()
            .merge(&Summary::from_values(&[4.0]).unwrap());
        assert_eq!(merged.count, 2);
        assert_close(merged.avg, 3.0);
        assert_close(merged.std, 2f64.sqrt());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let values = [3.5, 1.0, 8.25, 4.0, 4.0, 10.0, 0.0, 2.5];
        let direct = Summary::from_values(&values).unwrap();

        for split in 1..values.len() {
            let (left, right) = values.split_at(split);
            let forward = Summary::from_values(left)
                .unwrap()
                .merge(&Summary::from_values(right).unwrap());
            let backward = Summary::from_values(right)
                .unwrap()
                .merge(&Summary::from_values(left).unwrap());

            for merged in [forward, backward] {
                assert_eq!(merged.count, direct.count);
                assert_close(merged.sum, direct.sum);
                assert_close(merged.avg, direct.avg);
                assert_close(merged.std, direct.std);
                assert_eq!(merged.min, direct.min);
                assert_eq!(merged.max, direct.max);
            }
        }
    }

    #[test]
    fn test_pooled_std_degenerate_union() {
        let one = Summary::from_values(&[1.0]).unwrap();
        let empty = Summary { count: 0, ..one };
        assert_eq!(pooled_std(&one, &empty, 1.0), 0.0);
    }

    #[test]
    fn test_quartiles_interpolate() {
        let q = Quartiles::from_values(&[60.0, 20.0, 40.0]).unwrap();
        assert_close(q.median, 40.0);
        assert_close(q.first_quartile, 30.0);
        assert_close(q.third_quartile, 50.0);

        let q = Quartiles::from_values(&[0.0, 20.0, 40.0, 60.0]).unwrap();
        assert_close(q.median, 30.0);
        assert_close(q.first_quartile, 15.0);
        assert_close(q.third_quartile, 45.0);
    }

    #[test]
    fn test_percentile_of_single_value() {
        assert_eq!(percentile_cont(&[42.0], 0.25), Some(42.0));
    }
}
