use super::EvalResults;
use crate::{common::*, config::ExpectedResult};

/// Compare results against `(task, metric, mean, std)` expectations.
///
/// A result passes if it lies within `sigma_tol` standard deviations of the mean.
/// Failures are logged as errors. Returns whether all expectations pass.
pub fn check_expected_results(
    results: &EvalResults,
    expected_results: &[ExpectedResult],
    sigma_tol: R64,
) -> bool {
    let sigma_tol = sigma_tol.raw();

    expected_results
        .iter()
        .map(|ExpectedResult(task, metric, mean, std)| {
            let (mean, std) = (mean.raw(), std.raw());

            let actual = match results.get(task, metric) {
                Some(actual) => actual,
                None => {
                    error!("FAIL: {} > {} is not found in the results", task, metric);
                    return false;
                }
            };

            let lo = mean - sigma_tol * std;
            let hi = mean + sigma_tol * std;
            let ok = (actual - mean).abs() <= sigma_tol * std;
            let msg = format!(
                "{} > {} sanity check (actual vs. expected): {:.3} vs. mean={:.4}, std={:.4}, range=({:.4}, {:.4})",
                task, metric, actual, mean, std, lo, hi
            );

            if ok {
                info!("PASS: {}", msg);
            } else {
                error!("FAIL: {}", msg);
            }
            ok
        })
        .fold(true, |all_ok, ok| all_ok && ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_within_tolerance() {
        let mut results = EvalResults::default();
        results.insert("bbox", "AP", 0.30);

        let pass = vec![ExpectedResult("bbox".into(), "AP".into(), r64(0.28), r64(0.01))];
        assert!(check_expected_results(&results, &pass, r64(4.0)));

        let fail = vec![ExpectedResult("bbox".into(), "AP".into(), r64(0.20), r64(0.01))];
        assert!(!check_expected_results(&results, &fail, r64(4.0)));

        let missing = vec![ExpectedResult("bbox".into(), "AP50".into(), r64(0.3), r64(0.1))];
        assert!(!check_expected_results(&results, &missing, r64(4.0)));

        assert!(check_expected_results(&results, &[], r64(4.0)));
    }
}
