//! Batch partitioning for rolling changes across a fleet.

use crate::error::DeployError;

/// Partition the given targets into sequential batches.
///
/// With no fraction, all targets form a single batch. With a fraction in `(0, 1]`, each batch
/// holds `ceil(len * fraction)` targets, the last batch holding whatever remains. Input order is
/// preserved and every target lands in exactly one batch. No targets means no batches.
pub fn batch<T>(targets: Vec<T>, fraction: Option<f64>) -> Result<Vec<Vec<T>>, DeployError> {
    if targets.is_empty() {
        return Ok(vec![]);
    }
    let fraction = match fraction {
        Some(fraction) => validate_fraction(fraction)?,
        None => return Ok(vec![targets]),
    };

    let size = batch_size(targets.len(), fraction);
    let mut batches = Vec::with_capacity((targets.len() + size - 1) / size);
    let mut targets = targets.into_iter().peekable();
    while targets.peek().is_some() {
        batches.push(targets.by_ref().take(size).collect());
    }
    Ok(batches)
}

/// The number of targets per batch for the given fraction.
///
/// Never less than one, so that a tiny fraction still makes progress.
pub fn batch_size(len: usize, fraction: f64) -> usize {
    ((len as f64 * fraction).ceil() as usize).max(1)
}

/// Parse a batch fraction as given on the command line.
pub fn parse_fraction(val: &str) -> Result<f64, DeployError> {
    let fraction: f64 = val
        .trim()
        .parse()
        .map_err(|_| DeployError::InvalidInput(format!("batch fraction must be a decimal number, got {}", val)))?;
    validate_fraction(fraction)
}

fn validate_fraction(fraction: f64) -> Result<f64, DeployError> {
    // Also rejects NaN.
    if fraction > 0.0 && fraction <= 1.0 {
        Ok(fraction)
    } else {
        Err(DeployError::InvalidInput(format!("batch fraction must be within (0, 1], got {}", fraction)))
    }
}
