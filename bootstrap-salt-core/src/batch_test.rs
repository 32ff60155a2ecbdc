use anyhow::Result;

use crate::batch::{batch, batch_size, parse_fraction};
use crate::error::DeployError;

fn ips(count: usize) -> Vec<String> {
    (1..=count).map(|idx| format!("{0}.{0}.{0}.{0}", idx)).collect()
}

#[test]
fn batch_without_fraction_yields_single_batch() -> Result<()> {
    let batches = batch(ips(2), None)?;
    assert_eq!(batches, vec![vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]], "expected a single batch of all ips");
    Ok(())
}

#[test]
fn batch_half_fraction_splits_evenly() -> Result<()> {
    let batches = batch(ips(4), Some(0.5))?;
    let expected = vec![vec!["1.1.1.1", "2.2.2.2"], vec!["3.3.3.3", "4.4.4.4"]];
    assert!(batches == expected, "unexpected batches, got {:?}, expected {:?}", batches, expected);
    Ok(())
}

#[test]
fn batch_half_fraction_uneven_leaves_short_tail() -> Result<()> {
    let batches = batch(ips(3), Some(0.5))?;
    let expected = vec![vec!["1.1.1.1", "2.2.2.2"], vec!["3.3.3.3"]];
    assert!(batches == expected, "unexpected batches, got {:?}, expected {:?}", batches, expected);
    Ok(())
}

#[test]
fn batch_covers_every_target_once_in_order() -> Result<()> {
    for len in 1..=25usize {
        for fraction in [0.01, 0.1, 0.25, 1.0 / 3.0, 0.5, 0.75, 0.99, 1.0] {
            let targets: Vec<usize> = (0..len).collect();
            let batches = batch(targets.clone(), Some(fraction))?;
            let size = batch_size(len, fraction);
            let expected_count = (len + size - 1) / size;

            assert_eq!(batches.len(), expected_count, "unexpected batch count for len {} fraction {}", len, fraction);
            assert!(
                batches.iter().all(|batch| !batch.is_empty() && batch.len() <= size),
                "batch sizes out of bounds for len {} fraction {}: {:?}",
                len,
                fraction,
                batches
            );
            let flattened: Vec<usize> = batches.into_iter().flatten().collect();
            assert_eq!(flattened, targets, "batches must cover all targets in order for len {} fraction {}", len, fraction);
        }
    }
    Ok(())
}

#[test]
fn batch_of_nothing_is_no_batches() -> Result<()> {
    let batches = batch(Vec::<String>::new(), None)?;
    assert!(batches.is_empty(), "expected no batches, got {:?}", batches);
    let batches = batch(Vec::<String>::new(), Some(0.5))?;
    assert!(batches.is_empty(), "expected no batches, got {:?}", batches);
    Ok(())
}

#[test]
fn batch_rejects_out_of_range_fractions() {
    for fraction in [0.0, -0.5, 1.5, f64::NAN] {
        let res = batch(ips(3), Some(fraction));
        assert!(matches!(res, Err(DeployError::InvalidInput(_))), "expected fraction {} to be rejected, got {:?}", fraction, res);
    }
}

#[test]
fn parse_fraction_accepts_decimal_strings() -> Result<()> {
    assert_eq!(parse_fraction("0.5")?, 0.5);
    assert_eq!(parse_fraction(" 1 ")?, 1.0);
    assert!(parse_fraction("half").is_err(), "expected non-numeric fraction to be rejected");
    assert!(parse_fraction("2").is_err(), "expected fraction above one to be rejected");
    Ok(())
}
