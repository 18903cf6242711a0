use crate::models::{TransferOutcome, TransferStatus};

/// Restores deterministic ordering over outcomes collected from the worker
/// pool: input file order for uploads, listing order for downloads. The
/// returned rows are the caller's read-only view; nothing mutates an
/// outcome after this point.
pub fn aggregate(mut indexed: Vec<(usize, TransferOutcome)>) -> Vec<TransferOutcome> {
    indexed.sort_by_key(|(idx, _)| *idx);
    let outcomes: Vec<TransferOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

    let uploaded = count(&outcomes, TransferStatus::Uploaded);
    let downloaded = count(&outcomes, TransferStatus::Downloaded);
    let skipped = count(&outcomes, TransferStatus::Skipped);
    let errors = count(&outcomes, TransferStatus::Error);
    tracing::info!(
        total = outcomes.len(),
        uploaded,
        downloaded,
        skipped,
        errors,
        "transfer request finished"
    );

    outcomes
}

fn count(outcomes: &[TransferOutcome], status: TransferStatus) -> usize {
    outcomes.iter().filter(|o| o.status == status).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_restores_input_order() {
        let indexed = vec![
            (2, TransferOutcome::skipped("c.csv", 1)),
            (0, TransferOutcome::skipped("a.csv", 1)),
            (1, TransferOutcome::error("b.csv", 1, "boom")),
        ];
        let rows = aggregate(indexed);
        let names: Vec<_> = rows.iter().map(|o| o.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "c.csv"]);
        assert_eq!(rows[1].status, TransferStatus::Error);
    }
}
