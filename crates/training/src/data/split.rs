use std::{fmt, sync::Arc};

use csv::StringRecord;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    table::{column_index, DataTable, TableRow},
    Result,
};
use crate::{config::SplitConfig, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Train,
    Validation,
    Test,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionKind::Train => "train",
            PartitionKind::Validation => "validation",
            PartitionKind::Test => "test",
        };
        f.write_str(name)
    }
}

/// Immutable subset of table rows.
#[derive(Debug, Clone)]
pub struct Partition {
    kind: PartitionKind,
    headers: Arc<StringRecord>,
    rows: Vec<TableRow>,
}

impl Partition {
    pub fn new(kind: PartitionKind, headers: Arc<StringRecord>, rows: Vec<TableRow>) -> Self {
        Self {
            kind,
            headers,
            rows,
        }
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        column_index(&self.headers, name)
    }

    /// Original table positions of the rows, in partition order.
    pub fn positions(&self) -> Vec<usize> {
        self.rows.iter().map(|row| row.position).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Splits {
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
}

/// Partitions `table` into train/validation/test.
///
/// Train-labeled rows are truncated to the first `max_train_rows` (file
/// order) and then split with a seeded shuffle; `validation` receives
/// `ceil(fraction * n)` rows. Test rows are every row carrying the held-out
/// label and never depend on the random split.
pub fn split_table(table: &DataTable, config: &SplitConfig) -> Result<Splits> {
    let column = table.column_index(&config.column).ok_or_else(|| {
        TrainingError::validation(vec![format!(
            "data table has no split column '{}'",
            config.column
        )])
    })?;

    let labeled = |label: &str| -> Vec<TableRow> {
        table
            .rows()
            .iter()
            .filter(|row| row.get(column) == Some(label))
            .cloned()
            .collect()
    };

    let mut candidates = labeled(&config.train_label);
    candidates.truncate(config.max_train_rows);
    let test_rows = labeled(&config.holdout_label);

    let n = candidates.len();
    let n_validation = validation_count(n, config.validation_fraction);

    let mut permutation: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    permutation.shuffle(&mut rng);

    let validation_rows = permutation[..n_validation]
        .iter()
        .map(|&idx| candidates[idx].clone())
        .collect();
    let train_rows = permutation[n_validation..]
        .iter()
        .map(|&idx| candidates[idx].clone())
        .collect();

    let headers = Arc::clone(table.headers());
    Ok(Splits {
        train: Partition::new(PartitionKind::Train, Arc::clone(&headers), train_rows),
        validation: Partition::new(
            PartitionKind::Validation,
            Arc::clone(&headers),
            validation_rows,
        ),
        test: Partition::new(PartitionKind::Test, headers, test_rows),
    })
}

fn validation_count(n: usize, fraction: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let raw = fraction * n as f64;
    let rounded = raw.round();
    // 0.2 * 1000 must stay 200, not creep to 201 through float error
    let count = if (raw - rounded).abs() < 1e-9 {
        rounded
    } else {
        raw.ceil()
    };
    (count as usize).min(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn table(train: usize, holdout: usize, other: usize) -> DataTable {
        let mut rows = Vec::new();
        for i in 0..train {
            rows.push(vec![format!("train_{i}.png"), "train".to_string()]);
        }
        for i in 0..holdout {
            rows.push(vec![format!("holdout_{i}.png"), "val-new-cl".to_string()]);
        }
        for i in 0..other {
            rows.push(vec![format!("other_{i}.png"), "val-old".to_string()]);
        }
        DataTable::from_rows(&["frame_path", "split"], rows).unwrap()
    }

    #[test]
    fn reference_scenario_sizes() {
        let splits = split_table(&table(1200, 50, 7), &SplitConfig::default()).unwrap();

        assert_eq!(splits.train.len(), 800);
        assert_eq!(splits.validation.len(), 200);
        assert_eq!(splits.test.len(), 50);
        assert_eq!(splits.train.kind(), PartitionKind::Train);
        assert_eq!(splits.validation.kind().to_string(), "validation");
        assert_eq!(splits.test.kind().to_string(), "test");
    }

    #[test]
    fn truncation_keeps_first_rows_in_file_order() {
        let splits = split_table(&table(1200, 0, 0), &SplitConfig::default()).unwrap();

        let mut used: Vec<usize> = splits.train.positions();
        used.extend(splits.validation.positions());
        used.sort_unstable();
        assert_eq!(used, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn train_and_validation_are_disjoint() {
        let splits = split_table(&table(300, 10, 0), &SplitConfig::default()).unwrap();

        let train: HashSet<usize> = splits.train.positions().into_iter().collect();
        let validation: HashSet<usize> = splits.validation.positions().into_iter().collect();
        let test: HashSet<usize> = splits.test.positions().into_iter().collect();
        assert!(train.is_disjoint(&validation));
        assert!(train.is_disjoint(&test));
        assert!(validation.is_disjoint(&test));
        assert_eq!(train.len() + validation.len(), 300);
    }

    #[test]
    fn same_seed_gives_identical_partitions() {
        let source = table(500, 20, 0);
        let first = split_table(&source, &SplitConfig::default()).unwrap();
        let second = split_table(&source, &SplitConfig::default()).unwrap();

        assert_eq!(first.train.positions(), second.train.positions());
        assert_eq!(first.validation.positions(), second.validation.positions());
    }

    #[test]
    fn seed_changes_split_but_not_test() {
        let source = table(500, 20, 0);
        let base = split_table(&source, &SplitConfig::default()).unwrap();
        let reseeded = split_table(
            &source,
            &SplitConfig {
                seed: 7,
                ..SplitConfig::default()
            },
        )
        .unwrap();

        assert_ne!(base.validation.positions(), reseeded.validation.positions());
        assert_eq!(base.test.positions(), reseeded.test.positions());
    }

    #[test]
    fn missing_holdout_label_yields_empty_test() {
        let splits = split_table(&table(10, 0, 3), &SplitConfig::default()).unwrap();

        assert!(splits.test.is_empty());
        assert_eq!(splits.validation.len(), 2);
        assert_eq!(splits.train.len(), 8);
    }

    #[test]
    fn missing_split_column_is_a_configuration_error() {
        let source = DataTable::from_rows(&["frame_path"], vec![vec!["a.png".into()]]).unwrap();
        assert!(matches!(
            split_table(&source, &SplitConfig::default()),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn validation_count_rounds_up() {
        assert_eq!(validation_count(1000, 0.2), 200);
        assert_eq!(validation_count(11, 0.2), 3);
        assert_eq!(validation_count(1, 0.2), 1);
        assert_eq!(validation_count(0, 0.2), 0);
    }
}
