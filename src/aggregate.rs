use crate::config::ScoreScale;
use crate::models::{Criterion, ExperimentKind, ResultRow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A numeric column of the result table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    IsCorrect,
    Score(Criterion),
}

impl Column {
    /// `lc_is_correct` followed by the five criteria
    pub fn all() -> Vec<Column> {
        std::iter::once(Column::IsCorrect)
            .chain(Criterion::ALL.into_iter().map(Column::Score))
            .collect()
    }

    pub fn criteria() -> Vec<Column> {
        Criterion::ALL.into_iter().map(Column::Score).collect()
    }

    pub fn value(self, row: &ResultRow) -> f64 {
        match self {
            Column::IsCorrect => row.lc_is_correct,
            Column::Score(criterion) => row.scores.get(criterion),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Column::IsCorrect => "lc_is_correct",
            Column::Score(criterion) => criterion.label(),
        }
    }
}

/// Configuration key runs are grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    PromptAndChunk,
    Question,
    Experiment,
}

impl GroupKey {
    fn parts(self, row: &ResultRow) -> Vec<KeyPart> {
        match self {
            GroupKey::PromptAndChunk => vec![
                KeyPart::Text(row.prompt_version.clone()),
                KeyPart::Number(row.chunk_size),
            ],
            GroupKey::Question => vec![KeyPart::Text(row.question.clone())],
            GroupKey::Experiment => vec![KeyPart::Text(Some(row.experiment.clone()))],
        }
    }

    pub fn headers(self) -> &'static [&'static str] {
        match self {
            GroupKey::PromptAndChunk => &["prompt_version", "chunk_size"],
            GroupKey::Question => &["question"],
            GroupKey::Experiment => &["experiment"],
        }
    }
}

/// One component of a group key. Missing text sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Text(Option<String>),
    Number(i64),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Text(Some(text)) => f.write_str(text),
            KeyPart::Text(None) => f.write_str("(none)"),
            KeyPart::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Means of a group of result rows sharing one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub key: Vec<KeyPart>,
    /// One mean per aggregated column, in column order
    pub means: Vec<f64>,
    pub count: usize,
}

impl AggregateRow {
    /// Key rendered as `"v1 | 1024"`
    pub fn label(&self) -> String {
        self.key
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Result of grouping a table by one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub key: GroupKey,
    pub columns: Vec<Column>,
    pub rows: Vec<AggregateRow>,
}

impl Aggregation {
    pub fn mean(&self, row: &AggregateRow, column: Column) -> Option<f64> {
        let index = self.columns.iter().position(|c| *c == column)?;
        row.means.get(index).copied()
    }
}

/// Group `rows` by `key` and average `columns`. Groups come out in ascending key order.
pub fn aggregate(rows: &[ResultRow], key: GroupKey, columns: &[Column]) -> Aggregation {
    let mut groups: BTreeMap<Vec<KeyPart>, Vec<&ResultRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(key.parts(row)).or_default().push(row);
    }

    let rows = groups
        .into_iter()
        .map(|(key, members)| AggregateRow {
            means: columns
                .iter()
                .map(|column| {
                    let values: Vec<f64> = members.iter().map(|r| column.value(r)).collect();
                    calculate_mean(&values)
                })
                .collect(),
            count: members.len(),
            key,
        })
        .collect();

    Aggregation {
        key,
        columns: columns.to_vec(),
        rows,
    }
}

/// Headline accuracy of an experiment, in percent. `None` when no row counts.
///
/// Criteria experiments place each row's criterion mean on the scale, so the
/// lowest score is 0% and the highest 100%, skipping rows that were never
/// scored (all five zero). Correctness experiments average `lc_is_correct`.
pub fn global_precision(
    rows: &[ResultRow],
    kind: ExperimentKind,
    scale: &ScoreScale,
) -> Option<f64> {
    let span = scale.max - scale.min;
    let values: Vec<f64> = match kind {
        ExperimentKind::Criteria => rows
            .iter()
            .filter(|r| !r.scores.all_zero())
            .map(|r| (scale.clamp(r.scores.mean()) - scale.min) / span * 100.0)
            .collect(),
        ExperimentKind::Correctness => rows.iter().map(|r| r.lc_is_correct * 100.0).collect(),
    };

    if values.is_empty() {
        None
    } else {
        Some(calculate_mean(&values))
    }
}

/// Mean of a series, 0 when empty
pub fn calculate_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CriterionScores;

    fn row(prompt: &str, chunk: i64, correct: f64, scores: [f64; 5]) -> ResultRow {
        ResultRow {
            experiment: "eval_test".to_string(),
            question: Some(format!("q-{prompt}-{chunk}")),
            prompt_version: Some(prompt.to_string()),
            chunk_size: chunk,
            chunk_overlap: 100,
            lc_is_correct: correct,
            scores: CriterionScores {
                coherence: scores[0],
                correctness: scores[1],
                harmfulness: scores[2],
                relevance: scores[3],
                toxicity: scores[4],
            },
        }
    }

    const SCALE_5: ScoreScale = ScoreScale { min: 0.0, max: 5.0 };

    #[test]
    fn test_one_group_per_distinct_pair() {
        let rows = vec![
            row("v2", 1024, 1.0, [4.0; 5]),
            row("v1", 512, 0.0, [2.0; 5]),
            row("v2", 1024, 0.0, [2.0; 5]),
            row("v1", 1024, 1.0, [3.0; 5]),
            row("v1", 512, 1.0, [4.0; 5]),
        ];

        let agg = aggregate(&rows, GroupKey::PromptAndChunk, &Column::all());

        let labels: Vec<String> = agg.rows.iter().map(AggregateRow::label).collect();
        assert_eq!(labels, vec!["v1 | 512", "v1 | 1024", "v2 | 1024"]);
        assert_eq!(agg.rows[0].count, 2);
        assert_eq!(agg.mean(&agg.rows[0], Column::IsCorrect), Some(0.5));
        assert_eq!(
            agg.mean(&agg.rows[0], Column::Score(Criterion::Coherence)),
            Some(3.0)
        );
        assert_eq!(agg.rows[1].count, 1);
        assert_eq!(agg.mean(&agg.rows[2], Column::IsCorrect), Some(0.5));
        assert_eq!(
            agg.mean(&agg.rows[2], Column::Score(Criterion::Toxicity)),
            Some(3.0)
        );
    }

    #[test]
    fn test_chunk_size_sorted_numerically() {
        let rows = vec![row("v1", 1024, 0.0, [0.0; 5]), row("v1", 256, 0.0, [0.0; 5])];
        let agg = aggregate(&rows, GroupKey::PromptAndChunk, &[Column::IsCorrect]);
        assert_eq!(agg.rows[0].key[1], KeyPart::Number(256));
    }

    #[test]
    fn test_missing_key_forms_own_group() {
        let mut unnamed = row("v1", 512, 1.0, [1.0; 5]);
        unnamed.question = None;
        let rows = vec![row("v1", 512, 0.0, [3.0; 5]), unnamed];

        let agg = aggregate(&rows, GroupKey::Question, &Column::criteria());

        assert_eq!(agg.rows.len(), 2);
        assert_eq!(agg.rows[0].label(), "(none)");
        assert_eq!(agg.rows[0].means, vec![1.0; 5]);
    }

    #[test]
    fn test_group_by_experiment() {
        let mut other = row("v1", 512, 0.0, [5.0; 5]);
        other.experiment = "eval_criteria_b".to_string();
        let mut first = row("v1", 512, 0.0, [1.0; 5]);
        first.experiment = "eval_criteria_a".to_string();

        let agg = aggregate(&[other, first], GroupKey::Experiment, &Column::criteria());

        assert_eq!(agg.rows[0].label(), "eval_criteria_a");
        assert_eq!(agg.rows[1].means, vec![5.0; 5]);
    }

    #[test]
    fn test_global_precision_correctness() {
        let rows = vec![
            row("v1", 512, 1.0, [0.0; 5]),
            row("v1", 512, 0.0, [0.0; 5]),
            row("v1", 512, 1.0, [0.0; 5]),
        ];
        let precision = global_precision(&rows, ExperimentKind::Correctness, &SCALE_5).unwrap();
        assert_eq!(format!("{precision:.1}%"), "66.7%");
    }

    #[test]
    fn test_global_precision_criteria_skips_unscored_rows() {
        let rows = vec![row("v1", 512, 0.0, [0.0; 5]), row("v1", 512, 0.0, [4.0; 5])];
        let precision = global_precision(&rows, ExperimentKind::Criteria, &SCALE_5).unwrap();
        assert!((precision - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_global_precision_criteria_ignores_correct_flag() {
        let rows = vec![row("v1", 512, 1.0, [10.0, 7.0, 10.0, 4.0, 10.0])];
        let scale = ScoreScale { min: 1.0, max: 10.0 };
        let precision = global_precision(&rows, ExperimentKind::Criteria, &scale).unwrap();
        assert!((precision - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_global_precision_spans_scale_bounds() {
        let scale = ScoreScale { min: 1.0, max: 10.0 };
        let worst = vec![row("v1", 512, 0.0, [1.0; 5])];
        let best = vec![row("v1", 512, 0.0, [10.0; 5])];
        let out_of_range = vec![row("v1", 512, 0.0, [40.0; 5])];

        let at = |rows: &[ResultRow]| {
            global_precision(rows, ExperimentKind::Criteria, &scale).unwrap()
        };
        assert_eq!(at(&worst), 0.0);
        assert_eq!(at(&best), 100.0);
        assert_eq!(at(&out_of_range), 100.0);
    }

    #[test]
    fn test_global_precision_no_contributing_rows() {
        let rows = vec![row("v1", 512, 1.0, [0.0; 5])];
        assert_eq!(global_precision(&rows, ExperimentKind::Criteria, &SCALE_5), None);
        assert_eq!(global_precision(&[], ExperimentKind::Correctness, &SCALE_5), None);
    }

    #[test]
    fn test_calculate_mean() {
        assert_eq!(calculate_mean(&[]), 0.0);
        assert!((calculate_mean(&[0.6, 0.7, 0.8, 0.9]) - 0.75).abs() < 1e-9);
    }
}
