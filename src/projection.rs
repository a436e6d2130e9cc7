use crate::error::ProjectionError;
use crate::models::{Criterion, CriterionScores, ResultRow, RunRecord};

pub const PARAM_QUESTION: &str = "question";
pub const PARAM_PROMPT_VERSION: &str = "prompt_version";
pub const PARAM_CHUNK_SIZE: &str = "chunk_size";
pub const PARAM_CHUNK_OVERLAP: &str = "chunk_overlap";
pub const METRIC_IS_CORRECT: &str = "lc_is_correct";

/// Project the runs of one experiment into result rows, preserving order
pub fn project_runs(
    experiment: &str,
    runs: &[RunRecord],
) -> Result<Vec<ResultRow>, ProjectionError> {
    runs.iter().map(|run| project_run(experiment, run)).collect()
}

/// Project a single run. Missing params become `None`, missing metrics 0.
pub fn project_run(experiment: &str, run: &RunRecord) -> Result<ResultRow, ProjectionError> {
    let mut scores = CriterionScores::default();
    for criterion in Criterion::ALL {
        scores.set(criterion, metric(run, &criterion.metric_key()));
    }

    Ok(ResultRow {
        experiment: experiment.to_string(),
        question: run.params.get(PARAM_QUESTION).cloned(),
        prompt_version: run.params.get(PARAM_PROMPT_VERSION).cloned(),
        chunk_size: integer_param(run, PARAM_CHUNK_SIZE)?,
        chunk_overlap: integer_param(run, PARAM_CHUNK_OVERLAP)?,
        lc_is_correct: metric(run, METRIC_IS_CORRECT),
        scores,
    })
}

fn metric(run: &RunRecord, key: &str) -> f64 {
    run.metrics.get(key).copied().unwrap_or(0.0)
}

fn integer_param(run: &RunRecord, key: &str) -> Result<i64, ProjectionError> {
    match run.params.get(key) {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ProjectionError::MalformedInteger {
                run_id: run.run_id.clone(),
                key: key.to_string(),
                value: value.clone(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(id: &str, params: &[(&str, &str)], metrics: &[(&str, f64)]) -> RunRecord {
        RunRecord {
            run_id: id.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_projection_preserves_order_and_fields() {
        let runs = vec![
            run(
                "b",
                &[
                    ("question", "How high is LEO?"),
                    ("prompt_version", "v1"),
                    ("chunk_size", "512"),
                    ("chunk_overlap", "50"),
                ],
                &[("lc_is_correct", 1.0), ("relevance_score", 9.0)],
            ),
            run(
                "a",
                &[("question", "What is a transponder?"), ("chunk_size", "1024")],
                &[("coherence_score", 7.0)],
            ),
        ];

        let rows = project_runs("eval_v1_512", &runs).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].question.as_deref(), Some("How high is LEO?"));
        assert_eq!(rows[0].prompt_version.as_deref(), Some("v1"));
        assert_eq!(rows[0].chunk_size, 512);
        assert_eq!(rows[0].chunk_overlap, 50);
        assert_eq!(rows[0].lc_is_correct, 1.0);
        assert_eq!(rows[0].scores.relevance, 9.0);
        assert_eq!(rows[0].experiment, "eval_v1_512");

        assert_eq!(rows[1].question.as_deref(), Some("What is a transponder?"));
        assert_eq!(rows[1].prompt_version, None);
        assert_eq!(rows[1].chunk_overlap, 0);
        assert_eq!(rows[1].scores.coherence, 7.0);
    }

    #[test]
    fn test_missing_metrics_zero_filled() {
        let rows = project_runs("eval_x", &[run("r", &[], &[])]).unwrap();
        let row = &rows[0];
        assert_eq!(row.chunk_size, 0);
        assert_eq!(row.lc_is_correct, 0.0);
        assert!(row.scores.all_zero());
        for criterion in Criterion::ALL {
            assert_eq!(row.scores.get(criterion), 0.0);
        }
    }

    #[test]
    fn test_malformed_integer_is_typed_error() {
        let runs = vec![
            run("ok", &[("chunk_size", "256")], &[]),
            run("bad", &[("chunk_size", "1024.0")], &[]),
        ];

        let err = project_runs("eval_x", &runs).unwrap_err();
        assert_eq!(
            err,
            ProjectionError::MalformedInteger {
                run_id: "bad".to_string(),
                key: "chunk_size".to_string(),
                value: "1024.0".to_string(),
            }
        );
    }

    #[test]
    fn test_integer_whitespace_tolerated() {
        let rows = project_runs("eval_x", &[run("r", &[("chunk_overlap", " 64\n")], &[])]).unwrap();
        assert_eq!(rows[0].chunk_overlap, 64);
    }

    #[test]
    fn test_empty_runs() {
        assert!(project_runs("eval_x", &[]).unwrap().is_empty());
    }
}
