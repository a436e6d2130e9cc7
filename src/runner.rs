use crate::assistant::RagChain;
use crate::config::AssistantConfig;
use crate::grading::{Grader, GradingInput};
use crate::models::{BatchSummary, Criterion, DatasetItem, ExperimentKind, ItemResult};
use crate::projection::{
    METRIC_IS_CORRECT, PARAM_CHUNK_OVERLAP, PARAM_CHUNK_SIZE, PARAM_PROMPT_VERSION, PARAM_QUESTION,
};
use crate::tracking::{ExperimentStore, RunStatus};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Load the evaluation dataset: a JSON array of `{question, answer}` objects
pub fn load_dataset(path: &Path) -> Result<Vec<DatasetItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse dataset: {}", path.display()))
}

/// Runs a dataset through the assistant, grades every answer and records one run per item
pub struct BatchEvaluator<'a> {
    store: &'a dyn ExperimentStore,
    chain: &'a dyn RagChain,
    grader: &'a mut dyn Grader,
    assistant: AssistantConfig,
    kind: ExperimentKind,
    experiment_prefix: String,
}

impl<'a> BatchEvaluator<'a> {
    pub fn new(
        store: &'a dyn ExperimentStore,
        chain: &'a dyn RagChain,
        grader: &'a mut dyn Grader,
        assistant: AssistantConfig,
        kind: ExperimentKind,
        experiment_prefix: &str,
    ) -> Self {
        Self {
            store,
            chain,
            grader,
            assistant,
            kind,
            experiment_prefix: experiment_prefix.to_string(),
        }
    }

    pub fn experiment_name(&self) -> String {
        self.kind.experiment_name(
            &self.experiment_prefix,
            &self.assistant.prompt_version,
            self.assistant.chunk_size,
        )
    }

    /// Evaluate every item in order. The first failure aborts the batch.
    pub async fn run(&mut self, dataset: &[DatasetItem]) -> Result<BatchSummary> {
        let experiment = self.experiment_name();
        let experiment_id = self
            .store
            .get_or_create_experiment(&experiment, self.kind)
            .await
            .with_context(|| format!("Failed to set up experiment {experiment}"))?;
        info!(%experiment, %experiment_id, items = dataset.len(), "starting batch evaluation");

        let mut items = Vec::with_capacity(dataset.len());
        for (index, item) in dataset.iter().enumerate() {
            let item_num = index + 1;
            info!("Evaluating question {}/{}", item_num, dataset.len());

            let run_id = self
                .store
                .create_run(&experiment_id, &format!("eval_q{item_num}"))
                .await
                .with_context(|| format!("Failed to create run for question {item_num}"))?;

            match self.evaluate_item(&run_id, item).await {
                Ok(result) => {
                    self.store
                        .finish_run(&run_id, RunStatus::Finished)
                        .await
                        .with_context(|| format!("Failed to finish run {run_id}"))?;
                    items.push(result);
                }
                Err(err) => {
                    let finished = self.store.finish_run(&run_id, RunStatus::Failed).await;
                    if let Err(finish_err) = finished {
                        warn!(%run_id, error = %finish_err, "could not mark run as failed");
                    }
                    return Err(err.context(format!(
                        "Failed to evaluate question {item_num}: {}",
                        item.question
                    )));
                }
            }
        }

        Ok(BatchSummary {
            experiment,
            experiment_id,
            kind: self.kind,
            items,
        })
    }

    async fn evaluate_item(&mut self, run_id: &str, item: &DatasetItem) -> Result<ItemResult> {
        debug!(question = %item.question, "generating answer");
        let generated = self
            .chain
            .invoke(&item.question, &[])
            .await
            .context("Failed to generate answer")?;

        let input = GradingInput {
            question: &item.question,
            prediction: &generated,
            reference: &item.answer,
        };
        let metrics = self.grade(&input).await?;

        let params = self.params(&item.question);
        let mut logged: Vec<(String, f64)> = metrics.iter().map(|(k, v)| (k.clone(), *v)).collect();
        logged.sort_by(|a, b| a.0.cmp(&b.0));
        self.store
            .log_batch(run_id, &params, &logged)
            .await
            .context("Failed to log run parameters and metrics")?;

        Ok(ItemResult {
            run_id: run_id.to_string(),
            question: item.question.clone(),
            expected: item.answer.clone(),
            generated,
            metrics,
        })
    }

    async fn grade(&mut self, input: &GradingInput<'_>) -> Result<HashMap<String, f64>> {
        let mut metrics = HashMap::new();
        match self.kind {
            ExperimentKind::Criteria => {
                for criterion in Criterion::ALL {
                    let score = self
                        .grader
                        .score(criterion, input)
                        .await
                        .with_context(|| format!("Failed to grade {}", criterion.name()))?;
                    info!("{}: {}", criterion.label(), score);
                    metrics.insert(criterion.metric_key(), score);
                }
            }
            ExperimentKind::Correctness => {
                let correct = self
                    .grader
                    .is_correct(input)
                    .await
                    .context("Failed to grade correctness")?;
                info!(correct, "QA verdict");
                metrics.insert(METRIC_IS_CORRECT.to_string(), if correct { 1.0 } else { 0.0 });
            }
        }
        Ok(metrics)
    }

    fn params(&self, question: &str) -> Vec<(String, String)> {
        vec![
            (PARAM_QUESTION.to_string(), question.to_string()),
            (
                PARAM_PROMPT_VERSION.to_string(),
                self.assistant.prompt_version.clone(),
            ),
            (
                PARAM_CHUNK_SIZE.to_string(),
                self.assistant.chunk_size.to_string(),
            ),
            (
                PARAM_CHUNK_OVERLAP.to_string(),
                self.assistant.chunk_overlap.to_string(),
            ),
        ]
    }
}

/// Store the batch summary to a JSON file
pub fn store_summary(summary: &BatchSummary, path: &Path) -> Result<()> {
    let json_content =
        serde_json::to_string_pretty(summary).context("Failed to serialize summary to JSON")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    std::fs::write(path, json_content)
        .with_context(|| format!("Failed to write summary to: {}", path.display()))?;
    info!(path = %path.display(), "summary stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{GroupKey, Column, aggregate};
    use crate::models::ConversationTurn;
    use crate::projection::project_runs;
    use crate::report::tests::MemoryStore;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::{NamedTempFile, tempdir};

    struct MockChain {
        histories: Mutex<Vec<usize>>,
        should_fail: bool,
    }

    impl MockChain {
        fn new() -> Self {
            Self {
                histories: Mutex::new(Vec::new()),
                should_fail: false,
            }
        }
    }

    #[async_trait]
    impl RagChain for MockChain {
        async fn invoke(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
            self.histories.lock().unwrap().push(history.len());
            if self.should_fail {
                bail!("chain down");
            }
            Ok(format!("generated: {question}"))
        }
    }

    struct MockGrader {
        calls: Vec<Criterion>,
        fail_on_call: Option<usize>,
    }

    impl MockGrader {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                fail_on_call: None,
            }
        }
    }

    #[async_trait]
    impl Grader for MockGrader {
        async fn score(&mut self, criterion: Criterion, _input: &GradingInput<'_>) -> Result<f64> {
            self.calls.push(criterion);
            if self.fail_on_call == Some(self.calls.len()) {
                bail!("judge rate limited");
            }
            Ok(match criterion {
                Criterion::Coherence => 8.0,
                Criterion::Correctness => 7.0,
                Criterion::Harmfulness => 10.0,
                Criterion::Relevance => 9.0,
                Criterion::Toxicity => 10.0,
            })
        }

        async fn is_correct(&mut self, input: &GradingInput<'_>) -> Result<bool> {
            Ok(input.question.contains("orbit"))
        }
    }

    fn assistant_config() -> AssistantConfig {
        AssistantConfig {
            endpoint: "http://localhost:8000".to_string(),
            prompt_version: "v2_resumido_directo".to_string(),
            chunk_size: 1024,
            chunk_overlap: 100,
        }
    }

    fn dataset() -> Vec<DatasetItem> {
        vec![
            DatasetItem {
                question: "Which orbit does the constellation use?".to_string(),
                answer: "Low Earth orbit".to_string(),
            },
            DatasetItem {
                question: "Who operates the ground station?".to_string(),
                answer: "The national space agency".to_string(),
            },
            DatasetItem {
                question: "What band is the downlink?".to_string(),
                answer: "X-band".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_criteria_batch_logs_one_run_per_item() {
        let store = MemoryStore::default();
        let chain = MockChain::new();
        let mut grader = MockGrader::new();

        let mut evaluator = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Criteria,
            "eval_",
        );
        let summary = evaluator.run(&dataset()).await.unwrap();

        assert_eq!(summary.experiment, "eval_criteria_v2_resumido_directo_1024");
        assert_eq!(summary.items.len(), 3);
        assert_eq!(*chain.histories.lock().unwrap(), vec![0, 0, 0]);
        assert_eq!(grader.calls.len(), 15);

        let runs = store.runs.lock().unwrap().get(&summary.experiment_id).cloned().unwrap();
        assert_eq!(runs.len(), 3);
        for run in &runs {
            assert_eq!(run.params.len(), 4);
            assert_eq!(run.metrics.len(), 5);
            assert_eq!(run.params["chunk_size"], "1024");
            assert_eq!(run.params["chunk_overlap"], "100");
            assert_eq!(run.params["prompt_version"], "v2_resumido_directo");
            assert_eq!(run.metrics["relevance_score"], 9.0);
        }

        let finished = store.finished.lock().unwrap();
        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|(_, status)| *status == RunStatus::Finished));

        let experiments = store.experiments.lock().unwrap();
        assert_eq!(experiments[0].kind, ExperimentKind::Criteria);
    }

    #[tokio::test]
    async fn test_logged_runs_project_back_into_rows() {
        let store = MemoryStore::default();
        let chain = MockChain::new();
        let mut grader = MockGrader::new();

        let summary = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Criteria,
            "eval_",
        )
        .run(&dataset())
        .await
        .unwrap();

        let runs = store.search_runs(&summary.experiment_id).await.unwrap();
        let rows = project_runs(&summary.experiment, &runs).unwrap();
        let agg = aggregate(&rows, GroupKey::PromptAndChunk, &Column::criteria());

        assert_eq!(agg.rows.len(), 1);
        assert_eq!(agg.rows[0].label(), "v2_resumido_directo | 1024");
        assert_eq!(agg.rows[0].count, 3);
        assert_eq!(agg.rows[0].means, vec![8.0, 7.0, 10.0, 9.0, 10.0]);
    }

    #[tokio::test]
    async fn test_correctness_batch_logs_binary_flag() {
        let store = MemoryStore::default();
        let chain = MockChain::new();
        let mut grader = MockGrader::new();

        let summary = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Correctness,
            "eval_",
        )
        .run(&dataset())
        .await
        .unwrap();

        assert_eq!(summary.experiment, "eval_v2_resumido_directo_1024");
        let flags: Vec<f64> = summary
            .items
            .iter()
            .map(|i| i.metrics["lc_is_correct"])
            .collect();
        assert_eq!(flags, vec![1.0, 0.0, 0.0]);
        assert!(grader.calls.is_empty());
    }

    #[tokio::test]
    async fn test_grader_failure_aborts_batch() {
        let store = MemoryStore::default();
        let chain = MockChain::new();
        let mut grader = MockGrader {
            fail_on_call: Some(7),
            ..MockGrader::new()
        };

        let result = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Criteria,
            "eval_",
        )
        .run(&dataset())
        .await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("judge rate limited"));
        // Second item failed on its second criterion; the third never started.
        assert_eq!(chain.histories.lock().unwrap().len(), 2);
        let finished = store.finished.lock().unwrap();
        assert_eq!(
            finished.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
            vec![RunStatus::Finished, RunStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_chain_failure_aborts_batch() {
        let store = MemoryStore::default();
        let chain = MockChain {
            should_fail: true,
            ..MockChain::new()
        };
        let mut grader = MockGrader::new();

        let result = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Criteria,
            "eval_",
        )
        .run(&dataset())
        .await;

        assert!(format!("{:#}", result.unwrap_err()).contains("chain down"));
        assert!(grader.calls.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dataset_creates_no_runs() {
        let store = MemoryStore::default();
        let chain = MockChain::new();
        let mut grader = MockGrader::new();

        let summary = BatchEvaluator::new(
            &store,
            &chain,
            &mut grader,
            assistant_config(),
            ExperimentKind::Criteria,
            "eval_",
        )
        .run(&[])
        .await
        .unwrap();

        assert!(summary.items.is_empty());
        assert!(store.finished.lock().unwrap().is_empty());
    }

    #[test]
    fn test_load_dataset() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"question": "What is TLE?", "answer": "Two-line element set"}}]"#
        )
        .unwrap();

        let items = load_dataset(file.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].answer, "Two-line element set");
    }

    #[test]
    fn test_load_dataset_missing_field() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"question": "No answer"}}]"#).unwrap();
        assert!(load_dataset(file.path()).is_err());
    }

    #[test]
    fn test_store_summary_with_nested_directory() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("nested").join("summary.json");

        let summary = BatchSummary {
            experiment: "eval_criteria_v2_1024".to_string(),
            experiment_id: "3".to_string(),
            kind: ExperimentKind::Criteria,
            items: vec![],
        };

        store_summary(&summary, &file_path).unwrap();

        let content = std::fs::read_to_string(&file_path).unwrap();
        assert!(content.contains("eval_criteria_v2_1024"));
        assert!(content.contains("\"kind\": \"criteria\""));
    }
}
