use crate::error::TrackingError;
use crate::models::{Experiment, ExperimentKind, KIND_TAG, RunRecord};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

const PAGE_SIZE: u32 = 1000;

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Finished,
    Failed,
}

/// The experiment tracker, as seen by the evaluator and the reports
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// All experiments whose name starts with `prefix`
    async fn search_experiments(&self, prefix: &str) -> Result<Vec<Experiment>, TrackingError>;

    async fn get_experiment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Experiment>, TrackingError>;

    /// Runs of one experiment, most recent start time first
    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunRecord>, TrackingError>;

    /// Returns the id of the named experiment, creating it with the kind tag if needed
    async fn get_or_create_experiment(
        &self,
        name: &str,
        kind: ExperimentKind,
    ) -> Result<String, TrackingError>;

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> Result<String, TrackingError>;

    async fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[(String, f64)],
    ) -> Result<(), TrackingError>;

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError>;
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct MetricValue {
    key: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ExperimentPayload {
    experiment_id: String,
    name: String,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

impl From<ExperimentPayload> for Experiment {
    fn from(payload: ExperimentPayload) -> Self {
        let kind_tag = payload
            .tags
            .iter()
            .find(|t| t.key == KIND_TAG)
            .map(|t| t.value.as_str());
        Experiment {
            kind: ExperimentKind::from_tag(kind_tag),
            id: payload.experiment_id,
            name: payload.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments: Vec<ExperimentPayload>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentPayload,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
    run_name: Option<String>,
    start_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RunData {
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    metrics: Vec<MetricValue>,
}

#[derive(Debug, Deserialize)]
struct RunPayload {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

impl From<RunPayload> for RunRecord {
    fn from(payload: RunPayload) -> Self {
        RunRecord {
            run_id: payload.info.run_id,
            run_name: payload.info.run_name,
            start_time: payload.info.start_time,
            params: payload
                .data
                .params
                .into_iter()
                .map(|p| (p.key, p.value))
                .collect(),
            metrics: payload
                .data
                .metrics
                .into_iter()
                .map(|m| (m.key, m.value))
                .collect::<HashMap<_, _>>(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<RunPayload>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunPayload,
}

/// Client for the MLflow tracking REST API (2.0)
pub struct MlflowClient {
    base_url: String,
    http: reqwest::Client,
}

impl MlflowClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, TrackingError> {
        let endpoint = self.endpoint(path);
        debug!(%endpoint, "tracking POST");
        let request = self.http.post(&endpoint).json(&body);
        Self::send(request, endpoint).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TrackingError> {
        let endpoint = self.endpoint(path);
        debug!(%endpoint, "tracking GET");
        let request = self.http.get(&endpoint).query(query);
        Self::send(request, endpoint).await
    }

    async fn send<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
        endpoint: String,
    ) -> Result<T, TrackingError> {
        let response = request.send().await.map_err(|source| TrackingError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| TrackingError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(TrackingError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        // Some endpoints answer with an empty body
        let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
        serde_json::from_str(body).map_err(|source| TrackingError::Decode { endpoint, source })
    }
}

#[async_trait]
impl ExperimentStore for MlflowClient {
    async fn search_experiments(&self, prefix: &str) -> Result<Vec<Experiment>, TrackingError> {
        let mut experiments = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut body = json!({ "max_results": PAGE_SIZE });
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }

            let page: SearchExperimentsResponse = self.post("experiments/search", body).await?;
            experiments.extend(
                page.experiments
                    .into_iter()
                    .filter(|e| e.name.starts_with(prefix))
                    .map(Experiment::from),
            );

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(experiments)
    }

    async fn get_experiment_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Experiment>, TrackingError> {
        match self
            .get::<GetExperimentResponse>("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(response) => Ok(Some(response.experiment.into())),
            Err(TrackingError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunRecord>, TrackingError> {
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut body = json!({
                "experiment_ids": [experiment_id],
                "order_by": ["attributes.start_time DESC"],
                "max_results": PAGE_SIZE,
            });
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }

            let page: SearchRunsResponse = self.post("runs/search", body).await?;
            runs.extend(page.runs.into_iter().map(RunRecord::from));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(runs)
    }

    async fn get_or_create_experiment(
        &self,
        name: &str,
        kind: ExperimentKind,
    ) -> Result<String, TrackingError> {
        if let Some(existing) = self.get_experiment_by_name(name).await? {
            return Ok(existing.id);
        }

        let body = json!({
            "name": name,
            "tags": [{ "key": KIND_TAG, "value": kind.as_tag() }],
        });
        let created: CreateExperimentResponse = self.post("experiments/create", body).await?;
        Ok(created.experiment_id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> Result<String, TrackingError> {
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": chrono::Utc::now().timestamp_millis(),
        });
        let created: CreateRunResponse = self.post("runs/create", body).await?;
        Ok(created.run.info.run_id)
    }

    async fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[(String, f64)],
    ) -> Result<(), TrackingError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let body = json!({
            "run_id": run_id,
            "params": params
                .iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect::<Vec<_>>(),
            "metrics": metrics
                .iter()
                .map(|(key, value)| {
                    json!({ "key": key, "value": value, "timestamp": timestamp, "step": 0 })
                })
                .collect::<Vec<_>>(),
        });
        let _: serde_json::Value = self.post("runs/log-batch", body).await?;
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), TrackingError> {
        let body = json!({
            "run_id": run_id,
            "status": status,
            "end_time": chrono::Utc::now().timestamp_millis(),
        });
        let _: serde_json::Value = self.post("runs/update", body).await?;
        Ok(())
    }
}
