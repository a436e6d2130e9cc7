use crate::aggregate::{Aggregation, Column, GroupKey, aggregate, global_precision};
use crate::config::ScoreScale;
use crate::models::{Criterion, Experiment, ExperimentKind, ResultRow};
use crate::projection::project_runs;
use crate::tracking::ExperimentStore;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// The available dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum View {
    /// Per-question table, headline precision, prompt x chunk summary
    Summary,
    /// Binary correctness per prompt x chunk configuration
    Correctness,
    /// Criterion scores per question, stacked
    Criteria,
    /// Criterion means across several experiments, stacked
    ByExperiment,
}

/// A column of the per-run table
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    Question,
    Prompt,
    ChunkSize,
    ChunkOverlap,
    Metric(Column),
}

impl Field {
    fn header(self) -> &'static str {
        match self {
            Field::Question => "question",
            Field::Prompt => "prompt_version",
            Field::ChunkSize => "chunk_size",
            Field::ChunkOverlap => "chunk_overlap",
            Field::Metric(column) => column.label(),
        }
    }

    fn cell(self, row: &ResultRow) -> Cell {
        match self {
            Field::Question => Cell::Text(row.question.clone()),
            Field::Prompt => Cell::Text(row.prompt_version.clone()),
            Field::ChunkSize => Cell::Integer(row.chunk_size),
            Field::ChunkOverlap => Cell::Integer(row.chunk_overlap),
            Field::Metric(column) => Cell::Number(column.value(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    /// One bar per series, side by side
    Grouped,
    /// Series stacked, labelled with the mean of the segments
    Stacked,
}

/// Declarative description of a view
#[derive(Debug, Clone)]
pub struct ViewLayout {
    pub title: &'static str,
    pub multi_experiment: bool,
    pub table: Vec<Field>,
    pub grouping: Option<(GroupKey, Vec<Column>)>,
    pub chart: Option<(ChartKind, Vec<Column>)>,
    pub headline: bool,
    pub evidence: bool,
}

impl View {
    pub fn layout(self) -> ViewLayout {
        let criteria_fields = Criterion::ALL
            .into_iter()
            .map(|c| Field::Metric(Column::Score(c)));

        match self {
            View::Summary => ViewLayout {
                title: "Chatbot evaluation summary",
                multi_experiment: false,
                table: [
                    Field::Question,
                    Field::Prompt,
                    Field::ChunkSize,
                    Field::ChunkOverlap,
                    Field::Metric(Column::IsCorrect),
                ]
                .into_iter()
                .chain(criteria_fields)
                .collect(),
                grouping: Some((GroupKey::PromptAndChunk, Column::all())),
                chart: Some((
                    ChartKind::Grouped,
                    vec![
                        Column::IsCorrect,
                        Column::Score(Criterion::Coherence),
                        Column::Score(Criterion::Correctness),
                    ],
                )),
                headline: true,
                evidence: true,
            },
            View::Correctness => ViewLayout {
                title: "Evaluation results: correctness",
                multi_experiment: false,
                table: vec![
                    Field::Question,
                    Field::Prompt,
                    Field::ChunkSize,
                    Field::Metric(Column::IsCorrect),
                ],
                grouping: Some((GroupKey::PromptAndChunk, vec![Column::IsCorrect])),
                chart: Some((ChartKind::Grouped, vec![Column::IsCorrect])),
                headline: false,
                evidence: false,
            },
            View::Criteria => ViewLayout {
                title: "Evaluation results: criteria per question",
                multi_experiment: false,
                table: [Field::Question, Field::Prompt, Field::ChunkSize]
                    .into_iter()
                    .chain(criteria_fields)
                    .collect(),
                grouping: Some((GroupKey::Question, Column::criteria())),
                chart: Some((ChartKind::Stacked, Column::criteria())),
                headline: false,
                evidence: false,
            },
            View::ByExperiment => ViewLayout {
                title: "Evaluation summary by experiment",
                multi_experiment: true,
                table: Vec::new(),
                grouping: Some((GroupKey::Experiment, Column::criteria())),
                chart: Some((ChartKind::Stacked, Column::criteria())),
                headline: false,
                evidence: false,
            },
        }
    }
}

/// A table cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(Option<String>),
    Integer(i64),
    Number(f64),
}

/// Per-run table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub label: String,
    /// One value per series
    pub values: Vec<f64>,
    /// Mean of the segments, shown on stacked bars
    pub total_label: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub kind: ChartKind,
    pub series: Vec<String>,
    pub bars: Vec<Bar>,
}

/// Headline metrics of a single experiment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Headline {
    pub kind: ExperimentKind,
    /// Percent; `None` when no run was scored
    pub global_precision: Option<f64>,
    pub evaluated: usize,
}

/// A rendered view
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub view: View,
    pub title: String,
    pub experiments: Vec<String>,
    pub headline: Option<Headline>,
    pub table: Option<Table>,
    pub summary: Option<Aggregation>,
    pub chart: Option<Chart>,
    pub evidence: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Why a view stopped before computing anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EmptyReason {
    NoExperiments { prefix: String },
    NoRuns { experiments: Vec<String> },
    NoSelection,
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::NoExperiments { prefix } => {
                write!(f, "No evaluation experiments found (prefix `{prefix}`).")
            }
            EmptyReason::NoRuns { experiments } => {
                write!(f, "No runs recorded in: {}.", experiments.join(", "))
            }
            EmptyReason::NoSelection => {
                f.write_str("Select at least one experiment with --experiment.")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    Ready(Report),
    Empty(EmptyReason),
}

/// Settings shared by every view
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub experiment_prefix: String,
    pub scale: ScoreScale,
    pub evidence_images: Vec<PathBuf>,
}

/// Fetch, project, aggregate and lay out one view
pub async fn build_report(
    store: &dyn ExperimentStore,
    view: View,
    selection: &[String],
    settings: &ReportSettings,
) -> Result<ReportOutcome> {
    let layout = view.layout();

    let experiments = store
        .search_experiments(&settings.experiment_prefix)
        .await
        .context("Failed to list experiments")?;
    if experiments.is_empty() {
        return Ok(ReportOutcome::Empty(EmptyReason::NoExperiments {
            prefix: settings.experiment_prefix.clone(),
        }));
    }

    let selected = match select_experiments(&experiments, selection, layout.multi_experiment)? {
        Some(selected) => selected,
        None => return Ok(ReportOutcome::Empty(EmptyReason::NoSelection)),
    };

    let mut rows = Vec::new();
    for experiment in &selected {
        let runs = store
            .search_runs(&experiment.id)
            .await
            .with_context(|| format!("Failed to list runs of {}", experiment.name))?;
        debug!(experiment = %experiment.name, runs = runs.len(), "fetched runs");
        rows.extend(project_runs(&experiment.name, &runs)?);
    }

    let names: Vec<String> = selected.iter().map(|e| e.name.clone()).collect();
    if rows.is_empty() {
        return Ok(ReportOutcome::Empty(EmptyReason::NoRuns { experiments: names }));
    }

    let headline = layout.headline.then(|| Headline {
        kind: selected[0].kind,
        global_precision: global_precision(&rows, selected[0].kind, &settings.scale),
        evaluated: rows.len(),
    });

    let table = (!layout.table.is_empty()).then(|| build_table(&layout.table, &rows));
    let summary = layout
        .grouping
        .as_ref()
        .map(|(key, columns)| aggregate(&rows, *key, columns));
    let chart = match (&layout.chart, &summary) {
        (Some((kind, columns)), Some(summary)) => Some(build_chart(*kind, columns, summary)),
        _ => None,
    };

    let mut evidence = Vec::new();
    let mut warnings = Vec::new();
    if layout.evidence {
        for path in &settings.evidence_images {
            if path.is_file() {
                evidence.push(path.clone());
            } else {
                warn!(path = %path.display(), "evidence image not found");
                warnings.push(format!("Evidence image not found: {}", path.display()));
            }
        }
    }

    Ok(ReportOutcome::Ready(Report {
        view,
        title: layout.title.to_string(),
        experiments: names,
        headline,
        table,
        summary,
        chart,
        evidence,
        warnings,
    }))
}

/// Single-experiment views default to the first listed experiment.
/// Multi-experiment views need an explicit selection.
fn select_experiments(
    experiments: &[Experiment],
    selection: &[String],
    multi: bool,
) -> Result<Option<Vec<Experiment>>> {
    if selection.is_empty() {
        return Ok(if multi {
            None
        } else {
            Some(vec![experiments[0].clone()])
        });
    }

    let wanted = if multi { selection } else { &selection[..1] };
    if !multi && selection.len() > 1 {
        warn!(
            using = %selection[0],
            ignored = ?&selection[1..],
            "view shows a single experiment, ignoring the rest"
        );
    }

    let mut selected: Vec<Experiment> = Vec::with_capacity(wanted.len());
    for name in wanted {
        if selected.iter().any(|e| &e.name == name) {
            continue;
        }
        match experiments.iter().find(|e| &e.name == name) {
            Some(experiment) => selected.push(experiment.clone()),
            None => bail!("Unknown evaluation experiment: {name}"),
        }
    }
    Ok(Some(selected))
}

fn build_table(fields: &[Field], rows: &[ResultRow]) -> Table {
    Table {
        headers: fields.iter().map(|f| f.header().to_string()).collect(),
        rows: rows
            .iter()
            .map(|row| fields.iter().map(|f| f.cell(row)).collect())
            .collect(),
    }
}

fn build_chart(kind: ChartKind, columns: &[Column], summary: &Aggregation) -> Chart {
    let bars = summary
        .rows
        .iter()
        .map(|row| {
            let values: Vec<f64> = columns
                .iter()
                .map(|c| summary.mean(row, *c).unwrap_or(0.0))
                .collect();
            let total_label = match kind {
                ChartKind::Stacked => Some(crate::aggregate::calculate_mean(&values)),
                ChartKind::Grouped => None,
            };
            Bar {
                label: row.label(),
                values,
                total_label,
            }
        })
        .collect();

    Chart {
        kind,
        series: columns.iter().map(|c| c.label().to_string()).collect(),
        bars,
    }
}

/// List evaluation experiments
pub async fn list_experiments(
    store: &dyn ExperimentStore,
    prefix: &str,
) -> Result<Vec<Experiment>> {
    store
        .search_experiments(prefix)
        .await
        .context("Failed to list experiments")
}
