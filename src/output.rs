use crate::aggregate::Aggregation;
use crate::models::{BatchSummary, Experiment};
use crate::report::{Cell, Chart, ChartKind, Report, ReportOutcome, Table};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

const BAR_WIDTH: f64 = 40.0;
const MAX_CELL_WIDTH: usize = 48;
const STACK_GLYPHS: [char; 5] = ['█', '▓', '▒', '░', '#'];

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print a report, or the warning explaining why there is none
pub fn print_report(outcome: &ReportOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", Plain(outcome)),
        OutputFormat::Json => print_json(outcome),
    }
}

pub fn print_experiments(experiments: &[Experiment], format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", Plain(experiments)),
        OutputFormat::Json => print_json(experiments),
    }
}

pub fn print_batch_summary(summary: &BatchSummary, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", Plain(summary)),
        OutputFormat::Json => print_json(summary),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match render_json(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

fn render_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

/// Plain-text rendering of a report, table, chart or listing
struct Plain<'a, T: ?Sized>(&'a T);

impl fmt::Display for Plain<'_, ReportOutcome> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ReportOutcome::Empty(reason) => writeln!(f, "⚠ {}", reason),
            ReportOutcome::Ready(report) => write!(f, "{}", Plain(report)),
        }
    }
}

impl fmt::Display for Plain<'_, Report> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        writeln!(f, "=== {} ===", report.title)?;
        writeln!(f, "Experiments: {}", report.experiments.join(", "))?;
        writeln!(f)?;

        if let Some(headline) = &report.headline {
            writeln!(f, "📊 KEY METRICS")?;
            writeln!(f, "-------------")?;
            match headline.global_precision {
                Some(precision) => writeln!(f, "Global precision:   {:.1}%", precision)?,
                None => writeln!(f, "Global precision:   n/a (no scored runs)")?,
            }
            writeln!(f, "Answers evaluated:  {}", headline.evaluated)?;
            writeln!(f)?;
        }

        if let Some(table) = &report.table {
            writeln!(f, "📋 RESULTS PER QUESTION")?;
            writeln!(f, "-----------------------")?;
            writeln!(f, "{}", Plain(table))?;
        }

        if let Some(summary) = &report.summary {
            writeln!(f, "📈 GROUPED SUMMARY")?;
            writeln!(f, "------------------")?;
            writeln!(f, "{}", Plain(summary))?;
        }

        if let Some(chart) = &report.chart {
            writeln!(f, "📊 CHART")?;
            writeln!(f, "--------")?;
            writeln!(f, "{}", Plain(chart))?;
        }

        if !report.evidence.is_empty() {
            writeln!(f, "📌 EVIDENCE")?;
            for path in &report.evidence {
                writeln!(f, "  {}", path.display())?;
            }
            writeln!(f)?;
        }

        for warning in &report.warnings {
            writeln!(f, "⚠ {}", warning)?;
        }
        Ok(())
    }
}

fn format_cell(cell: &Cell) -> String {
    match cell {
        Cell::Text(Some(text)) => truncate(text, MAX_CELL_WIDTH),
        Cell::Text(None) => "-".to_string(),
        Cell::Integer(n) => n.to_string(),
        Cell::Number(x) => format!("{:.3}", x),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let kept: String = text.chars().take(width.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

/// Left-aligned columns sized to their widest cell
struct Grid<'a> {
    headers: &'a [String],
    rows: &'a [Vec<String>],
}

impl Grid<'_> {
    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        widths
    }
}

fn grid_line(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

impl fmt::Display for Grid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self.widths();
        writeln!(f, "{}", grid_line(self.headers, &widths))?;
        let total: usize = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        writeln!(f, "{}", "-".repeat(total))?;
        for row in self.rows {
            writeln!(f, "{}", grid_line(row, &widths))?;
        }
        Ok(())
    }
}

impl fmt::Display for Plain<'_, Table> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<Vec<String>> = self
            .0
            .rows
            .iter()
            .map(|row| row.iter().map(format_cell).collect())
            .collect();
        write!(f, "{}", Grid { headers: &self.0.headers, rows: &rows })
    }
}

impl fmt::Display for Plain<'_, Aggregation> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.0;
        let headers: Vec<String> = summary
            .key
            .headers()
            .iter()
            .map(|h| h.to_string())
            .chain(summary.columns.iter().map(|c| format!("avg {}", c.label())))
            .chain(std::iter::once("count".to_string()))
            .collect();

        let rows: Vec<Vec<String>> = summary
            .rows
            .iter()
            .map(|row| {
                row.key
                    .iter()
                    .map(|k| truncate(&k.to_string(), MAX_CELL_WIDTH))
                    .chain(row.means.iter().map(|m| format!("{:.3}", m)))
                    .chain(std::iter::once(row.count.to_string()))
                    .collect()
            })
            .collect();

        write!(f, "{}", Grid { headers: &headers, rows: &rows })
    }
}

fn bar_length(value: f64, max: f64) -> usize {
    if max <= 0.0 || value <= 0.0 {
        0
    } else {
        (value / max * BAR_WIDTH).round() as usize
    }
}

impl fmt::Display for Plain<'_, Chart> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chart = self.0;
        if chart.bars.is_empty() {
            return writeln!(f, "No data to chart.");
        }

        match chart.kind {
            ChartKind::Grouped => {
                let max = chart
                    .bars
                    .iter()
                    .flat_map(|b| b.values.iter().copied())
                    .fold(0.0_f64, f64::max);
                let series_width = chart.series.iter().map(|s| s.len()).max().unwrap_or(0);

                for bar in &chart.bars {
                    writeln!(f, "{}", truncate(&bar.label, MAX_CELL_WIDTH))?;
                    for (series, value) in chart.series.iter().zip(&bar.values) {
                        writeln!(
                            f,
                            "  {:<width$} {} {:.3}",
                            series,
                            "█".repeat(bar_length(*value, max)),
                            value,
                            width = series_width
                        )?;
                    }
                }
            }
            ChartKind::Stacked => {
                let legend: Vec<String> = chart
                    .series
                    .iter()
                    .zip(STACK_GLYPHS.iter().cycle())
                    .map(|(series, glyph)| format!("{glyph} {series}"))
                    .collect();
                writeln!(f, "Legend: {}", legend.join("  "))?;

                let max = chart
                    .bars
                    .iter()
                    .map(|b| b.values.iter().sum::<f64>())
                    .fold(0.0_f64, f64::max);
                let label_width = chart
                    .bars
                    .iter()
                    .map(|b| truncate(&b.label, MAX_CELL_WIDTH).chars().count())
                    .max()
                    .unwrap_or(0);

                for bar in &chart.bars {
                    let segments: String = bar
                        .values
                        .iter()
                        .zip(STACK_GLYPHS.iter().cycle())
                        .map(|(value, glyph)| glyph.to_string().repeat(bar_length(*value, max)))
                        .collect();
                    let total = bar
                        .total_label
                        .map(|t| format!(" {:.2}", t))
                        .unwrap_or_default();
                    writeln!(
                        f,
                        "{:<width$} {}{}",
                        truncate(&bar.label, MAX_CELL_WIDTH),
                        segments,
                        total,
                        width = label_width
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Plain<'_, [Experiment]> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "⚠ No evaluation experiments found.");
        }
        let headers = ["id", "name", "kind"].map(String::from);
        let rows: Vec<Vec<String>> = self
            .0
            .iter()
            .map(|e| vec![e.id.clone(), e.name.clone(), e.kind.as_tag().to_string()])
            .collect();
        write!(f, "{}", Grid { headers: &headers, rows: &rows })
    }
}

impl fmt::Display for Plain<'_, BatchSummary> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.0;
        writeln!(f, "📊 Experiment: {} ({})", summary.experiment, summary.experiment_id)?;
        writeln!(f, "Evaluated {} question(s)", summary.items.len())?;
        writeln!(f)?;

        for (i, item) in summary.items.iter().enumerate() {
            writeln!(f, "Question {}/{}: {}", i + 1, summary.items.len(), item.question)?;
            writeln!(f, "Generated answer: {}", item.generated)?;
            let mut metrics: Vec<_> = item.metrics.iter().collect();
            metrics.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in metrics {
                writeln!(f, "  • {}: {}", key, value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
