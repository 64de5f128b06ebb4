use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use html_escape::{encode_script, encode_text};
use tracing::info;

use crate::errors::AppResult;
use crate::filters::{FilterSelection, FilteredView};
use crate::reconcile::{GeocodeRun, MapMarker, NOT_ATTEMPTED};
use crate::summary::{ChartKind, ChartSeries, DashboardSummary};

pub const REPORT_HTML: &str = "report.html";
pub const MAP_HTML: &str = "map.html";

const REPORT_TEMPLATE: &str = include_str!("templates/report.html");
const MAP_TEMPLATE: &str = include_str!("templates/map.html");

const BAR_WIDTH: f64 = 320.0;
const BAR_HEIGHT: usize = 18;
const PALETTE: &[&str] = &["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b"];

pub struct ReportInput<'a> {
    pub title: &'a str,
    pub filters: &'a FilterSelection,
    pub summary: &'a DashboardSummary,
    pub view: &'a FilteredView<'a>,
    pub geocoding: Option<&'a GeocodeRun>,
}

pub fn write_report(input: &ReportInput<'_>, path: &Path) -> AppResult<PathBuf> {
    fs::write(path, render_report(input))?;
    info!(target: "report", path = %path.display(), "wrote report document");
    Ok(path.to_path_buf())
}

pub fn render_report(input: &ReportInput<'_>) -> String {
    let generated_at = Utc::now().format("%Y-%m-%d %H:%M UTC").to_string();
    let charts: String = input.summary.charts.iter().map(render_chart).collect();
    let geocoding = input.geocoding.map(render_geocoding).unwrap_or_default();

    fill_template(
        REPORT_TEMPLATE,
        &[
            ("TITLE", encode_text(input.title).into_owned()),
            ("GENERATED_AT", generated_at),
            ("FILTERS", render_filters(input.filters)),
            ("INDICATORS", render_indicators(input.summary)),
            ("CHARTS", charts),
            ("GEOCODING", geocoding),
            ("TABLE", render_table(input.view)),
        ],
    )
}

/// Substitutes `{{{KEY}}}` placeholders in one pass, so inserted text is
/// never scanned for further placeholders.
fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match values.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + 3 + end + 3]),
        }
        rest = &after[end + 3..];
    }
    out.push_str(rest);
    out
}

fn render_filters(filters: &FilterSelection) -> String {
    if filters.is_empty() {
        return "<p>Nenhum filtro aplicado.</p>".to_string();
    }
    let mut html = String::from("<ul>\n");
    for (label, values) in [
        ("Situação Cadastral", &filters.situacao),
        ("Porte da Empresa", &filters.porte),
        ("Optante Simples", &filters.simples),
    ] {
        let shown = if values.is_empty() {
            "todos".to_string()
        } else {
            values
                .iter()
                .map(|v| encode_text(v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(html, "<li>{label}: {shown}</li>");
    }
    html.push_str("</ul>");
    html
}

fn render_indicators(summary: &DashboardSummary) -> String {
    let indicators = &summary.indicators;
    let mut html = String::new();
    for (label, value) in [
        ("Total de Empresas", indicators.total),
        ("Ativas", indicators.active),
        ("Com Simples", indicators.simples),
    ] {
        let _ = writeln!(html, "<div class=\"kpi\">{label}<b>{value}</b></div>");
    }
    html
}

fn render_chart(chart: &ChartSeries) -> String {
    let mut svg = String::new();
    let caption = match chart.kind {
        ChartKind::Pie => "participação",
        ChartKind::Bar => "contagem",
    };
    let _ = writeln!(svg, "<h3>{} ({caption})</h3>", encode_text(&chart.title));
    if chart.categories.is_empty() {
        svg.push_str("<p>Sem dados.</p>\n");
        return svg;
    }

    let max = chart
        .categories
        .iter()
        .map(|c| c.count)
        .max()
        .unwrap_or(1)
        .max(1) as f64;
    let height = chart.categories.len() * (BAR_HEIGHT + 4);
    let _ = writeln!(
        svg,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"640\" height=\"{height}\">"
    );
    for (position, category) in chart.categories.iter().enumerate() {
        let y = position * (BAR_HEIGHT + 4);
        let ratio = match chart.kind {
            ChartKind::Pie => category.share,
            ChartKind::Bar => category.count as f64 / max,
        };
        let width = (ratio * BAR_WIDTH).max(1.0);
        let color = PALETTE[position % PALETTE.len()];
        let _ = writeln!(
            svg,
            "<text x=\"0\" y=\"{}\" font-size=\"12\">{}</text>\
             <rect x=\"160\" y=\"{y}\" width=\"{width:.1}\" height=\"{BAR_HEIGHT}\" fill=\"{color}\"/>\
             <text x=\"{:.1}\" y=\"{}\" font-size=\"12\">{} ({:.1}%)</text>",
            y + BAR_HEIGHT - 4,
            encode_text(&category.label),
            166.0 + width,
            y + BAR_HEIGHT - 4,
            category.count,
            category.share * 100.0
        );
    }
    svg.push_str("</svg>\n");
    svg
}

fn render_geocoding(run: &GeocodeRun) -> String {
    let mut html = String::from(
        "<h2>Geocodificação</h2>\n<table>\n<tr><th>Status</th><th>Linhas</th></tr>\n",
    );
    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &run.rows {
        let label = entry
            .result
            .as_ref()
            .map(|r| r.status().as_str())
            .unwrap_or(NOT_ATTEMPTED);
        *by_status.entry(label).or_default() += 1;
    }
    for (status, count) in by_status {
        let _ = writeln!(html, "<tr><td>{status}</td><td>{count}</td></tr>");
    }
    html.push_str("</table>\n");

    let unresolved = run.unresolved();
    if !unresolved.is_empty() {
        html.push_str(
            "<h3>Endereços não localizados</h3>\n<table>\n\
             <tr><th>Linha</th><th>Endereço</th><th>Status</th><th>Detalhe</th></tr>\n",
        );
        for entry in unresolved {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                entry.row + 1,
                encode_text(&entry.address),
                entry.status,
                encode_text(entry.detail.as_deref().unwrap_or_default())
            );
        }
        html.push_str("</table>\n");
    }
    html
}

fn render_table(view: &FilteredView<'_>) -> String {
    let dataset = view.dataset();
    let mut html = String::from("<table>\n<tr>");
    for column in dataset.columns() {
        let _ = write!(html, "<th>{}</th>", encode_text(column));
    }
    html.push_str("</tr>\n");
    for row in view.rows() {
        html.push_str("<tr>");
        for cell in dataset.row(*row).unwrap_or_default() {
            let _ = write!(html, "<td>{}</td>", encode_text(cell));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</table>");
    html
}

pub fn write_map(markers: &[MapMarker], title: &str, path: &Path) -> AppResult<PathBuf> {
    fs::write(path, render_map(markers, title)?)?;
    info!(target: "report", path = %path.display(), markers = markers.len(), "wrote marker map");
    Ok(path.to_path_buf())
}

pub fn render_map(markers: &[MapMarker], title: &str) -> AppResult<String> {
    let payload = serde_json::to_string(markers)?;
    Ok(fill_template(
        MAP_TEMPLATE,
        &[
            ("TITLE", encode_text(title).into_owned()),
            ("MARKERS_JSON", encode_script(&payload).into_owned()),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::geocoding::GeocodeStatus;
    use crate::summary::summarize;

    const DATASET: &str = "Razao Social,Situacao Cadastral,Porte da Empresa,Optante Simples
<Padaria & Cia>,ATIVA,ME,Sim
Oficina {{{TABLE}}},BAIXADA,EPP,Nao
";

    #[test]
    fn renders_indicators_charts_and_escaped_rows() {
        let dataset = Dataset::from_csv_bytes(DATASET.as_bytes()).unwrap();
        let view = FilteredView::all(&dataset);
        let summary = summarize(&view);
        let filters = FilterSelection {
            situacao: vec!["ATIVA".into(), "BAIXADA".into()],
            ..Default::default()
        };
        let html = render_report(&ReportInput {
            title: "Empresas - Iguaba Grande",
            filters: &filters,
            summary: &summary,
            view: &view,
            geocoding: None,
        });

        assert!(html.contains("<h1>Empresas - Iguaba Grande</h1>"));
        assert!(html.contains("Situação Cadastral: ATIVA, BAIXADA"));
        assert!(html.contains("Porte da Empresa: todos"));
        assert!(html.contains("Total de Empresas<b>2</b>"));
        assert!(html.contains("Distribuição por Porte (participação)"));
        assert!(html.contains("&lt;Padaria &amp; Cia&gt;"));
        assert!(!html.contains("<Padaria"));
        assert!(!html.contains("Geocodificação"));
        assert!(html.contains("<td>Oficina {{{TABLE}}}</td>"));
        assert_eq!(html.matches("<h2>Tabela Detalhada</h2>").count(), 1);
    }

    #[test]
    fn empty_selection_is_reported_as_unfiltered() {
        let dataset = Dataset::from_csv_bytes(DATASET.as_bytes()).unwrap();
        let view = FilteredView::all(&dataset);
        let summary = summarize(&view);
        let html = render_report(&ReportInput {
            title: "Empresas",
            filters: &FilterSelection::default(),
            summary: &summary,
            view: &view,
            geocoding: None,
        });
        assert!(html.contains("Nenhum filtro aplicado."));
    }

    #[test]
    fn map_payload_cannot_close_the_script() {
        let markers = vec![MapMarker {
            row: 0,
            name: "</script><b>x".into(),
            address: "Rua A, 12".into(),
            latitude: -22.84,
            longitude: -42.1,
            status: GeocodeStatus::MatchedFull,
            status_label: GeocodeStatus::MatchedFull.description().into(),
            approximate: false,
        }];
        let html = render_map(&markers, "Mapa").unwrap();
        assert_eq!(html.matches("</script>").count(), 2);
        assert!(html.contains("\"latitude\":-22.84"));
        assert!(html.contains("\"status\":\"matched-full\""));
        assert!(!html.contains("{{{"));
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let filled = fill_template(
            "<p>{{{A}}} {{{B}}} {{{open",
            &[("A", "{{{B}}}".to_string())],
        );
        assert_eq!(filled, "<p>{{{B}}} {{{B}}} {{{open");
    }
}
