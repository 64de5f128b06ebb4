use std::collections::HashMap;

use serde::Serialize;

use crate::dataset::{COL_PORTE, COL_SIMPLES, COL_SITUACAO};
use crate::filters::FilteredView;

const ACTIVE_STATUS: &str = "ATIVA";
const SIMPLES_OPT_IN: &str = "Sim";
const EMPTY_LABEL: &str = "(vazio)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Pie,
    Bar,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub label: String,
    pub count: usize,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSeries {
    pub title: String,
    pub column: String,
    pub kind: ChartKind,
    pub categories: Vec<CategoryCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryIndicators {
    pub total: usize,
    pub active: usize,
    pub simples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub indicators: SummaryIndicators,
    pub charts: Vec<ChartSeries>,
}

pub fn summarize(view: &FilteredView<'_>) -> DashboardSummary {
    let indicators = SummaryIndicators {
        total: view.len(),
        active: count_equal(view, COL_SITUACAO, ACTIVE_STATUS),
        simples: count_equal(view, COL_SIMPLES, SIMPLES_OPT_IN),
    };
    let charts = vec![
        ChartSeries {
            title: "Distribuição por Porte".into(),
            column: COL_PORTE.into(),
            kind: ChartKind::Pie,
            categories: distribution(view, COL_PORTE),
        },
        ChartSeries {
            title: "Empresas por Situação".into(),
            column: COL_SITUACAO.into(),
            kind: ChartKind::Bar,
            categories: distribution(view, COL_SITUACAO),
        },
    ];
    DashboardSummary { indicators, charts }
}

fn count_equal(view: &FilteredView<'_>, column: &str, expected: &str) -> usize {
    view.values(column)
        .filter(|value| value.is_some_and(|v| v.eq_ignore_ascii_case(expected)))
        .count()
}

pub fn distribution(view: &FilteredView<'_>, column: &str) -> Vec<CategoryCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in view.values(column) {
        *counts.entry(value.unwrap_or(EMPTY_LABEL)).or_default() += 1;
    }

    let total = view.len().max(1) as f64;
    let mut categories: Vec<CategoryCount> = counts
        .into_iter()
        .map(|(label, count)| CategoryCount {
            label: label.to_string(),
            count,
            share: count as f64 / total,
        })
        .collect();
    categories.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    categories
}
