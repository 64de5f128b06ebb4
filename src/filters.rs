use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, COL_PORTE, COL_SIMPLES, COL_SITUACAO};

/// Multiselect state for the three categorical filters. An empty selection
/// leaves its column unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSelection {
    pub situacao: Vec<String>,
    pub porte: Vec<String>,
    pub simples: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterOptions {
    pub column: String,
    pub values: Vec<String>,
}

impl FilterSelection {
    pub fn is_empty(&self) -> bool {
        self.situacao.is_empty() && self.porte.is_empty() && self.simples.is_empty()
    }

    fn constraints(&self) -> [(&'static str, &[String]); 3] {
        [
            (COL_SITUACAO, self.situacao.as_slice()),
            (COL_PORTE, self.porte.as_slice()),
            (COL_SIMPLES, self.simples.as_slice()),
        ]
    }

    pub fn matches(&self, dataset: &Dataset, row: usize) -> bool {
        self.constraints().iter().all(|(column, selected)| {
            if selected.is_empty() {
                return true;
            }
            let value = dataset.value(row, column).unwrap_or_default();
            selected.iter().any(|choice| choice.trim() == value)
        })
    }

    pub fn apply<'a>(&self, dataset: &'a Dataset) -> FilteredView<'a> {
        let rows = (0..dataset.len())
            .filter(|row| self.matches(dataset, *row))
            .collect();
        FilteredView { dataset, rows }
    }
}

pub fn distinct_values(dataset: &Dataset, column: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for row in 0..dataset.len() {
        if let Some(value) = dataset.value(row, column) {
            if !values.iter().any(|seen| seen == value) {
                values.push(value.to_string());
            }
        }
    }
    values
}

pub fn filter_options(dataset: &Dataset) -> Vec<FilterOptions> {
    [COL_SITUACAO, COL_PORTE, COL_SIMPLES]
        .into_iter()
        .map(|column| FilterOptions {
            column: column.to_string(),
            values: distinct_values(dataset, column),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FilteredView<'a> {
    dataset: &'a Dataset,
    rows: Vec<usize>,
}

impl<'a> FilteredView<'a> {
    pub fn all(dataset: &'a Dataset) -> Self {
        Self {
            dataset,
            rows: (0..dataset.len()).collect(),
        }
    }

    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn values<'b>(&'b self, column: &'b str) -> impl Iterator<Item = Option<&'a str>> + 'b {
        let dataset = self.dataset;
        self.rows.iter().map(move |row| dataset.value(*row, column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        let csv = "Situacao Cadastral,Porte da Empresa,Optante Simples
ATIVA,ME,Sim
BAIXADA,ME,Nao
ATIVA,EPP,Nao
ATIVA,ME,Sim
INAPTA,,Sim
";
        Dataset::from_csv_bytes(csv.as_bytes()).unwrap()
    }

    #[test]
    fn empty_selection_keeps_everything() {
        let dataset = sample();
        let view = FilterSelection::default().apply(&dataset);
        assert_eq!(view.rows(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn predicates_compose_conjunctively() {
        let dataset = sample();
        let selection = FilterSelection {
            situacao: vec!["ATIVA".into()],
            porte: vec!["ME".into()],
            simples: vec![],
        };
        assert_eq!(selection.apply(&dataset).rows(), &[0, 3]);

        let selection = FilterSelection {
            situacao: vec!["ATIVA".into(), "INAPTA".into()],
            porte: vec![],
            simples: vec!["Sim".into()],
        };
        assert_eq!(selection.apply(&dataset).rows(), &[0, 3, 4]);
    }

    #[test]
    fn selection_excludes_rows_with_empty_value() {
        let dataset = sample();
        let selection = FilterSelection {
            porte: vec!["ME".into(), "EPP".into()],
            ..Default::default()
        };
        assert_eq!(selection.apply(&dataset).len(), 4);
    }

    #[test]
    fn lists_distinct_values_in_first_seen_order() {
        let dataset = sample();
        assert_eq!(
            distinct_values(&dataset, COL_SITUACAO),
            vec!["ATIVA", "BAIXADA", "INAPTA"]
        );
        assert_eq!(distinct_values(&dataset, COL_PORTE), vec!["ME", "EPP"]);
        let options = filter_options(&dataset);
        assert_eq!(options.len(), 3);
        assert_eq!(options[2].values, vec!["Sim", "Nao"]);
    }
}
