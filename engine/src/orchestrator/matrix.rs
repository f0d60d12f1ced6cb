//! Run matrix computation
//!
//! A chain run fans out to one cell per (runnable model, dataset row).
//! Prompts are prepared once per run; only dataset links are rendered per
//! row.

use crate::db::{ModelSelection, PromptFragment};
use crate::template::{self, DatasetIndex, PreparedPrompt};
use std::collections::HashMap;

/// Prepared prompts plus the models and rows they fan out over
#[derive(Debug, Clone)]
pub struct RunMatrix {
    prompts: Vec<PreparedPrompt>,
    models: Vec<ModelSelection>,
    rows: usize,
}

impl RunMatrix {
    /// Filter enabled fragments, expand templates and size the matrix
    pub fn build(
        fragments: &[PromptFragment],
        models: &[ModelSelection],
        variables: &HashMap<String, String>,
        datasets: &DatasetIndex,
    ) -> Self {
        let prompts: Vec<PreparedPrompt> = fragments
            .iter()
            .filter(|f| f.enabled)
            .map(|f| template::prepare(&f.content, variables, datasets))
            .collect();

        let rows = datasets.max_rows(&prompts);
        let models = models.iter().filter(|m| m.is_runnable()).cloned().collect();

        Self {
            prompts,
            models,
            rows,
        }
    }

    /// Number of cells: runnable models × rows
    pub fn len(&self) -> usize {
        self.models.len() * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn models(&self) -> &[ModelSelection] {
        &self.models
    }

    /// Every cell, model-major
    pub fn cells(&self) -> impl Iterator<Item = (&ModelSelection, usize)> {
        self.models
            .iter()
            .flat_map(move |model| (0..self.rows).map(move |row| (model, row)))
    }

    /// Rendered prompt list for one row
    pub fn prompts_for_row(&self, row: usize, datasets: &DatasetIndex) -> Vec<String> {
        template::render_all(&self.prompts, row, datasets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Dataset;

    fn dataset(name: &str, rows: usize) -> Dataset {
        let mut ds = Dataset::new(format!("id-{}", name), name, vec!["v".into()]);
        for i in 0..rows {
            ds.push_row([format!("{}{}", name, i)]);
        }
        ds
    }

    #[test]
    fn test_matrix_uses_longest_referenced_dataset() {
        let index = DatasetIndex::new(vec![dataset("A", 2), dataset("B", 5), dataset("C", 9)]);
        let fragments = vec![
            PromptFragment::new("[[A.v]] and [[B.v]]"),
            // C is only referenced by a disabled fragment
            PromptFragment::disabled("[[C.v]]"),
        ];
        let models = vec![
            ModelSelection::new("x", "m1"),
            ModelSelection::new("x", ""),
            ModelSelection::new("y", "m2"),
        ];

        let matrix = RunMatrix::build(&fragments, &models, &HashMap::new(), &index);
        assert_eq!(matrix.rows(), 5);
        assert_eq!(matrix.len(), 10);
        assert_eq!(matrix.cells().count(), 10);
        assert_eq!(matrix.prompts_for_row(3, &index), vec!["A0 and B3"]);
    }

    #[test]
    fn test_matrix_without_datasets_has_one_row() {
        let matrix = RunMatrix::build(
            &[PromptFragment::new("hello")],
            &[ModelSelection::new("x", "m1")],
            &HashMap::new(),
            &DatasetIndex::default(),
        );
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix.prompts_for_row(0, &DatasetIndex::default()), vec!["hello"]);
    }

    #[test]
    fn test_matrix_without_models_is_empty() {
        let matrix = RunMatrix::build(
            &[PromptFragment::new("hello")],
            &[ModelSelection::new("x", "  ")],
            &HashMap::new(),
            &DatasetIndex::default(),
        );
        assert!(matrix.is_empty());
    }
}
