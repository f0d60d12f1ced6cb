//! Prompt template expansion
//!
//! Two kinds of placeholders appear in prompt fragments:
//!
//! - `{{name}}` is replaced by the variable's current value. Names with no
//!   binding are left untouched so the text reaches the model as written.
//! - `[[Dataset.Column]]` is a link to a dataset column. Expansion happens in
//!   two phases: [`prepare`] resolves the dataset name to its id once per run
//!   (row-independent), and [`PreparedPrompt::render`] fills in a row's value
//!   for each run-matrix cell.
//!
//! # Examples
//!
//! ```
//! use loom_engine::db::Dataset;
//! use loom_engine::template::{prepare, DatasetIndex};
//! use std::collections::HashMap;
//!
//! let mut cities = Dataset::new("ds-1", "Cities", vec!["name".into()]);
//! cities.push_row(["Paris"]);
//! cities.push_row(["Lima"]);
//!
//! let vars = HashMap::from([("verb".to_string(), "Describe".to_string())]);
//! let index = DatasetIndex::new(vec![cities]);
//!
//! let prompt = prepare("{{verb}} [[Cities.name]]", &vars, &index);
//! assert_eq!(index.max_rows(std::slice::from_ref(&prompt)), 2);
//! assert_eq!(prompt.render(1, &index), "Describe Lima");
//! ```

use crate::db::Dataset;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

static VARIABLE_PATTERN: OnceLock<Regex> = OnceLock::new();
static LINK_PATTERN: OnceLock<Regex> = OnceLock::new();

fn variable_pattern() -> &'static Regex {
    VARIABLE_PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-.]+)\s*\}\}").expect("Invalid variable pattern")
    })
}

fn link_pattern() -> &'static Regex {
    LINK_PATTERN.get_or_init(|| {
        Regex::new(r"\[\[\s*([^\[\]\.]+?)\s*\.\s*([^\[\]]+?)\s*\]\]").expect("Invalid link pattern")
    })
}

/// Names of every `{{variable}}` referenced in `text`, in order
pub fn extract_variables(text: &str) -> Vec<String> {
    variable_pattern()
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Replace `{{name}}` placeholders with bound values
pub fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(text, |cap: &Captures| match variables.get(&cap[1]) {
            Some(value) => value.clone(),
            None => cap[0].to_string(),
        })
        .into_owned()
}

/// A dataset column reference resolved to a dataset id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLink {
    pub dataset_id: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Link(DatasetLink),
}

/// Datasets available to a run, looked up by name or id
#[derive(Debug, Clone, Default)]
pub struct DatasetIndex {
    by_id: HashMap<String, Dataset>,
    id_by_name: HashMap<String, String>,
}

impl DatasetIndex {
    pub fn new(datasets: impl IntoIterator<Item = Dataset>) -> Self {
        let mut index = Self::default();
        for dataset in datasets {
            index.id_by_name.insert(dataset.name.clone(), dataset.id.clone());
            index.by_id.insert(dataset.id.clone(), dataset);
        }
        index
    }

    pub fn get(&self, id: &str) -> Option<&Dataset> {
        self.by_id.get(id)
    }

    /// Resolve a link's dataset part, by name first and then by id
    fn resolve(&self, reference: &str) -> Option<&str> {
        self.id_by_name
            .get(reference)
            .map(String::as_str)
            .or_else(|| self.by_id.get(reference).map(|d| d.id.as_str()))
    }

    /// Rows a run over `prompts` fans out to: the longest referenced
    /// dataset's row count, and at least 1
    pub fn max_rows(&self, prompts: &[PreparedPrompt]) -> usize {
        prompts
            .iter()
            .flat_map(|p| p.dataset_ids())
            .filter_map(|id| self.get(id))
            .map(Dataset::row_count)
            .max()
            .unwrap_or(0)
            .max(1)
    }
}

/// Prompt text with variables substituted and dataset links resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    segments: Vec<Segment>,
}

impl PreparedPrompt {
    /// Prompt text with no placeholders left to resolve
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Text(text.into())],
        }
    }

    /// Ids of datasets this prompt reads from
    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Link(link) => Some(link.dataset_id.as_str()),
            Segment::Text(_) => None,
        })
    }

    pub fn links(&self) -> impl Iterator<Item = &DatasetLink> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Link(link) => Some(link),
            Segment::Text(_) => None,
        })
    }

    /// Render the prompt for one dataset row
    ///
    /// Row and column fallbacks follow [`Dataset::cell`]. A link whose
    /// dataset has no data renders as an empty string.
    pub fn render(&self, row: usize, datasets: &DatasetIndex) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Link(link) => {
                    if let Some(value) = datasets
                        .get(&link.dataset_id)
                        .and_then(|d| d.cell(row, &link.column))
                    {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

/// Substitute variables in `text` and resolve its dataset links
///
/// A link naming an unknown dataset is kept as literal text and does not
/// contribute to the run matrix.
pub fn prepare(
    text: &str,
    variables: &HashMap<String, String>,
    datasets: &DatasetIndex,
) -> PreparedPrompt {
    let text = substitute_variables(text, variables);
    let mut segments = Vec::new();
    let mut last = 0;

    for cap in link_pattern().captures_iter(&text) {
        let Some(whole) = cap.get(0) else { continue };
        let reference = &cap[1];

        let Some(dataset_id) = datasets.resolve(reference) else {
            warn!("Prompt references unknown dataset '{}'", reference);
            continue;
        };

        if whole.start() > last {
            segments.push(Segment::Text(text[last..whole.start()].to_string()));
        }
        segments.push(Segment::Link(DatasetLink {
            dataset_id: dataset_id.to_string(),
            column: cap[2].to_string(),
        }));
        last = whole.end();
    }

    if last < text.len() {
        segments.push(Segment::Text(text[last..].to_string()));
    }

    PreparedPrompt { segments }
}

/// Render a full prompt list for one row
pub fn render_all(prompts: &[PreparedPrompt], row: usize, datasets: &DatasetIndex) -> Vec<String> {
    prompts.iter().map(|p| p.render(row, datasets)).collect()
}
