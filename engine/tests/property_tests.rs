use loom_engine::config::Config;
use loom_engine::db::{content_hash, Dataset, ModelSelection, PromptFragment};
use loom_engine::orchestrator::RunMatrix;
use loom_engine::template::{substitute_variables, DatasetIndex};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::Path;

// Configuration survives a TOML round-trip
proptest! {
    #[test]
    fn test_config_parsing_round_trip(
        log_level in "error|warn|info|debug|trace",
        max_calls in proptest::option::of(1..64usize),
        separator in "[a-z\\-\\n ]{1,8}",
        timeout in 1..600u64,
    ) {
        let mut config = Config::rooted_at(Path::new("/tmp/loom"));
        config.core.log_level = log_level.clone();
        config.orchestrator.max_concurrent_calls = max_calls;
        config.orchestrator.workflow_context_separator = separator.clone();
        config.connectors.download_timeout_secs = timeout;

        let serialized = toml::to_string(&config).expect("Failed to serialize config");
        let parsed: Config = toml::from_str(&serialized).expect("Failed to parse config");

        prop_assert_eq!(parsed.core.log_level, log_level);
        prop_assert_eq!(parsed.core.data_dir, config.core.data_dir);
        prop_assert_eq!(parsed.connectors.dir, config.connectors.dir);
        prop_assert_eq!(parsed.connectors.download_timeout_secs, timeout);
        prop_assert_eq!(parsed.orchestrator.max_concurrent_calls, max_calls);
        prop_assert_eq!(parsed.orchestrator.workflow_context_separator, separator);
    }
}

// Unbound variables reach the model as written
proptest! {
    #[test]
    fn test_unbound_variables_are_untouched(
        prefix in "[a-zA-Z ,.]{0,20}",
        name in "[a-z][a-z0-9_]{0,10}",
        suffix in "[a-zA-Z ,.]{0,20}",
    ) {
        let text = format!("{}{{{{{}}}}}{}", prefix, name, suffix);
        prop_assert_eq!(substitute_variables(&text, &HashMap::new()), text);
    }

    #[test]
    fn test_bound_variables_are_replaced(
        name in "[a-z][a-z0-9_]{0,10}",
        value in "[a-zA-Z0-9 ]{0,20}",
    ) {
        let vars = HashMap::from([(name.clone(), value.clone())]);
        let text = format!("<{{{{{}}}}}>", name);
        prop_assert_eq!(substitute_variables(&text, &vars), format!("<{}>", value));
    }
}

// The matrix has one cell per runnable model and row
proptest! {
    #[test]
    fn test_matrix_size(
        runnable in 0..5usize,
        blank in 0..3usize,
        row_counts in proptest::collection::vec(0..6usize, 0..4),
    ) {
        let mut models: Vec<ModelSelection> = (0..runnable)
            .map(|i| ModelSelection::new("c", format!("m{}", i)))
            .collect();
        models.extend((0..blank).map(|_| ModelSelection::new("c", "")));

        let mut datasets = Vec::new();
        let mut fragments = Vec::new();
        for (i, rows) in row_counts.iter().enumerate() {
            let mut ds = Dataset::new(format!("id-{}", i), format!("D{}", i), vec!["v".into()]);
            for r in 0..*rows {
                ds.push_row([r.to_string()]);
            }
            datasets.push(ds);
            fragments.push(PromptFragment::new(format!("[[D{}.v]]", i)));
        }

        let index = DatasetIndex::new(datasets);
        let matrix = RunMatrix::build(&fragments, &models, &HashMap::new(), &index);

        let rows = row_counts.iter().copied().max().unwrap_or(0).max(1);
        prop_assert_eq!(matrix.rows(), rows);
        prop_assert_eq!(matrix.len(), runnable * rows);
        prop_assert_eq!(matrix.cells().count(), matrix.len());
    }
}

proptest! {
    #[test]
    fn test_content_hash_is_stable_hex(content in ".{0,200}") {
        let hash = content_hash(&content);
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(hash, content_hash(&content));
    }
}
