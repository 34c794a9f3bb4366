use jetload_core::WriteMode;
use jetload_sync::{parse_mapping_table, validate_mapping, PipelineConfig};

fn shipped_pipeline() -> PipelineConfig {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let text = std::fs::read_to_string(root.join("jetload.yaml")).expect("jetload.yaml at workspace root");
    serde_yaml::from_str(&text).expect("jetload.yaml parses")
}

#[test]
fn shipped_pipeline_has_three_sources_and_five_loads() {
    let pipeline = shipped_pipeline();
    let ids: Vec<&str> = pipeline.sources.iter().map(|s| s.source_id.as_str()).collect();
    assert_eq!(ids, vec!["blackberry", "good", "athoc"]);
    assert_eq!(pipeline.sources.iter().map(|s| s.loads.len()).sum::<usize>(), 5);

    let marketing: Vec<WriteMode> = pipeline.sources[0]
        .loads
        .iter()
        .filter(|load| load.table == "IS_MARKETING")
        .map(|load| load.write_mode)
        .collect();
    assert_eq!(marketing, vec![WriteMode::Replace, WriteMode::Append]);
}

#[test]
fn every_shipped_mapping_covers_the_history_table() {
    let pipeline = shipped_pipeline();
    let canonical = pipeline.history.columns.names();
    assert_eq!(canonical.len(), 36);
    for source in &pipeline.sources {
        for union in &source.union {
            let mapping = parse_mapping_table(&union.mapping, ',');
            validate_mapping(&mapping, &canonical)
                .unwrap_or_else(|err| panic!("{}: {err}", union.source_table));
        }
    }
}
