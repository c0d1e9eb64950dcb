//! End-to-end scenarios over a temporary corpus: ingestion, idempotent
//! re-runs, archive paths, and the three search modes against the mock
//! provider and deterministic embedder

mod common;

use std::io::Write;
use std::sync::Arc;

use common::{DeterministicEmbedder, MockProvider, TruncatingProvider, EXTRACTION_RESPONSE};
use graphrag::chunking::Chunk;
use graphrag::config::AppConfig;
use graphrag::extractor::{ExtractionAccumulator, Extractor};
use graphrag::ingest::{IngestionPipeline, IngestionReport};
use graphrag::llm::LlmGateway;
use graphrag::local_search::LocalSearchEngine;
use graphrag::router::{OutputFormat, SearchOptions, SearchRouter};
use graphrag::{LlmProvider, SearchMode};

const DOC1: &str = "Alice works at Acme. Bob works at Acme.";

fn test_config(input: &std::path::Path, output: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.input_dir = input.to_string_lossy().to_string();
    config.output_dir = output.to_string_lossy().to_string();
    config.global_search.shuffle_data = false;
    config
}

fn pipeline_with(
    provider: Arc<dyn LlmProvider>,
    config: AppConfig,
) -> (IngestionPipeline, LlmGateway) {
    let gateway = LlmGateway::new(provider, config.max_continuation_attempts);
    let pipeline = IngestionPipeline::new(config, gateway.clone(), Arc::new(DeterministicEmbedder));
    (pipeline, gateway)
}

#[tokio::test]
async fn test_ingest_extracts_graph_and_rerun_is_noop() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("doc1.txt"), DOC1).unwrap();

    let provider = Arc::new(MockProvider::new());
    let (pipeline, _) = pipeline_with(provider.clone(), test_config(input.path(), output.path()));

    let report = pipeline.add_documents().await.unwrap();
    assert_eq!(report.new_documents, 1);
    assert_eq!(report.entities, 3);
    assert_eq!(report.relationships, 2);
    assert!(report.communities >= 1);
    assert!(report.summaries >= 1);

    let store = pipeline.store();
    let entities = store.load_entities().unwrap();
    let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"Alice"));
    assert!(names.contains(&"Bob"));
    assert!(names.contains(&"Acme"));
    let acme = entities.iter().find(|e| e.name == "Acme").unwrap();
    assert_eq!(acme.entity_type, "Organization");

    let relationships = store.load_relationships().unwrap();
    assert!(relationships
        .iter()
        .any(|r| r.source == "Alice" && r.target == "Acme" && r.rel_type == "works_for"));
    assert!(relationships
        .iter()
        .any(|r| r.source == "Bob" && r.target == "Acme" && r.rel_type == "works_for"));

    // Every persisted level partitions the clustered node set
    let communities = store.load_communities().unwrap();
    assert!(!communities.is_empty());
    let mut by_level: std::collections::BTreeMap<i64, Vec<&Vec<String>>> = Default::default();
    for community in &communities {
        by_level.entry(community.level).or_default().push(&community.nodes);
    }
    for (_, groups) in by_level {
        let mut seen = std::collections::BTreeSet::new();
        for group in groups {
            for node in group {
                assert!(seen.insert(node.clone()), "node {node} appears twice in a level");
            }
        }
        assert_eq!(seen.len(), 3);
    }

    // Second run: identical tables, zero LLM calls, zero new rows
    let calls_after_first = provider.call_count();
    assert!(calls_after_first > 0);

    let rerun = pipeline.add_documents().await.unwrap();
    assert_eq!(rerun, IngestionReport::default());
    assert_eq!(provider.call_count(), calls_after_first);
    assert_eq!(store.load_entities().unwrap(), entities);
    assert_eq!(store.load_relationships().unwrap(), relationships);
}

#[tokio::test]
async fn test_archive_members_are_tracked_by_virtual_path() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let zip_path = input.path().join("a.zip");
    let mut writer = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
    writer
        .start_file("inner/doc.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(DOC1.as_bytes()).unwrap();
    writer.finish().unwrap();

    let provider = Arc::new(MockProvider::new());
    let (pipeline, _) = pipeline_with(provider, test_config(input.path(), output.path()));
    let report = pipeline.add_documents().await.unwrap();
    assert_eq!(report.new_documents, 1);

    let processed = pipeline.store().load_processed_files().unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].path, "a.zip!/inner/doc.txt");
}

#[tokio::test]
async fn test_global_search_returns_key_point_nodes() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("doc1.txt"), DOC1).unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config(input.path(), output.path());
    let (pipeline, gateway) = pipeline_with(provider, config.clone());
    pipeline.add_documents().await.unwrap();

    let router = SearchRouter::new(pipeline.store(), gateway, config);
    let options = SearchOptions {
        mode: SearchMode::Global,
        output_format: OutputFormat::Json,
        ..SearchOptions::default()
    };
    let result = router.search("overall summary of Acme", &options).await.unwrap();

    assert!(result.nodes.len() >= 2, "main node plus key points expected");
    assert!(result.nodes[0].text.contains("Acme"));
    for kp in &result.nodes[1..] {
        assert_eq!(kp.metadata.get("type").unwrap(), "key_point");
        let report_ids = kp.metadata.get("report_ids").unwrap().as_array().unwrap();
        assert!(!report_ids.is_empty(), "key points must carry report ids");
    }
}

#[tokio::test]
async fn test_local_search_finds_both_employees() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("doc1.txt"), DOC1).unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config(input.path(), output.path());
    let (pipeline, gateway) = pipeline_with(provider, config.clone());
    pipeline.add_documents().await.unwrap();

    let engine = LocalSearchEngine::new(pipeline.store(), gateway, config.local_search.clone());
    let (entities, text_units) = engine.retrieve("Who works at Acme").await.unwrap();

    let top5: Vec<&str> = entities
        .iter()
        .take(5)
        .map(|e| e.record.name.as_str())
        .collect();
    assert!(top5.contains(&"Alice"), "Alice missing from top-5: {top5:?}");
    assert!(top5.contains(&"Bob"), "Bob missing from top-5: {top5:?}");

    // Hop-0 anchors come before any expanded entity
    let hops: Vec<usize> = entities.iter().map(|e| e.hop).collect();
    let mut sorted = hops.clone();
    sorted.sort_unstable();
    assert_eq!(hops, sorted);

    assert!(!text_units.is_empty());
    assert!(text_units[0].text.contains("Alice"));
}

#[tokio::test]
async fn test_auto_mode_routes_by_query_wording() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("doc1.txt"), DOC1).unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config(input.path(), output.path());
    let (pipeline, gateway) = pipeline_with(provider, config.clone());
    pipeline.add_documents().await.unwrap();

    let router = SearchRouter::new(pipeline.store(), gateway, config);
    assert_eq!(
        router.route("give me an overall summary", SearchMode::Auto),
        SearchMode::Global
    );
    assert_eq!(
        router.route("show me specific details about Alice", SearchMode::Auto),
        SearchMode::Local
    );
}

#[tokio::test]
async fn test_drift_search_fuses_both_passes() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("doc1.txt"), DOC1).unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config(input.path(), output.path());
    let (pipeline, gateway) = pipeline_with(provider, config.clone());
    pipeline.add_documents().await.unwrap();

    let router = SearchRouter::new(pipeline.store(), gateway, config);
    let options = SearchOptions {
        mode: SearchMode::Drift,
        ..SearchOptions::default()
    };
    let result = router.search("where do Alice and Bob work", &options).await.unwrap();

    assert_eq!(result.nodes.len(), 1);
    let metadata = &result.nodes[0].metadata;
    assert_eq!(metadata.get("search_type").unwrap(), "drift");
    assert!(metadata.get("num_entities").unwrap().as_u64().unwrap() > 0);
    assert!(metadata.get("num_communities").unwrap().as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_truncated_extraction_matches_untruncated_run() {
    let chunk = Chunk {
        chunk_id: "doc:0".to_string(),
        document_id: "doc".to_string(),
        text: DOC1.to_string(),
        position: 0,
    };

    // Baseline: one-shot response
    let baseline_provider = Arc::new(MockProvider::new());
    let baseline = Extractor::new(LlmGateway::new(baseline_provider, 5));
    let mut baseline_acc = ExtractionAccumulator::new();
    baseline.extract_chunk(&chunk, &mut baseline_acc).await.unwrap();

    // Truncated: the same response served in max_tokens windows
    let window = EXTRACTION_RESPONSE.len() / 3 + 30;
    let truncating = Arc::new(TruncatingProvider::new(EXTRACTION_RESPONSE, window));
    let extractor = Extractor::new(LlmGateway::new(truncating.clone(), 5));
    let mut acc = ExtractionAccumulator::new();
    extractor.extract_chunk(&chunk, &mut acc).await.unwrap();

    let calls = truncating.calls.load(std::sync::atomic::Ordering::SeqCst);
    assert!(calls > 1, "truncation should force continuation calls");
    assert!(calls <= 5, "continuation budget exceeded: {calls}");

    assert_eq!(acc.entities(), baseline_acc.entities());
    assert_eq!(acc.relationships(), baseline_acc.relationships());
}
