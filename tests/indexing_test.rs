//! End-to-end indexing against the in-memory graph

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;
use tokio::sync::broadcast;

use docgraph_indexer::{
    transport::AckGate, BatcherConfig, CheckpointStore, DeltaEnvelope, DeltaSource, DocumentTransformer,
    GraphStore, Indexer, MemoryCheckpointStore, MemoryGraph, QueryOptions, Result, SledCheckpointStore,
    StartFrom, TableNames, UpsertOutcome,
};

const TIMEOUT: Duration = Duration::from_millis(500);

/// Delivers a fixed list of records and counts acknowledgements
struct VecSource {
    records: VecDeque<DeltaEnvelope>,
    gate: AckGate,
    acks: usize,
}

impl VecSource {
    fn new(records: Vec<JsonValue>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| serde_json::from_value(r).unwrap())
                .collect(),
            gate: AckGate::new(),
            acks: 0,
        }
    }
}

#[async_trait]
impl DeltaSource for VecSource {
    async fn next(&mut self) -> Result<Option<DeltaEnvelope>> {
        self.gate.ready()?;
        match self.records.pop_front() {
            Some(envelope) => {
                self.gate.deliver(envelope.block_num())?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    async fn ack(&mut self) -> Result<()> {
        self.gate.ack()?;
        self.acks += 1;
        Ok(())
    }
}

fn certificate(certifier: &str) -> JsonValue {
    json!({ "certifier": certifier, "notes": "", "certification_date": "2020-09-16T00:00:00.000" })
}

fn document_data(hash: &str, certifiers: &[&str]) -> JsonValue {
    json!({
        "hash": hash,
        "creator": "alice",
        "created_date": "2020-09-15T00:00:00.000",
        "content_groups": [
            [
                { "label": "title", "value": ["string", format!("doc {}", hash)] },
                { "label": "amount", "value": ["int64", 100] }
            ],
            [ { "label": "owner", "value": ["name", "alice"] } ]
        ],
        "certificates": certifiers.iter().map(|c| certificate(c)).collect::<Vec<_>>()
    })
}

fn delta(block_num: u64, table: &str, present: bool, data: JsonValue) -> JsonValue {
    json!({ "content": { "block_num": block_num, "table": table, "present": present, "data": data } })
}

fn create_doc(block_num: u64, hash: &str) -> JsonValue {
    delta(block_num, "documents", true, document_data(hash, &[]))
}

fn delete_doc(block_num: u64, hash: &str) -> JsonValue {
    delta(block_num, "documents", false, json!({ "hash": hash }))
}

fn edge(block_num: u64, present: bool, name: &str, from: &str, to: &str) -> JsonValue {
    delta(
        block_num,
        "edges",
        present,
        json!({ "edge_name": name, "from_node": from, "to_node": to }),
    )
}

struct Harness {
    graph: Arc<MemoryGraph>,
    checkpoint: Arc<MemoryCheckpointStore>,
    indexer: Indexer,
}

async fn harness() -> Harness {
    harness_on(MemoryGraph::new()).await
}

async fn harness_on(graph: MemoryGraph) -> Harness {
    let graph = Arc::new(graph);
    let checkpoint = Arc::new(MemoryCheckpointStore::new());
    let indexer = Indexer::prepare(
        graph.clone(),
        checkpoint.clone(),
        TableNames::default(),
        BatcherConfig {
            block_end_timeout: TIMEOUT,
            pin_checkpoint_on_error: true,
        },
    )
    .await
    .unwrap();

    Harness {
        graph,
        checkpoint,
        indexer,
    }
}

impl Harness {
    async fn run(&self, records: Vec<JsonValue>) -> docgraph_indexer::RunSummary {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut source = VecSource::new(records);
        let count = source.records.len();

        let summary = self.indexer.run(&mut source, shutdown_rx).await.unwrap();
        assert_eq!(source.acks, count, "every record is acknowledged once");
        summary
    }

    async fn handle(&self, record: JsonValue) {
        let envelope: DeltaEnvelope = serde_json::from_value(record).unwrap();
        let delta = envelope.decode(&TableNames::default()).unwrap();
        self.indexer.batcher().handle_delta(delta).await.unwrap();
    }

    async fn document_count(&self, hash: &str) -> usize {
        self.indexer
            .queries()
            .get_by_hash(hash, &QueryOptions::shallow())
            .await
            .unwrap()
            .into_iter()
            .count()
    }
}

#[tokio::test]
async fn test_same_document_twice_yields_one_node() {
    let h = harness().await;

    let summary = h.run(vec![create_doc(1, "a"), create_doc(2, "a")]).await;

    assert_eq!(summary.errors, 0);
    assert_eq!(h.graph.stats().documents, 1);
    assert_eq!(h.document_count("a").await, 1);

    let transformer = DocumentTransformer::new(h.graph.clone());
    let record = serde_json::from_value(document_data("a", &[])).unwrap();
    assert!(matches!(
        transformer.upsert(&record).await.unwrap(),
        UpsertOutcome::Updated { appended: 0, .. }
    ));
}

#[tokio::test]
async fn test_document_without_content_groups_not_created() {
    let h = harness().await;

    let mut data = document_data("a", &["bob"]);
    data["content_groups"] = json!([]);
    let mut missing = document_data("b", &[]);
    missing["content_groups"] = JsonValue::Null;

    let summary = h
        .run(vec![
            delta(1, "documents", true, data),
            delta(1, "documents", true, missing),
        ])
        .await;

    assert_eq!(summary.errors, 0);
    assert_eq!(h.graph.stats().documents, 0);
}

#[tokio::test]
async fn test_certificate_sequences_extend_without_renumbering() {
    let h = harness().await;

    h.run(vec![
        delta(1, "documents", true, document_data("a", &["bob", "carol"])),
        delta(2, "documents", true, document_data("a", &["bob", "carol", "dave"])),
        delta(3, "documents", true, document_data("a", &["bob", "carol", "dave"])),
    ])
    .await;

    let doc = h
        .indexer
        .queries()
        .get_by_hash("a", &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    let sequences: Vec<u32> = doc.certificates.iter().map(|c| c.certification_sequence).collect();
    let certifiers: Vec<&str> = doc.certificates.iter().map(|c| c.certifier.as_str()).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(certifiers, vec!["bob", "carol", "dave"]);
}

#[tokio::test]
async fn test_existing_certificates_keep_their_nodes() {
    let h = harness().await;
    h.run(vec![delta(1, "documents", true, document_data("a", &["bob"]))]).await;

    let before = h
        .indexer
        .queries()
        .get_by_hash("a", &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    h.run(vec![delta(2, "documents", true, document_data("a", &["bob", "carol"]))])
        .await;

    let after = h
        .indexer
        .queries()
        .get_by_hash("a", &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(after.certificates[0], before.certificates[0]);
    assert_eq!(after.certificates[1].certification_sequence, 1);
}

#[tokio::test]
async fn test_content_sequences_follow_input_order() {
    let h = harness().await;
    h.run(vec![create_doc(1, "a")]).await;

    let doc = h
        .indexer
        .queries()
        .get_by_hash("a", &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(doc.content_groups.len(), 2);
    for (group_index, group) in doc.content_groups.iter().enumerate() {
        assert_eq!(group.content_group_sequence as usize, group_index);
        for (content_index, content) in group.contents.iter().enumerate() {
            assert_eq!(content.content_sequence as usize, content_index);
        }
    }
    assert_eq!(doc.content_groups[0].contents[0].label, "title");
    assert_eq!(doc.content_groups[0].contents[1].value, "100");
    assert_eq!(doc.content_groups[1].contents[0].content_type, "name");
}

#[tokio::test]
async fn test_edge_between_resolved_documents_created_once() {
    let h = harness().await;

    let summary = h
        .run(vec![
            create_doc(1, "a"),
            create_doc(1, "b"),
            edge(1, true, "owns", "a", "b"),
            edge(2, true, "owns", "a", "b"),
        ])
        .await;

    assert_eq!(summary.errors, 0);
    assert_eq!(h.graph.stats().edges, 1);

    let targets = h
        .indexer
        .queries()
        .get_by_edge("owns", &QueryOptions::shallow())
        .await
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].hash, "b");

    let source = h
        .indexer
        .queries()
        .get_by_hash("a", &QueryOptions::shallow().with_edge("owns"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source.edges["owns"][0].hash, "b");
}

#[tokio::test]
async fn test_unresolved_edge_is_dropped_without_error() {
    let h = harness().await;

    let summary = h
        .run(vec![create_doc(1, "a"), edge(1, true, "owns", "a", "ghost")])
        .await;

    assert_eq!(summary.errors, 0);
    assert_eq!(h.graph.stats().edges, 0);
    assert_eq!(h.indexer.batcher().pending_counts().await, (0, 0));
}

#[tokio::test]
async fn test_same_block_edge_resolves_after_later_create() {
    let h = harness().await;

    h.run(vec![
        edge(1, true, "owns", "a", "b"),
        create_doc(1, "a"),
        create_doc(1, "b"),
        create_doc(2, "c"),
    ])
    .await;

    assert_eq!(h.graph.stats().edges, 1);
}

#[tokio::test]
async fn test_queued_delete_flushes_before_queued_edge() {
    // Like Dgraph, this graph keeps edges into a deleted node
    let h = harness_on(MemoryGraph::keeping_dangling_edges()).await;

    let summary = h
        .run(vec![
            create_doc(1, "a"),
            create_doc(2, "b"),
            edge(2, true, "owns", "b", "a"),
            delete_doc(2, "a"),
            delta(3, "settings", true, json!({ "key": "value" })),
        ])
        .await;

    assert_eq!(summary.errors, 0);
    assert_eq!(summary.last_block, Some(3));
    assert_eq!(h.document_count("a").await, 0);
    assert_eq!(h.document_count("b").await, 1);
    assert_eq!(h.graph.stats().edges, 0);
}

#[tokio::test]
async fn test_edge_delete_applies_immediately() {
    let h = harness().await;

    h.handle(create_doc(1, "a")).await;
    h.handle(create_doc(1, "b")).await;
    h.handle(edge(1, true, "owns", "a", "b")).await;
    h.handle(create_doc(2, "c")).await;
    assert_eq!(h.graph.stats().edges, 1);

    h.handle(edge(2, false, "owns", "a", "b")).await;
    assert_eq!(h.graph.stats().edges, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_flushes_queued_edge() {
    let h = harness().await;

    h.handle(create_doc(1, "a")).await;
    h.handle(create_doc(1, "b")).await;
    h.handle(edge(1, true, "owns", "a", "b")).await;
    assert_eq!(h.graph.stats().edges, 0);

    tokio::time::sleep(TIMEOUT / 2).await;
    assert_eq!(h.graph.stats().edges, 0);

    tokio::time::sleep(TIMEOUT).await;
    assert_eq!(h.graph.stats().edges, 1);
    assert_eq!(h.indexer.batcher().pending_counts().await, (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_new_delta_resets_idle_timeout() {
    let h = harness().await;

    h.handle(create_doc(1, "a")).await;
    h.handle(create_doc(1, "b")).await;
    h.handle(edge(1, true, "owns", "a", "b")).await;

    tokio::time::sleep(TIMEOUT * 3 / 4).await;
    h.handle(create_doc(1, "c")).await;
    tokio::time::sleep(TIMEOUT * 3 / 4).await;
    assert_eq!(h.graph.stats().edges, 0);

    tokio::time::sleep(TIMEOUT).await;
    assert_eq!(h.graph.stats().edges, 1);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_operations() {
    let h = harness().await;

    h.run(vec![
        create_doc(1, "a"),
        create_doc(1, "b"),
        edge(1, true, "owns", "a", "b"),
    ])
    .await;

    assert_eq!(h.graph.stats().edges, 1);
    assert_eq!(h.checkpoint.block_num(), Some(1));
}

#[tokio::test]
async fn test_schema_extended_once_per_edge_name() {
    let h = harness().await;
    assert_eq!(h.graph.stats().schema_updates, 1);

    h.run(vec![
        create_doc(1, "a"),
        create_doc(1, "b"),
        edge(1, true, "owns", "a", "b"),
        edge(2, true, "owns", "b", "a"),
        edge(3, false, "owns", "b", "a"),
    ])
    .await;
    assert_eq!(h.graph.stats().schema_updates, 2);

    let restarted = Indexer::prepare(
        h.graph.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        TableNames::default(),
        BatcherConfig::default(),
    )
    .await
    .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let mut source = VecSource::new(vec![edge(4, true, "owns", "b", "a"), create_doc(5, "c")]);
    restarted.run(&mut source, rx).await.unwrap();

    assert_eq!(h.graph.stats().schema_updates, 2);
    let fields = h.graph.type_fields("Document").await.unwrap();
    assert_eq!(fields.iter().filter(|f| *f == "owns").count(), 1);
}

#[tokio::test]
async fn test_failed_block_pins_checkpoint() {
    let h = harness().await;
    h.graph.inject_failures(1);

    let summary = h
        .run(vec![create_doc(7, "a"), create_doc(8, "b"), create_doc(9, "c")])
        .await;

    assert_eq!(summary.errors, 1);
    assert_eq!(summary.last_block, Some(9));
    assert_eq!(h.checkpoint.block_num(), Some(7));
    assert_eq!(h.document_count("a").await, 0);
    assert_eq!(h.document_count("c").await, 1);

    let position = h.indexer.resume_position(StartFrom::Block(0)).await.unwrap();
    assert_eq!(position, StartFrom::Block(7));
}

#[tokio::test]
async fn test_block_failing_after_restart_releases_checkpoint() {
    let h = harness().await;
    h.graph.inject_failures(1);
    h.run(vec![create_doc(7, "a"), create_doc(8, "b")]).await;
    assert_eq!(h.checkpoint.block_num(), Some(7));

    let restarted = Indexer::prepare(
        h.graph.clone(),
        h.checkpoint.clone(),
        TableNames::default(),
        BatcherConfig::default(),
    )
    .await
    .unwrap();

    // Replay from the pinned block; it is rejected again
    h.graph.inject_failures(1);
    let (_tx, rx) = broadcast::channel(1);
    let mut source = VecSource::new(vec![create_doc(7, "a"), create_doc(8, "b"), create_doc(9, "c")]);
    let summary = restarted.run(&mut source, rx).await.unwrap();

    assert_eq!(summary.errors, 1);
    assert_eq!(h.checkpoint.block_num(), Some(9));
    assert!(!h.checkpoint.load().await.unwrap().unwrap().pinned);
    assert_eq!(
        restarted.resume_position(StartFrom::Block(0)).await.unwrap(),
        StartFrom::Block(9)
    );
}

#[tokio::test]
async fn test_undecodable_delta_counted_and_acknowledged() {
    let h = harness().await;

    let summary = h
        .run(vec![
            edge(1, true, "not a predicate", "a", "b"),
            delta(2, "documents", true, json!({ "creator": "no hash" })),
            create_doc(3, "a"),
        ])
        .await;

    assert_eq!(summary.deltas, 3);
    assert_eq!(summary.errors, 2);
    assert_eq!(h.document_count("a").await, 1);
}

#[tokio::test]
async fn test_queries_by_uid_and_creator() {
    let h = harness().await;
    h.run(vec![create_doc(1, "a"), create_doc(1, "b")]).await;

    let queries = h.indexer.queries();
    let by_creator = queries.get_by_creator("alice", &QueryOptions::shallow()).await.unwrap();
    assert_eq!(by_creator.len(), 2);

    let uid = by_creator[0].uid.clone();
    let by_uid = queries
        .get_by_uid(&uid, &QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_uid.hash, by_creator[0].hash);
    assert!(!by_uid.content_groups.is_empty());

    assert!(queries.get_by_edge("hash", &QueryOptions::shallow()).await.is_err());
}

#[tokio::test]
async fn test_sled_checkpoint_resumes_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("checkpoint.sled");
    let graph = Arc::new(MemoryGraph::new());

    {
        let checkpoint = Arc::new(SledCheckpointStore::open(&path).unwrap());
        let indexer = Indexer::prepare(
            graph.clone(),
            checkpoint.clone(),
            TableNames::default(),
            BatcherConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            indexer.resume_position(StartFrom::Block(40)).await.unwrap(),
            StartFrom::Block(40)
        );

        let (_tx, rx) = broadcast::channel(1);
        let mut source = VecSource::new(vec![create_doc(41, "a"), create_doc(42, "b")]);
        indexer.run(&mut source, rx).await.unwrap();
    }

    let checkpoint = Arc::new(SledCheckpointStore::open(&path).unwrap());
    assert_eq!(checkpoint.load().await.unwrap().unwrap().block_num, 42);

    let restarted = Indexer::prepare(graph, checkpoint, TableNames::default(), BatcherConfig::default())
        .await
        .unwrap();
    assert_eq!(
        restarted.resume_position(StartFrom::Block(40)).await.unwrap(),
        StartFrom::Block(42)
    );
}
