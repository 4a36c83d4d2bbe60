//! End-to-end pipeline tests with the lexical embedder and stub generators.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use medical_rag::config::{parse_config, Config, GenerationConfig};
use medical_rag::embedding::Embedder;
use medical_rag::generation::prompt::ChatTurn;
use medical_rag::generation::{
    GenerationOutcome, GenerationParams, Generator, TextGenerator, EMPTY_CHAT_MESSAGE,
    FAILURE_MESSAGE, TIMEOUT_MESSAGE,
};
use medical_rag::pipeline::stream::{
    COMPLETE_MESSAGE, STATUS_ANALYZING, STATUS_GENERATING, STATUS_ORGANIZING, STATUS_RECEIVED,
    STATUS_RETRIEVING,
};
use medical_rag::pipeline::{Pipeline, QueryOptions, QueryStage, SearchType, StreamEvent};
use medical_rag::RagError;
use medrag_core::models::{Document, DocumentKind, Metadata, MetadataPatch, RetrievalFilters};

// ============ Stub generators ============

/// Records every prompt and answers with a fixed text.
#[derive(Default)]
struct Recorder {
    prompts: Mutex<Vec<String>>,
}

impl Recorder {
    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("高血压是以动脉血压持续升高为特征的慢性病。".to_string())
    }
}

/// Fails whenever the prompt mentions `needle`.
struct FailOn(&'static str);

#[async_trait]
impl TextGenerator for FailOn {
    fn name(&self) -> &str {
        "fail-on"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        if prompt.contains(self.0) {
            bail!("model crashed");
        }
        Ok("正常回答".to_string())
    }
}

struct Slow;

#[async_trait]
impl TextGenerator for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".to_string())
    }
}

/// Streams a fixed answer in three fragments.
struct Fragments;

const FRAGMENTS: [&str; 3] = ["高血压", "是一种", "慢性病"];

#[async_trait]
impl TextGenerator for Fragments {
    fn name(&self) -> &str {
        "fragments"
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
        Ok(FRAGMENTS.concat())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for f in FRAGMENTS {
                if tx.send(Ok(f.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

// ============ Helpers ============

fn test_config() -> Config {
    toml::from_str(
        r#"
[embedding]
providers = ["lexical"]
lexical_dims = 1024

[retrieval]
similarity_threshold = 0.1

[generation]
provider = "disabled"
max_retries = 0
backoff_ms = 1
"#,
    )
    .unwrap()
}

fn generator(backend: Arc<dyn TextGenerator>, config: &Config) -> Generator {
    Generator::new(backend, &config.generation)
}

fn pipeline_with(backend: Arc<dyn TextGenerator>) -> Pipeline {
    let config = test_config();
    let gen = generator(backend, &config);
    Pipeline::with_components(config, Embedder::lexical(1024), gen)
}

fn doc(id: &str, title: &str, content: &str, category: &str) -> Document {
    Document {
        id: id.to_string(),
        content: content.to_string(),
        title: Some(title.to_string()),
        source: Some("textbook".to_string()),
        category: Some(category.to_string()),
        tags: Vec::new(),
        metadata: Metadata::new(),
        kind: DocumentKind::Text,
        image_path: None,
        created_at: Utc::now(),
    }
}

fn corpus() -> Vec<Document> {
    vec![
        doc("htn", "高血压", "高血压是一种常见的慢性疾病", "disease"),
        doc(
            "dm",
            "糖尿病饮食",
            "糖尿病患者应控制碳水化合物摄入，少食多餐，避免高糖食物。",
            "nutrition",
        ),
        doc(
            "fx",
            "骨折康复",
            "骨折术后康复训练应循序渐进，在医生指导下进行功能锻炼。",
            "rehab",
        ),
    ]
}

fn threshold(t: f32) -> QueryOptions {
    QueryOptions {
        similarity_threshold: Some(t),
        ..Default::default()
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn test_scenario_a_relevant_chunk_ranked_first() {
    let recorder = Arc::new(Recorder::default());
    let pipeline = pipeline_with(recorder.clone());
    let report = pipeline.add_documents(corpus(), false).await;
    assert_eq!(report.accepted_count, 3);
    assert!(report.failures.is_empty());

    let result = pipeline.query("什么是高血压", &threshold(0.3)).await;
    assert!(!result.retrieved_documents.is_empty());
    let top = &result.retrieved_documents[0];
    assert_eq!(top.document_id, "htn");
    assert_eq!(top.rank, 1);
    assert_eq!(top.category.as_deref(), Some("disease"));
    assert!(top.score >= 0.3);

    assert_eq!(result.generation, GenerationOutcome::Completed);
    assert_eq!(result.stage, QueryStage::Done);
    assert!(!result.degraded);
    assert!(result.context.contains("医学知识摘要"));

    // Summary prompt, then the answer prompt built on the digest.
    let prompts = recorder.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("摘要"));
    assert!(prompts[1].contains("用户问题：什么是高血压"));
}

#[tokio::test]
async fn test_scenario_b_empty_index_uses_no_context_template() {
    let recorder = Arc::new(Recorder::default());
    let pipeline = pipeline_with(recorder.clone());

    let result = pipeline.query("任意问题", &QueryOptions::default()).await;
    assert!(result.retrieved_documents.is_empty());
    assert!(!result.answer.is_empty());
    assert!(result.context.is_empty());
    assert!(result.degraded);
    assert_eq!(result.stage, QueryStage::Done);

    let prompts = recorder.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("没有找到足够相关的信息"));
    assert!(prompts[0].contains("任意问题"));
}

#[tokio::test]
async fn test_scenario_d_batch_isolates_failures() {
    let pipeline = pipeline_with(Arc::new(FailOn("q1")));
    let questions = vec!["q1".to_string(), "q2".to_string()];

    let results = pipeline.batch_query(&questions, &QueryOptions::default()).await;
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].question, "q1");
    assert_eq!(results[0].answer, FAILURE_MESSAGE);
    assert_eq!(results[0].generation, GenerationOutcome::Failed);
    assert!(results[0].degraded);

    assert_eq!(results[1].question, "q2");
    assert_eq!(results[1].answer, "正常回答");
    assert_eq!(results[1].generation, GenerationOutcome::Completed);
}

// ============ Timeouts ============

#[tokio::test]
async fn test_slow_generator_times_out() {
    let config = test_config();
    let gen = generator(Arc::new(Slow), &config).with_timeout(Duration::from_millis(100));
    let pipeline = Pipeline::with_components(config, Embedder::lexical(1024), gen);

    let started = tokio::time::Instant::now();
    let result = pipeline.query("头痛怎么办", &QueryOptions::default()).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.answer, TIMEOUT_MESSAGE);
    assert_eq!(result.generation, GenerationOutcome::TimedOut);
    assert!(result.degraded);
}

#[tokio::test]
async fn test_zero_timeout_returns_immediately() {
    let mut config = test_config();
    config.generation = GenerationConfig {
        timeout_secs: 0,
        ..config.generation
    };
    let gen = generator(Arc::new(Slow), &config);
    let pipeline = Pipeline::with_components(config, Embedder::lexical(1024), gen);

    let started = tokio::time::Instant::now();
    let result = pipeline.query("头痛怎么办", &QueryOptions::default()).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.answer, TIMEOUT_MESSAGE);
}

// ============ Ingestion ============

#[tokio::test]
async fn test_partial_ingestion_failure_continues() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    let mut image = doc("img", "X光片", "", "imaging");
    image.kind = DocumentKind::Image;

    let docs = vec![
        doc("ok", "高血压", "高血压是一种常见的慢性疾病", "disease"),
        doc("empty", "空", "   ", "disease"),
        image,
    ];
    let report = pipeline.add_documents(docs, true).await;
    assert_eq!(report.accepted_count, 1);
    assert_eq!(report.chunk_count, 1);
    let failed: Vec<(usize, &str)> = report
        .failures
        .iter()
        .map(|f| (f.index, f.document_id.as_str()))
        .collect();
    assert_eq!(failed, vec![(1, "empty"), (2, "img")]);
}

#[tokio::test]
async fn test_reingest_replaces_document() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    let long = "高血压需要长期管理。".repeat(200);
    pipeline
        .add_documents(vec![doc("htn", "高血压", &long, "disease")], false)
        .await;
    let before = pipeline.get_stats().await.unwrap();
    assert!(before.index_size > 1);

    pipeline
        .add_documents(vec![doc("htn", "高血压", "高血压是一种常见的慢性疾病", "disease")], false)
        .await;
    let after = pipeline.get_stats().await.unwrap();
    assert_eq!(after.index_size, 1);
    assert_eq!(after.document_count, 1);
}

#[tokio::test]
async fn test_missing_ids_are_derived() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    let d = doc("", "高血压", "高血压是一种常见的慢性疾病", "disease");
    pipeline.add_documents(vec![d.clone(), d], false).await;
    let stats = pipeline.get_stats().await.unwrap();
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.index_size, 1);
}

// ============ Streaming ============

#[tokio::test]
async fn test_stream_event_order() {
    let pipeline = pipeline_with(Arc::new(Fragments));
    pipeline.add_documents(corpus(), false).await;

    let mut rx = pipeline.query_stream("什么是高血压", threshold(0.3));
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }

    let statuses: Vec<&str> = events
        .iter()
        .take_while(|e| matches!(e, StreamEvent::Status { .. }))
        .filter_map(|e| match e {
            StreamEvent::Status { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.len(), 5);
    assert_eq!(statuses[0], STATUS_RECEIVED);
    assert_eq!(statuses[4], STATUS_GENERATING);

    let content: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(content, FRAGMENTS.concat());

    let n = events.len();
    match &events[n - 2] {
        StreamEvent::Documents { documents } => {
            assert!(!documents.is_empty());
            assert_eq!(documents[0].document_id, "htn");
        }
        other => panic!("expected documents, got {:?}", other),
    }
    match &events[n - 1] {
        StreamEvent::Complete { message, degraded } => {
            assert_eq!(message, COMPLETE_MESSAGE);
            assert!(!degraded);
        }
        other => panic!("expected complete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_timeout_sends_canned_content() {
    let config = test_config();
    let gen = generator(Arc::new(Slow), &config).with_timeout(Duration::from_millis(100));
    let pipeline = Pipeline::with_components(config, Embedder::lexical(1024), gen);

    let mut rx = pipeline.query_stream("头痛怎么办", QueryOptions::default());
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert!(events.contains(&StreamEvent::Content {
        content: TIMEOUT_MESSAGE.to_string()
    }));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Complete { degraded: true, .. })
    ));
}

#[tokio::test]
async fn test_stream_status_precedes_slow_summary() {
    let pipeline = pipeline_with(Arc::new(Slow));
    pipeline.add_documents(corpus(), false).await;

    let mut rx = pipeline.query_stream("什么是高血压", threshold(0.3));
    let mut statuses = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(StreamEvent::Status { stage, message }) => statuses.push((stage, message)),
                Some(other) => panic!("unexpected event while summarizing: {:?}", other),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    let messages: Vec<&str> = statuses.iter().map(|(_, m)| m.as_str()).collect();
    assert_eq!(
        messages,
        vec![STATUS_RECEIVED, STATUS_ANALYZING, STATUS_RETRIEVING, STATUS_ORGANIZING]
    );
    assert_eq!(statuses[3].0, QueryStage::ContextBuilt);
}

#[tokio::test]
async fn test_stream_consumer_may_drop_early() {
    let pipeline = pipeline_with(Arc::new(Fragments));
    pipeline.add_documents(corpus(), false).await;

    let mut rx = pipeline.query_stream("什么是高血压", QueryOptions::default());
    let first = rx.recv().await;
    assert!(matches!(first, Some(StreamEvent::Status { .. })));
    drop(rx);

    // The pipeline keeps serving after an abandoned stream.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = pipeline.query("什么是高血压", &QueryOptions::default()).await;
    assert_eq!(result.stage, QueryStage::Done);
}

// ============ Chat ============

#[tokio::test]
async fn test_chat_requires_user_question() {
    let recorder = Arc::new(Recorder::default());
    let pipeline = pipeline_with(recorder.clone());

    let empty = pipeline.chat(&[], None).await;
    assert_eq!(empty.answer, EMPTY_CHAT_MESSAGE);
    assert!(empty.retrieved_documents.is_empty());

    let trailing_assistant = pipeline
        .chat(&[ChatTurn::user("你好"), ChatTurn::assistant("您好")], None)
        .await;
    assert_eq!(trailing_assistant.answer, EMPTY_CHAT_MESSAGE);
    assert!(recorder.prompts().is_empty());
}

#[tokio::test]
async fn test_chat_uses_recent_history() {
    let recorder = Arc::new(Recorder::default());
    let pipeline = pipeline_with(recorder.clone());
    pipeline.add_documents(corpus(), false).await;

    let mut turns = Vec::new();
    for i in 0..4 {
        turns.push(ChatTurn::user(format!("旧问题{}", i)));
        turns.push(ChatTurn::assistant(format!("旧回答{}", i)));
    }
    turns.push(ChatTurn::user("什么是高血压"));

    let response = pipeline.chat(&turns, Some(3)).await;
    assert!(!response.retrieved_documents.is_empty());
    assert!(response.retrieved_documents.len() <= 3);

    let prompt = recorder.prompts().pop().unwrap();
    assert!(prompt.contains("用户：什么是高血压"));
    assert!(prompt.contains("助手：旧回答3"));
    // Only the last six turns are included.
    assert!(!prompt.contains("旧问题0"));
}

// ============ Search & administration ============

#[tokio::test]
async fn test_search_modes_and_filters() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    pipeline.add_documents(corpus(), false).await;

    let keyword = pipeline
        .search("糖尿病", SearchType::Keyword, 5, &RetrievalFilters::default())
        .await
        .unwrap();
    assert_eq!(keyword.len(), 1);
    assert_eq!(keyword[0].entry.document_id(), "dm");
    assert!((keyword[0].score - 1.0).abs() < 1e-6);

    let filtered = pipeline
        .search(
            "高血压 糖尿病",
            SearchType::Hybrid,
            5,
            &RetrievalFilters {
                category: Some("nutrition".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(filtered
        .iter()
        .all(|r| r.entry.metadata.category.as_deref() == Some("nutrition")));

    let none = pipeline
        .search("高血压", SearchType::Semantic, 0, &RetrievalFilters::default())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_document_listing_delete_and_clear() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    pipeline.add_documents(corpus(), false).await;

    let disease = pipeline.documents_by_category("disease").await.unwrap();
    assert_eq!(disease.len(), 1);
    assert_eq!(disease[0].document_id, "htn");
    assert_eq!(pipeline.documents_by_source("textbook").await.unwrap().len(), 3);

    assert_eq!(pipeline.delete_document("htn").await.unwrap(), 1);
    assert_eq!(pipeline.delete_document("htn").await.unwrap(), 0);

    let stats = pipeline.get_stats().await.unwrap();
    assert_eq!(stats.document_count, 2);
    assert_eq!(stats.embedder.dims, 1024);
    assert_eq!(stats.categories.get("nutrition"), Some(&1));

    pipeline.clear().await.unwrap();
    assert_eq!(pipeline.get_stats().await.unwrap().index_size, 0);
}

#[tokio::test]
async fn test_get_and_update_document() {
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    let long = "高血压需要长期管理，定期监测血压。".repeat(100);
    pipeline
        .add_documents(vec![doc("htn", "高血压", &long, "disease")], false)
        .await;

    let before = pipeline.get_document("htn").await.unwrap().unwrap();
    assert!(before.chunks > 1);
    assert_eq!(before.category.as_deref(), Some("disease"));
    assert!(pipeline.get_document("missing").await.unwrap().is_none());

    let patch = MetadataPatch {
        category: Some("cardiology".into()),
        tags: Some(vec!["reviewed".into()]),
        ..Default::default()
    };
    assert_eq!(pipeline.update_document("htn", &patch).await.unwrap(), before.chunks);
    assert_eq!(pipeline.update_document("missing", &patch).await.unwrap(), 0);

    let after = pipeline.get_document("htn").await.unwrap().unwrap();
    assert_eq!(after.chunks, before.chunks);
    assert_eq!(after.category.as_deref(), Some("cardiology"));
    assert_eq!(after.title.as_deref(), Some("高血压"));
    assert_eq!(after.tags, vec!["reviewed".to_string()]);
    assert!(pipeline.documents_by_category("disease").await.unwrap().is_empty());
    let moved = pipeline.documents_by_category("cardiology").await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].chunks, before.chunks);
}

// ============ Snapshots ============

#[tokio::test]
async fn test_save_load_round_trip() {
    let tmp = TempDir::new().unwrap();
    let dir: PathBuf = tmp.path().join("index");

    let original = pipeline_with(Arc::new(Recorder::default()));
    original.add_documents(corpus(), false).await;
    let before = original
        .search("糖尿病患者饮食", SearchType::Hybrid, 3, &RetrievalFilters::default())
        .await
        .unwrap();
    let meta = original.save(&dir).await.unwrap();
    assert_eq!(meta.entries, 3);
    let saved = tokio::fs::read_to_string(dir.join("config.toml")).await.unwrap();
    let saved: Config = toml::from_str(&saved).unwrap();
    assert_eq!(saved.embedding.providers, vec!["lexical".to_string()]);
    assert_eq!(saved.generation.provider, "disabled");

    let restored = pipeline_with(Arc::new(Recorder::default()));
    let loaded = restored.load(&dir).await.unwrap().unwrap();
    assert_eq!(loaded.dims, 1024);
    let after = restored
        .search("糖尿病患者饮食", SearchType::Hybrid, 3, &RetrievalFilters::default())
        .await
        .unwrap();

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.entry.id(), b.entry.id());
        assert_eq!(a.rank, b.rank);
        assert!((a.score - b.score).abs() < 1e-5);
    }
}

#[tokio::test]
async fn test_load_missing_and_mismatched_snapshots() {
    let tmp = TempDir::new().unwrap();
    let pipeline = pipeline_with(Arc::new(Recorder::default()));
    assert!(pipeline.load(tmp.path()).await.unwrap().is_none());

    pipeline.add_documents(corpus(), false).await;
    pipeline.save(tmp.path()).await.unwrap();

    let config = test_config();
    let gen = generator(Arc::new(Recorder::default()), &config);
    let narrow = Pipeline::with_components(config, Embedder::lexical(512), gen);
    let err = narrow.load(tmp.path()).await.unwrap_err();
    assert!(matches!(err, RagError::Configuration(_)));
    assert_eq!(narrow.get_stats().await.unwrap().index_size, 0);
}

// ============ Configuration ============

#[tokio::test]
async fn test_from_config_lexical_and_disabled() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let stats = pipeline.get_stats().await.unwrap();
    assert_eq!(stats.embedder.dims, 1024);
    assert_eq!(stats.generator, "disabled");

    pipeline
        .add_documents(vec![doc("htn", "高血压", "高血压是一种常见的慢性疾病", "disease")], false)
        .await;
    let result = pipeline.query("什么是高血压", &threshold(0.3)).await;
    assert_eq!(result.answer, FAILURE_MESSAGE);
    assert!(result.degraded);
    assert!(!result.retrieved_documents.is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_config();
    config.chunking.chunk_overlap = config.chunking.chunk_size;
    assert!(matches!(
        Pipeline::from_config(config).await,
        Err(RagError::Configuration(_))
    ));

    assert!(parse_config("[retrieval]\nsimilarity_threshold = 1.5").is_err());
    assert!(parse_config("[embedding]\nproviders = [\"gpu\"]").is_err());
}
