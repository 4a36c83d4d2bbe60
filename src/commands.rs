//! CLI command implementations.
//!
//! Each `run_*` function backs one `medrag` subcommand. Mutating commands
//! save the index snapshot to `storage.index_dir` before returning.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

use medrag_core::models::{MetadataPatch, RetrievalFilters};

use crate::config::Config;
use crate::generation::prompt::ChatTurn;
use crate::loader;
use crate::pipeline::{Pipeline, QueryOptions, RetrievedDocument, SearchType, StreamEvent};

/// Build the pipeline and load the saved index, if any.
pub async fn open_pipeline(config: &Config) -> Result<Pipeline> {
    let pipeline = Pipeline::from_config(config.clone()).await?;
    if let Some(meta) = pipeline.load(&config.storage.index_dir).await? {
        tracing::debug!(entries = meta.entries, saved_at = %meta.saved_at, "snapshot restored");
    }
    Ok(pipeline)
}

async fn persist(pipeline: &Pipeline) -> Result<()> {
    let dir = &pipeline.config().storage.index_dir;
    pipeline
        .save(dir)
        .await
        .with_context(|| format!("Failed to save index to {}", dir.display()))?;
    Ok(())
}

pub async fn run_ingest(pipeline: &Pipeline, path: &Path, vectorize_images: bool) -> Result<()> {
    let documents = loader::load_path(path, &pipeline.config().loader)?;
    if documents.is_empty() {
        println!("No documents found in {}.", path.display());
        return Ok(());
    }

    let report = pipeline.add_documents(documents, vectorize_images).await;
    println!(
        "Ingested {} documents ({} chunks).",
        report.accepted_count, report.chunk_count
    );
    for failure in &report.failures {
        println!(
            "  skipped #{} {}: {}",
            failure.index, failure.document_id, failure.error
        );
    }
    persist(pipeline).await
}

fn print_documents(documents: &[RetrievedDocument]) {
    for doc in documents {
        println!(
            "{}. [{:.2}] {}",
            doc.rank,
            doc.score,
            doc.title.as_deref().unwrap_or(&doc.document_id)
        );
        if let Some(category) = &doc.category {
            println!("    category: {}", category);
        }
        if let Some(source) = &doc.source {
            println!("    source: {}", source);
        }
        let preview: String = doc.content.chars().take(120).collect();
        println!("    > {}", preview.replace('\n', " "));
    }
}

pub async fn run_query(pipeline: &Pipeline, question: &str, options: QueryOptions, stream: bool) -> Result<()> {
    if !stream {
        let result = pipeline.query(question, &options).await;
        println!("{}", result.answer);
        if !result.retrieved_documents.is_empty() {
            println!();
            println!("Sources:");
            print_documents(&result.retrieved_documents);
        }
        if result.degraded {
            eprintln!("(degraded answer: {:?}, stage {})", result.generation, result.stage);
        }
        return Ok(());
    }

    let mut events = pipeline.query_stream(question, options);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Status { message, .. } => eprintln!("{}", message),
            StreamEvent::Content { content } => {
                print!("{}", content);
                stdout.flush()?;
            }
            StreamEvent::Documents { documents } => {
                println!();
                if !documents.is_empty() {
                    println!();
                    println!("Sources:");
                    print_documents(&documents);
                }
            }
            StreamEvent::Complete { message, degraded } => {
                eprintln!("{}{}", message, if degraded { " (degraded)" } else { "" });
            }
            StreamEvent::Error { message } => bail!(message),
        }
    }
    Ok(())
}

/// Parse `role:content` message arguments.
pub fn parse_turns(messages: &[String]) -> Result<Vec<ChatTurn>> {
    messages
        .iter()
        .map(|m| match m.split_once(':') {
            Some((role, content)) if matches!(role, "user" | "assistant") => Ok(ChatTurn {
                role: role.to_string(),
                content: content.to_string(),
            }),
            _ => bail!("Invalid message '{}'. Expected user:<text> or assistant:<text>.", m),
        })
        .collect()
}

pub async fn run_chat(pipeline: &Pipeline, messages: &[String], top_k: Option<usize>) -> Result<()> {
    let turns = parse_turns(messages)?;
    let response = pipeline.chat(&turns, top_k).await;
    println!("{}", response.answer);
    if !response.retrieved_documents.is_empty() {
        println!();
        println!("Sources:");
        print_documents(&response.retrieved_documents);
    }
    Ok(())
}

pub async fn run_search(
    pipeline: &Pipeline,
    query: &str,
    mode: SearchType,
    top_k: usize,
    filters: RetrievalFilters,
) -> Result<()> {
    let results = pipeline.search(query, mode, top_k, &filters).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    let documents: Vec<RetrievedDocument> = results.iter().map(RetrievedDocument::from).collect();
    print_documents(&documents);
    Ok(())
}

/// Questions from a file: a JSON array of strings, or one question per line.
pub fn read_questions(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .with_context(|| format!("Invalid question array in {}", path.display()));
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

pub async fn run_batch(pipeline: &Pipeline, path: &Path, options: QueryOptions) -> Result<()> {
    let questions = read_questions(path)?;
    let results = pipeline.batch_query(&questions, &options).await;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

pub async fn run_stats(pipeline: &Pipeline) -> Result<()> {
    let stats = pipeline.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn run_documents(pipeline: &Pipeline, category: Option<&str>, source: Option<&str>) -> Result<()> {
    let docs = match (category, source) {
        (Some(c), _) => pipeline.documents_by_category(c).await?,
        (None, Some(s)) => pipeline.documents_by_source(s).await?,
        (None, None) => bail!("Pass --category or --source"),
    };
    if docs.is_empty() {
        println!("No documents.");
    }
    for doc in docs {
        println!(
            "{}  {}  ({} chunks)",
            doc.document_id,
            doc.title.as_deref().unwrap_or("-"),
            doc.chunks
        );
    }
    Ok(())
}

pub async fn run_show(pipeline: &Pipeline, document_id: &str) -> Result<()> {
    match pipeline.get_document(document_id).await? {
        Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
        None => println!("Document not found: {}", document_id),
    }
    Ok(())
}

pub async fn run_update(pipeline: &Pipeline, document_id: &str, patch: &MetadataPatch) -> Result<()> {
    if patch.is_empty() {
        bail!("Nothing to update. Pass --title, --category, --source, or --tag.");
    }
    let updated = pipeline.update_document(document_id, patch).await?;
    if updated == 0 {
        println!("Document not found: {}", document_id);
        return Ok(());
    }
    println!("Updated {} chunks of {}.", updated, document_id);
    persist(pipeline).await
}

pub async fn run_delete(pipeline: &Pipeline, document_id: &str) -> Result<()> {
    let removed = pipeline.delete_document(document_id).await?;
    if removed == 0 {
        println!("Document not found: {}", document_id);
        return Ok(());
    }
    println!("Removed {} chunks of {}.", removed, document_id);
    persist(pipeline).await
}

pub async fn run_clear(pipeline: &Pipeline) -> Result<()> {
    pipeline.clear().await?;
    println!("Index cleared.");
    persist(pipeline).await
}
