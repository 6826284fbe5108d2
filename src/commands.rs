//! Implementations of the `rh` subcommands.
//!
//! Results go to stdout; progress and diagnostics go through `tracing` to
//! stderr.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use rag_harness_core::models::{Document, DocumentStatus, SimilarityResult, SourceFormat};
use rag_harness_core::search::{MergeStrategy, SearchMode};

use crate::config::Config;
use crate::ingest::IngestRequest;
use crate::migrate;
use crate::pipeline::Pipeline;
use crate::retrieve::RetrievalQuery;
use crate::tools::{ToolExecutionRequest, ToolGateway, ToolRegistry};

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}.", config.db.path.display());
    Ok(())
}

/// Expand directories (recursively) into the files they contain whose
/// extension maps to a known format. Explicit file paths are kept as is.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.with_context(|| format!("walking {}", path.display()))?;
                if entry.file_type().is_file() && has_known_extension(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn has_known_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(SourceFormat::from_extension)
        .is_some()
}

pub async fn run_ingest(
    config: &Config,
    paths: &[PathBuf],
    format: Option<SourceFormat>,
) -> Result<()> {
    let files = collect_files(paths)?;
    if files.is_empty() {
        println!("Nothing to ingest.");
        return Ok(());
    }

    let mut requests = Vec::with_capacity(files.len());
    for file in &files {
        let mut request = IngestRequest::from_path(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        if let Some(format) = format {
            request = request.with_format(format);
        }
        requests.push(request);
    }

    let pipeline = Pipeline::from_config(config).await?;
    let outcomes = pipeline.ingestor.ingest_many(requests).await;

    let mut failed = 0;
    for (name, outcome) in &outcomes {
        match outcome {
            Ok(report) => {
                println!(
                    "ok      {} ({}, {} chunks{})",
                    name,
                    report.format,
                    report.chunk_count,
                    if report.replaced { ", replaced" } else { "" }
                );
                for warning in &report.warnings {
                    println!("        warning: {}", warning);
                }
            }
            Err(e) => {
                failed += 1;
                println!("failed  {}: {}", name, e);
            }
        }
    }
    println!();
    println!(
        "Ingested {} of {} document(s).",
        outcomes.len() - failed,
        outcomes.len()
    );

    if failed > 0 {
        bail!("{} document(s) failed to ingest", failed);
    }
    Ok(())
}

pub struct SearchArgs {
    pub query: String,
    pub top_k: Option<usize>,
    pub mode: SearchMode,
    pub documents: Vec<String>,
    pub threshold: Option<f64>,
    pub context: bool,
    pub max_per_document: Option<usize>,
    pub dedupe: bool,
    pub merge_strategy: Option<MergeStrategy>,
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let query = RetrievalQuery {
        text: args.query,
        top_k: args.top_k,
        document_ids: (!args.documents.is_empty()).then_some(args.documents),
        mode: args.mode,
        min_score: args.threshold,
        with_context: args.context,
        max_per_document: args.max_per_document,
        dedupe: args.dedupe,
        merge_strategy: args.merge_strategy,
    };

    let results = pipeline.retriever.retrieve(&query).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &SimilarityResult) {
    println!(
        "{}. [{:.2}] {} (chunk {})",
        rank, result.score, result.document_name, result.chunk_index
    );
    if let Some(section) = result.metadata.get("section").and_then(|s| s.as_str()) {
        println!("    section: {}", section);
    }
    if let Some(page) = result.metadata.get("page") {
        println!("    page: {}", page);
    }
    if let Some(before) = result.context.as_ref().and_then(|c| c.before.as_deref()) {
        println!("    before: \"{}\"", excerpt(before));
    }
    println!("    excerpt: \"{}\"", excerpt(&result.text));
    if let Some(after) = result.context.as_ref().and_then(|c| c.after.as_deref()) {
        println!("    after: \"{}\"", excerpt(after));
    }
    println!("    document: {}", result.document_id);
    println!();
}

fn excerpt(text: &str) -> String {
    const MAX_CHARS: usize = 240;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(MAX_CHARS).collect();
        format!("{}…", cut)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub async fn run_documents_list(config: &Config, status: Option<DocumentStatus>) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let documents = pipeline.index.list_documents(status).await?;
    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in &documents {
        println!(
            "{}  {:<10} {:>6} chunks  {:<8}  {}",
            doc.id,
            doc.status.as_str(),
            doc.chunk_count,
            doc.format.as_str(),
            doc.name
        );
    }
    Ok(())
}

/// Resolve an id, falling back to an exact name match.
async fn find_document(pipeline: &Pipeline, id_or_name: &str) -> Result<Option<Document>> {
    if let Some(doc) = pipeline.index.get_document(id_or_name).await? {
        return Ok(Some(doc));
    }
    Ok(pipeline.index.find_document_by_name(id_or_name).await?)
}

pub async fn run_documents_show(config: &Config, id_or_name: &str, chunks: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let Some(doc) = find_document(&pipeline, id_or_name).await? else {
        bail!("document not found: {}", id_or_name);
    };

    println!("--- Document ---");
    println!("id:          {}", doc.id);
    println!("name:        {}", doc.name);
    println!("format:      {}", doc.format);
    println!("size_bytes:  {}", doc.size_bytes);
    println!("ingested_at: {}", format_ts_iso(doc.ingested_at));
    println!("status:      {}", doc.status);
    if let Some(ref error) = doc.error {
        println!("error:       {}", error);
    }
    println!("chunks:      {}", doc.chunk_count);
    println!("metadata:    {}", doc.metadata);

    if chunks {
        let stored = pipeline.index.get_chunks(&doc.id, 0..=i64::MAX).await?;
        println!();
        println!("--- Chunks ({}) ---", stored.len());
        for chunk in &stored {
            println!(
                "[chunk {}] {}..{} {}",
                chunk.chunk_index, chunk.start_offset, chunk.end_offset, chunk.metadata
            );
            println!("{}", chunk.text);
            println!();
        }
    }
    Ok(())
}

pub async fn run_documents_delete(config: &Config, id_or_name: &str) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let Some(doc) = find_document(&pipeline, id_or_name).await? else {
        bail!("document not found: {}", id_or_name);
    };
    if pipeline.ingestor.delete_document(&doc.id).await? {
        println!("Deleted {} ({}).", doc.name, doc.id);
    } else {
        println!("Document {} was already gone.", doc.id);
    }
    Ok(())
}

pub fn run_tools_list(config: &Config) -> Result<()> {
    let registry = ToolRegistry::with_builtins(&config.retrieval);
    for def in registry.definitions() {
        println!("{:<20} {}", def.name, def.description);
    }
    Ok(())
}

/// Run one tool and print its [`ToolExecutionResult`](crate::tools::ToolExecutionResult)
/// as JSON. A failed call exits with status 1 after printing.
pub async fn run_tools_call(config: &Config, name: &str, args: Option<&str>) -> Result<()> {
    let arguments = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON")?,
        None => serde_json::Value::Null,
    };

    let pipeline = Pipeline::from_config(config).await?;
    let gateway = ToolGateway::with_builtins(std::sync::Arc::new(pipeline));
    let result = gateway
        .execute(ToolExecutionRequest::new(name, arguments))
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
