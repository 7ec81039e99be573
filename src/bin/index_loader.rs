use anyhow::{Context, Result};
use clap::Parser;
use docvoice::config::{build_retriever, DocumentArgs, EmbeddingArgs, RetrievalArgs, SearchArgs};
use docvoice::logging;

#[derive(Parser, Debug)]
#[command(
    name = "index_loader",
    about = "Chunk, embed and load the earnings document into its Azure AI Search index"
)]
struct LoaderCli {
    /// Delete and recreate the index before loading
    #[arg(long, env = "INDEX_REBUILD", default_value_t = false)]
    rebuild: bool,

    #[command(flatten)]
    document: DocumentArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = LoaderCli::parse();
    let retriever = build_retriever(&cli.embedding, &cli.search, &cli.retrieval)
        .context("invalid retrieval settings")?;

    let source = cli.document.source();
    let text = source
        .text()
        .await
        .with_context(|| format!("failed to read {}", source.path().display()))?;
    anyhow::ensure!(
        !text.trim().is_empty(),
        "no text could be extracted from {}",
        source.path().display()
    );

    let outcome = if cli.rebuild {
        retriever.rebuild(text, source.document_id()).await
    } else {
        retriever.ensure_index_and_load(text, source.document_id()).await
    }
    .with_context(|| {
        format!(
            "failed to load {} into index {}",
            source.document_id(),
            retriever.index_name()
        )
    })?;

    if outcome.loaded {
        println!(
            "Loaded {} chunk{} of {} into {}.",
            outcome.chunk_count,
            if outcome.chunk_count == 1 { "" } else { "s" },
            source.document_id(),
            retriever.index_name()
        );
    } else {
        println!(
            "{} already indexed in {} ({} chunks); nothing to do.",
            source.document_id(),
            retriever.index_name(),
            outcome.chunk_count
        );
    }
    Ok(())
}
