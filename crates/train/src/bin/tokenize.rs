//! Pre-tokenise text data into a .tokens binary for mmap-backed training.

use std::path::PathBuf;

use clap::Parser;

use microgpt_common::{write_tokenized_file, TokenStore};

#[derive(Parser, Debug)]
#[command(name = "microgpt-tokenize", about = "Pre-tokenise text into a .tokens file")]
struct Args {
    /// Text file or directory (.txt/.jsonl/.json/.raw).
    #[arg(long)]
    data: PathBuf,
    /// tokenizer.json (e.g. GPT-2 BPE).
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long, default_value = "data.tokens")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let store = TokenStore::from_text(&args.data, &args.tokenizer)?;
    eprintln!("tokenised {} tokens", store.num_tokens());

    let ids: Vec<u32> = (0..store.num_tokens()).map(|i| store.token_at(i)).collect();
    write_tokenized_file(&args.output, &ids)?;
    eprintln!("wrote {}", args.output.display());
    Ok(())
}
