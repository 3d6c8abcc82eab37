//! CLI for training microgpt from scratch.

use std::path::PathBuf;
use std::sync::Arc;

use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use microgpt_common::{BatchCursor, TokenStore, TrainConfig};
use microgpt_core::{GptConfig, MicroGpt};
use microgpt_train::{Compute, SingleProcess, TcpWorkerGroup, Trainer, WorkerGroup};

#[derive(Parser, Debug)]
#[command(name = "microgpt-train", about = "Train a small GPT from scratch")]
struct Args {
    /// Training config JSON; created with defaults if missing.
    #[arg(long, default_value = "train.json")]
    config: PathBuf,
    /// Model config JSON; created with defaults if missing.
    #[arg(long, default_value = "model.json")]
    model_config: PathBuf,
    /// Text file/directory, or a pre-tokenised .tokens file.
    #[arg(long)]
    data: PathBuf,
    /// tokenizer.json; required unless --data is a .tokens file.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    #[arg(long, default_value = "16")]
    batch_size: usize,
    /// Force CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let train_config = load_or_init(&args.config, TrainConfig::load, TrainConfig::save)?;
    train_config.validate()?;
    let model_config = load_or_init(&args.model_config, GptConfig::load, GptConfig::save)?;

    let compute = if args.cpu {
        Compute::from_device(candle_core::Device::Cpu)
    } else {
        Compute::detect()?
    };

    // Worker topology from the launcher environment; single-process when absent.
    let group: Arc<dyn WorkerGroup> = match TcpWorkerGroup::from_env()? {
        Some(g) => Arc::new(g),
        None => Arc::new(SingleProcess),
    };
    if group.is_main() {
        eprintln!(
            "workers: {} (rank {}), device: {}",
            group.world_size(),
            group.rank(),
            compute.execution_path()
        );
    }

    let store = if args.data.extension().map(|e| e == "tokens").unwrap_or(false) {
        TokenStore::open_tokenized(&args.data)?
    } else {
        let tokenizer = args
            .tokenizer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--tokenizer is required for text data"))?;
        TokenStore::from_text(&args.data, tokenizer)?
    };
    if group.is_main() {
        eprintln!("loaded {} tokens", store.num_tokens());
    }
    let source = BatchCursor::new(store, args.batch_size, model_config.seq_len)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, compute.autocast_dtype(), compute.device());
    let model = MicroGpt::new(&model_config, vb)?;

    let mut trainer = Trainer::new(model, varmap, source, train_config, compute, group)?;
    trainer.train()?;

    eprintln!("training done");
    Ok(())
}

fn load_or_init<C: Default>(
    path: &PathBuf,
    load: impl Fn(&std::path::Path) -> anyhow::Result<C>,
    save: impl Fn(&C, &std::path::Path) -> anyhow::Result<()>,
) -> anyhow::Result<C> {
    if path.exists() {
        load(path)
    } else {
        let default = C::default();
        save(&default, path)?;
        eprintln!("created default config at {}", path.display());
        Ok(default)
    }
}
