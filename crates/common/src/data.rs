//! Data pipeline: tokenisation, token stores, cycling batch cursor.
//!
//! The training loop runs a fixed number of iterations per epoch, so its
//! batch source must never run dry: [`BatchCursor`] wraps a [`TokenStore`]
//! and cycles back to the start of the token stream whenever the remaining
//! tail cannot fill another batch. `reset` rewinds the cursor at epoch start.
//!
//! * **[`TokenStore`]** — tokenised corpus, in memory or zero-copy via `memmap2`.
//! * **[`BatchCursor`]** — the [`BatchSource`] the trainer draws from.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use tokenizers::Tokenizer;

// ── Tokenized binary format ──────────────────────────────────────────────────

/// Magic bytes for the tokenized binary format.
const TOKENIZED_MAGIC: &[u8; 4] = b"TKN1";
/// Header size: magic (4) + num_tokens (8).
const TOKENIZED_HEADER_LEN: usize = 4 + 8;

/// Write a pre-tokenised sequence to a binary file for use with
/// [`TokenStore::open_tokenized`].
///
/// Format: magic "TKN1" (4 bytes), `num_tokens` as u64 LE (8 bytes), then
/// `num_tokens` × u32 LE. No other metadata.
pub fn write_tokenized_file(path: &Path, token_ids: &[u32]) -> AnyhowResult<()> {
    let mut f = File::create(path).context("create tokenized file")?;
    f.write_all(TOKENIZED_MAGIC)?;
    f.write_all(&(token_ids.len() as u64).to_le_bytes())?;
    for &id in token_ids {
        f.write_all(&id.to_le_bytes())?;
    }
    f.sync_all().context("sync tokenized file")?;
    Ok(())
}

// ── TokenStore ──────────────────────────────────────────────────────────────

enum Backing {
    Memory(Vec<u32>),
    Mmap { mmap: Mmap, num_tokens: usize },
}

/// A tokenised corpus, indexable by token position.
///
/// Either fully in memory (tokenised from text at load time) or zero-copy
/// over a pre-tokenised binary file, in which case only the pages touched
/// by each batch are paged in.
pub struct TokenStore {
    backing: Backing,
}

impl TokenStore {
    /// Wrap an already-tokenised id sequence.
    pub fn from_tokens(token_ids: Vec<u32>) -> Self {
        Self {
            backing: Backing::Memory(token_ids),
        }
    }

    /// Tokenise all text under `path` (file or directory of .txt/.jsonl/.json/.raw)
    /// with the given `tokenizer.json`.
    pub fn from_text(path: &Path, tokenizer_path: &Path) -> AnyhowResult<Self> {
        let tokenizer =
            Tokenizer::from_file(tokenizer_path.as_os_str().to_string_lossy().to_string())
                .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
        let mut token_ids = Vec::new();
        for file in collect_files(path)? {
            let reader = BufReader::new(File::open(&file).context("open text file")?);
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let text = extract_text(line);
                let enc = tokenizer
                    .encode(text.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
                token_ids.extend(enc.get_ids());
            }
        }
        Ok(Self::from_tokens(token_ids))
    }

    /// Open a pre-tokenised binary file (see [`write_tokenized_file`]) zero-copy.
    pub fn open_tokenized(path: &Path) -> AnyhowResult<Self> {
        let file = File::open(path).context("open tokenized file for mmap")?;
        let mmap = unsafe { Mmap::map(&file).context("mmap tokenized file")? };
        if mmap.len() < TOKENIZED_HEADER_LEN {
            anyhow::bail!("tokenized file too short");
        }
        if &mmap[0..4] != TOKENIZED_MAGIC {
            anyhow::bail!("invalid tokenized file: bad magic");
        }
        let num_tokens = u64::from_le_bytes(mmap[4..12].try_into().unwrap()) as usize;
        let expected_len = TOKENIZED_HEADER_LEN + num_tokens * 4;
        if mmap.len() < expected_len {
            anyhow::bail!(
                "tokenized file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        Ok(Self {
            backing: Backing::Mmap { mmap, num_tokens },
        })
    }

    /// Total number of tokens in the store.
    pub fn num_tokens(&self) -> usize {
        match &self.backing {
            Backing::Memory(ids) => ids.len(),
            Backing::Mmap { num_tokens, .. } => *num_tokens,
        }
    }

    /// Token id at position `index`. Caller keeps `index < num_tokens()`.
    #[inline]
    pub fn token_at(&self, index: usize) -> u32 {
        match &self.backing {
            Backing::Memory(ids) => ids[index],
            Backing::Mmap { mmap, .. } => {
                let i = TOKENIZED_HEADER_LEN + index * 4;
                u32::from_le_bytes(mmap[i..i + 4].try_into().unwrap())
            }
        }
    }
}

// ── BatchSource ─────────────────────────────────────────────────────────────

/// The batch-loading collaborator the trainer draws from.
///
/// `next_batch` must be callable indefinitely; implementations cycle or
/// reshuffle internally. `reset` rewinds the read position at epoch start.
pub trait BatchSource {
    /// Next `(input_ids, labels)` batch, each `batch_size * seq_len` ids,
    /// labels shifted one position ahead of inputs.
    fn next_batch(&mut self) -> AnyhowResult<(Vec<u32>, Vec<u32>)>;
    /// Rewind the read position to the start of the data.
    fn reset(&mut self);
    /// Examples per batch.
    fn batch_size(&self) -> usize;
    /// Tokens per example.
    fn seq_len(&self) -> usize;
}

/// Sequential cursor over a [`TokenStore`], wrapping to the start whenever
/// the remaining tail cannot fill another full batch.
///
/// Deterministic: no shuffling, so two epochs over the same store draw the
/// same batch sequence.
pub struct BatchCursor {
    store: TokenStore,
    batch_size: usize,
    seq_len: usize,
    pos: usize,
}

impl BatchCursor {
    /// The store must hold at least one full batch plus the shifted label.
    pub fn new(store: TokenStore, batch_size: usize, seq_len: usize) -> AnyhowResult<Self> {
        let span = batch_size * seq_len;
        if span == 0 {
            anyhow::bail!("batch_size and seq_len must be positive");
        }
        if store.num_tokens() < span + 1 {
            anyhow::bail!(
                "token store too small: {} tokens cannot fill a {} x {} batch",
                store.num_tokens(),
                batch_size,
                seq_len
            );
        }
        Ok(Self {
            store,
            batch_size,
            seq_len,
            pos: 0,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.store.num_tokens()
    }
}

impl BatchSource for BatchCursor {
    fn next_batch(&mut self) -> AnyhowResult<(Vec<u32>, Vec<u32>)> {
        let span = self.batch_size * self.seq_len;
        if self.pos + span + 1 > self.store.num_tokens() {
            self.pos = 0;
        }
        let mut input_batch = Vec::with_capacity(span);
        let mut label_batch = Vec::with_capacity(span);
        for b in 0..self.batch_size {
            let base = self.pos + b * self.seq_len;
            for i in 0..self.seq_len {
                input_batch.push(self.store.token_at(base + i));
                label_batch.push(self.store.token_at(base + i + 1));
            }
        }
        self.pos += span;
        Ok((input_batch, label_batch))
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn seq_len(&self) -> usize {
        self.seq_len
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch of `(input_ids, labels)` to Candle tensors.
pub fn batch_to_tensors(
    input_ids: &[u32],
    labels: &[u32],
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let input = Tensor::from_vec(input_ids.to_vec(), (batch_size, seq_len), device)?;
    let labels = Tensor::from_vec(labels.to_vec(), (batch_size, seq_len), device)?;
    Ok((input, labels))
}

/// Collect text/JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> AnyhowResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    if path.is_file() {
        out.push(path.to_path_buf());
    } else if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|e| e == "jsonl" || e == "json" || e == "txt" || e == "raw")
                        .unwrap_or(false)
            })
            .collect();
        entries.sort();
        out = entries;
    } else {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    }
    Ok(out)
}

/// Extract text from a line: supports plain text, JSONL with `"text"`,
/// or JSONL with `"input"` + `"output"`.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
            if let (Some(inp), Some(out)) = (
                v.get("input").and_then(|x| x.as_str()),
                v.get("output").and_then(|x| x.as_str()),
            ) {
                return format!("{inp}\n{out}");
            }
        }
    }
    line.to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────
