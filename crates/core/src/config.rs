//! Model hyper-parameters for the reference transformer.

use serde::{Deserialize, Serialize};

/// Configuration for [`MicroGpt`](crate::MicroGpt).
///
/// Stored as JSON next to the training config. Missing fields fall back to
/// their defaults, so a minimal `{}` produces a working (if small) model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GptConfig {
    /// Vocabulary size (must match tokeniser).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Hidden size (model dimension).
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    /// Number of attention heads.
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    /// Number of decoder blocks.
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    /// Maximum (and training-time) sequence length.
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vocab_size() -> usize {
    50_257 // GPT-2 tokeniser
}
fn default_n_embd() -> usize {
    384
}
fn default_n_head() -> usize {
    6
}
fn default_n_layer() -> usize {
    6
}
fn default_seq_len() -> usize {
    256
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            n_embd: default_n_embd(),
            n_head: default_n_head(),
            n_layer: default_n_layer(),
            seq_len: default_seq_len(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl GptConfig {
    /// Head dimension (`n_embd / n_head`). Panics if not divisible.
    pub fn head_dim(&self) -> usize {
        assert!(
            self.n_embd % self.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            self.n_embd,
            self.n_head,
        );
        self.n_embd / self.n_head
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = GptConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: GptConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.vocab_size, loaded.vocab_size);
        assert_eq!(config.n_embd, loaded.n_embd);
        assert_eq!(config.seq_len, loaded.seq_len);
    }

    #[test]
    fn config_head_dim() {
        let config = GptConfig {
            n_embd: 384,
            n_head: 6,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 64);
    }
}
