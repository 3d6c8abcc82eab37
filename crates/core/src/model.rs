//! Reference decoder-only transformer.
//!
//! Deliberately plain: token + learned position embeddings, pre-norm blocks
//! with multi-head causal self-attention and a GELU MLP, weight-tied LM
//! head. The training loop is generic over
//! [`SequenceModel`](microgpt_common::SequenceModel); this is the model the
//! binaries instantiate.

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use microgpt_common::SequenceModel;

use crate::config::GptConfig;

/// Multi-head causal self-attention with a fused Q/K/V projection.
struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CausalSelfAttention {
    fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.n_embd;
        let c_attn = linear(hidden, 3 * hidden, vb.pp("c_attn"))?;
        let c_proj = linear(hidden, hidden, vb.pp("c_proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.n_head,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        // Fused QKV projection
        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        // Scaled dot-product attention with causal mask
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let neg_inf = Tensor::tril2(t, DType::F32, x.device())?
            .affine(1e9, -1e9)?
            .reshape((1, 1, t, t))?
            .to_dtype(scores.dtype())?;
        let scores = scores.broadcast_add(&neg_inf)?;

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?; // (b, t, heads, head_dim)
        let y = y.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}

/// Position-wise MLP: expand 4x, GELU, project back.
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.n_embd;
        Ok(Self {
            c_fc: linear(hidden, 4 * hidden, vb.pp("c_fc"))?,
            c_proj: linear(4 * hidden, hidden, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu()?)
    }
}

/// One pre-norm decoder block.
struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.layer_norm_eps, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: layer_norm(config.n_embd, config.layer_norm_eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }
}

/// The reference model: a small GPT.
///
/// The LM head is weight-tied to the token embedding, so the embedding
/// matrix is the only rank-2 tensor shared between input and output.
pub struct MicroGpt {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: GptConfig,
}

impl MicroGpt {
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.seq_len, config.n_embd, vb.pp("wpe"))?;
        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::new(config, vb.pp(format!("h.{i}")))?);
        }
        let ln_f = layer_norm(config.n_embd, config.layer_norm_eps, vb.pp("ln_f"))?;
        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Logits over the vocabulary: `(batch, seq_len, vocab)`.
    pub fn logits(&self, inputs: &Tensor) -> Result<Tensor> {
        let (_b, t) = inputs.dims2()?;
        if t > self.config.seq_len {
            candle_core::bail!(
                "sequence length {} exceeds model maximum {}",
                t,
                self.config.seq_len
            );
        }
        let positions = Tensor::arange(0u32, t as u32, inputs.device())?;
        let tok = self.wte.forward(inputs)?;
        let pos = self.wpe.forward(&positions)?;
        let mut x = tok.broadcast_add(&pos)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = self.ln_f.forward(&x)?;
        // Weight-tied head
        x.broadcast_matmul(&self.wte.embeddings().t()?)
    }
}

impl SequenceModel for MicroGpt {
    fn forward(&self, inputs: &Tensor, _targets: &Tensor) -> Result<Tensor> {
        self.logits(inputs)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
