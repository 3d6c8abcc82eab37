//! End-to-end checks of the training loop on CPU: accumulation scaling,
//! epoch reset, log format, and a smoke run with the reference model.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor, Var};
use candle_nn::{loss, VarBuilder, VarMap};

use microgpt_common::{BatchCursor, BatchSource, SequenceModel, TokenStore, TrainConfig};
use microgpt_core::{GptConfig, MicroGpt};
use microgpt_train::{accumulate_grads, Compute, SingleProcess, Trainer};

/// A parameter-free model emitting uniform logits: every micro-batch has
/// loss exactly ln(vocab), which makes the mean-vs-sum distinction visible
/// in the logged loss.
struct UniformModel {
    vocab: usize,
}

impl SequenceModel for UniformModel {
    fn forward(&self, inputs: &Tensor, _targets: &Tensor) -> CandleResult<Tensor> {
        let (b, t) = inputs.dims2()?;
        Tensor::zeros((b, t, self.vocab), DType::F32, inputs.device())
    }
}

/// One broadcast logit vector as the only parameter; its gradient under
/// cross-entropy is known in closed form.
struct BiasModel {
    w: Var,
    vocab: usize,
}

impl SequenceModel for BiasModel {
    fn forward(&self, inputs: &Tensor, _targets: &Tensor) -> CandleResult<Tensor> {
        let (b, t) = inputs.dims2()?;
        self.w
            .as_tensor()
            .broadcast_as((b, t, self.vocab))?
            .contiguous()
    }
}

fn cycling_source(tokens: usize, vocab: u32, batch_size: usize, seq_len: usize) -> BatchCursor {
    let store = TokenStore::from_tokens((0..tokens as u32).map(|i| i % vocab).collect());
    BatchCursor::new(store, batch_size, seq_len).unwrap()
}

fn test_config(name: &str, max_iters: usize, grad_accum_iters: usize) -> TrainConfig {
    TrainConfig {
        n_epochs: 1,
        warmup_iters: 0,
        max_iters,
        grad_accum_iters,
        max_lr: 0.1,
        min_lr: 0.01,
        weight_decay: 0.1,
        grad_clip: 1.0,
        eval_every: 500,
        monitor: false,
        log_dir: std::env::temp_dir().join(format!("microgpt-{name}-{}", std::process::id())),
    }
}

fn read_log(log_dir: &PathBuf) -> Vec<String> {
    let text = std::fs::read_to_string(log_dir.join("log.txt")).unwrap();
    text.lines().map(|l| l.to_string()).collect()
}

fn parse_loss(line: &str) -> f32 {
    line.rsplit(':').next().unwrap().trim().parse().unwrap()
}

#[test]
fn accumulated_loss_is_the_mean_of_micro_losses() {
    // Four micro-batches, each with loss ln(4): a sum would log 4·ln(4),
    // the required mean logs ln(4).
    let config = test_config("mean-loss", 2, 4);
    let log_dir = config.log_dir.clone();
    let source = cycling_source(64, 4, 2, 3);
    let model = UniformModel { vocab: 4 };

    let mut trainer = Trainer::new(
        model,
        VarMap::new(),
        source,
        config,
        Compute::from_device(Device::Cpu),
        Arc::new(SingleProcess),
    )
    .unwrap();
    trainer.train().unwrap();

    let lines = read_log(&log_dir);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("epoch 0 | iter 0 | train loss: "));
    assert!(lines[1].starts_with("epoch 0 | iter 1 | train loss: "));
    let expected = (4.0f32).ln();
    for line in &lines {
        assert!((parse_loss(line) - expected).abs() < 1e-4);
    }
    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[test]
fn accumulated_gradient_equals_gradient_of_the_mean_loss() {
    // Micro path: 4 scaled backwards merged with accumulate_grads.
    // Reference path: one backward over the concatenated batch.
    let device = Device::Cpu;
    let vocab = 4usize;
    let targets: Vec<u32> = vec![0, 1, 2, 3, 1, 0, 3, 2];
    let micro_batches: Vec<&[u32]> = targets.chunks(2).collect();

    let var = Var::zeros((1, 1, vocab), DType::F32, &device).unwrap();
    let vars = vec![("w".to_string(), var.clone())];

    let mut acc: Option<candle_core::backprop::GradStore> = None;
    for chunk in &micro_batches {
        let t = chunk.len();
        let logits = var
            .as_tensor()
            .broadcast_as((1, t, vocab))
            .unwrap()
            .contiguous()
            .unwrap()
            .reshape((t, vocab))
            .unwrap();
        let target = Tensor::from_vec(chunk.to_vec(), (t,), &device).unwrap();
        let micro_loss = loss::cross_entropy(&logits, &target).unwrap();
        let scaled = micro_loss
            .affine(1.0 / micro_batches.len() as f64, 0.0)
            .unwrap();
        let grads = scaled.backward().unwrap();
        match acc.as_mut() {
            None => acc = Some(grads),
            Some(store) => accumulate_grads(store, &grads, &vars).unwrap(),
        }
    }
    let acc = acc.unwrap();
    let micro_grad = acc
        .get(var.as_tensor())
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();

    let n = targets.len();
    let logits = var
        .as_tensor()
        .broadcast_as((1, n, vocab))
        .unwrap()
        .contiguous()
        .unwrap()
        .reshape((n, vocab))
        .unwrap();
    let target = Tensor::from_vec(targets.clone(), (n,), &device).unwrap();
    let full_loss = loss::cross_entropy(&logits, &target).unwrap();
    let full_grads = full_loss.backward().unwrap();
    let full_grad = full_grads
        .get(var.as_tensor())
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();

    for (m, f) in micro_grad.iter().zip(&full_grad) {
        assert!((m - f).abs() < 1e-6, "micro {m} vs full {f}");
    }
}

#[test]
fn optimizer_moves_the_target_logit_up() {
    // All targets are token 0, so the mean-loss gradient on the logit
    // vector is softmax - onehot(0): negative at 0, positive elsewhere.
    let device = Device::Cpu;
    let config = test_config("step-direction", 1, 4);
    let log_dir = config.log_dir.clone();

    let varmap = VarMap::new();
    varmap
        .get(
            (1, 1, 4),
            "logit_bias",
            candle_nn::init::ZERO,
            DType::F32,
            &device,
        )
        .unwrap();
    let w = varmap
        .data()
        .lock()
        .unwrap()
        .get("logit_bias")
        .unwrap()
        .clone();
    let model = BiasModel { w, vocab: 4 };

    let store = TokenStore::from_tokens(vec![0u32; 64]);
    let source = BatchCursor::new(store, 2, 3).unwrap();
    let mut trainer = Trainer::new(
        model,
        varmap,
        source,
        config,
        Compute::from_device(Device::Cpu),
        Arc::new(SingleProcess),
    )
    .unwrap();
    trainer.train().unwrap();

    let after = trainer
        .model()
        .w
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(after[0] > 0.0, "target logit must rise, got {after:?}");
    for &other in &after[1..] {
        assert!(other < 0.0, "competing logits must fall, got {after:?}");
    }
    std::fs::remove_dir_all(&log_dir).unwrap();
}

/// Wraps a cursor and records the first batch drawn after every reset.
struct RecordingSource {
    inner: BatchCursor,
    first_after_reset: Rc<RefCell<Vec<Vec<u32>>>>,
    fresh: bool,
}

impl BatchSource for RecordingSource {
    fn next_batch(&mut self) -> anyhow::Result<(Vec<u32>, Vec<u32>)> {
        let batch = self.inner.next_batch()?;
        if self.fresh {
            self.first_after_reset.borrow_mut().push(batch.0.clone());
            self.fresh = false;
        }
        Ok(batch)
    }
    fn reset(&mut self) {
        self.inner.reset();
        self.fresh = true;
    }
    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }
    fn seq_len(&self) -> usize {
        self.inner.seq_len()
    }
}

#[test]
fn every_epoch_starts_from_the_same_batch() {
    let mut config = test_config("epoch-reset", 3, 1);
    config.n_epochs = 2;
    config.warmup_iters = 1;
    let log_dir = config.log_dir.clone();

    let recorded = Rc::new(RefCell::new(Vec::new()));
    let source = RecordingSource {
        inner: cycling_source(64, 4, 2, 3),
        first_after_reset: Rc::clone(&recorded),
        fresh: false,
    };

    let mut trainer = Trainer::new(
        UniformModel { vocab: 4 },
        VarMap::new(),
        source,
        config,
        Compute::from_device(Device::Cpu),
        Arc::new(SingleProcess),
    )
    .unwrap();
    trainer.train().unwrap();

    let recorded = recorded.borrow();
    assert_eq!(recorded.len(), 2, "one reset per epoch");
    assert_eq!(recorded[0], recorded[1]);

    // Two epochs of three iterations each, logged in order.
    let lines = read_log(&log_dir);
    assert_eq!(lines.len(), 6);
    assert!(lines[2].starts_with("epoch 0 | iter 2 |"));
    assert!(lines[3].starts_with("epoch 1 | iter 0 |"));
    std::fs::remove_dir_all(&log_dir).unwrap();
}

#[test]
fn reference_model_trains_end_to_end() {
    let device = Device::Cpu;
    let config = test_config("smoke", 2, 2);
    let log_dir = config.log_dir.clone();

    let model_config = GptConfig {
        vocab_size: 13,
        n_embd: 16,
        n_head: 4,
        n_layer: 1,
        seq_len: 4,
        layer_norm_eps: 1e-5,
    };
    let compute = Compute::from_device(device.clone());
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, compute.autocast_dtype(), compute.device());
    let model = MicroGpt::new(&model_config, vb).unwrap();

    let source = cycling_source(128, 13, 2, model_config.seq_len);
    let mut trainer = Trainer::new(
        model,
        varmap,
        source,
        config,
        compute,
        Arc::new(SingleProcess),
    )
    .unwrap();
    trainer.train().unwrap();

    let lines = read_log(&log_dir);
    assert_eq!(lines.len(), 2);
    for line in &lines {
        let loss = parse_loss(line);
        assert!(loss.is_finite() && loss > 0.0);
    }
    std::fs::remove_dir_all(&log_dir).unwrap();
}
