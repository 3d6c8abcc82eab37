//! Worker group, collective reduction, and the data-parallel replica.
//!
//! Topology is data-parallel only: every worker holds an identical model
//! replica and a disjoint batch shard, and the workers meet at exactly two
//! points per iteration — gradient averaging on the final micro-step and
//! loss averaging before logging. The collective is a barrier, so all
//! workers advance through iterations in lockstep.
//!
//! The TCP backend keeps one persistent connection per worker to rank 0,
//! which gathers, averages, and broadcasts. Frames are a u32 LE element
//! count followed by f32 LE values.

use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use microgpt_common::SequenceModel;

/// How long a worker keeps retrying its connection to rank 0.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ── WorkerGroup ─────────────────────────────────────────────────────────────

/// The worker-group collaborator: fixed topology plus one collective.
///
/// Established once at startup and read-only afterwards. `all_reduce_avg`
/// must leave every worker holding the same element-wise average of all
/// workers' inputs, and must not return on any worker until every worker
/// has contributed.
pub trait WorkerGroup: Send + Sync {
    fn rank(&self) -> usize;
    fn local_rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Only the main worker prints and writes the log file.
    fn is_main(&self) -> bool {
        self.rank() == 0
    }
    fn all_reduce_avg(&self, values: &mut [f32]) -> Result<()>;
}

/// Single-worker topology: every collective is the identity.
pub struct SingleProcess;

impl WorkerGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }
    fn local_rank(&self) -> usize {
        0
    }
    fn world_size(&self) -> usize {
        1
    }
    fn all_reduce_avg(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

enum Links {
    /// Rank 0: one stream per peer, index `rank - 1`.
    Root(Vec<TcpStream>),
    /// Everyone else: the stream to rank 0.
    Leaf(TcpStream),
}

/// TCP-backed worker group with rank 0 as the reduction root.
pub struct TcpWorkerGroup {
    rank: usize,
    local_rank: usize,
    world_size: usize,
    links: Mutex<Links>,
}

impl TcpWorkerGroup {
    /// Build the group from the launcher-provided environment
    /// (`RANK`, `LOCAL_RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT`).
    ///
    /// Returns `None` when `WORLD_SIZE` is absent or 1, in which case the
    /// caller should run single-process.
    pub fn from_env() -> Result<Option<Self>> {
        let world_size: usize = match env::var("WORLD_SIZE") {
            Ok(v) => v.parse().context("parse WORLD_SIZE")?,
            Err(_) => return Ok(None),
        };
        if world_size <= 1 {
            return Ok(None);
        }
        let rank: usize = env::var("RANK")
            .context("RANK must be set when WORLD_SIZE > 1")?
            .parse()
            .context("parse RANK")?;
        let local_rank: usize = match env::var("LOCAL_RANK") {
            Ok(v) => v.parse().context("parse LOCAL_RANK")?,
            Err(_) => rank,
        };
        let host = env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("MASTER_PORT").unwrap_or_else(|_| "29500".to_string());
        let group = Self::connect(rank, local_rank, world_size, &format!("{host}:{port}"))?;
        Ok(Some(group))
    }

    /// Join the group at `addr`. Rank 0 listens and accepts its peers; the
    /// others connect (retrying while rank 0 comes up) and announce their
    /// rank.
    pub fn connect(rank: usize, local_rank: usize, world_size: usize, addr: &str) -> Result<Self> {
        if world_size < 2 {
            bail!("TcpWorkerGroup needs world_size >= 2, got {world_size}");
        }
        if rank >= world_size {
            bail!("rank {rank} out of range for world_size {world_size}");
        }

        let links = if rank == 0 {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("bind reduction root {addr}"))?;
            let mut slots: Vec<Option<TcpStream>> = Vec::new();
            slots.resize_with(world_size - 1, || None);
            for _ in 1..world_size {
                let (mut stream, _) = listener.accept().context("accept worker")?;
                stream.set_nodelay(true)?;
                let mut rank_buf = [0u8; 4];
                stream.read_exact(&mut rank_buf).context("read peer rank")?;
                let peer = u32::from_le_bytes(rank_buf) as usize;
                if peer == 0 || peer >= world_size {
                    bail!("peer announced invalid rank {peer}");
                }
                if slots[peer - 1].is_some() {
                    bail!("rank {peer} joined twice");
                }
                slots[peer - 1] = Some(stream);
            }
            let streams = slots
                .into_iter()
                .map(|s| s.context("missing worker connection"))
                .collect::<Result<Vec<_>>>()?;
            Links::Root(streams)
        } else {
            let deadline = Instant::now() + CONNECT_TIMEOUT;
            let mut stream = loop {
                match TcpStream::connect(addr) {
                    Ok(s) => break s,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("connect reduction root {addr}"))
                    }
                }
            };
            stream.set_nodelay(true)?;
            stream
                .write_all(&(rank as u32).to_le_bytes())
                .context("announce rank")?;
            Links::Leaf(stream)
        };

        Ok(Self {
            rank,
            local_rank,
            world_size,
            links: Mutex::new(links),
        })
    }
}

impl WorkerGroup for TcpWorkerGroup {
    fn rank(&self) -> usize {
        self.rank
    }
    fn local_rank(&self) -> usize {
        self.local_rank
    }
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_avg(&self, values: &mut [f32]) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        match &mut *links {
            Links::Root(streams) => {
                // Gather: the read from each peer is the barrier.
                let mut sum: Vec<f64> = values.iter().map(|&v| v as f64).collect();
                for stream in streams.iter_mut() {
                    let contribution = read_frame(stream, values.len())?;
                    for (acc, v) in sum.iter_mut().zip(contribution) {
                        *acc += v as f64;
                    }
                }
                let scale = 1.0 / self.world_size as f64;
                for (out, acc) in values.iter_mut().zip(sum) {
                    *out = (acc * scale) as f32;
                }
                // Broadcast the average back.
                for stream in streams.iter_mut() {
                    write_frame(stream, values)?;
                }
            }
            Links::Leaf(stream) => {
                write_frame(stream, values)?;
                let reduced = read_frame(stream, values.len())?;
                values.copy_from_slice(&reduced);
            }
        }
        Ok(())
    }
}

fn write_frame(stream: &mut TcpStream, values: &[f32]) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + values.len() * 4);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&buf).context("send frame")?;
    stream.flush().context("flush frame")?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream, expected: usize) -> Result<Vec<f32>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).context("recv frame len")?;
    let n = u32::from_le_bytes(len_buf) as usize;
    if n != expected {
        bail!("all-reduce frame length mismatch: expected {expected}, got {n}");
    }
    let mut data = vec![0u8; n * 4];
    stream.read_exact(&mut data).context("recv frame data")?;
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

// ── Loss reduction ──────────────────────────────────────────────────────────

/// Average the iteration loss across workers.
///
/// Identity when `world_size == 1`. Runs after all micro-steps and before
/// clipping and the optimizer step, so the logged loss is the global
/// average rather than one worker's shard view.
pub fn reduce_loss(group: &dyn WorkerGroup, loss: f32) -> Result<f32> {
    if group.world_size() == 1 {
        return Ok(loss);
    }
    let mut buf = [loss];
    group.all_reduce_avg(&mut buf)?;
    Ok(buf[0])
}

// ── Replica ─────────────────────────────────────────────────────────────────

/// Data-parallel wrapper around the model replica.
///
/// Carries the gradient-sync flag the orchestrator toggles per micro-step:
/// gradients accumulate locally and cross the wire once per iteration, on
/// the final micro-step only. One all-reduce per micro-step would buy
/// nothing but bandwidth.
pub struct Replica<M> {
    model: M,
    group: Arc<dyn WorkerGroup>,
    grad_sync: bool,
}

impl<M: SequenceModel> Replica<M> {
    pub fn new(model: M, group: Arc<dyn WorkerGroup>) -> Self {
        Self {
            model,
            group,
            grad_sync: true,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn forward(&self, inputs: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        self.model.forward(inputs, targets)
    }

    /// Enable gradient synchronization for the next backward pass.
    pub fn set_grad_sync(&mut self, enabled: bool) {
        self.grad_sync = enabled;
    }

    pub fn grad_sync(&self) -> bool {
        self.grad_sync
    }

    /// Average the accumulated gradients across the group, in a fixed
    /// parameter order. No-op unless the sync flag is set and the group has
    /// peers.
    pub fn sync_grads(&self, grads: &mut GradStore, vars: &[(String, Var)]) -> Result<()> {
        if !self.grad_sync || self.group.world_size() == 1 {
            return Ok(());
        }
        for (_, var) in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let dims = grad.dims().to_vec();
                let dtype = grad.dtype();
                let mut flat = grad
                    .flatten_all()?
                    .to_dtype(DType::F32)?
                    .to_vec1::<f32>()?;
                self.group.all_reduce_avg(&mut flat)?;
                let synced = Tensor::from_vec(flat, dims, grad.device())?.to_dtype(dtype)?;
                grads.insert(var.as_tensor(), synced);
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_reduce_is_identity() {
        let group = SingleProcess;
        assert_eq!(group.world_size(), 1);
        assert!(group.is_main());
        assert_eq!(reduce_loss(&group, 2.5).unwrap(), 2.5);
    }

    #[test]
    fn tcp_all_reduce_averages_across_two_workers() {
        // Grab a free port, then race both ranks at it; the leaf retries
        // until the root has bound.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{port}");

        let addr_leaf = addr.clone();
        let leaf = std::thread::spawn(move || {
            let group = TcpWorkerGroup::connect(1, 1, 2, &addr_leaf).unwrap();
            let loss = reduce_loss(&group, 4.0).unwrap();
            let mut vec = [1.0f32, 2.0, 3.0];
            group.all_reduce_avg(&mut vec).unwrap();
            (loss, vec)
        });

        let root = TcpWorkerGroup::connect(0, 0, 2, &addr).unwrap();
        assert!(root.is_main());
        let root_loss = reduce_loss(&root, 2.0).unwrap();
        let mut root_vec = [3.0f32, 2.0, 1.0];
        root.all_reduce_avg(&mut root_vec).unwrap();

        let (leaf_loss, leaf_vec) = leaf.join().unwrap();
        // Both workers observe the same global average.
        assert_eq!(root_loss, 3.0);
        assert_eq!(leaf_loss, 3.0);
        assert_eq!(root_vec, [2.0, 2.0, 2.0]);
        assert_eq!(leaf_vec, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn replica_sync_skips_single_worker_groups() {
        struct NullModel;
        impl SequenceModel for NullModel {
            fn forward(&self, inputs: &Tensor, _targets: &Tensor) -> candle_core::Result<Tensor> {
                Ok(inputs.clone())
            }
        }
        let mut replica = Replica::new(NullModel, Arc::new(SingleProcess));
        replica.set_grad_sync(false);
        assert!(!replica.grad_sync());
        replica.set_grad_sync(true);
        assert!(replica.grad_sync());

        // With world_size == 1 the sync is a no-op even when enabled.
        let var = Var::zeros((2, 2), DType::F32, &candle_core::Device::Cpu).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        replica
            .sync_grads(&mut grads, &[("w".to_string(), var)])
            .unwrap();
    }
}
