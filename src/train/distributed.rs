//! Data-parallel coordination: rank bookkeeping, gradient averaging and
//! metric reduction over a [`Collective`].
//!
//! Three transports exist. [`SingleProcess`] is the identity. [`LocalCollective`]
//! connects ranks running as threads of one process. [`TcpCollective`] connects
//! one process per rank in a star around rank 0, which sums every buffer and
//! sends the result back. Every reduction is a blocking barrier: a rank that
//! never arrives stalls the others.

use crate::config::{DistributedBackend, DistributedConfig};
use crate::error::TrainError;
use crate::perf::{self, Metric};
use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const HANDSHAKE_MAGIC: &[u8; 4] = b"CDNC";
const CONNECT_ATTEMPTS: usize = 120;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Blocking all-reduce over `f32` buffers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Replace `buffer` with the elementwise sum of every rank's buffer.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), TrainError>;
}

/// A world of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<(), TrainError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sum: Vec<f32>,
    result: Vec<f32>,
}

#[derive(Debug)]
struct LocalShared {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

/// Ranks running as threads of the same process.
#[derive(Debug, Clone)]
pub struct LocalCollective {
    rank: usize,
    shared: Arc<LocalShared>,
}

impl LocalCollective {
    /// One handle per rank, all joined to the same group.
    pub fn group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(LocalShared {
            world_size,
            round: Mutex::new(Round::default()),
            done: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

fn poisoned<T>(_: T) -> TrainError {
    TrainError::Distributed("collective state poisoned by a failed rank".to_string())
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), TrainError> {
        let shared = &self.shared;
        let mut round = shared.round.lock().map_err(poisoned)?;
        if round.arrived == 0 {
            round.sum = vec![0.0; buffer.len()];
        } else if round.sum.len() != buffer.len() {
            return Err(TrainError::Distributed(format!(
                "rank {} reduced {} values, peers reduced {}",
                self.rank,
                buffer.len(),
                round.sum.len()
            )));
        }
        for (acc, value) in round.sum.iter_mut().zip(buffer.iter()) {
            *acc += *value;
        }
        round.arrived += 1;
        let generation = round.generation;
        if round.arrived == shared.world_size {
            round.result = std::mem::take(&mut round.sum);
            round.arrived = 0;
            round.generation += 1;
            shared.done.notify_all();
        } else {
            while round.generation == generation {
                round = shared.done.wait(round).map_err(poisoned)?;
            }
        }
        buffer.copy_from_slice(&round.result);
        Ok(())
    }
}

/// One process per rank; rank 0 accepts every peer and aggregates.
#[derive(Debug)]
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    /// Rank 0: one stream per peer, ordered by rank. Other ranks: the stream to rank 0.
    streams: Mutex<Vec<TcpStream>>,
}

fn net_error(context: &str, err: std::io::Error) -> TrainError {
    TrainError::Distributed(format!("{context}: {err}"))
}

fn write_handshake(stream: &mut TcpStream, group_id: &str, rank: usize) -> std::io::Result<()> {
    stream.write_all(HANDSHAKE_MAGIC)?;
    stream.write_all(&(group_id.len() as u32).to_le_bytes())?;
    stream.write_all(group_id.as_bytes())?;
    stream.write_all(&(rank as u32).to_le_bytes())?;
    stream.flush()
}

fn read_u32(stream: &mut TcpStream) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_handshake(stream: &mut TcpStream) -> Result<(String, usize), TrainError> {
    let mut magic = [0u8; 4];
    stream
        .read_exact(&mut magic)
        .map_err(|err| net_error("handshake", err))?;
    if &magic != HANDSHAKE_MAGIC {
        return Err(TrainError::Distributed("peer sent an unknown handshake".to_string()));
    }
    let len = read_u32(stream).map_err(|err| net_error("handshake", err))? as usize;
    let mut group = vec![0u8; len];
    stream
        .read_exact(&mut group)
        .map_err(|err| net_error("handshake", err))?;
    let rank = read_u32(stream).map_err(|err| net_error("handshake", err))? as usize;
    let group = String::from_utf8(group)
        .map_err(|_| TrainError::Distributed("group id is not UTF-8".to_string()))?;
    Ok((group, rank))
}

fn send_buffer(stream: &mut TcpStream, buffer: &[f32]) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(8 + buffer.len() * 4);
    bytes.extend_from_slice(&(buffer.len() as u64).to_le_bytes());
    for value in buffer {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    stream.write_all(&bytes)?;
    stream.flush()
}

fn recv_buffer(stream: &mut TcpStream) -> std::io::Result<Vec<f32>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;
    let mut bytes = vec![0u8; len * 4];
    stream.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// `tcp://host:port` → `host:port`.
pub fn parse_tcp_url(url: &str) -> Result<String, TrainError> {
    let address = url.strip_prefix("tcp://").unwrap_or(url);
    if address.rsplit_once(':').is_none() {
        return Err(TrainError::Config(format!(
            "distributed.url must look like tcp://host:port, got {url}"
        )));
    }
    Ok(address.to_string())
}

impl TcpCollective {
    /// Join the group at `url`. Rank 0 listens and waits for every peer;
    /// other ranks connect, retrying while rank 0 comes up.
    pub fn connect(url: &str, rank: usize, world_size: usize, group_id: &str) -> Result<Self, TrainError> {
        if rank >= world_size {
            return Err(TrainError::Config(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        let address = parse_tcp_url(url)?;
        let streams = if rank == 0 {
            let listener = TcpListener::bind(&address).map_err(|err| net_error("bind", err))?;
            let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            while peers.iter().any(Option::is_none) {
                let (mut stream, _) = listener.accept().map_err(|err| net_error("accept", err))?;
                let (group, peer_rank) = read_handshake(&mut stream)?;
                if group != group_id {
                    return Err(TrainError::Distributed(format!(
                        "peer joined group {group}, expected {group_id}"
                    )));
                }
                if peer_rank == 0 || peer_rank >= world_size || peers[peer_rank - 1].is_some() {
                    return Err(TrainError::Distributed(format!("unexpected peer rank {peer_rank}")));
                }
                stream.set_nodelay(true).map_err(|err| net_error("socket", err))?;
                peers[peer_rank - 1] = Some(stream);
            }
            peers.into_iter().flatten().collect()
        } else {
            let mut attempt = 0;
            let mut stream = loop {
                match TcpStream::connect(&address) {
                    Ok(stream) => break stream,
                    Err(err) if attempt + 1 < CONNECT_ATTEMPTS => {
                        tracing::debug!(rank, attempt, "waiting for rank 0: {err}");
                        attempt += 1;
                        std::thread::sleep(CONNECT_BACKOFF);
                    }
                    Err(err) => return Err(net_error("connect", err)),
                }
            };
            stream.set_nodelay(true).map_err(|err| net_error("socket", err))?;
            write_handshake(&mut stream, group_id, rank).map_err(|err| net_error("handshake", err))?;
            vec![stream]
        };
        tracing::info!(rank, world_size, "joined distributed group {group_id}");
        Ok(Self {
            rank,
            world_size,
            streams: Mutex::new(streams),
        })
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), TrainError> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        if self.rank == 0 {
            for stream in streams.iter_mut() {
                let peer = recv_buffer(stream).map_err(|err| net_error("receive", err))?;
                if peer.len() != buffer.len() {
                    return Err(TrainError::Distributed(format!(
                        "peer reduced {} values, rank 0 reduced {}",
                        peer.len(),
                        buffer.len()
                    )));
                }
                for (acc, value) in buffer.iter_mut().zip(peer) {
                    *acc += value;
                }
            }
            for stream in streams.iter_mut() {
                send_buffer(stream, buffer).map_err(|err| net_error("send", err))?;
            }
        } else {
            let stream = streams
                .first_mut()
                .ok_or_else(|| TrainError::Distributed("not connected to rank 0".to_string()))?;
            send_buffer(stream, buffer).map_err(|err| net_error("send", err))?;
            let reduced = recv_buffer(stream).map_err(|err| net_error("receive", err))?;
            if reduced.len() != buffer.len() {
                return Err(TrainError::Distributed("rank 0 returned a buffer of the wrong size".to_string()));
            }
            buffer.copy_from_slice(&reduced);
        }
        Ok(())
    }
}

/// Rank identity plus the reductions the training loop needs.
pub struct DistributedCoordinator {
    collective: Box<dyn Collective>,
}

impl DistributedCoordinator {
    pub fn new(collective: Box<dyn Collective>) -> Self {
        Self { collective }
    }

    pub fn single() -> Self {
        Self::new(Box::new(SingleProcess))
    }

    /// Build the transport named by `config` for one process-level rank.
    pub fn from_config(config: &DistributedConfig, rank: usize, group_id: &str) -> Result<Self, TrainError> {
        if config.world_size <= 1 {
            return Ok(Self::single());
        }
        match config.backend {
            DistributedBackend::Tcp => Ok(Self::new(Box::new(TcpCollective::connect(
                &config.url,
                rank,
                config.world_size,
                group_id,
            )?))),
            DistributedBackend::Local => Err(TrainError::Config(
                "the local backend is created per thread with LocalCollective::group".to_string(),
            )),
        }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Only rank 0 writes to the output folder.
    pub fn is_main(&self) -> bool {
        self.rank() == 0
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    /// Average every parameter gradient across ranks.
    pub fn sync_gradients<B, M>(&self, model: &M, grads: GradientsParams) -> Result<GradientsParams, TrainError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if self.world_size() <= 1 {
            return Ok(grads);
        }
        let _span = perf::span(Metric::GradAllReduce);
        sync_gradients(model, grads, self.collective())
    }

    /// Smallest `value` reported by any rank.
    pub fn min_across_ranks(&self, value: usize) -> Result<usize, TrainError> {
        let world = self.world_size();
        if world <= 1 {
            return Ok(value);
        }
        let mut slots = vec![0.0_f32; world];
        slots[self.rank()] = value as f32;
        self.collective.all_reduce_sum(&mut slots)?;
        Ok(slots.into_iter().fold(value as f32, f32::min) as usize)
    }

    /// Replace every rank's parameter values with rank 0's.
    pub fn broadcast_parameters<B, M>(&self, model: M) -> Result<M, TrainError>
    where
        B: Backend,
        M: Module<B>,
    {
        if self.world_size() <= 1 {
            return Ok(model);
        }
        broadcast_parameters(model, self.collective())
    }

    pub fn reduce_metrics(
        &self,
        values: &[(&'static str, f32)],
        batch_size: usize,
    ) -> Result<Vec<(&'static str, f32)>, TrainError> {
        reduce_metrics(values, batch_size, self.collective())
    }
}

/// Batch-size weighted mean of named metrics across ranks.
pub fn reduce_metrics(
    values: &[(&'static str, f32)],
    batch_size: usize,
    collective: &dyn Collective,
) -> Result<Vec<(&'static str, f32)>, TrainError> {
    if collective.world_size() <= 1 {
        return Ok(values.to_vec());
    }
    let _span = perf::span(Metric::MetricAllReduce);
    let weight = batch_size as f32;
    let mut buffer: Vec<f32> = values.iter().map(|(_, value)| value * weight).collect();
    buffer.push(weight);
    collective.all_reduce_sum(&mut buffer)?;
    let total = buffer.pop().unwrap_or(weight).max(f32::MIN_POSITIVE);
    Ok(values
        .iter()
        .zip(buffer)
        .map(|((name, _), sum)| (*name, sum / total))
        .collect())
}

/// Flattens every parameter gradient (zeros when absent) followed by one
/// presence flag per parameter.
struct GradientGather<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    values: Vec<f32>,
    present: Vec<f32>,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientGather<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let numel = param.val().dims().iter().product::<usize>();
        match self.grads.get::<B::InnerBackend, D>(param.id) {
            Some(grad) => {
                self.values.extend(grad.into_data().iter::<f32>());
                self.present.push(1.0);
            }
            None => {
                self.values.extend(std::iter::repeat(0.0).take(numel));
                self.present.push(0.0);
            }
        }
    }
}

/// Writes averaged gradients back in visiting order.
struct GradientScatter<'a, B: AutodiffBackend> {
    grads: GradientsParams,
    values: &'a [f32],
    present: &'a [f32],
    world_size: f32,
    offset: usize,
    index: usize,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScatter<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let dims = param.val().dims();
        let numel = dims.iter().product::<usize>();
        let slice = &self.values[self.offset..self.offset + numel];
        self.offset += numel;
        let present = self.present[self.index] > 0.0;
        self.index += 1;
        if !present {
            return;
        }
        let averaged: Vec<f32> = slice.iter().map(|v| v / self.world_size).collect();
        let device = param.device();
        let tensor = Tensor::<B::InnerBackend, D>::from_data(TensorData::new(averaged, dims), &device);
        self.grads.register::<B::InnerBackend, D>(param.id, tensor);
    }
}

fn sync_gradients<B, M>(model: &M, grads: GradientsParams, collective: &dyn Collective) -> Result<GradientsParams, TrainError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut gather = GradientGather::<B> {
        grads: &grads,
        values: Vec::new(),
        present: Vec::new(),
        _backend: std::marker::PhantomData,
    };
    model.visit(&mut gather);
    let GradientGather {
        mut values,
        mut present,
        ..
    } = gather;
    let split = values.len();
    values.append(&mut present);
    collective.all_reduce_sum(&mut values)?;
    let (values, present) = values.split_at(split);

    let mut scatter = GradientScatter::<B> {
        grads,
        values,
        present,
        world_size: collective.world_size() as f32,
        offset: 0,
        index: 0,
        _backend: std::marker::PhantomData,
    };
    model.visit(&mut scatter);
    Ok(scatter.grads)
}

struct ParamGather<B: Backend> {
    values: Vec<f32>,
    keep: bool,
    _backend: std::marker::PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamGather<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        if self.keep {
            self.values.extend(tensor.into_data().iter::<f32>());
        } else {
            let numel = tensor.dims().iter().product::<usize>();
            self.values.extend(std::iter::repeat(0.0).take(numel));
        }
    }
}

struct ParamScatter<'a, B: Backend> {
    values: &'a [f32],
    offset: usize,
    _backend: std::marker::PhantomData<B>,
}

impl<B: Backend> ModuleMapper<B> for ParamScatter<'_, B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let current = param.val();
        let dims = current.dims();
        let numel = dims.iter().product::<usize>();
        let slice = self.values[self.offset..self.offset + numel].to_vec();
        self.offset += numel;
        let mut tensor = Tensor::<B, D>::from_data(TensorData::new(slice, dims), &current.device());
        if current.is_require_grad() {
            tensor = tensor.require_grad();
        }
        Param::initialized(param.id, tensor)
    }
}

fn broadcast_parameters<B, M>(model: M, collective: &dyn Collective) -> Result<M, TrainError>
where
    B: Backend,
    M: Module<B>,
{
    let mut gather = ParamGather::<B> {
        values: Vec::new(),
        keep: collective.rank() == 0,
        _backend: std::marker::PhantomData,
    };
    model.visit(&mut gather);
    let mut values = gather.values;
    collective.all_reduce_sum(&mut values)?;
    let mut scatter = ParamScatter::<B> {
        values: &values,
        offset: 0,
        _backend: std::marker::PhantomData,
    };
    Ok(model.map(&mut scatter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_group_sums_across_threads() {
        let handles: Vec<_> = LocalCollective::group(3)
            .into_iter()
            .map(|collective| {
                std::thread::spawn(move || {
                    let mut results = Vec::new();
                    for round in 0..4 {
                        let mut buffer = vec![collective.rank() as f32 + round as f32, 1.0];
                        collective.all_reduce_sum(&mut buffer).expect("reduce");
                        results.push(buffer);
                    }
                    results
                })
            })
            .collect();
        for handle in handles {
            let results = handle.join().expect("thread");
            for (round, buffer) in results.iter().enumerate() {
                assert_eq!(buffer, &vec![3.0 + 3.0 * round as f32, 3.0]);
            }
        }
    }

    #[test]
    fn metrics_are_weighted_by_batch_size() {
        let handles: Vec<_> = LocalCollective::group(2)
            .into_iter()
            .map(|collective| {
                std::thread::spawn(move || {
                    let (value, batch) = if collective.rank() == 0 { (1.0, 3) } else { (5.0, 1) };
                    reduce_metrics(&[("loss", value)], batch, &collective).expect("reduce")
                })
            })
            .collect();
        for handle in handles {
            let reduced = handle.join().expect("thread");
            assert_eq!(reduced, vec![("loss", 2.0)]);
        }
    }

    #[test]
    fn single_process_is_identity() {
        let values = [("loss", 0.25_f32), ("stopnet_loss", 0.5)];
        assert_eq!(reduce_metrics(&values, 8, &SingleProcess).expect("reduce"), values.to_vec());
    }

    #[test]
    fn tcp_group_reduces_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let url = format!("tcp://127.0.0.1:{port}");
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let url = url.clone();
                std::thread::spawn(move || {
                    let collective = TcpCollective::connect(&url, rank, 2, "test-group").expect("connect");
                    let mut buffer = vec![rank as f32 + 1.0; 3];
                    collective.all_reduce_sum(&mut buffer).expect("reduce");
                    buffer
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("thread"), vec![3.0; 3]);
        }
    }

    #[test]
    fn broadcast_copies_rank_zero_parameters() {
        use burn_ndarray::{NdArray, NdArrayDevice};
        use burn_nn::LinearConfig;

        let handles: Vec<_> = LocalCollective::group(2)
            .into_iter()
            .map(|collective| {
                std::thread::spawn(move || {
                    let device = NdArrayDevice::default();
                    let linear = LinearConfig::new(3, 2).init::<NdArray<f32>>(&device);
                    let before: Vec<f32> = linear.weight.val().into_data().iter::<f32>().collect();
                    let synced = broadcast_parameters(linear, &collective).expect("broadcast");
                    let after: Vec<f32> = synced.weight.val().into_data().iter::<f32>().collect();
                    (collective.rank(), before, after)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("thread")).collect();
        let rank0 = results.iter().find(|(rank, _, _)| *rank == 0).expect("rank 0");
        for (_, _, after) in &results {
            assert_eq!(after, &rank0.1);
        }
    }

    #[test]
    fn ranks_agree_on_the_smallest_count() {
        let handles: Vec<_> = LocalCollective::group(3)
            .into_iter()
            .map(|collective| {
                std::thread::spawn(move || {
                    let coordinator = DistributedCoordinator::new(Box::new(collective));
                    let own = 10 + coordinator.rank();
                    coordinator.min_across_ranks(own).expect("min")
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("thread"), 10);
        }
    }

    #[test]
    fn url_parsing() {
        assert_eq!(parse_tcp_url("tcp://10.0.0.1:54321").expect("url"), "10.0.0.1:54321");
        assert!(parse_tcp_url("tcp://nohost").is_err());
    }
}
