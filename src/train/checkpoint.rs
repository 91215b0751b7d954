//! Checkpoint persistence.
//!
//! A checkpoint is one safetensors file. Model parameters are stored as `f32`
//! tensors under their module path (`decoder.stopnet.weight`), the optimizer
//! record as a `u8` tensor named [`OPTIMIZER_TENSOR`], and everything else
//! (step, epoch, reduction factor, date, loss, parameter identities,
//! scheduler and scaler state) as JSON under the [`METADATA_KEY`] metadata key.
//!
//! Files are written next to their final name, synced, then renamed, so a
//! crash leaves either the previous file or the new one.

use crate::error::TrainError;
use crate::perf::{self, Metric};
use crate::train::scaler::ScalerState;
use crate::train::scheduler::SchedulerState;
use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const METADATA_KEY: &str = "cadence";
pub const OPTIMIZER_TENSOR: &str = "__optimizer__";
pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
pub const BEST_MODEL: &str = "best_model.safetensors";
const EXTENSION: &str = "safetensors";

/// Everything about a checkpoint except its tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub epoch: usize,
    pub r: usize,
    pub date: String,
    pub loss: f32,
    /// Parameter path to the identity the optimizer record is keyed by.
    pub param_ids: BTreeMap<String, u64>,
    pub scheduler: Option<SchedulerState>,
    pub scaler: Option<ScalerState>,
}

/// Training progress saved alongside the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    pub step: usize,
    pub epoch: usize,
    pub r: usize,
    pub loss: f32,
    pub scheduler: Option<SchedulerState>,
    pub scaler: Option<ScalerState>,
}

/// Which file a save goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    /// `checkpoint_<step>.safetensors`, subject to pruning.
    Step(usize),
    /// `best_model.safetensors`, overwritten on improvement.
    Best,
}

impl CheckpointTag {
    pub fn file_name(self) -> String {
        match self {
            CheckpointTag::Step(step) => format!("{CHECKPOINT_PREFIX}{step}.{EXTENSION}"),
            CheckpointTag::Best => BEST_MODEL.to_string(),
        }
    }
}

/// How a checkpoint matched the model it was loaded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Every parameter restored along with its identity.
    FullMatch,
    /// Only parameters with the same path and shape were copied.
    PartialMatch {
        missing: Vec<String>,
        mismatched: Vec<String>,
        unexpected: Vec<String>,
    },
}

impl LoadOutcome {
    pub fn is_full(&self) -> bool {
        matches!(self, LoadOutcome::FullMatch)
    }
}

/// A model with checkpoint values applied.
#[derive(Debug)]
pub struct LoadedCheckpoint<M> {
    pub model: M,
    pub meta: CheckpointMeta,
    pub outcome: LoadOutcome,
    /// Serialized optimizer record; only handed back on a full match.
    pub optimizer: Option<Vec<u8>>,
}

struct NamedTensor {
    name: String,
    id: ParamId,
    shape: Vec<usize>,
    values: Option<Vec<f32>>,
}

/// Collects parameter paths, shapes and optionally values.
struct ParamCollector<B: Backend> {
    path: Vec<String>,
    with_values: bool,
    seen: BTreeSet<String>,
    tensors: Vec<NamedTensor>,
    _backend: PhantomData<B>,
}

impl<B: Backend> ParamCollector<B> {
    fn new(with_values: bool) -> Self {
        Self {
            path: Vec::new(),
            with_values,
            seen: BTreeSet::new(),
            tensors: Vec::new(),
            _backend: PhantomData,
        }
    }
}

fn unique_name(path: &[String], seen: &mut BTreeSet<String>) -> String {
    let base = if path.is_empty() { "param".to_string() } else { path.join(".") };
    let mut name = base.clone();
    let mut suffix = 1;
    while !seen.insert(name.clone()) {
        name = format!("{base}.{suffix}");
        suffix += 1;
    }
    name
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let name = unique_name(&self.path, &mut self.seen);
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        let values = self
            .with_values
            .then(|| tensor.into_data().iter::<f32>().collect());
        self.tensors.push(NamedTensor {
            name,
            id: param.id,
            shape,
            values,
        });
    }
}

struct StoredTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

/// Replaces parameter values by path.
struct ParamApplier<'a, B: Backend> {
    path: Vec<String>,
    seen: BTreeSet<String>,
    stored: &'a HashMap<String, StoredTensor>,
    /// Saved identities to restore; `None` keeps the model's own.
    ids: Option<&'a BTreeMap<String, u64>>,
    skip: &'a [String],
    applied: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> ModuleMapper<B> for ParamApplier<'_, B> {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let name = unique_name(&self.path, &mut self.seen);
        if self.skip.iter().any(|fragment| name.contains(fragment.as_str())) {
            return param;
        }
        let Some(stored) = self.stored.get(&name) else {
            return param;
        };
        let current = param.val();
        if stored.shape != current.dims().to_vec() {
            return param;
        }
        let track = current.is_require_grad();
        let mut tensor = Tensor::<B, D>::from_data(
            TensorData::new(stored.values.clone(), current.dims()),
            &current.device(),
        );
        if track {
            tensor = tensor.require_grad();
        }
        let id = self
            .ids
            .and_then(|ids| ids.get(&name))
            .map_or(param.id, |id| ParamId::from(*id));
        self.applied += 1;
        Param::initialized(id, tensor)
    }
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> TrainError {
    TrainError::Checkpoint(format!("{}: {err}", path.display()))
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Parse only the metadata header of a checkpoint.
pub fn read_meta(path: &Path) -> Result<CheckpointMeta, TrainError> {
    let bytes = fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(|err| checkpoint_error(path, err))?;
    let json = metadata
        .metadata()
        .as_ref()
        .and_then(|map| map.get(METADATA_KEY))
        .ok_or_else(|| checkpoint_error(path, "missing training metadata"))?;
    serde_json::from_str(json).map_err(|err| checkpoint_error(path, err))
}

/// Writes and restores checkpoints inside one output folder.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist model, optimizer and training state under `tag`.
    pub fn save<B, M, O>(
        &self,
        tag: CheckpointTag,
        model: &M,
        optimizer: &O,
        state: &TrainingState,
    ) -> Result<PathBuf, TrainError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let _span = perf::span(Metric::CheckpointSave);
        let path = self.dir.join(tag.file_name());
        let optimizer_bytes = Recorder::<B>::record(
            &BinBytesRecorder::<FullPrecisionSettings>::default(),
            optimizer.to_record(),
            (),
        )
        .map_err(|err| checkpoint_error(&path, err))?;
        write_checkpoint::<B, M>(&path, model, Some(&optimizer_bytes), state)?;
        tracing::info!("Checkpoint saved to {}", path.display());
        if let CheckpointTag::Step(_) = tag {
            self.prune()?;
        }
        Ok(path)
    }

    /// Overwrite `best_model` when `state.loss` beats `best_loss`.
    /// Returns the new best loss.
    pub fn save_if_best<B, M, O>(
        &self,
        best_loss: f32,
        model: &M,
        optimizer: &O,
        state: &TrainingState,
    ) -> Result<f32, TrainError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if !state.loss.is_finite() || state.loss >= best_loss {
            return Ok(best_loss);
        }
        tracing::info!(
            "Target loss improved from {best_loss:.5} to {:.5}, saving best model",
            state.loss
        );
        self.save(CheckpointTag::Best, model, optimizer, state)?;
        Ok(state.loss)
    }

    /// Keep only the newest `keep` step checkpoints.
    fn prune(&self) -> Result<(), TrainError> {
        let mut steps: Vec<(usize, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter_map(|path| step_of(&path).map(|step| (step, path)))
            .collect();
        steps.sort_by_key(|(step, _)| *step);
        let excess = steps.len().saturating_sub(self.keep);
        for (_, path) in steps.into_iter().take(excess) {
            tracing::debug!("Pruning {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Restore parameters from `path` into `model`.
    ///
    /// A full structural match with no `reinit` fragments restores every
    /// parameter with its saved identity and hands back the optimizer record.
    /// Otherwise parameters whose path and shape agree are copied (except
    /// those containing a `reinit` fragment) and the rest keep their fresh
    /// values. A checkpoint sharing no parameter with the model is incompatible.
    pub fn load<B, M>(path: &Path, model: M, reinit: &[String]) -> Result<LoadedCheckpoint<M>, TrainError>
    where
        B: Backend,
        M: Module<B>,
    {
        let _span = perf::span(Metric::CheckpointLoad);
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|err| checkpoint_error(path, err))?;
        let meta = read_meta(path)?;

        let mut stored = HashMap::new();
        let mut optimizer = None;
        for (name, view) in tensors.tensors() {
            if name == OPTIMIZER_TENSOR {
                optimizer = Some(view.data().to_vec());
                continue;
            }
            if view.dtype() != Dtype::F32 {
                return Err(checkpoint_error(path, format!("{name} is {:?}, expected F32", view.dtype())));
            }
            stored.insert(
                name,
                StoredTensor {
                    shape: view.shape().to_vec(),
                    values: decode_f32(view.data()),
                },
            );
        }

        let mut collector = ParamCollector::<B>::new(false);
        model.visit(&mut collector);
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        let mut known = BTreeSet::new();
        for tensor in &collector.tensors {
            known.insert(tensor.name.clone());
            match stored.get(&tensor.name) {
                None => missing.push(tensor.name.clone()),
                Some(saved) if saved.shape != tensor.shape => mismatched.push(tensor.name.clone()),
                Some(_) => {}
            }
        }
        let mut unexpected: Vec<String> = stored
            .keys()
            .filter(|name| !known.contains(*name))
            .cloned()
            .collect();
        unexpected.sort();

        let structural = missing.is_empty() && mismatched.is_empty() && unexpected.is_empty();
        let full = structural && reinit.is_empty();
        let mut applier = ParamApplier::<B> {
            path: Vec::new(),
            seen: BTreeSet::new(),
            stored: &stored,
            ids: full.then_some(&meta.param_ids),
            skip: reinit,
            applied: 0,
            _backend: PhantomData,
        };
        let model = model.map(&mut applier);
        if applier.applied == 0 && !collector.tensors.is_empty() {
            return Err(TrainError::IncompatibleCheckpoint {
                path: path.to_path_buf(),
                reason: "no parameter matches by name and shape".to_string(),
            });
        }

        let outcome = if full {
            tracing::info!("Restored all {} parameters from {}", stored.len(), path.display());
            LoadOutcome::FullMatch
        } else {
            tracing::warn!(
                "Partial restore from {}: {} applied, {} missing, {} mismatched, {} unexpected",
                path.display(),
                applier.applied,
                missing.len(),
                mismatched.len(),
                unexpected.len()
            );
            LoadOutcome::PartialMatch {
                missing,
                mismatched,
                unexpected,
            }
        };
        Ok(LoadedCheckpoint {
            model,
            meta,
            optimizer: if full { optimizer } else { None },
            outcome,
        })
    }

    /// Newest checkpoint in `dir` by modification time.
    pub fn latest_in(dir: &Path) -> Result<Option<PathBuf>, TrainError> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !is_checkpoint(&path) {
                continue;
            }
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Loss recorded in `dir`'s best model, if there is one.
    pub fn best_loss_in(dir: &Path) -> Result<Option<f32>, TrainError> {
        let path = dir.join(BEST_MODEL);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_meta(&path)?.loss))
    }
}

/// Restore an optimizer from the bytes handed back by a full-match load.
pub fn restore_optimizer<B, M, O>(optimizer: O, bytes: Vec<u8>, device: &B::Device) -> Result<O, TrainError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record = Recorder::<B>::load(&BinBytesRecorder::<FullPrecisionSettings>::default(), bytes, device)
        .map_err(|err| TrainError::Checkpoint(format!("optimizer record: {err}")))?;
    Ok(optimizer.load_record(record))
}

fn write_checkpoint<B, M>(
    path: &Path,
    model: &M,
    optimizer: Option<&[u8]>,
    state: &TrainingState,
) -> Result<(), TrainError>
where
    B: Backend,
    M: Module<B>,
{
    let mut collector = ParamCollector::<B>::new(true);
    model.visit(&mut collector);

    let meta = CheckpointMeta {
        step: state.step,
        epoch: state.epoch,
        r: state.r,
        date: chrono::Local::now().to_rfc3339(),
        loss: state.loss,
        param_ids: collector
            .tensors
            .iter()
            .map(|tensor| (tensor.name.clone(), tensor.id.val()))
            .collect(),
        scheduler: state.scheduler,
        scaler: state.scaler,
    };
    let meta_json = serde_json::to_string(&meta).map_err(|err| checkpoint_error(path, err))?;

    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = collector
        .tensors
        .into_iter()
        .map(|tensor| {
            let bytes = encode_f32(tensor.values.as_deref().unwrap_or_default());
            (tensor.name, tensor.shape, bytes)
        })
        .collect();
    let mut views: HashMap<String, TensorView<'_>> = HashMap::new();
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes).map_err(|err| checkpoint_error(path, err))?;
        views.insert(name.clone(), view);
    }
    if let Some(bytes) = optimizer {
        let view = TensorView::new(Dtype::U8, vec![bytes.len()], bytes).map_err(|err| checkpoint_error(path, err))?;
        views.insert(OPTIMIZER_TENSOR.to_string(), view);
    }
    let metadata = Some(HashMap::from([(METADATA_KEY.to_string(), meta_json)]));
    let serialized = safetensors::serialize(&views, &metadata).map_err(|err| checkpoint_error(path, err))?;

    let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Save parameters only, without optimizer state.
pub fn save_model<B: Backend, M: Module<B>>(path: &Path, model: &M, state: &TrainingState) -> Result<(), TrainError> {
    write_checkpoint::<B, M>(path, model, None, state)
}

fn step_of(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(&format!(".{EXTENSION}"))?
        .parse()
        .ok()
}

fn is_checkpoint(path: &Path) -> bool {
    step_of(path).is_some() || path.file_name().is_some_and(|name| name == BEST_MODEL)
}
