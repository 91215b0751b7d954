//! Background batch loading.
//!
//! Worker `w` of `N` collates batches `w, w + N, ...` and pushes them into a
//! bounded channel; the consumer reads the channels round-robin, so batches
//! arrive in sampler order while up to `N * prefetch` are prepared ahead.

use crate::data::batch::Batch;
use crate::data::dataset::TtsDataset;
use crate::data::sampler::batches;
use crate::perf::{self, Metric};
use anyhow::Result;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct DataLoader {
    dataset: Arc<TtsDataset>,
    batch_size: usize,
    workers: usize,
    prefetch: usize,
}

impl DataLoader {
    pub fn new(dataset: Arc<TtsDataset>, batch_size: usize, workers: usize, prefetch: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            prefetch: prefetch.max(1),
        }
    }

    pub fn dataset(&self) -> &TtsDataset {
        &self.dataset
    }

    /// Number of batches an epoch over `num_indices` items yields.
    pub fn num_batches(&self, num_indices: usize) -> usize {
        num_indices.div_ceil(self.batch_size)
    }

    /// Start loading one epoch in the given index order.
    pub fn epoch(&self, indices: &[usize]) -> EpochBatches {
        let plan = Arc::new(batches(indices, self.batch_size));
        let workers = self.workers.min(plan.len()).max(1);
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::sync_channel(self.prefetch);
            let dataset = Arc::clone(&self.dataset);
            let plan = Arc::clone(&plan);
            handles.push(std::thread::spawn(move || {
                for batch_indices in plan.iter().skip(worker).step_by(workers) {
                    let batch = dataset.collate(batch_indices);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }
        EpochBatches {
            receivers,
            handles,
            next: 0,
            remaining: plan.len(),
        }
    }
}

/// Iterator over one epoch's batches in sampler order.
pub struct EpochBatches {
    receivers: Vec<Receiver<Result<Batch>>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
    remaining: usize,
}

impl EpochBatches {
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let _span = perf::span(Metric::LoaderWait);
        let worker = self.next % self.receivers.len();
        self.next += 1;
        self.remaining -= 1;
        match self.receivers[worker].recv() {
            Ok(batch) => {
                if batch.is_err() {
                    self.remaining = 0;
                }
                Some(batch)
            }
            Err(_) => {
                self.remaining = 0;
                Some(Err(anyhow::anyhow!("loader worker {worker} stopped unexpectedly")))
            }
        }
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        // Closing the channels unblocks workers waiting on a full buffer.
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CharactersConfig;
    use crate::data::dataset::{parse_metadata, DatasetOptions, SpeakerSource};
    use crate::data::features::{save_features, Matrix};
    use crate::text::{SymbolTable, TextCleaner, TextFrontend};
    use std::fmt::Write;
    use tempfile::tempdir;

    #[test]
    fn batches_arrive_in_sampler_order_across_workers() {
        let dir = tempdir().expect("tempdir");
        let mut metadata = String::new();
        for idx in 0..7 {
            let name = format!("utt{idx}.safetensors");
            let mel = Matrix {
                rows: idx + 1,
                cols: 2,
                data: vec![idx as f32; (idx + 1) * 2],
            };
            save_features(&dir.path().join(&name), &mel, None).expect("save");
            // Text length grows with idx so the sorted order equals idx.
            let text = "a".repeat(idx + 1);
            let _ = writeln!(metadata, "{name}|{text}|spk");
        }
        let items = parse_metadata(dir.path(), &metadata).expect("parse");
        let frontend = TextFrontend::new(
            TextCleaner::Basic,
            SymbolTable::new(&CharactersConfig::default()),
            false,
        );
        let options = DatasetOptions {
            num_mels: 2,
            frame_multiple: 1,
            r: 1,
            min_seq_len: 0,
            max_seq_len: 100,
            speakers: SpeakerSource::None,
            audio: None,
        };
        let dataset = Arc::new(TtsDataset::new(items, &frontend, options).expect("dataset"));
        let loader = DataLoader::new(dataset, 2, 3, 1);

        let order = vec![6, 5, 4, 3, 2, 1, 0];
        let lengths: Vec<Vec<usize>> = loader
            .epoch(&order)
            .map(|batch| batch.expect("batch").mel_lengths)
            .collect();
        assert_eq!(lengths, vec![vec![7, 6], vec![5, 4], vec![3, 2], vec![1]]);
        assert_eq!(loader.num_batches(order.len()), 4);
    }
}
