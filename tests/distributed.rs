mod common;

use burn::module::Module;
use burn::optim::GradientsParams;
use burn::tensor::{Tensor, TensorData};
use burn_nn::LinearConfig;
use cadence::config::ModelKind;
use cadence::data::{DistributedSampler, Sampler};
use cadence::train::checkpoint::CheckpointTag;
use cadence::train::{run, DistributedCoordinator, LocalCollective, RunOptions};
use common::{device, tiny_config, write_dataset, TestBackend, TrainBackend};
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

fn on_ranks<T, F>(world: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(DistributedCoordinator) -> T + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let handles: Vec<_> = LocalCollective::group(world)
        .into_iter()
        .map(|collective| {
            let body = Arc::clone(&body);
            std::thread::spawn(move || body(DistributedCoordinator::new(Box::new(collective))))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread"))
        .collect()
}

#[test]
fn gradients_are_averaged_across_ranks() {
    let results = on_ranks(2, |coordinator| {
        let rank = coordinator.rank();
        let linear = LinearConfig::new(3, 2).init::<TrainBackend>(&device());
        let linear = coordinator
            .broadcast_parameters::<TrainBackend, _>(linear)
            .expect("broadcast");
        // d(sum(x W + b)) / dW = x for every output column.
        let value = (rank + 1) as f32;
        let input = Tensor::<TrainBackend, 2>::from_data(TensorData::new(vec![value; 3], [1, 3]), &device());
        let loss = linear.forward(input).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &linear);
        let grads = coordinator
            .sync_gradients::<TrainBackend, _>(&linear, grads)
            .expect("sync");
        let weight: Tensor<TestBackend, 2> = grads
            .get::<TestBackend, 2>(linear.weight.id)
            .expect("weight grad");
        weight.into_data().iter::<f32>().collect::<Vec<f32>>()
    });
    for grads in results {
        assert_eq!(grads.len(), 6);
        assert!(grads.iter().all(|g| (g - 1.5).abs() < 1e-6), "{grads:?}");
    }
}

#[test]
fn metrics_are_batch_weighted_means() {
    let results = on_ranks(2, |coordinator| {
        let (loss, batch) = if coordinator.rank() == 0 { (1.0, 4) } else { (3.0, 4) };
        coordinator
            .reduce_metrics(&[("loss", loss), ("align_error", 0.5)], batch)
            .expect("reduce")
    });
    for values in results {
        assert_eq!(values, vec![("loss", 2.0), ("align_error", 0.5)]);
    }
}

#[test]
fn samplers_partition_each_epoch() {
    for epoch in 0..3 {
        let mut seen = BTreeSet::new();
        let mut total = 0;
        for rank in 0..3 {
            let indices = DistributedSampler::new(10, rank, 3, 7, true).epoch_indices(epoch);
            total += indices.len();
            seen.extend(indices);
        }
        assert_eq!(total, 10);
        assert_eq!(seen, (0..10).collect::<BTreeSet<_>>());
    }
}

#[test]
fn uneven_split_trains_without_deadlock() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    // Rank 0 gets 3 items (2 batches), rank 1 gets 2 (1 batch).
    write_dataset(data.path(), 5, 2, None);
    let mut config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    config.training.save_step = 1;
    config.training.run_eval = false;
    config.distributed.world_size = 2;
    let run_dir = out.path().join("run");
    let options = Arc::new(RunOptions {
        config,
        out_path: Some(run_dir.clone()),
        restore_path: None,
        best_loss: f32::INFINITY,
    });

    let results = on_ranks(2, move |coordinator| {
        let mut options = (*options).clone();
        if coordinator.rank() != 0 {
            options.out_path = None;
        }
        run::<TrainBackend>(&options, coordinator, device(), &AtomicBool::new(false))
    });
    for result in results {
        result.expect("rank finished");
    }
    assert!(run_dir.join(CheckpointTag::Step(1).file_name()).exists());
    assert!(!run_dir.join(CheckpointTag::Step(2).file_name()).exists());
}
