//! Dataset metadata, feature files, batching, sampling and prefetching.

pub mod batch;
pub mod dataset;
pub mod features;
pub mod loader;
pub mod sampler;

pub use batch::{collate, sequence_mask, stop_labels, Batch, DeviceBatch};
pub use dataset::{
    apply_portion, load_meta_data, DatasetOptions, ExternalSpeakerEmbeddings, MetaItem,
    SpeakerMapping, SpeakerSource, TtsDataset,
};
pub use loader::{DataLoader, EpochBatches};
pub use sampler::{
    BucketSampler, DistributedSampler, Sampler, SequentialSampler, SpeakerBalancedSampler,
};
