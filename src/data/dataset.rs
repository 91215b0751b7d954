//! Metadata loading, speaker bookkeeping and the in-memory dataset.

use crate::audio::AudioProcessor;
use crate::config::{resolve_relative_path, DataConfig, DatasetConfig};
use crate::data::batch::{collate, Batch, Sample};
use crate::data::features::load_features;
use crate::perf::{self, Metric};
use crate::text::TextFrontend;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Speaker name used when a metadata line has no third column.
pub const DEFAULT_SPEAKER: &str = "default";

/// One metadata line: `feature_path|text|speaker`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaItem {
    pub text: String,
    pub feature_path: PathBuf,
    pub speaker: String,
}

/// Parse one metadata file. Feature paths are resolved against `root`.
pub fn parse_metadata(root: &Path, contents: &str) -> Result<Vec<MetaItem>> {
    let mut items = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut columns = line.split('|');
        let (Some(path), Some(text)) = (columns.next(), columns.next()) else {
            anyhow::bail!("metadata line {} has fewer than two columns", line_no + 1);
        };
        let speaker = columns
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SPEAKER);
        items.push(MetaItem {
            text: text.trim().to_string(),
            feature_path: resolve_relative_path(root, path.trim()),
            speaker: speaker.to_string(),
        });
    }
    Ok(items)
}

/// Load training and evaluation items for every configured dataset.
///
/// Datasets without an evaluation file donate `eval_split_size` items of a
/// seeded shuffle of their training list.
pub fn load_meta_data(
    datasets: &[DatasetConfig],
    eval_split_size: usize,
    seed: u64,
) -> Result<(Vec<MetaItem>, Vec<MetaItem>)> {
    let mut train = Vec::new();
    let mut eval = Vec::new();
    for dataset in datasets {
        let root = PathBuf::from(&dataset.path);
        let train_path = resolve_relative_path(&root, &dataset.meta_file_train);
        let contents = fs::read_to_string(&train_path)
            .with_context(|| format!("reading {}", train_path.display()))?;
        let mut items = parse_metadata(&root, &contents)?;

        match &dataset.meta_file_val {
            Some(val_file) => {
                let val_path = resolve_relative_path(&root, val_file);
                let contents = fs::read_to_string(&val_path)
                    .with_context(|| format!("reading {}", val_path.display()))?;
                eval.extend(parse_metadata(&root, &contents)?);
            }
            None => {
                let split = eval_split_size.min(items.len().saturating_sub(1));
                items.shuffle(&mut StdRng::seed_from_u64(seed));
                eval.extend(items.split_off(items.len() - split));
            }
        }
        tracing::info!(
            "Dataset {}: {} train items, {} eval items so far",
            dataset.path,
            items.len(),
            eval.len()
        );
        train.extend(items);
    }
    Ok((train, eval))
}

/// Keep the first `ceil(len * portion)` items.
pub fn apply_portion(items: &mut Vec<MetaItem>, portion: Option<f32>) {
    if let Some(portion) = portion {
        let keep = ((items.len() as f32) * portion).ceil() as usize;
        items.truncate(keep.max(1).min(items.len()));
    }
}

/// Stable speaker name to id assignment (sorted by name).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpeakerMapping {
    pub ids: BTreeMap<String, i64>,
}

impl SpeakerMapping {
    pub fn from_items(items: &[MetaItem]) -> Self {
        let names: BTreeSet<&str> = items.iter().map(|item| item.speaker.as_str()).collect();
        let ids = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name.to_string(), idx as i64))
            .collect();
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, speaker: &str) -> Result<i64> {
        self.ids
            .get(speaker)
            .copied()
            .with_context(|| format!("speaker {speaker:?} is not in the speaker mapping"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Fixed speaker vectors loaded from a JSON object `{ speaker: [f32, ...] }`.
#[derive(Debug, Clone)]
pub struct ExternalSpeakerEmbeddings {
    vectors: BTreeMap<String, Vec<f32>>,
    dim: usize,
}

impl ExternalSpeakerEmbeddings {
    pub fn load(path: &Path) -> Result<Self> {
        let vectors: BTreeMap<String, Vec<f32>> =
            serde_json::from_str(&fs::read_to_string(path)?)
                .with_context(|| format!("parsing {}", path.display()))?;
        let dim = vectors.values().next().map(Vec::len).unwrap_or(0);
        if dim == 0 || vectors.values().any(|v| v.len() != dim) {
            anyhow::bail!("{} must map speakers to equal-length vectors", path.display());
        }
        Ok(Self { vectors, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, speaker: &str) -> Result<&[f32]> {
        self.vectors
            .get(speaker)
            .map(Vec::as_slice)
            .with_context(|| format!("no external embedding for speaker {speaker:?}"))
    }
}

/// How batches identify their speakers.
#[derive(Debug, Clone, Default)]
pub enum SpeakerSource {
    #[default]
    None,
    Ids(Arc<SpeakerMapping>),
    External(Arc<ExternalSpeakerEmbeddings>),
}

/// Options shared by the training and evaluation datasets.
#[derive(Clone)]
pub struct DatasetOptions {
    pub num_mels: usize,
    /// Mel lengths are padded up to a multiple of this value.
    pub frame_multiple: usize,
    /// Frames per decoder step, used to group stop targets.
    pub r: usize,
    pub min_seq_len: usize,
    pub max_seq_len: usize,
    pub speakers: SpeakerSource,
    pub audio: Option<Arc<dyn AudioProcessor>>,
}

impl DatasetOptions {
    pub fn from_config(
        data: &DataConfig,
        num_mels: usize,
        frame_multiple: usize,
        r: usize,
        speakers: SpeakerSource,
        audio: Option<Arc<dyn AudioProcessor>>,
    ) -> Self {
        Self {
            num_mels,
            frame_multiple,
            r,
            min_seq_len: data.min_seq_len,
            max_seq_len: data.max_seq_len,
            speakers,
            audio,
        }
    }
}

#[derive(Debug, Clone)]
struct PreparedItem {
    meta: MetaItem,
    token_ids: Vec<i64>,
}

/// Encoded items sorted by text length; features are read on demand.
pub struct TtsDataset {
    items: Vec<PreparedItem>,
    options: DatasetOptions,
}

impl TtsDataset {
    pub fn new(items: Vec<MetaItem>, frontend: &TextFrontend, options: DatasetOptions) -> Result<Self> {
        let total = items.len();
        let mut prepared = Vec::with_capacity(total);
        for meta in items {
            let token_ids = match frontend.text_to_ids(&meta.text) {
                Ok(ids) => ids,
                Err(err) => {
                    tracing::warn!("Skipping {}: {err}", meta.feature_path.display());
                    continue;
                }
            };
            if token_ids.len() < options.min_seq_len || token_ids.len() > options.max_seq_len {
                continue;
            }
            prepared.push(PreparedItem { meta, token_ids });
        }
        prepared.sort_by_key(|item| item.token_ids.len());
        tracing::info!(
            "Dataset ready: {} of {} items within [{}, {}] symbols",
            prepared.len(),
            total,
            options.min_seq_len,
            options.max_seq_len
        );
        if prepared.is_empty() {
            anyhow::bail!("no usable items after text length filtering");
        }
        Ok(Self {
            items: prepared,
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn speakers(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.meta.speaker.as_str())
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Read features for `indices` and collate them into one padded batch.
    pub fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let _span = perf::span(Metric::Collate);
        let mut samples = Vec::with_capacity(indices.len());
        for &idx in indices {
            let item = self
                .items
                .get(idx)
                .with_context(|| format!("dataset index {idx} out of range"))?;
            let features = load_features(
                &item.meta.feature_path,
                self.options.num_mels,
                self.options.audio.as_deref(),
            )?;
            let speaker = match &self.options.speakers {
                SpeakerSource::None => None,
                SpeakerSource::Ids(mapping) => Some(SpeakerRef::Id(mapping.id(&item.meta.speaker)?)),
                SpeakerSource::External(table) => {
                    Some(SpeakerRef::Vector(table.get(&item.meta.speaker)?.to_vec()))
                }
            };
            samples.push(Sample {
                name: item.meta.feature_path.display().to_string(),
                token_ids: item.token_ids.clone(),
                features,
                speaker,
            });
        }
        perf::add_count(Metric::LoadedItems, samples.len() as u64);
        collate(samples, self.options.frame_multiple, self.options.r)
    }
}

/// Speaker reference attached to a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerRef {
    Id(i64),
    Vector(Vec<f32>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CharactersConfig;
    use crate::text::{SymbolTable, TextCleaner};

    fn frontend() -> TextFrontend {
        TextFrontend::new(
            TextCleaner::Basic,
            SymbolTable::new(&CharactersConfig::default()),
            false,
        )
    }

    fn options() -> DatasetOptions {
        DatasetOptions {
            num_mels: 4,
            frame_multiple: 1,
            r: 1,
            min_seq_len: 2,
            max_seq_len: 10,
            speakers: SpeakerSource::None,
            audio: None,
        }
    }

    #[test]
    fn metadata_defaults_missing_speaker() {
        let items = parse_metadata(
            Path::new("/data"),
            "a.safetensors|Hello|anna\n\n# comment\nb.safetensors|World\n",
        )
        .expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].feature_path, PathBuf::from("/data/a.safetensors"));
        assert_eq!(items[0].speaker, "anna");
        assert_eq!(items[1].speaker, DEFAULT_SPEAKER);
    }

    #[test]
    fn metadata_requires_text_column() {
        assert!(parse_metadata(Path::new("."), "only_a_path\n").is_err());
    }

    #[test]
    fn speaker_ids_are_sorted_by_name() {
        let items = parse_metadata(Path::new("."), "a|x|zoe\nb|y|adam\nc|z|zoe\n").expect("parse");
        let mapping = SpeakerMapping::from_items(&items);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.id("adam").expect("adam"), 0);
        assert_eq!(mapping.id("zoe").expect("zoe"), 1);
        assert!(mapping.id("bob").is_err());
    }

    #[test]
    fn length_filter_and_sorting() {
        let items = parse_metadata(
            Path::new("."),
            "a|abcdefgh|s\nb|abc|s\nc|a|s\nd|abcdefghijklmnop|s\n",
        )
        .expect("parse");
        let dataset = TtsDataset::new(items, &frontend(), options()).expect("dataset");
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.items[0].meta.text, "abc");
        assert_eq!(dataset.items[1].meta.text, "abcdefgh");
    }

    #[test]
    fn portion_keeps_prefix() {
        let mut items =
            parse_metadata(Path::new("."), "a|x\nb|y\nc|z\nd|w\n").expect("parse");
        apply_portion(&mut items, Some(0.5));
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].text, "y");
    }
}
