//! Dataset loading and batching.
//!
//! On disk, a dataset is an image folder:
//!
//! ```text
//! <data_path>/
//!   train/<class>/<image>.{png,jpg,jpeg}
//!   val/<class>/...      (optional)
//!   test/<class>/...
//! ```
//!
//! Class ids are the alphabetical position of the class directories under
//! `train/`.  When `val/` is missing the test split is used as the held-out
//! split.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A single decoded example: CHW pixels and its class id.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<f32>,
    pub label: u32,
}

/// Image shape as `(channels, height, width)`.
pub type ImageShape = (usize, usize, usize);

/// Random-access source of labelled images.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    fn shape(&self) -> ImageShape;

    fn num_classes(&self) -> usize;
}

// ── ImageFolder ───────────────────────────────────────────────────────────────

/// Images under `<split>/<class>/`, decoded lazily and resized to a square.
pub struct ImageFolder {
    items: Vec<(PathBuf, u32)>,
    num_classes: usize,
    channels: usize,
    img_size: usize,
}

impl ImageFolder {
    /// Index `split_dir` using the class list of the training split.
    ///
    /// Class directories not in `classes` are an error; a class with no
    /// images in this split is allowed.
    pub fn open(split_dir: &Path, classes: &[String], channels: usize, img_size: usize) -> Result<Self> {
        ensure!(channels == 1 || channels == 3, "Unsupported channel count {channels} (expected 1 or 3)");

        let mut items = Vec::new();
        for dir in sorted_subdirs(split_dir)? {
            let name = dir_name(&dir);
            let label = classes
                .iter()
                .position(|c| *c == name)
                .with_context(|| format!("Class '{name}' in {} is not a training class", split_dir.display()))?;
            for file in sorted_images(&dir)? {
                items.push((file, label as u32));
            }
        }
        ensure!(!items.is_empty(), "No images found under {}", split_dir.display());

        info!(path = %split_dir.display(), images = items.len(), "Indexed image split");
        Ok(Self { items, num_classes: classes.len(), channels, img_size })
    }

    /// Sorted class-directory names of a training split.
    pub fn discover_classes(train_dir: &Path) -> Result<Vec<String>> {
        let classes: Vec<String> = sorted_subdirs(train_dir)?.iter().map(|d| dir_name(d)).collect();
        ensure!(!classes.is_empty(), "No class directories in {}", train_dir.display());
        Ok(classes)
    }

    fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path)
            .with_context(|| format!("Cannot decode image {}", path.display()))?
            .resize_exact(self.img_size as u32, self.img_size as u32, FilterType::Triangle);

        let plane = self.img_size * self.img_size;
        let mut out = vec![0f32; self.channels * plane];
        if self.channels == 3 {
            let rgb = img.to_rgb8();
            for (i, px) in rgb.pixels().enumerate() {
                for c in 0..3 {
                    out[c * plane + i] = (px[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
                }
            }
        } else {
            let luma = img.to_luma8();
            for (i, px) in luma.pixels().enumerate() {
                out[i] = (px[0] as f32 / 255.0 - 0.5) / 0.5;
            }
        }
        Ok(out)
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (path, label) = &self.items[index];
        Ok(Sample { pixels: self.decode(path)?, label: *label })
    }

    fn shape(&self) -> ImageShape {
        (self.channels, self.img_size, self.img_size)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Number of training images per class, in class-id order.
pub fn label_counts(data_path: &Path) -> Result<Vec<usize>> {
    let train_dir = data_path.join("train");
    sorted_subdirs(&train_dir)?
        .iter()
        .map(|d| Ok(sorted_images(d)?.len()))
        .collect()
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read dataset directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn sorted_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read class directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── InMemoryDataset ───────────────────────────────────────────────────────────

/// Pre-decoded samples held in memory.
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    shape: ImageShape,
    num_classes: usize,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>, shape: ImageShape, num_classes: usize) -> Result<Self> {
        let (c, h, w) = shape;
        for (i, s) in samples.iter().enumerate() {
            ensure!(s.pixels.len() == c * h * w, "Sample {i} has {} values, expected {}", s.pixels.len(), c * h * w);
            ensure!((s.label as usize) < num_classes, "Sample {i} label {} out of range", s.label);
        }
        Ok(Self { samples, shape, num_classes })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        Ok(self.samples[index].clone())
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

// ── Batching ──────────────────────────────────────────────────────────────────

/// A collated batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, C, H, W]` F32.
    pub images: Tensor,
    /// `[B]` U32 class ids.
    pub labels: Tensor,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.labels.dims()[0]
    }
}

/// Batches a [`Dataset`]; training loaders shuffle and flip every epoch.
pub struct DataLoader {
    dataset: Box<dyn Dataset>,
    batch_size: usize,
    train: bool,
}

impl DataLoader {
    pub fn new(dataset: Box<dyn Dataset>, batch_size: usize, train: bool) -> Self {
        Self { dataset, batch_size: batch_size.max(1), train }
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }

    /// One pass over the data.
    ///
    /// For a training loader the visiting order and the horizontal flips are
    /// drawn from `rng` up front, so the iterator does not hold the RNG.
    pub fn epoch(&self, rng: &mut StdRng, device: &Device) -> Batches<'_> {
        let n = self.dataset.len();
        let mut order: Vec<usize> = (0..n).collect();
        let mut flips = vec![false; n];
        if self.train {
            order.shuffle(rng);
            flips.iter_mut().for_each(|f| *f = rng.gen_bool(0.5));
        }
        Batches { loader: self, order, flips, pos: 0, device: device.clone() }
    }

    /// One pass in dataset order with no augmentation.
    pub fn sequential(&self, device: &Device) -> Batches<'_> {
        let n = self.dataset.len();
        Batches {
            loader: self,
            order: (0..n).collect(),
            flips: vec![false; n],
            pos: 0,
            device: device.clone(),
        }
    }

    fn collate(&self, indices: &[usize], flips: &[bool], device: &Device) -> Result<Batch> {
        let (c, h, w) = self.dataset.shape();
        let mut pixels = Vec::with_capacity(indices.len() * c * h * w);
        let mut labels = Vec::with_capacity(indices.len());
        for (&idx, &flip) in indices.iter().zip(flips) {
            let mut sample = self.dataset.get(idx)?;
            if flip {
                flip_horizontal(&mut sample.pixels, w);
            }
            pixels.extend_from_slice(&sample.pixels);
            labels.push(sample.label);
        }
        let images = Tensor::from_vec(pixels, (indices.len(), c, h, w), device)?;
        let labels = Tensor::from_vec(labels, indices.len(), device)?;
        Ok(Batch { images, labels })
    }
}

/// Reverse every row of a CHW buffer.
fn flip_horizontal(pixels: &mut [f32], width: usize) {
    pixels.chunks_mut(width).for_each(|row| row.reverse());
}

/// Iterator over the batches of one pass.
pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    flips: Vec<bool>,
    pos: usize,
    device: Device,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.order.len());
        let indices: Vec<usize> = self.order[self.pos..end].to_vec();
        let flips: Vec<bool> = indices.iter().map(|&i| self.flips[i]).collect();
        self.pos = end;
        Some(self.loader.collate(&indices, &flips, &self.device))
    }
}

// ── Splits ────────────────────────────────────────────────────────────────────

/// Training loader plus the held-out loader used for validation and the
/// final test pass.
pub struct DataSplits {
    pub train: DataLoader,
    pub held_out: DataLoader,
    /// `"val"` or `"test"`.
    pub held_out_split: &'static str,
    pub classes: Vec<String>,
}

/// Build loaders for an image-folder dataset rooted at `data_path`.
pub fn create_dataloaders(
    data_path: &Path,
    channels: usize,
    img_size: usize,
    batch_size: usize,
) -> Result<DataSplits> {
    let train_dir = data_path.join("train");
    let classes = ImageFolder::discover_classes(&train_dir)?;
    let train = ImageFolder::open(&train_dir, &classes, channels, img_size)?;

    let (held_out_split, held_dir) = ["val", "test"]
        .into_iter()
        .map(|s| (s, data_path.join(s)))
        .find(|(_, p)| p.is_dir())
        .with_context(|| format!("Neither val/ nor test/ exists under {}", data_path.display()))?;
    let held_out = ImageFolder::open(&held_dir, &classes, channels, img_size)?;

    info!(
        classes = classes.len(),
        train = train.len(),
        held_out = held_out.len(),
        split = held_out_split,
        "Dataloaders ready"
    );

    Ok(DataSplits {
        train: DataLoader::new(Box::new(train), batch_size, true),
        held_out: DataLoader::new(Box::new(held_out), batch_size, false),
        held_out_split,
        classes,
    })
}
