use std::{
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use burn::{data::dataloader::batcher::Batcher, prelude::*};
use image::ImageReader;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::symbols::Alphabet;

const CHANNEL_COUNT: usize = 3;

/// Ground truth encoded in a sample's file name: everything before the
/// first `.`, cut again at the first `_`.
pub fn label_from_file_name(file_name: &str) -> &str {
    let stem = file_name.split('.').next().unwrap_or_default();
    stem.split('_').next().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct CaptchaItem {
    /// Row-major `height * width * 3` RGB values scaled to `[0, 1]`.
    pub image: Vec<f32>,
    /// Class index per label position, `None` for an all-zero target row.
    pub label: Vec<Option<usize>>,
}

/// Batches of captcha images drawn without replacement from a directory.
///
/// Every draw removes a file from the pool of available files. When the
/// pool runs dry it is rebuilt from the directory listing, which can happen
/// in the middle of a batch; such a batch holds samples from two refills.
pub struct ImageSequence {
    directory: PathBuf,
    batch_size: usize,
    length: usize,
    alphabet: Alphabet,
    width: u32,
    height: u32,

    available: Vec<OsString>,
    used: Vec<OsString>,
    count: usize,
    rng: StdRng,
}

impl ImageSequence {
    pub fn new(
        directory: impl Into<PathBuf>,
        batch_size: usize,
        length: usize,
        alphabet: Alphabet,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be greater than zero");

        let directory = directory.into();
        let available = list_files(&directory)?;

        Ok(Self {
            directory,
            batch_size,
            length,
            alphabet,
            width,
            height,
            count: available.len(),
            available,
            used: vec![],
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of batches in one epoch.
    pub fn len(&self) -> usize {
        self.count / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files drawn since the pool was last refilled.
    pub fn used(&self) -> &[OsString] {
        &self.used
    }

    /// Draws a fresh batch. The index only has to be in range; it does not
    /// select which samples are returned.
    pub fn get(&mut self, index: usize) -> Result<Vec<CaptchaItem>> {
        ensure!(
            index < self.len(),
            "batch index {index} out of range for a sequence of {} batches",
            self.len()
        );

        (0..self.batch_size)
            .map(|_| {
                let file_name = self.draw()?;
                self.load(&file_name)
            })
            .collect()
    }

    /// Picks one file uniformly at random and removes it from the pool.
    pub fn draw(&mut self) -> Result<OsString> {
        if self.available.is_empty() {
            self.refill()?;
        }

        let index = self.rng.gen_range(0..self.available.len());
        let file_name = self.available.swap_remove(index);
        self.used.push(file_name.clone());

        Ok(file_name)
    }

    fn refill(&mut self) -> Result<()> {
        self.used.clear();
        self.available = list_files(&self.directory)?;

        if self.available.is_empty() {
            bail!("no images left in '{}'", self.directory.display());
        }

        tracing::debug!(
            "Refilled pool from '{}' with {} files",
            self.directory.display(),
            self.available.len()
        );
        Ok(())
    }

    fn load(&self, file_name: &OsStr) -> Result<CaptchaItem> {
        let path = self.directory.join(file_name);
        let image = load_image(&path, self.width, self.height)?;
        let label = self
            .alphabet
            .encode(label_from_file_name(&file_name.to_string_lossy()), self.length)
            .with_context(|| format!("bad label in '{}'", path.display()))?;

        Ok(CaptchaItem { image, label })
    }
}

fn list_files(directory: &Path) -> Result<Vec<OsString>> {
    let entries = fs::read_dir(directory)
        .with_context(|| format!("cannot list dataset directory '{}'", directory.display()))?;

    let mut files = vec![];
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        files.push(entry.file_name());
    }

    // Directory order is platform dependent; sorting keeps seeded runs stable.
    files.sort();
    Ok(files)
}

/// Decodes `path` as an RGB image and scales it to `[0, 1]`.
pub fn load_image(path: &Path, width: u32, height: u32) -> Result<Vec<f32>> {
    let image = ImageReader::open(path)
        .with_context(|| format!("cannot open image '{}'", path.display()))?
        .decode()
        .with_context(|| format!("cannot decode image '{}'", path.display()))?
        .to_rgb8();

    ensure!(
        image.dimensions() == (width, height),
        "image '{}' is {}x{}, expected {width}x{height}",
        path.display(),
        image.width(),
        image.height()
    );

    Ok(image
        .into_raw()
        .into_iter()
        .map(|value| value as f32 / 255.)
        .collect())
}

#[derive(Clone, Debug)]
pub struct CaptchaBatch<B: Backend> {
    /// `[batch, height, width, 3]`
    pub images: Tensor<B, 4>,
    /// One `[batch, symbol_count]` one-hot tensor per label position.
    pub targets: Vec<Tensor<B, 2>>,
}

#[derive(Clone)]
pub struct CaptchaBatcher<B: Backend> {
    device: B::Device,
    width: usize,
    height: usize,
    length: usize,
    symbol_count: usize,
}

impl<B: Backend> CaptchaBatcher<B> {
    pub fn new(
        device: B::Device,
        width: usize,
        height: usize,
        length: usize,
        symbol_count: usize,
    ) -> Self {
        Self {
            device,
            width,
            height,
            length,
            symbol_count,
        }
    }
}

impl<B: Backend> Batcher<CaptchaItem, CaptchaBatch<B>> for CaptchaBatcher<B> {
    fn batch(&self, items: Vec<CaptchaItem>) -> CaptchaBatch<B> {
        let batch_size = items.len();

        let pixels = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect::<Vec<_>>();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(
                pixels,
                [batch_size, self.height, self.width, CHANNEL_COUNT],
            )
            .convert::<B::FloatElem>(),
            &self.device,
        );

        let targets = (0..self.length)
            .map(|position| {
                let mut one_hot = vec![0f32; batch_size * self.symbol_count];
                for (row, item) in items.iter().enumerate() {
                    if let Some(Some(class)) = item.label.get(position) {
                        one_hot[row * self.symbol_count + class] = 1.;
                    }
                }

                Tensor::<B, 2>::from_data(
                    TensorData::new(one_hot, [batch_size, self.symbol_count])
                        .convert::<B::FloatElem>(),
                    &self.device,
                )
            })
            .collect();

        CaptchaBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    use super::*;

    type TestBackend = NdArray<f32>;

    pub(crate) const SYMBOLS: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

    pub(crate) fn write_images(directory: &Path, names: &[String], width: u32, height: u32) {
        for (i, name) in names.iter().enumerate() {
            let shade = (i * 20 % 256) as u8;
            RgbImage::from_pixel(width, height, Rgb([255, shade, 0]))
                .save(directory.join(name))
                .unwrap();
        }
    }

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("ab12_{i}.png")).collect()
    }

    fn sequence(directory: &Path, batch_size: usize) -> ImageSequence {
        ImageSequence::new(directory, batch_size, 4, Alphabet::new(SYMBOLS), 6, 4)
            .unwrap()
            .with_seed(7)
    }

    #[test]
    fn label_is_text_before_first_underscore() {
        assert_eq!(label_from_file_name("ab12_x.png"), "ab12");
        assert_eq!(label_from_file_name("ab12.png"), "ab12");
        assert_eq!(label_from_file_name("ab12_x_y.tar.gz"), "ab12");
    }

    #[test]
    fn length_is_floor_of_file_count_over_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(10), 6, 4);

        assert_eq!(sequence(dir.path(), 2).len(), 5);
        assert_eq!(sequence(dir.path(), 3).len(), 3);
        assert_eq!(sequence(dir.path(), 11).len(), 0);
        assert!(sequence(dir.path(), 11).is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();

        assert!(ImageSequence::new(dir.path(), 0, 4, Alphabet::new(SYMBOLS), 6, 4).is_err());
    }

    #[test]
    fn subdirectories_are_not_samples() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(4), 6, 4);
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(sequence(dir.path(), 1).len(), 4);
    }

    #[test]
    fn draws_without_replacement_until_refill() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(10), 6, 4);
        let mut sequence = sequence(dir.path(), 2);

        let drawn: HashSet<_> = (0..10).map(|_| sequence.draw().unwrap()).collect();
        assert_eq!(drawn.len(), 10);
        assert_eq!(sequence.used().len(), 10);

        // The eleventh draw starts a new generation.
        sequence.draw().unwrap();
        assert_eq!(sequence.used().len(), 1);
    }

    #[test]
    fn batch_may_span_two_refills() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(3), 6, 4);
        let mut sequence = sequence(dir.path(), 2);

        assert_eq!(sequence.get(0).unwrap().len(), 2);
        assert_eq!(sequence.get(0).unwrap().len(), 2);
        assert_eq!(sequence.used().len(), 1);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(4), 6, 4);

        assert!(sequence(dir.path(), 2).get(2).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_file_names_still_load() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let name = OsStr::from_bytes(b"ab12_\xff.png");
        RgbImage::from_pixel(6, 4, Rgb([0, 0, 0]))
            .save(dir.path().join(name))
            .unwrap();

        let items = sequence(dir.path(), 1).get(0).unwrap();
        assert_eq!(items[0].label, vec![Some(10), Some(11), Some(1), Some(2)]);
    }

    #[test]
    fn mismatched_image_size_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(2), 5, 5);

        assert!(sequence(dir.path(), 2).get(0).is_err());
    }

    #[test]
    fn image_is_rgb_scaled_to_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_0.png");
        RgbImage::from_pixel(2, 1, Rgb([255, 51, 0])).save(&path).unwrap();

        let pixels = load_image(&path, 2, 1).unwrap();
        assert_eq!(pixels, vec![1.0, 0.2, 0.0, 1.0, 0.2, 0.0]);
    }

    #[test]
    fn batch_has_expected_shapes_and_one_hot_targets() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &names(10), 6, 4);
        let mut sequence = sequence(dir.path(), 2);

        let device = Default::default();
        let batcher = CaptchaBatcher::<TestBackend>::new(device, 6, 4, 4, SYMBOLS.len());
        let batch = batcher.batch(sequence.get(0).unwrap());

        assert_eq!(batch.images.dims(), [2, 4, 6, 3]);
        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|value| (0.0..=1.0).contains(value)));

        assert_eq!(batch.targets.len(), 4);
        let expected = ['a', 'b', '1', '2'];
        for (target, symbol) in batch.targets.into_iter().zip(expected) {
            assert_eq!(target.dims(), [2, SYMBOLS.len()]);

            let class = SYMBOLS.find(symbol).unwrap();
            let rows = target.into_data().to_vec::<f32>().unwrap();
            for row in rows.chunks(SYMBOLS.len()) {
                assert_eq!(row.iter().sum::<f32>(), 1.0);
                assert_eq!(row[class], 1.0);
            }
        }
    }

    #[test]
    fn unknown_symbol_gives_zero_row() {
        let device = Default::default();
        let batcher = CaptchaBatcher::<TestBackend>::new(device, 1, 1, 2, 3);
        let item = CaptchaItem {
            image: vec![0.0; 3],
            label: vec![Some(2), None],
        };

        let batch = batcher.batch(vec![item]);
        let first = batch.targets[0].clone().into_data().to_vec::<f32>().unwrap();
        let second = batch.targets[1].clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(first, vec![0.0, 0.0, 1.0]);
        assert_eq!(second, vec![0.0, 0.0, 0.0]);
    }
}
