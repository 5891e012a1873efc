use burn_ndarray::NdArray;
use regression_dataset::{
    list_images, BatchLoader, Corruption, DatasetConfig, DatasetError, DatasetSource, Split, Task,
};
use std::fs;
use std::path::Path;

type Backend = NdArray<f32>;

fn write_rgb(dir: &Path, name: &str, width: u32, height: u32, seed: u8) {
    fs::create_dir_all(dir).unwrap();
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x as u8).wrapping_mul(16).wrapping_add(seed),
            (y as u8).wrapping_mul(16),
            seed,
        ])
    });
    img.save(dir.join(name)).unwrap();
}

fn cfg(task: Task, opts: &[&str], crop: (usize, usize), channels: usize) -> DatasetConfig {
    let opts: Vec<String> = opts.iter().map(|s| s.to_string()).collect();
    DatasetConfig {
        crop,
        channels,
        corruption: Corruption::from_opts(task, &opts).unwrap(),
        seed: Some(11),
    }
}

#[test]
fn missing_and_empty_splits_are_data_source_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cfg(Task::Denoising, &["random", "30"], (8, 8), 3);

    let err = DatasetSource::open(tmp.path(), Split::Train, &cfg).unwrap_err();
    assert!(matches!(err, DatasetError::MissingDir { .. }));

    let empty = tmp.path().join("val");
    fs::create_dir_all(&empty).unwrap();
    fs::write(empty.join("notes.txt"), "not an image").unwrap();
    let err = DatasetSource::open(tmp.path(), Split::Val, &cfg).unwrap_err();
    assert!(matches!(err, DatasetError::Empty { .. }));
}

#[test]
fn listing_is_sorted_and_filters_extensions() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("test");
    write_rgb(&dir, "b.png", 4, 4, 1);
    write_rgb(&dir, "a.PNG", 4, 4, 2);
    fs::write(dir.join("c.txt"), "skip").unwrap();
    let files = list_images(&dir).unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.PNG", "b.png"]);
}

#[test]
fn portrait_images_are_transposed_before_cropping() {
    let tmp = tempfile::tempdir().unwrap();
    write_rgb(&tmp.path().join("test"), "tall.png", 8, 16, 3);
    let cfg = cfg(Task::SuperResolution, &["bilinear", "2"], (8, 16), 3);
    let source = DatasetSource::open(tmp.path(), Split::Test, &cfg).unwrap();
    let sample = source.load(0, 0).unwrap();
    assert_eq!((sample.label.height, sample.label.width), (8, 16));
    assert!(sample.input.same_shape(&sample.label));
    assert!(sample.label.data.iter().all(|v| (-1.0..=1.0).contains(v)));
}

#[test]
fn images_smaller_than_the_crop_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    write_rgb(&tmp.path().join("train"), "small.png", 8, 8, 0);
    let cfg = cfg(Task::Denoising, &["random", "10"], (16, 16), 3);
    let source = DatasetSource::open(tmp.path(), Split::Train, &cfg).unwrap();
    assert!(matches!(
        source.load(0, 0),
        Err(DatasetError::TooSmall { .. })
    ));
}

#[test]
fn loader_yields_partial_final_batch_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("test");
    for i in 0..5u8 {
        write_rgb(&dir, &format!("img_{i}.png"), 8, 8, i * 10);
    }
    let cfg = cfg(Task::Inpainting, &["uniform", "2", "2"], (8, 8), 1);
    let source = DatasetSource::open(tmp.path(), Split::Test, &cfg).unwrap();
    let mut loader = BatchLoader::new(source, 2, false, Some(11));
    assert_eq!(loader.len(), 5);
    assert_eq!(loader.num_batches(), 3);

    let device = Default::default();
    let mut sizes = Vec::new();
    let mut indices = Vec::new();
    while let Some(batch) = loader.next_batch::<Backend>(&device).unwrap() {
        assert_eq!(batch.input.dims()[1..], [1, 8, 8]);
        assert_eq!(batch.input.dims(), batch.label.dims());
        sizes.push(batch.len());
        indices.extend(batch.indices.clone());
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    // A new pass starts from the beginning.
    loader.reset();
    assert!(loader.next_batch::<Backend>(&device).unwrap().is_some());
}

#[test]
fn seeded_shuffle_visits_every_sample_once() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("train");
    for i in 0..7u8 {
        write_rgb(&dir, &format!("img_{i}.png"), 8, 8, i);
    }
    let cfg = cfg(Task::Denoising, &["random", "25"], (8, 8), 3);
    let source = DatasetSource::open(tmp.path(), Split::Train, &cfg).unwrap();
    let mut loader = BatchLoader::new(source, 3, true, Some(5));
    let mut seen = Vec::new();
    while let Some(samples) = loader.next_samples().unwrap() {
        seen.extend(samples.iter().map(|s| s.index));
    }
    seen.sort();
    assert_eq!(seen, (0..7).collect::<Vec<_>>());
}
