use std::path::PathBuf;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;

use super::{split::Partition, table::TableRow, Result};
use crate::{config::ColumnConfig, TrainingError};

/// Ground-truth object set for one frame. Sizes vary from frame to frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub labels: Vec<u32>,
    /// Normalized `(cx, cy, w, h)` boxes, parallel to `labels`.
    pub boxes: Vec<[f32; 4]>,
}

impl Target {
    pub fn new(labels: Vec<u32>, boxes: Vec<[f32; 4]>) -> Result<Self> {
        if labels.len() != boxes.len() {
            return Err(TrainingError::data(format!(
                "target has {} labels but {} boxes",
                labels.len(),
                boxes.len()
            )));
        }
        for bbox in &boxes {
            if bbox.iter().any(|v| !v.is_finite()) || bbox[2] < 0.0 || bbox[3] < 0.0 {
                return Err(TrainingError::data(format!("invalid box {:?}", bbox)));
            }
        }
        Ok(Self { labels, boxes })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    /// Frame tensor shaped `[3, height, width]` with values in `[0, 1]`.
    pub input: Tensor,
    pub target: Target,
}

/// Maps an index within a partition to one `(input, target)` pair.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self, index: usize) -> Result<Sample>;
}

/// Samples already materialized in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    samples: Vec<Sample>,
}

impl InMemorySource {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl SampleSource for InMemorySource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            TrainingError::data(format!(
                "sample index {} out of range for {} samples",
                index,
                self.samples.len()
            ))
        })
    }
}

/// Reads frames from disk for the rows of a partition.
///
/// Boxes and labels are JSON arrays stored in their own columns, e.g.
/// `[[0.5,0.5,0.2,0.3]]` and `[3]`.
#[derive(Debug, Clone)]
pub struct FrameSource {
    root_dir: PathBuf,
    image_size: u32,
    frame_column: usize,
    boxes_column: usize,
    labels_column: usize,
    rows: Vec<TableRow>,
}

impl FrameSource {
    pub fn new(
        partition: &Partition,
        root_dir: impl Into<PathBuf>,
        image_size: u32,
        columns: &ColumnConfig,
    ) -> Result<Self> {
        let lookup = |name: &str| {
            partition.column_index(name).ok_or_else(|| {
                TrainingError::validation(vec![format!("data table has no column '{}'", name)])
            })
        };
        Ok(Self {
            root_dir: root_dir.into(),
            image_size: image_size.max(1),
            frame_column: lookup(&columns.frame)?,
            boxes_column: lookup(&columns.boxes)?,
            labels_column: lookup(&columns.labels)?,
            rows: partition.rows().to_vec(),
        })
    }

    fn field<'a>(&self, row: &'a TableRow, column: usize) -> Result<&'a str> {
        row.get(column).ok_or_else(|| {
            TrainingError::data(format!(
                "row {} is missing column {}",
                row.position + 1,
                column
            ))
        })
    }

    fn load_frame(&self, row: &TableRow) -> Result<Tensor> {
        let path = self.root_dir.join(self.field(row, self.frame_column)?);
        let frame = image::open(&path)
            .map_err(|err| {
                TrainingError::data(format!("failed to open frame {}: {err}", path.display()))
            })?
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();

        let (width, height) = frame.dimensions();
        let plane = (width * height) as usize;
        let mut chw = vec![0f32; 3 * plane];
        for (idx, pixel) in frame.pixels().enumerate() {
            for c in 0..3 {
                chw[c * plane + idx] = pixel[c] as f32 / 255.0;
            }
        }
        Ok(Tensor::from_vec(
            chw,
            (3, height as usize, width as usize),
            &Device::Cpu,
        )?)
    }

    fn parse_target(&self, row: &TableRow) -> Result<Target> {
        let boxes_raw = self.field(row, self.boxes_column)?;
        let labels_raw = self.field(row, self.labels_column)?;
        let boxes: Vec<[f32; 4]> = parse_json_list(boxes_raw).map_err(|err| {
            TrainingError::data(format!("row {} boxes: {err}", row.position + 1))
        })?;
        let labels: Vec<u32> = parse_json_list(labels_raw).map_err(|err| {
            TrainingError::data(format!("row {} labels: {err}", row.position + 1))
        })?;
        Target::new(labels, boxes)
    }
}

impl SampleSource for FrameSource {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn sample(&self, index: usize) -> Result<Sample> {
        let row = self.rows.get(index).ok_or_else(|| {
            TrainingError::data(format!(
                "sample index {} out of range for {} rows",
                index,
                self.rows.len()
            ))
        })?;
        let target = self.parse_target(row)?;
        let input = self.load_frame(row)?;
        Ok(Sample { input, target })
    }
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &str) -> serde_json::Result<Vec<T>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitConfig;
    use crate::data::{split_table, DataTable};

    fn write_frame(dir: &std::path::Path, name: &str) {
        let img = image::RgbImage::from_fn(8, 6, |x, y| image::Rgb([x as u8 * 20, y as u8 * 30, 255]));
        img.save(dir.join(name)).unwrap();
    }

    fn partition_for(rows: Vec<Vec<String>>) -> Partition {
        let table =
            DataTable::from_rows(&["frame_path", "boxes", "labels", "split"], rows).unwrap();
        split_table(&table, &SplitConfig::default()).unwrap().test
    }

    #[test]
    fn frame_source_loads_resized_chw_frames() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "f0.png");
        let partition = partition_for(vec![vec![
            "f0.png".into(),
            "[[0.5,0.5,0.25,0.5],[0.1,0.2,0.1,0.1]]".into(),
            "[2,0]".into(),
            "val-new-cl".into(),
        ]]);

        let source = FrameSource::new(&partition, dir.path(), 4, &ColumnConfig::default()).unwrap();
        let sample = source.sample(0).unwrap();

        assert_eq!(sample.input.dims(), &[3, 4, 4]);
        assert_eq!(sample.target.labels, vec![2, 0]);
        assert_eq!(sample.target.boxes[0], [0.5, 0.5, 0.25, 0.5]);
    }

    #[test]
    fn empty_annotation_cells_mean_no_objects() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "f0.png");
        let partition = partition_for(vec![vec![
            "f0.png".into(),
            "".into(),
            "[]".into(),
            "val-new-cl".into(),
        ]]);

        let source = FrameSource::new(&partition, dir.path(), 4, &ColumnConfig::default()).unwrap();
        assert!(source.sample(0).unwrap().target.is_empty());
    }

    #[test]
    fn mismatched_annotations_are_data_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "f0.png");
        let partition = partition_for(vec![vec![
            "f0.png".into(),
            "[[0.5,0.5,0.25,0.5]]".into(),
            "[1,2]".into(),
            "val-new-cl".into(),
        ]]);

        let source = FrameSource::new(&partition, dir.path(), 4, &ColumnConfig::default()).unwrap();
        assert!(matches!(source.sample(0), Err(TrainingError::Data(_))));
    }

    #[test]
    fn missing_annotation_column_is_rejected_up_front() {
        let table = DataTable::from_rows(
            &["frame_path", "split"],
            vec![vec!["f0.png".into(), "val-new-cl".into()]],
        )
        .unwrap();
        let splits = split_table(&table, &SplitConfig::default()).unwrap();

        assert!(FrameSource::new(&splits.test, "/tmp", 4, &ColumnConfig::default()).is_err());
    }
}
