use std::path;
use std::sync;

use ndarray::{s, Array2};

use crate::error::{Error, Result};

const IMAGE_ID: &'static str = "image_id";
const NUM_BOXES: &'static str = "num_boxes";
const FEATURES: &'static str = "features";

/// Region features of one image: `num_boxes` rows of `feature_size` floats.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub image_id: i64,
    pub num_boxes: usize,
    pub features: Vec<f32>,
}

#[derive(Debug)]
struct Index {
    path: path::PathBuf,
    image_ids: Vec<i64>,
    num_boxes: Vec<usize>,
    feature_size: usize,
    max_boxes: usize,
    features: Option<Array2<f32>>,
}

/// Thread-safe handle from which readers can be reopened, one per thread.
#[derive(Debug, Clone)]
pub struct FeatureSource {
    index: sync::Arc<Index>,
}

impl FeatureSource {
    pub fn open(&self) -> Result<FeatureReader> {
        let features = match self.index.features {
            Some(_) => None,
            None => Some(hdf5::File::open(&self.index.path)?.dataset(FEATURES)?),
        };
        Ok(FeatureReader {
            index: self.index.clone(),
            features,
        })
    }
}

/// Reader over an HDF5 feature store with parallel `image_id`, `num_boxes`
/// and `features` datasets. `features` is `N x (max_boxes * feature_size)`.
pub struct FeatureReader {
    index: sync::Arc<Index>,
    features: Option<hdf5::Dataset>,
}

impl FeatureReader {
    pub fn open<P>(path: P, feature_size: usize, in_memory: bool) -> Result<Self>
    where
        P: AsRef<path::Path>,
    {
        let path = path.as_ref();
        let invalid = |reason: String| Error::Features {
            path: path.to_owned(),
            reason,
        };

        let file = hdf5::File::open(path)?;
        let image_ids = file.dataset(IMAGE_ID)?.read_raw::<i64>()?;
        let num_boxes = file
            .dataset(NUM_BOXES)?
            .read_raw::<i64>()?
            .into_iter()
            .map(|n| {
                if n < 0 {
                    Err(invalid(format!("negative box count {}", n)))
                } else {
                    Ok(n as usize)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let dataset = file.dataset(FEATURES)?;

        let shape = dataset.shape();
        if shape.len() != 2 {
            return Err(invalid(format!("{} has shape {:?}", FEATURES, shape)));
        }
        if shape[0] != image_ids.len() || num_boxes.len() != image_ids.len() {
            return Err(invalid(format!(
                "length mismatch: {} ids, {} box counts, {} feature rows",
                image_ids.len(),
                num_boxes.len(),
                shape[0]
            )));
        }
        if feature_size == 0 || shape[1] % feature_size != 0 {
            return Err(invalid(format!(
                "row width {} is not a multiple of feature size {}",
                shape[1], feature_size
            )));
        }
        let max_boxes = shape[1] / feature_size;
        if let Some(n) = num_boxes.iter().find(|&&n| n > max_boxes) {
            return Err(invalid(format!("{} boxes exceed row capacity {}", n, max_boxes)));
        }

        let features = if in_memory {
            tracing::info!("loading {} feature rows into memory", image_ids.len());
            Some(dataset.read_2d::<f32>()?)
        } else {
            None
        };

        let index = Index {
            path: path.to_owned(),
            image_ids,
            num_boxes,
            feature_size,
            max_boxes,
            features,
        };
        let features = match index.features {
            Some(_) => None,
            None => Some(dataset),
        };
        Ok(Self {
            index: sync::Arc::new(index),
            features,
        })
    }

    /// In-memory reader over `records`, rows padded to the largest box count.
    pub fn from_records(records: Vec<FeatureRecord>, feature_size: usize) -> Result<Self> {
        let max_boxes = records.iter().map(|r| r.num_boxes).max().unwrap_or(0);
        let mut features = Array2::zeros((records.len(), max_boxes * feature_size));
        for (i, r) in records.iter().enumerate() {
            if r.features.len() != r.num_boxes * feature_size {
                return Err(Error::Features {
                    path: path::PathBuf::new(),
                    reason: format!("record {} has {} values", r.image_id, r.features.len()),
                });
            }
            for (dst, &src) in features.row_mut(i).iter_mut().zip(r.features.iter()) {
                *dst = src;
            }
        }
        let index = Index {
            path: path::PathBuf::new(),
            image_ids: records.iter().map(|r| r.image_id).collect(),
            num_boxes: records.iter().map(|r| r.num_boxes).collect(),
            feature_size,
            max_boxes,
            features: Some(features),
        };
        Ok(Self {
            index: sync::Arc::new(index),
            features: None,
        })
    }

    pub fn source(&self) -> FeatureSource {
        FeatureSource {
            index: self.index.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn feature_size(&self) -> usize {
        self.index.feature_size
    }

    pub fn max_boxes(&self) -> usize {
        self.index.max_boxes
    }

    pub fn image_id(&self, index: usize) -> Result<i64> {
        self.index
            .image_ids
            .get(index)
            .cloned()
            .ok_or(Error::FeatureIndex {
                index,
                len: self.len(),
            })
    }

    pub fn get(&self, index: usize) -> Result<FeatureRecord> {
        let image_id = self.image_id(index)?;
        let num_boxes = self.index.num_boxes[index];
        let n = num_boxes * self.index.feature_size;
        let features = match (&self.index.features, &self.features) {
            (Some(all), _) => all.row(index).iter().take(n).cloned().collect(),
            (None, Some(dataset)) => dataset
                .read_slice_1d::<f32, _>(s![index, ..])?
                .iter()
                .take(n)
                .cloned()
                .collect(),
            (None, None) => unreachable!("on-disk reader without a dataset"),
        };
        Ok(FeatureRecord {
            image_id,
            num_boxes,
            features,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    pub(crate) fn write_store(path: &path::Path) {
        let file = hdf5::File::create(path).unwrap();
        file.new_dataset_builder()
            .with_data(&arr1(&[42i64, 7, 9]))
            .create(IMAGE_ID)
            .unwrap();
        file.new_dataset_builder()
            .with_data(&arr1(&[2i64, 1, 0]))
            .create(NUM_BOXES)
            .unwrap();
        file.new_dataset_builder()
            .with_data(&arr2(&[
                [1.0f32, 2.0, 3.0, 4.0],
                [5.0, 6.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
            ]))
            .create(FEATURES)
            .unwrap();
    }

    fn check(reader: &FeatureReader) {
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.max_boxes(), 2);
        assert_eq!(
            reader.get(0).unwrap(),
            FeatureRecord {
                image_id: 42,
                num_boxes: 2,
                features: vec![1.0, 2.0, 3.0, 4.0],
            }
        );
        assert_eq!(reader.get(1).unwrap().features, vec![5.0, 6.0]);
        assert!(reader.get(2).unwrap().features.is_empty());
        assert!(reader.get(3).is_err());
    }

    #[test]
    fn lazy_and_in_memory_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.h5");
        write_store(&path);
        check(&FeatureReader::open(&path, 2, false).unwrap());
        check(&FeatureReader::open(&path, 2, true).unwrap());
        check(&FeatureReader::open(&path, 2, false).unwrap().source().open().unwrap());
    }

    #[test]
    fn feature_size_must_divide_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.h5");
        write_store(&path);
        assert!(FeatureReader::open(&path, 3, false).is_err());
    }

    #[test]
    fn box_count_bounded_by_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.h5");
        write_store(&path);
        // 4 boxes of width 1 fit, 1 box of width 4 cannot hold 2
        assert!(FeatureReader::open(&path, 1, false).is_ok());
        assert!(FeatureReader::open(&path, 4, false).is_err());
    }

    #[test]
    fn records_are_padded() {
        let reader = FeatureReader::from_records(
            vec![
                FeatureRecord {
                    image_id: 1,
                    num_boxes: 1,
                    features: vec![0.5],
                },
                FeatureRecord {
                    image_id: 2,
                    num_boxes: 3,
                    features: vec![1.0, 2.0, 3.0],
                },
            ],
            1,
        )
        .unwrap();
        assert_eq!(reader.max_boxes(), 3);
        assert_eq!(reader.get(0).unwrap().features, vec![0.5]);
        assert_eq!(reader.image_id(1).unwrap(), 2);
    }
}
