use std::cmp;
use std::ops;
use std::sync::mpsc;
use std::thread;

use crate::error::{Error, Result};
use crate::features::{FeatureReader, FeatureRecord, FeatureSource};

const PREFETCH: usize = 2;

/// Features of several images, each padded with zero rows to `max_boxes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub image_ids: Vec<i64>,
    pub features: Vec<f32>,
    pub max_boxes: usize,
    pub feature_size: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    /// Size of one instance in `features`.
    pub fn stride(&self) -> usize {
        self.max_boxes * self.feature_size
    }

    /// Splits along the batch axis into at most `parts` contiguous chunks.
    pub fn split(&self, parts: usize) -> Vec<Batch> {
        if self.is_empty() || parts == 0 {
            return Vec::new();
        }
        let chunk = (self.len() + parts - 1) / parts;
        let stride = self.stride();
        self.image_ids
            .chunks(chunk)
            .enumerate()
            .map(|(k, ids)| {
                let start = k * chunk * stride;
                Batch {
                    image_ids: ids.to_vec(),
                    features: self.features[start..start + ids.len() * stride].to_vec(),
                    max_boxes: self.max_boxes,
                    feature_size: self.feature_size,
                }
            })
            .collect()
    }
}

/// Feature records in store order.
pub struct InferenceDataset {
    reader: FeatureReader,
}

impl InferenceDataset {
    pub fn new(reader: FeatureReader) -> Self {
        Self { reader }
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<FeatureRecord> {
        self.reader.get(index)
    }

    pub fn source(&self) -> FeatureSource {
        self.reader.source()
    }

    pub fn collate(&self, range: ops::Range<usize>) -> Result<Batch> {
        let max_boxes = self.reader.max_boxes();
        let feature_size = self.reader.feature_size();
        let stride = max_boxes * feature_size;

        let mut image_ids = Vec::with_capacity(range.len());
        let mut features = vec![0.; range.len() * stride];
        for (k, i) in range.enumerate() {
            let record = self.get(i)?;
            features[k * stride..k * stride + record.features.len()]
                .copy_from_slice(&record.features);
            image_ids.push(record.image_id);
        }
        Ok(Batch {
            image_ids,
            features,
            max_boxes,
            feature_size,
        })
    }
}

fn batch_range(batch: usize, batch_size: usize, len: usize) -> ops::Range<usize> {
    let start = batch * batch_size;
    start..cmp::min(start + batch_size, len)
}

/// Sequential batches over an [`InferenceDataset`], optionally prefetched by
/// `num_workers` reader threads.
pub struct DataLoader {
    dataset: InferenceDataset,
    batch_size: usize,
    num_workers: usize,
}

impl DataLoader {
    pub fn new(dataset: InferenceDataset, batch_size: usize, num_workers: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            num_workers,
        })
    }

    pub fn dataset(&self) -> &InferenceDataset {
        &self.dataset
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Batches {
        let total = self.len();
        if self.num_workers == 0 || total == 0 {
            return Batches {
                loader: self,
                next: 0,
                total,
                workers: Vec::new(),
            };
        }

        let n = cmp::min(self.num_workers, total);
        let len = self.dataset.len();
        let workers = (0..n)
            .map(|w| {
                let (tx, rx) = mpsc::sync_channel(PREFETCH);
                let source = self.dataset.source();
                let batch_size = self.batch_size;
                let handle = thread::spawn(move || {
                    let dataset = match source.open() {
                        Ok(reader) => InferenceDataset::new(reader),
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    for b in (w..total).step_by(n) {
                        let batch = dataset.collate(batch_range(b, batch_size, len));
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                });
                Worker {
                    rx: Some(rx),
                    handle: Some(handle),
                }
            })
            .collect();
        tracing::debug!("started {} loader workers", n);

        Batches {
            loader: self,
            next: 0,
            total,
            workers,
        }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Result<Batch>;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Batches<'a> {
        self.iter()
    }
}

struct Worker {
    rx: Option<mpsc::Receiver<Result<Batch>>>,
    handle: Option<thread::JoinHandle<()>>,
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    next: usize,
    total: usize,
    workers: Vec<Worker>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.next >= self.total {
            return None;
        }
        let b = self.next;
        self.next += 1;

        if self.workers.is_empty() {
            let loader = self.loader;
            return Some(
                loader
                    .dataset
                    .collate(batch_range(b, loader.batch_size, loader.dataset.len())),
            );
        }

        // worker w owns batches w, w + n, w + 2n, ...
        let n = self.workers.len();
        let received = self.workers[b % n].rx.as_ref().map(|rx| rx.recv());
        match received {
            Some(Ok(Ok(batch))) => Some(Ok(batch)),
            Some(Ok(Err(e))) => {
                self.next = self.total;
                Some(Err(e))
            }
            _ => {
                self.next = self.total;
                Some(Err(Error::Worker(format!(
                    "loader worker {} stopped before batch {}",
                    b % n,
                    b
                ))))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.total - self.next;
        (rest, Some(rest))
    }
}

impl<'a> Drop for Batches<'a> {
    fn drop(&mut self) {
        // dropping the receivers unblocks workers waiting to send
        for w in self.workers.iter_mut() {
            w.rx.take();
        }
        for w in self.workers.iter_mut() {
            if let Some(handle) = w.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features;
    use std::fs;
    use std::path;

    fn dataset(n: usize) -> InferenceDataset {
        let records = (0..n)
            .map(|i| FeatureRecord {
                image_id: i as i64 * 10,
                num_boxes: i % 3,
                features: vec![i as f32; (i % 3) * 2],
            })
            .collect();
        InferenceDataset::new(FeatureReader::from_records(records, 2).unwrap())
    }

    fn ids(loader: &DataLoader) -> Vec<Vec<i64>> {
        loader.iter().map(|b| b.unwrap().image_ids).collect()
    }

    #[test]
    fn collate_pads_instances() {
        let batch = dataset(3).collate(0..3).unwrap();
        assert_eq!(batch.stride(), 4);
        assert_eq!(
            batch.features,
            vec![0., 0., 0., 0., 1., 1., 0., 0., 2., 2., 2., 2.]
        );
    }

    #[test]
    fn serial_batches_keep_order() {
        let loader = DataLoader::new(dataset(7), 3, 0).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!(ids(&loader), vec![vec![0, 10, 20], vec![30, 40, 50], vec![60]]);
    }

    #[test]
    fn workers_keep_order() {
        let serial = DataLoader::new(dataset(23), 4, 0).unwrap();
        for workers in 1..5 {
            let parallel = DataLoader::new(dataset(23), 4, workers).unwrap();
            assert_eq!(ids(&parallel), ids(&serial));
            let batches: Vec<_> = parallel.iter().map(|b| b.unwrap()).collect();
            let expected: Vec<_> = serial.iter().map(|b| b.unwrap()).collect();
            assert_eq!(batches, expected);
        }
    }

    #[test]
    fn early_drop_stops_workers() {
        let loader = DataLoader::new(dataset(100), 1, 3).unwrap();
        let first: Vec<_> = loader.iter().take(2).map(|b| b.unwrap().image_ids).collect();
        assert_eq!(first, vec![vec![0], vec![10]]);
    }

    #[test]
    fn empty_dataset() {
        let loader = DataLoader::new(dataset(0), 4, 2).unwrap();
        assert!(loader.is_empty());
        assert_eq!(loader.iter().count(), 0);
    }

    #[test]
    fn zero_batch_size() {
        assert!(DataLoader::new(dataset(3), 0, 0).is_err());
    }

    fn lazy_store() -> (tempfile::TempDir, path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.h5");
        features::tests::write_store(&path);
        (dir, path)
    }

    #[test]
    fn workers_reopen_lazy_store() {
        let (_dir, path) = lazy_store();
        let serial = DataLoader::new(
            InferenceDataset::new(FeatureReader::open(&path, 2, false).unwrap()),
            1,
            0,
        )
        .unwrap();
        let parallel = DataLoader::new(
            InferenceDataset::new(FeatureReader::open(&path, 2, false).unwrap()),
            1,
            2,
        )
        .unwrap();
        assert_eq!(ids(&parallel), vec![vec![42], vec![7], vec![9]]);
        let batches: Vec<_> = parallel.iter().map(|b| b.unwrap()).collect();
        let expected: Vec<_> = serial.iter().map(|b| b.unwrap()).collect();
        assert_eq!(batches, expected);
    }

    #[test]
    fn worker_open_failure_ends_iteration() {
        let (_dir, path) = lazy_store();
        let loader = DataLoader::new(
            InferenceDataset::new(FeatureReader::open(&path, 2, false).unwrap()),
            1,
            2,
        )
        .unwrap();
        fs::remove_file(&path).unwrap();

        let mut batches = loader.iter();
        match batches.next() {
            Some(Err(Error::Hdf5(_))) => {}
            other => panic!("expected an hdf5 error, got {:?}", other),
        }
        assert!(batches.next().is_none());
    }

    #[test]
    fn split_is_contiguous() {
        let batch = dataset(5).collate(0..5).unwrap();
        let parts = batch.split(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].image_ids, vec![0, 10, 20]);
        assert_eq!(parts[1].image_ids, vec![30, 40]);
        assert_eq!(parts[1].features.len(), 2 * batch.stride());
        assert_eq!(batch.split(8).len(), 5);
    }
}
