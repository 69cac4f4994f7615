use std::time;

use indicatif::ProgressBar;

use crate::caption::{decode_caption, Prediction};
use crate::dataset::DataLoader;
use crate::error::{Error, Result};
use crate::model::Captioner;
use crate::vocab::Vocabulary;

/// Captions every image of `loader` in store order, advancing `progress` once
/// per batch.
pub fn run<C>(
    loader: &DataLoader,
    captioner: &mut C,
    vocab: &Vocabulary,
    progress: &ProgressBar,
) -> Result<Vec<Prediction>>
where
    C: Captioner + ?Sized,
{
    let total = loader.len();
    progress.set_length(total as u64);
    let started = time::Instant::now();
    let mut predictions = Vec::with_capacity(loader.dataset().len());

    for (b, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let rows = captioner.predict(&batch)?;
        if rows.len() != batch.len() {
            return Err(Error::Model(format!(
                "{} prediction rows for a batch of {}",
                rows.len(),
                batch.len()
            )));
        }
        for (&image_id, row) in batch.image_ids.iter().zip(rows.iter()) {
            predictions.push(Prediction {
                image_id,
                caption: decode_caption(row, vocab)?,
            });
        }
        tracing::debug!(
            "batch {}/{}: {} images, {:.2?} elapsed",
            b + 1,
            total,
            batch.len(),
            started.elapsed()
        );
        progress.inc(1);
    }
    progress.finish();

    tracing::info!(
        "captioned {} images in {:.2?}",
        predictions.len(),
        started.elapsed()
    );
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Batch, InferenceDataset};
    use crate::device::Device;
    use crate::features::{FeatureReader, FeatureRecord};
    use crate::model::tests::Echo;
    use crate::model::{DataParallel, Predictions};
    use crate::vocab::TOKENS;

    fn vocab() -> Vocabulary {
        Vocabulary::from_tokens(TOKENS, vec!["@end@", "a", "dog", "on", "grass"], false)
    }

    fn loader(n: i64, batch_size: usize, workers: usize) -> DataLoader {
        let records = (0..n)
            .map(|i| FeatureRecord {
                image_id: i,
                num_boxes: 1,
                features: vec![i as f32],
            })
            .collect();
        let reader = FeatureReader::from_records(records, 1).unwrap();
        DataLoader::new(InferenceDataset::new(reader), batch_size, workers).unwrap()
    }

    #[test]
    fn captions_in_store_order() {
        let progress = ProgressBar::hidden();
        let predictions =
            run(&loader(5, 2, 1), &mut Echo { offset: 0 }, &vocab(), &progress).unwrap();
        let captions: Vec<_> = predictions
            .iter()
            .map(|p| (p.image_id, p.caption.as_str()))
            .collect();
        assert_eq!(
            captions,
            vec![
                (0, ""),
                (1, "a a"),
                (2, "dog dog"),
                (3, "on on"),
                (4, "grass grass")
            ]
        );
    }

    #[test]
    fn progress_advances_per_batch() {
        let progress = ProgressBar::hidden();
        run(&loader(7, 3, 0), &mut Echo { offset: 0 }, &vocab(), &progress).ok();
        // ids 5 and 6 are outside the vocabulary, so only the first batch lands
        assert_eq!(progress.length(), Some(3));
        assert_eq!(progress.position(), 1);

        let progress = ProgressBar::hidden();
        run(&loader(5, 2, 0), &mut Echo { offset: 0 }, &vocab(), &progress).unwrap();
        assert_eq!(progress.length(), Some(3));
        assert_eq!(progress.position(), 3);
        assert!(progress.is_finished());
    }

    #[test]
    fn data_parallel_matches_single_replica() {
        let progress = ProgressBar::hidden();
        let mut parallel =
            DataParallel::new(&[Device::Gpu(0), Device::Gpu(1)], |_| Ok(Echo { offset: 0 }))
                .unwrap();

        // ids past the vocabulary are a contract violation
        assert!(run(&loader(9, 4, 0), &mut Echo { offset: 0 }, &vocab(), &progress).is_err());
        assert!(run(&loader(9, 4, 2), &mut parallel, &vocab(), &progress).is_err());

        let single = run(&loader(4, 3, 0), &mut Echo { offset: 0 }, &vocab(), &progress).unwrap();
        let replicated = run(&loader(4, 3, 2), &mut parallel, &vocab(), &progress).unwrap();
        assert_eq!(single, replicated);
        assert_eq!(single[1].caption, "a a");
    }

    struct Short;

    impl Captioner for Short {
        fn predict(&mut self, _: &Batch) -> Result<Predictions> {
            Ok(vec![vec![0]])
        }
    }

    #[test]
    fn row_count_must_match() {
        let progress = ProgressBar::hidden();
        assert!(run(&loader(3, 3, 0), &mut Short, &vocab(), &progress).is_err());
    }
}
