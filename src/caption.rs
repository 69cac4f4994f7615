use std::cmp;
use std::fs;
use std::io;
use std::path;

use std::io::Write;

use crate::error::{Error, Result};
use crate::vocab::{Vocabulary, END_TOKEN, PADDING_TOKEN, TOKENS};

/// One line of the output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub image_id: i64,
    pub caption: String,
}

/// De-tokenizes `indices` and trims everything from the first `@end@` on.
/// Padding tokens never reach the caption.
pub fn decode_caption(indices: &[usize], vocab: &Vocabulary) -> Result<String> {
    let tokens = indices
        .iter()
        .map(|&index| {
            vocab.token(index, TOKENS).ok_or_else(|| Error::UnknownIndex {
                index,
                namespace: TOKENS.to_owned(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let end = tokens
        .iter()
        .position(|&t| t == END_TOKEN)
        .unwrap_or(tokens.len());
    let words: Vec<&str> = tokens[..end]
        .iter()
        .cloned()
        .filter(|&t| t != PADDING_TOKEN)
        .collect();
    Ok(words.join(" "))
}

pub fn encode_caption(caption: &str, vocab: &Vocabulary) -> Result<Vec<usize>> {
    caption
        .split_whitespace()
        .map(|token| {
            vocab.index(token, TOKENS).ok_or_else(|| Error::UnknownToken {
                token: token.to_owned(),
                namespace: TOKENS.to_owned(),
            })
        })
        .collect()
}

/// The first `n` predictions, or all of them when there are fewer.
pub fn sample(predictions: &[Prediction], n: usize) -> &[Prediction] {
    &predictions[..cmp::min(n, predictions.len())]
}

pub fn write_predictions<P>(path: P, predictions: &[Prediction]) -> Result<()>
where
    P: AsRef<path::Path>,
{
    let mut w = io::BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer(&mut w, predictions)?;
    w.flush()?;
    Ok(())
}
