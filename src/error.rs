use std::io;
use std::path;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Menoh(#[from] menoh::Error),
    #[error(transparent)]
    Hdf5(#[from] hdf5::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("vocabulary {}: {reason}", .dir.display())]
    Vocabulary { dir: path::PathBuf, reason: String },
    #[error("token {token:?} is not in namespace {namespace:?}")]
    UnknownToken { token: String, namespace: String },
    #[error("token index {index} is not in namespace {namespace:?}")]
    UnknownIndex { index: usize, namespace: String },
    #[error("feature store {}: {reason}", .path.display())]
    Features { path: path::PathBuf, reason: String },
    #[error("feature index {index} out of range for {len} records")]
    FeatureIndex { index: usize, len: usize },
    #[error("invalid gpu id {0:?} (use -1 for CPU)")]
    GpuId(String),
    #[error("no device given")]
    NoDevice,
    #[error("model: {0}")]
    Model(String),
    #[error("worker: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send + 'static>() {}

    #[test]
    fn errors_cross_threads() {
        assert_send::<Error>();
        assert_send::<Result<Vec<usize>>>();
    }
}
