use std::path;
use std::sync::{mpsc, Arc};
use std::thread;

use crate::dataset::Batch;
use crate::device::Device;
use crate::error::{Error, Result};

/// Token indices per instance, `max_caption_length` each.
pub type Predictions = Vec<Vec<usize>>;

pub trait Captioner {
    /// One row of predicted token indices per instance of `batch`.
    fn predict(&mut self, batch: &Batch) -> Result<Predictions>;
}

impl<C> Captioner for Box<C>
where
    C: Captioner + ?Sized,
{
    fn predict(&mut self, batch: &Batch) -> Result<Predictions> {
        (**self).predict(batch)
    }
}

/// Shapes fixed when the graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub batch_capacity: usize,
    pub max_boxes: usize,
    pub feature_size: usize,
    pub max_caption_length: usize,
}

/// Captioner exported to ONNX: `features[batch, boxes, feature]` in,
/// `predictions[batch, max_caption_length]` out. Beam search runs inside the
/// graph.
pub struct OnnxCaptioner {
    model: menoh::Model,
    input: String,
    output: String,
    dims: ModelDims,
}

impl OnnxCaptioner {
    pub fn from_onnx<P>(
        path: P,
        input: &str,
        output: &str,
        backend: &str,
        backend_config: &str,
        dims: ModelDims,
    ) -> Result<Self>
    where
        P: AsRef<path::Path>,
    {
        let model = menoh::Builder::from_onnx(&path)?
            .add_input::<f32>(
                input,
                &[dims.batch_capacity, dims.max_boxes, dims.feature_size],
            )?
            .add_output(output)?
            .build(backend, backend_config)?;
        tracing::debug!(
            "built {} on {} ({:?})",
            path.as_ref().display(),
            backend,
            dims
        );
        Ok(Self {
            model,
            input: input.to_owned(),
            output: output.to_owned(),
            dims,
        })
    }
}

impl Captioner for OnnxCaptioner {
    fn predict(&mut self, batch: &Batch) -> Result<Predictions> {
        let dims = self.dims;
        if batch.len() > dims.batch_capacity {
            return Err(Error::Model(format!(
                "batch of {} exceeds capacity {}",
                batch.len(),
                dims.batch_capacity
            )));
        }
        if batch.max_boxes != dims.max_boxes || batch.feature_size != dims.feature_size {
            return Err(Error::Model(format!(
                "batch has {}x{} features, model expects {}x{}",
                batch.max_boxes, batch.feature_size, dims.max_boxes, dims.feature_size
            )));
        }

        {
            let in_ = self.model.get_variable_mut::<f32>(&self.input)?.1;
            fill_input(in_, &batch.features)?;
        }
        self.model.run()?;

        let out = self.model.get_variable::<f32>(&self.output)?.1;
        output_rows(out, dims, batch.len())
    }
}

/// Copies `features` to the front of `dst` and zeroes the rest.
fn fill_input(dst: &mut [f32], features: &[f32]) -> Result<()> {
    let n = features.len();
    if dst.len() < n {
        return Err(Error::Model(format!(
            "input holds {} values, batch has {}",
            dst.len(),
            n
        )));
    }
    dst[..n].copy_from_slice(features);
    for x in dst[n..].iter_mut() {
        *x = 0.;
    }
    Ok(())
}

/// First `len` rows of a `batch_capacity x max_caption_length` output.
fn output_rows(out: &[f32], dims: ModelDims, len: usize) -> Result<Predictions> {
    if out.len() != dims.batch_capacity * dims.max_caption_length {
        return Err(Error::Model(format!(
            "output holds {} values, expected {}x{}",
            out.len(),
            dims.batch_capacity,
            dims.max_caption_length
        )));
    }
    if dims.max_caption_length == 0 {
        return Ok(vec![Vec::new(); len]);
    }
    out.chunks(dims.max_caption_length)
        .take(len)
        .map(|row| row.iter().map(|&p| token_index(p)).collect::<Result<Vec<_>>>())
        .collect()
}

/// Predictions come out of the graph as floats.
fn token_index(p: f32) -> Result<usize> {
    if !p.is_finite() || p < 0. {
        return Err(Error::Model(format!("predicted token index {}", p)));
    }
    Ok(p.round() as usize)
}

type Reply = Result<Predictions>;

struct Replica {
    device: Device,
    tx: Option<mpsc::Sender<Batch>>,
    rx: mpsc::Receiver<Reply>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Replicates a captioner over several devices. Every replica lives on its
/// own thread; a batch is scattered along its first axis and gathered back in
/// order.
pub struct DataParallel {
    replicas: Vec<Replica>,
}

impl DataParallel {
    pub fn new<F, C>(devices: &[Device], build: F) -> Result<Self>
    where
        F: Fn(Device) -> Result<C> + Send + Sync + 'static,
        C: Captioner + 'static,
    {
        let build = Arc::new(build);
        let mut replicas = Vec::with_capacity(devices.len());
        let mut ready = Vec::with_capacity(devices.len());
        for &device in devices {
            let (batch_tx, batch_rx) = mpsc::channel::<Batch>();
            let (reply_tx, reply_rx) = mpsc::channel::<Reply>();
            let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
            let build = build.clone();
            let handle = thread::spawn(move || {
                let mut captioner = match build(device) {
                    Ok(c) => {
                        let _ = ready_tx.send(Ok(()));
                        c
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for batch in batch_rx {
                    let reply = captioner.predict(&batch);
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            });
            replicas.push(Replica {
                device,
                tx: Some(batch_tx),
                rx: reply_rx,
                handle: Some(handle),
            });
            ready.push(ready_rx);
        }

        let parallel = Self { replicas };
        for (replica, ready) in parallel.replicas.iter().zip(ready) {
            match ready.recv() {
                Ok(Ok(())) => tracing::info!("replica ready on {}", replica.device),
                Ok(Err(e)) => {
                    tracing::error!("replica on {} failed to start", replica.device);
                    return Err(e);
                }
                Err(_) => {
                    return Err(Error::Worker(format!(
                        "replica on {} exited during startup",
                        replica.device
                    )))
                }
            }
        }
        Ok(parallel)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.replicas.iter().map(|r| r.device).collect()
    }
}

impl Captioner for DataParallel {
    fn predict(&mut self, batch: &Batch) -> Result<Predictions> {
        let parts = batch.split(self.replicas.len());
        for (replica, part) in self.replicas.iter().zip(parts.iter()) {
            replica
                .tx
                .as_ref()
                .and_then(|tx| tx.send(part.clone()).ok())
                .ok_or_else(|| Error::Worker(format!("replica on {} is gone", replica.device)))?;
        }

        // receive every reply before failing so no replica is left mid-batch
        let replies: Vec<_> = self
            .replicas
            .iter()
            .take(parts.len())
            .map(|r| (r.device, r.rx.recv()))
            .collect();
        let mut predictions = Vec::with_capacity(batch.len());
        for (device, reply) in replies {
            match reply {
                Ok(Ok(rows)) => predictions.extend(rows),
                Ok(Err(e)) => {
                    tracing::error!("replica on {} failed", device);
                    return Err(e);
                }
                Err(_) => return Err(Error::Worker(format!("replica on {} is gone", device))),
            }
        }
        Ok(predictions)
    }
}

impl Drop for DataParallel {
    fn drop(&mut self) {
        for r in self.replicas.iter_mut() {
            r.tx.take();
        }
        for r in self.replicas.iter_mut() {
            if let Some(handle) = r.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
