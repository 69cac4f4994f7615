use std::convert::TryFrom;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Parses `--gpu-ids` values; each may hold several comma-separated ids.
    pub fn parse_ids<S>(values: &[S]) -> Result<Vec<i64>>
    where
        S: AsRef<str>,
    {
        let mut ids = Vec::new();
        for v in values {
            for id in v.as_ref().split(',').map(str::trim).filter(|s| !s.is_empty()) {
                ids.push(id.parse::<i64>().map_err(|_| Error::GpuId(id.to_owned()))?);
            }
        }
        Ok(ids)
    }

    /// Devices to build replicas on.
    ///
    /// `ids[0]` picks the device, `-1` meaning CPU. Several ids without `-1`
    /// select data-parallel inference over all of them.
    pub fn from_gpu_ids(ids: &[i64]) -> Result<Vec<Device>> {
        let first = *ids.first().ok_or(Error::NoDevice)?;
        let devices = ids
            .iter()
            .map(|&id| Device::from_id(id))
            .collect::<Result<Vec<_>>>()?;
        if ids.len() > 1 && !ids.contains(&-1) {
            Ok(devices)
        } else {
            Ok(vec![Device::from_id(first)?])
        }
    }

    fn from_id(id: i64) -> Result<Device> {
        match id {
            -1 => Ok(Device::Cpu),
            id => u32::try_from(id)
                .map(Device::Gpu)
                .map_err(|_| Error::GpuId(id.to_string())),
        }
    }

    /// Backend config for a replica on this device: `base` as-is on CPU,
    /// otherwise `base` with `device_id` set.
    ///
    /// Only backends that read `device_id` place the replica on that GPU.
    /// menoh's `mkldnn` backends ignore the key, so every replica built with
    /// them runs on the CPU and `--gpu-ids` only changes the number of
    /// replicas.
    pub fn backend_config(&self, base: &str) -> Result<String> {
        match *self {
            Device::Cpu => Ok(base.to_owned()),
            Device::Gpu(id) => {
                let mut config = if base.trim().is_empty() {
                    serde_json::Map::new()
                } else {
                    match serde_json::from_str(base)? {
                        serde_json::Value::Object(map) => map,
                        _ => return Err(Error::Config("backend config is not a JSON object".into())),
                    }
                };
                config.insert("device_id".into(), id.into());
                Ok(serde_json::to_string(&config)?)
            }
        }
    }
}

impl Device {
    /// Whether `backend` honours the `device_id` of [`Device::backend_config`].
    pub fn placed_by(backend: &str) -> bool {
        !backend.starts_with("mkldnn")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repeated_and_comma_separated() {
        assert_eq!(Device::parse_ids(&["0", "1,2", " 3 "]).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(Device::parse_ids(&["-1"]).unwrap(), vec![-1]);
        assert!(Device::parse_ids(&["gpu0"]).is_err());
    }

    #[test]
    fn single_id() {
        assert_eq!(Device::from_gpu_ids(&[-1]).unwrap(), vec![Device::Cpu]);
        assert_eq!(Device::from_gpu_ids(&[2]).unwrap(), vec![Device::Gpu(2)]);
    }

    #[test]
    fn several_ids_are_replicas() {
        assert_eq!(
            Device::from_gpu_ids(&[0, 1]).unwrap(),
            vec![Device::Gpu(0), Device::Gpu(1)]
        );
    }

    #[test]
    fn cpu_in_list_disables_replication() {
        assert_eq!(Device::from_gpu_ids(&[0, -1]).unwrap(), vec![Device::Gpu(0)]);
        assert_eq!(Device::from_gpu_ids(&[-1, 0]).unwrap(), vec![Device::Cpu]);
    }

    #[test]
    fn invalid_ids() {
        assert!(Device::from_gpu_ids(&[]).is_err());
        assert!(Device::from_gpu_ids(&[-2]).is_err());
        assert!(Device::from_gpu_ids(&[0, -3]).is_err());
    }

    #[test]
    fn backend_config_per_device() {
        assert_eq!(Device::Cpu.backend_config("").unwrap(), "");
        assert_eq!(Device::Gpu(1).backend_config("").unwrap(), r#"{"device_id":1}"#);
        let merged: serde_json::Value =
            serde_json::from_str(&Device::Gpu(3).backend_config(r#"{"threads":4}"#).unwrap())
                .unwrap();
        assert_eq!(merged["device_id"], 3);
        assert_eq!(merged["threads"], 4);
        assert!(Device::Gpu(0).backend_config("[]").is_err());
    }

    #[test]
    fn mkldnn_ignores_device_id() {
        assert!(!Device::placed_by("mkldnn"));
        assert!(!Device::placed_by("mkldnn_with_generic_fallback"));
        assert!(Device::placed_by("cuda"));
    }
}
