use std::fmt;
use std::fs;
use std::path;

use serde_yaml::Value;

use crate::error::{Error, Result};

/// Effective configuration of an inference run.
///
/// Keys are upper case in YAML (`DATA.MAX_CAPTION_LENGTH`, ...). A file or an
/// override may only set keys that exist in [`Config::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct Config {
    pub random_seed: u64,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub optim: OptimConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct DataConfig {
    pub vocabulary: path::PathBuf,
    pub test_features: path::PathBuf,
    pub max_caption_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct ModelConfig {
    pub image_feature_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub attention_projection_size: usize,
    pub beam_size: usize,
    pub backend: String,
    pub backend_config: String,
    pub input_name: String,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct OptimConfig {
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            random_seed: 0,
            data: DataConfig {
                vocabulary: "data/vocabulary".into(),
                test_features: "data/nocaps_val_vg_detector_features_adaptive.h5".into(),
                max_caption_length: 20,
            },
            model: ModelConfig {
                image_feature_size: 2048,
                embedding_size: 1000,
                hidden_size: 1200,
                attention_projection_size: 768,
                beam_size: 5,
                backend: "mkldnn".into(),
                backend_config: String::new(),
                input_name: "image_features".into(),
                output_name: "predictions".into(),
            },
            optim: OptimConfig { batch_size: 150 },
        }
    }
}

impl Config {
    /// Defaults, then the YAML file at `path`, then `overrides` (`KEY.PATH=VALUE`).
    pub fn load<P>(path: P, overrides: &[String]) -> Result<Self>
    where
        P: AsRef<path::Path>,
    {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text, overrides)
    }

    pub fn from_yaml_str(text: &str, overrides: &[String]) -> Result<Self> {
        let mut tree = serde_yaml::to_value(Self::default())?;
        if !text.trim().is_empty() {
            match serde_yaml::from_str::<Value>(text)? {
                Value::Null => {}
                file => merge(&mut tree, file, "")?,
            }
        }
        for o in overrides {
            apply_override(&mut tree, o)?;
        }
        let config: Self = serde_yaml::from_value(tree)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("OPTIM.BATCH_SIZE", self.optim.batch_size),
            ("DATA.MAX_CAPTION_LENGTH", self.data.max_caption_length),
            ("MODEL.IMAGE_FEATURE_SIZE", self.model.image_feature_size),
            ("MODEL.BEAM_SIZE", self.model.beam_size),
        ];
        for &(key, value) in positive.iter() {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", key)));
            }
        }
        if !self.model.backend_config.trim().is_empty() {
            match serde_json::from_str::<serde_json::Value>(&self.model.backend_config) {
                Ok(serde_json::Value::Object(_)) => {}
                _ => {
                    return Err(Error::Config(
                        "MODEL.BACKEND_CONFIG must be empty or a JSON object".into(),
                    ))
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = serde_yaml::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn merge(dst: &mut Value, src: Value, key: &str) -> Result<()> {
    match (dst, src) {
        (Value::Mapping(dst), Value::Mapping(src)) => {
            for (k, v) in src {
                let name = k
                    .as_str()
                    .ok_or_else(|| Error::Config(format!("non-string key under {:?}", key)))?;
                let full = join(key, name);
                let slot = dst
                    .get_mut(name)
                    .ok_or_else(|| Error::Config(format!("unknown key {}", full)))?;
                merge(slot, v, &full)?;
            }
            Ok(())
        }
        (dst, src) => {
            if kind(dst) != kind(&src) {
                return Err(Error::Config(format!(
                    "{} expects a {}, got a {}",
                    key,
                    kind(dst),
                    kind(&src)
                )));
            }
            *dst = src;
            Ok(())
        }
    }
}

fn apply_override(tree: &mut Value, entry: &str) -> Result<()> {
    let (key, raw) = entry
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("override {:?} is not KEY=VALUE", entry)))?;
    let key = key.trim();

    let mut slot = &mut *tree;
    for part in key.split('.') {
        slot = slot
            .get_mut(part)
            .ok_or_else(|| Error::Config(format!("unknown key {}", key)))?;
    }

    // string keys take the text as-is so paths and JSON blobs need no quoting
    let value = match slot {
        Value::String(_) => Value::String(raw.to_owned()),
        _ => serde_yaml::from_str(raw)?,
    };
    merge(slot, value, key)
}
