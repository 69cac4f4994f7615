#[macro_use]
extern crate serde_derive;

pub mod caption;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod features;
pub mod inference;
pub mod model;
pub mod vocab;

pub use crate::error::{Error, Result};
