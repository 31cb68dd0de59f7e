pub mod codec;
pub mod config;
pub mod controller;
pub mod db;
mod error;
pub mod finalizer;
pub mod geometry;
pub mod joblog;
pub mod media;
pub mod paths;
pub mod processor;
pub mod queue;
pub mod redirects;
pub mod references;
pub mod state;

pub use error::{EngineError, Result};
