//! rollcall-models: ONNX Runtime implementations of the face localizer,
//! embedding extractor and liveness model consumed by `rollcall-core`.
//!
//! Sessions live on one engine thread; [`ModelHandle`] is the async,
//! cloneable front door that implements the core collaborator traits.

pub mod detector;
pub mod embedder;
pub mod engine;
pub mod liveness;

use thiserror::Error;

pub use engine::{spawn_engine, EngineError, ModelHandle, ModelPaths};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
