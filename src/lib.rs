//! dream-rs: masked-diffusion decoding for Dream-style language models using Candle
//!
//! The crate drives an external denoising model through a fixed number of
//! steps, resolving MASK placeholders into concrete tokens with one of three
//! transfer policies (`origin`, `transition_K`, `maskgit_plus`).

pub mod attention;
pub mod config;
pub mod decoding;
pub mod engine;
pub mod error;
pub mod model;

pub use attention::{AttentionLayout, AttentionMask};
pub use config::{DecodePlan, GenerationConfig, SpecialTokens};
pub use decoding::{DecodedSequence, DiffusionDecoder, NoopHooks, StepHooks};
pub use engine::DiffusionEngine;
pub use error::{GenerationError, Result};
pub use model::DenoisingModel;

/// Default number of denoising steps
pub const DEFAULT_STEPS: usize = 512;

/// New tokens generated when neither `max_length` nor `max_new_tokens` is set
pub const DEFAULT_MAX_NEW_TOKENS: usize = 20;

/// Last value of the timestep schedule (the schedule runs 1 -> TIMESTEP_FLOOR)
pub const TIMESTEP_FLOOR: f64 = 1e-10;
