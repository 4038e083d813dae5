//! Masked-diffusion decoding
//!
//! - `sampler`: temperature / top-p / top-k token sampling
//! - `schedule`: timesteps and per-step transfer counts
//! - `transfer`: the `origin`, `transition_K` and `maskgit_plus` policies
//! - `state`: the decode buffer
//! - `denoise`: the step loop

pub mod denoise;
pub mod sampler;
pub mod schedule;
pub mod state;
pub mod transfer;

pub use denoise::{shift_logits_right, DecodedSequence, DiffusionDecoder, NoopHooks, StepHooks};
pub use sampler::{sample_tokens, SamplingParams};
pub use schedule::{Timesteps, TransferPlan};
pub use state::SequenceState;
pub use transfer::{Transfer, TransferAlgorithm, TransferPolicy};
