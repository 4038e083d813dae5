//! Generation configuration for diffusion decoding

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decoding::{SamplingParams, TransferAlgorithm, TransferPolicy};
use crate::error::{GenerationError, Result};
use crate::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_STEPS};

/// Decoding parameters, as found in a `generation_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature; 0 selects the arg-max token
    #[serde(default)]
    pub temperature: f32,

    /// Nucleus filtering threshold in (0, 1]
    #[serde(default)]
    pub top_p: Option<f32>,

    /// Keep only the k most likely tokens
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Total sequence length, prompt included
    #[serde(default)]
    pub max_length: Option<usize>,

    /// New tokens to generate; takes precedence over `max_length`
    #[serde(default)]
    pub max_new_tokens: Option<usize>,

    /// Denoising step budget
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// Transfer policy: "origin", "transition_<K>" or "maskgit_plus"
    #[serde(default = "default_alg")]
    pub alg: String,

    /// Softness of position selection for transition/maskgit_plus
    #[serde(default)]
    pub alg_temp: Option<f32>,

    #[serde(default)]
    pub mask_token_id: Option<u32>,

    #[serde(default)]
    pub pad_token_id: Option<u32>,

    #[serde(default)]
    pub eos_token_id: Option<u32>,

    /// Keep a snapshot of the sequence after every step
    #[serde(default)]
    pub output_history: bool,

    /// Replicate each input row this many times before decoding
    #[serde(default = "default_num_return_sequences")]
    pub num_return_sequences: usize,
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_alg() -> String {
    "origin".to_string()
}

fn default_num_return_sequences() -> usize {
    1
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: None,
            top_k: None,
            max_length: None,
            max_new_tokens: None,
            steps: DEFAULT_STEPS,
            alg: default_alg(),
            alg_temp: None,
            mask_token_id: None,
            pad_token_id: None,
            eos_token_id: None,
            output_history: false,
            num_return_sequences: 1,
        }
    }
}

/// Resolved special token ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub mask_token_id: u32,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
}

/// Everything the decode loop needs, validated and with lengths resolved
#[derive(Debug, Clone)]
pub struct DecodePlan {
    pub sampling: SamplingParams,
    pub policy: TransferPolicy,
    pub steps: usize,
    pub max_length: usize,
    pub tokens: SpecialTokens,
    pub output_history: bool,
    pub num_return_sequences: usize,
}

impl GenerationConfig {
    /// Load configuration from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_alg(mut self, alg: impl Into<String>) -> Self {
        self.alg = alg.into();
        self
    }

    /// Fill unset special tokens from `defaults` (usually the model's config)
    pub fn fill_special_tokens_from(&mut self, defaults: &GenerationConfig) {
        self.mask_token_id = self.mask_token_id.or(defaults.mask_token_id);
        self.pad_token_id = self.pad_token_id.or(defaults.pad_token_id);
        self.eos_token_id = self.eos_token_id.or(defaults.eos_token_id);
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }

    /// Check parameter ranges and parse the transfer algorithm
    pub fn validate(&self) -> Result<TransferAlgorithm> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(GenerationError::InvalidConfig(format!(
                "`temperature` must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(GenerationError::InvalidConfig(format!(
                    "`top_p` must be in (0, 1], got {}",
                    top_p
                )));
            }
        }
        if self.top_k == Some(0) {
            return Err(GenerationError::InvalidConfig(
                "`top_k` must be a positive integer".to_string(),
            ));
        }
        if self.steps == 0 {
            return Err(GenerationError::InvalidConfig(
                "`steps` must be a positive integer".to_string(),
            ));
        }
        if let Some(alg_temp) = self.alg_temp {
            if !alg_temp.is_finite() || alg_temp < 0.0 {
                return Err(GenerationError::InvalidConfig(format!(
                    "`alg_temp` must be a finite value >= 0, got {}",
                    alg_temp
                )));
            }
        }
        if self.num_return_sequences == 0 {
            return Err(GenerationError::InvalidConfig(
                "`num_return_sequences` must be at least 1".to_string(),
            ));
        }
        self.alg.parse()
    }

    pub fn special_tokens(&self) -> Result<SpecialTokens> {
        Ok(SpecialTokens {
            mask_token_id: self
                .mask_token_id
                .ok_or(GenerationError::MissingSpecialToken("mask_token_id"))?,
            pad_token_id: self
                .pad_token_id
                .ok_or(GenerationError::MissingSpecialToken("pad_token_id"))?,
            eos_token_id: self
                .eos_token_id
                .ok_or(GenerationError::MissingSpecialToken("eos_token_id"))?,
        })
    }

    /// Resolve the total decode length for a prompt of `input_len` tokens
    ///
    /// `max_new_tokens` wins over `max_length`. With neither set, 20 new tokens
    /// are generated. The result is clamped to the model's position capacity.
    pub fn resolve_max_length(
        &self,
        input_len: usize,
        max_position_embeddings: Option<usize>,
    ) -> Result<usize> {
        let mut max_length = match (self.max_new_tokens, self.max_length) {
            (Some(max_new_tokens), max_length) => {
                if let Some(max_length) = max_length {
                    tracing::warn!(
                        "Both `max_new_tokens` (={}) and `max_length` (={}) seem to have been set. \
                         `max_new_tokens` will take precedence.",
                        max_new_tokens,
                        max_length
                    );
                }
                input_len.checked_add(max_new_tokens).ok_or_else(|| {
                    GenerationError::InvalidConfig(format!(
                        "`max_new_tokens` (={}) overflows the sequence length",
                        max_new_tokens
                    ))
                })?
            }
            (None, Some(max_length)) => max_length,
            (None, None) => {
                tracing::warn!(
                    "Using the default of {} new tokens to control the generation length. \
                     Set `max_new_tokens` to control it explicitly.",
                    DEFAULT_MAX_NEW_TOKENS
                );
                input_len.saturating_add(DEFAULT_MAX_NEW_TOKENS)
            }
        };

        if let Some(capacity) = max_position_embeddings {
            if max_length > capacity {
                tracing::debug!(
                    "Clamping max_length {} to max_position_embeddings {}",
                    max_length,
                    capacity
                );
                max_length = capacity;
            }
        }

        if input_len >= max_length {
            return Err(GenerationError::InputTooLong {
                input_len,
                max_length,
            });
        }
        Ok(max_length)
    }

    /// Validate the config and resolve it against a prompt length
    pub fn resolve(
        &self,
        input_len: usize,
        max_position_embeddings: Option<usize>,
    ) -> Result<DecodePlan> {
        let algorithm = self.validate()?;
        let tokens = self.special_tokens()?;
        let max_length = self.resolve_max_length(input_len, max_position_embeddings)?;

        Ok(DecodePlan {
            sampling: self.sampling_params(),
            policy: TransferPolicy {
                algorithm,
                alg_temp: self.alg_temp,
            },
            steps: self.steps,
            max_length,
            tokens,
            output_history: self.output_history,
            num_return_sequences: self.num_return_sequences,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dream_tokens() -> GenerationConfig {
        GenerationConfig {
            mask_token_id: Some(151666),
            pad_token_id: Some(151643),
            eos_token_id: Some(151643),
            ..Default::default()
        }
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"mask_token_id": 151666, "eos_token_id": 151643}"#).unwrap();
        assert_eq!(config.steps, DEFAULT_STEPS);
        assert_eq!(config.alg, "origin");
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.num_return_sequences, 1);
        assert_eq!(config.mask_token_id, Some(151666));
        assert_eq!(config.pad_token_id, None);
        assert!(!config.output_history);
    }

    #[test]
    fn test_max_new_tokens_takes_precedence() {
        let config = GenerationConfig {
            max_length: Some(10),
            max_new_tokens: Some(6),
            ..dream_tokens()
        };
        assert_eq!(config.resolve_max_length(4, None).unwrap(), 10);
        let config = GenerationConfig {
            max_length: Some(100),
            ..config
        };
        assert_eq!(config.resolve_max_length(4, None).unwrap(), 10);
    }

    #[test]
    fn test_default_length_and_clamp() {
        let config = dream_tokens();
        assert_eq!(config.resolve_max_length(5, None).unwrap(), 25);
        assert_eq!(config.resolve_max_length(5, Some(12)).unwrap(), 12);

        let explicit = GenerationConfig {
            max_length: Some(64),
            ..dream_tokens()
        };
        assert_eq!(explicit.resolve_max_length(5, None).unwrap(), 64);
        assert_eq!(explicit.resolve_max_length(5, Some(32)).unwrap(), 32);
    }

    #[test]
    fn test_huge_max_new_tokens_is_rejected() {
        let config = GenerationConfig {
            max_new_tokens: Some(usize::MAX),
            ..dream_tokens()
        };
        let err = config.resolve_max_length(4, Some(4096)).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidConfig(_)));

        // The largest value that still fits is clamped as usual.
        let config = GenerationConfig {
            max_new_tokens: Some(usize::MAX - 4),
            ..dream_tokens()
        };
        assert_eq!(config.resolve_max_length(4, Some(4096)).unwrap(), 4096);
    }

    #[test]
    fn test_prompt_must_be_shorter_than_max_length() {
        let config = GenerationConfig {
            max_length: Some(4),
            ..dream_tokens()
        };
        let err = config.resolve_max_length(4, None).unwrap_err();
        assert!(matches!(
            err,
            GenerationError::InputTooLong {
                input_len: 4,
                max_length: 4
            }
        ));

        // Clamping can also leave no room.
        let err = dream_tokens().resolve_max_length(8, Some(8)).unwrap_err();
        assert!(matches!(err, GenerationError::InputTooLong { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            GenerationConfig {
                temperature: -0.1,
                ..dream_tokens()
            },
            GenerationConfig {
                temperature: f32::NAN,
                ..dream_tokens()
            },
            GenerationConfig {
                top_p: Some(0.0),
                ..dream_tokens()
            },
            GenerationConfig {
                top_p: Some(1.5),
                ..dream_tokens()
            },
            GenerationConfig {
                top_k: Some(0),
                ..dream_tokens()
            },
            GenerationConfig {
                steps: 0,
                ..dream_tokens()
            },
            GenerationConfig {
                alg_temp: Some(-1.0),
                ..dream_tokens()
            },
            GenerationConfig {
                num_return_sequences: 0,
                ..dream_tokens()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(GenerationError::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_unknown_alg_is_fatal() {
        let config = dream_tokens().with_alg("entropy");
        assert!(matches!(
            config.validate(),
            Err(GenerationError::UnknownAlgorithm(name)) if name == "entropy"
        ));
    }

    #[test]
    fn test_special_tokens_fallback() {
        let mut config = GenerationConfig {
            eos_token_id: Some(7),
            ..Default::default()
        };
        assert!(matches!(
            config.special_tokens(),
            Err(GenerationError::MissingSpecialToken("mask_token_id"))
        ));

        config.fill_special_tokens_from(&dream_tokens());
        let tokens = config.special_tokens().unwrap();
        assert_eq!(tokens.mask_token_id, 151666);
        assert_eq!(tokens.pad_token_id, 151643);
        // Explicit values are never overridden.
        assert_eq!(tokens.eos_token_id, 7);
    }

    #[test]
    fn test_resolve_builds_plan() {
        let config = dream_tokens()
            .with_max_new_tokens(16)
            .with_steps(16)
            .with_alg("transition_4");
        let plan = config.resolve(8, Some(4096)).unwrap();
        assert_eq!(plan.max_length, 24);
        assert_eq!(plan.steps, 16);
        assert_eq!(
            plan.policy.algorithm,
            TransferAlgorithm::Transition { threshold: 4 }
        );
        assert_eq!(plan.tokens.mask_token_id, 151666);
    }
}
