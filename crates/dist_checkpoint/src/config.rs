//! Checkpoint resharding configuration

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};
use crate::parallel::TensorParallelConfig;

/// MLP block configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Model hidden size
    pub hidden_size: usize,
    /// FFN hidden size of one projection (before gating doubles it)
    pub ffn_hidden_size: usize,
    /// fc1 produces a fused gate/value pair (SwiGLU, GeGLU)
    pub gated_linear_unit: bool,
    /// Linear layers carry a bias
    pub add_bias_linear: bool,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            ffn_hidden_size: 14336,
            gated_linear_unit: true,
            add_bias_linear: false,
        }
    }
}

impl MlpConfig {
    /// Output width of fc1; doubled for gated linear units
    pub fn fc1_output_size(&self) -> usize {
        if self.gated_linear_unit {
            self.ffn_hidden_size * 2
        } else {
            self.ffn_hidden_size
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.ffn_hidden_size == 0 {
            return Err(CheckpointError::InvalidConfig(format!(
                "MLP sizes must be positive (hidden {}, ffn {})",
                self.hidden_size, self.ffn_hidden_size
            )));
        }
        Ok(())
    }
}

/// Complete resharding configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// MLP configuration
    pub mlp: MlpConfig,
    /// Rank layout of the process doing the save or load
    pub parallel: TensorParallelConfig,
}

impl CheckpointConfig {
    /// Load configuration from `SHARDLM_CKPT_*` environment variables
    ///
    /// Unset or unparsable variables keep their defaults; the resulting layout
    /// is validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SHARDLM_CKPT_HIDDEN_SIZE") {
            if let Ok(n) = v.parse() {
                config.mlp.hidden_size = n;
            }
        }
        if let Ok(v) = std::env::var("SHARDLM_CKPT_FFN_HIDDEN_SIZE") {
            if let Ok(n) = v.parse() {
                config.mlp.ffn_hidden_size = n;
            }
        }
        if let Ok(v) = std::env::var("SHARDLM_CKPT_GATED_LINEAR_UNIT") {
            if let Ok(b) = v.parse() {
                config.mlp.gated_linear_unit = b;
            }
        }
        if let Ok(v) = std::env::var("SHARDLM_CKPT_ADD_BIAS_LINEAR") {
            if let Ok(b) = v.parse() {
                config.mlp.add_bias_linear = b;
            }
        }

        if let Ok(v) = std::env::var("SHARDLM_CKPT_TP_SIZE") {
            if let Ok(n) = v.parse() {
                config.parallel.tp_size = n;
            }
        }
        if let Ok(v) = std::env::var("SHARDLM_CKPT_TP_RANK") {
            if let Ok(n) = v.parse() {
                config.parallel.tp_rank = n;
            }
        }
        if let Ok(v) = std::env::var("SHARDLM_CKPT_DP_RANK") {
            if let Ok(n) = v.parse() {
                config.parallel.dp_rank = n;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CheckpointError::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| CheckpointError::Toml(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.mlp.validate()?;
        self.parallel.validate_mlp(&self.mlp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fc1_output_size() {
        let mut config = MlpConfig::default();
        assert_eq!(config.fc1_output_size(), 28672);
        config.gated_linear_unit = false;
        assert_eq!(config.fc1_output_size(), 14336);
    }

    #[test]
    fn test_from_toml() {
        let config = CheckpointConfig::from_toml(
            r#"
            [mlp]
            hidden_size = 64
            ffn_hidden_size = 128
            gated_linear_unit = true
            add_bias_linear = true

            [parallel]
            tp_size = 4
            tp_rank = 3
            dp_rank = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.mlp.ffn_hidden_size, 128);
        assert_eq!(config.parallel.tp_rank, 3);
    }

    #[test]
    fn test_from_toml_rejects_bad_layout() {
        let err = CheckpointConfig::from_toml(
            r#"
            [mlp]
            hidden_size = 64
            ffn_hidden_size = 130
            gated_linear_unit = true
            add_bias_linear = false

            [parallel]
            tp_size = 4
            tp_rank = 0
            dp_rank = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidConfig(_)));

        assert!(matches!(
            CheckpointConfig::from_toml("[mlp]\nhidden_size = \"big\""),
            Err(CheckpointError::Toml(_))
        ));
    }

    #[test]
    fn test_from_env() {
        let vars = [
            ("SHARDLM_CKPT_HIDDEN_SIZE", "64"),
            ("SHARDLM_CKPT_FFN_HIDDEN_SIZE", "96"),
            ("SHARDLM_CKPT_GATED_LINEAR_UNIT", "true"),
            ("SHARDLM_CKPT_ADD_BIAS_LINEAR", "true"),
            ("SHARDLM_CKPT_TP_SIZE", "2"),
            ("SHARDLM_CKPT_TP_RANK", "1"),
            ("SHARDLM_CKPT_DP_RANK", "3"),
        ];
        for (name, value) in vars {
            std::env::set_var(name, value);
        }

        let config = CheckpointConfig::from_env().unwrap();
        assert_eq!(config.mlp.hidden_size, 64);
        assert_eq!(config.mlp.ffn_hidden_size, 96);
        assert!(config.mlp.add_bias_linear);
        assert_eq!(config.parallel, TensorParallelConfig { tp_size: 2, tp_rank: 1, dp_rank: 3 });

        std::env::set_var("SHARDLM_CKPT_TP_RANK", "7");
        assert!(matches!(
            CheckpointConfig::from_env(),
            Err(CheckpointError::InvalidConfig(_))
        ));

        std::env::set_var("SHARDLM_CKPT_TP_RANK", "1");
        std::env::set_var("SHARDLM_CKPT_FFN_HIDDEN_SIZE", "97");
        assert!(matches!(
            CheckpointConfig::from_env(),
            Err(CheckpointError::InvalidConfig(_))
        ));

        for (name, _) in vars {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("shardlm-ckpt-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let config = CheckpointConfig::default();
        config.to_file(&path).unwrap();
        assert_eq!(CheckpointConfig::from_file(&path).unwrap(), config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_json_serialization() {
        let config = CheckpointConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CheckpointConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
