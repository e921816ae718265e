//! Engine configuration.

use std::time::Duration;

use lockstep_types::{Address, SecretKey};

#[cfg(any(test, feature = "byzantine-testing"))]
use crate::byzantine::ByzantineMode;

/// Configuration errors detected at engine construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The validator list is empty.
    #[error("validator set is empty")]
    NoValidators,

    /// The configured key does not belong to the validator set.
    #[error("coinbase {0} is not in the validator set")]
    NotAValidator(Address),
}

/// Engine configuration.
///
/// Timeout bases and factors shape the per-round deadlines:
/// `timeout_prevote = round_timeout · round_timeout_factor^round` and
/// `timeout_precommit = precommit_timeout · precommit_timeout_factor^round`.
#[derive(Debug)]
pub struct BftConfig {
    /// Validator addresses in canonical order.
    pub validators: Vec<Address>,
    /// This node's validator address (derived from `secret_key`).
    pub coinbase: Address,
    /// This node's signing key.
    pub secret_key: SecretKey,
    /// Propose even when the transaction pool is empty.
    pub allow_empty_blocks: bool,
    /// Heights up to this number are proposed regardless of pool state, so a
    /// fresh chain starts moving.
    pub num_initial_blocks: u64,
    /// Base deadline for receiving a proposal in round 0.
    pub round_timeout: Duration,
    /// Per-round growth factor for the proposal deadline.
    pub round_timeout_factor: f64,
    /// Base deadline for gathering precommits in round 0.
    pub precommit_timeout: Duration,
    /// Per-round growth factor for the precommit deadline.
    pub precommit_timeout_factor: f64,
    /// Sleep between catch-up retries while a commit lockset is missing.
    pub sync_retry_interval: Duration,
    /// Fault strategy under test; honest by default.
    #[cfg(any(test, feature = "byzantine-testing"))]
    pub byzantine_mode: ByzantineMode,
}

impl BftConfig {
    /// Configuration with the default tunables.
    pub fn new(validators: Vec<Address>, secret_key: SecretKey) -> Self {
        Self {
            validators,
            coinbase: secret_key.address(),
            secret_key,
            allow_empty_blocks: false,
            num_initial_blocks: 10,
            round_timeout: Duration::from_secs(3),
            round_timeout_factor: 1.5,
            precommit_timeout: Duration::from_secs(2),
            precommit_timeout_factor: 1.5,
            sync_retry_interval: Duration::from_millis(500),
            #[cfg(any(test, feature = "byzantine-testing"))]
            byzantine_mode: ByzantineMode::None,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validators.is_empty() {
            return Err(ConfigError::NoValidators);
        }
        if !self.validators.contains(&self.coinbase) {
            return Err(ConfigError::NotAValidator(self.coinbase));
        }
        Ok(())
    }

    /// The prevote deadline delay for a round.
    pub fn prevote_delay(&self, round: u64) -> Duration {
        scale(self.round_timeout, self.round_timeout_factor, round)
    }

    /// The precommit deadline delay for a round.
    pub fn precommit_delay(&self, round: u64) -> Duration {
        scale(self.precommit_timeout, self.precommit_timeout_factor, round)
    }
}

fn scale(base: Duration, factor: f64, round: u64) -> Duration {
    Duration::from_secs_f64(base.as_secs_f64() * factor.powf(round as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(n: usize) -> BftConfig {
        let key = SecretKey::generate();
        let mut validators = vec![key.address()];
        validators.extend((1..n).map(|_| SecretKey::generate().address()));
        BftConfig::new(validators, key)
    }

    #[test]
    fn test_defaults() {
        let config = config(4);
        assert!(!config.allow_empty_blocks);
        assert_eq!(config.num_initial_blocks, 10);
        assert_eq!(config.round_timeout, Duration::from_secs(3));
        assert_eq!(config.precommit_timeout, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delays_escalate_per_round() {
        let config = config(4);
        assert_eq!(config.prevote_delay(0), Duration::from_secs(3));
        assert_eq!(config.prevote_delay(1), Duration::from_secs_f64(4.5));
        assert_eq!(config.precommit_delay(0), Duration::from_secs(2));
        assert_eq!(config.precommit_delay(2), Duration::from_secs_f64(4.5));
    }

    #[test]
    fn test_validation() {
        let key = SecretKey::generate();
        let stranger = SecretKey::generate().address();
        assert_eq!(
            BftConfig::new(vec![], key).validate(),
            Err(ConfigError::NoValidators)
        );
        let key = SecretKey::generate();
        let coinbase = key.address();
        assert_eq!(
            BftConfig::new(vec![stranger], key).validate(),
            Err(ConfigError::NotAValidator(coinbase))
        );
    }
}
