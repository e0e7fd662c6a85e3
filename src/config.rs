use crate::Error;
use std::time::Duration;

/// Tunables for key agreement, the ratchet and persistence.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// HKDF info string bound into every X3DH derivation. Must be non-empty.
    pub protocol_info: Vec<u8>,
    /// One-time pre-keys generated with a new identity.
    pub one_time_pre_key_count: usize,
    /// Replenish one-time pre-keys when fewer than this remain.
    pub min_one_time_pre_keys: usize,
    /// Largest gap a single incoming message may skip over.
    pub max_skip: u32,
    /// Hard cap on cached skipped message keys. The oldest are evicted first.
    pub max_skipped_message_keys: usize,
    /// Indices more than this far below the highest accepted one are rejected.
    pub replay_window: u32,
    /// Receiving chain generations tracked for replay and late delivery.
    pub max_tracked_generations: usize,
    /// Sending chain index at which a DH ratchet is forced.
    pub chain_ratchet_threshold: u32,
    /// Attempts made for a critical save before the operation fails.
    pub critical_save_attempts: u32,
    /// Delay before the second critical save attempt. Doubles on each retry.
    pub critical_save_backoff: Duration,
    /// Delay before a non-critical save is written.
    pub save_debounce: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_info: b"Vigil-X3DH-v1".to_vec(),
            one_time_pre_key_count: 100,
            min_one_time_pre_keys: 20,
            max_skip: 1000,
            max_skipped_message_keys: 2000,
            replay_window: 1024,
            max_tracked_generations: 8,
            chain_ratchet_threshold: 10_000,
            critical_save_attempts: 5,
            critical_save_backoff: Duration::from_millis(50),
            save_debounce: Duration::from_millis(250),
        }
    }
}

impl ProtocolConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocol_info.is_empty() {
            return Err(Error::InvalidInput("protocol_info must not be empty".to_string()));
        }
        if self.replay_window == 0 {
            return Err(Error::InvalidInput("replay_window must be positive".to_string()));
        }
        if self.max_tracked_generations == 0 {
            return Err(Error::InvalidInput(
                "max_tracked_generations must be positive".to_string(),
            ));
        }
        if self.max_skipped_message_keys < self.max_skip as usize {
            return Err(Error::InvalidInput(
                "max_skipped_message_keys must be at least max_skip".to_string(),
            ));
        }
        if self.chain_ratchet_threshold == 0 || self.chain_ratchet_threshold == u32::MAX {
            return Err(Error::InvalidInput(
                "chain_ratchet_threshold must be between 1 and u32::MAX - 1".to_string(),
            ));
        }
        if self.critical_save_attempts == 0 {
            return Err(Error::InvalidInput(
                "critical_save_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The subset of settings a single connection needs.
    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_skip: self.max_skip,
            max_skipped_message_keys: self.max_skipped_message_keys,
            replay_window: self.replay_window,
            max_tracked_generations: self.max_tracked_generations,
            chain_ratchet_threshold: self.chain_ratchet_threshold,
        }
    }
}

/// Per-connection limits, copied out of [`ProtocolConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Largest gap a single incoming message may skip over.
    pub max_skip: u32,
    /// Cap on cached skipped message keys, oldest evicted first.
    pub max_skipped_message_keys: usize,
    /// Indices more than this far below the highest accepted one are rejected.
    pub replay_window: u32,
    /// Receiving chain generations kept for replay checks and late delivery.
    /// Older ratchet keys are remembered only to reject their messages.
    pub max_tracked_generations: usize,
    /// Sending chain index at which a DH ratchet is forced.
    pub chain_ratchet_threshold: u32,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        ProtocolConfig::default().ratchet_limits()
    }
}
