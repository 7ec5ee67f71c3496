use crate::error::RingError;
use crate::layout::VideoDescriptor;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session identity. The single `session` string derives the three
/// rendezvous names (region, lock, wake signal), so independent sessions on
/// the same host never collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session")]
    pub session: String,
}

impl SessionConfig {
    pub fn new(session: impl Into<String>) -> Self {
        SessionConfig {
            session: session.into(),
        }
    }

    pub fn region_name(&self) -> String {
        format!("/{}.ring", self.session)
    }

    pub fn lock_name(&self) -> String {
        format!("/{}.lock", self.session)
    }

    pub fn wake_name(&self) -> String {
        format!("/{}.wake", self.session)
    }

    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), RingError> {
        if self.session.is_empty() {
            return Err(RingError::InvalidConfig("session name must not be empty"));
        }
        if self.session.contains('/') {
            return Err(RingError::InvalidConfig(
                "session name must not contain '/'",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session: default_session(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerOptions {
    #[serde(default = "default_slot_count")]
    pub slot_count: u64,

    /// Inline payload capacity per slot, for the non-handle fallback path.
    #[serde(default)]
    pub slot_capacity_bytes: u64,

    /// Consecutive blocked publishes against the same sequence number before
    /// the producer force-reclaims the slot.
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: u32,

    /// Publish runs on a latency-sensitive thread; the lock wait is short.
    #[serde(default = "default_publish_lock_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub video: VideoDescriptor,
}

impl ProducerOptions {
    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            slot_count: default_slot_count(),
            slot_capacity_bytes: 0,
            drop_threshold: default_drop_threshold(),
            lock_timeout_ms: default_publish_lock_ms(),
            video: VideoDescriptor::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOptions {
    #[serde(default = "default_consumer_lock_ms")]
    pub lock_timeout_ms: u64,

    /// Bound on a single wake-signal wait before `next_frame` reports
    /// `NotReady`.
    #[serde(default = "default_consumer_wait_ms")]
    pub wait_timeout_ms: u64,
}

impl ConsumerOptions {
    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            lock_timeout_ms: default_consumer_lock_ms(),
            wait_timeout_ms: default_consumer_wait_ms(),
        }
    }
}

fn default_session() -> String {
    "framering".to_string()
}

fn default_slot_count() -> u64 {
    8
}

fn default_drop_threshold() -> u32 {
    4
}

fn default_publish_lock_ms() -> u64 {
    16
}

fn default_consumer_lock_ms() -> u64 {
    200
}

fn default_consumer_wait_ms() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_derived_names_share_one_session() {
        let config = SessionConfig::new("capture-a");
        assert_eq!(config.region_name(), "/capture-a.ring");
        assert_eq!(config.lock_name(), "/capture-a.lock");
        assert_eq!(config.wake_name(), "/capture-a.wake");
    }

    #[test]
    fn test_rejects_slash_in_session() {
        assert!(SessionConfig::new("a/b").validate().is_err());
        assert!(SessionConfig::new("").validate().is_err());
        assert!(SessionConfig::new("ok-name").validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"session = "from-file""#).unwrap();
        let config = SessionConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.session, "from-file");
    }

    #[test]
    fn test_options_defaults() {
        let options: ProducerOptions = toml::from_str("").unwrap();
        assert_eq!(options.slot_count, 8);
        assert_eq!(options.drop_threshold, 4);
        assert_eq!(options.lock_timeout_ms, 16);

        let options: ConsumerOptions = toml::from_str("").unwrap();
        assert_eq!(options.lock_timeout_ms, 200);
        assert_eq!(options.wait_timeout_ms, 200);
    }
}
