use std::time::Duration;
use anyhow::bail;


#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// used for log output; a short random name is generated if this is not set
    pub name: Option<String>,

    /// read timeout for ports that do not specify their own
    pub default_read_timeout: Duration,

    /// how long a message id is remembered for duplicate suppression
    pub dup_age: Duration,
    /// granularity of read timeout detection
    pub watchdog_check_interval: Duration,

    /// maximum number of items per response
    pub window_size: usize,
    /// maximum time an item waits for a partial batch to be sent
    pub window_time: Duration,

    pub default_relay_priority: i32,
}

impl MeshConfig {
    pub fn new() -> MeshConfig {
        MeshConfig {
            name: None,
            default_read_timeout: Duration::from_secs(15),
            dup_age: Duration::from_secs(27),
            watchdog_check_interval: Duration::from_secs(1),
            window_size: 3,
            window_time: Duration::from_millis(200),
            default_relay_priority: 100,
        }
    }

    pub fn named(name: &str) -> MeshConfig {
        MeshConfig {
            name: Some(name.to_string()),
            ..MeshConfig::new()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.watchdog_check_interval.is_zero() {
            bail!("watchdog check interval must be positive");
        }
        if self.default_read_timeout < Duration::from_millis(3) {
            bail!("read timeout of {:?} is too short for keep-alive messages", self.default_read_timeout);
        }
        if self.dup_age.is_zero() {
            bail!("duplicate suppression age must be positive");
        }
        Ok(())
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig::new()
    }
}
