//! Engine configuration

use serde::{Deserialize, Serialize};

use lwm2m_core::{Lwm2mError, Lwm2mResult};
use lwm2m_registration::Tuning;
use lwm2m_registration::account::DEFAULT_LIFETIME;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Endpoint client name sent on Register and Bootstrap-Request
    pub endpoint_name: String,
    /// Lifetime given to servers added without one, in seconds
    pub default_lifetime: u64,
    /// Upper bound on any retry delay, in seconds
    pub backoff_ceiling: u64,
    /// How long before lifetime expiry the update is sent, in seconds
    pub update_margin: u64,
    /// Whether plain resource changes schedule a registration update
    pub update_on_resource_change: bool,
    /// Longest wait of the step loop between two ticks, in seconds
    pub max_wait: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint_name: String::from("lwm2m-endpoint"),
            default_lifetime: DEFAULT_LIFETIME,
            backoff_ceiling: 86400,
            update_margin: 10,
            update_on_resource_change: true,
            max_wait: 60,
        }
    }
}

impl EngineConfig {
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            ..Self::default()
        }
    }

    pub fn with_default_lifetime(mut self, lifetime: u64) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    pub fn with_backoff_ceiling(mut self, ceiling: u64) -> Self {
        self.backoff_ceiling = ceiling;
        self
    }

    pub fn with_update_margin(mut self, margin: u64) -> Self {
        self.update_margin = margin;
        self
    }

    pub fn with_update_on_resource_change(mut self, enabled: bool) -> Self {
        self.update_on_resource_change = enabled;
        self
    }

    pub fn with_max_wait(mut self, max_wait: u64) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// # Errors
    /// `BadRequest` for an empty endpoint name or a zero lifetime, ceiling
    /// or wait
    pub fn validate(&self) -> Lwm2mResult<()> {
        if self.endpoint_name.is_empty() {
            return Err(Lwm2mError::bad_request("empty endpoint name"));
        }
        if self.default_lifetime == 0 {
            return Err(Lwm2mError::bad_request("default lifetime must be positive"));
        }
        if self.backoff_ceiling == 0 {
            return Err(Lwm2mError::bad_request("backoff ceiling must be positive"));
        }
        if self.max_wait == 0 {
            return Err(Lwm2mError::bad_request("max wait must be positive"));
        }
        Ok(())
    }

    /// Timing knobs for the registration machines
    pub fn tuning(&self) -> Tuning {
        Tuning {
            backoff_ceiling: self.backoff_ceiling,
            update_margin: self.update_margin,
        }
    }
}
