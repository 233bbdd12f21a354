/// Capability gate for optional transport features.
pub trait Licenser: Send + Sync {
    /// Route outbound traffic through the configured forward proxy.
    fn use_forward_proxy(&self) -> bool;

    /// Enforce IP allow/deny rules on destination addresses.
    fn ip_rules(&self) -> bool;
}

/// Fixed capability set, decided at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticLicenser {
    pub forward_proxy: bool,
    pub ip_rules: bool,
}

impl StaticLicenser {
    /// Every optional feature enabled.
    pub fn all() -> Self {
        Self {
            forward_proxy: true,
            ip_rules: true,
        }
    }

    /// Community edition: no optional features.
    pub fn none() -> Self {
        Self::default()
    }
}

impl Licenser for StaticLicenser {
    fn use_forward_proxy(&self) -> bool {
        self.forward_proxy
    }

    fn ip_rules(&self) -> bool {
        self.ip_rules
    }
}
