use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

#[derive(Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    /// Base URL of the Vault server certificates are issued from
    pub vault_addr: Url,
    /// Vault token authorized to write to the configured PKI issue paths
    pub vault_token: SecretString,
}

impl ControllerConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }
}
