use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub socket_path: String,
    /// Path to the domain -> policy map consulted for TLS capability.
    pub policy_path: String,
    /// Reject the whole transaction when any enforced domain is not capable.
    pub strict: bool,
    /// Require every recipient of a transaction to reach enforced TLS.
    pub unified: bool,
    /// URL included in rejection notices.
    pub info_url: String,
    /// Track and emit the informational X-TLS header.
    pub annotate_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/tls-enforce-milter.sock".to_string(),
            policy_path: "/etc/mail/tls_policy".to_string(),
            strict: false,
            unified: false,
            info_url: "https://wiki.example.com/enforced-tls".to_string(),
            annotate_headers: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
