use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub webserver: WebServerConfig,
    #[serde(default)]
    pub certificates: CertificatesConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub nat: NatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Folder holding per-component configuration files
    #[serde(default = "default_configs_folder")]
    pub configs_folder: String,
    /// Folder holding per-plugin configuration directories
    #[serde(default = "default_plugins_folder")]
    pub plugins_folder: String,
    /// Interface address to bind listeners and media sockets to
    #[serde(default = "default_interface")]
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    /// Serve the plain-HTTP control endpoint
    #[serde(default = "default_true")]
    pub http: bool,
    /// Plain-HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serve the HTTPS control endpoint
    #[serde(default)]
    pub https: bool,
    /// HTTPS port
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    /// URL prefix the control protocol is mounted under
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificatesConfig {
    /// Path to the TLS certificate (self-signed one generated if absent)
    pub cert_pem: Option<String>,
    /// Path to the TLS private key
    pub cert_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Port range media sockets are allocated from, "lo-hi"
    #[serde(default = "default_rtp_port_range")]
    pub rtp_port_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// Public address advertised in ICE candidates (in addition to the
    /// bound interface)
    pub public_ip: Option<String>,
    /// STUN server to learn the reflexive address from
    pub stun_server: Option<String>,
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            configs_folder: default_configs_folder(),
            plugins_folder: default_plugins_folder(),
            interface: default_interface(),
        }
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            http: true,
            port: default_port(),
            https: false,
            secure_port: default_secure_port(),
            base_path: default_base_path(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtp_port_range: default_rtp_port_range(),
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            public_ip: None,
            stun_server: None,
            stun_port: default_stun_port(),
        }
    }
}

fn default_configs_folder() -> String {
    "/etc/gatehouse".to_string()
}

fn default_plugins_folder() -> String {
    "/etc/gatehouse/plugins".to_string()
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8088
}

fn default_secure_port() -> u16 {
    8089
}

fn default_base_path() -> String {
    "/janus".to_string()
}

fn default_rtp_port_range() -> String {
    "20000-40000".to_string()
}

fn default_stun_port() -> u16 {
    3478
}

/// An inclusive port range parsed from the `lo-hi` config syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPortRange {
    pub lo: u16,
    pub hi: u16,
}

impl FromStr for RtpPortRange {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = raw
            .split_once('-')
            .ok_or_else(|| format!("'{raw}' is not of the form lo-hi"))?;
        let lo: u16 = lo
            .trim()
            .parse()
            .map_err(|_| format!("'{lo}' is not a port number"))?;
        let hi: u16 = hi
            .trim()
            .parse()
            .map_err(|_| format!("'{hi}' is not a port number"))?;
        if lo == 0 || lo >= hi {
            return Err(format!("port range {lo}-{hi} is empty or inverted"));
        }
        Ok(Self { lo, hi })
    }
}

impl GatewayConfig {
    /// Validate configuration semantics. Returns the list of issues found;
    /// lines starting with "ERROR:" are fatal, the rest are warnings.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if !self.webserver.http && !self.webserver.https {
            issues.push(
                "ERROR: both [webserver] http and https are disabled, nothing to serve".to_string(),
            );
        }
        if self.webserver.http && self.webserver.port == 0 {
            issues.push("ERROR: [webserver] port must be non-zero".to_string());
        }
        if self.webserver.https && self.webserver.secure_port == 0 {
            issues.push("ERROR: [webserver] secure_port must be non-zero".to_string());
        }
        if self.webserver.http
            && self.webserver.https
            && self.webserver.port == self.webserver.secure_port
        {
            issues.push("ERROR: [webserver] port and secure_port collide".to_string());
        }
        if !self.webserver.base_path.starts_with('/') {
            issues.push(format!(
                "ERROR: [webserver] base_path '{}' must start with '/'",
                self.webserver.base_path
            ));
        } else if self.webserver.base_path.len() > 1 && self.webserver.base_path.ends_with('/') {
            issues.push(format!(
                "ERROR: [webserver] base_path '{}' must not end with '/'",
                self.webserver.base_path
            ));
        }

        match self.media.rtp_port_range.parse::<RtpPortRange>() {
            Ok(range) => {
                if range.hi - range.lo < 10 {
                    issues.push(format!(
                        "warning: [media] rtp_port_range {}-{} leaves room for very few sessions",
                        range.lo, range.hi
                    ));
                }
                if range.lo < 1024 {
                    issues.push(format!(
                        "warning: [media] rtp_port_range starts below 1024 ({})",
                        range.lo
                    ));
                }
            }
            Err(e) => issues.push(format!("ERROR: [media] rtp_port_range: {e}")),
        }

        if self.nat.stun_server.is_some() && self.nat.stun_port == 0 {
            issues.push("ERROR: [nat] stun_port must be non-zero when stun_server is set".to_string());
        }
        if let Some(ip) = &self.nat.public_ip
            && ip.parse::<std::net::IpAddr>().is_err()
        {
            issues.push(format!("ERROR: [nat] public_ip '{ip}' is not an IP address"));
        }
        if self.certificates.cert_pem.is_some() != self.certificates.cert_key.is_some() {
            issues.push(
                "ERROR: [certificates] cert_pem and cert_key must be set together".to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Parsed media port range; `validate()` has already rejected bad syntax.
    pub fn rtp_port_range(&self) -> RtpPortRange {
        self.media
            .rtp_port_range
            .parse()
            .unwrap_or(RtpPortRange { lo: 20000, hi: 40000 })
    }
}
