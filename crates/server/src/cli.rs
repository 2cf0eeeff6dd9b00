use std::path::PathBuf;

use clap::Parser;
use gatehouse_protocol::GatewayConfig;

/// Command-line front-end; every flag overrides the corresponding
/// configuration item.
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gatehouse WebRTC gateway", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/gatehouse/gatehouse.toml")]
    pub config: PathBuf,

    /// Folder holding per-component configuration files
    #[arg(long)]
    pub configs_folder: Option<String>,

    /// Folder holding per-plugin configuration directories
    #[arg(long)]
    pub plugins_folder: Option<String>,

    /// Interface address to bind to
    #[arg(long)]
    pub interface: Option<String>,

    /// Plain-HTTP control port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// HTTPS control port (also enables the HTTPS listener)
    #[arg(long)]
    pub secure_port: Option<u16>,

    /// URL prefix for the control protocol
    #[arg(long)]
    pub base_path: Option<String>,

    /// TLS certificate path
    #[arg(long)]
    pub cert_pem: Option<String>,

    /// TLS private key path
    #[arg(long)]
    pub cert_key: Option<String>,

    /// STUN server to learn the reflexive address from
    #[arg(long)]
    pub stun_server: Option<String>,

    /// Public address to advertise in ICE candidates
    #[arg(long)]
    pub public_ip: Option<String>,

    /// Media port range, "lo-hi"
    #[arg(long)]
    pub rtp_port_range: Option<String>,

    /// Disable the plain-HTTP listener
    #[arg(long, action)]
    pub no_http: bool,
}

impl Args {
    /// Fold the CLI overrides into a loaded configuration.
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(folder) = &self.configs_folder {
            config.general.configs_folder = folder.clone();
        }
        if let Some(folder) = &self.plugins_folder {
            config.general.plugins_folder = folder.clone();
        }
        if let Some(interface) = &self.interface {
            config.general.interface = interface.clone();
        }
        if let Some(port) = self.port {
            config.webserver.port = port;
        }
        if let Some(secure_port) = self.secure_port {
            config.webserver.secure_port = secure_port;
            config.webserver.https = true;
        }
        if let Some(base_path) = &self.base_path {
            config.webserver.base_path = base_path.clone();
        }
        if let Some(cert_pem) = &self.cert_pem {
            config.certificates.cert_pem = Some(cert_pem.clone());
        }
        if let Some(cert_key) = &self.cert_key {
            config.certificates.cert_key = Some(cert_key.clone());
        }
        if let Some(stun_server) = &self.stun_server {
            config.nat.stun_server = Some(stun_server.clone());
        }
        if let Some(public_ip) = &self.public_ip {
            config.nat.public_ip = Some(public_ip.clone());
        }
        if let Some(range) = &self.rtp_port_range {
            config.media.rtp_port_range = range.clone();
        }
        if self.no_http {
            config.webserver.http = false;
        }
    }
}
