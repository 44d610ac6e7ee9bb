//! CLI configuration, parsed with `clap`'s derive API.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "libvirt-aws", about = "AWS-compatible control plane backed by libvirt")]
pub struct Config {
    /// Interface to bind to.
    #[arg(long, env = "LIBVIRT_AWS_BIND_TO", default_value = "0.0.0.0")]
    pub bind_to: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "LIBVIRT_AWS_PORT", default_value_t = 5100)]
    pub port: u16,

    /// SQLite database file.
    #[arg(long, env = "LIBVIRT_AWS_DATABASE", default_value = "pool.db")]
    pub database: PathBuf,

    /// libvirt connection URI.
    #[arg(long, env = "LIBVIRT_AWS_LIBVIRT_URI", default_value = "qemu:///system")]
    pub libvirt_uri: String,

    /// Name (or UUID) of the storage pool holding machine images and volumes.
    #[arg(long, env = "LIBVIRT_AWS_LIBVIRT_IMAGE_POOL", default_value = "default")]
    pub libvirt_image_pool: String,

    /// Name (or UUID) of the libvirt network that backs DNS and address allocation.
    #[arg(long, env = "LIBVIRT_AWS_LIBVIRT_NETWORK", default_value = "default")]
    pub libvirt_network: String,

    /// Region string reported back to clients.
    #[arg(long, env = "LIBVIRT_AWS_REGION", default_value = "us-east-2")]
    pub region: String,

    /// Log output format.
    #[arg(long, env = "LIBVIRT_AWS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_to, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::parse_from(["libvirt-aws"]);
        assert_eq!(cfg.port, 5100);
        assert_eq!(cfg.libvirt_uri, "qemu:///system");
        assert_eq!(cfg.libvirt_image_pool, "default");
        assert_eq!(cfg.libvirt_network, "default");
        assert_eq!(cfg.region, "us-east-2");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_parse_from_flags() {
        let cfg = Config::parse_from([
            "libvirt-aws",
            "--port",
            "8080",
            "--database",
            "/tmp/test.db",
            "--region",
            "eu-west-1",
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.database, PathBuf::from("/tmp/test.db"));
        assert_eq!(cfg.region, "eu-west-1");
    }
}
