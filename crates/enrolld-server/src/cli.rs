use std::path::PathBuf;

use clap::Parser;
use enrolld_core::Config;

/// Command-line surface for the `enrolld` binary (spec.md §6 "CLI
/// surface"). Flags mirror the original `authd` getopt list
/// (`examples/original_source/src/os_auth/main-server.c`) with long names
/// instead of single letters; anything present here overrides the
/// matching field loaded from `--config`.
#[derive(Debug, Parser)]
#[command(name = "enrolld", version, about = "Agent enrollment manager")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "etc/enrolld.toml")]
    pub config: PathBuf,

    /// Run in the foreground instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Increase debug verbosity; may be repeated (-d, -dd, -ddd).
    #[arg(short = 'd', long = "debug", action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Group to run as after privilege drop.
    #[arg(short = 'g', long)]
    pub group: Option<String>,

    /// Directory to chdir into before doing anything else.
    #[arg(short = 'D', long = "dir")]
    pub working_dir: Option<PathBuf>,

    /// Manager port to bind. Overrides `bind_addr`'s port.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Enable shared password authentication.
    #[arg(short = 'P', long = "use-password")]
    pub use_password: bool,

    /// SSL/TLS cipher list.
    #[arg(short = 'c', long = "ciphers")]
    pub cipher_list: Option<String>,

    /// Full path to the CA certificate used to verify agent certificates.
    #[arg(short = 'v', long = "ca-cert")]
    pub ca_path: Option<PathBuf>,

    /// Require the peer certificate CN to match the connecting source IP.
    /// Only meaningful together with `--ca-cert`.
    #[arg(short = 's', long = "verify-host")]
    pub verify_host: bool,

    /// Full path to the server certificate.
    #[arg(short = 'x', long = "cert")]
    pub cert_path: Option<PathBuf>,

    /// Full path to the server private key.
    #[arg(short = 'k', long = "key")]
    pub key_path: Option<PathBuf>,

    /// Accept any TLS version the library supports instead of TLS 1.2 only.
    #[arg(short = 'a', long = "auto-negotiate")]
    pub auto_negotiate: bool,

    /// Generate a self-signed server key/certificate and exit (spec.md §6
    /// "a separate one-shot certificate-generation mode").
    #[arg(long = "generate-certs")]
    pub generate_certs: bool,

    /// Subject alternative name(s) embedded in a generated certificate.
    /// Only used with `--generate-certs`.
    #[arg(long = "cert-subject", requires = "generate_certs")]
    pub cert_subject: Option<String>,
}

impl Cli {
    /// Layers CLI flags over a loaded [`Config`]. Flags win; an absent
    /// flag leaves the config file's value untouched.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            if let Some(colon) = config.bind_addr.rfind(':') {
                config.bind_addr = format!("{}:{port}", &config.bind_addr[..colon]);
            } else {
                config.bind_addr = format!("0.0.0.0:{port}");
            }
        }
        if self.use_password {
            config.use_password = true;
        }
        if let Some(ciphers) = &self.cipher_list {
            config.cipher_list = ciphers.clone();
        }
        if let Some(ca_path) = &self.ca_path {
            config.ca_path = Some(ca_path.clone());
        }
        if self.verify_host {
            config.verify_host = true;
        }
        if let Some(cert_path) = &self.cert_path {
            config.cert_path = cert_path.clone();
        }
        if let Some(key_path) = &self.key_path {
            config.key_path = key_path.clone();
        }
        if self.auto_negotiate {
            config.auto_negotiate = true;
        }
        if let Some(group) = &self.group {
            config.group = Some(group.clone());
        }
    }
}
