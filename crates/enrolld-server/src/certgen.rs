use std::path::Path;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use tracing::info;

use crate::error::ServerError;

/// The CLI's one-shot certificate-generation mode (spec.md §6: "a
/// separate one-shot certificate-generation mode that exits after writing
/// the generated key and certificate"). Produces a self-signed server
/// keypair for `subject_alt_names` and writes it to `cert_path`/`key_path`.
pub fn generate(
    cert_path: &Path,
    key_path: &Path,
    subject_alt_names: Vec<String>,
) -> Result<(), ServerError> {
    let names = if subject_alt_names.is_empty() {
        vec!["localhost".to_string()]
    } else {
        subject_alt_names
    };

    let CertifiedKey { cert, signing_key } = generate_simple_self_signed(names)
        .map_err(|e| ServerError::Other(format!("certificate generation failed: {e}")))?;

    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(cert_path, cert.pem())?;
    std::fs::write(key_path, signing_key.serialize_pem())?;

    info!(cert = %cert_path.display(), key = %key_path.display(), "generated self-signed server certificate");
    Ok(())
}
