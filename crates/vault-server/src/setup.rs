//! OPAQUE server setup persistence.
//!
//! The setup (OPRF seed + server keypair) is generated once per deployment.
//! Every stored password file depends on it, so an existing file that cannot
//! be read is an error, never a reason to regenerate.

use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};
use vault_core::{VaultError, VaultResult};
use vault_crypto::ServerSetup;
use zeroize::Zeroizing;

/// Load the server setup from `path`, generating and persisting a new one
/// if the file does not exist.
pub fn load_or_generate(path: &Path) -> VaultResult<ServerSetup> {
    if path.exists() {
        let encoded = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading server setup: {}", path.display()))?,
        );
        let bytes = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|e| {
            VaultError::Config(format!("server setup {} is not base64: {e}", path.display()))
        })?);
        let setup = ServerSetup::from_bytes(&bytes).map_err(|e| {
            VaultError::Config(format!(
                "server setup {} is corrupt ({e}); refusing to regenerate",
                path.display()
            ))
        })?;
        info!(path = %path.display(), "loaded server setup");
        return Ok(setup);
    }

    let setup = ServerSetup::generate();
    persist(path, &setup)?;
    warn!(
        path = %path.display(),
        "generated new server setup; back it up, losing it invalidates every registration"
    );
    Ok(setup)
}

/// Atomic write (temp + rename), owner-only permissions.
fn persist(path: &Path, setup: &ServerSetup) -> VaultResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    let encoded = Zeroizing::new(STANDARD.encode(setup.to_bytes()));
    std::fs::write(&tmp_path, encoded.as_bytes())
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", tmp_path.display()))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {}", path.display()))?;
    Ok(())
}
