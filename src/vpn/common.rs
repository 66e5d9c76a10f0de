//! File and process helpers shared by the protocol state machines

use base64::Engine;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{VpnError, VpnResult};

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> VpnResult<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to create directory {:?}: {}", path, e))))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write configuration to a file with restrictive permissions
pub async fn write_secure_config(path: &Path, content: &[u8], permissions: u32) -> VpnResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent).await?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to write config to {:?}: {}", path, e))))?;

    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(|e| VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to set permissions on {:?}: {}", path, e))))?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Decode a base64 blob
pub fn decode_base64(encoded: &str) -> VpnResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| VpnError::InvalidConfig(format!("Invalid base64 config: {}", e)))
}

pub fn encode_base64(plain: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(plain)
}

/// Decode a base64 config and write it. Empty input writes nothing.
pub async fn write_base64_config(path: &Path, encoded: &str) -> VpnResult<bool> {
    if encoded.is_empty() {
        return Ok(false);
    }
    let content = decode_base64(encoded)?;
    write_secure_config(path, &content, 0o600).await?;
    Ok(true)
}

/// Delete a configuration file if it exists
pub async fn delete_config_file(path: &Path) -> VpnResult<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to delete {:?}: {}", path, e))))?;
        debug!("Deleted config file: {:?}", path);
    }
    Ok(())
}

/// Run a command to completion, mapping failure to `DaemonStartFailed`
pub async fn run_command(program: &str, args: &[&str]) -> VpnResult<()> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| VpnError::DaemonStartFailed(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("{} exited with {:?}: {}", program, output.status.code(), stderr.trim());
        return Err(VpnError::DaemonStartFailed(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_base64_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("strongswan.conf");

        assert!(!write_base64_config(&path, "").await.unwrap());
        assert!(!path.exists());

        assert!(write_base64_config(&path, &encode_base64("charon {}\n")).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "charon {}\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        delete_config_file(&path).await.unwrap();
        assert!(!path.exists());
        // deleting twice is fine
        delete_config_file(&path).await.unwrap();
    }

    #[test]
    fn test_decode_base64_rejects_garbage() {
        assert!(matches!(decode_base64("not base64!!"), Err(VpnError::InvalidConfig(_))));
        assert_eq!(decode_base64(&encode_base64("abc")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        assert!(run_command("true", &[]).await.is_ok());
        assert!(matches!(run_command("false", &[]).await, Err(VpnError::DaemonStartFailed(_))));
        assert!(run_command("/nonexistent/binary", &[]).await.is_err());
    }
}
