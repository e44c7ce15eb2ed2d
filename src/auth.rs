use std::fmt;
use std::path::{Path, PathBuf};

use rand::RngCore;

/// File holding the shared secret, under the config dir. Mode 0600.
pub const TOKEN_FILE: &str = "auth-token";
/// File holding the published CDP URL while the broker runs.
pub const CDP_URL_FILE: &str = "cdp-url";

/// Errors from token and URL-file operations.
#[derive(Debug)]
pub enum AuthError {
    /// Could not determine the platform config directory.
    NoConfigDir,
    /// I/O error reading or writing under the config dir.
    Io(std::io::Error),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfigDir => write!(f, "could not determine config directory"),
            Self::Io(e) => write!(f, "auth file error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::NoConfigDir => None,
        }
    }
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<AuthError> for crate::error::AppError {
    fn from(e: AuthError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
        }
    }
}

/// The default config directory: `<platform config dir>/browserforce`.
///
/// # Errors
///
/// Returns `AuthError::NoConfigDir` if the platform config dir is unknown.
pub fn default_config_dir() -> Result<PathBuf, AuthError> {
    dirs::config_dir()
        .map(|dir| dir.join("browserforce"))
        .ok_or(AuthError::NoConfigDir)
}

/// Generate a fresh 256-bit token, lowercase hex encoded.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Read the token file, creating it with a fresh token if missing or empty.
///
/// The file is written atomically with mode 0600 (dir 0700) on Unix.
///
/// # Errors
///
/// Returns `AuthError::Io` on I/O failure.
pub fn load_or_create_token(config_dir: &Path) -> Result<String, AuthError> {
    let path = config_dir.join(TOKEN_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let token = contents.trim().to_owned();
            if !token.is_empty() {
                return Ok(token);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(AuthError::Io(e)),
    }

    let token = generate_token();
    write_private(&path, &token)?;
    Ok(token)
}

/// The CDP URL clients should connect to.
#[must_use]
pub fn cdp_url(host: &str, port: u16, token: &str) -> String {
    format!("ws://{host}:{port}/cdp?token={token}")
}

/// Atomically publish the CDP URL file (write to temp, then rename).
///
/// # Errors
///
/// Returns `AuthError::Io` on I/O failure.
pub fn publish_cdp_url(config_dir: &Path, url: &str) -> Result<(), AuthError> {
    write_private(&config_dir.join(CDP_URL_FILE), url)
}

/// Remove the published CDP URL. Missing file is not an error.
///
/// # Errors
///
/// Returns `AuthError::Io` on I/O errors other than "not found".
pub fn remove_cdp_url(config_dir: &Path) -> Result<(), AuthError> {
    match std::fs::remove_file(config_dir.join(CDP_URL_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AuthError::Io(e)),
    }
}

/// Read the published CDP URL, if present.
///
/// # Errors
///
/// Returns `AuthError::Io` on I/O errors other than "not found".
pub fn read_cdp_url(config_dir: &Path) -> Result<Option<String>, AuthError> {
    match std::fs::read_to_string(config_dir.join(CDP_URL_FILE)) {
        Ok(contents) => Ok(Some(contents.trim().to_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AuthError::Io(e)),
    }
}

/// Atomic private write: temp file + rename, 0600/0700 on Unix.
fn write_private(path: &Path, contents: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
