use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::TransferError;
use crate::storage::{Settings, keys};

/// The one file a share action sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SharedObject {
    name: String,
    size: u64,
    path: PathBuf,
}

impl SharedObject {
    pub(crate) fn from_path(path: &Path) -> Result<Self, TransferError> {
        let meta = fs::metadata(path)
            .map_err(|err| TransferError::InvalidParameters(format!("{}: {err}", path.display())))?;
        if !meta.is_file() {
            return Err(TransferError::InvalidParameters(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidParameters("missing source filename".into()))?;
        Ok(Self {
            name,
            size: meta.len(),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Renames the object. Requests already built keep the name they were built with.
    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Opens a fresh byte stream over the source. Each attempt opens its own.
    pub(crate) fn open(&self) -> Result<File, TransferError> {
        File::open(&self.path).map_err(|err| {
            TransferError::InvalidParameters(format!("open {}: {err}", self.path.display()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMethod {
    Password,
    PublicKey,
}

impl AuthMethod {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
        }
    }
}

impl FromStr for AuthMethod {
    type Err = TransferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "password" => Ok(AuthMethod::Password),
            "publickey" | "public_key" | "key" => Ok(AuthMethod::PublicKey),
            other => Err(TransferError::InvalidParameters(format!(
                "unknown auth method '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Credential {
    Password(String),
    KeyPair(PathBuf),
}

/// Everything one attempt needs, fixed at the moment the attempt starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferRequest {
    pub(crate) shared: SharedObject,
    pub(crate) destination_path: String,
    pub(crate) server: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    pub(crate) auth_method: AuthMethod,
}

impl TransferRequest {
    pub(crate) fn from_settings(
        settings: &dyn Settings,
        shared: &SharedObject,
    ) -> Result<Self, TransferError> {
        let server = required(settings, keys::SERVER, "server")?;
        let username = required(settings, keys::USERNAME, "username")?;
        let destination_path = required(settings, keys::DESTINATION, "destination path")?;
        let port_raw = settings.get_string(keys::PORT, keys::DEFAULT_PORT);
        let port = port_raw
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| TransferError::InvalidParameters(format!("invalid port '{port_raw}'")))?;
        let auth_method = settings
            .get_string(keys::AUTH_METHOD, keys::DEFAULT_AUTH_METHOD)
            .parse()?;
        check_destination_name(shared.name())?;
        Ok(Self {
            shared: shared.clone(),
            destination_path,
            server,
            port,
            username,
            auth_method,
        })
    }

    pub(crate) fn destination_name(&self) -> &str {
        self.shared.name()
    }
}

fn required(settings: &dyn Settings, key: &str, label: &str) -> Result<String, TransferError> {
    let value = settings.get_string(key, "");
    let value = value.trim();
    if value.is_empty() {
        return Err(TransferError::InvalidParameters(format!("{label} is not set")));
    }
    Ok(value.to_string())
}

/// The name must stay inside the destination directory.
fn check_destination_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidParameters(
            "destination file name is empty".into(),
        ));
    }
    if name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || Path::new(name).is_absolute()
    {
        return Err(TransferError::InvalidParameters(format!(
            "destination file name '{name}' must be a plain file name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    Succeeded,
    AuthFailure(String),
    FileExists(String),
    NetworkError(String),
    InvalidParameters(String),
}

impl TransferOutcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded)
    }

    /// Failures the user can fix by entering another password.
    pub(crate) fn is_credential_retryable(&self) -> bool {
        matches!(
            self,
            TransferOutcome::AuthFailure(_) | TransferOutcome::NetworkError(_)
        )
    }
}

impl From<Result<(), TransferError>> for TransferOutcome {
    fn from(result: Result<(), TransferError>) -> Self {
        match result {
            Ok(()) => TransferOutcome::Succeeded,
            Err(TransferError::AuthFailure(message)) => TransferOutcome::AuthFailure(message),
            Err(TransferError::FileExists(name)) => TransferOutcome::FileExists(name),
            Err(TransferError::NetworkError(message)) => TransferOutcome::NetworkError(message),
            Err(TransferError::InvalidParameters(message)) => {
                TransferOutcome::InvalidParameters(message)
            }
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Succeeded => f.write_str("Transfer finished successfully"),
            TransferOutcome::AuthFailure(message) => write!(f, "Authentication failed: {message}"),
            TransferOutcome::FileExists(name) => write!(f, "File already exists: {name}"),
            TransferOutcome::NetworkError(message) => write!(f, "Network error: {message}"),
            TransferOutcome::InvalidParameters(message) => {
                write!(f, "Invalid parameters: {message}")
            }
        }
    }
}

/// Events a transfer worker sends to the thread that owns the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferUpdate {
    Started { total: u64 },
    Progress { transferred: u64 },
    Finished,
    Message(String),
    /// A key pair was created for the named identity.
    KeyGenerated(String),
    Done(TransferOutcome),
}
