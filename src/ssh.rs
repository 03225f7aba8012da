use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD as Base64NoPad;
use ssh2::{
    ErrorCode, HashType, KeyboardInteractivePrompt, OpenFlags, OpenType, Prompt, Session, Sftp,
};

use crate::error::TransferError;
use crate::keys::{KeyStore, public_path};
use crate::model::{Credential, TransferRequest, TransferUpdate};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const FX_NO_SUCH_FILE: i32 = 2;
const FX_FILE_ALREADY_EXISTS: i32 = 11;

/// Remote file operations scoped to the destination directory.
pub(crate) trait FileChannel {
    /// `Ok(false)` only when the server reports no such file.
    fn exists(&mut self, name: &str) -> Result<bool, TransferError>;
    fn create(&mut self, name: &str) -> Result<Box<dyn Write + '_>, TransferError>;
    /// Closes the file-transfer channel and then the session.
    fn disconnect(&mut self);
}

pub(crate) trait Connector: Send + Sync {
    fn connect(
        &self,
        request: &TransferRequest,
        auth: &AuthStrategy,
    ) -> Result<Box<dyn FileChannel>, TransferError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostIdentity {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) key_type: String,
    pub(crate) fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrustDecision {
    Accept,
    Reject,
}

/// Decides whether a server's host key is acceptable.
pub(crate) trait HostTrust: Send + Sync {
    fn decide(&self, identity: &HostIdentity) -> TrustDecision;
}

/// Trusts every host key. Nothing is recorded between connections.
#[derive(Debug, Default)]
pub(crate) struct AcceptAnyHost;

impl HostTrust for AcceptAnyHost {
    fn decide(&self, _identity: &HostIdentity) -> TrustDecision {
        TrustDecision::Accept
    }
}

/// Accepts only the host key with the given `SHA256:` fingerprint.
#[derive(Debug)]
pub(crate) struct PinnedFingerprint(String);

impl PinnedFingerprint {
    pub(crate) fn new(fingerprint: &str) -> Self {
        Self(fingerprint.trim().to_string())
    }
}

impl HostTrust for PinnedFingerprint {
    fn decide(&self, identity: &HostIdentity) -> TrustDecision {
        if identity.fingerprint == self.0 {
            TrustDecision::Accept
        } else {
            TrustDecision::Reject
        }
    }
}

/// Answers every interactive prompt with the password and forwards any
/// server instructions to the user.
#[derive(Debug, Clone)]
pub(crate) struct PasswordResponder {
    password: String,
    messages: Sender<TransferUpdate>,
}

impl PasswordResponder {
    pub(crate) fn new(password: String, messages: Sender<TransferUpdate>) -> Self {
        Self { password, messages }
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    fn show_message(&self, message: &str) {
        let message = message.trim();
        if !message.is_empty() {
            let _ = self.messages.send(TransferUpdate::Message(message.to_string()));
        }
    }
}

impl KeyboardInteractivePrompt for PasswordResponder {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        self.show_message(instructions);
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum AuthStrategy {
    Password(PasswordResponder),
    PublicKey { identity: PathBuf },
}

impl AuthStrategy {
    pub(crate) fn from_credential(credential: Credential, messages: Sender<TransferUpdate>) -> Self {
        match credential {
            Credential::Password(password) => {
                AuthStrategy::Password(PasswordResponder::new(password, messages))
            }
            Credential::KeyPair(identity) => AuthStrategy::PublicKey { identity },
        }
    }

    /// Resolves the stored identity for the request, generating it on first use.
    pub(crate) fn public_key(
        keys: &KeyStore,
        request: &TransferRequest,
        updates: &Sender<TransferUpdate>,
    ) -> Result<Credential, TransferError> {
        let identity = keys.resolve(&request.server, &request.username)?;
        if identity.generated {
            let _ = updates.send(TransferUpdate::KeyGenerated(identity.name));
        }
        Ok(Credential::KeyPair(identity.path))
    }

    fn authenticate(&self, session: &Session, user: &str) -> Result<(), TransferError> {
        match self {
            AuthStrategy::Password(responder) => {
                let Err(password_err) = session.userauth_password(user, responder.password())
                else {
                    return Ok(());
                };
                let interactive = session
                    .auth_methods(user)
                    .map(|methods| methods.split(',').any(|m| m == "keyboard-interactive"))
                    .unwrap_or(false);
                if !interactive {
                    return Err(TransferError::auth("password auth", password_err));
                }
                let mut responder = responder.clone();
                session
                    .userauth_keyboard_interactive(user, &mut responder)
                    .map_err(|err| TransferError::auth("keyboard-interactive auth", err))
            }
            AuthStrategy::PublicKey { identity } => {
                let public = public_path(identity);
                let public = public.exists().then_some(public);
                session
                    .userauth_pubkey_file(user, public.as_deref(), identity, None)
                    .map_err(|err| TransferError::auth("public key auth", err))
            }
        }
    }
}

pub(crate) struct SessionManager {
    trust: Arc<dyn HostTrust>,
    timeout: Duration,
}

impl SessionManager {
    pub(crate) fn new(trust: Arc<dyn HostTrust>) -> Self {
        Self {
            trust,
            timeout: CONNECT_TIMEOUT,
        }
    }

    fn verify_host(&self, session: &Session, request: &TransferRequest) -> Result<(), TransferError> {
        let key_type = session
            .host_key()
            .map(|(_, kind)| format!("{kind:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(|hash| format!("SHA256:{}", Base64NoPad.encode(hash)))
            .unwrap_or_default();
        let identity = HostIdentity {
            host: request.server.clone(),
            port: request.port,
            key_type,
            fingerprint,
        };
        check_trust(self.trust.as_ref(), &identity)
    }
}

fn check_trust(trust: &dyn HostTrust, identity: &HostIdentity) -> Result<(), TransferError> {
    match trust.decide(identity) {
        TrustDecision::Accept => Ok(()),
        TrustDecision::Reject => Err(TransferError::NetworkError(format!(
            "host key {} for {}:{} was rejected",
            identity.fingerprint, identity.host, identity.port
        ))),
    }
}

impl Connector for SessionManager {
    fn connect(
        &self,
        request: &TransferRequest,
        auth: &AuthStrategy,
    ) -> Result<Box<dyn FileChannel>, TransferError> {
        let tcp = open_tcp(&request.server, request.port, self.timeout)?;
        let mut session =
            Session::new().map_err(|err| TransferError::network("create session", err))?;
        session.set_timeout(self.timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| TransferError::network("ssh handshake", err))?;
        self.verify_host(&session, request)?;

        auth.authenticate(&session, &request.username)?;
        if !session.authenticated() {
            return Err(TransferError::AuthFailure(
                "server did not accept the credentials".into(),
            ));
        }

        let sftp = session
            .sftp()
            .map_err(|err| TransferError::network("open sftp", err))?;
        let cwd = change_dir(&sftp, &request.destination_path)?;
        Ok(Box::new(SftpChannel {
            session,
            sftp: Some(sftp),
            cwd,
        }))
    }
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransferError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| TransferError::network("resolve address", err))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).ok();
                stream.set_write_timeout(Some(timeout)).ok();
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::other("no address resolved"));
    Err(TransferError::network("connect tcp", err))
}

/// SFTP has no working directory of its own, so resolve and remember it.
fn change_dir(sftp: &Sftp, path: &str) -> Result<PathBuf, TransferError> {
    let resolved = sftp
        .realpath(Path::new(path))
        .map_err(|err| TransferError::network(&format!("cd {path}"), err))?;
    let stat = sftp
        .stat(&resolved)
        .map_err(|err| TransferError::network(&format!("cd {path}"), err))?;
    if !stat.is_dir() {
        return Err(TransferError::NetworkError(format!(
            "cd {path}: not a directory"
        )));
    }
    Ok(resolved)
}

fn sftp_code(err: &ssh2::Error) -> Option<i32> {
    match err.code() {
        ErrorCode::SFTP(code) => Some(code),
        ErrorCode::Session(_) => None,
    }
}

struct SftpChannel {
    session: Session,
    sftp: Option<Sftp>,
    cwd: PathBuf,
}

impl SftpChannel {
    fn sftp(&self) -> Result<&Sftp, TransferError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| TransferError::NetworkError("sftp channel is closed".into()))
    }
}

impl FileChannel for SftpChannel {
    fn exists(&mut self, name: &str) -> Result<bool, TransferError> {
        let path = self.cwd.join(name);
        match self.sftp()?.stat(&path) {
            Ok(_) => Ok(true),
            Err(err) if sftp_code(&err) == Some(FX_NO_SUCH_FILE) => Ok(false),
            Err(err) => Err(TransferError::network(&format!("stat {name}"), err)),
        }
    }

    fn create(&mut self, name: &str) -> Result<Box<dyn Write + '_>, TransferError> {
        let path = self.cwd.join(name);
        let file = self
            .sftp()?
            .open_mode(
                &path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                0o644,
                OpenType::File,
            )
            .map_err(|err| {
                if sftp_code(&err) == Some(FX_FILE_ALREADY_EXISTS) {
                    TransferError::FileExists(name.to_string())
                } else {
                    TransferError::network(&format!("open remote {name}"), err)
                }
            })?;
        Ok(Box::new(file))
    }

    fn disconnect(&mut self) {
        self.sftp.take();
        let _ = self.session.disconnect(None, "transfer finished", None);
    }
}
