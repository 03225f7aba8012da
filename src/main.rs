use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

mod app;
mod error;
mod keys;
mod model;
mod ssh;
mod storage;
mod transfer;
mod ui;

use app::{App, TransferState, prune_log_file};
use keys::{KeyAlgorithm, KeyStore};
use model::{AuthMethod, SharedObject};
use ssh::{AcceptAnyHost, Connector, HostTrust, PinnedFingerprint, SessionManager};
use storage::{JsonSettings, Settings, config_path, keys_dir, log_path, parse_bool};
use ui::ConsoleUi;

const USAGE: &str = "\
Usage:
  sftp-share <FILE> [--as <NAME>]   send FILE to the configured server
  sftp-share --public-key           print the public key to authorize on the server
  sftp-share --set <KEY> <VALUE>    change a setting
  sftp-share --show                 print the current settings

Settings: server, port, username, destination, auth_method (password|publickey),
          remember_password (true|false), password, key_algorithm (dsa|rsa|ed25519)";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Share { path: PathBuf, name: Option<String> },
    PublicKey,
    Set { key: String, value: String },
    Show,
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args {
            [] => Ok(Command::Help),
            [flag] if flag == "-h" || flag == "--help" => Ok(Command::Help),
            [flag] if flag == "--public-key" => Ok(Command::PublicKey),
            [flag] if flag == "--show" => Ok(Command::Show),
            [flag, key, value] if flag == "--set" => Ok(Command::Set {
                key: key.clone(),
                value: value.clone(),
            }),
            [path] if !path.starts_with("--") => Ok(Command::Share {
                path: PathBuf::from(path),
                name: None,
            }),
            [path, flag, name] if flag == "--as" && !path.starts_with("--") => {
                Ok(Command::Share {
                    path: PathBuf::from(path),
                    name: Some(name.clone()),
                })
            }
            _ => anyhow::bail!("unrecognized arguments\n\n{USAGE}"),
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let settings_path = config_path()?;
    let mut settings = JsonSettings::load(&settings_path)
        .with_context(|| format!("load settings from {}", settings_path.display()))?;

    match command {
        Command::Set { key, value } => set_setting(&mut settings, &key, &value),
        Command::Show => {
            show_settings(&settings);
            Ok(())
        }
        Command::PublicKey => {
            let keys = key_store(&settings)?;
            let server = settings.get_string(storage::keys::SERVER, "");
            let username = settings.get_string(storage::keys::USERNAME, "");
            let line = keys
                .public_key(&server, &username)
                .context("export public key")?;
            println!("{line}");
            Ok(())
        }
        Command::Share { path, name } => share(settings, &path, name),
        Command::Help => Ok(()),
    }
}

fn share(settings: JsonSettings, path: &std::path::Path, name: Option<String>) -> Result<()> {
    validate_settings(&settings)?;
    let mut shared = SharedObject::from_path(path).context("open file to share")?;
    if let Some(name) = name {
        shared.rename(name);
    }
    let keys = Arc::new(key_store(&settings)?);
    let connector: Arc<dyn Connector> = Arc::new(SessionManager::new(host_trust(&settings)));
    let log_path = log_path()?;
    prune_log_file(&log_path);

    let mut app = App::new(settings, ConsoleUi::new(), keys, connector, shared, log_path)?;
    match app.run()? {
        TransferState::Succeeded => Ok(()),
        _ => std::process::exit(1),
    }
}

/// Rejects values the transfer flow has no meaning for before anything runs.
fn validate_settings(settings: &dyn Settings) -> Result<()> {
    settings
        .get_string(storage::keys::AUTH_METHOD, storage::keys::DEFAULT_AUTH_METHOD)
        .parse::<AuthMethod>()
        .context("invalid auth_method setting")?;
    key_algorithm(settings)?;
    Ok(())
}

fn key_algorithm(settings: &dyn Settings) -> Result<KeyAlgorithm> {
    settings
        .get_string(
            storage::keys::KEY_ALGORITHM,
            storage::keys::DEFAULT_KEY_ALGORITHM,
        )
        .parse::<KeyAlgorithm>()
        .context("invalid key_algorithm setting")
}

fn key_store(settings: &dyn Settings) -> Result<KeyStore> {
    Ok(KeyStore::new(keys_dir()?, key_algorithm(settings)?))
}

/// Pins the host key when `host_fingerprint` is set, otherwise trusts any host.
fn host_trust(settings: &dyn Settings) -> Arc<dyn HostTrust> {
    let fingerprint = settings.get_string(storage::keys::HOST_FINGERPRINT, "");
    if fingerprint.trim().is_empty() {
        Arc::new(AcceptAnyHost)
    } else {
        Arc::new(PinnedFingerprint::new(&fingerprint))
    }
}

fn set_setting(settings: &mut dyn Settings, key: &str, value: &str) -> Result<()> {
    if !storage::keys::ALL.contains(&key) {
        anyhow::bail!("unknown setting '{key}'");
    }
    if storage::keys::BOOL_KEYS.contains(&key) {
        return settings.set_bool(key, parse_bool(value)?);
    }
    match key {
        storage::keys::AUTH_METHOD => {
            let method = value.parse::<AuthMethod>()?;
            settings.set_string(key, method.as_str())
        }
        storage::keys::KEY_ALGORITHM => {
            value.parse::<KeyAlgorithm>()?;
            settings.set_string(key, &value.trim().to_ascii_lowercase())
        }
        storage::keys::PORT => {
            value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid port '{value}'"))?;
            settings.set_string(key, value.trim())
        }
        _ => settings.set_string(key, value),
    }
}

fn show_settings(settings: &JsonSettings) {
    println!("# {}", settings.path().display());
    for key in storage::keys::ALL {
        let value = if storage::keys::BOOL_KEYS.contains(key) {
            settings.get_bool(key, false).to_string()
        } else if storage::keys::SECRET_KEYS.contains(key) {
            if settings.get_string(key, "").is_empty() {
                String::new()
            } else {
                "********".to_string()
            }
        } else {
            settings.get_string(key, "")
        };
        println!("{key} = {value}");
    }
}
