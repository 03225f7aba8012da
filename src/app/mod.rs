use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};

use crate::app::constants::{REASON_CANCELLED, TICK_RATE};
use crate::keys::KeyStore;
use crate::model::{AuthMethod, Credential, SharedObject, TransferOutcome};
use crate::ssh::Connector;
use crate::storage::{Settings, keys};
use crate::ui::Ui;

mod constants;
mod logging;
pub(crate) mod progress;
mod transfer;

pub(crate) use logging::prune_log_file;

/// Where a share action stands. `Succeeded` and `Failed` are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferState {
    AwaitingCredential { default: String },
    Connecting,
    Succeeded,
    Failed { reason: String },
}

/// Drives one share action: asks for credentials, runs attempts on a worker
/// thread and decides after each one whether to ask again or stop.
pub(crate) struct App<S: Settings, U: Ui> {
    pub(crate) settings: S,
    pub(crate) ui: U,
    pub(crate) log_path: PathBuf,
    keys: Arc<KeyStore>,
    connector: Arc<dyn Connector>,
    shared: SharedObject,
    auth_method: AuthMethod,
    state: TransferState,
    attempt: Option<transfer::Attempt>,
}

impl<S: Settings, U: Ui> App<S, U> {
    pub(crate) fn new(
        settings: S,
        ui: U,
        keys: Arc<KeyStore>,
        connector: Arc<dyn Connector>,
        shared: SharedObject,
        log_path: PathBuf,
    ) -> Result<Self> {
        let auth_method = settings
            .get_string(keys::AUTH_METHOD, keys::DEFAULT_AUTH_METHOD)
            .parse::<AuthMethod>()
            .context("auth method setting")?;
        Ok(Self {
            settings,
            ui,
            log_path,
            keys,
            connector,
            shared,
            auth_method,
            state: TransferState::AwaitingCredential {
                default: String::new(),
            },
            attempt: None,
        })
    }

    pub(crate) fn state(&self) -> &TransferState {
        &self.state
    }

    fn set_state(&mut self, state: TransferState) {
        let label = match &state {
            TransferState::AwaitingCredential { .. } => "awaiting credential".to_string(),
            TransferState::Connecting => "connecting".to_string(),
            TransferState::Succeeded => "succeeded".to_string(),
            TransferState::Failed { reason } => format!("failed ({reason})"),
        };
        self.log_line(&format!("State: {label}"));
        self.state = state;
    }

    /// Enters the first state: straight to an attempt for key auth or a
    /// remembered password, otherwise ask for the password.
    pub(crate) fn start(&mut self) {
        self.log_line(&format!(
            "Sharing {} ({} bytes) using {} auth",
            self.shared.name(),
            self.shared.size(),
            self.auth_method
        ));
        match self.auth_method {
            AuthMethod::PublicKey => self.begin_attempt(None),
            AuthMethod::Password => {
                let stored = self.settings.get_string(keys::PASSWORD, "");
                let remember = self.settings.get_bool(keys::REMEMBER_PASSWORD, false);
                if remember && !stored.is_empty() {
                    self.begin_attempt(Some(Credential::Password(stored)));
                } else {
                    self.set_state(TransferState::AwaitingCredential { default: stored });
                }
            }
        }
    }

    pub(crate) fn submit_credential(&mut self, password: String) -> Result<()> {
        if !matches!(self.state, TransferState::AwaitingCredential { .. }) {
            anyhow::bail!("no credential was requested");
        }
        self.begin_attempt(Some(Credential::Password(password)));
        Ok(())
    }

    pub(crate) fn cancel(&mut self) {
        if matches!(self.state, TransferState::AwaitingCredential { .. }) {
            self.set_state(TransferState::Failed {
                reason: REASON_CANCELLED.to_string(),
            });
        }
    }

    /// Title shown when asking for the password.
    pub(crate) fn credential_title(&self) -> String {
        let user = self.settings.get_string(keys::USERNAME, "");
        let server = self.settings.get_string(keys::SERVER, "");
        format!("Password for {user}@{server}")
    }

    pub(crate) fn run(&mut self) -> Result<TransferState> {
        self.start();
        loop {
            match &self.state {
                TransferState::AwaitingCredential { default } => {
                    let default = default.clone();
                    let title = self.credential_title();
                    match self.ui.prompt_credential(&title, &default)? {
                        Some(password) => self.submit_credential(password)?,
                        None => self.cancel(),
                    }
                }
                TransferState::Connecting => {
                    self.poll_transfer_progress();
                    if self.state == TransferState::Connecting {
                        thread::sleep(TICK_RATE);
                    }
                }
                TransferState::Succeeded | TransferState::Failed { .. } => {
                    return Ok(self.state.clone());
                }
            }
        }
    }

    fn finish_attempt(&mut self, outcome: TransferOutcome, password: Option<String>) {
        self.log_line(&format!("Outcome: {outcome}"));
        if outcome.is_success() {
            if let Some(password) = password.filter(|_| self.remembers_password()) {
                if let Err(err) = self.settings.set_string(keys::PASSWORD, &password) {
                    self.log_line(&format!("Could not store password: {err:#}"));
                }
            }
            self.notify(&outcome.to_string());
            self.set_state(TransferState::Succeeded);
            return;
        }

        self.notify(&outcome.to_string());
        match self.auth_method {
            AuthMethod::Password if outcome.is_credential_retryable() => {
                self.set_state(TransferState::AwaitingCredential {
                    default: password.unwrap_or_default(),
                });
            }
            AuthMethod::Password | AuthMethod::PublicKey => {
                self.set_state(TransferState::Failed {
                    reason: outcome.to_string(),
                });
            }
        }
    }

    fn remembers_password(&self) -> bool {
        self.auth_method == AuthMethod::Password
            && self.settings.get_bool(keys::REMEMBER_PASSWORD, false)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::keys::KeyAlgorithm;
    use crate::ssh::mock::MockConnector;
    use crate::storage::MemorySettings;
    use crate::ui::ScriptedUi;

    struct Fixture {
        dir: tempfile::TempDir,
        connector: Arc<MockConnector>,
        keys: Arc<KeyStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("remote").join("inbox")).unwrap();
            fs::create_dir_all(dir.path().join("local")).unwrap();
            fs::write(dir.path().join("local").join("a.txt"), vec![1u8; 1024]).unwrap();
            let connector = Arc::new(MockConnector::new(&dir.path().join("remote"), "right"));
            let keys = Arc::new(KeyStore::new(dir.path().join("keys"), KeyAlgorithm::Ed25519));
            Self {
                dir,
                connector,
                keys,
            }
        }

        fn settings(&self, auth: AuthMethod) -> MemorySettings {
            let mut settings = MemorySettings::default();
            settings.put(keys::SERVER, "h");
            settings.put(keys::USERNAME, "u");
            settings.put(keys::DESTINATION, "/inbox");
            settings.put(keys::AUTH_METHOD, auth.as_str());
            settings
        }

        fn app(&self, settings: MemorySettings, ui: ScriptedUi) -> App<MemorySettings, ScriptedUi> {
            let shared = SharedObject::from_path(&self.dir.path().join("local").join("a.txt"))
                .unwrap();
            App::new(
                settings,
                ui,
                self.keys.clone(),
                self.connector.clone(),
                shared,
                self.dir.path().join("test.log"),
            )
            .unwrap()
        }

        fn remote(&self) -> &Path {
            self.dir.path()
        }
    }

    fn wait_for_attempt(app: &mut App<MemorySettings, ScriptedUi>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while *app.state() == TransferState::Connecting {
            assert!(Instant::now() < deadline, "attempt did not finish");
            app.poll_transfer_progress();
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn wrong_password_reprompts_with_failed_value() {
        let fixture = Fixture::new();
        let mut app = fixture.app(fixture.settings(AuthMethod::Password), ScriptedUi::default());

        app.start();
        assert_eq!(
            *app.state(),
            TransferState::AwaitingCredential {
                default: String::new()
            }
        );
        app.submit_credential("wrong".into()).unwrap();
        assert_eq!(*app.state(), TransferState::Connecting);
        wait_for_attempt(&mut app);
        assert_eq!(
            *app.state(),
            TransferState::AwaitingCredential {
                default: "wrong".into()
            }
        );
        assert!(app.ui.notices[0].starts_with("Authentication failed"));

        app.submit_credential("right".into()).unwrap();
        wait_for_attempt(&mut app);
        assert_eq!(*app.state(), TransferState::Succeeded);
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 2);
        let uploaded = fs::read(fixture.remote().join("remote/inbox/a.txt")).unwrap();
        assert_eq!(uploaded.len(), 1024);
    }

    #[test]
    fn run_loops_through_prompts_until_success() {
        let fixture = Fixture::new();
        let ui = ScriptedUi::answering(&[Some("wrong"), Some("right")]);
        let mut app = fixture.app(fixture.settings(AuthMethod::Password), ui);

        let state = app.run().unwrap();

        assert_eq!(state, TransferState::Succeeded);
        let defaults: Vec<_> = app.ui.prompts.iter().map(|(_, d)| d.as_str()).collect();
        assert_eq!(defaults, vec!["", "wrong"]);
        assert_eq!(app.ui.prompts[0].0, "Password for u@h");
        assert_eq!(app.ui.shown, vec![1024]);
        assert_eq!(app.ui.advanced.iter().sum::<u64>(), 1024);
        assert_eq!(app.ui.dismissed, 1);
    }

    #[test]
    fn remembered_password_is_stored_after_success() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::Password);
        settings.put_bool(keys::REMEMBER_PASSWORD, true);
        let mut app = fixture.app(settings, ScriptedUi::answering(&[Some("right")]));

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        assert_eq!(app.settings.get_string(keys::PASSWORD, ""), "right");
    }

    #[test]
    fn password_is_not_written_without_remember_flag() {
        let fixture = Fixture::new();
        let mut app = fixture.app(
            fixture.settings(AuthMethod::Password),
            ScriptedUi::answering(&[Some("right")]),
        );

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        assert!(app.settings.writes.is_empty());
        assert_eq!(app.settings.get_string(keys::PASSWORD, ""), "");
    }

    #[test]
    fn remembered_password_skips_the_prompt() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::Password);
        settings.put_bool(keys::REMEMBER_PASSWORD, true);
        settings.put(keys::PASSWORD, "right");
        let mut app = fixture.app(settings, ScriptedUi::default());

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        assert!(app.ui.prompts.is_empty());
    }

    #[test]
    fn stale_remembered_password_falls_back_to_prompt() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::Password);
        settings.put_bool(keys::REMEMBER_PASSWORD, true);
        settings.put(keys::PASSWORD, "old");
        let mut app = fixture.app(settings, ScriptedUi::answering(&[Some("right")]));

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        assert_eq!(app.ui.prompts.len(), 1);
        assert_eq!(app.ui.prompts[0].1, "old");
        assert_eq!(app.settings.get_string(keys::PASSWORD, ""), "right");
    }

    #[test]
    fn public_key_share_runs_without_prompting() {
        let fixture = Fixture::new();
        let mut app = fixture.app(fixture.settings(AuthMethod::PublicKey), ScriptedUi::default());

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        assert!(app.ui.prompts.is_empty());
        assert!(fixture.remote().join("keys/h-u").exists());
        assert!(fixture.remote().join("keys/h-u.pub").exists());
        let identities = fixture.connector.identities.lock().unwrap().clone();
        assert_eq!(identities, vec![fixture.remote().join("keys/h-u")]);
        assert_eq!(app.ui.advanced.iter().sum::<u64>(), 1024);
        assert_eq!(app.ui.notices.last().unwrap(), "Transfer finished successfully");
        let log = fs::read_to_string(fixture.dir.path().join("test.log")).unwrap();
        assert!(log.contains("Generated key pair h-u"));
    }

    #[test]
    fn existing_key_pair_is_not_logged_as_generated() {
        let fixture = Fixture::new();
        fixture.keys.generate_or_get("h", "u").unwrap();
        let mut app = fixture.app(fixture.settings(AuthMethod::PublicKey), ScriptedUi::default());

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        let log = fs::read_to_string(fixture.dir.path().join("test.log")).unwrap();
        assert!(!log.contains("Generated key pair"));
        assert_eq!(fixture.keys.generated_count(), 1);
    }

    #[test]
    fn large_transfer_logs_progress_every_mebibyte() {
        let fixture = Fixture::new();
        let size = 5 * 1024 * 1024 / 2;
        fs::write(fixture.dir.path().join("local").join("a.txt"), vec![3u8; size]).unwrap();
        let mut app = fixture.app(
            fixture.settings(AuthMethod::Password),
            ScriptedUi::answering(&[Some("right")]),
        );

        assert_eq!(app.run().unwrap(), TransferState::Succeeded);
        let log = fs::read_to_string(fixture.dir.path().join("test.log")).unwrap();
        let progress: Vec<_> = log
            .lines()
            .filter(|line| line.contains("Transfer progress:"))
            .collect();
        assert_eq!(progress.len(), 2, "{log}");
        assert!(progress[0].ends_with("Transfer progress: 40% (1 MB of 3 MB)"));
        assert!(progress[1].ends_with("Transfer progress: 80% (2 MB of 3 MB)"));
        assert_eq!(app.ui.advanced.iter().sum::<u64>(), size as u64);
    }

    #[test]
    fn public_key_failure_is_final() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::PublicKey);
        settings.put(keys::DESTINATION, "/missing");
        let mut app = fixture.app(settings, ScriptedUi::answering(&[Some("unused")]));

        let state = app.run().unwrap();

        assert!(matches!(state, TransferState::Failed { ref reason } if reason.starts_with("Network error")));
        assert!(app.ui.prompts.is_empty());
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_remote_file_is_not_retried() {
        let fixture = Fixture::new();
        fs::write(fixture.remote().join("remote/inbox/a.txt"), b"keep").unwrap();
        let ui = ScriptedUi::answering(&[Some("right"), Some("right")]);
        let mut app = fixture.app(fixture.settings(AuthMethod::Password), ui);

        let state = app.run().unwrap();

        assert_eq!(
            state,
            TransferState::Failed {
                reason: "File already exists: a.txt".into()
            }
        );
        assert_eq!(app.ui.prompts.len(), 1);
        assert_eq!(fs::read(fixture.remote().join("remote/inbox/a.txt")).unwrap(), b"keep");
    }

    #[test]
    fn cancelling_the_prompt_ends_without_connecting() {
        let fixture = Fixture::new();
        let mut app = fixture.app(fixture.settings(AuthMethod::Password), ScriptedUi::default());

        let state = app.run().unwrap();

        assert_eq!(
            state,
            TransferState::Failed {
                reason: REASON_CANCELLED.into()
            }
        );
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_settings_fail_before_connecting() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::PublicKey);
        settings.put(keys::SERVER, "");
        let mut app = fixture.app(settings, ScriptedUi::default());

        let state = app.run().unwrap();

        assert!(matches!(state, TransferState::Failed { .. }));
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.keys.generated_count(), 0);
        assert!(app.ui.notices[0].starts_with("Invalid parameters"));
    }

    #[test]
    fn only_one_attempt_runs_at_a_time() {
        let fixture = Fixture::new();
        let mut app = fixture.app(fixture.settings(AuthMethod::PublicKey), ScriptedUi::default());

        app.start();
        assert_eq!(*app.state(), TransferState::Connecting);
        assert!(app.submit_credential("x".into()).is_err());
        wait_for_attempt(&mut app);
        assert_eq!(*app.state(), TransferState::Succeeded);
        assert_eq!(fixture.connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_auth_method_is_rejected_up_front() {
        let fixture = Fixture::new();
        let mut settings = fixture.settings(AuthMethod::Password);
        settings.put(keys::AUTH_METHOD, "telepathy");
        let shared =
            SharedObject::from_path(&fixture.dir.path().join("local").join("a.txt")).unwrap();
        let result = App::new(
            settings,
            ScriptedUi::default(),
            fixture.keys.clone(),
            fixture.connector.clone(),
            shared,
            fixture.dir.path().join("test.log"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn transitions_are_logged() {
        let fixture = Fixture::new();
        let mut app = fixture.app(
            fixture.settings(AuthMethod::Password),
            ScriptedUi::answering(&[Some("right")]),
        );
        app.run().unwrap();
        let log = fs::read_to_string(fixture.dir.path().join("test.log")).unwrap();
        assert!(log.contains("State: connecting"));
        assert!(log.contains("State: succeeded"));
        assert!(log.trim_end().ends_with("State: succeeded"));
    }
}
