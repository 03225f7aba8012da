use std::sync::mpsc::{self, TryRecvError};
use std::thread;

use crate::app::constants::{MB_BYTES, REASON_WORKER_LOST, TRANSFER_LOG_THRESHOLD_BYTES};
use crate::app::progress::ProgressState;
use crate::app::{App, TransferState};
use crate::model::{Credential, TransferOutcome, TransferRequest, TransferUpdate};
use crate::storage::Settings;
use crate::transfer::run_attempt;
use crate::ui::Ui;

/// The UI thread's handle on the attempt currently running.
pub(super) struct Attempt {
    rx: mpsc::Receiver<TransferUpdate>,
    password: Option<String>,
    progress: ProgressState,
    last_logged: u64,
}

impl<S: Settings, U: Ui> App<S, U> {
    /// Starts an attempt on a worker thread. `None` authenticates with the
    /// stored key pair.
    pub(super) fn begin_attempt(&mut self, credential: Option<Credential>) {
        let request = match TransferRequest::from_settings(&self.settings, &self.shared) {
            Ok(request) => request,
            Err(err) => {
                let outcome = TransferOutcome::from(Err(err));
                self.notify(&outcome.to_string());
                self.set_state(TransferState::Failed {
                    reason: outcome.to_string(),
                });
                return;
            }
        };
        let password = match &credential {
            Some(Credential::Password(password)) => Some(password.clone()),
            _ => None,
        };
        self.log_line(&format!(
            "Connecting to {}@{}:{} ({} auth) for {}",
            request.username,
            request.server,
            request.port,
            request.auth_method,
            request.destination_path
        ));

        let (tx, rx) = mpsc::channel();
        let connector = self.connector.clone();
        let keys = self.keys.clone();
        thread::spawn(move || {
            let outcome = run_attempt(connector.as_ref(), &keys, &request, credential, &tx);
            let _ = tx.send(TransferUpdate::Done(outcome));
        });
        self.attempt = Some(Attempt {
            rx,
            password,
            progress: ProgressState::default(),
            last_logged: 0,
        });
        self.set_state(TransferState::Connecting);
    }

    /// Applies whatever the worker has reported since the last call.
    pub(crate) fn poll_transfer_progress(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        loop {
            let update = match attempt.rx.try_recv() {
                Ok(update) => update,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let outcome = TransferOutcome::NetworkError(REASON_WORKER_LOST.to_string());
                    self.finish_attempt(outcome, attempt.password);
                    return;
                }
            };
            match update {
                TransferUpdate::Started { total } => {
                    attempt.progress = ProgressState::new(total);
                    attempt.last_logged = 0;
                    self.ui.show_progress(total);
                }
                TransferUpdate::Progress { transferred } => {
                    let delta = attempt.progress.advance_to(transferred);
                    if delta > 0 {
                        self.ui.advance_progress(delta);
                    }
                    let progress = attempt.progress;
                    if progress.transferred.saturating_sub(attempt.last_logged)
                        >= TRANSFER_LOG_THRESHOLD_BYTES
                    {
                        let current_mb = (progress.transferred as f64 / MB_BYTES).round() as u64;
                        let total_mb = (progress.total as f64 / MB_BYTES).round() as u64;
                        self.log_line(&format!(
                            "Transfer progress: {}% ({current_mb} MB of {total_mb} MB)",
                            progress.percent()
                        ));
                        attempt.last_logged = progress.transferred;
                    }
                }
                TransferUpdate::Finished => self.ui.dismiss_progress(),
                TransferUpdate::Message(message) => self.notify(&message),
                TransferUpdate::KeyGenerated(name) => {
                    self.log_line(&format!("Generated key pair {name}"));
                }
                TransferUpdate::Done(outcome) => {
                    self.finish_attempt(outcome, attempt.password);
                    return;
                }
            }
        }
        self.attempt = Some(attempt);
    }
}
