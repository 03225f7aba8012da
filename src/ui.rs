use std::io::{self, IsTerminal, Stderr};

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Style};
use ratatui::widgets::Gauge;
use ratatui::{Terminal, TerminalOptions, Viewport};
use rpassword::prompt_password;

use crate::app::progress::ProgressState;

const MB_BYTES: f64 = 1024.0 * 1024.0;
const PLAIN_PROGRESS_STEP: u16 = 10;

/// What the transfer flow needs from whoever talks to the user.
pub(crate) trait Ui {
    /// `Ok(None)` means the user gave up.
    fn prompt_credential(&mut self, title: &str, default: &str) -> Result<Option<String>>;
    fn notify(&mut self, message: &str);
    fn show_progress(&mut self, max: u64);
    fn advance_progress(&mut self, delta: u64);
    fn dismiss_progress(&mut self);
}

pub(crate) struct ConsoleUi {
    interactive: bool,
    progress: Option<ProgressView>,
}

impl ConsoleUi {
    pub(crate) fn new() -> Self {
        Self {
            interactive: io::stderr().is_terminal(),
            progress: None,
        }
    }
}

struct ProgressView {
    state: ProgressState,
    terminal: Option<Terminal<CrosstermBackend<Stderr>>>,
    last_percent: Option<u16>,
}

impl ProgressView {
    fn new(total: u64, interactive: bool) -> Self {
        let terminal = if interactive {
            Terminal::with_options(
                CrosstermBackend::new(io::stderr()),
                TerminalOptions {
                    viewport: Viewport::Inline(1),
                },
            )
            .ok()
        } else {
            None
        };
        Self {
            state: ProgressState::new(total),
            terminal,
            last_percent: None,
        }
    }

    fn render(&mut self) {
        let percent = self.state.percent();
        if let Some(terminal) = &mut self.terminal {
            if self.last_percent == Some(percent) {
                return;
            }
            let label = format!(
                "{percent}% ({:.1} of {:.1} MB)",
                self.state.transferred as f64 / MB_BYTES,
                self.state.total as f64 / MB_BYTES
            );
            let gauge = Gauge::default()
                .gauge_style(Style::default().fg(Color::Cyan))
                .percent(percent.min(100))
                .label(label);
            terminal
                .draw(|frame| frame.render_widget(gauge, frame.area()))
                .ok();
        } else {
            let step = percent / PLAIN_PROGRESS_STEP;
            if self.last_percent.map(|last| last / PLAIN_PROGRESS_STEP) == Some(step) {
                return;
            }
            eprintln!("{percent}%");
        }
        self.last_percent = Some(percent);
    }
}

impl Ui for ConsoleUi {
    fn prompt_credential(&mut self, title: &str, default: &str) -> Result<Option<String>> {
        let hint = if default.is_empty() {
            ""
        } else {
            " (Enter reuses the last one)"
        };
        let answer =
            prompt_password(format!("{title}{hint}: ")).context("read password")?;
        if !answer.is_empty() {
            return Ok(Some(answer));
        }
        if default.is_empty() {
            return Ok(None);
        }
        Ok(Some(default.to_string()))
    }

    fn notify(&mut self, message: &str) {
        eprintln!("{} {}", "sftp-share:".bold(), message);
    }

    fn show_progress(&mut self, max: u64) {
        let mut view = ProgressView::new(max, self.interactive);
        view.render();
        self.progress = Some(view);
    }

    fn advance_progress(&mut self, delta: u64) {
        if let Some(view) = &mut self.progress {
            let transferred = view.state.transferred.saturating_add(delta);
            view.state.advance_to(transferred);
            view.render();
        }
    }

    fn dismiss_progress(&mut self) {
        if let Some(mut view) = self.progress.take() {
            if let Some(terminal) = &mut view.terminal {
                terminal.clear().ok();
            }
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedUi {
    pub(crate) answers: std::collections::VecDeque<Option<String>>,
    pub(crate) prompts: Vec<(String, String)>,
    pub(crate) notices: Vec<String>,
    pub(crate) shown: Vec<u64>,
    pub(crate) advanced: Vec<u64>,
    pub(crate) dismissed: usize,
}

#[cfg(test)]
impl ScriptedUi {
    pub(crate) fn answering(answers: &[Option<&str>]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|answer| answer.map(str::to_string))
                .collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl Ui for ScriptedUi {
    fn prompt_credential(&mut self, title: &str, default: &str) -> Result<Option<String>> {
        self.prompts.push((title.to_string(), default.to_string()));
        Ok(self.answers.pop_front().flatten())
    }

    fn notify(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }

    fn show_progress(&mut self, max: u64) {
        self.shown.push(max);
    }

    fn advance_progress(&mut self, delta: u64) {
        self.advanced.push(delta);
    }

    fn dismiss_progress(&mut self) {
        self.dismissed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_progress_tracks_bytes_without_terminal() {
        let mut ui = ConsoleUi {
            interactive: false,
            progress: None,
        };
        ui.show_progress(1000);
        ui.advance_progress(250);
        ui.advance_progress(750);
        let view = ui.progress.as_ref().unwrap();
        assert_eq!(view.state.transferred, 1000);
        assert_eq!(view.state.percent(), 100);
        ui.dismiss_progress();
        assert!(ui.progress.is_none());
    }

    #[test]
    fn scripted_ui_runs_out_of_answers_as_cancel() {
        let mut ui = ScriptedUi::answering(&[Some("pw")]);
        assert_eq!(ui.prompt_credential("t", "").unwrap(), Some("pw".to_string()));
        assert_eq!(ui.prompt_credential("t", "pw").unwrap(), None);
        assert_eq!(ui.prompts.len(), 2);
    }
}
