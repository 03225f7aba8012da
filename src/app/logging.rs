use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Datelike;

use crate::app::App;
use crate::app::constants::{
    LOG_MAX_ENTRIES, LOG_PARSE_FORMAT, LOG_RETENTION_DAYS, LOG_SEPARATOR, LOG_TIMESTAMP_FORMAT,
};
use crate::storage::Settings;
use crate::ui::Ui;

impl<S: Settings, U: Ui> App<S, U> {
    pub(super) fn log_line(&mut self, message: &str) {
        let timestamp = chrono::Local::now().format(LOG_TIMESTAMP_FORMAT);
        let line = format!("{timestamp}{LOG_SEPARATOR}{message}");
        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = writeln!(file, "{line}");
        }
    }

    /// Tells the user and keeps a record of it.
    pub(super) fn notify(&mut self, message: &str) {
        self.log_line(message);
        self.ui.notify(message);
    }
}

pub(crate) fn prune_log_file(path: &Path) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let cutoff = chrono::Local::now().naive_local() - chrono::Duration::days(LOG_RETENTION_DAYS);
    let current_year = chrono::Local::now().year();
    let mut kept = Vec::new();
    for line in content.lines() {
        if let Some((timestamp, _)) = line.split_once(LOG_SEPARATOR) {
            let with_year = format!("{current_year}-{timestamp}");
            if let Ok(parsed) =
                chrono::NaiveDateTime::parse_from_str(&with_year, LOG_PARSE_FORMAT)
            {
                if parsed >= cutoff {
                    kept.push(line.to_string());
                }
            }
        }
    }
    if kept.len() > LOG_MAX_ENTRIES {
        kept = kept.split_off(kept.len().saturating_sub(LOG_MAX_ENTRIES));
    }
    if kept.is_empty() {
        let _ = fs::remove_file(path);
    } else if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
        let _ = fs::write(path, kept.join("\n") + "\n");
    }
}
