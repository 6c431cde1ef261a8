//! Terminal presentation: a progress bar and the consent prompt.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use p2pconnect_core::{Progress, ProgressSink};
use std::io::{BufRead, Write};
use std::sync::Mutex;

/// Bar length; fractions are mapped onto per-mille positions.
const SCALE: u64 = 1000;

/// Draws one indicatif bar per presentation on stderr.
pub struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
    visible: bool,
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self { bar: Mutex::new(None), visible: true }
    }
}

pub fn render(progress: &Progress) -> String {
    format!("[{}] {}", progress.title, progress.message)
}

fn position(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * SCALE as f64).round() as u64
}

impl ConsoleProgress {
    #[cfg(test)]
    fn hidden() -> Self {
        Self { bar: Mutex::new(None), visible: false }
    }

    fn create_bar(&self) -> ProgressBar {
        let target = if self.visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(SCALE), target);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar
    }

    #[cfg(test)]
    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|bar| bar.clone())
    }
}

impl ProgressSink for ConsoleProgress {
    fn update(&self, progress: &Progress) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        let bar = slot.get_or_insert_with(|| self.create_bar());
        bar.set_message(render(progress));
        bar.set_position(position(progress.fraction));
    }

    fn dismiss(&self) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        if let Some(bar) = slot.take() {
            bar.finish_and_clear();
        }
    }
}

pub fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Ask a y/N question on the terminal without blocking the runtime.
pub async fn confirm(question: String) -> Result<bool> {
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        eprint!("{} [y/N] ", question);
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(parse_answer(&answer))
}
