use serde::Serialize;
use std::sync::Arc;

/// Progress shown to the user while a transfer runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub title: String,
    pub message: String,
    pub fraction: f64,
}

/// Receives progress updates for display. Updates are advisory; a sink
/// never reports failure back to the protocol.
pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: &Progress);

    /// The transfer is over; hide whatever is being shown.
    fn dismiss(&self);
}

/// Owns the progress model of one machine and forwards changes to its sink.
pub(crate) struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    current: Progress,
    presented: bool,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            current: Progress::default(),
            presented: false,
        }
    }

    pub(crate) fn set(&mut self, title: Option<&str>, message: Option<&str>, fraction: f64) {
        if let Some(title) = title {
            self.current.title = title.to_string();
        }
        if let Some(message) = message {
            self.current.message = message.to_string();
        }
        self.current.fraction = fraction.clamp(0.0, 1.0);
        self.presented = true;

        tracing::trace!(
            "progress {} {} -> {:.2}",
            self.current.title,
            self.current.message,
            self.current.fraction
        );
        self.sink.update(&self.current);
    }

    pub(crate) fn fraction(&mut self, fraction: f64) {
        self.set(None, None, fraction);
    }

    /// Dismiss at most once per presentation.
    pub(crate) fn dismiss(&mut self) {
        if !self.presented {
            return;
        }
        self.presented = false;
        self.current = Progress::default();
        self.sink.dismiss();
    }
}
