//! Events pushed to the presentation layer.
//!
//! Builds and queries report progress through an [`EventSink`]. The consumer
//! owns the receiving end of a `flume` channel; nothing here ever waits on it.

use serde::Serialize;

use crate::retrieval::builder::BuildStage;

/// Everything the core reports while it works.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RagEvent {
    Progress {
        stage: BuildStage,
        processed: usize,
        total: usize,
        percentage: f32,
    },
    ExtractionComplete {
        chunks: usize,
    },
    VectorizationComplete {
        vectors: usize,
    },
    RerankProgress {
        index: usize,
        total: usize,
        score: f32,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
    BuildCompleted {
        success: bool,
    },
    TaskCompleted {
        success: bool,
        message: String,
    },
    Cancelled {
        stage: BuildStage,
    },
}

/// Sending half of the event channel. Cloning shares the channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<flume::Sender<RagEvent>>,
}

impl EventSink {
    /// A sink and the receiver that observes it.
    pub fn channel() -> (Self, flume::Receiver<RagEvent>) {
        let (sender, receiver) = flume::unbounded();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RagEvent) {
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is listening
            let _ = sender.send(event);
        }
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(RagEvent::Warning {
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(RagEvent::Error {
            message: message.into(),
        });
    }

    pub fn progress(&self, stage: BuildStage, processed: usize, total: usize, percentage: f32) {
        self.emit(RagEvent::Progress {
            stage,
            processed,
            total,
            percentage,
        });
    }
}
