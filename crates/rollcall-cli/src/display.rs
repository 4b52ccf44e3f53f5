use chrono::Local;
use rollcall_hw::Frame;

use crate::engine::{RecognitionEvent, RecognitionOutcome};

/// Receives the per-face results of each processed frame.
pub trait RecognitionSink {
    fn present(&mut self, frame: &Frame, events: &[RecognitionEvent]);
}

/// Prints an attendance log line for each first sighting of the day.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    fn line(event: &RecognitionEvent) -> Option<String> {
        match &event.outcome {
            RecognitionOutcome::Known {
                identity_id,
                display_name,
                recorded: true,
                ..
            } => Some(format!(
                "{identity_id} ({display_name}) marked present - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            )),
            _ => None,
        }
    }
}

impl RecognitionSink for ConsoleSink {
    fn present(&mut self, frame: &Frame, events: &[RecognitionEvent]) {
        for event in events {
            tracing::debug!(
                seq = frame.sequence,
                label = event.label(),
                x = event.bbox.x,
                y = event.bbox.y,
                width = event.bbox.width,
                height = event.bbox.height,
                "face"
            );
            if let RecognitionOutcome::Unknown { distance } = event.outcome {
                tracing::debug!(distance, "unknown face");
            }
            if let Some(line) = Self::line(event) {
                println!("{line}");
            }
        }
    }
}
