use pilot_model::ProgressEvent;
use tracing::{debug, error, info, warn};

#[inline]
pub fn message_for(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::Started => "pilot started",
        ProgressEvent::Tasking => "first message received; tasking",
        ProgressEvent::Received { .. } => "messages received",
        ProgressEvent::Done { .. } => "tasks reconciled",
        ProgressEvent::Finished { error: None } => "pilot finished",
        ProgressEvent::Finished { error: Some(_) } => "pilot finished with an error",
        ProgressEvent::Quarantined { .. } => "quarantined before exit",
    }
}

/// Render one progress event as a structured log line on `pilot.progress`.
#[inline]
pub fn log_event(event: &ProgressEvent) {
    let msg = message_for(event);
    let kind = event.kind();

    match event {
        ProgressEvent::Started | ProgressEvent::Tasking => {
            info!(target: "pilot.progress", kind, "{msg}")
        }
        ProgressEvent::Received { total } => {
            debug!(target: "pilot.progress", kind, total, "{msg}")
        }
        ProgressEvent::Done { succeeded, failed } => {
            info!(target: "pilot.progress", kind, succeeded, failed, "{msg}")
        }
        ProgressEvent::Finished { error: None } => {
            info!(target: "pilot.progress", kind, "{msg}")
        }
        ProgressEvent::Finished { error: Some(reason) } => {
            error!(target: "pilot.progress", kind, %reason, "{msg}")
        }
        ProgressEvent::Quarantined { remaining_secs } => {
            warn!(target: "pilot.progress", kind, remaining_secs, "{msg}")
        }
    }
}
