use crate::engine::{EngineError, EngineHandle};
use presence_core::ledger::TIMESTAMP_FORMAT;
use presence_core::{AttendanceEvent, FaceGallery, GalleryError, LedgerStore, RegisterOutcome, SessionError};
use serde::Serialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    gallery: FaceGallery,
    ledger: LedgerStore,
    camera_device: String,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    name: &'a str,
    timestamp: String,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, gallery: FaceGallery, ledger: LedgerStore, camera_device: String) -> Self {
        Self {
            engine,
            gallery,
            ledger,
            camera_device,
        }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Session(SessionError::Gallery(GalleryError::InvalidName(name))) => {
            zbus::fdo::Error::InvalidArgs(format!("invalid name: {name:?}"))
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

/// Render ledger events as a JSON array of `{name, timestamp}` objects.
pub fn log_json(events: &[AttendanceEvent]) -> Result<String, serde_json::Error> {
    let entries: Vec<LogEntry<'_>> = events
        .iter()
        .map(|e| LogEntry {
            name: &e.name,
            timestamp: e.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        })
        .collect();
    serde_json::to_string(&entries)
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Capture the first face in view and store it under `name`.
    async fn register_face(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "register requested");
        let outcome = self.engine.register(name.to_string()).await.map_err(to_fdo)?;
        Ok(matches!(outcome, RegisterOutcome::Saved(_)))
    }

    /// Mark the first recognized person. Empty when cancelled or timed out.
    async fn track_attendance(&self) -> zbus::fdo::Result<String> {
        tracing::info!("track requested");
        let marked = self.engine.track().await.map_err(to_fdo)?;
        Ok(marked.unwrap_or_default())
    }

    /// Stop the running session.
    async fn cancel(&self) -> zbus::fdo::Result<()> {
        let sent = self.engine.cancel().map_err(to_fdo)?;
        tracing::info!(sent, "cancel requested");
        Ok(())
    }

    async fn attendance_log(&self) -> zbus::fdo::Result<String> {
        let events = self
            .ledger
            .events()
            .map_err(|e| zbus::fdo::Error::IOError(e.to_string()))?;
        log_json(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn clear_log(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear log requested");
        self.ledger
            .clear()
            .map_err(|e| zbus::fdo::Error::IOError(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let registered = self.gallery.count();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "busy": self.engine.is_busy(),
            "registered_faces": registered,
            "ledger": self.ledger.path().display().to_string(),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_log_json() {
        let events = vec![AttendanceEvent {
            name: "Alice".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(8, 15, 0).unwrap(),
        }];
        let json: serde_json::Value = serde_json::from_str(&log_json(&events).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "name": "Alice", "timestamp": "2024-05-01 08:15:00" }])
        );
    }

    #[test]
    fn test_empty_log_json() {
        assert_eq!(log_json(&[]).unwrap(), "[]");
    }

    #[test]
    fn test_invalid_name_maps_to_invalid_args() {
        let err = EngineError::Session(SessionError::Gallery(GalleryError::InvalidName("a/b".into())));
        assert!(matches!(to_fdo(err), zbus::fdo::Error::InvalidArgs(_)));
        assert!(matches!(to_fdo(EngineError::ChannelClosed), zbus::fdo::Error::Failed(_)));
    }
}
