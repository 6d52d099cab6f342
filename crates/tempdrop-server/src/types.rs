//! Wire types for the HTTP API and the observer channel

use ephemeral_registry::{ObjectRecord, RegistryEvent, RegistryStats};
use serde::{Deserialize, Serialize};

/// Sent as the `fileDeleted` payload after a delete-all
pub const ALL_FILES: &str = "all";

/// Public view of a live file. The content location is never exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub file_id: String,
    pub file_name: String,
    pub file_url: String,
    pub size: u64,
    /// Unix millis
    pub upload_time: i64,
    /// Unix millis
    pub expires_at: i64,
}

impl From<&ObjectRecord> for FileView {
    fn from(record: &ObjectRecord) -> Self {
        Self {
            file_id: record.id.to_string(),
            file_name: record.display_name.clone(),
            file_url: format!("/uploads/{}", record.id),
            size: record.size,
            upload_time: record.created_at.timestamp_millis(),
            expires_at: record.expires_at().timestamp_millis(),
        }
    }
}

pub fn file_views(records: &[ObjectRecord]) -> Vec<FileView> {
    records.iter().map(FileView::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    pub file_id: String,
    /// Milliseconds
    pub remaining_time: u64,
}

/// Message pushed to observers, one JSON text frame each
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum WireEvent {
    InitialFiles(Vec<FileView>),
    FilesUploaded(Vec<FileView>),
    FileDeleted(String),
    FileTimerUpdate(TimerUpdate),
}

impl WireEvent {
    /// Frames for one registry event. A timer tick fans out into one
    /// `fileTimerUpdate` per live file.
    pub fn from_registry(event: &RegistryEvent) -> Vec<WireEvent> {
        match event {
            RegistryEvent::Added(records) => vec![WireEvent::FilesUploaded(file_views(records))],
            RegistryEvent::Removed(id) => vec![WireEvent::FileDeleted(id.to_string())],
            RegistryEvent::RemovedAll => vec![WireEvent::FileDeleted(ALL_FILES.to_string())],
            RegistryEvent::RemainingTimes(times) => times
                .iter()
                .map(|(id, remaining)| {
                    WireEvent::FileTimerUpdate(TimerUpdate {
                        file_id: id.to_string(),
                        remaining_time: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    })
                })
                .collect(),
        }
    }
}

/// Body of `POST /delete-files`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFilesRequest {
    #[serde(alias = "ids")]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteFilesResponse {
    pub deleted: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteAllResponse {
    pub deleted: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub observers: usize,
    pub registry: RegistryStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemeral_registry::ObjectId;
    use std::time::Duration;

    fn record() -> ObjectRecord {
        ObjectRecord::new(
            ObjectId::from("1700000000000-abc"),
            "holiday.jpg",
            2048,
            Duration::from_secs(7200),
        )
    }

    #[test]
    fn test_file_view_from_record() {
        let record = record();
        let view = FileView::from(&record);

        assert_eq!(view.file_id, "1700000000000-abc");
        assert_eq!(view.file_name, "holiday.jpg");
        assert_eq!(view.file_url, "/uploads/1700000000000-abc");
        assert_eq!(view.size, 2048);
        assert_eq!(view.expires_at - view.upload_time, 7_200_000);
    }

    #[test]
    fn test_file_view_hides_content_location() {
        let json = serde_json::to_string(&FileView::from(&record())).unwrap();
        assert!(json.contains("\"fileId\""));
        assert!(json.contains("\"uploadTime\""));
        assert!(!json.contains("content_location"));
        assert!(!json.contains("contentLocation"));
    }

    fn single(event: &RegistryEvent) -> serde_json::Value {
        let frames = WireEvent::from_registry(event);
        assert_eq!(frames.len(), 1);
        serde_json::to_value(&frames[0]).unwrap()
    }

    #[test]
    fn test_wire_event_names() {
        let record = record();

        let json = serde_json::to_value(WireEvent::InitialFiles(vec![])).unwrap();
        assert_eq!(json["event"], "initialFiles");
        assert!(json["data"].as_array().unwrap().is_empty());

        let json = single(&RegistryEvent::Added(vec![record.clone()]));
        assert_eq!(json["event"], "filesUploaded");
        assert_eq!(json["data"][0]["fileName"], "holiday.jpg");

        let json = single(&RegistryEvent::Removed(record.id.clone()));
        assert_eq!(json["event"], "fileDeleted");
        assert_eq!(json["data"], "1700000000000-abc");

        let json = single(&RegistryEvent::RemovedAll);
        assert_eq!(json["event"], "fileDeleted");
        assert_eq!(json["data"], "all");
    }

    #[test]
    fn test_timer_tick_fans_out_per_file() {
        let event = RegistryEvent::RemainingTimes(vec![
            (ObjectId::from("x"), Duration::from_millis(1500)),
            (ObjectId::from("y"), Duration::from_secs(7200)),
        ]);
        let frames: Vec<serde_json::Value> = WireEvent::from_registry(&event)
            .iter()
            .map(|frame| serde_json::to_value(frame).unwrap())
            .collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["event"], "fileTimerUpdate");
        assert_eq!(frames[0]["data"]["fileId"], "x");
        assert_eq!(frames[0]["data"]["remainingTime"], 1500);
        assert_eq!(frames[1]["data"]["fileId"], "y");
        assert_eq!(frames[1]["data"]["remainingTime"], 7_200_000);
    }

    #[test]
    fn test_delete_request_accepts_both_field_names() {
        let req: DeleteFilesRequest = serde_json::from_str(r#"{"fileIds": ["a", "b"]}"#).unwrap();
        assert_eq!(req.file_ids, vec!["a", "b"]);

        let req: DeleteFilesRequest = serde_json::from_str(r#"{"ids": ["c"]}"#).unwrap();
        assert_eq!(req.file_ids, vec!["c"]);

        assert!(serde_json::from_str::<DeleteFilesRequest>(r#"{"fileIds": "a"}"#).is_err());
    }
}
