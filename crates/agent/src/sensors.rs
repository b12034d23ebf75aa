//! Reader for the sensor snapshot written by the external logging process.
//!
//! The snapshot is a small JSON object (`temperature`, `TDS`, `PH`, any of
//! which may be missing). A failed read never erases values already held in
//! [`DeviceState`]: stale-but-valid beats unset.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::state::{DeviceState, SystemState};

/// One snapshot read. `None` means "no update" for that field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub(crate) struct SensorReadings {
    #[serde(default, deserialize_with = "lenient_number")]
    pub(crate) temperature: Option<f64>,
    #[serde(rename = "TDS", default, deserialize_with = "lenient_number")]
    pub(crate) tds: Option<f64>,
    #[serde(rename = "PH", default, deserialize_with = "lenient_number")]
    pub(crate) ph: Option<f64>,
}

impl SensorReadings {
    /// Copy every present reading into `state`; absent ones are left alone.
    pub(crate) fn apply(&self, state: &mut DeviceState) {
        if let Some(v) = self.temperature {
            state.temperature = Some(v);
        }
        if let Some(v) = self.tds {
            state.tds = Some(v);
        }
        if let Some(v) = self.ph {
            state.ph = Some(v);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.tds.is_none() && self.ph.is_none()
    }
}

/// A sensor value that is not a finite number (string, NaN sentinel, bool)
/// counts as absent rather than failing the whole snapshot.
fn lenient_number<'de, D>(d: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(d)?;
    Ok(v.as_f64().filter(|n| n.is_finite()))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub(crate) struct SnapshotReader {
    path: PathBuf,
}

impl SnapshotReader {
    pub(crate) fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the snapshot once.
    pub(crate) async fn refresh(&self) -> Result<SensorReadings> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| AgentError::SensorSource(format!("{}: {e}", self.path.display())))?;
        decode_snapshot(&bytes)
    }

    /// Refresh and merge into `state`. Failures are logged and leave the
    /// sensor fields untouched. Returns whether anything was applied.
    pub(crate) async fn refresh_into(&self, state: &RwLock<SystemState>) -> bool {
        match self.refresh().await {
            Ok(readings) if readings.is_empty() => {
                debug!(path = %self.path.display(), "sensor snapshot has no readings");
                false
            }
            Ok(readings) => {
                let mut st = state.write().await;
                readings.apply(&mut st.device);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), "sensor refresh failed: {e}");
                false
            }
        }
    }
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<SensorReadings> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(AgentError::Decode("sensor snapshot must be a JSON object".into()));
    }
    Ok(serde_json::from_value(value)?)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_snapshot(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hydro-agent-{name}-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    // -- decode_snapshot ----------------------------------------------------

    #[test]
    fn decode_full_snapshot() {
        let r = decode_snapshot(br#"{"temperature":21.5,"TDS":640,"PH":6.2}"#).unwrap();
        assert_eq!(
            r,
            SensorReadings {
                temperature: Some(21.5),
                tds: Some(640.0),
                ph: Some(6.2),
            }
        );
    }

    #[test]
    fn decode_partial_snapshot() {
        let r = decode_snapshot(br#"{"TDS":85}"#).unwrap();
        assert_eq!(r.tds, Some(85.0));
        assert_eq!(r.temperature, None);
        assert_eq!(r.ph, None);
    }

    #[test]
    fn decode_non_numeric_values_are_absent() {
        let r = decode_snapshot(br#"{"temperature":"n/a","TDS":null,"PH":true}"#).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn decode_lowercase_keys_not_recognized() {
        let r = decode_snapshot(br#"{"tds":85,"ph":6.0}"#).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn decode_malformed_json_fails() {
        assert!(matches!(
            decode_snapshot(b"{\"TDS\":"),
            Err(AgentError::Decode(_))
        ));
    }

    #[test]
    fn decode_non_object_fails() {
        assert!(decode_snapshot(b"[21.5, 640, 6.2]").is_err());
    }

    // -- apply --------------------------------------------------------------

    #[test]
    fn apply_keeps_prior_values_for_absent_fields() {
        let mut st = DeviceState {
            temperature: Some(19.0),
            tds: Some(300.0),
            ph: Some(6.8),
            ..DeviceState::default()
        };
        SensorReadings {
            tds: Some(310.0),
            ..SensorReadings::default()
        }
        .apply(&mut st);

        assert_eq!(st.tds, Some(310.0));
        assert_eq!(st.temperature, Some(19.0));
        assert_eq!(st.ph, Some(6.8));
    }

    // -- SnapshotReader -----------------------------------------------------

    #[tokio::test]
    async fn refresh_missing_file_is_source_error() {
        let reader = SnapshotReader::new("/nonexistent/hydro-agent/shared_data.json");
        assert!(matches!(
            reader.refresh().await,
            Err(AgentError::SensorSource(_))
        ));
    }

    #[tokio::test]
    async fn refresh_into_updates_state() {
        let path = temp_snapshot("ok", r#"{"temperature":20.0,"TDS":85,"PH":6.0}"#);
        let reader = SnapshotReader::new(&path);
        let shared = SystemState::shared();

        assert!(reader.refresh_into(&shared).await);

        let st = shared.read().await;
        assert_eq!(st.device.tds, Some(85.0));
        assert_eq!(st.device.temperature, Some(20.0));
        assert_eq!(st.device.ph, Some(6.0));
        drop(st);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn refresh_into_failure_keeps_prior_readings() {
        let path = temp_snapshot("bad", "not json");
        let reader = SnapshotReader::new(&path);
        let shared = SystemState::shared();
        shared.write().await.device.tds = Some(450.0);

        assert!(!reader.refresh_into(&shared).await);

        assert_eq!(shared.read().await.device.tds, Some(450.0));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn refresh_into_missing_file_keeps_prior_readings() {
        let reader = SnapshotReader::new("/nonexistent/hydro-agent/shared_data.json");
        let shared = SystemState::shared();
        shared.write().await.device.ph = Some(5.9);

        assert!(!reader.refresh_into(&shared).await);
        assert_eq!(shared.read().await.device.ph, Some(5.9));
    }
}
