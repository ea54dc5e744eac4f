//! Per-session log streams and the shared `telemetry.json` state file.
//!
//! Each host launch opens a host stream and an extension stream under
//! `profiles/<profile_id>/host/`. Their locations are published to
//! `telemetry.json` in the logs root so external tooling can tail them.

use chrono::{Datelike, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const HOST_STREAM: &str = "synapse_host";
pub const EXTENSION_STREAM: &str = "synapse_extension";
pub const TELEMETRY_FILE: &str = "telemetry.json";

const STREAM_PRIORITY: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub label: String,
    pub path: String,
    pub priority: u8,
    pub last_update: String,
}

/// Inserts or replaces one entry under `active_streams`, keeping every other
/// key in the file as it was.
pub fn upsert_stream(telemetry_path: &Path, stream: &str, entry: &StreamEntry) -> io::Result<()> {
    let mut root = match fs::read_to_string(telemetry_path) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(path = %telemetry_path.display(), "telemetry file unreadable, rewriting");
                Map::new()
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
        Err(err) => return Err(err),
    };

    let streams = root
        .entry("active_streams")
        .or_insert_with(|| Value::Object(Map::new()));
    if !streams.is_object() {
        *streams = Value::Object(Map::new());
    }
    if let Value::Object(streams) = streams {
        let value = serde_json::to_value(entry)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        streams.insert(stream.to_string(), value);
    }

    if let Some(parent) = telemetry_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_vec_pretty(&Value::Object(root))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let tmp = telemetry_path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, telemetry_path)
}

pub fn read_telemetry(telemetry_path: &Path) -> io::Result<Value> {
    let raw = fs::read_to_string(telemetry_path)?;
    serde_json::from_str(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Keeps only characters that are safe in a single path component.
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug)]
struct LogStream {
    name: &'static str,
    label: &'static str,
    path: PathBuf,
    file: File,
    last_telemetry: Instant,
}

impl LogStream {
    fn open(
        name: &'static str,
        label: &'static str,
        path: PathBuf,
        launch_id: &str,
    ) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "\n========== {label} SESSION {} PID:{} LAUNCH:{launch_id} ==========",
            local_timestamp(),
            std::process::id(),
        )?;
        file.flush()?;
        Ok(Self {
            name,
            label,
            path,
            file,
            last_telemetry: Instant::now(),
        })
    }

    fn write_line(&mut self, level: &str, message: &str, timestamp: Option<&str>) -> io::Result<()> {
        let ts = match timestamp {
            Some(ts) if !ts.is_empty() => ts.to_string(),
            _ => local_timestamp(),
        };
        writeln!(self.file, "[{ts}] [{level}] [{}] {message}", self.label)?;
        self.file.flush()
    }

    fn entry(&self) -> StreamEntry {
        StreamEntry {
            label: format!("SYNAPSE {}", self.label),
            path: self.path.to_string_lossy().into_owned(),
            priority: STREAM_PRIORITY,
            last_update: iso_timestamp(),
        }
    }
}

/// Log files for one host launch.
#[derive(Debug)]
pub struct SessionLogs {
    logs_root: PathBuf,
    refresh: Duration,
    host: Option<LogStream>,
    extension: Option<LogStream>,
}

impl SessionLogs {
    pub fn new(logs_root: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            logs_root: logs_root.into(),
            refresh,
            host: None,
            extension: None,
        }
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.logs_root.join(TELEMETRY_FILE)
    }

    pub fn is_open(&self) -> bool {
        self.host.is_some()
    }

    pub fn host_path(&self) -> Option<&Path> {
        self.host.as_ref().map(|s| s.path.as_path())
    }

    pub fn extension_path(&self) -> Option<&Path> {
        self.extension.as_ref().map(|s| s.path.as_path())
    }

    /// Opens both streams once per launch; later calls are no-ops.
    pub fn open(&mut self, profile_id: &str, launch_id: &str) -> io::Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let profile = path_component(profile_id);
        let dir = self.logs_root.join("profiles").join(&profile).join("host");
        fs::create_dir_all(&dir)?;

        let now = Local::now();
        let short: String = profile.chars().take(8).collect();
        let suffix = format!("{:03}_{short}_{}", now.day(), now.format("%H%M%S"));

        let host = LogStream::open(
            HOST_STREAM,
            "HOST",
            dir.join(format!("{HOST_STREAM}_{suffix}.log")),
            launch_id,
        )?;
        let extension = LogStream::open(
            EXTENSION_STREAM,
            "EXTENSION",
            dir.join(format!("{EXTENSION_STREAM}_{suffix}.log")),
            launch_id,
        )?;

        let telemetry = self.telemetry_path();
        for stream in [&host, &extension] {
            if let Err(err) = upsert_stream(&telemetry, stream.name, &stream.entry()) {
                tracing::warn!(stream = stream.name, error = %err, "telemetry update failed");
            }
        }
        tracing::info!(
            host_log = %host.path.display(),
            extension_log = %extension.path.display(),
            "session log streams opened"
        );
        self.host = Some(host);
        self.extension = Some(extension);
        Ok(())
    }

    pub fn log_host(&mut self, level: &str, message: &str) {
        let telemetry = self.telemetry_path();
        let refresh = self.refresh;
        if let Some(stream) = self.host.as_mut() {
            write_and_refresh(stream, &telemetry, refresh, level, message, None);
        }
    }

    pub fn log_extension(&mut self, level: &str, message: &str, timestamp: Option<&str>) {
        let telemetry = self.telemetry_path();
        let refresh = self.refresh;
        if let Some(stream) = self.extension.as_mut() {
            write_and_refresh(stream, &telemetry, refresh, level, message, timestamp);
        }
    }
}

fn write_and_refresh(
    stream: &mut LogStream,
    telemetry: &Path,
    refresh: Duration,
    level: &str,
    message: &str,
    timestamp: Option<&str>,
) {
    if let Err(err) = stream.write_line(level, message, timestamp) {
        tracing::warn!(stream = stream.name, error = %err, "log stream write failed");
        return;
    }
    if stream.last_telemetry.elapsed() >= refresh {
        match upsert_stream(telemetry, stream.name, &stream.entry()) {
            Ok(()) => stream.last_telemetry = Instant::now(),
            Err(err) => tracing::warn!(stream = stream.name, error = %err, "telemetry refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_preserves_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TELEMETRY_FILE);
        fs::write(
            &path,
            r#"{"active_streams": {"brain_core": {"label": "BRAIN", "path": "/x", "priority": 1}}, "version": 3}"#,
        )
        .unwrap();

        let entry = StreamEntry {
            label: "SYNAPSE HOST".to_string(),
            path: "/logs/a.log".to_string(),
            priority: 2,
            last_update: "2026-01-01T00:00:00.000000".to_string(),
        };
        upsert_stream(&path, HOST_STREAM, &entry).unwrap();

        let state = read_telemetry(&path).unwrap();
        assert_eq!(state["version"], 3);
        assert_eq!(state["active_streams"]["brain_core"]["label"], "BRAIN");
        assert_eq!(state["active_streams"][HOST_STREAM]["path"], "/logs/a.log");
        assert_eq!(state["active_streams"][HOST_STREAM]["priority"], 2);
    }

    #[test]
    fn upsert_creates_missing_file_and_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(TELEMETRY_FILE);
        let entry = StreamEntry {
            label: "SYNAPSE EXTENSION".to_string(),
            path: "/logs/b.log".to_string(),
            priority: 2,
            last_update: iso_timestamp(),
        };
        upsert_stream(&path, EXTENSION_STREAM, &entry).unwrap();
        assert!(read_telemetry(&path).unwrap()["active_streams"][EXTENSION_STREAM].is_object());

        fs::write(&path, "not json").unwrap();
        upsert_stream(&path, EXTENSION_STREAM, &entry).unwrap();
        assert!(read_telemetry(&path).unwrap()["active_streams"][EXTENSION_STREAM].is_object());
    }

    #[test]
    fn session_logs_write_banner_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut logs = SessionLogs::new(dir.path(), Duration::from_secs(30));
        logs.open("ecdeed9b-1111-2222-3333-444455556666", "launch-7").unwrap();

        let host_path = logs.host_path().unwrap().to_path_buf();
        let name = host_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("synapse_host_"));
        assert!(name.contains("_ecdeed9b_"));
        assert!(host_path
            .parent()
            .unwrap()
            .ends_with(Path::new("profiles/ecdeed9b-1111-2222-3333-444455556666/host")));

        logs.log_host("INFO", "handshake confirmed");
        logs.log_extension("WARN", "tab crashed", Some("2026-01-01 10:00:00.000"));

        let host = fs::read_to_string(&host_path).unwrap();
        assert!(host.contains("HOST SESSION"));
        assert!(host.contains("LAUNCH:launch-7"));
        assert!(host.contains("[INFO] [HOST] handshake confirmed"));

        let ext = fs::read_to_string(logs.extension_path().unwrap()).unwrap();
        assert!(ext.contains("EXTENSION SESSION"));
        assert!(ext.contains("[2026-01-01 10:00:00.000] [WARN] [EXTENSION] tab crashed"));

        let state = read_telemetry(&logs.telemetry_path()).unwrap();
        assert_eq!(
            state["active_streams"][HOST_STREAM]["path"],
            host_path.to_string_lossy().into_owned()
        );
        assert_eq!(state["active_streams"][EXTENSION_STREAM]["label"], "SYNAPSE EXTENSION");
    }

    #[test]
    fn hostile_profile_ids_stay_inside_the_logs_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut logs = SessionLogs::new(dir.path(), Duration::from_secs(30));
        logs.open("../../etc", "l").unwrap();
        assert!(logs.host_path().unwrap().starts_with(dir.path().join("profiles").join("etc")));
    }

    #[test]
    fn logging_before_open_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut logs = SessionLogs::new(dir.path(), Duration::from_secs(30));
        logs.log_host("INFO", "nothing yet");
        assert!(!logs.is_open());
        assert!(!logs.telemetry_path().exists());
    }
}
