/// Persistent topic snapshots.
///
/// Topics whose `persistent` property is set are written to a plain text
/// file that is still a valid JSON array but keeps one topic per line, so
/// diffs stay readable and a damaged line only costs that one topic:
///
/// ```text
/// [
/// {"name":"/config/gain","type":"double","value":0.5,"properties":{"persistent":true}},
/// {"name":"/config/mode","type":"string","value":"auto","properties":{"persistent":true}}
/// ]
/// ```
///
/// Records are sorted by name. Saves go to a temporary file next to the
/// target which is then renamed over it, so a crash mid-save leaves the
/// previous snapshot intact.
use crate::error::{TableError, TableResult};
use crate::instance::InstanceCore;
use crate::network::stopped;
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// One saved topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedTopic {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    /// Current value, `null` if the topic never had one.
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default)]
    pub properties: JsonMap<String, JsonValue>,
}

/// A line of the snapshot that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    /// 1-based line number in the file.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Outcome of restoring a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Topics restored.
    pub loaded: usize,
    /// Lines skipped, in file order.
    pub errors: Vec<LoadError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Render records in the line-per-topic array format.
pub fn render(records: &[PersistedTopic]) -> TableResult<String> {
    let mut out = String::from("[\n");
    for (index, record) in records.iter().enumerate() {
        out.push_str(&serde_json::to_string(record)?);
        if index + 1 < records.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str("]\n");
    Ok(out)
}

/// Parse a snapshot line by line.
///
/// Bracket lines and blank lines are skipped; every other line must hold one
/// record, optionally followed by a comma. Returns the records with their
/// line numbers plus the lines that failed to parse.
pub fn parse(text: &str) -> (Vec<(usize, PersistedTopic)>, Vec<LoadError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let line = line.strip_suffix(',').unwrap_or(line).trim_end();
        if line.is_empty() || line == "[" || line == "]" || line == "[]" {
            continue;
        }
        match serde_json::from_str::<PersistedTopic>(line) {
            Ok(record) => records.push((index + 1, record)),
            Err(e) => errors.push(LoadError {
                line: index + 1,
                message: e.to_string(),
            }),
        }
    }

    (records, errors)
}

/// Snapshot of every persistent topic, sorted by name.
pub(crate) fn collect(core: &InstanceCore) -> Vec<PersistedTopic> {
    core.directory
        .announced_topics()
        .into_iter()
        .filter(|info| info.is_persistent())
        .map(|info| {
            let value = core.storage.get_value(info.handle);
            PersistedTopic {
                value: if value.is_empty() {
                    JsonValue::Null
                } else {
                    value.to_json()
                },
                name: info.name,
                kind: info.kind,
                properties: info.properties,
            }
        })
        .collect()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` and flush them to disk before the rename makes them live.
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Save every persistent topic to `path`. Returns the number saved.
pub(crate) async fn save(core: &InstanceCore, path: &Path) -> TableResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| {
            TableError::Persistence(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let records = collect(core);
    let text = render(&records)?;

    let temp = temp_path(path);
    write_synced(&temp, text.as_bytes()).await.map_err(|e| {
        TableError::Persistence(format!("failed to write {}: {}", temp.display(), e))
    })?;
    fs::rename(&temp, path).await.map_err(|e| {
        TableError::Persistence(format!("failed to rename onto {}: {}", path.display(), e))
    })?;

    tracing::debug!(path = %path.display(), topics = records.len(), "saved persistent topics");
    Ok(records.len())
}

/// Restore every topic in the snapshot at `path`.
///
/// Only an unreadable file is an error; bad lines land in the report.
pub(crate) async fn load(core: &InstanceCore, path: &Path) -> TableResult<LoadReport> {
    let text = fs::read_to_string(path).await.map_err(|e| {
        TableError::Persistence(format!("failed to read {}: {}", path.display(), e))
    })?;

    let (records, mut errors) = parse(&text);
    let mut report = LoadReport::default();
    for (line, record) in records {
        match core.restore_persistent(&record) {
            Ok(()) => report.loaded += 1,
            Err(e) => errors.push(LoadError {
                line,
                message: format!("{}: {}", record.name, e),
            }),
        }
    }
    errors.sort_by_key(|e| e.line);
    report.errors = errors;

    for error in &report.errors {
        tracing::warn!(path = %path.display(), "skipped persistent entry: {}", error);
    }
    tracing::info!(path = %path.display(), loaded = report.loaded, skipped = report.errors.len(), "loaded persistent topics");
    Ok(report)
}

/// Background task saving the snapshot whenever persistent state changed.
#[derive(Debug)]
pub(crate) struct Autosave {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Autosave {
    pub(crate) fn spawn(core: Arc<InstanceCore>, path: PathBuf, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => save_if_dirty(&core, &path).await,
                    _ = stopped(&mut stop) => break,
                }
            }
            save_if_dirty(&core, &path).await;
        });
        tracing::debug!(period = ?period, "autosave started");
        Self { shutdown, task }
    }

    pub(crate) fn signal_stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop and run a final save if anything is outstanding.
    pub(crate) async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "autosave task failed");
        }
    }
}

async fn save_if_dirty(core: &InstanceCore, path: &Path) {
    if !core.take_persistent_dirty() {
        return;
    }
    if let Err(e) = save(core, path).await {
        tracing::warn!(path = %path.display(), error = %e, "autosave failed");
        core.mark_persistent_dirty();
    }
}
