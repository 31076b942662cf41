//! Mirror file persistence.
//!
//! The file exists in two legacy shapes: a bare JSON array of records, or an envelope
//! object `{ "data": [...], "totalRegistros": n, "geradoEm": "..." }`. The shape found
//! on disk is the shape written back.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{Local, NaiveDateTime};
use pncp_core::ProcurementItemRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATA_KEY: &str = "data";
const COUNT_KEY: &str = "totalRegistros";
const GENERATED_AT_KEY: &str = "geradoEm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreShape {
    Bare,
    Enveloped,
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Bare,
    /// Every top-level key in file order; the `data` slot is rewritten on save.
    Enveloped(Map<String, JsonValue>),
}

/// A record as read from disk, with the typed view it decoded to at load time.
#[derive(Debug, Clone, PartialEq)]
struct LoadedRecord {
    raw: JsonValue,
    decoded: ProcurementItemRecord,
}

/// The mirror file contents.
///
/// Records are edited through the typed view. On save, a record still equal to what
/// was decoded at its position is written back from the JSON it was read from, so
/// untouched legacy records (nulls, numeric strings, missing keys) survive unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedStore {
    layout: Layout,
    records: Vec<ProcurementItemRecord>,
    loaded: Vec<LoadedRecord>,
}

impl Default for PersistedStore {
    fn default() -> Self {
        Self::bare(Vec::new())
    }
}

impl PersistedStore {
    pub fn bare(records: Vec<ProcurementItemRecord>) -> Self {
        Self {
            layout: Layout::Bare,
            records,
            loaded: Vec::new(),
        }
    }

    pub fn enveloped(records: Vec<ProcurementItemRecord>, envelope: Map<String, JsonValue>) -> Self {
        Self {
            layout: Layout::Enveloped(envelope),
            records,
            loaded: Vec::new(),
        }
    }

    pub fn shape(&self) -> StoreShape {
        match self.layout {
            Layout::Bare => StoreShape::Bare,
            Layout::Enveloped(_) => StoreShape::Enveloped,
        }
    }

    pub fn records(&self) -> &[ProcurementItemRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Vec<ProcurementItemRecord> {
        &mut self.records
    }

    /// Decodes a mirror document, picking the shape from the JSON root type.
    ///
    /// An envelope whose `data` cannot be decoded stays an envelope with no records.
    pub fn from_json(root: JsonValue) -> anyhow::Result<Self> {
        match root {
            JsonValue::Array(items) => {
                let loaded = decode_records(items).context("decoding record list")?;
                Ok(Self::from_loaded(Layout::Bare, loaded))
            }
            JsonValue::Object(mut envelope) => {
                let data = envelope
                    .get_mut(DATA_KEY)
                    .map(JsonValue::take)
                    .unwrap_or(JsonValue::Null);
                let loaded = match data {
                    JsonValue::Null => Vec::new(),
                    JsonValue::Array(items) => decode_records(items).unwrap_or_else(|err| {
                        warn!(error = %format!("{err:#}"), "envelope data undecodable; keeping envelope");
                        Vec::new()
                    }),
                    other => {
                        warn!(kind = json_kind(&other), "envelope data is not a list; keeping envelope");
                        Vec::new()
                    }
                };
                Ok(Self::from_loaded(Layout::Enveloped(envelope), loaded))
            }
            other => bail!("unsupported mirror root: {}", json_kind(&other)),
        }
    }

    fn from_loaded(layout: Layout, loaded: Vec<LoadedRecord>) -> Self {
        Self {
            layout,
            records: loaded.iter().map(|l| l.decoded.clone()).collect(),
            loaded,
        }
    }

    fn encode_records(&self) -> anyhow::Result<JsonValue> {
        let mut out = Vec::with_capacity(self.records.len());
        for (index, record) in self.records.iter().enumerate() {
            match self.loaded.get(index) {
                Some(loaded) if loaded.decoded == *record => out.push(loaded.raw.clone()),
                _ => out.push(serde_json::to_value(record).context("encoding record")?),
            }
        }
        Ok(JsonValue::Array(out))
    }

    /// Encodes the store in its original shape, refreshing envelope metadata.
    pub fn to_json(&self, generated_at: NaiveDateTime) -> anyhow::Result<JsonValue> {
        let data = self.encode_records()?;
        match &self.layout {
            Layout::Bare => Ok(data),
            Layout::Enveloped(envelope) => {
                let mut envelope = envelope.clone();
                envelope.insert(DATA_KEY.to_string(), data);
                envelope.insert(COUNT_KEY.to_string(), JsonValue::from(self.records.len()));
                envelope.insert(
                    GENERATED_AT_KEY.to_string(),
                    JsonValue::String(generated_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
                );
                Ok(JsonValue::Object(envelope))
            }
        }
    }

    /// Loads the mirror file. Never fails: a missing or unreadable file yields an empty store.
    pub async fn load(path: &Path) -> PersistedStore {
        match Self::try_load(path).await {
            Ok(Some(store)) => {
                info!(
                    path = %path.display(),
                    records = store.records().len(),
                    shape = ?store.shape(),
                    "loaded mirror"
                );
                store
            }
            Ok(None) => {
                info!(path = %path.display(), "no mirror file yet; starting empty");
                PersistedStore::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "mirror unreadable; starting empty");
                PersistedStore::default()
            }
        }
    }

    async fn try_load(path: &Path) -> anyhow::Result<Option<PersistedStore>> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let root: JsonValue =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_json(root).map(Some)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.save_at(path, Local::now().naive_local()).await
    }

    pub async fn save_at(&self, path: &Path, generated_at: NaiveDateTime) -> anyhow::Result<()> {
        let value = self.to_json(generated_at)?;
        let bytes = encode_pretty(&value)?;
        write_atomic(path, &bytes).await?;
        info!(path = %path.display(), records = self.records().len(), "saved mirror");
        Ok(())
    }
}

fn decode_records(items: Vec<JsonValue>) -> anyhow::Result<Vec<LoadedRecord>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let decoded = ProcurementItemRecord::deserialize(&raw)
                .with_context(|| format!("record {index}"))?;
            Ok(LoadedRecord { raw, decoded })
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Four-space indentation, non-ASCII written as-is.
fn encode_pretty(value: &JsonValue) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser).context("serializing mirror")?;
    Ok(out)
}

/// Writes through a temp file in the target directory and renames it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Rotating start position for capped refresh passes, kept next to the mirror file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCursor {
    pub offset: usize,
}

impl RefreshCursor {
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "dados.json".into());
        name.push(".cursor.json");
        store_path.with_file_name(name)
    }

    pub async fn load(store_path: &Path) -> RefreshCursor {
        let path = Self::path_for(store_path);
        let cursor = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "refresh cursor unreadable; restarting at 0");
                RefreshCursor::default()
            }),
            Err(_) => RefreshCursor::default(),
        };
        debug!(path = %path.display(), offset = cursor.offset, "refresh cursor");
        cursor
    }

    pub async fn save(&self, store_path: &Path) -> anyhow::Result<()> {
        let path = Self::path_for(store_path);
        let bytes = serde_json::to_vec(self).context("serializing refresh cursor")?;
        write_atomic(&path, &bytes).await
    }
}
