//! Durable subscriber store backed by a JSON file.
//!
//! File shape (`subscribers.json`):
//! `{ "<id>": { "subscribed_at": "...", "active": true, "username": ..., ... } }`

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;

use crate::{domain::SubscriberId, Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    #[serde(deserialize_with = "de_timestamp")]
    pub subscribed_at: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_timestamp"
    )]
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

/// RFC 3339, or a naive ISO timestamp (older files) taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

fn de_timestamp<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    parse_timestamp(&s).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}")))
}

fn de_opt_timestamp<'de, D>(d: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(d)? {
        None => Ok(None),
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}"))),
    }
}

/// Optional profile data captured at subscribe time.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeChange {
    Created,
    Reactivated,
    AlreadyActive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsubscribeChange {
    Deactivated,
    AlreadyInactive,
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriberCounts {
    pub active: usize,
    pub total: usize,
}

pub struct SubscriberStore {
    path: PathBuf,
    records: Mutex<BTreeMap<SubscriberId, SubscriberRecord>>,
}

impl SubscriberStore {
    /// Load the store. A missing file is an empty store; an unreadable or corrupt
    /// file is an error so subscribers are never silently discarded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_file(&path)?;
        let active = records.values().filter(|r| r.active).count();
        tracing::info!(
            path = %path.display(),
            total = records.len(),
            active,
            "subscriber store loaded"
        );
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Create or reactivate. On `Err(Error::Persistence)` the change is still
    /// applied in memory for this session.
    pub async fn subscribe(&self, id: &SubscriberId, profile: Profile) -> Result<SubscribeChange> {
        let mut records = self.records.lock().await;
        let change = match records.get_mut(id) {
            Some(rec) if rec.active => {
                return Ok(SubscribeChange::AlreadyActive);
            }
            Some(rec) => {
                rec.active = true;
                rec.subscribed_at = Utc::now();
                rec.unsubscribed_at = None;
                if profile.username.is_some() {
                    rec.username = profile.username;
                }
                if profile.first_name.is_some() {
                    rec.first_name = profile.first_name;
                }
                SubscribeChange::Reactivated
            }
            None => {
                records.insert(
                    id.clone(),
                    SubscriberRecord {
                        subscribed_at: Utc::now(),
                        active: true,
                        username: profile.username,
                        first_name: profile.first_name,
                        unsubscribed_at: None,
                    },
                );
                SubscribeChange::Created
            }
        };

        tracing::info!(subscriber = %id, ?change, "subscribed");
        self.persist(&records)?;
        Ok(change)
    }

    /// Mark inactive, keeping the record. Same persistence semantics as `subscribe`.
    pub async fn unsubscribe(&self, id: &SubscriberId) -> Result<UnsubscribeChange> {
        let mut records = self.records.lock().await;
        let Some(rec) = records.get_mut(id) else {
            return Ok(UnsubscribeChange::Unknown);
        };
        if !rec.active {
            return Ok(UnsubscribeChange::AlreadyInactive);
        }
        rec.active = false;
        rec.unsubscribed_at = Some(Utc::now());

        tracing::info!(subscriber = %id, "unsubscribed");
        self.persist(&records)?;
        Ok(UnsubscribeChange::Deactivated)
    }

    pub async fn list_active(&self) -> BTreeSet<SubscriberId> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn count(&self) -> SubscriberCounts {
        let records = self.records.lock().await;
        SubscriberCounts {
            active: records.values().filter(|r| r.active).count(),
            total: records.len(),
        }
    }

    pub async fn get(&self, id: &SubscriberId) -> Option<SubscriberRecord> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<(SubscriberId, SubscriberRecord)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    /// Write the full map before the mutating call returns (temp file, fsync, rename).
    fn persist(&self, records: &BTreeMap<SubscriberId, SubscriberRecord>) -> Result<()> {
        write_file(&self.path, records).map_err(|e| {
            let err = Error::Persistence {
                path: self.path.clone(),
                reason: e.to_string(),
            };
            tracing::error!(error = %err, "subscriber change kept in memory only");
            err
        })
    }
}

fn load_file(path: &Path) -> Result<BTreeMap<SubscriberId, SubscriberRecord>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let txt = fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let records = serde_json::from_str(&txt)?;
    Ok(records)
}

fn write_file(path: &Path, records: &BTreeMap<SubscriberId, SubscriberRecord>) -> Result<()> {
    let txt = serde_json::to_string_pretty(records)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "subscribers.json".to_string());
    let tmp = dir.join(format!(".{file_name}.tmp"));

    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(txt.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
