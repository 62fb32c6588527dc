//! Status channel events and per-run progress state.
//!
//! Two collaborators share the distributed store:
//!
//! - [`StatusMessenger`] publishes lifecycle events (`STARTED`,
//!   `COMPLETED`, `EXCEPTION`, `TRIGGER`, `INFO`) as JSON payloads on the
//!   pub/sub channel `<runid>:<kind>`.
//! - [`RedisPrep`] records task success timestamps and arbitrary progress
//!   fields in the per-run hash `prep:<runid>`; preflight readiness is
//!   computed from these timestamps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kv::KvStore;

/// Event taxonomy on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Started,
    Completed,
    Exception,
    Trigger,
    Info,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Started => "STARTED",
            EventKind::Completed => "COMPLETED",
            EventKind::Exception => "EXCEPTION",
            EventKind::Trigger => "TRIGGER",
            EventKind::Info => "INFO",
        };
        write!(f, "{}", s)
    }
}

/// A status event as it travels over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event: EventKind,
    pub runid: String,
    /// Controller kind or function name that emitted the event.
    pub source: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Publisher for run lifecycle events.
#[derive(Clone)]
pub struct StatusMessenger {
    kv: Arc<dyn KvStore>,
}

impl StatusMessenger {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Publishes an event on channel `<runid>:<kind>`.
    pub fn publish(&self, runid: &str, kind: &str, event: EventKind, detail: &str) {
        let payload = StatusEvent {
            event,
            runid: runid.to_string(),
            source: kind.to_string(),
            detail: detail.to_string(),
            timestamp: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&payload) {
            self.kv.publish(&format!("{}:{}", runid, kind), &json);
        }
    }

    /// Publishes an `EXCEPTION` event carrying the failing function name.
    pub fn exception(&self, runid: &str, kind: &str, function: &str, message: &str) {
        self.publish(
            runid,
            kind,
            EventKind::Exception,
            &format!("{}: {}", function, message),
        );
    }
}

/// Tasks tracked by the prep-state hash.
///
/// Each variant maps to one hash field; preflight prerequisites are
/// expressed over these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskEnum {
    ProjectInit,
    FetchDem,
    BuildChannels,
    SetOutlet,
    AbstractWatershed,
    BuildLanduse,
    BuildSoils,
    BuildClimate,
    RunWepp,
    RunObserved,
    RunWatar,
    SetSbsMap,
}

impl TaskEnum {
    /// Hash field name for this task.
    pub fn field(&self) -> &'static str {
        match self {
            TaskEnum::ProjectInit => "project_init",
            TaskEnum::FetchDem => "fetch_dem",
            TaskEnum::BuildChannels => "build_channels",
            TaskEnum::SetOutlet => "set_outlet",
            TaskEnum::AbstractWatershed => "abstract_watershed",
            TaskEnum::BuildLanduse => "build_landuse",
            TaskEnum::BuildSoils => "build_soils",
            TaskEnum::BuildClimate => "build_climate",
            TaskEnum::RunWepp => "run_wepp",
            TaskEnum::RunObserved => "run_observed",
            TaskEnum::RunWatar => "run_watar",
            TaskEnum::SetSbsMap => "set_sbs_map",
        }
    }
}

/// Per-run progress state stored in the hash `prep:<runid>`.
#[derive(Clone)]
pub struct RedisPrep {
    kv: Arc<dyn KvStore>,
}

impl RedisPrep {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn hash_key(runid: &str) -> String {
        format!("prep:{}", runid)
    }

    /// Records `task` as having just succeeded.
    pub fn timestamp(&self, runid: &str, task: TaskEnum) {
        self.kv.hset(
            &Self::hash_key(runid),
            task.field(),
            &Utc::now().to_rfc3339(),
        );
    }

    /// Last success time of `task`, if it ever succeeded.
    pub fn last_timestamp(&self, runid: &str, task: TaskEnum) -> Option<DateTime<Utc>> {
        self.kv
            .hget(&Self::hash_key(runid), task.field())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Forgets `task`, e.g. when its inputs were invalidated.
    pub fn remove_timestamp(&self, runid: &str, task: TaskEnum) {
        self.kv.hdel(&Self::hash_key(runid), task.field());
    }

    /// Full timestamp snapshot for preflight.
    pub fn timestamps(&self, runid: &str) -> BTreeMap<String, DateTime<Utc>> {
        self.kv
            .hgetall(&Self::hash_key(runid))
            .into_iter()
            .filter_map(|(field, value)| {
                DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|dt| (field, dt.with_timezone(&Utc)))
            })
            .collect()
    }

    /// Sets an arbitrary progress field (e.g. percent complete).
    pub fn set_progress(&self, runid: &str, field: &str, value: &str) {
        self.kv.hset(&Self::hash_key(runid), field, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn test_publish_event_payload() {
        let kv = Arc::new(MemoryKv::new());
        let mut rx = kv.subscribe("r1:wepp");
        let messenger = StatusMessenger::new(Arc::clone(&kv) as Arc<dyn KvStore>);
        messenger.publish("r1", "wepp", EventKind::Started, "run_hillslopes");

        let payload = rx.recv().await.unwrap();
        let event: StatusEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.event, EventKind::Started);
        assert_eq!(event.runid, "r1");
        assert_eq!(event.detail, "run_hillslopes");
    }

    #[tokio::test]
    async fn test_exception_carries_function_name() {
        let kv = Arc::new(MemoryKv::new());
        let mut rx = kv.subscribe("r1:climate");
        let messenger = StatusMessenger::new(Arc::clone(&kv) as Arc<dyn KvStore>);
        messenger.exception("r1", "climate", "build_climate", "cligen failed");

        let event: StatusEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event, EventKind::Exception);
        assert!(event.detail.starts_with("build_climate:"));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let kv = Arc::new(MemoryKv::new());
        let prep = RedisPrep::new(kv);
        assert!(prep.last_timestamp("r1", TaskEnum::BuildSoils).is_none());
        prep.timestamp("r1", TaskEnum::BuildSoils);
        let ts = prep.last_timestamp("r1", TaskEnum::BuildSoils).unwrap();
        assert!((Utc::now() - ts).num_seconds() < 5);
        prep.remove_timestamp("r1", TaskEnum::BuildSoils);
        assert!(prep.last_timestamp("r1", TaskEnum::BuildSoils).is_none());
    }

    #[test]
    fn test_timestamps_snapshot() {
        let kv = Arc::new(MemoryKv::new());
        let prep = RedisPrep::new(kv);
        prep.timestamp("r1", TaskEnum::BuildChannels);
        prep.timestamp("r1", TaskEnum::SetOutlet);
        let all = prep.timestamps("r1");
        assert!(all.contains_key("build_channels"));
        assert!(all.contains_key("set_outlet"));
    }
}
