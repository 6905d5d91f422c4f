use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tone_bus::{PipelineSession, SessionStats};

struct SessionEntry {
    video_id: String,
    bitrate_kbps: u32,
    started_at: DateTime<Utc>,
    stats: Arc<SessionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub video_id: String,
    pub bitrate_kbps: u32,
    pub started_at: DateTime<Utc>,
    pub output_bytes: u64,
    pub pids: Vec<u32>,
}

/// Registry of the pipelines currently streaming to a client.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    started_total: AtomicU64,
}

impl SessionManager {
    pub fn register(&self, session: &PipelineSession) {
        let entry = SessionEntry {
            video_id: session.request().video_id.to_string(),
            bitrate_kbps: session.request().bitrate.kbps(),
            started_at: Utc::now(),
            stats: session.stats(),
        };
        self.started_total.fetch_add(1, Ordering::Relaxed);
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(session.id().to_string(), entry);
            }
            Err(e) => log::error!("session registry poisoned: {}", e),
        }
    }

    /// Called from `Drop`, so it must not block on anything but the lock.
    pub fn deregister(&self, id: &str) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.remove(id);
            }
            Err(e) => log::error!("session registry poisoned: {}", e),
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let Ok(sessions) = self.sessions.read() else {
            return Vec::new();
        };
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                video_id: entry.video_id.clone(),
                bitrate_kbps: entry.bitrate_kbps,
                started_at: entry.started_at,
                output_bytes: entry.stats.output_bytes(),
                pids: entry.stats.process_ids(),
            })
            .collect();
        list.sort_by_key(|info| info.started_at);
        list
    }

    pub fn active(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or_default()
    }

    /// Pipelines ever started, including finished ones.
    pub fn started_total(&self) -> u64 {
        self.started_total.load(Ordering::Relaxed)
    }
}
