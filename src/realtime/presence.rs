use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::db::{now_millis, DatabasePool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

struct PresenceRecord {
    status: PresenceStatus,
    last_activity: Instant,
    last_activity_ms: i64,
    /// Last status partners were told about.
    announced: PresenceStatus,
    persisted_at: Option<Instant>,
}

impl PresenceRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_activity: now,
            last_activity_ms: now_millis(),
            announced: PresenceStatus::Offline,
            persisted_at: None,
        }
    }

    fn bump(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_activity_ms = now_millis();
    }
}

/// One presence record per user.
///
/// Every transition method returns `true` when the status actually changed;
/// the caller is responsible for announcing it. The hub drives
/// [`PresenceTracker::online`] and [`PresenceTracker::offline`] while holding
/// its registry lock, which is what orders transitions for a single user.
pub struct PresenceTracker {
    records: Mutex<HashMap<String, PresenceRecord>>,
    ttl: Duration,
    /// Minimum gap between last-activity writes for a user whose status is
    /// not changing.
    persist_every: Duration,
    db: DatabasePool,
}

impl PresenceTracker {
    pub fn new(db: DatabasePool, ttl: Duration) -> Self {
        Self {
            records: Mutex::default(),
            ttl,
            persist_every: ttl / 4,
            db,
        }
    }

    pub fn online(&self, user_id: &str, now: Instant) -> bool {
        let mut records = self.records.lock();
        let record = records
            .entry(user_id.to_owned())
            .or_insert_with(|| PresenceRecord::fresh(now));

        record.bump(now);
        std::mem::replace(&mut record.status, PresenceStatus::Online) != PresenceStatus::Online
    }

    pub fn offline(&self, user_id: &str) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(user_id) else {
            return false;
        };

        std::mem::replace(&mut record.status, PresenceStatus::Offline) != PresenceStatus::Offline
    }

    /// Records traffic. Promotes a user the sweeper demoted back to online.
    pub fn touch(&self, user_id: &str, now: Instant) -> bool {
        self.online(user_id, now)
    }

    /// Keepalive traffic. Refreshes last activity but never changes status,
    /// so a user who declared themselves offline stays offline.
    pub fn heartbeat(&self, user_id: &str, now: Instant) {
        if let Some(record) = self.records.lock().get_mut(user_id) {
            record.bump(now);
        }
    }

    pub fn status(&self, user_id: &str, now: Instant) -> PresenceStatus {
        match self.records.lock().get(user_id) {
            Some(record)
                if record.status == PresenceStatus::Online
                    && now.saturating_duration_since(record.last_activity) <= self.ttl =>
            {
                PresenceStatus::Online
            }
            _ => PresenceStatus::Offline,
        }
    }

    /// Demotes everyone silent for longer than the ttl and returns who changed.
    /// Offline records that were already announced and went stale are dropped.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let mut demoted = Vec::new();

        self.records.lock().retain(|user_id, record| {
            let stale = now.saturating_duration_since(record.last_activity) > self.ttl;
            if !stale {
                return true;
            }

            match record.status {
                PresenceStatus::Online => {
                    record.status = PresenceStatus::Offline;
                    demoted.push(user_id.clone());
                    true
                }
                PresenceStatus::Offline => record.announced != PresenceStatus::Offline,
            }
        });

        demoted
    }

    /// The status partners have not heard about yet, if any.
    pub(crate) fn pending(&self, user_id: &str) -> Option<(PresenceStatus, i64)> {
        self.records
            .lock()
            .get(user_id)
            .filter(|record| record.status != record.announced)
            .map(|record| (record.status, record.last_activity_ms))
    }

    pub(crate) fn mark_announced(&self, user_id: &str, status: PresenceStatus) {
        if let Some(record) = self.records.lock().get_mut(user_id) {
            record.announced = status;
            record.persisted_at = Some(Instant::now());
        }
    }

    /// Claims the next last-activity write for `user_id` if the previous one
    /// is older than `persist_every`.
    pub(crate) fn claim_refresh(&self, user_id: &str, now: Instant) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(user_id) else {
            return false;
        };

        let due = record
            .persisted_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.persist_every);
        if due {
            record.persisted_at = Some(now);
        }
        due
    }

    pub(crate) fn snapshot(&self, user_id: &str) -> Option<(PresenceStatus, i64)> {
        self.records
            .lock()
            .get(user_id)
            .map(|record| (record.status, record.last_activity_ms))
    }

    pub(crate) async fn persist(&self, user_id: &str, status: PresenceStatus, last_activity_ms: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO presence (user_id,status,last_activity) VALUES (?,?,?) \
             ON CONFLICT(user_id) DO UPDATE SET status=excluded.status, last_activity=excluded.last_activity",
        )
        .bind(user_id)
        .bind(status.as_str())
        .bind(last_activity_ms)
        .execute(&self.db.writer)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn transitions_report_changes_once() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        assert_eq!(presence.status("alice", now), PresenceStatus::Offline);
        assert!(presence.online("alice", now));
        assert!(!presence.online("alice", now));
        assert_eq!(presence.status("alice", now), PresenceStatus::Online);

        assert!(presence.offline("alice"));
        assert!(!presence.offline("alice"));
        assert!(!presence.offline("nobody"));
        assert_eq!(presence.status("alice", now), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn silence_past_the_ttl_reads_as_offline() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        presence.online("alice", now);
        assert_eq!(presence.status("alice", now + TTL), PresenceStatus::Online);
        assert_eq!(presence.status("alice", now + TTL + Duration::from_secs(1)), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn sweep_demotes_stale_users_and_traffic_revives_them() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        presence.online("alice", now);
        presence.online("bob", now + Duration::from_secs(200));

        let later = now + TTL + Duration::from_secs(1);
        assert_eq!(presence.sweep(later), ["alice"]);
        assert!(presence.sweep(later).is_empty());
        assert_eq!(presence.status("bob", later), PresenceStatus::Online);

        assert!(presence.touch("alice", later));
        assert_eq!(presence.status("alice", later), PresenceStatus::Online);
    }

    #[tokio::test]
    async fn heartbeat_keeps_online_users_fresh_without_promoting() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        presence.online("alice", now);
        presence.heartbeat("alice", now + Duration::from_secs(200));
        assert!(presence.sweep(now + TTL + Duration::from_secs(1)).is_empty());

        presence.offline("alice");
        presence.heartbeat("alice", now + Duration::from_secs(250));
        assert_eq!(presence.status("alice", now + Duration::from_secs(250)), PresenceStatus::Offline);

        // unknown users get no record from a heartbeat
        presence.heartbeat("ghost", now);
        assert_eq!(presence.snapshot("ghost"), None);
    }

    #[tokio::test]
    async fn refreshes_are_throttled() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        assert!(!presence.claim_refresh("alice", now));
        presence.online("alice", now);
        assert!(presence.claim_refresh("alice", now));
        assert!(!presence.claim_refresh("alice", now + TTL / 8));
        assert!(presence.claim_refresh("alice", now + TTL / 4));
    }

    #[tokio::test]
    async fn pending_tracks_unannounced_status() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db, TTL);
        let now = Instant::now();

        assert_eq!(presence.pending("alice"), None);
        presence.online("alice", now);
        assert_eq!(presence.pending("alice").map(|(s, _)| s), Some(PresenceStatus::Online));

        presence.mark_announced("alice", PresenceStatus::Online);
        assert_eq!(presence.pending("alice"), None);

        // a flap that returns to the announced status needs no announcement
        presence.offline("alice");
        presence.online("alice", now);
        assert_eq!(presence.pending("alice"), None);
    }

    #[tokio::test]
    async fn persist_keeps_one_row_per_user() {
        let (_dir, db) = test_pool().await;
        let presence = PresenceTracker::new(db.clone(), TTL);

        presence.persist("alice", PresenceStatus::Online, 1).await.unwrap();
        presence.persist("alice", PresenceStatus::Offline, 2).await.unwrap();

        let rows: Vec<(String, String, i64)> = sqlx::query_as("SELECT user_id,status,last_activity FROM presence")
            .fetch_all(&db.reader)
            .await
            .unwrap();
        assert_eq!(rows, [("alice".to_owned(), "offline".to_owned(), 2)]);
    }
}
