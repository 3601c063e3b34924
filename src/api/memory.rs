//! In-process [`ServerApi`] implementation.
//!
//! Holds server state in memory, records every call, and can be told to fail
//! so push and pull error paths can be exercised without a network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{
    ApiError, BatchAck, ChangeCursor, ChangePage, ListeningEvent, ListeningSubmission, PositionUpdate,
    RemoteRecord, ServerApi, Tombstone,
};
use crate::cache::{EntityKind, LinkKind, SINGLETON_ID};
use crate::storage::now_millis;

/// A call received by [`MemoryServer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    UpdateMetadata {
        kind: EntityKind,
        id: String,
        fields: Map<String, Value>,
    },
    MergeContributors {
        source_id: String,
        target_id: String,
    },
    UnmergeContributor {
        contributor_id: String,
    },
    SetRelationships {
        link: LinkKind,
        owner_id: String,
        target_ids: Vec<String>,
    },
    SubmitListeningEvents {
        client_ids: Vec<String>,
    },
    UpdatePlaybackPosition {
        book_id: String,
        update: PositionUpdate,
    },
    UpdatePreferences(Map<String, Value>),
    UpdateProfile(Map<String, Value>),
    FetchChanges {
        kind: EntityKind,
        after: Option<ChangeCursor>,
    },
    FetchEntity {
        kind: EntityKind,
        id: String,
    },
    FetchActiveSessions,
}

enum Change {
    Upsert(RemoteRecord),
    Delete(Tombstone),
}

#[derive(Default)]
struct State {
    records: BTreeMap<(EntityKind, String), RemoteRecord>,
    tombstones: Vec<(EntityKind, Tombstone)>,
    links: HashMap<(LinkKind, String), Vec<String>>,
    listening: Vec<ListeningEvent>,
    calls: Vec<ApiCall>,
    clock: i64,
    offline: bool,
    queued_failures: VecDeque<ApiError>,
    failing_fetches: HashSet<EntityKind>,
    rejected_books: HashMap<String, String>,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn check_mutation(&mut self) -> Result<(), ApiError> {
        if self.offline {
            return Err(ApiError::Network("offline".into()));
        }
        self.queued_failures.pop_front().map_or(Ok(()), Err)
    }

    fn check_read(&self) -> Result<(), ApiError> {
        if self.offline {
            return Err(ApiError::Network("offline".into()));
        }
        Ok(())
    }

    fn merge_record(&mut self, kind: EntityKind, id: &str, fields: &Map<String, Value>) {
        let now = self.tick();
        let record = self
            .records
            .entry((kind, id.to_string()))
            .or_insert_with(|| RemoteRecord {
                id: id.to_string(),
                updated_at: now,
                data: Value::Object(Map::new()),
            });
        crate::cache::store::merge_object(&mut record.data, fields);
        record.updated_at = now;
    }
}

/// In-memory server.
#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<State>,
}

impl MemoryServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record with an explicit server timestamp.
    pub fn put_record(&self, kind: EntityKind, id: &str, data: Value, updated_at: i64) {
        let mut state = self.state.lock();
        state.clock = state.clock.max(updated_at);
        state.records.insert(
            (kind, id.to_string()),
            RemoteRecord {
                id: id.to_string(),
                updated_at,
                data,
            },
        );
    }

    /// Delete a record, leaving a tombstone for delta fetches.
    pub fn delete_record(&self, kind: EntityKind, id: &str, deleted_at: i64) {
        let mut state = self.state.lock();
        state.clock = state.clock.max(deleted_at);
        state.records.remove(&(kind, id.to_string()));
        state.tombstones.push((
            kind,
            Tombstone {
                id: id.to_string(),
                deleted_at,
            },
        ));
    }

    #[must_use]
    pub fn record(&self, kind: EntityKind, id: &str) -> Option<RemoteRecord> {
        self.state.lock().records.get(&(kind, id.to_string())).cloned()
    }

    #[must_use]
    pub fn links(&self, link: LinkKind, owner_id: &str) -> Vec<String> {
        self.state
            .lock()
            .links
            .get(&(link, owner_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn listening_events(&self) -> Vec<ListeningEvent> {
        self.state.lock().listening.clone()
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Calls other than fetches.
    #[must_use]
    pub fn mutation_calls(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|call| {
                !matches!(
                    call,
                    ApiCall::FetchChanges { .. }
                        | ApiCall::FetchEntity { .. }
                        | ApiCall::FetchActiveSessions
                )
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// While offline every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next mutation call with `err`. Failures queue up.
    pub fn fail_next(&self, err: ApiError) {
        self.state.lock().queued_failures.push_back(err);
    }

    /// Make delta fetches for `kind` fail with a server error.
    pub fn fail_fetches(&self, kind: EntityKind, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_fetches.insert(kind);
        } else {
            state.failing_fetches.remove(&kind);
        }
    }

    /// Reject listening events for `book_id` in batch submissions.
    pub fn reject_listening_for(&self, book_id: &str, reason: &str) {
        self.state
            .lock()
            .rejected_books
            .insert(book_id.to_string(), reason.to_string());
    }
}

#[async_trait]
impl ServerApi for MemoryServer {
    async fn update_metadata(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdateMetadata {
            kind,
            id: id.to_string(),
            fields: fields.clone(),
        });
        state.check_mutation()?;
        if !state.records.contains_key(&(kind, id.to_string())) {
            return Err(ApiError::NotFound(format!("{kind} {id}")));
        }
        state.merge_record(kind, id, fields);
        Ok(())
    }

    async fn merge_contributors(&self, source_id: &str, target_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::MergeContributors {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
        });
        state.check_mutation()?;
        if source_id == target_id {
            return Err(ApiError::Rejected("cannot merge a contributor into itself".into()));
        }
        let mut fields = Map::new();
        fields.insert("merged_into".into(), Value::String(target_id.to_string()));
        state.merge_record(EntityKind::Contributor, source_id, &fields);
        Ok(())
    }

    async fn unmerge_contributor(&self, contributor_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UnmergeContributor {
            contributor_id: contributor_id.to_string(),
        });
        state.check_mutation()?;
        let mut fields = Map::new();
        fields.insert("merged_into".into(), Value::Null);
        state.merge_record(EntityKind::Contributor, contributor_id, &fields);
        Ok(())
    }

    async fn set_relationships(
        &self,
        link: LinkKind,
        owner_id: &str,
        target_ids: &[String],
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::SetRelationships {
            link,
            owner_id: owner_id.to_string(),
            target_ids: target_ids.to_vec(),
        });
        state.check_mutation()?;
        state
            .links
            .insert((link, owner_id.to_string()), target_ids.to_vec());
        Ok(())
    }

    async fn submit_listening_events(
        &self,
        events: &[ListeningSubmission],
    ) -> Result<BatchAck, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::SubmitListeningEvents {
            client_ids: events.iter().map(|e| e.client_id.clone()).collect(),
        });
        state.check_mutation()?;

        let mut ack = BatchAck::default();
        for submission in events {
            if let Some(reason) = state.rejected_books.get(&submission.event.book_id) {
                ack.rejected
                    .insert(submission.client_id.clone(), reason.clone());
            } else {
                state.listening.push(submission.event.clone());
            }
        }
        Ok(ack)
    }

    async fn update_playback_position(
        &self,
        book_id: &str,
        update: &PositionUpdate,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdatePlaybackPosition {
            book_id: book_id.to_string(),
            update: *update,
        });
        state.check_mutation()?;

        let key = (EntityKind::PlaybackPosition, book_id.to_string());
        let newer = state.records.get(&key).map_or(true, |existing| {
            existing.data["last_played_at"].as_i64().unwrap_or(i64::MIN) < update.last_played_at
        });
        if newer {
            let now = state.tick();
            state.records.insert(
                key,
                RemoteRecord {
                    id: book_id.to_string(),
                    updated_at: now,
                    data: serde_json::json!({
                        "position_ms": update.position_ms,
                        "last_played_at": update.last_played_at,
                    }),
                },
            );
        }
        Ok(())
    }

    async fn update_preferences(&self, fields: &Map<String, Value>) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdatePreferences(fields.clone()));
        state.check_mutation()?;
        state.merge_record(EntityKind::Preferences, SINGLETON_ID, fields);
        Ok(())
    }

    async fn update_profile(&self, fields: &Map<String, Value>) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdateProfile(fields.clone()));
        state.check_mutation()?;
        state.merge_record(EntityKind::Profile, SINGLETON_ID, fields);
        Ok(())
    }

    async fn fetch_changes(
        &self,
        kind: EntityKind,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::FetchChanges {
            kind,
            after: after.cloned(),
        });
        state.check_read()?;
        if state.failing_fetches.contains(&kind) {
            return Err(ApiError::Server {
                status: 500,
                message: format!("{kind} listing unavailable"),
            });
        }

        let is_after = |ts: i64, id: &str| match after {
            Some(cursor) => (ts, id) > (cursor.updated_at, cursor.id.as_str()),
            None => true,
        };

        // Records and tombstones share one timeline so a page never skips
        // past an unsent change.
        let mut changes: Vec<(i64, String, Change)> = state
            .records
            .iter()
            .filter(|((k, id), r)| *k == kind && is_after(r.updated_at, id))
            .map(|((_, id), r)| (r.updated_at, id.clone(), Change::Upsert(r.clone())))
            .chain(
                state
                    .tombstones
                    .iter()
                    .filter(|(k, t)| *k == kind && is_after(t.deleted_at, &t.id))
                    .map(|(_, t)| (t.deleted_at, t.id.clone(), Change::Delete(t.clone()))),
            )
            .collect();
        changes.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let has_more = changes.len() > limit;
        let mut page = ChangePage {
            has_more,
            ..ChangePage::default()
        };
        for (_, _, change) in changes.into_iter().take(limit) {
            match change {
                Change::Upsert(record) => page.records.push(record),
                Change::Delete(tombstone) => page.deleted.push(tombstone),
            }
        }
        Ok(page)
    }

    async fn fetch_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<RemoteRecord>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::FetchEntity {
            kind,
            id: id.to_string(),
        });
        state.check_read()?;
        Ok(state.records.get(&(kind, id.to_string())).cloned())
    }

    async fn fetch_active_sessions(&self) -> Result<Vec<RemoteRecord>, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::FetchActiveSessions);
        state.check_read()?;
        Ok(state
            .records
            .iter()
            .filter(|((k, _), _)| *k == EntityKind::Session)
            .map(|(_, r)| r.clone())
            .collect())
    }
}
