//! Process-local session store. Nothing survives a restart.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Local;

use super::{
    ClientRecord, QueryRecord, QueryStat, Registration, SessionRecord, SessionStore, StoreError,
};
use crate::protocol::{Payload, payload_to_json};

#[derive(Default)]
struct MemoryState {
    clients: Vec<(ClientRecord, String)>,
    sessions: Vec<SessionRecord>,
    queries: Vec<QueryRecord>,
    messages: Vec<(i64, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self, session_id: i64) -> Option<SessionRecord> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    /// Server messages recorded for `recipient_id`, oldest first.
    pub fn messages_for(&self, recipient_id: i64) -> Vec<String> {
        self.lock()
            .messages
            .iter()
            .filter(|(id, _)| *id == recipient_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl SessionStore for MemoryStore {
    fn register_client(&self, registration: &Registration) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let taken = state.clients.iter().any(|(c, _)| {
            c.nickname == registration.nickname || c.email == registration.email
        });
        if taken {
            return Ok(false);
        }

        let record = ClientRecord {
            id: state.clients.len() as i64 + 1,
            name: registration.name.clone(),
            nickname: registration.nickname.clone(),
            email: registration.email.clone(),
            registration_date: now(),
        };
        state
            .clients
            .push((record, registration.password.clone()));
        Ok(true)
    }

    fn check_login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<ClientRecord>, StoreError> {
        Ok(self
            .lock()
            .clients
            .iter()
            .find(|(c, pw)| c.email == email && pw == password)
            .map(|(c, _)| c.clone()))
    }

    fn start_session(&self, client_id: i64, address: &str) -> Result<SessionRecord, StoreError> {
        let mut state = self.lock();
        if !state.clients.iter().any(|(c, _)| c.id == client_id) {
            return Err(StoreError::UnknownClient(client_id));
        }

        let record = SessionRecord {
            id: state.sessions.len() as i64 + 1,
            client_id,
            address: address.to_string(),
            start_time: now(),
            end_time: None,
        };
        state.sessions.push(record.clone());
        Ok(record)
    }

    fn end_session(&self, session_id: i64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or(StoreError::UnknownSession(session_id))?;
        if session.end_time.is_none() {
            session.end_time = Some(now());
        }
        Ok(())
    }

    fn log_query(
        &self,
        client_id: i64,
        session_id: i64,
        query_type: &str,
        parameters: &Payload,
    ) -> Result<i64, StoreError> {
        let parameters = if parameters.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&payload_to_json(parameters))?)
        };

        let mut state = self.lock();
        let id = state.queries.len() as i64 + 1;
        state.queries.push(QueryRecord {
            id,
            client_id,
            session_id,
            query_type: query_type.to_string(),
            parameters,
            timestamp: now(),
        });
        Ok(id)
    }

    fn add_message(&self, recipient_id: i64, text: &str) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.messages.push((recipient_id, text.to_string()));
        Ok(state.messages.len() as i64)
    }

    fn client(&self, client_id: i64) -> Result<Option<ClientRecord>, StoreError> {
        Ok(self
            .lock()
            .clients
            .iter()
            .find(|(c, _)| c.id == client_id)
            .map(|(c, _)| c.clone()))
    }

    fn clients(&self) -> Result<Vec<ClientRecord>, StoreError> {
        Ok(self
            .lock()
            .clients
            .iter()
            .rev()
            .map(|(c, _)| c.clone())
            .collect())
    }

    fn client_queries(&self, client_id: i64) -> Result<Vec<QueryRecord>, StoreError> {
        Ok(self
            .lock()
            .queries
            .iter()
            .rev()
            .filter(|q| q.client_id == client_id)
            .cloned()
            .collect())
    }

    fn query_stats(&self) -> Result<Vec<QueryStat>, StoreError> {
        let state = self.lock();
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for query in &state.queries {
            *counts.entry(query.query_type.as_str()).or_default() += 1;
        }

        let mut stats: Vec<QueryStat> = counts
            .into_iter()
            .map(|(query_type, count)| QueryStat {
                query_type: query_type.to_string(),
                count,
            })
            .collect();
        stats.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.query_type.cmp(&b.query_type))
        });
        Ok(stats)
    }

    fn open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.end_time.is_none())
            .cloned()
            .collect())
    }
}
