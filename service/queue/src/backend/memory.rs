//! In-process queue backend for unit tests.
//!
//! Implements the same structures and semantics as the redis backend with
//! every operation atomic under one lock, so queue behaviour above the
//! backend trait can be tested without a live store.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use crate::config::QueueConf;
use crate::config::QueueMode;
use crate::message::MessageStatus;
use crate::message::QueueMessage;
use crate::queue::QueueSizes;

use super::QueueBackend;
use super::QueueCounters;

/// In-process queue backend for unit tests.
pub struct MemoryBackend {
    conf: QueueConf,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Primary structure for fifo, lifo and stream modes.
    list: VecDeque<String>,
    /// Primary structure for priority mode: (priority, enqueue sequence, id).
    scored: Vec<(i64, u64, String)>,
    /// Delayed overlay: (due epoch milliseconds, id).
    delayed: Vec<(i64, String)>,
    /// Leased messages: (lease expiry epoch milliseconds, id).
    processing: Vec<(i64, String)>,
    /// Dead letter set.
    failed: Vec<String>,
    records: HashMap<String, QueueMessage>,
    counters: QueueCounters,
    sequence: u64,
}

impl MemoryBackend {
    pub fn new(conf: QueueConf) -> MemoryBackend {
        MemoryBackend {
            conf,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory queue state poisoned")
    }

    /// Place a message ID into the primary structure for this queue mode.
    fn place(conf: &QueueConf, state: &mut State, id: String) {
        match conf.mode {
            QueueMode::Priority => {
                let priority = state
                    .records
                    .get(&id)
                    .map(|record| record.priority)
                    .unwrap_or(0);
                let sequence = state.sequence;
                state.sequence += 1;
                state.scored.push((priority, sequence, id));
            }
            QueueMode::Lifo => state.list.push_front(id),
            QueueMode::Fifo | QueueMode::Stream => state.list.push_back(id),
        }
    }

    /// Pop the next message ID per the queue mode.
    fn pop(conf: &QueueConf, state: &mut State) -> Option<String> {
        match conf.mode {
            QueueMode::Priority => {
                let best = state
                    .scored
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, (priority, sequence, _))| (*priority, std::cmp::Reverse(*sequence)))
                    .map(|(index, _)| index)?;
                let (_, _, id) = state.scored.remove(best);
                Some(id)
            }
            _ => state.list.pop_front(),
        }
    }

    /// Return expired leases and migrate due delayed messages.
    fn sweep(conf: &QueueConf, state: &mut State, now: i64) {
        let leaked: Vec<String> = {
            let (expired, live): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.processing)
                    .into_iter()
                    .partition(|(lease, _)| *lease <= now);
            state.processing = live;
            expired.into_iter().map(|(_, id)| id).collect()
        };
        for id in leaked {
            MemoryBackend::place(conf, state, id);
        }
        let due: Vec<String> = {
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
                .into_iter()
                .partition(|(when, _)| *when <= now);
            state.delayed = pending;
            due.into_iter().map(|(_, id)| id).collect()
        };
        for id in due {
            MemoryBackend::place(conf, state, id);
        }
    }

    fn remove_processing(state: &mut State, id: &str) {
        state.processing.retain(|(_, leased)| leased != id);
    }
}

#[async_trait::async_trait]
impl QueueBackend for MemoryBackend {
    async fn put(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.lock();
        state.records.insert(message.id.clone(), message.clone());
        match message.delay_until {
            Some(delay_until) => {
                state
                    .delayed
                    .push((delay_until.timestamp_millis(), message.id.clone()));
            }
            None => MemoryBackend::place(&self.conf, &mut state, message.id.clone()),
        }
        state.counters.enqueued += 1;
        Ok(())
    }

    async fn take(&self) -> Result<Option<QueueMessage>> {
        let mut state = self.lock();
        let now = Utc::now().timestamp_millis();
        MemoryBackend::sweep(&self.conf, &mut state, now);
        let id = match MemoryBackend::pop(&self.conf, &mut state) {
            None => return Ok(None),
            Some(id) => id,
        };
        let lease = now + (self.conf.visibility_timeout as i64) * 1000;
        state.processing.push((lease, id.clone()));
        let message = match state.records.get_mut(&id) {
            // Record evicted (TTL in the real store); drop the stale entry.
            None => {
                MemoryBackend::remove_processing(&mut state, &id);
                return Ok(None);
            }
            Some(record) => {
                record.status = MessageStatus::Processing;
                record.clone()
            }
        };
        state.counters.dequeued += 1;
        Ok(Some(message))
    }

    async fn load(&self, id: &str) -> Result<Option<QueueMessage>> {
        let state = self.lock();
        Ok(state.records.get(id).cloned())
    }

    async fn update(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.lock();
        state.records.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        MemoryBackend::remove_processing(&mut state, id);
        if let Some(record) = state.records.get_mut(id) {
            if record.status != MessageStatus::Completed {
                record.status = MessageStatus::Completed;
                state.counters.completed += 1;
            }
        }
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, delay_until: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        MemoryBackend::remove_processing(&mut state, &message.id);
        state.delayed.retain(|(_, delayed)| delayed != &message.id);
        state.records.insert(message.id.clone(), message.clone());
        state
            .delayed
            .push((delay_until.timestamp_millis(), message.id.clone()));
        state.counters.retried += 1;
        Ok(())
    }

    async fn reject(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.lock();
        MemoryBackend::remove_processing(&mut state, &message.id);
        state.delayed.retain(|(_, delayed)| delayed != &message.id);
        state.records.insert(message.id.clone(), message.clone());
        state.failed.push(message.id.clone());
        state.counters.failed += 1;
        Ok(())
    }

    async fn mark_expired(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.lock();
        MemoryBackend::remove_processing(&mut state, &message.id);
        if let Some(record) = state.records.get_mut(&message.id) {
            record.status = MessageStatus::Expired;
        }
        state.counters.expired += 1;
        Ok(())
    }

    async fn counters(&self) -> Result<QueueCounters> {
        let state = self.lock();
        Ok(state.counters.clone())
    }

    async fn sizes(&self) -> Result<QueueSizes> {
        let state = self.lock();
        let primary_size = match self.conf.mode {
            QueueMode::Priority => state.scored.len(),
            _ => state.list.len(),
        };
        Ok(QueueSizes {
            primary_size: primary_size as u64,
            processing_size: state.processing.len() as u64,
            delayed_size: state.delayed.len() as u64,
            dlq_size: state.failed.len() as u64,
        })
    }

    async fn purge(&self) -> Result<u64> {
        let mut state = self.lock();
        let mut removed: Vec<String> = Vec::new();
        removed.extend(state.list.drain(..));
        removed.extend(state.scored.drain(..).map(|(_, _, id)| id));
        removed.extend(state.delayed.drain(..).map(|(_, id)| id));
        removed.extend(state.failed.drain(..));
        let count = removed.len() as u64;
        for id in removed {
            state.records.remove(&id);
        }
        Ok(count)
    }
}
