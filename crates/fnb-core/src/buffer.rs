//! Message buffer: collects channel posts between summarization cycles.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Mutex, PoisonError},
};

use crate::domain::{Batch, RawMessage};

/// Recently drained source ids remembered for deduplication across cycles.
const RECENT_IDS_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored,
    /// Stored, but the oldest buffered message was evicted to respect the cap.
    StoredWithEviction,
    /// Same `source_id` already buffered or recently drained; ignored.
    Duplicate,
}

#[derive(Default)]
struct BufferState {
    pending: VecDeque<RawMessage>,
    pending_ids: HashSet<String>,
    truncated: usize,
    recent_ids: HashSet<String>,
    recent_order: VecDeque<String>,
}

impl BufferState {
    fn remember_drained(&mut self, id: String) {
        if !self.recent_ids.insert(id.clone()) {
            return;
        }
        self.recent_order.push_back(id);
        while self.recent_order.len() > RECENT_IDS_CAPACITY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_ids.remove(&old);
            }
        }
    }
}

/// Thread-safe append / atomic drain.
///
/// Both operations take the same lock, so an append either lands before a
/// drain's swap (and is returned by it) or after (and waits for the next drain).
pub struct MessageBuffer {
    cap: usize,
    state: Mutex<BufferState>,
}

impl MessageBuffer {
    pub fn new(max_messages_per_cycle: usize) -> Self {
        Self {
            cap: max_messages_per_cycle.max(1),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn append(&self, msg: RawMessage) -> AppendOutcome {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if st.pending_ids.contains(&msg.source_id) || st.recent_ids.contains(&msg.source_id) {
            tracing::debug!(source_id = %msg.source_id, "duplicate channel message ignored");
            return AppendOutcome::Duplicate;
        }

        let mut outcome = AppendOutcome::Stored;
        if st.pending.len() >= self.cap {
            if let Some(evicted) = st.pending.pop_front() {
                st.pending_ids.remove(&evicted.source_id);
                st.truncated += 1;
                tracing::warn!(
                    cap = self.cap,
                    evicted = %evicted.source_id,
                    truncated = st.truncated,
                    "message buffer full, dropping oldest message"
                );
            }
            outcome = AppendOutcome::StoredWithEviction;
        }

        st.pending_ids.insert(msg.source_id.clone());
        st.pending.push_back(msg);
        outcome
    }

    /// Return every buffered message (oldest first) and clear the buffer.
    pub fn drain(&self) -> Batch {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let messages: Vec<RawMessage> = std::mem::take(&mut st.pending).into();
        let truncated = std::mem::take(&mut st.truncated);
        st.pending_ids.clear();
        for m in messages.iter() {
            st.remember_drained(m.source_id.clone());
        }

        if truncated > 0 {
            tracing::warn!(
                kept = messages.len(),
                truncated,
                "batch truncated by per-cycle cap"
            );
        }

        Batch {
            messages,
            truncated,
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
