use myfi_call::{CallHistorySink, CallRecord};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// In-memory log of the most recent calls, newest first.
pub struct CallLog {
    records: Mutex<VecDeque<CallRecord>>,
    capacity: usize,
}

impl CallLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn recent(&self) -> Vec<CallRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

impl CallHistorySink for CallLog {
    fn record(&self, record: CallRecord) {
        tracing::debug!(
            peer = %record.peer_identity,
            status = ?record.status,
            duration = record.duration_seconds,
            "Recording call"
        );

        let mut records = self.records.lock();
        records.push_front(record);
        records.truncate(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myfi_call::{CallDirection, CallStatus};
    use pretty_assertions::assert_eq;

    fn record(peer: usize) -> CallRecord {
        CallRecord {
            peer_identity: peer.to_string(),
            direction: CallDirection::Outgoing,
            duration_seconds: 0,
            status: CallStatus::Missed,
        }
    }

    #[test]
    fn newest_first() {
        let log = CallLog::new(20);
        log.record(record(1));
        log.record(record(2));

        let peers: Vec<_> = log.recent().into_iter().map(|r| r.peer_identity).collect();
        assert_eq!(peers, vec!["2", "1"]);
    }

    #[test]
    fn keeps_only_capacity() {
        let log = CallLog::new(20);
        for peer in 0..25 {
            log.record(record(peer));
        }

        let recent = log.recent();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.first().map(|r| r.peer_identity.as_str()), Some("24"));
        assert_eq!(recent.last().map(|r| r.peer_identity.as_str()), Some("5"));
    }
}
