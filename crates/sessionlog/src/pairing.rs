// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Login/logout pairing with carry-over of unmatched logins between runs.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::errors::PairingError;
use crate::record::{EntryKind, LogEntry, MatchedRecord, PairingKey};
use crate::staging::{Artifact, StagingStore};

/// Result of one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Paired(PairingSummary),
    /// A matched batch from an earlier run has not been transmitted yet.
    AlreadyPaired,
    /// No decoded batch is waiting.
    NothingToPair,
}

impl PairOutcome {
    pub fn did_work(&self) -> bool {
        matches!(self, PairOutcome::Paired(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingSummary {
    pub matched: usize,
    pub pending: usize,
    /// Logouts whose login was never seen. They are dropped.
    pub unmatched_logouts: usize,
    /// Entries that are neither logins nor logouts.
    pub ignored: usize,
}

/// Entries keyed by [`PairingKey`] where a later insert replaces the earlier value but keeps
/// its original position.
#[derive(Default)]
struct KeyedEntries {
    order: Vec<PairingKey>,
    entries: HashMap<PairingKey, LogEntry>,
}

impl KeyedEntries {
    fn insert(&mut self, entry: LogEntry) -> Option<LogEntry> {
        let key = entry.key();
        let replaced = self.entries.insert(key.clone(), entry);
        if replaced.is_none() {
            self.order.push(key);
        }
        replaced
    }

    fn remove(&mut self, key: &PairingKey) -> Option<LogEntry> {
        self.entries.remove(key)
    }

    fn into_ordered(mut self) -> Vec<LogEntry> {
        self.order
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }
}

/// Pairs a working set of entries. Pure: the same input always yields the same output.
///
/// Returns the matched records, the logins still waiting for their logout, and a summary.
pub fn pair_entries(
    entries: impl IntoIterator<Item = LogEntry>,
) -> (Vec<MatchedRecord>, Vec<LogEntry>, PairingSummary) {
    let mut logins = KeyedEntries::default();
    let mut logouts = KeyedEntries::default();
    let mut summary = PairingSummary::default();

    for entry in entries {
        match entry.kind {
            EntryKind::Login => {
                if let Some(previous) = logins.insert(entry) {
                    warn!("Login {} replaced by a later login with the same key", previous);
                }
            }
            EntryKind::Logout => {
                logouts.insert(entry);
            }
            EntryKind::Other(_) => summary.ignored += 1,
        }
    }

    let mut matched = Vec::new();
    for logout in logouts.into_ordered() {
        match logins.remove(&logout.key()) {
            Some(login) => {
                // Both halves share a key and have the right kinds, so this always pairs.
                if let Some(record) = MatchedRecord::new(login, logout) {
                    matched.push(record);
                }
            }
            None => {
                debug!("Dropping logout without a login: {}", logout);
                summary.unmatched_logouts += 1;
            }
        }
    }

    let pending = logins.into_ordered();
    summary.matched = matched.len();
    summary.pending = pending.len();
    (matched, pending, summary)
}

pub struct PairingStage {
    store: StagingStore,
}

impl PairingStage {
    pub fn new(store: StagingStore) -> Self {
        PairingStage { store }
    }

    /// Pairs the decoded batch together with the logins carried over from earlier runs.
    ///
    /// The matched batch and the new pending set are persisted before the decoded batch is
    /// removed. If persisting fails the partial matched batch is deleted so the next run
    /// pairs again from the untouched decoded batch.
    pub async fn try_pair(&self) -> Result<PairOutcome, PairingError> {
        if self.store.exists(Artifact::MatchedBatch).await? {
            debug!("Matched batch still pending, skipping pairing");
            return Ok(PairOutcome::AlreadyPaired);
        }

        let Some(decoded) = self.store.read_entries(Artifact::DecodedBatch).await? else {
            return Ok(PairOutcome::NothingToPair);
        };
        let carried = self
            .store
            .read_entries(Artifact::PendingLogins)
            .await?
            .unwrap_or_default();

        // Carried logins are older than anything in the decoded batch.
        let (matched, pending, summary) = pair_entries(carried.into_iter().chain(decoded));

        if let Err(e) = self.persist(&matched, &pending).await {
            self.discard_matched().await;
            return Err(e);
        }

        // Matched and pending are committed. If the decoded batch can't be removed the next
        // run sees the matched batch and waits; the decoded batch is re-paired after it is
        // sent, which may resend its sessions but never loses one.
        self.store.remove(Artifact::DecodedBatch).await?;

        if summary.unmatched_logouts > 0 {
            warn!(
                "Dropped {} logouts without a matching login",
                summary.unmatched_logouts
            );
        }
        debug!(
            "Paired {} sessions, {} logins pending",
            summary.matched, summary.pending
        );
        Ok(PairOutcome::Paired(summary))
    }

    async fn persist(
        &self,
        matched: &[MatchedRecord],
        pending: &[LogEntry],
    ) -> Result<(), PairingError> {
        self.store.write_matched(matched).await?;
        self.store
            .write_entries(Artifact::PendingLogins, pending)
            .await?;
        Ok(())
    }

    async fn discard_matched(&self) {
        if let Err(e) = self.store.remove(Artifact::MatchedBatch).await {
            error!("Failed to discard partial matched batch: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn login(user: &str, pid: i32, time: i32, host: &str) -> LogEntry {
        LogEntry::new(user, pid, EntryKind::Login, time, host)
    }

    fn logout(user: &str, pid: i32, time: i32, host: &str) -> LogEntry {
        LogEntry::new(user, pid, EntryKind::Logout, time, host)
    }

    fn setup() -> (tempfile::TempDir, StagingStore, PairingStage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let stage = PairingStage::new(store.clone());
        (dir, store, stage)
    }

    #[test]
    fn test_pair_entries_matches_by_key() {
        let l1 = login("a", 1, 100, "h");
        let l2 = login("b", 2, 110, "h");
        let o1 = logout("a", 1, 200, "h");
        let stray = logout("c", 3, 210, "h");

        let (matched, pending, summary) =
            pair_entries(vec![l1.clone(), l2.clone(), o1.clone(), stray]);

        assert_eq!(matched, vec![MatchedRecord::new(l1, o1).expect("pair")]);
        assert_eq!(pending, vec![l2]);
        assert_eq!(
            summary,
            PairingSummary {
                matched: 1,
                pending: 1,
                unmatched_logouts: 1,
                ignored: 0
            }
        );
    }

    #[test]
    fn test_pair_entries_key_includes_host() {
        let (matched, pending, _) =
            pair_entries(vec![login("a", 1, 100, "h1"), logout("a", 1, 200, "h2")]);
        assert!(matched.is_empty());
        assert_eq!(pending, vec![login("a", 1, 100, "h1")]);
    }

    #[test]
    fn test_pair_entries_later_login_overwrites() {
        let (matched, pending, _) = pair_entries(vec![
            login("a", 1, 100, "h"),
            login("a", 1, 150, "h"),
            logout("a", 1, 200, "h"),
        ]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].login.time, 150);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pair_entries_ignores_other_types() {
        let (matched, pending, summary) = pair_entries(vec![
            LogEntry::new("reboot", 0, EntryKind::Other(2), 1, "~"),
            login("a", 1, 100, "h"),
        ]);
        assert!(matched.is_empty());
        assert_eq!(pending.len(), 1);
        assert_eq!(summary.ignored, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_pair_without_decoded_batch() {
        let (_dir, _store, stage) = setup();
        let outcome = stage.try_pair().await.expect("pair");
        assert_eq!(outcome, PairOutcome::NothingToPair);
        assert!(!outcome.did_work());
    }

    #[tokio::test]
    async fn test_skips_while_matched_batch_pending() {
        let (_dir, store, stage) = setup();
        store.write_matched(&[]).await.expect("write");
        store
            .write_entries(Artifact::DecodedBatch, &[login("a", 1, 1, "h")])
            .await
            .expect("write");

        assert_eq!(
            stage.try_pair().await.expect("pair"),
            PairOutcome::AlreadyPaired
        );
        assert!(store.exists(Artifact::DecodedBatch).await.expect("exists"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_try_pair_stages_matched_and_pending() {
        let (_dir, store, stage) = setup();
        let l1 = login("a", 1, 100, "h");
        let l2 = login("b", 2, 110, "h");
        let o1 = logout("a", 1, 200, "h");
        store
            .write_entries(
                Artifact::DecodedBatch,
                &[l1.clone(), l2.clone(), o1.clone(), logout("z", 9, 1, "h")],
            )
            .await
            .expect("write");

        let outcome = stage.try_pair().await.expect("pair");
        assert!(outcome.did_work());

        assert_eq!(
            store.read_matched().await.expect("read"),
            Some(vec![MatchedRecord::new(l1, o1).expect("pair")])
        );
        assert_eq!(
            store
                .read_entries(Artifact::PendingLogins)
                .await
                .expect("read"),
            Some(vec![l2])
        );
        assert!(!store.exists(Artifact::DecodedBatch).await.expect("exists"));
        assert!(logs_contain("Dropped 1 logouts without a matching login"));
    }

    #[tokio::test]
    async fn test_pending_logins_carry_into_next_run() {
        let (_dir, store, stage) = setup();
        let l2 = login("b", 2, 110, "h");
        store
            .write_entries(Artifact::DecodedBatch, &[l2.clone()])
            .await
            .expect("write");
        stage.try_pair().await.expect("pair");
        assert_eq!(store.read_matched().await.expect("read"), Some(vec![]));

        // Transmission retires the (empty) matched batch.
        store.remove(Artifact::MatchedBatch).await.expect("remove");

        let o2 = logout("b", 2, 300, "h");
        store
            .write_entries(Artifact::DecodedBatch, &[o2.clone()])
            .await
            .expect("write");
        stage.try_pair().await.expect("pair");

        assert_eq!(
            store.read_matched().await.expect("read"),
            Some(vec![MatchedRecord::new(l2, o2).expect("pair")])
        );
        assert_eq!(
            store
                .read_entries(Artifact::PendingLogins)
                .await
                .expect("read"),
            Some(vec![])
        );
    }

    #[tokio::test]
    async fn test_failed_persist_discards_matched_and_keeps_decoded() {
        let (_dir, store, stage) = setup();
        let decoded = vec![login("a", 1, 100, "h"), logout("a", 1, 200, "h")];
        store
            .write_entries(Artifact::DecodedBatch, &decoded)
            .await
            .expect("write");

        let mut blocker = store.path(Artifact::PendingLogins).into_os_string();
        blocker.push(".tmp");
        std::fs::create_dir(&blocker).expect("mkdir");

        assert!(stage.try_pair().await.is_err());
        assert!(!store.exists(Artifact::MatchedBatch).await.expect("exists"));
        assert_eq!(
            store
                .read_entries(Artifact::DecodedBatch)
                .await
                .expect("read"),
            Some(decoded)
        );

        // Once the obstruction is gone the retry pairs the same input.
        std::fs::remove_dir(&blocker).expect("rmdir");
        assert!(stage.try_pair().await.expect("pair").did_work());
        assert_eq!(
            store.read_matched().await.expect("read").map(|m| m.len()),
            Some(1)
        );
    }
}
