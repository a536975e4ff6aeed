//! Optimistic transactions over cached data.
//!
//! A query entry keeps `saved_data`, the last durable value, and an ordered
//! queue of transactions. The visible data is always `saved_data` with the
//! queue folded on top. [`reconcile`] shrinks the queue after a transaction
//! changes status or the durable value is replaced.
//!
//! # Reconciliation
//!
//! Let `last` be the index of the last pending transaction.
//!
//! - No pending transaction: committed patches are folded into the data,
//!   aborted ones are dropped, and both `saved_data` and the queue go away.
//! - Before `last`: committed transactions are folded into the new
//!   `saved_data` in queue order and dropped, even when an earlier pending
//!   transaction is still queued. Pending ones stay queued and are replayed
//!   on top of the new `saved_data`. Aborted ones are dropped.
//! - From `last` on: everything stays queued. Pending and committed patches
//!   are applied; an aborted transaction is applied and then reverted with
//!   its inverse patches.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::patch::{self, PatchOp, Patches};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub patches: Patches,
    pub inverse_patches: Patches,
    pub status: TransactionStatus,
}

impl TransactionRecord {
    pub fn pending(patches: Patches, inverse_patches: Patches) -> Self {
        Self {
            id: TransactionId::new(),
            patches,
            inverse_patches,
            status: TransactionStatus::Pending,
        }
    }
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub data: Value,
    pub saved: Option<Value>,
    pub transactions: Option<Vec<TransactionRecord>>,
}

/// Apply patches one by one, skipping those that no longer fit the data.
fn apply_lenient(value: &mut Value, id: TransactionId, patches: &[PatchOp]) {
    for op in patches {
        if let Err(err) = patch::apply(value, std::slice::from_ref(op)) {
            tracing::warn!(transaction = %id, error = %err, "skipping patch that no longer applies");
        }
    }
}

/// Fold `transactions` onto `saved` and drop what no longer needs keeping.
pub fn reconcile(saved: Value, transactions: Vec<TransactionRecord>) -> Reconciled {
    let Some(last) = transactions
        .iter()
        .rposition(|tx| tx.status == TransactionStatus::Pending)
    else {
        let mut data = saved;
        for tx in transactions.iter().filter(|tx| tx.status == TransactionStatus::Committed) {
            apply_lenient(&mut data, tx.id, &tx.patches);
        }
        return Reconciled {
            data,
            saved: None,
            transactions: None,
        };
    };

    let mut saved = saved;
    let mut kept = Vec::with_capacity(transactions.len() - last);

    for (index, tx) in transactions.into_iter().enumerate() {
        if index >= last {
            kept.push(tx);
            continue;
        }
        match tx.status {
            TransactionStatus::Committed => apply_lenient(&mut saved, tx.id, &tx.patches),
            TransactionStatus::Pending => kept.push(tx),
            TransactionStatus::Aborted => {}
        }
    }

    let mut data = saved.clone();
    for tx in &kept {
        apply_lenient(&mut data, tx.id, &tx.patches);
        if tx.status == TransactionStatus::Aborted {
            apply_lenient(&mut data, tx.id, &tx.inverse_patches);
        }
    }

    Reconciled {
        data,
        saved: Some(saved),
        transactions: Some(kept),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(before: Value, after: Value, status: TransactionStatus) -> TransactionRecord {
        let (patches, inverse_patches) = patch::diff(&before, &after);
        TransactionRecord {
            id: TransactionId::new(),
            patches,
            inverse_patches,
            status,
        }
    }

    #[test]
    fn pending_transaction_is_visible_but_not_saved() {
        let saved = json!({"count": 0});
        let out = reconcile(
            saved.clone(),
            vec![tx(json!({"count": 0}), json!({"count": 1}), TransactionStatus::Pending)],
        );

        assert_eq!(out.data, json!({"count": 1}));
        assert_eq!(out.saved, Some(saved));
        assert_eq!(out.transactions.map(|t| t.len()), Some(1));
    }

    #[test]
    fn abort_rolls_back_and_empties_the_queue() {
        let out = reconcile(
            json!({"count": 0}),
            vec![tx(json!({"count": 0}), json!({"count": 1}), TransactionStatus::Aborted)],
        );

        assert_eq!(out.data, json!({"count": 0}));
        assert_eq!(out.saved, None);
        assert_eq!(out.transactions, None);
    }

    #[test]
    fn commit_folds_into_the_data() {
        let out = reconcile(
            json!({"count": 0}),
            vec![tx(json!({"count": 0}), json!({"count": 1}), TransactionStatus::Committed)],
        );

        assert_eq!(out.data, json!({"count": 1}));
        assert_eq!(out.saved, None);
        assert_eq!(out.transactions, None);
    }

    #[test]
    fn committed_before_every_pending_is_folded_into_saved() {
        let base = json!({"a": 0, "b": 0, "c": 0});
        let out = reconcile(
            base,
            vec![
                tx(json!({"a": 0}), json!({"a": 1}), TransactionStatus::Aborted),
                tx(json!({"b": 0}), json!({"b": 1}), TransactionStatus::Committed),
                tx(json!({"c": 0}), json!({"c": 1}), TransactionStatus::Pending),
            ],
        );

        assert_eq!(out.data, json!({"a": 0, "b": 1, "c": 1}));
        assert_eq!(out.saved, Some(json!({"a": 0, "b": 1, "c": 0})));
        let kept = out.transactions.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].status, TransactionStatus::Pending);
    }

    #[test]
    fn committed_behind_a_pending_is_still_folded() {
        let out = reconcile(
            json!({"a": 0, "b": 0, "c": 0}),
            vec![
                tx(json!({"a": 0}), json!({"a": 1}), TransactionStatus::Pending),
                tx(json!({"b": 0}), json!({"b": 1}), TransactionStatus::Committed),
                tx(json!({"c": 0}), json!({"c": 1}), TransactionStatus::Pending),
            ],
        );

        assert_eq!(out.data, json!({"a": 1, "b": 1, "c": 1}));
        assert_eq!(out.saved, Some(json!({"a": 0, "b": 1, "c": 0})));
        let kept = out.transactions.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|tx| tx.status == TransactionStatus::Pending));
    }

    #[test]
    fn pending_writes_replay_over_a_folded_commit_of_the_same_key() {
        let out = reconcile(
            json!({"x": 0}),
            vec![
                tx(json!({"x": 0}), json!({"x": 1}), TransactionStatus::Pending),
                tx(json!({"x": 1}), json!({"x": 2}), TransactionStatus::Committed),
                tx(json!({"x": 2}), json!({"x": 2, "y": 1}), TransactionStatus::Pending),
            ],
        );

        assert_eq!(out.saved, Some(json!({"x": 2})));
        assert_eq!(out.data, json!({"x": 1, "y": 1}));
        assert_eq!(out.transactions.unwrap().len(), 2);
    }

    #[test]
    fn aborted_after_the_last_pending_is_kept_but_reverted() {
        let base = json!({"a": 0, "b": 0});
        let out = reconcile(
            base.clone(),
            vec![
                tx(json!({"a": 0}), json!({"a": 1}), TransactionStatus::Pending),
                tx(json!({"b": 0}), json!({"b": 5}), TransactionStatus::Aborted),
            ],
        );

        assert_eq!(out.data, json!({"a": 1, "b": 0}));
        assert_eq!(out.saved, Some(base));
        assert_eq!(out.transactions.unwrap().len(), 2);
    }

    #[test]
    fn stale_patches_are_skipped() {
        let out = reconcile(
            json!({"list": []}),
            vec![TransactionRecord::pending(
                vec![PatchOp::Replace {
                    path: vec![patch::PathSegment::Key("list".into()), patch::PathSegment::Index(4)],
                    value: json!(1),
                }],
                vec![],
            )],
        );
        assert_eq!(out.data, json!({"list": []}));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn status() -> impl Strategy<Value = TransactionStatus> {
            prop_oneof![
                Just(TransactionStatus::Pending),
                Just(TransactionStatus::Committed),
                Just(TransactionStatus::Aborted),
            ]
        }

        /// Successive states of one object, each step writing one key.
        fn history(steps: Vec<(u8, i32)>) -> Vec<Value> {
            let mut states = vec![json!({})];
            for (key, value) in steps {
                let mut next = states.last().cloned().unwrap_or_default();
                next[format!("k{}", key % 4)] = json!(value);
                states.push(next);
            }
            states
        }

        fn field(key: &str, value: i32) -> Value {
            let mut object = serde_json::Map::new();
            object.insert(key.to_string(), json!(value));
            Value::Object(object)
        }

        proptest! {
            #[test]
            fn prop_committing_everything_equals_applying_everything(
                steps in prop::collection::vec((any::<u8>(), any::<i32>()), 0..8)
            ) {
                let states = history(steps);
                let txs: Vec<_> = states
                    .windows(2)
                    .map(|w| tx(w[0].clone(), w[1].clone(), TransactionStatus::Committed))
                    .collect();

                let out = reconcile(states[0].clone(), txs);
                prop_assert_eq!(&out.data, states.last().unwrap());
                prop_assert!(out.transactions.is_none());
                prop_assert!(out.saved.is_none());
            }

            #[test]
            fn prop_aborting_everything_restores_saved(
                steps in prop::collection::vec((any::<u8>(), any::<i32>()), 0..8)
            ) {
                let states = history(steps);
                let txs: Vec<_> = states
                    .windows(2)
                    .map(|w| tx(w[0].clone(), w[1].clone(), TransactionStatus::Aborted))
                    .collect();

                let out = reconcile(states[0].clone(), txs);
                prop_assert_eq!(out.data, states[0].clone());
                prop_assert!(out.transactions.is_none());
            }

            #[test]
            fn prop_overlapping_transactions_fold_committed_ahead_of_pending(
                entries in prop::collection::vec((status(), 0u8..3, 1i32..100), 0..8)
            ) {
                let saved = json!({"k0": 0, "k1": 0, "k2": 0});
                let txs: Vec<_> = entries
                    .iter()
                    .map(|(status, key, value)| {
                        let key = format!("k{key}");
                        tx(field(&key, 0), field(&key, *value), *status)
                    })
                    .collect();
                let last = entries.iter().rposition(|(s, ..)| *s == TransactionStatus::Pending);

                // Each write resets its key to 0 when reverted.
                let mut expected_saved = saved.clone();
                let mut expected = saved.clone();
                match last {
                    Some(last) => {
                        for (status, key, value) in &entries[..last] {
                            if *status == TransactionStatus::Committed {
                                expected_saved[format!("k{key}")] = json!(value);
                            }
                        }
                        expected = expected_saved.clone();
                        for (index, (status, key, value)) in entries.iter().enumerate() {
                            let key = format!("k{key}");
                            match status {
                                TransactionStatus::Pending => expected[key] = json!(value),
                                TransactionStatus::Committed if index > last => expected[key] = json!(value),
                                TransactionStatus::Aborted if index > last => expected[key] = json!(0),
                                _ => {}
                            }
                        }
                    }
                    None => {
                        for (status, key, value) in &entries {
                            if *status == TransactionStatus::Committed {
                                expected[format!("k{key}")] = json!(value);
                            }
                        }
                    }
                }

                let out = reconcile(saved, txs);
                prop_assert_eq!(&out.data, &expected);
                match last {
                    Some(last) => {
                        prop_assert_eq!(out.saved, Some(expected_saved));
                        let pending_before = entries[..last]
                            .iter()
                            .filter(|(s, ..)| *s == TransactionStatus::Pending)
                            .count();
                        let kept = out.transactions.map(|t| t.len());
                        prop_assert_eq!(kept, Some(pending_before + entries.len() - last));
                    }
                    None => {
                        prop_assert!(out.saved.is_none());
                        prop_assert!(out.transactions.is_none());
                    }
                }
            }

            #[test]
            fn prop_disjoint_transactions_fold_to_their_non_aborted_effects(
                entries in prop::collection::vec((status(), any::<i32>()), 0..8)
            ) {
                let saved = json!({});
                let mut expected = saved.clone();
                let mut txs = Vec::new();
                for (index, (status, value)) in entries.iter().enumerate() {
                    let key = format!("k{index}");
                    let mut after = serde_json::Map::new();
                    after.insert(key.clone(), json!(value));
                    txs.push(tx(json!({}), Value::Object(after), *status));
                    if *status != TransactionStatus::Aborted {
                        expected[key] = json!(value);
                    }
                }
                let pending = entries.iter().any(|(s, _)| *s == TransactionStatus::Pending);

                let out = reconcile(saved, txs);
                prop_assert_eq!(&out.data, &expected);
                prop_assert_eq!(out.saved.is_some(), out.transactions.is_some());
                prop_assert_eq!(out.transactions.is_some(), pending);

                // Reconciling the result again changes nothing.
                if let (Some(saved), Some(kept)) = (out.saved, out.transactions) {
                    let again = reconcile(saved, kept);
                    prop_assert_eq!(again.data, expected);
                }
            }
        }
    }
}
