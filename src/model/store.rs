//! Persistent per-connector transaction store.
//!
//! Each connector owns a bounded ring of records addressed by a monotonic
//! transaction number: the window `[begin, end)` holds the live slots, slot
//! `end - 1` is the current or most recent transaction. Every live slot is
//! one blob (`tx-<cid>-<n>.jsn`); the per-connector counters live in
//! `op-store.jsn` so numbering survives slot reclamation.
//!
//! Crash rule: reloading yields records no more advanced than their last
//! commit. Records whose start timestamp never became resolvable are never
//! written (see [`Transaction::is_persistable`]), so such a transaction is
//! recovered as aborted — there is simply nothing on disk to resume.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::transaction::Transaction;
use crate::storage::Filesystem;

/// Slots per connector ring.
pub const TX_RING_CAPACITY: usize = 8;

/// Blob carrying the per-connector transaction counters.
pub const OP_STORE_BLOB: &str = "op-store.jsn";

fn slot_blob(connector_id: u32, tx_nr: u32) -> String {
    format!("tx-{connector_id}-{tx_nr}.jsn")
}

#[derive(Default, Serialize, Deserialize)]
struct OpStore {
    /// Next transaction number per connector, keyed by connector id.
    tx_nr: HashMap<String, u32>,
}

struct Ring {
    begin: u32,
    end: u32,
    slots: Vec<Transaction>,
}

impl Ring {
    fn empty(next_nr: u32) -> Ring {
        Ring { begin: next_nr, end: next_nr, slots: Vec::new() }
    }

    fn get(&self, tx_nr: u32) -> Option<&Transaction> {
        if tx_nr < self.begin || tx_nr >= self.end {
            return None;
        }
        self.slots.get((tx_nr - self.begin) as usize)
    }

    fn get_mut(&mut self, tx_nr: u32) -> Option<&mut Transaction> {
        if tx_nr < self.begin || tx_nr >= self.end {
            return None;
        }
        self.slots.get_mut((tx_nr - self.begin) as usize)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

pub struct TransactionStore {
    filesystem: Rc<dyn Filesystem>,
    rings: Vec<Ring>,
}

impl TransactionStore {
    /// Builds the store for connectors `0..connector_count` and reloads any
    /// persisted records. Reloaded records that never reached
    /// `start.rpc.requested` are aborted on the spot: their session cannot
    /// be resumed meaningfully after a reboot.
    pub fn load(filesystem: Rc<dyn Filesystem>, connector_count: u32) -> TransactionStore {
        let op_store: OpStore = filesystem
            .read(OP_STORE_BLOB)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();

        let blob_names = filesystem.list().unwrap_or_default();

        let mut rings = Vec::new();
        for cid in 0..connector_count {
            let next_nr = op_store.tx_nr.get(&cid.to_string()).copied().unwrap_or(0);
            let mut found: Vec<(u32, Transaction)> = Vec::new();
            let prefix = format!("tx-{cid}-");
            for name in &blob_names {
                let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(".jsn"))
                else {
                    continue;
                };
                let Ok(tx_nr) = rest.parse::<u32>() else { continue };
                match filesystem.read(name).map(|d| serde_json::from_slice::<Transaction>(&d)) {
                    Ok(Ok(mut tx)) => {
                        tx.connector_id = cid;
                        tx.tx_nr = tx_nr;
                        if tx.is_preparing() {
                            info!(cid, tx_nr, "recovered preparing transaction as aborted");
                            tx.end_session();
                        }
                        found.push((tx_nr, tx));
                    }
                    Ok(Err(err)) => warn!(name, %err, "transaction blob corrupt; dropped"),
                    Err(err) => warn!(name, %err, "transaction blob unreadable; dropped"),
                }
            }
            found.sort_by_key(|(nr, _)| *nr);

            let ring = match (found.first(), found.last()) {
                (Some((first_nr, _)), Some((last_nr, _))) => {
                    let begin = *first_nr;
                    let end = (*last_nr + 1).max(next_nr);
                    // fill gaps with aborted placeholders so indexing stays dense
                    let mut slots = Vec::with_capacity((end - begin) as usize);
                    let mut iter = found.iter().peekable();
                    for nr in begin..end {
                        match iter.peek() {
                            Some((found_nr, _)) if *found_nr == nr => {
                                if let Some((_, tx)) = iter.next() {
                                    slots.push(tx.clone());
                                }
                            }
                            _ => {
                                let mut gap = Transaction::new(cid, nr, false);
                                gap.end_session();
                                slots.push(gap);
                            }
                        }
                    }
                    Ring { begin, end, slots }
                }
                _ => Ring::empty(next_nr),
            };
            debug!(cid, begin = ring.begin, end = ring.end, "transaction ring loaded");
            rings.push(ring);
        }

        TransactionStore { filesystem, rings }
    }

    fn ring(&self, connector_id: u32) -> Option<&Ring> {
        self.rings.get(connector_id as usize)
    }

    fn ring_mut(&mut self, connector_id: u32) -> Option<&mut Ring> {
        self.rings.get_mut(connector_id as usize)
    }

    /// Allocates the next slot. Reclaims completed/aborted records from the
    /// front of the window first; returns `None` when the ring is still full
    /// of unreclaimable slots.
    pub fn create(&mut self, connector_id: u32, silent: bool) -> Option<u32> {
        self.reclaim(connector_id);
        let ring = self.ring_mut(connector_id)?;
        if ring.len() >= TX_RING_CAPACITY {
            warn!(connector_id, "transaction ring full; cannot begin a new transaction");
            return None;
        }
        let tx_nr = ring.end;
        ring.end += 1;
        ring.slots.push(Transaction::new(connector_id, tx_nr, silent));
        self.persist_op_store();
        debug!(connector_id, tx_nr, silent, "transaction slot allocated");
        Some(tx_nr)
    }

    pub fn get(&self, connector_id: u32, tx_nr: u32) -> Option<&Transaction> {
        self.ring(connector_id)?.get(tx_nr)
    }

    pub fn get_mut(&mut self, connector_id: u32, tx_nr: u32) -> Option<&mut Transaction> {
        self.ring_mut(connector_id)?.get_mut(tx_nr)
    }

    pub fn latest_nr(&self, connector_id: u32) -> Option<u32> {
        let ring = self.ring(connector_id)?;
        if ring.end == ring.begin {
            None
        } else {
            Some(ring.end - 1)
        }
    }

    pub fn latest(&self, connector_id: u32) -> Option<&Transaction> {
        self.get(connector_id, self.latest_nr(connector_id)?)
    }

    /// Serializes one record and replaces its blob. Commits of records whose
    /// start timestamp is still unresolvable are withheld — on purpose, see
    /// the module docs. A failed write keeps the record in memory only.
    pub fn commit(&mut self, connector_id: u32, tx_nr: u32) -> bool {
        let Some(tx) = self.get(connector_id, tx_nr) else {
            return false;
        };
        if !tx.is_persistable() {
            debug!(connector_id, tx_nr, "commit withheld: start timestamp unresolved");
            return true;
        }
        let data = match serde_json::to_vec(tx) {
            Ok(d) => d,
            Err(err) => {
                warn!(connector_id, tx_nr, %err, "transaction serialization failed");
                return false;
            }
        };
        match self.filesystem.write(&slot_blob(connector_id, tx_nr), &data) {
            Ok(()) => true,
            Err(err) => {
                warn!(connector_id, tx_nr, %err, "transaction commit failed; record kept in memory");
                false
            }
        }
    }

    /// Drops reclaimable records from the front of the window, removing their
    /// blobs.
    pub fn reclaim(&mut self, connector_id: u32) {
        let Some(ring) = self.ring_mut(connector_id) else { return };
        let mut removed = Vec::new();
        while let Some(front) = ring.slots.first() {
            if !front.is_reclaimable() {
                break;
            }
            removed.push(ring.begin);
            ring.slots.remove(0);
            ring.begin += 1;
        }
        for tx_nr in removed {
            let _ = self.filesystem.remove(&slot_blob(connector_id, tx_nr));
            debug!(connector_id, tx_nr, "transaction slot reclaimed");
        }
    }

    /// Explicit removal; only permitted for completed or aborted records.
    pub fn remove(&mut self, connector_id: u32, tx_nr: u32) -> bool {
        match self.get(connector_id, tx_nr) {
            Some(tx) if tx.is_reclaimable() => {}
            _ => return false,
        }
        self.reclaim(connector_id);
        self.get(connector_id, tx_nr).is_none()
    }

    /// Visits every live record, for the transaction RPC sync pass.
    pub fn for_each(&self, mut visit: impl FnMut(&Transaction)) {
        for ring in &self.rings {
            for tx in &ring.slots {
                visit(tx);
            }
        }
    }

    fn persist_op_store(&self) {
        let mut op_store = OpStore::default();
        for (cid, ring) in self.rings.iter().enumerate() {
            op_store.tx_nr.insert(cid.to_string(), ring.end);
        }
        match serde_json::to_vec(&op_store) {
            Ok(data) => {
                if let Err(err) = self.filesystem.write(OP_STORE_BLOB, &data) {
                    warn!(%err, "op-store write failed");
                }
            }
            Err(err) => warn!(%err, "op-store serialization failed"),
        }
    }
}
