//! Proof-of-work validation, difficulty retargeting and reorg detection.
//!
//! `commit_header` is the only mutating entry point. The header store
//! mutex is held for the duration of a commit; commits are infrequent and
//! fast, so there is no reader/writer split.

use std::io::Write;
use std::sync::Mutex;

use bitcoin::block::Header as BlockHeader;
use bitcoin::pow::CompactTarget;
use bitcoin::BlockHash;

use crate::chain::params::{
    NetworkParams, EPOCH_LENGTH, MAX_RETARGET_TIMESPAN, MIN_RETARGET_TIMESPAN,
    TARGET_SPACING_SECS, TARGET_TIMESPAN_SECS,
};
use crate::chain::store::{HeaderStore, StoredHeader, PRUNE_KEEP_DEPTH};
use crate::chain::work::{target_from_bits, ChainWork, Uint256};
use crate::error::{ChainError, ChainResult, StoreError};

/// Maximum number of hashes in a block locator.
const MAX_LOCATOR_HASHES: usize = 500;

/// A detected chain reorganization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reorg {
    /// Height of the common ancestor of the old and new chains. Everything
    /// above this height on the old chain is no longer part of the best
    /// chain.
    pub fork_height: u32,
}

/// Outcome of committing one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub new_tip: bool,
    pub reorg: Option<Reorg>,
    pub height: u32,
}

/// Wrapper around a header store that handles all blockchain operations.
pub struct Blockchain {
    params: NetworkParams,
    db: Mutex<Box<dyn HeaderStore>>,
}

impl Blockchain {
    /// Open the chain over the given store, seeding the compiled-in
    /// checkpoint on first start. A store that cannot be seeded is fatal.
    pub fn new(mut db: Box<dyn HeaderStore>, params: NetworkParams) -> ChainResult<Self> {
        if matches!(db.best(), Err(StoreError::NotFound(_))) {
            let checkpoint = params.checkpoint();
            tracing::info!(
                network = %params.network,
                height = checkpoint.height,
                "Initializing header store with checkpoint"
            );
            let record = StoredHeader::new(checkpoint.header, checkpoint.height, ChainWork::zero());
            db.put(record, true)
                .map_err(|_| ChainError::CheckpointSeed(params.network.to_string()))?;
        }
        Ok(Self {
            params,
            db: Mutex::new(db),
        })
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Validate `header` against its parent and append it to the store.
    pub fn commit_header(&self, header: &BlockHeader) -> ChainResult<CommitResult> {
        let mut db = self.db.lock().expect("header store mutex");

        let best = db.best()?;
        let tip_hash = best.block_hash();

        // When the tip is the parent we can skip a lookup; otherwise the
        // header may extend some known fork, or be an orphan.
        let parent = if header.prev_blockhash == tip_hash {
            best
        } else {
            db.get_previous(header).map_err(|_| ChainError::OrphanHeader)?
        };

        self.check_header(&mut db, header, &parent)?;

        if header.block_hash() == tip_hash {
            return Ok(CommitResult {
                new_tip: false,
                reorg: None,
                height: best.height,
            });
        }

        let target = target_from_bits(header.bits).ok_or(ChainError::InvalidProofOfWork)?;
        let cumulative_work = parent.total_work + ChainWork::from_target(target);

        let mut new_tip = cumulative_work > best.total_work;
        let mut reorg = None;
        if new_tip && header.prev_blockhash != tip_hash {
            // The new best header does not extend the old tip: a reorg,
            // unless the fork reaches below the checkpoint, in which case
            // the current tip is kept.
            match self.common_ancestor(&mut db, &parent, &best) {
                Ok(ancestor) => {
                    tracing::warn!(
                        fork_height = ancestor.height,
                        new_height = parent.height + 1,
                        "Chain reorganization detected"
                    );
                    reorg = Some(Reorg {
                        fork_height: ancestor.height,
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        "Rejecting reorg that crosses the checkpoint at height {}",
                        self.params.checkpoint_height()
                    );
                    new_tip = false;
                }
            }
        }

        let record = StoredHeader::new(*header, parent.height + 1, cumulative_work);
        db.put(record, new_tip)?;

        Ok(CommitResult {
            new_tip,
            reorg,
            height: record.height,
        })
    }

    /// Check linkage, difficulty and proof of work for a header extending
    /// `parent`.
    fn check_header(
        &self,
        db: &mut Box<dyn HeaderStore>,
        header: &BlockHeader,
        parent: &StoredHeader,
    ) -> ChainResult<()> {
        if header.prev_blockhash != parent.block_hash() {
            return Err(ChainError::HeaderDidNotExtend);
        }

        let required = self.required_work(db, header, parent.height + 1, parent)?;
        if header.bits != required {
            tracing::warn!(
                height = parent.height + 1,
                hash = %header.block_hash(),
                got = header.bits.to_consensus(),
                want = required.to_consensus(),
                "Header carries incorrect difficulty"
            );
            return Err(ChainError::DifficultyMismatch {
                got: header.bits.to_consensus(),
                want: required.to_consensus(),
            });
        }

        if !self.check_proof_of_work(header) {
            return Err(ChainError::InvalidProofOfWork);
        }

        Ok(())
    }

    /// The target must be positive, within the network limit, and met by
    /// the header hash.
    fn check_proof_of_work(&self, header: &BlockHeader) -> bool {
        let target = match target_from_bits(header.bits) {
            Some(t) => t,
            None => {
                tracing::debug!("Header target is zero or negative");
                return false;
            }
        };
        if target > self.params.pow_limit {
            tracing::debug!("Header target is above the network limit");
            return false;
        }
        target.is_met_by(header.block_hash())
    }

    /// The compact difficulty this header must carry, handling retarget
    /// heights and the reduced-difficulty rules of test networks.
    fn required_work(
        &self,
        db: &mut Box<dyn HeaderStore>,
        header: &BlockHeader,
        height: u32,
        parent: &StoredHeader,
    ) -> ChainResult<CompactTarget> {
        if height % EPOCH_LENGTH != 0 {
            if self.params.reduce_min_difficulty {
                // A block arriving more than 20 minutes after its parent may
                // use the minimum difficulty.
                if header.time as u64 > parent.header.time as u64 + 2 * TARGET_SPACING_SECS {
                    return Ok(self.params.pow_limit_bits);
                }
                // Otherwise inherit from the last ancestor that did not use
                // the special rule.
                let mut walk = *parent;
                while walk.height % EPOCH_LENGTH != 0
                    && walk.header.bits == self.params.pow_limit_bits
                {
                    match db.get_previous(&walk.header) {
                        Ok(prev) => walk = prev,
                        // The walk bottomed out at the checkpoint.
                        Err(_) => break,
                    }
                }
                return Ok(walk.header.bits);
            }
            return Ok(parent.header.bits);
        }

        let epoch = self.epoch_header(db, parent)?;
        Ok(calc_diff_adjust(&epoch, &parent.header, &self.params))
    }

    /// Walk back 2015 headers from `from` to the first header of the
    /// current difficulty epoch.
    fn epoch_header(
        &self,
        db: &mut Box<dyn HeaderStore>,
        from: &StoredHeader,
    ) -> ChainResult<BlockHeader> {
        let mut record = *from;
        for _ in 0..(EPOCH_LENGTH - 1) {
            record = db.get_previous(&record.header)?;
        }
        Ok(record.header)
    }

    /// Walk both chains back until they meet. Fails when either walk runs
    /// off the store (the fork would cross the checkpoint).
    fn common_ancestor(
        &self,
        db: &mut Box<dyn HeaderStore>,
        new_best: &StoredHeader,
        old_best: &StoredHeader,
    ) -> ChainResult<StoredHeader> {
        let mut new_walk = *new_best;
        let mut old_walk = *old_best;
        while new_walk.height > old_walk.height {
            new_walk = db.get_previous(&new_walk.header)?;
        }
        while old_walk.height > new_walk.height {
            old_walk = db.get_previous(&old_walk.header)?;
        }
        while new_walk.block_hash() != old_walk.block_hash() {
            new_walk = db.get_previous(&new_walk.header)?;
            old_walk = db.get_previous(&old_walk.header)?;
        }
        Ok(new_walk)
    }

    /// The current chain tip record.
    pub fn best_header(&self) -> ChainResult<StoredHeader> {
        Ok(self.db.lock().expect("header store mutex").best()?)
    }

    /// Height of the current tip.
    pub fn height(&self) -> ChainResult<u32> {
        Ok(self.db.lock().expect("header store mutex").height()?)
    }

    /// Hashes of the last `n` blocks, tip first.
    pub fn n_prev_hashes(&self, n: usize) -> Vec<BlockHash> {
        let mut db = self.db.lock().expect("header store mutex");
        let mut hashes = Vec::with_capacity(n);
        let mut record = match db.best() {
            Ok(best) => best,
            Err(_) => return hashes,
        };
        hashes.push(record.block_hash());
        for _ in 1..n {
            record = match db.get_previous(&record.header) {
                Ok(prev) => prev,
                Err(_) => return hashes,
            };
            hashes.push(record.block_hash());
        }
        hashes
    }

    /// Block locator for `getheaders`: the tip, ten single steps back,
    /// then a step that doubles every ten hashes, capped at 500.
    pub fn block_locator(&self) -> Vec<BlockHash> {
        let mut db = self.db.lock().expect("header store mutex");
        let mut locator = Vec::new();
        let mut record = match db.best() {
            Ok(best) => best,
            Err(_) => return locator,
        };
        locator.push(record.block_hash());

        let mut step = 1usize;
        'outer: while locator.len() < MAX_LOCATOR_HASHES {
            if locator.len() % 10 == 0 {
                step *= 2;
            }
            for _ in 0..step {
                record = match db.get_previous(&record.header) {
                    Ok(prev) => prev,
                    Err(_) => break 'outer,
                };
            }
            locator.push(record.block_hash());
        }
        locator
    }

    /// Delete headers buried deeper than the keep depth.
    pub fn prune(&self) -> ChainResult<()> {
        Ok(self.db.lock().expect("header store mutex").prune(PRUNE_KEEP_DEPTH)?)
    }

    /// Write the header database in a human-readable form.
    pub fn dump(&self, writer: &mut dyn Write) -> ChainResult<()> {
        Ok(self.db.lock().expect("header store mutex").dump(writer)?)
    }

    /// Flush the header store.
    pub fn close(&self) -> ChainResult<()> {
        Ok(self.db.lock().expect("header store mutex").close()?)
    }
}

/// Compute the retargeted compact difficulty from the first and last
/// headers of an epoch, clamping the measured duration to one quarter and
/// four times the two-week timespan.
fn calc_diff_adjust(
    start: &BlockHeader,
    end: &BlockHeader,
    params: &NetworkParams,
) -> CompactTarget {
    let mut duration = (end.time as i64 - start.time as i64).max(0) as u64;
    if duration < MIN_RETARGET_TIMESPAN {
        tracing::debug!(hash = %end.block_hash(), "Retarget clamped at 4x difficulty increase");
        duration = MIN_RETARGET_TIMESPAN;
    } else if duration > MAX_RETARGET_TIMESPAN {
        tracing::debug!(hash = %end.block_hash(), "Retarget clamped at 4x difficulty decrease");
        duration = MAX_RETARGET_TIMESPAN;
    }

    let old_target = match Uint256::from_compact(end.bits.to_consensus()) {
        Some(t) => t,
        None => return params.pow_limit_bits,
    };
    let mut new_target = old_target.mul_u64(duration).div_u64(TARGET_TIMESPAN_SECS);

    let limit = Uint256::from_be_bytes(params.pow_limit.to_be_bytes());
    if new_target > limit {
        new_target = limit;
    }
    CompactTarget::from_consensus(new_target.to_compact())
}
