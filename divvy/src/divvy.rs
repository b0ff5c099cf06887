//! Divvy: resumable weighted settlement engine.
//!
//! Accumulates weighted entries into partitioned rosters, selects one
//! winning sub-bucket per bucket from externally delivered randomness, and
//! distributes a fixed reward pool proportionally among the members of the
//! winning sub-buckets. Every externally invoked step runs under a
//! caller-supplied work budget and checkpoints a cursor before returning,
//! so a window of any size can be driven to completion across many calls.
//!
//! Guarantees:
//! 1. Exact fund conservation under eager settlement: payouts plus the
//!    closing remainder equal the pool snapshot to the unit.
//! 2. Bounded dust under lazy settlement: the pool minus all claim
//!    authorizations is less than the number of winners.
//! 3. Winner selection is a pure function of (window, bucket, seed) and is
//!    recomputable by any observer without engine state.
//! 4. No entry is ever paid twice, across any interleaving of eager
//!    settlement calls and per-owner claims.
//!
//! All state is laid out in a single contiguous memory chunk, suitable for
//! a single Solana account.

#![no_std]
#![forbid(unsafe_code)]

#[cfg(kani)]
extern crate kani;

// ============================================================================
// Constants
// ============================================================================

// MAX_ENTRIES is feature-configured, not target-configured, so x86 and SBF
// builds agree on slab sizes for a given feature set.
#[cfg(kani)]
pub const MAX_ENTRIES: usize = 8; // Small for fast formal verification

#[cfg(all(feature = "test", not(kani)))]
pub const MAX_ENTRIES: usize = 256; // Small for tests

#[cfg(all(not(kani), not(feature = "test")))]
pub const MAX_ENTRIES: usize = 8192; // Production

/// Maximum number of buckets a window may be partitioned into.
pub const MAX_BUCKETS: usize = 16;

/// Allowed range of sub-bucket counts per bucket.
pub const MIN_DENOM: u8 = 4;
pub const MAX_DENOM: u8 = 20;

/// Sentinel for "no entry" in the per-bucket chains.
pub const NIL_ENTRY: u32 = u32::MAX;

/// Sentinel for "winning sub-bucket not yet decided".
pub const SUB_UNSET: u8 = u8::MAX;

// ============================================================================
// Core Data Structures
// ============================================================================

/// Window lifecycle. Stored directly in the slab; the zeroed slab decodes
/// as `Open`, which is the correct initial state.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Open = 0,
    Selecting = 1,
    Settling = 2,
    Closed = 3,
}

/// One registered entry. Immutable after registration except for the
/// `claimed` flag, which is set exactly once when the entry is paid
/// (eagerly) or its claim is authorized (lazily).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Owner pubkey bytes (signature checks are the wrapper's job).
    pub owner: [u8; 32],

    /// Registered weight. Never zero for a live entry.
    pub weight: u64,

    /// Next entry in the same bucket's arrival-order chain (NIL_ENTRY = end).
    pub next: u32,

    /// Bucket this entry was classified into.
    pub bucket: u8,

    /// Sub-bucket assigned round-robin at registration.
    pub sub: u8,

    /// 1 once the entry has been paid or its claim authorized.
    pub claimed: u8,

    pub _padding: u8,
}

fn empty_entry() -> Entry {
    Entry {
        owner: [0; 32],
        weight: 0,
        next: NIL_ENTRY,
        bucket: 0,
        sub: 0,
        claimed: 0,
        _padding: 0,
    }
}

/// Per-sub-bucket aggregates, maintained O(1) at registration.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubBucket {
    /// Sum of member weights.
    pub weight_sum: u64,

    /// Heaviest single entry seen (for tie-break/bonus reporting).
    pub top_weight: u64,
    pub top_owner: [u8; 32],

    /// Number of members.
    pub count: u32,

    pub _padding: u32,
}

fn empty_sub_bucket() -> SubBucket {
    SubBucket {
        weight_sum: 0,
        top_weight: 0,
        top_owner: [0; 32],
        count: 0,
        _padding: 0,
    }
}

/// One top-level partition: `denom` sub-buckets plus the arrival-order
/// chain of every entry registered into the bucket.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// First/last entry in arrival order (NIL_ENTRY = empty).
    pub head: u32,
    pub tail: u32,

    /// Total entries registered into this bucket (drives round-robin).
    pub count: u32,

    /// Number of sub-buckets (MIN_DENOM..=MAX_DENOM).
    pub denom: u8,

    /// Winning sub-bucket once decided (SUB_UNSET before).
    pub winning_sub: u8,

    pub _padding: [u8; 2],

    /// Sub-bucket aggregates; only the first `denom` slots are live.
    pub subs: [SubBucket; MAX_DENOM as usize],
}

fn empty_bucket() -> Bucket {
    Bucket {
        head: NIL_ENTRY,
        tail: NIL_ENTRY,
        count: 0,
        denom: 0,
        winning_sub: SUB_UNSET,
        _padding: [0; 2],
        subs: [empty_sub_bucket(); MAX_DENOM as usize],
    }
}

/// Window parameters, fixed at initialization.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowParams {
    /// Settlement cycle this slab belongs to (level/epoch number).
    pub window_id: u64,

    /// Number of live buckets (1..=MAX_BUCKETS).
    pub num_buckets: u8,

    pub _padding: [u8; 7],

    /// Sub-bucket count per bucket; only the first `num_buckets` are live.
    pub denoms: [u8; MAX_BUCKETS],
}

impl WindowParams {
    /// Validate bucket layout before the engine is initialized from it.
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 || self.num_buckets as usize > MAX_BUCKETS {
            return Err(DivvyError::InvalidParams);
        }
        for i in 0..self.num_buckets as usize {
            let d = self.denoms[i];
            if d < MIN_DENOM || d > MAX_DENOM {
                return Err(DivvyError::InvalidParams);
            }
        }
        Ok(())
    }
}

/// Immutable claim snapshot, finalized exactly once when selection
/// completes. The only data a lazy claim needs.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimRound {
    pub pool_amount: u64,
    pub total_winning_weight: u64,
}

/// One payout produced by an eager settlement step. The wrapper performs
/// the actual token transfer; the engine only computes and records it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payout {
    pub owner: [u8; 32],
    pub amount: u64,
    pub entry: u32,
    pub _padding: u32,
}

pub fn empty_payout() -> Payout {
    Payout {
        owner: [0; 32],
        amount: 0,
        entry: NIL_ENTRY,
        _padding: 0,
    }
}

/// Outcome of one eager settlement step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettleOutcome {
    /// True once the cursor has passed the end of the last bucket and the
    /// window is Closed. False is the normal "call again" signal.
    pub finished: bool,

    /// Winners paid during this call (entries written to `out`).
    pub num_paid: u32,

    /// Entries visited during this call (winners and non-winners both).
    pub ops_used: u32,

    /// Unallocated pool returned at close. Zero except possibly on the
    /// closing call.
    pub remainder: u64,

    /// Cursor position after this call (for telemetry/resume inspection).
    pub last_bucket: u8,
    pub last_cursor: u32,
}

// ============================================================================
// Main Engine State
// ============================================================================

/// Settlement engine for one window - fixed slab, no heap.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DivvyEngine {
    /// Window parameters (bucket layout).
    pub params: WindowParams,

    /// Lifecycle phase.
    pub phase: Phase,

    /// 1 once the ClaimRound snapshot is frozen.
    pub round_final: u8,

    pub _padding0: [u8; 6],

    /// Delivered random seed (valid once phase >= Selecting).
    pub seed: [u8; 32],

    /// Reward pool funded so far. Frozen into `round_pool` at snapshot.
    pub pool: u64,

    /// Tokens currently held for this window: pool minus everything paid,
    /// claimed, or swept out.
    pub vault: u64,

    /// ClaimRound snapshot fields (valid once `round_final` is set).
    pub round_pool: u64,
    pub round_total_weight: u64,

    // ========================================
    // Selecting-phase cursor
    // ========================================
    /// Next bucket to decide. Buckets are processed in ascending order and
    /// never revisited.
    pub select_cursor: u8,

    // ========================================
    // Settling-phase cursor
    // ========================================
    /// Bucket currently being swept.
    pub settle_bucket: u8,

    pub _padding1: [u8; 2],

    /// Next entry of `settle_bucket`'s chain to visit (NIL_ENTRY = chain
    /// exhausted, advance to the next bucket).
    pub settle_next: u32,

    /// Streaming-division state: pool and winning weight not yet consumed
    /// by the eager sweep.
    pub remaining_pool: u64,
    pub remaining_weight: u64,

    // ========================================
    // Remainder carryover
    // ========================================
    /// Unallocated remainder accrued at close, awaiting collection.
    pub carryover: u64,

    /// Total carryover swept out so far.
    pub carryover_collected: u64,

    // ========================================
    // Lifetime Counters (telemetry)
    // ========================================
    pub total_entries: u32,
    pub num_winners_paid: u32,
    pub num_claims: u32,
    pub _padding2: u32,
    pub total_paid: u64,
    pub total_claimed: u64,

    // ========================================
    // Registry
    // ========================================
    /// Buckets; only the first `params.num_buckets` are live.
    pub buckets: [Bucket; MAX_BUCKETS],

    /// Next free arena slot (entries are append-only, never recycled).
    pub next_entry: u32,

    pub _padding3: u32,

    /// Entry arena.
    pub entries: [Entry; MAX_ENTRIES],
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivvyError {
    /// Zero-weight registration.
    InvalidWeight,

    /// Registration or funding attempted after the window left Open.
    WindowNotOpen,

    /// Selection step on a window that is not Selecting.
    WindowNotSelecting,

    /// Settlement step on a window that is not Settling.
    WindowNotSettling,

    /// Claim before the ClaimRound snapshot exists.
    WindowNotClosedForClaim,

    /// Claim from an entry outside its bucket's winning sub-bucket.
    NotWinner,

    /// Second claim for the same entry.
    AlreadyClaimed,

    /// Bucket id outside the window's configured range.
    BucketOutOfRange,

    /// Entry arena exhausted.
    RegistryFull,

    /// Entry reference does not name a registered entry.
    EntryNotFound,

    /// Caller does not own the referenced entry.
    Unauthorized,

    /// Arithmetic overflow.
    Overflow,

    /// Rejected window parameters.
    InvalidParams,
}

pub type Result<T> = core::result::Result<T, DivvyError>;

// ============================================================================
// Math Helpers
// ============================================================================

/// floor(amount * num / den) with a u128 intermediate. The quotient always
/// fits u64 when num <= den, which is the only way settlement calls it.
#[inline]
fn mul_div_floor(amount: u64, num: u64, den: u64) -> Result<u64> {
    if den == 0 {
        return Err(DivvyError::Overflow);
    }
    let q = (amount as u128) * (num as u128) / (den as u128);
    if q > u64::MAX as u128 {
        return Err(DivvyError::Overflow);
    }
    Ok(q as u64)
}

#[inline]
fn add_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or(DivvyError::Overflow)
}

#[inline]
fn sub_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_sub(b).ok_or(DivvyError::Overflow)
}

// ============================================================================
// Partition Selector (pure)
// ============================================================================

/// splitmix64 finalizer.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Map a delivered seed to the winning sub-bucket of one bucket.
///
/// Pure and stateless: recomputable by any observer from public inputs, so
/// a claimed winner can be verified without trusting the engine's stored
/// result. The seed is folded into a single 64-bit lane, tweaked per input
/// with distinct odd constants, and finalized with splitmix64 before the
/// modulo reduction.
pub fn winning_sub_bucket(window_id: u64, bucket_id: u8, seed: &[u8; 32], denom: u8) -> u8 {
    if denom == 0 {
        return 0;
    }
    let mut acc = 0u64;
    let mut i = 0;
    while i < 32 {
        let mut lane = [0u8; 8];
        lane.copy_from_slice(&seed[i..i + 8]);
        acc ^= u64::from_le_bytes(lane);
        i += 8;
    }
    acc ^= window_id.wrapping_mul(0xD6E8_FEB8_6659_FD93);
    acc ^= (bucket_id as u64).wrapping_mul(0xA5A3_5625_E4F7_C1AD);
    let mut state = acc;
    (splitmix64(&mut state) % denom as u64) as u8
}

// ============================================================================
// Core Implementation
// ============================================================================

impl DivvyEngine {
    /// Create a new engine (stack-allocates the full struct - avoid in BPF!)
    ///
    /// For Solana BPF programs, use `init_in_place` on zeroed account data.
    pub fn new(params: WindowParams) -> Result<Self> {
        params.validate()?;
        let mut engine = Self {
            params,
            phase: Phase::Open,
            round_final: 0,
            _padding0: [0; 6],
            seed: [0; 32],
            pool: 0,
            vault: 0,
            round_pool: 0,
            round_total_weight: 0,
            select_cursor: 0,
            settle_bucket: 0,
            _padding1: [0; 2],
            settle_next: NIL_ENTRY,
            remaining_pool: 0,
            remaining_weight: 0,
            carryover: 0,
            carryover_collected: 0,
            total_entries: 0,
            num_winners_paid: 0,
            num_claims: 0,
            _padding2: 0,
            total_paid: 0,
            total_claimed: 0,
            buckets: [empty_bucket(); MAX_BUCKETS],
            next_entry: 0,
            _padding3: 0,
            entries: [empty_entry(); MAX_ENTRIES],
        };
        for i in 0..params.num_buckets as usize {
            engine.buckets[i].denom = params.denoms[i];
        }
        Ok(engine)
    }

    /// Initialize in place (zero-copy friendly).
    ///
    /// PREREQUISITE: the memory backing `self` MUST be zeroed beforehand.
    /// Only non-zero fields are written, so the full slab is never touched.
    pub fn init_in_place(&mut self, params: WindowParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        self.settle_next = NIL_ENTRY;
        for i in 0..MAX_BUCKETS {
            self.buckets[i].head = NIL_ENTRY;
            self.buckets[i].tail = NIL_ENTRY;
            self.buckets[i].winning_sub = SUB_UNSET;
            if i < params.num_buckets as usize {
                self.buckets[i].denom = params.denoms[i];
            }
        }
        Ok(())
    }

    // ========================================
    // Entry Registry
    // ========================================

    /// Register a weighted entry into `bucket_id`.
    ///
    /// The sub-bucket is assigned round-robin from the bucket's running
    /// arrival count, which keeps sub-bucket sizes near-uniform for any
    /// arrival order. Returns the entry reference used for later claims.
    /// All updates are O(1); nothing here ever scans.
    pub fn register(&mut self, owner: [u8; 32], weight: u64, bucket_id: u8) -> Result<u32> {
        if self.phase != Phase::Open {
            return Err(DivvyError::WindowNotOpen);
        }
        if weight == 0 {
            return Err(DivvyError::InvalidWeight);
        }
        if bucket_id >= self.params.num_buckets {
            return Err(DivvyError::BucketOutOfRange);
        }
        let idx = self.next_entry;
        if idx as usize >= MAX_ENTRIES {
            return Err(DivvyError::RegistryFull);
        }

        let (denom, tail, count) = {
            let b = &self.buckets[bucket_id as usize];
            (b.denom, b.tail, b.count)
        };
        let sub = (count % denom as u32) as u8;

        // Aggregates first: weight_sum can overflow, in which case the
        // registration is rejected before any state was touched.
        {
            let sb = &mut self.buckets[bucket_id as usize].subs[sub as usize];
            sb.weight_sum = add_u64(sb.weight_sum, weight)?;
            sb.count += 1;
            if weight > sb.top_weight {
                sb.top_weight = weight;
                sb.top_owner = owner;
            }
        }

        self.entries[idx as usize] = Entry {
            owner,
            weight,
            next: NIL_ENTRY,
            bucket: bucket_id,
            sub,
            claimed: 0,
            _padding: 0,
        };

        // Chain into the bucket's arrival-order list.
        if tail == NIL_ENTRY {
            self.buckets[bucket_id as usize].head = idx;
        } else {
            self.entries[tail as usize].next = idx;
        }
        let b = &mut self.buckets[bucket_id as usize];
        b.tail = idx;
        b.count += 1;

        self.next_entry = idx + 1;
        self.total_entries += 1;
        Ok(idx)
    }

    /// Grow the reward pool. Allowed until the ClaimRound snapshot is
    /// frozen; after that the pool is immutable.
    pub fn fund_pool(&mut self, amount: u64) -> Result<()> {
        if self.round_final != 0 {
            return Err(DivvyError::WindowNotOpen);
        }
        self.pool = add_u64(self.pool, amount)?;
        self.vault = add_u64(self.vault, amount)?;
        Ok(())
    }

    // ========================================
    // Batch Processor: Selecting
    // ========================================

    /// Close registrations and arm selection with the delivered seed.
    pub fn begin_selection(&mut self, seed: [u8; 32]) -> Result<()> {
        if self.phase != Phase::Open {
            return Err(DivvyError::WindowNotOpen);
        }
        self.seed = seed;
        self.select_cursor = 0;
        self.phase = Phase::Selecting;
        Ok(())
    }

    /// Decide winning sub-buckets, at most `ops_budget` buckets per call.
    ///
    /// Buckets are processed in ascending order from the persisted cursor;
    /// each costs one op. Returns Ok(false) while work remains (including
    /// for a zero budget, which is a reported no-op, never a failure).
    /// When the last bucket is decided the ClaimRound snapshot is frozen,
    /// the streaming-division state is seeded from it, and the window
    /// moves to Settling.
    pub fn advance_selection(&mut self, ops_budget: u32) -> Result<bool> {
        if self.phase != Phase::Selecting {
            return Err(DivvyError::WindowNotSelecting);
        }
        let mut budget = ops_budget;
        while (self.select_cursor as usize) < self.params.num_buckets as usize {
            if budget == 0 {
                return Ok(false);
            }
            let b_idx = self.select_cursor;
            let denom = self.buckets[b_idx as usize].denom;
            let win = winning_sub_bucket(self.params.window_id, b_idx, &self.seed, denom);
            let win_weight = self.buckets[b_idx as usize].subs[win as usize].weight_sum;
            self.buckets[b_idx as usize].winning_sub = win;
            self.round_total_weight = add_u64(self.round_total_weight, win_weight)?;
            self.select_cursor += 1;
            budget -= 1;
        }

        // All buckets decided: freeze the snapshot and arm the sweep.
        self.round_pool = self.pool;
        self.round_final = 1;
        self.remaining_pool = self.round_pool;
        self.remaining_weight = self.round_total_weight;
        self.settle_bucket = 0;
        self.settle_next = self.buckets[0].head;
        self.phase = Phase::Settling;
        Ok(true)
    }

    // ========================================
    // Batch Processor: Settling (eager payout)
    // ========================================

    /// Sweep winning sub-bucket members and pay them by streaming division.
    ///
    /// Visits entries of the current bucket's chain in arrival order from
    /// the persisted `(settle_bucket, settle_next)` cursor. Every visited
    /// entry costs one op against `ops_limit`, winner or not; winners also
    /// count against `selection_cap` and the capacity of `out`. Streaming
    /// division pays `floor(remaining_pool * w / remaining_weight)`, except
    /// that a winner whose weight equals all remaining weight takes the
    /// entire remaining pool, so the final winner absorbs rounding dust.
    ///
    /// Entries already consumed by a lazy claim are skipped without pay;
    /// their snapshot amounts and weights are deducted from the streaming
    /// state so both strategies stay consistent within one window.
    ///
    /// Partial progress is committed, never rolled back, and no entry is
    /// ever visited twice. A call with a zero budget is a no-op reporting
    /// `finished = false`. When the cursor passes the last bucket the
    /// window closes and the unallocated remainder accrues to carryover.
    pub fn advance_settlement(
        &mut self,
        selection_cap: u32,
        ops_limit: u32,
        out: &mut [Payout],
    ) -> Result<SettleOutcome> {
        if self.phase != Phase::Settling {
            return Err(DivvyError::WindowNotSettling);
        }
        let cap = selection_cap.min(out.len() as u32);
        let mut paid: u32 = 0;
        let mut ops: u32 = 0;
        let mut finished = false;
        let mut remainder: u64 = 0;

        loop {
            if ops >= ops_limit {
                break;
            }
            if self.settle_next == NIL_ENTRY {
                // Bucket transitions and closure are free: only entry
                // visits count against the budget.
                let next_bucket = self.settle_bucket + 1;
                if next_bucket >= self.params.num_buckets {
                    remainder = self.remaining_pool;
                    self.carryover = add_u64(self.carryover, remainder)?;
                    self.remaining_pool = 0;
                    self.phase = Phase::Closed;
                    finished = true;
                    break;
                }
                self.settle_bucket = next_bucket;
                self.settle_next = self.buckets[next_bucket as usize].head;
                continue;
            }

            let e_idx = self.settle_next as usize;
            let entry = self.entries[e_idx];
            let win = self.buckets[self.settle_bucket as usize].winning_sub;

            if entry.sub == win && entry.claimed == 0 {
                if paid >= cap {
                    // No payout capacity left this call; the cursor stays
                    // on this winner for the next invocation.
                    break;
                }
                ops += 1;
                let amount = if entry.weight == self.remaining_weight {
                    self.remaining_pool
                } else {
                    mul_div_floor(self.remaining_pool, entry.weight, self.remaining_weight)?
                };
                self.entries[e_idx].claimed = 1;
                self.remaining_pool = sub_u64(self.remaining_pool, amount)?;
                self.remaining_weight = sub_u64(self.remaining_weight, entry.weight)?;
                self.vault = sub_u64(self.vault, amount)?;
                self.total_paid = add_u64(self.total_paid, amount)?;
                self.num_winners_paid += 1;
                out[paid as usize] = Payout {
                    owner: entry.owner,
                    amount,
                    entry: e_idx as u32,
                    _padding: 0,
                };
                paid += 1;
            } else if entry.sub == win {
                // Consumed by a lazy claim before the sweep got here:
                // deduct its snapshot share so the stream stays exact.
                ops += 1;
                let amount = mul_div_floor(self.round_pool, entry.weight, self.round_total_weight)?;
                self.remaining_pool = self.remaining_pool.saturating_sub(amount);
                self.remaining_weight = self.remaining_weight.saturating_sub(entry.weight);
            } else {
                ops += 1;
            }
            self.settle_next = entry.next;
        }

        Ok(SettleOutcome {
            finished,
            num_paid: paid,
            ops_used: ops,
            remainder,
            last_bucket: self.settle_bucket,
            last_cursor: self.settle_next,
        })
    }

    // ========================================
    // Claim Ledger (lazy payout)
    // ========================================

    /// Authorize the payout for one entry by snapshot division.
    ///
    /// O(1): the entry reference returned by `register` names the entry;
    /// the recorded owner must match the caller. The amount is
    /// `floor(pool * weight / total_winning_weight)` from the immutable
    /// snapshot. Sets the consumed flag before returning, so a retry
    /// always fails with `AlreadyClaimed` and nothing is ever paid twice.
    /// The caller is responsible for moving the actual funds.
    pub fn claim(&mut self, entry_idx: u32, owner: &[u8; 32]) -> Result<u64> {
        if self.round_final == 0 {
            return Err(DivvyError::WindowNotClosedForClaim);
        }
        if entry_idx >= self.next_entry {
            return Err(DivvyError::EntryNotFound);
        }
        let entry = self.entries[entry_idx as usize];
        if &entry.owner != owner {
            return Err(DivvyError::Unauthorized);
        }
        if self.buckets[entry.bucket as usize].winning_sub != entry.sub {
            return Err(DivvyError::NotWinner);
        }
        if entry.claimed != 0 {
            return Err(DivvyError::AlreadyClaimed);
        }
        let amount = mul_div_floor(self.round_pool, entry.weight, self.round_total_weight)?;
        self.entries[entry_idx as usize].claimed = 1;
        self.vault = sub_u64(self.vault, amount)?;
        self.total_claimed = add_u64(self.total_claimed, amount)?;
        self.num_claims += 1;
        Ok(amount)
    }

    /// Sweep the closing remainder out of the window. Only meaningful once
    /// Closed; returns the amount the caller should move out of custody.
    pub fn collect_carryover(&mut self) -> Result<u64> {
        if self.phase != Phase::Closed {
            return Err(DivvyError::WindowNotSettling);
        }
        let amount = self.carryover;
        self.carryover = 0;
        self.vault = sub_u64(self.vault, amount)?;
        self.carryover_collected = add_u64(self.carryover_collected, amount)?;
        Ok(amount)
    }

    // ========================================
    // Read Views
    // ========================================

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The frozen claim snapshot, if selection has completed.
    pub fn claim_round(&self) -> Option<ClaimRound> {
        if self.round_final == 0 {
            return None;
        }
        Some(ClaimRound {
            pool_amount: self.round_pool,
            total_winning_weight: self.round_total_weight,
        })
    }

    /// Whether `sub` is the decided winning sub-bucket of `bucket`.
    /// False while the bucket is still undecided.
    pub fn is_winning_sub_bucket(&self, bucket: u8, sub: u8) -> bool {
        if bucket >= self.params.num_buckets {
            return false;
        }
        let win = self.buckets[bucket as usize].winning_sub;
        win != SUB_UNSET && win == sub
    }

    pub fn entry(&self, idx: u32) -> Option<&Entry> {
        if idx >= self.next_entry {
            return None;
        }
        Some(&self.entries[idx as usize])
    }

    pub fn sub_bucket(&self, bucket: u8, sub: u8) -> Option<&SubBucket> {
        if bucket >= self.params.num_buckets {
            return None;
        }
        let b = &self.buckets[bucket as usize];
        if sub >= b.denom {
            return None;
        }
        Some(&b.subs[sub as usize])
    }

    // ========================================
    // Invariant Checking (test support)
    // ========================================

    /// Full conservation audit. O(entries) - test/audit use only, never
    /// called from a budgeted path.
    ///
    /// Checks:
    /// - per-sub aggregates match a rescan of the arena (weight sums,
    ///   counts, chain membership);
    /// - vault + total_paid + total_claimed + carryover_collected == pool;
    /// - once the snapshot is frozen, authorized payouts never exceed it;
    /// - once Closed, the snapshot is fully accounted to the unit.
    pub fn check_conservation(&self) -> bool {
        // Registry aggregates vs arena rescan.
        for b_idx in 0..self.params.num_buckets as usize {
            let b = &self.buckets[b_idx];
            let mut sums = [0u64; MAX_DENOM as usize];
            let mut counts = [0u32; MAX_DENOM as usize];
            let mut chain_len = 0u32;
            let mut cursor = b.head;
            while cursor != NIL_ENTRY {
                let e = &self.entries[cursor as usize];
                if e.bucket as usize != b_idx || e.sub >= b.denom {
                    return false;
                }
                sums[e.sub as usize] = sums[e.sub as usize].saturating_add(e.weight);
                counts[e.sub as usize] += 1;
                chain_len += 1;
                if chain_len > self.next_entry {
                    return false; // cycle
                }
                cursor = e.next;
            }
            if chain_len != b.count {
                return false;
            }
            for s in 0..b.denom as usize {
                if sums[s] != b.subs[s].weight_sum || counts[s] != b.subs[s].count {
                    return false;
                }
            }
        }

        // Funds: everything that entered is either still held or accounted.
        let outgo = self
            .total_paid
            .checked_add(self.total_claimed)
            .and_then(|v| v.checked_add(self.carryover_collected));
        let outgo = match outgo {
            Some(v) => v,
            None => return false,
        };
        if self.vault.checked_add(outgo) != Some(self.pool) {
            return false;
        }

        if self.round_final != 0 {
            let authorized = match self.total_paid.checked_add(self.total_claimed) {
                Some(v) => v,
                None => return false,
            };
            if authorized > self.round_pool {
                return false;
            }
            if self.phase == Phase::Closed {
                // Closed windows account for the snapshot exactly.
                let total = authorized
                    .checked_add(self.carryover)
                    .and_then(|v| v.checked_add(self.carryover_collected));
                if total != Some(self.round_pool) {
                    return false;
                }
            }
        } else if self.total_paid != 0 || self.total_claimed != 0 {
            return false;
        }

        true
    }
}
