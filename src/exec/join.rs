//! Tiered FULL OUTER hash join
//!
//! The build side is loaded into a tier chosen by its row count, then the
//! probe side streams through once. Every probe row with a matching key
//! emits one merged row per build match; probe rows with a NULL or
//! unmatched key emit once with the build side NULL-filled; build rows
//! never matched emit once, NULL-filled on the probe side, after the
//! probe scan. NULL keys never match.
//!
//! Tiers:
//! - I (≤ 256 build rows): linear key scan with a stack bitmask of
//!   matched flags.
//! - II (≤ 8192): pooled bit vector plus an open-addressing table from
//!   key to first build index, duplicates chained through a second array.
//! - III: open-addressing table with backward-shift deletion; matched
//!   chains move to a side table so duplicate probe keys still match, and
//!   the live remainder after the probe scan is exactly the unmatched
//!   build set.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::types::{CancelToken, Value, ValueKey};
use crate::util::bitvec::BitVec;

/// Largest build side handled by the stack tier.
pub const TIER1_MAX_ROWS: usize = 256;

/// Largest build side handled by the pooled tier.
pub const TIER2_MAX_ROWS: usize = 8192;

/// Which merged rows a join emits; FULL OUTER emits all three groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinEmit {
    pub probe_unmatched: bool,
    pub build_unmatched: bool,
}

impl JoinEmit {
    pub fn full_outer() -> JoinEmit {
        JoinEmit {
            probe_unmatched: true,
            build_unmatched: true,
        }
    }

    pub fn inner() -> JoinEmit {
        JoinEmit {
            probe_unmatched: false,
            build_unmatched: false,
        }
    }
}

/// Join `build` against a streaming probe side.
///
/// `build_is_left` controls column layout only: false lays rows out as
/// `[probe || build]`, true as `[build || probe]`.
#[allow(clippy::too_many_arguments)]
pub fn execute<P>(
    build: &[Vec<Value>],
    build_key: usize,
    build_cols: usize,
    probe: P,
    probe_key: usize,
    probe_cols: usize,
    build_is_left: bool,
    emit: JoinEmit,
    cancel: Option<&CancelToken>,
) -> Result<Vec<Vec<Value>>>
where
    P: Iterator<Item = Result<Vec<Value>>>,
{
    let mut tier = Tier::for_build(build, build_key);
    let mut out = Vec::new();
    let merge = |probe_row: &[Value], build_row: &[Value]| -> Vec<Value> {
        let mut row = Vec::with_capacity(build_cols + probe_cols);
        if build_is_left {
            row.extend_from_slice(build_row);
            row.extend_from_slice(probe_row);
        } else {
            row.extend_from_slice(probe_row);
            row.extend_from_slice(build_row);
        }
        row
    };

    let mut scratch = Vec::new();
    for probe_row in probe {
        let probe_row = probe_row?;
        if let Some(tok) = cancel {
            if tok.is_canceled() {
                return Err(crate::error::Error::Canceled);
            }
        }
        scratch.clear();
        match join_key(&probe_row[probe_key]) {
            None => {}
            Some(key) => tier.drain_matches(&key, &mut scratch),
        }
        if scratch.is_empty() {
            if emit.probe_unmatched {
                let nulls = vec![Value::Null; build_cols];
                out.push(merge(&probe_row, &nulls));
            }
        } else {
            for &b in &scratch {
                out.push(merge(&probe_row, &build[b as usize]));
            }
        }
    }

    if emit.build_unmatched {
        let nulls = vec![Value::Null; probe_cols];
        for b in tier.drain_residual() {
            out.push(merge(&nulls, &build[b as usize]));
        }
    }
    Ok(out)
}

/// NULL keys never participate; whole reals canonicalize so `1` matches
/// `1.0`.
fn join_key(v: &Value) -> Option<ValueKey> {
    if v.is_null() {
        None
    } else {
        Some(ValueKey::new(v.clone()))
    }
}

// ============================================================================
// Tiers
// ============================================================================

enum Tier {
    Stack {
        keys: Vec<Option<ValueKey>>,
        matched: [u64; TIER1_MAX_ROWS / 64],
    },
    Pooled {
        keys: Vec<Option<ValueKey>>,
        matched: BitVec,
        table: KeyTable,
        next: Vec<i32>,
    },
    OpenAddress {
        live: KeyTable,
        matched: KeyTable,
        next: Vec<i32>,
        null_rows: Vec<u32>,
        build_len: usize,
    },
}

impl Tier {
    fn for_build(build: &[Vec<Value>], key_col: usize) -> Tier {
        let n = build.len();
        if n <= TIER1_MAX_ROWS {
            Tier::Stack {
                keys: build.iter().map(|r| join_key(&r[key_col])).collect(),
                matched: [0u64; TIER1_MAX_ROWS / 64],
            }
        } else if n <= TIER2_MAX_ROWS {
            let keys: Vec<Option<ValueKey>> =
                build.iter().map(|r| join_key(&r[key_col])).collect();
            let mut table = KeyTable::with_capacity(n);
            let mut next = vec![-1i32; n];
            for (i, key) in keys.iter().enumerate() {
                if let Some(k) = key {
                    table.push_chain(k, i as u32, &mut next);
                }
            }
            Tier::Pooled {
                keys,
                matched: BitVec::new(n),
                table,
                next,
            }
        } else {
            let mut live = KeyTable::with_capacity(n);
            let mut next = vec![-1i32; n];
            let mut null_rows = Vec::new();
            for (i, row) in build.iter().enumerate() {
                match join_key(&row[key_col]) {
                    Some(k) => live.push_chain(&k, i as u32, &mut next),
                    None => null_rows.push(i as u32),
                }
            }
            Tier::OpenAddress {
                live,
                matched: KeyTable::with_capacity(64),
                next,
                null_rows,
                build_len: n,
            }
        }
    }

    /// Collect build indices matching `key`, marking them matched.
    fn drain_matches(&mut self, key: &ValueKey, out: &mut Vec<u32>) {
        match self {
            Tier::Stack { keys, matched } => {
                for (i, k) in keys.iter().enumerate() {
                    if k.as_ref() == Some(key) {
                        matched[i / 64] |= 1 << (i % 64);
                        out.push(i as u32);
                    }
                }
            }
            Tier::Pooled {
                matched,
                table,
                next,
                ..
            } => {
                if let Some(head) = table.find(key) {
                    let mut i = head as i32;
                    while i >= 0 {
                        matched.set(i as usize);
                        out.push(i as u32);
                        i = next[i as usize];
                    }
                }
            }
            Tier::OpenAddress {
                live,
                matched,
                next,
                ..
            } => {
                // First look among chains already matched by an earlier
                // duplicate probe key, then drain from the live table.
                if let Some(head) = matched.find(key) {
                    let mut i = head as i32;
                    while i >= 0 {
                        out.push(i as u32);
                        i = next[i as usize];
                    }
                    return;
                }
                if let Some(head) = live.remove(key) {
                    let mut i = head as i32;
                    while i >= 0 {
                        out.push(i as u32);
                        i = next[i as usize];
                    }
                    matched.insert_head(key, head);
                }
            }
        }
    }

    /// Build indices never matched, ascending where tracked per-row.
    fn drain_residual(self) -> Vec<u32> {
        match self {
            Tier::Stack { keys, matched } => (0..keys.len())
                .filter(|&i| matched[i / 64] & (1 << (i % 64)) == 0)
                .map(|i| i as u32)
                .collect(),
            Tier::Pooled { matched, .. } => matched.zeros().map(|i| i as u32).collect(),
            Tier::OpenAddress {
                live,
                next,
                null_rows,
                build_len,
                ..
            } => {
                // The live remainder plus NULL-keyed rows, in build order.
                let mut residual = vec![false; build_len];
                for head in live.heads() {
                    let mut i = head as i32;
                    while i >= 0 {
                        residual[i as usize] = true;
                        i = next[i as usize];
                    }
                }
                for i in null_rows {
                    residual[i as usize] = true;
                }
                residual
                    .iter()
                    .enumerate()
                    .filter(|(_, &r)| r)
                    .map(|(i, _)| i as u32)
                    .collect()
            }
        }
    }
}

// ============================================================================
// Open-Addressing Table
// ============================================================================

/// Open-addressing hash table from key to the head of a build-row chain,
/// with linear probing and backward-shift deletion.
struct KeyTable {
    slots: Vec<Option<(u64, ValueKey, u32)>>,
    mask: usize,
    len: usize,
}

impl KeyTable {
    fn with_capacity(expected: usize) -> KeyTable {
        let cap = (expected * 2).next_power_of_two().max(16);
        KeyTable {
            slots: vec![None; cap],
            mask: cap - 1,
            len: 0,
        }
    }

    fn hash(key: &ValueKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    /// Chain `row` under `key`, creating the entry on first sight.
    fn push_chain(&mut self, key: &ValueKey, row: u32, next: &mut [i32]) {
        let h = Self::hash(key);
        let mut idx = (h as usize) & self.mask;
        loop {
            match &mut self.slots[idx] {
                Some((sh, sk, head)) if *sh == h && sk == key => {
                    next[row as usize] = *head as i32;
                    *head = row;
                    return;
                }
                Some(_) => idx = (idx + 1) & self.mask,
                None => {
                    self.slots[idx] = Some((h, key.clone(), row));
                    self.len += 1;
                    if self.len * 4 > self.slots.len() * 3 {
                        self.grow();
                    }
                    return;
                }
            }
        }
    }

    /// Insert a chain head wholesale (matched-side bookkeeping).
    fn insert_head(&mut self, key: &ValueKey, head: u32) {
        let h = Self::hash(key);
        let mut idx = (h as usize) & self.mask;
        loop {
            match &self.slots[idx] {
                Some((sh, sk, _)) if *sh == h && sk == key => return,
                Some(_) => idx = (idx + 1) & self.mask,
                None => {
                    self.slots[idx] = Some((h, key.clone(), head));
                    self.len += 1;
                    if self.len * 4 > self.slots.len() * 3 {
                        self.grow();
                    }
                    return;
                }
            }
        }
    }

    fn find(&self, key: &ValueKey) -> Option<u32> {
        let h = Self::hash(key);
        let mut idx = (h as usize) & self.mask;
        loop {
            match &self.slots[idx] {
                Some((sh, sk, head)) if *sh == h && sk == key => return Some(*head),
                Some(_) => idx = (idx + 1) & self.mask,
                None => return None,
            }
        }
    }

    /// Remove the entry for `key`, backward-shifting the probe run so
    /// later lookups stay correct.
    fn remove(&mut self, key: &ValueKey) -> Option<u32> {
        let h = Self::hash(key);
        let mut idx = (h as usize) & self.mask;
        let head = loop {
            match &self.slots[idx] {
                Some((sh, sk, head)) if *sh == h && sk == key => break *head,
                Some(_) => idx = (idx + 1) & self.mask,
                None => return None,
            }
        };
        // Backward shift: close the gap by moving displaced entries up.
        let mut gap = idx;
        let mut probe = (idx + 1) & self.mask;
        loop {
            match &self.slots[probe] {
                None => break,
                Some((sh, _, _)) => {
                    let home = (*sh as usize) & self.mask;
                    // The entry may move into the gap only if its home
                    // position does not lie strictly between gap and probe.
                    let between = if gap <= probe {
                        home > gap && home <= probe
                    } else {
                        home > gap || home <= probe
                    };
                    if !between {
                        self.slots[gap] = self.slots[probe].take();
                        gap = probe;
                    }
                    probe = (probe + 1) & self.mask;
                }
            }
        }
        self.slots[gap] = None;
        self.len -= 1;
        Some(head)
    }

    fn heads(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|(_, _, head)| *head))
    }

    fn grow(&mut self) {
        let cap = self.slots.len() * 2;
        let mut slots: Vec<Option<(u64, ValueKey, u32)>> = vec![None; cap];
        let mask = cap - 1;
        for slot in self.slots.drain(..).flatten() {
            let mut idx = (slot.0 as usize) & mask;
            while slots[idx].is_some() {
                idx = (idx + 1) & mask;
            }
            slots[idx] = Some(slot);
        }
        self.slots = slots;
        self.mask = mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: i64, tag: &str) -> Vec<Value> {
        vec![Value::Integer(key), Value::Text(tag.into())]
    }

    fn null_key_row(tag: &str) -> Vec<Value> {
        vec![Value::Null, Value::Text(tag.into())]
    }

    fn run(
        build: Vec<Vec<Value>>,
        probe: Vec<Vec<Value>>,
        emit: JoinEmit,
    ) -> Vec<Vec<Value>> {
        execute(
            &build,
            0,
            2,
            probe.into_iter().map(Ok),
            0,
            2,
            false,
            emit,
            None,
        )
        .unwrap()
    }

    fn counts(rows: &[Vec<Value>]) -> (usize, usize, usize) {
        let mut matched = 0;
        let mut probe_unmatched = 0;
        let mut build_unmatched = 0;
        for r in rows {
            let probe_null = r[0].is_null() && r[1].is_null();
            let build_null = r[2].is_null() && r[3].is_null();
            if probe_null {
                build_unmatched += 1;
            } else if build_null {
                probe_unmatched += 1;
            } else {
                matched += 1;
            }
        }
        (matched, probe_unmatched, build_unmatched)
    }

    fn spec_scenario(build_n: usize) {
        // Build keys 0..n; probe half the even keys plus one disjoint key.
        let build: Vec<_> = (0..build_n as i64).map(|k| row(k, "b")).collect();
        let probe: Vec<_> = (0..build_n as i64)
            .step_by(2)
            .map(|k| row(k, "p"))
            .chain(std::iter::once(row(9999999, "p")))
            .collect();
        let rows = run(build, probe, JoinEmit::full_outer());
        let half = build_n / 2;
        assert_eq!(counts(&rows), (half, 1, build_n - half));
        assert_eq!(rows.len(), half + 1 + (build_n - half));
    }

    #[test]
    fn test_tier1_full_outer() {
        spec_scenario(100);
    }

    #[test]
    fn test_tier2_full_outer() {
        spec_scenario(300);
    }

    #[test]
    fn test_tier3_full_outer() {
        spec_scenario(9000);
    }

    #[test]
    fn test_tier_equivalence_multiset() {
        // Duplicate keys on both sides; compare sorted outputs across
        // tiers by padding the build side to force each tier.
        let probe = vec![row(1, "p1"), row(1, "p2"), row(2, "p3"), null_key_row("pn")];
        let base_build = vec![row(1, "b1"), row(1, "b2"), row(3, "b3"), null_key_row("bn")];

        let render = |rows: Vec<Vec<Value>>| {
            let mut out: Vec<String> = rows
                .iter()
                .map(|r| format!("{}|{}|{}|{}", r[0], r[1], r[2], r[3]))
                .collect();
            out.sort();
            out
        };

        // Tier I as the reference.
        let reference = render(run(base_build.clone(), probe.clone(), JoinEmit::full_outer()));

        for pad in [TIER1_MAX_ROWS + 8, TIER2_MAX_ROWS + 8] {
            let mut build = base_build.clone();
            for i in 0..pad {
                build.push(row(1000 + i as i64, "pad"));
            }
            let rows = run(build, probe.clone(), JoinEmit::full_outer());
            let mut rendered = render(rows);
            // Remove the padding rows (unmatched build) for comparison.
            rendered.retain(|line| !line.contains("pad"));
            assert_eq!(rendered, reference, "padding {}", pad);
        }
    }

    #[test]
    fn test_duplicate_probe_keys_rematch_in_tier3() {
        let mut build: Vec<_> = (0..(TIER2_MAX_ROWS as i64 + 100)).map(|k| row(k, "b")).collect();
        build.push(row(5, "dup"));
        let probe = vec![row(5, "p1"), row(5, "p2")];
        let rows = run(build, probe, JoinEmit::inner());
        // Two probe rows, each matching two build rows (key 5 twice).
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_null_keys_never_match_and_null_fill() {
        let build = vec![null_key_row("b"), row(1, "b1")];
        let probe = vec![null_key_row("p"), row(2, "p2")];
        let rows = run(build, probe, JoinEmit::full_outer());
        // Everything unmatched: 2 probe-unmatched + 2 build-unmatched.
        assert_eq!(rows.len(), 4);
        for r in &rows {
            let probe_null = r[0].is_null() && r[1].is_null();
            let build_null = r[2].is_null() && r[3].is_null();
            assert!(probe_null ^ build_null);
        }
    }

    #[test]
    fn test_build_is_left_layout_only() {
        let build = vec![row(1, "b")];
        let probe = vec![row(1, "p")];
        let left_layout = execute(
            &build,
            0,
            2,
            probe.clone().into_iter().map(Ok),
            0,
            2,
            true,
            JoinEmit::full_outer(),
            None,
        )
        .unwrap();
        assert_eq!(left_layout[0][1], Value::Text("b".into()));
        assert_eq!(left_layout[0][3], Value::Text("p".into()));

        let right_layout = execute(
            &build,
            0,
            2,
            probe.into_iter().map(Ok),
            0,
            2,
            false,
            JoinEmit::full_outer(),
            None,
        )
        .unwrap();
        assert_eq!(right_layout[0][1], Value::Text("p".into()));
        assert_eq!(right_layout[0][3], Value::Text("b".into()));
    }

    #[test]
    fn test_randomized_tier_equivalence() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let probe: Vec<Vec<Value>> = (0..400)
            .map(|i| row(rng.gen_range(0..64), &format!("p{}", i)))
            .collect();
        let base: Vec<Vec<Value>> = (0..200)
            .map(|i| row(rng.gen_range(0..64), &format!("b{}", i)))
            .collect();

        let render = |rows: Vec<Vec<Value>>| {
            let mut out: Vec<String> = rows
                .iter()
                .map(|r| format!("{}|{}|{}|{}", r[0], r[1], r[2], r[3]))
                .collect();
            out.sort();
            out
        };
        let reference = render(run(base.clone(), probe.clone(), JoinEmit::full_outer()));

        for pad in [TIER1_MAX_ROWS + 1, TIER2_MAX_ROWS + 1] {
            let mut build = base.clone();
            for i in 0..pad {
                build.push(row(10_000 + i as i64, "pad"));
            }
            let mut rendered = render(run(build, probe.clone(), JoinEmit::full_outer()));
            rendered.retain(|line| !line.contains("pad"));
            assert_eq!(rendered, reference, "padding {}", pad);
        }
    }

    #[test]
    fn test_left_join_emits_probe_unmatched_only() {
        let build = vec![row(1, "b1")];
        let probe = vec![row(1, "p1"), row(2, "p2")];
        let rows = run(
            build,
            probe,
            JoinEmit {
                probe_unmatched: true,
                build_unmatched: false,
            },
        );
        assert_eq!(rows.len(), 2);
        let (matched, probe_unmatched, build_unmatched) = counts(&rows);
        assert_eq!((matched, probe_unmatched, build_unmatched), (1, 1, 0));
    }
}
