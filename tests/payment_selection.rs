mod support;

use std::sync::atomic::Ordering;

use spn_registry::types::Hash256;
use spn_registry::{ChainOps, EntrySnapshot, RegistryError};
use support::{harness, register_enabled, TestEntry, TIP};

/// 0xDEAD…BEEF as a concrete 32-byte block hash.
fn dead_beef() -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xDE;
    bytes[1] = 0xAD;
    bytes[30] = 0xBE;
    bytes[31] = 0xEF;
    Hash256(bytes)
}

#[test]
fn score_order_is_descending_and_ranks_match_positions() {
    let h = harness();
    let entries: Vec<TestEntry> = (1..=5).map(TestEntry::new).collect();
    for entry in &entries {
        register_enabled(&h, entry, 1);
    }

    let hash = dead_beef();
    let scores = h.core.scores_at(&hash, 70_208).expect("scores");
    assert_eq!(scores.len(), 5);
    for pair in scores.windows(2) {
        // descending as big-endian 256-bit integers
        assert!(pair[0].0 > pair[1].0);
    }

    let ranks = h.core.ranks_at(TIP, 70_208).expect("ranks");
    for (rank, snapshot) in &ranks {
        assert_eq!(
            h.core
                .rank_of(&snapshot.outpoint, TIP, 70_208)
                .expect("rank"),
            *rank
        );
        // the ranking at a height is the score list for that height's hash
        let block_hash = h.chain.block_hash_at(TIP).expect("hash");
        let scores = h.core.scores_at(&block_hash, 70_208).expect("scores");
        assert_eq!(scores[(*rank - 1) as usize].1, snapshot.outpoint);
    }
}

#[test]
fn ranking_requires_sync_and_known_block_hashes() {
    let h = harness();
    let entry = TestEntry::new(1);
    register_enabled(&h, &entry, 1);

    assert!(matches!(
        h.core.rank_of(&entry.outpoint, TIP + 50, 70_208),
        Err(RegistryError::BlockHashUnavailable(_))
    ));

    h.sync.list.store(false, Ordering::SeqCst);
    assert!(matches!(
        h.core.rank_of(&entry.outpoint, TIP, 70_208),
        Err(RegistryError::NotSynced(_))
    ));
}

#[test]
fn payment_selection_is_deterministic() {
    let h = harness();
    for i in 1..=12u8 {
        register_enabled(&h, &TestEntry::new(i), 1);
    }

    let first = h.core.next_for_payment(TIP, false).expect("selection");
    let second = h.core.next_for_payment(TIP, false).expect("selection");
    assert_eq!(first.0, second.0);
    assert_eq!(
        first.1.as_ref().map(|s| s.outpoint),
        second.1.as_ref().map(|s| s.outpoint)
    );
    assert!(first.1.is_some());
}

#[test]
fn small_candidate_sets_are_scored_in_full() {
    let h = harness();
    let now = h.chain.now();

    // nine mature candidates among one hundred known entries
    let mut candidates: Vec<TestEntry> = Vec::new();
    for i in 1..=100u8 {
        let entry = TestEntry::new(i);
        if i <= 9 {
            register_enabled(&h, &entry, 1);
            candidates.push(entry);
        } else {
            // fresh announcements stay PRE_ENABLED and out of the queue
            let broadcast = entry.broadcast(&h.chain, now - 120, now - 100);
            h.core
                .check_and_update_broadcast(Some((1, entry.addr)), broadcast)
                .expect("announcement accepted");
        }
    }
    h.core.check();

    let (considered, winner) = h.core.next_for_payment(TIP, false).expect("selection");
    assert_eq!(considered, 9);

    // floor(100 / 10) = 10 >= 9, so every candidate is scored and the
    // highest score wins
    let block_hash = h.chain.block_hash_at(TIP - 101).expect("hash");
    let expected = candidates
        .iter()
        .map(|entry| {
            let snapshot = h.core.get(&entry.outpoint).expect("entry");
            (snapshot.calculate_score(&block_hash), entry.outpoint)
        })
        .max()
        .expect("nine candidates")
        .1;
    assert_eq!(winner.expect("winner").outpoint, expected);
}

#[test]
fn only_the_oldest_tenth_of_the_queue_is_eligible() {
    let h = harness();
    let now = h.chain.now();

    let mut candidates: Vec<TestEntry> = Vec::new();
    for i in 1..=100u8 {
        let entry = TestEntry::new(i);
        if i <= 20 {
            register_enabled(&h, &entry, 1);
            candidates.push(entry);
        } else {
            let broadcast = entry.broadcast(&h.chain, now - 120, now - 100);
            h.core
                .check_and_update_broadcast(Some((1, entry.addr)), broadcast)
                .expect("announcement accepted");
        }
    }
    h.core.check();

    // rank the twenty candidates by score, then push the best scorer to
    // the back of the payment queue so the tenth-slice must exclude it
    let block_hash = h.chain.block_hash_at(TIP - 101).expect("hash");
    let mut by_score: Vec<(Hash256, spn_registry::OutPoint)> = candidates
        .iter()
        .map(|entry| {
            let snapshot = h.core.get(&entry.outpoint).expect("entry");
            (snapshot.calculate_score(&block_hash), entry.outpoint)
        })
        .collect();
    by_score.sort();
    let top_scorer = by_score.last().expect("candidates").1;

    {
        let mut paid_block = 1u64;
        for entry in &candidates {
            let block = if entry.outpoint == top_scorer {
                50
            } else {
                paid_block += 1;
                paid_block
            };
            h.payments
                .last_paid
                .lock()
                .insert(entry.outpoint, (block, now - 1_000));
        }
    }
    h.core.update_last_paid();

    let (considered, winner) = h.core.next_for_payment(TIP, false).expect("selection");
    assert_eq!(considered, 20);
    let winner = winner.expect("winner");
    assert_ne!(winner.outpoint, top_scorer);

    // replicate the window: ten oldest by last-paid, best score among them
    let mut queue: Vec<EntrySnapshot> = candidates
        .iter()
        .map(|entry| h.core.get(&entry.outpoint).expect("entry"))
        .collect();
    queue.sort_by_key(|s| (s.last_paid_block, s.outpoint));
    let expected = queue[..10]
        .iter()
        .map(|s| (s.calculate_score(&block_hash), s.outpoint))
        .max()
        .expect("window")
        .1;
    assert_eq!(winner.outpoint, expected);
}

#[test]
fn sig_time_filter_relaxes_when_too_few_candidates_remain() {
    let h = harness();
    let now = h.chain.now();

    for i in 1..=3u8 {
        let entry = TestEntry::new(i);
        // announced moments ago, pinged far enough after the announcement
        let broadcast = entry.broadcast(&h.chain, now - 150, now + 460);
        h.core
            .check_and_update_broadcast(Some((1, entry.addr)), broadcast)
            .expect("announcement accepted");
    }
    h.core.check();

    // with the filter active every candidate is too young, so selection
    // falls back to the unfiltered queue instead of stalling
    let (considered, winner) = h.core.next_for_payment(TIP, true).expect("selection");
    assert_eq!(considered, 3);
    assert!(winner.is_some());
}

#[test]
fn payment_selection_requires_winner_sync_and_score_hash() {
    let h = harness();
    register_enabled(&h, &TestEntry::new(1), 1);

    assert!(matches!(
        h.core.next_for_payment(90, false),
        Err(RegistryError::BlockHashUnavailable(_))
    ));

    h.sync.winners.store(false, Ordering::SeqCst);
    assert!(matches!(
        h.core.next_for_payment(TIP, false),
        Err(RegistryError::NotSynced(_))
    ));
}
