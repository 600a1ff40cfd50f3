mod support;

use spn_registry::messages::WireMessage;
use spn_registry::EntryState;
use support::{harness, register_enabled, TestEntry};

/// An entry stuck in NEW_START_REQUIRED is revived once a quorum of peers
/// replies with the same fresher announcement before the deadline.
#[test]
fn recovery_quorum_revives_a_new_start_required_entry() {
    let h = harness();
    let now = h.chain.now();

    // a healthy population to pick recovery peers from
    let peers: Vec<TestEntry> = (1..=11).map(TestEntry::new).collect();
    for (i, entry) in peers.iter().enumerate() {
        register_enabled(&h, entry, i as u64 + 1);
        h.net.connect(i as u64 + 1, entry.addr);
    }

    // the casualty has not pinged for hours
    let lost = TestEntry::new(50);
    let stale = lost.broadcast(&h.chain, now - 20_000, now - 11_000);
    let stale_ping_time = now - 11_000;
    h.core
        .check_and_update_broadcast(Some((99, lost.addr)), stale)
        .expect("stale announcement accepted");
    h.core.check();
    assert_eq!(
        h.core.get(&lost.outpoint).expect("entry").state,
        EntryState::NewStartRequired
    );

    // housekeeping schedules recovery requests against ranked peers
    h.core.check_and_remove();
    assert!(h.core.get(&lost.outpoint).is_some());

    // the connection manager drains one scheduled batch into a GETDATA
    h.net.clear_sent();
    h.core.process_pending_recovery_requests();
    let getdata_sent = h
        .net
        .sent
        .lock()
        .iter()
        .any(|(_, m)| matches!(m, WireMessage::GetData(_)));
    assert!(getdata_sent);

    // every asked peer replies with the same announcement carrying a
    // fresher ping; the duplicate path counts them as good replies
    let fresher_ping = now - 100;
    for (i, entry) in peers.iter().enumerate() {
        let mut reply = lost.broadcast(&h.chain, now - 20_000, fresher_ping);
        assert!(reply.last_ping.as_ref().map(|p| p.sig_time) > Some(stale_ping_time));
        reply.f_recovery = false;
        let accepted = h
            .core
            .check_and_update_broadcast(Some((i as u64 + 1, entry.addr)), reply)
            .expect("duplicate accepted");
        assert!(!accepted, "duplicate announcements report seen");
    }

    // past the reply deadline the quorum settles and the newest good
    // reply is reprocessed with the recovery flag
    h.chain.advance_time(61);
    h.core.check_and_remove();

    let revived = h.core.get(&lost.outpoint).expect("entry survived");
    assert_eq!(revived.state, EntryState::Enabled);
    assert_eq!(revived.last_ping_time, fresher_ping);
}

/// Without enough good replies the entry stays in NEW_START_REQUIRED.
#[test]
fn recovery_without_quorum_changes_nothing() {
    let mut config = spn_registry::RegistryConfig::default();
    config.recovery_quorum_required = 6;
    let h = support::harness_with(config);
    let now = h.chain.now();

    let peers: Vec<TestEntry> = (1..=11).map(TestEntry::new).collect();
    for (i, entry) in peers.iter().enumerate() {
        register_enabled(&h, entry, i as u64 + 1);
        h.net.connect(i as u64 + 1, entry.addr);
    }

    let lost = TestEntry::new(50);
    let stale = lost.broadcast(&h.chain, now - 20_000, now - 11_000);
    h.core
        .check_and_update_broadcast(Some((99, lost.addr)), stale)
        .expect("stale announcement accepted");
    h.core.check();
    h.core.check_and_remove();

    // only two peers answer: quorum missed
    let fresher_ping = now - 100;
    for (i, entry) in peers.iter().take(2).enumerate() {
        let reply = lost.broadcast(&h.chain, now - 20_000, fresher_ping);
        h.core
            .check_and_update_broadcast(Some((i as u64 + 1, entry.addr)), reply)
            .expect("duplicate accepted");
    }

    h.chain.advance_time(61);
    h.core.check_and_remove();

    assert_eq!(
        h.core.get(&lost.outpoint).expect("entry").state,
        EntryState::NewStartRequired
    );
}

/// Pending recovery batches that never see a connection are dropped after
/// the request timeout.
#[test]
fn pending_recovery_batches_time_out() {
    let h = harness();
    let now = h.chain.now();

    let peers: Vec<TestEntry> = (1..=11).map(TestEntry::new).collect();
    for (i, entry) in peers.iter().enumerate() {
        register_enabled(&h, entry, i as u64 + 1);
        // deliberately no net.connect: the peers never come up
    }

    let lost = TestEntry::new(50);
    let stale = lost.broadcast(&h.chain, now - 20_000, now - 11_000);
    h.core
        .check_and_update_broadcast(Some((99, lost.addr)), stale)
        .expect("stale announcement accepted");
    h.core.check();
    h.core.check_and_remove();

    h.core.process_pending_recovery_requests();
    assert!(!h.net.pending_peers.lock().is_empty());

    h.chain.advance_time(16);
    h.core.process_pending_recovery_requests();
    // no GETDATA was ever sent and nothing is left pending
    assert!(h
        .net
        .sent
        .lock()
        .iter()
        .all(|(_, m)| !matches!(m, WireMessage::GetData(_))));
}
