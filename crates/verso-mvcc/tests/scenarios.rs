//! End-to-end protocol scenarios: reader tracking, the old-version
//! marker, vanished readers, allocator wrap, and back-edge policies.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use verso_mvcc::{
    AbortReason, BackedgePolicy, ChainIndex, CoreConfig, CoreError, GcState, Lsn, MvccRuntime,
    Oid, OidTable,
};

fn config() -> CoreConfig {
    CoreConfig {
        segment_bits: 16, // 64 KiB segments
        num_segments_bits: 2,
        cold_capacity_segments: 2,
        trim_mark_bytes: 1 << 15,
        old_version_threshold: 100,
        ..CoreConfig::default()
    }
}

fn setup(cfg: CoreConfig) -> (Arc<MvccRuntime>, Arc<dyn ChainIndex>) {
    let runtime = MvccRuntime::new(cfg).unwrap();
    let table: Arc<dyn ChainIndex> = Arc::new(OidTable::new(64));
    runtime.register_table(Arc::clone(&table));
    (runtime, table)
}

/// Reader bitmap of the current head version of `oid`.
fn head_bitmap(table: &Arc<dyn ChainIndex>, oid: Oid) -> u64 {
    let head = table.head(oid);
    assert!(!head.is_null());
    // SAFETY: the head stays valid while the runtime is alive and no GC
    // cycle runs in these tests unless stated.
    unsafe { (*head).tuple().rl_bitmap.load(Ordering::SeqCst) }
}

#[test]
fn two_readers_set_and_clear_their_bits() {
    let (runtime, table) = setup(config());
    let writer = runtime.register_worker().unwrap();
    let reader_a = runtime.register_worker().unwrap();
    let reader_b = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = writer.begin();
    tx.write(&table, oid, b"v").unwrap();
    tx.commit().unwrap();

    let mut ta = reader_a.begin();
    let mut tb = reader_b.begin();
    assert_eq!(ta.read(&table, oid).unwrap().unwrap(), b"v");
    assert_eq!(tb.read(&table, oid).unwrap().unwrap(), b"v");

    let expected = reader_a.slot_mask() | reader_b.slot_mask();
    assert_eq!(head_bitmap(&table, oid), expected);

    ta.commit().unwrap();
    assert_eq!(head_bitmap(&table, oid), reader_b.slot_mask());
    tb.commit().unwrap();
    assert_eq!(head_bitmap(&table, oid), 0);
}

#[test]
fn rereads_deregister_cleanly() {
    // A transaction reading the same tuple several times must leave the
    // bitmap clear after one deregistration pass.
    let (runtime, table) = setup(config());
    let worker = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = worker.begin();
    tx.write(&table, oid, b"v").unwrap();
    tx.commit().unwrap();

    let mut tx = worker.begin();
    for _ in 0..3 {
        tx.read(&table, oid).unwrap().unwrap();
    }
    assert_eq!(head_bitmap(&table, oid), worker.slot_mask());
    tx.commit().unwrap();
    assert_eq!(head_bitmap(&table, oid), 0);
}

#[test]
fn old_version_reader_receives_writer_successor_bound() {
    // An old-version reader marks the tuple and stays untracked; the
    // overwriting committer hands the reader its sstamp by CAS instead
    // of aborting it.
    let (runtime, table) = setup(config());
    let loader = runtime.register_worker().unwrap();
    let reader = runtime.register_worker().unwrap();
    let writer = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = loader.begin();
    tx.write(&table, oid, b"ancient").unwrap();
    tx.commit().unwrap();

    // Make the version old relative to new snapshots.
    runtime.clock().advance_to(Lsn::new(1000));

    let mut tr = reader.begin();
    assert_eq!(tr.read(&table, oid).unwrap().unwrap(), b"ancient");
    let reader_ctx = Arc::clone(tr.ctx());
    assert!(reader_ctx.is_read_mostly(), "threshold must elect the untracked path");
    assert_eq!(reader_ctx.sstamp(), u64::MAX);

    let mut tw = writer.begin();
    tw.write(&table, oid, b"fresh").unwrap();
    let writer_ctx = Arc::clone(tw.ctx());
    tw.commit().unwrap();

    assert_eq!(
        reader_ctx.sstamp(),
        writer_ctx.sstamp(),
        "writer's successor bound transferred through the back-edge CAS"
    );

    // The reader still validates and commits: pstamp (ancient clsn) is
    // far below the transferred bound.
    tr.commit().unwrap();
}

#[test]
fn vanished_old_reader_contributes_its_slot_stamp() {
    let (runtime, table) = setup(config());
    let loader = runtime.register_worker().unwrap();
    let reader = runtime.register_worker().unwrap();
    let writer = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = loader.begin();
    tx.write(&table, oid, b"ancient").unwrap();
    tx.commit().unwrap();

    runtime.clock().advance_to(Lsn::new(1000));

    // The old-version reader commits and is gone; its bitmap bit stays
    // set because the read was never tracked.
    let reader_mask = reader.slot_mask();
    let mut tr = reader.begin();
    tr.read(&table, oid).unwrap().unwrap();
    let r_cstamp = tr.commit().unwrap();
    assert_eq!(head_bitmap(&table, oid) & reader_mask, reader_mask);

    let mut tw = writer.begin();
    tw.write(&table, oid, b"fresh").unwrap();
    let writer_ctx = Arc::clone(tw.ctx());
    tw.commit().unwrap();

    assert!(
        writer_ctx.pstamp() >= r_cstamp.offset(),
        "slot stamp {} must reach the writer's pstamp {}",
        r_cstamp,
        writer_ctx.pstamp()
    );
}

#[test]
fn old_reader_aborts_when_marker_already_locked() {
    // The writer locks the marker during its inspection window; an
    // old-version reader arriving under the lock must abort.
    let (runtime, table) = setup(config());
    let loader = runtime.register_worker().unwrap();
    let reader = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = loader.begin();
    tx.write(&table, oid, b"ancient").unwrap();
    tx.commit().unwrap();
    runtime.clock().advance_to(Lsn::new(1000));

    // Lock the marker directly, standing in for a mid-inspection writer.
    let head = table.head(oid);
    // SAFETY: head is valid while the runtime lives.
    unsafe { (*head).tuple().lock_marker() };

    let mut tr = reader.begin();
    let err = tr.read(&table, oid).unwrap_err();
    assert!(matches!(
        err,
        CoreError::SerializationAbort(AbortReason::MarkerLocked)
    ));
    tr.abort();
}

#[test]
fn should_abort_policy_aborts_the_reader_at_its_commit() {
    let (runtime, table) = setup(CoreConfig {
        backedge_policy: BackedgePolicy::ShouldAbort,
        ..config()
    });
    let loader = runtime.register_worker().unwrap();
    let reader = runtime.register_worker().unwrap();
    let writer = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = loader.begin();
    tx.write(&table, oid, b"v0").unwrap();
    tx.commit().unwrap();

    let mut tr = reader.begin();
    tr.read(&table, oid).unwrap().unwrap();

    let mut tw = writer.begin();
    tw.write(&table, oid, b"v1").unwrap();
    tw.commit().unwrap();

    let err = tr.commit().unwrap_err();
    assert!(matches!(
        err,
        CoreError::SerializationAbort(AbortReason::ShouldAbort)
    ));
    assert!(runtime.metrics().snapshot().ssn_aborts_total >= 1);
}

#[test]
fn write_write_conflict_aborts_the_second_writer() {
    let (runtime, table) = setup(config());
    let a = runtime.register_worker().unwrap();
    let b = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut ta = a.begin();
    ta.write(&table, oid, b"a").unwrap();

    let mut tb = b.begin();
    let err = tb.write(&table, oid, b"b").unwrap_err();
    assert!(matches!(
        err,
        CoreError::SerializationAbort(AbortReason::WriteConflict)
    ));
    tb.abort();
    ta.commit().unwrap();
}

#[test]
fn aborted_writer_unlinks_its_version() {
    let (runtime, table) = setup(config());
    let worker = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = worker.begin();
    tx.write(&table, oid, b"base").unwrap();
    tx.commit().unwrap();

    let mut tx = worker.begin();
    tx.write(&table, oid, b"doomed").unwrap();
    tx.abort();

    let mut tx = worker.begin();
    assert_eq!(tx.read(&table, oid).unwrap().unwrap(), b"base");
    tx.commit().unwrap();
}

#[test]
fn allocator_wraps_after_a_reclaim_cycle() {
    // Fill past segment boundaries, drive the epoch machinery, and
    // verify reclaimed_offset advances by exactly one segment per cycle
    // while allocation keeps succeeding.
    let cfg = CoreConfig {
        segment_bits: 16,
        num_segments_bits: 2,
        trim_mark_bytes: 1 << 14,
        old_version_threshold: 1 << 40,
        ..config()
    };
    let segment = cfg.segment_size();
    let (runtime, table) = setup(cfg);
    let worker = runtime.register_worker().unwrap();
    let allocator = Arc::clone(runtime.allocator(0));
    let initial_reclaimed = allocator.reclaimed_offset();

    // 1000-byte payloads round to 1072-byte objects, which do not tile a
    // segment evenly, so boundary spans actually occur.
    let payload = vec![7_u8; 1000];
    let mut cycles = 0_u64;
    let mut oid_round = 0_u64;
    // Write until we have survived two full reclamation cycles. The
    // trim-mark machinery may start a cycle on its own mid-write; this
    // loop just drives whatever state it finds to completion before the
    // next segment boundary can arrive.
    while cycles < 2 {
        let oid = Oid::new(oid_round % 8 + 1);
        oid_round += 1;
        let mut tx = worker.begin();
        tx.write(&table, oid, &payload).unwrap();
        tx.commit().unwrap();

        if allocator.state() != GcState::Normal {
            if allocator.state() == GcState::Requested {
                // First epoch closure starts the daemon.
                assert!(runtime.advance_epoch());
            }
            for _ in 0..1000 {
                if allocator.state() == GcState::Finished {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(allocator.state(), GcState::Finished, "daemon must finish the drain");
            // Second epoch closure opens the drained segment.
            assert!(runtime.advance_epoch());
            assert_eq!(allocator.state(), GcState::Normal);
            cycles += 1;
            assert_eq!(
                allocator.reclaimed_offset(),
                initial_reclaimed + cycles * segment,
                "each cycle opens exactly one segment"
            );
        }
    }

    assert!(runtime.metrics().snapshot().segments_reclaimed_total >= 2);
    assert!(runtime.trim_lsn().is_valid());

    // The surviving heads are still readable after relocation.
    let mut tx = worker.begin();
    for oid in 1..=8 {
        if let Some(data) = tx.read(&table, Oid::new(oid)).unwrap() {
            assert_eq!(data, payload);
        }
    }
    tx.commit().unwrap();
}

#[test]
fn write_skew_is_detected() {
    // T1 reads A and writes B; T2 reads B and writes A. Serializable
    // execution admits at most one of them.
    let (runtime, table) = setup(config());
    let loader = runtime.register_worker().unwrap();
    let w1 = runtime.register_worker().unwrap();
    let w2 = runtime.register_worker().unwrap();
    let (a, b) = (Oid::new(1), Oid::new(2));

    let mut tx = loader.begin();
    tx.write(&table, a, b"a0").unwrap();
    tx.write(&table, b, b"b0").unwrap();
    tx.commit().unwrap();

    let mut t1 = w1.begin();
    let mut t2 = w2.begin();
    t1.read(&table, a).unwrap().unwrap();
    t2.read(&table, b).unwrap().unwrap();
    t1.write(&table, b, b"b1").unwrap();
    t2.write(&table, a, b"a1").unwrap();

    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert!(matches!(
        err,
        CoreError::SerializationAbort(AbortReason::ExclusionWindow)
    ));

    // T2's version was unlinked; the surviving state is T1's.
    let mut tx = loader.begin();
    assert_eq!(tx.read(&table, a).unwrap().unwrap(), b"a0");
    assert_eq!(tx.read(&table, b).unwrap().unwrap(), b"b1");
    tx.commit().unwrap();
}

#[test]
fn read_only_transactions_survive_concurrent_overwrites() {
    // A snapshot reader keeps seeing its version while a writer installs
    // newer ones.
    let (runtime, table) = setup(config());
    let reader = runtime.register_worker().unwrap();
    let writer = runtime.register_worker().unwrap();
    let oid = Oid::new(1);

    let mut tx = writer.begin();
    tx.write(&table, oid, b"v1").unwrap();
    tx.commit().unwrap();

    let mut tr = reader.begin();
    assert_eq!(tr.read(&table, oid).unwrap().unwrap(), b"v1");

    let mut tw = writer.begin();
    tw.write(&table, oid, b"v2").unwrap();
    tw.commit().unwrap();

    // Same snapshot, same answer.
    assert_eq!(tr.read(&table, oid).unwrap().unwrap(), b"v1");
    tr.commit().unwrap();

    let mut tr = reader.begin();
    assert_eq!(tr.read(&table, oid).unwrap().unwrap(), b"v2");
    tr.commit().unwrap();
}
