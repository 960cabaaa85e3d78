//! End-to-end scenarios over the whole engine: transaction lifecycle,
//! rollback, snapshot reads, purge ordering, and crash recovery, driven
//! through the public [`TransactionSystem`] surface the way an execution
//! layer would drive it.

use std::sync::Arc;

use quarry_error::QuarryError;
use quarry_mvcc::{
    implicit_lock_holder, read_row, row_purge_step, ColumnChange, CommitEvent, IndexDef,
    MvccConfig, PrevInfo, PurgeOutcome, ReadView, TableSchema, TransactionSystem, Trx,
    TrxState, UndoRec, UndoRecKind, UndoTablespace,
};
use quarry_types::{IndexEntry, RollPtr, RowImage, RsegId, TableId, TrxNo, UndoNo, UpdateVector, Value};

const T_PEOPLE: TableId = 7;
const IX_NAME: u64 = 100;

fn test_config() -> MvccConfig {
    MvccConfig {
        n_rsegs: 1,
        purge_low_watermark: 0,
        truncate_cadence: 1,
        delete_backoff_ms: 1,
        ..MvccConfig::default()
    }
}

fn people_schema() -> TableSchema {
    TableSchema {
        id: T_PEOPLE,
        name: "people".into(),
        pk_cols: vec![0],
        secondaries: vec![IndexDef {
            id: IX_NAME,
            name: "ix_people_name".into(),
            key_cols: vec![1],
        }],
    }
}

fn new_sys() -> TransactionSystem {
    let sys = TransactionSystem::new(test_config()).unwrap();
    sys.table_store().create_table(people_schema()).unwrap();
    sys
}

fn int(v: i64) -> Value {
    Value::Integer(v)
}

fn text(s: &str) -> Value {
    Value::Text(s.into())
}

fn row(id: i64, name: &str) -> RowImage {
    RowImage::new(vec![int(id), text(name)])
}

fn pk(id: i64) -> Vec<Value> {
    vec![int(id)]
}

fn set_name(name: &str) -> Vec<ColumnChange> {
    vec![ColumnChange { col_no: 1, value: text(name) }]
}

/// Drain the history list; stops early if the purge floor blocks progress.
fn purge_all(sys: &TransactionSystem) {
    while sys.history_len() > 0 {
        if sys.purge_run_batch(64).unwrap() == 0 {
            break;
        }
    }
}

fn name_entry(sys: &TransactionSystem, name: &str) -> Option<bool> {
    let table = sys.table_store().table(T_PEOPLE).unwrap();
    let entries = table.sec_entries(IX_NAME);
    entries
        .iter()
        .find(|e| e.key == vec![text(name)])
        .map(|e| e.del_marked)
}

#[test]
fn test_rollback_undoes_insert_and_update() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut trx = sys.begin().unwrap();
    sys.insert_row(&mut trx, T_PEOPLE, row(1, "ada")).unwrap();
    sys.update_row(&mut trx, T_PEOPLE, &pk(1), &set_name("augusta")).unwrap();
    assert!(table.read_clustered(&pk(1)).is_some());

    let event = sys.rollback(&mut trx, None).unwrap();
    assert!(matches!(event, CommitEvent::RolledBack { to, .. } if to == UndoNo::ZERO));
    assert_eq!(trx.state, TrxState::NotStarted);
    assert!(!sys.is_active(trx.id));

    assert!(table.read_clustered(&pk(1)).is_none());
    assert!(table.sec_entries(IX_NAME).is_empty());
    // Emptied logs never reach the history list.
    assert_eq!(sys.history_len(), 0);
}

#[test]
fn test_partial_rollback_to_savepoint() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut trx = sys.begin().unwrap();
    sys.insert_row(&mut trx, T_PEOPLE, row(1, "ada")).unwrap();
    let sp = trx.savepoint();
    sys.insert_row(&mut trx, T_PEOPLE, row(2, "brian")).unwrap();
    sys.update_row(&mut trx, T_PEOPLE, &pk(1), &set_name("augusta")).unwrap();

    let event = sys.rollback(&mut trx, Some(sp)).unwrap();
    assert!(matches!(event, CommitEvent::RolledBack { .. }));
    // The transaction stays open at the savepoint.
    assert_eq!(trx.state, TrxState::Active);
    assert!(sys.is_active(trx.id));
    assert!(table.read_clustered(&pk(2)).is_none());
    assert_eq!(
        table.read_clustered(&pk(1)).unwrap().row.cols[1],
        text("ada")
    );

    sys.commit(&mut trx).unwrap();
    let view = sys.open_view(None);
    assert_eq!(
        read_row(&sys, &table, &pk(1), &view).unwrap().unwrap().cols[1],
        text("ada")
    );
    assert_eq!(read_row(&sys, &table, &pk(2), &view).unwrap(), None);
    // Only insert undo was left after the partial rollback.
    assert_eq!(sys.history_len(), 0);
}

#[test]
fn test_snapshot_read_skips_uncommitted_and_later_writers() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    sys.update_row(&mut t2, T_PEOPLE, &pk(1), &set_name("augusta")).unwrap();
    sys.commit(&mut t2).unwrap();

    // t3 is still running when the view opens.
    let mut t3 = sys.begin().unwrap();
    let view = sys.open_view(None);
    sys.update_row(&mut t3, T_PEOPLE, &pk(1), &set_name("countess")).unwrap();

    // The current record carries t3's change; the view resolves t2's.
    assert_eq!(
        table.read_clustered(&pk(1)).unwrap().row.cols[1],
        text("countess")
    );
    assert_eq!(
        read_row(&sys, &table, &pk(1), &view).unwrap().unwrap().cols[1],
        text("augusta")
    );

    sys.commit(&mut t3).unwrap();
    // Committing does not change what the existing view resolves.
    assert_eq!(
        read_row(&sys, &table, &pk(1), &view).unwrap().unwrap().cols[1],
        text("augusta")
    );
}

#[test]
fn test_own_writes_visible_through_creator_view() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut trx = sys.begin().unwrap();
    sys.insert_row(&mut trx, T_PEOPLE, row(1, "ada")).unwrap();

    let own = sys.open_view(Some(&trx));
    assert!(read_row(&sys, &table, &pk(1), &own).unwrap().is_some());

    let other = sys.open_view(None);
    assert_eq!(read_row(&sys, &table, &pk(1), &other).unwrap(), None);
    sys.rollback(&mut trx, None).unwrap();
}

#[test]
fn test_delete_is_a_mark_until_purge() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut t1).unwrap();

    let before = sys.open_view(None);
    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.commit(&mut t2).unwrap();

    // Physically still there, logically gone for new readers.
    assert!(table.read_clustered(&pk(1)).unwrap().hdr.del_marked);
    assert_eq!(name_entry(&sys, "ada"), Some(true));
    let after = sys.open_view(None);
    assert_eq!(read_row(&sys, &table, &pk(1), &after).unwrap(), None);
    // The pre-delete view still resolves the row.
    assert!(read_row(&sys, &table, &pk(1), &before).unwrap().is_some());

    drop(before);
    purge_all(&sys);
    assert!(table.read_clustered(&pk(1)).is_none());
    assert_eq!(name_entry(&sys, "ada"), None);
    assert_eq!(sys.history_len(), 0);
}

#[test]
fn test_purge_respects_oldest_open_view() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t0 = sys.begin().unwrap();
    sys.insert_row(&mut t0, T_PEOPLE, row(1, "a")).unwrap();
    sys.commit(&mut t0).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.update_row(&mut t1, T_PEOPLE, &pk(1), &set_name("b")).unwrap();
    sys.commit(&mut t1).unwrap();

    // A reader opens between the two committed updates and stays open.
    let held: Arc<ReadView> = sys.open_view(None);

    let mut t2 = sys.begin().unwrap();
    sys.update_row(&mut t2, T_PEOPLE, &pk(1), &set_name("c")).unwrap();
    sys.commit(&mut t2).unwrap();
    assert_eq!(sys.history_len(), 2);

    // Only t1's history is below the floor; its pre-image entry "a" goes,
    // while "b" must survive for the held reader.
    assert!(sys.purge_run_batch(64).unwrap() > 0);
    assert_eq!(sys.history_len(), 1);
    assert_eq!(name_entry(&sys, "a"), None);
    assert_eq!(name_entry(&sys, "b"), Some(true));
    assert_eq!(
        read_row(&sys, &table, &pk(1), &held).unwrap().unwrap().cols[1],
        text("b")
    );

    drop(held);
    purge_all(&sys);
    assert_eq!(sys.history_len(), 0);
    assert_eq!(name_entry(&sys, "b"), None);
    assert_eq!(name_entry(&sys, "c"), Some(false));
}

#[test]
fn test_one_history_entry_per_committed_update_trx() {
    let sys = new_sys();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut t1).unwrap();
    // Insert-only transactions never enter history.
    assert_eq!(sys.history_len(), 0);

    let mut t2 = sys.begin().unwrap();
    sys.update_row(&mut t2, T_PEOPLE, &pk(1), &set_name("b")).unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.commit(&mut t2).unwrap();
    // Two records, one log, one entry.
    assert_eq!(sys.history_len(), 1);

    purge_all(&sys);
    assert_eq!(sys.history_len(), 0);
}

#[test]
fn test_reinsert_over_delete_marked_key() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "bob")).unwrap();
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.insert_row(&mut t2, T_PEOPLE, row(1, "robert")).unwrap();
    sys.commit(&mut t2).unwrap();

    let view = sys.open_view(None);
    assert_eq!(
        read_row(&sys, &table, &pk(1), &view).unwrap().unwrap().cols[1],
        text("robert")
    );
    assert_eq!(name_entry(&sys, "bob"), Some(true));
    assert_eq!(name_entry(&sys, "robert"), Some(false));

    drop(view);
    purge_all(&sys);
    assert_eq!(name_entry(&sys, "bob"), None);
    assert_eq!(name_entry(&sys, "robert"), Some(false));
    assert_eq!(table.sec_entries(IX_NAME).len(), 1);
}

#[test]
fn test_rollback_of_reinsert_restores_delete_mark_then_row() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "bob")).unwrap();
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.insert_row(&mut t2, T_PEOPLE, row(1, "robert")).unwrap();
    sys.rollback(&mut t2, None).unwrap();

    let rec = table.read_clustered(&pk(1)).unwrap();
    assert_eq!(rec.row.cols[1], text("bob"));
    assert!(!rec.hdr.del_marked);
    assert_eq!(name_entry(&sys, "bob"), Some(false));
    assert_eq!(name_entry(&sys, "robert"), None);
}

#[test]
fn test_duplicate_key_and_immutable_pk_rejected() {
    let sys = new_sys();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    assert!(matches!(
        sys.insert_row(&mut t2, T_PEOPLE, row(1, "dup")),
        Err(QuarryError::DuplicateKey { table: T_PEOPLE })
    ));
    assert!(matches!(
        sys.update_row(
            &mut t2,
            T_PEOPLE,
            &pk(1),
            &[ColumnChange { col_no: 0, value: int(9) }]
        ),
        Err(QuarryError::ImmutableKey { table: T_PEOPLE })
    ));
    assert!(matches!(
        sys.update_row(&mut t2, T_PEOPLE, &pk(5), &set_name("x")),
        Err(QuarryError::RowNotFound { table: T_PEOPLE })
    ));
    sys.rollback(&mut t2, None).unwrap();
}

#[test]
fn test_purge_step_is_idempotent_and_frees_externs() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "bob")).unwrap();
    let t1_id = t1.id;
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.commit(&mut t2).unwrap();

    let ext = sys.register_extern();
    let slot_ptr = table.read_clustered(&pk(1)).unwrap().hdr.roll_ptr;
    let rec = UndoRec::modify(
        UndoRecKind::DelMark,
        UndoNo::ZERO,
        T_PEOPLE,
        pk(1),
        PrevInfo {
            trx_id: t1_id,
            roll_ptr: RollPtr::new(true, RsegId::new(0).unwrap(), 0, 0),
            update: UpdateVector::new(),
        },
        vec![ext],
    );

    assert_eq!(row_purge_step(&sys, &rec, slot_ptr).unwrap(), PurgeOutcome::Applied);
    assert!(table.read_clustered(&pk(1)).is_none());
    assert_eq!(name_entry(&sys, "bob"), None);
    assert!(!sys.extern_exists(ext));

    // A replay of the same record finds nothing left to do.
    assert_eq!(row_purge_step(&sys, &rec, slot_ptr).unwrap(), PurgeOutcome::Stale);
}

#[test]
fn test_purge_delete_falls_back_to_pessimistic() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "carol")).unwrap();
    sys.commit(&mut t1).unwrap();
    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.commit(&mut t2).unwrap();

    table.inject_restructure(1);
    purge_all(&sys);
    assert_eq!(name_entry(&sys, "carol"), None);
    assert!(table.read_clustered(&pk(1)).is_none());
}

#[test]
fn test_purge_delete_retries_exhaust() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "dave")).unwrap();
    let t1_id = t1.id;
    sys.commit(&mut t1).unwrap();
    let mut t2 = sys.begin().unwrap();
    sys.delete_row(&mut t2, T_PEOPLE, &pk(1)).unwrap();
    sys.commit(&mut t2).unwrap();

    let slot_ptr = table.read_clustered(&pk(1)).unwrap().hdr.roll_ptr;
    let rec = UndoRec::modify(
        UndoRecKind::DelMark,
        UndoNo::ZERO,
        T_PEOPLE,
        pk(1),
        PrevInfo {
            trx_id: t1_id,
            roll_ptr: RollPtr::new(true, RsegId::new(0).unwrap(), 0, 0),
            update: UpdateVector::new(),
        },
        Vec::new(),
    );

    // Every optimistic attempt demands a restructure and every pessimistic
    // attempt runs out of space.
    table.inject_restructure(16);
    table.inject_delete_oom(16);
    assert!(matches!(
        row_purge_step(&sys, &rec, slot_ptr),
        Err(QuarryError::RetriesExhausted { attempts: 3 })
    ));
}

#[test]
fn test_missing_history_surfaces_for_stale_view() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "a")).unwrap();
    sys.commit(&mut t1).unwrap();
    let mut t2 = sys.begin().unwrap();
    sys.update_row(&mut t2, T_PEOPLE, &pk(1), &set_name("b")).unwrap();
    let t2_id = t2.id;
    sys.commit(&mut t2).unwrap();

    purge_all(&sys);
    assert_eq!(sys.history_len(), 0);

    // A view that predates t2 but was never registered with the system
    // cannot hold the purge floor; walking past the purged record fails
    // loudly instead of returning a wrong version.
    let stale = ReadView::new(t2_id, Vec::new(), TrxNo::new(1), None);
    assert!(matches!(
        read_row(&sys, &table, &pk(1), &stale),
        Err(QuarryError::MissingHistory { .. })
    ));
}

#[test]
fn test_implicit_lock_follows_the_uncommitted_writer() {
    let sys = new_sys();
    let table = sys.table_store().table(T_PEOPLE).unwrap();
    let def = table.schema.secondaries[0].clone();

    let mut trx = sys.begin().unwrap();
    sys.insert_row(&mut trx, T_PEOPLE, row(1, "ada")).unwrap();
    let entry = IndexEntry { key: vec![text("ada")], pk: pk(1) };

    // The inserter owns its fresh entry for as long as it stays active.
    assert_eq!(
        implicit_lock_holder(&sys, &table, &def, &entry, false).unwrap(),
        Some(trx.id)
    );
    sys.commit(&mut trx).unwrap();
    assert_eq!(
        implicit_lock_holder(&sys, &table, &def, &entry, false).unwrap(),
        None
    );

    // A deleter owns the entry it delete-marked.
    let mut del = sys.begin().unwrap();
    sys.delete_row(&mut del, T_PEOPLE, &pk(1)).unwrap();
    assert_eq!(
        implicit_lock_holder(&sys, &table, &def, &entry, true).unwrap(),
        Some(del.id)
    );
    sys.rollback(&mut del, None).unwrap();
}

#[test]
fn test_commit_events_reach_subscribers() {
    let sys = new_sys();
    let events = sys.subscribe();

    let mut t1 = sys.begin().unwrap();
    sys.insert_row(&mut t1, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut t1).unwrap();

    let mut t2 = sys.begin().unwrap();
    sys.commit(&mut t2).unwrap();

    let mut t3 = sys.begin().unwrap();
    sys.insert_row(&mut t3, T_PEOPLE, row(2, "brian")).unwrap();
    sys.rollback(&mut t3, None).unwrap();

    match events.try_recv().unwrap() {
        CommitEvent::Committed { trx_id, trx_no } => {
            assert_eq!(trx_id, t1.id);
            assert!(trx_no.is_some());
        }
        other => panic!("unexpected event {other:?}"),
    }
    match events.try_recv().unwrap() {
        // Read-only commits skip serialization.
        CommitEvent::Committed { trx_id, trx_no } => {
            assert_eq!(trx_id, t2.id);
            assert_eq!(trx_no, None);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        events.try_recv().unwrap(),
        CommitEvent::RolledBack { .. }
    ));
}

#[test]
fn test_recovery_rolls_back_active_and_resurrects_prepared() {
    let cfg = test_config();
    let sys = TransactionSystem::new(cfg.clone()).unwrap();
    sys.table_store().create_table(people_schema()).unwrap();

    // A committed updater leaves one history entry behind.
    let mut committed = sys.begin().unwrap();
    sys.insert_row(&mut committed, T_PEOPLE, row(1, "ada")).unwrap();
    sys.commit(&mut committed).unwrap();
    let mut committed2 = sys.begin().unwrap();
    sys.update_row(&mut committed2, T_PEOPLE, &pk(1), &set_name("augusta")).unwrap();
    sys.commit(&mut committed2).unwrap();

    // One transaction dies mid-flight, one stops at prepare.
    let mut active = sys.begin().unwrap();
    sys.insert_row(&mut active, T_PEOPLE, row(2, "brian")).unwrap();
    sys.update_row(&mut active, T_PEOPLE, &pk(2), &set_name("kernighan")).unwrap();

    let mut prepared = sys.begin().unwrap();
    sys.insert_row(&mut prepared, T_PEOPLE, row(3, "carol")).unwrap();
    sys.prepare(&mut prepared, b"xa-42").unwrap();

    let pages = sys.tablespace().snapshot();
    let space = UndoTablespace::from_snapshot(cfg.space_max_pages, pages);
    let (sys2, report) = TransactionSystem::recover(cfg, space).unwrap();

    assert_eq!(report.rolled_back, vec![active.id]);
    assert_eq!(report.prepared, vec![prepared.id]);
    assert_eq!(report.history_entries, 1);
    assert_eq!(sys2.history_len(), 1);

    let mut survivors: Vec<Trx> = sys2.recovered_prepared();
    assert_eq!(survivors.len(), 1);
    let survivor = &mut survivors[0];
    assert_eq!(survivor.id, prepared.id);
    assert_eq!(survivor.state, TrxState::Prepared);
    assert_eq!(survivor.xid.as_deref(), Some(&b"xa-42"[..]));

    // Identifiers keep ascending past everything the old incarnation used.
    let fresh = sys2.begin().unwrap();
    assert!(fresh.id > prepared.id);
    assert!(fresh.id > active.id);

    // The resurrected branch can still decide its fate.
    sys2.commit(survivor).unwrap();
    assert!(!sys2.is_active(prepared.id));

    // The reloaded history is purgeable even though the row store is gone.
    purge_all(&sys2);
    assert_eq!(sys2.history_len(), 0);
}

#[test]
fn test_concurrent_commits_keep_history_in_commit_order() {
    use std::sync::Barrier;

    const WRITERS: usize = 8;
    const ROUNDS: usize = 24;

    let sys = Arc::new(new_sys());
    {
        let mut setup = sys.begin().unwrap();
        for i in 0..WRITERS as i64 {
            sys.insert_row(&mut setup, T_PEOPLE, row(i, "seed")).unwrap();
        }
        sys.commit(&mut setup).unwrap();
    }

    // All writers share the single rollback segment and commit through the
    // same barrier, so serialization-number assignment and the history
    // insertion race if they are not one atomic unit.
    for round in 0..ROUNDS {
        let barrier = Arc::new(Barrier::new(WRITERS));
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let sys = Arc::clone(&sys);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut trx = sys.begin().unwrap();
                    sys.update_row(
                        &mut trx,
                        T_PEOPLE,
                        &pk(i as i64),
                        &set_name(&format!("r{round}")),
                    )
                    .unwrap();
                    barrier.wait();
                    sys.commit(&mut trx).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // One history entry per committed update, drained in order.
        assert_eq!(sys.history_len(), WRITERS);
        purge_all(&sys);
        assert_eq!(sys.history_len(), 0);
    }

    let view = sys.open_view(None);
    let table = sys.table_store().table(T_PEOPLE).unwrap();
    let last = format!("r{}", ROUNDS - 1);
    for i in 0..WRITERS as i64 {
        let seen = read_row(&sys, &table, &pk(i), &view).unwrap().unwrap();
        assert_eq!(seen.cols[1], text(&last));
    }
}
