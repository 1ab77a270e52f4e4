use std::sync::Arc;
use std::thread;

use strata_vtm::engine::EngineConfig;
use strata_vtm::segment::SegmentManagerConfig;
use strata_vtm::EventSourcingSegmentManager;

fn config() -> EngineConfig {
    EngineConfig {
        segment: SegmentManagerConfig { segment_size: 65536 },
        worker_threads: 2,
    }
}

#[test]
fn single_writer_echo_survives_close_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    let addr = {
        let engine = EventSourcingSegmentManager::create(dir.path(), "echo", config()).expect("create");
        let addr = engine.allocate(128).expect("allocate");
        let txn = engine.begin_transaction().expect("begin");
        let chunk = engine.writable_block(&txn, addr, 128).expect("writable");
        chunk.write(0, b"round trip payload that survives a restart");
        engine.commit(txn).expect("commit");
        engine.flush().expect("flush");
        addr
    };

    let engine = EventSourcingSegmentManager::open(dir.path(), "echo", config()).expect("reopen");
    let chunk = engine.readonly_block(None, addr, 128).expect("readonly");
    assert_eq!(&chunk.as_slice()[..43], b"round trip payload that survives a restart");
}

#[test]
fn concurrent_writers_surface_conflict_with_lock_details() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(EventSourcingSegmentManager::create(dir.path(), "conflict", config()).expect("create"));
    let addr = engine.allocate(64).expect("allocate");

    let holder = Arc::clone(&engine);
    let holder_thread = thread::spawn(move || {
        let txn = holder.begin_transaction().expect("begin");
        let chunk = holder.writable_block(&txn, addr, 64).expect("writable");
        chunk.write(0, &[0x11; 64]);
        thread::sleep(std::time::Duration::from_millis(60));
        holder.commit(txn).expect("commit");
    });

    thread::sleep(std::time::Duration::from_millis(15));
    let conflict = Arc::clone(&engine);
    let err = thread::spawn(move || {
        let txn = conflict.begin_transaction().expect("begin");
        conflict.writable_block(&txn, addr, 64)
    })
    .join()
    .expect("join");

    match err {
        Err(strata_vtm::Error::ConcurrentLock(info)) => {
            assert_eq!(info.locked_pos, addr.raw());
            assert_eq!(info.locked_len, 64);
        }
        other => panic!("expected a concurrent lock conflict, got {other:?}"),
    }
    holder_thread.join().expect("holder thread");
}
