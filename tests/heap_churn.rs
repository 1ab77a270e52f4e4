use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strata_vtm::engine::EngineConfig;
use strata_vtm::segment::SegmentManagerConfig;
use strata_vtm::EventSourcingSegmentManager;

#[test]
fn heap_allocations_survive_interleaved_free_and_reuse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = EventSourcingSegmentManager::create(
        dir.path(),
        "churn",
        EngineConfig {
            segment: SegmentManagerConfig { segment_size: 1 << 16 },
            worker_threads: 2,
        },
    )
    .expect("create");

    let mut rng = StdRng::seed_from_u64(7);
    let mut live: Vec<(strata_vtm::FarAddr, Vec<u8>)> = Vec::new();

    for round in 0..500u32 {
        let size = rng.gen_range(16..=512);
        let addr = engine.allocate(size).expect("allocate");
        let pattern: Vec<u8> = (0..size).map(|b| (b ^ round as u32) as u8).collect();
        let txn = engine.begin_transaction().expect("begin");
        let chunk = engine.writable_block(&txn, addr, size).expect("writable");
        chunk.write(0, &pattern);
        engine.commit(txn).expect("commit");
        live.push((addr, pattern));

        if live.len() > 8 && round % 3 == 0 {
            let (addr, _) = live.remove(0);
            engine.deallocate(addr).expect("deallocate");
        }
    }

    for (addr, pattern) in &live {
        let chunk = engine.readonly_block(None, *addr, pattern.len() as u32).expect("readonly");
        assert_eq!(chunk.as_slice(), pattern.as_slice());
    }
}
