use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use oorandom::Rand64;

use cachetable::{Dirty, PartialEvictionCost, PutOutcome};

mod common;
use common::{test_cache, wait_until, Mock, Val};

#[test]
fn second_large_put_evicts_the_first() -> Result<()> {
    let (_root, ct) = test_cache("evict-b", 1000)?;
    let mock = Arc::new(Mock::new(600));
    let f = ct.open_path("b.ct")?;

    let v = Val::new(1, 600);
    let attr = v.attr();
    let p1 = ct.put(&f, 1, f.fullhash(1), v, attr, &mock.write_cbs()).inserted().expect("P1");
    ct.unpin(p1, Dirty::Dirty, None);

    let v = Val { version: 2, ..Val::new(2, 600) };
    let attr = v.attr();
    let p2 = ct.put(&f, 2, f.fullhash(2), v, attr, &mock.write_cbs()).inserted().expect("P2");
    ct.unpin(p2, Dirty::Dirty, None);

    // P1 грязная: выгоняется фоновой записью
    assert!(wait_until(Duration::from_secs(5), || {
        let s = ct.status();
        s.n_in_table == 1 && s.size_current == 600 && s.size_evicting == 0
    }));
    assert!(ct.pair_info(&f, 1).is_none());
    assert!(ct.pair_info(&f, 2).is_some());
    assert_eq!(mock.on_disk(1), Some(1), "dirty P1 was written before it left");
    assert!(ct.status().evictions >= 1);
    ct.verify();
    Ok(())
}

#[test]
fn clean_misses_keep_the_cache_under_its_limit() -> Result<()> {
    let (_root, ct) = test_cache("evict-limit", 1000)?;
    let mock = Arc::new(Mock::new(100));
    let cbs = mock.callbacks();
    let f = ct.open_path("l.ct")?;

    for key in 0..50u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        assert!(ct.status().size_current <= 1000, "over limit after miss of {key}");
        ct.unpin(p, Dirty::Clean, None);
    }
    let s = ct.status();
    assert!(s.n_in_table <= 10);
    assert!(s.evictions >= 40, "evictions={}", s.evictions);
    assert!(mock.writes().is_empty(), "clean pairs are dropped without a write");
    ct.verify();
    Ok(())
}

#[test]
fn fully_pinned_cache_overshoots_then_recovers() -> Result<()> {
    let (_root, ct) = test_cache("evict-pinned", 300)?;
    let mock = Arc::new(Mock::new(100));
    let cbs = mock.callbacks();
    let f = ct.open_path("pin.ct")?;

    let pinned: Vec<_> = (0..5u64).map(|k| ct.get_and_pin(&f, k, f.fullhash(k), &cbs)).collect();
    // всё занято: свип сдаётся, лимит временно превышен
    assert_eq!(ct.status().size_current, 500);
    assert_eq!(ct.count_pinned(None), 5);

    for p in pinned {
        ct.unpin(p, Dirty::Clean, None);
    }
    assert!(ct.status().size_current <= 300);
    ct.assert_all_unpinned();
    ct.verify();
    Ok(())
}

#[test]
fn random_workload_conserves_sizes_and_writes_back_last_versions() -> Result<()> {
    let (_root, ct) = test_cache("evict-random", 3000)?;
    let mock = Arc::new(Mock::new(100));
    let cbs = mock.callbacks();
    let write = mock.write_cbs();
    let f = ct.open_path("rand.ct")?;

    let mut rng = Rand64::new(0x5EED_CAFE);
    let mut model: HashMap<u64, u64> = HashMap::new();
    let mut next_version = 100u64;

    for _ in 0..2000u32 {
        let op = rng.rand_range(0..100);
        if op < 60 {
            let key = rng.rand_range(0..200);
            let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
            if rng.rand_range(0..2) == 0 {
                next_version += 1;
                let size = 10 + rng.rand_range(0..190) as i64;
                let attr = p.with_value(|v| {
                    v.version = next_version;
                    v.size = size;
                    v.attr()
                });
                model.insert(key, next_version);
                ct.unpin(p, Dirty::Dirty, Some(attr));
            } else {
                ct.unpin(p, Dirty::Clean, None);
            }
        } else if op < 80 {
            let key = 1000 + rng.rand_range(0..100);
            let v = Val::new(key, 10 + rng.rand_range(0..90) as i64);
            let attr = v.attr();
            match ct.put(&f, key, f.fullhash(key), v, attr, &write) {
                PutOutcome::Inserted(p) => ct.unpin(p, Dirty::Dirty, None),
                PutOutcome::AlreadyPresent(_) => {}
            }
        } else if op < 90 {
            let key = 1000 + rng.rand_range(0..100);
            let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
            ct.unpin_and_remove(p, None);
        } else {
            ct.checkpoint()?;
        }
        ct.verify();
    }

    assert!(wait_until(Duration::from_secs(5), || ct.status().size_evicting == 0));
    ct.verify();
    ct.flush_file(&f);
    let s = ct.status();
    assert_eq!((s.n_in_table, s.size_current), (0, 0));
    for (key, version) in &model {
        assert_eq!(mock.on_disk(*key), Some(*version), "key {key} lost its last write");
    }
    ct.verify();
    Ok(())
}

#[test]
fn cheap_partial_eviction_runs_inline() -> Result<()> {
    let (_root, ct) = test_cache("pe-cheap", 1000)?;
    let mock = Arc::new(Mock::new(400).with_partial_eviction(200, PartialEvictionCost::Cheap));
    let cbs = mock.callbacks();
    let f = ct.open_path("pe.ct")?;

    for key in 1..=3u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        ct.unpin(p, Dirty::Clean, None);
    }
    let s = ct.status();
    assert!(mock.partial_evictions.load(Ordering::SeqCst) > 0);
    assert!(s.partial_evictions_cheap > 0);
    assert_eq!(s.partial_evictions_expensive, 0);
    assert!(s.size_current <= 1000);
    ct.verify();
    Ok(())
}

#[test]
fn expensive_partial_eviction_runs_in_the_background() -> Result<()> {
    let (_root, ct) = test_cache("pe-expensive", 1000)?;
    let mock = Arc::new(Mock::new(400).with_partial_eviction(100, PartialEvictionCost::Expensive));
    let cbs = mock.callbacks();
    let f = ct.open_path("pex.ct")?;

    for key in 1..=3u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        ct.unpin(p, Dirty::Clean, None);
    }
    assert!(wait_until(Duration::from_secs(5), || {
        let s = ct.status();
        s.partial_evictions_expensive > 0 && s.size_evicting == 0
    }));
    ct.assert_all_unpinned();
    ct.verify();
    Ok(())
}

#[test]
fn reserved_memory_counts_as_resident_until_released() -> Result<()> {
    let (_root, ct) = test_cache("reserve", 1000)?;
    let mock = Arc::new(Mock::new(100));
    let cbs = mock.callbacks();
    let f = ct.open_path("res.ct")?;

    assert_eq!(ct.status().size_reserved, 250);
    for key in 0..7u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        ct.unpin(p, Dirty::Clean, None);
    }
    assert_eq!(ct.status().size_current, 700);

    let got = ct.reserve_memory(0.5);
    assert_eq!(got, 375);
    let s = ct.status();
    assert_eq!(s.size_reserved, 625);
    assert!(s.size_current <= 1000, "reservation made room first: {}", s.size_current);
    assert!(s.n_in_table < 7);
    ct.verify();

    let before = ct.status().size_current;
    ct.release_reserved_memory(got);
    let s = ct.status();
    assert_eq!(s.size_current, before - 375);
    assert_eq!(s.size_reserved, 250);
    ct.verify();
    Ok(())
}

#[test]
fn lowering_the_limit_evicts_at_once() -> Result<()> {
    let (_root, ct) = test_cache("limit-drop", 2000)?;
    let mock = Arc::new(Mock::new(100));
    let cbs = mock.callbacks();
    let f = ct.open_path("ld.ct")?;

    for key in 0..10u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        ct.unpin(p, Dirty::Clean, None);
    }
    assert_eq!(ct.status().size_current, 1000);
    ct.set_size_limit(500);
    let s = ct.status();
    assert!(s.size_current <= 500);
    assert_eq!(s.size_limit, 500);
    ct.verify();
    Ok(())
}

#[test]
fn table_grows_with_pairs_and_shrinks_after_they_leave() -> Result<()> {
    let (_root, ct) = test_cache("rehash", 1 << 30)?;
    let mock = Arc::new(Mock::new(1));
    let f = ct.open_path("rh.ct")?;

    for key in 0..100u64 {
        let v = Val::new(key, 1);
        let attr = v.attr();
        let p = ct.put(&f, key, f.fullhash(key), v, attr, &mock.write_cbs()).inserted().expect("inserted");
        ct.unpin(p, Dirty::Clean, None);
    }
    let grown = ct.status().table_size;
    assert!(grown.is_power_of_two());
    assert!(grown >= 100, "table_size={grown}");
    for key in 0..100u64 {
        assert!(ct.pair_info(&f, key).is_some(), "key {key} lost across rehash");
    }
    ct.verify();

    ct.flush_file(&f);
    assert_eq!(ct.status().n_in_table, 0);
    ct.maybe_flush_some(0);
    let shrunk = ct.status().table_size;
    assert!(shrunk < grown && shrunk.is_power_of_two(), "{grown} -> {shrunk}");
    assert_eq!(mock.writes().len(), 100, "every dirty pair written once by flush_file");
    Ok(())
}
