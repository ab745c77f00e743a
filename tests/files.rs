use std::fs::OpenOptions;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};

use cachetable::{Dirty, FileCtx, FileHooks};

mod common;
use common::{test_cache, Mock, RecordingHooks, Val};

#[test]
fn same_file_opened_twice_shares_one_entry() -> Result<()> {
    let (root, ct) = test_cache("files-dedupe", 1 << 20)?;
    let a = ct.open_path("x.ct")?;
    let b = ct.open_path(root.join("x.ct"))?;
    assert_eq!(a.filenum(), b.filenum());

    let fd = OpenOptions::new().read(true).write(true).open(root.join("x.ct"))?;
    let c = ct.open_or_reuse(fd, &root.join("x.ct"))?;
    assert_eq!(c.filenum(), a.filenum());
    assert_eq!(ct.n_open_files(), 1);

    let other = ct.open_path("y.ct")?;
    assert_ne!(other.filenum(), a.filenum());
    assert_eq!(ct.n_open_files(), 2);
    let mut nums: Vec<_> = ct.open_files().iter().map(|f| f.filenum()).collect();
    nums.sort();
    assert_eq!(nums, vec![a.filenum(), other.filenum()]);
    Ok(())
}

#[test]
fn close_writes_back_and_drops_the_files_pairs_only() -> Result<()> {
    let (_root, ct) = test_cache("files-close", 1 << 20)?;
    let mock = Arc::new(Mock::new(64));
    let cbs = mock.callbacks();
    let f = ct.open_path("c.ct")?;
    let keep = ct.open_path("keep.ct")?;
    let hooks = Arc::new(RecordingHooks::default());
    ct.set_file_hooks(&f, hooks.clone());

    for key in 0..5u64 {
        let p = ct.get_and_pin(&f, key, f.fullhash(key), &cbs);
        p.with_value(|v| v.version = 10 + key);
        ct.unpin(p, Dirty::from(key % 2 == 0), None);
    }
    let p = ct.get_and_pin(&keep, 99, keep.fullhash(99), &cbs);
    ct.unpin(p, Dirty::Dirty, None);

    ct.close_file(&f)?;
    assert_eq!(hooks.events(), vec!["close"]);
    assert_eq!(ct.n_open_files(), 1);
    assert_eq!(ct.status().n_in_table, 1, "the other file's pair stays");
    assert!(ct.pair_info(&keep, 99).is_some());
    for key in [0u64, 2, 4] {
        assert_eq!(mock.on_disk(key), Some(10 + key));
    }
    for key in [1u64, 3] {
        assert_eq!(mock.on_disk(key), None, "clean pair {key} is not written");
    }
    // каждая пара файла освобождена через flush(write=false, keep=false)
    let freed = mock.flushes.lock().unwrap().iter().filter(|e| !e.write_me && !e.keep_me).count();
    assert_eq!(freed, 5);
    ct.verify();

    // повторное открытие: новый вход, данные читаются заново
    let f2 = ct.open_path("c.ct")?;
    assert_ne!(f2.filenum(), f.filenum());
    assert!(ct.pair_info(&f2, 0).is_none());
    let p = ct.get_and_pin(&f2, 0, f2.fullhash(0), &cbs);
    assert_eq!(p.with_value(|v| v.version), 10);
    ct.unpin(p, Dirty::Clean, None);
    Ok(())
}

#[test]
fn unlink_on_close_removes_the_file() -> Result<()> {
    let (root, ct) = test_cache("files-unlink", 1 << 20)?;
    let f = ct.open_path("gone.ct")?;
    let path = root.join("gone.ct");
    assert!(path.exists());
    ct.set_unlink_on_close(&f, true);
    ct.close_file(&f)?;
    assert!(!path.exists());
    assert_eq!(ct.n_open_files(), 0);

    let g = ct.open_path("stays.ct")?;
    ct.close_file(&g)?;
    assert!(root.join("stays.ct").exists());
    Ok(())
}

struct FailingClose;

impl FileHooks for FailingClose {
    fn close(&self, _file: &FileCtx) -> Result<()> {
        bail!("userdata refused to close")
    }
}

#[test]
fn close_hook_error_is_returned_after_the_file_is_gone() -> Result<()> {
    let (_root, ct) = test_cache("files-close-err", 1 << 20)?;
    let f = ct.open_path("e.ct")?;
    ct.set_file_hooks(&f, Arc::new(FailingClose));
    let err = ct.close_file(&f).expect_err("close hook failed");
    assert!(format!("{err:#}").contains("userdata refused to close"));
    assert_eq!(ct.n_open_files(), 0);
    Ok(())
}

#[test]
fn flush_file_keeps_the_file_usable() -> Result<()> {
    let (_root, ct) = test_cache("files-flush", 1 << 20)?;
    let mock = Arc::new(Mock::new(64));
    let cbs = mock.callbacks();
    let f = ct.open_path("fl.ct")?;

    for key in 0..20u64 {
        let v = Val::new(key, 64);
        let attr = v.attr();
        let p = ct.put(&f, key, f.fullhash(key), v, attr, &mock.write_cbs()).inserted().expect("inserted");
        ct.unpin(p, Dirty::Dirty, None);
    }
    ct.flush_file(&f);
    let s = ct.status();
    assert_eq!((s.n_in_table, s.size_current, s.size_evicting), (0, 0, 0));
    assert_eq!(mock.writes().len(), 20);
    assert_eq!(ct.n_open_files(), 1);

    // фоновые задачи файла снова принимаются
    assert!(ct.prefetch(&f, 3, f.fullhash(3), &cbs));
    let p = ct.get_and_pin(&f, 3, f.fullhash(3), &cbs);
    assert_eq!(p.with_value(|v| v.version), 1);
    ct.unpin(p, Dirty::Clean, None);
    assert_eq!(mock.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn closing_the_cache_closes_every_file_once() -> Result<()> {
    let (_root, mut ct) = test_cache("files-cache-close", 1 << 20)?;
    let mock = Arc::new(Mock::new(64));
    let hooks = Arc::new(RecordingHooks::default());
    for name in ["a.ct", "b.ct", "c.ct"] {
        let f = ct.open_path(name)?;
        ct.set_file_hooks(&f, hooks.clone());
        let v = Val::new(7, 64);
        let attr = v.attr();
        let p = ct.put(&f, 7, f.fullhash(7), v, attr, &mock.write_cbs()).inserted().expect("inserted");
        ct.unpin(p, Dirty::Dirty, None);
    }
    ct.close()?;
    ct.close()?;
    assert_eq!(hooks.events(), vec!["close", "close", "close"]);
    assert_eq!(mock.writes().len(), 3);
    Ok(())
}
