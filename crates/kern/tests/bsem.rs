//! Binary semaphores seen from user threads.

mod common;

use std::sync::{mpsc, Arc};

use kern::{BsemState, HostedMachine, KernelConfig, UserText, PGSIZE};

use common::TIMEOUT;

#[test]
fn pool_capacity_is_exact() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let init = text.register(move |u| {
        let handles: Vec<_> = (0..4).map(|_| u.bsem_alloc()).collect();
        let overflow = u.bsem_alloc().is_err();
        u.bsem_free(2);
        let reused = u.bsem_alloc();
        tx.send((handles, overflow, reused)).unwrap();
        common::reap_forever(u)
    });

    let config = KernelConfig::builder().ncpu(2).nbsem(4).build();
    let kernel = common::boot_with(config, Arc::new(HostedMachine::new()), text, init);
    let (handles, overflow, reused) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(handles, vec![Ok(0), Ok(1), Ok(2), Ok(3)]);
    assert!(overflow);
    assert_eq!(reused, Ok(2));
    kernel.shutdown();
}

#[test]
fn stray_operations_are_no_ops() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let init = text.register(move |u| {
        let h = u.bsem_alloc().unwrap();
        // Never locked: up leaves it unlocked and down still succeeds.
        u.bsem_up(h);
        let after_up = u.kernel().bsem_state(h);
        u.bsem_down(h);
        let after_down = u.kernel().bsem_state(h);

        for bad in [-1, 128, i32::MAX] {
            u.bsem_down(bad);
            u.bsem_up(bad);
            u.bsem_free(bad);
        }
        // Unused slot: down returns at once.
        u.bsem_down(h + 1);
        let unused = u.kernel().bsem_state(h + 1);
        tx.send((after_up, after_down, unused)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let (after_up, after_down, unused) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(after_up, Some(BsemState::Unlocked));
    assert_eq!(after_down, Some(BsemState::Locked));
    assert_eq!(unused, Some(BsemState::Unused));
    kernel.shutdown();
}

#[test]
fn down_blocks_until_up() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(4);

    let wtx = tx.clone();
    let handle = Arc::new(std::sync::OnceLock::new());

    let h = handle.clone();
    let waiter = text.register(move |u| {
        let sem = *h.get().unwrap();
        u.bsem_down(sem);
        wtx.send("acquired").unwrap();
        u.bsem_up(sem);
        u.kthread_exit(0)
    });
    let h = handle.clone();
    let init = text.register(move |u| {
        let sem = u.bsem_alloc().unwrap();
        h.set(sem).unwrap();
        u.bsem_down(sem);

        let stack = u.sbrk(PGSIZE as i64).unwrap();
        let tid = u.kthread_create(waiter, stack).unwrap();
        let _ = u.sleep(20);
        tx.send("releasing").unwrap();
        u.bsem_up(sem);
        u.kthread_join(tid, None).unwrap();
        tx.send("joined").unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let order: Vec<_> = (0..3)
        .map(|_| rx.recv_timeout(TIMEOUT).expect("report"))
        .collect();
    assert_eq!(order, ["releasing", "acquired", "joined"]);
    kernel.shutdown();
}

#[test]
fn semaphores_work_across_processes() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(2);
    let handle = Arc::new(std::sync::OnceLock::new());

    let h = handle.clone();
    let ctx = tx.clone();
    let child = text.register(move |u| {
        let sem = *h.get().unwrap();
        u.bsem_down(sem);
        ctx.send("child").unwrap();
        u.exit(0)
    });
    let h = handle.clone();
    let init = text.register(move |u| {
        let sem = u.bsem_alloc().unwrap();
        h.set(sem).unwrap();
        u.bsem_down(sem);
        u.fork(child).unwrap();
        let _ = u.sleep(10);
        tx.send("parent").unwrap();
        u.bsem_up(sem);
        u.wait(None).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("parent"), "parent");
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("child"), "child");
    kernel.shutdown();
}
