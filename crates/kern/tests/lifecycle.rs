//! Process and thread lifecycle: fork, exit, wait, kthread create/join.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use kern::hosted::ROOT_DIR;
use kern::{HostedMachine, ProcState, UserText, PGSIZE};

use common::TIMEOUT;

#[test]
fn wait_reaps_child_with_its_status() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let child = text.register(|u| {
        assert_eq!(u.arg(), 0);
        u.exit(7)
    });
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        let pid = u.fork(child).unwrap();
        let reaped = u.wait(Some(status)).unwrap();
        let code: i32 = u.read(status);
        tx.send((pid, reaped, code)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let (pid, reaped, code) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(pid, reaped);
    assert_eq!(code, 7);
    assert!(pid > 1);
    kernel.shutdown();
}

#[test]
fn wait_without_children_fails_at_once() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let init = text.register(move |u| {
        tx.send(u.wait(None).is_err()).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert!(rx.recv_timeout(TIMEOUT).expect("init reports"));
    kernel.shutdown();
}

#[test]
fn join_returns_exit_status_and_rejects_unknown_tids() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let worker = text.register(|u| u.kthread_exit(42));
    let init = text.register(move |u| {
        let stack = u.sbrk(PGSIZE as i64).unwrap();
        let status = u.sbrk(8).unwrap();
        let me = u.kthread_id();
        let tid = u.kthread_create(worker, stack).unwrap();
        u.kthread_join(tid, Some(status)).unwrap();
        let code: i32 = u.read(status);
        let unknown = u.kthread_join(9999, None).is_err();
        let itself = u.kthread_join(me, None).is_err();
        tx.send((tid != me, code, unknown, itself)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let (distinct, code, unknown, itself) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert!(distinct);
    assert_eq!(code, 42);
    assert!(unknown);
    assert!(itself);
    kernel.shutdown();
}

#[test]
fn create_rejects_null_entry_and_stack() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let entry = text.register(|_| {});
    let init = text.register(move |u| {
        let null_entry = u.kthread_create(0, 0x1000).is_err();
        let null_stack = u.kthread_create(entry, 0).is_err();
        tx.send((null_entry, null_stack)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("init reports"), (true, true));
    kernel.shutdown();
}

#[test]
fn create_rejects_stack_at_the_top_of_memory() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let entry = text.register(|u| u.kthread_exit(0));
    let init = text.register(move |u| {
        let wrapped = u.kthread_create(entry, u64::MAX - 8).is_err();
        let stack = u.sbrk(PGSIZE as i64).unwrap();
        let tid = u.kthread_create(entry, stack).unwrap();
        let joined = u.kthread_join(tid, None).is_ok();
        tx.send((wrapped, joined)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("init reports"), (true, true));
    assert!(!kernel.is_halted());
    kernel.shutdown();
}

#[test]
fn last_two_threads_exiting_together_end_the_process() {
    const ROUNDS: usize = 20;
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);
    let ready = Arc::new(AtomicUsize::new(0));

    let r = ready.clone();
    let worker = text.register(move |u| {
        r.fetch_add(1, Ordering::SeqCst);
        while r.load(Ordering::SeqCst) < 2 {
            u.getpid();
        }
        u.kthread_exit(2)
    });
    let r = ready.clone();
    let child = text.register(move |u| {
        let stack = u.sbrk(PGSIZE as i64).unwrap();
        u.kthread_create(worker, stack).unwrap();
        while r.load(Ordering::SeqCst) < 1 {
            u.getpid();
        }
        r.fetch_add(1, Ordering::SeqCst);
        u.kthread_exit(1)
    });
    let r = ready.clone();
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        let mut codes = Vec::new();
        for _ in 0..ROUNDS {
            r.store(0, Ordering::SeqCst);
            u.fork(child).unwrap();
            u.wait(Some(status)).unwrap();
            codes.push(u.read::<i32>(status));
        }
        tx.send(codes).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let codes = rx.recv_timeout(TIMEOUT).expect("every child is reaped");
    assert_eq!(codes.len(), ROUNDS);
    assert!(codes.iter().all(|c| *c == 1 || *c == 2), "{codes:?}");
    kernel.shutdown();
}

#[test]
fn last_thread_exit_ends_the_process() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let child = text.register(|u| u.kthread_exit(5));
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        u.fork(child).unwrap();
        u.wait(Some(status)).unwrap();
        tx.send(u.read::<i32>(status)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("init reports"), 5);
    kernel.shutdown();
}

#[test]
fn exit_takes_down_sibling_threads() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);
    let sleeper = text.register(|u| loop {
        let _ = u.sleep(1);
    });
    let child = text.register(move |u| {
        for _ in 0..3 {
            let stack = u.sbrk(PGSIZE as i64).unwrap();
            u.kthread_create(sleeper, stack).unwrap();
        }
        let _ = u.sleep(5);
        u.exit(3)
    });
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        let pid = u.fork(child).unwrap();
        let reaped = u.wait(Some(status)).unwrap();
        let alive = u.kernel().procdump().iter().any(|p| p.pid == pid);
        tx.send((reaped == pid, u.read::<i32>(status), alive)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let (same, code, alive) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert!(same);
    assert_eq!(code, 3);
    assert!(!alive);
    kernel.shutdown();
}

#[test]
fn fork_shares_files_and_exit_releases_them() {
    let text = Arc::new(UserText::new());
    let machine = Arc::new(HostedMachine::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let m = machine.clone();
    let child = text.register(|u| {
        let _ = u.sleep(50);
        u.exit(0)
    });
    let init = text.register(move |u| {
        let before = (m.file_handles(), m.dir_refs(ROOT_DIR), m.spaces());
        u.fork(child).unwrap();
        let during = (m.file_handles(), m.dir_refs(ROOT_DIR), m.spaces());
        u.wait(None).unwrap();
        let after = (m.file_handles(), m.dir_refs(ROOT_DIR), m.spaces());
        tx.send((before, during, after)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot_with(common::config(), machine, text, init);
    let (before, during, after) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(before, (3, 2, 1));
    assert_eq!(during, (6, 3, 2));
    assert_eq!(after, before);
    kernel.shutdown();
}

#[test]
fn orphans_are_reparented_to_init() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let grandchild = text.register(|u| {
        let _ = u.sleep(50);
        u.exit(0)
    });
    let child = text.register(move |u| {
        let pid = u.fork(grandchild).unwrap();
        u.exit(pid)
    });
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        u.fork(child).unwrap();
        u.wait(Some(status)).unwrap();
        let orphan: i32 = u.read(status);
        let adopted = u.wait(None).unwrap();
        tx.send((orphan, adopted)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let (orphan, adopted) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(orphan, adopted);
    kernel.shutdown();
}

#[test]
fn at_most_one_running_thread_per_cpu() {
    const CHILDREN: usize = 4;
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (a, p) = (active.clone(), peak.clone());
    let busy = text.register(move |u| {
        for _ in 0..200 {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            for _ in 0..500 {
                std::hint::spin_loop();
            }
            a.fetch_sub(1, Ordering::SeqCst);
            u.getpid();
        }
        u.exit(0)
    });
    let init = text.register(move |u| {
        for _ in 0..CHILDREN {
            u.fork(busy).unwrap();
        }
        for _ in 0..CHILDREN {
            u.wait(None).unwrap();
        }
        tx.send(()).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    rx.recv_timeout(TIMEOUT).expect("init reports");
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= kernel.config().ncpu);
    kernel.shutdown();
}

#[test]
fn procdump_lists_live_processes() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let init = text.register(move |u| {
        tx.send(u.getpid()).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    let pid = rx.recv_timeout(TIMEOUT).expect("init reports");
    let dump = kernel.procdump();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].pid, pid);
    assert_eq!(dump[0].name, "initcode");
    assert_eq!(dump[0].state, ProcState::Used);
    assert_eq!(dump[0].threads.len(), 1);
    kernel.shutdown();
}
