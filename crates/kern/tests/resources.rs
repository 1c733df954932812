//! Resource exhaustion, rollback, configuration and halting.

mod common;

use std::sync::{mpsc, Arc};

use kern::{HostedMachine, Kernel, KernelConfig, KernelError, UserText, PGSIZE};

use common::TIMEOUT;

#[test]
fn failed_fork_leaves_nothing_behind() {
    let text = Arc::new(UserText::new());
    let machine = Arc::new(HostedMachine::with_pages(64));
    let (tx, rx) = mpsc::sync_channel(1);

    let m = machine.clone();
    let child = text.register(|u| u.exit(0));
    let init = text.register(move |u| {
        let page = PGSIZE as i64;
        let mut grown = 0;
        while u.sbrk(page).is_ok() {
            grown += 1;
        }
        let live = u.kernel().procdump().len();

        // No page left, then room for the trap frame only, then for the
        // trap frame and the address space but not its contents.
        let mut rollbacks = Vec::new();
        for give_back in [0, 1, 2] {
            if give_back > 0 {
                u.sbrk(-page).unwrap();
                grown -= 1;
            }
            let free = m.free_pages();
            let spaces = m.spaces();
            let failed = u.fork(child).is_err();
            rollbacks.push((failed, m.free_pages() == free, m.spaces() == spaces));
        }
        let leaked = u.kernel().procdump().len() != live;

        u.sbrk(-grown * page).unwrap();
        let forked = u.fork(child).is_ok();
        let reaped = u.wait(None).is_ok();
        tx.send((rollbacks, leaked, forked, reaped)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot_with(common::config(), machine, text, init);
    let (rollbacks, leaked, forked, reaped) = rx.recv_timeout(TIMEOUT).expect("init reports");
    assert_eq!(rollbacks, vec![(true, true, true); 3]);
    assert!(!leaked);
    assert!(forked);
    assert!(reaped);
    kernel.shutdown();
}

#[test]
fn process_table_fills_up() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let child = text.register(|u| {
        let _ = u.sleep(20);
        u.exit(0)
    });
    let init = text.register(move |u| {
        let first = u.fork(child).is_ok();
        let second = u.fork(child).is_ok();
        let third = u.fork(child).is_err();
        u.wait(None).unwrap();
        let again = u.fork(child).is_ok();
        tx.send((first, second, third, again)).unwrap();
        common::reap_forever(u)
    });

    let config = KernelConfig::builder().ncpu(2).nproc(3).build();
    let kernel = common::boot_with(config, Arc::new(HostedMachine::new()), text, init);
    assert_eq!(
        rx.recv_timeout(TIMEOUT).expect("init reports"),
        (true, true, true, true)
    );
    kernel.shutdown();
}

#[test]
fn thread_table_fills_up() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let parked = text.register(|u| loop {
        let _ = u.sleep(1_000);
    });
    let init = text.register(move |u| {
        let mut created = 0;
        loop {
            let stack = u.sbrk(PGSIZE as i64).unwrap();
            if u.kthread_create(parked, stack).is_err() {
                break;
            }
            created += 1;
        }
        tx.send(created).unwrap();
        common::reap_forever(u)
    });

    let config = KernelConfig::builder().ncpu(2).nthread(4).build();
    let kernel = common::boot_with(config, Arc::new(HostedMachine::new()), text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("init reports"), 3);
    kernel.shutdown();
}

#[test]
fn init_exit_halts_the_kernel() {
    let text = Arc::new(UserText::new());
    let init = text.register(|u| u.exit(0));

    let kernel = common::boot(text, init);
    assert!(common::eventually(|| kernel.is_halted()));
    assert_eq!(kernel.halt_reason().as_deref(), Some("init exiting"));
}

#[test]
fn user_fault_kills_only_the_faulting_process() {
    let text = Arc::new(UserText::new());
    let (tx, rx) = mpsc::sync_channel(1);

    let child = text.register(|u| {
        let _: u64 = u.read(u64::MAX - 4);
        u.exit(0)
    });
    let init = text.register(move |u| {
        let status = u.sbrk(8).unwrap();
        u.fork(child).unwrap();
        u.wait(Some(status)).unwrap();
        tx.send(u.read::<i32>(status)).unwrap();
        common::reap_forever(u)
    });

    let kernel = common::boot(text, init);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("init reports"), -1);
    assert!(!kernel.is_halted());
    kernel.shutdown();
}

#[test]
fn bad_configurations_are_refused() {
    let text = Arc::new(UserText::new());
    let init = text.register(|_| {});
    let too_many_threads = KernelConfig::builder().nthread(PGSIZE).build();
    let no_cpus = KernelConfig::builder().ncpu(0).build();

    for config in [too_many_threads, no_cpus] {
        let err = Kernel::builder()
            .config(config)
            .text(text.clone())
            .boot(init)
            .err();
        assert!(matches!(err, Some(KernelError::Config(_))));
    }
}

#[test]
fn boot_fails_cleanly_without_memory() {
    let text = Arc::new(UserText::new());
    let init = text.register(|_| {});
    let machine = Arc::new(HostedMachine::with_pages(3));

    let err = Kernel::builder()
        .machine(machine.clone())
        .text(text)
        .boot(init)
        .err();
    assert_eq!(err, Some(KernelError::OutOfMemory));
    assert_eq!(machine.free_pages(), 3);
    assert_eq!(machine.spaces(), 0);
    assert_eq!(machine.file_handles(), 0);
}
