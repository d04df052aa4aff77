mod common;

use common::*;
use kernel_info::memory::FRAME_SIZE;
use kernel_task::primitives::KILL_FAILED;
use kernel_task::{CpuState, FileHandle, Signal, TaskError, TaskList, TaskRequest, TaskState};
use kernel_alloc::PageFaultResolution;
use kernel_vmem::page_fault::{PageFaultErrorCode, PageFaultKind};
use kernel_vmem::{VirtualAddress, get_page_for_virt_address};

#[test]
fn round_robin_over_admitted_tasks() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);

    assert_eq!(tick(&mut m), Some(1));
    for entry in [0x1000, 0x2000, 0x3000] {
        let t = kernel_task(&m, 0xffff_ffff_8000_0000 + entry);
        m.add_task(t).unwrap();
    }
    assert_eq!(ticks(&mut m, 4), [2, 3, 4, 2]);
}

#[test]
fn waiting_task_is_skipped_until_its_target_finishes() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    for entry in [0x1000, 0x2000, 0x3000] {
        let t = kernel_task(&m, 0xffff_ffff_8000_0000 + entry);
        m.add_task(t).unwrap();
    }

    run_until(&mut m, tid(3));
    assert!(m.wait(tid(4)));
    assert_eq!(m.scheduler().get_by_tid(tid(3)).unwrap().state(), TaskState::Blocked);
    assert_eq!(ticks(&mut m, 3), [4, 2, 4]);

    m.kill_task(tid(4), Signal::Kill).unwrap();
    assert_eq!(m.scheduler().get_by_tid(tid(3)).unwrap().state(), TaskState::Running);
    assert_eq!(ticks(&mut m, 2), [2, 3]);
}

#[test]
fn admission_beyond_capacity_destroys_the_task() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 2);
    m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();

    let before = machine.used_frames();
    let mut process = user_process(&asm, None, 1, &[41, 42]);
    assert_eq!(m.add_task(process.remove(0)), Err(TaskError::SchedulerFull));

    assert_eq!(m.scheduler().count(), 2);
    assert_eq!(m.services().closed, [FileHandle::new(41), FileHandle::new(42)]);
    assert_eq!(machine.used_frames(), before);
}

#[test]
fn add_task_requires_installation() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = Manager::new(&asm, RecordingServices::default(), ENTRY);
    let group = user_group(&asm, None);
    let task = user_task(&asm, &group);
    drop(group);

    assert_eq!(m.add_task(task), Err(TaskError::NotInstalled));
    assert_eq!(m.scheduler().count(), 0);
}

#[test]
fn wait_for_unknown_task_does_not_block() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    run_until(&mut m, tid(2));

    assert!(!m.wait(tid(99)));
    assert!(!m.wait(tid(2)));
    assert!(!m.wait(tid(1)));
    assert_eq!(m.get_current_task().unwrap().state(), TaskState::Running);
    assert_eq!(ticks(&mut m, 2), [2, 2]);
}

#[test]
fn group_kill_takes_the_process_tree_and_nothing_else() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 16);

    let kernel = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let mut a = Vec::new();
    for t in user_process(&asm, None, 2, &[1]) {
        a.push(m.add_task(t).unwrap());
    }
    let b = m.add_task(user_process(&asm, Some(a[1]), 1, &[2]).remove(0)).unwrap();
    let c = m.add_task(user_process(&asm, Some(b), 1, &[]).remove(0)).unwrap();
    let unrelated = m.add_task(user_process(&asm, None, 1, &[3]).remove(0)).unwrap();
    let before = machine.used_frames();

    run_until(&mut m, a[0]);
    assert_eq!(m.kill_current_task_group(), Ok(4));

    for id in [a[0], a[1], b, c] {
        assert!(!m.scheduler().is_valid_task(id), "{id} survived");
    }
    assert!(m.scheduler().is_valid_task(kernel));
    assert!(m.scheduler().is_valid_task(unrelated));
    assert_eq!(m.current_task_id(), None);
    assert_eq!(m.active_root(), None);

    let mut closed = m.services().closed.clone();
    closed.sort_by_key(|h| h.raw());
    assert_eq!(closed, [FileHandle::new(1), FileHandle::new(2)]);
    // A: tables + two stacks, B and C: tables + one stack each.
    assert_eq!(machine.used_frames(), before - 7);

    assert_eq!(ticks(&mut m, 3), [kernel.get(), unrelated.get(), kernel.get()]);
}

#[test]
fn page_tables_reload_only_between_groups() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);

    m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();
    let group = user_group(&asm, None);
    let user_root = group.root().unwrap();
    m.add_task(user_task(&asm, &group)).unwrap();
    m.add_task(user_task(&asm, &group)).unwrap();

    assert_eq!(ticks(&mut m, 5), [2, 3, 4, 5, 2]);
    assert_eq!(machine.paging.loads(), [asm.kernel_root(), user_root, asm.kernel_root()]);
}

#[test]
fn replacement_inherits_id_and_waiters() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);

    let old = m.add_task(user_process(&asm, None, 1, &[7]).remove(0)).unwrap();
    let waiter = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    run_until(&mut m, waiter);
    assert!(m.wait(old));
    run_until(&mut m, old);

    let successor = user_process(&asm, Some(waiter), 1, &[]).remove(0);
    assert_eq!(m.replace_current_task(successor), Ok(old));
    assert_eq!(m.current_task_id(), None);
    assert_eq!(m.services().closed, [FileHandle::new(7)]);

    let replaced = m.scheduler().get_by_tid(old).unwrap();
    assert!(replaced.finish_waiters().contains(waiter));
    assert_eq!(replaced.group().parent_task_id(), Some(waiter));
    assert_eq!(m.scheduler().get_by_tid(waiter).unwrap().state(), TaskState::Blocked);

    // The stale frame of the discarded image must not leak into the successor.
    let stale = CpuState {
        rip: 0xdead,
        ..CpuState::default()
    };
    let next = *m.schedule(&stale);
    assert_eq!(m.current_task_id(), Some(old));
    assert_eq!(next.rip, USER_ENTRY.as_u64());

    m.kill_current_task().unwrap();
    assert_eq!(m.scheduler().get_by_tid(waiter).unwrap().state(), TaskState::Running);
}

#[test]
fn idle_cannot_be_replaced_or_killed() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    assert_eq!(tick(&mut m), Some(1));

    assert_eq!(m.kill_current_task(), Err(TaskError::IdleTask));
    assert_eq!(m.kill_current_task_group(), Err(TaskError::IdleTask));
    assert_eq!(m.kill_task(tid(1), Signal::Kill), Err(TaskError::IdleTask));
    let mut list = TaskList::new();
    assert!(!m.block_current_task(&mut list));

    let task = user_process(&asm, None, 1, &[5]).remove(0);
    assert_eq!(m.replace_current_task(task), Err(TaskError::IdleTask));
    assert_eq!(m.services().closed, [FileHandle::new(5)]);
    assert_eq!(tick(&mut m), Some(1));
}

#[test]
fn unblocking_skips_tasks_that_are_gone() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let b = m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();

    let mut list = TaskList::new();
    run_until(&mut m, a);
    assert!(m.block_current_task(&mut list));
    run_until(&mut m, b);
    assert!(m.block_current_task(&mut list));
    m.kill_task(a, Signal::Kill).unwrap();

    assert_eq!(m.unblock_tasks(&mut list), 1);
    assert!(list.is_empty());
    assert_eq!(m.scheduler().get_by_tid(b).unwrap().state(), TaskState::Running);
}

#[test]
fn sleeping_task_wakes_when_its_timer_fires() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let b = m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();
    run_until(&mut m, a);

    let frame = CpuState {
        rbx: 0x5eed,
        ..CpuState::default()
    };
    m.sleep_current_task(&frame, 10);
    assert_eq!(m.current_task_id(), Some(b));
    assert_eq!(m.scheduler().get_by_tid(a).unwrap().context().rbx, 0x5eed);

    let (millis, token) = m.services().armed[0];
    assert_eq!(millis, 10);
    assert_eq!(ticks(&mut m, 2), [b.get(), b.get()]);

    m.services_mut().expired.push_back(token);
    assert_eq!(tick(&mut m), Some(a.get()));
    assert_eq!(m.on_timer_expired(token), 0);
}

#[test]
fn sleep_without_a_timer_keeps_running() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    run_until(&mut m, a);
    m.services_mut().no_timer = true;

    m.sleep_current_task(&CpuState::default(), 10);
    assert_eq!(m.current_task_id(), Some(a));
    assert_eq!(m.get_current_task().unwrap().state(), TaskState::Running);
}

#[test]
fn dispatched_requests_report_through_rax() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let b = m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();
    run_until(&mut m, a);
    let frame = CpuState {
        rax: 0x55,
        ..CpuState::default()
    };

    let r = *m.dispatch(&frame, TaskRequest::Wait { task: 99 });
    assert_eq!((r.rax, m.current_task_id()), (0, Some(a)));

    let r = *m.dispatch(&frame, TaskRequest::Kill { task: b.get(), signal: 15 });
    assert_eq!(r.rax, KILL_FAILED);
    assert!(m.scheduler().is_valid_task(b));

    let r = *m.dispatch(&frame, TaskRequest::Kill { task: b.get(), signal: 9 });
    assert_eq!((r.rax, m.current_task_id()), (0, Some(a)));
    assert!(!m.scheduler().is_valid_task(b));

    let r = *m.dispatch(&frame, TaskRequest::Exit { code: 0 });
    assert_eq!(m.current_task_id(), Some(tid(1)));
    assert_eq!(r.rip, ENTRY.idle.as_u64());
}

#[test]
fn dispatched_wait_switches_away() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let b = m.add_task(kernel_task(&m, 0xffff_ffff_8000_2000)).unwrap();
    run_until(&mut m, a);

    let r = *m.dispatch(&CpuState::default(), TaskRequest::Wait { task: b.get() });
    assert_eq!(m.current_task_id(), Some(b));
    assert_eq!(r.rip, 0xffff_ffff_8000_2000);
    assert_eq!(m.scheduler().get_by_tid(a).unwrap().context().rax, 1);

    m.dispatch(&CpuState::default(), TaskRequest::Exit { code: 3 });
    assert_eq!(m.current_task_id(), Some(a));
}

#[test]
fn prepare_plants_the_exit_point_on_the_user_stack() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);

    let task = user_process(&asm, None, 1, &[]).remove(0);
    let top = task.stack_addr() + task.stack_size();
    let id = m.add_task(task).unwrap();

    let task = m.scheduler().get_by_tid(id).unwrap();
    let ctx = task.context();
    assert_eq!(ctx.rsp, (top - 8).as_u64());
    assert_eq!(ctx.rip, USER_ENTRY.as_u64());
    assert_eq!((ctx.cs, ctx.ss, ctx.rflags), (0x1b, 0x23, 0x202));

    let root = task.root().unwrap();
    let entry = unsafe { get_page_for_virt_address(top - 8, root, &machine.phys) }.unwrap();
    assert!(entry.present() && entry.user());
    let word = entry.physical_address() + (top - 8).offset_in(FRAME_SIZE);
    assert_eq!(machine.phys.read_u64(word), ENTRY.user_exit.as_u64());
}

#[test]
fn kernel_group_outlives_its_tasks() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);
    let a = m.add_task(kernel_task(&m, 0xffff_ffff_8000_1000)).unwrap();
    let group = m.kernel_group().unwrap().clone();
    group.open_file(FileHandle::new(9)).unwrap();

    m.kill_task(a, Signal::Kill).unwrap();
    assert!(m.services().closed.is_empty());
    assert_eq!(group.root(), Some(asm.kernel_root()));
    assert_eq!(group.file(0), Some(FileHandle::new(9)));
}

#[test]
fn page_faults_resolve_in_the_current_address_space() {
    let machine = Machine::new();
    let asm = machine.asm();
    let mut m = manager(&asm, 8);

    let task = user_process(&asm, None, 1, &[]).remove(0);
    let guard = task.stack_addr() - FRAME_SIZE;
    let id = m.add_task(task).unwrap();
    run_until(&mut m, id);

    let err = PageFaultErrorCode::new().with_write(true).with_user(true);
    let heap = m.alloc_static_for_current(64).unwrap();
    assert_eq!(m.handle_page_fault(heap, err), PageFaultResolution::Resolved);
    assert_eq!(
        m.handle_page_fault(guard, err),
        PageFaultResolution::Fatal(PageFaultKind::StackOverflow)
    );
    assert_eq!(
        m.handle_page_fault(VirtualAddress::new(0x0000_0080_0000_0000), err),
        PageFaultResolution::Fatal(PageFaultKind::InvalidAddressSpace)
    );
}
