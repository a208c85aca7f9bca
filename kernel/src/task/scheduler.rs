// =============================================================================
// Helios — Task Scheduler
// =============================================================================
//
// A fixed table of 64 tasks, scheduled round-robin with per-task quanta.
//
// STRUCTURE:
//   - Slot 0 is the idle task: TID 0, the boot execution context, an
//     effectively infinite quantum. It runs exactly when no other task is
//     Ready and is never placed on a queue.
//   - The Ready queue is a FIFO doubly linked list threaded through the
//     table by slot index (`prev`/`next` as Option<usize> — no pointer
//     graphs). The Blocked queue is singly linked.
//   - Exactly one task is Running outside a context switch; it is
//     `current` and sits in no queue.
//
// POLICY:
//   The timer callback charges one tick of cpu_time to the running task
//   and preempts it once `cpu_time - last_schedule` reaches its quantum:
//   the task goes to the Ready tail and the head is dispatched. When the
//   idle task is current, any Ready task is dispatched immediately.
//
// LOCKING:
//   One IRQ-safe spinlock guards the table and both queues. The timer
//   path takes it with `try_lock` (never spinning against the context it
//   interrupted) and every switch happens *after* the guard is dropped —
//   holding the lock across a context switch would deadlock the next
//   tick. Switch operands are raw pointers into the static table, which
//   stay valid because slots are never moved.
//
// TEARDOWN:
//   Terminating another task frees its address space (which returns its
//   image, stack, heap and guard frames) and kernel stack immediately.
//   A task terminating itself is only marked; its resources are reaped at
//   the next scheduling point from a different task's stack.
//
// =============================================================================

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::gdt::{self, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::exec::elf::ElfImage;
use crate::memory::address::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::{self, PageTableFlags};
use crate::memory::vmm::{self, PmmFrames};
use crate::memory::pmm;
use crate::drivers::timer;
use crate::sync::SpinLock;
use crate::syscall;
use crate::task::context::{
    self, CpuContext, USER_RFLAGS, task_restore_context, task_switch_context,
};

/// Capacity of the task table (slot 0 is the idle task).
pub const MAX_TASKS: usize = 64;

/// Slot index of the idle task.
const IDLE: usize = 0;

/// Timer tick rate programmed at scheduler init.
const TICK_HZ: u64 = 1000;

/// Default quantum in timer ticks.
const DEFAULT_QUANTUM: u64 = 20;

/// Kernel stack: 4 contiguous frames (16 KiB), addressed through the
/// HHDM so it is visible in every address space.
const KERNEL_STACK_PAGES: usize = 4;
const KERNEL_STACK_SIZE: u64 = KERNEL_STACK_PAGES as u64 * PAGE_SIZE;

/// User stack: 64 KiB ending just below 3.75 GiB, plus one guard page.
const USER_STACK_SIZE: u64 = 0x1_0000;
const USER_STACK_TOP: u64 = 0xF000_0000;

/// Maximum task name length kept in the table.
const TASK_NAME_LEN: usize = 32;

/// Upper bound on argv/envp entries a task can be created with.
const MAX_ARGS: usize = 32;

// =============================================================================
// Types
// =============================================================================

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Slot free or task under construction.
    #[default]
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Scheduling priority. Round-robin treats all non-idle tasks alike; the
/// field is carried for accounting and the priority syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Idle,
    Low,
    #[default]
    Normal,
    High,
    Realtime,
}

/// One slot of the task table.
struct Task {
    tid: u32,
    state: TaskState,
    name: [u8; TASK_NAME_LEN],
    name_len: usize,
    base_priority: Priority,
    dynamic_priority: Priority,
    /// Maximum ticks between dispatch and preemption.
    quantum: u64,
    /// Ticks charged to this task so far.
    cpu_time: u64,
    /// cpu_time value at the last dispatch.
    last_schedule: u64,
    /// Tick count when the task was created.
    #[allow(dead_code)]
    start_time: u64,
    exit_code: i32,
    /// Root PML4 of the owned address space.
    page_table: PhysAddr,
    user_stack_top: u64,
    user_stack_size: u64,
    /// Current program break (grown by sys_brk).
    brk: u64,
    /// Physical base of the contiguous kernel stack frames.
    kernel_stack: PhysAddr,
    /// Top of the kernel stack in HHDM virtual space (0 for idle).
    kstack_top: u64,
    /// Saved kernel RSP while suspended.
    kernel_rsp: u64,
    argc: i32,
    argv: u64,
    envp: u64,
    ctx: CpuContext,
    /// Ready-queue links (doubly linked); `next` doubles as the Blocked
    /// queue link (singly linked).
    prev: Option<usize>,
    next: Option<usize>,
    /// Self-terminated; resources reclaimed at the next schedule point.
    needs_reap: bool,
}

impl Task {
    const fn empty() -> Self {
        Self {
            tid: 0,
            state: TaskState::New,
            name: [0; TASK_NAME_LEN],
            name_len: 0,
            base_priority: Priority::Normal,
            dynamic_priority: Priority::Normal,
            quantum: DEFAULT_QUANTUM,
            cpu_time: 0,
            last_schedule: 0,
            start_time: 0,
            exit_code: 0,
            page_table: PhysAddr::zero(),
            user_stack_top: 0,
            user_stack_size: 0,
            brk: 0,
            kernel_stack: PhysAddr::zero(),
            kstack_top: 0,
            kernel_rsp: 0,
            argc: 0,
            argv: 0,
            envp: 0,
            ctx: CpuContext::zeroed(),
            prev: None,
            next: None,
            needs_reap: false,
        }
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len;
    }
}

/// Public snapshot of one task, for `task_list` and lookups.
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo {
    pub tid: u32,
    pub state: TaskState,
    pub priority: Priority,
    pub cpu_time: u64,
    pub name: [u8; TASK_NAME_LEN],
    pub name_len: usize,
}

/// Registers the syscall trampoline saved at kernel entry; fork clones
/// the resume point from these.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallSaved {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// Everything a context switch needs once the table lock is dropped.
struct SwitchData {
    prev_rsp: *mut u64,
    next_rsp: u64,
    next_cr3: PhysAddr,
    next_kstack_top: u64,
}

/// Resources of reaped tasks, released outside the table lock.
#[derive(Clone, Copy)]
struct Reaped {
    page_table: PhysAddr,
    kernel_stack: PhysAddr,
}

// =============================================================================
// The table
// =============================================================================

struct TaskTable {
    tasks: [Task; MAX_TASKS],
    next_tid: u32,
    current: usize,
    ready_head: Option<usize>,
    ready_tail: Option<usize>,
    blocked_head: Option<usize>,
    ticks: u64,
    #[allow(dead_code)]
    created: u64,
    #[allow(dead_code)]
    live: u64,
}

static TASKS: SpinLock<TaskTable> = SpinLock::new(TaskTable::new());

/// Monotonic tick counter mirrored outside the lock for cheap reads.
static SCHED_TICKS: AtomicU64 = AtomicU64::new(0);

impl TaskTable {
    const fn new() -> Self {
        Self {
            tasks: [const { Task::empty() }; MAX_TASKS],
            next_tid: 1,
            current: IDLE,
            ready_head: None,
            ready_tail: None,
            blocked_head: None,
            ticks: 0,
            created: 0,
            live: 0,
        }
    }

    fn alloc_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        if self.next_tid == 0 {
            self.next_tid = 1; // 0 stays reserved for idle
        }
        tid
    }

    /// Finds a reusable slot: never slot 0, never an unreaped corpse.
    fn alloc_slot(&mut self) -> Option<usize> {
        (1..MAX_TASKS).find(|&i| {
            matches!(self.tasks[i].state, TaskState::New | TaskState::Terminated)
                && !self.tasks[i].needs_reap
        })
    }

    fn find_by_tid(&self, tid: u32) -> Option<usize> {
        (0..MAX_TASKS).find(|&i| {
            self.tasks[i].tid == tid && !matches!(self.tasks[i].state, TaskState::New)
        })
        .or((tid == 0).then_some(IDLE))
    }

    // -------------------------------------------------------------------------
    // Ready queue (doubly linked FIFO by slot index)
    // -------------------------------------------------------------------------

    fn enqueue_ready(&mut self, idx: usize) {
        debug_assert!(idx != IDLE, "idle never queues");
        self.tasks[idx].next = None;
        self.tasks[idx].prev = self.ready_tail;
        match self.ready_tail {
            Some(tail) => self.tasks[tail].next = Some(idx),
            None => self.ready_head = Some(idx),
        }
        self.ready_tail = Some(idx);
        self.tasks[idx].state = TaskState::Ready;
    }

    fn dequeue_ready(&mut self) -> Option<usize> {
        let head = self.ready_head?;
        self.ready_head = self.tasks[head].next;
        match self.ready_head {
            Some(new_head) => self.tasks[new_head].prev = None,
            None => self.ready_tail = None,
        }
        self.tasks[head].prev = None;
        self.tasks[head].next = None;
        Some(head)
    }

    fn remove_from_ready(&mut self, idx: usize) {
        let prev = self.tasks[idx].prev;
        let next = self.tasks[idx].next;
        match prev {
            Some(p) => self.tasks[p].next = next,
            None => {
                if self.ready_head == Some(idx) {
                    self.ready_head = next;
                } else {
                    return; // not in the queue
                }
            }
        }
        match next {
            Some(n) => self.tasks[n].prev = prev,
            None => {
                if self.ready_tail == Some(idx) {
                    self.ready_tail = prev;
                }
            }
        }
        self.tasks[idx].prev = None;
        self.tasks[idx].next = None;
    }

    // -------------------------------------------------------------------------
    // Blocked queue (singly linked)
    // -------------------------------------------------------------------------

    fn push_blocked(&mut self, idx: usize) {
        self.tasks[idx].next = self.blocked_head;
        self.tasks[idx].prev = None;
        self.blocked_head = Some(idx);
        self.tasks[idx].state = TaskState::Blocked;
    }

    fn remove_from_blocked(&mut self, idx: usize) {
        let mut cursor = self.blocked_head;
        let mut prev: Option<usize> = None;
        while let Some(c) = cursor {
            if c == idx {
                match prev {
                    Some(p) => self.tasks[p].next = self.tasks[idx].next,
                    None => self.blocked_head = self.tasks[idx].next,
                }
                self.tasks[idx].next = None;
                return;
            }
            prev = cursor;
            cursor = self.tasks[c].next;
        }
    }

    // -------------------------------------------------------------------------
    // Policy
    // -------------------------------------------------------------------------

    /// One timer tick: charge the running task, preempt on quantum
    /// expiry. Returns the slot to dispatch, or None to keep running.
    fn tick(&mut self) -> Option<usize> {
        self.ticks += 1;
        let cur = self.current;

        if cur != IDLE && self.tasks[cur].state == TaskState::Running {
            self.tasks[cur].cpu_time += 1;
            let t = &self.tasks[cur];
            if t.cpu_time - t.last_schedule >= t.quantum {
                self.tasks[cur].state = TaskState::Ready;
                self.enqueue_ready(cur);
                return self.pick_next();
            }
            None
        } else {
            // Idle (or a non-running current): hand the CPU to any Ready
            // task straight away.
            self.pick_next()
        }
    }

    /// Pops the Ready head (idle when empty). Returns None when the pick
    /// is the current task, re-dispatching it in place.
    fn pick_next(&mut self) -> Option<usize> {
        let next = self.dequeue_ready().unwrap_or(IDLE);
        if next == self.current {
            let t = &mut self.tasks[next];
            t.state = TaskState::Running;
            t.last_schedule = t.cpu_time;
            return None;
        }
        Some(next)
    }

    /// Commits a dispatch decision and captures the switch operands.
    fn take_switch(&mut self, next: usize) -> SwitchData {
        let prev = self.current;
        if self.tasks[prev].state == TaskState::Running {
            self.tasks[prev].state = TaskState::Ready;
        }
        self.tasks[next].state = TaskState::Running;
        self.tasks[next].last_schedule = self.tasks[next].cpu_time;
        self.current = next;

        SwitchData {
            prev_rsp: &raw mut self.tasks[prev].kernel_rsp,
            next_rsp: self.tasks[next].kernel_rsp,
            next_cr3: self.tasks[next].page_table,
            next_kstack_top: self.tasks[next].kstack_top,
        }
    }

    /// Collects the corpses of self-terminated tasks other than the
    /// current one. Their resources are freed by the caller outside the
    /// lock; the slot stays Terminated (TID and exit code intact) until
    /// reused.
    fn collect_reapable(&mut self, out: &mut [Option<Reaped>]) -> usize {
        let mut n = 0;
        for i in 1..MAX_TASKS {
            if n == out.len() {
                break;
            }
            if self.tasks[i].needs_reap && i != self.current {
                out[n] = Some(Reaped {
                    page_table: self.tasks[i].page_table,
                    kernel_stack: self.tasks[i].kernel_stack,
                });
                self.tasks[i].page_table = PhysAddr::zero();
                self.tasks[i].kernel_stack = PhysAddr::zero();
                self.tasks[i].needs_reap = false;
                n += 1;
            }
        }
        n
    }
}

// =============================================================================
// Switch plumbing
// =============================================================================

/// Performs the dispatch captured in `sw`. Returns when the suspended
/// task is next scheduled.
///
/// Must be called with the table lock *not* held.
fn do_switch(sw: SwitchData) {
    crate::arch::cpu::interrupt_disable();

    // Ring transitions and syscall entries for the incoming task must
    // land on its kernel stack.
    if sw.next_kstack_top != 0 {
        gdt::set_kernel_stack(sw.next_kstack_top);
        syscall::set_kernel_stack(sw.next_kstack_top);
    }
    vmm::switch_address_space(sw.next_cr3);

    // SAFETY: both RSP values point into live kernel stacks primed or
    // previously parked by this function's counterpart.
    unsafe { task_switch_context(sw.prev_rsp, sw.next_rsp) };
    // Interrupt state was restored from the stacked RFLAGS.
}

fn release_reaped(reaped: &[Option<Reaped>]) {
    for r in reaped.iter().flatten() {
        if !r.page_table.is_zero() {
            vmm::delete_address_space(r.page_table);
        }
        if !r.kernel_stack.is_zero() {
            pmm::free_frames(r.kernel_stack, KERNEL_STACK_PAGES);
        }
    }
}

/// First code a fresh task runs: drops into ring 3 with the registers in
/// its context. Runs with interrupts disabled (the primed RFLAGS) until
/// IRETQ loads the user RFLAGS.
extern "C" fn task_bootstrap() -> ! {
    let ctx: *const CpuContext = {
        let table = TASKS.lock();
        &table.tasks[table.current].ctx as *const CpuContext
    };
    // SAFETY: the context was fully initialized before the task became
    // Ready, and the pointer targets the static table.
    unsafe { task_restore_context(ctx) }
}

/// Timer callback: the preemption source. Runs in interrupt context.
fn scheduler_tick(_now: u64) {
    SCHED_TICKS.fetch_add(1, Ordering::Relaxed);

    let mut reaped = [None; 4];
    let decision = match TASKS.try_lock() {
        Some(mut table) => {
            table.collect_reapable(&mut reaped);
            table.tick().map(|next| table.take_switch(next))
        }
        // Lock held by the interrupted context: skip this reschedule
        // rather than spinning against ourselves.
        None => None,
    };

    release_reaped(&reaped);
    if let Some(sw) = decision {
        do_switch(sw);
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Initializes the scheduler: builds the idle task from the boot context,
/// registers the timer callback and programs the tick rate.
pub fn init() {
    {
        let mut table = TASKS.lock();
        let idle = &mut table.tasks[IDLE];
        idle.tid = 0;
        idle.set_name("idle");
        idle.state = TaskState::Running;
        idle.base_priority = Priority::Idle;
        idle.dynamic_priority = Priority::Idle;
        idle.quantum = u64::MAX;
        idle.page_table = vmm::current_address_space();
        idle.ctx.cr3 = idle.page_table.as_u64();
        table.current = IDLE;
        table.live = 1;
    }

    timer::register_callback(scheduler_tick);
    timer::init(TICK_HZ);

    log::info!("scheduler online ({} slots, quantum {} ticks, {} Hz)",
        MAX_TASKS, DEFAULT_QUANTUM, TICK_HZ);
}

/// TID of the currently running task.
pub fn current_tid() -> u32 {
    let table = TASKS.lock();
    table.tasks[table.current].tid
}

/// State of the task with `tid`, if any non-free slot carries it.
#[allow(dead_code)]
pub fn task_state(tid: u32) -> Option<TaskState> {
    let table = TASKS.lock();
    table.find_by_tid(tid).map(|i| table.tasks[i].state)
}

/// State and exit code together (the waitpid probe).
pub fn task_exit_status(tid: u32) -> Option<(TaskState, i32)> {
    let table = TASKS.lock();
    table
        .find_by_tid(tid)
        .map(|i| (table.tasks[i].state, table.tasks[i].exit_code))
}

/// Snapshot of one task.
#[allow(dead_code)]
pub fn task_info(tid: u32) -> Option<TaskInfo> {
    let table = TASKS.lock();
    table.find_by_tid(tid).map(|i| snapshot(&table.tasks[i]))
}

fn snapshot(task: &Task) -> TaskInfo {
    TaskInfo {
        tid: task.tid,
        state: task.state,
        priority: task.dynamic_priority,
        cpu_time: task.cpu_time,
        name: task.name,
        name_len: task.name_len,
    }
}

/// Fills `buf` with snapshots of live tasks; returns the count written.
#[allow(dead_code)]
pub fn task_list(buf: &mut [TaskInfo]) -> usize {
    let table = TASKS.lock();
    let mut n = 0;
    for task in table.tasks.iter() {
        if n == buf.len() {
            break;
        }
        if !matches!(task.state, TaskState::New) {
            buf[n] = snapshot(task);
            n += 1;
        }
    }
    n
}

/// Adjusts a task's priority. Round-robin ordering is unaffected.
#[allow(dead_code)]
pub fn set_task_priority(tid: u32, priority: Priority) -> bool {
    let mut table = TASKS.lock();
    match table.find_by_tid(tid) {
        Some(i) => {
            table.tasks[i].base_priority = priority;
            table.tasks[i].dynamic_priority = priority;
            true
        }
        None => false,
    }
}

/// Voluntarily gives up the CPU: the current task goes to the Ready tail
/// and the head runs.
pub fn yield_now() {
    let mut reaped = [None; 4];
    let decision = {
        let mut table = TASKS.lock();
        table.collect_reapable(&mut reaped);
        let cur = table.current;
        if cur != IDLE && table.tasks[cur].state == TaskState::Running {
            table.tasks[cur].state = TaskState::Ready;
            table.enqueue_ready(cur);
        }
        table.pick_next().map(|next| table.take_switch(next))
    };

    release_reaped(&reaped);
    if let Some(sw) = decision {
        do_switch(sw);
    }
}

/// Blocks the current task until `unblock_task` and schedules the next.
#[allow(dead_code)]
pub fn block_current() {
    let decision = {
        let mut table = TASKS.lock();
        let cur = table.current;
        if cur == IDLE {
            log::warn!("refusing to block the idle task");
            return;
        }
        table.push_blocked(cur);
        table.pick_next().map(|next| table.take_switch(next))
    };
    if let Some(sw) = decision {
        do_switch(sw);
    }
}

/// Moves a Blocked task back to the Ready queue.
#[allow(dead_code)]
pub fn unblock_task(tid: u32) -> bool {
    let mut table = TASKS.lock();
    let Some(idx) = table.find_by_tid(tid) else {
        return false;
    };
    if table.tasks[idx].state != TaskState::Blocked {
        return false;
    }
    table.remove_from_blocked(idx);
    table.enqueue_ready(idx);
    true
}

/// Terminates a task, recording `exit_code`.
///
/// Terminating another task frees its resources immediately; a task
/// terminating itself is deferred to the next scheduling point (the
/// caller is expected to yield).
pub fn terminate_task(tid: u32, exit_code: i32) -> bool {
    let mut immediate: Option<Reaped> = None;
    {
        let mut table = TASKS.lock();
        let Some(idx) = table.find_by_tid(tid) else {
            log::warn!("terminate of unknown tid {}", tid);
            return false;
        };
        if idx == IDLE {
            log::error!("refusing to terminate the idle task");
            return false;
        }
        if table.tasks[idx].state == TaskState::Terminated {
            return false;
        }

        match table.tasks[idx].state {
            TaskState::Ready => table.remove_from_ready(idx),
            TaskState::Blocked => table.remove_from_blocked(idx),
            _ => {}
        }
        table.tasks[idx].state = TaskState::Terminated;
        table.tasks[idx].exit_code = exit_code;
        table.live -= 1;

        if idx == table.current {
            table.tasks[idx].needs_reap = true;
        } else {
            immediate = Some(Reaped {
                page_table: core::mem::replace(
                    &mut table.tasks[idx].page_table,
                    PhysAddr::zero(),
                ),
                kernel_stack: core::mem::replace(
                    &mut table.tasks[idx].kernel_stack,
                    PhysAddr::zero(),
                ),
            });
        }
    }

    if let Some(r) = immediate {
        release_reaped(&[Some(r)]);
    }
    log::debug!("task {} terminated with code {}", tid, exit_code);
    true
}

/// Terminates the current task and never returns.
pub fn exit_current(exit_code: i32) -> ! {
    let tid = current_tid();
    terminate_task(tid, exit_code);
    loop {
        yield_now();
    }
}

// =============================================================================
// Task creation
// =============================================================================

/// A built-but-not-yet-installed user image: address space, mapped stack
/// and argument block.
struct UserImage {
    page_table: PhysAddr,
    entry: u64,
    user_rsp: u64,
    brk: u64,
    argv_ptr: u64,
    envp_ptr: u64,
}

/// Creates a task from an ELF image.
///
/// Builds an address space, a guarded user stack carrying a Linux-style
/// argument block, loads the image, allocates a kernel stack and queues
/// the task Ready. Returns the new TID, or 0 after a full rollback.
pub fn create_task(
    elf_data: &[u8],
    name: &str,
    priority: Priority,
    argv: &[&str],
    envp: &[&str],
) -> u32 {
    let image = match build_user_image(elf_data, argv, envp) {
        Some(image) => image,
        None => return 0,
    };

    let Some(kernel_stack) = pmm::alloc_frames(KERNEL_STACK_PAGES) else {
        log::error!("create_task: no kernel stack for '{}'", name);
        vmm::delete_address_space(image.page_table);
        return 0;
    };
    let kstack_top = kernel_stack.to_virt(vmm::hhdm_offset()).as_u64() + KERNEL_STACK_SIZE;

    let tid = {
        let mut table = TASKS.lock();
        let Some(slot) = table.alloc_slot() else {
            drop(table);
            log::error!("create_task: task table full");
            vmm::delete_address_space(image.page_table);
            pmm::free_frames(kernel_stack, KERNEL_STACK_PAGES);
            return 0;
        };

        let tid = table.alloc_tid();
        let start_time = table.ticks;
        let task = &mut table.tasks[slot];
        *task = Task::empty();
        task.tid = tid;
        task.set_name(name);
        task.base_priority = priority;
        task.dynamic_priority = priority;
        task.quantum = DEFAULT_QUANTUM;
        task.start_time = start_time;
        task.page_table = image.page_table;
        task.user_stack_top = USER_STACK_TOP;
        task.user_stack_size = USER_STACK_SIZE;
        task.brk = image.brk;
        task.kernel_stack = kernel_stack;
        task.kstack_top = kstack_top;
        task.argc = argv.len() as i32;
        task.argv = image.argv_ptr;
        task.envp = image.envp_ptr;

        task.ctx = initial_user_context(&image);
        // SAFETY: the kernel stack frames were just allocated and are
        // visible through the HHDM.
        task.kernel_rsp = unsafe { context::prime_kernel_stack(kstack_top, task_bootstrap) };

        table.enqueue_ready(slot);
        table.created += 1;
        table.live += 1;
        tid
    };

    log::debug!("created task {} '{}' entry={:#x}", tid, name, image.entry);
    tid
}

/// The register file a task starts user mode with.
fn initial_user_context(image: &UserImage) -> CpuContext {
    let mut ctx = CpuContext::zeroed();
    ctx.rip = image.entry;
    ctx.rsp = image.user_rsp;
    ctx.rflags = USER_RFLAGS;
    ctx.cs = USER_CODE_SELECTOR as u64;
    ctx.ss = USER_DATA_SELECTOR as u64;
    ctx.ds = USER_DATA_SELECTOR as u64;
    ctx.es = USER_DATA_SELECTOR as u64;
    ctx.fs = USER_DATA_SELECTOR as u64;
    ctx.gs = USER_DATA_SELECTOR as u64;
    ctx.cr3 = image.page_table.as_u64();
    ctx
}

/// Builds the address space for a new image: loads the ELF, maps the
/// guarded stack and writes the argument block. On any failure the
/// partial address space is destroyed (reclaiming every frame mapped so
/// far) and None returned.
fn build_user_image(elf_data: &[u8], argv: &[&str], envp: &[&str]) -> Option<UserImage> {
    let elf = match ElfImage::parse(elf_data) {
        Ok(elf) => elf,
        Err(e) => {
            log::error!("invalid ELF image: {:?}", e);
            return None;
        }
    };

    let hhdm = vmm::hhdm_offset();
    let page_table = vmm::create_address_space()?;

    // Load segments. The caller-visible contract: on failure the address
    // space is destroyed, which returns every frame already mapped.
    let loaded = match unsafe {
        elf.load_into(hhdm, page_table, 0, vmm::nx_supported(), &mut PmmFrames)
    } {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("ELF load failed: {:?}", e);
            vmm::delete_address_space(page_table);
            return None;
        }
    };

    // User stack: contiguous frames mapped below USER_STACK_TOP with a
    // non-writable, non-executable guard page underneath.
    let stack_pages = (USER_STACK_SIZE / PAGE_SIZE) as usize;
    let stack_base_va = USER_STACK_TOP - USER_STACK_SIZE;
    let Some(stack_phys) = pmm::alloc_frames(stack_pages) else {
        log::error!("no frames for user stack");
        vmm::delete_address_space(page_table);
        return None;
    };
    let Some(guard_phys) = pmm::alloc_frame() else {
        log::error!("no frame for stack guard");
        pmm::free_frames(stack_phys, stack_pages);
        vmm::delete_address_space(page_table);
        return None;
    };

    let stack_flags =
        PageTableFlags::WRITABLE | PageTableFlags::USER | PageTableFlags::NO_EXECUTE;
    for i in 0..stack_pages {
        let map = unsafe {
            paging::map_page_in(
                hhdm,
                page_table,
                VirtAddr::new(stack_base_va + i as u64 * PAGE_SIZE),
                stack_phys + i as u64 * PAGE_SIZE,
                stack_flags,
                vmm::nx_supported(),
                &mut PmmFrames,
            )
        };
        if map.is_err() {
            // Frames mapped so far are reclaimed by the teardown; the
            // rest of the contiguous run must be freed by hand.
            for j in (i)..stack_pages {
                pmm::free_frame(stack_phys + j as u64 * PAGE_SIZE);
            }
            pmm::free_frame(guard_phys);
            vmm::delete_address_space(page_table);
            return None;
        }
    }
    let guard_map = unsafe {
        paging::map_page_in(
            hhdm,
            page_table,
            VirtAddr::new(stack_base_va - PAGE_SIZE),
            guard_phys,
            PageTableFlags::NO_EXECUTE, // present, read-only, ring 0 only
            vmm::nx_supported(),
            &mut PmmFrames,
        )
    };
    if guard_map.is_err() {
        pmm::free_frame(guard_phys);
        vmm::delete_address_space(page_table);
        return None;
    }

    // The stack frames are physically contiguous, so their HHDM view is
    // one flat region the argument-block builder can write into.
    let stack_slice = unsafe {
        core::slice::from_raw_parts_mut(
            stack_phys.to_virt(hhdm).as_mut_ptr::<u8>(),
            USER_STACK_SIZE as usize,
        )
    };
    let Some(block) = build_argument_block(stack_slice, stack_base_va, argv, envp) else {
        log::error!("argument block does not fit the stack");
        vmm::delete_address_space(page_table);
        return None;
    };

    Some(UserImage {
        page_table,
        entry: loaded.entry,
        user_rsp: block.rsp,
        brk: (loaded.top_addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1),
        argv_ptr: block.argv_ptr,
        envp_ptr: block.envp_ptr,
    })
}

/// Dispatches a Ready task immediately, recording the argument pointers
/// the caller passes along.
#[allow(dead_code)]
pub fn execute_task(tid: u32, argc: i32, argv: u64, envp: u64) -> bool {
    let decision = {
        let mut table = TASKS.lock();
        let Some(idx) = table.find_by_tid(tid) else {
            log::warn!("execute of unknown tid {}", tid);
            return false;
        };
        if table.tasks[idx].state != TaskState::Ready {
            log::warn!("execute of non-ready tid {}", tid);
            return false;
        }
        table.tasks[idx].argc = argc;
        table.tasks[idx].argv = argv;
        table.tasks[idx].envp = envp;

        table.remove_from_ready(idx);
        let cur = table.current;
        if cur != IDLE && table.tasks[cur].state == TaskState::Running {
            table.tasks[cur].state = TaskState::Ready;
            table.enqueue_ready(cur);
        }
        Some(table.take_switch(idx))
    };

    if let Some(sw) = decision {
        do_switch(sw);
    }
    true
}

// =============================================================================
// Syscall support: fork, execve, brk bookkeeping
// =============================================================================

/// Records the user-mode resume point captured by the syscall trampoline
/// into the current task's context. Runs at dispatcher entry with
/// interrupts still masked.
pub fn record_syscall_entry(saved: SyscallSaved) {
    let mut table = TASKS.lock();
    let cur = table.current;
    let ctx = &mut table.tasks[cur].ctx;
    ctx.rbx = saved.rbx;
    ctx.rbp = saved.rbp;
    ctx.r12 = saved.r12;
    ctx.r13 = saved.r13;
    ctx.r14 = saved.r14;
    ctx.r15 = saved.r15;
    ctx.rip = saved.rip;
    ctx.rsp = saved.rsp;
    ctx.rflags = saved.rflags | 0x202;
}

/// Forks the current task: deep-copies its address space, clones its
/// context with RAX = 0 and queues the child. Returns the child TID to
/// the parent, or 0 on failure.
pub fn fork_current() -> u32 {
    // Snapshot the parent under the lock, then do the expensive copy
    // outside it.
    let (parent_pml4, parent_snapshot) = {
        let table = TASKS.lock();
        let cur = table.current;
        if cur == IDLE {
            log::error!("fork from the idle task");
            return 0;
        }
        (table.tasks[cur].page_table, snapshot_for_fork(&table.tasks[cur]))
    };

    let Some(child_pml4) = vmm::clone_address_space(parent_pml4) else {
        log::error!("fork: address space clone failed");
        return 0;
    };
    let Some(kernel_stack) = pmm::alloc_frames(KERNEL_STACK_PAGES) else {
        log::error!("fork: no kernel stack");
        vmm::delete_address_space(child_pml4);
        return 0;
    };
    let kstack_top = kernel_stack.to_virt(vmm::hhdm_offset()).as_u64() + KERNEL_STACK_SIZE;

    let tid = {
        let mut table = TASKS.lock();
        let Some(slot) = table.alloc_slot() else {
            drop(table);
            log::error!("fork: task table full");
            vmm::delete_address_space(child_pml4);
            pmm::free_frames(kernel_stack, KERNEL_STACK_PAGES);
            return 0;
        };
        let tid = table.alloc_tid();
        let start_time = table.ticks;

        let task = &mut table.tasks[slot];
        *task = Task::empty();
        task.tid = tid;
        task.name = parent_snapshot.name;
        task.name_len = parent_snapshot.name_len;
        task.base_priority = parent_snapshot.base_priority;
        task.dynamic_priority = parent_snapshot.base_priority;
        task.quantum = DEFAULT_QUANTUM;
        task.start_time = start_time;
        task.page_table = child_pml4;
        task.user_stack_top = parent_snapshot.user_stack_top;
        task.user_stack_size = parent_snapshot.user_stack_size;
        task.brk = parent_snapshot.brk;
        task.kernel_stack = kernel_stack;
        task.kstack_top = kstack_top;
        task.argc = parent_snapshot.argc;
        task.argv = parent_snapshot.argv;
        task.envp = parent_snapshot.envp;

        // The child resumes at the instruction after SYSCALL with the
        // parent's registers — except RAX, which reads 0.
        task.ctx = parent_snapshot.ctx;
        task.ctx.rax = 0;
        task.ctx.cr3 = child_pml4.as_u64();
        // SAFETY: freshly allocated kernel stack, visible through HHDM.
        task.kernel_rsp = unsafe { context::prime_kernel_stack(kstack_top, task_bootstrap) };

        table.enqueue_ready(slot);
        table.created += 1;
        table.live += 1;
        tid
    };

    log::debug!("fork: child {}", tid);
    tid
}

struct ForkSnapshot {
    name: [u8; TASK_NAME_LEN],
    name_len: usize,
    base_priority: Priority,
    user_stack_top: u64,
    user_stack_size: u64,
    brk: u64,
    argc: i32,
    argv: u64,
    envp: u64,
    ctx: CpuContext,
}

fn snapshot_for_fork(task: &Task) -> ForkSnapshot {
    ForkSnapshot {
        name: task.name,
        name_len: task.name_len,
        base_priority: task.base_priority,
        user_stack_top: task.user_stack_top,
        user_stack_size: task.user_stack_size,
        brk: task.brk,
        argc: task.argc,
        argv: task.argv,
        envp: task.envp,
        ctx: task.ctx,
    }
}

/// A replacement image built by `prepare_exec`, awaiting `commit_exec`.
pub struct ExecImage {
    image: UserImage,
    argc: i32,
}

/// Builds the replacement image for execve without touching the current
/// task. Failures here leave the old image fully intact.
pub fn prepare_exec(elf_data: &[u8], argv: &[&str], envp: &[&str]) -> Option<ExecImage> {
    {
        let table = TASKS.lock();
        if table.current == IDLE {
            log::error!("execve from the idle task");
            return None;
        }
    }
    build_user_image(elf_data, argv, envp).map(|image| ExecImage {
        image,
        argc: argv.len() as i32,
    })
}

/// Commits a prepared execve: swaps the current task onto the new
/// address space, destroys the old one and enters the new image in user
/// mode. Does not return.
pub fn commit_exec(prepared: ExecImage) -> ! {
    let ExecImage { image, argc } = prepared;

    let (old_pml4, ctx_ptr) = {
        let mut table = TASKS.lock();
        let cur = table.current;
        let task = &mut table.tasks[cur];
        let old_pml4 = core::mem::replace(&mut task.page_table, image.page_table);
        task.brk = image.brk;
        task.user_stack_top = USER_STACK_TOP;
        task.user_stack_size = USER_STACK_SIZE;
        task.argc = argc;
        task.argv = image.argv_ptr;
        task.envp = image.envp_ptr;
        task.ctx = initial_user_context(&image);
        (old_pml4, &task.ctx as *const CpuContext)
    };

    // Run on the new tables, then tear the old image down.
    crate::arch::cpu::interrupt_disable();
    vmm::switch_address_space(image.page_table);
    vmm::delete_address_space(old_pml4);

    // SAFETY: the context was initialized above and points into the
    // static task table.
    unsafe { task_restore_context(ctx_ptr) }
}

/// Current task's program break.
pub fn current_brk() -> u64 {
    let table = TASKS.lock();
    table.tasks[table.current].brk
}

/// Updates the current task's program break after a successful grow.
pub fn set_current_brk(brk: u64) {
    let mut table = TASKS.lock();
    let cur = table.current;
    table.tasks[cur].brk = brk;
}

// =============================================================================
// Argument block
// =============================================================================

/// Where the argument block landed on a fresh user stack.
#[derive(Debug, Clone, Copy)]
struct ArgBlock {
    /// Initial user RSP: 16-byte aligned, pointing at argc.
    rsp: u64,
    /// User VA of argv[0]'s slot.
    argv_ptr: u64,
    /// User VA of envp[0]'s slot.
    envp_ptr: u64,
}

/// Writes a Linux-style process argument block at the top of a user
/// stack region.
///
/// `region` is the kernel-visible stack memory; `region_base_va` is the
/// user VA of its first byte. Layout from the returned RSP upward:
///
/// ```text
///   [rsp]        argc
///   [rsp + 8]    argv[0] … argv[argc-1], NULL
///   ...          envp[0] … envp[envc-1], NULL
///   ...          auxv: AT_NULL, 0
///   ...          the string bytes themselves (NUL-terminated)
/// ```
fn build_argument_block(
    region: &mut [u8],
    region_base_va: u64,
    argv: &[&str],
    envp: &[&str],
) -> Option<ArgBlock> {
    if argv.len() > MAX_ARGS || envp.len() > MAX_ARGS {
        return None;
    }

    let mut argv_vas = [0u64; MAX_ARGS];
    let mut envp_vas = [0u64; MAX_ARGS];
    let mut cursor = region.len();

    let mut place = |strings: &[&str], vas: &mut [u64], cursor: &mut usize| -> bool {
        for (i, s) in strings.iter().enumerate() {
            let need = s.len() + 1;
            if *cursor < need {
                return false;
            }
            *cursor -= need;
            region_copy(region, *cursor, s.as_bytes());
            vas[i] = region_base_va + *cursor as u64;
        }
        true
    };

    if !place(envp, &mut envp_vas, &mut cursor) {
        return None;
    }
    if !place(argv, &mut argv_vas, &mut cursor) {
        return None;
    }

    // argc + argv... + NULL + envp... + NULL + auxv (AT_NULL, 0).
    let words = 1 + argv.len() + 1 + envp.len() + 1 + 2;
    let bytes = words * 8;
    if cursor < bytes {
        return None;
    }
    let mut vec_off = cursor - bytes;
    // The ABI wants RSP ≡ 0 (mod 16) with argc at RSP.
    vec_off &= !0xF;

    let mut w = vec_off;
    let mut push = |value: u64, w: &mut usize| {
        region[*w..*w + 8].copy_from_slice(&value.to_le_bytes());
        *w += 8;
    };
    push(argv.len() as u64, &mut w);
    for va in argv_vas.iter().take(argv.len()) {
        push(*va, &mut w);
    }
    push(0, &mut w);
    for va in envp_vas.iter().take(envp.len()) {
        push(*va, &mut w);
    }
    push(0, &mut w);
    push(0, &mut w); // AT_NULL
    push(0, &mut w);

    let rsp = region_base_va + vec_off as u64;
    Some(ArgBlock {
        rsp,
        argv_ptr: rsp + 8,
        envp_ptr: rsp + 8 * (argv.len() as u64 + 2),
    })
}

/// Copies `bytes` plus a NUL terminator into `region` at `off`.
fn region_copy(region: &mut [u8], off: usize, bytes: &[u8]) {
    region[off..off + bytes.len()].copy_from_slice(bytes);
    region[off + bytes.len()] = 0;
}

// =============================================================================
// Tests: the table, queues and policy on fabricated tasks
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Fabricates a Ready task without any memory behind it.
    fn spawn_fake(table: &mut TaskTable, quantum: u64) -> usize {
        let slot = table.alloc_slot().expect("slot available");
        let tid = table.alloc_tid();
        table.tasks[slot] = Task::empty();
        table.tasks[slot].tid = tid;
        table.tasks[slot].quantum = quantum;
        table.enqueue_ready(slot);
        slot
    }

    fn ready_order(table: &TaskTable) -> Vec<usize> {
        let mut order = Vec::new();
        let mut cursor = table.ready_head;
        while let Some(i) = cursor {
            order.push(i);
            cursor = table.tasks[i].next;
        }
        order
    }

    fn ready_order_rev(table: &TaskTable) -> Vec<usize> {
        let mut order = Vec::new();
        let mut cursor = table.ready_tail;
        while let Some(i) = cursor {
            order.push(i);
            cursor = table.tasks[i].prev;
        }
        order.reverse();
        order
    }

    #[test]
    fn slot_allocation_skips_idle_and_reuses_terminated() {
        let mut table = TaskTable::new();
        let a = table.alloc_slot().unwrap();
        assert_ne!(a, IDLE);
        table.tasks[a].state = TaskState::Running;
        let b = table.alloc_slot().unwrap();
        assert_ne!(a, b);

        table.tasks[a].state = TaskState::Terminated;
        assert_eq!(table.alloc_slot(), Some(a), "terminated slots are reused");

        table.tasks[a].needs_reap = true;
        assert_eq!(table.alloc_slot(), Some(b), "unreaped corpses are not");
    }

    #[test]
    fn tid_allocation_skips_zero_on_wrap() {
        let mut table = TaskTable::new();
        table.next_tid = u32::MAX;
        assert_eq!(table.alloc_tid(), u32::MAX);
        assert_eq!(table.alloc_tid(), 1, "TID 0 stays reserved for idle");
    }

    #[test]
    fn ready_queue_is_fifo_and_consistent_both_ways() {
        let mut table = TaskTable::new();
        let a = spawn_fake(&mut table, 2);
        let b = spawn_fake(&mut table, 2);
        let c = spawn_fake(&mut table, 2);

        assert_eq!(ready_order(&table), vec![a, b, c]);
        assert_eq!(ready_order_rev(&table), vec![a, b, c]);
        // Head's prev and tail's next are always None.
        assert_eq!(table.tasks[a].prev, None);
        assert_eq!(table.tasks[c].next, None);

        // Removing the middle keeps both traversals equal.
        table.remove_from_ready(b);
        assert_eq!(ready_order(&table), vec![a, c]);
        assert_eq!(ready_order_rev(&table), vec![a, c]);

        assert_eq!(table.dequeue_ready(), Some(a));
        assert_eq!(table.dequeue_ready(), Some(c));
        assert_eq!(table.dequeue_ready(), None);
        assert_eq!(table.ready_tail, None);
    }

    #[test]
    fn round_robin_charges_quantum_sized_runs() {
        let mut table = TaskTable::new();
        table.tasks[IDLE].state = TaskState::Running;
        let t1 = spawn_fake(&mut table, 2);
        let t2 = spawn_fake(&mut table, 2);

        // First tick: idle cedes to T1 immediately, nothing charged yet.
        let next = table.tick().expect("dispatch from idle");
        assert_eq!(next, t1);
        table.take_switch(next);

        // Ten ticks: strict FIFO with quantum 2 charges T1,T1,T2,T2,...
        let mut charged = Vec::new();
        for _ in 0..10 {
            let before: Vec<u64> = table.tasks.iter().map(|t| t.cpu_time).collect();
            if let Some(next) = table.tick() {
                table.take_switch(next);
            }
            for i in 0..MAX_TASKS {
                if table.tasks[i].cpu_time != before[i] {
                    charged.push(table.tasks[i].tid);
                }
            }
        }
        let t1_tid = table.tasks[t1].tid;
        let t2_tid = table.tasks[t2].tid;
        assert_eq!(
            charged,
            vec![t1_tid, t1_tid, t2_tid, t2_tid, t1_tid, t1_tid, t2_tid, t2_tid, t1_tid, t1_tid]
        );
    }

    #[test]
    fn sole_task_is_redispatched_in_place() {
        let mut table = TaskTable::new();
        table.tasks[IDLE].state = TaskState::Running;
        let t1 = spawn_fake(&mut table, 2);

        let next = table.tick().unwrap();
        table.take_switch(next);

        // Quantum expiry with an empty queue: T1 keeps the CPU, stays
        // Running, is in no queue, and its accounting resets.
        for _ in 0..2 {
            assert_eq!(table.tick(), None);
        }
        assert_eq!(table.tasks[t1].state, TaskState::Running);
        assert_eq!(table.current, t1);
        assert_eq!(table.ready_head, None);
        assert_eq!(table.tasks[t1].last_schedule, table.tasks[t1].cpu_time);
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let mut table = TaskTable::new();
        table.tasks[IDLE].state = TaskState::Running;

        // Nothing ready: every tick keeps idle in place.
        assert_eq!(table.tick(), None);
        assert_eq!(table.current, IDLE);

        let t1 = spawn_fake(&mut table, 2);
        let next = table.tick().unwrap();
        assert_eq!(next, t1);
        table.take_switch(next);

        // T1 blocks; the next tick falls back to idle.
        table.push_blocked(t1);
        let next = table.tick().unwrap();
        assert_eq!(next, IDLE);
        table.take_switch(next);
        assert_eq!(table.tasks[IDLE].state, TaskState::Running);
    }

    #[test]
    fn blocked_queue_round_trip() {
        let mut table = TaskTable::new();
        let a = spawn_fake(&mut table, 2);
        let b = spawn_fake(&mut table, 2);
        table.remove_from_ready(a);
        table.remove_from_ready(b);

        table.push_blocked(a);
        table.push_blocked(b);
        assert_eq!(table.tasks[a].state, TaskState::Blocked);

        table.remove_from_blocked(a);
        assert_eq!(table.blocked_head, Some(b));
        table.remove_from_blocked(b);
        assert_eq!(table.blocked_head, None);
    }

    #[test]
    fn at_most_one_running_task() {
        let mut table = TaskTable::new();
        table.tasks[IDLE].state = TaskState::Running;
        let _ = spawn_fake(&mut table, 1);
        let _ = spawn_fake(&mut table, 1);

        for _ in 0..20 {
            if let Some(next) = table.tick() {
                table.take_switch(next);
            }
            let running = table
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();
            assert_eq!(running, 1);
            assert_eq!(table.tasks[table.current].state, TaskState::Running);
        }
    }

    #[test]
    fn argument_block_layout() {
        let mut region = vec![0u8; 0x2000];
        let base_va = 0xEFFF_E000u64;
        let block =
            build_argument_block(&mut region, base_va, &["init", "-v"], &["TERM=helios"]).unwrap();

        assert_eq!(block.rsp % 16, 0, "ABI requires 16-byte alignment");

        let read_u64 = |va: u64| {
            let off = (va - base_va) as usize;
            u64::from_le_bytes(region[off..off + 8].try_into().unwrap())
        };
        let read_str = |va: u64| {
            let off = (va - base_va) as usize;
            let len = region[off..].iter().position(|&b| b == 0).unwrap();
            std::str::from_utf8(&region[off..off + len]).unwrap().to_owned()
        };

        // argc at RSP.
        assert_eq!(read_u64(block.rsp), 2);
        // argv entries and NULL terminator.
        assert_eq!(read_str(read_u64(block.argv_ptr)), "init");
        assert_eq!(read_str(read_u64(block.argv_ptr + 8)), "-v");
        assert_eq!(read_u64(block.argv_ptr + 16), 0);
        // envp entries and NULL terminator.
        assert_eq!(read_str(read_u64(block.envp_ptr)), "TERM=helios");
        assert_eq!(read_u64(block.envp_ptr + 8), 0);
        // auxv: AT_NULL, 0.
        assert_eq!(read_u64(block.envp_ptr + 16), 0);
        assert_eq!(read_u64(block.envp_ptr + 24), 0);
    }

    #[test]
    fn argument_block_rejects_overflow() {
        // 38 string bytes + 48 vector bytes cannot fit in 64.
        let mut region = vec![0u8; 64];
        let long = "a-much-too-long-string-for-this-stack";
        assert!(build_argument_block(&mut region, 0x1000, &[long], &[]).is_none());

        let mut tiny = vec![0u8; 8];
        assert!(build_argument_block(&mut tiny, 0x1000, &["hello"], &["A=B"]).is_none());
    }
}
