//! Per-CPU run queues
//!
//! Each CPU owns one `CpuRunQueue` behind its own spinlock. Entities
//! assigned to the CPU live in a fixed-size arena inside the runqueue; the
//! five MLFQ levels plus the RT and gaming queues are intrusive
//! doubly-linked lists whose links are slot indices into that arena, so
//! enqueue, dequeue and requeue are O(1) with no allocation.
//!
//! The arena is also the ownership boundary: an entity exists in exactly
//! one CPU's arena at a time, and migration moves the value under both
//! runqueue locks.

use super::types::{
    ClassParams, EntityState, QueueId, RtPolicy, SchedClass, SchedEntity, SchedError, MLFQ_LEVELS,
    MLFQ_QUANTUM_NS,
};

/// Maximum entities per CPU arena.
pub const RQ_CAP: usize = 64;

/// Frame deadlines within this window win the gaming queue on pick-next.
pub const PICK_URGENCY_NS: u64 = 500_000;

/// What the CPU is running: the distinguished idle task or an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Current {
    Idle,
    Task(u16),
}

/// One intrusive queue: head/tail slot indices plus a count.
#[derive(Clone, Copy, Debug)]
pub struct Queue {
    pub head: Option<u16>,
    pub tail: Option<u16>,
    pub count: u32,
}

impl Queue {
    pub const EMPTY: Queue = Queue {
        head: None,
        tail: None,
        count: 0,
    };
}

/// 1/5/15-minute load averages, fixed-point scaled by 1024.
///
/// Sampled from the runnable count on every tick and smoothed with
/// exponential moving averages of increasing horizon.
#[derive(Clone, Copy, Debug)]
pub struct LoadAvg {
    pub one: u64,
    pub five: u64,
    pub fifteen: u64,
}

impl LoadAvg {
    pub const ZERO: LoadAvg = LoadAvg {
        one: 0,
        five: 0,
        fifteen: 0,
    };

    pub fn sample(&mut self, runnable: u32) {
        let cur = runnable as u64 * 1024;
        self.one = (self.one * 7 + cur) / 8;
        self.five = (self.five * 31 + cur) / 32;
        self.fifteen = (self.fifteen * 63 + cur) / 64;
    }
}

/// Per-CPU run queue: entity arena, MLFQ levels, RT queue, gaming queue.
pub struct CpuRunQueue {
    pub cpu_id: u32,
    tasks: [Option<SchedEntity>; RQ_CAP],
    pub mlfq: [Queue; MLFQ_LEVELS],
    pub rt: Queue,
    pub gaming: Queue,
    pub current: Current,
    pub last_tick_ns: u64,
    pub last_aging_ns: u64,
    pub idle_ns: u64,
    pub load: LoadAvg,
}

impl CpuRunQueue {
    pub const fn new(cpu_id: u32) -> Self {
        Self {
            cpu_id,
            tasks: [None; RQ_CAP],
            mlfq: [Queue::EMPTY; MLFQ_LEVELS],
            rt: Queue::EMPTY,
            gaming: Queue::EMPTY,
            current: Current::Idle,
            last_tick_ns: 0,
            last_aging_ns: 0,
            idle_ns: 0,
            load: LoadAvg::ZERO,
        }
    }

    // ------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------

    /// Insert an entity into the arena. The entity is not linked anywhere.
    pub fn insert(&mut self, entity: SchedEntity) -> Result<u16, SchedError> {
        debug_assert!(entity.queue.is_none());
        for (slot, cell) in self.tasks.iter_mut().enumerate() {
            if cell.is_none() {
                *cell = Some(entity);
                return Ok(slot as u16);
            }
        }
        Err(SchedError::TableFull)
    }

    /// Remove an entity from the arena. It must already be unlinked.
    pub fn remove(&mut self, slot: u16) -> SchedEntity {
        let entity = self.tasks[slot as usize].take().expect("empty arena slot");
        debug_assert!(entity.queue.is_none());
        entity
    }

    #[inline]
    pub fn task(&self, slot: u16) -> &SchedEntity {
        self.tasks[slot as usize].as_ref().expect("empty arena slot")
    }

    #[inline]
    pub fn task_mut(&mut self, slot: u16) -> &mut SchedEntity {
        self.tasks[slot as usize].as_mut().expect("empty arena slot")
    }

    pub fn find(&self, pid: u32) -> Option<u16> {
        for (slot, cell) in self.tasks.iter().enumerate() {
            if let Some(e) = cell {
                if e.pid == pid {
                    return Some(slot as u16);
                }
            }
        }
        None
    }

    /// Iterate occupied arena slots.
    pub fn slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| i as u16)
    }

    // ------------------------------------------------------------------
    // Queue linkage
    // ------------------------------------------------------------------

    fn queue_mut(&mut self, id: QueueId) -> &mut Queue {
        match id {
            QueueId::Mlfq(level) => &mut self.mlfq[level as usize],
            QueueId::Rt => &mut self.rt,
            QueueId::Gaming => &mut self.gaming,
        }
    }

    pub fn queue(&self, id: QueueId) -> &Queue {
        match id {
            QueueId::Mlfq(level) => &self.mlfq[level as usize],
            QueueId::Rt => &self.rt,
            QueueId::Gaming => &self.gaming,
        }
    }

    /// Link an unlinked entity at the tail of `id`.
    pub fn link_tail(&mut self, id: QueueId, slot: u16) {
        debug_assert!(self.task(slot).queue.is_none(), "entity already queued");
        let old_tail = self.queue(id).tail;
        {
            let e = self.task_mut(slot);
            e.queue = Some(id);
            e.prev = old_tail;
            e.next = None;
            e.state = EntityState::Queued;
        }
        if let Some(t) = old_tail {
            self.task_mut(t).next = Some(slot);
        }
        let q = self.queue_mut(id);
        if q.head.is_none() {
            q.head = Some(slot);
        }
        q.tail = Some(slot);
        q.count += 1;
    }

    /// Link an unlinked entity at the head of `id`.
    pub fn link_head(&mut self, id: QueueId, slot: u16) {
        debug_assert!(self.task(slot).queue.is_none(), "entity already queued");
        let old_head = self.queue(id).head;
        {
            let e = self.task_mut(slot);
            e.queue = Some(id);
            e.prev = None;
            e.next = old_head;
            e.state = EntityState::Queued;
        }
        if let Some(h) = old_head {
            self.task_mut(h).prev = Some(slot);
        }
        let q = self.queue_mut(id);
        if q.tail.is_none() {
            q.tail = Some(slot);
        }
        q.head = Some(slot);
        q.count += 1;
    }

    /// Unlink an entity from whatever queue it is on.
    pub fn unlink(&mut self, slot: u16) {
        let (id, prev, next) = {
            let e = self.task(slot);
            let id = e.queue.expect("entity not queued");
            (id, e.prev, e.next)
        };
        match prev {
            Some(p) => self.task_mut(p).next = next,
            None => self.queue_mut(id).head = next,
        }
        match next {
            Some(n) => self.task_mut(n).prev = prev,
            None => self.queue_mut(id).tail = prev,
        }
        let q = self.queue_mut(id);
        q.count -= 1;
        let e = self.task_mut(slot);
        e.queue = None;
        e.prev = None;
        e.next = None;
    }

    /// Collect the slots of one queue, head to tail. Used by passes that
    /// relink entities while walking (aging, gaming urgency).
    pub fn collect_queue(&self, id: QueueId, buf: &mut [u16; RQ_CAP]) -> usize {
        let mut n = 0;
        let mut cur = self.queue(id).head;
        while let Some(slot) = cur {
            buf[n] = slot;
            n += 1;
            cur = self.task(slot).next;
        }
        n
    }

    // ------------------------------------------------------------------
    // Enqueue / pick-next
    // ------------------------------------------------------------------

    /// Enqueue a runnable entity on its home queue (tail). Resets the MLFQ
    /// quantum and starts wait accounting.
    pub fn enqueue(&mut self, slot: u16, now: u64) {
        let id = {
            let e = self.task_mut(slot);
            e.wait_start_ns = now;
            if let ClassParams::Mlfq(m) = &mut e.params {
                m.quantum_remaining_ns = MLFQ_QUANTUM_NS[m.level as usize];
            }
            e.home_queue()
        };
        self.link_tail(id, slot);
    }

    /// Total runnable entities, counting a running non-idle `current`.
    pub fn runnable_count(&self) -> u32 {
        let mut n = 0;
        for q in &self.mlfq {
            n += q.count;
        }
        n += self.rt.count;
        n += self.gaming.count;
        if matches!(self.current, Current::Task(_)) {
            n += 1;
        }
        n
    }

    pub fn class_counts(&self) -> [u32; SchedClass::COUNT] {
        let mut counts = [0u32; SchedClass::COUNT];
        for slot in self.slots() {
            let e = self.task(slot);
            if e.state != EntityState::Blocked {
                counts[e.class().index()] += 1;
            }
        }
        counts
    }

    /// Choose the next entity without unlinking it.
    ///
    /// Order: gaming queue (earliest frame deadline within the urgency
    /// window, else FIFO head) when gaming mode is on, then the RT queue
    /// (EDF among deadline entities, else head; skipped entirely while
    /// throttled), then MLFQ levels 0..4.
    pub fn select_next(&self, now: u64, gaming_on: bool, rt_throttled: bool) -> Option<u16> {
        if gaming_on && self.gaming.count > 0 {
            let mut urgent: Option<(u16, u64)> = None;
            let mut cur = self.gaming.head;
            while let Some(slot) = cur {
                let e = self.task(slot);
                if let Some(g) = e.gaming() {
                    if g.frame_deadline_ns != 0 && g.frame_deadline_ns <= now + PICK_URGENCY_NS {
                        match urgent {
                            Some((_, d)) if d <= g.frame_deadline_ns => {}
                            _ => urgent = Some((slot, g.frame_deadline_ns)),
                        }
                    }
                }
                cur = e.next;
            }
            if let Some((slot, _)) = urgent {
                return Some(slot);
            }
            return self.gaming.head;
        }

        if !rt_throttled && self.rt.count > 0 {
            let mut edf: Option<(u16, u64)> = None;
            let mut cur = self.rt.head;
            while let Some(slot) = cur {
                let e = self.task(slot);
                if let Some(r) = e.rt() {
                    if r.policy == RtPolicy::Deadline {
                        let d = if r.deadline_ns == 0 {
                            u64::MAX
                        } else {
                            r.deadline_ns
                        };
                        match edf {
                            Some((_, best)) if best <= d => {}
                            _ => edf = Some((slot, d)),
                        }
                    }
                }
                cur = e.next;
            }
            if let Some((slot, _)) = edf {
                return Some(slot);
            }
            return self.rt.head;
        }

        for q in &self.mlfq {
            if let Some(head) = q.head {
                return Some(head);
            }
        }
        None
    }

    /// Choose and unlink the next entity.
    pub fn pick_next(&mut self, now: u64, gaming_on: bool, rt_throttled: bool) -> Option<u16> {
        let slot = self.select_next(now, gaming_on, rt_throttled)?;
        self.unlink(slot);
        Some(slot)
    }
}

// ============================================================================
// Tests
// ============================================================================
