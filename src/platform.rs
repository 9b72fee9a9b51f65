//! The machine interface the scheduler runs against.
//!
//! The scheduler consumes exactly five primitives plus one optional power
//! hint; everything else (interrupt wiring, register formats, APIC ids) is
//! the kernel's business. Implementations must be callable from interrupt
//! context: no allocation, no blocking.

/// Process identifier as handed over by the process layer.
pub type Pid = u32;

pub trait Platform {
    /// Monotonic timestamp in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Logical id of the CPU executing the call.
    fn current_cpu_id(&self) -> u32;

    /// Arm the per-CPU timer so the next tick fires after `interval_ns`.
    fn arm_timer(&self, interval_ns: u64);

    /// Swap register state. `None` stands for the per-CPU idle task.
    ///
    /// Called with no runqueue lock held. When it returns, the CPU is
    /// executing `next`.
    fn switch_context(&self, prev: Option<Pid>, next: Option<Pid>);

    /// Spin-wait hint.
    fn cpu_relax(&self);

    /// Frequency hint for one CPU. Purely advisory; the default ignores it.
    fn frequency_hint(&self, _cpu_id: u32, _mhz: u32) {}
}
