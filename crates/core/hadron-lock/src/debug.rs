//! Lock state dumps for the kernel debugger.
//!
//! Each lock kind can produce a snapshot (`*Info`) taken under the
//! coordinator, which prints in the layout the debugger console shows. The
//! [`commands`] table exposes the `mutex` and `rwlock` console commands that
//! dump a lock given its address.

use core::fmt;

use planck_noalloc::vec::ArrayVec;

use crate::sched::Scheduler;
use crate::sync::{Mutex, MutexFlags, RwLock, RwLockFlags, WaitQueue, WaiterRole};
use crate::ThreadId;

/// Maximum number of waiters recorded in one snapshot.
pub const MAX_DUMP_WAITERS: usize = 32;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// The queued threads of a lock, in queue order.
pub struct WaiterList {
    threads: ArrayVec<(ThreadId, WaiterRole), MAX_DUMP_WAITERS>,
    omitted: usize,
}

impl WaiterList {
    /// Copies the queue's thread ids. Waiters beyond [`MAX_DUMP_WAITERS`]
    /// are only counted.
    pub(crate) fn collect(queue: &WaitQueue) -> Self {
        let mut threads = ArrayVec::new();
        let mut omitted = 0;
        for entry in queue.iter() {
            if threads.is_full() {
                omitted += 1;
            } else {
                threads.push(entry);
            }
        }
        Self { threads, omitted }
    }

    /// Returns the recorded waiters.
    pub fn threads(&self) -> &[(ThreadId, WaiterRole)] {
        self.threads.as_slice()
    }

    /// Returns the number of waiters, including omitted ones.
    pub fn len(&self) -> usize {
        self.threads.len() + self.omitted
    }

    /// Returns `true` if nobody was waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of waiters that did not fit in the snapshot.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, with_roles: bool) -> fmt::Result {
        f.write_str("  waiting threads:")?;
        for (thread, role) in self.threads() {
            if with_roles {
                write!(f, " {thread}/{}", role.tag())?;
            } else {
                write!(f, " {thread}")?;
            }
        }
        if self.omitted > 0 {
            write!(f, " ... ({} more)", self.omitted)?;
        }
        writeln!(f)
    }
}

impl fmt::Debug for WaiterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterList")
            .field("threads", &self.threads())
            .field("omitted", &self.omitted)
            .finish()
    }
}

struct Holder(Option<ThreadId>);

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(thread) => write!(f, "{thread}"),
            None => f.write_str("none"),
        }
    }
}

/// Snapshot of a [`Mutex`].
#[derive(Debug)]
pub struct MutexInfo<'a> {
    /// Address of the mutex.
    pub addr: usize,
    /// Lock name.
    pub name: &'a str,
    /// Flags at the time of the snapshot.
    pub flags: MutexFlags,
    /// Holding thread.
    pub holder: Option<ThreadId>,
    /// Raw lock count: 0 free, -1 held, lower values held with waiters.
    pub count: i32,
    /// Queued threads.
    pub waiters: WaiterList,
}

impl fmt::Display for MutexInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mutex {:#x}:", self.addr)?;
        writeln!(f, "  name:            {}", self.name)?;
        writeln!(f, "  flags:           {:#x}", self.flags.bits())?;
        writeln!(f, "  holder:          {}", Holder(self.holder))?;
        writeln!(f, "  count:           {}", self.count)?;
        self.waiters.write(f, false)
    }
}

/// Snapshot of a [`RecursiveLock`](crate::sync::RecursiveLock).
#[derive(Debug)]
pub struct RecursiveLockInfo<'a> {
    /// Holding thread.
    pub holder: Option<ThreadId>,
    /// Nesting depth of the holder.
    pub recursion: u32,
    /// The underlying mutex.
    pub mutex: MutexInfo<'a>,
}

impl fmt::Display for RecursiveLockInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "recursive lock holder: {}", Holder(self.holder))?;
        writeln!(f, "recursion:             {}", self.recursion)?;
        fmt::Display::fmt(&self.mutex, f)
    }
}

/// Snapshot of an [`RwLock`].
#[derive(Debug)]
pub struct RwLockInfo<'a> {
    /// Address of the lock.
    pub addr: usize,
    /// Lock name.
    pub name: &'a str,
    /// Flags at the time of the snapshot.
    pub flags: RwLockFlags,
    /// Thread holding the write lock.
    pub holder: Option<ThreadId>,
    /// Raw composite count.
    pub count: i64,
    /// Readers a waiting writer still waits for.
    pub active_readers: i64,
    /// Readers let in ahead of the next writer.
    pub pending_readers: i64,
    /// Write-lock nesting depth of the holder.
    pub write_depth: u32,
    /// Read locks the write holder took on top of its write lock.
    pub self_reads: u32,
    /// Queued threads.
    pub waiters: WaiterList,
}

impl fmt::Display for RwLockInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rw lock {:#x}:", self.addr)?;
        writeln!(f, "  name:            {}", self.name)?;
        writeln!(f, "  holder:          {}", Holder(self.holder))?;
        writeln!(f, "  count:           {:#x}", self.count)?;
        writeln!(f, "  active readers   {}", self.active_readers)?;
        writeln!(f, "  pending readers  {}", self.pending_readers)?;
        writeln!(f, "  owner count:     {}", self.write_depth)?;
        writeln!(f, "  self reads:      {}", self.self_reads)?;
        writeln!(f, "  flags:           {:#x}", self.flags.bits())?;
        self.waiters.write(f, true)
    }
}

// ---------------------------------------------------------------------------
// Console commands
// ---------------------------------------------------------------------------

/// Handler of a [`DebugCommand`]: writes the dump of the object at the given
/// address.
///
/// # Safety
///
/// The address must point to a live object of the type the command dumps.
pub type DumpFn = unsafe fn(&mut dyn fmt::Write, usize) -> fmt::Result;

/// A debugger console command.
#[derive(Clone, Copy)]
pub struct DebugCommand {
    /// Command name.
    pub name: &'static str,
    /// One-line help.
    pub help: &'static str,
    /// Handler.
    pub handler: DumpFn,
}

impl fmt::Debug for DebugCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugCommand")
            .field("name", &self.name)
            .field("help", &self.help)
            .finish_non_exhaustive()
    }
}

/// Returns the `mutex` and `rwlock` commands for locks bound to `S`.
pub fn commands<S: Scheduler + 'static>() -> [DebugCommand; 2] {
    [
        DebugCommand {
            name: "mutex",
            help: "Dump info about a mutex",
            handler: dump_mutex::<S>,
        },
        DebugCommand {
            name: "rwlock",
            help: "Dump info about an rw lock",
            handler: dump_rwlock::<S>,
        },
    ]
}

/// Runs a console line such as `mutex 0xffff8000_0012_3400` against
/// `commands`.
///
/// Usage errors (unknown command, missing or malformed address) are reported
/// on `out`.
///
/// # Safety
///
/// A well-formed address given to a command must point to a live lock of
/// the kind that command dumps.
pub unsafe fn execute(
    commands: &[DebugCommand],
    line: &str,
    out: &mut dyn fmt::Write,
) -> fmt::Result {
    let mut args = line.split_whitespace();
    let Some(name) = args.next() else {
        return Ok(());
    };
    let Some(cmd) = commands.iter().find(|c| c.name == name) else {
        return writeln!(out, "Unknown command: '{name}'");
    };
    let Some(arg) = args.next() else {
        return writeln!(out, "usage: {} <address>\n{}", cmd.name, cmd.help);
    };
    match parse_address(arg) {
        // SAFETY: Forwarded from the caller.
        Some(addr) => unsafe { (cmd.handler)(out, addr) },
        None => writeln!(out, "invalid address: {arg}"),
    }
}

fn parse_address(arg: &str) -> Option<usize> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    let digits: ArrayVec<u8, 32> = {
        let mut buf = ArrayVec::new();
        for b in digits.bytes().filter(|&b| b != b'_') {
            if buf.is_full() {
                return None;
            }
            buf.push(b);
        }
        buf
    };
    let digits = core::str::from_utf8(digits.as_slice()).ok()?;
    match usize::from_str_radix(digits, 16) {
        Ok(0) | Err(_) => None,
        Ok(addr) => Some(addr),
    }
}

/// # Safety
///
/// `addr` must point to a live `Mutex<S>`.
unsafe fn dump_mutex<S: Scheduler + 'static>(out: &mut dyn fmt::Write, addr: usize) -> fmt::Result {
    if addr % align_of::<Mutex<S>>() != 0 {
        return writeln!(out, "invalid address: {addr:#x}");
    }
    // SAFETY: The caller guarantees that `addr` points to a live mutex.
    let mutex = unsafe { &*core::ptr::with_exposed_provenance::<Mutex<S>>(addr) };
    write!(out, "{}", mutex.info())
}

/// # Safety
///
/// `addr` must point to a live `RwLock<S>`.
unsafe fn dump_rwlock<S: Scheduler + 'static>(out: &mut dyn fmt::Write, addr: usize) -> fmt::Result {
    if addr % align_of::<RwLock<S>>() != 0 {
        return writeln!(out, "invalid address: {addr:#x}");
    }
    // SAFETY: The caller guarantees that `addr` points to a live rw lock.
    let lock = unsafe { &*core::ptr::with_exposed_provenance::<RwLock<S>>(addr) };
    write!(out, "{}", lock.info())
}
