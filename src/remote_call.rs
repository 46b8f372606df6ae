//! Synchronous function calls inside the target, built on ptrace.
//!
//! The engine hijacks whatever thread `PTRACE_ATTACH` stops: it snapshots
//! the register file, stages the call in a scratch copy, points the return
//! address at 0 and lets the target run. When the called function returns
//! it faults at address 0; that SIGSEGV is the completion signal. The
//! snapshot is restored before detaching on every path where the target is
//! still alive, so the hijacked thread never observes the call.
//!
//! A caller may supply a trap callback. While the call runs, every SIGTRAP
//! stop is handed to it; if it reports the trap as handled the engine steps
//! the instruction pointer past the trap instruction and resumes the
//! target. This is the rendezvous the injected trampoline uses when the
//! shared buffer fills.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::kernel_abi::{Arch, CallArgs, NativeArch};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::registers::{read_registers, write_registers, RegisterSet};
use crate::remote_mem;
use crate::remote_ptr::{RemotePtr, Void};

/// Return address staged for every injected call. Returning to it raises
/// SIGSEGV with a fault address of 0, which no real code fault produces on
/// our behalf, so call completion is unambiguous.
const SENTINEL_RETURN_ADDR: u64 = 0;

/// What the trap callback decided about a SIGTRAP stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapAction {
    /// The trap is handled; step past the trap instruction and resume.
    Resume,
    /// Abandon the call.
    Stop,
}

/// An attached target thread. Detaches on drop; the explicit [`detach`]
/// exists so the happy path can surface detach errors.
///
/// [`detach`]: PtracedTask::detach
pub struct PtracedTask {
    pid: Pid,
    attached: bool,
}

impl PtracedTask {
    /// `PTRACE_ATTACH` and wait for the resulting stop. EINTR is retried;
    /// the target exiting instead of stopping is an error.
    pub fn attach(pid: Pid) -> Result<PtracedTask> {
        ptrace::attach(pid).map_err(|errno| Error::Attach { pid, errno })?;
        let task = PtracedTask {
            pid,
            attached: true,
        };
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Wait { pid, errno }),
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    return Err(Error::TargetDied { pid })
                }
                Ok(WaitStatus::Stopped(..)) => break,
                // No ptrace options are set, so no other stop kinds are
                // expected; keep waiting.
                Ok(_) => continue,
            }
        }
        Ok(task)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn registers(&self) -> Result<RegisterSet> {
        read_registers(self.pid).map_err(|errno| Error::Ptrace {
            op: "getregs",
            pid: self.pid,
            errno,
        })
    }

    pub fn set_registers(&self, regs: &RegisterSet) -> Result<()> {
        write_registers(self.pid, regs).map_err(|errno| Error::Ptrace {
            op: "setregs",
            pid: self.pid,
            errno,
        })
    }

    pub fn cont(&self) -> Result<()> {
        ptrace::cont(self.pid, None).map_err(|errno| Error::Ptrace {
            op: "cont",
            pid: self.pid,
            errno,
        })
    }

    /// Block until the next status change, retrying EINTR.
    pub fn wait(&self) -> Result<WaitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Wait { pid: self.pid, errno }),
                Ok(status) => return Ok(status),
            }
        }
    }

    pub fn siginfo(&self) -> Result<libc::siginfo_t> {
        ptrace::getsiginfo(self.pid).map_err(|errno| Error::Ptrace {
            op: "getsiginfo",
            pid: self.pid,
            errno,
        })
    }

    pub fn detach(mut self) -> Result<()> {
        self.attached = false;
        ptrace::detach(self.pid, None).map_err(|errno| Error::Ptrace {
            op: "detach",
            pid: self.pid,
            errno,
        })
    }
}

impl Drop for PtracedTask {
    fn drop(&mut self) {
        if self.attached {
            if let Err(errno) = ptrace::detach(self.pid, None) {
                log!(LogWarn, "detach from {} failed: {}", self.pid, errno);
            }
        }
    }
}

/// Call `func(args...)` inside `pid` and return its value.
pub fn call_remote_function(
    pid: Pid,
    func: RemotePtr<Void>,
    args: &CallArgs,
) -> Result<u64> {
    do_call(pid, func, args, None)
}

/// Like [`call_remote_function`], dispatching SIGTRAP stops to `trap_cb`.
pub fn call_remote_function_with_trap_callback(
    pid: Pid,
    func: RemotePtr<Void>,
    args: &CallArgs,
    trap_cb: &mut dyn FnMut() -> TrapAction,
) -> Result<u64> {
    do_call(pid, func, args, Some(trap_cb))
}

fn do_call(
    pid: Pid,
    func: RemotePtr<Void>,
    args: &CallArgs,
    trap_cb: Option<&mut dyn FnMut() -> TrapAction>,
) -> Result<u64> {
    let task = PtracedTask::attach(pid)?;
    let saved = task.registers()?;

    let outcome = drive_call(&task, &saved, func, args, trap_cb);

    match outcome {
        Ok((signal, fault_addr, final_regs)) => {
            task.set_registers(&saved)?;
            task.detach()?;
            if signal == Signal::SIGSEGV && fault_addr == Some(SENTINEL_RETURN_ADDR as usize) {
                Ok(NativeArch::retval(&final_regs))
            } else {
                Err(Error::CallFault {
                    pid,
                    signal,
                    fault_addr,
                })
            }
        }
        Err(err) => {
            // Leave the thread the way we found it when it still exists;
            // the drop of `task` detaches.
            if !matches!(err, Error::TargetDied { .. }) {
                if let Err(restore_err) = task.set_registers(&saved) {
                    log!(LogWarn, "register restore failed: {}", restore_err);
                }
            }
            Err(err)
        }
    }
}

/// Stage the call, run the target, and collect the terminal stop. Does not
/// restore the register snapshot; `do_call` owns that.
fn drive_call(
    task: &PtracedTask,
    saved: &RegisterSet,
    func: RemotePtr<Void>,
    args: &CallArgs,
    mut trap_cb: Option<&mut dyn FnMut() -> TrapAction>,
) -> Result<(Signal, Option<usize>, RegisterSet)> {
    let mut regs = *saved;
    NativeArch::setup_call(&mut regs, args, func.as_u64(), SENTINEL_RETURN_ADDR);
    if let Some(slot) = NativeArch::reserve_return_slot(&mut regs) {
        remote_mem::write_val(task.pid(), slot.cast::<u64>(), &SENTINEL_RETURN_ADDR)?;
    }
    task.set_registers(&regs)?;
    task.cont()?;

    let signal = loop {
        match task.wait()? {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(Error::TargetDied { pid: task.pid() })
            }
            WaitStatus::Stopped(_, signal) => {
                if signal != Signal::SIGTRAP {
                    break signal;
                }
                let cb = match trap_cb.as_mut() {
                    Some(cb) => cb,
                    None => break signal,
                };
                if cb() == TrapAction::Stop {
                    break signal;
                }
                let mut trapped = task.registers()?;
                NativeArch::advance_past_trap(&mut trapped);
                task.set_registers(&trapped)?;
                task.cont()?;
            }
            _ => continue,
        }
    };

    let siginfo = task.siginfo()?;
    // The union arm is only meaningful for fault signals.
    let fault_addr = if signal == Signal::SIGSEGV {
        Some(unsafe { siginfo.si_addr() } as usize)
    } else {
        None
    };
    let final_regs = task.registers()?;
    log!(
        LogDebug,
        "call of {} in {} stopped with {:?}, retval {:#x}",
        func,
        task.pid(),
        signal,
        NativeArch::retval(&final_regs)
    );
    Ok((signal, fault_addr, final_regs))
}
