//! Task management: ABORT TASK and LUN RESET
//!
//! Both operations leave every affected command in a terminal state. ABORT
//! TASK waits for in-flight backend work on the command to settle before
//! reporting TASK ABORTED. LUN RESET drains the device queue under the
//! queue lock and resolves each drained command after dropping it.

use crate::command::Command;
use crate::device::Device;
use crate::session::Session;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Task management function codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmrFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LunReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
}

impl TmrFunction {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(TmrFunction::AbortTask),
            2 => Some(TmrFunction::AbortTaskSet),
            3 => Some(TmrFunction::ClearAca),
            4 => Some(TmrFunction::ClearTaskSet),
            5 => Some(TmrFunction::LunReset),
            6 => Some(TmrFunction::TargetWarmReset),
            7 => Some(TmrFunction::TargetColdReset),
            _ => None,
        }
    }
}

/// Task management response codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmrResponse {
    FunctionComplete = 0,
    TaskDoesNotExist = 1,
    FunctionRejected = 255,
}

/// A task management request
///
/// `task_cmd` is the TMR's own command; it identifies the requesting
/// session and the device the request is addressed to.
pub struct TmrRequest {
    function: TmrFunction,
    ref_task_tag: u64,
    task_cmd: Arc<Command>,
    response: Mutex<Option<TmrResponse>>,
}

impl TmrRequest {
    pub fn new(function: TmrFunction, ref_task_tag: u64, task_cmd: Arc<Command>) -> Self {
        TmrRequest {
            function,
            ref_task_tag,
            task_cmd,
            response: Mutex::new(None),
        }
    }

    pub fn function(&self) -> TmrFunction {
        self.function
    }

    /// Tag of the task an ABORT TASK refers to
    pub fn ref_task_tag(&self) -> u64 {
        self.ref_task_tag
    }

    pub fn task_cmd(&self) -> &Arc<Command> {
        &self.task_cmd
    }

    pub fn device(&self) -> &Arc<Device> {
        self.task_cmd.device()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.task_cmd.session()
    }

    pub fn initiator_name(&self) -> Option<&str> {
        self.task_cmd.initiator_name()
    }

    pub fn response(&self) -> Option<TmrResponse> {
        *self.response.lock()
    }

    pub(crate) fn set_response(&self, response: TmrResponse) {
        *self.response.lock() = Some(response);
    }
}

impl std::fmt::Debug for TmrRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmrRequest")
            .field("function", &self.function)
            .field("ref_task_tag", &self.ref_task_tag)
            .field("response", &self.response())
            .finish()
    }
}

#[derive(Default)]
struct ResetSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Completion handle for a hardware LUN reset
///
/// Signalled by [`ResetCompletion::complete`] or by dropping it.
#[must_use]
pub struct ResetCompletion {
    signal: Arc<ResetSignal>,
}

impl ResetCompletion {
    pub fn complete(self) {
        debug!("hardware LUN reset signalled");
    }
}

impl Drop for ResetCompletion {
    fn drop(&mut self) {
        *self.signal.done.lock() = true;
        self.signal.cond.notify_all();
    }
}

struct ResetWaiter {
    signal: Arc<ResetSignal>,
}

impl ResetWaiter {
    /// Wait for the reset to be signalled; false on timeout
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.signal.done.lock();
        while !*done {
            if self.signal.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

fn reset_completion() -> (ResetCompletion, ResetWaiter) {
    let signal = Arc::new(ResetSignal::default());
    (
        ResetCompletion {
            signal: Arc::clone(&signal),
        },
        ResetWaiter { signal },
    )
}

/// ABORT TASK
///
/// Looks up `tmr.ref_task_tag()` among the session's active commands for
/// `dev`. A command that already completed counts as not found.
pub fn abort_task(dev: &Arc<Device>, tmr: &TmrRequest, session: &Session) -> TmrResponse {
    let tag = tmr.ref_task_tag();

    let found = {
        let mut cmds = session.cmd_list().lock();
        let idx = cmds.iter().position(|cmd| {
            Arc::ptr_eq(cmd.device(), dev) && cmd.tag() == tag && cmd.tmr_function().is_none()
        });
        match idx {
            Some(i) if cmds[i].try_mark_aborted() => {
                let cmd = cmds.remove(i);
                cmd.get_ref();
                Some(cmd)
            }
            Some(_) => {
                info!("ABORT_TASK: ref_tag: {} already complete, skipping", tag);
                None
            }
            None => None,
        }
    };

    let Some(cmd) = found else {
        info!(
            "ABORT_TASK: Sending TMR_TASK_DOES_NOT_EXIST for ref_tag: {}",
            tag
        );
        return TmrResponse::TaskDoesNotExist;
    };

    info!("ABORT_TASK: Found referenced {} task_tag: {}", dev.name(), tag);

    // Still queued: it must never be picked up by the queue runner
    dev.queue.lock().retain(|queued| !Arc::ptr_eq(queued, &cmd));

    cmd.wait_for_tasks();
    cmd.send_task_abort();
    if cmd.take_ack_ref() {
        session.put_cmd(&cmd);
    }
    // Keep-alive only; the frontend still owns its own reference
    session.put_cmd(&cmd);

    info!(
        "ABORT_TASK: Sending TMR_FUNCTION_COMPLETE for ref_tag: {}",
        tag
    );
    TmrResponse::FunctionComplete
}

/// LUN RESET
///
/// `tmr` is absent when the reset comes from a PERSISTENT RESERVE OUT
/// preempt rather than from an initiator's task management request. With
/// `preempt_keys` only queued commands whose reservation key is listed are
/// aborted, and `prout_cmd` (the command doing the preempt) is left alone.
pub fn lun_reset(
    dev: &Arc<Device>,
    tmr: Option<&TmrRequest>,
    preempt_keys: Option<&[u64]>,
    prout_cmd: Option<&Arc<Command>>,
) {
    let tmr_initiator = tmr.and_then(|t| t.initiator_name());
    let attrs = dev.attrs();

    // Kick off the hardware reset first and collect it at the end
    let hw_reset = match (tmr, dev.backend().lun_reset()) {
        (Some(tmr), Some(hw)) if attrs.offload_reservations => {
            let (done, waiter) = reset_completion();
            match hw.lun_reset(tmr, done) {
                Ok(()) => Some(waiter),
                Err(e) => {
                    error!("LUN_RESET: hardware reset on {} failed: {}", dev.name(), e);
                    None
                }
            }
        }
        _ => None,
    };

    let drained: Vec<Arc<Command>> = {
        let mut queue = dev.queue.lock();
        let mut drained = Vec::new();
        queue.retain(|cmd| {
            if let Some(keys) = preempt_keys {
                if !keys.contains(&cmd.pr_res_key()) {
                    return true;
                }
            }
            if prout_cmd.map_or(false, |prout| Arc::ptr_eq(prout, cmd)) {
                return true;
            }
            cmd.mark_aborted_from_queue();
            drained.push(Arc::clone(cmd));
            false
        });
        drained
    };

    for cmd in &drained {
        debug!(
            "LUN_RESET: {} draining cmd tag {} fe_refs {}",
            if preempt_keys.is_some() { "Preempt" } else { "" },
            cmd.tag(),
            cmd.frontend_refs()
        );

        if cmd.tmr_function().is_some() {
            cmd.finish_abort(true);
            continue;
        }
        if cmd.frontend_refs() == 0 {
            cmd.finish_abort(true);
            continue;
        }
        let same_initiator = tmr_initiator.is_some() && cmd.initiator_name() == tmr_initiator;
        if same_initiator || attrs.emulate_tas {
            cmd.send_task_abort();
        }
        cmd.finish_abort(false);
    }

    if preempt_keys.is_none() {
        if let Some(holder) = dev.clear_reservation() {
            info!("LUN_RESET: SCSI-2 Released reservation held by {}", holder);
        }
    }

    if let Some(waiter) = hw_reset {
        if !waiter.wait(attrs.lun_reset_timeout) {
            warn!(
                "LUN_RESET: hardware reset on {} did not finish within {:?}",
                dev.name(),
                attrs.lun_reset_timeout
            );
        }
    }

    dev.bump_resets();

    info!(
        "LUN_RESET: {} for [{}] Complete, {} commands drained",
        if preempt_keys.is_some() { "Preempt" } else { "TMR" },
        dev.name(),
        drained.len()
    );
}
