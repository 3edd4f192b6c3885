//! Target core
//!
//! This module provides the [`TargetCore`] entry point and its builder. The
//! core classifies each command, answers emulated commands itself, hands
//! I/O to the backend executors, and routes task management requests.

use crate::cdb::CommandClass;
use crate::command::Command;
use crate::device::Device;
use crate::emulate;
use crate::error::{TargetError, TargetResult};
use crate::exec::{self, MAX_SEGMENTS_PER_BATCH};
use crate::sense::SenseReason;
use crate::tmr::{self, TmrFunction, TmrRequest, TmrResponse};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// SCSI target core serving a set of devices
pub struct TargetCore {
    devices: Vec<Arc<Device>>,
    batch_limit: usize,
}

impl TargetCore {
    /// Create a new builder for configuring the core
    pub fn builder() -> TargetCoreBuilder {
        TargetCoreBuilder::new()
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|dev| dev.name() == name)
    }

    /// Segments collected before a submission batch is forced
    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Execute a command now
    ///
    /// Emulated commands complete before this returns; I/O commands complete
    /// when the backend finishes.
    pub fn execute(&self, cmd: &Arc<Command>) {
        if !cmd.mark_sent() {
            debug!("command tag {} aborted before execution", cmd.tag());
            return;
        }

        let class = CommandClass::classify(cmd.cdb());
        debug!("executing {:?} as {:?}", cmd, class);
        match class {
            CommandClass::Emulated => cmd.complete(emulate::emulate(cmd)),
            CommandClass::TestUnitReady => cmd.complete(Ok(())),
            CommandClass::Unsupported => {
                warn!("unsupported SCSI opcode {:#04x}", cmd.opcode());
                cmd.complete(Err(SenseReason::UnsupportedScsiOpcode));
            }
            _ => exec::execute_io(cmd, class, self.batch_limit),
        }
    }

    /// Queue a command on its device for [`TargetCore::run_queue`]
    pub fn enqueue(&self, cmd: Arc<Command>) {
        cmd.set_queued(true);
        let dev = Arc::clone(cmd.device());
        dev.queue.lock().push_back(cmd);
    }

    /// Execute the commands queued on `dev`, in order
    ///
    /// Commands aborted while queued are skipped. Returns how many commands
    /// were executed.
    pub fn run_queue(&self, dev: &Device) -> usize {
        let mut executed = 0;
        loop {
            // Pop under the lock, execute without it
            let next = dev.queue.lock().pop_front();
            let Some(cmd) = next else {
                break;
            };
            if cmd.is_aborted() {
                continue;
            }
            self.execute(&cmd);
            executed += 1;
        }
        executed
    }

    /// Handle a task management request and record its response
    pub fn task_management(&self, tmr: &TmrRequest) -> TmrResponse {
        let dev = tmr.device();
        let response = match tmr.function() {
            TmrFunction::AbortTask => match tmr.session() {
                Some(session) => tmr::abort_task(dev, tmr, session),
                None => {
                    error!("ABORT_TASK without a session");
                    TmrResponse::FunctionRejected
                }
            },
            TmrFunction::LunReset => {
                tmr::lun_reset(dev, Some(tmr), None, None);
                TmrResponse::FunctionComplete
            }
            other => {
                info!("task management function {:?} not supported", other);
                TmrResponse::FunctionRejected
            }
        };
        tmr.set_response(response);
        response
    }
}

impl std::fmt::Debug for TargetCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetCore")
            .field("devices", &self.devices)
            .field("batch_limit", &self.batch_limit)
            .finish()
    }
}

/// Builder for configuring a [`TargetCore`]
pub struct TargetCoreBuilder {
    devices: Vec<Arc<Device>>,
    batch_limit: Option<usize>,
}

impl TargetCoreBuilder {
    fn new() -> Self {
        Self {
            devices: Vec::new(),
            batch_limit: None,
        }
    }

    /// Attach a device
    pub fn device(mut self, dev: Arc<Device>) -> Self {
        self.devices.push(dev);
        self
    }

    /// Segments per submission batch (default: 32)
    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    pub fn build(self) -> TargetResult<TargetCore> {
        let batch_limit = self.batch_limit.unwrap_or(MAX_SEGMENTS_PER_BATCH);
        if batch_limit == 0 {
            return Err(TargetError::Config(
                "batch_limit must be at least 1".to_string(),
            ));
        }

        for (i, dev) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|d| d.name() == dev.name()) {
                return Err(TargetError::Config(format!(
                    "duplicate device name: {}",
                    dev.name()
                )));
            }
        }

        Ok(TargetCore {
            devices: self.devices,
            batch_limit,
        })
    }
}
