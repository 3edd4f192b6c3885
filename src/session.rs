//! Initiator sessions
//!
//! A session owns the list of commands an initiator has outstanding and the
//! unit attention conditions waiting to be reported to it. Status delivery
//! and command release go back to the fabric through the [`Fabric`] trait.

use crate::command::Command;
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Fabric callbacks used by the core
///
/// `queue_status` is invoked at most once per command, outside of any core
/// lock. `release_cmd` is invoked once the last session reference to a
/// command is dropped.
pub trait Fabric: Send + Sync {
    /// Send the command's status (and sense data, if any) to the initiator
    fn queue_status(&self, cmd: &Command);

    /// The core is done with this command
    fn release_cmd(&self, cmd: &Command);
}

/// Pending unit attention condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitAttention {
    pub lun: u64,
    pub asc: u8,
    pub ascq: u8,
}

/// An I_T nexus
pub struct Session {
    initiator_name: String,
    /// The initiator's ACL only permits read access
    read_only: bool,
    cmds: Mutex<Vec<Arc<Command>>>,
    unit_attentions: Mutex<VecDeque<UnitAttention>>,
    fabric: Arc<dyn Fabric>,
}

impl Session {
    pub fn new(initiator_name: &str, fabric: Arc<dyn Fabric>) -> Self {
        Session {
            initiator_name: initiator_name.to_string(),
            read_only: false,
            cmds: Mutex::new(Vec::new()),
            unit_attentions: Mutex::new(VecDeque::new()),
            fabric,
        }
    }

    pub fn with_read_only_acl(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn initiator_name(&self) -> &str {
        &self.initiator_name
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn fabric(&self) -> &dyn Fabric {
        self.fabric.as_ref()
    }

    /// Track a new command on this session
    pub fn add_cmd(&self, cmd: Arc<Command>) {
        self.cmds.lock().push(cmd);
    }

    pub fn active_commands(&self) -> usize {
        self.cmds.lock().len()
    }

    pub(crate) fn cmd_list(&self) -> &Mutex<Vec<Arc<Command>>> {
        &self.cmds
    }

    /// Drop one session reference to `cmd`
    ///
    /// The command leaves the active list on the first put. The fabric's
    /// `release_cmd` runs when the last reference goes.
    pub fn put_cmd(&self, cmd: &Command) {
        self.cmds.lock().retain(|c| !std::ptr::eq(Arc::as_ptr(c), cmd));
        if cmd.put_ref() {
            debug!("releasing command tag {}", cmd.tag());
            self.fabric.release_cmd(cmd);
        }
    }

    /// Queue a unit attention for `lun`
    pub fn allocate_ua(&self, lun: u64, asc: u8, ascq: u8) {
        self.unit_attentions
            .lock()
            .push_back(UnitAttention { lun, asc, ascq });
    }

    pub fn pending_uas(&self) -> usize {
        self.unit_attentions.lock().len()
    }

    /// Remove and return the oldest unit attention for `lun`
    pub fn take_ua(&self, lun: u64) -> Option<(u8, u8)> {
        let mut uas = self.unit_attentions.lock();
        let idx = uas.iter().position(|ua| ua.lun == lun)?;
        uas.remove(idx).map(|ua| (ua.asc, ua.ascq))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("initiator_name", &self.initiator_name)
            .field("read_only", &self.read_only)
            .finish()
    }
}
