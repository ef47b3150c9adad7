use tracing::{debug, info};

use aero_proto::Command;

/// Resolves one command per control cycle between the operator and the
/// autonomous source. The operator always wins while holding authority.
#[derive(Debug)]
pub struct Arbitrator {
    human_control_active: bool,
    pending: Option<Command>,
}

impl Default for Arbitrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Arbitrator {
    /// Starts with the operator in control and nothing pending.
    pub fn new() -> Self {
        Self { human_control_active: true, pending: None }
    }

    pub fn human_control_active(&self) -> bool {
        self.human_control_active
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_human_command(&mut self, cmd: Command) {
        info!("arbitrator: human command {} ({})", cmd.kind(), cmd.reason());
        self.pending = Some(cmd);
        self.human_control_active = true;
    }

    /// Hands authority to the autonomous source.
    pub fn release(&mut self) {
        self.pending = None;
        self.human_control_active = false;
        info!("arbitrator: human control released");
    }

    /// Explicit override for emergency and landing flows. Taking control back
    /// discards whatever the operator queued earlier.
    pub fn set_human_control_active(&mut self, active: bool) {
        if self.human_control_active != active {
            info!("arbitrator: human control -> {}", active);
            self.human_control_active = active;
        }
        if active {
            self.pending = None;
        }
    }

    pub fn arbitrate(&mut self, proposed: Command) -> Command {
        if !self.human_control_active {
            debug!("arbitrate: autonomous {}", proposed.kind());
            return proposed;
        }
        match self.pending.take() {
            Some(cmd) => {
                debug!("arbitrate: human {}", cmd.kind());
                cmd
            }
            None => {
                debug!("arbitrate: human holds control, idle");
                Command::do_nothing("Human control active, awaiting command or release.")
            }
        }
    }
}
