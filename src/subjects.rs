//! Canonical NATS subject catalog for the execution pipeline.
//! Source of truth for subject strings this service publishes/subscribes to.

// -----------------------------------------------------------------------------
// COMMANDS
// -----------------------------------------------------------------------------

pub const CMD_SYS_HALT: &str = "execution.cmd.sys.halt.v1";
pub const CMD_INTENT_SUBMIT: &str = "execution.cmd.intent.submit.v1";
pub const CMD_PLAN_PAUSE: &str = "execution.cmd.plan.pause.v1";
pub const CMD_PLAN_RESUME: &str = "execution.cmd.plan.resume.v1";
pub const CMD_PLAN_CANCEL: &str = "execution.cmd.plan.cancel.v1";

// -----------------------------------------------------------------------------
// EVENTS
// -----------------------------------------------------------------------------

pub const EVT_ORDER: &str = "execution.evt.order.v1";
pub const EVT_AUDIT: &str = "execution.evt.audit.v1";
/// Inbound: account-state collaborator pushes equity/margin snapshots here.
pub const EVT_ACCOUNT_MARGIN: &str = "execution.evt.account.margin.v1";

// -----------------------------------------------------------------------------
// SUBSCRIPTION PATTERNS (WILDCARDS)
// -----------------------------------------------------------------------------

pub const CMD_WILDCARD: &str = "execution.cmd.>";
pub const EVT_WILDCARD: &str = "execution.evt.>";
