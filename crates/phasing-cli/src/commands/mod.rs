//! CLI command implementations

mod init;
mod run;

pub use init::run_init;
pub use run::{agent_host, run_session, session_plan, tunnel_options, FORCED_EXIT_CODE};
