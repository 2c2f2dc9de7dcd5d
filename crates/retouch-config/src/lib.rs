//! KDL configuration parsing for Retouch.
//!
//! A `retouch.kdl` file configures the agent: worker pool sizing,
//! polling cadence, the transformation tool command, backup location,
//! and supervision knobs.

pub mod agent;
pub mod error;

pub use agent::{AgentConfig, NotifyConfig, PoolConfig, TransformConfig, parse_agent_config};
pub use error::{ConfigError, ConfigResult};
