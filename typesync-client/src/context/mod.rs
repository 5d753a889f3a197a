//! Auth context: the orchestrator consumed by the UI layer

pub mod orchestrator;
pub mod state;

pub use orchestrator::{AuthContext, AuthContextDeps};
pub use state::{AuthState, Notice, NoticeLevel, PendingUpgrade, PostAuthAction, UpgradeOutcome};
