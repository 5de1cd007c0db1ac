// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-export the subsystem modules at the crate root so callers (and the
// integration tests) don't have to spell the full hierarchy.
pub use agentmesh::{
    automation, bus, config, crossrepo, dashboard, mailbox, manager, persist, provider, providers,
    registry, router, sidechannel, skills, tools, watcher, workspace,
};

// Re-exporting key items for easier external access.
pub use agentmesh::bus::{EventBus, ManagerEvent};
pub use agentmesh::config::ManagerConfig;
pub use agentmesh::manager::Manager;
pub use agentmesh::provider::{Provider, ProviderReply};
pub use agentmesh::registry::{AgentConfig, AgentRegistry, AgentState};
pub use agentmesh::router::{Router, TaskRequest, TaskResult};
pub use agentmesh::skills::{SkillDefinition, SkillStore, Strategy};
