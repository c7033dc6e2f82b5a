//! Agent command implementation.

use super::config::FileConfig;
use clap::Args;
use patchsync_agent::{Agent, AgentConfig};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

/// Arguments of `patchsync agent`.
#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// Synchronizer address, host:port
    #[arg(short, long)]
    pub server: Option<String>,

    /// Directory kept in sync
    #[arg(short, long)]
    pub target: Option<PathBuf>,

    /// Stable agent id; generated and stored on first run when omitted
    #[arg(long)]
    pub agent_id: Option<Uuid>,

    /// Hex token issued by `patchsync token`
    #[arg(long)]
    pub token: Option<String>,

    /// Where agent state is kept (default: <target>/.patchsync)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

/// Applies command line overrides to the file configuration.
pub fn merge(mut config: AgentConfig, args: AgentArgs) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(target) = args.target {
        config.target_root = target;
    }
    if let Some(agent_id) = args.agent_id {
        config = config.with_agent_id(agent_id);
    }
    if let Some(dir) = args.state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(token) = args.token {
        let token = hex::decode(token.trim()).map_err(|err| format!("invalid --token: {err}"))?;
        config = config.with_auth_token(token);
    }
    Ok(config)
}

/// Runs the agent until ctrl-c or a fatal error.
pub async fn run(file: FileConfig, args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = merge(file.agent, args)?;
    let agent = Agent::open(config)?;
    info!(
        agent_id = %agent.agent_id(),
        server = %agent.config().server_addr,
        target = %agent.config().target_root.display(),
        "agent starting"
    );

    let (shutdown, rx) = broadcast::channel(1);
    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown.send(());
            }
            Err(err) => {
                error!(error = %err, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    });

    let result = agent.run(rx).await;
    signal.abort();

    let status = agent.status();
    info!(
        revision = status.current_revision.as_ref().map(|r| r.short()).unwrap_or("-"),
        applied = status.applied,
        failed = status.failed,
        "agent stopped"
    );
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let file = AgentConfig::new("old:1", "/srv/old");
        let agent_id = Uuid::new_v4();
        let args = AgentArgs {
            server: Some("sync:7420".into()),
            target: Some("/srv/www".into()),
            agent_id: Some(agent_id),
            token: Some("00ff".into()),
            state_dir: None,
        };
        let config = merge(file, args).unwrap();
        assert_eq!(config.server_addr, "sync:7420");
        assert_eq!(config.target_root, PathBuf::from("/srv/www"));
        assert_eq!(config.agent_id, Some(agent_id));
        assert_eq!(config.auth_token, Some(vec![0x00, 0xff]));
    }

    #[test]
    fn file_values_survive_without_flags() {
        let file = AgentConfig::new("sync:7420", "/srv/www").with_state_dir("/var/lib/patchsync");
        let config = merge(file, AgentArgs::default()).unwrap();
        assert_eq!(config.server_addr, "sync:7420");
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/patchsync"));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn bad_token_is_rejected() {
        let args = AgentArgs {
            token: Some("not hex".into()),
            ..AgentArgs::default()
        };
        assert!(merge(AgentConfig::default(), args).is_err());
    }
}
