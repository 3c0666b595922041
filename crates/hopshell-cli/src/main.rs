//! hopshell command line
//!
//! Opens multi-hop tunnels and runs remote commands through a pooled,
//! shared set of OpenSSH connections.

use anyhow::{Context, Result};
use clap::Parser;
use hopshell::ssh::{OpenSshConfig, OpenSshConnector, Shell};
use hopshell::{HostConfig, HostDirectory, LoginResolver, Shore, TunnelResolver, Tunnels};
use std::io::Write;
use std::sync::Arc;
use tracing::info;

mod app;

use app::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => HostConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };

    let connector = Arc::new(OpenSshConnector::new(OpenSshConfig {
        program: args.ssh.clone(),
        ..OpenSshConfig::default()
    }));
    let shore = Shore::pooled(connector, config.pool_config());
    let directory = Arc::new(HostDirectory::new(config)?);

    let result = match args.command {
        Command::Tunnel { host, port, via } => tunnel(directory, shore.clone(), &host, port, via.as_deref())
            .await
            .map(|()| 0),
        Command::Exec { login, command } => exec(directory.as_ref(), &shore, &login, &command.join(" ")).await,
    };

    // control sockets go away only when their masters are closed
    shore.close().await;
    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn tunnel(directory: Arc<HostDirectory>, shore: Shore, host: &str, port: u16, via: Option<&str>) -> Result<()> {
    let tunnels = Tunnels::from_directory(directory, shore);

    let result = async {
        let tunnel = tunnels.tunnel(host, port, via).await?;
        println!("{}:{}", tunnel.host(), tunnel.port());
        info!("Forwarding {}:{} to {}:{}; press Ctrl-C to stop", tunnel.host(), tunnel.port(), host, port);
        tokio::signal::ctrl_c().await?;
        anyhow::Ok(())
    }
    .await;

    tunnels.close().await;
    result
}

async fn exec(directory: &HostDirectory, shore: &Shore, login: &str, command: &str) -> Result<i32> {
    let login = directory.resolve(login)?;
    let shell = shore.get_shell(&login).await?;

    let result = async {
        let mut running = shell.exec(command).await?;
        let output = running.wait().await;
        running.close().await?;
        let output = output?;

        std::io::stdout().write_all(&output.stdout)?;
        std::io::stderr().write_all(&output.stderr)?;
        anyhow::Ok(output.exit_code)
    }
    .await;

    shell.close().await?;
    result.with_context(|| format!("running `{}` on {}", command, login))
}
