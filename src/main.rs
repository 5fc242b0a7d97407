use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rtftpd::tftp::client::{Client, ClientConfig};
use rtftpd::tftp::core::TransferMode;
use rtftpd::tftp::server::{self, Config};

#[derive(Parser, Debug)]
#[command(name = "rtftpd", version, about = "Embeddable TFTP daemon and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a directory over TFTP
    Serve {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// IP address to listen on
        #[arg(short, long)]
        ip: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Ack timeout, e.g. "5s" or "500ms"
        #[arg(short, long, value_parser = humantime_duration)]
        timeout: Option<Duration>,

        /// Maximum number of concurrent transfers
        #[arg(long)]
        max_sections: Option<usize>,

        /// Exit after this long without a request, e.g. "5m"
        #[arg(long, value_parser = humantime_duration)]
        idle_timeout: Option<Duration>,

        /// Reject write requests
        #[arg(long)]
        read_only: bool,

        /// Refuse uploads that would replace an existing file
        #[arg(long)]
        no_overwrite: bool,

        /// Directory to serve
        #[arg(default_value = ".")]
        directory: PathBuf,
    },
    /// Download a file
    Get {
        /// Server address
        server: IpAddr,
        /// File name on the server
        remote: String,
        /// Local path (defaults to the remote name)
        local: Option<PathBuf>,
        #[command(flatten)]
        options: ClientOptions,
    },
    /// Upload a file
    Put {
        /// Server address
        server: IpAddr,
        /// Local file to send
        local: PathBuf,
        /// File name on the server (defaults to the local file name)
        remote: Option<String>,
        #[command(flatten)]
        options: ClientOptions,
    },
}

#[derive(clap::Args, Debug)]
struct ClientOptions {
    /// Server port
    #[arg(short, long, default_value_t = 69)]
    port: u16,

    /// Reply timeout, e.g. "5s"
    #[arg(short, long, value_parser = humantime_duration, default_value = "5s")]
    timeout: Duration,

    /// Use netascii mode instead of octet
    #[arg(long)]
    netascii: bool,
}

impl ClientOptions {
    fn client(&self, server: IpAddr) -> Result<Client> {
        let mode = if self.netascii {
            TransferMode::Netascii
        } else {
            TransferMode::Octet
        };
        let config = ClientConfig::new(server, self.port)
            .with_timeout(self.timeout)
            .with_mode(mode);
        Client::new(config)
    }
}

fn humantime_duration(value: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve {
            config,
            ip,
            port,
            timeout,
            max_sections,
            idle_timeout,
            read_only,
            no_overwrite,
            directory,
        } => {
            let mut settings = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::default(),
            };
            if let Some(ip) = ip {
                settings.ip_address = ip;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(timeout) = timeout {
                settings.timeout = timeout;
            }
            if let Some(max_sections) = max_sections {
                settings.max_sections = max_sections;
            }
            if idle_timeout.is_some() {
                settings.idle_timeout = idle_timeout;
            }
            server::run(settings, directory, read_only, !no_overwrite).await
        }
        Command::Get {
            server,
            remote,
            local,
            options,
        } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            let client = options.client(server)?;
            tokio::task::spawn_blocking(move || client.get(&remote, &local))
                .await
                .context("Download task failed")??;
            Ok(())
        }
        Command::Put {
            server,
            local,
            remote,
            options,
        } => {
            let remote = match remote {
                Some(remote) => remote,
                None => local
                    .file_name()
                    .context("Local path has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let client = options.client(server)?;
            tokio::task::spawn_blocking(move || client.put(&local, &remote))
                .await
                .context("Upload task failed")??;
            Ok(())
        }
    }
}
