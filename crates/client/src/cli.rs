use std::path::PathBuf;

use anyhow::Context;
use meshroom_protocol::{MeshroomConfig, OperatingMode, RoomMode};

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub room: String,
    pub server_url: Option<String>,
    pub services_url: Option<String>,
    pub tls_cert_path: Option<String>,
    pub mode: Option<RoomMode>,
    pub simulate: Option<OperatingMode>,
    /// Ask for a transcript summary before leaving.
    pub summarize_on_exit: bool,
}

impl Args {
    /// Command-line values win over the config file.
    pub fn apply(&self, config: &mut MeshroomConfig) {
        if let Some(url) = &self.server_url {
            config.signaling.url = url.clone();
        }
        if let Some(url) = &self.services_url {
            config.services.base_url = Some(url.clone());
        }
        if let Some(path) = &self.tls_cert_path {
            config.signaling.tls_cert = Some(path.clone());
        }
        if let Some(mode) = self.mode {
            config.session.mode = mode;
        }
        if self.simulate.is_some() {
            config.adaptation.simulate = self.simulate;
        }
    }
}

fn parse_room_mode(value: &str) -> anyhow::Result<RoomMode> {
    match value {
        "pair" => Ok(RoomMode::Pair),
        "mesh" => Ok(RoomMode::Mesh),
        other => anyhow::bail!("Invalid --mode value: {other} (expected pair or mesh)"),
    }
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/meshroom.toml");
    let mut room = None;
    let mut server_url = None;
    let mut services_url = None;
    let mut tls_cert_path = None;
    let mut mode = None;
    let mut simulate = None;
    let mut summarize_on_exit = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("meshroom-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("meshroom-client - Meshroom headless room participant");
                println!();
                println!("USAGE:");
                println!("    meshroom-client --room <ID> [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!(
                    "    -c, --config <PATH>          Config file [default: ./config/meshroom.toml]"
                );
                println!("    --room <ID>                  Room to join (required)");
                println!("    --server-url <URL>           Relay WebSocket URL (ws:// or wss://)");
                println!(
                    "    --services-url <URL>         Base URL of the adapt/summarize/TURN services"
                );
                println!("    --tls-cert <PATH>            TLS certificate to pin for the relay");
                println!("    --mode <pair|mesh>           Room membership semantics");
                println!(
                    "    --simulate <MODE>            Force normal, degrade-video, audio-only or captions-only"
                );
                println!("    --summarize-on-exit          Request a transcript summary before leaving");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--room" => {
                i += 1;
                room = Some(args.get(i).context("Missing --room value")?.clone());
            }
            "--server-url" => {
                i += 1;
                server_url = Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--services-url" => {
                i += 1;
                services_url = Some(args.get(i).context("Missing --services-url value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--mode" => {
                i += 1;
                mode = Some(parse_room_mode(args.get(i).context("Missing --mode value")?)?);
            }
            "--simulate" => {
                i += 1;
                simulate = Some(
                    args.get(i)
                        .context("Missing --simulate value")?
                        .parse::<OperatingMode>()
                        .context("Invalid --simulate value")?,
                );
            }
            "--summarize-on-exit" => summarize_on_exit = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        room: room.context("--room is required")?,
        server_url,
        services_url,
        tls_cert_path,
        mode,
        simulate,
        summarize_on_exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_mode_values() {
        assert_eq!(parse_room_mode("pair").unwrap(), RoomMode::Pair);
        assert_eq!(parse_room_mode("mesh").unwrap(), RoomMode::Mesh);
        assert!(parse_room_mode("star").is_err());
    }

    #[test]
    fn flags_override_config() {
        let args = Args {
            config_path: PathBuf::from("meshroom.toml"),
            room: "r1".to_string(),
            server_url: Some("wss://relay.example.com/ws".to_string()),
            services_url: None,
            tls_cert_path: Some("/etc/meshroom/relay.pem".to_string()),
            mode: Some(RoomMode::Pair),
            simulate: Some(OperatingMode::AudioOnly),
            summarize_on_exit: false,
        };
        let mut config = MeshroomConfig::default();
        config.services.base_url = Some("http://127.0.0.1:5000".to_string());
        args.apply(&mut config);

        assert_eq!(config.signaling.url, "wss://relay.example.com/ws");
        assert_eq!(config.signaling.tls_cert.as_deref(), Some("/etc/meshroom/relay.pem"));
        assert_eq!(config.session.mode, RoomMode::Pair);
        assert_eq!(config.adaptation.simulate, Some(OperatingMode::AudioOnly));
        // Unset flags leave the file's values alone.
        assert_eq!(config.services.base_url.as_deref(), Some("http://127.0.0.1:5000"));
    }
}
