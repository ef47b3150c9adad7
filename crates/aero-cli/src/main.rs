use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use aero_core::{
    ControlLoop, ControlPolicy, Executor, ExecutorPolicy, FollowFirstTarget, HumanInput, ManualTargets,
    PursuitPolicy, StateStore,
};
use aero_fc::{open_link, LinkConfig, LinkKind, MavLink, VehicleLink};

#[derive(Debug, Parser)]
#[command(name = "aero", version, about = "aero - hybrid human/autonomous flight control")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Connect and run the control loop, reading operator commands from stdin.
    Run,
    Link { #[command(subcommand)] cmd: LinkCmd },
}

#[derive(Debug, Subcommand)]
enum LinkCmd {
    /// Connect, read one telemetry snapshot and print it.
    Status,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    #[serde(default)]
    executor: ExecutorPolicy,
    #[serde(default)]
    pursuit: PursuitPolicy,
    #[serde(default)]
    control: ControlPolicy,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Link { cmd } => link_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

const URL_SCHEMES: &[&str] = &["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    match cfg.link.kind {
        LinkKind::Mavlink => {
            let url = cfg.link.url.as_deref().unwrap_or_default();
            ensure!(!url.is_empty(), "link.url missing (kind=mavlink)");
            ensure!(URL_SCHEMES.iter().any(|p| url.starts_with(p)), "link.url has unknown scheme: {}", url);
        }
        LinkKind::Sim => info!("doctor: simulated vehicle link"),
    }
    ensure!(cfg.link.send_heartbeat_hz.map(|hz| hz > 0.0).unwrap_or(true), "link.send_heartbeat_hz must be > 0");

    let ex = &cfg.executor;
    // both autopilots drop offboard when setpoints arrive slower than 2 Hz
    ensure!((1..=500).contains(&ex.stream_interval_ms), "executor.stream_interval_ms must be 1..=500");
    ensure!(ex.priming_count > 0, "executor.priming_count must be > 0");
    ensure!(
        ex.default_takeoff_alt_m.is_finite() && ex.default_takeoff_alt_m > 0.0,
        "executor.default_takeoff_alt_m must be > 0"
    );

    let p = &cfg.pursuit;
    ensure!(p.interval_ms > 0, "pursuit.interval_ms must be > 0");
    ensure!(p.standoff_m.is_finite() && p.standoff_m >= 0.0, "pursuit.standoff_m must be >= 0");
    ensure!(p.altitude_m.is_finite() && p.altitude_m > 0.0, "pursuit.altitude_m must be > 0");
    ensure!(p.reposition_threshold_m > 0.0, "pursuit.reposition_threshold_m must be > 0");
    ensure!(p.track_max_age_ms >= p.interval_ms, "pursuit.track_max_age_ms shorter than pursuit.interval_ms");

    let c = &cfg.control;
    ensure!(c.cycle_ms > 0, "control.cycle_ms must be > 0");
    ensure!(c.decision_every > 0, "control.decision_every must be > 0");
    ensure!((0.0..=100.0).contains(&c.critical_battery_pct), "control.critical_battery_pct must be 0..=100");
    ensure!(c.max_consecutive_failures > 0, "control.max_consecutive_failures must be > 0");

    info!("doctor: OK");
    Ok(())
}

async fn link_cmd(cfg: &Config, cmd: LinkCmd) -> Result<()> {
    match cmd {
        LinkCmd::Status => match cfg.link.kind {
            LinkKind::Mavlink => {
                let link = MavLink::open(&cfg.link)?;
                link.connect().await.context("connect to autopilot")?;
                let snapshot = link.read_snapshot().await?;
                let st = link.link_status();
                println!("connected={}", link.is_connected());
                println!("last_heartbeat_age={:?}", st.hb_age());
                println!("messages={}", st.messages);
                println!("{}", snapshot);
                Ok(())
            }
            LinkKind::Sim => {
                let link = open_link(&cfg.link)?;
                link.connect().await?;
                println!("connected={}", link.is_connected());
                println!("{}", link.read_snapshot().await?);
                Ok(())
            }
        },
    }
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let link = open_link(&cfg.link)?;
    link.connect().await.context("connect to vehicle")?;
    info!("run: vehicle link up");

    let store = StateStore::new();
    let executor = Executor::new(link.clone(), store.clone(), cfg.executor.clone(), cfg.pursuit.clone());
    let decision = FollowFirstTarget::new(cfg.pursuit.track_max_age());

    let (tx, rx) = mpsc::channel::<HumanInput>(32);
    tokio::spawn(read_operator_input(tx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("run: interrupted");
            let _ = tx.send(HumanInput::Exit).await;
        }
    });

    ControlLoop::new(
        link,
        store,
        executor,
        Box::new(decision),
        Box::new(ManualTargets::new()),
        rx,
        cfg.control.clone(),
    )
    .run()
    .await;

    info!("run: stopped");
    Ok(())
}

async fn read_operator_input(tx: mpsc::Sender<HumanInput>) {
    info!("--- operator input ---");
    info!("takeoff [ALT] | land | disarm | hold | goto N E ALT [YAW] | follow [ID]");
    info!("release        let the autonomous source take control on a trigger");
    info!("stop_follow    stop autonomous following and take control back");
    info!("simulate_person / clear_detection   inject or clear a synthetic target");
    info!("exit           stop");
    info!("a JSON command object is accepted too");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<HumanInput>() {
                    Ok(input) => {
                        let exit = input == HumanInput::Exit;
                        if tx.send(input).await.is_err() || exit {
                            break;
                        }
                    }
                    Err(e) => warn!("input: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("input: stdin read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_passes_doctor() {
        let cfg: Config = toml::from_str(include_str!("../../../config/aero.toml")).unwrap();
        assert_eq!(cfg.link.kind, LinkKind::Sim);
        assert_eq!(cfg.executor.priming_count, 10);
        doctor(&cfg).unwrap();
    }

    #[test]
    fn policy_sections_are_optional() {
        let cfg: Config = toml::from_str("[link]\nkind = \"mavlink\"\nurl = \"udpin:0.0.0.0:14540\"\n").unwrap();
        assert_eq!(cfg.pursuit.standoff_m, 5.0);
        assert_eq!(cfg.control.decision_every, 50);
        doctor(&cfg).unwrap();

        let cfg: Config = toml::from_str("[link]\nkind = \"mavlink\"\nurl = \"com3\"\n").unwrap();
        assert!(doctor(&cfg).is_err());
    }
}
