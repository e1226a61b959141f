use async_trait::async_trait;
use robocar_link::domain::joystick::JoystickShaper;
use robocar_link::domain::models::{DeviceHandle, LinkState};
use robocar_link::domain::settings::SettingsService;
use robocar_link::domain::telemetry::Telemetry;
use robocar_link::infrastructure::bluetooth::{build_adapter, DeviceChooser, LinkManager};
use robocar_link::infrastructure::logging;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const HELP: &str = "commands: connect | disconnect | manual | auto | joy <x> <y> | release | status | quit";

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Connect,
    Disconnect,
    Manual,
    Auto,
    Joystick(f64, f64),
    Release,
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let command = match verb.to_lowercase().as_str() {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "manual" => Self::Manual,
            "auto" | "start" => Self::Auto,
            "joy" => {
                let mut axis = || -> Result<f64, String> {
                    words
                        .next()
                        .ok_or_else(|| "usage: joy <x> <y>".to_string())?
                        .parse::<f64>()
                        .map_err(|e| format!("bad axis: {}", e))
                };
                let x = axis()?;
                let y = axis()?;
                Self::Joystick(x, y)
            }
            "release" => Self::Release,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(command)
    }
}

/// Device picker driven from the same console the commands come from: while a
/// choice is pending, the next input line answers it.
#[derive(Default)]
struct ConsoleChooser {
    pending: Mutex<Option<oneshot::Sender<String>>>,
}

impl ConsoleChooser {
    /// Hand `line` to a pending choice. Returns `false` when nothing is pending.
    fn answer(&self, line: &str) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(reply) => reply.send(line.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DeviceChooser for ConsoleChooser {
    async fn choose(&self, candidates: Vec<DeviceHandle>) -> Option<DeviceHandle> {
        if candidates.is_empty() {
            println!("No devices nearby.");
            return None;
        }

        println!("Choose a device (number, anything else cancels):");
        for (i, device) in candidates.iter().enumerate() {
            let rssi = device
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "?".to_string());
            println!("  [{}] {} ({}, {})", i, device.display_name(), device.id, rssi);
        }

        let (reply, answer) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(reply);
        let answer = answer.await.ok()?;
        let index = answer.trim().parse::<usize>().ok()?;
        candidates.into_iter().nth(index)
    }
}

/// Prints every broadcast, plus a readout when new telemetry arrives.
fn console_observer() -> impl Fn(&LinkState) + Send + Sync + 'static {
    let last_telemetry = Mutex::new(None::<String>);
    move |state: &LinkState| {
        println!("[link] {}", state);

        let mut last = last_telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.last_telemetry != *last {
            if let Some(raw) = &state.last_telemetry {
                let telemetry = Telemetry::classify(raw);
                match &telemetry {
                    Telemetry::Token(_) => println!("[robot] mode: {}", telemetry.mode()),
                    Telemetry::Report(report) => println!(
                        "[robot] mode: {} risk: {} heading: {} distance: {}",
                        telemetry.mode(),
                        report
                            .risk()
                            .map(|r| format!("{:.2}", r))
                            .unwrap_or_else(|| "-".to_string()),
                        report.direction().unwrap_or("-"),
                        report
                            .distance_m
                            .map(|d| format!("{:.1} m", d))
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                }
            }
            *last = state.last_telemetry.clone();
        }
    }
}

async fn run(link: LinkManager, chooser: Arc<ConsoleChooser>, mut joystick: JoystickShaper) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        if chooser.answer(&line) {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{} ({})", e, HELP);
                continue;
            }
        };

        match command {
            ConsoleCommand::Connect => {
                let link = link.clone();
                tokio::spawn(async move {
                    // outcome is reported through the link state
                    let _ = link.connect().await;
                });
            }
            ConsoleCommand::Disconnect => link.disconnect().await,
            ConsoleCommand::Manual => {
                let _ = link.send_manual_command().await;
            }
            ConsoleCommand::Auto => {
                if link.send_auto_command().await.is_err() && !link.is_subscribed() {
                    println!("Not connected.");
                }
            }
            ConsoleCommand::Joystick(x, y) => {
                if let Some(command) = joystick.on_move(x, y, Instant::now()) {
                    let _ = link.send_structured_command(&command).await;
                }
            }
            ConsoleCommand::Release => {
                let command = joystick.on_release();
                let _ = link.send_structured_command(&command).await;
            }
            ConsoleCommand::Status => println!("[link] {}", link.state()),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => break,
        }
    }

    link.disconnect().await;
}

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting RoboCar link (settings: {})",
        settings_service.path().display()
    );
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Could not write default settings: {}", e);
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let chooser = Arc::new(ConsoleChooser::default());
        let adapter = build_adapter(&settings, chooser.clone());
        let link = LinkManager::new(adapter);
        link.subscribe_observer(console_observer());

        run(link, chooser, JoystickShaper::new(&settings.joystick)).await;
    });

    info!("Bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let parse = |line: &str| line.parse::<ConsoleCommand>();
        assert_eq!(parse("connect"), Ok(ConsoleCommand::Connect));
        assert_eq!(parse("  MANUAL "), Ok(ConsoleCommand::Manual));
        assert_eq!(parse("start"), Ok(ConsoleCommand::Auto));
        assert_eq!(parse("joy 0.5 -1"), Ok(ConsoleCommand::Joystick(0.5, -1.0)));
        assert!("joy 0.5".parse::<ConsoleCommand>().is_err());
        assert!("fly".parse::<ConsoleCommand>().is_err());
    }

    #[tokio::test]
    async fn test_chooser_answer_routes_pending_choice() {
        let chooser = Arc::new(ConsoleChooser::default());
        assert!(!chooser.answer("0"));

        let candidates = vec![
            DeviceHandle::new("a", Some("Other".into()), None),
            DeviceHandle::new("b", Some("RoboCar".into()), None),
        ];
        let picking = tokio::spawn({
            let chooser = chooser.clone();
            async move { chooser.choose(candidates).await }
        });
        while !chooser.answer("1") {
            tokio::task::yield_now().await;
        }

        let picked = picking.await.unwrap().unwrap();
        assert_eq!(picked.id, "b");
    }
}
