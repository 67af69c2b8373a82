//! `armgate` – supervisory control plane for a shared robot arm.
//!
//! This binary is the ignition switch for the ArmGate stack.  It:
//!
//! 1. Checks for `~/.armgate/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds the driver, robot manager, session registry, telemetry bus and
//!    control plane, then starts the telemetry pump, session sweeper,
//!    pinger and cockpit server.
//! 3. Drops the operator into an **interactive console** with
//!    slash-commands (`/status`, `/home`, `/estop`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to latch the emergency stop and shut down.

mod config;
mod repl;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use armgate_cockpit::CockpitServer;
use armgate_hal::build_driver;
use armgate_kernel::{RobotManager, SessionRegistry};
use armgate_middleware::TelemetryBus;
use armgate_runtime::{BackgroundTasks, ControlPlane};
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::repl::Console;

fn main() -> ExitCode {
    // Hold the guard for the whole process so pending spans are flushed.
    let _tracing = armgate_runtime::init_tracing("armgate");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(serve(cfg));
    // The console thread may still be parked in a blocking read.
    runtime.shutdown_timeout(Duration::from_secs(2));
    code
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: Config) -> ExitCode {
    info!(?cfg, "starting armgate");

    let driver = build_driver(cfg.driver, &cfg.driver_options());
    let manager = Arc::new(RobotManager::new(driver, cfg.manager_config()));
    let sessions = Arc::new(SessionRegistry::new(cfg.registry_config()));
    let bus = TelemetryBus::new(cfg.bus_config());
    let plane = Arc::new(ControlPlane::new(
        Arc::clone(&manager),
        Arc::clone(&sessions),
        bus.clone(),
        cfg.control_plane_config(),
    ));
    let console = Arc::new(Console::new(
        Arc::clone(&plane),
        tokio::runtime::Handle::current(),
    ));

    if cfg.auto_connect {
        let id = console.session();
        match plane.connect(id, None, None).await {
            Ok(()) => println!(
                "  Robot connected at {}:{}",
                cfg.robot_host, cfg.robot_port
            ),
            Err(e) => {
                warn!(error = %e, "auto-connect failed");
                println!("  {} {}", "Robot connect failed:".yellow(), e);
            }
        }
    }

    let mut tasks = BackgroundTasks::start(
        Arc::clone(&manager),
        sessions,
        bus,
        cfg.background_config(),
    );
    let server = CockpitServer::new(Arc::clone(&plane)).with_port(cfg.server_port);
    let server_signal = tasks.signal();
    tasks.spawn("cockpit_server", async move {
        if let Err(e) = server.run(server_signal).await {
            error!(error = %e, "cockpit server stopped");
        }
    });

    println!();
    println!(
        "  {} ArmGate is {} on port {} (driver: {}). Type {} for commands.\n",
        "✓".green().bold(),
        "RUNNING".green().bold(),
        cfg.server_port.to_string().yellow(),
        manager.driver_name().bold(),
        "/help".bold().cyan()
    );

    // ── Exit triggers: console /quit or EOF, and Ctrl-C ──────────────────
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<&'static str>();

    let ctrlc_console = Arc::clone(&console);
    let ctrlc_tx = exit_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – latching emergency stop …".yellow().bold());
        match ctrlc_console.emergency_stop() {
            Ok(()) => println!("{}", "  ✓ Emergency stop latched.".green()),
            Err(e) => println!("  {} {}", "Emergency stop reported:".red(), e),
        }
        let _ = ctrlc_tx.send("ctrl-c");
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not latch the e-stop");
    }

    let console_signal = tasks.signal();
    let console_thread = Arc::clone(&console);
    let spawned = std::thread::Builder::new()
        .name("armgate-console".to_string())
        .spawn(move || {
            repl::run(&console_thread, console_signal);
            let _ = exit_tx.send("console");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "console unavailable; waiting for Ctrl-C");
    }

    let reason = exit_rx.recv().await.unwrap_or("closed");
    info!(reason, "shutting down");

    tasks.shutdown().await;
    if manager.is_connected()
        && let Err(e) = manager.disconnect().await
    {
        warn!(error = %e, "robot disconnect on shutdown failed");
    }
    console.close();
    println!("{}", "  ✓ Exiting ArmGate.".green());
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       ArmGate First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ArmGate.\n");

    let mut cfg = Config::default();

    println!("  Which robot driver should ArmGate bind?");
    println!("    1) Simulated arm  (default, no hardware)");
    println!("    2) UR controller over URScript");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.driver = armgate_hal::DriverKind::Physical;
        cfg.robot_host = prompt_line(
            &format!("  Controller address [{}]: ", cfg.robot_host),
            &cfg.robot_host,
        );
        let port = prompt_line(
            &format!("  Controller port [{}]: ", cfg.robot_port),
            &cfg.robot_port.to_string(),
        );
        if let Ok(p) = port.trim().parse::<u16>() {
            cfg.robot_port = p;
        }
    }

    let port = prompt_line(
        &format!("  Cockpit HTTP/WebSocket port [{}]: ", cfg.server_port),
        &cfg.server_port.to_string(),
    );
    if let Ok(p) = port.trim().parse::<u16>() {
        cfg.server_port = p;
    }

    let pin = prompt_line("  Supervisor PIN [keep default]: ", "");
    if !pin.is_empty() {
        cfg.supervisor_pin = pin;
    } else {
        println!(
            "  {} the default PIN is in use; change `supervisor_pin` before production.",
            "Warning:".yellow()
        );
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ___                 ______      __     "#.bold().cyan());
    println!("{}", r#"   /   |  _________ _  / ____/___ _/ /____ "#.bold().cyan());
    println!("{}", r#"  / /| | / ___/ __ `__/ / __/ __ `/ __/ _ \"#.bold().cyan());
    println!("{}", r#" / ___ |/ /  / / / / / /_/ / /_/ / /_/  __/"#.bold().cyan());
    println!("{}", r#"/_/  |_/_/  /_/ /_/ /_\____/\__,_/\__/\___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "ArmGate".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Supervisory control plane for a shared robot arm");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
