//! Operator console – the REPL attached to the running server.
//!
//! Supported slash-commands:
//!   /status                      – robot, sessions and observers at a glance
//!   /connect [host] [port]       – connect to the controller
//!   /disconnect                  – drop the controller connection
//!   /home                        – move to the home pose
//!   /jog <axis|jN> <delta> [spd] – relative jog (TCP axis x..rz or joint j0..j5)
//!   /stop                        – halt the current motion
//!   /estop                       – latch the emergency stop
//!   /supervisor [pin]            – escalate the console session
//!   /clear-estop [pin]           – release the e-stop latch
//!   /safez                       – lift to the safe Z height
//!   /limits [speed z_min z_max]  – show or replace the safety limits
//!   /sessions                    – list live sessions
//!   /stats                       – observer connection counters
//!   /errors [clear]              – recent robot errors
//!   /help                        – show this list
//!   /quit | /exit                – stop the server and exit
//!
//! The console runs on its own OS thread and drives the async control
//! plane through a runtime [`Handle`].  It holds an ordinary session, so
//! its commands pass the same authorization and audit trail as any remote
//! operator.

use std::sync::{Arc, Mutex, PoisonError};

use armgate_runtime::{ControlPlane, ShutdownSignal};
use armgate_types::{ArmError, JogCommand, SafetyLimits, SessionId, TcpAxis};
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Handle;
use tracing::{info, warn};
use zeroize::Zeroizing;

const DEFAULT_JOG_SPEED: f64 = 0.1;

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed console line.  PIN-bearing variants wipe the PIN on drop.
pub enum ConsoleCommand {
    Status,
    Connect { host: Option<String>, port: Option<u16> },
    Disconnect,
    Home,
    Jog(JogCommand),
    Stop,
    Estop,
    Supervisor { pin: Option<Zeroizing<String>> },
    ClearEstop { pin: Option<Zeroizing<String>> },
    SafeZ,
    ShowLimits,
    SetLimits { speed_max: f64, z_min: f64, z_max: f64 },
    Sessions,
    Stats,
    Errors { clear: bool },
    Help,
    Quit,
}

fn number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("'{raw}' is not a valid {what}"))
}

fn jog_target(raw: &str, delta: f64, speed: f64) -> Result<JogCommand, String> {
    if let Some(index) = raw.strip_prefix('j').or_else(|| raw.strip_prefix('J'))
        && !index.is_empty()
        && index.chars().all(|c| c.is_ascii_digit())
    {
        let joint = number(index, "joint index")?;
        return Ok(JogCommand::joint(joint, delta, speed));
    }
    let axis: TcpAxis = raw.parse().map_err(|e: ArmError| e.to_string())?;
    Ok(JogCommand::tcp(axis, delta, speed))
}

/// Parse one console line.  Returns a user-facing message on failure.
pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let pin = args.first().map(|p| Zeroizing::new(p.to_string()));

    let cmd = match (head, args.as_slice()) {
        ("/status", []) => ConsoleCommand::Status,
        ("/connect", []) => ConsoleCommand::Connect { host: None, port: None },
        ("/connect", [host]) => ConsoleCommand::Connect {
            host: Some(host.to_string()),
            port: None,
        },
        ("/connect", [host, port]) => ConsoleCommand::Connect {
            host: Some(host.to_string()),
            port: Some(number(port, "port")?),
        },
        ("/disconnect", []) => ConsoleCommand::Disconnect,
        ("/home", []) => ConsoleCommand::Home,
        ("/jog", [target, delta]) => {
            ConsoleCommand::Jog(jog_target(target, number(delta, "delta")?, DEFAULT_JOG_SPEED)?)
        }
        ("/jog", [target, delta, speed]) => ConsoleCommand::Jog(jog_target(
            target,
            number(delta, "delta")?,
            number(speed, "speed")?,
        )?),
        ("/stop", []) => ConsoleCommand::Stop,
        ("/estop", []) => ConsoleCommand::Estop,
        ("/supervisor", [] | [_]) => ConsoleCommand::Supervisor { pin },
        ("/clear-estop", [] | [_]) => ConsoleCommand::ClearEstop { pin },
        ("/safez", []) => ConsoleCommand::SafeZ,
        ("/limits", []) => ConsoleCommand::ShowLimits,
        ("/limits", [speed, lo, hi]) => ConsoleCommand::SetLimits {
            speed_max: number(speed, "speed")?,
            z_min: number(lo, "z_min")?,
            z_max: number(hi, "z_max")?,
        },
        ("/sessions", []) => ConsoleCommand::Sessions,
        ("/stats", []) => ConsoleCommand::Stats,
        ("/errors", []) => ConsoleCommand::Errors { clear: false },
        ("/errors", ["clear"]) => ConsoleCommand::Errors { clear: true },
        ("/help", _) => ConsoleCommand::Help,
        ("/quit" | "/exit", _) => ConsoleCommand::Quit,
        (
            "/status" | "/connect" | "/disconnect" | "/home" | "/jog" | "/stop" | "/estop"
            | "/supervisor" | "/clear-estop" | "/safez" | "/limits" | "/sessions" | "/stats"
            | "/errors",
            _,
        ) => return Err(format!("wrong arguments for {head}; see /help")),
        (other, _) => return Err(format!("unknown command '{other}'")),
    };
    Ok(cmd)
}

// ─────────────────────────────────────────────────────────────────────────────
// Console
// ─────────────────────────────────────────────────────────────────────────────

/// The local operator: a session on the control plane plus a runtime handle.
pub struct Console {
    plane: Arc<ControlPlane>,
    handle: Handle,
    session: Mutex<SessionId>,
}

impl Console {
    pub fn new(plane: Arc<ControlPlane>, handle: Handle) -> Self {
        let session = Self::open_session(&plane);
        Self {
            plane,
            handle,
            session: Mutex::new(session),
        }
    }

    fn open_session(plane: &ControlPlane) -> SessionId {
        plane
            .start_session(
                Some("console".to_string()),
                Some(format!("armgate-cli/{}", env!("CARGO_PKG_VERSION"))),
            )
            .id
    }

    /// The console's session id, reopened if it expired while idle.
    pub fn session(&self) -> SessionId {
        let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if self.plane.sessions().get_session(*current).is_none() {
            let reopened = Self::open_session(&self.plane);
            info!(session_id = %reopened, "console session reopened");
            *current = reopened;
        }
        *current
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Latch the e-stop from any thread, e.g. a signal handler.
    pub fn emergency_stop(&self) -> Result<(), ArmError> {
        let id = self.session();
        self.handle.block_on(self.plane.emergency_stop(id))
    }

    pub fn close(&self) {
        let id = *self.session.lock().unwrap_or_else(PoisonError::into_inner);
        self.plane.end_session(id);
    }

    /// Run one command.  Returns `false` when the console should exit.
    pub fn execute(&self, cmd: ConsoleCommand) -> bool {
        let id = self.session();
        let plane = &self.plane;
        let outcome: Result<(), ArmError> = match cmd {
            ConsoleCommand::Status => {
                self.print_status(id);
                Ok(())
            }
            ConsoleCommand::Connect { host, port } => {
                self.handle.block_on(plane.connect(id, host, port))
            }
            ConsoleCommand::Disconnect => self.handle.block_on(plane.disconnect(id)),
            ConsoleCommand::Home => self.handle.block_on(plane.home(id)),
            ConsoleCommand::Jog(jog) => self.handle.block_on(plane.jog(id, jog)),
            ConsoleCommand::Stop => self.handle.block_on(plane.stop(id)),
            ConsoleCommand::Estop => self.handle.block_on(plane.emergency_stop(id)),
            ConsoleCommand::Supervisor { pin } => match pin {
                Some(pin) => plane.authenticate_supervisor(id, &pin).map(|session| {
                    println!(
                        "  Supervisor granted until {}",
                        session.expires_at.format("%H:%M:%S UTC").to_string().bold()
                    );
                }),
                None => Err(ArmError::Unauthorized("PIN required".into())),
            },
            ConsoleCommand::ClearEstop { pin } => match pin {
                Some(pin) => self.handle.block_on(plane.clear_estop(id, &pin)),
                None => Err(ArmError::Unauthorized("PIN required".into())),
            },
            ConsoleCommand::SafeZ => self.handle.block_on(plane.move_to_safe_z(id)),
            ConsoleCommand::ShowLimits => {
                print_limits(&plane.manager().limits());
                Ok(())
            }
            ConsoleCommand::SetLimits { .. } => Err(ArmError::Unauthorized("PIN required".into())),
            ConsoleCommand::Sessions => {
                self.print_sessions(id);
                Ok(())
            }
            ConsoleCommand::Stats => {
                self.print_stats();
                Ok(())
            }
            ConsoleCommand::Errors { clear } => {
                self.print_errors(clear);
                Ok(())
            }
            ConsoleCommand::Help => {
                cmd_help();
                Ok(())
            }
            ConsoleCommand::Quit => return false,
        };
        report(outcome);
        true
    }

    /// Replace the limits after the caller has collected the PIN.
    pub fn set_limits(&self, speed_max: f64, z_min: f64, z_max: f64, pin: &str) {
        let limits = SafetyLimits {
            max_speed: speed_max,
            z_min,
            z_max,
            ..self.plane.manager().limits()
        };
        let outcome = self.plane.update_limits(self.session(), limits, pin);
        report(outcome);
    }

    // ── views ────────────────────────────────────────────────────────────

    fn print_status(&self, id: SessionId) {
        let health = self.plane.health();
        let state = health.robot_state.to_string();
        let state = if health.estop_latched { state.red().bold() } else { state.green() };
        println!("  State       : {state}");
        println!(
            "  Driver      : {} ({})",
            health.driver.bold(),
            if health.robot_connected { "connected".green() } else { "disconnected".yellow() }
        );
        println!("  Sessions    : {}", health.active_sessions);
        println!("  Observers   : {}", health.websocket_connections);
        println!("  Uptime      : {:.0}s", health.uptime_secs);
        if let Ok(snapshot) = self.handle.block_on(self.plane.telemetry(id)) {
            let p = snapshot.pose;
            println!(
                "  TCP         : x={:.4} y={:.4} z={:.4} rx={:.3} ry={:.3} rz={:.3}",
                p.x, p.y, p.z, p.rx, p.ry, p.rz
            );
            println!("  TCP speed   : {:.3}", snapshot.speed);
            if !snapshot.network.link_up {
                println!("  {}", "telemetry link down: showing last known values".yellow());
            }
        }
    }

    fn print_sessions(&self, own: SessionId) {
        let sessions = self.plane.sessions().active_sessions();
        if sessions.is_empty() {
            println!("  No live sessions.");
            return;
        }
        for s in sessions {
            let marker = if s.id == own { "*" } else { " " };
            let role = if s.is_supervisor { "supervisor".magenta() } else { "operator".normal() };
            println!(
                " {marker} {}  {:<12} {:<10} expires {}",
                s.id,
                s.client_id.as_deref().unwrap_or("-"),
                role,
                s.expires_at.format("%H:%M:%S UTC")
            );
        }
    }

    fn print_stats(&self) {
        let stats = self.plane.bus().stats();
        println!("  telemetry   : {}", stats.telemetry_connections);
        println!("  alerts      : {}", stats.alert_connections);
        println!("  jobs        : {}", stats.job_connections);
        println!("  analysis    : {}", stats.analysis_connections);
        println!("  total       : {} live / {} ever", stats.total_active, stats.total_connections);
        println!(
            "  messages    : {} sent, {} failed, {} dropped",
            stats.messages_sent, stats.messages_failed, stats.messages_dropped
        );
    }

    fn print_errors(&self, clear: bool) {
        let manager = self.plane.manager();
        let errors = manager.errors();
        if errors.is_empty() {
            println!("  No recorded errors.");
        }
        for e in &errors {
            println!("  {} {e}", "•".red());
        }
        if clear {
            manager.clear_errors();
            println!("  {}", "Error log cleared.".dimmed());
        }
    }
}

fn print_limits(limits: &SafetyLimits) {
    println!("  speed_max   : {}", limits.max_speed);
    println!("  z band      : [{}, {}]", limits.z_min, limits.z_max);
    println!("  keep-outs   : {}", limits.keepout.len());
}

fn report(outcome: Result<(), ArmError>) {
    match outcome {
        Ok(()) => println!("  {}", "OK".green()),
        Err(e) => println!("  {} {e}", format!("{:?}:", e.kind()).red()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Read and execute commands until `/quit`, end of input, or shutdown.
///
/// Ctrl-C at the prompt latches the e-stop before the console exits.
pub fn run(console: &Console, shutdown: ShutdownSignal) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            warn!(error = %e, "console unavailable");
            return;
        }
    };

    loop {
        if shutdown.is_shutdown_requested() {
            break;
        }

        let line = match editor.readline("armgate> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "⚠  Ctrl-C – latching emergency stop".yellow().bold());
                report(console.emergency_stop());
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {e}", "Read error".red());
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cmd = match parse(line) {
            Ok(cmd) => cmd,
            Err(msg) => {
                println!("{} {msg}. Type {} for available commands.", "Error:".red(), "/help".bold());
                continue;
            }
        };
        // PINs stay out of the history.
        if !matches!(
            cmd,
            ConsoleCommand::Supervisor { .. }
                | ConsoleCommand::ClearEstop { .. }
                | ConsoleCommand::SetLimits { .. }
        ) {
            let _ = editor.add_history_entry(line);
        }

        let cmd = match cmd {
            ConsoleCommand::Supervisor { pin: None } => ConsoleCommand::Supervisor {
                pin: read_pin(&mut editor),
            },
            ConsoleCommand::ClearEstop { pin: None } => ConsoleCommand::ClearEstop {
                pin: read_pin(&mut editor),
            },
            ConsoleCommand::SetLimits { speed_max, z_min, z_max } => {
                if let Some(pin) = read_pin(&mut editor) {
                    console.set_limits(speed_max, z_min, z_max, &pin);
                }
                continue;
            }
            other => other,
        };

        if !console.execute(cmd) {
            println!("{}", "Goodbye.".green());
            break;
        }
    }
}

fn read_pin(editor: &mut DefaultEditor) -> Option<Zeroizing<String>> {
    match editor.readline("  Supervisor PIN: ") {
        Ok(pin) if !pin.trim().is_empty() => Some(Zeroizing::new(pin.trim().to_string())),
        _ => {
            println!("  {}", "Cancelled.".dimmed());
            None
        }
    }
}

fn cmd_help() {
    println!();
    println!("  {}", "Robot".bold());
    println!("    {:<30} {}", "/status".cyan(), "Robot, sessions and observers");
    println!("    {:<30} {}", "/connect [host] [port]".cyan(), "Connect to the controller");
    println!("    {:<30} {}", "/disconnect".cyan(), "Drop the controller connection");
    println!("    {:<30} {}", "/home".cyan(), "Move to the home pose");
    println!("    {:<30} {}", "/jog <axis|jN> <delta> [spd]".cyan(), "Relative jog");
    println!("    {:<30} {}", "/safez".cyan(), "Lift to the safe Z height");
    println!("    {:<30} {}", "/stop".cyan(), "Halt the current motion");
    println!("    {:<30} {}", "/estop".cyan(), "Latch the emergency stop");
    println!("  {}", "Supervisor".bold());
    println!("    {:<30} {}", "/supervisor [pin]".cyan(), "Escalate this console");
    println!("    {:<30} {}", "/clear-estop [pin]".cyan(), "Release the e-stop latch");
    println!("    {:<30} {}", "/limits [speed z_min z_max]".cyan(), "Show or replace limits");
    println!("  {}", "System".bold());
    println!("    {:<30} {}", "/sessions".cyan(), "List live sessions");
    println!("    {:<30} {}", "/stats".cyan(), "Observer connection counters");
    println!("    {:<30} {}", "/errors [clear]".cyan(), "Recent robot errors");
    println!("    {:<30} {}", "/quit".cyan(), "Stop the server and exit");
    println!();
}
