use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use monomux::client::terminal::{window_size, RawModeGuard};
use monomux::client::{Client, ExitReason};
use monomux::error::{FrontendExitCode, MuxError, Result};
use monomux::ipc::message::{DetachMode, SpawnOptions};
use monomux::ipc::{self, SessionEnv};
use monomux::server::{daemon, Server};
use monomux::session_picker::{self, Selection};
use monomux::signals::SIGWINCH;
use monomux::socket::ListenSocket;

#[derive(Parser)]
#[command(
    name = "monomux",
    about = "A terminal session multiplexer without terminal emulation",
    version
)]
struct Cli {
    /// Run the server process instead of a client.
    #[arg(long)]
    server: bool,

    /// Path of the server socket.
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    socket: Option<String>,

    /// Name of the session to attach to or create.
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Set an environment variable for the spawned session.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Unset an environment variable for the spawned session.
    #[arg(short = 'u', long = "unset", value_name = "KEY")]
    unset: Vec<String>,

    /// List the sessions running on the server and exit.
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Always show the interactive session menu.
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// Detach the most recent client of the current session.
    #[arg(short = 'd', long = "detach")]
    detach: bool,

    /// Detach every client of the current session.
    #[arg(short = 'D', long = "detach-all")]
    detach_all: bool,

    /// Print the server's diagnostic dump and exit.
    #[arg(long)]
    statistics: bool,

    /// Keep the server in the foreground (implies --keepalive).
    #[arg(short = 'N', long = "no-daemon")]
    no_daemon: bool,

    /// Keep the server alive after its last session exits.
    #[arg(short = 'k', long = "keepalive")]
    keepalive: bool,

    /// More logging; repeatable.
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Less logging; repeatable.
    #[arg(short = 'q', action = ArgAction::Count)]
    quiet: u8,

    /// Program (and its arguments) to launch in a new session.
    #[arg(last = true, value_name = "PROGRAM")]
    program: Vec<String>,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn init_logging(verbose: u8, quiet: u8) -> FilterHandle {
    let level = match 1i16 + verbose as i16 - quiet as i16 {
        i16::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("monomux={level}")));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
    handle
}

fn main() {
    let cli = Cli::parse();
    let filter_handle = init_logging(cli.verbose, cli.quiet);

    let code = match run(cli, filter_handle) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e}");
            e.exit_code() as i32
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, filter_handle: FilterHandle) -> Result<i32> {
    if cli.server {
        return server_main(&cli).map(|c| c as i32);
    }
    client_main(cli, filter_handle)
}

// ---- server ------------------------------------------------------------

fn server_main(cli: &Cli) -> Result<FrontendExitCode> {
    let path = ipc::resolve_socket_path(cli.socket.as_deref());
    ipc::ensure_socket_dir(&path)?;

    if !cli.no_daemon {
        daemon::daemonize()?;
    }

    let listener = ListenSocket::bind(&path)?;
    let mut server = Server::new(listener)?;
    let keepalive = cli.keepalive || cli.no_daemon;
    server.set_exit_if_no_more_sessions(!keepalive);

    info!("starting monomux server");
    let result = server.run();
    server.shutdown();
    info!("monomux server stopped");
    result.map(|_| FrontendExitCode::Success)
}

fn spawn_server(cli: &Cli, path: &Path) -> Result<()> {
    info!(socket = %path.display(), "no server found, starting one");
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--server").arg("--socket").arg(path);
    if cli.keepalive {
        cmd.arg("--keepalive");
    }
    // The child re-forks as a daemon; the intermediate exits immediately.
    let mut child = cmd
        .spawn()
        .map_err(|e| MuxError::System(format!("spawning the server failed: {e}")))?;
    let _ = child.wait();
    Ok(())
}

// ---- client ------------------------------------------------------------

fn client_main(cli: Cli, filter_handle: FilterHandle) -> Result<i32> {
    let control_mode = cli.detach || cli.detach_all || cli.statistics;
    let env_session = SessionEnv::load_from_env();

    // In-session control clients default to the socket of the session
    // they run inside of.
    let path: PathBuf = if control_mode && cli.socket.is_none() {
        env_session
            .as_ref()
            .map(|s| s.socket.clone())
            .unwrap_or_else(|| ipc::resolve_socket_path(None))
    } else {
        ipc::resolve_socket_path(cli.socket.as_deref())
    };

    let mut client = match Client::connect(&path, false) {
        Ok(client) => client,
        Err(e) => {
            if control_mode {
                return Err(e);
            }
            spawn_server(&cli, &path)?;
            Client::connect(&path, true)?
        }
    };

    if cli.statistics {
        let stats = client.request_statistics()?;
        println!("{stats}");
        return Ok(FrontendExitCode::Success as i32);
    }

    if cli.detach || cli.detach_all {
        let session = match cli.name.clone().or(env_session.map(|s| s.session)) {
            Some(name) => name,
            None => {
                return Err(MuxError::Invocation(
                    "detach requires running inside a session or naming one with --name".into(),
                ))
            }
        };
        if !client.request_attach(&session)? {
            return Err(MuxError::System(format!(
                "failed to attach to session '{session}'"
            )));
        }
        let mode = if cli.detach_all {
            DetachMode::All
        } else {
            DetachMode::Latest
        };
        client.request_detach(mode)?;
        return Ok(FrontendExitCode::Success as i32);
    }

    handshake_with_retries(&mut client)?;

    let sessions = client.request_session_list()?;
    let spawn = build_spawn_options(&cli)?;
    let requested = cli.name.clone().unwrap_or_default();

    let selection = {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stdout();
        session_picker::select_session(
            &path.display().to_string(),
            &spawn.program,
            &sessions,
            &requested,
            cli.list,
            cli.interactive,
            &mut input,
            &mut output,
        )?
    };

    let session_name = match selection {
        Selection::None => return Ok(FrontendExitCode::Success as i32),
        Selection::Create(name) => client.request_make_session(&name, spawn)?,
        Selection::Attach(name) => name,
    };

    if !client.request_attach(&session_name)? {
        return Err(MuxError::System(format!(
            "failed to attach to session '{session_name}'"
        )));
    }

    attach_ui(client, filter_handle)
}

fn handshake_with_retries(client: &mut Client) -> Result<()> {
    const MAX_HANDSHAKE_TRIES: usize = 4;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.handshake() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_HANDSHAKE_TRIES => {
                warn!(attempt, error = %e, "establishing full connection failed, retrying");
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
            Err(e) => {
                return Err(MuxError::System(format!(
                    "failed to establish full connection after {attempt} attempts: {e}"
                )))
            }
        }
    }
}

fn build_spawn_options(cli: &Cli) -> Result<SpawnOptions> {
    let (program, args) = match cli.program.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => (
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into()),
            Vec::new(),
        ),
    };

    let mut set_env = Vec::new();
    for entry in &cli.env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                set_env.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(MuxError::Invocation(format!(
                    "--env expects KEY=VALUE, got '{entry}'"
                )))
            }
        }
    }

    Ok(SpawnOptions {
        program,
        args,
        set_env,
        unset_env: cli.unset.clone(),
    })
}

/// Take over the terminal and pump it against the attached session.
fn attach_ui(mut client: Client, filter_handle: FilterHandle) -> Result<i32> {
    if !std::io::stdin().is_terminal() {
        warn!("standard input is not a terminal");
    }

    // Nudge the remote program into redrawing at our dimensions. Prompts
    // that skip same-size redraws get a deliberate off-by-one first.
    client.send_signal(SIGWINCH);
    if let Ok((rows, cols)) = window_size() {
        if rows > 1 && cols > 1 {
            client.notify_window_size(rows - 1, cols - 1);
        }
        client.notify_window_size(rows, cols);
    }

    client.set_input(0);
    client.set_output(1);

    // Log lines would garble the raw terminal; silence everything below
    // error for the duration of the loop.
    let _ = filter_handle.modify(|f| *f = EnvFilter::new("monomux=error"));
    let loop_result = {
        let mut raw = RawModeGuard::engage()?;
        let r = client.run();
        raw.disengage();
        r
    };
    loop_result?;

    Ok(exit_banner(&client))
}

/// The bracketed status line after the loop ends, and the process's exit
/// code.
fn exit_banner(client: &Client) -> i32 {
    let exit = client.exit_state();
    let session_suffix = client
        .attached_session()
        .map(|s| format!(" (from session '{}')", s.name))
        .unwrap_or_default();

    println!();
    match exit.reason {
        ExitReason::None => {
            println!("[unknown reason]");
            FrontendExitCode::SystemError as i32
        }
        ExitReason::Failed => {
            println!("[lost server]");
            FrontendExitCode::SystemError as i32
        }
        ExitReason::Terminated => {
            println!("[terminated]");
            FrontendExitCode::Success as i32
        }
        ExitReason::Hangup => {
            println!("[lost tty]");
            FrontendExitCode::SystemError as i32
        }
        ExitReason::Detached => {
            println!("[detached{session_suffix}]");
            FrontendExitCode::Success as i32
        }
        ExitReason::SessionExit => {
            if exit.code != 0 {
                println!("[exited (with return code {}){session_suffix}]", exit.code);
            } else {
                println!("[exited{session_suffix}]");
            }
            exit.code
        }
        ExitReason::ServerExit => {
            println!("[server exited]");
            FrontendExitCode::Success as i32
        }
        ExitReason::ServerKicked => {
            if exit.message.is_empty() {
                println!("[booted from server]");
            } else {
                println!("[booted from server: {}]", exit.message);
            }
            FrontendExitCode::Success as i32
        }
    }
}
