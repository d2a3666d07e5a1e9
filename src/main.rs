//! tterm - console front end for the tterm terminal core
//!
//! Opens one connection (serial, telnet, ssh, sftp, netconf or a local
//! command) and shows it in the console. With no connection string the
//! local `> ` prompt accepts one, along with the `!` commands.
//!
//! ```text
//! tterm                          # local prompt
//! tterm ssh admin@router         # SSH shell
//! tterm telnet 10.0.0.1:2323     # telnet
//! tterm com1:115200,n,8,1       # serial port
//! ```
//!
//! | Key | Action |
//! |-----|--------|
//! | Ctrl+] | Quit |
//! | Shift+PageUp/PageDown | Scroll back / forward |
//! | Mouse wheel | Scroll |
//! | Drag / double click | Select |
//! | Middle click | Paste selection |

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use crossterm::execute;
use crossterm::terminal::SetTitle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tterm::config::Config;
use tterm::core::session::{Session, SessionEvent};
use tterm::ui::{is_quit_key, KeyMapper, Renderer};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const POLL: Duration = Duration::from_millis(10);
const DOUBLE_CLICK: Duration = Duration::from_millis(400);
const WHEEL_LINES: isize = 3;

/// Command line options
#[derive(Default)]
struct Args {
    cols: Option<u16>,
    rows: Option<u16>,
    config: Option<PathBuf>,
    spec: Option<String>,
}

fn print_help() {
    eprintln!("tterm {} - serial, telnet, SSH, SFTP and netconf terminal", VERSION);
    eprintln!();
    eprintln!("Usage: tterm [OPTIONS] [CONNECTION]");
    eprintln!();
    eprintln!("Connections:");
    eprintln!("  PORT[:BAUD,PARITY,DATA,STOP]   serial port, e.g. com1:9600,n,8,1");
    eprintln!("  telnet HOST[:PORT]");
    eprintln!("  ssh [-l USER] [-pw PASS] [-pp PASSPHRASE] [-P PORT] [-s SUBSYSTEM] [USER@]HOST[:PORT]");
    eprintln!("  sftp ...              same options as ssh");
    eprintln!("  netconf [USER@]HOST[:PORT]");
    eprintln!("  any other text runs as a local command");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --cols N              Terminal width (default: console width)");
    eprintln!("  --rows N              Terminal height (default: console height - 1)");
    eprintln!("  -c, --config FILE     Configuration file (default: ~/.tterm/config.toml)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Ctrl+] quits. Type !Help at the prompt for the command list.");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut rest = Vec::new();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                eprintln!("tterm {}", VERSION);
                std::process::exit(0);
            }
            "--cols" | "--rows" => {
                let flag = args[i].clone();
                i += 1;
                let value = args
                    .get(i)
                    .and_then(|v| v.parse::<u16>().ok())
                    .filter(|&v| v > 0)
                    .ok_or_else(|| format!("{} needs a positive number", flag))?;
                if flag == "--cols" {
                    parsed.cols = Some(value);
                } else {
                    parsed.rows = Some(value);
                }
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing config file argument")?;
                parsed.config = Some(PathBuf::from(path));
            }
            arg if arg.starts_with('-') && rest.is_empty() => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            arg => rest.push(arg.to_string()),
        }
        i += 1;
    }

    if !rest.is_empty() {
        parsed.spec = Some(rest.join(" "));
    }
    Ok(parsed)
}

fn init_logging(config: &Config) {
    let log_path = Config::data_dir()
        .map(|dir| dir.join("tterm.log"))
        .unwrap_or_else(|| PathBuf::from("tterm.log"));
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    init_logging(&config);
    info!("tterm {} starting", VERSION);

    let (width, height) = Renderer::size().unwrap_or((80, 25));
    config.cols = args.cols.unwrap_or(width);
    config.rows = args.rows.unwrap_or(height.saturating_sub(1).max(1));
    info!("terminal size: {}x{}", config.cols, config.rows);

    let mut session = Session::new(config);
    let mut renderer = Renderer::new();
    renderer.init()?;

    match &args.spec {
        Some(spec) => {
            if let Err(e) = session.open(spec) {
                error!("cannot open '{}': {}", spec, e);
                session.term().lock().disp_error(&format!("{}\r\n", e));
                session.show_local_prompt();
            }
        }
        None => session.show_local_prompt(),
    }

    let result = run_main_loop(&mut session, &mut renderer);
    let _ = renderer.cleanup();
    session.close();
    info!("tterm exiting");
    result
}

/// Mouse state for selection
#[derive(Default)]
struct Pointer {
    anchor: Option<(usize, usize)>,
    last_click: Option<(Instant, (usize, usize))>,
}

fn run_main_loop(session: &mut Session, renderer: &mut Renderer) -> anyhow::Result<()> {
    let mut dirty = true;
    let mut pointer = Pointer::default();

    loop {
        while let Some(event) = session.poll_event() {
            match event {
                SessionEvent::Bell => {
                    let mut stdout = io::stdout();
                    let _ = stdout.write_all(b"\x07");
                    let _ = stdout.flush();
                }
                SessionEvent::TitleChanged(title) => {
                    let _ = execute!(io::stdout(), SetTitle(title));
                }
                SessionEvent::Connected(name) => info!("connected to {}", name),
                SessionEvent::Disconnected(name) => info!("disconnected from {}", name),
                SessionEvent::Redraw => {}
            }
            dirty = true;
        }

        if dirty {
            let snapshot = session.term().lock().snapshot();
            renderer.render(&snapshot, &session.host().status_line())?;
            dirty = false;
        }

        if !event::poll(POLL)? {
            continue;
        }
        match event::read()? {
            Event::Key(key) => {
                if is_quit_key(&key) {
                    break;
                }
                if handle_view_key(session, key.code, key.modifiers) {
                    dirty = true;
                    continue;
                }
                let modes = session.term().lock().buf.modes;
                if let Some(bytes) = KeyMapper::map(&key, modes) {
                    session.term().lock().buf.scroll_to_bottom();
                    session.send_keys(&bytes);
                    dirty = true;
                }
            }
            Event::Mouse(mouse) => {
                dirty |= handle_mouse(session, &mut pointer, mouse);
            }
            Event::Paste(text) => {
                session.paste(&text);
                dirty = true;
            }
            Event::Resize(width, height) => {
                renderer.invalidate((width, height));
                session.resize(width as usize, renderer.view_rows() as usize);
                dirty = true;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Scrollback keys; true when the key was used
fn handle_view_key(session: &Session, code: KeyCode, mods: KeyModifiers) -> bool {
    if !mods.contains(KeyModifiers::SHIFT) {
        return false;
    }
    let page = session.term().lock().buf.rows as isize;
    match code {
        KeyCode::PageUp => session.scroll(-page),
        KeyCode::PageDown => session.scroll(page),
        KeyCode::End => session.term().lock().buf.scroll_to_bottom(),
        _ => return false,
    }
    true
}

fn handle_mouse(session: &mut Session, pointer: &mut Pointer, mouse: MouseEvent) -> bool {
    let pos = (mouse.row as usize, mouse.column as usize);
    match mouse.kind {
        MouseEventKind::ScrollUp => session.scroll(-WHEEL_LINES),
        MouseEventKind::ScrollDown => session.scroll(WHEEL_LINES),
        MouseEventKind::Down(MouseButton::Left) => {
            let now = Instant::now();
            let double = matches!(pointer.last_click, Some((at, p)) if p == pos && now.duration_since(at) < DOUBLE_CLICK);
            let mut term = session.term().lock();
            if double {
                term.buf.select_word_at(pos.0, pos.1);
                pointer.last_click = None;
            } else {
                term.buf.clear_selection();
                pointer.last_click = Some((now, pos));
            }
            pointer.anchor = Some(pos);
        }
        MouseEventKind::Drag(MouseButton::Left) => match pointer.anchor {
            Some(anchor) => session.term().lock().buf.drag_select(anchor, pos),
            None => return false,
        },
        MouseEventKind::Up(MouseButton::Left) => {
            pointer.anchor = None;
            return false;
        }
        MouseEventKind::Down(MouseButton::Middle) => match session.copy() {
            Some(text) => session.paste(&text),
            None => return false,
        },
        _ => return false,
    }
    true
}
