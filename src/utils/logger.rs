use std::env;
use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ANSI color codes for console output
pub struct Colors;

impl Colors {
    /// Primary actions/success - #5FADEB
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Info/progress - #4A9BD9
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    /// Technical details - #808080
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    /// Errors - #FF3B30
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Warnings - #FF9500
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
}

pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const ARROW: &'static str = "→";
    pub const BULLET: &'static str = "•";
}

/// Human-facing console output for CLI subcommands.
///
/// Daemon diagnostics go through `tracing`; this is only for text meant to be
/// read by an operator at a terminal.
pub struct Logger;

impl Logger {
    fn paint(color: &str, symbol: &str, message: &str) -> String {
        if should_use_colors() {
            format!("{}{} {}{}", color, symbol, message, Colors::RESET)
        } else {
            format!("{} {}", symbol, message)
        }
    }

    pub fn success(message: &str) {
        println!("{}", Self::paint(Colors::MAIN, Symbols::SUCCESS, message));
    }

    /// Errors go to stderr
    pub fn error(message: &str) {
        eprintln!("{}", Self::paint(Colors::ERROR, Symbols::ERROR, message));
    }

    pub fn warning(message: &str) {
        println!("{}", Self::paint(Colors::WARNING, Symbols::WARNING, message));
    }

    /// Indented key/value line, e.g. `  subnet → 10.200.1.0/24`
    pub fn detail(label: &str, value: &str) {
        if should_use_colors() {
            println!(
                "  {}{}{} {} {}{}{}",
                Colors::DIM_GRAY,
                label,
                Colors::RESET,
                Symbols::ARROW,
                Colors::SECONDARY,
                value,
                Colors::RESET
            );
        } else {
            println!("  {} {} {}", label, Symbols::ARROW, value);
        }
    }

    pub fn section(title: &str) {
        if should_use_colors() {
            println!("\n{}{}{}{}", Colors::BOLD, Colors::MAIN, title, Colors::RESET);
        } else {
            println!("\n{}", title);
        }
    }

    pub fn item(message: &str) {
        println!("  {} {}", Symbols::BULLET, message);
    }
}

/// Colors are off when NO_COLOR is set or stdout is not a terminal
pub fn should_use_colors() -> bool {
    env::var("NO_COLOR").is_err() && std::io::stdout().is_terminal()
}

/// Resolve the tracing filter directive.
///
/// `HYDRA_LOG` wins when set; otherwise `--verbose` (or `HYDRA_DEBUG`) selects
/// debug for this crate and info for everything else.
pub fn filter_directive(verbose: bool) -> String {
    if let Ok(directive) = env::var("HYDRA_LOG") {
        if !directive.trim().is_empty() {
            return directive;
        }
    }
    if verbose || env::var("HYDRA_DEBUG").is_ok() {
        "info,hydra_bridger=debug".to_string()
    } else {
        "info".to_string()
    }
}

/// Install the global tracing subscriber. Call once from `main`.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_new(filter_directive(verbose))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false),
        )
        .try_init();
}
