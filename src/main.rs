use clap::Parser;

mod artifacts;
mod atomic;
mod cancel;
mod cli;
mod color;
mod dag;
mod engine;
mod error;
mod lock;
mod paths;
mod path_guard;
mod plan;
mod report;
mod retry;
mod runner;
mod state;
mod store;

use cli::Cli;
use error::OrchError;

fn main() {
    let cli = Cli::parse();
    match cli::dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            print_error(&err);
            std::process::exit(exit_code_for_error(&err));
        }
    }
}

fn print_error(err: &OrchError) {
    if color::colors_enabled() {
        use anstyle::{AnsiColor, Color, Style};
        let style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red)));
        eprintln!("{style}Error: {err}{style:#}");
    } else {
        eprintln!("Error: {err}");
    }
}

fn exit_code_for_error(err: &OrchError) -> i32 {
    match err {
        OrchError::Plan(_) | OrchError::State(_) => 2,
        OrchError::RunConflict(_) => 3,
        OrchError::Os(_) => 2,
    }
}
