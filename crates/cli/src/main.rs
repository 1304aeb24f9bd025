//! vigil demo - watch a directory and print its events

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil::{Event, FileWatcher};

/// Watch a directory and print filesystem events until interrupted
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to watch
    path: PathBuf,

    /// Also watch all subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Force the generic (polling) backend
    #[arg(long)]
    generic: bool,

    /// Rescan interval of the generic backend, in milliseconds
    #[arg(long, default_value = "1000")]
    poll_interval: u64,

    /// Follow symbolic links while descending
    #[arg(long)]
    follow_symlinks: bool,

    /// Allow followed links to point outside the watched tree
    #[arg(long)]
    out_of_scope_links: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let watcher = if cli.generic {
        FileWatcher::new_generic_with_interval(Duration::from_millis(cli.poll_interval))?
    } else {
        FileWatcher::new()?
    };
    watcher.set_follow_symlinks(cli.follow_symlinks);
    watcher.set_allow_out_of_scope_links(cli.out_of_scope_links);

    watcher
        .add_watch(
            &cli.path,
            Arc::new(|event: &Event| match &event.old_filename {
                Some(old) => println!(
                    "{:>8}  {} -> {}",
                    event.action,
                    old.display(),
                    event.filename.display()
                ),
                None => println!("{:>8}  {}", event.action, event.filename.display()),
            }),
            cli.recursive,
        )
        .with_context(|| format!("could not watch {}", cli.path.display()))?;

    eprintln!("watching {} (press Ctrl-C to exit)", cli.path.display());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_signal.store(true, Ordering::SeqCst))
        .context("could not install the Ctrl-C handler")?;

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    eprintln!("bye");
    Ok(())
}
