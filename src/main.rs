use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use em1140::sync;
use em1140::v6fs::{self, TreeEntry, V6FileSystem};
use em1140::Emulator;
use log::debug;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use termion::raw::IntoRawMode;

#[derive(Parser)]
#[command(name = "myunix", about = "PDP-11/40 emulator booting Version 6 Unix from an RK05 image")]
struct Args {
    /// RK05 disk image
    #[arg(long, default_value = "rk0.img")]
    image: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the machine on this terminal (default). Ctrl-] leaves it.
    Run {
        /// answer the boot prompt with `unix` and run `stty -lcase`
        #[arg(long)]
        start: bool,
        /// guest directory to synchronize when Ctrl-\ is pressed
        #[arg(long, requires = "sync_local")]
        sync_guest: Option<String>,
        /// host directory paired with --sync-guest
        #[arg(long, requires = "sync_guest")]
        sync_local: Option<PathBuf>,
    },
    /// Extract a guest directory into a fresh host directory
    Extract {
        dst: PathBuf,
        #[arg(default_value = "/")]
        src: String,
    },
    /// List a guest tree with sizes, flags and V6 checksums
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a host file into the filesystem image
    Upload { src: PathBuf, dst: String },
    /// Create a guest directory
    Mkdir { path: String },
    /// Checksum a host file the way the guest's `sum` does
    Sum { file: PathBuf },
    /// Count the blocks on the free chain
    Freeblocks,
    /// Synchronize a guest directory with a host directory
    Sync { unix_dir: String, local_dir: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args
        .command
        .unwrap_or(Command::Run { start: false, sync_guest: None, sync_local: None })
    {
        Command::Run { start, sync_guest, sync_local } => {
            run(&args.image, start, sync_guest.zip(sync_local))
        }
        Command::Extract { dst, src } => {
            let fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            let (entries, size, blocks) = fs.extract_dir(&dst, &src)?;
            print_tree(&entries);
            println!("Total size: {}, block size: {} ({})", size, blocks * 512, blocks);
            Ok(())
        }
        Command::Tree { path } => {
            let fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            let node = fs
                .path_i_node(&path)?
                .with_context(|| format!("{} not found in filesystem", path))?;
            let mut entries = Vec::new();
            let (size, blocks) = fs.tree(node.inum, None, 0, &mut entries)?;
            print_tree(&entries);
            println!("Total size: {}, block size: {} ({})", size, blocks * 512, blocks);
            Ok(())
        }
        Command::Upload { src, dst } => {
            let mut fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            let node = fs.upload_file(&src, &dst)?;
            std::fs::write(&args.image, &fs.disk).context("writing disk image")?;
            println!("uploaded {} as inode {}", src.display(), node.inum);
            Ok(())
        }
        Command::Mkdir { path } => {
            let mut fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            fs.mkdir(&path)?;
            std::fs::write(&args.image, &fs.disk).context("writing disk image")?;
            Ok(())
        }
        Command::Sum { file } => {
            let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("{}", v6fs::sum_file(&data));
            Ok(())
        }
        Command::Freeblocks => {
            let fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            let n = fs.count_free_blocks()?;
            println!("Free blocks: {}", n);
            println!("Free blocks size: {}", n * 512);
            Ok(())
        }
        Command::Sync { unix_dir, local_dir } => {
            let mut fs = V6FileSystem::open(&args.image).context("reading disk image")?;
            let cnt = sync::sync_dirs(&mut fs, &unix_dir, &local_dir, None)?;
            std::fs::write(&args.image, &fs.disk).context("writing disk image")?;
            println!("{} files and directories synced", cnt);
            Ok(())
        }
    }
}

fn print_tree(entries: &[TreeEntry]) {
    for e in entries {
        let name = format!("{}{}", e.name, if e.is_dir { "/" } else { " " });
        println!(
            "{:indent$}{:<15}\t{}\t{}\tsum={}\t{}\t{:x}",
            "",
            name,
            e.size,
            e.flags,
            e.sum,
            e.nlinks,
            e.modtime,
            indent = e.depth
        );
    }
}

fn run(image: &PathBuf, start: bool, sync_pair: Option<(String, PathBuf)>) -> Result<()> {
    let mut em = Emulator::load(image).context("loading disk image")?;
    let term = em.terminal();
    let stop = em.stop_handle();
    let ips = em.ips_handle();
    let disk = em.disk();
    let syncing = Arc::new(AtomicBool::new(false));
    if start {
        term.start_routine();
    }
    let cpu = thread::spawn(move || em.run());

    let mut stdin = termion::async_stdin().bytes();
    let mut stdout = std::io::stdout().into_raw_mode().context("entering raw mode")?;
    let mut last_ips = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        while let Some(Ok(b)) = stdin.next() {
            match b {
                0x1D => {
                    // Ctrl-]: leave the machine
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
                0x1C => {
                    // Ctrl-\: synchronize the configured directory pair
                    if let Some((guest, local)) = &sync_pair {
                        if !syncing.swap(true, Ordering::SeqCst) {
                            let disk = Arc::clone(&disk);
                            let term = term.clone();
                            let guest = guest.clone();
                            let local = local.clone();
                            let syncing = Arc::clone(&syncing);
                            thread::spawn(move || {
                                if let Err(e) = sync::sync_disk(&disk, &guest, &local, &term) {
                                    log::warn!("sync failed: {}", e);
                                }
                                syncing.store(false, Ordering::SeqCst);
                            });
                        }
                    }
                }
                b'\r' => term.read_key_press(b'\n'),
                b => term.read_key_press(b),
            }
        }
        let mut wrote = false;
        while let Some(c) = term.pull_output() {
            if c == b'\n' {
                stdout.write_all(b"\r\n")?;
            } else {
                stdout.write_all(&[c])?;
            }
            wrote = true;
        }
        if wrote {
            stdout.flush()?;
        }
        if last_ips.elapsed() >= Duration::from_secs(1) {
            debug!("{:.2} MIPS", ips.swap(0, Ordering::Relaxed) as f64 / 1e6);
            last_ips = Instant::now();
        }
        thread::sleep(Duration::from_millis(1));
    }
    cpu.join().ok();
    Ok(())
}
