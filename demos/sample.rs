//! Prints stack traces captured with every method.
//!
//! The local methods capture this process from a small recursion. The remote methods
//! capture a forked child that recurses through `level_1` to `level_5` and sleeps.

use std::fs::File;
use std::hint::black_box;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use stackwalk::{capture, CaptureMethod, CaptureOptions, Target};

#[derive(Debug, Parser)]
#[command(about = "Capture stack traces with every stackwalk method")]
struct CliArgs {
    /// How many frames of recursion to capture the local traces from.
    #[arg(long, default_value_t = 3)]
    depth: usize,

    /// The maximum number of frames per trace. Defaults to STACKWALK_MAX_DEPTH or 100.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Do not resolve symbols.
    #[arg(long)]
    no_symbols: bool,

    /// Skip the remote methods.
    #[arg(long)]
    local_only: bool,
}

fn main() {
    env_logger::init();
    let args = CliArgs::parse();

    let mut options = CaptureOptions::from_env().symbolicate(!args.no_symbols);
    if let Some(max_depth) = args.max_depth {
        options = options.max_depth(max_depth);
    }

    recurse(args.depth, &options);

    if !args.local_only {
        if let Err(e) = capture_child(&options) {
            eprintln!("Remote capture failed: {e}");
            std::process::exit(1);
        }
    }
}

#[inline(never)]
fn recurse(depth: usize, options: &CaptureOptions) {
    if depth == 0 {
        for method in CaptureMethod::LOCAL {
            print_capture(method, Target::SelfProcess, options);
        }
    } else {
        recurse(depth - 1, options);
    }
    black_box(depth);
}

fn print_capture(method: CaptureMethod, target: Target, options: &CaptureOptions) {
    match capture(method, target, options) {
        Ok(trace) => {
            println!(
                "{method}: {} frames, {:?}\n{trace}",
                trace.len(),
                trace.stop_reason()
            );
        }
        Err(e) => println!("{method}: {e}\n"),
    }
}

fn capture_child(options: &CaptureOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for both descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors were just created and are owned by exactly one File each.
    let (mut reader, writer) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    // SAFETY: the process is single-threaded, and the child only recurses, writes to
    // the pipe and sleeps.
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(reader);
            level_1(writer);
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            drop(writer);
            let mut ready = [0u8; 1];
            reader.read_exact(&mut ready)?;
            println!("Child {child} is ready");

            for method in CaptureMethod::REMOTE {
                print_capture(method, Target::Process(child.as_raw()), options);
            }

            kill(child, Signal::SIGKILL)?;
            waitpid(child, None)?;
            Ok(())
        }
    }
}

#[inline(never)]
fn level_1(ready: File) {
    level_2(ready);
    black_box(1);
}

#[inline(never)]
fn level_2(ready: File) {
    level_3(ready);
    black_box(2);
}

#[inline(never)]
fn level_3(ready: File) {
    level_4(ready);
    black_box(3);
}

#[inline(never)]
fn level_4(ready: File) {
    level_5(ready);
    black_box(4);
}

#[inline(never)]
fn level_5(mut ready: File) {
    let _ = ready.write_all(b"r");
    drop(ready);
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
