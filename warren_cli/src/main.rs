use clap::{Parser, Subcommand};
use libc::c_void;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, fork};
use std::path::PathBuf;
use warren_core::classify::{FaultContext, crash_at, raise_crash_signal};
use warren_core::config::HarnessConfig;
use warren_core::coverage::{CoverageMap, WorkerContext};
use warren_core::forkserver::{ForkServer, Role};
use warren_core::shmem::SharedRegion;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a complete fork-server session against this binary itself,
    /// playing the fuzzer's role over pipe channels.
    Session {
        /// Number of continue tokens to send (= workers to spawn).
        #[clap(short, long, default_value_t = 16)]
        iterations: u32,
        /// Tell every n-th worker to classify its fault and crash.
        #[clap(long)]
        crash_every: Option<u32>,
    },
    /// Print the location hash of a string and seed.
    #[cfg(warren_test_fnv)]
    Fnv {
        input: String,
        #[clap(default_value_t = 0)]
        seed: u32,
    },
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            HarnessConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("warren.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                HarnessConfig::load_from_file(&default_config_path)?
            } else {
                HarnessConfig::default()
            }
        }
    };
    config.apply_env();

    match cli.command {
        Command::Session {
            iterations,
            crash_every,
        } => run_session(config, iterations, crash_every),
        #[cfg(warren_test_fnv)]
        Command::Fnv { input, seed } => {
            println!("{}", warren_core::location_hash(input.as_bytes(), seed));
            Ok(())
        }
    }
}

/// The instrumented "user code" each worker runs: walk a few locations,
/// then either finish cleanly or classify the directive as a crash and
/// terminate the way a fuzzer expects to see it.
fn demo_worker(mut ctx: WorkerContext, data_r: i32) -> ! {
    let mut directive = [0u8; 1];
    let n = unsafe { libc::read(data_r, directive.as_mut_ptr() as *mut c_void, 1) };
    if n != 1 {
        unsafe { libc::_exit(64) };
    }

    ctx.record_location("demo/walk.rb", 3);
    ctx.record_location("demo/walk.rb", 9);
    ctx.record_location("demo/walk.rb", 14);
    if directive[0] == b'C' {
        ctx.record_location("demo/walk.rb", 27);
        let fault = FaultContext::from_kind("DirectedFault");
        match crash_at(Some(&["DirectedFault"]), None, None, &fault) {
            Ok(true) => {
                let _ = raise_crash_signal(libc::SIGUSR2);
                unsafe { libc::_exit(65) };
            }
            _ => unsafe { libc::_exit(66) },
        }
    }
    unsafe { libc::_exit(0) };
}

fn run_session(
    config: HarnessConfig,
    iterations: u32,
    crash_every: Option<u32>,
) -> Result<(), anyhow::Error> {
    let region = SharedRegion::anonymous(config.map_size)?;
    let map = CoverageMap::new(region);
    let runtime_map = map.clone();

    let (ctl_r, ctl_w) = make_pipe()?;
    let (st_r, st_w) = make_pipe()?;
    let (data_r, data_w) = make_pipe()?;

    let runtime_pid = match unsafe { fork() }? {
        ForkResult::Child => {
            unsafe {
                libc::close(ctl_w);
                libc::close(st_r);
                libc::close(data_w);
            }
            let runtime_config = HarnessConfig {
                control_fd: ctl_r,
                status_fd: st_w,
                ..config
            };
            let mut server = ForkServer::with_map(runtime_config, runtime_map);
            match server.start() {
                Ok(Role::Worker(ctx)) => demo_worker(ctx, data_r),
                Ok(Role::Controller(_)) => unsafe { libc::_exit(0) },
                Err(e) => {
                    eprintln!("fork server failed: {e}");
                    unsafe { libc::_exit(1) };
                }
            }
        }
        ForkResult::Parent { child } => child,
    };

    unsafe {
        libc::close(ctl_r);
        libc::close(st_w);
        libc::close(data_r);
    }

    let handshake = read_word(st_r)?;
    println!("Fork server announced itself (handshake word {handshake:#010x})");

    let mut crashes = 0u32;
    for i in 0..iterations {
        let crash_now = crash_every.is_some_and(|n| n > 0 && (i + 1) % n == 0);
        let directive = if crash_now { b'C' } else { b'R' };
        write_all(data_w, &[directive])?;
        write_all(ctl_w, &0u32.to_ne_bytes())?;

        let pid = read_word(st_r)?;
        let status = read_word(st_r)?;
        if status & 0x7f != 0 {
            crashes += 1;
        }
        println!("iter {i:>4}: worker {pid} {}", describe_status(status));
    }

    unsafe {
        libc::close(ctl_w);
        libc::close(data_w);
    }
    waitpid(runtime_pid, None)?;
    unsafe { libc::close(st_r) };

    println!(
        "\nSession done: {iterations} iterations, {crashes} crashes, {} of {} coverage buckets hit",
        map.populated_buckets(),
        map.len()
    );
    Ok(())
}

fn describe_status(word: u32) -> String {
    if word & 0x7f == 0x7f {
        format!("stopped by signal {}", (word >> 8) & 0xff)
    } else if word & 0x7f != 0 {
        let core = if word & 0x80 != 0 { " (core dumped)" } else { "" };
        format!("killed by signal {}{core}", word & 0x7f)
    } else {
        format!("exited with code {}", (word >> 8) & 0xff)
    }
}

fn make_pipe() -> Result<(i32, i32), anyhow::Error> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(anyhow::anyhow!(
            "failed to create pipe: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok((fds[0], fds[1]))
}

fn write_all(fd: i32, bytes: &[u8]) -> Result<(), anyhow::Error> {
    let mut written = 0;
    while written < bytes.len() {
        let n = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const c_void,
                bytes.len() - written,
            )
        };
        if n <= 0 {
            return Err(anyhow::anyhow!(
                "write to session pipe failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        written += n as usize;
    }
    Ok(())
}

fn read_word(fd: i32) -> Result<u32, anyhow::Error> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut c_void,
                buf.len() - filled,
            )
        };
        if n <= 0 {
            return Err(anyhow::anyhow!(
                "session pipe closed early after {filled} bytes"
            ));
        }
        filled += n as usize;
    }
    Ok(u32::from_ne_bytes(buf))
}
