use libc::c_void;
use log::{debug, trace, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use thiserror::Error;

use crate::config::HarnessConfig;
use crate::coverage::{CoverageMap, WorkerContext};
use crate::shmem::{SharedRegion, ShmemError};

/// Fatal session failures. Worker crashes are not here: a crashed worker is
/// an expected outcome reported through the status channel, not an error of
/// the controller.
#[derive(Error, Debug)]
pub enum ForkServerError {
    #[error("coverage map setup failed: {0}")]
    Shmem(#[from] ShmemError),
    #[error("the fork server was already started in this process")]
    AlreadyStarted,
    #[error("fork-server handshake write failed: {0}")]
    Handshake(std::io::Error),
    #[error("failed to read continue token from control channel: {0}")]
    TokenRead(std::io::Error),
    #[error("short read on control channel: got {0} of 4 token bytes")]
    TokenShortRead(usize),
    #[error("failed to write {what} to status channel: {source}")]
    StatusWrite {
        what: &'static str,
        source: std::io::Error,
    },
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(nix::Error),
    #[error("failed to wait for worker {pid}: {source}")]
    WaitFailed { pid: i32, source: nix::Error },
    #[error("failed to resume stopped worker {pid}: {source}")]
    ResumeFailed { pid: i32, source: nix::Error },
    #[error("failed to adjust SIGCHLD disposition: {0}")]
    SigChld(nix::Error),
}

/// Controller states. One loop iteration walks
/// `AwaitToken → Spawning → WorkerRunning → Reporting` and back;
/// `Shutdown` is terminal and reached when the control channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AwaitToken,
    Spawning,
    WorkerRunning,
    Reporting,
    Shutdown,
}

/// Counters for one fork-server session, kept by the controller.
/// Every reported iteration is exactly one of the three outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub iterations: u64,
    pub clean_exits: u64,
    pub signaled: u64,
    pub stopped: u64,
}

impl SessionSummary {
    fn note(&mut self, status: &WaitStatus) {
        self.iterations += 1;
        match status {
            WaitStatus::Exited(..) => self.clean_exits += 1,
            WaitStatus::Signaled(..) => self.signaled += 1,
            WaitStatus::Stopped(..) => self.stopped += 1,
            _ => {}
        }
    }
}

/// What [`ForkServer::start`] turned the calling process into.
pub enum Role {
    /// A freshly spawned worker (or the sole process, when no fuzzer is
    /// driving). Run the instrumented user code with this context, then
    /// terminate.
    Worker(WorkerContext),
    /// The controller, after its session ended: the control channel closed
    /// and every spawned worker has been reported.
    Controller(SessionSummary),
}

/// The fork-server controller.
///
/// Construction attaches the coverage bitmap (`Init`); [`ForkServer::start`]
/// performs the handshake and then drives the token → fork → wait → report
/// loop until the driving fuzzer closes the control channel. Exactly one
/// worker is alive at a time; each continue token produces exactly one
/// status report; nothing is ever retried, since retry policy belongs to
/// the fuzzer.
pub struct ForkServer {
    config: HarnessConfig,
    map: CoverageMap,
    state: SessionState,
    summary: SessionSummary,
    started: bool,
    stopped_worker: Option<Pid>,
    prev_sigchld: Option<SigHandler>,
}

impl ForkServer {
    /// Attaches the coverage bitmap and prepares the controller.
    ///
    /// The segment id is taken from the configured environment variable;
    /// when the variable is absent the process is running without a fuzzer
    /// and an anonymous shared region of the same size stands in, so
    /// instrumentation keeps working. Any other attach failure is fatal.
    pub fn new(config: HarnessConfig) -> Result<Self, ForkServerError> {
        let region = match SharedRegion::attach_from_env(&config.shm_env_var, config.map_size) {
            Ok(region) => region,
            Err(ShmemError::MissingEnv(var)) => {
                warn!("`{var}` not set; using a private coverage map");
                SharedRegion::anonymous(config.map_size)?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::with_map(config, CoverageMap::new(region)))
    }

    /// Builds the controller over an externally supplied map handle.
    ///
    /// The region must have been created before any fork, in the process
    /// that will read the coverage.
    pub fn with_map(config: HarnessConfig, map: CoverageMap) -> Self {
        Self {
            config,
            map,
            state: SessionState::Init,
            summary: SessionSummary::default(),
            started: false,
            stopped_worker: None,
            prev_sigchld: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn map(&self) -> &CoverageMap {
        &self.map
    }

    /// Runs the fork-server session.
    ///
    /// Returns [`Role::Worker`] in every forked child, and immediately in
    /// the whole process when the status descriptor does not exist, i.e.
    /// when no fuzzer is driving. Returns [`Role::Controller`] in the
    /// parent once the control channel reaches end-of-stream. Every other
    /// exit from this function is a fatal session error.
    pub fn start(&mut self) -> Result<Role, ForkServerError> {
        if self.started {
            return Err(ForkServerError::AlreadyStarted);
        }
        self.started = true;

        // Handshake: announce fork-server support with a fixed status word.
        // EBADF means the fuzzer-side descriptors were never set up, which
        // is how a plain (non-fuzzed) run of the program looks.
        match write_exact(self.config.status_fd, &[0u8; 4]) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                debug!("status channel absent; running standalone");
                self.transition(SessionState::Shutdown);
                return Ok(Role::Worker(self.worker_context()));
            }
            Err(e) => return Err(ForkServerError::Handshake(e)),
        }

        // The controller owns child reaping for the session; a user-installed
        // SIGCHLD handler would race waitpid. Workers get the original
        // disposition back.
        let prev =
            unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map_err(ForkServerError::SigChld)?;
        self.prev_sigchld = Some(prev);

        loop {
            self.transition(SessionState::AwaitToken);
            let token = match self.read_token()? {
                Some(token) => token,
                None => {
                    self.transition(SessionState::Shutdown);
                    self.restore_sigchld()?;
                    debug!("control channel closed; session over: {:?}", self.summary);
                    return Ok(Role::Controller(self.summary.clone()));
                }
            };

            // A stopped worker the fuzzer decided to kill (timeout) must be
            // reaped before a fresh one is forked; the token carries that
            // decision.
            if let Some(pid) = self.stopped_worker {
                if token != 0 {
                    trace!("reaping killed worker {pid}");
                    waitpid(pid, None).map_err(|e| ForkServerError::WaitFailed {
                        pid: pid.as_raw(),
                        source: e,
                    })?;
                    self.stopped_worker = None;
                }
            }

            let worker_pid = match self.stopped_worker.take() {
                Some(pid) => {
                    // Persistent worker is alive but stopped; resume it
                    // instead of forking.
                    signal::kill(pid, Signal::SIGCONT).map_err(|e| {
                        ForkServerError::ResumeFailed {
                            pid: pid.as_raw(),
                            source: e,
                        }
                    })?;
                    pid
                }
                None => {
                    self.transition(SessionState::Spawning);
                    match unsafe { fork() }.map_err(ForkServerError::SpawnFailed)? {
                        ForkResult::Child => {
                            self.restore_sigchld()?;
                            // The channels belong to the controller.
                            unsafe {
                                libc::close(self.config.control_fd);
                                libc::close(self.config.status_fd);
                            }
                            return Ok(Role::Worker(self.worker_context()));
                        }
                        ForkResult::Parent { child } => child,
                    }
                }
            };

            self.transition(SessionState::WorkerRunning);
            self.write_status_word("worker pid", worker_pid.as_raw() as u32)?;

            let wait_flags = self.config.persistent.then_some(WaitPidFlag::WUNTRACED);
            let status = waitpid(worker_pid, wait_flags).map_err(|e| {
                ForkServerError::WaitFailed {
                    pid: worker_pid.as_raw(),
                    source: e,
                }
            })?;
            if let WaitStatus::Stopped(pid, _) = status {
                // Persistent mode: the worker parked itself after one run.
                self.stopped_worker = Some(pid);
            }

            self.transition(SessionState::Reporting);
            self.write_status_word("worker status", encode_wait_status(&status))?;
            self.summary.note(&status);
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext::new(self.map.clone(), self.config.edge_seed)
    }

    fn transition(&mut self, next: SessionState) {
        trace!("fork server: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    fn restore_sigchld(&mut self) -> Result<(), ForkServerError> {
        if let Some(prev) = self.prev_sigchld.take() {
            unsafe { signal::signal(Signal::SIGCHLD, prev) }.map_err(ForkServerError::SigChld)?;
        }
        Ok(())
    }

    /// Blocking 4-byte read from the control channel. `Ok(None)` is
    /// end-of-stream before any token byte; a mid-token end-of-stream is a
    /// protocol violation.
    fn read_token(&self) -> Result<Option<u32>, ForkServerError> {
        let mut buf = [0u8; 4];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = unsafe {
                libc::read(
                    self.config.control_fd,
                    buf[filled..].as_mut_ptr() as *mut c_void,
                    buf.len() - filled,
                )
            };
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(ForkServerError::TokenShortRead(filled))
                };
            }
            if n < 0 {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ForkServerError::TokenRead(e));
            }
            filled += n as usize;
        }
        Ok(Some(u32::from_ne_bytes(buf)))
    }

    fn write_status_word(&self, what: &'static str, word: u32) -> Result<(), ForkServerError> {
        write_exact(self.config.status_fd, &word.to_ne_bytes())
            .map_err(|source| ForkServerError::StatusWrite { what, source })
    }
}

/// Packs a wait outcome into the 4-byte status word the fuzzer expects:
/// the raw Unix wait-status layout (exit code in bits 8..16, termination
/// signal in the low 7 bits with 0x80 flagging a core dump, stop signal in
/// bits 8..16 over the 0x7f stop marker).
fn encode_wait_status(status: &WaitStatus) -> u32 {
    match *status {
        WaitStatus::Exited(_, code) => ((code as u32) & 0xff) << 8,
        WaitStatus::Signaled(_, sig, core_dumped) => {
            let word = (sig as i32 as u32) & 0x7f;
            if core_dumped { word | 0x80 } else { word }
        }
        WaitStatus::Stopped(_, sig) => (((sig as i32 as u32) & 0xff) << 8) | 0x7f,
        // Remaining variants need ptrace or WCONTINUED, which the
        // controller never requests.
        _ => 0,
    }
}

fn write_exact(fd: i32, bytes: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < bytes.len() {
        let n = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const c_void,
                bytes.len() - written,
            )
        };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "zero-length write on status channel",
            ));
        }
        written += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HarnessConfig {
        HarnessConfig {
            // Descriptors nothing in a test process has open: the handshake
            // must fail with EBADF, exactly like a run without a fuzzer.
            control_fd: 977,
            status_fd: 978,
            shm_env_var: "WARREN_TEST_SURELY_UNSET_SHM_ID".to_string(),
            map_size: 4096,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn exit_status_word_carries_the_exit_code() {
        let pid = Pid::from_raw(123);
        assert_eq!(encode_wait_status(&WaitStatus::Exited(pid, 0)), 0);
        assert_eq!(encode_wait_status(&WaitStatus::Exited(pid, 3)), 0x0300);
        assert_eq!(encode_wait_status(&WaitStatus::Exited(pid, 255)), 0xFF00);
    }

    #[test]
    fn signal_status_word_carries_the_signal_number() {
        let pid = Pid::from_raw(123);
        assert_eq!(
            encode_wait_status(&WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            9
        );
        assert_eq!(
            encode_wait_status(&WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            11 | 0x80
        );
    }

    #[test]
    fn stop_status_word_uses_the_stop_marker() {
        let pid = Pid::from_raw(123);
        assert_eq!(
            encode_wait_status(&WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            ((libc::SIGSTOP as u32) << 8) | 0x7f
        );
    }

    #[test]
    fn absent_status_channel_means_standalone_worker() {
        let mut server = ForkServer::new(test_config()).expect("setup should succeed");
        assert_eq!(server.state(), SessionState::Init);
        match server.start().expect("standalone start should succeed") {
            Role::Worker(mut ctx) => {
                // Instrumentation still works against the private map.
                ctx.record_edge(1);
                assert_eq!(ctx.map().populated_buckets(), 1);
            }
            Role::Controller(_) => panic!("no fuzzer is driving; expected a worker role"),
        }
        assert_eq!(server.state(), SessionState::Shutdown);
    }

    #[test]
    fn a_server_starts_only_once() {
        let mut server = ForkServer::new(test_config()).expect("setup should succeed");
        let _ = server.start().expect("first start should succeed");
        match server.start() {
            Err(ForkServerError::AlreadyStarted) => {}
            other => panic!("expected AlreadyStarted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_shm_env_falls_back_to_a_private_map() {
        let server = ForkServer::new(test_config()).expect("setup should succeed");
        assert_eq!(server.map().len(), 4096);
        assert_eq!(server.map().populated_buckets(), 0);
    }
}
