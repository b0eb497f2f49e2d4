//! One long-lived interactive shell confined to the rootfs
//!
//! The shell runs under a userspace isolation wrapper. Its stdin is shared by
//! every caller through one async mutex, so command lines never interleave.
//! Its stdout and stderr are pumped onto the [EventBus] as they arrive, and
//! a watcher task owns the process and notices when it exits.

pub mod cwd;
pub mod decode;
pub mod history;

use self::{cwd::CwdStore, decode::Utf8Decoder, history::CommandHistory};
use crate::{
    backend::find_executable,
    context::{Context, SessionSettings},
    errors::SessionError,
    events::{EventBus, EventSubscription, StreamKind, TerminalEvent},
    rootfs::RootfsInstallation,
};
use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::{self, JoinHandle},
    time,
};

const READ_CHUNK: usize = 4096;

/// How long `stop()` lets the pumps drain after the shell exits
const PUMP_DRAIN: Duration = Duration::from_millis(500);

/// Lifecycle of a [ShellSession]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The shell exited without being asked to
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its tasks
#[derive(Debug)]
struct Shared {
    events: EventBus,
    alive: AtomicBool,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: Mutex<Option<mpsc::Sender<()>>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        log::debug!("shell session state: {}", state);
        *lock(&self.state) = state;
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Ask the watcher to kill the process, without waiting
    fn request_kill(&self) {
        if let Some(kill) = lock(&self.kill).as_ref() {
            let _ = kill.try_send(());
        }
    }
}

/// Tasks belonging to one running shell process
#[derive(Debug)]
struct Running {
    watcher: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        // the watcher owns the child, which is killed when dropped
        self.watcher.abort();
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// An interactive shell inside the rootfs
#[derive(Debug)]
pub struct ShellSession {
    settings: SessionSettings,
    search_path: Option<OsString>,
    installation: RootfsInstallation,
    cwd: CwdStore,
    shared: Arc<Shared>,
    history: Mutex<CommandHistory>,
    initial_dir: Mutex<String>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ShellSession {
    /// A session that hasn't started its shell yet
    pub fn new(context: &Context, events: EventBus) -> Self {
        let installation = context.installation();
        let cwd = CwdStore::new(&installation);
        ShellSession {
            settings: context.session.clone(),
            search_path: context.executable_search_path(),
            initial_dir: Mutex::new(cwd.guest_home().to_string()),
            history: Mutex::new(CommandHistory::new(context.session.history_limit)),
            shared: Arc::new(Shared {
                events,
                alive: AtomicBool::new(false),
                state: Mutex::new(SessionState::NotStarted),
                writer: tokio::sync::Mutex::new(None),
                kill: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
            installation,
            cwd,
        }
    }

    /// A session with its shell already started
    pub async fn acquire(context: &Context, events: EventBus) -> Result<Self, SessionError> {
        let session = ShellSession::new(context, events);
        session.start().await?;
        Ok(session)
    }

    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Subscribe to output, status and exit events from now on
    pub fn observe_events(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    /// Recent commands, oldest first
    pub fn history(&self) -> Vec<String> {
        lock(&self.history).entries()
    }

    /// The shell's last persisted working directory
    ///
    /// Falls back to the directory the session started in.
    pub fn current_directory(&self) -> String {
        match self.cwd.load() {
            Some(dir) => dir,
            None => lock(&self.initial_dir).clone(),
        }
    }

    fn fail(&self, err: SessionError) -> SessionError {
        self.shared
            .events
            .emit(TerminalEvent::failure("shell session", &err));
        err
    }

    fn resolve_wrapper(&self) -> Result<PathBuf, SessionError> {
        if let Some(path) = &self.settings.wrapper {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(SessionError::WrapperMissing(path.display().to_string()))
            };
        }
        self.settings
            .wrapper_names
            .iter()
            .find_map(|name| find_executable(name, self.search_path.as_deref()))
            .ok_or_else(|| SessionError::WrapperMissing(self.settings.wrapper_names.join(", ")))
    }

    /// Start the shell, unless it's already running
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if running.is_some() && self.is_running() {
            return Ok(());
        }
        if let Some(previous) = running.take() {
            // exited on its own, let its tasks finish up
            finish(previous).await;
        }

        let wrapper = self.resolve_wrapper().map_err(|err| self.fail(err))?;
        if !self.installation.is_installed() {
            return Err(self.fail(SessionError::RootfsMissing(
                self.installation.rootfs_dir().to_path_buf(),
            )));
        }
        self.shared.set_state(SessionState::Starting);

        let initial_dir = self.cwd.initial_dir();
        *lock(&self.initial_dir) = initial_dir.clone();
        match self.spawn(&wrapper, &initial_dir).await {
            Ok(handle) => {
                *running = Some(handle);
                self.shared.events.emit(TerminalEvent::status(format!(
                    "shell started in {}",
                    initial_dir
                )));
                Ok(())
            }
            Err(err) => {
                self.shared.alive.store(false, Ordering::SeqCst);
                self.shared.writer.lock().await.take();
                self.shared.set_state(SessionState::Crashed);
                Err(self.fail(err))
            }
        }
    }

    async fn spawn(&self, wrapper: &Path, initial_dir: &str) -> Result<Running, SessionError> {
        self.cwd.write_snippet(initial_dir)?;

        let settings = &self.settings;
        let mut command = Command::new(wrapper);
        command
            .arg("--kill-on-exit")
            .arg("--link2symlink")
            .arg("-r")
            .arg(self.installation.rootfs_dir())
            .args(&["-b", "/dev", "-b", "/proc", "-b", "/sys"])
            .arg("-w")
            .arg(initial_dir)
            .arg(&settings.shell)
            .arg("-s")
            .env_clear()
            .env("HOME", self.cwd.guest_home())
            .env("USER", &settings.user)
            .env("SHELL", &settings.shell)
            .env("TERM", &settings.term)
            .env("PATH", &settings.path)
            .env("LANG", &settings.lang)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        log::debug!("spawning shell: {:?}", command);
        let mut child = command.spawn()?;

        let stdio = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (mut stdin, stdout, stderr) = match stdio {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(SessionError::IO(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "shell stdio was not captured",
                )))
            }
        };

        // first thing the shell reads
        stdin.write_all(cwd::source_line().as_bytes()).await?;
        stdin.flush().await?;

        let (kill_tx, kill_rx) = mpsc::channel(1);
        *lock(&self.shared.kill) = Some(kill_tx);
        *self.shared.writer.lock().await = Some(stdin);
        self.shared.alive.store(true, Ordering::SeqCst);
        self.shared.set_state(SessionState::Running);

        let pumps = vec![
            task::spawn(pump(stdout, StreamKind::Stdout, self.shared.clone())),
            task::spawn(pump(stderr, StreamKind::Stderr, self.shared.clone())),
        ];
        let watcher = task::spawn(watch(child, kill_rx, self.shared.clone()));
        Ok(Running { watcher, pumps })
    }

    /// Send one command line to the shell, starting it first if needed
    pub async fn execute_command(&self, command: &str) -> Result<(), SessionError> {
        if !self.is_running() {
            self.start().await?;
        }
        let mut line = String::with_capacity(command.len() + 32);
        line.push_str(command.trim_end_matches('\n'));
        line.push('\n');
        line.push_str(&cwd::hook_line());
        self.write(line.as_bytes()).await?;
        lock(&self.history).push(command);
        Ok(())
    }

    /// Write to the shell's stdin, as one unit
    ///
    /// Waits a bounded time for the input stream to become available. A
    /// write that stalls for longer than `write_timeout` tears the shell down.
    async fn write(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let write_timeout = self.settings.write_timeout;
        let mut attempts = 0;
        loop {
            let mut writer = match time::timeout(write_timeout, self.shared.writer.lock()).await {
                Ok(writer) => writer,
                Err(_) => {
                    self.shared.request_kill();
                    return Err(self.fail(SessionError::IO(stalled_input())));
                }
            };
            if let Some(stdin) = writer.as_mut() {
                let result = match time::timeout(write_timeout, write_flush(stdin, bytes)).await {
                    Ok(result) => result,
                    Err(_) => Err(stalled_input()),
                };
                return match result {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        writer.take();
                        drop(writer);
                        self.shared.request_kill();
                        Err(self.fail(SessionError::IO(err)))
                    }
                };
            }
            drop(writer);
            if !self.is_running() && self.state() != SessionState::Starting {
                return Err(self.fail(SessionError::NotRunning));
            }
            attempts += 1;
            if attempts >= self.settings.input_wait_attempts {
                return Err(self.fail(SessionError::InputNotReady { attempts }));
            }
            time::sleep(self.settings.input_wait_interval).await;
        }
    }

    /// Ask the shell to exit, killing it if it doesn't within the grace period
    pub async fn stop(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        let mut handle = match running.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if self.is_running() {
            self.shared.set_state(SessionState::Stopping);
        }

        let grace = self.settings.stop_grace;
        let asked = match time::timeout(grace, self.shared.writer.lock()).await {
            Ok(mut writer) => {
                let asked = match writer.as_mut() {
                    Some(stdin) => matches!(
                        time::timeout(grace, write_flush(stdin, b"exit\n")).await,
                        Ok(Ok(()))
                    ),
                    None => false,
                };
                // end of input also ends a shell reading commands from stdin
                writer.take();
                asked
            }
            // another writer is stuck on a shell that stopped reading
            Err(_) => false,
        };

        let exited = asked && time::timeout(grace, &mut handle.watcher).await.is_ok();
        if !exited {
            log::info!("shell did not exit within {:?}, killing", grace);
            self.shared.request_kill();
            if let Err(err) = (&mut handle.watcher).await {
                log::warn!("shell watcher failed: {}", err);
            }
        }
        finish(handle).await;
        self.shared.events.emit(TerminalEvent::status("shell stopped"));
        Ok(())
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.shared.request_kill();
        // dropping the handle aborts the tasks and kills the child
        self.running.get_mut().take();
    }
}

/// Give the pumps a moment to deliver the last output, then drop the handle
async fn finish(mut handle: Running) {
    for pump in handle.pumps.iter_mut() {
        let _ = time::timeout(PUMP_DRAIN, pump).await;
    }
}

async fn write_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

fn stalled_input() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "shell stopped reading its input",
    )
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, stream: StreamKind, shared: Arc<Shared>) {
    let mut decoder = Utf8Decoder::default();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(size) => {
                let text = decoder.decode(&buffer[..size]);
                if !text.is_empty() {
                    shared.events.emit(TerminalEvent::Output { stream, text });
                }
            }
            Err(err) => {
                shared.events.emit(TerminalEvent::failure(
                    format!("reading shell {:?} failed", stream),
                    &err,
                ));
                shared.request_kill();
                break;
            }
        }
    }
    let text = decoder.finish();
    if !text.is_empty() {
        shared.events.emit(TerminalEvent::Output { stream, text });
    }
}

async fn watch(mut child: Child, mut kill_rx: mpsc::Receiver<()>, shared: Arc<Shared>) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(()) = kill_rx.recv() => {
            if let Err(err) = child.start_kill() {
                log::warn!("failed to kill shell: {}", err);
            }
            child.wait().await
        }
    };
    shared.alive.store(false, Ordering::SeqCst);
    shared.writer.lock().await.take();
    lock(&shared.kill).take();

    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            log::error!("waiting for shell failed: {}", err);
            -1
        }
    };
    let next = if shared.state() == SessionState::Stopping {
        SessionState::Stopped
    } else {
        SessionState::Crashed
    };
    shared.set_state(next);
    shared.events.emit(TerminalEvent::Exit { code });
}
