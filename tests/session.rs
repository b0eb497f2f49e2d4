use futures_util::future::join_all;
use rootbox::{
    errors::SessionError,
    events::{EventSubscription, StreamKind},
    rootfs::MARKER_FILE,
    session::cwd,
    Context, EventBus, SessionState, ShellSession, TerminalEvent,
};
use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;

/// Stands in for proot: drops its own options, keeps HOME inside the rootfs
const FAKE_PROOT: &str = r#"#!/bin/sh
ROOT=
while [ $# -gt 0 ]; do
    case "$1" in
        -r) ROOT="$2"; shift 2 ;;
        -b|-w) shift 2 ;;
        --*) shift ;;
        *) break ;;
    esac
done
export HOME="$ROOT$HOME"
exec "$@"
"#;

fn write_script(path: &Path, text: &str) -> PathBuf {
    fs::write(path, text).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// A context whose rootfs looks installed, running shells through `wrapper`
fn context(dir: &TempDir, wrapper: &str) -> Context {
    let mut context = Context::builder()
        .data_dir(&dir.path().join("data"))
        .cache_dir(&dir.path().join("cache"))
        .search_path("")
        .build()
        .unwrap();
    let installation = context.installation();
    fs::create_dir_all(installation.host_path("/bin")).unwrap();
    fs::create_dir_all(installation.guest_home()).unwrap();
    fs::create_dir_all(installation.host_path("/tmp")).unwrap();
    symlink("/bin/busybox", installation.host_path("/bin/sh")).unwrap();
    fs::write(installation.rootfs_dir().join(MARKER_FILE), "test\n").unwrap();

    context.session.wrapper = Some(write_script(&dir.path().join("proot"), wrapper));
    context.session.stop_grace = Duration::from_secs(5);
    context
}

/// Collect events until one matches, failing after ten seconds
async fn wait_for<F>(events: &mut EventSubscription, mut done: F) -> Vec<TerminalEvent>
where
    F: FnMut(&TerminalEvent) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.next().await {
            let matched = done(&event);
            seen.push(event);
            if matched {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out, events so far: {:?}", seen);
    seen
}

fn stdout_text(events: &[TerminalEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            TerminalEvent::Output {
                stream: StreamKind::Stdout,
                text,
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn echo_and_stop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let context = context(&dir, FAKE_PROOT);
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let session = ShellSession::new(&context, events);
    assert_eq!(session.state(), SessionState::NotStarted);
    session.execute_command("echo hello from the shell").await.unwrap();
    assert!(session.is_running());
    assert_eq!(session.state(), SessionState::Running);

    let mut output = String::new();
    wait_for(&mut sub, |event| {
        if let TerminalEvent::Output { text, .. } = event {
            output.push_str(text);
        }
        output.contains("hello from the shell\n")
    })
    .await;
    assert_eq!(session.history(), vec!["echo hello from the shell".to_string()]);

    session.stop().await.unwrap();
    let seen = wait_for(&mut sub, |event| matches!(event, TerminalEvent::Exit { .. })).await;
    assert!(seen.contains(&TerminalEvent::Exit { code: 0 }));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.is_running());
}

#[tokio::test]
async fn starts_in_persisted_directory() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let context = context(&dir, FAKE_PROOT);
    let store = cwd::CwdStore::new(&context.installation());
    fs::create_dir_all(store.file().parent().unwrap()).unwrap();
    fs::write(store.file(), "/tmp\n").unwrap();

    let events = EventBus::default();
    let mut sub = events.subscribe();
    let session = ShellSession::acquire(&context, events).await.unwrap();
    assert_eq!(session.current_directory(), "/tmp");

    // the fake wrapper doesn't chroot, so the guest /tmp is the host one
    session.execute_command("pwd").await.unwrap();
    let seen = wait_for(&mut sub, |event| {
        matches!(event, TerminalEvent::Output { text, .. } if text.contains("/tmp"))
    })
    .await;
    assert_eq!(stdout_text(&seen), "/tmp\n");
    session.stop().await.unwrap();
}

#[tokio::test]
async fn cd_survives_restart() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let context = context(&dir, FAKE_PROOT);
    let events = EventBus::default();
    let mut sub = events.subscribe();
    let session = ShellSession::acquire(&context, events).await.unwrap();
    assert_eq!(session.current_directory(), "/home/developer");

    session.execute_command("cd /tmp").await.unwrap();
    session.execute_command("echo moved").await.unwrap();
    wait_for(&mut sub, |event| {
        matches!(event, TerminalEvent::Output { text, .. } if text.contains("moved"))
    })
    .await;
    session.stop().await.unwrap();
    assert_eq!(session.current_directory(), "/tmp");

    session.start().await.unwrap();
    session.execute_command("pwd").await.unwrap();
    let seen = wait_for(&mut sub, |event| {
        matches!(event, TerminalEvent::Output { text, .. } if text.contains("/tmp"))
    })
    .await;
    assert!(stdout_text(&seen).ends_with("/tmp\n"));
    session.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_commands_do_not_interleave() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("stdin.log");
    let wrapper = format!("#!/bin/sh\nexec cat > {}\n", cwd::shell_quote(log.to_str().unwrap()));
    let context = context(&dir, &wrapper);
    let session = ShellSession::acquire(&context, EventBus::default()).await.unwrap();

    let commands: Vec<String> = (0..32)
        .map(|n| format!("echo {}", format!("{:02}", n).repeat(300)))
        .collect();
    let results = join_all(commands.iter().map(|c| session.execute_command(c))).await;
    assert!(results.iter().all(Result::is_ok));
    session.stop().await.unwrap();

    let text = fs::read_to_string(&log).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(cwd::source_line().trim_end()));
    let hook = cwd::hook_line();
    let mut received = Vec::new();
    while let Some(line) = lines.next() {
        if line == "exit" {
            break;
        }
        received.push(line.to_string());
        assert_eq!(lines.next(), Some(hook.trim_end()));
    }
    assert_eq!(received, commands);
    assert_eq!(session.history().len(), 32);
}

#[tokio::test]
async fn stop_kills_unresponsive_shell() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut context = context(&dir, "#!/bin/sh\nexec sleep 30\n");
    context.session.stop_grace = Duration::from_millis(200);
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let session = ShellSession::acquire(&context, events).await.unwrap();
    session.stop().await.unwrap();
    let seen = wait_for(&mut sub, |event| matches!(event, TerminalEvent::Exit { .. })).await;
    assert_eq!(seen.last(), Some(&TerminalEvent::Exit { code: -1 }));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.is_running());
}

#[tokio::test]
async fn stop_while_a_write_is_stuck() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut context = context(&dir, "#!/bin/sh\nexec sleep 30\n");
    context.session.stop_grace = Duration::from_millis(200);
    context.session.write_timeout = Duration::from_secs(60);
    let session = Arc::new(ShellSession::acquire(&context, EventBus::default()).await.unwrap());

    // far more than a pipe buffer, and nobody reads it
    let writer = {
        let session = session.clone();
        tokio::spawn(async move { session.execute_command(&"x".repeat(300_000)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), session.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(matches!(writer.await.unwrap(), Err(SessionError::IO(_))));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn stalled_write_times_out() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut context = context(&dir, "#!/bin/sh\nexec sleep 30\n");
    context.session.write_timeout = Duration::from_millis(300);
    let events = EventBus::default();
    let mut sub = events.subscribe();
    let session = ShellSession::acquire(&context, events).await.unwrap();

    match session.execute_command(&"x".repeat(300_000)).await {
        Err(SessionError::IO(err)) => assert_eq!(err.kind(), std::io::ErrorKind::TimedOut),
        other => panic!("unexpected result {:?}", other),
    }
    let seen = wait_for(&mut sub, |event| matches!(event, TerminalEvent::Exit { .. })).await;
    assert!(seen
        .iter()
        .any(|event| matches!(event, TerminalEvent::Error { .. })));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Crashed);
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn unexpected_exit_is_a_crash() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let context = context(&dir, "#!/bin/sh\nread line\nexit 3\n");
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let session = ShellSession::acquire(&context, events).await.unwrap();
    let seen = wait_for(&mut sub, |event| matches!(event, TerminalEvent::Exit { .. })).await;
    assert_eq!(seen.last(), Some(&TerminalEvent::Exit { code: 3 }));
    assert_eq!(session.state(), SessionState::Crashed);
    assert!(!session.is_running());
    // nothing left to stop
    session.stop().await.unwrap();
}

#[tokio::test]
async fn missing_wrapper() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let mut context = context(&dir, FAKE_PROOT);
    context.session.wrapper = None;
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let session = ShellSession::new(&context, events);
    match session.start().await {
        Err(SessionError::WrapperMissing(names)) => assert_eq!(names, "proot"),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(matches!(sub.try_next(), Some(TerminalEvent::Error { .. })));
    assert_eq!(session.state(), SessionState::NotStarted);
}

#[tokio::test]
async fn missing_rootfs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let context = context(&dir, FAKE_PROOT);
    fs::remove_file(context.installation().marker()).unwrap();

    let session = ShellSession::new(&context, EventBus::default());
    assert!(matches!(
        session.execute_command("true").await,
        Err(SessionError::RootfsMissing(_))
    ));
    assert!(session.history().is_empty());
    assert!(!session.is_running());
}
