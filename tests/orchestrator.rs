use rootbox::{
    errors::OrchestratorError,
    orchestrator::{AliasOrigin, Guest},
    rootfs::MARKER_FILE,
    Backend, Context, EventBus, Orchestrator, OrchestratorState, ServiceStatus, TerminalEvent,
};
use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use url::Url;

/// Lists two installed distros, can't install anything, and logs in by
/// running the command on the host
const FAKE_DISTRO_TOOL: &str = r#"#!/bin/sh
case "$1" in
    list)
        printf '  Alias: debian\n  Installed: yes\n\n  Alias: ubuntu-lts\n  Installed: yes\n\n  Alias: alpine\n  Installed: no\n'
        ;;
    install)
        echo "no network" >&2
        exit 1
        ;;
    login)
        shift 2
        [ "$1" = "--" ] && shift
        exec "$@"
        ;;
esac
"#;

/// Knows about a distro but has none installed; remembers any install
const EMPTY_DISTRO_TOOL: &str = r#"#!/bin/sh
case "$1" in
    list)
        printf '  Alias: ubuntu-lts\n  Installed: no\n'
        ;;
    install)
        touch "$(dirname "$0")/installed"
        ;;
esac
"#;

/// A container engine with nothing local and no registry access that can
/// still build, logging every call and running `exec` on the host
const FAKE_ENGINE: &str = r#"#!/bin/sh
echo "$*" >> "$(dirname "$0")/engine.log"
case "$1" in
    image|container)
        exit 1
        ;;
    pull)
        echo "registry unreachable" >&2
        exit 1
        ;;
    build)
        [ -f "$4/Dockerfile" ]
        ;;
    run|start)
        echo 0123456789ab
        ;;
    exec)
        shift 3
        exec "$@"
        ;;
esac
"#;

/// Answers every request with `status`, counting them
async fn health_server(status: u16) -> (Url, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (url, hits)
}

fn context(dir: &TempDir, search_path: &Path) -> Context {
    let mut context = Context::builder()
        .data_dir(&dir.path().join("data"))
        .cache_dir(&dir.path().join("cache"))
        .search_path(search_path.as_os_str())
        .build()
        .unwrap();
    context.backend.control_script = dir
        .path()
        .join("guest-home")
        .join("service.sh")
        .to_str()
        .unwrap()
        .to_string();
    context.backend.service_command = "sleep 30".into();
    context.health.attempts = 3;
    context.health.interval = Duration::from_millis(50);
    context.health.timeout = Duration::from_secs(2);
    context
}

/// Put a fake host tool on an otherwise empty search path
fn fake_tool(dir: &TempDir, name: &str, script: &str) -> PathBuf {
    let bin = dir.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let tool = bin.join(name);
    fs::write(&tool, script).unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
    bin
}

fn distro_tool(dir: &TempDir) -> PathBuf {
    fake_tool(dir, "proot-distro", FAKE_DISTRO_TOOL)
}

/// Make the rootfs look installed so nothing gets downloaded
fn preinstall(context: &Context) {
    let installation = context.installation();
    fs::create_dir_all(installation.host_path("/bin")).unwrap();
    symlink("/bin/busybox", installation.host_path("/bin/sh")).unwrap();
    fs::write(installation.rootfs_dir().join(MARKER_FILE), "test\n").unwrap();
}

fn drain(sub: &mut rootbox::events::EventSubscription) -> Vec<TerminalEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_next() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn local_mode_without_tools() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty");
    fs::create_dir(&empty).unwrap();
    let context = context(&dir, &empty);
    let workspace = context.workspace_dir();
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let orchestrator = Orchestrator::new(context, events).unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    assert_eq!(
        orchestrator.initialize().await.unwrap(),
        OrchestratorState::Degraded
    );
    assert_eq!(orchestrator.state(), OrchestratorState::Degraded);
    assert_eq!(orchestrator.backend(), Some(Backend::Local));
    assert!(workspace.join("projects").is_dir());
    assert!(workspace.join("ai").is_dir());
    assert!(workspace.join("webide").join("index.html").is_file());
    assert!(drain(&mut sub)
        .iter()
        .any(|event| matches!(event, TerminalEvent::Warning { .. })));

    assert!(matches!(
        orchestrator.status().await,
        Err(OrchestratorError::NoGuest)
    ));
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn distro_guest_becomes_ready() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let bin = distro_tool(&dir);
    let (url, hits) = health_server(200).await;
    let mut context = context(&dir, &bin);
    context.health.url = url;
    preinstall(&context);

    let orchestrator = Orchestrator::new(context, EventBus::default()).unwrap();
    assert_eq!(
        orchestrator.initialize().await.unwrap(),
        OrchestratorState::Ready
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    match orchestrator.guest() {
        Some(Guest::Distro { alias, .. }) => {
            assert_eq!(alias.name, "ubuntu-lts");
            assert_eq!(alias.origin, AliasOrigin::Preferred);
        }
        other => panic!("unexpected guest {:?}", other),
    }

    assert_eq!(orchestrator.status().await.unwrap(), ServiceStatus::Running);
    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.status().await.unwrap(), ServiceStatus::Stopped);
}

#[tokio::test]
async fn fallback_distro_and_health_timeout() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let bin = distro_tool(&dir);
    let (url, hits) = health_server(503).await;
    let mut context = context(&dir, &bin);
    context.health.url = url;
    context.backend.preferred_alias = "arch".into();
    preinstall(&context);
    let events = EventBus::default();
    let mut sub = events.subscribe();

    let orchestrator = Orchestrator::new(context, events).unwrap();
    match orchestrator.initialize().await {
        Err(OrchestratorError::HealthTimeout { attempts }) => assert_eq!(attempts, 3),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.state(), OrchestratorState::Failed);
    match orchestrator.guest() {
        Some(Guest::Distro { alias, .. }) => {
            assert_eq!(alias.name, "debian");
            assert_eq!(alias.origin, AliasOrigin::Fallback);
        }
        other => panic!("unexpected guest {:?}", other),
    }
    let seen = drain(&mut sub);
    assert!(seen.iter().any(
        |event| matches!(event, TerminalEvent::Warning { message } if message.contains("falling back to debian"))
    ));
    assert!(seen
        .iter()
        .any(|event| matches!(event, TerminalEvent::Error { .. })));

    // the service was started and left running, clean it up
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn attach_finds_existing_guest() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let bin = distro_tool(&dir);
    let context = context(&dir, &bin);

    let orchestrator = Orchestrator::new(context, EventBus::default()).unwrap();
    let guest = orchestrator.attach().await.unwrap();
    assert!(matches!(guest, Some(Guest::Distro { .. })));
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    // control script was never installed
    assert!(orchestrator.status().await.is_err());
}

#[tokio::test]
async fn attach_never_installs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let bin = fake_tool(&dir, "proot-distro", EMPTY_DISTRO_TOOL);
    let context = context(&dir, &bin);

    let orchestrator = Orchestrator::new(context, EventBus::default()).unwrap();
    assert_eq!(orchestrator.attach().await.unwrap(), None);
    assert!(!bin.join("installed").exists());
    assert!(matches!(
        orchestrator.backend(),
        Some(Backend::UserspaceDistro { .. })
    ));
    assert!(matches!(
        orchestrator.status().await,
        Err(OrchestratorError::NoGuest)
    ));
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn container_built_when_pull_fails() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let bin = fake_tool(&dir, "docker", FAKE_ENGINE);
    let (url, hits) = health_server(200).await;
    let mut context = context(&dir, &bin);
    context.health.url = url;
    let workspace = context.workspace_dir();
    let build_dir = context.cache_dir.join("container");
    let name = context.backend.container_name.clone();

    let orchestrator = Orchestrator::new(context, EventBus::default()).unwrap();
    assert_eq!(
        orchestrator.initialize().await.unwrap(),
        OrchestratorState::Ready
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        orchestrator.guest(),
        Some(Guest::Container {
            engine: bin.join("docker"),
            name: name.clone(),
        })
    );
    assert!(build_dir.join("Dockerfile").is_file());
    assert!(workspace.is_dir());

    let log = fs::read_to_string(bin.join("engine.log")).unwrap();
    let calls: Vec<&str> = log.lines().collect();
    assert!(calls[0].starts_with("image inspect"), "{:?}", calls);
    assert!(calls[1].starts_with("pull"), "{:?}", calls);
    assert!(calls[2].starts_with("build -t"), "{:?}", calls);
    assert_eq!(calls[3], format!("container inspect {}", name));
    assert!(calls[4].starts_with(&format!("run -d --name {}", name)), "{:?}", calls);
    assert!(calls[4].contains(workspace.to_str().unwrap()));
    // control script written, then started, through exec
    assert!(calls[5..]
        .iter()
        .all(|call| call.starts_with(&format!("exec -i {} sh", name))));
    assert_eq!(calls.len(), 7);

    assert_eq!(orchestrator.status().await.unwrap(), ServiceStatus::Running);
    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.status().await.unwrap(), ServiceStatus::Stopped);
}
