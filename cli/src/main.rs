#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{Builder, Env};
use rootbox::{
    context::ContextOverrides,
    errors::OrchestratorError,
    events::{EventSubscription, StreamKind},
    rootfs::fetch::HttpFetcher,
    Context, EventBus, Installer, Orchestrator, ShellSession, TerminalEvent,
};
use std::{error::Error, io::Write, path::Path, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};

type CliResult = Result<i32, Box<dyn Error>>;

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml)
        .version(crate_version!())
        .get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("warn");
    Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let context = match build_context(&matches) {
        Ok(context) => context,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(2);
        }
    };
    let json = matches.is_present("json");
    let events = EventBus::new(context.event_capacity);
    let printer = tokio::spawn(print_events(events.subscribe(), json));

    let result = match matches.subcommand() {
        ("install", _) => install(&context, &events).await,
        ("uninstall", _) => uninstall(&context, &events).await,
        ("up", _) => up(context, &events).await,
        ("status", _) => status(context, &events, json).await,
        ("down", _) => down(context, &events).await,
        ("shell", Some(sub)) => shell(&context, &events, string_values(sub, "command")).await,
        (other, _) => Err(format!("unknown subcommand {:?}", other).into()),
    };

    // the printer ends once every handle to the bus is gone
    drop(events);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    }
}

fn build_context(matches: &ArgMatches) -> Result<Context, Box<dyn Error>> {
    let mut builder = Context::builder();
    if let Some(dir) = matches.value_of("data_dir") {
        builder = builder.data_dir(Path::new(dir));
    }
    if let Some(file) = matches.value_of("config") {
        builder = builder.overrides(ContextOverrides::from_file(Path::new(file))?);
    }
    Ok(builder.build()?)
}

async fn print_events(mut events: EventSubscription, json: bool) {
    while let Some(event) = events.next().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(err) => log::error!("can't serialize event, {}", err),
            }
            continue;
        }
        // warnings and errors already reach stderr through the log
        match &event {
            TerminalEvent::Output {
                stream: StreamKind::Stdout,
                text,
            } => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            TerminalEvent::Output {
                stream: StreamKind::Stderr,
                text,
            } => {
                let mut stderr = std::io::stderr();
                let _ = stderr.write_all(text.as_bytes());
                let _ = stderr.flush();
            }
            TerminalEvent::Status { .. } | TerminalEvent::Exit { .. } => eprintln!("{}", event),
            TerminalEvent::Warning { .. } | TerminalEvent::Error { .. } => (),
        }
    }
}

fn installer(
    context: &Context,
    events: &EventBus,
) -> Result<Installer<HttpFetcher>, Box<dyn Error>> {
    let fetcher = HttpFetcher::new(context)?;
    Ok(Installer::new(context.installation(), fetcher, events.clone()))
}

async fn install(context: &Context, events: &EventBus) -> CliResult {
    installer(context, events)?.install().await?;
    Ok(0)
}

async fn uninstall(context: &Context, events: &EventBus) -> CliResult {
    installer(context, events)?.uninstall().await?;
    Ok(0)
}

async fn up(context: Context, events: &EventBus) -> CliResult {
    let orchestrator = Orchestrator::new(context, events.clone())?;
    let state = orchestrator.initialize().await?;
    println!("{}", state);
    Ok(0)
}

async fn status(context: Context, events: &EventBus, json: bool) -> CliResult {
    let orchestrator = Orchestrator::new(context, events.clone())?;
    orchestrator.attach().await?;
    let backend = orchestrator.backend().map(|b| b.kind()).unwrap_or("none");
    let status = match orchestrator.status().await {
        Ok(status) => Some(status),
        Err(OrchestratorError::NoGuest) => None,
        Err(err) => return Err(err.into()),
    };
    if json {
        println!(
            "{}",
            serde_json::json!({ "backend": backend, "service": status })
        );
    } else {
        match &status {
            Some(status) => println!("{}: {}", backend, status),
            None => println!("{}: no guest", backend),
        }
    }
    Ok(0)
}

async fn down(context: Context, events: &EventBus) -> CliResult {
    let orchestrator = Orchestrator::new(context, events.clone())?;
    orchestrator.attach().await?;
    orchestrator.stop().await?;
    Ok(0)
}

async fn shell(context: &Context, events: &EventBus, commands: Vec<String>) -> CliResult {
    let session = ShellSession::acquire(context, events.clone()).await?;
    if commands.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            session.execute_command(&line).await?;
        }
    } else {
        for command in &commands {
            session.execute_command(command).await?;
        }
    }
    session.stop().await?;
    Ok(0)
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    matches
        .values_of(name)
        .into_iter()
        .flat_map(|values| values.map(|value| value.to_string()))
        .collect()
}
