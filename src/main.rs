use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use forge::actors::ActorHandle;
use forge::agent::AgentId;
use forge::bus::MessageBus;
use forge::config::Config;
use forge::core::task::{Capability, Task};
use forge::orchestration::{
    ArtifactStore, CapabilityProvider, ChannelGateway, GatewayEvent, JsonProjectStore,
    MemoryArtifactStore, ProjectStore, ProviderError, ProviderOutput, TemplatePlanner,
};
use forge::{Orchestrator, ProjectRequest, Result, Worker};

/// Capabilities the demo crew covers, one worker each per `--workers`.
const CREW: &[&str] = &["design", "frontend", "backend", "review", "test"];

/// Forge - multi-agent project orchestrator
#[derive(Parser, Debug)]
#[command(name = "forge")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FORGE_DEBUG=1     Enable debug logging (alternative to --debug)\n    FORGE_LOG=<filter>  Explicit tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.forge/forge.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a request through the pipeline with simulated workers
    Run {
        /// The project request in natural language
        request: String,

        /// Workers per capability
        #[arg(long, short = 'w', default_value_t = 1)]
        workers: usize,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Print every status event as a JSON line
        #[arg(long)]
        headless: bool,
    },

    /// Print the effective configuration
    Config,

    /// List persisted project records
    Projects,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    forge::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            request,
            workers,
            timeout,
            headless,
        } => run_request(request, workers, Duration::from_secs(timeout), headless),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&Config::load()?)?);
            Ok(())
        }
        Command::Projects => run_projects(),
    }
}

/// Stand-in provider that fabricates plausible output per capability.
struct SimulatedProvider {
    delay: Duration,
}

#[async_trait]
impl CapabilityProvider for SimulatedProvider {
    async fn invoke(&self, task: &Task) -> std::result::Result<ProviderOutput, ProviderError> {
        tokio::time::sleep(self.delay).await;
        let summary = format!("{} done", task.name);
        let output = match (task.required_capability.as_str(), task.name.as_str()) {
            ("design", _) => ProviderOutput::new(&summary)
                .with_file("design.md", &format!("# Design\n\n{}\n", task.description)),
            ("frontend", "markup") => ProviderOutput::new(&summary).with_file(
                "index.html",
                "<!doctype html>\n<html><head><link rel=\"stylesheet\" href=\"styles.css\"></head><body></body></html>\n",
            ),
            ("frontend", "styles") => {
                ProviderOutput::new(&summary).with_file("styles.css", "body { margin: 0; }\n")
            }
            ("frontend", "scripts") => {
                ProviderOutput::new(&summary).with_file("app.js", "console.log('ready');\n")
            }
            ("backend", name) => ProviderOutput::new(&summary)
                .with_file(&format!("server/{}.json", name), "{\"routes\": []}\n"),
            ("review", _) | ("test", _) => ProviderOutput::new("no issues found"),
            (_, name) => ProviderOutput::new(&summary)
                .with_file(&format!("{}.txt", name), &task.description),
        };
        Ok(output)
    }
}

fn run_request(request: String, workers: usize, limit: Duration, headless: bool) -> Result<()> {
    info!("Run command: request={:?}, workers={}", request, workers);
    let config = Config::load()?;
    let store: Arc<dyn ProjectStore> = Arc::new(JsonProjectStore::new(config.projects_dir()?));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let bus = MessageBus::from_config(&config);
        let (gateway, mut events) = ChannelGateway::new();
        let (orchestrator, orchestrator_handle) = Orchestrator::spawn(
            config.clone(),
            Box::new(TemplatePlanner::new()),
            bus.clone(),
            Arc::new(gateway),
            store,
        )?;

        let artifacts = Arc::new(MemoryArtifactStore::new());
        let provider: Arc<dyn CapabilityProvider> = Arc::new(SimulatedProvider {
            delay: Duration::from_millis(50),
        });
        let mut handles: Vec<ActorHandle> = Vec::new();
        for capability in CREW {
            for n in 1..=workers.max(1) {
                let id = AgentId::new(&format!("{}-{}", capability, n));
                let worker = Worker::new(
                    id.clone(),
                    vec![Capability::new(capability)],
                    provider.clone(),
                    artifacts.clone(),
                    bus.clone(),
                )
                .with_heartbeat_interval(config.heartbeat_interval());
                handles.push(worker.spawn());
                orchestrator
                    .register_agent(id, vec![Capability::new(capability)])
                    .await?;
            }
        }

        let outcome = match orchestrator
            .handle_request(ProjectRequest::new(&request))
            .await
        {
            Ok(project_id) => {
                let finished = tokio::time::timeout(limit, watch(&mut events, headless)).await;
                if finished.is_err() {
                    warn!("Project {} did not finish within {:?}", project_id.short(), limit);
                    let _ = orchestrator.cancel(project_id).await;
                }
                let snapshot = orchestrator.snapshot(project_id).await?;
                let files = artifacts.list(project_id).await?;
                let json_output = serde_json::json!({
                    "project_id": project_id.to_string(),
                    "name": snapshot.record.name,
                    "stage": snapshot.record.stage,
                    "remediation_loops": snapshot.remediation_loops,
                    "tasks": snapshot.tasks.iter().map(|t| serde_json::json!({
                        "name": t.name,
                        "status": t.status.to_string(),
                        "agent": t.assigned_agent,
                        "attempts": t.attempt_count,
                    })).collect::<Vec<_>>(),
                    "artifacts": files,
                });
                println!("{}", serde_json::to_string_pretty(&json_output)?);
                if snapshot.record.stage.is_terminal() {
                    orchestrator.archive(project_id).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        };

        for handle in handles {
            handle.join().await?;
        }
        orchestrator_handle.join().await?;
        bus.shutdown();
        outcome
    })
}

/// Drain gateway events until the project reaches a terminal stage.
async fn watch(events: &mut mpsc::UnboundedReceiver<GatewayEvent>, headless: bool) {
    while let Some(event) = events.recv().await {
        if headless {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Unprintable event: {}", e),
            }
        }
        match event {
            GatewayEvent::Status(status) if status.stage.is_terminal() => return,
            GatewayEvent::Failure(notice) => {
                eprintln!("{}", notice.summary());
                return;
            }
            _ => {}
        }
    }
}

fn run_projects() -> Result<()> {
    let config = Config::load()?;
    let store = JsonProjectStore::new(config.projects_dir()?);
    let rt = tokio::runtime::Runtime::new()?;
    let records = rt.block_on(store.list())?;
    if records.is_empty() {
        println!("No projects recorded.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<10}  {}  {}",
            record.id.short(),
            record.stage.to_string(),
            record.updated_at.format("%Y-%m-%d %H:%M"),
            record.name
        );
    }
    Ok(())
}
