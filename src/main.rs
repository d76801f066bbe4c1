#![deny(unused)]
//! docbuild - ephemeral build-sandbox runner.
//!
//! Thin entry point for running ad-hoc commands through a local environment.
//! Production builds are driven by the task queue, which constructs the
//! environments from `docbuild_environment` directly.

use std::collections::HashSet;
use std::path::Path;

use docbuild_core::types::Project;
use docbuild_core::Settings;
use docbuild_environment::{BuildCommand, Environment, LocalEnvironment};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    tracing::info!("Starting docbuild v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        anyhow::bail!("usage: docbuild <command> [args...]");
    }

    let cwd = std::env::current_dir()?;
    let project = Project {
        id: 0,
        slug: "adhoc".to_string(),
        doc_path: cwd.clone(),
        container_image: None,
        container_mem_limit: None,
        container_time_limit: None,
        features: HashSet::new(),
    };

    let mut environment = LocalEnvironment::new(settings, project);
    let cmd = environment
        .run(BuildCommand::new(args).cwd(path_to_string(&cwd)))
        .await?;

    if let Some(output) = &cmd.output {
        print!("{output}");
    }
    std::process::exit(cmd.exit_code.unwrap_or(-1) as i32);
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
