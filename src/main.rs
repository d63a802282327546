use anyhow::anyhow;
use colored::*;
use fiobench::{
    artifacts::OutputDir,
    clap_args::{self, Args, Commands},
    config::{self, Config},
    errors::exit_code_for,
};
use tracing::{subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // .env values fill in anything not already set in the environment
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    if let Err(err) = try_main(args).await {
        eprintln!("\n{} {:#}", "ERROR:".red().bold(), err);
        std::process::exit(exit_code_for(&err));
    }
}

async fn try_main(args: Args) -> anyhow::Result<()> {
    let env_filter = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(env_filter.to_string()))?;

    let file_config = config::load_file_config(args.config.as_deref())?;
    let config = Config::from_env(file_config)?;

    match &args.command {
        Commands::Generate => {
            let out_dir = OutputDir::new(&config.out_dir);
            for (role, path) in fiobench::generate_descriptors(&config, &out_dir)? {
                println!("{}: {}", role.to_string().green(), path.display());
            }
        }

        command @ Commands::Run { .. } => {
            let run_network = command.network_enabled(config.network.enabled);
            let report = fiobench::run(&config, run_network).await?;
            println!("{}", report.render());
        }
    }

    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).map_err(|e| anyhow!("Failed to set subscriber: {}", e))
}
