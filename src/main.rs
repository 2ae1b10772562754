// src/main.rs

use anyhow::Context;
use mcuflow::{cli, config, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("mcuflow error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    let path = config::default_environment_path(args.home.as_deref());
    let env = match config::load_and_validate(&path) {
        Ok(env) => env,
        Err(err) => {
            logging::init_logging(args.log_level, None)?;
            return Err(err).with_context(|| format!("loading {}", path.display()));
        }
    };
    logging::init_logging(args.log_level, env.defaults.log_level.as_deref())?;
    run(args, env).await
}
