use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use rescache::config::Config;
use rescache::logging;
use rescache::replay::{self, Script};
use rescache::Resource;

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Drive the resource cache from scripted lifecycle events")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./rescache.yaml or $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Replay a YAML script and print the resulting cache entries as JSON
  Replay {
    /// Script to run
    script: PathBuf,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _logging = logging::init_logging(&config.log)?;

  match args.command {
    Command::Replay { script } => {
      let script = Script::load(&script)?;
      let entries = replay::run(&script, &config).await?;
      let entries: BTreeMap<&str, &Resource> = entries
        .iter()
        .map(|(id, resource)| (id.as_str(), resource.as_ref()))
        .collect();
      println!("{}", serde_json::to_string_pretty(&entries)?);
    }
  }

  Ok(())
}
