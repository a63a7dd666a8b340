use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::vision::{self, ProbeArgs, VisionCliArgs, VisionConfig};

/// Onboard vision coprocessor: detects targets on every camera and reports
/// them to the flight controller.
#[derive(Debug, Parser)]
#[command(name = "coprocessor-vision", version, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: VisionCliArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture/detect/publish pipeline (default).
    Run(VisionCliArgs),
    /// Try capture sources and report which ones deliver frames.
    Probe(ProbeArgs),
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Command::Probe(args)) => vision::probe::run(args),
        Some(Command::Run(args)) => run_pipeline(args),
        None => run_pipeline(cli.run),
    }
}

fn run_pipeline(args: VisionCliArgs) -> Result<()> {
    let config = VisionConfig::try_from(args)?;
    vision::run(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_flags_run_the_pipeline() {
        let cli = Cli::try_parse_from(["coprocessor-vision", "--camera", "2", "--no-mavlink"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.cameras, vec!["2".to_string()]);
    }

    #[test]
    fn probe_subcommand_takes_its_own_flags() {
        let cli = Cli::try_parse_from([
            "coprocessor-vision",
            "probe",
            "--source",
            "rtsp://cam/1",
            "--max-index",
            "3",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Probe(args)) => {
                assert_eq!(args.sources, vec!["rtsp://cam/1".to_string()]);
                assert_eq!(args.max_index, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn explicit_run_subcommand_is_accepted() {
        let cli = Cli::try_parse_from(["coprocessor-vision", "run", "--camera", "0", "--cpu"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Run(ref args)) if args.use_cpu));
    }
}
