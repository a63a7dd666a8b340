use clap::Parser;

mod cli;
mod vision;

fn main() {
    let cli = cli::Cli::parse();
    if let Err(err) = cli::handle_commands(cli) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
