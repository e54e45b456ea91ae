use clap::Parser;

fn main() {
    reelforgectl::init_tracing();
    let cli = reelforgectl::Cli::parse();
    if let Err(err) = reelforgectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
