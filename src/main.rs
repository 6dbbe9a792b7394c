use docgate::cli;

fn main() {
    std::process::exit(cli::run());
}
