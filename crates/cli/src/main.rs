use std::process::ExitCode;

fn main() -> ExitCode {
    clerk_cli::run()
}
