//! In-sandbox agent entry point. `execve`'d by nsinit as the sandbox's PID 1
//!.

fn main() {
    let stateless = std::env::var("SANDKASTEN_RUNNER_STATELESS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if let Err(e) = sandkasten::runner::run(stateless) {
        eprintln!("sandkasten-runner: fatal: {e}");
        std::process::exit(1);
    }
}
