fn main() {
    if let Err(err) = toolbox_server::cli::run_toolbox() {
        tracing::error!(error = %err, "toolbox failed");
        std::process::exit(1);
    }
}
