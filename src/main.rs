fn main() {
    if let Err(err) = charge_session_api::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
