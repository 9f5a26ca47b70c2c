//! Binary entry point: parses startup arguments, brings up the control
//! socket, and drives the poll loop until a `quit` command lands.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sigflowd::config::Args;
use sigflowd::registry::PollableRegistry;
use sigflowd::Engine;

/// Default timeout passed to `poll(2)` each cycle. Short enough that a
/// stalled device is noticed promptly, long enough that an idle daemon
/// barely wakes the CPU.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

const CONTROL_SOCKET_LABEL: &str = "Listener";

/// Set by the signal handler, polled once per cycle. A plain `AtomicBool`
/// rather than anything allocating or blocking: the handler must stay
/// async-signal-safe.
static TERMINATING: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    TERMINATING.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        for signum in [libc::SIGTERM, libc::SIGINT] {
            libc::signal(signum, request_shutdown as libc::sighandler_t);
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse_from_env();
    install_signal_handlers();

    let registry = match PollableRegistry::new() {
        Ok(r) => r,
        Err(e) => {
            log::error!("failed to initialize poll registry: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::new(registry);
    if let Err(e) =
        engine.listen_with_quiet(CONTROL_SOCKET_LABEL.to_string(), &args.sock_path, args.quiet)
    {
        log::error!("failed to bind control socket {}: {}", args.sock_path, e);
        return ExitCode::FAILURE;
    }
    log::info!("listening on {}", args.sock_path);

    while !engine.quit_requested && !TERMINATING.load(Ordering::SeqCst) {
        if let Err(e) = engine.run_once(Some(POLL_TIMEOUT)) {
            log::error!("poll cycle failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    log::info!("shutting down");
    ExitCode::SUCCESS
}
