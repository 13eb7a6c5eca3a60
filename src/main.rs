use clap::{Arg, Command};
use log::LevelFilter;
use std::process;
use tls_enforce_milter::address::{parse_recipient, ParsedAddress};
use tls_enforce_milter::milter::Milter;
use tls_enforce_milter::policy::{PolicyEngine, PolicyStore};
use tls_enforce_milter::Config;

const PID_FILE: &str = "/var/run/tls-enforce-milter.pid";

#[tokio::main]
async fn main() {
    let matches = Command::new("tls-enforce-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter gating mail delivery on enforced-TLS policy")
        .long_about(
            "Recipients may request enforced TLS delivery by prefixing their\n\
             local part with 's:' (e.g. <s:user@domain.cc>). The milter checks\n\
             each requested domain against a TLS policy map, rewrites capable\n\
             recipients back to their plain form, annotates the message with an\n\
             X-TLS header, and rejects the transaction under strict or unified\n\
             delivery rules when the policy cannot be met.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/tls-enforce-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and the policy store")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-address")
                .long("test-address")
                .value_name("ADDR")
                .help("Parse a recipient address and show its policy verdict")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config_path = matches.get_one::<String>("config").unwrap();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(address) = matches.get_one::<String>("test-address") {
        test_address(&config, address);
        return;
    }

    if matches.get_flag("daemon") {
        daemonize();
    }

    log::info!("Starting tls-enforce-milter...");
    log::info!(
        "strict={}, unified={}, policy store: {}",
        config.strict,
        config.unified,
        config.policy_path
    );

    let socket_path = config.socket_path.clone();
    let milter = match Milter::new(config) {
        Ok(milter) => milter,
        Err(e) => {
            log::error!("Failed to create milter: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = milter.run(&socket_path).await {
        log::error!("Milter error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Socket path: {}", config.socket_path);
    println!("Policy store: {}", config.policy_path);
    println!("Strict mode: {}", config.strict);
    println!("Unified delivery: {}", config.unified);
    println!("Info URL: {}", config.info_url);
    println!();

    match PolicyStore::load(&config.policy_path) {
        Ok(store) => {
            let engine = PolicyEngine::new(std::sync::Arc::new(store));
            println!("✅ Policy store loaded");
            println!(
                "   {} enforced-TLS-capable entries",
                engine.capable_count()
            );
            println!();
            println!("✅ Configuration is valid");
        }
        Err(e) => {
            println!("❌ Policy store error: {e}");
            process::exit(1);
        }
    }
}

fn test_address(config: &Config, address: &str) {
    let recipient = parse_recipient(address);
    match &recipient.parsed {
        ParsedAddress::Enforced { local, domain } => {
            println!("Enforced delivery requested: {local}@{domain}");
            match PolicyStore::load(&config.policy_path) {
                Ok(store) => {
                    let engine = PolicyEngine::new(std::sync::Arc::new(store));
                    if engine.enforced_capable(domain) {
                        println!("✅ Enforced TLS is available to \"{domain}\"");
                    } else {
                        println!("❌ Enforced TLS is NOT available to \"{domain}\"");
                    }
                }
                Err(e) => {
                    eprintln!("Policy store error: {e}");
                    process::exit(1);
                }
            }
        }
        ParsedAddress::Normal { local, domain } => {
            println!("Normal recipient: {local}@{domain}");
        }
        ParsedAddress::Malformed => {
            println!("❌ Address does not parse: {address}");
            process::exit(1);
        }
    }
}

fn daemonize() {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        log::info!("Starting tls-enforce-milter in daemon mode...");

        // First fork
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("Failed to fork process");
                process::exit(1);
            }
            0 => {
                // Child process continues
            }
            _ => {
                // Parent process exits
                process::exit(0);
            }
        }

        // Create new session (become session leader)
        if unsafe { libc::setsid() } == -1 {
            log::error!("Failed to create new session");
            process::exit(1);
        }

        // Ignore SIGHUP to prevent the daemon from being killed when the
        // session leader exits
        unsafe {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }

        // Second fork so we are no longer a session leader (prevents
        // acquiring a controlling terminal)
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("Failed to second fork");
                process::exit(1);
            }
            0 => {
                // Child process continues as daemon
            }
            _ => {
                process::exit(0);
            }
        }

        // Change working directory to root to avoid keeping any directory in use
        let root_path = std::ffi::CString::new("/").unwrap();
        if unsafe { libc::chdir(root_path.as_ptr()) } == -1 {
            log::warn!("Failed to change working directory to /");
        }

        // Set file creation mask
        unsafe {
            libc::umask(0);
        }

        // Redirect standard file descriptors to /dev/null instead of closing
        // them, so stray writes do not hit a reused descriptor
        if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
            let null_fd = dev_null.as_raw_fd();

            unsafe {
                libc::dup2(null_fd, 0); // stdin
                libc::dup2(null_fd, 1); // stdout
                libc::dup2(null_fd, 2); // stderr
            }

            // Keep dev_null open, its fd is in use
            std::mem::forget(dev_null);
        } else {
            log::warn!("Failed to open /dev/null, closing standard file descriptors");
            unsafe {
                libc::close(0);
                libc::close(1);
                libc::close(2);
            }
        }

        // Write PID file for the rc system
        let pid = unsafe { libc::getpid() };
        if let Err(e) = std::fs::write(PID_FILE, pid.to_string()) {
            log::warn!("Failed to write PID file: {e}");
        } else {
            log::info!("PID file written: {PID_FILE} ({pid})");
        }

        // Clean up the PID file on shutdown
        ctrlc::set_handler(move || {
            log::info!("Received shutdown signal, cleaning up...");
            if std::path::Path::new(PID_FILE).exists() {
                if let Err(e) = std::fs::remove_file(PID_FILE) {
                    log::warn!("Failed to remove PID file: {e}");
                } else {
                    log::info!("PID file removed");
                }
            }
            std::process::exit(0);
        })
        .expect("Error setting signal handler");

        log::info!("Daemon mode initialization complete");
    }

    #[cfg(not(unix))]
    {
        log::warn!("Daemon mode not supported on this platform, running in foreground");
    }
}
