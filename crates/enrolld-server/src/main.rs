use std::process::ExitCode;

use clap::Parser;

use enrolld_core::Config;
use enrolld_server::supervisor::{Service, Supervisor};
use enrolld_server::{certgen, cli::Cli, logging, ServerError};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ServerError> {
    if let Some(dir) = &cli.working_dir {
        std::env::set_current_dir(dir)?;
    }

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    cli.apply_overrides(&mut config);
    config.validate()?;

    if cli.generate_certs {
        let names = cli
            .cert_subject
            .as_ref()
            .map(|s| vec![s.clone()])
            .unwrap_or_default();
        certgen::generate(&config.cert_path, &config.key_path, names)?;
        return Ok(());
    }

    if let Some(group) = &config.group {
        enrolld_server::privdrop::drop_group(group)?;
    }

    let password = load_password(&config)?;
    let service = Service::build(config, password)?;
    let mut supervisor = Supervisor::new(service);
    supervisor.run()
}

fn load_password(config: &Config) -> Result<Option<String>, ServerError> {
    if !config.use_password {
        return Ok(None);
    }
    if let Some(path) = &config.password_file {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let pass = text.lines().next().unwrap_or("").to_string();
            if !pass.is_empty() {
                tracing::info!(path = %path.display(), "using configured password file");
                return Ok(Some(pass));
            }
        }
    }
    let generated = generate_random_password();
    tracing::info!(password = %generated, "no password file found, generated a random one for this run");
    Ok(Some(generated))
}

fn generate_random_password() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
