use crate::app::AppContext;
use crate::keymgr::{KeyManager, KmgrSettings};
use crate::{cli, config, exit_codes, output};
use serde_json::json;
use std::process::ExitCode;

pub fn dispatch(command: cli::Commands, ctx: &AppContext) -> ExitCode {
    match command {
        cli::Commands::Bootstrap(args) => bootstrap(args, ctx),
        cli::Commands::Rotate(args) => rotate(args, ctx),
        cli::Commands::Status(args) => status(args, ctx),
        cli::Commands::Verify(args) => verify(args, ctx),
    }
}

fn bootstrap(args: cli::BootstrapArgs, ctx: &AppContext) -> ExitCode {
    let mut settings = match config::load(ctx.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    };

    let template = match resolve_template(args.command, &settings) {
        Ok(template) => template,
        Err(code) => return code,
    };

    let manager = KeyManager::new(
        &args.data_dir.data_dir,
        KmgrSettings {
            enabled: true,
            passphrase_command: template.clone(),
        },
    );

    if let Err(error) = manager.bootstrap() {
        eprintln!("Error: {error}");
        return exit_codes::exit_code_for_kmgr_error(&error);
    }

    if args.save_config {
        settings.key_management_enabled = true;
        settings.cluster_passphrase_command = Some(template);
        if let Err(error) = config::save(ctx.config.as_deref(), &settings) {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    }

    let path = manager.primary_dir().display().to_string();
    output::print_value(
        path.clone(),
        json!({
            "kind": "bootstrap",
            "keystore": path,
        }),
        &ctx.output_mode,
    )
}

fn rotate(args: cli::RotateArgs, ctx: &AppContext) -> ExitCode {
    let mut settings = match config::load(ctx.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    };

    let kmgr_settings = match settings.to_kmgr_settings() {
        Ok(kmgr_settings) => kmgr_settings,
        Err(error) => {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    };

    // Load the keys under the currently configured passphrase, then point
    // the manager at the new source before re-wrapping.
    let manager = KeyManager::new(&args.data_dir.data_dir, kmgr_settings);
    if let Err(error) = manager.startup() {
        eprintln!("Error: {error}");
        return exit_codes::exit_code_for_kmgr_error(&error);
    }

    if let Some(template) = &args.command {
        manager.set_passphrase_command(template);
    }

    if let Err(error) = manager.rotate() {
        eprintln!("Error: {error}");
        return exit_codes::exit_code_for_kmgr_error(&error);
    }

    if args.save_config {
        if let Some(template) = args.command {
            settings.cluster_passphrase_command = Some(template);
        }
        if let Err(error) = config::save(ctx.config.as_deref(), &settings) {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    }

    let value = if ctx.output_mode.quiet {
        String::from("t")
    } else {
        String::from("rotated")
    };
    output::print_value(
        value,
        json!({
            "kind": "rotate",
            "rotated": true,
        }),
        &ctx.output_mode,
    )
}

fn status(args: cli::StatusArgs, ctx: &AppContext) -> ExitCode {
    // Status never runs the passphrase command, so no configuration is
    // needed beyond the data directory.
    let manager = KeyManager::new(
        &args.data_dir.data_dir,
        KmgrSettings {
            enabled: true,
            passphrase_command: String::new(),
        },
    );

    match manager.keystore_status() {
        Ok(state) => {
            let keys = match state {
                crate::keymgr::KeystoreStatus::Healthy { keys } => Some(keys),
                _ => None,
            };
            output::print_value(
                state.as_str().to_string(),
                json!({
                    "kind": "status",
                    "keystore": manager.primary_dir().display().to_string(),
                    "status": state.as_str(),
                    "keys": keys,
                }),
                &ctx.output_mode,
            )
        }
        Err(error) => {
            eprintln!("Error: {error}");
            exit_codes::exit_code_for_kmgr_error(&error)
        }
    }
}

fn verify(args: cli::VerifyArgs, ctx: &AppContext) -> ExitCode {
    let settings = match config::load(ctx.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("Error: {error}");
            return exit_codes::exit_code_for_config_error(&error);
        }
    };

    let template = match resolve_template(args.command, &settings) {
        Ok(template) => template,
        Err(code) => return code,
    };

    let manager = KeyManager::new(
        &args.data_dir.data_dir,
        KmgrSettings {
            enabled: true,
            passphrase_command: template,
        },
    );

    match manager.startup() {
        Ok(()) => output::print_value(
            String::from("ok"),
            json!({
                "kind": "verify",
                "keys": crate::keymgr::N_KEYS,
            }),
            &ctx.output_mode,
        ),
        Err(error) => {
            eprintln!("Error: {error}");
            exit_codes::exit_code_for_kmgr_error(&error)
        }
    }
}

fn resolve_template(
    cli_template: Option<String>,
    settings: &config::Settings,
) -> Result<String, ExitCode> {
    if let Some(template) = cli_template {
        return Ok(template);
    }
    if let Some(template) = &settings.cluster_passphrase_command {
        return Ok(template.clone());
    }
    let error = config::ConfigError::MissingPassphraseCommand;
    eprintln!("Error: {error}");
    Err(exit_codes::exit_code_for_config_error(&error))
}
