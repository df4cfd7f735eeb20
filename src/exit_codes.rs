use crate::config;
use crate::keymgr::{KmgrError, store::StoreError};
use std::process::ExitCode;

pub const EXIT_USAGE: u8 = 64;
pub const EXIT_IO: u8 = 2;
pub const EXIT_SOFTWARE: u8 = 1;

pub fn exit_code_for_config_error(error: &config::ConfigError) -> ExitCode {
    use config::ConfigError::*;

    match error {
        ConfigDirUnavailable | Io(_) => ExitCode::from(EXIT_IO),
        MissingPassphraseCommand => ExitCode::from(EXIT_USAGE),
        Parse(_) | Serialize(_) | UnsupportedSchemaVersion(_) => ExitCode::from(EXIT_SOFTWARE),
    }
}

pub fn exit_code_for_kmgr_error(error: &KmgrError) -> ExitCode {
    use KmgrError::*;

    match error {
        FeatureDisabled
        | PassphraseTooShort
        | BadPassphrase
        | AlreadyBootstrapped(_)
        | MissingKeystore
        | RotationInProgress => ExitCode::from(EXIT_USAGE),
        Command(_) | Io(_) | UnsupportedPlatform => ExitCode::from(EXIT_IO),
        Store(StoreError::Io(_)) => ExitCode::from(EXIT_IO),
        Store(_) | Crypto(_) | Cache(_) => ExitCode::from(EXIT_SOFTWARE),
    }
}
