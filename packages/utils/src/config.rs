use anyhow::{bail, Context, Result};
use figment::{providers::Format, Figment};
use serde::{de::DeserializeOwned, Serialize};
use std::{marker::PhantomData, path::PathBuf};

/// The builder we use to build Config
#[derive(Debug)]
pub struct ConfigBuilder<CONFIG, ARG> {
    pub cli_env_args: ARG,
    _config: PhantomData<CONFIG>,
}

pub trait CliEnvExt: Serialize + DeserializeOwned + Default + std::fmt::Debug {
    // e.g. "CONNECTOR"
    const ENV_VAR_PREFIX: &'static str;

    // The section identifier in the TOML file, e.g. "connector"
    const TOML_IDENTIFIER: &'static str;

    const PRINT_DEBUG_MSGS: bool = false;

    // if not supplied, config will try a series of fallbacks
    fn home_dir(&self) -> Option<PathBuf>;

    // if not supplied, only the current directory's .env is tried
    fn dotenv_path(&self) -> Option<PathBuf>;

    fn merge_cli_env_args(&self) -> Result<Self> {
        let env_prefix = format!("{}_", Self::ENV_VAR_PREFIX);

        let merged = Figment::new()
            .merge(figment::providers::Env::prefixed(&env_prefix))
            .merge(figment::providers::Serialized::defaults(self))
            .extract()?;

        Ok(merged)
    }
}

pub trait ConfigExt: Serialize + DeserializeOwned + Default + std::fmt::Debug {
    const FILENAME: &'static str = "connector.toml";

    fn log_levels(&self) -> impl Iterator<Item = &str>;

    fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in self.log_levels() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }
}

impl<CONFIG: ConfigExt, ARG: CliEnvExt> ConfigBuilder<CONFIG, ARG> {
    pub fn new(cli_env_args: ARG) -> Self {
        Self {
            cli_env_args,
            _config: PhantomData,
        }
    }

    pub fn build(self) -> Result<CONFIG> {
        // dotenv goes first, it may set the env vars used below
        let mut dotenv_paths = Vec::new();

        if let Some(dotenv_path) = self.cli_env_args.dotenv_path() {
            dotenv_paths.push(dotenv_path);
        }

        if let Ok(dotenv_path) = std::env::var("CONNECTOR_DOTENV") {
            dotenv_paths.push(PathBuf::from(dotenv_path));
        }

        dotenv_paths.push(std::env::current_dir()?.join(".env"));

        for dotenv_path in dotenv_paths {
            if ARG::PRINT_DEBUG_MSGS {
                eprintln!("Loading env vars from {}", dotenv_path.display());
            }
            if dotenv_path.exists() {
                if let Err(e) = dotenvy::from_path(dotenv_path) {
                    bail!("Error loading dotenv file: {}", e);
                }
            }
        }

        let cli_env_args = self.cli_env_args.merge_cli_env_args()?;

        let mut figment =
            Figment::new().merge(figment::providers::Serialized::defaults(CONFIG::default()));

        // a missing file is fine, everything has a default
        match ConfigFilePath::new(CONFIG::FILENAME, cli_env_args.home_dir()).into_path() {
            Some(filepath) => {
                if ARG::PRINT_DEBUG_MSGS {
                    eprintln!("Loading config from {}", filepath.display());
                }
                figment = figment
                    // global section
                    .merge(Figment::from(
                        figment::providers::Toml::file(&filepath).nested(),
                    ))
                    // specific section, overriding globals
                    .merge(
                        Figment::from(figment::providers::Toml::file(&filepath).nested())
                            .select(ARG::TOML_IDENTIFIER),
                    );
            }
            None => {
                tracing::debug!(
                    "No {} found (home: {:?}), using defaults",
                    CONFIG::FILENAME,
                    cli_env_args.home_dir()
                );
            }
        }

        let config: CONFIG = figment
            .merge(figment::providers::Serialized::defaults(cli_env_args))
            .extract()
            .context("Error extracting config")?;

        Ok(config)
    }
}

/// Expands `~` and `${VAR}` in a configured string, e.g. endpoint urls carrying api keys
pub fn expand_env(value: &str) -> Result<String> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .with_context(|| format!("Unable to expand {value}"))
}

// tries a series of fallback paths, looking for a config file
#[derive(Clone, Debug)]
pub struct ConfigFilePath {
    pub filename: String,
    // the optional directory set via direct args or env
    pub arg_env_dir: Option<PathBuf>,
}

impl ConfigFilePath {
    pub fn new(filename: impl ToString, arg_env_dir: Option<PathBuf>) -> Self {
        Self {
            filename: filename.to_string(),
            arg_env_dir,
        }
    }

    pub fn into_path(self) -> Option<PathBuf> {
        self.into_possible().into_iter().find(|path| path.exists())
    }

    // in order of priority
    pub fn into_possible(self) -> Vec<PathBuf> {
        let Self {
            filename,
            arg_env_dir,
        } = self;

        const DIRNAME: &str = "connector";

        let mut dirs = Vec::new();

        // --home /foo or CONNECTOR_HOME=/foo
        if let Some(dir) = arg_env_dir {
            dirs.push(dir);
        }

        if let Ok(dir) = std::env::var("CONNECTOR_HOME") {
            dirs.push(dir.into());
        }

        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }

        // ~/.connector/connector.toml
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(format!(".{DIRNAME}"))) {
            dirs.push(dir);
        }

        // e.g. ~/.config/connector on linux, ~/Library/Application Support/connector on macOS
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(DIRNAME)) {
            dirs.push(dir);
        }

        dirs.push(PathBuf::from("/etc").join(DIRNAME));

        let mut all_files: Vec<PathBuf> = dirs.into_iter().map(|dir| dir.join(&filename)).collect();

        all_files.dedup();

        all_files
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_home_is_tried_first() {
        let paths = ConfigFilePath::new("connector.toml", Some("/tmp1".into())).into_possible();
        assert_eq!(paths[0], PathBuf::from("/tmp1/connector.toml"));

        temp_env::with_var("CONNECTOR_HOME", Some("/tmp2"), || {
            let paths = ConfigFilePath::new("connector.toml", None).into_possible();
            assert_eq!(paths[0], PathBuf::from("/tmp2/connector.toml"));

            let paths = ConfigFilePath::new("connector.toml", Some("/tmp1".into())).into_possible();
            assert_eq!(paths[0], PathBuf::from("/tmp1/connector.toml"));
            assert_eq!(paths[1], PathBuf::from("/tmp2/connector.toml"));
        });
    }

    #[test]
    fn expands_env_placeholders() {
        temp_env::with_var("TEST_EXPAND_KEY", Some("abc123"), || {
            assert_eq!(
                expand_env("https://rpc.ankr.com/eth/${TEST_EXPAND_KEY}").unwrap(),
                "https://rpc.ankr.com/eth/abc123"
            );
        });

        temp_env::with_var_unset("TEST_EXPAND_MISSING", || {
            assert!(expand_env("wss://host/${TEST_EXPAND_MISSING}").is_err());
        });
    }
}
