use crate::config::Config;
use crate::host::{self, HostSettings};
use crate::telemetry;
use uuid::Uuid;

const CHROME_ORIGIN_PREFIX: &str = "chrome-extension://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Host { profile_hint: Option<String> },
    ConfigInit,
    ConfigShow,
    TelemetryShow,
}

impl Mode {
    /// Anything that is not a maintenance command runs the native host. The
    /// browser passes its own arguments (origin, parent window handle) which
    /// are ignored, except a UUID-shaped one that names the profile.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        match args.first().map(String::as_str) {
            Some("config-init") => return Mode::ConfigInit,
            Some("config-show") => return Mode::ConfigShow,
            Some("telemetry-show") => return Mode::TelemetryShow,
            _ => {}
        }

        let profile_hint = args
            .iter()
            .filter(|arg| arg.as_str() != "host" && !arg.starts_with(CHROME_ORIGIN_PREFIX))
            .find(|arg| Uuid::parse_str(arg).is_ok())
            .cloned();
        Mode::Host { profile_hint }
    }
}

pub async fn run(config: Config, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    match mode {
        Mode::Host { profile_hint } => {
            host::run_native_host(HostSettings::from_config(&config, profile_hint)).await?;
            Ok(())
        }
        Mode::ConfigInit => handle_config_init(),
        Mode::ConfigShow => handle_config_show(&config),
        Mode::TelemetryShow => handle_telemetry_show(&config),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_config_show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("# {}", Config::active_path().display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn handle_telemetry_show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.logging.dir_path().join(telemetry::TELEMETRY_FILE);
    let state = telemetry::read_telemetry(&path)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_runs_the_host() {
        assert_eq!(
            Mode::from_args(Vec::<String>::new()),
            Mode::Host { profile_hint: None }
        );
        assert_eq!(Mode::from_args(["host"]), Mode::Host { profile_hint: None });
    }

    #[test]
    fn browser_launch_arguments_run_the_host() {
        let mode = Mode::from_args([
            "chrome-extension://abcdefghijklmnopabcdefghijklmnop/",
            "--parent-window=0",
        ]);
        assert_eq!(mode, Mode::Host { profile_hint: None });
    }

    #[test]
    fn uuid_argument_becomes_the_profile_hint() {
        let mode = Mode::from_args([
            "chrome-extension://abcdefghijklmnopabcdefghijklmnop/",
            "6f1c1f0e-3b7a-4d55-9a52-0c1d2e3f4a5b",
        ]);
        assert_eq!(
            mode,
            Mode::Host {
                profile_hint: Some("6f1c1f0e-3b7a-4d55-9a52-0c1d2e3f4a5b".to_string())
            }
        );
    }

    #[test]
    fn maintenance_commands_are_recognized() {
        assert_eq!(Mode::from_args(["config-init"]), Mode::ConfigInit);
        assert_eq!(Mode::from_args(["config-show"]), Mode::ConfigShow);
        assert_eq!(Mode::from_args(["telemetry-show"]), Mode::TelemetryShow);
    }
}
