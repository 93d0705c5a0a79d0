use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    pub config_path: PathBuf,
}

impl Args {
    const DEFAULT_CONFIG_PATH: &'static str = "proxy-config.toml";
    const USAGE: &'static str = "Usage: proxy_sv1 [-h/--help] [-c/--config <path>]";

    /// Parses the command line. Unknown arguments are ignored so wrappers
    /// can pass extra flags through to the environment-based config.
    pub fn from_args() -> Result<Self, String> {
        let mut config_path = PathBuf::from(Self::DEFAULT_CONFIG_PATH);

        let mut cli = std::env::args().skip(1);
        while let Some(arg) = cli.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    config_path = cli
                        .next()
                        .map(PathBuf::from)
                        .ok_or_else(|| format!("missing path after {arg}\n{}", Self::USAGE))?;
                }
                "-h" | "--help" => {
                    return Err(format!(
                        "{}\ndefault config path: {}",
                        Self::USAGE,
                        Self::DEFAULT_CONFIG_PATH
                    ))
                }
                _ => {}
            }
        }

        Ok(Self { config_path })
    }
}
