// `supportchat config`: print the effective configuration.

use clap::Args;
use serde::Serialize;

use supportchat_session::config::{global_config_path, ClientConfig, ConfigError};

use super::GlobalArgs;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Print only the config file location.
    #[arg(long)]
    pub file: bool,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    file: Option<String>,
    #[serde(flatten)]
    config: ClientConfig,
}

pub fn run(global: &GlobalArgs, args: ConfigArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(global.json);
    let file = global
        .config
        .clone()
        .or_else(global_config_path)
        .map(|path| path.display().to_string());

    if args.file {
        let file = file.ok_or(ConfigError::NoHomeDir)?;
        output::print_output(format, &serde_json::json!({ "file": file }), |_| file.clone())?;
        return Ok(());
    }

    let view = ConfigView { file, config: global.load_config()? };
    output::print_output(format, &view, format_human)?;
    Ok(())
}

fn format_human(view: &ConfigView) -> String {
    let body = toml::to_string_pretty(&view.config)
        .unwrap_or_else(|error| format!("# failed to render config: {error}\n"));
    match &view.file {
        Some(file) => format!("# {file}\n{body}"),
        None => body,
    }
}
