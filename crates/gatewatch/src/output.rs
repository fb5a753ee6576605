//! Rendering for command output. Everything goes to stdout as JSON.

use crate::cli::OutputFormat;
use crate::error::CliError;

pub fn render<T: serde::Serialize + ?Sized>(
    data: &T,
    format: OutputFormat,
) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
    })
}

pub fn print<T: serde::Serialize + ?Sized>(data: &T, format: OutputFormat) -> Result<(), CliError> {
    println!("{}", render(data, format)?);
    Ok(())
}

/// One value per line, regardless of `--output`. Used for event streams.
pub fn print_line<T: serde::Serialize + ?Sized>(data: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string(data)?);
    Ok(())
}
