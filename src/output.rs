use anyhow::Result;
use clap::ValueEnum;

use crate::model::Item;

/// Output format options for the demo CLI.
#[derive(Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

/// Serializes a page of items according to the chosen output format.
pub fn format_output(items: &[Item], output_format: &OutputFormat) -> Result<String> {
    match output_format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(items)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(vec![]);
            for item in items {
                wtr.serialize(item)?;
            }
            Ok(String::from_utf8(wtr.into_inner()?)?)
        }
    }
}
