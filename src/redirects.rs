//! Redirect map for web servers: old URL path to new absolute URL, one row per
//! converted file.

use crate::config::EngineConfig;
use crate::state::JobState;
use crate::Result;
use csv::{QuoteStyle, WriterBuilder};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub source: String,
    pub destination: String,
}

pub fn redirects_for(job: &JobState, config: &EngineConfig) -> Result<Vec<Redirect>> {
    let mut out = Vec::with_capacity(job.converted_files.len());
    for entry in &job.converted_files {
        let source = Url::parse(&config.public_url(&entry.original))?;
        out.push(Redirect {
            source: source.path().to_string(),
            destination: config.public_url(&entry.converted),
        });
    }
    Ok(out)
}

/// `source,destination` CSV with every field quoted.
pub fn export_redirects_csv(job: &JobState, config: &EngineConfig) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(Vec::new());
    writer.write_record(["source", "destination"])?;
    for redirect in redirects_for(job, config)? {
        writer.write_record([redirect.source.as_str(), redirect.destination.as_str()])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
