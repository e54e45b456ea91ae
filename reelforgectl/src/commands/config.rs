use std::path::Path;

use serde_json::json;

use reelforge_core::PipelineConfig;

use crate::{OutputFormat, Result};

pub fn check(config: &PipelineConfig, source: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let summary = json!({
                "config": source.display().to_string(),
                "valid": true,
                "max_concurrent_jobs": config.limits.max_concurrent_jobs,
                "max_attempts": config.retry.max_attempts,
                "segment_seconds": config.segmenting.segment_seconds,
                "ladder": config
                    .ladder
                    .iter()
                    .map(|tier| json!({
                        "name": tier.name,
                        "height": tier.height,
                        "bitrate_kbps": tier.bitrate_kbps,
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("config {} is valid", source.display());
            println!("  concurrent jobs: {}", config.limits.max_concurrent_jobs);
            println!("  retry attempts:  {}", config.retry.max_attempts);
            println!("  segment length:  {}s", config.segmenting.segment_seconds);
            println!("  quality ladder:");
            for tier in &config.ladder {
                println!(
                    "    {:>6}  {}p @ {}kbps (crf {}, {})",
                    tier.name, tier.height, tier.bitrate_kbps, tier.crf, tier.preset
                );
            }
        }
    }
    Ok(())
}
