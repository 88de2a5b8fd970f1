//! Layout command - show where each section of a region would live.

use anyhow::{Context, Result};
use factheap_core::region::{RegionLayout, Section};
use factheap_core::RegionConfig;
use std::path::Path;

/// Run the layout command.
pub fn run(config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => RegionConfig::from_json_file(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?,
        None => RegionConfig::default(),
    };
    config.validate().context("Invalid region configuration")?;
    let layout = RegionLayout::for_host(&config);

    println!("Region Layout (page size {})", layout.page_size);
    println!("=============");
    let sections: [(&str, Section); 8] = [
        ("control", layout.control),
        ("locals", layout.locals),
        ("filename", layout.filename),
        ("global", layout.global),
        ("dep_table", layout.dep_table),
        ("bindings", layout.bindings),
        ("hash_table", layout.hash_table),
        ("heap", layout.heap),
    ];
    for (name, section) in sections {
        println!(
            "{name:<11} 0x{:012x} .. 0x{:012x}  {:>14} bytes",
            section.offset,
            section.end(),
            section.len
        );
    }
    println!("total       {} bytes", layout.total);
    println!();
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}
