//! Writes a small synthetic store: one patient with a current study and two
//! priors, plus an unrelated patient.
//!
//! Usage: `synthesize_store <output-dir>`

use std::path::PathBuf;

use anyhow::{bail, Result};
use prior_viewer::synth::write_demo_store;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let Some(output) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: synthesize_store <output-dir>");
    };

    let studies = write_demo_store(&output)?;
    for study in &studies {
        println!(
            "{}  {}  {}  {} images",
            study.study_instance_uid,
            study.patient_id,
            study.study_date,
            study.image_count()
        );
    }
    println!("Open with: prior-viewer --store {}", output.display());
    Ok(())
}
