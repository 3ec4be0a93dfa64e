//! Run the COVID-19 household study and write the cohort table.
//!
//! Either reads a real patients/events extract, or fabricates one from the study's
//! expectations (`--synthetic N`) so the pipeline can be exercised without access to
//! patient data.

use clap::Parser;
use covid_cohort_study::{
    covid::{study_definition, CovidCodelists},
    driver::{run, CancelToken, RecordsSource, RunOptions},
    PatientSource, SyntheticSource,
};
use qu::ick_use::*;
use serde::Deserialize;
use std::{fs, io, path::PathBuf};

#[derive(Parser)]
struct Opt {
    /// A TOML file supplying defaults for the options below.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Directory containing the published codelist CSVs.
    #[clap(long)]
    codelists: Option<PathBuf>,
    /// Patients table (CSV) for a real extract.
    #[clap(long)]
    patients: Option<PathBuf>,
    /// Events table (CSV) for a real extract.
    #[clap(long)]
    events: Option<PathBuf>,
    /// Fabricate a cohort of this size from the study's expectations instead of
    /// reading real tables.
    #[clap(long)]
    synthetic: Option<usize>,
    /// Seed for synthetic draws; a given seed reproduces the same cohort.
    #[clap(long)]
    seed: Option<u64>,
    /// Where to write the output table.
    #[clap(short, long)]
    output: Option<PathBuf>,
}

/// The same knobs as the command line, from a config file. Command line wins.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Config {
    codelists: Option<PathBuf>,
    patients: Option<PathBuf>,
    events: Option<PathBuf>,
    synthetic: Option<usize>,
    seed: Option<u64>,
    output: Option<PathBuf>,
}

impl Config {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config \"{}\"", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("parsing config \"{}\"", path.display()))
    }
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = Config::load(opt.config.as_ref())?;
    let codelists_dir = opt
        .codelists
        .or(config.codelists)
        .unwrap_or_else(|| PathBuf::from("codelists"));
    let output = opt
        .output
        .or(config.output)
        .unwrap_or_else(|| PathBuf::from("output/input.csv"));
    let synthetic = opt.synthetic.or(config.synthetic);
    let seed = opt.seed.or(config.seed).unwrap_or(42);

    let codelists = CovidCodelists::load(&codelists_dir)
        .with_context(|| format!("loading codelists from \"{}\"", codelists_dir.display()))?;
    let plan = study_definition(&codelists)?.compile()?;
    event!(
        Level::INFO,
        "study compiled: {} variables",
        plan.variables().len()
    );

    let source: Box<dyn PatientSource> = match synthetic {
        Some(count) => {
            event!(Level::INFO, "fabricating {} synthetic patients", count);
            Box::new(SyntheticSource::new(plan.clone(), count, seed))
        }
        None => {
            let patients = opt
                .patients
                .or(config.patients)
                .context("need --patients (or --synthetic) to know what to extract")?;
            let events = opt
                .events
                .or(config.events)
                .context("need --events (or --synthetic) to know what to extract")?;
            Box::new(RecordsSource::load(patients, events)?)
        }
    };

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("could not create output directory")?;
    }
    let out = io::BufWriter::new(
        fs::File::create(&output)
            .with_context(|| format!("creating \"{}\"", output.display()))?,
    );

    let summary = run(
        &plan,
        &*source,
        out,
        &RunOptions::default(),
        &CancelToken::new(),
    )?;

    println!("{}", summary.term_table().for_terminal());
    for (patient_id, message) in &summary.error_samples {
        event!(Level::WARN, "patient {}: {}", patient_id, message);
    }
    ensure!(
        summary.failed * 100 < summary.patients.max(1) * 5,
        "more than 5% of patients failed; check the input tables"
    );
    Ok(())
}
