//! Compile the study and print what it will extract, without touching any data.
//!
//! Useful for checking variable order and dependency resolution after editing the
//! study definition, and for exporting the compiled plan as JSON.

use clap::Parser;
use covid_cohort_study::{
    covid::{study_definition, CovidCodelists},
    study::{MatchPolicy, Returning, VariableDef},
};
use qu::ick_use::*;
use std::{fs, path::PathBuf};

#[derive(Parser)]
struct Opt {
    /// Directory containing the published codelist CSVs.
    #[clap(long, default_value = "codelists")]
    codelists: PathBuf,
    /// Also write the compiled plan as JSON to the given path.
    #[clap(long)]
    json: Option<PathBuf>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let codelists = CovidCodelists::load(&opt.codelists)?;
    let plan = study_definition(&codelists)?.compile()?;

    use term_data_table::{Cell, Row, Table};
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("variable"))
            .with_cell(Cell::from("source"))
            .with_cell(Cell::from("codes")),
    );
    for variable in plan.variables() {
        let (source, codes) = describe(&variable.def);
        table.add_row(
            Row::new()
                .with_cell(Cell::from(variable.name.to_string()))
                .with_cell(Cell::from(source))
                .with_cell(Cell::from(codes)),
        );
    }
    println!("{}", table.for_terminal());
    println!(
        "population: {} variables, index date {}",
        plan.variables().len(),
        plan.index_date()
    );

    if let Some(path) = &opt.json {
        fs::write(path, plan.to_json()?)
            .with_context(|| format!("writing \"{}\"", path.display()))?;
        event!(Level::INFO, "wrote compiled plan to \"{}\"", path.display());
    }
    Ok(())
}

fn describe(def: &VariableDef) -> (String, String) {
    match def {
        VariableDef::Events(query) => {
            let policy = match query.policy {
                MatchPolicy::First => "first",
                MatchPolicy::Last => "last",
                MatchPolicy::Any => "any",
            };
            let returning = match &query.returning {
                Returning::Date { .. } => "date",
                Returning::Category => "category",
                Returning::NumericValue { .. } => "numeric value",
                Returning::Exists => "exists",
            };
            let codes = match (&query.codelist, &query.target_disease) {
                (Some(codelist), _) => codelist.to_string(),
                (None, Some(disease)) => format!("vaccinations for {disease}"),
                (None, None) => String::new(),
            };
            (format!("events ({policy}, {returning})"), codes)
        }
        VariableDef::AgeAsOf => ("age at index date".into(), String::new()),
        VariableDef::Sex => ("sex".into(), String::new()),
        VariableDef::AdminField { field, .. } => {
            (format!("registration field {field:?}"), String::new())
        }
        VariableDef::CareHomeStatus { rules, .. } => (
            format!("care home rules ({} arms + default)", rules.len()),
            String::new(),
        ),
        VariableDef::RegisteredBetween { start, end } => {
            (format!("registered {start}..{end}"), String::new())
        }
        VariableDef::Satisfying { expr } => (
            "derived flag".into(),
            expr.names()
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ),
    }
}
