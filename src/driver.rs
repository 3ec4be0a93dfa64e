//! The extraction driver: streams patients through the resolver and assembles the
//! output table.
//!
//! Patients are independent units of work, so they are processed on the rayon pool.
//! The compiled plan and the data source are shared read-only; the only shared mutable
//! state is the output writer, which serialises row appends behind a mutex. A row is
//! written in a single append, so row emission is all-or-nothing. Row order carries no
//! meaning.
//!
//! A single patient's failure is recorded and the patient excluded; the run carries
//! on. Only a plan that failed to compile (upstream of this module) aborts a run.

use parking_lot::Mutex;
use qu::ick_use::*;
use rayon::prelude::*;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;

use crate::{
    expr::Value,
    resolve::{resolve_patient, Payload, SubjectBindings},
    study::{DateFormat, Returning, StudyPlan, Variable, VariableDef},
    ArcStr, Events, Patient, PatientId, Patients,
};

/// A data source failure for one patient's fetch.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Worth retrying: connectivity and the like.
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("source failure: {0}")]
    Permanent(String),
}

/// An opaque cursor over the patients to extract.
///
/// The engine never mutates what a source hands out. `fetch` may be called more than
/// once for the same patient (retries), so it must be idempotent.
pub trait PatientSource: Sync {
    /// The roster of patients to consider.
    fn patients(&self) -> &Patients;

    /// The extraction payload for one patient.
    fn fetch(&self, patient: &Patient) -> Result<Payload, SourceError>;
}

/// Real mode: loaded patient and event tables.
///
/// In production the fetch would be a query against the EHR vendor's API keyed by
/// patient, code set and window; here the whole extract is in memory and fetch is a
/// per-patient slice of it.
pub struct RecordsSource {
    patients: Patients,
    events: Events,
}

impl RecordsSource {
    pub fn new(patients: Patients, events: Events) -> Self {
        RecordsSource { patients, events }
    }

    pub fn load(
        patients_path: impl AsRef<std::path::Path>,
        events_path: impl AsRef<std::path::Path>,
    ) -> crate::Result<Self> {
        Ok(Self::new(
            Patients::load(patients_path)?,
            Events::load(events_path)?,
        ))
    }
}

impl PatientSource for RecordsSource {
    fn patients(&self) -> &Patients {
        &self.patients
    }

    fn fetch(&self, patient: &Patient) -> Result<Payload, SourceError> {
        Ok(Payload::Events(
            self.events
                .events_for_patient(patient.patient_id)
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bounded retries for transient source failures before the patient is failed.
    pub source_retries: usize,
    /// Backoff between retries, scaled linearly by attempt number.
    pub retry_backoff: Duration,
    /// How many per-patient error messages to keep verbatim in the summary.
    pub error_samples: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            source_retries: 3,
            retry_backoff: Duration::from_millis(250),
            error_samples: 10,
        }
    }
}

/// Cooperative cancellation for a whole run.
///
/// Cancelling stops dispatch of further patients; a patient mid-resolution finishes
/// without emitting its row, so the output never contains a partial row.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What happened, reported at the end of every run. Errors are aggregated here,
/// never silently dropped.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub patients: usize,
    pub rows: usize,
    /// Excluded by the population expression (expected, not an error).
    pub excluded: usize,
    /// Per-patient resolution or source failures.
    pub failed: usize,
    pub error_samples: Vec<(PatientId, String)>,
}

impl RunSummary {
    pub fn term_table(&self) -> term_data_table::Table {
        use term_data_table::{Cell, Row, Table};
        let mut table = Table::new();
        let mut push = |label: &str, n: usize| {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(label.to_string()))
                    .with_cell(Cell::from(n.to_string())),
            );
        };
        push("patients processed", self.patients);
        push("rows written", self.rows);
        push("excluded by population", self.excluded);
        push("failed", self.failed);
        table
    }
}

/// Extract one row per qualifying patient into `out` as CSV.
///
/// Column order is `patient_id` followed by the variables in declaration order (with
/// companion date columns directly after their variable).
pub fn run(
    plan: &StudyPlan,
    source: &dyn PatientSource,
    out: impl io::Write + Send,
    options: &RunOptions,
    cancel: &CancelToken,
) -> crate::Result<RunSummary> {
    let columns = plan.columns();
    let formats: Vec<ColumnFormat> = columns
        .iter()
        .map(|name| ColumnFormat::for_column(plan, name))
        .collect();

    let mut wtr = csv::Writer::from_writer(out);
    let header = std::iter::once("patient_id")
        .chain(columns.iter().map(|c| &**c))
        .collect::<Vec<_>>();
    wtr.write_record(&header)
        .context("writing output header")?;

    let wtr = Mutex::new(wtr);
    let summary = Mutex::new(RunSummary::default());

    source.patients().par_iter().for_each(|patient| {
        if cancel.is_cancelled() {
            return;
        }
        let outcome = process_patient(plan, source, patient, options);
        match outcome {
            Ok(Some(resolved)) => {
                let mut record = Vec::with_capacity(columns.len() + 1);
                record.push(patient.patient_id.to_string());
                for (name, format) in columns.iter().zip(&formats) {
                    let value = resolved.get(name).unwrap_or(&Value::Missing);
                    record.push(format.render(value));
                }
                if cancel.is_cancelled() {
                    return;
                }
                // single append under the lock: the row is all-or-nothing
                let mut wtr = wtr.lock();
                if let Err(error) = wtr.write_record(&record) {
                    event!(
                        Level::ERROR,
                        "failed writing row for patient {}: {}",
                        patient.patient_id,
                        error
                    );
                    let mut summary = summary.lock();
                    summary.patients += 1;
                    summary.failed += 1;
                    return;
                }
                let mut summary = summary.lock();
                summary.patients += 1;
                summary.rows += 1;
            }
            Ok(None) => {
                let mut summary = summary.lock();
                summary.patients += 1;
                summary.excluded += 1;
            }
            Err(message) => {
                event!(
                    Level::WARN,
                    "patient {} excluded: {}",
                    patient.patient_id,
                    message
                );
                let mut summary = summary.lock();
                summary.patients += 1;
                summary.failed += 1;
                if summary.error_samples.len() < options.error_samples {
                    summary.error_samples.push((patient.patient_id, message));
                }
            }
        }
    });

    let mut wtr = wtr.into_inner();
    wtr.flush().context("flushing output")?;
    Ok(summary.into_inner())
}

/// Resolve one patient. `Ok(None)` means excluded by the population expression;
/// `Err` is a per-patient failure (already formatted for the summary).
fn process_patient(
    plan: &StudyPlan,
    source: &dyn PatientSource,
    patient: &Patient,
    options: &RunOptions,
) -> Result<Option<std::collections::BTreeMap<ArcStr, Value>>, String> {
    let payload = fetch_with_retry(source, patient, options)?;
    let resolved =
        resolve_patient(plan, patient, &payload).map_err(|e| render_error(&e))?;
    let bindings = SubjectBindings {
        patient,
        resolved: &resolved,
    };
    let include = plan
        .population()
        .eval_bool(&bindings)
        .map_err(|e| render_error(&e))?;
    Ok(include.then_some(resolved))
}

fn fetch_with_retry(
    source: &dyn PatientSource,
    patient: &Patient,
    options: &RunOptions,
) -> Result<Payload, String> {
    let mut attempt = 0;
    loop {
        match source.fetch(patient) {
            Ok(payload) => return Ok(payload),
            Err(SourceError::Transient(message)) if attempt < options.source_retries => {
                attempt += 1;
                event!(
                    Level::DEBUG,
                    "retrying fetch for patient {} (attempt {}): {}",
                    patient.patient_id,
                    attempt,
                    message
                );
                thread::sleep(options.retry_backoff * attempt as u32);
            }
            Err(error) => return Err(render_error(&error)),
        }
    }
}

fn render_error(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Per-column formatting decided once, up front.
struct ColumnFormat {
    date_format: DateFormat,
}

impl ColumnFormat {
    fn for_column(plan: &StudyPlan, name: &str) -> Self {
        let date_format = match plan.find(name) {
            Some(variable) => variable_date_format(variable),
            // companion "<name>_date" column
            None => name
                .strip_suffix("_date")
                .and_then(|prefix| plan.find(prefix))
                .and_then(|variable| variable.match_date)
                .unwrap_or(DateFormat::YearMonthDay),
        };
        ColumnFormat { date_format }
    }

    fn render(&self, value: &Value) -> String {
        match value {
            Value::Missing => String::new(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Date(d) => self.date_format.format(*d),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Str(s) => s.to_string(),
        }
    }
}

fn variable_date_format(variable: &Variable) -> DateFormat {
    match &variable.def {
        VariableDef::Events(query) => match &query.returning {
            Returning::Date { format } => *format,
            _ => DateFormat::YearMonthDay,
        },
        _ => DateFormat::YearMonthDay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codes::{Codelist, CodingSystem},
        study::{Anchor, DateUnit, EventQuery, StudyDefinition, Window},
        test_util::{date, medication, test_event, test_patient},
    };
    use std::sync::atomic::AtomicUsize;

    fn flu_study() -> StudyPlan {
        let flu_med = Codelist::new(
            "flu_med",
            CodingSystem::Snomed,
            ["10939881000001108"],
        )
        .unwrap();
        let flu_clinical = Codelist::new("flu_clinical", CodingSystem::Ctv3, ["65E.."]).unwrap();
        let season = Window::between(Anchor::IndexOffset(-6, DateUnit::Months), Anchor::Index);
        StudyDefinition::new(date(2020, 2, 1), "age >= 18 AND has_follow_up")
            .unwrap()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::registered_between(
                "has_follow_up",
                date(2019, 2, 1),
                date(2020, 2, 1),
            ))
            .variable(Variable::events(
                "flu_vaccine_med",
                EventQuery::medications(&flu_med).window(season),
            ))
            .variable(Variable::events(
                "flu_vaccine_clinical",
                EventQuery::clinical(&flu_clinical).window(season),
            ))
            .variable(
                Variable::satisfying(
                    "flu_vaccine",
                    "flu_vaccine_med OR flu_vaccine_clinical",
                )
                .unwrap(),
            )
            .compile()
            .unwrap()
    }

    fn registered(mut patient: Patient) -> Patient {
        patient.registered_from = Some(date(2018, 1, 1));
        patient
    }

    fn run_to_string(plan: &StudyPlan, source: &dyn PatientSource) -> (String, RunSummary) {
        let mut buf = Vec::new();
        let summary = run(
            plan,
            source,
            &mut buf,
            &RunOptions {
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            &CancelToken::new(),
        )
        .unwrap();
        (String::from_utf8(buf).unwrap(), summary)
    }

    fn rows_by_id(output: &str) -> std::collections::BTreeMap<String, Vec<String>> {
        let mut lines = output.lines();
        let _header = lines.next().unwrap();
        lines
            .map(|line| {
                let fields: Vec<String> = line.split(',').map(|f| f.to_string()).collect();
                (fields[0].clone(), fields)
            })
            .collect()
    }

    #[test]
    fn end_to_end_population_and_defaults() {
        let plan = flu_study();
        // 17 at the index date: out, whatever else is true
        let minor = registered(test_patient(1, date(2002, 3, 1)));
        // adult, no flu events at all: in, with flu_vaccine = 0
        let unvaccinated = registered(test_patient(2, date(1990, 1, 1)));
        // adult with a flu jab prescription in season: in, flu_vaccine = 1
        let vaccinated = registered(test_patient(3, date(1985, 6, 15)));
        // adult but registration starts mid-window: out
        let mut unregistered = test_patient(4, date(1970, 1, 1));
        unregistered.registered_from = Some(date(2019, 6, 1));

        let events = Events::new(vec![medication(
            3,
            date(2019, 11, 2),
            "10939881000001108",
        )]);
        let source = RecordsSource::new(
            Patients::new(vec![minor, unvaccinated, vaccinated, unregistered]),
            events,
        );

        let (output, summary) = run_to_string(&plan, &source);
        assert_eq!(summary.patients, 4);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.excluded, 2);
        assert_eq!(summary.failed, 0);

        let header = output.lines().next().unwrap();
        assert_eq!(
            header,
            "patient_id,age,has_follow_up,flu_vaccine_med,flu_vaccine_clinical,flu_vaccine"
        );

        let rows = rows_by_id(&output);
        assert!(!rows.contains_key("1"));
        assert!(!rows.contains_key("4"));
        // missing flu data resolves to the declared default, not an error
        assert_eq!(rows["2"][5], "0");
        assert_eq!(rows["3"][5], "1");
    }

    /// A source that fails transiently a fixed number of times per fetch batch.
    struct FlakySource {
        inner: RecordsSource,
        failures: AtomicUsize,
    }

    impl PatientSource for FlakySource {
        fn patients(&self) -> &Patients {
            self.inner.patients()
        }

        fn fetch(&self, patient: &Patient) -> Result<Payload, SourceError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n > 0).then(|| n - 1)
                })
                .is_ok()
            {
                return Err(SourceError::Transient("connection reset".into()));
            }
            self.inner.fetch(patient)
        }
    }

    #[test]
    fn transient_failures_are_retried() {
        let plan = flu_study();
        let patient = registered(test_patient(1, date(1980, 1, 1)));
        let source = FlakySource {
            inner: RecordsSource::new(Patients::new(vec![patient]), Events::new(vec![])),
            failures: AtomicUsize::new(2),
        };
        let (_, summary) = run_to_string(&plan, &source);
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.failed, 0);
    }

    /// A source that always fails for one particular patient.
    struct PartialSource {
        inner: RecordsSource,
        poison: PatientId,
    }

    impl PatientSource for PartialSource {
        fn patients(&self) -> &Patients {
            self.inner.patients()
        }

        fn fetch(&self, patient: &Patient) -> Result<Payload, SourceError> {
            if patient.patient_id == self.poison {
                return Err(SourceError::Permanent("corrupt record".into()));
            }
            self.inner.fetch(patient)
        }
    }

    #[test]
    fn one_bad_patient_does_not_abort_the_run() {
        let plan = flu_study();
        let source = PartialSource {
            inner: RecordsSource::new(
                Patients::new(vec![
                    registered(test_patient(1, date(1980, 1, 1))),
                    registered(test_patient(2, date(1985, 1, 1))),
                ]),
                Events::new(vec![]),
            ),
            poison: 1,
        };
        let (output, summary) = run_to_string(&plan, &source);
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.error_samples.len(), 1);
        assert_eq!(summary.error_samples[0].0, 1);
        let rows = rows_by_id(&output);
        assert!(rows.contains_key("2"));
        assert!(!rows.contains_key("1"));
    }

    #[test]
    fn cancelled_run_emits_no_rows() {
        let plan = flu_study();
        let source = RecordsSource::new(
            Patients::new(vec![registered(test_patient(1, date(1980, 1, 1)))]),
            Events::new(vec![]),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut buf = Vec::new();
        let summary = run(
            &plan,
            &source,
            &mut buf,
            &RunOptions::default(),
            &cancel,
        )
        .unwrap();
        assert_eq!(summary.rows, 0);
        // header only
        assert_eq!(String::from_utf8(buf).unwrap().lines().count(), 1);
    }

    #[test]
    fn events_are_used_in_real_mode() {
        let plan = flu_study();
        let source = RecordsSource::new(
            Patients::new(vec![registered(test_patient(7, date(1975, 4, 4)))]),
            Events::new(vec![test_event(7, date(2019, 10, 1), "65E..")]),
        );
        let (output, _) = run_to_string(&plan, &source);
        let rows = rows_by_id(&output);
        // flu_vaccine_clinical = 1 and therefore flu_vaccine = 1
        assert_eq!(rows["7"][4], "1");
        assert_eq!(rows["7"][5], "1");
    }
}
