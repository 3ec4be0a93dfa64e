pub mod codes;
pub mod covid;
pub mod driver;
pub mod expect;
pub mod expr;
pub mod resolve;
pub mod study;
pub mod synth;
#[cfg(test)]
pub(crate) mod test_util;
mod util;

pub use anyhow::{Context, Error};
use chrono::{Datelike, NaiveDate};
use itertools::Either;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs, io, iter,
    ops::Deref,
    path::Path,
    sync::Arc,
};

pub use crate::{
    codes::{Codelist, CodingSystem},
    driver::{run, PatientSource, RecordsSource, RunOptions, RunSummary},
    expr::{Expr, Value},
    study::{StudyDefinition, StudyPlan, Variable},
    synth::SyntheticSource,
};
use crate::util::{bool_01, opt_bool_01, optional_date, optional_f64, optional_i64, optional_string};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = u64;

#[derive(Debug, Clone, Deserialize)]
struct PatientRaw {
    #[serde(rename = "PatID")]
    patient_id: PatientId,
    #[serde(rename = "DateOfBirth")]
    date_of_birth: NaiveDate,
    #[serde(rename = "Sex")]
    sex: Sex,
    #[serde(rename = "IMD", deserialize_with = "optional_i64")]
    imd: Option<i64>,
    #[serde(rename = "STP", deserialize_with = "optional_string")]
    stp: Option<ArcStr>,
    #[serde(rename = "Region", deserialize_with = "optional_string")]
    region: Option<ArcStr>,
    #[serde(rename = "MSOA", deserialize_with = "optional_string")]
    msoa: Option<ArcStr>,
    #[serde(rename = "RuralUrban", deserialize_with = "optional_string")]
    rural_urban: Option<ArcStr>,
    #[serde(rename = "HouseholdID", deserialize_with = "optional_i64")]
    household_id: Option<i64>,
    #[serde(rename = "HouseholdSize", deserialize_with = "optional_i64")]
    household_size: Option<i64>,
    #[serde(rename = "PracticeID", deserialize_with = "optional_i64")]
    practice_id: Option<i64>,
    #[serde(rename = "TppHousehold", deserialize_with = "opt_bool_01")]
    tpp_household: Option<bool>,
    #[serde(rename = "TppCoverage", deserialize_with = "optional_f64")]
    tpp_coverage: Option<f64>,
    #[serde(rename = "IsPotentialCareHome", deserialize_with = "bool_01")]
    is_potential_care_home: bool,
    #[serde(rename = "LocationRequiresNursing", deserialize_with = "optional_string")]
    location_requires_nursing: Option<ArcStr>,
    #[serde(
        rename = "LocationDoesNotRequireNursing",
        deserialize_with = "optional_string"
    )]
    location_does_not_require_nursing: Option<ArcStr>,
    #[serde(rename = "RegisteredFrom", deserialize_with = "optional_date")]
    registered_from: Option<NaiveDate>,
    #[serde(rename = "RegisteredTo", deserialize_with = "optional_date")]
    registered_to: Option<NaiveDate>,
}

/// A row in the patients dataset.
///
/// In this and future datastructures, `patient_id` (PatID) always identifies the same patient.
///
/// The administrative fields (practice, household, address classification) come from the EHR
/// system's registration tables rather than the coded event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: PatientId,
    pub date_of_birth: NaiveDate,
    pub sex: Sex,
    pub imd: Option<i64>,
    pub stp: Option<ArcStr>,
    pub region: Option<ArcStr>,
    pub msoa: Option<ArcStr>,
    pub rural_urban: Option<ArcStr>,
    pub household_id: Option<i64>,
    pub household_size: Option<i64>,
    pub practice_id: Option<i64>,
    pub tpp_household: Option<bool>,
    pub tpp_coverage: Option<f64>,
    pub is_potential_care_home: bool,
    /// 'Y' or 'N' where the address is a potential care home, otherwise missing.
    pub location_requires_nursing: Option<ArcStr>,
    pub location_does_not_require_nursing: Option<ArcStr>,
    /// Start of the patient's current continuous registration with one practice.
    pub registered_from: Option<NaiveDate>,
    /// End of that registration. Missing means still registered.
    pub registered_to: Option<NaiveDate>,
}

impl From<PatientRaw> for Patient {
    fn from(from: PatientRaw) -> Self {
        Self {
            patient_id: from.patient_id,
            date_of_birth: from.date_of_birth,
            sex: from.sex,
            imd: from.imd,
            stp: from.stp,
            region: from.region,
            msoa: from.msoa,
            rural_urban: from.rural_urban,
            household_id: from.household_id,
            household_size: from.household_size,
            practice_id: from.practice_id,
            tpp_household: from.tpp_household,
            tpp_coverage: from.tpp_coverage,
            is_potential_care_home: from.is_potential_care_home,
            location_requires_nursing: from.location_requires_nursing,
            location_does_not_require_nursing: from.location_does_not_require_nursing,
            registered_from: from.registered_from,
            registered_to: from.registered_to,
        }
    }
}

/// Names from the registration tables that study expressions may reference directly
/// (used by the care home categorisation rules).
pub const ADMIN_FIELDS: &[&str] = &[
    "IsPotentialCareHome",
    "LocationRequiresNursing",
    "LocationDoesNotRequireNursing",
];

impl Patient {
    /// Age in whole years on the given date.
    pub fn age_at(&self, date: NaiveDate) -> i64 {
        let mut age = i64::from(date.year() - self.date_of_birth.year());
        if (date.month(), date.day()) < (self.date_of_birth.month(), self.date_of_birth.day()) {
            age -= 1;
        }
        age
    }

    /// Continuously registered with one practice for the whole of `start..=end`.
    pub fn registered_throughout(&self, start: NaiveDate, end: NaiveDate) -> bool {
        match self.registered_from {
            Some(from) if from <= start => self.registered_to.map_or(true, |to| to >= end),
            _ => false,
        }
    }

    /// Look up one of [`ADMIN_FIELDS`] as an expression value.
    ///
    /// Returns `None` for names that are not administrative fields, so callers can fall
    /// back to study variables.
    pub fn admin_value(&self, name: &str) -> Option<expr::Value> {
        use expr::Value;
        match name {
            "IsPotentialCareHome" => Some(Value::Bool(self.is_potential_care_home)),
            "LocationRequiresNursing" => Some(
                self.location_requires_nursing
                    .clone()
                    .map_or(Value::Missing, Value::Str),
            ),
            "LocationDoesNotRequireNursing" => Some(
                self.location_does_not_require_nursing
                    .clone()
                    .map_or(Value::Missing, Value::Str),
            ),
            _ => None,
        }
    }
}

/// The parsed list of patients, with a pre-built index for the `patient_id` field.
#[derive(Clone)]
pub struct Patients {
    els: Arc<Vec<Patient>>,
    id_idx: BTreeMap<PatientId, usize>,
}

impl Patients {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw: Vec<PatientRaw> = load_csv(path)?;
        Ok(Self::new(raw.into_iter().map(Into::into).collect()))
    }

    pub fn find_by_id(&self, id: PatientId) -> Option<&Patient> {
        let idx = self.id_idx.get(&id)?;
        self.els.get(*idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patient> + '_ {
        self.els.iter()
    }

    pub fn filter(&self, f: impl Fn(&Patient) -> bool) -> Self {
        Self::new(self.iter().filter(|p| f(p)).cloned().collect())
    }

    pub fn new(els: Vec<Patient>) -> Self {
        let mut this = Patients {
            els: els.into(),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.id_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            self.id_idx.insert(el.patient_id, idx);
        }
    }
}

impl Deref for Patients {
    type Target = [Patient];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Patient> for Patients {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Patient>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Which EHR table a coded event came from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Clinical,
    Medication,
    Vaccination,
}

#[derive(Debug, Deserialize)]
struct EventRaw {
    #[serde(rename = "PatID")]
    patient_id: PatientId,
    #[serde(rename = "EntryDate")]
    date: NaiveDate,
    #[serde(rename = "Kind")]
    kind: EventKind,
    #[serde(rename = "Code")]
    code: ArcStr,
    #[serde(rename = "NumericValue", deserialize_with = "optional_f64")]
    numeric_value: Option<f64>,
    #[serde(rename = "TargetDisease", deserialize_with = "optional_string")]
    target_disease: Option<ArcStr>,
}

/// A row in the events dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub patient_id: PatientId,
    pub date: NaiveDate,
    pub kind: EventKind,
    pub code: ArcStr,
    /// Test result or measurement attached to the code, where one exists.
    pub numeric_value: Option<f64>,
    /// Only present on vaccination records.
    pub target_disease: Option<ArcStr>,
}

impl From<EventRaw> for Event {
    fn from(raw: EventRaw) -> Self {
        Event {
            patient_id: raw.patient_id,
            date: raw.date,
            kind: raw.kind,
            code: raw.code,
            numeric_value: raw.numeric_value,
            target_disease: raw.target_disease,
        }
    }
}

/// The parsed list of events, with a pre-built index for the `patient_id` field.
#[derive(Clone)]
pub struct Events {
    els: Arc<Vec<Event>>,
    id_idx: BTreeMap<PatientId, Vec<usize>>,
}

impl Events {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw: Vec<EventRaw> = load_csv(path)?;
        Ok(Self::new(raw.into_iter().map(Into::into).collect()))
    }

    pub fn events_for_patient(
        &self,
        patient_id: PatientId,
    ) -> impl Iterator<Item = &Event> + Clone + '_ {
        let evt_idxs = match self.id_idx.get(&patient_id) {
            Some(idxs) => idxs,
            None => return Either::Left(iter::empty()),
        };
        Either::Right(evt_idxs.iter().map(|idx| {
            self.els
                .get(*idx)
                .expect("inconsistent event patient_id index")
        }))
    }

    /// Iterate over events in this store.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.els.iter()
    }

    /// Get an `Events` object containing only events that match the filter.
    pub fn filter(&self, f: impl Fn(&Event) -> bool) -> Self {
        Self::new(self.iter().filter(|e| f(e)).cloned().collect())
    }

    pub fn new(els: Vec<Event>) -> Self {
        let mut this = Events {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_id_map();
        this
    }

    fn rebuild_id_map(&mut self) {
        self.id_idx.clear();
        for (idx, event) in self.els.iter().enumerate() {
            self.id_idx
                .entry(event.patient_id)
                .or_insert_with(Vec::new)
                .push(idx);
        }
    }
}

impl Deref for Events {
    type Target = [Event];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a> IntoIterator for &'a Events {
    type IntoIter = <&'a [Event] as IntoIterator>::IntoIter;
    type Item = &'a Event;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl FromIterator<Event> for Events {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Event>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Sex is encoded 'M' or 'F'. No other values exist in the data. If another value
/// is added in the future, this will throw an error, forcing us to handle the situation.
///
/// Ordering is arbitrary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
pub enum Sex {
    #[serde(rename = "M", alias = "m")]
    Male,
    #[serde(rename = "F", alias = "f")]
    Female,
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sex::Male => f.write_str("M"),
            Sex::Female => f.write_str("F"),
        }
    }
}

/// Load a CSV extract into memory.
fn load_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader)
            .into_deserialize()
            .collect::<Result<Vec<T>, _>>()
            .map_err(Into::into)
    }
    let path = path.as_ref();
    inner(path).with_context(|| format!("while loading \"{}\"", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{date, test_event, test_patient};

    #[test]
    fn age_counts_whole_years() {
        let mut patient = test_patient(1, date(2002, 2, 2));
        assert_eq!(patient.age_at(date(2020, 2, 1)), 17);
        assert_eq!(patient.age_at(date(2020, 2, 2)), 18);
        patient.date_of_birth = date(2000, 1, 1);
        assert_eq!(patient.age_at(date(2020, 2, 1)), 20);
    }

    #[test]
    fn registration_covers_whole_window() {
        let mut patient = test_patient(1, date(1980, 1, 1));
        patient.registered_from = Some(date(2018, 5, 1));
        patient.registered_to = None;
        assert!(patient.registered_throughout(date(2019, 2, 1), date(2020, 2, 1)));

        patient.registered_to = Some(date(2019, 12, 1));
        assert!(!patient.registered_throughout(date(2019, 2, 1), date(2020, 2, 1)));

        patient.registered_from = Some(date(2019, 3, 1));
        patient.registered_to = None;
        assert!(!patient.registered_throughout(date(2019, 2, 1), date(2020, 2, 1)));
    }

    #[test]
    fn events_indexed_by_patient() {
        let events = Events::new(vec![
            test_event(1, date(2020, 1, 1), "XE2q5"),
            test_event(2, date(2020, 1, 2), "XE2q5"),
            test_event(1, date(2020, 1, 3), "H33.."),
        ]);
        let for_1: Vec<_> = events.events_for_patient(1).collect();
        assert_eq!(for_1.len(), 2);
        assert!(events.events_for_patient(3).next().is_none());
    }
}
