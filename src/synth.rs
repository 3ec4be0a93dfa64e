//! Expectation-driven synthetic patients.
//!
//! Synthetic mode lets a study definition be compiled, executed and fed to downstream
//! tooling without access to real records: every variable's value is drawn from its
//! declared expectations instead of queried from data. The population expression still
//! applies, so the output has the same shape and roughly the same composition as a
//! real extract.
//!
//! Draws are keyed on (seed, patient id), so a given seed reproduces the same cohort
//! whatever order the driver processes patients in.

use chrono::NaiveDate;
use rand::{distributions::Distribution as _, rngs::StdRng, Rng, SeedableRng};
use statrs::distribution::{Exp, Normal, Uniform};
use std::collections::BTreeMap;

use crate::{
    driver::{PatientSource, SourceError},
    expect::{CategoryRatios, DateRange, Expectations, NumberDist, Rate},
    expr::Value,
    resolve::Payload,
    study::{StudyPlan, ValueKind, Variable, VariableDef},
    ArcStr, Patient, PatientId, Patients, Sex,
};

pub struct SyntheticSource {
    plan: StudyPlan,
    patients: Patients,
    seed: u64,
}

impl SyntheticSource {
    pub fn new(plan: StudyPlan, count: usize, seed: u64) -> Self {
        let index_date = plan.index_date();
        let patients = (1..=count as PatientId)
            .map(|id| synthetic_patient(id, seed, index_date))
            .collect();
        SyntheticSource {
            plan,
            patients,
            seed,
        }
    }

    fn draw_all(&self, patient_id: PatientId) -> BTreeMap<ArcStr, Value> {
        let mut rng = patient_rng(self.seed, patient_id, 1);
        let mut drawn = BTreeMap::new();
        for variable in self.plan.variables() {
            // flags over other variables are computed, not drawn
            if matches!(variable.def, VariableDef::Satisfying { .. }) {
                continue;
            }
            let expectations = variable
                .expectations
                .as_ref()
                .unwrap_or_else(|| self.plan.default_expectations());
            if rng.gen::<f64>() >= expectations.effective_incidence() {
                continue;
            }
            let value = draw_value(
                &mut rng,
                variable,
                expectations,
                self.plan.index_date(),
            );
            drawn.insert(variable.name.clone(), value);
            if variable.match_date.is_some() {
                let date = draw_date(&mut rng, expectations, self.plan.index_date());
                drawn.insert(variable.match_date_column(), Value::Date(date));
            }
        }
        drawn
    }
}

impl PatientSource for SyntheticSource {
    fn patients(&self) -> &Patients {
        &self.patients
    }

    fn fetch(&self, patient: &Patient) -> Result<Payload, SourceError> {
        Ok(Payload::Drawn(self.draw_all(patient.patient_id)))
    }
}

/// A demographic shell for the roster. The interesting values are drawn per variable
/// in [`SyntheticSource::fetch`]; this just gives the driver ids to iterate.
fn synthetic_patient(id: PatientId, seed: u64, index_date: NaiveDate) -> Patient {
    let mut rng = patient_rng(seed, id, 0);
    let age = rng.gen_range(0..=104);
    let date_of_birth = crate::study::Anchor::IndexOffset(-age, crate::study::DateUnit::Years)
        .resolve(index_date);
    Patient {
        patient_id: id,
        date_of_birth,
        sex: if rng.gen_bool(0.49) {
            Sex::Male
        } else {
            Sex::Female
        },
        imd: None,
        stp: None,
        region: None,
        msoa: None,
        rural_urban: None,
        household_id: None,
        household_size: None,
        practice_id: None,
        tpp_household: None,
        tpp_coverage: None,
        is_potential_care_home: false,
        location_requires_nursing: None,
        location_does_not_require_nursing: None,
        registered_from: None,
        registered_to: None,
    }
}

fn patient_rng(seed: u64, patient_id: PatientId, stream: u64) -> StdRng {
    StdRng::seed_from_u64(
        seed ^ patient_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ stream.wrapping_shl(32),
    )
}

fn draw_value(
    rng: &mut StdRng,
    variable: &Variable,
    expectations: &Expectations,
    index_date: NaiveDate,
) -> Value {
    match variable.def.value_kind() {
        ValueKind::Bool => Value::Bool(true),
        ValueKind::Date => Value::Date(draw_date(rng, expectations, index_date)),
        ValueKind::Float => Value::Float(draw_number(rng, expectations)),
        // Integer variables are sometimes declared with category ratios of numeric
        // labels (the IMD buckets); honour those when no distribution is given.
        ValueKind::Int => match (&expectations.number, &expectations.category) {
            (None, Some(ratios)) => draw_category(rng, ratios)
                .and_then(|label| label.parse::<i64>().ok())
                .map_or(Value::Missing, Value::Int),
            _ => Value::Int(draw_number(rng, expectations).round() as i64),
        },
        ValueKind::Str => match &expectations.category {
            Some(ratios) => {
                draw_category(rng, ratios).map_or(Value::Missing, |label| Value::Str(label.into()))
            }
            None => Value::Missing,
        },
    }
}

fn draw_category<'a>(rng: &mut StdRng, ratios: &'a CategoryRatios) -> Option<&'a str> {
    let mut pick = rng.gen::<f64>();
    let mut chosen = None;
    for (label, ratio) in ratios.iter() {
        chosen = Some(label);
        if pick < ratio {
            break;
        }
        pick -= ratio;
    }
    chosen
}

fn draw_number(rng: &mut StdRng, expectations: &Expectations) -> f64 {
    match expectations.number {
        Some(NumberDist::Normal { mean, stddev }) => Normal::new(mean, stddev)
            .map(|dist| dist.sample(rng))
            .unwrap_or(mean),
        Some(NumberDist::Uniform { low, high }) => Uniform::new(low, high)
            .map(|dist| dist.sample(rng))
            .unwrap_or(low),
        Some(NumberDist::Exponential { lambda }) => Exp::new(lambda)
            .map(|dist| dist.sample(rng))
            .unwrap_or(0.0),
        Some(NumberDist::PopulationAges) => draw_population_age(rng),
        None => 0.0,
    }
}

/// A rough UK age pyramid, in (upper age, cumulative share) steps.
fn draw_population_age(rng: &mut StdRng) -> f64 {
    const STEPS: &[(i64, f64)] = &[
        (17, 0.21),
        (29, 0.37),
        (49, 0.63),
        (69, 0.87),
        (104, 1.0),
    ];
    let pick = rng.gen::<f64>();
    let mut lower = 0;
    for &(upper, cumulative) in STEPS {
        if pick < cumulative {
            return rng.gen_range(lower..=upper) as f64;
        }
        lower = upper + 1;
    }
    104.0
}

fn draw_date(
    rng: &mut StdRng,
    expectations: &Expectations,
    index_date: NaiveDate,
) -> NaiveDate {
    let fallback = DateRange {
        earliest: crate::expect::DateBound::Date(
            NaiveDate::from_ymd_opt(1900, 1, 1).expect("valid date"),
        ),
        latest: crate::expect::DateBound::Index,
    };
    let range = expectations.date.unwrap_or(fallback);
    let earliest = range.earliest.resolve(index_date);
    let latest = range.latest.resolve(index_date).max(earliest);
    let span = (latest - earliest).num_days();

    let fraction = match expectations.rate {
        // bunch dates toward the end of the range
        Rate::ExponentialIncrease => {
            let drawn = Exp::new(4.0)
                .map(|dist| dist.sample(rng))
                .unwrap_or(0.0);
            1.0 - drawn.min(1.0)
        }
        _ => rng.gen::<f64>(),
    };
    let offset = ((span as f64) * fraction).round() as i64;
    earliest + chrono::Duration::days(offset.clamp(0, span))
}
