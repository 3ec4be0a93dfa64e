//! Shared fixtures for unit tests.

use crate::{Event, EventKind, Patient, PatientId, Sex};
use chrono::NaiveDate;

pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub(crate) fn test_patient(id: PatientId, date_of_birth: NaiveDate) -> Patient {
    Patient {
        patient_id: id,
        date_of_birth,
        sex: Sex::Female,
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

pub(crate) fn test_event(id: PatientId, date: NaiveDate, code: &str) -> Event {
    Event {
        patient_id: id,
        date,
        kind: EventKind::Clinical,
        code: code.into(),
        numeric_value: None,
        target_disease: None,
    }
}

pub(crate) fn medication(id: PatientId, date: NaiveDate, code: &str) -> Event {
    Event {
        kind: EventKind::Medication,
        ..test_event(id, date, code)
    }
}

pub(crate) fn vaccination(id: PatientId, date: NaiveDate, disease: &str) -> Event {
    Event {
        kind: EventKind::Vaccination,
        target_disease: Some(disease.into()),
        ..test_event(id, date, "")
    }
}
