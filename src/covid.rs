//! The COVID-19 household cohort study definition.
//!
//! This module is the declarative heart of the repository: the codelists and the
//! per-patient variables of the study, expressed through the engine in `study` /
//! `codes`. The CSV codelists are the published OpenCodelists files, fetched into a
//! local directory; the two inline lists are small enough to write out.

use chrono::NaiveDate;
use std::path::Path;

use crate::{
    codes::{Codelist, CodingSystem, LoadError},
    expect::{CategoryRatios, DateBound, Expectations, NumberDist, Rate},
    study::{
        AdminField, Anchor, CompileError, DateFormat, DateUnit, EventQuery, Returning,
        StudyDefinition, Variable, Window,
    },
};

/// The reference date all relative windows are computed against.
pub fn index_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 2, 1).unwrap()
}

/// Every codelist the study reads, loaded once at startup and passed by reference
/// into the study definition.
pub struct CovidCodelists {
    pub covid: Codelist,
    pub covid_death: Codelist,
    pub ethnicity: Codelist,
    pub dementia: Codelist,
    pub chronic_respiratory_disease: Codelist,
    pub chronic_cardiac_disease: Codelist,
    pub diabetes: Codelist,
    pub lung_cancer: Codelist,
    pub haem_cancer: Codelist,
    pub other_cancer: Codelist,
    pub chronic_liver_disease: Codelist,
    pub stroke: Codelist,
    pub creatinine: Codelist,
    /// Chronic kidney disease, incl. dialysis and transplant codes. The `esrf`
    /// variable reads this list; see DESIGN.md for the naming history.
    pub ckd: Codelist,
    pub flu_med: Codelist,
    pub flu_clinical_given: Codelist,
    pub flu_clinical_not_given: Codelist,
}

impl CovidCodelists {
    /// Load the codelists from a directory of published CSVs.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        let dir = dir.as_ref();
        let ctv3 = |file: &str| {
            Codelist::from_csv(dir.join(file), CodingSystem::Ctv3, "CTV3ID", None)
        };
        Ok(CovidCodelists {
            covid: Codelist::new("covid", CodingSystem::Icd10, ["U071", "U072"])?,
            covid_death: Codelist::from_csv(
                dir.join("opensafely-covid-identification.csv"),
                CodingSystem::Icd10,
                "icd10_code",
                None,
            )?,
            ethnicity: Codelist::from_csv(
                dir.join("opensafely-ethnicity.csv"),
                CodingSystem::Ctv3,
                "Code",
                Some("Grouping_6"),
            )?,
            dementia: ctv3("opensafely-dementia.csv")?,
            chronic_respiratory_disease: ctv3("opensafely-chronic-respiratory-disease.csv")?,
            chronic_cardiac_disease: ctv3("opensafely-chronic-cardiac-disease.csv")?,
            diabetes: ctv3("opensafely-diabetes.csv")?,
            lung_cancer: ctv3("opensafely-lung-cancer.csv")?,
            haem_cancer: ctv3("opensafely-haematological-cancer.csv")?,
            other_cancer: ctv3("opensafely-cancer-excluding-lung-and-haematological.csv")?,
            chronic_liver_disease: ctv3("opensafely-chronic-liver-disease.csv")?,
            stroke: ctv3("opensafely-stroke-updated.csv")?,
            creatinine: Codelist::new("creatinine", CodingSystem::Ctv3, ["XE2q5"])?,
            ckd: ctv3("opensafely-chronic-kidney-disease.csv")?,
            flu_med: Codelist::from_csv(
                dir.join("opensafely-influenza-vaccination.csv"),
                CodingSystem::Snomed,
                "snomed_id",
                None,
            )?,
            flu_clinical_given: ctv3(
                "opensafely-influenza-vaccination-clinical-codes-given.csv",
            )?,
            flu_clinical_not_given: ctv3(
                "opensafely-influenza-vaccination-clinical-codes-not-given.csv",
            )?,
        })
    }
}

// Expectation shorthands shared by several variables. A variable that only cares
// about its date range still carries the study-wide rate and incidence.

fn dates_until_index() -> Expectations {
    Expectations::new(Rate::ExponentialIncrease, 0.2)
        .date_between(DateBound::Date(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()), DateBound::Index)
}

fn dates_in_flu_season() -> Expectations {
    Expectations::new(Rate::ExponentialIncrease, 0.2).date_between(
        DateBound::IndexOffset(-6, DateUnit::Months),
        DateBound::Index,
    )
}

fn pseudo_id() -> Expectations {
    Expectations::new(Rate::Uniform, 1.0).number(NumberDist::Normal {
        mean: 1000.0,
        stddev: 200.0,
    })
}

fn universal_categories(ratios: CategoryRatios) -> Expectations {
    Expectations::universal().categories(ratios)
}

/// The full study definition: index date, population rule and every extracted
/// variable, in output column order.
pub fn study_definition(
    codelists: &CovidCodelists,
) -> Result<StudyDefinition, CompileError> {
    let on_or_before_index = Window::on_or_before(Anchor::Index);
    let last_year = Window::between(Anchor::IndexOffset(-1, DateUnit::Years), Anchor::Index);
    let flu_season = Window::between(Anchor::IndexOffset(-6, DateUnit::Months), Anchor::Index);

    let first_date_before_index = |name: &str, codelist: &Codelist| {
        Variable::events(
            name,
            EventQuery::clinical(codelist)
                .window(on_or_before_index)
                .first()
                .returning_date(DateFormat::YearMonth),
        )
    };

    let study = StudyDefinition::new(
        index_date(),
        "(age >= 18) AND \n has_follow_up AND NOT \n care_home_type = 'U'",
    )?
    .default_expectations(
        Expectations::new(Rate::ExponentialIncrease, 0.2)
            .date_between(DateBound::Date(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()), DateBound::Today),
    )
    // population
    .variable(Variable::registered_between(
        "has_follow_up",
        NaiveDate::from_ymd_opt(2019, 2, 1).unwrap(),
        NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
    ))
    // household
    .variable(
        Variable::care_home_status(
            "care_home_type",
            [
                (
                    "PC",
                    "IsPotentialCareHome \n AND LocationDoesNotRequireNursing='Y' \n AND LocationRequiresNursing='N'",
                ),
                (
                    "PN",
                    "IsPotentialCareHome \n AND LocationDoesNotRequireNursing='N' \n AND LocationRequiresNursing='Y'",
                ),
                ("PS", "IsPotentialCareHome"),
            ],
            "U",
        )?
        .with_expectations(universal_categories(
            CategoryRatios::new([("PC", 0.40), ("PN", 0.30), ("PS", 0.30)])
                .expect("ratios sum to 1"),
        )),
    )
    .variable(
        Variable::admin("household_id", AdminField::HouseholdId).with_expectations(pseudo_id()),
    )
    .variable(
        Variable::admin("household_size", AdminField::HouseholdSize).with_expectations(
            Expectations::new(Rate::Uniform, 1.0).number(NumberDist::Normal {
                mean: 3.0,
                stddev: 1.0,
            }),
        ),
    )
    .variable(
        Variable::admin("practice_id", AdminField::PracticePseudoId)
            .with_expectations(pseudo_id()),
    )
    .variable(
        Variable::admin("tpp_household", AdminField::HasMembersInOtherEhrSystems)
            .with_expectations(Expectations::new(Rate::Uniform, 0.75)),
    )
    .variable(
        Variable::admin(
            "tpp_coverage",
            AdminField::PercentageOfMembersWithEhrDataAvailable,
        )
        .with_expectations(
            Expectations::new(Rate::Uniform, 1.0).number(NumberDist::Normal {
                mean: 75.0,
                stddev: 10.0,
            }),
        ),
    )
    // demographics
    .variable(
        Variable::age_as_of("age")
            .with_expectations(Expectations::universal().number(NumberDist::PopulationAges)),
    )
    .variable(
        Variable::sex("sex").with_expectations(universal_categories(
            CategoryRatios::new([("M", 0.49), ("F", 0.51)]).expect("ratios sum to 1"),
        )),
    )
    .variable(
        Variable::events(
            "ethnicity",
            EventQuery::clinical(&codelists.ethnicity)
                .last()
                .returning(Returning::Category),
        )
        .with_match_date(DateFormat::Year)
        .with_expectations(
            Expectations::new(Rate::Uniform, 0.75).categories(
                CategoryRatios::new([("1", 0.8), ("5", 0.1), ("3", 0.1)])
                    .expect("ratios sum to 1"),
            ),
        ),
    )
    // geography
    .variable(
        Variable::admin("stp", AdminField::StpCode).with_expectations(universal_categories(
            CategoryRatios::new([
                ("STP1", 0.1),
                ("STP2", 0.1),
                ("STP3", 0.1),
                ("STP4", 0.1),
                ("STP5", 0.1),
                ("STP6", 0.1),
                ("STP7", 0.1),
                ("STP8", 0.1),
                ("STP9", 0.1),
                ("STP10", 0.1),
            ])
            .expect("ratios sum to 1"),
        )),
    )
    .variable(
        Variable::admin("region", AdminField::Nuts1RegionName).with_expectations(
            universal_categories(
                CategoryRatios::new([
                    ("North East", 0.1),
                    ("North West", 0.1),
                    ("Yorkshire and the Humber", 0.1),
                    ("East Midlands", 0.1),
                    ("West Midlands", 0.1),
                    ("East of England", 0.1),
                    ("London", 0.2),
                    ("South East", 0.2),
                ])
                .expect("ratios sum to 1"),
            ),
        ),
    )
    .variable(
        Variable::admin("msoa", AdminField::MsoaCode).with_expectations(universal_categories(
            CategoryRatios::new([("E02000001", 0.5), ("E02000002", 0.5)])
                .expect("ratios sum to 1"),
        )),
    )
    .variable(
        Variable::admin("rural_urban", AdminField::RuralUrbanClassification).with_expectations(
            universal_categories(
                CategoryRatios::new([("rural", 0.1), ("urban", 0.9)]).expect("ratios sum to 1"),
            ),
        ),
    )
    .variable(
        Variable::admin_rounded("imd", AdminField::Imd, 100).with_expectations(
            universal_categories(
                CategoryRatios::new([("100", 0.1), ("200", 0.2), ("300", 0.7)])
                    .expect("ratios sum to 1"),
            ),
        ),
    )
    // comorbidities
    .variable(
        first_date_before_index("lung_cancer", &codelists.lung_cancer)
            .with_expectations(dates_until_index()),
    )
    .variable(
        first_date_before_index("haem_cancer", &codelists.haem_cancer)
            .with_expectations(dates_until_index()),
    )
    .variable(
        first_date_before_index("other_cancer", &codelists.other_cancer)
            .with_expectations(dates_until_index()),
    )
    .variable(
        Variable::events(
            "creatinine",
            EventQuery::clinical(&codelists.creatinine)
                .window(last_year)
                .last()
                .returning(Returning::NumericValue {
                    round_to_nearest: None,
                }),
        )
        .with_match_date(DateFormat::YearMonth)
        .with_expectations(
            Expectations::new(Rate::Uniform, 0.95)
                .number(NumberDist::Normal {
                    mean: 60.0,
                    stddev: 15.0,
                })
                .date_between(
                    DateBound::IndexOffset(-1, DateUnit::Years),
                    DateBound::Index,
                ),
        ),
    )
    .variable(
        Variable::events(
            "esrf",
            EventQuery::clinical(&codelists.ckd)
                .window(on_or_before_index)
                .last()
                .returning_date(DateFormat::YearMonth),
        )
        .with_expectations(dates_until_index()),
    )
    .variable(
        first_date_before_index("diabetes", &codelists.diabetes)
            .with_expectations(dates_until_index()),
    )
    .variable(first_date_before_index(
        "chronic_liver_disease",
        &codelists.chronic_liver_disease,
    ))
    .variable(first_date_before_index(
        "chronic_cardiac_disease",
        &codelists.chronic_cardiac_disease,
    ))
    .variable(first_date_before_index(
        "chronic_respiratory_disease",
        &codelists.chronic_respiratory_disease,
    ))
    // flu vaccination status
    .variable(
        Variable::events(
            "flu_vaccine_tpp_table",
            EventQuery::vaccination("INFLUENZA")
                .window(flu_season)
                .first()
                .returning_date(DateFormat::YearMonthDay),
        )
        .with_expectations(dates_in_flu_season()),
    )
    .variable(
        Variable::events(
            "flu_vaccine_med",
            EventQuery::medications(&codelists.flu_med)
                .window(flu_season)
                .first()
                .returning_date(DateFormat::YearMonth),
        )
        .with_expectations(dates_in_flu_season()),
    )
    .variable(
        Variable::events(
            "flu_vaccine_clinical",
            EventQuery::clinical(&codelists.flu_clinical_given)
                .ignore_days_where(&codelists.flu_clinical_not_given)
                .window(flu_season)
                .first()
                .returning_date(DateFormat::YearMonth),
        )
        .with_expectations(dates_in_flu_season()),
    )
    .variable(Variable::satisfying(
        "flu_vaccine",
        "flu_vaccine_tpp_table OR \n flu_vaccine_med OR \n flu_vaccine_clinical",
    )?);

    Ok(study)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::{run, CancelToken, RunOptions},
        synth::SyntheticSource,
    };

    /// Small stand-ins for the published CSVs, enough to compile and run the study.
    fn test_codelists() -> CovidCodelists {
        let ctv3 = |name: &str, codes: &[&str]| {
            Codelist::new(name, CodingSystem::Ctv3, codes.iter().copied()).unwrap()
        };
        CovidCodelists {
            covid: Codelist::new("covid", CodingSystem::Icd10, ["U071", "U072"]).unwrap(),
            covid_death: Codelist::new("covid-death", CodingSystem::Icd10, ["U071"]).unwrap(),
            ethnicity: Codelist::new_categorised(
                "ethnicity",
                CodingSystem::Ctv3,
                [("XaJRB", "1"), ("XaJRC", "3"), ("XaJRD", "5")],
            )
            .unwrap(),
            dementia: ctv3("dementia", &["E00.."]),
            chronic_respiratory_disease: ctv3("crd", &["H3...", "H33.."]),
            chronic_cardiac_disease: ctv3("ccd", &["G3..."]),
            diabetes: ctv3("diabetes", &["C10.."]),
            lung_cancer: ctv3("lung-cancer", &["B22.."]),
            haem_cancer: ctv3("haem-cancer", &["B6..."]),
            other_cancer: ctv3("other-cancer", &["B7..."]),
            chronic_liver_disease: ctv3("cld", &["J61.."]),
            stroke: ctv3("stroke", &["G66.."]),
            creatinine: ctv3("creatinine", &["XE2q5"]),
            ckd: ctv3("ckd", &["K05.."]),
            flu_med: Codelist::new("flu-med", CodingSystem::Snomed, ["10939881000001108"])
                .unwrap(),
            flu_clinical_given: ctv3("flu-given", &["65E.."]),
            flu_clinical_not_given: ctv3("flu-not-given", &["68NE."]),
        }
    }

    #[test]
    fn study_definition_compiles() {
        let plan = study_definition(&test_codelists())
            .unwrap()
            .compile()
            .unwrap();
        assert_eq!(plan.index_date(), index_date());

        // output columns are in declaration order, with companions inline
        let columns = plan.columns();
        let names: Vec<&str> = columns.iter().map(|c| &**c).collect();
        assert_eq!(names[0], "has_follow_up");
        assert_eq!(names[1], "care_home_type");
        let eth = names.iter().position(|&n| n == "ethnicity").unwrap();
        assert_eq!(names[eth + 1], "ethnicity_date");
        let creat = names.iter().position(|&n| n == "creatinine").unwrap();
        assert_eq!(names[creat + 1], "creatinine_date");
        assert_eq!(*names.last().unwrap(), "flu_vaccine");

        // the derived flag evaluates after all three of its inputs
        let order: Vec<&str> = plan.variables().iter().map(|v| &*v.name).collect();
        let flu = order.iter().position(|&n| n == "flu_vaccine").unwrap();
        for input in [
            "flu_vaccine_tpp_table",
            "flu_vaccine_med",
            "flu_vaccine_clinical",
        ] {
            assert!(order.iter().position(|&n| n == input).unwrap() < flu);
        }
    }

    #[test]
    fn synthetic_extract_produces_rows() {
        let plan = study_definition(&test_codelists())
            .unwrap()
            .compile()
            .unwrap();
        let source = SyntheticSource::new(plan.clone(), 500, 42);
        let mut buf = Vec::new();
        let summary = run(
            &plan,
            &source,
            &mut buf,
            &RunOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(summary.patients, 500);
        assert_eq!(summary.failed, 0);
        // the population rule must bite: some synthetic patients are under 18 or in
        // a care home or without follow-up
        assert!(summary.rows > 0);
        assert!(summary.excluded > 0);
        assert_eq!(summary.rows + summary.excluded, 500);

        let output = String::from_utf8(buf).unwrap();
        let header = output.lines().next().unwrap();
        assert!(header.starts_with("patient_id,has_follow_up,care_home_type"));
        assert_eq!(output.lines().count(), summary.rows + 1);
    }
}
