//! Statistical expectations: the per-variable config that drives synthetic data.
//!
//! These mirror the declarative shape a study author writes (an incidence, a date
//! range, a distribution, category ratios). They are consumed only by
//! [`crate::synth::SyntheticSource`]; the real-data path never reads them.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{codes::LoadError, study::DateUnit, ArcStr};

/// How often a variable is present at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rate {
    /// Present for every patient (demographics and the like).
    Universal,
    /// Present with the declared incidence, dates spread evenly.
    Uniform,
    /// Present with the declared incidence, dates bunched toward the end of the
    /// range (epidemic-shaped data).
    ExponentialIncrease,
}

/// One end of an expected date range.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DateBound {
    Date(NaiveDate),
    Index,
    IndexOffset(i32, DateUnit),
    Today,
}

impl DateBound {
    pub fn resolve(self, index_date: NaiveDate) -> NaiveDate {
        match self {
            DateBound::Date(d) => d,
            DateBound::Index => index_date,
            DateBound::IndexOffset(n, unit) => {
                crate::study::Anchor::IndexOffset(n, unit).resolve(index_date)
            }
            DateBound::Today => Utc::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: DateBound,
    pub latest: DateBound,
}

/// Distribution family for drawn numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum NumberDist {
    Normal { mean: f64, stddev: f64 },
    Uniform { low: f64, high: f64 },
    Exponential { lambda: f64 },
    /// A rough UK population age pyramid; only meaningful for age variables.
    PopulationAges,
}

/// Category labels with the proportion of patients expected in each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRatios(Vec<(ArcStr, f64)>);

impl CategoryRatios {
    /// Ratios must sum to 1 (within floating point tolerance).
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Result<Self, LoadError> {
        let pairs: Vec<(ArcStr, f64)> = pairs
            .into_iter()
            .map(|(label, ratio)| (ArcStr::from(label), ratio))
            .collect();
        let sum: f64 = pairs.iter().map(|(_, ratio)| ratio).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(LoadError::BadRatios {
                name: pairs
                    .iter()
                    .map(|(label, _)| label.to_string())
                    .collect::<Vec<_>>()
                    .join("/"),
                sum,
            });
        }
        Ok(CategoryRatios(pairs))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.0.iter().map(|(label, ratio)| (&**label, *ratio))
    }
}

/// Everything the synthetic driver needs to fabricate one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectations {
    pub rate: Rate,
    pub incidence: f64,
    pub date: Option<DateRange>,
    pub number: Option<NumberDist>,
    pub category: Option<CategoryRatios>,
}

impl Default for Expectations {
    fn default() -> Self {
        Expectations {
            rate: Rate::Uniform,
            incidence: 0.5,
            date: None,
            number: None,
            category: None,
        }
    }
}

impl Expectations {
    pub fn new(rate: Rate, incidence: f64) -> Self {
        Expectations {
            rate,
            incidence,
            ..Default::default()
        }
    }

    /// Present for every patient.
    pub fn universal() -> Self {
        Self::new(Rate::Universal, 1.0)
    }

    pub fn date_between(mut self, earliest: DateBound, latest: DateBound) -> Self {
        self.date = Some(DateRange { earliest, latest });
        self
    }

    pub fn number(mut self, number: NumberDist) -> Self {
        self.number = Some(number);
        self
    }

    pub fn categories(
        mut self,
        ratios: CategoryRatios,
    ) -> Self {
        self.category = Some(ratios);
        self
    }

    /// Incidence actually applied when drawing: a universal rate is always present.
    pub fn effective_incidence(&self) -> f64 {
        match self.rate {
            Rate::Universal => 1.0,
            _ => self.incidence.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::date;

    #[test]
    fn ratios_must_sum_to_one() {
        assert!(CategoryRatios::new([("M", 0.49), ("F", 0.51)]).is_ok());
        let err = CategoryRatios::new([("PC", 0.4), ("PN", 0.3)]).unwrap_err();
        assert!(matches!(err, LoadError::BadRatios { .. }));
    }

    #[test]
    fn universal_rate_overrides_incidence() {
        let e = Expectations {
            rate: Rate::Universal,
            incidence: 0.2,
            ..Default::default()
        };
        assert_eq!(e.effective_incidence(), 1.0);
        let e = Expectations::new(Rate::Uniform, 0.2);
        assert_eq!(e.effective_incidence(), 0.2);
    }

    #[test]
    fn date_bounds_resolve() {
        let index = date(2020, 2, 1);
        assert_eq!(DateBound::Index.resolve(index), index);
        assert_eq!(
            DateBound::IndexOffset(-6, DateUnit::Months).resolve(index),
            date(2019, 8, 1)
        );
        assert_eq!(
            DateBound::Date(date(1900, 1, 1)).resolve(index),
            date(1900, 1, 1)
        );
    }
}
