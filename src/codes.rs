//! Clinical coding systems and codelists.
//!
//! A codelist is the unit of clinical meaning in a study definition: a named, immutable
//! list of codes in one coding system, optionally partitioned into categories (e.g. the
//! ethnicity list groups CTV3 codes into 6 census groups). Codelists are loaded once at
//! startup and passed by reference into the study definition; there is no global registry.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::Path,
    sync::Arc,
};
use thiserror::Error;

use crate::ArcStr;

/// Errors raised while building or loading codelists.
///
/// These are all fatal: a study must not start with a codelist it cannot trust.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("\"{code}\" is not a valid {system} code")]
    InvalidCode { system: CodingSystem, code: String },
    #[error("duplicate code \"{code}\" in codelist \"{name}\"")]
    DuplicateCode { name: String, code: String },
    #[error("codelist \"{path}\" has no \"{column}\" column")]
    MissingColumn { path: String, column: String },
    #[error("codelist \"{path}\" row {row}: {source}")]
    Row {
        path: String,
        row: usize,
        #[source]
        source: Box<LoadError>,
    },
    #[error("cannot combine a {left} codelist with a {right} codelist")]
    SystemMismatch {
        left: CodingSystem,
        right: CodingSystem,
    },
    #[error("category ratios for \"{name}\" sum to {sum}, expected 1")]
    BadRatios { name: String, sum: f64 },
    #[error("error reading codelist \"{path}\"")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("error parsing codelist \"{path}\"")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// The clinical terminologies our data sources use.
///
/// TPP primary care events are coded in CTV3, deaths in ICD-10, and medications in
/// dm+d (SNOMED).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingSystem {
    Icd10,
    Ctv3,
    Snomed,
}

impl CodingSystem {
    /// Check `text` against the syntax of this system.
    pub fn valid_code(self, text: &str) -> bool {
        match self {
            // A letter then 2-6 alphanumerics. Stored without the dot, e.g. "U071".
            CodingSystem::Icd10 => {
                let text = text.strip_prefix(|c: char| c.is_ascii_alphabetic());
                matches!(text, Some(rest) if (2..=6).contains(&rest.len())
                    && rest.chars().all(|c| c.is_ascii_alphanumeric()))
            }
            // Exactly 5 characters, alphanumeric or the '.' padding, e.g. "XE2q5".
            CodingSystem::Ctv3 => {
                text.len() == 5 && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
            }
            // A concept id: 6-18 decimal digits.
            CodingSystem::Snomed => {
                (6..=18).contains(&text.len()) && text.chars().all(|c| c.is_ascii_digit())
            }
        }
    }
}

impl fmt::Display for CodingSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodingSystem::Icd10 => f.write_str("icd10"),
            CodingSystem::Ctv3 => f.write_str("ctv3"),
            CodingSystem::Snomed => f.write_str("snomed"),
        }
    }
}

/// A clinical code, validated against the syntax of its coding system at construction.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClinicalCode(ArcStr);

impl ClinicalCode {
    pub fn new(system: CodingSystem, text: &str) -> Result<Self, LoadError> {
        if system.valid_code(text) {
            Ok(ClinicalCode(text.into()))
        } else {
            Err(LoadError::InvalidCode {
                system,
                code: text.to_owned(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClinicalCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClinicalCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Inner {
    name: ArcStr,
    system: CodingSystem,
    /// Declaration order. It is the tie-break when two events on the same day match
    /// different codes, so it must be stable.
    codes: Vec<ClinicalCode>,
    positions: BTreeMap<ArcStr, usize>,
    categories: BTreeMap<ArcStr, ArcStr>,
}

/// An immutable named list of clinical codes in one coding system.
///
/// Cheap to clone; the backing storage is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codelist {
    inner: Arc<Inner>,
}

impl Codelist {
    /// Build a codelist from an inline list of codes.
    pub fn new<'a>(
        name: &str,
        system: CodingSystem,
        codes: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, LoadError> {
        Self::build(name, system, codes.into_iter().map(|c| (c, None)))
    }

    /// Build a categorised codelist from inline (code, category) pairs.
    pub fn new_categorised<'a>(
        name: &str,
        system: CodingSystem,
        codes: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, LoadError> {
        Self::build(
            name,
            system,
            codes.into_iter().map(|(c, cat)| (c, Some(cat))),
        )
    }

    fn build<'a>(
        name: &str,
        system: CodingSystem,
        codes: impl Iterator<Item = (&'a str, Option<&'a str>)>,
    ) -> Result<Self, LoadError> {
        let mut list = Vec::new();
        let mut positions = BTreeMap::new();
        let mut categories = BTreeMap::new();
        for (text, category) in codes {
            let code = ClinicalCode::new(system, text)?;
            if positions.insert(code.0.clone(), list.len()).is_some() {
                return Err(LoadError::DuplicateCode {
                    name: name.to_owned(),
                    code: text.to_owned(),
                });
            }
            if let Some(category) = category {
                categories.insert(code.0.clone(), category.into());
            }
            list.push(code);
        }
        Ok(Codelist {
            inner: Arc::new(Inner {
                name: name.into(),
                system,
                codes: list,
                positions,
                categories,
            }),
        })
    }

    /// Load a codelist from a CSV file with a designated code column and, optionally, a
    /// category column.
    ///
    /// Fails fast when a named column is missing from the header, rather than silently
    /// treating every row as invalid.
    pub fn from_csv(
        path: impl AsRef<Path>,
        system: CodingSystem,
        column: &str,
        category_column: Option<&str>,
    ) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let file = fs::File::open(path).map_err(|source| LoadError::Io {
            path: shown.clone(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| shown.clone());
        Self::from_csv_reader(io::BufReader::new(file), &name, &shown, system, column, category_column)
    }

    /// As [`Codelist::from_csv`], reading from an open reader. `shown_path` is only used
    /// in error messages.
    pub fn from_csv_reader(
        reader: impl io::Read,
        name: &str,
        shown_path: &str,
        system: CodingSystem,
        column: &str,
        category_column: Option<&str>,
    ) -> Result<Self, LoadError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers().map_err(|source| LoadError::Csv {
            path: shown_path.to_owned(),
            source,
        })?;
        let find = |column: &str| -> Result<usize, LoadError> {
            headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| LoadError::MissingColumn {
                    path: shown_path.to_owned(),
                    column: column.to_owned(),
                })
        };
        let code_idx = find(column)?;
        let category_idx = category_column.map(find).transpose()?;

        let mut rows = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record.map_err(|source| LoadError::Csv {
                path: shown_path.to_owned(),
                source,
            })?;
            let code = record.get(code_idx).unwrap_or("").to_owned();
            let category = category_idx.map(|idx| record.get(idx).unwrap_or("").to_owned());
            rows.push((row, code, category));
        }
        Self::build(
            name,
            system,
            rows.iter()
                .map(|(_, code, category)| (code.as_str(), category.as_deref())),
        )
        .map_err(|source| {
            // attach the offending row number where we can identify it
            let row = match &source {
                LoadError::InvalidCode { code, .. } | LoadError::DuplicateCode { code, .. } => rows
                    .iter()
                    .find(|(_, c, _)| c == code)
                    .map(|(row, _, _)| row + 2),
                _ => None,
            };
            match row {
                Some(row) => LoadError::Row {
                    path: shown_path.to_owned(),
                    row,
                    source: Box::new(source),
                },
                None => source,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn system(&self) -> CodingSystem {
        self.inner.system
    }

    pub fn len(&self) -> usize {
        self.inner.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.codes.is_empty()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.inner.positions.contains_key(code)
    }

    /// The declaration-order position of a code, used to break date ties deterministically.
    pub fn position(&self, code: &str) -> Option<usize> {
        self.inner.positions.get(code).copied()
    }

    pub fn category_of(&self, code: &str) -> Option<&str> {
        self.inner.categories.get(code).map(|s| &**s)
    }

    pub fn has_categories(&self) -> bool {
        !self.inner.categories.is_empty()
    }

    /// Iterate codes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClinicalCode> + '_ {
        self.inner.codes.iter()
    }

    /// Combine two codelists of the same system into one.
    ///
    /// Codes keep their first-seen declaration order; codes present in both lists are
    /// kept once. Categories from both lists are carried over (left wins on conflict).
    pub fn union(&self, name: &str, other: &Codelist) -> Result<Codelist, LoadError> {
        if self.system() != other.system() {
            return Err(LoadError::SystemMismatch {
                left: self.system(),
                right: other.system(),
            });
        }
        let category = |code: &ClinicalCode| {
            self.category_of(code.as_str())
                .or_else(|| other.category_of(code.as_str()))
        };
        let mut seen = Vec::new();
        for code in self.iter().chain(other.iter()) {
            if !seen.iter().any(|(c, _): &(&ClinicalCode, _)| *c == code) {
                seen.push((code, category(code)));
            }
        }
        Self::build(
            name,
            self.system(),
            seen.iter().map(|(code, cat)| (code.as_str(), *cat)),
        )
    }

    /// A codelist containing only the codes whose category is one of `labels`.
    ///
    /// Declaration order and categories are preserved.
    pub fn filter_by_category(&self, labels: &[&str]) -> Codelist {
        let kept = self
            .iter()
            .filter_map(|code| {
                let category = self.category_of(code.as_str())?;
                labels
                    .contains(&category)
                    .then(|| (code.as_str(), Some(category)))
            })
            .collect::<Vec<_>>();
        Self::build(&self.inner.name, self.system(), kept.into_iter())
            .expect("codes were already validated")
    }
}

impl fmt::Display for Codelist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}, {} codes)", self.name(), self.system(), self.len())
    }
}
