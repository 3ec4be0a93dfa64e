//! Study definitions: per-patient variables and the plan compiler.
//!
//! A [`StudyDefinition`] is the declarative description of a cohort extract: an index
//! date, a population expression, and an ordered list of named variables. Compiling it
//! checks every cross-variable reference, resolves relative date windows against the
//! index date and orders the variables so that each is evaluated after everything it
//! reads. The compiled [`StudyPlan`] is immutable and shared read-only across worker
//! threads.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::{
    codes::Codelist,
    expect::Expectations,
    expr::{Expr, ExprError, Value},
    ArcStr, EventKind, Patient, ADMIN_FIELDS,
};

/// Errors found while compiling a study definition. All fatal: nothing is extracted
/// from a plan that does not compile.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("duplicate variable \"{0}\"")]
    Duplicate(ArcStr),
    #[error("variable \"{variable}\" references undefined name \"{missing}\"")]
    UndefinedReference { variable: ArcStr, missing: ArcStr },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("variable \"{variable}\": window end {end} precedes start {start}")]
    WindowOrder {
        variable: ArcStr,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("in expression for \"{variable}\"")]
    Expr {
        variable: ArcStr,
        #[source]
        source: ExprError,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    Days,
    Months,
    Years,
}

/// One end of a date window, either absolute or relative to the study index date.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Anchor {
    Date(NaiveDate),
    Index,
    /// `index_date - 6 months` is `IndexOffset(-6, Months)`.
    IndexOffset(i32, DateUnit),
}

impl Anchor {
    pub fn resolve(self, index_date: NaiveDate) -> NaiveDate {
        match self {
            Anchor::Date(d) => d,
            Anchor::Index => index_date,
            Anchor::IndexOffset(n, DateUnit::Days) => index_date
                .checked_add_signed(chrono::Duration::days(i64::from(n)))
                .expect("date arithmetic out of range"),
            Anchor::IndexOffset(n, DateUnit::Months) => add_months(index_date, n),
            Anchor::IndexOffset(n, DateUnit::Years) => add_months(
                index_date,
                n.checked_mul(12).expect("date arithmetic out of range"),
            ),
        }
    }
}

fn add_months(date: NaiveDate, n: i32) -> NaiveDate {
    let months = Months::new(n.unsigned_abs());
    if n >= 0 {
        date.checked_add_months(months)
    } else {
        date.checked_sub_months(months)
    }
    .expect("date arithmetic out of range")
}

/// A date window with inclusive bounds. `None` means unbounded at that end.
///
/// A window with `start == end` matches exactly that one day.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: Option<Anchor>,
    pub end: Option<Anchor>,
}

impl Window {
    pub const UNBOUNDED: Window = Window {
        start: None,
        end: None,
    };

    pub fn on_or_before(end: Anchor) -> Self {
        Window {
            start: None,
            end: Some(end),
        }
    }

    pub fn between(start: Anchor, end: Anchor) -> Self {
        Window {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn resolve(self, index_date: NaiveDate) -> (Option<NaiveDate>, Option<NaiveDate>) {
        (
            self.start.map(|a| a.resolve(index_date)),
            self.end.map(|a| a.resolve(index_date)),
        )
    }

    pub fn contains(self, index_date: NaiveDate, date: NaiveDate) -> bool {
        let (start, end) = self.resolve(index_date);
        start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
    }
}

/// Which matching event represents the variable's value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    First,
    Last,
    Any,
}

/// Date precision for emitted dates. The month form exists to reduce disclosure risk
/// in the output table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    YearMonthDay,
    YearMonth,
    Year,
}

impl DateFormat {
    pub fn format(self, date: NaiveDate) -> String {
        match self {
            DateFormat::YearMonthDay => date.format("%Y-%m-%d").to_string(),
            DateFormat::YearMonth => date.format("%Y-%m").to_string(),
            DateFormat::Year => date.format("%Y").to_string(),
        }
    }
}

/// What an event-backed variable extracts from its selected event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Returning {
    Date { format: DateFormat },
    /// The category label of the matched code, from the codelist's category column.
    Category,
    /// The numeric value attached to the event (a test result, say), not its date.
    NumericValue { round_to_nearest: Option<i64> },
    Exists,
}

/// A query against the patient's coded event timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQuery {
    pub stream: EventKind,
    pub codelist: Option<Codelist>,
    /// For vaccination records, which are matched by disease rather than by code.
    pub target_disease: Option<ArcStr>,
    pub window: Window,
    pub policy: MatchPolicy,
    pub returning: Returning,
    /// Drop candidate events falling on a day that also carries one of these codes
    /// (e.g. "vaccine not given" annotations).
    pub ignore_days_where: Option<Codelist>,
}

impl EventQuery {
    pub fn clinical(codelist: &Codelist) -> Self {
        EventQuery {
            stream: EventKind::Clinical,
            codelist: Some(codelist.clone()),
            target_disease: None,
            window: Window::UNBOUNDED,
            policy: MatchPolicy::Any,
            returning: Returning::Exists,
            ignore_days_where: None,
        }
    }

    pub fn medications(codelist: &Codelist) -> Self {
        EventQuery {
            stream: EventKind::Medication,
            ..Self::clinical(codelist)
        }
    }

    pub fn vaccination(target_disease: &str) -> Self {
        EventQuery {
            stream: EventKind::Vaccination,
            codelist: None,
            target_disease: Some(target_disease.into()),
            window: Window::UNBOUNDED,
            policy: MatchPolicy::Any,
            returning: Returning::Exists,
            ignore_days_where: None,
        }
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn first(mut self) -> Self {
        self.policy = MatchPolicy::First;
        self
    }

    pub fn last(mut self) -> Self {
        self.policy = MatchPolicy::Last;
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    pub fn returning_date(self, format: DateFormat) -> Self {
        self.returning(Returning::Date { format })
    }

    pub fn ignore_days_where(mut self, codelist: &Codelist) -> Self {
        self.ignore_days_where = Some(codelist.clone());
        self
    }
}

/// Administrative fields from the registration tables, exposed as variables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminField {
    Imd,
    StpCode,
    Nuts1RegionName,
    MsoaCode,
    RuralUrbanClassification,
    HouseholdId,
    HouseholdSize,
    PracticePseudoId,
    HasMembersInOtherEhrSystems,
    PercentageOfMembersWithEhrDataAvailable,
}

impl AdminField {
    pub fn value(self, patient: &Patient) -> Value {
        fn int(v: Option<i64>) -> Value {
            v.map_or(Value::Missing, Value::Int)
        }
        fn string(v: &Option<ArcStr>) -> Value {
            v.clone().map_or(Value::Missing, Value::Str)
        }
        match self {
            AdminField::Imd => int(patient.imd),
            AdminField::StpCode => string(&patient.stp),
            AdminField::Nuts1RegionName => string(&patient.region),
            AdminField::MsoaCode => string(&patient.msoa),
            AdminField::RuralUrbanClassification => string(&patient.rural_urban),
            AdminField::HouseholdId => int(patient.household_id),
            AdminField::HouseholdSize => int(patient.household_size),
            AdminField::PracticePseudoId => int(patient.practice_id),
            AdminField::HasMembersInOtherEhrSystems => patient
                .tpp_household
                .map_or(Value::Missing, Value::Bool),
            AdminField::PercentageOfMembersWithEhrDataAvailable => patient
                .tpp_coverage
                .map_or(Value::Missing, Value::Float),
        }
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            AdminField::Imd
            | AdminField::HouseholdId
            | AdminField::HouseholdSize
            | AdminField::PracticePseudoId => ValueKind::Int,
            AdminField::StpCode
            | AdminField::Nuts1RegionName
            | AdminField::MsoaCode
            | AdminField::RuralUrbanClassification => ValueKind::Str,
            AdminField::HasMembersInOtherEhrSystems => ValueKind::Bool,
            AdminField::PercentageOfMembersWithEhrDataAvailable => ValueKind::Float,
        }
    }
}

/// One arm of a care-home categorisation: `label` applies when `when` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub label: ArcStr,
    pub when: Expr,
}

/// How a variable's value is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VariableDef {
    Events(EventQuery),
    /// Age in whole years at the index date.
    AgeAsOf,
    Sex,
    AdminField {
        field: AdminField,
        round_to_nearest: Option<i64>,
    },
    /// Ordered rules over the address flags, first match wins, with a mandatory
    /// terminal default label.
    CareHomeStatus {
        rules: Vec<CategoryRule>,
        default: ArcStr,
    },
    /// Continuously registered with one practice for the whole period.
    RegisteredBetween { start: NaiveDate, end: NaiveDate },
    /// A boolean combination of previously defined variables.
    Satisfying { expr: Expr },
}

/// The broad type of value a variable produces, used when formatting output and when
/// drawing synthetic values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    Date,
}

impl VariableDef {
    pub fn value_kind(&self) -> ValueKind {
        match self {
            VariableDef::Events(q) => match q.returning {
                Returning::Date { .. } => ValueKind::Date,
                Returning::Category => ValueKind::Str,
                Returning::NumericValue { .. } => ValueKind::Float,
                Returning::Exists => ValueKind::Bool,
            },
            VariableDef::AgeAsOf => ValueKind::Int,
            VariableDef::Sex => ValueKind::Str,
            VariableDef::AdminField { field, .. } => field.value_kind(),
            VariableDef::CareHomeStatus { .. } => ValueKind::Str,
            VariableDef::RegisteredBetween { .. } => ValueKind::Bool,
            VariableDef::Satisfying { .. } => ValueKind::Bool,
        }
    }

    /// The names this definition reads from other variables (or the registration
    /// tables, which the compiler filters out).
    fn referenced_names(&self) -> Vec<ArcStr> {
        match self {
            VariableDef::Satisfying { expr } => expr.names(),
            VariableDef::CareHomeStatus { rules, .. } => {
                let mut names = Vec::new();
                for rule in rules {
                    for name in rule.when.names() {
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
                names
            }
            _ => Vec::new(),
        }
    }
}

/// A named study variable plus the statistical expectations used to fabricate it in
/// synthetic mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: ArcStr,
    pub def: VariableDef,
    /// Also emit the matched event's date as a companion `<name>_date` column.
    pub match_date: Option<DateFormat>,
    pub expectations: Option<Expectations>,
}

impl Variable {
    pub fn new(name: &str, def: VariableDef) -> Self {
        Variable {
            name: name.into(),
            def,
            match_date: None,
            expectations: None,
        }
    }

    pub fn events(name: &str, query: EventQuery) -> Self {
        Self::new(name, VariableDef::Events(query))
    }

    pub fn age_as_of(name: &str) -> Self {
        Self::new(name, VariableDef::AgeAsOf)
    }

    pub fn sex(name: &str) -> Self {
        Self::new(name, VariableDef::Sex)
    }

    pub fn admin(name: &str, field: AdminField) -> Self {
        Self::new(
            name,
            VariableDef::AdminField {
                field,
                round_to_nearest: None,
            },
        )
    }

    pub fn admin_rounded(name: &str, field: AdminField, round_to_nearest: i64) -> Self {
        Self::new(
            name,
            VariableDef::AdminField {
                field,
                round_to_nearest: Some(round_to_nearest),
            },
        )
    }

    pub fn care_home_status<'a>(
        name: &str,
        rules: impl IntoIterator<Item = (&'a str, &'a str)>,
        default: &str,
    ) -> Result<Self, CompileError> {
        let rules = rules
            .into_iter()
            .map(|(label, when)| {
                Ok(CategoryRule {
                    label: label.into(),
                    when: Expr::parse(when).map_err(|source| CompileError::Expr {
                        variable: name.into(),
                        source,
                    })?,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(Self::new(
            name,
            VariableDef::CareHomeStatus {
                rules,
                default: default.into(),
            },
        ))
    }

    pub fn registered_between(name: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(name, VariableDef::RegisteredBetween { start, end })
    }

    pub fn satisfying(name: &str, expr: &str) -> Result<Self, CompileError> {
        let expr = Expr::parse(expr).map_err(|source| CompileError::Expr {
            variable: name.into(),
            source,
        })?;
        Ok(Self::new(name, VariableDef::Satisfying { expr }))
    }

    pub fn with_match_date(mut self, format: DateFormat) -> Self {
        self.match_date = Some(format);
        self
    }

    pub fn with_expectations(mut self, expectations: Expectations) -> Self {
        self.expectations = Some(expectations);
        self
    }

    /// The companion column name when `match_date` is set.
    pub fn match_date_column(&self) -> ArcStr {
        format!("{}_date", self.name).into()
    }
}

/// The declarative form of a study, before compilation.
#[derive(Debug, Clone)]
pub struct StudyDefinition {
    pub index_date: NaiveDate,
    pub population: Expr,
    pub variables: Vec<Variable>,
    pub default_expectations: Expectations,
}

impl StudyDefinition {
    pub fn new(index_date: NaiveDate, population: &str) -> Result<Self, CompileError> {
        let population = Expr::parse(population).map_err(|source| CompileError::Expr {
            variable: "population".into(),
            source,
        })?;
        Ok(StudyDefinition {
            index_date,
            population,
            variables: Vec::new(),
            default_expectations: Expectations::default(),
        })
    }

    pub fn variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn default_expectations(mut self, expectations: Expectations) -> Self {
        self.default_expectations = expectations;
        self
    }

    /// Validate the definition and fix an evaluation order.
    ///
    /// Dependency edges run from each variable to the variables its expressions
    /// reference. Compilation fails on duplicate or undefined names, on cycles, and on
    /// windows whose end precedes their start. Relative windows are resolved against
    /// the index date here, so the resolver only ever sees absolute dates.
    pub fn compile(self) -> Result<StudyPlan, CompileError> {
        let StudyDefinition {
            index_date,
            population,
            mut variables,
            default_expectations,
        } = self;

        let mut by_name: BTreeMap<ArcStr, usize> = BTreeMap::new();
        for (idx, var) in variables.iter().enumerate() {
            if by_name.insert(var.name.clone(), idx).is_some() {
                return Err(CompileError::Duplicate(var.name.clone()));
            }
        }
        for var in &variables {
            if var.match_date.is_some() && by_name.contains_key(&var.match_date_column()) {
                return Err(CompileError::Duplicate(var.match_date_column()));
            }
        }

        // Resolve windows now; a window that is back to front is a study bug, caught
        // before any patient is touched.
        for var in &mut variables {
            if let VariableDef::Events(query) = &mut var.def {
                let (start, end) = query.window.resolve(index_date);
                if let (Some(start), Some(end)) = (start, end) {
                    if end < start {
                        return Err(CompileError::WindowOrder {
                            variable: var.name.clone(),
                            start,
                            end,
                        });
                    }
                }
                query.window = Window {
                    start: start.map(Anchor::Date),
                    end: end.map(Anchor::Date),
                };
            }
            if let VariableDef::RegisteredBetween { start, end } = &var.def {
                if end < start {
                    return Err(CompileError::WindowOrder {
                        variable: var.name.clone(),
                        start: *start,
                        end: *end,
                    });
                }
            }
        }

        // Dependency edges. Names that are neither variables nor registration-table
        // fields are study bugs.
        let match_date_columns: BTreeSet<ArcStr> = variables
            .iter()
            .filter(|v| v.match_date.is_some())
            .map(Variable::match_date_column)
            .collect();
        let resolve_name = |of: &ArcStr, name: &ArcStr| -> Result<Option<usize>, CompileError> {
            if let Some(idx) = by_name.get(name) {
                return Ok(Some(*idx));
            }
            if ADMIN_FIELDS.contains(&&**name) || match_date_columns.contains(name) {
                return Ok(None);
            }
            Err(CompileError::UndefinedReference {
                variable: of.clone(),
                missing: name.clone(),
            })
        };

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(variables.len());
        for var in &variables {
            let mut edges = Vec::new();
            for name in var.def.referenced_names() {
                if let Some(idx) = resolve_name(&var.name, &name)? {
                    edges.push(idx);
                }
            }
            deps.push(edges);
        }
        let population_name: ArcStr = "population".into();
        for name in population.names() {
            resolve_name(&population_name, &name)?;
        }

        let order = topological_order(&variables, &deps)?;
        let decl_order: Vec<ArcStr> = variables.iter().map(|v| v.name.clone()).collect();
        let variables: Vec<Variable> = order
            .into_iter()
            .map(|idx| variables[idx].clone())
            .collect();

        Ok(StudyPlan {
            index_date,
            population,
            variables,
            decl_order,
            default_expectations,
        })
    }
}

/// Kahn's algorithm with declaration order as the tie-break, so compilation is
/// deterministic and reordering-free for already-ordered definitions.
fn topological_order(
    variables: &[Variable],
    deps: &[Vec<usize>],
) -> Result<Vec<usize>, CompileError> {
    let n = variables.len();
    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n)
            .find(|&idx| !done[idx] && deps[idx].iter().all(|&dep| done[dep]));
        match next {
            Some(idx) => {
                done[idx] = true;
                order.push(idx);
            }
            None => {
                return Err(CompileError::Cycle(find_cycle(variables, deps, &done)));
            }
        }
    }
    Ok(order)
}

/// Walk the unfinished subgraph until a node repeats, and report that loop by name.
fn find_cycle(variables: &[Variable], deps: &[Vec<usize>], done: &[bool]) -> Vec<String> {
    let start = (0..variables.len())
        .find(|&idx| !done[idx])
        .expect("find_cycle called without a stuck node");
    let mut path = vec![start];
    let mut seen = BTreeSet::from([start]);
    let mut current = start;
    loop {
        let next = deps[current]
            .iter()
            .copied()
            .find(|&dep| !done[dep])
            .expect("stuck node must have an unfinished dependency");
        if !seen.insert(next) {
            let cycle_start = path.iter().position(|&idx| idx == next).unwrap_or(0);
            let mut cycle: Vec<String> = path[cycle_start..]
                .iter()
                .map(|&idx| variables[idx].name.to_string())
                .collect();
            cycle.push(variables[next].name.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

/// A compiled study: variables in evaluation order, windows absolute, every reference
/// checked. Immutable; share it freely between threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyPlan {
    index_date: NaiveDate,
    population: Expr,
    variables: Vec<Variable>,
    decl_order: Vec<ArcStr>,
    default_expectations: Expectations,
}

impl StudyPlan {
    pub fn index_date(&self) -> NaiveDate {
        self.index_date
    }

    pub fn population(&self) -> &Expr {
        &self.population
    }

    /// Variables in evaluation (dependency) order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn find(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| &*v.name == name)
    }

    pub fn default_expectations(&self) -> &Expectations {
        &self.default_expectations
    }

    /// Output column names: declaration order, with each variable followed by its
    /// companion date column where one was requested.
    pub fn columns(&self) -> Vec<ArcStr> {
        let mut out = Vec::with_capacity(self.decl_order.len());
        for name in &self.decl_order {
            out.push(name.clone());
            let var = self.find(name).expect("declared variable must exist");
            if var.match_date.is_some() {
                out.push(var.match_date_column());
            }
        }
        out
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::CodingSystem;
    use crate::test_util::date;

    fn codelist(codes: &[&str]) -> Codelist {
        Codelist::new("test", CodingSystem::Ctv3, codes.iter().copied()).unwrap()
    }

    fn minimal_study() -> StudyDefinition {
        StudyDefinition::new(date(2020, 2, 1), "age >= 18").unwrap()
    }

    #[test]
    fn anchors_resolve_relative_to_index() {
        let index = date(2020, 2, 1);
        assert_eq!(Anchor::Index.resolve(index), index);
        assert_eq!(
            Anchor::IndexOffset(-1, DateUnit::Years).resolve(index),
            date(2019, 2, 1)
        );
        assert_eq!(
            Anchor::IndexOffset(-6, DateUnit::Months).resolve(index),
            date(2019, 8, 1)
        );
        assert_eq!(
            Anchor::IndexOffset(14, DateUnit::Days).resolve(index),
            date(2020, 2, 15)
        );
    }

    #[test]
    fn compile_preserves_declaration_order_without_deps() {
        let plan = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::sex("sex"))
            .variable(Variable::admin("imd", AdminField::Imd))
            .compile()
            .unwrap();
        let names: Vec<_> = plan.variables().iter().map(|v| v.name.to_string()).collect();
        assert_eq!(names, ["age", "sex", "imd"]);
        assert_eq!(
            plan.columns(),
            vec![ArcStr::from("age"), "sex".into(), "imd".into()]
        );
    }

    #[test]
    fn satisfying_variables_order_after_their_inputs() {
        // declared out of order on purpose: the flag is declared before its inputs
        let study = StudyDefinition::new(date(2020, 2, 1), "age >= 18")
            .unwrap()
            .variable(
                Variable::satisfying("flu_vaccine", "flu_med OR flu_clinical").unwrap(),
            )
            .variable(Variable::age_as_of("age"))
            .variable(Variable::events(
                "flu_med",
                EventQuery::medications(&codelist(&["XE2q5"])),
            ))
            .variable(Variable::events(
                "flu_clinical",
                EventQuery::clinical(&codelist(&["H33.."])),
            ));
        let plan = study.compile().unwrap();
        let names: Vec<_> = plan.variables().iter().map(|v| v.name.to_string()).collect();
        let flu = names.iter().position(|n| n == "flu_vaccine").unwrap();
        assert!(flu > names.iter().position(|n| n == "flu_med").unwrap());
        assert!(flu > names.iter().position(|n| n == "flu_clinical").unwrap());
        // columns still come out in declaration order
        assert_eq!(
            plan.columns()[0],
            ArcStr::from("flu_vaccine"),
        );
    }

    #[test]
    fn cycle_is_reported_with_both_names() {
        let study = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::satisfying("a", "b").unwrap())
            .variable(Variable::satisfying("b", "a").unwrap());
        match study.compile().unwrap_err() {
            CompileError::Cycle(names) => {
                assert!(names.contains(&"a".to_string()));
                assert!(names.contains(&"b".to_string()));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn undefined_reference_names_the_missing_variable() {
        let study = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::satisfying("flag", "no_such_thing").unwrap());
        match study.compile().unwrap_err() {
            CompileError::UndefinedReference { variable, missing } => {
                assert_eq!(&*variable, "flag");
                assert_eq!(&*missing, "no_such_thing");
            }
            other => panic!("expected undefined reference, got {other}"),
        }
    }

    #[test]
    fn population_references_are_checked() {
        let study = StudyDefinition::new(date(2020, 2, 1), "age >= 18 AND has_follow_up")
            .unwrap()
            .variable(Variable::age_as_of("age"));
        assert!(matches!(
            study.compile().unwrap_err(),
            CompileError::UndefinedReference { missing, .. } if &*missing == "has_follow_up"
        ));
    }

    #[test]
    fn duplicate_variable_rejected() {
        let study = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::sex("age"));
        assert!(matches!(
            study.compile().unwrap_err(),
            CompileError::Duplicate(name) if &*name == "age"
        ));
    }

    #[test]
    fn backwards_window_fails_compilation() {
        let query = EventQuery::clinical(&codelist(&["H33.."])).window(Window::between(
            Anchor::Index,
            Anchor::IndexOffset(-1, DateUnit::Years),
        ));
        let study = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::events("asthma", query));
        assert!(matches!(
            study.compile().unwrap_err(),
            CompileError::WindowOrder { variable, .. } if &*variable == "asthma"
        ));
    }

    #[test]
    fn single_day_window_compiles() {
        let query = EventQuery::clinical(&codelist(&["H33.."]))
            .window(Window::between(Anchor::Index, Anchor::Index));
        let study = minimal_study()
            .variable(Variable::age_as_of("age"))
            .variable(Variable::events("asthma", query));
        let plan = study.compile().unwrap();
        let var = plan.find("asthma").unwrap();
        match &var.def {
            VariableDef::Events(q) => {
                assert_eq!(q.window.start, Some(Anchor::Date(date(2020, 2, 1))));
                assert_eq!(q.window.end, Some(Anchor::Date(date(2020, 2, 1))));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn plan_round_trips_through_json() {
        let plan = StudyDefinition::new(date(2020, 2, 1), "age >= 18")
            .unwrap()
            .variable(Variable::satisfying("both", "age AND sex = 'F'").unwrap())
            .variable(Variable::age_as_of("age"))
            .variable(Variable::sex("sex"))
            .compile()
            .unwrap();
        let json = plan.to_json().unwrap();
        let reloaded = StudyPlan::from_json(&json).unwrap();
        let names = |p: &StudyPlan| {
            p.variables()
                .iter()
                .map(|v| v.name.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&plan), names(&reloaded));
        assert_eq!(plan.columns(), reloaded.columns());
        assert_eq!(plan.index_date(), reloaded.index_date());
    }
}
