//! Per-patient variable resolution.
//!
//! Resolution walks the compiled plan in evaluation order, computing one value per
//! variable from the patient's event timeline (real mode) or from pre-drawn values
//! (synthetic mode). Absence of data is never an error here: a patient with no
//! matching events gets the variable's default.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::{
    expr::{Bindings, ExprError, Value},
    study::{
        EventQuery, MatchPolicy, Returning, StudyPlan, ValueKind, Variable, VariableDef,
    },
    ArcStr, Event, Patient,
};

/// A per-patient resolution failure. Recorded against the patient (who is then
/// excluded); the run carries on.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("variable \"{variable}\"")]
    Expr {
        variable: ArcStr,
        #[source]
        source: ExprError,
    },
    #[error(
        "variable \"{variable}\": codelist \"{codelist}\" has no category for code \"{code}\""
    )]
    MissingCategory {
        variable: ArcStr,
        codelist: ArcStr,
        code: ArcStr,
    },
}

/// What resolution reads for one patient: the real coded timeline, or values already
/// drawn from the study's expectations. Keeping the two behind one type is what keeps
/// the real and synthetic drivers structurally identical.
pub enum Payload {
    Events(Vec<Event>),
    Drawn(BTreeMap<ArcStr, Value>),
}

/// Name lookup during evaluation: resolved variables first, then the registration
/// table fields (care home flags).
pub struct SubjectBindings<'a> {
    pub patient: &'a Patient,
    pub resolved: &'a BTreeMap<ArcStr, Value>,
}

impl Bindings for SubjectBindings<'_> {
    fn get(&self, name: &str) -> Option<Value> {
        self.resolved
            .get(name)
            .cloned()
            .or_else(|| self.patient.admin_value(name))
    }
}

/// The value a variable takes when nothing matched.
pub fn default_value(kind: ValueKind) -> Value {
    match kind {
        ValueKind::Bool => Value::Bool(false),
        _ => Value::Missing,
    }
}

/// Resolve every variable of `plan` for one patient, in evaluation order.
///
/// Resolving the same (patient, plan) twice yields identical maps: selection is
/// ordered by (date, codelist declaration position) and evaluation is pure.
pub fn resolve_patient(
    plan: &StudyPlan,
    patient: &Patient,
    payload: &Payload,
) -> Result<BTreeMap<ArcStr, Value>, ResolveError> {
    let mut resolved = BTreeMap::new();
    for variable in plan.variables() {
        resolve_into(variable, patient, payload, plan, &mut resolved)?;
    }
    Ok(resolved)
}

/// Resolve one variable, writing its value (and companion match date, if requested)
/// into `resolved`.
pub fn resolve_into(
    variable: &Variable,
    patient: &Patient,
    payload: &Payload,
    plan: &StudyPlan,
    resolved: &mut BTreeMap<ArcStr, Value>,
) -> Result<(), ResolveError> {
    // Flags over other variables are computed the same way in both modes; everything
    // else is either scanned from the timeline or read from the drawn values.
    if let VariableDef::Satisfying { expr } = &variable.def {
        let bindings = SubjectBindings { patient, resolved };
        let value = expr
            .eval_bool(&bindings)
            .map_err(|source| ResolveError::Expr {
                variable: variable.name.clone(),
                source,
            })?;
        resolved.insert(variable.name.clone(), Value::Bool(value));
        return Ok(());
    }

    let events = match payload {
        Payload::Drawn(drawn) => {
            let value = drawn
                .get(&variable.name)
                .cloned()
                .unwrap_or_else(|| default_value(variable.def.value_kind()));
            resolved.insert(variable.name.clone(), value);
            if variable.match_date.is_some() {
                let column = variable.match_date_column();
                let value = drawn.get(&column).cloned().unwrap_or(Value::Missing);
                resolved.insert(column, value);
            }
            return Ok(());
        }
        Payload::Events(events) => events,
    };

    let (value, match_date) = match &variable.def {
        VariableDef::Events(query) => scan_events(variable, query, events, plan.index_date())?,
        VariableDef::AgeAsOf => (Value::Int(patient.age_at(plan.index_date())), None),
        VariableDef::Sex => (Value::Str(patient.sex.to_string().into()), None),
        VariableDef::AdminField {
            field,
            round_to_nearest,
        } => {
            let mut value = field.value(patient);
            if let Some(n) = round_to_nearest {
                value = round_to_nearest_n(value, *n);
            }
            (value, None)
        }
        VariableDef::CareHomeStatus { rules, default } => {
            let bindings = SubjectBindings { patient, resolved };
            let mut label = default.clone();
            for rule in rules {
                let matched =
                    rule.when
                        .eval_bool(&bindings)
                        .map_err(|source| ResolveError::Expr {
                            variable: variable.name.clone(),
                            source,
                        })?;
                if matched {
                    label = rule.label.clone();
                    break;
                }
            }
            (Value::Str(label), None)
        }
        VariableDef::RegisteredBetween { start, end } => (
            Value::Bool(patient.registered_throughout(*start, *end)),
            None,
        ),
        VariableDef::Satisfying { .. } => unreachable!("handled above"),
    };

    resolved.insert(variable.name.clone(), value);
    if variable.match_date.is_some() {
        let date_value = match_date.map_or(Value::Missing, Value::Date);
        resolved.insert(variable.match_date_column(), date_value);
    }
    Ok(())
}

/// Scan the timeline for the event the query selects.
///
/// `First`/`Last` order candidates by event date, breaking same-day ties with the
/// declaration position of the code within the codelist, so selection is stable.
fn scan_events(
    variable: &Variable,
    query: &EventQuery,
    events: &[Event],
    index_date: NaiveDate,
) -> Result<(Value, Option<NaiveDate>), ResolveError> {
    let ignored_days: BTreeSet<NaiveDate> = match &query.ignore_days_where {
        Some(codelist) => events
            .iter()
            .filter(|evt| evt.kind == query.stream && codelist.contains(&evt.code))
            .map(|evt| evt.date)
            .collect(),
        None => BTreeSet::new(),
    };

    let position = |evt: &Event| -> usize {
        query
            .codelist
            .as_ref()
            .and_then(|cl| cl.position(&evt.code))
            .unwrap_or(usize::MAX)
    };
    let matches = |evt: &Event| -> bool {
        if evt.kind != query.stream || !query.window.contains(index_date, evt.date) {
            return false;
        }
        if ignored_days.contains(&evt.date) {
            return false;
        }
        match (&query.codelist, &query.target_disease) {
            (Some(codelist), _) => codelist.contains(&evt.code),
            (None, Some(disease)) => evt
                .target_disease
                .as_deref()
                .map_or(false, |d| d.eq_ignore_ascii_case(disease)),
            (None, None) => false,
        }
    };

    let mut selected: Option<&Event> = None;
    for evt in events.iter().filter(|evt| matches(evt)) {
        let better = match selected {
            None => true,
            Some(cur) => match query.policy {
                MatchPolicy::First | MatchPolicy::Any => {
                    (evt.date, position(evt)) < (cur.date, position(cur))
                }
                MatchPolicy::Last => {
                    evt.date > cur.date || (evt.date == cur.date && position(evt) < position(cur))
                }
            },
        };
        if better {
            selected = Some(evt);
        }
    }

    let match_date = selected.map(|evt| evt.date);
    let value = match &query.returning {
        Returning::Exists => Value::Bool(selected.is_some()),
        Returning::Date { .. } => match_date.map_or(Value::Missing, Value::Date),
        Returning::NumericValue { round_to_nearest } => {
            let value = selected
                .and_then(|evt| evt.numeric_value)
                .map_or(Value::Missing, Value::Float);
            match round_to_nearest {
                Some(n) => round_to_nearest_n(value, *n),
                None => value,
            }
        }
        Returning::Category => match selected {
            None => Value::Missing,
            Some(evt) => {
                let codelist = query.codelist.as_ref();
                let category = codelist.and_then(|cl| cl.category_of(&evt.code));
                match category {
                    Some(category) => Value::Str(category.into()),
                    None => {
                        return Err(ResolveError::MissingCategory {
                            variable: variable.name.clone(),
                            codelist: codelist
                                .map(|cl| ArcStr::from(cl.name()))
                                .unwrap_or_else(|| "<none>".into()),
                            code: evt.code.clone(),
                        })
                    }
                }
            }
        },
    };
    Ok((value, match_date))
}

/// Round to the nearest multiple of `n`, with exact halves rounding down.
pub(crate) fn round_to_nearest_n(value: Value, n: i64) -> Value {
    if n <= 0 {
        return value;
    }
    match value {
        Value::Int(v) => {
            let rem = v.rem_euclid(n);
            let down = v - rem;
            Value::Int(if 2 * rem > n { down + n } else { down })
        }
        Value::Float(v) => {
            let n = n as f64;
            let down = (v / n).floor() * n;
            let rem = v - down;
            Value::Float(if 2.0 * rem > n { down + n } else { down })
        }
        other => other,
    }
}
