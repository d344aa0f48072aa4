//! The pure per-key transition function. No I/O: given a prior [`NeedState`] and an inbound
//! record, it returns the next state and, optionally, the final record to emit. Everything
//! about §4.3 of the design lives here; the orchestration around it (reading/writing the
//! store, publishing the emission, committing the offset) lives in [`crate::processor`].

use accumulator_store::NeedState;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The result of applying one inbound record to a correlation id's prior state.
#[derive(Debug)]
pub enum Outcome {
    /// `final == true` on the inbound record; this is our own prior emission looping back.
    SelfEcho,
    /// The record has no usable `@id` string field and was dropped.
    Malformed { reason: &'static str },
    /// The record was applied. `emit` carries the final record to publish, when this
    /// transition completed (or re-completed) the id.
    Applied {
        state: NeedState,
        emit: Option<Value>,
    },
}

/// Apply `record`, read at `offset`, to `prior` (the id's previously stored state, if any).
///
/// Implements the eight steps of the design's state machine exactly: self-echo filter, load
/// or create, reconcile `required`, update the template, merge solutions last-write-wins,
/// evaluate completeness as a superset test, and hand back the state to persist plus whatever
/// should be published.
pub fn apply(prior: Option<NeedState>, record: &Value, offset: i64) -> Outcome {
    if record.get("final").and_then(Value::as_bool) == Some(true) {
        return Outcome::SelfEcho;
    }

    let Some(id) = record.get("@id").and_then(Value::as_str) else {
        return Outcome::Malformed {
            reason: "missing or non-string @id",
        };
    };

    let behov = read_behov(record);

    let mut state = prior.unwrap_or_else(|| NeedState {
        id: id.to_string(),
        required: behov.clone(),
        template: record.clone(),
        solutions: BTreeMap::new(),
        last_completed_at: None,
    });

    // Step 3: reconcile required — latest non-absent @behov observation wins. A record with
    // no @behov field at all leaves the existing requirement (known or still unknown) as-is.
    if let Some(behov) = behov {
        if state.required.as_ref() != Some(&behov) {
            state.required = Some(behov);
        }
    }

    // Step 4: the template always advances to the most recent envelope.
    state.template = record.clone();

    // Step 5: merge solutions, last-write-wins per kind.
    for (kind, value) in read_losning(record) {
        state.solutions.insert(kind, value);
    }

    // Step 6: evaluate completeness and build the emission, if any.
    let emit = if state.is_complete() {
        state.last_completed_at = Some(offset);
        Some(build_final(&state))
    } else {
        None
    };

    Outcome::Applied { state, emit }
}

fn read_behov(record: &Value) -> Option<Vec<String>> {
    record.get("@behov").map(|v| {
        v.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    })
}

fn read_losning(record: &Value) -> BTreeMap<String, Value> {
    record
        .get("@løsning")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Deep-copy the current template, overwrite the two reserved fields a completion sets, and
/// leave every other field of the envelope untouched (§4.3 step 6, P2 envelope preservation).
fn build_final(state: &NeedState) -> Value {
    let mut out = state.template.clone();
    let solutions: Map<String, Value> = state
        .solutions
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("@løsning".to_string(), Value::Object(solutions));
        obj.insert("final".to_string(), Value::Bool(true));
    }
    out
}
