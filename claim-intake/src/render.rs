//! Terminal presentation of stage output and chat answers.
//!
//! Payloads have no fixed schema, so every field is optional here: a
//! missing or oddly typed field is skipped, and stages this renderer does
//! not know are printed key by key.

use std::io::Write;
use std::sync::Mutex;

use claim_stream::{
    ChatObserver, ChatTurn, ProgressObserver, ProgressState, RequestPhase, StreamRecord,
    record::{ERROR_STAGE, INTAKE_STAGE, POLICY_STAGE, RISK_STAGE, ROUTING_STAGE, VALUE_KEY},
};
use serde_json::Value;
use uuid::Uuid;

const INTAKE_FIELDS: &[(&str, &str)] = &[
    ("member_name", "Member"),
    ("member_id", "Member ID"),
    ("policy_number", "Policy"),
    ("treatment_date", "Treatment date"),
    ("claim_amount", "Claimed"),
    ("claim_type", "Type"),
    ("diagnosis", "Diagnosis"),
    ("doctor_name", "Doctor"),
    ("hospital_name", "Hospital"),
    ("summary", "Summary"),
];

const POLICY_FIELDS: &[(&str, &str)] = &[
    ("decision", "Decision"),
    ("approved_amount", "Approved"),
    ("confidence_score", "Confidence"),
    ("reasoning", "Reasoning"),
    ("policy_references", "References"),
];

const RISK_FIELDS: &[(&str, &str)] = &[
    ("risk_score", "Risk score"),
    ("category", "Category"),
    ("confidence_score", "Confidence"),
    ("reasons", "Reasons"),
    ("confidence_reasons", "Confidence reasons"),
];

const ROUTING_FIELDS: &[(&str, &str)] = &[
    ("processing_path", "Path"),
    ("priority", "Priority"),
    ("adjuster_tier", "Adjuster"),
    ("confidence_score", "Confidence"),
    ("rationale", "Rationale"),
    ("confidence_reasons", "Confidence reasons"),
];

fn known_fields(stage: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match stage {
        INTAKE_STAGE => Some(INTAKE_FIELDS),
        POLICY_STAGE => Some(POLICY_FIELDS),
        RISK_STAGE => Some(RISK_FIELDS),
        ROUTING_STAGE => Some(ROUTING_FIELDS),
        ERROR_STAGE => Some(&[("error", "Error")]),
        _ => None,
    }
}

/// Render one value on a single line, or as bullet lines for arrays of scalars
fn format_value(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => format!("- {s}"),
                    other => format!("- {other}"),
                })
                .collect(),
        ),
        other => Some(vec![other.to_string()]),
    }
}

fn push_field(lines: &mut Vec<String>, label: &str, value: &Value) {
    let Some(rendered) = format_value(value) else {
        return;
    };
    if rendered.len() == 1 && !rendered[0].starts_with("- ") {
        lines.push(format!("  {label}: {}", rendered[0]));
    } else {
        lines.push(format!("  {label}:"));
        lines.extend(rendered.into_iter().map(|line| format!("    {line}")));
    }
}

/// Lines printed for one stage record
pub fn format_record(record: &StreamRecord, repeat: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let heading = if repeat {
        format!("== {} (update)", record.stage)
    } else {
        format!("== {}", record.stage)
    };
    lines.push(heading);

    match known_fields(&record.stage) {
        Some(fields) => {
            for (key, label) in fields {
                if let Some(value) = record.field(key) {
                    push_field(&mut lines, label, value);
                }
            }
            if let Some(value) = record.field(VALUE_KEY) {
                push_field(&mut lines, "Details", value);
            }
        }
        None => {
            for (key, value) in &record.payload {
                push_field(&mut lines, key, value);
            }
        }
    }

    if lines.len() == 1 {
        lines.push("  (no details)".to_string());
    }
    lines
}

/// Prints claim progress and chat answers to stdout as they stream
#[derive(Default)]
pub struct TerminalRenderer {
    printed: Mutex<usize>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn print(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

impl ProgressObserver for TerminalRenderer {
    fn on_streaming(&self, _request_id: Uuid) {
        self.print("Processing claim...\n");
    }

    fn on_record(&self, record: &StreamRecord, state: &ProgressState) {
        let repeat = state.records_for(&record.stage).count() > 1;
        let mut block = format_record(record, repeat).join("\n");
        block.push('\n');
        self.print(&block);
    }

    fn on_finished(&self, state: &ProgressState) {
        let line = match state.phase {
            RequestPhase::Completed => format!(
                "Done: {} record(s) from {} stage(s)\n",
                state.records.len(),
                state.seen_stages.len()
            ),
            _ => format!(
                "Claim processing failed: {}\n",
                state.error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.print(&line);
    }
}

impl ChatObserver for TerminalRenderer {
    fn on_turn_opened(&self, _turn: &ChatTurn) {
        if let Ok(mut printed) = self.printed.lock() {
            *printed = 0;
        }
        self.print("assistant> ");
    }

    fn on_chunk(&self, _turn_id: Uuid, content: &str) {
        let Ok(mut printed) = self.printed.lock() else {
            return;
        };
        // content grows by appending, so only the new suffix is printed
        if let Some(delta) = content.get(*printed..) {
            self.print(delta);
        }
        *printed = content.len();
    }

    fn on_turn_sealed(&self, turn: &ChatTurn, failed: bool) {
        if failed {
            self.print(&format!("\n{}\n", turn.content));
        } else {
            self.print("\n");
        }
    }
}
