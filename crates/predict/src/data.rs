//! CSV ingestion, the evaluation-mask transform, and CSV emission.
//!
//! Input rows are keyed by learner id with `questions`, `concepts`, and
//! `responses` columns, each a comma-joined integer list (and therefore
//! quoted). Only the requested learner's row is materialised.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::config::PredictError;

/// One learner's full interaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnerRecord {
    pub uid: String,
    pub questions: Vec<i64>,
    pub concepts: Vec<i64>,
    pub responses: Vec<i64>,
}

/// Applies the evaluation mask to a response stream.
///
/// Every response the model must predict is replaced by the reserved mask
/// token, and the final slot carries the end-of-sequence marker so the
/// model sees where the history stops. The returned labels are the
/// original responses, preserved position for position.
pub fn apply_evaluation_mask(
    responses: &[i64],
    mask_token: i64,
    eos_token: i64,
) -> (Vec<i64>, Vec<i64>) {
    let mut masked = vec![mask_token; responses.len()];
    if let Some(last) = masked.last_mut() {
        *last = eos_token;
    }
    (masked, responses.to_vec())
}

/// Splits one CSV line, honouring double-quoted fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn parse_id_list(field: &str, column: &str) -> Result<Vec<i64>, PredictError> {
    field
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|_| {
                PredictError::Data(format!("column '{column}' holds a non-integer id '{part}'"))
            })
        })
        .collect()
}

/// Reads the row for `uid` from an interactions CSV.
pub fn read_learner_record(path: &Path, uid: &str) -> Result<LearnerRecord, PredictError> {
    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines();

    let header = lines
        .next()
        .ok_or_else(|| PredictError::Data(format!("{} is empty", path.display())))?;
    let columns = split_csv_line(header);
    let index_of = |name: &str| {
        columns
            .iter()
            .position(|column| column.trim() == name)
            .ok_or_else(|| PredictError::Data(format!("missing column '{name}'")))
    };
    let uid_idx = index_of("uid")?;
    let questions_idx = index_of("questions")?;
    let concepts_idx = index_of("concepts")?;
    let responses_idx = index_of("responses")?;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        if fields.get(uid_idx).map(|f| f.trim()) != Some(uid) {
            continue;
        }
        let field = |idx: usize, name: &str| -> Result<&String, PredictError> {
            fields
                .get(idx)
                .ok_or_else(|| PredictError::Data(format!("row for '{uid}' lacks column '{name}'")))
        };
        let record = LearnerRecord {
            uid: uid.to_string(),
            questions: parse_id_list(field(questions_idx, "questions")?, "questions")?,
            concepts: parse_id_list(field(concepts_idx, "concepts")?, "concepts")?,
            responses: parse_id_list(field(responses_idx, "responses")?, "responses")?,
        };
        if record.concepts.len() != record.responses.len()
            || record.questions.len() != record.responses.len()
        {
            return Err(PredictError::Data(format!(
                "row for '{uid}' has ragged columns: {} questions, {} concepts, {} responses",
                record.questions.len(),
                record.concepts.len(),
                record.responses.len()
            )));
        }
        if record.responses.is_empty() {
            return Err(PredictError::Data(format!(
                "row for '{uid}' holds no interactions"
            )));
        }
        return Ok(record);
    }

    Err(PredictError::Data(format!(
        "no row for uid '{uid}' in {}",
        path.display()
    )))
}

/// Writes the per-position predictions next to the original streams.
pub fn write_predictions(
    dir: &Path,
    record: &LearnerRecord,
    predictions: &[i64],
) -> Result<PathBuf, PredictError> {
    if predictions.len() != record.responses.len() {
        return Err(PredictError::Data(format!(
            "{} predictions for {} interactions",
            predictions.len(),
            record.responses.len()
        )));
    }
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.csv", record.uid));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "question,concept,predicted_response")?;
    for ((question, concept), prediction) in record
        .questions
        .iter()
        .zip(&record.concepts)
        .zip(predictions)
    {
        writeln!(file, "{question},{concept},{prediction}")?;
    }
    Ok(path)
}
