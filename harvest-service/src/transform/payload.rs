use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::PipelineError;

/// Chart payload as embedded by the portal.
///
/// Every series starts with a header element (`"x"` for the label series, the
/// series title for value series) followed by one entry per chart position:
///
/// ```json
/// {"columns": [["使用電力量", 2.2, 2.1, null]], "shiyoKikan": ["x", "8/20", "8/21", "8/22"]}
/// ```
///
/// Hourly charts carry no label series.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub columns: Option<Vec<Vec<Value>>>,
    #[serde(default, rename = "shiyoKikan")]
    pub labels: Option<Vec<Value>>,
}

impl RawPayload {
    pub fn from_json(s: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(s)
            .map_err(|e| PipelineError::DataUnavailable(format!("payload is not valid JSON: {e}")))
    }
}

/// Validated daily chart: partial `month/day` labels paired with values.
#[derive(Debug, Clone, PartialEq)]
pub struct DailySeries {
    pub labels: Vec<String>,
    pub values: Vec<Option<f64>>,
}

/// Validated hourly chart: position `i` is hour `i` of the target day.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySeries {
    pub values: Vec<Option<f64>>,
}

fn first_value_series(payload: &RawPayload) -> Result<Vec<Option<f64>>, PipelineError> {
    let columns = payload
        .columns
        .as_ref()
        .ok_or_else(|| PipelineError::DataUnavailable("payload has no 'columns' field".to_string()))?;
    let series = columns
        .first()
        .ok_or_else(|| PipelineError::DataUnavailable("payload 'columns' is empty".to_string()))?;

    // Skip the series title.
    let values = series.get(1..).unwrap_or_default();
    if values.is_empty() {
        return Err(PipelineError::DataUnavailable("value series is empty".to_string()));
    }

    values
        .iter()
        .enumerate()
        .map(|(idx, v)| match v {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| {
                PipelineError::DataUnavailable(format!("value at position {idx} is not a finite number"))
            }),
            other => Err(PipelineError::DataUnavailable(format!(
                "value at position {idx} is neither a number nor null: {other}"
            ))),
        })
        .collect()
}

impl TryFrom<RawPayload> for DailySeries {
    type Error = PipelineError;

    fn try_from(payload: RawPayload) -> Result<Self, Self::Error> {
        let values = first_value_series(&payload)?;

        let raw_labels = payload.labels.ok_or_else(|| {
            PipelineError::DataUnavailable("daily payload has no 'shiyoKikan' label series".to_string())
        })?;

        // Skip the leading "x" header.
        let labels: Vec<String> = raw_labels
            .into_iter()
            .skip(1)
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        if labels.is_empty() {
            return Err(PipelineError::DataUnavailable("daily label series is empty".to_string()));
        }

        if labels.len() != values.len() {
            tracing::warn!(
                labels = labels.len(),
                values = values.len(),
                "daily label and value series differ in length; pairing the shorter prefix"
            );
        }

        Ok(Self { labels, values })
    }
}

impl TryFrom<RawPayload> for HourlySeries {
    type Error = PipelineError;

    fn try_from(payload: RawPayload) -> Result<Self, Self::Error> {
        Ok(Self {
            values: first_value_series(&payload)?,
        })
    }
}
