//! Officer feedback types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RlhfError};

/// How far ahead of the local clock a submission time may be
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Unique identifier for a feedback record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedbackId(pub Uuid);

impl FeedbackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FeedbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FeedbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an officer's assessment of one prediction.
///
/// At most one active record exists per key; resubmissions replace it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedbackKey {
    pub case_id: String,
    pub prediction_id: String,
    pub officer_id: String,
}

impl FeedbackKey {
    pub fn new(
        case_id: impl Into<String>,
        prediction_id: impl Into<String>,
        officer_id: impl Into<String>,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            prediction_id: prediction_id.into(),
            officer_id: officer_id.into(),
        }
    }
}

impl fmt::Display for FeedbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.case_id, self.prediction_id, self.officer_id
        )
    }
}

/// How close the predicted location was to where the fraud actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionAccuracy {
    ExactMatch,
    Nearby,
    Different,
    Unknown,
}

impl PredictionAccuracy {
    pub const ALL: [PredictionAccuracy; 4] = [
        PredictionAccuracy::ExactMatch,
        PredictionAccuracy::Nearby,
        PredictionAccuracy::Different,
        PredictionAccuracy::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionAccuracy::ExactMatch => "EXACT_MATCH",
            PredictionAccuracy::Nearby => "NEARBY",
            PredictionAccuracy::Different => "DIFFERENT",
            PredictionAccuracy::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PredictionAccuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionAccuracy {
    type Err = RlhfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXACT_MATCH" => Ok(PredictionAccuracy::ExactMatch),
            "NEARBY" => Ok(PredictionAccuracy::Nearby),
            "DIFFERENT" => Ok(PredictionAccuracy::Different),
            "UNKNOWN" => Ok(PredictionAccuracy::Unknown),
            other => Err(RlhfError::InvalidFeedback(format!(
                "unknown prediction_accuracy: {other}"
            ))),
        }
    }
}

/// What the field intervention achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionResult {
    Apprehension,
    Recovery,
    Both,
    Unsuccessful,
    None,
}

impl InterventionResult {
    pub const ALL: [InterventionResult; 5] = [
        InterventionResult::Apprehension,
        InterventionResult::Recovery,
        InterventionResult::Both,
        InterventionResult::Unsuccessful,
        InterventionResult::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionResult::Apprehension => "APPREHENSION",
            InterventionResult::Recovery => "RECOVERY",
            InterventionResult::Both => "BOTH",
            InterventionResult::Unsuccessful => "UNSUCCESSFUL",
            InterventionResult::None => "NONE",
        }
    }

    /// Apprehension, recovery or both
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InterventionResult::Apprehension | InterventionResult::Recovery | InterventionResult::Both
        )
    }
}

impl fmt::Display for InterventionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterventionResult {
    type Err = RlhfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPREHENSION" => Ok(InterventionResult::Apprehension),
            "RECOVERY" => Ok(InterventionResult::Recovery),
            "BOTH" => Ok(InterventionResult::Both),
            "UNSUCCESSFUL" => Ok(InterventionResult::Unsuccessful),
            "NONE" => Ok(InterventionResult::None),
            other => Err(RlhfError::InvalidFeedback(format!(
                "unknown intervention_result: {other}"
            ))),
        }
    }
}

/// One officer's assessment of one prediction outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: FeedbackId,
    pub case_id: String,
    pub prediction_id: String,
    pub officer_id: String,
    pub submitted_at: DateTime<Utc>,
    pub prediction_accuracy: PredictionAccuracy,
    pub intervention_result: InterventionResult,
    pub recovery_amount: Option<f64>,
    pub fraud_amount: Option<f64>,
}

impl FeedbackRecord {
    pub fn new(
        key: FeedbackKey,
        prediction_accuracy: PredictionAccuracy,
        intervention_result: InterventionResult,
    ) -> Self {
        Self {
            id: FeedbackId::new(),
            case_id: key.case_id,
            prediction_id: key.prediction_id,
            officer_id: key.officer_id,
            submitted_at: Utc::now(),
            prediction_accuracy,
            intervention_result,
            recovery_amount: None,
            fraud_amount: None,
        }
    }

    pub fn with_amounts(mut self, recovery_amount: Option<f64>, fraud_amount: Option<f64>) -> Self {
        self.recovery_amount = recovery_amount;
        self.fraud_amount = fraud_amount;
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    pub fn key(&self) -> FeedbackKey {
        FeedbackKey::new(&self.case_id, &self.prediction_id, &self.officer_id)
    }

    /// Reject records that cannot be turned into a reward.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("case_id", &self.case_id),
            ("prediction_id", &self.prediction_id),
            ("officer_id", &self.officer_id),
        ] {
            if value.trim().is_empty() {
                return Err(RlhfError::InvalidFeedback(format!("{field} must not be empty")));
            }
        }

        for (field, value) in [
            ("recovery_amount", self.recovery_amount),
            ("fraud_amount", self.fraud_amount),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(RlhfError::InvalidFeedback(format!("{field} must be finite")));
                }
                if v < 0.0 {
                    return Err(RlhfError::InvalidFeedback(format!(
                        "{field} must not be negative, got {v}"
                    )));
                }
            }
        }

        let latest = Utc::now() + Duration::seconds(MAX_CLOCK_SKEW_SECS);
        if self.submitted_at > latest {
            return Err(RlhfError::InvalidFeedback(format!(
                "submitted_at {} is in the future",
                self.submitted_at.to_rfc3339()
            )));
        }

        Ok(())
    }

    /// Fraction of the defrauded amount that was recovered.
    ///
    /// Zero when either amount is missing or the fraud amount is zero.
    pub fn recovery_rate(&self) -> f64 {
        match (self.recovery_amount, self.fraud_amount) {
            (Some(recovered), Some(fraud)) if fraud > 0.0 => recovered / fraud,
            _ => 0.0,
        }
    }
}
