//! Request bodies and validated JSON extraction for the RLHF API
//!
//! This module provides:
//! - `ValidatedJson<T>` - An Axum extractor that validates request bodies
//! - Request types for feedback and prediction registration
//! - Field limits and validators for the enum-valued feedback fields

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use validator::Validate;

use rlhf_core::{InterventionResult, PredictionAccuracy, RlhfError};
use rlhf_train::{Action, FeedbackSubmission, PredictionContext, State};

/// Default body size limit: 1MB
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Maximum length for case, prediction and officer ids
pub const MAX_ID_LEN: u64 = 128;
/// Maximum feature vector length accepted for a prediction
pub const MAX_FEATURES: u64 = 4096;

/// Error type for validated JSON extraction
#[derive(Debug)]
pub struct ValidationError {
    pub message: String,
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
            "error_type": "validation_error"
        });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

impl From<RlhfError> for ValidationError {
    fn from(e: RlhfError) -> Self {
        Self { message: e.to_string() }
    }
}

/// A JSON extractor that validates the request body using the validator crate
///
/// Usage:
/// ```ignore
/// async fn handler(ValidatedJson(payload): ValidatedJson<FeedbackRequest>) -> impl IntoResponse {
///     // payload is guaranteed to be valid
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ValidationError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ValidationError {
                message: format!("Invalid JSON: {}", rejection),
            })?;

        value.validate().map_err(|e| ValidationError {
            message: format!("Validation failed: {}", e),
        })?;

        Ok(ValidatedJson(value))
    }
}

/// Officer feedback as posted to `/api/v1/feedback`.
///
/// Enum fields arrive as strings and are matched case-insensitively.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FeedbackRequest {
    #[validate(length(min = 1, max = MAX_ID_LEN))]
    pub case_id: String,
    #[validate(length(min = 1, max = MAX_ID_LEN))]
    pub prediction_id: String,
    #[validate(length(min = 1, max = MAX_ID_LEN))]
    pub officer_id: String,
    #[validate(custom(function = "validate_accuracy"))]
    pub prediction_accuracy: String,
    #[validate(custom(function = "validate_intervention"))]
    pub intervention_result: String,
    #[validate(range(min = 0.0))]
    #[serde(default)]
    pub recovery_amount: Option<f64>,
    #[validate(range(min = 0.0))]
    #[serde(default)]
    pub fraud_amount: Option<f64>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl TryFrom<FeedbackRequest> for FeedbackSubmission {
    type Error = RlhfError;

    fn try_from(request: FeedbackRequest) -> Result<Self, Self::Error> {
        Ok(FeedbackSubmission {
            prediction_accuracy: request.prediction_accuracy.parse()?,
            intervention_result: request.intervention_result.parse()?,
            case_id: request.case_id,
            prediction_id: request.prediction_id,
            officer_id: request.officer_id,
            recovery_amount: request.recovery_amount,
            fraud_amount: request.fraud_amount,
            submitted_at: request.submitted_at,
        })
    }
}

/// What the model saw and chose for a prediction
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PredictionRequest {
    #[validate(length(min = 1, max = MAX_ID_LEN))]
    pub prediction_id: String,
    #[validate(length(min = 1, max = MAX_FEATURES), custom(function = "validate_features"))]
    pub features: Vec<f64>,
    pub action: usize,
}

impl PredictionRequest {
    pub fn into_parts(self) -> (String, PredictionContext) {
        let context = PredictionContext::new(State::new(self.features), Action(self.action));
        (self.prediction_id, context)
    }
}

fn invalid(code: &'static str, message: String) -> validator::ValidationError {
    let mut err = validator::ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Custom validator for prediction accuracy labels
pub fn validate_accuracy(value: &str) -> Result<(), validator::ValidationError> {
    value
        .parse::<PredictionAccuracy>()
        .map(|_| ())
        .map_err(|e| invalid("invalid_prediction_accuracy", e.to_string()))
}

/// Custom validator for intervention result labels
pub fn validate_intervention(value: &str) -> Result<(), validator::ValidationError> {
    value
        .parse::<InterventionResult>()
        .map(|_| ())
        .map_err(|e| invalid("invalid_intervention_result", e.to_string()))
}

/// Custom validator rejecting NaN and infinite features
pub fn validate_features(values: &[f64]) -> Result<(), validator::ValidationError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(invalid("non_finite_feature", "Features must be finite".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FeedbackRequest {
        FeedbackRequest {
            case_id: "case-1".into(),
            prediction_id: "pred-1".into(),
            officer_id: "officer-1".into(),
            prediction_accuracy: "exact_match".into(),
            intervention_result: "Both".into(),
            recovery_amount: Some(2_000.0),
            fraud_amount: Some(10_000.0),
            submitted_at: None,
        }
    }

    #[test]
    fn test_validate_accuracy() {
        assert!(validate_accuracy("EXACT_MATCH").is_ok());
        assert!(validate_accuracy("nearby").is_ok()); // Case insensitive
        assert!(validate_accuracy("SOMEWHERE").is_err());
    }

    #[test]
    fn test_validate_intervention() {
        assert!(validate_intervention("recovery").is_ok());
        assert!(validate_intervention("none").is_ok());
        assert!(validate_intervention("").is_err());
    }

    #[test]
    fn test_feedback_request_converts() {
        let req = request();
        assert!(req.validate().is_ok());

        let submission = FeedbackSubmission::try_from(req).unwrap();
        assert_eq!(submission.prediction_accuracy, PredictionAccuracy::ExactMatch);
        assert_eq!(submission.intervention_result, InterventionResult::Both);
        assert_eq!(submission.case_id, "case-1");
    }

    #[test]
    fn test_feedback_request_rejects_bad_fields() {
        let mut req = request();
        req.case_id = String::new();
        assert!(req.validate().is_err());

        let mut req = request();
        req.recovery_amount = Some(-1.0);
        assert!(req.validate().is_err());

        let mut req = request();
        req.officer_id = "x".repeat(MAX_ID_LEN as usize + 1);
        assert!(req.validate().is_err());

        let mut req = request();
        req.intervention_result = "ARREST".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_prediction_request() {
        let req = PredictionRequest {
            prediction_id: "pred-1".into(),
            features: vec![0.5, -1.0],
            action: 1,
        };
        assert!(req.validate().is_ok());
        let (id, context) = req.into_parts();
        assert_eq!(id, "pred-1");
        assert_eq!(context.state.dimension(), 2);

        let empty = PredictionRequest {
            prediction_id: "pred-2".into(),
            features: Vec::new(),
            action: 0,
        };
        assert!(empty.validate().is_err());

        let nan = PredictionRequest {
            prediction_id: "pred-3".into(),
            features: vec![f64::NAN],
            action: 0,
        };
        assert!(nan.validate().is_err());
    }
}
