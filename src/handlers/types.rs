//! # Common API Types
//!
//! Pagination and query-parameter parsing shared by the handlers.

use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};

pub const DEFAULT_PAGE_LIMIT: u64 = 50;
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Offset pagination for list endpoints
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// Maximum number of items to return (default 50, max 100)
    pub limit: Option<u64>,
    /// Number of items to skip
    pub offset: Option<u64>,
}

impl PageQuery {
    /// Validated `(limit, offset)`.
    pub fn resolve(&self) -> Result<(u64, u64), ApiError> {
        let limit = match self.limit {
            None => DEFAULT_PAGE_LIMIT,
            Some(0) => {
                return Err(validation_error(
                    "Invalid limit",
                    serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
                ));
            }
            Some(limit) if limit > MAX_PAGE_LIMIT => {
                return Err(validation_error(
                    "Invalid limit",
                    serde_json::json!({ "limit": "Maximum allowed limit is 100" }),
                ));
            }
            Some(limit) => limit,
        };
        Ok((limit, self.offset.unwrap_or(0)))
    }
}

/// Parses an optional query value with `FromStr`, reporting the field on failure.
pub fn parse_optional<T>(field: &str, value: Option<&str>, expected: &str) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr,
{
    value
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<T>().map_err(|_| {
                validation_error(
                    &format!("Invalid {field}"),
                    serde_json::json!({ field: expected }),
                )
            })
        })
        .transpose()
}

pub fn parse_uuid(field: &str, value: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    parse_optional(field, value, "Must be a valid UUID")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sync_job::JobStatus;

    #[test]
    fn page_query_defaults_and_bounds() {
        assert_eq!(PageQuery::default().resolve().unwrap(), (50, 0));
        assert_eq!(
            PageQuery {
                limit: Some(10),
                offset: Some(20)
            }
            .resolve()
            .unwrap(),
            (10, 20)
        );
        assert!(PageQuery { limit: Some(0), offset: None }.resolve().is_err());
        assert!(PageQuery { limit: Some(101), offset: None }.resolve().is_err());
    }

    #[test]
    fn parse_optional_reports_field() {
        let parsed: Option<JobStatus> = parse_optional("status", Some("running"), "bad").unwrap();
        assert_eq!(parsed, Some(JobStatus::Running));

        let err = parse_optional::<JobStatus>("status", Some("sleeping"), "Must be a job status")
            .unwrap_err();
        assert_eq!(err.details.unwrap()["status"], "Must be a job status");

        assert_eq!(parse_uuid("connection_id", None).unwrap(), None);
    }
}
