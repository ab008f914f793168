//! The gateway-wide error taxonomy and its HTTP mapping.
//!
//! Module-local errors convert into [`GatewayError`] at the serving boundary;
//! every error surfaced to a client carries a machine-readable kind and a
//! human message, and nothing else.

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Auth,
	Forbidden,
	NotFound,
	BadRequest,
	Timeout,
	UpstreamUnavailable,
	CapacityExhausted,
	Cancelled,
	RecycleRequired,
	Internal,
}

impl ErrorKind {
	pub fn status(&self) -> StatusCode {
		match self {
			ErrorKind::Auth => StatusCode::UNAUTHORIZED,
			ErrorKind::Forbidden => StatusCode::FORBIDDEN,
			ErrorKind::NotFound => StatusCode::NOT_FOUND,
			ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
			ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
			ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
			ErrorKind::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::Cancelled => StatusCode::BAD_GATEWAY,
			ErrorKind::RecycleRequired => StatusCode::CONFLICT,
			ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
	pub kind: ErrorKind,
	pub message: String,
}

impl GatewayError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn auth(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Auth, message)
	}

	/// A deny never names the policy that matched.
	pub fn forbidden(resource_kind: &str, name: &str) -> Self {
		Self::new(
			ErrorKind::Forbidden,
			format!("access to {resource_kind} {name} is not permitted"),
		)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::BadRequest, message)
	}

	pub fn recycle_required() -> Self {
		Self::new(
			ErrorKind::RecycleRequired,
			"session identity changed; re-initialize the session",
		)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Internal, message)
	}

	/// The JSON-RPC error code used when this error is delivered inside a
	/// response envelope rather than as a bare HTTP status.
	pub fn jsonrpc_code(&self) -> i64 {
		match self.kind {
			ErrorKind::BadRequest => crate::protocol::CODE_INVALID_REQUEST,
			ErrorKind::NotFound => crate::protocol::CODE_METHOD_NOT_FOUND,
			ErrorKind::Internal => crate::protocol::CODE_INTERNAL_ERROR,
			// Application-defined range for gateway-specific failures.
			ErrorKind::Auth => -32001,
			ErrorKind::Forbidden => -32002,
			ErrorKind::Timeout => -32003,
			ErrorKind::UpstreamUnavailable => -32004,
			ErrorKind::CapacityExhausted => -32005,
			ErrorKind::Cancelled => -32006,
			ErrorKind::RecycleRequired => -32007,
		}
	}
}
