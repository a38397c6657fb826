use serde_json::Value;

use crate::client::Exchange;
use crate::correlation::lookup_path;
use crate::models::dsl_model::CheckKind;

/// The parts of an exchange checks and extractions look at. A transport
/// failure yields a view with no status and no body, which fails every check.
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub status: Option<u16>,
    pub json: Option<Value>,
    pub text: String,
}

impl ResponseView {
    pub fn from_exchange(exchange: &Exchange) -> Self {
        match &exchange.result {
            Ok(resp) => Self {
                status: Some(resp.status.as_u16()),
                json: serde_json::from_slice(&resp.body).ok(),
                text: String::from_utf8_lossy(&resp.body).into_owned(),
            },
            Err(_) => Self::default(),
        }
    }

    fn field(&self, path: &str) -> Option<&Value> {
        self.json.as_ref().and_then(|root| lookup_path(root, path))
    }
}

pub fn evaluate(kind: &CheckKind, response: &ResponseView) -> bool {
    match kind {
        CheckKind::Status { status } => response.status == Some(*status),
        CheckKind::StatusRange { min, max } => response
            .status
            .is_some_and(|status| (*min..=*max).contains(&status)),
        CheckKind::FieldExists { path } => {
            matches!(response.field(path), Some(v) if !v.is_null())
        }
        CheckKind::FieldEquals { path, value } => response.field(path) == Some(value),
        CheckKind::FieldNotEmpty { path } => match response.field(path) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(fields)) => !fields.is_empty(),
            Some(_) => true,
        },
        CheckKind::FieldContains { path, needle } => {
            matches!(response.field(path), Some(Value::String(s)) if s.contains(needle.as_str()))
        }
        CheckKind::IsArray { path } => {
            matches!(response.field(path.as_deref().unwrap_or("")), Some(Value::Array(_)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(status: u16, body: Value) -> ResponseView {
        ResponseView {
            status: Some(status),
            text: body.to_string(),
            json: Some(body),
        }
    }

    #[test]
    fn status_checks() {
        let ok = view(200, json!({}));
        assert!(evaluate(&CheckKind::Status { status: 200 }, &ok));
        assert!(!evaluate(&CheckKind::Status { status: 201 }, &ok));
        assert!(evaluate(&CheckKind::StatusRange { min: 200, max: 299 }, &ok));
        assert!(!evaluate(
            &CheckKind::Status { status: 200 },
            &ResponseView::default()
        ));
    }

    #[test]
    fn field_checks() {
        let login = view(
            200,
            json!({ "mfaRequired": true, "tempToken": "t-1", "message": "Code OTP: 1", "token": "" }),
        );
        assert!(evaluate(&CheckKind::FieldExists { path: "tempToken".into() }, &login));
        assert!(!evaluate(&CheckKind::FieldExists { path: "accountId".into() }, &login));
        assert!(evaluate(
            &CheckKind::FieldEquals { path: "mfaRequired".into(), value: json!(true) },
            &login
        ));
        assert!(!evaluate(&CheckKind::FieldNotEmpty { path: "token".into() }, &login));
        assert!(evaluate(
            &CheckKind::FieldContains { path: "message".into(), needle: "Code OTP:".into() },
            &login
        ));
    }

    #[test]
    fn array_and_unparsable_bodies() {
        assert!(evaluate(&CheckKind::IsArray { path: None }, &view(200, json!([]))));
        assert!(!evaluate(&CheckKind::IsArray { path: None }, &view(200, json!({}))));

        let html = ResponseView {
            status: Some(200),
            json: None,
            text: "<html>oops</html>".into(),
        };
        assert!(!evaluate(&CheckKind::FieldExists { path: "".into() }, &html));
        assert!(!evaluate(&CheckKind::IsArray { path: None }, &html));
    }
}
