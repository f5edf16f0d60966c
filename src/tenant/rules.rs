//! Built-in tenant custom rule sets.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::strategy::CustomRules;
use crate::models::arx::ApprovalRequestExpression;
use crate::models::tenant::TenantInfo;

static FISCAL_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}$").expect("fiscal year pattern must compile"));

/// No rules beyond the built-in families.
pub struct DefaultRules;

impl CustomRules for DefaultRules {
    fn tag(&self) -> &'static str {
        "default"
    }

    fn check(&self, _arx: &ApprovalRequestExpression, _tenant: &TenantInfo) -> Vec<String> {
        Vec::new()
    }
}

/// Finance tenants must carry a non-negative `Amount` and a four digit
/// fiscal year.
pub struct FinancialRules;

impl FinancialRules {
    fn amount(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl CustomRules for FinancialRules {
    fn tag(&self) -> &'static str {
        "financial"
    }

    fn check(&self, arx: &ApprovalRequestExpression, _tenant: &TenantInfo) -> Vec<String> {
        let mut errors = Vec::new();

        match arx.additional_data.get("Amount") {
            None => errors.push("Amount is required".to_string()),
            Some(value) => match Self::amount(value) {
                Some(amount) if amount.is_finite() && amount >= 0.0 => {}
                Some(amount) if amount.is_finite() => {
                    errors.push("Amount must not be negative".to_string())
                }
                _ => errors.push("Amount must be numeric".to_string()),
            },
        }

        let fiscal_year = arx.approval_identifier.fiscal_year.trim();
        if !FISCAL_YEAR.is_match(fiscal_year) {
            errors.push(format!(
                "FiscalYear '{}' must be a four digit year",
                fiscal_year
            ));
        }

        errors
    }
}
